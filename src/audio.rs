// Copyright 2025, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Perceptual loudness conversion used by the volume translation code.

/// Upper bound of the usable level range, in decibels. The loudness curve
/// reaches full scale (1.0) exactly at this value, so the whole level range
/// maps into (0, 1] and a muted (zero) level rounds down to silence.
pub const DECIBEL_RANGE_MAX: f64 = 96.0;

/// Convert a decibel value to a loudness fraction of full scale.
///
/// The curve doubles perceived loudness every 10 dB, which is a reasonable
/// approximation of human hearing for the volume-knob use case.
pub fn decibel_to_loudness(value: f64) -> f64 {
    (2.0f64).powf((value - DECIBEL_RANGE_MAX) / 10.0)
}

/// Inverse of [`decibel_to_loudness`].
pub fn loudness_to_decibel(value: f64) -> f64 {
    DECIBEL_RANGE_MAX + 10.0 * value.log2()
}
