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

//! Client-facing PCM registrar.
//!
//! The registrar publishes PCM endpoints on whatever IPC surface the daemon
//! exposes to local audio clients. That surface is outside the core; the
//! core only announces endpoint lifecycle and property changes through this
//! trait.

use crate::pcm::PcmHandle;
use bitflags::bitflags;

bitflags! {
    /// Property mask for [`PcmRegistrar::update`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PcmUpdate: u8 {
        const VOLUME = 1 << 0;
        const DELAY = 1 << 1;
    }
}

pub trait PcmRegistrar: Send + Sync {
    fn register(&self, pcm: &PcmHandle);

    /// Remove an endpoint from the client surface. Must tolerate endpoints
    /// which were never registered (zero-channel PCMs are skipped at
    /// registration time but unregistered unconditionally on destroy).
    fn unregister(&self, pcm: &PcmHandle);

    /// Notify connected clients about changed endpoint properties.
    fn update(&self, pcm: &PcmHandle, mask: PcmUpdate);
}
