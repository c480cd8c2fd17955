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

//! Kernel HCI socket helpers, as seen by the transport core.

use crate::adapter::Address;
use crate::Error;
use std::os::fd::{BorrowedFd, OwnedFd};

/// Voice setting applied when connecting a SCO socket. The transparent mode
/// is required for codecs other than CVSD, where the air codec runs on the
/// host instead of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum VoiceSetting {
    Cvsd16Bit = 0x0060,
    Transparent = 0x0003,
}

pub trait HciBackend: Send + Sync {
    /// Open a raw SCO socket on the given controller.
    fn sco_open(&self, dev_id: u16) -> Result<OwnedFd, Error>;

    /// Connect a SCO socket to a remote device.
    fn sco_connect(
        &self,
        fd: BorrowedFd<'_>,
        address: &Address,
        voice: VoiceSetting,
    ) -> Result<(), Error>;

    /// Kernel-reported MTU of a connected SCO socket.
    fn sco_mtu(&self, fd: BorrowedFd<'_>) -> Result<u16, Error>;
}
