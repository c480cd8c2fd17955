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

//! Transport core of a Bluetooth audio bridging daemon.
//!
//! The core owns the life cycle of audio transports: remote-side socket
//! acquisition and release, the local PCM endpoints, the IO worker threads
//! moving samples between the two sides, codec configuration, volume
//! translation and the transport state transitions driven by the
//! out-of-process Bluetooth mediator:
//!
//! ```text
//!      mediator | ^          | signals                     clients
//!      methods  | |          | (control pipe)
//!      _________|_|___     __v___________      ______________________
//!     |             : |   |   IO workers |    |   PCM endpoints      |
//!     |  transport  : |   |   enc / dec  |    |                      |
//!     |             :-|---|---.      .---|----|-> fd (source)        |
//!     |  bt_fd <------|---|---'      '---|----|<- fd (sink)          |
//!     |_______________|   |______________|    |______________________|
//! ```
//!
//! Codec DSP, the mediator IPC marshalling, the kernel HCI helpers, the
//! hands-free AT protocol and the client-facing IPC surface are external
//! collaborators, reachable only through the traits collected in
//! [`Context`].

use std::sync::Arc;
use thiserror::Error as ThisError;

pub mod adapter;
pub mod audio;
pub mod codec;
pub mod device;
pub mod hci;
pub mod mediator;
pub mod pcm;
pub mod registrar;
pub mod rfcomm;
pub mod transport;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod tests;

use crate::hci::HciBackend;
use crate::mediator::{Mediator, MediatorError};
use crate::registrar::PcmRegistrar;
use crate::rfcomm::HandsFreeHandler;
use crate::worker::IoRoutines;

/// Process-wide collaborator bundle, shared by every adapter and everything
/// beneath it.
pub struct Context {
    pub mediator: Arc<dyn Mediator>,
    pub hci: Arc<dyn HciBackend>,
    pub registrar: Arc<dyn PcmRegistrar>,
    pub io: Arc<dyn IoRoutines>,
    pub hands_free: Arc<dyn HandsFreeHandler>,
    /// Pass the volume to the remote device natively instead of scaling
    /// samples in software. When disabled, A2DP endpoints default to
    /// software volume.
    pub a2dp_native_volume: bool,
}

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("operation not supported")]
    NotSupported,
    #[error("no running transport thread")]
    NoThread,
    #[error("invalid argument")]
    InvalidArg,
    #[error("input/output error: {0}")]
    Io(String),
    #[error(transparent)]
    Mediator(#[from] MediatorError),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(e.to_string())
    }
}
