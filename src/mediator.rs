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

//! Interface towards the out-of-process Bluetooth mediator service.
//!
//! The mediator discovers devices, negotiates codec capabilities and hands
//! transport descriptors to this daemon. The IPC marshalling lives outside
//! the core; the core only calls the methods below on the object paths it
//! was given at transport creation.

use crate::codec::A2dpSep;
use std::os::fd::OwnedFd;
use thiserror::Error;

/// Reply of a successful `Acquire` / `TryAcquire` call.
#[derive(Debug)]
pub struct AcquiredTransport {
    pub fd: OwnedFd,
    pub mtu_read: u16,
    pub mtu_write: u16,
}

#[derive(Debug, Error)]
pub enum MediatorError {
    #[error("no reply from mediator")]
    NoReply,
    #[error("mediator service unknown")]
    ServiceUnknown,
    #[error("unknown mediator object")]
    UnknownObject,
    #[error("mediator call failed: {0}")]
    Failed(String),
}

impl MediatorError {
    /// Errors which are expected during release when the mediator is going
    /// away or has already removed the transport object. Callers absorb
    /// these silently.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::NoReply | Self::ServiceUnknown | Self::UnknownObject)
    }
}

pub trait Mediator: Send + Sync {
    /// Acquire the transport socket. With `try_only` the non-blocking
    /// `TryAcquire` variant is issued, used while the transport is still
    /// pending on the remote side.
    fn acquire(
        &self,
        owner: &str,
        path: &str,
        try_only: bool,
    ) -> Result<AcquiredTransport, MediatorError>;

    fn release(&self, owner: &str, path: &str) -> Result<(), MediatorError>;

    /// Request a codec reconfiguration on a remote stream end-point. The
    /// resulting transport change is delivered later through the mediator
    /// callback machinery.
    fn set_configuration(&self, sep_path: &str, sep: &A2dpSep) -> Result<(), MediatorError>;

    /// Set the `Volume` property (unsigned 16-bit) of a transport object.
    fn set_volume(&self, owner: &str, path: &str, volume: u16) -> Result<(), MediatorError>;
}
