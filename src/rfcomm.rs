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

//! RFCOMM session attached to a voice transport.
//!
//! The session carries the hands-free AT exchange on its own thread. The AT
//! protocol itself is not implemented here; a [`HandsFreeHandler`] delegate
//! receives the control signals and is expected to report codec-selection
//! outcomes back through [`RfcommSession::complete_codec_selection`], which
//! is the rendezvous the transport codec switch blocks on.

use crate::transport::Transport;
use crate::Error;
use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe2;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive as _;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::thread::JoinHandle;

/// Control commands delivered to the RFCOMM session thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum RfcommSignal {
    /// Idle wake-up, also used to deliver the halt flag.
    Ping = 0,
    UpdateVolume,
    HfpSetCodecCvsd,
    HfpSetCodecMsbc,
}

/// The AT command layer serving one RFCOMM link. Out of core scope; the
/// session forwards every non-`Ping` signal here.
pub trait HandsFreeHandler: Send + Sync {
    fn handle_signal(&self, session: &Arc<RfcommSession>, sig: RfcommSignal);
}

pub struct RfcommSession {
    transport: Weak<Transport>,
    /// The RFCOMM socket carrying the AT exchange. Owned here so it lives
    /// exactly as long as the session.
    fd: OwnedFd,
    pipe_rx: OwnedFd,
    pipe_tx: OwnedFd,
    thread: Mutex<Option<JoinHandle<()>>>,
    halt: AtomicBool,
    /// Codec-selection rendezvous: generation counter bumped on every
    /// completed selection attempt, successful or not.
    selection: (Mutex<u64>, Condvar),
}

impl RfcommSession {
    pub fn new(
        transport: &Arc<Transport>,
        fd: OwnedFd,
        handler: Arc<dyn HandsFreeHandler>,
    ) -> Result<Arc<Self>, Error> {
        let (pipe_rx, pipe_tx) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        let session = Arc::new(Self {
            transport: Arc::downgrade(transport),
            fd,
            pipe_rx,
            pipe_tx,
            thread: Mutex::new(None),
            halt: AtomicBool::new(false),
            selection: (Mutex::new(0), Condvar::new()),
        });

        let thread = {
            let session = session.clone();
            thread::Builder::new()
                .name("rfcomm".into())
                .spawn(move || Self::thread_loop(session, handler))?
        };
        *session.thread.lock().unwrap() = Some(thread);

        Ok(session)
    }

    fn thread_loop(session: Arc<Self>, handler: Arc<dyn HandsFreeHandler>) {
        loop {
            let mut fds = [PollFd::new(session.pipe_rx.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => (),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("Couldn't poll RFCOMM signal pipe: {}", e);
                    break;
                }
            }
            if session.halt.load(Ordering::SeqCst) {
                break;
            }
            match session.recv_signal() {
                RfcommSignal::Ping => (),
                sig => handler.handle_signal(&session, sig),
            }
        }
        debug!("Exiting RFCOMM thread: {}", session.fd.as_raw_fd());
    }

    pub fn transport(&self) -> Option<Arc<Transport>> {
        self.transport.upgrade()
    }

    /// Enqueue a signal for the session thread.
    pub fn send_signal(&self, sig: RfcommSignal) -> Result<(), Error> {
        let value = (sig as i32).to_ne_bytes();
        loop {
            let n = unsafe {
                libc::write(self.pipe_tx.as_raw_fd(), value.as_ptr().cast(), value.len())
            };
            if n >= 0 {
                return Ok(());
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(()),
                _ => return Err(std::io::Error::last_os_error().into()),
            }
        }
    }

    fn recv_signal(&self) -> RfcommSignal {
        let mut value = [0u8; 4];
        loop {
            let n = unsafe {
                libc::read(self.pipe_rx.as_raw_fd(), value.as_mut_ptr().cast(), value.len())
            };
            if n == value.len() as isize {
                return RfcommSignal::from_i32(i32::from_ne_bytes(value))
                    .unwrap_or(RfcommSignal::Ping);
            }
            if n < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            warn!("Couldn't read RFCOMM signal: {}", std::io::Error::last_os_error());
            return RfcommSignal::Ping;
        }
    }

    /// Begin waiting for a codec-selection outcome. Returns the lock guard
    /// which the caller holds while releasing the transport, and the
    /// generation to pass to [`Self::wait_codec_selection`].
    pub(crate) fn codec_selection_begin(&self) -> (std::sync::MutexGuard<'_, u64>, u64) {
        let guard = self.selection.0.lock().unwrap();
        let generation = *guard;
        (guard, generation)
    }

    /// Block until the AT layer reports a selection attempt as finished.
    pub(crate) fn wait_codec_selection(
        &self,
        mut guard: std::sync::MutexGuard<'_, u64>,
        generation: u64,
    ) {
        while *guard == generation {
            guard = self.selection.1.wait(guard).unwrap();
        }
    }

    /// Report a finished codec-selection attempt. The transport codec is
    /// set to whatever the negotiation actually produced before the waiter
    /// is woken, so the waiter can verify the outcome.
    pub fn complete_codec_selection(&self, codec_id: u16) {
        if let Some(transport) = self.transport.upgrade() {
            transport.set_codec(codec_id);
        }
        let (generation, cvar) = &self.selection;
        *generation.lock().unwrap() += 1;
        cvar.notify_all();
    }

    /// Synchronous session shutdown: halt and join the AT thread. Safe to
    /// call more than once, and from the session thread itself.
    pub fn destroy(&self) {
        let Some(thread) = self.thread.lock().unwrap().take() else {
            return;
        };
        self.halt.store(true, Ordering::SeqCst);
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        let _ = self.send_signal(RfcommSignal::Ping);
        if thread.join().is_err() {
            warn!("Couldn't join RFCOMM thread");
        }
    }
}

impl Drop for RfcommSession {
    fn drop(&mut self) {
        self.destroy();
    }
}
