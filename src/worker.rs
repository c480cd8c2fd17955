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

//! Transport IO worker threads and their control-signal pipe.
//!
//! Every transport carries two worker handles (encoder and decoder). The
//! only synchronization path from the control plane into a worker is the
//! non-blocking signal pipe: one machine word per command, processed by the
//! worker in FIFO order at its next multiplexed wait. Workers terminate
//! cooperatively: cancellation raises the halt flag, wakes the worker with a
//! `Ping` and joins it.

use crate::transport::Transport;
use crate::Error;
use log::warn;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe2;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive as _;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Control commands delivered to an IO worker through its signal pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum Signal {
    /// Idle wake-up, also used to deliver the halt flag.
    Ping = 0,
    PcmOpen,
    PcmClose,
    PcmPause,
    PcmResume,
    /// Drain request; the worker signals the PCM `synced` rendezvous once
    /// all buffered samples have been pushed out.
    PcmSync,
    PcmDrop,
    HfpSetCodecCvsd,
    HfpSetCodecMsbc,
}

/// Which of the two per-transport workers a thread or PCM is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerId {
    Encoder = 0,
    Decoder = 1,
}

/// IO thread body. Receives the transport it serves and its own identity;
/// must call [`WorkerThread::ready`] on its handle once initialized and poll
/// the signal pipe, exiting promptly when the halt flag is raised.
pub type Routine = Box<dyn FnOnce(Arc<Transport>, WorkerId) + Send + 'static>;

/// Supplier of codec IO routines, selected per profile at transport start.
pub trait IoRoutines: Send + Sync {
    /// Thread pair for an A2DP transport: `(encoder, decoder)`.
    fn a2dp(&self, codec_id: u16) -> (Routine, Routine);

    /// The single worker of a SCO transport, driving both directions.
    fn sco(&self) -> Routine;
}

pub(crate) struct WorkerState {
    pub(crate) thread: Option<JoinHandle<()>>,
    pub(crate) running: bool,
    pub(crate) exited: bool,
}

/// Identity and control channel of one IO worker thread.
pub struct WorkerThread {
    pipe_rx: OwnedFd,
    pipe_tx: OwnedFd,
    pub(crate) state: Mutex<WorkerState>,
    pub(crate) ready: Condvar,
    halt: AtomicBool,
}

impl WorkerThread {
    pub(crate) fn new() -> Result<Self, Error> {
        let (pipe_rx, pipe_tx) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(Self {
            pipe_rx,
            pipe_tx,
            state: Mutex::new(WorkerState { thread: None, running: false, exited: false }),
            ready: Condvar::new(),
            halt: AtomicBool::new(false),
        })
    }

    /// Whether a worker thread has been created and not yet cancelled.
    pub fn active(&self) -> bool {
        self.state.lock().unwrap().thread.is_some()
    }

    /// Whether the worker routine has completed its startup.
    pub fn running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Raised by cancellation; the worker routine checks it after every
    /// wake-up and exits its loop when set.
    pub fn halted(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    pub(crate) fn set_halt(&self, halt: bool) {
        self.halt.store(halt, Ordering::SeqCst);
    }

    /// Mark the worker as initialized and wake up the creator.
    pub fn ready(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = true;
        self.ready.notify_all();
    }

    /// Read end of the signal pipe, for inclusion in the worker poll set.
    pub fn signal_fd(&self) -> BorrowedFd<'_> {
        self.pipe_rx.as_fd()
    }

    /// Enqueue a control signal. The pipe is non-blocking; a full pipe is
    /// not an error since the worker has plenty of wake-ups pending already.
    pub fn send_signal(&self, sig: Signal) -> Result<(), Error> {
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

    /// Dequeue the next control signal. Interrupted reads are retried; a
    /// short or failed read degrades to `Ping` so the worker loop can carry
    /// on with a plain wake-up.
    pub fn recv_signal(&self) -> Signal {
        let mut value = [0u8; 4];
        loop {
            let n = unsafe {
                libc::read(self.pipe_rx.as_raw_fd(), value.as_mut_ptr().cast(), value.len())
            };
            if n == value.len() as isize {
                return match Signal::from_i32(i32::from_ne_bytes(value)) {
                    Some(sig) => sig,
                    None => {
                        warn!("Invalid transport thread signal: {}", i32::from_ne_bytes(value));
                        Signal::Ping
                    }
                };
            }
            if n < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            warn!("Couldn't read transport thread signal: {}", std::io::Error::last_os_error());
            return Signal::Ping;
        }
    }

    /// Block until a control signal arrives and return it. Convenience for
    /// workers whose only descriptor of interest is the signal pipe.
    pub fn wait_signal(&self) -> Signal {
        let mut fds = [PollFd::new(self.pipe_rx.as_fd(), PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => return self.recv_signal(),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("Couldn't poll transport thread signal pipe: {}", e);
                    return Signal::Ping;
                }
            }
        }
    }
}
