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

//! PCM endpoints: one direction of sample flow between the daemon and a
//! local audio client.

use crate::audio;
use crate::registrar::PcmUpdate;
use crate::rfcomm::RfcommSignal;
use crate::transport::Transport;
use crate::worker::{Signal, WorkerId};
use crate::Error;
use log::{debug, warn};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Direction of the endpoint, from the daemon's perspective: a `Source`
/// produces samples for a local client, a `Sink` consumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmMode {
    Source,
    Sink,
}

impl PcmMode {
    /// Direction component of the endpoint object path.
    pub fn direction_tag(self) -> &'static str {
        match self {
            PcmMode::Source => "source",
            PcmMode::Sink => "sink",
        }
    }
}

/// Sample encoding of the endpoint stream.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PcmFormat {
    #[default]
    S16_2LE,
    S24_4LE,
    S32_4LE,
}

/// Endpoint selector within a transport. The first listed endpoint of each
/// profile comes first in the canonical locking order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmId {
    A2dpMain,
    A2dpBackchannel,
    ScoSpeaker,
    ScoMicrophone,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelVolume {
    /// Level in centibels, within [-9600, +9600].
    pub level: i16,
    pub muted: bool,
}

/// Mutable endpoint state, guarded by the PCM mutex.
#[derive(Debug, Default)]
pub struct PcmState {
    /// Client stream descriptor; `None` when released.
    pub fd: Option<OwnedFd>,
    pub format: PcmFormat,
    pub channels: u8,
    pub sampling: u32,
    pub volume: [ChannelVolume; 2],
    /// Attenuate in software instead of delegating to the remote device.
    pub soft_volume: bool,
    /// Additional endpoint latency, in 1/10 of a millisecond.
    pub delay: u16,
}

pub struct TransportPcm {
    mode: PcmMode,
    /// The worker thread driving this endpoint.
    worker: WorkerId,
    /// Upper bound of the remote volume scale: 127 for A2DP, 15 for SCO.
    max_bt_volume: u16,
    dbus_path: String,
    pub(crate) state: Mutex<PcmState>,
    /// Drain rendezvous: generation counter bumped by the IO thread each
    /// time a requested drain has completed.
    synced: (Mutex<u64>, Condvar),
}

impl TransportPcm {
    pub(crate) fn new(
        mode: PcmMode,
        worker: WorkerId,
        max_bt_volume: u16,
        soft_volume: bool,
        dbus_path: String,
    ) -> Self {
        Self {
            mode,
            worker,
            max_bt_volume,
            dbus_path,
            state: Mutex::new(PcmState { soft_volume, ..Default::default() }),
            synced: (Mutex::new(0), Condvar::new()),
        }
    }

    pub fn mode(&self) -> PcmMode {
        self.mode
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn max_bt_volume(&self) -> u16 {
        self.max_bt_volume
    }

    pub fn dbus_path(&self) -> &str {
        &self.dbus_path
    }

    /// Translate a level in centibels to the remote volume scale.
    pub fn volume_level_to_bt(&self, level: i16) -> u16 {
        let loudness = audio::decibel_to_loudness(f64::from(level) / 100.0);
        let volume = (loudness * f64::from(self.max_bt_volume)).round() as i64;
        volume.clamp(0, i64::from(self.max_bt_volume)) as u16
    }

    /// Translate a remote volume value back to a level in centibels.
    pub fn volume_bt_to_level(&self, value: u16) -> i16 {
        let level = audio::loudness_to_decibel(f64::from(value) / f64::from(self.max_bt_volume));
        (level.clamp(-audio::DECIBEL_RANGE_MAX, audio::DECIBEL_RANGE_MAX) * 100.0) as i16
    }

    /// Report a completed drain. Called by the IO thread after flushing its
    /// buffers in response to a `PcmSync` signal.
    pub fn signal_synced(&self) {
        let (generation, cvar) = &self.synced;
        *generation.lock().unwrap() += 1;
        cvar.notify_all();
    }

    /// Close the client descriptor. The state guard proves the PCM mutex is
    /// held, which is the closing precondition.
    pub(crate) fn release_locked(state: &mut MutexGuard<'_, PcmState>) {
        if let Some(fd) = state.fd.take() {
            debug!("Closing PCM: {}", fd.as_raw_fd());
        }
    }

    pub(crate) fn free(&self) {
        let mut state = self.state.lock().unwrap();
        Self::release_locked(&mut state);
    }
}

/// Reference to one PCM endpoint of a transport. A PCM has no lifetime of
/// its own: reference operations forward to the owning transport.
#[derive(Clone)]
pub struct PcmHandle {
    transport: Arc<Transport>,
    id: PcmId,
}

impl PcmHandle {
    /// Bind a handle to an endpoint of the transport. Fails with
    /// `InvalidArg` if the endpoint does not belong to the transport's
    /// profile.
    pub fn new(transport: Arc<Transport>, id: PcmId) -> Result<Self, Error> {
        transport.pcm(id)?;
        Ok(Self { transport, id })
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn id(&self) -> PcmId {
        self.id
    }

    pub fn pcm(&self) -> &TransportPcm {
        self.transport.pcm(self.id).expect("endpoint validated at handle creation")
    }

    pub fn dbus_path(&self) -> &str {
        self.pcm().dbus_path()
    }

    /// Take a transport reference on behalf of this PCM.
    pub fn clone_ref(&self) -> Self {
        Self { transport: self.transport.clone_ref(), id: self.id }
    }

    /// Drop a transport reference previously taken through this PCM.
    pub fn unref(self) {
        self.transport.unref();
    }

    /// Attach a client stream and wake up the IO worker.
    pub fn set_client_fd(&self, fd: OwnedFd) {
        debug!("New PCM client: {}", fd.as_raw_fd());
        self.pcm().state.lock().unwrap().fd = Some(fd);
        let _ = self.transport.worker(self.pcm().worker()).send_signal(Signal::PcmOpen);
    }

    /// Detach the client stream and notify the IO worker.
    pub fn close_client(&self) {
        self.release();
        let _ = self.transport.worker(self.pcm().worker()).send_signal(Signal::PcmClose);
    }

    /// Close the client descriptor, leaving the worker untouched.
    pub fn release(&self) {
        let mut state = self.pcm().state.lock().unwrap();
        TransportPcm::release_locked(&mut state);
    }

    pub fn pause(&self) -> Result<(), Error> {
        self.transport.worker(self.pcm().worker()).send_signal(Signal::PcmPause)?;
        debug!("PCM paused: {}", self.dbus_path());
        Ok(())
    }

    pub fn resume(&self) -> Result<(), Error> {
        self.transport.worker(self.pcm().worker()).send_signal(Signal::PcmResume)?;
        debug!("PCM resumed: {}", self.dbus_path());
        Ok(())
    }

    /// Discard samples buffered on the outbound path. The encoder owns the
    /// outbound buffers, so the signal always goes there, regardless of
    /// which worker drives this endpoint.
    pub fn drop_buffered(&self) -> Result<(), Error> {
        self.transport.worker(WorkerId::Encoder).send_signal(Signal::PcmDrop)?;
        debug!("PCM dropped: {}", self.dbus_path());
        Ok(())
    }

    /// Block until the IO worker has drained buffered samples.
    ///
    /// The trailing sleep covers the remote side: the mediator exposes no
    /// drain-complete notification, so the only way to let the device play
    /// out its buffer is to wait an arbitrary time before returning.
    /// TODO: Replace the sleep with an asynchronous transport release once
    /// the release path supports deferred closing.
    pub fn drain(&self) -> Result<(), Error> {
        let pcm = self.pcm();
        let worker = self.transport.worker(pcm.worker());
        if !worker.running() {
            return Err(Error::NoThread);
        }

        let (generation, cvar) = &pcm.synced;
        let mut guard = generation.lock().unwrap();
        let start = *guard;
        worker.send_signal(Signal::PcmSync)?;
        while *guard == start {
            guard = cvar.wait(guard).unwrap();
        }
        drop(guard);

        std::thread::sleep(Duration::from_millis(200));

        debug!("PCM drained: {}", self.dbus_path());
        Ok(())
    }

    pub fn set_volume(&self, volume: [ChannelVolume; 2]) {
        self.pcm().state.lock().unwrap().volume = volume;
    }

    pub fn set_soft_volume(&self, soft_volume: bool) {
        self.pcm().state.lock().unwrap().soft_volume = soft_volume;
    }

    pub fn set_delay(&self, delay: u16) {
        self.pcm().state.lock().unwrap().delay = delay;
    }

    /// Total playback latency of this endpoint, in 1/10 of a millisecond.
    /// Voice links get a small fixed bias for the controller-side buffering.
    pub fn delay(&self) -> u16 {
        let delay = self.pcm().state.lock().unwrap().delay;
        if self.transport.profile().is_a2dp() {
            self.transport.link_delay() + delay
        } else {
            delay + 10
        }
    }

    /// Propagate the current volume to the remote device and to connected
    /// clients.
    ///
    /// When software volume is active on a source-side profile (A2DP source
    /// or a voice gateway), the remote device is deliberately left alone:
    /// attenuating on both ends would scale the signal twice.
    pub fn volume_update(&self) {
        let transport = &self.transport;
        let profile = transport.profile();
        let pcm = self.pcm();

        let (soft_volume, volume) = {
            let state = pcm.state.lock().unwrap();
            (state.soft_volume, state.volume)
        };

        let skip_remote = soft_volume && (profile == crate::transport::Profile::A2dpSource
            || profile.is_gateway());

        if !skip_remote {
            if profile.is_a2dp() {
                let level = if volume[0].muted || volume[1].muted {
                    0
                } else {
                    ((i32::from(volume[0].level) + i32::from(volume[1].level)) / 2) as i16
                };
                let bt = pcm.volume_level_to_bt(level);
                if let Err(e) = transport.context().mediator.set_volume(
                    transport.dbus_owner(),
                    transport.dbus_path(),
                    bt,
                ) {
                    warn!("Couldn't set BT device volume: {}", e);
                }
            } else if let Some(rfcomm) = transport.rfcomm() {
                let _ = rfcomm.send_signal(RfcommSignal::UpdateVolume);
            }
        }

        transport.context().registrar.update(self, PcmUpdate::VOLUME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(max_bt_volume: u16) -> TransportPcm {
        TransportPcm::new(PcmMode::Sink, WorkerId::Encoder, max_bt_volume, false, String::new())
    }

    #[test]
    fn volume_roundtrip_within_one_unit() {
        for max in [127u16, 15] {
            let pcm = pcm(max);
            for bt in 0..=max {
                let level = pcm.volume_bt_to_level(bt);
                let back = pcm.volume_level_to_bt(level);
                assert!(
                    (i32::from(back) - i32::from(bt)).abs() <= 1,
                    "max {}: {} -> {} -> {}",
                    max,
                    bt,
                    level,
                    back
                );
            }
        }
    }

    #[test]
    fn volume_bt_monotonic() {
        let pcm = pcm(127);
        let mut last = pcm.volume_bt_to_level(0);
        for bt in 1..=127 {
            let level = pcm.volume_bt_to_level(bt);
            assert!(level >= last);
            last = level;
        }
    }

    #[test]
    fn volume_extremes() {
        let pcm = pcm(127);
        // a muted (zero) level must round down to remote silence
        assert_eq!(pcm.volume_level_to_bt(0), 0);
        assert_eq!(pcm.volume_level_to_bt(-9600), 0);
        assert_eq!(pcm.volume_level_to_bt(9600), 127);
    }
}
