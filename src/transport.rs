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

//! Audio transport: the object representing one active or potentially
//! active audio link between a remote peer and the local PCM endpoints.
//!
//! A transport is reachable from its device map exactly as long as its
//! reference count is positive. The count is guarded by the device
//! transports mutex; the last `unref` steals the map entry under that mutex
//! and only then tears the subsidiary resources down, so a concurrent
//! lookup can never resurrect a dying transport.

use crate::codec::{self, A2dpCodec, A2dpSep};
use crate::device::Device;
use crate::hci::VoiceSetting;
use crate::pcm::{PcmFormat, PcmHandle, PcmId, PcmMode, PcmState, TransportPcm};
use crate::rfcomm::{RfcommSession, RfcommSignal};
use crate::worker::{Routine, Signal, WorkerId, WorkerThread};
use crate::{Context, Error};
use log::{debug, error, warn};
use nix::sys::socket::{setsockopt, sockopt};
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;

nix::ioctl_read_bad!(ioctl_outq, libc::TIOCOUTQ, libc::c_int);

/// Profile of an audio transport. A2DP transports stream compressed audio
/// over L2CAP in one direction; the voice profiles run a bidirectional SCO
/// link, with HFP adding codec negotiation over RFCOMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    A2dpSource,
    A2dpSink,
    HfpHf,
    HfpAg,
    HspHs,
    HspAg,
}

impl Profile {
    pub fn is_a2dp(self) -> bool {
        matches!(self, Profile::A2dpSource | Profile::A2dpSink)
    }

    pub fn is_sco(self) -> bool {
        !self.is_a2dp()
    }

    pub fn is_hsp(self) -> bool {
        matches!(self, Profile::HspHs | Profile::HspAg)
    }

    /// Audio-gateway side of a voice profile.
    pub fn is_gateway(self) -> bool {
        matches!(self, Profile::HfpAg | Profile::HspAg)
    }

    /// Profile component of the endpoint object path. This tag set is part
    /// of the external interface and must stay as is.
    pub fn tag(self) -> &'static str {
        match self {
            Profile::A2dpSource => "a2dpsrc",
            Profile::A2dpSink => "a2dpsnk",
            Profile::HfpHf => "hfphf",
            Profile::HfpAg => "hfpag",
            Profile::HspHs => "hsphs",
            Profile::HspAg => "hspag",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Profile::A2dpSource => "A2DP Source",
            Profile::A2dpSink => "A2DP Sink",
            Profile::HfpHf => "HFP Hands-Free",
            Profile::HfpAg => "HFP Audio Gateway",
            Profile::HspHs => "HSP Headset",
            Profile::HspAg => "HSP Audio Gateway",
        }
    }
}

/// Remote-side state of an A2DP transport, driven by the mediator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum A2dpState {
    Idle,
    Pending,
    Active,
}

/// The remote-side socket with its negotiated MTUs.
struct BtLink {
    fd: Option<OwnedFd>,
    mtu_read: u16,
    mtu_write: u16,
}

struct A2dpData {
    codec: &'static A2dpCodec,
    /// Codec configuration blob negotiated by the mediator, sized by
    /// `codec.capabilities_size`.
    configuration: Vec<u8>,
    state: Mutex<A2dpState>,
    pcm: TransportPcm,
    pcm_bc: TransportPcm,
    /// Output-queue depth of the freshly acquired socket, the baseline for
    /// delay reporting.
    coutq_init: AtomicI32,
    /// Playback delay reported by the remote device, in 1/10 ms.
    delay: AtomicU16,
}

struct ScoData {
    spk_pcm: TransportPcm,
    mic_pcm: TransportPcm,
    rfcomm: Mutex<Option<Arc<RfcommSession>>>,
}

enum ProfileData {
    A2dp(A2dpData),
    Sco(ScoData),
}

/// Proof of holding both PCM mutexes of a transport, acquired in the
/// canonical order: forward before back-channel, speaker before microphone.
pub struct PcmsGuard<'a> {
    pub(crate) first: MutexGuard<'a, PcmState>,
    pub(crate) second: MutexGuard<'a, PcmState>,
}

pub struct Transport {
    /// Self-reference for handing out additional strong references.
    weak: Weak<Transport>,
    device: Arc<Device>,
    profile: Profile,
    codec_id: AtomicU16,
    /// Serializes codec switching. Held across the whole voice handshake,
    /// while readers observe the codec through the atomic above.
    codec_switch_mtx: Mutex<()>,
    dbus_owner: String,
    dbus_path: String,
    bt: Mutex<BtLink>,
    ref_count: AtomicUsize,
    threads: [WorkerThread; 2],
    data: ProfileData,
}

impl Transport {
    fn new(
        device: &Arc<Device>,
        profile: Profile,
        codec_id: u16,
        dbus_owner: &str,
        dbus_path: &str,
        data: ProfileData,
    ) -> Result<Arc<Self>, Error> {
        let threads = [WorkerThread::new()?, WorkerThread::new()?];
        let transport = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            device: device.clone(),
            profile,
            codec_id: AtomicU16::new(codec_id),
            codec_switch_mtx: Mutex::new(()),
            dbus_owner: dbus_owner.to_string(),
            dbus_path: dbus_path.to_string(),
            bt: Mutex::new(BtLink { fd: None, mtu_read: 0, mtu_write: 0 }),
            ref_count: AtomicUsize::new(1),
            threads,
            data,
        });
        let mut transports = device.transports.lock().unwrap();
        transports.insert(dbus_path.to_string(), transport.clone());
        drop(transports);
        Ok(transport)
    }

    /// Create a new A2DP transport and index it in the device map with a
    /// single reference held on behalf of the mediator binding.
    pub fn new_a2dp(
        device: &Arc<Device>,
        profile: Profile,
        dbus_owner: &str,
        dbus_path: &str,
        codec: &'static A2dpCodec,
        configuration: &[u8],
    ) -> Result<Arc<Self>, Error> {
        if !profile.is_a2dp() {
            return Err(Error::InvalidArg);
        }
        if configuration.len() < codec.capabilities_size {
            return Err(Error::InvalidArg);
        }

        let ctx = device.adapter().context().clone();
        let is_sink = profile == Profile::A2dpSink;
        let soft_volume = !ctx.a2dp_native_volume;
        let base = device.dbus_path();

        // The forward stream is decoded towards the client in the sink role
        // and encoded towards the remote device in the source role; the
        // back-channel stream runs the other way on the other worker.
        let mode = if is_sink { PcmMode::Source } else { PcmMode::Sink };
        let pcm = TransportPcm::new(
            mode,
            if is_sink { WorkerId::Decoder } else { WorkerId::Encoder },
            127,
            soft_volume,
            format!("{}/{}/{}", base, profile.tag(), mode.direction_tag()),
        );
        let mode = if is_sink { PcmMode::Sink } else { PcmMode::Source };
        let pcm_bc = TransportPcm::new(
            mode,
            if is_sink { WorkerId::Encoder } else { WorkerId::Decoder },
            127,
            soft_volume,
            format!("{}/{}/{}", base, profile.tag(), mode.direction_tag()),
        );

        let data = ProfileData::A2dp(A2dpData {
            codec,
            configuration: configuration[..codec.capabilities_size].to_vec(),
            state: Mutex::new(A2dpState::Idle),
            pcm,
            pcm_bc,
            coutq_init: AtomicI32::new(0),
            delay: AtomicU16::new(0),
        });
        let transport = Self::new(device, profile, codec.codec_id, dbus_owner, dbus_path, data)?;
        transport.set_codec(codec.codec_id);

        // publish only the endpoints with a configured direction
        for id in transport.pcm_ids() {
            let handle = PcmHandle::new(transport.clone(), id)?;
            if handle.pcm().state.lock().unwrap().channels > 0 {
                ctx.registrar.register(&handle);
            }
        }

        Ok(transport)
    }

    /// Create a new SCO transport. With an RFCOMM descriptor at hand the
    /// associated AT session is spawned as well.
    pub fn new_sco(
        device: &Arc<Device>,
        profile: Profile,
        dbus_owner: &str,
        dbus_path: &str,
        codec_id: u16,
        rfcomm_fd: Option<OwnedFd>,
    ) -> Result<Arc<Self>, Error> {
        if !profile.is_sco() {
            return Err(Error::InvalidArg);
        }

        let ctx = device.adapter().context().clone();
        let base = device.dbus_path();

        // HSP supports CVSD only, and so do adapters without eSCO links
        let mut codec_id = codec_id;
        if profile.is_hsp() || !device.adapter().esco_supported {
            codec_id = codec::HFP_CODEC_CVSD;
        }

        let spk_pcm = TransportPcm::new(
            PcmMode::Sink,
            WorkerId::Encoder,
            15,
            false,
            format!("{}/{}/{}", base, profile.tag(), PcmMode::Sink.direction_tag()),
        );
        // TODO: Bind the microphone to the decoder thread once the SCO
        // worker is split per direction.
        let mic_pcm = TransportPcm::new(
            PcmMode::Source,
            WorkerId::Encoder,
            15,
            false,
            format!("{}/{}/{}", base, profile.tag(), PcmMode::Source.direction_tag()),
        );

        let data = ProfileData::Sco(ScoData {
            spk_pcm,
            mic_pcm,
            rfcomm: Mutex::new(None),
        });
        let transport = Self::new(device, profile, codec_id, dbus_owner, dbus_path, data)?;

        if let Some(fd) = rfcomm_fd {
            match RfcommSession::new(&transport, fd, ctx.hands_free.clone()) {
                Ok(session) => {
                    let ProfileData::Sco(sco) = &transport.data else { unreachable!() };
                    *sco.rfcomm.lock().unwrap() = Some(session);
                }
                Err(e) => {
                    transport.unref();
                    return Err(e);
                }
            }
        }

        transport.set_codec(codec_id);

        for id in transport.pcm_ids() {
            let handle = PcmHandle::new(transport.clone(), id)?;
            ctx.registrar.register(&handle);
        }

        Ok(transport)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn codec_id(&self) -> u16 {
        self.codec_id.load(Ordering::SeqCst)
    }

    pub fn dbus_owner(&self) -> &str {
        &self.dbus_owner
    }

    pub fn dbus_path(&self) -> &str {
        &self.dbus_path
    }

    pub fn context(&self) -> &Arc<Context> {
        self.device.adapter().context()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub(crate) fn ref_count_raw(&self) -> &AtomicUsize {
        &self.ref_count
    }

    /// Remote-side socket descriptor, if currently acquired.
    pub fn bt_fd(&self) -> Option<RawFd> {
        self.bt.lock().unwrap().fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Negotiated `(read, write)` MTUs of the remote-side socket.
    pub fn mtu(&self) -> (u16, u16) {
        let bt = self.bt.lock().unwrap();
        (bt.mtu_read, bt.mtu_write)
    }

    pub fn worker(&self, id: WorkerId) -> &WorkerThread {
        &self.threads[id as usize]
    }

    fn a2dp(&self) -> Option<&A2dpData> {
        match &self.data {
            ProfileData::A2dp(a2dp) => Some(a2dp),
            ProfileData::Sco(_) => None,
        }
    }

    pub fn a2dp_state(&self) -> Option<A2dpState> {
        self.a2dp().map(|a2dp| *a2dp.state.lock().unwrap())
    }

    /// Playback delay of the A2DP link, in 1/10 ms; zero for voice links.
    pub fn link_delay(&self) -> u16 {
        self.a2dp().map_or(0, |a2dp| a2dp.delay.load(Ordering::SeqCst))
    }

    pub fn set_link_delay(&self, delay: u16) {
        if let Some(a2dp) = self.a2dp() {
            a2dp.delay.store(delay, Ordering::SeqCst);
        }
    }

    /// Output-queue depth captured right after A2DP acquisition. The
    /// encoder subtracts it from later queue readings when estimating the
    /// in-flight link delay.
    pub fn a2dp_coutq_init(&self) -> i32 {
        self.a2dp().map_or(0, |a2dp| a2dp.coutq_init.load(Ordering::SeqCst))
    }

    pub(crate) fn rfcomm(&self) -> Option<Arc<RfcommSession>> {
        match &self.data {
            ProfileData::Sco(sco) => sco.rfcomm.lock().unwrap().clone(),
            ProfileData::A2dp(_) => None,
        }
    }

    pub fn pcm(&self, id: PcmId) -> Result<&TransportPcm, Error> {
        match (&self.data, id) {
            (ProfileData::A2dp(a2dp), PcmId::A2dpMain) => Ok(&a2dp.pcm),
            (ProfileData::A2dp(a2dp), PcmId::A2dpBackchannel) => Ok(&a2dp.pcm_bc),
            (ProfileData::Sco(sco), PcmId::ScoSpeaker) => Ok(&sco.spk_pcm),
            (ProfileData::Sco(sco), PcmId::ScoMicrophone) => Ok(&sco.mic_pcm),
            _ => Err(Error::InvalidArg),
        }
    }

    /// Endpoint selectors of this transport, in the canonical order.
    pub fn pcm_ids(&self) -> [PcmId; 2] {
        match &self.data {
            ProfileData::A2dp(_) => [PcmId::A2dpMain, PcmId::A2dpBackchannel],
            ProfileData::Sco(_) => [PcmId::ScoSpeaker, PcmId::ScoMicrophone],
        }
    }

    fn pcms(&self) -> (&TransportPcm, &TransportPcm) {
        match &self.data {
            ProfileData::A2dp(a2dp) => (&a2dp.pcm, &a2dp.pcm_bc),
            ProfileData::Sco(sco) => (&sco.spk_pcm, &sco.mic_pcm),
        }
    }

    /// Acquire both PCM mutexes in the canonical order. This is the only
    /// sanctioned way of locking the pair.
    pub fn pcms_lock(&self) -> PcmsGuard<'_> {
        let (first, second) = self.pcms();
        PcmsGuard {
            first: first.state.lock().unwrap(),
            second: second.state.lock().unwrap(),
        }
    }

    /// Strong reference to this transport, backing the manual count.
    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("transport is alive while referenced")
    }

    /// Take an additional reference. The returned clone participates in the
    /// manual count and must be dropped through [`Self::unref`].
    pub fn clone_ref(&self) -> Arc<Self> {
        let _transports = self.device.transports.lock().unwrap();
        self.ref_count.fetch_add(1, Ordering::SeqCst);
        self.arc()
    }

    /// Drop one reference. The last reference steals the transport out of
    /// the device map and tears down the subsidiary resources.
    pub fn unref(&self) {
        let mut transports = self.device.transports.lock().unwrap();
        let ref_count = self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if ref_count > 0 {
            return;
        }
        transports.remove(&self.dbus_path);
        drop(transports);

        debug!("Freeing transport: {}", self);

        if let Some(fd) = self.bt.lock().unwrap().fd.take() {
            debug!("Closing BT: {}", fd.as_raw_fd());
        }
        match &self.data {
            ProfileData::A2dp(a2dp) => {
                a2dp.pcm.free();
                a2dp.pcm_bc.free();
            }
            ProfileData::Sco(sco) => {
                if let Some(rfcomm) = sco.rfcomm.lock().unwrap().take() {
                    rfcomm.destroy();
                }
                sco.spk_pcm.free();
                sco.mic_pcm.free();
            }
        }
    }

    /// Orderly tear-down from the mediator side: unpublish the endpoints,
    /// stop the AT session and the IO workers, close every descriptor and
    /// drop the mediator-binding reference.
    pub fn destroy(&self) {
        let ctx = self.context().clone();

        // Remove the client-visible endpoints first, so no new client
        // operation can bind to this transport during the tear-down.
        for id in self.pcm_ids() {
            if let Ok(handle) = PcmHandle::new(self.arc(), id) {
                ctx.registrar.unregister(&handle);
            }
        }

        if let ProfileData::Sco(sco) = &self.data {
            if let Some(rfcomm) = sco.rfcomm.lock().unwrap().take() {
                rfcomm.destroy();
            }
        }

        // The IO threads have to be stopped before the descriptors are
        // closed, otherwise a worker could race against a closed and
        // already reused file descriptor.
        self.thread_cancel(WorkerId::Encoder);
        self.thread_cancel(WorkerId::Decoder);

        {
            let mut pcms = self.pcms_lock();
            TransportPcm::release_locked(&mut pcms.first);
            TransportPcm::release_locked(&mut pcms.second);
            let _ = self.release(&mut pcms);
        }

        self.unref();
    }

    /// Acquire the remote-side socket. An already acquired transport is
    /// reused (keep-alive), so repeated acquires are cheap.
    pub fn acquire(&self) -> Result<RawFd, Error> {
        match &self.data {
            ProfileData::A2dp(a2dp) => self.acquire_a2dp(a2dp),
            ProfileData::Sco(_) => self.acquire_sco(),
        }
    }

    /// Release the remote-side socket. Idempotent. The guard parameter
    /// proves the caller holds both PCM mutexes, which is the releasing
    /// precondition.
    pub fn release(&self, _pcms: &mut PcmsGuard<'_>) -> Result<(), Error> {
        match &self.data {
            ProfileData::A2dp(a2dp) => self.release_a2dp(a2dp),
            ProfileData::Sco(_) => self.release_sco(),
        }
    }

    fn acquire_a2dp(&self, a2dp: &A2dpData) -> Result<RawFd, Error> {
        let ctx = self.context();
        let mut bt = self.bt.lock().unwrap();

        // keep-alive mode: the transport might be acquired already
        if let Some(fd) = &bt.fd {
            let fd = fd.as_raw_fd();
            debug!("Reusing transport: {}", fd);
            return Ok(fd);
        }

        let try_only = *a2dp.state.lock().unwrap() == A2dpState::Pending;
        let acquired = ctx
            .mediator
            .acquire(&self.dbus_owner, &self.dbus_path, try_only)
            .map_err(|e| {
                error!("Couldn't acquire transport: {}", e);
                Error::from(e)
            })?;

        let fd = acquired.fd.as_raw_fd();
        bt.mtu_read = acquired.mtu_read;
        bt.mtu_write = acquired.mtu_write;

        // Minimize the audio delay and increase responsiveness (seeking,
        // stopping) by shrinking the socket output buffer. A tripled write
        // MTU is used, so a temporary heavy load will not cause tearing.
        let size = usize::from(acquired.mtu_write) * 3;
        if let Err(e) = setsockopt(&acquired.fd, sockopt::SndBuf, &size) {
            warn!("Couldn't set socket output buffer size: {}", e);
        }

        let mut queued: libc::c_int = 0;
        match unsafe { ioctl_outq(fd, &mut queued) } {
            Ok(_) => a2dp.coutq_init.store(queued, Ordering::SeqCst),
            Err(e) => warn!("Couldn't get socket queued bytes: {}", e),
        }

        debug!("New transport: {} (MTU: R:{} W:{})", fd, bt.mtu_read, bt.mtu_write);
        bt.fd = Some(acquired.fd);
        Ok(fd)
    }

    fn release_a2dp(&self, a2dp: &A2dpData) -> Result<(), Error> {
        let ctx = self.context();
        let mut bt = self.bt.lock().unwrap();

        // Nothing to do if the transport was not acquired or was released
        // already; releasing a closed transport would only produce an error
        // reply from the mediator.
        if bt.fd.is_none() {
            return Ok(());
        }

        // When idle, the remote side has dropped the transport on its own;
        // an explicit release request would be rejected.
        if *a2dp.state.lock().unwrap() != A2dpState::Idle {
            debug!("Releasing A2DP transport: {}", self);
            match ctx.mediator.release(&self.dbus_owner, &self.dbus_path) {
                Ok(()) => (),
                // the mediator or the transport object is gone already
                Err(e) if e.is_benign() => (),
                Err(e) => {
                    error!("Couldn't release transport: {}", e);
                    return Err(e.into());
                }
            }
        }

        let fd = bt.fd.take().unwrap();
        debug!("Closing BT: {}", fd.as_raw_fd());
        Ok(())
    }

    fn acquire_sco(&self) -> Result<RawFd, Error> {
        let ctx = self.context();
        let device = &self.device;
        let mut bt = self.bt.lock().unwrap();

        if let Some(fd) = &bt.fd {
            let fd = fd.as_raw_fd();
            debug!("Reusing SCO: {}", fd);
            return Ok(fd);
        }

        let fd = ctx.hci.sco_open(device.adapter().dev_id).map_err(|e| {
            error!("Couldn't open SCO socket: {}", e);
            e
        })?;

        let voice = match self.codec_id() {
            codec::HFP_CODEC_CVSD => VoiceSetting::Cvsd16Bit,
            _ => VoiceSetting::Transparent,
        };
        if let Err(e) = ctx.hci.sco_connect(fd.as_fd(), &device.address, voice) {
            error!("Couldn't establish SCO link: {}", e);
            return Err(e);
        }

        let raw = fd.as_raw_fd();
        debug!("New SCO link: {}: {}", device.address, raw);

        let mtu = ctx.hci.sco_mtu(fd.as_fd())?;
        bt.mtu_read = mtu;
        bt.mtu_write = mtu;
        bt.fd = Some(fd);
        Ok(raw)
    }

    fn release_sco(&self) -> Result<(), Error> {
        let mut bt = self.bt.lock().unwrap();
        let Some(fd) = bt.fd.take() else {
            return Ok(());
        };
        debug!("Closing SCO: {}", fd.as_raw_fd());
        unsafe { libc::shutdown(fd.as_raw_fd(), libc::SHUT_RDWR) };
        Ok(())
    }

    /// Apply a mediator-driven A2DP state transition and its side effects
    /// on acquisition and the IO workers.
    pub fn set_a2dp_state(&self, state: A2dpState) -> Result<(), Error> {
        let Some(a2dp) = self.a2dp() else {
            return Err(Error::NotSupported);
        };
        *a2dp.state.lock().unwrap() = state;
        match state {
            A2dpState::Pending => {
                // Try to acquire the pending transport, but only in the
                // sink role. In the source role the transport is acquired
                // when a client opens the PCM.
                if self.profile == Profile::A2dpSink {
                    self.acquire()?;
                }
                Ok(())
            }
            A2dpState::Active => self.start(),
            A2dpState::Idle => {
                self.stop();
                Ok(())
            }
        }
    }

    /// Set the transport codec and derive the PCM stream parameters from
    /// the current codec configuration.
    pub fn set_codec(&self, codec_id: u16) {
        self.codec_id.store(codec_id, Ordering::SeqCst);
        match &self.data {
            ProfileData::A2dp(a2dp) => Self::set_codec_a2dp(a2dp, codec_id),
            ProfileData::Sco(sco) => Self::set_codec_sco(sco, codec_id),
        }
    }

    fn set_codec_a2dp(a2dp: &A2dpData, codec_id: u16) {
        let format = match codec_id {
            codec::A2DP_CODEC_VENDOR_APTX_HD => PcmFormat::S24_4LE,
            // the LDAC library uses 31-bit integers internally, so the
            // widest integer sample format is the natural match
            codec::A2DP_CODEC_VENDOR_LDAC => PcmFormat::S32_4LE,
            _ => PcmFormat::S16_2LE,
        };
        let decoded = codec::decode_configuration(a2dp.codec, &a2dp.configuration);
        let mut state = a2dp.pcm.state.lock().unwrap();
        state.format = format;
        state.channels = decoded.main.channels;
        state.sampling = decoded.main.sampling;
        drop(state);
        let mut state = a2dp.pcm_bc.state.lock().unwrap();
        state.format = format;
        state.channels = decoded.backchannel.channels;
        state.sampling = decoded.backchannel.sampling;
    }

    fn set_codec_sco(sco: &ScoData, codec_id: u16) {
        let sampling = match codec_id {
            codec::HFP_CODEC_CVSD => 8000,
            codec::HFP_CODEC_MSBC => 16000,
            codec::HFP_CODEC_UNDEFINED => 0,
            other => {
                debug!("Unsupported SCO codec: {:#x}", other);
                0
            }
        };
        for pcm in [&sco.spk_pcm, &sco.mic_pcm] {
            let mut state = pcm.state.lock().unwrap();
            state.format = PcmFormat::S16_2LE;
            state.channels = 1;
            state.sampling = sampling;
        }
    }

    /// Request an A2DP codec change on a remote stream end-point. The
    /// resulting transport change arrives later via the mediator.
    pub fn select_codec_a2dp(&self, sep: &A2dpSep) -> Result<(), Error> {
        let Some(a2dp) = self.a2dp() else {
            return Err(Error::NotSupported);
        };

        // selecting a new codec will change the transport type
        let _switch = self.codec_switch_mtx.lock().unwrap();

        // the same codec with the same configuration is selected already
        if self.codec_id() == sep.codec_id && a2dp.configuration == sep.configuration {
            return Ok(());
        }

        self.context().mediator.set_configuration(&sep.dbus_sep_path, sep).map_err(|e| {
            error!("Couldn't set A2DP configuration: {}", e);
            Error::Io(e.to_string())
        })?;
        Ok(())
    }

    /// Renegotiate the codec of an HFP voice link over its RFCOMM channel.
    ///
    /// The ordering is the delicate part: under the completion mutex, both
    /// PCMs and the transport socket are released before the request is
    /// sent, so no IO thread can observe a mid-switch socket and the
    /// renegotiated link cannot race a second acquire.
    pub fn select_codec_sco(&self, codec_id: u16) -> Result<(), Error> {
        match self.profile {
            Profile::HfpHf | Profile::HfpAg => (),
            // HSP knows CVSD only
            _ => return Err(Error::NotSupported),
        }

        // with no RFCOMM at hand there is no way to renegotiate
        let Some(rfcomm) = self.rfcomm() else {
            return Err(Error::NotSupported);
        };

        let _switch = self.codec_switch_mtx.lock().unwrap();

        // the codec is selected already, skip the switching
        if self.codec_id() == codec_id {
            return Ok(());
        }

        let (selection, generation) = rfcomm.codec_selection_begin();

        {
            let mut pcms = self.pcms_lock();
            TransportPcm::release_locked(&mut pcms.first);
            TransportPcm::release_locked(&mut pcms.second);
            let _ = self.release(&mut pcms);
        }

        let sig = match codec_id {
            codec::HFP_CODEC_CVSD => Some(RfcommSignal::HfpSetCodecCvsd),
            codec::HFP_CODEC_MSBC => Some(RfcommSignal::HfpSetCodecMsbc),
            _ => None,
        };
        match sig {
            Some(sig) => {
                rfcomm.send_signal(sig)?;
                rfcomm.wait_codec_selection(selection, generation);
            }
            None => drop(selection),
        }

        if self.codec_id() != codec_id {
            return Err(Error::Io("codec selection handshake failed".into()));
        }
        Ok(())
    }

    /// Start the IO workers required by the profile. A transport with any
    /// worker already running is left alone.
    pub fn start(&self) -> Result<(), Error> {
        if self.worker(WorkerId::Encoder).active() || self.worker(WorkerId::Decoder).active() {
            return Ok(());
        }

        debug!("Starting transport: {}", self);

        match &self.data {
            ProfileData::A2dp(_) => {
                let (encoder, decoder) = self.context().io.a2dp(self.codec_id());
                self.thread_create(WorkerId::Encoder, encoder, "a2dp-enc")?;
                self.thread_create(WorkerId::Decoder, decoder, "a2dp-dec")?;
            }
            ProfileData::Sco(_) => {
                let routine = self.context().io.sco();
                self.thread_create(WorkerId::Encoder, routine, "sco")?;
            }
        }
        Ok(())
    }

    /// Cancel both IO workers and wait for their termination.
    pub fn stop(&self) {
        self.thread_cancel(WorkerId::Encoder);
        self.thread_cancel(WorkerId::Decoder);
    }

    /// Spawn one IO worker. A reference is taken on behalf of the thread
    /// and dropped by its cleanup; the call returns once the routine has
    /// reported readiness (or died during startup).
    pub fn thread_create(&self, id: WorkerId, routine: Routine, name: &str) -> Result<(), Error> {
        let worker = self.worker(id);
        let mut state = worker.state.lock().unwrap();
        if state.thread.is_some() {
            return Ok(());
        }

        let transport = self.clone_ref();
        state.exited = false;
        worker.set_halt(false);

        let result = thread::Builder::new().name(name.to_string()).spawn({
            let transport = transport.clone();
            move || {
                let cleanup = WorkerCleanup { transport, id };
                routine(cleanup.transport.clone(), id);
            }
        });
        match result {
            Ok(handle) => state.thread = Some(handle),
            Err(e) => {
                error!("Couldn't create transport thread: {}", e);
                drop(state);
                transport.unref();
                return Err(e.into());
            }
        }

        debug!("Created new transport thread [{}]: {}", name, self);

        // wait until the routine has finished its startup
        while !state.running && !state.exited {
            state = worker.ready.wait(state).unwrap();
        }
        Ok(())
    }

    /// Synchronous worker cancellation: raise the halt flag, wake the
    /// worker and join it. A no-op for a worker which was never created,
    /// and for the worker itself.
    pub(crate) fn thread_cancel(&self, id: WorkerId) {
        let worker = self.worker(id);
        let mut state = worker.state.lock().unwrap();
        let Some(handle) = state.thread.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            state.thread = Some(handle);
            return;
        }

        worker.set_halt(true);
        if let Err(e) = worker.send_signal(Signal::Ping) {
            warn!("Couldn't wake transport thread: {}", e);
        }
        drop(state);

        if handle.join().is_err() {
            warn!("Couldn't join transport thread");
        }

        let mut state = worker.state.lock().unwrap();
        state.running = false;
        worker.set_halt(false);
        drop(state);
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.profile.name(),
            codec::codec_name(self.codec_id(), self.profile.is_a2dp())
        )
    }
}

/// Cleanup guard of an IO worker. Runs on every terminal path of the
/// routine, panics included: closes the descriptors this worker owns under
/// the PCM locks, releases the transport and drops the reference taken at
/// thread creation.
struct WorkerCleanup {
    transport: Arc<Transport>,
    id: WorkerId,
}

impl Drop for WorkerCleanup {
    fn drop(&mut self) {
        let transport = &self.transport;
        {
            let (first, second) = transport.pcms();
            let mut pcms = transport.pcms_lock();
            if first.worker() == self.id {
                TransportPcm::release_locked(&mut pcms.first);
            }
            if second.worker() == self.id {
                TransportPcm::release_locked(&mut pcms.second);
            }
            let _ = transport.release(&mut pcms);
        }

        let worker = transport.worker(self.id);
        let mut state = worker.state.lock().unwrap();
        state.running = false;
        state.exited = true;
        worker.ready.notify_all();
        drop(state);

        debug!("Exiting IO thread: {}", transport);
        self.transport.unref();
    }
}
