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

//! End-to-end scenarios of the transport core, driven through mock
//! collaborators.

use crate::adapter::{Adapter, Address};
use crate::codec::{self, A2dpSep, CODEC_FASTSTREAM, CODEC_SBC};
use crate::device::Device;
use crate::hci::{HciBackend, VoiceSetting};
use crate::mediator::{AcquiredTransport, Mediator, MediatorError};
use crate::pcm::{ChannelVolume, PcmHandle, PcmId};
use crate::registrar::{PcmRegistrar, PcmUpdate};
use crate::rfcomm::{HandsFreeHandler, RfcommSession, RfcommSignal};
use crate::transport::{A2dpState, Profile, Transport};
use crate::worker::{IoRoutines, Routine, Signal, WorkerId};
use crate::{Context, Error};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type EventLog = Arc<Mutex<Vec<String>>>;

fn stream_pair() -> (OwnedFd, OwnedFd) {
    socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::SOCK_NONBLOCK)
        .expect("Creating socket pair")
}

struct MockMediator {
    events: EventLog,
    mtu: (u16, u16),
    /// Peer ends of the handed-out sockets, kept open for the test.
    peers: Mutex<Vec<OwnedFd>>,
    acquires: Mutex<Vec<bool>>,
    volumes: Mutex<Vec<u16>>,
    configurations: Mutex<Vec<u16>>,
}

impl MockMediator {
    fn new(events: EventLog, mtu: (u16, u16)) -> Arc<Self> {
        Arc::new(Self {
            events,
            mtu,
            peers: Mutex::new(Vec::new()),
            acquires: Mutex::new(Vec::new()),
            volumes: Mutex::new(Vec::new()),
            configurations: Mutex::new(Vec::new()),
        })
    }
}

impl Mediator for MockMediator {
    fn acquire(
        &self,
        _owner: &str,
        _path: &str,
        try_only: bool,
    ) -> Result<AcquiredTransport, MediatorError> {
        let (local, peer) = stream_pair();
        self.peers.lock().unwrap().push(peer);
        self.acquires.lock().unwrap().push(try_only);
        self.events.lock().unwrap().push("mediator:acquire".into());
        Ok(AcquiredTransport { fd: local, mtu_read: self.mtu.0, mtu_write: self.mtu.1 })
    }

    fn release(&self, _owner: &str, _path: &str) -> Result<(), MediatorError> {
        self.events.lock().unwrap().push("mediator:release".into());
        Ok(())
    }

    fn set_configuration(&self, _sep_path: &str, sep: &A2dpSep) -> Result<(), MediatorError> {
        self.configurations.lock().unwrap().push(sep.codec_id);
        Ok(())
    }

    fn set_volume(&self, _owner: &str, _path: &str, volume: u16) -> Result<(), MediatorError> {
        self.volumes.lock().unwrap().push(volume);
        Ok(())
    }
}

struct MockHci {
    voices: Mutex<Vec<VoiceSetting>>,
    peers: Mutex<Vec<OwnedFd>>,
}

impl MockHci {
    fn new() -> Arc<Self> {
        Arc::new(Self { voices: Mutex::new(Vec::new()), peers: Mutex::new(Vec::new()) })
    }
}

impl HciBackend for MockHci {
    fn sco_open(&self, _dev_id: u16) -> Result<OwnedFd, Error> {
        let (local, peer) = stream_pair();
        self.peers.lock().unwrap().push(peer);
        Ok(local)
    }

    fn sco_connect(
        &self,
        _fd: std::os::fd::BorrowedFd<'_>,
        _address: &Address,
        voice: VoiceSetting,
    ) -> Result<(), Error> {
        self.voices.lock().unwrap().push(voice);
        Ok(())
    }

    fn sco_mtu(&self, _fd: std::os::fd::BorrowedFd<'_>) -> Result<u16, Error> {
        Ok(48)
    }
}

struct MockRegistrar {
    events: EventLog,
}

impl PcmRegistrar for MockRegistrar {
    fn register(&self, pcm: &PcmHandle) {
        self.events.lock().unwrap().push(format!("register:{}", pcm.dbus_path()));
    }

    fn unregister(&self, pcm: &PcmHandle) {
        self.events.lock().unwrap().push(format!("unregister:{}", pcm.dbus_path()));
    }

    fn update(&self, pcm: &PcmHandle, mask: PcmUpdate) {
        self.events.lock().unwrap().push(format!("update:{}:{:?}", pcm.dbus_path(), mask));
    }
}

/// AT layer stub: every codec-selection request completes with a fixed,
/// pre-configured outcome.
struct MockHandsFree {
    selects_codec: Mutex<u16>,
    signals: Mutex<Vec<RfcommSignal>>,
}

impl MockHandsFree {
    fn new(selects_codec: u16) -> Arc<Self> {
        Arc::new(Self { selects_codec: Mutex::new(selects_codec), signals: Mutex::new(Vec::new()) })
    }
}

impl HandsFreeHandler for MockHandsFree {
    fn handle_signal(&self, session: &Arc<RfcommSession>, sig: RfcommSignal) {
        self.signals.lock().unwrap().push(sig);
        match sig {
            RfcommSignal::HfpSetCodecCvsd | RfcommSignal::HfpSetCodecMsbc => {
                session.complete_codec_selection(*self.selects_codec.lock().unwrap());
            }
            _ => (),
        }
    }
}

/// IO routine stub: report readiness, then service control signals until
/// cancelled. Drain requests are acknowledged on the endpoints this worker
/// drives.
struct MockIo {
    events: EventLog,
}

impl MockIo {
    fn routine(&self, name: &'static str) -> Routine {
        let events = self.events.clone();
        Box::new(move |transport: Arc<Transport>, id: WorkerId| {
            let worker = transport.worker(id);
            worker.ready();
            loop {
                let sig = worker.wait_signal();
                if worker.halted() {
                    break;
                }
                if sig == Signal::PcmSync {
                    for pcm_id in transport.pcm_ids() {
                        let pcm = transport.pcm(pcm_id).unwrap();
                        if pcm.worker() == id {
                            pcm.signal_synced();
                        }
                    }
                }
            }
            events.lock().unwrap().push(format!("exit:{}", name));
        })
    }
}

impl IoRoutines for MockIo {
    fn a2dp(&self, _codec_id: u16) -> (Routine, Routine) {
        (self.routine("enc"), self.routine("dec"))
    }

    fn sco(&self) -> Routine {
        self.routine("sco")
    }
}

struct Fixture {
    events: EventLog,
    mediator: Arc<MockMediator>,
    hci: Arc<MockHci>,
    hands_free: Arc<MockHandsFree>,
    device: Arc<Device>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_options(codec::HFP_CODEC_MSBC, true)
    }

    fn with_options(hands_free_selects: u16, esco_supported: bool) -> Self {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mediator = MockMediator::new(events.clone(), (679, 679));
        let hci = MockHci::new();
        let hands_free = MockHandsFree::new(hands_free_selects);
        let ctx = Arc::new(Context {
            mediator: mediator.clone(),
            hci: hci.clone(),
            registrar: Arc::new(MockRegistrar { events: events.clone() }),
            io: Arc::new(MockIo { events: events.clone() }),
            hands_free: hands_free.clone(),
            a2dp_native_volume: true,
        });
        let adapter = Adapter::new(ctx, 0, Address::new([0, 0, 0, 0, 0, 1]), esco_supported);
        let device = Device::new(&adapter, Address::new([0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]));
        Self { events, mediator, hci, hands_free, device }
    }

    fn sbc_config() -> [u8; 4] {
        [
            u8::try_from(codec::SBC_SAMPLING_FREQ_44100).unwrap() << 4
                | codec::SBC_CHANNEL_MODE_STEREO,
            0x15,
            2,
            53,
        ]
    }

    fn new_a2dp(&self, profile: Profile) -> Arc<Transport> {
        Transport::new_a2dp(
            &self.device,
            profile,
            ":1.5",
            &format!("{}/sep1/fd0", self.device.dbus_path()),
            &CODEC_SBC,
            &Self::sbc_config(),
        )
        .unwrap()
    }

    fn new_sco(&self, profile: Profile, with_rfcomm: bool) -> (Arc<Transport>, Option<OwnedFd>) {
        let (rfcomm_fd, peer) = if with_rfcomm {
            let (local, peer) = stream_pair();
            (Some(local), Some(peer))
        } else {
            (None, None)
        };
        let transport = Transport::new_sco(
            &self.device,
            profile,
            ":1.5",
            &format!("{}/sco", self.device.dbus_path()),
            codec::HFP_CODEC_CVSD,
            rfcomm_fd,
        )
        .unwrap();
        (transport, peer)
    }
}

#[test]
fn keep_alive_acquire() {
    let f = Fixture::new();
    let t = f.new_a2dp(Profile::A2dpSink);

    t.set_a2dp_state(A2dpState::Pending).unwrap();

    // a pending transport is acquired with the non-blocking variant
    assert_eq!(f.mediator.acquires.lock().unwrap().as_slice(), &[true]);
    let fd = t.bt_fd().expect("acquired transport descriptor");
    assert_eq!(t.mtu(), (679, 679));

    // keep-alive: no further mediator round-trip, same descriptor
    assert_eq!(t.acquire().unwrap(), fd);
    assert_eq!(f.mediator.acquires.lock().unwrap().len(), 1);

    t.destroy();
}

#[test]
fn source_role_acquires_lazily() {
    let f = Fixture::new();
    let t = f.new_a2dp(Profile::A2dpSource);

    // in the source role a pending state does not acquire
    t.set_a2dp_state(A2dpState::Pending).unwrap();
    assert!(f.mediator.acquires.lock().unwrap().is_empty());
    t.set_a2dp_state(A2dpState::Idle).unwrap();

    // a later acquire (client PCM open) issues the blocking variant
    t.acquire().unwrap();
    assert_eq!(f.mediator.acquires.lock().unwrap().as_slice(), &[false]);

    t.destroy();
}

#[test]
fn unref_frees_transport() {
    let f = Fixture::new();
    let t = f.new_a2dp(Profile::A2dpSource);
    let path = t.dbus_path().to_string();
    assert_eq!(t.ref_count(), 1);

    let looked = f.device.transport_lookup(&path).expect("indexed transport");
    assert!(Arc::ptr_eq(&t, &looked));
    assert_eq!(t.ref_count(), 2);

    looked.unref();
    assert_eq!(t.ref_count(), 1);
    // still reachable
    f.device.transport_lookup(&path).expect("indexed transport").unref();

    t.unref();
    assert_eq!(t.ref_count(), 0);
    assert!(f.device.transport_lookup(&path).is_none());
}

#[test]
fn destroy_under_load() {
    let f = Fixture::new();
    let t = f.new_a2dp(Profile::A2dpSource);
    let path = t.dbus_path().to_string();

    let handle = PcmHandle::new(t.clone(), PcmId::A2dpMain).unwrap();
    let (client, client_peer) = stream_pair();
    handle.set_client_fd(client);

    t.set_a2dp_state(A2dpState::Active).unwrap();
    assert!(t.worker(WorkerId::Encoder).running());
    assert!(t.worker(WorkerId::Decoder).running());
    // one reference per running worker on top of the binding one
    assert_eq!(t.ref_count(), 3);

    t.destroy();

    assert!(f.device.transport_lookup(&path).is_none());
    assert_eq!(t.ref_count(), 0);

    // the worker cleanup closed the client stream: its peer sees EOF
    let mut buf = [0u8; 4];
    let n = unsafe { libc::read(client_peer.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    assert_eq!(n, 0, "PCM descriptor still open");

    // endpoints left the client surface before the workers were stopped
    let events = f.events.lock().unwrap();
    let last_unregister = events.iter().rposition(|e| e.starts_with("unregister:")).unwrap();
    let first_exit = events.iter().position(|e| e.starts_with("exit:")).unwrap();
    assert!(last_unregister < first_exit, "events: {:?}", *events);
}

#[test]
fn sco_codec_switch() {
    let f = Fixture::new();
    let (t, _rfcomm_peer) = f.new_sco(Profile::HfpAg, true);
    assert_eq!(t.codec_id(), codec::HFP_CODEC_CVSD);

    t.acquire().unwrap();
    assert_eq!(f.hci.voices.lock().unwrap().as_slice(), &[VoiceSetting::Cvsd16Bit]);
    assert!(t.bt_fd().is_some());

    let handle = PcmHandle::new(t.clone(), PcmId::ScoSpeaker).unwrap();
    let (client, client_peer) = stream_pair();
    handle.set_client_fd(client);

    t.select_codec_sco(codec::HFP_CODEC_MSBC).unwrap();
    assert_eq!(t.codec_id(), codec::HFP_CODEC_MSBC);
    assert_eq!(
        f.hands_free.signals.lock().unwrap().as_slice(),
        &[RfcommSignal::HfpSetCodecMsbc]
    );

    // the switch released the ongoing connection
    assert!(t.bt_fd().is_none());
    let mut buf = [0u8; 4];
    let n = unsafe { libc::read(client_peer.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    assert_eq!(n, 0, "PCM descriptor still open");

    // mSBC runs over a transparent SCO link
    t.acquire().unwrap();
    assert_eq!(
        f.hci.voices.lock().unwrap().as_slice(),
        &[VoiceSetting::Cvsd16Bit, VoiceSetting::Transparent]
    );

    // switching to the selected codec again is a no-op
    t.select_codec_sco(codec::HFP_CODEC_MSBC).unwrap();
    assert_eq!(f.hands_free.signals.lock().unwrap().len(), 1);

    t.destroy();
}

#[test]
fn sco_codec_switch_failure() {
    // the AT layer completes the handshake without changing the codec
    let f = Fixture::with_options(codec::HFP_CODEC_CVSD, true);
    let (t, _rfcomm_peer) = f.new_sco(Profile::HfpAg, true);

    t.acquire().unwrap();
    let err = t.select_codec_sco(codec::HFP_CODEC_MSBC).unwrap_err();
    assert!(matches!(err, Error::Io(_)), "{:?}", err);
    assert_eq!(t.codec_id(), codec::HFP_CODEC_CVSD);

    // no locks left dangling: the transport is still fully operational
    t.acquire().unwrap();
    t.destroy();
}

#[test]
fn sco_codec_switch_requires_rfcomm() {
    let f = Fixture::new();
    let (t, _) = f.new_sco(Profile::HfpAg, false);
    assert!(matches!(
        t.select_codec_sco(codec::HFP_CODEC_MSBC),
        Err(Error::NotSupported)
    ));
    t.destroy();
}

#[test]
fn hsp_is_locked_to_cvsd() {
    let f = Fixture::new();
    let (t, _rfcomm_peer) = f.new_sco(Profile::HspAg, true);
    assert_eq!(t.codec_id(), codec::HFP_CODEC_CVSD);
    assert!(matches!(
        t.select_codec_sco(codec::HFP_CODEC_MSBC),
        Err(Error::NotSupported)
    ));
    t.destroy();
}

#[test]
fn no_esco_forces_cvsd() {
    let f = Fixture::with_options(codec::HFP_CODEC_MSBC, false);
    let transport = Transport::new_sco(
        &f.device,
        Profile::HfpHf,
        ":1.5",
        &format!("{}/sco", f.device.dbus_path()),
        codec::HFP_CODEC_MSBC,
        None,
    )
    .unwrap();
    assert_eq!(transport.codec_id(), codec::HFP_CODEC_CVSD);
    transport.destroy();
}

#[test]
fn sco_pcm_parameters_follow_codec() {
    let f = Fixture::new();
    let (t, _rfcomm_peer) = f.new_sco(Profile::HfpAg, true);

    let spk = t.pcm(PcmId::ScoSpeaker).unwrap();
    {
        let state = spk.state.lock().unwrap();
        assert_eq!((state.channels, state.sampling), (1, 8000));
    }

    t.set_codec(codec::HFP_CODEC_MSBC);
    {
        let state = spk.state.lock().unwrap();
        assert_eq!((state.channels, state.sampling), (1, 16000));
    }

    t.destroy();
}

#[test]
fn a2dp_volume_propagation() {
    let f = Fixture::new();
    let t = f.new_a2dp(Profile::A2dpSource);
    let handle = PcmHandle::new(t.clone(), PcmId::A2dpMain).unwrap();

    handle.set_volume([ChannelVolume { level: 5000, muted: false }; 2]);
    handle.volume_update();

    let bt = *f.mediator.volumes.lock().unwrap().last().unwrap();
    assert_eq!(bt, handle.pcm().volume_level_to_bt(5000));
    let level = handle.pcm().volume_bt_to_level(bt);
    assert!((i32::from(level) - 5000).abs() <= 100, "{} !~ 5000", level);

    // one muted channel silences the remote end
    handle.set_volume([
        ChannelVolume { level: 5000, muted: false },
        ChannelVolume { level: 5000, muted: true },
    ]);
    handle.volume_update();
    assert_eq!(*f.mediator.volumes.lock().unwrap().last().unwrap(), 0);

    // clients were notified on both updates
    let events = f.events.lock().unwrap();
    assert_eq!(events.iter().filter(|e| e.starts_with("update:")).count(), 2);
    drop(events);

    t.destroy();
}

#[test]
fn soft_volume_skips_remote_propagation() {
    let f = Fixture::new();
    let t = f.new_a2dp(Profile::A2dpSource);
    let handle = PcmHandle::new(t.clone(), PcmId::A2dpMain).unwrap();

    handle.set_soft_volume(true);
    handle.set_volume([ChannelVolume { level: -2000, muted: false }; 2]);
    handle.volume_update();

    // remote end untouched, client notification still delivered
    assert!(f.mediator.volumes.lock().unwrap().is_empty());
    assert!(f.events.lock().unwrap().iter().any(|e| e.starts_with("update:")));

    t.destroy();
}

#[test]
fn sco_volume_goes_through_rfcomm() {
    let f = Fixture::new();
    let (t, _rfcomm_peer) = f.new_sco(Profile::HfpHf, true);
    let handle = PcmHandle::new(t.clone(), PcmId::ScoSpeaker).unwrap();

    handle.set_volume([ChannelVolume { level: -1000, muted: false }; 2]);
    handle.volume_update();

    // the update travels asynchronously through the session thread
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f.hands_free.signals.lock().unwrap().contains(&RfcommSignal::UpdateVolume) {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(f.hands_free.signals.lock().unwrap().contains(&RfcommSignal::UpdateVolume));

    t.destroy();
}

#[test]
fn drain_blocks_then_returns() {
    let f = Fixture::new();
    let t = f.new_a2dp(Profile::A2dpSource);
    let handle = PcmHandle::new(t.clone(), PcmId::A2dpMain).unwrap();

    // no running worker yet
    assert!(matches!(handle.drain(), Err(Error::NoThread)));

    t.set_a2dp_state(A2dpState::Active).unwrap();

    let start = Instant::now();
    handle.drain().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));

    // a repeated drain completes as well, without a deadlock
    handle.drain().unwrap();

    t.destroy();
}

#[test]
fn pcm_path_composition() {
    let f = Fixture::new();
    let base = f.device.dbus_path().to_string();

    let t = f.new_a2dp(Profile::A2dpSink);
    assert_eq!(
        t.pcm(PcmId::A2dpMain).unwrap().dbus_path(),
        format!("{}/a2dpsnk/source", base)
    );
    assert_eq!(
        t.pcm(PcmId::A2dpBackchannel).unwrap().dbus_path(),
        format!("{}/a2dpsnk/sink", base)
    );
    t.destroy();

    let (t, _rfcomm_peer) = f.new_sco(Profile::HfpAg, true);
    assert_eq!(t.pcm(PcmId::ScoSpeaker).unwrap().dbus_path(), format!("{}/hfpag/sink", base));
    assert_eq!(
        t.pcm(PcmId::ScoMicrophone).unwrap().dbus_path(),
        format!("{}/hfpag/source", base)
    );
    // endpoint selectors of the other profile family are rejected
    assert!(matches!(t.pcm(PcmId::A2dpMain), Err(Error::InvalidArg)));
    t.destroy();
}

#[test]
fn faststream_registers_configured_directions_only() {
    let f = Fixture::new();
    let mut config = [0u8; 8];
    config[6] = codec::FASTSTREAM_DIRECTION_MUSIC;
    config[7] = u8::try_from(codec::FASTSTREAM_SAMPLING_FREQ_MUSIC_48000).unwrap();

    let t = Transport::new_a2dp(
        &f.device,
        Profile::A2dpSource,
        ":1.5",
        &format!("{}/sep2/fd0", f.device.dbus_path()),
        &CODEC_FASTSTREAM,
        &config,
    )
    .unwrap();

    // the voice back-channel has no configured direction
    assert_eq!(t.pcm(PcmId::A2dpBackchannel).unwrap().state.lock().unwrap().channels, 0);
    let events = f.events.lock().unwrap();
    let registered: Vec<_> = events.iter().filter(|e| e.starts_with("register:")).collect();
    assert_eq!(registered.len(), 1, "events: {:?}", *events);
    drop(events);

    t.destroy();
}

#[test]
fn a2dp_codec_selection_round_trip() {
    let f = Fixture::new();
    let t = f.new_a2dp(Profile::A2dpSource);

    // the very same end-point configuration is a no-op
    let same = A2dpSep {
        codec_id: codec::A2DP_CODEC_SBC,
        configuration: Fixture::sbc_config().to_vec(),
        dbus_sep_path: "/org/bluez/hci0/dev/sep1".into(),
    };
    t.select_codec_a2dp(&same).unwrap();
    assert!(f.mediator.configurations.lock().unwrap().is_empty());

    // a different codec goes through the mediator
    let other = A2dpSep {
        codec_id: codec::A2DP_CODEC_VENDOR_LDAC,
        configuration: vec![0; 8],
        dbus_sep_path: "/org/bluez/hci0/dev/sep3".into(),
    };
    t.select_codec_a2dp(&other).unwrap();
    assert_eq!(
        f.mediator.configurations.lock().unwrap().as_slice(),
        &[codec::A2DP_CODEC_VENDOR_LDAC]
    );

    t.destroy();
}

#[test]
fn stop_releases_transport() {
    let f = Fixture::new();
    let t = f.new_a2dp(Profile::A2dpSink);

    t.set_a2dp_state(A2dpState::Pending).unwrap();
    assert!(t.bt_fd().is_some());

    t.set_a2dp_state(A2dpState::Active).unwrap();
    assert!(t.worker(WorkerId::Encoder).running());

    // back to idle: the workers stop and their cleanup closes the socket
    t.set_a2dp_state(A2dpState::Idle).unwrap();
    assert!(!t.worker(WorkerId::Encoder).running());
    assert!(t.bt_fd().is_none());

    t.destroy();
}
