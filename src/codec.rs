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

//! Codec identifiers and A2DP capability decoding.
//!
//! The codec configuration negotiated by the mediator is an opaque byte blob
//! whose layout depends on the codec. This module knows just enough of each
//! layout to recover the PCM channel count and sampling rate; the actual
//! encode/decode work is supplied by the IO routines and is of no concern
//! here.

pub const A2DP_CODEC_SBC: u16 = 0x00;
pub const A2DP_CODEC_MPEG12: u16 = 0x01;
pub const A2DP_CODEC_MPEG24: u16 = 0x02;
pub const A2DP_CODEC_VENDOR_APTX: u16 = 0xff01;
pub const A2DP_CODEC_VENDOR_APTX_HD: u16 = 0xff02;
pub const A2DP_CODEC_VENDOR_FASTSTREAM: u16 = 0xff03;
pub const A2DP_CODEC_VENDOR_LDAC: u16 = 0xff04;

pub const HFP_CODEC_UNDEFINED: u16 = 0x00;
pub const HFP_CODEC_CVSD: u16 = 0x01;
pub const HFP_CODEC_MSBC: u16 = 0x02;

/// Length of the vendor codec header (vendor id + vendor codec id) which
/// prefixes every vendor-specific configuration blob.
const VENDOR_HEADER_SIZE: usize = 6;

pub const SBC_CHANNEL_MODE_MONO: u8 = 1 << 3;
pub const SBC_CHANNEL_MODE_DUAL_CHANNEL: u8 = 1 << 2;
pub const SBC_CHANNEL_MODE_STEREO: u8 = 1 << 1;
pub const SBC_CHANNEL_MODE_JOINT_STEREO: u8 = 1 << 0;

pub const SBC_SAMPLING_FREQ_16000: u16 = 1 << 3;
pub const SBC_SAMPLING_FREQ_32000: u16 = 1 << 2;
pub const SBC_SAMPLING_FREQ_44100: u16 = 1 << 1;
pub const SBC_SAMPLING_FREQ_48000: u16 = 1 << 0;

pub const MPEG_CHANNEL_MODE_MONO: u8 = 1 << 3;
pub const MPEG_CHANNEL_MODE_DUAL_CHANNEL: u8 = 1 << 2;
pub const MPEG_CHANNEL_MODE_STEREO: u8 = 1 << 1;
pub const MPEG_CHANNEL_MODE_JOINT_STEREO: u8 = 1 << 0;

pub const MPEG_SAMPLING_FREQ_48000: u16 = 1 << 0;
pub const MPEG_SAMPLING_FREQ_44100: u16 = 1 << 1;
pub const MPEG_SAMPLING_FREQ_32000: u16 = 1 << 2;
pub const MPEG_SAMPLING_FREQ_24000: u16 = 1 << 3;
pub const MPEG_SAMPLING_FREQ_22050: u16 = 1 << 4;
pub const MPEG_SAMPLING_FREQ_16000: u16 = 1 << 5;

pub const AAC_CHANNELS_1: u8 = 0x02;
pub const AAC_CHANNELS_2: u8 = 0x01;

pub const AAC_SAMPLING_FREQ_96000: u16 = 0x001;
pub const AAC_SAMPLING_FREQ_88200: u16 = 0x002;
pub const AAC_SAMPLING_FREQ_64000: u16 = 0x004;
pub const AAC_SAMPLING_FREQ_48000: u16 = 0x008;
pub const AAC_SAMPLING_FREQ_44100: u16 = 0x010;
pub const AAC_SAMPLING_FREQ_32000: u16 = 0x020;
pub const AAC_SAMPLING_FREQ_24000: u16 = 0x040;
pub const AAC_SAMPLING_FREQ_22050: u16 = 0x080;
pub const AAC_SAMPLING_FREQ_16000: u16 = 0x100;
pub const AAC_SAMPLING_FREQ_12000: u16 = 0x200;
pub const AAC_SAMPLING_FREQ_11025: u16 = 0x400;
pub const AAC_SAMPLING_FREQ_8000: u16 = 0x800;

pub const APTX_CHANNEL_MODE_MONO: u8 = 0x01;
pub const APTX_CHANNEL_MODE_STEREO: u8 = 0x02;

pub const APTX_SAMPLING_FREQ_16000: u16 = 0x08;
pub const APTX_SAMPLING_FREQ_32000: u16 = 0x04;
pub const APTX_SAMPLING_FREQ_44100: u16 = 0x02;
pub const APTX_SAMPLING_FREQ_48000: u16 = 0x01;

pub const LDAC_CHANNEL_MODE_MONO: u8 = 0x04;
pub const LDAC_CHANNEL_MODE_DUAL_CHANNEL: u8 = 0x02;
pub const LDAC_CHANNEL_MODE_STEREO: u8 = 0x01;

pub const LDAC_SAMPLING_FREQ_44100: u16 = 0x20;
pub const LDAC_SAMPLING_FREQ_48000: u16 = 0x10;
pub const LDAC_SAMPLING_FREQ_88200: u16 = 0x08;
pub const LDAC_SAMPLING_FREQ_96000: u16 = 0x04;

pub const FASTSTREAM_DIRECTION_MUSIC: u8 = 0x01;
pub const FASTSTREAM_DIRECTION_VOICE: u8 = 0x02;

pub const FASTSTREAM_SAMPLING_FREQ_MUSIC_48000: u16 = 0x01;
pub const FASTSTREAM_SAMPLING_FREQ_MUSIC_44100: u16 = 0x02;
pub const FASTSTREAM_SAMPLING_FREQ_VOICE_16000: u16 = 0x02;

/// Capability descriptor of one A2DP codec.
///
/// The bitmask tables translate the channel-mode and frequency selections
/// found in a configuration blob into PCM parameters. The back-channel
/// tables are populated only for codecs carrying a reverse voice stream.
pub struct A2dpCodec {
    pub codec_id: u16,
    /// Size of the configuration blob, in bytes.
    pub capabilities_size: usize,
    channels: &'static [(u8, u8)],
    sampling: &'static [(u16, u32)],
    channels_bc: &'static [(u8, u8)],
    sampling_bc: &'static [(u16, u32)],
}

pub static CODEC_SBC: A2dpCodec = A2dpCodec {
    codec_id: A2DP_CODEC_SBC,
    capabilities_size: 4,
    channels: &[
        (SBC_CHANNEL_MODE_MONO, 1),
        (SBC_CHANNEL_MODE_DUAL_CHANNEL, 2),
        (SBC_CHANNEL_MODE_STEREO, 2),
        (SBC_CHANNEL_MODE_JOINT_STEREO, 2),
    ],
    sampling: &[
        (SBC_SAMPLING_FREQ_16000, 16000),
        (SBC_SAMPLING_FREQ_32000, 32000),
        (SBC_SAMPLING_FREQ_44100, 44100),
        (SBC_SAMPLING_FREQ_48000, 48000),
    ],
    channels_bc: &[],
    sampling_bc: &[],
};

pub static CODEC_MPEG12: A2dpCodec = A2dpCodec {
    codec_id: A2DP_CODEC_MPEG12,
    capabilities_size: 4,
    channels: &[
        (MPEG_CHANNEL_MODE_MONO, 1),
        (MPEG_CHANNEL_MODE_DUAL_CHANNEL, 2),
        (MPEG_CHANNEL_MODE_STEREO, 2),
        (MPEG_CHANNEL_MODE_JOINT_STEREO, 2),
    ],
    sampling: &[
        (MPEG_SAMPLING_FREQ_16000, 16000),
        (MPEG_SAMPLING_FREQ_22050, 22050),
        (MPEG_SAMPLING_FREQ_24000, 24000),
        (MPEG_SAMPLING_FREQ_32000, 32000),
        (MPEG_SAMPLING_FREQ_44100, 44100),
        (MPEG_SAMPLING_FREQ_48000, 48000),
    ],
    channels_bc: &[],
    sampling_bc: &[],
};

pub static CODEC_AAC: A2dpCodec = A2dpCodec {
    codec_id: A2DP_CODEC_MPEG24,
    capabilities_size: 6,
    channels: &[(AAC_CHANNELS_1, 1), (AAC_CHANNELS_2, 2)],
    sampling: &[
        (AAC_SAMPLING_FREQ_8000, 8000),
        (AAC_SAMPLING_FREQ_11025, 11025),
        (AAC_SAMPLING_FREQ_12000, 12000),
        (AAC_SAMPLING_FREQ_16000, 16000),
        (AAC_SAMPLING_FREQ_22050, 22050),
        (AAC_SAMPLING_FREQ_24000, 24000),
        (AAC_SAMPLING_FREQ_32000, 32000),
        (AAC_SAMPLING_FREQ_44100, 44100),
        (AAC_SAMPLING_FREQ_48000, 48000),
        (AAC_SAMPLING_FREQ_64000, 64000),
        (AAC_SAMPLING_FREQ_88200, 88200),
        (AAC_SAMPLING_FREQ_96000, 96000),
    ],
    channels_bc: &[],
    sampling_bc: &[],
};

pub static CODEC_APTX: A2dpCodec = A2dpCodec {
    codec_id: A2DP_CODEC_VENDOR_APTX,
    capabilities_size: VENDOR_HEADER_SIZE + 1,
    channels: &[(APTX_CHANNEL_MODE_MONO, 1), (APTX_CHANNEL_MODE_STEREO, 2)],
    sampling: &[
        (APTX_SAMPLING_FREQ_16000, 16000),
        (APTX_SAMPLING_FREQ_32000, 32000),
        (APTX_SAMPLING_FREQ_44100, 44100),
        (APTX_SAMPLING_FREQ_48000, 48000),
    ],
    channels_bc: &[],
    sampling_bc: &[],
};

pub static CODEC_APTX_HD: A2dpCodec = A2dpCodec {
    codec_id: A2DP_CODEC_VENDOR_APTX_HD,
    // aptX configuration followed by four reserved bytes
    capabilities_size: VENDOR_HEADER_SIZE + 1 + 4,
    channels: &[(APTX_CHANNEL_MODE_MONO, 1), (APTX_CHANNEL_MODE_STEREO, 2)],
    sampling: &[
        (APTX_SAMPLING_FREQ_16000, 16000),
        (APTX_SAMPLING_FREQ_32000, 32000),
        (APTX_SAMPLING_FREQ_44100, 44100),
        (APTX_SAMPLING_FREQ_48000, 48000),
    ],
    channels_bc: &[],
    sampling_bc: &[],
};

pub static CODEC_FASTSTREAM: A2dpCodec = A2dpCodec {
    codec_id: A2DP_CODEC_VENDOR_FASTSTREAM,
    capabilities_size: VENDOR_HEADER_SIZE + 2,
    channels: &[],
    sampling: &[
        (FASTSTREAM_SAMPLING_FREQ_MUSIC_44100, 44100),
        (FASTSTREAM_SAMPLING_FREQ_MUSIC_48000, 48000),
    ],
    channels_bc: &[],
    sampling_bc: &[(FASTSTREAM_SAMPLING_FREQ_VOICE_16000, 16000)],
};

pub static CODEC_LDAC: A2dpCodec = A2dpCodec {
    codec_id: A2DP_CODEC_VENDOR_LDAC,
    capabilities_size: VENDOR_HEADER_SIZE + 2,
    channels: &[
        (LDAC_CHANNEL_MODE_MONO, 1),
        (LDAC_CHANNEL_MODE_DUAL_CHANNEL, 2),
        (LDAC_CHANNEL_MODE_STEREO, 2),
    ],
    sampling: &[
        (LDAC_SAMPLING_FREQ_44100, 44100),
        (LDAC_SAMPLING_FREQ_48000, 48000),
        (LDAC_SAMPLING_FREQ_88200, 88200),
        (LDAC_SAMPLING_FREQ_96000, 96000),
    ],
    channels_bc: &[],
    sampling_bc: &[],
};

impl A2dpCodec {
    /// Look up the capability descriptor for a codec identifier.
    pub fn for_id(codec_id: u16) -> Option<&'static A2dpCodec> {
        match codec_id {
            A2DP_CODEC_SBC => Some(&CODEC_SBC),
            A2DP_CODEC_MPEG12 => Some(&CODEC_MPEG12),
            A2DP_CODEC_MPEG24 => Some(&CODEC_AAC),
            A2DP_CODEC_VENDOR_APTX => Some(&CODEC_APTX),
            A2DP_CODEC_VENDOR_APTX_HD => Some(&CODEC_APTX_HD),
            A2DP_CODEC_VENDOR_FASTSTREAM => Some(&CODEC_FASTSTREAM),
            A2DP_CODEC_VENDOR_LDAC => Some(&CODEC_LDAC),
            _ => None,
        }
    }

    pub fn lookup_channels(&self, mask: u8, backchannel: bool) -> u8 {
        let table = if backchannel { self.channels_bc } else { self.channels };
        table.iter().find(|&&(bit, _)| mask & bit != 0).map_or(0, |&(_, channels)| channels)
    }

    pub fn lookup_sampling(&self, mask: u16, backchannel: bool) -> u32 {
        let table = if backchannel { self.sampling_bc } else { self.sampling };
        table.iter().find(|&&(bit, _)| mask & bit != 0).map_or(0, |&(_, rate)| rate)
    }
}

/// Channel count and sampling rate of one stream direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub channels: u8,
    pub sampling: u32,
}

/// PCM parameters recovered from a codec configuration blob.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodedConfiguration {
    pub main: StreamParams,
    pub backchannel: StreamParams,
}

/// Decode the channel and frequency selections of a configuration blob.
///
/// The blob is trusted to have the size advertised by the codec descriptor;
/// an unknown codec at this point is a programming error.
pub fn decode_configuration(codec: &A2dpCodec, config: &[u8]) -> DecodedConfiguration {
    debug_assert!(config.len() >= codec.capabilities_size);

    let mut decoded = DecodedConfiguration::default();
    match codec.codec_id {
        A2DP_CODEC_SBC => {
            decoded.main.channels = codec.lookup_channels(config[0] & 0x0f, false);
            decoded.main.sampling = codec.lookup_sampling(u16::from(config[0] >> 4), false);
        }
        A2DP_CODEC_MPEG12 => {
            decoded.main.channels = codec.lookup_channels(config[0] & 0x0f, false);
            decoded.main.sampling = codec.lookup_sampling(u16::from(config[1] & 0x3f), false);
        }
        A2DP_CODEC_MPEG24 => {
            decoded.main.channels = codec.lookup_channels((config[2] >> 4) & 0x03, false);
            let frequency = u16::from(config[1]) << 4 | u16::from(config[2] & 0x0f);
            decoded.main.sampling = codec.lookup_sampling(frequency, false);
        }
        A2DP_CODEC_VENDOR_APTX | A2DP_CODEC_VENDOR_APTX_HD => {
            let caps = config[VENDOR_HEADER_SIZE];
            decoded.main.channels = codec.lookup_channels(caps & 0x0f, false);
            decoded.main.sampling = codec.lookup_sampling(u16::from(caps >> 4), false);
        }
        A2DP_CODEC_VENDOR_FASTSTREAM => {
            let direction = config[VENDOR_HEADER_SIZE];
            let frequency = config[VENDOR_HEADER_SIZE + 1];
            if direction & FASTSTREAM_DIRECTION_MUSIC != 0 {
                decoded.main.channels = 2;
                decoded.main.sampling = codec.lookup_sampling(u16::from(frequency & 0x0f), false);
            }
            if direction & FASTSTREAM_DIRECTION_VOICE != 0 {
                decoded.backchannel.channels = 1;
                decoded.backchannel.sampling = codec.lookup_sampling(u16::from(frequency >> 4), true);
            }
        }
        A2DP_CODEC_VENDOR_LDAC => {
            decoded.main.channels = codec.lookup_channels(config[VENDOR_HEADER_SIZE + 1] & 0x07, false);
            decoded.main.sampling =
                codec.lookup_sampling(u16::from(config[VENDOR_HEADER_SIZE] & 0x3f), false);
        }
        codec_id => unreachable!("Unsupported A2DP codec: {:#x}", codec_id),
    }
    decoded
}

/// Name of a codec for log lines, by identifier and profile family.
pub fn codec_name(codec_id: u16, a2dp: bool) -> &'static str {
    if a2dp {
        match codec_id {
            A2DP_CODEC_SBC => "SBC",
            A2DP_CODEC_MPEG12 => "MP3",
            A2DP_CODEC_MPEG24 => "AAC",
            A2DP_CODEC_VENDOR_APTX => "aptX",
            A2DP_CODEC_VENDOR_APTX_HD => "aptX HD",
            A2DP_CODEC_VENDOR_FASTSTREAM => "FastStream",
            A2DP_CODEC_VENDOR_LDAC => "LDAC",
            _ => "unknown",
        }
    } else {
        match codec_id {
            HFP_CODEC_CVSD => "CVSD",
            HFP_CODEC_MSBC => "mSBC",
            _ => "undefined",
        }
    }
}

/// Stream end-point description used for A2DP codec selection.
#[derive(Debug, Clone)]
pub struct A2dpSep {
    pub codec_id: u16,
    pub configuration: Vec<u8>,
    /// Mediator object path of the remote stream end-point.
    pub dbus_sep_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbc_stereo_44100() {
        let config = [
            u8::try_from(SBC_SAMPLING_FREQ_44100).unwrap() << 4 | SBC_CHANNEL_MODE_STEREO,
            0x15,
            2,
            53,
        ];
        let decoded = decode_configuration(&CODEC_SBC, &config);
        assert_eq!(decoded.main, StreamParams { channels: 2, sampling: 44100 });
        assert_eq!(decoded.backchannel, StreamParams::default());
    }

    #[test]
    fn sbc_mono_16000() {
        let config = [
            u8::try_from(SBC_SAMPLING_FREQ_16000).unwrap() << 4 | SBC_CHANNEL_MODE_MONO,
            0,
            2,
            53,
        ];
        let decoded = decode_configuration(&CODEC_SBC, &config);
        assert_eq!(decoded.main, StreamParams { channels: 1, sampling: 16000 });
    }

    #[test]
    fn aac_split_frequency_field() {
        // 44100 Hz (0x010) splits as 0x01 in the first byte, 0x0 in the second
        let config = [0x02, 0x01, AAC_CHANNELS_2 << 4, 0, 0, 0];
        let decoded = decode_configuration(&CODEC_AAC, &config);
        assert_eq!(decoded.main, StreamParams { channels: 2, sampling: 44100 });
    }

    #[test]
    fn ldac_vendor_offset() {
        let mut config = [0u8; 8];
        config[6] = u8::try_from(LDAC_SAMPLING_FREQ_96000).unwrap();
        config[7] = LDAC_CHANNEL_MODE_STEREO;
        let decoded = decode_configuration(&CODEC_LDAC, &config);
        assert_eq!(decoded.main, StreamParams { channels: 2, sampling: 96000 });
    }

    #[test]
    fn faststream_directions() {
        let mut config = [0u8; 8];
        config[6] = FASTSTREAM_DIRECTION_MUSIC | FASTSTREAM_DIRECTION_VOICE;
        config[7] = u8::try_from(FASTSTREAM_SAMPLING_FREQ_VOICE_16000).unwrap() << 4
            | u8::try_from(FASTSTREAM_SAMPLING_FREQ_MUSIC_48000).unwrap();
        let decoded = decode_configuration(&CODEC_FASTSTREAM, &config);
        assert_eq!(decoded.main, StreamParams { channels: 2, sampling: 48000 });
        assert_eq!(decoded.backchannel, StreamParams { channels: 1, sampling: 16000 });

        // music-only configuration leaves the back-channel unset
        config[6] = FASTSTREAM_DIRECTION_MUSIC;
        let decoded = decode_configuration(&CODEC_FASTSTREAM, &config);
        assert_eq!(decoded.backchannel, StreamParams::default());
    }
}
