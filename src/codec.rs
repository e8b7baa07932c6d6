/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Voice packet framing and the speech codec seam.
//!
//! A voice packet is an RTP-style 12 byte header followed by the codec
//! payload. GSM packets carry four fixed 33 byte frames (payload type 0x03),
//! Speex packets a variable-length payload (payload type 0x96). Both codecs
//! consume and produce exactly four 160 sample frames per packet.

pub mod gsm;
pub mod speex;

use crate::error::{EchoError, EchoResult};
use byteorder::{BigEndian, ByteOrder};

pub const FRAME_SAMPLES: usize = 160;
pub const FRAME_COUNT: usize = 4;
pub const PACKET_SAMPLES: usize = FRAME_SAMPLES * FRAME_COUNT;

pub const PT_GSM: u8 = 0x03;
pub const PT_SPEEX: u8 = 0x96;

/// First byte of every voice packet: RTP version 3, no padding, no extension.
pub const VOICE_VERSION: u8 = 0xc0;
pub const VOICE_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceHeader {
    pub payload_type: u8,
    pub sequence: u16,
}

impl VoiceHeader {
    /// Serialize the header. Time and source id are always zero on the wire.
    pub fn encode(&self) -> [u8; VOICE_HEADER_LEN] {
        let mut buf = [0u8; VOICE_HEADER_LEN];
        buf[0] = VOICE_VERSION;
        buf[1] = self.payload_type;
        BigEndian::write_u16(&mut buf[2..4], self.sequence);
        buf
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < VOICE_HEADER_LEN || buf[0] != VOICE_VERSION {
            return None;
        }
        Some(Self {
            payload_type: buf[1],
            sequence: BigEndian::read_u16(&buf[2..4]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Gsm,
    Speex,
}

impl CodecKind {
    pub fn payload_type(&self) -> u8 {
        match self {
            CodecKind::Gsm => PT_GSM,
            CodecKind::Speex => PT_SPEEX,
        }
    }
}

/// The speech codec contract: one packet in, one packet out, four frames of
/// 160 samples each. Implementations are free in how they compress the
/// sample domain as long as they honour the wire framing.
pub trait SpeechCodec {
    fn kind(&self) -> CodecKind;

    fn encode_packet(&mut self, samples: &[i16]) -> EchoResult<Vec<u8>>;

    fn decode_packet(&mut self, payload: &[u8]) -> EchoResult<Vec<i16>>;
}

pub(crate) fn check_packet_samples(samples: &[i16]) -> EchoResult<()> {
    if samples.len() != PACKET_SAMPLES {
        return Err(EchoError::CodecError(format!(
            "expected {} samples per packet, got {}",
            PACKET_SAMPLES,
            samples.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn voice_header_round_trips() {
        let hdr = VoiceHeader {
            payload_type: PT_GSM,
            sequence: 0xBEEF,
        };
        let bytes = hdr.encode();
        assert_eq!(VOICE_VERSION, bytes[0]);
        assert_eq!(Some(hdr), VoiceHeader::parse(&bytes));
    }

    #[test]
    fn non_voice_leader_is_rejected() {
        assert_eq!(None, VoiceHeader::parse(b"oNDATA\rhello"));
    }
}
