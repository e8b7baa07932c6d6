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

//! Message framing of the remote transceiver link.
//!
//! Every message is a fixed `{type: u8, size: u32 LE}` header immediately
//! followed by `size - 5` payload bytes, where `size` covers header and
//! payload. A decoded size above [`MAX_FRAME_SIZE`] is a protocol violation
//! and both ends drop the connection.

use crate::{
    error::{EchoError, EchoResult},
    trx::{ToneDetectorSpec, TxCtrlMode},
};
use byteorder::{ByteOrder, LittleEndian};

pub const HEADER_SIZE: usize = 5;
pub const MAX_FRAME_SIZE: usize = 2048;

/// Samples per `Audio` message, sized so a full audio frame stays well below
/// the frame cap.
pub const MAX_COUNT: usize = 512;

const TYPE_HEARTBEAT: u8 = 1;
const TYPE_AUTH: u8 = 2;
const TYPE_MUTE: u8 = 10;
const TYPE_ADD_TONE_DETECTOR: u8 = 11;
const TYPE_SET_TX_CTRL_MODE: u8 = 12;
const TYPE_ENABLE_CTCSS: u8 = 13;
const TYPE_SEND_DTMF: u8 = 14;
const TYPE_AUDIO: u8 = 15;
const TYPE_FLUSH: u8 = 16;
const TYPE_SQUELCH: u8 = 20;
const TYPE_DTMF: u8 = 21;
const TYPE_TONE: u8 = 22;
const TYPE_TX_TIMEOUT: u8 = 23;
const TYPE_TRANSMITTER_STATE_CHANGE: u8 = 24;
const TYPE_ALL_SAMPLES_FLUSHED: u8 = 25;

#[derive(Debug, Clone, PartialEq)]
pub enum TrxMsg {
    Heartbeat,
    Auth,
    Mute(bool),
    AddToneDetector(ToneDetectorSpec),
    SetTxCtrlMode(TxCtrlMode),
    EnableCtcss(bool),
    SendDtmf {
        digits: String,
        duration_ms: u16,
    },
    Audio(Vec<i16>),
    Flush,
    Squelch {
        open: bool,
        siglev: f32,
        rx_id: u8,
    },
    Dtmf {
        digit: char,
        duration_ms: u16,
    },
    Tone(f32),
    TxTimeout,
    TransmitterStateChange(bool),
    AllSamplesFlushed,
    /// Message type this side does not know. Logged and ignored by both ends.
    Unknown {
        msg_type: u8,
    },
}

impl TrxMsg {
    fn type_code(&self) -> u8 {
        match self {
            TrxMsg::Heartbeat => TYPE_HEARTBEAT,
            TrxMsg::Auth => TYPE_AUTH,
            TrxMsg::Mute(_) => TYPE_MUTE,
            TrxMsg::AddToneDetector(_) => TYPE_ADD_TONE_DETECTOR,
            TrxMsg::SetTxCtrlMode(_) => TYPE_SET_TX_CTRL_MODE,
            TrxMsg::EnableCtcss(_) => TYPE_ENABLE_CTCSS,
            TrxMsg::SendDtmf { .. } => TYPE_SEND_DTMF,
            TrxMsg::Audio(_) => TYPE_AUDIO,
            TrxMsg::Flush => TYPE_FLUSH,
            TrxMsg::Squelch { .. } => TYPE_SQUELCH,
            TrxMsg::Dtmf { .. } => TYPE_DTMF,
            TrxMsg::Tone(_) => TYPE_TONE,
            TrxMsg::TxTimeout => TYPE_TX_TIMEOUT,
            TrxMsg::TransmitterStateChange(_) => TYPE_TRANSMITTER_STATE_CHANGE,
            TrxMsg::AllSamplesFlushed => TYPE_ALL_SAMPLES_FLUSHED,
            TrxMsg::Unknown { msg_type } => *msg_type,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            TrxMsg::Heartbeat
            | TrxMsg::Auth
            | TrxMsg::Flush
            | TrxMsg::TxTimeout
            | TrxMsg::AllSamplesFlushed
            | TrxMsg::Unknown { .. } => Vec::new(),
            TrxMsg::Mute(mute) => vec![*mute as u8],
            TrxMsg::EnableCtcss(enable) => vec![*enable as u8],
            TrxMsg::TransmitterStateChange(transmitting) => vec![*transmitting as u8],
            TrxMsg::AddToneDetector(spec) => {
                let mut buf = vec![0u8; 16];
                LittleEndian::write_f32(&mut buf[0..4], spec.fq);
                LittleEndian::write_u32(&mut buf[4..8], spec.bw);
                LittleEndian::write_f32(&mut buf[8..12], spec.thresh);
                LittleEndian::write_u32(&mut buf[12..16], spec.required_duration);
                buf
            }
            TrxMsg::SetTxCtrlMode(mode) => vec![match mode {
                TxCtrlMode::Off => 0,
                TxCtrlMode::On => 1,
                TxCtrlMode::Auto => 2,
            }],
            TrxMsg::SendDtmf {
                digits,
                duration_ms,
            } => {
                let mut buf = vec![0u8; 2];
                LittleEndian::write_u16(&mut buf, *duration_ms);
                buf.extend_from_slice(digits.as_bytes());
                buf
            }
            TrxMsg::Audio(samples) => {
                let mut buf = vec![0u8; samples.len() * 2];
                LittleEndian::write_i16_into(samples, &mut buf);
                buf
            }
            TrxMsg::Squelch {
                open,
                siglev,
                rx_id,
            } => {
                let mut buf = vec![0u8; 6];
                buf[0] = *open as u8;
                LittleEndian::write_f32(&mut buf[1..5], *siglev);
                buf[5] = *rx_id;
                buf
            }
            TrxMsg::Dtmf { digit, duration_ms } => {
                let mut buf = vec![0u8; 3];
                buf[0] = *digit as u8;
                LittleEndian::write_u16(&mut buf[1..3], *duration_ms);
                buf
            }
            TrxMsg::Tone(fq) => {
                let mut buf = vec![0u8; 4];
                LittleEndian::write_f32(&mut buf, *fq);
                buf
            }
        }
    }

    /// Serialize the message. The emitted `size` always equals header size
    /// plus payload size.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.push(self.type_code());
        buf.extend_from_slice(&((HEADER_SIZE + payload.len()) as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    fn decode(msg_type: u8, payload: &[u8]) -> EchoResult<TrxMsg> {
        let bad_size =
            || EchoError::ProtocolViolation(format!("bad payload size for message {msg_type}"));

        let msg = match msg_type {
            TYPE_HEARTBEAT => TrxMsg::Heartbeat,
            TYPE_AUTH => TrxMsg::Auth,
            TYPE_FLUSH => TrxMsg::Flush,
            TYPE_TX_TIMEOUT => TrxMsg::TxTimeout,
            TYPE_ALL_SAMPLES_FLUSHED => TrxMsg::AllSamplesFlushed,
            TYPE_MUTE => TrxMsg::Mute(*payload.first().ok_or_else(bad_size)? != 0),
            TYPE_ENABLE_CTCSS => TrxMsg::EnableCtcss(*payload.first().ok_or_else(bad_size)? != 0),
            TYPE_TRANSMITTER_STATE_CHANGE => {
                TrxMsg::TransmitterStateChange(*payload.first().ok_or_else(bad_size)? != 0)
            }
            TYPE_ADD_TONE_DETECTOR => {
                if payload.len() != 16 {
                    return Err(bad_size());
                }
                TrxMsg::AddToneDetector(ToneDetectorSpec {
                    fq: LittleEndian::read_f32(&payload[0..4]),
                    bw: LittleEndian::read_u32(&payload[4..8]),
                    thresh: LittleEndian::read_f32(&payload[8..12]),
                    required_duration: LittleEndian::read_u32(&payload[12..16]),
                })
            }
            TYPE_SET_TX_CTRL_MODE => match *payload.first().ok_or_else(bad_size)? {
                0 => TrxMsg::SetTxCtrlMode(TxCtrlMode::Off),
                1 => TrxMsg::SetTxCtrlMode(TxCtrlMode::On),
                2 => TrxMsg::SetTxCtrlMode(TxCtrlMode::Auto),
                other => {
                    return Err(EchoError::ProtocolViolation(format!(
                        "unknown TX control mode {other}"
                    )));
                }
            },
            TYPE_SEND_DTMF => {
                if payload.len() < 2 {
                    return Err(bad_size());
                }
                TrxMsg::SendDtmf {
                    duration_ms: LittleEndian::read_u16(&payload[0..2]),
                    digits: String::from_utf8_lossy(&payload[2..]).into_owned(),
                }
            }
            TYPE_AUDIO => {
                if payload.len() % 2 != 0 {
                    return Err(bad_size());
                }
                let mut samples = vec![0i16; payload.len() / 2];
                LittleEndian::read_i16_into(payload, &mut samples);
                TrxMsg::Audio(samples)
            }
            TYPE_SQUELCH => {
                if payload.len() != 6 {
                    return Err(bad_size());
                }
                TrxMsg::Squelch {
                    open: payload[0] != 0,
                    siglev: LittleEndian::read_f32(&payload[1..5]),
                    rx_id: payload[5],
                }
            }
            TYPE_DTMF => {
                if payload.len() != 3 {
                    return Err(bad_size());
                }
                TrxMsg::Dtmf {
                    digit: payload[0] as char,
                    duration_ms: LittleEndian::read_u16(&payload[1..3]),
                }
            }
            TYPE_TONE => {
                if payload.len() != 4 {
                    return Err(bad_size());
                }
                TrxMsg::Tone(LittleEndian::read_f32(payload))
            }
            other => TrxMsg::Unknown { msg_type: other },
        };
        Ok(msg)
    }
}

/// Incremental decoder over a TCP byte stream. Feed arbitrary chunks, pull
/// complete messages. A declared frame size outside the sanity bounds makes
/// every subsequent call fail so the caller drops the peer.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
    poisoned: bool,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_msg(&mut self) -> EchoResult<Option<TrxMsg>> {
        if self.poisoned {
            return Err(EchoError::ProtocolViolation(
                "frame stream already failed".to_owned(),
            ));
        }
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let size = LittleEndian::read_u32(&self.buf[1..5]) as usize;
        if !(HEADER_SIZE..=MAX_FRAME_SIZE).contains(&size) {
            self.poisoned = true;
            return Err(EchoError::ProtocolViolation(format!(
                "declared frame size {size} outside {HEADER_SIZE}..={MAX_FRAME_SIZE}"
            )));
        }
        if self.buf.len() < size {
            return Ok(None);
        }

        let msg_type = self.buf[0];
        let msg = TrxMsg::decode(msg_type, &self.buf[HEADER_SIZE..size])?;
        self.buf.drain(..size);
        Ok(Some(msg))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.poisoned = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_messages() -> Vec<TrxMsg> {
        vec![
            TrxMsg::Heartbeat,
            TrxMsg::Mute(true),
            TrxMsg::AddToneDetector(ToneDetectorSpec {
                fq: 1750.0,
                bw: 50,
                thresh: 10.0,
                required_duration: 1000,
            }),
            TrxMsg::SetTxCtrlMode(TxCtrlMode::Auto),
            TrxMsg::EnableCtcss(true),
            TrxMsg::SendDtmf {
                digits: "123#".to_owned(),
                duration_ms: 100,
            },
            TrxMsg::Audio((0..MAX_COUNT as i16).collect()),
            TrxMsg::Flush,
            TrxMsg::Squelch {
                open: true,
                siglev: 3.5,
                rx_id: 2,
            },
            TrxMsg::Dtmf {
                digit: '5',
                duration_ms: 80,
            },
            TrxMsg::Tone(1750.0),
            TrxMsg::TxTimeout,
            TrxMsg::TransmitterStateChange(true),
            TrxMsg::AllSamplesFlushed,
        ]
    }

    #[test]
    fn emitted_size_equals_header_plus_payload() {
        for msg in sample_messages() {
            let encoded = msg.encode();
            let size = LittleEndian::read_u32(&encoded[1..5]) as usize;
            assert_eq!(encoded.len(), size);
        }
    }

    #[test]
    fn chunked_stream_yields_original_sequence() {
        let msgs = sample_messages();
        let mut stream = Vec::new();
        for msg in &msgs {
            stream.extend_from_slice(&msg.encode());
        }

        // Feed in deliberately awkward chunk sizes.
        for chunk_size in [1, 3, 7, 64, 1024] {
            let mut reader = FrameReader::new();
            let mut decoded = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                reader.extend(chunk);
                while let Some(msg) = reader.next_msg().expect("decode") {
                    decoded.push(msg);
                }
            }
            assert_eq!(msgs, decoded, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn oversized_frame_poisons_the_stream() {
        let mut reader = FrameReader::new();
        let mut frame = vec![TYPE_AUDIO];
        frame.extend_from_slice(&4097u32.to_le_bytes());
        reader.extend(&frame);
        assert!(reader.next_msg().is_err());
        // Remains failed even for subsequent valid data.
        reader.extend(&TrxMsg::Heartbeat.encode());
        assert!(reader.next_msg().is_err());
    }

    #[test]
    fn undersized_frame_is_rejected() {
        let mut reader = FrameReader::new();
        let mut frame = vec![TYPE_HEARTBEAT];
        frame.extend_from_slice(&4u32.to_le_bytes());
        reader.extend(&frame);
        assert!(reader.next_msg().is_err());
    }

    #[test]
    fn unknown_type_is_surfaced_not_fatal() {
        let mut reader = FrameReader::new();
        let mut frame = vec![99u8];
        frame.extend_from_slice(&7u32.to_le_bytes());
        frame.extend_from_slice(&[0xAA, 0xBB]);
        reader.extend(&frame);
        reader.extend(&TrxMsg::Heartbeat.encode());
        assert_eq!(
            Some(TrxMsg::Unknown { msg_type: 99 }),
            reader.next_msg().expect("decode")
        );
        assert_eq!(Some(TrxMsg::Heartbeat), reader.next_msg().expect("decode"));
    }

    #[test]
    fn max_count_audio_fits_the_frame_cap() {
        let msg = TrxMsg::Audio(vec![0i16; MAX_COUNT]);
        assert!(msg.encode().len() <= MAX_FRAME_SIZE);
    }
}
