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

//! AX.25 frame parsing on top of the HDLC layer.
//!
//! Address fields carry six ASCII characters shifted left by one with the
//! SSID in the low nibble of the seventh byte. Up to three digipeater hops
//! are read; the digipeater path must follow the n-N paradigm
//! (`WIDE1-1`, `WIDE1-1,WIDE2-2` or `WIDE1-1,WIDE3-3`), anything else is
//! dropped.

use super::hdlc::check_crc;
use tracing::warn;

/// One accepted APRS frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AfskFrame {
    pub source: String,
    pub destination: String,
    /// Comma separated digipeater path, always ending in `qAR`.
    pub path: String,
    /// Payload with non-printable bytes replaced by `"."`.
    pub payload: String,
}

impl AfskFrame {
    /// The APRS-IS style record `"SRC>DST,PATH"`.
    pub fn aprs_record(&self) -> String {
        format!("{}>{},{}", self.source, self.destination, self.path)
    }
}

fn decode_address(bytes: &[u8]) -> String {
    let mut call = String::new();
    for &b in &bytes[..6] {
        if b & 0xFE != 0x40 {
            call.push((b >> 1) as char);
        }
    }
    let ssid = (bytes[6] >> 1) & 0x0F;
    if ssid > 0 {
        call.push('-');
        call.push((b'0' + ssid) as char);
    }
    call
}

/// Parse a raw HDLC frame (FCS included). Returns `None` for anything that
/// is not a clean, policy-conforming APRS frame.
pub fn parse_frame(frame: &[u8]) -> Option<AfskFrame> {
    if frame.len() < 10 {
        return None;
    }
    if !check_crc(frame) {
        warn!("AX.25 frame with bad CRC discarded");
        return None;
    }

    let bp = &frame[..frame.len() - 2];

    // Command/response frames with the extension bit set in the destination
    // (e.g. flexnet headers) are not handled.
    if bp[1] & 1 != 0 {
        return None;
    }
    if bp.len() < 15 {
        return None;
    }

    let destination = decode_address(&bp[0..7]);
    let source = decode_address(&bp[7..14]);

    let mut pos = 14;
    let mut path = String::new();
    let mut path_cnt = 1u8;

    // More address fields follow while the extension bit of the previous
    // one is clear.
    while bp[pos - 1] & 1 == 0 && bp.len() >= pos + 7 {
        let hop = &bp[pos..pos + 7];
        let ssid = (hop[6] >> 1) & 0x0F;

        for &b in &hop[..6] {
            if b & 0xFE != 0x40 {
                path.push((b >> 1) as char);
            }
        }

        if ssid > path_cnt || path_cnt > 3 {
            warn!(
                "ignoring wrong APRS path, should be \"WIDE1-1\", \
                 \"WIDE1-1,WIDE2-2\" or \"WIDE1-1,WIDE3-3\""
            );
            return None;
        }

        path.push('-');
        path.push((b'0' + ssid) as char);
        path_cnt += 2;
        pos += 7;

        if bp[pos - 1] & 1 == 0 && bp.len() >= pos + 7 {
            path.push(',');
        }
    }
    path.push_str(",qAR");
    let path = path.trim_start_matches(',').to_owned();

    // Control field and PID.
    if bp.len() < pos + 2 {
        return None;
    }
    let payload_bytes = &bp[pos + 2..];

    let payload: String = payload_bytes
        .iter()
        .map(|&b| {
            if b > 0 && b < 128 {
                b as char
            } else {
                '.'
            }
        })
        .collect();

    Some(AfskFrame {
        source,
        destination,
        path,
        payload,
    })
}

#[cfg(test)]
pub mod testutil {
    use crate::afsk::hdlc::fcs;

    pub fn encode_address(call: &str, ssid: u8, last: bool) -> [u8; 7] {
        let mut out = [0x40u8; 7]; // ' ' << 1
        for (i, c) in call.bytes().take(6).enumerate() {
            out[i] = c << 1;
        }
        out[6] = 0x60 | (ssid << 1) | last as u8;
        out
    }

    /// Build a complete AX.25 UI frame with FCS for the given addresses.
    pub fn build_frame(src: (&str, u8), dst: (&str, u8), hops: &[(&str, u8)], payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&encode_address(dst.0, dst.1, false));
        frame.extend_from_slice(&encode_address(src.0, src.1, hops.is_empty()));
        for (i, (call, ssid)) in hops.iter().enumerate() {
            frame.extend_from_slice(&encode_address(call, *ssid, i + 1 == hops.len()));
        }
        frame.push(0x03); // UI control
        frame.push(0xF0); // no layer 3
        frame.extend_from_slice(payload);
        let crc = fcs(&frame);
        frame.extend_from_slice(&crc);
        frame
    }
}

#[cfg(test)]
mod test {
    use super::testutil::build_frame;
    use super::*;
    use crate::afsk::hdlc::{CRC_RESIDUE, crc_ccitt};

    #[test]
    fn accepted_frame_has_crc_residue() {
        let frame = build_frame(("SRC", 0), ("DST", 0), &[("WIDE1", 1), ("WIDE2", 2)], b"hi");
        assert_eq!(CRC_RESIDUE, crc_ccitt(&frame));
        assert!(parse_frame(&frame).is_some());
    }

    #[test]
    fn wide1_1_wide2_2_path_is_surfaced() {
        let frame = build_frame(
            ("SRC", 0),
            ("DST", 0),
            &[("WIDE1", 1), ("WIDE2", 2)],
            b"test payload",
        );
        let parsed = parse_frame(&frame).expect("frame rejected");
        assert_eq!("SRC>DST,WIDE1-1,WIDE2-2,qAR", parsed.aprs_record());
        assert_eq!("test payload", parsed.payload);
    }

    #[test]
    fn single_wide1_1_hop_is_accepted() {
        let frame = build_frame(("SM0A", 9), ("APRS", 0), &[("WIDE1", 1)], b"x");
        let parsed = parse_frame(&frame).expect("frame rejected");
        assert_eq!("SM0A-9>APRS,WIDE1-1,qAR", parsed.aprs_record());
    }

    #[test]
    fn illegal_first_hop_is_discarded() {
        let frame = build_frame(("SRC", 0), ("DST", 0), &[("WIDE2", 2)], b"x");
        assert_eq!(None, parse_frame(&frame));
    }

    #[test]
    fn three_hop_path_is_discarded() {
        let frame = build_frame(
            ("SRC", 0),
            ("DST", 0),
            &[("WIDE1", 1), ("WIDE2", 2), ("WIDE3", 3)],
            b"x",
        );
        assert_eq!(None, parse_frame(&frame));
    }

    #[test]
    fn corrupt_crc_is_discarded() {
        let mut frame = build_frame(("SRC", 0), ("DST", 0), &[("WIDE1", 1)], b"x");
        let len = frame.len();
        frame[len - 1] ^= 0xFF;
        assert_eq!(None, parse_frame(&frame));
    }

    #[test]
    fn non_printable_payload_bytes_become_dots() {
        let frame = build_frame(("SRC", 0), ("DST", 0), &[("WIDE1", 1)], b"a\x00b\xFFc");
        let parsed = parse_frame(&frame).expect("frame rejected");
        assert_eq!("a.b.c", parsed.payload);
    }
}
