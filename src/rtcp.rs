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

//! RTCP SDES and BYE sub-packets as used on the EchoLink control port.
//!
//! The composite packet layout is a null receiver report followed by one
//! SDES or BYE sub-packet. Each sub-packet starts with a 16 bit word
//! `(version << 14) | type | (count << 8)`, a big-endian length in 32 bit
//! words minus one, and a 32 bit source identifier. EchoLink historically
//! stamps version 3 instead of the standard 2; both are accepted on parse.

use byteorder::{BigEndian, ByteOrder};
use tracing::warn;

pub const RTP_VERSION: u8 = 3;

pub const RTCP_SR: u8 = 200;
pub const RTCP_RR: u8 = 201;
pub const RTCP_SDES: u8 = 202;
pub const RTCP_BYE: u8 = 203;

pub const SDES_END: u8 = 0;
pub const SDES_CNAME: u8 = 1;
pub const SDES_NAME: u8 = 2;
pub const SDES_EMAIL: u8 = 3;
pub const SDES_PHONE: u8 = 4;
pub const SDES_PRIV: u8 = 8;

/// PRIV item text a peer sends to announce Speex capability.
pub const PRIV_SPEEX: &str = "SPEEX";

const BYE_REASON: &str = "jan2002";

fn push_item(buf: &mut Vec<u8>, item: u8, text: &str) {
    buf.push(item);
    buf.push(text.len() as u8);
    buf.extend_from_slice(text.as_bytes());
}

fn push_null_rr(buf: &mut Vec<u8>) {
    buf.push(RTP_VERSION << 6);
    buf.push(RTCP_RR);
    buf.extend_from_slice(&[0, 1]);
    buf.extend_from_slice(&[0, 0, 0, 0]);
}

fn finish_subpacket(buf: &mut Vec<u8>, start: usize) {
    while (buf.len() - start) & 3 != 0 {
        buf.push(0);
    }
    let words = ((buf.len() - start) / 4 - 1) as u16;
    BigEndian::write_u16(&mut buf[start + 2..start + 4], words);
}

/// Build the composite SDES packet announcing `callsign` and display `name`.
/// A `priv_item` of [`PRIV_SPEEX`] advertises the Speex codec.
pub fn build_sdes(callsign: &str, name: &str, priv_item: Option<&str>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    push_null_rr(&mut buf);

    let start = buf.len();
    let ver = ((RTP_VERSION as u16) << 14) | (RTCP_SDES as u16) | (1 << 8);
    buf.extend_from_slice(&ver.to_be_bytes());
    buf.extend_from_slice(&[0, 0]); // length, patched below
    buf.extend_from_slice(&[0, 0, 0, 0]); // source id

    push_item(&mut buf, SDES_CNAME, "CALLSIGN");
    push_item(&mut buf, SDES_NAME, &format!("{callsign:<15}{name}"));
    push_item(&mut buf, SDES_EMAIL, "CALLSIGN");
    push_item(&mut buf, SDES_PHONE, "08:30");
    if let Some(priv_item) = priv_item {
        push_item(&mut buf, SDES_PRIV, priv_item);
    }
    buf.push(SDES_END);
    buf.push(0);

    finish_subpacket(&mut buf, start);
    buf
}

/// Build the composite BYE packet.
pub fn build_bye() -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    push_null_rr(&mut buf);

    let start = buf.len();
    let ver = ((RTP_VERSION as u16) << 14) | (RTCP_BYE as u16) | (1 << 8);
    buf.extend_from_slice(&ver.to_be_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&[0, 0, 0, 0]);

    buf.push(BYE_REASON.len() as u8);
    buf.extend_from_slice(BYE_REASON.as_bytes());

    finish_subpacket(&mut buf, start);
    buf
}

fn version_accepted(first_byte: u8) -> bool {
    let version = (first_byte >> 6) & 3;
    if version == 2 {
        warn!("RTCP sub-packet with version 2 (expected 3)");
    }
    version == 2 || version == RTP_VERSION
}

/// Walk a possibly composite RTCP packet and report whether it contains a
/// sub-packet of the given type. The sub-packet is recognised both with and
/// without a leading null receiver report.
fn contains_subpacket(packet: &[u8], wanted: u8) -> bool {
    if packet.len() < 8 || !version_accepted(packet[0]) || packet[0] & 0x20 != 0 {
        return false;
    }

    let mut off = 0;
    let mut saw = false;
    while off + 4 <= packet.len() {
        if !version_accepted(packet[off]) {
            break;
        }
        if packet[off + 1] == wanted {
            saw = true;
        }
        let words = BigEndian::read_u16(&packet[off + 2..off + 4]) as usize;
        off += (words + 1) * 4;
    }
    saw
}

pub fn is_sdes(packet: &[u8]) -> bool {
    contains_subpacket(packet, RTCP_SDES)
}

pub fn is_bye(packet: &[u8]) -> bool {
    contains_subpacket(packet, RTCP_BYE)
}

/// Extract the text of the first SDES item of type `want_item`. Sub-packets
/// are walked until an SDES with a non-zero count is found; reads never pass
/// the sub-packet's declared length.
pub fn parse_sdes(packet: &[u8], want_item: u8) -> Option<String> {
    let mut off = 0;
    while off + 8 <= packet.len() {
        if !version_accepted(packet[off]) {
            return None;
        }
        let words = BigEndian::read_u16(&packet[off + 2..off + 4]) as usize;
        let sub_len = (words + 1) * 4;

        if packet[off + 1] == RTCP_SDES && packet[off] & 0x1F > 0 {
            let end = usize::min(off + sub_len, packet.len());
            let mut cp = off + 8;
            while cp + 2 <= end {
                let itype = packet[cp];
                if itype == SDES_END {
                    break;
                }
                let ilen = packet[cp + 1] as usize;
                if cp + 2 + ilen > end {
                    break;
                }
                if itype == want_item {
                    return Some(String::from_utf8_lossy(&packet[cp + 2..cp + 2 + ilen]).into_owned());
                }
                cp += ilen + 2;
            }
            return None;
        }

        off += sub_len;
    }
    None
}

/// Split an SDES NAME item into callsign and display name.
pub fn split_name_item(name_item: &str) -> Option<(String, String)> {
    let mut parts = name_item.split([' ', '\t', '\n', '\r']).filter(|s| !s.is_empty());
    let call = parts.next()?.to_owned();
    let name = parts.collect::<Vec<_>>().join(" ");
    Some((call, name))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn built_sdes_is_recognised() {
        let sdes = build_sdes("SM0TEST", "Sven", None);
        assert!(is_sdes(&sdes));
        assert!(!is_bye(&sdes));
        assert_eq!(0, sdes.len() % 4);
    }

    #[test]
    fn name_item_round_trips() {
        let sdes = build_sdes("SM0TEST", "Sven", None);
        let name = parse_sdes(&sdes, SDES_NAME).expect("NAME item missing");
        assert_eq!(format!("{:<15}{}", "SM0TEST", "Sven"), name);
        let (call, display) = split_name_item(&name).expect("malformed NAME");
        assert_eq!("SM0TEST", call);
        assert_eq!("Sven", display);
    }

    #[test]
    fn priv_item_carries_codec_capability() {
        let sdes = build_sdes("SM0A", "x", Some(PRIV_SPEEX));
        assert_eq!(Some(PRIV_SPEEX.to_owned()), parse_sdes(&sdes, SDES_PRIV));
        let plain = build_sdes("SM0A", "x", None);
        assert_eq!(None, parse_sdes(&plain, SDES_PRIV));
    }

    #[test]
    fn built_bye_is_recognised() {
        let bye = build_bye();
        assert!(is_bye(&bye));
        assert!(!is_sdes(&bye));
    }

    #[test]
    fn bye_without_leading_rr_is_recognised() {
        let bye = build_bye();
        assert!(is_bye(&bye[8..]));
    }

    #[test]
    fn version_2_is_accepted() {
        let mut sdes = build_sdes("SM0A", "x", None);
        sdes[0] = (sdes[0] & 0x3F) | (2 << 6);
        sdes[8] = (sdes[8] & 0x3F) | (2 << 6);
        assert!(is_sdes(&sdes));
        assert!(parse_sdes(&sdes, SDES_NAME).is_some());
    }

    #[test]
    fn zero_count_sdes_is_rejected_by_parse() {
        let mut sdes = build_sdes("SM0A", "x", None);
        sdes[8] &= !0x1F;
        assert_eq!(None, parse_sdes(&sdes, SDES_NAME));
    }

    #[test]
    fn truncated_buffer_does_not_read_past_end() {
        let sdes = build_sdes("SM0A", "x", None);
        // Cut the buffer in the middle of the NAME item; its declared length
        // now crosses the end of the buffer.
        assert_eq!(None, parse_sdes(&sdes[..30], SDES_NAME));
    }
}
