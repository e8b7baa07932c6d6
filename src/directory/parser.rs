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

//! Parser for the station list reply of the directory server.
//!
//! The reply is `"@@@\n"`, an ASCII record count terminated by `\n`, then per
//! record four newline terminated fields (callsign, description, id, IPv4),
//! closed by `"+++"`. A `"."` callsign resets the record in progress without
//! counting; a `" "` callsign contributes its description line to the
//! free-form server message. The parser consumes exactly the bytes of each
//! record and leaves everything after the terminator untouched.

use crate::station::StationData;
use std::net::Ipv4Addr;
use tracing::error;

const ERRMSG_PREFIX: &str = "INCORRECT PASSWORD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    WaitingForStart,
    WaitingForCount,
    WaitingForCall,
    WaitingForData,
    WaitingForId,
    WaitingForIp,
    WaitingForEnd,
    Done,
    Failed,
}

#[derive(Debug)]
pub struct CallListParser {
    state: ListState,
    count_left: i64,
    entry: StationData,
    entries: Vec<StationData>,
    message: String,
}

impl CallListParser {
    pub fn new() -> Self {
        Self {
            state: ListState::WaitingForStart,
            count_left: 0,
            entry: StationData::new(),
            entries: Vec::new(),
            message: String::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ListState::Done
    }

    pub fn is_failed(&self) -> bool {
        self.state == ListState::Failed
    }

    /// The accumulated server message lines.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The error text the server smuggled into the message stream, if any.
    pub fn error(&self) -> Option<&str> {
        if self.message.starts_with(ERRMSG_PREFIX) {
            Some(&self.message)
        } else {
            None
        }
    }

    pub fn take_entries(&mut self) -> Vec<StationData> {
        std::mem::take(&mut self.entries)
    }

    /// Consume as much of `buf` as the current state allows. Returns the
    /// number of consumed bytes; the caller keeps the remainder for the next
    /// call (or for whatever follows a completed list).
    pub fn feed(&mut self, buf: &[u8]) -> usize {
        let mut consumed = 0;
        loop {
            let step = self.step(&buf[consumed..]);
            if step == 0 {
                return consumed;
            }
            consumed += step;
        }
    }

    fn step(&mut self, buf: &[u8]) -> usize {
        match self.state {
            ListState::WaitingForStart => {
                if buf.len() < 4 {
                    return 0;
                }
                if &buf[..4] == b"@@@\n" {
                    self.state = ListState::WaitingForCount;
                    4
                } else {
                    error!("Error in call list format (@@@ expected).");
                    self.state = ListState::Failed;
                    0
                }
            }

            ListState::WaitingForCount => {
                let Some((line, read)) = next_line(buf) else {
                    return 0;
                };
                self.count_left = line.trim().parse().unwrap_or(0);
                self.entries.clear();
                self.message.clear();
                self.state = if self.count_left > 0 {
                    ListState::WaitingForCall
                } else {
                    ListState::WaitingForEnd
                };
                read
            }

            ListState::WaitingForCall => {
                let Some((line, read)) = next_line(buf) else {
                    return 0;
                };
                self.entry.clear();
                self.entry.set_callsign(&line);
                self.state = ListState::WaitingForData;
                read
            }

            ListState::WaitingForData => {
                let Some((line, read)) = next_line(buf) else {
                    return 0;
                };
                self.entry.set_data(&line);
                self.state = ListState::WaitingForId;
                read
            }

            ListState::WaitingForId => {
                let Some((line, read)) = next_line(buf) else {
                    return 0;
                };
                self.entry.set_id(line.trim().parse().unwrap_or(0));
                self.state = ListState::WaitingForIp;
                read
            }

            ListState::WaitingForIp => {
                let Some((line, read)) = next_line(buf) else {
                    return 0;
                };
                self.entry
                    .set_ip(line.trim().parse().unwrap_or(Ipv4Addr::UNSPECIFIED));

                // A "." entry resets the record buffer and does not count.
                if self.entry.callsign() == "." {
                    self.state = ListState::WaitingForCall;
                    return read;
                }

                if self.entry.callsign() == " " {
                    self.message.push_str(self.entry.description());
                    self.message.push('\n');
                } else {
                    self.entries.push(self.entry.clone());
                }

                self.count_left -= 1;
                self.state = if self.count_left <= 0 {
                    ListState::WaitingForEnd
                } else {
                    ListState::WaitingForCall
                };
                read
            }

            ListState::WaitingForEnd => {
                if buf.len() < 3 {
                    return 0;
                }
                if &buf[..3] == b"+++" {
                    self.state = ListState::Done;
                    3
                } else {
                    error!("Error in call list format (+++ expected).");
                    self.state = ListState::Failed;
                    0
                }
            }

            ListState::Done | ListState::Failed => 0,
        }
    }
}

impl Default for CallListParser {
    fn default() -> Self {
        Self::new()
    }
}

fn next_line(buf: &[u8]) -> Option<(String, usize)> {
    let nl = buf.iter().position(|&b| b == b'\n')?;
    let line = String::from_utf8_lossy(&buf[..nl]).into_owned();
    Some((line, nl + 1))
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(call: &str, data: &str, id: u32, ip: &str) -> String {
        format!("{call}\n{data}\n{id}\n{ip}\n")
    }

    fn parse_all(parser: &mut CallListParser, stream: &[u8]) -> usize {
        let mut consumed = 0;
        while consumed < stream.len() {
            let n = parser.feed(&stream[consumed..]);
            if n == 0 {
                break;
            }
            consumed += n;
        }
        consumed
    }

    #[test]
    fn count_n_produces_exactly_n_entries() {
        let mut stream = String::from("@@@\n3\n");
        stream += &record("SM0A-L", "[ONLINE 10:00]", 1001, "10.0.0.1");
        stream += &record("SM0B-R", "[ONLINE 10:01]", 1002, "10.0.0.2");
        stream += &record("SM0C", "[BUSY 10:02]", 1003, "10.0.0.3");
        stream += "+++";

        let mut parser = CallListParser::new();
        let consumed = parse_all(&mut parser, stream.as_bytes());
        assert!(parser.is_done());
        assert_eq!(stream.len(), consumed);
        assert_eq!(3, parser.take_entries().len());
    }

    #[test]
    fn dot_entries_neither_count_nor_appear() {
        let mut stream = String::from("@@@\n2\n");
        stream += &record(".", "ignored", 0, "0.0.0.0");
        stream += &record("SM0A", "[ONLINE 10:00]", 1001, "10.0.0.1");
        stream += &record("SM0B", "[ONLINE 10:05]", 1002, "10.0.0.2");
        stream += "+++";

        let mut parser = CallListParser::new();
        parse_all(&mut parser, stream.as_bytes());
        assert!(parser.is_done());
        let entries = parser.take_entries();
        assert_eq!(2, entries.len());
        assert!(entries.iter().all(|e| e.callsign() != "."));
    }

    #[test]
    fn space_entries_accumulate_into_the_message_in_order() {
        let mut stream = String::from("@@@\n3\n");
        stream += &record(" ", "first line", 0, "0.0.0.0");
        stream += &record(" ", "second line", 0, "0.0.0.0");
        stream += &record("SM0A", "[ONLINE 10:00]", 1001, "10.0.0.1");
        stream += "+++";

        let mut parser = CallListParser::new();
        parse_all(&mut parser, stream.as_bytes());
        assert!(parser.is_done());
        assert_eq!("first line\nsecond line\n", parser.message());
        assert_eq!(1, parser.take_entries().len());
    }

    #[test]
    fn incorrect_password_is_surfaced_as_error() {
        let mut stream = String::from("@@@\n1\n");
        stream += &record(" ", "INCORRECT PASSWORD", 0, "0.0.0.0");
        stream += "+++";

        let mut parser = CallListParser::new();
        parse_all(&mut parser, stream.as_bytes());
        assert!(parser.is_done());
        assert!(parser.error().expect("no error").starts_with("INCORRECT PASSWORD"));
    }

    #[test]
    fn trailing_bytes_are_left_in_the_stream() {
        let mut stream = String::from("@@@\n0\n+++");
        stream += "EXTRA";

        let mut parser = CallListParser::new();
        let consumed = parse_all(&mut parser, stream.as_bytes());
        assert!(parser.is_done());
        assert_eq!(stream.len() - "EXTRA".len(), consumed);
    }

    #[test]
    fn arbitrary_chunking_yields_the_same_result() {
        let mut stream = String::from("@@@\n2\n");
        stream += &record("SM0A", "[ONLINE 10:00]", 1001, "10.0.0.1");
        stream += &record("*CONF*", "[ONLINE 10:03]", 1004, "10.0.0.4");
        stream += "+++";
        let bytes = stream.as_bytes();

        for chunk_size in [1, 2, 5, 17] {
            let mut parser = CallListParser::new();
            let mut pending: Vec<u8> = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                pending.extend_from_slice(chunk);
                let n = parser.feed(&pending);
                pending.drain(..n);
            }
            assert!(parser.is_done(), "chunk size {chunk_size}");
            assert_eq!(2, parser.take_entries().len(), "chunk size {chunk_size}");
        }
    }

    #[test]
    fn missing_start_marker_fails_the_parse() {
        let mut parser = CallListParser::new();
        parser.feed(b"xxxx");
        assert!(parser.is_failed());
    }
}
