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

use crate::utils::callsign_code;
use serde::{Deserialize, Serialize};
use std::{fmt, net::Ipv4Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StationStatus {
    Online,
    Busy,
    Offline,
    Unknown,
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StationStatus::Online => "ON",
            StationStatus::Busy => "BUSY",
            StationStatus::Offline => "OFF",
            StationStatus::Unknown => "?",
        };
        write!(f, "{s}")
    }
}

/// One station as listed by the directory server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationData {
    callsign: String,
    description: String,
    status: StationStatus,
    time: String,
    id: u32,
    ip: Ipv4Addr,
}

impl StationData {
    pub const MAXCALL: usize = 10;

    pub fn new() -> Self {
        Self {
            callsign: String::new(),
            description: String::new(),
            status: StationStatus::Unknown,
            time: String::new(),
            id: 0,
            ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn set_callsign(&mut self, callsign: &str) {
        self.callsign = callsign.to_ascii_uppercase();
    }

    /// Set the description/status line of a directory list entry. The server
    /// embeds the station status and local time in the free-form text, e.g.
    /// `"In conference [ONLINE 12:34]"`.
    pub fn set_data(&mut self, data: &str) {
        self.description = data.to_owned();
        self.status = if data.contains("BUSY") {
            StationStatus::Busy
        } else if data.contains("ONLINE") {
            StationStatus::Online
        } else {
            StationStatus::Unknown
        };
        self.time = extract_time(data).unwrap_or_default();
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn set_ip(&mut self, ip: Ipv4Addr) {
        self.ip = ip;
    }

    pub fn callsign(&self) -> &str {
        &self.callsign
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> StationStatus {
        self.status
    }

    pub fn time(&self) -> &str {
        &self.time
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// Telephone-keypad representation of the callsign, used for DTMF lookup.
    pub fn code(&self) -> String {
        callsign_code(&self.callsign)
    }

    pub fn is_link(&self) -> bool {
        self.callsign.ends_with("-L")
    }

    pub fn is_repeater(&self) -> bool {
        self.callsign.ends_with("-R")
    }

    pub fn is_conference(&self) -> bool {
        self.callsign.starts_with('*')
    }
}

impl Default for StationData {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_time(data: &str) -> Option<String> {
    // Last "HH:MM" group in the text.
    let bytes = data.as_bytes();
    for i in (0..bytes.len().saturating_sub(4)).rev() {
        let w = &bytes[i..i + 5];
        if w[2] == b':'
            && w[0].is_ascii_digit()
            && w[1].is_ascii_digit()
            && w[3].is_ascii_digit()
            && w[4].is_ascii_digit()
        {
            return Some(data[i..i + 5].to_owned());
        }
    }
    None
}

/// The four class lists a completed directory download is split into. A
/// station lands in exactly one of them.
#[derive(Debug, Clone, Default)]
pub struct StationLists {
    pub links: Vec<StationData>,
    pub repeaters: Vec<StationData>,
    pub conferences: Vec<StationData>,
    pub stations: Vec<StationData>,
}

impl StationLists {
    /// Classify entries in server order: suffix `-L` links, suffix `-R`
    /// repeaters, prefix `*` conferences, everything else plain stations.
    pub fn classify(entries: Vec<StationData>) -> Self {
        let mut lists = StationLists::default();
        for entry in entries {
            if entry.is_link() {
                lists.links.push(entry);
            } else if entry.is_repeater() {
                lists.repeaters.push(entry);
            } else if entry.is_conference() {
                lists.conferences.push(entry);
            } else {
                lists.stations.push(entry);
            }
        }
        lists
    }

    pub fn all(&self) -> impl Iterator<Item = &StationData> {
        self.links
            .iter()
            .chain(self.repeaters.iter())
            .chain(self.conferences.iter())
            .chain(self.stations.iter())
    }

    pub fn find_call(&self, callsign: &str) -> Option<&StationData> {
        self.all().find(|s| s.callsign() == callsign)
    }

    pub fn find_station(&self, id: u32) -> Option<&StationData> {
        self.all().find(|s| s.id() == id)
    }

    pub fn find_by_code(&self, code: &str, exact: bool) -> Vec<StationData> {
        self.all()
            .filter(|s| {
                if exact {
                    s.code() == code
                } else {
                    s.code().starts_with(code)
                }
            })
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.links.clear();
        self.repeaters.clear();
        self.conferences.clear();
        self.stations.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn station(callsign: &str) -> StationData {
        let mut s = StationData::new();
        s.set_callsign(callsign);
        s
    }

    #[test]
    fn classification_puts_station_in_exactly_one_list() {
        let lists = StationLists::classify(vec![
            station("SM0ABC-L"),
            station("SM0DEF-R"),
            station("*TEST*"),
            station("SM0GHI"),
        ]);
        assert_eq!(1, lists.links.len());
        assert_eq!(1, lists.repeaters.len());
        assert_eq!(1, lists.conferences.len());
        assert_eq!(1, lists.stations.len());
    }

    #[test]
    fn insertion_order_is_preserved_within_a_list() {
        let lists = StationLists::classify(vec![
            station("SM0A-L"),
            station("SM0B-L"),
            station("SM0C-L"),
        ]);
        let calls: Vec<_> = lists.links.iter().map(|s| s.callsign()).collect();
        assert_eq!(vec!["SM0A-L", "SM0B-L", "SM0C-L"], calls);
    }

    #[test]
    fn status_and_time_are_extracted_from_data() {
        let mut s = station("SM0A");
        s.set_data("In conference [ONLINE 12:34]");
        assert_eq!(StationStatus::Online, s.status());
        assert_eq!("12:34", s.time());
        s.set_data("[BUSY 23:59]");
        assert_eq!(StationStatus::Busy, s.status());
    }

    #[test]
    fn code_lookup_matches_prefix_or_exact() {
        let lists = StationLists::classify(vec![station("SM0A"), station("SM0AB")]);
        // SM0A -> 7602, SM0AB -> 76022
        assert_eq!(2, lists.find_by_code("7602", false).len());
        assert_eq!(1, lists.find_by_code("7602", true).len());
    }
}
