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

/// A gate in the audio path. Open: samples pass. Closed with
/// `block_when_closed`: samples are refused so the upstream buffer retains
/// them. Closed without it: samples are silently discarded.
#[derive(Debug)]
pub struct AudioValve {
    open: bool,
    block_when_closed: bool,
}

impl AudioValve {
    pub fn new() -> Self {
        Self {
            open: false,
            block_when_closed: false,
        }
    }

    pub fn set_block_when_closed(&mut self, block: bool) {
        self.block_when_closed = block;
    }

    pub fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Number of samples the valve lets through right now: all of them when
    /// open, none when blocking, or all-discarded (reported as accepted) when
    /// closed and not blocking.
    pub fn pass(&self, count: usize) -> Passed {
        if self.open {
            Passed::Through(count)
        } else if self.block_when_closed {
            Passed::Blocked
        } else {
            Passed::Discarded(count)
        }
    }
}

impl Default for AudioValve {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Passed {
    Through(usize),
    Blocked,
    Discarded(usize),
}
