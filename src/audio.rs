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

//! Audio pipeline building blocks. Samples flow as `f32` in [-1, 1] between
//! nodes; each producer owns the buffer feeding its consumer and flushes it
//! explicitly.

pub mod fifo;
pub mod valve;

pub use fifo::AudioFifo;
pub use valve::AudioValve;

/// Sample rate of the internal audio bus.
pub const SAMPLE_RATE: usize = 16_000;

pub fn ms_to_samples(ms: u64) -> usize {
    ms as usize * SAMPLE_RATE / 1000
}
