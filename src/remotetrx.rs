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

//! The remote transceiver link: a framed TCP protocol that carries receiver
//! and transmitter control between a radio site and the core, the uplink
//! server terminating it, and the adapter that presents the link as a local
//! RX/TX pair.

pub mod adapter;
pub mod msg;
pub mod uplink;

pub use adapter::NetTrxAdapter;
pub use msg::{FrameReader, TrxMsg};
pub use uplink::NetUplink;
