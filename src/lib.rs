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

//! An EchoLink voice gateway for amateur radio use: directory client, proxy
//! tunnel, UDP session dispatch, peer voice sessions with GSM/Speex
//! framing, a remote transceiver link, a receiver voter and an AFSK/AX.25
//! demodulator.

pub mod afsk;
pub mod audio;
pub mod codec;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod proxy;
pub mod qso;
pub mod remotetrx;
pub mod rtcp;
pub mod station;
pub mod telemetry;
pub mod trx;
pub mod utils;
pub mod voter;
