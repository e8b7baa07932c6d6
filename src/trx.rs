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

//! The receiver/transmitter seam. Receivers report events (squelch, signal
//! level, DTMF, tones, audio) on a channel and accept commands on another;
//! transmitters mirror that with TX control commands and TX events. The
//! voter, the remote transceiver uplink and the adapter all speak this
//! contract, so any of them can stand in for a physical radio.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const RX_ID_UNKNOWN: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxCtrlMode {
    Off,
    On,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToneDetectorSpec {
    pub fq: f32,
    pub bw: u32,
    pub thresh: f32,
    pub required_duration: u32,
}

/// Events a receiver reports upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum RxEvent {
    Squelch {
        open: bool,
        siglev: f32,
        rx_id: u8,
    },
    Audio(Vec<f32>),
    Dtmf {
        digit: char,
        duration_ms: u16,
    },
    Selcall(String),
    Tone(f32),
}

/// Commands a receiver accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum RxCommand {
    Mute(bool),
    AddToneDetector(ToneDetectorSpec),
    Reset,
}

/// Commands a transmitter accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum TxCommand {
    SetCtrlMode(TxCtrlMode),
    EnableCtcss(bool),
    SendDtmf { digits: String, duration_ms: u16 },
    Audio(Vec<f32>),
    Flush,
}

/// Events a transmitter reports upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum TxEvent {
    Timeout,
    TransmitterStateChange(bool),
    AllSamplesFlushed,
}

/// A receiver as seen by its single owner: event stream plus command sink.
#[derive(Debug)]
pub struct RxPort {
    pub events: mpsc::Receiver<RxEvent>,
    pub commands: mpsc::Sender<RxCommand>,
}

/// A transmitter as seen by its single owner.
#[derive(Debug)]
pub struct TxPort {
    pub commands: mpsc::Sender<TxCommand>,
    pub events: mpsc::Receiver<TxEvent>,
}

/// Channel pair backing an [`RxPort`]; the receiver implementation keeps the
/// other halves.
pub fn rx_port(depth: usize) -> (RxPort, mpsc::Sender<RxEvent>, mpsc::Receiver<RxCommand>) {
    let (event_tx, event_rx) = mpsc::channel(depth);
    let (command_tx, command_rx) = mpsc::channel(depth);
    (
        RxPort {
            events: event_rx,
            commands: command_tx,
        },
        event_tx,
        command_rx,
    )
}

pub fn tx_port(depth: usize) -> (TxPort, mpsc::Receiver<TxCommand>, mpsc::Sender<TxEvent>) {
    let (command_tx, command_rx) = mpsc::channel(depth);
    let (event_tx, event_rx) = mpsc::channel(depth);
    (
        TxPort {
            commands: command_tx,
            events: event_rx,
        },
        command_rx,
        event_tx,
    )
}
