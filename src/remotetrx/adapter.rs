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

//! Presents one framed link as a local RX and a local TX simultaneously.
//!
//! The adapter owns two symmetric audio chains. Writing into the TX of one
//! side surfaces as RX events on the other: when a TX starts emitting, the
//! paired RX opens its squelch with the configured signal level; when the
//! TX goes idle, the squelch closes. DTMF is relayed across the pair, and
//! while the squelch is open the signal level is re-reported once a second.

use crate::{
    error::EchoResult,
    trx::{RxCommand, RxEvent, RxPort, TxCommand, TxCtrlMode, TxEvent, TxPort, rx_port, tx_port},
};
use std::time::Duration;
use tokio::{select, sync::mpsc, time};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{info, instrument};

const SIGLEV_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// One face of the adapter: a receiver and a transmitter, as seen by their
/// owner.
#[derive(Debug)]
pub struct AdapterPair {
    pub rx: RxPort,
    pub tx: TxPort,
}

pub struct NetTrxAdapter;

impl NetTrxAdapter {
    /// Create the two cross-connected faces. Audio written into `a.tx`
    /// comes out of `b.rx` and vice versa.
    #[instrument(skip(subsys))]
    pub fn start(subsys: &SubsystemHandle, siglev: f32) -> (AdapterPair, AdapterPair) {
        let (a_rx, a_rx_events, a_rx_commands) = rx_port(256);
        let (a_tx, a_tx_commands, a_tx_events) = tx_port(256);
        let (b_rx, b_rx_events, b_rx_commands) = rx_port(256);
        let (b_tx, b_tx_commands, b_tx_events) = tx_port(256);

        subsys.start(SubsystemBuilder::new("adapter-downlink", move |s| {
            bridge(s, siglev, a_tx_commands, a_tx_events, b_rx_events, b_rx_commands)
        }));
        subsys.start(SubsystemBuilder::new("adapter-uplink", move |s| {
            bridge(s, siglev, b_tx_commands, b_tx_events, a_rx_events, a_rx_commands)
        }));

        (
            AdapterPair { rx: a_rx, tx: a_tx },
            AdapterPair { rx: b_rx, tx: b_tx },
        )
    }
}

/// One direction: TX commands in, RX events out on the paired side.
async fn bridge(
    subsys: SubsystemHandle,
    siglev: f32,
    mut tx_commands: mpsc::Receiver<TxCommand>,
    tx_events: mpsc::Sender<TxEvent>,
    rx_events: mpsc::Sender<RxEvent>,
    mut rx_commands: mpsc::Receiver<RxCommand>,
) -> EchoResult<()> {
    let mut mode = TxCtrlMode::Off;
    let mut transmitting = false;
    let mut is_idle = true;
    let mut rx_muted = true;
    let mut siglev_report = time::interval(SIGLEV_REPORT_INTERVAL);

    loop {
        select! {
            _ = subsys.on_shutdown_requested() => return Ok(()),

            command = tx_commands.recv() => {
                let Some(command) = command else { return Ok(()) };
                match command {
                    TxCommand::SetCtrlMode(new_mode) => {
                        if new_mode != mode {
                            mode = new_mode;
                            let on = match mode {
                                TxCtrlMode::Off => false,
                                TxCtrlMode::On => true,
                                TxCtrlMode::Auto => !is_idle,
                            };
                            set_transmit(
                                on,
                                &mut transmitting,
                                rx_muted,
                                siglev,
                                &tx_events,
                                &rx_events,
                            )
                            .await;
                        }
                    }
                    TxCommand::Audio(samples) => {
                        is_idle = false;
                        if mode == TxCtrlMode::Auto && !transmitting {
                            set_transmit(
                                true,
                                &mut transmitting,
                                rx_muted,
                                siglev,
                                &tx_events,
                                &rx_events,
                            )
                            .await;
                        }
                        if transmitting && !rx_muted {
                            rx_events.send(RxEvent::Audio(samples)).await.ok();
                        }
                    }
                    TxCommand::Flush => {
                        is_idle = true;
                        if mode == TxCtrlMode::Auto && transmitting {
                            set_transmit(
                                false,
                                &mut transmitting,
                                rx_muted,
                                siglev,
                                &tx_events,
                                &rx_events,
                            )
                            .await;
                        }
                        tx_events.send(TxEvent::AllSamplesFlushed).await.ok();
                    }
                    TxCommand::SendDtmf { digits, duration_ms } => {
                        if !rx_muted {
                            for digit in digits.chars() {
                                rx_events
                                    .send(RxEvent::Dtmf { digit, duration_ms })
                                    .await
                                    .ok();
                            }
                        }
                    }
                    TxCommand::EnableCtcss(enable) => {
                        info!("CTCSS {}", if enable { "enabled" } else { "disabled" });
                    }
                }
            }

            command = rx_commands.recv() => {
                let Some(command) = command else { return Ok(()) };
                match command {
                    RxCommand::Mute(mute) => rx_muted = mute,
                    RxCommand::Reset => rx_muted = true,
                    // The adapter has no tone detectors of its own.
                    RxCommand::AddToneDetector(_) => {}
                }
            }

            _ = siglev_report.tick(), if transmitting && !rx_muted => {
                rx_events
                    .send(RxEvent::Squelch { open: true, siglev, rx_id: 0 })
                    .await
                    .ok();
            }
        }
    }
}

async fn set_transmit(
    on: bool,
    transmitting: &mut bool,
    rx_muted: bool,
    siglev: f32,
    tx_events: &mpsc::Sender<TxEvent>,
    rx_events: &mpsc::Sender<RxEvent>,
) {
    if on == *transmitting {
        return;
    }
    *transmitting = on;
    tx_events
        .send(TxEvent::TransmitterStateChange(on))
        .await
        .ok();
    if !rx_muted {
        rx_events
            .send(RxEvent::Squelch {
                open: on,
                siglev,
                rx_id: 0,
            })
            .await
            .ok();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio_graceful_shutdown::Toplevel;

    async fn start_pair() -> (AdapterPair, AdapterPair, tokio::task::JoinHandle<()>) {
        let (pair_tx, pair_rx) = tokio::sync::oneshot::channel();
        let toplevel = Toplevel::new(move |s| async move {
            let pairs = NetTrxAdapter::start(&s, 0.8);
            pair_tx.send(pairs).ok();
        });
        let handle = tokio::spawn(async move {
            toplevel
                .handle_shutdown_requests(Duration::from_millis(100))
                .await
                .ok();
        });
        let (a, b) = pair_rx.await.expect("no pairs");
        (a, b, handle)
    }

    #[tokio::test]
    async fn transmit_opens_the_paired_squelch() {
        let (a, mut b, _handle) = start_pair().await;
        // Unmute the receiving side first and let the command settle.
        b.rx.commands.send(RxCommand::Mute(false)).await.ok();
        time::sleep(Duration::from_millis(50)).await;
        a.tx.commands
            .send(TxCommand::SetCtrlMode(TxCtrlMode::On))
            .await
            .ok();

        let event = b.rx.events.recv().await.expect("no event");
        assert_eq!(
            RxEvent::Squelch {
                open: true,
                siglev: 0.8,
                rx_id: 0
            },
            event
        );

        a.tx.commands
            .send(TxCommand::SetCtrlMode(TxCtrlMode::Off))
            .await
            .ok();
        let event = b.rx.events.recv().await.expect("no event");
        assert_eq!(
            RxEvent::Squelch {
                open: false,
                siglev: 0.8,
                rx_id: 0
            },
            event
        );
    }

    #[tokio::test]
    async fn audio_flows_across_the_pair_in_auto_mode() {
        let (a, mut b, _handle) = start_pair().await;
        b.rx.commands.send(RxCommand::Mute(false)).await.ok();
        time::sleep(Duration::from_millis(50)).await;
        a.tx.commands
            .send(TxCommand::SetCtrlMode(TxCtrlMode::Auto))
            .await
            .ok();
        a.tx.commands
            .send(TxCommand::Audio(vec![0.25; 160]))
            .await
            .ok();

        // Squelch opens first, then the audio follows.
        let event = b.rx.events.recv().await.expect("no event");
        assert!(matches!(event, RxEvent::Squelch { open: true, .. }));
        let event = b.rx.events.recv().await.expect("no event");
        assert!(matches!(event, RxEvent::Audio(samples) if samples.len() == 160));

        // Flush ends the transmission and acknowledges upstream.
        let mut a = a;
        a.tx.commands.send(TxCommand::Flush).await.ok();
        let event = b.rx.events.recv().await.expect("no event");
        assert!(matches!(event, RxEvent::Squelch { open: false, .. }));
        let event = a.tx.events.recv().await.expect("no event");
        assert!(matches!(event, TxEvent::AllSamplesFlushed));
    }

    #[tokio::test]
    async fn dtmf_is_relayed_across_the_pair() {
        let (a, mut b, _handle) = start_pair().await;
        b.rx.commands.send(RxCommand::Mute(false)).await.ok();
        time::sleep(Duration::from_millis(50)).await;
        a.tx.commands
            .send(TxCommand::SendDtmf {
                digits: "12".to_owned(),
                duration_ms: 80,
            })
            .await
            .ok();

        let event = b.rx.events.recv().await.expect("no event");
        assert_eq!(
            RxEvent::Dtmf {
                digit: '1',
                duration_ms: 80
            },
            event
        );
        let event = b.rx.events.recv().await.expect("no event");
        assert_eq!(
            RxEvent::Dtmf {
                digit: '2',
                duration_ms: 80
            },
            event
        );
    }

    #[tokio::test]
    async fn muted_rx_side_stays_silent() {
        let (a, mut b, _handle) = start_pair().await;
        // b.rx stays muted (the default).
        a.tx.commands
            .send(TxCommand::SetCtrlMode(TxCtrlMode::On))
            .await
            .ok();
        a.tx.commands
            .send(TxCommand::Audio(vec![0.25; 160]))
            .await
            .ok();

        let timeout = time::timeout(Duration::from_millis(200), b.rx.events.recv()).await;
        assert!(timeout.is_err(), "muted RX leaked an event");
    }
}
