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

//! The uplink server of a remote transceiver site. Accepts exactly one
//! client at a time, translates inbound messages into RX/TX commands and
//! streams RX/TX events back out. A 10 s heartbeat keeps the link warm;
//! 15 s of silence or any framing violation drops the client.

use crate::{
    audio::AudioFifo,
    config::RemoteTrxConfig,
    error::EchoResult,
    remotetrx::msg::{FrameReader, MAX_COUNT, TrxMsg},
    trx::{RxCommand, RxEvent, RxPort, TxCommand, TxEvent, TxPort},
};
use std::{net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    select,
    time::{self, Instant},
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{info, instrument, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const SILENCE_TIMEOUT: Duration = Duration::from_secs(15);

/// Samples the TX-side FIFO holds before they are handed to the
/// transmitter.
const TX_FIFO_LEN: usize = 16_000;

pub struct NetUplink;

impl NetUplink {
    /// Start the uplink subsystem serving `rx` and `tx` over TCP. Resolves
    /// with the actually bound address (useful with port 0).
    #[instrument(skip(subsys, rx, tx))]
    pub async fn start(
        subsys: &SubsystemHandle,
        config: RemoteTrxConfig,
        rx: RxPort,
        tx: TxPort,
    ) -> EchoResult<SocketAddr> {
        let listener =
            TcpListener::bind(SocketAddr::new(config.bind_address, config.listen_port)).await?;
        let addr = listener.local_addr()?;
        info!("Remote transceiver uplink listening on {addr}");

        subsys.start(SubsystemBuilder::new("uplink", move |s| {
            UplinkActor {
                subsys: s,
                listener,
                rx,
                tx,
                reader: FrameReader::new(),
                fifo: AudioFifo::new(TX_FIFO_LEN),
            }
            .run()
        }));

        Ok(addr)
    }
}

struct UplinkActor {
    subsys: SubsystemHandle,
    listener: TcpListener,
    rx: RxPort,
    tx: TxPort,
    reader: FrameReader,
    fifo: AudioFifo,
}

impl UplinkActor {
    async fn run(mut self) -> EchoResult<()> {
        loop {
            let client = select! {
                _ = self.subsys.on_shutdown_requested() => return Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("Client connected: {peer}");
                        stream
                    }
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        continue;
                    }
                },
            };

            self.serve_client(client).await;
            self.client_disconnected().await;
        }
    }

    async fn serve_client(&mut self, mut stream: TcpStream) {
        self.reader.clear();
        let mut read_buf = vec![0u8; 4096];
        let mut last_msg = Instant::now();
        let mut heartbeat = time::interval_at(
            Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );

        loop {
            select! {
                _ = self.subsys.on_shutdown_requested() => return,

                // Only one client at a time; later connects are turned away.
                accepted = self.listener.accept() => {
                    if let Ok((_, peer)) = accepted {
                        info!("Only one client allowed. Disconnecting {peer}...");
                    }
                }

                read = stream.read(&mut read_buf) => {
                    let n = match read {
                        Ok(0) => {
                            info!("Client disconnected");
                            return;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            warn!("Client read error: {e}");
                            return;
                        }
                    };
                    last_msg = Instant::now();
                    self.reader.extend(&read_buf[..n]);
                    loop {
                        match self.reader.next_msg() {
                            Ok(Some(msg)) => {
                                if !self.handle_msg(msg).await {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Dropping client: {e}");
                                return;
                            }
                        }
                    }
                }

                Some(event) = self.rx.events.recv() => {
                    if !self.forward_rx_event(event, &mut stream).await {
                        return;
                    }
                }

                Some(event) = self.tx.events.recv() => {
                    let msg = match event {
                        TxEvent::Timeout => TrxMsg::TxTimeout,
                        TxEvent::TransmitterStateChange(on) => {
                            TrxMsg::TransmitterStateChange(on)
                        }
                        TxEvent::AllSamplesFlushed => TrxMsg::AllSamplesFlushed,
                    };
                    if !send_msg(&mut stream, &msg).await {
                        return;
                    }
                }

                _ = heartbeat.tick() => {
                    if last_msg.elapsed() > SILENCE_TIMEOUT {
                        warn!("Heartbeat timeout");
                        return;
                    }
                    if !send_msg(&mut stream, &TrxMsg::Heartbeat).await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns false when the client must be dropped.
    async fn handle_msg(&mut self, msg: TrxMsg) -> bool {
        match msg {
            TrxMsg::Heartbeat | TrxMsg::Auth => {}
            TrxMsg::Mute(mute) => {
                info!("Mute({mute})");
                self.rx.commands.send(RxCommand::Mute(mute)).await.ok();
            }
            TrxMsg::AddToneDetector(spec) => {
                info!(
                    "AddToneDetector({}, {}, {})",
                    spec.fq, spec.bw, spec.required_duration
                );
                self.rx
                    .commands
                    .send(RxCommand::AddToneDetector(spec))
                    .await
                    .ok();
            }
            TrxMsg::SetTxCtrlMode(mode) => {
                self.tx
                    .commands
                    .send(TxCommand::SetCtrlMode(mode))
                    .await
                    .ok();
            }
            TrxMsg::EnableCtcss(enable) => {
                self.tx
                    .commands
                    .send(TxCommand::EnableCtcss(enable))
                    .await
                    .ok();
            }
            TrxMsg::SendDtmf {
                digits,
                duration_ms,
            } => {
                self.tx
                    .commands
                    .send(TxCommand::SendDtmf {
                        digits,
                        duration_ms,
                    })
                    .await
                    .ok();
            }
            TrxMsg::Audio(samples) => {
                let floats: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();
                self.fifo.write(&floats);
                if !self.fifo.is_empty() {
                    let chunk = self.fifo.drain();
                    self.tx.commands.send(TxCommand::Audio(chunk)).await.ok();
                }
            }
            TrxMsg::Flush => {
                if !self.fifo.is_empty() {
                    let chunk = self.fifo.drain();
                    self.tx.commands.send(TxCommand::Audio(chunk)).await.ok();
                }
                self.tx.commands.send(TxCommand::Flush).await.ok();
            }
            TrxMsg::Unknown { msg_type } => {
                warn!("Unknown TCP message received. type={msg_type}");
            }
            other => {
                warn!("Unexpected inbound message: {other:?}");
            }
        }
        true
    }

    async fn forward_rx_event(&mut self, event: RxEvent, stream: &mut TcpStream) -> bool {
        match event {
            RxEvent::Squelch {
                open,
                siglev,
                rx_id,
            } => {
                send_msg(
                    stream,
                    &TrxMsg::Squelch {
                        open,
                        siglev,
                        rx_id,
                    },
                )
                .await
            }
            RxEvent::Audio(samples) => {
                let ints: Vec<i16> = samples
                    .iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                    .collect();
                for chunk in ints.chunks(MAX_COUNT) {
                    if !send_msg(stream, &TrxMsg::Audio(chunk.to_vec())).await {
                        return false;
                    }
                }
                true
            }
            RxEvent::Dtmf { digit, duration_ms } => {
                info!("DTMF digit detected: {digit} with duration {duration_ms} milliseconds");
                send_msg(stream, &TrxMsg::Dtmf { digit, duration_ms }).await
            }
            RxEvent::Tone(fq) => {
                info!("Tone detected: {fq}");
                send_msg(stream, &TrxMsg::Tone(fq)).await
            }
            // Selcall sequences have no message on this link.
            RxEvent::Selcall(_) => true,
        }
    }

    /// Post-disconnect cleanup: reset the RX, mute the TX path.
    async fn client_disconnected(&mut self) {
        self.rx.commands.send(RxCommand::Reset).await.ok();
        self.tx
            .commands
            .send(TxCommand::EnableCtcss(false))
            .await
            .ok();
        self.fifo.clear();
        self.tx.commands.send(TxCommand::Flush).await.ok();
        self.tx
            .commands
            .send(TxCommand::SetCtrlMode(crate::trx::TxCtrlMode::Off))
            .await
            .ok();
    }
}

async fn send_msg(stream: &mut TcpStream, msg: &TrxMsg) -> bool {
    if let Err(e) = stream.write_all(&msg.encode()).await {
        warn!("TCP transmit error: {e}");
        false
    } else {
        true
    }
}
