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

//! The proxy tunnel client.
//!
//! A single authenticated TCP connection to a proxy host carries one
//! virtual TCP connection (to the directory server) and any number of UDP
//! datagrams (audio and control). On connect the proxy sends an 8 byte
//! nonce; the client answers with its callsign, a newline and the MD5
//! digest of the upper-cased password concatenated with the nonce. Each
//! subsequent message is framed `{type: u8, remote_ip: 4 bytes, length:
//! u32 LE, payload}`.

use crate::{
    config::ProxyConfig,
    error::{EchoError, EchoResult},
};
use md5::{Digest, Md5};
use rand::Rng;
use std::{net::Ipv4Addr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::{mpsc, oneshot, watch},
    time::{sleep, timeout},
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{error, info, instrument, warn};

pub const NONCE_SIZE: usize = 8;
pub const MSG_HEADER_SIZE: usize = 9;
/// Handshake watchdog.
pub const CMD_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between reconnect attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

const MAX_MSG_LEN: usize = 65536;

const MSG_TYPE_TCP_OPEN: u8 = 1;
const MSG_TYPE_TCP_DATA: u8 = 2;
const MSG_TYPE_TCP_CLOSE: u8 = 3;
const MSG_TYPE_TCP_STATUS: u8 = 4;
const MSG_TYPE_UDP_DATA: u8 = 5;
const MSG_TYPE_UDP_CONTROL: u8 = 6;
const MSG_TYPE_SYSTEM: u8 = 7;

const SYSTEM_BAD_PASSWORD: u8 = 1;
const SYSTEM_ACCESS_DENIED: u8 = 2;

/// Build the authentication reply for the given nonce. An empty password
/// selects the public-proxy convention `"PUBLIC"`; passwords go out
/// upper-cased.
pub fn auth_message(callsign: &str, password: &str, nonce: &[u8]) -> Vec<u8> {
    let password = if password.is_empty() {
        "PUBLIC".to_owned()
    } else {
        password.to_ascii_uppercase()
    };
    let mut digest_input = Vec::with_capacity(password.len() + nonce.len());
    digest_input.extend_from_slice(password.as_bytes());
    digest_input.extend_from_slice(nonce);

    let mut msg = Vec::with_capacity(callsign.len() + 1 + 16);
    msg.extend_from_slice(callsign.as_bytes());
    msg.push(b'\n');
    msg.extend_from_slice(&Md5::digest(&digest_input));
    msg
}

fn encode_frame(msg_type: u8, remote_ip: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MSG_HEADER_SIZE + payload.len());
    buf.push(msg_type);
    buf.extend_from_slice(&remote_ip.octets());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[derive(Debug, PartialEq)]
struct ProxyFrame {
    msg_type: u8,
    remote_ip: Ipv4Addr,
    payload: Vec<u8>,
}

/// Receive accumulator over the proxy TCP stream.
#[derive(Debug, Default)]
struct ProxyFrameReader {
    buf: Vec<u8>,
}

impl ProxyFrameReader {
    fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn next_frame(&mut self) -> EchoResult<Option<ProxyFrame>> {
        if self.buf.len() < MSG_HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]]) as usize;
        if len > MAX_MSG_LEN {
            return Err(EchoError::ProtocolViolation(format!(
                "proxy message length {len} exceeds {MAX_MSG_LEN}"
            )));
        }
        if self.buf.len() < MSG_HEADER_SIZE + len {
            return Ok(None);
        }
        let msg_type = self.buf[0];
        let remote_ip = Ipv4Addr::new(self.buf[1], self.buf[2], self.buf[3], self.buf[4]);
        let payload = self.buf[MSG_HEADER_SIZE..MSG_HEADER_SIZE + len].to_vec();
        self.buf.drain(..MSG_HEADER_SIZE + len);
        Ok(Some(ProxyFrame {
            msg_type,
            remote_ip,
            payload,
        }))
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug)]
pub enum ProxyCommand {
    TcpOpen {
        remote_ip: Ipv4Addr,
        /// Resolves false when the open is refused (tunnel tearing down).
        reply: oneshot::Sender<bool>,
    },
    TcpData(Vec<u8>),
    TcpClose,
    UdpData { ip: Ipv4Addr, data: Vec<u8> },
    UdpCtrl { ip: Ipv4Addr, data: Vec<u8> },
    Reset,
}

#[derive(Debug, PartialEq)]
pub enum ProxyTcpEvent {
    Connected,
    Disconnected,
    Data(Vec<u8>),
    Status(u32),
}

/// Cloneable command side of the proxy client.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    commands: mpsc::Sender<ProxyCommand>,
}

impl ProxyHandle {
    /// Request the virtual TCP connection. Resolves false when the proxy is
    /// gone or the open is refused because the tunnel is still tearing
    /// down, so callers fail immediately instead of waiting for a
    /// connection event that never comes.
    pub async fn tcp_open(&self, remote_ip: Ipv4Addr) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(ProxyCommand::TcpOpen {
                remote_ip,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    pub async fn tcp_data(&self, data: Vec<u8>) -> bool {
        self.commands
            .send(ProxyCommand::TcpData(data))
            .await
            .is_ok()
    }

    pub async fn tcp_close(&self) -> bool {
        self.commands.send(ProxyCommand::TcpClose).await.is_ok()
    }

    pub async fn udp_data(&self, ip: Ipv4Addr, data: Vec<u8>) -> bool {
        self.commands
            .send(ProxyCommand::UdpData { ip, data })
            .await
            .is_ok()
    }

    pub async fn udp_ctrl(&self, ip: Ipv4Addr, data: Vec<u8>) -> bool {
        self.commands
            .send(ProxyCommand::UdpCtrl { ip, data })
            .await
            .is_ok()
    }

    pub async fn reset(&self) -> bool {
        self.commands.send(ProxyCommand::Reset).await.is_ok()
    }
}

/// Event side of the proxy client, owned by the dispatcher (UDP paths) and
/// the directory connection (virtual TCP path).
#[derive(Debug)]
pub struct ProxyEvents {
    pub tcp: mpsc::Receiver<ProxyTcpEvent>,
    pub udp_data: mpsc::Receiver<(Ipv4Addr, Vec<u8>)>,
    pub udp_ctrl: mpsc::Receiver<(Ipv4Addr, Vec<u8>)>,
    pub ready: watch::Receiver<bool>,
}

pub fn start_proxy(subsys: &SubsystemHandle, config: ProxyConfig) -> (ProxyHandle, ProxyEvents) {
    let (command_tx, command_rx) = mpsc::channel(256);
    let (tcp_tx, tcp_rx) = mpsc::channel(256);
    let (udp_data_tx, udp_data_rx) = mpsc::channel(256);
    let (udp_ctrl_tx, udp_ctrl_rx) = mpsc::channel(256);
    let (ready_tx, ready_rx) = watch::channel(false);

    subsys.start(SubsystemBuilder::new("proxy", move |s| {
        ProxyActor {
            subsys: s,
            config,
            commands: command_rx,
            tcp_events: tcp_tx,
            udp_data: udp_data_tx,
            udp_ctrl: udp_ctrl_tx,
            ready: ready_tx,
            tunnel_state: TunnelState::Disconnected,
            reader: ProxyFrameReader::default(),
        }
        .run()
    }));

    (
        ProxyHandle {
            commands: command_tx,
        },
        ProxyEvents {
            tcp: tcp_rx,
            udp_data: udp_data_rx,
            udp_ctrl: udp_ctrl_rx,
            ready: ready_rx,
        },
    )
}

struct ProxyActor {
    subsys: SubsystemHandle,
    config: ProxyConfig,
    commands: mpsc::Receiver<ProxyCommand>,
    tcp_events: mpsc::Sender<ProxyTcpEvent>,
    udp_data: mpsc::Sender<(Ipv4Addr, Vec<u8>)>,
    udp_ctrl: mpsc::Sender<(Ipv4Addr, Vec<u8>)>,
    ready: watch::Sender<bool>,
    tunnel_state: TunnelState,
    reader: ProxyFrameReader,
}

impl ProxyActor {
    async fn run(mut self) -> EchoResult<()> {
        loop {
            match self.session().await {
                Ok(()) => return Ok(()),
                Err(e) => warn!("Proxy session ended: {e}"),
            }

            self.disconnect_handler().await;

            // Reconnect with a little jitter so restarting fleets do not
            // stampede the proxy.
            let jitter = rand::rng().random_range(0..500);
            select! {
                _ = self.subsys.on_shutdown_requested() => return Ok(()),
                _ = sleep(RECONNECT_INTERVAL + Duration::from_millis(jitter)) => {}
            }
        }
    }

    /// One full proxy session: connect, authenticate, pump frames. Returns
    /// `Ok(())` only on shutdown; every error path bubbles up for reconnect.
    #[instrument(skip(self), fields(host = %self.config.host, port = self.config.port))]
    async fn session(&mut self) -> EchoResult<()> {
        let mut stream = TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| EchoError::TransportDown(format!("proxy connect failed: {e}")))?;

        info!(
            "Connected to proxy {}:{}",
            self.config.host, self.config.port
        );

        let mut nonce = [0u8; NONCE_SIZE];
        timeout(CMD_TIMEOUT, stream.read_exact(&mut nonce))
            .await
            .map_err(|_| EchoError::Timeout("proxy handshake".to_owned()))?
            .map_err(|e| EchoError::TransportDown(format!("proxy nonce read failed: {e}")))?;

        let auth = auth_message(&self.config.callsign, &self.config.password, &nonce);
        stream
            .write_all(&auth)
            .await
            .map_err(|e| EchoError::TransportDown(format!("proxy auth write failed: {e}")))?;

        info!(
            "Proxy authentication sent (nonce {}), session up",
            hex::encode(nonce)
        );
        self.reader.clear();
        self.ready.send_replace(true);

        let mut read_buf = vec![0u8; 16384];
        loop {
            select! {
                _ = self.subsys.on_shutdown_requested() => return Ok(()),
                read = stream.read(&mut read_buf) => {
                    let n = read.map_err(|e| {
                        EchoError::TransportDown(format!("proxy read failed: {e}"))
                    })?;
                    if n == 0 {
                        return Err(EchoError::TransportDown(
                            "proxy closed the connection".to_owned(),
                        ));
                    }
                    self.reader.extend(&read_buf[..n]);
                    while let Some(frame) = self.reader.next_frame()? {
                        self.handle_frame(frame).await?;
                    }
                }
                Some(cmd) = self.commands.recv() => {
                    self.handle_command(cmd, &mut stream).await?;
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        cmd: ProxyCommand,
        stream: &mut TcpStream,
    ) -> EchoResult<()> {
        let mut open_reply = None;
        let frame = match cmd {
            ProxyCommand::TcpOpen { remote_ip, reply } => {
                if self.tunnel_state == TunnelState::Disconnecting {
                    // An open during teardown is an immediate error for the
                    // caller, not a silent no-op.
                    warn!("TCP open requested while tunnel is disconnecting");
                    reply.send(false).ok();
                    return Ok(());
                }
                if self.tunnel_state != TunnelState::Disconnected {
                    reply.send(true).ok();
                    return Ok(());
                }
                self.tunnel_state = TunnelState::Connecting;
                open_reply = Some(reply);
                encode_frame(MSG_TYPE_TCP_OPEN, remote_ip, &[])
            }
            ProxyCommand::TcpData(data) => {
                if self.tunnel_state != TunnelState::Connected {
                    warn!("Dropping TCP data, tunnel not connected");
                    return Ok(());
                }
                encode_frame(MSG_TYPE_TCP_DATA, Ipv4Addr::UNSPECIFIED, &data)
            }
            ProxyCommand::TcpClose => {
                if self.tunnel_state == TunnelState::Disconnected
                    || self.tunnel_state == TunnelState::Disconnecting
                {
                    return Ok(());
                }
                self.tunnel_state = TunnelState::Disconnecting;
                encode_frame(MSG_TYPE_TCP_CLOSE, Ipv4Addr::UNSPECIFIED, &[])
            }
            ProxyCommand::UdpData { ip, data } => encode_frame(MSG_TYPE_UDP_DATA, ip, &data),
            ProxyCommand::UdpCtrl { ip, data } => encode_frame(MSG_TYPE_UDP_CONTROL, ip, &data),
            ProxyCommand::Reset => {
                return Err(EchoError::TransportDown("proxy reset requested".to_owned()));
            }
        };

        stream
            .write_all(&frame)
            .await
            .map_err(|e| EchoError::TransportDown(format!("proxy write failed: {e}")))?;
        // Only acknowledge the open once the frame is actually on the wire;
        // a failed write drops the sender and the caller sees a refusal.
        if let Some(reply) = open_reply {
            reply.send(true).ok();
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: ProxyFrame) -> EchoResult<()> {
        match frame.msg_type {
            MSG_TYPE_TCP_OPEN => Err(EchoError::ProtocolViolation(
                "TCP_OPEN received from proxy server".to_owned(),
            )),
            MSG_TYPE_TCP_DATA => {
                if self.tunnel_state != TunnelState::Connected {
                    return Err(EchoError::ProtocolViolation(
                        "TCP data received but no tunnel is open".to_owned(),
                    ));
                }
                if !frame.payload.is_empty() {
                    self.tcp_events
                        .send(ProxyTcpEvent::Data(frame.payload))
                        .await
                        .ok();
                }
                Ok(())
            }
            MSG_TYPE_TCP_CLOSE => {
                if !frame.payload.is_empty() {
                    return Err(EchoError::ProtocolViolation(
                        "wrong size for TCP_CLOSE message".to_owned(),
                    ));
                }
                if self.tunnel_state != TunnelState::Disconnected {
                    self.tunnel_state = TunnelState::Disconnected;
                    self.tcp_events.send(ProxyTcpEvent::Disconnected).await.ok();
                }
                Ok(())
            }
            MSG_TYPE_TCP_STATUS => {
                if frame.payload.len() != 4 {
                    return Err(EchoError::ProtocolViolation(
                        "wrong size for TCP_STATUS message".to_owned(),
                    ));
                }
                let status = u32::from_le_bytes([
                    frame.payload[0],
                    frame.payload[1],
                    frame.payload[2],
                    frame.payload[3],
                ]);
                self.tcp_events
                    .send(ProxyTcpEvent::Status(status))
                    .await
                    .ok();
                if self.tunnel_state == TunnelState::Connecting {
                    if status == 0 {
                        self.tunnel_state = TunnelState::Connected;
                        self.tcp_events.send(ProxyTcpEvent::Connected).await.ok();
                    } else {
                        error!("The directory connection through the proxy was refused");
                        self.tunnel_state = TunnelState::Disconnected;
                        self.tcp_events.send(ProxyTcpEvent::Disconnected).await.ok();
                    }
                }
                Ok(())
            }
            MSG_TYPE_UDP_DATA => {
                if !frame.payload.is_empty() {
                    self.udp_data
                        .send((frame.remote_ip, frame.payload))
                        .await
                        .ok();
                }
                Ok(())
            }
            MSG_TYPE_UDP_CONTROL => {
                if !frame.payload.is_empty() {
                    self.udp_ctrl
                        .send((frame.remote_ip, frame.payload))
                        .await
                        .ok();
                }
                Ok(())
            }
            MSG_TYPE_SYSTEM => {
                if frame.payload.len() != 1 {
                    return Err(EchoError::ProtocolViolation(
                        "malformed SYSTEM message block".to_owned(),
                    ));
                }
                match frame.payload[0] {
                    SYSTEM_BAD_PASSWORD => {
                        Err(EchoError::AuthFailed("bad proxy password".to_owned()))
                    }
                    SYSTEM_ACCESS_DENIED => {
                        Err(EchoError::AuthFailed("access denied to proxy".to_owned()))
                    }
                    other => Err(EchoError::ProtocolViolation(format!(
                        "unknown SYSTEM message: {other}"
                    ))),
                }
            }
            other => Err(EchoError::ProtocolViolation(format!(
                "unknown proxy message type: {other}"
            ))),
        }
    }

    async fn disconnect_handler(&mut self) {
        self.ready.send_replace(false);
        self.reader.clear();
        if self.tunnel_state != TunnelState::Disconnected {
            self.tunnel_state = TunnelState::Disconnected;
            self.tcp_events.send(ProxyTcpEvent::Disconnected).await.ok();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_graceful_shutdown::Toplevel;

    #[tokio::test]
    async fn tcp_open_while_disconnecting_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        // A fake proxy server: hand out a nonce, then swallow everything.
        let _server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            stream.write_all(&[0u8; NONCE_SIZE]).await.expect("nonce");
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        let (handle_tx, handle_rx) = oneshot::channel();
        let toplevel = Toplevel::new(move |s| async move {
            let config = crate::config::ProxyConfig {
                host: "127.0.0.1".to_owned(),
                port,
                callsign: "SM0A".to_owned(),
                password: "pw".to_owned(),
            };
            handle_tx.send(start_proxy(&s, config)).ok();
        });
        tokio::spawn(async move {
            toplevel
                .handle_shutdown_requests(Duration::from_millis(100))
                .await
                .ok();
        });
        let (handle, mut events) = handle_rx.await.expect("no handle");
        events.ready.wait_for(|ready| *ready).await.expect("ready");

        let ip = Ipv4Addr::new(10, 0, 0, 1);
        assert!(handle.tcp_open(ip).await);

        // Tear the tunnel down and immediately open again: the second open
        // is refused while the close is still in flight instead of leaving
        // the caller waiting for a connection event.
        handle.tcp_close().await;
        assert!(!handle.tcp_open(ip).await);
    }

    #[test]
    fn auth_message_uppercases_the_password() {
        let nonce = [0u8, 1, 2, 3, 4, 5, 6, 7];
        let msg = auth_message("SM0A", "pw", &nonce);

        let mut expected = b"SM0A\n".to_vec();
        let mut digest_input = b"PW".to_vec();
        digest_input.extend_from_slice(&nonce);
        expected.extend_from_slice(&Md5::digest(&digest_input));

        assert_eq!(expected, msg);
        assert_eq!("SM0A".len() + 1 + 16, msg.len());
    }

    #[test]
    fn empty_password_becomes_public() {
        let nonce = [9u8; NONCE_SIZE];
        let msg = auth_message("SM0A", "", &nonce);
        let mut digest_input = b"PUBLIC".to_vec();
        digest_input.extend_from_slice(&nonce);
        assert_eq!(&msg[5..], Md5::digest(&digest_input).as_slice());
    }

    #[test]
    fn frames_round_trip_through_the_reader() {
        let ip = Ipv4Addr::new(10, 1, 2, 3);
        let frame = encode_frame(MSG_TYPE_UDP_DATA, ip, b"payload");
        assert_eq!(MSG_HEADER_SIZE + 7, frame.len());

        let mut reader = ProxyFrameReader::default();
        // Two frames, fed byte by byte.
        for &b in frame.iter().chain(frame.iter()) {
            reader.extend(&[b]);
        }
        for _ in 0..2 {
            let parsed = reader.next_frame().expect("parse").expect("incomplete");
            assert_eq!(MSG_TYPE_UDP_DATA, parsed.msg_type);
            assert_eq!(ip, parsed.remote_ip);
            assert_eq!(b"payload".to_vec(), parsed.payload);
        }
        assert!(reader.next_frame().expect("parse").is_none());
    }

    #[test]
    fn oversized_proxy_message_is_rejected() {
        let mut reader = ProxyFrameReader::default();
        let mut frame = vec![MSG_TYPE_TCP_DATA, 0, 0, 0, 0];
        frame.extend_from_slice(&(MAX_MSG_LEN as u32 + 1).to_le_bytes());
        reader.extend(&frame);
        assert!(reader.next_frame().is_err());
    }

    #[test]
    fn tcp_status_zero_means_connected() {
        let frame = encode_frame(MSG_TYPE_TCP_STATUS, Ipv4Addr::UNSPECIFIED, &0u32.to_le_bytes());
        let mut reader = ProxyFrameReader::default();
        reader.extend(&frame);
        let parsed = reader.next_frame().expect("parse").expect("incomplete");
        assert_eq!(MSG_TYPE_TCP_STATUS, parsed.msg_type);
        assert_eq!(vec![0, 0, 0, 0], parsed.payload);
    }
}
