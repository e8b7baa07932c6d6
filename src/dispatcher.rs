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

//! The UDP demultiplexer. Listens on the audio port (`port_base`) and the
//! control port (`port_base + 1`), routes inbound datagrams to the session
//! registered for the remote address and surfaces unsolicited SDES packets
//! as incoming-connection indications. Outbound traffic goes through the
//! proxy tunnel when one is configured, directly over UDP otherwise.
//!
//! The dispatcher is constructed once per process by the runtime that owns
//! it and handed to every peer session; there are no hidden globals.

use crate::{
    error::{EchoError, EchoResult},
    proxy::ProxyHandle,
    rtcp::{self, SDES_NAME, SDES_PRIV},
};
use dashmap::DashMap;
use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::{net::UdpSocket, select, sync::mpsc};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{info, instrument, warn};

pub const DEFAULT_PORT_BASE: u16 = 5198;

/// An unsolicited SDES packet from an address without a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingConnection {
    pub ip: Ipv4Addr,
    pub callsign: String,
    pub name: String,
    pub priv_item: String,
}

#[derive(Debug)]
struct SessionPorts {
    ctrl: mpsc::Sender<Vec<u8>>,
    audio: mpsc::Sender<Vec<u8>>,
}

/// Inbound packet streams of one registered session.
#[derive(Debug)]
pub struct SessionRx {
    pub ctrl: mpsc::Receiver<Vec<u8>>,
    pub audio: mpsc::Receiver<Vec<u8>>,
}

/// Outbound path shared by all sessions.
#[derive(Clone)]
pub enum LinkSender {
    Direct {
        audio: Arc<UdpSocket>,
        ctrl: Arc<UdpSocket>,
        port_base: u16,
    },
    Proxy(ProxyHandle),
}

impl std::fmt::Debug for LinkSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkSender::Direct { port_base, .. } => {
                write!(f, "LinkSender::Direct(port_base={port_base})")
            }
            LinkSender::Proxy(_) => write!(f, "LinkSender::Proxy"),
        }
    }
}

impl LinkSender {
    pub async fn send_ctrl(&self, to: Ipv4Addr, buf: &[u8]) -> EchoResult<()> {
        match self {
            LinkSender::Direct {
                ctrl, port_base, ..
            } => {
                ctrl.send_to(buf, SocketAddr::new(IpAddr::V4(to), port_base + 1))
                    .await?;
                Ok(())
            }
            LinkSender::Proxy(proxy) => {
                if proxy.udp_ctrl(to, buf.to_vec()).await {
                    Ok(())
                } else {
                    Err(EchoError::TransportDown("proxy gone".to_owned()))
                }
            }
        }
    }

    pub async fn send_audio(&self, to: Ipv4Addr, buf: &[u8]) -> EchoResult<()> {
        match self {
            LinkSender::Direct {
                audio, port_base, ..
            } => {
                audio
                    .send_to(buf, SocketAddr::new(IpAddr::V4(to), *port_base))
                    .await?;
                Ok(())
            }
            LinkSender::Proxy(proxy) => {
                if proxy.udp_data(to, buf.to_vec()).await {
                    Ok(())
                } else {
                    Err(EchoError::TransportDown("proxy gone".to_owned()))
                }
            }
        }
    }
}

/// Registry plus outbound path; cheap to clone, one per peer session.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    registry: Arc<DashMap<Ipv4Addr, SessionPorts>>,
    link: LinkSender,
}

impl DispatcherHandle {
    /// Register a session for `ip`. At most one session per remote address.
    pub fn register_session(&self, ip: Ipv4Addr) -> EchoResult<SessionRx> {
        if self.registry.contains_key(&ip) {
            return Err(EchoError::InvalidArgument(format!(
                "a session for {ip} is already registered"
            )));
        }
        let (ctrl_tx, ctrl_rx) = mpsc::channel(64);
        let (audio_tx, audio_rx) = mpsc::channel(256);
        self.registry.insert(
            ip,
            SessionPorts {
                ctrl: ctrl_tx,
                audio: audio_tx,
            },
        );
        Ok(SessionRx {
            ctrl: ctrl_rx,
            audio: audio_rx,
        })
    }

    pub fn unregister_session(&self, ip: Ipv4Addr) {
        self.registry.remove(&ip);
    }

    pub fn link(&self) -> LinkSender {
        self.link.clone()
    }
}

/// The UDP half of the proxy tunnel, handed to the dispatcher when a proxy
/// is configured. The virtual-TCP half stays with the directory client.
#[derive(Debug)]
pub struct ProxyUdp {
    pub handle: ProxyHandle,
    pub data: mpsc::Receiver<(Ipv4Addr, Vec<u8>)>,
    pub ctrl: mpsc::Receiver<(Ipv4Addr, Vec<u8>)>,
}

/// Start the dispatcher subsystem. With `proxy` set, both UDP paths tunnel
/// through it and no local sockets are bound.
pub async fn start_dispatcher(
    subsys: &SubsystemHandle,
    bind_addr: IpAddr,
    port_base: u16,
    proxy: Option<ProxyUdp>,
) -> EchoResult<(DispatcherHandle, mpsc::Receiver<IncomingConnection>)> {
    let registry: Arc<DashMap<Ipv4Addr, SessionPorts>> = Arc::new(DashMap::new());
    let (incoming_tx, incoming_rx) = mpsc::channel(16);

    let handle = match proxy {
        Some(proxy) => {
            let handle = DispatcherHandle {
                registry: registry.clone(),
                link: LinkSender::Proxy(proxy.handle.clone()),
            };
            subsys.start(SubsystemBuilder::new("dispatcher", move |s| {
                run_proxied(s, registry, proxy, incoming_tx)
            }));
            handle
        }
        None => {
            let audio = Arc::new(create_udp_socket(bind_addr, port_base)?);
            let ctrl = Arc::new(create_udp_socket(bind_addr, port_base + 1)?);
            info!(
                "Listening for EchoLink audio on port {} and control on port {}",
                port_base,
                port_base + 1
            );
            let handle = DispatcherHandle {
                registry: registry.clone(),
                link: LinkSender::Direct {
                    audio: audio.clone(),
                    ctrl: ctrl.clone(),
                    port_base,
                },
            };
            subsys.start(SubsystemBuilder::new("dispatcher", move |s| {
                run_direct(s, registry, audio, ctrl, incoming_tx)
            }));
            handle
        }
    };

    Ok((handle, incoming_rx))
}

fn create_udp_socket(bind_addr: IpAddr, port: u16) -> EchoResult<UdpSocket> {
    let domain = match bind_addr {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(SocketAddr::new(bind_addr, port)))?;
    Ok(UdpSocket::from_std(socket.into())?)
}

async fn run_direct(
    subsys: SubsystemHandle,
    registry: Arc<DashMap<Ipv4Addr, SessionPorts>>,
    audio: Arc<UdpSocket>,
    ctrl: Arc<UdpSocket>,
    incoming: mpsc::Sender<IncomingConnection>,
) -> EchoResult<()> {
    let mut audio_buf = vec![0u8; 4096];
    let mut ctrl_buf = vec![0u8; 4096];
    loop {
        select! {
            recv = audio.recv_from(&mut audio_buf) => {
                let (len, addr) = recv?;
                if let IpAddr::V4(ip) = addr.ip() {
                    audio_received(&registry, ip, &audio_buf[..len]).await;
                }
            }
            recv = ctrl.recv_from(&mut ctrl_buf) => {
                let (len, addr) = recv?;
                if let IpAddr::V4(ip) = addr.ip() {
                    ctrl_received(&registry, &incoming, ip, &ctrl_buf[..len]).await;
                }
            }
            _ = subsys.on_shutdown_requested() => return Ok(()),
        }
    }
}

async fn run_proxied(
    subsys: SubsystemHandle,
    registry: Arc<DashMap<Ipv4Addr, SessionPorts>>,
    mut proxy: ProxyUdp,
    incoming: mpsc::Sender<IncomingConnection>,
) -> EchoResult<()> {
    loop {
        select! {
            Some((ip, data)) = proxy.data.recv() => {
                audio_received(&registry, ip, &data).await;
            }
            Some((ip, data)) = proxy.ctrl.recv() => {
                ctrl_received(&registry, &incoming, ip, &data).await;
            }
            _ = subsys.on_shutdown_requested() => return Ok(()),
            else => return Ok(()),
        }
    }
}

async fn audio_received(registry: &DashMap<Ipv4Addr, SessionPorts>, ip: Ipv4Addr, data: &[u8]) {
    let sender = registry.get(&ip).map(|ports| ports.audio.clone());
    match sender {
        Some(sender) => {
            sender.send(data.to_vec()).await.ok();
        }
        None => warn!("Spurious audio packet received from {ip}"),
    }
}

#[instrument(skip(registry, incoming, data))]
async fn ctrl_received(
    registry: &DashMap<Ipv4Addr, SessionPorts>,
    incoming: &mpsc::Sender<IncomingConnection>,
    ip: Ipv4Addr,
    data: &[u8],
) {
    let sender = registry.get(&ip).map(|ports| ports.ctrl.clone());
    if let Some(sender) = sender {
        sender.send(data.to_vec()).await.ok();
        return;
    }

    // No session: an SDES with a parseable NAME announces an incoming
    // connection.
    if rtcp::is_sdes(data) {
        if let Some(name_item) = rtcp::parse_sdes(data, SDES_NAME) {
            if let Some((callsign, name)) = rtcp::split_name_item(&name_item) {
                let priv_item = rtcp::parse_sdes(data, SDES_PRIV).unwrap_or_default();
                info!("Incoming connection from {callsign} ({ip})");
                incoming
                    .send(IncomingConnection {
                        ip,
                        callsign,
                        name,
                        priv_item,
                    })
                    .await
                    .ok();
            }
        }
    } else {
        warn!("Spurious ctrl packet received from {ip}");
    }
}
