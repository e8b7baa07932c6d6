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

//! Transport of the directory client. Resolves the configured server names
//! into one merged address pool that is tried round-robin: every disconnect
//! advances to the next address, and an exhausted pool is re-resolved on
//! the next connect. The connection either goes directly over TCP or
//! through the proxy tunnel's virtual TCP.

use crate::{
    error::{EchoError, EchoResult},
    proxy::{ProxyHandle, ProxyTcpEvent},
};
use std::net::{IpAddr, Ipv4Addr};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, lookup_host},
    sync::mpsc,
    time::{Duration, timeout},
};
use tracing::{info, warn};

pub const DIRECTORY_SERVER_PORT: u16 = 5200;

enum Transport {
    Direct { stream: Option<TcpStream> },
    Proxy {
        handle: ProxyHandle,
        events: mpsc::Receiver<ProxyTcpEvent>,
        tunnel_up: bool,
    },
}

pub struct DirectoryCon {
    servers: Vec<String>,
    port: u16,
    addresses: Vec<Ipv4Addr>,
    current: usize,
    transport: Transport,
}

impl DirectoryCon {
    pub fn new(servers: Vec<String>, port: u16) -> Self {
        Self {
            servers,
            port,
            addresses: Vec::new(),
            current: 0,
            transport: Transport::Direct { stream: None },
        }
    }

    /// Route through an authenticated proxy tunnel instead of direct TCP.
    pub fn via_proxy(
        servers: Vec<String>,
        port: u16,
        handle: ProxyHandle,
        events: mpsc::Receiver<ProxyTcpEvent>,
    ) -> Self {
        Self {
            servers,
            port,
            addresses: Vec::new(),
            current: 0,
            transport: Transport::Proxy {
                handle,
                events,
                tunnel_up: false,
            },
        }
    }

    async fn resolve_pool(&mut self) -> EchoResult<()> {
        let mut addresses = Vec::new();
        for server in &self.servers {
            match lookup_host((server.as_str(), self.port)).await {
                Ok(addrs) => {
                    for addr in addrs {
                        if let IpAddr::V4(ip) = addr.ip() {
                            addresses.push(ip);
                        }
                    }
                }
                Err(e) => warn!("DNS lookup of {server} failed: {e}"),
            }
        }
        if addresses.is_empty() {
            return Err(EchoError::TransportDown(
                "no IP addresses were returned for the directory server DNS query".to_owned(),
            ));
        }
        self.addresses = addresses;
        self.current = 0;
        Ok(())
    }

    /// Advance the pool to the next address; clear it when exhausted so the
    /// next connect re-resolves.
    pub fn advance(&mut self) {
        self.current += 1;
        if self.current >= self.addresses.len() {
            self.addresses.clear();
            self.current = 0;
        }
    }

    pub async fn connect(&mut self) -> EchoResult<()> {
        if self.addresses.is_empty() {
            self.resolve_pool().await?;
        }
        let ip = self.addresses[self.current];

        match &mut self.transport {
            Transport::Direct { stream } => {
                let connected = TcpStream::connect((IpAddr::V4(ip), self.port))
                    .await
                    .map_err(|e| {
                        EchoError::TransportDown(format!("connect to {ip} failed: {e}"))
                    })?;
                info!("Connected to directory server {ip}");
                *stream = Some(connected);
                Ok(())
            }
            Transport::Proxy {
                handle,
                events,
                tunnel_up,
            } => {
                if !handle.tcp_open(ip).await {
                    return Err(EchoError::TransportDown(
                        "proxy TCP open refused".to_owned(),
                    ));
                }
                // The proxy answers with a status once the remote end is
                // reachable (or not).
                loop {
                    let event = timeout(Duration::from_secs(30), events.recv())
                        .await
                        .map_err(|_| {
                            EchoError::Timeout("proxy TCP open".to_owned())
                        })?
                        .ok_or_else(|| EchoError::TransportDown("proxy gone".to_owned()))?;
                    match event {
                        ProxyTcpEvent::Connected => {
                            *tunnel_up = true;
                            info!("Connected to directory server {ip} via proxy");
                            return Ok(());
                        }
                        ProxyTcpEvent::Disconnected => {
                            return Err(EchoError::TransportDown(
                                "directory connection via proxy refused".to_owned(),
                            ));
                        }
                        ProxyTcpEvent::Status(_) | ProxyTcpEvent::Data(_) => continue,
                    }
                }
            }
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> EchoResult<()> {
        match &mut self.transport {
            Transport::Direct { stream } => match stream {
                Some(stream) => {
                    stream.write_all(data).await?;
                    Ok(())
                }
                None => Err(EchoError::TransportDown("not connected".to_owned())),
            },
            Transport::Proxy {
                handle, tunnel_up, ..
            } => {
                if !*tunnel_up {
                    return Err(EchoError::TransportDown("not connected".to_owned()));
                }
                if handle.tcp_data(data.to_vec()).await {
                    Ok(())
                } else {
                    Err(EchoError::TransportDown("proxy gone".to_owned()))
                }
            }
        }
    }

    /// Read the next chunk. An orderly or errored close surfaces as
    /// `TransportDown`.
    pub async fn read(&mut self) -> EchoResult<Vec<u8>> {
        match &mut self.transport {
            Transport::Direct { stream } => {
                let Some(active) = stream else {
                    return Err(EchoError::TransportDown("not connected".to_owned()));
                };
                let mut buf = vec![0u8; 4096];
                let n = active.read(&mut buf).await?;
                if n == 0 {
                    *stream = None;
                    return Err(EchoError::TransportDown(
                        "directory server closed the connection".to_owned(),
                    ));
                }
                buf.truncate(n);
                Ok(buf)
            }
            Transport::Proxy {
                events, tunnel_up, ..
            } => {
                if !*tunnel_up {
                    return Err(EchoError::TransportDown("not connected".to_owned()));
                }
                loop {
                    match events.recv().await {
                        Some(ProxyTcpEvent::Data(data)) => return Ok(data),
                        Some(ProxyTcpEvent::Disconnected) | None => {
                            *tunnel_up = false;
                            return Err(EchoError::TransportDown(
                                "directory server closed the connection".to_owned(),
                            ));
                        }
                        Some(ProxyTcpEvent::Connected | ProxyTcpEvent::Status(_)) => continue,
                    }
                }
            }
        }
    }

    pub async fn disconnect(&mut self) {
        match &mut self.transport {
            Transport::Direct { stream } => {
                *stream = None;
            }
            Transport::Proxy {
                handle,
                events,
                tunnel_up,
            } => {
                if *tunnel_up {
                    handle.tcp_close().await;
                    // Wait for the close acknowledgement so the next open
                    // does not race the teardown.
                    let deadline = Duration::from_secs(5);
                    loop {
                        match timeout(deadline, events.recv()).await {
                            Ok(Some(ProxyTcpEvent::Disconnected)) | Ok(None) | Err(_) => break,
                            Ok(Some(_)) => continue,
                        }
                    }
                    *tunnel_up = false;
                }
            }
        }
    }
}
