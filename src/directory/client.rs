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

//! The directory client actor.
//!
//! Registration directives and list requests queue in FIFO order with at
//! most one command on the wire; each command is covered by a two minute
//! watchdog, and a five minute timer re-sends the current registration so
//! the server does not expire it. A disconnect mid-command flags the
//! registration state unknown and leaves the retry to the refresh timer.

use crate::{
    directory::{con::DirectoryCon, parser::CallListParser},
    error::{EchoError, EchoResult},
    station::{StationData, StationLists, StationStatus},
};
use chrono::Local;
use std::{collections::VecDeque, time::Duration};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::{self, timeout},
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{info, instrument, warn};

pub const CMD_TIMEOUT: Duration = Duration::from_secs(120);
pub const REGISTRATION_REFRESH_TIME: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmd {
    Offline,
    Online,
    Busy,
    GetCalls,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    StatusChanged(StationStatus),
    StationListUpdated,
    Error(String),
}

#[derive(Debug)]
enum ApiMessage {
    MakeOnline,
    MakeBusy,
    MakeOffline,
    GetCalls,
    RefreshRegistration,
    GetStatus(oneshot::Sender<StationStatus>),
    GetLists(oneshot::Sender<StationLists>),
    GetMessage(oneshot::Sender<String>),
    FindCall(String, oneshot::Sender<Option<StationData>>),
    FindStation(u32, oneshot::Sender<Option<StationData>>),
    FindByCode {
        code: String,
        exact: bool,
        reply: oneshot::Sender<Vec<StationData>>,
    },
}

#[derive(Debug, Clone)]
pub struct DirectoryApi {
    commands: mpsc::Sender<ApiMessage>,
}

impl DirectoryApi {
    pub async fn make_online(&self) -> bool {
        self.commands.send(ApiMessage::MakeOnline).await.is_ok()
    }

    pub async fn make_busy(&self) -> bool {
        self.commands.send(ApiMessage::MakeBusy).await.is_ok()
    }

    pub async fn make_offline(&self) -> bool {
        self.commands.send(ApiMessage::MakeOffline).await.is_ok()
    }

    pub async fn get_calls(&self) -> bool {
        self.commands.send(ApiMessage::GetCalls).await.is_ok()
    }

    pub async fn refresh_registration(&self) -> bool {
        self.commands
            .send(ApiMessage::RefreshRegistration)
            .await
            .is_ok()
    }

    pub async fn status(&self) -> EchoResult<StationStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ApiMessage::GetStatus(tx))
            .await
            .map_err(|_| EchoError::TransportDown("directory client gone".to_owned()))?;
        Ok(rx.await?)
    }

    pub async fn lists(&self) -> EchoResult<StationLists> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ApiMessage::GetLists(tx))
            .await
            .map_err(|_| EchoError::TransportDown("directory client gone".to_owned()))?;
        Ok(rx.await?)
    }

    pub async fn message(&self) -> EchoResult<String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ApiMessage::GetMessage(tx))
            .await
            .map_err(|_| EchoError::TransportDown("directory client gone".to_owned()))?;
        Ok(rx.await?)
    }

    pub async fn find_call(&self, callsign: &str) -> EchoResult<Option<StationData>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ApiMessage::FindCall(callsign.to_owned(), tx))
            .await
            .map_err(|_| EchoError::TransportDown("directory client gone".to_owned()))?;
        Ok(rx.await?)
    }

    pub async fn find_station(&self, id: u32) -> EchoResult<Option<StationData>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ApiMessage::FindStation(id, tx))
            .await
            .map_err(|_| EchoError::TransportDown("directory client gone".to_owned()))?;
        Ok(rx.await?)
    }

    pub async fn find_by_code(&self, code: &str, exact: bool) -> EchoResult<Vec<StationData>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ApiMessage::FindByCode {
                code: code.to_owned(),
                exact,
                reply: tx,
            })
            .await
            .map_err(|_| EchoError::TransportDown("directory client gone".to_owned()))?;
        Ok(rx.await?)
    }
}

/// Identity the client registers with.
#[derive(Debug, Clone)]
pub struct DirectoryIdentity {
    pub callsign: String,
    pub password: String,
    pub description: String,
}

#[instrument(skip(subsys, con, identity), fields(callsign = %identity.callsign))]
pub fn start_directory(
    subsys: &SubsystemHandle,
    identity: DirectoryIdentity,
    con: DirectoryCon,
) -> (DirectoryApi, mpsc::Receiver<DirectoryEvent>) {
    let (command_tx, command_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(64);

    subsys.start(SubsystemBuilder::new("directory", move |s| {
        DirectoryActor {
            subsys: s,
            callsign: identity.callsign.to_ascii_uppercase(),
            password: identity.password,
            description: identity.description,
            con,
            commands: command_rx,
            events: event_tx,
            desired_status: StationStatus::Offline,
            current_status: StationStatus::Offline,
            lists: StationLists::default(),
            message: String::new(),
            cmd_queue: VecDeque::new(),
        }
        .run()
    }));

    (
        DirectoryApi {
            commands: command_tx,
        },
        event_rx,
    )
}

struct DirectoryActor {
    subsys: SubsystemHandle,
    callsign: String,
    password: String,
    description: String,
    con: DirectoryCon,
    commands: mpsc::Receiver<ApiMessage>,
    events: mpsc::Sender<DirectoryEvent>,
    desired_status: StationStatus,
    current_status: StationStatus,
    lists: StationLists,
    message: String,
    cmd_queue: VecDeque<Cmd>,
}

impl DirectoryActor {
    async fn run(mut self) -> EchoResult<()> {
        let mut refresh = time::interval_at(
            time::Instant::now() + REGISTRATION_REFRESH_TIME,
            REGISTRATION_REFRESH_TIME,
        );

        loop {
            select! {
                _ = self.subsys.on_shutdown_requested() => return Ok(()),

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_api(command),
                    None => return Ok(()),
                },

                _ = refresh.tick() => self.refresh_registration(),
            }

            // One command at a time, strictly in FIFO order.
            while let Some(cmd) = self.cmd_queue.pop_front() {
                match timeout(CMD_TIMEOUT, self.exec_cmd(cmd)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => self.cmd_failed(cmd, &e.to_string()).await,
                    Err(_) => {
                        self.cmd_failed(
                            cmd,
                            "Command timeout while communicating to the directory server",
                        )
                        .await;
                    }
                }
            }
        }
    }

    fn handle_api(&mut self, command: ApiMessage) {
        match command {
            ApiMessage::MakeOnline => {
                self.desired_status = StationStatus::Online;
                self.enqueue(Cmd::Online);
            }
            ApiMessage::MakeBusy => {
                self.desired_status = StationStatus::Busy;
                self.enqueue(Cmd::Busy);
            }
            ApiMessage::MakeOffline => {
                self.desired_status = StationStatus::Offline;
                self.enqueue(Cmd::Offline);
            }
            ApiMessage::GetCalls => self.get_calls(),
            ApiMessage::RefreshRegistration => self.refresh_registration(),
            ApiMessage::GetStatus(reply) => {
                reply.send(self.current_status).ok();
            }
            ApiMessage::GetLists(reply) => {
                reply.send(self.lists.clone()).ok();
            }
            ApiMessage::GetMessage(reply) => {
                reply.send(self.message.clone()).ok();
            }
            ApiMessage::FindCall(callsign, reply) => {
                reply.send(self.lists.find_call(&callsign).cloned()).ok();
            }
            ApiMessage::FindStation(id, reply) => {
                reply.send(self.lists.find_station(id).cloned()).ok();
            }
            ApiMessage::FindByCode { code, exact, reply } => {
                reply.send(self.lists.find_by_code(&code, exact)).ok();
            }
        }
    }

    fn enqueue(&mut self, cmd: Cmd) {
        self.cmd_queue.push_back(cmd);
    }

    /// A list request is only valid while registered, and never queued
    /// twice.
    fn get_calls(&mut self) {
        if matches!(
            self.current_status,
            StationStatus::Online | StationStatus::Busy
        ) {
            if !self.cmd_queue.contains(&Cmd::GetCalls) {
                self.enqueue(Cmd::GetCalls);
            }
        } else {
            self.lists.clear();
            self.events
                .try_send(DirectoryEvent::Error(
                    "Trying to update the directory list while not registered with the \
                     directory server"
                        .to_owned(),
                ))
                .ok();
        }
    }

    fn refresh_registration(&mut self) {
        match self.desired_status {
            StationStatus::Online => self.enqueue(Cmd::Online),
            StationStatus::Busy => self.enqueue(Cmd::Busy),
            _ => {}
        }
    }

    async fn exec_cmd(&mut self, cmd: Cmd) -> EchoResult<()> {
        self.con.connect().await?;
        match cmd {
            Cmd::Offline | Cmd::Online | Cmd::Busy => self.exec_registration(cmd).await,
            Cmd::GetCalls => self.exec_get_calls().await,
        }
    }

    async fn exec_registration(&mut self, cmd: Cmd) -> EchoResult<()> {
        let mut request: Vec<u8> = Vec::new();
        request.push(b'l');
        request.extend_from_slice(self.callsign.as_bytes());
        request.extend_from_slice(&[0xAC, 0xAC]);
        request.extend_from_slice(self.password.as_bytes());
        request.push(0x0D);
        let local_time = Local::now().format("%H:%M");
        match cmd {
            Cmd::Offline => request.extend_from_slice(b"OFF-V3.40"),
            Cmd::Online => {
                request.extend_from_slice(format!("ONLINE3.38({local_time})").as_bytes())
            }
            Cmd::Busy => request.extend_from_slice(format!("BUSY3.40({local_time})").as_bytes()),
            Cmd::GetCalls => unreachable!("not a registration command"),
        }
        request.push(0x0D);
        request.extend_from_slice(self.description.as_bytes());
        request.push(0x0D);

        self.con.write(&request).await?;

        // The server answers with a literal "OK".
        let mut reply = Vec::new();
        while reply.len() < 2 {
            reply.extend_from_slice(&self.con.read().await?);
        }
        self.con.disconnect().await;

        if reply.starts_with(b"OK") {
            let status = match cmd {
                Cmd::Offline => StationStatus::Offline,
                Cmd::Online => StationStatus::Online,
                Cmd::Busy => StationStatus::Busy,
                Cmd::GetCalls => unreachable!("not a registration command"),
            };
            self.set_status(status).await;
            Ok(())
        } else {
            warn!("Unexpected reply from directory server (waiting for OK)");
            self.set_status(StationStatus::Unknown).await;
            Ok(())
        }
    }

    async fn exec_get_calls(&mut self) -> EchoResult<()> {
        self.con.write(b"s").await?;

        let mut parser = CallListParser::new();
        let mut pending: Vec<u8> = Vec::new();
        loop {
            pending.extend_from_slice(&self.con.read().await?);
            let consumed = parser.feed(&pending);
            pending.drain(..consumed);
            if parser.is_done() {
                break;
            }
            if parser.is_failed() {
                self.con.disconnect().await;
                return Err(EchoError::ProtocolViolation(
                    "error in call list format".to_owned(),
                ));
            }
        }
        self.con.disconnect().await;

        self.message = parser.message().to_owned();
        if let Some(error) = parser.error() {
            let error = error.to_owned();
            self.events.try_send(DirectoryEvent::Error(error)).ok();
            return Ok(());
        }

        self.lists = StationLists::classify(parser.take_entries());
        info!(
            "Station list updated: {} links, {} repeaters, {} conferences, {} stations",
            self.lists.links.len(),
            self.lists.repeaters.len(),
            self.lists.conferences.len(),
            self.lists.stations.len()
        );
        self.events.try_send(DirectoryEvent::StationListUpdated).ok();
        Ok(())
    }

    async fn cmd_failed(&mut self, cmd: Cmd, reason: &str) {
        warn!("Directory command failed: {reason}");
        self.con.disconnect().await;
        self.con.advance();
        if matches!(cmd, Cmd::Offline | Cmd::Online | Cmd::Busy) {
            self.set_status(StationStatus::Unknown).await;
        }
        self.events
            .try_send(DirectoryEvent::Error(reason.to_owned()))
            .ok();
    }

    async fn set_status(&mut self, status: StationStatus) {
        if status != self.current_status {
            self.current_status = status;
            self.events
                .send(DirectoryEvent::StatusChanged(status))
                .await
                .ok();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };
    use tokio_graceful_shutdown::Toplevel;

    async fn start_client(port: u16) -> (DirectoryApi, mpsc::Receiver<DirectoryEvent>) {
        let (api_tx, api_rx) = oneshot::channel();
        let toplevel = Toplevel::new(move |s| async move {
            let con = DirectoryCon::new(vec!["127.0.0.1".to_owned()], port);
            let identity = DirectoryIdentity {
                callsign: "SM0TEST".to_owned(),
                password: "SECRET".to_owned(),
                description: "QTH".to_owned(),
            };
            api_tx.send(start_directory(&s, identity, con)).ok();
        });
        tokio::spawn(async move {
            toplevel
                .handle_shutdown_requests(Duration::from_millis(100))
                .await
                .ok();
        });
        api_rx.await.expect("client did not start")
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        let mut request = Vec::new();
        loop {
            let n = stream.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            // Registration requests end with three CR-terminated fields,
            // list requests are the single byte "s".
            if request == b"s" || request.iter().filter(|&&b| b == 0x0D).count() >= 3 {
                break;
            }
        }
        request
    }

    #[tokio::test]
    async fn login_and_list_sequence() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let server = tokio::spawn(async move {
            // Registration.
            let (mut stream, _) = listener.accept().await.expect("accept");
            let request = read_request(&mut stream).await;
            assert_eq!(b'l', request[0]);
            let rest = &request[1..];
            assert!(rest.starts_with(b"SM0TEST\xAC\xACSECRET\x0DONLINE3.38("));
            assert!(request.ends_with(b"\x0DQTH\x0D"));
            stream.write_all(b"OK").await.expect("write");
            drop(stream);

            // Station list.
            let (mut stream, _) = listener.accept().await.expect("accept");
            let request = read_request(&mut stream).await;
            assert_eq!(b"s".to_vec(), request);
            let list = "@@@\n2\nSM0A-L\n[ONLINE 10:00]\n1001\n10.0.0.1\n\
                        SM0B\n[ONLINE 10:05]\n1002\n10.0.0.2\n+++";
            stream.write_all(list.as_bytes()).await.expect("write");
            drop(stream);
        });

        let (api, mut events) = start_client(port).await;

        api.make_online().await;
        let event = events.recv().await.expect("no event");
        assert_eq!(
            DirectoryEvent::StatusChanged(StationStatus::Online),
            event
        );

        api.get_calls().await;
        let event = events.recv().await.expect("no event");
        assert_eq!(DirectoryEvent::StationListUpdated, event);

        let lists = api.lists().await.expect("lists");
        assert_eq!(1, lists.links.len());
        assert_eq!(1, lists.stations.len());
        assert_eq!("SM0A-L", lists.links[0].callsign());

        let found = api.find_call("SM0B").await.expect("find");
        assert_eq!(1002, found.expect("missing").id());

        server.await.expect("server");
    }

    #[tokio::test]
    async fn get_calls_while_offline_is_an_error() {
        // Port is never connected to; the command is rejected locally.
        let (api, mut events) = start_client(1).await;
        api.get_calls().await;
        let event = events.recv().await.expect("no event");
        assert!(matches!(event, DirectoryEvent::Error(reason) if reason.contains("not registered")));
    }
}
