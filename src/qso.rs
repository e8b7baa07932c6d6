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

//! A peer voice session (Qso).
//!
//! The protocol logic lives in [`QsoCore`], a synchronous state machine
//! that turns inbound packets, timer ticks and user calls into actions
//! (packets to send, events to surface). [`QsoActor`] wraps a core in a
//! task, owns its timers and moves packets between the core and the
//! dispatcher. All timers die with the actor, so a session that reached
//! `Disconnected` holds no resources.

use crate::{
    codec::{
        CodecKind, PACKET_SAMPLES, PT_GSM, PT_SPEEX, SpeechCodec, VOICE_HEADER_LEN, VOICE_VERSION,
        VoiceHeader, gsm::GsmCodec, speex::SpeexCodec,
    },
    dispatcher::{DispatcherHandle, SessionRx},
    error::EchoResult,
    rtcp::{self, PRIV_SPEEX, SDES_NAME, SDES_PRIV},
};
use std::{net::Ipv4Addr, time::Duration};
use tokio::{select, sync::mpsc, time};
use tracing::{info, instrument, warn};

pub const KEEP_ALIVE_TIME: Duration = Duration::from_secs(10);
pub const CON_TIMEOUT_TIME: Duration = Duration::from_secs(50);
pub const MAX_CONNECT_RETRY_CNT: u32 = 5;

pub const RX_INDICATOR_POLL_TIME: Duration = Duration::from_millis(100);
/// Grace credit a session starts with when audio appears.
const RX_INDICATOR_SLACK_MS: i32 = 200;
/// Credit added per decoded packet (four 20 ms frames).
const BLOCK_TIME_MS: i32 = 80;
const RX_INDICATOR_MAX_TIME_MS: i32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QsoState {
    Disconnected,
    Connecting,
    ByeReceived,
    Connected,
}

/// A voice packet as received or forwarded raw, header parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawVoicePacket {
    pub header: VoiceHeader,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QsoEvent {
    StateChange(QsoState),
    InfoMsgReceived(String),
    ChatMsgReceived(String),
    IsReceiving(bool),
    /// Decoded audio, 640 samples in [-1, 1].
    AudioReceived(Vec<f32>),
    /// The undecoded packet, for raw forwarding between sessions.
    RawAudioReceived(RawVoicePacket),
    AllSamplesFlushed,
}

#[derive(Debug, PartialEq)]
pub enum QsoAction {
    SendCtrl(Vec<u8>),
    SendAudio(Vec<u8>),
    Event(QsoEvent),
    ResetInactivityTimer,
}

#[derive(Debug)]
pub struct QsoCore {
    remote_ip: Ipv4Addr,
    callsign: String,
    name: String,
    local_info: String,
    sdes: Vec<u8>,
    state: QsoState,
    remote_codec: CodecKind,
    use_gsm_only: bool,
    gsm: GsmCodec,
    speex: SpeexCodec,
    next_audio_seq: u16,
    send_buffer: Vec<i16>,
    connect_retry_cnt: u32,
    is_remote_initiated: bool,
    remote_call: String,
    remote_name: String,
    receiving_audio: bool,
    rx_timeout_left_ms: i32,
}

impl QsoCore {
    pub fn new(remote_ip: Ipv4Addr, callsign: &str, name: &str, local_info: &str) -> Self {
        Self::with_options(remote_ip, callsign, name, local_info, false)
    }

    pub fn with_options(
        remote_ip: Ipv4Addr,
        callsign: &str,
        name: &str,
        local_info: &str,
        use_gsm_only: bool,
    ) -> Self {
        let callsign = callsign.to_ascii_uppercase();
        let priv_item = if use_gsm_only { None } else { Some(PRIV_SPEEX) };
        let sdes = rtcp::build_sdes(&callsign, name, priv_item);
        Self {
            remote_ip,
            callsign,
            name: name.to_owned(),
            local_info: local_info.to_owned(),
            sdes,
            state: QsoState::Disconnected,
            remote_codec: CodecKind::Gsm,
            use_gsm_only,
            gsm: GsmCodec::new(),
            speex: SpeexCodec::new(),
            next_audio_seq: 0,
            send_buffer: Vec::with_capacity(PACKET_SAMPLES),
            connect_retry_cnt: 0,
            is_remote_initiated: false,
            remote_call: "?".to_owned(),
            remote_name: "?".to_owned(),
            receiving_audio: false,
            rx_timeout_left_ms: 0,
        }
    }

    pub fn state(&self) -> QsoState {
        self.state
    }

    pub fn remote_ip(&self) -> Ipv4Addr {
        self.remote_ip
    }

    pub fn remote_callsign(&self) -> &str {
        &self.remote_call
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn remote_codec(&self) -> CodecKind {
        self.remote_codec
    }

    pub fn is_remote_initiated(&self) -> bool {
        self.is_remote_initiated
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving_audio
    }

    pub fn set_local_info(&mut self, info: &str) {
        self.local_info = info.to_owned();
    }

    /// Change the advertised display name; the SDES keep-alives pick it up
    /// immediately.
    pub fn set_local_name(&mut self, name: &str) {
        self.name = name.to_owned();
        let priv_item = if self.use_gsm_only { None } else { Some(PRIV_SPEEX) };
        self.sdes = rtcp::build_sdes(&self.callsign, &self.name, priv_item);
    }

    /// Initiate a connection. Only valid in `Disconnected`.
    pub fn connect(&mut self) -> Vec<QsoAction> {
        let mut actions = Vec::new();
        if self.state != QsoState::Disconnected {
            return actions;
        }
        self.is_remote_initiated = false;
        self.connect_retry_cnt = 0;
        self.send_buffer.clear();
        actions.push(QsoAction::SendCtrl(self.sdes.clone()));
        self.set_state(QsoState::Connecting, &mut actions);
        actions
    }

    /// Accept a connection a remote peer initiated. Only valid in
    /// `Disconnected`.
    pub fn accept(&mut self) -> Vec<QsoAction> {
        let mut actions = Vec::new();
        if self.state != QsoState::Disconnected {
            return actions;
        }
        self.is_remote_initiated = true;
        self.send_buffer.clear();
        actions.push(QsoAction::SendCtrl(self.sdes.clone()));
        self.set_state(QsoState::Connected, &mut actions);
        actions
    }

    pub fn disconnect(&mut self) -> Vec<QsoAction> {
        let mut actions = Vec::new();
        if self.state == QsoState::Disconnected {
            return actions;
        }
        if self.state != QsoState::ByeReceived {
            actions.push(QsoAction::SendCtrl(rtcp::build_bye()));
        }
        self.cleanup(&mut actions);
        actions
    }

    /// Periodic keep-alive. While `Connecting`, five unanswered keep-alives
    /// give up on the peer.
    pub fn keep_alive_tick(&mut self) -> Vec<QsoAction> {
        let mut actions = Vec::new();
        if self.state == QsoState::Disconnected {
            return actions;
        }
        if self.state == QsoState::Connecting {
            self.connect_retry_cnt += 1;
            if self.connect_retry_cnt == MAX_CONNECT_RETRY_CNT {
                self.cleanup(&mut actions);
                return actions;
            }
        }
        actions.push(QsoAction::SendCtrl(self.sdes.clone()));
        actions
    }

    /// Inactivity watchdog expiry: drop the session unconditionally.
    pub fn connection_timeout(&mut self) -> Vec<QsoAction> {
        let mut actions = Vec::new();
        if self.state != QsoState::Disconnected {
            self.cleanup(&mut actions);
        }
        actions
    }

    /// 100 ms poll of the RX activity indicator.
    pub fn rx_indicator_tick(&mut self) -> Vec<QsoAction> {
        let mut actions = Vec::new();
        if !self.receiving_audio {
            return actions;
        }
        self.rx_timeout_left_ms -= 100;
        if self.rx_timeout_left_ms <= 0 {
            self.receiving_audio = false;
            actions.push(QsoAction::Event(QsoEvent::IsReceiving(false)));
        }
        actions
    }

    pub fn handle_ctrl(&mut self, packet: &[u8]) -> Vec<QsoAction> {
        let mut actions = Vec::new();
        if rtcp::is_bye(packet) {
            self.handle_bye(&mut actions);
        } else if rtcp::is_sdes(packet) {
            self.handle_sdes(packet, &mut actions);
        } else {
            warn!("Unknown packet type received from {}", self.remote_ip);
        }
        actions
    }

    fn handle_bye(&mut self, actions: &mut Vec<QsoAction>) {
        if self.state != QsoState::Disconnected {
            self.set_state(QsoState::ByeReceived, actions);
            self.cleanup(actions);
        } else {
            actions.push(QsoAction::SendCtrl(rtcp::build_bye()));
        }
    }

    fn handle_sdes(&mut self, packet: &[u8], actions: &mut Vec<QsoAction>) {
        if let Some(name_item) = rtcp::parse_sdes(packet, SDES_NAME) {
            if let Some((call, name)) = rtcp::split_name_item(&name_item) {
                self.remote_call = call;
                if !name.is_empty() {
                    self.remote_name = name;
                }
            }
        }
        if let Some(priv_item) = rtcp::parse_sdes(packet, SDES_PRIV) {
            self.set_remote_params(&priv_item);
        }

        match self.state {
            QsoState::Connecting => {
                self.set_state(QsoState::Connected, actions);
            }
            QsoState::Disconnected => {
                actions.push(QsoAction::SendCtrl(rtcp::build_bye()));
            }
            QsoState::Connected => {
                // Keep-alive from the peer.
                actions.push(QsoAction::ResetInactivityTimer);
            }
            QsoState::ByeReceived => {}
        }
    }

    fn set_remote_params(&mut self, priv_item: &str) {
        if priv_item.contains(PRIV_SPEEX)
            && self.remote_codec == CodecKind::Gsm
            && !self.use_gsm_only
        {
            info!("Switching to Speex audio codec for {}", self.remote_ip);
            self.remote_codec = CodecKind::Speex;
        }
    }

    pub fn handle_audio(&mut self, packet: &[u8]) -> Vec<QsoAction> {
        let mut actions = Vec::new();
        if self.state == QsoState::Disconnected {
            warn!(
                "Ignoring audio/info/chat packet from {} since we are disconnected",
                self.remote_ip
            );
            return actions;
        }

        if packet.first() != Some(&VOICE_VERSION) {
            self.handle_non_audio_packet(packet, &mut actions);
        } else {
            self.handle_audio_packet(packet, &mut actions);
        }
        actions
    }

    fn handle_non_audio_packet(&mut self, packet: &[u8], actions: &mut Vec<QsoAction>) {
        if packet.len() < 7 || &packet[1..6] != b"NDATA" {
            warn!("Unknown non-audio packet received from {}", self.remote_ip);
            return;
        }

        if packet[6] == 0x0D {
            // Station info / conference status.
            let Some(null) = packet.iter().position(|&b| b == 0) else {
                warn!("Malformed info packet received from {}", self.remote_ip);
                return;
            };
            let text = String::from_utf8_lossy(&packet[7..null]).replace('\r', "\n");
            actions.push(QsoAction::Event(QsoEvent::InfoMsgReceived(text)));
        } else {
            let Some(null) = packet.iter().position(|&b| b == 0) else {
                warn!("Malformed chat packet received from {}", self.remote_ip);
                return;
            };
            let text = String::from_utf8_lossy(&packet[6..null]).replace('\r', "\n");
            actions.push(QsoAction::Event(QsoEvent::ChatMsgReceived(text)));
        }
    }

    fn handle_audio_packet(&mut self, packet: &[u8], actions: &mut Vec<QsoAction>) {
        let Some(header) = VoiceHeader::parse(packet) else {
            warn!("Invalid audio packet size from {}", self.remote_ip);
            return;
        };
        let payload = &packet[VOICE_HEADER_LEN..];

        // A Speex session still decodes GSM packets so mixed networks keep
        // working.
        let decoded = if header.payload_type == PT_SPEEX {
            self.speex.decode_packet(payload)
        } else {
            self.gsm.decode_packet(payload)
        };
        let samples = match decoded {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Undecodable audio packet from {}: {e}", self.remote_ip);
                return;
            }
        };

        if !self.receiving_audio {
            self.receiving_audio = true;
            self.rx_timeout_left_ms = RX_INDICATOR_SLACK_MS;
            actions.push(QsoAction::Event(QsoEvent::IsReceiving(true)));
        }
        self.rx_timeout_left_ms = (self.rx_timeout_left_ms + BLOCK_TIME_MS)
            .clamp(BLOCK_TIME_MS + RX_INDICATOR_SLACK_MS, RX_INDICATOR_MAX_TIME_MS);

        let floats: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();
        actions.push(QsoAction::Event(QsoEvent::AudioReceived(floats)));
        actions.push(QsoAction::Event(QsoEvent::RawAudioReceived(
            RawVoicePacket {
                header,
                payload: payload.to_vec(),
            },
        )));
    }

    /// Send the local station info (or `info` when given) as an oNDATA
    /// message.
    pub fn send_info(&mut self, info: Option<&str>) -> Vec<QsoAction> {
        let mut actions = Vec::new();
        if self.state != QsoState::Connected {
            return actions;
        }
        let mut msg = String::from("oNDATA\r");
        msg.push_str(info.unwrap_or(&self.local_info));
        let msg = msg.replace('\n', "\r");
        let mut buf = msg.into_bytes();
        buf.push(0);
        actions.push(QsoAction::SendAudio(buf));
        actions
    }

    pub fn send_chat(&mut self, msg: &str) -> Vec<QsoAction> {
        let mut actions = Vec::new();
        if self.state != QsoState::Connected {
            return actions;
        }
        let mut buf = format!("oNDATA{}>{}\r\n", self.callsign, msg).into_bytes();
        buf.push(0);
        actions.push(QsoAction::SendAudio(buf));
        actions
    }

    /// Buffer outbound PCM. Full packets are encoded with the negotiated
    /// codec and sent.
    pub fn write_samples(&mut self, samples: &[f32]) -> Vec<QsoAction> {
        let mut actions = Vec::new();
        if self.state != QsoState::Connected {
            return actions;
        }
        for &sample in samples {
            let value = if sample > 1.0 {
                32767
            } else if sample < -1.0 {
                -32767
            } else {
                (32767.0 * sample) as i16
            };
            self.send_buffer.push(value);
            if self.send_buffer.len() == PACKET_SAMPLES {
                self.send_voice_packet(&mut actions);
            }
        }
        actions
    }

    /// Zero-pad and send any partial packet, then acknowledge the flush.
    pub fn flush_samples(&mut self) -> Vec<QsoAction> {
        let mut actions = Vec::new();
        if self.state == QsoState::Connected && !self.send_buffer.is_empty() {
            self.send_buffer.resize(PACKET_SAMPLES, 0);
            self.send_voice_packet(&mut actions);
        }
        actions.push(QsoAction::Event(QsoEvent::AllSamplesFlushed));
        actions
    }

    /// Forward a raw packet from another session. A Speex packet bound for a
    /// GSM-only peer is transcoded and re-tagged.
    pub fn send_audio_raw(&mut self, raw: &RawVoicePacket) -> EchoResult<Vec<QsoAction>> {
        let mut actions = Vec::new();
        if self.state != QsoState::Connected {
            return Ok(actions);
        }

        if raw.header.payload_type == PT_SPEEX && self.remote_codec == CodecKind::Gsm {
            let samples = self.speex.decode_packet(&raw.payload)?;
            let payload = self.gsm.encode_packet(&samples)?;
            let header = VoiceHeader {
                payload_type: PT_GSM,
                sequence: self.next_seq(),
            };
            let mut buf = header.encode().to_vec();
            buf.extend_from_slice(&payload);
            actions.push(QsoAction::SendAudio(buf));
        } else {
            let header = VoiceHeader {
                payload_type: raw.header.payload_type,
                sequence: self.next_seq(),
            };
            let mut buf = header.encode().to_vec();
            buf.extend_from_slice(&raw.payload);
            actions.push(QsoAction::SendAudio(buf));
        }
        Ok(actions)
    }

    fn send_voice_packet(&mut self, actions: &mut Vec<QsoAction>) {
        let encoded = match self.remote_codec {
            CodecKind::Speex => self.speex.encode_packet(&self.send_buffer),
            CodecKind::Gsm => self.gsm.encode_packet(&self.send_buffer),
        };
        self.send_buffer.clear();
        let payload = match encoded {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Voice packet encoding failed: {e}");
                return;
            }
        };
        let header = VoiceHeader {
            payload_type: self.remote_codec.payload_type(),
            sequence: self.next_seq(),
        };
        let mut buf = header.encode().to_vec();
        buf.extend_from_slice(&payload);
        actions.push(QsoAction::SendAudio(buf));
    }

    fn next_seq(&mut self) -> u16 {
        let seq = self.next_audio_seq;
        self.next_audio_seq = self.next_audio_seq.wrapping_add(1);
        seq
    }

    fn set_state(&mut self, state: QsoState, actions: &mut Vec<QsoAction>) {
        if state == self.state {
            return;
        }
        self.state = state;
        if state == QsoState::Connected {
            let info = self.send_info(None);
            actions.extend(info);
        }
        actions.push(QsoAction::Event(QsoEvent::StateChange(state)));
    }

    fn cleanup(&mut self, actions: &mut Vec<QsoAction>) {
        if self.receiving_audio {
            self.receiving_audio = false;
            actions.push(QsoAction::Event(QsoEvent::IsReceiving(false)));
        }
        self.set_state(QsoState::Disconnected, actions);
    }
}

/// User-facing commands into a running session actor.
#[derive(Debug)]
pub enum QsoApiMessage {
    Connect,
    Accept,
    Disconnect,
    SendInfo(Option<String>),
    SendChat(String),
    WriteSamples(Vec<f32>),
    FlushSamples,
    SendAudioRaw(RawVoicePacket),
}

#[derive(Debug, Clone)]
pub struct QsoApi {
    commands: mpsc::Sender<QsoApiMessage>,
}

impl QsoApi {
    pub async fn connect(&self) -> bool {
        self.commands.send(QsoApiMessage::Connect).await.is_ok()
    }

    pub async fn accept(&self) -> bool {
        self.commands.send(QsoApiMessage::Accept).await.is_ok()
    }

    pub async fn disconnect(&self) -> bool {
        self.commands.send(QsoApiMessage::Disconnect).await.is_ok()
    }

    pub async fn send_info(&self, info: Option<String>) -> bool {
        self.commands
            .send(QsoApiMessage::SendInfo(info))
            .await
            .is_ok()
    }

    pub async fn send_chat(&self, msg: String) -> bool {
        self.commands
            .send(QsoApiMessage::SendChat(msg))
            .await
            .is_ok()
    }

    pub async fn write_samples(&self, samples: Vec<f32>) -> bool {
        self.commands
            .send(QsoApiMessage::WriteSamples(samples))
            .await
            .is_ok()
    }

    pub async fn flush_samples(&self) -> bool {
        self.commands.send(QsoApiMessage::FlushSamples).await.is_ok()
    }

    pub async fn send_audio_raw(&self, raw: RawVoicePacket) -> bool {
        self.commands
            .send(QsoApiMessage::SendAudioRaw(raw))
            .await
            .is_ok()
    }
}

/// Spawn a session actor for `core`. The session registers itself with the
/// dispatcher and unregisters (and releases all timers) when it ends.
#[instrument(skip(dispatcher, core), fields(remote_ip = %core.remote_ip()))]
pub fn start_qso(
    dispatcher: &DispatcherHandle,
    core: QsoCore,
) -> EchoResult<(QsoApi, mpsc::Receiver<QsoEvent>)> {
    let session_rx = dispatcher.register_session(core.remote_ip())?;
    let (command_tx, command_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(256);

    let actor = QsoActor {
        core,
        dispatcher: dispatcher.clone(),
        session_rx,
        commands: command_rx,
        events: event_tx,
    };
    tokio::spawn(actor.run());

    Ok((
        QsoApi {
            commands: command_tx,
        },
        event_rx,
    ))
}

struct QsoActor {
    core: QsoCore,
    dispatcher: DispatcherHandle,
    session_rx: SessionRx,
    commands: mpsc::Receiver<QsoApiMessage>,
    events: mpsc::Sender<QsoEvent>,
}

impl QsoActor {
    async fn run(mut self) {
        let start = time::Instant::now();
        let mut keep_alive = time::interval_at(start + KEEP_ALIVE_TIME, KEEP_ALIVE_TIME);
        let mut con_timeout = time::interval_at(start + CON_TIMEOUT_TIME, CON_TIMEOUT_TIME);
        let mut rx_poll =
            time::interval_at(start + RX_INDICATOR_POLL_TIME, RX_INDICATOR_POLL_TIME);

        loop {
            let timers_active = self.core.state() != QsoState::Disconnected;
            let actions = select! {
                Some(packet) = self.session_rx.ctrl.recv() => self.core.handle_ctrl(&packet),
                Some(packet) = self.session_rx.audio.recv() => self.core.handle_audio(&packet),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_api(command),
                    None => {
                        // Handle dropped: tear the session down.
                        let actions = self.core.disconnect();
                        self.dispatch(actions, &mut con_timeout, &mut keep_alive).await;
                        break;
                    }
                },
                _ = keep_alive.tick(), if timers_active => self.core.keep_alive_tick(),
                _ = con_timeout.tick(), if timers_active => self.core.connection_timeout(),
                _ = rx_poll.tick(), if self.core.is_receiving() => self.core.rx_indicator_tick(),
            };
            self.dispatch(actions, &mut con_timeout, &mut keep_alive).await;
        }

        self.dispatcher.unregister_session(self.core.remote_ip());
        info!("Session with {} ended", self.core.remote_ip());
    }

    fn handle_api(&mut self, command: QsoApiMessage) -> Vec<QsoAction> {
        match command {
            QsoApiMessage::Connect => self.core.connect(),
            QsoApiMessage::Accept => self.core.accept(),
            QsoApiMessage::Disconnect => self.core.disconnect(),
            QsoApiMessage::SendInfo(info) => self.core.send_info(info.as_deref()),
            QsoApiMessage::SendChat(msg) => self.core.send_chat(&msg),
            QsoApiMessage::WriteSamples(samples) => self.core.write_samples(&samples),
            QsoApiMessage::FlushSamples => self.core.flush_samples(),
            QsoApiMessage::SendAudioRaw(raw) => match self.core.send_audio_raw(&raw) {
                Ok(actions) => actions,
                Err(e) => {
                    warn!("Raw audio forward failed: {e}");
                    Vec::new()
                }
            },
        }
    }

    async fn dispatch(
        &mut self,
        actions: Vec<QsoAction>,
        con_timeout: &mut time::Interval,
        keep_alive: &mut time::Interval,
    ) {
        let link = self.dispatcher.link();
        for action in actions {
            match action {
                QsoAction::SendCtrl(buf) => {
                    if let Err(e) = link.send_ctrl(self.core.remote_ip(), &buf).await {
                        warn!("sendCtrlMsg failed: {e}");
                    }
                }
                QsoAction::SendAudio(buf) => {
                    if let Err(e) = link.send_audio(self.core.remote_ip(), &buf).await {
                        warn!("sendAudioMsg failed: {e}");
                    }
                }
                QsoAction::Event(event) => {
                    if let QsoEvent::StateChange(QsoState::Connecting | QsoState::Connected) = event
                    {
                        keep_alive.reset();
                        con_timeout.reset();
                    }
                    self.events.send(event).await.ok();
                }
                QsoAction::ResetInactivityTimer => con_timeout.reset(),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::gsm::GSM_PACKET_BYTES;

    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn connected_core() -> QsoCore {
        let mut core = QsoCore::new(PEER, "SM0TEST", "Sven", "QTH test");
        core.connect();
        let sdes = rtcp::build_sdes("SM0PEER", "Peer", None);
        core.handle_ctrl(&sdes);
        assert_eq!(QsoState::Connected, core.state());
        core
    }

    fn sent_audio(actions: &[QsoAction]) -> Vec<&Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                QsoAction::SendAudio(buf) => Some(buf),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connect_sends_sdes_and_enters_connecting() {
        let mut core = QsoCore::new(PEER, "SM0TEST", "Sven", "");
        let actions = core.connect();
        assert_eq!(QsoState::Connecting, core.state());
        assert!(matches!(&actions[0], QsoAction::SendCtrl(buf) if rtcp::is_sdes(buf)));
    }

    #[test]
    fn sdes_reply_completes_the_connection() {
        let mut core = QsoCore::new(PEER, "SM0TEST", "Sven", "");
        core.connect();
        let sdes = rtcp::build_sdes("SM0PEER", "Peer", None);
        let actions = core.handle_ctrl(&sdes);
        assert_eq!(QsoState::Connected, core.state());
        assert_eq!("SM0PEER", core.remote_callsign());
        assert_eq!("Peer", core.remote_name());
        // Entering Connected transmits the station info.
        assert!(!sent_audio(&actions).is_empty());
    }

    #[test]
    fn accept_enters_connected_directly() {
        let mut core = QsoCore::new(PEER, "SM0TEST", "Sven", "");
        core.accept();
        assert_eq!(QsoState::Connected, core.state());
        assert!(core.is_remote_initiated());
    }

    #[test]
    fn bye_while_connected_transitions_once_and_sends_no_bye() {
        let mut core = connected_core();
        let actions = core.handle_ctrl(&rtcp::build_bye());
        assert_eq!(QsoState::Disconnected, core.state());

        let state_changes: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                QsoAction::Event(QsoEvent::StateChange(s)) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(
            vec![QsoState::ByeReceived, QsoState::Disconnected],
            state_changes
        );
        // No BYE is re-emitted in response to the peer's BYE.
        assert!(
            !actions
                .iter()
                .any(|a| matches!(a, QsoAction::SendCtrl(buf) if rtcp::is_bye(buf)))
        );
    }

    #[test]
    fn bye_while_disconnected_is_answered_with_bye() {
        let mut core = QsoCore::new(PEER, "SM0TEST", "Sven", "");
        let actions = core.handle_ctrl(&rtcp::build_bye());
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, QsoAction::SendCtrl(buf) if rtcp::is_bye(buf)))
        );
    }

    #[test]
    fn disconnect_sends_bye_and_cleans_up() {
        let mut core = connected_core();
        let actions = core.disconnect();
        assert_eq!(QsoState::Disconnected, core.state());
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, QsoAction::SendCtrl(buf) if rtcp::is_bye(buf)))
        );
    }

    #[test]
    fn five_unanswered_keepalives_abort_a_connect() {
        let mut core = QsoCore::new(PEER, "SM0TEST", "Sven", "");
        core.connect();
        for _ in 0..MAX_CONNECT_RETRY_CNT - 1 {
            core.keep_alive_tick();
            assert_eq!(QsoState::Connecting, core.state());
        }
        core.keep_alive_tick();
        assert_eq!(QsoState::Disconnected, core.state());
    }

    #[test]
    fn outbound_packets_default_to_gsm() {
        let mut core = connected_core();
        let actions = core.write_samples(&vec![0.1f32; PACKET_SAMPLES]);
        let sent = sent_audio(&actions);
        assert_eq!(1, sent.len());
        assert_eq!(PT_GSM, sent[0][1]);
        assert_eq!(VOICE_HEADER_LEN + GSM_PACKET_BYTES, sent[0].len());
    }

    #[test]
    fn speex_priv_upgrades_the_codec() {
        let mut core = connected_core();
        let sdes = rtcp::build_sdes("SM0PEER", "Peer", Some(PRIV_SPEEX));
        core.handle_ctrl(&sdes);
        assert_eq!(CodecKind::Speex, core.remote_codec());

        let actions = core.write_samples(&vec![0.1f32; PACKET_SAMPLES]);
        let sent = sent_audio(&actions);
        assert_eq!(1, sent.len());
        assert_eq!(PT_SPEEX, sent[0][1]);
        // Variable length: not the fixed GSM packet size.
        assert_ne!(VOICE_HEADER_LEN + GSM_PACKET_BYTES, sent[0].len());
    }

    #[test]
    fn gsm_only_refuses_the_upgrade() {
        let mut core = QsoCore::with_options(PEER, "SM0TEST", "Sven", "", true);
        core.connect();
        let sdes = rtcp::build_sdes("SM0PEER", "Peer", Some(PRIV_SPEEX));
        core.handle_ctrl(&sdes);
        assert_eq!(CodecKind::Gsm, core.remote_codec());
    }

    #[test]
    fn speex_session_still_decodes_gsm_packets() {
        let mut core = connected_core();
        core.handle_ctrl(&rtcp::build_sdes("SM0PEER", "Peer", Some(PRIV_SPEEX)));

        let mut gsm = GsmCodec::new();
        let payload = gsm
            .encode_packet(&vec![1000i16; PACKET_SAMPLES])
            .expect("encode");
        let mut packet = VoiceHeader {
            payload_type: PT_GSM,
            sequence: 0,
        }
        .encode()
        .to_vec();
        packet.extend_from_slice(&payload);

        let actions = core.handle_audio(&packet);
        assert!(actions.iter().any(|a| matches!(
            a,
            QsoAction::Event(QsoEvent::AudioReceived(samples)) if samples.len() == PACKET_SAMPLES
        )));
    }

    #[test]
    fn speex_to_gsm_forward_is_transcoded() {
        let mut core = connected_core();
        assert_eq!(CodecKind::Gsm, core.remote_codec());

        let mut speex = SpeexCodec::new();
        let payload = speex
            .encode_packet(&vec![1000i16; PACKET_SAMPLES])
            .expect("encode");
        let raw = RawVoicePacket {
            header: VoiceHeader {
                payload_type: PT_SPEEX,
                sequence: 7,
            },
            payload,
        };

        let actions = core.send_audio_raw(&raw).expect("forward");
        let sent = sent_audio(&actions);
        assert_eq!(1, sent.len());
        assert_eq!(PT_GSM, sent[0][1]);
        assert_eq!(VOICE_HEADER_LEN + GSM_PACKET_BYTES, sent[0].len());
    }

    #[test]
    fn info_and_chat_messages_are_delivered_with_clean_line_endings() {
        let mut core = connected_core();

        let mut info = b"oNDATA\rstation info\rsecond line".to_vec();
        info.push(0);
        let actions = core.handle_audio(&info);
        assert!(actions.iter().any(|a| matches!(
            a,
            QsoAction::Event(QsoEvent::InfoMsgReceived(text))
                if text == "station info\nsecond line"
        )));

        let mut chat = b"oNDATASM0PEER>hello\r\n".to_vec();
        chat.push(0);
        let actions = core.handle_audio(&chat);
        assert!(actions.iter().any(|a| matches!(
            a,
            QsoAction::Event(QsoEvent::ChatMsgReceived(text))
                if text == "SM0PEER>hello\n\n"
        )));
    }

    #[test]
    fn rx_indicator_expires_after_slack() {
        let mut core = connected_core();
        let mut gsm = GsmCodec::new();
        let payload = gsm
            .encode_packet(&vec![1000i16; PACKET_SAMPLES])
            .expect("encode");
        let mut packet = VoiceHeader {
            payload_type: PT_GSM,
            sequence: 0,
        }
        .encode()
        .to_vec();
        packet.extend_from_slice(&payload);

        let actions = core.handle_audio(&packet);
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, QsoAction::Event(QsoEvent::IsReceiving(true))))
        );
        assert!(core.is_receiving());

        // 280 ms of credit: the indicator expires within three polls.
        let mut stopped = false;
        for _ in 0..4 {
            let actions = core.rx_indicator_tick();
            if actions
                .iter()
                .any(|a| matches!(a, QsoAction::Event(QsoEvent::IsReceiving(false))))
            {
                stopped = true;
            }
        }
        assert!(stopped);
        assert!(!core.is_receiving());
    }

    #[test]
    fn flush_pads_and_acknowledges() {
        let mut core = connected_core();
        core.write_samples(&vec![0.5f32; 100]);
        let actions = core.flush_samples();
        assert_eq!(1, sent_audio(&actions).len());
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, QsoAction::Event(QsoEvent::AllSamplesFlushed)))
        );
    }

    #[test]
    fn audio_while_disconnected_is_dropped() {
        let mut core = QsoCore::new(PEER, "SM0TEST", "Sven", "");
        let actions = core.handle_audio(&[0xc0, 0x03, 0, 0]);
        assert!(actions.is_empty());
    }
}
