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

//! The receiver voter: fronts several sub-receivers and presents itself as
//! a single receiver choosing the strongest signal.
//!
//! State machine: `Muted`, `Idle`, `VotingDelay` and the active-receiver
//! compound of `Receiving`, `SwitchActiveRx` and `SqlCloseWait`. The
//! initial squelch open is held off by `VOTING_DELAY` so late, stronger
//! signals can win; while receiving, a periodic revote switches to a
//! sub-receiver that is better by more than `HYSTERESIS` for at least
//! `RX_SWITCH_DELAY`; a closing squelch is held in `SqlCloseWait` to give
//! another receiver the chance to take over without an audible gap.
//!
//! Side effects of a state change are collected as actions and applied
//! after the triggering event is fully dispatched, so no event handler
//! observes a half-entered state.

pub mod satrx;

use crate::{
    config::VoterConfig,
    error::EchoResult,
    trx::{RxCommand, RxEvent, RxPort, rx_port},
};
use satrx::SatRx;
use std::{pin::Pin, time::Duration};
use tokio::{
    select,
    sync::mpsc,
    time::{self, Sleep, sleep},
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{info, instrument, warn};

/// Signal level reported when no sub-receiver is open.
pub const BEST_RX_SIGLEV_RESET: f32 = -100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoterTimer {
    VotingDelay,
    Revote,
    RxSwitch,
    SqlCloseWait,
}

#[derive(Debug, PartialEq)]
pub enum VoterAction {
    Audio(Vec<f32>),
    SquelchOpen { rx_id: u8, siglev: f32 },
    SquelchClosed { rx_id: u8, siglev: f32 },
    Dtmf { digit: char, duration_ms: u16 },
    Selcall(String),
    Tone(f32),
    StartTimer(VoterTimer, Duration),
    StopTimer(VoterTimer),
    /// Hard mute command for the physical sub-receiver.
    MuteSubRx { index: usize, mute: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VState {
    Muted,
    Idle,
    VotingDelay,
    Receiving,
    SwitchActiveRx,
    SqlCloseWait,
}

#[derive(Debug)]
pub struct VoterCore {
    config: VoterConfig,
    sats: Vec<SatRx>,
    state: VState,
    active: Option<usize>,
    best: Option<usize>,
    best_siglev: f32,
    switch_target: Option<usize>,
    sql_rx_id: u8,
}

impl VoterCore {
    pub fn new(config: VoterConfig, names: &[String]) -> Self {
        let buffer_length = config.buffer_length();
        let sats = names
            .iter()
            .enumerate()
            .map(|(i, name)| SatRx::new(i as u8 + 1, name, buffer_length))
            .collect();
        Self {
            config,
            sats,
            state: VState::Muted,
            active: None,
            best: None,
            best_siglev: BEST_RX_SIGLEV_RESET,
            switch_target: None,
            sql_rx_id: 0,
        }
    }

    pub fn signal_strength(&self) -> f32 {
        self.active
            .map(|i| self.sats[i].signal_strength())
            .unwrap_or(BEST_RX_SIGLEV_RESET)
    }

    pub fn sql_rx_id(&self) -> u8 {
        self.sql_rx_id
    }

    pub fn is_muted(&self) -> bool {
        self.state == VState::Muted
    }

    pub fn set_mute(&mut self, mute: bool) -> Vec<VoterAction> {
        let mut actions = Vec::new();
        if mute == (self.state == VState::Muted) {
            return actions;
        }

        if mute {
            if matches!(
                self.state,
                VState::Receiving | VState::SwitchActiveRx | VState::SqlCloseWait
            ) {
                self.close_squelch(&mut actions);
            }
            for timer in [
                VoterTimer::VotingDelay,
                VoterTimer::Revote,
                VoterTimer::RxSwitch,
                VoterTimer::SqlCloseWait,
            ] {
                actions.push(VoterAction::StopTimer(timer));
            }
            for (i, sat) in self.sats.iter_mut().enumerate() {
                sat.demote();
                sat.mute(true);
                actions.push(VoterAction::MuteSubRx {
                    index: i,
                    mute: true,
                });
            }
            self.active = None;
            self.best = None;
            self.best_siglev = BEST_RX_SIGLEV_RESET;
            self.switch_target = None;
            self.state = VState::Muted;
        } else {
            for (i, sat) in self.sats.iter_mut().enumerate() {
                sat.mute(false);
                actions.push(VoterAction::MuteSubRx {
                    index: i,
                    mute: false,
                });
            }
            self.state = VState::Idle;
        }
        actions
    }

    /// Reset after a sub-receiver failure: drop it from the candidate set.
    /// The voter itself keeps running.
    pub fn sub_rx_reset(&mut self, index: usize) -> Vec<VoterAction> {
        let mut actions = Vec::new();
        if index >= self.sats.len() {
            return actions;
        }
        warn!("Sub-receiver {} reset, removing from vote", self.sats[index].name);
        if self.sats[index].squelch_is_open() {
            self.rx_event(index, RxEvent::Squelch {
                open: false,
                siglev: BEST_RX_SIGLEV_RESET,
                rx_id: self.sats[index].id,
            })
            .into_iter()
            .for_each(|a| actions.push(a));
        }
        self.sats[index].mute(true);
        actions
    }

    pub fn rx_event(&mut self, index: usize, event: RxEvent) -> Vec<VoterAction> {
        let mut actions = Vec::new();
        if index >= self.sats.len() {
            return actions;
        }

        match event {
            RxEvent::Squelch { open, siglev, .. } => {
                let edge = self.sats[index].set_squelch(open, siglev);
                if let Some(open) = edge {
                    self.squelch_edge(index, open, &mut actions);
                }
            }
            RxEvent::Audio(samples) => {
                if let Some(out) = self.sats[index].audio(&samples) {
                    actions.push(VoterAction::Audio(out));
                }
            }
            RxEvent::Dtmf { digit, duration_ms } => {
                if let Some((digit, duration_ms)) = self.sats[index].dtmf(digit, duration_ms) {
                    actions.push(VoterAction::Dtmf { digit, duration_ms });
                }
            }
            RxEvent::Selcall(sequence) => {
                if let Some(sequence) = self.sats[index].selcall(sequence) {
                    actions.push(VoterAction::Selcall(sequence));
                }
            }
            RxEvent::Tone(fq) => actions.push(VoterAction::Tone(fq)),
        }
        actions
    }

    fn squelch_edge(&mut self, index: usize, open: bool, actions: &mut Vec<VoterAction>) {
        match self.state {
            VState::Muted => {}

            VState::Idle => {
                if open {
                    self.best = Some(index);
                    self.best_siglev = self.sats[index].signal_strength();
                    self.state = VState::VotingDelay;
                    actions.push(VoterAction::StartTimer(
                        VoterTimer::VotingDelay,
                        Duration::from_millis(self.config.voting_delay),
                    ));
                }
            }

            VState::VotingDelay => {
                if open {
                    if self.sats[index].signal_strength() > self.best_siglev {
                        self.best = Some(index);
                        self.best_siglev = self.sats[index].signal_strength();
                    }
                } else {
                    self.recompute_best();
                    if self.best.is_none() {
                        actions.push(VoterAction::StopTimer(VoterTimer::VotingDelay));
                        self.state = VState::Idle;
                    }
                }
            }

            VState::Receiving => {
                if !open && Some(index) == self.active {
                    actions.push(VoterAction::StopTimer(VoterTimer::Revote));
                    self.state = VState::SqlCloseWait;
                    actions.push(VoterAction::StartTimer(
                        VoterTimer::SqlCloseWait,
                        Duration::from_millis(self.config.sql_close_revote_delay),
                    ));
                }
            }

            VState::SwitchActiveRx => {
                if !open && Some(index) == self.active {
                    actions.push(VoterAction::StopTimer(VoterTimer::RxSwitch));
                    self.switch_target = None;
                    self.state = VState::SqlCloseWait;
                    actions.push(VoterAction::StartTimer(
                        VoterTimer::SqlCloseWait,
                        Duration::from_millis(self.config.sql_close_revote_delay),
                    ));
                } else if !open && Some(index) == self.switch_target {
                    // The candidate vanished; stay with the current one.
                    actions.push(VoterAction::StopTimer(VoterTimer::RxSwitch));
                    self.switch_target = None;
                    self.state = VState::Receiving;
                    self.start_revote(actions);
                }
            }

            VState::SqlCloseWait => {
                if open {
                    actions.push(VoterAction::StopTimer(VoterTimer::SqlCloseWait));
                    let previous = self.active;
                    if previous != Some(index) {
                        if let Some(previous) = previous {
                            self.sats[previous].demote();
                        }
                    }
                    self.enter_receiving(index, actions);
                }
            }
        }
    }

    pub fn timer_expired(&mut self, timer: VoterTimer) -> Vec<VoterAction> {
        let mut actions = Vec::new();
        match (timer, self.state) {
            (VoterTimer::VotingDelay, VState::VotingDelay) => {
                self.recompute_best();
                match self.best.take() {
                    Some(best) => {
                        self.best_siglev = BEST_RX_SIGLEV_RESET;
                        self.enter_receiving(best, &mut actions);
                    }
                    None => self.state = VState::Idle,
                }
            }

            (VoterTimer::Revote, VState::Receiving) => {
                if let Some(challenger) = self.challenger() {
                    self.switch_target = Some(challenger);
                    self.state = VState::SwitchActiveRx;
                    actions.push(VoterAction::StopTimer(VoterTimer::Revote));
                    actions.push(VoterAction::StartTimer(
                        VoterTimer::RxSwitch,
                        Duration::from_millis(self.config.rx_switch_delay),
                    ));
                }
            }

            (VoterTimer::RxSwitch, VState::SwitchActiveRx) => {
                let target = self.switch_target.take();
                self.state = VState::Receiving;
                match target {
                    // Switch only if the candidate is still the better one.
                    Some(target) if self.is_better_than_active(target) => {
                        if let Some(active) = self.active {
                            self.sats[active].demote();
                        }
                        self.enter_receiving(target, &mut actions);
                    }
                    _ => self.start_revote(&mut actions),
                }
            }

            (VoterTimer::SqlCloseWait, VState::SqlCloseWait) => {
                self.close_squelch(&mut actions);
                self.state = VState::Idle;
            }

            // A stale timer from a state we already left.
            (timer, state) => {
                warn!("Ignoring stale voter timer {timer:?} in state {state:?}");
            }
        }
        actions
    }

    fn enter_receiving(&mut self, index: usize, actions: &mut Vec<VoterAction>) {
        self.active = Some(index);
        self.sql_rx_id = self.sats[index].id;
        self.state = VState::Receiving;

        let siglev = self.sats[index].signal_strength();
        info!(
            "Voter: squelch is OPEN ({}={siglev})",
            self.sats[index].name
        );
        actions.push(VoterAction::SquelchOpen {
            rx_id: self.sats[index].id,
            siglev,
        });

        let promoted = self.sats[index].promote();
        if !promoted.audio.is_empty() {
            actions.push(VoterAction::Audio(promoted.audio));
        }
        for (digit, duration_ms) in promoted.dtmf {
            actions.push(VoterAction::Dtmf { digit, duration_ms });
        }
        for sequence in promoted.selcall {
            actions.push(VoterAction::Selcall(sequence));
        }

        self.start_revote(actions);
    }

    fn start_revote(&self, actions: &mut Vec<VoterAction>) {
        actions.push(VoterAction::StartTimer(
            VoterTimer::Revote,
            Duration::from_millis(self.config.revote_interval),
        ));
    }

    fn close_squelch(&mut self, actions: &mut Vec<VoterAction>) {
        if let Some(active) = self.active.take() {
            let siglev = self.sats[active].signal_strength();
            info!(
                "Voter: squelch is CLOSED ({}={siglev})",
                self.sats[active].name
            );
            self.sats[active].demote();
            actions.push(VoterAction::SquelchClosed {
                rx_id: self.sats[active].id,
                siglev,
            });
        }
        self.switch_target = None;
    }

    fn recompute_best(&mut self) {
        self.best = None;
        self.best_siglev = BEST_RX_SIGLEV_RESET;
        for (i, sat) in self.sats.iter().enumerate() {
            if sat.squelch_is_open() && sat.signal_strength() > self.best_siglev {
                self.best = Some(i);
                self.best_siglev = sat.signal_strength();
            }
        }
    }

    /// A sub-receiver strictly better than the active one by more than the
    /// hysteresis, if any.
    fn challenger(&self) -> Option<usize> {
        let active = self.active?;
        let threshold = self.sats[active].signal_strength() + self.config.hysteresis;
        let mut best: Option<usize> = None;
        let mut best_siglev = threshold;
        for (i, sat) in self.sats.iter().enumerate() {
            if i != active && sat.squelch_is_open() && sat.signal_strength() > best_siglev {
                best = Some(i);
                best_siglev = sat.signal_strength();
            }
        }
        best
    }

    fn is_better_than_active(&self, index: usize) -> bool {
        let Some(active) = self.active else {
            return self.sats[index].squelch_is_open();
        };
        self.sats[index].squelch_is_open()
            && self.sats[index].signal_strength()
                > self.sats[active].signal_strength() + self.config.hysteresis
    }
}

/// A sub-receiver handed to the voter. The voter owns it outright.
#[derive(Debug)]
pub struct SubReceiver {
    pub name: String,
    pub port: RxPort,
}

/// Start the voter subsystem. Returns the RX port the voter presents
/// upstream.
#[instrument(skip(subsys, subs))]
pub fn start_voter(
    subsys: &SubsystemHandle,
    config: VoterConfig,
    subs: Vec<SubReceiver>,
) -> RxPort {
    let (port, event_tx, command_rx) = rx_port(256);

    subsys.start(SubsystemBuilder::new("voter", move |s| {
        run(s, config, subs, event_tx, command_rx)
    }));

    port
}

async fn run(
    subsys: SubsystemHandle,
    config: VoterConfig,
    subs: Vec<SubReceiver>,
    events: mpsc::Sender<RxEvent>,
    mut commands: mpsc::Receiver<RxCommand>,
) -> EchoResult<()> {
    let names: Vec<String> = subs.iter().map(|s| s.name.clone()).collect();
    info!("Voter started with receivers: {}", names.join(", "));

    // Merge all sub-receiver event streams into one tagged channel.
    let (merged_tx, mut merged_rx) = mpsc::channel::<(usize, RxEvent)>(256);
    let mut sub_commands = Vec::new();
    for (i, sub) in subs.into_iter().enumerate() {
        sub_commands.push(sub.port.commands);
        let tx = merged_tx.clone();
        let mut sub_events = sub.port.events;
        tokio::spawn(async move {
            while let Some(event) = sub_events.recv().await {
                if tx.send((i, event)).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(merged_tx);

    let mut core = VoterCore::new(config, &names);
    // A voter starts muted; the owning logic unmutes it.
    let mut voting_delay: Option<Pin<Box<Sleep>>> = None;
    let mut rx_switch: Option<Pin<Box<Sleep>>> = None;
    let mut sql_close: Option<Pin<Box<Sleep>>> = None;
    let mut revote: Option<time::Interval> = None;

    loop {
        let actions = select! {
            _ = subsys.on_shutdown_requested() => return Ok(()),

            Some((index, event)) = merged_rx.recv() => core.rx_event(index, event),

            command = commands.recv() => match command {
                Some(RxCommand::Mute(mute)) => core.set_mute(mute),
                Some(RxCommand::AddToneDetector(spec)) => {
                    for sub in &sub_commands {
                        sub.send(RxCommand::AddToneDetector(spec)).await.ok();
                    }
                    Vec::new()
                }
                Some(RxCommand::Reset) => {
                    for sub in &sub_commands {
                        sub.send(RxCommand::Reset).await.ok();
                    }
                    core.set_mute(true)
                }
                None => return Ok(()),
            },

            _ = async { voting_delay.as_mut().expect("guarded").await },
                if voting_delay.is_some() =>
            {
                voting_delay = None;
                core.timer_expired(VoterTimer::VotingDelay)
            }

            _ = async { rx_switch.as_mut().expect("guarded").await }, if rx_switch.is_some() => {
                rx_switch = None;
                core.timer_expired(VoterTimer::RxSwitch)
            }

            _ = async { sql_close.as_mut().expect("guarded").await }, if sql_close.is_some() => {
                sql_close = None;
                core.timer_expired(VoterTimer::SqlCloseWait)
            }

            _ = async { revote.as_mut().expect("guarded").tick().await }, if revote.is_some() => {
                core.timer_expired(VoterTimer::Revote)
            }
        };

        for action in actions {
            match action {
                VoterAction::Audio(samples) => {
                    events.send(RxEvent::Audio(samples)).await.ok();
                }
                VoterAction::SquelchOpen { rx_id, siglev } => {
                    events
                        .send(RxEvent::Squelch {
                            open: true,
                            siglev,
                            rx_id,
                        })
                        .await
                        .ok();
                }
                VoterAction::SquelchClosed { rx_id, siglev } => {
                    events
                        .send(RxEvent::Squelch {
                            open: false,
                            siglev,
                            rx_id,
                        })
                        .await
                        .ok();
                }
                VoterAction::Dtmf { digit, duration_ms } => {
                    events.send(RxEvent::Dtmf { digit, duration_ms }).await.ok();
                }
                VoterAction::Selcall(sequence) => {
                    events.send(RxEvent::Selcall(sequence)).await.ok();
                }
                VoterAction::Tone(fq) => {
                    events.send(RxEvent::Tone(fq)).await.ok();
                }
                VoterAction::StartTimer(timer, duration) => match timer {
                    VoterTimer::VotingDelay => voting_delay = Some(Box::pin(sleep(duration))),
                    VoterTimer::RxSwitch => rx_switch = Some(Box::pin(sleep(duration))),
                    VoterTimer::SqlCloseWait => sql_close = Some(Box::pin(sleep(duration))),
                    VoterTimer::Revote => {
                        revote =
                            Some(time::interval_at(time::Instant::now() + duration, duration));
                    }
                },
                VoterAction::StopTimer(timer) => match timer {
                    VoterTimer::VotingDelay => voting_delay = None,
                    VoterTimer::RxSwitch => rx_switch = None,
                    VoterTimer::SqlCloseWait => sql_close = None,
                    VoterTimer::Revote => revote = None,
                },
                VoterAction::MuteSubRx { index, mute } => {
                    sub_commands[index].send(RxCommand::Mute(mute)).await.ok();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> VoterConfig {
        VoterConfig {
            voting_delay: 100,
            buffer_length: Some(100),
            hysteresis: 2.0,
            sql_close_revote_delay: 500,
            rx_switch_delay: 500,
            revote_interval: 1000,
        }
    }

    fn unmuted_voter(n: usize) -> VoterCore {
        let names: Vec<String> = (1..=n).map(|i| format!("rx{i}")).collect();
        let mut core = VoterCore::new(config(), &names);
        core.set_mute(false);
        core
    }

    fn squelch(open: bool, siglev: f32) -> RxEvent {
        RxEvent::Squelch {
            open,
            siglev,
            rx_id: 0,
        }
    }

    fn has_squelch_open(actions: &[VoterAction], rx_id: u8) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, VoterAction::SquelchOpen { rx_id: id, .. } if *id == rx_id))
    }

    #[test]
    fn first_open_defers_by_the_voting_delay() {
        let mut core = unmuted_voter(2);
        let actions = core.rx_event(0, squelch(true, 0.0));
        assert!(actions.iter().any(|a| matches!(
            a,
            VoterAction::StartTimer(VoterTimer::VotingDelay, d) if *d == Duration::from_millis(100)
        )));
        assert!(!has_squelch_open(&actions, 1));
    }

    #[test]
    fn late_stronger_receiver_wins_the_vote() {
        let mut core = unmuted_voter(2);
        core.rx_event(0, squelch(true, 0.0));
        core.rx_event(1, squelch(true, 2.5));
        let actions = core.timer_expired(VoterTimer::VotingDelay);
        assert!(has_squelch_open(&actions, 2));
        assert_eq!(2, core.sql_rx_id());
    }

    #[test]
    fn all_closed_during_voting_delay_returns_to_idle() {
        let mut core = unmuted_voter(2);
        core.rx_event(0, squelch(true, 0.0));
        let actions = core.rx_event(0, squelch(false, 0.0));
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, VoterAction::StopTimer(VoterTimer::VotingDelay)))
        );
    }

    #[test]
    fn hysteresis_blocks_a_marginally_better_receiver() {
        let mut core = unmuted_voter(2);
        core.rx_event(0, squelch(true, 0.0));
        core.timer_expired(VoterTimer::VotingDelay);
        assert_eq!(1, core.sql_rx_id());

        // 1 dB better is within the 2 dB hysteresis.
        core.rx_event(1, squelch(true, 1.0));
        let actions = core.timer_expired(VoterTimer::Revote);
        assert!(
            !actions
                .iter()
                .any(|a| matches!(a, VoterAction::StartTimer(VoterTimer::RxSwitch, _)))
        );
        assert_eq!(1, core.sql_rx_id());
    }

    #[test]
    fn better_receiver_switches_after_the_switch_delay() {
        let mut core = unmuted_voter(2);
        core.rx_event(0, squelch(true, 0.0));
        core.timer_expired(VoterTimer::VotingDelay);

        core.rx_event(1, squelch(true, 3.0));
        let actions = core.timer_expired(VoterTimer::Revote);
        assert!(actions.iter().any(|a| matches!(
            a,
            VoterAction::StartTimer(VoterTimer::RxSwitch, d) if *d == Duration::from_millis(500)
        )));
        // Still streaming the old active while the switch delay runs.
        assert_eq!(1, core.sql_rx_id());

        let actions = core.timer_expired(VoterTimer::RxSwitch);
        assert!(has_squelch_open(&actions, 2));
        assert_eq!(2, core.sql_rx_id());
    }

    #[test]
    fn vanished_candidate_cancels_the_switch() {
        let mut core = unmuted_voter(2);
        core.rx_event(0, squelch(true, 0.0));
        core.timer_expired(VoterTimer::VotingDelay);
        core.rx_event(1, squelch(true, 3.0));
        core.timer_expired(VoterTimer::Revote);

        let actions = core.rx_event(1, squelch(false, 3.0));
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, VoterAction::StopTimer(VoterTimer::RxSwitch)))
        );
        assert_eq!(1, core.sql_rx_id());
    }

    #[test]
    fn only_the_active_receiver_reaches_the_output() {
        let mut core = unmuted_voter(2);
        core.rx_event(0, squelch(true, 0.0));
        core.timer_expired(VoterTimer::VotingDelay);

        core.rx_event(1, squelch(true, 0.5));
        let from_active = core.rx_event(0, RxEvent::Audio(vec![0.1, 0.2]));
        let from_other = core.rx_event(1, RxEvent::Audio(vec![0.9, 0.9]));

        assert!(from_active
            .iter()
            .any(|a| matches!(a, VoterAction::Audio(samples) if samples.ends_with(&[0.1, 0.2]))));
        assert!(!from_other
            .iter()
            .any(|a| matches!(a, VoterAction::Audio(_))));
    }

    #[test]
    fn buffered_audio_is_replayed_on_promotion() {
        let mut core = unmuted_voter(1);
        core.rx_event(0, squelch(true, 0.0));
        // Audio arriving during the voting delay is buffered, not lost.
        core.rx_event(0, RxEvent::Audio(vec![0.5; 32]));
        let actions = core.timer_expired(VoterTimer::VotingDelay);
        assert!(actions
            .iter()
            .any(|a| matches!(a, VoterAction::Audio(samples) if samples.len() == 32)));
    }

    #[test]
    fn buffered_dtmf_replays_exactly_once_in_order() {
        let mut core = unmuted_voter(2);
        core.rx_event(0, squelch(true, 0.0));
        core.rx_event(
            0,
            RxEvent::Dtmf {
                digit: '1',
                duration_ms: 80,
            },
        );
        core.rx_event(
            0,
            RxEvent::Dtmf {
                digit: '2',
                duration_ms: 80,
            },
        );
        let actions = core.timer_expired(VoterTimer::VotingDelay);
        let digits: Vec<char> = actions
            .iter()
            .filter_map(|a| match a {
                VoterAction::Dtmf { digit, .. } => Some(*digit),
                _ => None,
            })
            .collect();
        assert_eq!(vec!['1', '2'], digits);

        // Live digits now pass through directly, no replay.
        let actions = core.rx_event(
            0,
            RxEvent::Dtmf {
                digit: '3',
                duration_ms: 80,
            },
        );
        let digits: Vec<char> = actions
            .iter()
            .filter_map(|a| match a {
                VoterAction::Dtmf { digit, .. } => Some(*digit),
                _ => None,
            })
            .collect();
        assert_eq!(vec!['3'], digits);
    }

    #[test]
    fn sql_close_wait_hands_over_to_a_late_receiver() {
        let mut core = unmuted_voter(2);
        core.rx_event(0, squelch(true, 0.0));
        core.timer_expired(VoterTimer::VotingDelay);

        // Active closes: no squelch-closed yet, we wait.
        let actions = core.rx_event(0, squelch(false, 0.0));
        assert!(
            !actions
                .iter()
                .any(|a| matches!(a, VoterAction::SquelchClosed { .. }))
        );

        // Another receiver opens within the revote delay and takes over.
        let actions = core.rx_event(1, squelch(true, 1.0));
        assert!(has_squelch_open(&actions, 2));
        assert_eq!(2, core.sql_rx_id());
    }

    #[test]
    fn sql_close_wait_expiry_closes_the_squelch() {
        let mut core = unmuted_voter(2);
        core.rx_event(0, squelch(true, 0.0));
        core.timer_expired(VoterTimer::VotingDelay);
        core.rx_event(0, squelch(false, 0.0));
        let actions = core.timer_expired(VoterTimer::SqlCloseWait);
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, VoterAction::SquelchClosed { rx_id: 1, .. }))
        );
        assert_eq!(BEST_RX_SIGLEV_RESET, core.signal_strength());
    }

    #[test]
    fn mute_silences_everything_and_unmute_returns_to_idle() {
        let mut core = unmuted_voter(2);
        core.rx_event(0, squelch(true, 0.0));
        core.timer_expired(VoterTimer::VotingDelay);

        let actions = core.set_mute(true);
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, VoterAction::SquelchClosed { .. }))
        );
        assert!(core.is_muted());

        let actions = core.rx_event(0, RxEvent::Audio(vec![0.1]));
        assert!(actions.is_empty());

        core.set_mute(false);
        assert!(!core.is_muted());
    }
}
