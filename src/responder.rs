//! Claiming and defending a set of records.
//!
//! A responder probes for its unique name, announces, then answers
//! queries and probe challenges for as long as it lives. Conflicts while
//! probing rename the instance ("Box" becomes "Box (2)") and start over;
//! conflicts while responding send it back to probing. Shutting down
//! politely sends goodbyes first.

use crate::actors::probe::{Probe, ProbeOutcome};
use crate::actors::response::{GoodbyeResponse, MulticastResponse, UnicastResponse};
use crate::error::Error;
use crate::net::{InterfaceEvent, NetInterface};
use crate::timers::TimerSet;
use dnssd_proto::name;
use dnssd_proto::packet::record::{RData, ResourceRecord};
use dnssd_proto::packet::{Packet, RecordType};
use dnssd_proto::set::RecordSet;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Probing that makes no progress within this window is abandoned.
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);
/// Renames inside one window before the penalty kicks in.
const MAX_CONFLICTS: u32 = 15;
const CONFLICT_WINDOW: Duration = Duration::from_secs(15);
const CONFLICT_PENALTY: Duration = Duration::from_secs(5);
const ANNOUNCE_REPEATS: u32 = 3;

#[derive(Debug)]
pub(crate) enum ResponderEvent {
    /// The name is verified; announcements are on the wire.
    ProbingComplete,
    /// A conflict forced a new instance name (not yet verified).
    Renamed(String),
    Stopped,
    Error(Error),
}

enum ResponderCmd {
    UpdateEach {
        rtype: RecordType,
        mutate: Box<dyn FnMut(&mut ResourceRecord) + Send>,
    },
    Goodbye {
        done: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub(crate) struct ResponderHandle {
    cmd: mpsc::UnboundedSender<ResponderCmd>,
    stop: CancellationToken,
}

impl ResponderHandle {
    /// Mutate every record (and bridgeable record) of a type, re-probing
    /// or re-announcing as the current state demands.
    pub fn update_each<F>(&self, rtype: RecordType, mutate: F)
    where
        F: FnMut(&mut ResourceRecord) + Send + 'static,
    {
        let _ = self.cmd.send(ResponderCmd::UpdateEach {
            rtype,
            mutate: Box::new(mutate),
        });
    }

    /// Send goodbyes (when currently responding) and stop.
    pub async fn goodbye(&self) {
        let (done, wait) = oneshot::channel();
        if self.cmd.send(ResponderCmd::Goodbye { done }).is_err() {
            return;
        }
        let _ = wait.await;
    }

    /// Stop immediately, without goodbyes.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

enum Msg {
    ProbeTimeout,
    ConflictWindow,
}

enum AfterProbing {
    Respond { skip_announce: bool },
    Finished,
}

enum AfterResponding {
    Reprobe,
    Finished,
}

enum AnswerAction {
    ReAnnounce,
    Conflict,
    Nothing,
}

pub(crate) struct Responder;

impl Responder {
    /// The records must claim exactly one unique name; its leftmost label
    /// is the instance that gets renamed on conflict.
    pub fn spawn(
        interface: Arc<NetInterface>,
        records: Vec<ResourceRecord>,
        bridgeable: Vec<ResourceRecord>,
        wake: broadcast::Sender<()>,
    ) -> Result<(ResponderHandle, mpsc::UnboundedReceiver<ResponderEvent>), Error> {
        let unique_names: HashSet<String> = records
            .iter()
            .filter(|record| record.unique())
            .map(|record| name::key(&record.name))
            .collect();
        if unique_names.len() != 1 {
            return Err(Error::validation(
                "responder records must share exactly one unique name",
            ));
        }
        let fullname = records
            .iter()
            .find(|record| record.unique())
            .map(|record| record.name.clone())
            .unwrap_or_default();
        let instance = name::split_first_label(&fullname)
            .map(|(head, _)| head.to_string())
            .ok_or_else(|| Error::validation("responder name needs at least two labels"))?;

        let stop = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let task = ResponderTask {
            interface,
            records,
            bridgeable: bridgeable.into_iter().collect(),
            fullname,
            instance,
            conflict_count: 0,
            tx: event_tx,
            cmd_rx,
            timers: TimerSet::new(timer_tx),
            timer_rx,
            stop: stop.clone(),
            wake,
        };
        tokio::spawn(task.run());

        Ok((ResponderHandle { cmd: cmd_tx, stop }, event_rx))
    }
}

struct ResponderTask {
    interface: Arc<NetInterface>,
    records: Vec<ResourceRecord>,
    bridgeable: RecordSet,
    fullname: String,
    instance: String,
    conflict_count: u32,
    tx: mpsc::UnboundedSender<ResponderEvent>,
    cmd_rx: mpsc::UnboundedReceiver<ResponderCmd>,
    timers: TimerSet<Msg>,
    timer_rx: mpsc::UnboundedReceiver<Msg>,
    stop: CancellationToken,
    wake: broadcast::Sender<()>,
}

impl ResponderTask {
    async fn run(mut self) {
        let result = self.lifecycle().await;
        self.timers.clear();
        // sweep any children still attached to our token
        self.stop.cancel();
        if let Err(error) = result {
            let _ = self.tx.send(ResponderEvent::Error(error));
        }
        let _ = self.tx.send(ResponderEvent::Stopped);
    }

    async fn lifecycle(&mut self) -> Result<(), Error> {
        loop {
            match self.probing().await? {
                AfterProbing::Finished => return Ok(()),
                AfterProbing::Respond { skip_announce } => {
                    match self.responding(skip_announce).await? {
                        AfterResponding::Finished => return Ok(()),
                        AfterResponding::Reprobe => continue,
                    }
                }
            }
        }
    }

    async fn probing(&mut self) -> Result<AfterProbing, Error> {
        'restart: loop {
            self.timers
                .schedule("probe-timeout", PROBE_TIMEOUT, Msg::ProbeTimeout);

            if self.conflict_count >= MAX_CONFLICTS {
                tracing::debug!(
                    name = %self.fullname,
                    "conflict storm, waiting before the next probe"
                );
                tokio::select! {
                    _ = self.stop.cancelled() => return Ok(AfterProbing::Finished),
                    _ = tokio::time::sleep(CONFLICT_PENALTY) => {}
                }
            }

            let unique: Vec<ResourceRecord> = self
                .records
                .iter()
                .filter(|record| record.unique())
                .cloned()
                .collect();

            // the cache may already settle it without a network trip
            if !self.interface.cache().conflicting_with(&unique).is_empty() {
                self.rename();
                continue 'restart;
            }
            if unique.iter().all(|record| self.interface.cache().has(record)) {
                return Ok(AfterProbing::Respond {
                    skip_announce: true,
                });
            }

            let probe_stop = self.stop.child_token();
            let probe = Probe {
                interface: self.interface.clone(),
                records: unique.into_iter().collect(),
                bridgeable: self.bridgeable.clone(),
                stop: probe_stop.clone(),
                wake: self.wake.clone(),
            };
            let mut probe_task = tokio::spawn(probe.run());

            loop {
                tokio::select! {
                    outcome = &mut probe_task => {
                        match outcome.unwrap_or(ProbeOutcome::Stopped) {
                            ProbeOutcome::Ready { early } => {
                                return Ok(AfterProbing::Respond { skip_announce: early });
                            }
                            ProbeOutcome::Conflict => {
                                self.rename();
                                continue 'restart;
                            }
                            ProbeOutcome::Stopped => {
                                if self.stop.is_cancelled() {
                                    return Ok(AfterProbing::Finished);
                                }
                                if self.interface.has_failed() {
                                    return Err(Error::Interface(
                                        self.interface.error_message().unwrap_or_default(),
                                    ));
                                }
                                // woke from sleep: verify the name again
                                continue 'restart;
                            }
                        }
                    }
                    Some(msg) = self.timer_rx.recv() => match msg {
                        Msg::ProbeTimeout => {
                            probe_stop.cancel();
                            return Err(Error::Timeout);
                        }
                        Msg::ConflictWindow => self.conflict_count = 0,
                    },
                    Some(cmd) = self.cmd_rx.recv() => match cmd {
                        ResponderCmd::UpdateEach { rtype, mutate } => {
                            probe_stop.cancel();
                            let _ = (&mut probe_task).await;
                            self.apply_update(rtype, mutate);
                            continue 'restart;
                        }
                        ResponderCmd::Goodbye { done } => {
                            // nothing was announced, nothing to retract
                            probe_stop.cancel();
                            let _ = done.send(());
                            return Ok(AfterProbing::Finished);
                        }
                    },
                }
            }
        }
    }

    async fn responding(&mut self, skip_announce: bool) -> Result<AfterResponding, Error> {
        self.timers.cancel("probe-timeout");

        let phase = self.stop.child_token();
        let mut announce_stop = phase.child_token();
        if !skip_announce {
            self.announce(ANNOUNCE_REPEATS, announce_stop.clone());
        }
        let _ = self.tx.send(ResponderEvent::ProbingComplete);

        let mut events = self.interface.subscribe();
        let mut error = self.interface.error_rx();
        let mut wake_rx = self.wake.subscribe();

        let out = loop {
            tokio::select! {
                _ = self.stop.cancelled() => break Ok(AfterResponding::Finished),
                _ = error.changed() => {
                    break Err(Error::Interface(
                        self.interface.error_message().unwrap_or_default(),
                    ));
                }
                _ = wake_rx.recv() => break Ok(AfterResponding::Reprobe),
                Some(msg) = self.timer_rx.recv() => {
                    if let Msg::ConflictWindow = msg {
                        self.conflict_count = 0;
                    }
                }
                Some(cmd) = self.cmd_rx.recv() => match cmd {
                    ResponderCmd::UpdateEach { rtype, mutate } => {
                        self.apply_update(rtype, mutate);
                        announce_stop.cancel();
                        announce_stop = phase.child_token();
                        self.announce(ANNOUNCE_REPEATS, announce_stop.clone());
                    }
                    ResponderCmd::Goodbye { done } => {
                        announce_stop.cancel();
                        let goodbyes: Vec<ResourceRecord> = self
                            .records
                            .iter()
                            .filter(|record| record.can_goodbye())
                            .cloned()
                            .collect();
                        GoodbyeResponse {
                            interface: self.interface.clone(),
                            records: goodbyes,
                            stop: self.stop.child_token(),
                        }
                        .run()
                        .await;
                        let _ = done.send(());
                        break Ok(AfterResponding::Finished);
                    }
                },
                event = events.recv() => match event {
                    Ok(InterfaceEvent::Probe(packet)) => self.defend(&packet, &phase),
                    Ok(InterfaceEvent::Query(packet)) => self.answer_query(&packet, &phase),
                    Ok(InterfaceEvent::Answer(packet)) => match self.check_answer(&packet) {
                        AnswerAction::ReAnnounce => {
                            announce_stop.cancel();
                            announce_stop = phase.child_token();
                            self.announce(1, announce_stop.clone());
                        }
                        AnswerAction::Conflict => break Ok(AfterResponding::Reprobe),
                        AnswerAction::Nothing => {}
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        break Ok(AfterResponding::Finished);
                    }
                },
            }
        };
        phase.cancel();
        out
    }

    fn announce(&self, repeats: u32, stop: CancellationToken) {
        let response = MulticastResponse {
            interface: self.interface.clone(),
            records: self.records.clone(),
            defensive: false,
            repeats,
            stop,
        };
        tokio::spawn(response.run());
    }

    /// Someone is probing for a name we already verified. Answer fast so
    /// they back down.
    fn defend(&self, packet: &Packet, phase: &CancellationToken) {
        let Some(origin) = packet.origin else {
            return;
        };
        let mut multicast = Vec::new();
        let mut unicast = Vec::new();

        for question in &packet.questions {
            if !name::eq_ignore_case(&question.name, &self.fullname) {
                continue;
            }
            let answers: Vec<ResourceRecord> = self
                .records
                .iter()
                .filter(|record| record.answers(question))
                .cloned()
                .collect();
            if answers.is_empty() {
                if let Some(nsec) = self.nsec_for(&question.name) {
                    multicast.push(nsec);
                }
                continue;
            }
            for record in answers {
                if self.wants_unicast(question.unicast_preferred, &record) {
                    unicast.push(record);
                } else {
                    multicast.push(record);
                }
            }
        }

        if !multicast.is_empty() {
            tokio::spawn(
                MulticastResponse {
                    interface: self.interface.clone(),
                    records: multicast,
                    defensive: true,
                    repeats: 1,
                    stop: phase.child_token(),
                }
                .run(),
            );
        }
        if !unicast.is_empty() {
            tokio::spawn(
                UnicastResponse {
                    interface: self.interface.clone(),
                    origin,
                    records: unicast,
                    legacy: false,
                    defensive: true,
                    query_id: packet.header.id,
                    questions: Vec::new(),
                }
                .run(),
            );
        }
    }

    fn answer_query(&self, packet: &Packet, phase: &CancellationToken) {
        let Some(origin) = packet.origin else {
            return;
        };
        let legacy = packet.is_legacy();
        let mut multicast = Vec::new();
        let mut unicast = Vec::new();
        let mut legacy_answers = Vec::new();

        for question in &packet.questions {
            let answering: Vec<ResourceRecord> = self
                .records
                .iter()
                .filter(|record| record.answers(question))
                .cloned()
                .collect();

            if answering.is_empty() {
                // we own this name but have nothing of that type: say so
                if !legacy && name::eq_ignore_case(&question.name, &self.fullname) {
                    if let Some(nsec) = self.nsec_for(&question.name) {
                        multicast.push(nsec);
                    }
                }
                continue;
            }

            for record in answering {
                // the querier already holds a fresh copy
                let known = packet.answers.iter().any(|answer| {
                    answer.matches(&record) && answer.ttl as u64 * 2 > record.ttl as u64
                });
                if known {
                    continue;
                }
                if legacy {
                    legacy_answers.push(record);
                } else if self.wants_unicast(question.unicast_preferred, &record) {
                    unicast.push(record);
                } else {
                    multicast.push(record);
                }
            }
        }

        if !multicast.is_empty() {
            tokio::spawn(
                MulticastResponse {
                    interface: self.interface.clone(),
                    records: multicast,
                    defensive: false,
                    repeats: 1,
                    stop: phase.child_token(),
                }
                .run(),
            );
        }
        if !unicast.is_empty() {
            tokio::spawn(
                UnicastResponse {
                    interface: self.interface.clone(),
                    origin,
                    records: unicast,
                    legacy: false,
                    defensive: false,
                    query_id: packet.header.id,
                    questions: Vec::new(),
                }
                .run(),
            );
        }
        if !legacy_answers.is_empty() {
            tokio::spawn(
                UnicastResponse {
                    interface: self.interface.clone(),
                    origin,
                    records: legacy_answers,
                    legacy: true,
                    defensive: false,
                    query_id: packet.header.id,
                    questions: packet.questions.clone(),
                }
                .run(),
            );
        }
    }

    fn wants_unicast(&self, unicast_preferred: bool, record: &ResourceRecord) -> bool {
        if !unicast_preferred {
            return false;
        }
        let window = Duration::from_secs((record.ttl / 4) as u64);
        !self
            .interface
            .has_recently_sent(&record.record_key(), window)
    }

    fn check_answer(&self, packet: &Packet) -> AnswerAction {
        let ours: RecordSet = self.records.iter().cloned().collect();
        let incoming: RecordSet = packet
            .answers
            .iter()
            .chain(packet.additionals.iter())
            .cloned()
            .collect();

        let conflicts = ours.conflicts(&incoming);
        if conflicts
            .iter()
            .any(|(_, theirs)| !self.bridgeable.has(theirs))
        {
            tracing::debug!(name = %self.fullname, "conflicting answer, probing again");
            return AnswerAction::Conflict;
        }

        // somebody said goodbye on our behalf, or our own records looped
        // back over a bridge: set the record straight
        let goodbye_hit = incoming
            .iter()
            .any(|record| record.ttl == 0 && ours.has(record));
        if goodbye_hit || !conflicts.is_empty() {
            return AnswerAction::ReAnnounce;
        }
        AnswerAction::Nothing
    }

    fn nsec_for(&self, qname: &str) -> Option<ResourceRecord> {
        self.records
            .iter()
            .find(|record| {
                matches!(record.rdata, RData::NSEC(_)) && name::eq_ignore_case(&record.name, qname)
            })
            .cloned()
    }

    fn rename(&mut self) {
        let old_fullname = self.fullname.clone();
        let tail = name::split_first_label(&old_fullname)
            .map(|(_, tail)| tail.to_string())
            .unwrap_or_default();
        self.instance = next_instance(&self.instance);
        let new_fullname = format!("{}.{}", self.instance, tail);

        for record in &mut self.records {
            rewrite_name(record, &old_fullname, &new_fullname);
            for additional in &mut record.additionals {
                rewrite_name(additional, &old_fullname, &new_fullname);
            }
        }
        self.bridgeable
            .update_each(|record| rewrite_name(record, &old_fullname, &new_fullname));

        self.fullname = new_fullname;
        self.conflict_count += 1;
        self.timers
            .schedule("conflict-window", CONFLICT_WINDOW, Msg::ConflictWindow);

        tracing::info!(from = %old_fullname, to = %self.fullname, "renamed after conflict");
        let _ = self
            .tx
            .send(ResponderEvent::Renamed(self.instance.clone()));
    }

    fn apply_update(
        &mut self,
        rtype: RecordType,
        mut mutate: Box<dyn FnMut(&mut ResourceRecord) + Send>,
    ) {
        for record in &mut self.records {
            if record.rrtype() == rtype {
                mutate(record);
            }
            for additional in &mut record.additionals {
                if additional.rrtype() == rtype {
                    mutate(additional);
                }
            }
        }
        self.bridgeable.update_each(|record| {
            if record.rrtype() == rtype {
                mutate(record);
            }
        });
    }
}

/// `"Box"` becomes `"Box (2)"`, `"Box (2)"` becomes `"Box (3)"`.
fn next_instance(instance: &str) -> String {
    if let Some(start) = instance.rfind(" (") {
        if let Some(number) = instance[start + 2..].strip_suffix(')') {
            if let Ok(number) = number.parse::<u32>() {
                return format!("{} ({})", &instance[..start], number + 1);
            }
        }
    }
    format!("{instance} (2)")
}

fn rewrite_name(record: &mut ResourceRecord, old: &str, new: &str) {
    if name::eq_ignore_case(&record.name, old) {
        record.name = new.to_string();
    }
    if let RData::PTR(target) = &mut record.rdata {
        if name::eq_ignore_case(target, old) {
            *target = new.to_string();
        }
    }
}
