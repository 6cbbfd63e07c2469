//! Claiming unique records: three probes 250 ms apart, then the name is
//! ours unless somebody answered with conflicting data or outranked us in
//! a simultaneous probe.

use crate::net::{InterfaceEvent, NetInterface};
use dnssd_proto::name;
use dnssd_proto::packet::question::QueryRecord;
use dnssd_proto::packet::record::ResourceRecord;
use dnssd_proto::packet::{Packet, RecordType};
use dnssd_proto::set::RecordSet;

use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const PROBE_INTERVAL: Duration = Duration::from_millis(250);
const TIEBREAK_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    /// Nobody objected. `early` means the network already carried every
    /// proposed record, so announcing can be skipped.
    Ready { early: bool },
    /// Someone owns conflicting data; the caller has to rename.
    Conflict,
    /// Cancelled, interface failure, or wake from sleep.
    Stopped,
}

pub(crate) struct Probe {
    pub interface: Arc<NetInterface>,
    /// The unique records being claimed.
    pub records: RecordSet,
    /// Our own records expected to loop back over bridged interfaces;
    /// never treated as conflicts.
    pub bridgeable: RecordSet,
    pub stop: CancellationToken,
    pub wake: broadcast::Sender<()>,
}

impl Probe {
    pub async fn run(self) -> ProbeOutcome {
        let mut events = self.interface.subscribe();
        let mut error = self.interface.error_rx();
        let mut wake = self.wake.subscribe();
        if self.interface.has_failed() {
            return ProbeOutcome::Stopped;
        }

        let packet = self.build_packet();
        let initial = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        let mut next = tokio::time::Instant::now() + initial;
        let mut sent = 0u8;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return ProbeOutcome::Stopped,
                _ = error.changed() => return ProbeOutcome::Stopped,
                _ = wake.recv() => return ProbeOutcome::Stopped,
                _ = tokio::time::sleep_until(next) => {
                    if sent == 3 {
                        return ProbeOutcome::Ready { early: false };
                    }
                    if self.interface.send(&packet, None).await.is_err() {
                        return ProbeOutcome::Stopped;
                    }
                    sent += 1;
                    next += PROBE_INTERVAL;
                }
                event = events.recv() => match event {
                    Ok(InterfaceEvent::Answer(answer)) => {
                        if let Some(outcome) = self.check_answer(&answer) {
                            return outcome;
                        }
                    }
                    Ok(InterfaceEvent::Probe(incoming)) => {
                        if self.loses_tiebreak(&incoming) {
                            tracing::debug!("lost simultaneous probe tiebreak, backing off");
                            sent = 0;
                            next = tokio::time::Instant::now() + TIEBREAK_BACKOFF;
                        }
                    }
                    Ok(InterfaceEvent::Query(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("probe missed {skipped} interface events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return ProbeOutcome::Stopped,
                }
            }
        }
    }

    /// One question per distinct name, asking for anything, with the
    /// proposed records in the authority section.
    fn build_packet(&self) -> Packet {
        let mut seen = std::collections::HashSet::new();
        let mut questions = Vec::new();
        for record in self.records.iter() {
            if seen.insert(name::key(&record.name)) {
                questions.push(QueryRecord::new(&record.name, RecordType::ANY).unicast());
            }
        }
        Packet::query()
            .with_questions(questions)
            .with_authorities(self.records.to_vec())
    }

    fn check_answer(&self, packet: &Packet) -> Option<ProbeOutcome> {
        let incoming: RecordSet = packet
            .answers
            .iter()
            .chain(packet.additionals.iter())
            .cloned()
            .collect();

        // everything we wanted to claim is already out there, verbatim
        if incoming.has_each(&self.records) {
            return Some(ProbeOutcome::Ready { early: true });
        }

        let real_conflict = self
            .records
            .conflicts(&incoming)
            .into_iter()
            .any(|(_, theirs)| !self.bridgeable.has(theirs));
        if real_conflict {
            return Some(ProbeOutcome::Conflict);
        }
        None
    }

    /// RFC 6762 §8.2: both sides sort the records they are proposing for
    /// a name and compare them pairwise; the lexicographically lesser
    /// proposal waits.
    fn loses_tiebreak(&self, packet: &Packet) -> bool {
        let mut ours: HashMap<String, Vec<&ResourceRecord>> = HashMap::new();
        for record in self.records.iter() {
            ours.entry(name::key(&record.name)).or_default().push(record);
        }
        let mut theirs: HashMap<String, Vec<&ResourceRecord>> = HashMap::new();
        for record in &packet.authorities {
            theirs
                .entry(name::key(&record.name))
                .or_default()
                .push(record);
        }

        for (key, our_group) in &mut ours {
            let Some(their_group) = theirs.get_mut(key) else {
                continue;
            };
            our_group.sort_by_key(|record| record.rrtype_num());
            their_group.sort_by_key(|record| record.rrtype_num());

            let mut lost = our_group.len() < their_group.len();
            for (our_record, their_record) in our_group.iter().zip(their_group.iter()) {
                match our_record.cmp_tiebreak(their_record) {
                    Ordering::Less => return true,
                    Ordering::Greater => {
                        lost = false;
                        break;
                    }
                    Ordering::Equal => {}
                }
            }
            if lost {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::{Probe, ProbeOutcome};
    use crate::net::NetInterface;
    use dnssd_proto::packet::record::ResourceRecord;
    use dnssd_proto::packet::Packet;
    use dnssd_proto::set::RecordSet;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    fn remote() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77)), 5353)
    }

    fn our_record() -> ResourceRecord {
        ResourceRecord::a("box.local.", Ipv4Addr::new(192, 168, 1, 10))
    }

    fn probe(interface: Arc<NetInterface>, stop: CancellationToken) -> Probe {
        let (wake, _) = broadcast::channel(4);
        Probe {
            interface,
            records: [our_record()].into_iter().collect(),
            bridgeable: RecordSet::new(),
            stop,
            wake,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_send_three_probes_then_complete() {
        let (interface, mut tap) = NetInterface::test();
        let started = tokio::time::Instant::now();
        let outcome = probe(interface, CancellationToken::new()).run().await;
        assert_eq!(outcome, ProbeOutcome::Ready { early: false });

        // initial jitter 0-250ms, then three packets 250ms apart, done
        // 250ms after the last
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(750));
        assert!(elapsed <= Duration::from_millis(1000));

        let mut sends = Vec::new();
        while let Ok((packet, dest)) = tap.try_recv() {
            assert!(dest.is_none());
            sends.push(packet);
        }
        assert_eq!(sends.len(), 3);
        for packet in &sends {
            assert!(packet.is_probe());
            assert_eq!(packet.questions.len(), 1);
            assert!(packet.questions[0].unicast_preferred);
            assert_eq!(packet.authorities.len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_conflict_on_competing_answer() {
        let (interface, _tap) = NetInterface::test();
        let handle = tokio::spawn(probe(interface.clone(), CancellationToken::new()).run());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let competing = Packet::response().with_answers(vec![ResourceRecord::a(
            "box.local.",
            Ipv4Addr::new(4, 3, 2, 1),
        )]);
        interface.inject(&competing, remote());

        assert_eq!(handle.await.unwrap(), ProbeOutcome::Conflict);
    }

    #[tokio::test(start_paused = true)]
    async fn should_complete_early_when_records_already_live() {
        let (interface, _tap) = NetInterface::test();
        let handle = tokio::spawn(probe(interface.clone(), CancellationToken::new()).run());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let ours = Packet::response().with_answers(vec![our_record()]);
        interface.inject(&ours, remote());

        assert_eq!(handle.await.unwrap(), ProbeOutcome::Ready { early: true });
    }

    #[tokio::test(start_paused = true)]
    async fn should_ignore_bridged_conflicts() {
        let (interface, _tap) = NetInterface::test();
        let bridged = ResourceRecord::a("box.local.", Ipv4Addr::new(192, 168, 2, 10));
        let (wake, _) = broadcast::channel(4);
        let probe = Probe {
            interface: interface.clone(),
            records: [our_record()].into_iter().collect(),
            bridgeable: [bridged.clone()].into_iter().collect(),
            stop: CancellationToken::new(),
            wake,
        };
        let handle = tokio::spawn(probe.run());

        tokio::time::sleep(Duration::from_millis(300)).await;
        interface.inject(&Packet::response().with_answers(vec![bridged]), remote());

        assert_eq!(handle.await.unwrap(), ProbeOutcome::Ready { early: false });
    }

    #[tokio::test(start_paused = true)]
    async fn should_back_off_after_losing_a_tiebreak() {
        let (interface, mut tap) = NetInterface::test();
        let handle = tokio::spawn(probe(interface.clone(), CancellationToken::new()).run());

        // wait for the first of our probes to go out
        tokio::time::sleep(Duration::from_millis(260)).await;
        let first_sends = {
            let mut count = 0;
            while tap.try_recv().is_ok() {
                count += 1;
            }
            count
        };
        assert!(first_sends >= 1);

        // a competitor probes the same name with greater rdata: we lose
        let competing = Packet::query()
            .with_questions(vec![dnssd_proto::packet::question::QueryRecord::new(
                "box.local.",
                dnssd_proto::packet::RecordType::ANY,
            )])
            .with_authorities(vec![ResourceRecord::a(
                "box.local.",
                Ipv4Addr::new(250, 250, 250, 250),
            )]);
        interface.inject(&competing, remote());

        let restarted = tokio::time::Instant::now();
        assert_eq!(
            handle.await.unwrap(),
            ProbeOutcome::Ready { early: false }
        );
        // the full three-probe schedule ran again after the 1s backoff
        assert!(restarted.elapsed() >= Duration::from_millis(1750));
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_on_cancellation() {
        let (interface, _tap) = NetInterface::test();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(probe(interface, stop.clone()).run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        assert_eq!(handle.await.unwrap(), ProbeOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_on_interface_failure() {
        let (interface, _tap) = NetInterface::test();
        let handle = tokio::spawn(probe(interface.clone(), CancellationToken::new()).run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        interface.inject_failure();
        assert_eq!(handle.await.unwrap(), ProbeOutcome::Stopped);
    }
}
