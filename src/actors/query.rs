//! Continuous and one-shot queries.
//!
//! A query checks the interface cache before touching the network,
//! suppresses questions other local queriers just asked, attaches known
//! answers so responders keep quiet about records we already hold, and
//! retransmits on a doubling schedule capped at an hour. Every
//! retransmission timer is lazy so a resumed machine does not replay a
//! backlog.

use crate::cache::{CacheEvent, FIND_CUTOFF};
use crate::net::{InterfaceEvent, NetInterface};
use crate::timers::TimerSet;
use dnssd_proto::packet::question::{QueryRecord, QuestionKey};
use dnssd_proto::packet::record::{RecordKey, ResourceRecord};
use dnssd_proto::packet::Packet;

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Known answers below half their original TTL are not worth attaching.
const KNOWN_ANSWER_CUTOFF: f64 = 0.50;
const FIRST_RETRANSMIT: Duration = Duration::from_secs(1);
const MAX_RETRANSMIT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub(crate) struct QueryOptions {
    pub questions: Vec<QueryRecord>,
    /// Keep re-asking after the first answer.
    pub continuous: bool,
    /// Skip the cache pass and go straight to the network.
    pub ignore_cache: bool,
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn new(questions: Vec<QueryRecord>) -> Self {
        Self {
            questions,
            continuous: true,
            ignore_cache: false,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum QueryEvent {
    Answer {
        record: ResourceRecord,
        /// The other records that traveled in the same packet.
        related: Vec<ResourceRecord>,
    },
    Timeout,
}

enum QueryMsg {
    Send,
    Timeout,
}

pub(crate) struct Query;

impl Query {
    pub fn spawn(
        interface: Arc<NetInterface>,
        options: QueryOptions,
        wake: broadcast::Sender<()>,
        stop: CancellationToken,
    ) -> mpsc::UnboundedReceiver<QueryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        Self::spawn_with(interface, options, wake, stop, tx);
        rx
    }

    /// Spawn with a caller-provided event channel, so one consumer can
    /// merge several queries.
    pub fn spawn_with(
        interface: Arc<NetInterface>,
        options: QueryOptions,
        wake: broadcast::Sender<()>,
        stop: CancellationToken,
        tx: mpsc::UnboundedSender<QueryEvent>,
    ) {
        tokio::spawn(run(interface, options, wake, stop, tx));
    }
}

/// Known answers with the time we learned them, so their remaining TTL
/// can be judged at packet-build time.
#[derive(Default)]
struct KnownAnswers {
    entries: HashMap<RecordKey, (ResourceRecord, Instant)>,
}

impl KnownAnswers {
    fn add(&mut self, record: ResourceRecord) {
        self.entries
            .insert(record.record_key(), (record, Instant::now()));
    }

    fn delete(&mut self, record: &ResourceRecord) {
        self.entries.remove(&record.record_key());
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    /// Clones above the cutoff, TTL decremented and cache-flush cleared.
    fn above_ttl(&self, cutoff: f64) -> Vec<ResourceRecord> {
        self.entries
            .values()
            .filter_map(|(record, learned)| {
                let original = record.ttl as f64;
                let remaining = original - learned.elapsed().as_secs_f64();
                if remaining <= cutoff * original {
                    return None;
                }
                Some(
                    record
                        .clone()
                        .with_ttl(remaining as u32)
                        .with_cache_flush(false),
                )
            })
            .collect()
    }
}

async fn run(
    interface: Arc<NetInterface>,
    options: QueryOptions,
    wake: broadcast::Sender<()>,
    stop: CancellationToken,
    tx: mpsc::UnboundedSender<QueryEvent>,
) {
    let original = options.questions.clone();
    let mut questions: Vec<QueryRecord> = Vec::new();
    let mut known = KnownAnswers::default();

    // answer what we can from the cache; unique hits retire their
    // question entirely, shared hits only seed the known-answer list
    for question in &original {
        if options.ignore_cache {
            questions.push(question.clone());
            continue;
        }
        let hits = interface.cache().find(question, FIND_CUTOFF);
        if hits.is_empty() {
            questions.push(question.clone());
            continue;
        }
        for (index, hit) in hits.iter().enumerate() {
            let related = hits
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != index)
                .map(|(_, record)| record.clone())
                .collect();
            let _ = tx.send(QueryEvent::Answer {
                record: hit.clone(),
                related,
            });
        }
        if hits.iter().any(|hit| hit.unique()) {
            continue;
        }
        for hit in hits {
            known.add(hit);
        }
        questions.push(question.clone());
    }
    if questions.is_empty() {
        return;
    }

    let mut events = interface.subscribe();
    let mut error = interface.error_rx();
    let mut cache_events = interface.cache().subscribe();
    let mut wake_rx = wake.subscribe();
    if interface.has_failed() {
        return;
    }

    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
    let mut timers: TimerSet<QueryMsg> = TimerSet::new(timer_tx);

    // the next packet is prepared ahead of the send so questions heard
    // from other queriers can still be dropped from it
    let mut queued: Vec<QueryRecord> = questions.clone();
    let mut retransmit = FIRST_RETRANSMIT;
    let mut timeout_armed = false;

    let initial = Duration::from_millis(rand::thread_rng().gen_range(20..120));
    timers.schedule("send", initial, QueryMsg::Send);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = error.changed() => return,
            _ = wake_rx.recv() => {
                // back from sleep: whatever we knew may be stale
                questions = original.clone();
                queued = questions.clone();
                known.clear();
                retransmit = FIRST_RETRANSMIT;
                timers.schedule("send", Duration::ZERO, QueryMsg::Send);
            }
            Some(msg) = timer_rx.recv() => match msg {
                QueryMsg::Send => {
                    if !queued.is_empty() {
                        let packet = Packet::query()
                            .with_questions(queued.clone())
                            .with_answers(known.above_ttl(KNOWN_ANSWER_CUTOFF));
                        if interface.send(&packet, None).await.is_err() {
                            return;
                        }
                    }
                    if !timeout_armed {
                        if let Some(timeout) = options.timeout {
                            timers.schedule("timeout", timeout, QueryMsg::Timeout);
                        }
                        timeout_armed = true;
                    }
                    queued = questions.clone();
                    if options.continuous {
                        timers.schedule_lazy("send", retransmit, QueryMsg::Send);
                        retransmit = (retransmit * 2).min(MAX_RETRANSMIT);
                    }
                }
                QueryMsg::Timeout => {
                    let _ = tx.send(QueryEvent::Timeout);
                    return;
                }
            },
            event = events.recv() => match event {
                Ok(InterfaceEvent::Answer(packet)) => {
                    if handle_answer(&packet, &mut questions, &mut queued, &mut known, &tx)
                        && !options.continuous
                    {
                        return;
                    }
                    if questions.is_empty() {
                        return;
                    }
                }
                Ok(InterfaceEvent::Query(packet)) => {
                    suppress_duplicates(&interface, &packet, &mut queued);
                }
                Ok(InterfaceEvent::Probe(_)) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("query missed {skipped} interface events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            cache_event = cache_events.recv() => {
                if let Ok(CacheEvent::Expired(record)) = cache_event {
                    known.delete(&record);
                }
            }
        }
    }
}

/// Pair every incoming record against the open questions. Returns whether
/// anything answered.
fn handle_answer(
    packet: &Packet,
    questions: &mut Vec<QueryRecord>,
    queued: &mut Vec<QueryRecord>,
    known: &mut KnownAnswers,
    tx: &mpsc::UnboundedSender<QueryEvent>,
) -> bool {
    let mut answered = false;
    let mut retired: HashSet<QuestionKey> = HashSet::new();

    for (index, record) in packet.answers.iter().enumerate() {
        for question in questions.iter() {
            if !record.answers(question) {
                continue;
            }
            answered = true;
            let related: Vec<ResourceRecord> = packet
                .answers
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != index)
                .map(|(_, sibling)| sibling.clone())
                .chain(packet.additionals.iter().cloned())
                .collect();
            let _ = tx.send(QueryEvent::Answer {
                record: record.clone(),
                related,
            });
            if record.unique() {
                retired.insert(question.key());
            } else {
                known.add(record.clone());
            }
        }
    }

    if !retired.is_empty() {
        questions.retain(|question| !retired.contains(&question.key()));
        queued.retain(|question| !retired.contains(&question.key()));
    }
    answered
}

/// Somebody else on the network just asked one of our multicast
/// questions; asking again right away would be noise. Unicast-preferred
/// questions are kept, their answers would not reach us otherwise.
fn suppress_duplicates(interface: &NetInterface, packet: &Packet, queued: &mut Vec<QueryRecord>) {
    if packet.is_local(&interface.local_addresses()) || !packet.answers.is_empty() {
        return;
    }
    queued.retain(|ours| {
        ours.unicast_preferred
            || !packet
                .questions
                .iter()
                .any(|theirs| !theirs.unicast_preferred && theirs.key() == ours.key())
    });
}

#[cfg(test)]
mod tests {
    use super::{Query, QueryEvent, QueryOptions};
    use crate::net::NetInterface;
    use dnssd_proto::packet::question::QueryRecord;
    use dnssd_proto::packet::record::ResourceRecord;
    use dnssd_proto::packet::{Packet, RecordType};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    fn remote() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77)), 5353)
    }

    fn local() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 5353)
    }

    fn spawn(
        interface: &Arc<NetInterface>,
        options: QueryOptions,
    ) -> tokio::sync::mpsc::UnboundedReceiver<QueryEvent> {
        let (wake, _) = broadcast::channel(4);
        Query::spawn(interface.clone(), options, wake, CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn should_send_first_packet_after_short_jitter() {
        let (interface, mut tap) = NetInterface::test();
        let _rx = spawn(
            &interface,
            QueryOptions::new(vec![QueryRecord::new("box.local.", RecordType::A)]),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tap.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(120)).await;
        let (packet, dest) = tap.try_recv().unwrap();
        assert!(dest.is_none());
        assert!(packet.is_query());
        assert_eq!(packet.questions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_retransmit_with_doubling_delay() {
        let (interface, mut tap) = NetInterface::test();
        let _rx = spawn(
            &interface,
            QueryOptions::new(vec![QueryRecord::new("box.local.", RecordType::A)]),
        );

        // first at <=120ms, then +1s, +2s: three packets by 3.2s
        tokio::time::sleep(Duration::from_millis(3200)).await;
        let mut count = 0;
        while tap.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn should_answer_from_cache_without_sending() {
        let (interface, mut tap) = NetInterface::test();
        let record = ResourceRecord::a("box.local.", Ipv4Addr::new(1, 2, 3, 4));
        interface.inject(
            &Packet::response().with_answers(vec![record.clone()]),
            remote(),
        );

        let mut rx = spawn(
            &interface,
            QueryOptions::new(vec![QueryRecord::new("box.local.", RecordType::A)]),
        );

        match rx.recv().await.unwrap() {
            QueryEvent::Answer { record: hit, .. } => assert!(hit.matches(&record)),
            other => panic!("unexpected event {other:?}"),
        }
        // the unique cache hit retired the only question
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(tap.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn should_emit_answers_with_siblings() {
        let (interface, _tap) = NetInterface::test();
        let mut rx = spawn(
            &interface,
            QueryOptions::new(vec![QueryRecord::new("_http._tcp.local.", RecordType::PTR)]),
        );
        tokio::time::sleep(Duration::from_millis(150)).await;

        let ptr = ResourceRecord::ptr("_http._tcp.local.", "Box._http._tcp.local.");
        let srv = ResourceRecord::srv("Box._http._tcp.local.", "box.local.", 80);
        interface.inject(
            &Packet::response()
                .with_answers(vec![ptr.clone()])
                .with_additionals(vec![srv.clone()]),
            remote(),
        );

        match rx.recv().await.unwrap() {
            QueryEvent::Answer { record, related } => {
                assert!(record.matches(&ptr));
                assert_eq!(related.len(), 1);
                assert!(related[0].matches(&srv));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_attach_known_answers_above_half_ttl() {
        let (interface, mut tap) = NetInterface::test();
        let ptr = ResourceRecord::ptr("_http._tcp.local.", "Inst._http._tcp.local.");
        interface.inject(&Packet::response().with_answers(vec![ptr.clone()]), remote());

        tokio::time::sleep(Duration::from_secs(2)).await;

        let _rx = spawn(
            &interface,
            QueryOptions::new(vec![QueryRecord::new("_http._tcp.local.", RecordType::PTR)]),
        );
        tokio::time::sleep(Duration::from_millis(150)).await;

        let (packet, _) = tap.try_recv().unwrap();
        assert_eq!(packet.questions.len(), 1);
        assert_eq!(packet.answers.len(), 1);
        let known = &packet.answers[0];
        assert!(known.matches(&ptr));
        assert!(!known.cache_flush);
        assert!(known.ttl >= 2250);
        assert!(known.ttl <= 4500);
    }

    #[tokio::test(start_paused = true)]
    async fn should_suppress_questions_other_queriers_asked() {
        let (interface, mut tap) = NetInterface::test();
        let _rx = spawn(
            &interface,
            QueryOptions::new(vec![QueryRecord::new("box.local.", RecordType::A)]),
        );

        // a remote, non-local query for the same question lands before
        // our first send
        tokio::time::sleep(Duration::from_millis(5)).await;
        interface.inject(
            &Packet::query().with_questions(vec![QueryRecord::new("box.local.", RecordType::A)]),
            remote(),
        );

        // nothing left to ask, so nothing goes out
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(tap.try_recv().is_err());

        // the next scheduled packet re-prepares the question
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let (packet, _) = tap.try_recv().unwrap();
        assert_eq!(packet.questions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_suppress_for_local_or_unicast_questions() {
        let (interface, mut tap) = NetInterface::test();
        let _rx = spawn(
            &interface,
            QueryOptions::new(vec![
                QueryRecord::new("box.local.", RecordType::A).unicast()
            ]),
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        // same question but ours is QU, theirs QM
        interface.inject(
            &Packet::query().with_questions(vec![QueryRecord::new("box.local.", RecordType::A)]),
            remote(),
        );
        // and a local echo never suppresses anything
        interface.inject(
            &Packet::query().with_questions(vec![QueryRecord::new("box.local.", RecordType::A)]),
            local(),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        let (packet, _) = tap.try_recv().unwrap();
        assert_eq!(packet.questions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_after_first_answer_when_one_shot() {
        let (interface, mut tap) = NetInterface::test();
        let mut options =
            QueryOptions::new(vec![QueryRecord::new("box.local.", RecordType::A)]);
        options.continuous = false;
        options.ignore_cache = true;
        let mut rx = spawn(&interface, options);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(tap.try_recv().is_ok());

        interface.inject(
            &Packet::response().with_answers(vec![ResourceRecord::a(
                "box.local.",
                Ipv4Addr::new(1, 2, 3, 4),
            )]),
            remote(),
        );
        assert!(matches!(
            rx.recv().await,
            Some(QueryEvent::Answer { .. })
        ));
        // the task is gone: no retransmissions ever
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(tap.try_recv().is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn should_time_out() {
        let (interface, _tap) = NetInterface::test();
        let mut options =
            QueryOptions::new(vec![QueryRecord::new("box.local.", RecordType::A)]);
        options.continuous = false;
        options.ignore_cache = true;
        options.timeout = Some(Duration::from_secs(2));
        let mut rx = spawn(&interface, options);

        assert!(matches!(rx.recv().await, Some(QueryEvent::Timeout)));
    }
}
