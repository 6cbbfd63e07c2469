//! Outbound responses: multicast announcements, goodbyes and unicast
//! replies.
//!
//! Multicast responses are the polite kind: they wait a random slice
//! when shared records are involved, skip records the interface answered
//! within the last second (a quarter second for defensive replies), and
//! drop anything another responder on the network said while the packet
//! was waiting to go out.

use crate::net::{InterfaceEvent, NetInterface};
use crate::timers::LAZY_TOLERANCE;
use dnssd_proto::packet::question::QueryRecord;
use dnssd_proto::packet::record::{RData, ResourceRecord};
use dnssd_proto::packet::{additionals_for, Packet};
use dnssd_proto::set::RecordSet;

use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Suppression window for ordinary answers.
const RATE_LIMIT: Duration = Duration::from_secs(1);
/// Probe defenses must be able to answer faster than that.
const RATE_LIMIT_DEFENSIVE: Duration = Duration::from_millis(250);
/// Legacy resolvers cache for at most this many seconds.
const LEGACY_TTL: u32 = 10;

fn shared_record_delay(records: &[ResourceRecord]) -> Duration {
    if records.iter().all(|record| record.unique()) {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(20..120))
    }
}

pub(crate) struct MulticastResponse {
    pub interface: Arc<NetInterface>,
    pub records: Vec<ResourceRecord>,
    /// Defending a name against a prober: tighter rate limit, no initial
    /// delay.
    pub defensive: bool,
    /// Total number of sends; the gap starts at 1 s and doubles.
    pub repeats: u32,
    pub stop: CancellationToken,
}

impl MulticastResponse {
    pub async fn run(self) {
        let mut events = self.interface.subscribe();
        let mut error = self.interface.error_rx();

        let rate_limit = if self.defensive {
            RATE_LIMIT_DEFENSIVE
        } else {
            RATE_LIMIT
        };
        let delay = if self.defensive {
            Duration::ZERO
        } else {
            shared_record_delay(&self.records)
        };

        // answers other responders multicast while we wait
        let mut heard = RecordSet::new();
        let mut sent = 0u32;
        let mut gap = Duration::from_secs(1);
        let mut next = tokio::time::Instant::now() + delay;
        let mut wall_deadline = SystemTime::now() + delay + LAZY_TOLERANCE;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = error.changed() => return,
                _ = tokio::time::sleep_until(next) => {
                    if SystemTime::now() > wall_deadline {
                        // the machine slept through the schedule
                        return;
                    }
                    let outgoing: Vec<ResourceRecord> = self
                        .records
                        .iter()
                        .filter(|record| {
                            !heard.has(record)
                                && !self
                                    .interface
                                    .has_recently_sent(&record.record_key(), rate_limit)
                        })
                        .cloned()
                        .collect();
                    if !outgoing.is_empty() {
                        let additionals = additionals_for(&outgoing);
                        let packet = Packet::response()
                            .with_answers(outgoing)
                            .with_additionals(additionals);
                        if self.interface.send(&packet, None).await.is_err() {
                            return;
                        }
                    }
                    sent += 1;
                    if sent >= self.repeats {
                        return;
                    }
                    next = tokio::time::Instant::now() + gap;
                    wall_deadline = SystemTime::now() + gap + LAZY_TOLERANCE;
                    gap *= 2;
                }
                event = events.recv() => match event {
                    Ok(InterfaceEvent::Answer(packet)) => {
                        if !packet.is_local(&self.interface.local_addresses()) {
                            for record in &packet.answers {
                                heard.add(record.clone());
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

/// Announce that records are going away: TTL zero, no additionals, no
/// politeness filters.
pub(crate) struct GoodbyeResponse {
    pub interface: Arc<NetInterface>,
    pub records: Vec<ResourceRecord>,
    pub stop: CancellationToken,
}

impl GoodbyeResponse {
    pub async fn run(self) {
        let mut error = self.interface.error_rx();

        let goodbyes: Vec<ResourceRecord> = self
            .records
            .iter()
            .map(|record| {
                record
                    .clone()
                    .with_ttl(0)
                    .with_additionals(Vec::new())
            })
            .collect();
        if goodbyes.is_empty() {
            return;
        }

        let delay = shared_record_delay(&goodbyes);
        tokio::select! {
            _ = self.stop.cancelled() => return,
            _ = error.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let packet = Packet::response().with_answers(goodbyes);
        let _ = self.interface.send(&packet, None).await;
    }
}

pub(crate) struct UnicastResponse {
    pub interface: Arc<NetInterface>,
    pub origin: SocketAddr,
    pub records: Vec<ResourceRecord>,
    /// The querier is a one-shot resolver on an ephemeral port: echo its
    /// header id and questions, keep TTLs short, leave NSEC out.
    pub legacy: bool,
    pub defensive: bool,
    pub query_id: u16,
    pub questions: Vec<QueryRecord>,
}

impl UnicastResponse {
    pub async fn run(self) {
        let delay = if self.legacy || self.defensive {
            Duration::ZERO
        } else {
            shared_record_delay(&self.records)
        };
        tokio::time::sleep(delay).await;

        let packet = if self.legacy {
            let answers: Vec<ResourceRecord> = self
                .records
                .iter()
                .filter(|record| !matches!(record.rdata, RData::NSEC(_)))
                .map(|record| legacy_clone(record))
                .collect();
            let additionals: Vec<ResourceRecord> = additionals_for(&answers)
                .iter()
                .filter(|record| !matches!(record.rdata, RData::NSEC(_)))
                .map(|record| legacy_clone(record))
                .collect();

            let questions: Vec<QueryRecord> = self
                .questions
                .iter()
                .cloned()
                .map(|mut question| {
                    question.unicast_preferred = false;
                    question
                })
                .collect();

            let mut packet = Packet::response()
                .with_questions(questions)
                .with_answers(answers)
                .with_additionals(additionals);
            packet.header.id = self.query_id;
            packet
        } else {
            let additionals = additionals_for(&self.records);
            Packet::response()
                .with_answers(self.records.clone())
                .with_additionals(additionals)
        };

        let _ = self.interface.send(&packet, Some(self.origin)).await;
    }
}

fn legacy_clone(record: &ResourceRecord) -> ResourceRecord {
    record.clone().with_ttl(LEGACY_TTL).with_cache_flush(false)
}

#[cfg(test)]
mod tests {
    use super::{GoodbyeResponse, MulticastResponse, UnicastResponse};
    use crate::net::NetInterface;
    use dnssd_proto::packet::question::QueryRecord;
    use dnssd_proto::packet::record::{RData, ResourceRecord};
    use dnssd_proto::packet::{Packet, RecordType};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn remote(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77)), port)
    }

    fn host_record() -> ResourceRecord {
        ResourceRecord::a("box.local.", Ipv4Addr::new(192, 168, 1, 10))
    }

    #[tokio::test(start_paused = true)]
    async fn should_announce_with_doubling_gap() {
        let (interface, mut tap) = NetInterface::test();
        let response = MulticastResponse {
            interface: interface.clone(),
            records: vec![host_record()],
            defensive: false,
            repeats: 3,
            stop: CancellationToken::new(),
        };
        let handle = tokio::spawn(response.run());

        // all unique records: first send is immediate
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tap.try_recv().is_ok());

        // second a second later, third two seconds after that
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(tap.try_recv().is_ok());
        assert!(tap.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(tap.try_recv().is_ok());

        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn should_delay_when_shared_records_present() {
        let (interface, mut tap) = NetInterface::test();
        let response = MulticastResponse {
            interface: interface.clone(),
            records: vec![ResourceRecord::ptr(
                "_http._tcp.local.",
                "Box._http._tcp.local.",
            )],
            defensive: false,
            repeats: 1,
            stop: CancellationToken::new(),
        };
        let handle = tokio::spawn(response.run());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tap.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(tap.try_recv().is_ok());
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn should_suppress_answers_heard_from_others() {
        let (interface, mut tap) = NetInterface::test();
        let response = MulticastResponse {
            interface: interface.clone(),
            records: vec![
                ResourceRecord::ptr("_http._tcp.local.", "Box._http._tcp.local."),
                host_record(),
            ],
            defensive: false,
            repeats: 1,
            stop: CancellationToken::new(),
        };
        let handle = tokio::spawn(response.run());

        // while the response waits out its shared-record delay, another
        // responder multicasts the same PTR
        tokio::time::sleep(Duration::from_millis(5)).await;
        interface.inject(
            &Packet::response().with_answers(vec![ResourceRecord::ptr(
                "_http._tcp.local.",
                "Box._http._tcp.local.",
            )]),
            remote(5353),
        );

        handle.await.unwrap();
        let (packet, _) = tap.try_recv().unwrap();
        assert_eq!(packet.answers.len(), 1);
        assert!(matches!(packet.answers[0].rdata, RData::A(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn should_set_aa_and_compute_additionals() {
        let (interface, mut tap) = NetInterface::test();
        let srv = ResourceRecord::srv("Box._http._tcp.local.", "box.local.", 80)
            .with_additionals(vec![host_record()]);
        let response = MulticastResponse {
            interface: interface.clone(),
            records: vec![srv],
            defensive: false,
            repeats: 1,
            stop: CancellationToken::new(),
        };
        response.run().await;

        let (packet, _) = tap.try_recv().unwrap();
        assert!(packet.header.authoritative_answer);
        assert!(packet.header.response);
        assert_eq!(packet.answers.len(), 1);
        assert_eq!(packet.additionals.len(), 1);
        assert!(packet.additionals[0].matches(&host_record()));
    }

    #[tokio::test(start_paused = true)]
    async fn should_send_goodbyes_with_zero_ttl() {
        let (interface, mut tap) = NetInterface::test();
        let goodbye = GoodbyeResponse {
            interface: interface.clone(),
            records: vec![host_record()],
            stop: CancellationToken::new(),
        };
        goodbye.run().await;

        let (packet, _) = tap.try_recv().unwrap();
        assert_eq!(packet.answers.len(), 1);
        assert_eq!(packet.answers[0].ttl, 0);
        assert!(packet.additionals.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn should_skip_rate_limit_for_goodbyes() {
        let (interface, mut tap) = NetInterface::test();
        // something just sent the record
        interface
            .send(
                &Packet::response().with_answers(vec![host_record()]),
                None,
            )
            .await
            .unwrap();
        let _ = tap.try_recv();

        let goodbye = GoodbyeResponse {
            interface: interface.clone(),
            records: vec![host_record()],
            stop: CancellationToken::new(),
        };
        goodbye.run().await;
        let (packet, _) = tap.try_recv().unwrap();
        assert_eq!(packet.answers[0].ttl, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_reply_unicast_to_origin() {
        let (interface, mut tap) = NetInterface::test();
        let response = UnicastResponse {
            interface: interface.clone(),
            origin: remote(5353),
            records: vec![host_record()],
            legacy: false,
            defensive: true,
            query_id: 0,
            questions: Vec::new(),
        };
        response.run().await;

        let (packet, dest) = tap.try_recv().unwrap();
        assert_eq!(dest, Some(remote(5353)));
        assert_eq!(packet.header.id, 0);
        assert_eq!(packet.answers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_build_legacy_replies() {
        let (interface, mut tap) = NetInterface::test();
        let nsec = ResourceRecord::nsec("box.local.", [1]);
        let response = UnicastResponse {
            interface: interface.clone(),
            origin: remote(43210),
            records: vec![host_record(), nsec],
            legacy: true,
            defensive: false,
            query_id: 4242,
            questions: vec![QueryRecord::new("box.local.", RecordType::A).unicast()],
        };
        response.run().await;

        let (packet, dest) = tap.try_recv().unwrap();
        assert_eq!(dest, Some(remote(43210)));
        assert_eq!(packet.header.id, 4242);
        // question echoed with the unicast bit cleared
        assert_eq!(packet.questions.len(), 1);
        assert!(!packet.questions[0].unicast_preferred);
        // NSEC dropped, remaining records clamped for legacy caches
        assert_eq!(packet.answers.len(), 1);
        assert_eq!(packet.answers[0].ttl, 10);
        assert!(!packet.answers[0].cache_flush);
    }
}
