//! Resolving one service instance into something connectable: target
//! host, port, TXT data and addresses.
//!
//! A resolver hangs off the interface cache. It asks for whatever is
//! missing, then keeps the picture current: reissue notifications batch
//! up into a single refresh query, expirations degrade the service back
//! to unresolved or tear it down.

use crate::actors::query::{Query, QueryEvent, QueryOptions};
use crate::cache::CacheEvent;
use crate::net::{InterfaceEvent, NetInterface};
use crate::timers::TimerSet;
use dnssd_proto::name;
use dnssd_proto::packet::question::QueryRecord;
use dnssd_proto::packet::record::{RData, ResourceRecord};
use dnssd_proto::packet::RecordType;
use dnssd_proto::packet::txt::TxtData;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// How long an unresolved service may stay unresolved.
pub(crate) const RESOLVER_TIMEOUT: Duration = Duration::from_secs(10);
/// Reissue questions gather for this long before one query carries them.
const BATCH_DELAY: Duration = Duration::from_secs(1);

/// A fully resolved service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// `Box._http._tcp.local.`
    pub fullname: String,
    /// `Box`
    pub name: String,
    /// Service name with the underscore dropped: `http`.
    pub service_name: String,
    /// Protocol with the underscore dropped: `tcp`.
    pub protocol: String,
    /// Target host, `box.local.`
    pub host: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    /// Decoded key/value view of the TXT data.
    pub txt: Vec<(String, String)>,
    pub txt_raw: TxtData,
}

#[derive(Debug, Clone)]
pub(crate) enum ResolverEvent {
    Resolved(Service),
    Updated(Service),
    Down,
}

pub(crate) struct ServiceResolver {
    pub interface: Arc<NetInterface>,
    pub fullname: String,
    /// Records that arrived alongside the PTR that discovered this
    /// instance.
    pub seed: Vec<ResourceRecord>,
    pub timeout: Duration,
    pub stop: CancellationToken,
    pub wake: broadcast::Sender<()>,
}

impl ServiceResolver {
    pub fn spawn(self) -> mpsc::UnboundedReceiver<ResolverEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(tx));
        rx
    }

    async fn run(self, tx: mpsc::UnboundedSender<ResolverEvent>) {
        let ptrname = match name::split_first_label(&self.fullname) {
            Some((_, tail)) => tail.to_string(),
            None => {
                let _ = tx.send(ResolverEvent::Down);
                return;
            }
        };

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (query_tx, query_rx) = mpsc::unbounded_channel();
        let mut task = ResolverTask {
            interface: self.interface,
            fullname: self.fullname,
            ptrname,
            timeout: self.timeout,
            target: None,
            port: None,
            txt: None,
            addresses: Vec::new(),
            resolved: false,
            batch: Vec::new(),
            timers: TimerSet::new(timer_tx),
            query_stop: None,
            tx,
            stop: self.stop,
            wake: self.wake,
        };
        task.drive(self.seed, timer_rx, query_rx, query_tx).await;
    }
}

enum Msg {
    Timeout,
    Batch,
}

struct ResolverTask {
    interface: Arc<NetInterface>,
    fullname: String,
    /// The service type name, `_http._tcp.local.`
    ptrname: String,
    timeout: Duration,
    target: Option<String>,
    port: Option<u16>,
    txt: Option<TxtData>,
    addresses: Vec<IpAddr>,
    resolved: bool,
    batch: Vec<QueryRecord>,
    timers: TimerSet<Msg>,
    query_stop: Option<CancellationToken>,
    tx: mpsc::UnboundedSender<ResolverEvent>,
    stop: CancellationToken,
    wake: broadcast::Sender<()>,
}

impl ResolverTask {
    async fn drive(
        &mut self,
        seed: Vec<ResourceRecord>,
        mut timer_rx: mpsc::UnboundedReceiver<Msg>,
        mut query_rx: mpsc::UnboundedReceiver<QueryEvent>,
        query_tx: mpsc::UnboundedSender<QueryEvent>,
    ) {
        let mut cache_events = self.interface.cache().subscribe();
        let mut events = self.interface.subscribe();
        let mut error = self.interface.error_rx();
        let mut wake_rx = self.wake.subscribe();

        self.process_records(&seed);
        self.resolved = self.is_resolved();
        if self.resolved {
            let _ = self.tx.send(ResolverEvent::Resolved(self.service()));
        } else {
            self.enter_unresolved(&query_tx);
        }

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = error.changed() => break,
                _ = wake_rx.recv() => break,
                Some(msg) = timer_rx.recv() => match msg {
                    Msg::Timeout => break,
                    Msg::Batch => self.flush_batch(&query_tx),
                },
                Some(event) = query_rx.recv() => {
                    // cache hits surface through our queries, not the wire
                    if let QueryEvent::Answer { record, related } = event {
                        let mut records = vec![record];
                        records.extend(related);
                        self.handle_records(&records, &query_tx);
                    }
                }
                event = events.recv() => match event {
                    Ok(InterfaceEvent::Answer(packet)) => {
                        let records: Vec<ResourceRecord> = packet
                            .answers
                            .iter()
                            .chain(packet.additionals.iter())
                            .cloned()
                            .collect();
                        self.handle_records(&records, &query_tx);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                cache_event = cache_events.recv() => match cache_event {
                    Ok(CacheEvent::Reissue(record)) => self.handle_reissue(&record),
                    Ok(CacheEvent::Expired(record)) => {
                        if self.handle_expiry(&record, &query_tx) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        if let Some(token) = self.query_stop.take() {
            token.cancel();
        }
        self.timers.clear();
        let _ = self.tx.send(ResolverEvent::Down);
    }

    fn is_resolved(&self) -> bool {
        !self.addresses.is_empty()
            && self.target.is_some()
            && self.port.is_some()
            && self.txt.is_some()
    }

    fn handle_records(
        &mut self,
        records: &[ResourceRecord],
        query_tx: &mpsc::UnboundedSender<QueryEvent>,
    ) {
        let was_resolved = self.resolved;
        let changed = self.process_records(records);
        let now_resolved = self.is_resolved();

        if !was_resolved && now_resolved {
            self.resolved = true;
            self.timers.cancel("timeout");
            if let Some(token) = self.query_stop.take() {
                token.cancel();
            }
            let _ = self.tx.send(ResolverEvent::Resolved(self.service()));
        } else if was_resolved && !now_resolved {
            self.enter_unresolved(query_tx);
        } else if now_resolved && changed {
            let _ = self.tx.send(ResolverEvent::Updated(self.service()));
        } else if !now_resolved && changed {
            self.query_for_missing(query_tx);
        }
    }

    fn enter_unresolved(&mut self, query_tx: &mpsc::UnboundedSender<QueryEvent>) {
        self.resolved = false;
        self.timers.schedule("timeout", self.timeout, Msg::Timeout);
        self.query_for_missing(query_tx);
    }

    /// SRV first (a target change resets the addresses), then TXT, then
    /// addresses filtered to the current target. Goodbyes are the cache's
    /// business, not ours.
    fn process_records(&mut self, records: &[ResourceRecord]) -> bool {
        let mut changed = false;

        for record in records {
            if record.ttl == 0 {
                continue;
            }
            if let RData::SRV { port, target, .. } = &record.rdata {
                if !name::eq_ignore_case(&record.name, &self.fullname) {
                    continue;
                }
                let target = name::fqdn(target);
                if self.target.as_deref().map(|t| name::eq_ignore_case(t, &target)) != Some(true) {
                    self.target = Some(target);
                    self.addresses.clear();
                    changed = true;
                }
                if self.port != Some(*port) {
                    self.port = Some(*port);
                    changed = true;
                }
            }
        }

        for record in records {
            if record.ttl == 0 {
                continue;
            }
            if let RData::TXT(txt) = &record.rdata {
                if !name::eq_ignore_case(&record.name, &self.fullname) {
                    continue;
                }
                if self.txt.as_ref() != Some(txt) {
                    self.txt = Some(txt.clone());
                    changed = true;
                }
            }
        }

        if let Some(target) = self.target.clone() {
            for record in records {
                if record.ttl == 0 || !name::eq_ignore_case(&record.name, &target) {
                    continue;
                }
                let address = match &record.rdata {
                    RData::A(addr) => IpAddr::V4(*addr),
                    RData::AAAA(addr) => IpAddr::V6(*addr),
                    _ => continue,
                };
                if !self.addresses.contains(&address) {
                    self.addresses.push(address);
                    changed = true;
                }
            }
        }

        changed
    }

    /// A record relevant to this instance is about to go stale; batch the
    /// refresh questions so one packet carries them all.
    fn handle_reissue(&mut self, record: &ResourceRecord) {
        let about_instance = name::eq_ignore_case(&record.name, &self.fullname);
        let about_ptr = matches!(
            record.ptr_target(),
            Some(target) if name::eq_ignore_case(&record.name, &self.ptrname)
                && name::eq_ignore_case(target, &self.fullname)
        );
        let about_target = self
            .target
            .as_deref()
            .map(|target| name::eq_ignore_case(&record.name, target))
            .unwrap_or(false);
        if !about_instance && !about_ptr && !about_target {
            return;
        }

        self.batch
            .push(QueryRecord::new(&record.name, record.rrtype()));
        if matches!(record.rdata, RData::SRV { .. }) {
            // a PTR question alongside tends to shake loose responders
            // that would ignore the SRV refresh
            self.batch
                .push(QueryRecord::new(&self.ptrname, RecordType::PTR));
        }
        if !self.timers.is_scheduled("batch") {
            self.timers.schedule("batch", BATCH_DELAY, Msg::Batch);
        }
    }

    fn flush_batch(&mut self, query_tx: &mpsc::UnboundedSender<QueryEvent>) {
        let mut seen = HashSet::new();
        let questions: Vec<QueryRecord> = self
            .batch
            .drain(..)
            .filter(|question| seen.insert(question.key()))
            .collect();
        if questions.is_empty() {
            return;
        }
        let mut options = QueryOptions::new(questions);
        options.continuous = false;
        options.ignore_cache = true;
        Query::spawn_with(
            self.interface.clone(),
            options,
            self.wake.clone(),
            self.stop.child_token(),
            query_tx.clone(),
        );
    }

    /// Returns true when the resolver cannot recover and must go down.
    fn handle_expiry(
        &mut self,
        record: &ResourceRecord,
        query_tx: &mpsc::UnboundedSender<QueryEvent>,
    ) -> bool {
        match &record.rdata {
            RData::SRV { .. } if name::eq_ignore_case(&record.name, &self.fullname) => {
                return true;
            }
            RData::PTR(target)
                if name::eq_ignore_case(&record.name, &self.ptrname)
                    && name::eq_ignore_case(target, &self.fullname) =>
            {
                return true;
            }
            RData::A(addr) => self.drop_address(record, IpAddr::V4(*addr), query_tx),
            RData::AAAA(addr) => self.drop_address(record, IpAddr::V6(*addr), query_tx),
            RData::TXT(_) if name::eq_ignore_case(&record.name, &self.fullname) => {
                self.txt = None;
                if self.resolved {
                    self.enter_unresolved(query_tx);
                }
            }
            _ => {}
        }
        false
    }

    fn drop_address(
        &mut self,
        record: &ResourceRecord,
        address: IpAddr,
        query_tx: &mpsc::UnboundedSender<QueryEvent>,
    ) {
        let about_target = self
            .target
            .as_deref()
            .map(|target| name::eq_ignore_case(&record.name, target))
            .unwrap_or(false);
        if !about_target {
            return;
        }
        self.addresses.retain(|known| *known != address);
        if self.addresses.is_empty() && self.resolved {
            self.enter_unresolved(query_tx);
        }
    }

    /// Ask for exactly what is still missing; the query checks the cache
    /// before putting anything on the wire.
    fn query_for_missing(&mut self, query_tx: &mpsc::UnboundedSender<QueryEvent>) {
        let mut questions = Vec::new();
        if self.target.is_none() {
            questions.push(QueryRecord::new(&self.fullname, RecordType::SRV));
        }
        if self.txt.is_none() {
            questions.push(QueryRecord::new(&self.fullname, RecordType::TXT));
        }
        if let Some(target) = &self.target {
            if self.addresses.is_empty() {
                questions.push(QueryRecord::new(target, RecordType::A));
                questions.push(QueryRecord::new(target, RecordType::AAAA));
            }
        }
        if questions.is_empty() {
            return;
        }

        if let Some(token) = self.query_stop.take() {
            token.cancel();
        }
        let token = self.stop.child_token();
        self.query_stop = Some(token.clone());
        Query::spawn_with(
            self.interface.clone(),
            QueryOptions::new(questions),
            self.wake.clone(),
            token,
            query_tx.clone(),
        );
    }

    /// Snapshot for API consumers; every collection is a defensive copy.
    fn service(&self) -> Service {
        let body = name::trimmed(&self.fullname);
        let name = body
            .strip_suffix(name::trimmed(&self.ptrname))
            .and_then(|instance| instance.strip_suffix('.'))
            .unwrap_or(body)
            .to_string();
        let mut type_labels = name::labels(&self.ptrname);
        let service_name = type_labels
            .next()
            .unwrap_or_default()
            .trim_start_matches('_')
            .to_string();
        let protocol = type_labels
            .next()
            .unwrap_or_default()
            .trim_start_matches('_')
            .to_string();
        let txt_raw = self.txt.clone().unwrap_or_default();

        Service {
            fullname: self.fullname.clone(),
            name,
            service_name,
            protocol,
            host: self.target.clone().unwrap_or_default(),
            port: self.port.unwrap_or_default(),
            addresses: self.addresses.clone(),
            txt: txt_raw.decoded(),
            txt_raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ResolverEvent, ServiceResolver, RESOLVER_TIMEOUT};
    use crate::net::NetInterface;
    use dnssd_proto::packet::record::ResourceRecord;
    use dnssd_proto::packet::txt::TxtData;
    use dnssd_proto::packet::Packet;
    use similar_asserts::assert_eq;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    fn remote() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77)), 5353)
    }

    fn seed_records() -> Vec<ResourceRecord> {
        let mut txt = TxtData::new();
        txt.set_str("path", "/");
        vec![
            ResourceRecord::srv("Inst._http._tcp.local.", "target.local.", 8080),
            ResourceRecord::txt("Inst._http._tcp.local.", txt),
            ResourceRecord::a("target.local.", Ipv4Addr::new(192, 168, 1, 50)),
        ]
    }

    fn resolver(
        interface: &Arc<NetInterface>,
        seed: Vec<ResourceRecord>,
    ) -> tokio::sync::mpsc::UnboundedReceiver<ResolverEvent> {
        let (wake, _) = broadcast::channel(4);
        ServiceResolver {
            interface: interface.clone(),
            fullname: String::from("Inst._http._tcp.local."),
            seed,
            timeout: RESOLVER_TIMEOUT,
            stop: CancellationToken::new(),
            wake,
        }
        .spawn()
    }

    #[tokio::test(start_paused = true)]
    async fn should_resolve_from_seed_records() {
        let (interface, _tap) = NetInterface::test();
        let mut events = resolver(&interface, seed_records());

        match events.recv().await.unwrap() {
            ResolverEvent::Resolved(service) => {
                assert_eq!(service.name, "Inst");
                assert_eq!(service.service_name, "http");
                assert_eq!(service.protocol, "tcp");
                assert_eq!(service.host, "target.local.");
                assert_eq!(service.port, 8080);
                assert_eq!(
                    service.addresses,
                    vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50))]
                );
                assert_eq!(service.txt, vec![(String::from("path"), String::from("/"))]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_query_for_missing_pieces_then_resolve() {
        let (interface, mut tap) = NetInterface::test();
        // only the SRV came along with the PTR
        let seed = vec![ResourceRecord::srv(
            "Inst._http._tcp.local.",
            "target.local.",
            8080,
        )];
        let mut events = resolver(&interface, seed);

        // the resolver asks for TXT and A/AAAA
        tokio::time::sleep(Duration::from_millis(150)).await;
        let (packet, _) = tap.try_recv().expect("a query for the missing records");
        assert!(packet.is_query());
        let names: Vec<&str> = packet
            .questions
            .iter()
            .map(|question| question.name.as_str())
            .collect();
        assert!(names.contains(&"Inst._http._tcp.local."));
        assert!(names.contains(&"target.local."));

        // answers trickle in
        let mut txt = TxtData::new();
        txt.set_str("path", "/");
        interface.inject(
            &Packet::response().with_answers(vec![
                ResourceRecord::txt("Inst._http._tcp.local.", txt),
                ResourceRecord::a("target.local.", Ipv4Addr::new(192, 168, 1, 50)),
            ]),
            remote(),
        );

        match events.recv().await.unwrap() {
            ResolverEvent::Resolved(service) => {
                assert_eq!(service.port, 8080);
                assert_eq!(service.addresses.len(), 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_emit_updated_on_txt_change() {
        let (interface, _tap) = NetInterface::test();
        let mut events = resolver(&interface, seed_records());
        assert!(matches!(
            events.recv().await.unwrap(),
            ResolverEvent::Resolved(_)
        ));

        let mut txt = TxtData::new();
        txt.set_str("path", "/new");
        interface.inject(
            &Packet::response().with_answers(vec![ResourceRecord::txt(
                "Inst._http._tcp.local.",
                txt,
            )]),
            remote(),
        );

        match events.recv().await.unwrap() {
            ResolverEvent::Updated(service) => {
                assert_eq!(
                    service.txt,
                    vec![(String::from("path"), String::from("/new"))]
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_go_down_when_srv_expires() {
        let (interface, _tap) = NetInterface::test();
        // prime the cache so expiry events fire later
        let srv = ResourceRecord::srv("Inst._http._tcp.local.", "target.local.", 8080);
        interface.inject(&Packet::response().with_answers(vec![srv.clone()]), remote());

        let mut events = resolver(&interface, seed_records());
        assert!(matches!(
            events.recv().await.unwrap(),
            ResolverEvent::Resolved(_)
        ));

        // a goodbye expires the SRV out of the cache
        interface.inject(
            &Packet::response().with_answers(vec![srv.with_ttl(0)]),
            remote(),
        );
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(matches!(events.recv().await.unwrap(), ResolverEvent::Down));
    }

    #[tokio::test(start_paused = true)]
    async fn should_time_out_when_unresolvable() {
        let (interface, _tap) = NetInterface::test();
        let mut events = resolver(&interface, Vec::new());

        let started = tokio::time::Instant::now();
        assert!(matches!(events.recv().await.unwrap(), ResolverEvent::Down));
        assert!(started.elapsed() >= RESOLVER_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_on_cancellation() {
        let (interface, _tap) = NetInterface::test();
        let (wake, _) = broadcast::channel(4);
        let stop = CancellationToken::new();
        let mut events = ServiceResolver {
            interface: interface.clone(),
            fullname: String::from("Inst._http._tcp.local."),
            seed: seed_records(),
            timeout: RESOLVER_TIMEOUT,
            stop: stop.clone(),
            wake,
        }
        .spawn();
        assert!(matches!(
            events.recv().await.unwrap(),
            ResolverEvent::Resolved(_)
        ));

        stop.cancel();
        assert!(matches!(events.recv().await.unwrap(), ResolverEvent::Down));
    }
}
