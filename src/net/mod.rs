//! The interface engine: one logical mDNS interface per requested
//! address, shared by every advertisement, browser and query in the
//! process.
//!
//! An interface owns the multicast socket, parses every inbound datagram,
//! feeds answers into its record cache and fans events out to whoever
//! subscribed. Outbound packets go through it too, so it can keep the
//! send history used for response rate limiting and split anything the
//! kernel rejects as oversized.

pub(crate) mod socket;

use crate::cache::RecordCache;
use dnssd_proto::packet::record::RecordKey;
use dnssd_proto::packet::Packet;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use dnssd_proto::buffer::MAX_MESSAGE_SIZE;

/// How long outbound answers stay queryable in the send history.
const HISTORY_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub(crate) enum InterfaceEvent {
    /// An authoritative response from a responder's port.
    Answer(Arc<Packet>),
    /// A query claiming records in its authority section.
    Probe(Arc<Packet>),
    /// A plain query, multicast or legacy.
    Query(Arc<Packet>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Shared,
    Disposable,
}

pub(crate) struct NetInterface {
    kind: Kind,
    registry_key: Option<String>,
    multicast_address: Option<Ipv4Addr>,
    cache: RecordCache,
    events: broadcast::Sender<InterfaceEvent>,
    error: watch::Sender<Option<Arc<io::Error>>>,
    inner: Mutex<Inner>,
    /// Single-slot queue guarding concurrent bind attempts.
    bind_lock: tokio::sync::Mutex<()>,
    #[cfg(test)]
    tap: Mutex<Option<tokio::sync::mpsc::UnboundedSender<(Packet, Option<SocketAddr>)>>>,
}

#[derive(Default)]
struct Inner {
    users: usize,
    bound: bool,
    sockets: Vec<Arc<UdpSocket>>,
    receivers: Vec<JoinHandle<()>>,
    local_addresses: Vec<IpAddr>,
    history: SendHistory,
}

fn registry() -> &'static Mutex<HashMap<String, Arc<NetInterface>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<NetInterface>>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

impl NetInterface {
    fn new(kind: Kind, registry_key: Option<String>, multicast_address: Option<Ipv4Addr>) -> Self {
        let (events, _) = broadcast::channel(512);
        let (error, _) = watch::channel(None);
        Self {
            kind,
            registry_key,
            multicast_address,
            cache: RecordCache::new(),
            events,
            error,
            inner: Mutex::new(Inner::default()),
            bind_lock: tokio::sync::Mutex::new(()),
            #[cfg(test)]
            tap: Mutex::new(None),
        }
    }

    /// The process-wide shared interface for the given address, creating
    /// it on first use.
    pub fn shared(multicast_address: Option<Ipv4Addr>) -> Arc<NetInterface> {
        let key = multicast_address
            .map(|address| address.to_string())
            .unwrap_or_else(|| String::from("any"));
        let mut map = registry().lock().unwrap();
        map.entry(key.clone())
            .or_insert_with(|| {
                Arc::new(NetInterface::new(
                    Kind::Shared,
                    Some(key),
                    multicast_address,
                ))
            })
            .clone()
    }

    /// A private ephemeral-port interface for one-shot lookups.
    pub fn disposable(multicast_address: Option<Ipv4Addr>) -> Arc<NetInterface> {
        Arc::new(NetInterface::new(Kind::Disposable, None, multicast_address))
    }

    /// Register as a user, binding the sockets on first use. Binding is
    /// serialized so two simultaneous users cannot race the sockets.
    pub async fn use_interface(self: &Arc<Self>) -> io::Result<()> {
        let _guard = self.bind_lock.lock().await;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.bound {
                inner.users += 1;
                return Ok(());
            }
        }

        let socket = match self.kind {
            Kind::Shared => socket::bind_shared(self.multicast_address)?,
            Kind::Disposable => socket::bind_ephemeral(self.multicast_address)?,
        };
        let socket = Arc::new(socket);
        let receiver = self.spawn_receiver(socket.clone());

        let mut inner = self.inner.lock().unwrap();
        inner.sockets = vec![socket];
        inner.receivers = vec![receiver];
        inner.local_addresses = socket::local_addresses();
        inner.bound = true;
        inner.users = 1;
        Ok(())
    }

    /// Deregister; the last user tears the sockets down and clears the
    /// cache.
    pub fn stop_using(self: &Arc<Self>) {
        let last = {
            let mut inner = self.inner.lock().unwrap();
            inner.users = inner.users.saturating_sub(1);
            inner.users == 0
        };
        if last {
            self.shutdown();
        }
    }

    fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.users > 0 {
                // someone re-registered in the meantime
                return;
            }
            for receiver in inner.receivers.drain(..) {
                receiver.abort();
            }
            inner.sockets.clear();
            inner.bound = false;
            inner.history.clear();
        }
        self.cache.clear();
        if let Some(key) = &self.registry_key {
            registry().lock().unwrap().remove(key);
        }
    }

    fn spawn_receiver(self: &Arc<Self>, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let weak: Weak<NetInterface> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((size, origin)) => {
                        let Some(interface) = weak.upgrade() else {
                            return;
                        };
                        interface.handle_datagram(&buffer[..size], origin);
                    }
                    Err(error) => {
                        if let Some(interface) = weak.upgrade() {
                            interface.fail(error);
                        }
                        return;
                    }
                }
            }
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InterfaceEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn error_rx(&self) -> watch::Receiver<Option<Arc<io::Error>>> {
        self.error.subscribe()
    }

    pub fn has_failed(&self) -> bool {
        self.error.borrow().is_some()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.borrow().as_ref().map(|error| error.to_string())
    }

    pub fn local_addresses(&self) -> Vec<IpAddr> {
        self.inner.lock().unwrap().local_addresses.clone()
    }

    /// Whether an equal record went out in a multicast answer within the
    /// last `window`.
    pub fn has_recently_sent(&self, record_key: &RecordKey, window: Duration) -> bool {
        self.inner
            .lock()
            .unwrap()
            .history
            .contains(record_key, window)
    }

    fn fail(&self, error: io::Error) {
        tracing::error!("network interface failed: {error}");
        self.error.send_replace(Some(Arc::new(error)));
    }

    /// Parse, validate and dispatch one inbound datagram.
    pub(crate) fn handle_datagram(&self, data: &[u8], origin: SocketAddr) {
        let packet = match Packet::from_datagram(data, origin) {
            Ok(packet) => packet,
            Err(error) => {
                tracing::debug!(%origin, "dropping unreadable packet: {error}");
                return;
            }
        };
        if !packet.is_valid() {
            tracing::debug!(%origin, "dropping invalid packet");
            return;
        }
        self.dispatch(packet, origin);
    }

    fn dispatch(&self, packet: Packet, origin: SocketAddr) {
        let from_mdns_port = origin.port() == socket::MDNS_PORT;
        let packet = Arc::new(packet);

        if packet.is_answer() {
            if from_mdns_port {
                // the cache sees the records before any listener does
                self.cache_records(&packet);
                let _ = self.events.send(InterfaceEvent::Answer(packet));
            } else if !packet.questions.is_empty() {
                // a response from an ephemeral port is no answer at all,
                // but its questions still deserve a legacy reply
                let _ = self.events.send(InterfaceEvent::Query(packet));
            }
        } else if packet.is_probe() {
            if from_mdns_port {
                let _ = self.events.send(InterfaceEvent::Probe(packet));
            }
        } else if packet.is_query() {
            let _ = self.events.send(InterfaceEvent::Query(packet));
        }
    }

    fn cache_records(&self, packet: &Packet) {
        for record in packet.answers.iter().chain(packet.additionals.iter()) {
            if record.ttl == 0 {
                self.cache.set_to_expire(record);
                continue;
            }
            if record.cache_flush {
                self.cache.flush_related(record);
            }
            self.cache.add(record);
        }
    }

    /// Send a packet, multicast by default or to `dest`. Oversized
    /// packets are split and resent; any other socket error is fatal for
    /// the whole interface.
    pub async fn send(&self, packet: &Packet, dest: Option<SocketAddr>) -> io::Result<()> {
        if let Some(dest) = dest {
            if !socket::is_local_scope(dest.ip()) {
                tracing::debug!(%dest, "not sending outside the local network");
                return Ok(());
            }
        }

        if packet.is_answer() && dest.is_none() {
            let mut inner = self.inner.lock().unwrap();
            for record in packet.answers.iter().chain(packet.additionals.iter()) {
                inner.history.push(record.record_key());
            }
        }

        #[cfg(test)]
        if let Some(tap) = self.tap.lock().unwrap().as_ref() {
            let _ = tap.send((packet.clone(), dest));
            return Ok(());
        }

        let sockets = self.inner.lock().unwrap().sockets.clone();
        let target = dest.unwrap_or_else(|| {
            SocketAddr::new(IpAddr::V4(socket::MDNS_GROUP_V4), socket::MDNS_PORT)
        });

        let mut queue: VecDeque<Packet> = VecDeque::from([packet.clone()]);
        while let Some(current) = queue.pop_front() {
            let data = current.encode().map_err(io::Error::from)?;
            for sock in &sockets {
                if sock.local_addr()?.is_ipv4() != target.is_ipv4() {
                    continue;
                }
                match sock.send_to(&data, target).await {
                    Ok(_) => {}
                    Err(error) if error.raw_os_error() == Some(libc::EMSGSIZE) => {
                        if current.answers.len() <= 1 && current.questions.is_empty() {
                            tracing::warn!("dropping unsplittable oversized packet");
                            break;
                        }
                        let (first, second) = current.split();
                        queue.push_back(first);
                        queue.push_back(second);
                        break;
                    }
                    Err(error) => {
                        let message = error.to_string();
                        self.fail(error);
                        return Err(io::Error::new(io::ErrorKind::Other, message));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl NetInterface {
    /// An interface with no sockets: inbound packets are injected and
    /// outbound packets captured.
    pub(crate) fn test() -> (
        Arc<NetInterface>,
        tokio::sync::mpsc::UnboundedReceiver<(Packet, Option<SocketAddr>)>,
    ) {
        Self::test_with_addresses(vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))])
    }

    pub(crate) fn test_with_addresses(
        local_addresses: Vec<IpAddr>,
    ) -> (
        Arc<NetInterface>,
        tokio::sync::mpsc::UnboundedReceiver<(Packet, Option<SocketAddr>)>,
    ) {
        let interface = Arc::new(NetInterface::new(Kind::Shared, None, None));
        {
            let mut inner = interface.inner.lock().unwrap();
            inner.bound = true;
            inner.users = 1;
            inner.local_addresses = local_addresses;
        }
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        *interface.tap.lock().unwrap() = Some(tx);
        (interface, rx)
    }

    /// Feed a packet through the inbound path as if it arrived from
    /// `origin`.
    pub(crate) fn inject(&self, packet: &Packet, origin: SocketAddr) {
        let data = packet.encode().expect("test packet encodes");
        self.handle_datagram(&data, origin);
    }

    pub(crate) fn inject_failure(&self) {
        self.fail(io::Error::new(io::ErrorKind::Other, "injected failure"));
    }
}

#[derive(Default)]
struct SendHistory {
    entries: VecDeque<(Instant, RecordKey)>,
}

impl SendHistory {
    fn push(&mut self, key: RecordKey) {
        self.prune();
        self.entries.push_back((Instant::now(), key));
    }

    fn contains(&self, key: &RecordKey, window: Duration) -> bool {
        let window = window.min(HISTORY_WINDOW);
        self.entries
            .iter()
            .any(|(at, entry)| entry == key && at.elapsed() < window)
    }

    fn prune(&mut self) {
        while let Some((at, _)) = self.entries.front() {
            if at.elapsed() > HISTORY_WINDOW {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}
