//! Watching the network for service instances of a type, or for service
//! types themselves.

use crate::actors::query::{Query, QueryEvent, QueryOptions};
use crate::error::Error;
use crate::net::NetInterface;
use crate::resolver::{ResolverEvent, Service, ServiceResolver, RESOLVER_TIMEOUT};
use crate::service_type::ServiceType;
use crate::sleep::SleepMonitor;
use dnssd_proto::name;
use dnssd_proto::packet::question::QueryRecord;
use dnssd_proto::packet::record::ResourceRecord;
use dnssd_proto::packet::RecordType;

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum BrowserEvent {
    /// An instance resolved (or, with `resolve` off, appeared).
    ServiceUp(Service),
    /// Something about a known instance changed.
    ServiceChanged(Service),
    /// A maintained instance went away.
    ServiceDown(Service),
    /// Enumerator mode only: a service type was seen.
    ServiceTypeUp(String),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub domain: String,
    /// Keep instances resolved and report changes and departures.
    pub maintain: bool,
    /// Resolve instances before reporting them.
    pub resolve: bool,
    /// Bind to a specific local address.
    pub interface: Option<Ipv4Addr>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            domain: String::from("local."),
            maintain: true,
            resolve: true,
            interface: None,
        }
    }
}

#[derive(Default)]
struct BrowserState {
    services: HashMap<String, Service>,
    types: Vec<String>,
}

pub struct Browser {
    service_type: ServiceType,
    options: BrowserOptions,
    stop: CancellationToken,
    state: Arc<Mutex<BrowserState>>,
    started: bool,
}

impl Browser {
    pub fn new(service_type: ServiceType, options: BrowserOptions) -> Self {
        Self {
            service_type,
            options,
            stop: CancellationToken::new(),
            state: Arc::new(Mutex::new(BrowserState::default())),
            started: false,
        }
    }

    /// Bind the interface and start browsing. Events arrive on the
    /// returned channel until `stop`.
    pub async fn start(&mut self) -> Result<mpsc::UnboundedReceiver<BrowserEvent>, Error> {
        if self.started {
            return Err(Error::validation("browser is already started"));
        }
        let interface = NetInterface::shared(self.options.interface);
        interface.use_interface().await.map_err(Error::Bind)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = SleepMonitor::spawn();
        let task = BrowserTask {
            interface,
            service_type: self.service_type.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
            tx,
            stop: self.stop.clone(),
            wake: monitor.sender(),
            resolvers: HashMap::new(),
            seen: HashSet::new(),
            _monitor: monitor,
        };
        tokio::spawn(task.run());
        self.started = true;
        Ok(rx)
    }

    /// Everything currently up, resolved.
    pub fn list(&self) -> Vec<Service> {
        self.state.lock().unwrap().services.values().cloned().collect()
    }

    /// Enumerator mode: the service types seen so far.
    pub fn list_types(&self) -> Vec<String> {
        self.state.lock().unwrap().types.clone()
    }

    pub fn stop(&mut self) {
        self.stop.cancel();
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct BrowserTask {
    interface: Arc<NetInterface>,
    service_type: ServiceType,
    options: BrowserOptions,
    state: Arc<Mutex<BrowserState>>,
    tx: mpsc::UnboundedSender<BrowserEvent>,
    stop: CancellationToken,
    wake: broadcast::Sender<()>,
    /// One resolver per discovered instance, keyed by case-folded
    /// fullname.
    resolvers: HashMap<String, CancellationToken>,
    seen: HashSet<String>,
    _monitor: SleepMonitor,
}

impl BrowserTask {
    async fn run(mut self) {
        let ptr_name = self.service_type.fqdn(&self.options.domain);
        let mut query_rx = Query::spawn(
            self.interface.clone(),
            QueryOptions::new(vec![QueryRecord::new(&ptr_name, RecordType::PTR)]),
            self.wake.clone(),
            self.stop.child_token(),
        );

        let (resolver_tx, mut resolver_rx) = mpsc::unbounded_channel();
        let mut error = self.interface.error_rx();

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = error.changed() => {
                    let _ = self.tx.send(BrowserEvent::Error(
                        self.interface.error_message().unwrap_or_default(),
                    ));
                    break;
                }
                Some(event) = query_rx.recv() => {
                    if let QueryEvent::Answer { record, related } = event {
                        self.handle_ptr(&record, related, &resolver_tx);
                    }
                }
                Some((key, event)) = resolver_rx.recv() => {
                    self.handle_resolver_event(key, event);
                }
            }
        }

        for (_, token) in self.resolvers.drain() {
            token.cancel();
        }
        self.interface.stop_using();
    }

    fn handle_ptr(
        &mut self,
        record: &ResourceRecord,
        related: Vec<ResourceRecord>,
        resolver_tx: &mpsc::UnboundedSender<(String, ResolverEvent)>,
    ) {
        if record.ttl == 0 {
            return;
        }
        let Some(target) = record.ptr_target() else {
            return;
        };

        if self.service_type.is_enumerator() {
            let Ok(service_type) = ServiceType::from_fqdn(target, &self.options.domain) else {
                return;
            };
            let rendered = service_type.to_string();
            let mut state = self.state.lock().unwrap();
            if !state.types.contains(&rendered) {
                state.types.push(rendered.clone());
                let _ = self.tx.send(BrowserEvent::ServiceTypeUp(rendered));
            }
            return;
        }

        let key = name::key(target);
        if !self.seen.insert(key.clone()) {
            return;
        }

        if !self.options.resolve {
            let service = self.unresolved_service(target);
            self.state
                .lock()
                .unwrap()
                .services
                .insert(key, service.clone());
            let _ = self.tx.send(BrowserEvent::ServiceUp(service));
            return;
        }

        let token = self.stop.child_token();
        let mut events = ServiceResolver {
            interface: self.interface.clone(),
            fullname: target.to_string(),
            seed: related,
            timeout: RESOLVER_TIMEOUT,
            stop: token.clone(),
            wake: self.wake.clone(),
        }
        .spawn();
        self.resolvers.insert(key.clone(), token);

        let forward = resolver_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if forward.send((key.clone(), event)).is_err() {
                    return;
                }
            }
        });
    }

    fn handle_resolver_event(&mut self, key: String, event: ResolverEvent) {
        match event {
            ResolverEvent::Resolved(service) => {
                if !self.resolvers.contains_key(&key) {
                    return;
                }
                self.state
                    .lock()
                    .unwrap()
                    .services
                    .insert(key.clone(), service.clone());
                let _ = self.tx.send(BrowserEvent::ServiceUp(service));
                if !self.options.maintain {
                    // one resolution is all that was asked for
                    if let Some(token) = self.resolvers.remove(&key) {
                        token.cancel();
                    }
                }
            }
            ResolverEvent::Updated(service) => {
                if !self.resolvers.contains_key(&key) {
                    return;
                }
                self.state
                    .lock()
                    .unwrap()
                    .services
                    .insert(key.clone(), service.clone());
                let _ = self.tx.send(BrowserEvent::ServiceChanged(service));
            }
            ResolverEvent::Down => {
                let Some(token) = self.resolvers.remove(&key) else {
                    return;
                };
                token.cancel();
                self.seen.remove(&key);
                if let Some(service) = self.state.lock().unwrap().services.remove(&key) {
                    let _ = self.tx.send(BrowserEvent::ServiceDown(service));
                }
            }
        }
    }

    fn unresolved_service(&self, fullname: &str) -> Service {
        let name = self
            .service_type
            .instance_name(fullname, &self.options.domain)
            .unwrap_or(fullname)
            .to_string();
        Service {
            fullname: name::fqdn(fullname),
            name,
            service_name: self.service_type.name().trim_start_matches('_').to_string(),
            protocol: self
                .service_type
                .protocol()
                .trim_start_matches('_')
                .to_string(),
            host: String::new(),
            port: 0,
            addresses: Vec::new(),
            txt: Vec::new(),
            txt_raw: Default::default(),
        }
    }
}
