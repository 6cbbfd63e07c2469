//! One-shot lookups on a disposable interface.
//!
//! These bind an ephemeral port, so responders treat them as legacy
//! unicast DNS queriers and reply directly to the socket.

use crate::actors::query::{Query, QueryEvent, QueryOptions};
use crate::error::Error;
use crate::net::NetInterface;
use crate::resolver::{ResolverEvent, Service, ServiceResolver};
use crate::sleep::SleepMonitor;
use dnssd_proto::name;
use dnssd_proto::packet::question::QueryRecord;
use dnssd_proto::packet::record::{RData, ResourceRecord};
use dnssd_proto::packet::txt::TxtData;
use dnssd_proto::packet::RecordType;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub interface: Option<Ipv4Addr>,
    pub timeout: Duration,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            interface: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// A resolved record with everything that came along in the same packet.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub answer: ResourceRecord,
    pub related: Vec<ResourceRecord>,
}

/// Resolve a single record of the given type.
pub async fn resolve(
    fqdn: &str,
    rtype: RecordType,
    options: ResolveOptions,
) -> Result<Resolved, Error> {
    let interface = NetInterface::disposable(options.interface);
    interface.use_interface().await.map_err(Error::Bind)?;

    let monitor = SleepMonitor::spawn();
    let stop = CancellationToken::new();
    let mut events = Query::spawn(
        interface.clone(),
        QueryOptions {
            questions: vec![QueryRecord::new(fqdn, rtype)],
            continuous: false,
            ignore_cache: true,
            timeout: Some(options.timeout),
        },
        monitor.sender(),
        stop.child_token(),
    );

    let result = match events.recv().await {
        Some(QueryEvent::Answer { record, related }) => Ok(Resolved {
            answer: record,
            related,
        }),
        Some(QueryEvent::Timeout) => Err(Error::Timeout),
        None => Err(Error::Stopped),
    };

    stop.cancel();
    interface.stop_using();
    result
}

/// Resolve the IPv4 address of a hostname.
pub async fn resolve_4(fqdn: &str, options: ResolveOptions) -> Result<Ipv4Addr, Error> {
    let resolved = resolve(fqdn, RecordType::A, options).await?;
    match resolved.answer.rdata {
        RData::A(address) => Ok(address),
        _ => Err(Error::Stopped),
    }
}

/// Resolve the IPv6 address of a hostname.
pub async fn resolve_6(fqdn: &str, options: ResolveOptions) -> Result<Ipv6Addr, Error> {
    let resolved = resolve(fqdn, RecordType::AAAA, options).await?;
    match resolved.answer.rdata {
        RData::AAAA(address) => Ok(address),
        _ => Err(Error::Stopped),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvInfo {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// Resolve the service location record of an instance.
pub async fn resolve_srv(fqdn: &str, options: ResolveOptions) -> Result<SrvInfo, Error> {
    let resolved = resolve(fqdn, RecordType::SRV, options).await?;
    match resolved.answer.rdata {
        RData::SRV {
            priority,
            weight,
            port,
            target,
        } => Ok(SrvInfo {
            target,
            port,
            priority,
            weight,
        }),
        _ => Err(Error::Stopped),
    }
}

/// Resolve the TXT data of an instance.
pub async fn resolve_txt(fqdn: &str, options: ResolveOptions) -> Result<TxtData, Error> {
    let resolved = resolve(fqdn, RecordType::TXT, options).await?;
    match resolved.answer.rdata {
        RData::TXT(txt) => Ok(txt),
        _ => Err(Error::Stopped),
    }
}

/// Resolve a full service instance: SRV, TXT and addresses.
pub async fn resolve_service(fqdn: &str, options: ResolveOptions) -> Result<Service, Error> {
    let fullname = name::fqdn(fqdn);
    if name::split_first_label(&fullname).is_none() {
        return Err(Error::validation(format!(
            "'{fqdn}' is not a service instance name"
        )));
    }

    let interface = NetInterface::disposable(options.interface);
    interface.use_interface().await.map_err(Error::Bind)?;

    let monitor = SleepMonitor::spawn();
    let stop = CancellationToken::new();
    let mut events = ServiceResolver {
        interface: interface.clone(),
        fullname,
        seed: Vec::new(),
        timeout: options.timeout,
        stop: stop.child_token(),
        wake: monitor.sender(),
    }
    .spawn();

    let result = loop {
        match events.recv().await {
            Some(ResolverEvent::Resolved(service)) => break Ok(service),
            Some(ResolverEvent::Updated(_)) => continue,
            Some(ResolverEvent::Down) => break Err(Error::Timeout),
            None => break Err(Error::Stopped),
        }
    };

    stop.cancel();
    interface.stop_using();
    result
}
