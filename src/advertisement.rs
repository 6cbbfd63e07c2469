//! Advertising a service: a hostname responder for the address records
//! and a service responder for everything else, kept consistent through
//! renames, updates and wakes from sleep.

use crate::error::Error;
use crate::net::{socket, InterfaceEvent, NetInterface};
use crate::responder::{Responder, ResponderEvent, ResponderHandle};
use crate::service_type::ServiceType;
use crate::sleep::SleepMonitor;
use crate::validate;
use dnssd_proto::name;
use dnssd_proto::packet::question::QueryRecord;
use dnssd_proto::packet::record::{RData, ResourceRecord};
use dnssd_proto::packet::txt::TxtData;
use dnssd_proto::packet::{Packet, RecordType};

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// How long the loopback self-query may take before falling back to
/// interface enumeration.
const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(500);
const LOCAL_DOMAIN: &str = "local.";

#[derive(Debug)]
pub enum AdvertisementEvent {
    /// Probing finished; the service is discoverable.
    Active,
    /// The service instance had to be renamed.
    InstanceRenamed(String),
    /// The hostname had to be renamed; SRV targets follow automatically.
    HostRenamed(String),
    Stopped,
    Error(Error),
}

#[derive(Debug, Clone, Default)]
pub struct AdvertisementOptions {
    /// Instance name; defaults to the hostname label.
    pub name: Option<String>,
    /// Host label; defaults to the OS hostname.
    pub host: Option<String>,
    pub txt: Option<TxtData>,
    pub subtypes: Vec<String>,
    /// Bind to a specific local address.
    pub interface: Option<Ipv4Addr>,
}

enum AdCmd {
    UpdateTxt(TxtData),
    Stop {
        force: bool,
        done: oneshot::Sender<()>,
    },
}

pub struct Advertisement {
    service_type: ServiceType,
    port: u16,
    options: AdvertisementOptions,
    cmd: Option<mpsc::UnboundedSender<AdCmd>>,
    stop: CancellationToken,
}

impl Advertisement {
    pub fn new(
        service_type: ServiceType,
        port: u16,
        options: AdvertisementOptions,
    ) -> Result<Self, Error> {
        validate::check_port(port)?;
        if let Some(name) = &options.name {
            validate::check_label(name, "instance")?;
        }
        if let Some(host) = &options.host {
            validate::check_label(host, "host")?;
        }
        if let Some(txt) = &options.txt {
            validate::check_txt(txt)?;
        }
        for subtype in &options.subtypes {
            validate::check_label(subtype, "subtype")?;
        }
        Ok(Self {
            service_type,
            port,
            options,
            cmd: None,
            stop: CancellationToken::new(),
        })
    }

    /// Bind the interface and run the probe/announce/respond lifecycle.
    pub async fn start(&mut self) -> Result<mpsc::UnboundedReceiver<AdvertisementEvent>, Error> {
        if self.cmd.is_some() {
            return Err(Error::validation("advertisement is already started"));
        }
        let interface = NetInterface::shared(self.options.interface);
        interface.use_interface().await.map_err(Error::Bind)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let monitor = SleepMonitor::spawn();

        let host_label = match &self.options.host {
            Some(host) => host.clone(),
            None => default_host_label(),
        };
        let instance = match &self.options.name {
            Some(name) => name.clone(),
            None => host_label.clone(),
        };

        let task = AdvertisementTask {
            interface,
            service_type: self.service_type.clone(),
            port: self.port,
            instance,
            hostname: format!("{host_label}.{LOCAL_DOMAIN}"),
            txt: self.options.txt.clone().unwrap_or_default(),
            subtypes: self.options.subtypes.clone(),
            tx: event_tx,
            cmd_rx,
            stop: self.stop.clone(),
            wake: monitor.sender(),
            _monitor: monitor,
        };
        tokio::spawn(task.run());
        self.cmd = Some(cmd_tx);
        Ok(event_rx)
    }

    /// Replace the TXT data; takes effect on the responder's next turn.
    pub fn update_txt(&self, txt: TxtData) -> Result<(), Error> {
        validate::check_txt(&txt)?;
        let Some(cmd) = &self.cmd else {
            return Err(Error::validation("advertisement is not started"));
        };
        cmd.send(AdCmd::UpdateTxt(txt))
            .map_err(|_| Error::Stopped)
    }

    /// Stop advertising. Without `force` both responders say goodbye
    /// first.
    pub async fn stop(&self, force: bool) {
        let Some(cmd) = &self.cmd else {
            self.stop.cancel();
            return;
        };
        let (done, wait) = oneshot::channel();
        if cmd.send(AdCmd::Stop { force, done }).is_err() {
            return;
        }
        let _ = wait.await;
    }
}

impl Drop for Advertisement {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn default_host_label() -> String {
    hostname::get()
        .ok()
        .and_then(|host| host.into_string().ok())
        .and_then(|host| host.split('.').next().map(str::to_string))
        .filter(|label| !label.is_empty())
        .unwrap_or_else(|| String::from("computer"))
}

enum Flow {
    Restart,
    Finished,
}

struct AdvertisementTask {
    interface: Arc<NetInterface>,
    service_type: ServiceType,
    port: u16,
    instance: String,
    hostname: String,
    txt: TxtData,
    subtypes: Vec<String>,
    tx: mpsc::UnboundedSender<AdvertisementEvent>,
    cmd_rx: mpsc::UnboundedReceiver<AdCmd>,
    stop: CancellationToken,
    wake: broadcast::Sender<()>,
    _monitor: SleepMonitor,
}

impl AdvertisementTask {
    async fn run(mut self) {
        loop {
            match self.lifecycle().await {
                Ok(Flow::Restart) => continue,
                Ok(Flow::Finished) => break,
                Err(error) => {
                    let _ = self.tx.send(AdvertisementEvent::Error(error));
                    break;
                }
            }
        }
        let _ = self.tx.send(AdvertisementEvent::Stopped);
        self.interface.stop_using();
    }

    async fn lifecycle(&mut self) -> Result<Flow, Error> {
        // which of our addresses routes toward the multicast group?
        let default_address = self.discover_default_address().await?;

        let (host_records, bridgeable) = self.make_host_records(default_address);
        let (host, mut host_events) = Responder::spawn(
            self.interface.clone(),
            host_records.clone(),
            bridgeable,
            self.wake.clone(),
        )?;

        // the service records must reference a verified hostname, so the
        // service responder waits for the host responder to finish
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    host.stop();
                    return Ok(Flow::Finished);
                }
                Some(cmd) = self.cmd_rx.recv() => match cmd {
                    AdCmd::UpdateTxt(txt) => self.txt = txt,
                    AdCmd::Stop { force: _, done } => {
                        // nothing announced yet, so nothing to retract
                        host.stop();
                        let _ = done.send(());
                        return Ok(Flow::Finished);
                    }
                },
                event = host_events.recv() => match event {
                    Some(ResponderEvent::ProbingComplete) => break,
                    Some(ResponderEvent::Renamed(label)) => {
                        self.hostname = format!("{label}.{LOCAL_DOMAIN}");
                        let _ = self
                            .tx
                            .send(AdvertisementEvent::HostRenamed(self.hostname.clone()));
                    }
                    Some(ResponderEvent::Error(error)) => {
                        host.stop();
                        return Err(error);
                    }
                    Some(ResponderEvent::Stopped) | None => {
                        return Ok(Flow::Finished);
                    }
                },
            }
        }

        let service_records = self.make_service_records(&host_records);
        let (service, mut service_events) = Responder::spawn(
            self.interface.clone(),
            service_records,
            Vec::new(),
            self.wake.clone(),
        )?;

        let mut wake_rx = self.wake.subscribe();
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    host.stop();
                    service.stop();
                    return Ok(Flow::Finished);
                }
                _ = wake_rx.recv() => {
                    // resume from sleep: the address may have changed, so
                    // everything restarts from discovery
                    host.stop();
                    service.stop();
                    return Ok(Flow::Restart);
                }
                Some(cmd) = self.cmd_rx.recv() => match cmd {
                    AdCmd::UpdateTxt(txt) => {
                        self.txt = txt.clone();
                        service.update_each(RecordType::TXT, move |record| {
                            if let RData::TXT(data) = &mut record.rdata {
                                *data = txt.clone();
                            }
                        });
                    }
                    AdCmd::Stop { force, done } => {
                        if force {
                            host.stop();
                            service.stop();
                        } else {
                            futures::join!(host.goodbye(), service.goodbye());
                        }
                        let _ = done.send(());
                        return Ok(Flow::Finished);
                    }
                },
                event = service_events.recv() => match event {
                    Some(ResponderEvent::ProbingComplete) => {
                        let _ = self.tx.send(AdvertisementEvent::Active);
                    }
                    Some(ResponderEvent::Renamed(instance)) => {
                        self.instance = instance.clone();
                        let _ = self.tx.send(AdvertisementEvent::InstanceRenamed(instance));
                    }
                    Some(ResponderEvent::Error(error)) => {
                        host.stop();
                        return Err(error);
                    }
                    Some(ResponderEvent::Stopped) | None => {
                        host.stop();
                        return Ok(Flow::Finished);
                    }
                },
                event = host_events.recv() => match event {
                    Some(ResponderEvent::Renamed(label)) => {
                        self.hostname = format!("{label}.{LOCAL_DOMAIN}");
                        let _ = self
                            .tx
                            .send(AdvertisementEvent::HostRenamed(self.hostname.clone()));
                        let hostname = self.hostname.clone();
                        service.update_each(RecordType::SRV, move |record| {
                            if let RData::SRV { target, .. } = &mut record.rdata {
                                *target = hostname.clone();
                            }
                        });
                    }
                    Some(ResponderEvent::Error(error)) => {
                        service.stop();
                        return Err(error);
                    }
                    Some(ResponderEvent::ProbingComplete) => {}
                    Some(ResponderEvent::Stopped) | None => {
                        service.stop();
                        return Ok(Flow::Finished);
                    }
                },
            }
        }
    }

    /// Send one query for our own hostname and watch it loop back; the
    /// source address is the default route for the multicast interface.
    async fn discover_default_address(&self) -> Result<IpAddr, Error> {
        let mut events = self.interface.subscribe();
        let probe = Packet::query()
            .with_questions(vec![QueryRecord::new(&self.hostname, RecordType::A)]);
        self.interface
            .send(&probe, None)
            .await
            .map_err(Error::Bind)?;

        let local = self.interface.local_addresses();
        let hostname = self.hostname.clone();
        let watch = async {
            loop {
                match events.recv().await {
                    Ok(InterfaceEvent::Query(packet)) => {
                        if packet.is_local(&local)
                            && packet
                                .questions
                                .iter()
                                .any(|question| name::eq_ignore_case(&question.name, &hostname))
                        {
                            if let Some(origin) = packet.origin {
                                return Some(origin.ip());
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        if let Ok(Some(address)) = tokio::time::timeout(DISCOVERY_TIMEOUT, watch).await {
            return Ok(address);
        }

        // no loopback observed; fall back to enumeration
        socket::local_interfaces()
            .into_iter()
            .find(|iface| !iface.internal && iface.address.is_ipv4())
            .map(|iface| iface.address)
            .ok_or_else(|| Error::Interface(String::from("no usable local address")))
    }

    /// Address records for the default interface, and a bridgeable set
    /// covering every other local address that claims the same name.
    fn make_host_records(&self, address: IpAddr) -> (Vec<ResourceRecord>, Vec<ResourceRecord>) {
        let mut records = Vec::new();
        let mut nsec_types = Vec::new();

        if let IpAddr::V4(v4) = address {
            records.push(ResourceRecord::a(&self.hostname, v4));
            nsec_types.push(RecordType::A.into_num());
        }

        let interfaces = socket::local_interfaces();
        let default_interface = interfaces
            .iter()
            .find(|iface| iface.address == address)
            .map(|iface| iface.name.clone());

        // IPv6 is only advertised for link-local addresses of the same
        // physical interface
        for iface in &interfaces {
            if Some(&iface.name) != default_interface.as_ref() {
                continue;
            }
            if let IpAddr::V6(v6) = iface.address {
                if (v6.segments()[0] & 0xFFC0) == 0xFE80 {
                    records.push(ResourceRecord::aaaa(&self.hostname, v6));
                    if !nsec_types.contains(&RecordType::AAAA.into_num()) {
                        nsec_types.push(RecordType::AAAA.into_num());
                    }
                }
            }
        }

        records.push(ResourceRecord::nsec(&self.hostname, nsec_types));

        let mut bridgeable = Vec::new();
        for iface in &interfaces {
            if iface.internal {
                continue;
            }
            match iface.address {
                IpAddr::V4(v4) => bridgeable.push(ResourceRecord::a(&self.hostname, v4)),
                IpAddr::V6(v6) => bridgeable.push(ResourceRecord::aaaa(&self.hostname, v6)),
            }
        }

        (records, bridgeable)
    }

    fn make_service_records(&self, host_records: &[ResourceRecord]) -> Vec<ResourceRecord> {
        let type_name = self.service_type.fqdn(LOCAL_DOMAIN);
        let fullname = format!("{}.{}", self.instance, type_name);

        let srv = ResourceRecord::srv(&fullname, &self.hostname, self.port);
        let txt = ResourceRecord::txt(&fullname, self.txt.clone());
        let nsec = ResourceRecord::nsec(
            &fullname,
            [RecordType::TXT.into_num(), RecordType::SRV.into_num()],
        );

        let mut ptr_additionals = vec![srv.clone(), txt.clone(), nsec.clone()];
        ptr_additionals.extend(host_records.iter().cloned());
        let ptr = ResourceRecord::ptr(&type_name, &fullname).with_additionals(ptr_additionals);

        let enumerator_ptr = ResourceRecord::ptr(
            format!("_services._dns-sd._udp.{LOCAL_DOMAIN}"),
            &type_name,
        );

        let mut records = vec![srv, txt, nsec, ptr, enumerator_ptr];
        for subtype in &self.subtypes {
            let subtype = if subtype.starts_with('_') {
                subtype.clone()
            } else {
                format!("_{subtype}")
            };
            records.push(ResourceRecord::ptr(
                format!("{subtype}._sub.{type_name}"),
                &fullname,
            ));
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::{AdvertisementEvent, AdvertisementTask};
    use crate::net::NetInterface;
    use crate::service_type::ServiceType;
    use crate::sleep::SleepMonitor;
    use dnssd_proto::packet::record::RData;
    use dnssd_proto::packet::txt::TxtData;
    use dnssd_proto::packet::Packet;
    use std::net::{IpAddr, Ipv4Addr};
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        events: mpsc::UnboundedReceiver<AdvertisementEvent>,
        cmd: mpsc::UnboundedSender<super::AdCmd>,
        stop: CancellationToken,
    }

    fn spawn_task(interface: &Arc<NetInterface>) -> Fixture {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (cmd, cmd_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let monitor = SleepMonitor::spawn();
        let task = AdvertisementTask {
            interface: interface.clone(),
            service_type: ServiceType::from_str("_http._tcp").unwrap(),
            port: 8080,
            instance: String::from("Box"),
            hostname: String::from("box.local."),
            txt: TxtData::new(),
            subtypes: Vec::new(),
            tx: event_tx,
            cmd_rx,
            stop: stop.clone(),
            wake: monitor.sender(),
            _monitor: monitor,
        };
        tokio::spawn(task.run());
        Fixture { events, cmd, stop }
    }

    async fn feed_discovery(interface: &Arc<NetInterface>) {
        // reflect the self-query back as if multicast loopback delivered
        // it from one of our own addresses
        tokio::time::sleep(Duration::from_millis(10)).await;
        let query = Packet::query().with_questions(vec![
            dnssd_proto::packet::question::QueryRecord::new(
                "box.local.",
                dnssd_proto::packet::RecordType::A,
            ),
        ]);
        interface.inject(
            &query,
            std::net::SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 5353),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_advertise_hostname_then_service() {
        crate::init_logs();

        let (interface, mut tap) = NetInterface::test();
        let mut fixture = spawn_task(&interface);
        feed_discovery(&interface).await;

        // both responders probe and announce; Active signals the end
        loop {
            match fixture.events.recv().await.expect("advertisement event") {
                AdvertisementEvent::Active => break,
                AdvertisementEvent::Error(error) => panic!("failed: {error}"),
                _ => continue,
            }
        }

        tokio::time::sleep(Duration::from_secs(4)).await;
        let mut saw_host_probe = false;
        let mut saw_service_announcement = false;
        while let Ok((packet, _)) = tap.try_recv() {
            if packet.is_probe()
                && packet.questions.iter().any(|q| q.name == "box.local.")
            {
                saw_host_probe = true;
            }
            if packet.is_answer()
                && packet.answers.iter().any(|record| {
                    matches!(&record.rdata, RData::SRV { port, .. } if *port == 8080)
                })
            {
                saw_service_announcement = true;
            }
        }
        assert!(saw_host_probe);
        assert!(saw_service_announcement);

        fixture.stop.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_with_goodbyes() {
        crate::init_logs();

        let (interface, mut tap) = NetInterface::test();
        let mut fixture = spawn_task(&interface);
        feed_discovery(&interface).await;

        loop {
            match fixture.events.recv().await.expect("advertisement event") {
                AdvertisementEvent::Active => break,
                AdvertisementEvent::Error(error) => panic!("failed: {error}"),
                _ => continue,
            }
        }
        tokio::time::sleep(Duration::from_secs(4)).await;
        while tap.try_recv().is_ok() {}

        let (done, wait) = tokio::sync::oneshot::channel();
        fixture
            .cmd
            .send(super::AdCmd::Stop { force: false, done })
            .unwrap();
        wait.await.unwrap();

        let mut saw_goodbye = false;
        while let Ok((packet, _)) = tap.try_recv() {
            if packet.is_answer() && packet.answers.iter().any(|record| record.ttl == 0) {
                saw_goodbye = true;
            }
        }
        assert!(saw_goodbye);

        assert!(matches!(
            fixture.events.recv().await,
            Some(AdvertisementEvent::Stopped)
        ));
    }
}
