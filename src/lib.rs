//! Multicast DNS and DNS-SD service discovery for link-local networks.
//!
//! Advertise a service:
//!
//! ```no_run
//! use dnssd::{Advertisement, AdvertisementOptions, ServiceType};
//!
//! # async fn example() -> Result<(), dnssd::Error> {
//! let service_type = ServiceType::tcp("_http")?;
//! let mut advertisement =
//!     Advertisement::new(service_type, 8080, AdvertisementOptions::default())?;
//! let mut events = advertisement.start().await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Browse for instances:
//!
//! ```no_run
//! use dnssd::{Browser, BrowserEvent, BrowserOptions, ServiceType};
//!
//! # async fn example() -> Result<(), dnssd::Error> {
//! let mut browser = Browser::new(ServiceType::tcp("_http")?, BrowserOptions::default());
//! let mut events = browser.start().await?;
//! while let Some(event) = events.recv().await {
//!     if let BrowserEvent::ServiceUp(service) = event {
//!         println!("found {} at {}:{}", service.name, service.host, service.port);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod actors;
mod advertisement;
mod browser;
mod cache;
mod error;
mod net;
mod resolve;
mod resolver;
mod responder;
mod service_type;
mod sleep;
mod timers;
mod validate;

pub use advertisement::{Advertisement, AdvertisementEvent, AdvertisementOptions};
pub use browser::{Browser, BrowserEvent, BrowserOptions};
pub use error::Error;
pub use resolve::{
    resolve, resolve_4, resolve_6, resolve_service, resolve_srv, resolve_txt, ResolveOptions,
    Resolved, SrvInfo,
};
pub use resolver::Service;
pub use service_type::ServiceType;

pub use dnssd_proto::packet::txt::{TxtData, TxtValue};
pub use dnssd_proto::packet::RecordType;

#[cfg(test)]
pub(crate) fn init_logs() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, registry, EnvFilter};

    let _ = registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("{}=debug", env!("CARGO_PKG_NAME")).into()
        }))
        .with(fmt::layer().with_ansi(cfg!(debug_assertions)))
        .try_init();
}
