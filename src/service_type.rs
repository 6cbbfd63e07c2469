//! Service type parsing and normalization.
//!
//! A service type is `_name._proto`, optionally followed by comma
//! separated subtypes: `_http._tcp,_printer`. Leading underscores are
//! added when missing, so `"http.tcp"` works too. The special
//! enumerator type `_services._dns-sd._udp` asks responders for the
//! service types they know about instead of instances.

use crate::error::Error;
use crate::validate;
use dnssd_proto::name;

use std::fmt::Display;
use std::str::FromStr;

const ENUMERATOR: &str = "_services._dns-sd";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceType {
    /// `_http`, underscore included. `_services._dns-sd` for the
    /// enumerator.
    name: String,
    /// `_tcp` or `_udp`.
    protocol: String,
    subtypes: Vec<String>,
}

impl ServiceType {
    pub fn new(name: impl AsRef<str>, protocol: impl AsRef<str>) -> Result<Self, Error> {
        let name = underscored(name.as_ref());
        let protocol = underscored(protocol.as_ref());

        validate::check_protocol(&protocol)?;
        if name != ENUMERATOR {
            validate::check_service_name(&name)?;
        }

        Ok(Self {
            name,
            protocol,
            subtypes: Vec::new(),
        })
    }

    pub fn tcp(name: impl AsRef<str>) -> Result<Self, Error> {
        Self::new(name, "_tcp")
    }

    pub fn udp(name: impl AsRef<str>) -> Result<Self, Error> {
        Self::new(name, "_udp")
    }

    /// The meta type answering with known service types instead of
    /// service instances.
    pub fn enumerator() -> Self {
        Self {
            name: ENUMERATOR.to_string(),
            protocol: String::from("_udp"),
            subtypes: Vec::new(),
        }
    }

    pub fn with_subtypes<I, S>(mut self, subtypes: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for subtype in subtypes {
            let subtype = underscored(subtype.as_ref());
            validate::check_label(&subtype, "subtype")?;
            self.subtypes.push(subtype);
        }
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn subtypes(&self) -> &[String] {
        &self.subtypes
    }

    pub fn is_enumerator(&self) -> bool {
        self.name == ENUMERATOR
    }

    /// `_http._tcp.local.`
    pub fn fqdn(&self, domain: &str) -> String {
        format!("{}.{}.{}", self.name, self.protocol, name::fqdn(domain))
    }

    /// Parse a type back out of a PTR target such as `_http._tcp.local.`.
    pub fn from_fqdn(fqdn: &str, domain: &str) -> Result<Self, Error> {
        let domain = name::fqdn(domain);
        let body = name::trimmed(fqdn);
        let domain_body = name::trimmed(&domain);
        let stripped = body
            .strip_suffix(domain_body)
            .and_then(|rest| rest.strip_suffix('.'))
            .ok_or_else(|| {
                Error::validation(format!("'{fqdn}' does not end with '{domain}'"))
            })?;

        let (name_part, protocol) = stripped
            .rsplit_once('.')
            .ok_or_else(|| Error::validation(format!("'{fqdn}' is not a service type name")))?;
        Self::new(name_part, protocol)
    }

    /// Instance name of a full service instance FQDN of this type, e.g.
    /// `Box._http._tcp.local.` yields `Box`.
    pub fn instance_name<'a>(&self, fullname: &'a str, domain: &str) -> Option<&'a str> {
        let suffix = self.fqdn(domain);
        let body = name::trimmed(fullname);
        let suffix_body = name::trimmed(&suffix);
        if body.len() <= suffix_body.len() {
            return None;
        }
        let split = body.len() - suffix_body.len();
        let (instance, rest) = body.split_at(split);
        if !rest.eq_ignore_ascii_case(suffix_body) {
            return None;
        }
        instance.strip_suffix('.').filter(|i| !i.is_empty())
    }
}

impl FromStr for ServiceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',');
        let base = parts.next().unwrap_or_default().trim();
        let subtypes: Vec<&str> = parts.map(str::trim).collect();

        let body = name::trimmed(base);
        let (name_part, protocol) = body
            .rsplit_once('.')
            .ok_or_else(|| Error::validation(format!("'{s}' is not a service type")))?;

        Self::new(name_part, protocol)?.with_subtypes(subtypes)
    }
}

impl TryFrom<(&str, &str)> for ServiceType {
    type Error = Error;

    fn try_from(value: (&str, &str)) -> Result<Self, Self::Error> {
        Self::new(value.0, value.1)
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.name, self.protocol)?;
        for subtype in &self.subtypes {
            write!(f, ",{subtype}")?;
        }
        Ok(())
    }
}

/// Each dotted piece gets a leading underscore when it is missing one.
fn underscored(part: &str) -> String {
    part.split('.')
        .map(|piece| {
            if piece.starts_with('_') {
                piece.to_string()
            } else {
                format!("_{piece}")
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}
