//! Input validation for names, ports and TXT data, applied before
//! anything reaches the wire.

use crate::error::Error;
use dnssd_proto::packet::txt::{TxtData, TxtValue};

/// Longest service name on the wire, underscore included.
const MAX_SERVICE_NAME: usize = 16;
/// Longest TXT key, per RFC 6763 §6.4.
const MAX_TXT_KEY: usize = 9;
/// Longest single key=value pair.
const MAX_TXT_PAIR: usize = 255;
/// Longest TXT rdata we are willing to produce.
const MAX_TXT_TOTAL: usize = 1300;

pub(crate) fn check_protocol(protocol: &str) -> Result<(), Error> {
    if protocol == "_tcp" || protocol == "_udp" {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "protocol must be _tcp or _udp, got '{protocol}'"
        )))
    }
}

pub(crate) fn check_service_name(name: &str) -> Result<(), Error> {
    let Some(body) = name.strip_prefix('_') else {
        return Err(Error::validation(format!(
            "service '{name}' must start with an underscore"
        )));
    };
    if name.len() > MAX_SERVICE_NAME {
        return Err(Error::validation(format!(
            "service '{name}' is longer than {MAX_SERVICE_NAME} bytes"
        )));
    }
    if body.is_empty() {
        return Err(Error::validation("service name is empty"));
    }
    if !body
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    {
        return Err(Error::validation(format!(
            "service '{name}' may only contain letters, digits and hyphens"
        )));
    }
    if body.contains("--") {
        return Err(Error::validation(format!(
            "service '{name}' has consecutive hyphens"
        )));
    }
    if !body.bytes().any(|b| b.is_ascii_alphabetic()) {
        return Err(Error::validation(format!(
            "service '{name}' needs at least one letter"
        )));
    }
    Ok(())
}

pub(crate) fn check_label(label: &str, what: &str) -> Result<(), Error> {
    if label.is_empty() {
        return Err(Error::validation(format!("{what} label is empty")));
    }
    if label.len() > 63 {
        return Err(Error::validation(format!(
            "{what} label '{label}' is longer than 63 bytes"
        )));
    }
    if label.bytes().any(|b| b < 0x20 || b == 0x7F) {
        return Err(Error::validation(format!(
            "{what} label contains control characters"
        )));
    }
    Ok(())
}

pub(crate) fn check_port(port: u16) -> Result<(), Error> {
    if port == 0 {
        return Err(Error::validation("port must be between 1 and 65535"));
    }
    Ok(())
}

pub(crate) fn check_txt(txt: &TxtData) -> Result<(), Error> {
    for (key, value) in txt.iter() {
        if key.is_empty() {
            return Err(Error::validation("TXT key is empty"));
        }
        if key.len() > MAX_TXT_KEY {
            return Err(Error::validation(format!(
                "TXT key '{key}' is longer than {MAX_TXT_KEY} bytes"
            )));
        }
        if key.bytes().any(|b| !(0x20..=0x7E).contains(&b) || b == b'=') {
            return Err(Error::validation(format!(
                "TXT key '{key}' must be printable ASCII without '='"
            )));
        }
        let value_len = match value {
            TxtValue::Bytes(bytes) => bytes.len() + 1,
            TxtValue::Empty => 1,
            TxtValue::Flag => 0,
        };
        if key.len() + value_len > MAX_TXT_PAIR {
            return Err(Error::validation(format!(
                "TXT entry '{key}' is longer than {MAX_TXT_PAIR} bytes"
            )));
        }
    }
    if txt.wire_len() > MAX_TXT_TOTAL {
        return Err(Error::validation(format!(
            "TXT data is longer than {MAX_TXT_TOTAL} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use dnssd_proto::packet::txt::TxtData;

    #[test]
    fn should_accept_good_service_names() {
        assert!(super::check_service_name("_http").is_ok());
        assert!(super::check_service_name("_airplay-2").is_ok());
    }

    #[test]
    fn should_reject_bad_service_names() {
        assert!(super::check_service_name("http").is_err());
        assert!(super::check_service_name("_").is_err());
        assert!(super::check_service_name("_way-too-long-name").is_err());
        assert!(super::check_service_name("_a--b").is_err());
        assert!(super::check_service_name("_1234").is_err());
        assert!(super::check_service_name("_sp ace").is_err());
    }

    #[test]
    fn should_check_protocols() {
        assert!(super::check_protocol("_tcp").is_ok());
        assert!(super::check_protocol("_udp").is_ok());
        assert!(super::check_protocol("_sctp").is_err());
    }

    #[test]
    fn should_check_labels() {
        assert!(super::check_label("Box", "instance").is_ok());
        assert!(super::check_label("", "instance").is_err());
        assert!(super::check_label(&"a".repeat(64), "instance").is_err());
        assert!(super::check_label("a\tb", "instance").is_err());
    }

    #[test]
    fn should_check_ports() {
        assert!(super::check_port(8080).is_ok());
        assert!(super::check_port(0).is_err());
    }

    #[test]
    fn should_check_txt_limits() {
        let mut txt = TxtData::new();
        txt.set_str("path", "/ok");
        assert!(super::check_txt(&txt).is_ok());

        let mut long_key = TxtData::new();
        long_key.set_str("waytoolongkey", "x");
        assert!(super::check_txt(&long_key).is_err());

        let mut bad_key = TxtData::new();
        bad_key.set_str("a=b", "x");
        assert!(super::check_txt(&bad_key).is_err());

        let mut huge = TxtData::new();
        huge.set_bytes("big", vec![b'x'; 300]);
        assert!(super::check_txt(&huge).is_err());

        let mut total = TxtData::new();
        for i in 0..8 {
            total.set_bytes(format!("k{i}"), vec![b'x'; 200]);
        }
        assert!(super::check_txt(&total).is_err());
    }
}
