//! Exercises the public surface that works without touching the network.

use dnssd::{Advertisement, AdvertisementOptions, Error, ServiceType, TxtData, TxtValue};
use similar_asserts::assert_eq;
use std::str::FromStr;

#[test]
fn service_types_parse_and_render() {
    let ty = ServiceType::from_str("_http._tcp,_printer").unwrap();
    assert_eq!(ty.name(), "_http");
    assert_eq!(ty.protocol(), "_tcp");
    assert_eq!(ty.subtypes(), ["_printer"]);
    assert_eq!(ty.to_string(), "_http._tcp,_printer");
    assert_eq!(ty.fqdn("local."), "_http._tcp.local.");

    assert!(ServiceType::from_str("_http._ftp").is_err());
    assert!(ServiceType::from_str("no-dots").is_err());

    let enumerator = ServiceType::from_str("_services._dns-sd._udp").unwrap();
    assert!(enumerator.is_enumerator());
}

#[test]
fn advertisements_validate_their_input() {
    let ty = ServiceType::tcp("_http").unwrap();

    let zero_port = Advertisement::new(ty.clone(), 0, AdvertisementOptions::default());
    assert!(matches!(zero_port, Err(Error::Validation(_))));

    let mut txt = TxtData::new();
    txt.set_str("waytoolongkey", "value");
    let options = AdvertisementOptions {
        txt: Some(txt),
        ..AdvertisementOptions::default()
    };
    assert!(matches!(
        Advertisement::new(ty.clone(), 8080, options),
        Err(Error::Validation(_))
    ));

    let options = AdvertisementOptions {
        name: Some(String::from("My Printer")),
        host: Some(String::from("printbox")),
        ..AdvertisementOptions::default()
    };
    assert!(Advertisement::new(ty, 8080, options).is_ok());
}

#[test]
fn txt_data_keeps_value_shapes_apart() {
    let mut txt = TxtData::new();
    txt.set_str("path", "/");
    txt.set_flag("on");
    txt.set_empty("note");

    assert_eq!(txt.get("path"), Some(&TxtValue::Bytes(b"/".to_vec())));
    assert_eq!(txt.get("on"), Some(&TxtValue::Flag));
    assert_eq!(txt.get("note"), Some(&TxtValue::Empty));
    assert_eq!(txt.get("absent"), None);

    let decoded = txt.decoded();
    assert_eq!(decoded[0], (String::from("path"), String::from("/")));
}
