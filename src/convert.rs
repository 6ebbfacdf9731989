// Part of soem-master. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use crate::{
    engine::DNS_NAME_LENGTH,
    types::{Error, Result},
};

pub(crate) fn string_to_dns_name(input: &str) -> Result<heapless::String<DNS_NAME_LENGTH>> {
    let mut name = heapless::String::new();
    if name.push_str(input).is_err() {
        return Err(Error::InvalidArgument(format!(
            "DNS name can have a maximum length of {}, '{}' has {}",
            DNS_NAME_LENGTH,
            input,
            input.len()
        )));
    }
    Ok(name)
}

#[test]
fn test_string_to_dns_name() {
    let name = string_to_dns_name("some-device.local").expect("Name is ok");
    assert_eq!(name.as_str(), "some-device.local");

    let name = string_to_dns_name("\u{2665}\u{1F494};").expect("Name is ok");
    assert_eq!(name.len(), 8);

    let name = "a name that is just too long so we'll see what happens";
    let e = string_to_dns_name(name).unwrap_err();
    assert_eq!(
        e.to_string(),
        format!(
            "DNS name can have a maximum length of 32, '{}' has {}",
            name,
            name.len()
        )
    );
}

pub(crate) fn parse_mac(input: &str) -> Result<[u8; 6]> {
    let err = || Error::InvalidArgument(format!("'{}' is not a MAC address", input));
    let mut mac = [0; 6];
    let mut parts = input.split(|c| c == ':' || c == '-');
    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(err)?;
        if part.len() != 2 {
            return Err(err());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| err())?;
    }
    if parts.next().is_some() {
        return Err(err());
    }
    Ok(mac)
}

pub(crate) fn mac_to_string(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[test]
fn test_parse_mac() {
    assert_eq!(
        parse_mac("02:00:00:00:00:0a").unwrap(),
        [0x02, 0, 0, 0, 0, 0x0A]
    );
    assert_eq!(
        parse_mac("DE-AD-BE-EF-00-01").unwrap(),
        [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]
    );
    assert_eq!(mac_to_string(&[0x02, 0, 0, 0, 0, 0x0A]), "02:00:00:00:00:0a");

    for bad in &["", "02:00:00:00:00", "02:00:00:00:00:00:00", "2:0:0:0:0:0", "zz:00:00:00:00:00"] {
        let e = parse_mac(bad).unwrap_err();
        assert_eq!(e.to_string(), format!("'{}' is not a MAC address", bad));
    }
}
