//! Integration tests for the address codec and the header classifier.

use peerlink_protocol::{
    AddressFamily, EndpointAddress, HEADER_LEN, Traffic, classify,
};

// =========================================================================
// Address round-trip
// =========================================================================

#[test]
fn test_ipv4_round_trip_preserves_host_and_port() {
    for (host, port) in [
        ("0.0.0.0", 0),
        ("127.0.0.1", 6881),
        ("192.168.100.254", 65535),
        ("255.255.255.255", 1),
    ] {
        let addr = EndpointAddress::parse(host, port).unwrap();
        let decoded = EndpointAddress::decode(addr.encode()).unwrap();
        assert_eq!(decoded.host(), host);
        assert_eq!(decoded.port(), port);
        assert_eq!(decoded.family(), AddressFamily::V4);
    }
}

#[test]
fn test_ipv6_round_trip_preserves_canonical_host() {
    for (host, port) in [
        ("0:0:0:0:0:0:0:1", 443),
        ("fe80:0:0:0:a00:27ff:fe4e:66a1", 51413),
        ("2001:db8:85a3:0:0:8a2e:370:7334", 9),
        ("ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff", 65535),
    ] {
        let addr = EndpointAddress::parse(host, port).unwrap();
        let decoded = EndpointAddress::decode(addr.encode()).unwrap();
        assert_eq!(decoded.host(), host);
        assert_eq!(decoded.port(), port);
        assert_eq!(decoded.family(), AddressFamily::V6);
    }
}

#[test]
fn test_encoded_lengths_match_native_structs() {
    let v4 = EndpointAddress::parse("1.2.3.4", 1).unwrap();
    let v6 = EndpointAddress::parse("1:2:3:4:5:6:7:8", 1).unwrap();
    assert_eq!(v4.encode().len(), 16);
    assert_eq!(v6.encode().len(), 28);
}

// =========================================================================
// Header classification
// =========================================================================

fn datagram(byte0: u8, byte1: u8, len: usize) -> Vec<u8> {
    let mut d = vec![0u8; len];
    if len > 0 {
        d[0] = byte0;
    }
    if len > 1 {
        d[1] = byte1;
    }
    d
}

#[test]
fn test_every_valid_type_and_extension_is_engine_traffic() {
    for kind in 0u8..5 {
        for ext in 0u8..3 {
            let d = datagram((kind << 4) | 1, ext, HEADER_LEN);
            assert_eq!(classify(&d), Traffic::Engine, "type {kind} ext {ext}");
        }
    }
}

#[test]
fn test_invalid_fields_are_other_traffic() {
    // wrong version nibble
    assert_eq!(classify(&datagram(0x12, 0, 20)), Traffic::Other);
    assert_eq!(classify(&datagram(0x10, 0, 20)), Traffic::Other);
    // packet type out of range
    assert_eq!(classify(&datagram(0x51, 0, 20)), Traffic::Other);
    assert_eq!(classify(&datagram(0xf1, 0, 20)), Traffic::Other);
    // extension out of range
    assert_eq!(classify(&datagram(0x01, 3, 20)), Traffic::Other);
    assert_eq!(classify(&datagram(0x12, 0x04, 20)), Traffic::Other);
}

#[test]
fn test_length_threshold() {
    assert_eq!(classify(&datagram(0x11, 0, 20)), Traffic::Engine);
    assert_eq!(classify(&datagram(0x11, 0, 1500)), Traffic::Engine);
    assert_eq!(classify(&datagram(0x11, 0, 19)), Traffic::Other);
    assert_eq!(classify(&[]), Traffic::Other);
    assert_eq!(classify(&[0xffu8; 19]), Traffic::Other);
}
