//! Telecast wire format: hex transport encoding, the protobuf message,
//! and inbound classification.
//!
//! Uplink request/reply bodies travel as hex-ASCII-encoded protocol
//! buffers; any HTTP body that is not wholly hex-plus-whitespace is an
//! error page, not a reply. Decoded messages are classified by peer
//! device class: TTGATE/TTSERVE messages addressed to our device ID
//! are replies, TTAPP text messages are filtered by `#`-prefixed
//! listen tags.

use log::debug;
use prost::Message;

/// Device classes that appear in Telecast traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DeviceType {
    Unknown = 0,
    Solarcast = 1,
    BgeigieNano = 2,
    Ttgate = 3,
    Ttserve = 4,
    Ttapp = 5,
}

/// The subset of the Telecast message the core consumes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Telecast {
    #[prost(enumeration = "DeviceType", optional, tag = "1")]
    pub device_type: Option<i32>,
    #[prost(uint32, optional, tag = "2")]
    pub device_id: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub message: Option<String>,
}

/// What an inbound message turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundClass {
    /// Undecodable, or a filtered-out text message.
    NotDecoded,
    /// Measurement traffic from a peer Safecast device.
    Safecast,
    /// Relayable Telecast traffic not addressed to us.
    Telecast,
    /// A gateway reply to one of our requests.
    ReplyTtgate,
    /// A service reply to one of our requests.
    ReplyTtserve,
}

// ==================== Hex transport coding ====================

/// Decode one hex pair.
pub fn hex_value(hi: u8, lo: u8) -> Option<u8> {
    let nibble = |c: u8| -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    };
    Some(nibble(hi)? << 4 | nibble(lo)?)
}

/// Encode one byte as an uppercase hex pair.
pub fn hex_chars(byte: u8) -> (u8, u8) {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    (DIGITS[(byte >> 4) as usize], DIGITS[(byte & 0xf) as usize])
}

/// True when the text consists solely of hex pairs and whitespace.
/// This is the shortcut that separates protobuf reply bodies from
/// HTTP error pages.
pub fn is_hex_payload(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let hi = bytes[i];
        i += 1;
        if hi <= b' ' {
            continue;
        }
        if i >= bytes.len() {
            break;
        }
        let lo = bytes[i];
        i += 1;
        if hex_value(hi, lo).is_none() {
            return false;
        }
    }
    true
}

/// Decode leading hex pairs into binary, skipping leading whitespace
/// and stopping at the first non-hex character.
pub fn decode_hex_body(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i] <= b' ' {
        i += 1;
    }
    let mut out = Vec::new();
    while i + 1 < bytes.len() {
        match hex_value(bytes[i], bytes[i + 1]) {
            Some(b) => out.push(b),
            None => break,
        }
        i += 2;
    }
    out
}

/// Encode binary as an uppercase hex string.
pub fn encode_hex_body(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for &b in data {
        let (hi, lo) = hex_chars(b);
        out.push(hi as char);
        out.push(lo as char);
    }
    out
}

// ==================== Inbound classification ====================

/// Classify a decoded message relative to our device address and the
/// active listen tags.
pub fn classify(message: &Telecast, our_device_id: u32, listen_tags: &str) -> InboundClass {
    let addressed_to_us = message.device_id == Some(our_device_id);
    match message.device_type() {
        DeviceType::Solarcast | DeviceType::BgeigieNano => InboundClass::Safecast,
        DeviceType::Ttgate => {
            if addressed_to_us {
                InboundClass::ReplyTtgate
            } else {
                InboundClass::Telecast
            }
        }
        DeviceType::Ttserve => {
            if addressed_to_us {
                InboundClass::ReplyTtserve
            } else {
                InboundClass::Telecast
            }
        }
        DeviceType::Ttapp => {
            if listen_tags.is_empty() {
                return InboundClass::Telecast;
            }
            let text = message.message.as_deref().unwrap_or("");
            if tags_match(listen_tags, text) {
                InboundClass::Telecast
            } else {
                InboundClass::NotDecoded
            }
        }
        DeviceType::Unknown => InboundClass::Telecast,
    }
}

/// Case-insensitive match of any `#tag` in `listen_tags` against any
/// `#tag` in the message text.
fn tags_match(listen_tags: &str, text: &str) -> bool {
    listen_tags
        .split_whitespace()
        .filter(|w| w.starts_with('#'))
        .any(|tag| {
            text.split_whitespace()
                .filter(|w| w.starts_with('#'))
                .any(|mtag| mtag.eq_ignore_ascii_case(tag))
        })
}

/// Decode a hex-encoded reply body and classify it.
pub fn decode_received_message(
    text: &str,
    our_device_id: u32,
    listen_tags: &str,
) -> (InboundClass, Option<Telecast>) {
    let bin = decode_hex_body(text);
    if bin.is_empty() {
        return (InboundClass::NotDecoded, None);
    }
    match Telecast::decode(bin.as_slice()) {
        Ok(message) => {
            let class = classify(&message, our_device_id, listen_tags);
            (class, Some(message))
        }
        Err(e) => {
            debug!("telecast decode failed: {}", e);
            (InboundClass::NotDecoded, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_from(device_type: DeviceType, device_id: u32, text: &str) -> String {
        let message = Telecast {
            device_type: Some(device_type as i32),
            device_id: Some(device_id),
            message: Some(text.to_string()),
        };
        encode_hex_body(&message.encode_to_vec())
    }

    // ==================== Hex coding ====================

    #[test]
    fn test_hex_pair_roundtrip() {
        for byte in [0u8, 0x0f, 0x5a, 0xff] {
            let (hi, lo) = hex_chars(byte);
            assert_eq!(hex_value(hi, lo), Some(byte));
        }
    }

    #[test]
    fn test_hex_payload_detection() {
        assert!(is_hex_payload("0A1B2C"));
        assert!(is_hex_payload("  0A 1B\r\n2C "));
        assert!(!is_hex_payload("<html>error</html>"));
        assert!(!is_hex_payload("HTTP/1.1 500"));
    }

    #[test]
    fn test_decode_skips_leading_whitespace() {
        assert_eq!(decode_hex_body("  0102ff"), vec![1, 2, 0xff]);
        assert_eq!(decode_hex_body("0102zz03"), vec![1, 2]);
    }

    // ==================== Classification ====================

    #[test]
    fn test_reply_from_ttserve_addressed_to_us() {
        let hex = reply_from(DeviceType::Ttserve, 777, "cmd ping");
        let (class, msg) = decode_received_message(&hex, 777, "");
        assert_eq!(class, InboundClass::ReplyTtserve);
        assert_eq!(msg.unwrap().message.as_deref(), Some("cmd ping"));
    }

    #[test]
    fn test_ttserve_for_other_device_is_relay_traffic() {
        let hex = reply_from(DeviceType::Ttserve, 778, "cmd ping");
        let (class, _) = decode_received_message(&hex, 777, "");
        assert_eq!(class, InboundClass::Telecast);
    }

    #[test]
    fn test_safecast_peers_classified() {
        let hex = reply_from(DeviceType::BgeigieNano, 1, "");
        let (class, _) = decode_received_message(&hex, 777, "");
        assert_eq!(class, InboundClass::Safecast);
    }

    #[test]
    fn test_ttapp_filtered_by_tags() {
        let hex = reply_from(DeviceType::Ttapp, 5, "hello #SafeCast world");
        let (class, _) = decode_received_message(&hex, 777, "#safecast");
        assert_eq!(class, InboundClass::Telecast);
        let (class, _) = decode_received_message(&hex, 777, "#other");
        assert_eq!(class, InboundClass::NotDecoded);
        // No tags configured: everything is displayable traffic.
        let (class, _) = decode_received_message(&hex, 777, "");
        assert_eq!(class, InboundClass::Telecast);
    }

    #[test]
    fn test_garbage_is_not_decoded() {
        let (class, msg) = decode_received_message("not hex at all", 777, "");
        assert_eq!(class, InboundClass::NotDecoded);
        assert!(msg.is_none());
    }
}
