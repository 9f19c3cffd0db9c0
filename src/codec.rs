//! Canonical byte encoding for signable values.
//!
//! Signatures are computed over these fixed layouts, not over a
//! serialization library's output; both ends must produce byte-identical
//! encodings or signatures will never verify. All integers are
//! big-endian.

use crate::model::{DurationRange, Money, PowerComponents, PriceMap};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// A value with a fixed, deterministic signature encoding.
pub trait SignableMessage {
    /// Exact number of bytes [`append_signature_message`] will write.
    ///
    /// [`append_signature_message`]: SignableMessage::append_signature_message
    fn signature_message_len(&self) -> usize;

    fn append_signature_message(&self, buf: &mut Vec<u8>);

    fn signature_message_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.signature_message_len());
        self.append_signature_message(&mut buf);
        buf
    }
}

/// 8-byte seconds + 4-byte subsecond nanos.
impl SignableMessage for Duration {
    fn signature_message_len(&self) -> usize {
        12
    }

    fn append_signature_message(&self, buf: &mut Vec<u8>) {
        let seconds = self.num_seconds();
        let nanos = (*self - Duration::seconds(seconds))
            .num_nanoseconds()
            .unwrap_or(0) as i32;
        buf.extend_from_slice(&seconds.to_be_bytes());
        buf.extend_from_slice(&nanos.to_be_bytes());
    }
}

/// Same layout as a duration: epoch seconds + nanos.
impl SignableMessage for DateTime<Utc> {
    fn signature_message_len(&self) -> usize {
        12
    }

    fn append_signature_message(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.timestamp().to_be_bytes());
        buf.extend_from_slice(&(self.timestamp_subsec_nanos() as i32).to_be_bytes());
    }
}

/// 8-byte high half + 8-byte low half.
impl SignableMessage for Uuid {
    fn signature_message_len(&self) -> usize {
        16
    }

    fn append_signature_message(&self, buf: &mut Vec<u8>) {
        let (high, low) = self.as_u64_pair();
        buf.extend_from_slice(&high.to_be_bytes());
        buf.extend_from_slice(&low.to_be_bytes());
    }
}

/// Currency-code bytes (zero bytes if absent) + 8-byte whole units +
/// 4-byte fractional nanos. Sign is carried on both integer fields.
impl SignableMessage for Money {
    fn signature_message_len(&self) -> usize {
        self.currency.len() + 12
    }

    fn append_signature_message(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.currency.as_bytes());
        buf.extend_from_slice(&self.units.to_be_bytes());
        buf.extend_from_slice(&self.nanos.to_be_bytes());
    }
}

/// 8-byte real power + 8-byte reactive power.
impl SignableMessage for PowerComponents {
    fn signature_message_len(&self) -> usize {
        16
    }

    fn append_signature_message(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.real_power.to_be_bytes());
        buf.extend_from_slice(&self.reactive_power.to_be_bytes());
    }
}

/// min (12 bytes) + max (12 bytes).
impl SignableMessage for DurationRange {
    fn signature_message_len(&self) -> usize {
        24
    }

    fn append_signature_message(&self, buf: &mut Vec<u8>) {
        self.min.append_signature_message(buf);
        self.max.append_signature_message(buf);
    }
}

/// power (16) + duration (12) + response time (24) + price (variable).
impl SignableMessage for PriceMap {
    fn signature_message_len(&self) -> usize {
        self.power.signature_message_len()
            + self.duration.signature_message_len()
            + self.response_time.signature_message_len()
            + self.price.signature_message_len()
    }

    fn append_signature_message(&self, buf: &mut Vec<u8>) {
        self.power.append_signature_message(buf);
        self.duration.append_signature_message(buf);
        self.response_time.append_signature_message(buf);
        self.price.append_signature_message(buf);
    }
}

fn append_prefixed_str(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Canonical payload covered by the registration route signature:
/// exchangeUid || facilityUid || facilityEndpoint (each 2-byte BE
/// length-prefixed UTF-8) || facilityNonce (raw 12 bytes).
pub fn registration_route_bytes(
    exchange_uid: &str,
    facility_uid: &str,
    facility_endpoint: &str,
    facility_nonce: &[u8; 12],
) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(6 + exchange_uid.len() + facility_uid.len() + facility_endpoint.len() + 12);
    append_prefixed_str(&mut buf, exchange_uid);
    append_prefixed_str(&mut buf, facility_uid);
    append_prefixed_str(&mut buf, facility_endpoint);
    buf.extend_from_slice(facility_nonce);
    buf
}

/// Input to the registration-completion token digest:
/// exchangeNonce || facilityNonce || exchangeUid || facilityUid ||
/// facilityEndpoint.
pub fn registration_token_bytes(
    exchange_nonce: &[u8; 12],
    facility_nonce: &[u8; 12],
    exchange_uid: &str,
    facility_uid: &str,
    facility_endpoint: &str,
) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(24 + exchange_uid.len() + facility_uid.len() + facility_endpoint.len());
    buf.extend_from_slice(exchange_nonce);
    buf.extend_from_slice(facility_nonce);
    buf.extend_from_slice(exchange_uid.as_bytes());
    buf.extend_from_slice(facility_uid.as_bytes());
    buf.extend_from_slice(facility_endpoint.as_bytes());
    buf
}

/// Canonical bytes for a price-map offer message: offer id (16) +
/// price map (variable) + start date (12).
pub fn offer_signature_bytes(
    offer_id: &Uuid,
    price_map: &PriceMap,
    start_date: &DateTime<Utc>,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        offer_id.signature_message_len()
            + price_map.signature_message_len()
            + start_date.signature_message_len(),
    );
    offer_id.append_signature_message(&mut buf);
    price_map.append_signature_message(&mut buf);
    start_date.append_signature_message(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DurationRange, Money, PowerComponents};
    use chrono::TimeZone;

    fn sample_price_map() -> PriceMap {
        PriceMap::new(
            PowerComponents::new(-5_000, 250),
            Duration::hours(2),
            DurationRange::new(Duration::seconds(5), Duration::seconds(60)),
            Money::parse("USD", "-9.99").unwrap(),
        )
    }

    #[test]
    fn duration_layout() {
        let d = Duration::seconds(90) + Duration::nanoseconds(250);
        let bytes = d.signature_message_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..8], &90i64.to_be_bytes());
        assert_eq!(&bytes[8..], &250i32.to_be_bytes());
    }

    #[test]
    fn instant_layout() {
        let t = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let bytes = t.signature_message_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..8], &1_700_000_000i64.to_be_bytes());
        assert_eq!(&bytes[8..], &123_456_789i32.to_be_bytes());
    }

    #[test]
    fn uuid_layout_high_then_low() {
        let id = Uuid::parse_str("0123456789abcdef0123456789abcdef").unwrap();
        let bytes = id.signature_message_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..8], &0x0123456789abcdefu64.to_be_bytes());
        assert_eq!(&bytes[8..], &0x0123456789abcdefu64.to_be_bytes());
    }

    #[test]
    fn money_layout_negative_both_fields() {
        let m = Money::parse("USD", "-9.99").unwrap();
        let bytes = m.signature_message_bytes();
        assert_eq!(bytes.len(), 3 + 12);
        assert_eq!(&bytes[..3], b"USD");
        assert_eq!(&bytes[3..11], &(-9i64).to_be_bytes());
        assert_eq!(&bytes[11..], &(-990_000_000i32).to_be_bytes());
    }

    #[test]
    fn money_without_currency() {
        let m = Money::new("", 1, 500_000_000).unwrap();
        assert_eq!(m.signature_message_bytes().len(), 12);
    }

    #[test]
    fn price_map_encoding_is_deterministic_and_sized() {
        let pm = sample_price_map();
        let a = pm.signature_message_bytes();
        let b = pm.signature_message_bytes();
        assert_eq!(a, b);
        assert_eq!(a.len(), pm.signature_message_len());
        // power(16) + duration(12) + responseTime(24) + price(3 + 12)
        assert_eq!(a.len(), 16 + 12 + 24 + 15);
    }

    #[test]
    fn price_map_change_changes_bytes() {
        let a = sample_price_map();
        let mut b = sample_price_map();
        b.power.real_power += 1;
        assert_ne!(a.signature_message_bytes(), b.signature_message_bytes());
    }

    #[test]
    fn route_bytes_field_order() {
        let nonce = [7u8; 12];
        let bytes = registration_route_bytes("exch-1", "fac-1", "https://fac", &nonce);
        // 2B len + "exch-1"
        assert_eq!(&bytes[..2], &6u16.to_be_bytes());
        assert_eq!(&bytes[2..8], b"exch-1");
        assert_eq!(&bytes[bytes.len() - 12..], &nonce);
    }

    #[test]
    fn token_bytes_order() {
        let n2 = [2u8; 12];
        let n1 = [1u8; 12];
        let bytes = registration_token_bytes(&n2, &n1, "ex", "fa", "ep");
        assert_eq!(&bytes[..12], &n2);
        assert_eq!(&bytes[12..24], &n1);
        assert_eq!(&bytes[24..], b"exfaep");
    }
}
