//! Transport-agnostic wire messages for both protocols.
//!
//! These DTOs are what travels over the RPC mechanism; every signature
//! inside them is computed over the canonical byte layouts in
//! [`crate::codec`], never over the JSON form.

use crate::error::{ExchangeError, Result};
use crate::model::{DurationRange, Money, PowerComponents, PriceMap};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Read-only directory entry returned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeInfo {
    pub uid: String,
    pub endpoint: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyResponse {
    pub algorithm: String,
    pub encoding: String,
    pub key: String,
}

/// Route header binding a handshake message to its parties; the
/// signature is the encrypted digest envelope over the canonical route
/// payload, and `iv` is the nonce it was encrypted under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRoute {
    pub exchange_uid: String,
    pub facility_uid: String,
    pub signature: String,
    pub iv: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationFormData {
    pub facility_uid: String,
    pub facility_endpoint: String,
    pub facility_public_key: String,
    pub facility_nonce: String,
    pub form_fields: HashMap<String, String>,
    pub route: RegistrationRoute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationFormReceipt {
    pub exchange_nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationCompletion {
    pub registration_token: String,
    pub route: RegistrationRoute,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurationDto {
    pub seconds: i64,
    pub nanos: i32,
}

impl From<Duration> for DurationDto {
    fn from(d: Duration) -> Self {
        let seconds = d.num_seconds();
        let nanos = (d - Duration::seconds(seconds)).num_nanoseconds().unwrap_or(0) as i32;
        Self { seconds, nanos }
    }
}

impl From<DurationDto> for Duration {
    fn from(d: DurationDto) -> Self {
        Duration::seconds(d.seconds) + Duration::nanoseconds(d.nanos as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceMapDto {
    pub real_power: i64,
    pub reactive_power: i64,
    pub duration: DurationDto,
    pub response_time_min: DurationDto,
    pub response_time_max: DurationDto,
    pub currency: String,
    pub price_units: i64,
    pub price_nanos: i32,
}

impl From<&PriceMap> for PriceMapDto {
    fn from(pm: &PriceMap) -> Self {
        Self {
            real_power: pm.power.real_power,
            reactive_power: pm.power.reactive_power,
            duration: pm.duration.into(),
            response_time_min: pm.response_time.min.into(),
            response_time_max: pm.response_time.max.into(),
            currency: pm.price.currency.clone(),
            price_units: pm.price.units,
            price_nanos: pm.price.nanos,
        }
    }
}

impl PriceMapDto {
    pub fn into_model(self) -> Result<PriceMap> {
        let price = Money::new(self.currency, self.price_units, self.price_nanos)?;
        let pm = PriceMap::new(
            PowerComponents::new(self.real_power, self.reactive_power),
            self.duration.into(),
            DurationRange::new(self.response_time_min.into(), self.response_time_max.into()),
            price,
        );
        pm.validate()?;
        Ok(pm)
    }
}

/// The same shape serves the original offer, a counter-offer, and the
/// acceptance echo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceMapOfferMsg {
    pub offer_id: Uuid,
    pub price_map: PriceMapDto,
    pub start_date: DateTime<Utc>,
    pub exchange_uid: String,
    pub signature: String,
    pub iv: String,
}

/// Facility reply: accept (echoed price map), counter (different price
/// map, accepted), or decline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceMapOfferResponse {
    pub offer_id: Uuid,
    pub price_map: PriceMapDto,
    pub start_date: DateTime<Utc>,
    pub accepted: bool,
    pub message: Option<String>,
    pub facility_uid: String,
    pub signature: String,
    pub iv: String,
}

pub fn decode_nonce(hex_nonce: &str) -> Result<[u8; 12]> {
    let bytes = hex::decode(hex_nonce).map_err(|e| ExchangeError::Validation(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ExchangeError::Validation("Nonce must be 12 bytes".to_string()))
}

pub fn decode_iv(hex_iv: &str) -> Result<[u8; 12]> {
    decode_nonce(hex_iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_map_dto_roundtrip() {
        let pm = PriceMap::new(
            PowerComponents::new(-2_000, 100),
            Duration::minutes(30),
            DurationRange::new(Duration::seconds(1), Duration::seconds(10)),
            Money::parse("USD", "1.50").unwrap(),
        );
        let dto = PriceMapDto::from(&pm);
        let back = dto.into_model().unwrap();
        assert_eq!(pm, back);
    }

    #[test]
    fn nonce_decoding_enforces_length() {
        assert!(decode_nonce(&hex::encode([0u8; 12])).is_ok());
        assert!(decode_nonce(&hex::encode([0u8; 16])).is_err());
        assert!(decode_nonce("zz").is_err());
    }
}
