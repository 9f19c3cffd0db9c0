use crate::crypto::PublicKey;
use crate::error::{ExchangeError, Result};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Long-lived trust record produced by a completed registration.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustedPeer {
    pub uid: String,
    pub endpoint: String,
    pub public_key: PublicKey,
    pub created_at: DateTime<Utc>,
}

/// Transient handshake state, keyed by exchange uid. Persisted once the
/// exchange acknowledges the registration form, deleted when the
/// completion message verifies.
#[derive(Debug, Clone)]
pub struct RegistrationSession {
    pub exchange_uid: String,
    pub exchange_endpoint: String,
    pub exchange_public_key: PublicKey,
    pub facility_nonce: [u8; 12],
    pub exchange_nonce: [u8; 12],
    pub created_at: DateTime<Utc>,
}

impl RegistrationSession {
    pub fn is_expired(&self, ttl: Duration) -> bool {
        Utc::now() - self.created_at > ttl
    }
}

/// Real and reactive power, signed, in watts / VAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerComponents {
    pub real_power: i64,
    pub reactive_power: i64,
}

impl PowerComponents {
    pub fn new(real_power: i64, reactive_power: i64) -> Self {
        Self {
            real_power,
            reactive_power,
        }
    }

    /// Apparent power magnitude in VA.
    pub fn apparent_power(&self) -> f64 {
        ((self.real_power as f64).powi(2) + (self.reactive_power as f64).powi(2)).sqrt()
    }
}

/// Inclusive response-time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationRange {
    pub min: Duration,
    pub max: Duration,
}

impl DurationRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }
}

/// Exact decimal currency amount. Whole units and fractional nanos carry
/// the sign independently: -9.99 USD is units -9, nanos -990_000_000.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Money {
    pub currency: String,
    pub units: i64,
    pub nanos: i32,
}

impl Money {
    pub fn new(currency: impl Into<String>, units: i64, nanos: i32) -> Result<Self> {
        if units != 0 && nanos != 0 && (units < 0) != (nanos < 0) {
            return Err(ExchangeError::Validation(
                "Money units and nanos must carry the same sign".to_string(),
            ));
        }
        if nanos.abs() >= 1_000_000_000 {
            return Err(ExchangeError::Validation(
                "Money nanos must be within +/-999999999".to_string(),
            ));
        }
        Ok(Self {
            currency: currency.into(),
            units,
            nanos,
        })
    }

    /// Parse a plain decimal string such as "-9.99".
    pub fn parse(currency: impl Into<String>, value: &str) -> Result<Self> {
        let negative = value.starts_with('-');
        let unsigned = value.trim_start_matches(['-', '+']);
        let (whole, frac) = match unsigned.split_once('.') {
            Some((w, f)) => (w, f),
            None => (unsigned, ""),
        };
        if frac.len() > 9 {
            return Err(ExchangeError::Validation(format!(
                "Too many decimal places in amount: {}",
                value
            )));
        }
        let units: i64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| ExchangeError::Validation(format!("Invalid amount: {}", value)))?
        };
        let mut nanos: i32 = 0;
        if !frac.is_empty() {
            let scaled = format!("{:0<9}", frac);
            nanos = scaled
                .parse()
                .map_err(|_| ExchangeError::Validation(format!("Invalid amount: {}", value)))?;
        }
        let (units, nanos) = if negative {
            (-units, -nanos)
        } else {
            (units, nanos)
        };
        Self::new(currency, units, nanos)
    }

    /// Approximate value for display and derived-cost math only; the
    /// canonical encoding always uses the exact integer fields.
    pub fn as_f64(&self) -> f64 {
        self.units as f64 + self.nanos as f64 / 1_000_000_000.0
    }
}

/// A priced demand/supply commitment. Immutable once attached to an
/// offer.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceMap {
    pub power: PowerComponents,
    pub duration: Duration,
    pub response_time: DurationRange,
    pub price: Money,
}

impl PriceMap {
    pub fn new(
        power: PowerComponents,
        duration: Duration,
        response_time: DurationRange,
        price: Money,
    ) -> Self {
        Self {
            power,
            duration,
            response_time,
            price,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.duration < Duration::zero() {
            return Err(ExchangeError::Validation(
                "Duration must not be negative".to_string(),
            ));
        }
        if self.response_time.min > self.response_time.max {
            return Err(ExchangeError::Validation(
                "Response time minimum exceeds maximum".to_string(),
            ));
        }
        Ok(())
    }

    /// Derived cost: apparent power magnitude x duration (hours) x price.
    pub fn fixed_price(&self) -> f64 {
        let hours = self.duration.num_milliseconds() as f64 / 3_600_000.0;
        self.power.apparent_power() * hours * self.price.as_f64()
    }
}

/// An exchange's priced proposal, parent of one offer event per
/// targeted facility.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceMapOffering {
    pub id: Uuid,
    pub price_map: PriceMap,
    pub start_date: DateTime<Utc>,
}

impl PriceMapOffering {
    pub fn new(price_map: PriceMap, start_date: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            price_map,
            start_date,
        }
    }
}

/// Lifecycle of an accepted offer. Only forward transitions are valid;
/// no state is re-enterable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferExecutionState {
    Unknown,
    Waiting,
    Executing,
    Completed,
    Aborted,
}

impl OfferExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OfferExecutionState::Completed | OfferExecutionState::Aborted
        )
    }

    pub fn can_transition_to(&self, next: OfferExecutionState) -> bool {
        use OfferExecutionState::*;
        matches!(
            (self, next),
            (Unknown, Waiting)
                | (Waiting, Executing)
                | (Waiting, Completed)
                | (Waiting, Aborted)
                | (Executing, Completed)
                | (Executing, Aborted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OfferExecutionState::Unknown => "UNKNOWN",
            OfferExecutionState::Waiting => "WAITING",
            OfferExecutionState::Executing => "EXECUTING",
            OfferExecutionState::Completed => "COMPLETED",
            OfferExecutionState::Aborted => "ABORTED",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "UNKNOWN" => Ok(OfferExecutionState::Unknown),
            "WAITING" => Ok(OfferExecutionState::Waiting),
            "EXECUTING" => Ok(OfferExecutionState::Executing),
            "COMPLETED" => Ok(OfferExecutionState::Completed),
            "ABORTED" => Ok(OfferExecutionState::Aborted),
            other => Err(ExchangeError::Validation(format!(
                "Unknown execution state: {}",
                other
            ))),
        }
    }
}

/// Facility-side record of one offer, possibly carrying a
/// counter-proposed price map distinct from the offering's.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceMapOfferEvent {
    pub id: Uuid,
    pub offering_id: Uuid,
    pub price_map: PriceMap,
    pub accepted: bool,
    pub completed_successfully: bool,
    pub execution_state: OfferExecutionState,
    pub message: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl PriceMapOfferEvent {
    pub fn new(offer_id: Uuid, offering_id: Uuid, price_map: PriceMap) -> Self {
        Self {
            id: offer_id,
            offering_id,
            price_map,
            accepted: false,
            completed_successfully: false,
            execution_state: OfferExecutionState::Unknown,
            message: None,
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// Price-map equality against the offering is the only signal that
    /// distinguishes "accepted as-is" from "accepted with counter-offer".
    pub fn is_counter_offer(&self, offering: &PriceMapOffering) -> bool {
        self.price_map != offering.price_map
    }

    pub fn transition_to(&mut self, next: OfferExecutionState) -> Result<()> {
        if !self.execution_state.can_transition_to(next) {
            return Err(ExchangeError::Protocol(format!(
                "Invalid offer transition {} -> {}",
                self.execution_state.as_str(),
                next.as_str()
            )));
        }
        self.execution_state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_price_map() -> PriceMap {
        PriceMap::new(
            PowerComponents::new(-5_000, 0),
            Duration::hours(2),
            DurationRange::new(Duration::seconds(5), Duration::seconds(60)),
            Money::parse("USD", "0.25").unwrap(),
        )
    }

    #[test]
    fn money_negative_carries_sign_on_both_fields() {
        let m = Money::parse("USD", "-9.99").unwrap();
        assert_eq!(m.units, -9);
        assert_eq!(m.nanos, -990_000_000);
    }

    #[test]
    fn money_rejects_mixed_signs() {
        assert!(Money::new("USD", -9, 990_000_000).is_err());
        assert!(Money::new("USD", 9, -990_000_000).is_err());
        assert!(Money::new("USD", -9, -990_000_000).is_ok());
        assert!(Money::new("USD", 0, -500_000_000).is_ok());
    }

    #[test]
    fn session_expiry_compares_against_ttl() {
        let session = RegistrationSession {
            exchange_uid: "exch-1".to_string(),
            exchange_endpoint: "https://exch-1.example".to_string(),
            exchange_public_key: crate::crypto::KeyPair::generate().public_key(),
            facility_nonce: [0u8; 12],
            exchange_nonce: [0u8; 12],
            created_at: Utc::now() - Duration::hours(2),
        };
        assert!(session.is_expired(Duration::hours(1)));
        assert!(!session.is_expired(Duration::hours(3)));
    }

    #[test]
    fn money_parse_whole_amount() {
        let m = Money::parse("EUR", "42").unwrap();
        assert_eq!(m.units, 42);
        assert_eq!(m.nanos, 0);
    }

    #[test]
    fn fixed_price_uses_apparent_power() {
        let pm = sample_price_map();
        // 5 kVA x 2 h x 0.25 = 2500
        assert!((pm.fixed_price() - 2_500.0).abs() < 1e-6);
    }

    #[test]
    fn execution_state_forward_only() {
        use OfferExecutionState::*;
        assert!(Unknown.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Completed));
        assert!(Executing.can_transition_to(Aborted));

        assert!(!Waiting.can_transition_to(Unknown));
        assert!(!Executing.can_transition_to(Waiting));
        assert!(!Completed.can_transition_to(Executing));
        assert!(!Aborted.can_transition_to(Waiting));
        assert!(!Completed.can_transition_to(Aborted));
    }

    #[test]
    fn offer_event_rejects_invalid_transition() {
        let offering = PriceMapOffering::new(sample_price_map(), Utc::now());
        let mut event = PriceMapOfferEvent::new(Uuid::new_v4(), offering.id, sample_price_map());
        assert!(event.transition_to(OfferExecutionState::Executing).is_err());
        event.transition_to(OfferExecutionState::Waiting).unwrap();
        event.transition_to(OfferExecutionState::Executing).unwrap();
        event.transition_to(OfferExecutionState::Completed).unwrap();
        assert!(event.transition_to(OfferExecutionState::Aborted).is_err());
    }

    #[test]
    fn counter_offer_detected_by_price_map_inequality() {
        let offering = PriceMapOffering::new(sample_price_map(), Utc::now());
        let mut event =
            PriceMapOfferEvent::new(offering.id, offering.id, offering.price_map.clone());
        assert!(!event.is_counter_offer(&offering));

        event.price_map.price = Money::parse("USD", "0.30").unwrap();
        assert!(event.is_counter_offer(&offering));
    }
}
