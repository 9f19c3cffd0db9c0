//! Price-map offer negotiation between an already-trusted exchange and
//! facility.
//!
//! The exchange fans an offering out as one signed offer per facility.
//! The facility answers with exactly one of accept (echo), counter
//! (different price map, accepted), or decline. Callers distinguish
//! "accepted as-is" from "accepted with counter-offer" purely by price-
//! map equality against the original offering.

use crate::codec::offer_signature_bytes;
use crate::crypto::{random_iv, CryptoEngine};
use crate::database::Database;
use crate::error::{ExchangeError, Result};
use crate::events::{EventBus, ProtocolEvent};
use crate::messages::{PriceMapDto, PriceMapOfferMsg, PriceMapOfferResponse};
use crate::model::{
    Money, OfferExecutionState, PriceMap, PriceMapOfferEvent, PriceMapOffering, TrustedPeer,
};
use crate::registration::LocalIdentity;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Local limits a facility evaluates offers against.
#[derive(Debug, Clone)]
pub struct ConstraintPolicy {
    /// Largest real-power magnitude, in watts, this facility will commit.
    pub max_power: i64,
    /// Lowest acceptable apparent energy price; cheaper offers are
    /// countered at this price.
    pub min_price: Money,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OfferDecision {
    Accept,
    Counter(PriceMap),
    Decline(String),
}

impl ConstraintPolicy {
    pub fn evaluate(&self, price_map: &PriceMap) -> OfferDecision {
        if price_map.power.real_power.abs() > self.max_power {
            return OfferDecision::Decline(format!(
                "Requested {} W exceeds facility capability of {} W",
                price_map.power.real_power.abs(),
                self.max_power
            ));
        }
        if price_map.price.as_f64() < self.min_price.as_f64() {
            let mut countered = price_map.clone();
            countered.price = self.min_price.clone();
            return OfferDecision::Counter(countered);
        }
        OfferDecision::Accept
    }
}

/// Facility-side negotiation logic.
#[derive(Clone)]
pub struct NegotiationService {
    identity: Arc<LocalIdentity>,
    crypto: CryptoEngine,
    db: Database,
    bus: EventBus,
    policy: ConstraintPolicy,
}

impl NegotiationService {
    pub fn new(
        identity: Arc<LocalIdentity>,
        crypto: CryptoEngine,
        db: Database,
        bus: EventBus,
        policy: ConstraintPolicy,
    ) -> Self {
        Self {
            identity,
            crypto,
            db,
            bus,
            policy,
        }
    }

    /// Verify and evaluate an incoming offer, persist the resulting
    /// offer event, and build the signed reply.
    pub async fn receive_offer(&self, msg: &PriceMapOfferMsg) -> Result<PriceMapOfferResponse> {
        let peer = self
            .db
            .get_trusted_peer(&msg.exchange_uid)
            .await?
            .ok_or_else(|| ExchangeError::PeerNotFound(msg.exchange_uid.clone()))?;

        let offered = msg.price_map.clone().into_model()?;
        self.verify_offer_signature(msg, &peer, &offered).await?;

        let offering = PriceMapOffering {
            id: msg.offer_id,
            price_map: offered.clone(),
            start_date: msg.start_date,
        };

        let decision = self.policy.evaluate(&offered);
        let mut event = PriceMapOfferEvent::new(msg.offer_id, offering.id, offered);

        let mut queue = self.bus.deferred();
        queue.defer(ProtocolEvent::OfferReceived {
            offer_id: msg.offer_id,
        });

        match &decision {
            OfferDecision::Accept => {
                event.accepted = true;
                event.transition_to(OfferExecutionState::Waiting)?;
                queue.defer(ProtocolEvent::OfferAccepted {
                    offer_id: msg.offer_id,
                    counter_offer: false,
                });
            }
            OfferDecision::Counter(countered) => {
                event.accepted = true;
                event.price_map = countered.clone();
                event.transition_to(OfferExecutionState::Waiting)?;
                queue.defer(ProtocolEvent::OfferAccepted {
                    offer_id: msg.offer_id,
                    counter_offer: true,
                });
            }
            OfferDecision::Decline(reason) => {
                event.accepted = false;
                event.message = Some(reason.clone());
                queue.defer(ProtocolEvent::OfferDeclined {
                    offer_id: msg.offer_id,
                });
            }
        }

        self.db.create_offering(&offering).await?;
        self.db.create_offer_event(&event).await?;
        queue.flush();

        self.build_response(&event, msg.start_date, &peer).await
    }

    async fn verify_offer_signature(
        &self,
        msg: &PriceMapOfferMsg,
        peer: &TrustedPeer,
        price_map: &PriceMap,
    ) -> Result<()> {
        let shared = self
            .crypto
            .derive_shared_secret(&self.identity.key_pair, &peer.public_key)?;
        let payload = offer_signature_bytes(&msg.offer_id, price_map, &msg.start_date);
        let signature = hex::decode(&msg.signature).map_err(|_| ExchangeError::Security)?;
        let iv = crate::messages::decode_iv(&msg.iv)?;
        self.crypto
            .validate_message_digest(&shared, &signature, &peer.public_key, &payload, &iv)?;
        Ok(())
    }

    async fn build_response(
        &self,
        event: &PriceMapOfferEvent,
        start_date: DateTime<Utc>,
        peer: &TrustedPeer,
    ) -> Result<PriceMapOfferResponse> {
        let shared = self
            .crypto
            .derive_shared_secret(&self.identity.key_pair, &peer.public_key)?;
        let payload = offer_signature_bytes(&event.id, &event.price_map, &start_date);
        let iv = random_iv();
        let signature =
            self.crypto
                .sign_and_encrypt_digest(&shared, &payload, &self.identity.key_pair, &iv)?;

        Ok(PriceMapOfferResponse {
            offer_id: event.id,
            price_map: PriceMapDto::from(&event.price_map),
            start_date,
            accepted: event.accepted,
            message: event.message.clone(),
            facility_uid: self.identity.uid.clone(),
            signature: hex::encode(signature),
            iv: hex::encode(iv),
        })
    }
}

/// What the exchange learns from a facility's reply.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationOutcome {
    AcceptedAsIs,
    Countered(PriceMap),
    Declined(Option<String>),
}

/// Exchange-side offering management.
#[derive(Clone)]
pub struct OfferingService {
    identity: Arc<LocalIdentity>,
    crypto: CryptoEngine,
    db: Database,
}

impl OfferingService {
    pub fn new(identity: Arc<LocalIdentity>, crypto: CryptoEngine, db: Database) -> Self {
        Self {
            identity,
            crypto,
            db,
        }
    }

    pub async fn create_offering(
        &self,
        price_map: PriceMap,
        start_date: DateTime<Utc>,
    ) -> Result<PriceMapOffering> {
        price_map.validate()?;
        let offering = PriceMapOffering::new(price_map, start_date);
        self.db.create_offering(&offering).await?;
        Ok(offering)
    }

    /// Build the signed offer message for one target facility. The same
    /// shape serves original offer, counter-offer, and acceptance echo.
    pub fn build_offer(
        &self,
        offering: &PriceMapOffering,
        facility: &TrustedPeer,
    ) -> Result<PriceMapOfferMsg> {
        let shared = self
            .crypto
            .derive_shared_secret(&self.identity.key_pair, &facility.public_key)?;
        let payload =
            offer_signature_bytes(&offering.id, &offering.price_map, &offering.start_date);
        let iv = random_iv();
        let signature =
            self.crypto
                .sign_and_encrypt_digest(&shared, &payload, &self.identity.key_pair, &iv)?;

        Ok(PriceMapOfferMsg {
            offer_id: offering.id,
            price_map: PriceMapDto::from(&offering.price_map),
            start_date: offering.start_date,
            exchange_uid: self.identity.uid.clone(),
            signature: hex::encode(signature),
            iv: hex::encode(iv),
        })
    }

    /// Verify a facility's reply and classify it. An unknown offer id is
    /// a protocol error.
    pub async fn handle_response(
        &self,
        response: &PriceMapOfferResponse,
        facility: &TrustedPeer,
    ) -> Result<NegotiationOutcome> {
        let offering = self
            .db
            .get_offering(response.offer_id)
            .await?
            .ok_or_else(|| {
                ExchangeError::Protocol(format!(
                    "Offer {} references no known offering",
                    response.offer_id
                ))
            })?;

        let replied = response.price_map.clone().into_model()?;
        let shared = self
            .crypto
            .derive_shared_secret(&self.identity.key_pair, &facility.public_key)?;
        let payload = offer_signature_bytes(&response.offer_id, &replied, &response.start_date);
        let signature = hex::decode(&response.signature).map_err(|_| ExchangeError::Security)?;
        let iv = crate::messages::decode_iv(&response.iv)?;
        self.crypto
            .validate_message_digest(&shared, &signature, &facility.public_key, &payload, &iv)?;

        if !response.accepted {
            return Ok(NegotiationOutcome::Declined(response.message.clone()));
        }
        if replied == offering.price_map {
            Ok(NegotiationOutcome::AcceptedAsIs)
        } else {
            Ok(NegotiationOutcome::Countered(replied))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DurationRange, PowerComponents};
    use chrono::Duration;

    fn policy() -> ConstraintPolicy {
        ConstraintPolicy {
            max_power: 10_000,
            min_price: Money::parse("USD", "0.20").unwrap(),
        }
    }

    fn price_map(real_power: i64, price: &str) -> PriceMap {
        PriceMap::new(
            PowerComponents::new(real_power, 0),
            Duration::hours(1),
            DurationRange::new(Duration::seconds(5), Duration::seconds(60)),
            Money::parse("USD", price).unwrap(),
        )
    }

    #[test]
    fn acceptable_offer_is_accepted() {
        assert_eq!(
            policy().evaluate(&price_map(-5_000, "0.25")),
            OfferDecision::Accept
        );
    }

    #[test]
    fn cheap_offer_is_countered_at_min_price() {
        match policy().evaluate(&price_map(-5_000, "0.10")) {
            OfferDecision::Counter(countered) => {
                assert_eq!(countered.price, Money::parse("USD", "0.20").unwrap());
                assert_eq!(countered.power.real_power, -5_000);
            }
            other => panic!("expected counter, got {:?}", other),
        }
    }

    #[test]
    fn oversized_offer_is_declined() {
        match policy().evaluate(&price_map(-50_000, "0.25")) {
            OfferDecision::Decline(reason) => assert!(reason.contains("50000")),
            other => panic!("expected decline, got {:?}", other),
        }
    }
}
