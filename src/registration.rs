//! Facility/exchange registration handshake.
//!
//! The facility discovers an exchange through the registry, fetches its
//! public key, and submits signed registration data. Both sides derive
//! the same shared key from their key pairs without ever transmitting
//! it. The exchange acknowledges with its own nonce and later, out of
//! band, sends a completion message whose token and route signature the
//! facility recomputes independently before promoting the exchange to a
//! trusted peer.

use crate::codec::{registration_route_bytes, registration_token_bytes};
use crate::crypto::{random_iv, random_nonce, sha256, CryptoEngine, KeyPair, PublicKey};
use crate::database::Database;
use crate::error::{ExchangeError, Result};
use crate::events::{EventBus, ProtocolEvent};
use crate::messages::{
    decode_iv, decode_nonce, ExchangeInfo, RegistrationCompletion, RegistrationFormData,
    RegistrationFormReceipt, RegistrationRoute,
};
use crate::model::{RegistrationSession, TrustedPeer};
use crate::registry::RegistryClient;
use chrono::Utc;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;

/// This participant's own identity: uid, advertised endpoint, and the
/// key pair whose private half never leaves the process.
pub struct LocalIdentity {
    pub uid: String,
    pub endpoint: String,
    pub key_pair: KeyPair,
}

/// Facility-side registration protocol service.
#[derive(Clone)]
pub struct RegistrationService {
    identity: Arc<LocalIdentity>,
    crypto: CryptoEngine,
    registry: RegistryClient,
    db: Database,
    bus: EventBus,
    client: Client,
}

impl RegistrationService {
    pub fn new(
        identity: Arc<LocalIdentity>,
        crypto: CryptoEngine,
        registry: RegistryClient,
        db: Database,
        bus: EventBus,
    ) -> Self {
        Self {
            identity,
            crypto,
            registry,
            db,
            bus,
            client: Client::new(),
        }
    }

    pub async fn list_exchanges(&self) -> Result<Vec<ExchangeInfo>> {
        self.registry.list_exchanges().await
    }

    /// Submit registration to an exchange: fetch its public key, derive
    /// the shared key, sign the route payload with it, POST the form,
    /// and persist a session keyed by exchange uid once the receipt
    /// arrives.
    pub async fn submit_registration(
        &self,
        exchange: &ExchangeInfo,
        form_fields: HashMap<String, String>,
    ) -> Result<()> {
        let key_response = self.registry.fetch_public_key(&exchange.endpoint).await?;
        let exchange_key = PublicKey::from_hex(&key_response.key)?;

        let facility_nonce = random_nonce();
        let shared = self
            .crypto
            .derive_shared_secret(&self.identity.key_pair, &exchange_key)?;

        let payload = registration_route_bytes(
            &exchange.uid,
            &self.identity.uid,
            &self.identity.endpoint,
            &facility_nonce,
        );
        let iv = random_iv();
        let signature =
            self.crypto
                .sign_and_encrypt_digest(&shared, &payload, &self.identity.key_pair, &iv)?;

        let form = RegistrationFormData {
            facility_uid: self.identity.uid.clone(),
            facility_endpoint: self.identity.endpoint.clone(),
            facility_public_key: self.identity.key_pair.public_key().to_hex(),
            facility_nonce: hex::encode(facility_nonce),
            form_fields,
            route: RegistrationRoute {
                exchange_uid: exchange.uid.clone(),
                facility_uid: self.identity.uid.clone(),
                signature: hex::encode(signature),
                iv: hex::encode(iv),
            },
        };

        let response = self
            .client
            .post(format!("{}/register", exchange.endpoint))
            .json(&form)
            .send()
            .await?
            .error_for_status()?;
        let receipt: RegistrationFormReceipt = response.json().await?;
        let exchange_nonce = decode_nonce(&receipt.exchange_nonce)?;

        self.record_receipt(exchange, &exchange_key, facility_nonce, exchange_nonce)
            .await
    }

    /// Persist the session once the exchange acknowledges the form.
    /// Split out so a transport-owning caller can drive the handshake
    /// directly in tests.
    pub async fn record_receipt(
        &self,
        exchange: &ExchangeInfo,
        exchange_key: &PublicKey,
        facility_nonce: [u8; 12],
        exchange_nonce: [u8; 12],
    ) -> Result<()> {
        let session = RegistrationSession {
            exchange_uid: exchange.uid.clone(),
            exchange_endpoint: exchange.endpoint.clone(),
            exchange_public_key: *exchange_key,
            facility_nonce,
            exchange_nonce,
            created_at: Utc::now(),
        };
        self.db.create_registration_session(&session).await?;

        tracing::info!(exchange = %exchange.uid, "registration awaiting completion");
        Ok(())
    }

    /// Sign a route payload for an offer or completion check using the
    /// shared key with the given peer key.
    fn route_signature_payload(&self, exchange_uid: &str, facility_nonce: &[u8; 12]) -> Vec<u8> {
        registration_route_bytes(
            exchange_uid,
            &self.identity.uid,
            &self.identity.endpoint,
            facility_nonce,
        )
    }

    /// Handle the exchange's asynchronous completion message.
    ///
    /// The registration token and route signature are both recomputed
    /// locally; only when both match is the session promoted to a
    /// trusted peer and deleted. Replaying a completion for an
    /// already-completed session finds no session and is rejected. A
    /// failed check preserves the session so the exchange can retry
    /// with a correct message.
    pub async fn complete_registration(
        &self,
        completion: &RegistrationCompletion,
    ) -> Result<TrustedPeer> {
        let exchange_uid = &completion.route.exchange_uid;
        let session = self
            .db
            .get_registration_session(exchange_uid)
            .await?
            .ok_or_else(|| ExchangeError::SessionNotFound(exchange_uid.clone()))?;

        let expected_token = sha256(&registration_token_bytes(
            &session.exchange_nonce,
            &session.facility_nonce,
            exchange_uid,
            &self.identity.uid,
            &self.identity.endpoint,
        ));
        let presented_token =
            hex::decode(&completion.registration_token).map_err(|_| ExchangeError::Security)?;
        if presented_token != expected_token {
            tracing::warn!(exchange = %exchange_uid, "completion token mismatch; session preserved");
            return Err(ExchangeError::Security);
        }

        let shared = self
            .crypto
            .derive_shared_secret(&self.identity.key_pair, &session.exchange_public_key)?;
        let payload = self.route_signature_payload(exchange_uid, &session.facility_nonce);
        let signature =
            hex::decode(&completion.route.signature).map_err(|_| ExchangeError::Security)?;
        let iv = decode_iv(&completion.route.iv)?;
        self.crypto.validate_message_digest(
            &shared,
            &signature,
            &session.exchange_public_key,
            &payload,
            &iv,
        )?;

        if !completion.success {
            self.db.delete_registration_session(exchange_uid).await?;
            self.bus.publish(ProtocolEvent::RegistrationCompleted {
                exchange_uid: exchange_uid.clone(),
                success: false,
            });
            return Err(ExchangeError::Protocol(format!(
                "Registration rejected by exchange {}",
                exchange_uid
            )));
        }

        let peer = TrustedPeer {
            uid: exchange_uid.clone(),
            endpoint: session.exchange_endpoint.clone(),
            public_key: session.exchange_public_key,
            created_at: Utc::now(),
        };

        let mut queue = self.bus.deferred();
        queue.defer(ProtocolEvent::RegistrationCompleted {
            exchange_uid: exchange_uid.clone(),
            success: true,
        });
        self.db.promote_session_to_peer(exchange_uid, &peer).await?;
        queue.flush();

        tracing::info!(exchange = %exchange_uid, "registration completed; peer trusted");
        Ok(peer)
    }

    /// Remove abandoned sessions past the configured TTL.
    pub async fn sweep_expired_sessions(&self, ttl: chrono::Duration) -> Result<u64> {
        let removed = self.db.delete_expired_sessions(ttl).await?;
        if removed > 0 {
            tracing::info!(removed, "expired registration sessions removed");
        }
        Ok(removed)
    }
}

/// Exchange-side registration handling: verifies a submitted form's
/// route signature, mints the receipt nonce, and builds the completion
/// message. Stateless; the caller tracks the per-facility nonce pair.
pub struct ExchangeRegistrar {
    pub identity: Arc<LocalIdentity>,
    crypto: CryptoEngine,
}

impl ExchangeRegistrar {
    pub fn new(identity: Arc<LocalIdentity>, crypto: CryptoEngine) -> Self {
        Self { identity, crypto }
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.key_pair.public_key()
    }

    /// Verify the submitter controls the facility's claimed private key
    /// and answer with a fresh exchange nonce.
    pub fn handle_form(
        &self,
        form: &RegistrationFormData,
    ) -> Result<(RegistrationFormReceipt, [u8; 12])> {
        if form.route.exchange_uid != self.identity.uid {
            return Err(ExchangeError::Protocol(format!(
                "Form addressed to exchange {}, not {}",
                form.route.exchange_uid, self.identity.uid
            )));
        }

        let facility_key = PublicKey::from_hex(&form.facility_public_key)?;
        let facility_nonce = decode_nonce(&form.facility_nonce)?;
        let shared = self
            .crypto
            .derive_shared_secret(&self.identity.key_pair, &facility_key)?;
        let payload = registration_route_bytes(
            &self.identity.uid,
            &form.facility_uid,
            &form.facility_endpoint,
            &facility_nonce,
        );
        let signature = hex::decode(&form.route.signature).map_err(|_| ExchangeError::Security)?;
        let iv = decode_iv(&form.route.iv)?;
        self.crypto
            .validate_message_digest(&shared, &signature, &facility_key, &payload, &iv)?;

        let exchange_nonce = random_nonce();
        let receipt = RegistrationFormReceipt {
            exchange_nonce: hex::encode(exchange_nonce),
        };
        Ok((receipt, exchange_nonce))
    }

    /// Build the asynchronous completion message for a previously
    /// received form.
    pub fn build_completion(
        &self,
        facility_uid: &str,
        facility_endpoint: &str,
        facility_key: &PublicKey,
        facility_nonce: &[u8; 12],
        exchange_nonce: &[u8; 12],
        success: bool,
    ) -> Result<RegistrationCompletion> {
        let token = sha256(&registration_token_bytes(
            exchange_nonce,
            facility_nonce,
            &self.identity.uid,
            facility_uid,
            facility_endpoint,
        ));

        let shared = self
            .crypto
            .derive_shared_secret(&self.identity.key_pair, facility_key)?;
        let payload = registration_route_bytes(
            &self.identity.uid,
            facility_uid,
            facility_endpoint,
            facility_nonce,
        );
        let iv = random_iv();
        let signature =
            self.crypto
                .sign_and_encrypt_digest(&shared, &payload, &self.identity.key_pair, &iv)?;

        Ok(RegistrationCompletion {
            registration_token: hex::encode(token),
            route: RegistrationRoute {
                exchange_uid: self.identity.uid.clone(),
                facility_uid: facility_uid.to_string(),
                signature: hex::encode(signature),
                iv: hex::encode(iv),
            },
            success,
        })
    }
}
