//! # grid-exchange
//!
//! Trust establishment and price-map negotiation between autonomous
//! energy-grid facilities and clearing exchanges over an untrusted
//! network.
//!
//! ## Architecture
//!
//! - **CryptoEngine**: P-256 key pairs, ECDH shared secrets, and the
//!   encrypted digest-signature envelope every protocol message uses
//! - **CanonicalEncoder**: deterministic fixed-layout byte encodings
//!   that signatures are computed over
//! - **RegistrationProtocol**: the facility/exchange handshake that
//!   turns a directory entry into a trusted peer
//! - **NegotiationProtocol**: signed price-map offers with
//!   accept/counter/decline replies
//! - **OfferExecutionEngine**: scheduled, at-most-once execution of
//!   accepted offers against the facility's resource

pub mod codec;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod events;
pub mod execution;
pub mod messages;
pub mod model;
pub mod negotiation;
pub mod registration;
pub mod registry;

pub use config::AppConfig;
pub use crypto::{CryptoEngine, KeyPair, PublicKey};
pub use database::Database;
pub use error::{ExchangeError, Result};
pub use events::{EventBus, ProtocolEvent};
pub use execution::{FinishOutcome, OfferExecutionEngine, ResourceControl};
pub use model::{
    Money, OfferExecutionState, PriceMap, PriceMapOfferEvent, PriceMapOffering, TrustedPeer,
};
pub use negotiation::{ConstraintPolicy, NegotiationService, OfferingService};
pub use registration::{ExchangeRegistrar, LocalIdentity, RegistrationService};
pub use registry::RegistryClient;
