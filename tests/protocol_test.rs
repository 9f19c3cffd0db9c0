use chrono::{DateTime, Duration, Utc};
use grid_exchange::{
    codec::registration_route_bytes,
    crypto::{random_nonce, CryptoEngine, random_iv},
    database::Database,
    error::{ExchangeError, Result},
    events::{EventBus, ProtocolEvent},
    execution::{ControlInstruction, FinishOutcome, OfferExecutionEngine, ResourceControl},
    messages::{ExchangeInfo, RegistrationFormData, RegistrationRoute},
    model::{
        DurationRange, Money, OfferExecutionState, PowerComponents, PriceMap, PriceMapOfferEvent,
        PriceMapOffering, TrustedPeer,
    },
    negotiation::{ConstraintPolicy, NegotiationOutcome, NegotiationService, OfferingService},
    registration::{ExchangeRegistrar, LocalIdentity, RegistrationService},
    registry::RegistryClient,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use uuid::Uuid;

async fn test_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db_url = format!("sqlite://{}", temp_file.path().to_string_lossy());
    let database = Database::new(&db_url).await.unwrap();
    (database, temp_file)
}

fn facility_identity() -> Arc<LocalIdentity> {
    Arc::new(LocalIdentity {
        uid: "fac-1".to_string(),
        endpoint: "https://fac-1.example".to_string(),
        key_pair: grid_exchange::KeyPair::generate(),
    })
}

fn exchange_identity() -> Arc<LocalIdentity> {
    Arc::new(LocalIdentity {
        uid: "exch-1".to_string(),
        endpoint: "https://exch-1.example".to_string(),
        key_pair: grid_exchange::KeyPair::generate(),
    })
}

fn price_map(real_power: i64, price: &str) -> PriceMap {
    PriceMap::new(
        PowerComponents::new(real_power, 0),
        Duration::hours(1),
        DurationRange::new(Duration::seconds(5), Duration::seconds(60)),
        Money::parse("USD", price).unwrap(),
    )
}

/// Build the signed form the facility would POST, without the transport.
fn build_form(
    crypto: &CryptoEngine,
    facility: &LocalIdentity,
    exchange_uid: &str,
    exchange_key: &grid_exchange::PublicKey,
    facility_nonce: [u8; 12],
) -> RegistrationFormData {
    let shared = crypto
        .derive_shared_secret(&facility.key_pair, exchange_key)
        .unwrap();
    let payload = registration_route_bytes(
        exchange_uid,
        &facility.uid,
        &facility.endpoint,
        &facility_nonce,
    );
    let iv = random_iv();
    let signature = crypto
        .sign_and_encrypt_digest(&shared, &payload, &facility.key_pair, &iv)
        .unwrap();

    RegistrationFormData {
        facility_uid: facility.uid.clone(),
        facility_endpoint: facility.endpoint.clone(),
        facility_public_key: facility.key_pair.public_key().to_hex(),
        facility_nonce: hex::encode(facility_nonce),
        form_fields: Default::default(),
        route: RegistrationRoute {
            exchange_uid: exchange_uid.to_string(),
            facility_uid: facility.uid.clone(),
            signature: hex::encode(signature),
            iv: hex::encode(iv),
        },
    }
}

fn registration_service(
    identity: Arc<LocalIdentity>,
    db: Database,
    bus: EventBus,
) -> RegistrationService {
    RegistrationService::new(
        identity,
        CryptoEngine::new(),
        RegistryClient::new("http://localhost:1".to_string()),
        db,
        bus,
    )
}

#[tokio::test]
async fn registration_handshake_end_to_end() {
    let (db, _guard) = test_db().await;
    let crypto = CryptoEngine::new();
    let facility = facility_identity();
    let exchange = exchange_identity();
    let bus = EventBus::default();
    let mut events = bus.subscribe();

    let service = registration_service(facility.clone(), db.clone(), bus.clone());
    let registrar = ExchangeRegistrar::new(exchange.clone(), crypto.clone());

    // Facility submits the signed form; exchange verifies it and answers
    // with its own nonce.
    let facility_nonce = random_nonce();
    let form = build_form(
        &crypto,
        &facility,
        &exchange.uid,
        &registrar.public_key(),
        facility_nonce,
    );
    let (receipt, exchange_nonce) = registrar.handle_form(&form).unwrap();
    assert_eq!(hex::encode(exchange_nonce), receipt.exchange_nonce);

    let info = ExchangeInfo {
        uid: exchange.uid.clone(),
        endpoint: exchange.endpoint.clone(),
        name: "Test Exchange".to_string(),
    };
    service
        .record_receipt(&info, &registrar.public_key(), facility_nonce, exchange_nonce)
        .await
        .unwrap();
    assert!(db
        .get_registration_session(&exchange.uid)
        .await
        .unwrap()
        .is_some());

    // Exchange later sends the completion; token and route signature are
    // recomputed on the facility side before promotion.
    let completion = registrar
        .build_completion(
            &facility.uid,
            &facility.endpoint,
            &facility.key_pair.public_key(),
            &facility_nonce,
            &exchange_nonce,
            true,
        )
        .unwrap();
    let peer = service.complete_registration(&completion).await.unwrap();
    assert_eq!(peer.uid, exchange.uid);

    let stored = db.get_trusted_peer(&exchange.uid).await.unwrap().unwrap();
    assert_eq!(stored.public_key, registrar.public_key());
    assert!(db
        .get_registration_session(&exchange.uid)
        .await
        .unwrap()
        .is_none());

    assert!(matches!(
        events.try_recv(),
        Ok(ProtocolEvent::RegistrationCompleted { success: true, .. })
    ));

    // Replaying the same completion finds no open session.
    let replay = service.complete_registration(&completion).await;
    assert!(matches!(replay, Err(ExchangeError::SessionNotFound(_))));
}

#[tokio::test]
async fn bad_completion_token_preserves_session() {
    let (db, _guard) = test_db().await;
    let crypto = CryptoEngine::new();
    let facility = facility_identity();
    let exchange = exchange_identity();

    let service = registration_service(facility.clone(), db.clone(), EventBus::default());
    let registrar = ExchangeRegistrar::new(exchange.clone(), crypto.clone());

    let facility_nonce = random_nonce();
    let form = build_form(
        &crypto,
        &facility,
        &exchange.uid,
        &registrar.public_key(),
        facility_nonce,
    );
    let (_, exchange_nonce) = registrar.handle_form(&form).unwrap();
    let info = ExchangeInfo {
        uid: exchange.uid.clone(),
        endpoint: exchange.endpoint.clone(),
        name: "Test Exchange".to_string(),
    };
    service
        .record_receipt(&info, &registrar.public_key(), facility_nonce, exchange_nonce)
        .await
        .unwrap();

    let mut completion = registrar
        .build_completion(
            &facility.uid,
            &facility.endpoint,
            &facility.key_pair.public_key(),
            &facility_nonce,
            &exchange_nonce,
            true,
        )
        .unwrap();
    completion.registration_token = hex::encode([0u8; 32]);

    let result = service.complete_registration(&completion).await;
    assert!(matches!(result, Err(ExchangeError::Security)));

    // Session survives so the exchange can retry with a correct message.
    assert!(db
        .get_registration_session(&exchange.uid)
        .await
        .unwrap()
        .is_some());

    assert!(db.get_trusted_peer(&exchange.uid).await.unwrap().is_none());
}

#[tokio::test]
async fn tampered_form_signature_is_rejected() {
    let crypto = CryptoEngine::new();
    let facility = facility_identity();
    let exchange = exchange_identity();
    let registrar = ExchangeRegistrar::new(exchange.clone(), crypto.clone());

    let mut form = build_form(
        &crypto,
        &facility,
        &exchange.uid,
        &registrar.public_key(),
        random_nonce(),
    );
    // Claim a different endpoint than the one covered by the signature.
    form.facility_endpoint = "https://attacker.example".to_string();

    assert!(matches!(
        registrar.handle_form(&form),
        Err(ExchangeError::Security)
    ));
}

#[tokio::test]
async fn expired_sessions_are_swept() {
    let (db, _guard) = test_db().await;
    let facility = facility_identity();
    let service = registration_service(facility, db.clone(), EventBus::default());

    let exchange_key = grid_exchange::KeyPair::generate().public_key();
    let session = grid_exchange::model::RegistrationSession {
        exchange_uid: "stale-exchange".to_string(),
        exchange_endpoint: "https://stale.example".to_string(),
        exchange_public_key: exchange_key,
        facility_nonce: random_nonce(),
        exchange_nonce: random_nonce(),
        created_at: Utc::now() - Duration::hours(48),
    };
    db.create_registration_session(&session).await.unwrap();

    let removed = service
        .sweep_expired_sessions(Duration::hours(24))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(db
        .get_registration_session("stale-exchange")
        .await
        .unwrap()
        .is_none());
}

/// Both sides of a negotiation, wired without transport: the exchange
/// database trusts the facility and vice versa.
struct NegotiationFixture {
    facility_service: NegotiationService,
    offering_service: OfferingService,
    facility_db: Database,
    facility_peer: TrustedPeer,
    _guards: (NamedTempFile, NamedTempFile),
}

async fn negotiation_fixture(policy: ConstraintPolicy) -> NegotiationFixture {
    let (facility_db, fac_guard) = test_db().await;
    let (exchange_db, exch_guard) = test_db().await;
    let crypto = CryptoEngine::new();
    let facility = facility_identity();
    let exchange = exchange_identity();

    let exchange_peer = TrustedPeer {
        uid: exchange.uid.clone(),
        endpoint: exchange.endpoint.clone(),
        public_key: exchange.key_pair.public_key(),
        created_at: Utc::now(),
    };
    facility_db.upsert_trusted_peer(&exchange_peer).await.unwrap();

    let facility_peer = TrustedPeer {
        uid: facility.uid.clone(),
        endpoint: facility.endpoint.clone(),
        public_key: facility.key_pair.public_key(),
        created_at: Utc::now(),
    };
    exchange_db.upsert_trusted_peer(&facility_peer).await.unwrap();

    NegotiationFixture {
        facility_service: NegotiationService::new(
            facility.clone(),
            crypto.clone(),
            facility_db.clone(),
            EventBus::default(),
            policy,
        ),
        offering_service: OfferingService::new(exchange, crypto, exchange_db),
        facility_db,
        facility_peer,
        _guards: (fac_guard, exch_guard),
    }
}

#[tokio::test]
async fn offer_accepted_as_is() {
    let fixture = negotiation_fixture(ConstraintPolicy {
        max_power: 10_000,
        min_price: Money::parse("USD", "0.05").unwrap(),
    })
    .await;

    let offering = fixture
        .offering_service
        .create_offering(price_map(-5_000, "0.25"), Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    let offer = fixture
        .offering_service
        .build_offer(&offering, &fixture.facility_peer)
        .unwrap();

    let response = fixture.facility_service.receive_offer(&offer).await.unwrap();
    assert!(response.accepted);

    let outcome = fixture
        .offering_service
        .handle_response(&response, &fixture.facility_peer)
        .await
        .unwrap();
    assert_eq!(outcome, NegotiationOutcome::AcceptedAsIs);

    let event = fixture
        .facility_db
        .get_offer_event(offer.offer_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!event.is_counter_offer(&offering));
    assert_eq!(event.execution_state, OfferExecutionState::Waiting);
}

#[tokio::test]
async fn cheap_offer_is_countered() {
    let fixture = negotiation_fixture(ConstraintPolicy {
        max_power: 10_000,
        min_price: Money::parse("USD", "0.20").unwrap(),
    })
    .await;

    let offering = fixture
        .offering_service
        .create_offering(price_map(-5_000, "0.10"), Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    let offer = fixture
        .offering_service
        .build_offer(&offering, &fixture.facility_peer)
        .unwrap();

    let response = fixture.facility_service.receive_offer(&offer).await.unwrap();
    assert!(response.accepted);

    // The stored event carries the counter-proposed price map, and the
    // counter is distinguishable from acceptance purely by price-map
    // equality.
    let event = fixture
        .facility_db
        .get_offer_event(offer.offer_id)
        .await
        .unwrap()
        .unwrap();
    assert!(event.is_counter_offer(&offering));
    assert_eq!(event.price_map.price, Money::parse("USD", "0.20").unwrap());
    assert_eq!(event.price_map.power, offering.price_map.power);

    let outcome = fixture
        .offering_service
        .handle_response(&response, &fixture.facility_peer)
        .await
        .unwrap();
    match outcome {
        NegotiationOutcome::Countered(countered) => {
            assert_eq!(countered.price, Money::parse("USD", "0.20").unwrap());
        }
        other => panic!("expected counter, got {:?}", other),
    }
}

#[tokio::test]
async fn oversized_offer_is_declined() {
    let fixture = negotiation_fixture(ConstraintPolicy {
        max_power: 1_000,
        min_price: Money::parse("USD", "0.05").unwrap(),
    })
    .await;

    let offering = fixture
        .offering_service
        .create_offering(price_map(-5_000, "0.25"), Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    let offer = fixture
        .offering_service
        .build_offer(&offering, &fixture.facility_peer)
        .unwrap();

    let response = fixture.facility_service.receive_offer(&offer).await.unwrap();
    assert!(!response.accepted);
    assert!(response.message.is_some());

    let outcome = fixture
        .offering_service
        .handle_response(&response, &fixture.facility_peer)
        .await
        .unwrap();
    assert!(matches!(outcome, NegotiationOutcome::Declined(Some(_))));

    let event = fixture
        .facility_db
        .get_offer_event(offer.offer_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.execution_state, OfferExecutionState::Unknown);
}

#[tokio::test]
async fn response_for_unknown_offering_is_rejected() {
    let fixture = negotiation_fixture(ConstraintPolicy {
        max_power: 10_000,
        min_price: Money::parse("USD", "0.05").unwrap(),
    })
    .await;

    let offering = fixture
        .offering_service
        .create_offering(price_map(-5_000, "0.25"), Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    let offer = fixture
        .offering_service
        .build_offer(&offering, &fixture.facility_peer)
        .unwrap();
    let mut response = fixture.facility_service.receive_offer(&offer).await.unwrap();
    response.offer_id = Uuid::new_v4();

    let result = fixture
        .offering_service
        .handle_response(&response, &fixture.facility_peer)
        .await;
    assert!(matches!(result, Err(ExchangeError::Protocol(_))));
}

// ---- execution ----

mockall::mock! {
    Control {}

    #[async_trait::async_trait]
    impl ResourceControl for Control {
        async fn dispatch(&self, instruction: &ControlInstruction) -> Result<()>;
        async fn confirm(&self, instruction_id: Uuid) -> Result<bool>;
    }
}

struct CountingControl {
    dispatches: AtomicUsize,
    confirmations_until_true: usize,
    confirms: AtomicUsize,
}

impl CountingControl {
    fn confirming() -> Self {
        Self {
            dispatches: AtomicUsize::new(0),
            confirmations_until_true: 1,
            confirms: AtomicUsize::new(0),
        }
    }

    fn never_confirming() -> Self {
        Self {
            dispatches: AtomicUsize::new(0),
            confirmations_until_true: usize::MAX,
            confirms: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ResourceControl for CountingControl {
    async fn dispatch(&self, _instruction: &ControlInstruction) -> Result<()> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn confirm(&self, _instruction_id: Uuid) -> Result<bool> {
        let seen = self.confirms.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(seen >= self.confirmations_until_true)
    }
}

async fn waiting_offer(db: &Database, start_date: DateTime<Utc>) -> Uuid {
    let offering = PriceMapOffering::new(price_map(-5_000, "0.25"), start_date);
    db.create_offering(&offering).await.unwrap();

    let mut event =
        PriceMapOfferEvent::new(offering.id, offering.id, offering.price_map.clone());
    event.accepted = true;
    event.transition_to(OfferExecutionState::Waiting).unwrap();
    db.create_offer_event(&event).await.unwrap();
    offering.id
}

fn engine(db: Database, bus: EventBus, control: Arc<dyn ResourceControl>) -> OfferExecutionEngine {
    OfferExecutionEngine::new(
        db,
        bus,
        control,
        2,
        std::time::Duration::from_millis(100),
        std::time::Duration::from_millis(10),
    )
}

#[tokio::test]
async fn successful_execution_completes_offer() {
    let (db, _guard) = test_db().await;
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let offer_id = waiting_offer(&db, Utc::now()).await;

    let control = Arc::new(CountingControl::confirming());
    engine(db.clone(), bus, control.clone())
        .execute_offer(offer_id)
        .await
        .unwrap();

    let event = db.get_offer_event(offer_id).await.unwrap().unwrap();
    assert_eq!(event.execution_state, OfferExecutionState::Completed);
    assert!(event.completed_successfully);
    assert_eq!(control.dispatches.load(Ordering::SeqCst), 1);

    assert!(matches!(
        events.try_recv(),
        Ok(ProtocolEvent::ExecutionStateChanged {
            state: OfferExecutionState::Executing,
            ..
        })
    ));
    assert!(matches!(
        events.try_recv(),
        Ok(ProtocolEvent::ExecutionStateChanged {
            state: OfferExecutionState::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn failed_dispatch_aborts_offer() {
    let (db, _guard) = test_db().await;
    let offer_id = waiting_offer(&db, Utc::now()).await;

    let mut control = MockControl::new();
    control.expect_dispatch().times(1).returning(|_| {
        Err(ExchangeError::Execution(
            "resource controller unreachable".to_string(),
        ))
    });
    control.expect_confirm().never();

    engine(db.clone(), EventBus::default(), Arc::new(control))
        .execute_offer(offer_id)
        .await
        .unwrap();

    let event = db.get_offer_event(offer_id).await.unwrap().unwrap();
    assert_eq!(event.execution_state, OfferExecutionState::Aborted);
    assert!(!event.completed_successfully);
    let message = event.message.unwrap();
    assert!(message.contains("resource controller unreachable"));
}

#[tokio::test]
async fn confirmation_timeout_aborts_offer() {
    let (db, _guard) = test_db().await;
    let offer_id = waiting_offer(&db, Utc::now()).await;

    let control = Arc::new(CountingControl::never_confirming());
    engine(db.clone(), EventBus::default(), control.clone())
        .execute_offer(offer_id)
        .await
        .unwrap();

    let event = db.get_offer_event(offer_id).await.unwrap().unwrap();
    assert_eq!(event.execution_state, OfferExecutionState::Aborted);
    assert!(event.message.unwrap().contains("No confirmation"));
    // It kept polling within the bound, never re-dispatched.
    assert_eq!(control.dispatches.load(Ordering::SeqCst), 1);
    assert!(control.confirms.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn repeated_confirmation_errors_abort_within_the_bound() {
    let (db, _guard) = test_db().await;
    let offer_id = waiting_offer(&db, Utc::now()).await;

    // Confirmation reads fail every time; the errors are transient and
    // must neither escape nor extend the bounded wait.
    let mut control = MockControl::new();
    control.expect_dispatch().times(1).returning(|_| Ok(()));
    control.expect_confirm().times(2..).returning(|_| {
        Err(ExchangeError::Execution(
            "controller status read failed".to_string(),
        ))
    });

    OfferExecutionEngine::new(
        db.clone(),
        EventBus::default(),
        Arc::new(control),
        2,
        std::time::Duration::from_millis(50),
        std::time::Duration::from_millis(10),
    )
    .execute_offer(offer_id)
    .await
    .unwrap();

    let event = db.get_offer_event(offer_id).await.unwrap().unwrap();
    assert_eq!(event.execution_state, OfferExecutionState::Aborted);
    assert!(!event.completed_successfully);
    assert!(!event.message.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_wakeups_execute_at_most_once() {
    let (db, _guard) = test_db().await;
    let offer_id = waiting_offer(&db, Utc::now()).await;

    let control = Arc::new(CountingControl::confirming());
    let engine = engine(db.clone(), EventBus::default(), control.clone());

    let (a, b) = tokio::join!(engine.execute_offer(offer_id), engine.execute_offer(offer_id));
    a.unwrap();
    b.unwrap();

    assert_eq!(control.dispatches.load(Ordering::SeqCst), 1);
    let event = db.get_offer_event(offer_id).await.unwrap().unwrap();
    assert_eq!(event.execution_state, OfferExecutionState::Completed);
}

#[tokio::test]
async fn finish_forces_terminal_state_and_is_noop_when_terminal() {
    let (db, _guard) = test_db().await;
    let offer_id = waiting_offer(&db, Utc::now() + Duration::hours(1)).await;

    let engine = engine(
        db.clone(),
        EventBus::default(),
        Arc::new(CountingControl::confirming()),
    );

    let outcome = engine
        .finish(offer_id, OfferExecutionState::Aborted)
        .await
        .unwrap();
    assert_eq!(outcome, FinishOutcome::Finished(OfferExecutionState::Aborted));

    let event = db.get_offer_event(offer_id).await.unwrap().unwrap();
    assert_eq!(event.execution_state, OfferExecutionState::Aborted);

    // Finishing a terminal offer is a reported no-op, not an error.
    let outcome = engine
        .finish(offer_id, OfferExecutionState::Completed)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        FinishOutcome::AlreadyTerminal(OfferExecutionState::Aborted)
    );
    let event = db.get_offer_event(offer_id).await.unwrap().unwrap();
    assert_eq!(event.execution_state, OfferExecutionState::Aborted);

    // A non-terminal target is invalid.
    assert!(engine
        .finish(offer_id, OfferExecutionState::Executing)
        .await
        .is_err());
}

#[tokio::test]
async fn stale_offer_update_detects_version_conflict() {
    let (db, _guard) = test_db().await;
    let offer_id = waiting_offer(&db, Utc::now()).await;

    let fresh = db.get_offer_event(offer_id).await.unwrap().unwrap();
    let stale = fresh.clone();

    let mut first = fresh;
    first.message = Some("updated by scheduler".to_string());
    db.update_offer_event(&first).await.unwrap();

    let mut second = stale;
    second.message = Some("updated by event handler".to_string());
    let result = db.update_offer_event(&second).await;
    assert!(matches!(
        result,
        Err(ExchangeError::VersionConflict { .. })
    ));
}
