use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::Parser;
use grid_exchange::{
    config::AppConfig,
    crypto::{load_or_create_key_pair, CryptoEngine, PublicKey},
    database::Database,
    messages::{
        PriceMapDto, PriceMapOfferResponse, PublicKeyResponse, RegistrationFormData,
        RegistrationFormReceipt,
    },
    model::TrustedPeer,
    negotiation::{NegotiationOutcome, OfferingService},
    registration::{ExchangeRegistrar, LocalIdentity},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(name = "exchange")]
#[command(about = "Exchange daemon: registration handling and offering fan-out")]
struct Args {
    #[arg(short, long, default_value = "exchange.toml")]
    config: PathBuf,
}

/// A form we have acknowledged but not yet completed.
#[derive(Clone)]
struct PendingRegistration {
    facility_uid: String,
    facility_endpoint: String,
    facility_key: PublicKey,
    facility_nonce: [u8; 12],
    exchange_nonce: [u8; 12],
}

#[derive(Clone)]
struct AppState {
    registrar: Arc<ExchangeRegistrar>,
    offerings: OfferingService,
    db: Database,
    pending: Arc<Mutex<HashMap<String, PendingRegistration>>>,
    client: reqwest::Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        AppConfig::load_with_env_overrides(&args.config)?
    } else {
        AppConfig::default()
    };
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .init();

    let key_pair = load_or_create_key_pair(config.identity.key_store_path.as_ref())?;
    let identity = Arc::new(LocalIdentity {
        uid: config.identity.uid.clone(),
        endpoint: config.identity.endpoint.clone(),
        key_pair,
    });

    let db = Database::new(&config.database.url).await?;
    let crypto = CryptoEngine::new();
    let registrar = Arc::new(ExchangeRegistrar::new(identity.clone(), crypto.clone()));
    let offerings = OfferingService::new(identity.clone(), crypto, db.clone());

    let state = AppState {
        registrar,
        offerings,
        db,
        pending: Arc::new(Mutex::new(HashMap::new())),
        client: reqwest::Client::new(),
    };

    let app = Router::new()
        .route("/pubkey", get(public_key))
        .route("/register", post(handle_register))
        .route("/registrations/:facility_uid/complete", post(send_completion))
        .route("/offerings", post(create_offering))
        .route("/health", get(health_check))
        .with_state(state);

    let listener = TcpListener::bind(config.server_address()).await?;
    tracing::info!(address = %config.server_address(), uid = %identity.uid, "exchange daemon listening");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn public_key(State(state): State<AppState>) -> Json<PublicKeyResponse> {
    Json(PublicKeyResponse {
        algorithm: "EC".to_string(),
        encoding: "sec1-compressed-hex".to_string(),
        key: state.registrar.public_key().to_hex(),
    })
}

async fn handle_register(
    State(state): State<AppState>,
    Json(form): Json<RegistrationFormData>,
) -> Result<Json<RegistrationFormReceipt>, StatusCode> {
    let (receipt, exchange_nonce) = match state.registrar.handle_form(&form) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!("Registration form rejected: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let facility_key = match PublicKey::from_hex(&form.facility_public_key) {
        Ok(key) => key,
        Err(_) => return Err(StatusCode::BAD_REQUEST),
    };
    let facility_nonce = match grid_exchange::messages::decode_nonce(&form.facility_nonce) {
        Ok(nonce) => nonce,
        Err(_) => return Err(StatusCode::BAD_REQUEST),
    };

    state.pending.lock().await.insert(
        form.facility_uid.clone(),
        PendingRegistration {
            facility_uid: form.facility_uid.clone(),
            facility_endpoint: form.facility_endpoint.clone(),
            facility_key,
            facility_nonce,
            exchange_nonce,
        },
    );

    tracing::info!(facility = %form.facility_uid, "registration form accepted");
    Ok(Json(receipt))
}

/// Send the asynchronous completion for a previously acknowledged form.
/// Normally driven by the exchange's own approval workflow; exposed as
/// an endpoint so an operator can trigger it.
async fn send_completion(
    State(state): State<AppState>,
    Path(facility_uid): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let pending = {
        let mut map = state.pending.lock().await;
        map.remove(&facility_uid).ok_or(StatusCode::NOT_FOUND)?
    };

    let completion = state
        .registrar
        .build_completion(
            &pending.facility_uid,
            &pending.facility_endpoint,
            &pending.facility_key,
            &pending.facility_nonce,
            &pending.exchange_nonce,
            true,
        )
        .map_err(|e| {
            tracing::error!("Failed to build completion: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let response = state
        .client
        .post(format!(
            "{}/registration/complete",
            pending.facility_endpoint
        ))
        .json(&completion)
        .send()
        .await
        .map_err(|e| {
            tracing::error!("Failed to deliver completion: {}", e);
            StatusCode::BAD_GATEWAY
        })?;

    if !response.status().is_success() {
        return Err(StatusCode::BAD_GATEWAY);
    }

    let peer = TrustedPeer {
        uid: pending.facility_uid.clone(),
        endpoint: pending.facility_endpoint.clone(),
        public_key: pending.facility_key,
        created_at: Utc::now(),
    };
    state.db.upsert_trusted_peer(&peer).await.map_err(|e| {
        tracing::error!("Failed to record trusted peer: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    tracing::info!(facility = %facility_uid, "facility registered as trusted peer");
    Ok(Json(serde_json::json!({"facility": facility_uid, "completed": true})))
}

#[derive(Deserialize)]
struct CreateOfferingRequest {
    price_map: PriceMapDto,
    start_date: DateTime<Utc>,
    facility_uids: Vec<String>,
}

async fn create_offering(
    State(state): State<AppState>,
    Json(request): Json<CreateOfferingRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let price_map = request
        .price_map
        .into_model()
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let offering = state
        .offerings
        .create_offering(price_map, request.start_date)
        .await
        .map_err(|e| {
            tracing::error!("Failed to create offering: {}", e);
            StatusCode::BAD_REQUEST
        })?;

    let mut outcomes = Vec::new();
    for facility_uid in &request.facility_uids {
        let peer = match state.db.get_trusted_peer(facility_uid).await {
            Ok(Some(peer)) => peer,
            Ok(None) => {
                outcomes.push(serde_json::json!({
                    "facility": facility_uid,
                    "error": "not a trusted peer",
                }));
                continue;
            }
            Err(e) => {
                tracing::error!("Peer lookup failed: {}", e);
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let offer = match state.offerings.build_offer(&offering, &peer) {
            Ok(offer) => offer,
            Err(e) => {
                tracing::error!(facility = %facility_uid, "Failed to build offer: {}", e);
                continue;
            }
        };

        let reply = state
            .client
            .post(format!("{}/offer", peer.endpoint))
            .json(&offer)
            .send()
            .await;

        match reply {
            Ok(response) if response.status().is_success() => {
                match response.json::<PriceMapOfferResponse>().await {
                    Ok(offer_response) => {
                        match state.offerings.handle_response(&offer_response, &peer).await {
                            Ok(outcome) => outcomes.push(serde_json::json!({
                                "facility": facility_uid,
                                "outcome": describe_outcome(&outcome),
                            })),
                            Err(e) => outcomes.push(serde_json::json!({
                                "facility": facility_uid,
                                "error": e.to_string(),
                            })),
                        }
                    }
                    Err(e) => outcomes.push(serde_json::json!({
                        "facility": facility_uid,
                        "error": e.to_string(),
                    })),
                }
            }
            Ok(response) => outcomes.push(serde_json::json!({
                "facility": facility_uid,
                "error": format!("facility returned {}", response.status()),
            })),
            Err(e) => outcomes.push(serde_json::json!({
                "facility": facility_uid,
                "error": e.to_string(),
            })),
        }
    }

    Ok(Json(serde_json::json!({
        "offering_id": offering.id,
        "results": outcomes,
    })))
}

fn describe_outcome(outcome: &NegotiationOutcome) -> String {
    match outcome {
        NegotiationOutcome::AcceptedAsIs => "accepted".to_string(),
        NegotiationOutcome::Countered(pm) => {
            format!("countered at {} {}", pm.price.as_f64(), pm.price.currency)
        }
        NegotiationOutcome::Declined(reason) => match reason {
            Some(reason) => format!("declined: {}", reason),
            None => "declined".to_string(),
        },
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}
