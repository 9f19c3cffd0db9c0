use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::Parser;
use grid_exchange::{
    config::AppConfig,
    crypto::{load_or_create_key_pair, CryptoEngine},
    database::Database,
    error::Result,
    events::EventBus,
    execution::{ControlInstruction, OfferExecutionEngine, ResourceControl},
    messages::{PriceMapOfferMsg, PriceMapOfferResponse, RegistrationCompletion},
    model::Money,
    negotiation::{ConstraintPolicy, NegotiationService},
    registration::{LocalIdentity, RegistrationService},
    registry::RegistryClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "facility")]
#[command(about = "Facility daemon: registration, offer negotiation, and execution")]
struct Args {
    #[arg(short, long, default_value = "facility.toml")]
    config: PathBuf,

    /// Largest real-power magnitude (W) this facility will commit.
    #[arg(long, default_value = "10000")]
    max_power: i64,

    /// Lowest acceptable apparent energy price, e.g. "0.20".
    #[arg(long, default_value = "0.20")]
    min_price: String,

    #[arg(long, default_value = "USD")]
    currency: String,
}

/// Placeholder resource control that acknowledges every instruction.
/// A production deployment points this at the real plant controller.
struct AcknowledgingResourceControl;

#[async_trait::async_trait]
impl ResourceControl for AcknowledgingResourceControl {
    async fn dispatch(&self, instruction: &ControlInstruction) -> Result<()> {
        tracing::info!(
            offer = %instruction.offer_id,
            real_power = instruction.real_power,
            "dispatching to resource controller"
        );
        Ok(())
    }

    async fn confirm(&self, _instruction_id: Uuid) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Clone)]
struct AppState {
    registration: RegistrationService,
    negotiation: NegotiationService,
    engine: OfferExecutionEngine,
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
    let bus = EventBus::default();
    let crypto = CryptoEngine::new();
    let registry = RegistryClient::new(config.registry.endpoint.clone());

    let policy = ConstraintPolicy {
        max_power: args.max_power,
        min_price: Money::parse(args.currency.clone(), &args.min_price)?,
    };

    let registration = RegistrationService::new(
        identity.clone(),
        crypto.clone(),
        registry,
        db.clone(),
        bus.clone(),
    );
    let negotiation = NegotiationService::new(
        identity.clone(),
        crypto.clone(),
        db.clone(),
        bus.clone(),
        policy,
    );
    let engine = OfferExecutionEngine::new(
        db.clone(),
        bus.clone(),
        Arc::new(AcknowledgingResourceControl),
        config.execution.max_workers.unwrap_or(4),
        config.confirmation_timeout(),
        config.poll_interval(),
    );

    engine.recover().await?;

    // Periodic garbage collection of abandoned registration sessions.
    let sweeper = registration.clone();
    let ttl = config.session_ttl();
    let sweep_every = std::time::Duration::from_secs(
        config.registration.sweep_interval_seconds.unwrap_or(3600),
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.sweep_expired_sessions(ttl).await {
                tracing::error!(error = %e, "session sweep failed");
            }
        }
    });

    let state = AppState {
        registration,
        negotiation,
        engine,
    };

    let app = Router::new()
        .route("/offer", post(receive_offer))
        .route("/registration/complete", post(complete_registration))
        .route("/offers/:offer_id/finish/:state", post(finish_offer))
        .route("/health", get(health_check))
        .with_state(state);

    let listener = TcpListener::bind(config.server_address()).await?;
    tracing::info!(address = %config.server_address(), uid = %identity.uid, "facility daemon listening");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn receive_offer(
    State(state): State<AppState>,
    Json(msg): Json<PriceMapOfferMsg>,
) -> std::result::Result<Json<PriceMapOfferResponse>, StatusCode> {
    match state.negotiation.receive_offer(&msg).await {
        Ok(response) => {
            if response.accepted {
                state.engine.schedule(response.offer_id, response.start_date);
            }
            Ok(Json(response))
        }
        Err(e) => {
            tracing::error!("Failed to handle offer: {}", e);
            Err(StatusCode::BAD_REQUEST)
        }
    }
}

async fn complete_registration(
    State(state): State<AppState>,
    Json(completion): Json<RegistrationCompletion>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    match state.registration.complete_registration(&completion).await {
        Ok(peer) => Ok(Json(serde_json::json!({
            "trusted_peer": peer.uid,
            "endpoint": peer.endpoint,
        }))),
        Err(e) => {
            tracing::error!("Failed to complete registration: {}", e);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn finish_offer(
    State(state): State<AppState>,
    axum::extract::Path((offer_id, desired)): axum::extract::Path<(Uuid, String)>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    let desired = grid_exchange::model::OfferExecutionState::from_str(&desired)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    match state.engine.finish(offer_id, desired).await {
        Ok(outcome) => Ok(Json(serde_json::json!({
            "offer_id": offer_id,
            "outcome": format!("{:?}", outcome),
        }))),
        Err(e) => {
            tracing::error!("Failed to finish offer: {}", e);
            Err(StatusCode::BAD_REQUEST)
        }
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}
