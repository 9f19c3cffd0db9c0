use crate::crypto::PublicKey;
use crate::error::{ExchangeError, Result};
use crate::model::{
    DurationRange, Money, OfferExecutionState, PowerComponents, PriceMap, PriceMapOfferEvent,
    PriceMapOffering, RegistrationSession, TrustedPeer,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqliteRow, Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::from_str(database_url)
                .map_err(ExchangeError::Database)?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal),
        )
        .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trusted_peers (
                uid TEXT PRIMARY KEY,
                endpoint TEXT NOT NULL,
                public_key TEXT NOT NULL,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS registration_sessions (
                exchange_uid TEXT PRIMARY KEY,
                exchange_endpoint TEXT NOT NULL,
                exchange_public_key TEXT NOT NULL,
                facility_nonce TEXT NOT NULL,
                exchange_nonce TEXT NOT NULL,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS offerings (
                id TEXT PRIMARY KEY,
                real_power INTEGER NOT NULL,
                reactive_power INTEGER NOT NULL,
                duration_seconds INTEGER NOT NULL,
                duration_nanos INTEGER NOT NULL,
                response_min_seconds INTEGER NOT NULL,
                response_min_nanos INTEGER NOT NULL,
                response_max_seconds INTEGER NOT NULL,
                response_max_nanos INTEGER NOT NULL,
                currency TEXT NOT NULL,
                price_units INTEGER NOT NULL,
                price_nanos INTEGER NOT NULL,
                start_date DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS offer_events (
                id TEXT PRIMARY KEY,
                offering_id TEXT NOT NULL,
                real_power INTEGER NOT NULL,
                reactive_power INTEGER NOT NULL,
                duration_seconds INTEGER NOT NULL,
                duration_nanos INTEGER NOT NULL,
                response_min_seconds INTEGER NOT NULL,
                response_min_nanos INTEGER NOT NULL,
                response_max_seconds INTEGER NOT NULL,
                response_max_nanos INTEGER NOT NULL,
                currency TEXT NOT NULL,
                price_units INTEGER NOT NULL,
                price_nanos INTEGER NOT NULL,
                accepted INTEGER NOT NULL DEFAULT 0,
                completed_successfully INTEGER NOT NULL DEFAULT 0,
                execution_state TEXT NOT NULL,
                message TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                FOREIGN KEY (offering_id) REFERENCES offerings(id)
            );

            CREATE INDEX IF NOT EXISTS idx_offer_events_state ON offer_events(execution_state);
            CREATE INDEX IF NOT EXISTS idx_offer_events_offering ON offer_events(offering_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_created ON registration_sessions(created_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- trusted peers ----

    /// Record a peer directly. The facility side goes through
    /// [`promote_session_to_peer`](Self::promote_session_to_peer); the
    /// exchange side records the facility here once the completion has
    /// been delivered.
    pub async fn upsert_trusted_peer(&self, peer: &TrustedPeer) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO trusted_peers (uid, endpoint, public_key, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&peer.uid)
        .bind(&peer.endpoint)
        .bind(peer.public_key.to_hex())
        .bind(peer.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_trusted_peer(&self, uid: &str) -> Result<Option<TrustedPeer>> {
        let row = sqlx::query(
            "SELECT uid, endpoint, public_key, created_at FROM trusted_peers WHERE uid = ?",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(TrustedPeer {
                uid: row.get(0),
                endpoint: row.get(1),
                public_key: PublicKey::from_hex(&row.get::<String, _>(2))?,
                created_at: row.get(3),
            })),
            None => Ok(None),
        }
    }

    pub async fn list_trusted_peers(&self) -> Result<Vec<TrustedPeer>> {
        let rows = sqlx::query(
            "SELECT uid, endpoint, public_key, created_at FROM trusted_peers ORDER BY uid",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut peers = Vec::with_capacity(rows.len());
        for row in rows {
            peers.push(TrustedPeer {
                uid: row.get(0),
                endpoint: row.get(1),
                public_key: PublicKey::from_hex(&row.get::<String, _>(2))?,
                created_at: row.get(3),
            });
        }
        Ok(peers)
    }

    // ---- registration sessions ----

    /// Persist a new session. The primary key enforces at most one
    /// in-flight handshake per exchange uid.
    pub async fn create_registration_session(&self, session: &RegistrationSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO registration_sessions
                (exchange_uid, exchange_endpoint, exchange_public_key, facility_nonce, exchange_nonce, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.exchange_uid)
        .bind(&session.exchange_endpoint)
        .bind(session.exchange_public_key.to_hex())
        .bind(hex::encode(session.facility_nonce))
        .bind(hex::encode(session.exchange_nonce))
        .bind(session.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => ExchangeError::Protocol(
                format!("Registration already in flight for exchange {}", session.exchange_uid),
            ),
            other => ExchangeError::Database(other),
        })?;

        Ok(())
    }

    pub async fn get_registration_session(
        &self,
        exchange_uid: &str,
    ) -> Result<Option<RegistrationSession>> {
        let row = sqlx::query(
            r#"
            SELECT exchange_uid, exchange_endpoint, exchange_public_key, facility_nonce, exchange_nonce, created_at
            FROM registration_sessions WHERE exchange_uid = ?
            "#,
        )
        .bind(exchange_uid)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(session_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_registration_session(&self, exchange_uid: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM registration_sessions WHERE exchange_uid = ?")
            .bind(exchange_uid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove abandoned sessions older than `ttl`. Returns the number
    /// removed.
    pub async fn delete_expired_sessions(&self, ttl: Duration) -> Result<u64> {
        let cutoff = Utc::now() - ttl;
        let result = sqlx::query("DELETE FROM registration_sessions WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Atomically replace a completed session with its trusted-peer
    /// record. A single transaction keeps the handshake's durable state
    /// change all-or-nothing.
    pub async fn promote_session_to_peer(
        &self,
        exchange_uid: &str,
        peer: &TrustedPeer,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM registration_sessions WHERE exchange_uid = ?")
            .bind(exchange_uid)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(ExchangeError::SessionNotFound(exchange_uid.to_string()));
        }

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO trusted_peers (uid, endpoint, public_key, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&peer.uid)
        .bind(&peer.endpoint)
        .bind(peer.public_key.to_hex())
        .bind(peer.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ---- offerings ----

    pub async fn create_offering(&self, offering: &PriceMapOffering) -> Result<()> {
        let pm = &offering.price_map;
        sqlx::query(
            r#"
            INSERT INTO offerings
                (id, real_power, reactive_power, duration_seconds, duration_nanos,
                 response_min_seconds, response_min_nanos, response_max_seconds, response_max_nanos,
                 currency, price_units, price_nanos, start_date)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(offering.id.to_string())
        .bind(pm.power.real_power)
        .bind(pm.power.reactive_power)
        .bind(duration_seconds(pm.duration))
        .bind(duration_nanos(pm.duration))
        .bind(duration_seconds(pm.response_time.min))
        .bind(duration_nanos(pm.response_time.min))
        .bind(duration_seconds(pm.response_time.max))
        .bind(duration_nanos(pm.response_time.max))
        .bind(&pm.price.currency)
        .bind(pm.price.units)
        .bind(pm.price.nanos)
        .bind(offering.start_date)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_offering(&self, id: Uuid) -> Result<Option<PriceMapOffering>> {
        let row = sqlx::query("SELECT * FROM offerings WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(PriceMapOffering {
                id: Uuid::parse_str(&row.get::<String, _>("id"))?,
                price_map: price_map_from_row(&row)?,
                start_date: row.get("start_date"),
            })),
            None => Ok(None),
        }
    }

    // ---- offer events ----

    pub async fn create_offer_event(&self, event: &PriceMapOfferEvent) -> Result<()> {
        let pm = &event.price_map;
        sqlx::query(
            r#"
            INSERT INTO offer_events
                (id, offering_id, real_power, reactive_power, duration_seconds, duration_nanos,
                 response_min_seconds, response_min_nanos, response_max_seconds, response_max_nanos,
                 currency, price_units, price_nanos,
                 accepted, completed_successfully, execution_state, message, version, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.offering_id.to_string())
        .bind(pm.power.real_power)
        .bind(pm.power.reactive_power)
        .bind(duration_seconds(pm.duration))
        .bind(duration_nanos(pm.duration))
        .bind(duration_seconds(pm.response_time.min))
        .bind(duration_nanos(pm.response_time.min))
        .bind(duration_seconds(pm.response_time.max))
        .bind(duration_nanos(pm.response_time.max))
        .bind(&pm.price.currency)
        .bind(pm.price.units)
        .bind(pm.price.nanos)
        .bind(event.accepted)
        .bind(event.completed_successfully)
        .bind(event.execution_state.as_str())
        .bind(&event.message)
        .bind(event.version)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_offer_event(&self, id: Uuid) -> Result<Option<PriceMapOfferEvent>> {
        let row = sqlx::query("SELECT * FROM offer_events WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(offer_event_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Offers waiting for their start date, for re-arming timers after a
    /// restart.
    pub async fn list_waiting_offers(&self) -> Result<Vec<(PriceMapOfferEvent, DateTime<Utc>)>> {
        let rows = sqlx::query(
            r#"
            SELECT e.*, o.start_date AS offering_start_date
            FROM offer_events e JOIN offerings o ON o.id = e.offering_id
            WHERE e.execution_state = 'WAITING'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut offers = Vec::with_capacity(rows.len());
        for row in rows {
            let start: DateTime<Utc> = row.get("offering_start_date");
            offers.push((offer_event_from_row(&row)?, start));
        }
        Ok(offers)
    }

    /// Optimistic-concurrency update of the mutable offer-event fields.
    /// Fails with a version conflict if another writer got there first.
    pub async fn update_offer_event(&self, event: &PriceMapOfferEvent) -> Result<i64> {
        let result = sqlx::query(
            r#"
            UPDATE offer_events
            SET accepted = ?, completed_successfully = ?, execution_state = ?, message = ?,
                version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(event.accepted)
        .bind(event.completed_successfully)
        .bind(event.execution_state.as_str())
        .bind(&event.message)
        .bind(event.id.to_string())
        .bind(event.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ExchangeError::VersionConflict {
                entity: "offer_event",
                id: event.id,
            });
        }
        Ok(event.version + 1)
    }

    /// Atomic compare-and-set on the execution state. Returns false when
    /// another writer already moved the offer out of `from`. This is the
    /// guard that makes a given offer id execute at most once.
    pub async fn cas_execution_state(
        &self,
        id: Uuid,
        from: OfferExecutionState,
        to: OfferExecutionState,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE offer_events
            SET execution_state = ?, version = version + 1
            WHERE id = ? AND execution_state = ?
            "#,
        )
        .bind(to.as_str())
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Terminal transition carrying the outcome flag and message in the
    /// same atomic statement as the state check.
    pub async fn cas_finish(
        &self,
        id: Uuid,
        from: OfferExecutionState,
        to: OfferExecutionState,
        success: bool,
        message: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE offer_events
            SET execution_state = ?, completed_successfully = ?, message = ?, version = version + 1
            WHERE id = ? AND execution_state = ?
            "#,
        )
        .bind(to.as_str())
        .bind(success)
        .bind(message)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn duration_seconds(d: Duration) -> i64 {
    d.num_seconds()
}

fn duration_nanos(d: Duration) -> i32 {
    (d - Duration::seconds(d.num_seconds()))
        .num_nanoseconds()
        .unwrap_or(0) as i32
}

fn duration_from_parts(seconds: i64, nanos: i32) -> Duration {
    Duration::seconds(seconds) + Duration::nanoseconds(nanos as i64)
}

fn price_map_from_row(row: &SqliteRow) -> Result<PriceMap> {
    Ok(PriceMap {
        power: PowerComponents::new(row.get("real_power"), row.get("reactive_power")),
        duration: duration_from_parts(row.get("duration_seconds"), row.get("duration_nanos")),
        response_time: DurationRange::new(
            duration_from_parts(row.get("response_min_seconds"), row.get("response_min_nanos")),
            duration_from_parts(row.get("response_max_seconds"), row.get("response_max_nanos")),
        ),
        price: Money::new(
            row.get::<String, _>("currency"),
            row.get("price_units"),
            row.get("price_nanos"),
        )?,
    })
}

fn offer_event_from_row(row: &SqliteRow) -> Result<PriceMapOfferEvent> {
    Ok(PriceMapOfferEvent {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        offering_id: Uuid::parse_str(&row.get::<String, _>("offering_id"))?,
        price_map: price_map_from_row(row)?,
        accepted: row.get("accepted"),
        completed_successfully: row.get("completed_successfully"),
        execution_state: OfferExecutionState::from_str(&row.get::<String, _>("execution_state"))?,
        message: row.get("message"),
        version: row.get("version"),
        created_at: row.get("created_at"),
    })
}

fn session_from_row(row: &SqliteRow) -> Result<RegistrationSession> {
    let facility_nonce: [u8; 12] = hex::decode(row.get::<String, _>("facility_nonce"))
        .map_err(|e| ExchangeError::Validation(e.to_string()))?
        .try_into()
        .map_err(|_| ExchangeError::Validation("Stored nonce must be 12 bytes".to_string()))?;
    let exchange_nonce: [u8; 12] = hex::decode(row.get::<String, _>("exchange_nonce"))
        .map_err(|e| ExchangeError::Validation(e.to_string()))?
        .try_into()
        .map_err(|_| ExchangeError::Validation("Stored nonce must be 12 bytes".to_string()))?;

    Ok(RegistrationSession {
        exchange_uid: row.get("exchange_uid"),
        exchange_endpoint: row.get("exchange_endpoint"),
        exchange_public_key: PublicKey::from_hex(&row.get::<String, _>("exchange_public_key"))?,
        facility_nonce,
        exchange_nonce,
        created_at: row.get("created_at"),
    })
}
