//! Execution of accepted price-map offers.
//!
//! One timer per offer fires at the start date; the actual dispatch and
//! confirmation polling runs on a bounded worker pool. The
//! WAITING -> EXECUTING transition is an atomic compare-and-set in the
//! database, so a given offer id executes at most once even under
//! concurrent scheduler wake-ups. Terminal states are never retried
//! automatically; a new offer must be negotiated instead.

use crate::database::Database;
use crate::error::{ExchangeError, Result};
use crate::events::{EventBus, ProtocolEvent};
use crate::model::{OfferExecutionState, PriceMapOfferEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

/// Control instruction for the facility's resource, derived from the
/// offer's power components (e.g. "shed 5000 W of load").
#[derive(Debug, Clone, PartialEq)]
pub struct ControlInstruction {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub real_power: i64,
    pub reactive_power: i64,
    pub duration: chrono::Duration,
}

impl ControlInstruction {
    fn for_offer(event: &PriceMapOfferEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            offer_id: event.id,
            real_power: event.price_map.power.real_power,
            reactive_power: event.price_map.power.reactive_power,
            duration: event.price_map.duration,
        }
    }
}

/// External resource-control collaborator. Dispatch sends the
/// instruction; confirm reports whether the resource has acted on it
/// yet.
#[async_trait]
pub trait ResourceControl: Send + Sync {
    async fn dispatch(&self, instruction: &ControlInstruction) -> Result<()>;
    async fn confirm(&self, instruction_id: Uuid) -> Result<bool>;
}

/// Result of a [`OfferExecutionEngine::finish`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Finished(OfferExecutionState),
    /// The offer was already terminal; finishing it is a reported
    /// no-op, not an error.
    AlreadyTerminal(OfferExecutionState),
}

#[derive(Clone)]
pub struct OfferExecutionEngine {
    db: Database,
    bus: EventBus,
    control: Arc<dyn ResourceControl>,
    workers: Arc<Semaphore>,
    confirmation_timeout: StdDuration,
    poll_interval: StdDuration,
}

impl OfferExecutionEngine {
    pub fn new(
        db: Database,
        bus: EventBus,
        control: Arc<dyn ResourceControl>,
        max_workers: usize,
        confirmation_timeout: StdDuration,
        poll_interval: StdDuration,
    ) -> Self {
        Self {
            db,
            bus,
            control,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            confirmation_timeout,
            poll_interval,
        }
    }

    /// Arm one timer for an accepted offer. Execution errors are
    /// captured into the offer event; nothing escapes the task.
    pub fn schedule(&self, offer_id: Uuid, start_date: DateTime<Utc>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let wait = (start_date - Utc::now()).to_std().unwrap_or_default();
            if !wait.is_zero() {
                sleep(wait).await;
            }
            let _permit = match engine.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if let Err(e) = engine.execute_offer(offer_id).await {
                tracing::error!(offer = %offer_id, error = %e, "offer execution failed");
            }
        });
    }

    /// Re-arm timers for offers left waiting by a previous run.
    pub async fn recover(&self) -> Result<usize> {
        let waiting = self.db.list_waiting_offers().await?;
        let count = waiting.len();
        for (event, start_date) in waiting {
            self.schedule(event.id, start_date);
        }
        if count > 0 {
            tracing::info!(count, "re-armed waiting offers");
        }
        Ok(count)
    }

    /// Drive one offer from WAITING to a terminal state.
    pub async fn execute_offer(&self, offer_id: Uuid) -> Result<()> {
        let won = self
            .db
            .cas_execution_state(offer_id, OfferExecutionState::Waiting, OfferExecutionState::Executing)
            .await?;
        if !won {
            tracing::debug!(offer = %offer_id, "offer no longer waiting; skipping execution");
            return Ok(());
        }
        self.bus.publish(ProtocolEvent::ExecutionStateChanged {
            offer_id,
            state: OfferExecutionState::Executing,
        });

        let event = self
            .db
            .get_offer_event(offer_id)
            .await?
            .ok_or(ExchangeError::OfferNotFound(offer_id))?;
        let instruction = ControlInstruction::for_offer(&event);

        tracing::info!(
            offer = %offer_id,
            real_power = instruction.real_power,
            "dispatching control instruction"
        );
        if let Err(e) = self.control.dispatch(&instruction).await {
            return self
                .abort_from_executing(offer_id, &format!("Dispatch failed: {}", e))
                .await;
        }

        let deadline = Instant::now() + self.confirmation_timeout;
        loop {
            match self.control.confirm(instruction.id).await {
                Ok(true) => return self.complete(offer_id).await,
                Ok(false) => {}
                // Transient confirmation read failures count against the
                // same bounded wait.
                Err(e) => tracing::debug!(offer = %offer_id, error = %e, "confirmation poll failed"),
            }
            if Instant::now() + self.poll_interval > deadline {
                return self
                    .abort_from_executing(
                        offer_id,
                        &format!(
                            "No confirmation within {} s",
                            self.confirmation_timeout.as_secs()
                        ),
                    )
                    .await;
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn complete(&self, offer_id: Uuid) -> Result<()> {
        let moved = self
            .db
            .cas_finish(
                offer_id,
                OfferExecutionState::Executing,
                OfferExecutionState::Completed,
                true,
                None,
            )
            .await?;
        if moved {
            self.bus.publish(ProtocolEvent::ExecutionStateChanged {
                offer_id,
                state: OfferExecutionState::Completed,
            });
            tracing::info!(offer = %offer_id, "offer completed");
        }
        Ok(())
    }

    async fn abort_from_executing(&self, offer_id: Uuid, reason: &str) -> Result<()> {
        let moved = self
            .db
            .cas_finish(
                offer_id,
                OfferExecutionState::Executing,
                OfferExecutionState::Aborted,
                false,
                Some(reason),
            )
            .await?;
        if moved {
            self.bus.publish(ProtocolEvent::ExecutionStateChanged {
                offer_id,
                state: OfferExecutionState::Aborted,
            });
            tracing::warn!(offer = %offer_id, reason, "offer aborted");
        }
        Ok(())
    }

    /// Force an offer to a terminal state (operator override),
    /// bypassing EXECUTING. Only valid from WAITING or EXECUTING;
    /// finishing an already-terminal offer reports a no-op.
    pub async fn finish(
        &self,
        offer_id: Uuid,
        desired: OfferExecutionState,
    ) -> Result<FinishOutcome> {
        if !desired.is_terminal() {
            return Err(ExchangeError::Validation(format!(
                "finish requires a terminal state, got {}",
                desired.as_str()
            )));
        }

        let success = desired == OfferExecutionState::Completed;
        let message = if success {
            None
        } else {
            Some("Aborted by operator request")
        };

        for from in [OfferExecutionState::Waiting, OfferExecutionState::Executing] {
            if self
                .db
                .cas_finish(offer_id, from, desired, success, message)
                .await?
            {
                self.bus.publish(ProtocolEvent::ExecutionStateChanged {
                    offer_id,
                    state: desired,
                });
                return Ok(FinishOutcome::Finished(desired));
            }
        }

        let event = self
            .db
            .get_offer_event(offer_id)
            .await?
            .ok_or(ExchangeError::OfferNotFound(offer_id))?;
        if event.execution_state.is_terminal() {
            Ok(FinishOutcome::AlreadyTerminal(event.execution_state))
        } else {
            Err(ExchangeError::Protocol(format!(
                "Cannot finish offer {} from state {}",
                offer_id,
                event.execution_state.as_str()
            )))
        }
    }
}
