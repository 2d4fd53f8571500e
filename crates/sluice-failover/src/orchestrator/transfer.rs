//! The failover loop of a single transfer.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use sluice_transport::{now_ms, TransferMetadata, TransportError};

use super::{AdaptiveOrchestrator, Registered};
use crate::backoff::attempt_timeout;
use crate::classify::{is_transient_error, ErrorClassification};
use crate::error::FailoverError;
use crate::events::{
    Direction, Outcome, SkipReason, StatusEvent, TransferOutcome, TransferRecord,
};
use crate::scoring::{rank, RankEntry, TransportScore};
use crate::ErrorCategory;

/// What each attempt asks of the endpoint.
#[derive(Debug, Clone)]
pub(super) enum Operation {
    Send(Bytes),
    Receive,
}

enum Attempt {
    Done(Option<Vec<u8>>),
    Failed(String),
    Cancelled,
}

/// Publishes the transfer's cancel token for [`AdaptiveOrchestrator::cancel`]
/// and withdraws it when the transfer ends.
struct ActiveTransfer<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl<'a> ActiveTransfer<'a> {
    fn install(slot: &'a Mutex<Option<CancellationToken>>, token: CancellationToken) -> Self {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        Self { slot }
    }
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Snapshot of the state a transfer plans with.
struct Plan {
    order: Vec<usize>,
    restrictive: bool,
    quality: f64,
}

impl AdaptiveOrchestrator {
    pub(super) async fn run_transfer(
        &self,
        direction: Direction,
        operation: Operation,
        meta: &TransferMetadata,
    ) -> Result<(Option<Vec<u8>>, TransferOutcome), FailoverError> {
        self.ensure_open()?;
        if self.transports.is_empty() {
            return Err(FailoverError::NoTransports);
        }
        let _running = self
            .active
            .try_lock()
            .map_err(|_| FailoverError::AlreadyInProgress)?;
        let cancel = self.shutdown.child_token();
        let _published = ActiveTransfer::install(&self.current, cancel.clone());

        let result = self.failover(direction, &operation, meta, &cancel).await;
        if matches!(result, Err(FailoverError::Cancelled)) {
            tracing::info!("transfer {}: cancelled", meta.transfer_id);
            self.shared.emit(StatusEvent::Cancelled {
                transfer_id: meta.transfer_id.clone(),
            });
        }
        result
    }

    async fn failover(
        &self,
        direction: Direction,
        operation: &Operation,
        meta: &TransferMetadata,
        cancel: &CancellationToken,
    ) -> Result<(Option<Vec<u8>>, TransferOutcome), FailoverError> {
        let started = Instant::now();
        let id = meta.transfer_id.as_str();

        if !self.await_first_classification(cancel).await {
            return Err(FailoverError::Cancelled);
        }
        let plan = self.plan().await;
        let bytes = match operation {
            Operation::Send(payload) => payload.len() as u64,
            Operation::Receive => meta.size,
        };

        let mut attempts: u32 = 0;
        let mut failures: u32 = 0;
        let mut backoff: Option<Duration> = None;
        let mut last: Option<(ErrorClassification, String)> = None;

        for (position, &index) in plan.order.iter().enumerate() {
            let transport = &self.transports[index];
            if cancel.is_cancelled() {
                return Err(FailoverError::Cancelled);
            }
            if self.cooling_down(&transport.name).await {
                // One exemption per transport per session, spent at the top of the ranking
                if position == 0 && self.claim_cooldown_exemption(&transport.name).await {
                    tracing::debug!(
                        "transfer {id}: {} is cooling down but top-ranked, trying anyway",
                        transport.name
                    );
                } else {
                    self.skip(id, transport, SkipReason::CoolingDown);
                    continue;
                }
            }
            match self.check_available(transport, cancel).await {
                None => return Err(FailoverError::Cancelled),
                Some(false) => {
                    self.skip(id, transport, SkipReason::Unavailable);
                    continue;
                }
                Some(true) => {}
            }

            let mut tries: u32 = 0;
            loop {
                if let Some(delay) = backoff.take() {
                    tracing::debug!("transfer {id}: backing off {delay:?}");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FailoverError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                let limit = attempt_timeout(self.config.attempt_timeout, attempts, plan.quality);
                attempts += 1;
                tries += 1;
                self.shared.emit(StatusEvent::AttemptStarted {
                    transfer_id: id.to_string(),
                    transport: transport.name.clone(),
                    attempt: attempts,
                });
                tracing::debug!(
                    "transfer {id}: attempt {attempts} via {} (timeout {limit:?})",
                    transport.name
                );

                let attempt_started = Instant::now();
                let result = self.attempt(transport, operation, meta, limit, cancel).await;
                let elapsed = attempt_started.elapsed();

                match result {
                    Attempt::Cancelled => {
                        self.record(meta, direction, Outcome::Cancelled, transport, 0, elapsed, None);
                        return Err(FailoverError::Cancelled);
                    }
                    Attempt::Done(data) => {
                        self.shared
                            .state
                            .write()
                            .await
                            .record_success(&transport.name, elapsed);
                        self.record(meta, direction, Outcome::Success, transport, bytes, elapsed, None);
                        let outcome = TransferOutcome {
                            transfer_id: id.to_string(),
                            transport: transport.name.clone(),
                            attempts,
                            elapsed: started.elapsed(),
                        };
                        self.shared.emit(StatusEvent::Succeeded {
                            transfer_id: id.to_string(),
                            transport: transport.name.clone(),
                            attempts,
                            elapsed: outcome.elapsed,
                        });
                        tracing::info!(
                            "transfer {id}: {direction:?} via {} after {attempts} attempt(s)",
                            transport.name
                        );
                        return Ok((data, outcome));
                    }
                    Attempt::Failed(error) => {
                        let classification = self.classifier.classify(&error);
                        let category = classification.category;
                        self.shared.state.write().await.record_failure(
                            &transport.name,
                            category,
                            Instant::now(),
                        );
                        self.record(meta, direction, Outcome::Failure, transport, 0, elapsed, Some(category));
                        self.shared.emit(StatusEvent::AttemptFailed {
                            transfer_id: id.to_string(),
                            transport: transport.name.clone(),
                            category,
                            error: error.clone(),
                        });
                        tracing::warn!("transfer {id}: {} failed ({category}): {error}", transport.name);

                        backoff = Some(self.backoff_delay(failures, &classification, plan.restrictive));
                        failures += 1;
                        let retry = is_transient_error(category)
                            && tries < classification.retry.max_attempts;
                        last = Some((classification, error));
                        if !retry {
                            break;
                        }
                    }
                }
            }
        }

        self.shared.emit(StatusEvent::Exhausted {
            transfer_id: id.to_string(),
            attempts,
        });
        tracing::warn!("transfer {id}: all transports exhausted after {attempts} attempt(s)");
        Err(self.exhausted(attempts, last).await)
    }

    /// Wait until the background classifier has produced a profile, bounded
    /// by `first_classification_wait`. Returns false if cancelled.
    async fn await_first_classification(&self, cancel: &CancellationToken) -> bool {
        let mut classified = self.shared.subscribe_classified();
        if *classified.borrow() {
            return true;
        }
        let wait = tokio::time::timeout(
            self.config.first_classification_wait,
            classified.wait_for(|done| *done),
        );
        tokio::select! {
            _ = cancel.cancelled() => false,
            waited = wait => {
                if waited.is_err() {
                    tracing::info!("network not classified yet, assuming a restrictive network");
                }
                true
            }
        }
    }

    async fn plan(&self) -> Plan {
        let state = self.shared.state.read().await;
        let profile = state.effective_profile();
        let fresh = TransportScore::new("");
        let entries: Vec<RankEntry<'_>> = self
            .transports
            .iter()
            .map(|t| RankEntry {
                name: &t.name,
                priority: t.priority,
                reliability: self
                    .strategy
                    .reliability(state.scores.get(&t.name).unwrap_or(&fresh)),
            })
            .collect();
        let preferred = if profile.is_restrictive {
            profile.preferred_transport.as_deref()
        } else {
            None
        };
        Plan {
            order: rank(&entries, preferred),
            restrictive: profile.is_restrictive,
            quality: state.quality.unwrap_or(0.0),
        }
    }

    async fn cooling_down(&self, name: &str) -> bool {
        self.shared
            .state
            .read()
            .await
            .is_cooling_down(name, Instant::now(), self.config.cooldown)
    }

    async fn claim_cooldown_exemption(&self, name: &str) -> bool {
        self.shared.state.write().await.claim_cooldown_exemption(name)
    }

    /// `None` when cancelled. A check that panics or times out counts as
    /// unavailable.
    async fn check_available(
        &self,
        transport: &Registered,
        cancel: &CancellationToken,
    ) -> Option<bool> {
        let endpoint = Arc::clone(&transport.endpoint);
        let check = tokio::spawn(async move { endpoint.is_available().await });
        let abort = check.abort_handle();
        let bounded = tokio::time::timeout(self.config.availability_timeout, check);
        tokio::select! {
            _ = cancel.cancelled() => {
                abort.abort();
                None
            }
            checked = bounded => match checked {
                Ok(Ok(available)) => Some(available),
                Ok(Err(e)) => {
                    tracing::warn!("{}: availability check failed: {e}", transport.name);
                    Some(false)
                }
                Err(_) => {
                    abort.abort();
                    tracing::debug!("{}: availability check timed out", transport.name);
                    Some(false)
                }
            }
        }
    }

    /// Run one send/receive in its own task so a panicking endpoint becomes
    /// an ordinary failure.
    async fn attempt(
        &self,
        transport: &Registered,
        operation: &Operation,
        meta: &TransferMetadata,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Attempt {
        let endpoint = Arc::clone(&transport.endpoint);
        let operation = operation.clone();
        let meta = meta.clone();
        let task = tokio::spawn(async move {
            match operation {
                Operation::Send(payload) => endpoint.send(&payload, &meta).await.map(|()| None),
                Operation::Receive => endpoint.receive(&meta).await.map(Some),
            }
        });
        let abort = task.abort_handle();
        let bounded = tokio::time::timeout(limit, task);

        tokio::select! {
            _ = cancel.cancelled() => {
                abort.abort();
                Attempt::Cancelled
            }
            joined = bounded => match joined {
                Ok(Ok(Ok(data))) => Attempt::Done(data),
                Ok(Ok(Err(e))) => Attempt::Failed(e.to_string()),
                Ok(Err(e)) if e.is_panic() => {
                    Attempt::Failed(format!("{}: transport task panicked", transport.name))
                }
                Ok(Err(e)) => Attempt::Failed(format!("{}: transport task failed: {e}", transport.name)),
                Err(_) => {
                    abort.abort();
                    Attempt::Failed(TransportError::timeout(&transport.name, limit).to_string())
                }
            }
        }
    }

    fn skip(&self, id: &str, transport: &Registered, reason: SkipReason) {
        tracing::debug!("transfer {id}: skipping {} ({reason:?})", transport.name);
        self.shared.emit(StatusEvent::TransportSkipped {
            transfer_id: id.to_string(),
            transport: transport.name.clone(),
            reason,
        });
    }

    /// Policy backoff for the `n`th failure, never shorter than the
    /// classification's own retry delay.
    fn backoff_delay(
        &self,
        n: u32,
        classification: &ErrorClassification,
        restrictive: bool,
    ) -> Duration {
        let policy = &self.config.backoff;
        policy
            .delay(n, classification.category, restrictive)
            .max(classification.retry.initial_delay)
            .min(policy.max)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        meta: &TransferMetadata,
        direction: Direction,
        outcome: Outcome,
        transport: &Registered,
        bytes: u64,
        duration: Duration,
        category: Option<ErrorCategory>,
    ) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let record = TransferRecord {
            transfer_id: meta.transfer_id.clone(),
            direction,
            outcome,
            transport: transport.name.clone(),
            bytes,
            duration,
            category,
            timestamp: now_ms(),
        };
        let ledger = Arc::clone(ledger);
        tokio::spawn(async move {
            if let Err(e) = ledger.record(record).await {
                tracing::warn!("ledger: failed to record attempt: {e}");
            }
        });
    }

    async fn exhausted(
        &self,
        attempts: u32,
        last: Option<(ErrorClassification, String)>,
    ) -> FailoverError {
        let restrictions = self.shared.state.read().await.restrictions.clone();
        match last {
            Some((classification, error)) => FailoverError::Exhausted {
                attempts: attempts as usize,
                category: classification.category,
                suggested_transports: classification.suggested_transports,
                user_action: classification.user_action,
                last_error: error,
                restrictions,
            },
            None => {
                let fallback = self.classifier.classify("");
                FailoverError::Exhausted {
                    attempts: attempts as usize,
                    category: ErrorCategory::Unknown,
                    suggested_transports: fallback.suggested_transports,
                    user_action: fallback.user_action,
                    last_error: "no transport was available".to_string(),
                    restrictions,
                }
            }
        }
    }
}
