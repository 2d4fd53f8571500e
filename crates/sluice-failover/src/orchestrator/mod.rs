//! Adaptive failover orchestrator.
//!
//! Owns the registered transports, the learned scores and the current
//! network profile. A transfer walks the transports in ranked order, retries
//! transient failures with backoff and reports one outcome. A background
//! task keeps the network profile fresh.
mod background;
mod state;
mod transfer;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use sluice_transport::{
    DirectTcpEndpoint, HttpsRelayEndpoint, IceEndpoint, TransferMetadata, TransportConfig,
    TransportEndpoint,
};

use crate::backoff::BackoffPolicy;
use crate::classify::ErrorClassifier;
use crate::error::FailoverError;
use crate::events::{Direction, StatusEvent, TransferLedger, TransferOutcome, TransportStatus};
use crate::network::{
    ClassifierConfig, NetworkAssessor, NetworkClassifier, NetworkProfile, NetworkRestriction,
};
use crate::scoring::{ScoringStrategy, TransportScore, WindowedReliability};

use self::background::Schedule;
use self::state::{EngineState, Shared};
use self::transfer::Operation;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for the failover orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Handed to every endpoint's `setup`.
    pub transport: TransportConfig,
    /// Used when no custom assessor is supplied.
    pub classifier: ClassifierConfig,
    /// How long a failed transport sits out of the ranking. A cooling-down
    /// transport that is ranked first is still tried, once per session.
    pub cooldown: Duration,
    /// Bound on each `is_available` check.
    pub availability_timeout: Duration,
    /// Base per-attempt timeout, scaled by attempt number and network quality.
    pub attempt_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// How long a transfer waits for the first classification before
    /// assuming a restrictive network.
    pub first_classification_wait: Duration,
    /// Delay before the first background classification.
    pub initial_classification_delay: Duration,
    /// Minimum age of a profile before it is re-classified.
    pub refresh_interval: Duration,
    /// How often the background task checks the profile age.
    pub refresh_check_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        let classifier = ClassifierConfig::for_transport(&transport);
        Self {
            transport,
            classifier,
            cooldown: Duration::from_secs(180),
            availability_timeout: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            first_classification_wait: Duration::from_secs(10),
            initial_classification_delay: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(120),
            refresh_check_interval: Duration::from_secs(30),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults with the transport section read from the environment.
    pub fn new() -> Self {
        let transport = TransportConfig::new();
        let classifier = ClassifierConfig::for_transport(&transport);
        Self {
            transport,
            classifier,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), FailoverError> {
        let positive = [
            ("availability_timeout", self.availability_timeout),
            ("attempt_timeout", self.attempt_timeout),
            ("refresh_check_interval", self.refresh_check_interval),
        ];
        for (field, value) in positive {
            if value.is_zero() {
                return Err(FailoverError::Config(format!("{field} must be positive")));
            }
        }
        if self.backoff.base > self.backoff.max {
            return Err(FailoverError::Config(
                "backoff base exceeds backoff max".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Builder ───────────────────────────────────────────────────────────

/// Assembles an [`AdaptiveOrchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    transports: Vec<Box<dyn TransportEndpoint>>,
    assessor: Option<Arc<dyn NetworkAssessor>>,
    strategy: Arc<dyn ScoringStrategy>,
    events: Option<mpsc::Sender<StatusEvent>>,
    ledger: Option<Arc<dyn TransferLedger>>,
    scores: Vec<TransportScore>,
}

impl OrchestratorBuilder {
    /// Register a transport. Names must be unique.
    pub fn transport<T: TransportEndpoint + 'static>(self, endpoint: T) -> Self {
        self.boxed_transport(Box::new(endpoint))
    }

    pub fn boxed_transport(mut self, endpoint: Box<dyn TransportEndpoint>) -> Self {
        self.transports.push(endpoint);
        self
    }

    /// Replace the built-in network classifier.
    pub fn assessor(mut self, assessor: Arc<dyn NetworkAssessor>) -> Self {
        self.assessor = Some(assessor);
        self
    }

    /// Scoring strategy; [`WindowedReliability`] by default.
    pub fn strategy<S: ScoringStrategy + 'static>(mut self, strategy: S) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    /// Receive [`StatusEvent`]s. Events are dropped when the channel is full.
    pub fn status_sink(mut self, tx: mpsc::Sender<StatusEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn TransferLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Start from previously learned scores (see [`AdaptiveOrchestrator::scores`]).
    pub fn scores(mut self, scores: Vec<TransportScore>) -> Self {
        self.scores = scores;
        self
    }

    /// Set up every transport and start background classification.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn build(self) -> Result<AdaptiveOrchestrator, FailoverError> {
        let Self {
            config,
            transports,
            assessor,
            strategy,
            events,
            ledger,
            scores,
        } = self;
        config.validate()?;

        let mut seen = HashSet::new();
        let mut registered = Vec::with_capacity(transports.len());
        for mut endpoint in transports {
            let name = endpoint.name().to_string();
            if !seen.insert(name.clone()) {
                return Err(FailoverError::Config(format!(
                    "duplicate transport name: {name}"
                )));
            }
            endpoint.setup(&config.transport).await?;
            let priority = endpoint.priority();
            tracing::debug!("registered transport {name} (priority {priority})");
            registered.push(Registered {
                endpoint: Arc::from(endpoint),
                name,
                priority,
            });
        }

        let assessor: Arc<dyn NetworkAssessor> = match assessor {
            Some(assessor) => assessor,
            None => Arc::new(NetworkClassifier::new(config.classifier.clone())?),
        };
        let state = EngineState::new(registered.iter().map(|t| t.name.as_str()), scores);
        let shared = Arc::new(Shared::new(state, assessor, events));

        let shutdown = CancellationToken::new();
        let schedule = Schedule {
            initial_delay: config.initial_classification_delay,
            check_interval: config.refresh_check_interval,
            refresh_interval: config.refresh_interval,
        };
        let background = tokio::spawn(background::run(
            Arc::clone(&shared),
            schedule,
            shutdown.clone(),
        ));

        Ok(AdaptiveOrchestrator {
            config,
            transports: registered,
            shared,
            strategy,
            classifier: ErrorClassifier::new(),
            ledger,
            active: tokio::sync::Mutex::new(()),
            current: std::sync::Mutex::new(None),
            shutdown,
            closed: AtomicBool::new(false),
            background: std::sync::Mutex::new(Some(background)),
        })
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────

struct Registered {
    endpoint: Arc<dyn TransportEndpoint>,
    name: String,
    priority: i32,
}

/// Moves opaque payloads over the best available transport.
///
/// One transfer runs at a time; a second concurrent call fails fast with
/// [`FailoverError::AlreadyInProgress`]. Dropping the orchestrator stops the
/// background classifier; call [`close`](Self::close) to also release the
/// transports.
pub struct AdaptiveOrchestrator {
    config: OrchestratorConfig,
    transports: Vec<Registered>,
    shared: Arc<Shared>,
    strategy: Arc<dyn ScoringStrategy>,
    classifier: ErrorClassifier,
    ledger: Option<Arc<dyn TransferLedger>>,
    active: tokio::sync::Mutex<()>,
    /// Cancellation handle of the running transfer, if any.
    current: std::sync::Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    background: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AdaptiveOrchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            transports: Vec::new(),
            assessor: None,
            strategy: Arc::new(WindowedReliability),
            events: None,
            ledger: None,
            scores: Vec::new(),
        }
    }

    /// Orchestrator over the three built-in transports.
    pub async fn with_default_transports(config: OrchestratorConfig) -> Result<Self, FailoverError> {
        Self::builder(config)
            .transport(DirectTcpEndpoint::new())
            .transport(IceEndpoint::new())
            .transport(HttpsRelayEndpoint::new())
            .build()
            .await
    }

    /// Deliver `payload` to the peer, failing over between transports.
    pub async fn send_with_failover(
        &self,
        payload: &[u8],
        meta: &TransferMetadata,
    ) -> Result<TransferOutcome, FailoverError> {
        let operation = Operation::Send(bytes::Bytes::copy_from_slice(payload));
        let (_, outcome) = self.run_transfer(Direction::Send, operation, meta).await?;
        Ok(outcome)
    }

    /// Fetch the payload described by `meta`, failing over between transports.
    pub async fn receive_with_failover(
        &self,
        meta: &TransferMetadata,
    ) -> Result<(Vec<u8>, TransferOutcome), FailoverError> {
        let (data, outcome) = self
            .run_transfer(Direction::Receive, Operation::Receive, meta)
            .await?;
        Ok((data.unwrap_or_default(), outcome))
    }

    /// Cancel the running transfer. Returns false when none is active.
    pub fn cancel(&self) -> bool {
        let slot = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_transfer_active(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Current profile, or the assumed-restrictive one before the first
    /// classification completes.
    pub async fn network_profile(&self) -> NetworkProfile {
        self.shared.state.read().await.effective_profile()
    }

    pub async fn restrictions(&self) -> Vec<NetworkRestriction> {
        self.shared.state.read().await.restrictions.clone()
    }

    /// Network quality on the 0–10 scale, if classified.
    pub async fn network_quality(&self) -> Option<f64> {
        self.shared.state.read().await.quality
    }

    /// Classify the network now instead of waiting for the background task.
    pub async fn refresh_network_profile(&self) -> Result<NetworkProfile, FailoverError> {
        self.ensure_open()?;
        Ok(self.shared.classify_now().await)
    }

    /// Status of every registered transport, keyed by name.
    pub async fn transport_status(&self) -> BTreeMap<String, TransportStatus> {
        let state = self.shared.state.read().await;
        let now = Instant::now();
        self.transports
            .iter()
            .map(|t| {
                let fresh;
                let score = match state.scores.get(&t.name) {
                    Some(score) => score,
                    None => {
                        fresh = TransportScore::new(&t.name);
                        &fresh
                    }
                };
                let status = TransportStatus {
                    name: t.name.clone(),
                    priority: t.priority,
                    success_rate: self.strategy.success_rate(score),
                    avg_latency: score.avg_latency(),
                    reliability: self.strategy.reliability(score),
                    attempts: score.attempts,
                    failures: score.failures,
                    cooling_down: state.is_cooling_down(&t.name, now, self.config.cooldown),
                    last_category: score.last_category,
                };
                (t.name.clone(), status)
            })
            .collect()
    }

    /// Learned scores, for persisting across sessions.
    pub async fn scores(&self) -> Vec<TransportScore> {
        let state = self.shared.state.read().await;
        self.transports
            .iter()
            .filter_map(|t| state.scores.get(&t.name).cloned())
            .collect()
    }

    /// Stop background work, cancel any transfer and close every transport.
    ///
    /// Idempotent. Later transfers fail with [`FailoverError::Closed`].
    pub async fn close(&self) -> Result<(), FailoverError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        let background = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = background {
            if let Err(e) = handle.await {
                tracing::debug!("background classification task ended abnormally: {e}");
            }
        }

        let mut first_error = None;
        for t in &self.transports {
            if let Err(e) = t.endpoint.close().await {
                tracing::warn!("{}: close failed: {e}", t.name);
                first_error.get_or_insert(e);
            }
        }
        tracing::info!("orchestrator closed");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<(), FailoverError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(FailoverError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for AdaptiveOrchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for AdaptiveOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveOrchestrator")
            .field(
                "transports",
                &self.transports.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            )
            .field("strategy", &self.strategy.name())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
