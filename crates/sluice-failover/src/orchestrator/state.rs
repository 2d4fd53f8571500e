//! Mutable engine state shared by transfers, status queries and the
//! background classifier.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::Instant;

use crate::events::StatusEvent;
use crate::network::{NetworkAssessor, NetworkProfile, NetworkRestriction};
use crate::scoring::TransportScore;
use crate::ErrorCategory;

/// Everything behind the engine's single read/write lock.
#[derive(Debug, Default)]
pub(crate) struct EngineState {
    pub profile: Option<NetworkProfile>,
    pub restrictions: Vec<NetworkRestriction>,
    /// 0–10 network quality from the last classification.
    pub quality: Option<f64>,
    pub last_classified: Option<Instant>,
    pub scores: HashMap<String, TransportScore>,
    /// Transport name → instant of its last failure.
    pub cooldowns: HashMap<String, Instant>,
    /// Transports that already bypassed their cooldown this session.
    pub exempted: HashSet<String>,
}

impl EngineState {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>, restored: Vec<TransportScore>) -> Self {
        let mut scores: HashMap<String, TransportScore> = restored
            .into_iter()
            .map(|score| (score.name.clone(), score))
            .collect();
        for name in names {
            scores
                .entry(name.to_string())
                .or_insert_with(|| TransportScore::new(name));
        }
        Self {
            scores,
            ..Self::default()
        }
    }

    /// True while `now` is inside the cooldown window of the last failure.
    pub fn is_cooling_down(&self, name: &str, now: Instant, cooldown: Duration) -> bool {
        self.cooldowns
            .get(name)
            .is_some_and(|failed_at| now < *failed_at + cooldown)
    }

    pub fn record_success(&mut self, name: &str, latency: Duration) {
        self.score_mut(name).record_success(latency);
        self.cooldowns.remove(name);
    }

    /// Spend `name`'s single cooldown bypass. False once it has been used.
    pub fn claim_cooldown_exemption(&mut self, name: &str) -> bool {
        self.exempted.insert(name.to_string())
    }

    pub fn record_failure(&mut self, name: &str, category: ErrorCategory, now: Instant) {
        self.score_mut(name).record_failure(category);
        self.cooldowns.insert(name.to_string(), now);
    }

    fn score_mut(&mut self, name: &str) -> &mut TransportScore {
        self.scores
            .entry(name.to_string())
            .or_insert_with(|| TransportScore::new(name))
    }

    pub fn classification_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_classified
            .map_or(true, |last| now.saturating_duration_since(last) >= interval)
    }

    /// Profile in effect, or the conservative stand-in before the first run.
    pub fn effective_profile(&self) -> NetworkProfile {
        self.profile
            .clone()
            .unwrap_or_else(NetworkProfile::assumed_restrictive)
    }
}

/// State plus the collaborators the background task needs.
pub(crate) struct Shared {
    pub state: RwLock<EngineState>,
    pub assessor: Arc<dyn NetworkAssessor>,
    events: Option<mpsc::Sender<StatusEvent>>,
    /// Flips to `true` once the first classification has landed.
    classified: watch::Sender<bool>,
    classify_lock: Mutex<()>,
}

impl Shared {
    pub fn new(
        state: EngineState,
        assessor: Arc<dyn NetworkAssessor>,
        events: Option<mpsc::Sender<StatusEvent>>,
    ) -> Self {
        let (classified, _) = watch::channel(false);
        Self {
            state: RwLock::new(state),
            assessor,
            events,
            classified,
            classify_lock: Mutex::new(()),
        }
    }

    /// Best-effort event delivery; a full or closed sink drops the event.
    pub fn emit(&self, event: StatusEvent) {
        if let Some(tx) = &self.events {
            if let Err(e) = tx.try_send(event) {
                tracing::debug!("status sink dropped event: {e}");
            }
        }
    }

    pub fn subscribe_classified(&self) -> watch::Receiver<bool> {
        self.classified.subscribe()
    }

    /// Run one classification cycle and swap its result in.
    ///
    /// Probing happens outside the state lock; the write lock is only held
    /// to replace the profile, restrictions and quality together.
    pub async fn classify_now(&self) -> NetworkProfile {
        let _running = self.classify_lock.lock().await;
        let ((profile, restrictions), quality) =
            tokio::join!(self.assessor.classify(), self.assessor.quality_score());
        let quality = if quality.is_finite() {
            quality.clamp(0.0, 10.0)
        } else {
            0.0
        };

        let event = StatusEvent::ClassificationComplete {
            network_type: profile.network_type,
            restrictive: profile.is_restrictive,
            restrictions: restrictions.len(),
        };
        {
            let mut state = self.state.write().await;
            state.profile = Some(profile.clone());
            state.restrictions = restrictions;
            state.quality = Some(quality);
            state.last_classified = Some(Instant::now());
        }
        self.classified.send_replace(true);
        self.emit(event);
        tracing::info!(
            "classification complete: {} network, restrictive: {}, quality {quality:.1}",
            profile.network_type,
            profile.is_restrictive
        );
        profile
    }
}
