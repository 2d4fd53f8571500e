//! Scripted transports and canned network assessments for orchestrator tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sluice_failover::{
    AdaptiveOrchestrator, NetworkAssessor, NetworkProfile, NetworkRestriction, NetworkType,
    OrchestratorConfig, StatusEvent, TransferLedger, TransferRecord,
};
use sluice_transport::{TransferMetadata, TransportConfig, TransportEndpoint, TransportError};
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
}

/// Config that classifies immediately on startup.
pub fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        initial_classification_delay: Duration::ZERO,
        ..OrchestratorConfig::default()
    }
}

pub fn meta() -> TransferMetadata {
    TransferMetadata::new("notes.txt.enc", 11, "c0ffee")
}

/// What a scripted endpoint does on its next call.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Ok,
    Fail(&'static str),
    /// Never completes.
    Hang,
    Panic,
}

/// Names of the transports called, in call order, shared across endpoints.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub struct ScriptedEndpoint {
    name: String,
    priority: i32,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    available: bool,
    hang_availability: bool,
    payload: Vec<u8>,
    log: CallLog,
    closed: Arc<AtomicBool>,
}

impl ScriptedEndpoint {
    pub fn new(name: &str, priority: i32, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            priority,
            script: Mutex::new(VecDeque::new()),
            fallback: Step::Ok,
            available: true,
            hang_availability: false,
            payload: b"scripted payload".to_vec(),
            log: Arc::clone(log),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Behavior once the script runs out.
    pub fn always(mut self, step: Step) -> Self {
        self.fallback = step;
        self
    }

    pub fn then(self, step: Step) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn slow_availability(mut self) -> Self {
        self.hang_availability = true;
        self
    }

    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    async fn run(&self) -> Result<Vec<u8>, TransportError> {
        self.log.lock().unwrap().push(self.name.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        match step {
            Step::Ok => Ok(self.payload.clone()),
            Step::Fail(text) => Err(TransportError::Other(format!("{}: {text}", self.name))),
            Step::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Step::Panic => panic!("scripted panic in {}", self.name),
        }
    }
}

#[async_trait::async_trait]
impl TransportEndpoint for ScriptedEndpoint {
    async fn setup(&mut self, _config: &TransportConfig) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&self, _payload: &[u8], _meta: &TransferMetadata) -> Result<(), TransportError> {
        self.run().await.map(|_| ())
    }

    async fn receive(&self, _meta: &TransferMetadata) -> Result<Vec<u8>, TransportError> {
        self.run().await
    }

    async fn is_available(&self) -> bool {
        if self.hang_availability {
            std::future::pending::<()>().await;
        }
        self.available
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Assessor returning a fixed profile.
pub struct StaticAssessor {
    profile: NetworkProfile,
    restrictions: Vec<NetworkRestriction>,
    quality: f64,
    hang: bool,
}

impl StaticAssessor {
    /// Unrestricted home network with good quality.
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            profile: open_profile(),
            restrictions: Vec::new(),
            quality: 9.0,
            hang: false,
        })
    }

    pub fn restrictive(restrictions: Vec<NetworkRestriction>) -> Arc<Self> {
        let mut profile = NetworkProfile::assumed_restrictive();
        profile.network_type = NetworkType::Corporate;
        Arc::new(Self {
            profile,
            restrictions,
            quality: 6.0,
            hang: false,
        })
    }

    /// Never finishes classifying.
    pub fn stuck() -> Arc<Self> {
        Arc::new(Self {
            profile: open_profile(),
            restrictions: Vec::new(),
            quality: 9.0,
            hang: true,
        })
    }
}

fn open_profile() -> NetworkProfile {
    NetworkProfile {
        is_restrictive: false,
        restrictiveness: 0.0,
        available_ports: vec![80, 443, 9009],
        supports_udp: true,
        preferred_transport: None,
        network_type: NetworkType::Home,
        ..NetworkProfile::assumed_restrictive()
    }
}

#[async_trait::async_trait]
impl NetworkAssessor for StaticAssessor {
    async fn classify(&self) -> (NetworkProfile, Vec<NetworkRestriction>) {
        if self.hang {
            std::future::pending::<()>().await;
        }
        (self.profile.clone(), self.restrictions.clone())
    }

    async fn quality_score(&self) -> f64 {
        self.quality
    }
}

/// Ledger keeping every record in memory, optionally failing each write.
#[derive(Default)]
pub struct MemoryLedger {
    pub records: Mutex<Vec<TransferRecord>>,
    pub fail: bool,
}

#[async_trait::async_trait]
impl TransferLedger for MemoryLedger {
    async fn record(&self, record: TransferRecord) -> Result<(), String> {
        self.records.lock().unwrap().push(record);
        if self.fail {
            Err("ledger database is read-only".to_string())
        } else {
            Ok(())
        }
    }
}

pub async fn orchestrator(
    config: OrchestratorConfig,
    endpoints: Vec<ScriptedEndpoint>,
    assessor: Arc<dyn NetworkAssessor>,
) -> anyhow::Result<AdaptiveOrchestrator> {
    let mut builder = AdaptiveOrchestrator::builder(config).assessor(assessor);
    for endpoint in endpoints {
        builder = builder.transport(endpoint);
    }
    Ok(builder.build().await?)
}

pub fn status_channel() -> (mpsc::Sender<StatusEvent>, mpsc::Receiver<StatusEvent>) {
    mpsc::channel(256)
}

/// Wait for the first event matching `pred`.
pub async fn wait_event(
    rx: &mut mpsc::Receiver<StatusEvent>,
    pred: impl Fn(&StatusEvent) -> bool,
) -> StatusEvent {
    loop {
        let event = rx.recv().await.expect("status channel closed");
        if pred(&event) {
            return event;
        }
    }
}

pub fn drain(rx: &mut mpsc::Receiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
