//! Registros de observabilidade e inicialização do `tracing`.
//!
//! Cada commit, sinalização de deadlock, rejeição de admissão e decisão de
//! despacho gera exatamente um [`TelemetryRecord`], entregue a um
//! [`TelemetrySink`]. O formato final (OTLP, Prometheus, logs) pertence ao
//! colaborador externo; aqui só existem o sink para `tracing` e um sink em
//! memória.

use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::deadlock::RepeatedPair;

/// Resultado de uma decisão do scheduler para uma tarefa.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DispatchDecision {
    Dispatched,
    Postponed { reason: String },
    Failed { reason: String },
}

/// Um registro de observabilidade.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Commit {
        project_id: String,
        from_state: String,
        to_state: String,
        score: f64,
    },
    DeadlockFlagged {
        project_id: String,
        pairs: Vec<RepeatedPair>,
    },
    AdmissionRejected {
        project_id: String,
        subject: String,
        reason: String,
    },
    Dispatch {
        project_id: String,
        task_id: String,
        est_tokens: u64,
        decision: DispatchDecision,
    },
}

impl TelemetryRecord {
    pub fn project_id(&self) -> &str {
        match self {
            TelemetryRecord::Commit { project_id, .. }
            | TelemetryRecord::DeadlockFlagged { project_id, .. }
            | TelemetryRecord::AdmissionRejected { project_id, .. }
            | TelemetryRecord::Dispatch { project_id, .. } => project_id,
        }
    }
}

/// Destino dos registros de observabilidade.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: TelemetryRecord);
}

/// Encaminha cada registro como um evento `tracing` com alvo `telemetry`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, record: TelemetryRecord) {
        let payload = serde_json::to_string(&record).unwrap_or_default();
        match &record {
            TelemetryRecord::DeadlockFlagged { .. } | TelemetryRecord::AdmissionRejected { .. } => {
                warn!(target: "telemetry", project_id = record.project_id(), %payload);
            }
            _ => info!(target: "telemetry", project_id = record.project_id(), %payload),
        }
    }
}

/// Guarda os registros em memória, para testes e para a superfície de leitura.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, record: TelemetryRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }
}

/// Instala o subscriber global do `tracing`.
///
/// A variável `ORCHESTRATOR_LOG` tem precedência sobre o filtro recebido.
/// Chamadas repetidas são ignoradas.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_env("ORCHESTRATOR_LOG")
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}
