//! The audit sink collaborator contract (spec §6.4): the core emits one
//! [`ClassificationAuditRecord`] per result and hands it to the sink, which
//! owns delivery, buffering, and failure handling. Emission is
//! fire-and-forget relative to the response path -- a sink failure never
//! affects the classification result returned to the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::correlation::CorrelationId;
use crate::format::{AntibioticKey, ClassificationResult, Decision, MethodKind, OrganismKey, SpecimenRef};

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ClassificationAuditRecord {
    #[serde(rename = "correlation-id")]
    pub correlation_id: CorrelationId,
    pub specimen: SpecimenRef,
    pub organism: Option<OrganismKey>,
    pub antibiotic: Option<AntibioticKey>,
    pub method: MethodKind,
    pub decision: Decision,
    #[serde(rename = "fired-rules")]
    pub fired_rules: Vec<String>,
    #[serde(rename = "catalog-version")]
    pub catalog_version: String,
    pub timestamp: DateTime<Utc>,
}

impl ClassificationAuditRecord {
    pub fn from_result(result: &ClassificationResult, correlation_id: CorrelationId, timestamp: DateTime<Utc>) -> Self {
        ClassificationAuditRecord {
            correlation_id,
            specimen: result.specimen.clone(),
            organism: result.organism.clone(),
            antibiotic: result.antibiotic.clone(),
            method: result.method,
            decision: result.decision,
            fired_rules: result.fired_rules.clone(),
            catalog_version: result.catalog_version.clone(),
            timestamp,
        }
    }
}

/// Narrow collaborator trait the engine depends on rather than a concrete
/// delivery mechanism (Kafka, a log file, an HTTP sink). Implementations own
/// their own buffering and retry policy.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, record: ClassificationAuditRecord);
}

/// Discards every record. Used when no audit sink is configured -- the core
/// never requires one to function (spec §1: audit streaming is an external
/// collaborator, not a core responsibility).
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn emit(&self, _record: ClassificationAuditRecord) {}
}

/// Logs records via `tracing` at debug level. Useful for local/dry-run
/// tooling where no real sink is wired up but silent discarding would hide
/// what the engine produced.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, record: ClassificationAuditRecord) {
        tracing::debug!(
            correlation_id = %record.correlation_id,
            specimen = %record.specimen,
            decision = %record.decision,
            "classification audit record"
        );
    }
}
