//! The facade tying every pipeline stage together: Rule Catalog Store,
//! Terminology Normalizer, Input Adapters, Input Grouper, Gating Validator,
//! Expert-Rule Engine, Breakpoint Interpreter, Conflict Resolver, and
//! Decision Assembler, in that fixed order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::instrument;

use crate::adapters::{self, InputFormat};
use crate::audit::{AuditSink, ClassificationAuditRecord, NullAuditSink};
use crate::catalog::CatalogStore;
use crate::conflict::{self, Classified};
use crate::correlation::CorrelationId;
use crate::errors::AdapterError;
use crate::format::{BreakpointSource, ClassificationInput, ClassificationResult, Decision};
use crate::gating;
use crate::grouper;
use crate::rules;
use crate::terminology::{TerminologyNormalizer, TerminologyOracle, TerminologyQuery};

/// Knobs that don't belong to the catalog itself (source preference is a
/// per-request override; cache/timeout sizing is process-wide).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub oracle_timeout: Duration,
    pub normalization_cache_capacity: usize,
    pub preferred_source: Option<BreakpointSource>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            oracle_timeout: Duration::from_secs(2),
            normalization_cache_capacity: 4096,
            preferred_source: None,
        }
    }
}

/// The entry point a transport collaborator drives. Owns the live catalog
/// snapshot, the terminology normalizer's cache, and the configured audit
/// sink; everything else is functions over owned values. All classification
/// methods are `async` -- the only suspension points are the terminology
/// oracle (§4.2) and spawning the fire-and-forget audit emission.
pub struct ClassificationEngine {
    catalog: Arc<CatalogStore>,
    normalizer: TerminologyNormalizer,
    audit_sink: Arc<dyn AuditSink>,
    config: EngineConfig,
}

impl ClassificationEngine {
    pub fn new(catalog: Arc<CatalogStore>, oracle: Arc<dyn TerminologyOracle>, audit_sink: Arc<dyn AuditSink>, config: EngineConfig) -> Self {
        let normalizer = TerminologyNormalizer::new(oracle, config.oracle_timeout, config.normalization_cache_capacity);
        ClassificationEngine {
            catalog,
            normalizer,
            audit_sink,
            config,
        }
    }

    /// An offline engine with no oracle and a discarding audit sink, useful
    /// for the `rules dry-run` CLI path and for tests.
    pub fn offline(catalog: Arc<CatalogStore>) -> Self {
        ClassificationEngine {
            normalizer: TerminologyNormalizer::offline(4096),
            catalog,
            audit_sink: Arc::new(NullAuditSink),
            config: EngineConfig::default(),
        }
    }

    pub async fn classify_native(&self, payload: &str, correlation_id: CorrelationId) -> Result<Vec<ClassificationResult>, AdapterError> {
        self.run(adapters::native::parse(payload)?, correlation_id).await
    }

    pub async fn classify_fhir(&self, payload: &str, correlation_id: CorrelationId) -> Result<Vec<ClassificationResult>, AdapterError> {
        self.run(adapters::fhir::parse(payload)?, correlation_id).await
    }

    pub async fn classify_hl7v2(&self, payload: &str, correlation_id: CorrelationId) -> Result<Vec<ClassificationResult>, AdapterError> {
        self.run(adapters::hl7v2::parse(payload)?, correlation_id).await
    }

    /// Auto-detects the payload's format (spec.md §6.1) and dispatches to
    /// the matching adapter.
    pub async fn classify_auto(&self, payload: &[u8], correlation_id: CorrelationId) -> Result<Vec<ClassificationResult>, AdapterError> {
        let text = std::str::from_utf8(payload).map_err(|_| AdapterError::MalformedSegment("payload is not valid UTF-8".to_owned()))?;
        match adapters::detect_format(payload) {
            InputFormat::Fhir => self.classify_fhir(text, correlation_id).await,
            InputFormat::Hl7v2 => self.classify_hl7v2(text, correlation_id).await,
            InputFormat::Native => self.classify_native(text, correlation_id).await,
        }
    }

    #[instrument(skip(self, inputs), fields(correlation_id = %correlation_id, input_count = inputs.len()))]
    async fn run(&self, inputs: Vec<ClassificationInput>, correlation_id: CorrelationId) -> Result<Vec<ClassificationResult>, AdapterError> {
        let catalog = self.catalog.current();

        let normalized = self.normalize_all(inputs).await;
        let grouped = grouper::group(normalized);

        let mut classified = Vec::with_capacity(grouped.len());
        for input in grouped {
            classified.push(self.classify_one(&catalog, input));
        }

        let resolved = conflict::resolve(classified, &catalog);
        let results = crate::assembler::assemble(resolved, &catalog.version_label);

        for result in &results {
            let record = ClassificationAuditRecord::from_result(result, correlation_id.clone(), Utc::now());
            self.emit_audit(record);
        }

        Ok(results)
    }

    async fn normalize_all(&self, inputs: Vec<ClassificationInput>) -> Vec<ClassificationInput> {
        let mut out = Vec::with_capacity(inputs.len());
        for mut input in inputs {
            if let Some(organism) = &input.organism {
                if !organism.is_unresolved() {
                    input.organism = Some(self.normalizer.normalize_organism(&TerminologyQuery::display(organism.as_str())).await);
                }
            }
            if let Some(antibiotic) = &input.antibiotic {
                if !antibiotic.is_unresolved() {
                    input.antibiotic = Some(self.normalizer.normalize_antibiotic(&TerminologyQuery::display(antibiotic.as_str())).await);
                }
            }
            out.push(input);
        }
        out
    }

    fn classify_one(&self, catalog: &crate::format::RuleCatalog, input: ClassificationInput) -> Classified {
        if let Some(gate) = gating::evaluate(&input) {
            let reason = if gate.all_fired.len() > 1 {
                format!("{} (also: {})", gate.primary, gate.all_fired[1..].join(", "))
            } else {
                gate.primary.clone()
            };
            return Classified {
                input,
                decision: Decision::RequiresReview,
                reason,
                fired_rules: Vec::new(),
                is_override: false,
            };
        }

        match rules::evaluate(catalog, &input) {
            Ok(Some(firing)) => {
                return Classified {
                    input,
                    decision: firing.decision,
                    reason: firing.reason,
                    fired_rules: firing.fired_rules,
                    is_override: true,
                };
            }
            Ok(None) => {}
            Err(err) => {
                return Classified {
                    input,
                    decision: Decision::RequiresReview,
                    reason: err.to_string(),
                    fired_rules: Vec::new(),
                    is_override: false,
                };
            }
        }

        let outcome = crate::breakpoints::interpret(catalog, &input, self.config.preferred_source);
        Classified {
            input,
            decision: outcome.decision,
            reason: outcome.reason,
            fired_rules: Vec::new(),
            is_override: false,
        }
    }

    /// Emits one audit record without making the caller wait for the sink.
    /// Spawns onto the ambient runtime when one is running; falls back to
    /// inline delivery for callers (like the dry-run CLI) that invoke the
    /// engine outside any executor.
    fn emit_audit(&self, record: ClassificationAuditRecord) {
        let sink = Arc::clone(&self.audit_sink);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { sink.emit(record).await });
            }
            Err(_) => {
                tokio::runtime::Builder::new_current_thread()
                    .build()
                    .expect("failed to build fallback runtime for audit emission")
                    .block_on(sink.emit(record));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{AntibioticKey, BreakpointEntry, Comparison, MethodKind, OrganismScope, RuleCatalog, Unit};

    fn catalog_with_amoxicillin() -> RuleCatalog {
        RuleCatalog {
            version_label: "TEST-1".to_owned(),
            breakpoints: vec![BreakpointEntry {
                organism_scope: OrganismScope::Any,
                antibiotic: AntibioticKey::new("Amoxicillin"),
                method: MethodKind::Mic,
                source: BreakpointSource::Eucast,
                version_label: "TEST-1".to_owned(),
                s_threshold: Some(8.0),
                i_threshold: None,
                r_threshold: Some(8.0),
                comparator: Comparison::LeSGeR,
                unit: Unit::MgPerL,
                rare_resistance: None,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn classifies_native_mic_as_susceptible() {
        let store = Arc::new(CatalogStore::from_catalog(catalog_with_amoxicillin()));
        let engine = ClassificationEngine::offline(store);
        let payload = r#"{
            "specimen": "S1",
            "organism": "Escherichia coli",
            "antibiotic": "Amoxicillin",
            "method": "MIC",
            "value": {"kind": "Mic", "value": 4.0}
        }"#;
        let results = engine.classify_native(payload, CorrelationId::new("corr-1")).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].decision, Decision::Susceptible);
        assert_eq!(results[0].catalog_version, "TEST-1");
    }

    #[tokio::test]
    async fn unresolved_organism_requires_review() {
        let store = Arc::new(CatalogStore::from_catalog(catalog_with_amoxicillin()));
        let engine = ClassificationEngine::offline(store);
        let payload = r#"{
            "specimen": "S1",
            "organism": "Xyzbacter novus",
            "antibiotic": "Amoxicillin",
            "method": "MIC",
            "value": {"kind": "Mic", "value": 4.0}
        }"#;
        let results = engine.classify_native(payload, CorrelationId::new("corr-2")).await.unwrap();
        assert_eq!(results[0].decision, Decision::RequiresReview);
        assert_eq!(results[0].reason, "organism not recognized");
    }

    #[tokio::test]
    async fn auto_detects_native_json() {
        let store = Arc::new(CatalogStore::from_catalog(catalog_with_amoxicillin()));
        let engine = ClassificationEngine::offline(store);
        let payload = br#"{"specimen":"S1","organism":"Escherichia coli","antibiotic":"Amoxicillin","method":"MIC","value":{"kind":"Mic","value":4.0}}"#;
        let results = engine.classify_auto(payload, CorrelationId::new("corr-3")).await.unwrap();
        assert_eq!(results[0].decision, Decision::Susceptible);
    }
}
