//! Assembles the final [`ClassificationResult`] list: echoes the originating
//! input, stamps the immutable catalog version, and guarantees a stable
//! field order for whatever serialization a collaborator performs.

use crate::conflict::Resolved;
use crate::format::ClassificationResult;

/// Turns reconciled per-pair results into the final, ordered result list.
/// Order follows `resolved`'s order, which in turn follows first appearance
/// of each `(specimen, organism, antibiotic)` group in the grouped inputs --
/// satisfying the "results emitted in order of the grouped inputs"
/// ordering guarantee.
pub fn assemble(resolved: Vec<Resolved>, catalog_version: &str) -> Vec<ClassificationResult> {
    resolved
        .into_iter()
        .map(|r| ClassificationResult {
            specimen: r.input.specimen.clone(),
            organism: r.input.organism.clone(),
            antibiotic: r.input.antibiotic.clone(),
            method: r.input.method,
            input: r.input,
            decision: r.decision,
            reason: r.reason,
            fired_rules: r.fired_rules,
            catalog_version: catalog_version.to_owned(),
        })
        .collect()
}
