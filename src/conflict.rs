//! Reconciles multiple per-method results for the same `(specimen, organism,
//! antibiotic)` triple. Invoked only when the grouped inputs produced more
//! than one measurement for that triple; a single measurement passes
//! through untouched.

use std::collections::HashMap;

use crate::format::{AntibioticKey, ClassificationInput, Decision, Measurement, MethodKind, OrganismKey, RuleCatalog, SpecimenRef};

/// One input's classification before conflict resolution: the decision an
/// expert rule or the breakpoint interpreter already assigned, plus whether
/// it came from an override (and therefore outranks any conflicting
/// breakpoint result for the same pair).
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub input: ClassificationInput,
    pub decision: Decision,
    pub reason: String,
    pub fired_rules: Vec<String>,
    pub is_override: bool,
}

/// A reconciled, final per-pair classification ready for the decision
/// assembler.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub input: ClassificationInput,
    pub decision: Decision,
    pub reason: String,
    pub fired_rules: Vec<String>,
}

/// Groups `classified` by `(specimen, organism, antibiotic)` and reconciles
/// each group independently. Order of the returned results follows first
/// appearance of each group's key within `classified`.
pub fn resolve(classified: Vec<Classified>, catalog: &RuleCatalog) -> Vec<Resolved> {
    let mut order: Vec<(SpecimenRef, Option<OrganismKey>, Option<AntibioticKey>)> = Vec::new();
    let mut groups: HashMap<(SpecimenRef, Option<OrganismKey>, Option<AntibioticKey>), Vec<Classified>> = HashMap::new();

    for item in classified {
        let key = (item.input.specimen.clone(), item.input.organism.clone(), item.input.antibiotic.clone());
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(item);
    }

    order.into_iter().map(|key| resolve_group(groups.remove(&key).unwrap(), catalog)).collect()
}

fn resolve_group(mut items: Vec<Classified>, catalog: &RuleCatalog) -> Resolved {
    if items.len() == 1 {
        let item = items.pop().unwrap();
        return Resolved {
            input: item.input,
            decision: item.decision,
            reason: item.reason,
            fired_rules: item.fired_rules,
        };
    }

    if let Some(winner) = items.iter().find(|i| i.is_override) {
        return Resolved {
            input: winner.input.clone(),
            decision: winner.decision,
            reason: winner.reason.clone(),
            fired_rules: winner.fired_rules.clone(),
        };
    }

    let first_decision = items[0].decision;
    if items.iter().all(|i| i.decision == first_decision) {
        let representative = &items[0];
        return Resolved {
            input: representative.input.clone(),
            decision: first_decision,
            reason: format!("{} ({} concordant measurements)", representative.reason, items.len()),
            fired_rules: representative.fired_rules.clone(),
        };
    }

    let methods_differ = items.windows(2).any(|w| w[0].input.method != w[1].input.method);
    if !methods_differ {
        let representative = items[0].clone();
        return Resolved {
            input: representative.input,
            decision: Decision::RequiresReview,
            reason: "duplicate measurements disagree".to_owned(),
            fired_rules: Vec::new(),
        };
    }

    match &catalog.policy.method_precedence {
        Some(order) => resolve_by_method_precedence(items, order),
        None => {
            let representative = items[0].clone();
            let summary = items
                .iter()
                .map(|i| format!("{}={}", i.input.method, i.decision))
                .collect::<Vec<_>>()
                .join(", ");
            Resolved {
                input: representative.input,
                decision: Decision::RequiresReview,
                reason: format!("conflicting methods: {summary}"),
                fired_rules: Vec::new(),
            }
        }
    }
}

fn resolve_by_method_precedence(items: Vec<Classified>, precedence: &[MethodKind]) -> Resolved {
    let winner_idx = items
        .iter()
        .enumerate()
        .min_by_key(|(_, item)| precedence.iter().position(|m| *m == item.input.method).unwrap_or(usize::MAX))
        .map(|(idx, _)| idx)
        .unwrap_or(0);

    let winner = items[winner_idx].clone();
    let others: Vec<String> = items
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != winner_idx)
        .map(|(_, item)| {
            format!(
                "{} disagrees ({} => {})",
                method_label(item.input.method),
                render_value(&item.input.value),
                item.decision
            )
        })
        .collect();

    Resolved {
        input: winner.input,
        decision: winner.decision,
        reason: format!("{} preferred; {}", method_label(winner.input.method), others.join("; ")),
        fired_rules: winner.fired_rules,
    }
}

fn method_label(method: MethodKind) -> &'static str {
    match method {
        MethodKind::Mic => "MIC",
        MethodKind::Disc => "disc diffusion",
        MethodKind::Screen => "screen",
        MethodKind::Phenotype => "phenotype",
        MethodKind::Gradient => "gradient",
    }
}

fn render_value(value: &Measurement) -> String {
    match value {
        Measurement::Mic { value: Some(v), .. } => format!("{v} mg/L"),
        Measurement::Disc { value: Some(v) } => format!("{v} mm"),
        _ => "n/a".to_owned(),
    }
}
