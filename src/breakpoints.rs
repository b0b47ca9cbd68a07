//! Runs only when no expert-rule override fired: compares a MIC or zone
//! diameter value against the catalog's breakpoint thresholds for the most
//! specific matching organism scope and preferred source.

use crate::format::{
    AntibioticKey, BreakpointEntry, BreakpointSource, ClassificationInput, Comparator, Decision, Measurement,
    MethodKind, OrganismKey, RuleCatalog, Unit,
};

#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointOutcome {
    pub decision: Decision,
    pub reason: String,
}

/// Interprets `input` against `catalog`'s breakpoints. `preferred_source`
/// overrides the catalog's default source preference for this request.
pub fn interpret(
    catalog: &RuleCatalog,
    input: &ClassificationInput,
    preferred_source: Option<BreakpointSource>,
) -> BreakpointOutcome {
    let (Some(organism), Some(antibiotic)) = (&input.organism, &input.antibiotic) else {
        return no_applicable_breakpoint();
    };

    let mut source_order = Vec::new();
    source_order.push(preferred_source.unwrap_or(catalog.policy.default_source));
    for source in &catalog.policy.source_fallback_order {
        if !source_order.contains(source) {
            source_order.push(*source);
        }
    }

    let lookup_method = if input.method == MethodKind::Gradient {
        MethodKind::Mic
    } else {
        input.method
    };

    let entry = source_order.iter().find_map(|source| {
        select_entry(catalog, organism, antibiotic, lookup_method, *source)
    });

    let Some(entry) = entry else {
        return no_applicable_breakpoint();
    };

    match &input.value {
        Measurement::Mic { value: Some(value), comparator } => mic_outcome(entry, *value, *comparator),
        Measurement::Disc { value: Some(value) } => disc_outcome(entry, *value),
        _ => no_applicable_breakpoint(),
    }
}

fn select_entry<'a>(
    catalog: &'a RuleCatalog,
    organism: &OrganismKey,
    antibiotic: &AntibioticKey,
    method: MethodKind,
    source: BreakpointSource,
) -> Option<&'a BreakpointEntry> {
    catalog
        .breakpoints
        .iter()
        .filter(|e| &e.antibiotic == antibiotic && e.method == method && e.source == source)
        .filter(|e| catalog.scope_matches(&e.organism_scope, organism))
        .max_by_key(|e| e.organism_scope.specificity())
}

fn no_applicable_breakpoint() -> BreakpointOutcome {
    BreakpointOutcome {
        decision: Decision::RequiresReview,
        reason: "no applicable breakpoint".to_owned(),
    }
}

/// Crosses exactly one breakpoint step for a `>x`-prefixed HL7 value
/// without visibly perturbing the displayed number.
const COMPARATOR_EPSILON: f64 = 1e-6;

fn mic_outcome(entry: &BreakpointEntry, value: f64, comparator: Option<Comparator>) -> BreakpointOutcome {
    let unit = Unit::MgPerL;
    let value_str = format_with_comparator(value, comparator);
    let value = match comparator {
        Some(Comparator::Gt) => value + COMPARATOR_EPSILON,
        _ => value,
    };

    if let Some(s) = entry.s_threshold {
        if value <= s {
            return BreakpointOutcome {
                decision: Decision::Susceptible,
                reason: format!("MIC {value_str} {unit} <= S threshold {} {unit}", fmt_num(s)),
            };
        }
    }
    if let Some(r) = entry.r_threshold {
        if value > r {
            if let Some(rare) = entry.rare_resistance {
                if value > r + rare.margin {
                    return BreakpointOutcome {
                        decision: Decision::ResistantRare,
                        reason: format!(
                            "MIC {value_str} {unit} > R threshold {} {unit} by more than the rare-resistance margin {} {unit}",
                            fmt_num(r),
                            fmt_num(rare.margin)
                        ),
                    };
                }
            }
            return BreakpointOutcome {
                decision: Decision::Resistant,
                reason: format!("MIC {value_str} {unit} > R threshold {} {unit}", fmt_num(r)),
            };
        }
    }
    let i_label = entry
        .i_threshold
        .map(|i| format!(" (<= I threshold {} {unit})", fmt_num(i)))
        .unwrap_or_default();
    BreakpointOutcome {
        decision: Decision::SusceptibleIncreasedExposure,
        reason: format!(
            "MIC {value_str} {unit} falls between S and R thresholds{i_label}"
        ),
    }
}

fn disc_outcome(entry: &BreakpointEntry, value: i64) -> BreakpointOutcome {
    let unit = Unit::Mm;
    if let Some(s) = entry.s_threshold {
        if (value as f64) >= s {
            return BreakpointOutcome {
                decision: Decision::Susceptible,
                reason: format!("zone diameter {value} {unit} >= S threshold {} {unit}", fmt_num(s)),
            };
        }
    }
    if let Some(r) = entry.r_threshold {
        if (value as f64) < r {
            return BreakpointOutcome {
                decision: Decision::Resistant,
                reason: format!("zone diameter {value} {unit} < R threshold {} {unit}", fmt_num(r)),
            };
        }
    }
    BreakpointOutcome {
        decision: Decision::SusceptibleIncreasedExposure,
        reason: format!("zone diameter {value} {unit} falls between S and R thresholds"),
    }
}

fn format_with_comparator(value: f64, comparator: Option<Comparator>) -> String {
    match comparator {
        Some(c) => format!("{c}{}", fmt_num(value)),
        None => fmt_num(value),
    }
}

fn fmt_num(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}
