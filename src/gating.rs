//! Enforces preconditions before classification. A gate failure becomes a
//! `Requires Review` result with an explicit reason rather than a
//! resistance call -- it is never silently coerced into `R`/`RR`.

use crate::format::{AntibioticKey, ClassificationInput, Measurement, MethodKind};

/// The outcome of running every gate over one input. If `primary` is
/// `Some`, classification stops and the input becomes `Requires Review`;
/// `all_fired` records every gate that tripped (spec: "first-fire wins, all
/// fires recorded in rationale"), even though only the first determines the
/// decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub primary: String,
    pub all_fired: Vec<String>,
}

/// Runs the six ordered gates from the spec over `input`. Returns `None` if
/// every gate passes.
pub fn evaluate(input: &ClassificationInput) -> Option<GateOutcome> {
    let mut fired = Vec::new();

    if !input.value.agrees_with(input.method) {
        fired.push("method/value inconsistent".to_owned());
    }

    if matches!(input.method, MethodKind::Mic | MethodKind::Gradient) {
        if let Measurement::Mic { value: None, .. } = &input.value {
            fired.push("MIC value missing for MIC method".to_owned());
        }
    }

    if input.method == MethodKind::Disc {
        if let Measurement::Disc { value: None } = &input.value {
            fired.push("Zone diameter missing for disk method".to_owned());
        }
    }

    let organism_unresolved = input.organism.as_ref().map(|o| o.is_unresolved()).unwrap_or(true);
    if organism_unresolved {
        fired.push("organism not recognized".to_owned());
    }

    let antibiotic_unresolved = input
        .antibiotic
        .as_ref()
        .map(AntibioticKey::is_unresolved)
        .unwrap_or(true);
    if antibiotic_unresolved {
        fired.push("antibiotic not recognized".to_owned());
    }

    if out_of_range(input) {
        fired.push("value out of plausible range".to_owned());
    }

    fired.first().map(|primary| GateOutcome {
        primary: primary.clone(),
        all_fired: fired,
    })
}

fn out_of_range(input: &ClassificationInput) -> bool {
    match &input.value {
        Measurement::Mic { value: Some(v), .. } => !(*v > 0.001 && *v <= 1024.0),
        Measurement::Disc { value: Some(v) } => !(1..=100).contains(v),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{OrganismKey, ScreenResult, SpecimenRef};

    fn base() -> ClassificationInput {
        ClassificationInput {
            specimen: SpecimenRef("S1".to_owned()),
            organism: Some(OrganismKey::new("Escherichia coli")),
            antibiotic: Some(AntibioticKey::new("Amoxicillin")),
            method: MethodKind::Mic,
            value: Measurement::Mic {
                value: Some(4.0),
                comparator: None,
            },
            phenotypes: Default::default(),
            auxiliary: Default::default(),
        }
    }

    #[test]
    fn passes_clean_input() {
        assert_eq!(evaluate(&base()), None);
    }

    #[test]
    fn variant_disagreement_fires_first() {
        let mut input = base();
        input.method = MethodKind::Disc;
        let outcome = evaluate(&input).unwrap();
        assert_eq!(outcome.primary, "method/value inconsistent");
    }

    #[test]
    fn missing_mic_value() {
        let mut input = base();
        input.value = Measurement::Mic {
            value: None,
            comparator: None,
        };
        let outcome = evaluate(&input).unwrap();
        assert_eq!(outcome.primary, "MIC value missing for MIC method");
    }

    #[test]
    fn missing_disc_value() {
        let mut input = base();
        input.method = MethodKind::Disc;
        input.value = Measurement::Disc { value: None };
        let outcome = evaluate(&input).unwrap();
        assert_eq!(outcome.primary, "Zone diameter missing for disk method");
    }

    #[test]
    fn unresolved_organism() {
        let mut input = base();
        input.organism = Some(OrganismKey::unresolved());
        let outcome = evaluate(&input).unwrap();
        assert_eq!(outcome.primary, "organism not recognized");
    }

    #[test]
    fn unresolved_antibiotic() {
        let mut input = base();
        input.antibiotic = Some(AntibioticKey::unresolved());
        let outcome = evaluate(&input).unwrap();
        assert_eq!(outcome.primary, "antibiotic not recognized");
    }

    #[test]
    fn out_of_plausible_range() {
        let mut input = base();
        input.value = Measurement::Mic {
            value: Some(4096.0),
            comparator: None,
        };
        let outcome = evaluate(&input).unwrap();
        assert_eq!(outcome.primary, "value out of plausible range");
    }

    #[test]
    fn screen_method_never_out_of_range() {
        let mut input = base();
        input.method = MethodKind::Screen;
        input.value = Measurement::Screen {
            result: ScreenResult::Positive,
        };
        assert_eq!(evaluate(&input), None);
    }
}
