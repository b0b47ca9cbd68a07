//! The expert-rule engine: intrinsic resistance, phenotype overrides, and
//! catalog-defined rules, evaluated in that fixed precedence order.
//!
//! Rules are data plus a single evaluator here, not polymorphic objects --
//! each `ExpertRule` is a declarative `when`/`effect` descriptor so
//! precedence, exhaustiveness, and suppression are all reportable as plain
//! values rather than buried in dispatch.

use crate::errors::RuleEvaluationError;
use crate::format::{
    AntibioticKey, ClassificationInput, Decision, ExpertRule, IntrinsicRule, OrganismKey, PhenotypeFlag, RuleCatalog,
    RulePredicate,
};

/// A rule (intrinsic, phenotype-derived, or catalog-defined) that produced a
/// decision, plus whatever other rules were eligible but lost the tie-break.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleFiring {
    pub decision: Decision,
    pub reason: String,
    pub fired_rules: Vec<String>,
    pub suppressed: Vec<String>,
}

/// Runs intrinsic resistance, then phenotype overrides, then catalog-defined
/// expert rules, in that order, and returns the first decision produced.
/// `Ok(None)` means no override applies and the breakpoint interpreter
/// should run. `Err` means a rule referenced an antibiotic class absent
/// from the catalog -- unreachable if the catalog store's validation
/// contract held, but degraded to `REQUIRES_REVIEW` by the caller rather
/// than panicking.
pub fn evaluate(catalog: &RuleCatalog, input: &ClassificationInput) -> Result<Option<RuleFiring>, RuleEvaluationError> {
    if let Some(firing) = evaluate_intrinsic(catalog, input)? {
        return Ok(Some(firing));
    }
    if let Some(firing) = evaluate_phenotype_overrides(catalog, input)? {
        return Ok(Some(firing));
    }
    evaluate_expert_rules(catalog, input)
}

fn evaluate_intrinsic(catalog: &RuleCatalog, input: &ClassificationInput) -> Result<Option<RuleFiring>, RuleEvaluationError> {
    let (Some(organism), Some(antibiotic)) = (input.organism.as_ref(), input.antibiotic.as_ref()) else {
        return Ok(None);
    };

    let mut matches: Vec<&IntrinsicRule> = Vec::new();
    for rule in &catalog.intrinsic_resistance {
        if catalog.scope_matches(&rule.organism_scope, organism) && intrinsic_covers_antibiotic(catalog, rule, antibiotic)? {
            matches.push(rule);
        }
    }
    if matches.is_empty() {
        return Ok(None);
    }
    matches.sort_by(|a, b| a.id.cmp(&b.id));

    let primary = matches[0];
    Ok(Some(RuleFiring {
        decision: Decision::Resistant,
        reason: format!("intrinsic resistance per rule {}", primary.id),
        fired_rules: matches.iter().map(|r| r.id.clone()).collect(),
        suppressed: Vec::new(),
    }))
}

fn intrinsic_covers_antibiotic(catalog: &RuleCatalog, rule: &IntrinsicRule, antibiotic: &AntibioticKey) -> Result<bool, RuleEvaluationError> {
    if rule.antibiotic.as_ref() == Some(antibiotic) {
        return Ok(true);
    }
    match &rule.antibiotic_class {
        Some(class) => in_class(catalog, class, antibiotic, &rule.id),
        None => Ok(false),
    }
}

fn evaluate_phenotype_overrides(catalog: &RuleCatalog, input: &ClassificationInput) -> Result<Option<RuleFiring>, RuleEvaluationError> {
    let (Some(organism), Some(antibiotic)) = (input.organism.as_ref(), input.antibiotic.as_ref()) else {
        return Ok(None);
    };

    if input.phenotypes.contains(&PhenotypeFlag::Esbl)
        && catalog.organism_in_group(organism, "Enterobacterales")
        && in_class(catalog, "beta-lactam", antibiotic, "ESBL-BL-OVR")?
        && !catalog.policy.esbl_exceptions.contains(antibiotic)
    {
        return Ok(Some(RuleFiring {
            decision: Decision::Resistant,
            reason: "ESBL override for beta-lactam class".to_owned(),
            fired_rules: vec!["ESBL-BL-OVR".to_owned()],
            suppressed: Vec::new(),
        }));
    }

    if (input.phenotypes.contains(&PhenotypeFlag::Mrsa))
        && *organism == OrganismKey::new("Staphylococcus aureus")
        && in_class(catalog, "beta-lactam", antibiotic, "MRSA-BL-OVR")?
    {
        if catalog.policy.anti_mrsa_cephalosporins.contains(antibiotic) {
            return Ok(if catalog.policy.anti_mrsa_cephalosporins_require_review {
                Some(RuleFiring {
                    decision: Decision::RequiresReview,
                    reason: "anti-MRSA cephalosporin requires review per policy".to_owned(),
                    fired_rules: vec!["MRSA-BL-EXC".to_owned()],
                    suppressed: Vec::new(),
                })
            } else {
                None
            });
        }
        return Ok(Some(RuleFiring {
            decision: Decision::Resistant,
            reason: "MRSA override for beta-lactams (except anti-MRSA cephalosporins)".to_owned(),
            fired_rules: vec!["MRSA-BL-OVR".to_owned()],
            suppressed: Vec::new(),
        }));
    }

    if input.phenotypes.iter().any(|p| matches!(p, PhenotypeFlag::Carbapenemase(_)))
        && in_class(catalog, "carbapenem", antibiotic, "CPE-CARB-OVR")?
    {
        return Ok(Some(RuleFiring {
            decision: Decision::Resistant,
            reason: "carbapenemase override for carbapenem class".to_owned(),
            fired_rules: vec!["CPE-CARB-OVR".to_owned()],
            suppressed: Vec::new(),
        }));
    }

    if input.phenotypes.contains(&PhenotypeFlag::Vre) && *antibiotic == AntibioticKey::new("Vancomycin") {
        return Ok(Some(RuleFiring {
            decision: Decision::Resistant,
            reason: "VRE override for vancomycin".to_owned(),
            fired_rules: vec!["VRE-VAN-OVR".to_owned()],
            suppressed: Vec::new(),
        }));
    }

    if input.phenotypes.contains(&PhenotypeFlag::InducibleClinda)
        && organism.genus().eq_ignore_ascii_case("Staphylococcus")
        && *antibiotic == AntibioticKey::new("Clindamycin")
    {
        return Ok(Some(RuleFiring {
            decision: Decision::Resistant,
            reason: "inducible clindamycin resistance (D-test positive)".to_owned(),
            fired_rules: vec!["ICR-CLI-OVR".to_owned()],
            suppressed: Vec::new(),
        }));
    }

    Ok(None)
}

/// Looks up whether `antibiotic` belongs to `class`. Unlike a plain
/// membership check, an undefined `class` is an internal consistency
/// failure attributed to `rule_id` -- the catalog store's validation
/// contract should have rejected a rule referencing a class that doesn't
/// exist, so this should be unreachable in practice.
fn in_class(catalog: &RuleCatalog, class: &str, antibiotic: &AntibioticKey, rule_id: &str) -> Result<bool, RuleEvaluationError> {
    catalog.antibiotics_in_class(class).map(|set| set.contains(antibiotic)).ok_or_else(|| RuleEvaluationError {
        error_id: rule_id.to_owned(),
        detail: format!("antibiotic class {class:?} is not defined in the active catalog"),
    })
}

fn evaluate_expert_rules(catalog: &RuleCatalog, input: &ClassificationInput) -> Result<Option<RuleFiring>, RuleEvaluationError> {
    let mut eligible: Vec<&ExpertRule> = Vec::new();
    for rule in &catalog.expert_rules {
        if !predicate_matches(catalog, &rule.when, input)? {
            continue;
        }
        if input.antibiotic.as_ref().map(|a| rule.exceptions.contains(a)).unwrap_or(false) {
            continue;
        }
        if let Some(class) = &rule.effect.applies_to {
            let covered = match input.antibiotic.as_ref() {
                Some(a) => in_class(catalog, class, a, &rule.id)?,
                None => false,
            };
            if !covered {
                continue;
            }
        }
        eligible.push(rule);
    }

    if eligible.is_empty() {
        return Ok(None);
    }
    // Highest priority wins; ties broken by id (ascending).
    eligible.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    let winner = eligible[0];
    let suppressed = eligible[1..].iter().map(|r| r.id.clone()).collect();

    Ok(Some(RuleFiring {
        decision: winner.effect.decision,
        reason: render_rationale(&winner.effect.rationale_template, winner, input),
        fired_rules: vec![winner.id.clone()],
        suppressed,
    }))
}

fn predicate_matches(catalog: &RuleCatalog, predicate: &RulePredicate, input: &ClassificationInput) -> Result<bool, RuleEvaluationError> {
    if let Some(scope) = &predicate.organism_scope {
        match &input.organism {
            Some(organism) if catalog.scope_matches(scope, organism) => {}
            _ => return Ok(false),
        }
    }
    if !predicate.phenotypes.is_empty() && !predicate.phenotypes.is_subset(&input.phenotypes) {
        return Ok(false);
    }
    if !predicate.antibiotic_set.is_empty() {
        match &input.antibiotic {
            Some(antibiotic) if predicate.antibiotic_set.contains(antibiotic) => {}
            _ => return Ok(false),
        }
    }
    if let Some(class) = &predicate.antibiotic_class {
        match &input.antibiotic {
            Some(antibiotic) if in_class(catalog, class, antibiotic, "predicate")? => {}
            _ => return Ok(false),
        }
    }
    if !predicate.method_set.is_empty() && !predicate.method_set.contains(&input.method) {
        return Ok(false);
    }
    for (key, expected) in &predicate.auxiliary_equals {
        if input.auxiliary.get(key) != Some(expected) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn render_rationale(template: &str, rule: &ExpertRule, input: &ClassificationInput) -> String {
    let mut out = template.to_owned();
    out = out.replace("{id}", &rule.id);
    if let Some(organism) = &input.organism {
        out = out.replace("{organism}", organism.as_str());
    }
    if let Some(antibiotic) = &input.antibiotic {
        out = out.replace("{antibiotic}", antibiotic.as_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Measurement, MethodKind, SortedSet, SpecimenRef};

    fn input(organism: &str, antibiotic: &str, phenotypes: SortedSet<PhenotypeFlag>) -> ClassificationInput {
        ClassificationInput {
            specimen: SpecimenRef("S1".to_owned()),
            organism: Some(OrganismKey::new(organism)),
            antibiotic: Some(AntibioticKey::new(antibiotic)),
            method: MethodKind::Mic,
            value: Measurement::Mic {
                value: Some(0.5),
                comparator: None,
            },
            phenotypes,
            auxiliary: Default::default(),
        }
    }

    fn catalog_with_intrinsic() -> RuleCatalog {
        RuleCatalog {
            intrinsic_resistance: vec![IntrinsicRule {
                id: "INTR-PAE-CRO".to_owned(),
                organism_scope: crate::format::OrganismScope::Exact(OrganismKey::new("Pseudomonas aeruginosa")),
                antibiotic_class: None,
                antibiotic: Some(AntibioticKey::new("Ceftriaxone")),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn intrinsic_resistance_fires_regardless_of_value() {
        let catalog = catalog_with_intrinsic();
        let firing = evaluate(&catalog, &input("Pseudomonas aeruginosa", "Ceftriaxone", Default::default())).unwrap().unwrap();
        assert_eq!(firing.decision, Decision::Resistant);
        assert_eq!(firing.reason, "intrinsic resistance per rule INTR-PAE-CRO");
        assert_eq!(firing.fired_rules, vec!["INTR-PAE-CRO".to_owned()]);
    }

    #[test]
    fn esbl_overrides_beta_lactam() {
        let mut catalog = RuleCatalog::default();
        catalog
            .organism_groups
            .insert("Enterobacterales".to_owned(), [crate::format::GroupMember::Organism(OrganismKey::new("Escherichia coli"))].into());
        catalog
            .antibiotic_classes
            .insert("beta-lactam".to_owned(), [AntibioticKey::new("Ceftazidime")].into());

        let mut phenotypes = SortedSet::new();
        phenotypes.insert(PhenotypeFlag::Esbl);
        let firing = evaluate(&catalog, &input("Escherichia coli", "Ceftazidime", phenotypes)).unwrap().unwrap();
        assert_eq!(firing.decision, Decision::Resistant);
        assert_eq!(firing.fired_rules, vec!["ESBL-BL-OVR".to_owned()]);
    }

    #[test]
    fn esbl_override_on_an_undefined_class_is_an_internal_error() {
        let mut catalog = RuleCatalog::default();
        catalog
            .organism_groups
            .insert("Enterobacterales".to_owned(), [crate::format::GroupMember::Organism(OrganismKey::new("Escherichia coli"))].into());
        // "beta-lactam" is never defined in antibiotic_classes.
        let mut phenotypes = SortedSet::new();
        phenotypes.insert(PhenotypeFlag::Esbl);
        let err = evaluate(&catalog, &input("Escherichia coli", "Ceftazidime", phenotypes)).unwrap_err();
        assert_eq!(err.error_id, "ESBL-BL-OVR");
    }

    #[test]
    fn mrsa_overrides_beta_lactam_except_policy_exceptions() {
        let mut catalog = RuleCatalog::default();
        catalog
            .antibiotic_classes
            .insert("beta-lactam".to_owned(), [AntibioticKey::new("Oxacillin"), AntibioticKey::new("Ceftaroline")].into());
        catalog.policy.anti_mrsa_cephalosporins.insert(AntibioticKey::new("Ceftaroline"));

        let mut phenotypes = SortedSet::new();
        phenotypes.insert(PhenotypeFlag::Mrsa);

        let firing = evaluate(&catalog, &input("Staphylococcus aureus", "Oxacillin", phenotypes.clone())).unwrap().unwrap();
        assert_eq!(firing.fired_rules, vec!["MRSA-BL-OVR".to_owned()]);

        assert!(evaluate(&catalog, &input("Staphylococcus aureus", "Ceftaroline", phenotypes)).unwrap().is_none());
    }

    #[test]
    fn catalog_expert_rule_priority_breaks_ties() {
        let mut catalog = RuleCatalog::default();
        catalog.expert_rules.push(ExpertRule {
            id: "LOW".to_owned(),
            priority: 1,
            when: RulePredicate::default(),
            effect: crate::format::RuleEffect {
                decision: Decision::RequiresReview,
                rationale_template: "low priority".to_owned(),
                applies_to: None,
            },
            exceptions: Default::default(),
        });
        catalog.expert_rules.push(ExpertRule {
            id: "HIGH".to_owned(),
            priority: 10,
            when: RulePredicate::default(),
            effect: crate::format::RuleEffect {
                decision: Decision::Resistant,
                rationale_template: "high priority wins".to_owned(),
                applies_to: None,
            },
            exceptions: Default::default(),
        });

        let firing = evaluate(&catalog, &input("Escherichia coli", "Amoxicillin", Default::default())).unwrap().unwrap();
        assert_eq!(firing.fired_rules, vec!["HIGH".to_owned()]);
        assert_eq!(firing.suppressed, vec!["LOW".to_owned()]);
        assert_eq!(firing.decision, Decision::Resistant);
    }
}
