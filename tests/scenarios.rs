//! End-to-end scenarios run through the full `ClassificationEngine`
//! pipeline against a small in-memory catalog built for these tests.

use std::sync::Arc;

use amr_vet::catalog::CatalogStore;
use amr_vet::correlation::CorrelationId;
use amr_vet::engine::ClassificationEngine;
use amr_vet::format::{
    AntibioticKey, BreakpointEntry, BreakpointSource, Comparison, Decision, GroupMember, IntrinsicRule, MethodKind,
    OrganismKey, OrganismScope, RuleCatalog, Unit,
};

fn scenario_catalog() -> RuleCatalog {
    let mut catalog = RuleCatalog {
        version_label: "EUCAST-2025.1".to_owned(),
        ..Default::default()
    };

    catalog.breakpoints.push(BreakpointEntry {
        organism_scope: OrganismScope::Any,
        antibiotic: AntibioticKey::new("Amoxicillin"),
        method: MethodKind::Mic,
        source: BreakpointSource::Eucast,
        version_label: "EUCAST-2025.1".to_owned(),
        s_threshold: Some(8.0),
        i_threshold: None,
        r_threshold: Some(8.0),
        comparator: Comparison::LeSGeR,
        unit: Unit::MgPerL,
        rare_resistance: None,
    });

    catalog.breakpoints.push(BreakpointEntry {
        organism_scope: OrganismScope::Any,
        antibiotic: AntibioticKey::new("Ceftriaxone"),
        method: MethodKind::Mic,
        source: BreakpointSource::Eucast,
        version_label: "EUCAST-2025.1".to_owned(),
        s_threshold: Some(1.0),
        i_threshold: None,
        r_threshold: Some(1.0),
        comparator: Comparison::LeSGeR,
        unit: Unit::MgPerL,
        rare_resistance: None,
    });

    catalog.breakpoints.push(BreakpointEntry {
        organism_scope: OrganismScope::Any,
        antibiotic: AntibioticKey::new("Ceftriaxone"),
        method: MethodKind::Disc,
        source: BreakpointSource::Eucast,
        version_label: "EUCAST-2025.1".to_owned(),
        s_threshold: Some(20.0),
        i_threshold: None,
        r_threshold: Some(20.0),
        comparator: Comparison::InverseForDisc,
        unit: Unit::Mm,
        rare_resistance: None,
    });

    catalog.breakpoints.push(BreakpointEntry {
        organism_scope: OrganismScope::Any,
        antibiotic: AntibioticKey::new("Ceftazidime"),
        method: MethodKind::Mic,
        source: BreakpointSource::Eucast,
        version_label: "EUCAST-2025.1".to_owned(),
        s_threshold: Some(4.0),
        i_threshold: None,
        r_threshold: Some(4.0),
        comparator: Comparison::LeSGeR,
        unit: Unit::MgPerL,
        rare_resistance: None,
    });

    catalog.breakpoints.push(BreakpointEntry {
        organism_scope: OrganismScope::Any,
        antibiotic: AntibioticKey::new("Oxacillin"),
        method: MethodKind::Mic,
        source: BreakpointSource::Eucast,
        version_label: "EUCAST-2025.1".to_owned(),
        s_threshold: Some(2.0),
        i_threshold: None,
        r_threshold: Some(2.0),
        comparator: Comparison::LeSGeR,
        unit: Unit::MgPerL,
        rare_resistance: None,
    });

    catalog.intrinsic_resistance.push(IntrinsicRule {
        id: "INTR-PAE-CRO".to_owned(),
        organism_scope: OrganismScope::Exact(OrganismKey::new("Pseudomonas aeruginosa")),
        antibiotic_class: None,
        antibiotic: Some(AntibioticKey::new("Ceftriaxone")),
    });

    catalog
        .organism_groups
        .insert("Enterobacterales".to_owned(), [GroupMember::Organism(OrganismKey::new("Escherichia coli"))].into());

    catalog.antibiotic_classes.insert(
        "beta-lactam".to_owned(),
        [AntibioticKey::new("Ceftazidime"), AntibioticKey::new("Oxacillin"), AntibioticKey::new("Ceftriaxone")].into(),
    );

    catalog
}

fn engine() -> ClassificationEngine {
    ClassificationEngine::offline(Arc::new(CatalogStore::from_catalog(scenario_catalog())))
}

#[tokio::test]
async fn s1_mic_susceptible() {
    let payload = r#"{
        "specimen": "S1",
        "organism": "Escherichia coli",
        "antibiotic": "Amoxicillin",
        "method": "MIC",
        "value": {"kind": "Mic", "value": 4.0}
    }"#;
    let results = engine().classify_native(payload, CorrelationId::new("s1")).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].decision, Decision::Susceptible);
    assert_eq!(results[0].reason, "MIC 4.0 mg/L <= S threshold 8.0 mg/L");
    assert_eq!(results[0].catalog_version, "EUCAST-2025.1");
}

#[tokio::test]
async fn s1_mic_susceptible_rendered_report_snapshot() {
    let payload = r#"{
        "specimen": "S1",
        "organism": "Escherichia coli",
        "antibiotic": "Amoxicillin",
        "method": "MIC",
        "value": {"kind": "Mic", "value": 4.0}
    }"#;
    let results = engine().classify_native(payload, CorrelationId::new("s1-report")).await.unwrap();
    let rendered = serde_json::to_string_pretty(&results).unwrap();
    insta::assert_snapshot!("s1-mic-susceptible-report", rendered);
}

#[tokio::test]
async fn s2_fhir_mic_missing_value() {
    let bundle = serde_json::json!({
        "resourceType": "Bundle",
        "type": "collection",
        "entry": [{"resource": {
            "resourceType": "Observation",
            "category": [{"coding": [{"code": "laboratory"}]}],
            "specimen": {"reference": "Specimen/1"},
            "code": {"text": "Amoxicillin [Susceptibility] by MIC"},
        }}],
    })
    .to_string();
    let results = engine().classify_fhir(&bundle, CorrelationId::new("s2")).await.unwrap();
    assert_eq!(results[0].decision, Decision::RequiresReview);
    assert_eq!(results[0].reason, "MIC value missing for MIC method");
}

#[tokio::test]
async fn s3_fhir_disc_missing_value() {
    let bundle = serde_json::json!({
        "resourceType": "Bundle",
        "type": "collection",
        "entry": [{"resource": {
            "resourceType": "Observation",
            "category": [{"coding": [{"code": "laboratory"}]}],
            "specimen": {"reference": "Specimen/1"},
            "code": {"text": "Clindamycin [Susceptibility] by disk diffusion"},
        }}],
    })
    .to_string();
    let results = engine().classify_fhir(&bundle, CorrelationId::new("s3")).await.unwrap();
    assert_eq!(results[0].decision, Decision::RequiresReview);
    assert_eq!(results[0].reason, "Zone diameter missing for disk method");
}

#[tokio::test]
async fn s4_intrinsic_resistance() {
    let payload = r#"{
        "specimen": "S4",
        "organism": "Pseudomonas aeruginosa",
        "antibiotic": "Ceftriaxone",
        "method": "MIC",
        "value": {"kind": "Mic", "value": 0.5}
    }"#;
    let results = engine().classify_native(payload, CorrelationId::new("s4")).await.unwrap();
    assert_eq!(results[0].decision, Decision::Resistant);
    assert_eq!(results[0].reason, "intrinsic resistance per rule INTR-PAE-CRO");
    assert_eq!(results[0].fired_rules, vec!["INTR-PAE-CRO".to_owned()]);
}

#[tokio::test]
async fn s5_esbl_override() {
    let bundle = serde_json::json!({
        "resourceType": "Bundle",
        "type": "collection",
        "entry": [
            {"resource": {
                "resourceType": "Observation",
                "category": [{"coding": [{"code": "laboratory"}]}],
                "specimen": {"reference": "Specimen/1"},
                "code": {"coding": [{"system": "http://loinc.org", "code": "634-6"}]},
                "valueCodeableConcept": {"text": "Escherichia coli"},
            }},
            {"resource": {
                "resourceType": "Observation",
                "category": [{"coding": [{"code": "laboratory"}]}],
                "specimen": {"reference": "Specimen/1"},
                "code": {"text": "ESBL detected"},
                "valueString": "Positive",
            }},
            {"resource": {
                "resourceType": "Observation",
                "category": [{"coding": [{"code": "laboratory"}]}],
                "specimen": {"reference": "Specimen/1"},
                "code": {"text": "Ceftazidime [Susceptibility] by MIC"},
                "valueQuantity": {"value": 1.0, "unit": "mg/L"},
            }},
        ],
    })
    .to_string();

    let results = engine().classify_fhir(&bundle, CorrelationId::new("s5")).await.unwrap();
    let susceptibility = results.iter().find(|r| r.antibiotic.as_deref_eq("Ceftazidime")).unwrap();
    assert_eq!(susceptibility.decision, Decision::Resistant);
    assert_eq!(susceptibility.reason, "ESBL override for beta-lactam class");
    assert_eq!(susceptibility.fired_rules, vec!["ESBL-BL-OVR".to_owned()]);
}

#[tokio::test]
async fn s6_mrsa_override() {
    let bundle = serde_json::json!({
        "resourceType": "Bundle",
        "type": "collection",
        "entry": [
            {"resource": {
                "resourceType": "Observation",
                "category": [{"coding": [{"code": "laboratory"}]}],
                "specimen": {"reference": "Specimen/1"},
                "code": {"text": "Cefoxitin screen"},
                "valueString": "Positive",
            }},
            {"resource": {
                "resourceType": "Observation",
                "category": [{"coding": [{"code": "laboratory"}]}],
                "specimen": {"reference": "Specimen/1"},
                "code": {"text": "Oxacillin [Susceptibility] by MIC"},
                "valueQuantity": {"value": 0.25, "unit": "mg/L"},
            }},
        ],
    })
    .to_string();

    // organism identification observation so terminology resolves.
    let mut value: serde_json::Value = serde_json::from_str(&bundle).unwrap();
    value["entry"].as_array_mut().unwrap().insert(
        0,
        serde_json::json!({"resource": {
            "resourceType": "Observation",
            "category": [{"coding": [{"code": "laboratory"}]}],
            "specimen": {"reference": "Specimen/1"},
            "code": {"coding": [{"system": "http://loinc.org", "code": "634-6"}]},
            "valueCodeableConcept": {"text": "Staphylococcus aureus"},
        }}),
    );
    let payload = value.to_string();

    let results = engine().classify_fhir(&payload, CorrelationId::new("s6")).await.unwrap();
    let susceptibility = results.iter().find(|r| r.antibiotic.as_deref_eq("Oxacillin")).unwrap();
    assert_eq!(susceptibility.decision, Decision::Resistant);
    assert_eq!(susceptibility.reason, "MRSA override for beta-lactams (except anti-MRSA cephalosporins)");
    assert_eq!(susceptibility.fired_rules, vec!["MRSA-BL-OVR".to_owned()]);
}

#[tokio::test]
async fn s7_method_conflict_with_and_without_precedence() {
    let payload = r#"[
        {"specimen":"S7","organism":"Klebsiella pneumoniae","antibiotic":"Ceftriaxone","method":"MIC","value":{"kind":"Mic","value":0.5}},
        {"specimen":"S7","organism":"Klebsiella pneumoniae","antibiotic":"Ceftriaxone","method":"DISC","value":{"kind":"Disc","value":13}}
    ]"#;

    let results = engine().classify_native(payload, CorrelationId::new("s7a")).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].decision, Decision::Susceptible);
    assert_eq!(results[0].reason, "MIC preferred; disc diffusion disagrees (13 mm => R)");

    let mut catalog = scenario_catalog();
    catalog.policy.method_precedence = None;
    let engine = ClassificationEngine::offline(Arc::new(CatalogStore::from_catalog(catalog)));
    let results = engine.classify_native(payload, CorrelationId::new("s7b")).await.unwrap();
    assert_eq!(results[0].decision, Decision::RequiresReview);
    assert_eq!(results[0].reason, "conflicting methods: MIC=S, DISC=R");
}

#[tokio::test]
async fn s8_hl7_missing_msh_is_an_adapter_error() {
    let message = "OBX|1|NM|MIC^Amoxicillin||4.0";
    let err = engine().classify_hl7v2(message, CorrelationId::new("s8")).await.unwrap_err();
    assert!(matches!(err, amr_vet::errors::AdapterError::MissingMsh));
}

#[tokio::test]
async fn s9_unknown_organism_requires_review() {
    let payload = r#"{
        "specimen": "S9",
        "organism": "Xyzbacter novus",
        "antibiotic": "Ampicillin",
        "method": "MIC",
        "value": {"kind": "Mic", "value": 2.0}
    }"#;
    let results = engine().classify_native(payload, CorrelationId::new("s9")).await.unwrap();
    assert_eq!(results[0].decision, Decision::RequiresReview);
    assert_eq!(results[0].reason, "organism not recognized");
}

trait AntibioticMatch {
    fn as_deref_eq(&self, name: &str) -> bool;
}

impl AntibioticMatch for Option<AntibioticKey> {
    fn as_deref_eq(&self, name: &str) -> bool {
        self.as_ref().map(|a| a.as_str() == name).unwrap_or(false)
    }
}
