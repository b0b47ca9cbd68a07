//! The FHIR R4 adapter: reads Bundles, Observation arrays, or single
//! Observations as plain `serde_json::Value` trees rather than generated
//! resource bindings -- profile conformance beyond what classification
//! requires is explicitly out of scope, so a thin structural reader is all
//! this needs.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::errors::AdapterError;
use crate::format::{AntibioticKey, ClassificationInput, Measurement, MethodKind, OrganismKey, PhenotypeFlag, ScreenResult, SortedMap, SpecimenRef};

const LOINC: &str = "http://loinc.org";
const ORGANISM_IDENTIFIED_CODE: &str = "634-6";

/// Parses `payload` -- a Bundle, an array of Observations, or a single
/// Observation -- into classification inputs. Organism identifications and
/// phenotype detections become organism-only/phenotype-only carrier records
/// for [`crate::grouper`] to merge into sibling susceptibility inputs.
pub fn parse(payload: &str) -> Result<Vec<ClassificationInput>, AdapterError> {
    let value: Value = serde_json::from_str(payload).map_err(AdapterError::MalformedJson)?;
    let observations = collect_observations(&value)?;

    let mut organism_by_ref: HashMap<String, OrganismKey> = HashMap::new();
    for obs in &observations {
        if is_organism_identification(obs) {
            if let (Some(specimen_ref), Some(organism)) = (specimen_reference(obs), organism_from_observation(obs)) {
                organism_by_ref.insert(specimen_ref, organism);
            }
        }
    }

    let mut inputs = Vec::new();
    for (index, obs) in observations.iter().enumerate() {
        if !is_laboratory_category(obs) {
            warn!(index, "ignoring non-laboratory FHIR Observation");
            continue;
        }

        if is_organism_identification(obs) {
            let specimen = specimen_ref_or_synthetic(obs, index);
            if let Some(organism) = organism_from_observation(obs) {
                inputs.push(ClassificationInput {
                    specimen,
                    organism: Some(organism),
                    antibiotic: None,
                    method: MethodKind::Screen,
                    value: Measurement::Screen { result: ScreenResult::Positive },
                    phenotypes: Default::default(),
                    auxiliary: Default::default(),
                });
            }
            continue;
        }

        if let Some(flag) = phenotype_flag(obs) {
            let specimen = specimen_ref_or_synthetic(obs, index);
            inputs.push(ClassificationInput {
                specimen,
                organism: None,
                antibiotic: None,
                method: MethodKind::Phenotype,
                value: Measurement::Phenotype { flag },
                phenotypes: Default::default(),
                auxiliary: Default::default(),
            });
            continue;
        }

        if let Some((method, antibiotic)) = susceptibility_identity(obs) {
            let specimen = specimen_ref_or_synthetic(obs, index);
            let organism = linked_organism(obs, &organism_by_ref);
            let value = quantity_value(obs);
            let measurement = match method {
                MethodKind::Mic | MethodKind::Gradient => Measurement::Mic { value, comparator: None },
                MethodKind::Disc => Measurement::Disc { value: value.map(|v| v.round() as i64) },
                _ => continue,
            };
            let mut auxiliary: SortedMap<String, String> = SortedMap::new();
            if let Some(id) = obs.get("id").and_then(Value::as_str) {
                auxiliary.insert("fhir-observation-id".to_owned(), id.to_owned());
            }
            inputs.push(ClassificationInput {
                specimen,
                organism,
                antibiotic: Some(antibiotic),
                method,
                value: measurement,
                phenotypes: Default::default(),
                auxiliary,
            });
        }
    }

    Ok(inputs)
}

fn collect_observations(value: &Value) -> Result<Vec<Value>, AdapterError> {
    match value.get("resourceType").and_then(Value::as_str) {
        Some("Bundle") => {
            let entries = value
                .get("entry")
                .and_then(Value::as_array)
                .ok_or(AdapterError::MissingField("entry"))?;
            Ok(entries
                .iter()
                .filter_map(|e| e.get("resource").cloned())
                .filter(|r| r.get("resourceType").and_then(Value::as_str) == Some("Observation"))
                .collect())
        }
        Some("Observation") => Ok(vec![value.clone()]),
        None if value.is_array() => Ok(value.as_array().unwrap().clone()),
        _ => Err(AdapterError::MissingField("resourceType")),
    }
}

fn is_laboratory_category(obs: &Value) -> bool {
    let Some(categories) = obs.get("category").and_then(Value::as_array) else {
        return false;
    };
    categories.iter().any(|cat| {
        cat.get("coding")
            .and_then(Value::as_array)
            .map(|codings| codings.iter().any(|c| c.get("code").and_then(Value::as_str) == Some("laboratory")))
            .unwrap_or(false)
    })
}

fn is_organism_identification(obs: &Value) -> bool {
    if code_has(obs, LOINC, ORGANISM_IDENTIFIED_CODE) {
        return true;
    }
    code_text(obs).map(|t| t.to_lowercase().contains("organism identified")).unwrap_or(false)
}

fn code_has(obs: &Value, system: &str, code: &str) -> bool {
    obs.get("code")
        .and_then(|c| c.get("coding"))
        .and_then(Value::as_array)
        .map(|codings| {
            codings
                .iter()
                .any(|c| c.get("system").and_then(Value::as_str) == Some(system) && c.get("code").and_then(Value::as_str) == Some(code))
        })
        .unwrap_or(false)
}

fn code_text(obs: &Value) -> Option<&str> {
    obs.get("code").and_then(|c| c.get("text")).and_then(Value::as_str)
}

fn organism_from_observation(obs: &Value) -> Option<OrganismKey> {
    let concept = obs.get("valueCodeableConcept")?;
    if let Some(text) = concept.get("text").and_then(Value::as_str) {
        return Some(OrganismKey::new(text));
    }
    concept
        .get("coding")
        .and_then(Value::as_array)
        .and_then(|codings| codings.first())
        .and_then(|c| c.get("display"))
        .and_then(Value::as_str)
        .map(OrganismKey::new)
}

fn phenotype_flag(obs: &Value) -> Option<PhenotypeFlag> {
    let text = code_text(obs)?.to_lowercase();
    let positive = observation_interpretation_positive(obs);

    if text.contains("esbl") && positive {
        return Some(PhenotypeFlag::Esbl);
    }
    if text.contains("cefoxitin") && positive {
        return Some(PhenotypeFlag::Mrsa);
    }
    if text.contains("carbapenemase") && positive {
        return Some(PhenotypeFlag::Carbapenemase(None));
    }
    if text.contains("inducible clindamycin") || text.contains("d-test") {
        if positive {
            return Some(PhenotypeFlag::InducibleClinda);
        }
    }
    None
}

fn observation_interpretation_positive(obs: &Value) -> bool {
    if let Some(value_str) = obs.get("valueString").and_then(Value::as_str) {
        return value_str.eq_ignore_ascii_case("positive");
    }
    obs.get("interpretation")
        .and_then(Value::as_array)
        .map(|interps| {
            interps.iter().any(|i| {
                i.get("coding")
                    .and_then(Value::as_array)
                    .map(|codings| codings.iter().any(|c| c.get("code").and_then(Value::as_str) == Some("POS")))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

fn susceptibility_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(?P<antibiotic>.+?)\s*\[Susceptibility\]\s*by\s*(MIC|disk diffusion)$").unwrap())
}

fn susceptibility_identity(obs: &Value) -> Option<(MethodKind, AntibioticKey)> {
    let method_text = obs.get("method").and_then(|m| m.get("text")).and_then(Value::as_str).map(str::to_lowercase);
    let text = code_text(obs);

    if let Some(text) = text {
        if let Some(caps) = susceptibility_pattern().captures(text) {
            let antibiotic = caps.name("antibiotic").unwrap().as_str().trim();
            let method = if text.to_lowercase().contains("disk diffusion") {
                MethodKind::Disc
            } else {
                MethodKind::Mic
            };
            return Some((method, AntibioticKey::new(antibiotic)));
        }
    }

    let method = match method_text.as_deref() {
        Some(m) if m.contains("mic") => Some(MethodKind::Mic),
        Some(m) if m.contains("disk") || m.contains("disc") => Some(MethodKind::Disc),
        _ => None,
    }?;

    let antibiotic = component_antibiotic(obs).or_else(|| text.map(str::to_owned))?;
    Some((method, AntibioticKey::new(antibiotic)))
}

fn component_antibiotic(obs: &Value) -> Option<String> {
    obs.get("component")
        .and_then(Value::as_array)
        .and_then(|comps| comps.first())
        .and_then(|c| c.get("code"))
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn quantity_value(obs: &Value) -> Option<f64> {
    let quantity = obs.get("valueQuantity")?;
    let value = quantity.get("value").and_then(Value::as_f64)?;
    let unit = quantity.get("unit").and_then(Value::as_str).unwrap_or("");
    match unit.to_lowercase().as_str() {
        "mg/l" | "mm" => Some(value),
        _ => Some(value),
    }
}

fn specimen_reference(obs: &Value) -> Option<String> {
    obs.get("specimen")
        .and_then(|s| s.get("reference"))
        .and_then(Value::as_str)
        .or_else(|| obs.get("subject").and_then(|s| s.get("reference")).and_then(Value::as_str))
        .map(str::to_owned)
}

fn linked_organism(obs: &Value, organism_by_ref: &HashMap<String, OrganismKey>) -> Option<OrganismKey> {
    for field in ["derivedFrom", "hasMember"] {
        if let Some(refs) = obs.get(field).and_then(Value::as_array) {
            for r in refs {
                if let Some(reference) = r.get("reference").and_then(Value::as_str) {
                    if let Some(organism) = organism_by_ref.get(reference) {
                        return Some(organism.clone());
                    }
                }
            }
        }
    }
    let specimen_ref = specimen_reference(obs)?;
    organism_by_ref.get(&specimen_ref).cloned()
}

fn specimen_ref_or_synthetic(obs: &Value, index: usize) -> SpecimenRef {
    specimen_reference(obs).map(SpecimenRef).unwrap_or_else(|| SpecimenRef::synthetic(index))
}
