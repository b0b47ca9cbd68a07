//! The HL7 v2 adapter: parses an ORU^R01-shaped message into
//! [`ClassificationInput`]s. Segments are split positionally using
//! delimiters derived from MSH-1/MSH-2 -- never assuming a fixed
//! carriage-return or line-feed segment separator.

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::{opt, recognize};
use nom::number::complete::double;
use nom::sequence::pair;
use nom::IResult;

use crate::errors::AdapterError;
use crate::format::{AntibioticKey, ClassificationInput, Comparator, Measurement, MethodKind, OrganismKey, SpecimenRef};

struct Delimiters {
    field: char,
    component: char,
}

/// Parses one ORU^R01 message into a set of classification inputs. Organism
/// identifications and phenotype flags are emitted as organism-only/
/// phenotype-only carrier records for [`crate::grouper`] to merge, exactly
/// like the FHIR adapter.
pub fn parse(message: &str) -> Result<Vec<ClassificationInput>, AdapterError> {
    let segments = split_segments(message);
    let msh = segments
        .iter()
        .find(|s| s.starts_with("MSH"))
        .ok_or(AdapterError::MissingMsh)?;
    let delimiters = parse_delimiters(msh)?;

    let mut patient_id = None;
    let mut specimen_id: Option<String> = None;
    let mut inputs = Vec::new();
    let mut specimen_index = 0usize;

    for segment in &segments {
        let fields = split_fields(segment, delimiters.field);
        let Some(&segment_id) = fields.first() else { continue };

        match segment_id {
            "PID" => {
                patient_id = fields.get(3).map(|s| s.to_string());
            }
            "OBR" => {
                if let Some(filler) = fields.get(3) {
                    if !filler.is_empty() {
                        specimen_id = Some(filler.to_string());
                    }
                }
            }
            "SPM" => {
                if let Some(spm_id) = fields.get(2) {
                    if !spm_id.is_empty() {
                        specimen_id = Some(spm_id.to_string());
                    }
                }
            }
            "OBX" => {
                let Some(input) = parse_obx(&fields, delimiters.component, &specimen_id, &patient_id, &mut specimen_index) else {
                    continue;
                };
                inputs.push(input);
            }
            _ => {}
        }
    }

    Ok(inputs)
}

fn split_segments(message: &str) -> Vec<&str> {
    message
        .split(|c| c == '\r' || c == '\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn split_fields(segment: &str, field_sep: char) -> Vec<&str> {
    segment.split(field_sep).collect()
}

fn parse_delimiters(msh: &str) -> Result<Delimiters, AdapterError> {
    let bytes = msh.as_bytes();
    if bytes.len() < 8 || &msh[0..3] != "MSH" {
        return Err(AdapterError::BadDelimiters);
    }
    let field = msh.chars().nth(3).ok_or(AdapterError::BadDelimiters)?;
    let encoding_chars = &msh[4..];
    let component = encoding_chars.chars().next().ok_or(AdapterError::BadDelimiters)?;
    Ok(Delimiters { field, component })
}

fn parse_obx(
    fields: &[&str],
    component_sep: char,
    specimen_id: &Option<String>,
    patient_id: &Option<String>,
    specimen_index: &mut usize,
) -> Option<ClassificationInput> {
    let identifier = fields.get(3)?;
    let raw_value = fields.get(5).copied().unwrap_or("");

    let components: Vec<&str> = identifier.split(component_sep).collect();
    let code = components.first().copied().unwrap_or("");
    let text = components.get(1).copied().unwrap_or("");
    let haystack = format!("{code} {text}").to_uppercase();

    let specimen = match specimen_id {
        Some(id) => SpecimenRef(id.clone()),
        None => SpecimenRef::synthetic(*specimen_index),
    };
    if specimen_id.is_none() {
        *specimen_index += 1;
    }

    let mut auxiliary = crate::format::SortedMap::new();
    if let Some(patient) = patient_id {
        auxiliary.insert("patient-id".to_owned(), patient.clone());
    }

    if haystack.contains("ORG") || haystack.contains("ORGANISM") {
        return Some(ClassificationInput {
            specimen,
            organism: Some(OrganismKey::new(raw_value.trim())),
            antibiotic: None,
            method: MethodKind::Screen,
            value: Measurement::Screen { result: crate::format::ScreenResult::Positive },
            phenotypes: Default::default(),
            auxiliary,
        });
    }

    if haystack.starts_with("MIC") {
        let (value, comparator) = parse_comparator_value(raw_value);
        return Some(ClassificationInput {
            specimen,
            organism: None,
            antibiotic: Some(AntibioticKey::new(text.trim())),
            method: MethodKind::Mic,
            value: Measurement::Mic { value, comparator },
            phenotypes: Default::default(),
            auxiliary,
        });
    }

    if haystack.starts_with("DISC") || haystack.starts_with("DISK") {
        let (value, _comparator) = parse_comparator_value(raw_value);
        return Some(ClassificationInput {
            specimen,
            organism: None,
            antibiotic: Some(AntibioticKey::new(text.trim())),
            method: MethodKind::Disc,
            value: Measurement::Disc { value: value.map(|v| v.round() as i64) },
            phenotypes: Default::default(),
            auxiliary,
        });
    }

    None
}

fn comparator_prefix(input: &str) -> IResult<&str, &str> {
    recognize(alt((tag("<="), tag(">="), tag("<"), tag(">"))))(input)
}

fn comparator_value(input: &str) -> IResult<&str, (Option<&str>, f64)> {
    pair(opt(comparator_prefix), double)(input)
}

/// Parses an OBX-5 value like `<=0.25` or `>32` into the bare numeric value
/// (with the comparator's epsilon crossing applied by
/// [`crate::breakpoints`], not here) and the comparator that was present, so
/// the rationale can still cite it.
fn parse_comparator_value(raw: &str) -> (Option<f64>, Option<Comparator>) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (None, None);
    }
    match comparator_value(trimmed) {
        Ok((_, (prefix, value))) => {
            let comparator = match prefix {
                Some("<=") => Some(Comparator::Le),
                Some(">=") => Some(Comparator::Ge),
                Some("<") => Some(Comparator::Lt),
                Some(">") => Some(Comparator::Gt),
                _ => None,
            };
            (Some(value), comparator)
        }
        Err(_) => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "MSH|^~\\&|LAB|HOSP|EHR|HOSP|20250101120000||ORU^R01|MSG1|P|2.5\rPID|1||PT123\rOBR|1||ORDER1\rSPM|1|SPEC1\rOBX|1|ST|ORG^Organism Identified||Escherichia coli||||||F\rOBX|2|NM|MIC^Amoxicillin||<=0.25||||||F\r";

    #[test]
    fn parses_organism_and_mic_observations() {
        let inputs = parse(SAMPLE).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].organism, Some(OrganismKey::new("Escherichia coli")));
        assert_eq!(inputs[1].antibiotic, Some(AntibioticKey::new("Amoxicillin")));
        match &inputs[1].value {
            Measurement::Mic { value, comparator } => {
                assert_eq!(*value, Some(0.25));
                assert_eq!(*comparator, Some(Comparator::Le));
            }
            other => panic!("expected MIC, got {other:?}"),
        }
    }

    #[test]
    fn missing_msh_is_an_adapter_error() {
        let err = parse("OBX|1|NM|MIC^Amoxicillin||4.0").unwrap_err();
        assert!(matches!(err, AdapterError::MissingMsh));
    }

    #[test]
    fn missing_obx_segments_yield_empty_results() {
        let message = "MSH|^~\\&|LAB|HOSP|EHR|HOSP|20250101||ORU^R01|1|P|2.5\r";
        let inputs = parse(message).unwrap();
        assert!(inputs.is_empty());
    }

    #[test]
    fn tolerates_line_feed_segment_separators() {
        let message = SAMPLE.replace('\r', "\n");
        let inputs = parse(&message).unwrap();
        assert_eq!(inputs.len(), 2);
    }
}
