//! Auto-detection of the input format from a raw payload. A separate pure
//! function over the bytes, independent of any declared content type --
//! the transport collaborator may use the declared content type as a hint,
//! but this function is the ground truth when it's absent or ambiguous.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Fhir,
    Hl7v2,
    Native,
}

/// Examines the first non-whitespace bytes of `payload`: `{` together with
/// a `"resourceType"` key anywhere in the document is FHIR; an `MSH` prefix
/// is HL7 v2; anything else is treated as Native.
pub fn detect_format(payload: &[u8]) -> InputFormat {
    let trimmed = trim_leading_whitespace(payload);

    if trimmed.starts_with(b"MSH") {
        return InputFormat::Hl7v2;
    }

    if trimmed.starts_with(b"{") && contains_resource_type(payload) {
        return InputFormat::Fhir;
    }

    InputFormat::Native
}

fn trim_leading_whitespace(payload: &[u8]) -> &[u8] {
    let start = payload.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(payload.len());
    &payload[start..]
}

fn contains_resource_type(payload: &[u8]) -> bool {
    const NEEDLE: &[u8] = b"\"resourceType\"";
    payload.windows(NEEDLE.len()).any(|w| w == NEEDLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_fhir_from_resource_type() {
        let payload = br#"{"resourceType":"Bundle","entry":[]}"#;
        assert_eq!(detect_format(payload), InputFormat::Fhir);
    }

    #[test]
    fn detects_hl7v2_from_msh_prefix() {
        let payload = b"MSH|^~\\&|LAB|HOSP|EHR|HOSP|20250101||ORU^R01|1|P|2.5\r";
        assert_eq!(detect_format(payload), InputFormat::Hl7v2);
    }

    #[test]
    fn falls_back_to_native() {
        let payload = br#"{"specimen":"S1","method":"MIC"}"#;
        assert_eq!(detect_format(payload), InputFormat::Native);
    }

    #[test]
    fn tolerates_leading_whitespace() {
        let payload = b"  \n\t{\"resourceType\":\"Observation\"}";
        assert_eq!(detect_format(payload), InputFormat::Fhir);
    }
}
