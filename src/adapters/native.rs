//! The native adapter: accepts the literal `ClassificationInput` object (or
//! an array of them) and passes it through unchanged. Variant agreement is
//! enforced downstream by [`crate::gating`], not rejected here -- a
//! malformed variant is a `Requires Review` result, not an aborted request.

use crate::errors::AdapterError;
use crate::format::ClassificationInput;

/// Parses `payload` as either a single `ClassificationInput` JSON object or
/// a JSON array of them.
pub fn parse(payload: &str) -> Result<Vec<ClassificationInput>, AdapterError> {
    let value: serde_json::Value = serde_json::from_str(payload).map_err(AdapterError::MalformedJson)?;
    match value {
        serde_json::Value::Array(_) => {
            serde_json::from_value(value).map_err(AdapterError::MalformedJson)
        }
        _ => {
            let single: ClassificationInput = serde_json::from_value(value).map_err(AdapterError::MalformedJson)?;
            Ok(vec![single])
        }
    }
}
