use crate::error::PipelineError;
use crate::model::FieldValue;
use lazy_static::lazy_static;
use regex::Regex;

/// Converts a raw status value into a number.
///
/// Percentages become fractions (`"50%"` is `0.5`). Anything else has its
/// unit suffix stripped (`"100sec"` is `100.0`). Values without a leading
/// number are rejected.
pub fn parse_data_value(raw: &str) -> Result<f64, PipelineError> {
    if let Some(percent) = raw.strip_suffix('%') {
        return match percent.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value / 100.0),
            _ => Err(PipelineError::NonNumeric(raw.to_string())),
        };
    }

    numeric_prefix(raw)
        .and_then(|number| number.parse::<f64>().ok())
        .ok_or_else(|| PipelineError::NonNumeric(raw.to_string()))
}

/// Normalizes `raw`, keeping it verbatim as text when it is not numeric.
pub fn normalize(raw: &str, issues: &mut Vec<PipelineError>) -> FieldValue {
    match parse_data_value(raw) {
        Ok(value) => FieldValue::Float(value),
        Err(err) => {
            issues.push(err);
            FieldValue::Text(raw.to_string())
        }
    }
}

lazy_static! {
    static ref NUMERIC_PREFIX: Regex = Regex::new(r"^[+-]?[0-9]+(\.[0-9]+)?").unwrap();
}

/// Returns the `[+-]digits[.digits]` number at the start of `raw`.
fn numeric_prefix(raw: &str) -> Option<&str> {
    NUMERIC_PREFIX.find(raw).map(|found| found.as_str())
}
