//! Performance data: space separated `label=value[;warn;crit;min;max]` tokens.

use super::values::normalize;
use crate::error::PipelineError;
use crate::model::FieldValue;
use std::collections::BTreeMap;

/// Prefix separating derived performance fields from ordinary block fields.
pub const PERF_DATA_PREFIX: &str = "performance_data";

/// Field name suffix for each position of a `value;warn;crit;min;max` tuple.
const TUPLE_SUFFIXES: [&str; 5] = ["", ".warn", ".crit", ".min", ".max"];

/// Adds one field per performance value found in `raw`.
///
/// Malformed tokens are recorded in `issues` and skipped; the remaining
/// tokens are still parsed.
pub fn parse_perf_data(
    raw: &str,
    fields: &mut BTreeMap<String, FieldValue>,
    issues: &mut Vec<PipelineError>,
) {
    for token in raw.split_ascii_whitespace() {
        let Some((label, value)) = token.split_once('=') else {
            issues.push(PipelineError::NotPerfData(token.to_string()));
            continue;
        };
        if label.is_empty() || value.contains('=') {
            issues.push(PipelineError::NotPerfData(token.to_string()));
            continue;
        }

        let parts: Vec<&str> = value.split(';').collect();
        match parts.len() {
            1 | 4 | 5 => {
                for (position, part) in parts.iter().enumerate() {
                    if part.is_empty() {
                        continue;
                    }
                    let name = format!("{PERF_DATA_PREFIX}.{label}{}", TUPLE_SUFFIXES[position])
                        .to_lowercase();
                    fields.insert(name, normalize(part, issues));
                }
            }
            _ => issues.push(PipelineError::MalformedPerfData(token.to_string())),
        }
    }
}
