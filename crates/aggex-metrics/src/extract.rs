//! Result extraction: one [`ResultRecord`] → one [`Observation`].
//!
//! Values must be 32- or 64-bit integers; floating point is rejected.
//! Label values must be strings.

use thiserror::Error;

use aggex_core::{MetricSpec, ResultRecord, Scalar};

pub type ExtractResult<T> = Result<T, ExtractError>;

/// Why a record could not be turned into an observation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("field {field} not found in result")]
    MissingField { field: String },

    #[error("field {field} must be {expected}, {found} given")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: String,
    },
}

/// A numeric value plus label values in label declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub value: f64,
    pub labels: Vec<String>,
}

/// Extract the value and labels a metric needs from a record.
pub fn extract(record: &ResultRecord, spec: &MetricSpec) -> ExtractResult<Observation> {
    let value = extract_value(record, &spec.value_field)?;
    let labels = extract_labels(record, &spec.label_fields)?;
    Ok(Observation { value, labels })
}

/// Read an integer field as `f64`.
pub fn extract_value(record: &ResultRecord, field: &str) -> ExtractResult<f64> {
    match record.get(field) {
        Some(Scalar::Int32(v)) => Ok(f64::from(*v)),
        Some(Scalar::Int64(v)) => Ok(*v as f64),
        Some(other) => Err(ExtractError::TypeMismatch {
            field: field.to_string(),
            expected: "an integer",
            found: other.type_name().to_string(),
        }),
        None => Err(ExtractError::MissingField {
            field: field.to_string(),
        }),
    }
}

/// Read string label values in the order of `fields`, regardless of
/// their order in the record.
pub fn extract_labels(record: &ResultRecord, fields: &[String]) -> ExtractResult<Vec<String>> {
    fields
        .iter()
        .map(|field| match record.get(field) {
            Some(Scalar::String(v)) => Ok(v.clone()),
            Some(other) => Err(ExtractError::TypeMismatch {
                field: field.clone(),
                expected: "a string",
                found: other.type_name().to_string(),
            }),
            None => Err(ExtractError::MissingField {
                field: field.clone(),
            }),
        })
        .collect()
}
