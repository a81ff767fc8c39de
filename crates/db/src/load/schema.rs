use std::collections::BTreeMap;

use serde_json::Value;

use crate::load::LoadError;
use shopsync_common::record::Record;

/// Destination column types a payload field can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    BigInt,
    Double,
    Text,
    Jsonb,
}

impl ColumnType {
    pub fn pg_type(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "boolean",
            ColumnType::BigInt => "bigint",
            ColumnType::Double => "double precision",
            ColumnType::Text => "text",
            ColumnType::Jsonb => "jsonb",
        }
    }

    /// Type for a single JSON value; `None` for nulls (no information).
    fn of_value(value: &Value) -> Option<ColumnType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    Some(ColumnType::BigInt)
                } else {
                    Some(ColumnType::Double)
                }
            }
            Value::String(_) => Some(ColumnType::Text),
            Value::Array(_) | Value::Object(_) => Some(ColumnType::Jsonb),
        }
    }

    /// Merge the types of two observations of the same field. Integers
    /// widen to doubles; any other mix is a conflict.
    fn merge(self, other: ColumnType) -> Option<ColumnType> {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => Some(a),
            (BigInt, Double) | (Double, BigInt) => Some(Double),
            _ => None,
        }
    }

    /// Whether a value of this type can land in an existing column of the
    /// given `information_schema` data type.
    pub fn fits_existing(&self, existing_data_type: &str) -> bool {
        let existing = existing_data_type.to_ascii_lowercase();
        if existing == self.pg_type() {
            return true;
        }
        // Integer observations may land in a column already widened.
        matches!(self, ColumnType::BigInt) && existing == "double precision"
    }
}

/// A destination column derived from observed payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub ty: ColumnType,
}

/// Derive the destination columns for a batch of records: the key column
/// first, then every top-level payload field in name order. Fields that are
/// null in every record default to text. Conflicting observations of one
/// field fail the batch.
pub fn infer_fields(
    table: &str,
    key_field: &str,
    key_type: ColumnType,
    records: &[Record],
) -> Result<Vec<FieldDef>, LoadError> {
    let mut observed: BTreeMap<String, Option<ColumnType>> = BTreeMap::new();

    for record in records {
        let Value::Object(map) = &record.payload else {
            continue;
        };
        for (name, value) in map {
            if name == key_field {
                continue;
            }
            let ty = ColumnType::of_value(value);
            match observed.get(name).copied() {
                None => {
                    observed.insert(name.clone(), ty);
                }
                Some(None) => {
                    observed.insert(name.clone(), ty);
                }
                Some(Some(prev)) => {
                    if let Some(ty) = ty {
                        let merged = prev.merge(ty).ok_or_else(|| LoadError::SchemaConflict {
                            table: table.to_string(),
                            column: name.clone(),
                            existing: prev.pg_type().to_string(),
                            incoming: ty.pg_type().to_string(),
                        })?;
                        observed.insert(name.clone(), Some(merged));
                    }
                }
            }
        }
    }

    let mut fields = Vec::with_capacity(observed.len() + 1);
    fields.push(FieldDef {
        name: key_field.to_string(),
        ty: key_type,
    });
    for (name, ty) in observed {
        fields.push(FieldDef {
            name,
            ty: ty.unwrap_or(ColumnType::Text),
        });
    }

    Ok(fields)
}
