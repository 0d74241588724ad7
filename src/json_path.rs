//! JSON path compiler for `custom_json_*` columns.
//!
//! Paths use PostgreSQL jsonb subscripting: `col['key'][0]['other']`. Numeric segments
//! become array indexes, everything else becomes a quoted object key.

use sea_query::Value;

use crate::ast::DimensionFilter;
use crate::error::{CompileError, Result};
use crate::filter::{any_of, compile_comparison, ensure_supported};
use crate::registry::{FieldType, Operator};
use crate::sql_compiler::{Fragment, SegmentCompiler};

impl SegmentCompiler {
    pub(crate) fn compile_json_filter(
        &self,
        column: &str,
        filter: &DimensionFilter,
        arg_index: usize,
    ) -> Result<Fragment> {
        let op = self.registry().operator(&filter.operator)?;

        match op.operator {
            Operator::IsSet | Operator::IsNotSet => {
                Ok(compile_key_exists(column, filter, op.operator, op.sql, arg_index))
            }
            Operator::InArray => {
                if filter.string_values.is_empty() {
                    return Err(CompileError::MissingValue {
                        field: filter.field_name.clone(),
                        operator: filter.operator.clone(),
                    });
                }
                let path = build_path(column, &filter.json_path);
                let values = filter
                    .string_values
                    .iter()
                    .map(|v| Value::from(v.clone()))
                    .collect();
                Ok(any_of(&path, op.sql, values, arg_index))
            }
            _ => {
                ensure_supported(filter, op, filter.field_type)?;
                let path = build_path(column, &filter.json_path);
                let target = cast_path(&path, filter.field_type);
                let value_type = match filter.field_type {
                    FieldType::Json => FieldType::String,
                    other => other,
                };
                compile_comparison(&target, value_type, op, filter, arg_index)
            }
        }
    }
}

/// `is_set`/`is_not_set`: without a path test the whole column, with a path test
/// whether the parent object has the last key.
fn compile_key_exists(
    column: &str,
    filter: &DimensionFilter,
    operator: Operator,
    null_check: &str,
    arg_index: usize,
) -> Fragment {
    match filter.json_path.split_last() {
        None => Fragment::atom(format!("{} {}", column, null_check), Vec::new(), arg_index),
        Some((key, parents)) => {
            let has_key = format!("{} ? ${}", build_path(column, parents), arg_index);
            let sql = if operator == Operator::IsSet {
                has_key
            } else {
                format!("NOT ({})", has_key)
            };
            Fragment::atom(sql, vec![Value::from(key.clone())], arg_index + 1)
        }
    }
}

/// Subscript path from `column` through every segment
pub fn build_path(column: &str, segments: &[String]) -> String {
    let mut path = String::from(column);
    for segment in segments {
        match array_index(segment) {
            Some(index) => path.push_str(&format!("[{}]", index)),
            None => path.push_str(&format!("['{}']", escape_key(segment))),
        }
    }
    path
}

/// A segment made only of digits is an array index
fn array_index(segment: &str) -> Option<u64> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// Double single quotes so the key can sit inside a SQL string literal
pub fn escape_key(key: &str) -> String {
    key.replace('\'', "''")
}

/// Extract the path as text, casting further for number and time comparisons
fn cast_path(path: &str, field_type: FieldType) -> String {
    match field_type {
        FieldType::String | FieldType::Json => format!("{}::text", path),
        FieldType::Number => format!("({}::text)::numeric", path),
        FieldType::Time => format!("({}::text)::timestamptz", path),
    }
}
