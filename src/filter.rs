//! Filter compiler for plain contact columns.
//!
//! The comparison logic here is shared with JSON paths and timeline metadata: callers
//! work out the SQL expression being filtered (a column, a cast JSON path, a metadata
//! key) and hand it to [`compile_comparison`] together with the value type.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sea_query::Value;

use crate::ast::{ContactCondition, DimensionFilter};
use crate::error::{CompileError, Result};
use crate::registry::{FieldType, Operator, OperatorSpec};
use crate::sql_compiler::{Fragment, SegmentCompiler};

impl SegmentCompiler {
    /// AND together all filters of a contact condition.
    pub(crate) fn compile_contact_condition(
        &self,
        condition: &ContactCondition,
        arg_index: usize,
    ) -> Result<Fragment> {
        let mut index = arg_index;
        let mut parts = Vec::with_capacity(condition.filters.len());
        for filter in &condition.filters {
            let fragment = self.compile_contact_filter(filter, index)?;
            index = fragment.next_index;
            parts.push(fragment);
        }
        Ok(Fragment::conjunction(parts, index))
    }

    fn compile_contact_filter(&self, filter: &DimensionFilter, arg_index: usize) -> Result<Fragment> {
        let field = self.registry().field(&filter.field_name)?;
        if field.field_type == FieldType::Json {
            return self.compile_json_filter(&field.column, filter, arg_index);
        }

        let op = self.registry().operator(&filter.operator)?;
        ensure_supported(filter, op, field.field_type)?;
        compile_comparison(&field.column, field.field_type, op, filter, arg_index)
    }
}

/// Fail unless `op` can be applied to a value of `field_type`.
pub(crate) fn ensure_supported(
    filter: &DimensionFilter,
    op: &OperatorSpec,
    field_type: FieldType,
) -> Result<()> {
    if op.operator.supports(field_type) {
        Ok(())
    } else {
        Err(CompileError::UnsupportedOperator {
            field: filter.field_name.clone(),
            operator: filter.operator.clone(),
            field_type,
        })
    }
}

/// Build the predicate for `target <op> values`.
///
/// `target` must already be safe SQL text; only the filter's values are bound.
pub(crate) fn compile_comparison(
    target: &str,
    value_type: FieldType,
    op: &OperatorSpec,
    filter: &DimensionFilter,
    arg_index: usize,
) -> Result<Fragment> {
    if !op.requires_value {
        return Ok(Fragment::atom(format!("{} {}", target, op.sql), Vec::new(), arg_index));
    }

    match op.operator {
        Operator::InTheLastDays => {
            expect_count(filter, filter.string_values.len(), 1)?;
            let days = parse_days(&filter.field_name, &filter.string_values[0])?;
            Ok(Fragment::atom(
                format!("{} > NOW() - INTERVAL '{} days'", target, days),
                Vec::new(),
                arg_index,
            ))
        }
        Operator::Contains | Operator::NotContains => {
            expect_some(filter, filter.string_values.len())?;
            let patterns = filter
                .string_values
                .iter()
                .map(|v| Value::from(format!("%{}%", v)))
                .collect();
            Ok(any_of(target, op.sql, patterns, arg_index))
        }
        Operator::InDateRange | Operator::NotInDateRange => {
            let values = extract_values(filter, value_type)?;
            expect_count(filter, values.len(), 2)?;
            Ok(Fragment::atom(
                format!("{} {} ${} AND ${}", target, op.sql, arg_index, arg_index + 1),
                values,
                arg_index + 2,
            ))
        }
        _ => {
            let values = extract_values(filter, value_type)?;
            expect_count(filter, values.len(), 1)?;
            Ok(Fragment::atom(
                format!("{} {} ${}", target, op.sql, arg_index),
                values,
                arg_index + 1,
            ))
        }
    }
}

/// One predicate per value, OR-ed together and parenthesized when there is more
/// than one, so the group composes safely with sibling predicates.
pub(crate) fn any_of(target: &str, sql_op: &str, values: Vec<Value>, arg_index: usize) -> Fragment {
    let mut predicates: Vec<String> = (0..values.len())
        .map(|offset| format!("{} {} ${}", target, sql_op, arg_index + offset))
        .collect();
    let next_index = arg_index + values.len();

    if predicates.len() == 1 {
        Fragment::atom(predicates.remove(0), values, next_index)
    } else {
        Fragment::group(format!("({})", predicates.join(" OR ")), values, next_index)
    }
}

/// Typed bind values for a filter
fn extract_values(filter: &DimensionFilter, value_type: FieldType) -> Result<Vec<Value>> {
    match value_type {
        FieldType::String | FieldType::Json => Ok(filter
            .string_values
            .iter()
            .map(|v| Value::from(v.clone()))
            .collect()),
        FieldType::Number => Ok(filter.number_values.iter().map(|&n| Value::from(n)).collect()),
        FieldType::Time => filter
            .string_values
            .iter()
            .map(|v| parse_time(&filter.field_name, v).map(Value::from))
            .collect(),
    }
}

fn expect_some(filter: &DimensionFilter, found: usize) -> Result<()> {
    if found == 0 {
        return Err(CompileError::MissingValue {
            field: filter.field_name.clone(),
            operator: filter.operator.clone(),
        });
    }
    Ok(())
}

fn expect_count(filter: &DimensionFilter, found: usize, expected: usize) -> Result<()> {
    expect_some(filter, found)?;
    if found != expected {
        return Err(CompileError::ValueCount {
            field: filter.field_name.clone(),
            operator: filter.operator.clone(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Parse an RFC 3339 timestamp, a zone-less ISO 8601 date-time (taken as UTC) or a
/// plain `YYYY-MM-DD` date (midnight UTC).
pub(crate) fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&t));
    }
    if let Some(t) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(Utc.from_utc_datetime(&t));
    }

    Err(CompileError::InvalidTime {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Strictly parse a day count. Only ASCII digits are accepted, since the result is
/// formatted straight into an interval literal.
pub(crate) fn parse_days(field: &str, value: &str) -> Result<u32> {
    let invalid = || CompileError::InvalidDays {
        field: field.to_string(),
        value: value.to_string(),
    };

    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    value.parse::<u32>().map_err(|_| invalid())
}
