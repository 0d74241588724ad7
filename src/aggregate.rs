//! Correlated subqueries for list membership, timeline event counts and custom event
//! goal aggregates.

use sea_query::Value;

use crate::ast::{
    AggregateOperator, ContactListCondition, ContactTimelineCondition, CustomEventsGoalCondition,
    DimensionFilter, GoalOperator, ListOperator, TimeframeOperator, ANY_GOAL_TYPE, GOAL_TYPES,
};
use crate::error::{CompileError, Result};
use crate::filter::{compile_comparison, ensure_supported, parse_days, parse_time};
use crate::json_path::escape_key;
use crate::registry::{FieldType, Operator};
use crate::sql_compiler::{Fragment, SegmentCompiler};

impl SegmentCompiler {
    /// `[NOT] EXISTS (...)` over the contact's list subscriptions
    pub(crate) fn compile_list_membership(
        &self,
        condition: &ContactListCondition,
        arg_index: usize,
    ) -> Result<Fragment> {
        if condition.list_id.is_empty() {
            return Err(CompileError::MissingListId);
        }

        let mut index = arg_index;
        let mut args = vec![Value::from(condition.list_id.clone())];
        let mut sql = format!(
            "EXISTS (SELECT 1 FROM contact_lists cl JOIN lists l ON cl.list_id = l.id \
             WHERE cl.email = contacts.email AND cl.list_id = ${}",
            index
        );
        index += 1;

        if let Some(status) = condition.status.as_deref().filter(|s| !s.is_empty()) {
            sql.push_str(&format!(" AND cl.status = ${}", index));
            args.push(Value::from(status));
            index += 1;
        }
        sql.push_str(" AND l.deleted_at IS NULL)");

        if condition.operator == ListOperator::NotIn {
            sql.insert_str(0, "NOT ");
        }
        Ok(Fragment::atom(sql, args, index))
    }

    /// `(SELECT COUNT(*) ...) <cmp> $n` over the contact's timeline events
    pub(crate) fn compile_timeline_condition(
        &self,
        condition: &ContactTimelineCondition,
        arg_index: usize,
    ) -> Result<Fragment> {
        if condition.kind.is_empty() {
            return Err(CompileError::MissingTimelineKind);
        }
        let count_operator = condition
            .count_operator
            .ok_or(CompileError::MissingCountOperator)?;
        if condition.count_value < 0 {
            return Err(CompileError::NegativeCount(condition.count_value));
        }

        let mut index = arg_index;
        let mut args = vec![Value::from(condition.kind.clone())];
        let mut sql = format!(
            "(SELECT COUNT(*) FROM contact_timeline ct \
             WHERE ct.email = contacts.email AND ct.kind = ${}",
            index
        );
        index += 1;

        let timeframe = compile_timeframe(
            "ct.created_at",
            condition.timeframe_operator,
            &condition.timeframe_values,
            index,
        )?;
        index = push_and(&mut sql, &mut args, timeframe);

        for filter in &condition.filters {
            let fragment = self.compile_metadata_filter(filter, index)?;
            index = push_and(&mut sql, &mut args, fragment);
        }

        sql.push_str(&format!(") {} ${}", count_operator.sql(), index));
        args.push(Value::from(condition.count_value));
        index += 1;

        Ok(Fragment::atom(sql, args, index))
    }

    /// Filter on one key of the timeline event's metadata
    fn compile_metadata_filter(&self, filter: &DimensionFilter, arg_index: usize) -> Result<Fragment> {
        let op = self.registry().operator(&filter.operator)?;
        if op.operator == Operator::InArray {
            return Err(CompileError::UnsupportedOperator {
                field: filter.field_name.clone(),
                operator: filter.operator.clone(),
                field_type: filter.field_type,
            });
        }
        ensure_supported(filter, op, filter.field_type)?;

        let key = format!("ct.metadata->>'{}'", escape_key(&filter.field_name));
        let (target, value_type) = match filter.field_type {
            FieldType::Number => (format!("({})::numeric", key), FieldType::Number),
            FieldType::Time => (format!("({})::timestamptz", key), FieldType::Time),
            FieldType::String | FieldType::Json => (key, FieldType::String),
        };
        compile_comparison(&target, value_type, op, filter, arg_index)
    }

    /// `EXISTS (... GROUP BY ce.email HAVING <aggregate> <cmp> ...)` over custom events
    pub(crate) fn compile_goal_condition(
        &self,
        condition: &CustomEventsGoalCondition,
        arg_index: usize,
    ) -> Result<Fragment> {
        let mut index = arg_index;
        let mut args = Vec::new();
        let mut sql = String::from(
            "EXISTS (SELECT 1 FROM custom_events ce \
             WHERE ce.email = contacts.email AND ce.deleted_at IS NULL",
        );

        if condition.goal_type == ANY_GOAL_TYPE {
            sql.push_str(" AND ce.goal_type IS NOT NULL");
        } else if GOAL_TYPES.contains(&condition.goal_type.as_str()) {
            sql.push_str(&format!(" AND ce.goal_type = ${}", index));
            args.push(Value::from(condition.goal_type.clone()));
            index += 1;
        } else {
            return Err(CompileError::InvalidGoalType(condition.goal_type.clone()));
        }

        if let Some(name) = condition.goal_name.as_deref().filter(|n| !n.is_empty()) {
            sql.push_str(&format!(" AND ce.goal_name = ${}", index));
            args.push(Value::from(name));
            index += 1;
        }

        let timeframe = compile_timeframe(
            "ce.occurred_at",
            condition.timeframe_operator,
            &condition.timeframe_values,
            index,
        )?;
        index = push_and(&mut sql, &mut args, timeframe);

        sql.push_str(" GROUP BY ce.email HAVING ");
        sql.push_str(aggregate_expr(condition.aggregate_operator));

        let op = condition.operator;
        match op {
            GoalOperator::Between => {
                let upper = condition.value_2.ok_or(CompileError::MissingBetweenBound)?;
                sql.push_str(&format!(" {} ${} AND ${}", op.sql(), index, index + 1));
                args.push(Value::from(condition.value));
                args.push(Value::from(upper));
                index += 2;
            }
            GoalOperator::Gte | GoalOperator::Lte | GoalOperator::Eq => {
                sql.push_str(&format!(" {} ${}", op.sql(), index));
                args.push(Value::from(condition.value));
                index += 1;
            }
        }
        sql.push(')');

        Ok(Fragment::atom(sql, args, index))
    }
}

fn aggregate_expr(operator: AggregateOperator) -> &'static str {
    match operator {
        AggregateOperator::Sum => "COALESCE(SUM(ce.goal_value), 0)",
        AggregateOperator::Count => "COUNT(*)",
        AggregateOperator::Avg => "COALESCE(AVG(ce.goal_value), 0)",
        AggregateOperator::Min => "MIN(ce.goal_value)",
        AggregateOperator::Max => "MAX(ce.goal_value)",
    }
}

/// Append ` AND <fragment>` when the fragment is non-empty; returns the next index.
fn push_and(sql: &mut String, args: &mut Vec<Value>, fragment: Fragment) -> usize {
    if !fragment.is_empty() {
        sql.push_str(" AND ");
        sql.push_str(&fragment.sql);
        args.extend(fragment.args);
    }
    fragment.next_index
}

/// Time window predicate on `column`, shared by timeline and goal conditions.
///
/// `in_the_last_days` is rendered as an interval literal from a strictly parsed
/// integer; PostgreSQL does not bind parameters inside `INTERVAL '...'`.
pub(crate) fn compile_timeframe(
    column: &str,
    operator: Option<TimeframeOperator>,
    values: &[String],
    arg_index: usize,
) -> Result<Fragment> {
    let operator = match operator {
        None | Some(TimeframeOperator::Anytime) => return Ok(Fragment::empty(arg_index)),
        Some(operator) => operator,
    };

    let expected = if operator == TimeframeOperator::InDateRange { 2 } else { 1 };
    if values.len() != expected {
        return Err(if values.is_empty() {
            CompileError::MissingValue {
                field: column.to_string(),
                operator: operator.as_str().to_string(),
            }
        } else {
            CompileError::ValueCount {
                field: column.to_string(),
                operator: operator.as_str().to_string(),
                expected,
                found: values.len(),
            }
        });
    }

    let fragment = match operator {
        TimeframeOperator::InDateRange => {
            let from = parse_time(column, &values[0])?;
            let to = parse_time(column, &values[1])?;
            Fragment::atom(
                format!("{} BETWEEN ${} AND ${}", column, arg_index, arg_index + 1),
                vec![Value::from(from), Value::from(to)],
                arg_index + 2,
            )
        }
        TimeframeOperator::BeforeDate | TimeframeOperator::AfterDate => {
            let cmp = if operator == TimeframeOperator::BeforeDate { "<" } else { ">" };
            let at = parse_time(column, &values[0])?;
            Fragment::atom(
                format!("{} {} ${}", column, cmp, arg_index),
                vec![Value::from(at)],
                arg_index + 1,
            )
        }
        TimeframeOperator::InTheLastDays => {
            let days = parse_days(column, &values[0])?;
            Fragment::atom(
                format!("{} > NOW() - INTERVAL '{} days'", column, days),
                Vec::new(),
                arg_index,
            )
        }
        TimeframeOperator::Anytime => Fragment::empty(arg_index),
    };
    Ok(fragment)
}
