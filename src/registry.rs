//! Whitelist of contact fields and filter operators.
//!
//! Every column name and operator fragment that ends up in compiled SQL text comes
//! out of a [`Registry`]. The registry is built once and only read afterwards, so a
//! single instance can be shared freely between threads.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{CompileError, ConfigError, Result};

/// Value type of a contact field, or the declared type of a value inside a JSON field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    String,
    Number,
    Time,
    Json,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Time => "time",
            FieldType::Json => "json",
        };
        f.write_str(name)
    }
}

/// Where an allowed field lives and what it holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub column: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldSpec {
    pub fn new(column: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            column: column.into(),
            field_type,
        }
    }
}

/// Dimension filter operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    NotEquals,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    IsSet,
    IsNotSet,
    InDateRange,
    NotInDateRange,
    BeforeDate,
    AfterDate,
    InTheLastDays,
    InArray,
}

impl Operator {
    pub const ALL: [Operator; 16] = [
        Operator::Equals,
        Operator::NotEquals,
        Operator::Gt,
        Operator::Gte,
        Operator::Lt,
        Operator::Lte,
        Operator::Contains,
        Operator::NotContains,
        Operator::IsSet,
        Operator::IsNotSet,
        Operator::InDateRange,
        Operator::NotInDateRange,
        Operator::BeforeDate,
        Operator::AfterDate,
        Operator::InTheLastDays,
        Operator::InArray,
    ];

    /// The token used for this operator in segment trees
    pub fn token(self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::IsSet => "is_set",
            Operator::IsNotSet => "is_not_set",
            Operator::InDateRange => "in_date_range",
            Operator::NotInDateRange => "not_in_date_range",
            Operator::BeforeDate => "before_date",
            Operator::AfterDate => "after_date",
            Operator::InTheLastDays => "in_the_last_days",
            Operator::InArray => "in_array",
        }
    }

    fn sql(self) -> &'static str {
        match self {
            Operator::Equals => "=",
            Operator::NotEquals => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Contains => "ILIKE",
            Operator::NotContains => "NOT ILIKE",
            Operator::IsSet => "IS NOT NULL",
            Operator::IsNotSet => "IS NULL",
            Operator::InDateRange => "BETWEEN",
            Operator::NotInDateRange => "NOT BETWEEN",
            Operator::BeforeDate => "<",
            Operator::AfterDate => ">",
            Operator::InTheLastDays => ">",
            Operator::InArray => "?",
        }
    }

    /// Whether the operator can be applied to a value of the given type.
    ///
    /// `in_array` is accepted for `Json` only; the JSON path compiler checks it
    /// against the column type rather than the declared value type.
    pub fn supports(self, field_type: FieldType) -> bool {
        match self {
            Operator::Contains | Operator::NotContains => {
                matches!(field_type, FieldType::String | FieldType::Json)
            }
            Operator::InDateRange
            | Operator::NotInDateRange
            | Operator::BeforeDate
            | Operator::AfterDate
            | Operator::InTheLastDays => field_type == FieldType::Time,
            Operator::InArray => field_type == FieldType::Json,
            _ => true,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// SQL rendering of an allowed operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorSpec {
    pub operator: Operator,
    pub sql: &'static str,
    pub requires_value: bool,
}

const STRING_FIELDS: &[&str] = &[
    "email",
    "external_id",
    "timezone",
    "language",
    "first_name",
    "last_name",
    "full_name",
    "phone",
    "address_line_1",
    "address_line_2",
    "country",
    "postcode",
    "state",
    "job_title",
    "custom_string_1",
    "custom_string_2",
    "custom_string_3",
    "custom_string_4",
    "custom_string_5",
];

const NUMBER_FIELDS: &[&str] = &[
    "custom_number_1",
    "custom_number_2",
    "custom_number_3",
    "custom_number_4",
    "custom_number_5",
];

const TIME_FIELDS: &[&str] = &[
    "created_at",
    "updated_at",
    "custom_datetime_1",
    "custom_datetime_2",
    "custom_datetime_3",
    "custom_datetime_4",
    "custom_datetime_5",
];

const JSON_FIELDS: &[&str] = &[
    "custom_json_1",
    "custom_json_2",
    "custom_json_3",
    "custom_json_4",
    "custom_json_5",
];

/// Immutable field and operator whitelist
#[derive(Debug, Clone)]
pub struct Registry {
    fields: HashMap<String, FieldSpec>,
    operators: HashMap<&'static str, OperatorSpec>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry with every built-in contact column and operator
    pub fn new() -> Self {
        let families = [
            (STRING_FIELDS, FieldType::String),
            (NUMBER_FIELDS, FieldType::Number),
            (TIME_FIELDS, FieldType::Time),
            (JSON_FIELDS, FieldType::Json),
        ];

        let mut fields = HashMap::new();
        for (names, field_type) in families {
            for name in names.iter() {
                fields.insert(name.to_string(), FieldSpec::new(*name, field_type));
            }
        }

        let operators = Operator::ALL
            .iter()
            .map(|&operator| {
                let spec = OperatorSpec {
                    operator,
                    sql: operator.sql(),
                    requires_value: !matches!(operator, Operator::IsSet | Operator::IsNotSet),
                };
                (operator.token(), spec)
            })
            .collect();

        Self { fields, operators }
    }

    /// Registry with the built-in whitelist plus caller-supplied fields.
    ///
    /// Extra columns are embedded verbatim into SQL, so each must be a plain
    /// lowercase identifier.
    pub fn with_extra_fields(extra: &HashMap<String, FieldSpec>) -> std::result::Result<Self, ConfigError> {
        let mut registry = Self::new();

        // Sorted by field name
        let mut names: Vec<&String> = extra.keys().collect();
        names.sort();

        for name in names {
            let spec = &extra[name];
            if !is_plain_identifier(&spec.column) {
                return Err(ConfigError::InvalidColumn {
                    field: name.clone(),
                    column: spec.column.clone(),
                });
            }
            if let Some(previous) = registry.fields.insert(name.clone(), spec.clone()) {
                tracing::warn!(
                    field = %name,
                    previous = %previous.column,
                    column = %spec.column,
                    "field mapping overrides built-in field"
                );
            }
        }

        tracing::debug!(fields = registry.fields.len(), "field registry built");
        Ok(registry)
    }

    pub fn field(&self, name: &str) -> Result<&FieldSpec> {
        self.fields
            .get(name)
            .ok_or_else(|| CompileError::UnknownField(name.to_string()))
    }

    pub fn operator(&self, token: &str) -> Result<&OperatorSpec> {
        self.operators
            .get(token)
            .ok_or_else(|| CompileError::UnknownOperator(token.to_string()))
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// `[a-z_][a-z0-9_]*`
fn is_plain_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
