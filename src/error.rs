//! Error types for segment compilation and compiler configuration

use std::path::PathBuf;
use thiserror::Error;

use crate::registry::FieldType;

/// Everything that can abort a compile call.
///
/// No variant is ever paired with partial output: once one of these is returned
/// the caller gets no SQL and no arguments.
#[derive(Error, Debug)]
pub enum CompileError {
    // Structural errors
    #[error("segment tree is null")]
    NullTree,

    #[error("node of kind '{0}' has no {0} payload")]
    MissingNodePayload(&'static str),

    #[error("node of kind '{kind}' also carries a {extra} payload")]
    InconsistentNodePayload {
        kind: &'static str,
        extra: &'static str,
    },

    #[error("unknown tree node kind '{0}'")]
    UnknownNodeKind(String),

    #[error("branch '{0}' has no children")]
    EmptyBranch(String),

    #[error("unknown leaf source '{0}'")]
    UnknownSource(String),

    #[error("leaf with source '{0}' has no matching condition payload")]
    MissingLeafPayload(String),

    #[error("leaf with source '{declared}' also carries a '{extra}' payload")]
    InconsistentLeafPayload {
        declared: String,
        extra: &'static str,
    },

    #[error("segment tree exceeds the maximum depth of {0}")]
    TooDeep(usize),

    // Whitelist errors
    #[error("field '{0}' is not allowed in segment filters")]
    UnknownField(String),

    #[error("operator '{0}' is not allowed in segment filters")]
    UnknownOperator(String),

    #[error("operator '{operator}' is not supported for {field_type} field '{field}'")]
    UnsupportedOperator {
        field: String,
        operator: String,
        field_type: FieldType,
    },

    // Value errors
    #[error("operator '{operator}' on field '{field}' requires a value")]
    MissingValue { field: String, operator: String },

    #[error("operator '{operator}' on field '{field}' expects {expected} value(s), got {found}")]
    ValueCount {
        field: String,
        operator: String,
        expected: usize,
        found: usize,
    },

    #[error("invalid time value '{value}' for field '{field}'")]
    InvalidTime { field: String, value: String },

    #[error("invalid day count '{value}' for field '{field}': expected a non-negative integer")]
    InvalidDays { field: String, value: String },

    #[error("'between' goal comparison requires a second value")]
    MissingBetweenBound,

    // Domain errors
    #[error("contact list condition requires a list id")]
    MissingListId,

    #[error("contact timeline condition requires an event kind")]
    MissingTimelineKind,

    #[error("contact timeline condition requires a count operator")]
    MissingCountOperator,

    #[error("contact timeline count must be non-negative, got {0}")]
    NegativeCount(i64),

    #[error("invalid goal type '{0}'")]
    InvalidGoalType(String),

    #[error("segment tree JSON is invalid: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Result type for compile operations
pub type Result<T> = std::result::Result<T, CompileError>;

/// 编译器配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("配置文件不存在: {}", .0.display())]
    NotFound(PathBuf),

    #[error("无法读取配置文件 {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("无法解析JSON配置文件 {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("字段 '{field}' 的列名 '{column}' 不是合法的SQL标识符")]
    InvalidColumn { field: String, column: String },
}
