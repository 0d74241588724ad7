//! SQL compiler that turns segment condition trees into parameterized PostgreSQL queries.
//!
//! The compiler walks the tree depth-first, left to right, threading the next free
//! placeholder number through every call. Each sub-compiler returns a [`Fragment`]
//! holding its SQL text, the arguments for the placeholders it used, and the next
//! placeholder number, so argument `i` always lines up with `$i`.

use sea_query::{Value, Values};
use std::collections::HashMap;
use std::fmt;

use crate::ast::{TreeNode, NodeKind, BranchOperator};
use crate::error::{CompileError, ConfigError, Result};
use crate::registry::{FieldSpec, Registry};
use crate::validate::{validate_tree, LeafCondition};

/// Query every segment is evaluated against
pub const BASE_QUERY: &str = "SELECT email FROM contacts";

/// Compiler configuration
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Extra fields on top of the built-in contact whitelist
    pub field_mapping: HashMap<String, FieldSpec>,
    /// Maximum nesting depth of a segment tree
    pub max_depth: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            field_mapping: HashMap::new(),
            max_depth: 32,
        }
    }
}

/// A compiled segment: SQL text plus positional arguments for `$1..$n`
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub args: Vec<Value>,
}

impl CompiledQuery {
    /// Arguments as sea-query `Values`, for binding through a sea-query driver
    pub fn values(&self) -> Values {
        Values(self.args.clone())
    }
}

impl fmt::Display for CompiledQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.sql)?;
        for (i, arg) in self.args.iter().enumerate() {
            writeln!(f, "  ${} = {}", i + 1, describe_value(arg))?;
        }
        Ok(())
    }
}

/// Human readable rendering of an argument value
pub fn describe_value(value: &Value) -> String {
    match value {
        Value::String(Some(s)) => format!("{:?}", s.as_str()),
        Value::Double(Some(n)) => n.to_string(),
        Value::BigInt(Some(n)) => n.to_string(),
        Value::ChronoDateTimeUtc(Some(t)) => t.to_rfc3339(),
        other => format!("{:?}", other),
    }
}

/// Partial compile output for one subtree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub args: Vec<Value>,
    /// First placeholder number not used by this fragment
    pub next_index: usize,
    /// Whether `sql` is already enclosed in its own parentheses
    pub grouped: bool,
}

impl Fragment {
    pub fn empty(next_index: usize) -> Self {
        Self {
            next_index,
            ..Default::default()
        }
    }

    /// A single predicate with no top-level AND/OR
    pub fn atom(sql: String, args: Vec<Value>, next_index: usize) -> Self {
        Self {
            sql,
            args,
            next_index,
            grouped: false,
        }
    }

    /// A predicate already wrapped in parentheses
    pub fn group(sql: String, args: Vec<Value>, next_index: usize) -> Self {
        Self {
            sql,
            args,
            next_index,
            grouped: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    /// SQL text wrapped in parentheses unless it already is
    pub fn into_grouped_sql(self) -> String {
        if self.grouped {
            self.sql
        } else {
            format!("({})", self.sql)
        }
    }

    /// Join child fragments of a branch; the result is always parenthesized.
    pub fn branch(parts: Vec<Fragment>, operator: BranchOperator, next_index: usize) -> Self {
        Self::combine(parts, operator.sql(), next_index, true)
    }

    /// AND together the filters of one condition; a lone filter is left as is.
    pub fn conjunction(parts: Vec<Fragment>, next_index: usize) -> Self {
        Self::combine(parts, "AND", next_index, false)
    }

    fn combine(parts: Vec<Fragment>, connective: &str, next_index: usize, always_group: bool) -> Self {
        let mut parts: Vec<Fragment> = parts.into_iter().filter(|p| !p.is_empty()).collect();

        if parts.is_empty() {
            return Self::empty(next_index);
        }
        if parts.len() == 1 && (parts[0].grouped || !always_group) {
            let mut only = parts.remove(0);
            only.next_index = next_index;
            return only;
        }

        let mut args = Vec::new();
        let mut predicates = Vec::with_capacity(parts.len());
        for part in parts {
            predicates.push(part.sql);
            args.extend(part.args);
        }
        let separator = format!(" {} ", connective);
        Self::group(format!("({})", predicates.join(&separator)), args, next_index)
    }
}

/// Compiles segment trees against a fixed field/operator whitelist.
///
/// Holds no per-call state, so one instance can serve any number of threads.
#[derive(Debug, Clone)]
pub struct SegmentCompiler {
    registry: Registry,
    max_depth: usize,
}

impl Default for SegmentCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentCompiler {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            max_depth: CompilerConfig::default().max_depth,
        }
    }

    pub fn from_config(config: CompilerConfig) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            registry: Registry::with_extra_fields(&config.field_mapping)?,
            max_depth: config.max_depth,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Compile a segment tree into `SELECT email FROM contacts [WHERE ...]`.
    ///
    /// The whole tree is validated first; any error aborts the call with no output.
    pub fn compile(&self, tree: &TreeNode) -> Result<CompiledQuery> {
        let result = validate_tree(tree, self.max_depth).and_then(|_| self.walk(tree, 1));

        let mut fragment = match result {
            Ok(fragment) => fragment,
            Err(e) => {
                tracing::warn!(error = %e, "segment tree rejected");
                return Err(e);
            }
        };

        let args = std::mem::take(&mut fragment.args);
        let mut sql = String::from(BASE_QUERY);
        if !fragment.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&fragment.into_grouped_sql());
        }

        tracing::debug!(args = args.len(), sql = %sql, "segment compiled");
        Ok(CompiledQuery { sql, args })
    }

    /// Compile an optional tree; `None` is the null tree and is rejected.
    pub fn compile_optional(&self, tree: Option<&TreeNode>) -> Result<CompiledQuery> {
        match tree {
            Some(tree) => self.compile(tree),
            None => Err(CompileError::NullTree),
        }
    }

    /// Parse a JSON segment tree and compile it
    pub fn compile_json(&self, json: &str) -> Result<CompiledQuery> {
        let tree: Option<TreeNode> = serde_json::from_str(json)?;
        self.compile_optional(tree.as_ref())
    }

    /// Compile one node, numbering placeholders from `arg_index`.
    pub(crate) fn walk(&self, node: &TreeNode, arg_index: usize) -> Result<Fragment> {
        match &node.kind {
            NodeKind::Branch => {
                let branch = node
                    .branch
                    .as_ref()
                    .ok_or(CompileError::MissingNodePayload("branch"))?;

                let mut index = arg_index;
                let mut parts = Vec::with_capacity(branch.leaves.len());
                for child in &branch.leaves {
                    let fragment = self.walk(child, index)?;
                    index = fragment.next_index;
                    parts.push(fragment);
                }
                Ok(Fragment::branch(parts, branch.operator, index))
            }
            NodeKind::Leaf => {
                let leaf = node
                    .leaf
                    .as_ref()
                    .ok_or(CompileError::MissingNodePayload("leaf"))?;

                match leaf.condition()? {
                    LeafCondition::Contacts(condition) => {
                        self.compile_contact_condition(condition, arg_index)
                    }
                    LeafCondition::ContactLists(condition) => {
                        self.compile_list_membership(condition, arg_index)
                    }
                    LeafCondition::ContactTimeline(condition) => {
                        self.compile_timeline_condition(condition, arg_index)
                    }
                    LeafCondition::CustomEventsGoal(condition) => {
                        self.compile_goal_condition(condition, arg_index)
                    }
                }
            }
            NodeKind::Unknown(raw) => Err(CompileError::UnknownNodeKind(raw.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ContactListCondition, DimensionFilter, ListOperator};
    use crate::registry::FieldType;
    use serde_json::json;

    fn country(value: &str) -> TreeNode {
        TreeNode::contacts(vec![
            DimensionFilter::new("country", "equals").with_strings([value])
        ])
    }

    /// Every `$n` that occurs in the SQL, in order of appearance
    fn placeholders(sql: &str) -> Vec<usize> {
        let bytes = sql.as_bytes();
        let mut found = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start {
                    found.push(sql[start..end].parse().unwrap());
                }
                i = end;
            } else {
                i += 1;
            }
        }
        found
    }

    #[test]
    fn test_single_equals_filter() {
        let compiler = SegmentCompiler::new();
        let result = compiler.compile(&country("US")).unwrap();
        assert_eq!(result.sql, "SELECT email FROM contacts WHERE (country = $1)");
        assert_eq!(result.args, vec![Value::from("US")]);
    }

    #[test]
    fn test_is_set_has_no_arguments() {
        let compiler = SegmentCompiler::new();
        let tree = TreeNode::contacts(vec![DimensionFilter::new("phone", "is_set")]);
        let result = compiler.compile(&tree).unwrap();
        assert_eq!(result.sql, "SELECT email FROM contacts WHERE (phone IS NOT NULL)");
        assert!(result.args.is_empty());
    }

    #[test]
    fn test_or_branch() {
        let compiler = SegmentCompiler::new();
        let tree = TreeNode::or(vec![country("US"), country("CA")]);
        let result = compiler.compile(&tree).unwrap();
        assert_eq!(
            result.sql,
            "SELECT email FROM contacts WHERE (country = $1 OR country = $2)"
        );
        assert_eq!(result.args, vec![Value::from("US"), Value::from("CA")]);
    }

    #[test]
    fn test_nested_branches_keep_precedence() {
        let compiler = SegmentCompiler::new();
        let tree = TreeNode::or(vec![
            country("US"),
            TreeNode::and(vec![country("CA"), country("MX")]),
        ]);
        let result = compiler.compile(&tree).unwrap();
        assert_eq!(
            result.sql,
            "SELECT email FROM contacts WHERE (country = $1 OR (country = $2 AND country = $3))"
        );
        assert_eq!(
            result.args,
            vec![Value::from("US"), Value::from("CA"), Value::from("MX")]
        );
    }

    #[test]
    fn test_multiple_filters_in_one_leaf_are_grouped() {
        let compiler = SegmentCompiler::new();
        let tree = TreeNode::or(vec![
            TreeNode::contacts(vec![
                DimensionFilter::new("country", "equals").with_strings(["US"]),
                DimensionFilter::new("custom_number_1", "gt")
                    .with_type(FieldType::Number)
                    .with_numbers([10.0]),
            ]),
            country("CA"),
        ]);
        let result = compiler.compile(&tree).unwrap();
        assert_eq!(
            result.sql,
            "SELECT email FROM contacts WHERE ((country = $1 AND custom_number_1 > $2) OR country = $3)"
        );
        assert_eq!(
            result.args,
            vec![Value::from("US"), Value::from(10.0), Value::from("CA")]
        );
    }

    #[test]
    fn test_single_child_branch_is_parenthesized_once() {
        let compiler = SegmentCompiler::new();
        let tree = TreeNode::and(vec![TreeNode::or(vec![country("US"), country("CA")])]);
        let result = compiler.compile(&tree).unwrap();
        assert_eq!(
            result.sql,
            "SELECT email FROM contacts WHERE (country = $1 OR country = $2)"
        );
    }

    #[test]
    fn test_empty_contact_leaf_yields_base_query() {
        let compiler = SegmentCompiler::new();
        let tree = TreeNode::contacts(vec![]);
        let result = compiler.compile(&tree).unwrap();
        assert_eq!(result.sql, BASE_QUERY);
        assert!(result.args.is_empty());
    }

    #[test]
    fn test_empty_children_are_skipped() {
        let compiler = SegmentCompiler::new();
        let tree = TreeNode::and(vec![TreeNode::contacts(vec![]), country("US")]);
        let result = compiler.compile(&tree).unwrap();
        assert_eq!(result.sql, "SELECT email FROM contacts WHERE (country = $1)");
    }

    #[test]
    fn test_list_membership_leaf() {
        let compiler = SegmentCompiler::new();
        let tree = TreeNode::contact_list(ContactListCondition {
            operator: ListOperator::In,
            list_id: "list123".to_string(),
            status: None,
        });
        let result = compiler.compile(&tree).unwrap();
        assert!(result.sql.contains(
            "EXISTS (SELECT 1 FROM contact_lists cl JOIN lists l ON cl.list_id = l.id"
        ));
        assert!(result.sql.contains("cl.list_id = $1"));
        assert!(result.sql.contains("l.deleted_at IS NULL)"));
        assert_eq!(result.args, vec![Value::from("list123")]);
    }

    #[test]
    fn test_json_path_filter() {
        let compiler = SegmentCompiler::new();
        let tree = TreeNode::contacts(vec![DimensionFilter::new("custom_json_1", "equals")
            .with_strings(["US"])
            .with_path(["user", "profile", "country"])]);
        let result = compiler.compile(&tree).unwrap();
        assert_eq!(
            result.sql,
            "SELECT email FROM contacts WHERE (custom_json_1['user']['profile']['country']::text = $1)"
        );
    }

    #[test]
    fn test_unknown_field_returns_no_sql() {
        let compiler = SegmentCompiler::new();
        let tree = TreeNode::or(vec![
            country("US"),
            TreeNode::contacts(vec![
                DimensionFilter::new("password", "equals").with_strings(["x"])
            ]),
        ]);
        match compiler.compile(&tree) {
            Err(CompileError::UnknownField(name)) => assert_eq!(name, "password"),
            other => panic!("Expected UnknownField, got {:?}", other),
        }
    }

    #[test]
    fn test_null_tree() {
        let compiler = SegmentCompiler::new();
        assert!(matches!(compiler.compile_optional(None), Err(CompileError::NullTree)));
        assert!(matches!(compiler.compile_json("null"), Err(CompileError::NullTree)));
    }

    #[test]
    fn test_branch_with_stray_leaf_payload_is_rejected() {
        let compiler = SegmentCompiler::new();
        let tree = json!({
            "kind": "branch",
            "branch": {"operator": "or", "leaves": [
                {"kind": "leaf", "leaf": {"source": "contacts", "contact": {"filters": [
                    {"field_name": "country", "operator": "equals", "string_values": ["US"]}
                ]}}}
            ]},
            "leaf": {"source": "contacts", "contact": {"filters": [
                {"field_name": "password", "operator": "equals", "string_values": ["x"]}
            ]}}
        });
        assert!(matches!(
            compiler.compile_json(&tree.to_string()),
            Err(CompileError::InconsistentNodePayload { kind: "branch", extra: "leaf" })
        ));
    }

    #[test]
    fn test_unknown_kind_is_named_in_error() {
        let compiler = SegmentCompiler::new();
        let err = compiler.compile_json(r#"{"kind": "subtree"}"#).unwrap_err();
        assert_eq!(err.to_string(), "unknown tree node kind 'subtree'");
    }

    #[test]
    fn test_invalid_json() {
        let compiler = SegmentCompiler::new();
        assert!(matches!(
            compiler.compile_json("{\"kind\": "),
            Err(CompileError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_compile_json_mixed_sources() {
        let compiler = SegmentCompiler::new();
        let tree = json!({
            "kind": "branch",
            "branch": {
                "operator": "and",
                "leaves": [
                    {"kind": "leaf", "leaf": {"source": "contacts", "contact": {"filters": [
                        {"field_name": "first_name", "field_type": "string", "operator": "contains", "string_values": ["an", "jo"]}
                    ]}}},
                    {"kind": "leaf", "leaf": {"source": "contact_lists", "contact_list": {
                        "operator": "not_in", "list_id": "vip", "status": "active"
                    }}},
                    {"kind": "leaf", "leaf": {"source": "contact_timeline", "contact_timeline": {
                        "kind": "email_opened", "count_operator": "at_least", "count_value": 3,
                        "timeframe_operator": "in_the_last_days", "timeframe_values": ["30"]
                    }}},
                    {"kind": "leaf", "leaf": {"source": "custom_events_goals", "custom_events_goal": {
                        "goal_type": "purchase", "aggregate_operator": "sum", "operator": "gte", "value": 100
                    }}}
                ]
            }
        });
        let result = compiler.compile_json(&tree.to_string()).unwrap();

        assert_eq!(
            result.sql,
            "SELECT email FROM contacts WHERE ((first_name ILIKE $1 OR first_name ILIKE $2) AND \
             NOT EXISTS (SELECT 1 FROM contact_lists cl JOIN lists l ON cl.list_id = l.id \
             WHERE cl.email = contacts.email AND cl.list_id = $3 AND cl.status = $4 AND l.deleted_at IS NULL) AND \
             (SELECT COUNT(*) FROM contact_timeline ct WHERE ct.email = contacts.email AND ct.kind = $5 \
             AND ct.created_at > NOW() - INTERVAL '30 days') >= $6 AND \
             EXISTS (SELECT 1 FROM custom_events ce WHERE ce.email = contacts.email AND ce.deleted_at IS NULL \
             AND ce.goal_type = $7 GROUP BY ce.email HAVING COALESCE(SUM(ce.goal_value), 0) >= $8))"
        );
        assert_eq!(
            result.args,
            vec![
                Value::from("%an%"),
                Value::from("%jo%"),
                Value::from("vip"),
                Value::from("active"),
                Value::from("email_opened"),
                Value::from(3i64),
                Value::from("purchase"),
                Value::from(100.0),
            ]
        );
    }

    #[test]
    fn test_placeholders_match_arguments() {
        let compiler = SegmentCompiler::new();
        let tree = TreeNode::and(vec![
            TreeNode::or(vec![country("US"), country("CA"), country("DE")]),
            TreeNode::contacts(vec![
                DimensionFilter::new("created_at", "in_date_range")
                    .with_type(FieldType::Time)
                    .with_strings(["2024-01-01", "2024-02-01"]),
                DimensionFilter::new("phone", "is_not_set"),
                DimensionFilter::new("last_name", "not_contains").with_strings(["x", "y", "z"]),
            ]),
        ]);
        let result = compiler.compile(&tree).unwrap();

        let found = placeholders(&result.sql);
        let expected: Vec<usize> = (1..=result.args.len()).collect();
        assert_eq!(found, expected);
        assert_eq!(result.args.len(), 8);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let compiler = SegmentCompiler::new();
        let tree = TreeNode::or(vec![
            country("US"),
            TreeNode::and(vec![country("CA"), TreeNode::contacts(vec![
                DimensionFilter::new("custom_json_2", "in_array")
                    .with_strings(["a", "b"])
                    .with_path(["tags"]),
            ])]),
        ]);
        let first = compiler.compile(&tree).unwrap();
        let second = compiler.compile(&tree).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_compiler_is_shareable_across_threads() {
        let compiler = std::sync::Arc::new(SegmentCompiler::new());
        let handles: Vec<_> = ["US", "CA", "DE", "FR"]
            .into_iter()
            .map(|code| {
                let compiler = compiler.clone();
                std::thread::spawn(move || compiler.compile(&country(code)).unwrap())
            })
            .collect();
        for (handle, code) in handles.into_iter().zip(["US", "CA", "DE", "FR"]) {
            let result = handle.join().unwrap();
            assert_eq!(result.sql, "SELECT email FROM contacts WHERE (country = $1)");
            assert_eq!(result.args, vec![Value::from(code)]);
        }
    }

    #[test]
    fn test_from_config_extra_field() {
        let mut field_mapping = HashMap::new();
        field_mapping.insert(
            "plan".to_string(),
            FieldSpec::new("custom_string_2", FieldType::String),
        );
        let compiler = SegmentCompiler::from_config(CompilerConfig {
            field_mapping,
            ..Default::default()
        })
        .unwrap();
        let tree = TreeNode::contacts(vec![
            DimensionFilter::new("plan", "equals").with_strings(["pro"])
        ]);
        let result = compiler.compile(&tree).unwrap();
        assert_eq!(result.sql, "SELECT email FROM contacts WHERE (custom_string_2 = $1)");
    }

    #[test]
    fn test_depth_limit_from_config() {
        let compiler = SegmentCompiler::from_config(CompilerConfig {
            max_depth: 2,
            ..Default::default()
        })
        .unwrap();
        let tree = TreeNode::and(vec![TreeNode::or(vec![country("US")])]);
        assert!(matches!(compiler.compile(&tree), Err(CompileError::TooDeep(2))));
    }

    #[test]
    fn test_display_lists_arguments() {
        let compiler = SegmentCompiler::new();
        let result = compiler.compile(&TreeNode::or(vec![country("US"), country("CA")])).unwrap();
        let rendered = result.to_string();
        assert!(rendered.starts_with("SELECT email FROM contacts WHERE"));
        assert!(rendered.contains("  $1 = \"US\""));
        assert!(rendered.contains("  $2 = \"CA\""));
        assert_eq!(result.values().0.len(), 2);
    }
}
