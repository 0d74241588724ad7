//! Segment condition tree, as received from upstream request validation.
//!
//! The shape follows the JSON that segment definitions are stored in: every node
//! names its kind and carries the matching payload, and every leaf names its source
//! and carries the matching condition. [`crate::validate`] checks that the two agree
//! before anything is compiled.

use serde::{Deserialize, Serialize};

use crate::registry::FieldType;

/// One node of a segment tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<TreeBranch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf: Option<TreeLeaf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    Branch,
    Leaf,
    /// Any other kind, kept verbatim for error reporting
    Unknown(String),
}

impl NodeKind {
    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::Branch => "branch",
            NodeKind::Leaf => "leaf",
            NodeKind::Unknown(raw) => raw,
        }
    }
}

impl From<String> for NodeKind {
    fn from(raw: String) -> Self {
        let known = match raw.as_str() {
            "branch" => Some(NodeKind::Branch),
            "leaf" => Some(NodeKind::Leaf),
            _ => None,
        };
        known.unwrap_or_else(|| NodeKind::Unknown(raw))
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

/// Logical AND/OR over child nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeBranch {
    pub operator: BranchOperator,
    /// Child order determines parameter numbering
    #[serde(default, alias = "children")]
    pub leaves: Vec<TreeNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchOperator {
    And,
    Or,
}

impl BranchOperator {
    pub fn sql(self) -> &'static str {
        match self {
            BranchOperator::And => "AND",
            BranchOperator::Or => "OR",
        }
    }
}

/// A terminal condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeLeaf {
    pub source: LeafSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_list: Option<ContactListCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_timeline: Option<ContactTimelineCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_events_goal: Option<CustomEventsGoalCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LeafSource {
    Contacts,
    ContactLists,
    ContactTimeline,
    CustomEventsGoals,
    /// Any other source, kept verbatim for error reporting
    Unknown(String),
}

impl LeafSource {
    pub fn as_str(&self) -> &str {
        match self {
            LeafSource::Contacts => "contacts",
            LeafSource::ContactLists => "contact_lists",
            LeafSource::ContactTimeline => "contact_timeline",
            LeafSource::CustomEventsGoals => "custom_events_goals",
            LeafSource::Unknown(raw) => raw,
        }
    }
}

impl From<String> for LeafSource {
    fn from(raw: String) -> Self {
        let known = match raw.as_str() {
            "contacts" => Some(LeafSource::Contacts),
            "contact_lists" => Some(LeafSource::ContactLists),
            "contact_timeline" => Some(LeafSource::ContactTimeline),
            "custom_events_goals" => Some(LeafSource::CustomEventsGoals),
            _ => None,
        };
        known.unwrap_or_else(|| LeafSource::Unknown(raw))
    }
}

impl From<LeafSource> for String {
    fn from(source: LeafSource) -> Self {
        match source {
            LeafSource::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

/// Filters over contact columns, ANDed together
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactCondition {
    #[serde(default)]
    pub filters: Vec<DimensionFilter>,
}

/// A single field/operator/value filter, e.g. `country equals "US"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionFilter {
    pub field_name: String,
    #[serde(default)]
    pub field_type: FieldType,
    pub operator: String,
    #[serde(default)]
    pub string_values: Vec<String>,
    #[serde(default)]
    pub number_values: Vec<f64>,
    /// Path inside a JSON field; numeric segments index arrays
    #[serde(default)]
    pub json_path: Vec<String>,
}

/// Membership (or non-membership) in a contact list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactListCondition {
    pub operator: ListOperator,
    #[serde(default)]
    pub list_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListOperator {
    In,
    NotIn,
}

/// Count of timeline events of one kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactTimelineCondition {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub count_operator: Option<CountOperator>,
    #[serde(default)]
    pub count_value: i64,
    #[serde(default)]
    pub timeframe_operator: Option<TimeframeOperator>,
    #[serde(default)]
    pub timeframe_values: Vec<String>,
    /// Filters read against the event's metadata object
    #[serde(default)]
    pub filters: Vec<DimensionFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountOperator {
    AtLeast,
    AtMost,
    Exactly,
}

impl CountOperator {
    pub fn sql(self) -> &'static str {
        match self {
            CountOperator::AtLeast => ">=",
            CountOperator::AtMost => "<=",
            CountOperator::Exactly => "=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeframeOperator {
    Anytime,
    InDateRange,
    BeforeDate,
    AfterDate,
    InTheLastDays,
}

impl TimeframeOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeframeOperator::Anytime => "anytime",
            TimeframeOperator::InDateRange => "in_date_range",
            TimeframeOperator::BeforeDate => "before_date",
            TimeframeOperator::AfterDate => "after_date",
            TimeframeOperator::InTheLastDays => "in_the_last_days",
        }
    }
}

/// Aggregate over custom business events (purchases, signups, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEventsGoalCondition {
    /// One of the goal types, or `*` for any
    pub goal_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_name: Option<String>,
    #[serde(default)]
    pub timeframe_operator: Option<TimeframeOperator>,
    #[serde(default)]
    pub timeframe_values: Vec<String>,
    pub aggregate_operator: AggregateOperator,
    pub operator: GoalOperator,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_2: Option<f64>,
}

pub const GOAL_TYPES: &[&str] = &[
    "purchase",
    "subscription",
    "lead",
    "signup",
    "booking",
    "trial",
    "other",
];

pub const ANY_GOAL_TYPE: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOperator {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalOperator {
    Gte,
    Lte,
    Eq,
    Between,
}

impl GoalOperator {
    pub fn sql(self) -> &'static str {
        match self {
            GoalOperator::Gte => ">=",
            GoalOperator::Lte => "<=",
            GoalOperator::Eq => "=",
            GoalOperator::Between => "BETWEEN",
        }
    }
}

impl TreeNode {
    pub fn branch(operator: BranchOperator, leaves: Vec<TreeNode>) -> Self {
        Self {
            kind: NodeKind::Branch,
            branch: Some(TreeBranch { operator, leaves }),
            leaf: None,
        }
    }

    pub fn and(leaves: Vec<TreeNode>) -> Self {
        Self::branch(BranchOperator::And, leaves)
    }

    pub fn or(leaves: Vec<TreeNode>) -> Self {
        Self::branch(BranchOperator::Or, leaves)
    }

    pub fn leaf(leaf: TreeLeaf) -> Self {
        Self {
            kind: NodeKind::Leaf,
            branch: None,
            leaf: Some(leaf),
        }
    }

    /// Leaf over contact columns
    pub fn contacts(filters: Vec<DimensionFilter>) -> Self {
        Self::leaf(TreeLeaf {
            contact: Some(ContactCondition { filters }),
            ..TreeLeaf::empty(LeafSource::Contacts)
        })
    }

    pub fn contact_list(condition: ContactListCondition) -> Self {
        Self::leaf(TreeLeaf {
            contact_list: Some(condition),
            ..TreeLeaf::empty(LeafSource::ContactLists)
        })
    }

    pub fn contact_timeline(condition: ContactTimelineCondition) -> Self {
        Self::leaf(TreeLeaf {
            contact_timeline: Some(condition),
            ..TreeLeaf::empty(LeafSource::ContactTimeline)
        })
    }

    pub fn custom_events_goal(condition: CustomEventsGoalCondition) -> Self {
        Self::leaf(TreeLeaf {
            custom_events_goal: Some(condition),
            ..TreeLeaf::empty(LeafSource::CustomEventsGoals)
        })
    }
}

impl TreeLeaf {
    /// Leaf with a source and no payload yet
    pub fn empty(source: LeafSource) -> Self {
        Self {
            source,
            contact: None,
            contact_list: None,
            contact_timeline: None,
            custom_events_goal: None,
        }
    }
}

impl DimensionFilter {
    pub fn new(field_name: impl Into<String>, operator: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            field_type: FieldType::String,
            operator: operator.into(),
            string_values: Vec::new(),
            number_values: Vec::new(),
            json_path: Vec::new(),
        }
    }

    pub fn with_type(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    pub fn with_strings<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.string_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_numbers(mut self, values: impl IntoIterator<Item = f64>) -> Self {
        self.number_values = values.into_iter().collect();
        self
    }

    pub fn with_path<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.json_path = path.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_branch() {
        let node: TreeNode = serde_json::from_value(json!({
            "kind": "branch",
            "branch": {
                "operator": "or",
                "leaves": [
                    {"kind": "leaf", "leaf": {"source": "contacts", "contact": {"filters": [
                        {"field_name": "country", "field_type": "string", "operator": "equals", "string_values": ["US"]}
                    ]}}},
                    {"kind": "leaf", "leaf": {"source": "contact_lists", "contact_list": {"operator": "not_in", "list_id": "l1"}}}
                ]
            }
        }))
        .unwrap();

        let branch = node.branch.as_ref().unwrap();
        assert_eq!(branch.operator, BranchOperator::Or);
        assert_eq!(branch.leaves.len(), 2);

        let first = branch.leaves[0].leaf.as_ref().unwrap();
        let filter = &first.contact.as_ref().unwrap().filters[0];
        assert_eq!(filter.field_name, "country");
        assert_eq!(filter.string_values, vec!["US".to_string()]);
        assert!(filter.number_values.is_empty());
        assert!(filter.json_path.is_empty());

        let second = branch.leaves[1].leaf.as_ref().unwrap();
        assert_eq!(second.contact_list.as_ref().unwrap().operator, ListOperator::NotIn);
    }

    #[test]
    fn test_children_alias() {
        let node: TreeNode = serde_json::from_value(json!({
            "kind": "branch",
            "branch": {"operator": "and", "children": []}
        }))
        .unwrap();
        assert!(node.branch.unwrap().leaves.is_empty());
    }

    #[test]
    fn test_unknown_kind_and_source() {
        let node: TreeNode = serde_json::from_value(json!({
            "kind": "subtree",
            "leaf": {"source": "orders"}
        }))
        .unwrap();
        assert_eq!(node.kind, NodeKind::Unknown("subtree".to_string()));
        assert_eq!(node.leaf.unwrap().source, LeafSource::Unknown("orders".to_string()));
    }

    #[test]
    fn test_kind_and_source_serialize_as_strings() {
        let node = TreeNode::contacts(vec![]);
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["kind"], "leaf");
        assert_eq!(value["leaf"]["source"], "contacts");

        let back: TreeNode = serde_json::from_value(value).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_invalid_enum_is_rejected() {
        let result: Result<TreeNode, _> = serde_json::from_value(json!({
            "kind": "branch",
            "branch": {"operator": "xor", "leaves": []}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_goal_condition_fields() {
        let goal: CustomEventsGoalCondition = serde_json::from_value(json!({
            "goal_type": "*",
            "aggregate_operator": "avg",
            "operator": "between",
            "value": 10,
            "value_2": 20.5,
            "timeframe_operator": "in_the_last_days",
            "timeframe_values": ["30"]
        }))
        .unwrap();
        assert_eq!(goal.goal_type, ANY_GOAL_TYPE);
        assert_eq!(goal.aggregate_operator, AggregateOperator::Avg);
        assert_eq!(goal.operator, GoalOperator::Between);
        assert_eq!(goal.value_2, Some(20.5));
        assert_eq!(goal.timeframe_operator, Some(TimeframeOperator::InTheLastDays));
    }

    #[test]
    fn test_builders() {
        let node = TreeNode::contacts(vec![DimensionFilter::new("custom_json_1", "equals")
            .with_type(FieldType::Number)
            .with_numbers([3.0])
            .with_path(["a", "0"])]);
        let filter = &node.leaf.unwrap().contact.unwrap().filters[0];
        assert_eq!(filter.field_type, FieldType::Number);
        assert_eq!(filter.number_values, vec![3.0]);
        assert_eq!(filter.json_path, vec!["a".to_string(), "0".to_string()]);
    }
}
