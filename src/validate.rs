//! Structural validation of segment trees.
//!
//! Runs over the whole tree before any SQL is produced, so that a malformed node deep
//! in one branch cannot leave a half-compiled query behind.

use crate::ast::{
    ContactCondition, ContactListCondition, ContactTimelineCondition, CustomEventsGoalCondition,
    LeafSource, NodeKind, TreeLeaf, TreeNode,
};
use crate::error::{CompileError, Result};

/// A leaf's condition, resolved against its declared source
#[derive(Debug, Clone, Copy)]
pub enum LeafCondition<'a> {
    Contacts(&'a ContactCondition),
    ContactLists(&'a ContactListCondition),
    ContactTimeline(&'a ContactTimelineCondition),
    CustomEventsGoal(&'a CustomEventsGoalCondition),
}

impl TreeLeaf {
    /// Resolve the payload that matches `source`.
    ///
    /// Fails when that payload is absent or when a payload belonging to another
    /// source is populated too.
    pub fn condition(&self) -> Result<LeafCondition<'_>> {
        let condition = match &self.source {
            LeafSource::Contacts => self.contact.as_ref().map(LeafCondition::Contacts),
            LeafSource::ContactLists => self.contact_list.as_ref().map(LeafCondition::ContactLists),
            LeafSource::ContactTimeline => self
                .contact_timeline
                .as_ref()
                .map(LeafCondition::ContactTimeline),
            LeafSource::CustomEventsGoals => self
                .custom_events_goal
                .as_ref()
                .map(LeafCondition::CustomEventsGoal),
            LeafSource::Unknown(raw) => return Err(CompileError::UnknownSource(raw.clone())),
        };
        let condition = condition
            .ok_or_else(|| CompileError::MissingLeafPayload(self.source.as_str().to_string()))?;

        let populated = [
            (LeafSource::Contacts, "contact", self.contact.is_some()),
            (LeafSource::ContactLists, "contact_list", self.contact_list.is_some()),
            (LeafSource::ContactTimeline, "contact_timeline", self.contact_timeline.is_some()),
            (LeafSource::CustomEventsGoals, "custom_events_goal", self.custom_events_goal.is_some()),
        ];
        if let Some((_, extra, _)) = populated
            .iter()
            .find(|(source, _, present)| *present && *source != self.source)
        {
            return Err(CompileError::InconsistentLeafPayload {
                declared: self.source.as_str().to_string(),
                extra: *extra,
            });
        }

        Ok(condition)
    }
}

/// Check that every branch has children, every node carries only the payload its
/// kind calls for, every leaf has the payload its source calls for, and the tree is
/// no deeper than `max_depth`.
pub fn validate_tree(node: &TreeNode, max_depth: usize) -> Result<()> {
    validate_node(node, 1, max_depth)
}

fn validate_node(node: &TreeNode, depth: usize, max_depth: usize) -> Result<()> {
    if depth > max_depth {
        return Err(CompileError::TooDeep(max_depth));
    }

    match &node.kind {
        NodeKind::Branch => {
            let branch = node
                .branch
                .as_ref()
                .ok_or(CompileError::MissingNodePayload("branch"))?;
            if node.leaf.is_some() {
                return Err(CompileError::InconsistentNodePayload {
                    kind: "branch",
                    extra: "leaf",
                });
            }
            if branch.leaves.is_empty() {
                return Err(CompileError::EmptyBranch(
                    branch.operator.sql().to_lowercase(),
                ));
            }
            for child in &branch.leaves {
                validate_node(child, depth + 1, max_depth)?;
            }
            Ok(())
        }
        NodeKind::Leaf => {
            let leaf = node
                .leaf
                .as_ref()
                .ok_or(CompileError::MissingNodePayload("leaf"))?;
            if node.branch.is_some() {
                return Err(CompileError::InconsistentNodePayload {
                    kind: "leaf",
                    extra: "branch",
                });
            }
            leaf.condition().map(|_| ())
        }
        NodeKind::Unknown(raw) => Err(CompileError::UnknownNodeKind(raw.clone())),
    }
}
