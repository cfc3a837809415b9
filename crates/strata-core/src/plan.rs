//! Plan nodes executed by a task.
//!
//! A plan is a linear chain: one source (`Values` or a source-less `Custom`
//! node) followed by single-input nodes. Drivers instantiate one operator per
//! node, leaf first. `Custom` nodes are resolved through the operator
//! registry by their `kind`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::PlanNodeId;
use crate::types::RowBatch;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum PlanNode {
    /// Emit in-memory batches, `repeat_times` over. When `parallelizable`,
    /// every driver emits all batches; otherwise the plan runs one driver.
    Values {
        id: PlanNodeId,
        values: Arc<Vec<RowBatch>>,
        parallelizable: bool,
        repeat_times: usize,
    },
    /// Keep rows matching a simple predicate such as `m1 % 10 == 0`.
    Filter {
        id: PlanNodeId,
        predicate: String,
        source: Box<PlanNode>,
    },
    /// Number rows within each partition of `partition_keys`.
    RowNumber {
        id: PlanNodeId,
        partition_keys: Vec<String>,
        limit: Option<usize>,
        generate_row_number: bool,
        source: Box<PlanNode>,
    },
    /// Operator supplied by a registered translator.
    Custom {
        id: PlanNodeId,
        kind: String,
        #[serde(default)]
        config: serde_json::Value,
        source: Option<Box<PlanNode>>,
    },
}

impl PlanNode {
    pub fn id(&self) -> &PlanNodeId {
        match self {
            PlanNode::Values { id, .. }
            | PlanNode::Filter { id, .. }
            | PlanNode::RowNumber { id, .. }
            | PlanNode::Custom { id, .. } => id,
        }
    }

    /// Short name of the node kind, used in logs.
    pub fn kind(&self) -> &str {
        match self {
            PlanNode::Values { .. } => "Values",
            PlanNode::Filter { .. } => "Filter",
            PlanNode::RowNumber { .. } => "RowNumber",
            PlanNode::Custom { kind, .. } => kind,
        }
    }

    pub fn source(&self) -> Option<&PlanNode> {
        match self {
            PlanNode::Values { .. } => None,
            PlanNode::Filter { source, .. } | PlanNode::RowNumber { source, .. } => Some(source),
            PlanNode::Custom { source, .. } => source.as_deref(),
        }
    }

    /// Nodes from the leaf up to (and including) `self`.
    pub fn linearize(&self) -> Vec<&PlanNode> {
        let mut nodes = Vec::new();
        let mut cur = Some(self);
        while let Some(node) = cur {
            nodes.push(node);
            cur = node.source();
        }
        nodes.reverse();
        nodes
    }

    /// Check ids are unique, the chain starts with a source and `Values`
    /// batches agree on their schema.
    pub fn validate(&self) -> Result<()> {
        let nodes = self.linearize();
        let mut seen = std::collections::HashSet::new();
        for node in &nodes {
            if !seen.insert(node.id().clone()) {
                return Err(Error::Plan(format!("duplicate plan node id {}", node.id())));
            }
        }
        match nodes.first() {
            Some(PlanNode::Values { id, values, .. }) => {
                let mut batches = values.iter();
                if let Some(first) = batches.next().map(RowBatch::schema) {
                    for batch in batches {
                        let schema = batch.schema();
                        if !first.compatible_with(&schema) {
                            return Err(Error::Plan(format!(
                                "Values ({id}) batches disagree on schema: {first} vs {schema}"
                            )));
                        }
                    }
                }
                Ok(())
            }
            Some(PlanNode::Custom { .. }) => Ok(()),
            Some(other) => Err(Error::Plan(format!(
                "plan must start with a source node, found {} ({})",
                other.kind(),
                other.id()
            ))),
            None => Err(Error::Plan("empty plan".into())),
        }
    }

    pub fn from_json(json: &str) -> Result<PlanNode> {
        let node: PlanNode = serde_json::from_str(json)?;
        node.validate()?;
        Ok(node)
    }
}

/// Hands out sequential plan node ids: "0", "1", ...
#[derive(Debug, Default)]
pub struct PlanNodeIdGenerator {
    next: u64,
}

impl PlanNodeIdGenerator {
    pub fn new(start: u64) -> Self {
        Self { next: start }
    }

    pub fn next_id(&mut self) -> PlanNodeId {
        let id = PlanNodeId::new(self.next.to_string());
        self.next += 1;
        id
    }

    pub fn reset(&mut self, start: u64) {
        self.next = start;
    }
}

/// Fluent builder for linear plans.
///
/// ```
/// use strata_core::{PlanBuilder, RowBatch};
/// let plan = PlanBuilder::new()
///     .values(vec![RowBatch::new(vec![])], true)
///     .filter("m1 % 10 == 0")
///     .plan_node()
///     .unwrap();
/// assert_eq!(plan.kind(), "Filter");
/// ```
#[derive(Debug, Default)]
pub struct PlanBuilder {
    ids: PlanNodeIdGenerator,
    root: Option<PlanNode>,
    error: Option<String>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id_generator(ids: PlanNodeIdGenerator) -> Self {
        Self {
            ids,
            ..Self::default()
        }
    }

    pub fn values(self, values: Vec<RowBatch>, parallelizable: bool) -> Self {
        self.values_repeated(values, parallelizable, 1)
    }

    pub fn values_repeated(
        mut self,
        values: Vec<RowBatch>,
        parallelizable: bool,
        repeat_times: usize,
    ) -> Self {
        let id = self.ids.next_id();
        self.set_source(PlanNode::Values {
            id,
            values: Arc::new(values),
            parallelizable,
            repeat_times,
        })
    }

    pub fn filter(mut self, predicate: impl Into<String>) -> Self {
        let id = self.ids.next_id();
        let predicate = predicate.into();
        self.wrap(|source| PlanNode::Filter {
            id,
            predicate,
            source: Box::new(source),
        })
    }

    pub fn row_number(
        mut self,
        partition_keys: Vec<String>,
        limit: Option<usize>,
        generate_row_number: bool,
    ) -> Self {
        let id = self.ids.next_id();
        self.wrap(|source| PlanNode::RowNumber {
            id,
            partition_keys,
            limit,
            generate_row_number,
            source: Box::new(source),
        })
    }

    /// Custom node. With no prior node it becomes the source.
    pub fn custom(mut self, kind: impl Into<String>, config: serde_json::Value) -> Self {
        let id = self.ids.next_id();
        let kind = kind.into();
        match self.root.take() {
            Some(source) => {
                self.root = Some(PlanNode::Custom {
                    id,
                    kind,
                    config,
                    source: Some(Box::new(source)),
                });
                self
            }
            None => self.set_source(PlanNode::Custom {
                id,
                kind,
                config,
                source: None,
            }),
        }
    }

    pub fn plan_node(self) -> Result<PlanNode> {
        if let Some(e) = self.error {
            return Err(Error::Plan(e));
        }
        let root = self
            .root
            .ok_or_else(|| Error::Plan("plan has no nodes".into()))?;
        root.validate()?;
        Ok(root)
    }

    fn set_source(mut self, node: PlanNode) -> Self {
        if self.root.is_some() {
            self.error = Some(format!("source node {} must come first", node.id()));
        } else {
            self.root = Some(node);
        }
        self
    }

    fn wrap(mut self, f: impl FnOnce(PlanNode) -> PlanNode) -> Self {
        match self.root.take() {
            Some(source) => self.root = Some(f(source)),
            None => {
                if self.error.is_none() {
                    self.error = Some("node added before any source".into());
                }
            }
        }
        self
    }
}
