//! Plan node → operator translation.
//!
//! Built-in nodes (`Values`, `Filter`, `RowNumber`) are translated directly.
//! `Custom` nodes are looked up by kind in an explicit registry object that
//! the query context owns; tests register and reset translators on their
//! own registry instead of touching process-wide state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use strata_core::PlanNode;

use crate::filter::FilterOperator;
use crate::row_number::RowNumberOperator;
use crate::traits::{OpError, Operator, OperatorCtx};
use crate::values::ValuesOperator;

/// Creates operators for one custom plan node kind.
pub trait PlanNodeTranslator: Send + Sync {
    fn kind(&self) -> &str;

    fn to_operator(&self, ctx: OperatorCtx, node: &PlanNode) -> Result<Box<dyn Operator>, OpError>;

    /// Upper bound on drivers for a pipeline containing `node`.
    fn max_drivers(&self, _node: &PlanNode) -> Option<usize> {
        None
    }
}

#[derive(Default)]
pub struct OperatorRegistry {
    translators: RwLock<HashMap<String, Arc<dyn PlanNodeTranslator>>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a translator, replacing (and returning) any previous one for
    /// the same kind.
    pub fn register(
        &self,
        translator: Arc<dyn PlanNodeTranslator>,
    ) -> Option<Arc<dyn PlanNodeTranslator>> {
        let kind = translator.kind().to_string();
        self.translators.write().insert(kind, translator)
    }

    pub fn unregister(&self, kind: &str) -> bool {
        self.translators.write().remove(kind).is_some()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.translators.read().contains_key(kind)
    }

    pub fn reset(&self) {
        self.translators.write().clear();
    }

    fn translator(&self, kind: &str) -> Option<Arc<dyn PlanNodeTranslator>> {
        self.translators.read().get(kind).cloned()
    }

    pub fn create_operator(
        &self,
        ctx: OperatorCtx,
        node: &PlanNode,
    ) -> Result<Box<dyn Operator>, OpError> {
        match node {
            PlanNode::Values {
                values,
                repeat_times,
                ..
            } => Ok(Box::new(ValuesOperator::new(
                ctx,
                Arc::clone(values),
                *repeat_times,
            ))),
            PlanNode::Filter { predicate, .. } => {
                Ok(Box::new(FilterOperator::new(ctx, predicate)?))
            }
            PlanNode::RowNumber {
                partition_keys,
                limit,
                generate_row_number,
                ..
            } => Ok(Box::new(RowNumberOperator::new(
                ctx,
                partition_keys.clone(),
                *limit,
                *generate_row_number,
            ))),
            PlanNode::Custom { kind, id, .. } => {
                let translator = self.translator(kind).ok_or_else(|| {
                    OpError::Plan(format!(
                        "no translator registered for plan node {id} of kind '{kind}'"
                    ))
                })?;
                translator.to_operator(ctx, node)
            }
        }
    }

    /// Drivers a plan may run with, given the requested `max_drivers`.
    pub fn max_drivers(&self, plan: &PlanNode, max_drivers: usize) -> usize {
        let mut count = max_drivers.max(1);
        for node in plan.linearize() {
            let limit = match node {
                PlanNode::Values { parallelizable, .. } => (!*parallelizable).then_some(1),
                PlanNode::Custom { kind, .. } => {
                    self.translator(kind).and_then(|t| t.max_drivers(node))
                }
                PlanNode::Filter { .. } | PlanNode::RowNumber { .. } => None,
            };
            if let Some(limit) = limit {
                count = count.min(limit.max(1));
            }
        }
        count
    }
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<String> = self.translators.read().keys().cloned().collect();
        kinds.sort();
        f.debug_struct("OperatorRegistry").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ctx;
    use strata_core::{PlanBuilder, RowBatch};

    struct PassThroughTranslator;

    struct PassThrough {
        ctx: OperatorCtx,
        pending: Option<RowBatch>,
        no_more_input: bool,
    }

    impl Operator for PassThrough {
        fn ctx(&self) -> &OperatorCtx {
            &self.ctx
        }
        fn needs_input(&self) -> bool {
            !self.no_more_input && self.pending.is_none()
        }
        fn add_input(&mut self, batch: RowBatch) -> Result<(), OpError> {
            self.pending = Some(batch);
            Ok(())
        }
        fn no_more_input(&mut self) -> Result<(), OpError> {
            self.no_more_input = true;
            Ok(())
        }
        fn get_output(&mut self) -> Result<Option<RowBatch>, OpError> {
            Ok(self.pending.take())
        }
        fn is_finished(&self) -> bool {
            self.no_more_input && self.pending.is_none()
        }
    }

    impl PlanNodeTranslator for PassThroughTranslator {
        fn kind(&self) -> &str {
            "PassThrough"
        }

        fn to_operator(
            &self,
            ctx: OperatorCtx,
            _node: &PlanNode,
        ) -> Result<Box<dyn Operator>, OpError> {
            Ok(Box::new(PassThrough {
                ctx,
                pending: None,
                no_more_input: false,
            }))
        }

        fn max_drivers(&self, _node: &PlanNode) -> Option<usize> {
            Some(2)
        }
    }

    #[test]
    fn custom_nodes_resolve_through_registry() {
        let registry = OperatorRegistry::new();
        let plan = PlanBuilder::new()
            .values(vec![RowBatch::new(vec![])], true)
            .custom("PassThrough", serde_json::Value::Null)
            .plan_node()
            .unwrap();
        assert!(matches!(
            registry.create_operator(ctx("PassThrough", 1 << 20), &plan),
            Err(OpError::Plan(_))
        ));
        assert_eq!(registry.max_drivers(&plan, 8), 8);

        assert!(registry.register(Arc::new(PassThroughTranslator)).is_none());
        let op = registry.create_operator(ctx("PassThrough", 1 << 20), &plan).unwrap();
        assert_eq!(op.operator_type(), "PassThrough");
        assert_eq!(registry.max_drivers(&plan, 8), 2);

        registry.reset();
        assert!(!registry.contains("PassThrough"));
    }

    #[test]
    fn serial_values_limit_drivers() {
        let registry = OperatorRegistry::new();
        let plan = PlanBuilder::new()
            .values(vec![RowBatch::new(vec![])], false)
            .filter("c0 > 1")
            .plan_node()
            .unwrap();
        assert_eq!(registry.max_drivers(&plan, 4), 1);
        assert!(registry
            .create_operator(ctx("Filter", 1 << 20), &plan)
            .is_ok());
    }
}
