use std::{fmt, sync::Arc};

use log::trace;
use serde_json::Value;

use super::planner::TransformPlan;
use crate::core::{RouteError, RouteResult, Transformer};

/// Ordered transformers applied to one payload
#[derive(Clone, Default)]
pub struct TransformChain {
    transformers: Vec<Arc<dyn Transformer>>,
}

impl TransformChain {
    pub fn new(transformers: Vec<Arc<dyn Transformer>>) -> Self {
        Self { transformers }
    }

    /// Request-direction transformers of the plan, in path order.
    pub fn for_requests(plan: &TransformPlan) -> Self {
        Self::new(
            plan.steps()
                .iter()
                .filter_map(|step| step.request.clone())
                .collect(),
        )
    }

    /// Response-direction transformers of the plan, in reverse path order.
    pub fn for_responses(plan: &TransformPlan) -> Self {
        Self::new(
            plan.steps()
                .iter()
                .rev()
                .filter_map(|step| step.response.clone())
                .collect(),
        )
    }

    /// Thread the payload through every transformer. Stops at the first failure.
    pub fn apply(&self, payload: Value) -> RouteResult<Value> {
        self.transformers.iter().try_fold(payload, |payload, t| {
            trace!("applying transformer '{}'", t.id());
            t.apply(payload).map_err(|e| match e {
                RouteError::Transformer { .. } => e,
                other => RouteError::Transformer {
                    transformer_id: t.id().to_string(),
                    message: other.to_string(),
                },
            })
        })
    }

    pub fn ids(&self) -> Vec<&str> {
        self.transformers.iter().map(|t| t.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }
}

impl fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use semver::Version;
    use serde_json::json;

    use super::*;
    use crate::transform::{Direction, FnTransformer, TransformerSpec};

    fn fn_transformer(
        id: &str,
        f: impl Fn(Value) -> RouteResult<Value> + Send + Sync + 'static,
    ) -> Arc<dyn Transformer> {
        Arc::new(FnTransformer::new(
            TransformerSpec::new(
                id,
                "h",
                Version::new(1, 0, 0),
                Version::new(2, 0, 0),
                Direction::Request,
            ),
            f,
        ))
    }

    #[test]
    fn test_apply_in_order() {
        let chain = TransformChain::new(vec![
            fn_transformer("a", |mut v| {
                v["trail"] = json!("a");
                Ok(v)
            }),
            fn_transformer("b", |mut v| {
                let trail = format!("{}b", v["trail"].as_str().unwrap_or_default());
                v["trail"] = json!(trail);
                Ok(v)
            }),
        ]);
        assert_eq!(chain.ids(), vec!["a", "b"]);
        assert_eq!(chain.apply(json!({})).unwrap(), json!({"trail": "ab"}));
    }

    #[test]
    fn test_foreign_errors_are_attributed_to_transformer() {
        let chain = TransformChain::new(vec![fn_transformer("boom", |_| {
            Err(RouteError::Internal("unexpected".to_string()))
        })]);
        match chain.apply(json!({})) {
            Err(RouteError::Transformer {
                transformer_id,
                message,
            }) => {
                assert_eq!(transformer_id, "boom");
                assert!(message.contains("unexpected"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let chain = TransformChain::default();
        assert!(chain.is_empty());
        assert_eq!(chain.apply(json!({"a": 1})).unwrap(), json!({"a": 1}));
    }
}
