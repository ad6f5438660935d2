// # Expression Evaluator
//
// Tree-walking evaluation of rule-language expressions against one entity
// snapshot plus bound loop variables. Graph I/O (the EXISTS containment
// probe) is the only suspension point; everything else is pure walking.
//
// Null discipline: unresolved paths read as NULL, NULL operands collapse
// comparisons to false (except IS NULL / IS NOT NULL, and NULL == NULL
// which holds), and guard results fold to plain two-valued booleans.

pub mod functions;

use crate::ast::{ComparisonOp, Expression, LogicalOp, Path, PathHead};
use crate::common::Value;
use crate::error::{EngineError, Result};
use crate::graph::{Entity, GraphDriver};
use crate::query;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything one expression evaluation can see. Lives for a single rule
/// firing or action execution and is never shared across tasks.
pub struct EvalContext {
    this_entity: Option<Entity>,
    variables: HashMap<String, Entity>,
    params: HashMap<String, Value>,
    old_values: HashMap<String, Value>,
    new_values: HashMap<String, Value>,
    changed_property: Option<String>,
    driver: Arc<dyn GraphDriver>,
    now: DateTime<Utc>,
}

impl EvalContext {
    pub fn new(driver: Arc<dyn GraphDriver>) -> Self {
        Self {
            this_entity: None,
            variables: HashMap::new(),
            params: HashMap::new(),
            old_values: HashMap::new(),
            new_values: HashMap::new(),
            changed_property: None,
            driver,
            now: Utc::now(),
        }
    }

    pub fn with_this(mut self, entity: Entity) -> Self {
        self.this_entity = Some(entity);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, entity: Entity) -> Self {
        self.variables.insert(name.into(), entity);
        self
    }

    pub fn with_params(mut self, params: HashMap<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Record the triggering property transition consulted by CHANGED.
    pub fn with_change(mut self, property: impl Into<String>, old: Value, new: Value) -> Self {
        let property = property.into();
        self.old_values.insert(property.clone(), old);
        self.new_values.insert(property.clone(), new);
        self.changed_property = Some(property);
        self
    }

    /// Freeze the evaluation clock; NOW() reads this value for the whole
    /// firing.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn driver(&self) -> Arc<dyn GraphDriver> {
        Arc::clone(&self.driver)
    }

    pub fn this(&self) -> Option<&Entity> {
        self.this_entity.as_ref()
    }

    /// Keep the local snapshot in step with effect writes so later
    /// statements observe them.
    pub fn set_this_property(&mut self, name: &str, value: Value) {
        if let Some(entity) = self.this_entity.as_mut() {
            entity.set_property(name, value);
        }
    }

    pub fn bind(&mut self, name: impl Into<String>, entity: Entity) {
        self.variables.insert(name.into(), entity);
    }

    pub fn unbind(&mut self, name: &str) {
        self.variables.remove(name);
    }

    pub fn variables(&self) -> &HashMap<String, Entity> {
        &self.variables
    }

    pub fn params(&self) -> &HashMap<String, Value> {
        &self.params
    }

    /// Resolve a variable name to an entity; `this` reaches the subject
    /// entity when one is present.
    pub fn entity(&self, name: &str) -> Option<&Entity> {
        if name == "this" {
            self.this_entity.as_ref()
        } else {
            self.variables.get(name)
        }
    }

    fn resolve_path(&self, path: &Path) -> Value {
        let head = path.head_name();
        if let Some(entity) = self.entity(head) {
            return match path.segments.as_slice() {
                [] => Value::String(entity.id.clone()),
                [property] => entity.property_or_null(property),
                _ => Value::Null,
            };
        }
        // Action parameters resolve as bare names
        if path.segments.is_empty() {
            if let PathHead::Variable(name) = &path.head {
                if let Some(value) = self.params.get(name) {
                    return value.clone();
                }
            }
        }
        Value::Null
    }

    /// Evaluate an expression to a value.
    pub fn evaluate<'a>(&'a self, expr: &'a Expression) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            match expr {
                Expression::Literal(value) => Ok(value.clone()),

                Expression::Path(path) => Ok(self.resolve_path(path)),

                Expression::Comparison { op, left, right } => {
                    let left = self.evaluate(left).await?;
                    let right = self.evaluate(right).await?;
                    Ok(Value::Boolean(compare(*op, &left, &right)))
                }

                Expression::InList { value, items } => {
                    let value = self.evaluate(value).await?;
                    Ok(Value::Boolean(items.iter().any(|item| value.loose_eq(item))))
                }

                Expression::NullCheck { value, negated } => {
                    let value = self.evaluate(value).await?;
                    Ok(Value::Boolean(value.is_null() != *negated))
                }

                Expression::Logical { op, operands } => match op {
                    LogicalOp::Not => {
                        let value = self.evaluate(&operands[0]).await?;
                        Ok(Value::Boolean(!value.truthy()))
                    }
                    LogicalOp::And => {
                        for operand in operands {
                            if !self.evaluate(operand).await?.truthy() {
                                return Ok(Value::Boolean(false));
                            }
                        }
                        Ok(Value::Boolean(true))
                    }
                    LogicalOp::Or => {
                        for operand in operands {
                            if self.evaluate(operand).await?.truthy() {
                                return Ok(Value::Boolean(true));
                            }
                        }
                        Ok(Value::Boolean(false))
                    }
                },

                Expression::FunctionCall { name, args } => {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.evaluate(arg).await?);
                    }
                    functions::call(name, &values, self.now)
                }

                Expression::Matches { value, pattern } => {
                    let value = self.evaluate(value).await?;
                    let Some(text) = value.as_str() else {
                        return Ok(Value::Boolean(false));
                    };
                    // Whole-value match: the pattern is anchored implicitly
                    let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                        EngineError::InvalidInput(format!("invalid pattern '{}': {}", pattern, e))
                    })?;
                    Ok(Value::Boolean(regex.is_match(text)))
                }

                Expression::Changed { property, from, to } => {
                    if self.changed_property.as_deref() != Some(property.as_str()) {
                        // Only the triggering property carries old/new values
                        return Ok(Value::Boolean(false));
                    }
                    let old = self.old_values.get(property).cloned().unwrap_or(Value::Null);
                    let new = self.new_values.get(property).cloned().unwrap_or(Value::Null);
                    let result = match (from, to) {
                        (Some(from), Some(to)) => old.loose_eq(from) && new.loose_eq(to),
                        _ => !old.loose_eq(&new),
                    };
                    Ok(Value::Boolean(result))
                }

                Expression::Exists {
                    from_var,
                    relationship,
                    to_var,
                    filter,
                } => {
                    let from = self.entity(from_var).ok_or_else(|| {
                        EngineError::UnknownVariable(from_var.clone())
                    })?;
                    let to = self
                        .entity(to_var)
                        .ok_or_else(|| EngineError::UnknownVariable(to_var.clone()))?;
                    let query = query::translate_containment(
                        from_var,
                        &from.label,
                        &from.id,
                        relationship,
                        to_var,
                        &to.label,
                        &to.id,
                        filter.as_deref(),
                    )?;
                    let rows = self.driver.run(&query.text, &query.params).await?;
                    Ok(Value::Boolean(!rows.is_empty()))
                }
            }
        })
    }

    /// Evaluate and collapse to a two-valued boolean.
    pub async fn truthy(&self, expr: &Expression) -> Result<bool> {
        Ok(self.evaluate(expr).await?.truthy())
    }
}

/// Comparison with the engine's null discipline.
fn compare(op: ComparisonOp, left: &Value, right: &Value) -> bool {
    match op {
        ComparisonOp::Eq => left.loose_eq(right),
        ComparisonOp::Ne => {
            if left.is_null() || right.is_null() {
                false
            } else {
                !left.loose_eq(right)
            }
        }
        ComparisonOp::Lt | ComparisonOp::Gt | ComparisonOp::Le | ComparisonOp::Ge => {
            match left.loose_cmp(right) {
                Some(ordering) => match op {
                    ComparisonOp::Lt => ordering.is_lt(),
                    ComparisonOp::Gt => ordering.is_gt(),
                    ComparisonOp::Le => ordering.is_le(),
                    ComparisonOp::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                },
                None => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResultRow;
    use async_trait::async_trait;

    struct NullDriver;

    #[async_trait]
    impl GraphDriver for NullDriver {
        async fn run(
            &self,
            _query: &str,
            _params: &HashMap<String, Value>,
        ) -> Result<Vec<ResultRow>> {
            Ok(Vec::new())
        }
    }

    fn ctx() -> EvalContext {
        EvalContext::new(Arc::new(NullDriver)).with_this(
            Entity::new("PO_1", "PurchaseOrder")
                .with_property("status", "Open")
                .with_property("amount", 100i64),
        )
    }

    fn path(head: &str, prop: &str) -> Expression {
        if head == "this" {
            Expression::Path(Path::this(vec![prop.to_string()]))
        } else {
            Expression::Path(Path::variable(head, vec![prop.to_string()]))
        }
    }

    fn lit(value: impl Into<Value>) -> Expression {
        Expression::Literal(value.into())
    }

    fn cmp(op: ComparisonOp, left: Expression, right: Expression) -> Expression {
        Expression::Comparison {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[tokio::test]
    async fn test_path_resolution() {
        let ctx = ctx();
        let value = ctx.evaluate(&path("this", "status")).await.unwrap();
        assert_eq!(value, Value::String("Open".into()));
        // Unresolved paths read as NULL, never an error
        let missing = ctx.evaluate(&path("this", "nope")).await.unwrap();
        assert_eq!(missing, Value::Null);
        let unbound = ctx.evaluate(&path("ghost", "x")).await.unwrap();
        assert_eq!(unbound, Value::Null);
    }

    #[tokio::test]
    async fn test_null_comparison_semantics() {
        let ctx = ctx();
        // null operand in an ordering comparison yields false, not an error
        let expr = cmp(ComparisonOp::Gt, path("this", "missing"), lit(0i64));
        assert!(!ctx.truthy(&expr).await.unwrap());
        // NULL == NULL holds
        let expr = cmp(ComparisonOp::Eq, path("this", "missing"), lit(Value::Null));
        assert!(ctx.truthy(&expr).await.unwrap());
        // NULL != anything is false
        let expr = cmp(ComparisonOp::Ne, path("this", "missing"), lit(1i64));
        assert!(!ctx.truthy(&expr).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_null_checks() {
        let ctx = ctx();
        let expr = Expression::NullCheck {
            value: Box::new(path("this", "missing")),
            negated: false,
        };
        assert!(ctx.truthy(&expr).await.unwrap());
        let expr = Expression::NullCheck {
            value: Box::new(path("this", "status")),
            negated: true,
        };
        assert!(ctx.truthy(&expr).await.unwrap());
    }

    #[tokio::test]
    async fn test_numeric_coercion_in_comparison() {
        let ctx = ctx();
        let expr = cmp(ComparisonOp::Ge, path("this", "amount"), lit(99.5));
        assert!(ctx.truthy(&expr).await.unwrap());
    }

    #[tokio::test]
    async fn test_mixed_type_ordering_is_false() {
        let ctx = ctx();
        let expr = cmp(ComparisonOp::Lt, path("this", "status"), lit(10i64));
        assert!(!ctx.truthy(&expr).await.unwrap());
    }

    #[tokio::test]
    async fn test_in_list() {
        let ctx = ctx();
        let expr = Expression::InList {
            value: Box::new(path("this", "status")),
            items: vec![Value::String("Open".into()), Value::String("Draft".into())],
        };
        assert!(ctx.truthy(&expr).await.unwrap());
    }

    #[tokio::test]
    async fn test_short_circuit_and() {
        let ctx = ctx();
        // Second operand would raise UnknownFunction if evaluated
        let expr = Expression::Logical {
            op: LogicalOp::And,
            operands: vec![
                lit(false),
                Expression::FunctionCall {
                    name: "BROKEN".into(),
                    args: Vec::new(),
                },
            ],
        };
        assert!(!ctx.truthy(&expr).await.unwrap());
    }

    #[tokio::test]
    async fn test_matches_is_anchored() {
        let ctx = ctx();
        let expr = Expression::Matches {
            value: Box::new(path("this", "status")),
            pattern: "Op".into(),
        };
        assert!(!ctx.truthy(&expr).await.unwrap());
        let expr = Expression::Matches {
            value: Box::new(path("this", "status")),
            pattern: "Op.*".into(),
        };
        assert!(ctx.truthy(&expr).await.unwrap());
    }

    #[tokio::test]
    async fn test_changed_consults_trigger_transition() {
        let ctx = ctx().with_change(
            "status",
            Value::String("Active".into()),
            Value::String("Suspended".into()),
        );
        let expr = Expression::Changed {
            property: "status".into(),
            from: None,
            to: None,
        };
        assert!(ctx.truthy(&expr).await.unwrap());
        let expr = Expression::Changed {
            property: "status".into(),
            from: Some(Value::String("Active".into())),
            to: Some(Value::String("Suspended".into())),
        };
        assert!(ctx.truthy(&expr).await.unwrap());
        let expr = Expression::Changed {
            property: "status".into(),
            from: Some(Value::String("Draft".into())),
            to: Some(Value::String("Suspended".into())),
        };
        assert!(!ctx.truthy(&expr).await.unwrap());
        // Any property other than the triggering one reads as unchanged
        let expr = Expression::Changed {
            property: "amount".into(),
            from: None,
            to: None,
        };
        assert!(!ctx.truthy(&expr).await.unwrap());
    }

    #[tokio::test]
    async fn test_changed_with_equal_old_and_new_is_false() {
        let ctx = ctx().with_change(
            "status",
            Value::String("Open".into()),
            Value::String("Open".into()),
        );
        let expr = Expression::Changed {
            property: "status".into(),
            from: None,
            to: None,
        };
        assert!(!ctx.truthy(&expr).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_function_fails_firing() {
        let ctx = ctx();
        let expr = Expression::FunctionCall {
            name: "MYSTERY".into(),
            args: Vec::new(),
        };
        assert!(matches!(
            ctx.evaluate(&expr).await.unwrap_err(),
            EngineError::UnknownFunction(_)
        ));
    }

    #[tokio::test]
    async fn test_now_is_frozen_across_calls() {
        let ctx = ctx();
        let expr = Expression::FunctionCall {
            name: "NOW".into(),
            args: Vec::new(),
        };
        let first = ctx.evaluate(&expr).await.unwrap();
        let second = ctx.evaluate(&expr).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_parameter_resolution() {
        let ctx = EvalContext::new(Arc::new(NullDriver)).with_params(
            [("approver".to_string(), Value::String("kim".into()))].into(),
        );
        let expr = Expression::Path(Path::variable("approver", vec![]));
        assert_eq!(
            ctx.evaluate(&expr).await.unwrap(),
            Value::String("kim".into())
        );
    }

    #[tokio::test]
    async fn test_exists_probe_with_empty_graph() {
        let ctx = EvalContext::new(Arc::new(NullDriver))
            .with_variable("po", Entity::new("PO_1", "PurchaseOrder"))
            .with_variable("s", Entity::new("BP_1", "Supplier"));
        let expr = Expression::Exists {
            from_var: "po".into(),
            relationship: "orderedFrom".into(),
            to_var: "s".into(),
            filter: None,
        };
        assert!(!ctx.truthy(&expr).await.unwrap());
    }
}
