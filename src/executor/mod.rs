// # Action Executor
//
// Runs one action against one entity: resolve, validate parameters, gate on
// preconditions in declaration order, then apply effect statements. Every
// property write goes through a parameterized update on the graph driver
// and is recorded both in the `changes` mapping (subject entity) and as a
// change event for cascade folding.
//
// The executor never raises across its boundary: callers always get an
// `ExecutionResult`.

use crate::ast::{ActionDef, PathHead, Statement};
use crate::common::Value;
use crate::error::{EngineError, Result};
use crate::eval::EvalContext;
use crate::events::ChangeEvent;
use crate::graph::{Entity, GraphDriver};
use crate::query::{self, BoundVariable};
use crate::registry::ActionRegistry;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// Bound on TRIGGER-within-effect recursion when the executor runs outside
/// an engine cascade.
const MAX_TRIGGER_DEPTH: usize = 8;

/// Why an action execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ActionNotFound,
    InvalidParameters,
    PreconditionFailed,
    PreconditionError,
    EffectError,
}

/// Outcome of one action execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub error: Option<String>,
    pub kind: Option<FailureKind>,

    /// Properties written on the subject entity
    pub changes: HashMap<String, Value>,

    /// Every property write performed, as cascade-ready events
    pub events: Vec<ChangeEvent>,
}

impl ExecutionResult {
    fn success(log: EffectLog) -> Self {
        Self {
            success: true,
            error: None,
            kind: None,
            changes: log.changes,
            events: log.events,
        }
    }

    fn failure(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            kind: Some(kind),
            changes: HashMap::new(),
            events: Vec::new(),
        }
    }

    fn failure_with_log(kind: FailureKind, error: impl Into<String>, log: EffectLog) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            kind: Some(kind),
            changes: log.changes,
            events: log.events,
        }
    }
}

/// Writes accumulated while walking effect statements.
#[derive(Debug, Default)]
struct EffectLog {
    changes: HashMap<String, Value>,
    events: Vec<ChangeEvent>,
}

/// Checks preconditions and applies effects for registered actions.
pub struct ActionExecutor {
    actions: Arc<ActionRegistry>,
    driver: Arc<dyn GraphDriver>,
}

impl ActionExecutor {
    pub fn new(actions: Arc<ActionRegistry>, driver: Arc<dyn GraphDriver>) -> Self {
        Self { actions, driver }
    }

    /// Execute `entity_type.action_name` against the given entity snapshot.
    pub async fn execute(
        &self,
        entity_type: &str,
        action_name: &str,
        entity_id: &str,
        entity: &Entity,
        params: HashMap<String, Value>,
    ) -> ExecutionResult {
        self.execute_with_depth(entity_type, action_name, entity_id, entity, params, 0)
            .await
    }

    async fn execute_with_depth(
        &self,
        entity_type: &str,
        action_name: &str,
        entity_id: &str,
        entity: &Entity,
        params: HashMap<String, Value>,
        depth: usize,
    ) -> ExecutionResult {
        let Some(action) = self.actions.lookup(entity_type, action_name) else {
            return ExecutionResult::failure(
                FailureKind::ActionNotFound,
                format!("Action {}.{} not found", entity_type, action_name),
            );
        };

        if let Err(message) = validate_params(&action, &params) {
            return ExecutionResult::failure(FailureKind::InvalidParameters, message);
        }

        let mut snapshot = entity.clone();
        snapshot.id = entity_id.to_string();
        if snapshot.label.is_empty() {
            snapshot.label = entity_type.to_string();
        }

        let mut ctx = EvalContext::new(Arc::clone(&self.driver))
            .with_this(snapshot)
            .with_params(params);

        // Preconditions gate in declaration order; the first falsy one wins
        for precondition in &action.preconditions {
            match ctx.truthy(&precondition.condition).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        action = %action.qualified_name(),
                        label = precondition.label.as_deref().unwrap_or(""),
                        "precondition rejected"
                    );
                    return ExecutionResult::failure(
                        FailureKind::PreconditionFailed,
                        precondition.on_failure.clone(),
                    );
                }
                Err(error) => {
                    return ExecutionResult::failure(
                        FailureKind::PreconditionError,
                        error.to_string(),
                    );
                }
            }
        }

        let mut log = EffectLog::default();
        if let Err(error) = self
            .run_statements(&mut ctx, &action.effect, &mut log, depth)
            .await
        {
            // Applied writes are not rolled back; the log keeps them visible
            return ExecutionResult::failure_with_log(
                FailureKind::EffectError,
                error.to_string(),
                log,
            );
        }

        ExecutionResult::success(log)
    }

    /// Walk effect statements, recursing through nested FOR and TRIGGER.
    fn run_statements<'a>(
        &'a self,
        ctx: &'a mut EvalContext,
        statements: &'a [Statement],
        log: &'a mut EffectLog,
        depth: usize,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for statement in statements {
                match statement {
                    Statement::Set { target, value } => {
                        self.apply_set(ctx, target, value, log).await?;
                    }
                    Statement::Trigger {
                        entity_var,
                        entity_type,
                        action,
                        args,
                    } => {
                        if depth >= MAX_TRIGGER_DEPTH {
                            return Err(EngineError::CascadeOverflow(format!(
                                "TRIGGER recursion exceeded {} levels at {}.{}",
                                MAX_TRIGGER_DEPTH, entity_type, action
                            )));
                        }
                        let target = ctx
                            .entity(entity_var)
                            .cloned()
                            .ok_or_else(|| EngineError::UnknownVariable(entity_var.clone()))?;
                        let mut call_params = HashMap::new();
                        for (name, expr) in args {
                            call_params.insert(name.clone(), ctx.evaluate(expr).await?);
                        }
                        let result = self
                            .execute_with_depth(
                                entity_type,
                                action,
                                &target.id,
                                &target,
                                call_params,
                                depth + 1,
                            )
                            .await;
                        log.events.extend(result.events.clone());
                        if !result.success {
                            return Err(EngineError::Execution(format!(
                                "TRIGGER {}.{} failed: {}",
                                entity_type,
                                action,
                                result.error.unwrap_or_default()
                            )));
                        }
                    }
                    Statement::For(clause) => {
                        let mut bound: Vec<BoundVariable> = ctx
                            .variables()
                            .iter()
                            .map(|(name, entity)| {
                                BoundVariable::new(name.clone(), entity.id.clone(), entity.label.clone())
                            })
                            .collect();
                        bound.sort_by(|a, b| a.name.cmp(&b.name));
                        if let Some(this) = ctx.this() {
                            bound.push(BoundVariable::new("this", this.id.clone(), this.label.clone()));
                        }
                        let query = query::translate_for(clause, &bound)?;
                        let rows = self.driver.run(&query.text, &query.params).await?;
                        for row in rows {
                            let Some(entity) = row.get(&clause.variable) else {
                                continue;
                            };
                            ctx.bind(&clause.variable, entity.clone());
                            let outcome = self
                                .run_statements(ctx, &clause.body, log, depth)
                                .await;
                            ctx.unbind(&clause.variable);
                            outcome?;
                        }
                    }
                }
            }
            Ok(())
        })
    }

    async fn apply_set(
        &self,
        ctx: &mut EvalContext,
        target: &crate::ast::Path,
        value_expr: &crate::ast::Expression,
        log: &mut EffectLog,
    ) -> Result<()> {
        let property = target
            .property()
            .ok_or_else(|| EngineError::InvalidInput(format!("SET target '{}'", target)))?
            .to_string();
        let value = ctx.evaluate(value_expr).await?;

        let subject = match &target.head {
            PathHead::This => ctx
                .this()
                .cloned()
                .ok_or_else(|| EngineError::UnknownVariable("this".to_string()))?,
            PathHead::Variable(name) => ctx
                .entity(name)
                .cloned()
                .ok_or_else(|| EngineError::UnknownVariable(name.clone()))?,
        };

        let old = subject.property_or_null(&property);
        let update = query::translate_set(&subject.label, &property, &subject.id, value.clone())?;
        self.driver.run(&update.text, &update.params).await?;

        // Keep the local snapshots in step so later statements observe the
        // write
        match &target.head {
            PathHead::This => {
                ctx.set_this_property(&property, value.clone());
                log.changes.insert(property.clone(), value.clone());
            }
            PathHead::Variable(name) => {
                let mut updated = subject.clone();
                updated.set_property(&property, value.clone());
                ctx.bind(name, updated);
            }
        }

        log.events.push(ChangeEvent::update(
            subject.label,
            subject.id,
            property,
            old,
            value,
        ));
        Ok(())
    }
}

fn validate_params(action: &ActionDef, params: &HashMap<String, Value>) -> std::result::Result<(), String> {
    for name in params.keys() {
        if !action.parameters.iter().any(|p| &p.name == name) {
            return Err(format!("Invalid parameters: unknown parameter '{}'", name));
        }
    }
    for declared in &action.parameters {
        match params.get(&declared.name) {
            Some(value) if !value.is_null() => {
                if !declared.param_type.accepts(value) {
                    return Err(format!(
                        "Invalid parameters: '{}' expects {}, got {}",
                        declared.name,
                        declared.param_type.as_str(),
                        value.type_name()
                    ));
                }
            }
            _ if declared.optional => {}
            _ => {
                return Err(format!(
                    "Invalid parameters: missing required parameter '{}'",
                    declared.name
                ));
            }
        }
    }
    Ok(())
}
