// # Rule Engine Core
//
// Consumes change events, matches rules through the trigger index, and
// drives firings: translate the outer FOR with the triggering entity
// pre-bound, iterate rows, execute statements in declaration order.
//
// Cascade control: SET writes become synthetic events enqueued FIFO and
// drained after the current rule finishes, with a hard depth bound and a
// bounded queue. Within one delivered event, a (rule, entity) pair fires at
// most once; re-entry across cascade generations is governed by the depth
// bound. One rule's failure is logged and does not abort its siblings.

use crate::ast::{PathHead, RuleDef, Statement, TriggerType};
use crate::error::{EngineError, Result};
use crate::eval::EvalContext;
use crate::events::{ChangeEvent, EventEmitter, EventSubscriber};
use crate::executor::ActionExecutor;
use crate::graph::GraphDriver;
use crate::query::{self, BoundVariable};
use crate::registry::{ActionRegistry, RuleRegistry};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Engine tuning knobs, owned per engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on cascade depth; deeper branches are dropped
    pub max_cascade_depth: usize,

    /// Bound on the per-firing cascade queue
    pub max_queue_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cascade_depth: 10,
            max_queue_len: 256,
        }
    }
}

/// Cooperative cancellation flag checked at every suspension point.
/// In-flight writes are not rolled back; enqueued cascades are abandoned.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Lifecycle of one rule firing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FiringPhase {
    Pending,
    Matched,
    Iterating,
    Completed,
    Failed,
}

/// Per-firing diagnostics handed back to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiringReport {
    pub rule_name: String,
    pub entity_id: String,
    pub phase: FiringPhase,
    pub rows_matched: usize,
    pub writes: usize,
    pub error: Option<String>,
}

impl FiringReport {
    fn new(rule_name: &str, entity_id: &str) -> Self {
        Self {
            rule_name: rule_name.to_string(),
            entity_id: entity_id.to_string(),
            phase: FiringPhase::Pending,
            rows_matched: 0,
            writes: 0,
            error: None,
        }
    }

    fn fail(mut self, error: EngineError) -> Self {
        tracing::warn!(rule = %self.rule_name, %error, "rule firing failed");
        self.phase = FiringPhase::Failed;
        self.error = Some(error.to_string());
        self
    }
}

/// Event-driven rule engine over a graph driver.
pub struct RuleEngine {
    rules: Arc<RuleRegistry>,
    actions: Arc<ActionRegistry>,
    executor: ActionExecutor,
    driver: Arc<dyn GraphDriver>,
    outbound: Arc<EventEmitter>,
    config: EngineConfig,
}

impl RuleEngine {
    pub fn new(
        rules: Arc<RuleRegistry>,
        actions: Arc<ActionRegistry>,
        driver: Arc<dyn GraphDriver>,
        config: EngineConfig,
    ) -> Self {
        let executor = ActionExecutor::new(Arc::clone(&actions), Arc::clone(&driver));
        Self {
            rules,
            actions,
            executor,
            driver,
            outbound: Arc::new(EventEmitter::new()),
            config,
        }
    }

    pub fn rules(&self) -> Arc<RuleRegistry> {
        Arc::clone(&self.rules)
    }

    pub fn actions(&self) -> Arc<ActionRegistry> {
        Arc::clone(&self.actions)
    }

    /// Diagnostics channel carrying the synthetic events produced by rule
    /// and action writes. The engine itself never subscribes here.
    pub fn outbound(&self) -> Arc<EventEmitter> {
        Arc::clone(&self.outbound)
    }

    pub fn load_rules_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        self.rules.load_from_file(path)
    }

    /// Process one change event and the cascade it produces.
    pub async fn on_event(&self, event: ChangeEvent) -> Vec<FiringReport> {
        self.on_event_cancellable(event, &CancelHandle::new()).await
    }

    /// As `on_event`, with cooperative cancellation.
    pub async fn on_event_cancellable(
        &self,
        event: ChangeEvent,
        cancel: &CancelHandle,
    ) -> Vec<FiringReport> {
        let mut queue: VecDeque<(ChangeEvent, usize)> = VecDeque::new();
        queue.push_back((event, 0));

        let mut reports = Vec::new();
        // One (rule, entity) firing per cascade generation
        let mut visited: HashSet<(String, String, usize)> = HashSet::new();

        while let Some((event, depth)) = queue.pop_front() {
            if cancel.is_cancelled() {
                break;
            }
            if depth >= self.config.max_cascade_depth {
                tracing::warn!(
                    key = %event.trigger_key(),
                    entity = %event.entity_id,
                    depth,
                    "cascade overflow: depth bound hit, branch dropped"
                );
                continue;
            }

            let bucket = self.rules.get_by_key(&event.trigger_key());
            for rule in bucket {
                if cancel.is_cancelled() {
                    break;
                }
                let key = (rule.name.clone(), event.entity_id.clone(), depth);
                if !visited.insert(key) {
                    continue;
                }
                let report = self
                    .fire_rule(&rule, &event, depth, &mut queue, cancel)
                    .await;
                reports.push(report);
            }
        }
        reports
    }

    async fn fire_rule(
        &self,
        rule: &RuleDef,
        event: &ChangeEvent,
        depth: usize,
        queue: &mut VecDeque<(ChangeEvent, usize)>,
        cancel: &CancelHandle,
    ) -> FiringReport {
        let mut report = FiringReport::new(&rule.name, &event.entity_id);
        tracing::debug!(rule = %rule.name, key = %event.trigger_key(), "firing");

        // The triggering entity pre-binds the outer loop variable
        let bound = [BoundVariable::new(
            rule.body.variable.clone(),
            event.entity_id.clone(),
            event.entity_type.clone(),
        )];
        let translated = match query::translate_for(&rule.body, &bound) {
            Ok(translated) => translated,
            Err(error) => return report.fail(error),
        };
        let rows = match self.driver.run(&translated.text, &translated.params).await {
            Ok(rows) => rows,
            Err(error) => return report.fail(error),
        };
        report.phase = FiringPhase::Matched;
        report.rows_matched = rows.len();

        let mut ctx = EvalContext::new(Arc::clone(&self.driver));
        if let (TriggerType::Update, Some(property)) = (&event.kind, &event.property) {
            ctx = ctx.with_change(
                property.clone(),
                event.old_value.clone(),
                event.new_value.clone(),
            );
        }

        for row in rows {
            if cancel.is_cancelled() {
                break;
            }
            report.phase = FiringPhase::Iterating;
            let Some(entity) = row.get(&rule.body.variable) else {
                continue;
            };
            ctx.bind(&rule.body.variable, entity.clone());
            let outcome = self
                .run_statements(&mut ctx, &rule.body.body, depth, queue, &mut report.writes, cancel)
                .await;
            ctx.unbind(&rule.body.variable);
            if let Err(error) = outcome {
                return report.fail(error);
            }
        }

        report.phase = FiringPhase::Completed;
        report
    }

    /// Statements of one rule row, in declaration order. SET writes enqueue
    /// synthetic events for the cascade; TRIGGER hands off to the action
    /// executor; nested FOR recurses with the accumulated bindings.
    fn run_statements<'a>(
        &'a self,
        ctx: &'a mut EvalContext,
        statements: &'a [Statement],
        depth: usize,
        queue: &'a mut VecDeque<(ChangeEvent, usize)>,
        writes: &'a mut usize,
        cancel: &'a CancelHandle,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for statement in statements {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                match statement {
                    Statement::Set { target, value } => {
                        let PathHead::Variable(name) = &target.head else {
                            return Err(EngineError::Semantic(
                                "'this' is not bound in rule bodies".to_string(),
                            ));
                        };
                        let subject = ctx
                            .entity(name)
                            .cloned()
                            .ok_or_else(|| EngineError::UnknownVariable(name.clone()))?;
                        let property = target
                            .property()
                            .ok_or_else(|| {
                                EngineError::InvalidInput(format!("SET target '{}'", target))
                            })?
                            .to_string();
                        let value = ctx.evaluate(value).await?;
                        let old = subject.property_or_null(&property);

                        let update = query::translate_set(
                            &subject.label,
                            &property,
                            &subject.id,
                            value.clone(),
                        )?;
                        self.driver.run(&update.text, &update.params).await?;
                        *writes += 1;

                        let mut updated = subject.clone();
                        updated.set_property(&property, value.clone());
                        ctx.bind(name, updated);

                        // Same-value writes still produce an event; CHANGED
                        // downstream reads them as unchanged
                        let synthetic = ChangeEvent::update(
                            subject.label.clone(),
                            subject.id.clone(),
                            property,
                            old,
                            value,
                        );
                        self.outbound.emit(&synthetic).await;
                        self.enqueue(queue, synthetic, depth + 1);
                    }

                    Statement::Trigger {
                        entity_var,
                        entity_type,
                        action,
                        args,
                    } => {
                        let target = ctx
                            .entity(entity_var)
                            .cloned()
                            .ok_or_else(|| EngineError::UnknownVariable(entity_var.clone()))?;
                        let mut params = HashMap::new();
                        for (name, expr) in args {
                            params.insert(name.clone(), ctx.evaluate(expr).await?);
                        }
                        let result = self
                            .executor
                            .execute(entity_type, action, &target.id, &target, params)
                            .await;
                        *writes += result.events.len();
                        for synthetic in result.events {
                            self.outbound.emit(&synthetic).await;
                            self.enqueue(queue, synthetic, depth + 1);
                        }
                        if !result.success {
                            // Action failures surface in their result; the
                            // rule moves on to its next statement
                            tracing::warn!(
                                action = %format!("{}.{}", entity_type, action),
                                entity = %target.id,
                                error = %result.error.unwrap_or_default(),
                                "triggered action failed"
                            );
                        }
                    }

                    Statement::For(clause) => {
                        let mut bound: Vec<BoundVariable> = ctx
                            .variables()
                            .iter()
                            .map(|(name, entity)| {
                                BoundVariable::new(
                                    name.clone(),
                                    entity.id.clone(),
                                    entity.label.clone(),
                                )
                            })
                            .collect();
                        bound.sort_by(|a, b| a.name.cmp(&b.name));

                        let translated = query::translate_for(clause, &bound)?;
                        let rows = self.driver.run(&translated.text, &translated.params).await?;
                        for row in rows {
                            if cancel.is_cancelled() {
                                return Ok(());
                            }
                            let Some(entity) = row.get(&clause.variable) else {
                                continue;
                            };
                            ctx.bind(&clause.variable, entity.clone());
                            let outcome = self
                                .run_statements(ctx, &clause.body, depth, queue, writes, cancel)
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

    fn enqueue(&self, queue: &mut VecDeque<(ChangeEvent, usize)>, event: ChangeEvent, depth: usize) {
        if queue.len() >= self.config.max_queue_len {
            tracing::warn!(
                key = %event.trigger_key(),
                "cascade overflow: queue bound hit, event dropped"
            );
            return;
        }
        queue.push_back((event, depth));
    }
}

/// The engine subscribes to a change-producer's emitter through the same
/// single-capability contract as every other subscriber.
#[async_trait]
impl EventSubscriber for RuleEngine {
    async fn deliver(&self, event: &ChangeEvent) -> Result<()> {
        self.on_event(event.clone()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;
    use crate::graph::memory::MemoryGraph;
    use crate::graph::Entity;
    use parking_lot::Mutex;

    fn engine_with(graph: Arc<MemoryGraph>, rules_text: &str) -> RuleEngine {
        let rules = Arc::new(RuleRegistry::new());
        rules.load_from_text(rules_text).unwrap();
        RuleEngine::new(
            rules,
            Arc::new(ActionRegistry::new()),
            graph,
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_simple_firing_writes_and_reports() {
        let graph = Arc::new(MemoryGraph::new());
        graph.insert(Entity::new("PO_1", "PurchaseOrder").with_property("status", "New"));
        let engine = engine_with(
            graph.clone(),
            r#"
            RULE Tag {
                ON CREATE(PurchaseOrder)
                FOR (po:PurchaseOrder) {
                    SET po.reviewed = FALSE;
                }
            }
            "#,
        );
        let reports = engine.on_event(ChangeEvent::create("PurchaseOrder", "PO_1")).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].phase, FiringPhase::Completed);
        assert_eq!(reports[0].rows_matched, 1);
        assert_eq!(reports[0].writes, 1);
        assert_eq!(graph.property("PO_1", "reviewed"), Value::Boolean(false));
    }

    #[tokio::test]
    async fn test_no_matching_rows_is_not_an_error() {
        let graph = Arc::new(MemoryGraph::new());
        graph.insert(Entity::new("PO_1", "PurchaseOrder").with_property("status", "Closed"));
        let engine = engine_with(
            graph.clone(),
            r#"
            RULE OnlyOpen {
                ON CREATE(PurchaseOrder)
                FOR (po:PurchaseOrder WHERE po.status == "Open") {
                    SET po.reviewed = TRUE;
                }
            }
            "#,
        );
        let reports = engine.on_event(ChangeEvent::create("PurchaseOrder", "PO_1")).await;
        assert_eq!(reports[0].phase, FiringPhase::Completed);
        assert_eq!(reports[0].rows_matched, 0);
        assert_eq!(reports[0].writes, 0);
    }

    #[tokio::test]
    async fn test_rule_failure_does_not_abort_siblings() {
        let graph = Arc::new(MemoryGraph::new());
        graph.insert(Entity::new("PO_1", "PurchaseOrder").with_property("status", "Open"));
        // First rule's guard cannot be translated; the second still runs
        let engine = engine_with(
            graph.clone(),
            r#"
            RULE Broken PRIORITY 10 {
                ON CREATE(PurchaseOrder)
                FOR (po:PurchaseOrder WHERE po.due < NOW()) {
                    SET po.reviewed = TRUE;
                }
            }
            RULE Working PRIORITY 5 {
                ON CREATE(PurchaseOrder)
                FOR (po:PurchaseOrder) {
                    SET po.note = "ok";
                }
            }
            "#,
        );
        let reports = engine.on_event(ChangeEvent::create("PurchaseOrder", "PO_1")).await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].rule_name, "Broken");
        assert_eq!(reports[0].phase, FiringPhase::Failed);
        assert!(reports[0].error.is_some());
        assert_eq!(reports[1].rule_name, "Working");
        assert_eq!(reports[1].phase, FiringPhase::Completed);
        assert_eq!(graph.property("PO_1", "note"), Value::String("ok".into()));
    }

    #[tokio::test]
    async fn test_cancellation_stops_processing() {
        let graph = Arc::new(MemoryGraph::new());
        graph.insert(Entity::new("PO_1", "PurchaseOrder").with_property("status", "Open"));
        let engine = engine_with(
            graph.clone(),
            r#"
            RULE Tag {
                ON CREATE(PurchaseOrder)
                FOR (po:PurchaseOrder) {
                    SET po.reviewed = TRUE;
                }
            }
            "#,
        );
        let cancel = CancelHandle::new();
        cancel.cancel();
        let reports = engine
            .on_event_cancellable(ChangeEvent::create("PurchaseOrder", "PO_1"), &cancel)
            .await;
        assert!(reports.is_empty());
        assert_eq!(graph.property("PO_1", "reviewed"), Value::Null);
    }

    #[tokio::test]
    async fn test_outbound_emits_synthetic_events() {
        let graph = Arc::new(MemoryGraph::new());
        graph.insert(Entity::new("PO_1", "PurchaseOrder").with_property("status", "Open"));
        let engine = engine_with(
            graph.clone(),
            r#"
            RULE Tag {
                ON CREATE(PurchaseOrder)
                FOR (po:PurchaseOrder) {
                    SET po.status = "Tagged";
                }
            }
            "#,
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.outbound().subscribe_fn(move |event| sink.lock().push(event.clone()));
        engine.on_event(ChangeEvent::create("PurchaseOrder", "PO_1")).await;

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger_key(), "UPDATE|PurchaseOrder|status");
        assert_eq!(events[0].old_value, Value::String("Open".into()));
        assert_eq!(events[0].new_value, Value::String("Tagged".into()));
    }
}
