// End-to-end engine scenarios over the embedded graph store: rule loading,
// event-driven matching, cascade control, and the action surface.

use graph_reactor::graph::memory::MemoryGraph;
use graph_reactor::{
    ActionRegistry, ChangeEvent, Entity, EngineConfig, EventEmitter, FiringPhase, RuleEngine,
    RuleRegistry, Value,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

fn engine(graph: Arc<MemoryGraph>, rules_text: &str, actions_text: &str) -> RuleEngine {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let rules = Arc::new(RuleRegistry::new());
    if !rules_text.is_empty() {
        rules.load_from_text(rules_text).unwrap();
    }
    let actions = Arc::new(ActionRegistry::new());
    if !actions_text.is_empty() {
        actions.load_from_text(actions_text).unwrap();
    }
    RuleEngine::new(rules, actions, graph, EngineConfig::default())
}

fn collect_events(engine: &RuleEngine) -> Arc<Mutex<Vec<ChangeEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine
        .outbound()
        .subscribe_fn(move |event| sink.lock().push(event.clone()));
    seen
}

// --------------------------------------------------------------------------
// Supplier blocking cascade
// --------------------------------------------------------------------------

#[tokio::test]
async fn supplier_blocking_cascade() {
    let graph = Arc::new(MemoryGraph::new());
    graph.insert(Entity::new("BP_10001", "Supplier").with_property("status", "Active"));
    graph.insert(Entity::new("PO_001", "PurchaseOrder").with_property("status", "Open"));
    graph.relate("PO_001", "orderedFrom", "BP_10001").unwrap();

    let engine = engine(
        graph.clone(),
        r#"
        RULE R1 PRIORITY 100 {
            ON UPDATE(Supplier.status)
            FOR (s:Supplier WHERE s.status IN ["Expired", "Blacklisted", "Suspended"]) {
                FOR (po:PurchaseOrder WHERE po -[orderedFrom]-> s AND po.status == "Open") {
                    SET po.status = "RiskLocked";
                }
            }
        }
        "#,
        "",
    );
    let events = collect_events(&engine);

    // The change producer applies the mutation, then reports it
    graph.insert(Entity::new("BP_10001", "Supplier").with_property("status", "Suspended"));
    let reports = engine
        .on_event(ChangeEvent::update(
            "Supplier",
            "BP_10001",
            "status",
            Value::String("Active".into()),
            Value::String("Suspended".into()),
        ))
        .await;

    assert_eq!(
        graph.property("PO_001", "status"),
        Value::String("RiskLocked".into())
    );
    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].trigger_key(), "UPDATE|PurchaseOrder|status");
    assert_eq!(events[0].entity_id, "PO_001");

    assert_eq!(reports[0].phase, FiringPhase::Completed);
    assert_eq!(reports[0].writes, 1);
}

#[tokio::test]
async fn guard_false_means_no_writes() {
    let graph = Arc::new(MemoryGraph::new());
    graph.insert(Entity::new("BP_10001", "Supplier").with_property("status", "Active"));
    graph.insert(Entity::new("PO_001", "PurchaseOrder").with_property("status", "Open"));
    graph.relate("PO_001", "orderedFrom", "BP_10001").unwrap();

    let engine = engine(
        graph.clone(),
        r#"
        RULE R1 {
            ON UPDATE(Supplier.status)
            FOR (s:Supplier WHERE s.status IN ["Expired"]) {
                FOR (po:PurchaseOrder WHERE po -[orderedFrom]-> s) {
                    SET po.status = "RiskLocked";
                }
            }
        }
        "#,
        "",
    );

    // Status moved to a value outside the guard list; nothing matches
    graph.insert(Entity::new("BP_10001", "Supplier").with_property("status", "Suspended"));
    let event = ChangeEvent::update(
        "Supplier",
        "BP_10001",
        "status",
        Value::String("Active".into()),
        Value::String("Suspended".into()),
    );
    engine.on_event(event.clone()).await;
    assert_eq!(graph.property("PO_001", "status"), Value::String("Open".into()));

    // Re-emitting the same event is idempotent for a false guard
    engine.on_event(event).await;
    assert_eq!(graph.property("PO_001", "status"), Value::String("Open".into()));
}

#[tokio::test]
async fn true_guard_applies_again_on_reemit() {
    let graph = Arc::new(MemoryGraph::new());
    graph.insert(Entity::new("BP_1", "Supplier").with_property("status", "Suspended"));

    let engine = engine(
        graph.clone(),
        r#"
        RULE Stamp {
            ON UPDATE(Supplier.status)
            FOR (s:Supplier WHERE s.status == "Suspended") {
                SET s.flagged = TRUE;
            }
        }
        "#,
        "",
    );
    let events = collect_events(&engine);

    let event = ChangeEvent::update(
        "Supplier",
        "BP_1",
        "status",
        Value::String("Active".into()),
        Value::String("Suspended".into()),
    );
    engine.on_event(event.clone()).await;
    engine.on_event(event).await;

    // The engine does not dedupe semantically: both deliveries write
    assert_eq!(events.lock().len(), 2);
    assert_eq!(graph.property("BP_1", "flagged"), Value::Boolean(true));
}

// --------------------------------------------------------------------------
// Action surface
// --------------------------------------------------------------------------

#[tokio::test]
async fn precondition_short_circuit() {
    let graph = Arc::new(MemoryGraph::new());
    graph.insert(
        Entity::new("PO_9", "PurchaseOrder")
            .with_property("status", "Open")
            .with_property("amount", 100i64),
    );
    let engine = engine(
        graph.clone(),
        "",
        r#"
        ACTION PurchaseOrder.submit {
            PRECONDITION P1: this.status == "Draft" ON_FAILURE: "Must be draft"
            PRECONDITION P2: this.amount > 0 ON_FAILURE: "Amount must be positive"
        }
        "#,
    );

    let entity = graph.entity("PO_9").unwrap();
    let executor = graph_reactor::ActionExecutor::new(engine.actions(), graph.clone());
    let result = executor
        .execute("PurchaseOrder", "submit", "PO_9", &entity, HashMap::new())
        .await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Must be draft"));
}

#[tokio::test]
async fn effect_write_records_changes() {
    let graph = Arc::new(MemoryGraph::new());
    graph.insert(Entity::new("PO_5", "PurchaseOrder").with_property("status", "Open"));
    let engine = engine(
        graph.clone(),
        "",
        r#"
        ACTION PurchaseOrder.cancel {
            PRECONDITION: this.status == "Open" ON_FAILURE: "Not open"
            EFFECT {
                SET this.status = "Cancelled";
                SET this.cancelledAt = NOW();
            }
        }
        "#,
    );

    let entity = graph.entity("PO_5").unwrap();
    let executor = graph_reactor::ActionExecutor::new(engine.actions(), graph.clone());
    let result = executor
        .execute("PurchaseOrder", "cancel", "PO_5", &entity, HashMap::new())
        .await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.changes["status"], Value::String("Cancelled".into()));
    assert!(matches!(result.changes["cancelledAt"], Value::Timestamp(_)));
    assert_eq!(result.changes.len(), 2);
    assert_eq!(
        graph.property("PO_5", "status"),
        Value::String("Cancelled".into())
    );
}

#[tokio::test]
async fn rule_triggers_action() {
    let graph = Arc::new(MemoryGraph::new());
    graph.insert(Entity::new("BP_1", "Supplier").with_property("status", "Suspended"));
    graph.insert(Entity::new("PO_1", "PurchaseOrder").with_property("status", "Open"));
    graph.relate("PO_1", "orderedFrom", "BP_1").unwrap();

    let engine = engine(
        graph.clone(),
        r#"
        RULE LockOrders {
            ON UPDATE(Supplier.status)
            FOR (s:Supplier WHERE s.status == "Suspended") {
                FOR (po:PurchaseOrder WHERE po -[orderedFrom]-> s) {
                    TRIGGER PurchaseOrder.lock ON po WITH { reason: s.status };
                }
            }
        }
        "#,
        r#"
        ACTION PurchaseOrder.lock(reason: String) {
            PRECONDITION: this.status == "Open" ON_FAILURE: "Not open"
            EFFECT {
                SET this.status = "Locked";
                SET this.lockReason = reason;
            }
        }
        "#,
    );

    engine
        .on_event(ChangeEvent::update(
            "Supplier",
            "BP_1",
            "status",
            Value::String("Active".into()),
            Value::String("Suspended".into()),
        ))
        .await;

    assert_eq!(graph.property("PO_1", "status"), Value::String("Locked".into()));
    assert_eq!(
        graph.property("PO_1", "lockReason"),
        Value::String("Suspended".into())
    );
}

// --------------------------------------------------------------------------
// Ordering and cascade bounds
// --------------------------------------------------------------------------

#[tokio::test]
async fn priority_ordering_completes_high_before_low() {
    let graph = Arc::new(MemoryGraph::new());
    graph.insert(Entity::new("BP_1", "Supplier").with_property("status", "Suspended"));
    graph.insert(Entity::new("PO_A", "PurchaseOrder").with_property("status", "Open"));
    graph.insert(Entity::new("PO_B", "PurchaseOrder").with_property("status", "Open"));
    graph.relate("PO_A", "orderedFrom", "BP_1").unwrap();
    graph.relate("PO_B", "orderedFrom", "BP_1").unwrap();

    let engine = engine(
        graph.clone(),
        r#"
        RULE R_lo PRIORITY 10 {
            ON UPDATE(Supplier.status)
            FOR (s:Supplier) {
                FOR (po:PurchaseOrder WHERE po -[orderedFrom]-> s) {
                    SET po.loMark = "lo";
                }
            }
        }
        RULE R_hi PRIORITY 50 {
            ON UPDATE(Supplier.status)
            FOR (s:Supplier) {
                FOR (po:PurchaseOrder WHERE po -[orderedFrom]-> s) {
                    SET po.hiMark = "hi";
                }
            }
        }
        "#,
        "",
    );
    let events = collect_events(&engine);

    engine
        .on_event(ChangeEvent::update(
            "Supplier",
            "BP_1",
            "status",
            Value::String("Active".into()),
            Value::String("Suspended".into()),
        ))
        .await;

    // Every row of the high-priority rule lands before any low-priority row
    let properties: Vec<String> = events
        .lock()
        .iter()
        .map(|e| e.property.clone().unwrap())
        .collect();
    assert_eq!(properties, vec!["hiMark", "hiMark", "loMark", "loMark"]);
}

#[tokio::test]
async fn cascade_depth_is_bounded() {
    let graph = Arc::new(MemoryGraph::new());
    graph.insert(Entity::new("C_1", "Counter").with_property("value", "x"));

    // Every firing rewrites the property it listens on
    let engine = engine(
        graph.clone(),
        r#"
        RULE Grow {
            ON UPDATE(Counter.value)
            FOR (c:Counter) {
                SET c.value = CONCAT(c.value, "!");
            }
        }
        "#,
        "",
    );
    let events = collect_events(&engine);

    engine
        .on_event(ChangeEvent::update(
            "Counter",
            "C_1",
            "value",
            Value::String("x".into()),
            Value::String("x".into()),
        ))
        .await;

    // Exactly ten writes; the branch beyond the depth bound is dropped
    assert_eq!(events.lock().len(), 10);
    assert_eq!(
        graph.property("C_1", "value"),
        Value::String("x!!!!!!!!!!".into())
    );
}

#[tokio::test]
async fn same_value_write_still_emits_event() {
    let graph = Arc::new(MemoryGraph::new());
    graph.insert(Entity::new("PO_1", "PurchaseOrder").with_property("status", "Open"));

    let engine = engine(
        graph.clone(),
        r#"
        RULE Rewrite {
            ON CREATE(PurchaseOrder)
            FOR (po:PurchaseOrder) {
                SET po.status = "Open";
            }
        }
        "#,
        "",
    );
    let events = collect_events(&engine);

    engine.on_event(ChangeEvent::create("PurchaseOrder", "PO_1")).await;

    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].old_value, events[0].new_value);
}

// --------------------------------------------------------------------------
// Emitter wiring and file loading
// --------------------------------------------------------------------------

#[tokio::test]
async fn engine_subscribes_to_change_producer() {
    let graph = Arc::new(MemoryGraph::new());
    graph.insert(Entity::new("PO_1", "PurchaseOrder").with_property("status", "New"));
    let engine = Arc::new(engine(
        graph.clone(),
        r#"
        RULE Tag {
            ON CREATE(PurchaseOrder)
            FOR (po:PurchaseOrder) {
                SET po.reviewed = FALSE;
            }
        }
        "#,
        "",
    ));

    let emitter = EventEmitter::new();
    emitter.subscribe(engine.clone());
    emitter.emit(&ChangeEvent::create("PurchaseOrder", "PO_1")).await;

    assert_eq!(graph.property("PO_1", "reviewed"), Value::Boolean(false));
}

#[tokio::test]
async fn load_rules_from_file() {
    let graph = Arc::new(MemoryGraph::new());
    graph.insert(Entity::new("PO_1", "PurchaseOrder").with_property("status", "New"));
    let engine = engine(graph.clone(), "", "");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        RULE Tag {{
            ON CREATE(PurchaseOrder)
            FOR (po:PurchaseOrder) {{
                SET po.reviewed = TRUE;
            }}
        }}
        "#
    )
    .unwrap();

    let loaded = engine.load_rules_from_file(file.path()).unwrap();
    assert_eq!(loaded, 1);

    engine.on_event(ChangeEvent::create("PurchaseOrder", "PO_1")).await;
    assert_eq!(graph.property("PO_1", "reviewed"), Value::Boolean(true));
}

// --------------------------------------------------------------------------
// Translator safety through the public surface
// --------------------------------------------------------------------------

#[tokio::test]
async fn hostile_literal_never_reaches_query_text() {
    let hostile = "o'; DROP TABLE --";
    let source = format!(
        r#"
        RULE Probe {{
            ON CREATE(T)
            FOR (n:T WHERE n.name == "{}") {{
                SET n.hit = TRUE;
            }}
        }}
        "#,
        hostile
    );
    let declarations = graph_reactor::parse(&source).unwrap();
    let graph_reactor::ast::Declaration::Rule(rule) = &declarations[0] else {
        panic!("expected rule");
    };
    let translated = graph_reactor::query::translate_for(&rule.body, &[]).unwrap();
    assert!(!translated.text.contains(hostile));
    assert!(translated.text.contains("n.name = $param_0"));
    assert_eq!(
        translated.params["param_0"],
        Value::String(hostile.to_string())
    );
}
