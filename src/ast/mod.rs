// # Rule Language AST
//
// Closed tagged-variant trees for the rule DSL: expressions, statements,
// action and rule declarations. Every walker in the crate (evaluator, query
// translator, semantic pass, canonical printer) dispatches exhaustively over
// these enums.
//
// Each node renders its canonical textual form through `Display`; parsing
// that form reproduces a structurally equal tree.

use crate::common::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Paths
// ============================================================================

/// Head of a dotted property path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PathHead {
    /// The entity an action executes against
    This,

    /// A variable bound by an enclosing FOR clause (or an action parameter)
    Variable(String),
}

/// Dotted property access, e.g. `this.status` or `po.amount`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Path {
    pub head: PathHead,
    pub segments: Vec<String>,
}

impl Path {
    pub fn this(segments: Vec<String>) -> Self {
        Self {
            head: PathHead::This,
            segments,
        }
    }

    pub fn variable(name: impl Into<String>, segments: Vec<String>) -> Self {
        Self {
            head: PathHead::Variable(name.into()),
            segments,
        }
    }

    /// Name of the head variable, or "this".
    pub fn head_name(&self) -> &str {
        match &self.head {
            PathHead::This => "this",
            PathHead::Variable(name) => name,
        }
    }

    /// The property this path reads, when it is a single-segment access.
    pub fn property(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [one] => Some(one),
            _ => None,
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.head_name())?;
        for segment in &self.segments {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ComparisonOp::Eq => "==",
            ComparisonOp::Ne => "!=",
            ComparisonOp::Lt => "<",
            ComparisonOp::Gt => ">",
            ComparisonOp::Le => "<=",
            ComparisonOp::Ge => ">=",
        };
        write!(f, "{}", text)
    }
}

/// Logical connectives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

/// Expression tree evaluated against a single entity plus bound variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Expression {
    /// Literal value
    Literal(Value),

    /// Dotted property access
    Path(Path),

    /// Binary comparison
    Comparison {
        op: ComparisonOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },

    /// Membership in a literal list
    InList {
        value: Box<Expression>,
        items: Vec<Value>,
    },

    /// IS NULL / IS NOT NULL
    NullCheck {
        value: Box<Expression>,
        negated: bool,
    },

    /// AND / OR / NOT over operands
    Logical {
        op: LogicalOp,
        operands: Vec<Expression>,
    },

    /// Built-in function call
    FunctionCall { name: String, args: Vec<Expression> },

    /// Relationship containment: `a -[rel]-> b`, optionally filtered
    Exists {
        from_var: String,
        relationship: String,
        to_var: String,
        filter: Option<Box<Expression>>,
    },

    /// Regular-expression match against a literal pattern
    Matches {
        value: Box<Expression>,
        pattern: String,
    },

    /// Change predicate over the triggering property
    Changed {
        property: String,
        from: Option<Value>,
        to: Option<Value>,
    },
}

/// Render a literal in DSL source form (quoted strings, keyword casing).
fn fmt_literal(value: &Value, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value {
        Value::Null => write!(f, "NULL"),
        Value::Boolean(true) => write!(f, "TRUE"),
        Value::Boolean(false) => write!(f, "FALSE"),
        Value::Integer(i) => write!(f, "{}", i),
        Value::Float(v) => {
            if v.fract() == 0.0 && v.is_finite() {
                write!(f, "{:.1}", v)
            } else {
                write!(f, "{}", v)
            }
        }
        Value::String(s) => {
            write!(f, "\"")?;
            for ch in s.chars() {
                match ch {
                    '"' => write!(f, "\\\"")?,
                    '\\' => write!(f, "\\\\")?,
                    '\n' => write!(f, "\\n")?,
                    '\t' => write!(f, "\\t")?,
                    other => write!(f, "{}", other)?,
                }
            }
            write!(f, "\"")
        }
        Value::Timestamp(t) => write!(f, "\"{}\"", t.to_rfc3339()),
        Value::Array(items) => {
            write!(f, "[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                fmt_literal(item, f)?;
            }
            write!(f, "]")
        }
    }
}

struct LiteralText<'a>(&'a Value);

impl fmt::Display for LiteralText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_literal(self.0, f)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(value) => fmt_literal(value, f),
            Expression::Path(path) => write!(f, "{}", path),
            Expression::Comparison { op, left, right } => {
                write!(f, "{} {} {}", left, op, right)
            }
            Expression::InList { value, items } => {
                write!(f, "{} IN [", value)?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", LiteralText(item))?;
                }
                write!(f, "]")
            }
            Expression::NullCheck { value, negated } => {
                if *negated {
                    write!(f, "{} IS NOT NULL", value)
                } else {
                    write!(f, "{} IS NULL", value)
                }
            }
            Expression::Logical { op, operands } => match op {
                LogicalOp::Not => write!(f, "NOT {}", operands[0]),
                LogicalOp::And | LogicalOp::Or => {
                    let sep = if *op == LogicalOp::And { " AND " } else { " OR " };
                    write!(f, "(")?;
                    for (i, operand) in operands.iter().enumerate() {
                        if i > 0 {
                            write!(f, "{}", sep)?;
                        }
                        write!(f, "{}", operand)?;
                    }
                    write!(f, ")")
                }
            },
            Expression::FunctionCall { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expression::Exists {
                from_var,
                relationship,
                to_var,
                filter,
            } => {
                write!(f, "EXISTS ({} -[{}]-> {}", from_var, relationship, to_var)?;
                if let Some(filter) = filter {
                    write!(f, " WHERE {}", filter)?;
                }
                write!(f, ")")
            }
            Expression::Matches { value, pattern } => {
                write!(f, "{} MATCHES ", value)?;
                fmt_literal(&Value::String(pattern.clone()), f)
            }
            Expression::Changed { property, from, to } => {
                write!(f, "this.{} CHANGED", property)?;
                if let (Some(from), Some(to)) = (from, to) {
                    write!(f, " FROM {} TO {}", LiteralText(from), LiteralText(to))?;
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Statements
// ============================================================================

/// Iteration over entities of one type with an optional guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForClause {
    /// Loop variable bound to each matched entity
    pub variable: String,

    /// Entity type label to match
    pub entity_type: String,

    /// Optional WHERE guard, translated into the graph query
    pub guard: Option<Expression>,

    /// Statements executed per matched row
    pub body: Vec<Statement>,
}

/// Imperative statement inside a rule body or an action effect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Statement {
    /// Property write: `SET target = expr;`
    Set { target: Path, value: Expression },

    /// Action invocation: `TRIGGER Type.action ON var WITH { .. };`
    Trigger {
        entity_var: String,
        entity_type: String,
        action: String,
        args: Vec<(String, Expression)>,
    },

    /// Nested iteration
    For(ForClause),
}

fn write_indent(f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    for _ in 0..indent {
        write!(f, "    ")?;
    }
    Ok(())
}

impl Statement {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        match self {
            Statement::Set { target, value } => {
                write_indent(f, indent)?;
                writeln!(f, "SET {} = {};", target, value)
            }
            Statement::Trigger {
                entity_var,
                entity_type,
                action,
                args,
            } => {
                write_indent(f, indent)?;
                write!(f, "TRIGGER {}.{} ON {}", entity_type, action, entity_var)?;
                if !args.is_empty() {
                    write!(f, " WITH {{ ")?;
                    for (i, (name, expr)) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}: {}", name, expr)?;
                    }
                    write!(f, " }}")?;
                }
                writeln!(f, ";")
            }
            Statement::For(clause) => clause.fmt_indented(f, indent),
        }
    }
}

impl ForClause {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        write_indent(f, indent)?;
        write!(f, "FOR ({}:{}", self.variable, self.entity_type)?;
        if let Some(guard) = &self.guard {
            write!(f, " WHERE {}", guard)?;
        }
        writeln!(f, ") {{")?;
        for statement in &self.body {
            statement.fmt_indented(f, indent + 1)?;
        }
        write_indent(f, indent)?;
        writeln!(f, "}}")
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

impl fmt::Display for ForClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// Kind of graph mutation a rule reacts to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TriggerType {
    Update,
    Create,
    Delete,
    Link,
    Scan,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Update => "UPDATE",
            TriggerType::Create => "CREATE",
            TriggerType::Delete => "DELETE",
            TriggerType::Link => "LINK",
            TriggerType::Scan => "SCAN",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declared shape of the event a rule reacts to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub trigger_type: TriggerType,
    pub entity_type: String,

    /// Property name, present iff the trigger type is UPDATE
    pub property: Option<String>,
}

impl Trigger {
    /// Index key: `UPDATE|<type>|<property>` for updates,
    /// `<TYPE>|<type>` otherwise.
    pub fn key(&self) -> String {
        match (&self.trigger_type, &self.property) {
            (TriggerType::Update, Some(property)) => {
                format!("UPDATE|{}|{}", self.entity_type, property)
            }
            (trigger_type, _) => format!("{}|{}", trigger_type, self.entity_type),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ON {}({}", self.trigger_type, self.entity_type)?;
        if let Some(property) = &self.property {
            write!(f, ".{}", property)?;
        }
        write!(f, ")")
    }
}

// ============================================================================
// Declarations
// ============================================================================

/// Declared parameter type for action parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Timestamp,
    Any,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "String",
            ParamType::Number => "Number",
            ParamType::Boolean => "Boolean",
            ParamType::Timestamp => "Timestamp",
            ParamType::Any => "Any",
        }
    }

    /// Whether a runtime value satisfies this declared type. NULL satisfies
    /// only optional parameters, which the executor checks separately.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::Any => true,
            ParamType::String => matches!(value, Value::String(_)),
            ParamType::Number => matches!(value, Value::Integer(_) | Value::Float(_)),
            ParamType::Boolean => matches!(value, Value::Boolean(_)),
            ParamType::Timestamp => matches!(value, Value::Timestamp(_)),
        }
    }
}

/// One declared action parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub param_type: ParamType,
    pub optional: bool,
}

/// Named boolean guard on an action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Precondition {
    pub label: Option<String>,
    pub condition: Expression,
    pub on_failure: String,
}

/// Named imperative operation on one entity type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionDef {
    pub entity_type: String,
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub preconditions: Vec<Precondition>,
    pub effect: Vec<Statement>,
}

impl ActionDef {
    /// Registry key fragment, `<Type>.<name>`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.entity_type, self.name)
    }
}

impl fmt::Display for ActionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ACTION {}.{}", self.entity_type, self.name)?;
        if !self.parameters.is_empty() {
            write!(f, "(")?;
            for (i, parameter) in self.parameters.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", parameter.name, parameter.param_type.as_str())?;
                if parameter.optional {
                    write!(f, " OPTIONAL")?;
                }
            }
            write!(f, ")")?;
        }
        writeln!(f, " {{")?;
        for precondition in &self.preconditions {
            write_indent(f, 1)?;
            write!(f, "PRECONDITION")?;
            if let Some(label) = &precondition.label {
                write!(f, " {}", label)?;
            }
            write!(f, ": {} ON_FAILURE: ", precondition.condition)?;
            fmt_literal(&Value::String(precondition.on_failure.clone()), f)?;
            writeln!(f)?;
        }
        if !self.effect.is_empty() {
            write_indent(f, 1)?;
            writeln!(f, "EFFECT {{")?;
            for statement in &self.effect {
                statement.fmt_indented(f, 2)?;
            }
            write_indent(f, 1)?;
            writeln!(f, "}}")?;
        }
        writeln!(f, "}}")
    }
}

/// Event-triggered reactive computation over the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleDef {
    pub name: String,
    pub priority: i64,
    pub trigger: Trigger,
    pub body: ForClause,
}

impl fmt::Display for RuleDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RULE {}", self.name)?;
        if self.priority != 0 {
            write!(f, " PRIORITY {}", self.priority)?;
        }
        writeln!(f, " {{")?;
        write_indent(f, 1)?;
        writeln!(f, "{}", self.trigger)?;
        self.body.fmt_indented(f, 1)?;
        writeln!(f, "}}")
    }
}

/// Top-level declaration in a parse unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Declaration {
    Action(ActionDef),
    Rule(RuleDef),
}

impl Declaration {
    pub fn name(&self) -> String {
        match self {
            Declaration::Action(action) => action.qualified_name(),
            Declaration::Rule(rule) => rule.name.clone(),
        }
    }
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Declaration::Action(action) => write!(f, "{}", action),
            Declaration::Rule(rule) => write!(f, "{}", rule),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_keys() {
        let update = Trigger {
            trigger_type: TriggerType::Update,
            entity_type: "Supplier".into(),
            property: Some("status".into()),
        };
        assert_eq!(update.key(), "UPDATE|Supplier|status");

        let create = Trigger {
            trigger_type: TriggerType::Create,
            entity_type: "PurchaseOrder".into(),
            property: None,
        };
        assert_eq!(create.key(), "CREATE|PurchaseOrder");
    }

    #[test]
    fn test_path_display() {
        let path = Path::variable("po", vec!["status".into()]);
        assert_eq!(path.to_string(), "po.status");
        assert_eq!(Path::this(vec![]).to_string(), "this");
    }

    #[test]
    fn test_expression_display() {
        let expr = Expression::Comparison {
            op: ComparisonOp::Eq,
            left: Box::new(Expression::Path(Path::variable("po", vec!["status".into()]))),
            right: Box::new(Expression::Literal(Value::String("Open".into()))),
        };
        assert_eq!(expr.to_string(), "po.status == \"Open\"");
    }

    #[test]
    fn test_literal_float_keeps_decimal_point() {
        let expr = Expression::Literal(Value::Float(2.0));
        assert_eq!(expr.to_string(), "2.0");
    }

    #[test]
    fn test_param_type_accepts() {
        assert!(ParamType::Number.accepts(&Value::Integer(3)));
        assert!(ParamType::Number.accepts(&Value::Float(0.5)));
        assert!(!ParamType::Number.accepts(&Value::String("3".into())));
        assert!(ParamType::Any.accepts(&Value::Null));
    }
}
