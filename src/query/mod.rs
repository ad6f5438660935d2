// # Query Translator
//
// Compiles FOR clauses and guard expressions into parameterized graph
// queries. Nothing user-supplied is ever concatenated into the query text:
// every literal travels through the parameter mapping, and type and
// relationship labels are validated before they reach the string.
//
// Each translation starts a fresh parameter counter (`param_0`, `param_1`,
// ...), so consecutive translations produce independent parameter sets.
// Bound outer variables contribute identity constraints under `id_<name>`.

use crate::ast::{ComparisonOp, Expression, ForClause, LogicalOp, PathHead};
use crate::common::Value;
use crate::error::{EngineError, Result};
use std::collections::{HashMap, HashSet};

/// Per-translation parameter allocator.
#[derive(Debug, Default)]
pub struct ParamSet {
    counter: usize,
    values: HashMap<String, Value>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a literal under the next `param_N` name.
    pub fn fresh(&mut self, value: Value) -> String {
        let name = format!("param_{}", self.counter);
        self.counter += 1;
        self.values.insert(name.clone(), value);
        name
    }

    /// Bind a value under an explicit name (identity constraints).
    pub fn named(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn into_values(self) -> HashMap<String, Value> {
        self.values
    }
}

/// A variable already bound by an enclosing scope, pinned by identity in
/// the translated query.
#[derive(Debug, Clone)]
pub struct BoundVariable {
    pub name: String,
    pub id: String,
    pub label: String,
}

impl BoundVariable {
    pub fn new(name: impl Into<String>, id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Query text plus its parameter bindings.
#[derive(Debug, Clone)]
pub struct TranslatedQuery {
    pub text: String,
    pub params: HashMap<String, Value>,
}

/// Reject labels that could smuggle syntax into the query text. Only
/// alphanumerics and underscores survive, and the first character must not
/// be a digit.
pub fn validate_label(label: &str) -> Result<()> {
    let mut chars = label.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(EngineError::Translation(format!(
            "unsafe label '{}'",
            label
        )))
    }
}

/// Translate a FOR clause (loop variable, entity type, optional guard) plus
/// already-bound outer variables into a read query.
pub fn translate_for(clause: &ForClause, bound: &[BoundVariable]) -> Result<TranslatedQuery> {
    validate_label(&clause.entity_type)?;
    for var in bound {
        validate_label(&var.label)?;
        validate_label(&var.name)?;
    }

    let mut params = ParamSet::new();
    let mut aliases: HashSet<String> = HashSet::new();
    aliases.insert(clause.variable.clone());

    let mut patterns = vec![format!("({}:{})", clause.variable, clause.entity_type)];
    let mut conditions = Vec::new();

    for var in bound {
        // The loop variable itself may be pre-bound (the triggering entity)
        if var.name != clause.variable {
            patterns.push(format!("({}:{})", var.name, var.label));
        }
        aliases.insert(var.name.clone());
        let param = format!("id_{}", var.name);
        conditions.push(format!("{}.id = ${}", var.name, param));
        params.named(param, Value::String(var.id.clone()));
    }

    if let Some(guard) = &clause.guard {
        conditions.push(render_expression(guard, &aliases, &mut params)?);
    }

    let mut text = format!("MATCH {}", patterns.join(", "));
    if !conditions.is_empty() {
        text.push_str(" WHERE ");
        text.push_str(&conditions.join(" AND "));
    }
    text.push_str(&format!(" RETURN {}", clause.variable));

    Ok(TranslatedQuery {
        text,
        params: params.into_values(),
    })
}

/// Build the parameterized write query for one property update.
pub fn translate_set(
    entity_type: &str,
    property: &str,
    id: &str,
    value: Value,
) -> Result<TranslatedQuery> {
    validate_label(entity_type)?;
    validate_label(property)?;
    let mut params = ParamSet::new();
    params.named("id", Value::String(id.to_string()));
    params.named("value", value);
    Ok(TranslatedQuery {
        text: format!(
            "MATCH (n:{}) WHERE n.id = $id SET n.{} = $value RETURN n",
            entity_type, property
        ),
        params: params.into_values(),
    })
}

/// Build the containment query behind an EXISTS evaluated outside a guard:
/// both endpoints are known entities, pinned by identity.
pub fn translate_containment(
    from_alias: &str,
    from_label: &str,
    from_id: &str,
    relationship: &str,
    to_alias: &str,
    to_label: &str,
    to_id: &str,
    filter: Option<&Expression>,
) -> Result<TranslatedQuery> {
    for label in [from_label, to_label, relationship, from_alias, to_alias] {
        validate_label(label)?;
    }
    let mut params = ParamSet::new();
    let from_param = format!("id_{}", from_alias);
    let to_param = format!("id_{}", to_alias);
    params.named(&from_param, Value::String(from_id.to_string()));
    params.named(&to_param, Value::String(to_id.to_string()));

    let mut conditions = vec![
        format!("{}.id = ${}", from_alias, from_param),
        format!("{}.id = ${}", to_alias, to_param),
    ];
    if let Some(filter) = filter {
        let aliases: HashSet<String> =
            [from_alias.to_string(), to_alias.to_string()].into_iter().collect();
        conditions.push(render_expression(filter, &aliases, &mut params)?);
    }

    Ok(TranslatedQuery {
        text: format!(
            "MATCH ({}:{})-[:{}]->({}:{}) WHERE {} RETURN {}",
            from_alias,
            from_label,
            relationship,
            to_alias,
            to_label,
            conditions.join(" AND "),
            from_alias
        ),
        params: params.into_values(),
    })
}

/// Render a guard expression into query text, binding every literal through
/// `params`. `aliases` are the node variables visible to the guard.
pub fn render_expression(
    expr: &Expression,
    aliases: &HashSet<String>,
    params: &mut ParamSet,
) -> Result<String> {
    match expr {
        Expression::Literal(value) => {
            let name = params.fresh(value.clone());
            Ok(format!("${}", name))
        }
        Expression::Path(path) => {
            let head = path.head_name();
            let known = match &path.head {
                PathHead::This => aliases.contains("this"),
                PathHead::Variable(name) => aliases.contains(name),
            };
            if !known {
                return Err(EngineError::Translation(format!(
                    "variable '{}' is not bound in this query",
                    head
                )));
            }
            match path.segments.as_slice() {
                [] => Ok(format!("{}.id", head)),
                [property] => {
                    validate_label(property)?;
                    Ok(format!("{}.{}", head, property))
                }
                _ => Err(EngineError::Translation(format!(
                    "nested path '{}' cannot be translated",
                    path
                ))),
            }
        }
        Expression::Comparison { op, left, right } => {
            let left = render_expression(left, aliases, params)?;
            let right = render_expression(right, aliases, params)?;
            let op = match op {
                ComparisonOp::Eq => "=",
                ComparisonOp::Ne => "<>",
                ComparisonOp::Lt => "<",
                ComparisonOp::Gt => ">",
                ComparisonOp::Le => "<=",
                ComparisonOp::Ge => ">=",
            };
            Ok(format!("{} {} {}", left, op, right))
        }
        Expression::InList { value, items } => {
            let value = render_expression(value, aliases, params)?;
            let name = params.fresh(Value::Array(items.clone()));
            Ok(format!("{} IN ${}", value, name))
        }
        Expression::NullCheck { value, negated } => {
            let value = render_expression(value, aliases, params)?;
            Ok(format!(
                "{} IS {}NULL",
                value,
                if *negated { "NOT " } else { "" }
            ))
        }
        Expression::Logical { op, operands } => match op {
            LogicalOp::Not => {
                let inner = render_expression(&operands[0], aliases, params)?;
                Ok(format!("NOT ({})", inner))
            }
            LogicalOp::And | LogicalOp::Or => {
                let sep = if *op == LogicalOp::And { " AND " } else { " OR " };
                let parts = operands
                    .iter()
                    .map(|operand| render_expression(operand, aliases, params))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", parts.join(sep)))
            }
        },
        Expression::Exists {
            from_var,
            relationship,
            to_var,
            filter,
        } => {
            validate_label(relationship)?;
            for var in [from_var, to_var] {
                if !aliases.contains(var) {
                    return Err(EngineError::Translation(format!(
                        "pattern variable '{}' is not bound in this query",
                        var
                    )));
                }
            }
            let mut text = format!("EXISTS(({})-[:{}]->({})", from_var, relationship, to_var);
            if let Some(filter) = filter {
                let inner = render_expression(filter, aliases, params)?;
                text.push_str(&format!(" WHERE {}", inner));
            }
            text.push(')');
            Ok(text)
        }
        Expression::Matches { value, pattern } => {
            let value = render_expression(value, aliases, params)?;
            let name = params.fresh(Value::String(pattern.clone()));
            Ok(format!("{} =~ ${}", value, name))
        }
        Expression::FunctionCall { name, .. } => Err(EngineError::Translation(format!(
            "function call '{}' cannot appear in a WHERE guard",
            name
        ))),
        Expression::Changed { .. } => Err(EngineError::Translation(
            "CHANGED cannot appear in a WHERE guard".to_string(),
        )),
    }
}
