// # Embedded Graph Store
//
// Reference `GraphDriver` over an in-memory property graph: entities keyed
// by id plus typed directed relationships. It interprets the exact query
// dialect the translator emits (node patterns, parameterized comparisons,
// IN, null predicates, regex match, relationship containment, and the
// single-property SET form) and rejects anything else instead of guessing.
//
// Entities iterate in id order, so result rows are stable within a run.

use super::{Entity, GraphDriver, ResultRow};
use crate::common::Value;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq)]
struct Relationship {
    from: String,
    rel: String,
    to: String,
}

/// In-memory property graph with a query-interpreting driver facade.
pub struct MemoryGraph {
    entities: RwLock<BTreeMap<String, Entity>>,
    relationships: RwLock<Vec<Relationship>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(BTreeMap::new()),
            relationships: RwLock::new(Vec::new()),
        }
    }

    /// Insert or replace an entity.
    pub fn insert(&self, entity: Entity) {
        self.entities.write().insert(entity.id.clone(), entity);
    }

    /// Add a typed directed relationship between two existing entities.
    pub fn relate(&self, from: &str, rel: &str, to: &str) -> Result<()> {
        let entities = self.entities.read();
        for id in [from, to] {
            if !entities.contains_key(id) {
                return Err(EngineError::InvalidInput(format!(
                    "unknown entity '{}'",
                    id
                )));
            }
        }
        drop(entities);
        self.relationships.write().push(Relationship {
            from: from.to_string(),
            rel: rel.to_string(),
            to: to.to_string(),
        });
        Ok(())
    }

    /// Snapshot of one entity.
    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.entities.read().get(id).cloned()
    }

    /// Convenience property read used throughout the tests.
    pub fn property(&self, id: &str, name: &str) -> Value {
        self.entities
            .read()
            .get(id)
            .map(|e| e.property_or_null(name))
            .unwrap_or(Value::Null)
    }

    fn has_relationship(&self, from: &str, rel: &str, to: &str) -> bool {
        self.relationships
            .read()
            .iter()
            .any(|r| r.from == from && r.rel == rel && r.to == to)
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphDriver for MemoryGraph {
    async fn run(&self, query: &str, params: &HashMap<String, Value>) -> Result<Vec<ResultRow>> {
        let parsed = QueryText::parse(query)?;
        match &parsed.set {
            Some(set) => self.run_write(&parsed, set, params),
            None => self.run_read(&parsed, params),
        }
    }
}

impl MemoryGraph {
    fn run_read(&self, parsed: &QueryText, params: &HashMap<String, Value>) -> Result<Vec<ResultRow>> {
        let return_alias = parsed
            .return_alias
            .as_deref()
            .ok_or_else(|| EngineError::GraphIo("read query missing RETURN".to_string()))?;
        if !parsed.patterns.iter().any(|p| p.has_alias(return_alias)) {
            return Err(EngineError::GraphIo(format!(
                "RETURN alias '{}' is not bound by MATCH",
                return_alias
            )));
        }

        let mut rows = vec![ResultRow::new()];
        let entities = self.entities.read();
        for pattern in &parsed.patterns {
            rows = self.expand_pattern(pattern, rows, &entities)?;
        }
        drop(entities);

        let mut result = Vec::new();
        for row in rows {
            let keep = match &parsed.condition {
                Some(condition) => self.eval_condition(condition, &row, params)?,
                None => true,
            };
            if keep {
                result.push(row);
            }
        }
        Ok(result)
    }

    fn expand_pattern(
        &self,
        pattern: &Pattern,
        rows: Vec<ResultRow>,
        entities: &BTreeMap<String, Entity>,
    ) -> Result<Vec<ResultRow>> {
        let mut expanded = Vec::new();
        for row in rows {
            let from_candidates = candidates(&row, &pattern.alias, &pattern.label, entities);
            for from in from_candidates {
                let mut bound = row.clone();
                bound.insert(pattern.alias.clone(), from.clone());
                match &pattern.edge {
                    None => expanded.push(bound),
                    Some(edge) => {
                        let to_candidates =
                            candidates(&bound, &edge.to_alias, &edge.to_label, entities);
                        for to in to_candidates {
                            if self.has_relationship(&from.id, &edge.rel, &to.id) {
                                let mut chained = bound.clone();
                                chained.insert(edge.to_alias.clone(), to.clone());
                                expanded.push(chained);
                            }
                        }
                    }
                }
            }
        }
        Ok(expanded)
    }

    fn run_write(
        &self,
        parsed: &QueryText,
        set: &SetClause,
        params: &HashMap<String, Value>,
    ) -> Result<Vec<ResultRow>> {
        // The write form pins one node by id and assigns one property
        let id = match params.get("id") {
            Some(Value::String(id)) => id.clone(),
            _ => return Err(EngineError::GraphIo("write query missing $id".to_string())),
        };
        let value = params
            .get("value")
            .cloned()
            .ok_or_else(|| EngineError::GraphIo("write query missing $value".to_string()))?;

        let pattern = parsed
            .patterns
            .first()
            .ok_or_else(|| EngineError::GraphIo("write query missing MATCH".to_string()))?;

        let mut entities = self.entities.write();
        let Some(entity) = entities.get_mut(&id) else {
            return Ok(Vec::new());
        };
        if entity.label != pattern.label {
            return Ok(Vec::new());
        }
        entity.set_property(&set.property, value);
        let snapshot = entity.clone();
        drop(entities);

        let mut row = ResultRow::new();
        row.insert(pattern.alias.clone(), snapshot);
        Ok(vec![row])
    }

    fn eval_condition(
        &self,
        condition: &Cond,
        row: &ResultRow,
        params: &HashMap<String, Value>,
    ) -> Result<bool> {
        match condition {
            Cond::And(parts) => {
                for part in parts {
                    if !self.eval_condition(part, row, params)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Cond::Or(parts) => {
                for part in parts {
                    if self.eval_condition(part, row, params)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Cond::Not(inner) => Ok(!self.eval_condition(inner, row, params)?),
            Cond::IsNull { operand, negated } => {
                let value = operand_value(operand, row, params)?;
                Ok(value.is_null() != *negated)
            }
            Cond::In { operand, param } => {
                let value = operand_value(operand, row, params)?;
                let list = params
                    .get(param)
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| {
                        EngineError::GraphIo(format!("parameter '{}' is not a list", param))
                    })?;
                Ok(list.iter().any(|item| value.loose_eq(item)))
            }
            Cond::Regex { operand, param } => {
                let value = operand_value(operand, row, params)?;
                let Some(text) = value.as_str() else {
                    return Ok(false);
                };
                let pattern = params
                    .get(param)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        EngineError::GraphIo(format!("parameter '{}' is not a string", param))
                    })?;
                let regex = Regex::new(&format!("^(?:{})$", pattern))
                    .map_err(|e| EngineError::GraphIo(format!("invalid pattern: {}", e)))?;
                Ok(regex.is_match(text))
            }
            Cond::Cmp { left, op, right } => {
                let left = operand_value(left, row, params)?;
                let right = operand_value(right, row, params)?;
                Ok(match op.as_str() {
                    "=" => left.loose_eq(&right),
                    "<>" => !left.is_null() && !right.is_null() && !left.loose_eq(&right),
                    other => match left.loose_cmp(&right) {
                        Some(ordering) => match other {
                            "<" => ordering.is_lt(),
                            "<=" => ordering.is_le(),
                            ">" => ordering.is_gt(),
                            ">=" => ordering.is_ge(),
                            _ => {
                                return Err(EngineError::GraphIo(format!(
                                    "unsupported operator '{}'",
                                    other
                                )))
                            }
                        },
                        None => false,
                    },
                })
            }
            Cond::Exists {
                from,
                rel,
                to,
                filter,
            } => {
                let from_entity = row.get(from).ok_or_else(|| {
                    EngineError::GraphIo(format!("alias '{}' is not bound", from))
                })?;
                let to_entity = row
                    .get(to)
                    .ok_or_else(|| EngineError::GraphIo(format!("alias '{}' is not bound", to)))?;
                if !self.has_relationship(&from_entity.id, rel, &to_entity.id) {
                    return Ok(false);
                }
                match filter {
                    Some(filter) => self.eval_condition(filter, row, params),
                    None => Ok(true),
                }
            }
        }
    }
}

fn candidates(
    row: &ResultRow,
    alias: &str,
    label: &str,
    entities: &BTreeMap<String, Entity>,
) -> Vec<Entity> {
    if let Some(existing) = row.get(alias) {
        // Alias already bound by an earlier pattern; labels must agree
        if existing.label == label {
            return vec![existing.clone()];
        }
        return Vec::new();
    }
    entities
        .values()
        .filter(|e| e.label == label)
        .cloned()
        .collect()
}

fn operand_value(
    operand: &Operand,
    row: &ResultRow,
    params: &HashMap<String, Value>,
) -> Result<Value> {
    match operand {
        Operand::Param(name) => params
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::GraphIo(format!("missing parameter '{}'", name))),
        Operand::Prop { alias, property } => {
            let entity = row
                .get(alias)
                .ok_or_else(|| EngineError::GraphIo(format!("alias '{}' is not bound", alias)))?;
            if property == "id" {
                Ok(Value::String(entity.id.clone()))
            } else {
                Ok(entity.property_or_null(property))
            }
        }
    }
}

// ============================================================================
// Query text parsing (the translator's dialect only)
// ============================================================================

#[derive(Debug)]
struct Edge {
    rel: String,
    to_alias: String,
    to_label: String,
}

#[derive(Debug)]
struct Pattern {
    alias: String,
    label: String,
    edge: Option<Edge>,
}

impl Pattern {
    fn has_alias(&self, alias: &str) -> bool {
        self.alias == alias
            || self
                .edge
                .as_ref()
                .is_some_and(|edge| edge.to_alias == alias)
    }
}

#[derive(Debug)]
struct SetClause {
    property: String,
}

#[derive(Debug)]
enum Operand {
    Prop { alias: String, property: String },
    Param(String),
}

#[derive(Debug)]
enum Cond {
    Cmp {
        left: Operand,
        op: String,
        right: Operand,
    },
    In {
        operand: Operand,
        param: String,
    },
    IsNull {
        operand: Operand,
        negated: bool,
    },
    Regex {
        operand: Operand,
        param: String,
    },
    And(Vec<Cond>),
    Or(Vec<Cond>),
    Not(Box<Cond>),
    Exists {
        from: String,
        rel: String,
        to: String,
        filter: Option<Box<Cond>>,
    },
}

#[derive(Debug)]
struct QueryText {
    patterns: Vec<Pattern>,
    condition: Option<Cond>,
    set: Option<SetClause>,
    return_alias: Option<String>,
}

impl QueryText {
    fn parse(text: &str) -> Result<QueryText> {
        let mut scanner = Scanner::new(text);
        scanner.expect_keyword("MATCH")?;

        let mut patterns = vec![scanner.parse_pattern()?];
        while scanner.eat_symbol(',') {
            patterns.push(scanner.parse_pattern()?);
        }

        let condition = if scanner.eat_keyword("WHERE") {
            Some(scanner.parse_or()?)
        } else {
            None
        };

        let set = if scanner.eat_keyword("SET") {
            // n.prop = $value
            let _alias = scanner.expect_ident()?;
            scanner.expect_symbol('.')?;
            let property = scanner.expect_ident()?;
            scanner.expect_symbol('=')?;
            let _param = scanner.expect_param()?;
            Some(SetClause { property })
        } else {
            None
        };

        let return_alias = if scanner.eat_keyword("RETURN") {
            Some(scanner.expect_ident()?)
        } else {
            None
        };

        scanner.expect_end()?;
        Ok(QueryText {
            patterns,
            condition,
            set,
            return_alias,
        })
    }
}

/// Character scanner over query text. The text never contains user
/// literals, so structure is fully trustworthy.
struct Scanner {
    chars: Vec<char>,
    pos: usize,
}

impl Scanner {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn starts_with(&mut self, text: &str) -> bool {
        self.skip_ws();
        self.chars[self.pos.min(self.chars.len())..]
            .iter()
            .take(text.chars().count())
            .collect::<String>()
            == text
    }

    fn read_ident(&mut self) -> Option<String> {
        self.skip_ws();
        let start = self.pos;
        while self
            .chars
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_')
        {
            self.pos += 1;
        }
        if self.pos > start {
            Some(self.chars[start..self.pos].iter().collect())
        } else {
            None
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        self.read_ident()
            .ok_or_else(|| self.fail("expected identifier"))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        self.skip_ws();
        let save = self.pos;
        match self.read_ident() {
            Some(ident) if ident == keyword => true,
            _ => {
                self.pos = save;
                false
            }
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.fail(&format!("expected {}", keyword)))
        }
    }

    fn eat_symbol(&mut self, symbol: char) -> bool {
        if self.peek() == Some(symbol) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<()> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(self.fail(&format!("expected '{}'", symbol)))
        }
    }

    fn eat_text(&mut self, text: &str) -> bool {
        if self.starts_with(text) {
            self.pos += text.chars().count();
            true
        } else {
            false
        }
    }

    fn expect_param(&mut self) -> Result<String> {
        if !self.eat_symbol('$') {
            return Err(self.fail("expected parameter"));
        }
        self.expect_ident()
    }

    fn expect_end(&mut self) -> Result<()> {
        self.skip_ws();
        if self.pos >= self.chars.len() {
            Ok(())
        } else {
            Err(self.fail("trailing query text"))
        }
    }

    fn fail(&self, message: &str) -> EngineError {
        EngineError::GraphIo(format!(
            "unsupported query shape at offset {}: {}",
            self.pos, message
        ))
    }

    /// `(a:L)` optionally followed by `-[:R]->(b:L2)`
    fn parse_pattern(&mut self) -> Result<Pattern> {
        self.expect_symbol('(')?;
        let alias = self.expect_ident()?;
        self.expect_symbol(':')?;
        let label = self.expect_ident()?;
        self.expect_symbol(')')?;
        let edge = if self.eat_text("-[:") {
            let rel = self.expect_ident()?;
            if !self.eat_text("]->") {
                return Err(self.fail("expected ]->"));
            }
            self.expect_symbol('(')?;
            let to_alias = self.expect_ident()?;
            self.expect_symbol(':')?;
            let to_label = self.expect_ident()?;
            self.expect_symbol(')')?;
            Some(Edge {
                rel,
                to_alias,
                to_label,
            })
        } else {
            None
        };
        Ok(Pattern {
            alias,
            label,
            edge,
        })
    }

    fn parse_or(&mut self) -> Result<Cond> {
        let mut parts = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            parts.push(self.parse_and()?);
        }
        if parts.len() == 1 {
            Ok(parts.pop().expect("non-empty"))
        } else {
            Ok(Cond::Or(parts))
        }
    }

    fn parse_and(&mut self) -> Result<Cond> {
        let mut parts = vec![self.parse_primary()?];
        while self.eat_keyword("AND") {
            parts.push(self.parse_primary()?);
        }
        if parts.len() == 1 {
            Ok(parts.pop().expect("non-empty"))
        } else {
            Ok(Cond::And(parts))
        }
    }

    fn parse_primary(&mut self) -> Result<Cond> {
        if self.eat_keyword("NOT") {
            self.expect_symbol('(')?;
            let inner = self.parse_or()?;
            self.expect_symbol(')')?;
            return Ok(Cond::Not(Box::new(inner)));
        }
        if self.eat_keyword("EXISTS") {
            return self.parse_exists();
        }
        if self.peek() == Some('(') {
            self.pos += 1;
            let inner = self.parse_or()?;
            self.expect_symbol(')')?;
            return Ok(inner);
        }

        let operand = self.parse_operand()?;
        self.skip_ws();

        if self.eat_keyword("IN") {
            let param = self.expect_param()?;
            return Ok(Cond::In { operand, param });
        }
        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Cond::IsNull { operand, negated });
        }
        if self.eat_text("=~") {
            let param = self.expect_param()?;
            return Ok(Cond::Regex { operand, param });
        }

        let op = if self.eat_text("<>") {
            "<>"
        } else if self.eat_text("<=") {
            "<="
        } else if self.eat_text(">=") {
            ">="
        } else if self.eat_text("<") {
            "<"
        } else if self.eat_text(">") {
            ">"
        } else if self.eat_text("=") {
            "="
        } else {
            return Err(self.fail("expected comparison operator"));
        };
        let right = self.parse_operand()?;
        Ok(Cond::Cmp {
            left: operand,
            op: op.to_string(),
            right,
        })
    }

    /// `EXISTS((a)-[:R]->(b) [WHERE cond])`
    fn parse_exists(&mut self) -> Result<Cond> {
        self.expect_symbol('(')?;
        self.expect_symbol('(')?;
        let from = self.expect_ident()?;
        self.expect_symbol(')')?;
        if !self.eat_text("-[:") {
            return Err(self.fail("expected -[:"));
        }
        let rel = self.expect_ident()?;
        if !self.eat_text("]->") {
            return Err(self.fail("expected ]->"));
        }
        self.expect_symbol('(')?;
        let to = self.expect_ident()?;
        self.expect_symbol(')')?;
        let filter = if self.eat_keyword("WHERE") {
            Some(Box::new(self.parse_or()?))
        } else {
            None
        };
        self.expect_symbol(')')?;
        Ok(Cond::Exists {
            from,
            rel,
            to,
            filter,
        })
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        if self.peek() == Some('$') {
            let name = self.expect_param()?;
            return Ok(Operand::Param(name));
        }
        let alias = self.expect_ident()?;
        self.expect_symbol('.')?;
        let property = self.expect_ident()?;
        Ok(Operand::Prop { alias, property })
    }
}
