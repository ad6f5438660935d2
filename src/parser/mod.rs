// # Rule DSL Parser
//
// Recursive-descent parser for the rule language: ACTION and RULE
// declarations, trigger clauses, FOR iteration, and the guard expression
// grammar. Produces the AST in `crate::ast`; never returns a partial tree.
//
// A semantic pass runs after parsing: duplicate declaration names, trigger
// shape, dangling variables, and unknown function names are rejected with
// `EngineError::Semantic`.

pub mod lexer;

use crate::ast::{
    ActionDef, ComparisonOp, Declaration, Expression, ForClause, LogicalOp, ParamType, Parameter,
    Path, PathHead, Precondition, RuleDef, Statement, Trigger, TriggerType,
};
use crate::common::Value;
use crate::error::{EngineError, Result};
use crate::eval::functions::is_builtin;
use lexer::{tokenize, SpannedToken, Token};
use std::collections::HashSet;
use std::path::Path as FsPath;

/// Parse a DSL unit into its declarations.
pub fn parse(text: &str) -> Result<Vec<Declaration>> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, pos: 0 };
    let declarations = parser.parse_unit()?;
    check_duplicates(&declarations)?;
    for declaration in &declarations {
        match declaration {
            Declaration::Action(action) => validate_action(action)?,
            Declaration::Rule(rule) => validate_rule(rule)?,
        }
    }
    Ok(declarations)
}

/// Parse a `.dsl` file.
pub fn parse_file(path: impl AsRef<FsPath>) -> Result<Vec<Declaration>> {
    let text = std::fs::read_to_string(path)?;
    parse(&text)
}

fn check_duplicates(declarations: &[Declaration]) -> Result<()> {
    let mut actions = HashSet::new();
    let mut rules = HashSet::new();
    for declaration in declarations {
        match declaration {
            Declaration::Action(action) => {
                if !actions.insert(action.qualified_name()) {
                    return Err(EngineError::Semantic(format!(
                        "duplicate action '{}'",
                        action.qualified_name()
                    )));
                }
            }
            Declaration::Rule(rule) => {
                if !rules.insert(rule.name.clone()) {
                    return Err(EngineError::Semantic(format!(
                        "duplicate rule '{}'",
                        rule.name
                    )));
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &SpannedToken {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_token(&self) -> &Token {
        &self.peek().token
    }

    fn advance(&mut self) -> SpannedToken {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek_token() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &str) -> EngineError {
        let found = self.peek();
        EngineError::syntax(
            found.line,
            found.column,
            format!("expected {}, found {}", expected, found.token.describe()),
        )
    }

    fn expect(&mut self, token: Token, expected: &str) -> Result<SpannedToken> {
        if self.peek_token() == &token {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_identifier(&mut self, expected: &str) -> Result<String> {
        match self.peek_token() {
            Token::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    fn expect_string(&mut self, expected: &str) -> Result<String> {
        match self.peek_token() {
            Token::StringLit(text) => {
                let text = text.clone();
                self.advance();
                Ok(text)
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn parse_unit(&mut self) -> Result<Vec<Declaration>> {
        let mut declarations = Vec::new();
        loop {
            match self.peek_token() {
                Token::Eof => break,
                Token::Action => declarations.push(Declaration::Action(self.parse_action()?)),
                Token::Rule => declarations.push(Declaration::Rule(self.parse_rule()?)),
                _ => return Err(self.unexpected("'ACTION' or 'RULE'")),
            }
        }
        Ok(declarations)
    }

    fn parse_action(&mut self) -> Result<ActionDef> {
        self.expect(Token::Action, "'ACTION'")?;
        let entity_type = self.expect_identifier("entity type")?;
        self.expect(Token::Dot, "'.'")?;
        let name = self.expect_identifier("action name")?;

        let mut parameters = Vec::new();
        if self.eat(&Token::LeftParen) {
            if !self.eat(&Token::RightParen) {
                loop {
                    parameters.push(self.parse_parameter()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RightParen, "')'")?;
            }
        }

        self.expect(Token::LeftBrace, "'{'")?;

        let mut preconditions = Vec::new();
        while self.peek_token() == &Token::Precondition {
            preconditions.push(self.parse_precondition()?);
        }
        if preconditions.is_empty() {
            return Err(self.unexpected("'PRECONDITION'"));
        }

        let mut effect = Vec::new();
        if self.eat(&Token::Effect) {
            self.expect(Token::LeftBrace, "'{'")?;
            while self.peek_token() != &Token::RightBrace {
                effect.push(self.parse_statement()?);
            }
            self.expect(Token::RightBrace, "'}'")?;
        }

        self.expect(Token::RightBrace, "'}'")?;

        Ok(ActionDef {
            entity_type,
            name,
            parameters,
            preconditions,
            effect,
        })
    }

    fn parse_parameter(&mut self) -> Result<Parameter> {
        let name = self.expect_identifier("parameter name")?;
        self.expect(Token::Colon, "':'")?;
        let spanned = self.peek().clone();
        let type_name = self.expect_identifier("parameter type")?;
        let param_type = match type_name.as_str() {
            "String" => ParamType::String,
            "Number" => ParamType::Number,
            "Boolean" => ParamType::Boolean,
            "Timestamp" => ParamType::Timestamp,
            "Any" => ParamType::Any,
            other => {
                return Err(EngineError::syntax(
                    spanned.line,
                    spanned.column,
                    format!("unknown parameter type '{}'", other),
                ));
            }
        };
        let optional = self.eat(&Token::Optional);
        Ok(Parameter {
            name,
            param_type,
            optional,
        })
    }

    fn parse_precondition(&mut self) -> Result<Precondition> {
        self.expect(Token::Precondition, "'PRECONDITION'")?;
        let label = if self.peek_token() == &Token::Colon {
            None
        } else {
            Some(self.expect_identifier("precondition label or ':'")?)
        };
        self.expect(Token::Colon, "':'")?;
        let condition = self.parse_expression()?;
        self.expect(Token::OnFailure, "'ON_FAILURE'")?;
        self.expect(Token::Colon, "':'")?;
        let on_failure = self.expect_string("failure message string")?;
        Ok(Precondition {
            label,
            condition,
            on_failure,
        })
    }

    fn parse_rule(&mut self) -> Result<RuleDef> {
        self.expect(Token::Rule, "'RULE'")?;
        let name = self.expect_identifier("rule name")?;
        let priority = if self.eat(&Token::Priority) {
            match self.peek_token() {
                Token::IntegerLit(value) => {
                    let value = *value;
                    self.advance();
                    value
                }
                _ => return Err(self.unexpected("priority integer")),
            }
        } else {
            0
        };
        self.expect(Token::LeftBrace, "'{'")?;
        let trigger = self.parse_trigger()?;
        let body = self.parse_for_clause()?;
        self.expect(Token::RightBrace, "'}'")?;
        Ok(RuleDef {
            name,
            priority,
            trigger,
            body,
        })
    }

    fn parse_trigger(&mut self) -> Result<Trigger> {
        self.expect(Token::On, "'ON'")?;
        let spanned = self.peek().clone();
        let trigger_type = match self.peek_token() {
            Token::Update => TriggerType::Update,
            Token::Create => TriggerType::Create,
            Token::Delete => TriggerType::Delete,
            Token::Link => TriggerType::Link,
            Token::Scan => TriggerType::Scan,
            _ => return Err(self.unexpected("trigger type")),
        };
        self.advance();
        self.expect(Token::LeftParen, "'('")?;
        let entity_type = self.expect_identifier("entity type")?;
        let property = if self.eat(&Token::Dot) {
            Some(self.expect_identifier("property name")?)
        } else {
            None
        };
        self.expect(Token::RightParen, "')'")?;

        match (trigger_type, &property) {
            (TriggerType::Update, None) => Err(EngineError::syntax(
                spanned.line,
                spanned.column,
                "UPDATE trigger requires a property, e.g. ON UPDATE(Type.prop)",
            )),
            (TriggerType::Update, Some(_)) => Ok(Trigger {
                trigger_type,
                entity_type,
                property,
            }),
            (_, Some(_)) => Err(EngineError::syntax(
                spanned.line,
                spanned.column,
                format!("{} trigger does not take a property", trigger_type),
            )),
            (_, None) => Ok(Trigger {
                trigger_type,
                entity_type,
                property,
            }),
        }
    }

    fn parse_for_clause(&mut self) -> Result<ForClause> {
        self.expect(Token::For, "'FOR'")?;
        self.expect(Token::LeftParen, "'('")?;
        let variable = self.expect_identifier("loop variable")?;
        self.expect(Token::Colon, "':'")?;
        let entity_type = self.expect_identifier("entity type")?;
        let guard = if self.eat(&Token::Where) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.expect(Token::RightParen, "')'")?;
        self.expect(Token::LeftBrace, "'{'")?;
        let mut body = Vec::new();
        while self.peek_token() != &Token::RightBrace {
            body.push(self.parse_statement()?);
        }
        self.expect(Token::RightBrace, "'}'")?;
        Ok(ForClause {
            variable,
            entity_type,
            guard,
            body,
        })
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.peek_token() {
            Token::Set => {
                self.advance();
                let target = self.parse_path()?;
                self.expect(Token::Assign, "'='")?;
                let value = self.parse_expression()?;
                self.expect(Token::Semicolon, "';'")?;
                Ok(Statement::Set { target, value })
            }
            Token::Trigger => {
                self.advance();
                let entity_type = self.expect_identifier("entity type")?;
                self.expect(Token::Dot, "'.'")?;
                let action = self.expect_identifier("action name")?;
                self.expect(Token::On, "'ON'")?;
                let entity_var = if self.eat(&Token::This) {
                    "this".to_string()
                } else {
                    self.expect_identifier("target variable")?
                };
                let mut args = Vec::new();
                if self.eat(&Token::With) {
                    self.expect(Token::LeftBrace, "'{'")?;
                    if self.peek_token() != &Token::RightBrace {
                        loop {
                            let name = self.expect_identifier("argument name")?;
                            self.expect(Token::Colon, "':'")?;
                            let expr = self.parse_expression()?;
                            args.push((name, expr));
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RightBrace, "'}'")?;
                }
                self.expect(Token::Semicolon, "';'")?;
                Ok(Statement::Trigger {
                    entity_var,
                    entity_type,
                    action,
                    args,
                })
            }
            Token::For => Ok(Statement::For(self.parse_for_clause()?)),
            _ => Err(self.unexpected("'SET', 'TRIGGER' or 'FOR'")),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expression(&mut self) -> Result<Expression> {
        let first = self.parse_conjunction()?;
        if self.peek_token() != &Token::Or {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&Token::Or) {
            operands.push(self.parse_conjunction()?);
        }
        Ok(Expression::Logical {
            op: LogicalOp::Or,
            operands,
        })
    }

    fn parse_conjunction(&mut self) -> Result<Expression> {
        let first = self.parse_negation()?;
        if self.peek_token() != &Token::And {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&Token::And) {
            operands.push(self.parse_negation()?);
        }
        Ok(Expression::Logical {
            op: LogicalOp::And,
            operands,
        })
    }

    fn parse_negation(&mut self) -> Result<Expression> {
        if self.eat(&Token::Not) {
            let operand = self.parse_negation()?;
            return Ok(Expression::Logical {
                op: LogicalOp::Not,
                operands: vec![operand],
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expression> {
        if self.peek_token() == &Token::Exists {
            return self.parse_exists();
        }

        let term = self.parse_term()?;

        let op = match self.peek_token() {
            Token::EqEq => Some(ComparisonOp::Eq),
            Token::NotEqual => Some(ComparisonOp::Ne),
            Token::LessThan => Some(ComparisonOp::Lt),
            Token::GreaterThan => Some(ComparisonOp::Gt),
            Token::LessThanOrEqual => Some(ComparisonOp::Le),
            Token::GreaterThanOrEqual => Some(ComparisonOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_term()?;
            return Ok(Expression::Comparison {
                op,
                left: Box::new(term),
                right: Box::new(right),
            });
        }

        match self.peek_token() {
            Token::In => {
                self.advance();
                self.expect(Token::LeftBracket, "'['")?;
                let mut items = Vec::new();
                if self.peek_token() != &Token::RightBracket {
                    loop {
                        items.push(self.parse_literal_value()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(Token::RightBracket, "']'")?;
                Ok(Expression::InList {
                    value: Box::new(term),
                    items,
                })
            }
            Token::Is => {
                self.advance();
                let negated = self.eat(&Token::Not);
                self.expect(Token::Null, "'NULL'")?;
                Ok(Expression::NullCheck {
                    value: Box::new(term),
                    negated,
                })
            }
            Token::Matches => {
                self.advance();
                let pattern = self.expect_string("pattern string")?;
                Ok(Expression::Matches {
                    value: Box::new(term),
                    pattern,
                })
            }
            Token::Changed => {
                let spanned = self.advance();
                let property = match &term {
                    Expression::Path(path) => path.property().map(str::to_string),
                    _ => None,
                };
                let property = property.ok_or_else(|| {
                    EngineError::syntax(
                        spanned.line,
                        spanned.column,
                        "CHANGED applies to a single property path",
                    )
                })?;
                let (from, to) = if self.eat(&Token::From) {
                    let from = self.parse_literal_value()?;
                    self.expect(Token::To, "'TO'")?;
                    let to = self.parse_literal_value()?;
                    (Some(from), Some(to))
                } else {
                    (None, None)
                };
                Ok(Expression::Changed { property, from, to })
            }
            // Bare relationship pattern, sugar for EXISTS
            Token::RelOpen => {
                let spanned = self.advance();
                let from_var = match &term {
                    Expression::Path(path) if path.segments.is_empty() => {
                        path.head_name().to_string()
                    }
                    _ => {
                        return Err(EngineError::syntax(
                            spanned.line,
                            spanned.column,
                            "relationship pattern requires a bound variable on the left",
                        ));
                    }
                };
                let relationship = self.expect_identifier("relationship type")?;
                self.expect(Token::RelClose, "']->'")?;
                let to_var = if self.eat(&Token::This) {
                    "this".to_string()
                } else {
                    self.expect_identifier("target variable")?
                };
                Ok(Expression::Exists {
                    from_var,
                    relationship,
                    to_var,
                    filter: None,
                })
            }
            _ => Ok(term),
        }
    }

    fn parse_exists(&mut self) -> Result<Expression> {
        self.expect(Token::Exists, "'EXISTS'")?;
        self.expect(Token::LeftParen, "'('")?;
        let from_var = if self.eat(&Token::This) {
            "this".to_string()
        } else {
            self.expect_identifier("source variable")?
        };
        self.expect(Token::RelOpen, "'-['")?;
        let relationship = self.expect_identifier("relationship type")?;
        self.expect(Token::RelClose, "']->'")?;
        let to_var = if self.eat(&Token::This) {
            "this".to_string()
        } else {
            self.expect_identifier("target variable")?
        };
        let filter = if self.eat(&Token::Where) {
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };
        self.expect(Token::RightParen, "')'")?;
        Ok(Expression::Exists {
            from_var,
            relationship,
            to_var,
            filter,
        })
    }

    fn parse_term(&mut self) -> Result<Expression> {
        match self.peek_token().clone() {
            Token::LeftParen => {
                self.advance();
                let inner = self.parse_expression()?;
                self.expect(Token::RightParen, "')'")?;
                Ok(inner)
            }
            Token::StringLit(text) => {
                self.advance();
                Ok(Expression::Literal(Value::String(text)))
            }
            Token::IntegerLit(value) => {
                self.advance();
                Ok(Expression::Literal(Value::Integer(value)))
            }
            Token::FloatLit(value) => {
                self.advance();
                Ok(Expression::Literal(Value::Float(value)))
            }
            Token::BooleanLit(value) => {
                self.advance();
                Ok(Expression::Literal(Value::Boolean(value)))
            }
            Token::Null => {
                self.advance();
                Ok(Expression::Literal(Value::Null))
            }
            Token::This => {
                self.advance();
                let segments = self.parse_path_segments()?;
                Ok(Expression::Path(Path::this(segments)))
            }
            Token::Identifier(name) => {
                self.advance();
                if self.peek_token() == &Token::LeftParen {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek_token() != &Token::RightParen {
                        loop {
                            args.push(self.parse_expression()?);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RightParen, "')'")?;
                    return Ok(Expression::FunctionCall { name, args });
                }
                let segments = self.parse_path_segments()?;
                Ok(Expression::Path(Path::variable(name, segments)))
            }
            _ => Err(self.unexpected("expression term")),
        }
    }

    fn parse_path_segments(&mut self) -> Result<Vec<String>> {
        let mut segments = Vec::new();
        while self.eat(&Token::Dot) {
            segments.push(self.expect_identifier("property name")?);
        }
        Ok(segments)
    }

    fn parse_path(&mut self) -> Result<Path> {
        if self.eat(&Token::This) {
            let segments = self.parse_path_segments()?;
            return Ok(Path::this(segments));
        }
        let name = self.expect_identifier("variable")?;
        let segments = self.parse_path_segments()?;
        Ok(Path::variable(name, segments))
    }

    fn parse_literal_value(&mut self) -> Result<Value> {
        match self.peek_token().clone() {
            Token::StringLit(text) => {
                self.advance();
                Ok(Value::String(text))
            }
            Token::IntegerLit(value) => {
                self.advance();
                Ok(Value::Integer(value))
            }
            Token::FloatLit(value) => {
                self.advance();
                Ok(Value::Float(value))
            }
            Token::BooleanLit(value) => {
                self.advance();
                Ok(Value::Boolean(value))
            }
            Token::Null => {
                self.advance();
                Ok(Value::Null)
            }
            _ => Err(self.unexpected("literal value")),
        }
    }
}

// ============================================================================
// Semantic validation
// ============================================================================

struct Scope {
    variables: HashSet<String>,
    allow_this: bool,
}

impl Scope {
    fn resolves(&self, name: &str) -> bool {
        if name == "this" {
            self.allow_this
        } else {
            self.variables.contains(name)
        }
    }
}

fn validate_rule(rule: &RuleDef) -> Result<()> {
    let mut scope = Scope {
        variables: HashSet::new(),
        allow_this: false,
    };
    validate_for(&rule.body, &mut scope)
}

fn validate_action(action: &ActionDef) -> Result<()> {
    let mut scope = Scope {
        variables: action.parameters.iter().map(|p| p.name.clone()).collect(),
        allow_this: true,
    };
    for precondition in &action.preconditions {
        validate_expr(&precondition.condition, &scope)?;
    }
    for statement in &action.effect {
        validate_statement(statement, &mut scope)?;
    }
    Ok(())
}

fn validate_for(clause: &ForClause, scope: &mut Scope) -> Result<()> {
    if !scope.variables.insert(clause.variable.clone()) {
        return Err(EngineError::Semantic(format!(
            "loop variable '{}' shadows an enclosing binding",
            clause.variable
        )));
    }
    if let Some(guard) = &clause.guard {
        validate_expr(guard, scope)?;
    }
    for statement in &clause.body {
        validate_statement(statement, scope)?;
    }
    scope.variables.remove(&clause.variable);
    Ok(())
}

fn validate_statement(statement: &Statement, scope: &mut Scope) -> Result<()> {
    match statement {
        Statement::Set { target, value } => {
            match &target.head {
                PathHead::This if !scope.allow_this => {
                    return Err(EngineError::Semantic(
                        "'this' is only available inside action effects".to_string(),
                    ));
                }
                PathHead::Variable(name) if !scope.variables.contains(name) => {
                    return Err(EngineError::Semantic(format!(
                        "SET target '{}' is not bound by an enclosing FOR",
                        name
                    )));
                }
                _ => {}
            }
            if target.property().is_none() {
                return Err(EngineError::Semantic(format!(
                    "SET target '{}' must name exactly one property",
                    target
                )));
            }
            validate_expr(value, scope)
        }
        Statement::Trigger {
            entity_var, args, ..
        } => {
            if !scope.resolves(entity_var) {
                return Err(EngineError::Semantic(format!(
                    "TRIGGER target '{}' is not bound by an enclosing FOR",
                    entity_var
                )));
            }
            for (_, expr) in args {
                validate_expr(expr, scope)?;
            }
            Ok(())
        }
        Statement::For(clause) => validate_for(clause, scope),
    }
}

fn validate_expr(expr: &Expression, scope: &Scope) -> Result<()> {
    match expr {
        Expression::Literal(_) | Expression::Changed { .. } => Ok(()),
        Expression::Path(path) => {
            if scope.resolves(path.head_name()) {
                Ok(())
            } else {
                Err(EngineError::Semantic(format!(
                    "variable '{}' is not bound by an enclosing FOR",
                    path.head_name()
                )))
            }
        }
        Expression::Comparison { left, right, .. } => {
            validate_expr(left, scope)?;
            validate_expr(right, scope)
        }
        Expression::InList { value, .. }
        | Expression::NullCheck { value, .. }
        | Expression::Matches { value, .. } => validate_expr(value, scope),
        Expression::Logical { operands, .. } => {
            for operand in operands {
                validate_expr(operand, scope)?;
            }
            Ok(())
        }
        Expression::FunctionCall { name, args } => {
            if !is_builtin(name) {
                return Err(EngineError::Semantic(format!("unknown function '{}'", name)));
            }
            for arg in args {
                validate_expr(arg, scope)?;
            }
            Ok(())
        }
        Expression::Exists {
            from_var,
            to_var,
            filter,
            ..
        } => {
            for var in [from_var, to_var] {
                if !scope.resolves(var) {
                    return Err(EngineError::Semantic(format!(
                        "pattern variable '{}' is not bound by an enclosing FOR",
                        var
                    )));
                }
            }
            if let Some(filter) = filter {
                validate_expr(filter, scope)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCKING_RULE: &str = r#"
        RULE R1 PRIORITY 100 {
            ON UPDATE(Supplier.status)
            FOR (s:Supplier WHERE s.status IN ["Expired", "Blacklisted", "Suspended"]) {
                FOR (po:PurchaseOrder WHERE po -[orderedFrom]-> s AND po.status == "Open") {
                    SET po.status = "RiskLocked";
                }
            }
        }
    "#;

    const SUBMIT_ACTION: &str = r#"
        ACTION PurchaseOrder.submit(approver: String, urgency: Number OPTIONAL) {
            PRECONDITION P1: this.status == "Draft" ON_FAILURE: "Must be draft"
            PRECONDITION P2: this.amount > 0 ON_FAILURE: "Amount must be positive"
            EFFECT {
                SET this.status = "Submitted";
                SET this.submittedAt = NOW();
            }
        }
    "#;

    #[test]
    fn test_parse_rule() {
        let declarations = parse(BLOCKING_RULE).unwrap();
        assert_eq!(declarations.len(), 1);
        let Declaration::Rule(rule) = &declarations[0] else {
            panic!("expected rule");
        };
        assert_eq!(rule.name, "R1");
        assert_eq!(rule.priority, 100);
        assert_eq!(rule.trigger.key(), "UPDATE|Supplier|status");
        assert_eq!(rule.body.variable, "s");
        assert_eq!(rule.body.body.len(), 1);
        let Statement::For(inner) = &rule.body.body[0] else {
            panic!("expected nested FOR");
        };
        assert_eq!(inner.entity_type, "PurchaseOrder");
        let Some(Expression::Logical { operands, .. }) = &inner.guard else {
            panic!("expected AND guard");
        };
        assert!(matches!(operands[0], Expression::Exists { .. }));
    }

    #[test]
    fn test_parse_action() {
        let declarations = parse(SUBMIT_ACTION).unwrap();
        let Declaration::Action(action) = &declarations[0] else {
            panic!("expected action");
        };
        assert_eq!(action.qualified_name(), "PurchaseOrder.submit");
        assert_eq!(action.parameters.len(), 2);
        assert!(action.parameters[1].optional);
        assert_eq!(action.preconditions.len(), 2);
        assert_eq!(action.preconditions[0].on_failure, "Must be draft");
        assert_eq!(action.effect.len(), 2);
    }

    #[test]
    fn test_syntax_error_carries_position() {
        let err = parse("RULE {").unwrap_err();
        match err {
            EngineError::Syntax { line, column, .. } => {
                assert_eq!(line, 1);
                assert_eq!(column, 6);
            }
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_no_partial_ast_on_error() {
        // Second declaration is malformed; nothing is returned
        let text = format!("{}\nRULE Broken {{", BLOCKING_RULE);
        assert!(parse(&text).is_err());
    }

    #[test]
    fn test_duplicate_rule_name_rejected() {
        let text = format!("{}{}", BLOCKING_RULE, BLOCKING_RULE);
        let err = parse(&text).unwrap_err();
        assert!(matches!(err, EngineError::Semantic(_)));
    }

    #[test]
    fn test_duplicate_action_rejected() {
        let text = format!("{}{}", SUBMIT_ACTION, SUBMIT_ACTION);
        assert!(matches!(
            parse(&text).unwrap_err(),
            EngineError::Semantic(_)
        ));
    }

    #[test]
    fn test_update_trigger_requires_property() {
        let text = r#"
            RULE R {
                ON UPDATE(Supplier)
                FOR (s:Supplier) { SET s.status = "X"; }
            }
        "#;
        assert!(parse(text).is_err());
    }

    #[test]
    fn test_create_trigger_rejects_property() {
        let text = r#"
            RULE R {
                ON CREATE(Supplier.status)
                FOR (s:Supplier) { SET s.status = "X"; }
            }
        "#;
        assert!(parse(text).is_err());
    }

    #[test]
    fn test_dangling_variable_rejected() {
        let text = r#"
            RULE R {
                ON CREATE(Supplier)
                FOR (s:Supplier) { SET other.status = "X"; }
            }
        "#;
        let err = parse(text).unwrap_err();
        assert!(err.to_string().contains("other"));
    }

    #[test]
    fn test_this_rejected_in_rule_body() {
        let text = r#"
            RULE R {
                ON CREATE(Supplier)
                FOR (s:Supplier) { SET this.status = "X"; }
            }
        "#;
        assert!(matches!(
            parse(text).unwrap_err(),
            EngineError::Semantic(_)
        ));
    }

    #[test]
    fn test_unknown_function_rejected_at_load() {
        let text = r#"
            ACTION PurchaseOrder.close {
                PRECONDITION: FROBNICATE(this.status) == "x" ON_FAILURE: "no"
            }
        "#;
        assert!(matches!(
            parse(text).unwrap_err(),
            EngineError::Semantic(_)
        ));
    }

    #[test]
    fn test_changed_predicate_forms() {
        let text = r#"
            ACTION Supplier.audit {
                PRECONDITION: this.status CHANGED FROM "Active" TO "Suspended" ON_FAILURE: "n/a"
                PRECONDITION: this.status CHANGED ON_FAILURE: "n/a"
            }
        "#;
        let declarations = parse(text).unwrap();
        let Declaration::Action(action) = &declarations[0] else {
            panic!("expected action");
        };
        assert!(matches!(
            action.preconditions[0].condition,
            Expression::Changed {
                from: Some(_),
                to: Some(_),
                ..
            }
        ));
        assert!(matches!(
            action.preconditions[1].condition,
            Expression::Changed {
                from: None,
                to: None,
                ..
            }
        ));
    }

    #[test]
    fn test_canonical_round_trip() {
        for source in [BLOCKING_RULE, SUBMIT_ACTION] {
            let first = parse(source).unwrap();
            let canonical = first
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join("\n");
            let second = parse(&canonical).unwrap();
            assert_eq!(first, second, "canonical form drifted:\n{}", canonical);
        }
    }

    #[test]
    fn test_parse_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", SUBMIT_ACTION).unwrap();
        let declarations = parse_file(file.path()).unwrap();
        assert_eq!(declarations.len(), 1);
    }
}
