/// Rule DSL Lexical Analyzer
///
/// Tokenizes rule-language source text. Every token carries the line and
/// column it started at so parse errors can point into the source.
use crate::error::{EngineError, Result};

/// Token types for lexical analysis
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    Action,
    Rule,
    Priority,
    On,
    Update,
    Create,
    Delete,
    Link,
    Scan,
    Precondition,
    OnFailure,
    Effect,
    For,
    Where,
    Set,
    Trigger,
    With,
    In,
    Is,
    Not,
    Null,
    And,
    Or,
    Matches,
    Changed,
    From,
    To,
    Exists,
    This,
    Optional,

    // Operators
    EqEq,               // ==
    NotEqual,           // !=
    LessThan,           // <
    LessThanOrEqual,    // <=
    GreaterThan,        // >
    GreaterThanOrEqual, // >=
    Assign,             // =

    // Delimiters
    Dot,
    Comma,
    Colon,
    Semicolon,
    LeftBrace,
    RightBrace,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    RelOpen,  // -[
    RelClose, // ]->

    // Literals
    IntegerLit(i64),
    FloatLit(f64),
    StringLit(String),
    BooleanLit(bool),

    // Identifiers
    Identifier(String),

    // End of input
    Eof,
}

impl Token {
    /// Human-readable form used in parse error messages.
    pub fn describe(&self) -> String {
        match self {
            Token::IntegerLit(i) => format!("integer '{}'", i),
            Token::FloatLit(v) => format!("float '{}'", v),
            Token::StringLit(s) => format!("string \"{}\"", s),
            Token::BooleanLit(b) => format!("'{}'", b),
            Token::Identifier(name) => format!("identifier '{}'", name),
            Token::Eof => "end of input".to_string(),
            Token::EqEq => "'=='".to_string(),
            Token::NotEqual => "'!='".to_string(),
            Token::LessThan => "'<'".to_string(),
            Token::LessThanOrEqual => "'<='".to_string(),
            Token::GreaterThan => "'>'".to_string(),
            Token::GreaterThanOrEqual => "'>='".to_string(),
            Token::Assign => "'='".to_string(),
            Token::Dot => "'.'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Colon => "':'".to_string(),
            Token::Semicolon => "';'".to_string(),
            Token::LeftBrace => "'{'".to_string(),
            Token::RightBrace => "'}'".to_string(),
            Token::LeftParen => "'('".to_string(),
            Token::RightParen => "')'".to_string(),
            Token::LeftBracket => "'['".to_string(),
            Token::RightBracket => "']'".to_string(),
            Token::RelOpen => "'-['".to_string(),
            Token::RelClose => "']->'".to_string(),
            other => format!("'{:?}'", other),
        }
    }
}

/// A token plus the source position it started at (1-based).
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub line: usize,
    pub column: usize,
}

/// Tokenize rule DSL source text
pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;
    let mut column = 1;

    macro_rules! push {
        ($tok:expr, $line:expr, $col:expr) => {
            tokens.push(SpannedToken {
                token: $tok,
                line: $line,
                column: $col,
            })
        };
    }

    while i < chars.len() {
        let ch = chars[i];

        // Skip whitespace, tracking line breaks
        if ch.is_whitespace() {
            if ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
            i += 1;
            continue;
        }

        // Line comments
        if ch == '/' && i + 1 < chars.len() && chars[i + 1] == '/' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
                column += 1;
            }
            continue;
        }

        let start_line = line;
        let start_column = column;

        // String literals
        if ch == '"' {
            i += 1;
            column += 1;
            let mut text = String::new();
            let mut terminated = false;
            while i < chars.len() {
                let c = chars[i];
                if c == '"' {
                    terminated = true;
                    i += 1;
                    column += 1;
                    break;
                }
                if c == '\\' {
                    if i + 1 >= chars.len() {
                        break;
                    }
                    let escaped = chars[i + 1];
                    match escaped {
                        '"' => text.push('"'),
                        '\\' => text.push('\\'),
                        'n' => text.push('\n'),
                        't' => text.push('\t'),
                        other => {
                            return Err(EngineError::syntax(
                                line,
                                column,
                                format!("invalid escape sequence '\\{}'", other),
                            ));
                        }
                    }
                    i += 2;
                    column += 2;
                    continue;
                }
                if c == '\n' {
                    line += 1;
                    column = 1;
                } else {
                    column += 1;
                }
                text.push(c);
                i += 1;
            }
            if !terminated {
                return Err(EngineError::syntax(
                    start_line,
                    start_column,
                    "unterminated string literal",
                ));
            }
            push!(Token::StringLit(text), start_line, start_column);
            continue;
        }

        // Numbers (including a leading minus)
        let negative = ch == '-' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit();
        if ch.is_ascii_digit() || negative {
            let start = i;
            if negative {
                i += 1;
                column += 1;
            }
            let mut is_float = false;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                if chars[i] == '.' {
                    // A second dot (or a trailing one before an identifier)
                    // terminates the number
                    if is_float || !chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
                        break;
                    }
                    is_float = true;
                }
                i += 1;
                column += 1;
            }
            let text: String = chars[start..i].iter().collect();
            if is_float {
                let value: f64 = text.parse().map_err(|_| {
                    EngineError::syntax(start_line, start_column, format!("invalid float: {}", text))
                })?;
                push!(Token::FloatLit(value), start_line, start_column);
            } else {
                let value: i64 = text.parse().map_err(|_| {
                    EngineError::syntax(
                        start_line,
                        start_column,
                        format!("invalid integer: {}", text),
                    )
                })?;
                push!(Token::IntegerLit(value), start_line, start_column);
            }
            continue;
        }

        // Identifiers and keywords
        if ch.is_alphabetic() || ch == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
                column += 1;
            }
            let ident: String = chars[start..i].iter().collect();

            let token = match ident.as_str() {
                "ACTION" => Token::Action,
                "RULE" => Token::Rule,
                "PRIORITY" => Token::Priority,
                "ON" => Token::On,
                "UPDATE" => Token::Update,
                "CREATE" => Token::Create,
                "DELETE" => Token::Delete,
                "LINK" => Token::Link,
                "SCAN" => Token::Scan,
                "PRECONDITION" => Token::Precondition,
                "ON_FAILURE" => Token::OnFailure,
                "EFFECT" => Token::Effect,
                "FOR" => Token::For,
                "WHERE" => Token::Where,
                "SET" => Token::Set,
                "TRIGGER" => Token::Trigger,
                "WITH" => Token::With,
                "IN" => Token::In,
                "IS" => Token::Is,
                "NOT" => Token::Not,
                "NULL" => Token::Null,
                "AND" => Token::And,
                "OR" => Token::Or,
                "MATCHES" => Token::Matches,
                "CHANGED" => Token::Changed,
                "FROM" => Token::From,
                "TO" => Token::To,
                "EXISTS" => Token::Exists,
                "OPTIONAL" => Token::Optional,
                "TRUE" => Token::BooleanLit(true),
                "FALSE" => Token::BooleanLit(false),
                "this" => Token::This,
                _ => Token::Identifier(ident),
            };
            push!(token, start_line, start_column);
            continue;
        }

        // Operators and delimiters
        match ch {
            '=' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    push!(Token::EqEq, start_line, start_column);
                    i += 2;
                    column += 2;
                } else {
                    push!(Token::Assign, start_line, start_column);
                    i += 1;
                    column += 1;
                }
            }
            '!' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    push!(Token::NotEqual, start_line, start_column);
                    i += 2;
                    column += 2;
                } else {
                    return Err(EngineError::syntax(
                        start_line,
                        start_column,
                        "unexpected character: !",
                    ));
                }
            }
            '<' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    push!(Token::LessThanOrEqual, start_line, start_column);
                    i += 2;
                    column += 2;
                } else {
                    push!(Token::LessThan, start_line, start_column);
                    i += 1;
                    column += 1;
                }
            }
            '>' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    push!(Token::GreaterThanOrEqual, start_line, start_column);
                    i += 2;
                    column += 2;
                } else {
                    push!(Token::GreaterThan, start_line, start_column);
                    i += 1;
                    column += 1;
                }
            }
            '-' => {
                if i + 1 < chars.len() && chars[i + 1] == '[' {
                    push!(Token::RelOpen, start_line, start_column);
                    i += 2;
                    column += 2;
                } else {
                    return Err(EngineError::syntax(
                        start_line,
                        start_column,
                        "unexpected character: -",
                    ));
                }
            }
            ']' => {
                if i + 2 < chars.len() && chars[i + 1] == '-' && chars[i + 2] == '>' {
                    push!(Token::RelClose, start_line, start_column);
                    i += 3;
                    column += 3;
                } else {
                    push!(Token::RightBracket, start_line, start_column);
                    i += 1;
                    column += 1;
                }
            }
            '.' => {
                push!(Token::Dot, start_line, start_column);
                i += 1;
                column += 1;
            }
            ',' => {
                push!(Token::Comma, start_line, start_column);
                i += 1;
                column += 1;
            }
            ':' => {
                push!(Token::Colon, start_line, start_column);
                i += 1;
                column += 1;
            }
            ';' => {
                push!(Token::Semicolon, start_line, start_column);
                i += 1;
                column += 1;
            }
            '{' => {
                push!(Token::LeftBrace, start_line, start_column);
                i += 1;
                column += 1;
            }
            '}' => {
                push!(Token::RightBrace, start_line, start_column);
                i += 1;
                column += 1;
            }
            '(' => {
                push!(Token::LeftParen, start_line, start_column);
                i += 1;
                column += 1;
            }
            ')' => {
                push!(Token::RightParen, start_line, start_column);
                i += 1;
                column += 1;
            }
            '[' => {
                push!(Token::LeftBracket, start_line, start_column);
                i += 1;
                column += 1;
            }
            other => {
                return Err(EngineError::syntax(
                    start_line,
                    start_column,
                    format!("unexpected character: {}", other),
                ));
            }
        }
    }

    tokens.push(SpannedToken {
        token: Token::Eof,
        line,
        column,
    });
    Ok(tokens)
}
