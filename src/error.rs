use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{line}:{column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Semantic error: {0}")]
    Semantic(String),

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Precondition error: {0}")]
    PreconditionError(String),

    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Cascade overflow: {0}")]
    CascadeOverflow(String),

    #[error("Graph I/O error: {0}")]
    GraphIo(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Build a syntax error at a source position.
    pub fn syntax(line: usize, column: usize, message: impl Into<String>) -> Self {
        EngineError::Syntax {
            line,
            column,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_format() {
        let err = EngineError::syntax(3, 14, "unexpected token '}'");
        assert_eq!(err.to_string(), "3:14: unexpected token '}'");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.dsl");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
