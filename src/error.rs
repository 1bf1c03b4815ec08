use miette::Diagnostic;
use thiserror::Error;

/// Result type for deflattening operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the deflattening pipeline
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum Error {
    #[error("I/O error: {0}")]
    #[diagnostic(code(js_deflat::io_error))]
    Io(String),

    #[error("Parse error: {message}")]
    #[diagnostic(code(js_deflat::parse_error))]
    Parse { message: String },

    #[error("Unhandled construct during {phase}: {message}")]
    #[diagnostic(code(js_deflat::unhandled_construct))]
    UnhandledConstruct { phase: String, message: String },

    #[error("Unsupported operation: {message}")]
    #[diagnostic(code(js_deflat::unsupported_operation))]
    UnsupportedOperation { message: String },

    #[error("Ill-formed block graph: {message}")]
    #[diagnostic(code(js_deflat::ill_formed_graph))]
    IllFormedGraph { message: String },

    #[error("Control flow structuring failed: {message}")]
    #[diagnostic(code(js_deflat::structuring_error))]
    Structuring { message: String },

    #[error("Solver error: {message}")]
    #[diagnostic(code(js_deflat::solver_error))]
    Solver { message: String },

    #[error("Internal error: {message}")]
    #[diagnostic(code(js_deflat::internal_error))]
    Internal { message: String },
}

impl Error {
    pub fn unhandled(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Error::UnhandledConstruct {
            phase: phase.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::UnsupportedOperation {
            message: message.into(),
        }
    }

    pub fn ill_formed(message: impl Into<String>) -> Self {
        Error::IllFormedGraph {
            message: message.into(),
        }
    }

    pub fn structuring(message: impl Into<String>) -> Self {
        Error::Structuring {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
