//! Error kinds shared across the skein workspace.

use thiserror::Error;

/// Result alias used throughout the kernel.
pub type Result<T> = std::result::Result<T, Error>;

/// Every way a skein program can fail.
///
/// `MissingKey` is the one *recoverable* kind: `goto_map` and `replace_map`
/// convert it into the `NULL` match sentinel instead of failing. Everything
/// else propagates up the frame stack. `Cancelled` is the cooperative
/// cancellation outcome and is not a user-visible error unless it escapes
/// the top frame.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed JSON5 or program shape.
    #[error("parse error: {0}")]
    Parse(String),

    /// Static validation failure (missing field, unknown command, ...).
    #[error("program validation failed:\n{0}")]
    Analyze(String),

    /// Interpolation could not resolve a key. Recoverable for
    /// `goto_map`/`replace_map`, fatal elsewhere.
    #[error("could not resolve insert '{0}'")]
    MissingKey(String),

    /// A value had the wrong shape at runtime.
    #[error("type error: {0}")]
    Type(String),

    /// Out-of-range `list_index`.
    #[error("index error: {0}")]
    Index(String),

    /// Unknown label or unknown named task.
    #[error("name error: {0}")]
    Name(String),

    /// Non-integer result, division by zero, overflow, bad expression.
    #[error("math error: {0}")]
    Math(String),

    /// Invalid wildcard pattern.
    #[error("pattern error: {0}")]
    Pattern(String),

    /// HTTP failure, non-2xx status, malformed response.
    #[error("transport error: {0}")]
    Transport(String),

    /// Cooperative cancellation.
    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A task failed; carries the source line of the offending task.
    #[error("Error at line {line}: {source}")]
    Task {
        line: i64,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Attach a source line to an error, unless it is a cancellation or
    /// already carries one (the innermost task wins).
    pub fn at_line(self, line: Option<i64>) -> Error {
        match (self, line) {
            (err @ Error::Cancelled, _) => err,
            (err @ Error::Task { .. }, _) => err,
            (err, Some(line)) => Error::Task {
                line,
                source: Box::new(err),
            },
            (err, None) => err,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_missing_key(&self) -> bool {
        matches!(self, Error::MissingKey(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_line_wraps_once() {
        let err = Error::Type("list expected".into()).at_line(Some(12));
        assert_eq!(err.to_string(), "Error at line 12: type error: list expected");
        // A second annotation (outer frame) must not re-wrap.
        let err = err.at_line(Some(40));
        assert_eq!(err.to_string(), "Error at line 12: type error: list expected");
    }

    #[test]
    fn cancelled_is_never_wrapped() {
        let err = Error::Cancelled.at_line(Some(3));
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "cancelled");
    }

    #[test]
    fn missing_key_is_recoverable_kind() {
        assert!(Error::MissingKey("x".into()).is_missing_key());
        assert!(!Error::Name("x".into()).is_missing_key());
    }
}
