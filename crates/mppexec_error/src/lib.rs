use std::error::Error;
use std::fmt;

pub type Result<T, E = MppError> = std::result::Result<T, E>;

/// Broad classification of an error.
///
/// Callers use the kind to decide between retrying, aborting a task, or
/// treating the error as a local programming fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A remote call failed. Retryable up to the attempt ceiling.
    Transport,
    /// A task was aborted, either directly or by a sibling in the same query.
    Aborted,
    /// A task ran past its deadline.
    TimedOut,
    /// Operation invoked on an object in the wrong state (closed, blocked,
    /// ...).
    InvalidState,
    /// Operation invoked with arguments that can never be valid.
    InvalidArgument,
    /// The thing being waited on was cancelled.
    Cancelled,
    /// Everything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::Aborted => "aborted",
            Self::TimedOut => "timed out",
            Self::InvalidState => "invalid state",
            Self::InvalidArgument => "invalid argument",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
pub struct MppError {
    inner: Box<MppErrorInner>,
}

#[derive(Debug)]
struct MppErrorInner {
    kind: ErrorKind,
    msg: String,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl MppError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Internal, msg)
    }

    pub fn with_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        MppError {
            inner: Box::new(MppErrorInner {
                kind,
                msg: msg.into(),
                source: None,
            }),
        }
    }

    pub fn with_source(msg: impl Into<String>, source: Box<dyn Error + Send + Sync>) -> Self {
        MppError {
            inner: Box::new(MppErrorInner {
                kind: ErrorKind::Internal,
                msg: msg.into(),
                source: Some(source),
            }),
        }
    }

    /// Replace the kind of this error, keeping the message and source.
    pub fn kind_of(mut self, kind: ErrorKind) -> Self {
        self.inner.kind = kind;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    pub fn get_msg(&self) -> &str {
        self.inner.msg.as_str()
    }

    /// Clone the kind and the fully rendered message.
    ///
    /// Sources aren't cloneable, so they're folded into the message. Used when
    /// the same failure has to be handed to more than one party (e.g. every
    /// sibling of an aborted task).
    pub fn clone_flattened(&self) -> Self {
        Self::with_kind(self.kind(), self.to_string())
    }
}

impl fmt::Display for MppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;
        if let Some(source) = &self.inner.source {
            write!(f, "\nError source: {source}")?;
        }
        Ok(())
    }
}

impl Error for MppError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<fmt::Error> for MppError {
    fn from(value: fmt::Error) -> Self {
        MppError::with_source("Format error", Box::new(value))
    }
}

impl From<std::io::Error> for MppError {
    fn from(value: std::io::Error) -> Self {
        MppError::with_source("IO error", Box::new(value))
    }
}

/// Return early with a "not implemented" error.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)+) => {{
        let msg = format!($($arg)+);
        return Err($crate::MppError::new(format!("Not yet implemented: {msg}")));
    }};
}

/// Helper for adding context to errors coming from other libraries.
pub trait ResultExt<T, E> {
    /// Wrap the error with a static message.
    fn context(self, msg: &'static str) -> Result<T>;

    /// Wrap the error with a lazily built message.
    fn context_fn<F: Fn() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Error + Send + Sync + 'static> ResultExt<T, E> for std::result::Result<T, E> {
    fn context(self, msg: &'static str) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(MppError::with_source(msg, Box::new(e))),
        }
    }

    fn context_fn<F: Fn() -> String>(self, f: F) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(MppError::with_source(f(), Box::new(e))),
        }
    }
}

pub trait OptionExt<T> {
    /// Return an error if the option is None.
    fn required(self, field: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, field: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(MppError::new(format!("Missing required field: {field}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_source() {
        let err = MppError::with_source("outer", Box::new(std::fmt::Error));
        let s = err.to_string();
        assert!(s.starts_with("outer"));
        assert!(s.contains("Error source"));
    }

    #[test]
    fn kind_defaults_to_internal() {
        let err = MppError::new("boom");
        assert_eq!(ErrorKind::Internal, err.kind());

        let err = err.kind_of(ErrorKind::Transport);
        assert_eq!(ErrorKind::Transport, err.kind());
        assert_eq!("boom", err.get_msg());
    }

    #[test]
    fn flattened_clone_keeps_kind_and_message() {
        let err = MppError::with_source("outer", Box::new(std::fmt::Error))
            .kind_of(ErrorKind::Aborted);
        let cloned = err.clone_flattened();
        assert_eq!(ErrorKind::Aborted, cloned.kind());
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn required_missing() {
        let v: Option<u32> = None;
        let err = v.required("thing").unwrap_err();
        assert!(err.to_string().contains("thing"));
    }

    #[test]
    fn not_implemented_returns_err() {
        fn f() -> Result<()> {
            not_implemented!("feature {}", 3)
        }
        let err = f().unwrap_err();
        assert!(err.to_string().contains("feature 3"));
    }
}
