use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by every lrouter operation.
#[derive(Debug, Error)]
pub enum Error {
    /// Listing text did not match any shape the parser knows about
    #[error("unrecognized {what} output: {line}")]
    Parse { what: &'static str, line: String },

    /// Referenced chain, table, position or priority does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Caller intent is missing or carries an unusable field
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// The external tool exited non-zero. Displays the tool's own output unchanged.
    #[error("{output}")]
    Execution {
        program: String,
        status: Option<i32>,
        output: String,
    },

    /// Store read/write failure or failure to spawn a tool
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Kernel netlink request failed
    #[error("netlink: {0}")]
    Netlink(String),

    /// Archive entry that would land outside the store root, or is not a plain file or directory
    #[error("archive entry rejected: {entry}")]
    PathTraversal { entry: String },
}

/// Coarse classification used by callers that only care about the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    NotFound,
    Validation,
    Execution,
    Io,
}

impl Error {
    pub fn parse(what: &'static str, line: impl Into<String>) -> Self {
        Self::Parse {
            what,
            line: line.into(),
        }
    }

    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn io_at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        Self::io(path.display().to_string(), source)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. } => ErrorKind::Parse,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::Io { .. } | Self::Netlink(_) | Self::PathTraversal { .. } => ErrorKind::Io,
        }
    }

    /// Raw diagnostic text of a failed tool run, if this is one.
    pub fn tool_output(&self) -> Option<&str> {
        match self {
            Self::Execution { output, .. } => Some(output),
            _ => None,
        }
    }

    /// True when the tool refused an add because the entry is already present.
    ///
    /// iproute2 reports this as `RTNETLINK answers: File exists`.
    pub fn is_already_exists(&self) -> bool {
        self.tool_output()
            .map(|out| out.contains("File exists"))
            .unwrap_or(false)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parse => "parse",
            Self::NotFound => "not-found",
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_displays_tool_output_verbatim() {
        let err = Error::Execution {
            program: "iptables".into(),
            status: Some(1),
            output: "iptables: Chain already exists.\n".into(),
        };
        assert_eq!(err.to_string(), "iptables: Chain already exists.\n");
        assert_eq!(err.kind(), ErrorKind::Execution);
    }

    #[test]
    fn file_exists_is_recognized() {
        let err = Error::Execution {
            program: "ip".into(),
            status: Some(2),
            output: "RTNETLINK answers: File exists\n".into(),
        };
        assert!(err.is_already_exists());
        assert!(!Error::NotFound("chain FOO".into()).is_already_exists());
    }

    #[test]
    fn traversal_is_an_io_failure() {
        let err = Error::PathTraversal {
            entry: "../etc/passwd".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
