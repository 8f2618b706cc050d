//! Error types for the Lisp bridge.
//!
//! Every failure a caller can observe is an [`Error`]. Reader and writer
//! failures have their own enums so the codec can be used without a
//! session.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Malformed or truncated remote syntax.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxError {
    /// Input ended inside an expression (open list, string, escape).
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A closing delimiter with no matching opener.
    #[error("unmatched closing delimiter '{0}'")]
    Unmatched(char),

    /// A dot in a position where a dotted tail is not allowed.
    #[error("misplaced dot in list")]
    MisplacedDot,

    /// A token that is neither a number nor a valid symbol.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Unknown `#\Name` character name.
    #[error("invalid character name: {0}")]
    InvalidCharacterName(String),

    /// A `#` dispatch character this reader does not implement.
    #[error("unsupported dispatch macro #{0}")]
    UnsupportedDispatch(char),

    /// Hash table literal with a key but no value.
    #[error("odd number of hash table items")]
    OddHashTable,

    /// `#n#` referring to an unknown label or to one still being read.
    #[error("invalid label reference #{0}#")]
    Label(u64),

    /// Bytes on the wire that are not UTF-8.
    #[error("invalid UTF-8 in input")]
    InvalidUtf8,

    /// Well-formed syntax with the wrong shape for its position.
    #[error("malformed {0}")]
    Malformed(String),
}

/// A host value with no representation in remote syntax.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    /// NaN and infinities have no portable reader syntax.
    #[error("non-finite float {0}")]
    NonFiniteFloat(String),

    /// Packages are read-only snapshots; send the package name instead.
    #[error("package {0} cannot be sent back to the remote side")]
    Package(String),

    /// A foreign handle minted by another session.
    #[error("foreign object #{handle} belongs to another session")]
    ForeignSession {
        /// Remote reference token of the rejected object.
        handle: u64,
    },
}

/// A condition signalled by the remote interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// Condition type name, e.g. `DIVISION-BY-ZERO`.
    pub kind: String,
    /// Condition report, empty when the remote side sent none.
    pub message: String,
}

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The response stream contained malformed syntax.
    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),

    /// The request could not be serialized.
    #[error("cannot encode value: {0}")]
    Encoding(#[from] EncodingError),

    /// The remote side reported a condition. The session stays usable.
    #[error("remote error {0}")]
    Remote(#[from] RemoteError),

    /// The session has been shut down.
    #[error("session is closed")]
    Closed,

    /// Reading from or writing to the child process failed.
    #[error("channel error: {0}")]
    Channel(#[source] std::io::Error),

    /// The child process could not be started.
    #[error("failed to start remote process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Member call on an object whose class does not expose that member.
    #[error("{class} has no member {member}")]
    NoSuchMember {
        /// Remote class name of the receiver.
        class: String,
        /// Requested member name.
        member: String,
    },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Channel(err)
    }
}

impl Error {
    /// True when the stream position is undefined and the session must not
    /// be used again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Syntax(_) | Error::Channel(_))
    }

    /// Remote condition type name, if this is a remote error.
    pub fn kind_name(&self) -> Option<&str> {
        match self {
            Error::Remote(remote) => Some(&remote.kind),
            _ => None,
        }
    }
}
