//! Lisp Bridge Library
//!
//! Drive a long-running Common Lisp interpreter from Rust. Host values are
//! written as Lisp syntax, sent to a child process, evaluated there, and
//! the results read back into host values.
//!
//! - `value` - host representation of remote data
//! - `symbol` - symbols, namespaces and case conventions
//! - `reader` / `writer` - the textual codec
//! - `bridge` - proxy classes for remote objects
//! - `ipc` - the child process session and its four-part response framing
//! - `config` - how to launch the interpreter
//!
//! # Example
//!
//! ```ignore
//! use lisp_bridge::{Session, SessionConfig, Value};
//!
//! let mut lisp = Session::start(SessionConfig::resolve()?)?;
//! let quotient = lisp.call("cl:floor", &[Value::from(7), Value::from(2)])?;
//! // Returned::Many([Integer(3), Integer(1)])
//! ```
//!
//! Nothing here installs a `tracing` subscriber; applications choose their
//! own.

pub mod bridge;
pub mod config;
pub mod error;
pub mod ipc;
pub mod reader;
pub mod symbol;
pub mod value;
pub mod writer;

pub use bridge::{ClassRegistry, Evaluator, Member, ProxyClass, ProxyId, RemoteFunction};
pub use config::SessionConfig;
pub use error::{EncodingError, Error, RemoteError, Result, SyntaxError};
pub use ipc::{Session, SessionState};
pub use reader::read_from_str;
pub use symbol::{Symbol, SymbolTable};
pub use value::{ForeignObject, Package, Returned, SessionId, Value};
pub use writer::{to_lisp, Writer};
