//! Transport to the remote interpreter.
//!
//! # Architecture
//!
//! The interpreter runs as a child process and speaks plain Lisp syntax
//! over its standard streams:
//!
//! ```text
//! ┌─────────────────┐          stdin           ┌─────────────────────┐
//! │   Rust host     │  ───────────────────────►│  Lisp interpreter   │
//! │   (Session)     │  ◄───────────────────────│  (bootstrap.lisp)   │
//! └─────────────────┘          stdout          └─────────────────────┘
//! ```
//!
//! Each request is a single expression; each response is four expressions
//! (namespace, values, error, printed output). See [`framing`] for details.
//!
//! # Usage
//!
//! ```ignore
//! use lisp_bridge::{Session, SessionConfig, Value};
//!
//! let mut session = Session::start(SessionConfig::default())?;
//! let sum = session.call("cl:+", &[Value::from(1), Value::from(2)])?;
//! ```

pub mod framing;
mod session;

pub use framing::{read_response, write_request, Response};
pub use session::{Session, SessionState};
