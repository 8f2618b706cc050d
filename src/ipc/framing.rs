//! Request/response framing for the remote evaluator.
//!
//! # Wire Format
//!
//! A request is one expression followed by a newline. The response is four
//! consecutive expressions separated by whitespace:
//!
//! ```text
//! "COMMON-LISP-USER"          ; namespace after evaluation (string or symbol)
//! (3 1)                       ; list of returned values
//! NIL                         ; NIL or (CONDITION-TYPE "report")
//! "printed output"            ; text written to standard output
//! ```
//!
//! There is no length prefix; the reader consumes exactly one expression
//! per part, so message boundaries fall out of the syntax.

use std::io::{BufRead, Write};

use tracing::trace;

use crate::bridge::ClassRegistry;
use crate::error::{RemoteError, Result, SyntaxError};
use crate::reader::{CharStream, Reader};
use crate::symbol::SymbolTable;
use crate::value::{SessionId, Value};

/// A decoded four-part response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Remote namespace after the evaluation.
    pub namespace: String,
    /// Returned values, possibly empty.
    pub values: Vec<Value>,
    /// Condition signalled during evaluation, if any.
    pub condition: Option<RemoteError>,
    /// Everything the evaluation printed.
    pub output: String,
}

/// Session state the reader needs while decoding a response.
pub struct ReadContext<'a> {
    pub symbols: &'a mut SymbolTable,
    pub classes: &'a mut ClassRegistry,
    /// Current namespace; updated as soon as part one has been read.
    pub namespace: &'a mut String,
    pub session: SessionId,
}

/// Write a request line and flush it.
///
/// # Errors
///
/// Returns [`crate::Error::Channel`] if the write or flush fails.
pub fn write_request<W: Write + ?Sized>(writer: &mut W, body: &str) -> Result<()> {
    trace!("-> {}", body);
    writer.write_all(body.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Read the four parts of one response.
///
/// Part one is applied to `ctx.namespace` before the remaining parts are
/// read, so symbols in the values resolve against the namespace the
/// evaluation left behind.
pub fn read_response<R: BufRead>(
    stream: &mut CharStream<R>,
    ctx: &mut ReadContext<'_>,
) -> Result<Response> {
    let namespace_part = read_part(stream, ctx)?;
    let namespace = match namespace_part {
        Value::String(name) => name,
        Value::Symbol(sym) => sym.name().to_string(),
        other => {
            return Err(SyntaxError::Malformed(format!("namespace part {:?}", other)).into());
        }
    };
    *ctx.namespace = namespace.clone();

    let values = read_part(stream, ctx)?
        .to_vec()
        .ok_or_else(|| SyntaxError::Malformed("value list".into()))?;
    let condition = decode_condition(&read_part(stream, ctx)?)?;
    let output = match read_part(stream, ctx)? {
        Value::String(text) => text,
        other => return Err(SyntaxError::Malformed(format!("output part {:?}", other)).into()),
    };

    Ok(Response {
        namespace,
        values,
        condition,
        output,
    })
}

fn read_part<R: BufRead>(stream: &mut CharStream<R>, ctx: &mut ReadContext<'_>) -> Result<Value> {
    let value = Reader::new(ctx.symbols, ctx.classes, ctx.namespace.as_str(), ctx.session)
        .read(stream)?;
    trace!("<- {:?}", value);
    Ok(value)
}

/// `NIL` means success; `(KIND MESSAGE)` describes a condition.
pub fn decode_condition(part: &Value) -> Result<Option<RemoteError>, SyntaxError> {
    let pair = match part {
        Value::Nil => return Ok(None),
        Value::Pair(pair) => pair,
        _ => return Err(SyntaxError::Malformed("error part".into())),
    };
    let kind = match &pair.head {
        Value::Symbol(sym) => sym.name().to_string(),
        Value::String(name) => name.clone(),
        _ => return Err(SyntaxError::Malformed("condition type".into())),
    };
    let message = pair
        .tail
        .iter()
        .next()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(Some(RemoteError { kind, message }))
}
