//! Reader for the remote textual syntax.
//!
//! Implements the subset of the Common Lisp reader algorithm the remote
//! printer produces, with `READTABLE-CASE` fixed at `:UPCASE`, base 10 and
//! no read-time evaluation. [`Reader::read`] consumes exactly one
//! expression from a [`CharStream`], so consecutive calls walk through the
//! parts of a response without over-reading into the next one.

use std::collections::{HashMap, VecDeque};
use std::io::{self, BufRead};

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::Zero;
use tracing::trace;

use crate::bridge::ClassRegistry;
use crate::error::{Error, Result, SyntaxError};
use crate::symbol::{Symbol, SymbolTable, COMMON_LISP, COMMON_LISP_USER};
use crate::value::{ForeignObject, Package, SessionId, Value};

/// Named characters, indexed by code for the ASCII control range.
const CONTROL_CHARACTER_NAMES: [&str; 32] = [
    "NUL", "SOH", "STX", "ETX", "EOT", "ENQ", "ACK", "BEL", "BACKSPACE", "TAB", "NEWLINE", "VT",
    "PAGE", "RETURN", "SO", "SI", "DLE", "DC1", "DC2", "DC3", "DC4", "NAK", "SYN", "ETB", "CAN",
    "EM", "SUB", "ESC", "FS", "GS", "RS", "US",
];

/// Names accepted on input in addition to the control range.
const CHARACTER_ALIASES: [(&str, char); 6] = [
    ("SPACE", ' '),
    ("RUBOUT", '\x7f'),
    ("DEL", '\x7f'),
    ("LINEFEED", '\n'),
    ("NULL", '\0'),
    ("BELL", '\x07'),
];

/// Resolve a `#\Name` character name (case-insensitive).
pub fn character_from_name(name: &str) -> Option<char> {
    let upper = name.to_ascii_uppercase();
    if let Some(code) = CONTROL_CHARACTER_NAMES.iter().position(|n| *n == upper) {
        return char::from_u32(code as u32);
    }
    if let Some((_, c)) = CHARACTER_ALIASES.iter().find(|(n, _)| *n == upper) {
        return Some(*c);
    }
    let hex = upper
        .strip_prefix("U+")
        .or_else(|| upper.strip_prefix('U'))?;
    u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
}

/// Preferred name for a character the writer must not emit literally.
pub fn character_name(c: char) -> Option<&'static str> {
    match c {
        ' ' => Some("Space"),
        '\n' => Some("Newline"),
        '\t' => Some("Tab"),
        '\r' => Some("Return"),
        '\x0c' => Some("Page"),
        '\x08' => Some("Backspace"),
        '\x7f' => Some("Rubout"),
        c if (c as u32) < 32 => CONTROL_CHARACTER_NAMES.get(c as usize).copied(),
        _ => None,
    }
}

/// Characters that end a token.
fn is_terminating(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '"' | '\'' | ';' | '`' | ',' | '{' | '}')
}

/// UTF-8 character stream with two characters of lookahead.
///
/// Lookahead is only pulled from the underlying reader when the parser
/// needs it, so a caller blocked on a pipe never waits for bytes beyond
/// the end of the expression being read.
pub struct CharStream<R> {
    inner: R,
    lookahead: VecDeque<char>,
}

impl<R: BufRead> CharStream<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            lookahead: VecDeque::with_capacity(2),
        }
    }

    /// Peek at the next character without consuming it.
    pub fn peek(&mut self) -> Result<Option<char>> {
        self.fill(1)?;
        Ok(self.lookahead.front().copied())
    }

    /// Peek one character past [`peek`](Self::peek).
    pub fn peek_second(&mut self) -> Result<Option<char>> {
        self.fill(2)?;
        Ok(self.lookahead.get(1).copied())
    }

    /// Consume and return the next character.
    pub fn next_char(&mut self) -> Result<Option<char>> {
        match self.lookahead.pop_front() {
            Some(c) => Ok(Some(c)),
            None => self.decode(),
        }
    }

    fn fill(&mut self, wanted: usize) -> Result<()> {
        while self.lookahead.len() < wanted {
            match self.decode()? {
                Some(c) => self.lookahead.push_back(c),
                None => break,
            }
        }
        Ok(())
    }

    fn decode(&mut self) -> Result<Option<char>> {
        let first = loop {
            match self.inner.fill_buf() {
                Ok([]) => return Ok(None),
                Ok(buf) => break buf[0],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Channel(e)),
            }
        };
        self.inner.consume(1);

        let width = match first {
            0x00..=0x7f => return Ok(Some(char::from(first))),
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => return Err(SyntaxError::InvalidUtf8.into()),
        };
        let mut bytes = [first, 0, 0, 0];
        self.inner
            .read_exact(&mut bytes[1..width])
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => Error::Syntax(SyntaxError::InvalidUtf8),
                _ => Error::Channel(e),
            })?;
        std::str::from_utf8(&bytes[..width])
            .ok()
            .and_then(|s| s.chars().next())
            .map(Some)
            .ok_or(Error::Syntax(SyntaxError::InvalidUtf8))
    }
}

/// Parse a numeric token. Returns `None` for anything that is not a
/// number, so the caller can fall back to a symbol.
pub fn parse_number(token: &str) -> Option<Value> {
    parse_integer(token)
        .or_else(|| parse_ratio(token))
        .or_else(|| parse_float(token))
}

fn split_sign(token: &str) -> (&str, &str) {
    match token.as_bytes().first() {
        Some(b'+') | Some(b'-') => token.split_at(1),
        _ => ("", token),
    }
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// `[+-]?[0-9]+\.?`
fn parse_integer(token: &str) -> Option<Value> {
    let (sign, rest) = split_sign(token);
    let digits = rest.strip_suffix('.').unwrap_or(rest);
    if !all_digits(digits) {
        return None;
    }
    let n: BigInt = format!("{}{}", sign, digits).parse().ok()?;
    Some(Value::from_bigint(n))
}

/// `[+-]?[0-9]+/[0-9]+`
fn parse_ratio(token: &str) -> Option<Value> {
    let (sign, rest) = split_sign(token);
    let (num, den) = rest.split_once('/')?;
    if !all_digits(num) || !all_digits(den) {
        return None;
    }
    let numerator: BigInt = format!("{}{}", sign, num).parse().ok()?;
    let denominator: BigInt = den.parse().ok()?;
    if denominator.is_zero() {
        return None;
    }
    Some(Value::from_ratio(BigRational::new(numerator, denominator)))
}

/// `[+-]?digits[.digits][marker[+-]digits]` with at least one digit and
/// either a fractional part or an exponent marker.
fn parse_float(token: &str) -> Option<Value> {
    let (sign, rest) = split_sign(token);
    let marker_pos = rest.find(|c: char| "eEfFsSdDlL".contains(c));
    let (mantissa, marker, exponent) = match marker_pos {
        Some(pos) => {
            let marker = rest[pos..].chars().next()?;
            (&rest[..pos], Some(marker), &rest[pos + 1..])
        }
        None => (rest, None, ""),
    };

    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (mantissa, None),
    };
    let int_ok = int_part.is_empty() || all_digits(int_part);
    let frac_ok = frac_part.map_or(true, |f| f.is_empty() || all_digits(f));
    let has_digits = !int_part.is_empty() || frac_part.is_some_and(|f| !f.is_empty());
    if !int_ok || !frac_ok || !has_digits {
        return None;
    }
    if marker.is_none() && frac_part.map_or(true, str::is_empty) {
        return None;
    }
    if marker.is_some() {
        let (_, exp_digits) = split_sign(exponent);
        if !all_digits(exp_digits) {
            return None;
        }
    }

    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let frac_part = frac_part.filter(|f| !f.is_empty()).unwrap_or("0");
    let exponent = if marker.is_some() { exponent } else { "0" };
    let text = format!("{}{}.{}e{}", sign, int_part, frac_part, exponent);

    match marker {
        Some('d' | 'D' | 'l' | 'L') => text.parse::<f64>().ok().map(Value::Float),
        _ => text.parse::<f32>().ok().map(Value::SingleFloat),
    }
}

/// Read one expression from a string with a throwaway symbol table.
///
/// Bare symbols land in `COMMON-LISP-USER`. Foreign handles are decoded
/// but never patched.
pub fn read_from_str(text: &str) -> Result<Value> {
    let mut symbols = SymbolTable::new();
    let mut classes = ClassRegistry::default();
    let mut stream = CharStream::new(text.as_bytes());
    Reader::new(&mut symbols, &mut classes, COMMON_LISP_USER, SessionId(0)).read(&mut stream)
}

/// Reader state for one expression.
///
/// Borrows the session's intern table and class registry so decoded
/// symbols are canonical and foreign handles of unknown classes can be
/// queued for patching.
pub struct Reader<'a> {
    symbols: &'a mut SymbolTable,
    classes: &'a mut ClassRegistry,
    namespace: &'a str,
    session: SessionId,
    /// `#n=` labels; `None` while the labelled object is still being read.
    labels: HashMap<u64, Option<Value>>,
}

impl<'a> Reader<'a> {
    pub fn new(
        symbols: &'a mut SymbolTable,
        classes: &'a mut ClassRegistry,
        namespace: &'a str,
        session: SessionId,
    ) -> Self {
        Self {
            symbols,
            classes,
            namespace,
            session,
            labels: HashMap::new(),
        }
    }

    /// Read exactly one expression.
    ///
    /// End of input before the expression starts is a channel error (the
    /// remote process went away); end of input inside it is a syntax error.
    pub fn read<R: BufRead>(&mut self, stream: &mut CharStream<R>) -> Result<Value> {
        self.labels.clear();
        self.skip_whitespace(stream)?;
        if stream.peek()?.is_none() {
            return Err(Error::Channel(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "remote process closed its output",
            )));
        }
        self.read_expr(stream)
    }

    fn read_expr<R: BufRead>(&mut self, s: &mut CharStream<R>) -> Result<Value> {
        loop {
            self.skip_whitespace(s)?;
            let c = s.next_char()?.ok_or(SyntaxError::UnexpectedEof)?;
            match c {
                '(' => {
                    let (items, tail) = self.read_list_items(s, ')')?;
                    return Ok(Value::list_with_tail(items, tail));
                }
                ')' | '}' => return Err(SyntaxError::Unmatched(c).into()),
                '{' => return self.read_hash_table(s),
                '\'' => {
                    let quoted = self.read_expr(s)?;
                    return Ok(self.wrap(COMMON_LISP, "QUOTE", quoted));
                }
                '"' => return self.read_string(s),
                '#' => {
                    if let Some(value) = self.read_dispatch(s)? {
                        return Ok(value);
                    }
                }
                _ => return self.read_token(s, c),
            }
        }
    }

    /// Skip whitespace, `;` line comments and `#| |#` block comments.
    fn skip_whitespace<R: BufRead>(&mut self, s: &mut CharStream<R>) -> Result<()> {
        while let Some(c) = s.peek()? {
            if c.is_whitespace() {
                s.next_char()?;
            } else if c == ';' {
                while let Some(c) = s.next_char()? {
                    if c == '\n' {
                        break;
                    }
                }
            } else if c == '#' && s.peek_second()? == Some('|') {
                s.next_char()?;
                s.next_char()?;
                self.skip_block_comment(s)?;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn skip_block_comment<R: BufRead>(&mut self, s: &mut CharStream<R>) -> Result<()> {
        let mut depth = 1usize;
        while let Some(c) = s.next_char()? {
            match c {
                '#' if s.peek()? == Some('|') => {
                    s.next_char()?;
                    depth += 1;
                }
                '|' if s.peek()? == Some('#') => {
                    s.next_char()?;
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(SyntaxError::UnexpectedEof.into())
    }

    /// Read list elements up to `close`, returning the elements and the
    /// dotted tail (or `Nil`).
    fn read_list_items<R: BufRead>(
        &mut self,
        s: &mut CharStream<R>,
        close: char,
    ) -> Result<(Vec<Value>, Value)> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace(s)?;
            match s.peek()? {
                None => return Err(SyntaxError::UnexpectedEof.into()),
                Some(c) if c == close => {
                    s.next_char()?;
                    return Ok((items, Value::Nil));
                }
                Some('.') => {
                    s.next_char()?;
                    let after = s.peek()?.ok_or(SyntaxError::UnexpectedEof)?;
                    if !is_terminating(after) {
                        items.push(self.read_token(s, '.')?);
                        continue;
                    }
                    if items.is_empty() {
                        return Err(SyntaxError::MisplacedDot.into());
                    }
                    let tail = self.read_expr(s)?;
                    self.skip_whitespace(s)?;
                    return match s.next_char()? {
                        Some(c) if c == close => Ok((items, tail)),
                        Some(_) => Err(SyntaxError::MisplacedDot.into()),
                        None => Err(SyntaxError::UnexpectedEof.into()),
                    };
                }
                Some(_) => items.push(self.read_expr(s)?),
            }
        }
    }

    fn read_proper_items<R: BufRead>(
        &mut self,
        s: &mut CharStream<R>,
        close: char,
    ) -> Result<Vec<Value>> {
        let (items, tail) = self.read_list_items(s, close)?;
        if !tail.is_nil() {
            return Err(SyntaxError::MisplacedDot.into());
        }
        Ok(items)
    }

    fn read_hash_table<R: BufRead>(&mut self, s: &mut CharStream<R>) -> Result<Value> {
        let items = self.read_proper_items(s, '}')?;
        if items.len() % 2 != 0 {
            return Err(SyntaxError::OddHashTable.into());
        }
        let mut entries = Vec::with_capacity(items.len() / 2);
        let mut items = items.into_iter();
        while let (Some(key), Some(value)) = (items.next(), items.next()) {
            entries.push((key, value));
        }
        Ok(Value::HashTable(entries))
    }

    fn read_string<R: BufRead>(&mut self, s: &mut CharStream<R>) -> Result<Value> {
        let mut text = String::new();
        loop {
            match s.next_char()? {
                None => return Err(SyntaxError::UnexpectedEof.into()),
                Some('"') => return Ok(Value::String(text)),
                Some('\\') => {
                    let escaped = s.next_char()?.ok_or(SyntaxError::UnexpectedEof)?;
                    text.push(escaped);
                }
                Some(c) => text.push(c),
            }
        }
    }

    /// Handle `#` dispatch. Returns `None` for constructs that produce no
    /// value (block comments).
    fn read_dispatch<R: BufRead>(&mut self, s: &mut CharStream<R>) -> Result<Option<Value>> {
        let mut digits = String::new();
        let sub = loop {
            let c = s.next_char()?.ok_or(SyntaxError::UnexpectedEof)?;
            if c.is_ascii_digit() {
                digits.push(c);
            } else {
                break c;
            }
        };
        let arg = if digits.is_empty() {
            None
        } else {
            Some(
                digits
                    .parse::<u64>()
                    .map_err(|_| SyntaxError::InvalidToken(format!("#{}", digits)))?,
            )
        };

        let value = match sub.to_ascii_uppercase() {
            '\\' => self.read_character(s)?,
            '\'' => {
                let named = self.read_expr(s)?;
                self.wrap(COMMON_LISP, "FUNCTION", named)
            }
            '(' => Value::Vector(self.read_proper_items(s, ')')?),
            '?' => self.read_foreign(s, arg)?,
            'C' => self.read_complex(s)?,
            'M' => self.read_package(s)?,
            'A' => {
                let rank = arg.ok_or_else(|| SyntaxError::Malformed("array rank".into()))?;
                let contents = self.read_expr(s)?;
                array_from_contents(contents, rank)?
            }
            ':' => self.read_uninterned(s)?,
            '=' => {
                let label = arg.ok_or_else(|| SyntaxError::Malformed("label".into()))?;
                self.labels.insert(label, None);
                let value = self.read_expr(s)?;
                self.labels.insert(label, Some(value.clone()));
                value
            }
            '#' => {
                let label = arg.ok_or_else(|| SyntaxError::Malformed("label".into()))?;
                match self.labels.get(&label) {
                    Some(Some(value)) => value.clone(),
                    _ => return Err(SyntaxError::Label(label).into()),
                }
            }
            '|' => {
                self.skip_block_comment(s)?;
                return Ok(None);
            }
            other => return Err(SyntaxError::UnsupportedDispatch(other).into()),
        };
        Ok(Some(value))
    }

    fn read_character<R: BufRead>(&mut self, s: &mut CharStream<R>) -> Result<Value> {
        let first = s.next_char()?.ok_or(SyntaxError::UnexpectedEof)?;
        let mut name = String::from(first);
        while let Some(c) = s.peek()? {
            if c.is_alphanumeric() || matches!(c, '_' | '+' | '-') {
                name.push(c);
                s.next_char()?;
            } else {
                break;
            }
        }
        if name.chars().count() == 1 {
            return Ok(Value::Char(first));
        }
        character_from_name(&name)
            .map(Value::Char)
            .ok_or_else(|| SyntaxError::InvalidCharacterName(name).into())
    }

    /// `#n?CLASS` - a handle to a remote object.
    fn read_foreign<R: BufRead>(
        &mut self,
        s: &mut CharStream<R>,
        handle: Option<u64>,
    ) -> Result<Value> {
        let handle =
            handle.ok_or_else(|| SyntaxError::Malformed("foreign reference without handle".into()))?;
        let class = match self.read_expr(s)? {
            Value::Symbol(sym) => sym,
            Value::Nil => self.symbols.common_lisp("NIL"),
            Value::Bool(true) => self.symbols.common_lisp("T"),
            _ => return Err(SyntaxError::Malformed("foreign object class".into()).into()),
        };

        let obj = match self.classes.lookup(&class) {
            Some(proxy) => ForeignObject::with_proxy(self.session, handle, class, proxy),
            None => {
                trace!("Deferring foreign object #{} of unknown class {}", handle, class);
                let obj = ForeignObject::new(self.session, handle, class);
                self.classes.defer(obj.clone());
                obj
            }
        };
        Ok(Value::Foreign(obj))
    }

    fn read_complex<R: BufRead>(&mut self, s: &mut CharStream<R>) -> Result<Value> {
        let parts = self
            .read_expr(s)?
            .to_vec()
            .filter(|parts| parts.len() == 2)
            .ok_or_else(|| SyntaxError::Malformed("complex number".into()))?;
        let mut parts = parts.into_iter();
        match (parts.next(), parts.next()) {
            (Some(re), Some(im)) => Ok(Value::Complex(Box::new(re), Box::new(im))),
            _ => Err(SyntaxError::Malformed("complex number".into()).into()),
        }
    }

    /// `#M(name . ((symbol . function) ...))`
    fn read_package<R: BufRead>(&mut self, s: &mut CharStream<R>) -> Result<Value> {
        let data = self.read_expr(s)?;
        let pair = data
            .as_pair()
            .ok_or_else(|| SyntaxError::Malformed("package".into()))?;
        let name = match &pair.head {
            Value::String(name) => name.clone(),
            Value::Symbol(sym) => sym.name().to_string(),
            _ => return Err(SyntaxError::Malformed("package name".into()).into()),
        };
        let mut functions = Vec::new();
        for entry in pair.tail.iter() {
            let entry = entry
                .as_pair()
                .ok_or_else(|| SyntaxError::Malformed("package function entry".into()))?;
            let symbol = entry
                .head
                .as_symbol()
                .cloned()
                .ok_or_else(|| SyntaxError::Malformed("package function name".into()))?;
            functions.push((symbol, entry.tail.clone()));
        }
        Ok(Value::Package(Package { name, functions }))
    }

    /// `#:NAME` - treated as a symbol of the current namespace.
    fn read_uninterned<R: BufRead>(&mut self, s: &mut CharStream<R>) -> Result<Value> {
        let first = s.next_char()?.ok_or(SyntaxError::UnexpectedEof)?;
        let (chars, _) = self.read_token_chars(s, first)?;
        let name: String = chars.into_iter().map(|(c, _)| c).collect();
        if name.is_empty() {
            return Err(SyntaxError::InvalidToken("#:".into()).into());
        }
        Ok(Value::Symbol(self.symbols.intern(&name, Some(self.namespace))))
    }

    /// Collect token characters, flagging those that were escaped.
    ///
    /// Also returns the offsets into the character list at which an escape
    /// appeared, so an empty `||` still marks the part it was written in.
    fn read_token_chars<R: BufRead>(
        &mut self,
        s: &mut CharStream<R>,
        first: char,
    ) -> Result<(Vec<(char, bool)>, Vec<usize>)> {
        let mut chars = Vec::new();
        let mut escapes = Vec::new();
        let mut multi_escape = false;
        let mut pending = Some(first);

        loop {
            let c = match pending.take() {
                Some(c) => c,
                None => match s.peek()? {
                    None if multi_escape => return Err(SyntaxError::UnexpectedEof.into()),
                    None => break,
                    Some(c) if !multi_escape && is_terminating(c) => break,
                    Some(c) => {
                        s.next_char()?;
                        c
                    }
                },
            };
            match c {
                '\\' => {
                    let escaped = s.next_char()?.ok_or(SyntaxError::UnexpectedEof)?;
                    escapes.push(chars.len());
                    chars.push((escaped, true));
                }
                '|' => {
                    multi_escape = !multi_escape;
                    escapes.push(chars.len());
                }
                c if multi_escape => chars.push((c, true)),
                c => chars.extend(c.to_uppercase().map(|u| (u, false))),
            }
        }
        Ok((chars, escapes))
    }

    fn read_token<R: BufRead>(&mut self, s: &mut CharStream<R>, first: char) -> Result<Value> {
        let (chars, escapes) = self.read_token_chars(s, first)?;
        let text: String = chars.iter().map(|(c, _)| *c).collect();

        if escapes.is_empty() {
            if !text.is_empty() && text.chars().all(|c| c == '.') {
                return Err(SyntaxError::MisplacedDot.into());
            }
            if let Some(number) = parse_number(&text) {
                return Ok(number);
            }
        }
        self.parse_symbol(&chars, &escapes)
    }

    /// Split on the first unescaped colon and intern the result.
    fn parse_symbol(&mut self, chars: &[(char, bool)], escapes: &[usize]) -> Result<Value> {
        let colon = chars.iter().position(|&(c, esc)| c == ':' && !esc);
        let collect = |part: &[(char, bool)]| part.iter().map(|(c, _)| *c).collect::<String>();

        let Some(pos) = colon else {
            let name = collect(chars);
            if escapes.is_empty() {
                match name.as_str() {
                    "NIL" => return Ok(Value::Nil),
                    "T" => return Ok(Value::Bool(true)),
                    _ => {}
                }
            }
            return Ok(Value::Symbol(self.symbols.intern(&name, Some(self.namespace))));
        };

        let namespace = collect(&chars[..pos]);
        let mut start = pos + 1;
        if let Some(&(':', false)) = chars.get(start) {
            start += 1;
        }
        let name = collect(&chars[start..]);
        let name_escaped = escapes.iter().any(|&at| at >= start);
        if name.is_empty() && !name_escaped {
            return Err(SyntaxError::InvalidToken(collect(chars)).into());
        }

        if pos == 0 {
            return Ok(Value::Symbol(self.symbols.keyword(&name)));
        }
        if namespace == "CL" || namespace == COMMON_LISP {
            match name.as_str() {
                "NIL" => return Ok(Value::Nil),
                "T" => return Ok(Value::Bool(true)),
                _ => {}
            }
        }
        Ok(Value::Symbol(self.symbols.intern(&name, Some(&namespace))))
    }

    fn wrap(&mut self, namespace: &str, operator: &str, value: Value) -> Value {
        let operator: Symbol = self.symbols.intern(operator, Some(namespace));
        Value::list([Value::Symbol(operator), value])
    }
}

/// Turn `#nA` contents into nested vectors of depth `rank`.
fn array_from_contents(contents: Value, rank: u64) -> Result<Value> {
    if rank == 0 {
        return Ok(contents);
    }
    let items = match contents {
        Value::Vector(items) => items,
        Value::String(text) if rank == 1 => text.chars().map(Value::Char).collect(),
        other => other
            .to_vec()
            .ok_or_else(|| SyntaxError::Malformed("array contents".into()))?,
    };
    items
        .into_iter()
        .map(|item| array_from_contents(item, rank - 1))
        .collect::<Result<Vec<_>>>()
        .map(Value::Vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn read(text: &str) -> Value {
        read_from_str(text).unwrap_or_else(|e| panic!("failed to read {:?}: {}", text, e))
    }

    fn read_err(text: &str) -> Error {
        match read_from_str(text) {
            Ok(v) => panic!("expected error for {:?}, got {:?}", text, v),
            Err(e) => e,
        }
    }

    fn sym(name: &str, ns: &str) -> Value {
        Value::Symbol(Symbol::new(name, Some(ns)))
    }

    #[test]
    fn test_read_integers_and_ratios() {
        assert_eq!(read("42"), Value::Integer(42));
        assert_eq!(read("-7"), Value::Integer(-7));
        assert_eq!(read("+3"), Value::Integer(3));
        assert_eq!(read("10."), Value::Integer(10));
        assert!(matches!(read("123456789012345678901234567890"), Value::BigInteger(_)));
        assert_eq!(
            read("-1/2"),
            Value::Ratio(BigRational::new(BigInt::from(-1), BigInt::from(2)))
        );
        assert_eq!(read("4/2"), Value::Integer(2));
    }

    #[test]
    fn test_read_floats_by_exponent_marker() {
        assert_eq!(read("1.5"), Value::SingleFloat(1.5));
        assert_eq!(read("1.5e2"), Value::SingleFloat(150.0));
        assert_eq!(read("2.5d0"), Value::Float(2.5));
        assert_eq!(read("1D-1"), Value::Float(0.1));
        assert_eq!(read("-.5"), Value::SingleFloat(-0.5));
        assert_eq!(read("3L2"), Value::Float(300.0));
    }

    #[test]
    fn test_number_like_symbols() {
        assert_eq!(read("1+"), sym("1+", COMMON_LISP_USER));
        assert_eq!(read("E5"), sym("E5", COMMON_LISP_USER));
        assert_eq!(read("DEFINE"), sym("DEFINE", COMMON_LISP_USER));
    }

    #[test]
    fn test_read_symbols_upcases_and_splits_namespace() {
        assert_eq!(read("car"), sym("CAR", COMMON_LISP_USER));
        assert_eq!(read("CL:CAR"), sym("CAR", "CL"));
        assert_eq!(read("my-pkg::thing"), sym("THING", "MY-PKG"));
        assert_eq!(read(":test"), Value::Symbol(Symbol::keyword("TEST")));
    }

    #[test]
    fn test_escapes_preserve_case_and_colons() {
        assert_eq!(read("|hello World|"), sym("hello World", COMMON_LISP_USER));
        assert_eq!(read("ab\\c"), sym("ABc", COMMON_LISP_USER));
        assert_eq!(read("|a:b|"), sym("a:b", COMMON_LISP_USER));
        assert_eq!(read("|PKG|::|x|"), sym("x", "PKG"));
        assert_eq!(read("|NIL|"), sym("NIL", COMMON_LISP_USER));
        assert_eq!(read("|12|"), sym("12", COMMON_LISP_USER));
    }

    #[test]
    fn test_booleans_and_nil() {
        assert_eq!(read("NIL"), Value::Nil);
        assert_eq!(read("()"), Value::Nil);
        assert_eq!(read("( )"), Value::Nil);
        assert_eq!(read("T"), Value::Bool(true));
        assert_eq!(read("COMMON-LISP:T"), Value::Bool(true));
        assert_eq!(read("CL:NIL"), Value::Nil);
    }

    #[test]
    fn test_read_lists_and_dotted_pairs() {
        assert_eq!(read("(1 2 3)"), Value::list([1i64, 2, 3]));
        assert_eq!(
            read("(1 . 2)"),
            Value::cons(Value::Integer(1), Value::Integer(2))
        );
        assert_eq!(
            read("(1 2 . (3))"),
            Value::list([1i64, 2, 3])
        );
        assert_eq!(
            read("(a (b) c)"),
            Value::list([
                sym("A", COMMON_LISP_USER),
                Value::list([sym("B", COMMON_LISP_USER)]),
                sym("C", COMMON_LISP_USER),
            ])
        );
        assert_eq!(read("(.5)"), Value::list([Value::SingleFloat(0.5)]));
    }

    #[test]
    fn test_read_strings_with_escapes() {
        assert_eq!(read(r#""hello""#), Value::String("hello".into()));
        assert_eq!(read(r#""say \"hi\"""#), Value::String("say \"hi\"".into()));
        assert_eq!(read(r#""back\\slash""#), Value::String("back\\slash".into()));
        assert_eq!(read("\"line\nbreak\""), Value::String("line\nbreak".into()));
    }

    #[test]
    fn test_read_characters() {
        assert_eq!(read("#\\a"), Value::Char('a'));
        assert_eq!(read("#\\Space"), Value::Char(' '));
        assert_eq!(read("#\\newline"), Value::Char('\n'));
        assert_eq!(read("#\\("), Value::Char('('));
        assert_eq!(read("#\\U+41"), Value::Char('A'));
        assert_eq!(read("(#\\a #\\b)"), Value::list([Value::Char('a'), Value::Char('b')]));
        assert!(matches!(
            read_err("#\\Bogus"),
            Error::Syntax(SyntaxError::InvalidCharacterName(_))
        ));
    }

    #[test]
    fn test_read_non_ascii_characters() {
        assert_eq!(read("#\\λ"), Value::Char('λ'));
        assert_eq!(read("#\\€"), Value::Char('€'));
        assert_eq!(
            read("(#\\λ #\\U+00A0)"),
            Value::list([Value::Char('λ'), Value::Char('\u{a0}')])
        );
        // Hyphenated names are read whole rather than split at the hyphen.
        assert!(matches!(
            read_err("#\\No-break_space"),
            Error::Syntax(SyntaxError::InvalidCharacterName(name)) if name == "No-break_space"
        ));
    }

    #[test]
    fn test_empty_escaped_symbol_names() {
        assert_eq!(read("||"), sym("", "COMMON-LISP-USER"));
        assert_eq!(read("COMMON-LISP-USER::||"), sym("", "COMMON-LISP-USER"));
        assert_eq!(read(":||"), Value::Symbol(Symbol::keyword("")));
        assert!(matches!(
            read_err("FOO::"),
            Error::Syntax(SyntaxError::InvalidToken(_))
        ));
        assert!(matches!(read_err(":"), Error::Syntax(SyntaxError::InvalidToken(_))));
    }

    #[test]
    fn test_read_quote_and_function() {
        assert_eq!(
            read("'x"),
            Value::list([sym("QUOTE", COMMON_LISP), sym("X", COMMON_LISP_USER)])
        );
        assert_eq!(
            read("#'car"),
            Value::list([sym("FUNCTION", COMMON_LISP), sym("CAR", COMMON_LISP_USER)])
        );
    }

    #[test]
    fn test_read_vectors_hash_tables_and_complex() {
        assert_eq!(
            read("#(1 \"a\")"),
            Value::Vector(vec![Value::Integer(1), Value::String("a".into())])
        );
        assert_eq!(read("#()"), Value::Vector(vec![]));
        assert_eq!(
            read("{\"flag\" T \"n\" 2}"),
            Value::HashTable(vec![
                (Value::String("flag".into()), Value::Bool(true)),
                (Value::String("n".into()), Value::Integer(2)),
            ])
        );
        assert!(matches!(
            read_err("{1 2 3}"),
            Error::Syntax(SyntaxError::OddHashTable)
        ));
        assert_eq!(
            read("#C(1 2)"),
            Value::Complex(Box::new(Value::Integer(1)), Box::new(Value::Integer(2)))
        );
    }

    #[test]
    fn test_read_arrays() {
        assert_eq!(
            read("#2A((1 2) (3 4))"),
            Value::Vector(vec![
                Value::Vector(vec![Value::Integer(1), Value::Integer(2)]),
                Value::Vector(vec![Value::Integer(3), Value::Integer(4)]),
            ])
        );
        assert_eq!(read("#0A 5"), Value::Integer(5));
    }

    #[test]
    fn test_read_package() {
        let value = read("#M(\"COMMON-LISP\" (COMMON-LISP:CAR . 1) (COMMON-LISP:CDR . 2))");
        let Value::Package(pkg) = value else {
            panic!("expected package");
        };
        assert_eq!(pkg.name, "COMMON-LISP");
        assert_eq!(pkg.function("car"), Some(&Value::Integer(1)));
        assert_eq!(pkg.function_names(), vec!["car".to_string(), "cdr".to_string()]);
    }

    #[test]
    fn test_labels_share_but_reject_cycles() {
        assert_eq!(
            read("(#1=(a) #1#)"),
            Value::list([
                Value::list([sym("A", COMMON_LISP_USER)]),
                Value::list([sym("A", COMMON_LISP_USER)]),
            ])
        );
        assert!(matches!(
            read_err("#1=(a . #1#)"),
            Error::Syntax(SyntaxError::Label(1))
        ));
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(read("; comment\n 5"), Value::Integer(5));
        assert_eq!(read("#| block #| nested |# |# 6"), Value::Integer(6));
        assert_eq!(read("(1 ; one\n 2)"), Value::list([1i64, 2]));
        assert_eq!(read("(1 #| gap |# 2)"), Value::list([1i64, 2]));
    }

    #[test]
    fn test_uninterned_symbol() {
        assert_eq!(read("#:gensym1"), sym("GENSYM1", COMMON_LISP_USER));
    }

    #[test]
    fn test_foreign_object_is_deferred_until_class_known() {
        let mut symbols = SymbolTable::new();
        let mut classes = ClassRegistry::default();
        let mut stream = CharStream::new("#5?CL-USER::POINT #6?CL-USER::POINT".as_bytes());
        let mut reader = Reader::new(&mut symbols, &mut classes, COMMON_LISP_USER, SessionId(9));
        let first = reader.read(&mut stream).unwrap_or(Value::Nil);
        let second = reader.read(&mut stream).unwrap_or(Value::Nil);

        let first = first.as_foreign().cloned();
        let second = second.as_foreign().cloned();
        assert_eq!(first.as_ref().map(ForeignObject::handle), Some(5));
        assert_eq!(second.as_ref().map(ForeignObject::handle), Some(6));
        assert_eq!(first.as_ref().map(|o| o.session()), Some(SessionId(9)));
        assert!(first.is_some_and(|o| !o.is_patched()));
        assert_eq!(classes.pending_count(), 2);
    }

    #[test]
    fn test_errors_for_malformed_input() {
        assert!(matches!(read_err("(1 2"), Error::Syntax(SyntaxError::UnexpectedEof)));
        assert!(matches!(read_err("\"open"), Error::Syntax(SyntaxError::UnexpectedEof)));
        assert!(matches!(read_err(")"), Error::Syntax(SyntaxError::Unmatched(')'))));
        assert!(matches!(read_err("( . 1)"), Error::Syntax(SyntaxError::MisplacedDot)));
        assert!(matches!(read_err("(1 . 2 3)"), Error::Syntax(SyntaxError::MisplacedDot)));
        assert!(matches!(read_err("|open"), Error::Syntax(SyntaxError::UnexpectedEof)));
        assert!(matches!(
            read_err("#N\"array.npy\""),
            Error::Syntax(SyntaxError::UnsupportedDispatch('N'))
        ));
    }

    #[test]
    fn test_eof_before_expression_is_channel_error() {
        assert!(matches!(read_err(""), Error::Channel(_)));
        assert!(matches!(read_err("   \n"), Error::Channel(_)));
    }

    #[test]
    fn test_consecutive_reads_consume_one_expression_each() {
        let mut symbols = SymbolTable::new();
        let mut classes = ClassRegistry::default();
        let mut stream = CharStream::new("\"CL-USER\"\n(1 2)\nNIL\n\"out\"\n".as_bytes());
        let mut reader = Reader::new(&mut symbols, &mut classes, COMMON_LISP_USER, SessionId(0));
        let parts: Vec<Value> = (0..4).filter_map(|_| reader.read(&mut stream).ok()).collect();
        assert_eq!(
            parts,
            vec![
                Value::String("CL-USER".into()),
                Value::list([1i64, 2]),
                Value::Nil,
                Value::String("out".into()),
            ]
        );
    }

    #[test]
    fn test_repeated_symbols_are_interned() {
        let mut symbols = SymbolTable::new();
        let mut classes = ClassRegistry::default();
        let mut stream = CharStream::new("(foo foo)".as_bytes());
        let value = Reader::new(&mut symbols, &mut classes, COMMON_LISP_USER, SessionId(0))
            .read(&mut stream)
            .unwrap_or(Value::Nil);
        let items: Vec<&Symbol> = value.iter().filter_map(Value::as_symbol).collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].ptr_eq(items[1]));
        assert_eq!(symbols.len(), 1);
    }

    #[test]
    fn test_multibyte_utf8() {
        assert_eq!(read("\"héllo ✓\""), Value::String("héllo ✓".into()));
        assert_eq!(read("#\\é"), Value::Char('é'));
        let bad: &[u8] = &[b'"', 0xff, b'"'];
        let mut symbols = SymbolTable::new();
        let mut classes = ClassRegistry::default();
        let mut stream = CharStream::new(bad);
        let result = Reader::new(&mut symbols, &mut classes, COMMON_LISP_USER, SessionId(0))
            .read(&mut stream);
        assert!(matches!(result, Err(Error::Syntax(SyntaxError::InvalidUtf8))));
    }
}
