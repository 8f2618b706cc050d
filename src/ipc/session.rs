//! A long-running remote interpreter session.

use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bridge::{ClassRegistry, Evaluator, ProxyClass, ProxyId, RemoteFunction};
use crate::config::SessionConfig;
use crate::error::{Error, Result, SyntaxError};
use crate::ipc::framing::{self, ReadContext, Response};
use crate::reader::CharStream;
use crate::symbol::{Symbol, SymbolTable, BRIDGE_NAMESPACE, COMMON_LISP_USER};
use crate::value::{ForeignObject, Returned, SessionId, Value};
use crate::writer::Writer;

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process spawned; startup requests (Quicklisp, the configured
    /// namespace) are still being sent.
    Created,
    /// Idle and accepting requests.
    Ready,
    /// A request was written and its response is being read.
    AwaitingResponse,
    /// Shut down; every operation fails with [`Error::Closed`].
    Closed,
}

/// Connection to one remote interpreter.
///
/// Requests are strictly sequential: each call writes one expression and
/// blocks until the matching four-part response has been read. A session
/// is `Send` but not `Sync`; callers that share one across threads wrap it
/// in a mutex.
pub struct Session {
    id: SessionId,
    state: SessionState,
    config: SessionConfig,
    child: Option<Child>,
    input: Box<dyn Write + Send>,
    output: CharStream<Box<dyn BufRead + Send>>,
    printed: Box<dyn Write + Send>,
    namespace: String,
    symbols: SymbolTable,
    classes: ClassRegistry,
}

impl Session {
    /// Spawn the configured interpreter with the bootstrap script.
    ///
    /// Loads Quicklisp when `config.quicklisp` is set, then switches to
    /// `config.namespace` if it differs from the one the bootstrap starts in.
    pub fn start(config: SessionConfig) -> Result<Self> {
        let (program, args) = config.command.split_first().ok_or_else(|| {
            Error::Spawn(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty interpreter command",
            ))
        })?;
        let bootstrap = config.bootstrap_path().map_err(Error::Spawn)?;
        info!("Starting Lisp process: {} {:?}", program, args);

        let mut child = Command::new(program)
            .args(args)
            .arg(&bootstrap)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(Error::Spawn)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Spawn(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "failed to get stdio handles for Lisp process",
            )));
        };

        // The session owns the child from here on; if a startup request
        // fails, Drop shuts the process down.
        let mut session = Session::assemble(
            config,
            COMMON_LISP_USER.to_string(),
            Box::new(stdin),
            Box::new(BufReader::new(stdout)),
            Some(child),
        );
        session.initialize()?;
        Ok(session)
    }

    /// Attach to an already running interpreter through arbitrary streams.
    ///
    /// `reader` carries responses, `writer` carries requests. Nothing is
    /// sent up front: the interpreter is assumed to be in
    /// `config.namespace` already, and Quicklisp is not loaded.
    pub fn from_streams<R, W>(config: SessionConfig, reader: R, writer: W) -> Self
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        let namespace = config.namespace.clone();
        let mut session =
            Session::assemble(config, namespace, Box::new(writer), Box::new(reader), None);
        session.mark_ready();
        session
    }

    fn assemble(
        config: SessionConfig,
        namespace: String,
        input: Box<dyn Write + Send>,
        output: Box<dyn BufRead + Send>,
        child: Option<Child>,
    ) -> Self {
        Session {
            id: SessionId::next(),
            state: SessionState::Created,
            config,
            child,
            input,
            output: CharStream::new(output),
            printed: Box::new(io::stdout()),
            namespace,
            symbols: SymbolTable::new(),
            classes: ClassRegistry::new(),
        }
    }

    /// Send the startup requests of a freshly spawned interpreter.
    fn initialize(&mut self) -> Result<()> {
        if self.config.quicklisp {
            self.load_quicklisp()?;
        }
        if self.namespace != self.config.namespace {
            let wanted = self.config.namespace.clone();
            info!("Entering namespace {}", wanted);
            let operator = self.symbols.common_lisp("IN-PACKAGE");
            self.eval(&Value::call_form(operator, [Value::from(wanted)]))?;
        }
        self.mark_ready();
        Ok(())
    }

    fn mark_ready(&mut self) {
        self.state = SessionState::Ready;
        debug!("Session {} ready in {}", self.id.0, self.namespace);
    }

    /// Send printed remote output somewhere other than stdout.
    pub fn with_output<W: Write + Send + 'static>(mut self, sink: W) -> Self {
        self.printed = Box::new(sink);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Remote namespace as of the last response.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// OS process id of the child, for callers that need to signal it.
    pub fn process_id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    /// Proxy class attached to a foreign object, once discovered.
    pub fn proxy_class(&self, object: &ForeignObject) -> Option<&ProxyClass> {
        self.classes.proxy_for(object)
    }

    /// Intern a designator such as `cl:car`, `:test` or `my-function`.
    /// Unqualified names resolve in the current namespace.
    pub fn symbol(&mut self, designator: &str) -> Symbol {
        self.symbols.designator(designator, &self.namespace)
    }

    /// Evaluate `expr` remotely.
    ///
    /// Printed output is forwarded to the output sink before any remote
    /// condition is returned. Syntax and channel errors close the session.
    pub fn eval(&mut self, expr: &Value) -> Result<Returned> {
        if !matches!(self.state, SessionState::Ready | SessionState::Created) {
            return Err(Error::Closed);
        }
        let request = Writer::for_session(self.id).write(expr)?;
        if self.config.debug {
            info!("eval: {}", request);
        } else {
            debug!("eval: {}", request);
        }

        let response = match self.round_trip(&request) {
            Ok(response) => response,
            Err(err) => {
                if err.is_fatal() {
                    warn!("Closing session {} after protocol failure: {}", self.id.0, err);
                    self.close();
                }
                return Err(err);
            }
        };

        self.emit_output(&response.output);
        if let Some(condition) = response.condition {
            debug!("Remote condition: {}", condition);
            return Err(Error::Remote(condition));
        }
        self.resolve_pending_classes()?;

        let returned = Returned::from_values(response.values);
        if self.config.debug {
            info!("result: {:?}", returned);
        }
        Ok(returned)
    }

    fn round_trip(&mut self, request: &str) -> Result<Response> {
        let idle = self.state;
        self.state = SessionState::AwaitingResponse;
        framing::write_request(self.input.as_mut(), request)?;
        let mut ctx = ReadContext {
            symbols: &mut self.symbols,
            classes: &mut self.classes,
            namespace: &mut self.namespace,
            session: self.id,
        };
        let response = framing::read_response(&mut self.output, &mut ctx)?;
        self.state = idle;
        Ok(response)
    }

    fn emit_output(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Err(e) = self
            .printed
            .write_all(text.as_bytes())
            .and_then(|_| self.printed.flush())
        {
            warn!("Failed to forward remote output: {}", e);
        }
    }

    /// Patch every queued foreign object, discovering classes as needed.
    ///
    /// Discovery evaluates further requests, whose responses may queue more
    /// objects, so this loops until nothing resolvable is left.
    fn resolve_pending_classes(&mut self) -> Result<()> {
        loop {
            let mut ready = self.classes.take_ready().into_iter();
            if ready.len() == 0 {
                return Ok(());
            }
            while let Some((class, instances)) = ready.next() {
                let proxy = match self.classes.lookup(&class) {
                    Some(id) => id,
                    None => match self.discover_class(&class) {
                        Ok(id) => id,
                        Err(err) => {
                            for (rest, waiting) in ready.rev() {
                                self.classes.requeue(rest, waiting);
                            }
                            self.classes.requeue(class, instances);
                            return Err(err);
                        }
                    },
                };
                debug!("Patching {} instance(s) of {}", instances.len(), class);
                for object in &instances {
                    object.patch(proxy);
                }
            }
        }
    }

    fn discover_class(&mut self, class: &Symbol) -> Result<ProxyId> {
        self.classes.begin_discovery(class);
        let result = self.fetch_class(class);
        self.classes.end_discovery(class);
        let proxy = result?;
        info!(
            "Adding member functions {:?} to class {}",
            proxy.member_names(),
            class
        );
        Ok(self.classes.register(proxy))
    }

    fn fetch_class(&mut self, class: &Symbol) -> Result<ProxyClass> {
        let operator = self.symbols.intern("CLASS-INFORMATION", Some(BRIDGE_NAMESPACE));
        let form = Value::call_form(operator, [Value::Symbol(class.clone()).quoted()]);
        let alist = self.eval(&form)?.into_one().unwrap_or(Value::Nil);
        Ok(ProxyClass::from_alist(class.clone(), &alist)?)
    }

    /// Apply a remote function to arguments.
    ///
    /// Symbol and list arguments are quoted so they arrive as data.
    pub fn funcall(&mut self, function: &Value, args: &[Value]) -> Result<Returned> {
        let operator = self.symbols.common_lisp("FUNCALL");
        let form = Value::call_form(
            operator,
            std::iter::once(function.clone().quoted()).chain(args.iter().cloned().map(Value::quoted)),
        );
        self.eval(&form)
    }

    /// Call a remote function by designator, e.g. `call("cl:list", ...)`.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Returned> {
        let operator = self.symbol(name);
        let form = Value::call_form(operator, args.iter().cloned().map(Value::quoted));
        self.eval(&form)
    }

    /// Obtain the function object named by `name`.
    pub fn function(&mut self, name: &str) -> Result<RemoteFunction> {
        let symbol = self.symbol(name);
        let operator = self.symbols.common_lisp("FUNCTION");
        let form = Value::call_form(operator, [Value::Symbol(symbol.clone())]);
        let function = self
            .eval(&form)?
            .into_one()
            .ok_or_else(|| SyntaxError::Malformed(format!("function value for {}", symbol)))?;
        Ok(RemoteFunction::new(symbol, function))
    }

    /// Look up a remote package by name. Returns a [`Value::Package`]
    /// snapshot, or `Nil` when no such package exists.
    pub fn find_package(&mut self, name: &str) -> Result<Returned> {
        self.call("cl:find-package", &[Value::from(name)])
    }

    /// Call a member of a foreign object's proxy class.
    pub fn call_member(
        &mut self,
        object: &ForeignObject,
        member: &str,
        args: &[Value],
    ) -> Result<Returned> {
        if object.session() != self.id {
            return Err(crate::error::EncodingError::ForeignSession {
                handle: object.handle(),
            }
            .into());
        }
        let callable = self.classes.member_of(object, member)?.callable.clone();
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(Value::Foreign(object.clone()));
        all.extend_from_slice(args);
        self.funcall(&callable, &all)
    }

    fn load_quicklisp(&mut self) -> Result<()> {
        match SessionConfig::quicklisp_setup().filter(|path| path.is_file()) {
            Some(setup) => {
                info!("Loading Quicklisp from {}", setup.display());
                let path = setup.to_string_lossy().into_owned();
                self.call("cl:load", &[Value::from(path)])?;
            }
            None => warn!("Quicklisp requested but no setup file found; skipping"),
        }
        Ok(())
    }

    /// Shut the session down. Safe to call more than once.
    ///
    /// Sends the quit request, waits briefly for the process to exit and
    /// kills it otherwise. Failures are logged, never returned.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        info!("Shutting down Lisp session {}", self.id.0);

        let quit = Value::call_form(
            self.symbols.intern("QUIT", Some(BRIDGE_NAMESPACE)),
            std::iter::empty(),
        );
        let sent = Writer::for_session(self.id)
            .write(&quit)
            .map_err(Error::from)
            .and_then(|request| framing::write_request(self.input.as_mut(), &request));
        if let Err(e) = sent {
            debug!("Quit request not delivered: {}", e);
        }

        let Some(mut child) = self.child.take() else {
            return;
        };
        // Use try_wait in a loop with short timeout to avoid blocking forever
        for _ in 0..10 {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Lisp process exited: {}", status);
                    return;
                }
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(e) => {
                    warn!("Error waiting for Lisp process: {}", e);
                    return;
                }
            }
        }
        warn!("Lisp process didn't exit gracefully, killing");
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Evaluator for Session {
    fn eval(&mut self, expr: &Value) -> Result<Returned> {
        Session::eval(self, expr)
    }

    fn funcall(&mut self, function: &Value, args: &[Value]) -> Result<Returned> {
        Session::funcall(self, function, args)
    }

    fn call_member(
        &mut self,
        object: &ForeignObject,
        member: &str,
        args: &[Value],
    ) -> Result<Returned> {
        Session::call_member(self, object, member, args)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("namespace", &self.namespace)
            .field("classes", &self.classes.len())
            .finish()
    }
}
