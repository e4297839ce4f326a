// Copyright 2020 Joyent, Inc.

//! The daemon: a blocking accept loop handing each connection to its own
//! dispatch thread.
//!
//! Dispatch reads request lines, resolves them through the shared
//! `CommandRegistry` under the session's namespace and writes one framed
//! response per request. Every accepted socket carries a read timeout of
//! `POLLINTERVAL` so a dispatch thread notices `shutdown` even while its
//! client is silent.
//!
//! A daemon may also run one master thread and any number of worker
//! threads next to the accept loop. They talk to each other through
//! `Mailbox`es, which are published in the shared pointer store under
//! `MASTER.MAILBOX` and `WORKER.<i>.MAILBOX`.

use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use num_traits::ToPrimitive;
use parking_lot::{Mutex, RwLock};
use slog::{debug, error, info, o, trace, warn, Logger};

use crate::app::{Application, Session, KEY_HOST, KEY_PORT};
use crate::backoff::Backoff;
use crate::commands;
use crate::error::{FanError, ProtocolError, Result};
use crate::mailbox::Mailbox;
use crate::protocol::{
    self, LineReader, Param, PushAck, Request, CMD_BINARYPUSH, KEY_RETURN, KEY_RETURNMSG,
};
use crate::registry::{Call, CommandRegistry, ProtocolCommand};
use crate::store::{KeyValueStore, Pointer};
use crate::template::TypeTemplate;

pub const NOT_UNDERSTOOD: &str = "Command not understood";
pub const ACCESS_DENIED: &str = "Access denied";

pub const MASTER_MAILBOX: &str = "MASTER.MAILBOX";

const MAX_ACCEPT_FAILURES: u32 = 64;
const SHUTDOWN_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

pub fn worker_mailbox_key(index: usize) -> String {
    format!("WORKER.{}.MAILBOX", index)
}

pub type CleanupFn = dyn Fn(&Session) + Send + Sync;

/// State shared by the accept loop, every dispatch thread and every
/// command handler.
pub struct ServerState {
    app: Arc<Application>,
    registry: Arc<CommandRegistry>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    started: DateTime<Utc>,
    clock: Instant,
    active: AtomicUsize,
    total: AtomicU64,
    next_id: AtomicU64,
    pointers: KeyValueStore,
    cleanup: RwLock<Option<Arc<CleanupFn>>>,
    log: Logger,
}

impl ServerState {
    fn new(app: Arc<Application>, registry: Arc<CommandRegistry>) -> ServerState {
        let log = app.logger().new(o!("component" => "daemon"));
        ServerState {
            pointers: KeyValueStore::with_logger(Some(&log)),
            app,
            registry,
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            started: Utc::now(),
            clock: Instant::now(),
            active: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            cleanup: RwLock::new(None),
            log,
        }
    }

    pub fn app(&self) -> &Application {
        &self.app
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// The pointer namespace handed to master and worker threads.
    pub fn shared(&self) -> &KeyValueStore {
        &self.pointers
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn uptime(&self) -> Duration {
        self.clock.elapsed()
    }

    /// Connections currently being dispatched.
    pub fn connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total_connections(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Stops the daemon. Only flips the running flag and wakes the accept
    /// loop, so it is safe to call from any thread, any number of times.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(self.log, "shutting down");
        if let Some(mut addr) = self.local_addr() {
            if addr.ip().is_unspecified() {
                let loopback = match addr.ip() {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                };
                addr.set_ip(loopback);
            }
            // accept() only returns once something connects
            if let Err(e) = TcpStream::connect_timeout(&addr, SHUTDOWN_CONNECT_TIMEOUT) {
                debug!(self.log, "wake-up connect failed"; "err" => %e);
            }
        }
    }

    /// Runs `f` with the session of every connection that ends.
    pub fn on_cleanup<F>(&self, f: F)
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        *self.cleanup.write() = Some(Arc::new(f));
    }

    fn cleanup_fn(&self) -> Option<Arc<CleanupFn>> {
        self.cleanup.read().clone()
    }
}

/// What a master or worker thread gets to work with.
pub struct ThreadContext {
    /// `None` for the master, the worker's index otherwise.
    pub worker: Option<usize>,
    /// A private copy of the shared pointer entries.
    pub store: KeyValueStore,
    pub inbox: Mailbox,
    pub master: Mailbox,
    pub workers: Vec<Mailbox>,
    pub state: Arc<ServerState>,
}

impl ThreadContext {
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Handles messages on `inbox` until the daemon stops.
    pub fn run_mailbox(&self) -> usize {
        let state = Arc::clone(&self.state);
        self.inbox
            .run(move || state.is_running(), self.state.app().poll_interval())
    }
}

pub type MasterFn = Box<dyn FnOnce(ThreadContext) + Send>;
pub type WorkerFn = Arc<dyn Fn(ThreadContext) + Send + Sync>;

pub struct Daemon {
    state: Arc<ServerState>,
    host_key: String,
    port_key: String,
    listener: Option<TcpListener>,
    threads: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// A daemon serving `registry`, with the built-in commands installed.
    pub fn new(app: Arc<Application>, registry: Arc<CommandRegistry>) -> Daemon {
        commands::install(&registry);
        Daemon {
            state: Arc::new(ServerState::new(app, registry)),
            host_key: KEY_HOST.to_string(),
            port_key: KEY_PORT.to_string(),
            listener: None,
            threads: Vec::new(),
        }
    }

    /// Names the config keys holding the listen host and port.
    pub fn config_keys(mut self, host_key: &str, port_key: &str) -> Daemon {
        self.host_key = host_key.to_string();
        self.port_key = port_key.to_string();
        self
    }

    pub fn on_cleanup<F>(&self, f: F)
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.state.on_cleanup(f);
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.local_addr()
    }

    pub fn is_bound(&self) -> bool {
        self.listener.is_some()
    }

    /// Binds the listening socket from the configured host and port.
    /// Binding an already bound daemon returns its address.
    pub fn bind(&mut self) -> Result<SocketAddr> {
        if let (Some(_), Some(addr)) = (&self.listener, self.state.local_addr()) {
            return Ok(addr);
        }
        let config = self.state.app().config();
        let host = config.get_or(&self.host_key, "127.0.0.1");
        let port: u16 = config
            .get_parsed(&self.port_key)
            .ok_or_else(|| FanError::Config(format!("{} is not a port", self.port_key)))?;

        let listener = TcpListener::bind((host.as_str(), port))?;
        let addr = listener.local_addr()?;
        *self.state.local_addr.lock() = Some(addr);
        self.listener = Some(listener);
        self.state.running.store(true, Ordering::SeqCst);
        info!(self.state.log, "listening for fan requests"; "address" => %addr);
        Ok(addr)
    }

    /// Binds, starts the optional master and `worker_count` workers, then
    /// runs the accept loop until shutdown.
    pub fn bind_daemon(
        &mut self,
        master: Option<MasterFn>,
        worker: Option<WorkerFn>,
        worker_count: usize,
    ) -> Result<()> {
        self.bind()?;
        self.spawn_threads(master, worker, worker_count)?;
        self.run()
    }

    fn spawn_threads(
        &mut self,
        master: Option<MasterFn>,
        worker: Option<WorkerFn>,
        worker_count: usize,
    ) -> Result<()> {
        let master_box = Mailbox::new("master", Some(&self.state.log));
        let worker_count = if worker.is_some() { worker_count } else { 0 };
        let worker_boxes: Vec<Mailbox> = (0..worker_count)
            .map(|i| Mailbox::new(&format!("worker-{}", i), Some(&self.state.log)))
            .collect();

        let shared = self.state.shared();
        shared.insert_pointer(MASTER_MAILBOX, Pointer::owned(master_box.clone()));
        for (i, mb) in worker_boxes.iter().enumerate() {
            shared.insert_pointer(&worker_mailbox_key(i), Pointer::owned(mb.clone()));
        }

        let context = |index: Option<usize>, inbox: &Mailbox| {
            let store = KeyValueStore::with_logger(Some(&self.state.log));
            self.state.shared().copy_pointers_to(&store);
            ThreadContext {
                worker: index,
                store,
                inbox: inbox.clone(),
                master: master_box.clone(),
                workers: worker_boxes.clone(),
                state: Arc::clone(&self.state),
            }
        };

        let mut spawned = Vec::new();
        if let Some(f) = master {
            let ctx = context(None, &master_box);
            spawned.push(
                thread::Builder::new()
                    .name("fan-master".to_string())
                    .spawn(move || f(ctx))?,
            );
        }
        if let Some(f) = worker {
            for (i, inbox) in worker_boxes.iter().enumerate() {
                let ctx = context(Some(i), inbox);
                let f = Arc::clone(&f);
                spawned.push(
                    thread::Builder::new()
                        .name(format!("fan-worker-{}", i))
                        .spawn(move || f(ctx))?,
                );
            }
        }
        debug!(self.state.log, "started threads"; "count" => spawned.len());
        self.threads.extend(spawned);
        Ok(())
    }

    /// The accept loop. Transient accept errors are retried with backoff;
    /// anything else ends the loop with an error.
    pub fn run(&mut self) -> Result<()> {
        let result = self.accept_loop();
        self.close();
        result
    }

    fn accept_loop(&self) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| FanError::Config("daemon is not bound".to_string()))?;
        let log = &self.state.log;
        let mut backoff =
            Backoff::new(Duration::from_millis(5), Duration::from_secs(1)).with_jitter(true);

        while self.state.is_running() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    backoff.reset();
                    if !self.state.is_running() {
                        break;
                    }
                    self.spawn_dispatch(stream, peer);
                }
                Err(e) if is_transient(&e) => {
                    if backoff.attempts() >= MAX_ACCEPT_FAILURES {
                        error!(log, "giving up on accept"; "err" => %e);
                        return Err(e.into());
                    }
                    let delay = backoff.next_delay();
                    warn!(log, "accept failed, retrying";
                          "err" => %e, "delay_ms" => delay.as_millis() as u64);
                    thread::sleep(delay);
                }
                Err(e) => {
                    error!(log, "accept failed"; "err" => %e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn spawn_dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name(format!("fan-conn-{}", id))
            .spawn(move || dispatch(state, stream, id));
        match spawned {
            Ok(_) => trace!(self.state.log, "accepted"; "conn" => id, "peer" => %peer),
            Err(e) => error!(self.state.log, "unable to start dispatch thread";
                             "peer" => %peer, "err" => %e),
        }
    }

    /// Closes the listening socket and waits for master and workers.
    fn close(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
        if self.listener.take().is_some() {
            info!(self.state.log, "listener closed");
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!(self.state.log, "a master or worker thread panicked");
            }
        }
    }

    pub fn shutdown_daemon(&self) {
        self.state.shutdown();
    }
}

fn is_transient(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        // EMFILE, ENFILE
        _ => cfg!(unix) && matches!(e.raw_os_error(), Some(23) | Some(24)),
    }
}

struct ConnectionGuard<'a>(&'a ServerState);

impl<'a> ConnectionGuard<'a> {
    fn new(state: &'a ServerState) -> ConnectionGuard<'a> {
        state.active.fetch_add(1, Ordering::SeqCst);
        state.total.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard(state)
    }
}

impl<'a> Drop for ConnectionGuard<'a> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn dispatch(state: Arc<ServerState>, stream: TcpStream, id: u64) {
    let _guard = ConnectionGuard::new(&state);
    let peer = stream.peer_addr().ok();
    let log = state.log.new(o!(
        "conn" => id,
        "peer" => peer.map(|p| p.to_string()).unwrap_or_default()
    ));
    let mut session = Session::new(id, peer, state.app());

    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            error!(log, "unable to clone connection socket"; "err" => %e);
            return;
        }
    };
    if let Err(e) = stream.set_read_timeout(Some(session.poll_interval)) {
        warn!(log, "unable to set read timeout"; "err" => %e);
    }
    let mut reader = LineReader::new(stream, session.buffer_size);

    match serve(&state, &mut session, &mut reader, &mut writer, &log) {
        Ok(()) => debug!(log, "connection closed"),
        Err(e) => debug!(log, "connection ended"; "err" => %e),
    }

    if let Some(cleanup) = state.cleanup_fn() {
        cleanup(&session);
    }
    let _ = writer.shutdown(Shutdown::Both);
}

fn serve(
    state: &ServerState,
    session: &mut Session,
    reader: &mut LineReader<TcpStream>,
    writer: &mut TcpStream,
    log: &Logger,
) -> Result<()> {
    greet(state, writer)?;

    loop {
        let line = match reader.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(e) if e.is_timeout() => {
                if !state.is_running() {
                    return Ok(());
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if !state.is_running() {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let results = KeyValueStore::new();
        let request = match protocol::parse_command(&line) {
            Ok(request) => request,
            Err(e) => {
                debug!(log, "unparseable request"; "err" => %e);
                results.insert(KEY_RETURN, "FALSE");
                results.insert(KEY_RETURNMSG, NOT_UNDERSTOOD);
                protocol::write_response(writer, &results, session.clear_text)?;
                continue;
            }
        };
        trace!(log, "request"; "name" => &request.name, "params" => request.params.len());

        match request.name.as_str() {
            "EXIT" | "QUIT" | "." => {
                results.insert(KEY_RETURN, "TRUE");
                results.insert(KEY_RETURNMSG, "Bye");
                protocol::write_response(writer, &results, session.clear_text)?;
                return Ok(());
            }
            CMD_BINARYPUSH => binary_push(state, session, reader, writer, &request, log)?,
            _ => {
                execute(state, session, &request, &results);
                protocol::write_response(writer, &results, session.clear_text)?;
            }
        }

        session.reload();
        reader.set_max_length(session.buffer_size);
    }
}

fn greet(state: &ServerState, writer: &mut TcpStream) -> Result<()> {
    let hello = KeyValueStore::new();
    hello.insert("SERVER", state.app().name());
    hello.insert("VERSION", env!("CARGO_PKG_VERSION"));
    hello.insert(KEY_RETURN, "TRUE");
    protocol::write_response(writer, &hello, false)?;
    Ok(())
}

/// Resolves `name` and checks the session may run it.
fn authorize(
    state: &ServerState,
    session: &Session,
    name: &str,
) -> std::result::Result<(String, ProtocolCommand), &'static str> {
    match state.registry().resolve(name, session.namespace.as_deref()) {
        Some((_, cmd)) if !cmd.enabled => Err(NOT_UNDERSTOOD),
        Some((_, cmd)) if !cmd.anonymous && !session.authenticated => Err(ACCESS_DENIED),
        Some(found) => Ok(found),
        None => Err(NOT_UNDERSTOOD),
    }
}

/// Runs one ordinary request, leaving `RETURN` in `results`.
fn execute(state: &ServerState, session: &mut Session, request: &Request, results: &KeyValueStore) {
    let ok = match authorize(state, session, &request.name) {
        Ok((name, cmd)) => {
            let mut call = Call {
                name: &name,
                params: &request.params,
                results,
                session,
                server: state,
            };
            cmd.invoke(&mut call)
        }
        Err(message) => {
            results.insert(KEY_RETURNMSG, message);
            false
        }
    };
    results.insert(KEY_RETURN, if ok { "TRUE" } else { "FALSE" });
}

/// Receives batches until the end-of-stream line and answers with a
/// single ack byte. Batches for a command the session may not run are
/// read and dropped.
fn binary_push(
    state: &ServerState,
    session: &mut Session,
    reader: &mut LineReader<TcpStream>,
    writer: &mut TcpStream,
    request: &Request,
    log: &Logger,
) -> Result<()> {
    let target = request
        .params
        .first()
        .and_then(|p| p.text().ok())
        .ok_or_else(|| ProtocolError::Malformed("BINARYPUSH without a command".to_string()))?;
    let command = match authorize(state, session, &target) {
        Ok(found) => Some(found),
        Err(reason) => {
            debug!(log, "binary push refused"; "command" => &target, "reason" => reason);
            None
        }
    };

    let mut accepted = command.is_some();
    let mut batches = 0u64;
    loop {
        let header = match protocol::read_push_header(reader) {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(e) if e.is_timeout() => {
                if !state.is_running() {
                    return Err(e.into());
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let template = match checked_batch(&header, session.buffer_size) {
            Ok(template) => template,
            Err(e) => {
                // the payload length is unknown, so the stream cannot resync
                warn!(log, "refusing binary push batch";
                      "command" => &target, "header" => &header, "err" => %e);
                write_ack(writer, PushAck::Rejected)?;
                return Err(e);
            }
        };
        let mut data = vec![0u8; template.size()];
        reader.read_exact(&mut data)?;
        batches += 1;

        if let Some((name, cmd)) = &command {
            if session.needs_swap() {
                template.reverse_byte_order(&mut data)?;
            }
            let params = [Param::Bare(template.to_string()), Param::Raw(data)];
            let results = KeyValueStore::new();
            let mut call = Call {
                name,
                params: &params,
                results: &results,
                session: &mut *session,
                server: state,
            };
            accepted &= cmd.invoke(&mut call);
        }
    }

    let ack = if accepted {
        PushAck::Accepted
    } else {
        PushAck::Rejected
    };
    debug!(log, "binary push finished"; "command" => &target, "batches" => batches,
           "ack" => ?ack);
    write_ack(writer, ack)
}

/// Parses a batch header, refusing layouts larger than `limit` bytes
/// before anything is allocated for them.
fn checked_batch(header: &str, limit: usize) -> Result<TypeTemplate> {
    let template = TypeTemplate::parse(header.trim())?;
    if template.size() > limit {
        return Err(ProtocolError::BatchTooLarge(limit).into());
    }
    Ok(template)
}

fn write_ack(writer: &mut TcpStream, ack: PushAck) -> Result<()> {
    writer.write_all(&[ack.to_u8().unwrap_or(0)])?;
    writer.flush()?;
    Ok(())
}
