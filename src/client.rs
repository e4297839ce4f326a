// Copyright 2020 Joyent, Inc.

//! Client side of the protocol.
//!
//! A `Connection` owns one socket and one results store. Every call
//! clears the store, writes a request line and reads the framed response
//! back into it:
//!
//! ```no_run
//! use fan_rpc::client::Connection;
//!
//! let mut conn = Connection::new("127.0.0.1", 2030, None);
//! conn.connect().unwrap();
//! if conn.rpc("sys::ping", &[]) {
//!     println!("{:?}", conn.result("RETURNMSG"));
//! }
//! ```

use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;

use num_traits::FromPrimitive;
use slog::{debug, o, warn, Drain, Logger};

use crate::app::KEY_ENDIAN;
use crate::b64;
use crate::backoff::Backoff;
use crate::error::{FanError, ProtocolError, Result};
use crate::protocol::{
    self, Endian, LineReader, PushAck, Request, CMD_BINARYPUSH, DEFAULT_BUFFER_SIZE, KEY_RETURN,
    KEY_RETURNMSG,
};
use crate::store::KeyValueStore;
use crate::template::{TemplateError, TypeTemplate, Value};

const DEFAULT_ATTEMPTS: u32 = 3;

pub struct Connection {
    host: String,
    port: u16,
    service: Option<String>,
    token: Option<String>,
    attempts: u32,
    reader: Option<LineReader<TcpStream>>,
    writer: Option<TcpStream>,
    connected: bool,
    pushing: bool,
    clear_text: bool,
    server_endian: Option<Endian>,
    results: KeyValueStore,
    log: Logger,
}

impl Connection {
    pub fn new(host: &str, port: u16, log: Option<&Logger>) -> Connection {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("server" => format!("{}:{}", host, port)));
        Connection {
            host: host.to_string(),
            port,
            service: None,
            token: None,
            attempts: DEFAULT_ATTEMPTS,
            reader: None,
            writer: None,
            connected: false,
            pushing: false,
            clear_text: false,
            server_endian: None,
            results: KeyValueStore::with_logger(Some(&log)),
            log,
        }
    }

    /// Switches into `service`'s namespace on connect.
    pub fn with_service(mut self, service: &str) -> Connection {
        self.service = Some(service.to_string());
        self
    }

    /// Authenticates with `token` on connect.
    pub fn with_token(mut self, token: &str) -> Connection {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Connection {
        self.attempts = attempts.max(1);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The byte order the server reported during connect.
    pub fn server_endian(&self) -> Option<Endian> {
        self.server_endian
    }

    /// Values returned by the last call.
    pub fn results(&self) -> &KeyValueStore {
        &self.results
    }

    pub fn result(&self, key: &str) -> Option<String> {
        self.results.get(key)
    }

    /// Opens the socket, retrying with backoff, then negotiates byte
    /// order, namespace and credentials.
    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        let stream = self.open()?;
        let writer = stream.try_clone()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(self.log, "unable to set TCP_NODELAY"; "err" => %e);
        }
        self.reader = Some(LineReader::new(stream, DEFAULT_BUFFER_SIZE));
        self.writer = Some(writer);

        match self.handshake() {
            Ok(()) => {
                self.connected = true;
                debug!(self.log, "connected"; "endian" => ?self.server_endian);
                Ok(())
            }
            Err(e) => {
                self.invalidate();
                Err(e)
            }
        }
    }

    fn open(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut backoff =
            Backoff::new(Duration::from_millis(50), Duration::from_secs(2)).with_jitter(true);
        loop {
            match TcpStream::connect((self.host.as_str(), self.port)) {
                Ok(stream) => return Ok(stream),
                Err(e) if backoff.attempts() + 1 >= self.attempts => {
                    return Err(FanError::ConnectFailed {
                        addr,
                        attempts: self.attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(self.log, "connect failed, retrying";
                          "err" => %e, "delay_ms" => delay.as_millis() as u64);
                    thread::sleep(delay);
                }
            }
        }
    }

    fn handshake(&mut self) -> Result<()> {
        self.results.clear();
        let reader = self.reader.as_mut().ok_or(FanError::NotConnected)?;
        protocol::read_response(reader, &self.results, true)?;
        if !self.results.check_key(KEY_RETURN, "TRUE") {
            return Err(self.rejected("greeting"));
        }

        let local = Endian::native();
        if !self.exchange(&Request::encoded("sys::endian", &[local.as_str()]))? {
            return Err(self.rejected("sys::endian"));
        }
        self.server_endian = self.results.get_parsed(KEY_ENDIAN);

        if let Some(service) = self.service.clone() {
            if !self.exchange(&Request::encoded("use", &[service.as_str()]))? {
                return Err(self.rejected("use"));
            }
        }
        if let Some(token) = self.token.clone() {
            if !self.exchange(&Request::encoded("sys::auth", &[token.as_str()]))? {
                return Err(self.rejected("sys::auth"));
            }
        }
        Ok(())
    }

    fn rejected(&self, call: &str) -> FanError {
        FanError::Rejected {
            call: call.to_string(),
            message: self.results.get_or(KEY_RETURNMSG, ""),
        }
    }

    /// Drops the socket so later calls fail fast.
    fn invalidate(&mut self) {
        if let Some(writer) = self.writer.take() {
            let _ = writer.shutdown(Shutdown::Both);
        }
        self.reader = None;
        self.connected = false;
        self.pushing = false;
    }

    /// Says goodbye and closes the socket.
    pub fn disconnect(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = protocol::write_line(writer, "QUIT") {
                debug!(self.log, "quit failed"; "err" => %e);
            }
        }
        self.invalidate();
        self.results.clear();
    }

    fn exchange(&mut self, request: &Request) -> Result<bool> {
        self.results.clear();
        let decode = !self.clear_text;
        match self.transact(request, decode) {
            Ok(terminated) => Ok(terminated && self.results.check_key(KEY_RETURN, "TRUE")),
            Err(e) => {
                warn!(self.log, "call failed"; "call" => &request.name, "err" => %e);
                self.invalidate();
                Err(e)
            }
        }
    }

    fn transact(&mut self, request: &Request, decode: bool) -> Result<bool> {
        let (reader, writer) = match (self.reader.as_mut(), self.writer.as_mut()) {
            (Some(reader), Some(writer)) => (reader, writer),
            _ => return Err(FanError::NotConnected),
        };
        protocol::write_request(writer, request)?;
        Ok(protocol::read_response(reader, &self.results, decode)?)
    }

    /// Runs `request`. `Ok(true)` only when the server answered
    /// `RETURN=TRUE`; an I/O failure closes the connection.
    pub fn call(&mut self, request: &Request) -> Result<bool> {
        if !self.connected || self.pushing {
            return Err(FanError::NotConnected);
        }
        self.exchange(request)
    }

    /// Calls `name` with each parameter Base64-encoded.
    pub fn rpc(&mut self, name: &str, params: &[&str]) -> bool {
        let request = Request::encoded(name, params);
        match self.call(&request) {
            Ok(ok) => ok,
            Err(e) => {
                debug!(self.log, "rpc failed"; "call" => name, "err" => %e);
                false
            }
        }
    }

    /// Calls `name` with `values` packed per `template`, one parameter per
    /// top-level field.
    pub fn try_vrpc(&mut self, name: &str, template: &str, values: &[Value]) -> Result<bool> {
        let template = TypeTemplate::cached(template)?;
        let fields = template.pack(values)?;
        self.call(&Request::encoded(name, &fields))
    }

    pub fn vrpc(&mut self, name: &str, template: &str, values: &[Value]) -> bool {
        match self.try_vrpc(name, template, values) {
            Ok(ok) => ok,
            Err(e) => {
                debug!(self.log, "vrpc failed"; "call" => name, "err" => %e);
                false
            }
        }
    }

    /// Asks the server to send plain response values (or Base64 again).
    pub fn set_clear_text(&mut self, on: bool) -> Result<bool> {
        if !self.connected {
            return Err(FanError::NotConnected);
        }
        let previous = self.clear_text;
        // the answer already comes back in the new mode
        self.clear_text = on;
        let name = if on { "cleartext" } else { "nocleartext" };
        let ok = self.exchange(&Request::new(name, Vec::new()))?;
        if !ok {
            self.clear_text = previous;
        }
        Ok(ok)
    }

    /// Opens a binary push to the command `name`.
    pub fn start_binary_push(&mut self, name: &str) -> Result<()> {
        if !self.connected || self.pushing {
            return Err(FanError::NotConnected);
        }
        let line = format!("{}(\"{}\")", CMD_BINARYPUSH, b64::encode_value(name.as_bytes()));
        self.send_line(&line)?;
        self.pushing = true;
        Ok(())
    }

    /// Sends one batch of raw bytes laid out by `template`.
    pub fn binary_push(&mut self, template: &str, data: &[u8]) -> Result<()> {
        if !self.pushing {
            return Err(FanError::NotConnected);
        }
        let template = TypeTemplate::cached(template)?;
        if data.len() != template.size() {
            return Err(TemplateError::SizeMismatch {
                expected: template.size(),
                actual: data.len(),
            }
            .into());
        }
        let writer = self.writer.as_mut().ok_or(FanError::NotConnected)?;
        if let Err(e) = protocol::write_push_batch(writer, &template, data) {
            self.invalidate();
            return Err(e.into());
        }
        Ok(())
    }

    pub fn binary_push_values(&mut self, template: &str, values: &[Value]) -> Result<()> {
        let packed = TypeTemplate::cached(template)?.pack(values)?.concat();
        self.binary_push(template, &packed)
    }

    /// Ends the push and returns whether the server accepted every batch.
    pub fn stop_binary_push(&mut self) -> Result<bool> {
        if !self.pushing {
            return Err(FanError::NotConnected);
        }
        self.send_line("")?;
        let mut ack = [0u8; 1];
        let read = match self.reader.as_mut() {
            Some(reader) => reader.read_exact(&mut ack),
            None => Err(ProtocolError::UnexpectedEof),
        };
        self.pushing = false;
        if let Err(e) = read {
            self.invalidate();
            return Err(e.into());
        }
        Ok(PushAck::from_u8(ack[0]) == Some(PushAck::Accepted))
    }

    fn send_line(&mut self, line: &str) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(FanError::NotConnected)?;
        if let Err(e) = protocol::write_line(writer, line) {
            self.invalidate();
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.disconnect();
        }
    }
}
