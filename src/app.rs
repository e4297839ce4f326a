// Copyright 2020 Joyent, Inc.

//! Process configuration and per-connection context.

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use slog::{info, o, Drain, Level, LevelFilter, Logger};

use crate::client::Connection;
use crate::error::{FanError, Result};
use crate::protocol::{Endian, Param, Request, DEFAULT_BUFFER_SIZE, KEY_RETURN, KEY_RETURNMSG};
use crate::store::KeyValueStore;
use crate::template::{TypeTemplate, Value};

pub const KEY_NAME: &str = "NAME";
pub const KEY_HOST: &str = "HOST";
pub const KEY_PORT: &str = "PORT";
pub const KEY_ENDIAN: &str = "ENDIAN";
pub const KEY_BUFFER_SIZE: &str = "BUFFERSIZE";
pub const KEY_LOG_LEVEL: &str = "LOGLEVEL";
pub const KEY_POLL_INTERVAL: &str = "POLLINTERVAL";
pub const KEY_AUTH_TOKEN: &str = "AUTH.TOKEN";
pub const KEY_SDD_HOST: &str = "SDD.HOST";
pub const KEY_SDD_PORT: &str = "SDD.PORT";
pub const KEY_SDD_SERVICE: &str = "SDD.SERVICE";
pub const KEY_SDD_COMMAND: &str = "SDD.COMMAND";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_POLL_MS: u64 = 250;

/// Process-wide configuration, shared by reference between the daemon,
/// its connections and any client connections the process opens.
pub struct Application {
    name: String,
    config: KeyValueStore,
    log: Logger,
    started: DateTime<Utc>,
}

impl Application {
    pub fn new(name: &str, log: Option<&Logger>) -> Application {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let config = KeyValueStore::with_logger(Some(&log));
        config.insert(KEY_NAME, name);
        config.insert(KEY_HOST, DEFAULT_HOST);
        config.insert(KEY_PORT, "0");
        config.insert(KEY_ENDIAN, Endian::native().as_str());
        config.insert(KEY_BUFFER_SIZE, DEFAULT_BUFFER_SIZE.to_string());
        config.insert(KEY_LOG_LEVEL, "info");
        config.insert(KEY_POLL_INTERVAL, DEFAULT_POLL_MS.to_string());

        Application {
            name: name.to_string(),
            config,
            log,
            started: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &KeyValueStore {
        &self.config
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn set<V: Into<String>>(&self, key: &str, value: V) {
        self.config.insert(key, value);
    }

    /// Merges an INI-like config file over the current settings.
    pub fn load_config_file<P: AsRef<Path>>(&self, path: P) -> Result<bool> {
        let path = path.as_ref();
        let ok = self.config.read_from_file(path, false)?;
        info!(self.log, "loaded configuration"; "path" => %path.display(), "ok" => ok);
        Ok(ok)
    }

    pub fn log_level(&self) -> Level {
        self.config
            .get(KEY_LOG_LEVEL)
            .and_then(|l| Level::from_str(l.trim()).ok())
            .unwrap_or(Level::Info)
    }

    /// A logger filtered at the configured `LOGLEVEL`.
    pub fn logger(&self) -> Logger {
        let filtered = LevelFilter::new(self.log.clone(), self.log_level()).ignore_res();
        Logger::root(filtered, o!("app" => self.name.clone()))
    }

    pub fn endian(&self) -> Endian {
        self.config
            .get_parsed(KEY_ENDIAN)
            .unwrap_or_else(Endian::native)
    }

    pub fn buffer_size(&self) -> usize {
        self.config
            .get_parsed(KEY_BUFFER_SIZE)
            .unwrap_or(DEFAULT_BUFFER_SIZE)
    }

    pub fn poll_interval(&self) -> Duration {
        let ms = self
            .config
            .get_parsed(KEY_POLL_INTERVAL)
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_POLL_MS);
        Duration::from_millis(ms)
    }

    /// Fetches shared configuration from the system directory server and
    /// merges it into this process' config. `Ok(false)` means no SDD is
    /// configured.
    pub fn bootstrap_sdd(&self) -> Result<bool> {
        let host = match self.config.get(KEY_SDD_HOST) {
            Some(h) => h,
            None => return Ok(false),
        };
        let port: u16 = self.config.get_parsed(KEY_SDD_PORT).ok_or_else(|| {
            FanError::Config(format!("{} is missing or not a port", KEY_SDD_PORT))
        })?;
        let service = self.config.get_or(KEY_SDD_SERVICE, "sdd");
        let command = self.config.get_or(KEY_SDD_COMMAND, "sdd::config");

        let log = self.logger();
        let mut conn = Connection::new(&host, port, Some(&log)).with_service(&service);
        conn.connect()?;
        let request = Request::encoded(&command, &[self.name.as_bytes()]);
        if !conn.call(&request)? {
            return Err(FanError::Rejected {
                call: command,
                message: conn.results().get_or(KEY_RETURNMSG, ""),
            });
        }

        let fetched = conn.results();
        fetched.remove(KEY_RETURN);
        fetched.remove(KEY_RETURNMSG);
        fetched.copy_values_to(&self.config);
        info!(log, "merged remote configuration";
              "sdd" => format!("{}:{}", host, port), "keys" => fetched.len());
        conn.disconnect();
        Ok(true)
    }
}

/// State private to one accepted connection, threaded through every
/// command it runs.
pub struct Session {
    pub id: u64,
    pub peer: Option<SocketAddr>,
    pub namespace: Option<String>,
    pub clear_text: bool,
    pub buffer_size: usize,
    pub poll_interval: Duration,
    pub local_endian: Endian,
    pub remote_endian: Endian,
    pub authenticated: bool,
    /// Per-connection overrides, seeded from the process config.
    pub config: KeyValueStore,
}

impl Session {
    pub fn new(id: u64, peer: Option<SocketAddr>, app: &Application) -> Session {
        let config = KeyValueStore::new();
        app.config().copy_values_to(&config);
        let local_endian = app.endian();
        Session {
            id,
            peer,
            namespace: None,
            clear_text: false,
            buffer_size: app.buffer_size(),
            poll_interval: app.poll_interval(),
            local_endian,
            remote_endian: local_endian,
            authenticated: !app.config().contains(KEY_AUTH_TOKEN),
            config,
        }
    }

    pub fn needs_swap(&self) -> bool {
        self.local_endian != self.remote_endian
    }

    /// Picks up a buffer size changed through the session config.
    pub fn reload(&mut self) {
        if let Some(size) = self.config.get_parsed(KEY_BUFFER_SIZE) {
            self.buffer_size = size;
        }
    }

    /// Decodes a binary parameter laid out by `template` into local
    /// byte order.
    pub fn decode_binary(&self, param: &Param, template: &TypeTemplate) -> Result<Vec<u8>> {
        let mut data = param.bytes()?;
        if data.len() != template.size() {
            return Err(crate::template::TemplateError::SizeMismatch {
                expected: template.size(),
                actual: data.len(),
            }
            .into());
        }
        // binary-push payloads are corrected as they arrive
        if self.needs_swap() && !matches!(param, Param::Raw(_)) {
            template.reverse_byte_order(&mut data)?;
        }
        Ok(data)
    }

    pub fn decode_values(&self, param: &Param, template: &TypeTemplate) -> Result<Vec<Value>> {
        let data = self.decode_binary(param, template)?;
        Ok(template.unpack(&data)?)
    }
}
