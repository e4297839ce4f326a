// Copyright 2020 Joyent, Inc.

//! Thread-safe, case-insensitive key/value store.
//!
//! A `KeyValueStore` carries two independent namespaces: string values,
//! which the store owns, and shared pointer entries, which it only holds a
//! reference to. Keys in both are upper-cased on the way in. Every method
//! takes a reentrant lock, so a method may call back into the same store
//! from the same thread.
//!
//! The store also reads and writes the INI-like text format used for
//! config files and for RPC responses:
//!
//! ```text
//! # comment
//! NAME=fanserve
//! [daemon]
//! PORT="2030"
//! EOF
//! ```
//!
//! A `[section]` header prefixes the keys that follow (`DAEMON.PORT`). A
//! line whose bare key is `EOF` ends the text successfully; a line whose
//! bare key is `ERROR` ends it as a failure. Quoted keys are never
//! sentinels, so stored `EOF`/`ERROR` entries are written quoted.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as FmtWrite;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use parking_lot::ReentrantMutex;
use slog::{debug, o, warn, Drain, Logger};

use crate::b64;

const SENTINEL_EOF: &str = "EOF";
const SENTINEL_ERROR: &str = "ERROR";

pub type Shared = Arc<dyn Any + Send + Sync>;

/// An entry in the pointer namespace.
#[derive(Clone)]
pub enum Pointer {
    /// The store keeps the value alive.
    Owned(Shared),
    /// The store never keeps the value alive; it vanishes with its owner.
    Borrowed(Weak<dyn Any + Send + Sync>),
}

impl Pointer {
    pub fn owned<T: Any + Send + Sync>(value: T) -> Pointer {
        Pointer::Owned(Arc::new(value))
    }

    pub fn borrowed<T: Any + Send + Sync>(value: &Arc<T>) -> Pointer {
        let shared: Shared = value.clone();
        Pointer::Borrowed(Arc::downgrade(&shared))
    }

    fn upgrade(&self) -> Option<Shared> {
        match self {
            Pointer::Owned(v) => Some(Arc::clone(v)),
            Pointer::Borrowed(w) => w.upgrade(),
        }
    }
}

#[derive(Default)]
struct Tables {
    values: HashMap<String, String>,
    pointers: HashMap<String, Pointer>,
}

pub struct KeyValueStore {
    tables: ReentrantMutex<RefCell<Tables>>,
    log: Logger,
}

fn normalize(key: &str) -> String {
    key.trim().to_ascii_uppercase()
}

impl Default for KeyValueStore {
    fn default() -> Self {
        KeyValueStore::new()
    }
}

impl KeyValueStore {
    pub fn new() -> KeyValueStore {
        KeyValueStore::with_logger(None)
    }

    pub fn with_logger(log: Option<&Logger>) -> KeyValueStore {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        KeyValueStore {
            tables: ReentrantMutex::new(RefCell::new(Tables::default())),
            log,
        }
    }

    pub fn insert<V: Into<String>>(&self, key: &str, value: V) {
        let guard = self.tables.lock();
        guard
            .borrow_mut()
            .values
            .insert(normalize(key), value.into());
    }

    /// Inserts `value`, or deletes the key when `value` is `None`.
    pub fn set<V: Into<String>>(&self, key: &str, value: Option<V>) {
        match value {
            Some(v) => self.insert(key, v),
            None => {
                self.remove(key);
            }
        }
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        let guard = self.tables.lock();
        let removed = guard.borrow_mut().values.remove(&normalize(key));
        removed
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let guard = self.tables.lock();
        let value = guard.borrow().values.get(&normalize(key)).cloned();
        value
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        let guard = self.tables.lock();
        let found = guard.borrow().values.contains_key(&normalize(key));
        found
    }

    /// Case-insensitive comparison of the current value against `expected`.
    pub fn check_key(&self, key: &str, expected: &str) -> bool {
        match self.get(key) {
            Some(v) => v.eq_ignore_ascii_case(expected),
            None => false,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let guard = self.tables.lock();
        let keys = guard.borrow().values.keys().cloned().collect();
        keys
    }

    pub fn len(&self) -> usize {
        let guard = self.tables.lock();
        let n = guard.borrow().values.len();
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every string and pointer entry.
    pub fn clear(&self) {
        let guard = self.tables.lock();
        let mut tables = guard.borrow_mut();
        tables.values.clear();
        tables.pointers.clear();
    }

    pub fn insert_pointer(&self, key: &str, pointer: Pointer) {
        let guard = self.tables.lock();
        guard
            .borrow_mut()
            .pointers
            .insert(normalize(key), pointer);
    }

    pub fn remove_pointer(&self, key: &str) -> Option<Pointer> {
        let guard = self.tables.lock();
        let removed = guard.borrow_mut().pointers.remove(&normalize(key));
        removed
    }

    /// Returns the pointer under `key` if it is still alive and holds a `T`.
    pub fn get_pointer<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let guard = self.tables.lock();
        let entry = guard.borrow().pointers.get(&normalize(key)).cloned();
        drop(guard);
        entry
            .and_then(|p| p.upgrade())
            .and_then(|shared| shared.downcast::<T>().ok())
    }

    pub fn pointer_keys(&self) -> Vec<String> {
        let guard = self.tables.lock();
        let keys = guard.borrow().pointers.keys().cloned().collect();
        keys
    }

    fn snapshot_values(&self) -> Vec<(String, String)> {
        let guard = self.tables.lock();
        let entries = guard
            .borrow()
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries
    }

    /// Copies every string value into `dest`, overwriting existing keys.
    pub fn copy_values_to(&self, dest: &KeyValueStore) {
        for (k, v) in self.snapshot_values() {
            dest.insert(&k, v);
        }
    }

    /// Copies every pointer entry into `dest`. The pointees are shared,
    /// never duplicated.
    pub fn copy_pointers_to(&self, dest: &KeyValueStore) {
        let guard = self.tables.lock();
        let entries: Vec<(String, Pointer)> = guard
            .borrow()
            .pointers
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect();
        drop(guard);
        for (k, p) in entries {
            dest.insert_pointer(&k, p);
        }
    }

    /// Parses INI-like `text` into the store, Base64-decoding each value
    /// when `decode_base64` is set. Returns false on an `ERROR` line.
    pub fn parse_from(&self, text: &str, decode_base64: bool) -> bool {
        let mut parser = IniParser::new(self, decode_base64);
        match parser.feed(text) {
            Some(result) => result,
            None => parser.finish(),
        }
    }

    pub fn read_from_stream<R: BufRead>(
        &self,
        reader: &mut R,
        decode_base64: bool,
    ) -> io::Result<bool> {
        let mut parser = IniParser::new(self, decode_base64);
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(parser.finish());
            }
            if let Some(result) = parser.feed(&line) {
                return Ok(result);
            }
        }
    }

    pub fn read_from_file<P: AsRef<Path>>(&self, path: P, decode_base64: bool) -> io::Result<bool> {
        let file = File::open(path)?;
        self.read_from_stream(&mut BufReader::new(file), decode_base64)
    }

    /// Writes every value as `KEY="value"` lines in key order, without a
    /// terminator.
    pub fn write_entries<W: Write>(&self, out: &mut W, encode_base64: bool) -> io::Result<()> {
        let mut entries = self.snapshot_values();
        entries.sort();
        let mut text = String::new();
        for (k, v) in entries {
            let value = if encode_base64 {
                b64::encode_value(v.as_bytes())
            } else {
                escape(&v)
            };
            let _ = writeln!(text, "{}=\"{}\"", format_key(&k), value);
        }
        out.write_all(text.as_bytes())
    }

    /// Serializes the store in the format `parse_from` reads, ending with
    /// the `EOF` terminator.
    pub fn to_ini_string(&self, encode_base64: bool) -> String {
        let mut buf = Vec::new();
        // writes into a Vec cannot fail
        let _ = self.write_entries(&mut buf, encode_base64);
        let mut text = String::from_utf8_lossy(&buf).into_owned();
        text.push('\n');
        text.push_str(SENTINEL_EOF);
        text.push('\n');
        text
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn format_key(key: &str) -> String {
    let plain = !key.is_empty()
        && key != SENTINEL_EOF
        && key != SENTINEL_ERROR
        && !key.starts_with('[')
        && key
            .chars()
            .all(|c| !c.is_whitespace() && c != '=' && c != '#' && c != '"');
    if plain {
        key.to_string()
    } else {
        format!("\"{}\"", escape(key))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    BeforeKey,
    InKey,
    AfterKey,
    BeforeValue,
    InValue,
    InQuotedKey,
    InQuotedValue,
    KeyEscape,
    ValueEscape,
    AfterValue,
    Comment,
    Section,
}

/// Incremental parser for the INI-like format. Text may be fed in
/// arbitrary pieces; `feed` returns `Some` once a sentinel line is seen.
pub struct IniParser<'a> {
    store: &'a KeyValueStore,
    decode_base64: bool,
    state: State,
    key: String,
    quoted_key: bool,
    value: String,
    section: String,
    until_eof: bool,
    failed: bool,
}

impl<'a> IniParser<'a> {
    pub fn new(store: &'a KeyValueStore, decode_base64: bool) -> IniParser<'a> {
        IniParser {
            store,
            decode_base64,
            state: State::BeforeKey,
            key: String::new(),
            quoted_key: false,
            value: String::new(),
            section: String::new(),
            until_eof: false,
            failed: false,
        }
    }

    /// Keeps reading past an `ERROR` line up to `EOF`, which then reports
    /// the failure. Framed responses are read this way so the whole frame
    /// is consumed.
    pub fn until_eof(mut self) -> IniParser<'a> {
        self.until_eof = true;
        self
    }

    pub fn feed(&mut self, text: &str) -> Option<bool> {
        for c in text.chars() {
            if let Some(result) = self.step(c) {
                return Some(result);
            }
        }
        None
    }

    /// Ends the input. Unterminated input counts as success.
    pub fn finish(mut self) -> bool {
        match self.state {
            State::InKey | State::InQuotedKey | State::KeyEscape => {
                if let Some(result) = self.end_key() {
                    return result;
                }
            }
            State::InValue | State::InQuotedValue | State::ValueEscape => self.commit(),
            _ => (),
        }
        !self.failed
    }

    fn step(&mut self, c: char) -> Option<bool> {
        match self.state {
            State::BeforeKey => match c {
                '#' => self.state = State::Comment,
                '[' => {
                    self.section.clear();
                    self.state = State::Section;
                }
                '"' => {
                    self.quoted_key = true;
                    self.state = State::InQuotedKey;
                }
                '=' => self.state = State::BeforeValue,
                c if c.is_whitespace() => (),
                c => {
                    self.key.push(c);
                    self.state = State::InKey;
                }
            },
            State::InKey => match c {
                '\n' => {
                    let done = self.end_key();
                    self.reset();
                    return done;
                }
                '=' => {
                    let done = self.end_key();
                    self.state = State::BeforeValue;
                    return done;
                }
                '#' => {
                    let done = self.end_key();
                    self.reset();
                    self.state = State::Comment;
                    return done;
                }
                c if c.is_whitespace() => {
                    self.state = State::AfterKey;
                    return self.end_key();
                }
                c => self.key.push(c),
            },
            State::InQuotedKey => match c {
                '\\' => self.state = State::KeyEscape,
                '"' => {
                    self.state = State::AfterKey;
                    return self.end_key();
                }
                c => self.key.push(c),
            },
            State::KeyEscape => {
                self.key.push(c);
                self.state = State::InQuotedKey;
            }
            State::AfterKey => match c {
                '=' => self.state = State::BeforeValue,
                '\n' => self.reset(),
                '#' => {
                    self.reset();
                    self.state = State::Comment;
                }
                c if c.is_whitespace() => (),
                c => {
                    // a second bare word replaces the first
                    self.key.clear();
                    self.quoted_key = false;
                    self.key.push(c);
                    self.state = State::InKey;
                }
            },
            State::BeforeValue => match c {
                '"' => self.state = State::InQuotedValue,
                '\n' => {
                    self.commit();
                    self.state = State::BeforeKey;
                }
                '#' => {
                    self.commit();
                    self.state = State::Comment;
                }
                c if c.is_whitespace() => (),
                c => {
                    self.value.push(c);
                    self.state = State::InValue;
                }
            },
            State::InValue => match c {
                '\n' => {
                    self.commit();
                    self.state = State::BeforeKey;
                }
                '#' => {
                    self.commit();
                    self.state = State::Comment;
                }
                c if c.is_whitespace() => {
                    self.commit();
                    self.state = State::AfterValue;
                }
                c => self.value.push(c),
            },
            State::InQuotedValue => match c {
                '\\' => self.state = State::ValueEscape,
                '"' => {
                    self.commit();
                    self.state = State::AfterValue;
                }
                c => self.value.push(c),
            },
            State::ValueEscape => {
                self.value.push(c);
                self.state = State::InQuotedValue;
            }
            State::AfterValue => match c {
                '\n' => self.state = State::BeforeKey,
                '#' => self.state = State::Comment,
                c if c.is_whitespace() => (),
                c => {
                    self.key.push(c);
                    self.state = State::InKey;
                }
            },
            State::Comment => {
                if c == '\n' {
                    self.state = State::BeforeKey;
                }
            }
            State::Section => match c {
                ']' | '\n' => {
                    self.section = self.section.trim().to_string();
                    self.state = State::BeforeKey;
                }
                c => self.section.push(c),
            },
        }
        None
    }

    /// Checks a completed key against the sentinels.
    fn end_key(&mut self) -> Option<bool> {
        if self.quoted_key {
            return None;
        }
        match self.key.as_str() {
            SENTINEL_EOF => Some(!self.failed),
            SENTINEL_ERROR if self.until_eof => {
                self.failed = true;
                None
            }
            SENTINEL_ERROR => Some(false),
            _ => None,
        }
    }

    fn reset(&mut self) {
        self.key.clear();
        self.quoted_key = false;
        self.value.clear();
        self.state = State::BeforeKey;
    }

    fn commit(&mut self) {
        let key = std::mem::replace(&mut self.key, String::new());
        let raw = std::mem::replace(&mut self.value, String::new());
        self.quoted_key = false;
        if key.is_empty() {
            return;
        }
        let key = if self.section.is_empty() {
            key
        } else {
            format!("{}.{}", self.section, key)
        };

        let value = if self.decode_base64 {
            match b64::decode_text(&raw) {
                Ok(v) => v,
                Err(e) => {
                    warn!(self.store.log, "skipping undecodable value";
                          "key" => &key, "err" => %e);
                    return;
                }
            }
        } else {
            raw
        };
        debug!(self.store.log, "parsed entry"; "key" => &key);
        self.store.insert(&key, value);
    }
}
