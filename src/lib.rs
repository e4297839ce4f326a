// Copyright 2020 Joyent, Inc.

//! Fan: a line-oriented RPC protocol over TCP
//!
//! Fan is a small text RPC protocol. A client sends one request per line
//! and the server answers each with a framed block of key/value pairs.
//!
//! Protocol definition
//!
//! * Request   `NAME(param1,param2,...)\n`. `NAME` is case-insensitive
//!             and may carry a domain (`sys::ping`); without one it is
//!             resolved against the connection's active namespace first.
//!             Quoted parameters hold Base64, bare ones are taken as-is.
//!
//! * Response  zero or more `KEY="VALUE"\n` lines, then a blank line and
//!             `EOF\n`. Values are Base64 unless the connection has
//!             switched to clear text. `RETURN` is `TRUE` or `FALSE`;
//!             `RETURNMSG` carries a readable message.
//!
//! * Greeting  on accept the server sends one response carrying `SERVER`,
//!             `VERSION` and `RETURN="TRUE"`.
//!
//! * Binary push  `BINARYPUSH("<base64 command name>")` followed by any
//!             number of batches, each a type-template line and exactly
//!             as many raw bytes as the template describes. A line of at
//!             most one byte ends the push and the server replies with a
//!             single byte: 1 if every batch was accepted, 0 otherwise.
//!
//! * Byte order  right after connecting the client calls `sys::endian`
//!             with its own byte order. Binary parameters from a peer of
//!             the other order are swapped field by field according to
//!             their template.
//!
//! Type templates describe binary layouts, for example
//! `int[5];{char[20];{double;double;double}[100]}[3];long`. Scalars are
//! `int` (4 bytes), `float` and `double` (8 bytes), `char` and `byte` (1
//! byte) and `long` (the platform `long`); `{...}` groups a struct and
//! `[n]` repeats a field.
//!
//! Every daemon answers `use`, `help`, `exit`/`quit`/`.`, `cleartext`,
//! `nocleartext` and the `sys` domain: `status`, `setBufferSize`,
//! `endian`, `uptime`, `UnloadCmd`, `LoadCmd`, `halt`, `ping` and `auth`.

pub mod app;
pub mod b64;
pub mod backoff;
pub mod client;
pub mod commands;
pub mod error;
pub mod mailbox;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;
pub mod template;

pub use app::{Application, Session};
pub use client::Connection;
pub use error::{FanError, ProtocolError, Result};
pub use mailbox::{Mailbox, Message};
pub use registry::{Call, CommandRegistry, ProtocolCommand};
pub use server::{Daemon, ServerState, ThreadContext};
pub use store::{KeyValueStore, Pointer};
pub use template::{TypeTemplate, Value};
