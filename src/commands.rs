// Copyright 2020 Joyent, Inc.

//! Commands every daemon answers: `use`, `help`, `cleartext`,
//! `nocleartext` and the `sys` domain.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_derive::Serialize;
use subtle::ConstantTimeEq;

use crate::app::{KEY_AUTH_TOKEN, KEY_BUFFER_SIZE, KEY_ENDIAN};
use crate::protocol::{Endian, MIN_BUFFER_SIZE};
use crate::registry::{list_commands, switch_namespace, Call, CommandRegistry};
use crate::server::ACCESS_DENIED;

pub const SYS_DOMAIN: &str = "sys";

#[derive(Serialize)]
struct StatusReport<'a> {
    name: &'a str,
    version: &'a str,
    started: DateTime<Utc>,
    uptime: u64,
    connections: usize,
    total_connections: u64,
    commands: usize,
    endian: Endian,
}

/// Registers the built-ins. Names already present in `registry` are
/// left alone so a server can replace any of them.
pub fn install(registry: &CommandRegistry) {
    let load = |name: &str, handler: fn(&mut Call<'_>) -> bool, anonymous: bool| {
        if registry.lookup(name).is_none() {
            registry.load_command(name, handler, anonymous, true);
        }
    };

    load("use", use_domain, true);
    load("help", help, true);
    load("cleartext", cleartext, true);
    load("nocleartext", nocleartext, true);

    if !registry.has_domain(SYS_DOMAIN) {
        registry.create_domain(SYS_DOMAIN, true);
    }
    load("sys::status", status, true);
    load("sys::setBufferSize", set_buffer_size, true);
    load("sys::endian", endian, true);
    load("sys::uptime", uptime, true);
    load("sys::UnloadCmd", unload_cmd, false);
    load("sys::LoadCmd", load_cmd, false);
    load("sys::halt", halt, false);
    load("sys::ping", ping, true);
    load("sys::auth", auth, true);
}

fn use_domain(call: &mut Call<'_>) -> bool {
    switch_namespace(call, None)
}

fn help(call: &mut Call<'_>) -> bool {
    let domain = call.param_text(0).filter(|d| !d.trim().is_empty());
    let names = call.registry().names_in(domain.as_deref());
    list_commands(call.results, &names);
    true
}

fn cleartext(call: &mut Call<'_>) -> bool {
    call.session.clear_text = true;
    call.ok("Clear text on")
}

fn nocleartext(call: &mut Call<'_>) -> bool {
    call.session.clear_text = false;
    call.ok("Clear text off")
}

fn status(call: &mut Call<'_>) -> bool {
    let server = call.server;
    let report = StatusReport {
        name: server.app().name(),
        version: env!("CARGO_PKG_VERSION"),
        started: server.started(),
        uptime: server.uptime().as_secs(),
        connections: server.connections(),
        total_connections: server.total_connections(),
        commands: server.registry().len(),
        endian: call.session.local_endian,
    };
    let json = match serde_json::to_string(&report) {
        Ok(json) => json,
        Err(e) => return call.fail(format!("Unable to encode status: {}", e)),
    };

    call.results.insert("CONNECTIONS", report.connections.to_string());
    call.results.insert("COMMANDS", report.commands.to_string());
    call.results.insert("UPTIME", report.uptime.to_string());
    call.results.insert("STATUS", json);
    true
}

fn set_buffer_size(call: &mut Call<'_>) -> bool {
    let size = match call.param_text(0).and_then(|s| s.trim().parse::<usize>().ok()) {
        Some(size) => size,
        None => return call.fail("Expected a buffer size"),
    };
    if size < MIN_BUFFER_SIZE {
        return call.fail(format!("Buffer size must be at least {}", MIN_BUFFER_SIZE));
    }
    call.session.config.insert(KEY_BUFFER_SIZE, size.to_string());
    call.results.insert(KEY_BUFFER_SIZE, size.to_string());
    call.ok(format!("Buffer size set to {}", size))
}

/// Records the caller's byte order and answers with ours.
fn endian(call: &mut Call<'_>) -> bool {
    if let Some(text) = call.param_text(0) {
        match text.parse::<Endian>() {
            Ok(remote) => call.session.remote_endian = remote,
            Err(e) => return call.fail(e.to_string()),
        }
    }
    call.results
        .insert(KEY_ENDIAN, call.session.local_endian.as_str());
    true
}

fn uptime(call: &mut Call<'_>) -> bool {
    let server = call.server;
    call.results
        .insert("UPTIME", server.uptime().as_secs().to_string());
    call.results.insert(
        "STARTED",
        server.started().to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    true
}

fn unload_cmd(call: &mut Call<'_>) -> bool {
    match call.param_text(0) {
        Some(name) if call.registry().disable(&name) => call.ok(format!("{} unloaded", name)),
        Some(name) => call.fail(format!("Unknown command {}", name)),
        None => call.fail("Expected a command name"),
    }
}

fn load_cmd(call: &mut Call<'_>) -> bool {
    match call.param_text(0) {
        Some(name) if call.registry().enable(&name) => call.ok(format!("{} loaded", name)),
        Some(name) => call.fail(format!("Unknown command {}", name)),
        None => call.fail("Expected a command name"),
    }
}

fn halt(call: &mut Call<'_>) -> bool {
    call.server.shutdown();
    call.ok("Halting")
}

fn ping(call: &mut Call<'_>) -> bool {
    call.ok("PONG")
}

fn auth(call: &mut Call<'_>) -> bool {
    let expected = match call.server.app().config().get(KEY_AUTH_TOKEN) {
        Some(token) => token,
        None => {
            call.session.authenticated = true;
            return call.ok("No authentication required");
        }
    };
    let given = call.param_text(0).unwrap_or_default();
    if token_matches(&given, &expected) {
        call.session.authenticated = true;
        call.ok("Authenticated")
    } else {
        call.fail(ACCESS_DENIED)
    }
}

fn token_matches(given: &str, expected: &str) -> bool {
    bool::from(given.as_bytes().ct_eq(expected.as_bytes()))
}
