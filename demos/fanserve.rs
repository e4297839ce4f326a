// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::{Arc, Mutex};

use chrono::prelude::*;
use clap::{crate_version, App, Arg, ArgMatches};
use serde_derive::Serialize;
use slog::{debug, error, info, o, Drain, Logger};

use fan_rpc::mailbox::Payload;
use fan_rpc::registry::Call;
use fan_rpc::server::{MasterFn, ThreadContext, MASTER_MAILBOX};
use fan_rpc::template::Value;
use fan_rpc::{Application, CommandRegistry, Daemon, Mailbox};

static APP: &'static str = "fanserve";

#[derive(Serialize)]
struct DatePayload {
    timestamp: i64,
    iso8601: DateTime<Utc>,
}

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Sample fan daemon")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("Address to listen on (Default: 127.0.0.1)")
                .long("host")
                .short("h")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port to listen on (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .help("INI-style configuration file")
                .long("config")
                .short("c")
                .takes_value(true),
        )
        .get_matches()
}

fn echo_handler(call: &mut Call<'_>) -> bool {
    for i in 0..call.params.len() {
        if let Some(text) = call.param_text(i) {
            call.results.insert(&format!("ARG.{}", i), text);
        }
    }
    call.ok(format!("{} arguments", call.params.len()))
}

fn date_handler(call: &mut Call<'_>) -> bool {
    let now = Utc::now();
    let payload = DatePayload {
        timestamp: now.timestamp_millis(),
        iso8601: now,
    };
    match serde_json::to_string(&payload) {
        Ok(json) => {
            call.results.insert("DATE", json);
            true
        }
        Err(e) => call.fail(format!("unable to encode date: {}", e)),
    }
}

/// `sum(int count, double scale)` answers `count * scale`.
fn sum_handler(call: &mut Call<'_>) -> bool {
    let count = match call.param_values(0, "int").as_deref() {
        Ok([Value::Int(n)]) => *n,
        _ => return call.fail("expected an int"),
    };
    let scale = match call.param_values(1, "double").as_deref() {
        Ok([Value::Double(d)]) => *d,
        _ => return call.fail("expected a double"),
    };
    call.results
        .insert("SUM", (f64::from(count) * scale).to_string());
    true
}

/// Receives pushed `{double;double;double}` points and forwards them to
/// the master thread.
fn points_handler(call: &mut Call<'_>) -> bool {
    let values = match call.param_text(0) {
        Some(template) => call.param_values(1, &template),
        None => return false,
    };
    let points = match values {
        Ok(values) => values.len() / 3,
        Err(_) => return false,
    };
    match call.server.shared().get_pointer::<Mailbox>(MASTER_MAILBOX) {
        Some(master) => {
            master.post_message("points", Some(Box::new(points)));
            true
        }
        None => false,
    }
}

fn master(log: Logger, total: Arc<Mutex<usize>>) -> MasterFn {
    Box::new(move |ctx: ThreadContext| {
        let count_log = log.clone();
        ctx.inbox.register_handler("points", move |msg| {
            let n = msg.take_value::<usize>()?;
            let mut total = total.lock().ok()?;
            *total += n;
            debug!(count_log, "received points"; "batch" => n, "total" => *total);
            None::<Payload>
        });
        let handled = ctx.run_mailbox();
        info!(log, "master stopped"; "messages" => handled);
    })
}

fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let app = Application::new(APP, Some(&root_log));
    app.set("PORT", "2030");
    if let Some(path) = matches.value_of("config") {
        if let Err(e) = app.load_config_file(path) {
            error!(root_log, "failed to load configuration"; "err" => %e);
            process::exit(1);
        }
    }
    if let Some(host) = matches.value_of("host") {
        app.set("HOST", host);
    }
    if let Some(port) = matches.value_of("port") {
        app.set("PORT", port);
    }
    if let Err(e) = app.bootstrap_sdd() {
        error!(root_log, "failed to fetch remote configuration"; "err" => %e);
        process::exit(1);
    }

    let registry = Arc::new(CommandRegistry::new());
    registry.create_domain("demo", true);
    registry.load_command("demo::echo", echo_handler, true, true);
    registry.load_command("demo::date", date_handler, true, true);
    registry.load_command("demo::sum", sum_handler, true, true);
    registry.load_command("demo::points", points_handler, true, true);

    let total = Arc::new(Mutex::new(0usize));
    let mut daemon = Daemon::new(Arc::new(app), registry);
    let cleanup_log = root_log.clone();
    daemon.on_cleanup(move |session| {
        debug!(cleanup_log, "connection closed"; "conn" => session.id);
    });

    let master_fn = master(root_log.clone(), Arc::clone(&total));
    if let Err(e) = daemon.bind_daemon(Some(master_fn), None, 0) {
        error!(root_log, "daemon failed"; "err" => %e);
        process::exit(1);
    }
    let total = total.lock().map(|t| *t).unwrap_or(0);
    info!(root_log, "daemon stopped"; "points" => total);
}
