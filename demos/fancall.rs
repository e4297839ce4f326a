// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::Mutex;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{o, Drain, Level, LevelFilter, Logger};

use fan_rpc::Connection;

static APP: &'static str = "fancall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2030;

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making a fan RPC call")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("service")
                .help("Namespace to switch to after connecting")
                .long("service")
                .short("s")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("token")
                .help("Authentication token")
                .long("token")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("cleartext")
                .help("Ask for unencoded response values")
                .long("cleartext")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("method")
                .help("Name of remote RPC method call")
                .long("method")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("Arguments for the call, sent Base64-encoded")
                .multiple(true),
        )
        .get_matches()
}

fn main() {
    let matches = parse_opts(APP.to_string());
    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = value_t!(matches, "port", u16).unwrap_or(DEFAULT_PORT);
    let method = matches.value_of("method").unwrap_or_else(|| {
        eprintln!("Failed to parse method argument as String");
        process::exit(1)
    });
    let args: Vec<&str> = matches
        .values_of("args")
        .map(|v| v.collect())
        .unwrap_or_default();

    let level = if matches.is_present("verbose") {
        Level::Debug
    } else {
        Level::Warning
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!(),
    );

    let mut conn = Connection::new(host, port, Some(&log));
    if let Some(service) = matches.value_of("service") {
        conn = conn.with_service(service);
    }
    if let Some(token) = matches.value_of("token") {
        conn = conn.with_token(token);
    }
    if let Err(e) = conn.connect() {
        eprintln!("Failed to connect to server: {}", e);
        process::exit(1)
    }
    if matches.is_present("cleartext") {
        if let Err(e) = conn.set_clear_text(true) {
            eprintln!("Error: {}", e);
            process::exit(1)
        }
    }

    let ok = conn.rpc(method, &args);
    let mut keys = conn.results().keys();
    keys.sort();
    for key in keys {
        println!("{}={}", key, conn.result(&key).unwrap_or_default());
    }
    conn.disconnect();
    if !ok {
        process::exit(2);
    }
}
