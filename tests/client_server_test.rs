// Copyright 2020 Joyent, Inc.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use slog::{o, Drain, Level, LevelFilter, Logger};

use fan_rpc::b64;
use fan_rpc::mailbox::Payload;
use fan_rpc::protocol::Endian;
use fan_rpc::registry::Call;
use fan_rpc::server::{
    worker_mailbox_key, MasterFn, ServerState, ThreadContext, WorkerFn, MASTER_MAILBOX,
};
use fan_rpc::template::Value;
use fan_rpc::{Application, CommandRegistry, Connection, Daemon, FanError, Mailbox};

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Warning,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    registry: Arc<CommandRegistry>,
    handle: Option<JoinHandle<fan_rpc::Result<()>>>,
}

impl TestServer {
    fn start(app: Application, registry: CommandRegistry) -> TestServer {
        TestServer::start_with(app, registry, None, None, 0)
    }

    fn start_with(
        app: Application,
        registry: CommandRegistry,
        master: Option<MasterFn>,
        worker: Option<WorkerFn>,
        worker_count: usize,
    ) -> TestServer {
        app.set("HOST", "127.0.0.1");
        app.set("PORT", "0");
        app.set("POLLINTERVAL", "50");
        let registry = Arc::new(registry);
        let mut daemon = Daemon::new(Arc::new(app), Arc::clone(&registry));
        let addr = daemon.bind().expect("failed to bind");
        let state = daemon.state();
        let handle = thread::spawn(move || daemon.bind_daemon(master, worker, worker_count));
        TestServer {
            addr,
            state,
            registry,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> Connection {
        let log = test_logger();
        let mut conn = Connection::new("127.0.0.1", self.addr.port(), Some(&log));
        conn.connect().expect("failed to connect");
        conn
    }

    fn stop(&mut self) {
        self.state.shutdown();
        if let Some(handle) = self.handle.take() {
            assert!(handle.join().unwrap().is_ok());
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.handle.is_some() && !thread::panicking() {
            self.stop();
        }
    }
}

fn app(name: &str) -> Application {
    Application::new(name, Some(&test_logger()))
}

fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn echo_handler(call: &mut Call<'_>) -> bool {
    match call.param_text(0) {
        Some(text) => {
            call.results.insert("ECHO", text);
            true
        }
        None => call.fail("nothing to echo"),
    }
}

fn registry_with_echo() -> CommandRegistry {
    let registry = CommandRegistry::new();
    registry.create_domain("test", true);
    registry.load_command("test::echo", echo_handler, true, true);
    registry
}

/// Reads response lines up to and including `EOF`.
fn read_frame(reader: &mut BufReader<TcpStream>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        assert!(reader.read_line(&mut line).unwrap() > 0, "connection closed");
        let line = line.trim_end().to_string();
        let done = line == "EOF";
        lines.push(line);
        if done {
            return lines;
        }
    }
}

#[test]
fn ping_on_the_wire() {
    let server = TestServer::start(app("wire"), CommandRegistry::new());

    let stream = TcpStream::connect(server.addr).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    let greeting = read_frame(&mut reader);
    assert!(greeting.contains(&"RETURN=\"VFJVRQ==\"".to_string()));

    writer.write_all(b"SYS::PING()\n").unwrap();
    let response = read_frame(&mut reader);
    assert!(response.contains(&"RETURN=\"VFJVRQ==\"".to_string()));
    assert_eq!(&response[response.len() - 2..], &["".to_string(), "EOF".to_string()]);

    writer.write_all(b"cleartext\nBOGUS()\n").unwrap();
    read_frame(&mut reader);
    let response = read_frame(&mut reader);
    assert!(response.contains(&"RETURN=\"FALSE\"".to_string()));
    assert!(response.contains(&"RETURNMSG=\"Command not understood\"".to_string()));

    writer.write_all(b"this is (not a command\n").unwrap();
    let response = read_frame(&mut reader);
    assert!(response.contains(&"RETURN=\"FALSE\"".to_string()));

    writer.write_all(b"sys::ping()\n").unwrap();
    let response = read_frame(&mut reader);
    assert!(response.contains(&"RETURNMSG=\"PONG\"".to_string()));

    writer.write_all(b".\n").unwrap();
    let response = read_frame(&mut reader);
    assert!(response.contains(&"RETURN=\"TRUE\"".to_string()));
    let mut rest = String::new();
    assert_eq!(reader.read_line(&mut rest).unwrap(), 0);
}

#[test]
fn unknown_commands_leave_the_connection_usable() {
    let server = TestServer::start(app("unknown"), CommandRegistry::new());
    let mut conn = server.connect();
    assert_eq!(conn.server_endian(), Some(fan_rpc::protocol::Endian::native()));

    assert!(conn.rpc("sys::ping", &[]));
    assert_eq!(conn.result("RETURNMSG").as_deref(), Some("PONG"));

    assert!(!conn.rpc("bogus", &[]));
    assert!(conn.results().check_key("RETURN", "FALSE"));
    assert_eq!(conn.result("RETURNMSG").as_deref(), Some("Command not understood"));
    assert!(conn.is_connected());

    assert!(conn.rpc("sys::ping", &[]));
    assert!(conn.results().get("ECHO").is_none());
}

#[test]
fn disabled_commands_are_not_understood() {
    let server = TestServer::start(app("toggle"), CommandRegistry::new());
    let mut conn = server.connect();

    assert!(server.registry.disable("sys::ping"));
    assert!(!conn.rpc("sys::ping", &[]));
    assert_eq!(conn.result("RETURNMSG").as_deref(), Some("Command not understood"));

    assert!(server.registry.enable("sys::ping"));
    assert!(conn.rpc("sys::ping", &[]));

    assert!(conn.rpc("sys::UnloadCmd", &["sys::ping"]));
    assert!(!conn.rpc("sys::ping", &[]));
    assert!(conn.rpc("sys::LoadCmd", &["sys::ping"]));
    assert!(conn.rpc("sys::ping", &[]));
    assert!(!conn.rpc("sys::LoadCmd", &["sys::nothing"]));
}

#[test]
fn concurrent_connections_do_not_cross_talk() {
    let server = TestServer::start(app("many"), registry_with_echo());
    let port = server.addr.port();

    let clients: Vec<_> = (0..4)
        .map(|c| {
            thread::spawn(move || {
                let mut conn = Connection::new("127.0.0.1", port, None);
                conn.connect().unwrap();
                for i in 0..50 {
                    let text = format!("client {} call {}", c, i);
                    assert!(conn.rpc("test::echo", &[text.as_str()]));
                    assert_eq!(conn.result("ECHO"), Some(text));
                    assert!(conn.rpc("sys::ping", &[]));
                    assert!(conn.result("ECHO").is_none());
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }
}

#[test]
fn clear_text_responses() {
    let server = TestServer::start(app("clear"), registry_with_echo());
    let mut conn = server.connect();

    assert_eq!(conn.set_clear_text(true).unwrap(), true);
    assert!(conn.rpc("test::echo", &["plain words"]));
    assert_eq!(conn.result("ECHO").as_deref(), Some("plain words"));

    assert_eq!(conn.set_clear_text(false).unwrap(), true);
    assert!(conn.rpc("test::echo", &["encoded again"]));
    assert_eq!(conn.result("ECHO").as_deref(), Some("encoded again"));
}

#[test]
fn typed_parameters() {
    let registry = CommandRegistry::new();
    registry.load_command(
        "math::scale",
        |call| {
            let count = match call.param_values(0, "int").as_deref() {
                Ok([Value::Int(n)]) => *n,
                _ => return call.fail("bad int"),
            };
            let scale = match call.param_values(1, "double").as_deref() {
                Ok([Value::Double(d)]) => *d,
                _ => return call.fail("bad double"),
            };
            call.results
                .insert("RESULT", (f64::from(count) * scale).to_string());
            true
        },
        true,
        true,
    );
    let server = TestServer::start(app("typed"), registry);
    let mut conn = server.connect();

    assert!(conn.vrpc("math::scale", "int;double", &[Value::Int(6), Value::Double(2.5)]));
    assert_eq!(conn.result("RESULT").as_deref(), Some("15"));

    assert!(!conn.vrpc("math::scale", "double;double", &[Value::Double(1.0), Value::Double(2.0)]));
    assert_eq!(conn.result("RETURNMSG").as_deref(), Some("bad int"));

    assert!(!conn.vrpc("math::scale", "int;double", &[Value::Int(1)]));
    assert!(conn.is_connected());
}

#[test]
fn binary_push() {
    let sum = Arc::new(Mutex::new(0.0f64));
    let batches = Arc::new(AtomicUsize::new(0));

    let registry = CommandRegistry::new();
    let (total, seen) = (Arc::clone(&sum), Arc::clone(&batches));
    registry.load_command(
        "data::points",
        move |call| {
            let template = match call.param_text(0) {
                Some(t) => t,
                None => return false,
            };
            let values = match call.param_values(1, &template) {
                Ok(values) => values,
                Err(_) => return false,
            };
            let mut total = total.lock().unwrap();
            for v in values {
                if let Value::Double(d) = v {
                    *total += d;
                }
            }
            seen.fetch_add(1, Ordering::SeqCst);
            true
        },
        true,
        true,
    );
    let server = TestServer::start(app("push"), registry);
    let mut conn = server.connect();

    let points: Vec<Value> = (1..=6).map(|i| Value::Double(f64::from(i))).collect();
    conn.start_binary_push("data::points").unwrap();
    assert!(conn.rpc("sys::ping", &[]) == false);
    for _ in 0..3 {
        conn.binary_push_values("{double;double;double}[2]", &points).unwrap();
    }
    assert!(conn.binary_push("int", &[1, 2]).is_err());
    assert!(conn.stop_binary_push().unwrap());
    assert_eq!(batches.load(Ordering::SeqCst), 3);
    assert_eq!(*sum.lock().unwrap(), 63.0);

    conn.start_binary_push("data::nothing").unwrap();
    conn.binary_push_values("int", &[Value::Int(3)]).unwrap();
    assert!(!conn.stop_binary_push().unwrap());
    assert_eq!(batches.load(Ordering::SeqCst), 3);

    assert!(conn.rpc("sys::ping", &[]));
}

#[test]
fn namespaces_and_help() {
    let server = TestServer::start(app("names"), registry_with_echo());
    let mut conn = server.connect();

    assert!(!conn.rpc("echo", &["x"]));
    assert!(conn.rpc("use", &["test"]));
    assert!(conn.rpc("echo", &["x"]));
    assert_eq!(conn.result("ECHO").as_deref(), Some("x"));
    assert!(conn.rpc("ping", &[]) == false);
    assert!(conn.rpc("sys::ping", &[]));

    assert!(conn.rpc("help", &[]));
    assert_eq!(conn.result("COUNT").as_deref(), Some("3"));
    assert_eq!(conn.result("COMMAND.0").as_deref(), Some("TEST::ECHO"));

    assert!(conn.rpc("sys::use", &[]));
    assert!(conn.rpc("ping", &[]));
    assert!(conn.rpc("help", &[]));
    let count: usize = conn.results().get_parsed("COUNT").unwrap();
    assert!(count >= 10);

    assert!(!conn.rpc("use", &["nowhere"]));
    assert!(conn.rpc("use", &["test"]));
    assert!(!conn.rpc("ping", &[]));

    let mut scoped = Connection::new("127.0.0.1", server.addr.port(), None).with_service("test");
    scoped.connect().unwrap();
    assert!(scoped.rpc("echo", &["y"]));

    let mut lost = Connection::new("127.0.0.1", server.addr.port(), None).with_service("nowhere");
    match lost.connect() {
        Err(FanError::Rejected { call, .. }) => assert_eq!(call, "use"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!lost.is_connected());
}

#[test]
fn sys_commands() {
    let server = TestServer::start(app("sys"), CommandRegistry::new());
    let mut conn = server.connect();

    assert!(conn.rpc("sys::status", &[]));
    assert_eq!(conn.result("CONNECTIONS").as_deref(), Some("1"));
    let status: serde_json::Value =
        serde_json::from_str(&conn.result("STATUS").unwrap()).unwrap();
    assert_eq!(status["name"], "sys");

    assert!(conn.rpc("sys::uptime", &[]));
    assert!(conn.result("STARTED").unwrap().ends_with('Z'));

    assert!(!conn.rpc("sys::setBufferSize", &["512"]));
    assert!(conn.rpc("sys::setBufferSize", &["2048"]));
    let long = "z".repeat(1000);
    assert!(conn.rpc("sys::ping", &[long.as_str()]));
    let too_long = "z".repeat(4000);
    assert!(!conn.rpc("sys::ping", &[too_long.as_str()]));
    assert!(!conn.is_connected());
}

#[test]
fn halt_and_shutdown() {
    let cleaned = Arc::new(AtomicUsize::new(0));
    let mut server = TestServer::start(app("halt"), CommandRegistry::new());

    let count = Arc::clone(&cleaned);
    server.state.on_cleanup(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    let mut first = server.connect();
    first.disconnect();
    assert!(wait_for(|| cleaned.load(Ordering::SeqCst) == 1));

    let mut idle = server.connect();
    let mut halter = server.connect();
    assert!(halter.rpc("sys::halt", &[]));
    assert!(!server.state.is_running());
    server.stop();

    // the idle connection is closed within a poll interval
    assert!(wait_for(|| server.state.connections() == 0));
    assert!(!idle.rpc("sys::ping", &[]));
    assert!(!idle.is_connected());
    assert!(wait_for(|| cleaned.load(Ordering::SeqCst) == 3));
    assert!(TcpStream::connect(server.addr).is_err());
}

#[test]
fn access_control() {
    let secured = app("secured");
    secured.set("AUTH.TOKEN", "secret");
    let mut server = TestServer::start(secured, CommandRegistry::new());

    let mut anon = server.connect();
    assert!(anon.rpc("sys::ping", &[]));
    assert!(!anon.rpc("sys::halt", &[]));
    assert_eq!(anon.result("RETURNMSG").as_deref(), Some("Access denied"));
    assert!(!anon.rpc("sys::auth", &["guess"]));
    assert!(server.state.is_running());

    let mut wrong = Connection::new("127.0.0.1", server.addr.port(), None).with_token("guess");
    assert!(wrong.connect().is_err());

    let mut admin = Connection::new("127.0.0.1", server.addr.port(), None).with_token("secret");
    admin.connect().unwrap();
    assert!(admin.rpc("sys::halt", &[]));
    server.stop();
}

#[test]
fn sdd_bootstrap() {
    let registry = CommandRegistry::new();
    registry.create_domain("sdd", true);
    registry.load_command(
        "sdd::config",
        |call| match call.param_text(0) {
            Some(name) => {
                call.results.insert("DB.HOST", "db.example");
                call.results.insert("REQUESTED.BY", name);
                call.ok("config")
            }
            None => call.fail("who is asking?"),
        },
        true,
        true,
    );
    let server = TestServer::start(app("sdd"), registry);

    let node = app("node");
    node.set("SDD.HOST", "127.0.0.1");
    node.set("SDD.PORT", server.addr.port().to_string());
    assert!(node.bootstrap_sdd().unwrap());
    assert_eq!(node.config().get("db.host").as_deref(), Some("db.example"));
    assert_eq!(node.config().get("REQUESTED.BY").as_deref(), Some("node"));
    assert!(!node.config().contains("RETURN"));
    assert!(!node.config().contains("RETURNMSG"));

    node.set("SDD.COMMAND", "sdd::missing");
    match node.bootstrap_sdd() {
        Err(FanError::Rejected { message, .. }) => assert_eq!(message, "Command not understood"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn master_and_workers() {
    let master_saw = Arc::new(AtomicUsize::new(0));
    let workers_saw_master = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&master_saw);
    let master: MasterFn = Box::new(move |ctx: ThreadContext| {
        let seen = Arc::clone(&seen);
        ctx.inbox.register_handler("squared", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            None
        });
        ctx.run_mailbox();
    });

    let found = Arc::clone(&workers_saw_master);
    let worker: WorkerFn = Arc::new(move |ctx: ThreadContext| {
        if ctx.store.get_pointer::<Mailbox>(MASTER_MAILBOX).is_some() && ctx.worker.is_some() {
            found.fetch_add(1, Ordering::SeqCst);
        }
        ctx.inbox.register_handler("square", |msg| {
            let n = msg.take_value::<u64>()?;
            Some(Box::new(n * n) as Payload)
        });
        ctx.run_mailbox();
    });

    let registry = CommandRegistry::new();
    registry.load_command(
        "work::square",
        |call| {
            let n: u64 = match call.param_text(0).and_then(|s| s.parse().ok()) {
                Some(n) => n,
                None => return call.fail("expected a number"),
            };
            let shared = call.server.shared();
            let worker = match shared.get_pointer::<Mailbox>(&worker_mailbox_key(n as usize % 2)) {
                Some(w) => w,
                None => return call.fail("no worker"),
            };
            let master = match shared.get_pointer::<Mailbox>(MASTER_MAILBOX) {
                Some(m) => m,
                None => return call.fail("no master"),
            };
            let reply = Mailbox::new("reply", Some(call.server.log()));
            worker.post_with_reply("square", Some(Box::new(n)), &reply, "squared");
            let mut answer = match reply.peek_message_timeout(Duration::from_secs(5)) {
                Some(msg) => msg,
                None => return call.fail("no answer"),
            };
            let square = answer.take_value::<u64>().unwrap_or(0);
            master.post_message("squared", None);
            call.results.insert("SQUARE", square.to_string());
            true
        },
        true,
        true,
    );

    let mut server =
        TestServer::start_with(app("pool"), registry, Some(master), Some(worker), 2);
    let mut conn = server.connect();
    for n in 1..=6u64 {
        assert!(conn.rpc("work::square", &[n.to_string().as_str()]));
        assert_eq!(conn.result("SQUARE"), Some((n * n).to_string()));
    }
    assert!(wait_for(|| master_saw.load(Ordering::SeqCst) == 6));
    assert_eq!(workers_saw_master.load(Ordering::SeqCst), 2);

    // stop() joins master and workers, so their loops must notice
    server.stop();
}

#[test]
fn calls_fail_fast_once_the_server_is_gone() {
    let mut server = TestServer::start(app("gone"), CommandRegistry::new());
    let port = server.addr.port();
    let mut conn = server.connect();
    server.stop();

    assert!(!conn.rpc("sys::ping", &[]));
    assert!(!conn.is_connected());
    assert!(!conn.rpc("sys::ping", &[]));

    let mut late = Connection::new("127.0.0.1", port, None).with_attempts(2);
    assert!(late.connect().is_err());
    assert!(!late.is_connected());
}

fn swapped<T: AsRef<[u8]>>(bytes: T) -> Vec<u8> {
    let mut v = bytes.as_ref().to_vec();
    v.reverse();
    v
}

fn opposite(endian: Endian) -> Endian {
    match endian {
        Endian::Little => Endian::Big,
        Endian::Big => Endian::Little,
    }
}

#[test]
fn foreign_byte_order_is_corrected() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    let registry = CommandRegistry::new();
    let typed = Arc::clone(&seen);
    registry.load_command(
        "data::typed",
        move |call| {
            let mut values = match call.param_values(0, "int") {
                Ok(values) => values,
                Err(_) => return call.fail("bad int"),
            };
            match call.param_values(1, "double") {
                Ok(more) => values.extend(more),
                Err(_) => return call.fail("bad double"),
            }
            typed.lock().unwrap().extend(values);
            true
        },
        true,
        true,
    );
    let pushed = Arc::clone(&seen);
    registry.load_command(
        "data::points",
        move |call| {
            let template = match call.param_text(0) {
                Some(t) => t,
                None => return false,
            };
            match call.param_values(1, &template) {
                Ok(values) => {
                    pushed.lock().unwrap().extend(values);
                    true
                }
                Err(_) => false,
            }
        },
        true,
        true,
    );
    let server = TestServer::start(app("foreign"), registry);

    let stream = TcpStream::connect(server.addr).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    read_frame(&mut reader);

    let foreign = opposite(Endian::native());
    writeln!(
        writer,
        "SYS::ENDIAN(\"{}\")",
        b64::encode_value(foreign.as_str().as_bytes())
    )
    .unwrap();
    let response = read_frame(&mut reader);
    assert!(response.contains(&"RETURN=\"VFJVRQ==\"".to_string()));

    writeln!(
        writer,
        "DATA::TYPED(\"{}\",\"{}\")",
        b64::encode_value(&swapped(42i32.to_ne_bytes())),
        b64::encode_value(&swapped(2.5f64.to_ne_bytes()))
    )
    .unwrap();
    let response = read_frame(&mut reader);
    assert!(response.contains(&"RETURN=\"VFJVRQ==\"".to_string()));

    writeln!(writer, "BINARYPUSH(\"{}\")", b64::encode_value(b"data::points")).unwrap();
    let mut batch = b"int;double\n".to_vec();
    batch.extend(swapped((-7i32).to_ne_bytes()));
    batch.extend(swapped(0.125f64.to_ne_bytes()));
    batch.extend_from_slice(b"\n");
    writer.write_all(&batch).unwrap();
    let mut ack = [0u8; 1];
    reader.read_exact(&mut ack).unwrap();
    assert_eq!(ack, [1]);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Value::Int(42),
            Value::Double(2.5),
            Value::Int(-7),
            Value::Double(0.125)
        ]
    );
}

#[test]
fn oversized_or_malformed_push_batches_are_refused() {
    let received = Arc::new(AtomicUsize::new(0));
    let registry = CommandRegistry::new();
    let count = Arc::clone(&received);
    registry.load_command(
        "sink::bytes",
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            true
        },
        true,
        true,
    );
    let sink = app("sink");
    sink.set("BUFFERSIZE", "1024");
    let server = TestServer::start(sink, registry);

    let mut conn = server.connect();
    conn.start_binary_push("sink::bytes").unwrap();
    conn.binary_push("byte[1000]", &[7u8; 1000]).unwrap();
    assert!(conn.stop_binary_push().unwrap());
    assert_eq!(received.load(Ordering::SeqCst), 1);

    let mut big = server.connect();
    big.start_binary_push("sink::bytes").unwrap();
    let _ = big.binary_push("byte[2000]", &[7u8; 2000]);
    assert!(!matches!(big.stop_binary_push(), Ok(true)));

    for header in &[
        "byte[1000000000000000]",
        "{int[4611686018427387904]}[8]",
        "int[",
        "quad",
    ] {
        let stream = TcpStream::connect(server.addr).unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);
        read_frame(&mut reader);

        writeln!(writer, "BINARYPUSH(\"{}\")", b64::encode_value(b"sink::bytes")).unwrap();
        writeln!(writer, "{}", header).unwrap();
        let mut ack = [0u8; 1];
        reader.read_exact(&mut ack).unwrap();
        assert_eq!(ack, [0], "header {}", header);

        // the connection is closed after the refusal
        let mut rest = String::new();
        assert!(!matches!(reader.read_line(&mut rest), Ok(n) if n > 0));
    }

    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert!(conn.rpc("sys::ping", &[]));
    assert!(server.state.is_running());
}

#[test]
fn sentinel_named_results_keep_the_framing() {
    let registry = CommandRegistry::new();
    registry.load_command(
        "disk::check",
        |call| {
            call.results.insert("error", "disk full");
            call.results.insert("Eof", "soon");
            call.fail("check failed")
        },
        true,
        true,
    );
    let server = TestServer::start(app("sentinel"), registry);
    let mut conn = server.connect();

    assert!(!conn.rpc("disk::check", &[]));
    assert!(conn.results().check_key("RETURN", "FALSE"));
    assert_eq!(conn.result("ERROR").as_deref(), Some("disk full"));
    assert_eq!(conn.result("EOF").as_deref(), Some("soon"));
    assert_eq!(conn.result("RETURNMSG").as_deref(), Some("check failed"));

    assert!(conn.rpc("sys::ping", &[]));
    assert_eq!(conn.result("RETURNMSG").as_deref(), Some("PONG"));
    assert!(conn.result("ERROR").is_none());

    assert_eq!(conn.set_clear_text(true).unwrap(), true);
    assert!(!conn.rpc("disk::check", &[]));
    assert_eq!(conn.result("ERROR").as_deref(), Some("disk full"));
    assert!(conn.rpc("sys::ping", &[]));
    assert_eq!(conn.result("RETURNMSG").as_deref(), Some("PONG"));
}
