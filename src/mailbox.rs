// Copyright 2020 Joyent, Inc.

//! Intra-process mailboxes for master and worker threads.
//!
//! A `Mailbox` is a FIFO of typed messages guarded by a mutex and a
//! condition variable. Handlers are registered per message type; a
//! handler that returns a value has it posted back to the message's
//! `reply_to` mailbox under its `reply_kind`. Delivered messages are
//! recycled so steady traffic does not reallocate them.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use slog::{debug, o, trace, warn, Drain, Logger};

pub type Payload = Box<dyn Any + Send>;

pub type MessageHandler = dyn Fn(&mut Message) -> Option<Payload> + Send + Sync;

const RECYCLER_LIMIT: usize = 64;

pub struct Message {
    pub kind: String,
    pub value: Option<Payload>,
    pub reply_to: Option<Mailbox>,
    pub reply_kind: Option<String>,
}

impl Message {
    pub fn new(kind: &str, value: Option<Payload>) -> Message {
        Message {
            kind: kind.to_string(),
            value,
            reply_to: None,
            reply_kind: None,
        }
    }

    /// Takes the payload if it holds a `T`, leaving other payloads in place.
    pub fn take_value<T: Any>(&mut self) -> Option<T> {
        match self.value.take()?.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(other) => {
                self.value = Some(other);
                None
            }
        }
    }

    fn clear(&mut self) {
        self.kind.clear();
        self.value = None;
        self.reply_to = None;
        self.reply_kind = None;
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("has_value", &self.value.is_some())
            .field("reply_kind", &self.reply_kind)
            .finish()
    }
}

struct Inner {
    name: String,
    queue: Mutex<VecDeque<Message>>,
    ready: Condvar,
    recycler: Mutex<Vec<Message>>,
    handlers: RwLock<HashMap<String, Arc<MessageHandler>>>,
    log: Logger,
}

#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<Inner>,
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("name", &self.inner.name)
            .field("pending", &self.len())
            .finish()
    }
}

impl Mailbox {
    pub fn new(name: &str, log: Option<&Logger>) -> Mailbox {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("mailbox" => name.to_string()));
        Mailbox {
            inner: Arc::new(Inner {
                name: name.to_string(),
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                recycler: Mutex::new(Vec::new()),
                handlers: RwLock::new(HashMap::new()),
                log,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn blank(&self, kind: &str) -> Message {
        match self.inner.recycler.lock().pop() {
            Some(mut m) => {
                m.kind.push_str(kind);
                m
            }
            None => Message::new(kind, None),
        }
    }

    pub fn post(&self, msg: Message) {
        self.inner.queue.lock().push_back(msg);
        self.inner.ready.notify_one();
    }

    pub fn post_message(&self, kind: &str, value: Option<Payload>) {
        let mut msg = self.blank(kind);
        msg.value = value;
        self.post(msg);
    }

    /// Posts a message whose handler result comes back to `reply_to`
    /// as a `reply_kind` message.
    pub fn post_with_reply(
        &self,
        kind: &str,
        value: Option<Payload>,
        reply_to: &Mailbox,
        reply_kind: &str,
    ) {
        let mut msg = self.blank(kind);
        msg.value = value;
        msg.reply_to = Some(reply_to.clone());
        msg.reply_kind = Some(reply_kind.to_string());
        self.post(msg);
    }

    /// Blocks until a message is available.
    pub fn peek_message(&self) -> Message {
        let mut queue = self.inner.queue.lock();
        loop {
            if let Some(msg) = queue.pop_front() {
                return msg;
            }
            self.inner.ready.wait(&mut queue);
        }
    }

    pub fn peek_message_timeout(&self, timeout: Duration) -> Option<Message> {
        let mut queue = self.inner.queue.lock();
        if queue.is_empty() {
            self.inner.ready.wait_for(&mut queue, timeout);
        }
        queue.pop_front()
    }

    pub fn try_peek_message(&self) -> Option<Message> {
        self.inner.queue.lock().pop_front()
    }

    pub fn register_handler<F>(&self, kind: &str, handler: F)
    where
        F: Fn(&mut Message) -> Option<Payload> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .insert(kind.to_string(), Arc::new(handler));
    }

    /// Returns a delivered message to the pool.
    pub fn recycle(&self, mut msg: Message) {
        msg.clear();
        let mut pool = self.inner.recycler.lock();
        if pool.len() < RECYCLER_LIMIT {
            pool.push(msg);
        }
    }

    /// Runs the handler registered for `msg.kind`. Returns false when no
    /// handler is registered for it.
    pub fn dispatch(&self, mut msg: Message) -> bool {
        let handler = self.inner.handlers.read().get(&msg.kind).cloned();
        let log = &self.inner.log;
        let handled = match handler {
            Some(h) => {
                trace!(log, "delivering"; "kind" => &msg.kind);
                let reply = h(&mut msg);
                match (reply, msg.reply_to.as_ref()) {
                    (Some(value), Some(to)) => {
                        let kind = msg.reply_kind.as_deref().unwrap_or(msg.kind.as_str());
                        debug!(log, "posting reply"; "kind" => kind, "to" => to.name());
                        to.post_message(kind, Some(value));
                    }
                    (Some(_), None) => {
                        debug!(log, "dropping reply with no reply_to"; "kind" => &msg.kind)
                    }
                    (None, _) => (),
                }
                true
            }
            None => {
                warn!(log, "no handler for message"; "kind" => &msg.kind);
                false
            }
        };
        self.recycle(msg);
        handled
    }

    /// Delivers messages until `running` turns false, waking at least
    /// every `poll` to check it. Returns the number of messages handled.
    pub fn run<F: Fn() -> bool>(&self, running: F, poll: Duration) -> usize {
        debug!(self.inner.log, "mailbox loop started");
        let mut handled = 0;
        while running() {
            if let Some(msg) = self.peek_message_timeout(poll) {
                if self.dispatch(msg) {
                    handled += 1;
                }
            }
        }
        debug!(self.inner.log, "mailbox loop stopped"; "handled" => handled);
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    struct Captured(Arc<std::sync::Mutex<Vec<(slog::Level, String)>>>);

    impl Drain for Captured {
        type Ok = ();
        type Err = slog::Never;

        fn log(&self, record: &slog::Record<'_>, _: &slog::OwnedKVList) -> Result<(), slog::Never> {
            self.0
                .lock()
                .unwrap()
                .push((record.level(), record.msg().to_string()));
            Ok(())
        }
    }

    #[test]
    fn unhandled_messages_are_logged() {
        let records = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Logger::root(Captured(Arc::clone(&records)), o!());
        let mb = Mailbox::new("logged", Some(&log));
        mb.register_handler("answer", |_| Some(Box::new(42u32) as Payload));

        assert!(!mb.dispatch(Message::new("unknown", None)));
        assert!(mb.dispatch(Message::new("answer", None)));

        let seen = records.lock().unwrap();
        assert!(seen.contains(&(slog::Level::Warning, "no handler for message".to_string())));
        assert!(seen.contains(&(
            slog::Level::Debug,
            "dropping reply with no reply_to".to_string()
        )));
    }

    #[test]
    fn fifo_order() {
        let mb = Mailbox::new("test", None);
        mb.post_message("a", Some(Box::new(1u32)));
        mb.post_message("b", Some(Box::new(2u32)));
        assert_eq!(mb.len(), 2);

        let mut first = mb.peek_message();
        assert_eq!(first.kind, "a");
        assert_eq!(first.take_value::<String>(), None);
        assert_eq!(first.take_value::<u32>(), Some(1));
        assert_eq!(mb.peek_message().kind, "b");
        assert!(mb.try_peek_message().is_none());
        assert!(mb.peek_message_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn blocks_until_posted() {
        let mb = Mailbox::new("test", None);
        let poster = mb.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            poster.post_message("late", None);
        });
        assert_eq!(mb.peek_message().kind, "late");
        h.join().unwrap();
    }

    #[test]
    fn handlers_reply() {
        let worker = Mailbox::new("worker", None);
        let master = Mailbox::new("master", None);
        worker.register_handler("double", |msg| {
            let n = msg.take_value::<u64>()?;
            Some(Box::new(n * 2) as Payload)
        });

        worker.post_with_reply("double", Some(Box::new(21u64)), &master, "doubled");
        let msg = worker.peek_message();
        assert!(worker.dispatch(msg));

        let mut reply = master.peek_message();
        assert_eq!(reply.kind, "doubled");
        assert_eq!(reply.take_value::<u64>(), Some(42));

        worker.post_message("unknown", None);
        let msg = worker.peek_message();
        assert!(!worker.dispatch(msg));
    }

    #[test]
    fn messages_are_recycled() {
        let mb = Mailbox::new("test", None);
        mb.register_handler("tick", |_| None);
        mb.post_message("tick", None);
        let msg = mb.peek_message();
        mb.dispatch(msg);
        assert_eq!(mb.inner.recycler.lock().len(), 1);

        mb.post_message("tick", None);
        assert_eq!(mb.inner.recycler.lock().len(), 0);
        assert_eq!(mb.peek_message().kind, "tick");
    }

    #[test]
    fn run_stops_when_asked() {
        let mb = Mailbox::new("loop", None);
        let seen = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let counter = Arc::clone(&seen);
        let flag = Arc::clone(&running);
        mb.register_handler("count", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                flag.store(false, Ordering::SeqCst);
            }
            None
        });

        let runner = mb.clone();
        let still = Arc::clone(&running);
        let h = thread::spawn(move || {
            runner.run(move || still.load(Ordering::SeqCst), Duration::from_millis(10))
        });
        for _ in 0..3 {
            mb.post_message("count", None);
        }
        assert_eq!(h.join().unwrap(), 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
