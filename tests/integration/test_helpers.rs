// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests.
//!
//! `FakeServer` is a small in-process RESP server built on the client's own
//! codec. It keeps strings and hashes in memory, supports MULTI/EXEC and
//! pub/sub, records every command it receives, and can inject faults:
//! dropping the socket on a given command, never answering a command, or
//! killing every open connection.

#![allow(dead_code)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use spinel_client::Reply;
use spinel_client::config::ClientConfig;
use spinel_client::connection::backoff::BackoffPolicy;
use spinel_client::core::protocol::ReplyCodec;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing_subscriber::EnvFilter;
use wildmatch::WildMatch;

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

/// One command as the server saw it.
#[derive(Debug, Clone)]
pub struct LoggedCommand {
    pub connection: usize,
    pub parts: Vec<String>,
}

impl LoggedCommand {
    pub fn name(&self) -> &str {
        self.parts.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Default)]
struct Store {
    strings: HashMap<Bytes, Bytes>,
    hashes: HashMap<Bytes, HashMap<Bytes, Bytes>>,
    ttls: HashMap<Bytes, i64>,
}

#[derive(Default)]
struct Subscriptions {
    channels: HashSet<String>,
    patterns: HashSet<String>,
}

impl Subscriptions {
    fn count(&self) -> usize {
        self.channels.len() + self.patterns.len()
    }
}

struct Shared {
    password: Option<String>,
    store: Mutex<Store>,
    log: Mutex<Vec<LoggedCommand>>,
    accepted: AtomicUsize,
    drop_on: Mutex<HashMap<String, usize>>,
    stall_on: Mutex<HashSet<String>>,
    abort_next_exec: AtomicBool,
    subscriptions: Mutex<HashMap<usize, Subscriptions>>,
    publish_tx: broadcast::Sender<(String, Bytes)>,
}

/// A running fake server. Dropping it stops accepting and closes every
/// connection.
pub struct FakeServer {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
    kill_tx: watch::Sender<u64>,
    accept_task: JoinHandle<()>,
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl FakeServer {
    pub async fn start() -> Self {
        Self::start_with_password(None).await
    }

    pub async fn start_with_password(password: Option<&str>) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (publish_tx, _) = broadcast::channel(1024);
        let shared = Arc::new(Shared {
            password: password.map(str::to_string),
            store: Mutex::new(Store::default()),
            log: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            drop_on: Mutex::new(HashMap::new()),
            stall_on: Mutex::new(HashSet::new()),
            abort_next_exec: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
            publish_tx,
        });
        let (kill_tx, kill_rx) = watch::channel(0u64);

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let id = accept_shared.accepted.fetch_add(1, Ordering::SeqCst) + 1;
                let shared = accept_shared.clone();
                let kill_rx = kill_rx.clone();
                tokio::spawn(handle_connection(socket, id, shared, kill_rx));
            }
        });

        Self {
            addr,
            shared,
            kill_tx,
            accept_task,
        }
    }

    /// A config pointing at this server with fast, deterministic retries.
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new("127.0.0.1", self.addr.port());
        config.backoff = BackoffPolicy::None;
        config.max_retry_count = 3;
        config.connect_timeout = Some(Duration::from_secs(2));
        config
    }

    /// Number of connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Every command received, in arrival order.
    pub fn commands(&self) -> Vec<LoggedCommand> {
        self.shared.log.lock().unwrap().clone()
    }

    /// The parts of every command with the given name.
    pub fn commands_named(&self, name: &str) -> Vec<Vec<String>> {
        self.commands()
            .into_iter()
            .filter(|c| c.name().eq_ignore_ascii_case(name))
            .map(|c| c.parts)
            .collect()
    }

    /// The commands received on one connection (ids start at 1).
    pub fn commands_on(&self, connection: usize) -> Vec<Vec<String>> {
        self.commands()
            .into_iter()
            .filter(|c| c.connection == connection)
            .map(|c| c.parts)
            .collect()
    }

    /// Closes the socket without answering the next `times` commands named `name`.
    pub fn drop_on(&self, name: &str, times: usize) {
        self.shared
            .drop_on
            .lock()
            .unwrap()
            .insert(name.to_ascii_uppercase(), times);
    }

    /// Never answers commands named `name`.
    pub fn stall_on(&self, name: &str) {
        self.shared
            .stall_on
            .lock()
            .unwrap()
            .insert(name.to_ascii_uppercase());
    }

    /// Makes the next `EXEC` return a nil array, as after a failed `WATCH`.
    pub fn abort_next_exec(&self) {
        self.shared.abort_next_exec.store(true, Ordering::SeqCst);
    }

    /// Closes every open connection. New connections are still accepted.
    pub fn kill_connections(&self) {
        self.kill_tx.send_modify(|generation| *generation += 1);
    }

    /// Reads a string key directly from the store.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.shared
            .store
            .lock()
            .unwrap()
            .strings
            .get(key.as_bytes())
            .cloned()
    }

    /// Waits until at least `n` connections have been accepted.
    pub async fn wait_for_connections(&self, n: usize) {
        for _ in 0..200 {
            if self.connection_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server never accepted {n} connections");
    }

    /// Waits until `channel` has at least `n` subscriptions matching it.
    pub async fn wait_for_subscribers(&self, channel: &str, n: usize) {
        for _ in 0..200 {
            if self.shared.publish_count(channel) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no {n} subscribers on {channel}");
    }
}

impl Shared {
    fn record(&self, connection: usize, parts: &[Bytes]) {
        let parts = parts
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let text = String::from_utf8_lossy(p).into_owned();
                if i == 0 { text.to_ascii_uppercase() } else { text }
            })
            .collect();
        self.log
            .lock()
            .unwrap()
            .push(LoggedCommand { connection, parts });
    }

    fn should_drop(&self, name: &str) -> bool {
        let mut drop_on = self.drop_on.lock().unwrap();
        match drop_on.get_mut(name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn should_stall(&self, name: &str) -> bool {
        self.stall_on.lock().unwrap().contains(name)
    }

    fn publish_count(&self, channel: &str) -> usize {
        self.subscriptions
            .lock()
            .unwrap()
            .values()
            .map(|subs| {
                let direct = usize::from(subs.channels.contains(channel));
                let by_pattern = subs
                    .patterns
                    .iter()
                    .filter(|p| WildMatch::new(p).matches(channel))
                    .count();
                direct + by_pattern
            })
            .sum()
    }
}

#[derive(Default)]
struct Session {
    authenticated: bool,
    multi: Option<Vec<Vec<Bytes>>>,
    multi_dirty: bool,
}

async fn handle_connection(
    socket: TcpStream,
    id: usize,
    shared: Arc<Shared>,
    mut kill_rx: watch::Receiver<u64>,
) {
    let mut framed = Framed::new(socket, ReplyCodec);
    let mut publish_rx = shared.publish_tx.subscribe();
    let mut session = Session {
        authenticated: shared.password.is_none(),
        ..Session::default()
    };
    kill_rx.borrow_and_update();

    'conn: loop {
        tokio::select! {
            _ = kill_rx.changed() => break 'conn,
            published = publish_rx.recv() => {
                let Ok((channel, payload)) = published else { continue };
                for frame in deliveries(&shared, id, &channel, &payload) {
                    if framed.send(frame).await.is_err() {
                        break 'conn;
                    }
                }
            }
            frame = framed.next() => {
                let Some(Ok(frame)) = frame else { break 'conn };
                let Some(parts) = command_parts(frame) else { break 'conn };
                shared.record(id, &parts);
                let name = String::from_utf8_lossy(&parts[0]).to_ascii_uppercase();
                if shared.should_drop(&name) {
                    break 'conn;
                }
                if shared.should_stall(&name) {
                    continue;
                }
                for reply in execute(&shared, id, &mut session, &name, &parts[1..]) {
                    if framed.send(reply).await.is_err() {
                        break 'conn;
                    }
                }
            }
        }
    }
    shared.subscriptions.lock().unwrap().remove(&id);
}

fn command_parts(frame: Reply) -> Option<Vec<Bytes>> {
    let Reply::Array(Some(items)) = frame else {
        return None;
    };
    let parts: Vec<Bytes> = items
        .into_iter()
        .map(|item| match item {
            Reply::Bulk(Some(b)) => Some(b),
            _ => None,
        })
        .collect::<Option<_>>()?;
    if parts.is_empty() { None } else { Some(parts) }
}

fn deliveries(shared: &Shared, id: usize, channel: &str, payload: &Bytes) -> Vec<Reply> {
    let subscriptions = shared.subscriptions.lock().unwrap();
    let Some(subs) = subscriptions.get(&id) else {
        return Vec::new();
    };
    let mut frames = Vec::new();
    if subs.channels.contains(channel) {
        frames.push(Reply::array(vec![
            bulk("message"),
            bulk(channel),
            Reply::bulk(payload.clone()),
        ]));
    }
    for pattern in &subs.patterns {
        if WildMatch::new(pattern).matches(channel) {
            frames.push(Reply::array(vec![
                bulk("pmessage"),
                bulk(pattern),
                bulk(channel),
                Reply::bulk(payload.clone()),
            ]));
        }
    }
    frames
}

fn bulk(s: &str) -> Reply {
    Reply::bulk(Bytes::copy_from_slice(s.as_bytes()))
}

fn ok() -> Reply {
    Reply::Status("OK".to_string())
}

fn err(msg: &str) -> Reply {
    Reply::Error(msg.to_string())
}

fn text(b: &Bytes) -> String {
    String::from_utf8_lossy(b).into_owned()
}

const KNOWN_COMMANDS: &[&str] = &[
    "PING", "ECHO", "SET", "GET", "DEL", "EXISTS", "INCR", "INCRBY", "EXPIRE", "TTL", "MGET",
    "HSET", "HGET", "PUBLISH", "SELECT", "CLIENT",
];

fn execute(
    shared: &Shared,
    id: usize,
    session: &mut Session,
    name: &str,
    args: &[Bytes],
) -> Vec<Reply> {
    if name == "AUTH" {
        return vec![auth(shared, session, args)];
    }
    if !session.authenticated {
        return vec![err("NOAUTH Authentication required.")];
    }

    if session.multi.is_some() {
        return vec![execute_in_multi(shared, session, name, args)];
    }

    match name {
        "MULTI" => {
            session.multi = Some(Vec::new());
            vec![ok()]
        }
        "EXEC" => vec![err("ERR EXEC without MULTI")],
        "DISCARD" => vec![err("ERR DISCARD without MULTI")],
        "SUBSCRIBE" | "PSUBSCRIBE" => subscribe(shared, id, name, args),
        "UNSUBSCRIBE" | "PUNSUBSCRIBE" => unsubscribe(shared, id, name, args),
        "PING" if shared.subscriptions.lock().unwrap().contains_key(&id) => {
            vec![Reply::array(vec![bulk("pong"), bulk("")])]
        }
        _ => vec![run_simple(shared, name, args)],
    }
}

fn execute_in_multi(shared: &Shared, session: &mut Session, name: &str, args: &[Bytes]) -> Reply {
    match name {
        "EXEC" => {
            let queued = session.multi.take().unwrap_or_default();
            if std::mem::take(&mut session.multi_dirty) {
                return err("EXECABORT Transaction discarded because of previous errors.");
            }
            if shared.abort_next_exec.swap(false, Ordering::SeqCst) {
                return Reply::Array(None);
            }
            let results = queued
                .into_iter()
                .map(|parts| {
                    let name = text(&parts[0]).to_ascii_uppercase();
                    run_simple(shared, &name, &parts[1..])
                })
                .collect();
            Reply::array(results)
        }
        "DISCARD" => {
            session.multi = None;
            session.multi_dirty = false;
            ok()
        }
        "MULTI" => err("ERR MULTI calls can not be nested"),
        _ if KNOWN_COMMANDS.contains(&name) => {
            let mut parts = vec![Bytes::copy_from_slice(name.as_bytes())];
            parts.extend(args.iter().cloned());
            if let Some(queue) = session.multi.as_mut() {
                queue.push(parts);
            }
            Reply::Status("QUEUED".to_string())
        }
        _ => {
            session.multi_dirty = true;
            err(&format!("ERR unknown command '{}'", name.to_lowercase()))
        }
    }
}

fn auth(shared: &Shared, session: &mut Session, args: &[Bytes]) -> Reply {
    let Some(expected) = &shared.password else {
        return err(
            "ERR AUTH <password> called without any password configured for the default user.",
        );
    };
    let given = match args {
        [password] | [_, password] => text(password),
        _ => return err("ERR wrong number of arguments for 'auth' command"),
    };
    if &given == expected {
        session.authenticated = true;
        ok()
    } else {
        err("WRONGPASS invalid username-password pair or user is disabled.")
    }
}

fn subscribe(shared: &Shared, id: usize, name: &str, args: &[Bytes]) -> Vec<Reply> {
    let kind = name.to_ascii_lowercase();
    let mut subscriptions = shared.subscriptions.lock().unwrap();
    let subs = subscriptions.entry(id).or_default();
    let mut replies = Vec::with_capacity(args.len());
    for arg in args {
        let target = text(arg);
        if name == "SUBSCRIBE" {
            subs.channels.insert(target.clone());
        } else {
            subs.patterns.insert(target.clone());
        }
        replies.push(Reply::array(vec![
            bulk(&kind),
            bulk(&target),
            Reply::Integer(subs.count() as i64),
        ]));
    }
    replies
}

fn unsubscribe(shared: &Shared, id: usize, name: &str, args: &[Bytes]) -> Vec<Reply> {
    let kind = name.to_ascii_lowercase();
    let mut subscriptions = shared.subscriptions.lock().unwrap();
    let subs = subscriptions.entry(id).or_default();

    let current: Vec<String> = if name == "UNSUBSCRIBE" {
        subs.channels.iter().cloned().collect()
    } else {
        subs.patterns.iter().cloned().collect()
    };
    let targets: Vec<String> = if args.is_empty() {
        current
    } else {
        args.iter().map(text).collect()
    };

    if targets.is_empty() {
        return vec![Reply::array(vec![
            bulk(&kind),
            Reply::Bulk(None),
            Reply::Integer(subs.count() as i64),
        ])];
    }

    let mut replies = Vec::with_capacity(targets.len());
    for target in targets {
        if name == "UNSUBSCRIBE" {
            subs.channels.remove(&target);
        } else {
            subs.patterns.remove(&target);
        }
        replies.push(Reply::array(vec![
            bulk(&kind),
            bulk(&target),
            Reply::Integer(subs.count() as i64),
        ]));
    }
    replies
}

fn run_simple(shared: &Shared, name: &str, args: &[Bytes]) -> Reply {
    if let ("PUBLISH", [channel, payload]) = (name, args) {
        let channel = text(channel);
        let count = shared.publish_count(&channel);
        let _ = shared.publish_tx.send((channel, payload.clone()));
        return Reply::Integer(count as i64);
    }

    let mut store = shared.store.lock().unwrap();
    match (name, args) {
        ("PING", []) => Reply::Status("PONG".to_string()),
        ("PING", [msg]) | ("ECHO", [msg]) => Reply::bulk(msg.clone()),
        ("SELECT", [db]) => match text(db).parse::<u32>() {
            Ok(n) if n < 16 => ok(),
            _ => err("ERR DB index is out of range"),
        },
        ("CLIENT", [sub, _name]) if text(sub).eq_ignore_ascii_case("SETNAME") => ok(),
        ("SET", [key, value, rest @ ..]) => {
            let ttl = match rest {
                [] => None,
                [unit, amount] if text(unit).eq_ignore_ascii_case("PX") => {
                    match text(amount).parse::<i64>() {
                        Ok(ms) => Some((ms + 999) / 1000),
                        Err(_) => return err("ERR value is not an integer or out of range"),
                    }
                }
                _ => return err("ERR syntax error"),
            };
            store.strings.insert(key.clone(), value.clone());
            store.hashes.remove(key);
            match ttl {
                Some(secs) => store.ttls.insert(key.clone(), secs),
                None => store.ttls.remove(key),
            };
            ok()
        }
        ("GET", [key]) => {
            if store.hashes.contains_key(key) {
                return wrongtype();
            }
            Reply::Bulk(store.strings.get(key).cloned())
        }
        ("MGET", keys) if !keys.is_empty() => Reply::array(
            keys.iter()
                .map(|k| Reply::Bulk(store.strings.get(k).cloned()))
                .collect(),
        ),
        ("DEL", keys) if !keys.is_empty() => {
            let mut removed = 0;
            for key in keys {
                let had_string = store.strings.remove(key).is_some();
                let had_hash = store.hashes.remove(key).is_some();
                store.ttls.remove(key);
                if had_string || had_hash {
                    removed += 1;
                }
            }
            Reply::Integer(removed)
        }
        ("EXISTS", keys) if !keys.is_empty() => Reply::Integer(
            keys.iter()
                .filter(|k| store.strings.contains_key(*k) || store.hashes.contains_key(*k))
                .count() as i64,
        ),
        ("INCR", [key]) => incr_by(&mut store, key, 1),
        ("INCRBY", [key, delta]) => match text(delta).parse::<i64>() {
            Ok(delta) => incr_by(&mut store, key, delta),
            Err(_) => err("ERR value is not an integer or out of range"),
        },
        ("EXPIRE", [key, secs]) => {
            let exists = store.strings.contains_key(key) || store.hashes.contains_key(key);
            match text(secs).parse::<i64>() {
                Ok(secs) if exists => {
                    store.ttls.insert(key.clone(), secs);
                    Reply::Integer(1)
                }
                Ok(_) => Reply::Integer(0),
                Err(_) => err("ERR value is not an integer or out of range"),
            }
        }
        ("TTL", [key]) => {
            let exists = store.strings.contains_key(key) || store.hashes.contains_key(key);
            match (exists, store.ttls.get(key)) {
                (false, _) => Reply::Integer(-2),
                (true, None) => Reply::Integer(-1),
                (true, Some(secs)) => Reply::Integer(*secs),
            }
        }
        ("HSET", [key, field, value]) => {
            if store.strings.contains_key(key) {
                return wrongtype();
            }
            let hash = store.hashes.entry(key.clone()).or_default();
            let added = hash.insert(field.clone(), value.clone()).is_none();
            Reply::Integer(i64::from(added))
        }
        ("HGET", [key, field]) => Reply::Bulk(
            store
                .hashes
                .get(key)
                .and_then(|h| h.get(field))
                .cloned(),
        ),
        (name, _) if KNOWN_COMMANDS.contains(&name) => err(&format!(
            "ERR wrong number of arguments for '{}' command",
            name.to_lowercase()
        )),
        (name, _) => err(&format!("ERR unknown command '{}'", name.to_lowercase())),
    }
}

fn wrongtype() -> Reply {
    err("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn incr_by(store: &mut Store, key: &Bytes, delta: i64) -> Reply {
    if store.hashes.contains_key(key) {
        return wrongtype();
    }
    let current = match store.strings.get(key) {
        Some(v) => match text(v).parse::<i64>() {
            Ok(n) => n,
            Err(_) => return err("ERR value is not an integer or out of range"),
        },
        None => 0,
    };
    let Some(next) = current.checked_add(delta) else {
        return err("ERR increment or decrement would overflow");
    };
    store
        .strings
        .insert(key.clone(), Bytes::from(next.to_string()));
    Reply::Integer(next)
}
