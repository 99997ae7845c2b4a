//! Test utilities shared across the crate's unit tests
//!
//! [`FakeBroker`] is an in-process beanstalkd stand-in speaking just enough of
//! the protocol for the queue client and gateway tests. It records every
//! command and job body it receives.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached within 2s");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// An address nothing is listening on.
pub fn unused_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr.to_string()
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    ready: HashMap<String, VecDeque<(u64, Vec<u8>)>>,
    reserved: HashSet<u64>,
    commands: Vec<String>,
    puts: Vec<Vec<u8>>,
}

/// Behavior knobs for [`FakeBroker`].
#[derive(Debug, Clone, Default)]
pub struct FakeBrokerBuilder {
    handshake_delay: Duration,
    drop_after_commands: Option<usize>,
}

impl FakeBrokerBuilder {
    /// Delay replies to `use` and `watch` by `delay`.
    pub fn handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// Close each connection after answering `count` commands.
    pub fn drop_after_commands(mut self, count: usize) -> Self {
        self.drop_after_commands = Some(count);
        self
    }

    pub async fn start(self) -> FakeBroker {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake broker");
        let addr = listener.local_addr().expect("fake broker addr");
        let state = Arc::new(Mutex::new(BrokerState::default()));

        let accept_state = Arc::clone(&state);
        let behavior = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                let behavior = behavior.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, state, behavior).await;
                });
            }
        });

        FakeBroker { addr, state }
    }
}

/// In-process beanstalkd stand-in
pub struct FakeBroker {
    addr: SocketAddr,
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub const MAX_JOB_SIZE: usize = 1024;

    pub fn builder() -> FakeBrokerBuilder {
        FakeBrokerBuilder::default()
    }

    pub async fn start() -> Self {
        Self::builder().start().await
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn max_job_size(&self) -> usize {
        Self::MAX_JOB_SIZE
    }

    /// Every command line received, across all connections
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Every job body put, across all tubes
    pub fn puts(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().puts.clone()
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<Mutex<BrokerState>>,
    behavior: FakeBrokerBuilder,
) -> std::io::Result<()> {
    let mut stream = BufStream::new(stream);
    let mut using = "default".to_string();
    let mut watching: Vec<String> = vec!["default".to_string()];
    let mut answered = 0usize;

    loop {
        if behavior.drop_after_commands.is_some_and(|limit| answered >= limit) {
            return Ok(());
        }

        let mut line = String::new();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let line = line.trim_end().to_string();
        state.lock().unwrap().commands.push(line.clone());

        let words: Vec<&str> = line.split(' ').collect();
        let reply = match words.as_slice() {
            ["use", tube] => {
                tokio::time::sleep(behavior.handshake_delay).await;
                using = tube.to_string();
                format!("USING {tube}\r\n")
            }
            ["watch", tube] => {
                tokio::time::sleep(behavior.handshake_delay).await;
                if !watching.iter().any(|t| t == tube) {
                    watching.push(tube.to_string());
                }
                format!("WATCHING {}\r\n", watching.len())
            }
            ["ignore", tube] => {
                if watching.len() == 1 {
                    "NOT_IGNORED\r\n".to_string()
                } else {
                    watching.retain(|t| t != tube);
                    format!("WATCHING {}\r\n", watching.len())
                }
            }
            ["put", _pri, _delay, _ttr, len] => {
                let len: usize = len.parse().unwrap_or(0);
                let mut body = vec![0u8; len + 2];
                stream.read_exact(&mut body).await?;
                body.truncate(len);
                if len > FakeBroker::MAX_JOB_SIZE {
                    "JOB_TOO_BIG\r\n".to_string()
                } else {
                    let mut state = state.lock().unwrap();
                    state.next_id += 1;
                    let id = state.next_id;
                    state.puts.push(body.clone());
                    state.ready.entry(using.clone()).or_default().push_back((id, body));
                    format!("INSERTED {id}\r\n")
                }
            }
            ["reserve"] | ["reserve-with-timeout", _] => {
                let job = {
                    let mut state = state.lock().unwrap();
                    let job = watching
                        .iter()
                        .find_map(|tube| state.ready.get_mut(tube).and_then(VecDeque::pop_front));
                    if let Some((id, _)) = &job {
                        state.reserved.insert(*id);
                    }
                    job
                };
                match job {
                    Some((id, body)) => {
                        let mut reply = format!("RESERVED {id} {}\r\n", body.len()).into_bytes();
                        reply.extend_from_slice(&body);
                        reply.extend_from_slice(b"\r\n");
                        String::from_utf8_lossy(&reply).into_owned()
                    }
                    None => "TIMED_OUT\r\n".to_string(),
                }
            }
            ["delete", id] | ["touch", id] | ["release", id, _, _] | ["bury", id, _] => {
                let id: u64 = id.parse().unwrap_or(0);
                let known = {
                    let mut state = state.lock().unwrap();
                    if words[0] == "delete" {
                        state.reserved.remove(&id)
                    } else {
                        state.reserved.contains(&id)
                    }
                };
                match (known, words[0]) {
                    (false, _) => "NOT_FOUND\r\n".to_string(),
                    (true, "delete") => "DELETED\r\n".to_string(),
                    (true, "touch") => "TOUCHED\r\n".to_string(),
                    (true, "release") => "RELEASED\r\n".to_string(),
                    (true, _) => "BURIED\r\n".to_string(),
                }
            }
            _ => "UNKNOWN_COMMAND\r\n".to_string(),
        };

        stream.write_all(reply.as_bytes()).await?;
        stream.flush().await?;
        answered += 1;
    }
}

/// In-process Redis-protocol stand-in for the store tests.
///
/// Understands `SET`, `GET` and `ZADD`; answers `+OK` to anything else,
/// including the client's connection setup commands.
pub struct FakeStore {
    addr: SocketAddr,
    connections: Arc<Mutex<usize>>,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
}

impl FakeStore {
    pub async fn start() -> Self {
        Self::serve(None).await
    }

    /// Like [`start`](Self::start), but the first connection is closed after
    /// answering `count` data commands.
    pub async fn closing_first_connection_after(count: usize) -> Self {
        Self::serve(Some(count)).await
    }

    async fn serve(close_first_after: Option<usize>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake store");
        let addr = listener.local_addr().expect("fake store addr");
        let connections = Arc::new(Mutex::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let values = Arc::new(Mutex::new(HashMap::new()));

        let (accepted, seen) = (Arc::clone(&connections), Arc::clone(&commands));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let close_after = {
                    let mut accepted = accepted.lock().unwrap();
                    *accepted += 1;
                    close_first_after.filter(|_| *accepted == 1)
                };
                let (seen, values) = (Arc::clone(&seen), Arc::clone(&values));
                tokio::spawn(async move {
                    let _ = serve_resp(stream, seen, values, close_after).await;
                });
            }
        });

        Self { addr, connections, commands }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        *self.connections.lock().unwrap()
    }

    /// Data commands received (connection setup excluded)
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }
}

async fn serve_resp(
    stream: TcpStream,
    seen: Arc<Mutex<Vec<Vec<String>>>>,
    values: Arc<Mutex<HashMap<String, String>>>,
    close_after: Option<usize>,
) -> std::io::Result<()> {
    let mut stream = BufStream::new(stream);
    let mut answered = 0usize;
    loop {
        if close_after.is_some_and(|limit| answered >= limit) {
            return Ok(());
        }

        let mut header = String::new();
        if stream.read_line(&mut header).await? == 0 {
            return Ok(());
        }
        let count: usize = header.trim_end().trim_start_matches('*').parse().unwrap_or(0);

        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            let mut len = String::new();
            stream.read_line(&mut len).await?;
            let len: usize = len.trim_end().trim_start_matches('$').parse().unwrap_or(0);
            let mut arg = vec![0u8; len + 2];
            stream.read_exact(&mut arg).await?;
            arg.truncate(len);
            args.push(String::from_utf8_lossy(&arg).into_owned());
        }

        let reply = match args.first().map(|name| name.to_ascii_uppercase()).as_deref() {
            Some("SET") if args.len() >= 3 => {
                values.lock().unwrap().insert(args[1].clone(), args[2].clone());
                seen.lock().unwrap().push(args);
                answered += 1;
                "+OK\r\n".to_string()
            }
            Some("GET") if args.len() == 2 => {
                let value = values.lock().unwrap().get(&args[1]).cloned();
                seen.lock().unwrap().push(args);
                answered += 1;
                match value {
                    Some(value) => format!("${}\r\n{}\r\n", value.len(), value),
                    None => "$-1\r\n".to_string(),
                }
            }
            Some("ZADD") => {
                seen.lock().unwrap().push(args);
                answered += 1;
                ":1\r\n".to_string()
            }
            _ => "+OK\r\n".to_string(),
        };

        stream.write_all(reply.as_bytes()).await?;
        stream.flush().await?;
    }
}
