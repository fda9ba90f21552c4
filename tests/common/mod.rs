//! Shared helpers for the integration tests.
#![allow(dead_code)]

use padserve::cache::resp::{read_value, RespValue};
use padserve::config::ServiceConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const TEST_WORKER: &str = env!("CARGO_BIN_EXE_padserve-test-worker");

/// A snippet the fixture analyzer flags: the `print` call lacks its `;`.
pub const MISSING_SEMICOLON: &str = "void main() {\n  print('hello')\n}\n";

pub const HELLO_WORLD: &str = "void main() {\n  print('hello');\n}\n";

pub fn worker_path() -> PathBuf {
    PathBuf::from(TEST_WORKER)
}

/// Configuration that routes every tool to the fixture worker and keeps
/// workspaces under `root`.
pub fn test_config(root: &Path) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.workspace.root = root.join("workspaces");
    config.worker.command = TEST_WORKER.to_string();
    config.worker.args = vec!["--persistent".to_string()];
    config.worker.request_timeout_secs = 10;
    config.worker.shutdown_timeout_secs = 2;
    config.compiler.command = TEST_WORKER.to_string();
    config.compiler.args = vec!["compile-whole".to_string()];
    config.compiler.timeout_secs = 10;
    config.resolver.command = TEST_WORKER.to_string();
    config.resolver.args = vec!["resolve".to_string()];
    config.resolver.timeout_secs = 10;
    config.operations.timeout_secs = 20;
    config.versions.toolchain = "3.4.0".to_string();
    config.versions.runtime = "3.4.0".to_string();
    config
}

pub fn temp_root() -> TempDir {
    TempDir::new().expect("create temp dir")
}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // signal 0 only checks for existence
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(unix)]
pub fn kill_process(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

/// Poll `check` until it holds or `limit` passes.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

type Store = Arc<Mutex<HashMap<Vec<u8>, (Vec<u8>, Option<u64>)>>>;

/// In-process server speaking enough of the Redis protocol for the cache:
/// AUTH, SELECT, PING, GET, SET, DEL, EXPIRE, MULTI and EXEC.
pub struct FakeRedis {
    addr: std::net::SocketAddr,
    store: Store,
    stalled: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
    connection_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FakeRedis {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        Self::serve(listener)
    }

    /// Listen again on a previously used address.
    pub async fn start_on(addr: std::net::SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.expect("rebind");
        Self::serve(listener)
    }

    fn serve(listener: TcpListener) -> Self {
        let addr = listener.local_addr().expect("local addr");
        let store: Store = Arc::default();
        let stalled = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));
        let connection_tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();

        let accept_task = {
            let store = store.clone();
            let stalled = stalled.clone();
            let connections = connections.clone();
            let connection_tasks = connection_tasks.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let task = tokio::spawn(handle_connection(
                        stream,
                        store.clone(),
                        stalled.clone(),
                    ));
                    connection_tasks.lock().unwrap().push(task);
                }
            })
        };

        Self {
            addr,
            store,
            stalled,
            connections,
            accept_task,
            connection_tasks,
        }
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    /// Stop answering commands; connections stay open.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.store
            .lock()
            .unwrap()
            .get(key.as_bytes())
            .map(|(value, _)| String::from_utf8_lossy(value).into_owned())
    }

    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.store
            .lock()
            .unwrap()
            .get(key.as_bytes())
            .and_then(|(_, ttl)| *ttl)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .store
            .lock()
            .unwrap()
            .keys()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect();
        keys.sort();
        keys
    }

    /// Close every open connection but keep listening, like a server
    /// enforcing an idle timeout.
    pub fn close_connections(&self) {
        for task in self.connection_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Close the listener and every open connection.
    pub fn stop(&self) {
        self.accept_task.abort();
        for task in self.connection_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for FakeRedis {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_connection(stream: TcpStream, store: Store, stalled: Arc<AtomicBool>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut queued: Option<Vec<Vec<Vec<u8>>>> = None;

    loop {
        let Ok(value) = read_value(&mut reader).await else {
            return;
        };
        let RespValue::Array(Some(items)) = value else {
            return;
        };
        let args: Vec<Vec<u8>> = items
            .into_iter()
            .filter_map(|item| match item {
                RespValue::Bulk(Some(bytes)) => Some(bytes),
                _ => None,
            })
            .collect();

        if stalled.load(Ordering::SeqCst) {
            continue;
        }

        let name = args
            .first()
            .map(|n| String::from_utf8_lossy(n).to_ascii_uppercase())
            .unwrap_or_default();
        let reply = if name == "MULTI" {
            queued = Some(Vec::new());
            b"+OK\r\n".to_vec()
        } else if let Some(commands) = queued.as_mut() {
            if name == "EXEC" {
                let mut reply = format!("*{}\r\n", commands.len()).into_bytes();
                for command in commands.drain(..) {
                    reply.extend(execute(&command, &store));
                }
                queued = None;
                reply
            } else {
                commands.push(args);
                b"+QUEUED\r\n".to_vec()
            }
        } else {
            execute(&args, &store)
        };

        if write.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn execute(args: &[Vec<u8>], store: &Store) -> Vec<u8> {
    let name = args
        .first()
        .map(|n| String::from_utf8_lossy(n).to_ascii_uppercase())
        .unwrap_or_default();
    let mut store = store.lock().unwrap();
    match (name.as_str(), args.len()) {
        ("PING", _) => b"+PONG\r\n".to_vec(),
        ("AUTH", 2) | ("SELECT", 2) => b"+OK\r\n".to_vec(),
        ("GET", 2) => match store.get(&args[1]) {
            Some((value, _)) => {
                let mut reply = format!("${}\r\n", value.len()).into_bytes();
                reply.extend_from_slice(value);
                reply.extend_from_slice(b"\r\n");
                reply
            }
            None => b"$-1\r\n".to_vec(),
        },
        ("SET", 3) => {
            store.insert(args[1].clone(), (args[2].clone(), None));
            b"+OK\r\n".to_vec()
        }
        ("DEL", 2) => {
            let removed = store.remove(&args[1]).is_some();
            format!(":{}\r\n", u8::from(removed)).into_bytes()
        }
        ("EXPIRE", 3) => {
            let secs = String::from_utf8_lossy(&args[2]).parse::<u64>().ok();
            match (store.get_mut(&args[1]), secs) {
                (Some(entry), Some(secs)) => {
                    entry.1 = Some(secs);
                    b":1\r\n".to_vec()
                }
                _ => b":0\r\n".to_vec(),
            }
        }
        _ => format!("-ERR unknown command '{name}'\r\n").into_bytes(),
    }
}
