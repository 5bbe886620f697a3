//! End-to-end relay tests over loopback sockets: a listening relay in
//! front of a scripted backend, exercising header rewriting, backend
//! failover and blocking rules.

use relayd::{
    config::{
        Check, Direction, DstMode, Host, HostState, KeyType, KvAction, KvActionPattern,
        KvPattern, ProtocolType, Relay, Rule, RuleAction, Table,
    },
    relay::{
        rules::{BoundRule, Registry},
        session::{serve_tcp, Proto, RelayCtx, RelayListener, RelayTable},
    },
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};


/// The relay logs through the process-wide logger; set one up once.
fn init_logger() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let guard = privsep_log::sync_logger(
            "test",
            privsep_log::Config {
                foreground: true,
                filter: Some("debug".to_string()),
            },
        )
        .unwrap();
        std::mem::forget(guard);
    });
}

/// A backend that answers every request with its own tag in a header
/// and in the body.
async fn spawn_backend(tag: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut request = Vec::new();
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) => return,
                        Ok(n) => n,
                        Err(_) => return,
                    };
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let request = String::from_utf8_lossy(&request).to_string();
                let body = format!("{}\n{}", tag, request);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Backend: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    tag,
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

fn make_table(backends: &[(SocketAddr, u32)]) -> Table {
    Table {
        id: 1,
        name: "backends".to_string(),
        check: Check::Tcp,
        hosts: backends
            .iter()
            .map(|(addr, id)| Host {
                id: *id,
                table: 1,
                name: addr.ip().to_string(),
                address: addr.ip(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn make_ctx(states: &[(u32, HostState)]) -> Arc<RelayCtx> {
    let (ca, _rx) = mpsc::unbounded_channel();
    // Keep the channel open for the lifetime of the test context.
    std::mem::forget(_rx);
    Arc::new(RelayCtx {
        hosts: RwLock::new(states.iter().copied().collect()),
        sessions: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        active: AtomicUsize::new(0),
        fd_limit: 1024,
        ca,
    })
}

fn make_listener(rules: Vec<Rule>, table: Table, port: u16) -> Arc<RelayListener> {
    let mut registry = Registry::default();
    let bound = rules
        .into_iter()
        .map(|rule| BoundRule::inherit(rule, &mut registry))
        .collect();
    Arc::new(RelayListener {
        conf: Relay {
            id: 1,
            name: "test".to_string(),
            listen: "127.0.0.1:0".parse().unwrap(),
            timeout: Duration::from_secs(5),
            ..Default::default()
        },
        proto: Arc::new(Proto {
            typ: ProtocolType::Http,
            nodelay: false,
            tls_ca_path: None,
            rules: bound,
        }),
        tables: vec![RelayTable::new(table, port, DstMode::RoundRobin)],
        acceptor: None,
        connector: None,
        active: AtomicUsize::new(0),
    })
}

/// Accept one client on a fresh socket and relay it.
async fn spawn_relay(listener: Arc<RelayListener>, ctx: Arc<RelayCtx>) -> SocketAddr {
    init_logger();
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match socket.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(serve_tcp(listener.clone(), ctx.clone(), stream, peer));
        }
    });
    addr
}

async fn request(relay: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(relay).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    let _ = tokio::time::timeout(
        Duration::from_secs(5),
        stream.read_to_end(&mut response),
    )
    .await
    .unwrap();
    String::from_utf8_lossy(&response).to_string()
}

fn header_rewrite_rule() -> Rule {
    Rule {
        action: RuleAction::Match,
        dir: Direction::Request,
        kv: vec![KvPattern {
            typ: KeyType::Header,
            key: "Host".to_string(),
            value: Some("*.example.com".to_string()),
        }],
        actions: vec![KvActionPattern {
            action: KvAction::Set,
            typ: KeyType::Header,
            key: "X-Original-Host".to_string(),
            value: Some("$HEADER".to_string()),
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_header_rewrite_reaches_backend() {
    let backend = spawn_backend("a").await;
    let table = make_table(&[(backend, 10)]);
    let listener = make_listener(vec![header_rewrite_rule()], table, backend.port());
    let ctx = make_ctx(&[(10, HostState::Up)]);
    let relay = spawn_relay(listener, ctx).await;

    let response = request(
        relay,
        "GET / HTTP/1.1\r\nHost: api.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    // The backend echoed the request it saw.
    assert!(
        response.contains("X-Original-Host: api.example.com"),
        "{}",
        response
    );
}

#[tokio::test]
async fn test_sequential_sessions_are_served() {
    let a = spawn_backend("a").await;
    let table = make_table(&[(a, 10)]);
    let listener = make_listener(Vec::new(), table, a.port());
    let ctx = make_ctx(&[(10, HostState::Up)]);
    let relay = spawn_relay(listener, ctx).await;

    for _ in 0..3 {
        let response = request(
            relay,
            "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.contains("X-Backend: a"), "{}", response);
    }
}

#[tokio::test]
async fn test_down_host_yields_503() {
    let backend = spawn_backend("a").await;
    let table = make_table(&[(backend, 10)]);
    let listener = make_listener(Vec::new(), table, backend.port());
    let ctx = make_ctx(&[(10, HostState::Down)]);
    let relay = spawn_relay(listener, ctx).await;

    let response = request(
        relay,
        "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 503"), "{}", response);
}

#[tokio::test]
async fn test_block_rule_closes_with_403() {
    let backend = spawn_backend("a").await;
    let table = make_table(&[(backend, 10)]);
    let block = Rule {
        action: RuleAction::Block,
        dir: Direction::Request,
        kv: vec![KvPattern {
            typ: KeyType::Path,
            key: "/admin*".to_string(),
            value: None,
        }],
        ..Default::default()
    };
    let listener = make_listener(vec![block], table, backend.port());
    let ctx = make_ctx(&[(10, HostState::Up)]);
    let relay = spawn_relay(listener, ctx).await;

    let blocked = request(
        relay,
        "GET /admin/panel HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(blocked.starts_with("HTTP/1.1 403"), "{}", blocked);

    let passed = request(
        relay,
        "GET /public HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(passed.starts_with("HTTP/1.1 200"), "{}", passed);
}

/// Sessions started before a host goes down keep working; new ones
/// see the updated state.
#[tokio::test]
async fn test_state_change_applies_to_new_sessions() {
    let backend = spawn_backend("a").await;
    let table = make_table(&[(backend, 10)]);
    let listener = make_listener(Vec::new(), table, backend.port());
    let ctx = make_ctx(&[(10, HostState::Up)]);
    let relay = spawn_relay(listener, ctx.clone()).await;

    let ok = request(
        relay,
        "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(ok.starts_with("HTTP/1.1 200"), "{}", ok);

    ctx.hosts.write().unwrap().insert(10, HostState::Down);

    let unavailable = request(
        relay,
        "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(unavailable.starts_with("HTTP/1.1 503"), "{}", unavailable);
}
