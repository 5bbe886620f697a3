//! Live relay sessions: backend selection, the TCP splice loop, the
//! HTTP pump and the datagram forwarder.

use super::{
    http::{eval_rules, HttpEvent, HttpParser, SessionCtx, Verdict},
    rules::BoundRule,
};
use crate::{
    ca::CaSender,
    config::{Direction, DstMode, HostState, Id, ProtocolType, Relay, RuleAction, Table, EMPTY_ID},
    error::Error,
    message::SessionRecord,
};
use privsep_log::{debug, info, warn};
use rand::Rng;
use rustls::pki_types::ServerName;
use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::mpsc,
    time::timeout,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use xxhash_rust::xxh3::xxh3_64;

pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}
pub type IoStream = Box<dyn Stream>;

/// Compiled protocol: the bound rule list plus stream options.
#[derive(Debug)]
pub struct Proto {
    pub typ: ProtocolType,
    pub nodelay: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub rules: Vec<BoundRule>,
}

impl Default for Proto {
    fn default() -> Self {
        Self {
            typ: ProtocolType::Tcp,
            nodelay: false,
            tls_ca_path: None,
            rules: Vec::new(),
        }
    }
}

/// A backend table as seen by one relay, with the selection cursor.
#[derive(Debug)]
pub struct RelayTable {
    pub table: Table,
    pub port: u16,
    pub mode: DstMode,
    cursor: AtomicU32,
}

impl RelayTable {
    pub fn new(table: Table, port: u16, mode: DstMode) -> Self {
        Self {
            table,
            port,
            mode,
            cursor: AtomicU32::new(0),
        }
    }
}

/// One configured relay listener with everything a session needs.
pub struct RelayListener {
    pub conf: Relay,
    pub proto: Arc<Proto>,
    pub tables: Vec<RelayTable>,
    pub acceptor: Option<TlsAcceptor>,
    pub connector: Option<TlsConnector>,
    pub active: AtomicUsize,
}

/// Worker-wide session state shared with the control plane.
pub struct RelayCtx {
    pub hosts: RwLock<HashMap<Id, HostState>>,
    pub sessions: Mutex<HashMap<u64, (Instant, SessionRecord)>>,
    pub next_id: AtomicU64,
    pub active: AtomicUsize,
    pub fd_limit: usize,
    pub ca: CaSender,
}

impl RelayCtx {
    pub fn host_state(&self, id: Id) -> HostState {
        self.hosts
            .read()
            .ok()
            .and_then(|hosts| hosts.get(&id).copied())
            .unwrap_or(HostState::Unknown)
    }

    pub fn session_records(&self) -> Vec<SessionRecord> {
        match self.sessions.lock() {
            Ok(sessions) => sessions
                .values()
                .map(|(started, record)| {
                    let mut record = record.clone();
                    record.age = started.elapsed();
                    record
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// File descriptor accounting: each session costs two descriptors
    /// and a reserve is kept for everything else.
    pub fn may_accept(&self) -> bool {
        self.active.load(Ordering::Relaxed) * 2 + crate::FD_RESERVE < self.fd_limit
    }
}

/// Registration guard: keeps the session visible for `SHOW sessions`
/// and maintains the descriptor accounting.
struct SessionGuard {
    ctx: Arc<RelayCtx>,
    listener: Arc<RelayListener>,
    id: u64,
}

impl SessionGuard {
    fn new(ctx: Arc<RelayCtx>, listener: Arc<RelayListener>, peer: SocketAddr) -> Self {
        let id = ctx.next_id.fetch_add(1, Ordering::Relaxed);
        ctx.active.fetch_add(1, Ordering::Relaxed);
        listener.active.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut sessions) = ctx.sessions.lock() {
            sessions.insert(
                id,
                (
                    Instant::now(),
                    SessionRecord {
                        id,
                        relay: listener.conf.id,
                        peer: peer.to_string(),
                        age: Duration::default(),
                    },
                ),
            );
        }
        Self { ctx, listener, id }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.ctx.active.fetch_sub(1, Ordering::Relaxed);
        self.listener.active.fetch_sub(1, Ordering::Relaxed);
        if let Ok(mut sessions) = self.ctx.sessions.lock() {
            sessions.remove(&self.id);
        }
    }
}

//
// Backend selection.
//

fn hash_addr(data: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        std::net::IpAddr::V4(ip) => data.extend_from_slice(&ip.octets()),
        std::net::IpAddr::V6(ip) => data.extend_from_slice(&ip.octets()),
    }
}

/// Pick a backend host following the configured destination mode.
/// Only hosts in state `UP` are eligible (all of them for unchecked
/// tables); the scan walks forward from the mode's index and wraps
/// once.
pub fn select_backend(
    listener: &RelayListener,
    ctx: &RelayCtx,
    bound_table: Option<(Id, DstMode)>,
    remote: SocketAddr,
    hash_data: &[u8],
) -> Option<(SocketAddr, Id)> {
    let rlt = match bound_table {
        Some((id, _)) => listener.tables.iter().find(|t| t.table.id == id)?,
        None => listener.tables.iter().find(|rlt| {
            rlt.table
                .hosts
                .iter()
                .any(|host| eligible(rlt, ctx.host_state(host.id)))
        })?,
    };
    let mode = bound_table.map(|(_, mode)| mode).unwrap_or(rlt.mode);
    let hosts = &rlt.table.hosts;
    let n = hosts.len();
    if n == 0 {
        return None;
    }

    let start = match mode {
        DstMode::RoundRobin => {
            let cursor = rlt.cursor.load(Ordering::Relaxed) as usize;
            if cursor >= n {
                0
            } else {
                cursor
            }
        }
        DstMode::Random => rand::thread_rng().gen_range(0..n),
        DstMode::SrcHash | DstMode::LoadBalance | DstMode::Hash => {
            let mut data = Vec::new();
            if matches!(mode, DstMode::SrcHash | DstMode::LoadBalance) {
                // Source IP address without the port.
                hash_addr(&mut data, &remote);
            }
            if matches!(mode, DstMode::LoadBalance | DstMode::Hash) {
                // Local "destination" address and port.
                hash_addr(&mut data, &listener.conf.listen);
                data.extend_from_slice(&listener.conf.listen.port().to_be_bytes());
            }
            data.extend_from_slice(hash_data);
            (xxh3_64(&data) % n as u64) as usize
        }
    };

    let mut found = None;
    for offset in 0..n {
        let idx = (start + offset) % n;
        if eligible(rlt, ctx.host_state(hosts[idx].id)) {
            found = Some(idx);
            break;
        }
    }
    let idx = found?;
    if mode == DstMode::RoundRobin {
        rlt.cursor.store(idx as u32 + 1, Ordering::Relaxed);
    }

    let host = &hosts[idx];
    let port = if rlt.port != 0 {
        rlt.port
    } else {
        listener.conf.listen.port()
    };
    Some((SocketAddr::new(host.address, port), host.id))
}

fn eligible(rlt: &RelayTable, state: HostState) -> bool {
    if rlt.table.disabled {
        return false;
    }
    if rlt.table.check == crate::config::Check::NoCheck {
        return !matches!(state, HostState::Disabled);
    }
    state.is_up()
}

//
// Session entry points.
//

pub async fn serve_tcp(
    listener: Arc<RelayListener>,
    ctx: Arc<RelayCtx>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let guard = SessionGuard::new(ctx.clone(), listener.clone(), peer);
    let id = guard.id;
    debug!("session {}: accepted", id; "peer" => peer.to_string());

    if listener.proto.nodelay {
        let _ = stream.set_nodelay(true);
    }

    // TLS termination happens before any byte reaches the engine.
    let client: IoStream = if listener.conf.flags.ssl || listener.conf.flags.ssl_inspect {
        let acceptor = match &listener.acceptor {
            Some(acceptor) => acceptor.clone(),
            None => return,
        };
        match timeout(listener.conf.timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls)) => Box::new(tls),
            Ok(Err(err)) => {
                info!("session {}: TLS handshake failed: {}", id, err);
                return;
            }
            Err(_) => {
                info!("session {}: TLS handshake timed out", id);
                return;
            }
        }
    } else {
        Box::new(stream)
    };

    let mut sctx = SessionCtx::new(peer, listener.conf.listen, &listener.conf.name);
    let result = match listener.proto.typ {
        ProtocolType::Http => http_session(&listener, &ctx, client, &mut sctx, id).await,
        ProtocolType::Tcp => tcp_session(&listener, &ctx, client, &mut sctx, id).await,
    };
    match result {
        Ok((sent, received)) => {
            info!(
                "session {}: done", id;
                "sent" => sent, "received" => received,
            );
        }
        Err(err) => info!("session {}: {}", id, err),
    }
    if !sctx.log.is_empty() {
        info!("session {}: {}", id, sctx.log.join(", "));
    }
}

/// Evaluate the rules that apply to plain TCP sessions: entries with
/// neither kv patterns nor a method constraint.
fn eval_tcp(rules: &[BoundRule], sctx: &mut SessionCtx) -> (Verdict, Option<(Id, DstMode)>) {
    let mut table = None;
    for bound in rules {
        let rule = &bound.rule;
        if rule.dir != Direction::Request
            || !rule.kv.is_empty()
            || !rule.actions.is_empty()
            || rule.method.is_some()
        {
            continue;
        }
        if bound.tagged != 0 && sctx.tag != bound.tagged {
            continue;
        }
        if bound.label != 0 {
            sctx.label = bound.label;
        }
        if bound.tag != 0 {
            sctx.tag = bound.tag;
        }
        if rule.table_id != EMPTY_ID {
            table = Some((rule.table_id, rule.table_mode));
        }
        match rule.action {
            RuleAction::Match => continue,
            RuleAction::Pass => return (Verdict::Pass, table),
            RuleAction::Block => return (Verdict::Block, table),
        }
    }
    (Verdict::Pass, table)
}

async fn connect_backend(
    listener: &RelayListener,
    target: SocketAddr,
    name: &str,
) -> Result<IoStream, Error> {
    let stream = timeout(crate::RELAY_CONNECT_TIMEOUT, TcpStream::connect(target))
        .await
        .map_err(|_| {
            Error::IoError(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "backend connect timeout",
            ))
        })??;
    if listener.proto.nodelay {
        let _ = stream.set_nodelay(true);
    }
    if listener.conf.flags.ssl_client || listener.conf.flags.ssl_inspect {
        let connector = listener.connector.as_ref().ok_or_else(|| {
            Error::ConfigError(format!("relay \"{}\": no TLS connector", listener.conf.name))
        })?;
        let server_name = ServerName::try_from(name.to_string())
            .or_else(|_| ServerName::try_from(target.ip().to_string()))
            .map_err(|_| Error::ConfigError(format!("invalid backend name {}", name)))?;
        let tls = timeout(
            crate::RELAY_CONNECT_TIMEOUT,
            connector.connect(server_name, stream),
        )
        .await
        .map_err(|_| {
            Error::IoError(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "backend TLS timeout",
            ))
        })??;
        Ok(Box::new(tls))
    } else {
        Ok(Box::new(stream))
    }
}

fn backend_name(listener: &RelayListener, host: Id) -> String {
    for rlt in &listener.tables {
        if let Some(host) = rlt.table.hosts.iter().find(|h| h.id == host) {
            return host.name.clone();
        }
    }
    String::new()
}

async fn tcp_session(
    listener: &Arc<RelayListener>,
    ctx: &Arc<RelayCtx>,
    client: IoStream,
    sctx: &mut SessionCtx,
    id: u64,
) -> Result<(u64, u64), Error> {
    let (verdict, table) = eval_tcp(&listener.proto.rules, sctx);
    if verdict == Verdict::Block {
        debug!("session {}: blocked by rule", id);
        return Ok((0, 0));
    }
    let (target, host) = select_backend(listener, ctx, table, sctx.remote, &sctx.hash_data)
        .ok_or_else(|| Error::ConfigError("no active hosts".to_string()))?;
    let backend = connect_backend(listener, target, &backend_name(listener, host)).await?;
    splice(client, backend, listener.conf.timeout).await
}

/// Bidirectional copy with a shared inactivity deadline that rearms on
/// any progress.  The session ends when either peer closes.
async fn splice(a: IoStream, b: IoStream, idle: Duration) -> Result<(u64, u64), Error> {
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);
    let mut abuf = vec![0u8; 8192];
    let mut bbuf = vec![0u8; 8192];
    let mut sent = 0u64;
    let mut received = 0u64;

    let timer = tokio::time::sleep(idle);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = &mut timer => {
                return Err(Error::IoError(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "session timeout",
                )));
            }
            result = ar.read(&mut abuf) => {
                let n = result?;
                if n == 0 {
                    break;
                }
                bw.write_all(&abuf[..n]).await?;
                sent += n as u64;
                timer.as_mut().reset(tokio::time::Instant::now() + idle);
            }
            result = br.read(&mut bbuf) => {
                let n = result?;
                if n == 0 {
                    break;
                }
                aw.write_all(&bbuf[..n]).await?;
                received += n as u64;
                timer.as_mut().reset(tokio::time::Instant::now() + idle);
            }
        }
    }
    let _ = bw.shutdown().await;
    let _ = aw.shutdown().await;
    Ok((sent, received))
}

//
// HTTP relay.
//

async fn read_event(
    stream: &mut IoStream,
    parser: &mut HttpParser,
    idle: Duration,
) -> Result<Option<HttpEvent>, Error> {
    loop {
        if let Some(event) = parser
            .poll()
            .map_err(|err| Error::HttpError(err.to_string()))?
        {
            return Ok(Some(event));
        }
        let mut buf = [0u8; 8192];
        let n = timeout(idle, stream.read(&mut buf))
            .await
            .map_err(|_| {
                Error::IoError(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "session timeout",
                ))
            })??;
        if n == 0 {
            parser.eof();
            if let Some(event) = parser
                .poll()
                .map_err(|err| Error::HttpError(err.to_string()))?
            {
                return Ok(Some(event));
            }
            return Ok(None);
        }
        parser.push(&buf[..n]);
    }
}

async fn send_error(client: &mut IoStream, status: u16, reason: &str) {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, reason
    );
    let _ = client.write_all(response.as_bytes()).await;
}

/// The HTTP engine: parse each message, run the rules on the header
/// block, forward the rewritten block and stream the body.
async fn http_session(
    listener: &Arc<RelayListener>,
    ctx: &Arc<RelayCtx>,
    mut client: IoStream,
    sctx: &mut SessionCtx,
    id: u64,
) -> Result<(u64, u64), Error> {
    let idle = listener.conf.timeout;
    let mut req_parser = HttpParser::new(Direction::Request);
    let mut resp_parser = HttpParser::new(Direction::Response);
    let mut backend: Option<IoStream> = None;
    let mut sent = 0u64;
    let mut received = 0u64;

    loop {
        // Request phase.
        let (mut desc, _body) = match read_event(&mut client, &mut req_parser, idle).await? {
            Some(HttpEvent::Headers { desc, body }) => (desc, body),
            Some(_) | None => break,
        };
        let result = eval_rules(&listener.proto.rules, &mut desc, sctx);
        if result.verdict == Verdict::Block {
            debug!("session {}: request blocked", id);
            send_error(&mut client, 403, "Forbidden").await;
            break;
        }

        if backend.is_none() {
            match select_backend(listener, ctx, result.table, sctx.remote, &sctx.hash_data) {
                Some((target, host)) => {
                    match connect_backend(listener, target, &backend_name(listener, host)).await
                    {
                        Ok(stream) => backend = Some(stream),
                        Err(err) => {
                            warn!("session {}: backend connect failed: {}", id, err);
                            send_error(&mut client, 503, "Service Unavailable").await;
                            break;
                        }
                    }
                }
                None => {
                    send_error(&mut client, 503, "Service Unavailable").await;
                    break;
                }
            }
        }
        let be = match backend.as_mut() {
            Some(be) => be,
            None => break,
        };

        let header_block = desc.serialize();
        be.write_all(&header_block).await?;
        sent += header_block.len() as u64;

        let req_keep_alive = loop {
            match read_event(&mut client, &mut req_parser, idle).await? {
                Some(HttpEvent::Body(bytes)) => {
                    be.write_all(&bytes).await?;
                    sent += bytes.len() as u64;
                }
                Some(HttpEvent::Done { keep_alive }) => break keep_alive,
                Some(HttpEvent::Headers { .. }) | None => {
                    return Err(Error::HttpError("truncated request body".to_string()))
                }
            }
        };
        be.flush().await?;

        // Response phase.
        let (mut rdesc, _rbody) = match read_event(be, &mut resp_parser, idle).await? {
            Some(HttpEvent::Headers { desc, body }) => (desc, body),
            Some(_) | None => {
                send_error(&mut client, 502, "Bad Gateway").await;
                break;
            }
        };
        let rresult = eval_rules(&listener.proto.rules, &mut rdesc, sctx);
        if rresult.verdict == Verdict::Block {
            debug!("session {}: response blocked", id);
            break;
        }

        let header_block = rdesc.serialize();
        client.write_all(&header_block).await?;
        received += header_block.len() as u64;

        let resp_keep_alive = loop {
            match read_event(be, &mut resp_parser, idle).await? {
                Some(HttpEvent::Body(bytes)) => {
                    client.write_all(&bytes).await?;
                    received += bytes.len() as u64;
                }
                Some(HttpEvent::Done { keep_alive }) => break keep_alive,
                Some(HttpEvent::Headers { .. }) | None => break false,
            }
        };
        client.flush().await?;

        if !req_keep_alive || !resp_keep_alive {
            break;
        }
        req_parser.next_message();
        resp_parser.next_message();
    }

    if let Some(mut be) = backend {
        let _ = be.shutdown().await;
    }
    let _ = client.shutdown().await;
    Ok((sent, received))
}

//
// UDP relay.
//

pub async fn serve_udp(
    listener: Arc<RelayListener>,
    ctx: Arc<RelayCtx>,
    socket: Arc<UdpSocket>,
) {
    let peers: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; 65535];

    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(err) => {
                warn!("relay {}: udp receive failed: {}", listener.conf.name, err);
                continue;
            }
        };
        let data = buf[..n].to_vec();

        let existing = peers
            .lock()
            .ok()
            .and_then(|peers| peers.get(&peer).cloned());
        if let Some(tx) = existing {
            let _ = tx.try_send(data);
            continue;
        }

        let sctx_hash: &[u8] = &[];
        let target = match select_backend(&listener, &ctx, None, peer, sctx_hash) {
            Some((target, _)) => target,
            None => {
                debug!("relay {}: no active hosts for datagram", listener.conf.name);
                continue;
            }
        };
        let (tx, rx) = mpsc::channel(64);
        if let Ok(mut peers) = peers.lock() {
            peers.insert(peer, tx.clone());
        }
        let _ = tx.try_send(data);
        tokio::spawn(udp_session(
            listener.clone(),
            ctx.clone(),
            socket.clone(),
            peers.clone(),
            peer,
            target,
            rx,
        ));
    }
}

async fn udp_session(
    listener: Arc<RelayListener>,
    ctx: Arc<RelayCtx>,
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>,
    peer: SocketAddr,
    target: SocketAddr,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    let guard = SessionGuard::new(ctx.clone(), listener.clone(), peer);
    let bind: SocketAddr = if target.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let backend = match UdpSocket::bind(bind).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!("session {}: udp bind failed: {}", guard.id, err);
            remove_peer(&peers, &peer);
            return;
        }
    };
    if let Err(err) = backend.connect(target).await {
        warn!("session {}: udp connect failed: {}", guard.id, err);
        remove_peer(&peers, &peer);
        return;
    }

    let idle = listener.conf.timeout;
    let mut buf = vec![0u8; 65535];
    let timer = tokio::time::sleep(idle);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = &mut timer => break,
            data = rx.recv() => {
                match data {
                    Some(data) => {
                        if backend.send(&data).await.is_err() {
                            break;
                        }
                        timer.as_mut().reset(tokio::time::Instant::now() + idle);
                    }
                    None => break,
                }
            }
            result = backend.recv(&mut buf) => {
                match result {
                    Ok(n) => {
                        if socket.send_to(&buf[..n], peer).await.is_err() {
                            break;
                        }
                        timer.as_mut().reset(tokio::time::Instant::now() + idle);
                    }
                    Err(_) => break,
                }
            }
        }
    }
    remove_peer(&peers, &peer);
}

fn remove_peer(
    peers: &Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>,
    peer: &SocketAddr,
) {
    if let Ok(mut peers) = peers.lock() {
        peers.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Check, Host, RelayFlags};
    use std::net::IpAddr;
    use tokio::sync::mpsc::unbounded_channel;

    fn table(names: &[(&str, Id)]) -> Table {
        Table {
            id: 1,
            name: "test".to_string(),
            check: Check::Tcp,
            hosts: names
                .iter()
                .map(|(ip, id)| Host {
                    id: *id,
                    name: ip.to_string(),
                    address: ip.parse::<IpAddr>().expect("addr"),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn listener(mode: DstMode) -> RelayListener {
        RelayListener {
            conf: Relay {
                id: 1,
                name: "test".to_string(),
                listen: "127.0.0.1:8080".parse().expect("addr"),
                flags: RelayFlags::default(),
                ..Default::default()
            },
            proto: Arc::new(Proto::default()),
            tables: vec![RelayTable::new(
                table(&[("10.0.0.1", 1), ("10.0.0.2", 2), ("10.0.0.3", 3)]),
                80,
                mode,
            )],
            acceptor: None,
            connector: None,
            active: AtomicUsize::new(0),
        }
    }

    fn ctx_with_hosts(states: &[(Id, HostState)]) -> Arc<RelayCtx> {
        let (ca, _rx) = unbounded_channel();
        let ctx = RelayCtx {
            hosts: RwLock::new(states.iter().copied().collect()),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            fd_limit: 1024,
            ca,
        };
        Arc::new(ctx)
    }

    #[test]
    fn test_roundrobin_distribution() {
        let listener = listener(DstMode::RoundRobin);
        let ctx = ctx_with_hosts(&[
            (1, HostState::Up),
            (2, HostState::Up),
            (3, HostState::Up),
        ]);
        let remote = "192.0.2.1:9999".parse().expect("addr");

        let mut picks = Vec::new();
        for _ in 0..10 {
            let (addr, _) =
                select_backend(&listener, &ctx, None, remote, &[]).expect("backend");
            picks.push(addr.ip().to_string());
        }
        assert_eq!(
            picks,
            vec![
                "10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.1", "10.0.0.2", "10.0.0.3",
                "10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.1",
            ]
        );
    }

    #[test]
    fn test_roundrobin_skips_down_host() {
        let listener = listener(DstMode::RoundRobin);
        let ctx = ctx_with_hosts(&[
            (1, HostState::Up),
            (2, HostState::Up),
            (3, HostState::Up),
        ]);
        let remote = "192.0.2.1:9999".parse().expect("addr");

        for expected in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            let (addr, _) =
                select_backend(&listener, &ctx, None, remote, &[]).expect("backend");
            assert_eq!(addr.ip().to_string(), expected);
        }

        // Host B goes away after the third request.
        ctx.hosts
            .write()
            .expect("lock")
            .insert(2, HostState::Down);

        let mut picks = Vec::new();
        for _ in 0..7 {
            let (addr, _) =
                select_backend(&listener, &ctx, None, remote, &[]).expect("backend");
            picks.push(addr.ip().to_string());
        }
        assert_eq!(
            picks,
            vec![
                "10.0.0.1", "10.0.0.3", "10.0.0.1", "10.0.0.3", "10.0.0.1", "10.0.0.3",
                "10.0.0.1",
            ]
        );
    }

    #[test]
    fn test_no_eligible_hosts() {
        let listener = listener(DstMode::RoundRobin);
        let ctx = ctx_with_hosts(&[
            (1, HostState::Down),
            (2, HostState::Down),
            (3, HostState::Disabled),
        ]);
        let remote = "192.0.2.1:9999".parse().expect("addr");
        assert!(select_backend(&listener, &ctx, None, remote, &[]).is_none());
    }

    #[test]
    fn test_source_hash_is_stable() {
        let listener = listener(DstMode::SrcHash);
        let ctx = ctx_with_hosts(&[
            (1, HostState::Up),
            (2, HostState::Up),
            (3, HostState::Up),
        ]);
        let remote = "192.0.2.77:1000".parse().expect("addr");
        let first = select_backend(&listener, &ctx, None, remote, &[]).expect("backend");
        for port in 1001..1010u16 {
            let remote = SocketAddr::new("192.0.2.77".parse().expect("ip"), port);
            let pick = select_backend(&listener, &ctx, None, remote, &[]).expect("backend");
            assert_eq!(pick.0, first.0);
        }
    }

    #[test]
    fn test_unchecked_table_serves_unknown_hosts() {
        let mut listener = listener(DstMode::RoundRobin);
        listener.tables[0].table.check = Check::NoCheck;
        let ctx = ctx_with_hosts(&[]);
        let remote = "192.0.2.1:9999".parse().expect("addr");
        assert!(select_backend(&listener, &ctx, None, remote, &[]).is_some());
    }
}
