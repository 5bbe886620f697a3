pub mod http;
pub mod kv;
pub mod rules;
pub mod session;

use crate::{
    ca::{ca_client, CaRequest},
    config::{Host, Protocol, Relay, Rule, Table, EMPTY_ID},
    error::Error,
    message::{self, ConfigScope, Data, Type},
    parent::default_handler,
    tls, Child, Privsep,
};
use privsep::{imsg::Message, net::Fd};
use privsep_log::{debug, info, warn};
use session::{Proto, RelayCtx, RelayListener, RelayTable};
use std::{
    collections::HashMap,
    os::unix::io::{AsRawFd, FromRawFd},
    sync::{
        atomic::{AtomicU64, AtomicUsize},
        Arc, Mutex, RwLock,
    },
};
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::config::Id;

/// The raw configuration entities of one generation, as streamed by
/// the parent.  Categories excluded from a reload scope survive a
/// reset untouched.
#[derive(Clone, Debug, Default)]
struct Entities {
    tables: Vec<Table>,
    hosts: Vec<Host>,
    relays: Vec<Relay>,
    protocols: Vec<Protocol>,
    rules: Vec<Rule>,
}

impl Entities {
    fn reset(&mut self, scope: ConfigScope) {
        if scope.has(message::CONFIG_TABLES) {
            self.tables.clear();
            self.hosts.clear();
        }
        if scope.has(message::CONFIG_RELAYS) {
            self.relays.clear();
        }
        if scope.has(message::CONFIG_PROTOS) {
            self.protocols.clear();
            self.rules.clear();
        }
    }
}

/// A compiled configuration generation.  Sessions hold their own
/// `Arc` so an installed successor never disturbs them.
pub(crate) struct RunCfg {
    listeners: Vec<Arc<RelayListener>>,
    #[allow(unused)]
    registry: Mutex<rules::Registry>,
}

impl RunCfg {
    fn listener(&self, id: Id) -> Option<Arc<RelayListener>> {
        self.listeners.iter().find(|l| l.conf.id == id).cloned()
    }
}

fn compile(entities: &Entities, ctx: &Arc<RelayCtx>) -> Result<RunCfg, Error> {
    let mut registry = rules::Registry::default();

    let mut tables: HashMap<Id, Table> = entities
        .tables
        .iter()
        .map(|t| (t.id, t.clone()))
        .collect();
    for host in &entities.hosts {
        if let Some(table) = tables.get_mut(&host.table) {
            table.hosts.push(host.clone());
        }
    }

    let mut protos: HashMap<Id, Arc<Proto>> = HashMap::new();
    for protocol in &entities.protocols {
        let bound = entities
            .rules
            .iter()
            .filter(|rule| rule.proto_id == protocol.id)
            .map(|rule| rules::BoundRule::inherit(rule.clone(), &mut registry))
            .collect();
        protos.insert(
            protocol.id,
            Arc::new(Proto {
                typ: protocol.typ,
                nodelay: protocol.tcp_nodelay,
                tls_ca_path: protocol.tls_ca_path.clone(),
                rules: bound,
            }),
        );
    }

    let mut listeners = Vec::new();
    for relay in &entities.relays {
        let proto = match relay.proto_id {
            EMPTY_ID => Arc::new(Proto::default()),
            id => protos
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::ConfigError(format!("unknown protocol {}", id)))?,
        };
        let relay_tables = relay
            .forward
            .iter()
            .filter_map(|fwd| {
                tables
                    .get(&fwd.table_id)
                    .map(|table| RelayTable::new(table.clone(), fwd.port, fwd.mode))
            })
            .collect();
        let acceptor = if relay.flags.ssl || relay.flags.ssl_inspect {
            Some(tls::acceptor(relay, ctx.ca.clone())?)
        } else {
            None
        };
        let connector = if relay.flags.ssl_client || relay.flags.ssl_inspect {
            Some(tls::connector(proto.tls_ca_path.as_deref())?)
        } else {
            None
        };
        listeners.push(Arc::new(RelayListener {
            conf: relay.clone(),
            proto,
            tables: relay_tables,
            acceptor,
            connector,
            active: AtomicUsize::new(0),
        }));
    }

    Ok(RunCfg {
        listeners,
        registry: Mutex::new(registry),
    })
}

fn raise_nofile_limit() -> usize {
    use nix::libc;
    unsafe {
        let mut rl: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) == 0 {
            rl.rlim_cur = rl.rlim_max;
            let _ = libc::setrlimit(libc::RLIMIT_NOFILE, &rl);
            rl.rlim_max as usize
        } else {
            1024
        }
    }
}

pub async fn main<const N: usize>(
    child: Child<N>,
    config: privsep::Config,
) -> Result<(), privsep::Error> {
    let _guard = privsep_log::async_logger(&child.to_string(), &config)
        .await
        .map_err(|err| privsep::Error::GeneralError(Box::new(err)))?;

    let child = Arc::new(child);

    info!("Started");

    let fd_limit = raise_nofile_limit();
    let (ca_tx, ca_rx) = mpsc::unbounded_channel::<CaRequest>();
    tokio::spawn(ca_client(child.clone(), ca_rx));

    let ctx = Arc::new(RelayCtx {
        hosts: RwLock::new(HashMap::new()),
        sessions: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        active: AtomicUsize::new(0),
        fd_limit,
        ca: ca_tx,
    });

    let empty = Arc::new(RunCfg {
        listeners: Vec::new(),
        registry: Mutex::new(rules::Registry::default()),
    });
    let (cfg_tx, _) = watch::channel(empty);

    let mut entities = Entities::default();
    let mut pending_fds: Vec<(Id, Fd)> = Vec::new();
    let mut accept_tasks: HashMap<Id, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            message = default_handler::<Data<'_>>(&child[Privsep::PARENT_ID]) => {
                let (message, fd, data) = message?;
                match (Type::from(message.id), data) {
                    (Type::CtlReset, Data::Reset(scope)) => {
                        debug!("reset"; "scope" => scope.0);
                        entities.reset(scope);
                    }
                    (Type::CfgTable, Data::Table(table)) => {
                        entities.tables.push(table.into_owned());
                    }
                    (Type::CfgHost, Data::Host(host)) => {
                        entities.hosts.push(host.into_owned());
                    }
                    (Type::CfgRelay, Data::Relay(relay)) => {
                        let relay = relay.into_owned();
                        if let Some(fd) = fd {
                            pending_fds.push((relay.id, fd));
                        }
                        entities.relays.push(relay);
                    }
                    (Type::CfgProtocol, Data::Protocol(proto)) => {
                        entities.protocols.push(proto.into_owned());
                    }
                    (Type::CfgRule, Data::Rule(rule)) => {
                        entities.rules.push(rule.into_owned());
                    }
                    (Type::CfgRedirect, _) => {}
                    (Type::CfgDone, _) => {
                        // Shadow area becomes the live configuration in
                        // one swap; running sessions keep their own Arc.
                        match compile(&entities, &ctx) {
                            Ok(cfg) => {
                                let _ = cfg_tx.send(Arc::new(cfg));
                            }
                            Err(err) => warn!("cannot install configuration: {}", err),
                        }
                        child[Privsep::PARENT_ID]
                            .send_message(Type::CfgDone.into(), None, &Data::None)
                            .await?;
                    }
                    (Type::CtlStart, _) => {
                        for (id, fd) in pending_fds.drain(..) {
                            if let Some(task) = accept_tasks.remove(&id) {
                                task.abort();
                            }
                            let udp = cfg_tx
                                .borrow()
                                .listener(id)
                                .map(|l| l.conf.flags.udp)
                                .unwrap_or(false);
                            match spawn_listener(id, fd, udp, cfg_tx.subscribe(), ctx.clone()) {
                                Ok(task) => {
                                    accept_tasks.insert(id, task);
                                }
                                Err(err) => {
                                    warn!("cannot start listener {}: {}", id, err);
                                }
                            }
                        }
                        info!("relays started"; "listeners" => accept_tasks.len());
                    }
                    (Type::CtlSession, _) => {
                        child[Privsep::PARENT_ID]
                            .send_message(
                                Type::CtlSession.into(),
                                None,
                                &Data::Sessions(ctx.session_records()),
                            )
                            .await?;
                    }
                    (Type::CtlShutdown, _) => {
                        info!("shutting down");
                        for (_, task) in accept_tasks.drain() {
                            task.abort();
                        }
                        return Ok(());
                    }
                    _ => return Err(Error::InvalidMessage.into()),
                }
            }
            message = default_handler::<Data<'_>>(&child[Privsep::HEALTH_ID]) => {
                match message? {
                    (Message { id: Type::HOST_STATUS, .. }, _, Data::Status(status)) => {
                        debug!(
                            "host {} is {}", status.id, status.state;
                            "checks" => status.check_cnt,
                        );
                        if let Ok(mut hosts) = ctx.hosts.write() {
                            hosts.insert(status.id, status.state);
                        }
                    }
                    _ => return Err(Error::InvalidMessage.into()),
                }
            }
        }
    }
}

fn spawn_listener(
    id: Id,
    fd: Fd,
    udp: bool,
    cfg_rx: watch::Receiver<Arc<RunCfg>>,
    ctx: Arc<RelayCtx>,
) -> Result<JoinHandle<()>, Error> {
    let raw = fd.as_raw_fd();
    std::mem::forget(fd);
    if udp {
        let socket = unsafe { std::net::UdpSocket::from_raw_fd(raw) };
        socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        Ok(tokio::spawn(udp_loop(id, socket, cfg_rx, ctx)))
    } else {
        let listener = unsafe { std::net::TcpListener::from_raw_fd(raw) };
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        Ok(tokio::spawn(accept_loop(id, listener, cfg_rx, ctx)))
    }
}

async fn accept_loop(
    id: Id,
    listener: TcpListener,
    cfg_rx: watch::Receiver<Arc<RunCfg>>,
    ctx: Arc<RelayCtx>,
) {
    loop {
        // Defer new clients while the descriptor reserve is exhausted.
        while !ctx.may_accept() {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {}", err);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        let cfg = cfg_rx.borrow().clone();
        let rl = match cfg.listener(id) {
            Some(rl) => rl,
            // The relay is gone after a reload; stop accepting.
            None => return,
        };
        if rl.conf.session_limit > 0
            && rl.active.load(std::sync::atomic::Ordering::Relaxed) >= rl.conf.session_limit
        {
            debug!("session limit reached, dropping client"; "relay" => rl.conf.name.clone());
            continue;
        }
        tokio::spawn(session::serve_tcp(rl, ctx.clone(), stream, peer));
    }
}

async fn udp_loop(
    id: Id,
    socket: Arc<UdpSocket>,
    cfg_rx: watch::Receiver<Arc<RunCfg>>,
    ctx: Arc<RelayCtx>,
) {
    let rl = match cfg_rx.borrow().listener(id) {
        Some(rl) => rl,
        None => return,
    };
    session::serve_udp(rl, ctx, socket).await;
}
