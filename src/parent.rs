use crate::{
    config::{Config, HostState, Id, Variables},
    control,
    error::Error,
    message::{self, ConfigScope, Data, ScriptOp, SessionRecord, Status, Summary, Type},
    options::Options,
    Privsep,
};
use nix::sys::wait::{waitpid, WaitStatus};
use privsep::{
    imsg::Message,
    net::Fd,
    process::{daemon, Parent, Peer},
    Error as PrivsepError,
};
use privsep_log::{debug, info, warn};
use serde::de::DeserializeOwned;
use std::{
    collections::{HashMap, VecDeque},
    io,
    os::unix::io::FromRawFd,
    process,
    sync::Arc,
};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};

/// The worker processes fed by the configuration fan-out.
const WORKERS: [usize; 4] = [
    Privsep::HEALTH_ID,
    Privsep::REDIRECT_ID,
    Privsep::RELAY_ID,
    Privsep::CA_ID,
];

/// Parent runtime state.
struct Env {
    config: Config,
    config_path: String,
    variables: Variables,
    /// First free object id for the next reload generation.
    next_id: Id,
    /// Outstanding CFG_DONE acknowledgements.
    reload_pending: usize,
    host_states: HashMap<Id, (HostState, u64)>,
    /// Control clients subscribed with MONITOR.
    monitors: Vec<mpsc::Sender<(Type, Data<'static>)>>,
    /// Control clients waiting for a relay session listing.
    session_waiters: VecDeque<mpsc::Sender<(Type, Data<'static>)>>,
    verbose: bool,
}

pub async fn main<const N: usize>(
    parent: Parent<N>,
    privsep: privsep::Config,
) -> Result<(), privsep::Error> {
    let _guard = privsep_log::async_logger(&parent.to_string(), &privsep)
        .await
        .map_err(|err| PrivsepError::GeneralError(Box::new(err)))?;

    let parent = Arc::new(parent);

    let (config, config_path, variables) = init()
        .await
        .map_err(|err| PrivsepError::GeneralError(Box::new(err)))?;

    let mut sigchld = signal(SignalKind::child())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    // Detach the parent from the foreground.
    if !privsep.foreground {
        daemon(true, false)?;
    }

    info!("Started");

    let next_id = config_max_id(&config) + 1;
    let mut env = Env {
        config,
        config_path,
        variables,
        next_id,
        reload_pending: 0,
        host_states: HashMap::new(),
        monitors: Vec::new(),
        session_waiters: VecDeque::new(),
        verbose: false,
    };

    // Control socket.
    let (ctl_tx, mut ctl_rx) = mpsc::channel::<control::Request>(64);
    let socket_path = env.config.socket.clone();
    let _ = std::fs::remove_file(&socket_path);
    let listener = tokio::net::UnixListener::bind(&socket_path)?;
    control::restrict(&socket_path);
    tokio::spawn(control::serve(listener, ctl_tx));

    // Script results funneled back into the main loop.
    let (script_tx, mut script_rx) = mpsc::channel::<ScriptOp>(64);

    // Initial configuration fan-out.
    configure(&parent, &mut env, ConfigScope::all())
        .await
        .map_err(|err| PrivsepError::GeneralError(Box::new(err)))?;

    loop {
        tokio::select! {
            _ = sigchld.recv() => {
                match waitpid(None, None) {
                    Ok(WaitStatus::Exited(pid, status)) => {
                        warn!("Child {} exited with status {}", pid, status);
                        process::exit(0);
                    }
                    status => {
                        warn!("Child exited with error: {:?}", status);
                        process::exit(1);
                    }
                }
            }

            _ = sighup.recv() => {
                if let Err(err) = reload(&parent, &mut env).await {
                    warn!("reload failed: {}", err);
                }
            }

            _ = sigterm.recv() => {
                shutdown(&parent).await;
            }

            _ = sigint.recv() => {
                shutdown(&parent).await;
            }

            message = default_handler::<Data<'_>>(&parent[Privsep::HEALTH_ID]) => {
                let (message, _, data) = message?;
                match (Type::from(message.id), data) {
                    (Type::CfgDone, _) => {
                        configure_done(&parent, &mut env).await?;
                    }
                    (Type::Script, Data::Script(op)) => {
                        let results = script_tx.clone();
                        tokio::spawn(async move {
                            let op = script_exec(op).await;
                            let _ = results.send(op).await;
                        });
                    }
                    (Type::HostStatus, Data::Status(status)) => {
                        host_status(&mut env, status).await;
                    }
                    _ => return Err(Error::InvalidMessage.into()),
                }
            }

            message = default_handler::<Data<'_>>(&parent[Privsep::RELAY_ID]) => {
                let (message, _, data) = message?;
                match (Type::from(message.id), data) {
                    (Type::CfgDone, _) => {
                        configure_done(&parent, &mut env).await?;
                    }
                    (Type::Bindany, Data::Bindany(op)) => {
                        bindany(&parent, op).await?;
                    }
                    (Type::CtlSession, Data::Sessions(records)) => {
                        session_records(&mut env, records).await;
                    }
                    _ => return Err(Error::InvalidMessage.into()),
                }
            }

            message = default_handler::<Data<'_>>(&parent[Privsep::REDIRECT_ID]) => {
                let (message, _, _data) = message?;
                match Type::from(message.id) {
                    Type::CfgDone => {
                        configure_done(&parent, &mut env).await?;
                    }
                    _ => return Err(Error::InvalidMessage.into()),
                }
            }

            message = default_handler::<Data<'_>>(&parent[Privsep::CA_ID]) => {
                let (message, _, _data) = message?;
                match Type::from(message.id) {
                    Type::CfgDone => {
                        configure_done(&parent, &mut env).await?;
                    }
                    _ => return Err(Error::InvalidMessage.into()),
                }
            }

            op = script_rx.recv() => {
                if let Some(op) = op {
                    parent[Privsep::HEALTH_ID]
                        .send_message(Type::Script.into(), None, &Data::Script(op))
                        .await?;
                }
            }

            request = ctl_rx.recv() => {
                if let Some(request) = request {
                    if let Err(err) = handle_control(&parent, &mut env, request).await {
                        warn!("control request failed: {}", err);
                    }
                }
            }
        }
    }
}

async fn shutdown<const N: usize>(parent: &Arc<Parent<N>>) {
    info!("shutting down");
    for id in WORKERS {
        let _ = parent[id]
            .send_message(Type::CtlShutdown.into(), None, &Data::None)
            .await;
    }
    // Bounded grace period for the workers to flush and exit.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    process::exit(0);
}

/// Parse the command line and load the configuration file.
pub async fn init() -> Result<(Config, String, Variables), Error> {
    let opts = Options::new();
    let matches = opts.parse()?;

    let path = matches
        .opt_str("f")
        .unwrap_or_else(|| crate::RELAYD_CONFIG.to_string());

    let mut variables = Variables::new();
    for variable in matches.opt_strs("D") {
        match variable.split_once('=') {
            Some((key, value)) => {
                variables.insert(key.to_string(), value.to_string());
            }
            None => return Err(Error::ParserError(variable)),
        }
    }

    let config = Config::load(&path, variables.clone()).await?;

    Ok((config, path, variables))
}

fn config_max_id(config: &Config) -> Id {
    let mut max = 0;
    for table in &config.tables {
        max = max.max(table.id);
        for host in &table.hosts {
            max = max.max(host.id);
        }
    }
    for rdr in &config.redirects {
        max = max.max(rdr.id);
    }
    for proto in &config.protocols {
        max = max.max(proto.id);
        for rule in &proto.rules {
            max = max.max(rule.id);
        }
    }
    for relay in &config.relays {
        max = max.max(relay.id);
        for id in [relay.ssl_keyid, relay.ssl_cakeyid] {
            if id != crate::config::EMPTY_ID {
                max = max.max(id);
            }
        }
    }
    max
}

fn nix_io(err: nix::Error) -> Error {
    Error::IoError(io::Error::new(io::ErrorKind::Other, err))
}

/// Open a relay listener socket; the descriptor is passed to the
/// relay process with its configuration.
fn open_listener(relay: &crate::config::Relay) -> Result<Fd, Error> {
    use nix::sys::socket::{
        bind, listen, setsockopt, socket, sockopt, AddressFamily, InetAddr, SockAddr, SockFlag,
        SockType,
    };

    let family = if relay.listen.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    let typ = if relay.flags.udp {
        SockType::Datagram
    } else {
        SockType::Stream
    };
    let fd = socket(family, typ, SockFlag::empty(), None).map_err(nix_io)?;
    setsockopt(fd, sockopt::ReuseAddr, &true).map_err(nix_io)?;
    let addr = SockAddr::new_inet(InetAddr::from_std(&relay.listen));
    bind(fd, &addr).map_err(nix_io)?;
    if !relay.flags.udp {
        listen(fd, crate::RELAY_BACKLOG as usize).map_err(nix_io)?;
    }
    Ok(unsafe { Fd::from_raw_fd(fd) })
}

/// Stream the configuration to every worker: reset, entities, done.
/// Private keys only travel to the ca process and are zeroed in the
/// parent afterwards.
async fn configure<const N: usize>(
    parent: &Arc<Parent<N>>,
    env: &mut Env,
    scope: ConfigScope,
) -> Result<(), Error> {
    if env.reload_pending > 0 {
        return Err(Error::ConfigError("reload already in progress".to_string()));
    }

    // Open the privileged listener sockets first: a failed bind must
    // not leave the workers half-reset behind a hanging barrier.
    let mut listener_fds = Vec::new();
    if scope.has(message::CONFIG_RELAYS) {
        for relay in &env.config.relays {
            listener_fds.push(open_listener(relay)?);
        }
    }

    env.reload_pending = WORKERS.len();

    for id in WORKERS {
        parent[id]
            .send_message(Type::CtlReset.into(), None, &Data::Reset(scope))
            .await?;
    }

    if scope.has(message::CONFIG_TABLES) {
        for table in &env.config.tables {
            let mut wire = table.clone();
            let hosts = std::mem::take(&mut wire.hosts);
            for id in [Privsep::HEALTH_ID, Privsep::REDIRECT_ID, Privsep::RELAY_ID] {
                parent[id]
                    .send_message(Type::CfgTable.into(), None, &Data::from(&wire))
                    .await?;
            }
            for host in &hosts {
                for id in [Privsep::HEALTH_ID, Privsep::REDIRECT_ID, Privsep::RELAY_ID] {
                    parent[id]
                        .send_message(Type::CfgHost.into(), None, &Data::from(host))
                        .await?;
                }
            }
        }
    }

    if scope.has(message::CONFIG_RDRS) {
        for rdr in &env.config.redirects {
            parent[Privsep::REDIRECT_ID]
                .send_message(Type::CfgRedirect.into(), None, &Data::from(rdr))
                .await?;
        }
    }

    if scope.has(message::CONFIG_PROTOS) {
        for proto in &env.config.protocols {
            let wire = proto.without_rules();
            parent[Privsep::RELAY_ID]
                .send_message(
                    Type::CfgProtocol.into(),
                    None,
                    &Data::Protocol(std::borrow::Cow::Borrowed(&wire)),
                )
                .await?;
            for rule in &proto.rules {
                parent[Privsep::RELAY_ID]
                    .send_message(
                        Type::CfgRule.into(),
                        None,
                        &Data::Rule(std::borrow::Cow::Borrowed(rule)),
                    )
                    .await?;
            }
        }
    }

    if scope.has(message::CONFIG_RELAYS) {
        for (relay, fd) in env.config.relays.iter().zip(&listener_fds) {
            // The relay gets the listener socket but never the keys.
            let wire = relay.without_keys();
            parent[Privsep::RELAY_ID]
                .send_message(
                    Type::CfgRelay.into(),
                    Some(fd),
                    &Data::Relay(std::borrow::Cow::Borrowed(&wire)),
                )
                .await?;
            parent[Privsep::CA_ID]
                .send_message(
                    Type::CfgRelay.into(),
                    None,
                    &Data::Relay(std::borrow::Cow::Borrowed(relay)),
                )
                .await?;
        }
        // The keys have been handed over; drop our copy.
        for relay in &mut env.config.relays {
            relay.purge_keys();
        }
    }

    for id in WORKERS {
        parent[id]
            .send_message(Type::CfgDone.into(), None, &Data::None)
            .await?;
    }

    debug!("configuration sent"; "pending" => env.reload_pending);
    Ok(())
}

/// One worker acknowledged CFG_DONE; the last one releases the start
/// barrier.
async fn configure_done<const N: usize>(
    parent: &Arc<Parent<N>>,
    env: &mut Env,
) -> Result<(), Error> {
    if env.reload_pending == 0 {
        return Ok(());
    }
    env.reload_pending -= 1;
    if env.reload_pending == 0 {
        for id in WORKERS {
            parent[id]
                .send_message(Type::CtlStart.into(), None, &Data::None)
                .await?;
        }
        info!("configuration applied");
    }
    Ok(())
}

/// SIGHUP or a control request: re-read the file and fan out the new
/// configuration.  A parse error keeps the previous one live.
async fn reload<const N: usize>(parent: &Arc<Parent<N>>, env: &mut Env) -> Result<(), Error> {
    if env.reload_pending > 0 {
        warn!("reload already in progress");
        return Err(Error::ConfigError("reload already in progress".to_string()));
    }
    info!("reloading configuration"; "path" => env.config_path.clone());

    let mut config = match Config::load(&env.config_path, env.variables.clone()).await {
        Ok(config) => config,
        Err(err) => {
            warn!("keeping old configuration: {}", err);
            return Err(err);
        }
    };
    config.rebase(env.next_id);
    config.reconcile(&env.config);
    env.next_id = config_max_id(&config).max(env.next_id) + 1;
    env.config = config;
    // Stale transition data from removed hosts.
    let config = &env.config;
    env.host_states.retain(|id, _| {
        config
            .tables
            .iter()
            .any(|t| t.hosts.iter().any(|h| h.id == *id))
    });

    configure(parent, env, ConfigScope::all()).await
}

/// Run a check script on behalf of the hce with a wall-clock limit,
/// under the unprivileged account.
async fn script_exec(mut op: ScriptOp) -> ScriptOp {
    use std::os::unix::process::CommandExt;

    let mut cmd = std::process::Command::new(&op.path);
    cmd.arg(&op.name)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Ok(Some(user)) = nix::unistd::User::from_name("nobody") {
        if nix::unistd::geteuid().is_root() {
            cmd.uid(user.uid.as_raw());
        }
    }
    let mut cmd = tokio::process::Command::from(cmd);
    cmd.kill_on_drop(true);

    let timeout = if op.timeout.is_zero() {
        crate::CHECK_TIMEOUT
    } else {
        op.timeout
    };
    op.retval = match cmd.spawn() {
        Ok(mut child) => match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status.code().unwrap_or(-1),
            Ok(Err(_)) => -1,
            Err(_) => {
                let _ = child.kill().await;
                -1
            }
        },
        Err(err) => {
            warn!("cannot run {}: {}", op.path.display(), err);
            -1
        }
    };
    op
}

/// Answer a relay's request for a privileged socket with the bound
/// descriptor.
async fn bindany<const N: usize>(
    parent: &Arc<Parent<N>>,
    op: message::BindanyOp,
) -> Result<(), Error> {
    use nix::sys::socket::{
        bind, setsockopt, socket, sockopt, AddressFamily, InetAddr, SockAddr, SockFlag, SockType,
    };

    let family = if op.addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    let result = socket(family, SockType::Stream, SockFlag::empty(), None)
        .map_err(nix_io)
        .and_then(|fd| {
            setsockopt(fd, sockopt::ReuseAddr, &true).map_err(nix_io)?;
            bind(fd, &SockAddr::new_inet(InetAddr::from_std(&op.addr))).map_err(nix_io)?;
            Ok(unsafe { Fd::from_raw_fd(fd) })
        });
    match result {
        Ok(fd) => {
            parent[Privsep::RELAY_ID]
                .send_message(Type::Bindany.into(), Some(&fd), &Data::Bindany(op))
                .await?;
        }
        Err(err) => {
            warn!("bindany failed: {}", err);
            parent[Privsep::RELAY_ID]
                .send_message(Type::Bindany.into(), None, &Data::Bindany(op))
                .await?;
        }
    }
    Ok(())
}

async fn host_status(env: &mut Env, status: Status) {
    debug!("host {} is {}", status.id, status.state);
    env.host_states
        .insert(status.id, (status.state, status.check_cnt));
    // Fan out to MONITOR subscribers, dropping the disconnected.
    let mut alive = Vec::new();
    for monitor in env.monitors.drain(..) {
        if monitor
            .send((Type::HostStatus, Data::Status(status.clone())))
            .await
            .is_ok()
        {
            alive.push(monitor);
        }
    }
    env.monitors = alive;
}

async fn session_records(env: &mut Env, records: Vec<SessionRecord>) {
    if let Some(waiter) = env.session_waiters.pop_front() {
        for record in records {
            let _ = waiter.send((Type::CtlSession, Data::Session(record))).await;
        }
        let _ = waiter.send((Type::CtlEnd, Data::None)).await;
    }
}

/// Dispatch one control socket request.
async fn handle_control<const N: usize>(
    parent: &Arc<Parent<N>>,
    env: &mut Env,
    request: control::Request,
) -> Result<(), Error> {
    use crate::message::ShowKind;

    let control::Request { typ, data, reply } = request;
    match (typ, data) {
        (Type::CtlShow, Data::Show(ShowKind::Summary)) => {
            let summary = Summary {
                redirects: env.config.redirects.len(),
                tables: env.config.tables.len(),
                hosts: env
                    .config
                    .tables
                    .iter()
                    .map(|t| t.hosts.len())
                    .sum(),
                relays: env.config.relays.len(),
                reload_pending: env.reload_pending,
            };
            let _ = reply.send((Type::CtlSummary, Data::Summary(summary))).await;
            let _ = reply.send((Type::CtlEnd, Data::None)).await;
        }
        (Type::CtlShow, Data::Show(ShowKind::Hosts)) => {
            for table in &env.config.tables {
                let _ = reply
                    .send((Type::CfgTable, Data::Table(std::borrow::Cow::Owned(
                        {
                            let mut wire = table.clone();
                            wire.hosts = Vec::new();
                            wire
                        },
                    ))))
                    .await;
                for host in &table.hosts {
                    let (state, check_cnt) = env
                        .host_states
                        .get(&host.id)
                        .copied()
                        .unwrap_or((HostState::Unknown, 0));
                    let record = message::HostRecord {
                        host: host.clone(),
                        state,
                        check_cnt,
                    };
                    let _ = reply
                        .send((Type::CtlHost, Data::HostRecord(Box::new(record))))
                        .await;
                }
            }
            let _ = reply.send((Type::CtlEnd, Data::None)).await;
        }
        (Type::CtlShow, Data::Show(ShowKind::Relays)) => {
            for relay in &env.config.relays {
                let _ = reply
                    .send((
                        Type::CfgRelay,
                        Data::Relay(std::borrow::Cow::Owned(relay.without_keys())),
                    ))
                    .await;
            }
            let _ = reply.send((Type::CtlEnd, Data::None)).await;
        }
        (Type::CtlShow, Data::Show(ShowKind::Redirects)) => {
            for rdr in &env.config.redirects {
                let _ = reply
                    .send((
                        Type::CfgRedirect,
                        Data::Redirect(std::borrow::Cow::Owned(rdr.clone())),
                    ))
                    .await;
            }
            let _ = reply.send((Type::CtlEnd, Data::None)).await;
        }
        (Type::CtlShow, Data::Show(ShowKind::Sessions)) => {
            env.session_waiters.push_back(reply);
            parent[Privsep::RELAY_ID]
                .send_message(Type::CtlSession.into(), None, &Data::None)
                .await?;
        }
        (
            typ @ (Type::CtlHostEnable
            | Type::CtlHostDisable
            | Type::CtlTableEnable
            | Type::CtlTableDisable),
            Data::CtlId(sel),
        ) => {
            parent[Privsep::HEALTH_ID]
                .send_message(typ.into(), None, &Data::CtlId(sel))
                .await?;
            let _ = reply.send((Type::CtlOk, Data::None)).await;
            let _ = reply.send((Type::CtlEnd, Data::None)).await;
        }
        (Type::CtlReload, _) => {
            match reload(parent, env).await {
                Ok(()) => {
                    let _ = reply.send((Type::CtlOk, Data::None)).await;
                }
                Err(err) => {
                    let _ = reply
                        .send((Type::CtlFail, Data::Fail(err.to_string())))
                        .await;
                }
            }
            let _ = reply.send((Type::CtlEnd, Data::None)).await;
        }
        (Type::CtlReset, Data::Reset(scope)) => {
            match configure(parent, env, scope).await {
                Ok(()) => {
                    let _ = reply.send((Type::CtlOk, Data::None)).await;
                }
                Err(err) => {
                    let _ = reply
                        .send((Type::CtlFail, Data::Fail(err.to_string())))
                        .await;
                }
            }
            let _ = reply.send((Type::CtlEnd, Data::None)).await;
        }
        (Type::CtlLog, Data::Verbose(verbose)) => {
            env.verbose = verbose;
            info!("log verbosity set"; "verbose" => verbose);
            let _ = reply.send((Type::CtlOk, Data::None)).await;
            let _ = reply.send((Type::CtlEnd, Data::None)).await;
        }
        (Type::CtlMonitor, _) => {
            let _ = reply.send((Type::CtlOk, Data::None)).await;
            env.monitors.push(reply);
        }
        _ => {
            let _ = reply
                .send((Type::CtlFail, Data::Fail("unknown command".to_string())))
                .await;
            let _ = reply.send((Type::CtlEnd, Data::None)).await;
        }
    }
    Ok(())
}

pub async fn default_handler<T: DeserializeOwned>(
    peer: &Peer,
) -> Result<(Message, Option<Fd>, T), Error> {
    match peer.recv_message::<T>().await? {
        None => Err(Error::Terminated(peer.as_ref().to_string())),
        Some((message, fd, data)) => {
            debug!(
                "received message {}", Type::from(message.id);
                "source" => peer.as_ref(),
            );

            Ok((message, fd, data))
        }
    }
}
