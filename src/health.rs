mod check;

use crate::{
    config::{Host, HostState, Id, Table},
    error::Error,
    message::{self, CtlId, Data, Status, Type},
    parent::default_handler,
    Child, Privsep,
};
use check::ScriptGate;
use privsep::imsg::Message;
use privsep_log::{debug, info, warn};
use rand::Rng;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

/// Per-host check state driving the hysteresis machine.
#[derive(Debug)]
struct HostRun {
    state: HostState,
    disabled: bool,
    up_streak: usize,
    down_streak: usize,
    check_cnt: u64,
    retry: usize,
    parent: Option<Id>,
}

impl HostRun {
    fn new(host: &Host) -> Self {
        Self {
            state: HostState::Unknown,
            disabled: false,
            up_streak: 0,
            down_streak: 0,
            check_cnt: 0,
            retry: host.retry.max(1),
            parent: host.parent,
        }
    }

    /// Feed one probe result; returns the new state on a transition.
    fn apply(&mut self, ok: bool) -> Option<HostState> {
        self.check_cnt += 1;
        if self.disabled {
            return None;
        }
        if ok {
            self.down_streak = 0;
            self.up_streak += 1;
            if self.state != HostState::Up && self.up_streak >= self.retry {
                self.state = HostState::Up;
                return Some(HostState::Up);
            }
        } else {
            self.up_streak = 0;
            self.down_streak += 1;
            if self.state != HostState::Down && self.down_streak >= self.retry {
                self.state = HostState::Down;
                return Some(HostState::Down);
            }
        }
        None
    }
}

#[derive(Debug)]
struct CheckResult {
    host: Id,
    ok: bool,
    reason: &'static str,
}

#[derive(Debug, Default)]
struct Shadow {
    tables: Vec<Table>,
    hosts: Vec<Host>,
}

impl Shadow {
    /// Attach the streamed hosts to their tables.
    fn assemble(&mut self) -> Vec<Table> {
        let mut tables = std::mem::take(&mut self.tables);
        for host in self.hosts.drain(..) {
            if let Some(table) = tables.iter_mut().find(|t| t.id == host.table) {
                table.hosts.push(host);
            }
        }
        tables
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

    let (result_tx, mut result_rx) = mpsc::channel::<CheckResult>(256);
    let (script_gate, mut script_rx) = ScriptGate::new();
    let mut pending_scripts: HashMap<Id, VecDeque<oneshot::Sender<i32>>> = HashMap::new();

    let mut shadow = Shadow::default();
    let mut fresh = false;
    let mut tables: Vec<Table> = Vec::new();
    let mut runs: HashMap<Id, HostRun> = HashMap::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            message = default_handler::<Data<'_>>(&child[Privsep::PARENT_ID]) => {
                match message? {
                    (Message { id: Type::CTL_RESET, .. }, _, Data::Reset(scope)) => {
                        if scope.has(message::CONFIG_TABLES) {
                            shadow = Shadow::default();
                            fresh = true;
                        }
                    }
                    (Message { id: Type::CFG_TABLE, .. }, _, Data::Table(table)) => {
                        shadow.tables.push(table.into_owned());
                        fresh = true;
                    }
                    (Message { id: Type::CFG_HOST, .. }, _, Data::Host(host)) => {
                        shadow.hosts.push(host.into_owned());
                    }
                    (Message { id: Type::CFG_RELAY, .. }, ..)
                    | (Message { id: Type::CFG_PROTOCOL, .. }, ..)
                    | (Message { id: Type::CFG_RULE, .. }, ..)
                    | (Message { id: Type::CFG_REDIRECT, .. }, ..) => {}
                    (Message { id: Type::CFG_DONE, .. }, ..) => {
                        if fresh {
                            tables = shadow.assemble();
                            fresh = false;
                        }
                        // Keep collected state for host ids that survive
                        // the reload; the parent keeps ids stable for
                        // structurally unchanged tables.
                        let mut next = HashMap::new();
                        for table in &tables {
                            for host in &table.hosts {
                                let run = runs
                                    .remove(&host.id)
                                    .unwrap_or_else(|| HostRun::new(host));
                                next.insert(host.id, run);
                            }
                        }
                        runs = next;
                        child[Privsep::PARENT_ID]
                            .send_message(Type::CfgDone.into(), None, &Data::None)
                            .await?;
                    }
                    (Message { id: Type::CTL_START, .. }, ..) => {
                        for task in tasks.drain(..) {
                            task.abort();
                        }
                        let mut count = 0;
                        for table in &tables {
                            if table.disabled
                                || table.check == crate::config::Check::NoCheck
                            {
                                continue;
                            }
                            for host in &table.hosts {
                                // Hosts with a parent inherit its state
                                // instead of being probed themselves.
                                if host.parent.is_some() {
                                    continue;
                                }
                                tasks.push(tokio::spawn(check_loop(
                                    table.clone(),
                                    host.clone(),
                                    result_tx.clone(),
                                    script_gate.clone(),
                                )));
                                count += 1;
                            }
                        }
                        info!("checks started"; "hosts" => count);
                    }
                    (Message { id: Type::SCRIPT, .. }, _, Data::Script(op)) => {
                        if let Some(reply) = pending_scripts
                            .get_mut(&op.host)
                            .and_then(|queue| queue.pop_front())
                        {
                            let _ = reply.send(op.retval);
                        }
                    }
                    (Message { id: Type::CTL_HOST_DISABLE, .. }, _, Data::CtlId(sel)) => {
                        toggle_hosts(&child, &tables, &mut runs, &sel, true).await?;
                    }
                    (Message { id: Type::CTL_HOST_ENABLE, .. }, _, Data::CtlId(sel)) => {
                        toggle_hosts(&child, &tables, &mut runs, &sel, false).await?;
                    }
                    (Message { id: Type::CTL_TABLE_DISABLE, .. }, _, Data::CtlId(sel)) => {
                        toggle_table(&child, &tables, &mut runs, &sel, true).await?;
                    }
                    (Message { id: Type::CTL_TABLE_ENABLE, .. }, _, Data::CtlId(sel)) => {
                        toggle_table(&child, &tables, &mut runs, &sel, false).await?;
                    }
                    (Message { id: Type::CTL_SHUTDOWN, .. }, ..) => {
                        for task in tasks.drain(..) {
                            task.abort();
                        }
                        return Ok(());
                    }
                    _ => return Err(Error::InvalidMessage.into()),
                }
            }
            request = script_rx.recv() => {
                if let Some((op, reply)) = request {
                    pending_scripts.entry(op.host).or_default().push_back(reply);
                    child[Privsep::PARENT_ID]
                        .send_message(Type::Script.into(), None, &Data::Script(op))
                        .await?;
                }
            }
            result = result_rx.recv() => {
                let result = match result {
                    Some(result) => result,
                    None => continue,
                };
                let transition = match runs.get_mut(&result.host) {
                    Some(run) => {
                        let transition = run.apply(result.ok);
                        if transition.is_none() {
                            debug!(
                                "host {} check: {}", result.host, result.reason;
                                "up" => result.ok,
                            );
                        }
                        transition.map(|state| (state, run.check_cnt))
                    }
                    None => None,
                };
                if let Some((state, check_cnt)) = transition {
                    publish(&child, result.host, state, check_cnt).await?;
                    // Children inherit the parent host state.
                    let inherited: Vec<Id> = runs
                        .iter()
                        .filter(|(_, run)| run.parent == Some(result.host))
                        .map(|(id, _)| *id)
                        .collect();
                    for id in inherited {
                        if let Some(run) = runs.get_mut(&id) {
                            if !run.disabled && run.state != state {
                                run.state = state;
                                let cnt = run.check_cnt;
                                publish(&child, id, state, cnt).await?;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Report a host state transition to the parent, the relays and the
/// packet filter engine.
async fn publish<const N: usize>(
    child: &Arc<Child<N>>,
    host: Id,
    state: HostState,
    check_cnt: u64,
) -> Result<(), Error> {
    info!("host {} is {}", host, state);
    let status = Status {
        id: host,
        state,
        check_cnt,
    };
    for peer in [Privsep::PARENT_ID, Privsep::RELAY_ID, Privsep::REDIRECT_ID] {
        child[peer]
            .send_message(Type::HostStatus.into(), None, &Data::Status(status.clone()))
            .await?;
    }
    Ok(())
}

fn select_host_ids(tables: &[Table], sel: &CtlId) -> Vec<Id> {
    tables
        .iter()
        .flat_map(|table| table.hosts.iter())
        .filter(|host| {
            sel.id.map(|id| host.id == id).unwrap_or(false)
                || sel
                    .name
                    .as_deref()
                    .map(|name| host.name == name)
                    .unwrap_or(false)
        })
        .map(|host| host.id)
        .collect()
}

async fn toggle_hosts<const N: usize>(
    child: &Arc<Child<N>>,
    tables: &[Table],
    runs: &mut HashMap<Id, HostRun>,
    sel: &CtlId,
    disable: bool,
) -> Result<(), Error> {
    for id in select_host_ids(tables, sel) {
        toggle(child, runs, id, disable).await?;
    }
    Ok(())
}

async fn toggle_table<const N: usize>(
    child: &Arc<Child<N>>,
    tables: &[Table],
    runs: &mut HashMap<Id, HostRun>,
    sel: &CtlId,
    disable: bool,
) -> Result<(), Error> {
    let table = tables.iter().find(|table| {
        sel.id.map(|id| table.id == id).unwrap_or(false)
            || sel
                .name
                .as_deref()
                .map(|name| table.name == name)
                .unwrap_or(false)
    });
    if let Some(table) = table {
        for host in &table.hosts {
            toggle(child, runs, host.id, disable).await?;
        }
    } else {
        warn!("unknown table in control request");
    }
    Ok(())
}

async fn toggle<const N: usize>(
    child: &Arc<Child<N>>,
    runs: &mut HashMap<Id, HostRun>,
    id: Id,
    disable: bool,
) -> Result<(), Error> {
    if let Some(run) = runs.get_mut(&id) {
        let (state, cnt) = if disable {
            run.disabled = true;
            run.state = HostState::Disabled;
            (HostState::Disabled, run.check_cnt)
        } else {
            run.disabled = false;
            run.state = HostState::Unknown;
            run.up_streak = 0;
            run.down_streak = 0;
            (HostState::Unknown, run.check_cnt)
        };
        publish(child, id, state, cnt).await?;
    }
    Ok(())
}

/// Periodic probe driver for one host; fires immediately, then every
/// interval with a +-10% jitter.
async fn check_loop(
    table: Table,
    host: Host,
    results: mpsc::Sender<CheckResult>,
    scripts: ScriptGate,
) {
    loop {
        let (ok, reason) = check::probe(&table, &host, &scripts).await;
        if results
            .send(CheckResult {
                host: host.id,
                ok,
                reason,
            })
            .await
            .is_err()
        {
            return;
        }
        let millis = table.interval.as_millis().max(1000) as u64;
        let jitter = rand::thread_rng().gen_range(0..=millis / 5);
        let interval = std::time::Duration::from_millis(millis * 9 / 10 + jitter);
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(retry: usize) -> Host {
        Host {
            id: 1,
            retry,
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_to_up_needs_retry_successes() {
        let mut run = HostRun::new(&host(3));
        assert_eq!(run.apply(true), None);
        assert_eq!(run.apply(true), None);
        assert_eq!(run.apply(true), Some(HostState::Up));
        // Further successes stay silent.
        assert_eq!(run.apply(true), None);
    }

    /// Fewer than `retry` consecutive failures never take a host down.
    #[test]
    fn test_hysteresis_tolerates_blips() {
        let mut run = HostRun::new(&host(3));
        for _ in 0..3 {
            run.apply(true);
        }
        assert_eq!(run.state, HostState::Up);

        for _ in 0..100 {
            assert_eq!(run.apply(false), None);
            assert_eq!(run.apply(false), None);
            assert_eq!(run.apply(true), None);
        }
        assert_eq!(run.state, HostState::Up);
    }

    #[test]
    fn test_up_down_up_transitions() {
        let mut run = HostRun::new(&host(3));
        let mut transitions = Vec::new();
        for ok in [true, true, true, false, false, false, true, true, true] {
            if let Some(state) = run.apply(ok) {
                transitions.push(state);
            }
        }
        assert_eq!(
            transitions,
            vec![HostState::Up, HostState::Down, HostState::Up]
        );
        assert_eq!(run.check_cnt, 9);
    }

    #[test]
    fn test_retry_zero_flips_after_one_result() {
        let mut run = HostRun::new(&host(0));
        assert_eq!(run.apply(true), Some(HostState::Up));
        assert_eq!(run.apply(false), Some(HostState::Down));
    }

    #[test]
    fn test_disabled_host_ignores_results() {
        let mut run = HostRun::new(&host(1));
        run.disabled = true;
        run.state = HostState::Disabled;
        assert_eq!(run.apply(true), None);
        assert_eq!(run.state, HostState::Disabled);
    }
}
