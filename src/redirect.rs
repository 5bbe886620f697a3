use crate::{
    config::{Host, HostState, Id, Redirect, Table, EMPTY_ID},
    error::Error,
    message::{self, Data, Type},
    parent::default_handler,
    pf::{Firewall, NullBackend, RdrRule},
    Child, Privsep,
};
use privsep::imsg::Message;
use privsep_log::{debug, info};
use std::{
    collections::{BTreeSet, HashMap},
    net::IpAddr,
    sync::Arc,
};

/// Configuration of the packet filter engine.
#[derive(Debug, Default)]
struct PfeConfig {
    tables: Vec<Table>,
    redirects: Vec<Redirect>,
}

impl PfeConfig {
    fn host(&self, id: Id) -> Option<&Host> {
        self.tables
            .iter()
            .flat_map(|table| table.hosts.iter())
            .find(|host| host.id == id)
    }
}

#[derive(Debug, Default)]
struct Shadow {
    tables: Vec<Table>,
    hosts: Vec<Host>,
    redirects: Vec<Redirect>,
    tables_fresh: bool,
    redirects_fresh: bool,
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

    let mut shadow = Shadow::default();
    let mut live = PfeConfig::default();
    let mut states: HashMap<Id, HostState> = HashMap::new();
    let mut firewall = Firewall::new(NullBackend::default());

    loop {
        tokio::select! {
            message = default_handler::<Data<'_>>(&child[Privsep::PARENT_ID]) => {
                match message? {
                    (Message { id: Type::CTL_RESET, .. }, _, Data::Reset(scope)) => {
                        if scope.has(message::CONFIG_TABLES) {
                            shadow.tables.clear();
                            shadow.hosts.clear();
                            shadow.tables_fresh = true;
                        }
                        if scope.has(message::CONFIG_RDRS) {
                            shadow.redirects.clear();
                            shadow.redirects_fresh = true;
                        }
                    }
                    (Message { id: Type::CFG_TABLE, .. }, _, Data::Table(table)) => {
                        shadow.tables.push(table.into_owned());
                        shadow.tables_fresh = true;
                    }
                    (Message { id: Type::CFG_HOST, .. }, _, Data::Host(host)) => {
                        shadow.hosts.push(host.into_owned());
                    }
                    (Message { id: Type::CFG_REDIRECT, .. }, _, Data::Redirect(rdr)) => {
                        shadow.redirects.push(rdr.into_owned());
                        shadow.redirects_fresh = true;
                    }
                    (Message { id: Type::CFG_RELAY, .. }, ..)
                    | (Message { id: Type::CFG_PROTOCOL, .. }, ..)
                    | (Message { id: Type::CFG_RULE, .. }, ..) => {}
                    (Message { id: Type::CFG_DONE, .. }, ..) => {
                        install(&mut shadow, &mut live, &mut states);
                        // Full reconciliation against the new config.
                        reconcile(&live, &states, &mut firewall);
                        child[Privsep::PARENT_ID]
                            .send_message(Type::CfgDone.into(), None, &Data::None)
                            .await?;
                    }
                    (Message { id: Type::CTL_START, .. }, ..) => {
                        debug!("redirects active"; "count" => live.redirects.len());
                    }
                    (Message { id: Type::CTL_SHUTDOWN, .. }, ..) => {
                        return Ok(());
                    }
                    _ => return Err(Error::InvalidMessage.into()),
                }
            }
            message = default_handler::<Data<'_>>(&child[Privsep::HEALTH_ID]) => {
                match message? {
                    (Message { id: Type::HOST_STATUS, .. }, _, Data::Status(status)) => {
                        let host = live.host(status.id).map(|h| h.name.clone());
                        debug!(
                            "host {} is {}", status.id, status.state;
                            "name" => host.unwrap_or_default(),
                        );
                        states.insert(status.id, status.state);
                        reconcile(&live, &states, &mut firewall);
                    }
                    _ => return Err(Error::InvalidMessage.into()),
                }
            }
        }
    }
}

/// Swap the shadow configuration in, dropping state of hosts that did
/// not survive.
fn install(shadow: &mut Shadow, live: &mut PfeConfig, states: &mut HashMap<Id, HostState>) {
    if shadow.tables_fresh {
        let mut tables = std::mem::take(&mut shadow.tables);
        for host in shadow.hosts.drain(..) {
            if let Some(table) = tables.iter_mut().find(|t| t.id == host.table) {
                table.hosts.push(host);
            }
        }
        live.tables = tables;
        shadow.tables_fresh = false;
        states.retain(|id, _| live.host(*id).is_some());
    }
    if shadow.redirects_fresh {
        live.redirects = std::mem::take(&mut shadow.redirects);
        shadow.redirects_fresh = false;
    }
}

/// Push the wanted state into the packet filter: one anchor per
/// redirect, populated with the live hosts of its table (falling back
/// to the backup table when the main one is empty).
fn reconcile(
    live: &PfeConfig,
    states: &HashMap<Id, HostState>,
    firewall: &mut Firewall<NullBackend>,
) {
    let mut rules = Vec::new();
    for rdr in &live.redirects {
        rules.push(RdrRule {
            id: rdr.id,
            name: rdr.name.clone(),
            listen: rdr.listen.clone(),
            sticky: rdr.sticky,
        });
        let mut addrs = table_addresses(live, states, rdr.table_id);
        if addrs.is_empty() && rdr.backup_id != EMPTY_ID {
            addrs = table_addresses(live, states, rdr.backup_id);
        }
        firewall.sync_table(&rdr.name, addrs);
    }
    firewall.sync_redirects(rules);
}

fn table_addresses(
    live: &PfeConfig,
    states: &HashMap<Id, HostState>,
    table: Id,
) -> BTreeSet<IpAddr> {
    live.tables
        .iter()
        .filter(|t| t.id == table && !t.disabled)
        .flat_map(|t| t.hosts.iter())
        .filter(|host| {
            states
                .get(&host.id)
                .copied()
                .unwrap_or(HostState::Unknown)
                .is_up()
        })
        .map(|host| host.address)
        .collect()
}
