mod expand;
mod parser;

use crate::error::Error;
use expand::config_expand;
use nom::{error::convert_error, Finish};
use parser::config_parser;
use serde_derive::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;

/// General relayd object Id.
pub type Id = u32;

/// Id value reserved for "not set".
pub const EMPTY_ID: Id = Id::MAX;

#[serde_as]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The interval in seconds at which the hosts will be checked.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
    /// Create a control socket at path.
    pub socket: PathBuf,
    /// The global timeout in milliseconds for checks.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,

    pub redirects: Vec<Redirect>,
    pub relays: Vec<Relay>,
    pub protocols: Vec<Protocol>,
    pub tables: Vec<Table>,
    // Currently not supported:
    //agentx: not supported
    //prefork: not supported
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: crate::CHECK_INTERVAL,
            socket: PathBuf::from(crate::RELAYD_SOCKET),
            timeout: crate::CHECK_TIMEOUT,
            redirects: Default::default(),
            relays: Default::default(),
            protocols: Default::default(),
            tables: Default::default(),
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path> + ?Sized>(
        path: &P,
        variables: Variables,
    ) -> Result<Self, Error> {
        let input = fs::read_to_string(path).await?;
        let mut config = Self::parse(input, variables)?;
        config.finalize().await?;
        Ok(config)
    }

    pub fn parse<S: AsRef<str>>(input: S, variables: Variables) -> Result<Self, Error> {
        let mut input = input.as_ref().to_string();
        if !input.ends_with('\n') {
            input.push('\n');
        }
        let input = input.as_str();
        let (_, input) = config_expand(input, variables)
            .finish()
            .map_err(|err| Error::ParserError(convert_error(input, err)))?;
        let input = input.as_ref();
        config_parser(input)
            .finish()
            .map_err(|err| Error::ParserError(convert_error(input, err)))
            .map(|(_, o)| o)
    }

    /// Mint object ids, resolve names and host addresses, and load the
    /// TLS keys and certificates into memory.  Only the parent calls
    /// this; workers receive finished entities over their channels.
    pub async fn finalize(&mut self) -> Result<(), Error> {
        let mut id: Id = 0;
        let mut next = move || {
            id += 1;
            id
        };

        let mut table_names = HashSet::new();
        for table in &mut self.tables {
            if !table_names.insert(table.name.clone()) {
                return Err(Error::ConfigError(format!(
                    "duplicate table <{}>",
                    table.name
                )));
            }
            table.id = next();
            if table.timeout.is_zero() {
                table.timeout = self.timeout;
            }
            if table.interval.is_zero() {
                table.interval = self.interval;
            }
        }
        // Host ids come after all table ids to keep them in one space.
        for table in &mut self.tables {
            for host in &mut table.hosts {
                host.id = next();
                host.table = table.id;
                host.address = resolve_host(&host.name).await?;
            }
        }

        let tables: HashMap<String, Id> = self
            .tables
            .iter()
            .map(|t| (t.name.clone(), t.id))
            .collect();
        let table_id = |name: &str| {
            tables
                .get(name)
                .copied()
                .ok_or_else(|| Error::ConfigError(format!("unknown table <{}>", name)))
        };

        for rdr in &mut self.redirects {
            rdr.id = next();
            rdr.table_id = table_id(&rdr.table)?;
            rdr.backup_id = match &rdr.backup {
                Some(name) => table_id(name)?,
                None => EMPTY_ID,
            };
            if rdr.timeout.is_zero() {
                rdr.timeout = self.timeout;
            }
        }
        for rdr in &self.redirects {
            for table in &mut self.tables {
                if table.id == rdr.table_id || table.id == rdr.backup_id {
                    table.rdrid = rdr.id;
                }
            }
        }

        for proto in &mut self.protocols {
            proto.id = next();
            for rule in &mut proto.rules {
                rule.id = next();
                rule.proto_id = proto.id;
                rule.table_id = match &rule.table {
                    Some(name) => table_id(name)?,
                    None => EMPTY_ID,
                };
                let mut types = HashSet::new();
                for kv in &rule.kv {
                    if !types.insert(kv.typ) {
                        return Err(Error::ConfigError(format!(
                            "rule has more than one {} pattern",
                            kv.typ
                        )));
                    }
                }
            }
        }

        let protocols: HashMap<String, Id> = self
            .protocols
            .iter()
            .map(|p| (p.name.clone(), p.id))
            .collect();

        for relay in &mut self.relays {
            relay.id = next();
            relay.proto_id = match &relay.protocol {
                Some(name) => *protocols.get(name).ok_or_else(|| {
                    Error::ConfigError(format!("unknown protocol \"{}\"", name))
                })?,
                None => EMPTY_ID,
            };
            if relay.forward.is_empty() {
                return Err(Error::ConfigError(format!(
                    "relay \"{}\" has no forward table",
                    relay.name
                )));
            }
            for fwd in &mut relay.forward {
                fwd.table_id = table_id(&fwd.table)?;
            }
            if relay.timeout.is_zero() {
                relay.timeout = crate::RELAY_TIMEOUT;
            }
            relay.load_keys(&mut next).await?;
        }

        Ok(())
    }

    pub fn table(&self, id: Id) -> Option<&Table> {
        self.tables.iter().find(|t| t.id == id)
    }

    pub fn table_by_name(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Find a table in this config that is structurally equal to the
    /// given one.  Used across reloads to keep table ids (and with them
    /// the collected health state) stable when only unrelated parts of
    /// the configuration changed.
    pub fn table_by_conf(&self, other: &Table) -> Option<&Table> {
        self.tables.iter().find(|t| t.same_config(other))
    }

    pub fn protocol(&self, id: Id) -> Option<&Protocol> {
        self.protocols.iter().find(|p| p.id == id)
    }

    /// Shift every object id by `base` so a freshly parsed generation
    /// never collides with the ids of the one it replaces.
    pub fn rebase(&mut self, base: Id) {
        let shift = |id: &mut Id| {
            if *id != 0 && *id != EMPTY_ID {
                *id += base;
            }
        };
        for table in &mut self.tables {
            shift(&mut table.id);
            shift(&mut table.rdrid);
            for host in &mut table.hosts {
                shift(&mut host.id);
                shift(&mut host.table);
                if let Some(parent) = &mut host.parent {
                    *parent += base;
                }
            }
        }
        for rdr in &mut self.redirects {
            shift(&mut rdr.id);
            shift(&mut rdr.table_id);
            shift(&mut rdr.backup_id);
        }
        for proto in &mut self.protocols {
            shift(&mut proto.id);
            for rule in &mut proto.rules {
                shift(&mut rule.id);
                shift(&mut rule.proto_id);
                shift(&mut rule.table_id);
            }
        }
        for relay in &mut self.relays {
            shift(&mut relay.id);
            shift(&mut relay.proto_id);
            shift(&mut relay.ssl_keyid);
            shift(&mut relay.ssl_cakeyid);
            for fwd in &mut relay.forward {
                shift(&mut fwd.table_id);
            }
        }
    }

    /// Give tables that are structurally equal to one in the previous
    /// generation their old ids back, so collected health state is not
    /// lost over a reload that left them untouched.  Hosts are matched
    /// by name within a re-identified table.
    pub fn reconcile(&mut self, previous: &Config) {
        let mut remap: HashMap<Id, Id> = HashMap::new();
        for table in &mut self.tables {
            let old = match previous.table_by_conf(table) {
                Some(old) => old,
                None => continue,
            };
            remap.insert(table.id, old.id);
            table.id = old.id;
            for host in &mut table.hosts {
                host.table = old.id;
                if let Some(old_host) = old.hosts.iter().find(|h| h.name == host.name) {
                    host.id = old_host.id;
                }
            }
        }
        let remapped = |id: &mut Id| {
            if let Some(old) = remap.get(id) {
                *id = *old;
            }
        };
        for rdr in &mut self.redirects {
            remapped(&mut rdr.table_id);
            remapped(&mut rdr.backup_id);
        }
        for proto in &mut self.protocols {
            for rule in &mut proto.rules {
                remapped(&mut rule.table_id);
            }
        }
        for relay in &mut self.relays {
            for fwd in &mut relay.forward {
                remapped(&mut fwd.table_id);
            }
        }
    }
}

async fn resolve_host(name: &str) -> Result<IpAddr, Error> {
    if let Ok(addr) = name.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host((name, 0u16))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
        .ok_or_else(|| Error::ConfigError(format!("host \"{}\" does not resolve", name)))
}

#[derive(Debug, Default)]
pub struct Variable {
    key: String,
    value: String,
}

impl From<(String, String)> for Variable {
    fn from((key, value): (String, String)) -> Self {
        Self { key, value }
    }
}

impl ToString for Variable {
    fn to_string(&self) -> String {
        format!("{}=\"{}\"", self.key, self.value)
    }
}

pub type Variables = HashMap<String, String>;

/// Availability of a backend host.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum HostState {
    Unknown,
    Up,
    Down,
    Disabled,
}

impl Default for HostState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl HostState {
    pub fn is_up(self) -> bool {
        matches!(self, Self::Up)
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Up => "up",
            Self::Down => "down",
            Self::Disabled => "disabled",
        };
        write!(f, "{}", name)
    }
}

/// Table of hosts.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Table {
    pub id: Id,
    /// Owning redirect, if any.
    pub rdrid: Id,
    /// Symbolic name of the table.
    pub name: String,
    /// Check port; 0 uses the port of the forwarding context.
    pub port: u16,
    /// Per-table check timeout; 0 inherits the global timeout.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    /// Per-table check interval; 0 inherits the global interval.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
    /// Whether to disable the table.
    pub disabled: bool,
    /// Whether checks speak TLS to the hosts.
    pub tls: bool,
    /// How host availability is probed.
    pub check: Check,
    /// Target host pool.
    pub hosts: Vec<Host>,
}

impl Table {
    /// Structural equality in the sense of the reload protocol: ids and
    /// the owning redirect are ignored, everything an operator wrote in
    /// the table body is compared.  Hosts are separate entities and do
    /// not take part.
    pub fn same_config(&self, other: &Table) -> bool {
        self.name == other.name
            && self.port == other.port
            && self.timeout == other.timeout
            && self.interval == other.interval
            && self.disabled == other.disabled
            && self.tls == other.tls
            && self.check == other.check
    }
}

/// Host availability probe methods.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Check {
    NoCheck,
    Icmp,
    Tcp,
    HttpCode {
        path: String,
        host: Option<String>,
        code: u16,
    },
    HttpDigest {
        path: String,
        host: Option<String>,
        digest: DigestType,
        /// Lower-case hex string of the expected body digest.
        value: String,
    },
    SendExpect {
        /// Data written after connecting; None connects silently.
        send: Option<String>,
        /// Glob pattern the response must match.
        expect: String,
    },
    Script {
        path: PathBuf,
    },
}

impl Default for Check {
    fn default() -> Self {
        Self::NoCheck
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoCheck => "none",
            Self::Icmp => "icmp",
            Self::Tcp => "tcp",
            Self::HttpCode { .. } => "http code",
            Self::HttpDigest { .. } => "http digest",
            Self::SendExpect { .. } => "send/expect",
            Self::Script { .. } => "script",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DigestType {
    Md5,
    Sha1,
}

/// Target host pool member.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Host {
    pub id: Id,
    /// Optional parent Id to inherit the state from.
    pub parent: Option<Id>,
    /// Owning table.
    pub table: Id,
    /// FQDN or IP address of the host.
    pub name: String,
    /// Resolved address.
    pub address: IpAddr,
    /// Retry tolerance for host checks.
    pub retry: usize,
    /// Time-to-live value in the IP headers for host checks.
    pub ip_ttl: Option<u8>,
    /// Optional route priority.
    pub priority: Option<u8>,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            id: 0,
            parent: None,
            table: 0,
            name: String::new(),
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            retry: 0,
            ip_ttl: None,
            priority: None,
        }
    }
}

/// Layer-3 redirection handled by the packet filter.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Redirect {
    pub id: Id,
    pub name: String,
    pub table: String,
    pub table_id: Id,
    /// Used when no host in the main table is up.
    pub backup: Option<String>,
    pub backup_id: Id,
    pub listen: Vec<SocketAddr>,
    pub sticky: bool,
    pub tag: Option<String>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
}

/// How a backend host is picked from a table.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DstMode {
    RoundRobin,
    LoadBalance,
    Hash,
    SrcHash,
    Random,
}

impl Default for DstMode {
    fn default() -> Self {
        Self::RoundRobin
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RelayFlags {
    pub ssl: bool,
    pub ssl_client: bool,
    pub ssl_inspect: bool,
    pub udp: bool,
    pub needpf: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Forward {
    pub table: String,
    pub table_id: Id,
    /// Backend port; 0 uses the listen port.
    pub port: u16,
    pub mode: DstMode,
    /// TLS towards the backend hosts.
    pub tls: bool,
}

/// An L7 relay: listener, protocol and backend tables.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Relay {
    pub id: Id,
    pub name: String,
    pub listen: SocketAddr,
    pub flags: RelayFlags,
    pub protocol: Option<String>,
    pub proto_id: Id,
    pub forward: Vec<Forward>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    pub session_limit: usize,

    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,

    /// PEM blobs; the private keys only ever travel parent -> CA.
    pub ssl_cert: Option<Vec<u8>>,
    pub ssl_key: Option<Vec<u8>>,
    pub ssl_keyid: Id,
    pub ssl_cacert: Option<Vec<u8>>,
    pub ssl_cakey: Option<Vec<u8>>,
    pub ssl_cakeyid: Id,
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            listen: SocketAddr::from(([0, 0, 0, 0], 0)),
            flags: Default::default(),
            protocol: None,
            proto_id: EMPTY_ID,
            forward: Vec::new(),
            timeout: Duration::default(),
            session_limit: 0,
            cert_path: None,
            key_path: None,
            ca_cert_path: None,
            ca_key_path: None,
            ssl_cert: None,
            ssl_key: None,
            ssl_keyid: EMPTY_ID,
            ssl_cacert: None,
            ssl_cakey: None,
            ssl_cakeyid: EMPTY_ID,
        }
    }
}

impl Relay {
    async fn load_keys<F: FnMut() -> Id>(&mut self, next: &mut F) -> Result<(), Error> {
        if !(self.flags.ssl || self.flags.ssl_inspect) {
            return Ok(());
        }
        let cert_path = self.cert_path.as_ref().ok_or_else(|| {
            Error::ConfigError(format!("relay \"{}\": tls without certificate", self.name))
        })?;
        let key_path = self.key_path.as_ref().ok_or_else(|| {
            Error::ConfigError(format!("relay \"{}\": tls without key", self.name))
        })?;
        self.ssl_cert = Some(fs::read(cert_path).await?);
        self.ssl_key = Some(fs::read(key_path).await?);
        self.ssl_keyid = next();
        if let Some(path) = &self.ca_cert_path {
            self.ssl_cacert = Some(fs::read(path).await?);
        }
        if let Some(path) = &self.ca_key_path {
            self.ssl_cakey = Some(fs::read(path).await?);
            self.ssl_cakeyid = next();
        }
        Ok(())
    }

    /// Zero-fill and drop the private key material.  The parent calls
    /// this once the blobs have been handed to the CA process.
    pub fn purge_keys(&mut self) {
        purge_key(&mut self.ssl_key);
        purge_key(&mut self.ssl_cakey);
    }

    /// A copy safe to send to any process but the CA.
    pub fn without_keys(&self) -> Self {
        let mut relay = self.clone();
        relay.ssl_key = None;
        relay.ssl_cakey = None;
        relay
    }
}

pub fn purge_key(blob: &mut Option<Vec<u8>>) {
    if let Some(buf) = blob.as_mut() {
        for b in buf.iter_mut() {
            *b = 0;
        }
    }
    *blob = None;
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ProtocolType {
    Tcp,
    Http,
}

impl Default for ProtocolType {
    fn default() -> Self {
        Self::Tcp
    }
}

/// A named policy: an ordered list of relay rules plus stream options.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Protocol {
    pub id: Id,
    pub name: String,
    pub typ: ProtocolType,
    pub tcp_nodelay: bool,
    /// Verify backend certificates against this bundle; None disables
    /// verification like the original does without a ca file.
    pub tls_ca_path: Option<PathBuf>,
    pub rules: Vec<Rule>,
}

impl Protocol {
    /// A copy without the rules; they are streamed as separate
    /// messages during configuration.
    pub fn without_rules(&self) -> Self {
        let mut proto = self.clone();
        proto.rules = Vec::new();
        proto
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RuleAction {
    Match,
    Pass,
    Block,
}

impl Default for RuleAction {
    fn default() -> Self {
        Self::Match
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Direction {
    Request,
    Response,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Request
    }
}

/// Where a kv pattern looks in the parsed message.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum KeyType {
    Cookie,
    Header,
    Path,
    Query,
    Url,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cookie => "cookie",
            Self::Header => "header",
            Self::Path => "path",
            Self::Query => "query",
            Self::Url => "url",
        };
        write!(f, "{}", name)
    }
}

/// What an action kv does to the message.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum KvAction {
    Append,
    Set,
    Remove,
    Hash,
    Log,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KvPattern {
    pub typ: KeyType,
    pub key: String,
    pub value: Option<String>,
}

impl KvPattern {
    pub fn globbing(&self) -> bool {
        self.key.contains(|ch| matches!(ch, '*' | '?' | '['))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KvActionPattern {
    pub action: KvAction,
    pub typ: KeyType,
    pub key: String,
    pub value: Option<String>,
}

impl KvActionPattern {
    pub fn has_macro(&self) -> bool {
        self.value
            .as_deref()
            .map(|value| value.contains('$'))
            .unwrap_or(false)
    }
}

/// A single relay rule.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Rule {
    pub id: Id,
    pub proto_id: Id,
    pub action: RuleAction,
    pub dir: Direction,
    pub method: Option<String>,
    pub label: Option<String>,
    pub tag: Option<String>,
    pub tagged: Option<String>,
    /// Table binding for forwarding decisions.
    pub table: Option<String>,
    pub table_id: Id,
    pub table_mode: DstMode,
    /// Match constraints; at most one per key type.
    pub kv: Vec<KvPattern>,
    /// Mutations, hash contributions and log directives.
    pub actions: Vec<KvActionPattern>,
}

impl Rule {
    /// Terminal rules stop the evaluation for their direction.
    pub fn terminal(&self) -> bool {
        !matches!(self.action, RuleAction::Match)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Config {
        Config::parse(input, Default::default()).unwrap()
    }

    #[test]
    fn test_config_example() {
        let input = include_str!("../etc/relayd.conf");
        let config = parse(input);
        assert_eq!(config.tables.len(), 2);
        assert_eq!(config.relays.len(), 2);
        assert_eq!(config.protocols.len(), 1);
        assert_eq!(config.redirects.len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_ids() {
        let mut config = parse(
            r#"
table <a> { 127.0.0.1, 127.0.0.2 retry 2 }
table <b> { check tcp port 80 ::1 }
relay "r" { listen on 127.0.0.1 port 8080 forward to <a> port 80 }
"#,
        );
        config.finalize().await.unwrap();
        let a = config.table_by_name("a").unwrap().id;
        let b = config.table_by_name("b").unwrap().id;
        assert_ne!(a, b);
        let mut seen = HashSet::new();
        for table in &config.tables {
            assert!(seen.insert(table.id));
            for host in &table.hosts {
                assert!(seen.insert(host.id));
                assert_eq!(host.table, table.id);
            }
        }
        assert_eq!(config.relays[0].forward[0].table_id, a);
    }

    #[tokio::test]
    async fn test_unknown_table_is_rejected() {
        let mut config = parse(
            r#"
relay "r" { listen on 127.0.0.1 port 8080 forward to <nope> }
"#,
        );
        assert!(config.finalize().await.is_err());
    }

    #[test]
    fn test_table_identity_ignores_rdrid() {
        let mut a = Table {
            name: "www".to_string(),
            port: 80,
            check: Check::Tcp,
            ..Default::default()
        };
        a.id = 1;
        let mut b = a.clone();
        a.rdrid = 10;
        b.id = 7;
        b.rdrid = 20;
        assert!(a.same_config(&b));

        b.check = Check::Icmp;
        assert!(!a.same_config(&b));
    }

    #[test]
    fn test_purge_key_zeroes() {
        let mut blob = Some(b"secret".to_vec());
        purge_key(&mut blob);
        assert!(blob.is_none());
    }

    /// Only the ca process may see private key bytes; the copy sent to
    /// everyone else is stripped.
    #[test]
    fn test_without_keys_strips_private_material() {
        let relay = Relay {
            ssl_cert: Some(b"cert".to_vec()),
            ssl_key: Some(b"key".to_vec()),
            ssl_cakey: Some(b"cakey".to_vec()),
            ..Default::default()
        };
        let wire = relay.without_keys();
        assert!(wire.ssl_key.is_none());
        assert!(wire.ssl_cakey.is_none());
        assert_eq!(wire.ssl_cert.as_deref(), Some(&b"cert"[..]));
    }

    #[test]
    fn test_macro_expansion() {
        let config = parse(
            "www_port=\"8080\"\n\
             table <t> { 10.0.0.1 }\n\
             relay \"r\" { listen on 127.0.0.1 port $www_port forward to <t> }\n",
        );
        assert_eq!(config.relays[0].listen.port(), 8080);
    }

    #[test]
    fn test_command_line_macro_wins() {
        let mut variables = Variables::new();
        variables.insert("www_port".to_string(), "9090".to_string());
        let config = Config::parse(
            "www_port=\"8080\"\n\
             table <t> { 10.0.0.1 }\n\
             relay \"r\" { listen on 127.0.0.1 port $www_port forward to <t> }\n",
            variables,
        )
        .unwrap();
        assert_eq!(config.relays[0].listen.port(), 9090);
    }

    #[test]
    fn test_include_directive() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "table <included> {{ 10.0.0.1 }}").unwrap();
        let input = format!("include \"{}\"\n", file.path().display());
        let config = parse(&input);
        assert_eq!(config.tables[0].name, "included");
    }

    /// A reload that leaves a table structurally untouched must keep
    /// its id (and its hosts' ids), even when unrelated parts of the
    /// configuration change around it.
    #[tokio::test]
    async fn test_reload_preserves_table_ids() {
        let mut old = parse(
            r#"
table <www> { check tcp port 80 10.0.0.1, 10.0.0.2 }
relay "r" { listen on 127.0.0.1 port 8080 forward to <www> }
"#,
        );
        old.finalize().await.unwrap();

        let mut new = parse(
            r#"
table <www> { check tcp port 80 10.0.0.1, 10.0.0.2 }
table <extra> { check icmp 10.0.0.9 }
relay "r" { listen on 127.0.0.1 port 8080 forward to <www> }
"#,
        );
        new.finalize().await.unwrap();
        new.rebase(100);
        new.reconcile(&old);

        let old_www = old.table_by_name("www").unwrap();
        let new_www = new.table_by_name("www").unwrap();
        assert_eq!(new_www.id, old_www.id);
        for (old_host, new_host) in old_www.hosts.iter().zip(&new_www.hosts) {
            assert_eq!(new_host.id, old_host.id);
        }
        // References follow the re-identification.
        assert_eq!(new.relays[0].forward[0].table_id, old_www.id);
        // The added table keeps its fresh, non-colliding id.
        let extra = new.table_by_name("extra").unwrap();
        assert!(extra.id > 100);
    }
}
