pub mod ca;
pub mod config;
mod control;
mod error;
mod health;
pub mod message;
mod options;
mod parent;
mod pf;
mod redirect;
pub mod relay;
mod tls;

use privsep_derive::Privsep;
use std::time::Duration;
pub use {
    error::Error,
    options::Options,
    privsep::process::{Child, Parent},
};

/// Privsep processes.
#[derive(Debug, Privsep)]
#[username = "nobody"]
pub enum Privsep {
    /// Parent process.
    Parent,
    /// Health Check Engine
    #[connect(Relay, Redirect)]
    Health,
    /// Packet Filter Engine
    Redirect,
    /// L7 Relays
    #[connect(Ca)]
    Relay,
    /// TLS key operations
    Ca,
}

/// Default configuration path.
pub const RELAYD_CONFIG: &str = "/etc/relayd.conf";
/// Default control socket path.
const RELAYD_SOCKET: &str = "/var/run/relayd.sock";
/// Default relayd server name.
#[allow(unused)]
const RELAYD_SERVERNAME: &str = "relayd-rs";

/// Default health check timeout.
const CHECK_TIMEOUT: Duration = Duration::from_millis(200);
/// Default health check interval.
const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Default relay session timeout.
const RELAY_TIMEOUT: Duration = Duration::from_secs(600);
/// Timeout for connecting to a backend host.
const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound for a relayed HTTP header block.
const RELAY_MAX_HEADER_LENGTH: usize = 8192;
/// Listen backlog for relay sockets.
const RELAY_BACKLOG: i32 = 10;
/// Descriptors kept in reserve by the accept loops.
const FD_RESERVE: usize = 5;
/// Timeout for the synchronous CA key operation.
const CA_TIMEOUT: Duration = Duration::from_secs(10);

/// Read buffer cap for health check responses.
const SMALL_READ_BUF_SIZE: usize = 8192;

/// Default PF socket.
#[allow(unused)]
const PF_SOCKET: &str = "/dev/pf";
/// Default relayd PF anchor.
const PF_RELAYD_ANCHOR: &str = "relayd";
