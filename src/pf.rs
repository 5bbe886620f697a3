//! Desired-state mirror of the kernel packet filter.  The kernel API
//! itself is behind a narrow backend trait; reconciliation computes
//! the delta between the mirror and the wanted state and only touches
//! the backend for actual changes.

use crate::config::Id;
use privsep_log::debug;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, SocketAddr},
};

/// An installed L3 redirect: traffic to the listen addresses is
/// rewritten towards the live hosts of its anchor table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RdrRule {
    pub id: Id,
    pub name: String,
    pub listen: Vec<SocketAddr>,
    pub sticky: bool,
}

/// The "set table / enable redirect" surface of the packet filter.
pub trait PfBackend: Send {
    fn set_addresses(&mut self, anchor: &str, addrs: &BTreeSet<IpAddr>);
    fn install_redirect(&mut self, anchor: &str, rule: &RdrRule);
    fn remove_anchor(&mut self, anchor: &str);
    fn flush_states(&mut self, anchor: &str, addr: IpAddr);
}

/// Portable backend: the operations are only logged.  On OpenBSD this
/// is where the ioctl calls against /dev/pf would live.
#[derive(Debug, Default)]
pub struct NullBackend;

impl PfBackend for NullBackend {
    fn set_addresses(&mut self, anchor: &str, addrs: &BTreeSet<IpAddr>) {
        debug!("pf: set table"; "anchor" => anchor, "addrs" => addrs.len());
    }

    fn install_redirect(&mut self, anchor: &str, rule: &RdrRule) {
        debug!("pf: install redirect"; "anchor" => anchor, "name" => rule.name.clone());
    }

    fn remove_anchor(&mut self, anchor: &str) {
        debug!("pf: remove anchor"; "anchor" => anchor);
    }

    fn flush_states(&mut self, anchor: &str, addr: IpAddr) {
        debug!("pf: flush states"; "anchor" => anchor, "addr" => addr.to_string());
    }
}

/// Test backend recording every operation in order.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub ops: Vec<String>,
}

impl PfBackend for RecordingBackend {
    fn set_addresses(&mut self, anchor: &str, addrs: &BTreeSet<IpAddr>) {
        let mut addrs: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
        addrs.sort();
        self.ops
            .push(format!("set {} [{}]", anchor, addrs.join(",")));
    }

    fn install_redirect(&mut self, anchor: &str, rule: &RdrRule) {
        self.ops.push(format!("rdr {} {}", anchor, rule.name));
    }

    fn remove_anchor(&mut self, anchor: &str) {
        self.ops.push(format!("remove {}", anchor));
    }

    fn flush_states(&mut self, anchor: &str, addr: IpAddr) {
        self.ops.push(format!("flush {} {}", anchor, addr));
    }
}

/// Mirror of what has been applied to the kernel.
pub struct Firewall<B> {
    backend: B,
    tables: BTreeMap<String, BTreeSet<IpAddr>>,
    redirects: BTreeMap<String, RdrRule>,
}

impl<B: PfBackend> Firewall<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            tables: BTreeMap::new(),
            redirects: BTreeMap::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn anchor(name: &str) -> String {
        format!("{}/{}", crate::PF_RELAYD_ANCHOR, name)
    }

    /// Reconcile one table anchor with the wanted address set.
    pub fn sync_table(&mut self, name: &str, wanted: BTreeSet<IpAddr>) {
        let anchor = Self::anchor(name);
        let applied = self.tables.entry(anchor.clone()).or_default();
        if *applied == wanted {
            return;
        }
        // States of hosts that went away must not linger.
        for gone in applied.difference(&wanted) {
            self.backend.flush_states(&anchor, *gone);
        }
        self.backend.set_addresses(&anchor, &wanted);
        *applied = wanted;
    }

    /// Reconcile the redirect rules; anchors with no remaining rule
    /// are removed, changed rules reinstalled, identical ones left
    /// alone.
    pub fn sync_redirects(&mut self, wanted: Vec<RdrRule>) {
        let mut next = BTreeMap::new();
        for rule in wanted {
            next.insert(Self::anchor(&rule.name), rule);
        }
        let gone: Vec<String> = self
            .redirects
            .keys()
            .filter(|anchor| !next.contains_key(*anchor))
            .cloned()
            .collect();
        for anchor in gone {
            self.backend.remove_anchor(&anchor);
            self.redirects.remove(&anchor);
            self.tables.remove(&anchor);
        }
        for (anchor, rule) in next {
            if self.redirects.get(&anchor) != Some(&rule) {
                self.backend.install_redirect(&anchor, &rule);
                self.redirects.insert(anchor, rule);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> BTreeSet<IpAddr> {
        list.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn test_sync_table_is_idempotent() {
        let mut fw = Firewall::new(RecordingBackend::default());
        fw.sync_table("www", addrs(&["10.0.0.1", "10.0.0.2"]));
        fw.sync_table("www", addrs(&["10.0.0.1", "10.0.0.2"]));
        assert_eq!(
            fw.backend().ops,
            vec!["set relayd/www [10.0.0.1,10.0.0.2]"]
        );
    }

    #[test]
    fn test_sync_table_flushes_removed_hosts() {
        let mut fw = Firewall::new(RecordingBackend::default());
        fw.sync_table("www", addrs(&["10.0.0.1", "10.0.0.2"]));
        fw.sync_table("www", addrs(&["10.0.0.1"]));
        assert_eq!(
            fw.backend().ops,
            vec![
                "set relayd/www [10.0.0.1,10.0.0.2]",
                "flush relayd/www 10.0.0.2",
                "set relayd/www [10.0.0.1]",
            ]
        );
    }

    #[test]
    fn test_sync_redirects_removes_stale_anchors() {
        let mut fw = Firewall::new(RecordingBackend::default());
        let rule = |name: &str| RdrRule {
            id: 1,
            name: name.to_string(),
            listen: vec!["0.0.0.0:80".parse().unwrap()],
            sticky: false,
        };
        fw.sync_redirects(vec![rule("www"), rule("smtp")]);
        fw.sync_redirects(vec![rule("www")]);
        assert_eq!(
            fw.backend().ops,
            vec![
                "rdr relayd/smtp smtp",
                "rdr relayd/www www",
                "remove relayd/smtp",
            ]
        );
    }

    #[test]
    fn test_unchanged_redirect_is_not_reinstalled() {
        let mut fw = Firewall::new(RecordingBackend::default());
        let rule = RdrRule {
            id: 1,
            name: "www".to_string(),
            listen: vec!["0.0.0.0:80".parse().unwrap()],
            sticky: true,
        };
        fw.sync_redirects(vec![rule.clone()]);
        fw.sync_redirects(vec![rule]);
        assert_eq!(fw.backend().ops, vec!["rdr relayd/www www"]);
    }
}
