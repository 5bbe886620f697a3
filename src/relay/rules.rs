//! Rule bookkeeping: interned label and tag names with reference
//! counts shared across the rules of a running configuration.

use crate::config::Rule;
use std::collections::HashMap;

/// Interned names with reference counts.  Ids are stable for the
/// lifetime of a reference; a count dropping to zero reclaims the
/// name and recycles the slot.
#[derive(Debug, Default)]
pub struct NameTable {
    byname: HashMap<String, u16>,
    names: Vec<String>,
    refs: Vec<usize>,
    free: Vec<u16>,
}

impl NameTable {
    /// Intern a name and take a reference; returns the id.
    pub fn get(&mut self, name: &str) -> u16 {
        if let Some(&id) = self.byname.get(name) {
            self.refs[id as usize - 1] += 1;
            return id;
        }
        let id = match self.free.pop() {
            Some(id) => {
                self.names[id as usize - 1] = name.to_string();
                self.refs[id as usize - 1] = 1;
                id
            }
            None => {
                self.names.push(name.to_string());
                self.refs.push(1);
                self.names.len() as u16
            }
        };
        self.byname.insert(name.to_string(), id);
        id
    }

    /// Take another reference on an already interned id.
    pub fn ref_id(&mut self, id: u16) {
        if id != 0 {
            self.refs[id as usize - 1] += 1;
        }
    }

    /// Drop a reference; the last one frees the interned name.
    pub fn unref(&mut self, id: u16) {
        if id == 0 {
            return;
        }
        let slot = id as usize - 1;
        self.refs[slot] = self.refs[slot].saturating_sub(1);
        if self.refs[slot] == 0 {
            let name = std::mem::take(&mut self.names[slot]);
            self.byname.remove(&name);
            self.free.push(id);
        }
    }

    pub fn name(&self, id: u16) -> Option<&str> {
        if id == 0 {
            return None;
        }
        self.names
            .get(id as usize - 1)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn refcount(&self, id: u16) -> usize {
        if id == 0 {
            return 0;
        }
        self.refs.get(id as usize - 1).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    pub labels: NameTable,
    pub tags: NameTable,
}

/// A rule bound to the interned name registry; ids of 0 mean unset.
#[derive(Debug)]
pub struct BoundRule {
    pub rule: Rule,
    pub label: u16,
    pub tag: u16,
    pub tagged: u16,
}

impl BoundRule {
    /// `rule_inherit`: take the name references the rule needs.
    pub fn inherit(rule: Rule, registry: &mut Registry) -> Self {
        let label = rule
            .label
            .as_deref()
            .map(|name| registry.labels.get(name))
            .unwrap_or(0);
        let tag = rule
            .tag
            .as_deref()
            .map(|name| registry.tags.get(name))
            .unwrap_or(0);
        let tagged = rule
            .tagged
            .as_deref()
            .map(|name| registry.tags.get(name))
            .unwrap_or(0);
        Self {
            rule,
            label,
            tag,
            tagged,
        }
    }

    /// `rule_free`: return the references.
    pub fn free(&self, registry: &mut Registry) {
        registry.labels.unref(self.label);
        registry.tags.unref(self.tag);
        registry.tags.unref(self.tagged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleAction;

    fn rule(label: Option<&str>, tag: Option<&str>) -> Rule {
        Rule {
            action: RuleAction::Match,
            label: label.map(str::to_string),
            tag: tag.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_intern_is_shared() {
        let mut table = NameTable::default();
        let a = table.get("denied");
        let b = table.get("denied");
        assert_eq!(a, b);
        assert_eq!(table.refcount(a), 2);
        assert_eq!(table.name(a), Some("denied"));
    }

    #[test]
    fn test_zero_refs_reclaims_name() {
        let mut table = NameTable::default();
        let id = table.get("temp");
        table.unref(id);
        assert_eq!(table.refcount(id), 0);
        assert_eq!(table.name(id), None);

        // The slot is recycled for the next name.
        let next = table.get("other");
        assert_eq!(next, id);
    }

    /// After arbitrary inherit/free sequences the outstanding refs per
    /// label equal the number of live rules referencing it.
    #[test]
    fn test_refcount_matches_live_rules() {
        let mut registry = Registry::default();
        let mut live = Vec::new();

        for _ in 0..5 {
            live.push(BoundRule::inherit(
                rule(Some("shared"), Some("tagged")),
                &mut registry,
            ));
        }
        live.push(BoundRule::inherit(rule(Some("solo"), None), &mut registry));

        let shared = live[0].label;
        assert_eq!(registry.labels.refcount(shared), 5);

        // Free rules in arbitrary order.
        for idx in [3usize, 0, 4] {
            let bound = live.remove(idx.min(live.len() - 1));
            bound.free(&mut registry);
        }
        let live_shared = live
            .iter()
            .filter(|b| b.rule.label.as_deref() == Some("shared"))
            .count();
        assert_eq!(registry.labels.refcount(shared), live_shared);

        for bound in live.drain(..) {
            bound.free(&mut registry);
        }
        assert_eq!(registry.labels.refcount(shared), 0);
        assert_eq!(registry.labels.name(shared), None);
    }

    #[test]
    fn test_tagged_refs_tag_table() {
        let mut registry = Registry::default();
        let tagger = BoundRule::inherit(rule(None, Some("gold")), &mut registry);
        let tagged = BoundRule::inherit(
            Rule {
                tagged: Some("gold".to_string()),
                ..Default::default()
            },
            &mut registry,
        );
        assert_eq!(tagger.tag, tagged.tagged);
        assert_eq!(registry.tags.refcount(tagger.tag), 2);
        tagger.free(&mut registry);
        assert_eq!(registry.tags.refcount(tagged.tagged), 1);
        tagged.free(&mut registry);
        assert_eq!(registry.tags.refcount(tagged.tagged), 0);
    }
}
