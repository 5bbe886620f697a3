//! Key-value trees for headers, cookies and query strings.
//!
//! Nodes live in an index-based arena; children and parents refer to
//! each other by index so the structures stay acyclic for the borrow
//! checker while the wire order is preserved for serialization.

use std::collections::BTreeMap;

#[derive(Clone, Debug)]
pub struct Kv {
    pub key: String,
    pub value: Option<String>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    deleted: bool,
}

impl Kv {
    fn new(key: &str, value: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            value: value.map(str::to_string),
            parent: None,
            children: Vec::new(),
            deleted: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct KvTree {
    nodes: Vec<Kv>,
    /// Exact lookup index over live root nodes.
    index: BTreeMap<String, Vec<usize>>,
    /// Fold keys to lower case (header semantics).
    fold: bool,
}

impl KvTree {
    pub fn new(fold: bool) -> Self {
        Self {
            fold,
            ..Default::default()
        }
    }

    fn fold_key(&self, key: &str) -> String {
        if self.fold {
            key.to_ascii_lowercase()
        } else {
            key.to_string()
        }
    }

    /// Append a new root entry, keeping insertion order.
    pub fn add(&mut self, key: &str, value: Option<&str>) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(Kv::new(key, value));
        self.index.entry(self.fold_key(key)).or_default().push(idx);
        idx
    }

    /// Attach a child entry to an existing node.
    pub fn add_child(&mut self, parent: usize, key: &str, value: Option<&str>) -> usize {
        let idx = self.nodes.len();
        let mut kv = Kv::new(key, value);
        kv.parent = Some(parent);
        self.nodes.push(kv);
        self.nodes[parent].children.push(idx);
        idx
    }

    pub fn get(&self, idx: usize) -> Option<&Kv> {
        self.nodes.get(idx).filter(|kv| !kv.deleted)
    }

    /// Exact lookup of the first live entry for a key.
    pub fn find(&self, key: &str) -> Option<&Kv> {
        self.index
            .get(&self.fold_key(key))?
            .iter()
            .map(|&idx| &self.nodes[idx])
            .find(|kv| !kv.deleted)
    }

    /// Linear scan with a case-folded glob pattern, used when the key
    /// carries `*`, `?` or `[` metacharacters.
    pub fn glob(&self, pattern: &str) -> Option<&Kv> {
        self.nodes
            .iter()
            .filter(|kv| !kv.deleted && kv.parent.is_none())
            .find(|kv| glob_match(pattern, &kv.key, true))
    }

    /// Replace the value of the first matching entry, inserting the
    /// key when it is not present.
    pub fn set(&mut self, key: &str, value: &str) {
        let folded = self.fold_key(key);
        if let Some(idx) = self
            .index
            .get(&folded)
            .and_then(|ids| ids.iter().copied().find(|&idx| !self.nodes[idx].deleted))
        {
            self.nodes[idx].value = Some(value.to_string());
        } else {
            self.add(key, Some(value));
        }
    }

    pub fn append(&mut self, key: &str, value: &str) {
        self.add(key, Some(value));
    }

    /// Delete every entry for a key, collecting the subtrees.
    pub fn remove(&mut self, key: &str) {
        let folded = self.fold_key(key);
        let ids = match self.index.get(&folded) {
            Some(ids) => ids.clone(),
            None => return,
        };
        for idx in ids {
            self.delete(idx);
        }
    }

    /// Delete a node and its children.
    pub fn delete(&mut self, idx: usize) {
        if idx >= self.nodes.len() || self.nodes[idx].deleted {
            return;
        }
        self.nodes[idx].deleted = true;
        let children = self.nodes[idx].children.clone();
        for child in children {
            self.delete(child);
        }
    }

    /// Live root entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Kv> {
        self.nodes
            .iter()
            .filter(|kv| !kv.deleted && kv.parent.is_none())
    }

    pub fn children(&self, idx: usize) -> impl Iterator<Item = &Kv> {
        self.nodes[idx]
            .children
            .iter()
            .map(move |&child| &self.nodes[child])
            .filter(|kv| !kv.deleted)
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

fn chars_eq(a: char, b: char, fold: bool) -> bool {
    if fold {
        a.eq_ignore_ascii_case(&b)
    } else {
        a == b
    }
}

/// `fnmatch`-style glob matching with `*`, `?` and `[...]` classes.
pub fn glob_match(pattern: &str, text: &str, fold: bool) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();

    let mut p = 0;
    let mut t = 0;
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while t < txt.len() {
        if p < pat.len() {
            match pat[p] {
                '*' => {
                    star = Some(p);
                    mark = t;
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                '[' => {
                    if let Some((next, matched)) = match_class(&pat, p, txt[t], fold) {
                        if matched {
                            p = next;
                            t += 1;
                            continue;
                        }
                    }
                }
                ch => {
                    if chars_eq(ch, txt[t], fold) {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }
        // Mismatch: extend the last `*` by one character or fail.
        match star {
            Some(sp) => {
                p = sp + 1;
                mark += 1;
                t = mark;
            }
            None => return false,
        }
    }

    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

/// Match a `[...]` class starting at `pat[start]`; returns the index
/// past the closing bracket and whether `ch` matched.
fn match_class(pat: &[char], start: usize, ch: char, fold: bool) -> Option<(usize, bool)> {
    let mut i = start + 1;
    let negated = matches!(pat.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while let Some(&c) = pat.get(i) {
        if c == ']' && !first {
            return Some((i + 1, matched != negated));
        }
        first = false;
        if pat.get(i + 1) == Some(&'-') && pat.get(i + 2).map_or(false, |&c| c != ']') {
            let lo = c;
            let hi = pat[i + 2];
            let (ch, lo, hi) = if fold {
                (
                    ch.to_ascii_lowercase(),
                    lo.to_ascii_lowercase(),
                    hi.to_ascii_lowercase(),
                )
            } else {
                (ch, lo, hi)
            };
            if lo <= ch && ch <= hi {
                matched = true;
            }
            i += 3;
        } else {
            if chars_eq(c, ch, fold) {
                matched = true;
            }
            i += 1;
        }
    }
    // Unterminated class never matches.
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_basics() {
        assert!(glob_match("*", "anything", false));
        assert!(glob_match("*.example.com", "api.example.com", false));
        assert!(!glob_match("*.example.com", "example.com", false));
        assert!(glob_match("a?c", "abc", false));
        assert!(!glob_match("a?c", "ac", false));
        assert!(glob_match("/admin*", "/admin/users", false));
        assert!(glob_match("[abc]x", "bx", false));
        assert!(glob_match("[a-f]x", "dx", false));
        assert!(glob_match("[!a-f]x", "zx", false));
        assert!(!glob_match("[a-f]x", "zx", false));
        assert!(!glob_match("[ax", "a", false));
    }

    #[test]
    fn test_glob_case_fold() {
        assert!(glob_match("host", "HOST", true));
        assert!(!glob_match("host", "HOST", false));
        assert!(glob_match("X-*", "x-forwarded-for", true));
    }

    #[test]
    fn test_tree_insertion_order() {
        let mut tree = KvTree::new(true);
        tree.add("Host", Some("example.com"));
        tree.add("Accept", Some("*/*"));
        tree.add("X-Test", Some("1"));
        let keys: Vec<_> = tree.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["Host", "Accept", "X-Test"]);
    }

    #[test]
    fn test_exact_find_folds_keys() {
        let mut tree = KvTree::new(true);
        tree.add("Host", Some("example.com"));
        assert_eq!(
            tree.find("host").and_then(|kv| kv.value.as_deref()),
            Some("example.com")
        );
        let exact = KvTree::new(false);
        assert!(exact.find("host").is_none());
    }

    /// For keys without glob metacharacters the glob scan and the
    /// exact find agree.
    #[test]
    fn test_glob_exact_parity() {
        let mut tree = KvTree::new(true);
        for (k, v) in [
            ("Host", "a"),
            ("Accept", "b"),
            ("X-Forwarded-For", "c"),
            ("Cookie", "d"),
        ] {
            tree.add(k, Some(v));
        }
        for key in ["Host", "Accept", "X-Forwarded-For", "Cookie", "Missing"] {
            let exact = tree.find(key).map(|kv| kv.key.as_str());
            let globbed = tree.glob(key).map(|kv| kv.key.as_str());
            assert_eq!(exact, globbed, "key {}", key);
        }
    }

    #[test]
    fn test_set_append_remove() {
        let mut tree = KvTree::new(true);
        tree.add("X-Test", Some("1"));
        tree.set("X-Test", "2");
        assert_eq!(tree.find("x-test").unwrap().value.as_deref(), Some("2"));

        tree.append("X-Test", "3");
        assert_eq!(tree.iter().count(), 2);

        tree.remove("X-Test");
        assert!(tree.find("X-Test").is_none());
        assert!(tree.is_empty());

        tree.set("X-New", "set-inserts");
        assert_eq!(tree.iter().count(), 1);
    }

    #[test]
    fn test_delete_collects_subtree() {
        let mut tree = KvTree::new(false);
        let cookie = tree.add("session", Some("abc"));
        tree.add_child(cookie, "path", Some("/"));
        tree.add_child(cookie, "secure", None);
        assert_eq!(tree.children(cookie).count(), 2);

        tree.delete(cookie);
        assert!(tree.find("session").is_none());
        assert_eq!(tree.iter().count(), 0);
    }
}
