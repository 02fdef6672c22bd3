//! Process-wide key/value configuration store.
//!
//! While applications that embed this crate are free to define their own
//! command line arguments and configuration loading, the flow engine itself
//! only ever consumes a key/value configuration interface: a string key maps
//! to a node that holds a scalar string value, a child mapping (nested
//! nodes), or both. This keeps the engine decoupled from any particular
//! file format; [`ConfigStore::from_toml_str`] is provided purely as a
//! convenience for flattening a TOML document (the format this crate's
//! lineage already uses) into the node tree.
//!
//! ## Contract
//!
//! Configuration is mutated only during engine initialization, on a single
//! thread. Once initialization completes, the engine only ever reads the
//! store. Because of this, `ConfigStore` performs no reader/writer locking:
//! callers that share a store across threads after init are expected to do
//! so through an already-initialized, effectively-immutable `Arc<ConfigStore>`.

use std::collections::HashMap;
use std::fmt::Write as _;

/// A node in the configuration tree.
///
/// A node may carry a scalar string value, a set of named children, or
/// both (e.g. `flow.memcap = "32mb"` is a leaf value, while
/// `flow-timeouts.tcp` is a node with children `new`, `established`, ...).
#[derive(Debug, Clone, Default)]
pub struct ConfigNode {
    /// The node's own name (last path segment).
    pub name: String,
    /// Scalar value, if any.
    pub value: Option<String>,
    /// Whether future `set` calls on this key may override `value`.
    allow_override: bool,
    /// Child nodes, keyed by their own (unqualified) name.
    children: HashMap<String, ConfigNode>,
}

impl ConfigNode {
    fn leaf(name: &str, value: String, allow_override: bool) -> Self {
        ConfigNode {
            name: name.to_string(),
            value: Some(value),
            allow_override,
            children: HashMap::new(),
        }
    }
}

/// Process-wide key/value configuration store.
///
/// Keys are dot-separated paths (e.g. `"flow-timeouts.tcp.new"`); each
/// segment becomes a node in the tree rooted at `root`.
#[derive(Debug, Default)]
pub struct ConfigStore {
    root: ConfigNode,
}

impl ConfigStore {
    /// Creates an empty configuration store.
    pub fn new() -> Self {
        ConfigStore {
            root: ConfigNode::default(),
        }
    }

    /// Loads a TOML document and flattens it into a configuration store.
    ///
    /// Nested tables become dotted keys (`[flow-timeouts.tcp]` with
    /// `new = 60` becomes the key `"flow-timeouts.tcp.new"`). Non-scalar,
    /// non-table values (arrays) are stringified via their TOML
    /// representation.
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let value: toml::Value = toml::from_str(input)?;
        let mut store = ConfigStore::new();
        flatten_toml(&mut store, "", &value);
        Ok(store)
    }

    /// Sets `key` to `value`.
    ///
    /// Fails (returns `false`, "not set") if the key already exists and its
    /// existing entry was set with `allow_override = false`; otherwise
    /// replaces the value and records the new override policy.
    pub fn set(&mut self, key: &str, value: impl Into<String>, allow_override: bool) -> bool {
        let parts: Vec<&str> = key.split('.').filter(|s| !s.is_empty()).collect();
        if parts.is_empty() {
            return false;
        }
        let node = Self::node_mut(&mut self.root, &parts[..parts.len() - 1]);
        let leaf_name = parts[parts.len() - 1];
        if let Some(existing) = node.children.get(leaf_name) {
            if existing.value.is_some() && !existing.allow_override {
                log::warn!("config: refusing override of locked key {key}");
                return false;
            }
        }
        node.children.insert(
            leaf_name.to_string(),
            ConfigNode::leaf(leaf_name, value.into(), allow_override),
        );
        true
    }

    /// Inserts or replaces a whole subtree, keyed by `node.name`.
    pub fn set_node(&mut self, node: ConfigNode) {
        self.root.children.insert(node.name.clone(), node);
    }

    /// Returns the scalar value at `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_node(key)?.value.as_deref()
    }

    /// Parses the value at `key` as an integer with C-style base
    /// auto-detection: a `0x`/`0X` prefix selects hexadecimal, a bare `0`
    /// prefix (with further digits) selects octal, otherwise decimal.
    ///
    /// Fails if the key is absent, trailing non-digit characters remain, or
    /// the value is out of range for `i64`.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        let raw = self.get(key)?.trim();
        let (negative, raw) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let (radix, digits) =
            if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
                (16, hex)
            } else if raw.len() > 1 && raw.starts_with('0') {
                (8, &raw[1..])
            } else {
                (10, raw)
            };
        if digits.is_empty() {
            return None;
        }
        let magnitude = i64::from_str_radix(digits, radix).ok()?;
        Some(if negative { -magnitude } else { magnitude })
    }

    /// Parses the value at `key` as a boolean.
    ///
    /// The case-insensitive set `{"1", "yes", "true", "on"}` is `true`;
    /// everything else (including absence of the key) is `false`.
    pub fn get_bool(&self, key: &str) -> bool {
        match self.get(key) {
            Some(raw) => matches!(
                raw.to_ascii_lowercase().as_str(),
                "1" | "yes" | "true" | "on"
            ),
            None => false,
        }
    }

    /// Parses the value at `key` as a byte size (e.g. `"32mb"`, `"512kb"`,
    /// `"128"`). Units are case-insensitive and one of `b`, `kb`, `mb`,
    /// `gb` (powers of 1024); a bare integer is interpreted as bytes.
    pub fn get_size(&self, key: &str) -> Option<u64> {
        let raw = self.get(key)?.trim().to_ascii_lowercase();
        let (digits, multiplier) = if let Some(n) = raw.strip_suffix("gb") {
            (n, 1024 * 1024 * 1024)
        } else if let Some(n) = raw.strip_suffix("mb") {
            (n, 1024 * 1024)
        } else if let Some(n) = raw.strip_suffix("kb") {
            (n, 1024)
        } else if let Some(n) = raw.strip_suffix('b') {
            (n, 1)
        } else {
            (raw.as_str(), 1)
        };
        let value: u64 = digits.trim().parse().ok()?;
        Some(value * multiplier)
    }

    /// Returns the node at `key`, if present.
    pub fn get_node(&self, key: &str) -> Option<&ConfigNode> {
        let parts: Vec<&str> = key.split('.').filter(|s| !s.is_empty()).collect();
        let mut node = &self.root;
        for part in parts {
            node = node.children.get(part)?;
        }
        Some(node)
    }

    /// Returns the child of `node` named `name`, if present.
    pub fn lookup_child<'a>(&self, node: &'a ConfigNode, name: &str) -> Option<&'a ConfigNode> {
        node.children.get(name)
    }

    /// Returns the scalar value of the child of `node` named `name`, if
    /// present.
    pub fn lookup_child_value<'a>(&self, node: &'a ConfigNode, name: &str) -> Option<&'a str> {
        self.lookup_child(node, name)?.value.as_deref()
    }

    /// Removes the entry at `key`. Returns `true` if an entry was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        let parts: Vec<&str> = key.split('.').filter(|s| !s.is_empty()).collect();
        if parts.is_empty() {
            return false;
        }
        let node = Self::node_mut(&mut self.root, &parts[..parts.len() - 1]);
        node.children.remove(parts[parts.len() - 1]).is_some()
    }

    /// Diagnostic traversal: renders the whole tree as an indented string.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        Self::dump_node(&self.root, 0, &mut out);
        out
    }

    fn dump_node(node: &ConfigNode, depth: usize, out: &mut String) {
        let mut names: Vec<&String> = node.children.keys().collect();
        names.sort();
        for name in names {
            let child = &node.children[name];
            let _ = write!(out, "{}{}", "  ".repeat(depth), name);
            if let Some(v) = &child.value {
                let _ = write!(out, " = {v}");
            }
            out.push('\n');
            Self::dump_node(child, depth + 1, out);
        }
    }

    /// Walks (creating as needed) the node addressed by `parts`, starting
    /// from `root`. Intermediate nodes never carry a scalar value.
    fn node_mut<'a>(root: &'a mut ConfigNode, parts: &[&str]) -> &'a mut ConfigNode {
        let mut node = root;
        for part in parts {
            node = node
                .children
                .entry(part.to_string())
                .or_insert_with(|| ConfigNode {
                    name: part.to_string(),
                    ..Default::default()
                });
        }
        node
    }
}

fn flatten_toml(store: &mut ConfigStore, prefix: &str, value: &toml::Value) {
    match value {
        toml::Value::Table(table) => {
            for (k, v) in table {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten_toml(store, &key, v);
            }
        }
        toml::Value::String(s) => {
            store.set(prefix, s.clone(), true);
        }
        other => {
            store.set(prefix, other.to_string(), true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing() {
        let mut store = ConfigStore::new();
        store.set("b", "Yes", true);
        assert!(store.get_bool("b"));
        store.set("b", "0", true);
        assert!(!store.get_bool("b"));
        store.set("b", "maybe", true);
        assert!(!store.get_bool("b"));
    }

    #[test]
    fn int_parsing_bases() {
        let mut store = ConfigStore::new();
        store.set("n", "0x1F", true);
        assert_eq!(store.get_int("n"), Some(31));
        store.set("n", "017", true);
        assert_eq!(store.get_int("n"), Some(15));
        store.set("n", "42", true);
        assert_eq!(store.get_int("n"), Some(42));
        store.set("n", "42x", true);
        assert_eq!(store.get_int("n"), None);
    }

    #[test]
    fn size_parsing() {
        let mut store = ConfigStore::new();
        store.set("flow.memcap", "32mb", true);
        assert_eq!(store.get_size("flow.memcap"), Some(32 * 1024 * 1024));
        store.set("flow.memcap", "10000", true);
        assert_eq!(store.get_size("flow.memcap"), Some(10_000));
    }

    #[test]
    fn override_policy() {
        let mut store = ConfigStore::new();
        assert!(store.set("k", "v1", false));
        assert!(!store.set("k", "v2", true));
        assert_eq!(store.get("k"), Some("v1"));
    }

    #[test]
    fn override_policy_allowed_then_locked() {
        let mut store = ConfigStore::new();
        assert!(store.set("k", "v1", true));
        assert!(store.set("k", "v2", false));
        assert_eq!(store.get("k"), Some("v2"));
        assert!(!store.set("k", "v3", true));
        assert_eq!(store.get("k"), Some("v2"));
    }

    #[test]
    fn nested_get_and_remove() {
        let mut store = ConfigStore::new();
        store.set("flow-timeouts.tcp.new", "60", true);
        assert_eq!(store.get_int("flow-timeouts.tcp.new"), Some(60));
        let node = store.get_node("flow-timeouts.tcp").unwrap();
        assert_eq!(store.lookup_child_value(node, "new"), Some("60"));
        assert!(store.remove("flow-timeouts.tcp.new"));
        assert_eq!(store.get("flow-timeouts.tcp.new"), None);
    }

    #[test]
    fn from_toml() {
        let store = ConfigStore::from_toml_str(
            r#"
            [flow]
            memcap = "32mb"
            hash-size = 65536

            [flow-timeouts.tcp]
            new = 60
            established = 3600
            "#,
        )
        .unwrap();
        assert_eq!(store.get_size("flow.memcap"), Some(32 * 1024 * 1024));
        assert_eq!(store.get_int("flow.hash-size"), Some(65536));
        assert_eq!(store.get_int("flow-timeouts.tcp.new"), Some(60));
    }
}
