//! PropertyInfo trie.
//!
//! Maps a property name to its `(security_context, type)` pair using the
//! longest-matching entry from a set of `name[*] context type` lines, the
//! same prefix-match semantics `property_contexts` files use upstream.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// A property's SELinux-style context label and declared value type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Context string consulted by the `property_service:set` check.
    pub context: String,
    /// Symbolic type name (`string`, `int`, `bool`, `enum`, ...).
    pub ty: String,
}

impl PropertyInfo {
    /// Stands in for the `property_service:set`/`ctl_*` SELinux checks:
    /// root is always permitted, and a non-root setter is permitted only
    /// when the entry's context opts in to unprivileged access via the
    /// `_unpriv_` authoring convention (e.g. `u:object_r:foo_unpriv_prop:s0`).
    pub fn permits(&self, uid: u32) -> bool {
        uid == 0 || self.context.contains("_unpriv_")
    }

    /// Stands in for the per-type value legality check a real
    /// `property_contexts`-driven implementation enforces: the leading
    /// whitespace token of `ty` selects the rule, and an unrecognized type
    /// name is treated permissively rather than rejecting the write.
    pub fn value_matches_type(&self, value: &str) -> bool {
        let mut tokens = self.ty.split_whitespace();
        match tokens.next() {
            Some("string") | None => true,
            Some("bool") => matches!(value, "true" | "false" | "1" | "0" | "yes" | "no"),
            Some("int") => value.parse::<i64>().is_ok(),
            Some("uint") => value.parse::<u64>().is_ok(),
            Some("double") => value.parse::<f64>().is_ok(),
            Some("enum") => tokens.any(|allowed| allowed == value),
            Some(_) => true,
        }
    }
}

/// Ordered set of `(pattern, info)` entries; patterns ending in `*` match
/// any name sharing that prefix, and the longest matching pattern wins.
#[derive(Debug, Clone, Default)]
pub struct PropertyInfoTrie {
    entries: BTreeMap<String, PropertyInfo>,
}

impl PropertyInfoTrie {
    /// Builds an empty trie.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one `property_contexts`-style file and merges its entries in.
    /// Later files (when concatenated by the caller) override earlier ones
    /// for the same exact pattern.
    pub fn load_file(&mut self, path: &Path) -> std::io::Result<()> {
        let content = fs::read_to_string(path)?;
        self.load_str(&content);
        Ok(())
    }

    /// Parses `property_contexts`-formatted text directly.
    pub fn load_str(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(pattern), Some(context), Some(ty)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            self.entries.insert(
                pattern.to_string(),
                PropertyInfo {
                    context: context.to_string(),
                    ty: ty.to_string(),
                },
            );
        }
    }

    /// Looks up `name`, preferring the longest matching pattern (exact
    /// matches beat prefix matches of the same stem; longer prefixes beat
    /// shorter ones).
    pub fn lookup(&self, name: &str) -> Option<&PropertyInfo> {
        let mut best: Option<(&str, &PropertyInfo)> = None;

        for (pattern, info) in &self.entries {
            let matches = if let Some(stem) = pattern.strip_suffix('*') {
                name.starts_with(stem)
            } else {
                name == pattern
            };
            if !matches {
                continue;
            }
            let is_better = match best {
                None => true,
                Some((current, _)) => pattern.len() > current.len(),
            };
            if is_better {
                best = Some((pattern, info));
            }
        }

        best.map(|(_, info)| info)
    }

    /// Serializes the trie to a stable, line-oriented format suitable for
    /// atomic publication at [`crate::constants::PROPERTY_INFO_PUBLISH_PATH`].
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (pattern, info) in &self.entries {
            out.push_str(pattern);
            out.push(' ');
            out.push_str(&info.context);
            out.push(' ');
            out.push_str(&info.ty);
            out.push('\n');
        }
        out
    }

    /// Number of distinct patterns.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the trie has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_prefers_longest_prefix_match() {
        let mut trie = PropertyInfoTrie::new();
        trie.load_str(
            "ro.* u:object_r:default_prop:s0 string\nro.boot.* u:object_r:boot_prop:s0 string\n",
        );
        let info = trie.lookup("ro.boot.serialno").unwrap();
        assert_eq!(info.context, "u:object_r:boot_prop:s0");
    }

    #[test]
    fn lookup_returns_none_for_unmatched_name() {
        let trie = PropertyInfoTrie::new();
        assert!(trie.lookup("debug.unknown").is_none());
    }

    #[test]
    fn later_load_overrides_same_pattern() {
        let mut trie = PropertyInfoTrie::new();
        trie.load_str("ro.* ctx_a string\n");
        trie.load_str("ro.* ctx_b string\n");
        assert_eq!(trie.lookup("ro.x").unwrap().context, "ctx_b");
    }

    #[test]
    fn serialize_round_trips_through_load_str() {
        let mut trie = PropertyInfoTrie::new();
        trie.load_str("ro.boot.* ctx string\n");
        let serialized = trie.serialize();
        let mut reloaded = PropertyInfoTrie::new();
        reloaded.load_str(&serialized);
        assert_eq!(reloaded.lookup("ro.boot.x"), trie.lookup("ro.boot.x"));
    }

    #[test]
    fn permits_allows_root_and_unpriv_context_only() {
        let restricted = PropertyInfo { context: "u:object_r:foo_prop:s0".into(), ty: "string".into() };
        let unpriv = PropertyInfo { context: "u:object_r:foo_unpriv_prop:s0".into(), ty: "string".into() };
        assert!(restricted.permits(0));
        assert!(!restricted.permits(1000));
        assert!(unpriv.permits(1000));
    }

    #[test]
    fn value_matches_type_checks_each_known_type() {
        let bool_info = PropertyInfo { context: "ctx".into(), ty: "bool".into() };
        assert!(bool_info.value_matches_type("yes"));
        assert!(!bool_info.value_matches_type("maybe"));

        let int_info = PropertyInfo { context: "ctx".into(), ty: "int".into() };
        assert!(int_info.value_matches_type("-12"));
        assert!(!int_info.value_matches_type("12.5"));

        let enum_info = PropertyInfo { context: "ctx".into(), ty: "enum foo bar".into() };
        assert!(enum_info.value_matches_type("bar"));
        assert!(!enum_info.value_matches_type("baz"));

        let string_info = PropertyInfo { context: "ctx".into(), ty: "string".into() };
        assert!(string_info.value_matches_type("anything at all"));
    }
}
