//! In-memory property map behind the crate's usual
//! `OnceLock<RwLock<...>>` singleton pattern (see [`crate::runtime`]).
use crate::constants::{
    PERSIST_PREFIX, PROPERTY_NAME_MAX, PROPERTY_VALUE_MAX, READ_ONLY_PREFIX,
};
use crate::error::SetResult;
use crate::property::InternalMessage;
use crate::property::info::PropertyInfo;
use crate::runtime;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Mutex, OnceLock, RwLock};
use tracing::warn;

/// Name->value map with write-once `ro.*` semantics and `persist.*` durable
/// mirroring.
pub struct PropertyStore {
    values: HashMap<String, String>,
    persist_dir: Option<PathBuf>,
    notifier: Mutex<Option<Sender<InternalMessage>>>,
}

impl std::fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyStore")
            .field("len", &self.values.len())
            .field("persist_dir", &self.persist_dir)
            .finish()
    }
}

impl PropertyStore {
    fn new() -> Self {
        Self {
            values: HashMap::new(),
            persist_dir: None,
            notifier: Mutex::new(None),
        }
    }

    /// Registers the channel the server thread uses to receive
    /// `PropertyChanged` notifications.
    pub fn set_notifier(&self, sender: Sender<InternalMessage>) {
        *self.notifier.lock().expect("notifier mutex poisoned") = Some(sender);
    }

    /// Configures the directory `persist.*` keys are mirrored into.
    pub fn set_persist_dir(&mut self, dir: PathBuf) {
        self.persist_dir = Some(dir);
    }

    /// Current value of `name`, if set.
    pub fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }

    /// Returns every key/value pair — used to build the pre-fork snapshot
    /// consumed by C1's step 9 argv expansion.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values.clone()
    }

    /// Validates and applies `Set(name, value)`. `info`, when given, is the
    /// PropertyInfo trie entry matching `name`; its declared type gates the
    /// write in addition to the plain length check `is_legal_value` applies.
    pub fn set(&mut self, name: &str, value: &str, info: Option<&PropertyInfo>) -> SetResult {
        if !is_legal_name(name) {
            return SetResult::InvalidName;
        }
        if !is_legal_value(value) {
            return SetResult::InvalidValue;
        }
        if let Some(info) = info
            && !info.value_matches_type(value)
        {
            return SetResult::InvalidValue;
        }
        if name.starts_with(READ_ONLY_PREFIX) && self.values.contains_key(name) {
            return SetResult::ReadOnlyAlready;
        }

        self.values.insert(name.to_string(), value.to_string());
        self.after_successful_set(name, value);
        SetResult::Success
    }

    fn after_successful_set(&self, name: &str, value: &str) {
        if runtime::persistent_properties_loaded() && name.starts_with(PERSIST_PREFIX) {
            self.write_persisted(name, value);
        }
        if runtime::accept_messages()
            && let Some(sender) = self.notifier.lock().expect("notifier mutex poisoned").as_ref()
        {
            let _ = sender.send(InternalMessage::PropertyChanged {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
    }

    fn write_persisted(&self, name: &str, value: &str) {
        let Some(dir) = &self.persist_dir else {
            return;
        };
        if let Err(err) = fs::create_dir_all(dir) {
            warn!("failed to create persist directory {dir:?}: {err}");
            return;
        }
        let final_path = dir.join(name);
        let tmp_path = dir.join(format!(".{name}.tmp"));
        if let Err(err) = fs::write(&tmp_path, value) {
            warn!("failed to write persisted property '{name}': {err}");
            return;
        }
        if let Err(err) = fs::rename(&tmp_path, &final_path) {
            warn!("failed to atomically publish persisted property '{name}': {err}");
        }
    }
}

/// `[A-Za-z0-9._-]`, bounded length, no empty dot-segments.
pub fn is_legal_name(name: &str) -> bool {
    if name.is_empty() || name.len() > PROPERTY_NAME_MAX {
        return false;
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return false;
    }
    !name.split('.').any(|segment| segment.is_empty())
}

/// Length bound only; per-type checks are consulted via the PropertyInfo
/// trie at the server layer, not here.
pub fn is_legal_value(value: &str) -> bool {
    value.len() <= PROPERTY_VALUE_MAX
}

static GLOBAL: OnceLock<RwLock<PropertyStore>> = OnceLock::new();

fn lock() -> &'static RwLock<PropertyStore> {
    GLOBAL.get_or_init(|| RwLock::new(PropertyStore::new()))
}

/// Handle to the process-wide property store singleton.
#[derive(Debug, Clone, Copy)]
pub struct GlobalStore;

impl GlobalStore {
    /// See [`PropertyStore::get`].
    pub fn get(&self, name: &str) -> Option<String> {
        lock().read().expect("property store poisoned").get(name)
    }

    /// See [`PropertyStore::set`].
    pub fn set(&self, name: &str, value: &str, info: Option<&PropertyInfo>) -> SetResult {
        lock().write().expect("property store poisoned").set(name, value, info)
    }

    /// Applies a Set without legality/write-once checks, for supervisor
    /// bookkeeping writes.
    pub fn set_force(&self, name: &str, value: &str) {
        let mut guard = lock().write().expect("property store poisoned");
        guard.values.insert(name.to_string(), value.to_string());
        guard.after_successful_set(name, value);
    }

    /// See [`PropertyStore::snapshot`].
    pub fn snapshot(&self) -> HashMap<String, String> {
        lock().read().expect("property store poisoned").snapshot()
    }

    /// See [`PropertyStore::set_notifier`].
    pub fn set_notifier(&self, sender: Sender<InternalMessage>) {
        lock().read().expect("property store poisoned").set_notifier(sender);
    }

    /// See [`PropertyStore::set_persist_dir`].
    pub fn set_persist_dir(&self, dir: PathBuf) {
        lock().write().expect("property store poisoned").persist_dir = Some(dir);
    }
}

/// Returns the process-wide property store handle.
pub fn global() -> GlobalStore {
    GlobalStore
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_name_accepts_expected_alphabet() {
        assert!(is_legal_name("ro.boot.serialno"));
        assert!(!is_legal_name(""));
        assert!(!is_legal_name("has space"));
        assert!(!is_legal_name("leading..dot"));
    }

    #[test]
    fn legal_name_rejects_boundary_lengths() {
        let ok = "a".repeat(31);
        let bad = "a".repeat(32);
        assert!(is_legal_name(&ok));
        assert!(!is_legal_name(&bad));
    }

    #[test]
    fn legal_value_rejects_boundary_lengths() {
        assert!(is_legal_value(&"a".repeat(91)));
        assert!(!is_legal_value(&"a".repeat(92)));
    }

    #[test]
    fn set_rejects_invalid_name_and_value() {
        let mut store = PropertyStore::new();
        assert_eq!(store.set("bad name", "v", None), SetResult::InvalidName);
        assert_eq!(store.set("ok.name", &"x".repeat(92), None), SetResult::InvalidValue);
    }

    #[test]
    fn read_only_prefix_is_write_once() {
        let mut store = PropertyStore::new();
        assert_eq!(store.set("ro.foo", "1", None), SetResult::Success);
        assert_eq!(store.set("ro.foo", "2", None), SetResult::ReadOnlyAlready);
        assert_eq!(store.get("ro.foo"), Some("1".to_string()));
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut store = PropertyStore::new();
        assert_eq!(store.set("debug.foo", "bar", None), SetResult::Success);
        assert_eq!(store.get("debug.foo"), Some("bar".to_string()));
    }

    #[test]
    fn set_rejects_value_mismatched_with_declared_type() {
        let mut store = PropertyStore::new();
        let info = PropertyInfo { context: "ctx".into(), ty: "bool".into() };
        assert_eq!(store.set("debug.flag", "maybe", Some(&info)), SetResult::InvalidValue);
        assert_eq!(store.set("debug.flag", "yes", Some(&info)), SetResult::Success);
    }
}
