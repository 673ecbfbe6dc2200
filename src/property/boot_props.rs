//! Boot-time `*.prop` file loader.
//!
//! Not every host running this crate is Android, so the well-known paths
//! below are consulted best-effort: any path that does not exist is skipped
//! rather than treated as an error.
use crate::privilege::expand_property_refs;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One (name, value) pair parsed from a prop file, in file order.
pub type PropLine = (String, String);

/// Parses one `key=value` prop file, following `import <file> [filter]`
/// directives; `filter` is a `prefix.*` prefix match or an exact match.
/// Import paths are expanded against `properties_so_far` before opening.
pub fn load_prop_file(path: &Path, properties_so_far: &HashMap<String, String>) -> Vec<PropLine> {
    let mut out = Vec::new();
    load_into(path, properties_so_far, &mut out);
    out
}

fn load_into(path: &Path, properties_so_far: &HashMap<String, String>, out: &mut Vec<PropLine>) {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!("failed to read prop file {path:?}: {err}");
            return;
        }
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("import ") {
            let mut parts = rest.split_whitespace();
            let Some(import_path) = parts.next() else {
                continue;
            };
            let filter = parts.next();
            let expanded = expand_property_refs(import_path, properties_so_far);
            let mut imported = Vec::new();
            load_into(Path::new(&expanded), properties_so_far, &mut imported);
            apply_filter(&mut imported, filter);
            out.extend(imported);
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            out.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
}

fn apply_filter(lines: &mut Vec<PropLine>, filter: Option<&str>) {
    let Some(pattern) = filter else {
        return;
    };
    match pattern.strip_suffix('*') {
        Some(prefix) => lines.retain(|(name, _)| name.starts_with(prefix)),
        None => lines.retain(|(name, _)| name == pattern),
    }
}

/// One boot prop source: a filesystem path plus an optional `ro.`-only
/// restriction (applied to `/factory/factory.prop`, per).
pub struct PropSource {
    /// Path to the prop file.
    pub path: PathBuf,
    /// When set, only names starting with this prefix are kept.
    pub only_prefix: Option<&'static str>,
}

/// Default search order for persisted property files: the first
/// existing path within each alternative group is used; fixed paths are
/// included only when present.
pub fn default_search_paths() -> Vec<PropSource> {
    let mut sources = Vec::new();

    first_existing(&["/system/etc/prop.default", "/prop.default", "/default.prop"])
        .into_iter()
        .for_each(|path| sources.push(PropSource { path, only_prefix: None }));

    for fixed in ["/system/build.prop", "/system_ext/build.prop", "/vendor/default.prop", "/vendor/build.prop"] {
        push_if_exists(&mut sources, fixed, None);
    }

    if let Some(path) = first_existing(&["/odm/etc/build.prop"]) {
        sources.push(PropSource { path, only_prefix: None });
    } else {
        for fixed in ["/odm/default.prop", "/odm/build.prop"] {
            push_if_exists(&mut sources, fixed, None);
        }
    }

    push_if_exists(&mut sources, "/product/build.prop", None);
    push_if_exists(&mut sources, "/factory/factory.prop", Some("ro."));
    push_if_exists(&mut sources, "/data/local.prop", None);

    sources
}

fn push_if_exists(sources: &mut Vec<PropSource>, candidate: &str, only_prefix: Option<&'static str>) {
    let path = PathBuf::from(candidate);
    if path.exists() {
        sources.push(PropSource { path, only_prefix });
    }
}

fn first_existing(candidates: &[&str]) -> Option<PathBuf> {
    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Default device-tree directory the kernel populates with Android boot
/// overrides, one file per property tail.
pub const DEVICE_TREE_ANDROID_DIR: &str = "/proc/device-tree/firmware/android";

/// Reads a device-tree override directory: each regular file's name (with
/// any `,` replaced by `.`) becomes a `ro.boot.<name>` property, and its
/// contents (trimmed of the trailing NUL the kernel pads onto dtb string
/// properties, with embedded `,` likewise mapped to `.`) becomes the value.
/// A missing directory yields no entries.
pub fn load_device_tree_overrides(dir: &Path) -> Vec<PropLine> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        let value = content.trim_end_matches('\0').replace(',', ".");
        out.push((format!("ro.boot.{}", name.replace(',', ".")), value));
    }
    out
}

/// Parses `/proc/cmdline`-style kernel command line text. Every
/// `androidboot.<tail>[=<value>]` token becomes `ro.boot.<tail>`. When a
/// bare `qemu` token is present, every token on the line (not just
/// `androidboot.*` ones) is additionally mirrored as `ro.kernel.<key>`.
pub fn parse_kernel_cmdline(content: &str) -> Vec<PropLine> {
    let tokens: Vec<&str> = content.split_whitespace().collect();
    let has_qemu = tokens.iter().any(|tok| *tok == "qemu");

    let mut out = Vec::new();
    for token in &tokens {
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, v),
            None => (*token, ""),
        };

        if let Some(tail) = key.strip_prefix("androidboot.") {
            out.push((format!("ro.boot.{tail}"), value.to_string()));
        }

        if has_qemu {
            out.push((format!("ro.kernel.{key}"), value.to_string()));
        }
    }
    out
}

/// `ro.boot.<name>` → `ro.<name>` aliases exported after kernel cmdline and
/// device-tree ingestion, each with its Android-conventional default.
pub const BOOT_PROPERTY_ALIASES: &[(&str, &str)] = &[
    ("serialno", "unknown"),
    ("bootmode", "unknown"),
    ("baseband", "unknown"),
    ("bootloader", "unknown"),
    ("hardware", "unknown"),
    ("revision", "0"),
];

/// Resolves the fixed `ro.boot.*` → `ro.*` aliases, reading from
/// `snapshot` and falling back to the alias's declared default when unset.
pub fn alias_boot_properties(snapshot: &HashMap<String, String>) -> Vec<PropLine> {
    BOOT_PROPERTY_ALIASES
        .iter()
        .map(|(name, default)| {
            let boot_name = format!("ro.boot.{name}");
            let value = snapshot.get(&boot_name).cloned().unwrap_or_else(|| default.to_string());
            (format!("ro.{name}"), value)
        })
        .collect()
}

/// Order in which partition-qualified `ro.product.<partition>.<field>`
/// sources are consulted to derive the unqualified `ro.product.<field>`
/// alias; the first partition defining the field wins.
pub const PRODUCT_PARTITION_ORDER: &[&str] = &["product", "odm", "vendor", "system_ext", "system"];

/// Derives unqualified `ro.product.<field>` aliases from the first
/// partition (in [`PRODUCT_PARTITION_ORDER`]) that defines
/// `ro.product.<partition>.<field>`.
pub fn alias_product_properties(snapshot: &HashMap<String, String>, fields: &[&str]) -> Vec<PropLine> {
    let mut out = Vec::new();
    for field in fields {
        for partition in PRODUCT_PARTITION_ORDER {
            let qualified = format!("ro.product.{partition}.{field}");
            if let Some(value) = snapshot.get(&qualified) {
                out.push((format!("ro.product.{field}"), value.clone()));
                break;
            }
        }
    }
    out
}

/// The six components `ro.build.fingerprint` is derived from.
pub const FINGERPRINT_COMPONENTS: &[&str] = &[
    "ro.product.brand",
    "ro.product.name",
    "ro.product.device",
    "ro.build.version.release",
    "ro.build.id",
    "ro.build.version.incremental",
];

/// Derives `ro.build.fingerprint` from its six components, each falling
/// back to `"unknown"` when unset.
pub fn derive_fingerprint(snapshot: &HashMap<String, String>) -> String {
    let component = |name: &str| snapshot.get(name).cloned().unwrap_or_else(|| "unknown".to_string());
    let brand = component(FINGERPRINT_COMPONENTS[0]);
    let name = component(FINGERPRINT_COMPONENTS[1]);
    let device = component(FINGERPRINT_COMPONENTS[2]);
    let release = component(FINGERPRINT_COMPONENTS[3]);
    let id = component(FINGERPRINT_COMPONENTS[4]);
    let incremental = component(FINGERPRINT_COMPONENTS[5]);
    format!("{brand}/{name}/{device}:{release}/{id}/{incremental}")
}
