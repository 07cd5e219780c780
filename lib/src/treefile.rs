//! The compose treefile document (§4.8, §6): a JSON/YAML document with the
//! same semantic fields as an [`crate::origin::Origin`] plus compose-only
//! keys (`ref`, `repos`, `install-langs`, ...), supporting an `include:`
//! chain.
//!
//! Grounded on the teacher's `spec.rs` for the "plain serde struct with
//! `#[serde(default)]` everywhere, loaded from either JSON or YAML"
//! convention, and on `original_source/src/libpriv/rpmostree-json-parsing.*`
//! (via the include-expansion semantics named in spec §4.8 step 1) for the
//! array-prepend/scalar-override merge rule.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// `include:` chains are capped at this depth; exceeding it or detecting a
/// cycle is an error (spec §4.8 step 1, §6).
pub const MAX_INCLUDE_DEPTH: usize = 50;

/// The passwd/group validation source kind (spec §4.8 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckSource {
    /// Compare against the prior commit under `ref`.
    Previous,
    /// Compare against a file shipped in the treefile directory.
    File,
    /// Compare against inline data in the treefile itself.
    Data,
}

/// One field's worth of raw, not-yet-merged treefile data. Every field is
/// optional so a child document can override or extend only what it needs
/// to; [`Treefile::expand_includes`] folds a chain of these into one
/// resolved [`Treefile`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawTreefile {
    /// Another treefile to expand before this one, relative to this file's directory.
    #[serde(default)]
    pub include: Option<String>,
    /// The ostree ref this compose writes to.
    #[serde(default)]
    pub r#ref: Option<String>,
    /// rpm-md repo names to enable for this compose.
    #[serde(default)]
    pub repos: Vec<String>,
    /// Packages installed before `packages`, to seed a bootstrap environment.
    #[serde(default)]
    pub bootstrap_packages: Vec<String>,
    /// Packages to install.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Locale catalogs to keep; others are pruned by documentation/install-langs handling.
    #[serde(default)]
    pub install_langs: Vec<String>,
    /// Whether to run SELinux relabeling during postprocess.
    #[serde(default)]
    pub selinux: Option<bool>,
    /// Whether to keep `/usr/share/doc` and friends.
    #[serde(default)]
    pub documentation: Option<bool>,
    /// `BootLocation` as a string (`"modules"` or `"new"`); see [`crate::postprocess::BootLocation`].
    #[serde(default)]
    pub boot_location: Option<String>,
    /// When set, the commit's `version` metadata is computed as `{prefix}.{N}` for the next unused N.
    #[serde(default)]
    pub automatic_version_prefix: Option<String>,
    /// passwd validation source, if any.
    #[serde(default)]
    pub check_passwd: Option<CheckSource>,
    /// group validation source, if any.
    #[serde(default)]
    pub check_groups: Option<CheckSource>,
    /// User names allowed to disappear between composes without failing validation.
    #[serde(default)]
    pub ignore_removed_users: Vec<String>,
    /// Group names allowed to disappear between composes without failing validation.
    #[serde(default)]
    pub ignore_removed_groups: Vec<String>,
    /// GPG key ID to sign the resulting commit with.
    #[serde(default)]
    pub gpg_key: Option<String>,
    /// A path whose mtime is bumped when the compose produces a new commit.
    #[serde(default)]
    pub touch_if_changed: Option<String>,
}

/// A fully expanded, ready-to-compose treefile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Treefile {
    /// The ostree ref this compose writes to.
    pub r#ref: String,
    /// rpm-md repo names to enable.
    pub repos: Vec<String>,
    /// Packages installed before `packages`.
    pub bootstrap_packages: Vec<String>,
    /// Packages to install.
    pub packages: Vec<String>,
    /// Locale catalogs to keep.
    pub install_langs: Vec<String>,
    /// Whether to run SELinux relabeling during postprocess.
    pub selinux: bool,
    /// Whether to keep documentation files.
    pub documentation: bool,
    /// Kernel/initramfs placement.
    pub boot_location: String,
    /// Version-prefix for automatic version computation.
    pub automatic_version_prefix: Option<String>,
    /// passwd validation source.
    pub check_passwd: Option<CheckSource>,
    /// group validation source.
    pub check_groups: Option<CheckSource>,
    /// Users allowed to disappear without failing validation.
    pub ignore_removed_users: BTreeSet<String>,
    /// Groups allowed to disappear without failing validation.
    pub ignore_removed_groups: BTreeSet<String>,
    /// GPG key ID to sign with.
    pub gpg_key: Option<String>,
    /// Path to touch on a new commit.
    pub touch_if_changed: Option<String>,
}

impl Treefile {
    /// Load and fully expand a treefile document (JSON or YAML, detected by
    /// a leading `{`) starting at `path`, following its `include` chain.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        load_chain(path, 0, &mut chain, &mut seen)
            .with_context(|| format!("Loading treefile {path}"))?;
        Ok(merge_chain(chain))
    }
}

fn parse_raw(path: &Utf8Path, text: &str) -> Result<RawTreefile> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        serde_json::from_str(text).with_context(|| format!("Parsing {path} as JSON"))
    } else {
        serde_yaml::from_str(text).with_context(|| format!("Parsing {path} as YAML"))
    }
}

/// Walk the `include:` chain depth-first, parent first: `chain[0]` ends up
/// being the root-most ancestor, `chain.last()` the leaf that was passed in.
fn load_chain(
    path: &Utf8Path,
    depth: usize,
    chain: &mut Vec<RawTreefile>,
    seen: &mut BTreeSet<Utf8PathBuf>,
) -> Result<()> {
    if depth > MAX_INCLUDE_DEPTH {
        anyhow::bail!("include chain exceeds max depth {MAX_INCLUDE_DEPTH}");
    }
    let canonical = path.to_path_buf();
    if !seen.insert(canonical.clone()) {
        anyhow::bail!("include cycle detected at {path}");
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
    let raw = parse_raw(path, &text)?;
    if let Some(include) = &raw.include {
        let dir = path.parent().unwrap_or(Utf8Path::new("."));
        let included = dir.join(include);
        load_chain(&included, depth + 1, chain, seen)?;
    }
    chain.push(raw);
    Ok(())
}

/// Fold a parent-first chain into one `Treefile`: array fields are
/// prepended-parent-then-child (parent entries come first), scalar fields
/// are overridden by the most specific (last) document that sets them.
fn merge_chain(chain: Vec<RawTreefile>) -> Treefile {
    let mut r#ref = None;
    let mut repos = Vec::new();
    let mut bootstrap_packages = Vec::new();
    let mut packages = Vec::new();
    let mut install_langs = Vec::new();
    let mut selinux = None;
    let mut documentation = None;
    let mut boot_location = None;
    let mut automatic_version_prefix = None;
    let mut check_passwd = None;
    let mut check_groups = None;
    let mut ignore_removed_users = BTreeSet::new();
    let mut ignore_removed_groups = BTreeSet::new();
    let mut gpg_key = None;
    let mut touch_if_changed = None;

    for raw in chain {
        if raw.r#ref.is_some() {
            r#ref = raw.r#ref;
        }
        repos.extend(raw.repos);
        bootstrap_packages.extend(raw.bootstrap_packages);
        packages.extend(raw.packages);
        install_langs.extend(raw.install_langs);
        if raw.selinux.is_some() {
            selinux = raw.selinux;
        }
        if raw.documentation.is_some() {
            documentation = raw.documentation;
        }
        if raw.boot_location.is_some() {
            boot_location = raw.boot_location;
        }
        if raw.automatic_version_prefix.is_some() {
            automatic_version_prefix = raw.automatic_version_prefix;
        }
        if raw.check_passwd.is_some() {
            check_passwd = raw.check_passwd;
        }
        if raw.check_groups.is_some() {
            check_groups = raw.check_groups;
        }
        ignore_removed_users.extend(raw.ignore_removed_users);
        ignore_removed_groups.extend(raw.ignore_removed_groups);
        if raw.gpg_key.is_some() {
            gpg_key = raw.gpg_key;
        }
        if raw.touch_if_changed.is_some() {
            touch_if_changed = raw.touch_if_changed;
        }
    }

    Treefile {
        r#ref: r#ref.unwrap_or_default(),
        repos,
        bootstrap_packages,
        packages,
        install_langs,
        selinux: selinux.unwrap_or(true),
        documentation: documentation.unwrap_or(true),
        boot_location: boot_location.unwrap_or_else(|| "modules".to_string()),
        automatic_version_prefix,
        check_passwd,
        check_groups,
        ignore_removed_users,
        ignore_removed_groups,
        gpg_key,
        touch_if_changed,
    }
}

/// The bytes folded into `inputhash` (spec §4.8 step 3): a canonical
/// (sorted-keys) JSON rendering of the resolved treefile.
pub fn canonical_bytes(tf: &Treefile) -> Result<Vec<u8>> {
    let value = serde_json::to_value(tf)?;
    let canonical = canonicalize_value(&value);
    Ok(serde_json::to_vec(&canonical)?)
}

fn canonicalize_value(v: &serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize_value(v)))
                .collect();
            serde_json::to_value(sorted).unwrap()
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize_value).collect())
        }
        other => other.clone(),
    }
}
