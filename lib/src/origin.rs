//! The [`Origin`] data model: the per-deployment declaration of what a
//! deployment *should* be, sufficient to reproduce its layered commit.
//!
//! Persisted next to each deployment as a `glib::KeyFile` document (plain
//! `[group]` sections), the same format libostree itself uses for origin
//! files; see [`Origin::load`]/[`Origin::serialize`].

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use ostree_ext::glib;
use ostree_ext::keyfileext::KeyFileExt;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::refspec::{Refspec, RefspecKind};

/// An RPM NEVRA string (`name-epoch:version-release.arch`), used as a map key
/// for locally-supplied package layers.
pub type Nevra = String;
/// The sha256 of an RPM header, pinning the exact content behind a [`Nevra`].
pub type HeaderSha256 = String;

/// An override entry: either a base package removed, or a base package
/// replaced by a local RPM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideEntry {
    /// Remove this base package name entirely.
    Remove(String),
    /// Replace a base package with the local RPM identified by `nevra`.
    ReplaceLocal {
        /// The replacement package's NEVRA.
        nevra: Nevra,
        /// The sha256 of the replacement package's RPM header.
        sha256: HeaderSha256,
    },
}

/// The kind of override, used to disambiguate [`Origin::remove_override`] lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKind {
    /// See [`OverrideEntry::Remove`].
    Remove,
    /// See [`OverrideEntry::ReplaceLocal`].
    ReplaceLocal,
}

/// The per-deployment origin document (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// The base commit source.
    pub refspec: Refspec,
    /// Package names to layer from rpm-md.
    pub packages: BTreeSet<String>,
    /// Locally-supplied package layers, keyed by NEVRA.
    pub packages_local: BTreeMap<Nevra, HeaderSha256>,
    /// Base package names removed.
    pub overrides_remove: BTreeSet<String>,
    /// Base packages replaced by a local RPM, keyed by the replacement's NEVRA.
    pub overrides_replace_local: BTreeMap<Nevra, HeaderSha256>,
    /// Whether to regenerate the initramfs for this deployment.
    pub regenerate_initramfs: bool,
    /// Extra arguments passed to the initramfs generator.
    pub initramfs_args: Vec<String>,
    /// Paths under `/etc` to bake into the initramfs.
    pub initramfs_etc: BTreeSet<Utf8PathBuf>,
    /// Kernel command-line arguments, in order; duplicates with distinct values are permitted.
    pub kernel_args: Vec<String>,
    /// A commit pin that does not change the refspec.
    pub override_commit: Option<String>,
    /// Free-form provenance URL for `Checksum` refspecs.
    pub custom_origin_url: Option<String>,
    /// Free-form provenance description for `Checksum` refspecs.
    pub custom_origin_description: Option<String>,
}

const GROUP_ORIGIN: &str = "origin";
const GROUP_PACKAGES: &str = "packages";
const GROUP_OVERRIDES: &str = "overrides";
const GROUP_INITRAMFS: &str = "initramfs";

impl Origin {
    /// Construct a fresh origin from a refspec, with no layering.
    pub fn new(refspec: Refspec) -> Self {
        Self {
            refspec,
            packages: Default::default(),
            packages_local: Default::default(),
            overrides_remove: Default::default(),
            overrides_replace_local: Default::default(),
            regenerate_initramfs: false,
            initramfs_args: Default::default(),
            initramfs_etc: Default::default(),
            kernel_args: Default::default(),
            override_commit: None,
            custom_origin_url: None,
            custom_origin_description: None,
        }
    }

    /// Parse an origin document from the on-disk keyfile bytes.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes).context("Origin file is not valid UTF-8")?;
        let kf = glib::KeyFile::new();
        kf.load_from_data(text, glib::KeyFileFlags::NONE)
            .context("Parsing origin keyfile")?;

        let refspec_str = kf
            .optional_string(GROUP_ORIGIN, "refspec")?
            .or(kf.optional_string(GROUP_ORIGIN, "baserefspec")?)
            .ok_or_else(|| anyhow::anyhow!("Origin file has no refspec"))?;
        let refspec = Refspec::parse(refspec_str.as_str())?;

        let custom_origin_url = kf.optional_string(GROUP_ORIGIN, "custom-url")?.map(String::from);
        let custom_origin_description = kf
            .optional_string(GROUP_ORIGIN, "custom-description")?
            .map(String::from);
        let override_commit = kf.optional_string(GROUP_ORIGIN, "override-commit")?.map(String::from);

        let packages = split_list(kf.optional_string(GROUP_PACKAGES, "requested")?.as_deref());
        let packages_local = split_list(kf.optional_string(GROUP_PACKAGES, "requested-local")?.as_deref())
            .into_iter()
            .map(|item| parse_nevra_sha(&item))
            .collect::<Result<_>>()?;

        let overrides_remove =
            split_list(kf.optional_string(GROUP_OVERRIDES, "remove")?.as_deref());
        let overrides_replace_local =
            split_list(kf.optional_string(GROUP_OVERRIDES, "replace-local")?.as_deref())
                .into_iter()
                .map(|item| parse_nevra_sha(&item))
                .collect::<Result<_>>()?;

        let regenerate_initramfs = kf
            .optional_bool(GROUP_INITRAMFS, "regenerate")?
            .unwrap_or(false);
        let initramfs_args = split_list(kf.optional_string(GROUP_INITRAMFS, "args")?.as_deref());
        let initramfs_etc = split_list(kf.optional_string("initramfs-etc", "track")?.as_deref())
            .into_iter()
            .map(Utf8PathBuf::from)
            .collect();
        let kernel_args = split_list(kf.optional_string(GROUP_ORIGIN, "kargs")?.as_deref());

        let origin = Self {
            refspec,
            packages,
            packages_local,
            overrides_remove,
            overrides_replace_local,
            regenerate_initramfs,
            initramfs_args,
            initramfs_etc,
            kernel_args,
            override_commit,
            custom_origin_url,
            custom_origin_description,
        };
        origin.validate()?;
        Ok(origin)
    }

    /// Serialize this origin back to its on-disk keyfile form.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let kf = glib::KeyFile::new();
        kf.set_string(GROUP_ORIGIN, "refspec", &self.refspec.to_canonical());
        if let Some(v) = &self.override_commit {
            kf.set_string(GROUP_ORIGIN, "override-commit", v);
        }
        if let Some(v) = &self.custom_origin_url {
            kf.set_string(GROUP_ORIGIN, "custom-url", v);
        }
        if let Some(v) = &self.custom_origin_description {
            kf.set_string(GROUP_ORIGIN, "custom-description", v);
        }
        if !self.kernel_args.is_empty() {
            kf.set_string(GROUP_ORIGIN, "kargs", &join_list(&self.kernel_args));
        }
        if !self.packages.is_empty() {
            kf.set_string(GROUP_PACKAGES, "requested", &join_list(&self.packages));
        }
        if !self.packages_local.is_empty() {
            kf.set_string(
                GROUP_PACKAGES,
                "requested-local",
                &join_nevra_sha(&self.packages_local),
            );
        }
        if !self.overrides_remove.is_empty() {
            kf.set_string(GROUP_OVERRIDES, "remove", &join_list(&self.overrides_remove));
        }
        if !self.overrides_replace_local.is_empty() {
            kf.set_string(
                GROUP_OVERRIDES,
                "replace-local",
                &join_nevra_sha(&self.overrides_replace_local),
            );
        }
        kf.set_boolean(GROUP_INITRAMFS, "regenerate", self.regenerate_initramfs);
        if !self.initramfs_args.is_empty() {
            kf.set_string(GROUP_INITRAMFS, "args", &join_list(&self.initramfs_args));
        }
        if !self.initramfs_etc.is_empty() {
            let items: Vec<String> = self.initramfs_etc.iter().map(|p| p.to_string()).collect();
            kf.set_string("initramfs-etc", "track", &join_list(&items));
        }
        let (data, len) = kf.to_data();
        Ok(data.as_bytes()[..len as usize].to_vec())
    }

    /// Which refspec variant this origin carries.
    pub fn classify(&self) -> RefspecKind {
        self.refspec.classify()
    }

    /// Verify the invariants from §3.
    fn validate(&self) -> Result<()> {
        let overlap: Vec<&String> = self
            .overrides_remove
            .intersection(&self.packages)
            .collect();
        if !overlap.is_empty() {
            return Err(EngineError::InvalidOrigin(format!(
                "Package(s) both layered and removed: {overlap:?}"
            ))
            .into());
        }
        if matches!(self.refspec, Refspec::Checksum(_)) && self.override_commit.is_some() {
            return Err(EngineError::InvalidOrigin(
                "override-commit is not valid together with a Checksum refspec".into(),
            )
            .into());
        }
        Ok(())
    }

    /// Change the base refspec. Rejects a no-op change for `Ostree`/`Rojig`
    /// refspecs, but accepts an identical `Checksum` rebase provided the
    /// custom-origin fields changed (a pin-only rebase).
    pub fn set_rebase(
        &mut self,
        new_refspec: Refspec,
        custom_url: Option<String>,
        custom_description: Option<String>,
    ) -> Result<()> {
        let is_noop = new_refspec == self.refspec
            && custom_url == self.custom_origin_url
            && custom_description == self.custom_origin_description;
        if is_noop {
            return Err(EngineError::InvalidOrigin(format!(
                "Refspec is unchanged: {}",
                new_refspec
            ))
            .into());
        }
        self.refspec = new_refspec;
        self.custom_origin_url = custom_url;
        self.custom_origin_description = custom_description;
        if !matches!(self.refspec, Refspec::Checksum(_)) {
            self.override_commit = None;
        }
        self.validate()
    }

    /// Pin to a specific commit without changing the refspec. Only valid for
    /// non-`Checksum` refspecs (a `Checksum` refspec already *is* a pin).
    pub fn set_override_commit(&mut self, csum: Option<String>) -> Result<()> {
        if matches!(self.refspec, Refspec::Checksum(_)) && csum.is_some() {
            return Err(EngineError::InvalidOrigin(
                "Cannot set override-commit on a Checksum refspec".into(),
            )
            .into());
        }
        self.override_commit = csum;
        Ok(())
    }

    /// Pin the rojig version, if this origin's refspec is [`Refspec::Rojig`].
    pub fn set_rojig_version(&mut self, version: Option<String>) -> Result<()> {
        match &mut self.refspec {
            Refspec::Rojig { version: v, .. } => {
                *v = version;
                Ok(())
            }
            other => Err(EngineError::InvalidOrigin(format!(
                "set_rojig_version requires a Rojig refspec, have {:?}",
                other.classify()
            ))
            .into()),
        }
    }

    /// Add package names to layer. `is_local` entries are `Nevra:sha256`
    /// pairs; otherwise plain package names destined for the resolver.
    /// Returns whether anything changed; with `idempotent=false`, requesting
    /// an already-present name is an error.
    pub fn add_packages<I: IntoIterator<Item = String>>(
        &mut self,
        names: I,
        is_local: bool,
        idempotent: bool,
    ) -> Result<bool> {
        let mut changed = false;
        for name in names {
            if is_local {
                let (nevra, sha256) = parse_nevra_sha(&name)?;
                if self.overrides_remove.contains(&nevra_pkgname(&nevra)) {
                    return Err(EngineError::InvalidOrigin(format!(
                        "{nevra} is both layered and removed"
                    ))
                    .into());
                }
                if self.packages_local.contains_key(&nevra) && !idempotent {
                    return Err(EngineError::AlreadyRequested(nevra).into());
                }
                changed |= self.packages_local.insert(nevra, sha256).is_none();
            } else {
                if self.overrides_remove.contains(&name) {
                    return Err(EngineError::InvalidOrigin(format!(
                        "{name} is both layered and removed"
                    ))
                    .into());
                }
                if self.packages.contains(&name) && !idempotent {
                    return Err(EngineError::AlreadyRequested(name).into());
                }
                changed |= self.packages.insert(name);
            }
        }
        Ok(changed)
    }

    /// Remove layered package names (from either `packages` or `packages_local`).
    pub fn remove_packages<I: IntoIterator<Item = String>>(
        &mut self,
        names: I,
        idempotent: bool,
    ) -> Result<bool> {
        let mut changed = false;
        for name in names {
            let removed_plain = self.packages.remove(&name);
            let removed_local = self.packages_local.remove(&name).is_some()
                || self
                    .packages_local
                    .keys()
                    .find(|k| nevra_pkgname(k) == name)
                    .cloned()
                    .map(|k| self.packages_local.remove(&k).is_some())
                    .unwrap_or(false);
            if !removed_plain && !removed_local && !idempotent {
                return Err(EngineError::NotLayered(name).into());
            }
            changed |= removed_plain || removed_local;
        }
        Ok(changed)
    }

    /// Clear all layered packages (rpm-md and local).
    pub fn remove_all_packages(&mut self) -> Result<bool> {
        let changed = !self.packages.is_empty() || !self.packages_local.is_empty();
        self.packages.clear();
        self.packages_local.clear();
        Ok(changed)
    }

    /// Add one or more overrides.
    pub fn add_overrides<I: IntoIterator<Item = OverrideEntry>>(&mut self, items: I) -> Result<bool> {
        let mut changed = false;
        for item in items {
            match item {
                OverrideEntry::Remove(name) => {
                    if self.packages.contains(&name)
                        || self.packages_local.keys().any(|k| nevra_pkgname(k) == name)
                    {
                        return Err(EngineError::InvalidOrigin(format!(
                            "{name} is both layered and removed"
                        ))
                        .into());
                    }
                    changed |= self.overrides_remove.insert(name);
                }
                OverrideEntry::ReplaceLocal { nevra, sha256 } => {
                    changed |= self.overrides_replace_local.insert(nevra, sha256).is_none();
                }
            }
        }
        self.validate()?;
        Ok(changed)
    }

    /// Remove a single override by key (package name for `Remove`, NEVRA for
    /// `ReplaceLocal`). Returns whether it was present.
    pub fn remove_override(&mut self, key: &str, kind: OverrideKind) -> bool {
        match kind {
            OverrideKind::Remove => self.overrides_remove.remove(key),
            OverrideKind::ReplaceLocal => self.overrides_replace_local.remove(key).is_some(),
        }
    }

    /// Clear all overrides (both removals and local replacements).
    pub fn remove_all_overrides(&mut self) -> Result<bool> {
        let changed = !self.overrides_remove.is_empty() || !self.overrides_replace_local.is_empty();
        self.overrides_remove.clear();
        self.overrides_replace_local.clear();
        Ok(changed)
    }

    /// Toggle initramfs regeneration, optionally replacing its extra args.
    pub fn set_regenerate_initramfs(&mut self, on: bool, args: Option<Vec<String>>) {
        self.regenerate_initramfs = on;
        if let Some(args) = args {
            self.initramfs_args = args;
        }
    }

    /// Add `/etc` paths to bake into the initramfs. Rejects paths outside `/etc`.
    pub fn track_initramfs_etc<I: IntoIterator<Item = Utf8PathBuf>>(&mut self, paths: I) -> Result<bool> {
        let mut changed = false;
        for p in paths {
            if p.is_absolute() {
                return Err(
                    EngineError::InitramfsEtcOutsideEtc(format!("{p} must be relative to /etc")).into(),
                );
            }
            if p.components().any(|c| c.as_str() == "..") {
                return Err(EngineError::InitramfsEtcOutsideEtc(p.to_string()).into());
            }
            changed |= self.initramfs_etc.insert(p);
        }
        Ok(changed)
    }

    /// Remove specific `/etc` paths from the initramfs tracking set, or all of them.
    pub fn untrack_initramfs_etc(&mut self, paths: Option<Vec<Utf8PathBuf>>) -> bool {
        match paths {
            None => {
                let changed = !self.initramfs_etc.is_empty();
                self.initramfs_etc.clear();
                changed
            }
            Some(paths) => {
                let mut changed = false;
                for p in paths {
                    changed |= self.initramfs_etc.remove(&p);
                }
                changed
            }
        }
    }
}

fn split_list(s: Option<&str>) -> BTreeSet<String> {
    let Some(s) = s else { return Default::default() };
    s.split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn join_list<'a, I: IntoIterator<Item = &'a String>>(items: I) -> String {
    items.into_iter().cloned().collect::<Vec<_>>().join(",")
}

fn parse_nevra_sha(s: &str) -> Result<(Nevra, HeaderSha256)> {
    let (nevra, sha) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("Expected NEVRA:sha256, got {s}"))?;
    if sha.len() != 64 || !sha.bytes().all(|b| b.is_ascii_hexdigit()) {
        anyhow::bail!("Invalid header sha256 in {s}");
    }
    Ok((nevra.to_string(), sha.to_string()))
}

fn join_nevra_sha(m: &BTreeMap<Nevra, HeaderSha256>) -> String {
    m.iter()
        .map(|(n, s)| format!("{n}:{s}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Extract the bare package name from a NEVRA string
/// (`name-epoch:version-release.arch` → `name`).
pub fn nevra_pkgname(nevra: &str) -> String {
    // Strip the trailing `.arch`, then the trailing `-release`, then the
    // (possibly epoch-qualified) `-version`, leaving the name.
    let without_arch = nevra.rsplit_once('.').map(|(a, _)| a).unwrap_or(nevra);
    let mut parts: Vec<&str> = without_arch.rsplitn(3, '-').collect();
    parts.reverse();
    parts.first().copied().unwrap_or(nevra).to_string()
}

/// The relative path under `/etc` an [`Origin`]'s `initramfs_etc` entries expect.
pub fn initramfs_etc_root() -> &'static Utf8Path {
    Utf8Path::new("etc")
}
