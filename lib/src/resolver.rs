//! The resolver adapter (§4.3): a thin wrapper over an external package
//! manager subprocess (`dnf5`), grounded on the [`crate::task::Task`]
//! pattern already used elsewhere in this crate for sandboxed helper
//! invocation.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use crate::error::EngineError;
use crate::origin::{HeaderSha256, Nevra, OverrideEntry};
use crate::task::Task;

/// What to install, as handed to [`Resolver::prepare_install`].
#[derive(Debug, Clone, Default)]
pub struct InstallSpec {
    /// Package names to resolve from the enabled repos.
    pub packages_requested: BTreeSet<String>,
    /// Local RPM files to install verbatim, alongside their expected NEVRA.
    pub local_packages: Vec<Utf8PathBuf>,
    /// Base-package overrides (removals and local replacements).
    pub overrides: Vec<OverrideEntry>,
    /// Downgrade "already satisfied" conflicts from an error to a warning.
    pub allow_inactive: bool,
}

/// An already-installed package the resolver found to already satisfy a request.
#[derive(Debug, Clone)]
pub struct AlreadyInstalled {
    /// The requested name.
    pub name: String,
    /// The NEVRA already present in the base.
    pub satisfied_by: Nevra,
}

/// A resolved, ready-to-download/import install set.
#[derive(Debug, Clone, Default)]
pub struct Install {
    /// Packages to download, in the deterministic order they'll be imported.
    pub to_download: Vec<Nevra>,
    /// Packages already satisfied by the base, reported as warnings when `allow_inactive`.
    pub already_installed: Vec<AlreadyInstalled>,
    /// Local RPM paths that don't need a download step.
    pub local: Vec<Utf8PathBuf>,
}

/// A thin adapter driving `dnf5` as a subprocess against a private
/// install/source root, the way the teacher drives external helper
/// binaries through [`Task`].
#[derive(Debug)]
pub struct Resolver {
    install_root: Utf8PathBuf,
    source_root: Utf8PathBuf,
    repos_dir: Utf8PathBuf,
    enabled_repos: BTreeSet<String>,
}

impl Resolver {
    /// Construct a resolver bound to the given install root, package-cache
    /// source root, and `.repo` config directory.
    pub fn new(
        install_root: impl Into<Utf8PathBuf>,
        source_root: impl Into<Utf8PathBuf>,
        repos_dir: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            install_root: install_root.into(),
            source_root: source_root.into(),
            repos_dir: repos_dir.into(),
            enabled_repos: Default::default(),
        }
    }

    fn base_task(&self, description: &str) -> Task {
        Task::new(description.to_string(), "dnf5")
            .args([
                "--installroot".to_string(),
                self.install_root.to_string(),
                "--setopt".to_string(),
                format!("reposdir={}", self.repos_dir),
                "-y".to_string(),
            ])
    }

    /// Download rpm-md metadata for `repos`, enabling exactly that set.
    /// Fails with [`EngineError::RepoNotFound`] if any name is unknown.
    pub fn download_metadata(&mut self, repos: &[String]) -> Result<()> {
        let known = self.list_configured_repos()?;
        let unknown: Vec<String> = repos.iter().filter(|r| !known.contains(*r)).cloned().collect();
        if !unknown.is_empty() {
            return Err(EngineError::RepoNotFound(unknown).into());
        }
        self.enabled_repos = repos.iter().cloned().collect();
        let repo_args = repos.iter().flat_map(|r| ["--repo".to_string(), r.clone()]);
        self.base_task("Downloading repository metadata")
            .args(["makecache".to_string()])
            .args(repo_args)
            .run()
            .context("dnf5 makecache failed")
    }

    /// The repo ids configured under this resolver's `.repo` directory.
    pub fn list_repos(&self) -> Result<BTreeSet<String>> {
        self.list_configured_repos()
    }

    fn list_configured_repos(&self) -> Result<BTreeSet<String>> {
        let mut repos = BTreeSet::new();
        if let Ok(entries) = std::fs::read_dir(&self.repos_dir) {
            for ent in entries.flatten() {
                let path = ent.path();
                if path.extension().and_then(|e| e.to_str()) != Some("repo") {
                    continue;
                }
                let contents = std::fs::read_to_string(&path).unwrap_or_default();
                for line in contents.lines() {
                    let line = line.trim();
                    if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                        repos.insert(name.to_string());
                    }
                }
            }
        }
        Ok(repos)
    }

    /// Resolve `spec` against the currently enabled repos, deterministically
    /// ordering the install set and flagging already-satisfied requests.
    pub fn prepare_install(&self, spec: &InstallSpec) -> Result<Install> {
        let installed = self.installed_nevras()?;
        let mut to_download = Vec::new();
        let mut already_installed = Vec::new();

        for name in &spec.packages_requested {
            if let Some(nevra) = installed.iter().find(|n| crate::origin::nevra_pkgname(n) == *name) {
                already_installed.push(AlreadyInstalled {
                    name: name.clone(),
                    satisfied_by: nevra.clone(),
                });
                if !spec.allow_inactive {
                    continue;
                }
            }
            let resolved = self.repoquery_resolve(name)?;
            to_download.push(resolved);
        }
        to_download.sort();

        if !already_installed.is_empty() && !spec.allow_inactive {
            let names: Vec<_> = already_installed.iter().map(|a| a.name.clone()).collect();
            return Err(anyhow::anyhow!(
                "Package(s) already satisfied by the base: {names:?} (pass allow_inactive to downgrade to a warning)"
            ));
        }

        Ok(Install {
            to_download,
            already_installed,
            local: spec.local_packages.clone(),
        })
    }

    /// The path a locally-supplied package (from `packages_local` or
    /// `overrides.replace-local`) is expected to already be staged at, named
    /// by NEVRA under the source root — the same convention a downloaded
    /// package's path follows once [`Self::download`] has fetched it.
    pub fn local_package_path(&self, nevra: &str) -> Utf8PathBuf {
        self.source_root.join(format!("{nevra}.rpm"))
    }

    /// Find the NEVRA of an installed package by its bare package name, for
    /// resolving `overrides.remove`/`overrides.replace-local` targets against
    /// the base.
    pub fn find_installed_nevra(&self, pkgname: &str) -> Result<Option<Nevra>> {
        Ok(self
            .installed_nevras()?
            .into_iter()
            .find(|n| crate::origin::nevra_pkgname(n) == pkgname))
    }

    fn installed_nevras(&self) -> Result<Vec<Nevra>> {
        let out = self
            .base_task("Querying installed packages")
            .quiet()
            .args([
                "repoquery".to_string(),
                "--installed".to_string(),
                "--qf".to_string(),
                "%{nevra}".to_string(),
            ])
            .read()
            .context("dnf5 repoquery --installed failed")?;
        Ok(out.lines().map(str::to_owned).collect())
    }

    fn repoquery_resolve(&self, name: &str) -> Result<Nevra> {
        let repo_args = self
            .enabled_repos
            .iter()
            .flat_map(|r| ["--repo".to_string(), r.clone()]);
        let out = self
            .base_task(&format!("Resolving {name}"))
            .quiet()
            .args(["repoquery".to_string(), "--latest-limit=1".to_string(), "--qf".to_string(), "%{nevra}".to_string()])
            .args(repo_args)
            .args([name.to_string()])
            .read()
            .with_context(|| format!("Resolving {name}"))?;
        out.lines()
            .next()
            .map(str::to_owned)
            .ok_or_else(|| EngineError::UnknownPackage(name.to_string()).into())
    }

    /// Install `packages` directly into the resolver's install root. Used by
    /// a from-scratch compose (§4.8), which populates a rootfs in one shot
    /// rather than overlaying per-package cache commits onto a running
    /// deployment the way [`Self::import`] and the assembler do (§4.5).
    pub fn install_into_root(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        self.base_task("Installing packages into compose root")
            .args(["install".to_string()])
            .args(packages.iter().cloned())
            .run()
            .context("dnf5 install failed")
    }

    /// Download the resolved payloads for `install` into the source root's package cache.
    pub fn download(&self, install: &Install) -> Result<()> {
        if install.to_download.is_empty() {
            return Ok(());
        }
        self.base_task("Downloading packages")
            .args([
                "download".to_string(),
                "--destdir".to_string(),
                self.source_root.to_string(),
            ])
            .args(install.to_download.iter().cloned())
            .run()
            .context("dnf5 download failed")
    }

    /// Route every downloaded (or local) payload through the importer (§4.2),
    /// reusing any cache commit whose content hash already matches.
    pub fn import(
        &self,
        repo: &ostree_ext::ostree::Repo,
        install: &Install,
    ) -> Result<Vec<crate::importer::CacheCommit>> {
        let mut out = Vec::new();
        let mut paths: Vec<Utf8PathBuf> = install.local.clone();
        for nevra in &install.to_download {
            paths.push(self.source_root.join(format!("{nevra}.rpm")));
        }
        for path in paths {
            let f = std::fs::File::open(&path).with_context(|| format!("Opening {path}"))?;
            let parsed = crate::importer::parse_rpm(f)?;
            if repo.resolve_rev(&crate::importer::cache_branch(&parsed.nevra), true)?.is_some() {
                continue;
            }
            out.push(crate::importer::import(repo, &parsed, Default::default())?);
        }
        Ok(out)
    }

    /// Commit the prepared, imported rootfs at `tmp_rootfs_dfd`; delegates
    /// to the assembler, which owns the hardlink/relabel/metadata logic.
    pub fn assemble_commit(&self, tmp_rootfs: &Utf8Path) -> Result<String> {
        anyhow::bail!(
            "assemble_commit is driven by crate::assembler::assemble, not the resolver directly: {tmp_rootfs}"
        )
    }

    /// The sha256 digest a local RPM must match if pinned by an
    /// `overrides.replace-local`/`packages_local` entry.
    pub fn verify_local_header_sha256(path: &Utf8Path, expected: &HeaderSha256) -> Result<()> {
        let f = std::fs::File::open(path).with_context(|| format!("Opening {path}"))?;
        let parsed = crate::importer::parse_rpm(f)?;
        if &parsed.header_sha256 != expected {
            return Err(anyhow::anyhow!(
                "{path}: header sha256 {} does not match expected {expected}",
                parsed.header_sha256
            ));
        }
        Ok(())
    }
}
