//! # rpm-ostree CLI
//!
//! Command line tool driving the deployment transaction engine: request a
//! rebase/upgrade/install/uninstall/override/kargs/initramfs change, hand it
//! to the [`crate::upgrader::Upgrader`] state machine, and deploy the result.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use fn_error_context::context;
use ostree_ext::gio;
use ostree_ext::ostree;
use ostree_ext::sysroot::SysrootLock;
use std::ffi::OsString;

use crate::error::EngineError;
use crate::origin::{Origin, OverrideEntry, OverrideKind};
use crate::postprocess::PostprocessOpts;
use crate::refspec::Refspec;
use crate::resolver::Resolver;
use crate::task::Task;
use crate::upgrader::{UpgradeFlags, Upgrader};

include!(concat!(env!("OUT_DIR"), "/version.rs"));

/// Persisted state layout (spec §6): the resolver's scratch install root,
/// package-cache source root, and `.repo` config directory.
const CACHE_ROOT: &str = "/var/cache/rpm-ostree";
const REPOS_DIR: &str = "/etc/yum.repos.d";

fn install_root() -> Utf8PathBuf {
    Utf8PathBuf::from(CACHE_ROOT).join("installroot")
}

fn source_root() -> Utf8PathBuf {
    Utf8PathBuf::from(CACHE_ROOT).join("pkgcache")
}

/// Perform an upgrade: re-resolve the current refspec and deploy any change.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct UpgradeOpts {
    /// Don't display progress.
    #[clap(long)]
    pub(crate) quiet: bool,
    /// Check if an update is available without applying it.
    #[clap(long, conflicts_with = "apply")]
    pub(crate) check: bool,
    /// Don't error if the new base is older than the current deployment.
    #[clap(long)]
    pub(crate) allow_downgrade: bool,
    /// No network; use local rpm-md cache and refs only.
    #[clap(long, conflicts_with = "download_only")]
    pub(crate) cache_only: bool,
    /// Stop after import, do not assemble.
    #[clap(long, conflicts_with = "cache_only")]
    pub(crate) download_only: bool,
    /// Restart or reboot into the new deployment if one was produced.
    #[clap(long, conflicts_with = "check")]
    pub(crate) apply: bool,
}

/// Change the base refspec this stateroot tracks.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct RebaseOpts {
    /// The new refspec, e.g. `fedora:fedora/39/x86_64/silverblue`.
    pub(crate) refspec: String,
    /// Do not delete the previous remote ref.
    #[clap(long)]
    pub(crate) skip_purge: bool,
    /// No network; use local rpm-md cache and refs only.
    #[clap(long)]
    pub(crate) cache_only: bool,
    /// Initiate a reboot after success.
    #[clap(long)]
    pub(crate) reboot: bool,
}

/// Layer one or more packages.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct InstallOpts {
    /// Package names to resolve from the enabled repos.
    pub(crate) packages: Vec<String>,
    /// Local RPM files (`nevra:sha256`) to layer verbatim.
    #[clap(long = "local-pkg")]
    pub(crate) local_packages: Vec<String>,
    /// Don't error if a requested package is already layered.
    #[clap(long)]
    pub(crate) idempotent: bool,
    /// Initiate a reboot after success.
    #[clap(long)]
    pub(crate) reboot: bool,
}

/// Remove one or more layered packages.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct UninstallOpts {
    /// Package names to stop layering.
    pub(crate) packages: Vec<String>,
    /// Don't error if a package isn't currently layered.
    #[clap(long)]
    pub(crate) idempotent: bool,
    /// Initiate a reboot after success.
    #[clap(long)]
    pub(crate) reboot: bool,
}

/// Override base packages: remove them, or replace with a local RPM.
#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum OverrideOpts {
    /// Replace a base package with a local RPM (`nevra:sha256` pairs).
    Replace {
        /// `NEVRA:sha256` pairs identifying the replacement RPMs.
        #[clap(long = "local-pkg", required = true)]
        packages_local: Vec<String>,
    },
    /// Remove base packages entirely.
    Remove {
        /// Base package names to remove.
        #[clap(required = true)]
        packages: Vec<String>,
    },
    /// Clear overrides, by name or `--all`.
    Reset {
        /// Package names to clear overrides for.
        packages: Vec<String>,
        /// Clear every override instead of just the named packages.
        #[clap(long)]
        all: bool,
    },
}

/// Edit the kernel command line for the next deployment.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct KargsOpts {
    /// Arguments to append.
    #[clap(long = "append")]
    pub(crate) append: Vec<String>,
    /// Arguments to delete.
    #[clap(long = "delete")]
    pub(crate) delete: Vec<String>,
    /// `OLD=NEW` replacement pairs.
    #[clap(long = "replace")]
    pub(crate) replace: Vec<String>,
    /// Don't error when a delete target is already absent.
    #[clap(long)]
    pub(crate) delete_if_present: bool,
    /// Initiate a reboot after success.
    #[clap(long)]
    pub(crate) reboot: bool,
}

/// Toggle or configure initramfs regeneration.
#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum InitramfsOpts {
    /// Turn regeneration on or off, optionally replacing its dracut args.
    State {
        /// Enable initramfs regeneration.
        #[clap(long, conflicts_with = "disable")]
        enable: bool,
        /// Disable initramfs regeneration.
        #[clap(long, conflicts_with = "enable")]
        disable: bool,
        /// Extra dracut arguments, replacing any previously set.
        #[clap(long = "arg")]
        args: Vec<String>,
    },
    /// Track or untrack `/etc` paths baked into the initramfs.
    Etc {
        /// Paths (relative to `/etc`) to start tracking.
        #[clap(long = "track")]
        track: Vec<Utf8PathBuf>,
        /// Paths to stop tracking.
        #[clap(long = "untrack")]
        untrack: Vec<Utf8PathBuf>,
        /// Stop tracking every path.
        #[clap(long)]
        untrack_all: bool,
    },
}

/// Remove old deployments and/or cached package metadata.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct CleanupOpts {
    /// Remove the non-booted, non-rollback ("pending") deployment.
    #[clap(long)]
    pub(crate) pending: bool,
    /// Remove the rollback deployment.
    #[clap(long)]
    pub(crate) rollback: bool,
    /// Remove cached rpm-md/package data.
    #[clap(long)]
    pub(crate) repomd: bool,
}

/// Refresh rpm-md metadata for all configured repos.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct RefreshMdOpts {
    /// Refresh even if the cache already looks current.
    #[clap(long)]
    pub(crate) force: bool,
}

/// Swap the rollback and pending deployments.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct RollbackOpts {
    /// Initiate a reboot after success.
    #[clap(long)]
    pub(crate) reboot: bool,
}

/// Display status.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct StatusOpts {
    /// Output in JSON format.
    #[clap(long)]
    pub(crate) json: bool,
    /// Only display status for the booted deployment.
    #[clap(long)]
    pub(crate) booted: bool,
}

/// Trigger finalization of a staged deployment locked via `--lock-finalization`.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct FinalizeDeploymentOpts {}

/// Enable or disable a configured yum/dnf repo.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct ModifyYumRepoOpts {
    /// The repo id, matching a `[section]` in a `.repo` file under `/etc/yum.repos.d`.
    pub(crate) id: String,
    #[clap(long, conflicts_with = "disable")]
    pub(crate) enable: bool,
    #[clap(long, conflicts_with = "enable")]
    pub(crate) disable: bool,
}

/// Server-side compose operations; not used on deployed clients.
#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum ComposeOpts {
    /// Compose a treefile into a commit.
    Tree {
        /// Path to the treefile document (JSON or YAML).
        treefile: Utf8PathBuf,
        /// Path to the ostree repo to commit into.
        #[clap(long)]
        repo: Utf8PathBuf,
        /// Directory of `.repo` files the treefile's `repos` may enable.
        #[clap(long, default_value = REPOS_DIR)]
        repos_dir: Utf8PathBuf,
        /// Force a new commit even if the resolved inputhash is unchanged.
        #[clap(long)]
        force_nocache: bool,
        /// Bump this file's mtime iff the run produced a new commit.
        #[clap(long)]
        touch_if_changed: Option<Utf8PathBuf>,
    },
}

/// rpm-ostree: a hybrid image/package deployment transaction engine.
///
/// Layers RPMs onto an immutable ostree base, and atomically assembles,
/// deploys, and rolls back the result as a single bootable commit.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "rpm-ostree")]
#[clap(rename_all = "kebab-case")]
#[clap(version, long_version = CLAP_LONG_VERSION)]
#[allow(clippy::large_enum_variant)]
pub(crate) enum Opt {
    /// Download and apply an upgraded base, re-resolving any layered packages.
    Upgrade(UpgradeOpts),
    /// Change the refspec this stateroot tracks.
    Rebase(RebaseOpts),
    /// Layer one or more packages onto the next deployment.
    Install(InstallOpts),
    /// Remove one or more layered packages.
    Uninstall(UninstallOpts),
    /// Override base packages.
    #[clap(subcommand)]
    Override(OverrideOpts),
    /// Edit the kernel command line.
    Kargs(KargsOpts),
    /// Toggle or configure initramfs regeneration.
    #[clap(subcommand)]
    Initramfs(InitramfsOpts),
    /// Remove old deployments and/or cached metadata.
    Cleanup(CleanupOpts),
    /// Refresh rpm-md metadata.
    RefreshMd(RefreshMdOpts),
    /// Change the bootloader entry ordering.
    Rollback(RollbackOpts),
    /// Display status.
    Status(StatusOpts),
    /// Finalize a deployment staged with `--lock-finalization`.
    FinalizeDeployment(FinalizeDeploymentOpts),
    /// Enable or disable a configured repo.
    ModifyYumRepo(ModifyYumRepoOpts),
    /// Server-side compose operations.
    #[clap(subcommand)]
    Compose(ComposeOpts),
}

/// Ensure we've entered a mount namespace, so that we can remount
/// `/sysroot` read-write.
#[context("Ensuring mountns")]
pub(crate) async fn ensure_self_unshared_mount_namespace() -> Result<()> {
    let uid = rustix::process::getuid();
    if !uid.is_root() {
        tracing::debug!("Not root, assuming no need to unshare");
        return Ok(());
    }
    let recurse_env = "_rpmostree_unshared";
    let ns_pid1 = std::fs::read_link("/proc/1/ns/mnt").context("Reading /proc/1/ns/mnt")?;
    let ns_self = std::fs::read_link("/proc/self/ns/mnt").context("Reading /proc/self/ns/mnt")?;
    if ns_pid1 != ns_self {
        tracing::debug!("Already in a mount namespace");
        return Ok(());
    }
    if std::env::var_os(recurse_env).is_some() {
        let am_pid1 = rustix::process::getpid().is_init();
        if am_pid1 {
            tracing::debug!("We are pid 1");
            return Ok(());
        } else {
            anyhow::bail!("Failed to unshare mount namespace");
        }
    }
    crate::reexec::reexec_with_guardenv(recurse_env)
}

/// Acquire a locked sysroot.
#[context("Acquiring sysroot")]
pub(crate) async fn get_locked_sysroot() -> Result<SysrootLock> {
    let sysroot = ostree::Sysroot::new_default();
    sysroot.set_mount_namespace_in_use();
    let sysroot = SysrootLock::new_from_sysroot(&sysroot).await?;
    sysroot.load(gio::Cancellable::NONE)?;
    Ok(sysroot)
}

#[context("Querying root privilege")]
pub(crate) fn require_root() -> Result<()> {
    let uid = rustix::process::getuid();
    if !uid.is_root() {
        anyhow::bail!("This command requires root privileges");
    }
    if !rustix::thread::capability_is_in_bounding_set(rustix::thread::Capability::SystemAdmin)? {
        anyhow::bail!("This command requires full root privileges (CAP_SYS_ADMIN)");
    }
    tracing::trace!("Verified uid 0 with CAP_SYS_ADMIN");
    Ok(())
}

/// A few process changes that need to be made for writing.
#[context("Preparing for write")]
pub(crate) async fn prepare_for_write() -> Result<()> {
    crate::cli::require_root()?;
    ensure_self_unshared_mount_namespace().await?;
    if crate::selinux::is_selinux_enabled() {
        tracing::trace!("SELinux is enabled");
    }
    Ok(())
}

/// Resolve `refspec` to a commit checksum, pulling it first unless
/// `cache_only`. Rojig refspecs are out of scope for the object store's pull
/// path; they're resolved by the resolver (§4.3) instead.
#[context("Resolving base commit")]
fn resolve_and_pull_base(repo: &ostree::Repo, refspec: &Refspec, cache_only: bool) -> Result<String> {
    match refspec {
        Refspec::Checksum(csum) => Ok(csum.clone()),
        Refspec::Ostree { remote, refn } => {
            if !cache_only {
                if let Some(remote) = remote {
                    repo.pull(remote, &[refn.as_str()], ostree::RepoPullFlags::NONE, gio::Cancellable::NONE)?;
                }
            }
            let full = match remote {
                Some(r) => format!("{r}:{refn}"),
                None => refn.clone(),
            };
            repo.resolve_rev(&full, false)?
                .map(|s| s.to_string())
                .ok_or_else(|| anyhow::anyhow!("No such ref: {full}"))
        }
        Refspec::Rojig { .. } => {
            anyhow::bail!("rojig refspecs are resolved by the resolver, not the object store")
        }
    }
}

/// Drive a single INIT→...→FINAL transaction (§4.6): open the upgrader,
/// apply `edit` to the staged origin, resolve the base, assemble if needed,
/// and deploy with the kargs diff described by `kargs_edit`.
async fn run_transaction(
    flags: UpgradeFlags,
    new_refspec: Option<Refspec>,
    edit: impl FnOnce(&mut Origin) -> Result<()>,
    kargs_edit: (&[String], &[String], &[(String, String)]),
    reboot: bool,
) -> Result<()> {
    prepare_for_write().await?;
    let sysroot = &get_locked_sysroot().await?;
    let repo = &sysroot.repo();
    let mut upgrader = Upgrader::new(sysroot, None, flags.clone())?;

    {
        let origin = upgrader.origin_mut()?;
        if let Some(refspec) = new_refspec {
            origin.set_rebase(refspec, None, None)?;
        }
        edit(origin)?;
    }

    let resolved = if flags.no_pull_base {
        None
    } else {
        let refspec = upgrader.origin().refspec.clone();
        Some(resolve_and_pull_base(repo, &refspec, flags.cache_only)?)
    };
    upgrader.pull_base(resolved.as_deref())?;
    upgrader.prep_layering();

    if upgrader.is_noop() {
        println!("No change.");
        return Ok(());
    }

    let (append, delete, replace) = kargs_edit;
    let kargs = upgrader
        .compute_kargs(append, delete, replace)
        .map_err(anyhow::Error::from)?;

    std::fs::create_dir_all(install_root()).context("Creating install root")?;
    std::fs::create_dir_all(source_root()).context("Creating source root")?;
    let mut resolver = Resolver::new(install_root(), source_root(), Utf8PathBuf::from(REPOS_DIR));
    let postprocess_opts = PostprocessOpts::default();
    let commit = upgrader.import_and_assemble(&mut resolver, repo, &postprocess_opts)?;

    if flags.download_only {
        println!("Downloaded.");
        return Ok(());
    }
    if flags.dry_run {
        println!("Would deploy: {commit}");
        return Ok(());
    }

    upgrader.deploy(sysroot, &commit, &kargs)?;
    println!("Queued for next boot: {}", upgrader.origin().refspec);

    if reboot {
        crate::reboot::reboot()?;
    }
    Ok(())
}

fn no_kargs_edit() -> (Vec<String>, Vec<String>, Vec<(String, String)>) {
    (Vec::new(), Vec::new(), Vec::new())
}

async fn upgrade(opts: UpgradeOpts) -> Result<()> {
    let flags = UpgradeFlags {
        allow_downgrade: opts.allow_downgrade,
        cache_only: opts.cache_only,
        download_only: opts.download_only,
        dry_run: opts.check,
        ..Default::default()
    };
    let (append, delete, replace) = no_kargs_edit();
    run_transaction(flags, None, |_origin| Ok(()), (&append, &delete, &replace), opts.apply).await
}

async fn rebase(opts: RebaseOpts) -> Result<()> {
    let refspec = Refspec::parse(&opts.refspec)?;
    let flags = UpgradeFlags {
        cache_only: opts.cache_only,
        ..Default::default()
    };
    let (append, delete, replace) = no_kargs_edit();
    if opts.skip_purge {
        tracing::debug!("skip-purge: leaving previous remote ref in place");
    }
    run_transaction(
        flags,
        Some(refspec),
        |_origin| Ok(()),
        (&append, &delete, &replace),
        opts.reboot,
    )
    .await
}

fn parse_nevra_sha(s: &str) -> Result<(String, String)> {
    let (nevra, sha) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("Expected NEVRA:sha256, got {s}"))?;
    Ok((nevra.to_string(), sha.to_string()))
}

async fn install(opts: InstallOpts) -> Result<()> {
    let flags = UpgradeFlags {
        no_pull_base: true,
        ..Default::default()
    };
    let (append, delete, replace) = no_kargs_edit();
    run_transaction(
        flags,
        None,
        move |origin| {
            origin.add_packages(opts.packages.clone(), false, opts.idempotent)?;
            if !opts.local_packages.is_empty() {
                let joined: Vec<String> = opts
                    .local_packages
                    .iter()
                    .map(|s| parse_nevra_sha(s).map(|(n, sha)| format!("{n}:{sha}")))
                    .collect::<Result<_>>()?;
                origin.add_packages(joined, true, opts.idempotent)?;
            }
            Ok(())
        },
        (&append, &delete, &replace),
        opts.reboot,
    )
    .await
}

async fn uninstall(opts: UninstallOpts) -> Result<()> {
    let flags = UpgradeFlags {
        no_pull_base: true,
        ..Default::default()
    };
    let (append, delete, replace) = no_kargs_edit();
    run_transaction(
        flags,
        None,
        move |origin| origin.remove_packages(opts.packages.clone(), opts.idempotent).map(|_| ()),
        (&append, &delete, &replace),
        opts.reboot,
    )
    .await
}

async fn override_cmd(opts: OverrideOpts) -> Result<()> {
    let flags = UpgradeFlags {
        no_pull_base: true,
        ..Default::default()
    };
    let (append, delete, replace) = no_kargs_edit();
    run_transaction(
        flags,
        None,
        move |origin| {
            match opts {
                OverrideOpts::Replace { packages_local } => {
                    let entries = packages_local
                        .iter()
                        .map(|s| {
                            parse_nevra_sha(s).map(|(nevra, sha256)| OverrideEntry::ReplaceLocal { nevra, sha256 })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    origin.add_overrides(entries)?;
                }
                OverrideOpts::Remove { packages } => {
                    origin.add_overrides(packages.into_iter().map(OverrideEntry::Remove))?;
                }
                OverrideOpts::Reset { packages, all } => {
                    if all {
                        origin.remove_all_overrides()?;
                    } else {
                        for p in packages {
                            origin.remove_override(&p, OverrideKind::Remove);
                            origin.remove_override(&p, OverrideKind::ReplaceLocal);
                        }
                    }
                }
            }
            Ok(())
        },
        (&append, &delete, &replace),
        false,
    )
    .await
}

fn parse_replace_karg(s: &str) -> Result<(String, String)> {
    s.split_once('=')
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .ok_or_else(|| anyhow::anyhow!("Expected OLD=NEW, got {s}"))
}

async fn kargs(opts: KargsOpts) -> Result<()> {
    let flags = UpgradeFlags {
        no_pull_base: true,
        ..Default::default()
    };
    let replace: Vec<(String, String)> = opts.replace.iter().map(|s| parse_replace_karg(s)).collect::<Result<_>>()?;
    run_transaction(
        flags,
        None,
        |_origin| Ok(()),
        (&opts.append, &opts.delete, &replace),
        opts.reboot,
    )
    .await
}

async fn initramfs(opts: InitramfsOpts) -> Result<()> {
    let flags = UpgradeFlags {
        no_pull_base: true,
        ..Default::default()
    };
    let (append, delete, replace) = no_kargs_edit();
    run_transaction(
        flags,
        None,
        move |origin| {
            match opts {
                InitramfsOpts::State { enable, disable, args } => {
                    if enable {
                        origin.set_regenerate_initramfs(true, (!args.is_empty()).then_some(args));
                    } else if disable {
                        origin.set_regenerate_initramfs(false, None);
                    }
                }
                InitramfsOpts::Etc { track, untrack, untrack_all } => {
                    origin.track_initramfs_etc(track)?;
                    if untrack_all {
                        origin.untrack_initramfs_etc(None);
                    } else if !untrack.is_empty() {
                        origin.untrack_initramfs_etc(Some(untrack));
                    }
                }
            }
            Ok(())
        },
        (&append, &delete, &replace),
        false,
    )
    .await
}

/// Implementation of the `rpm-ostree rollback` CLI command (§4.6).
async fn rollback(opts: RollbackOpts) -> Result<()> {
    prepare_for_write().await?;
    let sysroot = &get_locked_sysroot().await?;
    let osname = sysroot
        .booted_deployment()
        .ok_or(EngineError::NoBootedDeployment)?
        .osname()
        .to_string();
    crate::upgrader::rollback(sysroot, &osname)?;
    if opts.reboot {
        crate::reboot::reboot()?;
    }
    Ok(())
}

/// Prune pending/rollback deployments and/or cached package metadata.
async fn cleanup(opts: CleanupOpts) -> Result<()> {
    prepare_for_write().await?;
    let sysroot = &get_locked_sysroot().await?;
    if opts.pending || opts.rollback {
        let booted = sysroot.booted_deployment();
        let cancellable = gio::Cancellable::NONE;
        let deployments = sysroot.deployments();
        let keep: Vec<_> = deployments
            .iter()
            .filter(|d| {
                let is_booted = booted.as_ref().map(|b| d.equal(b)).unwrap_or(false);
                if is_booted {
                    return true;
                }
                !opts.pending
            })
            .cloned()
            .collect();
        let keep: Vec<_> = if opts.rollback {
            keep.into_iter()
                .filter(|d| booted.as_ref().map(|b| d.equal(b)).unwrap_or(true))
                .collect()
        } else {
            keep
        };
        sysroot.write_deployments(&keep, cancellable)?;
    }
    if opts.repomd {
        let cache = source_root();
        if cache.exists() {
            std::fs::remove_dir_all(&cache).with_context(|| format!("Removing {cache}"))?;
        }
    }
    Ok(())
}

async fn refresh_md(_opts: RefreshMdOpts) -> Result<()> {
    prepare_for_write().await?;
    std::fs::create_dir_all(source_root()).context("Creating source root")?;
    let mut resolver = Resolver::new(install_root(), source_root(), Utf8PathBuf::from(REPOS_DIR));
    let repos: Vec<String> = resolver.list_repos()?.into_iter().collect();
    resolver.download_metadata(&repos)
}

async fn status_cmd(opts: StatusOpts) -> Result<()> {
    super::status::status(opts).await
}

async fn finalize_deployment(_opts: FinalizeDeploymentOpts) -> Result<()> {
    prepare_for_write().await?;
    Task::new("Finalizing staged deployment", "systemctl")
        .args(["start".to_string(), "ostree-finalize-staged.service".to_string()])
        .run()
}

/// Toggle `enabled=` in a configured `.repo` file's section.
async fn modify_yum_repo(opts: ModifyYumRepoOpts) -> Result<()> {
    prepare_for_write().await?;
    let path = Utf8Path::new(REPOS_DIR).join(format!("{}.repo", opts.id));
    let contents = std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
    let mut in_section = false;
    let mut found = false;
    let mut out = String::with_capacity(contents.len());
    for line in contents.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            in_section = name == opts.id;
        }
        if in_section && trimmed.starts_with("enabled") {
            found = true;
            if opts.enable {
                out.push_str("enabled=1");
            } else if opts.disable {
                out.push_str("enabled=0");
            } else {
                out.push_str(line);
            }
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    if !found && (opts.enable || opts.disable) {
        anyhow::bail!("No [{}] section with an enabled= key in {path}", opts.id);
    }
    std::fs::write(&path, out).with_context(|| format!("Writing {path}"))
}

async fn compose_cmd(opts: ComposeOpts) -> Result<()> {
    let ComposeOpts::Tree {
        treefile,
        repo,
        repos_dir,
        force_nocache,
        touch_if_changed,
    } = opts;
    let tf = crate::treefile::Treefile::load(&treefile)?;
    let cancellable = gio::Cancellable::NONE;
    let repo_handle = ostree::Repo::open_at(libc::AT_FDCWD, repo.as_str(), cancellable)
        .with_context(|| format!("Opening repo {repo}"))?;
    let compose_opts = crate::compose::ComposeOpts {
        install_root: install_root(),
        source_root: source_root(),
        repos_dir,
        force_nocache,
        touch_if_changed,
    };
    let outcome = crate::compose::compose(&repo_handle, &tf, &compose_opts)?;
    if outcome.changed {
        println!("Composed: {}", outcome.commit);
    } else {
        println!("No changes to {}", tf.r#ref);
    }
    if let Some(version) = outcome.version {
        println!("Version: {version}");
    }
    Ok(())
}

/// Parse the provided arguments and execute.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let opt = Opt::parse_from(args);
    match opt {
        Opt::Upgrade(opts) => upgrade(opts).await,
        Opt::Rebase(opts) => rebase(opts).await,
        Opt::Install(opts) => install(opts).await,
        Opt::Uninstall(opts) => uninstall(opts).await,
        Opt::Override(opts) => override_cmd(opts).await,
        Opt::Kargs(opts) => kargs(opts).await,
        Opt::Initramfs(opts) => initramfs(opts).await,
        Opt::Cleanup(opts) => cleanup(opts).await,
        Opt::RefreshMd(opts) => refresh_md(opts).await,
        Opt::Rollback(opts) => rollback(opts).await,
        Opt::Status(opts) => status_cmd(opts).await,
        Opt::FinalizeDeployment(opts) => finalize_deployment(opts).await,
        Opt::ModifyYumRepo(opts) => modify_yum_repo(opts).await,
        Opt::Compose(opts) => compose_cmd(opts).await,
    }
}

#[test]
fn test_parse_opts() {
    assert!(matches!(
        Opt::try_parse_from(["rpm-ostree", "status"]),
        Ok(Opt::Status(StatusOpts {
            json: false,
            booted: false
        }))
    ));
}

#[test]
fn test_parse_install() {
    let o = Opt::try_parse_from(["rpm-ostree", "install", "strace", "htop"]).unwrap();
    match o {
        Opt::Install(opts) => assert_eq!(opts.packages, vec!["strace", "htop"]),
        o => panic!("Expected install opts, not {o:?}"),
    }
}

#[test]
fn test_parse_kargs_replace() {
    assert_eq!(
        parse_replace_karg("console=tty0=console=ttyS0").unwrap(),
        ("console".to_string(), "tty0=console=ttyS0".to_string())
    );
    assert!(parse_replace_karg("no-equals-sign").is_err());
}

#[test]
fn test_parse_override_subcommand() {
    let o = Opt::try_parse_from(["rpm-ostree", "override", "remove", "firefox"]).unwrap();
    assert!(matches!(
        o,
        Opt::Override(OverrideOpts::Remove { packages }) if packages == vec!["firefox".to_string()]
    ));
}

#[test]
fn test_parse_rebase() {
    let o = Opt::try_parse_from(["rpm-ostree", "rebase", "fedora:fedora/39/x86_64/silverblue"]).unwrap();
    match o {
        Opt::Rebase(opts) => assert_eq!(opts.refspec, "fedora:fedora/39/x86_64/silverblue"),
        o => panic!("Expected rebase opts, not {o:?}"),
    }
}
