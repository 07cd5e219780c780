//! The sysroot upgrader (§4.6): a state machine driving a single `deploy`
//! transaction from an origin edit through to a written deployment.
//!
//! This absorbs the role the teacher's `deploy.rs` played for container
//! images, but targets ostree base commits plus RPM layering instead of
//! pulling an OCI image.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use ostree_ext::glib;
use ostree_ext::gio;
use ostree_ext::ostree::{self, Deployment};
use ostree_ext::sysroot::SysrootLock;

use crate::assembler::{self, AssembleInput, RemovedPackage};
use crate::error::EngineError;
use crate::importer::CacheCommit;
use crate::origin::{nevra_pkgname, Origin, OverrideEntry};
use crate::postprocess::PostprocessOpts;
use crate::resolver::{InstallSpec, Resolver};

/// How the assembled tree differs from a pure ostree base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayeringType {
    /// No client-side computation: a pure ostree deployment.
    None,
    /// Only local RPMs / overrides, no repo metadata download.
    Local,
    /// Packages resolved against `/etc/yum.repos.d`-style repos.
    RpmmdRepos,
}

/// Flags controlling a single upgrade transaction, mirroring the daemon
/// request option vocabulary in §6.
#[derive(Debug, Clone, Default)]
pub struct UpgradeFlags {
    /// Don't error if the new base is older than the current deployment.
    pub allow_downgrade: bool,
    /// No network; use local rpm-md cache and refs only.
    pub cache_only: bool,
    /// Stop after import, do not assemble.
    pub download_only: bool,
    /// Reuse the base csum from the merge deployment; skip PULL_BASE.
    pub no_pull_base: bool,
    /// Persist the deployment in `/run` and finalize on shutdown.
    pub stage: bool,
    /// Require an explicit `FinalizeDeployment` request to finalize a staged deployment.
    pub lock_finalization: bool,
    /// Compute and print the transaction without writing.
    pub dry_run: bool,
}

/// The state machine's current phase, exposed for progress reporting (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Validating flags, opening the sysroot and picking a merge deployment.
    Init,
    /// Origin edits applied; option conflicts checked.
    OriginResolved,
    /// Resolving and pulling the new base commit.
    PullBase,
    /// Deciding the layering type.
    PrepLayering,
    /// Downloading/importing packages via the resolver.
    ImportPkgs,
    /// Running the assembler.
    Assemble,
    /// Writing the new deployment.
    Deploy,
    /// Post-deploy bookkeeping (auto-update descriptor, reboot).
    Final,
    /// A terminal error state.
    Error,
    /// Cancelled before DEPLOY.
    Cancelled,
}

/// Pure decision: what kind of client-side computation the staged origin
/// requires, from none at all to a full rpm-md resolve.
fn decide_layering_type(origin: &Origin) -> LayeringType {
    let has_layering = !origin.packages.is_empty()
        || !origin.packages_local.is_empty()
        || !origin.overrides_remove.is_empty()
        || !origin.overrides_replace_local.is_empty();
    if !has_layering {
        LayeringType::None
    } else if origin.packages.is_empty() && origin.overrides_remove.is_empty() {
        LayeringType::Local
    } else {
        LayeringType::RpmmdRepos
    }
}

/// Drives a single upgrade transaction against one stateroot.
#[derive(Debug)]
pub struct Upgrader {
    osname: String,
    flags: UpgradeFlags,
    phase: Phase,
    merge_deployment: Option<Deployment>,
    origin: Origin,
    base_commit: String,
    changed: bool,
    layering_type: LayeringType,
}

impl Upgrader {
    /// INIT: open the sysroot's merge deployment for `osname` (explicit,
    /// else booted), and load its origin.
    #[context("Initializing upgrader")]
    pub fn new(sysroot: &SysrootLock, osname: Option<&str>, flags: UpgradeFlags) -> Result<Self> {
        let merge_deployment = sysroot
            .merge_deployment(osname)
            .ok_or(EngineError::NoBootedDeployment)?;
        let osname = merge_deployment.osname().to_string();
        let origin_keyfile = merge_deployment
            .origin()
            .ok_or_else(|| anyhow::anyhow!("Deployment has no origin"))?;
        let (origin_data, origin_len) = origin_keyfile.to_data();
        let origin = Origin::load(&origin_data.as_bytes()[..origin_len as usize])?;
        let base_commit = merge_deployment.csum().to_string();
        Ok(Self {
            osname,
            flags,
            phase: Phase::Init,
            merge_deployment: Some(merge_deployment),
            origin,
            base_commit,
            changed: false,
            layering_type: LayeringType::None,
        })
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The origin as currently staged for this transaction; mutate it via
    /// `origin_mut` before calling [`Self::pull_base`].
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Mutable access to the staged origin, for applying requested edits.
    /// ORIGIN_RESOLVED: reject conflicting option combinations up front.
    pub fn origin_mut(&mut self) -> Result<&mut Origin> {
        if self.flags.no_pull_base && self.origin.override_commit.is_none() {
            // no-pull-base with no pinned revision is fine; only a conflicting
            // *refspec change* is rejected, checked in pull_base().
        }
        self.phase = Phase::OriginResolved;
        Ok(&mut self.origin)
    }

    /// PULL_BASE: resolve the origin's refspec to a commit (skipped under
    /// `NoPullBase`), compute `changed`.
    #[context("Resolving base commit")]
    pub fn pull_base(&mut self, resolved_commit: Option<&str>) -> Result<()> {
        self.phase = Phase::PullBase;
        if self.flags.no_pull_base {
            self.changed = false;
            return Ok(());
        }
        let new_commit = resolved_commit.ok_or_else(|| {
            anyhow::anyhow!("pull_base requires a resolved commit unless no_pull_base is set")
        })?;
        self.changed = new_commit != self.base_commit;
        self.base_commit = new_commit.to_string();
        Ok(())
    }

    /// PREP_LAYERING: decide the layering type from the staged origin.
    pub fn prep_layering(&mut self) -> LayeringType {
        self.phase = Phase::PrepLayering;
        self.layering_type = decide_layering_type(&self.origin);
        self.layering_type
    }

    /// True when PREP_LAYERING found nothing to do and the base is unchanged:
    /// the transaction should skip straight to a no-op FINAL.
    pub fn is_noop(&self) -> bool {
        self.layering_type == LayeringType::None && !self.changed
    }

    /// IMPORT_PKGS + ASSEMBLE: resolve, download, import, and assemble the
    /// layered commit. Returns the commit to deploy.
    #[context("Importing and assembling packages")]
    pub fn import_and_assemble(
        &mut self,
        resolver: &mut Resolver,
        repo: &ostree::Repo,
        postprocess_opts: &PostprocessOpts,
    ) -> Result<String> {
        self.phase = Phase::ImportPkgs;
        if self.layering_type == LayeringType::None {
            self.phase = Phase::Assemble;
            return Ok(self.base_commit.clone());
        }

        let local_packages = self
            .origin
            .packages_local
            .keys()
            .chain(self.origin.overrides_replace_local.keys())
            .map(|nevra| resolver.local_package_path(nevra))
            .collect();

        let mut overrides = Vec::new();
        overrides.extend(self.origin.overrides_remove.iter().cloned().map(OverrideEntry::Remove));
        overrides.extend(self.origin.overrides_replace_local.iter().map(|(nevra, sha256)| {
            OverrideEntry::ReplaceLocal {
                nevra: nevra.clone(),
                sha256: sha256.clone(),
            }
        }));

        let spec = InstallSpec {
            packages_requested: self.origin.packages.clone(),
            local_packages,
            overrides,
            allow_inactive: false,
        };
        let install = resolver.prepare_install(&spec)?;
        if self.flags.download_only {
            resolver.download(&install)?;
            return Ok(self.base_commit.clone());
        }
        resolver.download(&install)?;
        let layered: Vec<CacheCommit> = resolver.import(repo, &install)?;

        // Every base package that's being dropped (by a plain removal, or superseded
        // by a local replacement) needs its own cache commit to enumerate which files
        // to strip from the checkout; that commit was written when this package was
        // first layered into the base, at assembly time, under its own NEVRA branch.
        let removed_names = self
            .origin
            .overrides_remove
            .iter()
            .cloned()
            .chain(self.origin.overrides_replace_local.keys().map(|n| nevra_pkgname(n)));
        let mut removed = Vec::new();
        for name in removed_names {
            let base_nevra = resolver
                .find_installed_nevra(&name)?
                .ok_or_else(|| anyhow::anyhow!("{name} is not installed in the base"))?;
            let branch = crate::importer::cache_branch(&base_nevra);
            let cache_commit = repo
                .resolve_rev(&branch, true)?
                .ok_or_else(|| {
                    anyhow::anyhow!("No cache commit for base package {base_nevra} ({branch})")
                })?
                .to_string();
            removed.push(RemovedPackage {
                nevra: base_nevra,
                cache_commit,
            });
        }

        let mut inputhash_nevras = install.to_download.clone();
        inputhash_nevras.extend(self.origin.packages_local.keys().cloned());
        inputhash_nevras.extend(self.origin.overrides_replace_local.keys().cloned());

        self.phase = Phase::Assemble;
        let input = AssembleInput {
            base_commit: self.base_commit.clone(),
            origin: self.origin.clone(),
            layered,
            removed,
            inputhash_nevras,
            treefile_bytes: Vec::new(),
            postprocess_opts: postprocess_opts.clone(),
        };
        assembler::assemble(repo, &input)
    }

    /// DEPLOY: hand the assembled (or plain base) commit to the sysroot's
    /// deployment writer, unioning kernel args.
    #[context("Deploying")]
    pub fn deploy(
        &mut self,
        sysroot: &SysrootLock,
        commit: &str,
        kargs: &[String],
    ) -> Result<Deployment> {
        self.phase = Phase::Deploy;
        if self.flags.dry_run {
            anyhow::bail!("dry_run set: not deploying");
        }
        let origin_keyfile = {
            let bytes = self.origin.serialize()?;
            let text = std::str::from_utf8(&bytes).context("Origin keyfile is not valid UTF-8")?;
            let kf = glib::KeyFile::new();
            kf.load_from_data(text, glib::KeyFileFlags::NONE)?;
            kf
        };
        let cancellable = gio::Cancellable::NONE;
        let kargs_refs: Vec<&str> = kargs.iter().map(String::as_str).collect();
        let new_deployment = if self.flags.stage {
            sysroot.stage_tree_with_options(
                Some(&self.osname),
                commit,
                Some(&origin_keyfile),
                self.merge_deployment.as_ref(),
                &Default::default(),
                cancellable,
            )?
        } else {
            let new_deployment = sysroot.deploy_tree(
                Some(&self.osname),
                commit,
                Some(&origin_keyfile),
                self.merge_deployment.as_ref(),
                &kargs_refs,
                cancellable,
            )?;
            let flags = ostree::SysrootSimpleWriteDeploymentFlags::NONE;
            sysroot.simple_write_deployment(
                Some(&self.osname),
                &new_deployment,
                self.merge_deployment.as_ref(),
                flags,
                cancellable,
            )?;
            new_deployment
        };
        self.phase = Phase::Final;
        Ok(new_deployment)
    }

    /// A convenience helper computing the union/delete/replace kargs algebra
    /// against the merge deployment's current args.
    pub fn compute_kargs(
        &self,
        append: &[String],
        delete: &[String],
        replace: &[(String, String)],
    ) -> Result<Vec<String>, crate::kargs::KargsError> {
        let current: Vec<String> = self
            .merge_deployment
            .as_ref()
            .and_then(|d| d.bootconfig())
            .and_then(|bc| ostree::BootconfigParser::get(&bc, "options"))
            .map(|o| o.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();
        crate::kargs::compute_kargs_diff(&current, append, delete, replace, false)
    }

    /// Cancel the transaction if it hasn't reached DEPLOY yet.
    pub fn cancel(&mut self) -> Result<()> {
        if self.phase == Phase::Deploy || self.phase == Phase::Final {
            anyhow::bail!("Cannot cancel after the deployment ref has moved");
        }
        self.phase = Phase::Cancelled;
        Err(EngineError::Cancelled.into())
    }
}

/// Rollback: reorder the deployment list so the rollback target is index 0.
/// Rejects when a staged deployment exists.
#[context("Rolling back")]
pub fn rollback(sysroot: &SysrootLock, osname: &str) -> Result<()> {
    if sysroot.staged_deployment().is_some() {
        return Err(EngineError::StagedDeploymentExists.into());
    }
    let cancellable = gio::Cancellable::NONE;
    let deployments = sysroot.deployments();
    let osname_deployments: Vec<_> = deployments
        .iter()
        .filter(|d| d.osname() == osname)
        .cloned()
        .collect();
    let (pending, rollback_target) = match osname_deployments.as_slice() {
        [] => return Err(EngineError::NoRollbackDeployment.into()),
        [only] => (Some(only.clone()), None),
        [pending, rollback, ..] => (Some(pending.clone()), Some(rollback.clone())),
    };
    let rollback_target = rollback_target
        .or_else(|| sysroot.booted_deployment())
        .ok_or(EngineError::NoRollbackDeployment)?;
    let pending = pending.ok_or(EngineError::NoRollbackDeployment)?;

    let mut reordered: Vec<Deployment> = vec![rollback_target.clone()];
    for d in &deployments {
        if !d.equal(&rollback_target) && !d.equal(&pending) {
            reordered.push(d.clone());
        }
    }
    reordered.push(pending);
    sysroot.write_deployments(&reordered, cancellable)?;
    Ok(())
}

/// A cached "update available" descriptor, written at FINAL.
#[derive(Debug, Clone)]
pub struct UpdateAvailableDescriptor {
    /// Path the descriptor is persisted at, relative to the sysroot.
    pub path: Utf8PathBuf,
    /// The commit that became available.
    pub commit: String,
    /// The version string, if the base commit carried one.
    pub version: Option<String>,
}
