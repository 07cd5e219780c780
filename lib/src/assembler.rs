//! The layered-commit assembler (§4.5): takes a base commit and an origin
//! and produces a new commit with the origin's packages, overrides, and
//! initramfs state applied on top.
//!
//! Step 1 of the algorithm (ensuring every requested package has a cache
//! commit) is the resolver's job (§4.3); this module assumes the caller
//! already ran `Resolver::import` and hands in the resulting commits.

use std::os::fd::AsRawFd;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use cap_std_ext::cap_tempfile::TempDir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use openssl::sha::{Sha256, Sha512};
use ostree_ext::{gio, glib, ostree};

use crate::error::EngineError;
use crate::importer::CacheCommit;
use crate::origin::Origin;
use crate::postprocess::{self, PostprocessOpts};

const ROOTPATH: &str = "root";

/// A package cache commit slated for removal, identified by the NEVRA
/// being removed (for commit-metadata bookkeeping) and its own cache
/// branch checksum (to enumerate the files it provided).
#[derive(Debug, Clone)]
pub struct RemovedPackage {
    /// The NEVRA of the package being removed.
    pub nevra: String,
    /// The checksum of that package's own cache commit, used to enumerate its files.
    pub cache_commit: String,
}

/// Everything the assembler needs beyond the base commit and the origin.
#[derive(Debug, Clone)]
pub struct AssembleInput {
    /// The base commit to assemble atop.
    pub base_commit: String,
    /// The origin driving this assembly.
    pub origin: Origin,
    /// Cache commits for every layered or locally-replaced package, already imported.
    pub layered: Vec<CacheCommit>,
    /// Packages being removed via `overrides.remove`.
    pub removed: Vec<RemovedPackage>,
    /// The sorted NEVRA list folded into `inputhash`.
    pub inputhash_nevras: Vec<String>,
    /// The treefile bytes folded into `inputhash` (empty for a plain client-side layering).
    pub treefile_bytes: Vec<u8>,
    /// Postprocessing knobs forwarded to §4.4 stages 2-5/7-8 and the conditional stage 6.
    pub postprocess_opts: PostprocessOpts,
}

/// Run the assembler, returning the checksum of the new commit (or the
/// base commit unchanged, per the no-op invariant).
#[context("Assembling layered commit")]
pub fn assemble(repo: &ostree::Repo, input: &AssembleInput) -> Result<String> {
    let no_layering_change = input.layered.is_empty() && input.removed.is_empty();
    let no_initramfs_change =
        !input.origin.regenerate_initramfs && input.origin.initramfs_etc.is_empty();
    if no_layering_change && no_initramfs_change {
        return Ok(input.base_commit.clone());
    }

    let cancellable = gio::Cancellable::NONE;
    let repodir = Dir::reopen_dir(&repo.dfd_borrow())?;
    let repo_tmp = repodir.open_dir("tmp")?;
    let td = TempDir::new_in(&repo_tmp).context("Creating scratch checkout dir")?;

    let devino = ostree::RepoDevInoCache::new();
    let checkout_mode = if repo.mode() == ostree::RepoMode::Bare {
        ostree::RepoCheckoutMode::None
    } else {
        ostree::RepoCheckoutMode::User
    };
    let checkout_opts = ostree::RepoCheckoutAtOptions {
        mode: checkout_mode,
        overwrite_mode: ostree::RepoCheckoutOverwriteMode::UnionFiles,
        devino_to_csum_cache: Some(devino.clone()),
        no_copy_fallback: true,
        force_copy_zerosized: true,
        ..Default::default()
    };
    repo.checkout_at(
        Some(&checkout_opts),
        td.as_raw_fd(),
        ROOTPATH,
        &input.base_commit,
        cancellable,
    )
    .context("Checking out base commit")?;

    let checkout = td.open_dir(ROOTPATH).context("Opening checkout")?;
    for removed in &input.removed {
        remove_package_files(repo, &repo_tmp, &checkout, removed, checkout_mode, cancellable)?;
    }

    for pkg in &input.layered {
        let res = repo.checkout_at(
            Some(&checkout_opts),
            td.as_raw_fd(),
            ROOTPATH,
            &pkg.checksum,
            cancellable,
        );
        if let Err(e) = res {
            return Err(EngineError::LayerConflict {
                path: e.to_string(),
                a: "existing content".to_string(),
                b: pkg.nevra.clone(),
            }
            .into());
        }
    }

    postprocess::migrate_passwd_group(&checkout, &input.postprocess_opts.keep_in_etc)?;
    postprocess::rewrite_nsswitch(&checkout)?;
    postprocess::relocate_rpmdb(&checkout)?;
    postprocess::synthesize_tmpfiles(&checkout)?;
    if input.origin.regenerate_initramfs || !input.origin.initramfs_etc.is_empty() {
        postprocess::kernel_initramfs(&checkout, &input.postprocess_opts)?;
    }
    postprocess::selinux_prepare(&checkout)?;
    postprocess::cleanup_leftovers(&checkout)?;

    let modifier =
        ostree::RepoCommitModifier::new(ostree::RepoCommitModifierFlags::CONSUME, None);
    modifier.set_devino_cache(&devino);
    if let Some(policy) = crate::selinux::load_policy(&checkout)? {
        modifier.set_sepolicy(Some(&policy));
    }

    let mt = ostree::MutableTree::new();
    repo.write_dfd_to_mtree(
        td.as_raw_fd(),
        ROOTPATH,
        &mt,
        Some(&modifier),
        cancellable,
    )
    .context("Writing merged filesystem to mtree")?;
    let merged_root = repo.write_mtree(&mt, cancellable).context("Writing mtree")?;
    let merged_root = merged_root
        .downcast::<ostree::RepoFile>()
        .map_err(|_| anyhow::anyhow!("write_mtree did not return a RepoFile"))?;

    let state_sha512 = {
        let mut h = Sha512::new();
        h.update(&input.origin.serialize()?);
        hex::encode(h.finish())
    };
    let inputhash = {
        let mut nevras = input.inputhash_nevras.clone();
        nevras.sort();
        let mut h = Sha256::new();
        h.update(nevras.join("\n").as_bytes());
        h.update(&input.treefile_bytes);
        hex::encode(h.finish())
    };

    let packages: Vec<String> = input.origin.packages.iter().cloned().collect();
    let layers: Vec<String> = input.layered.iter().map(|c| c.checksum.clone()).collect();
    let removed_base_pkgs: Vec<String> = input.removed.iter().map(|r| r.nevra.clone()).collect();
    let replaced_base_pkgs: Vec<String> =
        input.origin.overrides_replace_local.keys().cloned().collect();
    let rpmdb_pkglist: Vec<String> = {
        let mut v = input.inputhash_nevras.clone();
        v.sort();
        v
    };

    let mut metadata = glib::VariantDict::new(None);
    metadata.insert("rpmostree.state-sha512", &state_sha512);
    metadata.insert("rpmostree.inputhash", &inputhash);
    metadata.insert("rpmostree.clientlayer", &true);
    metadata.insert("rpmostree.packages", &packages);
    metadata.insert("rpmostree.layers", &layers);
    metadata.insert("rpmostree.removed_base_pkgs", &removed_base_pkgs);
    metadata.insert("rpmostree.replaced_base_pkgs", &replaced_base_pkgs);
    metadata.insert("rpmostree.rpmdb.pkglist", &rpmdb_pkglist);
    let metadata = metadata.end();

    let (commit, _, _) = repo
        .write_commit_with_time(
            Some(&input.base_commit),
            None,
            None,
            Some(&metadata),
            &merged_root,
            chrono::Utc::now().timestamp() as u64,
            cancellable,
        )
        .context("Writing assembled commit")?;
    Ok(commit.to_hex())
}

fn remove_package_files(
    repo: &ostree::Repo,
    scratch_parent: &Dir,
    checkout: &Dir,
    removed: &RemovedPackage,
    checkout_mode: ostree::RepoCheckoutMode,
    cancellable: Option<&gio::Cancellable>,
) -> Result<()> {
    let scratch = TempDir::new_in(scratch_parent)
        .with_context(|| format!("Creating scratch dir for {}", removed.nevra))?;
    let opts = ostree::RepoCheckoutAtOptions {
        mode: checkout_mode,
        overwrite_mode: ostree::RepoCheckoutOverwriteMode::UnionFiles,
        no_copy_fallback: true,
        force_copy_zerosized: true,
        ..Default::default()
    };
    repo.checkout_at(
        Some(&opts),
        scratch.as_raw_fd(),
        ROOTPATH,
        &removed.cache_commit,
        cancellable,
    )
    .with_context(|| format!("Checking out {} for removal", removed.nevra))?;
    let pkgroot = scratch.open_dir(ROOTPATH)?;
    let mut paths = Vec::new();
    collect_paths(&pkgroot, Utf8Path::new(""), &mut paths)?;
    for path in paths {
        checkout.remove_file_optional(path.as_std_path())?;
    }
    Ok(())
}

fn collect_paths(dir: &Dir, prefix: &Utf8Path, out: &mut Vec<Utf8PathBuf>) -> Result<()> {
    for ent in dir.entries_utf8()? {
        let ent = ent?;
        let name = ent.file_name()?;
        let childpath = prefix.join(&name);
        let ty = ent.file_type()?;
        if ty.is_dir() {
            let child = ent.open_dir()?;
            collect_paths(child.as_cap_std(), &childpath, out)?;
        } else {
            out.push(childpath);
        }
    }
    Ok(())
}
