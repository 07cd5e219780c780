//! Kernel argument computation: the `kargs.d` directory-diff used when
//! assembling a new deployment, and the standalone union/delete/replace
//! algebra used by `rpm-ostree kargs` (§4.6).

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use ostree_ext::gio;
use ostree_ext::ostree;
use ostree_ext::ostree::Deployment;
use ostree_ext::ostree::prelude::Cast;
use ostree_ext::ostree::prelude::FileEnumeratorExt;
use ostree_ext::ostree::prelude::FileExt;
use serde::Deserialize;
use thiserror::Error;

/// Errors from [`compute_kargs_diff`], mirroring the three cases the
/// original `rpmostree-kargs-process.c` distinguishes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KargsError {
    /// A malformed karg (embedded whitespace, empty string).
    #[error("Invalid kernel argument: {0}")]
    Invalid(String),
    /// An appended karg is already present and `delete_if_present` wasn't set for it.
    #[error("Kernel argument already exists: {0}")]
    AlreadyExists(String),
    /// A deleted or replaced karg's old value is not present.
    #[error("Kernel argument does not exist: {0}")]
    Nonexistent(String),
}

/// Apply a union/delete/replace edit script to a flat kernel argument list,
/// in the order: deletions, then replacements, then appends.
///
/// - `delete`: exact karg strings to remove. Missing entries are an error
///   unless `delete_if_present` is set.
/// - `replace`: `(old, new)` pairs. `old` must be present; errors otherwise.
/// - `append`: new kargs to add. Already-present entries are an error
///   unless `delete_if_present` is set (append-if-absent semantics).
pub fn compute_kargs_diff(
    old: &[String],
    append: &[String],
    delete: &[String],
    replace: &[(String, String)],
    delete_if_present: bool,
) -> Result<Vec<String>, KargsError> {
    for k in append.iter().chain(delete.iter()) {
        validate_karg(k)?;
    }
    for (o, n) in replace {
        validate_karg(o)?;
        validate_karg(n)?;
    }

    let mut kargs: Vec<String> = old.to_vec();

    for d in delete {
        match kargs.iter().position(|k| k == d) {
            Some(idx) => {
                kargs.remove(idx);
            }
            None if delete_if_present => {}
            None => return Err(KargsError::Nonexistent(d.clone())),
        }
    }

    for (o, n) in replace {
        match kargs.iter().position(|k| k == o) {
            Some(idx) => kargs[idx] = n.clone(),
            None => return Err(KargsError::Nonexistent(o.clone())),
        }
    }

    for a in append {
        if kargs.iter().any(|k| k == a) {
            if !delete_if_present {
                return Err(KargsError::AlreadyExists(a.clone()));
            }
        } else {
            kargs.push(a.clone());
        }
    }

    Ok(kargs)
}

fn validate_karg(k: &str) -> Result<(), KargsError> {
    if k.is_empty() || k.chars().any(char::is_whitespace) {
        return Err(KargsError::Invalid(k.to_string()));
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Config {
    kargs: Vec<String>,
    match_architectures: Option<Vec<String>>,
}

const KARGS_D: &str = "usr/lib/rpm-ostree/kargs.d";

/// Load and parse all `kargs.d` files in the specified root, returning a
/// combined list in filename-sorted order.
fn get_kargs_in_root(d: &Dir, sys_arch: &str) -> Result<Vec<String>> {
    let d = if let Some(d) = d.open_dir_optional(KARGS_D)? {
        d
    } else {
        return Ok(Default::default());
    };
    let mut ret = Vec::new();
    let mut entries = d.entries()?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    for ent in entries {
        let name = ent.file_name();
        let name = name
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid non-UTF8 filename: {name:?}"))?;
        if !matches!(Utf8Path::new(name).extension(), Some("toml")) {
            continue;
        }
        let buf = d.read_to_string(name)?;
        let kargs = parse_kargs_toml(&buf, sys_arch).with_context(|| format!("Parsing {name}"))?;
        ret.extend(kargs)
    }
    Ok(ret)
}

/// Compute the kernel arguments for a new deployment, starting from the
/// booted kargs and applying the diff between the `kargs.d` directories of
/// the booted deployment and the target commit.
pub(crate) fn get_kargs(
    repo: &ostree::Repo,
    booted_deployment: &Deployment,
    target_commit: &str,
) -> Result<Vec<String>> {
    let cancellable = gio::Cancellable::NONE;
    let mut kargs: Vec<String> = vec![];
    let sys_arch = std::env::consts::ARCH;

    if let Some(bootconfig) = ostree::Deployment::bootconfig(booted_deployment) {
        if let Some(options) = ostree::BootconfigParser::get(&bootconfig, "options") {
            kargs.extend(options.split_whitespace().map(str::to_owned));
        }
    };

    let root = &cap_std::fs::Dir::open_ambient_dir("/", cap_std::ambient_authority())?;
    let existing_kargs: Vec<String> = get_kargs_in_root(root, sys_arch)?;

    let (target_tree, _) = repo.read_commit(target_commit, cancellable)?;
    let target_dir = target_tree.resolve_relative_path(KARGS_D);
    let target_dir = target_dir.downcast::<ostree::RepoFile>().expect("downcast");
    if !target_dir.query_exists(cancellable) {
        kargs.extend(existing_kargs);
        return Ok(kargs);
    }

    let mut remote_kargs: Vec<String> = vec![];
    let queryattrs = "standard::name,standard::type";
    let queryflags = gio::FileQueryInfoFlags::NOFOLLOW_SYMLINKS;
    let iter = target_dir.enumerate_children(queryattrs, queryflags, cancellable)?;
    while let Some(info) = iter.next_file(cancellable)? {
        let name = info.name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".toml") {
            continue;
        }
        let child = iter.child(&info);
        let child = child.downcast::<ostree::RepoFile>().expect("downcast");
        child.ensure_resolved()?;
        let checksum = child.checksum();
        let (content, _) = ostree::Repo::load_file(repo, checksum.as_str(), cancellable)?;
        let mut reader = ostree_ext::ostree::prelude::InputStreamExtManual::into_read(
            content.expect("file content"),
        );
        let s = std::io::read_to_string(&mut reader)?;
        let mut parsed = parse_kargs_toml(&s, sys_arch).with_context(|| format!("Parsing {name}"))?;
        remote_kargs.append(&mut parsed);
    }

    let mut added_kargs: Vec<String> = remote_kargs
        .iter()
        .filter(|item| !existing_kargs.contains(item))
        .cloned()
        .collect();
    let removed_kargs: Vec<String> = existing_kargs
        .iter()
        .filter(|item| !remote_kargs.contains(item))
        .cloned()
        .collect();

    tracing::debug!("kargs: added={:?} removed={:?}", &added_kargs, removed_kargs);

    kargs.retain(|x| !removed_kargs.contains(x));
    kargs.append(&mut added_kargs);

    Ok(kargs)
}

/// Parse a `kargs.d` TOML file, returning the resulting kernel arguments.
/// Architecture matching is performed against `sys_arch`.
fn parse_kargs_toml(contents: &str, sys_arch: &str) -> Result<Vec<String>> {
    let de: Config = toml::from_str(contents)?;
    let matched = de
        .match_architectures
        .map(|arches| arches.iter().any(|s| s == sys_arch))
        .unwrap_or(true);
    Ok(if matched { de.kargs } else { Vec::new() })
}
