//! The compose postprocessor (§4.4): an idempotent pipeline of stages that
//! turns a raw, just-installed rootfs into the ostree-convention tree rpm-ostree
//! commits. Shared between the layered-commit assembler (§4.5) and the
//! server-side compose path (§4.8).

use std::collections::BTreeSet;
use std::io::Read;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::{Dir, DirBuilder, MetadataExt};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use ostree_ext::isolation;

use crate::task::Task;

/// Marker whose presence short-circuits the whole pipeline.
const IDEMPOTENCY_MARKER: &str = "usr/lib/tmpfiles.d/rpm-ostree-0-integration.conf";

/// Caller-controlled knobs for the kernel/initramfs stage and policy baking.
#[derive(Debug, Clone)]
pub struct PostprocessOpts {
    /// Extra arguments passed to `dracut`, in addition to `--no-hostonly`.
    pub dracut_args: Vec<String>,
    /// Whether to keep `/etc/machine-id` as an empty file ("compat") or remove it outright.
    pub machineid_compat: bool,
    /// Where to place the renamed kernel/initramfs: `modules` (`/usr/lib/modules/<kver>`)
    /// or `new` (`/usr/lib/ostree-boot`).
    pub boot_location: BootLocation,
    /// Names to keep in `/etc/passwd`/`/etc/group` even though they're also copied to `/usr/lib`.
    pub keep_in_etc: BTreeSet<String>,
}

impl Default for PostprocessOpts {
    fn default() -> Self {
        Self {
            dracut_args: vec!["--no-hostonly".to_string()],
            machineid_compat: true,
            boot_location: BootLocation::Modules,
            keep_in_etc: Default::default(),
        }
    }
}

/// See [`PostprocessOpts::boot_location`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootLocation {
    /// `/usr/lib/modules/<kver>/`.
    Modules,
    /// `/usr/lib/ostree-boot/`.
    New,
}

/// Run the full pipeline on `rootfs`, no-opping if the idempotency marker is present.
#[context("Postprocessing rootfs")]
pub fn postprocess(rootfs: &Dir, opts: &PostprocessOpts) -> Result<()> {
    if rootfs.try_exists(IDEMPOTENCY_MARKER)? {
        tracing::debug!("Postprocessing already applied");
        return Ok(());
    }
    normalize_rootfs(rootfs)?;
    migrate_passwd_group(rootfs, &opts.keep_in_etc)?;
    rewrite_nsswitch(rootfs)?;
    relocate_rpmdb(rootfs)?;
    synthesize_tmpfiles(rootfs)?;
    kernel_initramfs(rootfs, opts)?;
    selinux_prepare(rootfs)?;
    cleanup_leftovers(rootfs)?;
    Ok(())
}

/// Read a relative text file if present, without erroring when it's absent.
fn read_optional(root: &Dir, path: &str) -> Result<Option<String>> {
    if !root.try_exists(path)? {
        return Ok(None);
    }
    Ok(Some(root.read_to_string(path)?))
}

/// Stage 1: rootfs normalization.
#[context("Normalizing rootfs")]
pub fn normalize_rootfs(root: &Dir) -> Result<()> {
    for d in ["dev", "proc", "run", "sys", "var", "sysroot"] {
        root.ensure_dir_with(d, &DirBuilder::new())?;
    }
    let symlinks: &[(&str, &str)] = &[
        ("var/opt", "/opt"),
        ("var/srv", "/srv"),
        ("var/mnt", "/mnt"),
        ("var/roothome", "/root"),
        ("var/home", "/home"),
        ("run/media", "/media"),
        ("sysroot/ostree", "/ostree"),
        ("sysroot/tmp", "/tmp"),
    ];
    for (link, target) in symlinks {
        if root.symlink_metadata(link).is_err() {
            root.symlink(target, link)
                .with_context(|| format!("Creating {link}"))?;
        }
    }
    relocate_etc(root)?;
    Ok(())
}

fn relocate_etc(root: &Dir) -> Result<()> {
    if root.try_exists("usr/etc")? {
        return Ok(()); // already relocated
    }
    if !root.try_exists("etc")? {
        return Ok(());
    }
    root.rename("etc", root, "usr/etc")
        .context("Relocating /etc to /usr/etc")?;
    root.symlink("usr/etc", "etc")
        .context("Creating /etc -> /usr/etc symlink")?;
    Ok(())
}

/// Stage 2: split `/usr/etc/{passwd,group}` into the root-only `/usr/etc`
/// copy and a full `/usr/lib/{passwd,group}` copy.
#[context("Migrating passwd/group")]
pub fn migrate_passwd_group(root: &Dir, keep_in_etc: &BTreeSet<String>) -> Result<()> {
    split_db(root, "usr/etc/passwd", "usr/lib/passwd", keep_in_etc)?;
    split_db(root, "usr/etc/group", "usr/lib/group", keep_in_etc)?;
    Ok(())
}

fn split_db(root: &Dir, etc_path: &str, lib_path: &str, keep_in_etc: &BTreeSet<String>) -> Result<()> {
    let Some(contents) = read_optional(root, etc_path)? else {
        return Ok(());
    };
    let mut etc_lines = Vec::new();
    let mut lib_lines = Vec::new();
    for line in contents.lines() {
        let name = line.split(':').next().unwrap_or_default();
        let keep_etc = name == "root" || keep_in_etc.contains(name);
        if keep_etc {
            etc_lines.push(line);
        }
        lib_lines.push(line);
    }
    let mut etc_out = etc_lines.join("\n");
    if !etc_out.is_empty() {
        etc_out.push('\n');
    }
    root.atomic_write(etc_path, etc_out)?;

    let mut lib_out = read_optional(root, lib_path)?.unwrap_or_default();
    for line in lib_lines {
        if !lib_out.lines().any(|l| l == line) {
            lib_out.push_str(line);
            lib_out.push('\n');
        }
    }
    root.atomic_write(lib_path, lib_out)?;
    Ok(())
}

/// Stage 3: rewrite nsswitch.conf's `passwd`/`group`/`shadow`/`gshadow` lines
/// to add the `altfiles` module, idempotently.
#[context("Rewriting nsswitch.conf")]
pub fn rewrite_nsswitch(root: &Dir) -> Result<()> {
    const PATH: &str = "usr/etc/nsswitch.conf";
    let Some(contents) = read_optional(root, PATH)? else {
        return Ok(());
    };
    let re = regex::Regex::new(r"^(passwd|group|shadow|gshadow):(\s+)files(.*)$").unwrap();
    let mut changed = false;
    let mut out = String::with_capacity(contents.len());
    for line in contents.lines() {
        if let Some(caps) = re.captures(line) {
            let rest = &caps[3];
            if rest.split_whitespace().any(|w| w == "altfiles") {
                out.push_str(line);
            } else {
                changed = true;
                out.push_str(&format!("{}:{}files altfiles{}", &caps[1], &caps[2], rest));
            }
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    if changed {
        root.atomic_write(PATH, out)?;
    }
    Ok(())
}

/// Stage 4: relocate the rpmdb from `/var/lib/rpm` to `/usr/share/rpm`.
#[context("Relocating rpmdb")]
pub fn relocate_rpmdb(root: &Dir) -> Result<()> {
    const NEW: &str = "usr/share/rpm";
    const OLD: &str = "var/lib/rpm";
    if root.try_exists(NEW)? {
        return Ok(());
    }
    if root.try_exists(OLD)? {
        root.ensure_dir_with("usr/share", &DirBuilder::new())?;
        root.rename(OLD, root, NEW).context("Renaming rpmdb")?;
    } else {
        root.ensure_dir_with(NEW, &DirBuilder::new())?;
    }
    if root.symlink_metadata(OLD).is_err() {
        root.symlink("../../usr/share/rpm", OLD)?;
    }
    root.ensure_dir_with("usr/lib/rpm/macros.d", &DirBuilder::new())?;
    root.atomic_write(
        "usr/lib/rpm/macros.d/macros.rpm-ostree",
        "%_dbpath /usr/share/rpm\n",
    )?;
    Ok(())
}

/// Stage 5: synthesize `/usr/lib/tmpfiles.d/rpm-ostree-1-autovar.conf` from
/// `/var`'s directory/symlink structure.
#[context("Synthesizing tmpfiles.d entries")]
pub fn synthesize_tmpfiles(root: &Dir) -> Result<()> {
    let mut lines = Vec::new();
    if let Some(var) = root.open_dir_optional("var")? {
        walk_var(&var, Utf8Path::new("/var"), &mut lines)?;
    }
    let mut out = read_optional(root, "usr/lib/tmpfiles.d/rpm-ostree-1-autovar.conf")?.unwrap_or_default();
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    root.ensure_dir_with("usr/lib/tmpfiles.d", &DirBuilder::new())?;
    root.atomic_write("usr/lib/tmpfiles.d/rpm-ostree-1-autovar.conf", out)?;
    Ok(())
}

fn walk_var(dir: &Dir, abspath: &Utf8Path, out: &mut Vec<String>) -> Result<()> {
    for ent in dir.entries_utf8()? {
        let ent = ent?;
        let name = ent.file_name()?;
        let childabs = abspath.join(&name);
        let ty = ent.file_type()?;
        if ty.is_dir() {
            let meta = ent.metadata()?;
            out.push(format!(
                "d {childabs} 0{:o} {} {} - -",
                meta.mode() & 0o7777,
                meta.uid(),
                meta.gid()
            ));
            let child = ent.open_dir()?;
            walk_var(child.as_cap_std(), &childabs, out)?;
        } else if ty.is_symlink() {
            let target = dir.read_link_contents(&name)?;
            out.push(format!("L {childabs} - - - - {}", target.display()));
        } else {
            tracing::warn!("Skipping non-directory, non-symlink entry in /var: {childabs}");
        }
    }
    Ok(())
}

/// Stage 6: kernel/initramfs regeneration.
#[context("Regenerating kernel/initramfs")]
pub fn kernel_initramfs(root: &Dir, opts: &PostprocessOpts) -> Result<()> {
    let (kver, kernel_path) = find_kernel(root)?;
    let kerneldir = kernel_path.parent().unwrap_or(Utf8Path::new(".")).to_owned();
    for ent in root.open_dir(kerneldir.as_std_path())?.entries()? {
        let ent = ent?;
        if let Some(name) = ent.file_name().to_str() {
            if name.starts_with("initramfs-") {
                root.remove_file(kerneldir.join(name))?;
            }
        }
    }

    run_sandboxed(root, "depmod", &["-a".to_string(), kver.clone()])
        .context("depmod failed")?;

    let initramfs_tmp = Utf8PathBuf::from(format!("initramfs-{kver}.img.tmp"));
    let mut dracut_args = opts.dracut_args.clone();
    dracut_args.extend([
        "--kver".to_string(),
        kver.clone(),
        initramfs_tmp.to_string(),
    ]);
    run_sandboxed(root, "dracut", &dracut_args).context("dracut failed")?;

    let mut kernel_bytes = Vec::new();
    root.open(kernel_path.as_std_path())?
        .read_to_end(&mut kernel_bytes)?;
    let mut initramfs_bytes = Vec::new();
    root.open(initramfs_tmp.as_std_path())?
        .read_to_end(&mut initramfs_bytes)?;
    use openssl::sha::Sha256;
    let mut h = Sha256::new();
    h.update(&kernel_bytes);
    h.update(&initramfs_bytes);
    let digest = hex::encode(h.finish());

    let destdir: Utf8PathBuf = match opts.boot_location {
        BootLocation::Modules => Utf8PathBuf::from(format!("usr/lib/modules/{kver}")),
        BootLocation::New => Utf8PathBuf::from("usr/lib/ostree-boot"),
    };
    root.ensure_dir_with(&destdir, &DirBuilder::new())?;
    let kernel_name = kernel_path.file_name().unwrap_or("vmlinuz");
    root.rename(
        kernel_path.as_std_path(),
        root,
        destdir.join(format!("{kernel_name}-{digest}")).as_std_path(),
    )?;
    root.rename(
        initramfs_tmp.as_std_path(),
        root,
        destdir
            .join(format!("initramfs-{kver}.img-{digest}"))
            .as_std_path(),
    )?;

    if root.try_exists("usr/etc/machine-id")? {
        if opts.machineid_compat {
            root.atomic_write("usr/etc/machine-id", "")?;
        } else {
            root.remove_file("usr/etc/machine-id")?;
        }
    }
    Ok(())
}

/// Run `binary` with `args`, dropping privileges via [`ostree_ext::isolation`] when possible.
fn run_sandboxed(root: &Dir, binary: &str, args: &[String]) -> Result<()> {
    let cmd = isolation::unprivileged_subprocess(binary, isolation::DEFAULT_UNPRIVILEGED_USER);
    Task::new_cmd(format!("Running {binary}"), cmd)
        .root(root)?
        .args(args.iter().cloned())
        .run()
}

fn find_kernel(root: &Dir) -> Result<(String, Utf8PathBuf)> {
    let mut found = Vec::new();
    if let Some(d) = root.open_dir_optional("boot")? {
        for ent in d.entries()? {
            let ent = ent?;
            let name = ent.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(kver) = name.strip_prefix("vmlinuz-") {
                found.push((kver.to_string(), Utf8PathBuf::from(format!("boot/{name}"))));
            } else if name == "vmlinuz" {
                found.push((String::new(), Utf8PathBuf::from("boot/vmlinuz")));
            }
        }
    }
    if let Some(d) = root.open_dir_optional("usr/lib/modules")? {
        for ent in d.entries()? {
            let ent = ent?;
            let name = ent.file_name();
            let Some(kver) = name.to_str() else { continue };
            if d.try_exists(format!("{kver}/vmlinuz"))? {
                found.push((
                    kver.to_string(),
                    Utf8PathBuf::from(format!("usr/lib/modules/{kver}/vmlinuz")),
                ));
            }
        }
    }
    match found.len() {
        1 => Ok(found.pop().unwrap()),
        0 => Err(anyhow::anyhow!("No kernel found in /boot or /usr/lib/modules")),
        n => Err(anyhow::anyhow!("Found {n} candidate kernels, expected exactly one")),
    }
}

/// Stage 7: SELinux policy preparation.
#[context("Preparing SELinux policy")]
pub fn selinux_prepare(root: &Dir) -> Result<()> {
    const OLD: &str = "var/lib/selinux";
    const NEW: &str = "usr/etc/selinux";
    if root.try_exists(OLD)? && !root.try_exists(NEW)? {
        root.rename(OLD, root, NEW)
            .context("Relocating selinux policy store")?;
    }
    if !root.try_exists(NEW)? {
        return Ok(());
    }
    if let Some(policy) = crate::selinux::load_policy(root)? {
        drop(policy);
        run_sandboxed(root, "semodule", &["-nB".to_string()]).context("semodule -nB failed")?;
    }
    rewrite_semanage_storeroot(root)?;
    Ok(())
}

fn rewrite_semanage_storeroot(root: &Dir) -> Result<()> {
    const PATH: &str = "usr/etc/selinux/semanage.conf";
    let Some(contents) = read_optional(root, PATH)? else {
        return Ok(());
    };
    let mut out = String::new();
    let mut found = false;
    for line in contents.lines() {
        if line.trim_start().starts_with("store-root") {
            out.push_str("store-root = /etc/selinux\n");
            found = true;
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    if !found {
        out.push_str("store-root = /etc/selinux\n");
    }
    root.atomic_write(PATH, out)?;
    Ok(())
}

/// Stage 8: remove build-time leftovers (lock files, semanage transaction locks)
/// and write the idempotency marker.
#[context("Cleaning up leftovers")]
pub fn cleanup_leftovers(root: &Dir) -> Result<()> {
    if let Some(d) = root.open_dir_optional("usr/etc/selinux")? {
        for ent in d.entries()? {
            let ent = ent?;
            if !ent.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = ent.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            for lockname in ["semanage.trans.LOCK", "semanage.read.LOCK"] {
                d.remove_file_optional(format!("{name}/{lockname}"))?;
            }
        }
    }
    for name in ["__db.001", "__db.002", "__db.003", ".dbenv.lock", ".rpm.lock"] {
        root.remove_file_optional(format!("usr/share/rpm/{name}"))?;
    }
    root.ensure_dir_with("usr/lib/tmpfiles.d", &DirBuilder::new())?;
    root.atomic_write(
        IDEMPOTENCY_MARKER,
        "# Marker: rpm-ostree postprocessing applied\n",
    )?;
    Ok(())
}
