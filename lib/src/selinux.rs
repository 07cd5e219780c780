//! SELinux-related helper APIs: policy loading, label lookup, and the
//! low-level xattr primitives the assembler's relabel pass (§4.5 step 5)
//! and the postprocessor's policy-baking stage (§4.4 step 7) build on.

use std::path::Path;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std::fs::{Dir, Metadata, MetadataExt};
use cap_std_ext::cap_std;
use fn_error_context::context;
use ostree_ext::gio;
use ostree_ext::ostree;
use rustix::fd::AsRawFd;

/// The well-known selinuxfs mount point.
const SELINUX_MNT: &str = "/sys/fs/selinux";
const SELINUX_XATTR: &[u8] = b"security.selinux\0";

/// Query for whether or not SELinux is enabled on the host.
pub fn is_selinux_enabled() -> bool {
    Path::new(SELINUX_MNT).join("access").exists()
}

/// Load the SELinux policy store rooted at `dfd`, if present.
#[context("Loading SELinux policy")]
pub fn load_policy(dfd: &Dir) -> Result<Option<ostree::SePolicy>> {
    if !is_selinux_enabled() {
        return Ok(None);
    }
    let policy = ostree::SePolicy::new_at(dfd.as_raw_fd(), gio::Cancellable::NONE)
        .map_err(|e| crate::error::EngineError::PolicyLoadFailure(e.to_string()))?;
    Ok(Some(policy))
}

/// Look up the label for a path in a policy, erroring if none is found.
pub fn require_label(
    policy: &ostree::SePolicy,
    destname: &Utf8Path,
    mode: u32,
) -> Result<ostree::glib::GString> {
    policy
        .label(destname.as_str(), mode, gio::Cancellable::NONE)?
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No label found in policy '{:?}' for {destname}",
                policy.csum()
            )
        })
}

/// Check whether an ostree-formatted xattr set (`a(ayay)`) includes a
/// `security.selinux` entry.
pub fn xattrs_have_selinux(xattrs: &ostree::glib::Variant) -> bool {
    use gvariant::aligned_bytes::TryAsAligned;
    use gvariant::{gv, Marker, Structure};
    let v = xattrs.data_as_bytes();
    let Ok(v) = v.try_as_aligned() else { return false };
    let v = gv!("a(ayay)").cast(v);
    v.iter().any(|xattr| xattr.to_tuple().0 == SELINUX_XATTR)
}

/// A thin wrapper for `fsetxattr(security.selinux)`.
pub fn set_security_selinux(fd: std::os::fd::BorrowedFd, label: &[u8]) -> Result<()> {
    rustix::fs::fsetxattr(fd, "security.selinux", label, rustix::fs::XattrFlags::empty())
        .context("fsetxattr(security.selinux)")
}

/// A thin wrapper for `lsetxattr(security.selinux)`, relative to `root`.
pub fn set_security_selinux_path(root: &Dir, path: &Utf8Path, label: &[u8]) -> Result<()> {
    let fdpath = format!("/proc/self/fd/{}/", root.as_raw_fd());
    let fdpath = &Path::new(&fdpath).join(path);
    rustix::fs::lsetxattr(fdpath, "security.selinux", label, rustix::fs::XattrFlags::empty())?;
    Ok(())
}

/// The labeling state of a path; `Unsupported` covers filesystems (e.g.
/// the ESP, or overlayfs lower layers) that don't carry the xattr at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SELinuxLabelState {
    /// No `security.selinux` xattr is set.
    Unlabeled,
    /// The filesystem doesn't support the xattr.
    Unsupported,
    /// Already labeled.
    Labeled,
}

/// Query the SELinux labeling state for a path relative to `root`.
pub fn has_security_selinux(root: &Dir, path: &Utf8Path) -> Result<SELinuxLabelState> {
    let mut buf = [0u8; 2048];
    let fdpath = format!("/proc/self/fd/{}/{path}", root.as_raw_fd());
    match rustix::fs::lgetxattr(fdpath, "security.selinux", &mut buf) {
        Ok(_) => Ok(SELinuxLabelState::Labeled),
        Err(rustix::io::Errno::OPNOTSUPP) => Ok(SELinuxLabelState::Unsupported),
        Err(rustix::io::Errno::NODATA) => Ok(SELinuxLabelState::Unlabeled),
        Err(e) => Err(e).with_context(|| format!("Failed to look up context for {path:?}")),
    }
}

/// Relabel `path` from `policy` if it is not already labeled.
pub fn ensure_labeled(
    root: &Dir,
    path: &Utf8Path,
    metadata: &Metadata,
    policy: &ostree::SePolicy,
) -> Result<SELinuxLabelState> {
    let r = has_security_selinux(root, path)?;
    if matches!(r, SELinuxLabelState::Unlabeled) {
        let abspath = Utf8Path::new("/").join(path);
        let label = require_label(policy, &abspath, metadata.mode())?;
        tracing::trace!("Setting label for {path} to {label}");
        set_security_selinux_path(root, path, label.as_bytes())?;
    }
    Ok(r)
}
