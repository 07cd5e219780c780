//! The package importer (§4.2): turns a single RPM into a cache commit in
//! the object store, translating RPM-specific metadata (ownership, fcaps,
//! IMA) into the ostree content-addressed tree model.
//!
//! Grounded on the tree-building shape in the compose path (`MutableTree` +
//! `write_directory_to_mtree`/`write_mtree`), generalized here to build the
//! tree directly from the RPM's cpio payload rather than from a directory
//! already materialized on disk.

use std::collections::BTreeMap;
use std::io::Read;

use anyhow::{Context, Result};
use fn_error_context::context;
use ostree_ext::gio;
use ostree_ext::glib;
use ostree_ext::ima::new_variant_a_ayay;
use ostree_ext::ostree;
use ostree_ext::ostree::prelude::FileExt;

use crate::error::EngineError;

/// The result of a successful import: the commit that now holds the
/// package's tree, and the NEVRA it was imported for.
#[derive(Debug, Clone)]
pub struct CacheCommit {
    /// The checksum of the written commit.
    pub checksum: String,
    /// The NEVRA this commit caches.
    pub nevra: String,
    /// The branch it was committed to.
    pub branch: String,
}

/// Per-path file attributes read from the RPM header, used to enrich the
/// cpio stream (which only carries path/size/mode for regular entries).
#[derive(Debug, Clone, Default)]
struct HeaderFileInfo {
    user: String,
    group: String,
    /// The VFS-capability string (`fcaps`), if the header records one for this path.
    fcaps: Option<String>,
    /// IMA appraisal signature for this path, if the header carries one.
    /// Promoted to `security.ima` on import (the header stores it as `user.ima`).
    ima_signature: Option<Vec<u8>>,
    /// `user.pax.flags`, passed through verbatim when present. Always `None` in
    /// practice: the original tool reads this xattr off already-installed files
    /// post-`rpm -i`, and the RPM header itself carries no equivalent tag, so a
    /// from-header importer has nothing to populate it from. Wired through anyway
    /// so the xattr plumbing is in place if a source ever becomes available.
    pax_flags: Option<Vec<u8>>,
}

/// Rewrites controlling ostree-convention path normalization (§4.2 step 4).
#[derive(Debug, Clone, Default)]
pub struct ImportFlags {
    /// Rewrite `/etc` to `/usr/etc`.
    pub etc_to_usr_etc: bool,
    /// The checksum of the SELinux policy used to label this content, if known;
    /// recorded in `rpmostree.sepolicy` so later overlays can tell whether a
    /// relabel is needed.
    pub sepolicy_csum: Option<String>,
}

/// Linux capability bit indices (`linux/capability.h`), in the order
/// `cap_from_text(3)`-style names are commonly listed.
fn capability_bit(name: &str) -> Option<u32> {
    const NAMES: &[&str] = &[
        "cap_chown",
        "cap_dac_override",
        "cap_dac_read_search",
        "cap_fowner",
        "cap_fsetid",
        "cap_kill",
        "cap_setgid",
        "cap_setuid",
        "cap_setpcap",
        "cap_linux_immutable",
        "cap_net_bind_service",
        "cap_net_broadcast",
        "cap_net_admin",
        "cap_net_raw",
        "cap_ipc_lock",
        "cap_ipc_owner",
        "cap_sys_module",
        "cap_sys_rawio",
        "cap_sys_chroot",
        "cap_sys_ptrace",
        "cap_sys_pacct",
        "cap_sys_admin",
        "cap_sys_boot",
        "cap_sys_nice",
        "cap_sys_resource",
        "cap_sys_time",
        "cap_sys_tty_config",
        "cap_mknod",
        "cap_lease",
        "cap_audit_write",
        "cap_audit_control",
        "cap_setfcap",
        "cap_mac_override",
        "cap_mac_admin",
        "cap_syslog",
        "cap_wake_alarm",
        "cap_block_suspend",
        "cap_audit_read",
        "cap_perfmon",
        "cap_bpf",
        "cap_checkpoint_restore",
    ];
    NAMES.iter().position(|n| *n == name).map(|i| i as u32)
}

/// Parse `fcaps` (the RPM header's textual `cap_from_text(3)`-style
/// capability string) into the kernel's on-disk `security.capability`
/// VFS v2 binary format.
fn encode_vfs_caps(fcaps: &str) -> Result<Vec<u8>> {
    // VFS_CAP_REVISION_2 layout: magic_etc(u32) + permitted(2xu32) + inheritable(2xu32).
    const VFS_CAP_REVISION_2: u32 = 0x0200_0000;
    const VFS_CAP_FLAGS_EFFECTIVE: u32 = 0x1;
    let (caps_part, flags) = fcaps
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Malformed fcaps string: {fcaps}"))?;
    let effective = flags.contains('e');
    let inheritable_flag = flags.contains('i');

    let mut permitted: u64 = 0;
    for name in caps_part.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let bit = capability_bit(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown capability name in fcaps: {name}"))?;
        permitted |= 1u64 << bit;
    }
    let inheritable: u64 = if inheritable_flag { permitted } else { 0 };

    let mut buf = Vec::with_capacity(20);
    let magic = if effective {
        VFS_CAP_REVISION_2 | VFS_CAP_FLAGS_EFFECTIVE
    } else {
        VFS_CAP_REVISION_2
    };
    buf.extend_from_slice(&magic.to_le_bytes());
    buf.extend_from_slice(&(permitted as u32).to_le_bytes());
    buf.extend_from_slice(&((permitted >> 32) as u32).to_le_bytes());
    buf.extend_from_slice(&(inheritable as u32).to_le_bytes());
    buf.extend_from_slice(&((inheritable >> 32) as u32).to_le_bytes());
    Ok(buf)
}

/// Escape a NEVRA into the pkgcache branch naming scheme: `:` becomes
/// `_3A`, `_` becomes `__`; everything else passes through. Distinct from
/// [`ostree_ext::refescape`]'s general-purpose scheme.
pub fn cache_branch(nevra: &str) -> String {
    let mut escaped = String::with_capacity(nevra.len());
    for c in nevra.chars() {
        match c {
            ':' => escaped.push_str("_3A"),
            '_' => escaped.push_str("__"),
            c => escaped.push(c),
        }
    }
    format!("rpmostree/pkg/{escaped}")
}

/// Parsed, ready-to-import package content.
#[derive(Debug)]
pub struct ParsedRpm {
    /// The package's NEVRA.
    pub nevra: String,
    /// The verbatim `[lead..cpio)` byte range, kept for updating the base rpmdb at assembly time.
    pub header_blob: Vec<u8>,
    /// The sha256 of `header_blob`.
    pub header_sha256: String,
    per_path: BTreeMap<String, HeaderFileInfo>,
    /// Decompressed cpio (newc) payload bytes.
    payload: Vec<u8>,
}

/// Parse an RPM's lead/signature/header via the host RPM library, returning
/// everything the importer needs without yet touching the object store.
#[context("Parsing RPM")]
pub fn parse_rpm<R: Read>(mut reader: R) -> Result<ParsedRpm> {
    let pkg = rpm::Package::parse(&mut reader).context("Invalid RPM")?;
    let metadata = &pkg.metadata;
    let nevra = format!(
        "{}-{}{}-{}.{}",
        metadata.get_name().unwrap_or_default(),
        metadata
            .get_epoch()
            .map(|e| format!("{e}:"))
            .unwrap_or_default(),
        metadata.get_version().unwrap_or_default(),
        metadata.get_release().unwrap_or_default(),
        metadata.get_arch().unwrap_or_default(),
    );

    let file_caps = metadata.get_file_caps().ok();
    let ima_signatures = metadata.get_file_ima_signatures().ok();
    let mut per_path = BTreeMap::new();
    for entry in metadata.get_file_entries().context("Reading file list")? {
        let path = entry.path.to_string_lossy().into_owned();
        let fcaps = file_caps.as_ref().and_then(|caps| caps.get(&path).cloned());
        let ima_signature = ima_signatures
            .as_ref()
            .and_then(|sigs| sigs.get(&path))
            .and_then(|hexsig| hex::decode(hexsig).ok());
        per_path.insert(
            path,
            HeaderFileInfo {
                user: entry.ownership.user.clone(),
                group: entry.ownership.group.clone(),
                fcaps,
                ima_signature,
                pax_flags: None,
            },
        );
    }

    let mut header_blob = Vec::new();
    metadata
        .write(&mut header_blob)
        .context("Re-serializing RPM lead/signature/header")?;
    let header_sha256 = {
        use openssl::sha::Sha256;
        let mut h = Sha256::new();
        h.update(&header_blob);
        hex::encode(h.finish())
    };

    Ok(ParsedRpm {
        nevra,
        header_blob,
        header_sha256,
        per_path,
        payload: pkg.content,
    })
}

/// A single decoded cpio entry, with its RPM header enrichment applied.
struct Entry {
    path: String,
    data: Vec<u8>,
    mode: u32,
    is_dir: bool,
    is_symlink: bool,
    info: HeaderFileInfo,
}

fn read_cpio_entries(payload: &[u8], per_path: &BTreeMap<String, HeaderFileInfo>) -> Result<Vec<Entry>> {
    let mut reader = cpio::NewcReader::new(payload)?;
    let mut out = Vec::new();
    loop {
        let entry = reader.entry();
        if entry.name() == "TRAILER!!!" {
            break;
        }
        let name = entry.name().trim_start_matches("./").to_string();
        let mode = entry.mode();
        let is_dir = mode & libc::S_IFMT == libc::S_IFDIR;
        let is_symlink = mode & libc::S_IFMT == libc::S_IFLNK;
        let mut data = Vec::with_capacity(entry.file_size() as usize);
        std::io::copy(&mut (&mut reader).take(entry.file_size() as u64), &mut data)?;
        let info = per_path.get(&format!("/{name}")).cloned().unwrap_or_default();
        out.push(Entry {
            path: name,
            data,
            mode,
            is_dir,
            is_symlink,
            info,
        });
        reader = reader.finish()?;
    }
    Ok(out)
}

/// Build an `a(ayay)` GVariant of xattrs for a single entry: `user.pax.flags`
/// passed through verbatim, `user.ima`→`security.ima` promoted, and
/// `security.capability` synthesized from `fcaps` when present.
fn entry_xattrs(info: &HeaderFileInfo) -> Result<glib::Variant> {
    let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    if let Some(fcaps) = &info.fcaps {
        pairs.push((
            b"security.capability".to_vec(),
            encode_vfs_caps(fcaps)?,
        ));
    }
    if let Some(sig) = &info.ima_signature {
        pairs.push((b"security.ima".to_vec(), sig.clone()));
    }
    if let Some(pax) = &info.pax_flags {
        pairs.push((b"user.pax.flags".to_vec(), pax.clone()));
    }
    Ok(new_variant_a_ayay(pairs))
}

/// Import a single RPM: stream its cpio payload into a new commit under the
/// pkgcache branch, enforcing the root-ownership policy and translating
/// xattrs. Re-importing identical bytes is idempotent (the resulting
/// commit, being content-addressed, is identical).
#[context("Importing RPM")]
pub fn import(repo: &ostree::Repo, parsed: &ParsedRpm, flags: ImportFlags) -> Result<CacheCommit> {
    let cancellable = gio::Cancellable::NONE;
    let entries = read_cpio_entries(&parsed.payload, &parsed.per_path)?;

    let mtree = ostree::MutableTree::new();
    for entry in &entries {
        if !(entry.info.user.is_empty() || entry.info.user == "root")
            || !(entry.info.group.is_empty() || entry.info.group == "root")
        {
            return Err(EngineError::NonRootOwnershipUnsupported(format!(
                "{} owned by {}:{}",
                entry.path, entry.info.user, entry.info.group
            ))
            .into());
        }

        let path = if flags.etc_to_usr_etc && (entry.path == "etc" || entry.path.starts_with("etc/")) {
            format!("usr/{}", entry.path)
        } else {
            entry.path.clone()
        };
        if path.is_empty() {
            continue;
        }

        let (parent, name) = split_parent(&path);
        let dir = ensure_dir(&mtree, parent)?;

        if entry.is_dir {
            dir.ensure_dir(&name)?;
            continue;
        }

        let xattrs = entry_xattrs(&entry.info)?;
        let finfo = gio::FileInfo::new();
        let input = if entry.is_symlink {
            let target = String::from_utf8_lossy(&entry.data).into_owned();
            finfo.set_file_type(gio::FileType::SymbolicLink);
            finfo.set_symlink_target(&target);
            finfo.set_attribute_uint32("unix::mode", libc::S_IFLNK | 0o777);
            gio::MemoryInputStream::from_bytes(&glib::Bytes::from_static(&[]))
        } else {
            finfo.set_file_type(gio::FileType::Regular);
            finfo.set_size(entry.data.len() as i64);
            finfo.set_attribute_uint32("unix::mode", libc::S_IFREG | (entry.mode & 0o7777));
            gio::MemoryInputStream::from_bytes(&glib::Bytes::from(&entry.data))
        };
        let (ostream, len) =
            ostree::raw_file_to_content_stream(&input, &finfo, Some(&xattrs), cancellable)?;
        let checksum = repo.write_content(None, &ostream, len, cancellable)?.to_hex();
        dir.replace_file(&name, &checksum)?;
    }

    let root = repo.write_mtree(&mtree, cancellable)?;
    let root = root
        .downcast_ref::<ostree::RepoFile>()
        .ok_or_else(|| anyhow::anyhow!("write_mtree did not return a RepoFile"))?;

    // The full lead/signature/header blob is stored verbatim: it carries the file
    // security capabilities we've already applied as xattrs above, and it's needed
    // again at assembly time to update the base rpmdb (`rpmostree.rpmdb.pkglist`).
    let mut metadata = glib::VariantDict::new(None);
    metadata.insert("rpmostree.nevra", &parsed.nevra);
    metadata.insert("rpmostree.header-sha256", &parsed.header_sha256);
    metadata.insert("rpmostree.metadata", &glib::Variant::from(&parsed.header_blob[..]));
    if let Some(csum) = &flags.sepolicy_csum {
        metadata.insert("rpmostree.sepolicy", csum);
    }
    metadata.insert("rpmostree.unpack_version", &1u32);
    let metadata = metadata.end();

    let branch = cache_branch(&parsed.nevra);
    let (checksum, _, _) = repo.write_commit_with_time(
        None,
        None,
        None,
        Some(&metadata),
        root,
        0,
        cancellable,
    )?;
    let checksum = checksum.to_hex();
    repo.transaction_set_ref(None, &branch, Some(&checksum));

    Ok(CacheCommit {
        checksum,
        nevra: parsed.nevra.clone(),
        branch,
    })
}

fn split_parent(path: &str) -> (&str, String) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name.to_string()),
        None => ("", path.to_string()),
    }
}

fn ensure_dir(root: &ostree::MutableTree, path: &str) -> Result<ostree::MutableTree> {
    let mut cur = root.clone();
    if path.is_empty() {
        return Ok(cur);
    }
    for comp in path.split('/').filter(|c| !c.is_empty()) {
        cur = cur.ensure_dir(comp)?;
    }
    Ok(cur)
}
