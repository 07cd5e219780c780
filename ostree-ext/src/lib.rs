//! Extension APIs that wrap the `ostree` crate.
//!
//! This crate is the adapter over libostree: sysroot locking, repository
//! commit/checkout, SELinux policy lookup, GVariant xattr encoding, and
//! related config parsing. The rest of the engine talks to OSTree only
//! through this crate.

#![deny(unused_must_use)]
// A handful of modules reach for unsafe FFI bridges (GVariant construction,
// fd redirection); those opt back in locally with #[allow(unsafe_code)].
#![deny(unsafe_code)]
#![allow(clippy::needless_borrow)]

/// Re-export the ostree and glib crates, so consumers can avoid a direct dependency.
pub use ostree;
pub use ostree::gio;
pub use ostree::glib;

pub(crate) use anyhow::Result;

mod cmdext;
pub mod diff;
pub mod globals;
pub mod ima;
pub mod isolation;
pub mod keyfileext;
mod logging;
pub mod mountutil;
pub mod objectsource;
mod objgv;
mod ostree_manual;
pub mod ostree_prepareroot;
pub mod refescape;
pub mod sysroot;
pub mod tokio_util;
mod utils;
mod variant_utils;

pub(crate) use cmdext::CommandRedirectionExt;
pub(crate) use utils::ResultExt;
