//! Module containing access to global state.

use super::Result;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::RootDir;
use once_cell::sync::OnceCell;
use ostree::glib;
use std::fs::File;

struct ConfigPaths {
    persistent: Utf8PathBuf,
    runtime: Utf8PathBuf,
    system: Option<Utf8PathBuf>,
}

/// Get the runtime and persistent config directories.  In the system (root) case, these
/// system(root) case:  /run/ostree           /etc/ostree        /usr/lib/ostree
/// user(nonroot) case: /run/user/$uid/ostree ~/.config/ostree   <none>
fn get_config_paths(root: bool) -> &'static ConfigPaths {
    if root {
        static PATHS_ROOT: OnceCell<ConfigPaths> = OnceCell::new();
        PATHS_ROOT.get_or_init(|| ConfigPaths::new("etc", "run", Some("usr/lib")))
    } else {
        static PATHS_USER: OnceCell<ConfigPaths> = OnceCell::new();
        PATHS_USER.get_or_init(|| {
            ConfigPaths::new(
                Utf8PathBuf::try_from(glib::user_config_dir()).unwrap(),
                Utf8PathBuf::try_from(glib::user_runtime_dir()).unwrap(),
                None,
            )
        })
    }
}

impl ConfigPaths {
    fn new<P: AsRef<Utf8Path>>(persistent: P, runtime: P, system: Option<P>) -> Self {
        fn relative_owned(p: &Utf8Path) -> Utf8PathBuf {
            p.as_str().trim_start_matches('/').into()
        }
        let mut r = ConfigPaths {
            persistent: relative_owned(persistent.as_ref()),
            runtime: relative_owned(runtime.as_ref()),
            system: system.as_ref().map(|s| relative_owned(s.as_ref())),
        };
        let path = "ostree";
        r.persistent.push(path);
        r.runtime.push(path);
        if let Some(system) = r.system.as_mut() {
            system.push(path);
        }
        r
    }

    /// Return the path and an open fd for a config file, if it exists.
    pub(crate) fn open_file(
        &self,
        root: &RootDir,
        p: impl AsRef<Utf8Path>,
    ) -> Result<Option<(Utf8PathBuf, File)>> {
        let p = p.as_ref();
        let mut runtime = self.runtime.clone();
        runtime.push(p);
        if let Some(f) = root.open_optional(&runtime)? {
            return Ok(Some((runtime, f)));
        }
        let mut persistent = self.persistent.clone();
        persistent.push(p);
        if let Some(f) = root.open_optional(&persistent)? {
            return Ok(Some((persistent, f)));
        }
        if let Some(mut system) = self.system.clone() {
            system.push(p);
            if let Some(f) = root.open_optional(&system)? {
                return Ok(Some((system, f)));
            }
        }
        Ok(None)
    }
}

/// Return the path to the global container authentication file, if it exists.
pub fn get_global_authfile(root: &Dir) -> Result<Option<(Utf8PathBuf, File)>> {
    let root = &RootDir::new(root, ".")?;
    let am_uid0 = rustix::process::getuid() == rustix::process::Uid::ROOT;
    get_global_authfile_impl(root, am_uid0)
}

/// Return the path to the global container authentication file, if it exists.
fn get_global_authfile_impl(root: &RootDir, am_uid0: bool) -> Result<Option<(Utf8PathBuf, File)>> {
    let paths = get_config_paths(am_uid0);
    paths.open_file(root, "auth.json")
}
