use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Locates tool executables for one tool family (VDE or QEMU).
///
/// Resolution never executes anything; it only performs filesystem access
/// checks. The `fallback_to_name` flag controls whether an unresolved name is
/// returned verbatim (letting the OS loader report the real error at spawn
/// time) or surfaces [`Error::BinaryNotFound`].
#[derive(Debug, Clone)]
pub struct Resolver {
    dir: Option<PathBuf>,
    fallback_to_name: bool,
}

impl Resolver {
    pub fn new(dir: Option<PathBuf>, fallback_to_name: bool) -> Self {
        Self {
            dir,
            fallback_to_name,
        }
    }

    pub fn vde(settings: &crate::config::Settings) -> Self {
        Self::new(settings.vdepath.clone(), settings.fallback_to_name)
    }

    pub fn qemu(settings: &crate::config::Settings) -> Self {
        Self::new(settings.qemupath.clone(), settings.fallback_to_name)
    }

    /// Resolve `name` to an executable path.
    ///
    /// Names containing a path separator are treated as already resolved.
    /// A configured tool directory takes precedence over PATH and is not
    /// combined with it: when the directory is set but holds no match, the
    /// fallback policy applies directly.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.contains(std::path::MAIN_SEPARATOR) {
            let candidate = PathBuf::from(name);
            if is_executable(&candidate) || self.fallback_to_name {
                return Ok(candidate);
            }
            return Err(Error::BinaryNotFound {
                name: name.to_string(),
            });
        }

        if let Some(dir) = self.dir.as_deref().filter(|d| !d.as_os_str().is_empty()) {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
            return self.fallback(name);
        }

        let path_var = std::env::var_os("PATH").unwrap_or_else(|| OsString::from("."));
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }

        self.fallback(name)
    }

    fn fallback(&self, name: &str) -> Result<PathBuf> {
        if self.fallback_to_name {
            Ok(PathBuf::from(name))
        } else {
            Err(Error::BinaryNotFound {
                name: name.to_string(),
            })
        }
    }
}

/// True when `path` exists and carries an execute permission bit.
pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn place_executable(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn name_with_separator_is_returned_unchanged() {
        let dir = tempdir().unwrap();
        let exe = place_executable(dir.path(), "vde_switch");
        let resolver = Resolver::new(None, false);
        let resolved = resolver.resolve(exe.to_str().unwrap()).unwrap();
        assert_eq!(resolved, exe);
    }

    #[test]
    fn name_with_separator_honors_fallback_policy() {
        let resolver = Resolver::new(None, true);
        let resolved = resolver.resolve("/nonexistent/vde_switch").unwrap();
        assert_eq!(resolved, PathBuf::from("/nonexistent/vde_switch"));

        let strict = Resolver::new(None, false);
        match strict.resolve("/nonexistent/vde_switch") {
            Err(Error::BinaryNotFound { name }) => {
                assert_eq!(name, "/nonexistent/vde_switch");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn configured_directory_takes_precedence() {
        let dir = tempdir().unwrap();
        let exe = place_executable(dir.path(), "vde_switch");
        let resolver = Resolver::new(Some(dir.path().to_path_buf()), false);
        assert_eq!(resolver.resolve("vde_switch").unwrap(), exe);
    }

    #[test]
    fn configured_directory_miss_applies_fallback_without_path_search() {
        let tools = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        place_executable(elsewhere.path(), "vde_switch");

        temp_env::with_var("PATH", Some(elsewhere.path()), || {
            let resolver = Resolver::new(Some(tools.path().to_path_buf()), true);
            // The PATH copy must not be consulted once a directory is configured.
            assert_eq!(
                resolver.resolve("vde_switch").unwrap(),
                PathBuf::from("vde_switch")
            );
        });
    }

    #[test]
    fn path_search_returns_first_match() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        let expected = place_executable(first.path(), "wirefilter");
        place_executable(second.path(), "wirefilter");

        let joined =
            std::env::join_paths([first.path(), second.path()]).unwrap();
        temp_env::with_var("PATH", Some(&joined), || {
            let resolver = Resolver::new(None, false);
            assert_eq!(resolver.resolve("wirefilter").unwrap(), expected);
        });
    }

    #[test]
    fn unresolved_bare_name_follows_policy() {
        let empty = tempdir().unwrap();
        temp_env::with_var("PATH", Some(empty.path()), || {
            let lenient = Resolver::new(None, true);
            assert_eq!(
                lenient.resolve("vde_plug").unwrap(),
                PathBuf::from("vde_plug")
            );

            let strict = Resolver::new(None, false);
            assert!(matches!(
                strict.resolve("vde_plug"),
                Err(Error::BinaryNotFound { .. })
            ));
        });
    }
}
