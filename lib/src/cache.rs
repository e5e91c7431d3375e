//! The deterministic cache path scheme of spec.md §4.3.
//!
//! ```text
//! <cache>/
//!   container/            the distro root filesystem
//!   archlinux-bootstrap-...tar.gz
//!   sources/<id>/         unpacked sources (persistent)
//!   build/<id>/           standard-target scratch build dir
//!   host-build/<id>/      host-target scratch build dir
//!   built/<id>/           standard-target install output
//!   host-built/<id>/      host-target install output
//!   hostroot/             ephemeral, rebuilt per unit
//!   root/                 ephemeral sysroot, rebuilt per unit
//! ```

use camino::{Utf8Path, Utf8PathBuf};

/// All paths are computed, never stored; this is a thin wrapper around the
/// cache root, mirroring `bootc-lib`'s small path-computing structs.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: Utf8PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn container(&self) -> Utf8PathBuf {
        self.root.join("container")
    }

    pub fn bootstrap_archive(&self, file_name: &str) -> Utf8PathBuf {
        self.root.join(file_name)
    }

    pub fn sources(&self, id: &str) -> Utf8PathBuf {
        self.root.join("sources").join(id)
    }

    pub fn build(&self, id: &str) -> Utf8PathBuf {
        self.root.join("build").join(id)
    }

    pub fn host_build(&self, id: &str) -> Utf8PathBuf {
        self.root.join("host-build").join(id)
    }

    pub fn built(&self, id: &str) -> Utf8PathBuf {
        self.root.join("built").join(id)
    }

    pub fn host_built(&self, id: &str) -> Utf8PathBuf {
        self.root.join("host-built").join(id)
    }

    pub fn hostroot(&self) -> Utf8PathBuf {
        self.root.join("hostroot")
    }

    pub fn sysroot(&self) -> Utf8PathBuf {
        self.root.join("root")
    }

    /// The per-run advisory lock file (§5: "the implementation must either
    /// lock the cache directory or document single-invocation use" — we
    /// lock it).
    pub fn lock_file(&self) -> Utf8PathBuf {
        self.root.join(".chariot.lock")
    }
}

/// An advisory lock on the whole cache directory for the run's lifetime,
/// satisfying spec.md §5's requirement that concurrent invocations against
/// the same cache be either locked or documented as unsupported. Backed by
/// an `O_EXCL`-created file rather than a `flock`/`fs2` dependency: simple,
/// and sufficient since chariot never needs to lock across a process crash.
#[derive(Debug)]
pub struct CacheLock {
    path: camino::Utf8PathBuf,
}

impl CacheLock {
    pub fn acquire(cache: &CacheLayout) -> crate::error::Result<Self> {
        let path = cache.lock_file();
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    crate::error::ChariotError::io(
                        path.to_string(),
                        std::io::Error::new(
                            e.kind(),
                            "cache directory is locked by another chariot invocation",
                        ),
                    )
                } else {
                    crate::error::ChariotError::io(path.to_string(), e)
                }
            })?;
        Ok(Self { path })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let cache = CacheLayout::new("/tmp/cache");
        assert_eq!(cache.sources("hello").as_str(), "/tmp/cache/sources/hello");
        assert_eq!(cache.built("app").as_str(), "/tmp/cache/built/app");
        assert_eq!(
            cache.host_built("cmake").as_str(),
            "/tmp/cache/host-built/cmake"
        );
        assert_eq!(cache.hostroot().as_str(), "/tmp/cache/hostroot");
        assert_eq!(cache.sysroot().as_str(), "/tmp/cache/root");
    }

    #[test]
    fn test_lock_rejects_second_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheLayout::new(Utf8Path::from_path(dir.path()).unwrap());
        let first = CacheLock::acquire(&cache).unwrap();
        assert!(CacheLock::acquire(&cache).is_err());
        drop(first);
        assert!(CacheLock::acquire(&cache).is_ok());
    }
}
