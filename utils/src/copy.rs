//! Recursive directory copy that preserves symlinks, permission bits, and
//! ownership where possible. Used by the assembler to materialize dependency
//! outputs into the ephemeral `hostroot`/`root` staging directories, and by
//! the cache layer when fetching `local` sources.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use anyhow::{Context, Result};

/// Recursively copy `src` onto `dst`, creating `dst` (and its parents) if
/// needed. Symlinks are recreated as symlinks rather than followed;
/// directories are created with mode `0755` and then have their source mode
/// applied; regular files have their mode copied; ownership (uid/gid) is
/// copied best-effort (failures are ignored, matching behavior under
/// unprivileged user namespaces where `chown` to an arbitrary uid/gid may be
/// rejected by the kernel).
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    copy_tree_inner(src, dst).with_context(|| format!("Copying {src:?} to {dst:?}"))
}

fn copy_tree_inner(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src).with_context(|| format!("Reading metadata {src:?}"))?;
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(src)?;
        if dst.symlink_metadata().is_ok() {
            fs::remove_file(dst).ok();
        }
        std::os::unix::fs::symlink(&target, dst)
            .with_context(|| format!("Creating symlink {dst:?} -> {target:?}"))?;
        return Ok(());
    }
    if file_type.is_dir() {
        fs::create_dir_all(dst).with_context(|| format!("Creating directory {dst:?}"))?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            let child_dst = dst.join(entry.file_name());
            copy_tree_inner(&entry.path(), &child_dst)?;
        }
        apply_metadata(dst, &meta)?;
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst).with_context(|| format!("Copying file to {dst:?}"))?;
    apply_metadata(dst, &meta)?;
    Ok(())
}

fn apply_metadata(dst: &Path, meta: &fs::Metadata) -> Result<()> {
    let perms = fs::Permissions::from_mode(meta.mode());
    fs::set_permissions(dst, perms).ok();
    // Preserving uid/gid is best-effort: under an unprivileged user
    // namespace only the mapped uid (0, as seen from inside) can usually be
    // applied, so a failure here is not fatal.
    let _ = rustix::fs::chown(
        dst,
        Some(rustix::fs::Uid::from_raw(meta.uid())),
        Some(rustix::fs::Gid::from_raw(meta.gid())),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn test_copy_tree_basic() -> Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;
        fs::create_dir(src.path().join("sub"))?;
        File::create(src.path().join("sub/file.txt"))?.write_all(b"hello")?;
        std::os::unix::fs::symlink("file.txt", src.path().join("sub/link"))?;

        copy_tree(src.path(), dst.path())?;

        assert_eq!(fs::read(dst.path().join("sub/file.txt"))?, b"hello");
        assert_eq!(
            fs::read_link(dst.path().join("sub/link"))?,
            Path::new("file.txt")
        );
        Ok(())
    }
}
