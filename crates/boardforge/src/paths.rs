use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// On-disk layout of one environment root. Everything the run touches lives
/// under `root` except user-supplied absolute copy sources.
#[derive(Debug, Clone)]
pub struct Paths {
    pub root: PathBuf,
    /// Per-device configuration tree (`<root>/targets/<family>/<module>/...`).
    pub targets_root: PathBuf,
    /// Checked-out source repositories.
    pub sources_root: PathBuf,
    /// Assembled output files for the selected device.
    pub out_dir: PathBuf,
    /// Downloaded binary-set bundles, one subdirectory per set.
    pub binaries_cache: PathBuf,
    /// Downloaded and extracted toolchains.
    pub bin_dir: PathBuf,
    /// Saved selection snapshots.
    pub history_dir: PathBuf,
}

impl Paths {
    pub fn new(root: &Path, sources_dir: &str, history_dir: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            targets_root: root.join("targets"),
            sources_root: root.join(sources_dir),
            out_dir: root.join("out"),
            binaries_cache: root.join("binaries"),
            bin_dir: root.join("bin"),
            history_dir: root.join(history_dir),
        }
    }

    pub fn ensure_run_dirs(&self) -> Result<()> {
        for d in [
            &self.sources_root,
            &self.out_dir,
            &self.binaries_cache,
            &self.bin_dir,
            &self.history_dir,
        ] {
            fs::create_dir_all(d)
                .map_err(|e| Error::msg(format!("cannot create {}: {e}", d.display())))?;
        }
        Ok(())
    }
}

/// Resolve `relative` against `root`, rejecting anything that would land
/// outside it. Purely lexical: `..` components and absolute paths are
/// refused before any filesystem access.
pub fn contained_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(Error::msg(format!(
            "destination '{relative}' must be relative to {}",
            root.display()
        )));
    }
    for comp in rel.components() {
        if matches!(comp, Component::ParentDir) {
            return Err(Error::msg(format!(
                "destination '{relative}' escapes {}",
                root.display()
            )));
        }
    }
    let joined = root.join(rel);
    if !joined.starts_with(root) {
        return Err(Error::msg(format!(
            "destination '{relative}' escapes {}",
            root.display()
        )));
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_relative_paths_are_contained() {
        let root = Path::new("/env/out");
        let p = contained_join(root, "boot/uboot.img").unwrap();
        assert_eq!(p, PathBuf::from("/env/out/boot/uboot.img"));
    }

    #[test]
    fn parent_components_are_rejected() {
        let root = Path::new("/env/out");
        assert!(contained_join(root, "../secrets").is_err());
        assert!(contained_join(root, "ok/../../nope").is_err());
    }

    #[test]
    fn absolute_destinations_are_rejected() {
        let root = Path::new("/env/out");
        assert!(contained_join(root, "/etc/passwd").is_err());
    }
}
