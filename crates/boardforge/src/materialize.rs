use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::Model;
use crate::paths;
use crate::report::Reporter;

/// Copy the declared outputs of every successfully built target into the
/// output directory, then scrub the mapped destinations of targets that
/// failed, so nothing stale survives a broken build.
pub fn copy_target_outputs(report: &Reporter, model: &Model, sources_root: &Path, out_dir: &Path) {
    for t in model.targets.values() {
        if t.build {
            report.info(&format!("copying files for '{}'", t.name));
            for cf in &t.copy_files {
                let src = sources_root.join(&t.repository).join(&cf.src);
                let dst = match paths::contained_join(out_dir, &cf.dst) {
                    Ok(d) => d,
                    Err(e) => {
                        report.error(&e.to_string());
                        continue;
                    }
                };
                if let Err(e) = copy_file(&src, &dst) {
                    report.error(&format!(
                        "error while copying {}: {e}",
                        src.display()
                    ));
                } else {
                    report.info(&format!("copied {} to {}", src.display(), dst.display()));
                }
            }
        }

        if t.build_error {
            for cf in &t.copy_files {
                let Ok(dst) = paths::contained_join(out_dir, &cf.dst) else {
                    continue;
                };
                if dst.is_file()
                    && let Err(e) = fs::remove_file(&dst)
                {
                    report.warn(&format!(
                        "error while deleting {}: {e}",
                        dst.display()
                    ));
                }
            }
        }
    }
}

/// Copy the chosen binary set's files into the output directory. Relative
/// sources resolve against the set's cache directory; absolute sources are
/// user-supplied replacements. Directory sources replace the destination
/// wholesale.
pub fn copy_binary_outputs(report: &Reporter, model: &Model, out_dir: &Path) {
    if model.fetch_only_run() {
        return;
    }
    for b in model.binaries.values() {
        if !b.chosen {
            continue;
        }
        // An unset cache path means acquisition failed or never ran.
        if b.path.is_none() && !b.is_all_custom() {
            continue;
        }
        if b.copy_files.is_empty() {
            report.warn(&format!("no files to copy found for binary set '{}'", b.name));
            continue;
        }
        report.info(&format!("copying binaries from '{}'", b.name));
        for cf in &b.copy_files {
            let src = if Path::new(&cf.src).is_absolute() {
                Path::new(&cf.src).to_path_buf()
            } else {
                match &b.path {
                    Some(p) => p.join(&cf.src),
                    None => continue,
                }
            };
            let dst = match paths::contained_join(out_dir, &cf.dst) {
                Ok(d) => d,
                Err(e) => {
                    report.error(&e.to_string());
                    continue;
                }
            };
            let res = if src.is_dir() {
                replace_dir(&src, &dst)
            } else {
                copy_file(&src, &dst)
            };
            match res {
                Ok(()) => report.info(&format!(
                    "copied {} to {}",
                    src.display(),
                    dst.display()
                )),
                Err(e) => report.warn(&format!(
                    "error while copying {}: {e}",
                    src.display()
                )),
            }
        }
    }
}

// fs::copy carries mode bits on unix.
fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;
    Ok(())
}

fn replace_dir(src: &Path, dst: &Path) -> Result<()> {
    if dst.is_dir() {
        fs::remove_dir_all(dst)?;
    }
    copy_dir_all(src, dst)
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let p = entry.path();
        let rel = p
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&out)?;
        } else {
            copy_file(p, &out)?;
        }
    }
    Ok(())
}
