use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{MasterConfig, ToolchainSpec};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::paths::Paths;
use crate::{archive, paths};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Resolve every required toolchain to a directory to prepend to the build
/// PATH. Local toolchains with an empty `path` are assumed to already be on
/// PATH and contribute nothing. Any unresolvable toolchain is fatal; builds
/// without their cross compiler fail in far less obvious ways.
pub fn acquire_all(
    ctx: &ExecCtx,
    cfg: &MasterConfig,
    required: &[String],
    paths: &Paths,
) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for name in required {
        let spec = cfg.toolchain.get(name).ok_or_else(|| {
            Error::msg(format!("toolchain '{name}' is not configured"))
        })?;
        if let Some(dir) = acquire(ctx, name, spec, paths)? {
            ctx.report.info(&format!("toolchain '{name}' at {}", dir.display()));
            dirs.push(dir);
        } else {
            ctx.report.info(&format!("toolchain '{name}' taken from PATH"));
        }
    }
    Ok(dirs)
}

fn acquire(ctx: &ExecCtx, name: &str, spec: &ToolchainSpec, paths: &Paths) -> Result<Option<PathBuf>> {
    match spec.kind.as_str() {
        "local" => {
            let Some(p) = spec.path.as_deref().filter(|p| !p.is_empty()) else {
                return Ok(None);
            };
            let dir = PathBuf::from(p);
            if !dir.is_dir() {
                return Err(Error::msg(format!(
                    "toolchain '{name}': local directory {} does not exist",
                    dir.display()
                )));
            }
            Ok(Some(dir))
        }
        "remote" => acquire_remote(ctx, name, spec, paths).map(Some),
        other => Err(Error::msg(format!(
            "toolchain '{name}': unknown kind '{other}'"
        ))),
    }
}

fn acquire_remote(ctx: &ExecCtx, name: &str, spec: &ToolchainSpec, paths: &Paths) -> Result<PathBuf> {
    let url = spec
        .url
        .as_deref()
        .ok_or_else(|| Error::msg(format!("toolchain '{name}' has no url")))?;
    let rel = spec
        .path
        .as_deref()
        .ok_or_else(|| Error::msg(format!("toolchain '{name}' has no path")))?;

    let archive_name = url
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::msg(format!("toolchain '{name}': cannot derive file name from {url}")))?;
    let archive_path = paths.bin_dir.join(archive_name);
    let tool_dir = paths::contained_join(&paths.bin_dir, rel)?;

    if tool_dir.is_dir() {
        return Ok(tool_dir);
    }

    // An archive without its extracted tree means a previously interrupted
    // or broken unpack; start over.
    if archive_path.is_file() {
        ctx.report
            .warn(&format!("toolchain '{name}': cached archive looks corrupted, re-downloading"));
        fs::remove_file(&archive_path)?;
    }

    if ctx.dry_run {
        ctx.report.info(&format!("[toolchain {name}] DRY-RUN: download {url}"));
        return Ok(tool_dir);
    }

    ctx.report.info(&format!("downloading toolchain '{name}' from {url}"));
    download(url, &archive_path, &paths.bin_dir)?;

    if let Err(e) = archive::extract(ctx, &archive_path, &paths.bin_dir) {
        // Keep the cache clean so the next run retries from scratch.
        let _ = fs::remove_file(&archive_path);
        return Err(Error::msg(format!("toolchain '{name}': unpack failed: {e}")));
    }
    if !tool_dir.is_dir() {
        let _ = fs::remove_file(&archive_path);
        return Err(Error::msg(format!(
            "toolchain '{name}': archive did not contain {rel}"
        )));
    }
    Ok(tool_dir)
}

fn download(url: &str, dest: &Path, staging_dir: &Path) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()?;
    let mut resp = client.get(url).send()?;
    if !resp.status().is_success() {
        return Err(Error::msg(format!(
            "download of {url} failed: HTTP {}",
            resp.status()
        )));
    }
    let mut staged = tempfile::NamedTempFile::new_in(staging_dir)?;
    io::copy(&mut resp, &mut staged)
        .map_err(|e| Error::msg(format!("download of {url} failed: {e}")))?;
    staged
        .persist(dest)
        .map_err(|e| Error::msg(format!("cannot place {}: {e}", dest.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Reporter;
    use std::sync::Arc;

    fn test_paths(root: &Path) -> Paths {
        Paths::new(root, "sources", "history")
    }

    #[test]
    fn unconfigured_toolchain_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ExecCtx::new(true, Arc::new(Reporter::default()));
        let cfg = MasterConfig::default();
        let err = acquire_all(&ctx, &cfg, &["arm-none-eabi".to_string()], &test_paths(tmp.path()))
            .unwrap_err()
            .to_string();
        assert!(err.contains("arm-none-eabi"));
    }

    #[test]
    fn local_toolchain_with_empty_path_uses_environment() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ExecCtx::new(true, Arc::new(Reporter::default()));
        let cfg: MasterConfig = toml::from_str(
            r#"
[toolchain.host]
kind = "local"
"#,
        )
        .unwrap();
        let dirs = acquire_all(&ctx, &cfg, &["host".to_string()], &test_paths(tmp.path())).unwrap();
        assert!(dirs.is_empty());
    }

    #[test]
    fn missing_local_directory_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ExecCtx::new(true, Arc::new(Reporter::default()));
        let cfg: MasterConfig = toml::from_str(
            r#"
[toolchain.gcc]
kind = "local"
path = "/definitely/not/here"
"#,
        )
        .unwrap();
        assert!(acquire_all(&ctx, &cfg, &["gcc".to_string()], &test_paths(tmp.path())).is_err());
    }

    #[test]
    fn extracted_remote_toolchain_is_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(tmp.path());
        fs::create_dir_all(paths.bin_dir.join("gcc-arm/bin")).unwrap();

        let ctx = ExecCtx::new(false, Arc::new(Reporter::default()));
        let cfg: MasterConfig = toml::from_str(
            r#"
[toolchain.gcc]
kind = "remote"
url = "https://example.invalid/gcc-arm.tar.gz"
path = "gcc-arm/bin"
"#,
        )
        .unwrap();
        // No network access happens because the directory already exists.
        let dirs = acquire_all(&ctx, &cfg, &["gcc".to_string()], &paths).unwrap();
        assert_eq!(dirs, vec![paths.bin_dir.join("gcc-arm/bin")]);
    }
}
