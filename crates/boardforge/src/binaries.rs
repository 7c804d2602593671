use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use filetime::FileTime;

use crate::archive;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::model::{Binary, Model};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Acquire every chosen binary set into `cache_root`. Fetch-only runs and
/// fully user-customized sets are skipped. On success the set's cache
/// directory is recorded on the model; materialization only copies from
/// sets that carry one.
pub fn acquire_all(ctx: &ExecCtx, model: &mut Model, cache_root: &Path) {
    if model.fetch_only_run() {
        return;
    }
    let names: Vec<String> = model
        .binaries
        .values()
        .filter(|b| b.chosen && !b.is_all_custom())
        .map(|b| b.name.clone())
        .collect();

    for name in names {
        if ctx.cancelled() {
            return;
        }
        let Some(b) = model.binaries.get(&name) else {
            continue;
        };
        ctx.report.info(&format!("getting binary set '{name}'"));
        match acquire(ctx, b, cache_root) {
            Ok(true) => {
                if let Some(b) = model.binaries.get_mut(&name) {
                    b.path = Some(cache_root.join(&name));
                }
            }
            Ok(false) => {}
            Err(e) => ctx.report.error(&format!("binary set '{name}': {e}")),
        }
    }
}

// Returns whether the cache directory is usable.
fn acquire(ctx: &ExecCtx, b: &Binary, cache_root: &Path) -> Result<bool> {
    let dir = cache_root.join(&b.name);
    fs::create_dir_all(&dir)
        .map_err(|e| Error::msg(format!("cannot create download folder: {e}")))?;

    let file_name = b
        .url
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::msg(format!("cannot derive a file name from {}", b.url)))?;
    let cached = dir.join(file_name);

    if ctx.dry_run {
        ctx.report
            .info(&format!("[binary {}] DRY-RUN: download {}", b.name, b.url));
        return Ok(true);
    }

    if b.force_download && cached.is_file() {
        fs::remove_file(&cached)?;
    }

    match download_if_newer(&b.url, &cached) {
        Ok(true) => ctx
            .report
            .info(&format!("new version of {file_name} downloaded")),
        Ok(false) => ctx
            .report
            .info(&format!("no new version of {file_name} available")),
        Err(e) => {
            // A stale cache that still covers every mapped file beats
            // failing the whole set.
            if stale_cache_usable(b, &dir) {
                ctx.report.warn(&format!(
                    "could not download an updated '{}' binary set, using an older version",
                    b.name
                ));
                return Ok(true);
            }
            return Err(Error::msg(format!("download failed: {e}")));
        }
    }

    if b.unpack
        && let Err(e) = archive::extract(ctx, &cached, &dir)
    {
        // Assume a corrupted download and clear the cache for a retry.
        let _ = fs::remove_dir_all(&dir);
        return Err(Error::msg(format!("unpack failed: {e} - deleting")));
    }
    Ok(true)
}

fn stale_cache_usable(b: &Binary, dir: &Path) -> bool {
    !b.copy_files.is_empty()
        && b.copy_files.iter().all(|cf| {
            let src = Path::new(&cf.src);
            if src.is_absolute() {
                src.exists()
            } else {
                dir.join(src).exists()
            }
        })
}

fn http_date(time: std::time::SystemTime) -> String {
    let dt: DateTime<Utc> = time.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Conditional download: an existing cached file is only replaced when the
/// server reports a newer version. Returns whether new content was written.
fn download_if_newer(url: &str, cached: &Path) -> Result<bool> {
    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()?;

    let mut req = client.get(url);
    if let Ok(meta) = fs::metadata(cached)
        && let Ok(mtime) = meta.modified()
    {
        req = req.header(reqwest::header::IF_MODIFIED_SINCE, http_date(mtime));
    }

    let mut resp = req.send()?;
    if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
        return Ok(false);
    }
    if !resp.status().is_success() {
        return Err(Error::msg(format!("HTTP {}", resp.status())));
    }

    let last_modified = resp
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok());

    let staging = cached
        .parent()
        .ok_or_else(|| Error::msg(format!("bad cache path {}", cached.display())))?;
    let mut staged = tempfile::NamedTempFile::new_in(staging)?;
    io::copy(&mut resp, &mut staged).map_err(|e| Error::msg(format!("read failed: {e}")))?;
    staged
        .persist(cached)
        .map_err(|e| Error::msg(format!("cannot place {}: {e}", cached.display())))?;

    // Carry the server timestamp so the next conditional request is exact.
    if let Some(lm) = last_modified {
        let ft = FileTime::from_unix_time(lm.timestamp(), 0);
        let _ = filetime::set_file_mtime(cached, ft);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDoc;
    use crate::model::{self, LoadContext};
    use crate::report::Reporter;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn model_from(s: &str) -> Model {
        let doc = ConfigDoc::from_value(PathBuf::from("<mem>"), toml::from_str(s).unwrap());
        model::from_doc(&doc, &LoadContext::default()).unwrap()
    }

    const BASE: &str = r#"
[targets.uboot]
repository = "u-boot"

[binaries.fpga]
description = "FPGA bundle"
url = "https://example.invalid/fpga.tar.gz"
unpack = true
chosen = true

[binaries.fpga.copyfiles]
"fpga.bit" = "bitstream/fpga.bit"
"#;

    #[test]
    fn fetch_only_runs_skip_acquisition() {
        let mut m = model_from(BASE);
        let tmp = tempfile::tempdir().unwrap();
        let report = Arc::new(Reporter::default());
        let ctx = ExecCtx::new(false, report.clone());
        // No target has build set, so nothing may be downloaded.
        acquire_all(&ctx, &mut m, tmp.path());
        assert!(m.binaries["fpga"].path.is_none());
        assert_eq!(report.error_count(), 0);
    }

    #[test]
    fn all_custom_sets_are_skipped() {
        let mut m = model_from(
            r#"
[targets.uboot]
repository = "u-boot"

[options.uboot]
build = true

[binaries.fpga]
description = "FPGA bundle"
url = "https://example.invalid/fpga.tar.gz"
unpack = true
chosen = true

[binaries.fpga.copyfiles]
"fpga.bit" = "/srv/custom/fpga.bit"
"#,
        );
        let tmp = tempfile::tempdir().unwrap();
        let report = Arc::new(Reporter::default());
        let ctx = ExecCtx::new(false, report.clone());
        acquire_all(&ctx, &mut m, tmp.path());
        assert!(m.binaries["fpga"].path.is_none());
        assert_eq!(report.error_count(), 0);
    }

    #[test]
    fn unreachable_host_with_usable_stale_cache_warns() {
        let mut m = model_from(BASE);
        // Mark a build so the run is not fetch-only.
        m.targets.get_mut("uboot").unwrap().build = true;

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("fpga");
        fs::create_dir_all(dir.join("bitstream")).unwrap();
        fs::write(dir.join("bitstream/fpga.bit"), "old bits").unwrap();

        let report = Arc::new(Reporter::default());
        let ctx = ExecCtx::new(false, report.clone());
        acquire_all(&ctx, &mut m, tmp.path());

        assert_eq!(m.binaries["fpga"].path.as_deref(), Some(dir.as_path()));
        assert!(report.warning_count() > 0);
        assert_eq!(report.error_count(), 0);
    }

    #[test]
    fn unreachable_host_without_cache_is_an_error() {
        let mut m = model_from(BASE);
        m.targets.get_mut("uboot").unwrap().build = true;

        let tmp = tempfile::tempdir().unwrap();
        let report = Arc::new(Reporter::default());
        let ctx = ExecCtx::new(false, report.clone());
        acquire_all(&ctx, &mut m, tmp.path());

        assert!(m.binaries["fpga"].path.is_none());
        assert!(report.error_count() > 0);
    }

    #[test]
    fn http_date_is_imf_fixdate() {
        let t = std::time::UNIX_EPOCH;
        assert_eq!(http_date(t), "Thu, 01 Jan 1970 00:00:00 GMT");
    }
}
