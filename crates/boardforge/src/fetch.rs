use std::path::Path;
use std::process::Command;

use crate::error::Result;
use crate::executor::ExecCtx;
use crate::model::{Model, Target};
use crate::paths::Paths;
use crate::report::Reporter;

/// What the installed git can do. Sources are tracked as submodules of the
/// environment repository, so the update flags depend on the git version.
#[derive(Debug, Clone, Copy)]
pub struct GitCaps {
    /// `--depth` on submodule update, git >= 1.8.4.
    pub shallow: bool,
    /// `--remote` on submodule update, git >= 1.8.1.6.
    pub remote: bool,
}

pub fn probe_git_caps(report: &Reporter) -> GitCaps {
    let version = Command::new("git")
        .arg("--version")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| parse_git_version(&String::from_utf8_lossy(&o.stdout)));

    let caps = match version {
        Some(v) => GitCaps {
            shallow: version_at_least(&v, &[1, 8, 4]),
            remote: version_at_least(&v, &[1, 8, 1, 6]),
        },
        None => GitCaps {
            shallow: false,
            remote: false,
        },
    };
    if !caps.shallow {
        report.warn("git does not support shallow submodule fetches, full history will be downloaded");
    }
    caps
}

pub fn parse_git_version(s: &str) -> Option<Vec<u32>> {
    let token = s.split_whitespace().find(|t| {
        t.chars().next().is_some_and(|c| c.is_ascii_digit())
    })?;
    let parts: Vec<u32> = token
        .split('.')
        .map_while(|p| p.parse().ok())
        .collect();
    if parts.is_empty() { None } else { Some(parts) }
}

pub fn version_at_least(version: &[u32], min: &[u32]) -> bool {
    for i in 0..min.len().max(version.len()) {
        let v = version.get(i).copied().unwrap_or(0);
        let m = min.get(i).copied().unwrap_or(0);
        if v != m {
            return v > m;
        }
    }
    true
}

/// Fetch every selected target in execution order. A failed fetch marks the
/// target broken and drops it from the build; the run continues.
pub fn fetch_all(ctx: &ExecCtx, model: &mut Model, paths: &Paths, config_dir: &Path) {
    let caps = probe_git_caps(&ctx.report);
    for name in model.ordered_names() {
        if ctx.cancelled() {
            return;
        }
        let Some(t) = model.targets.get(&name) else {
            continue;
        };
        if !t.fetch || t.prefetched {
            continue;
        }
        ctx.report.info(&format!("fetching '{name}'"));
        if let Err(e) = fetch_target(ctx, t, paths, config_dir, &caps) {
            ctx.report
                .error(&format!("fetching '{name}' failed: {e}"));
            if let Some(t) = model.targets.get_mut(&name) {
                t.build_error = true;
                t.build = false;
            }
        }
    }
}

fn fetch_target(
    ctx: &ExecCtx,
    t: &Target,
    paths: &Paths,
    config_dir: &Path,
    caps: &GitCaps,
) -> Result<()> {
    let repo_dir = paths.sources_root.join(&t.repository);
    let rel = repo_dir
        .strip_prefix(&paths.root)
        .unwrap_or(&repo_dir)
        .display()
        .to_string();
    let label = format!("fetch {}", t.name);

    ctx.run_shell(
        &label,
        &format!("git submodule init -- {rel}"),
        &paths.root,
        None,
    )?;

    let mut update = String::from("git submodule update");
    if caps.remote {
        update.push_str(" --remote");
    }
    if caps.shallow && !t.fetch_history {
        update.push_str(" --depth 1");
    }
    update.push_str(&format!(" -- {rel}"));
    ctx.run_shell(&label, &update, &paths.root, None)?;

    if let Some(branch) = &t.branch {
        ctx.run_shell(&label, &format!("git fetch origin {branch}"), &repo_dir, None)?;
        ctx.run_shell(&label, "git checkout FETCH_HEAD", &repo_dir, None)?;
    }

    if let Some(script) = t.scripts.get("postfetch") {
        let script_path = config_dir.join(script);
        ctx.run_shell(
            &label,
            &format!("sh {}", script_path.display()),
            &repo_dir,
            None,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_git_version_strings() {
        assert_eq!(
            parse_git_version("git version 2.39.2"),
            Some(vec![2, 39, 2])
        );
        assert_eq!(
            parse_git_version("git version 1.8.4"),
            Some(vec![1, 8, 4])
        );
        assert_eq!(parse_git_version("no digits here"), None);
    }

    #[test]
    fn version_comparison_handles_unequal_lengths() {
        assert!(version_at_least(&[1, 8, 4], &[1, 8, 4]));
        assert!(version_at_least(&[2, 0], &[1, 8, 4]));
        assert!(!version_at_least(&[1, 8], &[1, 8, 1, 6]));
        assert!(version_at_least(&[1, 8, 2], &[1, 8, 1, 6]));
    }

    #[test]
    fn failed_fetch_clears_build_and_marks_error() {
        use crate::config::ConfigDoc;
        use crate::model::{self, LoadContext};
        use crate::report::Reporter;
        use std::path::PathBuf;
        use std::sync::Arc;

        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path(), "sources", "history");
        let doc = ConfigDoc::from_value(
            PathBuf::from("<mem>"),
            toml::from_str(
                r#"
[targets.uboot]
repository = "u-boot"

[options.uboot]
fetch = true
"#,
            )
            .unwrap(),
        );
        let mut m = model::from_doc(&doc, &LoadContext::default()).unwrap();

        // No git repository at the root, so the submodule commands fail.
        let report = Arc::new(Reporter::default());
        let ctx = ExecCtx::new(false, report.clone());
        fetch_all(&ctx, &mut m, &paths, tmp.path());

        let t = &m.targets["uboot"];
        assert!(t.build_error);
        assert!(!t.build);
        assert!(report.error_count() > 0);
    }
}
