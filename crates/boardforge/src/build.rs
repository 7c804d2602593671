use std::fs;
use std::path::{Path, PathBuf};

use crate::devtree;
use crate::error::{Error, Result};
use crate::executor::{self, ExecCtx};
use crate::model::{BuildStep, Model, Target};
use crate::paths::Paths;

pub struct BuildOpts<'a> {
    /// Job count for parallel steps; sequential steps never get one.
    pub jobs: usize,
    /// Expansion of `${OUTDIR}` in step commands.
    pub out_dir: PathBuf,
    /// Directory the layered configuration was loaded from; patches and
    /// lifecycle scripts live next to it.
    pub config_dir: &'a Path,
    /// Resolved toolchain directories, prepended to the child PATH.
    pub toolchain_dirs: &'a [PathBuf],
}

/// Build every selected target in execution order. Failures are per-target:
/// the target is marked broken and the run moves on.
pub fn build_all(ctx: &ExecCtx, model: &mut Model, paths: &Paths, opts: &BuildOpts) {
    let path_value = executor::prepend_path(opts.toolchain_dirs);

    for name in model.ordered_names() {
        if ctx.cancelled() {
            return;
        }
        let Some(t) = model.targets.get(&name) else {
            continue;
        };
        if !t.build {
            ctx.report.info(&format!("skipping build of '{name}'"));
            continue;
        }
        ctx.report.info(&format!("building '{name}'"));

        let extra_fragments = model
            .chosen_binary()
            .and_then(|b| b.devicetree.get(&name).cloned())
            .unwrap_or_default();

        let failed = build_target(ctx, t, &extra_fragments, paths, opts, &path_value).is_err();
        if failed
            && let Some(t) = model.targets.get_mut(&name)
        {
            t.build = false;
            t.build_error = true;
        }
    }
}

fn build_target(
    ctx: &ExecCtx,
    t: &Target,
    extra_fragments: &[String],
    paths: &Paths,
    opts: &BuildOpts,
    path_value: &std::ffi::OsString,
) -> Result<()> {
    let repo_dir = paths.sources_root.join(&t.repository);
    let label = format!("build {}", t.name);

    if !t.patches.is_empty() {
        apply_patches(ctx, t, &repo_dir, opts.config_dir)?;
    }

    devtree::assemble(&ctx.report, t, extra_fragments, &repo_dir);

    if !ctx.dry_run && !repo_dir.join(".git").exists() {
        let msg = format!("target '{}' is selected for build but not fetched", t.name);
        ctx.report.error(&msg);
        return Err(Error::msg(msg));
    }

    if let Some(script) = t.scripts.get("prebuild") {
        run_script(ctx, &label, script, &repo_dir, opts.config_dir, path_value)
            .inspect_err(|e| ctx.report.error(&format!("prebuild for '{}' failed: {e}", t.name)))?;
    }

    let result = match &t.step_order {
        Some(order) => run_ordered_steps(ctx, t, order, &repo_dir, opts, path_value),
        None => run_default_steps(ctx, t, &repo_dir, opts, path_value),
    };
    result?;

    if let Some(script) = t.scripts.get("postbuild") {
        run_script(ctx, &label, script, &repo_dir, opts.config_dir, path_value)
            .inspect_err(|e| ctx.report.error(&format!("postbuild for '{}' failed: {e}", t.name)))?;
    }
    Ok(())
}

/// A patch file already present in the tree means the sources were patched
/// by an earlier run; applying it again would fail.
fn apply_patches(ctx: &ExecCtx, t: &Target, repo_dir: &Path, config_dir: &Path) -> Result<()> {
    for patch in &t.patches {
        let in_tree = repo_dir.join(patch);
        if in_tree.is_file() {
            continue;
        }
        if ctx.dry_run {
            ctx.report
                .info(&format!("[build {}] DRY-RUN: apply patch {patch}", t.name));
            continue;
        }
        fs::copy(config_dir.join(patch), &in_tree).map_err(|e| {
            let msg = format!("cannot copy patch '{patch}' for '{}': {e}", t.name);
            ctx.report.error(&msg);
            Error::msg(msg)
        })?;
        ctx.run_shell(
            &format!("patch {}", t.name),
            &format!("git apply {patch}"),
            repo_dir,
            None,
        )
        .inspect_err(|e| {
            ctx.report
                .error(&format!("patch '{patch}' failed on '{}': {e}", t.name));
        })?;
    }
    Ok(())
}

fn run_script(
    ctx: &ExecCtx,
    label: &str,
    script: &str,
    repo_dir: &Path,
    config_dir: &Path,
    path_value: &std::ffi::OsString,
) -> Result<()> {
    let script_path = config_dir.join(script);
    ctx.run_shell(
        label,
        &format!("sh {}", script_path.display()),
        repo_dir,
        Some(path_value),
    )
}

fn run_step(
    ctx: &ExecCtx,
    t: &Target,
    step: &BuildStep,
    parallel: bool,
    repo_dir: &Path,
    opts: &BuildOpts,
    path_value: &std::ffi::OsString,
) -> Result<()> {
    let mut line = step.cmd.replace("${OUTDIR}", &opts.out_dir.display().to_string());
    if parallel {
        line = executor::with_jobs(&line, opts.jobs);
    }
    ctx.run_shell(&step.id, &line, repo_dir, Some(path_value))
        .inspect_err(|e| {
            ctx.report
                .error(&format!("step '{}' of '{}' failed: {e}", step.name, t.name));
        })
}

fn run_default_steps(
    ctx: &ExecCtx,
    t: &Target,
    repo_dir: &Path,
    opts: &BuildOpts,
    path_value: &std::ffi::OsString,
) -> Result<()> {
    for step in t.parallel_steps.iter().filter(|s| s.enabled) {
        run_step(ctx, t, step, true, repo_dir, opts, path_value)?;
    }
    for step in t.sequential_steps.iter().filter(|s| s.enabled) {
        run_step(ctx, t, step, false, repo_dir, opts, path_value)?;
    }
    Ok(())
}

/// An explicit order may interleave parallel and sequential steps. Unknown
/// entries are reported per entry; a partial covering only warns.
fn run_ordered_steps(
    ctx: &ExecCtx,
    t: &Target,
    order: &[String],
    repo_dir: &Path,
    opts: &BuildOpts,
    path_value: &std::ffi::OsString,
) -> Result<()> {
    let mut covered_parallel = 0usize;
    let mut covered_sequential = 0usize;

    for entry in order {
        if let Some(step) = t.parallel_steps.iter().find(|s| &s.name == entry) {
            covered_parallel += 1;
            if step.enabled {
                run_step(ctx, t, step, true, repo_dir, opts, path_value)?;
            }
            continue;
        }
        if let Some(step) = t.sequential_steps.iter().find(|s| &s.name == entry) {
            covered_sequential += 1;
            if step.enabled {
                run_step(ctx, t, step, false, repo_dir, opts, path_value)?;
            }
            continue;
        }
        ctx.report.error(&format!(
            "undefined step '{entry}' referenced in the build order of '{}'",
            t.name
        ));
    }

    if covered_parallel < t.parallel_steps.len() {
        ctx.report.warn(&format!(
            "not all parallel build steps of '{}' are covered by its build order",
            t.name
        ));
    }
    if covered_sequential < t.sequential_steps.len() {
        ctx.report.warn(&format!(
            "not all build steps of '{}' are covered by its build order",
            t.name
        ));
    }
    Ok(())
}
