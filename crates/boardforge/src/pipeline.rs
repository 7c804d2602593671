use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::binaries;
use crate::bootimage;
use crate::build::{self, BuildOpts};
use crate::config;
use crate::error::{Error, Result};
use crate::executor::{self, ExecCtx};
use crate::fetch;
use crate::materialize;
use crate::model::{self, LoadContext, Model};
use crate::paths::Paths;
use crate::report::Reporter;
use crate::selection;
use crate::snapshot;
use crate::summary;
use crate::toolchain;

const LAYER_FILE: &str = "build.toml";
const MASTER_FILE: &str = "boardforge.toml";

/// Everything one `run` invocation was asked to do.
#[derive(Debug, Default, Clone)]
pub struct RunRequest {
    pub device: String,
    pub exclude: Vec<String>,
    pub fetch: Vec<String>,
    pub build: Vec<String>,
    pub fetch_history: Vec<String>,
    pub steps: Vec<String>,
    pub binary_set: Option<String>,
    pub custom_binaries: Vec<(String, String)>,
    pub jobs: Option<usize>,
    pub dry_run: bool,
    pub save: Option<String>,
    pub resume_snapshot: Option<PathBuf>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub warnings: usize,
    pub errors: usize,
    pub summary: String,
}

/// Devices are the leaves of the targets tree: directories that carry a
/// layer file and contain no deeper one.
pub fn list_devices(targets_root: &Path) -> Result<Vec<String>> {
    if !targets_root.is_dir() {
        return Err(Error::msg(format!(
            "no targets directory at {}",
            targets_root.display()
        )));
    }
    let mut configured: Vec<PathBuf> = Vec::new();
    for entry in walkdir::WalkDir::new(targets_root) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        if entry.file_type().is_dir() && entry.path().join(LAYER_FILE).is_file() {
            configured.push(entry.path().to_path_buf());
        }
    }
    let mut devices: Vec<String> = configured
        .iter()
        .filter(|d| !configured.iter().any(|o| o != *d && o.starts_with(d)))
        .filter_map(|d| d.strip_prefix(targets_root).ok())
        .filter(|rel| !rel.as_os_str().is_empty())
        .map(|rel| rel.to_string_lossy().into_owned())
        .collect();
    devices.sort();
    Ok(devices)
}

/// Collect the layer files along a device path, root first. Every path
/// component must exist; at least one layer file must be found.
pub fn device_layers(targets_root: &Path, device: &str) -> Result<Vec<PathBuf>> {
    let mut dir = targets_root.to_path_buf();
    let mut layers = Vec::new();
    if dir.join(LAYER_FILE).is_file() {
        layers.push(dir.join(LAYER_FILE));
    }
    for comp in device.split('/').filter(|c| !c.is_empty()) {
        if comp == ".." {
            return Err(Error::msg(format!("invalid device path '{device}'")));
        }
        dir = dir.join(comp);
        if !dir.is_dir() {
            return Err(Error::msg(format!(
                "unknown device '{device}': {} does not exist",
                dir.display()
            )));
        }
        let layer = dir.join(LAYER_FILE);
        if layer.is_file() {
            layers.push(layer);
        }
    }
    if layers.is_empty() {
        return Err(Error::msg(format!(
            "device '{device}' has no {LAYER_FILE} anywhere on its path"
        )));
    }
    Ok(layers)
}

/// Load the merged model for a device, without resolving any selection.
pub fn load_device_model(root: &Path, device: &str, snapshot_layer: Option<&Path>) -> Result<(Model, PathBuf)> {
    let master = config::load_master(&root.join(MASTER_FILE))?;
    let paths = Paths::new(root, &master.general.sources_dir, &master.general.history_dir);

    let mut layer_files = device_layers(&paths.targets_root, device)?;
    if let Some(snap) = snapshot_layer {
        layer_files.push(snap.to_path_buf());
    }
    let doc = config::load_layers(&layer_files)?;
    let config_dir = doc
        .path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.to_path_buf());

    let ctx = LoadContext {
        sources_root: paths.sources_root.clone(),
        used_previous_config: snapshot_layer.is_some(),
        release: None,
    };
    let model = model::from_doc(&doc, &ctx)?;
    Ok((model, config_dir))
}

fn apply_selection(model: &mut Model, req: &RunRequest) -> Result<()> {
    // An explicit list replaces the whole selection, including flags seeded
    // by an options layer.
    let explicit = !req.fetch.is_empty() || !req.build.is_empty();
    if explicit {
        selection::select_fetch_targets(model, &req.fetch)?;
        selection::select_build_targets(model, &req.build)?;
    } else if req.resume_snapshot.is_none() {
        selection::set_active_defaults(model);
    }
    for name in &req.fetch_history {
        selection::set_fetch_history(model, name, true)?;
    }
    for name in &req.exclude {
        selection::ensure_known(model, name)?;
        selection::set_fetch(model, name, false)?;
        selection::set_build(model, name, false)?;
    }

    if !req.steps.is_empty() {
        let unknown = selection::validate_step_names(model, &req.steps);
        if !unknown.is_empty() {
            return Err(Error::msg(format!(
                "unknown build steps: {}",
                unknown.join(", ")
            )));
        }
        selection::set_steps_enabled(model, &req.steps, None);
    }

    let wanted = req
        .binary_set
        .clone()
        .or_else(|| {
            if model.chosen_binary().is_some() {
                None
            } else {
                model.default_binary_description()
            }
        });
    if let Some(desc) = wanted {
        model.set_chosen_binary(&desc)?;
    }
    for (dst, path) in &req.custom_binaries {
        if !model.set_binary_copyfile(dst, path) {
            return Err(Error::msg(format!(
                "no file '{dst}' in the chosen binary set"
            )));
        }
    }
    Ok(())
}

/// Execute the whole pipeline for one device. Configuration problems are
/// returned as `Err`; per-target failures only raise the error count.
pub fn run(root: &Path, req: &RunRequest) -> Result<RunOutcome> {
    let master = config::load_master(&root.join(MASTER_FILE))?;
    let paths = Paths::new(root, &master.general.sources_dir, &master.general.history_dir);
    paths.ensure_run_dirs()?;

    // A resumed run reads its device from the snapshot's project table.
    let device = match &req.resume_snapshot {
        Some(snap) => {
            let doc = config::load(snap)?;
            doc.value_path("project.name")
                .and_then(toml::Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::msg(format!("{} carries no project name", snap.display()))
                })?
        }
        None => req.device.clone(),
    };

    let (mut model, config_dir) =
        load_device_model(root, &device, req.resume_snapshot.as_deref())?;
    model.project_name = device.clone();
    apply_selection(&mut model, req)?;

    let report = Arc::new(Reporter::default());
    let ctx = ExecCtx::new(req.dry_run, report.clone());
    executor::install_interrupt_handler();

    fetch::fetch_all(&ctx, &mut model, &paths, &config_dir);

    if !model.fetch_only_run() {
        let toolchain_dirs = toolchain::acquire_all(&ctx, &master, &model.toolchains, &paths)?;
        let jobs = req.jobs.unwrap_or_else(|| master.general.jobs.resolve());

        let opts = BuildOpts {
            jobs,
            out_dir: paths.out_dir.clone(),
            config_dir: &config_dir,
            toolchain_dirs: &toolchain_dirs,
        };
        build::build_all(&ctx, &mut model, &paths, &opts);

        binaries::acquire_all(&ctx, &mut model, &paths.binaries_cache);
        materialize::copy_target_outputs(&report, &model, &paths.sources_root, &paths.out_dir);
        materialize::copy_binary_outputs(&report, &model, &paths.out_dir);
        bootimage::generate_all(&ctx, &model, &paths.out_dir, &toolchain_dirs);
    } else {
        materialize::copy_target_outputs(&report, &model, &paths.sources_root, &paths.out_dir);
    }

    if ctx.cancelled() {
        ctx.kill_running_children();
        report.warn("run interrupted");
    }

    if let Some(name) = &req.save {
        let path = snapshot::save(&model, &paths.history_dir, name)?;
        report.info(&format!("selection saved to {}", path.display()));
    }

    Ok(RunOutcome {
        warnings: report.warning_count(),
        errors: report.error_count(),
        summary: summary::render(&model, &device),
    })
}

/// Run the configured clean command of each requested target inside its
/// repository. Targets without one only warn.
pub fn clean(root: &Path, device: &str, targets: Option<&[String]>) -> Result<RunOutcome> {
    let master = config::load_master(&root.join(MASTER_FILE))?;
    let paths = Paths::new(root, &master.general.sources_dir, &master.general.history_dir);
    let (model, _) = load_device_model(root, device, None)?;

    let report = Arc::new(Reporter::default());
    let ctx = ExecCtx::new(false, report.clone());
    executor::install_interrupt_handler();

    let names: Vec<String> = match targets {
        Some(list) => {
            for n in list {
                selection::ensure_known(&model, n)?;
            }
            list.to_vec()
        }
        None => model.ordered_names(),
    };

    for name in names {
        if ctx.cancelled() {
            break;
        }
        let Some(cmd) = model.clean.get(&name) else {
            report.warn(&format!("no clean command configured for '{name}'"));
            continue;
        };
        let Some(t) = model.targets.get(&name) else {
            continue;
        };
        let repo = paths.sources_root.join(&t.repository);
        if !repo.is_dir() {
            report.warn(&format!("'{name}' has no checkout to clean"));
            continue;
        }
        if let Err(e) = ctx.run_shell(&format!("clean {name}"), cmd, &repo, None) {
            report.error(&format!("cleaning '{name}' failed: {e}"));
        }
    }

    Ok(RunOutcome {
        warnings: report.warning_count(),
        errors: report.error_count(),
        summary: String::new(),
    })
}
