use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};

pub const DEFAULT_PRIORITY: i64 = 50;

/// One build step. Identity is `"<target> <step>"` so a single step list
/// spanning all targets can be addressed unambiguously.
#[derive(Debug, Clone)]
pub struct BuildStep {
    pub id: String,
    pub name: String,
    pub cmd: String,
    pub enabled: bool,
}

/// Output-relative destination mapped to a source path (relative to the
/// owning repository or binary cache, or absolute when user-customized).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFile {
    pub dst: String,
    pub src: String,
}

#[derive(Debug, Clone)]
pub struct DeviceTreeRule {
    pub path: Option<String>,
    pub fragments: Vec<String>,
}

/// One buildable component backed by a source repository.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub repository: String,
    pub help: String,
    pub priority: i64,
    pub branch: Option<String>,
    pub disables: Option<String>,

    pub active: bool,
    pub fetch: bool,
    pub build: bool,
    pub fetch_history: bool,
    pub prefetched: bool,
    pub disabled_fetch: bool,
    pub disabled_build: bool,
    pub build_error: bool,

    pub parallel_steps: Vec<BuildStep>,
    pub sequential_steps: Vec<BuildStep>,
    pub step_order: Option<Vec<String>>,

    pub patches: Vec<String>,
    pub copy_files: Vec<CopyFile>,
    pub scripts: BTreeMap<String, String>,
    pub devicetree: Option<DeviceTreeRule>,
}

impl Target {
    pub fn steps(&self) -> impl Iterator<Item = &BuildStep> {
        self.parallel_steps.iter().chain(self.sequential_steps.iter())
    }
}

/// One named prebuilt artifact bundle. Exactly one is expected to be chosen
/// per run.
#[derive(Debug, Clone)]
pub struct Binary {
    pub name: String,
    pub description: String,
    pub shortname: String,
    pub url: String,
    pub unpack: bool,
    pub force_download: bool,
    pub default: bool,
    pub chosen: bool,

    pub copy_files: Vec<CopyFile>,
    /// Mapping as loaded at model-build time (detects in-run customization).
    pub copy_files_init: Vec<CopyFile>,
    /// Vendor-shipped mapping ("reset to default" source).
    pub copy_files_default: Vec<CopyFile>,

    /// Per-target device-tree fragment contributions.
    pub devicetree: BTreeMap<String, Vec<String>>,

    /// Local cache directory, present only after successful acquisition.
    pub path: Option<PathBuf>,
}

impl Binary {
    pub fn is_copyfiles_modified(&self) -> bool {
        self.copy_files != self.copy_files_init
    }

    pub fn is_copyfiles_custom(&self) -> bool {
        self.copy_files != self.copy_files_default
    }

    /// True when every mapped source is an absolute path; nothing to
    /// download in that case.
    pub fn is_all_custom(&self) -> bool {
        !self.copy_files.is_empty()
            && self
                .copy_files
                .iter()
                .all(|cf| Path::new(&cf.src).is_absolute())
    }
}

/// Post-build assembly step gated on required inputs.
#[derive(Debug, Clone)]
pub struct BootImage {
    pub name: String,
    pub cmd: String,
    pub required: Vec<String>,
    pub results: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Model {
    pub project_name: String,
    pub toolchains: Vec<String>,
    pub targets: BTreeMap<String, Target>,
    pub binaries: BTreeMap<String, Binary>,
    pub bootimages: BTreeMap<String, BootImage>,
    pub clean: BTreeMap<String, String>,
}

impl Model {
    /// Target names in execution order: ascending priority, name as the
    /// stable tie-break. Never depends on map insertion order.
    pub fn ordered_names(&self) -> Vec<String> {
        let mut names: Vec<&Target> = self.targets.values().collect();
        names.sort_by(|a, b| (a.priority, a.name.as_str()).cmp(&(b.priority, b.name.as_str())));
        names.into_iter().map(|t| t.name.clone()).collect()
    }

    pub fn chosen_binary(&self) -> Option<&Binary> {
        self.binaries.values().find(|b| b.chosen)
    }

    pub fn chosen_binary_mut(&mut self) -> Option<&mut Binary> {
        self.binaries.values_mut().find(|b| b.chosen)
    }

    pub fn default_binary_description(&self) -> Option<String> {
        self.binaries
            .values()
            .find(|b| b.default)
            .map(|b| b.description.clone())
    }

    /// Mark exactly the binary set with the given description as chosen.
    /// Unknown descriptions are a configuration error.
    pub fn set_chosen_binary(&mut self, description: &str) -> Result<()> {
        if !self.binaries.values().any(|b| b.description == description) {
            let known = self
                .binaries
                .values()
                .map(|b| b.description.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(Error::msg(format!(
                "unknown binary set '{description}' (available: {known})"
            )));
        }
        for b in self.binaries.values_mut() {
            b.chosen = b.description == description;
        }
        Ok(())
    }

    /// Replace the source path of one copy-file in the chosen binary set.
    pub fn set_binary_copyfile(&mut self, dst: &str, new_src: &str) -> bool {
        if let Some(b) = self.chosen_binary_mut() {
            for cf in &mut b.copy_files {
                if cf.dst == dst {
                    cf.src = new_src.to_string();
                    return true;
                }
            }
        }
        false
    }

    /// A run with nothing selected to build performs no binary acquisition
    /// and no materialization.
    pub fn fetch_only_run(&self) -> bool {
        !self.targets.values().any(|t| t.build)
    }

    pub fn is_target_configured(&self, sources_root: &Path, name: &str) -> bool {
        self.targets
            .get(name)
            .map(|t| sources_root.join(&t.repository).join(".config").is_file())
            .unwrap_or(false)
    }
}

/// Context the loader needs beyond the merged document.
#[derive(Debug, Clone, Default)]
pub struct LoadContext {
    pub sources_root: PathBuf,
    /// True when the bottom layer is a previously saved selection snapshot.
    pub used_previous_config: bool,
    /// Default branch for targets without an explicit one.
    pub release: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStep {
    name: String,
    cmd: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPatches {
    files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDeviceTree {
    path: Option<String>,
    fragments: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTarget {
    repository: Option<String>,
    priority: Option<Value>,
    active: Option<bool>,
    branch: Option<String>,
    disables: Option<String>,
    description: Option<String>,
    build: Vec<RawStep>,
    parallelbuild: Vec<RawStep>,
    copyfiles: BTreeMap<String, String>,
    scripts: BTreeMap<String, String>,
    patches: RawPatches,
    devicetree: Option<RawDeviceTree>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOptions {
    fetch: Option<bool>,
    build: Option<bool>,
    fetch_history: Option<bool>,
    prefetched: Option<bool>,
    build_steps: Option<Vec<String>>,
    parallelbuild_steps: Option<Vec<String>>,
    build_order: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBinary {
    description: Option<String>,
    shortname: Option<String>,
    url: Option<String>,
    unpack: Option<bool>,
    force_download: bool,
    default: bool,
    chosen: bool,
    copyfiles: BTreeMap<String, String>,
    copyfiles_default: Option<BTreeMap<String, String>>,
    devicetree: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBootImage {
    cmd: Option<String>,
    required: Vec<String>,
    results: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawProject {
    name: Option<String>,
}

fn copyfiles_vec(map: &BTreeMap<String, String>) -> Vec<CopyFile> {
    map.iter()
        .map(|(dst, src)| CopyFile {
            dst: dst.clone(),
            src: src.clone(),
        })
        .collect()
}

fn missing_key(section: &str, key: &str) -> Error {
    Error::msg(format!("section '{section}' is missing a '{key}' key"))
}

fn build_steps(
    target: &str,
    raw: &[RawStep],
    enabled_list: Option<&[String]>,
    defconfig_off: bool,
) -> Vec<BuildStep> {
    raw.iter()
        .map(|s| {
            let enabled = match enabled_list {
                Some(list) => list.iter().any(|n| n == &s.name),
                // Never re-run the configuration step of an already
                // configured tree when resuming a saved selection.
                None => !(defconfig_off && s.name.contains("defconfig")),
            };
            BuildStep {
                id: format!("{} {}", target, s.name),
                name: s.name.clone(),
                cmd: s.cmd.clone(),
                enabled,
            }
        })
        .collect()
}

/// Build the in-memory model from a merged configuration document.
/// Strict: any missing required key fails the whole load.
pub fn from_doc(doc: &ConfigDoc, ctx: &LoadContext) -> Result<Model> {
    let toolchains: Vec<String> = doc.deserialize_path("toolchains")?.unwrap_or_default();
    let raw_targets: BTreeMap<String, RawTarget> =
        doc.deserialize_path("targets")?.unwrap_or_default();
    if raw_targets.is_empty() {
        return Err(Error::msg(format!(
            "no targets defined in {}",
            doc.path.display()
        )));
    }
    let raw_options: BTreeMap<String, RawOptions> =
        doc.deserialize_path("options")?.unwrap_or_default();
    let raw_binaries: BTreeMap<String, RawBinary> =
        doc.deserialize_path("binaries")?.unwrap_or_default();
    let raw_bootimages: BTreeMap<String, RawBootImage> =
        doc.deserialize_path("bootimages")?.unwrap_or_default();
    let clean: BTreeMap<String, String> = doc.deserialize_path("clean")?.unwrap_or_default();
    let project: RawProject = doc.deserialize_path("project")?.unwrap_or_default();

    let mut targets = BTreeMap::new();
    for (name, raw) in &raw_targets {
        let repository = raw
            .repository
            .clone()
            .ok_or_else(|| missing_key(&format!("targets.{name}"), "repository"))?;
        let opts = raw_options.get(name).cloned().unwrap_or_default();

        let configured = ctx.sources_root.join(&repository).join(".config").is_file();
        let defconfig_off = ctx.used_previous_config && configured;

        let priority = raw
            .priority
            .as_ref()
            .and_then(Value::as_integer)
            .unwrap_or(DEFAULT_PRIORITY);

        let fetch = opts.fetch.unwrap_or(false);
        let target = Target {
            name: name.clone(),
            repository,
            help: raw.description.clone().unwrap_or_else(|| name.clone()),
            priority,
            branch: raw.branch.clone().or_else(|| ctx.release.clone()),
            disables: raw.disables.clone(),
            active: raw.active.unwrap_or(true),
            fetch,
            // An explicit fetch selection implies build.
            build: opts.build.unwrap_or(false) || fetch,
            fetch_history: opts.fetch_history.unwrap_or(false),
            prefetched: opts.prefetched.unwrap_or(false),
            disabled_fetch: false,
            disabled_build: false,
            build_error: false,
            parallel_steps: build_steps(
                name,
                &raw.parallelbuild,
                opts.parallelbuild_steps.as_deref(),
                defconfig_off,
            ),
            sequential_steps: build_steps(
                name,
                &raw.build,
                opts.build_steps.as_deref(),
                defconfig_off,
            ),
            step_order: opts.build_order.clone(),
            patches: raw.patches.files.clone(),
            copy_files: copyfiles_vec(&raw.copyfiles),
            scripts: raw.scripts.clone(),
            devicetree: raw.devicetree.as_ref().map(|dt| DeviceTreeRule {
                path: dt.path.clone(),
                fragments: dt.fragments.clone(),
            }),
        };
        targets.insert(name.clone(), target);
    }

    // Disable-cascade references must point at known targets.
    for t in targets.values() {
        if let Some(d) = &t.disables
            && !targets.contains_key(d)
        {
            return Err(Error::msg(format!(
                "target '{}' disables unknown target '{}'",
                t.name, d
            )));
        }
    }

    let mut binaries = BTreeMap::new();
    for (name, raw) in &raw_binaries {
        let description = raw
            .description
            .clone()
            .ok_or_else(|| missing_key(&format!("binaries.{name}"), "description"))?;
        let url = raw
            .url
            .clone()
            .ok_or_else(|| missing_key(&format!("binaries.{name}"), "url"))?;
        let unpack = raw
            .unpack
            .ok_or_else(|| missing_key(&format!("binaries.{name}"), "unpack"))?;

        let copy_files = copyfiles_vec(&raw.copyfiles);
        // No vendor default section means the shipped mapping is the default.
        let copy_files_default = raw
            .copyfiles_default
            .as_ref()
            .map(copyfiles_vec)
            .unwrap_or_else(|| copy_files.clone());

        binaries.insert(
            name.clone(),
            Binary {
                name: name.clone(),
                description,
                shortname: raw.shortname.clone().unwrap_or_else(|| name.clone()),
                url,
                unpack,
                force_download: raw.force_download,
                default: raw.default,
                chosen: raw.chosen,
                copy_files_init: copy_files.clone(),
                copy_files,
                copy_files_default,
                devicetree: raw.devicetree.clone(),
                path: None,
            },
        );
    }

    let mut bootimages = BTreeMap::new();
    for (name, raw) in &raw_bootimages {
        let cmd = raw
            .cmd
            .clone()
            .ok_or_else(|| missing_key(&format!("bootimages.{name}"), "cmd"))?;
        bootimages.insert(
            name.clone(),
            BootImage {
                name: name.clone(),
                cmd,
                required: raw.required.clone(),
                results: raw.results.clone(),
            },
        );
    }

    Ok(Model {
        project_name: project.name.unwrap_or_else(|| "unnamed".to_string()),
        toolchains,
        targets,
        binaries,
        bootimages,
        clean,
    })
}
