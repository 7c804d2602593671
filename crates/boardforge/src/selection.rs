use crate::error::{Error, Result};
use crate::model::Model;

/// Which flag a disable cascade acts on. A target fetched in this run may
/// still disable another target's build, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetch,
    Build,
}

fn unknown_target(model: &Model, name: &str) -> Error {
    let known = model.ordered_names().join(", ");
    Error::msg(format!("unknown target '{name}' (available: {known})"))
}

/// Select a target for fetching. Fetch implies build.
pub fn set_fetch(model: &mut Model, name: &str, value: bool) -> Result<()> {
    ensure_known(model, name)?;
    if let Some(t) = model.targets.get_mut(name) {
        t.fetch = value;
        if value {
            t.build = true;
        }
    }
    apply_disable_cascade(model, Phase::Fetch);
    apply_disable_cascade(model, Phase::Build);
    Ok(())
}

/// Select a target for building.
pub fn set_build(model: &mut Model, name: &str, value: bool) -> Result<()> {
    ensure_known(model, name)?;
    if let Some(t) = model.targets.get_mut(name) {
        t.build = value;
    }
    apply_disable_cascade(model, Phase::Build);
    Ok(())
}

/// Select exactly the given targets for fetching: listed targets get the
/// flag, every other target loses it. Fetch implies build.
pub fn select_fetch_targets(model: &mut Model, names: &[String]) -> Result<()> {
    for name in names {
        ensure_known(model, name)?;
    }
    for (name, t) in model.targets.iter_mut() {
        t.disabled_fetch = false;
        t.fetch = names.iter().any(|n| n == name);
        if t.fetch {
            t.disabled_build = false;
            t.build = true;
        }
    }
    apply_disable_cascade(model, Phase::Fetch);
    apply_disable_cascade(model, Phase::Build);
    Ok(())
}

/// Select exactly the given targets for building. Targets selected for
/// fetching keep their implied build; everything else is cleared, including
/// flags seeded by an options layer.
pub fn select_build_targets(model: &mut Model, names: &[String]) -> Result<()> {
    for name in names {
        ensure_known(model, name)?;
    }
    for (name, t) in model.targets.iter_mut() {
        t.disabled_build = false;
        t.build = t.fetch || names.iter().any(|n| n == name);
    }
    apply_disable_cascade(model, Phase::Build);
    Ok(())
}

pub fn set_fetch_history(model: &mut Model, name: &str, value: bool) -> Result<()> {
    ensure_known(model, name)?;
    if let Some(t) = model.targets.get_mut(name) {
        t.fetch_history = value;
    }
    Ok(())
}

/// With no explicit selection, every `active` target is fetched and built
/// (prefetched targets are only built).
pub fn set_active_defaults(model: &mut Model) {
    for name in model.ordered_names() {
        if let Some(t) = model.targets.get_mut(&name)
            && t.active
        {
            t.build = true;
            t.fetch = !t.prefetched;
        }
    }
    apply_disable_cascade(model, Phase::Fetch);
    apply_disable_cascade(model, Phase::Build);
}

/// One-level disable cascade, applied in execution order: a selected target
/// that names another in `disables` clears that target's flag for the given
/// phase and marks it so the UI/summary can tell it was overridden. Disabled
/// targets do not cascade further.
pub fn apply_disable_cascade(model: &mut Model, phase: Phase) {
    let order = model.ordered_names();

    // Reset previous marks so repeated resolution is idempotent.
    for t in model.targets.values_mut() {
        match phase {
            Phase::Fetch => {
                if t.disabled_fetch {
                    t.disabled_fetch = false;
                    t.fetch = true;
                }
            }
            Phase::Build => {
                if t.disabled_build {
                    t.disabled_build = false;
                    t.build = true;
                }
            }
        }
    }

    for name in order {
        let Some(t) = model.targets.get(&name) else {
            continue;
        };
        let selected = match phase {
            Phase::Fetch => t.fetch && !t.disabled_fetch,
            Phase::Build => t.build && !t.disabled_build,
        };
        let Some(victim) = t.disables.clone() else {
            continue;
        };
        if !selected {
            continue;
        }
        if let Some(v) = model.targets.get_mut(&victim) {
            match phase {
                Phase::Fetch => {
                    if v.fetch {
                        v.fetch = false;
                        v.disabled_fetch = true;
                    }
                }
                Phase::Build => {
                    if v.build {
                        v.build = false;
                        v.disabled_build = true;
                    }
                }
            }
        }
    }
}

/// Return the step ids from `names` that match no configured step.
pub fn validate_step_names(model: &Model, names: &[String]) -> Vec<String> {
    names
        .iter()
        .filter(|n| {
            !model
                .targets
                .values()
                .flat_map(|t| t.steps())
                .any(|s| &s.id == *n)
        })
        .cloned()
        .collect()
}

/// Enable exactly the steps whose id is listed, disabling the rest. When
/// `scope` is given, only steps whose name contains it are touched, so a
/// partial list leaves unrelated steps alone.
pub fn set_steps_enabled(model: &mut Model, enabled: &[String], scope: Option<&str>) {
    for t in model.targets.values_mut() {
        for s in t.parallel_steps.iter_mut().chain(t.sequential_steps.iter_mut()) {
            if let Some(scope) = scope
                && !s.name.contains(scope)
            {
                continue;
            }
            s.enabled = enabled.iter().any(|n| n == &s.id);
        }
    }
}

pub fn is_valid_target(model: &Model, name: &str) -> bool {
    model.targets.contains_key(name)
}

pub fn ensure_known(model: &Model, name: &str) -> Result<()> {
    if is_valid_target(model, name) {
        Ok(())
    } else {
        Err(unknown_target(model, name))
    }
}
