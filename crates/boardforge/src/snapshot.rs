use std::fs;
use std::path::{Path, PathBuf};

use toml::Value;
use toml::value::Table;

use crate::error::{Error, Result};
use crate::model::Model;

/// Snapshot files become path components, so the charset is tight.
pub fn validate_name(name: &str) -> Result<()> {
    let re = regex::Regex::new(r"^[A-Za-z0-9_+-]+$").map_err(|e| Error::msg(e.to_string()))?;
    if re.is_match(name) {
        Ok(())
    } else {
        Err(Error::msg(format!(
            "invalid snapshot name '{name}': only letters, digits, '_', '+' and '-' are allowed"
        )))
    }
}

/// Serialize the resolved selection as one more configuration layer: the
/// per-target option tables, the chosen binary set (with its customized
/// file mapping when it differs from the vendor default), and the project
/// name.
pub fn render(model: &Model) -> Value {
    let mut root = Table::new();

    let mut options = Table::new();
    for t in model.targets.values() {
        let mut o = Table::new();
        o.insert("fetch".into(), Value::Boolean(t.fetch));
        o.insert("build".into(), Value::Boolean(t.build));
        o.insert("fetch_history".into(), Value::Boolean(t.fetch_history));
        o.insert(
            "build_steps".into(),
            step_names(t.sequential_steps.iter().filter(|s| s.enabled)),
        );
        o.insert(
            "parallelbuild_steps".into(),
            step_names(t.parallel_steps.iter().filter(|s| s.enabled)),
        );
        if let Some(order) = &t.step_order {
            o.insert(
                "build_order".into(),
                Value::Array(order.iter().map(|s| Value::String(s.clone())).collect()),
            );
        }
        options.insert(t.name.clone(), Value::Table(o));
    }
    root.insert("options".into(), Value::Table(options));

    let mut binaries = Table::new();
    for b in model.binaries.values() {
        let mut o = Table::new();
        o.insert("chosen".into(), Value::Boolean(b.chosen));
        if b.chosen && b.is_copyfiles_custom() {
            let mut cf = Table::new();
            for c in &b.copy_files {
                cf.insert(c.dst.clone(), Value::String(c.src.clone()));
            }
            o.insert("copyfiles".into(), Value::Table(cf));
            // Carry the vendor mapping too, so a resumed run can still tell
            // custom paths apart from defaults.
            let mut cfd = Table::new();
            for c in &b.copy_files_default {
                cfd.insert(c.dst.clone(), Value::String(c.src.clone()));
            }
            o.insert("copyfiles_default".into(), Value::Table(cfd));
        }
        binaries.insert(b.name.clone(), Value::Table(o));
    }
    if !binaries.is_empty() {
        root.insert("binaries".into(), Value::Table(binaries));
    }

    let mut project = Table::new();
    project.insert("name".into(), Value::String(model.project_name.clone()));
    root.insert("project".into(), Value::Table(project));

    Value::Table(root)
}

fn step_names<'a>(steps: impl Iterator<Item = &'a crate::model::BuildStep>) -> Value {
    Value::Array(steps.map(|s| Value::String(s.name.clone())).collect())
}

pub fn save(model: &Model, history_dir: &Path, name: &str) -> Result<PathBuf> {
    validate_name(name)?;
    fs::create_dir_all(history_dir)?;
    let path = history_dir.join(format!("{name}.toml"));
    let body = toml::to_string_pretty(&render(model))
        .map_err(|e| Error::msg(format!("cannot serialize snapshot: {e}")))?;
    fs::write(&path, body)
        .map_err(|e| Error::msg(format!("cannot write {}: {e}", path.display())))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, ConfigDoc};
    use crate::model::{self, LoadContext};

    const BASE: &str = r#"
[targets.uboot]
repository = "u-boot"

[[targets.uboot.build]]
name = "defconfig"
cmd = "make defconfig"

[[targets.uboot.build]]
name = "compile"
cmd = "make"

[binaries.fpga]
description = "FPGA bundle"
url = "https://example.invalid/fpga.tar.gz"
unpack = true
default = true

[binaries.fpga.copyfiles]
"fpga.bit" = "bitstream/fpga.bit"

[project]
name = "demo_board"
"#;

    #[test]
    fn names_are_validated() {
        assert!(validate_name("board_v2+test-1").is_ok());
        assert!(validate_name("over/there").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name("white space").is_err());
    }

    #[test]
    fn snapshot_round_trips_through_the_layer_merge() {
        let mut base: toml::Value = toml::from_str(BASE).unwrap();
        let doc = ConfigDoc::from_value(std::path::PathBuf::from("<mem>"), base.clone());
        let mut m = model::from_doc(&doc, &LoadContext::default()).unwrap();

        // Resolve a selection: build uboot, disable its defconfig step,
        // choose and customize the binary set.
        crate::selection::set_build(&mut m, "uboot", true).unwrap();
        m.set_chosen_binary("FPGA bundle").unwrap();
        assert!(m.set_binary_copyfile("fpga.bit", "/srv/my/fpga.bit"));
        for s in &mut m.targets.get_mut("uboot").unwrap().sequential_steps {
            if s.name == "defconfig" {
                s.enabled = false;
            }
        }

        let snap = render(&m);

        // Resume: merge the snapshot over the base layer and reload.
        config::merge(&mut base, snap);
        let doc = ConfigDoc::from_value(std::path::PathBuf::from("<mem>"), base);
        let restored = model::from_doc(
            &doc,
            &LoadContext {
                used_previous_config: true,
                ..LoadContext::default()
            },
        )
        .unwrap();

        let t = &restored.targets["uboot"];
        assert!(t.build);
        assert!(!t.fetch);
        let def = t.sequential_steps.iter().find(|s| s.name == "defconfig").unwrap();
        let compile = t.sequential_steps.iter().find(|s| s.name == "compile").unwrap();
        assert!(!def.enabled);
        assert!(compile.enabled);

        let b = &restored.binaries["fpga"];
        assert!(b.chosen);
        assert_eq!(b.copy_files[0].src, "/srv/my/fpga.bit");
        // The customized mapping is what the resumed run loaded, so it no
        // longer counts as an in-run modification.
        assert!(!b.is_copyfiles_modified());
        assert!(b.is_copyfiles_custom());
    }

    #[test]
    fn save_writes_under_history_dir() {
        let doc = ConfigDoc::from_value(
            std::path::PathBuf::from("<mem>"),
            toml::from_str(BASE).unwrap(),
        );
        let m = model::from_doc(&doc, &LoadContext::default()).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let path = save(&m, tmp.path(), "nightly-1").unwrap();
        assert_eq!(path, tmp.path().join("nightly-1.toml"));
        let body = fs::read_to_string(path).unwrap();
        assert!(body.contains("[options.uboot]"));
        assert!(body.contains("demo_board"));
    }
}
