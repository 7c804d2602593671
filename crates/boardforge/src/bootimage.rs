use std::fs;
use std::path::{Path, PathBuf};

use crate::executor::{self, ExecCtx};
use crate::model::Model;

/// Generate every configured boot image inside the output directory. An
/// image whose required inputs are incomplete is skipped; a skipped or
/// failed image has its result files removed so no stale image survives.
pub fn generate_all(ctx: &ExecCtx, model: &Model, out_dir: &Path, toolchain_dirs: &[PathBuf]) {
    let path_value = executor::prepend_path(toolchain_dirs);

    for img in model.bootimages.values() {
        if ctx.cancelled() {
            return;
        }

        let missing: Vec<&str> = img
            .required
            .iter()
            .filter(|f| !out_dir.join(f.as_str()).is_file())
            .map(String::as_str)
            .collect();

        let generated = if missing.is_empty() {
            ctx.report.info(&format!("generating boot image '{}'", img.name));
            ctx.run_shell(
                &format!("bootimage {}", img.name),
                &img.cmd,
                out_dir,
                Some(&path_value),
            )
            .inspect_err(|e| {
                ctx.report
                    .error(&format!("error generating boot image '{}': {e}", img.name));
            })
            .is_ok()
        } else {
            ctx.report
                .info(&format!("skipping generation of boot image '{}'", img.name));
            ctx.report
                .info(&format!("the missing files are: {}", missing.join(", ")));
            false
        };

        if generated {
            continue;
        }
        for f in &img.results {
            let p = out_dir.join(f);
            if p.is_file()
                && let Err(e) = fs::remove_file(&p)
            {
                ctx.report
                    .warn(&format!("failed to remove {}: {e}", p.display()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDoc;
    use crate::model::{self, LoadContext};
    use crate::report::Reporter;
    use std::sync::Arc;

    fn model_from(s: &str) -> Model {
        let doc = ConfigDoc::from_value(
            std::path::PathBuf::from("<mem>"),
            toml::from_str(s).unwrap(),
        );
        model::from_doc(&doc, &LoadContext::default()).unwrap()
    }

    const CFG: &str = r#"
[targets.uboot]
repository = "u-boot"

[bootimages."boot.bin"]
cmd = "cat fsbl.elf uboot.img > boot.bin"
required = ["fsbl.elf", "uboot.img"]
results = ["boot.bin"]
"#;

    #[test]
    fn generates_when_all_inputs_present() {
        let m = model_from(CFG);
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("fsbl.elf"), "fsbl").unwrap();
        fs::write(tmp.path().join("uboot.img"), "uboot").unwrap();

        let ctx = ExecCtx::new(false, Arc::new(Reporter::default()));
        generate_all(&ctx, &m, tmp.path(), &[]);
        assert_eq!(
            fs::read_to_string(tmp.path().join("boot.bin")).unwrap(),
            "fsbluboot"
        );
    }

    #[test]
    fn missing_inputs_skip_and_scrub_previous_results() {
        let m = model_from(CFG);
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("fsbl.elf"), "fsbl").unwrap();
        // uboot.img is missing; boot.bin is a leftover of an older run.
        fs::write(tmp.path().join("boot.bin"), "stale").unwrap();

        let report = Arc::new(Reporter::default());
        let ctx = ExecCtx::new(false, report.clone());
        generate_all(&ctx, &m, tmp.path(), &[]);

        assert!(!tmp.path().join("boot.bin").exists());
        assert_eq!(report.error_count(), 0);
    }

    #[test]
    fn failed_command_scrubs_results_and_counts_an_error() {
        let m = model_from(
            r#"
[targets.uboot]
repository = "u-boot"

[bootimages."boot.bin"]
cmd = "touch boot.bin && false"
required = []
results = ["boot.bin"]
"#,
        );
        let tmp = tempfile::tempdir().unwrap();
        let report = Arc::new(Reporter::default());
        let ctx = ExecCtx::new(false, report.clone());
        generate_all(&ctx, &m, tmp.path(), &[]);

        assert!(!tmp.path().join("boot.bin").exists());
        assert!(report.error_count() > 0);
    }
}
