use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::model::Target;
use crate::report::Reporter;

pub const GENERATED_NAME: &str = "generated.dts";

const VERSION_MARKER: &str = "/dts-v1/;";
// Board-module fragments; included after everything else so they can
// override the base tree.
const MODULE_PREFIXES: [&str; 3] = ["MA-", "ME-", "AM-"];

fn is_module_fragment(name: &str) -> bool {
    MODULE_PREFIXES.iter().any(|p| name.contains(p))
}

fn file_contains(path: &Path, needle: &str) -> bool {
    let Ok(f) = fs::File::open(path) else {
        return false;
    };
    BufReader::new(f)
        .lines()
        .map_while(|l| l.ok())
        .any(|l| l.contains(needle))
}

/// Compute the include order for the generated source: a fragment carrying
/// the dts version marker first (or a synthesized marker line), then plain
/// fragments, then module fragments.
pub fn render(dt_dir: &Path, fragments: &[String]) -> String {
    let mut body = String::new();
    body.push_str("/* Autogenerated file, do not edit. */\n\n");

    let mut rest: Vec<&String> = fragments.iter().collect();
    let versioned = rest
        .iter()
        .position(|f| file_contains(&dt_dir.join(f.as_str()), VERSION_MARKER));
    match versioned {
        Some(idx) => {
            let f = rest.remove(idx);
            body.push_str(&format!("#include \"{f}\"\n"));
        }
        None => body.push_str(&format!("{VERSION_MARKER}\n\n")),
    }

    for f in rest.iter().filter(|f| !is_module_fragment(f)) {
        body.push_str(&format!("#include \"{f}\"\n"));
    }
    for f in rest.iter().filter(|f| is_module_fragment(f)) {
        body.push_str(&format!("#include \"{f}\"\n"));
    }
    body
}

/// Write the assembled device-tree source for one target. `extra_fragments`
/// come from the chosen binary set. Returns the written path, or None when
/// the target has nothing to assemble or the configuration is broken.
pub fn assemble(
    report: &Reporter,
    target: &Target,
    extra_fragments: &[String],
    repo_dir: &Path,
) -> Option<PathBuf> {
    let rule = target.devicetree.as_ref()?;
    let mut fragments = rule.fragments.clone();
    fragments.extend_from_slice(extra_fragments);
    if fragments.is_empty() {
        return None;
    }
    let Some(rel) = rule.path.as_deref().filter(|p| !p.is_empty()) else {
        report.error(&format!(
            "target '{}' has device-tree fragments but no output path",
            target.name
        ));
        return None;
    };

    let dt_dir = repo_dir.join(rel);
    let out = dt_dir.join(GENERATED_NAME);
    let body = render(&dt_dir, &fragments);
    if let Err(e) = fs::write(&out, body) {
        report.error(&format!(
            "cannot write device tree {}: {e}",
            out.display()
        ));
        return None;
    }
    report.ok(&format!(
        "device tree for '{}' written to {}",
        target.name,
        out.display()
    ));
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_fragments_are_ordered_last() {
        let tmp = tempfile::tempdir().unwrap();
        let body = render(
            tmp.path(),
            &[
                "ME-XU8.dtsi".to_string(),
                "zynq-base.dtsi".to_string(),
                "carrier.dtsi".to_string(),
            ],
        );
        let base = body.find("zynq-base.dtsi").unwrap();
        let carrier = body.find("carrier.dtsi").unwrap();
        let module = body.find("ME-XU8.dtsi").unwrap();
        assert!(base < module);
        assert!(carrier < module);
    }

    #[test]
    fn fragment_with_version_marker_comes_first() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("base.dtsi"), "/dts-v1/;\n/ {};\n").unwrap();
        let body = render(
            tmp.path(),
            &["overlay.dtsi".to_string(), "base.dtsi".to_string()],
        );
        // The versioned fragment is hoisted, no synthetic marker is added,
        // and it is included only once.
        assert!(!body.contains("/dts-v1/;\n\n"));
        assert_eq!(body.matches("base.dtsi").count(), 1);
        assert!(body.find("base.dtsi").unwrap() < body.find("overlay.dtsi").unwrap());
    }

    #[test]
    fn marker_is_synthesized_when_no_fragment_carries_it() {
        let tmp = tempfile::tempdir().unwrap();
        let body = render(tmp.path(), &["overlay.dtsi".to_string()]);
        assert!(body.contains("/dts-v1/;"));
        let marker = body.find("/dts-v1/;").unwrap();
        assert!(marker < body.find("overlay.dtsi").unwrap());
    }

    #[test]
    fn fragments_without_output_path_are_reported() {
        use crate::config::ConfigDoc;
        use crate::model::{self, LoadContext};
        use std::path::PathBuf;

        let doc = ConfigDoc::from_value(
            PathBuf::from("<mem>"),
            toml::from_str(
                r#"
[targets.kernel]
repository = "linux"

[targets.kernel.devicetree]
fragments = ["board.dtsi"]
"#,
            )
            .unwrap(),
        );
        let m = model::from_doc(&doc, &LoadContext::default()).unwrap();
        let report = Reporter::default();
        let out = assemble(&report, &m.targets["kernel"], &[], Path::new("/nowhere"));
        assert!(out.is_none());
        assert_eq!(report.error_count(), 1);
    }
}
