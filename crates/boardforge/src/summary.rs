use std::path::Path;

use crate::model::Model;

/// Human-readable end-of-run summary: the device, what each selected target
/// ended up doing, the chosen binary set, and any custom file paths.
pub fn render(model: &Model, device: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("Device: {}\n", device.replace(['/', '_'], " ")));

    out.push_str("Targets:\n");
    for name in model.ordered_names() {
        let Some(t) = model.targets.get(&name) else {
            continue;
        };
        if !(t.fetch || t.build || t.build_error) {
            continue;
        }
        let mut line = format!("  {name} (");
        if t.fetch {
            line.push_str("fetch");
            if t.fetch_history {
                line.push_str(" with history");
            }
        }
        if t.fetch && t.build {
            line.push_str(" + ");
        }
        if t.build {
            line.push_str("build");
        }
        if t.build_error {
            if t.fetch {
                line.push_str(", ");
            }
            line.push_str("failed");
        }
        line.push(')');
        out.push_str(&line);
        out.push('\n');
    }

    if let Some(b) = model.chosen_binary() {
        out.push_str(&format!("Binaries: {}\n", b.description));
        if b.is_copyfiles_custom() {
            out.push_str("Custom binaries used:\n");
            for cf in &b.copy_files {
                if Path::new(&cf.src).is_absolute() {
                    out.push_str(&format!("  {} <- {}\n", cf.dst, cf.src));
                } else {
                    out.push_str(&format!("  {} <- {} (default)\n", cf.dst, cf.src));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDoc;
    use crate::model::{self, LoadContext};

    #[test]
    fn summary_lists_selection_states_and_custom_files() {
        let doc = ConfigDoc::from_value(
            std::path::PathBuf::from("<mem>"),
            toml::from_str(
                r#"
[targets.uboot]
repository = "u-boot"
priority = 10

[targets.kernel]
repository = "linux"
priority = 20

[targets.rootfs]
repository = "buildroot"
priority = 30

[options.uboot]
fetch = true
build = true

[options.kernel]
build = true

[binaries.fpga]
description = "FPGA bundle"
url = "https://example.invalid/fpga.tar.gz"
unpack = true
chosen = true

[binaries.fpga.copyfiles]
"fpga.bit" = "bitstream/fpga.bit"
"#,
            )
            .unwrap(),
        );
        let mut m = model::from_doc(&doc, &LoadContext::default()).unwrap();
        assert!(m.set_binary_copyfile("fpga.bit", "/srv/my/fpga.bit"));

        let s = render(&m, "zynq/mars_zx3/board_1");
        assert!(s.contains("Device: zynq mars zx3 board 1"));
        assert!(s.contains("uboot (fetch + build)"));
        assert!(s.contains("kernel (build)"));
        assert!(!s.contains("rootfs"));
        assert!(s.contains("Binaries: FPGA bundle"));
        assert!(s.contains("fpga.bit <- /srv/my/fpga.bit"));
    }
}
