use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;

/// Extract `archive` into `dest` using the system tools. Dispatch is by
/// file extension; unknown extensions are an error so callers can apply
/// their cache-corruption policy.
pub fn extract(ctx: &ExecCtx, archive: &Path, dest: &Path) -> Result<()> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    let mut cmd;
    if name.ends_with(".tar")
        || name.ends_with(".tar.gz")
        || name.ends_with(".tgz")
        || name.ends_with(".tar.bz2")
        || name.ends_with(".tar.xz")
    {
        cmd = Command::new("tar");
        cmd.arg("-xf").arg(archive).arg("-C").arg(dest);
    } else if name.ends_with(".zip") {
        cmd = Command::new("unzip");
        cmd.arg("-o").arg(archive).arg("-d").arg(dest);
    } else {
        return Err(Error::msg(format!(
            "don't know how to extract '{name}'"
        )));
    }

    ctx.run_cmd(&format!("extract {name}"), cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Reporter;
    use std::fs;
    use std::sync::Arc;

    #[test]
    fn unknown_extension_is_an_error() {
        let ctx = ExecCtx::new(true, Arc::new(Reporter::default()));
        let err = extract(&ctx, Path::new("bundle.rar"), Path::new("/tmp"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("bundle.rar"));
    }

    #[test]
    fn extracts_a_real_tarball() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("payload");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("hello.txt"), "hi").unwrap();

        let archive = tmp.path().join("payload.tar.gz");
        let status = Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(tmp.path())
            .arg("payload")
            .status()
            .unwrap();
        assert!(status.success());

        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();
        let ctx = ExecCtx::new(false, Arc::new(Reporter::default()));
        extract(&ctx, &archive, &dest).unwrap();
        assert!(dest.join("payload/hello.txt").is_file());
    }
}
