use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use crate::error::{Error, Result};
use crate::report::Reporter;

// Set from the SIGINT handler; merged into every context's cancel check.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Install a SIGINT handler that only flips the shared interrupt flag. The
/// in-flight child process group is killed by the run loop, not the handler.
pub fn install_interrupt_handler() {
    #[cfg(unix)]
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_interrupt as *const () as libc::sighandler_t,
        );
    }
}

#[cfg(unix)]
extern "C" fn on_interrupt(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Subprocess execution context shared across the whole run.
#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub cancel: Arc<AtomicBool>,
    pub report: Arc<Reporter>,
    // Live child process group ids, for interrupt cleanup.
    child_pgroups: Arc<Mutex<BTreeSet<u32>>>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, report: Arc<Reporter>) -> Self {
        Self {
            dry_run,
            cancel: Arc::new(AtomicBool::new(false)),
            report,
            child_pgroups: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || INTERRUPTED.load(Ordering::Relaxed)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn register_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.child_pgroups.lock() {
            g.insert(pgid);
        }
    }

    fn unregister_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.child_pgroups.lock() {
            g.remove(&pgid);
        }
    }

    pub fn kill_running_children(&self) {
        let pgids: Vec<u32> = self
            .child_pgroups
            .lock()
            .ok()
            .map(|g| g.iter().copied().collect())
            .unwrap_or_default();
        for pgid in pgids {
            kill_pgroup(pgid, true);
        }
    }

    /// Run a shell command line with line-buffered, sanitized output.
    /// `path_value` replaces the child's PATH when given; the parent
    /// environment is never mutated.
    pub fn run_shell(
        &self,
        label: &str,
        line: &str,
        cwd: &Path,
        path_value: Option<&OsString>,
    ) -> Result<()> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(line).current_dir(cwd);
        if let Some(p) = path_value {
            cmd.env("PATH", p);
        }
        self.run_cmd(label, cmd)
    }

    /// Spawn a prepared command with the child in its own process group,
    /// streaming merged stdout/stderr lines to the reporter. A cancel or
    /// interrupt kills the whole group.
    pub fn run_cmd(&self, label: &str, mut cmd: Command) -> Result<()> {
        if self.cancelled() {
            return Err(Error::msg("cancelled"));
        }
        if self.dry_run {
            self.report.info(&format!("[{label}] DRY-RUN: {cmd:?}"));
            return Ok(());
        }

        // Own process group so the whole subtree can be killed at once.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            // A TTY-attached stdin lets any read trigger SIGTTIN and suspend
            // the child group.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("[{label}] spawn failed: {e}")))?;
        let pgid = child.id();
        self.register_child_pgroup(pgid);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = stdout {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = stderr {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_line(&line);
            if line.is_empty() {
                continue;
            }
            self.report.info(&format!("[{label}] {line}"));
            if self.cancelled() {
                kill_pgroup(pgid, false);
                kill_pgroup(pgid, true);
                break;
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("[{label}] wait failed: {e}")))?;
        self.unregister_child_pgroup(pgid);
        if self.cancelled() {
            return Err(Error::msg("cancelled"));
        }
        if !status.success() {
            return Err(Error::msg(format!("[{label}] command failed: {status}")));
        }
        Ok(())
    }
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

/// Build a PATH value with `dirs` prepended to the current one. Returned as
/// a value for `Command::env`, never written back into this process.
pub fn prepend_path(dirs: &[PathBuf]) -> OsString {
    let current = std::env::var_os("PATH").unwrap_or_default();
    let mut all: Vec<PathBuf> = dirs.to_vec();
    all.extend(std::env::split_paths(&current));
    std::env::join_paths(all).unwrap_or(current)
}

/// Append a make-style job count to a command line.
pub fn with_jobs(line: &str, jobs: usize) -> String {
    format!("{line} -j{jobs}")
}

/// nproc + 1, the conventional sweet spot for make on build hosts.
pub fn auto_jobs() -> usize {
    num_cpus::get() + 1
}

// Strip ANSI escape sequences and control characters; tabs become spaces.
fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_escape = false;
    for c in input.chars() {
        if in_escape {
            // CSI/OSC terminators and bare two-char escapes all end on a
            // final byte in this range.
            if ('@'..='~').contains(&c) && c != '[' && c != ']' {
                in_escape = false;
            }
            continue;
        }
        match c {
            '\x1b' => in_escape = true,
            '\t' => out.push(' '),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out.trim_end().to_string()
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if pending.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                let _ = tx.send(line);
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    let _ = tx.send(line);
                }
            }
        }
    }

    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_ansi_and_control_chars() {
        assert_eq!(sanitize_line("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(sanitize_line("a\tb\x07c"), "a bc");
        assert_eq!(sanitize_line("plain  "), "plain");
    }

    #[test]
    fn with_jobs_appends_make_flag() {
        assert_eq!(with_jobs("make all", 5), "make all -j5");
    }

    #[test]
    fn prepend_path_puts_new_dirs_first() {
        let v = prepend_path(&[PathBuf::from("/opt/tc/bin")]);
        let first = std::env::split_paths(&v).next();
        assert_eq!(first, Some(PathBuf::from("/opt/tc/bin")));
    }

    #[test]
    fn run_shell_captures_exit_status() {
        let ctx = ExecCtx::new(false, Arc::new(Reporter::default()));
        assert!(ctx.run_shell("t", "true", Path::new("."), None).is_ok());
        assert!(ctx.run_shell("t", "false", Path::new("."), None).is_err());
    }

    #[test]
    fn cancel_token_refuses_further_commands() {
        let ctx = ExecCtx::new(false, Arc::new(Reporter::default()));
        ctx.request_cancel();
        let err = ctx.run_shell("t", "true", Path::new("."), None).unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn dry_run_never_spawns() {
        let ctx = ExecCtx::new(true, Arc::new(Reporter::default()));
        // Would fail if executed.
        assert!(ctx.run_shell("t", "exit 1", Path::new("."), None).is_ok());
    }
}
