//! Timeout-bounded external command execution, shared by the renewal
//! scheduler (C5) and the `init_unit`/`rc_unit`/`script` update drivers
//! (C9).

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Run `program args...` in `working_dir`, bounded by `timeout` if given
/// (`None` = indefinite, matching the renewal executable's contract).
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args).current_dir(working_dir);

    let (exit_code, stdout, stderr, timed_out) = if let Some(timeout_dur) = timeout {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let deadline = Instant::now() + timeout_dur;
        loop {
            match child.try_wait().context("failed to poll child process")? {
                Some(status) => {
                    let (out, err) = drain_output(&mut child);
                    break (status.code().unwrap_or(-1), out, err, false);
                }
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        let (out, mut err) = drain_output(&mut child);
                        err.push_str(&format!(
                            "\ncommand timed out after {}",
                            humantime::format_duration(timeout_dur)
                        ));
                        break (-1, out, err, true);
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    } else {
        let output = command
            .output()
            .with_context(|| format!("failed to execute {program}"))?;
        (
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            false,
        )
    };

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

fn drain_output(child: &mut std::process::Child) -> (String, String) {
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }
    (
        String::from_utf8_lossy(&stdout_bytes).to_string(),
        String::from_utf8_lossy(&stderr_bytes).to_string(),
    )
}

/// Resolve `name` for the `script` driver: absolute path, then `$PATH`
/// lookup, then cwd-relative.
pub fn resolve_script_path(name: &Path, cwd: &Path) -> Result<std::path::PathBuf> {
    if name.is_absolute() {
        return Ok(name.to_path_buf());
    }
    if let Ok(found) = which::which(name) {
        return Ok(found);
    }
    let relative = cwd.join(name);
    if relative.exists() {
        return Ok(relative);
    }
    anyhow::bail!("script {} not found on PATH or relative to cwd", name.display())
}
