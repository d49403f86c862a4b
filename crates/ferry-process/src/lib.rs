//! Process execution for ferry.
//!
//! This crate provides utilities for running external processes with
//! output capture and deadline/cancellation support, plus the [`Mach`]
//! runner used to talk to gecko's in-tree build tool.
//!
//! # Example
//!
//! ```ignore
//! use ferry_process::run_command;
//!
//! let result = run_command("git", &["--version"]).expect("run");
//! assert!(result.success);
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use ferry_types::{Ctx, FerryError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result of a command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// Exit code (if available)
    pub exit_code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Duration of execution
    pub duration_ms: u64,
}

impl CommandResult {
    /// Check if the command succeeded
    pub fn ok(&self) -> Result<&Self> {
        if self.success {
            Ok(self)
        } else {
            Err(anyhow::anyhow!(
                "command failed with exit code {:?}: {}",
                self.exit_code,
                self.stderr
            ))
        }
    }

    /// stdout and stderr folded together, in that order.
    ///
    /// The submission tool interleaves its progress chatter and the final
    /// revision line across both streams, so scraping looks at everything.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }

    /// Create a result from a process output
    pub fn from_output(output: &Output, duration: Duration) -> Self {
        Self {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Run a command and capture its output
pub fn run_command(program: &str, args: &[&str]) -> Result<CommandResult> {
    let start = Instant::now();

    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to run command: {} {:?}", program, args))?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Run a command in a specific directory
pub fn run_command_in_dir(program: &str, args: &[&str], dir: &Path) -> Result<CommandResult> {
    let start = Instant::now();

    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| {
            format!(
                "failed to run command: {} {:?} in {}",
                program,
                args,
                dir.display()
            )
        })?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Run a command honoring the context's deadline and cancellation flag.
///
/// The child is polled; when the context expires or is cancelled the child
/// is killed and an abort error is returned. Without a deadline this
/// degrades to a plain captured run.
pub fn run_command_with_ctx(
    program: &str,
    args: &[&str],
    dir: &Path,
    ctx: &Ctx,
) -> Result<CommandResult> {
    ctx.checkpoint()?;

    if ctx.remaining().is_none() {
        return run_command_in_dir(program, args, dir);
    }

    let start = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn command: {}", program))?;

    loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll command: {}", program))?
        {
            Some(status) => {
                return Ok(CommandResult {
                    success: status.success(),
                    exit_code: status.code(),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
            None => {
                if ctx.is_cancelled() {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(FerryError::Abort(format!(
                        "{program} cancelled after {:?}",
                        start.elapsed()
                    ))
                    .into());
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

/// Check if a command exists in PATH
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Get the full path to a command
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// Runner for gecko's in-tree `mach` tool.
///
/// `mach` only works when invoked as `./mach` from a checkout root, so the
/// runner is bound to a working directory at construction.
#[derive(Debug, Clone)]
pub struct Mach {
    working_dir: PathBuf,
}

impl Mach {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn run(&self, args: &[&str], ctx: &Ctx) -> Result<CommandResult> {
        let mach = self.working_dir.join("mach");
        if !mach.exists() {
            bail!("no mach entry point in {}", self.working_dir.display());
        }
        debug!(dir = %self.working_dir.display(), ?args, "running mach");
        run_command_with_ctx("./mach", args, &self.working_dir, ctx)
    }

    /// Invoke `./mach try <args..>`.
    pub fn try_cmd(&self, args: &[&str], ctx: &Ctx) -> Result<CommandResult> {
        let mut full = vec!["try"];
        full.extend_from_slice(args);
        self.run(&full, ctx)
    }

    /// Invoke `./mach python <args..>`.
    pub fn python(&self, args: &[&str], ctx: &Ctx) -> Result<CommandResult> {
        let mut full = vec!["python"];
        full.extend_from_slice(args);
        self.run(&full, ctx)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
    }

    #[test]
    fn run_command_version() {
        let result = run_command("git", &["--version"]).expect("run");
        assert!(result.success);
        assert!(result.stdout.contains("git"));
    }

    #[test]
    fn run_command_failure() {
        let result = run_command("git", &["--nonexistent-flag-xyz"]).expect("run");
        assert!(!result.success);
        assert!(result.ok().is_err());
    }

    #[test]
    fn combined_concatenates_streams() {
        let result = CommandResult {
            success: true,
            exit_code: Some(0),
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            duration_ms: 1,
        };
        assert_eq!(result.combined(), "outerr");
    }

    #[test]
    fn command_exists_git() {
        assert!(command_exists("git"));
        assert!(!command_exists("this-command-does-not-exist-xyz123"));
    }

    #[test]
    fn run_with_background_ctx() {
        let td = tempdir().expect("tempdir");
        let result =
            run_command_with_ctx("git", &["--version"], td.path(), &Ctx::background())
                .expect("run");
        assert!(result.success);
    }

    #[cfg(unix)]
    #[test]
    fn run_with_ctx_kills_on_deadline() {
        let td = tempdir().expect("tempdir");
        write_script(td.path(), "slow", "sleep 30");
        let ctx = Ctx::with_timeout(Duration::from_millis(200));

        let err = run_command_with_ctx("./slow", &[], td.path(), &ctx).unwrap_err();
        assert!(!FerryError::is_retryable(&err));
        assert!(err.to_string().contains("cancelled"));
    }

    #[cfg(unix)]
    #[test]
    fn run_with_cancelled_ctx_fails_fast() {
        let td = tempdir().expect("tempdir");
        let ctx = Ctx::background();
        ctx.cancel();
        assert!(run_command_with_ctx("git", &["--version"], td.path(), &ctx).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn mach_runs_from_working_dir() {
        let td = tempdir().expect("tempdir");
        write_script(td.path(), "mach", r#"echo "mach: $@""#);

        let mach = Mach::new(td.path());
        let result = mach
            .try_cmd(&["fuzzy", "--help"], &Ctx::background())
            .expect("run");
        assert!(result.success);
        assert!(result.stdout.contains("mach: try fuzzy --help"));

        let result = mach.python(&["-c", ""], &Ctx::background()).expect("run");
        assert!(result.stdout.starts_with("mach: python -c"));
    }

    #[test]
    fn mach_missing_entry_point_errors() {
        let td = tempdir().expect("tempdir");
        let mach = Mach::new(td.path());
        let err = mach.try_cmd(&["fuzzy"], &Ctx::background()).unwrap_err();
        assert!(err.to_string().contains("no mach entry point"));
    }

    #[test]
    fn command_result_serialization() {
        let result = CommandResult {
            success: true,
            exit_code: Some(0),
            stdout: "output".to_string(),
            stderr: String::new(),
            duration_ms: 150,
        };

        let json = serde_json::to_string(&result).expect("serialize");
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"stdout\":\"output\""));
    }
}
