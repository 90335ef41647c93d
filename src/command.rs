//! Type-safe external command execution.
//!
//! Every external process a migration step starts (`docker`, `docker compose`)
//! goes through `run_command_safe` so that:
//!
//! - it runs in its own process group and is registered for interrupt cleanup
//! - its arguments come from a typed `CommandArgs` struct, not ad hoc strings
//! - an optional per-call timeout can bound it (default: wait forever)

use crate::process_guard::{ChildRegistry, CommandProcessGroup, is_process_alive};
use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Trait for typed command arguments.
///
/// # Contract
///
/// - `program()`: executable to run, resolved through `PATH`
/// - `to_cli_args()`: arguments exactly as the program expects them
/// - `get_env_vars()`: extra environment for the child
pub trait CommandArgs {
    fn program(&self) -> &str;

    fn to_cli_args(&self) -> Vec<String>;

    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Human readable command line for logs
    fn display(&self) -> String {
        let mut parts = vec![self.program().to_string()];
        parts.extend(self.to_cli_args());
        parts.join(" ")
    }
}

/// Output from a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Turn a non-zero exit into an error
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            anyhow::bail!(
                "{} failed (exit code {}): {}",
                context,
                code,
                self.stderr.trim()
            )
        }
    }
}

/// Run an external command with typed arguments.
///
/// Returns `Ok` with the captured output even when the command exits
/// non-zero; use `CommandOutput::ensure_success` to treat that as failure.
///
/// # Errors
///
/// - the program could not be spawned
/// - `timeout` elapsed; the whole process group is killed first
pub fn run_command_safe<T: CommandArgs + ?Sized>(
    args: &T,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let cli_args = args.to_cli_args();
    let env_vars = args.get_env_vars();

    info!("run_command_safe: {} args={:?}", args.program(), cli_args);

    let mut cmd = Command::new(args.program());
    cmd.args(&cli_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();
    for (key, value) in &env_vars {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", args.program()))?;
    let pid = child.id();

    // Drain pipes while waiting so a chatty command cannot block on a full pipe
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }

    let waited = wait_with_timeout(&mut child, timeout);

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }

    let status = waited.with_context(|| format!("Failed waiting for {}", args.display()))?;

    let stdout = join_reader(stdout_reader).context("Failed to read command stdout")?;
    let stderr = join_reader(stderr_reader).context("Failed to read command stderr")?;

    let exit_code = status.code();
    if status.success() {
        debug!("{} exited successfully", args.program());
    } else {
        warn!(
            "{} exited with code {}",
            args.display(),
            exit_code.unwrap_or(-1)
        );
    }

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
        success: status.success(),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<std::io::Result<String>> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        pipe.read_to_string(&mut buf)?;
        Ok(buf)
    })
}

fn join_reader(reader: Option<JoinHandle<std::io::Result<String>>>) -> Result<String> {
    match reader {
        Some(handle) => match handle.join() {
            Ok(read) => Ok(read?),
            Err(_) => anyhow::bail!("pipe reader thread panicked"),
        },
        None => Ok(String::new()),
    }
}

/// Wait for `child`, killing its process group if `timeout` elapses.
fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> Result<ExitStatus> {
    let Some(timeout) = timeout else {
        return Ok(child.wait()?);
    };

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if start.elapsed() >= timeout {
            let pid = child.id();
            warn!("Command PID {} exceeded timeout of {:?}, killing", pid, timeout);
            if crate::process_guard::send_signal_to_group(pid, Signal::SIGKILL).is_err()
                && is_process_alive(pid)
            {
                child.kill()?;
            }
            let _ = child.wait();
            anyhow::bail!("timed out after {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sh(&'static str);

    impl CommandArgs for Sh {
        fn program(&self) -> &str {
            "sh"
        }

        fn to_cli_args(&self) -> Vec<String> {
            vec!["-c".to_string(), self.0.to_string()]
        }

        fn get_env_vars(&self) -> Vec<(String, String)> {
            vec![("EE_TEST_VALUE".to_string(), "42".to_string())]
        }
    }

    #[test]
    fn test_display_joins_program_and_args() {
        assert_eq!(Sh("true").display(), "sh -c true");
    }

    #[test]
    fn test_captures_output_and_env() {
        let out = run_command_safe(&Sh("echo $EE_TEST_VALUE; echo oops >&2"), None).unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "42");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(out.ensure_success("echo").is_ok());
    }

    #[test]
    fn test_non_zero_exit_is_reported() {
        let out = run_command_safe(&Sh("echo broken >&2; exit 3"), None).unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        let err = out.ensure_success("compose up").unwrap_err();
        assert_eq!(err.to_string(), "compose up failed (exit code 3): broken");
    }

    #[test]
    fn test_timeout_kills_command() {
        let start = Instant::now();
        let err = run_command_safe(&Sh("sleep 30"), Some(Duration::from_millis(200))).unwrap_err();
        assert!(format!("{:#}", err).contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_missing_program_fails_to_spawn() {
        struct Missing;
        impl CommandArgs for Missing {
            fn program(&self) -> &str {
                "ee-migrate-no-such-binary"
            }
            fn to_cli_args(&self) -> Vec<String> {
                vec![]
            }
        }
        assert!(run_command_safe(&Missing, None).is_err());
    }
}
