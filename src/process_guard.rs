//! Process lifecycle management and operator interrupts
//!
//! Step callables block on external processes (`docker`, `docker compose`).
//! When the operator interrupts a run, those processes must not keep mutating
//! the host while the migration unwinds.
//!
//! # Interrupt Flow
//! - Children are spawned in their own process group and registered here
//! - The first SIGINT/SIGTERM/SIGHUP raises the shared `InterruptFlag` and
//!   terminates every registered process group, so the running step fails fast
//! - The main thread sees the flag, rolls the active processor back and exits
//!   with `128 + signal`
//! - A second signal exits immediately without waiting for the rollback

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Global registry of child process IDs
static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Shared interrupt flag carrying the signal that raised it.
///
/// Cloning shares the flag. `0` means not raised.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    signal: Arc<AtomicI32>,
}

impl InterruptFlag {
    /// Create a lowered flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag with the signal number that caused it
    pub fn raise(&self, sig: i32) {
        // Keep the first signal if raised twice
        let _ = self
            .signal
            .compare_exchange(0, sig, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Returns true once the flag has been raised
    #[inline]
    pub fn is_raised(&self) -> bool {
        self.signal.load(Ordering::SeqCst) != 0
    }

    /// The signal that raised the flag, if any
    pub fn signal(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    }
}

/// Registry tracking all spawned child processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    /// Set of child PIDs currently running (each is its own process group leader)
    pids: HashSet<u32>,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Register a new child process
    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Registered child process PID {}", pid);
    }

    /// Unregister a child process (called when it exits)
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("Unregistered child process PID {}", pid);
    }

    /// Get count of tracked children
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate all tracked child process groups.
    ///
    /// Sends SIGTERM first, waits up to `grace_period`, then SIGKILL. The
    /// registry stays usable afterwards: rollback steps spawn new children.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.pids.is_empty() {
            debug!("No child processes to terminate");
            return;
        }

        info!("Terminating {} child process(es)...", self.pids.len());

        let pids_to_kill: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids_to_kill {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
                if let Err(e2) = send_signal(pid, Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to PID {}: {}", pid, e2);
                }
            } else {
                debug!("Sent SIGTERM to process group {}", pid);
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids_to_kill.iter().all(|&pid| !is_process_alive(pid)) {
                info!("All child processes terminated gracefully");
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids_to_kill {
            if is_process_alive(pid) {
                warn!("Process group {} did not terminate, sending SIGKILL", pid);
                if let Err(e) = send_signal_to_group(pid, Signal::SIGKILL) {
                    warn!("Failed to send SIGKILL to process group {}: {}", pid, e);
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }

        self.pids.clear();
        info!("Child process cleanup complete");
    }
}

/// Send a signal to a process
fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Send a signal to an entire process group (negative PID)
pub(crate) fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check if a process is still alive (not dead or zombie)
pub(crate) fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/pid/stat is the state; Z and X are not running
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// RAII guard that terminates all registered children on drop.
///
/// Held by the binary for the duration of a run.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    /// Create a new process guard attached to the global registry
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        debug!("ProcessGuard dropped, initiating cleanup");
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(Duration::from_secs(5));
        }
    }
}

fn signal_name(sig: i32) -> &'static str {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    match sig {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGHUP => "SIGHUP",
        _ => "UNKNOWN",
    }
}

/// Install SIGINT, SIGTERM and SIGHUP handlers that raise `interrupt`.
///
/// Call once at program start. The handler never exits on the first signal;
/// the caller owns rollback and the exit code.
pub fn init_signal_handlers(interrupt: InterruptFlag) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            let name = signal_name(sig);

            if interrupt.is_raised() {
                warn!("Received {} during rollback, exiting immediately", name);
                std::process::exit(128 + sig);
            }

            warn!("Received {} signal, stopping and rolling back...", name);
            interrupt.raise(sig);

            // Fail the running step quickly; the main thread performs the rollback
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                // Child dies with us if the migrator is killed outright
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn wait_for_process_death(pid: u32, timeout: Duration) -> bool {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

        let start = Instant::now();
        let nix_pid = Pid::from_raw(pid as i32);

        while start.elapsed() < timeout {
            match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => return true,
                Err(nix::errno::Errno::ECHILD) => {
                    if !is_process_alive(pid) {
                        return true;
                    }
                }
                _ => {}
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_interrupt_flag_keeps_first_signal() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_raised());
        assert_eq!(flag.signal(), None);

        let shared = flag.clone();
        shared.raise(15);
        shared.raise(2);

        assert!(flag.is_raised());
        assert_eq!(flag.signal(), Some(15));
    }

    #[test]
    fn test_registry_register_unregister() {
        let mut registry = ChildRegistry::default();

        registry.register(1234);
        registry.register(5678);
        assert_eq!(registry.count(), 2);

        registry.unregister(1234);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_terminate_all_kills_process_group() {
        let child = Command::new("sh")
            .args(["-c", "sleep 60"])
            .in_new_process_group()
            .spawn()
            .expect("Failed to spawn sleep process");
        let pid = child.id();

        let mut registry = ChildRegistry::default();
        registry.register(pid);
        assert!(is_process_alive(pid));

        registry.terminate_all(Duration::from_millis(500));

        assert!(wait_for_process_death(pid, Duration::from_secs(2)));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_registry_usable_after_terminate_all() {
        let mut registry = ChildRegistry::default();
        registry.register(999_999);
        registry.terminate_all(Duration::from_millis(10));
        assert_eq!(registry.count(), 0);

        registry.register(999_998);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(999_999));
    }
}
