//! Lifecycle management for backend child processes
//!
//! A pacman or paru transaction that outlives pkgops leaves the target system
//! with a held database lock and a half-applied transaction. Every backend
//! command is therefore spawned as the leader of its own process group and
//! recorded in a global [`ChildRegistry`] under the command line it runs.
//!
//! The registry serves two purposes:
//!
//! - A timed-out attempt is stopped by signalling only the group(s) started
//!   for that command line ([`ChildRegistry::terminate_command`]). Processes
//!   pkgops did not spawn are never touched, whatever their command line.
//! - On SIGINT/SIGTERM/SIGHUP or when the [`ProcessGuard`] drops, every
//!   registered group gets SIGTERM, then SIGKILL after a grace period.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Running backend processes, keyed by PID (which is also their process group)
#[derive(Debug, Default)]
pub struct ChildRegistry {
    children: HashMap<u32, String>,
    /// Set once shutdown starts so it never runs twice
    shutting_down: bool,
}

impl ChildRegistry {
    /// The registry shared by every runner in this process
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Track `pid`, started for `command`
    pub fn register(&mut self, pid: u32, command: impl Into<String>) {
        let command = command.into();
        debug!("tracking backend PID {}: {}", pid, command);
        self.children.insert(pid, command);
    }

    pub fn unregister(&mut self, pid: u32) {
        if self.children.remove(&pid).is_some() {
            debug!("backend PID {} finished", pid);
        }
    }

    pub fn count(&self) -> usize {
        self.children.len()
    }

    /// SIGTERM the process group of every child started for `command`.
    ///
    /// Returns how many groups were signalled. The children stay registered
    /// until the runner that spawned them has reaped them.
    pub fn terminate_command(&self, command: &str) -> usize {
        let pids: Vec<u32> = self
            .children
            .iter()
            .filter(|(_, cmd)| cmd.as_str() == command)
            .map(|(&pid, _)| pid)
            .collect();

        for &pid in &pids {
            info!("stopping process group {} ({})", pid, command);
            stop_group(pid, Signal::SIGTERM);
        }
        pids.len()
    }

    /// SIGTERM every tracked group, SIGKILL whatever is left after `grace_period`
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        if self.children.is_empty() {
            return;
        }
        info!("Terminating {} backend process(es)...", self.children.len());

        let pids: Vec<u32> = self.children.keys().copied().collect();
        pids.iter().for_each(|&pid| stop_group(pid, Signal::SIGTERM));

        let deadline = Instant::now() + grace_period;
        while Instant::now() < deadline && pids.iter().any(|&pid| is_process_alive(pid)) {
            std::thread::sleep(Duration::from_millis(100));
        }

        for pid in pids.into_iter().filter(|&pid| is_process_alive(pid)) {
            warn!("Process group {} ignored SIGTERM, sending SIGKILL", pid);
            stop_group(pid, Signal::SIGKILL);
        }

        self.children.clear();
    }
}

/// Signal the group led by `pgid`, or just the process if it has no group of its own
fn stop_group(pgid: u32, sig: Signal) {
    // Negative PID addresses the whole process group (pacman hooks, makepkg, sudo children)
    let group = Pid::from_raw(-(pgid as i32));
    if let Err(e) = signal::kill(group, sig) {
        debug!("{:?} to process group {} failed ({}), trying the process", sig, pgid, e);
        if let Err(e) = signal::kill(Pid::from_raw(pgid as i32), sig) {
            warn!("Failed to send {:?} to PID {}: {}", sig, pgid, e);
        }
    }
}

/// Alive means the process exists and is not a zombie
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/pid/stat is the state
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| stat.split_whitespace().nth(2).map(|s| !matches!(s, "Z" | "X")))
        .unwrap_or(true)
}

/// Stops every tracked backend process when dropped
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
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
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(Duration::from_secs(5));
        }
    }
}

/// Stop tracked backends and exit with `128 + signal` on SIGINT, SIGTERM or SIGHUP.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("Received signal {}, stopping backend processes...", sig);
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Spawn a command as leader of its own process group
pub trait CommandProcessGroup {
    /// New process group, SIGTERM when pkgops dies
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe setpgid and prctl
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
