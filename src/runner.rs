//! Backend command execution
//!
//! Every backend command (pacman, paru, pre/post scripts, repository queries)
//! goes through a [`CommandRunner`]. The engine only depends on the trait;
//! [`SystemRunner`] is the implementation used by the binary.
//!
//! # Process handling
//!
//! `SystemRunner` spawns each command in its own process group with a
//! parent-death signal and registers the PID with `ChildRegistry::global()`
//! under the command line it runs. A signal to pkgops stops a pacman
//! transaction in flight, and [`CommandRunner::terminate`] stops exactly the
//! process group started for one invocation.

use crate::error::{PkgOpsError, Result};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, info};

/// A command line plus the environment it runs with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// The command line as it would be typed, for logs and error messages
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Result of a command that ran to completion
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code (-1 if terminated by signal)
    pub exit_code: i32,
    /// Everything the command printed
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands in the target environment.
///
/// # Contract
///
/// - Output lines are handed to `on_line` as they are produced, without the
///   trailing newline.
/// - A command that starts and exits non-zero is `Ok` with that exit code;
///   `Err` means the command could not be run at all.
/// - Implementations must be shareable across threads: the best-effort
///   timeout runs commands from a worker thread while the caller may call
///   [`terminate`](CommandRunner::terminate) for the same invocation.
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation, on_line: &mut dyn FnMut(&str)) -> Result<CommandOutput>;

    /// Ask a `run` of `invocation` that is still in flight to stop.
    ///
    /// Only processes this runner spawned for `invocation` may be signalled.
    /// Delivery is best-effort; the default does nothing.
    fn terminate(&self, invocation: &Invocation) {
        let _ = invocation;
    }
}

/// Spawns real processes, optionally inside a chroot
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    /// Root of the installed system; commands run through `chroot` when set
    root: Option<PathBuf>,
}

impl SystemRunner {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    fn build_command(&self, invocation: &Invocation) -> Result<Command> {
        let (program, args) = invocation
            .argv
            .split_first()
            .ok_or_else(|| PkgOpsError::config("empty command line"))?;

        let mut cmd = match &self.root {
            Some(root) => {
                let mut cmd = Command::new("chroot");
                cmd.arg(root).arg(program);
                cmd
            }
            None => Command::new(program),
        };

        cmd.args(args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();

        Ok(cmd)
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation, on_line: &mut dyn FnMut(&str)) -> Result<CommandOutput> {
        info!(
            "run: {} env={:?} root={:?}",
            invocation.command_line(),
            invocation.env,
            self.root
        );

        let mut child = self.build_command(invocation)?.spawn()?;
        let pid = child.id();

        // Register PID for cleanup on parent exit
        if let Ok(mut guard) = ChildRegistry::global().lock() {
            guard.register(pid, invocation.command_line());
        }

        // stderr is drained on its own thread so a chatty command can't block on a full pipe
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let mut captured = String::new();
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines().map_while(std::result::Result::ok) {
                on_line(&line);
                captured.push_str(&line);
                captured.push('\n');
            }
        }

        let status = child.wait();

        if let Ok(mut guard) = ChildRegistry::global().lock() {
            guard.unregister(pid);
        }

        let status = status?;
        if let Some(handle) = stderr_reader
            && let Ok(stderr) = handle.join()
        {
            captured.push_str(&stderr);
        }

        let exit_code = status.code().unwrap_or(-1);
        debug!("{} exited with {}", invocation.command_line(), exit_code);

        Ok(CommandOutput {
            exit_code,
            output: captured,
        })
    }

    fn terminate(&self, invocation: &Invocation) {
        let command = invocation.command_line();
        let signalled = match ChildRegistry::global().lock() {
            Ok(registry) => registry.terminate_command(&command),
            Err(_) => 0,
        };
        if signalled == 0 {
            debug!("terminate: no running process for {}", command);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_joins_argv() {
        let inv = Invocation::new(["pacman", "-S", "--noconfirm", "vim"]);
        assert_eq!(inv.command_line(), "pacman -S --noconfirm vim");
    }

    #[test]
    fn test_empty_argv_is_rejected() {
        let runner = SystemRunner::default();
        let result = runner.run(&Invocation::default(), &mut |_| {});
        assert!(matches!(result, Err(PkgOpsError::Configuration(_))));
    }

    #[test]
    fn test_system_runner_streams_lines_and_exit_code() {
        let runner = SystemRunner::default();
        let mut seen = Vec::new();
        let out = runner
            .run(
                &Invocation::new(["sh", "-c", "echo one; echo two; echo oops >&2; exit 3"]),
                &mut |line| seen.push(line.to_string()),
            )
            .expect("sh should be available");

        assert_eq!(seen, vec!["one", "two"]);
        assert_eq!(out.exit_code, 3);
        assert!(out.output.contains("oops"));
    }

    #[test]
    fn test_system_runner_passes_env() {
        let runner = SystemRunner::default();
        let mut seen = Vec::new();
        runner
            .run(
                &Invocation::new(["sh", "-c", "echo $XDG_CACHE_HOME"])
                    .with_env(vec![("XDG_CACHE_HOME".into(), "/var/cache/paru_cache".into())]),
                &mut |line| seen.push(line.to_string()),
            )
            .expect("sh should be available");
        assert_eq!(seen, vec!["/var/cache/paru_cache"]);
    }

    #[test]
    fn test_terminate_stops_own_child_and_spares_lookalikes() {
        use std::sync::mpsc;
        use std::time::{Duration, Instant};

        let argv = ["sh", "-c", "echo ready; sleep 30"];
        let mut lookalike = Command::new(argv[0])
            .args(&argv[1..])
            .stdout(Stdio::null())
            .spawn()
            .expect("sh should be available");

        let runner = SystemRunner::default();
        let invocation = Invocation::new(argv);
        let (tx, rx) = mpsc::channel();
        let worker = {
            let runner = runner.clone();
            let invocation = invocation.clone();
            thread::spawn(move || {
                runner.run(&invocation, &mut |line| {
                    let _ = tx.send(line.to_string());
                })
            })
        };

        // The child is registered before its first line is read
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "ready");
        let started = Instant::now();
        runner.terminate(&invocation);

        let out = worker.join().unwrap().expect("run should finish");
        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(lookalike.try_wait().unwrap().is_none(), "unrelated process was signalled");

        let _ = lookalike.kill();
        let _ = lookalike.wait();
    }

    #[test]
    fn test_missing_program_is_io_error() {
        let runner = SystemRunner::default();
        let result = runner.run(&Invocation::new(["definitely-not-a-real-binary-xyz"]), &mut |_| {});
        assert!(matches!(result, Err(PkgOpsError::Io(_))));
    }
}
