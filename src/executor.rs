//! Backend executor
//!
//! Runs pacman/paru commands under a failure policy:
//!
//! - **Strict** (official repositories): a command is retried `num_retries`
//!   times, then the error propagates and aborts the run.
//! - **Best-effort** (AUR): same retries, then the failure is logged and the
//!   call reports `false`. Nothing in this policy returns an error.
//!
//! Best-effort backends may also set a per-command timeout. The command then
//! runs on a worker thread that streams its output back over a channel; the
//! calling thread stops waiting at the deadline, asks the runner to stop the
//! process group of that invocation, and counts the attempt as failed. A late
//! result from the worker lands in a channel nobody reads anymore.

use crate::config::{BackendSettings, JobConfig};
use crate::error::{PkgOpsError, Result};
use crate::progress::ProgressTracker;
use crate::runner::{CommandOutput, CommandRunner, Invocation};
use crate::types::{BackendKind, ExecPolicy, PackageEntry, BUILD_USER, PARU_CACHE_DIR};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What the worker thread of a timed attempt reports
enum WorkerEvent {
    Line(String),
    Finished(Result<CommandOutput>),
}

/// Runs backend commands for one run
pub struct BackendExecutor {
    backend: BackendKind,
    settings: BackendSettings,
    policy: ExecPolicy,
    runner: Arc<dyn CommandRunner>,
}

impl BackendExecutor {
    pub fn new(
        backend: BackendKind,
        settings: BackendSettings,
        policy: ExecPolicy,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        if settings.timeout > 0 && policy == ExecPolicy::Strict {
            warn!(
                "{}: timeout of {}s ignored, timeouts apply to best_effort backends only",
                backend, settings.timeout
            );
        }
        Self {
            backend,
            settings,
            policy,
            runner,
        }
    }

    /// Executor for `backend` as configured in `config`
    pub fn from_config(config: &JobConfig, backend: BackendKind, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(
            backend,
            config.backend_settings(backend),
            config.policy(backend),
            runner,
        )
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// Prepare the target for AUR builds as the unprivileged build user.
    ///
    /// Every step is best-effort. Does nothing for pacman.
    pub fn bootstrap(&self) {
        if self.backend != BackendKind::Paru {
            return;
        }

        let sudoers_line = format!("{} ALL=(ALL) NOPASSWD: /usr/bin/pacman", BUILD_USER);
        let steps = [
            (
                format!(
                    "printf '%s\\n' '{}' > /etc/sudoers.d/pkgops-paru && chmod 440 /etc/sudoers.d/pkgops-paru",
                    sudoers_line
                ),
                "create sudoers entry for paru",
            ),
            (
                format!(
                    "mkdir -p {dir} && chown {user}:{user} {dir}",
                    dir = PARU_CACHE_DIR,
                    user = BUILD_USER
                ),
                "prepare paru cache directory",
            ),
            (
                format!("chage -E -1 {}", BUILD_USER),
                "clear build user account expiry",
            ),
        ];

        for (script, what) in steps {
            let invocation = Invocation::new(["sh".to_string(), "-c".to_string(), script]);
            match self.runner.run(&invocation, &mut |line| debug!("{}", line)) {
                Ok(out) if out.success() => debug!("paru bootstrap: {} done", what),
                Ok(out) => warn!("Failed to {} (exit code {}, ignored).", what, out.exit_code),
                Err(e) => warn!("Failed to {} ({}, ignored).", what, e),
            }
        }
    }

    /// Refresh the sync databases (`-Sy`)
    pub fn update_db(&self) -> Result<bool> {
        let invocation = self.invocation(["-Sy"]);
        self.run_with_policy(&invocation, &mut |line| debug!("{}", line.trim()))
    }

    /// Upgrade the installed system (`-Su`)
    pub fn update_system(&self) -> Result<bool> {
        let mut args = vec!["-Su", "--noconfirm"];
        if self.settings.disable_download_timeout {
            args.push("--disable-download-timeout");
        }
        let invocation = self.invocation(args);
        self.run_with_policy(&invocation, &mut |line| debug!("{}", line.trim()))
    }

    /// Install `names` in one transaction (`-S`, or `-U` for package files)
    pub fn install(&self, names: &[String], from_local: bool, progress: &mut ProgressTracker) -> Result<bool> {
        let mut args = vec![if from_local { "-U" } else { "-S" }, "--noconfirm", "--noprogressbar"];
        if self.settings.needed_only {
            args.push("--needed");
        }
        if self.settings.disable_download_timeout {
            args.push("--disable-download-timeout");
        }
        let mut invocation = self.invocation(args);
        invocation.argv.extend(names.iter().cloned());

        progress.begin_command();
        let label = self.backend.program();
        self.run_with_policy(&invocation, &mut |line| progress.observe_line(label, line))
    }

    /// Remove `names` and their unneeded dependencies (`-Rs`)
    pub fn remove(&self, names: &[String], progress: &mut ProgressTracker) -> Result<bool> {
        let mut invocation = self.invocation(["-Rs", "--noconfirm"]);
        invocation.argv.extend(names.iter().cloned());

        progress.begin_command();
        let label = self.backend.program();
        self.run_with_policy(&invocation, &mut |line| progress.observe_line(label, line))
    }

    /// Install one entry, running its pre/post scripts around the install.
    pub fn install_package(
        &self,
        entry: &PackageEntry,
        from_local: bool,
        progress: &mut ProgressTracker,
    ) -> Result<bool> {
        if !self.run_script(entry.pre_script())? {
            warn!("{}: install of {} skipped, pre-script failed (ignored)", self.backend, entry.name());
            return Ok(false);
        }
        let installed = self.install(&[entry.name().to_string()], from_local, progress)?;
        let post = self.run_script(entry.post_script())?;
        Ok(installed && post)
    }

    /// Remove one entry, running its pre/post scripts around the removal.
    pub fn remove_package(&self, entry: &PackageEntry, progress: &mut ProgressTracker) -> Result<bool> {
        if !self.run_script(entry.pre_script())? {
            warn!("{}: removal of {} skipped, pre-script failed (ignored)", self.backend, entry.name());
            return Ok(false);
        }
        let removed = self.remove(&[entry.name().to_string()], progress)?;
        let post = self.run_script(entry.post_script())?;
        Ok(removed && post)
    }

    /// `install` / `local_install` step
    ///
    /// Strict backends batch a list of plain names into one transaction.
    /// Best-effort backends go one package at a time so a single bad AUR
    /// package doesn't take the others down with it.
    pub fn operation_install(
        &self,
        entries: &[PackageEntry],
        from_local: bool,
        progress: &mut ProgressTracker,
    ) -> Result<()> {
        if self.policy == ExecPolicy::Strict && entries.iter().all(PackageEntry::is_simple) {
            self.install(&names_of(entries), from_local, progress)?;
            return Ok(());
        }
        for entry in entries {
            self.install_package(entry, from_local, progress)?;
        }
        Ok(())
    }

    /// `try_install` step: failures are warnings under every policy
    pub fn operation_try_install(&self, entries: &[PackageEntry], progress: &mut ProgressTracker) -> Result<()> {
        for entry in entries {
            if let Err(e) = self.install_package(entry, false, progress) {
                warn!("Could not install package {}: {}", entry.name(), e);
            }
        }
        Ok(())
    }

    /// `remove` step
    pub fn operation_remove(&self, entries: &[PackageEntry], progress: &mut ProgressTracker) -> Result<()> {
        if self.policy == ExecPolicy::Strict && entries.iter().all(PackageEntry::is_simple) {
            self.remove(&names_of(entries), progress)?;
            return Ok(());
        }
        for entry in entries {
            self.remove_package(entry, progress)?;
        }
        Ok(())
    }

    /// `try_remove` step: failures are warnings under every policy
    pub fn operation_try_remove(&self, entries: &[PackageEntry], progress: &mut ProgressTracker) -> Result<()> {
        for entry in entries {
            if let Err(e) = self.remove_package(entry, progress) {
                warn!("Could not remove package {}: {}", entry.name(), e);
            }
        }
        Ok(())
    }

    /// Backend command with the backend's prefix and environment
    fn invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = self.backend.command_prefix();
        argv.extend(args.into_iter().map(Into::into));
        Invocation::new(argv).with_env(self.backend.build_env())
    }

    /// Run a pre/post script once. Scripts are split on whitespace, no shell.
    fn run_script(&self, script: Option<&str>) -> Result<bool> {
        let argv: Vec<&str> = script.unwrap_or_default().split_whitespace().collect();
        if argv.is_empty() {
            return Ok(true);
        }

        let invocation = Invocation::new(argv);
        info!("{}: running script {}", self.backend, invocation.command_line());
        let err = match self.runner.run(&invocation, &mut |line| debug!("{}", line.trim())) {
            Ok(out) if out.success() => return Ok(true),
            Ok(out) => PkgOpsError::command(invocation.command_line(), out.exit_code, out.output),
            Err(e) => e,
        };
        self.conclude(err)
    }

    /// The retry loop shared by every backend command
    fn run_with_policy(&self, invocation: &Invocation, on_line: &mut dyn FnMut(&str)) -> Result<bool> {
        let attempts = self.settings.num_retries + 1;
        let mut attempt = 0;

        let err = loop {
            attempt += 1;
            let err = match self.attempt(invocation, on_line) {
                Ok(out) if out.success() => return Ok(true),
                Ok(out) => PkgOpsError::command(invocation.command_line(), out.exit_code, out.output),
                Err(e) => e,
            };
            if attempt >= attempts {
                break err;
            }
            warn!(
                "{} failed (attempt {}/{}): {}, retrying",
                self.backend, attempt, attempts, err
            );
        };

        self.conclude(err)
    }

    /// Apply the policy to a command that has failed for good
    fn conclude(&self, err: PkgOpsError) -> Result<bool> {
        match self.policy {
            ExecPolicy::Strict => Err(err),
            ExecPolicy::BestEffort => {
                warn!(
                    "{} command failed (ignored): {} rc={}",
                    self.backend,
                    err.command_line().unwrap_or("?"),
                    err.exit_code().map(|c| c.to_string()).unwrap_or_else(|| "?".into())
                );
                if let Some(output) = err.captured_output() {
                    debug!("output: {}", output);
                }
                Ok(false)
            }
        }
    }

    fn attempt(&self, invocation: &Invocation, on_line: &mut dyn FnMut(&str)) -> Result<CommandOutput> {
        match (self.policy, self.settings.timeout()) {
            (ExecPolicy::BestEffort, Some(limit)) => self.attempt_with_timeout(invocation, on_line, limit),
            _ => self.runner.run(invocation, on_line),
        }
    }

    /// Run on a worker thread and stop waiting at `limit`.
    ///
    /// Output lines are forwarded to `on_line` on this thread, in order.
    fn attempt_with_timeout(
        &self,
        invocation: &Invocation,
        on_line: &mut dyn FnMut(&str),
        limit: Duration,
    ) -> Result<CommandOutput> {
        let (tx, rx) = mpsc::channel();
        let runner = Arc::clone(&self.runner);
        let worker_invocation = invocation.clone();

        thread::Builder::new()
            .name(format!("{}-worker", self.backend))
            .spawn(move || {
                let line_tx = tx.clone();
                let result = runner.run(&worker_invocation, &mut |line| {
                    let _ = line_tx.send(WorkerEvent::Line(line.to_string()));
                });
                // Receiver is gone if the caller already timed out
                let _ = tx.send(WorkerEvent::Finished(result));
            })?;

        let deadline = Instant::now() + limit;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(WorkerEvent::Line(line)) => on_line(&line),
                Ok(WorkerEvent::Finished(result)) => return result,
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PkgOpsError::command(
                        invocation.command_line(),
                        -1,
                        "worker exited without a result",
                    ));
                }
            }
        }

        warn!(
            "{} command timed out after {}s (attempting to terminate, ignored).",
            self.backend,
            limit.as_secs()
        );
        self.runner.terminate(invocation);

        Err(PkgOpsError::Timeout {
            command: invocation.command_line(),
            seconds: limit.as_secs(),
        })
    }
}

impl std::fmt::Debug for BackendExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendExecutor")
            .field("backend", &self.backend)
            .field("settings", &self.settings)
            .field("policy", &self.policy)
            .finish()
    }
}

fn names_of(entries: &[PackageEntry]) -> Vec<String> {
    entries.iter().map(|e| e.name().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Fails the first `failures` matching calls, then succeeds
    #[derive(Default)]
    struct FlakyRunner {
        failures: Mutex<usize>,
        calls: Mutex<Vec<String>>,
        fail_scripts: bool,
        lines: Vec<&'static str>,
    }

    impl FlakyRunner {
        fn failing(failures: usize) -> Self {
            Self {
                failures: Mutex::new(failures),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for FlakyRunner {
        fn run(&self, inv: &Invocation, on_line: &mut dyn FnMut(&str)) -> Result<CommandOutput> {
            let line = inv.command_line();
            self.calls.lock().unwrap().push(line.clone());

            let is_backend = line.starts_with("pacman") || line.contains(" paru ");
            if !is_backend {
                let exit_code = if self.fail_scripts { 2 } else { 0 };
                return Ok(CommandOutput { exit_code, output: String::new() });
            }

            self.lines.iter().for_each(|l| on_line(l));
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Ok(CommandOutput {
                    exit_code: 1,
                    output: "error: failed retrieving file".into(),
                });
            }
            Ok(CommandOutput::default())
        }
    }

    fn executor(runner: Arc<FlakyRunner>, backend: BackendKind, policy: ExecPolicy, retries: u32) -> BackendExecutor {
        let settings = BackendSettings {
            num_retries: retries,
            ..Default::default()
        };
        BackendExecutor::new(backend, settings, policy, runner)
    }

    #[test]
    fn test_strict_retries_until_success() {
        let runner = Arc::new(FlakyRunner::failing(2));
        let exec = executor(runner.clone(), BackendKind::Pacman, ExecPolicy::Strict, 2);
        assert!(exec.update_db().unwrap());
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn test_strict_gives_up_after_retries() {
        let runner = Arc::new(FlakyRunner::failing(5));
        let exec = executor(runner.clone(), BackendKind::Pacman, ExecPolicy::Strict, 1);
        let err = exec.update_db().unwrap_err();
        assert_eq!(runner.calls().len(), 2);
        assert_eq!(err.command_line(), Some("pacman -Sy"));
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn test_best_effort_never_errors() {
        let runner = Arc::new(FlakyRunner::failing(usize::MAX));
        let exec = executor(runner.clone(), BackendKind::Paru, ExecPolicy::BestEffort, 2);
        let mut progress = ProgressTracker::detached();
        assert!(!exec.install(&["yay-bin".into()], false, &mut progress).unwrap());
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn test_install_command_line() {
        let runner = Arc::new(FlakyRunner::default());
        let settings = BackendSettings {
            needed_only: true,
            disable_download_timeout: true,
            ..Default::default()
        };
        let exec = BackendExecutor::new(BackendKind::Pacman, settings, ExecPolicy::Strict, runner.clone());
        let mut progress = ProgressTracker::detached();
        exec.install(&["vim".into(), "git".into()], false, &mut progress).unwrap();
        exec.install(&["/tmp/foo.pkg.tar.zst".into()], true, &mut progress).unwrap();
        exec.remove(&["nano".into()], &mut progress).unwrap();
        exec.update_system().unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "pacman -S --noconfirm --noprogressbar --needed --disable-download-timeout vim git",
                "pacman -U --noconfirm --noprogressbar --needed --disable-download-timeout /tmp/foo.pkg.tar.zst",
                "pacman -Rs --noconfirm nano",
                "pacman -Su --noconfirm --disable-download-timeout",
            ]
        );
    }

    #[test]
    fn test_paru_runs_as_build_user() {
        let runner = Arc::new(FlakyRunner::default());
        let exec = executor(runner.clone(), BackendKind::Paru, ExecPolicy::BestEffort, 0);
        let mut progress = ProgressTracker::detached();
        exec.remove(&["yay".into()], &mut progress).unwrap();
        assert_eq!(runner.calls(), vec!["sudo -E -u nobody paru -Rs --noconfirm yay"]);
    }

    #[test]
    fn test_strict_batches_simple_entries() {
        let runner = Arc::new(FlakyRunner::default());
        let exec = executor(runner.clone(), BackendKind::Pacman, ExecPolicy::Strict, 0);
        let mut progress = ProgressTracker::detached();
        exec.operation_install(&["vim".into(), "git".into()], false, &mut progress).unwrap();
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn test_scripted_entries_run_scripts_in_order() {
        let runner = Arc::new(FlakyRunner::default());
        let exec = executor(runner.clone(), BackendKind::Pacman, ExecPolicy::Strict, 0);
        let mut progress = ProgressTracker::detached();
        let entries = vec![
            PackageEntry::simple("vim"),
            PackageEntry::scripted("foo", Some("systemctl  stop foo"), Some("foo-setup --all")),
        ];
        exec.operation_install(&entries, false, &mut progress).unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "pacman -S --noconfirm --noprogressbar vim",
                "systemctl stop foo",
                "pacman -S --noconfirm --noprogressbar foo",
                "foo-setup --all",
            ]
        );
    }

    #[test]
    fn test_strict_script_failure_propagates() {
        let runner = Arc::new(FlakyRunner {
            fail_scripts: true,
            ..Default::default()
        });
        let exec = executor(runner.clone(), BackendKind::Pacman, ExecPolicy::Strict, 0);
        let mut progress = ProgressTracker::detached();
        let entry = PackageEntry::scripted("foo", Some("false"), None);
        assert!(exec.install_package(&entry, false, &mut progress).is_err());
        assert_eq!(runner.calls(), vec!["false"]);
    }

    #[test]
    fn test_best_effort_pre_script_failure_skips_package() {
        let runner = Arc::new(FlakyRunner {
            fail_scripts: true,
            ..Default::default()
        });
        let exec = executor(runner.clone(), BackendKind::Paru, ExecPolicy::BestEffort, 0);
        let mut progress = ProgressTracker::detached();
        let entries = vec![
            PackageEntry::scripted("foo", Some("false"), None),
            PackageEntry::simple("bar"),
        ];
        exec.operation_install(&entries, false, &mut progress).unwrap();
        assert_eq!(
            runner.calls(),
            vec!["false", "sudo -E -u nobody paru -S --noconfirm --noprogressbar bar"]
        );
    }

    #[test]
    fn test_try_install_turns_strict_failure_into_warning() {
        let runner = Arc::new(FlakyRunner::failing(1));
        let exec = executor(runner.clone(), BackendKind::Pacman, ExecPolicy::Strict, 0);
        let mut progress = ProgressTracker::detached();
        exec.operation_try_install(&["missing".into(), "vim".into()], &mut progress)
            .unwrap();
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn test_output_lines_reach_progress() {
        let runner = Arc::new(FlakyRunner {
            lines: vec![":: Processing package changes...", "installing vim..."],
            ..Default::default()
        });
        let exec = executor(runner, BackendKind::Pacman, ExecPolicy::Strict, 0);
        let mut progress = ProgressTracker::detached();
        progress.init(1);
        exec.install(&["vim".into()], false, &mut progress).unwrap();
        assert_eq!(progress.status(), "pacman: installing vim...");
    }

    #[test]
    fn test_bootstrap_only_for_paru() {
        let runner = Arc::new(FlakyRunner::default());
        executor(runner.clone(), BackendKind::Pacman, ExecPolicy::Strict, 0).bootstrap();
        assert!(runner.calls().is_empty());

        executor(runner.clone(), BackendKind::Paru, ExecPolicy::BestEffort, 0).bootstrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].contains("/etc/sudoers.d/pkgops-paru"));
        assert!(calls[1].contains(PARU_CACHE_DIR));
    }
}
