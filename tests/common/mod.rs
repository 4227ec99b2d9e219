//! Shared helpers for the integration tests
//!
//! `ScriptedRunner` stands in for pacman/paru: every command line is recorded
//! and answered by the first rule whose pattern it contains. Commands no rule
//! matches succeed silently.

#![allow(dead_code)]

use pkgops::error::Result;
use pkgops::progress::{ChannelSink, ProgressEvent};
use pkgops::runner::{CommandOutput, CommandRunner, Invocation};
use std::sync::mpsc::{self, Receiver};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// How a matching command behaves
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub exit_code: i32,
    pub lines: Vec<String>,
    /// Time the command takes before it exits
    pub delay: Duration,
    /// Only the first `n` matching calls exit with `exit_code`, later ones succeed
    pub failures: Option<usize>,
}

impl Response {
    pub fn ok_lines(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn fail(exit_code: i32) -> Self {
        Self {
            exit_code,
            lines: vec!["error: target not found".to_string()],
            ..Default::default()
        }
    }

    pub fn fail_times(exit_code: i32, n: usize) -> Self {
        Self {
            failures: Some(n),
            ..Self::fail(exit_code)
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }
}

struct Rule {
    pattern: String,
    response: Response,
    hits: usize,
}

#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    terminated: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `response` (builder style)
    pub fn on(self, pattern: &str, response: Response) -> Self {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            response,
            hits: 0,
        });
        self
    }

    /// Answer the two index queries of pacman with `packages` and `groups`
    pub fn with_pacman_index(self, packages: &[&str], groups: &[&str]) -> Self {
        self.on("pacman -Slq", Response::ok_lines(packages))
            .on("pacman -Sgq", Response::ok_lines(groups))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_containing(&self, pattern: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.contains(pattern))
            .collect()
    }

    /// Command lines the executor asked to stop, in order
    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }

    fn respond(&self, command_line: &str) -> (i32, Vec<String>, Duration) {
        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|r| command_line.contains(&r.pattern)) else {
            return (0, Vec::new(), Duration::ZERO);
        };

        rule.hits += 1;
        let response = &rule.response;
        let exit_code = match response.failures {
            Some(n) if rule.hits > n => 0,
            _ => response.exit_code,
        };
        (exit_code, response.lines.clone(), response.delay)
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation, on_line: &mut dyn FnMut(&str)) -> Result<CommandOutput> {
        let command_line = invocation.command_line();
        self.calls.lock().unwrap().push(command_line.clone());

        let (exit_code, lines, delay) = self.respond(&command_line);
        for line in &lines {
            on_line(line);
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        Ok(CommandOutput {
            exit_code,
            output: lines.join("\n"),
        })
    }

    fn terminate(&self, invocation: &Invocation) {
        self.terminated.lock().unwrap().push(invocation.command_line());
    }
}

/// A progress sink whose updates can be inspected after the run
pub fn recording_sink() -> (Box<ChannelSink>, Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel();
    (Box::new(ChannelSink::new(tx)), rx)
}

/// Every progress fraction reported, in order
pub fn fractions(rx: &Receiver<ProgressEvent>) -> Vec<f64> {
    rx.try_iter()
        .filter_map(|event| match event {
            ProgressEvent::Progress(f) => Some(f),
            ProgressEvent::Status(_) => None,
        })
        .collect()
}

pub fn config(json: &str) -> pkgops::JobConfig {
    serde_json::from_str(json).expect("test configuration should parse")
}
