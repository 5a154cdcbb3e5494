use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::workspace::Workspace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn from_argv(argv: Vec<String>) -> Result<Self> {
        let mut it = argv.into_iter();
        let Some(program) = it.next().filter(|p| !p.trim().is_empty()) else {
            return Err(Error::Project("empty command template".into()));
        };
        Ok(Self {
            args: it.collect(),
            ..Self::new(program)
        })
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn envs(mut self, envs: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(envs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn command_line(&self) -> String {
        let mut out = self.program.clone();
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        out
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl CommandStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &CommandSpec, log: &mut dyn FnMut(&str)) -> Result<CommandStatus>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, spec: &CommandSpec, log: &mut dyn FnMut(&str)) -> Result<CommandStatus> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        // The child stays in our process group so a terminal interrupt reaches it too.
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io(format!("failed to spawn `{}`", spec.program), e))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                log(&line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::io(format!("failed to wait for `{}`", spec.program), e))?;
        Ok(CommandStatus {
            code: status.code(),
        })
    }
}

type ScriptFn = Box<dyn Fn(&CommandSpec) -> i32 + Send + Sync>;

/// Records every command instead of spawning it. Scripts keyed by a substring
/// of the command line decide the exit code and may touch the filesystem to
/// stand in for the real tool; the most recently added matching script wins.
/// Unmatched commands succeed.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<Vec<(String, ScriptFn)>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, needle: impl Into<String>, f: F)
    where
        F: Fn(&CommandSpec) -> i32 + Send + Sync + 'static,
    {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((needle.into(), Box::new(f)));
    }

    pub fn fail(&self, needle: impl Into<String>, code: i32) {
        self.on(needle, move |_| code);
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.command_line().contains(needle))
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec, log: &mut dyn FnMut(&str)) -> Result<CommandStatus> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());

        let line = spec.command_line();
        let scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        let code = scripts
            .iter()
            .rev()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, f)| f(spec))
            .unwrap_or(0);
        log(&format!("scripted exit {code}"));
        Ok(CommandStatus { code: Some(code) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    PhaseSkipped {
        id: String,
        reason: String,
    },
    PhaseStarted {
        id: String,
        label: String,
    },
    PhaseLog {
        id: String,
        line: String,
    },
    PhaseFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    BuildFinished {
        exit_code: Option<i32>,
        jobs: usize,
        elapsed_ms: u128,
    },
    Done {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

/// Prints progress lines and a summary. When a phase fails, its captured
/// output is written to `<error_logs_dir>/<timestamp>/<phase>.log`.
#[derive(Default)]
pub struct StdoutSink {
    error_logs_dir: Option<PathBuf>,
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    executed: Vec<String>,
    skipped: Vec<String>,
    failed: Vec<String>,
    log_lines: usize,
    phase_logs: BTreeMap<String, VecDeque<String>>,
    error_log_paths: Vec<PathBuf>,
    run_stamp: Option<String>,
}

impl StdoutSink {
    pub fn new(error_logs_dir: Option<PathBuf>) -> Self {
        Self {
            error_logs_dir,
            state: Mutex::default(),
        }
    }

    fn write_error_log(
        &self,
        state: &mut StdoutSinkState,
        id: &str,
        error: Option<&str>,
        elapsed_ms: u128,
    ) -> Result<Option<PathBuf>> {
        let Some(base) = self.error_logs_dir.as_ref() else {
            return Ok(None);
        };
        let stamp = state
            .run_stamp
            .get_or_insert_with(|| chrono::Local::now().format("%Y%m%d-%H%M%S").to_string())
            .clone();
        let dir = base.join(stamp);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("failed to create {}", dir.display()), e))?;

        let mut body = format!("phase: {id}\nstatus: failed\nelapsed_ms: {elapsed_ms}\n");
        if let Some(e) = error.filter(|e| !e.trim().is_empty()) {
            body.push_str(&format!("error: {e}\n"));
        }
        body.push_str("\nlogs:\n");
        for line in state.phase_logs.get(id).into_iter().flatten() {
            body.push_str(line);
            body.push('\n');
        }

        let path = dir.join(format!("{}.log", sanitize_filename_component(id)));
        fs::write(&path, body)
            .map_err(|e| Error::io(format!("failed to write {}", path.display()), e))?;
        state.error_log_paths.push(path.clone());
        Ok(Some(path))
    }
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.started_at.is_none() {
            state.started_at = Some(Instant::now());
        }
        match ev {
            ExecEvent::PhaseSkipped { id, reason } => {
                println!("SKIP: {id} ({reason})");
                state.skipped.push(id);
            }
            ExecEvent::PhaseStarted { id, label } => {
                println!("RUN: {id} - {label}");
            }
            ExecEvent::PhaseLog { id, line } => {
                println!("[{id}] {line}");
                state.log_lines = state.log_lines.saturating_add(1);
                append_phase_log_line(&mut state.phase_logs, &id, &line);
            }
            ExecEvent::PhaseFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if ok {
                    println!("DONE: {id} ({})", format_elapsed_ms(elapsed_ms));
                    state.phase_logs.remove(&id);
                    state.executed.push(id);
                } else {
                    println!(
                        "FAIL: {id} ({}) {}",
                        format_elapsed_ms(elapsed_ms),
                        error.as_deref().unwrap_or_default()
                    );
                    match self.write_error_log(&mut state, &id, error.as_deref(), elapsed_ms) {
                        Ok(Some(path)) => println!("ERROR_LOG: {id} => {}", path.display()),
                        Ok(None) => {}
                        Err(e) => tracing::warn!(phase = %id, error = %e, "failed to write phase error log"),
                    }
                    state.failed.push(id);
                }
            }
            ExecEvent::BuildFinished {
                exit_code,
                jobs,
                elapsed_ms,
            } => {
                let code = exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".into());
                println!(
                    "BUILD: exit={code} jobs={jobs} elapsed={}",
                    format_elapsed_ms(elapsed_ms)
                );
            }
            ExecEvent::Done { ok, error } => {
                let wall = state.started_at.map(|t| t.elapsed()).unwrap_or_default();
                let mut summary = String::from("SUMMARY:\n");
                summary.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
                summary.push_str(&format!(
                    "  phases: executed={} skipped={} failed={}\n",
                    state.executed.len(),
                    state.skipped.len(),
                    state.failed.len()
                ));
                if !state.executed.is_empty() {
                    summary.push_str(&format!("  executed: {}\n", state.executed.join(", ")));
                }
                summary.push_str(&format!("  logs: {}\n", state.log_lines));
                summary.push_str(&format!(
                    "  elapsed: {}\n",
                    format_elapsed_hms(wall.as_secs())
                ));
                for p in &state.error_log_paths {
                    summary.push_str(&format!("  error_log: {}\n", p.display()));
                }
                if let Some(e) = error.filter(|_| !ok) {
                    summary.push_str(&format!("  error: {e}\n"));
                }
                print!("{summary}");
                *state = StdoutSinkState::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub workspace: Workspace,
    pub sink: Arc<dyn ExecSink>,
    pub runner: Arc<dyn CommandRunner>,
    pub current_phase: Option<String>,
}

impl ExecCtx {
    pub fn new(workspace: Workspace, runner: Arc<dyn CommandRunner>, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            workspace,
            sink,
            runner,
            current_phase: None,
        }
    }

    pub fn set_phase(&mut self, id: impl Into<String>) {
        self.current_phase = Some(id.into());
    }

    pub fn phase(&self) -> String {
        self.current_phase
            .clone()
            .unwrap_or_else(|| "<none>".into())
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(ExecEvent::PhaseLog {
            id: self.phase(),
            line: msg.to_string(),
        });
    }

    pub fn run_status(&self, spec: &CommandSpec) -> Result<CommandStatus> {
        self.log(&format!("$ {}", spec.command_line()));
        let id = self.phase();
        let sink = Arc::clone(&self.sink);
        let mut forward = |line: &str| {
            sink.emit(ExecEvent::PhaseLog {
                id: id.clone(),
                line: line.to_string(),
            })
        };
        tracing::debug!(phase = %id, command = %spec, "running command");
        self.runner.run(spec, &mut forward)
    }

    /// Run a command; a nonzero exit becomes an `ExternalCommand` error for the current phase.
    pub fn run(&self, spec: CommandSpec) -> Result<()> {
        let status = self.run_status(&spec)?;
        if status.success() {
            return Ok(());
        }
        Err(Error::ExternalCommand {
            phase: self.phase(),
            command: spec.command_line(),
            code: status.code,
        })
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(pending).into_owned());
            pending.clear();
        }
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}

fn append_phase_log_line(logs: &mut BTreeMap<String, VecDeque<String>>, id: &str, line: &str) {
    const MAX_LINES: usize = 4000;
    let q = logs.entry(id.to_string()).or_default();
    while q.len() >= MAX_LINES {
        q.pop_front();
    }
    q.push_back(line.to_string());
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "phase".into() } else { out }
}

fn format_elapsed_ms(ms: u128) -> String {
    if ms < 10_000 {
        format!("{ms}ms")
    } else {
        format_elapsed_hms((ms / 1000) as u64)
    }
}

pub fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;

    fn ctx_with(runner: Arc<ScriptedRunner>) -> (ExecCtx, mpsc::Receiver<ExecEvent>) {
        let ws = Workspace::from_config(&ProjectConfig::defaults_in(std::path::Path::new("/p")))
            .expect("workspace");
        let (tx, rx) = mpsc::channel();
        let ctx = ExecCtx::new(ws, runner, Arc::new(ChannelSink::new(tx)));
        (ctx, rx)
    }

    #[test]
    fn from_argv_rejects_empty_program() {
        assert!(CommandSpec::from_argv(vec![]).is_err());
        assert!(CommandSpec::from_argv(vec![" ".into()]).is_err());
        let spec = CommandSpec::from_argv(vec!["ninja".into(), "-C".into(), "out".into()])
            .expect("spec");
        assert_eq!(spec.command_line(), "ninja -C out");
    }

    #[test]
    fn nonzero_exit_becomes_external_command_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("patches.py", 4);
        let (mut ctx, _rx) = ctx_with(runner.clone());
        ctx.set_phase("prune-patch");

        let err = ctx
            .run(CommandSpec::new("python3").arg("utils/patches.py"))
            .unwrap_err();
        match err {
            Error::ExternalCommand { phase, code, .. } => {
                assert_eq!(phase, "prune-patch");
                assert_eq!(code, Some(4));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(runner.count("patches.py"), 1);
    }

    #[test]
    fn latest_script_wins() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("ninja", 1);
        runner.fail("ninja", 7);
        let (ctx, _rx) = ctx_with(runner);
        let status = ctx.run_status(&CommandSpec::new("ninja")).expect("status");
        assert_eq!(status.code, Some(7));
    }

    #[test]
    fn command_output_is_forwarded_as_phase_logs() {
        let runner = Arc::new(ScriptedRunner::new());
        let (mut ctx, rx) = ctx_with(runner);
        ctx.set_phase("toolchain");
        ctx.run(CommandSpec::new("true")).expect("run");

        let lines: Vec<_> = rx
            .try_iter()
            .filter_map(|ev| match ev {
                ExecEvent::PhaseLog { id, line } => Some((id, line)),
                _ => None,
            })
            .collect();
        assert!(lines.iter().all(|(id, _)| id == "toolchain"));
        assert!(lines.iter().any(|(_, l)| l == "$ true"));
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_streams_lines_and_reports_code() {
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("echo one; echo two 1>&2; exit 3");
        let mut lines = Vec::new();
        let status = ProcessRunner
            .run(&spec, &mut |l: &str| lines.push(l.to_string()))
            .expect("run");
        assert_eq!(status.code, Some(3));
        lines.sort();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed_hms(3725), "01:02:05");
        assert_eq!(format_elapsed_ms(250), "250ms");
        assert_eq!(format_elapsed_ms(65_000), "00:01:05");
    }
}
