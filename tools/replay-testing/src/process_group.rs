use crate::config::{PlayerConfig, RecorderConfig};
use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::runtime::{Clock, ProcessRequest, ProcessRunner};
use crate::types::EnvMap;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: EnvMap,
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            env: EnvMap::new(),
            cwd: None,
        }
    }

    pub fn from_argv(argv: &[String]) -> Result<Self, ReplayError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ReplayError::Configuration("empty process command".to_string()))?;
        Ok(Self::new(program, args.iter().cloned()))
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessRole {
    Recorder {
        destination: PathBuf,
    },
    Player {
        source: PathBuf,
        rate: f64,
        use_sim_clock: bool,
    },
    SystemUnderTest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchedProcess {
    pub name: String,
    pub role: ProcessRole,
    pub spec: ProcessSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    ShutdownGroup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitHandler {
    pub target: String,
    pub action: ExitAction,
}

/// Processes in launch order plus the exit handlers wired between them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LaunchDescription {
    pub processes: Vec<LaunchedProcess>,
    pub exit_handlers: Vec<ExitHandler>,
}

impl LaunchDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_process(mut self, name: &str, spec: ProcessSpec) -> Self {
        self.processes.push(LaunchedProcess {
            name: name.to_string(),
            role: ProcessRole::SystemUnderTest,
            spec,
        });
        self
    }

    pub fn shutdown_on_exit_of(&self, name: &str) -> bool {
        self.exit_handlers
            .iter()
            .any(|h| h.target == name && h.action == ExitAction::ShutdownGroup)
    }
}

pub fn recorder_process(
    cfg: &RecorderConfig,
    destination: &Path,
) -> Result<LaunchedProcess, ReplayError> {
    let destination_text = destination.display().to_string();
    let argv: Vec<String> = cfg
        .command
        .iter()
        .map(|arg| arg.replace("{destination}", &destination_text))
        .collect();
    Ok(LaunchedProcess {
        name: "recorder".to_string(),
        role: ProcessRole::Recorder {
            destination: destination.to_path_buf(),
        },
        spec: ProcessSpec::from_argv(&argv)?,
    })
}

pub fn player_process(
    cfg: &PlayerConfig,
    source: &Path,
    rate: f64,
    use_sim_clock: bool,
    extra_args: &[String],
) -> Result<LaunchedProcess, ReplayError> {
    let source_text = source.display().to_string();
    let rate_text = rate.to_string();
    let mut argv: Vec<String> = cfg
        .command
        .iter()
        .map(|arg| arg.replace("{source}", &source_text).replace("{rate}", &rate_text))
        .collect();
    if use_sim_clock {
        argv.extend(cfg.clock_args.iter().cloned());
    }
    argv.extend(extra_args.iter().cloned());
    Ok(LaunchedProcess {
        name: "player".to_string(),
        role: ProcessRole::Player {
            source: source.to_path_buf(),
            rate,
            use_sim_clock,
        },
        spec: ProcessSpec::from_argv(&argv)?,
    })
}

/// Recorder first so nothing is missed, then the test's own processes, then
/// the player, whose exit shuts the group down.
pub fn compose_run_group(
    recorder: LaunchedProcess,
    test_description: LaunchDescription,
    player: LaunchedProcess,
) -> LaunchDescription {
    let player_name = player.name.clone();
    let mut processes = Vec::with_capacity(test_description.processes.len() + 2);
    processes.push(recorder);
    processes.extend(test_description.processes);
    processes.push(player);

    let mut exit_handlers = test_description.exit_handlers;
    exit_handlers.push(ExitHandler {
        target: player_name,
        action: ExitAction::ShutdownGroup,
    });
    LaunchDescription {
        processes,
        exit_handlers,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub name: String,
    pub exit_code: Option<i32>,
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupOutcome {
    pub exits: Vec<ProcessExit>,
    pub shutdown_trigger: Option<String>,
}

pub trait ProcessGroup: Send + Sync {
    fn run(&self, description: &LaunchDescription, env: &EnvMap) -> Result<GroupOutcome, ReplayError>;
}

enum GroupEvent {
    Exited { index: usize, code: Option<i32> },
    GraceExpired,
}

struct Running {
    name: String,
    pid: u32,
    exited: bool,
    forced: bool,
    code: Option<i32>,
}

/// Runs a launch description as OS processes and waits for all of them.
pub struct CommandProcessGroup {
    process_runner: Arc<dyn ProcessRunner>,
    clock: Arc<dyn Clock>,
    grace_period: Duration,
}

impl CommandProcessGroup {
    pub fn new(
        process_runner: Arc<dyn ProcessRunner>,
        clock: Arc<dyn Clock>,
        grace_period: Duration,
    ) -> Self {
        Self {
            process_runner,
            clock,
            grace_period,
        }
    }

    fn signal(&self, signal: &str, pid: u32) {
        let request = ProcessRequest::new("kill", [signal.to_string(), pid.to_string()]);
        if let Err(err) = self.process_runner.run(request) {
            append_run_log(
                "warn",
                "run.group.signal_failed",
                json!({"pid": pid, "signal": signal, "error": err.to_string()}),
            );
        }
    }

    /// SIGINT everything still alive, newest first, and arm the grace timer.
    fn begin_shutdown(&self, running: &[Running], tx: &mpsc::Sender<GroupEvent>) {
        for process in running.iter().rev().filter(|p| !p.exited) {
            self.signal("-INT", process.pid);
        }
        let clock = Arc::clone(&self.clock);
        let deadline = clock.now() + self.grace_period;
        let tx = tx.clone();
        thread::spawn(move || {
            let _ = clock.sleep_until(deadline);
            let _ = tx.blocking_send(GroupEvent::GraceExpired);
        });
    }

    fn wait_all(
        &self,
        running: &mut [Running],
        description: &LaunchDescription,
        tx: &mpsc::Sender<GroupEvent>,
        rx: &mut mpsc::Receiver<GroupEvent>,
        mut shutting_down: bool,
    ) -> Result<Option<String>, ReplayError> {
        let mut trigger = None;
        while running.iter().any(|p| !p.exited) {
            let event = rx
                .blocking_recv()
                .ok_or_else(|| ReplayError::Process("process group channel closed".to_string()))?;
            match event {
                GroupEvent::Exited { index, code } => {
                    let Some(process) = running.get_mut(index) else {
                        continue;
                    };
                    process.exited = true;
                    process.code = code;
                    append_run_log(
                        "debug",
                        "run.process.exited",
                        json!({"name": process.name, "exit_code": code}),
                    );
                    if !shutting_down && description.shutdown_on_exit_of(&process.name) {
                        shutting_down = true;
                        trigger = Some(process.name.clone());
                        self.begin_shutdown(running, tx);
                    }
                }
                GroupEvent::GraceExpired => {
                    for process in running.iter_mut().rev().filter(|p| !p.exited) {
                        append_run_log(
                            "warn",
                            "run.process.forced_kill",
                            json!({"name": process.name, "pid": process.pid}),
                        );
                        process.forced = true;
                        self.signal("-KILL", process.pid);
                    }
                }
            }
        }
        Ok(trigger)
    }
}

impl ProcessGroup for CommandProcessGroup {
    fn run(&self, description: &LaunchDescription, env: &EnvMap) -> Result<GroupOutcome, ReplayError> {
        let (tx, mut rx) = mpsc::channel::<GroupEvent>(64);
        let mut running: Vec<Running> = Vec::with_capacity(description.processes.len());

        for (index, launched) in description.processes.iter().enumerate() {
            let spec = &launched.spec;
            let mut command = Command::new(&spec.program);
            command
                .args(&spec.args)
                .envs(env)
                .envs(&spec.env)
                .stdin(Stdio::null());
            if let Some(cwd) = &spec.cwd {
                command.current_dir(cwd);
            }

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(err) => {
                    append_run_log(
                        "error",
                        "run.process.spawn_failed",
                        json!({"name": launched.name, "command": spec.command_line(), "error": err.to_string()}),
                    );
                    if running.iter().any(|p| !p.exited) {
                        self.begin_shutdown(&running, &tx);
                        self.wait_all(&mut running, description, &tx, &mut rx, true)?;
                    }
                    return Err(ReplayError::Process(format!(
                        "failed to start `{}` ({}): {err}",
                        launched.name,
                        spec.command_line()
                    )));
                }
            };

            append_run_log(
                "info",
                "run.process.started",
                json!({"name": launched.name, "pid": child.id(), "command": spec.command_line()}),
            );
            running.push(Running {
                name: launched.name.clone(),
                pid: child.id(),
                exited: false,
                forced: false,
                code: None,
            });

            let tx = tx.clone();
            thread::spawn(move || {
                let code = child.wait().ok().and_then(|status| status.code());
                let _ = tx.blocking_send(GroupEvent::Exited { index, code });
            });
        }

        let trigger = self.wait_all(&mut running, description, &tx, &mut rx, false)?;
        let outcome = GroupOutcome {
            exits: running
                .into_iter()
                .map(|p| ProcessExit {
                    name: p.name,
                    exit_code: p.code,
                    forced: p.forced,
                })
                .collect(),
            shutdown_trigger: trigger,
        };
        append_run_log(
            "info",
            "run.group.completed",
            json!({
                "trigger": outcome.shutdown_trigger,
                "processes": outcome.exits.len(),
                "forced": outcome.exits.iter().filter(|e| e.forced).count(),
            }),
        );
        Ok(outcome)
    }
}
