//! Built-in programs installed on every virtual system.
//!
//! Between them these use every yield token kind: `sleep` (delay and
//! sequence), `read` (input), `kill` (act-wait), `wait` (aggregate) and the
//! login `shell` (input and condition). `rm` waits on a keyed response.

use crate::error::{FsError, TaskError};
use crate::executable::{task_fn, CompletionContext, ExecutableRegistry, Invocation, Step, StepContext, Task};
use crate::process::{ChildHandle, CompletionKind};
use crate::queue::KillTicket;
use crate::system::Filesystem;
use crate::world::LOGIN_SHELL;
use crate::yield_token::{InputSlot, YieldToken};

use hacknet_env::{OutputEvent, PersonContext, Pid};
use tracing::debug;

/// Registers every built-in program.
pub fn register_builtins(registry: &mut ExecutableRegistry) {
    registry.register_fn("echo", echo);
    registry.register_fn("pwd", |_| task_fn(pwd));
    registry.register_fn("cd", cd);
    registry.register_fn("ls", ls);
    registry.register_fn("ps", |_| task_fn(ps));
    registry.register_fn("sleep", |inv| Box::new(Sleep::new(&inv.args)) as Box<dyn Task>);
    registry.register_fn("read", |inv| Box::new(Read::new(inv.args.join(" "))) as Box<dyn Task>);
    registry.register_fn("kill", |inv| Box::new(Kill::new(&inv.args)) as Box<dyn Task>);
    registry.register_fn("wait", |inv| Box::new(Wait::new(&inv.args)) as Box<dyn Task>);
    registry.register_fn("rm", |inv| Box::new(Remove::new(&inv.args)) as Box<dyn Task>);
    registry.register_fn("daemon", |inv| Box::new(Daemon::new(&inv.args)) as Box<dyn Task>);
    registry.register_fn(LOGIN_SHELL, |_| Box::new(Shell::default()) as Box<dyn Task>);
}

/// Working directory of the caller's login on this system.
fn cwd(cx: &StepContext<'_>) -> String {
    cx.login().map(|login| login.cwd.clone()).unwrap_or_else(|| "/".to_string())
}

fn echo(inv: Invocation) -> Box<dyn Task> {
    let text = inv.args.join(" ");
    task_fn(move |cx| {
        cx.print(text.clone());
        Ok(Step::Done)
    })
}

fn pwd(cx: &mut StepContext<'_>) -> Result<Step, TaskError> {
    cx.print(cwd(cx));
    Ok(Step::Done)
}

fn cd(inv: Invocation) -> Box<dyn Task> {
    let target = inv.args.first().cloned();
    task_fn(move |cx| {
        let home = cx
            .system()
            .and_then(|system| system.account(cx.user()))
            .map(|account| account.home.clone())
            .unwrap_or_else(|| "/".to_string());
        let path = Filesystem::resolve(&cwd(cx), target.as_deref().unwrap_or(&home));

        let is_dir = cx.system().map_or(false, |system| system.fs.is_dir(&path));
        if !is_dir {
            cx.error(format!("cd: {}: no such directory", path));
            return Ok(Step::Done);
        }
        match cx.login_mut() {
            Some(login) => login.cwd = path,
            None => cx.error("cd: not logged in"),
        }
        Ok(Step::Done)
    })
}

fn ls(inv: Invocation) -> Box<dyn Task> {
    let target = inv.args.first().cloned();
    task_fn(move |cx| {
        let path = match &target {
            Some(target) => Filesystem::resolve(&cwd(cx), target),
            None => cwd(cx),
        };
        let system = cx.system().ok_or_else(|| TaskError::failed("system is gone"))?;
        match system.fs.list(&path) {
            Ok(names) => {
                let lines: Vec<String> = names
                    .into_iter()
                    .map(|name| {
                        if system.fs.is_dir(&Filesystem::resolve(&path, &name)) {
                            format!("{}/", name)
                        } else {
                            name
                        }
                    })
                    .collect();
                for line in lines {
                    cx.print(line);
                }
            }
            Err(e) => cx.error(format!("ls: {}", e)),
        }
        Ok(Step::Done)
    })
}

fn ps(cx: &mut StepContext<'_>) -> Result<Step, TaskError> {
    cx.print(format!("{:>5} {:>5} {:<8} {}", "PID", "PPID", "USER", "CMD"));
    for info in cx.processes() {
        cx.print(format!("{:>5} {:>5} {:<8} {}", info.pid, info.parent_pid, info.user, info.name));
    }
    Ok(Step::Done)
}

/// `sleep <secs>...` - waits the sum of its arguments in simulated seconds.
struct Sleep {
    durations: Result<Vec<f64>, String>,
    started: bool,
}

impl Sleep {
    fn new(args: &[String]) -> Self {
        let durations = if args.is_empty() {
            Err("sleep: missing operand".to_string())
        } else {
            args.iter()
                .map(|arg| match arg.parse::<f64>() {
                    Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok(secs),
                    _ => Err(format!("sleep: invalid time interval '{}'", arg)),
                })
                .collect()
        };
        Self {
            durations,
            started: false,
        }
    }
}

impl Task for Sleep {
    fn step(&mut self, cx: &mut StepContext<'_>) -> Result<Step, TaskError> {
        if self.started {
            return Ok(Step::Done);
        }
        self.started = true;

        let durations = match &self.durations {
            Ok(durations) => durations,
            Err(message) => {
                cx.error(message.clone());
                return Ok(Step::Done);
            }
        };
        let token = match durations.as_slice() {
            [secs] => YieldToken::delay(*secs),
            many => YieldToken::sequence(many.iter().map(|secs| YieldToken::delay(*secs))),
        };
        Ok(Step::wait(token))
    }
}

/// `read [prompt]` - prompts for one line and echoes it back.
struct Read {
    prompt: String,
    slot: Option<InputSlot>,
}

impl Read {
    fn new(prompt: String) -> Self {
        let prompt = if prompt.is_empty() { "> ".to_string() } else { prompt };
        Self { prompt, slot: None }
    }
}

impl Task for Read {
    fn step(&mut self, cx: &mut StepContext<'_>) -> Result<Step, TaskError> {
        match self.slot.take() {
            None => {
                cx.prompt(self.prompt.clone());
                let (token, slot) = cx.input_token();
                self.slot = Some(slot);
                Ok(Step::wait(token))
            }
            Some(slot) => {
                cx.print(slot.take().unwrap_or_default());
                Ok(Step::Done)
            }
        }
    }
}

/// `kill [-r] <pid>` - cascade-kills a process on this system.
///
/// `-r` forces the kill past any veto and needs an admin login.
struct Kill {
    target: Option<(Pid, CompletionKind)>,
    ticket: Option<KillTicket>,
}

impl Kill {
    fn new(args: &[String]) -> Self {
        let target = match args {
            [pid] => pid.parse::<Pid>().ok().map(|pid| (pid, CompletionKind::KillLocal)),
            [flag, pid] if flag == "-r" => pid.parse::<Pid>().ok().map(|pid| (pid, CompletionKind::KillRemote)),
            _ => None,
        };
        Self { target, ticket: None }
    }
}

impl Task for Kill {
    fn step(&mut self, cx: &mut StepContext<'_>) -> Result<Step, TaskError> {
        if let Some(ticket) = self.ticket.take() {
            match ticket.outcome() {
                Some(Ok(pids)) => debug!(pid = cx.pid(), killed = ?pids, "kill finished"),
                Some(Err(e)) => cx.error(format!("kill: {}", e)),
                None => return Err(TaskError::failed("kill request was never decided")),
            }
            return Ok(Step::Done);
        }

        let Some((pid, kind)) = self.target else {
            cx.error("kill: usage: kill [-r] <pid>");
            return Ok(Step::Done);
        };
        if kind.is_forced() && !cx.login().map_or(false, |login| login.admin) {
            cx.error("kill: -r requires admin");
            return Ok(Step::Done);
        }

        let (token, ticket) = cx.kill_token(pid, kind);
        self.ticket = Some(ticket);
        Ok(Step::wait(token))
    }
}

/// `wait <pid>...` - waits until every listed process has ended.
struct Wait {
    pids: Result<Vec<Pid>, String>,
    started: bool,
}

impl Wait {
    fn new(args: &[String]) -> Self {
        let pids = args
            .iter()
            .map(|arg| arg.parse::<Pid>().map_err(|_| format!("wait: invalid pid '{}'", arg)))
            .collect();
        Self { pids, started: false }
    }
}

impl Task for Wait {
    fn step(&mut self, cx: &mut StepContext<'_>) -> Result<Step, TaskError> {
        if self.started {
            return Ok(Step::Done);
        }
        self.started = true;

        let pids = match &self.pids {
            Ok(pids) => pids,
            Err(message) => {
                cx.error(message.clone());
                return Ok(Step::Done);
            }
        };
        let mut watches = Vec::with_capacity(pids.len());
        for pid in pids {
            match cx.watch(*pid) {
                Some(handle) => watches.push(handle.exit),
                None => {
                    cx.error(format!("wait: no such process {}", pid));
                    return Ok(Step::Done);
                }
            }
        }
        let token = YieldToken::aggregate(
            watches
                .into_iter()
                .map(|exit| YieldToken::condition(move || exit.is_done())),
        );
        Ok(Step::wait(token))
    }
}

/// `rm [-f] <path>` - removes a file, asking for confirmation unless `-f`.
///
/// The answer arrives as a response under the operation's confirm key;
/// anything but `y` or `yes` keeps the file.
struct Remove {
    target: Option<(String, bool)>,
    path: String,
    answer: Option<InputSlot>,
}

impl Remove {
    fn new(args: &[String]) -> Self {
        let target = match args {
            [path] => Some((path.clone(), false)),
            [flag, path] if flag == "-f" => Some((path.clone(), true)),
            _ => None,
        };
        Self {
            target,
            path: String::new(),
            answer: None,
        }
    }

    fn remove(&self, cx: &mut StepContext<'_>) -> Result<Step, TaskError> {
        let system = cx.system_mut().ok_or_else(|| TaskError::failed("system is gone"))?;
        if let Err(e) = system.fs.remove(&self.path) {
            cx.error(format!("rm: {}", e));
        }
        Ok(Step::Done)
    }
}

impl Task for Remove {
    fn step(&mut self, cx: &mut StepContext<'_>) -> Result<Step, TaskError> {
        if let Some(slot) = self.answer.take() {
            let answer = slot.take().unwrap_or_default();
            return match answer.trim() {
                "y" | "yes" => self.remove(cx),
                _ => {
                    cx.print(format!("rm: kept {}", self.path));
                    Ok(Step::Done)
                }
            };
        }

        let Some((path, force)) = self.target.clone() else {
            cx.error("rm: usage: rm [-f] <path>");
            return Ok(Step::Done);
        };
        self.path = Filesystem::resolve(&cwd(cx), &path);
        if force {
            return self.remove(cx);
        }

        cx.prompt(format!("rm: remove '{}'? [y/n] ({})", self.path, cx.confirm_key()));
        let (token, slot) = cx.response_token();
        self.answer = Some(slot);
        Ok(Step::wait(token))
    }
}

const DAEMON_LOG: &str = "/var/log/daemon.log";

/// `daemon [interval] [batch]` - writes a heartbeat every `interval`
/// seconds, flushing to the log file every `batch` records.
///
/// Refuses non-forced shutdown while records are unflushed.
struct Daemon {
    interval: f64,
    batch: usize,
    pending: Vec<String>,
}

impl Daemon {
    fn new(args: &[String]) -> Self {
        let interval = args
            .first()
            .and_then(|a| a.parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .unwrap_or(1.0);
        let batch = args.get(1).and_then(|a| a.parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(3);
        Self {
            interval,
            batch,
            pending: Vec::new(),
        }
    }

    fn append(fs: &mut Filesystem, records: &[String]) -> Result<(), FsError> {
        fs.mkdir_p("/var/log")?;
        let mut contents = fs.read(DAEMON_LOG).map(str::to_string).unwrap_or_default();
        for record in records {
            contents.push_str(record);
            contents.push('\n');
        }
        fs.write(DAEMON_LOG, contents)
    }
}

impl Task for Daemon {
    fn step(&mut self, cx: &mut StepContext<'_>) -> Result<Step, TaskError> {
        self.pending.push(format!("{:.1} heartbeat from {}", cx.time(), cx.pid()));
        if self.pending.len() >= self.batch {
            let system = cx.system_mut().ok_or_else(|| TaskError::failed("system is gone"))?;
            Self::append(&mut system.fs, &self.pending).map_err(|e| TaskError::failed(e.to_string()))?;
            self.pending.clear();
        }
        Ok(Step::wait(YieldToken::delay(self.interval)))
    }

    fn on_shutdown(&mut self, _kind: CompletionKind) -> bool {
        self.pending.is_empty()
    }

    fn on_complete(&mut self, _kind: CompletionKind, cx: &mut CompletionContext<'_>) {
        if self.pending.is_empty() {
            return;
        }
        let system = cx.system_id();
        if let Some(system) = cx.systems_mut().system_mut(system) {
            if let Err(e) = Self::append(&mut system.fs, &self.pending) {
                debug!(%e, "daemon lost records on shutdown");
            }
        }
        self.pending.clear();
    }
}

/// The login shell: reads command lines as input and runs each as a child
/// process, waiting for it before prompting again. `exit` ends the login.
#[derive(Default)]
struct Shell {
    slot: Option<InputSlot>,
    child: Option<ChildHandle>,
}

impl Shell {
    fn prompt(cx: &StepContext<'_>) -> String {
        let hostname = cx.system().map(|s| s.hostname.as_str()).unwrap_or("?");
        format!("{}@{}:{}$ ", cx.user(), hostname, cwd(cx))
    }
}

impl Task for Shell {
    fn step(&mut self, cx: &mut StepContext<'_>) -> Result<Step, TaskError> {
        self.child = None;

        if let Some(line) = self.slot.take().and_then(|slot| slot.take()) {
            let line = line.trim();
            if line == "exit" {
                return Ok(Step::Done);
            }
            if !line.is_empty() {
                match cx.spawn(line) {
                    Ok(child) => {
                        let exit = child.exit.clone();
                        self.child = Some(child);
                        return Ok(Step::wait(YieldToken::condition(move || exit.is_done())));
                    }
                    Err(e) => cx.error(e.to_string()),
                }
            }
        }

        cx.prompt(Self::prompt(cx));
        let (token, slot) = cx.input_token();
        self.slot = Some(slot);
        Ok(Step::wait(token))
    }

    fn on_complete(&mut self, _kind: CompletionKind, cx: &mut CompletionContext<'_>) {
        let context = cx.context().id();
        let (system, pid) = (cx.system_id(), cx.pid());
        if let Some(login) = cx.systems_mut().unbind_login(context, system, pid) {
            cx.write_event(OutputEvent::Unbind {
                system,
                user: login.user,
            });
        }
    }
}
