use std::{sync::Arc, time::Duration};

use redwave_process::{InstanceStatus, Severity};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::Mutex,
    task::JoinHandle,
};

use crate::error::{PanelError, truncate_utf8};
use crate::registry::Instance;
use crate::templates::TemplateCatalog;

const MAX_LINE_BYTES: usize = 16 * 1024;
/// How long the exit observer waits for stdout/stderr to reach EOF after the
/// child is reaped (a grandchild may keep the pipes open). Shared by both
/// readers; stragglers are aborted.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the live child of an `Online` instance. The exit observer task
/// owns the `Child`; this side keeps what start/stop/input need.
#[derive(Debug)]
pub(crate) struct RunningProcess {
    pub(crate) pid: Option<u32>,
    stdin: Option<Arc<Mutex<ChildStdin>>>,
    stop_requested: bool,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the panel dies, take the bot down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// SIGINT to the child's process group (it is a session leader), falling
/// back to the pid alone.
#[cfg(unix)]
fn send_interrupt(pid: u32) -> std::io::Result<()> {
    let pid = pid as libc::pid_t;
    let rc = unsafe { libc::kill(-pid, libc::SIGINT) };
    if rc == 0 {
        return Ok(());
    }
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_interrupt(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful interrupt is only supported on unix",
    ))
}

/// Exit code and terminating signal, whichever apply.
#[cfg(unix)]
fn describe_exit(status: &std::process::ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(not(unix))]
fn describe_exit(status: &std::process::ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), None)
}

/// Reads one `\n`-terminated line into `buf`, keeping at most `max` bytes of
/// it and discarding the rest. Returns `false` at EOF with nothing read.
async fn read_capped_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut read_any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read_any);
        }
        read_any = true;
        let (used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        let content = if done { used - 1 } else { used };
        let room = max.saturating_sub(buf.len());
        buf.extend_from_slice(&available[..content.min(room)]);
        reader.consume(used);
        if done {
            return Ok(true);
        }
    }
}

fn spawn_line_reader<R>(instance: Arc<Instance>, stream: R, severity: Severity) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::with_capacity(1024);
        loop {
            match read_capped_line(&mut reader, &mut raw, MAX_LINE_BYTES).await {
                Ok(true) => {
                    // Best-effort UTF-8.
                    let text = String::from_utf8_lossy(&raw);
                    let text = truncate_utf8(text.trim(), MAX_LINE_BYTES);
                    instance.log(severity, text).await;
                }
                Ok(false) => break,
                Err(err) => {
                    tracing::debug!(instance = %instance.id(), %err, "stream read failed");
                    break;
                }
            }
        }
    })
}

/// Spawns, feeds and signals the child process of each instance.
#[derive(Clone, Debug)]
pub struct Supervisor {
    catalog: Arc<TemplateCatalog>,
}

impl Supervisor {
    pub fn new(catalog: Arc<TemplateCatalog>) -> Self {
        Self { catalog }
    }

    /// Offline/Error -> Online. Returns the child's pid.
    pub async fn start(&self, instance: &Arc<Instance>) -> Result<Option<u32>, PanelError> {
        let mut state = instance.lock_state().await;
        if matches!(
            state.status,
            InstanceStatus::Online | InstanceStatus::Cloning
        ) || state.process.is_some()
        {
            return Err(PanelError::AlreadyRunning {
                id: instance.id().clone(),
                status: state.status,
            });
        }

        instance.info("[SYSTEM] Starting bot...").await;

        let Some(runtime) = self.catalog.runtime(instance.runtime()) else {
            let msg = format!("unknown runtime: {}", instance.runtime());
            instance
                .error(format!("[CRITICAL ERROR] Failed to start: {msg}"))
                .await;
            return Err(PanelError::LaunchFailed(msg));
        };

        let mut cmd = Command::new(&runtime.command);
        cmd.args(&runtime.args)
            .current_dir(instance.working_dir())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let msg = format!(
                    "spawn {} {} (cwd {}): {err}",
                    runtime.command,
                    runtime.args.join(" "),
                    instance.working_dir().display()
                );
                tracing::warn!(instance = %instance.id(), %err, "launch failed");
                instance
                    .error(format!("[CRITICAL ERROR] Failed to start: {msg}"))
                    .await;
                return Err(PanelError::LaunchFailed(msg));
            }
        };

        let pid = child.id();
        let stdin = child.stdin.take().map(|s| Arc::new(Mutex::new(s)));
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_line_reader(instance.clone(), out, Severity::Info));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_line_reader(instance.clone(), err, Severity::Error));
        }

        state.process = Some(RunningProcess {
            pid,
            stdin,
            stop_requested: false,
        });
        state.exit_code = None;
        instance.set_status(&mut state, InstanceStatus::Online);
        drop(state);

        tracing::info!(
            instance = %instance.id(),
            pid,
            exec = %runtime.command,
            cwd = %instance.working_dir().display(),
            "bot process spawned"
        );

        tokio::spawn(watch_exit(instance.clone(), child, readers));
        Ok(pid)
    }

    /// Writes `text` plus a newline to the child's stdin and echoes it to the log.
    pub async fn send_input(&self, instance: &Instance, text: &str) -> Result<(), PanelError> {
        let stdin = {
            let state = instance.lock_state().await;
            match (&state.status, &state.process) {
                (InstanceStatus::Online, Some(p)) => p.stdin.clone(),
                _ => return Err(PanelError::NotRunning(instance.id().clone())),
            }
        };
        let Some(stdin) = stdin else {
            return Err(PanelError::NotRunning(instance.id().clone()));
        };

        let command = text.trim();
        if command.is_empty() {
            return Err(PanelError::InvalidInput(
                "command must be non-empty".to_string(),
            ));
        }

        // The state lock is not held here, so a child that stops reading
        // stdin cannot wedge stop or the exit observer.
        let mut data = Vec::with_capacity(command.len() + 1);
        data.extend_from_slice(command.as_bytes());
        data.push(b'\n');
        let write = async {
            let mut stdin = stdin.lock().await;
            stdin.write_all(&data).await?;
            stdin.flush().await
        };
        let written = match tokio::time::timeout(STDIN_WRITE_TIMEOUT, write).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("stdin not drained within {}ms", STDIN_WRITE_TIMEOUT.as_millis()),
            )),
        };

        if let Err(err) = written {
            tracing::warn!(instance = %instance.id(), %err, "command delivery failed");
            instance
                .error(format!("[ERROR] Failed to deliver command: {err}"))
                .await;
            return Err(PanelError::NotRunning(instance.id().clone()));
        }

        instance.info(format!("[COMMAND: {command}]")).await;
        Ok(())
    }

    /// Sends a graceful interrupt. The exit observer performs the transition.
    pub async fn stop(&self, instance: &Instance) -> Result<(), PanelError> {
        let mut guard = instance.lock_state().await;
        let state = &mut *guard;
        let pid = match (&state.status, state.process.as_mut()) {
            (InstanceStatus::Online, Some(p)) => match p.pid {
                Some(pid) => {
                    p.stop_requested = true;
                    pid
                }
                None => return Err(PanelError::NotRunning(instance.id().clone())),
            },
            _ => return Err(PanelError::NotRunning(instance.id().clone())),
        };

        instance.info("[SYSTEM] Stopping process...").await;
        if let Err(err) = send_interrupt(pid) {
            tracing::warn!(instance = %instance.id(), pid, %err, "interrupt failed");
            instance
                .error(format!("[ERROR] Failed to signal process {pid}: {err}"))
                .await;
            return Err(PanelError::NotRunning(instance.id().clone()));
        }
        tracing::info!(instance = %instance.id(), pid, "sent SIGINT");
        Ok(())
    }
}

/// Reaps the child and, in the same critical section, clears the handle and
/// goes Offline. The exit line is logged once the readers have drained.
async fn watch_exit(instance: Arc<Instance>, mut child: Child, readers: Vec<JoinHandle<()>>) {
    let res = child.wait().await;

    let (stop_requested, line) = {
        let mut state = instance.lock_state().await;
        let stop_requested = state
            .process
            .take()
            .is_some_and(|p| p.stop_requested);

        let line = match res {
            Ok(status) => {
                let (code, signal) = describe_exit(&status);
                state.exit_code = code;
                let mut line =
                    format!("[SYSTEM] Bot exited with code: {}", code.unwrap_or_default());
                if let Some(sig) = signal {
                    line.push_str(&format!(" (signal {sig})"));
                }
                if stop_requested {
                    line.push_str(" - stopped by operator");
                }
                tracing::info!(instance = %instance.id(), ?code, ?signal, stop_requested, "bot process exited");
                line
            }
            Err(err) => {
                state.exit_code = None;
                tracing::warn!(instance = %instance.id(), %err, "wait failed");
                format!("[SYSTEM] Bot exited with code: 0 (wait failed: {err})")
            }
        };
        instance.set_status(&mut state, InstanceStatus::Offline);
        (stop_requested, line)
    };

    let deadline = tokio::time::Instant::now() + READER_DRAIN_TIMEOUT;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            reader.abort();
            tracing::warn!(instance = %instance.id(), stop_requested, "output stream still open after exit, reader aborted");
        }
    }
    instance.info(line).await;
}
