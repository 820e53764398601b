use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use acpox_jsonrpc::{CloseHandle, JsonRpcError, NdjsonCodec, Transport, TransportParts, ndjson_item_to_line};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader, Join};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, OnceCell};
use tokio_util::codec::Framed;
use tracing::Instrument;

use crate::{AcpClientError, Result};

/// Max length of a JSON message allowed on this transport unless configured otherwise
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// How long an agent gets to exit after being asked to, unless configured otherwise
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How to launch an agent as a child process
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ChildProcessParams {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables, on top of those this process has
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory of the agent; this process's if not set
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// How long to wait for the agent to exit after SIGTERM before killing it outright
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,

    /// Lines longer than this from the agent are discarded
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

fn default_grace_period() -> Duration {
    DEFAULT_GRACE_PERIOD
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

impl ChildProcessParams {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    fn command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args).envs(&self.env);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

/// Transport implementation for local ACP agents that are launched as child processes of the
/// client.
///
/// The agent's stdin and stdout carry the protocol.  Its stderr is read continuously and logged,
/// so an agent that is chatty there never blocks on a full pipe.
#[derive(Debug)]
pub struct ChildProcess {
    io: Framed<Join<ChildStdout, ChildStdin>, NdjsonCodec>,
    terminator: ChildTerminator,
    remote_peer: String,
    span: tracing::Span,
}

impl ChildProcess {
    /// Launch the agent described by `params`.
    ///
    /// This will launch the child process and then immediately return.  When this struct (and
    /// any [`ChildTerminator`] obtained from it) is dropped, the child process will be killed.
    pub async fn spawn(params: &ChildProcessParams) -> Result<Self> {
        Self::start(params.command(), params.grace_period, params.max_line_length).await
    }

    /// Launch the agent as a child process described by the given [`tokio::process::Command`],
    /// with default settings.
    pub async fn run(command: tokio::process::Command) -> Result<Self> {
        Self::start(command, DEFAULT_GRACE_PERIOD, DEFAULT_MAX_LINE_LENGTH).await
    }

    async fn start(
        mut command: tokio::process::Command,
        grace_period: Duration,
        max_line_length: usize,
    ) -> Result<Self> {
        command
            .kill_on_drop(true)
            .stdin(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped());

        let program = command.as_std().get_program().to_string_lossy().to_string();
        let args = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect::<Vec<_>>();

        tracing::debug!(%program,
            args = %args.join(" "),
            "Spawning ACP agent as child process"
        );

        let spawn_error = |source: std::io::Error| AcpClientError::SpawnAgent {
            source,
            program: program.clone(),
            args: args.clone(),
        };

        let mut child = command.spawn().map_err(spawn_error)?;

        let pid = child.id();
        tracing::debug!(pid, "Child process spawned");

        let stdio_missing = |name: &str| spawn_error(std::io::Error::other(format!("BUG: {name} is not piped")));
        let stdin = child.stdin.take().ok_or_else(|| stdio_missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| stdio_missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| stdio_missing("stderr"))?;
        let span = tracing::info_span!("child_process", pid);

        // Whatever the agent writes to stderr is diagnostic output, never protocol traffic
        tokio::spawn(drain_stderr(stderr).instrument(tracing::info_span!("child_process_stderr", pid)));

        Ok(Self {
            io: Framed::new(
                tokio::io::join(stdout, stdin),
                NdjsonCodec::new_with_max_length(max_line_length),
            ),
            terminator: ChildTerminator::new(child, pid, grace_period),
            remote_peer: match pid {
                Some(pid) => format!("{program} (pid {pid})"),
                None => program,
            },
            span,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.terminator.inner.pid
    }

    /// A handle that can terminate the child process, even after this transport has been bound
    /// to a connection
    pub fn terminator(&self) -> ChildTerminator {
        self.terminator.clone()
    }

    /// Close the agent's stdin and terminate it, see [`ChildTerminator::close`]
    pub async fn close(self) -> Option<ExitStatus> {
        let Self { io, terminator, .. } = self;
        drop(io);
        terminator.close().await
    }
}

impl Transport for ChildProcess {
    fn remote_peer(&self) -> Cow<'static, str> {
        Cow::Owned(self.remote_peer.clone())
    }

    fn span(&self) -> tracing::Span {
        self.span.clone()
    }

    fn into_parts(self) -> TransportParts {
        let Self { io, terminator, .. } = self;
        let (sink, stream) = StreamExt::split::<String>(io);
        // Whatever the agent writes while it shuts down is read for up to another grace period
        let drain_timeout = terminator.inner.grace_period;

        TransportParts {
            inbound: stream.map(ndjson_item_to_line).boxed(),
            outbound: Box::pin(sink.sink_map_err(JsonRpcError::transport)),
            close: CloseHandle::new(async move {
                terminator.close().await;
            })
            .with_drain_timeout(drain_timeout),
        }
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut stderr = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        line.clear();
        match stderr.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                tracing::info!("{}", text.trim_end());
            }
            Err(e) => {
                tracing::debug!(err = %e, "Error reading stderr of child process; no longer draining it");
                break;
            }
        }
    }
}

/// Terminates a child process, once.
///
/// Clones share the child; whichever closes it first does the work, and every other caller gets
/// the same outcome.
#[derive(Clone, Debug)]
pub struct ChildTerminator {
    inner: Arc<TerminatorInner>,
}

#[derive(Debug)]
struct TerminatorInner {
    child: Mutex<Child>,
    pid: Option<u32>,
    grace_period: Duration,
    exit_status: OnceCell<Option<ExitStatus>>,
}

impl ChildTerminator {
    fn new(child: Child, pid: Option<u32>, grace_period: Duration) -> Self {
        Self {
            inner: Arc::new(TerminatorInner {
                child: Mutex::new(child),
                pid,
                grace_period,
                exit_status: OnceCell::new(),
            }),
        }
    }

    /// Ask the child to exit with SIGTERM, wait up to the grace period for it to do so, then kill
    /// it, then reap it.
    ///
    /// Returns the exit status, or `None` if it couldn't be determined.  Safe to call any number
    /// of times from any number of tasks.
    pub async fn close(&self) -> Option<ExitStatus> {
        *self.inner.exit_status.get_or_init(|| self.inner.terminate()).await
    }
}

impl TerminatorInner {
    async fn terminate(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock().await;

        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = self.pid, %status, "Child process had already exited");
                return Some(status);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(pid = self.pid, err = %e, "Failed to check whether child process is still running");
            }
        }

        request_exit(&mut child);

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = self.pid, %status, "Child process exited");
                return Some(status);
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = self.pid, err = %e, "Error waiting for child process to exit");
            }
            Err(_) => {
                tracing::warn!(pid = self.pid,
                    grace_period = ?self.grace_period,
                    "Child process did not exit within the grace period; killing it");
            }
        }

        if let Err(e) = child.start_kill() {
            tracing::warn!(pid = self.pid, err = %e, "Failed to kill child process");
        }

        match child.wait().await {
            Ok(status) => {
                tracing::debug!(pid = self.pid, %status, "Child process killed");
                Some(status)
            }
            Err(e) => {
                tracing::error!(pid = self.pid, err = %e, "Error reaping child process");
                None
            }
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    // `None` once the child has been reaped, when there is nobody left to signal
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };

    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::debug!(pid, err = %e, "Failed to send SIGTERM to child process");
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    // No gentler way to ask
    if let Err(e) = child.start_kill() {
        tracing::debug!(err = %e, "Failed to kill child process");
    }
}

/// Tests for this rely on UNIX-specific commands, so on Windows we'll just have to assume this
/// works for now.
#[cfg(all(unix, test))]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::time::Instant;

    use assert_matches::assert_matches;
    use futures::{SinkExt, StreamExt};
    use nix::sys::signal;
    use nix::unistd::Pid;

    use super::*;
    use crate::testing;

    fn sh(script: &str) -> ChildProcessParams {
        ChildProcessParams::new("sh").with_args(["-c", script])
    }

    /// Reads lines from stdin and writes them back to stdout
    fn echo() -> ChildProcessParams {
        sh(r#"while IFS= read -r line; do echo "$line"; echo "DEBUG: Received message" >&2; done"#)
    }

    fn is_process_running(pid: u32) -> bool {
        // Signal `None` only checks whether the process exists
        signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn test_echo() {
        testing::init_test_logging();

        let process = ChildProcess::spawn(&echo()).await.unwrap();
        assert!(process.pid().is_some());
        assert!(process.remote_peer().starts_with("sh (pid "));

        let terminator = process.terminator();
        let TransportParts {
            mut inbound,
            mut outbound,
            ..
        } = process.into_parts();

        for i in 0..5 {
            let message = format!(r#"{{"jsonrpc":"2.0","method":"test","params":{i}}}"#);
            outbound.send(message.clone()).await.unwrap();
            assert_eq!(inbound.next().await.unwrap().unwrap(), message);
        }

        drop((inbound, outbound));
        assert!(terminator.close().await.is_some());
    }

    #[tokio::test]
    async fn test_noisy_stderr_does_not_block() {
        testing::init_test_logging();

        // Far more than fits in a pipe's buffer
        let process = ChildProcess::spawn(&sh(r#"
            i=0
            while [ $i -lt 2000 ]; do
                echo "noise line $i, padded out so that it takes up a bit more room" >&2
                i=$((i+1))
            done
            while IFS= read -r line; do echo "$line"; done
        "#))
        .await
        .unwrap();

        // The close handle owns the child, which is killed when the last owner goes away
        let terminator = process.terminator();
        let TransportParts {
            mut inbound,
            mut outbound,
            ..
        } = process.into_parts();

        outbound.send("{}".to_string()).await.unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), inbound.next())
            .await
            .expect("child blocked writing to stderr");
        assert_eq!(line.unwrap().unwrap(), "{}");

        drop((inbound, outbound));
        assert!(terminator.close().await.is_some());
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped() {
        testing::init_test_logging();

        let params = sh(r#"echo "this line is much too long to be allowed"; echo "short""#).with_max_line_length(16);
        let process = ChildProcess::spawn(&params).await.unwrap();
        let TransportParts {
            mut inbound,
            close: _close,
            ..
        } = process.into_parts();

        assert_matches!(
            inbound.next().await,
            Some(Err(JsonRpcError::OversizedMessage { max_length: 16 }))
        );
        assert_eq!(inbound.next().await.unwrap().unwrap(), "short");
        assert!(inbound.next().await.is_none());
    }

    #[tokio::test]
    async fn test_child_exit_ends_inbound_stream() {
        testing::init_test_logging();

        let process = ChildProcess::spawn(&sh(r#"read -r line; echo "$line""#)).await.unwrap();
        let terminator = process.terminator();
        let TransportParts {
            mut inbound,
            mut outbound,
            ..
        } = process.into_parts();

        outbound.send("once".to_string()).await.unwrap();
        assert_eq!(inbound.next().await.unwrap().unwrap(), "once");

        let end = tokio::time::timeout(Duration::from_secs(5), inbound.next())
            .await
            .expect("inbound stream should end when the child exits");
        assert!(end.is_none());

        let status = terminator.close().await.unwrap();
        assert!(status.success());

        // Writing to a child that's gone fails rather than hangs.  The first write may land in
        // the pipe buffer before the broken pipe is noticed.
        let mut failed = false;
        for _ in 0..10 {
            if outbound.send("anyone there?".to_string()).await.is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_output_written_on_sigterm_is_still_read() {
        testing::init_test_logging();

        let process = ChildProcess::spawn(&sh(r#"
            trap 'echo "{\"bye\":1}"; exit 0' TERM
            echo ready
            while true; do sleep 0.1; done
        "#))
        .await
        .unwrap();
        let terminator = process.terminator();
        let TransportParts {
            mut inbound,
            outbound,
            close,
        } = process.into_parts();
        assert_eq!(close.drain_timeout(), DEFAULT_GRACE_PERIOD);

        // The trap is in place once the child says it's ready
        assert_eq!(inbound.next().await.unwrap().unwrap(), "ready");

        drop(outbound);
        let status = terminator.close().await.unwrap();
        assert!(status.success());

        let farewell = tokio::time::timeout(DEFAULT_GRACE_PERIOD, inbound.next())
            .await
            .expect("farewell line never arrived");
        assert_eq!(farewell.unwrap().unwrap(), r#"{"bye":1}"#);
        assert!(inbound.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_asks_politely_first() {
        testing::init_test_logging();

        let process = ChildProcess::spawn(&sh("while true; do sleep 0.1; done")).await.unwrap();
        let pid = process.pid().unwrap();
        assert!(is_process_running(pid));

        let status = process.close().await.unwrap();
        assert!(!status.success());
        assert_eq!(status.signal(), Some(signal::Signal::SIGTERM as i32));
        assert!(!is_process_running(pid));
    }

    #[tokio::test]
    async fn test_close_kills_after_grace_period() {
        testing::init_test_logging();

        let params = sh(r#"trap "" TERM; while true; do sleep 0.1; done"#).with_grace_period(Duration::from_millis(200));
        let process = ChildProcess::spawn(&params).await.unwrap();
        let pid = process.pid().unwrap();

        // Give the shell a moment to install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let terminator = process.terminator();
        let (first, second) = tokio::join!(terminator.close(), process.close());
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(5));

        assert_eq!(first, second);
        assert_eq!(first.unwrap().signal(), Some(signal::Signal::SIGKILL as i32));
        assert!(!is_process_running(pid));

        // And again, for good measure
        assert_eq!(terminator.close().await, first);
    }

    #[tokio::test]
    async fn test_process_termination_on_drop() {
        testing::init_test_logging();

        let process = ChildProcess::spawn(&echo()).await.unwrap();
        let pid = process.pid().unwrap();
        assert!(is_process_running(pid), "Process should be running");

        drop(process);

        // Killed on drop, but reaped in the background, so give it a moment
        for _ in 0..1000 {
            if !is_process_running(pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(!is_process_running(pid), "Process should be terminated after drop");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        testing::init_test_logging();

        let params = ChildProcessParams::new("/nonexistent/acp-agent").with_args(["--stdio"]);
        let result = ChildProcess::spawn(&params).await;

        assert_matches!(result, Err(AcpClientError::SpawnAgent { program, args, .. }) => {
            assert_eq!(program, "/nonexistent/acp-agent");
            assert_eq!(args, vec!["--stdio".to_string()]);
        });
    }

    #[test]
    fn test_params_from_yaml() {
        let params: ChildProcessParams = serde_yaml::from_str(
            r#"
            program: my-agent
            args: ["--acp"]
            env:
              AGENT_LOG: debug
            cwd: /tmp
            grace_period: 2s 500ms
            "#,
        )
        .unwrap();

        assert_eq!(
            params,
            ChildProcessParams::new("my-agent")
                .with_args(["--acp"])
                .with_env("AGENT_LOG", "debug")
                .with_cwd("/tmp")
                .with_grace_period(Duration::from_millis(2500))
        );
        assert_eq!(params.max_line_length, DEFAULT_MAX_LINE_LENGTH);
    }
}
