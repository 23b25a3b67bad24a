//! Starting a target JVM with the JDWP agent and attaching to it.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scry_config::{JdwpConfig, LaunchConfig};
use scry_jdwp::{JdwpClient, JdwpClientConfig};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::{EngineError, Result};

const COLLECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Line the JDWP agent prints before it accepts a debugger.
const AGENT_BANNER: &str = "Listening for transport dt_socket";

enum Captured {
    Empty,
    Fixed {
        stdout: String,
        stderr: String,
    },
    Streams {
        stdout: Option<Stream>,
        stderr: Option<Stream>,
    },
}

/// One piped stream, appended to by a reader task as the target writes.
struct Stream {
    text: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl Stream {
    fn spawn(pipe: impl AsyncRead + Unpin + Send + 'static, name: &'static str) -> Self {
        let text = Arc::new(Mutex::new(Vec::new()));
        let reader = tokio::spawn(drain(pipe, Arc::clone(&text), name));
        Self { text, reader }
    }

    /// Everything read so far, once the pipe closes or the grace period ends.
    async fn join(mut self) -> String {
        match tokio::time::timeout(COLLECT_TIMEOUT, &mut self.reader).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!(target: "scry.engine", error = %err, "output reader task failed");
            }
            Err(_elapsed) => {
                self.reader.abort();
                tracing::debug!(
                    target: "scry.engine",
                    "target output still open; keeping what was read"
                );
            }
        }
        let text = String::from_utf8_lossy(&self.text.lock()).into_owned();
        text
    }
}

async fn drain(mut pipe: impl AsyncRead + Unpin, text: Arc<Mutex<Vec<u8>>>, name: &'static str) {
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => text.lock().extend_from_slice(&chunk[..n]),
            Err(err) => {
                tracing::warn!(
                    target: "scry.engine",
                    stream = name,
                    error = %err,
                    "failed to read target output"
                );
                break;
            }
        }
    }
}

/// Standard output and error of the target, handed to the observer when the
/// session terminates.
pub struct CapturedOutput(Captured);

impl Default for CapturedOutput {
    fn default() -> Self {
        Self::none()
    }
}

impl CapturedOutput {
    pub fn none() -> Self {
        Self(Captured::Empty)
    }

    pub fn fixed(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self(Captured::Fixed {
            stdout: stdout.into(),
            stderr: stderr.into(),
        })
    }

    /// Drains the child's piped stdout/stderr in background tasks.
    pub fn capture(child: &mut Child) -> Self {
        Self(Captured::Streams {
            stdout: child.stdout.take().map(|out| Stream::spawn(out, "stdout")),
            stderr: child.stderr.take().map(|err| Stream::spawn(err, "stderr")),
        })
    }

    /// Whatever was captured. A stream still open after a short grace period
    /// yields what has been read from it so far.
    pub async fn collect(&mut self) -> (String, String) {
        match std::mem::replace(&mut self.0, Captured::Empty) {
            Captured::Empty => (String::new(), String::new()),
            Captured::Fixed { stdout, stderr } => (stdout, stderr),
            Captured::Streams { stdout, stderr } => {
                let (stdout, stderr) = tokio::join!(join_output(stdout), join_output(stderr));
                (strip_agent_banner(&stdout), stderr)
            }
        }
    }
}

async fn join_output(stream: Option<Stream>) -> String {
    match stream {
        Some(stream) => stream.join().await,
        None => String::new(),
    }
}

fn strip_agent_banner(stdout: &str) -> String {
    stdout
        .split_inclusive('\n')
        .filter(|line| !line.starts_with(AGENT_BANNER))
        .collect()
}

pub struct LaunchedTarget {
    pub client: JdwpClient,
    pub child: Child,
    pub output: CapturedOutput,
    pub port: u16,
}

/// Binds an ephemeral port and releases it for the agent to take.
pub fn pick_free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|err| EngineError::Launch(format!("no free port: {err}")))?;
    let port = listener
        .local_addr()
        .map_err(|err| EngineError::Launch(format!("no free port: {err}")))?
        .port();
    Ok(port)
}

/// The `java` command line for `config`, listening for a debugger on `port`.
pub fn java_command(config: &LaunchConfig, port: u16) -> Result<Command> {
    let main_class = config
        .main_class
        .as_deref()
        .ok_or_else(|| EngineError::Launch("no main class configured".into()))?;

    let mut cmd = Command::new(&config.java);
    cmd.arg(format!(
        "-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,address=127.0.0.1:{port}"
    ));
    cmd.args(&config.vm_options);
    if !config.classpath.is_empty() {
        let classpath = std::env::join_paths(&config.classpath)
            .map_err(|err| EngineError::Launch(format!("invalid classpath: {err}")))?;
        cmd.arg("-cp");
        cmd.arg(classpath);
    }
    cmd.arg(main_class);
    cmd.args(&config.args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    Ok(cmd)
}

/// Starts the target suspended and connects to its JDWP agent.
pub async fn launch(config: &LaunchConfig, jdwp: &JdwpConfig) -> Result<LaunchedTarget> {
    let port = pick_free_port()?;
    let mut child = java_command(config, port)?.spawn().map_err(|err| {
        EngineError::Launch(format!("failed to spawn {}: {err}", config.java.display()))
    })?;
    let output = CapturedOutput::capture(&mut child);
    tracing::info!(
        target: "scry.engine",
        port,
        main_class = config.main_class.as_deref().unwrap_or_default(),
        "launched target"
    );

    let client_config = JdwpClientConfig {
        handshake_timeout: jdwp.handshake_timeout(),
        reply_timeout: jdwp.reply_timeout(),
    };
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut last_err = None;
    for attempt in 1..=jdwp.connect_attempts {
        match JdwpClient::connect_with_config(addr, client_config.clone()).await {
            Ok(client) => {
                return Ok(LaunchedTarget {
                    client,
                    child,
                    output,
                    port,
                });
            }
            Err(err) => {
                tracing::trace!(
                    target: "scry.engine",
                    attempt,
                    error = %err,
                    "jdwp agent not ready"
                );
                last_err = Some(err);
            }
        }
        if let Ok(Some(status)) = child.try_wait() {
            return Err(EngineError::Launch(format!(
                "target exited with {status} before a debugger attached"
            )));
        }
        tokio::time::sleep(jdwp.connect_retry_delay()).await;
    }

    Err(EngineError::Launch(match last_err {
        Some(err) => format!("could not attach to 127.0.0.1:{port}: {err}"),
        None => format!("could not attach to 127.0.0.1:{port}"),
    }))
}
