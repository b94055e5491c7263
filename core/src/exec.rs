//! Child-process plumbing for the command runner: spawning, stdio wiring,
//! output collection in arrival order, and timeout termination.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::Command as TokioCommand;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::mpsc::unbounded_channel;

use crate::error::Result;
use crate::error::TIMEOUT_EXIT_CODE;

/// How long a child gets between the graceful terminate and the kill.
pub(crate) const KILL_GRACE: Duration = Duration::from_millis(200);

const READ_CHUNK_SIZE: usize = 8192;

/// One unit of streamed output. In merged mode stderr data is relabeled
/// `Stdout`, so consumers see a single interleaved stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit { code: i32 },
}

/// Everything collected from one child, chunks in arrival order.
#[derive(Debug, Default)]
pub(crate) struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Arrival-order interleave of both streams.
    pub merged: Vec<u8>,
    pub exit_code: i32,
}

pub(crate) fn collect_raw(chunks: impl IntoIterator<Item = StreamChunk>) -> RawOutput {
    let mut out = RawOutput::default();
    for chunk in chunks {
        match chunk {
            StreamChunk::Stdout(data) => {
                out.stdout.extend_from_slice(&data);
                out.merged.extend_from_slice(&data);
            }
            StreamChunk::Stderr(data) => {
                out.stderr.extend_from_slice(&data);
                out.merged.extend_from_slice(&data);
            }
            StreamChunk::Exit { code } => out.exit_code = code,
        }
    }
    out
}

/// Spawn a child with piped stdio. `stdin_piped` controls whether a stdin
/// pipe is created at all; commands with no preset stdin get a null stdin so
/// tools that probe it never hang waiting for input.
pub(crate) fn spawn_child(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    stdin_piped: bool,
) -> std::io::Result<Child> {
    let mut cmd = TokioCommand::new(program);
    cmd.args(args);
    cmd.current_dir(cwd);
    cmd.env_clear();
    cmd.envs(env);
    cmd.stdin(if stdin_piped {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd.spawn()
}

/// Drive `child` to completion, forwarding output chunks on `tx` as they
/// arrive and finishing with an `Exit` chunk. Returns the exit code.
///
/// On timeout the child is asked to terminate, given [`KILL_GRACE`], then
/// killed; the reported code is [`TIMEOUT_EXIT_CODE`] and whatever output
/// was collected so far has already been forwarded.
pub(crate) async fn drive_child(
    mut child: Child,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    merge_streams: bool,
    tx: UnboundedSender<StreamChunk>,
) -> Result<i32> {
    if let Some(data) = stdin
        && let Some(mut handle) = child.stdin.take()
    {
        tokio::spawn(async move {
            // A downstream that closes early (e.g. `head`) surfaces here as
            // a broken pipe; that is success for the write loop.
            if let Err(err) = handle.write_all(&data).await
                && err.kind() != std::io::ErrorKind::BrokenPipe
            {
                tracing::debug!("stdin write failed: {err}");
            }
            drop(handle);
        });
    }

    let stdout_reader = child.stdout.take().ok_or_else(|| {
        std::io::Error::other("stdout pipe was unexpectedly not available")
    })?;
    let stderr_reader = child.stderr.take().ok_or_else(|| {
        std::io::Error::other("stderr pipe was unexpectedly not available")
    })?;

    let stdout_task = tokio::spawn(pump(stdout_reader, tx.clone(), false));
    let stderr_task = tokio::spawn(pump(stderr_reader, tx.clone(), !merge_streams));

    let exit_code = tokio::select! {
        status = child.wait() => exit_code_of(status?),
        _ = tokio::time::sleep(timeout) => {
            terminate_gracefully(&mut child).await;
            TIMEOUT_EXIT_CODE
        }
    };

    // Readers run to EOF; after exit (or kill) the pipes close promptly.
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let _ = tx.send(StreamChunk::Exit { code: exit_code });
    Ok(exit_code)
}

/// Convenience: spawn the drive on the runtime and hand back the chunk
/// receiver, for `stream()`-shaped callers.
pub(crate) fn drive_child_streaming(
    child: Child,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    merge_streams: bool,
) -> UnboundedReceiver<StreamChunk> {
    let (tx, rx) = unbounded_channel();
    tokio::spawn(async move {
        if let Err(err) = drive_child(child, stdin, timeout, merge_streams, tx).await {
            tracing::error!("child drive failed: {err}");
        }
    });
    rx
}

async fn pump(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    tx: UnboundedSender<StreamChunk>,
    is_stderr: bool,
) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = buf[..n].to_vec();
                let chunk = if is_stderr {
                    StreamChunk::Stderr(data)
                } else {
                    StreamChunk::Stdout(data)
                };
                if tx.send(chunk).is_err() {
                    break;
                }
            }
        }
    }
}

async fn terminate_gracefully(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            if let Err(err) = child.start_kill() {
                tracing::warn!("kill after grace failed: {err}");
            }
            let _ = child.wait().await;
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
