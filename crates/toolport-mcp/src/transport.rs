//! Framed transports for MCP servers.
//!
//! A [`Transport`] carries newline-delimited JSON-RPC frames over either a
//! child process's stdin/stdout or any byte stream (TCP, in-memory pipes). When
//! it owns a process, a watcher task reaps it and raises the closed signal the
//! moment it exits. Dropping a transport kills its process.

use crate::config::{ServerConfig, TransportKind};
use parking_lot::Mutex as SyncMutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use toolport_core::{ToolportError, ToolportResult};
use tracing::{debug, info, trace, warn};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Interval between TCP connection attempts while the server boots.
const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// Default upper bound on one incoming frame (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Marks the transport closed if a write is abandoned part-way through a
/// frame: the peer would otherwise see the next frame glued to a fragment.
struct WriteInProgress<'a> {
    closed: &'a watch::Sender<Option<String>>,
    server: &'a str,
    finished: bool,
}

impl Drop for WriteInProgress<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(server = %self.server, "write abandoned mid-frame, closing transport");
            mark_closed(self.closed, "write abandoned mid-frame");
        }
    }
}

/// Handle to a spawned server process. The watcher task owns the `Child`.
struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: SyncMutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<Option<String>>,
}

impl ProcessHandle {
    fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    async fn wait_exited(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(Option::is_some).await;
    }
}

/// Bi-directional framed transport to one MCP server.
pub struct Transport {
    server: String,
    writer: Mutex<Option<BoxWriter>>,
    reader: Mutex<BufReader<BoxReader>>,
    process: Option<ProcessHandle>,
    closed: Arc<watch::Sender<Option<String>>>,
    stopping: Arc<AtomicBool>,
    max_frame_bytes: usize,
}

impl Transport {
    /// Start the transport described by `config`: spawn the process (if any)
    /// and wire its streams. `connect_timeout` bounds TCP connection attempts.
    pub async fn start(config: &ServerConfig, connect_timeout: Duration) -> ToolportResult<Self> {
        match config.transport {
            TransportKind::Stdio => Self::spawn_stdio(config),
            TransportKind::Tcp => Self::connect_tcp(config, connect_timeout).await,
        }
    }

    /// Wrap an arbitrary byte stream. No process is owned; the transport
    /// closes when the reader reaches end of stream.
    pub fn from_stream<R, W>(server: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::assemble(server.into(), Box::new(reader), Box::new(writer), None)
    }

    fn assemble(
        server: String,
        reader: BoxReader,
        writer: BoxWriter,
        process: Option<(Child, Option<u32>)>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(None);
        let closed = Arc::new(closed_tx);
        let stopping = Arc::new(AtomicBool::new(false));

        let process = process.map(|(child, pid)| {
            let (kill_tx, kill_rx) = oneshot::channel();
            let (exited_tx, exited_rx) = watch::channel(None);
            tokio::spawn(watch_process(
                server.clone(),
                child,
                kill_rx,
                exited_tx,
                closed.clone(),
                stopping.clone(),
            ));
            ProcessHandle {
                pid,
                kill_tx: SyncMutex::new(Some(kill_tx)),
                exited: exited_rx,
            }
        });

        Self {
            server,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(BufReader::new(reader)),
            process,
            closed,
            stopping,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Cap incoming frames at `bytes`. Longer lines are discarded.
    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes.max(1);
        self
    }

    fn spawn_stdio(config: &ServerConfig) -> ToolportResult<Self> {
        let mut child = spawn_process(config, true)?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| {
            ToolportError::Spawn(format!("server '{}': stdin not available", config.name))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ToolportError::Spawn(format!("server '{}': stdout not available", config.name))
        })?;

        info!(server = %config.name, pid = ?pid, command = %config.command, "MCP server process spawned");
        Ok(Self::assemble(
            config.name.clone(),
            Box::new(stdout),
            Box::new(stdin),
            Some((child, pid)),
        ))
    }

    async fn connect_tcp(config: &ServerConfig, connect_timeout: Duration) -> ToolportResult<Self> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            ToolportError::Config(format!("server '{}': tcp transport without endpoint", config.name))
        })?;

        let mut child = if config.command.trim().is_empty() {
            None
        } else {
            Some(spawn_process(config, false)?)
        };

        let deadline = tokio::time::Instant::now() + connect_timeout;
        let stream = loop {
            match TcpStream::connect(&endpoint).await {
                Ok(stream) => break stream,
                Err(e) => {
                    let exited = match child.as_mut() {
                        Some(c) => c.try_wait().ok().flatten(),
                        None => None,
                    };
                    if let Some(status) = exited {
                        return Err(ToolportError::Spawn(format!(
                            "server '{}' exited before accepting connections ({status})",
                            config.name
                        )));
                    }
                    if tokio::time::Instant::now() >= deadline {
                        if let Some(mut c) = child {
                            let _ = c.kill().await;
                        }
                        return Err(ToolportError::Transport(format!(
                            "server '{}': could not connect to {endpoint}: {e}",
                            config.name
                        )));
                    }
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        };
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        debug!(server = %config.name, endpoint = %endpoint, "MCP server connected over TCP");
        let process = child.map(|c| {
            let pid = c.id();
            (c, pid)
        });
        Ok(Self::assemble(
            config.name.clone(),
            Box::new(read_half),
            Box::new(write_half),
            process,
        ))
    }

    /// Name of the server this transport talks to.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// OS process id, if this transport owns a live process.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid)
    }

    /// Receiver that flips to `Some(reason)` once the transport is closed,
    /// whether by process exit, end of stream, or an explicit stop.
    pub fn closed_signal(&self) -> watch::Receiver<Option<String>> {
        self.closed.subscribe()
    }

    /// Whether the closed signal has been raised.
    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Whether the close was requested through [`Transport::stop`].
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Write one frame followed by a newline. A write blocked on a peer that
    /// stopped reading is abandoned as soon as the transport closes.
    pub async fn send(&self, frame: &str) -> ToolportResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            ToolportError::Transport(format!("server '{}': transport is closed", self.server))
        })?;
        if self.is_closed() {
            return Err(ToolportError::Transport(format!(
                "server '{}': transport is closed",
                self.server
            )));
        }

        trace!(server = %self.server, frame = %frame, "-> frame");
        let mut in_progress = WriteInProgress {
            closed: &self.closed,
            server: &self.server,
            finished: false,
        };
        let mut closed = self.closed.subscribe();
        let io = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        let result = tokio::select! {
            result = io => result.map_err(|e| {
                ToolportError::Transport(format!("server '{}': write failed: {e}", self.server))
            }),
            _ = closed.wait_for(Option::is_some) => Err(ToolportError::Transport(format!(
                "server '{}': transport closed during write",
                self.server
            ))),
        };
        in_progress.finished = result.is_ok();
        if result.is_err() {
            mark_closed(&self.closed, "write failed");
        }
        result
    }

    /// Read the next non-empty frame. `Ok(None)` means end of stream.
    ///
    /// Frames that are not valid UTF-8, or longer than the frame limit, are
    /// logged and skipped. A read error closes the transport.
    pub async fn receive(&self) -> ToolportResult<Option<String>> {
        let mut reader = self.reader.lock().await;
        let limit = self.max_frame_bytes as u64 + 1;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = match (&mut *reader).take(limit).read_until(b'\n', &mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    self.mark_closed("read failed");
                    return Err(ToolportError::Transport(format!(
                        "server '{}': read failed: {e}",
                        self.server
                    )));
                }
            };
            if read == 0 {
                self.mark_closed("output stream closed");
                return Ok(None);
            }

            if buf.len() > self.max_frame_bytes && buf.last() != Some(&b'\n') {
                warn!(
                    server = %self.server,
                    limit = self.max_frame_bytes,
                    "discarding oversized frame"
                );
                if !self.skip_line(&mut reader, limit).await? {
                    self.mark_closed("output stream closed");
                    return Ok(None);
                }
                continue;
            }

            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line.trim(),
                Err(e) => {
                    warn!(server = %self.server, error = %e, bytes = buf.len(), "discarding frame that is not UTF-8");
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            trace!(server = %self.server, frame = %line, "<- frame");
            return Ok(Some(line.to_string()));
        }
    }

    /// Consume input up to and including the next newline. Returns false on
    /// end of stream.
    async fn skip_line(
        &self,
        reader: &mut BufReader<BoxReader>,
        chunk: u64,
    ) -> ToolportResult<bool> {
        let mut scratch = Vec::new();
        loop {
            scratch.clear();
            let read = match (&mut *reader).take(chunk).read_until(b'\n', &mut scratch).await {
                Ok(read) => read,
                Err(e) => {
                    self.mark_closed("read failed");
                    return Err(ToolportError::Transport(format!(
                        "server '{}': read failed: {e}",
                        self.server
                    )));
                }
            };
            if read == 0 {
                return Ok(false);
            }
            if scratch.last() == Some(&b'\n') {
                return Ok(true);
            }
        }
    }

    /// Close the input stream, give the process `timeout` to exit on its own,
    /// then force-kill. The process is always reaped before this returns.
    pub async fn stop(&self, timeout: Duration) -> ToolportResult<()> {
        self.stopping.store(true, Ordering::SeqCst);

        let writer = match self.writer.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                // A send is stuck on a peer that stopped reading; closing
                // makes it give up the writer.
                self.mark_closed("stopped");
                self.writer.lock().await.take()
            }
        };
        if let Some(mut writer) = writer {
            let _ = tokio::time::timeout(timeout, writer.shutdown()).await;
        }

        if let Some(process) = &self.process {
            if tokio::time::timeout(timeout, process.wait_exited()).await.is_err() {
                warn!(
                    server = %self.server,
                    timeout_ms = timeout.as_millis() as u64,
                    "MCP server did not exit after stdin closed, killing"
                );
                process.kill();
                process.wait_exited().await;
            }
        }

        self.mark_closed("stopped");
        debug!(server = %self.server, "transport stopped");
        Ok(())
    }

    fn mark_closed(&self, reason: &str) {
        mark_closed(&self.closed, reason);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(process) = &self.process {
            process.kill();
        }
    }
}

fn mark_closed(closed: &watch::Sender<Option<String>>, reason: &str) {
    closed.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason.to_string());
        true
    });
}

fn spawn_process(config: &ServerConfig, piped: bool) -> ToolportResult<Child> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if piped {
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null()).stdout(Stdio::null());
    }
    if let Some(dir) = &config.cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| {
        let reason = match e.kind() {
            std::io::ErrorKind::NotFound => "command not found".to_string(),
            std::io::ErrorKind::PermissionDenied => "command is not executable".to_string(),
            _ => e.to_string(),
        };
        ToolportError::Spawn(format!(
            "failed to spawn MCP server '{}' ({}): {reason}",
            config.name, config.command
        ))
    })?;

    if let Some(stderr) = child.stderr.take() {
        let server = config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %server, "stderr: {line}");
            }
        });
    }

    Ok(child)
}

/// Own the child until it exits or a kill is requested (an explicit send or
/// the transport being dropped), then reap it and publish the exit.
async fn watch_process(
    server: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exited: watch::Sender<Option<String>>,
    closed: Arc<watch::Sender<Option<String>>>,
    stopping: Arc<AtomicBool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                debug!(server = %server, error = %e, "kill failed, process likely gone");
            }
            child.wait().await
        }
    };

    let reason = match status {
        Ok(status) => format!("process exited ({status})"),
        Err(e) => format!("process wait failed: {e}"),
    };
    if stopping.load(Ordering::SeqCst) {
        debug!(server = %server, reason = %reason, "MCP server process reaped");
    } else {
        warn!(server = %server, reason = %reason, "MCP server process exited unexpectedly");
    }

    mark_closed(&closed, &reason);
    let _ = exited.send(Some(reason));
}
