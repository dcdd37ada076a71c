//! Process-backed interactive session.

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Connection;
use crate::errors::{Failure, FailureKind, Result};
use crate::process::split_command;
use crate::timeout::{deadline_after, Deadline, CONNECTION_TIMEOUT};

/// Probe sent to the device when the prompt may have been corrupted.
pub const DEFAULT_CHECK_CHAR: &str = "#";

/// Terminator appended by `sendline`.
pub const LINE_SEPARATOR: &str = "\n";

/// Number of probes `force_prompt_wait` sends before giving up.
pub const MAX_PROMPT_PROBES: u32 = 6;

/// Older output is dropped once the match buffer grows past this size.
const SEARCH_WINDOW: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Splits streamed text into complete lines for logging.
#[derive(Debug, Default)]
struct LineLogger {
    partial: String,
}

impl LineLogger {
    fn push(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }
}

/// Mutable half of the session, serialised behind one async lock.
struct SessionIo {
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Bytes of an incomplete UTF-8 sequence left over from the last chunk.
    pending: Vec<u8>,
    buffer: String,
    log: LineLogger,
    eof: bool,
    closed: bool,
    child: Option<Child>,
    pumps: Vec<JoinHandle<()>>,
}

impl SessionIo {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let bytes = std::mem::take(&mut self.pending);
        match std::str::from_utf8(&bytes) {
            Ok(text) => text.to_string(),
            Err(err) if err.error_len().is_none() => {
                let valid = err.valid_up_to();
                self.pending = bytes[valid..].to_vec();
                String::from_utf8_lossy(&bytes[..valid]).into_owned()
            }
            Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    fn absorb(&mut self, name: &str, chunk: &[u8]) {
        let text = self.decode(chunk);
        for line in self.log.push(&text) {
            debug!(target: "dispatchflow::target", connection = %name, "{}", line);
        }
        self.buffer.push_str(&text);
        if self.buffer.len() > SEARCH_WINDOW {
            let excess = self.buffer.len() - SEARCH_WINDOW;
            let cut = self
                .buffer
                .char_indices()
                .map(|(i, _)| i)
                .find(|i| *i >= excess)
                .unwrap_or(self.buffer.len());
            self.buffer.drain(..cut);
        }
    }
}

/// Finds the earliest match of any pattern in `text`.
///
/// Ties on the start position go to the pattern listed first.
fn earliest_match(patterns: &[Regex], text: &str) -> Option<(usize, usize, usize)> {
    patterns
        .iter()
        .enumerate()
        .filter_map(|(index, pattern)| pattern.find(text).map(|m| (index, m.start(), m.end())))
        .min_by_key(|(index, start, _)| (*start, *index))
}

fn pump<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0_u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// An interactive session over a spawned process or any byte stream pair.
///
/// Output is pumped from the stream by background tasks into a queue; the
/// session matches prompts against what it has received so far. Output that
/// arrives interleaved with a prompt (kernel messages on a serial console)
/// is handled by [`Connection::force_prompt_wait`].
pub struct ShellSession {
    name: String,
    io: Mutex<SessionIo>,
    prompts: RwLock<Vec<String>>,
    timeout: RwLock<Duration>,
    before: RwLock<String>,
    connected: AtomicBool,
    check_char: String,
    linesep: String,
}

impl ShellSession {
    /// Builds a session over an existing reader/writer pair.
    ///
    /// Must be called from within a Tokio runtime: a task is spawned to pump
    /// the reader.
    pub fn from_transport<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let pumps = vec![pump(reader, tx)];
        Self::build(name.into(), Box::new(writer), rx, pumps, None)
    }

    /// Spawns `command_line` and builds a session over its stdio.
    ///
    /// Standard output and standard error are merged into one stream. The
    /// process is killed when the session is finalised or dropped.
    pub fn spawn(name: impl Into<String>, command_line: &str) -> Result<Self> {
        let name = name.into();
        let (program, args) = split_command(command_line)?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            Failure::infrastructure(format!("Unable to spawn '{command_line}': {err}"))
        })?;
        info!(connection = %name, pid = ?child.id(), "Spawned '{}'", command_line);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Failure::bug(format!("{name}: stdin was not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Failure::bug(format!("{name}: stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Failure::bug(format!("{name}: stderr was not captured")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pumps = vec![pump(stdout, tx.clone()), pump(stderr, tx)];
        Ok(Self::build(name, Box::new(stdin), rx, pumps, Some(child)))
    }

    fn build(
        name: String,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        output: mpsc::UnboundedReceiver<Vec<u8>>,
        pumps: Vec<JoinHandle<()>>,
        child: Option<Child>,
    ) -> Self {
        Self {
            name,
            io: Mutex::new(SessionIo {
                writer: Some(writer),
                output,
                pending: Vec::new(),
                buffer: String::new(),
                log: LineLogger::default(),
                eof: false,
                closed: false,
                child,
                pumps,
            }),
            prompts: RwLock::new(Vec::new()),
            timeout: RwLock::new(CONNECTION_TIMEOUT),
            before: RwLock::new(String::new()),
            connected: AtomicBool::new(true),
            check_char: DEFAULT_CHECK_CHAR.to_string(),
            linesep: LINE_SEPARATOR.to_string(),
        }
    }

    /// Sets the initial prompt patterns.
    #[must_use]
    pub fn with_prompts(self, prompts: Vec<String>) -> Self {
        *self.prompts.write() = prompts;
        self
    }

    /// Sets the default wait budget.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        *self.timeout.write() = timeout;
        self
    }

    /// Sets the probe sent by `force_prompt_wait`.
    #[must_use]
    pub fn with_check_char(mut self, check_char: impl Into<String>) -> Self {
        self.check_char = check_char.into();
        self
    }

    /// Sets the terminator appended by `sendline`.
    #[must_use]
    pub fn with_line_separator(mut self, linesep: impl Into<String>) -> Self {
        self.linesep = linesep.into();
        self
    }

    fn compile_prompts(&self) -> Result<Vec<Regex>> {
        let prompts = self.prompts.read().clone();
        if prompts.is_empty() {
            return Err(Failure::bug(format!("{}: no prompt to wait for", self.name)));
        }
        prompts
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|err| {
                    Failure::test(format!("Invalid regular expression '{p}': {err}"))
                })
            })
            .collect()
    }

    async fn write_raw(&self, text: &str, delay_ms: u64) -> Result<()> {
        if !self.is_connected() {
            return Err(Failure::infrastructure(format!(
                "{}: cannot send on a closed connection",
                self.name
            )));
        }
        let mut io = self.io.lock().await;
        let writer = io
            .writer
            .as_mut()
            .ok_or_else(|| Failure::infrastructure(format!("{}: connection closed", self.name)))?;

        if delay_ms == 0 {
            writer.write_all(text.as_bytes()).await?;
        } else {
            let mut encoded = [0_u8; 4];
            for ch in text.chars() {
                writer.write_all(ch.encode_utf8(&mut encoded).as_bytes()).await?;
                writer.flush().await?;
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
        writer.flush().await?;
        Ok(())
    }

    fn mark_closed(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(connection = %self.name, "Connection closed");
        }
    }
}

#[async_trait]
impl Connection for ShellSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn prompt_str(&self) -> Vec<String> {
        self.prompts.read().clone()
    }

    fn set_prompt_str(&self, prompts: Vec<String>) {
        debug!(connection = %self.name, ?prompts, "Setting prompt");
        *self.prompts.write() = prompts;
    }

    fn timeout(&self) -> Duration {
        *self.timeout.read()
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
    }

    fn before(&self) -> String {
        self.before.read().clone()
    }

    async fn sendline(&self, line: &str, delay_ms: u64) -> Result<()> {
        if delay_ms > 0 {
            debug!(connection = %self.name, delay_ms, "sendline (with delay): {}", line);
        } else {
            debug!(connection = %self.name, "sendline: {}", line);
        }
        let text = format!("{line}{}", self.linesep);
        self.write_raw(&text, delay_ms).await
    }

    async fn sendcontrol(&self, c: char) -> Result<()> {
        let lower = c.to_ascii_lowercase();
        if !lower.is_ascii_lowercase() {
            return Err(Failure::bug(format!("Invalid control character '{c}'")));
        }
        let code = (lower as u8) & 0x1f;
        debug!(connection = %self.name, "sendcontrol: {}", c);
        self.write_raw(&char::from(code).to_string(), 0).await
    }

    async fn wait(&self, max_end_time: Option<Deadline>) -> Result<usize> {
        let deadline = max_end_time.unwrap_or_else(|| deadline_after(Instant::now(), self.timeout()));
        let patterns = self.compile_prompts()?;

        let mut io = self.io.lock().await;
        loop {
            if let Some((index, start, end)) = earliest_match(&patterns, &io.buffer) {
                *self.before.write() = io.buffer[..start].to_string();
                io.buffer.drain(..end);
                return Ok(index);
            }
            if io.eof {
                if let Some(rest) = io.log.flush() {
                    debug!(target: "dispatchflow::target", connection = %self.name, "{}", rest);
                }
                self.mark_closed();
                return Err(Failure::infrastructure(format!(
                    "{}: connection closed while waiting for prompt",
                    self.name
                )));
            }
            let next = tokio::time::timeout_at(deadline, io.output.recv()).await;
            match next {
                Ok(Some(chunk)) => io.absorb(&self.name, &chunk),
                Ok(None) => io.eof = true,
                Err(_) => {
                    return Err(Failure::timeout(format!(
                        "{}: wait for prompt timed out",
                        self.name
                    )))
                }
            }
        }
    }

    async fn force_prompt_wait(&self, remaining: Duration) -> Result<usize> {
        if remaining.is_zero() {
            return self.wait(None).await;
        }
        let mut partial = remaining / 2;
        let mut probes = 0;
        loop {
            match self.wait(Some(deadline_after(Instant::now(), partial))).await {
                Ok(index) => return Ok(index),
                Err(err) if err.kind() == FailureKind::Timeout && probes < MAX_PROMPT_PROBES => {
                    probes += 1;
                    partial = remaining / 10;
                    warn!(
                        connection = %self.name,
                        probe = probes,
                        "Prompt not seen, sending '{}' to check the prompt", self.check_char
                    );
                    self.sendline(&self.check_char, 0).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn listen_feedback(&self, window: Duration, namespace: Option<&str>) -> Result<usize> {
        if window.is_zero() {
            return Err(Failure::bug(format!(
                "{}: feedback window must be positive",
                self.name
            )));
        }
        let namespace = namespace.unwrap_or("");
        let deadline = deadline_after(Instant::now(), window);

        let mut io = self.io.lock().await;
        let mut chunks = Vec::new();
        let first = tokio::time::timeout_at(deadline, io.output.recv()).await;
        match first {
            Ok(Some(chunk)) => chunks.push(chunk),
            Ok(None) => io.eof = true,
            Err(_) => {}
        }
        while let Ok(chunk) = io.output.try_recv() {
            chunks.push(chunk);
        }

        let mut read = 0;
        for chunk in chunks {
            read += chunk.len();
            let text = io.decode(&chunk);
            for line in io.log.push(&text) {
                info!(target: "dispatchflow::feedback", namespace = %namespace, "{}", line);
            }
        }
        if io.eof {
            if let Some(rest) = io.log.flush() {
                info!(target: "dispatchflow::feedback", namespace = %namespace, "{}", rest);
            }
            drop(io);
            self.mark_closed();
        }
        Ok(read)
    }

    async fn finalise(&self) {
        let mut io = self.io.lock().await;
        if io.closed {
            return;
        }
        io.closed = true;
        io.writer = None;
        if let Some(mut child) = io.child.take() {
            if let Err(err) = child.start_kill() {
                debug!(connection = %self.name, "Process already gone: {}", err);
            }
            if tokio::time::timeout(Duration::from_secs(5), child.wait())
                .await
                .is_err()
            {
                warn!(connection = %self.name, "Process did not exit after kill");
            }
        }
        for handle in io.pumps.drain(..) {
            handle.abort();
        }
        if let Some(rest) = io.log.flush() {
            debug!(target: "dispatchflow::target", connection = %self.name, "{}", rest);
        }
        drop(io);
        self.connected.store(false, Ordering::SeqCst);
        info!(connection = %self.name, "Finalised connection");
    }
}

impl fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellSession")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("prompts", &*self.prompts.read())
            .field("timeout", &self.timeout())
            .finish_non_exhaustive()
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        if let Ok(io) = self.io.try_lock() {
            for handle in &io.pumps {
                handle.abort();
            }
        }
    }
}
