// Child process output as a stream of text lines
//
// A pseudo-terminal is preferred so `tx` believes it is interactive and
// flushes its progress counters; plain pipes are used when no pty can be
// opened. Either way the caller sees the same `OutputStream` of lines.

use crate::services::tx_cli::{TOKEN_ENV, TxCli};
use camino::Utf8Path;
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use regex::Regex;
use std::io::{self, Read};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Bytes kept per line; the rest of an overlong line is dropped.
pub const MAX_LINE_BYTES: usize = 4096;

/// Lines buffered between the reader and the monitor loop.
const LINE_CHANNEL_CAPACITY: usize = 1024;

const READ_CHUNK: usize = 8192;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("Invalid ANSI escape regex")
});

/// Remove terminal escape sequences from a line.
pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE.replace_all(line, "").into_owned()
}

/// Splits raw output bytes into lines on `\n` or `\r`.
///
/// Progress counters are redrawn with `\r`, so both count as terminators.
/// Empty lines are dropped and each line is capped at `max_len` bytes.
#[derive(Debug)]
pub struct LineSplitter {
    buf: Vec<u8>,
    max_len: usize,
}

impl LineSplitter {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(256),
            max_len,
        }
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = self.take() {
                    lines.push(line);
                }
            } else if self.buf.len() < self.max_len {
                self.buf.push(byte);
            }
        }
        lines
    }

    /// Flush a trailing unterminated line.
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = strip_ansi(&String::from_utf8_lossy(&self.buf));
        self.buf.clear();
        let trimmed = line.trim_end();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Lines produced by a child process, independent of transport.
pub struct OutputStream {
    lines: mpsc::Receiver<String>,
    interactive: bool,
}

impl OutputStream {
    /// Whether a pseudo-terminal was obtained (line-buffered child output).
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Wait up to `wait` for the next line.
    ///
    /// `Ok(None)` means nothing arrived in time; `Err(Closed)` means the
    /// stream has ended.
    pub async fn next_line(&mut self, wait: Duration) -> Result<Option<String>, StreamClosed> {
        match tokio::time::timeout(wait, self.lines.recv()).await {
            Ok(Some(line)) => Ok(Some(line)),
            Ok(None) => Err(StreamClosed),
            Err(_) => Ok(None),
        }
    }

    /// Take an already buffered line without waiting.
    pub fn try_next_line(&mut self) -> Result<Option<String>, StreamClosed> {
        match self.lines.try_recv() {
            Ok(line) => Ok(Some(line)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(StreamClosed),
        }
    }

    /// Stop accepting lines; readers exit on their next send.
    pub fn close(&mut self) {
        self.lines.close();
    }
}

/// The output stream has no more lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClosed;

enum ChildInner {
    Pipe(tokio::process::Child),
    Pty {
        child: Box<dyn portable_pty::Child + Send + Sync>,
        // Held so the pty stays open until the child is reaped
        _master: Box<dyn MasterPty + Send>,
    },
}

/// A spawned child; killed on drop unless it already exited.
pub struct ChildProcess {
    inner: ChildInner,
    exit_code: Option<i32>,
}

impl ChildProcess {
    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> io::Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        let code = match &mut self.inner {
            ChildInner::Pipe(child) => child
                .try_wait()?
                .map(|status| status.code().unwrap_or(-1)),
            ChildInner::Pty { child, .. } => child
                .try_wait()?
                .map(|status| status.exit_code() as i32),
        };
        self.exit_code = code;
        Ok(code)
    }

    /// Kill the child and wait up to `grace` for it to be reaped.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }

        match &mut self.inner {
            ChildInner::Pipe(child) => child.start_kill()?,
            ChildInner::Pty { child, .. } => child.kill()?,
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.try_wait()?.is_some() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tracing::warn!("Child did not exit within {:?} after kill", grace);
        Ok(())
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if matches!(self.try_wait(), Ok(Some(_))) {
            return;
        }
        let result = match &mut self.inner {
            ChildInner::Pipe(child) => child.start_kill(),
            ChildInner::Pty { child, .. } => child.kill(),
        };
        if let Err(e) = result {
            tracing::debug!("Failed to kill child on drop: {}", e);
        }
    }
}

/// Spawn `tx <args>` in `work_dir` with output merged into one line stream.
///
/// Tries a pseudo-terminal when `prefer_pty` is set and falls back to pipes.
pub fn spawn_with_output<S: AsRef<str>>(
    cli: &TxCli,
    work_dir: &Utf8Path,
    args: &[S],
    prefer_pty: bool,
) -> io::Result<(ChildProcess, OutputStream)> {
    if prefer_pty {
        match spawn_pty(cli, work_dir, args) {
            Ok(spawned) => return Ok(spawned),
            Err(e) => tracing::warn!("PTY unavailable ({}), falling back to pipes", e),
        }
    }
    spawn_piped(cli, work_dir, args)
}

fn pty_size() -> PtySize {
    PtySize {
        rows: 24,
        cols: 200,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn spawn_pty<S: AsRef<str>>(
    cli: &TxCli,
    work_dir: &Utf8Path,
    args: &[S],
) -> io::Result<(ChildProcess, OutputStream)> {
    let to_io = |e: anyhow::Error| io::Error::other(e.to_string());

    let pair = native_pty_system().openpty(pty_size()).map_err(to_io)?;

    let mut builder = CommandBuilder::new(cli.binary());
    builder.args(args.iter().map(AsRef::as_ref));
    builder.cwd(work_dir.as_std_path());
    if let Some(token) = cli.token() {
        builder.env(TOKEN_ENV, token);
    }
    if std::env::var_os("TERM").is_none() {
        builder.env("TERM", "xterm-256color");
    }

    let child = pair.slave.spawn_command(builder).map_err(to_io)?;
    // The reader only sees EOF once every slave handle is closed
    drop(pair.slave);

    let reader = pair.master.try_clone_reader().map_err(to_io)?;
    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    std::thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || read_blocking(reader, tx))?;

    Ok((
        ChildProcess {
            inner: ChildInner::Pty {
                child,
                _master: pair.master,
            },
            exit_code: None,
        },
        OutputStream {
            lines: rx,
            interactive: true,
        },
    ))
}

fn spawn_piped<S: AsRef<str>>(
    cli: &TxCli,
    work_dir: &Utf8Path,
    args: &[S],
) -> io::Result<(ChildProcess, OutputStream)> {
    let mut child = cli
        .command(work_dir, args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_async(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_async(stderr, tx));
    }

    Ok((
        ChildProcess {
            inner: ChildInner::Pipe(child),
            exit_code: None,
        },
        OutputStream {
            lines: rx,
            interactive: false,
        },
    ))
}

fn read_blocking(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<String>) {
    let mut splitter = LineSplitter::new(MAX_LINE_BYTES);
    let mut buffer = [0u8; READ_CHUNK];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => count,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // Linux reports EIO once the slave side is gone
            Err(_) => break,
        };
        for line in splitter.push(&buffer[..read]) {
            if tx.blocking_send(line).is_err() {
                return;
            }
        }
    }
    if let Some(line) = splitter.finish() {
        let _ = tx.blocking_send(line);
    }
}

async fn read_async<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut splitter = LineSplitter::new(MAX_LINE_BYTES);
    let mut buffer = vec![0u8; READ_CHUNK];
    loop {
        let read = match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(count) => count,
        };
        for line in splitter.push(&buffer[..read]) {
            if tx.send(line).await.is_err() {
                return;
            }
        }
    }
    if let Some(line) = splitter.finish() {
        let _ = tx.send(line).await;
    }
}
