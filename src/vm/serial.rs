//! Serial console driver.
//!
//! Before SSH exists, the guest is driven entirely over the emulated serial
//! port wired to QEMU's stdin/stdout. The conversation is line-oriented:
//! commands are written with a status sentinel appended, and a reader task
//! splits console output into lines feeding two consumers — a bounded
//! channel for sentinel waits and a bounded scan ring for the login watcher
//! and error log excerpts.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::util::{clear_unprintable, log_err_msg, wait_for_true};

/// Pause between individual serial bytes. The QEMU/Windows serial backend
/// polls its input; writing faster than the polling rate drops bytes, so
/// every write is paced one byte at a time.
pub const SERIAL_WRITE_DELAY: Duration = Duration::from_millis(1);

/// Exit-status line prefix watched for on the console.
pub const SENTINEL_PREFIX: &str = "SERIAL STATUS: ";

/// Appended to every serial command. The split string literal keeps the
/// guest's echo of the command itself from matching [`SENTINEL_PREFIX`].
pub const SENTINEL_SUFFIX: &str = r#"; echo "SERIAL"" ""STATUS: $?""#;

const CHANNEL_CAPACITY: usize = 32;
const SCAN_CAPACITY: usize = 32;

struct LineState {
    /// Sender side of the sentinel-wait channel; replaced wholesale by
    /// [`SerialConsole::reset_stdout`] so stale output cannot satisfy a
    /// later sentinel match.
    tx: mpsc::Sender<String>,
    /// Recent complete lines, oldest dropped first. Serves the login watcher
    /// and the log excerpts attached to boot errors.
    scan: VecDeque<String>,
    /// Console bytes since the last newline. The `login:` prompt has no
    /// trailing newline, so the watcher must see partial lines too.
    partial: String,
}

pub struct SerialConsole {
    writer: tokio::sync::Mutex<Option<ChildStdin>>,
    state: Mutex<LineState>,
}

impl SerialConsole {
    pub fn new() -> Self {
        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            writer: tokio::sync::Mutex::new(None),
            state: Mutex::new(LineState {
                tx,
                scan: VecDeque::new(),
                partial: String::new(),
            }),
        }
    }

    pub async fn attach_writer(&self, stdin: ChildStdin) {
        *self.writer.lock().await = Some(stdin);
    }

    /// Drop the write end, closing the guest-facing pipe.
    pub async fn close_writer(&self) {
        self.writer.lock().await.take();
    }

    /// Spawn the reader task consuming QEMU stdout until EOF or cancellation.
    pub fn spawn_reader(
        self: &std::sync::Arc<Self>,
        mut stdout: ChildStdout,
        mut cancel: watch::Receiver<bool>,
    ) -> JoinHandle<Result<()>> {
        let console = self.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    _ = wait_for_true(&mut cancel) => {
                        return Ok(());
                    }
                    read = stdout.read(&mut buf) => {
                        let n = read.context("read from serial pipe")?;
                        if n == 0 {
                            bail!("serial pipe closed");
                        }
                        console.ingest(&buf[..n]);
                    }
                }
            }
        })
    }

    fn ingest(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);

        let mut state = self.state.lock().unwrap();
        for ch in text.chars() {
            if ch != '\n' {
                state.partial.push(ch);
                continue;
            }

            let mut line = std::mem::take(&mut state.partial);
            if line.ends_with('\r') {
                line.pop();
            }

            if state.scan.len() >= SCAN_CAPACITY {
                state.scan.pop_front();
            }
            state.scan.push_back(line.clone());

            // Full channel: the line is dropped, not the backlog.
            let _ = state.tx.try_send(line);
        }
    }

    #[cfg(test)]
    pub(crate) fn push_line(&self, line: &str) {
        self.ingest(format!("{line}\n").as_bytes());
    }

    /// Replace the sentinel channel with a fresh one and return its receiver.
    /// Called before every serial command.
    pub fn reset_stdout(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.state.lock().unwrap().tx = tx;
        rx
    }

    /// The recent console output (scan ring plus any unterminated line),
    /// for `login:` detection and error log excerpts.
    pub fn scan_log(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut out = String::new();
        for line in &state.scan {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&state.partial);
        out
    }

    pub fn scan_contains(&self, needle: &str) -> bool {
        self.scan_log().contains(needle)
    }

    /// Write raw bytes to the console, one byte at a time with
    /// [`SERIAL_WRITE_DELAY`] between them. Writes are serialized by the
    /// writer mutex so concurrent commands cannot interleave bytes.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let stdin = guard.as_mut().context("serial writer is not attached")?;

        for (i, b) in bytes.iter().enumerate() {
            stdin
                .write_all(std::slice::from_ref(b))
                .await
                .with_context(|| format!("write char #{i}"))?;
            stdin.flush().await.with_context(|| format!("flush char #{i}"))?;
            tokio::time::sleep(SERIAL_WRITE_DELAY).await;
        }

        Ok(())
    }

    /// Issue a shell command over serial and wait for its status sentinel.
    /// Lines produced while waiting are passed to `collect`.
    pub async fn run_command(
        &self,
        cmd: &str,
        deadline: Duration,
        cancel: &mut watch::Receiver<bool>,
        collect: impl FnMut(&str),
    ) -> Result<()> {
        self.run_script(&format!("{cmd}{SENTINEL_SUFFIX}"), deadline, cancel, collect)
            .await
    }

    /// Like [`run_command`](Self::run_command) but the caller embeds the
    /// sentinel echo in the script itself (the bootstrap wraps its commands
    /// in a shell function whose body carries the sentinel).
    pub async fn run_script(
        &self,
        script: &str,
        deadline: Duration,
        cancel: &mut watch::Receiver<bool>,
        collect: impl FnMut(&str),
    ) -> Result<()> {
        let rx = self.reset_stdout();

        self.write(format!("{script}\n").as_bytes())
            .await
            .context("write serial command")?;

        wait_for_sentinel(rx, deadline, cancel, collect).await
    }
}

/// Drain the sentinel channel until a `SERIAL STATUS:` line appears, the
/// deadline passes or the console is canceled.
pub async fn wait_for_sentinel(
    mut rx: mpsc::Receiver<String>,
    deadline: Duration,
    cancel: &mut watch::Receiver<bool>,
    mut collect: impl FnMut(&str),
) -> Result<()> {
    let timeout_at = tokio::time::Instant::now() + deadline;
    let mut log = String::new();

    loop {
        tokio::select! {
            _ = wait_for_true(cancel) => {
                bail!("vm canceled while waiting for command status");
            }
            _ = tokio::time::sleep_until(timeout_at) => {
                bail!(
                    "command timed out {}",
                    log_err_msg(&log, "stdout/stderr log")
                );
            }
            line = rx.recv() => {
                let Some(line) = line else {
                    bail!("serial output channel closed");
                };

                log.push_str(&clear_unprintable(&line, false));
                log.push('\n');
                collect(&line);

                match sentinel_status(&line) {
                    None => {}
                    Some(Ok(())) => return Ok(()),
                    Some(Err(msg)) => {
                        bail!("{msg} {}", log_err_msg(&log, "stdout/stderr log"));
                    }
                }
            }
        }
    }
}

/// Interpret one console line as a sentinel status report: `None` if it is
/// not one, otherwise success for status `0` and an error for anything else.
pub fn sentinel_status(line: &str) -> Option<Result<(), String>> {
    let rest = line.strip_prefix(SENTINEL_PREFIX)?;
    let rest = rest.trim();

    if rest.is_empty() {
        return Some(Err("command status code did not show up".to_string()));
    }

    match rest.chars().next() {
        Some('0') if rest.len() == 1 => Some(Ok(())),
        _ => Some(Err(format!("non-zero command status code: '{rest}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sentinel_status_parses_success_and_failure() {
        assert_eq!(sentinel_status("SERIAL STATUS: 0"), Some(Ok(())));

        let err = sentinel_status("SERIAL STATUS: 1").unwrap().unwrap_err();
        assert!(err.contains("non-zero"));

        let err = sentinel_status("SERIAL STATUS: 127").unwrap().unwrap_err();
        assert!(err.contains("non-zero"));

        let err = sentinel_status("SERIAL STATUS: ").unwrap().unwrap_err();
        assert!(err.contains("did not show up"));

        assert_eq!(sentinel_status("some boot noise"), None);
        // The echoed command itself must not match: the literal is split.
        assert_eq!(sentinel_status(r#"echo "SERIAL"" ""STATUS: $?""#), None);
    }

    #[tokio::test]
    async fn reader_state_splits_lines_and_keeps_partials() {
        let console = Arc::new(SerialConsole::new());

        console.ingest(b"alpine-vm ");
        console.ingest(b"login:");
        assert!(console.scan_contains("login:"));

        console.ingest(b" root\r\nWelcome\n");
        assert!(console.scan_contains("Welcome"));
        assert!(console.scan_log().contains("alpine-vm login: root"));
    }

    #[tokio::test]
    async fn scan_ring_drops_oldest() {
        let console = Arc::new(SerialConsole::new());
        for i in 0..40 {
            console.push_line(&format!("line-{i}"));
        }

        let log = console.scan_log();
        assert!(!log.contains("line-0\n"));
        assert!(!log.contains("line-7\n"));
        assert!(log.contains("line-8\n"));
        assert!(log.contains("line-39\n"));
    }

    #[tokio::test]
    async fn sentinel_channel_drops_newest_when_full() {
        let console = Arc::new(SerialConsole::new());
        let mut rx = console.reset_stdout();

        for i in 0..40 {
            console.push_line(&format!("line-{i}"));
        }

        // Capacity is 32: the first 32 lines arrive, the rest were dropped.
        let mut received = Vec::new();
        while let Ok(line) = rx.try_recv() {
            received.push(line);
        }
        assert_eq!(received.len(), 32);
        assert_eq!(received[0], "line-0");
        assert_eq!(received[31], "line-31");
    }

    #[tokio::test]
    async fn reset_discards_prior_noise() {
        let console = Arc::new(SerialConsole::new());
        let mut old_rx = console.reset_stdout();
        console.push_line("SERIAL STATUS: 0");

        // A reset replaces the channel: the stale sentinel stays behind in
        // the old receiver and can't satisfy a wait on the new one.
        let mut new_rx = console.reset_stdout();
        console.push_line("fresh output");

        assert_eq!(old_rx.try_recv().unwrap(), "SERIAL STATUS: 0");
        assert_eq!(new_rx.try_recv().unwrap(), "fresh output");
        assert!(new_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wait_for_sentinel_success_and_collection() {
        let console = Arc::new(SerialConsole::new());
        let rx = console.reset_stdout();
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);

        console.push_line("|1|AAAA= ssh-ed25519 BBBB=");
        console.push_line("SERIAL STATUS: 0");

        let mut collected = Vec::new();
        wait_for_sentinel(rx, Duration::from_secs(1), &mut cancel_rx, |line| {
            collected.push(line.to_string())
        })
        .await
        .unwrap();

        assert_eq!(collected.len(), 2);
        assert!(collected[0].starts_with('|'));
    }

    #[tokio::test]
    async fn wait_for_sentinel_nonzero_status_errors() {
        let console = Arc::new(SerialConsole::new());
        let rx = console.reset_stdout();
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);

        console.push_line("sh: command not found");
        console.push_line("SERIAL STATUS: 127");

        let err = wait_for_sentinel(rx, Duration::from_secs(1), &mut cancel_rx, |_| {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("non-zero"));
        assert!(err.to_string().contains("command not found"));
    }

    #[tokio::test]
    async fn wait_for_sentinel_times_out() {
        let console = Arc::new(SerialConsole::new());
        let rx = console.reset_stdout();
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);

        console.push_line("still booting");

        let err = wait_for_sentinel(rx, Duration::from_millis(50), &mut cancel_rx, |_| {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(err.to_string().contains("still booting"));
    }

    #[tokio::test]
    async fn wait_for_sentinel_observes_cancellation() {
        let console = Arc::new(SerialConsole::new());
        let rx = console.reset_stdout();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = cancel_tx.send(true);
        });

        let err = wait_for_sentinel(rx, Duration::from_secs(5), &mut cancel_rx, |_| {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("canceled"));
    }
}
