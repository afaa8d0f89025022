//! Child processes with a wall-clock limit and bounded capture.
//!
//! Agent sessions and `gh` calls both go through [`run_command_with_timeout`].
//! Both output pipes are drained on their own threads so a chatty child never
//! blocks on a full pipe while we wait on it.

use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// One captured stream: the kept prefix plus a count of dropped bytes.
#[derive(Debug, Default, Clone)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Captured {
    /// Read `reader` to EOF, keeping at most `limit` bytes.
    fn drain(mut reader: impl Read, limit: usize) -> io::Result<Self> {
        let mut captured = Self::default();
        let mut chunk = [0u8; 8192];
        loop {
            let read = match reader.read(&mut chunk) {
                Ok(0) => return Ok(captured),
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            let room = limit.saturating_sub(captured.bytes.len());
            let kept = &chunk[..read.min(room)];
            captured.bytes.extend_from_slice(kept);
            captured.dropped += read - kept.len();
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    fn write_section(&self, name: &str, out: &mut String) {
        out.push_str(&format!("--- {name} ---\n"));
        out.push_str(&self.text());
        if !out.ends_with('\n') {
            out.push('\n');
        }
        if self.dropped > 0 {
            out.push_str(&format!("[{name}: {} more bytes not kept]\n", self.dropped));
        }
    }
}

/// Exit status and captured streams of a finished (or killed) child.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.text()
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.text()
    }

    /// Both streams in one text, as written to session logs.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        self.stdout.write_section("stdout", &mut out);
        self.stderr.write_section("stderr", &mut out);
        if self.timed_out {
            out.push_str("[killed after timeout]\n");
        }
        out
    }
}

/// Spawn `cmd`, feed it `stdin`, and wait at most `timeout` for it to exit.
///
/// A child still running at the deadline is killed and reported with
/// `timed_out` set; that is not an error. Each stream keeps at most
/// `output_limit_bytes`.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let stdin_mode = match stdin {
        Some(_) => Stdio::piped(),
        None => Stdio::null(),
    };
    let mut child = cmd
        .stdin(stdin_mode)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;
    debug!(pid = child.id(), "child started");

    let stdout = spawn_reader(child.stdout.take(), output_limit_bytes, "stdout")?;
    let stderr = spawn_reader(child.stderr.take(), output_limit_bytes, "stderr")?;

    if let Some(input) = stdin {
        feed_stdin(&mut child, input)?;
    }

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for child")? {
        Some(status) => (status, false),
        None => {
            warn!("deadline passed, killing child");
            child.kill().context("kill child")?;
            (child.wait().context("reap killed child")?, true)
        }
    };

    let output = CommandOutput {
        status,
        stdout: collect(stdout, "stdout")?,
        stderr: collect(stderr, "stderr")?,
        timed_out,
    };
    if output.stdout.dropped + output.stderr.dropped > 0 {
        warn!(
            stdout_dropped = output.stdout.dropped,
            stderr_dropped = output.stderr.dropped,
            "child output exceeded capture limit"
        );
    }
    debug!(code = ?output.status.code(), timed_out, "child finished");
    Ok(output)
}

fn spawn_reader(
    pipe: Option<impl Read + Send + 'static>,
    limit: usize,
    name: &str,
) -> Result<JoinHandle<io::Result<Captured>>> {
    let pipe = pipe.ok_or_else(|| anyhow!("{name} of child is not piped"))?;
    Ok(thread::spawn(move || Captured::drain(pipe, limit)))
}

fn feed_stdin(child: &mut Child, input: &[u8]) -> Result<()> {
    // Dropping the handle closes the pipe so the child sees EOF.
    let mut pipe = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("stdin of child is not piped"))?;
    if let Err(err) = pipe.write_all(input) {
        // The child exited without reading everything; its status tells why.
        warn!(err = %err, "child stopped reading stdin");
    }
    Ok(())
}

fn collect(handle: JoinHandle<io::Result<Captured>>, name: &str) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("{name} reader panicked"))?
        .with_context(|| format!("read child {name}"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn stdin_is_piped_through() {
        let out = run_command_with_timeout(Command::new("cat"), Some(b"prompt"), Duration::from_secs(5), 1024)
            .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout_text(), "prompt");
    }

    #[test]
    fn capture_keeps_a_prefix_and_counts_the_rest() {
        let out = run_command_with_timeout(sh("printf 0123456789; printf oops >&2"), None, Duration::from_secs(5), 4)
            .expect("run");
        assert_eq!(out.stdout.bytes, b"0123");
        assert_eq!(out.stdout.dropped, 6);
        assert_eq!(out.stderr_text(), "oops");
        assert!(out.transcript().contains("[stdout: 6 more bytes not kept]"));
    }

    /// Verifies a child past its deadline is killed rather than awaited.
    #[test]
    fn deadline_kills_the_child() {
        let out = run_command_with_timeout(sh("sleep 5"), None, Duration::from_millis(100), 1024).expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.transcript().ends_with("[killed after timeout]\n"));
    }

    #[test]
    fn nonzero_exit_is_not_an_error() {
        let out = run_command_with_timeout(sh("echo bad >&2; exit 3"), None, Duration::from_secs(5), 1024)
            .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stderr_text().trim(), "bad");
    }
}
