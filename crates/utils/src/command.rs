//! Helpers intended for [`std::process::Command`] and related structures.

use std::io::{Read, Seek, Write};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, capturing stderr. On failure the error
    /// carries the child's stderr verbatim.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and capture its output. This uses `run_capture_stderr` internally
    /// and will return an error if the child process exits abnormally.
    fn run_get_output(&mut self) -> Result<Box<dyn std::io::BufRead>>;

    /// Execute the child process and capture its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, feeding `input` to its stdin, and capture
    /// stdout as a string.
    fn run_with_stdin(&mut self, input: &[u8]) -> Result<String>;
}

/// Render a command line for logging, quoting arguments as a POSIX shell would.
pub fn render_command(cmd: &Command) -> String {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let args = cmd
        .get_args()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    std::iter::once(program)
        .chain(args)
        .map(|a| shlex::try_quote(&a).map(|q| q.into_owned()).unwrap_or(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A child process exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    /// The program that was run.
    pub program: String,
    /// The rendered exit status.
    pub status: String,
    /// Everything the child wrote to stderr, trimmed.
    pub stderr: String,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.program, self.status)?;
        if !self.stderr.is_empty() {
            write!(f, ": {}", self.stderr)?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandError {}

/// Convert an exit status plus captured stderr into an error.
fn status_to_error(cmd: &Command, st: std::process::ExitStatus, stderr: &str) -> Result<()> {
    if st.success() {
        return Ok(());
    }
    Err(CommandError {
        program: cmd.get_program().to_string_lossy().into_owned(),
        status: st.to_string(),
        stderr: stderr.trim().to_owned(),
    }
    .into())
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", render_command(self));
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        tracing::trace!("exec: {}", render_command(self));
        let st = self
            .status()
            .with_context(|| format!("Spawning {}", self.get_program().to_string_lossy()))?;
        let mut stderr = stderr;
        stderr.rewind()?;
        let mut raw = Vec::new();
        stderr.read_to_end(&mut raw)?;
        status_to_error(self, st, &String::from_utf8_lossy(&raw))
    }

    fn run_get_output(&mut self) -> Result<Box<dyn std::io::BufRead>> {
        let mut stdout = tempfile::tempfile()?;
        self.stdout(stdout.try_clone()?);
        self.run_capture_stderr()?;
        stdout.seek(std::io::SeekFrom::Start(0)).context("seek")?;
        Ok(Box::new(std::io::BufReader::new(stdout)))
    }

    fn run_get_string(&mut self) -> Result<String> {
        let mut s = String::new();
        let mut o = self.run_get_output()?;
        o.read_to_string(&mut s)?;
        Ok(s)
    }

    fn run_with_stdin(&mut self, input: &[u8]) -> Result<String> {
        self.stdin(Stdio::piped());
        self.stdout(Stdio::piped());
        self.stderr(Stdio::piped());
        tracing::trace!("exec: {}", render_command(self));
        let mut child = self
            .spawn()
            .with_context(|| format!("Spawning {}", self.get_program().to_string_lossy()))?;
        // Scoped so stdin is closed before we wait.
        {
            let mut stdin = child.stdin.take().context("stdin")?;
            stdin.write_all(input)?;
        }
        let output = child.wait_with_output()?;
        status_to_error(self, output.status, &String::from_utf8_lossy(&output.stderr))?;
        String::from_utf8(output.stdout).context("Parsing output as UTF-8")
    }
}

/// Helpers intended for [`tokio::process::Command`].
#[allow(async_fn_in_trait)]
pub trait AsyncCommandRunExt {
    /// Asynchronously execute the child, returning an error (carrying stderr) if it exited
    /// unsuccessfully. If `cancel` fires first the child is killed and the run fails.
    async fn run_cancellable(&mut self, cancel: &CancellationToken) -> Result<()>;
}

impl AsyncCommandRunExt for tokio::process::Command {
    async fn run_cancellable(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.stdin(Stdio::null());
        self.stderr(Stdio::piped());
        self.kill_on_drop(true);
        let program = self.as_std().get_program().to_string_lossy().into_owned();
        tracing::debug!("exec: {}", render_command(self.as_std()));
        let child = self
            .spawn()
            .with_context(|| format!("Spawning {program}"))?;
        tokio::select! {
            output = child.wait_with_output() => {
                let output = output?;
                status_to_error(self.as_std(), output.status, &String::from_utf8_lossy(&output.stderr))
            }
            _ = cancel.cancelled() => {
                Err(anyhow::Error::new(crate::Cancelled).context(format!("Running {program}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_run_ext() {
        // The basics
        Command::new("true").run_capture_stderr().unwrap();
        assert!(Command::new("false").run_capture_stderr().is_err());

        // Verify we capture stderr
        let e = Command::new("/bin/sh")
            .args(["-c", "echo expected-this-oops-message 1>&2; exit 1"])
            .run_capture_stderr()
            .err()
            .unwrap();
        similar_asserts::assert_eq!(
            e.to_string(),
            "/bin/sh failed: exit status: 1: expected-this-oops-message"
        );

        // Ignoring invalid UTF-8
        let e = Command::new("/bin/sh")
            .args([
                "-c",
                r"echo -e 'expected\xf5\x80\x80\x80\x80-foo\xc0bar\xc0\xc0' 1>&2; exit 1",
            ])
            .run_capture_stderr()
            .err()
            .unwrap();
        assert!(e.to_string().starts_with("/bin/sh failed:"));
        assert!(e.downcast_ref::<CommandError>().is_some());
    }

    #[test]
    fn command_run_get_string() {
        let s = Command::new("echo").arg("hello").run_get_string().unwrap();
        assert_eq!(s, "hello\n");
    }

    #[test]
    fn command_run_with_stdin() {
        let s = Command::new("cat").run_with_stdin(b"name: foo\n").unwrap();
        assert_eq!(s, "name: foo\n");
    }

    #[test]
    fn test_render_command() {
        let mut cmd = Command::new("qemu-img");
        cmd.args(["convert", "-O", "qcow2", "/tmp/a b.raw"]);
        assert_eq!(render_command(&cmd), "qemu-img convert -O qcow2 '/tmp/a b.raw'");
    }

    #[tokio::test]
    async fn async_run_cancellable() {
        let cancel = CancellationToken::new();
        tokio::process::Command::new("true")
            .run_cancellable(&cancel)
            .await
            .unwrap();
        let e = tokio::process::Command::new("/bin/sh")
            .args(["-c", "echo boom 1>&2; exit 3"])
            .run_cancellable(&cancel)
            .await
            .unwrap_err();
        assert!(e.to_string().ends_with(": boom"), "{e}");

        cancel.cancel();
        let e = tokio::process::Command::new("sleep")
            .arg("60")
            .run_cancellable(&cancel)
            .await
            .unwrap_err();
        assert_eq!(e.to_string(), "Running sleep");
        assert!(e.root_cause().is::<crate::Cancelled>());
    }
}
