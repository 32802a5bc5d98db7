//! Starting the helper as its own process group with captured output.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;

use crate::{Result, TranslatorConfig, TranslatorError};

/// Keep at most this many bytes per stream; older output is dropped.
const MAX_CAPTURED_BYTES: usize = 64 * 1024;

/// What to run, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl HelperCommand {
    pub fn from_config(config: &TranslatorConfig) -> Result<Self> {
        let mut parts = config.helper_command().into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| TranslatorError::Config("helper command is empty".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            working_dir: config.server_dir.clone(),
        })
    }
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Streams {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Tail of the helper's stdout and stderr, filled by background readers.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    inner: Arc<Mutex<Streams>>,
}

impl CapturedOutput {
    fn push(&self, stream: Stream, bytes: &[u8]) {
        let Ok(mut streams) = self.inner.lock() else {
            return;
        };
        let buf = match stream {
            Stream::Stdout => &mut streams.stdout,
            Stream::Stderr => &mut streams.stderr,
        };
        buf.extend_from_slice(bytes);
        if buf.len() > MAX_CAPTURED_BYTES {
            let excess = buf.len() - MAX_CAPTURED_BYTES;
            buf.drain(..excess);
        }
    }

    pub fn push_stdout(&self, bytes: &[u8]) {
        self.push(Stream::Stdout, bytes);
    }

    pub fn push_stderr(&self, bytes: &[u8]) {
        self.push(Stream::Stderr, bytes);
    }

    pub fn stdout(&self) -> String {
        self.inner
            .lock()
            .map(|s| String::from_utf8_lossy(&s.stdout).into_owned())
            .unwrap_or_default()
    }

    pub fn stderr(&self) -> String {
        self.inner
            .lock()
            .map(|s| String::from_utf8_lossy(&s.stderr).into_owned())
            .unwrap_or_default()
    }
}

/// A freshly started helper.
#[derive(Debug)]
pub struct SpawnedHelper {
    pub pid: u32,
    pub pgid: u32,
    /// `None` when the spawner does not own an OS child (test doubles).
    pub child: Option<Child>,
    pub output: CapturedOutput,
}

/// Starts the helper process.
pub trait Spawner: Send + Sync {
    /// Must be called from within a tokio runtime.
    fn spawn(&self, command: &HelperCommand) -> Result<SpawnedHelper>;
}

/// Spawns a real OS process as leader of a new process group.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    fn spawn(&self, command: &HelperCommand) -> Result<SpawnedHelper> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let spawn_error = |source: std::io::Error| TranslatorError::Spawn {
            command: command.to_string(),
            source,
        };
        let mut child = cmd.spawn().map_err(spawn_error)?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_error(std::io::Error::other("helper exited immediately")))?;

        let output = CapturedOutput::default();
        if let Some(stdout) = child.stdout.take() {
            drain(stdout, output.clone(), Stream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            drain(stderr, output.clone(), Stream::Stderr);
        }

        tracing::info!(pid, command = %command, dir = %command.working_dir.display(), "spawned translation server");
        Ok(SpawnedHelper {
            pid,
            // The child leads its own group.
            pgid: pid,
            child: Some(child),
            output,
        })
    }
}

/// Keep the pipe empty so the helper never blocks on a full stdout.
fn drain<R>(mut reader: R, output: CapturedOutput, stream: Stream)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => output.push(stream, &buf[..n]),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_from_default_config() {
        let config = TranslatorConfig {
            server_dir: PathBuf::from("/srv/ts"),
            ..TranslatorConfig::default()
        };
        let cmd = HelperCommand::from_config(&config).unwrap();
        assert_eq!(cmd.program, "npm");
        assert_eq!(cmd.args, vec!["start", "--prefix", "/srv/ts"]);
        assert_eq!(cmd.working_dir, PathBuf::from("/srv/ts"));
        assert_eq!(cmd.to_string(), "npm start --prefix /srv/ts");
    }

    #[test]
    fn blank_program_is_a_config_error() {
        let config = TranslatorConfig {
            command: vec!["  ".into()],
            ..TranslatorConfig::default()
        };
        assert!(matches!(
            HelperCommand::from_config(&config),
            Err(TranslatorError::Config(_))
        ));
    }

    #[test]
    fn captured_output_keeps_the_tail() {
        let output = CapturedOutput::default();
        output.push_stdout(&vec![b'a'; MAX_CAPTURED_BYTES]);
        output.push_stdout(b"END");
        let stdout = output.stdout();
        assert_eq!(stdout.len(), MAX_CAPTURED_BYTES);
        assert!(stdout.ends_with("END"));
        assert!(output.stderr().is_empty());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let cmd = HelperCommand {
            program: "definitely-not-a-real-translation-server".into(),
            args: vec![],
            working_dir: std::env::temp_dir(),
        };
        let err = ProcessSpawner.spawn(&cmd).unwrap_err();
        assert!(matches!(err, TranslatorError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let cmd = HelperCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "echo out; echo err >&2".into()],
            working_dir: std::env::temp_dir(),
        };
        let mut helper = ProcessSpawner.spawn(&cmd).unwrap();
        assert_eq!(helper.pgid, helper.pid);
        helper.child.as_mut().unwrap().wait().await.unwrap();

        let ok = crate::wait::poll_until(
            || std::future::ready(helper.output.stdout().contains("out") && helper.output.stderr().contains("err")),
            std::time::Duration::from_secs(2),
            std::time::Duration::from_millis(10),
        )
        .await;
        assert!(ok, "stdout={:?} stderr={:?}", helper.output.stdout(), helper.output.stderr());
    }
}
