//! [`LogSource`] backed by journalctl.

use std::process::Stdio;

use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{ActuatorError, ActuatorResult};
use crate::traits::{LogQuery, LogSource, LogStream};

#[derive(Debug, Clone)]
pub struct JournalLogSource {
    program: String,
    user_mode: bool,
}

impl JournalLogSource {
    pub fn new(user_mode: bool) -> Self {
        Self {
            program: "journalctl".to_string(),
            user_mode,
        }
    }

    /// Use a different binary. Tests point this at a stub.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub(crate) fn args(&self, query: &LogQuery) -> Vec<String> {
        let mut args = Vec::new();
        if self.user_mode {
            args.push("--user".to_string());
        }
        for selector in &query.selectors {
            args.push("-u".to_string());
            args.push(selector.clone());
        }
        args.extend([
            "-n".to_string(),
            query.lines.to_string(),
            "--no-pager".to_string(),
            "-o".to_string(),
            "short-iso".to_string(),
        ]);
        if query.follow {
            args.push("-f".to_string());
        }
        args
    }
}

#[async_trait]
impl LogSource for JournalLogSource {
    async fn stream(&self, query: &LogQuery) -> ActuatorResult<LogStream> {
        // Without `-u` journalctl would read the whole journal.
        if query.selectors.is_empty() {
            return Ok(Box::pin(futures::stream::empty()));
        }
        let args = self.args(query);
        debug!(program = %self.program, ?args, "starting log follower");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ActuatorError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ActuatorError::Parse {
            what: "journalctl".to_string(),
            detail: "stdout not captured".to_string(),
        })?;
        // Drained alongside stdout so a chatty stderr cannot fill its pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });
        let command = format!("{} {}", self.program, args.join(" "));

        Ok(Box::pin(follow_lines(child, stdout, stderr, command)))
    }
}

/// Yield stdout lines, then surface a non-zero exit as a final error.
/// The child moves into the stream, so dropping the stream kills it.
fn follow_lines(
    mut child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    command: String,
) -> impl Stream<Item = ActuatorResult<String>> + Send {
    async_stream::try_stream! {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await.map_err(|source| ActuatorError::Io {
            path: "journalctl stdout".into(),
            source,
        })? {
            yield line;
        }

        let stderr = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let status = child.wait().await.map_err(|source| ActuatorError::Io {
            path: "journalctl".into(),
            source,
        })?;
        if !status.success() {
            Err(ActuatorError::CommandFailed {
                command,
                exit_code: status.code().unwrap_or(-1),
                stdout: String::new(),
                stderr: stderr.trim().to_string(),
            })?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn query(follow: bool) -> LogQuery {
        LogQuery {
            selectors: vec!["pvdify-shop-web@*".to_string(), "pvdify-shop-worker@*".to_string()],
            lines: 100,
            follow,
        }
    }

    #[test]
    fn builds_journalctl_arguments() {
        let args = JournalLogSource::new(false).args(&query(false));
        assert_eq!(
            args,
            [
                "-u",
                "pvdify-shop-web@*",
                "-u",
                "pvdify-shop-worker@*",
                "-n",
                "100",
                "--no-pager",
                "-o",
                "short-iso"
            ]
        );

        let args = JournalLogSource::new(true).args(&query(true));
        assert_eq!(args.first().map(String::as_str), Some("--user"));
        assert_eq!(args.last().map(String::as_str), Some("-f"));
    }

    #[tokio::test]
    async fn streams_lines_from_the_command() {
        // `echo` prints its arguments on one line, which is enough to check plumbing.
        let source = JournalLogSource::new(false).with_program("echo");
        let lines: Vec<_> = source.stream(&query(false)).await.unwrap().collect().await;
        assert_eq!(lines.len(), 1);
        let line = lines[0].as_ref().unwrap();
        assert!(line.contains("-u pvdify-shop-web@* -u pvdify-shop-worker@*"));
    }

    #[tokio::test]
    async fn no_selectors_reads_nothing() {
        // `echo` would print its arguments if it were spawned.
        let source = JournalLogSource::new(false).with_program("echo");
        let empty = LogQuery {
            selectors: Vec::new(),
            ..query(false)
        };
        let lines: Vec<_> = source.stream(&empty).await.unwrap().collect().await;
        assert!(lines.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn chatty_stderr_does_not_stall_the_follower() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("journalctl");
        std::fs::write(
            &script,
            "#!/bin/sh\ni=0\nwhile [ $i -lt 5000 ]; do echo \"noise line $i padding padding\" >&2; i=$((i+1)); done\necho done\nexit 3\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let source = JournalLogSource::new(false).with_program(script.to_string_lossy());
        let stream = source.stream(&query(false)).await.unwrap();
        let items: Vec<_> = tokio::time::timeout(std::time::Duration::from_secs(10), stream.collect())
            .await
            .expect("follower stalled");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "done");
        match &items[1] {
            Err(ActuatorError::CommandFailed { exit_code, stderr, .. }) => {
                assert_eq!(*exit_code, 3);
                assert!(stderr.contains("noise line 4999"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_zero_exit_ends_stream_with_error() {
        let source = JournalLogSource::new(false).with_program("false");
        let items: Vec<_> = source.stream(&query(false)).await.unwrap().collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ActuatorError::CommandFailed { .. })));
    }
}
