//! Transport that runs shell snippets through the system `ssh` binary

use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Input, Output, SshError, SshErrorKind};
use crate::config::Settings;

/// OpenSSH reserves this exit code for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

/// Runs one shell snippet on a host and reports what happened
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, target: &Input, command: &str) -> Output;
}

#[derive(Clone, Debug)]
pub struct OpenSshRunner {
    binary: String,
    dial_timeout: Duration,
    command_timeout: Duration,
}

impl OpenSshRunner {
    pub fn new(settings: &Settings) -> Self {
        Self {
            binary: settings.ssh_binary.clone(),
            dial_timeout: settings.ssh_dial_timeout(),
            command_timeout: settings.ssh_command_timeout(),
        }
    }

    fn build_command(&self, target: &Input, key_file: &NamedTempFile) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-i")
            .arg(key_file.path())
            .arg("-p")
            .arg(target.port.to_string())
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "BatchMode=yes",
                "-o",
                "LogLevel=ERROR",
            ])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.dial_timeout.as_secs().max(1)))
            .arg(format!("root@{}", target.ip))
            .arg("bash -s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn write_key_file(private_key: &str) -> std::io::Result<NamedTempFile> {
    // NamedTempFile is created with mode 0600, which ssh insists on
    let mut file = NamedTempFile::new()?;
    file.write_all(private_key.as_bytes())?;
    if !private_key.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(file)
}

#[async_trait]
impl CommandRunner for OpenSshRunner {
    async fn run(&self, target: &Input, command: &str) -> Output {
        let key_file = match write_key_file(&target.private_key) {
            Ok(f) => f,
            Err(e) => {
                return Output::from_err(SshError::new(
                    SshErrorKind::Other,
                    format!("unable to write private key: {e}"),
                ))
            }
        };

        let mut child = match self.build_command(target, &key_file).spawn() {
            Ok(child) => child,
            Err(e) => {
                return Output::from_err(SshError::new(
                    SshErrorKind::Other,
                    format!("failed to spawn {}: {e}", self.binary),
                ))
            }
        };

        // the script is fed within the command timeout
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(command.as_bytes()).await {
                    warn!("failed to write command to ssh stdin: {}", e);
                }
                // closing stdin lets `bash -s` run to the end of the script
                drop(stdin);
            }
        };
        let run = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = match tokio::time::timeout(self.command_timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Output::from_err(SshError::classified(format!(
                    "failed to run ssh against {}:{}: {e}",
                    target.ip, target.port
                )))
            }
            Err(_) => {
                return Output::from_err(SshError::new(
                    SshErrorKind::Timeout,
                    format!(
                        "command against {}:{} timed out after {:?}",
                        target.ip, target.port, self.command_timeout
                    ),
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        debug!(
            ip = %target.ip,
            port = target.port,
            status = ?output.status.code(),
            "ssh command finished"
        );
        classify_exit(output.status.code(), stdout, stderr)
    }
}

/// Turn the raw process result into an [`Output`].
pub(crate) fn classify_exit(code: Option<i32>, stdout: String, stderr: String) -> Output {
    match code {
        Some(0) => Output {
            stdout,
            stderr,
            err: None,
        },
        Some(SSH_CLIENT_FAILURE) => match SshErrorKind::classify(&stderr) {
            // the ssh client itself failed: there is no remote output to report
            kind @ (SshErrorKind::ConnectionRefused
            | SshErrorKind::AuthenticationFailed
            | SshErrorKind::Timeout) => {
                Output::from_err(SshError::new(kind, stderr.trim().to_string()))
            }
            SshErrorKind::ExitedWithoutStatus => Output {
                stdout,
                stderr: String::new(),
                err: Some(SshError::new(
                    SshErrorKind::ExitedWithoutStatus,
                    stderr.trim().to_string(),
                )),
            },
            _ => Output {
                stdout,
                stderr,
                err: Some(SshError::from_kind(SshErrorKind::ExitStatus(255))),
            },
        },
        Some(status) => Output {
            stdout,
            stderr,
            err: Some(SshError::from_kind(SshErrorKind::ExitStatus(
                status.unsigned_abs(),
            ))),
        },
        None => Output {
            stdout,
            stderr,
            err: Some(SshError::from_kind(SshErrorKind::ExitedWithoutStatus)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn stalled_stdin_is_bounded_by_command_timeout() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake_ssh = dir.path().join("ssh");
        std::fs::write(&fake_ssh, "#!/bin/sh\nsleep 10\n").unwrap();
        std::fs::set_permissions(&fake_ssh, std::fs::Permissions::from_mode(0o755)).unwrap();

        let settings = Settings {
            ssh_binary: fake_ssh.to_string_lossy().to_string(),
            ssh_dial_timeout_seconds: 1,
            ssh_command_timeout_seconds: 1,
            ..Default::default()
        };
        let runner = OpenSshRunner::new(&settings);
        let target = Input {
            ip: "192.0.2.10".into(),
            private_key: "key".into(),
            port: 22,
        };
        // far beyond a pipe buffer, the write blocks until the child reads
        let script = "#".repeat(4 * 1024 * 1024);

        let started = std::time::Instant::now();
        let out = runner.run(&target, &script).await;

        assert!(out.err_is(&SshErrorKind::Timeout), "{out:?}");
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[test]
    fn zero_exit_is_success() {
        let out = classify_exit(Some(0), "rescue\n".into(), String::new());
        assert_eq!(out.stdout, "rescue\n");
        assert!(out.err.is_none());
    }

    #[test]
    fn refused_connection_drops_remote_output() {
        let out = classify_exit(
            Some(255),
            String::new(),
            "ssh: connect to host 10.0.0.1 port 22: Connection refused\n".into(),
        );
        assert!(out.err_is(&SshErrorKind::ConnectionRefused));
        assert!(out.stderr.is_empty());
    }

    #[test]
    fn closed_by_remote_is_exit_without_status() {
        let out = classify_exit(
            Some(255),
            String::new(),
            "Connection to 10.0.0.1 closed by remote host.".into(),
        );
        assert!(out.err_is(&SshErrorKind::ExitedWithoutStatus));
    }

    #[test]
    fn non_zero_exit_keeps_output() {
        let out = classify_exit(Some(1), "partial".into(), "oops".into());
        assert_eq!(out.exit_status(), Ok(1));
        assert_eq!(out.stderr, "oops");
    }

    #[test]
    fn signal_means_no_exit_status() {
        let out = classify_exit(None, String::new(), String::new());
        assert!(out.err_is(&SshErrorKind::ExitedWithoutStatus));
    }

    #[test]
    fn key_file_gets_trailing_newline() {
        let file = write_key_file("-----BEGIN KEY-----").unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.ends_with('\n'));
    }
}
