use crate::{
    Result, StratoError,
    config::TimeoutConfig,
    hypervisor::HypervisorSession,
    log_debug,
};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Connection coordinates for one hypervisor host. Owned by the fleet
/// registry; the driver only borrows a copy for the duration of a call.
#[derive(Debug, Clone)]
pub struct HostConnection {
    pub host_id: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub key_path: Option<String>,
    pub password: Option<String>,
}

impl HostConnection {
    pub fn hypervisor_uri(&self) -> String {
        format!("qemu+ssh://{}@{}/system", self.username, self.hostname)
    }
}

/// Result of a remote command. `exit_code` is the remote process status;
/// transport-level failures surface as errors instead.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Stateless command/file channel to a single host. Every call opens its
/// own SSH transport and closes it on return; nothing is cached.
pub struct HostDriver {
    conn: HostConnection,
    timeouts: TimeoutConfig,
}

impl HostDriver {
    pub fn new(conn: HostConnection, timeouts: TimeoutConfig) -> Self {
        Self { conn, timeouts }
    }

    pub fn connection(&self) -> &HostConnection {
        &self.conn
    }

    /// Hypervisor RPC session bound to this host.
    pub fn hypervisor(&self) -> HypervisorSession {
        HypervisorSession::new(self.conn.hypervisor_uri(), self.timeouts)
    }

    /// Run `command` on the host, honoring `timeout`. Returns the remote
    /// exit code and captured output; non-zero exit is not an error here.
    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let mut cmd = self.ssh_command();
        cmd.arg(command);
        log_debug!("[{}] exec: {}", self.conn.host_id, command);
        self.run(cmd, timeout).await
    }

    /// Run `command` and require a zero exit status.
    pub async fn exec_checked(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let output = self.exec(command, timeout).await?;
        if !output.success() {
            return Err(StratoError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Copy a local file onto the host.
    pub async fn put_file(&self, local: &Path, remote: &str) -> Result<()> {
        let mut cmd = self.scp_command();
        cmd.arg(local);
        cmd.arg(format!(
            "{}@{}:{}",
            self.conn.username, self.conn.hostname, remote
        ));
        self.run(cmd, self.timeouts.file_copy()).await.map(|_| ())
    }

    /// Copy a file from the host to a local path.
    pub async fn get_file(&self, remote: &str, local: &Path) -> Result<()> {
        let mut cmd = self.scp_command();
        cmd.arg(format!(
            "{}@{}:{}",
            self.conn.username, self.conn.hostname, remote
        ));
        cmd.arg(local);
        self.run(cmd, self.timeouts.file_copy()).await.map(|_| ())
    }

    fn ssh_command(&self) -> Command {
        let mut cmd = self.wrap_auth("ssh");
        cmd.args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "ConnectTimeout=10"])
            .args(["-p", &self.conn.port.to_string()]);
        if let Some(key) = &self.conn.key_path {
            cmd.args(["-i", key]);
        }
        cmd.arg(format!("{}@{}", self.conn.username, self.conn.hostname));
        cmd
    }

    fn scp_command(&self) -> Command {
        let mut cmd = self.wrap_auth("scp");
        cmd.args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "ConnectTimeout=10"])
            .args(["-P", &self.conn.port.to_string()]);
        if let Some(key) = &self.conn.key_path {
            cmd.args(["-i", key]);
        }
        cmd
    }

    // Password auth goes through sshpass; key auth runs the client directly
    // in batch mode so it can never hang on a prompt.
    fn wrap_auth(&self, program: &str) -> Command {
        match &self.conn.password {
            Some(password) if self.conn.key_path.is_none() => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-p").arg(password).arg(program);
                cmd
            }
            _ => {
                let mut cmd = Command::new(program);
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        }
    }

    async fn run(&self, mut cmd: Command, timeout: Duration) -> Result<CommandOutput> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let result = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                StratoError::Timeout(format!(
                    "command on host {} exceeded {}s",
                    self.conn.host_id,
                    timeout.as_secs()
                ))
            })?;

        let output = result.map_err(|e| {
            StratoError::HostUnreachable(format!(
                "could not start transport to {}: {}",
                self.conn.hostname, e
            ))
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

        // Exit 255 is the SSH client's own failure channel, not the remote
        // command's status.
        if exit_code == 255 {
            return Err(classify_transport_failure(&self.conn.hostname, &stderr));
        }

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

fn classify_transport_failure(hostname: &str, stderr: &str) -> StratoError {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied") || lower.contains("authentication failed") {
        StratoError::AuthFailed(format!("{}: {}", hostname, stderr))
    } else {
        StratoError::HostUnreachable(format!("{}: {}", hostname, stderr))
    }
}
