// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Execution targets and the test environment.

use anyhow::Context;
use std::net::Ipv6Addr;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;

/// Error invoking an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool could not be launched.
    #[error("failed to launch `{0}`")]
    Launch(String, #[source] std::io::Error),
    /// The tool exited with a nonzero status.
    #[error("`{0}` exited with non-zero status ({1}): {2}")]
    Exit(String, std::process::ExitStatus, String),
    /// The tool's output is not utf-8.
    #[error("`{0}` output is not utf-8")]
    Utf8(String, #[source] std::string::FromUtf8Error),
}

/// Where the device under test and the receiver half of the workload live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// Commands run directly on this machine.
    Local,
    /// Commands run on a remote host over ssh.
    Ssh {
        /// The ssh destination, e.g. `root@peer`.
        host: String,
    },
}

impl Target {
    /// Builds a command that runs `program` with `args` on this target.
    pub fn command<I, S>(&self, program: &str, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match self {
            Target::Local => {
                let mut cmd = Command::new(program);
                for arg in args {
                    cmd.arg(arg.as_ref());
                }
                cmd
            }
            Target::Ssh { host } => {
                let mut line = shell_quote(program);
                for arg in args {
                    line.push(' ');
                    line.push_str(&shell_quote(arg.as_ref()));
                }
                let mut cmd = Command::new("ssh");
                cmd.arg(host).arg(line);
                cmd
            }
        }
    }

    /// True if commands cross a machine boundary.
    pub fn is_remote(&self) -> bool {
        matches!(self, Target::Ssh { .. })
    }
}

/// Quotes one word for the remote login shell.
fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@+,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

pub(crate) fn render(cmd: &Command) -> String {
    let mut line = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

/// Runs a command to completion and returns its standard output.
///
/// The full command line and both output streams are logged at debug level.
pub(crate) fn run_capture(mut cmd: Command) -> Result<String, ToolError> {
    cmd.stdin(Stdio::null());
    let line = render(&cmd);
    let output = cmd
        .output()
        .map_err(|err| ToolError::Launch(line.clone(), err))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    tracing::debug!(
        command = line.as_str(),
        stdout = stdout.as_str(),
        stderr = stderr.as_str()
    );

    if !output.status.success() {
        return Err(ToolError::Exit(
            line,
            output.status,
            stderr.trim_end().to_string(),
        ));
    }
    String::from_utf8(output.stdout).map_err(|err| ToolError::Utf8(line, err))
}

/// Everything a scenario needs to know about the machine pair under test.
#[derive(Clone, Debug)]
pub struct TestEnvironment {
    /// Name of the network interface under test, on the target.
    pub ifname: String,
    /// Where the device and the receiver run.
    pub target: Target,
    /// IPv6 address of the target interface, if it has one.
    pub remote_addr: Option<Ipv6Addr>,
    /// Path to the workload binary on this machine (the sender half).
    pub sender_bin: PathBuf,
    /// Path to the workload binary on the target (the receiver half).
    ///
    /// Defaults to `sender_bin`; [`TestEnvironment::deploy`] replaces it with
    /// the staged copy on a remote target.
    pub receiver_bin: PathBuf,
    /// Path to the device settings tool.
    pub ethtool: PathBuf,
    /// Bound on the wait for the receiver to start listening.
    pub listen_timeout: Duration,
    /// Bound on the wait for the receiver to exit once the sender is done.
    pub exit_timeout: Duration,
}

impl TestEnvironment {
    /// Creates an environment for `ifname` on `target`, using `workload_bin`
    /// for both halves of the workload.
    pub fn new(
        ifname: impl Into<String>,
        target: Target,
        workload_bin: impl Into<PathBuf>,
    ) -> Self {
        let sender_bin = workload_bin.into();
        Self {
            ifname: ifname.into(),
            target,
            remote_addr: None,
            receiver_bin: sender_bin.clone(),
            sender_bin,
            ethtool: "ethtool".into(),
            listen_timeout: Duration::from_secs(5),
            exit_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the IPv6 address of the target interface.
    pub fn with_remote_addr(mut self, addr: Ipv6Addr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Overrides the device settings tool.
    pub fn with_ethtool(mut self, ethtool: impl Into<PathBuf>) -> Self {
        self.ethtool = ethtool.into();
        self
    }

    /// Copies the workload binary to the target so the receiver can run
    /// there. No-op on a local target.
    pub fn deploy(&mut self) -> anyhow::Result<()> {
        let Target::Ssh { host } = &self.target else {
            return Ok(());
        };
        let dir = run_capture(self.target.command("mktemp", ["-d"]))
            .context("failed to create staging directory on target")?;
        let file_name = self
            .sender_bin
            .file_name()
            .context("workload binary path has no file name")?;
        let dest = Path::new(dir.trim_end()).join(file_name);

        let mut scp = Command::new("scp");
        scp.arg(&self.sender_bin)
            .arg(format!("{}:{}", host, dest.display()));
        run_capture(scp).context("failed to copy workload binary to target")?;

        tracing::info!(dest = %dest.display(), "deployed workload binary");
        self.receiver_bin = dest;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::render;
    use super::shell_quote;
    use super::Target;

    #[test]
    fn local_command_runs_program_directly() {
        let cmd = Target::Local.command("ethtool", ["-l", "eth0"]);
        assert_eq!(render(&cmd), "ethtool -l eth0");
    }

    #[test]
    fn ssh_command_wraps_in_one_shell_word_per_arg() {
        let target = Target::Ssh {
            host: "root@peer".to_string(),
        };
        let cmd = target.command("sh", ["-c", "cat /proc/net/tcp*"]);
        assert_eq!(render(&cmd), "ssh root@peer sh -c 'cat /proc/net/tcp*'");
    }

    #[test]
    fn quoting_passes_plain_words_through() {
        assert_eq!(shell_quote("eth0"), "eth0");
        assert_eq!(shell_quote("root@peer:/tmp/bin"), "root@peer:/tmp/bin");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
