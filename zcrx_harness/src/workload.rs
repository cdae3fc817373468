// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The producer/consumer workload and its coordination.
//!
//! One scenario runs the workload as two processes: the receiver in the
//! background on the target, the sender in the foreground here. The
//! coordinator sequences them as Starting → Listening → Running → Exited,
//! never launching the sender before the receiver is observably listening.

use crate::env::render;
use crate::env::run_capture;
use crate::env::Target;
use crate::env::TestEnvironment;
use crate::env::ToolError;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Failure of the workload phase of a scenario.
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// A workload process could not be launched.
    #[error("failed to launch {role}")]
    Spawn {
        /// Which half failed.
        role: &'static str,
        /// The launch failure.
        #[source]
        source: std::io::Error,
    },
    /// Waiting on a background process failed.
    #[error("failed to wait for {role}")]
    Wait {
        /// Which half failed.
        role: &'static str,
        /// The wait failure.
        #[source]
        source: std::io::Error,
    },
    /// The receiver did not reach the listening state in time.
    #[error("receiver not listening on port {port} after {timeout:?}")]
    ListenTimeout {
        /// The port the receiver was expected to listen on.
        port: u16,
        /// The bound on the wait.
        timeout: Duration,
    },
    /// Probing the target's socket table failed.
    #[error("failed to probe listening state")]
    Probe(#[source] ToolError),
    /// The sender exited with an error.
    #[error("sender failed")]
    Sender(#[source] ToolError),
    /// The receiver exited with a nonzero status.
    #[error("receiver exited with non-zero status ({status})")]
    ReceiverExit {
        /// The receiver's exit status.
        status: std::process::ExitStatus,
    },
    /// The receiver did not exit after the sender completed.
    #[error("receiver still running {timeout:?} after the sender finished")]
    ExitTimeout {
        /// The bound on the wait.
        timeout: Duration,
    },
}

/// The receiver half: runs on the target, bound to one channel and port.
#[derive(Clone, Debug)]
pub struct Receiver {
    /// Workload binary path on the target.
    pub bin: PathBuf,
    /// Port to listen on.
    pub port: u16,
    /// Interface whose receive path is under test.
    pub ifname: String,
    /// Receive channel the test flow is steered to.
    pub channel: u32,
    /// Completion batch count, for the one-shot variant.
    pub batch: Option<u32>,
}

impl Receiver {
    fn command(&self, target: &Target) -> Command {
        let mut args = vec![
            "-s".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            "-i".to_string(),
            self.ifname.clone(),
            "-q".to_string(),
            self.channel.to_string(),
        ];
        if let Some(batch) = self.batch {
            args.push("-o".to_string());
            args.push(batch.to_string());
        }
        target.command(&self.bin.to_string_lossy(), args)
    }
}

/// The sender half: runs locally, connecting to the target address.
#[derive(Clone, Debug)]
pub struct Sender {
    /// Workload binary path on this machine.
    pub bin: PathBuf,
    /// Address of the target interface.
    pub addr: Ipv6Addr,
    /// Destination port.
    pub port: u16,
    /// Transfer length per send.
    pub length: u32,
    /// Send block size, for the one-shot variant.
    pub block: Option<u32>,
}

impl Sender {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-c")
            .arg("-h")
            .arg(self.addr.to_string())
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-l")
            .arg(self.length.to_string());
        if let Some(block) = self.block {
            cmd.arg("-z").arg(block.to_string());
        }
        cmd
    }
}

/// A spawned background process.
///
/// This is the first half of a two-phase handle: spawning returns a handle
/// that is not yet known to be ready; readiness is awaited separately (for
/// the receiver, via [`wait_port_listen`]). If the process is still running
/// when the handle drops, it is killed so no scenario leaks a process.
pub struct BackgroundProcess {
    child: Child,
    role: &'static str,
}

impl BackgroundProcess {
    /// Spawns `cmd` in the background.
    pub fn spawn(mut cmd: Command, role: &'static str) -> Result<Self, WorkloadError> {
        cmd.stdin(Stdio::null());
        tracing::debug!(role, command = render(&cmd).as_str(), "spawning");
        let child = cmd.spawn().map_err(|source| WorkloadError::Spawn { role, source })?;
        Ok(Self { child, role })
    }

    /// Waits up to `timeout` for the process to exit on its own.
    ///
    /// A nonzero exit status is surfaced as an error, never absorbed.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Result<(), WorkloadError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(role = self.role, %status, "background process exited");
                    return if status.success() {
                        Ok(())
                    } else {
                        Err(WorkloadError::ReceiverExit { status })
                    };
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return Err(WorkloadError::ExitTimeout { timeout });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    return Err(WorkloadError::Wait {
                        role: self.role,
                        source,
                    })
                }
            }
        }
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            tracing::warn!(
                role = self.role,
                "background process still running at scope exit, killing"
            );
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Blocks until a TCP socket on `port` is in the listening state on
/// `target`.
///
/// This is the suspension point that keeps the sender from racing the
/// receiver's bind. The wait is bounded by `timeout`.
pub fn wait_port_listen(target: &Target, port: u16, timeout: Duration) -> Result<(), WorkloadError> {
    let deadline = Instant::now() + timeout;
    loop {
        if port_is_listening(target, port).map_err(WorkloadError::Probe)? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(WorkloadError::ListenTimeout { port, timeout });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// One probe of the target's TCP socket tables.
///
/// `/proc/net/tcp*` lists the local port as uppercase hex; listening sockets
/// have state `0A`.
fn port_is_listening(target: &Target, port: u16) -> Result<bool, ToolError> {
    let table = run_capture(target.command("sh", ["-c", "cat /proc/net/tcp*"]))?;
    let needle = format!(":{port:04X}");
    Ok(table.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let local = fields.nth(1);
        let state = fields.nth(1);
        matches!((local, state), (Some(l), Some("0A")) if l.ends_with(&needle))
    }))
}

/// Runs the workload to completion: receiver in the background, sender in
/// the foreground once the receiver is listening, then waits for both to
/// exit.
pub fn run(env: &TestEnvironment, receiver: &Receiver, sender: &Sender) -> Result<(), WorkloadError> {
    let mut rx = BackgroundProcess::spawn(receiver.command(&env.target), "receiver")?;
    tracing::debug!(port = receiver.port, "waiting for receiver to listen");
    wait_port_listen(&env.target, receiver.port, env.listen_timeout)?;

    tracing::debug!("receiver listening, running sender");
    run_capture(sender.command())
        .map(drop)
        .map_err(WorkloadError::Sender)?;

    rx.wait_for_exit(env.exit_timeout)
}

#[cfg(test)]
mod tests {
    use super::port_is_listening;
    use super::wait_port_listen;
    use super::WorkloadError;
    use crate::env::Target;
    use crate::resources::reserve_port;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;
    use std::time::Instant;

    #[test]
    fn probe_sees_a_listening_socket() {
        let listener = TcpListener::bind(("::1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_is_listening(&Target::Local, port).unwrap());
        drop(listener);
    }

    #[test]
    fn wait_times_out_when_nothing_listens() {
        let lease = reserve_port().unwrap();
        let timeout = Duration::from_millis(200);
        let err = wait_port_listen(&Target::Local, lease.port(), timeout).unwrap_err();
        assert!(matches!(err, WorkloadError::ListenTimeout { .. }));
    }

    #[test]
    fn wait_blocks_until_the_socket_appears() {
        let lease = reserve_port().unwrap();
        let port = lease.port();
        let delay = Duration::from_millis(150);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let listener = std::thread::spawn(move || {
            std::thread::sleep(delay);
            let listener = TcpListener::bind(("::1", port)).unwrap();
            let _ = stop_rx.recv();
            drop(listener);
        });

        let start = Instant::now();
        wait_port_listen(&Target::Local, port, Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() >= delay - Duration::from_millis(50));

        stop_tx.send(()).unwrap();
        listener.join().unwrap();
    }
}
