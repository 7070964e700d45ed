//! Listener liveness supervision.
//!
//! Every interval the supervisor asks the OS whether anything is still
//! listening on the configured port. If not, it restarts the server. A
//! probe that cannot run is logged and the check is skipped; it never
//! triggers a restart on its own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use super::server::ServerError;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: &'static str,
        status: String,
        stderr: String,
    },
}

/// Answers "is anything accepting connections on this port?".
#[async_trait]
pub trait ListenerProbe: Send + Sync {
    async fn is_listening(&self, port: u16) -> Result<bool, ProbeError>;
}

/// The part of the server the supervisor drives.
#[async_trait]
pub trait ListenerControl: Send + Sync {
    fn current_port(&self) -> u16;

    async fn restart(&self) -> Result<(), ServerError>;
}

/// Probe backed by `lsof -nP -iTCP -sTCP:LISTEN`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LsofProbe;

#[async_trait]
impl ListenerProbe for LsofProbe {
    async fn is_listening(&self, port: u16) -> Result<bool, ProbeError> {
        let output = tokio::process::Command::new("lsof")
            .args(["-nP", "-iTCP", "-sTCP:LISTEN"])
            .output()
            .await
            .map_err(|source| ProbeError::Spawn {
                command: "lsof",
                source,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // lsof exits 1 when it matched nothing.
        if !output.status.success() && !(output.status.code() == Some(1) && stdout.trim().is_empty())
        {
            return Err(ProbeError::Failed {
                command: "lsof",
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(lsof_lists_port(&stdout, port))
    }
}

/// Whether any `NAME` column in lsof output ends in `:<port>`.
pub fn lsof_lists_port(output: &str, port: u16) -> bool {
    let port = port.to_string();
    output.lines().skip(1).any(|line| {
        line.split_whitespace()
            .filter_map(|token| token.rsplit_once(':'))
            .any(|(_, p)| p == port)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Healthy,
    Restarting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Healthy,
    Restarted,
    /// The probe itself failed; nothing was done.
    Inconclusive,
    RestartFailed,
}

pub struct Supervisor {
    probe: Arc<dyn ListenerProbe>,
    control: Arc<dyn ListenerControl>,
    state: Mutex<SupervisorState>,
}

impl Supervisor {
    pub fn new(probe: Arc<dyn ListenerProbe>, control: Arc<dyn ListenerControl>) -> Self {
        Self {
            probe,
            control,
            state: Mutex::new(SupervisorState::Healthy),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    /// Run one liveness check.
    pub async fn check_once(&self) -> CheckOutcome {
        if self.state() == SupervisorState::Restarting {
            return CheckOutcome::Inconclusive;
        }
        let port = self.control.current_port();
        match self.probe.is_listening(port).await {
            Ok(true) => CheckOutcome::Healthy,
            Ok(false) => {
                tracing::error!(target: "supervisor", port, "Socket not listening! Restarting...");
                *self.state.lock() = SupervisorState::Restarting;
                let result = self.control.restart().await;
                *self.state.lock() = SupervisorState::Healthy;
                match result {
                    Ok(()) => CheckOutcome::Restarted,
                    Err(e) => {
                        tracing::error!(target: "supervisor", error = %e, "restart failed");
                        CheckOutcome::RestartFailed
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    target: "supervisor",
                    error = %e,
                    "Unable to start socket status listener!"
                );
                CheckOutcome::Inconclusive
            }
        }
    }

    /// Check every `interval` until shutdown. The first check happens one
    /// interval after start.
    pub fn start(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check_once().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe(Result<bool, ()>);

    #[async_trait]
    impl ListenerProbe for FixedProbe {
        async fn is_listening(&self, _port: u16) -> Result<bool, ProbeError> {
            self.0.map_err(|_| ProbeError::Failed {
                command: "lsof",
                status: "exit status: 2".to_string(),
                stderr: "permission denied".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct CountingControl {
        restarts: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ListenerControl for CountingControl {
        fn current_port(&self) -> u16 {
            1234
        }

        async fn restart(&self) -> Result<(), ServerError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ServerError::Bind {
                    port: 1234,
                    source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
                });
            }
            Ok(())
        }
    }

    fn supervisor(probe: Result<bool, ()>, control: Arc<CountingControl>) -> Supervisor {
        Supervisor::new(Arc::new(FixedProbe(probe)), control)
    }

    #[tokio::test]
    async fn test_listening_port_left_alone() {
        let control = Arc::new(CountingControl::default());
        let sup = supervisor(Ok(true), control.clone());
        assert_eq!(sup.check_once().await, CheckOutcome::Healthy);
        assert_eq!(control.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dead_port_restarted() {
        let control = Arc::new(CountingControl::default());
        let sup = supervisor(Ok(false), control.clone());
        assert_eq!(sup.check_once().await, CheckOutcome::Restarted);
        assert_eq!(control.restarts.load(Ordering::SeqCst), 1);
        assert_eq!(sup.state(), SupervisorState::Healthy);
    }

    #[tokio::test]
    async fn test_probe_failure_never_restarts() {
        let control = Arc::new(CountingControl::default());
        let sup = supervisor(Err(()), control.clone());
        assert_eq!(sup.check_once().await, CheckOutcome::Inconclusive);
        assert_eq!(control.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_restart_reported() {
        let control = Arc::new(CountingControl {
            fail: true,
            ..CountingControl::default()
        });
        let sup = supervisor(Ok(false), control.clone());
        assert_eq!(sup.check_once().await, CheckOutcome::RestartFailed);
        assert_eq!(sup.state(), SupervisorState::Healthy);
    }

    #[test]
    fn test_lsof_parsing() {
        let output = "\
COMMAND   PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME
bridgegat 812 me     9u  IPv4 0x1234      0t0  TCP *:1234 (LISTEN)
postgres  90  me     7u  IPv6 0x5678      0t0  TCP [::1]:5432 (LISTEN)
";
        assert!(lsof_lists_port(output, 1234));
        assert!(lsof_lists_port(output, 5432));
        assert!(!lsof_lists_port(output, 123));
        assert!(!lsof_lists_port(output, 4));
        assert!(!lsof_lists_port("", 1234));
    }
}
