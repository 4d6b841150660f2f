//! Launch of the wrapped process and supervision until it exits.

pub mod signals;

pub use signals::{
    ListenError, RelayAction, RelayState, SignalListener, SignalRelay, TermSignal,
};

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{error, info, info_span, warn, Instrument, Span};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no command given to wrap")]
    EmptyCommand,

    #[error("could not start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Signals(#[from] ListenError),
}

/// How the wrapped process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub status: ExitStatus,
    /// A second termination signal arrived and the child was killed.
    pub escalated: bool,
}

impl ChildExit {
    /// Exit code to propagate: the child's own code, or `128 + signal` when
    /// it was terminated by a signal.
    pub fn code(&self) -> i32 {
        if let Some(code) = self.status.code() {
            return code;
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = self.status.signal() {
                return 128 + signal;
            }
        }
        1
    }
}

/// Starts the wrapped program and relays termination signals to it.
pub struct ProcessCoordinator {
    command: Vec<String>,
    span: Span,
}

impl ProcessCoordinator {
    /// `command[0]` is the program, the rest are its arguments.
    pub fn new(command: Vec<String>) -> Result<Self, ProcessError> {
        let program = command.first().ok_or(ProcessError::EmptyCommand)?;
        let span = info_span!("wrapped", program = %program);
        Ok(Self { command, span })
    }

    fn program(&self) -> &str {
        &self.command[0]
    }

    /// Spawn with inherited stdio and the inherited environment overlaid by
    /// `env`.
    pub fn spawn(&self, env: &BTreeMap<String, String>) -> Result<Child, ProcessError> {
        let _entered = self.span.enter();
        info!("Starting command {}", self.program());

        let mut command = Command::new(self.program());
        command
            .args(&self.command[1..])
            .envs(env)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        command.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program().to_string(),
            source,
        })
    }

    /// Wait for `child` to exit while relaying signals from `listener`. The
    /// listener is dropped (and stops listening) once the child is gone.
    pub async fn supervise(
        &self,
        child: Child,
        listener: SignalListener,
    ) -> Result<ChildExit, ProcessError> {
        self.supervise_inner(child, listener)
            .instrument(self.span.clone())
            .await
    }

    async fn supervise_inner(
        &self,
        mut child: Child,
        mut listener: SignalListener,
    ) -> Result<ChildExit, ProcessError> {
        let mut relay = SignalRelay::new();
        info!("Waiting for command to finish...");

        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|source| ProcessError::Wait {
                        program: self.program().to_string(),
                        source,
                    })?;
                    drop(listener);
                    let exit = ChildExit {
                        status,
                        escalated: relay.state() == RelayState::Escalated,
                    };
                    if status.success() {
                        info!("Command finished");
                    } else {
                        info!("Command finished with error: {}", status);
                    }
                    return Ok(exit);
                }
                Some(signal) = listener.recv() => {
                    match relay.on_signal(signal) {
                        RelayAction::Forward(signal) => forward(&child, signal),
                        RelayAction::Kill => {
                            error!("Double shutdown triggered, killing the process");
                            if let Err(e) = child.start_kill() {
                                warn!("Could not kill wrapped process: {}", e);
                            }
                        }
                        RelayAction::Ignore => {}
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn forward(child: &Child, signal: TermSignal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    info!("Triggering shutdown on wrapped process with signal {:?}", signal);
    let pid = Pid::from_raw(pid as i32);
    if let Err(e) = kill(pid, signal.as_nix()) {
        warn!("Could not forward {:?} to pid {}: {}", signal, pid, e);
    }
}

#[cfg(not(unix))]
fn forward(_child: &Child, signal: TermSignal) {
    warn!("Signal forwarding is not supported on this platform, ignoring {:?}", signal);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn sh(script: &str) -> ProcessCoordinator {
        ProcessCoordinator::new(vec!["/bin/sh".into(), "-c".into(), script.into()]).unwrap()
    }

    fn quiet_listener() -> (mpsc::Sender<TermSignal>, SignalListener) {
        let (tx, rx) = mpsc::channel(4);
        (tx, SignalListener::from_channel(rx))
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            ProcessCoordinator::new(vec![]),
            Err(ProcessError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let coordinator = sh("exit 3");
        let child = coordinator.spawn(&BTreeMap::new()).unwrap();
        let (_tx, listener) = quiet_listener();
        let exit = coordinator.supervise(child, listener).await.unwrap();
        assert_eq!(exit.code(), 3);
        assert!(!exit.escalated);
    }

    #[tokio::test]
    async fn resolved_env_overrides_inherited() {
        std::env::set_var("POD_DECORATOR_TEST_INHERITED", "base");
        let coordinator = sh(
            r#"test "$POD_DECORATOR_TEST_INHERITED" = override && test "$EXTRA" = "two words""#,
        );
        let env: BTreeMap<String, String> = [
            ("POD_DECORATOR_TEST_INHERITED", "override"),
            ("EXTRA", "two words"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let child = coordinator.spawn(&env).unwrap();
        let (_tx, listener) = quiet_listener();
        let exit = coordinator.supervise(child, listener).await.unwrap();
        assert_eq!(exit.code(), 0);
    }

    #[tokio::test]
    async fn arguments_are_passed_through() {
        let coordinator = ProcessCoordinator::new(vec![
            "/bin/sh".into(),
            "-c".into(),
            r#"test "$0" = first && test "$1" = second"#.into(),
            "first".into(),
            "second".into(),
        ])
        .unwrap();
        let child = coordinator.spawn(&BTreeMap::new()).unwrap();
        let (_tx, listener) = quiet_listener();
        assert_eq!(coordinator.supervise(child, listener).await.unwrap().code(), 0);
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let coordinator =
            ProcessCoordinator::new(vec!["/nonexistent/pod-decorator-test".into()]).unwrap();
        assert!(matches!(
            coordinator.spawn(&BTreeMap::new()),
            Err(ProcessError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn first_signal_is_forwarded() {
        let coordinator = ProcessCoordinator::new(vec!["sleep".into(), "30".into()]).unwrap();
        let child = coordinator.spawn(&BTreeMap::new()).unwrap();
        let (tx, listener) = quiet_listener();
        tx.send(TermSignal::Terminate).await.unwrap();

        let exit = tokio::time::timeout(
            Duration::from_secs(10),
            coordinator.supervise(child, listener),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(exit.code(), 128 + 15);
        assert!(!exit.escalated);
    }

    #[tokio::test]
    async fn second_signal_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let coordinator = sh(&format!(
            "trap '' INT TERM; touch {}; while :; do sleep 1; done",
            ready.display()
        ));
        let child = coordinator.spawn(&BTreeMap::new()).unwrap();

        for _ in 0..100 {
            if ready.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(ready.exists(), "child never installed its trap");

        let (tx, listener) = quiet_listener();
        tx.send(TermSignal::Interrupt).await.unwrap();
        tx.send(TermSignal::Interrupt).await.unwrap();

        let exit = tokio::time::timeout(
            Duration::from_secs(10),
            coordinator.supervise(child, listener),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(exit.escalated);
        assert_eq!(exit.code(), 128 + 9);
    }
}
