//! Termination signals received by the decorator and the relay state
//! machine that decides what happens to the child.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    Interrupt,
    Terminate,
}

impl TermSignal {
    #[cfg(unix)]
    pub fn as_nix(self) -> nix::sys::signal::Signal {
        match self {
            TermSignal::Interrupt => nix::sys::signal::Signal::SIGINT,
            TermSignal::Terminate => nix::sys::signal::Signal::SIGTERM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Armed,
    ShutdownRequested,
    Escalated,
}

/// What to do with the child in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    Forward(TermSignal),
    Kill,
    Ignore,
}

#[derive(Debug)]
pub struct SignalRelay {
    state: RelayState,
}

impl SignalRelay {
    pub fn new() -> Self {
        Self {
            state: RelayState::Armed,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// First signal is forwarded, the second escalates to a kill, anything
    /// after that is ignored while the child dies.
    pub fn on_signal(&mut self, signal: TermSignal) -> RelayAction {
        match self.state {
            RelayState::Armed => {
                self.state = RelayState::ShutdownRequested;
                RelayAction::Forward(signal)
            }
            RelayState::ShutdownRequested => {
                self.state = RelayState::Escalated;
                RelayAction::Kill
            }
            RelayState::Escalated => RelayAction::Ignore,
        }
    }
}

impl Default for SignalRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
#[error("could not install {signal} handler: {source}")]
pub struct ListenError {
    signal: &'static str,
    #[source]
    source: std::io::Error,
}

/// OS signal listener feeding a channel. Dropping it stops listening.
pub struct SignalListener {
    rx: mpsc::Receiver<TermSignal>,
    task: Option<JoinHandle<()>>,
}

impl SignalListener {
    /// Listen for SIGINT and SIGTERM.
    #[cfg(unix)]
    pub fn install() -> Result<Self, ListenError> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt()).map_err(|source| ListenError {
            signal: "SIGINT",
            source,
        })?;
        let mut terminate = signal(SignalKind::terminate()).map_err(|source| ListenError {
            signal: "SIGTERM",
            source,
        })?;

        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = interrupt.recv() => TermSignal::Interrupt,
                    Some(()) = terminate.recv() => TermSignal::Terminate,
                    else => break,
                };
                debug!("Received {:?}", received);
                if tx.send(received).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            rx,
            task: Some(task),
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> Result<Self, ListenError> {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(TermSignal::Interrupt).await.is_err() {
                    break;
                }
            }
        });
        Ok(Self {
            rx,
            task: Some(task),
        })
    }

    /// Build a listener over an arbitrary channel, used to inject signals.
    pub fn from_channel(rx: mpsc::Receiver<TermSignal>) -> Self {
        Self { rx, task: None }
    }

    pub async fn recv(&mut self) -> Option<TermSignal> {
        self.rx.recv().await
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
