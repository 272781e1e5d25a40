use std::future::Future;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Interrupt,
    Terminate,
    Quit,
}

/// Process-level state machine:
/// `Starting -> Running -> ShuttingDown -> Stopped`, with a direct
/// `Starting -> Stopped` edge when start-up fails.
///
/// Any number of shutdown triggers may fire, from any task. They all cancel
/// the same token, and only the first caller of [`Lifecycle::teardown`]
/// actually runs its teardown.
#[derive(Clone, Debug)]
pub struct Lifecycle {
    state: Arc<watch::Sender<LifecycleState>>,
    cancel: CancellationToken,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Lifecycle {
            state: Arc::new(state),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            cancel: self.cancel.clone(),
        }
    }

    pub fn mark_running(&self) -> bool {
        self.transition(LifecycleState::Starting, LifecycleState::Running)
    }

    /// Start-up failed or was cancelled; nothing is running that needs a
    /// teardown sequence.
    pub fn fail_startup(&self) -> bool {
        self.transition(LifecycleState::Starting, LifecycleState::Stopped)
    }

    pub async fn wait_for_shutdown(&self) {
        self.cancel.cancelled().await;
    }

    /// Moves `Running -> ShuttingDown`, runs `teardown`, then moves to
    /// `Stopped`. Returns `false` without running anything if another caller
    /// got there first; in that case it waits until that caller is done.
    pub async fn teardown<F>(&self, teardown: F) -> bool
    where
        F: Future<Output = ()>,
    {
        self.cancel.cancel();

        if !self.transition(LifecycleState::Running, LifecycleState::ShuttingDown) {
            if self.state() == LifecycleState::Starting {
                return false;
            }
            let mut rx = self.state.subscribe();
            let _ = rx.wait_for(|state| *state == LifecycleState::Stopped).await;
            return false;
        }

        info!("Shutting down");
        teardown.await;
        self.state.send_replace(LifecycleState::Stopped);
        info!("Stopped");
        true
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            debug!("Lifecycle {:?} -> {:?}", from, to);
            *state = to;
            true
        })
    }
}

/// Cloneable trigger for an orderly shutdown, handed to the signal listener
/// and to anything offering a quit action.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    cancel: CancellationToken,
}

impl ShutdownHandle {
    pub fn trigger(&self, trigger: ShutdownTrigger) {
        if self.cancel.is_cancelled() {
            debug!("Shutdown already requested, ignoring {:?}", trigger);
            return;
        }
        info!("Shutdown requested ({:?})", trigger);
        self.cancel.cancel();
    }
}

/// Forwards the first termination signal to `handle`.
pub fn spawn_signal_listener(handle: ShutdownHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        match termination_signal().await {
            Ok(trigger) => handle.trigger(trigger),
            Err(err) => error!("Error listening for termination signals: {:?}", err),
        }
    })
}

/// Resolves on the first SIGINT, or on unix SIGTERM or SIGQUIT. SIGQUIT is
/// the terminal's quit key and counts as the user asking to quit.
pub async fn termination_signal() -> std::io::Result<ShutdownTrigger> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut quit = signal(SignalKind::quit())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| ShutdownTrigger::Interrupt),
            _ = terminate.recv() => Ok(ShutdownTrigger::Terminate),
            _ = quit.recv() => Ok(ShutdownTrigger::Quit),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(ShutdownTrigger::Interrupt)
    }
}
