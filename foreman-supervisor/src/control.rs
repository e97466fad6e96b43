//! Control actions, OS signal handling, and the loop ticker
//!
//! OS signals never touch supervisor state directly. Listeners translate each signal into a
//! [`ControlAction`] and send it down the supervisor's control channel; the control loop
//! applies actions one at a time, on the same path as queued commands.
//!
//! ## Unix signals
//! - `SIGTERM`, `SIGINT`: terminate (a second one cancels the graceful wait)
//! - `SIGUSR1`: restart all pools
//! - `SIGUSR2`: pause all pools
//! - `SIGCONT`: continue all pools

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serialized state change requested outside the tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Drain every pool and exit with the given status
    Terminate(i32),
    /// Rolling restart of every pool
    Restart,
    /// Pause every pool
    Pause,
    /// Continue every pool
    Continue,
}

/// Cloneable sender side of a supervisor's control channel
#[derive(Debug, Clone)]
pub struct ControlHandle {
    actions: mpsc::UnboundedSender<ControlAction>,
    shutdown: CancellationToken,
}

impl ControlHandle {
    pub(crate) fn new(
        actions: mpsc::UnboundedSender<ControlAction>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { actions, shutdown }
    }

    /// Queue an action; returns false once the supervisor has stopped listening
    pub fn send(&self, action: ControlAction) -> bool {
        self.actions.send(action).is_ok()
    }

    /// Abandon any graceful wait and kill remaining workers
    pub fn force_shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// OS signals a supervisor listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsSignal {
    /// `SIGTERM`
    Terminate,
    /// `SIGINT` or Ctrl-C
    Interrupt,
    /// `SIGUSR1`
    User1,
    /// `SIGUSR2`
    User2,
    /// `SIGCONT`
    Continue,
}

/// What a received signal asks of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalResponse {
    /// Queue a control action
    Action(ControlAction),
    /// Stop waiting for workers and kill them
    ForceShutdown,
}

/// Translates a stream of OS signals into control actions
///
/// The first `SIGTERM`/`SIGINT` terminates with status 0; any later one forces shutdown.
#[derive(Debug, Default)]
pub struct SignalRouter {
    terminating: bool,
}

impl SignalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response to the next received signal
    pub fn route(&mut self, signal: OsSignal) -> SignalResponse {
        let action = match signal {
            OsSignal::Terminate | OsSignal::Interrupt => {
                if self.terminating {
                    return SignalResponse::ForceShutdown;
                }
                self.terminating = true;
                ControlAction::Terminate(0)
            }
            OsSignal::User1 => ControlAction::Restart,
            OsSignal::User2 => ControlAction::Pause,
            OsSignal::Continue => ControlAction::Continue,
        };
        SignalResponse::Action(action)
    }

    /// Route `signal` and deliver the response through `handle`
    ///
    /// Returns false once the supervisor has stopped listening.
    pub fn dispatch(&mut self, signal: OsSignal, handle: &ControlHandle) -> bool {
        match self.route(signal) {
            SignalResponse::ForceShutdown => {
                warn!("Second termination signal received; killing workers");
                handle.force_shutdown();
                true
            }
            SignalResponse::Action(action) => {
                if let ControlAction::Terminate(_) = action {
                    info!("Termination signal received");
                } else {
                    debug!("Signal {:?} received: {:?}", signal, action);
                }
                handle.send(action)
            }
        }
    }
}

/// Fixed-cadence ticker that stops ticking once its token is cancelled
#[derive(Debug)]
pub struct Ticker {
    interval: Interval,
    cancel: CancellationToken,
}

impl Ticker {
    /// Create a ticker; the first tick completes immediately
    pub fn new(period: Duration, cancel: CancellationToken) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, cancel }
    }

    /// Wait for the next tick; returns false if cancelled instead
    pub async fn tick(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = self.interval.tick() => true,
        }
    }
}

/// Spawn a task translating OS signals into control actions
///
/// The task ends when the supervisor's control channel closes.
#[cfg(unix)]
pub fn listen_for_signals(handle: ControlHandle) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;
    let mut sigcont = signal(SignalKind::from_raw(nix::libc::SIGCONT))?;

    Ok(tokio::spawn(async move {
        let mut router = SignalRouter::new();
        loop {
            let signal = tokio::select! {
                Some(()) = sigterm.recv() => OsSignal::Terminate,
                Some(()) = sigint.recv() => OsSignal::Interrupt,
                Some(()) = sigusr1.recv() => OsSignal::User1,
                Some(()) = sigusr2.recv() => OsSignal::User2,
                Some(()) = sigcont.recv() => OsSignal::Continue,
                else => break,
            };
            if !router.dispatch(signal, &handle) {
                break;
            }
        }
    }))
}

/// Spawn a task translating Ctrl-C into a terminate action
#[cfg(not(unix))]
pub fn listen_for_signals(handle: ControlHandle) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        let mut router = SignalRouter::new();
        while tokio::signal::ctrl_c().await.is_ok() {
            if !router.dispatch(OsSignal::Interrupt, &handle) {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops_when_cancelled() {
        let token = CancellationToken::new();
        let mut ticker = Ticker::new(Duration::from_secs(1), token.clone());

        assert!(ticker.tick().await);
        assert!(ticker.tick().await);

        token.cancel();
        assert!(!ticker.tick().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_keeps_cadence() {
        let mut ticker = Ticker::new(Duration::from_secs(1), CancellationToken::new());
        let start = tokio::time::Instant::now();

        ticker.tick().await;
        ticker.tick().await;
        ticker.tick().await;

        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_signals_map_to_actions() {
        let mut router = SignalRouter::new();

        assert_eq!(
            router.route(OsSignal::User1),
            SignalResponse::Action(ControlAction::Restart)
        );
        assert_eq!(
            router.route(OsSignal::User2),
            SignalResponse::Action(ControlAction::Pause)
        );
        assert_eq!(
            router.route(OsSignal::Continue),
            SignalResponse::Action(ControlAction::Continue)
        );
        assert_eq!(
            router.route(OsSignal::Terminate),
            SignalResponse::Action(ControlAction::Terminate(0))
        );
        assert_eq!(router.route(OsSignal::Terminate), SignalResponse::ForceShutdown);
        assert_eq!(router.route(OsSignal::Interrupt), SignalResponse::ForceShutdown);
    }

    #[test]
    fn test_interrupt_counts_as_first_termination() {
        let mut router = SignalRouter::new();

        assert_eq!(
            router.route(OsSignal::Interrupt),
            SignalResponse::Action(ControlAction::Terminate(0))
        );
        // Pause and continue still go through while draining
        assert_eq!(
            router.route(OsSignal::User2),
            SignalResponse::Action(ControlAction::Pause)
        );
        assert_eq!(router.route(OsSignal::Terminate), SignalResponse::ForceShutdown);
    }

    #[test]
    fn test_dispatch_sends_actions_then_forces_shutdown() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = ControlHandle::new(tx, shutdown.clone());
        let mut router = SignalRouter::new();

        assert!(router.dispatch(OsSignal::User2, &handle));
        assert!(router.dispatch(OsSignal::Terminate, &handle));
        assert!(!shutdown.is_cancelled());

        assert!(router.dispatch(OsSignal::Terminate, &handle));
        assert!(shutdown.is_cancelled());

        assert_eq!(rx.try_recv().unwrap(), ControlAction::Pause);
        assert_eq!(rx.try_recv().unwrap(), ControlAction::Terminate(0));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_reports_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ControlHandle::new(tx, CancellationToken::new());

        assert!(handle.send(ControlAction::Pause));
        drop(rx);
        assert!(!handle.send(ControlAction::Pause));
    }
}
