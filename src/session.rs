//! Stream session lifecycle
//!
//! A single counter-gated restart primitive. Every start of the receive loop
//! captures the current generation; the loop re-checks it at iteration
//! boundaries and exits once superseded. Because a generation check cannot
//! interrupt a blocked socket read, each session also carries a shutdown
//! signal whose sender lives here and is fired (or dropped) on stop/restart.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

#[derive(Default)]
struct State {
    generation: u64,
    /// Shutdown sender for the currently running receive loop, if any.
    /// Dropping it wakes the loop's `select!` just as well as sending.
    shutdown: Option<watch::Sender<bool>>,
}

/// Owns the generation counter and the live session's shutdown handle.
#[derive(Clone, Default)]
pub struct SessionController {
    state: Arc<Mutex<State>>,
}

/// The generation a receive loop was started under.
#[derive(Clone)]
pub struct GenerationToken {
    generation: u64,
    state: Arc<Mutex<State>>,
}

impl GenerationToken {
    /// False once a newer session has been started or stopped.
    pub fn is_current(&self) -> bool {
        let state = self.state.lock().expect("session lock poisoned");
        state.generation == self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session: supersede any running loop and hand out the new
    /// generation plus the shutdown receiver its loop must watch.
    pub fn begin(&self) -> (GenerationToken, watch::Receiver<bool>) {
        let mut state = self.state.lock().expect("session lock poisoned");
        state.generation += 1;
        let (tx, rx) = watch::channel(false);
        // Replacing the sender drops the previous one, unblocking the old
        // loop even if no further frames arrive.
        state.shutdown = Some(tx);
        tracing::debug!("Session generation advanced to {}", state.generation);
        (
            GenerationToken {
                generation: state.generation,
                state: self.state.clone(),
            },
            rx,
        )
    }

    /// Invalidate the running loop and fire its shutdown signal.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("session lock poisoned");
        state.generation += 1;
        if let Some(tx) = state.shutdown.take() {
            let _ = tx.send(true);
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.state.lock().expect("session lock poisoned").generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_supersedes_the_previous_token() {
        let controller = SessionController::new();
        let (first, _rx1) = controller.begin();
        assert!(first.is_current());

        let (second, _rx2) = controller.begin();
        assert!(!first.is_current());
        assert!(second.is_current());
        assert!(second.generation() > first.generation());
    }

    #[test]
    fn stop_invalidates_and_fires_shutdown() {
        let controller = SessionController::new();
        let (token, mut rx) = controller.begin();
        controller.stop();
        assert!(!token.is_current());
        // The loop's select sees either a changed value or a dropped sender.
        assert!(rx.has_changed().is_err() || *rx.borrow());
    }

    #[test]
    fn generations_are_strictly_increasing_across_stop_start() {
        let controller = SessionController::new();
        let (a, _rx) = controller.begin();
        controller.stop();
        let (b, _rx) = controller.begin();
        controller.stop();
        let (c, _rx) = controller.begin();
        assert!(a.generation() < b.generation());
        assert!(b.generation() < c.generation());
        assert_eq!(controller.current_generation(), c.generation());
    }

    #[test]
    fn restart_unblocks_a_waiting_loop() {
        let controller = SessionController::new();
        let (_token, mut rx) = controller.begin();
        let (_new_token, _new_rx) = controller.begin();
        // Old receiver observes its sender gone.
        assert!(rx.has_changed().is_err());
    }
}
