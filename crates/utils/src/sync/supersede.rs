//! Race-cancellation for re-triggerable polls
//!
//! A poll races its real request against a supersession signal. `supersede()`
//! answers every waiting poll with the last known-good snapshot, so a caller
//! that started polling before a refresh gets a consistent (if stale) answer
//! instead of hanging or racing with the newer poll.

use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::oneshot;
use tracing::trace;

/// How a poll was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The real request finished first.
    Fresh(T),
    /// A newer refresh answered this poll with the last known-good snapshot.
    Superseded(T),
}

impl<T> PollOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            PollOutcome::Fresh(value) | PollOutcome::Superseded(value) => value,
        }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, PollOutcome::Superseded(_))
    }
}

#[derive(Debug)]
struct State<T> {
    generation: u64,
    pending: Vec<(u64, oneshot::Sender<T>)>,
    last_good: T,
    last_good_generation: u64,
}

/// Drops the poll's pending entry however the poll ends, including when the
/// caller abandons the future.
struct Registration<'a, T> {
    state: &'a Mutex<State<T>>,
    generation: u64,
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.state
            .lock()
            .pending
            .retain(|(pending, _)| *pending != generation);
    }
}

/// Per-resource supersession gate.
#[derive(Debug)]
pub struct Superseder<T> {
    state: Mutex<State<T>>,
}

impl<T: Clone + Send + 'static> Superseder<T> {
    /// `initial` is served to polls superseded before any poll completed.
    pub fn new(initial: T) -> Self {
        Self {
            state: Mutex::new(State {
                generation: 0,
                pending: Vec::new(),
                last_good: initial,
                last_good_generation: 0,
            }),
        }
    }

    /// Run `request`, unless a `supersede()` arrives first.
    ///
    /// A successful fresh result becomes the last known-good snapshot, unless
    /// a poll started later has already completed. Errors from `request` are
    /// returned as-is and leave the snapshot untouched.
    pub async fn poll<F, E>(&self, request: F) -> Result<PollOutcome<T>, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let (sender, receiver) = oneshot::channel();
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            let generation = state.generation;
            state.pending.push((generation, sender));
            generation
        };
        let _registration = Registration {
            state: &self.state,
            generation,
        };

        let superseded = async move {
            match receiver.await {
                Ok(snapshot) => snapshot,
                // Sender dropped without answering: only the real request can finish this poll
                Err(_) => std::future::pending().await,
            }
        };

        tokio::select! {
            snapshot = superseded => {
                trace!(generation, "poll superseded");
                Ok(PollOutcome::Superseded(snapshot))
            }
            result = request => {
                let value = result?;
                let mut state = self.state.lock();
                if generation > state.last_good_generation {
                    state.last_good = value.clone();
                    state.last_good_generation = generation;
                }
                Ok(PollOutcome::Fresh(value))
            }
        }
    }

    /// Answer every waiting poll with the last known-good snapshot.
    ///
    /// Returns how many polls were released.
    pub fn supersede(&self) -> usize {
        let (snapshot, pending) = {
            let mut state = self.state.lock();
            (state.last_good.clone(), std::mem::take(&mut state.pending))
        };

        let mut released = 0;
        for (_, sender) in pending {
            if sender.send(snapshot.clone()).is_ok() {
                released += 1;
            }
        }
        released
    }

    pub fn last_known_good(&self) -> T {
        self.state.lock().last_good.clone()
    }

    /// Number of polls currently waiting.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}
