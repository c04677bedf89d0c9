//! Single-assignment completion cells and the race combinator.
//!
//! A [Completion](Completion) is shared by cloning: the connection manager keeps
//! one clone in its routing table and hands the other to the caller, who awaits it.

use std::future::{Future, IntoFuture};
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use parking_lot::Mutex;

use crate::core::{Result, StreamError};


type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

enum State<T> {
    Pending {
        wakers: Vec<Waker>,
        callbacks: Vec<Callback<T>>,
    },
    Done(Result<T>),
}

/// A value that will be resolved or rejected exactly once.
pub struct Completion<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self { state: Arc::clone(&self.state) }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending { wakers: vec![], callbacks: vec![] })),
        }
    }

    pub fn resolved(value: T) -> Self {
        Self { state: Arc::new(Mutex::new(State::Done(Ok(value)))) }
    }

    pub fn rejected(error: StreamError) -> Self {
        Self { state: Arc::new(Mutex::new(State::Done(Err(error)))) }
    }

    /// Complete with a value.
    ///
    /// # Returns
    ///
    /// [true](true) if this call moved the cell out of the pending state,
    /// [false](false) if it was already completed and the call had no effect.
    pub fn resolve(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Complete with an error. Same idempotency as [resolve](Completion::resolve).
    pub fn reject(&self, error: StreamError) -> bool {
        self.complete(Err(error))
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), State::Pending { .. })
    }

    /// The outcome, if already available, without waiting.
    pub fn peek(&self) -> Option<Result<T>> {
        match &*self.state.lock() {
            State::Pending { .. } => None,
            State::Done(outcome) => Some(outcome.clone()),
        }
    }

    /// Whether both handles refer to the same cell.
    pub fn ptr_eq(&self, other: &Completion<T>) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Future resolving to the outcome. Any number of waits may be in flight.
    pub fn wait(&self) -> Wait<T> {
        Wait { state: Arc::clone(&self.state) }
    }

    /// Register a callback run once, right after completion. If the cell is
    /// already complete the callback runs immediately on the calling task.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let mut state = self.state.lock();
        match &mut *state {
            State::Pending { callbacks, .. } => callbacks.push(Box::new(callback)),
            State::Done(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                callback(&outcome);
            }
        }
    }

    fn complete(&self, outcome: Result<T>) -> bool {
        let (wakers, callbacks) = {
            let mut state = self.state.lock();
            match mem::replace(&mut *state, State::Done(outcome.clone())) {
                State::Pending { wakers, callbacks } => (wakers, callbacks),
                previous @ State::Done(_) => {
                    *state = previous;
                    return false;
                }
            }
        };
        // lock released: callbacks may complete other cells
        for callback in callbacks {
            callback(&outcome);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

/// Future returned by [Completion::wait](Completion::wait).
pub struct Wait<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T: Clone> Future for Wait<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
            State::Done(outcome) => Poll::Ready(outcome.clone()),
        }
    }
}

impl<T: Clone> IntoFuture for Completion<T> {
    type Output = Result<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait()
    }
}

/// Complete with whichever input completes first.
///
/// A [ClosedByUser](StreamError::ClosedByUser) rejection does not win the race:
/// the combined cell keeps waiting for the other inputs, and is rejected with
/// [ClosedByUser](StreamError::ClosedByUser) only once every input was closed.
/// Later completions of the losers have no effect.
///
/// # Arguments
///
/// * `completions` - The competing cells. An empty list yields a closed cell.
pub fn race<T>(completions: Vec<Completion<T>>) -> Completion<T>
where
    T: Clone + Send + 'static,
{
    if completions.is_empty() {
        return Completion::rejected(StreamError::ClosedByUser);
    }
    let combined = Completion::new();
    let still_open = Arc::new(Mutex::new(completions.len()));
    for completion in completions {
        let combined = combined.clone();
        let still_open = Arc::clone(&still_open);
        completion.on_complete(move |outcome| match outcome {
            Ok(value) => {
                combined.resolve(value.clone());
            }
            Err(StreamError::ClosedByUser) => {
                let mut open = still_open.lock();
                *open -= 1;
                if *open == 0 {
                    drop(open);
                    combined.reject(StreamError::ClosedByUser);
                }
            }
            Err(error) => {
                combined.reject(error.clone());
            }
        });
    }
    combined
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_single_assignment() {
        let completion = Completion::new();
        assert!(completion.is_pending());
        assert!(completion.resolve(1));
        assert!(!completion.resolve(2));
        assert!(!completion.reject(StreamError::ClosedByUser));
        assert_eq!(completion.peek(), Some(Ok(1)));
    }

    #[test]
    fn test_clones_share_outcome() {
        let completion: Completion<u32> = Completion::new();
        let other = completion.clone();
        other.reject(StreamError::Network("reset".to_string()));
        assert_eq!(completion.peek(), Some(Err(StreamError::Network("reset".to_string()))));
    }

    #[tokio::test]
    async fn test_await_from_many_tasks() {
        let completion: Completion<String> = Completion::new();
        let first = tokio::spawn(completion.clone().into_future());
        let second = tokio::spawn(completion.wait());
        tokio::task::yield_now().await;
        completion.resolve("done".to_string());
        assert_eq!(first.await.unwrap(), Ok("done".to_string()));
        assert_eq!(second.await.unwrap(), Ok("done".to_string()));
    }

    #[test]
    fn test_on_complete_after_completion_runs_immediately() {
        let completion = Completion::resolved(5);
        let seen = Arc::new(Mutex::new(None));
        let seen_copy = Arc::clone(&seen);
        completion.on_complete(move |outcome| *seen_copy.lock() = Some(outcome.clone()));
        assert_eq!(*seen.lock(), Some(Ok(5)));
    }

    #[test]
    fn test_race_first_resolution_wins() {
        let f1 = Completion::new();
        let f2 = Completion::new();
        let combined = race(vec![f1.clone(), f2.clone()]);
        f2.resolve("second");
        f1.resolve("first");
        assert_eq!(combined.peek(), Some(Ok("second")));
    }

    #[test]
    fn test_race_first_rejection_wins() {
        let f1: Completion<u8> = Completion::new();
        let f2 = Completion::new();
        let combined = race(vec![f1.clone(), f2.clone()]);
        f1.reject(StreamError::Network("down".to_string()));
        f2.resolve(1);
        assert_eq!(combined.peek(), Some(Err(StreamError::Network("down".to_string()))));
    }

    #[test]
    fn test_race_closed_by_user_waits_for_siblings() {
        let f1 = Completion::new();
        let f2 = Completion::new();
        let combined = race(vec![f1.clone(), f2.clone()]);
        f1.reject(StreamError::ClosedByUser);
        assert!(combined.is_pending());
        f2.resolve(7);
        assert_eq!(combined.peek(), Some(Ok(7)));
    }

    #[test]
    fn test_race_all_closed_by_user() {
        let inputs: Vec<Completion<u8>> = (0..3).map(|_| Completion::new()).collect();
        let combined = race(inputs.clone());
        inputs[0].reject(StreamError::ClosedByUser);
        inputs[2].reject(StreamError::ClosedByUser);
        assert!(combined.is_pending());
        inputs[1].reject(StreamError::ClosedByUser);
        assert_eq!(combined.peek(), Some(Err(StreamError::ClosedByUser)));
    }

    #[test]
    fn test_race_with_completed_input() {
        let combined = race(vec![Completion::new(), Completion::resolved(3)]);
        assert_eq!(combined.peek(), Some(Ok(3)));
        let empty: Completion<u8> = race(vec![]);
        assert_eq!(empty.peek(), Some(Err(StreamError::ClosedByUser)));
    }
}
