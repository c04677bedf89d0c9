//! Token-bucket admission control.
//!
//! Requests are admitted strictly in arrival order: a cheap request never
//! overtakes a costlier one queued before it. A pump task refills the bucket
//! every `delay` while requests are waiting and exits when the queue drains.
//!
//! A cost greater than the capacity can never be admitted and waits until the
//! throttle is [drained](Throttle::drain).

use std::collections::VecDeque;
use std::sync::Arc;
use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

use crate::completion::Completion;
use crate::config::ThrottleConfig;
use crate::core::{Result, StreamError};


struct Waiting {
    cost: f64,
    completion: Completion<()>,
}

struct ThrottleState {
    tokens: f64,
    last_refill: Instant,
    queue: VecDeque<Waiting>,
    pumping: bool,
}

impl ThrottleState {
    fn refill(&mut self, config: &ThrottleConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_rate).min(config.capacity);
        self.last_refill = now;
    }

    /// Pop every head of the queue the bucket can pay for.
    fn admit(&mut self) -> Vec<Completion<()>> {
        let mut granted = vec![];
        while let Some(head) = self.queue.front() {
            if self.tokens < head.cost {
                break;
            }
            self.tokens -= head.cost;
            if let Some(waiting) = self.queue.pop_front() {
                granted.push(waiting.completion);
            }
        }
        granted
    }
}

/// Shared handle to a token bucket. Clones pace against the same bucket.
#[derive(Clone)]
pub struct Throttle {
    config: Arc<ThrottleConfig>,
    state: Arc<Mutex<ThrottleState>>,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Result<Self> {
        config.validate()?;
        let state = ThrottleState {
            tokens: config.tokens.min(config.capacity),
            last_refill: Instant::now(),
            queue: VecDeque::new(),
            pumping: false,
        };
        Ok(Self { config: Arc::new(config), state: Arc::new(Mutex::new(state)) })
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Request admission for an operation of the given cost.
    ///
    /// Must be called from within a tokio runtime when the request cannot be
    /// admitted right away, since waiting requests are served by a pump task.
    ///
    /// # Arguments
    ///
    /// * `cost` - Tokens debited on admission.
    ///
    /// # Returns
    ///
    /// A [Completion](Completion) resolved on admission, or already rejected with
    /// [BacklogExceeded](StreamError::BacklogExceeded) if the queue is full.
    pub fn acquire(&self, cost: f64) -> Completion<()> {
        let completion = Completion::new();
        let (granted, start_pump) = {
            let mut state = self.state.lock();
            let queued = state.queue.len();
            if queued > self.config.max_capacity {
                warn!("Throttle backlog exceeded: {} queued, max {}", queued, self.config.max_capacity);
                return Completion::rejected(StreamError::BacklogExceeded {
                    queued,
                    max: self.config.max_capacity,
                });
            }
            state.queue.push_back(Waiting { cost, completion: completion.clone() });
            state.refill(&self.config);
            let granted = state.admit();
            let start_pump = !state.queue.is_empty() && !state.pumping;
            if start_pump {
                state.pumping = true;
            }
            (granted, start_pump)
        };
        for grant in granted {
            grant.resolve(());
        }
        if start_pump {
            self.start_pump();
        }
        completion
    }

    /// Wait for admission of an operation of the given cost.
    ///
    /// Dropping the returned future before admission withdraws the request, so
    /// an abandoned caller neither holds its place in the queue nor consumes tokens.
    pub async fn admit(&self, cost: f64) -> Result<()> {
        let completion = self.acquire(cost);
        let _withdraw = Withdraw { throttle: self, completion: &completion };
        completion.wait().await
    }

    /// Remove a waiting request from the queue, rejecting it with
    /// [ClosedByUser](StreamError::ClosedByUser).
    ///
    /// # Returns
    ///
    /// [false](false) if the request was not waiting, e.g. already admitted.
    pub fn cancel(&self, completion: &Completion<()>) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let position = state.queue.iter().position(|waiting| waiting.completion.ptr_eq(completion));
            position.and_then(|index| state.queue.remove(index))
        };
        match removed {
            Some(waiting) => {
                debug!("Throttle request of cost {} withdrawn", waiting.cost);
                waiting.completion.reject(StreamError::ClosedByUser);
                true
            }
            None => false,
        }
    }

    pub fn acquire_default(&self) -> Completion<()> {
        self.acquire(self.config.default_cost)
    }

    /// Tokens currently in the bucket, as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.state.lock().tokens
    }

    /// Number of requests waiting for admission.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Reject every waiting request. Used by the owner of the throttle on shutdown.
    ///
    /// # Returns
    ///
    /// The number of requests rejected.
    pub fn drain(&self, error: StreamError) -> usize {
        let drained: Vec<Waiting> = self.state.lock().queue.drain(..).collect();
        let count = drained.len();
        for waiting in drained {
            waiting.completion.reject(error.clone());
        }
        if count > 0 {
            debug!("Throttle drained {} waiting requests", count);
        }
        count
    }

    fn start_pump(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(Self::pump(Arc::clone(&self.config), Arc::clone(&self.state)));
            }
            Err(_) => {
                error!("Throttle used outside of a tokio runtime");
                self.state.lock().pumping = false;
                self.drain(StreamError::Config("throttle requires a tokio runtime".to_string()));
            }
        }
    }

    async fn pump(config: Arc<ThrottleConfig>, state: Arc<Mutex<ThrottleState>>) {
        loop {
            sleep(config.delay).await;
            let (granted, idle) = {
                let mut state = state.lock();
                state.refill(&config);
                let granted = state.admit();
                let idle = state.queue.is_empty();
                if idle {
                    state.pumping = false;
                }
                (granted, idle)
            };
            for grant in granted {
                grant.resolve(());
            }
            if idle {
                break;
            }
        }
    }
}

/// Withdraws a request still waiting for admission when dropped.
struct Withdraw<'a> {
    throttle: &'a Throttle,
    completion: &'a Completion<()>,
}

impl Drop for Withdraw<'_> {
    fn drop(&mut self) {
        if self.completion.is_pending() {
            self.throttle.cancel(self.completion);
        }
    }
}
