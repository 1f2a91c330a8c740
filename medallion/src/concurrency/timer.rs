//! Arm-on-demand timer for `tokio::select!` loops.

use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use tokio::time::{Sleep, sleep};

/// A future that stays pending until armed, then resolves after the configured duration.
///
/// The consumer uses it for the linger interval: the timer is armed when the first event
/// enters an empty buffer and disarmed when the buffer is flushed. It is `Unpin`, so it can be
/// polled by reference inside `select!`.
#[derive(Debug)]
pub struct DeferredTimer {
    deadline: Option<Pin<Box<Sleep>>>,
    duration: Duration,
}

impl DeferredTimer {
    pub fn new(duration: Duration) -> Self {
        Self {
            deadline: None,
            duration,
        }
    }

    /// Arms the timer, replacing any previous deadline.
    pub fn start(&mut self) {
        self.deadline = Some(Box::pin(sleep(self.duration)));
    }

    /// Arms the timer only if it is not armed yet.
    pub fn start_if_idle(&mut self) {
        if self.deadline.is_none() {
            self.start();
        }
    }

    /// Disarms the timer.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
}

impl Future for DeferredTimer {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let Some(deadline) = this.deadline.as_mut() else {
            return Poll::Pending;
        };

        ready!(deadline.as_mut().poll(cx));
        this.deadline = None;

        Poll::Ready(())
    }
}
