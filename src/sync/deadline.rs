//! Linked cancellation plus timeout.
//!
//! A [`CompositeDeadline`] ties together any number of [`Broadcast`]
//! signals and at most one expiry instant (the lowest timeout added wins).
//! Racing a future against it yields either the future's output or the
//! [`Trip`] that interrupted it.

use std::future::{pending, Future};
use std::time::Duration;

use futures_util::future::select_all;
use tokio::time::Instant;

use super::Broadcast;

/// The source that interrupted a deadline-bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trip {
    /// The caller's own cancellation signal fired.
    Cancelled,
    /// The connection went down.
    Disconnected,
    /// The owning resource was torn down.
    Disposed,
    /// The listener stopped accepting.
    Closed,
    /// The timeout elapsed.
    TimedOut,
}

/// Builder for [`CompositeDeadline`].
#[derive(Debug, Default)]
pub struct DeadlineBuilder {
    links: Vec<(Trip, Broadcast)>,
    timeout: Option<Duration>,
}

impl DeadlineBuilder {
    /// Interrupt the wait with `trip` when `signal` fires.
    pub fn link(mut self, trip: Trip, signal: &Broadcast) -> Self {
        self.links.push((trip, signal.clone()));
        self
    }

    /// Like [`link`](Self::link), for a signal the caller may not have.
    pub fn link_opt(self, trip: Trip, signal: Option<&Broadcast>) -> Self {
        match signal {
            Some(signal) => self.link(trip, signal),
            None => self,
        }
    }

    /// Add a timeout. When several are added the lowest one applies.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(match self.timeout {
            Some(current) => current.min(timeout),
            None => timeout,
        });
        self
    }

    /// Freeze the links and start the clock.
    pub fn build(self) -> CompositeDeadline {
        CompositeDeadline {
            links: self.links,
            expires_at: self
                .timeout
                .and_then(|timeout| Instant::now().checked_add(timeout)),
        }
    }
}

/// A set of linked signals and an optional expiry.
#[derive(Debug, Clone)]
pub struct CompositeDeadline {
    links: Vec<(Trip, Broadcast)>,
    expires_at: Option<Instant>,
}

impl CompositeDeadline {
    /// Start building a deadline.
    pub fn builder() -> DeadlineBuilder {
        DeadlineBuilder::default()
    }

    /// The first linked signal that has fired (in link order), else
    /// `TimedOut` if the expiry has passed.
    pub fn tripped(&self) -> Option<Trip> {
        self.links
            .iter()
            .find(|(_, signal)| signal.is_triggered())
            .map(|(trip, _)| *trip)
            .or_else(|| match self.expires_at {
                Some(at) if Instant::now() >= at => Some(Trip::TimedOut),
                _ => None,
            })
    }

    /// Fail fast if the deadline has already tripped.
    pub fn check(&self) -> Result<(), Trip> {
        match self.tripped() {
            Some(trip) => Err(trip),
            None => Ok(()),
        }
    }

    /// Drive `future` to completion unless the deadline trips first. A
    /// future that is already ready wins over an already tripped deadline.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, Trip> {
        let signals = async {
            let waits: Vec<_> = self
                .links
                .iter()
                .map(|(trip, signal)| {
                    let trip = *trip;
                    Box::pin(async move {
                        signal.triggered().await;
                        trip
                    })
                })
                .collect();

            if waits.is_empty() {
                pending::<Trip>().await
            } else {
                select_all(waits).await.0
            }
        };

        let expiry = async {
            match self.expires_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            output = future => Ok(output),
            trip = signals => Err(self.tripped().unwrap_or(trip)),
            _ = expiry => Err(self.tripped().unwrap_or(Trip::TimedOut)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    #[tokio::test]
    async fn completes_when_future_wins() {
        let cancel = Broadcast::new();
        let deadline = CompositeDeadline::builder()
            .link(Trip::Cancelled, &cancel)
            .timeout(Duration::from_secs(5))
            .build();

        assert_eq!(deadline.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn reports_linked_signal() {
        let cancel = Broadcast::new();
        let disconnect = Broadcast::new();
        let deadline = CompositeDeadline::builder()
            .link(Trip::Cancelled, &cancel)
            .link(Trip::Disconnected, &disconnect)
            .build();

        let trigger = disconnect.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });

        assert_eq!(deadline.run(pending::<()>()).await, Err(Trip::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn lowest_timeout_applies() {
        let deadline = CompositeDeadline::builder()
            .timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10))
            .build();

        let started = Instant::now();
        assert_eq!(deadline.run(pending::<()>()).await, Err(Trip::TimedOut));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn already_fired_link_trips_pending_work() {
        let cancel = Broadcast::new();
        cancel.trigger();
        let deadline = CompositeDeadline::builder()
            .link(Trip::Cancelled, &cancel)
            .build();

        assert_eq!(deadline.check(), Err(Trip::Cancelled));
        assert_eq!(deadline.run(pending::<()>()).await, Err(Trip::Cancelled));
        assert_eq!(deadline.run(async { 1 }).await, Ok(1));
    }

    #[tokio::test]
    async fn unlinked_deadline_never_trips() {
        let deadline = CompositeDeadline::builder().build();
        assert_eq!(deadline.tripped(), None);
        let waited = tokio::time::timeout(Duration::from_millis(20), deadline.run(pending::<()>())).await;
        assert!(waited.is_err());
    }
}
