use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::status::Source;
use crate::tasks::Tasks;

/// At-most-one-in-flight flag shared by a poll loop and its fetches.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<AtomicBool>);

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot. `None` while a previous claim is still alive.
    pub fn try_begin(&self) -> Option<InFlightGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(self.0.clone()))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the slot when the fetch finishes, fails or is cancelled.
#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic fetch that skips a tick while the previous fetch is outstanding.
pub struct PollSource {
    source: Source,
    period: Duration,
    in_flight: InFlight,
}

impl PollSource {
    pub fn new(source: Source, period: Duration) -> Self {
        Self {
            source,
            period,
            in_flight: InFlight::new(),
        }
    }

    pub fn in_flight(&self) -> InFlight {
        self.in_flight.clone()
    }

    /// Run the loop on `tasks`. The first tick fires immediately.
    pub fn spawn<F, Fut>(self, tasks: &Tasks, mut fetch: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runner = tasks.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(source = ?self.source, period_ms = self.period.as_millis() as u64, "poll started");
            loop {
                ticker.tick().await;
                match self.in_flight.try_begin() {
                    Some(guard) => {
                        let fut = fetch();
                        runner.spawn(async move {
                            let _guard = guard;
                            fut.await;
                        });
                    }
                    None => trace!(source = ?self.source, "previous fetch in flight, tick skipped"),
                }
            }
        });
    }
}
