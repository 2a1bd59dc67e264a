//! Time source and periodic timers.
//!
//! Every component that reasons about heartbeats or claim expiry reads the
//! time through a [`Clock`] so tests can move time forward explicitly
//! instead of sleeping past thresholds.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: DateTime<Utc>,
    offset_ms: AtomicI64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            offset_ms: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.origin + chrono::Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}

/// Run `tick` every `period` until `token` is cancelled.
///
/// The first tick fires immediately. Slow ticks delay the schedule rather than
/// bursting to catch up. Each tick runs in its own task; a tick that panics
/// is logged and the next one still fires.
pub async fn periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!(timer = name, "Timer stopped");
                break;
            }
            _ = interval.tick() => {
                match tokio::spawn(tick()).await {
                    Ok(()) => {}
                    Err(e) if e.is_panic() => {
                        tracing::error!(timer = name, error = %e, "Timer tick panicked");
                    }
                    Err(e) => tracing::warn!(timer = name, error = %e, "Timer tick aborted"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn manual_clock_only_moves_on_advance() {
        let clock = ManualClock::new();
        let start = clock.now();
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now() - start, chrono::Duration::seconds(90));
    }

    #[tokio::test]
    async fn periodic_stops_on_cancel() {
        let token = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));

        let task = {
            let token = token.clone();
            let count = count.clone();
            tokio::spawn(async move {
                periodic("test", Duration::from_millis(10), token, || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(55)).await;
        token.cancel();
        task.await.unwrap();

        let ticks = count.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected several ticks, got {}", ticks);
    }

    #[tokio::test]
    async fn panicking_tick_does_not_stop_the_timer() {
        let token = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));

        let task = {
            let token = token.clone();
            let count = count.clone();
            tokio::spawn(async move {
                periodic("test", Duration::from_millis(10), token, || {
                    let count = count.clone();
                    async move {
                        if count.fetch_add(1, Ordering::SeqCst) == 0 {
                            panic!("first tick blows up");
                        }
                    }
                })
                .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(80)).await;
        token.cancel();
        task.await.unwrap();

        let ticks = count.load(Ordering::SeqCst);
        assert!(ticks >= 3, "timer stopped after the panic, got {} ticks", ticks);
    }
}
