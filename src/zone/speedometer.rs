use crate::config::Throttle;
use std::{
    collections::VecDeque,
    sync::Mutex,
    time::Duration,
};
use tokio::time::Instant;

/// Per-zone token scheduler enforcing `N messages per unit` across all
/// concurrent workers of one process.
///
/// Admitted (and reserved) instants are kept in a sorted window; each
/// caller reserves the earliest instant at which one more admission keeps
/// the last-N bound satisfied, then sleeps until that instant. In any
/// rolling window of the configured unit the admitted count stays within
/// N + 1.
pub struct Speedometer {
    window: Mutex<VecDeque<Instant>>,
    limit: usize,
    unit: Duration,
}

impl Speedometer {
    pub fn new(throttle: Throttle) -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
            limit: throttle.messages.max(1) as usize,
            unit: throttle.window(),
        }
    }

    /// Sleep the caller until one more delivery may be admitted, then count
    /// it. Counts exactly once per call; retries within an attempt must not
    /// call this again.
    pub async fn gate(&self) {
        let admit_at = {
            let mut window = self.window.lock().expect("speedometer window");
            let now = Instant::now();
            while let Some(front) = window.front() {
                if *front + self.unit <= now {
                    window.pop_front();
                } else {
                    break;
                }
            }

            let admit_at = if window.len() < self.limit {
                now
            } else {
                window[window.len() - self.limit] + self.unit
            };
            window.push_back(admit_at);
            admit_at
        };

        if admit_at > Instant::now() {
            tokio::time::sleep_until(admit_at).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Throttle, ThrottleUnit};
    use std::sync::Arc;

    fn meter(messages: u32) -> Arc<Speedometer> {
        Arc::new(Speedometer::new(Throttle {
            messages,
            unit: ThrottleUnit::Second,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn admissions_respect_rolling_window() {
        let meter = meter(3);

        let mut instants = Vec::new();
        for _ in 0..9 {
            meter.gate().await;
            instants.push(Instant::now());
        }

        // every window of one second holds at most limit + 1 admissions
        for (i, start) in instants.iter().enumerate() {
            let in_window = instants[i..]
                .iter()
                .take_while(|t| **t < *start + Duration::from_secs(1))
                .count();
            assert!(in_window <= 4, "window starting at {i} admitted {in_window}");
        }

        // nine admissions at three per second cannot finish under two seconds
        let elapsed = instants[8].duration_since(instants[0]);
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_the_budget() {
        let meter = meter(2);
        let started = Instant::now();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let meter = Arc::clone(&meter);
            tasks.spawn(async move {
                meter.gate().await;
                Instant::now()
            });
        }

        let mut instants: Vec<Instant> = Vec::new();
        while let Some(done) = tasks.join_next().await {
            instants.push(done.unwrap());
        }
        instants.sort();

        // six admissions at two per second: the last one lands at >= 2s
        assert!(instants[5].duration_since(started) >= Duration::from_secs(2));
        // and the first two go through immediately
        assert!(instants[1].duration_since(started) < Duration::from_millis(10));
    }
}
