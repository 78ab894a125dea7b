//! Rolling-interval maximum gauge.
//!
//! A plain gauge set to a maximum would only ever grow; a histogram loses
//! the "largest thing seen recently" answer. [`IntervalMax`] tracks the
//! maximum observation per fixed interval (default 60 s) and reports the
//! completed interval's max through the `metrics` facade, so the gauge
//! answers "what was the biggest entry in the last minute" and decays once
//! large entries stop arriving.
//!
//! During the very first interval of a label pair there is no completed
//! interval yet; the gauge tracks the running max instead. If more than a
//! full interval passes without observations, the prior max is considered
//! expired and the window restarts.

use metrics::gauge;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Window {
    started: Instant,
    current_max: f64,
    last_max: Option<f64>,
}

/// Per-label-pair rolling maximum, reported as a gauge.
#[derive(Debug)]
pub struct IntervalMax {
    name: &'static str,
    interval: Duration,
    windows: Mutex<HashMap<(String, String), Window>>,
}

impl IntervalMax {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record an observation and refresh the gauge for this label pair.
    pub fn report(&self, value: f64, database: &str, status: &str) {
        self.report_at(Instant::now(), value, database, status);
    }

    fn report_at(&self, now: Instant, value: f64, database: &str, status: &str) {
        let reported = {
            let mut windows = match self.windows.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let window = windows
                .entry((database.to_string(), status.to_string()))
                .or_insert(Window {
                    started: now,
                    current_max: value,
                    last_max: None,
                });

            let elapsed = now.saturating_duration_since(window.started);
            if elapsed >= self.interval {
                // Roll over. A gap of a full idle interval (or more) means
                // the previous window's max has already aged out.
                window.last_max = if elapsed >= self.interval * 2 {
                    None
                } else {
                    Some(window.current_max)
                };
                window.started = now;
                window.current_max = value;
            } else if value > window.current_max {
                window.current_max = value;
            }

            window.last_max.unwrap_or(window.current_max)
        };

        gauge!(
            self.name,
            "database" => database.to_string(),
            "status" => status.to_string()
        )
        .set(reported);
    }

    /// The value the gauge currently reports for a label pair, if any
    /// observation has been made.
    pub fn value(&self, database: &str, status: &str) -> Option<f64> {
        let windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        windows
            .get(&(database.to_string(), status.to_string()))
            .map(|w| w.last_max.unwrap_or(w.current_max))
    }
}
