use chrono::{DateTime, Utc};
use concepts::time::ClockFn;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::info;

/// Clock shared between a test and the code under test. Only moves when the test
/// moves it.
#[derive(Clone, Debug)]
pub struct SimClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new(DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp"))
    }
}

impl SimClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(now)),
        }
    }

    /// Called by a test to move the time forward.
    pub fn move_time_forward(&self, duration: Duration) {
        let mut guard = self.current_time.lock().unwrap();
        let old = *guard;
        let new = old + duration;
        *guard = new;
        info!("Set clock from `{old}` to `{new}`");
    }

    pub fn move_time_to(&self, new: DateTime<Utc>) {
        let mut guard = self.current_time.lock().unwrap();
        let old = *guard;
        assert!(old <= new, "time cannot go back from `{old}` to `{new}`");
        *guard = new;
        info!("Set clock from `{old}` to `{new}`");
    }
}

impl ClockFn for SimClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current_time.lock().unwrap()
    }
}
