use chrono::{DateTime, SubsecRound as _, Utc};

pub trait ClockFn: Send + Sync + Clone + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock truncated to milliseconds, the precision kept by the stores.
#[derive(Clone, Debug)]
pub struct Now;

impl ClockFn for Now {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(3)
    }
}

