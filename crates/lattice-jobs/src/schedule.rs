use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use lattice_core::error::{LatticeError, Result};

/// Shortest period a recurring schedule fires at; smaller periods are raised
/// to it.
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

/// When a scheduled callback fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fire a single time after the delay.
    Once(Duration),
    /// Fire repeatedly, the first time one period from now. Periods below
    /// [`MIN_PERIOD`] are clamped.
    Every(Duration),
    /// Fire on a cron expression (seconds field included), evaluated in UTC.
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    pub fn cron(expr: &str) -> Result<Self> {
        let schedule = cron::Schedule::from_str(expr)
            .map_err(|e| LatticeError::Config(format!("invalid cron expression '{}': {}", expr, e)))?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Once(_))
    }

    /// First due time when the schedule is registered at `now`.
    pub fn first_due(&self, now: Instant) -> Option<Instant> {
        match self {
            Self::Once(delay) => Some(now + *delay),
            Self::Every(period) => Some(now + (*period).max(MIN_PERIOD)),
            Self::Cron(schedule) => next_cron(schedule, now),
        }
    }

    /// Due time following a firing at `now`; `None` once exhausted.
    pub fn next_due(&self, now: Instant) -> Option<Instant> {
        match self {
            Self::Once(_) => None,
            Self::Every(period) => Some(now + (*period).max(MIN_PERIOD)),
            Self::Cron(schedule) => next_cron(schedule, now),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Once(delay) if delay.is_zero() => "once".to_string(),
            Self::Once(delay) => format!("once in {}s", delay.as_secs()),
            Self::Every(period) => format!("every {}s", (*period).max(MIN_PERIOD).as_secs()),
            Self::Cron(schedule) => format!("cron {}", schedule),
        }
    }
}

fn next_cron(schedule: &cron::Schedule, now: Instant) -> Option<Instant> {
    let wall = Utc::now();
    let next = schedule.after(&wall).next()?;
    let delay = (next - wall).to_std().unwrap_or(Duration::ZERO);
    Some(now + delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_fires_a_single_time() {
        let now = Instant::now();
        let schedule = Schedule::Once(Duration::from_secs(5));
        assert_eq!(schedule.first_due(now), Some(now + Duration::from_secs(5)));
        assert_eq!(schedule.next_due(now), None);
        assert!(!schedule.is_recurring());
    }

    #[test]
    fn every_repeats() {
        let now = Instant::now();
        let schedule = Schedule::Every(Duration::from_secs(30));
        assert_eq!(schedule.first_due(now), Some(now + Duration::from_secs(30)));
        assert_eq!(schedule.next_due(now), Some(now + Duration::from_secs(30)));
        assert!(schedule.is_recurring());
        assert_eq!(schedule.describe(), "every 30s");
    }

    #[test]
    fn zero_period_is_clamped() {
        let now = Instant::now();
        let schedule = Schedule::Every(Duration::ZERO);
        assert_eq!(schedule.first_due(now), Some(now + MIN_PERIOD));
        assert_eq!(schedule.next_due(now), Some(now + MIN_PERIOD));
        assert_eq!(schedule.describe(), "every 1s");
    }

    #[test]
    fn cron_due_within_its_period() {
        let now = Instant::now();
        let schedule = Schedule::cron("0 * * * * *").unwrap();
        let due = schedule.first_due(now).unwrap();
        assert!(due >= now);
        assert!(due <= now + Duration::from_secs(60));
        assert!(schedule.is_recurring());
    }

    #[test]
    fn bad_cron_is_a_config_error() {
        assert!(matches!(
            Schedule::cron("every tuesday"),
            Err(LatticeError::Config(_))
        ));
    }
}
