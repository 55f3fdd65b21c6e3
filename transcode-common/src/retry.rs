use std::str::FromStr;
use std::time::Duration;

/// The ordered list of delays applied before successive retries of a
/// failed job. Retry N (1-based) waits for the table's Nth entry; any
/// retry beyond the table's length reuses the last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        assert!(!delays.is_empty(), "backoff schedule cannot be empty");
        Self { delays }
    }

    /// Delay before the given retry (1-based: the first retry of a job
    /// passes `1` and waits the first entry).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let index = (retry.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[index]
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(60),
        ])
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseBackoffScheduleError(String);

/// Parse a comma-separated list of delays in seconds, e.g. `10,30,60`.
impl FromStr for BackoffSchedule {
    type Err = ParseBackoffScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let delays = s
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ParseBackoffScheduleError(s.to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if delays.is_empty() {
            return Err(ParseBackoffScheduleError(s.to_owned()));
        }

        Ok(Self::new(delays))
    }
}
