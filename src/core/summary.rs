//! Per-dial outcomes and the running aggregate the collector maintains.

use std::fmt;
use std::time::{Duration, Instant};

use crate::core::lease::ClientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialAction {
    Dora,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure => write!(f, "failed"),
        }
    }
}

/// Exactly one of these is produced per launched dial or release.
#[derive(Debug, Clone)]
pub struct DialResult {
    pub is_v6: bool,
    pub action: DialAction,
    pub outcome: Outcome,
    pub client_id: ClientId,
    pub start: Instant,
    pub finish: Instant,
}

/// Mean over the last `N` observed durations.
#[derive(Debug)]
pub struct MovingAverage<const N: usize> {
    window: [Duration; N],
    filled: usize,
    next: usize,
}

impl<const N: usize> MovingAverage<N> {
    pub fn new() -> Self {
        Self {
            window: [Duration::ZERO; N],
            filled: 0,
            next: 0,
        }
    }

    pub fn add(&mut self, sample: Duration) {
        self.window[self.next] = sample;
        self.next = (self.next + 1) % N;
        if self.filled < N {
            self.filled += 1;
        }
    }

    pub fn avg(&self) -> Duration {
        if self.filled == 0 {
            return Duration::ZERO;
        }
        let total: Duration = self.window[..self.filled].iter().sum();
        total / self.filled as u32
    }
}

impl<const N: usize> Default for MovingAverage<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate over everything the result channel delivered. `total_time`
/// spans from the earliest observed start to the latest observed finish.
pub struct ResultSummary {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub released: u64,
    pub less_than_second: u64,
    pub shortest: Option<Duration>,
    pub longest: Option<Duration>,
    pub total_time: Duration,
    pub avg_success_time: MovingAverage<5>,
    interval: Duration,
    begin: Option<Instant>,
    end: Option<Instant>,
}

impl ResultSummary {
    pub fn new(interval: Duration) -> Self {
        Self {
            total: 0,
            success: 0,
            failed: 0,
            released: 0,
            less_than_second: 0,
            shortest: None,
            longest: None,
            total_time: Duration::ZERO,
            avg_success_time: MovingAverage::new(),
            interval,
            begin: None,
            end: None,
        }
    }

    pub fn observe(&mut self, r: &DialResult) {
        let complete = r.finish.saturating_duration_since(r.start);
        self.begin = Some(match self.begin {
            Some(b) if b <= r.start => b,
            _ => r.start,
        });
        self.end = Some(match self.end {
            Some(e) if e >= r.finish => e,
            _ => r.finish,
        });

        self.total += 1;
        if r.action == DialAction::Release {
            self.released += 1;
        }
        match r.outcome {
            Outcome::Failure => self.failed += 1,
            Outcome::Success => {
                if r.action == DialAction::Dora {
                    self.success += 1;
                    self.avg_success_time.add(complete);
                    if complete < Duration::from_secs(1) {
                        self.less_than_second += 1;
                    }
                    self.longest = Some(self.longest.map_or(complete, |l| l.max(complete)));
                    self.shortest = Some(self.shortest.map_or(complete, |s| s.min(complete)));
                }
            }
        }
        if let (Some(b), Some(e)) = (self.begin, self.end) {
            self.total_time = e.saturating_duration_since(b);
        }
    }

    pub fn setup_rate(&self) -> f64 {
        if self.total_time.is_zero() {
            return 0.0;
        }
        self.success as f64 / self.total_time.as_secs_f64()
    }
}

impl fmt::Display for ResultSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Result Summary")?;
        writeln!(f, "total trans: {}", self.total)?;
        writeln!(f, "Success dial: {}", self.success)?;
        writeln!(f, "Success release: {}", self.released)?;
        writeln!(f, "Failed trans: {}", self.failed)?;
        writeln!(f, "Duration: {:?}", self.total_time)?;
        writeln!(f, "Interval: {:?}", self.interval)?;
        writeln!(f, "Setup rate: {:.2}/s", self.setup_rate())?;
        writeln!(
            f,
            "Fastest dial success: {:?}",
            self.shortest.unwrap_or(Duration::ZERO)
        )?;
        writeln!(f, "dial success within a second: {}", self.less_than_second)?;
        writeln!(
            f,
            "Slowest dial success: {:?}",
            self.longest.unwrap_or(Duration::ZERO)
        )?;
        writeln!(
            f,
            "Avg dial success time: {:?}",
            self.avg_success_time.avg()
        )
    }
}
