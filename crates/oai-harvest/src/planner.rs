//! Time window planning
//!
//! Decides, from the stored checkpoint and the current time, what the next
//! harvest cycle should request. Pure: no I/O, no clock access.
//!
//! | checkpoint                               | decision                   |
//! |------------------------------------------|----------------------------|
//! | none                                     | `First` (configured window)|
//! | clean, token present                     | `Resume(token)`            |
//! | clean, no token, both bounds, in the past| `Advance` by window width  |
//! | clean, no token, window would reach now  | `Wait`                     |
//! | clean, one or no bound                   | `Repeat`                   |
//! | not clean (failed attempt)               | `Repeat`                   |

use crate::checkpoint::Checkpoint;
use crate::source::HarvestRequest;
use chrono::{DateTime, TimeDelta, Utc};
use oai_common::datestamp;
use std::fmt;

/// Default margin kept between a window's upper bound and "now", in seconds.
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 15;

/// Configured initial window; either bound may be open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StaticWindow {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// What the next cycle should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    /// Never harvested: use the configured window
    First {
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    },
    /// Continue the interrupted result set
    Resume {
        token: String,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    },
    /// Move to the adjacent window of the same width
    Advance {
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    },
    /// Request the stored window again
    Repeat {
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    },
    /// Nothing to do until the next tick
    Wait,
}

impl PlanDecision {
    /// Build the first request of the cycle, `None` for [`PlanDecision::Wait`].
    pub fn to_request(&self, template: &HarvestRequest) -> Option<HarvestRequest> {
        let (from, until, token) = match self {
            PlanDecision::First { from, until } | PlanDecision::Repeat { from, until } => {
                (*from, *until, None)
            }
            PlanDecision::Resume { token, from, until } => (*from, *until, Some(token.clone())),
            PlanDecision::Advance { from, until } => (Some(*from), Some(*until), None),
            PlanDecision::Wait => return None,
        };

        Some(HarvestRequest {
            from,
            until,
            resumption_token: token,
            ..template.clone()
        })
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, PlanDecision::Wait)
    }
}

impl fmt::Display for PlanDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |ts: &Option<DateTime<Utc>>| {
            ts.as_ref()
                .map(datestamp::format)
                .unwrap_or_else(|| "*".to_string())
        };
        match self {
            PlanDecision::First { from, until } => {
                write!(f, "first [{}, {}]", bound(from), bound(until))
            }
            PlanDecision::Resume { token, .. } => write!(f, "resume {}", token),
            PlanDecision::Advance { from, until } => write!(
                f,
                "advance [{}, {}]",
                datestamp::format(from),
                datestamp::format(until)
            ),
            PlanDecision::Repeat { from, until } => {
                write!(f, "repeat [{}, {}]", bound(from), bound(until))
            }
            PlanDecision::Wait => write!(f, "wait"),
        }
    }
}

/// Plans the next request for one source
#[derive(Debug, Clone)]
pub struct TimeWindowPlanner {
    window: StaticWindow,
    clock_skew: TimeDelta,
}

impl TimeWindowPlanner {
    pub fn new(window: StaticWindow) -> Self {
        Self {
            window,
            clock_skew: TimeDelta::seconds(DEFAULT_CLOCK_SKEW_SECS),
        }
    }

    pub fn with_clock_skew(mut self, clock_skew: TimeDelta) -> Self {
        self.clock_skew = clock_skew;
        self
    }

    pub fn plan(&self, checkpoint: Option<&Checkpoint>, now: DateTime<Utc>) -> PlanDecision {
        let Some(cp) = checkpoint else {
            return PlanDecision::First {
                from: self.window.from,
                until: self.window.until,
            };
        };

        if !cp.is_clean() {
            return PlanDecision::Repeat {
                from: cp.last_from,
                until: cp.last_until,
            };
        }

        if let Some(ref token) = cp.resumption_token {
            return PlanDecision::Resume {
                token: token.clone(),
                from: cp.last_from,
                until: cp.last_until,
            };
        }

        let (Some(from), Some(until)) = (cp.last_from, cp.last_until) else {
            return PlanDecision::Repeat {
                from: cp.last_from,
                until: cp.last_until,
            };
        };

        let width = until - from;
        if width <= TimeDelta::zero() {
            return PlanDecision::Repeat {
                from: Some(from),
                until: Some(until),
            };
        }

        // Advance once the new upper bound is at least `clock_skew` behind now
        let next_until = until + width;
        if next_until <= now - self.clock_skew {
            PlanDecision::Advance {
                from: until,
                until: next_until,
            }
        } else {
            PlanDecision::Wait
        }
    }
}
