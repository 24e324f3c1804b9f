//! 📅 Merging frames: the calendar math that lets the merge algorithm stay blissfully frame-agnostic.
//!
//! 🎬 *[INT. ACCOUNTING DEPARTMENT, LAST DAY OF FEBRUARY, A LEAP YEAR]*
//! *["How many days are in this month?" someone asks. Nobody answers. Everybody checks.]*
//!
//! A [`MergingFrame`] is a granularity: DAY, MONTH or YEAR. A [`Period`] is one concrete
//! instance of a frame ("March 2024"). The roll-up walks these like a family tree:
//! YEAR's children are MONTHs, MONTH's children are DAYs, DAY is childless and at peace with it.
//!
//! 🧠 Knowledge graph:
//! - `periods(from, to)` → every period touched by the inclusive range, ascending, restartable
//! - `sub_period_names_of(period)` → index-name suffixes of the child frame's periods
//! - `name_of(period)` → `yyyy-MM-dd`, `yyyy-MMm`, `yyyyy`, bit-exact, aliases depend on it
//! - `period_from_index_name(...)` → the reverse trip, used to find the oldest existing index
//! - Ordering is by `duration()`: DAY < MONTH < YEAR. The scheduler merges in that order. 🦆

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

// 📏 Estimated unit durations, same numbers the calendar people agreed on after a long meeting.
const DAY_SECS: u64 = 86_400;
const YEAR_SECS: u64 = 31_556_952;
const MONTH_SECS: u64 = YEAR_SECS / 12;

/// 📅 A roll-up granularity. Closed set, exhaustively matched, no inheritance drama.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergingFrame {
    Day,
    Month,
    Year,
}

/// 🗓️ One concrete period of a frame, identified by its first day.
///
/// Only [`MergingFrame::period_of`] builds these, so `start` is always aligned to the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    frame: MergingFrame,
    start: NaiveDate,
}

impl MergingFrame {
    /// ⏱️ Estimated duration of one unit of this frame. The scheduler sorts frame groups by it.
    pub const fn duration(self) -> Duration {
        match self {
            Self::Day => Duration::from_secs(DAY_SECS),
            Self::Month => Duration::from_secs(MONTH_SECS),
            Self::Year => Duration::from_secs(YEAR_SECS),
        }
    }

    /// 👶 The frame one level down. DAY has no children. DAY is the children.
    pub const fn child_frame(self) -> Option<Self> {
        match self {
            Self::Day => None,
            Self::Month => Some(Self::Day),
            Self::Year => Some(Self::Month),
        }
    }

    /// 🎯 The period of this frame that contains `date`.
    pub fn period_of(self, date: NaiveDate) -> Period {
        let start = match self {
            Self::Day => date,
            Self::Month => date - Days::new(u64::from(date.day0())),
            Self::Year => date - Days::new(u64::from(date.ordinal0())),
        };
        Period { frame: self, start }
    }

    /// 🚪 First day of `period`, inclusive.
    pub fn start_of(self, period: &Period) -> NaiveDate {
        debug_assert_eq!(self, period.frame, "period belongs to a different frame");
        period.start
    }

    /// 🚪 Last day of `period`, inclusive.
    pub fn end_of(self, period: &Period) -> NaiveDate {
        debug_assert_eq!(self, period.frame, "period belongs to a different frame");
        period.end()
    }

    /// 🏷️ The index-name suffix of `period`. Must stay bit-exact across releases or every alias
    /// written by the previous version becomes a stranger.
    pub fn name_of(self, period: &Period) -> String {
        debug_assert_eq!(self, period.frame, "period belongs to a different frame");
        period.name()
    }

    /// 🔄 Every period touched by the inclusive range `[from, to]`, ascending.
    ///
    /// The iterator is `Clone`, so "restartable" is one `.clone()` away. An inverted range
    /// yields nothing, which is the correct amount of nothing.
    pub fn periods(self, from: NaiveDate, to: NaiveDate) -> Periods {
        let first = self.period_of(from);
        let last = self.period_of(to);
        Periods {
            next: (first.start <= last.start).then_some(first),
            last,
        }
    }

    /// 👶 Names of the child-frame periods that exactly partition `period`, chronological.
    ///
    /// 💀 Calling this on DAY is a programming error and comes back as `Err`.
    pub fn sub_period_names_of(self, period: &Period) -> Result<impl Iterator<Item = String> + use<>> {
        let Some(child) = self.child_frame() else {
            bail!(
                "💀 Asked {self} for its sub-periods. {self} is the bottom of the family tree. \
                 There is nothing below it but the void and a few leap seconds."
            );
        };
        Ok(child
            .periods(period.start, period.end())
            .map(|sub_period| sub_period.name()))
    }

    /// 🔍 Parse the period back out of `{prefix}-{entity}-{periodName}[-{suffix}]`.
    ///
    /// Works for aliases (no suffix) and for the physical indexes behind them (random suffix).
    /// Anything that does not match this frame's naming exactly returns `None`.
    pub fn period_from_index_name(self, base: &str, index_name: &str) -> Option<Period> {
        let rest = index_name.strip_prefix(base)?.strip_prefix('-')?;
        let name_len = match self {
            Self::Day => 10,
            Self::Month => 8,
            Self::Year => 5,
        };
        let head = rest.get(..name_len)?;
        let tail = rest.get(name_len..)?;
        if !(tail.is_empty() || tail.starts_with('-')) {
            return None;
        }
        let start = match self {
            Self::Day => NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()?,
            Self::Month => {
                let month = head.strip_suffix('m')?;
                NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d").ok()?
            }
            Self::Year => {
                let year = head.strip_suffix('y')?;
                if !year.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                NaiveDate::from_ymd_opt(year.parse().ok()?, 1, 1)?
            }
        };
        Some(self.period_of(start))
    }
}

impl PartialOrd for MergingFrame {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergingFrame {
    fn cmp(&self, other: &Self) -> Ordering {
        self.duration().cmp(&other.duration())
    }
}

impl fmt::Display for MergingFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Day => "DAY",
            Self::Month => "MONTH",
            Self::Year => "YEAR",
        };
        f.write_str(name)
    }
}

impl Period {
    pub const fn frame(&self) -> MergingFrame {
        self.frame
    }

    pub const fn start(&self) -> NaiveDate {
        self.start
    }

    /// 🚪 Last day of the period, inclusive.
    pub fn end(&self) -> NaiveDate {
        match self.frame {
            MergingFrame::Day => self.start,
            MergingFrame::Month => self.start + Months::new(1) - Days::new(1),
            MergingFrame::Year => self.start + Months::new(12) - Days::new(1),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end()
    }

    pub fn name(&self) -> String {
        match self.frame {
            MergingFrame::Day => self.start.format("%Y-%m-%d").to_string(),
            MergingFrame::Month => format!("{}m", self.start.format("%Y-%m")),
            MergingFrame::Year => format!("{}y", self.start.format("%Y")),
        }
    }

    fn next(&self) -> Self {
        Self {
            frame: self.frame,
            start: self.end() + Days::new(1),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.frame, self.name())
    }
}

/// 🔄 Lazy, finite, ascending walk over the periods of one frame.
#[derive(Debug, Clone)]
pub struct Periods {
    next: Option<Period>,
    last: Period,
}

impl Iterator for Periods {
    type Item = Period;

    fn next(&mut self) -> Option<Period> {
        let current = self.next?;
        self.next = (current.start < self.last.start).then(|| current.next());
        Some(current)
    }
}
