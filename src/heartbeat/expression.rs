//! Heartbeat update expressions.
//!
//! A small schedule language: `sec(*%N)`, `min(*%N)` or `hour(*%N)` fires every `N`
//! units. An optional `~P` suffix adds up to `P` percent of random jitter to each
//! interval so that many processes do not renew their leases in lockstep.

use std::{str::FromStr, time::Duration};

use pom::utf8::{end, one_of, seq, sym, Parser};
use rand::Rng;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateTime {
    interval: Duration,
    jitter_percent: u32,
}

impl UpdateTime {
    pub fn new(interval: Duration, jitter_percent: u32) -> Self {
        Self {
            interval,
            jitter_percent,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Longest possible wait between two renewals.
    pub fn max_interval(&self) -> Duration {
        self.interval + self.interval * self.jitter_percent / 100
    }

    pub fn next_delay(&self, rng: &mut impl Rng) -> Duration {
        let max_jitter = self.interval * self.jitter_percent / 100;
        if max_jitter.is_zero() {
            return self.interval;
        }
        self.interval + max_jitter.mul_f64(rng.gen_range(0.0..=1.0))
    }
}

fn number<'a>() -> Parser<'a, u64> {
    one_of("0123456789")
        .repeat(1..)
        .collect()
        .convert(|s: &str| s.parse::<u64>())
        .name("number")
}

fn unit<'a>() -> Parser<'a, Duration> {
    let sec = seq("sec").map(|_| Duration::from_secs(1));
    let min = seq("min").map(|_| Duration::from_secs(60));
    let hour = seq("hour").map(|_| Duration::from_secs(60 * 60));

    (sec | min | hour).name("unit")
}

fn every<'a>() -> Parser<'a, Duration> {
    let body = sym('(') * sym('*') * sym('%') * number() - sym(')');

    (unit() + body)
        .map(|(unit, n)| unit * n as u32)
        .name("every")
}

fn jitter<'a>() -> Parser<'a, u32> {
    (sym('~') * number()).map(|p| p as u32).name("jitter")
}

fn expression<'a>() -> Parser<'a, UpdateTime> {
    (every() + jitter().opt() - end())
        .map(|(interval, jitter)| UpdateTime::new(interval, jitter.unwrap_or(0)))
        .name("update time")
}

impl FromStr for UpdateTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = expression()
            .parse(s.trim().as_bytes())
            .map_err(|e| Error::invalid_argument(format!("update time {s:?}: {e}")))?;

        if parsed.interval.is_zero() {
            return Err(Error::invalid_argument(format!(
                "update time {s:?} has a zero interval"
            )));
        }
        if parsed.jitter_percent > 100 {
            return Err(Error::invalid_argument(format!(
                "update time {s:?} jitter must be at most 100 percent"
            )));
        }
        Ok(parsed)
    }
}
