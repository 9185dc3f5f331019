//! Disabled day/time windows for metric gathering.
//!
//! Sources: metric attributes carry defaults; host config entries that
//! reference the metric override them entirely. A window matches iff
//! (day list empty OR current day listed) AND (time list empty OR
//! current time inside some span).

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc};
use chrono_tz::Tz;
use pgsentry_common::types::{HostConfigAttrs, MetricVersionDef, PerMetricDisabledTimes};
use std::collections::HashSet;
use std::str::FromStr;

/// Parse a cron-style day list ("0,2-4"). 0 and 7 both mean Sunday.
pub fn parse_days(days: &str) -> HashSet<u32> {
    let mut set = HashSet::new();
    for part in days.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            match (start.trim().parse::<u32>(), end.trim().parse::<u32>()) {
                (Ok(start), Ok(end)) => {
                    for day in start..=end.min(7) {
                        set.insert(day);
                    }
                }
                _ => {
                    tracing::warn!(spec = %part, "ignoring invalid day range specification");
                }
            }
        } else {
            match part.parse::<u32>() {
                Ok(day) if day <= 7 => {
                    set.insert(day);
                }
                _ => {
                    tracing::warn!(spec = %part, "ignoring invalid day specification");
                }
            }
        }
    }
    if set.contains(&7) {
        set.insert(0);
    }
    set
}

fn day_matches(now: DateTime<Utc>, days: &str) -> bool {
    if days.is_empty() {
        return false;
    }
    parse_days(days).contains(&now.weekday().num_days_from_sunday())
}

enum SpanZone {
    Utc,
    Fixed(FixedOffset),
    Named(Tz),
}

struct TimeSpan {
    start: NaiveTime,
    end: NaiveTime,
    zone: SpanZone,
}

impl TimeSpan {
    /// Parse "HH:MM-HH:MM \[TZ\]" where TZ is an alpha zone name or a
    /// numeric offset like +0200. No zone means UTC.
    fn parse(spec: &str) -> Option<TimeSpan> {
        let spec = spec.trim();
        let start = NaiveTime::parse_from_str(spec.get(0..5)?, "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(spec.get(6..11)?, "%H:%M").ok()?;
        let tz = spec.get(11..).unwrap_or("").trim();

        let zone = if tz.is_empty() {
            SpanZone::Utc
        } else if tz.chars().all(|c| c.is_ascii_alphabetic()) {
            SpanZone::Named(Tz::from_str(tz).ok()?)
        } else {
            let offset = parse_numeric_offset(tz)?;
            SpanZone::Fixed(offset)
        };
        Some(TimeSpan { start, end, zone })
    }

    /// Whether `now` falls inside the span, in the span's own zone.
    /// Spans with end <= start wrap past midnight and match both sides
    /// of the boundary.
    fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = match &self.zone {
            SpanZone::Utc => now.time(),
            SpanZone::Fixed(offset) => now.with_timezone(offset).time(),
            SpanZone::Named(tz) => now.with_timezone(tz).time(),
        };
        if self.end <= self.start {
            local > self.start || local < self.end
        } else {
            local > self.start && local < self.end
        }
    }
}

fn parse_numeric_offset(tz: &str) -> Option<FixedOffset> {
    let (sign, digits) = match tz.as_bytes().first()? {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => (1, tz),
    };
    if digits.len() != 4 {
        return None;
    }
    let hours: i32 = digits[0..2].parse().ok()?;
    let minutes: i32 = digits[2..4].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn time_matches(now: DateTime<Utc>, spans: &[String], metric: &str) -> bool {
    spans.iter().any(|spec| match TimeSpan::parse(spec) {
        Some(span) => span.contains(now),
        None => {
            tracing::warn!(metric, span = %spec, "ignoring invalid disabled time range, check config");
            false
        }
    })
}

fn window_matches(now: DateTime<Utc>, days: &str, times: &[String], metric: &str) -> bool {
    if days.is_empty() && times.is_empty() {
        return false;
    }
    let day_ok = days.is_empty() || day_matches(now, days);
    let time_ok = times.is_empty() || time_matches(now, times, metric);
    day_ok && time_ok
}

/// Whether gathering of `metric` is disabled at `now`, considering both
/// the definition's own windows and the host-config overrides. Host
/// config takes precedence when any of its entries references the
/// metric.
pub fn is_metric_disabled(
    now: DateTime<Utc>,
    metric: &str,
    def: &MetricVersionDef,
    host_config: &HostConfigAttrs,
) -> bool {
    let host_entries: Vec<&PerMetricDisabledTimes> = host_config
        .per_metric_disabled_intervals
        .iter()
        .filter(|entry| entry.metrics.iter().any(|m| m == metric))
        .collect();

    if !host_entries.is_empty() {
        return host_entries.iter().any(|entry| {
            window_matches(now, &entry.disabled_days, &entry.disabled_times, metric)
        });
    }

    window_matches(
        now,
        &def.metric_attrs.disabled_days,
        &def.metric_attrs.disabled_times,
        metric,
    )
}
