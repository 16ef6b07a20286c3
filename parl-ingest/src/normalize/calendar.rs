//! Sitting calendar: which parliament and session a date belongs to
//!
//! Built from debates already in the store, so records that carry only a
//! date (speeches, meetings, votes from some sources) can still be keyed.

use chrono::NaiveDate;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionSpan {
    jurisdiction: String,
    parliament: u32,
    session: u32,
    first: NaiveDate,
    last: NaiveDate,
}

/// Mapping from (jurisdiction, date) to (parliament, session)
#[derive(Debug, Clone, Default)]
pub struct SittingCalendar {
    sittings: HashMap<(String, NaiveDate), (u32, u32)>,
    spans: Vec<SessionSpan>,
}

impl SittingCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `jurisdiction` sat on `date` during `parliament`/`session`
    pub fn insert(&mut self, jurisdiction: &str, date: NaiveDate, parliament: u32, session: u32) {
        self.sittings
            .insert((jurisdiction.to_string(), date), (parliament, session));

        match self.spans.iter_mut().find(|s| {
            s.jurisdiction == jurisdiction && s.parliament == parliament && s.session == session
        }) {
            Some(span) => {
                span.first = span.first.min(date);
                span.last = span.last.max(date);
            }
            None => self.spans.push(SessionSpan {
                jurisdiction: jurisdiction.to_string(),
                parliament,
                session,
                first: date,
                last: date,
            }),
        }
    }

    /// Parliament and session for a date
    ///
    /// An exact sitting wins. Otherwise the date must fall inside exactly one
    /// known session's first..last sitting range.
    pub fn lookup(&self, jurisdiction: &str, date: NaiveDate) -> Option<(u32, u32)> {
        if let Some(found) = self.sittings.get(&(jurisdiction.to_string(), date)) {
            return Some(*found);
        }

        let mut candidates = self
            .spans
            .iter()
            .filter(|s| s.jurisdiction == jurisdiction && s.first <= date && date <= s.last);
        match (candidates.next(), candidates.next()) {
            (Some(span), None) => Some((span.parliament, span.session)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.sittings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sittings.is_empty()
    }
}
