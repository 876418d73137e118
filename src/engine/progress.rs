//! Opportunistic progress extraction from the child's output stream.
//!
//! Parsing is best-effort status display only: a line that matches neither
//! pattern is silently ignored and can never affect the run outcome.

use crate::model::Progress;
use regex::Regex;

pub(crate) struct ProgressScanner {
    day_re: Regex,
    date_re: Regex,
}

impl ProgressScanner {
    pub(crate) fn new() -> Self {
        // Both patterns are fixed; construction cannot fail.
        Self {
            day_re: Regex::new(r"Integration completed through\s+([0-9]+) days").unwrap(),
            date_re: Regex::new(r"Integration completed through\s+([\w\s]+)\s([0-9]+:)").unwrap(),
        }
    }

    /// Scan one output line. Day counts take precedence over dates.
    pub(crate) fn scan(&self, line: &str) -> Option<Progress> {
        let s = line.trim();
        if let Some(caps) = self.day_re.captures(s) {
            if let Ok(days) = caps[1].parse::<u64>() {
                return Some(Progress::Days(days));
            }
        }
        if let Some(caps) = self.date_re.captures(s) {
            return Some(Progress::Date(caps[1].trim().to_string()));
        }
        None
    }
}
