use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One geographic point the pipeline fetches weather for. Identity is the name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityTarget {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl CityTarget {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
        }
    }
}

/// A request for one city. Variable order decides the column order of the dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub target: CityTarget,
    pub variables: Vec<String>,
}

/// Half-open range of sample timestamps: `start, start + interval, ...` while `< end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval: Duration,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, interval: Duration) -> Self {
        Self {
            start,
            end,
            interval,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.end > self.start && self.interval > Duration::zero()
    }

    /// Number of timestamps in the range, `ceil((end - start) / interval)`.
    pub fn count(&self) -> usize {
        if !self.is_valid() {
            return 0;
        }

        let (Ok(span), Ok(step)) = ((self.end - self.start).to_std(), self.interval.to_std())
        else {
            return 0;
        };

        usize::try_from(span.as_nanos().div_ceil(step.as_nanos())).unwrap_or(usize::MAX)
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let valid = self.is_valid();
        std::iter::successors(Some(self.start), move |ts| ts.checked_add_signed(self.interval))
            .take_while(move |ts| valid && *ts < self.end)
    }
}

/// Decoded per-variable samples, keyed by variable name.
///
/// The wire format is positional; decoding turns it into an explicit mapping so a
/// reordered variable list can never shift values into the wrong column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableSeries {
    series: HashMap<String, Vec<Option<f64>>>,
}

impl VariableSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, variable: impl Into<String>, values: Vec<Option<f64>>) {
        self.series.insert(variable.into(), values);
    }

    pub fn get(&self, variable: &str) -> Option<&[Option<f64>]> {
        self.series.get(variable).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Vec<Option<f64>>)> for VariableSeries {
    fn from_iter<I: IntoIterator<Item = (S, Vec<Option<f64>>)>>(iter: I) -> Self {
        Self {
            series: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Everything a provider returns for one city.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyResponse {
    pub range: TimeRange,
    pub series: VariableSeries,
}

/// One output line. `values` follows the dataset's variable order; `None` is an absent sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub timestamp: DateTime<Utc>,
    pub city: String,
    pub values: Vec<Option<f64>>,
}

/// A variable that had fewer usable samples than timestamps for one city.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableGap {
    pub city: String,
    pub variable: String,
    pub missing: usize,
}
