//! Time-windowed telemetry buffers.
//!
//! A scope holds `n + 1` columns: column 0 is the time axis, columns `1..=n`
//! are the series. Every append extends all columns by the same number of
//! samples, then drops from the front every sample older than
//! `last_time - keep_last_secs`. Retention is by time, not by count, since
//! nodes do not sample at a fixed rate.
//!
//! The new columns are built off to the side and published with one
//! [`Observable::set`], so subscribers never see columns of unequal length
//! and a rejected update leaves the published data untouched.

use serde_json::Value;
use tracing::warn;

use crate::error::ProtocolError;
use crate::observable::Observable;
use crate::protocol::ScopeDescription;

/// Column 0 is time, columns `1..=n` are series values.
pub type ScopeData = Vec<Vec<f64>>;

pub const DEFAULT_KEEP_LAST_SECS: f64 = 10.0;

/// Upper bound on the series count a node may declare for one scope.
pub const MAX_SCOPE_SERIES: usize = 1024;

#[derive(Debug, Clone)]
pub struct TelemetryScope {
    pub name: String,
    pub n: usize,
    pub labels: Vec<String>,
    /// Plot styles as sent by the node; only presentation code reads them.
    pub styles: Option<Value>,
    pub keep_last_secs: f64,
    pub data: Observable<ScopeData>,
}

impl TelemetryScope {
    pub fn new(name: impl Into<String>, n: usize, keep_last_secs: f64) -> Self {
        Self {
            name: name.into(),
            n,
            labels: (1..=n).map(|k| format!("series {k}")).collect(),
            styles: None,
            keep_last_secs,
            data: Observable::new(vec![Vec::new(); n + 1]),
        }
    }

    pub fn from_description(
        description: &ScopeDescription,
        default_keep_last_secs: f64,
    ) -> Result<Self, ProtocolError> {
        if description.n > MAX_SCOPE_SERIES {
            return Err(ProtocolError::malformed(
                "telemetry scope",
                format!(
                    "scope '{}' declares {} series, at most {MAX_SCOPE_SERIES} are supported",
                    description.name, description.n
                ),
            ));
        }

        let mut scope = Self::new(
            description.name.clone(),
            description.n,
            description
                .keep_last_secs
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .unwrap_or(default_keep_last_secs),
        );
        if let Some(labels) = &description.labels {
            for (slot, label) in scope.labels.iter_mut().zip(labels) {
                slot.clone_from(label);
            }
        }
        scope.styles = description.styles.clone();
        Ok(scope)
    }

    /// Append one batch of samples and evict what fell out of the window.
    pub fn append(&self, times: &[f64], series: &[Vec<f64>]) -> Result<(), ProtocolError> {
        if series.len() != self.n {
            return Err(ProtocolError::SeriesCountMismatch {
                scope: self.name.clone(),
                expected: self.n,
                got: series.len(),
            });
        }
        if let Some((index, column)) = series
            .iter()
            .enumerate()
            .find(|(_, column)| column.len() != times.len())
        {
            return Err(ProtocolError::SampleCountMismatch {
                scope: self.name.clone(),
                series: index,
                expected: times.len(),
                got: column.len(),
            });
        }

        let mut data = self.data.get();
        if !self.has_shape(&data) {
            warn!(
                scope = %self.name,
                columns = data.len(),
                expected = self.n + 1,
                "scope columns were replaced with a different shape; starting a fresh window"
            );
            data = vec![Vec::new(); self.n + 1];
        }
        let mut previous = data[0].last().copied().unwrap_or(f64::NEG_INFINITY);
        for &time in times {
            if time < previous {
                return Err(ProtocolError::TimeNotMonotonic {
                    scope: self.name.clone(),
                    previous,
                    time,
                });
            }
            previous = time;
        }

        data[0].extend_from_slice(times);
        for (column, samples) in data[1..].iter_mut().zip(series) {
            column.extend_from_slice(samples);
        }
        evict_expired(&mut data, self.keep_last_secs);

        self.data.set(data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.with(|data| data.first().map_or(0, Vec::len))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `n + 1` columns of equal length.
    fn has_shape(&self, data: &ScopeData) -> bool {
        data.len() == self.n + 1 && data.iter().all(|column| column.len() == data[0].len())
    }
}

/// Drop every sample older than `last_time - keep_last_secs` from the front
/// of all columns together. Returns how many samples were dropped.
pub fn evict_expired(data: &mut ScopeData, keep_last_secs: f64) -> usize {
    let Some(&last) = data.first().and_then(|times| times.last()) else {
        return 0;
    };
    let cutoff = last - keep_last_secs;
    let first_kept = data[0].partition_point(|time| *time < cutoff);

    if first_kept > 0 {
        for column in data.iter_mut() {
            column.drain(..first_kept);
        }
    }
    first_kept
}
