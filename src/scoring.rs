//! Quintile-based 1-5 scoring of raw RFM metrics

use crate::rfm::RfmRecord;
use crate::segment::fm_score;
use log::debug;
use serde::Serialize;

/// Percentiles used as score boundaries
pub const QUINTILES: [f64; 4] = [0.2, 0.4, 0.6, 0.8];

/// Linear-interpolated quantile of an ascending slice.
///
/// Matches the default numpy/pandas definition: position `q * (n - 1)`
/// interpolated between its neighbouring ranks.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

fn quintile_bounds(mut values: Vec<f64>) -> Option<[f64; 4]> {
    values.sort_by(f64::total_cmp);
    let mut bounds = [0.0; 4];
    for (slot, q) in bounds.iter_mut().zip(QUINTILES) {
        *slot = quantile(&values, q)?;
    }
    Some(bounds)
}

/// Q20/Q40/Q60/Q80 of each metric, fitted once over the full dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuintileBoundaries {
    pub recency: [f64; 4],
    pub frequency: [f64; 4],
    pub monetary: [f64; 4],
}

impl QuintileBoundaries {
    pub fn fit(records: &[RfmRecord]) -> Option<Self> {
        let boundaries = Self {
            recency: quintile_bounds(records.iter().map(|r| r.recency as f64).collect())?,
            frequency: quintile_bounds(records.iter().map(|r| r.frequency as f64).collect())?,
            monetary: quintile_bounds(records.iter().map(|r| r.monetary).collect())?,
        };
        debug!("Quintile boundaries: {:?}", boundaries);
        Some(boundaries)
    }

    /// Score raw metric values against these boundaries
    pub fn score(&self, recency: f64, frequency: f64, monetary: f64) -> RfmScores {
        let f = score_ascending(frequency, &self.frequency);
        let m = score_ascending(monetary, &self.monetary);
        RfmScores {
            r: score_recency(recency, &self.recency),
            f,
            m,
            fm: fm_score(f, m),
        }
    }
}

/// 1 for values at or below Q20, up to 5 above Q80. Ties at a boundary
/// fall into the lower bucket.
pub fn score_ascending(value: f64, bounds: &[f64; 4]) -> u8 {
    bounds
        .iter()
        .position(|q| value <= *q)
        .map_or(5, |i| i as u8 + 1)
}

/// Inverse of [`score_ascending`]: the most recent buyers score 5.
pub fn score_recency(value: f64, bounds: &[f64; 4]) -> u8 {
    6 - score_ascending(value, bounds)
}

/// Ordinal scores for one customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RfmScores {
    pub r: u8,
    pub f: u8,
    pub m: u8,
    pub fm: u8,
}

impl RfmScores {
    /// Three-digit `rfm_score` code, e.g. `"534"`
    pub fn rfm_score(&self) -> String {
        format!("{}{}{}", self.r, self.f, self.m)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub rfm: RfmRecord,
    pub scores: RfmScores,
}

/// Fit boundaries over `records` and score every record with them
pub fn score_all(records: Vec<RfmRecord>) -> (Option<QuintileBoundaries>, Vec<ScoredRecord>) {
    let Some(boundaries) = QuintileBoundaries::fit(&records) else {
        return (None, Vec::new());
    };
    let scored = records
        .into_iter()
        .map(|rfm| {
            let scores = boundaries.score(rfm.recency as f64, rfm.frequency as f64, rfm.monetary);
            ScoredRecord { rfm, scores }
        })
        .collect();
    (Some(boundaries), scored)
}
