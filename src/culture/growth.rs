//! Growth-rate estimation.
//!
//! Fits `ln(od) = a + μ·t` by ordinary least squares over the recent part
//! of the OD history and derives the doubling time `ln 2 / μ`.  Time is
//! measured in hours, so μ is in 1/h and doubling time in hours.
//!
//! Degenerate input (too few points, all points at one instant,
//! non-positive or non-finite readings) yields `None`, never a panic.
//!
//! Samples live in a fixed-capacity [`OdHistory`] ring; the oldest reading
//! is overwritten once it is full.

use core::fmt;

use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};

/// Readings retained per culture.  At one reading per minute this covers
/// the longest accepted growth window.
pub const OD_HISTORY_SLOTS: usize = 480;

/// One OD sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OdSample {
    /// Unix seconds.
    pub timestamp: f64,
    pub od: f64,
}

/// Result of a successful fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrowthEstimate {
    /// Specific growth rate (1/h).
    pub mu: f64,
    /// Standard error of `mu`; needs at least three samples.
    pub mu_error: Option<f64>,
    /// Doubling time (h); only defined while the culture grows.
    pub doubling_time: Option<f64>,
    pub doubling_time_error: Option<f64>,
    /// Samples used by the fit.
    pub samples: usize,
}

/// Bounded ring of recent OD samples, oldest first.
pub struct OdHistory {
    ring: HistoryBuffer<OdSample, OD_HISTORY_SLOTS>,
}

impl OdHistory {
    pub fn new() -> Self {
        Self {
            ring: HistoryBuffer::new(),
        }
    }

    pub fn push(&mut self, sample: OdSample) {
        self.ring.write(sample);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &OdSample> + '_ {
        self.ring.oldest_ordered()
    }
}

impl Default for OdHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for OdHistory {
    fn clone(&self) -> Self {
        let mut ring = HistoryBuffer::new();
        ring.extend(self.iter().copied());
        Self { ring }
    }
}

impl fmt::Debug for OdHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Estimate the growth rate from samples taken at or after `window_start`
/// and strictly after `last_dilution` (both Unix seconds).  A reading
/// stamped at the dilution instant predates the added medium.
pub fn estimate<'a>(
    samples: impl IntoIterator<Item = &'a OdSample>,
    window_start: f64,
    last_dilution: f64,
) -> Option<GrowthEstimate> {
    let points: Vec<(f64, f64)> = samples
        .into_iter()
        .filter(|s| s.timestamp >= window_start && s.timestamp > last_dilution)
        .filter(|s| s.timestamp.is_finite())
        .filter(|s| s.od > 0.0 && s.od.is_finite())
        .map(|s| (s.timestamp / 3600.0, s.od.ln()))
        .collect();

    let n = points.len();
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean_t = points.iter().map(|(t, _)| t).sum::<f64>() / nf;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / nf;

    let sxx: f64 = points.iter().map(|(t, _)| (t - mean_t).powi(2)).sum();
    if sxx <= f64::EPSILON {
        return None;
    }
    let sxy: f64 = points
        .iter()
        .map(|(t, y)| (t - mean_t) * (y - mean_y))
        .sum();

    let mu = sxy / sxx;
    if !mu.is_finite() {
        return None;
    }
    let intercept = mean_y - mu * mean_t;

    let mu_error = (n >= 3).then(|| {
        let rss: f64 = points
            .iter()
            .map(|(t, y)| (y - intercept - mu * t).powi(2))
            .sum();
        (rss / (nf - 2.0) / sxx).sqrt()
    });

    let (doubling_time, doubling_time_error) = if mu > 0.0 {
        let dt = core::f64::consts::LN_2 / mu;
        let err = mu_error.map(|e| core::f64::consts::LN_2 * e / (mu * mu));
        (Some(dt), err)
    } else {
        (None, None)
    };

    Some(GrowthEstimate {
        mu,
        mu_error,
        doubling_time,
        doubling_time_error,
        samples: n,
    })
}
