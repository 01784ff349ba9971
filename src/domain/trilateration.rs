//! RSSI to relative distance conversion and planar position solving.
//!
//! The unit carries the primary beacon; the left and right beacons sit
//! symmetrically about the unit's forward axis. Given smoothed relative
//! distances to all three, the closed-form solution is
//!
//! ```text
//! denom = dC²·dL² + dC²·dR² + dL²·dR²
//! x =  b · dC² · (dL² − dR²) / denom
//! y = −a · dC² · (dL² + dR²) / denom
//! ```
//!
//! where `a` is the forward offset and `b` the half baseline.

use crate::domain::filter::WindowedAverage;
use crate::domain::models::{BeaconRole, PositionUpdate, RoleMap};
use crate::domain::settings::{Geometry, LocatorSettings};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

/// Denominators below this are treated as "all distances collapsed".
const MIN_DENOMINATOR: f64 = 1e-12;

/// Log-distance path-loss inversion with the exponent fixed at 2.
///
/// Returns 1.0 at the reference power and shrinks as RSSI rises above it.
pub fn relative_distance(rssi: i16, reference_power: i16) -> f64 {
    let loss = i32::from(reference_power) - i32::from(rssi);
    10f64.powf(f64::from(loss) / 20.0)
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("non-finite evaluation: {0}")]
pub struct EvaluationFault(pub String);

impl Geometry {
    /// Solve for `(x, y)`.
    ///
    /// `Ok(None)` means the distances are degenerate and there is nothing to
    /// report; `Err` means the arithmetic went non-finite.
    pub fn solve(
        &self,
        left: f64,
        center: f64,
        right: f64,
    ) -> Result<Option<(f64, f64)>, EvaluationFault> {
        if !(left.is_finite() && center.is_finite() && right.is_finite()) {
            return Err(EvaluationFault(format!(
                "distances ({}, {}, {})",
                left, center, right
            )));
        }

        let l2 = left * left;
        let c2 = center * center;
        let r2 = right * right;
        let denom = c2 * l2 + c2 * r2 + l2 * r2;
        if !denom.is_finite() {
            return Err(EvaluationFault(format!("denominator {}", denom)));
        }
        if denom.abs() < MIN_DENOMINATOR {
            return Ok(None);
        }

        let x = self.half_baseline * c2 * (l2 - r2) / denom;
        let y = -(self.forward_offset * c2 * (l2 + r2)) / denom;
        if !(x.is_finite() && y.is_finite()) {
            return Err(EvaluationFault(format!("position ({}, {})", x, y)));
        }
        Ok(Some((x, y)))
    }
}

/// Smooths per-role distances and re-solves at most once per interval.
#[derive(Debug)]
pub struct TrilaterationEngine {
    enabled: bool,
    last_evaluation: Option<Instant>,
    filters: RoleMap<WindowedAverage>,
    reference_power: RoleMap<i16>,
    geometry: Geometry,
    interval: Duration,
}

impl TrilaterationEngine {
    pub fn new(settings: &LocatorSettings, reference_power: RoleMap<i16>) -> Self {
        Self {
            enabled: false,
            last_evaluation: None,
            filters: RoleMap::from_fn(|_| {
                WindowedAverage::new(settings.filter_capacity, settings.filter_window())
            }),
            reference_power,
            geometry: settings.geometry,
            interval: settings.evaluation_interval(),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Feed one RSSI reading taken at `now`.
    ///
    /// Samples are ignored while disabled. Primary samples drive evaluation,
    /// gated so that at least one interval separates two evaluations.
    pub fn record(
        &mut self,
        role: BeaconRole,
        rssi: i16,
        now: Instant,
    ) -> Result<Option<PositionUpdate>, EvaluationFault> {
        if !self.enabled {
            return Ok(None);
        }

        let distance = relative_distance(rssi, self.reference_power[role]);
        trace!("{} rssi {} -> distance {:.4}", role, rssi, distance);
        self.filters[role].add_at(distance, now);

        if !role.is_primary() {
            return Ok(None);
        }
        match self.last_evaluation {
            Some(last) if now.saturating_duration_since(last) < self.interval => Ok(None),
            _ => {
                self.last_evaluation = Some(now);
                self.evaluate(now)
            }
        }
    }

    fn evaluate(&mut self, now: Instant) -> Result<Option<PositionUpdate>, EvaluationFault> {
        let left = self.filters.left.average_at(now);
        let center = self.filters.primary.average_at(now);
        let right = self.filters.right.average_at(now);

        match self.geometry.solve(left, center, right)? {
            Some((x, y)) => Ok(Some(PositionUpdate {
                x,
                y,
                z: 0.0,
                distance_left: left,
                distance_center: center,
                distance_right: right,
            })),
            None => {
                debug!("Skipping evaluation: distances collapsed to zero");
                Ok(None)
            }
        }
    }
}
