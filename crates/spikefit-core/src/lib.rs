//! # SpikeFit Core
//!
//! Shared units, quantities and types for the spikefit toolkit.
//!
//! Every physical parameter entering a simulation carries an explicit unit.
//! Model construction converts quantities to SI base units through
//! [`Quantity::expect`], which rejects dimension mismatches up front instead
//! of silently coercing them into the integration loop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common errors for quantity and parameter validation
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Unit mismatch: expected {expected}, got {got}")]
    UnitMismatch { expected: Dimension, got: Dimension },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

// ============================================================================
// UNITS SYSTEM
// ============================================================================

/// Physical dimension of a quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dimension {
    Time,
    Voltage,
    Current,
    Conductance,
    Capacitance,
    Frequency,
    Dimensionless,
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Dimension::Time => "time",
            Dimension::Voltage => "voltage",
            Dimension::Current => "current",
            Dimension::Conductance => "conductance",
            Dimension::Capacitance => "capacitance",
            Dimension::Frequency => "frequency",
            Dimension::Dimensionless => "dimensionless",
        };
        f.write_str(name)
    }
}

/// Physical units with SI prefixes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Unit {
    // Time
    Second,
    Millisecond, // ms

    // Voltage
    Volt,
    Millivolt, // mV

    // Current
    Ampere,
    Nanoampere, // nA
    Picoampere, // pA

    // Conductance
    Siemens,
    Nanosiemens, // nS

    // Capacitance
    Farad,
    Picofarad, // pF

    // Frequency
    Hertz,

    // Dimensionless
    Dimensionless,
}

impl Unit {
    /// Conversion factor to SI base units
    pub fn to_si_factor(&self) -> f64 {
        match self {
            Unit::Second => 1.0,
            Unit::Millisecond => 1e-3,
            Unit::Volt => 1.0,
            Unit::Millivolt => 1e-3,
            Unit::Ampere => 1.0,
            Unit::Nanoampere => 1e-9,
            Unit::Picoampere => 1e-12,
            Unit::Siemens => 1.0,
            Unit::Nanosiemens => 1e-9,
            Unit::Farad => 1.0,
            Unit::Picofarad => 1e-12,
            Unit::Hertz => 1.0,
            Unit::Dimensionless => 1.0,
        }
    }

    /// Physical dimension of this unit
    pub fn dimension(&self) -> Dimension {
        match self {
            Unit::Second | Unit::Millisecond => Dimension::Time,
            Unit::Volt | Unit::Millivolt => Dimension::Voltage,
            Unit::Ampere | Unit::Nanoampere | Unit::Picoampere => Dimension::Current,
            Unit::Siemens | Unit::Nanosiemens => Dimension::Conductance,
            Unit::Farad | Unit::Picofarad => Dimension::Capacitance,
            Unit::Hertz => Dimension::Frequency,
            Unit::Dimensionless => Dimension::Dimensionless,
        }
    }
}

/// Quantity with value and unit
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: Unit,
}

impl Quantity {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    /// Convert to SI base units
    pub fn to_si(&self) -> f64 {
        self.value * self.unit.to_si_factor()
    }

    /// SI value, checked against the expected dimension
    pub fn expect(&self, dim: Dimension) -> Result<f64> {
        if self.unit.dimension() != dim {
            return Err(CoreError::UnitMismatch {
                expected: dim,
                got: self.unit.dimension(),
            });
        }
        Ok(self.to_si())
    }

    /// SI value, checked for dimension and strict positivity
    /// (time constants, capacitances and the like)
    pub fn expect_positive(&self, dim: Dimension) -> Result<f64> {
        let si = self.expect(dim)?;
        if si <= 0.0 {
            return Err(CoreError::InvalidParameter(format!(
                "expected a positive {}, got {}",
                dim, si
            )));
        }
        Ok(si)
    }

    /// Same unit, value multiplied by a dimensionless factor
    pub fn scaled(&self, factor: f64) -> Quantity {
        Quantity::new(self.value * factor, self.unit)
    }
}

pub fn seconds(value: f64) -> Quantity {
    Quantity::new(value, Unit::Second)
}

pub fn ms(value: f64) -> Quantity {
    Quantity::new(value, Unit::Millisecond)
}

pub fn mv(value: f64) -> Quantity {
    Quantity::new(value, Unit::Millivolt)
}

pub fn na(value: f64) -> Quantity {
    Quantity::new(value, Unit::Nanoampere)
}

pub fn ns(value: f64) -> Quantity {
    Quantity::new(value, Unit::Nanosiemens)
}

pub fn pf(value: f64) -> Quantity {
    Quantity::new(value, Unit::Picofarad)
}

pub fn hz(value: f64) -> Quantity {
    Quantity::new(value, Unit::Hertz)
}

// ============================================================================
// COMMON TYPES
// ============================================================================

/// Time point (seconds)
pub type Time = f64;

/// Voltage (SI volts)
pub type Voltage = f64;

/// Current (SI amperes)
pub type Current = f64;

/// A threshold crossing of one neuron
///
/// Ordering is (timestamp, neuron index ascending). Every consumer of spike
/// events relies on this tie-break for deterministic plasticity application.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikeEvent {
    pub neuron: usize,
    pub time: Time,
}

impl SpikeEvent {
    pub fn new(neuron: usize, time: Time) -> Self {
        Self { neuron, time }
    }
}

impl Eq for SpikeEvent {}

impl PartialOrd for SpikeEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SpikeEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .total_cmp(&other.time)
            .then(self.neuron.cmp(&other.neuron))
    }
}

/// Time series data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points (seconds)
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_si_conversion() {
        assert_eq!(ms(10.0).to_si(), 0.01);
        assert_eq!(mv(-70.0).to_si(), -0.07);
        assert_eq!(na(0.5).to_si(), 0.5e-9);
        assert_eq!(pf(281.0).to_si(), 281.0e-12);
    }

    #[test]
    fn test_dimension_check() {
        let tau = ms(10.0);
        assert!(tau.expect(Dimension::Time).is_ok());

        let err = tau.expect(Dimension::Voltage).unwrap_err();
        match err {
            CoreError::UnitMismatch { expected, got } => {
                assert_eq!(expected, Dimension::Voltage);
                assert_eq!(got, Dimension::Time);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_positive_check() {
        assert!(ms(10.0).expect_positive(Dimension::Time).is_ok());
        assert!(ms(0.0).expect_positive(Dimension::Time).is_err());
        assert!(ms(-5.0).expect_positive(Dimension::Time).is_err());
    }

    #[test]
    fn test_spike_event_ordering() {
        let mut events = vec![
            SpikeEvent::new(7, 0.02),
            SpikeEvent::new(3, 0.01),
            SpikeEvent::new(1, 0.02),
        ];
        events.sort();
        assert_eq!(events[0], SpikeEvent::new(3, 0.01));
        // Same timestamp: index ascending
        assert_eq!(events[1], SpikeEvent::new(1, 0.02));
        assert_eq!(events[2], SpikeEvent::new(7, 0.02));
    }

    #[test]
    fn test_time_series() {
        let mut ts = TimeSeries::new("v");
        ts.push(0.0, -0.065);
        ts.push(0.001, -0.064);
        assert_eq!(ts.len(), 2);
        assert!(!ts.is_empty());
    }
}
