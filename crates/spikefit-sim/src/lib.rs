//! # SpikeFit Simulation Engine
//!
//! Time-stepped simulation of small spiking-neuron populations with
//! event-driven STDP.
//!
//! This crate provides:
//! - Declarative model parameter sets (LIF, AdEx, excitatory/inhibitory)
//! - Fixed-step integration (exact, Euler, exponential Euler)
//! - Sparse projections with lazily-decayed plasticity traces
//! - Oscillatory / binary stimulus signals and Poisson drive
//! - Pre-run neuromodulation transforms (dopamine, acetylcholine)
//!
//! All stochastic draws go through one caller-supplied seeded generator in a
//! fixed order (connectivity, then weight init, then per step: Poisson draws
//! before membrane noise, neurons in index order), so a run is bit-for-bit
//! reproducible from its seed.

use ndarray::Array1;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use spikefit_core::{Dimension, Quantity, SpikeEvent};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unit error: {0}")]
    Unit(#[from] spikefit_core::CoreError),

    #[error("Numerical divergence in population '{population}' at step {step}")]
    NumericalDivergence { population: String, step: u64 },
}

pub type Result<T> = std::result::Result<T, SimError>;

// ============================================================================
// EQUATION MODEL LIBRARY
// ============================================================================

/// Leaky integrate-and-fire parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LifParams {
    pub v_rest: Quantity,
    pub v_reset: Quantity,
    pub v_thresh: Quantity,
    pub tau_m: Quantity,
    pub refractory: Quantity,
}

impl Default for LifParams {
    fn default() -> Self {
        Self {
            v_rest: spikefit_core::mv(-70.0),
            v_reset: spikefit_core::mv(-65.0),
            v_thresh: spikefit_core::mv(-50.0),
            tau_m: spikefit_core::ms(10.0),
            refractory: spikefit_core::ms(5.0),
        }
    }
}

/// Shared parameters for the excitatory/inhibitory network variants
///
/// The excitatory variant carries a slow adaptation variable (incremented by
/// `adaptation_step` on each spike) and Gaussian membrane noise; the
/// inhibitory variant has noise only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetworkParams {
    pub v_rest: Quantity,
    pub v_reset: Quantity,
    pub v_thresh: Quantity,
    pub tau_m_exc: Quantity,
    pub tau_m_inh: Quantity,
    pub refractory: Quantity,
    pub synaptic_weight: Quantity,
    pub adaptation_step: Quantity,
    pub tau_w: Quantity,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            v_rest: spikefit_core::mv(-65.0),
            v_reset: spikefit_core::mv(-70.0),
            v_thresh: spikefit_core::mv(-50.0),
            tau_m_exc: spikefit_core::ms(25.0),
            tau_m_inh: spikefit_core::ms(15.0),
            refractory: spikefit_core::ms(3.0),
            synaptic_weight: spikefit_core::mv(0.6),
            adaptation_step: spikefit_core::mv(3.0),
            tau_w: spikefit_core::ms(80.0),
        }
    }
}

/// Adaptive exponential integrate-and-fire parameters (Brette & Gerstner)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdexParams {
    pub g_l: Quantity,
    pub e_l: Quantity,
    pub v_thresh: Quantity,
    pub v_reset: Quantity,
    pub delta_t: Quantity,
    pub c_m: Quantity,
    pub tau_w: Quantity,
    pub a: Quantity,
    pub b: Quantity,
    pub refractory: Quantity,
}

impl Default for AdexParams {
    fn default() -> Self {
        Self {
            g_l: spikefit_core::ns(30.0),
            e_l: spikefit_core::mv(-70.6),
            v_thresh: spikefit_core::mv(-50.4),
            v_reset: spikefit_core::mv(-70.6),
            delta_t: spikefit_core::mv(2.0),
            c_m: spikefit_core::pf(281.0),
            tau_w: spikefit_core::ms(144.0),
            a: spikefit_core::ns(4.0),
            b: spikefit_core::na(0.0805),
            refractory: spikefit_core::ms(4.0),
        }
    }
}

/// STDP rule parameters
///
/// `a_post` is negative by default so depression slightly dominates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StdpRule {
    pub tau_pre: Quantity,
    pub tau_post: Quantity,
    pub a_pre: f64,
    pub a_post: f64,
    pub w_min: f64,
    pub w_max: f64,
    /// Postsynaptic potential kick per unit weight on a presynaptic spike
    pub psp_per_weight: Quantity,
}

impl Default for StdpRule {
    fn default() -> Self {
        Self {
            tau_pre: spikefit_core::ms(20.0),
            tau_post: spikefit_core::ms(20.0),
            a_pre: 0.01,
            a_post: -0.01 * 1.05,
            w_min: 0.0,
            w_max: 1.0,
            psp_per_weight: spikefit_core::mv(10.0),
        }
    }
}

/// Integration methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationMethod {
    /// Closed-form solution of the linear decay (LIF only)
    Exact,
    /// Forward Euler (Euler-Maruyama for the noise term)
    Euler,
    /// Exact update of the analytically integrable linear term (AdEx
    /// adaptation), Euler elsewhere
    ExponentialEuler,
}

/// Tagged neuron model selection
///
/// Replaces equation strings with one explicit state-update function per
/// variant; the parameters are pure data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum NeuronModel {
    Lif(LifParams),
    Excitatory(NetworkParams),
    Inhibitory(NetworkParams),
    Adex(AdexParams),
}

impl NeuronModel {
    /// Canonical integration method for this variant
    pub fn default_method(&self) -> IntegrationMethod {
        match self {
            NeuronModel::Lif(_) => IntegrationMethod::Exact,
            NeuronModel::Excitatory(_) | NeuronModel::Inhibitory(_) => IntegrationMethod::Euler,
            NeuronModel::Adex(_) => IntegrationMethod::ExponentialEuler,
        }
    }

    /// Resting (leak reversal) potential of this variant
    pub fn resting_potential(&self) -> Quantity {
        match self {
            NeuronModel::Lif(p) => p.v_rest,
            NeuronModel::Excitatory(p) | NeuronModel::Inhibitory(p) => p.v_rest,
            NeuronModel::Adex(p) => p.e_l,
        }
    }

    /// Same variant with the resting potential replaced
    pub fn with_resting_potential(&self, v_rest: Quantity) -> NeuronModel {
        let mut model = *self;
        match &mut model {
            NeuronModel::Lif(p) => p.v_rest = v_rest,
            NeuronModel::Excitatory(p) | NeuronModel::Inhibitory(p) => p.v_rest = v_rest,
            NeuronModel::Adex(p) => p.e_l = v_rest,
        }
        model
    }

    /// Validate units and produce SI coefficients for a fixed step.
    ///
    /// Unit mismatches and non-positive time constants are rejected here,
    /// before any state exists.
    pub fn compile(&self, dt: f64) -> Result<CompiledModel> {
        self.compile_with_method(dt, self.default_method())
    }

    pub fn compile_with_method(&self, dt: f64, method: IntegrationMethod) -> Result<CompiledModel> {
        if !(dt > 0.0) || !dt.is_finite() {
            return Err(SimError::Config(format!("time step must be positive, got {dt}")));
        }

        let (coeffs, refractory) = match self {
            NeuronModel::Lif(p) => {
                if method == IntegrationMethod::ExponentialEuler {
                    return Err(SimError::Config(
                        "LIF supports exact or Euler integration".into(),
                    ));
                }
                (
                    ModelCoeffs::Lif {
                        v_rest: p.v_rest.expect(Dimension::Voltage)?,
                        v_reset: p.v_reset.expect(Dimension::Voltage)?,
                        v_thresh: p.v_thresh.expect(Dimension::Voltage)?,
                        tau_m: p.tau_m.expect_positive(Dimension::Time)?,
                    },
                    p.refractory,
                )
            }
            NeuronModel::Excitatory(p) => {
                if method != IntegrationMethod::Euler {
                    return Err(SimError::Config(
                        "the stochastic network variants require Euler integration".into(),
                    ));
                }
                (
                    ModelCoeffs::Excitatory {
                        v_rest: p.v_rest.expect(Dimension::Voltage)?,
                        v_reset: p.v_reset.expect(Dimension::Voltage)?,
                        v_thresh: p.v_thresh.expect(Dimension::Voltage)?,
                        tau_m: p.tau_m_exc.expect_positive(Dimension::Time)?,
                        tau_w: p.tau_w.expect_positive(Dimension::Time)?,
                        w_step: p.adaptation_step.expect(Dimension::Voltage)?,
                    },
                    p.refractory,
                )
            }
            NeuronModel::Inhibitory(p) => {
                if method != IntegrationMethod::Euler {
                    return Err(SimError::Config(
                        "the stochastic network variants require Euler integration".into(),
                    ));
                }
                (
                    ModelCoeffs::Inhibitory {
                        v_rest: p.v_rest.expect(Dimension::Voltage)?,
                        v_reset: p.v_reset.expect(Dimension::Voltage)?,
                        v_thresh: p.v_thresh.expect(Dimension::Voltage)?,
                        tau_m: p.tau_m_inh.expect_positive(Dimension::Time)?,
                    },
                    p.refractory,
                )
            }
            NeuronModel::Adex(p) => {
                if method == IntegrationMethod::Exact {
                    return Err(SimError::Config(
                        "AdEx has no closed-form solution; use Euler or exponential Euler".into(),
                    ));
                }
                (
                    ModelCoeffs::Adex {
                        g_l: p.g_l.expect_positive(Dimension::Conductance)?,
                        e_l: p.e_l.expect(Dimension::Voltage)?,
                        v_thresh: p.v_thresh.expect(Dimension::Voltage)?,
                        v_reset: p.v_reset.expect(Dimension::Voltage)?,
                        delta_t: p.delta_t.expect_positive(Dimension::Voltage)?,
                        c_m: p.c_m.expect_positive(Dimension::Capacitance)?,
                        tau_w: p.tau_w.expect_positive(Dimension::Time)?,
                        a: p.a.expect(Dimension::Conductance)?,
                        b: p.b.expect(Dimension::Current)?,
                    },
                    p.refractory,
                )
            }
        };

        let t_ref = refractory.expect(Dimension::Time)?;
        if t_ref < 0.0 {
            return Err(SimError::Config("refractory period cannot be negative".into()));
        }

        Ok(CompiledModel {
            coeffs,
            method,
            dt,
            refractory_steps: (t_ref / dt).round() as u32,
        })
    }
}

/// SI coefficients of one model variant
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum ModelCoeffs {
    Lif {
        v_rest: f64,
        v_reset: f64,
        v_thresh: f64,
        tau_m: f64,
    },
    Excitatory {
        v_rest: f64,
        v_reset: f64,
        v_thresh: f64,
        tau_m: f64,
        tau_w: f64,
        w_step: f64,
    },
    Inhibitory {
        v_rest: f64,
        v_reset: f64,
        v_thresh: f64,
        tau_m: f64,
    },
    Adex {
        g_l: f64,
        e_l: f64,
        v_thresh: f64,
        v_reset: f64,
        delta_t: f64,
        c_m: f64,
        tau_w: f64,
        a: f64,
        b: f64,
    },
}

/// Unit-checked model ready for integration at a fixed step
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CompiledModel {
    coeffs: ModelCoeffs,
    pub method: IntegrationMethod,
    pub dt: f64,
    pub refractory_steps: u32,
}

impl CompiledModel {
    fn has_noise(&self) -> bool {
        matches!(
            self.coeffs,
            ModelCoeffs::Excitatory { .. } | ModelCoeffs::Inhibitory { .. }
        )
    }

    fn v_rest(&self) -> f64 {
        match self.coeffs {
            ModelCoeffs::Lif { v_rest, .. } => v_rest,
            ModelCoeffs::Excitatory { v_rest, .. } => v_rest,
            ModelCoeffs::Inhibitory { v_rest, .. } => v_rest,
            ModelCoeffs::Adex { e_l, .. } => e_l,
        }
    }

    fn v_thresh(&self) -> f64 {
        match self.coeffs {
            ModelCoeffs::Lif { v_thresh, .. } => v_thresh,
            ModelCoeffs::Excitatory { v_thresh, .. } => v_thresh,
            ModelCoeffs::Inhibitory { v_thresh, .. } => v_thresh,
            ModelCoeffs::Adex { v_thresh, .. } => v_thresh,
        }
    }
}

// ============================================================================
// INTEGRATION ENGINE
// ============================================================================

/// A population of identical-topology neurons in structure-of-arrays layout
///
/// The state vector dimensionality is fixed at creation; every neuron carries
/// membrane potential `v`, adaptation `w` (zero for variants without one) and
/// the synaptic input accumulator `i_syn` incremented by projections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Population {
    pub name: String,
    pub n: usize,
    model: CompiledModel,
    pub v: Array1<f64>,
    pub w: Array1<f64>,
    pub i_syn: Array1<f64>,
    sigma: Array1<f64>,
    tau_w: Array1<f64>,
    /// Per-neuron countdown in steps; a neuron is refractory while > 0
    refractory_left: Vec<u32>,
    /// Constant external drive (volts, or amperes for AdEx)
    i_ext: f64,
    /// Optional time-varying drive: gain (same units as `i_ext`) times a
    /// dimensionless signal, looked up at the step start
    drive: Option<(f64, TimedSignal)>,
}

impl Population {
    pub fn new(name: &str, n: usize, model: &NeuronModel, dt: f64) -> Result<Self> {
        Self::with_method(name, n, model, dt, model.default_method())
    }

    pub fn with_method(
        name: &str,
        n: usize,
        model: &NeuronModel,
        dt: f64,
        method: IntegrationMethod,
    ) -> Result<Self> {
        if n == 0 {
            return Err(SimError::Config(format!("population '{name}' has no neurons")));
        }
        let compiled = model.compile_with_method(dt, method)?;
        let tau_w_default = match compiled.coeffs {
            ModelCoeffs::Excitatory { tau_w, .. } => tau_w,
            ModelCoeffs::Adex { tau_w, .. } => tau_w,
            _ => 0.0,
        };
        Ok(Self {
            name: name.to_string(),
            n,
            v: Array1::from_elem(n, compiled.v_rest()),
            w: Array1::zeros(n),
            i_syn: Array1::zeros(n),
            sigma: Array1::zeros(n),
            tau_w: Array1::from_elem(n, tau_w_default),
            refractory_left: vec![0; n],
            i_ext: 0.0,
            drive: None,
            model: compiled,
        })
    }

    pub fn dt(&self) -> f64 {
        self.model.dt
    }

    pub fn model(&self) -> &CompiledModel {
        &self.model
    }

    /// Uniform membrane noise amplitude for the stochastic variants
    pub fn set_noise(&mut self, sigma: Quantity) -> Result<()> {
        let si = sigma.expect(Dimension::Voltage)?;
        self.sigma.fill(si);
        Ok(())
    }

    /// Constant external drive (voltage for LIF/network variants, current
    /// for AdEx)
    pub fn set_constant_drive(&mut self, drive: Quantity) -> Result<()> {
        let dim = match self.model.coeffs {
            ModelCoeffs::Adex { .. } => Dimension::Current,
            _ => Dimension::Voltage,
        };
        self.i_ext = drive.expect(dim)?;
        Ok(())
    }

    /// Time-varying drive: `gain * signal(t)` added to the synaptic input,
    /// with the signal sampled at the nearest preceding point each step
    pub fn set_signal_drive(&mut self, gain: Quantity, signal: TimedSignal) -> Result<()> {
        let dim = match self.model.coeffs {
            ModelCoeffs::Adex { .. } => Dimension::Current,
            _ => Dimension::Voltage,
        };
        self.drive = Some((gain.expect(dim)?, signal));
        Ok(())
    }

    /// Initialize potentials uniformly between rest and threshold
    pub fn init_uniform<R: Rng>(&mut self, rng: &mut R) {
        let rest = self.model.v_rest();
        let span = self.model.v_thresh() - rest;
        for i in 0..self.n {
            self.v[i] = rest + rng.gen::<f64>() * span;
        }
    }

    /// Initialize potentials as rest plus Gaussian jitter
    pub fn init_gaussian<R: Rng>(&mut self, sd: Quantity, rng: &mut R) -> Result<()> {
        let sd = sd.expect(Dimension::Voltage)?;
        let rest = self.model.v_rest();
        for i in 0..self.n {
            let z: f64 = rng.sample(StandardNormal);
            self.v[i] = rest + sd * z;
        }
        Ok(())
    }

    /// Heterogeneous adaptation time constants (excitatory variant only):
    /// Gaussian around `mean`, clamped to `[lo, hi]`
    pub fn randomize_tau_w<R: Rng>(
        &mut self,
        mean: Quantity,
        sd: Quantity,
        lo: Quantity,
        hi: Quantity,
        rng: &mut R,
    ) -> Result<()> {
        if !matches!(self.model.coeffs, ModelCoeffs::Excitatory { .. }) {
            return Err(SimError::Config(format!(
                "population '{}' has no adaptation time constant",
                self.name
            )));
        }
        let mean = mean.expect_positive(Dimension::Time)?;
        let sd = sd.expect(Dimension::Time)?;
        let lo = lo.expect_positive(Dimension::Time)?;
        let hi = hi.expect_positive(Dimension::Time)?;
        for i in 0..self.n {
            let z: f64 = rng.sample(StandardNormal);
            self.tau_w[i] = (mean + sd * z).clamp(lo, hi);
        }
        Ok(())
    }

    /// Advance all neurons by one step, returning spiking indices (ascending).
    ///
    /// Noise is drawn for every neuron in index order before any
    /// deterministic update, so the step is a pure function of
    /// (state, noise draws, drive). Refractory neurons hold their potential
    /// and only count down. A neuron past threshold emits exactly one spike
    /// for the step, however far past threshold it lands.
    pub fn step<R: Rng>(&mut self, step: u64, rng: &mut R) -> Result<Vec<usize>> {
        let dt = self.model.dt;
        let t_start = step as f64 * dt;

        let mut noise = vec![0.0; self.n];
        if self.model.has_noise() {
            for z in noise.iter_mut() {
                *z = rng.sample(StandardNormal);
            }
        }

        let mut drive = self.i_ext;
        if let Some((gain, signal)) = &self.drive {
            drive += gain * signal.value_at(t_start);
        }

        let mut spikes = Vec::new();
        for i in 0..self.n {
            if self.refractory_left[i] > 0 {
                // Refractoriness gates the membrane equation only; the
                // adaptation variable keeps integrating
                self.refractory_left[i] -= 1;
                match self.model.coeffs {
                    ModelCoeffs::Excitatory { .. } => {
                        self.w[i] += -self.w[i] / self.tau_w[i] * dt;
                    }
                    ModelCoeffs::Adex { e_l, tau_w, a, .. } => {
                        let w = self.w[i];
                        let w_inf = a * (self.v[i] - e_l);
                        self.w[i] = match self.model.method {
                            IntegrationMethod::ExponentialEuler => {
                                w_inf + (w - w_inf) * (-dt / tau_w).exp()
                            }
                            _ => w + (w_inf - w) / tau_w * dt,
                        };
                    }
                    _ => {}
                }
                continue;
            }

            let v = self.v[i];
            let w = self.w[i];
            let input = self.i_syn[i] + drive;

            let (v_new, w_new, v_thresh, v_reset, aux) = match self.model.coeffs {
                ModelCoeffs::Lif {
                    v_rest,
                    v_reset,
                    v_thresh,
                    tau_m,
                } => {
                    let target = v_rest + input;
                    let v_new = match self.model.method {
                        IntegrationMethod::Exact => {
                            target + (v - target) * (-dt / tau_m).exp()
                        }
                        _ => v + (target - v) / tau_m * dt,
                    };
                    (v_new, 0.0, v_thresh, v_reset, SpikeAux::None)
                }
                ModelCoeffs::Excitatory {
                    v_rest,
                    v_reset,
                    v_thresh,
                    tau_m,
                    w_step,
                    ..
                } => {
                    let dv = (v_rest - v + input - w) / tau_m * dt
                        + self.sigma[i] * (dt / tau_m).sqrt() * noise[i];
                    let dw = -w / self.tau_w[i] * dt;
                    (v + dv, w + dw, v_thresh, v_reset, SpikeAux::Add(w_step))
                }
                ModelCoeffs::Inhibitory {
                    v_rest,
                    v_reset,
                    v_thresh,
                    tau_m,
                } => {
                    let dv = (v_rest - v + input) / tau_m * dt
                        + self.sigma[i] * (dt / tau_m).sqrt() * noise[i];
                    (v + dv, 0.0, v_thresh, v_reset, SpikeAux::None)
                }
                ModelCoeffs::Adex {
                    g_l,
                    e_l,
                    v_thresh,
                    v_reset,
                    delta_t,
                    c_m,
                    tau_w,
                    a,
                    b,
                } => {
                    let i_leak = g_l * (e_l - v);
                    let i_exp = g_l * delta_t * ((v - v_thresh) / delta_t).exp();
                    let v_new = v + (i_leak + i_exp - w + input) / c_m * dt;
                    let w_new = match self.model.method {
                        IntegrationMethod::ExponentialEuler => {
                            let w_inf = a * (v - e_l);
                            w_inf + (w - w_inf) * (-dt / tau_w).exp()
                        }
                        _ => w + (a * (v - e_l) - w) / tau_w * dt,
                    };
                    (v_new, w_new, v_thresh, v_reset, SpikeAux::Add(b))
                }
            };

            if !v_new.is_finite() || !w_new.is_finite() {
                return Err(SimError::NumericalDivergence {
                    population: self.name.clone(),
                    step,
                });
            }

            self.v[i] = v_new;
            self.w[i] = w_new;

            if v_new > v_thresh {
                self.v[i] = v_reset;
                if let SpikeAux::Add(inc) = aux {
                    self.w[i] += inc;
                }
                self.refractory_left[i] = self.model.refractory_steps;
                spikes.push(i);
            }
        }

        Ok(spikes)
    }
}

/// Auxiliary state adjustment applied on a spike
#[derive(Clone, Copy)]
enum SpikeAux {
    None,
    Add(f64),
}

// ============================================================================
// STIMULUS GENERATOR
// ============================================================================

/// Finite time-indexed signal at a fixed sampling interval
///
/// Lookup returns the nearest preceding sample; there is no interpolation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedSignal {
    pub dt: f64,
    pub values: Vec<f64>,
}

impl TimedSignal {
    /// Noisy sinusoid at `freq`, sampled every millisecond and clamped to be
    /// non-negative so it can modulate a rate
    pub fn oscillatory<R: Rng>(
        freq: Quantity,
        duration: Quantity,
        noise: f64,
        rng: &mut R,
    ) -> Result<Self> {
        let freq = freq.expect(Dimension::Frequency)?;
        let duration = duration.expect_positive(Dimension::Time)?;
        let dt = 1e-3;
        let n = (duration / dt).ceil() as usize;
        let mut values = Vec::with_capacity(n);
        for k in 0..n {
            let t = k as f64 * dt;
            let z: f64 = rng.sample(StandardNormal);
            let sample = (2.0 * std::f64::consts::PI * freq * t).sin() + noise * z;
            values.push(sample.max(0.0));
        }
        Ok(Self { dt, values })
    }

    /// Piecewise-constant random binary sequence over `n_items` equal
    /// segments spanning the duration
    pub fn binary_sequence<R: Rng>(
        duration: Quantity,
        n_items: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let duration = duration.expect_positive(Dimension::Time)?;
        if n_items == 0 {
            return Err(SimError::Config("binary sequence needs at least one segment".into()));
        }
        let values = (0..n_items)
            .map(|_| rng.gen_range(0..2u8) as f64)
            .collect();
        Ok(Self {
            dt: duration / n_items as f64,
            values,
        })
    }

    /// Nearest preceding sample; the last sample extends beyond the end
    pub fn value_at(&self, t: f64) -> f64 {
        if self.values.is_empty() || t < 0.0 {
            return 0.0;
        }
        let idx = ((t / self.dt) as usize).min(self.values.len() - 1);
        self.values[idx]
    }

    pub fn duration(&self) -> f64 {
        self.dt * self.values.len() as f64
    }
}

/// Independent Poisson spike sources with an optionally modulated rate
///
/// rate(t) = base + sum(gain_i * signal_i(t)), floored at zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoissonInput {
    pub name: String,
    pub n: usize,
    base_rate: f64,
    modulators: Vec<(f64, TimedSignal)>,
}

impl PoissonInput {
    pub fn new(name: &str, n: usize, base_rate: Quantity) -> Result<Self> {
        let base_rate = base_rate.expect(Dimension::Frequency)?;
        if base_rate < 0.0 {
            return Err(SimError::Config("Poisson rate cannot be negative".into()));
        }
        Ok(Self {
            name: name.to_string(),
            n,
            base_rate,
            modulators: Vec::new(),
        })
    }

    pub fn add_modulator(&mut self, gain: Quantity, signal: TimedSignal) -> Result<()> {
        self.modulators.push((gain.expect(Dimension::Frequency)?, signal));
        Ok(())
    }

    pub fn rate_at(&self, t: f64) -> f64 {
        let mut rate = self.base_rate;
        for (gain, signal) in &self.modulators {
            rate += gain * signal.value_at(t);
        }
        rate.max(0.0)
    }

    /// Draw this step's spikes, one uniform per source in index order
    pub fn sample<R: Rng>(&self, t: f64, dt: f64, rng: &mut R) -> Vec<usize> {
        let p = (self.rate_at(t) * dt).min(1.0);
        let mut spikes = Vec::new();
        for i in 0..self.n {
            if rng.gen::<f64>() < p {
                spikes.push(i);
            }
        }
        spikes
    }
}

// ============================================================================
// EVENT & PLASTICITY PROCESSOR
// ============================================================================

/// Exponentially decaying trace, decayed lazily between events.
///
/// The closed form `value * exp(-(t - last_event) / tau)` replaces per-step
/// decay so plasticity matches the continuous dynamics at any firing rate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Trace {
    value: f64,
    last_event: f64,
}

impl Trace {
    fn new() -> Self {
        Self {
            value: 0.0,
            last_event: 0.0,
        }
    }

    fn decayed(&self, t: f64, tau: f64) -> f64 {
        self.value * (-(t - self.last_event) / tau).exp()
    }

    fn bump(&mut self, t: f64, tau: f64, amount: f64) {
        self.value = self.decayed(t, tau) + amount;
        self.last_event = t;
    }
}

/// Synapse behavior of a projection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProjectionKind {
    /// Presynaptic spikes add (or subtract) the weight to the target's
    /// synaptic input accumulator
    Current { inhibitory: bool },
    /// Presynaptic spikes kick the target potential by the weight directly
    Voltage,
    /// STDP with event-driven pre/post traces; weights are dimensionless in
    /// the clamp range, scaled to a PSP by the rule
    Plastic(StdpRule),
}

/// Population handle inside a [`Network`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopId(pub usize);

/// Poisson input handle inside a [`Network`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputId(pub usize);

/// Projection handle inside a [`Network`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjId(pub usize);

/// Presynaptic side of a projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    Population(PopId),
    Input(InputId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlasticState {
    tau_pre: f64,
    tau_post: f64,
    inc_pre: f64,
    inc_post: f64,
    w_min: f64,
    w_max: f64,
    psp: f64,
    a_pre: Vec<Trace>,
    a_post: Vec<Trace>,
}

/// Directed many-to-many connectivity between a source and a target
///
/// The (pre, post) pair list is immutable once the projection is added to a
/// network; weights are the only mutable pair state, and only the plasticity
/// processor touches them during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projection {
    pub name: String,
    pub source: Source,
    pub target: PopId,
    pairs: Vec<(u32, u32)>,
    weights: Vec<f64>,
    kind: ProjectionKind,
    plastic: Option<PlasticState>,
    pre_index: Vec<Vec<u32>>,
    post_index: Vec<Vec<u32>>,
}

impl Projection {
    pub fn new(name: &str, source: Source, target: PopId, kind: ProjectionKind) -> Self {
        Self {
            name: name.to_string(),
            source,
            target,
            pairs: Vec::new(),
            weights: Vec::new(),
            kind,
            plastic: None,
            pre_index: Vec::new(),
            post_index: Vec::new(),
        }
    }

    pub fn connect_pair(&mut self, pre: usize, post: usize) {
        self.pairs.push((pre as u32, post as u32));
        self.weights.push(0.0);
    }

    /// Connect each (pre, post) pair independently with probability `p`,
    /// drawing in row-major order
    pub fn connect_random<R: Rng>(&mut self, n_source: usize, n_target: usize, p: f64, rng: &mut R) {
        for i in 0..n_source {
            for j in 0..n_target {
                if rng.gen::<f64>() < p {
                    self.connect_pair(i, j);
                }
            }
        }
    }

    /// Ring-free local topology: each neuron reaches a fraction of its
    /// neighbors within `radius` plus a sparse fraction of distant neurons
    pub fn connect_local_distant<R: Rng>(
        &mut self,
        n: usize,
        radius: usize,
        local_fraction: f64,
        distant_fraction: f64,
        rng: &mut R,
    ) {
        for i in 0..n {
            let mut local: Vec<usize> = (i.saturating_sub(radius)..(i + radius + 1).min(n))
                .filter(|&j| j != i)
                .collect();
            let n_local = (local.len() as f64 * local_fraction) as usize;
            for &j in choose_subset(&mut local, n_local, rng).iter() {
                self.connect_pair(i, j);
            }

            let mut distant: Vec<usize> = (0..n)
                .filter(|&j| (j as i64 - i as i64).unsigned_abs() as usize > radius)
                .collect();
            let n_distant = (distant.len() as f64 * distant_fraction) as usize;
            for &j in choose_subset(&mut distant, n_distant, rng).iter() {
                self.connect_pair(i, j);
            }
        }
    }

    /// One-to-one wiring of a random subset covering `fraction` of the
    /// indices
    pub fn connect_one_to_one_subset<R: Rng>(&mut self, n: usize, fraction: f64, rng: &mut R) {
        let mut all: Vec<usize> = (0..n).collect();
        let k = (fraction * n as f64) as usize;
        for &i in choose_subset(&mut all, k, rng).iter() {
            self.connect_pair(i, i);
        }
    }

    fn weight_dimension(&self) -> Dimension {
        match self.kind {
            ProjectionKind::Plastic(_) => Dimension::Dimensionless,
            _ => Dimension::Voltage,
        }
    }

    /// Same weight on every pair
    pub fn set_weights_const(&mut self, w: Quantity) -> Result<()> {
        let si = w.expect(self.weight_dimension())?;
        for weight in self.weights.iter_mut() {
            *weight = si;
        }
        Ok(())
    }

    /// `scale * uniform(lo, hi)` per pair, drawn in pair order
    pub fn set_weights_scaled_uniform<R: Rng>(
        &mut self,
        scale: Quantity,
        lo: f64,
        hi: f64,
        rng: &mut R,
    ) -> Result<()> {
        let scale = scale.expect(self.weight_dimension())?;
        for weight in self.weights.iter_mut() {
            *weight = scale * (lo + (hi - lo) * rng.gen::<f64>());
        }
        Ok(())
    }

    /// Rescale plasticity amplitudes before a run; fails on a projection
    /// without plasticity parameters
    pub fn modulate_dopamine(&mut self, level: f64) -> Result<()> {
        match &mut self.kind {
            ProjectionKind::Plastic(rule) => {
                *rule = apply_dopamine(rule, level);
                if let Some(st) = self.plastic.as_mut() {
                    st.inc_pre *= 1.0 + level;
                    st.inc_post *= 1.0 + level;
                }
                Ok(())
            }
            _ => Err(SimError::Config(format!(
                "projection '{}' has no plasticity parameters to modulate",
                self.name
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(u32, u32)] {
        &self.pairs
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Freeze connectivity: validate bounds and build the per-neuron indexes
    fn freeze(&mut self, n_source: usize, n_target: usize) -> Result<()> {
        for &(pre, post) in &self.pairs {
            if pre as usize >= n_source || post as usize >= n_target {
                return Err(SimError::Config(format!(
                    "projection '{}' pair ({pre}, {post}) out of bounds for {n_source}x{n_target}",
                    self.name
                )));
            }
        }
        self.pre_index = vec![Vec::new(); n_source];
        self.post_index = vec![Vec::new(); n_target];
        for (sid, &(pre, post)) in self.pairs.iter().enumerate() {
            self.pre_index[pre as usize].push(sid as u32);
            self.post_index[post as usize].push(sid as u32);
        }
        if let ProjectionKind::Plastic(rule) = &self.kind {
            let tau_pre = rule.tau_pre.expect_positive(Dimension::Time)?;
            let tau_post = rule.tau_post.expect_positive(Dimension::Time)?;
            if rule.w_min >= rule.w_max {
                return Err(SimError::Config(format!(
                    "projection '{}' has an empty weight clamp range",
                    self.name
                )));
            }
            self.plastic = Some(PlasticState {
                tau_pre,
                tau_post,
                inc_pre: rule.a_pre,
                inc_post: rule.a_post,
                w_min: rule.w_min,
                w_max: rule.w_max,
                psp: rule.psp_per_weight.expect(Dimension::Voltage)?,
                a_pre: vec![Trace::new(); self.pairs.len()],
                a_post: vec![Trace::new(); self.pairs.len()],
            });
        }
        Ok(())
    }

    /// Apply presynaptic spikes (source indices ascending).
    ///
    /// Plastic synapses: PSP kick, bump the pre-trace, then add the decayed
    /// post-trace to the weight and clamp.
    fn deliver_pre(&mut self, spikes: &[usize], t: f64, target: &mut Population) {
        if let Some(st) = self.plastic.as_mut() {
            for &pre in spikes {
                for &sid in &self.pre_index[pre] {
                    let sid = sid as usize;
                    let post = self.pairs[sid].1 as usize;
                    target.v[post] += self.weights[sid] * st.psp;
                    st.a_pre[sid].bump(t, st.tau_pre, st.inc_pre);
                    let dw = st.a_post[sid].decayed(t, st.tau_post);
                    self.weights[sid] = (self.weights[sid] + dw).clamp(st.w_min, st.w_max);
                }
            }
        } else {
            let (sign, voltage_kick) = match self.kind {
                ProjectionKind::Current { inhibitory } => (if inhibitory { -1.0 } else { 1.0 }, false),
                _ => (1.0, true),
            };
            for &pre in spikes {
                for &sid in &self.pre_index[pre] {
                    let sid = sid as usize;
                    let post = self.pairs[sid].1 as usize;
                    if voltage_kick {
                        target.v[post] += self.weights[sid];
                    } else {
                        target.i_syn[post] += sign * self.weights[sid];
                    }
                }
            }
        }
    }

    /// Apply postsynaptic spikes: bump the post-trace, then add the decayed
    /// pre-trace to the weight and clamp. Runs after `deliver_pre` within a
    /// step, so a synapse seeing both events processes pre before post.
    fn deliver_post(&mut self, spikes: &[usize], t: f64) {
        if let Some(st) = self.plastic.as_mut() {
            for &post in spikes {
                for &sid in &self.post_index[post] {
                    let sid = sid as usize;
                    st.a_post[sid].bump(t, st.tau_post, st.inc_post);
                    let dw = st.a_pre[sid].decayed(t, st.tau_pre);
                    self.weights[sid] = (self.weights[sid] + dw).clamp(st.w_min, st.w_max);
                }
            }
        }
    }
}

/// Partial Fisher-Yates draw of `k` distinct elements, returned ascending
fn choose_subset<R: Rng>(pool: &mut Vec<usize>, k: usize, rng: &mut R) -> Vec<usize> {
    let k = k.min(pool.len());
    for idx in 0..k {
        let j = rng.gen_range(idx..pool.len());
        pool.swap(idx, j);
    }
    let mut chosen = pool[..k].to_vec();
    chosen.sort_unstable();
    chosen
}

// ============================================================================
// NEUROMODULATION ADJUSTER
// ============================================================================

/// Resting-potential shift per unit of acetylcholine level (5 mV)
const ACH_REST_SHIFT_V: f64 = 5e-3;

/// Dopamine rescales both STDP amplitudes by `1 + level`
pub fn apply_dopamine(rule: &StdpRule, level: f64) -> StdpRule {
    let mut modulated = *rule;
    modulated.a_pre = rule.a_pre * (1.0 + level);
    modulated.a_post = rule.a_post * (1.0 + level);
    modulated
}

/// Acetylcholine shifts the resting potential by `level * 5 mV`
pub fn apply_acetylcholine(model: &NeuronModel, level: f64) -> NeuronModel {
    let base = model.resting_potential().to_si();
    model.with_resting_potential(Quantity::new(
        base + level * ACH_REST_SHIFT_V,
        spikefit_core::Unit::Volt,
    ))
}

// ============================================================================
// NETWORK & MONITORS
// ============================================================================

/// State-variable recording for a designated subset of neurons
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMonitor {
    pub indices: Vec<usize>,
    pub times: Vec<f64>,
    /// `v[k][step]` for observed neuron `k`
    pub v: Vec<Vec<f64>>,
    /// `i_syn[k][step]` for observed neuron `k`
    pub i_syn: Vec<Vec<f64>>,
}

impl StateMonitor {
    fn new(indices: Vec<usize>) -> Self {
        let k = indices.len();
        Self {
            indices,
            times: Vec::new(),
            v: vec![Vec::new(); k],
            i_syn: vec![Vec::new(); k],
        }
    }

    fn record(&mut self, t: f64, pop: &Population) {
        self.times.push(t);
        for (k, &i) in self.indices.iter().enumerate() {
            self.v[k].push(pop.v[i]);
            self.i_syn[k].push(pop.i_syn[i]);
        }
    }
}

/// A complete simulation: populations, inputs, projections and recordings
///
/// One global clock advances in fixed steps. Within a step: Poisson inputs
/// fire and deliver (declaration order), populations integrate (declaration
/// order), then recurrent projections deliver (declaration order, pre-events
/// before post-events per projection). Events are stamped with the post-step
/// clock, so global ordering is (time, population order, neuron index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    dt: f64,
    populations: Vec<Population>,
    inputs: Vec<PoissonInput>,
    projections: Vec<Projection>,
    spike_records: Vec<Vec<SpikeEvent>>,
    state_monitors: Vec<Option<StateMonitor>>,
    step: u64,
}

impl Network {
    pub fn new(dt: Quantity) -> Result<Self> {
        let dt = dt.expect_positive(Dimension::Time)?;
        Ok(Self {
            dt,
            populations: Vec::new(),
            inputs: Vec::new(),
            projections: Vec::new(),
            spike_records: Vec::new(),
            state_monitors: Vec::new(),
            step: 0,
        })
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Simulated time so far (seconds)
    pub fn time(&self) -> f64 {
        self.step as f64 * self.dt
    }

    pub fn add_population(&mut self, pop: Population) -> Result<PopId> {
        if pop.dt() != self.dt {
            return Err(SimError::Config(format!(
                "population '{}' compiled for dt {} but the network runs at {}",
                pop.name,
                pop.dt(),
                self.dt
            )));
        }
        self.populations.push(pop);
        self.spike_records.push(Vec::new());
        self.state_monitors.push(None);
        Ok(PopId(self.populations.len() - 1))
    }

    pub fn add_input(&mut self, input: PoissonInput) -> InputId {
        self.inputs.push(input);
        InputId(self.inputs.len() - 1)
    }

    /// Freeze and register a projection; connectivity is immutable afterwards
    pub fn add_projection(&mut self, mut proj: Projection) -> Result<ProjId> {
        let n_source = match proj.source {
            Source::Population(PopId(i)) => {
                self.populations
                    .get(i)
                    .ok_or_else(|| SimError::Config(format!("unknown source population {i}")))?
                    .n
            }
            Source::Input(InputId(i)) => {
                self.inputs
                    .get(i)
                    .ok_or_else(|| SimError::Config(format!("unknown input {i}")))?
                    .n
            }
        };
        let n_target = self
            .populations
            .get(proj.target.0)
            .ok_or_else(|| SimError::Config(format!("unknown target population {}", proj.target.0)))?
            .n;
        proj.freeze(n_source, n_target)?;
        self.projections.push(proj);
        Ok(ProjId(self.projections.len() - 1))
    }

    pub fn population(&self, id: PopId) -> &Population {
        &self.populations[id.0]
    }

    pub fn population_mut(&mut self, id: PopId) -> &mut Population {
        &mut self.populations[id.0]
    }

    pub fn projection(&self, id: ProjId) -> &Projection {
        &self.projections[id.0]
    }

    pub fn projection_mut(&mut self, id: ProjId) -> &mut Projection {
        &mut self.projections[id.0]
    }

    /// Record v and i_syn for a subset of one population's neurons
    pub fn monitor_state(&mut self, id: PopId, indices: Vec<usize>) -> Result<()> {
        let n = self.populations[id.0].n;
        if let Some(&bad) = indices.iter().find(|&&i| i >= n) {
            return Err(SimError::Config(format!(
                "monitor index {bad} out of bounds for population of {n}"
            )));
        }
        self.state_monitors[id.0] = Some(StateMonitor::new(indices));
        Ok(())
    }

    pub fn spikes(&self, id: PopId) -> &[SpikeEvent] {
        &self.spike_records[id.0]
    }

    /// Spike times per neuron, including silent neurons, keyed by index
    pub fn spike_trains(&self, id: PopId) -> BTreeMap<u64, Vec<f64>> {
        let mut trains: BTreeMap<u64, Vec<f64>> = BTreeMap::new();
        for i in 0..self.populations[id.0].n {
            trains.insert(i as u64, Vec::new());
        }
        for event in &self.spike_records[id.0] {
            if let Some(train) = trains.get_mut(&(event.neuron as u64)) {
                train.push(event.time);
            }
        }
        trains
    }

    /// Mean firing rate across the population (Hz)
    pub fn mean_rate(&self, id: PopId) -> f64 {
        let t = self.time();
        let n = self.populations[id.0].n;
        if t <= 0.0 || n == 0 {
            return 0.0;
        }
        self.spike_records[id.0].len() as f64 / (n as f64 * t)
    }

    pub fn state_monitor(&self, id: PopId) -> Option<&StateMonitor> {
        self.state_monitors[id.0].as_ref()
    }

    /// Advance the whole network for `duration`. All-or-nothing: a
    /// divergence aborts the run and no partial results should be trusted.
    pub fn run<R: Rng>(&mut self, duration: Quantity, rng: &mut R) -> Result<()> {
        let duration = duration.expect_positive(Dimension::Time)?;
        let n_steps = (duration / self.dt).ceil() as u64;
        tracing::info!(steps = n_steps, dt = self.dt, "starting simulation run");
        for _ in 0..n_steps {
            self.advance(rng)?;
        }
        Ok(())
    }

    fn advance<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        let t_start = self.step as f64 * self.dt;
        let t_spike = t_start + self.dt;

        // Poisson draws, declaration order, before any membrane noise
        let mut input_spikes: Vec<Vec<usize>> = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            input_spikes.push(input.sample(t_start, self.dt, rng));
        }

        // Input drive lands before integration so it is visible this step
        for proj in self.projections.iter_mut() {
            if let Source::Input(InputId(src)) = proj.source {
                let target = proj.target.0;
                proj.deliver_pre(&input_spikes[src], t_spike, &mut self.populations[target]);
            }
        }

        let mut pop_spikes: Vec<Vec<usize>> = Vec::with_capacity(self.populations.len());
        for pop in self.populations.iter_mut() {
            pop_spikes.push(pop.step(self.step, rng)?);
        }

        for proj in self.projections.iter_mut() {
            if let Source::Population(PopId(src)) = proj.source {
                let target = proj.target.0;
                proj.deliver_pre(&pop_spikes[src], t_spike, &mut self.populations[target]);
                proj.deliver_post(&pop_spikes[target], t_spike);
            }
        }

        for (p, spikes) in pop_spikes.iter().enumerate() {
            for &i in spikes {
                self.spike_records[p].push(SpikeEvent::new(i, t_spike));
            }
            if let Some(mon) = self.state_monitors[p].as_mut() {
                mon.record(t_spike, &self.populations[p]);
            }
        }

        self.step += 1;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use spikefit_core::{hz, ms, mv, na, seconds};

    fn rng(seed: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(seed)
    }

    #[test]
    fn resting_neuron_stays_at_rest() {
        let mut net = Network::new(ms(0.1)).unwrap();
        let pop = net
            .add_population(Population::new("lif", 3, &NeuronModel::Lif(LifParams::default()), 1e-4).unwrap())
            .unwrap();
        net.run(seconds(1.0), &mut rng(1)).unwrap();

        assert!(net.spikes(pop).is_empty());
        for &v in net.population(pop).v.iter() {
            assert!((v - (-0.070)).abs() < 1e-12);
        }
    }

    #[test]
    fn constant_drive_matches_closed_form_rate() {
        // target = rest + 30 mV = -40 mV; from reset -65 mV the crossing of
        // -50 mV takes tau * ln(25/10) = 9.163 ms, plus 5 ms refractory.
        let mut net = Network::new(ms(0.1)).unwrap();
        let mut pop = Population::new("lif", 1, &NeuronModel::Lif(LifParams::default()), 1e-4).unwrap();
        pop.set_constant_drive(mv(30.0)).unwrap();
        let pop = net.add_population(pop).unwrap();
        net.run(seconds(2.0), &mut rng(2)).unwrap();

        let rate = net.mean_rate(pop);
        let expected = 1.0 / (0.009163 + 0.005);
        assert!(
            (rate - expected).abs() < 5.0,
            "rate {rate} far from closed form {expected}"
        );

        // Never two spikes within the refractory window
        let times: Vec<f64> = net.spikes(pop).iter().map(|e| e.time).collect();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= 0.005 - 1e-12);
        }
    }

    #[test]
    fn signal_drive_matches_constant_drive() {
        let run = |use_signal: bool| {
            let mut net = Network::new(ms(0.1)).unwrap();
            let mut pop = Population::new("lif", 1, &NeuronModel::Lif(LifParams::default()), 1e-4).unwrap();
            if use_signal {
                let flat = TimedSignal {
                    dt: 1e-3,
                    values: vec![1.0; 1000],
                };
                pop.set_signal_drive(mv(30.0), flat).unwrap();
            } else {
                pop.set_constant_drive(mv(30.0)).unwrap();
            }
            let pop = net.add_population(pop).unwrap();
            net.run(seconds(1.0), &mut rng(6)).unwrap();
            net.spikes(pop).to_vec()
        };
        assert_eq!(run(true), run(false));
    }

    #[test]
    fn subthreshold_drive_never_spikes() {
        let mut net = Network::new(ms(0.1)).unwrap();
        let mut pop = Population::new("lif", 1, &NeuronModel::Lif(LifParams::default()), 1e-4).unwrap();
        pop.set_constant_drive(mv(15.0)).unwrap(); // target -55 mV < threshold
        let pop = net.add_population(pop).unwrap();
        net.run(seconds(1.0), &mut rng(3)).unwrap();
        assert!(net.spikes(pop).is_empty());
    }

    #[test]
    fn adex_spikes_and_adapts_under_current() {
        let mut net = Network::new(ms(0.1)).unwrap();
        let mut pop = Population::new("adex", 1, &NeuronModel::Adex(AdexParams::default()), 1e-4).unwrap();
        pop.set_constant_drive(na(0.8)).unwrap();
        let pop = net.add_population(pop).unwrap();
        net.run(seconds(0.5), &mut rng(4)).unwrap();

        assert!(!net.spikes(pop).is_empty());
        // Spike-triggered increments leave the adaptation current positive
        assert!(net.population(pop).w[0] > 0.0);
    }

    #[test]
    fn adaptation_decays_while_refractory() {
        let mut pop =
            Population::new("exc", 1, &NeuronModel::Excitatory(NetworkParams::default()), 1e-4).unwrap();
        let mut r = rng(11);

        // Force a spike: potential just above threshold, no noise
        pop.v[0] = -0.045;
        let spikes = pop.step(0, &mut r).unwrap();
        assert_eq!(spikes, vec![0]);
        let w0 = pop.w[0];
        assert!((w0 - 0.003).abs() < 1e-12, "adaptation kick missing: {w0}");

        // Next step is refractory: v held at reset, w decays one Euler step
        let spikes = pop.step(1, &mut r).unwrap();
        assert!(spikes.is_empty());
        assert!((pop.v[0] - (-0.070)).abs() < 1e-12);
        let expected = w0 * (1.0 - 1e-4 / 0.080);
        assert!(
            (pop.w[0] - expected).abs() < 1e-12,
            "w frozen through refractory: {} vs {}",
            pop.w[0],
            expected
        );
    }

    #[test]
    fn divergence_is_detected() {
        let mut net = Network::new(ms(0.1)).unwrap();
        let pop = net
            .add_population(Population::new("adex", 1, &NeuronModel::Adex(AdexParams::default()), 1e-4).unwrap())
            .unwrap();
        // Drive v far past threshold: the exponential term overflows
        net.population_mut(pop).v[0] = 5.0;
        let err = net.run(seconds(0.01), &mut rng(5)).unwrap_err();
        match err {
            SimError::NumericalDivergence { population, .. } => assert_eq!(population, "adex"),
            other => panic!("expected divergence, got {other}"),
        }
    }

    #[test]
    fn unit_mismatch_fails_at_construction() {
        let params = LifParams {
            tau_m: mv(10.0), // voltage where time is required
            ..LifParams::default()
        };
        assert!(NeuronModel::Lif(params).compile(1e-4).is_err());
    }

    #[test]
    fn nonpositive_time_constant_rejected() {
        let params = LifParams {
            tau_m: ms(0.0),
            ..LifParams::default()
        };
        assert!(NeuronModel::Lif(params).compile(1e-4).is_err());
    }

    #[test]
    fn identical_seeds_give_identical_spike_times() {
        let build_and_run = |seed: u64| {
            let mut r = rng(seed);
            let mut net = Network::new(ms(1.0)).unwrap();
            let mut exc =
                Population::new("exc", 40, &NeuronModel::Excitatory(NetworkParams::default()), 1e-3).unwrap();
            exc.set_noise(mv(4.5)).unwrap();
            exc.init_gaussian(mv(8.0), &mut r).unwrap();
            let exc = net.add_population(exc).unwrap();

            let mut inh =
                Population::new("inh", 10, &NeuronModel::Inhibitory(NetworkParams::default()), 1e-3).unwrap();
            inh.set_noise(mv(3.0)).unwrap();
            inh.init_gaussian(mv(6.0), &mut r).unwrap();
            let inh = net.add_population(inh).unwrap();

            let mut ei = Projection::new(
                "ei",
                Source::Population(exc),
                inh,
                ProjectionKind::Current { inhibitory: false },
            );
            ei.connect_random(40, 10, 0.4, &mut r);
            ei.set_weights_scaled_uniform(mv(0.9), 0.8, 1.2, &mut r).unwrap();
            net.add_projection(ei).unwrap();

            let mut ie = Projection::new(
                "ie",
                Source::Population(inh),
                exc,
                ProjectionKind::Current { inhibitory: true },
            );
            ie.connect_random(10, 40, 0.6, &mut r);
            ie.set_weights_const(mv(1.8)).unwrap();
            net.add_projection(ie).unwrap();

            let mut input = PoissonInput::new("drive", 40, hz(600.0)).unwrap();
            let theta = TimedSignal::oscillatory(hz(6.0), seconds(1.0), 0.1, &mut r).unwrap();
            input.add_modulator(hz(200.0), theta).unwrap();
            let input = net.add_input(input);

            let mut drive = Projection::new("drive", Source::Input(input), exc, ProjectionKind::Voltage);
            drive.connect_one_to_one_subset(40, 0.8, &mut r);
            drive.set_weights_const(mv(1.5)).unwrap();
            net.add_projection(drive).unwrap();

            net.run(seconds(1.0), &mut r).unwrap();
            net.spikes(exc).to_vec()
        };

        let a = build_and_run(42);
        let b = build_and_run(42);
        assert!(!a.is_empty(), "test network should actually spike");
        assert_eq!(a, b);
    }

    #[test]
    fn trace_decay_matches_closed_form() {
        let mut trace = Trace::new();
        let tau = 0.020;
        trace.bump(0.1, tau, 1.0);
        let v = trace.decayed(0.1375, tau);
        assert!((v - (-0.0375f64 / tau).exp()).abs() < 1e-12);

        trace.bump(0.1375, tau, 0.5);
        assert!((trace.value - ((-0.0375f64 / tau).exp() + 0.5)).abs() < 1e-12);
    }

    #[test]
    fn plastic_weight_stays_clamped() {
        let mut net = Network::new(ms(1.0)).unwrap();
        let pre = net
            .add_population(Population::new("pre", 1, &NeuronModel::Lif(LifParams::default()), 1e-3).unwrap())
            .unwrap();
        let post = net
            .add_population(Population::new("post", 1, &NeuronModel::Lif(LifParams::default()), 1e-3).unwrap())
            .unwrap();

        let rule = StdpRule {
            a_pre: 0.4,
            a_post: -0.5,
            ..StdpRule::default()
        };
        let mut proj = Projection::new("plastic", Source::Population(pre), post, ProjectionKind::Plastic(rule));
        proj.connect_pair(0, 0);
        proj.set_weights_const(Quantity::new(0.5, spikefit_core::Unit::Dimensionless))
            .unwrap();
        let proj = net.add_projection(proj).unwrap();

        // Rapid alternating pre/post events at sub-millisecond spacing
        let mut t = 0.0;
        for k in 0..200 {
            t += 0.0004;
            let target = &mut net.populations[1];
            if k % 2 == 0 {
                net.projections[proj.0].deliver_pre(&[0], t, target);
            } else {
                net.projections[proj.0].deliver_post(&[0], t);
            }
            let w = net.projection(proj).weights()[0];
            assert!((0.0..=1.0).contains(&w), "weight {w} escaped the clamp");
        }
    }

    #[test]
    fn dopamine_scales_learning_rates() {
        let rule = StdpRule::default();
        let modulated = apply_dopamine(&rule, 0.5);
        assert!((modulated.a_pre - 0.015).abs() < 1e-12);
        assert!((modulated.a_post - (-0.01575)).abs() < 1e-12);
    }

    #[test]
    fn dopamine_rejects_static_projection() {
        let mut proj = Projection::new(
            "static",
            Source::Population(PopId(0)),
            PopId(0),
            ProjectionKind::Current { inhibitory: false },
        );
        assert!(proj.modulate_dopamine(0.5).is_err());
    }

    #[test]
    fn acetylcholine_shifts_rest() {
        let model = NeuronModel::Lif(LifParams::default());
        let shifted = apply_acetylcholine(&model, 1.0);
        assert!((shifted.resting_potential().to_si() - (-0.065)).abs() < 1e-12);
    }

    #[test]
    fn oscillatory_stimulus_is_nonnegative_and_reproducible() {
        let a = TimedSignal::oscillatory(hz(6.0), seconds(1.0), 0.1, &mut rng(7)).unwrap();
        let b = TimedSignal::oscillatory(hz(6.0), seconds(1.0), 0.1, &mut rng(7)).unwrap();
        assert_eq!(a.values, b.values);
        assert_eq!(a.values.len(), 1000);
        assert!(a.values.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn binary_sequence_lookup_is_piecewise_constant() {
        let signal = TimedSignal::binary_sequence(seconds(1.0), 10, &mut rng(8)).unwrap();
        assert_eq!(signal.values.len(), 10);
        assert!(signal.values.iter().all(|&v| v == 0.0 || v == 1.0));
        // Any time inside a segment returns that segment's value
        assert_eq!(signal.value_at(0.05), signal.values[0]);
        assert_eq!(signal.value_at(0.35), signal.values[3]);
        // Past the end the last sample holds
        assert_eq!(signal.value_at(5.0), signal.values[9]);
    }

    #[test]
    fn poisson_input_is_reproducible() {
        let input = PoissonInput::new("in", 50, hz(100.0)).unwrap();
        let a: Vec<Vec<usize>> = {
            let mut r = rng(9);
            (0..100).map(|k| input.sample(k as f64 * 1e-3, 1e-3, &mut r)).collect()
        };
        let b: Vec<Vec<usize>> = {
            let mut r = rng(9);
            (0..100).map(|k| input.sample(k as f64 * 1e-3, 1e-3, &mut r)).collect()
        };
        assert_eq!(a, b);
        assert!(a.iter().any(|s| !s.is_empty()));
    }

    #[test]
    fn zero_rate_poisson_never_fires() {
        let input = PoissonInput::new("in", 50, hz(0.0)).unwrap();
        let mut r = rng(10);
        for k in 0..100 {
            assert!(input.sample(k as f64 * 1e-3, 1e-3, &mut r).is_empty());
        }
    }
}
