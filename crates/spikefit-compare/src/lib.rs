//! # SpikeFit Compare
//!
//! The reference-data contract and the comparison orchestrator: run one
//! simulated excitatory/inhibitory network, fetch one empirical recording,
//! put both through the same analysis pipeline, and assemble a unified
//! comparison record.
//!
//! Missing reference data is fatal to an orchestration (there is nothing to
//! compare against); analysis gaps are not, and surface as `None` fields in
//! the record.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use spikefit_analysis::{
    band_power_decomposition, classify_state, isi_intervals, ks_two_sample, lfp_from_currents,
    CognitiveState, KsResult,
};
use spikefit_core::{hz, ms, mv, seconds, Quantity};
use spikefit_sim::{
    apply_acetylcholine, Network, NetworkParams, NeuronModel, PoissonInput, Population,
    Projection, ProjectionKind, SimError, Source, StdpRule, TimedSignal,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompareError {
    #[error("Reference data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Malformed reference data: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Sim(#[from] SimError),
}

pub type Result<T> = std::result::Result<T, CompareError>;

// ============================================================================
// REFERENCE DATA CONTRACT
// ============================================================================

/// Opaque identifier of one recording session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

/// One probe's worth of empirical data, read-only for the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDataset {
    /// Mean single-unit firing rate (Hz)
    pub mean_firing_rate: f64,
    /// Across-unit standard deviation of the firing rate (Hz)
    pub std_firing_rate: f64,
    /// Ordered spike times per unit (seconds)
    pub spike_times: BTreeMap<u64, Vec<f64>>,
    /// Raw LFP trace
    pub lfp: Vec<f64>,
    /// LFP sampling rate (Hz)
    pub lfp_sampling_rate: f64,
}

impl ReferenceDataset {
    /// Reject datasets the pipeline cannot compare against
    fn validate(&self) -> Result<()> {
        if self.spike_times.is_empty() {
            return Err(CompareError::DataUnavailable("no spike trains in dataset".into()));
        }
        if self.lfp.is_empty() {
            return Err(CompareError::DataUnavailable("no LFP trace in dataset".into()));
        }
        if !(self.lfp_sampling_rate > 0.0) {
            return Err(CompareError::DataUnavailable(format!(
                "invalid LFP sampling rate {}",
                self.lfp_sampling_rate
            )));
        }
        Ok(())
    }
}

/// The external empirical-data collaborator, one-shot and synchronous.
///
/// A failed fetch is `DataUnavailable` and ends the orchestration; the
/// pipeline never retries.
pub trait ReferenceProvider {
    fn session(&self) -> Result<SessionHandle>;
    fn probe_summary(&self, session: &SessionHandle) -> Result<ReferenceDataset>;
}

/// Reference data from a JSON file on disk
#[derive(Debug, Clone)]
pub struct JsonFileProvider {
    path: PathBuf,
}

impl JsonFileProvider {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ReferenceProvider for JsonFileProvider {
    fn session(&self) -> Result<SessionHandle> {
        if !self.path.exists() {
            return Err(CompareError::DataUnavailable(format!(
                "reference file not found: {}",
                self.path.display()
            )));
        }
        Ok(SessionHandle(self.path.display().to_string()))
    }

    fn probe_summary(&self, session: &SessionHandle) -> Result<ReferenceDataset> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| CompareError::DataUnavailable(format!("{}: {e}", session.0)))?;
        let dataset: ReferenceDataset = serde_json::from_str(&raw)?;
        dataset.validate()?;
        Ok(dataset)
    }
}

// ============================================================================
// SIMULATION CONFIGURATION
// ============================================================================

/// Recognized run parameters for the excitatory/inhibitory network.
///
/// Defaults reproduce the canonical 150-neuron configuration. All
/// randomness flows from `seed` through one generator in a fixed order:
/// membrane init, adaptation constants, connectivity and weights per
/// projection in declaration order, input wiring, then the run itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub n_exc: usize,
    pub n_inh: usize,
    pub dt: Quantity,
    pub duration: Quantity,
    pub seed: u64,
    /// Base synaptic weight; every projection scales off this
    pub weight_scale: Quantity,
    pub local_radius: usize,
    pub p_local: f64,
    pub p_distant: f64,
    pub p_exc_inh: f64,
    pub p_inh_exc: f64,
    pub p_inh_inh: f64,
    /// Fraction of excitatory neurons wired one-to-one to the Poisson drive
    pub input_fraction: f64,
    /// Input kick as a multiple of `weight_scale`
    pub input_kick_factor: f64,
    pub sigma_exc: Quantity,
    pub sigma_inh: Quantity,
    pub init_sd_exc: Quantity,
    pub init_sd_inh: Quantity,
    pub tau_w_mean: Quantity,
    pub tau_w_sd: Quantity,
    pub tau_w_min: Quantity,
    pub tau_w_max: Quantity,
    /// Theta-band modulation of the input rate (gain in Hz, frequency)
    pub theta_gain: Quantity,
    pub theta_freq: Quantity,
    /// STDP on the recurrent excitatory projection instead of fixed weights
    pub plastic_exc_exc: bool,
    pub stdp: StdpRule,
    /// Dopamine level rescaling the STDP amplitudes (needs plasticity)
    pub dopamine: f64,
    /// Acetylcholine level shifting resting potentials
    pub acetylcholine: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            n_exc: 120,
            n_inh: 30,
            dt: ms(0.1),
            duration: seconds(2.0),
            seed: 42,
            weight_scale: mv(0.6),
            local_radius: 10,
            p_local: 0.3,
            p_distant: 0.05,
            p_exc_inh: 0.4,
            p_inh_exc: 0.6,
            p_inh_inh: 0.2,
            input_fraction: 0.8,
            input_kick_factor: 1.2,
            sigma_exc: mv(4.5),
            sigma_inh: mv(3.0),
            init_sd_exc: mv(8.0),
            init_sd_inh: mv(6.0),
            tau_w_mean: ms(80.0),
            tau_w_sd: ms(40.0),
            tau_w_min: ms(20.0),
            tau_w_max: ms(200.0),
            theta_gain: hz(0.0),
            theta_freq: hz(6.0),
            plastic_exc_exc: false,
            stdp: StdpRule::default(),
            dopamine: 0.0,
            acetylcholine: 0.0,
        }
    }
}

/// Number of excitatory neurons whose synaptic input feeds the LFP proxy
const LFP_SUBSET: usize = 50;

/// Spike trains and LFP proxy from one completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedActivity {
    pub trains: BTreeMap<u64, Vec<f64>>,
    pub mean_firing_rate: f64,
    pub lfp: Vec<f64>,
    pub lfp_sampling_rate: f64,
}

/// Build and run the network, driving the excitatory population with
/// Poisson input at `input_rate`.
pub fn run_simulation(config: &SimConfig, input_rate: Quantity) -> Result<SimulatedActivity> {
    if config.dopamine != 0.0 && !config.plastic_exc_exc {
        return Err(SimError::Config(
            "dopamine modulation requires the plastic excitatory projection".into(),
        )
        .into());
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut net = Network::new(config.dt)?;
    let dt = net.dt();

    let mut exc_model = NeuronModel::Excitatory(NetworkParams::default());
    let mut inh_model = NeuronModel::Inhibitory(NetworkParams::default());
    if config.acetylcholine != 0.0 {
        exc_model = apply_acetylcholine(&exc_model, config.acetylcholine);
        inh_model = apply_acetylcholine(&inh_model, config.acetylcholine);
    }

    let mut exc = Population::new("exc", config.n_exc, &exc_model, dt)?;
    exc.set_noise(config.sigma_exc)?;
    exc.init_gaussian(config.init_sd_exc, &mut rng)?;
    exc.randomize_tau_w(
        config.tau_w_mean,
        config.tau_w_sd,
        config.tau_w_min,
        config.tau_w_max,
        &mut rng,
    )?;
    let exc = net.add_population(exc)?;

    let mut inh = Population::new("inh", config.n_inh, &inh_model, dt)?;
    inh.set_noise(config.sigma_inh)?;
    inh.init_gaussian(config.init_sd_inh, &mut rng)?;
    let inh = net.add_population(inh)?;

    let scale = config.weight_scale;

    // Recurrent excitation: dense locally, sparse at distance
    let ee_kind = if config.plastic_exc_exc {
        ProjectionKind::Plastic(config.stdp)
    } else {
        ProjectionKind::Current { inhibitory: false }
    };
    let mut ee = Projection::new("exc->exc", Source::Population(exc), exc, ee_kind);
    ee.connect_local_distant(
        config.n_exc,
        config.local_radius,
        config.p_local,
        config.p_distant,
        &mut rng,
    );
    if config.plastic_exc_exc {
        ee.set_weights_scaled_uniform(
            Quantity::new(1.0, spikefit_core::Unit::Dimensionless),
            0.0,
            1.0,
            &mut rng,
        )?;
        if config.dopamine != 0.0 {
            ee.modulate_dopamine(config.dopamine)?;
        }
    } else {
        ee.set_weights_scaled_uniform(scale, 0.5, 1.0, &mut rng)?;
    }
    net.add_projection(ee)?;

    let mut ei = Projection::new(
        "exc->inh",
        Source::Population(exc),
        inh,
        ProjectionKind::Current { inhibitory: false },
    );
    ei.connect_random(config.n_exc, config.n_inh, config.p_exc_inh, &mut rng);
    ei.set_weights_scaled_uniform(scale.scaled(1.5), 0.8, 1.2, &mut rng)?;
    net.add_projection(ei)?;

    let mut ie = Projection::new(
        "inh->exc",
        Source::Population(inh),
        exc,
        ProjectionKind::Current { inhibitory: true },
    );
    ie.connect_random(config.n_inh, config.n_exc, config.p_inh_exc, &mut rng);
    ie.set_weights_scaled_uniform(scale.scaled(3.0), 0.7, 1.3, &mut rng)?;
    net.add_projection(ie)?;

    let mut ii = Projection::new(
        "inh->inh",
        Source::Population(inh),
        inh,
        ProjectionKind::Current { inhibitory: true },
    );
    ii.connect_random(config.n_inh, config.n_inh, config.p_inh_inh, &mut rng);
    ii.set_weights_const(scale.scaled(2.0))?;
    net.add_projection(ii)?;

    // Poisson drive, optionally theta-modulated, one-to-one into a random
    // excitatory subset
    let mut drive = PoissonInput::new("drive", config.n_exc, input_rate)?;
    if config.theta_gain.to_si() > 0.0 {
        let theta = TimedSignal::oscillatory(config.theta_freq, config.duration, 0.1, &mut rng)?;
        drive.add_modulator(config.theta_gain, theta)?;
    }
    let drive = net.add_input(drive);
    let mut input = Projection::new("drive->exc", Source::Input(drive), exc, ProjectionKind::Voltage);
    input.connect_one_to_one_subset(config.n_exc, config.input_fraction, &mut rng);
    input.set_weights_const(scale.scaled(config.input_kick_factor))?;
    net.add_projection(input)?;

    let observed = (0..config.n_exc.min(LFP_SUBSET)).collect();
    net.monitor_state(exc, observed)?;

    net.run(config.duration, &mut rng)?;

    let lfp = match net.state_monitor(exc) {
        Some(monitor) => lfp_from_currents(&monitor.i_syn),
        None => Vec::new(),
    };

    tracing::info!(
        exc_rate = net.mean_rate(exc),
        inh_rate = net.mean_rate(inh),
        "simulation finished"
    );

    Ok(SimulatedActivity {
        trains: net.spike_trains(exc),
        mean_firing_rate: net.mean_rate(exc),
        lfp,
        lfp_sampling_rate: 1.0 / dt,
    })
}

// ============================================================================
// COMPARISON RECORD
// ============================================================================

/// Per-side statistics of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub mean_firing_rate: f64,
    /// Pooled inter-spike intervals after the silence cutoff
    pub isi: Vec<f64>,
    /// Canonical band powers of the LFP, absent when the trace is too short
    pub band_powers: Option<BTreeMap<String, f64>>,
    pub cognitive_state: CognitiveState,
}

fn summarize(
    trains: &BTreeMap<u64, Vec<f64>>,
    mean_firing_rate: f64,
    lfp: &[f64],
    fs: f64,
) -> ActivitySummary {
    let band_powers = band_power_decomposition(lfp, fs);
    let theta = band_powers.as_ref().map(|b| b["theta"]);
    let gamma = band_powers.as_ref().map(|b| b["gamma"]);
    ActivitySummary {
        mean_firing_rate,
        isi: isi_intervals(trains),
        band_powers,
        cognitive_state: classify_state(theta, gamma, mean_firing_rate),
    }
}

/// The unified outcome of one simulation-vs-reference comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRecord {
    pub simulated: ActivitySummary,
    pub reference: ActivitySummary,
    /// KS test between the two ISI distributions, absent when either is empty
    pub ks: Option<KsResult>,
}

/// Run one simulation, fetch the reference recording, and compare.
///
/// The Poisson drive rate is taken from the reference mean firing rate so
/// the simulation sees input statistics matched to the recording.
pub fn compare<P: ReferenceProvider>(config: &SimConfig, provider: &P) -> Result<ComparisonRecord> {
    let session = provider.session()?;
    let reference = provider.probe_summary(&session)?;
    reference.validate()?;

    let simulated = run_simulation(config, hz(reference.mean_firing_rate))?;

    let sim_summary = summarize(
        &simulated.trains,
        simulated.mean_firing_rate,
        &simulated.lfp,
        simulated.lfp_sampling_rate,
    );
    let ref_summary = summarize(
        &reference.spike_times,
        reference.mean_firing_rate,
        &reference.lfp,
        reference.lfp_sampling_rate,
    );

    let ks = ks_two_sample(&sim_summary.isi, &ref_summary.isi);

    Ok(ComparisonRecord {
        simulated: sim_summary,
        reference: ref_summary,
        ks,
    })
}

/// Comparison across dopamine levels, one independently seeded run each,
/// keyed by the formatted level
pub fn compare_sweep<P: ReferenceProvider>(
    config: &SimConfig,
    dopamine_levels: &[f64],
    provider: &P,
) -> Result<BTreeMap<String, ComparisonRecord>> {
    let mut records = BTreeMap::new();
    for &level in dopamine_levels {
        let mut condition = config.clone();
        condition.dopamine = level;
        let record = compare(&condition, provider)?;
        records.insert(format!("dopamine_{level:.2}"), record);
    }
    Ok(records)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory collaborator with a synthetic 6 Hz theta recording
    struct FixtureProvider {
        dataset: ReferenceDataset,
    }

    impl FixtureProvider {
        fn new() -> Self {
            let mut spike_times = BTreeMap::new();
            // Two regular units at 10 Hz and 8 Hz
            spike_times.insert(0u64, (0..20).map(|k| k as f64 * 0.1).collect());
            spike_times.insert(1u64, (0..16).map(|k| k as f64 * 0.125).collect());

            let fs = 1000.0;
            let lfp: Vec<f64> = (0..4000)
                .map(|k| (2.0 * std::f64::consts::PI * 6.0 * k as f64 / fs).sin())
                .collect();

            Self {
                dataset: ReferenceDataset {
                    mean_firing_rate: 250.0,
                    std_firing_rate: 3.0,
                    spike_times,
                    lfp,
                    lfp_sampling_rate: fs,
                },
            }
        }
    }

    impl ReferenceProvider for FixtureProvider {
        fn session(&self) -> Result<SessionHandle> {
            Ok(SessionHandle("fixture".into()))
        }

        fn probe_summary(&self, _session: &SessionHandle) -> Result<ReferenceDataset> {
            Ok(self.dataset.clone())
        }
    }

    /// Small fast network that reliably fires under the fixture's drive
    fn test_config() -> SimConfig {
        SimConfig {
            n_exc: 40,
            n_inh: 10,
            dt: ms(1.0),
            duration: seconds(2.0),
            weight_scale: mv(4.0),
            p_inh_exc: 0.2,
            ..SimConfig::default()
        }
    }

    #[test]
    fn comparison_record_is_fully_populated() {
        let record = compare(&test_config(), &FixtureProvider::new()).unwrap();

        assert!(record.simulated.mean_firing_rate > 0.0, "network stayed silent");
        assert!(!record.simulated.isi.is_empty());
        assert!(!record.reference.isi.is_empty());
        assert!(record.ks.is_some());

        // The fixture LFP is a clean theta oscillation
        let bands = record.reference.band_powers.as_ref().unwrap();
        assert!(bands["theta"] > bands["gamma"]);

        // 2 s of simulated LFP at 1 kHz fills the analysis window
        assert!(record.simulated.band_powers.is_some());
    }

    #[test]
    fn short_simulation_leaves_a_band_power_gap() {
        // Half the analysis window: band powers are a gap, not a failure
        let config = SimConfig {
            duration: seconds(1.0),
            ..test_config()
        };
        let record = compare(&config, &FixtureProvider::new()).unwrap();
        assert!(record.simulated.band_powers.is_none());
        assert!(record.reference.band_powers.is_some());
    }

    #[test]
    fn comparison_is_deterministic() {
        let config = test_config();
        let provider = FixtureProvider::new();
        let a = compare(&config, &provider).unwrap();
        let b = compare(&config, &provider).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_reference_is_data_unavailable() {
        let mut provider = FixtureProvider::new();
        provider.dataset.spike_times.clear();
        let err = compare(&test_config(), &provider).unwrap_err();
        assert!(matches!(err, CompareError::DataUnavailable(_)));
    }

    #[test]
    fn dopamine_without_plasticity_is_a_config_error() {
        let config = SimConfig {
            dopamine: 0.5,
            ..test_config()
        };
        let err = compare(&config, &FixtureProvider::new()).unwrap_err();
        assert!(matches!(err, CompareError::Sim(SimError::Config(_))));
    }

    #[test]
    fn sweep_produces_one_record_per_level() {
        let config = SimConfig {
            plastic_exc_exc: true,
            ..test_config()
        };
        let records = compare_sweep(&config, &[0.0, 1.0], &FixtureProvider::new()).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.contains_key("dopamine_0.00"));
        assert!(records.contains_key("dopamine_1.00"));
    }

    #[test]
    fn json_provider_roundtrip() {
        let dataset = FixtureProvider::new().dataset;
        let path = std::env::temp_dir().join("spikefit_reference_roundtrip.json");
        std::fs::write(&path, serde_json::to_string(&dataset).unwrap()).unwrap();

        let provider = JsonFileProvider::new(&path);
        let session = provider.session().unwrap();
        let loaded = provider.probe_summary(&session).unwrap();
        assert_eq!(loaded, dataset);
        // Spike times survive bit-exactly, including values whose shortest
        // decimal form rounds to a different f64 (14 * 0.1 among them)
        for (unit, train) in &dataset.spike_times {
            for (k, t) in train.iter().enumerate() {
                assert_eq!(t.to_bits(), loaded.spike_times[unit][k].to_bits());
            }
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_json_file_is_data_unavailable() {
        let provider = JsonFileProvider::new("/nonexistent/reference.json");
        assert!(matches!(
            provider.session(),
            Err(CompareError::DataUnavailable(_))
        ));
    }
}
