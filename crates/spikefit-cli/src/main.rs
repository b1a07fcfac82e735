//! # SpikeFit CLI
//!
//! Command-line interface for spiking network simulation and
//! simulation-vs-recording comparison.

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use spikefit_analysis::band_power_decomposition;
use spikefit_compare::{compare, compare_sweep, JsonFileProvider, SimConfig};
use spikefit_core::{hz, ms, mv, na, seconds};
use spikefit_sim::{AdexParams, LifParams, Network, NeuronModel, Population};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "spikefit")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Spiking network simulation and comparison toolkit", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SingleModel {
    Lif,
    Adex,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the excitatory/inhibitory network and report its statistics
    Simulate {
        /// Poisson input rate (Hz)
        #[arg(short, long, default_value_t = 200.0)]
        rate: f64,
        /// Simulation duration (seconds)
        #[arg(short, long, default_value_t = 2.0)]
        duration: f64,
        /// Random seed
        #[arg(short, long, default_value_t = 42)]
        seed: u64,
        /// Excitatory population size
        #[arg(long, default_value_t = 120)]
        n_exc: usize,
        /// Inhibitory population size
        #[arg(long, default_value_t = 30)]
        n_inh: usize,
        /// STDP on the recurrent excitatory projection
        #[arg(long)]
        plastic: bool,
        /// Dopamine level (requires --plastic)
        #[arg(long, default_value_t = 0.0)]
        dopamine: f64,
        /// Acetylcholine level
        #[arg(long, default_value_t = 0.0)]
        acetylcholine: f64,
        /// Write the activity record as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare a simulation against a reference recording
    Compare {
        /// Reference dataset (JSON)
        reference: PathBuf,
        /// Random seed
        #[arg(short, long, default_value_t = 42)]
        seed: u64,
        /// Simulation duration (seconds)
        #[arg(short, long, default_value_t = 2.0)]
        duration: f64,
        /// Sweep these dopamine levels instead of a single run
        #[arg(long, value_delimiter = ',')]
        sweep: Option<Vec<f64>>,
        /// Write the comparison record as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Drive a single model neuron with constant input
    Neuron {
        /// Model variant
        #[arg(value_enum)]
        model: SingleModel,
        /// Constant drive (mV for LIF, nA for AdEx)
        #[arg(long, default_value_t = 30.0)]
        drive: f64,
        /// Simulation duration (seconds)
        #[arg(short, long, default_value_t = 1.0)]
        duration: f64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            rate,
            duration,
            seed,
            n_exc,
            n_inh,
            plastic,
            dopamine,
            acetylcholine,
            output,
        } => {
            let config = SimConfig {
                n_exc,
                n_inh,
                duration: seconds(duration),
                seed,
                plastic_exc_exc: plastic,
                dopamine,
                acetylcholine,
                ..SimConfig::default()
            };
            println!(
                "{} {} excitatory + {} inhibitory neurons, {}s at {} Hz drive",
                "Simulating:".green().bold(),
                n_exc,
                n_inh,
                duration,
                rate
            );
            let activity = spikefit_compare::run_simulation(&config, hz(rate))?;

            println!(
                "  Mean firing rate: {}",
                format!("{:.2} Hz", activity.mean_firing_rate).cyan()
            );
            match band_power_decomposition(&activity.lfp, activity.lfp_sampling_rate) {
                Some(bands) => {
                    println!("  {}", "LFP band powers:".green());
                    for (band, power) in &bands {
                        println!("    {:<6} {:.4e}", band.cyan(), power);
                    }
                }
                None => println!("  {}", "LFP too short for band decomposition".yellow()),
            }

            if let Some(path) = output {
                std::fs::write(&path, serde_json::to_string_pretty(&activity)?)?;
                println!("  Activity written to {}", path.display());
            }
        }

        Commands::Compare {
            reference,
            seed,
            duration,
            sweep,
            output,
        } => {
            let config = SimConfig {
                seed,
                duration: seconds(duration),
                plastic_exc_exc: sweep.is_some(),
                ..SimConfig::default()
            };
            let provider = JsonFileProvider::new(&reference);
            println!(
                "{} {}",
                "Comparing against:".green().bold(),
                reference.display()
            );

            let json = match sweep {
                Some(levels) => {
                    let records = compare_sweep(&config, &levels, &provider)?;
                    for (condition, record) in &records {
                        println!("  {}", condition.cyan().bold());
                        print_record(record);
                    }
                    serde_json::to_string_pretty(&records)?
                }
                None => {
                    let record = compare(&config, &provider)?;
                    print_record(&record);
                    serde_json::to_string_pretty(&record)?
                }
            };

            if let Some(path) = output {
                std::fs::write(&path, json)?;
                println!("  Record written to {}", path.display());
            }
        }

        Commands::Neuron {
            model,
            drive,
            duration,
        } => {
            let dt = ms(0.1);
            let mut net = Network::new(dt)?;
            let mut pop = match model {
                SingleModel::Lif => {
                    Population::new("lif", 1, &NeuronModel::Lif(LifParams::default()), 1e-4)?
                }
                SingleModel::Adex => {
                    Population::new("adex", 1, &NeuronModel::Adex(AdexParams::default()), 1e-4)?
                }
            };
            match model {
                SingleModel::Lif => pop.set_constant_drive(mv(drive))?,
                SingleModel::Adex => pop.set_constant_drive(na(drive))?,
            }
            let pop = net.add_population(pop)?;

            let mut rng = ChaCha8Rng::seed_from_u64(0);
            net.run(seconds(duration), &mut rng)?;

            println!(
                "{} {} spikes in {}s ({})",
                "Result:".green().bold(),
                net.spikes(pop).len(),
                duration,
                format!("{:.2} Hz", net.mean_rate(pop)).cyan()
            );
        }
    }

    Ok(())
}

fn print_record(record: &spikefit_compare::ComparisonRecord) {
    println!(
        "    Simulated rate: {}  Reference rate: {}",
        format!("{:.2} Hz", record.simulated.mean_firing_rate).cyan(),
        format!("{:.2} Hz", record.reference.mean_firing_rate).cyan()
    );
    println!(
        "    Simulated state: {}  Reference state: {}",
        record.simulated.cognitive_state.to_string().cyan(),
        record.reference.cognitive_state.to_string().cyan()
    );
    match &record.ks {
        Some(ks) => println!(
            "    ISI KS statistic: {} (p = {})",
            format!("{:.4}", ks.statistic).cyan(),
            format!("{:.4}", ks.p_value).cyan()
        ),
        None => println!("    {}", "ISI comparison unavailable (empty sample)".yellow()),
    }
}
