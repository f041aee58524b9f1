//! # HANA CLI
//!
//! Command-line interface for connectivity analysis of HD-MEA recordings.
//! Every command reads JSON and writes JSON, so the stages can be chained.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use hana_core::{
    normalize_neuron_keys, AnalysisConfig, DelayTable, ElectrodeSet, EventTrain, EventTrains,
    NeuronId, Trace,
};
use hana_function::PeakDetection;
use hana_polychronous::PolychronousGroup;
use hana_segmentation::CompartmentTable;
use hana_structure::StructuralNetwork;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, Array2};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hana")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Structural and functional connectivity from HD-MEA recordings", long_about = None)]
struct Cli {
    /// Analysis configuration (JSON); defaults for missing fields
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write the result to this file instead of stdout
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the analysis configuration
    Config,

    /// Segment axons and dendrites from spike-triggered averages
    Compartments {
        /// Traces indexed by neuron
        #[arg(long)]
        traces: PathBuf,
        /// Electrode positions
        #[arg(long)]
        positions: PathBuf,
    },

    /// Structural network from overlapping compartments
    Structure {
        /// Output of `hana compartments`
        #[arg(long)]
        compartments: PathBuf,
    },

    /// Functional (and synaptic) network from spike times
    Function {
        /// Spike times indexed by neuron
        #[arg(long)]
        events: PathBuf,
        /// Output of `hana structure`
        #[arg(long)]
        structural: Option<PathBuf>,
    },

    /// Polychronous groups from spike times and admissible delays
    Groups {
        /// Spike times indexed by neuron
        #[arg(long)]
        events: PathBuf,
        /// Delay table (ms), e.g. the admissible delays of `hana function`
        #[arg(long)]
        delays: PathBuf,
        /// Compare group sizes against surrogate conditions
        #[arg(long)]
        significance: bool,
    },
}

// ============================================================================
// INPUT RECORDS
// ============================================================================

/// Spike-triggered average of a single neuron as stored on disk
#[derive(Debug, Deserialize)]
struct TraceRecord {
    /// Electrodes x samples (uV)
    voltage: Vec<Vec<f64>>,
    /// Sample times (s)
    time: Vec<f64>,
    #[serde(default)]
    trigger: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PositionsRecord {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl TraceRecord {
    fn into_trace(self, electrodes: ElectrodeSet, neuron: NeuronId) -> anyhow::Result<Trace> {
        let rows = self.voltage.len();
        let cols = self.voltage.first().map_or(0, Vec::len);
        if self.voltage.iter().any(|row| row.len() != cols) {
            bail!("neuron {}: voltage rows differ in length", neuron);
        }
        let voltage = Array2::from_shape_vec((rows, cols), self.voltage.into_iter().flatten().collect())
            .with_context(|| format!("neuron {}: voltage shape", neuron))?;
        let trace = Trace::new(
            voltage,
            Array1::from(self.time),
            electrodes,
            self.trigger,
            Some(neuron),
        )
        .with_context(|| format!("neuron {}", neuron))?;
        Ok(trace)
    }
}

#[derive(Debug, Serialize)]
struct FunctionOutput {
    functional: PeakDetection,
    #[serde(skip_serializing_if = "Option::is_none")]
    synaptic: Option<PeakDetection>,
    /// Input for `hana groups`
    #[serde(skip_serializing_if = "Option::is_none")]
    admissible: Option<DelayTable>,
}

#[derive(Debug, Serialize)]
struct GroupsOutput {
    sizes: Vec<usize>,
    groups: Vec<PolychronousGroup>,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file)).with_context(|| format!("parsing {}", path.display()))
}

fn write_json<T: Serialize>(value: &T, output: Option<&Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, value)?;
            writer.flush()?;
            eprintln!("{} {}", "Written:".green().bold(), path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut writer = stdout.lock();
            serde_json::to_writer_pretty(&mut writer, value)?;
            writeln!(writer)?;
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AnalysisConfig> {
    let config: AnalysisConfig = match path {
        Some(path) => read_json(path)?,
        None => AnalysisConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn load_trains(path: &Path) -> anyhow::Result<EventTrains> {
    let raw: HashMap<String, Vec<f64>> = read_json(path)?;
    let trains = normalize_neuron_keys(raw)?
        .into_iter()
        .map(|(neuron, times)| Ok((neuron, EventTrain::new(times)?)))
        .collect::<anyhow::Result<EventTrains>>()?;
    let events: usize = trains.values().map(EventTrain::len).sum();
    eprintln!(
        "{} {} neurons, {} events",
        "Loaded spike times:".green().bold(),
        trains.len(),
        events
    );
    Ok(trains)
}

fn spinner(message: &str) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} [{elapsed}]")?);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

// ============================================================================
// COMMANDS
// ============================================================================

fn compartments(config: &AnalysisConfig, traces: &Path, positions: &Path) -> anyhow::Result<CompartmentTable> {
    let positions: PositionsRecord = read_json(positions)?;
    let electrodes = ElectrodeSet::new(positions.x, positions.y)?;
    let neighbors = electrodes.neighborhoods(&config.neighborhood)?;

    let raw: HashMap<String, TraceRecord> = read_json(traces)?;
    let source: BTreeMap<NeuronId, Trace> = normalize_neuron_keys(raw)?
        .into_iter()
        .map(|(neuron, record)| Ok((neuron, record.into_trace(electrodes.clone(), neuron)?)))
        .collect::<anyhow::Result<_>>()?;
    let neurons: Vec<NeuronId> = source.keys().copied().collect();
    eprintln!(
        "{} {} neurons on {} electrodes",
        "Loaded traces:".green().bold(),
        neurons.len(),
        electrodes.len()
    );

    let pb = spinner("Segmenting compartments")?;
    let table = hana_segmentation::extract_all_compartments(
        &source,
        &neurons,
        neighbors.view(),
        &config.segmentation,
    )?;
    pb.finish_with_message(format!("{} of {} neurons retained", table.len(), neurons.len()));
    Ok(table)
}

fn structure(config: &AnalysisConfig, compartments: &Path) -> anyhow::Result<StructuralNetwork> {
    let table: CompartmentTable = read_json(compartments)?;
    let pb = spinner("Computing overlaps")?;
    let network = hana_structure::structural_network(&table, &config.overlap)?;
    pb.finish_with_message(format!("{} structural connections", network.len()));
    Ok(network)
}

fn function(config: &AnalysisConfig, events: &Path, structural: Option<&Path>) -> anyhow::Result<FunctionOutput> {
    let trains = load_trains(events)?;
    let structural: Option<StructuralNetwork> = structural.map(read_json::<StructuralNetwork>).transpose()?;

    let pb = spinner("Generating surrogates")?;
    let surrogates = hana_function::generate_surrogates(&trains, &config.surrogates)?;
    pb.set_message("Computing standard scores");
    let scores = hana_function::all_timelag_standardscore(&trains, &surrogates, &config.timelag)?;
    pb.set_message("Detecting peaks");
    let functional = hana_function::functional_network(&scores)?;

    let (synaptic, admissible) = match &structural {
        Some(structural) => {
            let synaptic = hana_function::synaptic_network(
                &scores,
                &structural.delay,
                config.networks.synaptic_min_delay_ms,
            )?;
            let admissible = hana_polychronous::admissible_delays(
                &structural.delay,
                &functional.delay,
                config.polychronous.admissible_min_synaptic_delay_ms,
            );
            (Some(synaptic), Some(admissible))
        }
        None => (None, None),
    };
    pb.finish_with_message(format!("{} functional connections", functional.delay.len()));

    Ok(FunctionOutput {
        functional,
        synaptic,
        admissible,
    })
}

fn groups(config: &AnalysisConfig, events: &Path, delays: &Path, significance: bool) -> anyhow::Result<serde_json::Value> {
    let trains = load_trains(events)?;
    let trains = hana_polychronous::polychronous_trains(&trains, &config.polychronous)?;
    let delays: DelayTable = read_json(delays)?;
    info!("{} admissible delays", delays.len());

    if significance {
        let pb = spinner("Extracting groups under surrogate conditions")?;
        let report = hana_polychronous::group_size_distributions(
            &trains,
            &delays,
            &config.polychronous,
            &config.surrogates,
        )?;
        pb.finish_with_message("Done");
        let verdict = if report.largest_original_exceeds_nulls() {
            "largest group exceeds all surrogates".green()
        } else {
            "largest group within surrogate range".yellow()
        };
        eprintln!("{} {}", "Significance:".green().bold(), verdict);
        Ok(serde_json::to_value(report)?)
    } else {
        let pb = spinner("Extracting groups")?;
        let connected = hana_polychronous::find_connected_events(
            &trains,
            &delays,
            config.polychronous.synaptic_delay_s,
            config.polychronous.jitter_s,
        );
        let (groups, sizes) = hana_polychronous::extract_pcgs(&connected);
        pb.finish_with_message(format!("{} polychronous groups", groups.len()));
        Ok(serde_json::to_value(GroupsOutput { sizes, groups })?)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = load_config(cli.config.as_deref())?;
    let output = cli.output.as_deref();

    match cli.command {
        Commands::Config => write_json(&config, output)?,

        Commands::Compartments { traces, positions } => {
            let table = compartments(&config, &traces, &positions)?;
            write_json(&table, output)?;
        }

        Commands::Structure { compartments } => {
            let network = structure(&config, &compartments)?;
            write_json(&network, output)?;
        }

        Commands::Function { events, structural } => {
            let result = function(&config, &events, structural.as_deref())?;
            write_json(&result, output)?;
        }

        Commands::Groups {
            events,
            delays,
            significance,
        } => {
            let result = groups(&config, &events, &delays, significance)?;
            write_json(&result, output)?;
        }
    }

    Ok(())
}
