//! # HANA Core
//!
//! Shared types for connectivity analysis of high-density micro-electrode
//! array (HD-MEA) recordings of neuron cultures.
//!
//! ## Pipeline Stages
//!
//! | Stage | Crate | Input | Output |
//! |-------|-------|-------|--------|
//! | Segmentation | `hana-segmentation` | spike-triggered averages | compartments |
//! | Structure | `hana-structure` | compartments | structural network |
//! | Function | `hana-function` | event trains + surrogates | functional/synaptic network |
//! | Patterns | `hana-polychronous` | event trains + delays | polychronous groups |
//!
//! ## Conventions
//!
//! 1. Event times are in seconds, delays and time lags in milliseconds
//! 2. Neuron identifiers are non-negative integers, normalised once at load time
//! 3. Every table is an ordered map, so key sets and iteration order are deterministic

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

/// Common errors
#[derive(Debug, Error)]
pub enum HanaError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid neuron key: {0:?}")]
    InvalidNeuronKey(String),

    #[error("Duplicate neuron after key normalization: {0}")]
    DuplicateNeuron(NeuronId),

    #[error("Unknown neuron: {0}")]
    UnknownNeuron(NeuronId),

    #[error("Electrode layout error: {0}")]
    Layout(String),
}

pub type Result<T> = std::result::Result<T, HanaError>;

/// Neuron identifier
pub type NeuronId = u32;

/// Time (s)
pub type Seconds = f64;

/// Time (ms)
pub type Millis = f64;

/// Voltage (uV)
pub type Microvolts = f64;

/// Distance (um)
pub type Micrometers = f64;

// ============================================================================
// NEURON PAIRS
// ============================================================================

/// Directed pair of neurons. A pair and its reverse are independent keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NeuronPair {
    pub pre: NeuronId,
    pub post: NeuronId,
}

impl NeuronPair {
    pub fn new(pre: NeuronId, post: NeuronId) -> Self {
        Self { pre, post }
    }

    pub fn reversed(&self) -> Self {
        Self::new(self.post, self.pre)
    }

    pub fn is_self_pair(&self) -> bool {
        self.pre == self.post
    }
}

impl From<(NeuronId, NeuronId)> for NeuronPair {
    fn from((pre, post): (NeuronId, NeuronId)) -> Self {
        Self::new(pre, post)
    }
}

impl fmt::Display for NeuronPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.pre, self.post)
    }
}

/// All ordered pairs over `neurons`, self-pairs included
pub fn all_pairs<'a, I>(neurons: I) -> Vec<NeuronPair>
where
    I: IntoIterator<Item = &'a NeuronId>,
    I::IntoIter: Clone,
{
    let neurons = neurons.into_iter();
    neurons
        .clone()
        .flat_map(|&pre| neurons.clone().map(move |&post| NeuronPair::new(pre, post)))
        .collect()
}

// ============================================================================
// EVENT TRAINS
// ============================================================================

/// Sorted spike times (s) of a single neuron.
///
/// The times are sorted on construction and never reordered afterwards;
/// operations that change the content return a new train.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct EventTrain {
    times: Vec<Seconds>,
}

impl EventTrain {
    /// Build a train from unsorted times. Sorting is done here, once.
    pub fn new(mut times: Vec<Seconds>) -> Result<Self> {
        if let Some(bad) = times.iter().find(|t| !t.is_finite()) {
            return Err(HanaError::MalformedInput(format!(
                "event time {} is not finite",
                bad
            )));
        }
        times.sort_by(|a, b| a.total_cmp(b));
        Ok(Self { times })
    }

    /// Build a train from times that must already be non-decreasing
    pub fn from_sorted(times: Vec<Seconds>) -> Result<Self> {
        if let Some(bad) = times.iter().find(|t| !t.is_finite()) {
            return Err(HanaError::MalformedInput(format!(
                "event time {} is not finite",
                bad
            )));
        }
        if let Some(i) = times.windows(2).position(|w| w[1] < w[0]) {
            return Err(HanaError::MalformedInput(format!(
                "event times not sorted at index {}: {} > {}",
                i,
                times[i],
                times[i + 1]
            )));
        }
        Ok(Self { times })
    }

    pub fn times(&self) -> &[Seconds] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn first(&self) -> Option<Seconds> {
        self.times.first().copied()
    }

    pub fn last(&self) -> Option<Seconds> {
        self.times.last().copied()
    }

    /// Inter-event intervals
    pub fn gaps(&self) -> Vec<Seconds> {
        self.times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Events strictly inside (begin, end)
    pub fn within(&self, begin: Seconds, end: Seconds) -> Self {
        Self {
            times: self
                .times
                .iter()
                .copied()
                .filter(|&t| t > begin && t < end)
                .collect(),
        }
    }
}

impl TryFrom<Vec<f64>> for EventTrain {
    type Error = HanaError;

    fn try_from(times: Vec<f64>) -> Result<Self> {
        Self::new(times)
    }
}

impl From<EventTrain> for Vec<f64> {
    fn from(train: EventTrain) -> Self {
        train.times
    }
}

/// Event trains indexed by neuron
pub type EventTrains = BTreeMap<NeuronId, EventTrain>;

/// Group a flat list of (time, neuron) events into per-neuron trains
pub fn events_to_trains(events: &[(Seconds, NeuronId)]) -> Result<EventTrains> {
    let mut grouped: BTreeMap<NeuronId, Vec<Seconds>> = BTreeMap::new();
    for &(time, neuron) in events {
        grouped.entry(neuron).or_default().push(time);
    }
    let trains = grouped
        .into_iter()
        .map(|(neuron, times)| Ok((neuron, EventTrain::new(times)?)))
        .collect::<Result<EventTrains>>()?;
    debug!(neurons = trains.len(), events = events.len(), "grouped events into trains");
    Ok(trains)
}

/// Convert externally string-keyed data to integer neuron keys.
///
/// This is the only place where string keys are accepted.
pub fn normalize_neuron_keys<V>(raw: HashMap<String, V>) -> Result<BTreeMap<NeuronId, V>> {
    let mut normalized = BTreeMap::new();
    for (key, value) in raw {
        let neuron: NeuronId = key
            .trim()
            .parse()
            .map_err(|_| HanaError::InvalidNeuronKey(key.clone()))?;
        if normalized.insert(neuron, value).is_some() {
            return Err(HanaError::DuplicateNeuron(neuron));
        }
    }
    Ok(normalized)
}

/// Time of the earliest first event and the latest last event
pub fn interval_of_trains(trains: &EventTrains) -> Option<(Seconds, Seconds)> {
    let first = trains
        .values()
        .filter_map(EventTrain::first)
        .min_by(|a, b| a.total_cmp(b))?;
    let last = trains
        .values()
        .filter_map(EventTrain::last)
        .max_by(|a, b| a.total_cmp(b))?;
    Some((first, last))
}

/// Portion of the recording used for a partial analysis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PartialInterval {
    /// Leading fraction of the overall recording interval
    Fraction(f64),
    /// Absolute window (s)
    Window { begin: Seconds, end: Seconds },
}

/// Restrict every train to a sub-interval of the recording.
///
/// Returns a new map; the input is left untouched.
pub fn partial_trains(trains: &EventTrains, interval: PartialInterval) -> Result<EventTrains> {
    let Some((begin, end)) = interval_of_trains(trains) else {
        return Ok(trains.clone());
    };

    let (partial_begin, partial_end) = match interval {
        PartialInterval::Fraction(fraction) => {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(HanaError::MalformedInput(format!(
                    "partial fraction {} outside (0, 1]",
                    fraction
                )));
            }
            (begin, begin + (end - begin) * fraction)
        }
        PartialInterval::Window { begin: b, end: e } => {
            if !(b < e) {
                return Err(HanaError::MalformedInput(format!(
                    "partial window {} ~ {} is empty",
                    b, e
                )));
            }
            (b, e)
        }
    };

    info!(
        "Partial timeseries spanning {:.3}~{:.3} [s] of total {:.3}~{:.3} [s]",
        partial_begin, partial_end, begin, end
    );

    Ok(trains
        .iter()
        .map(|(&neuron, train)| (neuron, train.within(partial_begin, partial_end)))
        .collect())
}

// ============================================================================
// DELAY TABLES
// ============================================================================

/// Serialized form of a single delay table entry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayEntry {
    pub pre: NeuronId,
    pub post: NeuronId,
    pub value: f64,
}

/// Directed neuron pair -> scalar (delay in ms, or a strength).
///
/// Only pairs with a defined value are stored; absent pairs are not
/// represented as NaN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<DelayEntry>", into = "Vec<DelayEntry>")]
pub struct DelayTable {
    entries: BTreeMap<NeuronPair, f64>,
}

impl DelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pair: NeuronPair, value: f64) -> Option<f64> {
        self.entries.insert(pair, value)
    }

    pub fn get(&self, pair: &NeuronPair) -> Option<f64> {
        self.entries.get(pair).copied()
    }

    pub fn contains(&self, pair: &NeuronPair) -> bool {
        self.entries.contains_key(pair)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NeuronPair, f64)> + '_ {
        self.entries.iter().map(|(&pair, &value)| (pair, value))
    }

    pub fn pairs(&self) -> impl Iterator<Item = NeuronPair> + '_ {
        self.entries.keys().copied()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.entries.values().copied()
    }

    /// Every neuron appearing as pre or post
    pub fn neurons(&self) -> BTreeSet<NeuronId> {
        self.entries
            .keys()
            .flat_map(|pair| [pair.pre, pair.post])
            .collect()
    }

    /// Pairs present in both tables, with the value from each
    pub fn correlate(&self, other: &DelayTable) -> Vec<(NeuronPair, f64, f64)> {
        self.entries
            .iter()
            .filter_map(|(pair, &x)| other.get(pair).map(|y| (*pair, x, y)))
            .collect()
    }

    /// Entries whose pre and post neurons are both in `neurons`
    pub fn restrict_to(&self, neurons: &BTreeSet<NeuronId>) -> Self {
        self.iter()
            .filter(|(pair, _)| neurons.contains(&pair.pre) && neurons.contains(&pair.post))
            .collect()
    }
}

impl FromIterator<(NeuronPair, f64)> for DelayTable {
    fn from_iter<T: IntoIterator<Item = (NeuronPair, f64)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<DelayEntry>> for DelayTable {
    fn from(entries: Vec<DelayEntry>) -> Self {
        entries
            .into_iter()
            .map(|e| (NeuronPair::new(e.pre, e.post), e.value))
            .collect()
    }
}

impl From<DelayTable> for Vec<DelayEntry> {
    fn from(table: DelayTable) -> Self {
        table
            .iter()
            .map(|(pair, value)| DelayEntry {
                pre: pair.pre,
                post: pair.post,
                value,
            })
            .collect()
    }
}

// ============================================================================
// ELECTRODES
// ============================================================================

/// Electrode coordinates (um), fixed for a recording session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectrodeSet {
    x: Vec<Micrometers>,
    y: Vec<Micrometers>,
}

impl ElectrodeSet {
    pub fn new(x: Vec<Micrometers>, y: Vec<Micrometers>) -> Result<Self> {
        if x.len() != y.len() {
            return Err(HanaError::Layout(format!(
                "{} x coordinates but {} y coordinates",
                x.len(),
                y.len()
            )));
        }
        if x.is_empty() {
            return Err(HanaError::MalformedInput("zero electrodes".into()));
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(HanaError::Layout("non-finite electrode coordinate".into()));
        }
        Ok(Self { x, y })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn x(&self) -> &[Micrometers] {
        &self.x
    }

    pub fn y(&self) -> &[Micrometers] {
        &self.y
    }

    pub fn position(&self, electrode: usize) -> Option<(Micrometers, Micrometers)> {
        Some((*self.x.get(electrode)?, *self.y.get(electrode)?))
    }

    /// Euclidean distance between every pair of electrodes
    pub fn distances(&self) -> Array2<Micrometers> {
        let n = self.len();
        Array2::from_shape_fn((n, n), |(i, j)| {
            (self.x[i] - self.x[j]).hypot(self.y[i] - self.y[j])
        })
    }

    /// Symmetric adjacency: electrodes closer than the neighborhood radius.
    ///
    /// Each electrode is its own neighbor (distance 0). Fails if any
    /// neighborhood is larger than `max_neighbors`, which means the layout
    /// does not match the configured radius.
    pub fn neighborhoods(&self, config: &NeighborhoodConfig) -> Result<Array2<bool>> {
        let neighbors = self.distances().mapv(|d| d < config.radius_um);
        let largest = neighbors
            .rows()
            .into_iter()
            .map(|row| row.iter().filter(|&&b| b).count())
            .max()
            .unwrap_or(0);
        if largest > config.max_neighbors {
            return Err(HanaError::Layout(format!(
                "{} electrodes within {} um, expected at most {}",
                largest, config.radius_um, config.max_neighbors
            )));
        }
        debug!(electrodes = self.len(), largest, "electrode neighborhoods");
        Ok(neighbors)
    }

    /// Average area per electrode (um^2) from the bounding box
    pub fn average_electrode_area(&self) -> f64 {
        let span = |v: &[f64]| {
            let min = v.iter().copied().fold(f64::INFINITY, f64::min);
            let max = v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            max - min
        };
        span(&self.x) * span(&self.y) / self.len() as f64
    }
}

// ============================================================================
// TRACES
// ============================================================================

/// Spike-triggered average of one neuron across all recording electrodes
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    /// Voltage (uV), electrodes x samples
    voltage: Array2<Microvolts>,
    /// Time axis (s)
    time: Array1<Seconds>,
    electrodes: ElectrodeSet,
    /// Electrode used for spike-triggered averaging
    trigger: Option<usize>,
    neuron: Option<NeuronId>,
}

impl Trace {
    pub fn new(
        voltage: Array2<Microvolts>,
        time: Array1<Seconds>,
        electrodes: ElectrodeSet,
        trigger: Option<usize>,
        neuron: Option<NeuronId>,
    ) -> Result<Self> {
        let (n_electrodes, n_samples) = voltage.dim();
        if n_electrodes == 0 || n_samples == 0 {
            return Err(HanaError::MalformedInput(format!(
                "empty trace ({} electrodes x {} samples)",
                n_electrodes, n_samples
            )));
        }
        if time.len() != n_samples {
            return Err(HanaError::MalformedInput(format!(
                "time axis has {} samples, voltage has {}",
                time.len(),
                n_samples
            )));
        }
        if electrodes.len() != n_electrodes {
            return Err(HanaError::MalformedInput(format!(
                "{} electrode positions for {} voltage rows",
                electrodes.len(),
                n_electrodes
            )));
        }
        if time.iter().any(|t| !t.is_finite()) || voltage.iter().any(|v| !v.is_finite()) {
            return Err(HanaError::MalformedInput("non-finite trace values".into()));
        }
        if time.windows(2).into_iter().any(|w| w[1] <= w[0]) {
            return Err(HanaError::MalformedInput(
                "time axis is not strictly increasing".into(),
            ));
        }
        if let Some(t) = trigger {
            if t >= n_electrodes {
                return Err(HanaError::MalformedInput(format!(
                    "trigger electrode {} out of range ({} electrodes)",
                    t, n_electrodes
                )));
            }
        }
        Ok(Self {
            voltage,
            time,
            electrodes,
            trigger,
            neuron,
        })
    }

    pub fn voltage(&self) -> &Array2<Microvolts> {
        &self.voltage
    }

    pub fn time(&self) -> &Array1<Seconds> {
        &self.time
    }

    pub fn time_ms(&self) -> Array1<Millis> {
        self.time.mapv(|t| t * 1000.0)
    }

    pub fn electrodes(&self) -> &ElectrodeSet {
        &self.electrodes
    }

    pub fn trigger(&self) -> Option<usize> {
        self.trigger
    }

    pub fn neuron(&self) -> Option<NeuronId> {
        self.neuron
    }

    pub fn n_electrodes(&self) -> usize {
        self.voltage.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.voltage.ncols()
    }
}

/// Source of spike-triggered averages, one per neuron
pub trait TraceSource {
    /// Neurons for which a trace is available
    fn neurons(&self) -> Vec<NeuronId>;

    /// Load the trace of a single neuron
    fn load(&self, neuron: NeuronId) -> Result<Trace>;
}

impl TraceSource for BTreeMap<NeuronId, Trace> {
    fn neurons(&self) -> Vec<NeuronId> {
        self.keys().copied().collect()
    }

    fn load(&self, neuron: NeuronId) -> Result<Trace> {
        self.get(&neuron)
            .cloned()
            .ok_or(HanaError::UnknownNeuron(neuron))
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Peak polarity of a waveform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeakPolarity {
    Negative,
    Positive,
}

/// Randomization used to build surrogate event trains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurrogateMethod {
    /// Gaps reordered by Gaussian jitter of their indices
    Gaussian,
    /// Random swaps of adjacent gaps
    Swapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeighborhoodConfig {
    /// Electrodes closer than this are neighbors (um)
    pub radius_um: Micrometers,
    /// Sanity bound on the neighborhood size
    pub max_neighbors: usize,
}

impl Default for NeighborhoodConfig {
    fn default() -> Self {
        Self {
            radius_um: 20.0,
            max_neighbors: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Histogram bin width for the noise threshold (ms)
    pub delay_bin_ms: Millis,
    /// Dendrite must be seen on more electrodes than this
    pub min_dendrite_electrodes: usize,
    pub min_axon_electrodes: usize,
    pub max_axon_electrodes: usize,
    /// AIS peak whose half-peak domain bounds the dendritic return current
    pub ais_window_polarity: PeakPolarity,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            delay_bin_ms: 0.05,
            min_dendrite_electrodes: 0,
            min_axon_electrodes: 7,
            max_axon_electrodes: 5000,
            ais_window_polarity: PeakPolarity::Negative,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlapConfig {
    /// Dendritic field: positive peak above this (uV)
    pub thr_peak: Microvolts,
    /// Minimal overlap relative to the dendritic field
    pub thr_ratio: f64,
    /// Minimal overlap in electrodes
    pub thr_overlap: usize,
}

impl Default for OverlapConfig {
    fn default() -> Self {
        Self {
            thr_peak: 0.0,
            thr_ratio: 0.0,
            thr_overlap: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeLagConfig {
    pub min_lag_s: Seconds,
    pub max_lag_s: Seconds,
    pub bins: usize,
}

impl Default for TimeLagConfig {
    fn default() -> Self {
        Self {
            min_lag_s: -0.005,
            max_lag_s: 0.005,
            bins: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurrogateConfig {
    /// Surrogate trains per neuron
    pub count: usize,
    /// Jitter (gap index units) or swaps per gap
    pub factor: f64,
    pub method: SurrogateMethod,
    pub seed: u64,
}

impl Default for SurrogateConfig {
    fn default() -> Self {
        Self {
            count: 10,
            factor: 2.0,
            method: SurrogateMethod::Gaussian,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Response must follow the axonal delay by more than this (ms)
    pub synaptic_min_delay_ms: Millis,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            synaptic_min_delay_ms: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolychronousConfig {
    /// Added to every axonal delay (s)
    pub synaptic_delay_s: Seconds,
    /// Maximal deviation between predicted and observed spike (s)
    pub jitter_s: Seconds,
    /// Admissible links need a synaptic delay above this (ms)
    pub admissible_min_synaptic_delay_ms: Millis,
    /// Leading fraction of the recording searched for groups
    pub partial_fraction: f64,
}

impl Default for PolychronousConfig {
    fn default() -> Self {
        Self {
            synaptic_delay_s: 0.0,
            jitter_s: 0.0005,
            admissible_min_synaptic_delay_ms: 1.0,
            partial_fraction: 0.1,
        }
    }
}

/// Complete analysis configuration, immutable once built
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub neighborhood: NeighborhoodConfig,
    pub segmentation: SegmentationConfig,
    pub overlap: OverlapConfig,
    pub timelag: TimeLagConfig,
    pub surrogates: SurrogateConfig,
    pub networks: NetworkConfig,
    pub polychronous: PolychronousConfig,
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(HanaError::InvalidConfig(msg));

        if !(self.neighborhood.radius_um > 0.0) {
            return invalid(format!("radius_um = {}", self.neighborhood.radius_um));
        }
        if !(self.segmentation.delay_bin_ms > 0.0) {
            return invalid(format!("delay_bin_ms = {}", self.segmentation.delay_bin_ms));
        }
        if self.segmentation.min_axon_electrodes > self.segmentation.max_axon_electrodes {
            return invalid(format!(
                "axon electrode bounds [{}, {}]",
                self.segmentation.min_axon_electrodes, self.segmentation.max_axon_electrodes
            ));
        }
        if self.timelag.bins == 0 {
            return invalid("timelag bins = 0".into());
        }
        if !(self.timelag.min_lag_s < self.timelag.max_lag_s) {
            return invalid(format!(
                "timelag window {} ~ {}",
                self.timelag.min_lag_s, self.timelag.max_lag_s
            ));
        }
        if !(self.surrogates.factor >= 0.0) {
            return invalid(format!("surrogate factor = {}", self.surrogates.factor));
        }
        if !(self.polychronous.jitter_s >= 0.0) {
            return invalid(format!("jitter_s = {}", self.polychronous.jitter_s));
        }
        let fraction = self.polychronous.partial_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return invalid(format!("partial_fraction = {}", fraction));
        }
        Ok(())
    }
}

// ============================================================================
// SERDE HELPERS
// ============================================================================

/// Float arrays with NaN entries, written as JSON `null`
pub mod nan_as_null {
    use ndarray::Array1;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &Array1<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        values
            .iter()
            .map(|v| if v.is_nan() { None } else { Some(*v) })
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Array1<f64>, D::Error> {
        let values = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}
