//! # HANA Segmentation: Axons and Dendrites from Spike-Triggered Averages
//!
//! Classifies every electrode under a neuron as axonal, dendritic or neither.
//!
//! The spike-triggered average of a neuron shows, on each electrode, a
//! negative peak where the action potential travels along the axon and a
//! positive peak (the return current) where the dendrites are. Real signals
//! are spatially coherent: neighboring electrodes see similar peak times,
//! while noise produces peak times spread uniformly over the trace.
//!
//! This crate provides:
//! - Neighborhood mean and standard deviation of per-electrode measurements
//! - Peak timing and the axon initial segment (AIS)
//! - A noise threshold from the valley between signal and random spread
//! - Half-peak domain of a waveform via cubic spline interpolation
//! - Axon and dendrite segmentation, per neuron and in batch

use hana_core::{
    nan_as_null, ElectrodeSet, HanaError, Micrometers, Microvolts, Millis, NeuronId,
    PeakPolarity, SegmentationConfig, Trace, TraceSource,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SegmentationError {
    #[error(transparent)]
    Core(#[from] HanaError),
    #[error("Adjacency is {rows}x{cols} but there are {electrodes} electrodes")]
    AdjacencyMismatch {
        rows: usize,
        cols: usize,
        electrodes: usize,
    },
    #[error("Interpolation needs at least {needed} samples, got {got}")]
    TooFewSamples { needed: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, SegmentationError>;

// ============================================================================
// NEIGHBORHOOD STATISTICS
// ============================================================================

/// Mean and sample standard deviation over each electrode's neighborhood
#[derive(Debug, Clone, Serialize)]
pub struct NeighborhoodStatistics {
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
}

/// Neighborhood statistics of a per-electrode measurement.
///
/// The neighborhood of electrode `j` is every `i` with `neighbors[[i, j]]`.
/// An empty neighborhood gives NaN for both mean and std; a neighborhood of
/// one electrode gives a NaN std (n - 1 = 0).
pub fn neighborhood_statistics(
    values: ArrayView1<f64>,
    neighbors: ArrayView2<bool>,
) -> Result<NeighborhoodStatistics> {
    let n = values.len();
    check_adjacency(neighbors, n)?;

    let mut mean = Array1::from_elem(n, f64::NAN);
    let mut std = Array1::from_elem(n, f64::NAN);

    for (j, column) in neighbors.columns().into_iter().enumerate() {
        let members: Vec<f64> = column
            .iter()
            .zip(values.iter())
            .filter_map(|(&is_neighbor, &v)| is_neighbor.then_some(v))
            .collect();
        let count = members.len();
        if count == 0 {
            continue;
        }
        let m = members.iter().sum::<f64>() / count as f64;
        mean[j] = m;
        if count > 1 {
            let ss: f64 = members.iter().map(|v| (v - m).powi(2)).sum();
            std[j] = (ss / (count - 1) as f64).sqrt();
        }
    }

    Ok(NeighborhoodStatistics { mean, std })
}

fn check_adjacency(neighbors: ArrayView2<bool>, electrodes: usize) -> Result<()> {
    let (rows, cols) = neighbors.dim();
    if rows != electrodes || cols != electrodes {
        return Err(SegmentationError::AdjacencyMismatch {
            rows,
            cols,
            electrodes,
        });
    }
    Ok(())
}

// ============================================================================
// PEAKS
// ============================================================================

/// Index of the first most negative (or most positive) value
fn arg_extreme<'a>(values: impl IntoIterator<Item = &'a f64>, polarity: PeakPolarity) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.into_iter().enumerate() {
        let better = match best {
            None => true,
            Some((_, b)) => match polarity {
                PeakPolarity::Negative => v < b,
                PeakPolarity::Positive => v > b,
            },
        };
        if better {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

/// Electrode with the most negative voltage, near the (proximal) AIS
pub fn find_ais(voltage: ArrayView2<Microvolts>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for ((electrode, _), &v) in voltage.indexed_iter() {
        if best.map_or(true, |(_, b)| v < b) {
            best = Some((electrode, v));
        }
    }
    best.map(|(electrode, _)| electrode)
}

/// Time of the negative (positive) peak on each electrode
pub fn find_peaks(
    voltage: ArrayView2<Microvolts>,
    time: ArrayView1<Millis>,
    polarity: PeakPolarity,
) -> Array1<Millis> {
    voltage
        .rows()
        .into_iter()
        .map(|row| arg_extreme(row.iter(), polarity).map_or(f64::NAN, |i| time[i]))
        .collect()
}

// ============================================================================
// NOISE THRESHOLD
// ============================================================================

/// Standard deviation of delays drawn uniformly over the observed range
pub fn expected_std_for_random_delays(delay: ArrayView1<Millis>) -> Millis {
    let finite = delay.iter().copied().filter(|d| d.is_finite());
    let (min, max) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), d| {
        (lo.min(d), hi.max(d))
    });
    if min > max {
        return f64::NAN;
    }
    (max - min) / 12f64.sqrt()
}

/// Threshold at the valley between the peak of coherent signals (small
/// neighborhood std) and the random peak near `expected_std`.
///
/// The histogram spans `[0, expected_std)` in steps of `bin_width`. When
/// that range holds no complete bin the threshold is 0 and nothing passes.
pub fn find_valley(std: ArrayView1<Millis>, expected_std: Millis, bin_width: Millis) -> Millis {
    if !(expected_std > 0.0) || !(bin_width > 0.0) {
        return 0.0;
    }
    let n_edges = (expected_std / bin_width).ceil() as usize;
    if n_edges < 2 {
        return 0.0;
    }
    let edges: Vec<f64> = (0..n_edges).map(|k| k as f64 * bin_width).collect();
    let n_bins = n_edges - 1;
    let last_edge = edges[n_bins];

    let mut hist = vec![0usize; n_bins];
    for &s in std.iter().filter(|s| s.is_finite()) {
        if s < 0.0 || s > last_edge {
            continue;
        }
        // half-open bins, the last one closed
        let bin = (edges.partition_point(|&e| e <= s) - 1).min(n_bins - 1);
        hist[bin] += 1;
    }

    let index_thr = hist
        .iter()
        .enumerate()
        .min_by_key(|(_, &count)| count)
        .map_or(0, |(i, _)| i);
    edges[index_thr + 1]
}

// ============================================================================
// HALF-PEAK DOMAIN (cubic spline)
// ============================================================================

/// Natural cubic spline through (x, y)
#[derive(Debug, Clone)]
struct CubicSpline {
    x: Vec<f64>,
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
    d: Vec<f64>,
}

impl CubicSpline {
    fn natural(x: &[f64], y: &[f64]) -> Result<Self> {
        let n = x.len();
        if n < 2 || y.len() != n {
            return Err(SegmentationError::TooFewSamples {
                needed: 2,
                got: n.min(y.len()),
            });
        }
        let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();

        let mut c = vec![0.0; n];
        if n > 2 {
            let mut l = vec![1.0; n];
            let mut mu = vec![0.0; n];
            let mut z = vec![0.0; n];
            for i in 1..n - 1 {
                let alpha = 3.0 / h[i] * (y[i + 1] - y[i]) - 3.0 / h[i - 1] * (y[i] - y[i - 1]);
                l[i] = 2.0 * (x[i + 1] - x[i - 1]) - h[i - 1] * mu[i - 1];
                mu[i] = h[i] / l[i];
                z[i] = (alpha - h[i - 1] * z[i - 1]) / l[i];
            }
            for j in (0..n - 1).rev() {
                c[j] = z[j] - mu[j] * c[j + 1];
            }
        }

        let mut b = vec![0.0; n - 1];
        let mut d = vec![0.0; n - 1];
        for j in 0..n - 1 {
            b[j] = (y[j + 1] - y[j]) / h[j] - h[j] * (c[j + 1] + 2.0 * c[j]) / 3.0;
            d[j] = (c[j + 1] - c[j]) / (3.0 * h[j]);
        }

        Ok(Self {
            x: x.to_vec(),
            a: y.to_vec(),
            b,
            c,
            d,
        })
    }

    fn segment(&self, j: usize, t: f64) -> f64 {
        let dt = t - self.x[j];
        self.a[j] + dt * (self.b[j] + dt * (self.c[j] + dt * self.d[j]))
    }

    #[cfg(test)]
    fn eval(&self, t: f64) -> f64 {
        let last = self.b.len() - 1;
        let j = self.x.partition_point(|&xi| xi <= t).saturating_sub(1).min(last);
        self.segment(j, t)
    }

    fn bisect(&self, j: usize, mut lo: f64, mut hi: f64, level: f64) -> f64 {
        let mut f_lo = self.segment(j, lo) - level;
        for _ in 0..60 {
            let mid = 0.5 * (lo + hi);
            let f_mid = self.segment(j, mid) - level;
            if f_mid == 0.0 {
                return mid;
            }
            if f_mid.signum() == f_lo.signum() {
                lo = mid;
                f_lo = f_mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }

    /// Sorted x where the spline crosses `level`
    fn roots(&self, level: f64) -> Vec<f64> {
        const SUBDIVISIONS: usize = 8;

        let mut roots: Vec<f64> = Vec::new();
        let mut u0 = self.x[0];
        let mut f0 = self.a[0] - level;
        if f0 == 0.0 {
            roots.push(u0);
        }

        for j in 0..self.b.len() {
            let (lo, hi) = (self.x[j], self.x[j + 1]);
            let step = (hi - lo) / SUBDIVISIONS as f64;
            for k in 1..=SUBDIVISIONS {
                // knots take the data value exactly
                let (u1, f1) = if k == SUBDIVISIONS {
                    (hi, self.a[j + 1] - level)
                } else {
                    let u = lo + step * k as f64;
                    (u, self.segment(j, u) - level)
                };
                if f1 == 0.0 {
                    if roots.last().map_or(true, |&r| r < u1) {
                        roots.push(u1);
                    }
                } else if f0 != 0.0 && f0.signum() != f1.signum() {
                    roots.push(self.bisect(j, u0.max(lo), u1, level));
                }
                u0 = u1;
                f0 = f1;
            }
        }
        roots
    }
}

/// Interval around the peak of y(x) where the spline interpolant crosses
/// half the peak value (baseline assumed at 0).
///
/// If no crossing exists on one side, the end of the domain is used.
pub fn half_peak_domain(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    polarity: PeakPolarity,
) -> Result<(f64, f64)> {
    let x = x.to_vec();
    let y = y.to_vec();
    let index_peak = arg_extreme(y.iter(), polarity).ok_or(SegmentationError::TooFewSamples {
        needed: 2,
        got: 0,
    })?;
    let (x_peak, y_peak) = (x[index_peak], y[index_peak]);

    let spline = CubicSpline::natural(&x, &y)?;
    let mut roots = vec![x[0]];
    roots.extend(spline.roots(y_peak / 2.0));
    roots.push(x[x.len() - 1]);

    let index = roots.partition_point(|&r| r < x_peak).clamp(1, roots.len() - 1);
    Ok((roots[index - 1], roots[index]))
}

pub fn half_peak_width(x: ArrayView1<f64>, y: ArrayView1<f64>, polarity: PeakPolarity) -> Result<f64> {
    let (lo, hi) = half_peak_domain(x, y, polarity)?;
    Ok(hi - lo)
}

/// From the negative peak to the largest positive value after it
pub fn peak_peak_domain(x: ArrayView1<f64>, y: ArrayView1<f64>) -> Option<(f64, f64)> {
    let index_neg = arg_extreme(y.iter(), PeakPolarity::Negative)?;
    let index_pos = index_neg + arg_extreme(y.iter().skip(index_neg), PeakPolarity::Positive)?;
    Some((x[index_neg], x[index_pos]))
}

pub fn peak_peak_width(x: ArrayView1<f64>, y: ArrayView1<f64>) -> Option<f64> {
    peak_peak_domain(x, y).map(|(lo, hi)| hi - lo)
}

// ============================================================================
// AXON AND DENDRITE
// ============================================================================

/// All intermediate results of the axon segmentation
#[derive(Debug, Clone, Serialize)]
pub struct AxonSegmentation {
    /// Negative peak time per electrode (ms)
    pub delay: Array1<Millis>,
    pub mean_delay: Array1<Millis>,
    pub std_delay: Array1<Millis>,
    pub expected_std_delay: Millis,
    pub threshold: Millis,
    pub valid_delay: Array1<bool>,
    pub ais: usize,
    /// Neighborhood delay later than the AIS
    pub positive_delay: Array1<bool>,
    pub axon: Array1<bool>,
}

/// All intermediate results of the dendrite segmentation
#[derive(Debug, Clone, Serialize)]
pub struct DendriteSegmentation {
    /// Positive peak time per electrode (ms)
    pub delay: Array1<Millis>,
    pub mean_delay: Array1<Millis>,
    pub std_delay: Array1<Millis>,
    pub expected_std_delay: Millis,
    pub threshold: Millis,
    pub valid_delay: Array1<bool>,
    pub ais: usize,
    /// Half-peak domain of the AIS waveform (ms)
    pub window: (Millis, Millis),
    pub return_current_delay: Array1<bool>,
    pub dendrite: Array1<bool>,
}

struct PeakStatistics {
    delay: Array1<Millis>,
    stats: NeighborhoodStatistics,
    expected_std: Millis,
    threshold: Millis,
    valid: Array1<bool>,
}

fn peak_statistics(
    trace: &Trace,
    time_ms: ArrayView1<Millis>,
    neighbors: ArrayView2<bool>,
    polarity: PeakPolarity,
    config: &SegmentationConfig,
) -> Result<PeakStatistics> {
    let delay = find_peaks(trace.voltage().view(), time_ms, polarity);
    let stats = neighborhood_statistics(delay.view(), neighbors)?;
    let expected_std = expected_std_for_random_delays(delay.view());
    let threshold = find_valley(stats.std.view(), expected_std, config.delay_bin_ms);
    // NaN std (degenerate neighborhood) never passes
    let valid = stats.std.mapv(|s| s < threshold);
    debug!(
        ?polarity,
        expected_std, threshold, "peak timing threshold"
    );
    Ok(PeakStatistics {
        delay,
        stats,
        expected_std,
        threshold,
        valid,
    })
}

fn ais_of(trace: &Trace) -> Result<usize> {
    find_ais(trace.voltage().view())
        .ok_or_else(|| HanaError::MalformedInput("trace without samples".into()).into())
}

pub fn segment_axon_verbose(
    trace: &Trace,
    neighbors: ArrayView2<bool>,
    config: &SegmentationConfig,
) -> Result<AxonSegmentation> {
    check_adjacency(neighbors, trace.n_electrodes())?;
    let time_ms = trace.time_ms();
    let ais = ais_of(trace)?;
    let peaks = peak_statistics(trace, time_ms.view(), neighbors, PeakPolarity::Negative, config)?;

    let ais_delay = peaks.delay[ais];
    let positive_delay = peaks.stats.mean.mapv(|m| m > ais_delay);
    let axon = ndarray::Zip::from(&peaks.valid)
        .and(&positive_delay)
        .map_collect(|&valid, &positive| valid && positive);

    Ok(AxonSegmentation {
        delay: peaks.delay,
        mean_delay: peaks.stats.mean,
        std_delay: peaks.stats.std,
        expected_std_delay: peaks.expected_std,
        threshold: peaks.threshold,
        valid_delay: peaks.valid,
        ais,
        positive_delay,
        axon,
    })
}

/// Axonal delay (ms) per electrode, NaN where no axon was detected
pub fn segment_axon(
    trace: &Trace,
    neighbors: ArrayView2<bool>,
    config: &SegmentationConfig,
) -> Result<Array1<Millis>> {
    let segmentation = segment_axon_verbose(trace, neighbors, config)?;
    Ok(restrict_to_compartment(&segmentation.mean_delay, &segmentation.axon))
}

pub fn segment_dendrite_verbose(
    trace: &Trace,
    neighbors: ArrayView2<bool>,
    config: &SegmentationConfig,
) -> Result<DendriteSegmentation> {
    check_adjacency(neighbors, trace.n_electrodes())?;
    let time_ms = trace.time_ms();
    let ais = ais_of(trace)?;
    let peaks = peak_statistics(trace, time_ms.view(), neighbors, PeakPolarity::Positive, config)?;

    let window = half_peak_domain(
        time_ms.view(),
        trace.voltage().row(ais),
        config.ais_window_polarity,
    )?;
    let (min_delay, max_delay) = window;
    let return_current_delay = peaks.stats.mean.mapv(|m| m > min_delay && m < max_delay);
    let dendrite = ndarray::Zip::from(&peaks.valid)
        .and(&return_current_delay)
        .map_collect(|&valid, &in_window| valid && in_window);

    Ok(DendriteSegmentation {
        delay: peaks.delay,
        mean_delay: peaks.stats.mean,
        std_delay: peaks.stats.std,
        expected_std_delay: peaks.expected_std,
        threshold: peaks.threshold,
        valid_delay: peaks.valid,
        ais,
        window,
        return_current_delay,
        dendrite,
    })
}

/// Dendritic return current (peak positive voltage, uV) per electrode, NaN
/// where no dendrite was detected
pub fn segment_dendrite(
    trace: &Trace,
    neighbors: ArrayView2<bool>,
    config: &SegmentationConfig,
) -> Result<Array1<Microvolts>> {
    let segmentation = segment_dendrite_verbose(trace, neighbors, config)?;
    let positive_voltage: Array1<f64> = trace
        .voltage()
        .rows()
        .into_iter()
        .map(|row| row.iter().copied().fold(f64::NEG_INFINITY, f64::max))
        .collect();
    Ok(restrict_to_compartment(&positive_voltage, &segmentation.dendrite))
}

/// Measurement where the electrode belongs to the compartment, NaN otherwise
pub fn restrict_to_compartment(measurement: &Array1<f64>, compartment: &Array1<bool>) -> Array1<f64> {
    ndarray::Zip::from(measurement)
        .and(compartment)
        .map_collect(|&m, &inside| if inside { m } else { f64::NAN })
}

// ============================================================================
// COMPARTMENTS
// ============================================================================

/// Segmentation result of a single neuron
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compartments {
    pub trigger: Option<usize>,
    pub ais: usize,
    pub axon: Array1<bool>,
    pub dendrite: Array1<bool>,
    /// Axonal delay (ms), NaN where absent
    #[serde(with = "nan_as_null")]
    pub axonal_delay: Array1<Millis>,
    /// Dendritic return current (uV), NaN where absent
    #[serde(with = "nan_as_null")]
    pub dendrite_return_current: Array1<Microvolts>,
    pub axon_electrodes: usize,
    pub dendrite_electrodes: usize,
}

impl Compartments {
    /// Whether the neuron has a plausible axon and at least some dendrite
    pub fn is_retained(&self, config: &SegmentationConfig) -> bool {
        self.dendrite_electrodes > config.min_dendrite_electrodes
            && self.axon_electrodes >= config.min_axon_electrodes
            && self.axon_electrodes <= config.max_axon_electrodes
    }
}

/// Segment AIS, axon and dendrite of a single neuron
pub fn extract_compartments(
    trace: &Trace,
    neighbors: ArrayView2<bool>,
    config: &SegmentationConfig,
) -> Result<Compartments> {
    let axonal_delay = segment_axon(trace, neighbors, config)?;
    let dendrite_return_current = segment_dendrite(trace, neighbors, config)?;
    let axon = axonal_delay.mapv(f64::is_finite);
    let dendrite = dendrite_return_current.mapv(f64::is_finite);
    let axon_electrodes = axon.iter().filter(|&&b| b).count();
    let dendrite_electrodes = dendrite.iter().filter(|&&b| b).count();

    debug!(
        "{} electrodes near axons, {} electrodes near dendrites",
        axon_electrodes, dendrite_electrodes
    );

    Ok(Compartments {
        trigger: trace.trigger(),
        ais: ais_of(trace)?,
        axon,
        dendrite,
        axonal_delay,
        dendrite_return_current,
        axon_electrodes,
        dendrite_electrodes,
    })
}

/// Compartments of every retained neuron
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompartmentTable {
    neurons: BTreeMap<NeuronId, Compartments>,
}

impl CompartmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, neuron: NeuronId, compartments: Compartments) {
        self.neurons.insert(neuron, compartments);
    }

    pub fn get(&self, neuron: NeuronId) -> Option<&Compartments> {
        self.neurons.get(&neuron)
    }

    pub fn len(&self) -> usize {
        self.neurons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neurons.is_empty()
    }

    pub fn neurons(&self) -> impl Iterator<Item = NeuronId> + '_ {
        self.neurons.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NeuronId, &Compartments)> + '_ {
        self.neurons.iter().map(|(&n, c)| (n, c))
    }

    pub fn axonal_delays(&self) -> BTreeMap<NeuronId, &Array1<Millis>> {
        self.iter().map(|(n, c)| (n, &c.axonal_delay)).collect()
    }

    pub fn dendrite_peaks(&self) -> BTreeMap<NeuronId, &Array1<Microvolts>> {
        self.iter().map(|(n, c)| (n, &c.dendrite_return_current)).collect()
    }
}

/// Segment every requested neuron and keep those with axon and dendrite.
///
/// Neurons outside the electrode-count bounds are dropped and logged.
/// A trace that cannot be loaded or is malformed aborts the batch.
pub fn extract_all_compartments<S: TraceSource>(
    source: &S,
    neurons: &[NeuronId],
    neighbors: ArrayView2<bool>,
    config: &SegmentationConfig,
) -> Result<CompartmentTable> {
    let mut table = CompartmentTable::new();

    for &neuron in neurons {
        let trace = source.load(neuron)?;
        let compartments = extract_compartments(&trace, neighbors, config)?;
        if compartments.is_retained(config) {
            table.insert(neuron, compartments);
        } else {
            warn!(
                neuron,
                axon = compartments.axon_electrodes,
                dendrite = compartments.dendrite_electrodes,
                "No axonal and dendritic compartment(s), neuron dropped"
            );
        }
    }

    info!(
        "Neurons with axonal and dendritic arbors: {} of {} ({:?})",
        table.len(),
        neurons.len(),
        table.neurons().collect::<Vec<_>>()
    );
    Ok(table)
}

/// Neuron position = position of its trigger electrode
pub fn neuron_positions(
    table: &CompartmentTable,
    electrodes: &ElectrodeSet,
) -> BTreeMap<NeuronId, (Micrometers, Micrometers)> {
    table
        .iter()
        .filter_map(|(neuron, c)| Some((neuron, electrodes.position(c.trigger?)?)))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use hana_core::NeighborhoodConfig;
    use ndarray::array;

    /// Electrodes on a line, 10 um apart: neighbors are i-1, i, i+1
    fn line_electrodes(n: usize) -> ElectrodeSet {
        ElectrodeSet::new((0..n).map(|i| i as f64 * 10.0).collect(), vec![0.0; n]).unwrap()
    }

    /// Trace sampled every 0.01 ms. Electrode 0 is the AIS with a smooth
    /// negative peak at sample 20; every other electrode has a single-sample
    /// negative peak at `dip(i)` and a single-sample positive peak at `bump(i)`.
    fn synthetic_trace(
        n: usize,
        dip: impl Fn(usize) -> usize,
        bump: impl Fn(usize) -> usize,
    ) -> Trace {
        let samples = 200;
        let mut voltage = Array2::zeros((n, samples));
        for k in 0..samples {
            voltage[[0, k]] = -100.0 * (-((k as f64 - 20.0).powi(2)) / 18.0).exp();
        }
        for i in 1..n {
            voltage[[i, dip(i)]] = -50.0;
        }
        for i in 0..n {
            voltage[[i, bump(i)]] += 10.0;
        }
        let time = Array1::from_shape_fn(samples, |k| k as f64 * 1e-5);
        Trace::new(voltage, time, line_electrodes(n), Some(0), None).unwrap()
    }

    fn neighbors_of(electrodes: &ElectrodeSet) -> Array2<bool> {
        electrodes.neighborhoods(&NeighborhoodConfig::default()).unwrap()
    }

    #[test]
    fn test_neighborhood_statistics() {
        let values = array![1.0, 2.0, 3.0];
        let neighbors = Array2::from_elem((3, 3), true);
        let stats = neighborhood_statistics(values.view(), neighbors.view()).unwrap();
        for j in 0..3 {
            assert_relative_eq!(stats.mean[j], 2.0);
            assert_relative_eq!(stats.std[j], 1.0);
        }
    }

    #[test]
    fn test_neighborhood_statistics_degenerate() {
        let values = array![1.0, 2.0, 3.0];
        let mut neighbors = Array2::from_elem((3, 3), false);
        neighbors[[1, 1]] = true;
        let stats = neighborhood_statistics(values.view(), neighbors.view()).unwrap();

        // no neighbors at all
        assert!(stats.mean[0].is_nan());
        assert!(stats.std[0].is_nan());
        // a single neighbor: mean defined, std undefined
        assert_relative_eq!(stats.mean[1], 2.0);
        assert!(stats.std[1].is_nan());
    }

    #[test]
    fn test_neighborhood_statistics_shape_mismatch() {
        let values = array![1.0, 2.0];
        let neighbors = Array2::from_elem((3, 3), true);
        assert!(matches!(
            neighborhood_statistics(values.view(), neighbors.view()),
            Err(SegmentationError::AdjacencyMismatch { .. })
        ));
    }

    #[test]
    fn test_find_ais_and_peaks() {
        let voltage = array![[0.0, -1.0, 2.0], [0.0, 3.0, -4.0], [1.0, -2.0, 0.0]];
        let time = array![0.0, 0.1, 0.2];
        assert_eq!(find_ais(voltage.view()), Some(1));

        let negative = find_peaks(voltage.view(), time.view(), PeakPolarity::Negative);
        assert_eq!(negative, array![0.1, 0.2, 0.1]);
        let positive = find_peaks(voltage.view(), time.view(), PeakPolarity::Positive);
        assert_eq!(positive, array![0.2, 0.1, 0.0]);
    }

    #[test]
    fn test_expected_std_for_random_delays() {
        let delay = array![0.0, 1.2, f64::NAN, 3.464];
        assert_relative_eq!(expected_std_for_random_delays(delay.view()), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_find_valley() {
        // signal peak in [0, 0.05), empty [0.05, 0.1), noise above
        let std = array![0.01, 0.02, 0.03, 0.12, 0.13, 0.17, 0.5];
        let thr = find_valley(std.view(), 0.2, 0.05);
        assert_relative_eq!(thr, 0.1);
    }

    #[test]
    fn test_find_valley_flat_trace() {
        let std = array![0.0, 0.0];
        assert_eq!(find_valley(std.view(), 0.0, 0.05), 0.0);
        assert_eq!(find_valley(std.view(), 0.04, 0.05), 0.0);
    }

    #[test]
    fn test_spline_interpolates_knots() {
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        let y = [0.0, 1.0, 0.0, -1.0, 0.0];
        let spline = CubicSpline::natural(&x, &y).unwrap();
        for (xi, yi) in x.iter().zip(y.iter()) {
            assert_abs_diff_eq!(spline.eval(*xi), *yi, epsilon = 1e-12);
        }
        let roots = spline.roots(0.0);
        assert_eq!(roots.len(), 3);
        assert_abs_diff_eq!(roots[1], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_half_peak_domain_gaussian() {
        let x = Array1::from_shape_fn(101, |k| k as f64 * 0.1);
        let y = x.mapv(|v: f64| -(-(v - 5.0).powi(2) / 2.0).exp());
        let (lo, hi) = half_peak_domain(x.view(), y.view(), PeakPolarity::Negative).unwrap();
        let half_width = (2.0 * 2f64.ln()).sqrt();
        assert_abs_diff_eq!(lo, 5.0 - half_width, epsilon = 1e-2);
        assert_abs_diff_eq!(hi, 5.0 + half_width, epsilon = 1e-2);

        let width = half_peak_width(x.view(), y.view(), PeakPolarity::Negative).unwrap();
        assert_abs_diff_eq!(width, 2.0 * half_width, epsilon = 2e-2);
    }

    #[test]
    fn test_half_peak_domain_peak_at_edge() {
        let x = array![0.0, 1.0, 2.0, 3.0];
        let y = array![-4.0, -3.0, -1.0, 0.0];
        let (lo, hi) = half_peak_domain(x.view(), y.view(), PeakPolarity::Negative).unwrap();
        assert_eq!(lo, 0.0);
        assert!(hi > 1.0 && hi < 2.0);
    }

    #[test]
    fn test_peak_peak_domain() {
        let x = array![0.0, 1.0, 2.0, 3.0, 4.0];
        let y = array![5.0, -3.0, 1.0, 2.0, 0.5];
        assert_eq!(peak_peak_domain(x.view(), y.view()), Some((1.0, 3.0)));
        assert_eq!(peak_peak_width(x.view(), y.view()), Some(2.0));
    }

    #[test]
    fn test_axon_propagating_outward() {
        // every electrode peaks one sample after its neighbor toward the AIS
        let n = 40;
        let trace = synthetic_trace(n, |i| 20 + i, |_| 150);
        let neighbors = neighbors_of(trace.electrodes());
        let axon = segment_axon_verbose(&trace, neighbors.view(), &SegmentationConfig::default()).unwrap();

        assert_eq!(axon.ais, 0);
        assert_relative_eq!(axon.threshold, 0.1, epsilon = 1e-12);
        for i in 1..n {
            assert!(axon.axon[i], "electrode {} not axonal", i);
        }
        let delay = restrict_to_compartment(&axon.mean_delay, &axon.axon);
        assert!(delay.iter().skip(1).all(|d| d.is_finite()));
    }

    #[test]
    fn test_axon_rejects_scattered_delays() {
        let n = 40;
        let trace = synthetic_trace(n, |i| if i < 5 { 20 + i } else { 60 + (37 * i) % 100 }, |_| 199);
        let neighbors = neighbors_of(trace.electrodes());
        let delay = segment_axon(&trace, neighbors.view(), &SegmentationConfig::default()).unwrap();
        let count = delay.iter().filter(|d| d.is_finite()).count();
        assert!(count < 7, "{} axonal electrodes", count);
    }

    #[test]
    fn test_dendrite_in_ais_window() {
        let n = 40;
        let trace = synthetic_trace(n, |i| 20 + i, |i| if i >= 30 { 20 } else { 40 + (37 * i) % 100 });
        let neighbors = neighbors_of(trace.electrodes());
        let config = SegmentationConfig::default();
        let dendrite = segment_dendrite_verbose(&trace, neighbors.view(), &config).unwrap();

        let (lo, hi) = dendrite.window;
        assert!(lo < 0.2 && hi > 0.2);
        assert_abs_diff_eq!(hi - lo, 2.0 * 0.03 * (2.0 * 2f64.ln()).sqrt(), epsilon = 5e-3);
        for i in 31..n {
            assert!(dendrite.dendrite[i], "electrode {} not dendritic", i);
        }
        for i in 0..30 {
            assert!(!dendrite.dendrite[i], "electrode {} dendritic", i);
        }

        let amplitude = segment_dendrite(&trace, neighbors.view(), &config).unwrap();
        assert_relative_eq!(amplitude[35], 10.0);
        assert!(amplitude[5].is_nan());
    }

    #[test]
    fn test_extract_all_compartments_filters() {
        let n = 40;
        let mut traces = BTreeMap::new();
        traces.insert(
            1,
            synthetic_trace(n, |i| 20 + i, |i| if i >= 30 { 20 } else { 40 + (37 * i) % 100 }),
        );
        // too few axonal electrodes
        traces.insert(
            2,
            synthetic_trace(
                n,
                |i| if i < 5 { 20 + i } else { 60 + (37 * i) % 100 },
                |i| if i >= 30 { 20 } else { 40 + (37 * i) % 100 },
            ),
        );
        let neighbors = neighbors_of(&line_electrodes(n));
        let table = extract_all_compartments(
            &traces,
            &[1, 2],
            neighbors.view(),
            &SegmentationConfig::default(),
        )
        .unwrap();

        assert_eq!(table.neurons().collect::<Vec<_>>(), vec![1]);
        let kept = table.get(1).unwrap();
        assert_eq!(kept.ais, 0);
        assert_eq!(kept.trigger, Some(0));
        assert!(kept.axon_electrodes >= 7);
        assert!(kept.dendrite_electrodes > 0);
        assert!(table.get(2).is_none());
    }

    #[test]
    fn test_extract_all_compartments_unknown_neuron() {
        let traces: BTreeMap<NeuronId, Trace> = BTreeMap::new();
        let neighbors = Array2::from_elem((1, 1), true);
        let result = extract_all_compartments(&traces, &[3], neighbors.view(), &SegmentationConfig::default());
        assert!(matches!(
            result,
            Err(SegmentationError::Core(HanaError::UnknownNeuron(3)))
        ));
    }

    #[test]
    fn test_neuron_positions() {
        let n = 40;
        let mut traces = BTreeMap::new();
        traces.insert(
            4,
            synthetic_trace(n, |i| 20 + i, |i| if i >= 30 { 20 } else { 40 + (37 * i) % 100 }),
        );
        let electrodes = line_electrodes(n);
        let neighbors = neighbors_of(&electrodes);
        let table =
            extract_all_compartments(&traces, &[4], neighbors.view(), &SegmentationConfig::default()).unwrap();
        let positions = neuron_positions(&table, &electrodes);
        assert_eq!(positions[&4], (0.0, 0.0));
    }
}
