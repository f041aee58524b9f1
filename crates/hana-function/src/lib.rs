//! # HANA Function: Connectivity from Spike Timing
//!
//! Infers functional connections between neurons from the time lags between
//! their spikes.
//!
//! For every ordered pair (pre, post) the lags from each presynaptic spike to
//! the nearest preceding and succeeding postsynaptic spike are histogrammed.
//! The same histogram computed against randomized postsynaptic trains
//! (surrogates) gives a per-bin null distribution and thus a standard score.
//! A connection is accepted when its peak score survives Benjamini-Hochberg
//! correction over all pooled scores.
//!
//! ## Stages
//!
//! | Function | Output |
//! |----------|--------|
//! | `timelag_by_sawtooth` | sorted lags of one pair (s) |
//! | `timelag_hist` | fixed-window lag histogram |
//! | `generate_surrogates` | seeded surrogate trains per neuron |
//! | `all_timelag_standardscore` | standard scores of every ordered pair |
//! | `all_peaks` | peak strength and lag of significant pairs |

use hana_core::{
    all_pairs, DelayTable, EventTrain, EventTrains, HanaError, Millis, NeuronId, NeuronPair,
    Seconds, SurrogateConfig, SurrogateMethod, TimeLagConfig,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum FunctionError {
    #[error(transparent)]
    Core(#[from] HanaError),
    #[error("No surrogate trains for neuron {0}")]
    MissingSurrogates(NeuronId),
    #[error("Pair {pair} has {got} standard scores for {expected} time lags")]
    ScoreLength {
        pair: NeuronPair,
        expected: usize,
        got: usize,
    },
}

pub type Result<T> = std::result::Result<T, FunctionError>;

// ============================================================================
// TIME LAGS
// ============================================================================

/// Lags (s) from every event of `a` to the nearest preceding and the nearest
/// succeeding event of `b`, by exhaustive scan. Reference implementation.
pub fn timelag_by_for_loop(a: &EventTrain, b: &EventTrain) -> Vec<Seconds> {
    let mut preceding = Vec::with_capacity(a.len());
    let mut succeeding = Vec::with_capacity(a.len());
    for &t1 in a.times() {
        if let Some(t2) = b.times().iter().rev().find(|&&t2| t2 < t1) {
            preceding.push(t2 - t1);
        }
        if let Some(t2) = b.times().iter().find(|&&t2| t2 > t1) {
            succeeding.push(t2 - t1);
        }
    }
    let mut lags = preceding;
    lags.extend(succeeding);
    lags.sort_by(|x, y| x.total_cmp(y));
    lags
}

/// Time to the next event as a piecewise linear function of time.
///
/// Between two events it falls linearly from the gap to zero. Before the
/// first event it is the distance to the first event; from the last event on
/// it is undefined.
#[derive(Debug, Clone)]
pub struct Sawtooth {
    knots: Vec<Seconds>,
}

impl Sawtooth {
    pub fn new(times: &[Seconds]) -> Self {
        Self {
            knots: times.to_vec(),
        }
    }

    /// Sawtooth of the time-reversed train, for lags to preceding events
    pub fn mirrored(times: &[Seconds]) -> Self {
        Self {
            knots: times.iter().rev().map(|t| -t).collect(),
        }
    }

    pub fn value_at(&self, t: Seconds) -> Option<Seconds> {
        let k = self.knots.partition_point(|&b| b <= t);
        match k {
            _ if k == self.knots.len() => None,
            0 => Some(self.knots[0] - t),
            _ => {
                let start = self.knots[k - 1];
                let gap = self.knots[k] - start;
                Some(gap - (t - start))
            }
        }
    }
}

/// Same lags as [`timelag_by_for_loop`] in O(n log m)
pub fn timelag_by_sawtooth(a: &EventTrain, b: &EventTrain) -> Vec<Seconds> {
    let succeeding = Sawtooth::new(b.times());
    let preceding = Sawtooth::mirrored(b.times());

    let mut lags: Vec<Seconds> = a
        .times()
        .iter()
        .filter_map(|&t| preceding.value_at(-t).map(|lag| -lag))
        .chain(a.times().iter().filter_map(|&t| succeeding.value_at(t)))
        .collect();
    lags.sort_by(|x, y| x.total_cmp(y));
    lags
}

/// Default time lag computation
pub fn timelag(a: &EventTrain, b: &EventTrain) -> Vec<Seconds> {
    timelag_by_sawtooth(a, b)
}

// ============================================================================
// HISTOGRAM
// ============================================================================

/// Counts of time lags in equal bins; the last bin includes its right edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeLagHistogram {
    pub edges: Vec<Seconds>,
    pub counts: Vec<u64>,
}

impl TimeLagHistogram {
    pub fn bins(&self) -> usize {
        self.counts.len()
    }

    /// Bin midpoints (ms)
    pub fn bin_centers_ms(&self) -> Vec<Millis> {
        self.edges
            .windows(2)
            .map(|e| (e[0] + e[1]) / 2.0 * 1000.0)
            .collect()
    }
}

fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (stop - start) / (n - 1) as f64;
    (0..n)
        .map(|k| if k == n - 1 { stop } else { start + k as f64 * step })
        .collect()
}

/// Histogram of lags within `[min_lag_s, max_lag_s]`; lags outside are ignored
pub fn timelag_hist(lags: &[Seconds], config: &TimeLagConfig) -> TimeLagHistogram {
    let bins = config.bins.max(1);
    let edges = linspace(config.min_lag_s, config.max_lag_s, bins + 1);
    let (first, last) = (edges[0], edges[bins]);
    let norm = bins as f64 / (last - first);

    let mut counts = vec![0u64; bins];
    for &lag in lags.iter().filter(|l| l.is_finite()) {
        if lag < first || lag > last {
            continue;
        }
        let mut index = (((lag - first) * norm) as usize).min(bins - 1);
        // rounding near the edges
        if lag < edges[index] {
            index -= 1;
        } else if lag >= edges[index + 1] && index + 1 < bins {
            index += 1;
        }
        counts[index] += 1;
    }

    TimeLagHistogram { edges, counts }
}

// ============================================================================
// SURROGATES
// ============================================================================

/// Surrogate trains indexed by neuron
pub type SurrogateSet = BTreeMap<NeuronId, Vec<EventTrain>>;

fn from_gaps(start: Seconds, gaps: impl IntoIterator<Item = Seconds>) -> Result<EventTrain> {
    let mut times = vec![start];
    let mut t = start;
    for gap in gaps {
        t += gap;
        times.push(t);
    }
    Ok(EventTrain::from_sorted(times)?)
}

/// Reorder the inter-event gaps by jittering their indices with Gaussian
/// noise of standard deviation `factor` and sorting.
///
/// The first event, the event count and the multiset of gaps are preserved.
pub fn randomize_intervals_by_gaussian<R: Rng + ?Sized>(
    train: &EventTrain,
    factor: f64,
    rng: &mut R,
) -> Result<EventTrain> {
    let Some(start) = train.first() else {
        return Ok(train.clone());
    };
    let gaps = train.gaps();
    let normal = Normal::new(0.0, factor)
        .map_err(|e| HanaError::InvalidConfig(format!("surrogate factor {}: {}", factor, e)))?;

    let positions: Vec<f64> = (0..gaps.len())
        .map(|i| i as f64 + normal.sample(rng))
        .collect();
    let mut order: Vec<usize> = (0..gaps.len()).collect();
    order.sort_by(|&i, &j| positions[i].total_cmp(&positions[j]));

    from_gaps(start, order.into_iter().map(|i| gaps[i]))
}

/// Swap randomly chosen adjacent gaps, `factor` swaps per gap in total
pub fn randomize_intervals_by_swapping<R: Rng + ?Sized>(
    train: &EventTrain,
    factor: f64,
    rng: &mut R,
) -> Result<EventTrain> {
    let Some(start) = train.first() else {
        return Ok(train.clone());
    };
    let mut gaps = train.gaps();
    let length = gaps.len();
    if length < 2 {
        return Ok(train.clone());
    }

    let swaps = (factor * length as f64).round() as usize;
    for _ in 0..swaps {
        let index = rng.gen_range(0..length - 1);
        gaps.swap(index, index + 1);
    }

    from_gaps(start, gaps)
}

/// `config.count` surrogates of a single train
pub fn surrogate_trains<R: Rng + ?Sized>(
    train: &EventTrain,
    config: &SurrogateConfig,
    rng: &mut R,
) -> Result<Vec<EventTrain>> {
    (0..config.count)
        .map(|_| match config.method {
            SurrogateMethod::Gaussian => randomize_intervals_by_gaussian(train, config.factor, rng),
            SurrogateMethod::Swapping => randomize_intervals_by_swapping(train, config.factor, rng),
        })
        .collect()
}

/// Seed of the generator of a single neuron
fn neuron_seed(seed: u64, neuron: NeuronId) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ u64::from(neuron)
}

/// Surrogates of every neuron, generated in parallel.
///
/// Every neuron draws from its own generator seeded with `(seed, neuron)`,
/// so the result does not depend on scheduling.
pub fn generate_surrogates(trains: &EventTrains, config: &SurrogateConfig) -> Result<SurrogateSet> {
    info!(
        "Generating {} {:?} surrogates for {} neurons",
        config.count,
        config.method,
        trains.len()
    );
    trains
        .par_iter()
        .map(|(&neuron, train)| -> Result<(NeuronId, Vec<EventTrain>)> {
            let mut rng = StdRng::seed_from_u64(neuron_seed(config.seed, neuron));
            Ok((neuron, surrogate_trains(train, config, &mut rng)?))
        })
        .collect()
}

// ============================================================================
// STANDARD SCORES
// ============================================================================

/// Per-bin standard score of an observed lag histogram against surrogates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScore {
    /// Bin centres (ms)
    pub timelags_ms: Vec<Millis>,
    /// NaN where the surrogate counts do not vary
    pub score: Vec<f64>,
    pub observed: Vec<u64>,
    pub surrogate_mean: Vec<f64>,
    /// Population standard deviation over surrogates
    pub surrogate_std: Vec<f64>,
}

pub fn timelag_standardscore(
    a: &EventTrain,
    b: &EventTrain,
    surrogates: &[EventTrain],
    config: &TimeLagConfig,
) -> Result<StandardScore> {
    if surrogates.is_empty() {
        return Err(HanaError::MalformedInput("standard score without surrogate trains".into()).into());
    }

    let observed = timelag_hist(&timelag(a, b), config);
    let surrogate_counts: Vec<Vec<u64>> = surrogates
        .iter()
        .map(|surrogate| timelag_hist(&timelag(a, surrogate), config).counts)
        .collect();

    let n = surrogate_counts.len() as f64;
    let bins = observed.bins();
    let mut surrogate_mean = vec![0.0; bins];
    let mut surrogate_std = vec![0.0; bins];
    for bin in 0..bins {
        let mean = surrogate_counts.iter().map(|c| c[bin] as f64).sum::<f64>() / n;
        let var = surrogate_counts
            .iter()
            .map(|c| (c[bin] as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        surrogate_mean[bin] = mean;
        surrogate_std[bin] = var.sqrt();
    }

    let score = observed
        .counts
        .iter()
        .zip(surrogate_mean.iter().zip(surrogate_std.iter()))
        .map(|(&count, (&mean, &std))| {
            if std > 0.0 {
                (count as f64 - mean) / std
            } else {
                f64::NAN
            }
        })
        .collect();

    Ok(StandardScore {
        timelags_ms: observed.bin_centers_ms(),
        score,
        observed: observed.counts,
        surrogate_mean,
        surrogate_std,
    })
}

/// Standard scores of every ordered pair, aligned to shared bin centres
#[derive(Debug, Clone, Default)]
pub struct StandardScores {
    pub timelags_ms: Vec<Millis>,
    pub scores: BTreeMap<NeuronPair, Vec<f64>>,
    pub observed: BTreeMap<NeuronPair, Vec<u64>>,
}

impl StandardScores {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Standard scores for the full product of neurons, self-pairs included.
///
/// The post neuron's surrogates are used for every pair.
pub fn all_timelag_standardscore(
    trains: &EventTrains,
    surrogates: &SurrogateSet,
    config: &TimeLagConfig,
) -> Result<StandardScores> {
    let pairs = all_pairs(trains.keys());

    let results = pairs
        .par_iter()
        .map(|&pair| -> Result<(NeuronPair, StandardScore)> {
            let post_surrogates = surrogates
                .get(&pair.post)
                .ok_or(FunctionError::MissingSurrogates(pair.post))?;
            let score = timelag_standardscore(
                &trains[&pair.pre],
                &trains[&pair.post],
                post_surrogates,
                config,
            )?;
            debug!("Timeseries {}", pair);
            Ok((pair, score))
        })
        .collect::<Result<Vec<_>>>()?;

    let timelags_ms = timelag_hist(&[], config).bin_centers_ms();
    let mut scores = StandardScores {
        timelags_ms,
        ..Default::default()
    };
    for (pair, score) in results {
        scores.scores.insert(pair, score.score);
        scores.observed.insert(pair, score.observed);
    }

    info!("Standard scores for {} neuron pairs", scores.len());
    Ok(scores)
}

// ============================================================================
// FALSE DISCOVERY RATE
// ============================================================================

/// Two-sided p-values of standard scores
pub fn p_values(z_values: &[f64]) -> Vec<f64> {
    z_values
        .iter()
        .map(|z| libm::erfc(z.abs() / std::f64::consts::SQRT_2))
        .collect()
}

/// Benjamini-Hochberg step-up procedure for independent tests.
///
/// Rejects the `k` smallest p-values, where `k` is the largest rank with
/// `p_(k) <= k / m * alpha`. Returned in input order.
pub fn benjamini_hochberg(p_values: &[f64], alpha: f64) -> Vec<bool> {
    let m = p_values.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&i, &j| p_values[i].total_cmp(&p_values[j]));

    let reject_until = order
        .iter()
        .enumerate()
        .filter(|&(rank, &i)| p_values[i] <= (rank + 1) as f64 / m as f64 * alpha)
        .map(|(rank, _)| rank + 1)
        .last()
        .unwrap_or(0);

    let mut rejected = vec![false; m];
    for &i in &order[..reject_until] {
        rejected[i] = true;
    }
    rejected
}

/// Smallest |z| that passes Benjamini-Hochberg at false discovery rate
/// `alpha`. `None` if nothing passes. Non-finite scores are ignored.
pub fn bh_threshold_at(z_values: &[f64], alpha: f64) -> Option<f64> {
    let abs_z: Vec<f64> = z_values
        .iter()
        .filter(|z| z.is_finite())
        .map(|z| z.abs())
        .collect();
    if abs_z.is_empty() {
        return None;
    }
    let rejected = benjamini_hochberg(&p_values(&abs_z), alpha);
    abs_z
        .iter()
        .zip(rejected)
        .filter_map(|(&z, rejected)| rejected.then_some(z))
        .min_by(|a, b| a.total_cmp(b))
}

/// Threshold expecting at most one false positive among all scores
pub fn bh_threshold(z_values: &[f64]) -> Option<f64> {
    let m = z_values.iter().filter(|z| z.is_finite()).count();
    if m == 0 {
        return None;
    }
    bh_threshold_at(z_values, 1.0 / m as f64)
}

// ============================================================================
// PEAK DETECTION
// ============================================================================

/// Significant positive peaks: score and lag (ms) per connected pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakDetection {
    pub strength: DelayTable,
    pub delay: DelayTable,
    pub z_threshold: Option<f64>,
}

/// Largest standard score per pair, kept if it exceeds the BH threshold.
///
/// With structural delays only those pairs are tested, and only lags beyond
/// the axonal delay count (plus `minimal_synapse_delay` for the peak).
/// Returned lags include the axonal delay.
pub fn all_peaks(
    timelags_ms: &[Millis],
    scores: &BTreeMap<NeuronPair, Vec<f64>>,
    structural_delay: Option<&DelayTable>,
    minimal_synapse_delay: Millis,
) -> Result<PeakDetection> {
    let pairs: Vec<(NeuronPair, Millis)> = match structural_delay {
        None => scores.keys().map(|&pair| (pair, 0.0)).collect(),
        Some(table) => table
            .iter()
            .filter(|(pair, _)| {
                let known = scores.contains_key(pair);
                if !known {
                    debug!("Timeseries {}: no standard scores", pair);
                }
                known
            })
            .collect(),
    };

    for (pair, _) in &pairs {
        let got = scores[pair].len();
        if got != timelags_ms.len() {
            return Err(FunctionError::ScoreLength {
                pair: *pair,
                expected: timelags_ms.len(),
                got,
            });
        }
    }

    // first, pool all z values and determine threshold
    let z_values: Vec<f64> = pairs
        .par_iter()
        .flat_map_iter(|(pair, offset)| {
            timelags_ms
                .iter()
                .zip(scores[pair].iter())
                .filter(move |(&lag, z)| lag > *offset && z.is_finite())
                .map(|(_, &z)| z)
        })
        .collect();
    let z_threshold = bh_threshold(&z_values);

    // second, peak per pair above threshold
    let peaks: Vec<(NeuronPair, f64, Millis)> = pairs
        .par_iter()
        .filter_map(|&(pair, offset)| {
            let peak = timelags_ms
                .iter()
                .zip(scores[&pair].iter())
                .filter(|(&lag, z)| lag > offset + minimal_synapse_delay && z.is_finite())
                .fold(None, |best: Option<(f64, f64)>, (&lag, &z)| match best {
                    Some((best_z, _)) if best_z >= z => best,
                    _ => Some((z, lag)),
                });
            match (peak, z_threshold) {
                (Some((score, lag)), Some(thr)) if score > thr => {
                    debug!("Timeseries {}: max z = {} at {} ms", pair, score, lag);
                    Some((pair, score, lag))
                }
                _ => {
                    debug!("Timeseries {}: no peak (above threshold)", pair);
                    None
                }
            }
        })
        .collect();

    let mut detection = PeakDetection {
        z_threshold,
        ..Default::default()
    };
    for (pair, score, lag) in peaks {
        detection.strength.insert(pair, score);
        detection.delay.insert(pair, lag);
    }

    info!(
        "FDR correction {} --> {} with z>{:?}",
        scores.len(),
        detection.strength.len(),
        z_threshold
    );
    Ok(detection)
}

/// Functional connections over all pairs with scores
pub fn functional_network(scores: &StandardScores) -> Result<PeakDetection> {
    all_peaks(&scores.timelags_ms, &scores.scores, None, 0.0)
}

/// Functional connections of structurally connected pairs, responding later
/// than axonal plus minimal synaptic delay
pub fn synaptic_network(
    scores: &StandardScores,
    structural_delay: &DelayTable,
    minimal_synapse_delay: Millis,
) -> Result<PeakDetection> {
    all_peaks(
        &scores.timelags_ms,
        &scores.scores,
        Some(structural_delay),
        minimal_synapse_delay,
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn train(times: &[f64]) -> EventTrain {
        EventTrain::new(times.to_vec()).unwrap()
    }

    fn assert_lags_eq(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "{:?} vs {:?}", actual, expected);
        for (a, e) in actual.iter().zip(expected) {
            assert_abs_diff_eq!(a, e, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_timelag_identical_trains() {
        let a = train(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let expected = [-1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0, 1.0];
        assert_lags_eq(&timelag_by_for_loop(&a, &a), &expected);
        assert_lags_eq(&timelag_by_sawtooth(&a, &a), &expected);
    }

    #[test]
    fn test_timelag_shifted_trains() {
        let a = train(&[0.0, 1.0, 2.0, 3.0, 4.0]);

        let later = train(&[0.1, 1.1, 2.1, 3.1, 4.1]);
        let expected = [-0.9, -0.9, -0.9, -0.9, 0.1, 0.1, 0.1, 0.1, 0.1];
        assert_lags_eq(&timelag_by_for_loop(&a, &later), &expected);
        assert_lags_eq(&timelag_by_sawtooth(&a, &later), &expected);

        let earlier = train(&[-0.2, 0.8, 1.8, 2.8, 3.8]);
        let expected = [-0.2, -0.2, -0.2, -0.2, -0.2, 0.8, 0.8, 0.8, 0.8];
        assert_lags_eq(&timelag_by_for_loop(&a, &earlier), &expected);
        assert_lags_eq(&timelag_by_sawtooth(&a, &earlier), &expected);
    }

    #[test]
    fn test_timelag_empty_train() {
        let a = train(&[0.0, 1.0]);
        let empty = train(&[]);
        assert!(timelag_by_sawtooth(&a, &empty).is_empty());
        assert!(timelag_by_sawtooth(&empty, &a).is_empty());
    }

    #[test]
    fn test_sawtooth_values() {
        let sawtooth = Sawtooth::new(&[1.0, 3.0, 4.0]);
        assert_relative_eq!(sawtooth.value_at(0.5).unwrap(), 0.5);
        assert_relative_eq!(sawtooth.value_at(1.0).unwrap(), 2.0);
        assert_relative_eq!(sawtooth.value_at(2.5).unwrap(), 0.5);
        assert_relative_eq!(sawtooth.value_at(3.0).unwrap(), 1.0);
        assert!(sawtooth.value_at(4.0).is_none());
        assert!(sawtooth.value_at(5.0).is_none());
    }

    #[test]
    fn test_timelag_hist() {
        let config = TimeLagConfig {
            min_lag_s: -0.005,
            max_lag_s: 0.005,
            bins: 10,
        };
        let lags = [-0.006, -0.005, 0.0003, 0.0049, 0.005, 0.0051, f64::NAN];
        let hist = timelag_hist(&lags, &config);
        assert_eq!(hist.counts, vec![1, 0, 0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(hist.edges.len(), 11);

        let centers = hist.bin_centers_ms();
        assert_relative_eq!(centers[0], -4.5, epsilon = 1e-9);
        assert_relative_eq!(centers[9], 4.5, epsilon = 1e-9);
    }

    #[test]
    fn test_timelag_hist_default_window() {
        let hist = timelag_hist(&[0.00215], &TimeLagConfig::default());
        assert_eq!(hist.bins(), 100);
        assert_eq!(hist.counts.iter().sum::<u64>(), 1);
        assert_eq!(hist.counts[71], 1);
    }

    fn sorted_gaps(train: &EventTrain) -> Vec<f64> {
        let mut gaps = train.gaps();
        gaps.sort_by(|a, b| a.total_cmp(b));
        gaps
    }

    #[test]
    fn test_randomize_intervals_preserves_gaps() {
        let original = train(&[0.0, 0.1, 0.3, 0.6, 1.0, 1.5, 2.1, 2.8]);
        let mut rng = StdRng::seed_from_u64(7);

        for surrogate in [
            randomize_intervals_by_gaussian(&original, 2.0, &mut rng).unwrap(),
            randomize_intervals_by_swapping(&original, 2.0, &mut rng).unwrap(),
        ] {
            assert_eq!(surrogate.len(), original.len());
            assert_eq!(surrogate.first(), original.first());
            let expected = sorted_gaps(&original);
            for (a, e) in sorted_gaps(&surrogate).iter().zip(&expected) {
                assert_abs_diff_eq!(a, e, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_randomize_intervals_without_jitter() {
        let original = train(&[0.0, 0.1, 0.3, 0.6]);
        let mut rng = StdRng::seed_from_u64(1);
        let surrogate = randomize_intervals_by_gaussian(&original, 0.0, &mut rng).unwrap();
        assert_lags_eq(surrogate.times(), original.times());

        let surrogate = randomize_intervals_by_swapping(&original, 0.0, &mut rng).unwrap();
        assert_lags_eq(surrogate.times(), original.times());
    }

    #[test]
    fn test_randomize_intervals_short_trains() {
        let mut rng = StdRng::seed_from_u64(1);
        for times in [vec![], vec![0.5], vec![0.5, 0.7]] {
            let original = train(&times);
            let surrogate = randomize_intervals_by_swapping(&original, 2.0, &mut rng).unwrap();
            assert_eq!(surrogate, original);
            let surrogate = randomize_intervals_by_gaussian(&original, 2.0, &mut rng).unwrap();
            assert_lags_eq(surrogate.times(), original.times());
        }
    }

    #[test]
    fn test_randomize_intervals_invalid_factor() {
        let mut rng = StdRng::seed_from_u64(1);
        let result = randomize_intervals_by_gaussian(&train(&[0.0, 1.0, 3.0]), -1.0, &mut rng);
        assert!(matches!(
            result,
            Err(FunctionError::Core(HanaError::InvalidConfig(_)))
        ));
    }

    #[test]
    fn test_generate_surrogates_is_seeded() {
        let trains: EventTrains = [
            (1, train(&[0.0, 0.1, 0.3, 0.6, 1.0])),
            (2, train(&[0.05, 0.2, 0.25, 0.9])),
        ]
        .into_iter()
        .collect();
        let config = SurrogateConfig {
            count: 3,
            ..Default::default()
        };

        let first = generate_surrogates(&trains, &config).unwrap();
        let second = generate_surrogates(&trains, &config).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[&1].len(), 3);
        assert_eq!(first[&2].len(), 3);
    }

    #[test]
    fn test_standardscore_zero_variance() {
        let a = train(&[0.0, 0.004]);
        let b = train(&[0.001]);
        let score =
            timelag_standardscore(&a, &b, &[b.clone(), b.clone()], &TimeLagConfig::default()).unwrap();
        assert!(score.score.iter().all(|z| z.is_nan()));
        assert!(score.surrogate_std.iter().all(|&s| s == 0.0));
        assert_eq!(score.observed.iter().sum::<u64>(), 2);
    }

    #[test]
    fn test_standardscore_against_surrogates() {
        let config = TimeLagConfig {
            min_lag_s: -0.005,
            max_lag_s: 0.005,
            bins: 10,
        };
        let a = train(&[0.0]);
        let b = train(&[0.0025]);
        // one surrogate with the same lag, one with a lag in another bin
        let surrogates = [train(&[0.0025]), train(&[0.0045])];
        let score = timelag_standardscore(&a, &b, &surrogates, &config).unwrap();

        assert_eq!(score.observed[7], 1);
        assert_relative_eq!(score.surrogate_mean[7], 0.5);
        assert_relative_eq!(score.surrogate_std[7], 0.5);
        assert_relative_eq!(score.score[7], 1.0);
        assert_relative_eq!(score.score[9], -1.0);
        assert!(score.score[0].is_nan());
    }

    #[test]
    fn test_standardscore_requires_surrogates() {
        let a = train(&[0.0]);
        assert!(timelag_standardscore(&a, &a, &[], &TimeLagConfig::default()).is_err());
    }

    #[test]
    fn test_all_timelag_standardscore() {
        let trains: EventTrains = [
            (1, train(&[0.0, 0.01, 0.02, 0.03])),
            (2, train(&[0.002, 0.012, 0.022, 0.032])),
        ]
        .into_iter()
        .collect();
        let surrogates = generate_surrogates(&trains, &SurrogateConfig::default()).unwrap();
        let scores = all_timelag_standardscore(&trains, &surrogates, &TimeLagConfig::default()).unwrap();

        assert_eq!(scores.len(), 4);
        assert!(scores.scores.contains_key(&NeuronPair::new(1, 1)));
        assert_eq!(scores.timelags_ms.len(), 100);
        assert_relative_eq!(scores.timelags_ms[0], -4.95, epsilon = 1e-9);
        for score in scores.scores.values() {
            assert_eq!(score.len(), 100);
        }
    }

    #[test]
    fn test_all_timelag_standardscore_missing_surrogates() {
        let trains: EventTrains = [(1, train(&[0.0, 0.01]))].into_iter().collect();
        let result = all_timelag_standardscore(&trains, &SurrogateSet::new(), &TimeLagConfig::default());
        assert!(matches!(result, Err(FunctionError::MissingSurrogates(1))));
    }

    #[test]
    fn test_benjamini_hochberg() {
        let p = [0.01, 0.04, 0.03, 0.5];
        // thresholds k/4 * 0.1: 0.025, 0.05, 0.075, 0.1
        assert_eq!(benjamini_hochberg(&p, 0.1), vec![true, true, true, false]);
        assert_eq!(benjamini_hochberg(&p, 0.01), vec![false, false, false, false]);
        assert!(benjamini_hochberg(&[], 0.1).is_empty());
    }

    #[test]
    fn test_bh_threshold() {
        let z = [10.0, 0.1, 0.2, -8.0, f64::NAN];
        assert_relative_eq!(bh_threshold(&z).unwrap(), 8.0);
        assert!(bh_threshold(&[0.1, 0.2, -0.3]).is_none());
        assert!(bh_threshold(&[]).is_none());
    }

    #[test]
    fn test_p_values() {
        let p = p_values(&[0.0, 1.959964, -1.959964]);
        assert_relative_eq!(p[0], 1.0);
        assert_relative_eq!(p[1], 0.05, epsilon = 1e-6);
        assert_relative_eq!(p[2], 0.05, epsilon = 1e-6);
    }

    fn peak_scores() -> BTreeMap<NeuronPair, Vec<f64>> {
        [
            (NeuronPair::new(1, 2), vec![0.5, 0.1, 30.0, -0.3]),
            (NeuronPair::new(2, 1), vec![0.2, 25.0, 0.3, 0.1]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_all_peaks() {
        let timelags = [-1.0, 1.0, 2.0, 3.0];
        let detection = all_peaks(&timelags, &peak_scores(), None, 0.0).unwrap();

        assert_relative_eq!(detection.z_threshold.unwrap(), 25.0);
        assert_eq!(detection.strength.len(), 1);
        assert_relative_eq!(detection.strength.get(&NeuronPair::new(1, 2)).unwrap(), 30.0);
        assert_relative_eq!(detection.delay.get(&NeuronPair::new(1, 2)).unwrap(), 2.0);
        assert!(!detection.delay.contains(&NeuronPair::new(2, 1)));
    }

    #[test]
    fn test_all_peaks_with_structural_delays() {
        let timelags = [-1.0, 1.0, 2.0, 3.0];
        let structural: DelayTable = [
            (NeuronPair::new(1, 2), 0.5),
            (NeuronPair::new(2, 1), 0.5),
            (NeuronPair::new(3, 1), 0.5),
        ]
        .into_iter()
        .collect();
        let detection = all_peaks(&timelags, &peak_scores(), Some(&structural), 1.0).unwrap();

        assert_relative_eq!(detection.z_threshold.unwrap(), 25.0);
        assert_eq!(detection.delay.pairs().collect::<Vec<_>>(), vec![NeuronPair::new(1, 2)]);
        assert_relative_eq!(detection.delay.get(&NeuronPair::new(1, 2)).unwrap(), 2.0);
    }

    #[test]
    fn test_all_peaks_empty_range() {
        let timelags = [-1.0, 1.0];
        let detection = all_peaks(&timelags, &peak_scores_short(), None, 5.0).unwrap();
        assert!(detection.strength.is_empty());
    }

    fn peak_scores_short() -> BTreeMap<NeuronPair, Vec<f64>> {
        [(NeuronPair::new(1, 2), vec![40.0, 30.0])].into_iter().collect()
    }

    #[test]
    fn test_all_peaks_length_mismatch() {
        let timelags = [-1.0, 1.0, 2.0];
        let result = all_peaks(&timelags, &peak_scores(), None, 0.0);
        assert!(matches!(
            result,
            Err(FunctionError::ScoreLength { expected: 3, got: 4, .. })
        ));
    }

    #[test]
    fn test_functional_and_synaptic_network() {
        let scores = StandardScores {
            timelags_ms: vec![-1.0, 1.0, 2.0, 3.0],
            scores: peak_scores(),
            observed: BTreeMap::new(),
        };
        let functional = functional_network(&scores).unwrap();
        assert!(functional.delay.contains(&NeuronPair::new(1, 2)));

        let structural: DelayTable = [(NeuronPair::new(1, 2), 2.5)].into_iter().collect();
        let synaptic = synaptic_network(&scores, &structural, 1.0).unwrap();
        assert!(synaptic.delay.is_empty());
    }
}
