//! # HANA Polychronous: Repeating Spike Patterns
//!
//! A polychronous group is a set of spikes of several neurons that are
//! linked by synaptic delays: a presynaptic spike, shifted by the delay of
//! the connection, lands on a postsynaptic spike within a small jitter.
//! Chaining those matched pairs gives a graph whose connected components are
//! the groups (Izhikevich, 2006).
//!
//! Significance is judged by repeating the extraction under three null
//! conditions (shuffled targets, shuffled delays, randomized trains) and
//! comparing group sizes.

use hana_core::{
    DelayTable, EventTrain, EventTrains, HanaError, Millis, NeuronId, NeuronPair, PartialInterval,
    PolychronousConfig, Seconds, SurrogateConfig,
};
use hana_function::{generate_surrogates, FunctionError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum PolychronousError {
    #[error(transparent)]
    Core(#[from] HanaError),
    #[error(transparent)]
    Function(#[from] FunctionError),
}

pub type Result<T> = std::result::Result<T, PolychronousError>;

// ============================================================================
// EVENTS
// ============================================================================

/// A single spike
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub time: Seconds,
    pub neuron: NeuronId,
}

impl Event {
    pub fn new(time: Seconds, neuron: NeuronId) -> Self {
        Self { time, neuron }
    }

    /// Exact identity of the event as a graph node
    fn key(&self) -> (u64, NeuronId) {
        (self.time.to_bits(), self.neuron)
    }
}

/// Presynaptic spike and the postsynaptic spike it plausibly caused
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectedEventPair {
    pub pre: Event,
    pub post: Event,
}

/// Links whose spike timing leaves room for a synapse after the axonal
/// delay. Value = functional spike timing (ms).
pub fn admissible_delays(
    structural: &DelayTable,
    functional: &DelayTable,
    min_synaptic_delay: Millis,
) -> DelayTable {
    let delays: DelayTable = structural
        .correlate(functional)
        .into_iter()
        .filter(|&(_, axonal, timing)| timing - axonal > min_synaptic_delay)
        .map(|(pair, _, timing)| (pair, timing))
        .collect();
    info!(
        "{} of {} structurally and functionally connected pairs are admissible",
        delays.len(),
        structural.correlate(functional).len()
    );
    delays
}

/// Restrict trains to the leading part of the recording used for group search
pub fn polychronous_trains(trains: &EventTrains, config: &PolychronousConfig) -> Result<EventTrains> {
    Ok(hana_core::partial_trains(
        trains,
        PartialInterval::Fraction(config.partial_fraction),
    )?)
}

fn connected_events_of_edge(
    pair: NeuronPair,
    pre: &EventTrain,
    post: &EventTrain,
    time_lag: Seconds,
    jitter: Seconds,
) -> Vec<ConnectedEventPair> {
    let post_times = post.times();
    let mut connected = Vec::new();

    // postsynaptic spike at or after, then strictly before the shifted spike
    for before in [false, true] {
        for &pre_time in pre.times() {
            let shifted = pre_time + time_lag;
            let index = post_times.partition_point(|&t| t < shifted);
            let candidate = if before {
                index.checked_sub(1)
            } else {
                (index < post_times.len()).then_some(index)
            };
            if let Some(position) = candidate {
                let post_time = post_times[position];
                if (shifted - post_time).abs() < jitter {
                    connected.push(ConnectedEventPair {
                        pre: Event::new(pre_time, pair.pre),
                        post: Event::new(post_time, pair.post),
                    });
                }
            }
        }
    }
    connected
}

/// Pairs of presynaptic and postsynaptic spikes consistent with the delays.
///
/// Every presynaptic spike is shifted by `delay / 1000 + synaptic_delay`;
/// the nearest postsynaptic spikes on either side are accepted if closer
/// than `jitter`. Links with an unknown or silent neuron yield nothing.
pub fn find_connected_events(
    trains: &EventTrains,
    delays: &DelayTable,
    synaptic_delay: Seconds,
    jitter: Seconds,
) -> Vec<ConnectedEventPair> {
    let edges: Vec<(NeuronPair, Millis)> = delays.iter().collect();

    let per_edge: Vec<Vec<ConnectedEventPair>> = edges
        .par_iter()
        .map(|&(pair, delay)| {
            let time_lag = delay / 1000.0 + synaptic_delay;
            match (trains.get(&pair.pre), trains.get(&pair.post)) {
                (Some(pre), Some(post)) if !post.is_empty() => {
                    let connected = connected_events_of_edge(pair, pre, post, time_lag, jitter);
                    debug!(
                        "Spike pairs {} with predicted time lag {:.6} s: {} of {} candidates",
                        pair,
                        time_lag,
                        connected.len(),
                        pre.len()
                    );
                    connected
                }
                _ => {
                    debug!("Spike pairs {}: no events", pair);
                    Vec::new()
                }
            }
        })
        .collect();

    let connected: Vec<ConnectedEventPair> = per_edge.into_iter().flatten().collect();
    info!("Total {} connected event pairs", connected.len());
    connected
}

// ============================================================================
// GROUPS
// ============================================================================

/// Disjoint sets with path compression and union by rank
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut idx = x;
        while self.parent[idx] != idx {
            let parent = self.parent[idx];
            self.parent[idx] = self.parent[parent];
            idx = parent;
        }
        idx
    }

    fn union(&mut self, x: usize, y: usize) {
        let rx = self.find(x);
        let ry = self.find(y);
        if rx == ry {
            return;
        }
        if self.rank[rx] < self.rank[ry] {
            self.parent[rx] = ry;
        } else if self.rank[rx] > self.rank[ry] {
            self.parent[ry] = rx;
        } else {
            self.parent[ry] = rx;
            self.rank[rx] += 1;
        }
    }
}

/// Connected component of the graph of connected events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolychronousGroup {
    /// Distinct events, ordered by time
    pub events: Vec<Event>,
    pub pairs: Vec<ConnectedEventPair>,
}

impl PolychronousGroup {
    pub fn size(&self) -> usize {
        self.events.len()
    }

    pub fn start(&self) -> Option<Seconds> {
        self.events.first().map(|e| e.time)
    }

    pub fn neurons(&self) -> Vec<NeuronId> {
        let mut neurons: Vec<NeuronId> = self.events.iter().map(|e| e.neuron).collect();
        neurons.sort_unstable();
        neurons.dedup();
        neurons
    }
}

/// Split the graph of connected events into its connected components,
/// ordered by their earliest event. Duplicate pairs are harmless.
pub fn polychronous_groups(connected: &[ConnectedEventPair]) -> Vec<PolychronousGroup> {
    let mut index: HashMap<(u64, NeuronId), usize> = HashMap::new();
    let mut nodes: Vec<Event> = Vec::new();
    let mut edges: Vec<(usize, usize)> = Vec::with_capacity(connected.len());
    for pair in connected {
        let mut node_of = |event: Event| -> usize {
            *index.entry(event.key()).or_insert_with(|| {
                nodes.push(event);
                nodes.len() - 1
            })
        };
        let (a, b) = (node_of(pair.pre), node_of(pair.post));
        edges.push((a, b));
    }

    let mut components = UnionFind::new(nodes.len());
    for &(a, b) in &edges {
        components.union(a, b);
    }

    let mut grouped: BTreeMap<usize, PolychronousGroup> = BTreeMap::new();
    for (node, &event) in nodes.iter().enumerate() {
        let root = components.find(node);
        grouped
            .entry(root)
            .or_insert_with(|| PolychronousGroup {
                events: Vec::new(),
                pairs: Vec::new(),
            })
            .events
            .push(event);
    }
    for (pair, &(a, _)) in connected.iter().zip(&edges) {
        let root = components.find(a);
        if let Some(group) = grouped.get_mut(&root) {
            group.pairs.push(*pair);
        }
    }

    let mut groups: Vec<PolychronousGroup> = grouped.into_values().collect();
    for group in &mut groups {
        group
            .events
            .sort_by(|a, b| a.time.total_cmp(&b.time).then(a.neuron.cmp(&b.neuron)));
    }
    groups.sort_by(|a, b| {
        let (sa, sb) = (a.start().unwrap_or(f64::INFINITY), b.start().unwrap_or(f64::INFINITY));
        sa.total_cmp(&sb)
            .then_with(|| a.events[0].neuron.cmp(&b.events[0].neuron))
    });
    groups
}

/// Groups and their sizes
pub fn extract_pcgs(connected: &[ConnectedEventPair]) -> (Vec<PolychronousGroup>, Vec<usize>) {
    let groups = polychronous_groups(connected);
    let sizes = groups.iter().map(PolychronousGroup::size).collect();
    info!("{} polychronous groups", groups.len());
    (groups, sizes)
}

// ============================================================================
// NULL CONDITIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShuffleMethod {
    /// Permute postsynaptic neurons across links (keeps out-degrees)
    Targets,
    /// Permute delay values across links (keeps pairs)
    Values,
}

/// Randomized copy of a delay table.
///
/// Shuffled targets can map two links onto the same pair; the later one
/// wins.
pub fn shuffle_network<R: Rng + ?Sized>(table: &DelayTable, method: ShuffleMethod, rng: &mut R) -> DelayTable {
    let (pairs, mut values): (Vec<NeuronPair>, Vec<f64>) = table.iter().unzip();
    match method {
        ShuffleMethod::Targets => {
            let mut posts: Vec<NeuronId> = pairs.iter().map(|p| p.post).collect();
            posts.shuffle(rng);
            pairs
                .iter()
                .zip(posts)
                .zip(values)
                .map(|((pair, post), value)| (NeuronPair::new(pair.pre, post), value))
                .collect()
        }
        ShuffleMethod::Values => {
            values.shuffle(rng);
            pairs.into_iter().zip(values).collect()
        }
    }
}

/// Data the group extraction is run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SurrogateCondition {
    Original,
    ShuffledTargets,
    ShuffledDelays,
    /// One randomized train per neuron
    SurrogateTrains,
}

impl SurrogateCondition {
    pub const ALL: [SurrogateCondition; 4] = [
        SurrogateCondition::Original,
        SurrogateCondition::ShuffledTargets,
        SurrogateCondition::ShuffledDelays,
        SurrogateCondition::SurrogateTrains,
    ];

    pub fn is_null(&self) -> bool {
        *self != SurrogateCondition::Original
    }
}

/// Connected events under a given condition.
///
/// Shuffles and surrogate trains are seeded from `surrogates.seed`.
pub fn connected_events_for(
    condition: SurrogateCondition,
    trains: &EventTrains,
    delays: &DelayTable,
    config: &PolychronousConfig,
    surrogates: &SurrogateConfig,
) -> Result<Vec<ConnectedEventPair>> {
    let mut rng = StdRng::seed_from_u64(surrogates.seed);
    let search = |trains: &EventTrains, delays: &DelayTable| {
        find_connected_events(trains, delays, config.synaptic_delay_s, config.jitter_s)
    };

    info!("Connected events for {:?}", condition);
    let connected = match condition {
        SurrogateCondition::Original => search(trains, delays),
        SurrogateCondition::ShuffledTargets => {
            search(trains, &shuffle_network(delays, ShuffleMethod::Targets, &mut rng))
        }
        SurrogateCondition::ShuffledDelays => {
            search(trains, &shuffle_network(delays, ShuffleMethod::Values, &mut rng))
        }
        SurrogateCondition::SurrogateTrains => {
            let active: EventTrains = trains
                .iter()
                .filter(|(_, train)| !train.is_empty())
                .map(|(&neuron, train)| (neuron, train.clone()))
                .collect();
            let single = SurrogateConfig {
                count: 1,
                ..surrogates.clone()
            };
            let randomized: EventTrains = generate_surrogates(&active, &single)?
                .into_iter()
                .filter_map(|(neuron, mut trains)| trains.pop().map(|train| (neuron, train)))
                .collect();
            search(&randomized, delays)
        }
    };
    Ok(connected)
}

// ============================================================================
// SIGNIFICANCE
// ============================================================================

/// Group sizes under one condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeDistribution {
    pub sizes: Vec<usize>,
    pub max: usize,
    pub mean: Option<f64>,
    /// Group size -> number of groups
    pub histogram: BTreeMap<usize, usize>,
}

impl SizeDistribution {
    pub fn from_sizes(sizes: Vec<usize>) -> Self {
        let max = sizes.iter().copied().max().unwrap_or(0);
        let mean = (!sizes.is_empty()).then(|| sizes.iter().sum::<usize>() as f64 / sizes.len() as f64);
        let mut histogram = BTreeMap::new();
        for &size in &sizes {
            *histogram.entry(size).or_insert(0) += 1;
        }
        Self {
            sizes,
            max,
            mean,
            histogram,
        }
    }

    pub fn count(&self) -> usize {
        self.sizes.len()
    }

    pub fn count_at_least(&self, size: usize) -> usize {
        self.histogram.range(size..).map(|(_, &n)| n).sum()
    }
}

/// Group size distributions of the original data and every null condition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignificanceReport {
    pub conditions: BTreeMap<SurrogateCondition, SizeDistribution>,
}

impl SignificanceReport {
    pub fn original(&self) -> Option<&SizeDistribution> {
        self.conditions.get(&SurrogateCondition::Original)
    }

    /// Whether the largest original group is larger than any null group
    pub fn largest_original_exceeds_nulls(&self) -> bool {
        let Some(original) = self.original() else {
            return false;
        };
        self.conditions
            .iter()
            .filter(|(condition, _)| condition.is_null())
            .all(|(_, null)| original.max > null.max)
    }
}

pub fn group_size_distributions(
    trains: &EventTrains,
    delays: &DelayTable,
    config: &PolychronousConfig,
    surrogates: &SurrogateConfig,
) -> Result<SignificanceReport> {
    let mut report = SignificanceReport::default();
    for condition in SurrogateCondition::ALL {
        let connected = connected_events_for(condition, trains, delays, config, surrogates)?;
        let (_, sizes) = extract_pcgs(&connected);
        let distribution = SizeDistribution::from_sizes(sizes);
        info!(
            "{:?}: {} groups, largest {}",
            condition,
            distribution.count(),
            distribution.max
        );
        report.conditions.insert(condition, distribution);
    }
    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================
