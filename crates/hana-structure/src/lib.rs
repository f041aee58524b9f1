//! # HANA Structure: Connectivity from Axonal and Dendritic Overlap
//!
//! A presynaptic neuron can only contact a postsynaptic neuron where its
//! axon passes over the other neuron's dendrite. On the electrode array that
//! is the set of electrodes that are axonal for `pre` and dendritic for
//! `post`. The mean axonal delay over that overlap estimates the conduction
//! time from `pre` to the synapse onto `post`.

use hana_core::{DelayTable, HanaError, Microvolts, Millis, NeuronId, NeuronPair, OverlapConfig};
use hana_segmentation::CompartmentTable;
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StructureError {
    #[error(transparent)]
    Core(#[from] HanaError),
    #[error("Axonal field has {axon} electrodes, dendritic field has {dendrite}")]
    FieldMismatch { axon: usize, dendrite: usize },
}

pub type Result<T> = std::result::Result<T, StructureError>;

// ============================================================================
// SINGLE PAIR
// ============================================================================

/// Overlap of the axonal field of `pre` with the dendritic field of `post`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Overlap {
    /// Electrodes in both fields
    pub size: usize,
    /// Overlap relative to the dendritic field
    pub ratio: f64,
    /// Mean axonal delay over the overlap (ms), if the pair is connected
    pub delay: Option<Millis>,
}

impl Overlap {
    pub fn is_connected(&self) -> bool {
        self.delay.is_some()
    }
}

/// Overlap between an axonal delay map and a dendritic return current map.
///
/// Returns `None` when the dendritic field is empty. NaN entries (electrodes
/// outside the compartment) never belong to a field.
pub fn find_overlap(
    axon_delay: ArrayView1<Millis>,
    dendrite_peak: ArrayView1<Microvolts>,
    config: &OverlapConfig,
) -> Result<Option<Overlap>> {
    if axon_delay.len() != dendrite_peak.len() {
        return Err(StructureError::FieldMismatch {
            axon: axon_delay.len(),
            dendrite: dendrite_peak.len(),
        });
    }

    let dendrite_size = dendrite_peak.iter().filter(|&&p| p > config.thr_peak).count();
    if dendrite_size == 0 {
        return Ok(None);
    }

    let overlap_delays: Vec<f64> = axon_delay
        .iter()
        .zip(dendrite_peak.iter())
        .filter(|&(&d, &p)| d > 0.0 && p > config.thr_peak)
        .map(|(&d, _)| d)
        .collect();
    let size = overlap_delays.len();
    let ratio = size as f64 / dendrite_size as f64;

    let delay = if config.thr_ratio <= ratio && config.thr_overlap <= size && size > 0 {
        let delay = overlap_delays.iter().sum::<f64>() / size as f64;
        debug!(
            "overlap at {} electrodes (ratio= {:.2}) with mean delay = {:.1} [ms]",
            size, ratio, delay
        );
        Some(delay)
    } else {
        debug!(
            "overlap at {} electrodes (ratio= {:.2}) too small, no delay assigned",
            size, ratio
        );
        None
    };

    Ok(Some(Overlap { size, ratio, delay }))
}

// ============================================================================
// ALL PAIRS
// ============================================================================

/// Structurally connected pairs; unconnected pairs are absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuralNetwork {
    /// Overlap size (electrodes)
    pub overlap: DelayTable,
    pub ratio: DelayTable,
    /// Mean axonal delay over the overlap (ms)
    pub delay: DelayTable,
}

impl StructuralNetwork {
    pub fn len(&self) -> usize {
        self.delay.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delay.is_empty()
    }
}

/// Evaluate every ordered pair of distinct neurons in parallel
pub fn all_overlaps(
    axon_delay: &BTreeMap<NeuronId, &Array1<Millis>>,
    dendrite_peak: &BTreeMap<NeuronId, &Array1<Microvolts>>,
    config: &OverlapConfig,
) -> Result<StructuralNetwork> {
    let pairs: Vec<NeuronPair> = axon_delay
        .keys()
        .flat_map(|&pre| {
            dendrite_peak
                .keys()
                .filter(move |&&post| post != pre)
                .map(move |&post| NeuronPair::new(pre, post))
        })
        .collect();

    let connected = pairs
        .par_iter()
        .map(|&pair| -> Result<Option<(NeuronPair, Overlap, Millis)>> {
            debug!("neuron {} -> neuron {}:", pair.pre, pair.post);
            let overlap = find_overlap(
                axon_delay[&pair.pre].view(),
                dendrite_peak[&pair.post].view(),
                config,
            )?;
            Ok(overlap.and_then(|o| o.delay.map(|delay| (pair, o, delay))))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut network = StructuralNetwork::default();
    for (pair, overlap, delay) in connected.into_iter().flatten() {
        network.overlap.insert(pair, overlap.size as f64);
        network.ratio.insert(pair, overlap.ratio);
        network.delay.insert(pair, delay);
    }

    info!(
        "{} of {} neuron pairs structurally connected",
        network.len(),
        pairs.len()
    );
    Ok(network)
}

/// Structural network of all neurons with segmented compartments
pub fn structural_network(table: &CompartmentTable, config: &OverlapConfig) -> Result<StructuralNetwork> {
    all_overlaps(&table.axonal_delays(), &table.dendrite_peaks(), config)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use hana_segmentation::Compartments;
    use ndarray::array;

    const NAN: f64 = f64::NAN;

    fn compartments(axonal_delay: Array1<f64>, dendrite: Array1<f64>) -> Compartments {
        let axon = axonal_delay.mapv(f64::is_finite);
        let dendrite_mask = dendrite.mapv(f64::is_finite);
        Compartments {
            trigger: None,
            ais: 0,
            axon_electrodes: axon.iter().filter(|&&b| b).count(),
            dendrite_electrodes: dendrite_mask.iter().filter(|&&b| b).count(),
            axon,
            dendrite: dendrite_mask,
            axonal_delay,
            dendrite_return_current: dendrite,
        }
    }

    #[test]
    fn test_find_overlap() {
        let axon = array![NAN, 0.5, 1.0, 1.5, NAN];
        let dendrite = array![NAN, NAN, 8.0, 9.0, 7.0];
        let overlap = find_overlap(axon.view(), dendrite.view(), &OverlapConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(overlap.size, 2);
        assert_relative_eq!(overlap.ratio, 2.0 / 3.0);
        assert_relative_eq!(overlap.delay.unwrap(), 1.25);
    }

    #[test]
    fn test_find_overlap_thresholds() {
        let axon = array![0.5, 1.0, NAN, NAN];
        let dendrite = array![2.0, 20.0, 20.0, 20.0];

        // peak threshold shrinks the dendritic field to electrodes 1..4
        let config = OverlapConfig {
            thr_peak: 10.0,
            thr_ratio: 0.5,
            thr_overlap: 1,
        };
        let overlap = find_overlap(axon.view(), dendrite.view(), &config).unwrap().unwrap();
        assert_eq!(overlap.size, 1);
        assert!(!overlap.is_connected());

        let config = OverlapConfig {
            thr_peak: 0.0,
            thr_ratio: 0.0,
            thr_overlap: 3,
        };
        let overlap = find_overlap(axon.view(), dendrite.view(), &config).unwrap().unwrap();
        assert_eq!(overlap.size, 2);
        assert!(!overlap.is_connected());
    }

    #[test]
    fn test_find_overlap_empty_dendrite() {
        let axon = array![0.5, 1.0];
        let dendrite = array![NAN, NAN];
        let overlap = find_overlap(axon.view(), dendrite.view(), &OverlapConfig::default()).unwrap();
        assert!(overlap.is_none());
    }

    #[test]
    fn test_find_overlap_mismatch() {
        let axon = array![0.5, 1.0];
        let dendrite = array![1.0];
        assert!(matches!(
            find_overlap(axon.view(), dendrite.view(), &OverlapConfig::default()),
            Err(StructureError::FieldMismatch { axon: 2, dendrite: 1 })
        ));
    }

    #[test]
    fn test_overlap_is_directed_without_self_pairs() {
        let mut table = CompartmentTable::new();
        // axon of 1 runs over the dendrite of 2, not the other way round
        table.insert(1, compartments(array![NAN, 0.4, 0.6, NAN], array![5.0, NAN, NAN, NAN]));
        table.insert(2, compartments(array![NAN, NAN, NAN, 0.3], array![NAN, 5.0, 5.0, NAN]));
        table.insert(3, compartments(array![0.2, 0.2, 0.2, 0.2], array![NAN, NAN, NAN, 6.0]));

        let network = structural_network(&table, &OverlapConfig::default()).unwrap();

        let forward = NeuronPair::new(1, 2);
        assert_relative_eq!(network.delay.get(&forward).unwrap(), 0.5);
        assert_relative_eq!(network.overlap.get(&forward).unwrap(), 2.0);
        assert_relative_eq!(network.ratio.get(&forward).unwrap(), 1.0);
        assert!(!network.delay.contains(&forward.reversed()));

        for pair in network.delay.pairs() {
            assert!(!pair.is_self_pair());
        }
        // 3 has a dendrite on electrode 3 where only its own axon and that of 2 pass
        assert!(network.delay.contains(&NeuronPair::new(2, 3)));
        assert!(!network.delay.contains(&NeuronPair::new(3, 3)));
        assert_eq!(
            network.overlap.pairs().collect::<Vec<_>>(),
            network.delay.pairs().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_all_overlaps_empty() {
        let table = CompartmentTable::new();
        let network = structural_network(&table, &OverlapConfig::default()).unwrap();
        assert!(network.is_empty());
    }
}
