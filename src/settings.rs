//! Algorithmic settings consumed by the partitioner core.
//!
//! Method selection is a tagged enum dispatched once at the driver entry
//! point; there is no open polymorphism over partitioning methods.

use crate::comm::{collective, Communicator};
use crate::error::PartError;

/// How the initial partition is produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitialPartition {
    /// Cut the space-filling curve into weighted segments.
    Sfc,
    /// Balanced k-means with SFC-seeded centers.
    KMeans,
    /// Top-down k-means along the processor tree.
    HierKMeans,
    /// Hierarchical k-means followed by a repartition smoothing pass.
    HierRepart,
}

/// Strategy of the hard-balance post-processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalanceMethod {
    /// Run a repartition k-means against the targets.
    Repart,
    /// Rebalance walk ordered lexicographically by (block imbalance,
    /// membership).
    RebLex,
    /// Rebalance walk ordered by `imbalance² / membership`.
    RebImbaSq,
}

/// FM tie-breaking when gains are equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TieBreak {
    /// Deterministic id order only.
    Plain,
    /// Prefer the vertex nearest the target block's centroid.
    Geometric,
    /// Prefer the vertex with the higher diffusion potential towards the
    /// target block.
    Diffusion,
}

/// Order in which local points enter the k-means sampling prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleOrder {
    /// Deterministic bit-reversal interleave; reproducible across reruns.
    Interleave,
    /// Seeded Fisher-Yates shuffle; noisier but occasionally better.
    FisherYates,
}

/// Settings bundle for the partitioner core. Only options that change
/// algorithmic behaviour live here.
#[derive(Clone, Debug)]
pub struct Settings {
    pub num_blocks: usize,
    pub dimensions: usize,
    /// Per-weight imbalance tolerance.
    pub epsilon: f64,
    /// Optional per-weight tolerances; empty means `epsilon` everywhere.
    pub epsilons: Vec<f64>,
    pub num_node_weights: usize,
    pub initial_partition: InitialPartition,
    /// Bits of precision per axis for SFC indices.
    pub sfc_resolution: u32,
    /// Migrate points along the curve before partitioning.
    pub redistribute_by_sfc: bool,

    // balanced k-means
    /// Minimum sampled points per expected block in the first round;
    /// -1 disables sampling.
    pub min_sampling_nodes: i64,
    pub max_kmeans_iterations: usize,
    /// Assignment/influence rounds inside one outer iteration.
    pub balance_iterations: usize,
    /// Exponent of the weight ratio in the influence update; 0 selects the
    /// default `1/dimensions`.
    pub influence_exponent: f64,
    /// Cap on the per-iteration influence change.
    pub influence_change_cap: f64,
    /// Tighten the influence clamp when the imbalance direction flips.
    pub tighten_bounds: bool,
    /// Erode influences toward 1 while centers still move.
    pub erode_influence: bool,
    /// Leave influences of balanced blocks untouched.
    pub freeze_balanced_influence: bool,
    /// Return the most balanced fully-sampled solution instead of the last.
    pub keep_most_balanced: bool,
    /// Treat the previous partition as the one to refine; requires the
    /// distribution to equal the partition.
    pub repartition: bool,
    pub sample_order: SampleOrder,
    pub rng_seed: u64,

    // hierarchical / rebalance
    /// Arities per tree level; the product must equal `num_blocks` when a
    /// hierarchical method is selected.
    pub hier_levels: Vec<usize>,
    /// Chase hard balance after each hierarchy level.
    pub focus_on_balance: bool,
    pub balance_method: BalanceMethod,
    /// Fraction of local points between rebalance weight syncs.
    pub batch_percent: f64,

    // multilevel / refinement
    pub refine: bool,
    pub multi_level_rounds: usize,
    /// Stop coarsening at this global size.
    pub coarsening_stop_size: usize,
    /// Stop coarsening when a round matches less than this fraction.
    pub min_match_fraction: f64,
    /// Grow FM border regions until at least this many vertices per side.
    pub min_border_nodes: usize,
    pub stop_after_no_gain_rounds: usize,
    pub min_gain_for_next_round: f64,
    /// Prefer gain over balance when FM keys tie.
    pub gain_over_balance: bool,
    pub tie_break: TieBreak,
    /// Skip colors whose previous sweep produced zero gain.
    pub skip_no_gain_colors: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            num_blocks: 2,
            dimensions: 2,
            epsilon: 0.05,
            epsilons: Vec::new(),
            num_node_weights: 1,
            initial_partition: InitialPartition::KMeans,
            sfc_resolution: 17,
            redistribute_by_sfc: false,
            min_sampling_nodes: 100,
            max_kmeans_iterations: 50,
            balance_iterations: 20,
            influence_exponent: 0.0,
            influence_change_cap: 0.1,
            tighten_bounds: false,
            erode_influence: false,
            freeze_balanced_influence: false,
            keep_most_balanced: false,
            repartition: false,
            sample_order: SampleOrder::Interleave,
            rng_seed: 0,
            hier_levels: Vec::new(),
            focus_on_balance: false,
            balance_method: BalanceMethod::RebLex,
            batch_percent: 0.01,
            refine: true,
            multi_level_rounds: 3,
            coarsening_stop_size: 200,
            min_match_fraction: 0.05,
            min_border_nodes: 40,
            stop_after_no_gain_rounds: 2,
            min_gain_for_next_round: 1.0,
            gain_over_balance: true,
            tie_break: TieBreak::Plain,
            skip_no_gain_colors: true,
        }
    }
}

impl Settings {
    /// Tolerance for one weight index.
    pub fn epsilon_for(&self, w: usize) -> f64 {
        if self.epsilons.is_empty() {
            self.epsilon
        } else {
            self.epsilons[w]
        }
    }

    /// Influence exponent with its dimension-dependent default.
    pub fn effective_influence_exponent(&self) -> f64 {
        if self.influence_exponent > 0.0 {
            self.influence_exponent
        } else {
            1.0 / self.dimensions as f64
        }
    }

    pub fn is_hierarchical(&self) -> bool {
        matches!(
            self.initial_partition,
            InitialPartition::HierKMeans | InitialPartition::HierRepart
        )
    }

    /// Local validation; must pass on every rank before any collective.
    pub fn validate(&self) -> Result<(), PartError> {
        let fail = |msg: String| Err(PartError::InvalidConfiguration(msg));
        if self.num_blocks == 0 {
            return fail("numBlocks must be positive".into());
        }
        crate::sfc::check_dim(self.dimensions)?;
        if !(self.epsilon > 0.0) {
            return fail(format!("epsilon must be positive, got {}", self.epsilon));
        }
        if self.num_node_weights == 0 {
            return fail("at least one node weight is required".into());
        }
        if !self.epsilons.is_empty() {
            if self.epsilons.len() != self.num_node_weights {
                return fail(format!(
                    "{} per-weight tolerances given for {} weights",
                    self.epsilons.len(),
                    self.num_node_weights
                ));
            }
            if self.epsilons.iter().any(|&e| !(e > 0.0)) {
                return fail("per-weight tolerances must be positive".into());
            }
        }
        if self.is_hierarchical() {
            let product: usize = self.hier_levels.iter().product();
            if self.hier_levels.is_empty() || product != self.num_blocks {
                return fail(format!(
                    "hierarchy levels {:?} do not multiply to numBlocks {}",
                    self.hier_levels, self.num_blocks
                ));
            }
        }
        if !(self.influence_change_cap > 0.0 && self.influence_change_cap < 1.0) {
            return fail(format!(
                "influence change cap must lie in (0, 1), got {}",
                self.influence_change_cap
            ));
        }
        if self.max_kmeans_iterations == 0 || self.balance_iterations == 0 {
            return fail("iteration caps must be positive".into());
        }
        if !(self.batch_percent > 0.0 && self.batch_percent <= 1.0) {
            return fail(format!(
                "batch percentage must lie in (0, 1], got {}",
                self.batch_percent
            ));
        }
        if self.sfc_resolution == 0 {
            return fail("SFC resolution must be at least one bit".into());
        }
        if !(0.0..1.0).contains(&self.min_match_fraction) {
            return fail(format!(
                "minimum match fraction must lie in [0, 1), got {}",
                self.min_match_fraction
            ));
        }
        Ok(())
    }

    /// Validation with a divergence check: the boolean outcome is
    /// and-reduced so that a rank with a differing settings copy cannot run
    /// ahead into a collective.
    pub fn validate_global<C: Communicator>(&self, comm: &C) -> Result<(), PartError> {
        let local = self.validate();
        let all_ok = collective::all_true(comm, local.is_ok())?;
        match (local, all_ok) {
            (Err(e), _) => Err(e),
            (Ok(()), false) => Err(PartError::InvalidConfiguration(
                "settings rejected on another rank".into(),
            )),
            (Ok(()), true) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn hierarchy_product_must_match() {
        let settings = Settings {
            initial_partition: InitialPartition::HierKMeans,
            hier_levels: vec![3, 4],
            num_blocks: 11,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
        let settings = Settings {
            num_blocks: 12,
            ..settings
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn per_weight_tolerances_checked() {
        let settings = Settings {
            num_node_weights: 2,
            epsilons: vec![0.05],
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn influence_exponent_defaults_to_inverse_dimension() {
        let settings = Settings {
            dimensions: 2,
            ..Settings::default()
        };
        assert_eq!(settings.effective_influence_exponent(), 0.5);
        let settings = Settings {
            influence_exponent: 0.8,
            ..settings
        };
        assert_eq!(settings.effective_influence_exponent(), 0.8);
    }
}
