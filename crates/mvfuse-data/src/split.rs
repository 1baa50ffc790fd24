//! Seeded validation/test/train partitioning.
//!
//! Validation and test each take a fixed fraction of the *whole* dataset.
//! `train_ratio` then selects a fraction of the remaining pool; whatever it
//! leaves behind forms a fourth, discarded partition. With `train_ratio == 1`
//! the whole remainder is used for training and nothing is discarded.

use mvfuse_core::{check_ratio, FinetuneError, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Subset sizes derived from the three ratios and the dataset size.
///
/// `val_size + test_size + train_size + discard_size == total` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPlan {
    pub val_size: usize,
    pub test_size: usize,
    pub train_size: usize,
    pub discard_size: usize,
}

impl SplitPlan {
    /// Compute subset sizes for `total` records.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::InvalidRatio`] if a ratio lies outside `(0, 1]` or
    /// validation and test together exceed `total`.
    pub fn compute(total: usize, val_ratio: f64, test_ratio: f64, train_ratio: f64) -> Result<Self> {
        check_ratio("val_ratio", val_ratio)?;
        check_ratio("test_ratio", test_ratio)?;
        check_ratio("train_ratio", train_ratio)?;

        let val_size = (val_ratio * total as f64).floor() as usize;
        let test_size = (test_ratio * total as f64).floor() as usize;
        if val_size + test_size > total {
            return Err(FinetuneError::InvalidRatio {
                reason: format!(
                    "val_size={val_size} + test_size={test_size} exceeds {total} records"
                ),
            });
        }

        let remaining = total - val_size - test_size;
        let train_size = if train_ratio == 1.0 {
            remaining
        } else {
            ((remaining as f64 * train_ratio).floor() as usize).min(remaining)
        };

        Ok(Self {
            val_size,
            test_size,
            train_size,
            discard_size: remaining - train_size,
        })
    }

    /// Number of records accounted for across all four partitions.
    #[must_use]
    pub fn total(&self) -> usize {
        self.val_size + self.test_size + self.train_size + self.discard_size
    }
}

/// Record indices assigned to each partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    pub val: Vec<usize>,
    pub test: Vec<usize>,
    pub train: Vec<usize>,
    /// Left over by `train_ratio < 1`; never turned into a dataset view.
    pub discarded: Vec<usize>,
    pub plan: SplitPlan,
}

/// Three-ratio splitter with an explicit seed.
#[derive(Debug, Clone, Copy)]
pub struct ManifestSplitter {
    val_ratio: f64,
    test_ratio: f64,
    train_ratio: f64,
    seed: u64,
}

impl ManifestSplitter {
    /// Create a splitter, validating every ratio up front.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::InvalidRatio`] if a ratio lies outside `(0, 1]`.
    pub fn new(val_ratio: f64, test_ratio: f64, train_ratio: f64, seed: u64) -> Result<Self> {
        check_ratio("val_ratio", val_ratio)?;
        check_ratio("test_ratio", test_ratio)?;
        check_ratio("train_ratio", train_ratio)?;
        Ok(Self {
            val_ratio,
            test_ratio,
            train_ratio,
            seed,
        })
    }

    /// Subset sizes for `total` records.
    ///
    /// # Errors
    ///
    /// See [`SplitPlan::compute`].
    pub fn plan(&self, total: usize) -> Result<SplitPlan> {
        SplitPlan::compute(total, self.val_ratio, self.test_ratio, self.train_ratio)
    }

    /// Partition `0..total` into val/test/train/discarded.
    ///
    /// The indices are shuffled with a ChaCha8 RNG seeded from the splitter's
    /// seed, then cut in order: validation first, then test, then train, then
    /// the discarded remainder. The same seed always yields the same split.
    ///
    /// # Errors
    ///
    /// See [`SplitPlan::compute`].
    pub fn split(&self, total: usize) -> Result<SplitIndices> {
        let plan = self.plan(total)?;

        let mut order: Vec<usize> = (0..total).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        order.shuffle(&mut rng);

        let mut rest = order.as_slice();
        let mut take = |n: usize| {
            let (head, tail) = rest.split_at(n);
            rest = tail;
            head.to_vec()
        };
        let val = take(plan.val_size);
        let test = take(plan.test_size);
        let train = take(plan.train_size);
        let discarded = take(plan.discard_size);

        tracing::info!(
            total,
            val = plan.val_size,
            test = plan.test_size,
            train = plan.train_size,
            discarded = plan.discard_size,
            seed = self.seed,
            "Dataset split"
        );

        Ok(SplitIndices {
            val,
            test,
            train,
            discarded,
            plan,
        })
    }
}
