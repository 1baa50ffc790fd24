//! Dataset views over a split manifest, and mini-batch iteration.

use crate::manifest::{Manifest, Record};
use crate::split::{ManifestSplitter, SplitPlan};
use crate::volume::{Volume, VolumeSource};
use candle_core::{Device, Tensor};
use mvfuse_core::{FinetuneError, Label, Result, TaskMode};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

/// Read-only view of the records selected for one partition.
///
/// Volumes are decoded on every access; nothing is cached.
#[derive(Debug, Clone)]
pub struct DatasetView {
    records: Arc<[Record]>,
    indices: Vec<usize>,
    source: Arc<VolumeSource>,
}

impl DatasetView {
    /// Restrict `records` to `indices`.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::Config`] if an index is out of range.
    pub fn new(records: Arc<[Record]>, indices: Vec<usize>, source: Arc<VolumeSource>) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= records.len()) {
            return Err(FinetuneError::Config(format!(
                "dataset index {bad} out of range for {} records",
                records.len()
            )));
        }
        Ok(Self {
            records,
            indices,
            source,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Manifest positions backing this view.
    #[must_use]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Record at view position `i`.
    #[must_use]
    pub fn record(&self, i: usize) -> Option<&Record> {
        self.indices.get(i).map(|&idx| &self.records[idx])
    }

    /// Decode the volume at view position `i` together with its label.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::Config`] for an out-of-range position, otherwise
    /// whatever [`VolumeSource::load`] returns.
    pub fn get(&self, i: usize) -> Result<(Volume, Label)> {
        let record = self.record(i).ok_or_else(|| {
            FinetuneError::Config(format!("position {i} out of range for view of {}", self.len()))
        })?;
        let volume = self.source.load(&record.image_id)?;
        Ok((volume, record.label))
    }
}

/// Validation, test and train views built from one manifest.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub val: DatasetView,
    pub test: DatasetView,
    pub train: DatasetView,
    pub plan: SplitPlan,
}

impl DatasetSplits {
    /// Split `manifest` and wrap each partition in a view sharing `source`.
    ///
    /// The discarded partition (if any) gets no view.
    ///
    /// # Errors
    ///
    /// Propagates [`ManifestSplitter::split`] errors.
    pub fn build(manifest: Manifest, splitter: &ManifestSplitter, source: VolumeSource) -> Result<Self> {
        let split = splitter.split(manifest.len())?;
        let records: Arc<[Record]> = manifest.into_records().into();
        let source = Arc::new(source);
        Ok(Self {
            val: DatasetView::new(Arc::clone(&records), split.val, Arc::clone(&source))?,
            test: DatasetView::new(Arc::clone(&records), split.test, Arc::clone(&source))?,
            train: DatasetView::new(records, split.train, source)?,
            plan: split.plan,
        })
    }
}

/// A stacked mini-batch: volumes `[B, X, Y, Z]` and labels `[B]`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub volumes: Tensor,
    /// `u32` class codes for classification, `f32` scores for regression.
    pub labels: Tensor,
}

/// Mini-batch iterator over a [`DatasetView`].
pub struct BatchIterator<'a> {
    view: &'a DatasetView,
    order: Vec<usize>,
    batch_size: usize,
    pos: usize,
    device: Device,
}

impl<'a> BatchIterator<'a> {
    /// Iterate `view` in order, `batch_size` records at a time.
    pub fn new(view: &'a DatasetView, batch_size: usize, device: &Device) -> Self {
        Self {
            view,
            order: (0..view.len()).collect(),
            batch_size: batch_size.max(1),
            pos: 0,
            device: device.clone(),
        }
    }

    /// Reshuffle for a new epoch using a seeded RNG derived from base seed + epoch.
    pub fn reshuffle(&mut self, seed: u64, epoch: usize) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
        self.order.shuffle(&mut rng);
        self.pos = 0;
    }

    /// Restart without reshuffling.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Number of batches per pass.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// Decode and stack the next mini-batch, or `None` once the pass is exhausted.
    ///
    /// # Errors
    ///
    /// Decoding errors are fatal; there is no skip-on-error policy.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        let n = self.order.len();
        if self.pos >= n {
            return Ok(None);
        }
        let end = (self.pos + self.batch_size).min(n);
        let positions = &self.order[self.pos..end];
        self.pos = end;

        let mut shape: Option<Vec<usize>> = None;
        let mut voxels: Vec<f32> = Vec::new();
        let mut labels: Vec<Label> = Vec::with_capacity(positions.len());
        for &p in positions {
            let (volume, label) = self.view.get(p)?;
            match &shape {
                None => shape = Some(volume.shape().to_vec()),
                Some(s) if s.as_slice() != volume.shape() => {
                    return Err(FinetuneError::ShapeMismatch(format!(
                        "batch volumes disagree: {s:?} vs {:?}",
                        volume.shape()
                    )));
                }
                Some(_) => {}
            }
            voxels.extend_from_slice(volume.data());
            labels.push(label);
        }

        let mut dims = vec![positions.len()];
        dims.extend(shape.unwrap_or_default());
        let volumes = Tensor::from_vec(voxels, dims, &self.device)?;
        let labels = label_tensor(&labels, &self.device)?;
        Ok(Some(Batch { volumes, labels }))
    }
}

/// Stack labels into a `[B]` tensor; all labels must share one task.
///
/// # Errors
///
/// [`FinetuneError::ShapeMismatch`] when classification and regression labels are mixed.
pub fn label_tensor(labels: &[Label], device: &Device) -> Result<Tensor> {
    let mode = match labels.first() {
        Some(Label::Class(_)) | None => TaskMode::Classification,
        Some(Label::Score(_)) => TaskMode::Regression,
    };
    let mixed = || FinetuneError::ShapeMismatch("batch mixes class and score labels".to_string());
    let tensor = match mode {
        TaskMode::Classification => {
            let codes = labels
                .iter()
                .map(|l| match l {
                    Label::Class(c) => Ok(*c),
                    Label::Score(_) => Err(mixed()),
                })
                .collect::<Result<Vec<u32>>>()?;
            Tensor::new(codes.as_slice(), device)?
        }
        TaskMode::Regression => {
            let scores = labels
                .iter()
                .map(|l| match l {
                    Label::Score(s) => Ok(*s),
                    Label::Class(_) => Err(mixed()),
                })
                .collect::<Result<Vec<f32>>>()?;
            Tensor::new(scores.as_slice(), device)?
        }
    };
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeDecoder;
    use candle_core::DType;
    use std::path::Path;

    /// Decoder that encodes the image id's trailing number into every voxel.
    struct IdDecoder;

    impl VolumeDecoder for IdDecoder {
        fn decode(&self, path: &Path) -> Result<Volume> {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            let value: f32 = stem.trim_start_matches('I').parse().unwrap_or(-1.0);
            Volume::new(vec![2, 2, 2], vec![value; 8])
        }
    }

    fn manifest(n: usize, mode: TaskMode) -> Manifest {
        let mut contents = String::from("id,subject,group,sex,score\n");
        for i in 0..n {
            let group = ["CN", "AD", "MCI"][i % 3];
            contents.push_str(&format!("\"I{i}\",s,\"{group}\",m,\"{}\"\n", i * 10));
        }
        Manifest::parse_str(&contents, mode).unwrap()
    }

    fn source() -> VolumeSource {
        VolumeSource::new("/scans", "nii", vec![2, 2, 2], Arc::new(IdDecoder))
    }

    #[test]
    fn test_splits_sizes() {
        let splitter = ManifestSplitter::new(0.2, 0.2, 1.0, 3).unwrap();
        let splits =
            DatasetSplits::build(manifest(10, TaskMode::Classification), &splitter, source()).unwrap();
        assert_eq!(splits.val.len(), 2);
        assert_eq!(splits.test.len(), 2);
        assert_eq!(splits.train.len(), 6);
    }

    #[test]
    fn test_view_resolves_lazily() {
        let splitter = ManifestSplitter::new(0.2, 0.2, 1.0, 3).unwrap();
        let splits =
            DatasetSplits::build(manifest(10, TaskMode::Classification), &splitter, source()).unwrap();
        for i in 0..splits.train.len() {
            let idx = splits.train.indices()[i];
            let (volume, label) = splits.train.get(i).unwrap();
            assert_eq!(volume.data()[0], idx as f32);
            assert_eq!(label, Label::Class((idx % 3) as u32));
        }
        assert!(splits.train.get(99).is_err());
    }

    #[test]
    fn test_view_rejects_out_of_range_index() {
        let records: Arc<[Record]> = manifest(2, TaskMode::Classification).into_records().into();
        assert!(DatasetView::new(records, vec![0, 5], Arc::new(source())).is_err());
    }

    #[test]
    fn test_batch_iterator_exhausts() {
        let records: Arc<[Record]> = manifest(10, TaskMode::Classification).into_records().into();
        let view = DatasetView::new(records, (0..10).collect(), Arc::new(source())).unwrap();
        let mut iter = BatchIterator::new(&view, 3, &Device::Cpu);
        iter.reshuffle(42, 0);
        assert_eq!(iter.num_batches(), 4);

        let mut count = 0;
        let mut seen = 0;
        while let Some(batch) = iter.next_batch().unwrap() {
            let b = batch.volumes.dims()[0];
            assert_eq!(batch.volumes.dims(), &[b, 2, 2, 2]);
            assert_eq!(batch.labels.dtype(), DType::U32);
            seen += b;
            count += 1;
        }
        assert_eq!(count, 4); // ceil(10/3) = 4
        assert_eq!(seen, 10);
    }

    #[test]
    fn test_batch_iterator_regression_labels() {
        let records: Arc<[Record]> = manifest(4, TaskMode::Regression).into_records().into();
        let view = DatasetView::new(records, vec![3, 1], Arc::new(source())).unwrap();
        let mut iter = BatchIterator::new(&view, 8, &Device::Cpu);
        let batch = iter.next_batch().unwrap().unwrap();
        assert_eq!(batch.labels.dtype(), DType::F32);
        let labels: Vec<f32> = batch.labels.to_vec1().unwrap();
        assert_eq!(labels, vec![30.0, 10.0]);
        assert!(iter.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_reshuffle_is_seeded() {
        let records: Arc<[Record]> = manifest(20, TaskMode::Classification).into_records().into();
        let view = DatasetView::new(records, (0..20).collect(), Arc::new(source())).unwrap();
        let mut a = BatchIterator::new(&view, 20, &Device::Cpu);
        let mut b = BatchIterator::new(&view, 20, &Device::Cpu);
        a.reshuffle(5, 1);
        b.reshuffle(5, 1);
        let la: Vec<u32> = a.next_batch().unwrap().unwrap().labels.to_vec1().unwrap();
        let lb: Vec<u32> = b.next_batch().unwrap().unwrap().labels.to_vec1().unwrap();
        assert_eq!(la, lb);
    }

    #[test]
    fn test_label_tensor_rejects_mixed() {
        let labels = [Label::Class(1), Label::Score(3.0)];
        assert!(label_tensor(&labels, &Device::Cpu).is_err());
    }
}
