//! Image datasets, per-channel normalization and batching.

use crate::error::{MaeError, Result};
use ndarray::{s, Array1, Array3, Array4, ArrayViewMut4, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Per-channel mean and standard deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl ChannelStats {
    /// CIFAR-10 training-set statistics.
    pub fn cifar10() -> Self {
        Self {
            mean: vec![0.4914, 0.4822, 0.4465],
            std: vec![0.2470, 0.2435, 0.2616],
        }
    }

    /// Measures the statistics of a dataset.
    pub fn from_dataset(dataset: &ImageDataset) -> Self {
        let channels = dataset.shape().0;
        let mut mean = vec![0.0; channels];
        let mut std = vec![0.0; channels];
        for c in 0..channels {
            let values: Vec<f32> = dataset
                .images
                .iter()
                .flat_map(|img| img.index_axis(Axis(0), c).iter().copied().collect::<Vec<_>>())
                .collect();
            let n = values.len().max(1) as f32;
            let m = values.iter().sum::<f32>() / n;
            let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f32>() / n;
            mean[c] = m;
            std[c] = var.sqrt().max(1e-6);
        }
        Self { mean, std }
    }

    fn check_channels(&self, channels: usize) -> Result<()> {
        if self.mean.len() != channels || self.std.len() != channels {
            return Err(MaeError::shape(
                "channel statistics",
                channels,
                (self.mean.len(), self.std.len()),
            ));
        }
        Ok(())
    }

    fn apply(&self, mut batch: ArrayViewMut4<'_, f32>, inverse: bool) -> Result<()> {
        self.check_channels(batch.dim().1)?;
        for (c, mut channel) in batch.axis_iter_mut(Axis(1)).enumerate() {
            let (m, s) = (self.mean[c], self.std[c]);
            if inverse {
                channel.mapv_inplace(|v| v * s + m);
            } else {
                channel.mapv_inplace(|v| (v - m) / s);
            }
        }
        Ok(())
    }

    /// `(x - mean) / std` per channel, in place, on a `[B, C, H, W]` batch.
    pub fn normalize(&self, batch: ArrayViewMut4<'_, f32>) -> Result<()> {
        self.apply(batch, false)
    }

    /// Inverse of [`ChannelStats::normalize`].
    pub fn denormalize(&self, batch: ArrayViewMut4<'_, f32>) -> Result<()> {
        self.apply(batch, true)
    }
}

/// An in-memory collection of equally shaped `[C, H, W]` images.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    images: Vec<Array3<f32>>,
    shape: (usize, usize, usize),
}

impl ImageDataset {
    pub fn new(images: Vec<Array3<f32>>) -> Result<Self> {
        let shape = images
            .first()
            .map(|img| img.dim())
            .ok_or_else(|| MaeError::config("dataset", "no images"))?;
        if let Some(bad) = images.iter().find(|img| img.dim() != shape) {
            return Err(MaeError::shape("dataset image", shape, bad.dim()));
        }
        Ok(Self { images, shape })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// `(C, H, W)` shared by every image.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    pub fn get(&self, index: usize) -> Option<&Array3<f32>> {
        self.images.get(index)
    }

    /// Stacks the images at `indices` into a `[B, C, H, W]` batch.
    pub fn batch(&self, indices: &[usize]) -> Array4<f32> {
        let (c, h, w) = self.shape;
        let mut batch = Array4::zeros((indices.len(), c, h, w));
        for (b, &i) in indices.iter().enumerate() {
            batch.slice_mut(s![b, .., .., ..]).assign(&self.images[i]);
        }
        batch
    }

    /// The dataset with every image normalized by `stats`.
    pub fn normalized(mut self, stats: &ChannelStats) -> Result<Self> {
        for img in &mut self.images {
            stats.normalize(img.view_mut().insert_axis(Axis(0)))?;
        }
        Ok(self)
    }

    /// Splits off the last `1 - train_ratio` of the images.
    pub fn split(mut self, train_ratio: f32) -> (Self, Option<Self>) {
        let train_len = ((self.images.len() as f32) * train_ratio).floor() as usize;
        if train_len == 0 || train_len >= self.images.len() {
            return (self, None);
        }
        let rest = self.images.split_off(train_len);
        let shape = self.shape;
        (self, Some(Self { images: rest, shape }))
    }
}

/// An iterator over `[B, C, H, W]` batches of a dataset.
pub struct ImageBatchLoader<'a> {
    dataset: &'a ImageDataset,
    order: Vec<usize>,
    batch_size: usize,
    current_pos: usize,
}

impl<'a> ImageBatchLoader<'a> {
    /// Batches in dataset order.
    pub fn new(dataset: &'a ImageDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            order: (0..dataset.len()).collect(),
            batch_size: batch_size.max(1),
            current_pos: 0,
        }
    }

    /// Batches in an order shuffled by the caller's generator.
    pub fn shuffled<R: Rng + ?Sized>(dataset: &'a ImageDataset, batch_size: usize, rng: &mut R) -> Self {
        let mut loader = Self::new(dataset, batch_size);
        loader.order.shuffle(rng);
        loader
    }

    /// Number of full batches this loader yields.
    pub fn num_batches(&self) -> usize {
        self.order.len() / self.batch_size
    }
}

impl Iterator for ImageBatchLoader<'_> {
    type Item = Array4<f32>;

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.current_pos + self.batch_size;
        // The trailing partial batch is dropped.
        if end > self.order.len() {
            return None;
        }
        let batch = self.dataset.batch(&self.order[self.current_pos..end]);
        self.current_pos = end;
        Some(batch)
    }
}

/// Smooth random images in `[0, 1]`: a per-channel linear gradient plus a
/// low-frequency sinusoid, so neighbouring patches are correlated.
pub fn synthetic_dataset<R: Rng + ?Sized>(
    len: usize,
    channels: usize,
    size: usize,
    rng: &mut R,
) -> Result<ImageDataset> {
    let coords = Array1::linspace(0.0f32, 1.0, size);
    let images = (0..len)
        .map(|_| {
            let mut img = Array3::<f32>::zeros((channels, size, size));
            for mut channel in img.axis_iter_mut(Axis(0)) {
                let (gx, gy): (f32, f32) = (rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
                let freq: f32 = rng.gen_range(1.0..4.0);
                let phase: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
                for ((y, x), v) in channel.indexed_iter_mut() {
                    let (fx, fy) = (coords[x], coords[y]);
                    let wave = (freq * (fx + fy) * std::f32::consts::PI + phase).sin();
                    *v = (0.5 + 0.25 * (gx * fx + gy * fy) + 0.2 * wave).clamp(0.0, 1.0);
                }
            }
            img
        })
        .collect();
    ImageDataset::new(images)
}
