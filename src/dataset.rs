//! Windowed access to a generated bouncing-ball dataset.
//!
//! Each `seqN` directory contributes one sample: the first `len_inp_sequence`
//! frames as input and the following `len_out_sequence` frames as target.

use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use log::info;
use ndarray::{s, Array2};
use ndarray_npy::ReadNpyExt;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::generate::{self, GeneratorConfig, GROUND_TRUTH_FILE};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatasetOptions {
    pub len_inp_sequence: usize,
    pub len_out_sequence: usize,
    pub load_to_ram: bool,
    pub load_ground_truth: bool,
}

impl DatasetOptions {
    pub fn window_len(&self) -> usize {
        self.len_inp_sequence + self.len_out_sequence
    }
}

/// One training example: an input window and the frames that follow it.
#[derive(Debug, Clone)]
pub struct Sample {
    /// `len_inp * H * W` pixels in `[0, 1]`, frame-major.
    pub input: Vec<f32>,
    /// `len_out * H * W` pixels in `[0, 1]`, frame-major.
    pub target: Vec<f32>,
    /// `[len_inp + len_out, 6]` rows of `x, y, vx, vy, ax, ay`.
    pub ground_truth: Option<Array2<f32>>,
}

#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    pub input: Tensor<B, 4>,
    pub target: Tensor<B, 4>,
    pub ground_truth: Option<Tensor<B, 3>>,
}

pub struct BallDataset {
    pub config: GeneratorConfig,
    pub options: DatasetOptions,
    pub sequence_dirs: Vec<PathBuf>,
    pub height: usize,
    pub width: usize,
    cache: Option<Vec<Sample>>,
}

fn sequence_index(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix("seq")?
        .parse()
        .ok()
}

impl BallDataset {
    pub fn open(root: &Path, options: DatasetOptions) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::MissingDirectory(root.to_path_buf()));
        }
        if options.len_inp_sequence == 0 || options.len_out_sequence == 0 {
            return Err(Error::InvalidConfig(
                "input and output sequence lengths must be > 0".into(),
            ));
        }

        let config = GeneratorConfig::load(root)?;
        if options.window_len() > config.sequence_length {
            return Err(Error::InvalidConfig(format!(
                "window of {} frames exceeds sequence length {}",
                options.window_len(),
                config.sequence_length
            )));
        }

        let mut indexed = Vec::new();
        for entry in fs::read_dir(root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(idx) = sequence_index(&path) {
                indexed.push((idx, path));
            }
        }
        if indexed.is_empty() {
            return Err(Error::EmptyDataset(root.to_path_buf()));
        }
        indexed.sort_by_key(|(idx, _)| *idx);
        let sequence_dirs: Vec<PathBuf> = indexed.into_iter().map(|(_, p)| p).collect();

        let mut dataset = Self {
            height: config.window_size_y as usize,
            width: config.window_size_x as usize,
            config,
            options,
            sequence_dirs,
            cache: None,
        };

        if options.load_to_ram {
            let samples = (0..dataset.len())
                .map(|idx| dataset.load_sample(idx))
                .collect::<Result<Vec<_>>>()?;
            dataset.cache = Some(samples);
        }

        info!(
            "Loaded {} sequences from {:?} (input {}, output {}, in RAM: {})",
            dataset.len(),
            root,
            options.len_inp_sequence,
            options.len_out_sequence,
            options.load_to_ram
        );

        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.sequence_dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence_dirs.is_empty()
    }

    pub fn frame_len(&self) -> usize {
        self.height * self.width
    }

    fn load_frame(&self, path: &Path, out: &mut Vec<f32>) -> Result<()> {
        let img = image::open(path)?.to_luma8();
        let expected = (self.width as u32, self.height as u32);
        if img.dimensions() != expected {
            return Err(Error::FrameSize {
                path: path.to_path_buf(),
                actual: img.dimensions(),
                expected,
            });
        }
        out.extend(img.pixels().map(|p| p[0] as f32 / 255.0));
        Ok(())
    }

    fn load_sample(&self, idx: usize) -> Result<Sample> {
        let dir = &self.sequence_dirs[idx];
        let len_inp = self.options.len_inp_sequence;
        let len_out = self.options.len_out_sequence;

        let mut input = Vec::with_capacity(len_inp * self.frame_len());
        for k in 0..len_inp {
            self.load_frame(&generate::frame_path(dir, k), &mut input)?;
        }

        let mut target = Vec::with_capacity(len_out * self.frame_len());
        for k in len_inp..len_inp + len_out {
            self.load_frame(&generate::frame_path(dir, k), &mut target)?;
        }

        let ground_truth = if self.options.load_ground_truth {
            let file = fs::File::open(dir.join(GROUND_TRUTH_FILE))?;
            let full = Array2::<f32>::read_npy(file)?;
            if full.nrows() < self.options.window_len() || full.ncols() != 6 {
                return Err(Error::InvalidConfig(format!(
                    "ground truth in {:?} has shape {:?}",
                    dir,
                    full.dim()
                )));
            }
            Some(full.slice(s![..self.options.window_len(), ..]).to_owned())
        } else {
            None
        };

        Ok(Sample {
            input,
            target,
            ground_truth,
        })
    }

    pub fn get(&self, idx: usize) -> Result<Sample> {
        if idx >= self.len() {
            return Err(Error::IndexOutOfBounds {
                index: idx,
                size: self.len(),
            });
        }
        match &self.cache {
            Some(samples) => Ok(samples[idx].clone()),
            None => self.load_sample(idx),
        }
    }

    pub fn get_batch<B: Backend>(&self, indices: &[usize], device: &B::Device) -> Result<Batch<B>> {
        let n = indices.len();
        let len_inp = self.options.len_inp_sequence;
        let len_out = self.options.len_out_sequence;
        let window = self.options.window_len();

        let mut input = Vec::with_capacity(n * len_inp * self.frame_len());
        let mut target = Vec::with_capacity(n * len_out * self.frame_len());
        let mut ground_truth = Vec::new();

        for &idx in indices {
            let sample = self.get(idx)?;
            input.extend_from_slice(&sample.input);
            target.extend_from_slice(&sample.target);
            if let Some(gt) = sample.ground_truth {
                ground_truth.extend(gt.iter().copied());
            }
        }

        let input = Tensor::<B, 4>::from_data(
            TensorData::new(input, [n, len_inp, self.height, self.width]),
            device,
        );
        let target = Tensor::<B, 4>::from_data(
            TensorData::new(target, [n, len_out, self.height, self.width]),
            device,
        );
        let ground_truth = if self.options.load_ground_truth {
            Some(Tensor::<B, 3>::from_data(
                TensorData::new(ground_truth, [n, window, 6]),
                device,
            ))
        } else {
            None
        };

        Ok(Batch {
            input,
            target,
            ground_truth,
        })
    }
}

/// Sample indices used for training and validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSplit {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
    /// Regular runs visit samples in random order; overfitting runs go in order.
    pub shuffle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitOptions {
    pub do_overfitting: bool,
    pub num_train_overfit: usize,
    pub num_train_regular: usize,
    pub num_val_regular: usize,
}

impl DataSplit {
    pub fn new(dataset_len: usize, batch_size: usize, options: &SplitOptions) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be > 0".into()));
        }
        if batch_size > dataset_len {
            return Err(Error::InvalidConfig(
                "Batch size bigger than the dataset.".into(),
            ));
        }

        if options.do_overfitting {
            info!(
                "Overfitting on a subset of {} samples",
                options.num_train_overfit
            );
            if batch_size > options.num_train_overfit {
                return Err(Error::InvalidConfig(
                    "Batch size for overfitting bigger than the number of samples for overfitting."
                        .into(),
                ));
            }
            if options.num_train_overfit > dataset_len {
                return Err(Error::InvalidConfig(format!(
                    "Overfitting subset of {} exceeds dataset size {}",
                    options.num_train_overfit, dataset_len
                )));
            }
            let subset: Vec<usize> = (0..options.num_train_overfit).collect();
            Ok(Self {
                train: subset.clone(),
                val: subset,
                shuffle: false,
            })
        } else {
            info!("Training on {} samples", options.num_train_regular);
            let total = options.num_train_regular + options.num_val_regular;
            if total > dataset_len {
                return Err(Error::InvalidConfig(format!(
                    "Trying to use more samples for training and validation than the dataset holds, {} > {}.",
                    total, dataset_len
                )));
            }
            Ok(Self {
                train: (0..options.num_train_regular).collect(),
                val: (options.num_train_regular..total).collect(),
                shuffle: true,
            })
        }
    }
}

pub struct BatchSampler {
    indices: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
}

impl BatchSampler {
    pub fn new(
        indices: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be > 0".into()));
        }
        Ok(Self {
            indices,
            batch_size,
            shuffle,
            drop_last,
        })
    }

    pub fn num_batches(&self) -> usize {
        if self.drop_last {
            self.indices.len() / self.batch_size
        } else {
            self.indices.len().div_ceil(self.batch_size)
        }
    }

    pub fn batches<R: Rng>(&self, rng: &mut R) -> Vec<Vec<usize>> {
        let mut order = self.indices.clone();
        if self.shuffle {
            order.shuffle(rng);
        }
        order
            .chunks(self.batch_size)
            .filter(|chunk| !self.drop_last || chunk.len() == self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}
