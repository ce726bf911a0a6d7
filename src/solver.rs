//! Training loop for the VAE: minibatch updates, per-epoch validation, KL
//! weight annealing and checkpoints that a later run can resume from.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::dataset::{BallDataset, BatchSampler, DataSplit};
use crate::error::{Error, Result};
use crate::eval::save_sample_sheet;
use crate::metrics::{time_left, ScalarLog, SmoothedLoss};
use crate::model::{self, vae_loss, LossWeights, ModelConfig, VariationalAutoEncoder};
use crate::schedule::{BetaScheduler, CapacitySchedule};

const SMOOTH_WINDOW_TRAIN: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainOptions {
    pub model: ModelConfig,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Weight of `|KL - C|`; zero disables the capacity term.
    pub gamma: f32,
    pub capacity: CapacitySchedule,
    pub target_var: f32,
    pub max_train_time_s: Option<f64>,
    pub log_interval: Option<usize>,
    pub save_interval: Option<usize>,
    pub save_path: PathBuf,
    pub log_reconstructed_images: bool,
    pub seed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub train_loss_history: Vec<f32>,
    pub train_recon_history: Vec<f32>,
    pub train_kl_history: Vec<f32>,
    pub val_loss_history: Vec<f32>,
    /// Beta in effect at the end of each epoch.
    pub beta_history: Vec<f32>,
}

/// Files written for one checkpoint.
pub struct CheckpointPaths {
    pub model: PathBuf,
    pub optimizer: PathBuf,
    pub solver: PathBuf,
}

impl CheckpointPaths {
    pub fn new(run_dir: &Path, epoch: usize) -> Self {
        Self {
            model: run_dir.join(format!("model{}", epoch)),
            optimizer: run_dir.join(format!("optim{}", epoch)),
            solver: run_dir.join(format!("solver{}.json", epoch)),
        }
    }
}

pub struct TrainedRun<B: Backend> {
    pub model: VariationalAutoEncoder<B>,
    pub run_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solver {
    pub history: History,
    pub beta: BetaScheduler,
    /// Completed epochs, carried across resumed runs.
    pub epoch: usize,
    pub iteration: usize,
    pub training_time_s: f64,
    pub stop_reason: String,
    pub smoothed: SmoothedLoss,
}

/// Frame counts and frame size of the model must match the dataset windows.
pub fn check_dataset_fits(model: &ModelConfig, dataset: &BallDataset) -> Result<()> {
    let expected = (
        model.len_inp_sequence,
        model.len_out_sequence,
        model.height,
        model.width,
    );
    let actual = (
        dataset.options.len_inp_sequence,
        dataset.options.len_out_sequence,
        dataset.height,
        dataset.width,
    );
    if expected != actual {
        return Err(Error::InvalidConfig(format!(
            "model expects {} input / {} output frames of {}x{}, dataset gives {} / {} of {}x{}",
            model.len_inp_sequence,
            model.len_out_sequence,
            model.width,
            model.height,
            dataset.options.len_inp_sequence,
            dataset.options.len_out_sequence,
            dataset.width,
            dataset.height
        )));
    }
    Ok(())
}

/// Creates `train<timestamp>` under `save_path`, adding `_1`, `_2`, ... when a
/// run started in the same second already owns the name.
pub fn create_run_dir(save_path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(save_path)?;
    let stem = format!("train{}", chrono::Local::now().format("%Y%m%d%H%M%S"));
    let mut run_dir = save_path.join(&stem);
    let mut suffix = 0;
    loop {
        match fs::create_dir(&run_dir) {
            Ok(()) => return Ok(run_dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                suffix += 1;
                run_dir = save_path.join(format!("{}_{}", stem, suffix));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor.into_scalar().elem::<f32>()
}

impl Solver {
    pub fn new(beta: BetaScheduler) -> Self {
        Self {
            history: History::default(),
            beta,
            epoch: 0,
            iteration: 0,
            training_time_s: 0.0,
            stop_reason: String::new(),
            smoothed: SmoothedLoss::new(SMOOTH_WINDOW_TRAIN),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        info!("Saving solver... {:?}", path);
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    fn loss_weights(&self, options: &TrainOptions) -> LossWeights {
        LossWeights {
            beta: self.beta.beta,
            gamma: options.gamma,
            capacity: options.capacity.capacity(self.iteration),
            target_var: options.target_var,
        }
    }

    pub fn train<B, O>(
        &mut self,
        mut model: VariationalAutoEncoder<B>,
        optim: &mut O,
        dataset: &BallDataset,
        split: &DataSplit,
        options: &TrainOptions,
        device: &B::Device,
    ) -> Result<TrainedRun<B>>
    where
        B: AutodiffBackend,
        O: Optimizer<VariationalAutoEncoder<B>, B>,
    {
        check_dataset_fits(&options.model, dataset)?;

        let run_dir = create_run_dir(&options.save_path)?;
        fs::write(
            run_dir.join("train_config.json"),
            serde_json::to_string_pretty(options)?,
        )?;
        fs::write(
            run_dir.join("dataset_config.json"),
            serde_json::to_string_pretty(&dataset.config)?,
        )?;
        if options.log_reconstructed_images {
            fs::create_dir_all(run_dir.join("images"))?;
        }
        let mut scalars = ScalarLog::open(&run_dir)?;

        let batch_size = options.batch_size;
        let train_sampler = BatchSampler::new(split.train.clone(), batch_size, split.shuffle, true)?;
        let val_sampler = BatchSampler::new(split.val.clone(), batch_size, split.shuffle, true)?;
        let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(self.epoch as u64));

        let iter_per_epoch = train_sampler.num_batches();
        let n_iters = options.num_epochs * iter_per_epoch;
        let mut i_iter = 0;

        let start_epoch = self.epoch;
        let last_epoch = start_epoch + options.num_epochs;
        self.stop_reason.clear();
        let t_start_training = Instant::now();

        info!("Start training at epoch {}", start_epoch + 1);

        for i_epoch in start_epoch..last_epoch {
            let t_start_epoch = Instant::now();
            let mut epoch_recon = 0.0f32;
            let mut epoch_batches = 0usize;

            for indices in train_sampler.batches(&mut rng) {
                let t_start_iter = Instant::now();
                i_iter += 1;

                if indices.len() < batch_size {
                    debug!("Skipped batch");
                    continue;
                }
                self.iteration += 1;

                let batch = dataset.get_batch::<B>(&indices, device)?;
                let weights = self.loss_weights(options);

                let (prediction, latent) = model.forward(batch.input);
                let loss = vae_loss(prediction, batch.target, &latent, &weights)?;

                let loss_val = scalar(loss.total.clone());
                let recon_val = scalar(loss.reconstruction.clone());
                let kl_val = scalar(loss.kl.total.clone());

                let grads = loss.total.backward();
                let grad_params = GradientsParams::from_grads(grads, &model);
                model = optim.step(options.learning_rate, model, grad_params);

                self.history.train_loss_history.push(loss_val);
                self.history.train_recon_history.push(recon_val);
                self.history.train_kl_history.push(kl_val);
                let train_loss_avg = self.smoothed.update(loss_val);

                epoch_recon += recon_val;
                epoch_batches += 1;

                if let Some(every) = options.log_interval.filter(|n| *n > 0) {
                    if i_iter % every == 0 {
                        info!(
                            "Iteration {}/{}   Train loss: {:.6}   Avg: {:.6}   Recon: {:.6}   KL: {:.6}   beta: {:.4} - {}ms   ETA {}",
                            i_iter,
                            n_iters,
                            loss_val,
                            train_loss_avg,
                            recon_val,
                            kl_val,
                            weights.beta,
                            t_start_iter.elapsed().as_millis(),
                            time_left(t_start_training.elapsed(), n_iters, i_iter)
                        );
                        scalars.add_scalar("train/loss", loss_val, self.iteration)?;
                        scalars.add_scalar("train/loss_avg", train_loss_avg, self.iteration)?;
                        scalars.add_scalar("train/reconstruction", recon_val, self.iteration)?;
                        scalars.add_scalar("train/kl", kl_val, self.iteration)?;
                        scalars.add_scalar("train/capacity", weights.capacity, self.iteration)?;
                    }
                }
            }

            info!("Validate model after epoch {}/{}", i_epoch + 1, last_epoch);

            let model_valid = model.valid();
            let val_loss = self.validate(&model_valid, dataset, &val_sampler, &mut rng, options, device)?;

            match val_loss {
                Some(val_loss) => {
                    self.history.val_loss_history.push(val_loss);
                    scalars.add_scalar("val/loss", val_loss, i_epoch + 1)?;
                }
                None => warn!("No complete validation batch, skipping validation"),
            }

            if epoch_batches > 0 {
                let mean_recon = epoch_recon / epoch_batches as f32;
                if self.beta.observe(mean_recon) {
                    info!(
                        "Reconstruction plateaued at {:.6}, beta raised to {:.4}",
                        mean_recon, self.beta.beta
                    );
                }
                scalars.add_scalar("train/epoch_reconstruction", mean_recon, i_epoch + 1)?;
            }
            self.history.beta_history.push(self.beta.beta);
            scalars.add_scalar("beta", self.beta.beta, i_epoch + 1)?;

            info!(
                "Avg Train Loss: {:.6}   Val loss: {}   - {}ms",
                self.smoothed.value,
                val_loss.map_or_else(|| "n/a".to_string(), |v| format!("{:.6}", v)),
                t_start_epoch.elapsed().as_millis()
            );

            if options.log_reconstructed_images {
                if let Some(&index) = split.val.first() {
                    let sample = dataset.get(index)?;
                    let path = run_dir
                        .join("images")
                        .join(format!("epoch{}.png", i_epoch + 1));
                    let mse = save_sample_sheet(&model_valid, dataset, &sample, &path, device)?;
                    scalars.add_scalar("val/sample_mse", mse, i_epoch + 1)?;
                }
            }
            scalars.flush()?;

            self.epoch = i_epoch + 1;

            if let Some(every) = options.save_interval.filter(|n| *n > 0) {
                if self.epoch % every == 0 {
                    self.checkpoint(&model, optim, &run_dir, options)?;
                }
            }

            if let Some(limit) = options.max_train_time_s {
                if t_start_training.elapsed().as_secs_f64() > limit {
                    info!("Training time is over.");
                    self.stop_reason = "Training time over.".to_string();
                    break;
                }
            }
        }

        if self.stop_reason.is_empty() {
            self.stop_reason = "Reached number of specified epochs.".to_string();
        }
        self.training_time_s += t_start_training.elapsed().as_secs_f64();

        self.checkpoint(&model, optim, &run_dir, options)?;
        scalars.flush()?;

        info!("FINISH. {} ({:.1}s total)", self.stop_reason, self.training_time_s);

        Ok(TrainedRun { model, run_dir })
    }

    fn validate<B: Backend>(
        &self,
        model: &VariationalAutoEncoder<B>,
        dataset: &BallDataset,
        sampler: &BatchSampler,
        rng: &mut StdRng,
        options: &TrainOptions,
        device: &B::Device,
    ) -> Result<Option<f32>> {
        let weights = self.loss_weights(options);
        let mut val_loss = 0.0f32;
        let mut num_val_batches = 0usize;

        for indices in sampler.batches(rng) {
            let batch = dataset.get_batch::<B>(&indices, device)?;
            let (prediction, latent) = model.forward(batch.input);
            let loss = vae_loss(prediction, batch.target, &latent, &weights)?;
            val_loss += scalar(loss.total);
            num_val_batches += 1;
        }

        if num_val_batches == 0 {
            return Ok(None);
        }
        Ok(Some(val_loss / num_val_batches as f32))
    }

    pub fn checkpoint<B, O>(
        &self,
        model: &VariationalAutoEncoder<B>,
        optim: &O,
        run_dir: &Path,
        options: &TrainOptions,
    ) -> Result<CheckpointPaths>
    where
        B: AutodiffBackend,
        O: Optimizer<VariationalAutoEncoder<B>, B>,
    {
        let paths = CheckpointPaths::new(run_dir, self.epoch);
        model::save_model(model, &options.model, &paths.model)?;
        let recorder = CompactRecorder::new();
        <CompactRecorder as Recorder<B>>::record(&recorder, optim.to_record(), paths.optimizer.clone())?;
        self.save(&paths.solver)?;
        Ok(paths)
    }
}

/// Model, optimizer and solver restored from a checkpoint, ready for `Solver::train`.
pub struct Resumed<B: AutodiffBackend, O> {
    pub model: VariationalAutoEncoder<B>,
    pub model_config: ModelConfig,
    pub optim: O,
    pub solver: Solver,
}

pub fn resume<B, O>(run_dir: &Path, epoch: usize, optim: O, device: &B::Device) -> Result<Resumed<B, O>>
where
    B: AutodiffBackend,
    O: Optimizer<VariationalAutoEncoder<B>, B>,
{
    let paths = CheckpointPaths::new(run_dir, epoch);
    info!(
        "Continuing training with model: {:?} and solver: {:?}",
        paths.model, paths.solver
    );

    let (model, model_config) = model::load_model::<B>(&paths.model, device)?;
    let recorder = CompactRecorder::new();
    let record = <CompactRecorder as Recorder<B>>::load::<O::Record>(
        &recorder,
        paths.optimizer.clone(),
        device,
    )?;
    let optim = optim.load_record(record);
    let solver = Solver::load(&paths.solver)?;

    Ok(Resumed {
        model,
        model_config,
        optim,
        solver,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetOptions, SplitOptions};
    use crate::generate::{generate, GeneratorConfig};
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;
    use tempfile::tempdir;

    type AB = Autodiff<NdArray<f32>>;

    fn tiny_dataset(dir: &Path) -> BallDataset {
        let config = GeneratorConfig {
            num_sequences: 6,
            sequence_length: 5,
            window_size_x: 16,
            window_size_y: 16,
            ball_radius: 3.0,
            position_std: 4.0,
            ..GeneratorConfig::default()
        };
        generate(&config, dir).unwrap();
        BallDataset::open(
            dir,
            DatasetOptions {
                len_inp_sequence: 2,
                len_out_sequence: 2,
                load_to_ram: true,
                load_ground_truth: false,
            },
        )
        .unwrap()
    }

    fn options(save_path: &Path, num_epochs: usize) -> TrainOptions {
        TrainOptions {
            model: ModelConfig {
                len_inp_sequence: 2,
                len_out_sequence: 2,
                z_dim_encoder: 4,
                z_dim_decoder: 4,
                use_physics: true,
                height: 16,
                width: 16,
            },
            num_epochs,
            batch_size: 2,
            learning_rate: 1e-3,
            gamma: 1.0,
            capacity: CapacitySchedule {
                c_offset: 0.0,
                c_max: 5.0,
                c_stop_iter: 10,
            },
            target_var: 1.0,
            max_train_time_s: None,
            log_interval: Some(1),
            save_interval: Some(1),
            save_path: save_path.to_path_buf(),
            log_reconstructed_images: true,
            seed: 456,
        }
    }

    fn split() -> DataSplit {
        DataSplit::new(
            6,
            2,
            &SplitOptions {
                do_overfitting: false,
                num_train_overfit: 2,
                num_train_regular: 4,
                num_val_regular: 2,
            },
        )
        .unwrap()
    }

    #[test]
    fn trains_records_history_and_checkpoints() {
        let data_dir = tempdir().unwrap();
        let save_dir = tempdir().unwrap();
        let dataset = tiny_dataset(data_dir.path());
        let opts = options(save_dir.path(), 2);

        let device = Default::default();
        let model = opts.model.init::<AB>(&device);
        let mut optim = AdamConfig::new().init::<AB, VariationalAutoEncoder<AB>>();
        let mut solver = Solver::new(BetaScheduler::new(0.0, 1.0, 0.1, 1, 0.0));

        let run = solver
            .train(model, &mut optim, &dataset, &split(), &opts, &device)
            .unwrap();

        assert_eq!(solver.epoch, 2);
        assert_eq!(solver.iteration, 4);
        assert_eq!(solver.history.train_loss_history.len(), 4);
        assert_eq!(solver.history.val_loss_history.len(), 2);
        assert_eq!(solver.history.beta_history.len(), 2);
        assert!(solver.history.train_loss_history.iter().all(|l| l.is_finite()));
        assert_eq!(solver.stop_reason, "Reached number of specified epochs.");

        let paths = CheckpointPaths::new(&run.run_dir, 2);
        assert!(paths.solver.exists());
        assert!(run.run_dir.join("model1.mpk").exists());
        assert!(run.run_dir.join("model2.json").exists());
        assert!(run.run_dir.join("optim2.mpk").exists());
        assert!(run.run_dir.join("images").join("epoch2.png").exists());
        assert!(run.run_dir.join("train_config.json").exists());

        let saved = Solver::load(&paths.solver).unwrap();
        assert_eq!(saved.epoch, 2);
        assert_eq!(saved.history, solver.history);
    }

    #[test]
    fn time_limit_stops_after_first_epoch() {
        let data_dir = tempdir().unwrap();
        let save_dir = tempdir().unwrap();
        let dataset = tiny_dataset(data_dir.path());
        let opts = TrainOptions {
            max_train_time_s: Some(0.0),
            save_interval: None,
            log_reconstructed_images: false,
            ..options(save_dir.path(), 5)
        };

        let device = Default::default();
        let model = opts.model.init::<AB>(&device);
        let mut optim = AdamConfig::new().init::<AB, VariationalAutoEncoder<AB>>();
        let mut solver = Solver::new(BetaScheduler::constant(0.5));

        let run = solver
            .train(model, &mut optim, &dataset, &split(), &opts, &device)
            .unwrap();

        assert_eq!(solver.epoch, 1);
        assert_eq!(solver.stop_reason, "Training time over.");
        assert!(solver.training_time_s > 0.0);
        assert!(CheckpointPaths::new(&run.run_dir, 1).solver.exists());
    }

    #[test]
    fn resumes_from_checkpoint() {
        let data_dir = tempdir().unwrap();
        let save_dir = tempdir().unwrap();
        let dataset = tiny_dataset(data_dir.path());
        let opts = TrainOptions {
            log_reconstructed_images: false,
            ..options(save_dir.path(), 1)
        };

        let device = Default::default();
        let model = opts.model.init::<AB>(&device);
        let mut optim = AdamConfig::new().init::<AB, VariationalAutoEncoder<AB>>();
        let mut solver = Solver::new(BetaScheduler::constant(0.0));
        let run = solver
            .train(model, &mut optim, &dataset, &split(), &opts, &device)
            .unwrap();

        let resumed = resume::<AB, _>(
            &run.run_dir,
            1,
            AdamConfig::new().init::<AB, VariationalAutoEncoder<AB>>(),
            &device,
        )
        .unwrap();
        assert_eq!(resumed.model_config, opts.model);
        assert_eq!(resumed.solver.epoch, 1);

        let mut solver = resumed.solver;
        let mut optim = resumed.optim;
        solver
            .train(resumed.model, &mut optim, &dataset, &split(), &opts, &device)
            .unwrap();
        assert_eq!(solver.epoch, 2);
        assert_eq!(solver.history.train_loss_history.len(), 4);
    }

    #[test]
    fn rejects_model_for_other_frame_size() {
        let data_dir = tempdir().unwrap();
        let save_dir = tempdir().unwrap();
        let dataset = tiny_dataset(data_dir.path());
        let base = options(save_dir.path(), 1);
        let opts = TrainOptions {
            model: ModelConfig {
                height: 32,
                width: 32,
                ..base.model.clone()
            },
            ..base
        };

        let device = Default::default();
        let model = opts.model.init::<AB>(&device);
        let mut optim = AdamConfig::new().init::<AB, VariationalAutoEncoder<AB>>();
        let mut solver = Solver::new(BetaScheduler::constant(0.0));

        let result = solver.train(model, &mut optim, &dataset, &split(), &opts, &device);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        assert_eq!(solver.epoch, 0);
        // nothing is written for a rejected run
        assert_eq!(fs::read_dir(save_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn rejects_model_for_other_window() {
        let data_dir = tempdir().unwrap();
        let dataset = tiny_dataset(data_dir.path());
        let model = ModelConfig {
            len_out_sequence: 1,
            ..options(data_dir.path(), 1).model
        };
        assert!(matches!(
            check_dataset_fits(&model, &dataset),
            Err(Error::InvalidConfig(_))
        ));
        assert!(check_dataset_fits(&options(data_dir.path(), 1).model, &dataset).is_ok());
    }

    #[test]
    fn run_dirs_started_together_stay_apart() {
        let save_dir = tempdir().unwrap();
        let first = create_run_dir(save_dir.path()).unwrap();
        let second = create_run_dir(save_dir.path()).unwrap();
        assert_ne!(first, second);
        assert!(first.is_dir());
        assert!(second.is_dir());
    }
}
