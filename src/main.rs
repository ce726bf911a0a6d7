//! `ballvae` command line: `generate` a dataset, `train` a model on it (fresh
//! or resumed from a checkpoint) and `eval` a saved checkpoint.

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::optim::AdamConfig;
use burn::tensor::backend::{AutodiffBackend, Backend};
use clap::{Args, Parser, Subcommand};
use log::info;

use ballvae::dataset::{BallDataset, DataSplit, DatasetOptions, SplitOptions};
use ballvae::eval::{evaluate, EvalOptions};
use ballvae::generate::{generate, GeneratorConfig};
use ballvae::model::{load_model, ModelConfig, VariationalAutoEncoder};
use ballvae::schedule::{BetaScheduler, CapacitySchedule};
use ballvae::solver::{check_dataset_fits, resume, Solver, TrainOptions};

/// Bouncing-ball video generation and VAE dynamics training
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simulate trajectories and write frames plus ground truth
    Generate(GenerateArgs),
    /// Train the VAE on a generated dataset
    Train(TrainArgs),
    /// Render predictions of a trained model for a few samples
    Eval(EvalArgs),
}

#[derive(Args, Debug, Clone)]
struct GenerateArgs {
    /// Output directory
    #[arg(long, short = 'o', default_value = "datasets/ball", env = "BALLVAE_DATA")]
    out: PathBuf,

    #[arg(long, default_value = "2176")]
    num_sequences: usize,

    /// Frames per sequence, input and output together
    #[arg(long, default_value = "100")]
    sequence_length: usize,

    #[arg(long, default_value = "32")]
    window_size: u32,

    #[arg(long, default_value = "5")]
    ball_radius: f32,

    /// Per-axis speed limit in pixels per second
    #[arg(long, default_value = "300")]
    v_max: f32,

    /// Resample initial states until the ball never touches a wall
    #[arg(long)]
    avoid_collisions: bool,

    #[arg(long, short = 's', default_value = "456")]
    seed: u64,
}

#[derive(Args, Debug, Clone)]
struct BackendArgs {
    /// Run on the CPU instead of the GPU
    #[arg(long)]
    cpu: bool,
}

#[derive(Args, Debug, Clone)]
struct TrainArgs {
    /// Dataset directory written by `generate`
    #[arg(long, default_value = "datasets/ball", env = "BALLVAE_DATA")]
    data: PathBuf,

    #[arg(long, default_value = "25")]
    len_inp: usize,

    #[arg(long, default_value = "1")]
    len_out: usize,

    #[arg(long)]
    load_to_ram: bool,

    #[arg(long, default_value = "6")]
    z_dim_encoder: usize,

    #[arg(long, default_value = "6")]
    z_dim_decoder: usize,

    /// Roll the latent position forward by its velocity for every output frame
    #[arg(long)]
    use_physics: bool,

    #[arg(long, short = 'b', default_value = "32", env = "BALLVAE_BATCH_SIZE")]
    batch_size: usize,

    #[arg(long = "epochs", short = 'e', default_value = "100", env = "BALLVAE_EPOCHS")]
    num_epochs: usize,

    #[arg(long = "lr", short = 'l', default_value = "0.001", env = "BALLVAE_LR")]
    learning_rate: f64,

    /// Initial KL weight
    #[arg(long, default_value = "0")]
    beta: f32,

    #[arg(long, default_value = "1")]
    beta_max: f32,

    #[arg(long, default_value = "0.1")]
    beta_increment: f32,

    /// Epochs without reconstruction improvement before beta grows; 0 keeps beta fixed
    #[arg(long, default_value = "5")]
    beta_patience: usize,

    #[arg(long, default_value = "0")]
    beta_min_delta: f32,

    /// Weight of the KL capacity term; 0 disables it
    #[arg(long, default_value = "0")]
    gamma: f32,

    #[arg(long, default_value = "0")]
    c_offset: f32,

    #[arg(long, default_value = "25")]
    c_max: f32,

    #[arg(long, default_value = "100000")]
    c_stop_iter: usize,

    #[arg(long, default_value = "0.5")]
    target_var: f32,

    /// Train and validate on the first `num_train_overfit` samples
    #[arg(long)]
    overfit: bool,

    #[arg(long, default_value = "1")]
    num_train_overfit: usize,

    #[arg(long, default_value = "2048")]
    num_train: usize,

    #[arg(long, default_value = "128")]
    num_val: usize,

    #[arg(long)]
    max_train_time_s: Option<f64>,

    #[arg(long, default_value = "1")]
    log_interval: usize,

    #[arg(long, default_value = "10")]
    save_interval: usize,

    #[arg(long, default_value = "saves")]
    save_path: PathBuf,

    #[arg(long)]
    log_reconstructed_images: bool,

    /// Run directory of a previous training to continue from
    #[arg(long, requires = "checkpoint_epoch")]
    continue_from: Option<PathBuf>,

    #[arg(long)]
    checkpoint_epoch: Option<usize>,

    #[arg(long, default_value = "456")]
    seed: u64,

    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Args, Debug, Clone)]
struct EvalArgs {
    #[arg(long, default_value = "datasets/ball", env = "BALLVAE_DATA")]
    data: PathBuf,

    /// Model checkpoint path, without extension
    #[arg(long)]
    model: PathBuf,

    /// Samples are picked from the first `batch_size` dataset items
    #[arg(long, default_value = "256")]
    batch_size: usize,

    #[arg(long, default_value = "5")]
    num_show: usize,

    #[arg(long, default_value = "eval")]
    out: PathBuf,

    #[command(flatten)]
    backend: BackendArgs,
}

fn run_generate(args: GenerateArgs) -> Result<()> {
    let config = GeneratorConfig {
        num_sequences: args.num_sequences,
        sequence_length: args.sequence_length,
        window_size_x: args.window_size,
        window_size_y: args.window_size,
        ball_radius: args.ball_radius,
        v_max: args.v_max,
        position_std: args.window_size as f32 / 4.0,
        avoid_collisions: args.avoid_collisions,
        seed: args.seed,
        ..GeneratorConfig::default()
    };
    generate(&config, &args.out).context("dataset generation failed")?;
    Ok(())
}

fn run_train<B: AutodiffBackend>(args: TrainArgs, device: B::Device) -> Result<()> {
    B::seed(args.seed);

    info!(
        "Loading dataset with input sequence length {} and output sequence length {}...",
        args.len_inp, args.len_out
    );
    let dataset = BallDataset::open(
        &args.data,
        DatasetOptions {
            len_inp_sequence: args.len_inp,
            len_out_sequence: args.len_out,
            load_to_ram: args.load_to_ram,
            load_ground_truth: false,
        },
    )?;

    let split = DataSplit::new(
        dataset.len(),
        args.batch_size,
        &SplitOptions {
            do_overfitting: args.overfit,
            num_train_overfit: args.num_train_overfit,
            num_train_regular: args.num_train,
            num_val_regular: args.num_val,
        },
    )?;

    let model_config = ModelConfig {
        len_inp_sequence: args.len_inp,
        len_out_sequence: args.len_out,
        z_dim_encoder: args.z_dim_encoder,
        z_dim_decoder: args.z_dim_decoder,
        use_physics: args.use_physics,
        height: dataset.height,
        width: dataset.width,
    };

    let options = TrainOptions {
        model: model_config.clone(),
        num_epochs: args.num_epochs,
        batch_size: args.batch_size,
        learning_rate: args.learning_rate,
        gamma: args.gamma,
        capacity: CapacitySchedule {
            c_offset: args.c_offset,
            c_max: args.c_max,
            c_stop_iter: args.c_stop_iter,
        },
        target_var: args.target_var,
        max_train_time_s: args.max_train_time_s,
        log_interval: Some(args.log_interval),
        save_interval: Some(args.save_interval),
        save_path: args.save_path.clone(),
        log_reconstructed_images: args.log_reconstructed_images,
        seed: args.seed,
    };

    let optim = AdamConfig::new().init::<B, VariationalAutoEncoder<B>>();

    let (model, mut optim, mut solver, options) = match (&args.continue_from, args.checkpoint_epoch) {
        (Some(run_dir), Some(epoch)) => {
            let resumed = resume::<B, _>(run_dir, epoch, optim, &device)
                .with_context(|| format!("cannot resume from {:?}", run_dir))?;
            check_dataset_fits(&resumed.model_config, &dataset)
                .context("checkpoint does not fit the dataset")?;
            let options = TrainOptions {
                model: resumed.model_config,
                ..options
            };
            (resumed.model, resumed.optim, resumed.solver, options)
        }
        _ => {
            model_config.validate()?;
            info!("Initializing model...");
            let model = model_config.init::<B>(&device);
            let beta = BetaScheduler::new(
                args.beta,
                args.beta_max,
                args.beta_increment,
                args.beta_patience,
                args.beta_min_delta,
            );
            (model, optim, Solver::new(beta), options)
        }
    };

    let run = solver.train(model, &mut optim, &dataset, &split, &options, &device)?;
    info!("Run saved to {:?}", run.run_dir);
    Ok(())
}

fn run_eval<B: Backend>(args: EvalArgs, device: B::Device) -> Result<()> {
    let (model, config) = load_model::<B>(&args.model, &device)
        .with_context(|| format!("cannot load model {:?}", args.model))?;

    let dataset = BallDataset::open(
        &args.data,
        DatasetOptions {
            len_inp_sequence: config.len_inp_sequence,
            len_out_sequence: config.len_out_sequence,
            load_to_ram: false,
            load_ground_truth: false,
        },
    )?;
    check_dataset_fits(&config, &dataset).context("model does not fit the dataset")?;

    let summary = evaluate(
        &model,
        &dataset,
        &EvalOptions {
            batch_size: args.batch_size,
            num_show_images: args.num_show,
            out_dir: args.out.clone(),
        },
        &device,
    )?;
    info!(
        "Wrote {} comparison sheets to {:?}",
        summary.samples.len(),
        args.out
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let cli = Cli::parse();

    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Train(args) => {
            if args.backend.cpu {
                info!("Training on CPU.");
                run_train::<Autodiff<NdArray>>(args, NdArrayDevice::Cpu)
            } else {
                let device = WgpuDevice::default();
                info!("Training on {:?}.", device);
                run_train::<Autodiff<Wgpu>>(args, device)
            }
        }
        Command::Eval(args) => {
            if args.backend.cpu {
                run_eval::<NdArray>(args, NdArrayDevice::Cpu)
            } else {
                run_eval::<Wgpu>(args, WgpuDevice::default())
            }
        }
    }
}
