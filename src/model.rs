//! Convolutional VAE that encodes an input window of frames into a latent
//! state and decodes the frames that follow, plus its loss and persistence.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d};
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::latent::{kl_divergence, reparametrize, KlDivergence, LatentParams};

const HIDDEN_CHANNELS: usize = 128;

fn kaiming() -> Initializer {
    Initializer::KaimingUniform {
        gain: 0.1,
        fan_out_only: false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub len_inp_sequence: usize,
    pub len_out_sequence: usize,
    pub z_dim_encoder: usize,
    pub z_dim_decoder: usize,
    /// Decode each output frame from a latent position advanced by the latent velocity.
    pub use_physics: bool,
    pub height: usize,
    pub width: usize,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.len_inp_sequence == 0 || self.len_out_sequence == 0 {
            return Err(Error::InvalidConfig(
                "sequence lengths must be > 0".into(),
            ));
        }
        if self.z_dim_encoder == 0 || self.z_dim_decoder == 0 {
            return Err(Error::InvalidConfig("latent sizes must be > 0".into()));
        }
        if self.height % 4 != 0 || self.width % 4 != 0 || self.height == 0 || self.width == 0 {
            return Err(Error::InvalidConfig(format!(
                "frame size {}x{} must be a non-zero multiple of 4",
                self.width, self.height
            )));
        }
        if self.use_physics && self.z_dim_encoder % 2 != 0 {
            return Err(Error::InvalidConfig(
                "physics latent needs an even encoder size (position + velocity)".into(),
            ));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> VariationalAutoEncoder<B> {
        let out_channels = if self.use_physics {
            1
        } else {
            self.len_out_sequence
        };
        let bridge = (self.z_dim_encoder != self.z_dim_decoder).then(|| {
            LinearConfig::new(self.z_dim_encoder, self.z_dim_decoder)
                .with_initializer(kaiming())
                .init(device)
        });

        VariationalAutoEncoder {
            encoder: Encoder::new(
                self.len_inp_sequence,
                self.z_dim_encoder,
                self.height,
                self.width,
                device,
            ),
            bridge,
            decoder: Decoder::new(out_channels, self.z_dim_decoder, self.height, self.width, device),
            len_out_sequence: self.len_out_sequence,
            use_physics: self.use_physics,
        }
    }

    fn path_for(model_path: &Path) -> PathBuf {
        let mut name = model_path.as_os_str().to_owned();
        name.push(".json");
        PathBuf::from(name)
    }
}

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    conv1: Conv2d<B>,
    bn_1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn_2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn_3: BatchNorm<B, 2>,
    mu: Linear<B>,
    logvar: Linear<B>,
}

impl<B: Backend> Encoder<B> {
    pub fn new(
        in_channels: usize,
        z_dim: usize,
        height: usize,
        width: usize,
        device: &B::Device,
    ) -> Self {
        let flat = HIDDEN_CHANNELS * (height / 4) * (width / 4);
        Self {
            conv1: Conv2dConfig::new([in_channels, 32], [3, 3])
                .with_stride([1, 1])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_initializer(kaiming())
                .init(device),
            bn_1: BatchNormConfig::new(32).init(device),

            conv2: Conv2dConfig::new([32, 64], [3, 3])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_initializer(kaiming())
                .init(device),
            bn_2: BatchNormConfig::new(64).init(device),

            conv3: Conv2dConfig::new([64, HIDDEN_CHANNELS], [3, 3])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_initializer(kaiming())
                .init(device),
            bn_3: BatchNormConfig::new(HIDDEN_CHANNELS).init(device),

            mu: LinearConfig::new(flat, z_dim).init(device),
            logvar: LinearConfig::new(flat, z_dim).init(device),
        }
    }

    /// Returns `(mu, logvar)`, each `[N, z_dim]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let x = activation::relu(self.bn_1.forward(self.conv1.forward(x)));
        let x = activation::relu(self.bn_2.forward(self.conv2.forward(x)));
        let x = activation::relu(self.bn_3.forward(self.conv3.forward(x)));

        let x: Tensor<B, 2> = x.flatten(1, 3);

        let mu = self.mu.forward(x.clone());
        let logvar = self.logvar.forward(x).clamp(-10.0, 10.0);
        (mu, logvar)
    }
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    transfer: Linear<B>,
    reverse1: ConvTranspose2d<B>,
    bn_1: BatchNorm<B, 2>,
    reverse2: ConvTranspose2d<B>,
    bn_2: BatchNorm<B, 2>,
    reverse3: ConvTranspose2d<B>,
    height: usize,
    width: usize,
}

impl<B: Backend> Decoder<B> {
    pub fn new(
        out_channels: usize,
        z_dim: usize,
        height: usize,
        width: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            transfer: LinearConfig::new(z_dim, HIDDEN_CHANNELS * (height / 4) * (width / 4))
                .init(device),

            reverse1: ConvTranspose2dConfig::new([HIDDEN_CHANNELS, 64], [4, 4])
                .with_stride([2, 2])
                .with_padding([1, 1])
                .with_initializer(kaiming())
                .init(device),
            bn_1: BatchNormConfig::new(64).init(device),

            reverse2: ConvTranspose2dConfig::new([64, 32], [4, 4])
                .with_stride([2, 2])
                .with_padding([1, 1])
                .with_initializer(kaiming())
                .init(device),
            bn_2: BatchNormConfig::new(32).init(device),

            reverse3: ConvTranspose2dConfig::new([32, out_channels], [3, 3])
                .with_stride([1, 1])
                .with_padding([1, 1])
                .with_initializer(kaiming())
                .init(device),

            height,
            width,
        }
    }

    pub fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 4> {
        let y = activation::relu(self.transfer.forward(z));
        let batch_size = y.dims()[0];
        let y = y.reshape([batch_size, HIDDEN_CHANNELS, self.height / 4, self.width / 4]);

        let y = activation::relu(self.bn_1.forward(self.reverse1.forward(y)));
        let y = activation::relu(self.bn_2.forward(self.reverse2.forward(y)));

        activation::sigmoid(self.reverse3.forward(y))
    }
}

/// Predicts the next `len_out_sequence` frames from a stack of input frames.
#[derive(Module, Debug)]
pub struct VariationalAutoEncoder<B: Backend> {
    encoder: Encoder<B>,
    bridge: Option<Linear<B>>,
    decoder: Decoder<B>,
    len_out_sequence: usize,
    use_physics: bool,
}

impl<B: Backend> VariationalAutoEncoder<B> {
    /// `x` is `[N, len_inp, H, W]`; the prediction is `[N, len_out, H, W]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, LatentParams<B>) {
        let (mu, logvar) = self.encoder.forward(x);
        let z = reparametrize(mu.clone(), logvar.clone());
        let prediction = self.decode(z.clone());
        (prediction, LatentParams { mu, logvar, z })
    }

    /// Decodes from the posterior mean, without sampling.
    pub fn predict(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let (mu, _) = self.encoder.forward(x);
        self.decode(mu)
    }

    pub fn encode(&self, x: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        self.encoder.forward(x)
    }

    pub fn decode(&self, z: Tensor<B, 2>) -> Tensor<B, 4> {
        if !self.use_physics {
            return self.decoder.forward(self.bridged(z));
        }

        let [batch_size, dims] = z.dims();
        let half = dims / 2;
        let position = z.clone().slice([0..batch_size, 0..half]);
        let velocity = z.slice([0..batch_size, half..dims]);

        let frames: Vec<Tensor<B, 4>> = (0..self.len_out_sequence)
            .map(|k| {
                let rolled = position.clone() + velocity.clone() * (k + 1) as f32;
                let z_k = Tensor::cat(vec![rolled, velocity.clone()], 1);
                self.decoder.forward(self.bridged(z_k))
            })
            .collect();

        Tensor::cat(frames, 1)
    }

    fn bridged(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        match &self.bridge {
            Some(linear) => linear.forward(z),
            None => z,
        }
    }
}

/// Coefficients of the training objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    pub beta: f32,
    pub gamma: f32,
    pub capacity: f32,
    pub target_var: f32,
}

#[derive(Debug, Clone)]
pub struct VaeLoss<B: Backend> {
    pub total: Tensor<B, 1>,
    pub reconstruction: Tensor<B, 1>,
    pub kl: KlDivergence<B>,
}

/// `recon + beta * KL + gamma * |KL - C|`, with a Gaussian reconstruction term
/// of variance `target_var` summed per sample and averaged over the batch.
pub fn vae_loss<B: Backend>(
    prediction: Tensor<B, 4>,
    target: Tensor<B, 4>,
    latent: &LatentParams<B>,
    weights: &LossWeights,
) -> Result<VaeLoss<B>> {
    let squared: Tensor<B, 2> = (prediction - target).powf_scalar(2.0).flatten(1, 3);
    let reconstruction = squared.sum_dim(1).mean() / (2.0 * weights.target_var);

    let kl = kl_divergence(latent.mu.clone(), latent.logvar.clone())?;

    let mut total = reconstruction.clone() + kl.total.clone() * weights.beta;
    if weights.gamma > 0.0 {
        total = total + (kl.total.clone() - weights.capacity).abs() * weights.gamma;
    }

    Ok(VaeLoss {
        total,
        reconstruction,
        kl,
    })
}

pub fn save_model<B: Backend>(
    model: &VariationalAutoEncoder<B>,
    config: &ModelConfig,
    path: &Path,
) -> Result<()> {
    let recorder = CompactRecorder::new();
    recorder.record(model.clone().into_record(), path.to_path_buf())?;
    fs::write(
        ModelConfig::path_for(path),
        serde_json::to_string_pretty(config)?,
    )?;
    info!("Model saved to {:?}", path);
    Ok(())
}

pub fn load_model<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(VariationalAutoEncoder<B>, ModelConfig)> {
    let config: ModelConfig =
        serde_json::from_str(&fs::read_to_string(ModelConfig::path_for(path))?)?;
    config.validate()?;

    let recorder = CompactRecorder::new();
    let record = recorder.load(path.to_path_buf(), device)?;
    let model = config.init::<B>(device).load_record(record);

    Ok((model, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::{Distribution, TensorData};
    use tempfile::tempdir;

    type B = NdArray<f32>;

    fn config(use_physics: bool, z_dec: usize) -> ModelConfig {
        ModelConfig {
            len_inp_sequence: 3,
            len_out_sequence: 2,
            z_dim_encoder: 6,
            z_dim_decoder: z_dec,
            use_physics,
            height: 16,
            width: 16,
        }
    }

    fn frames(n: usize, c: usize) -> Tensor<B, 4> {
        Tensor::random([n, c, 16, 16], Distribution::Uniform(0.0, 1.0), &Default::default())
    }

    #[test]
    fn forward_shapes() {
        let device = Default::default();
        for (physics, z_dec) in [(false, 6), (false, 4), (true, 6), (true, 10)] {
            let model = config(physics, z_dec).init::<B>(&device);
            let (pred, latent) = model.forward(frames(2, 3));
            assert_eq!(pred.dims(), [2, 2, 16, 16]);
            assert_eq!(latent.mu.dims(), [2, 6]);
            assert_eq!(latent.logvar.dims(), [2, 6]);
            assert_eq!(latent.z.dims(), [2, 6]);
        }
    }

    #[test]
    fn predictions_are_pixel_intensities() {
        let model = config(true, 6).init::<B>(&Default::default());
        let values: Vec<f32> = model.predict(frames(1, 3)).to_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn validate_rejects_bad_configs() {
        assert!(config(false, 6).validate().is_ok());

        let odd_physics = ModelConfig {
            z_dim_encoder: 5,
            ..config(true, 6)
        };
        assert!(odd_physics.validate().is_err());

        let bad_size = ModelConfig {
            height: 30,
            ..config(false, 6)
        };
        assert!(bad_size.validate().is_err());
    }

    #[test]
    fn loss_is_reconstruction_plus_weighted_kl() {
        let device = Default::default();
        let prediction = Tensor::<B, 4>::zeros([2, 1, 2, 2], &device);
        let target = Tensor::<B, 4>::ones([2, 1, 2, 2], &device);
        let latent = LatentParams {
            mu: Tensor::from_data(TensorData::new(vec![1.0f32, 1.0], [2, 1]), &device),
            logvar: Tensor::zeros([2, 1], &device),
            z: Tensor::zeros([2, 1], &device),
        };

        // per-sample squared error 4, / (2 * 0.5) = 4; KL = 0.5
        let weights = LossWeights {
            beta: 2.0,
            gamma: 0.0,
            capacity: 0.0,
            target_var: 0.5,
        };
        let loss = vae_loss(prediction.clone(), target.clone(), &latent, &weights).unwrap();
        assert!((loss.reconstruction.into_scalar() - 4.0).abs() < 1e-5);
        assert!((loss.total.into_scalar() - 5.0).abs() < 1e-5);

        let with_capacity = LossWeights {
            gamma: 10.0,
            capacity: 0.25,
            ..weights
        };
        let loss = vae_loss(prediction, target, &latent, &with_capacity).unwrap();
        assert!((loss.total.into_scalar() - 7.5).abs() < 1e-5);
    }

    #[test]
    fn gradients_reach_the_encoder() {
        type AB = Autodiff<B>;
        let device = Default::default();
        let model = config(false, 6).init::<AB>(&device);
        let x = Tensor::<AB, 4>::random([2, 3, 16, 16], Distribution::Uniform(0.0, 1.0), &device);
        let y = Tensor::<AB, 4>::zeros([2, 2, 16, 16], &device);

        let (pred, latent) = model.forward(x);
        let weights = LossWeights {
            beta: 1.0,
            gamma: 0.0,
            capacity: 0.0,
            target_var: 1.0,
        };
        let loss = vae_loss(pred, y, &latent, &weights).unwrap();
        let grads = loss.total.backward();
        assert!(model.encoder.mu.weight.grad(&grads).is_some());
    }

    #[test]
    fn save_then_load_restores_weights() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model1");
        let device = Default::default();
        let cfg = config(false, 4);
        let model = cfg.init::<B>(&device);
        save_model(&model, &cfg, &path).unwrap();

        let (loaded, loaded_cfg) = load_model::<B>(&path, &device).unwrap();
        assert_eq!(loaded_cfg, cfg);

        let x = frames(1, 3);
        let a: Vec<f32> = model.predict(x.clone()).to_data().to_vec().unwrap();
        let b: Vec<f32> = loaded.predict(x).to_data().to_vec().unwrap();
        for (p, q) in a.iter().zip(b.iter()) {
            // CompactRecorder stores half precision
            assert!((p - q).abs() < 1e-2);
        }
    }
}
