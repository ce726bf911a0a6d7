//! Gaussian latent helpers shared by the model and the solver.

use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};

use crate::error::{Error, Result};

/// Parameters of the approximate posterior produced by the encoder.
#[derive(Debug, Clone)]
pub struct LatentParams<B: Backend> {
    pub mu: Tensor<B, 2>,
    pub logvar: Tensor<B, 2>,
    /// Sample drawn from `N(mu, exp(logvar))`.
    pub z: Tensor<B, 2>,
}

pub fn reparametrize<B: Backend>(mu: Tensor<B, 2>, logvar: Tensor<B, 2>) -> Tensor<B, 2> {
    let std = (logvar * 0.5).exp();
    let eps = Tensor::random_like(&std, Distribution::Normal(0.0, 1.0));
    mu + eps * std
}

#[derive(Debug, Clone)]
pub struct KlDivergence<B: Backend> {
    /// Sum over latent dimensions, averaged over the batch. Shape `[1]`.
    pub total: Tensor<B, 1>,
    /// Batch mean per latent dimension. Shape `[D]`.
    pub dimension_wise: Tensor<B, 1>,
    /// Mean over dimensions and batch. Shape `[1]`.
    pub mean: Tensor<B, 1>,
}

/// KL divergence of `N(mu, exp(logvar))` from the standard normal prior.
pub fn kl_divergence<B: Backend>(
    mu: Tensor<B, 2>,
    logvar: Tensor<B, 2>,
) -> Result<KlDivergence<B>> {
    let [batch_size, dims] = mu.dims();
    if batch_size == 0 {
        return Err(Error::InvalidConfig(
            "KL divergence of an empty batch".into(),
        ));
    }

    let klds = (logvar.clone().add_scalar(1.0) - mu.powf_scalar(2.0) - logvar.exp()) * -0.5;

    let total = klds.clone().sum_dim(1).mean();
    let dimension_wise = klds.clone().mean_dim(0).reshape([dims]);
    let mean = klds.mean();

    Ok(KlDivergence {
        total,
        dimension_wise,
        mean,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type B = NdArray<f32>;

    fn tensor(values: Vec<f32>, shape: [usize; 2]) -> Tensor<B, 2> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn scalar(t: Tensor<B, 1>) -> f32 {
        t.into_scalar()
    }

    #[test]
    fn kl_vanishes_at_prior() {
        let kl = kl_divergence(tensor(vec![0.0; 6], [2, 3]), tensor(vec![0.0; 6], [2, 3])).unwrap();
        assert!(scalar(kl.total).abs() < 1e-6);
        assert!(scalar(kl.mean).abs() < 1e-6);
    }

    #[test]
    fn kl_matches_closed_form() {
        // mu = 1, logvar = 0 gives 0.5 per dimension.
        let mu = tensor(vec![1.0, 1.0, 0.0, 0.0], [2, 2]);
        let logvar = tensor(vec![0.0; 4], [2, 2]);
        let kl = kl_divergence(mu, logvar).unwrap();

        // sample 0 sums to 1.0, sample 1 to 0.0
        assert!((scalar(kl.total) - 0.5).abs() < 1e-6);
        assert!((scalar(kl.mean) - 0.25).abs() < 1e-6);

        let per_dim: Vec<f32> = kl.dimension_wise.to_data().to_vec().unwrap();
        assert_eq!(per_dim.len(), 2);
        for v in per_dim {
            assert!((v - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn reparametrize_with_tiny_variance_returns_mean() {
        let mu = tensor(vec![0.5, -2.0, 3.0], [1, 3]);
        let logvar = tensor(vec![-40.0; 3], [1, 3]);
        let z: Vec<f32> = reparametrize(mu, logvar).to_data().to_vec().unwrap();
        assert!((z[0] - 0.5).abs() < 1e-4);
        assert!((z[1] + 2.0).abs() < 1e-4);
        assert!((z[2] - 3.0).abs() < 1e-4);
    }

    #[test]
    fn kl_of_empty_batch_errors() {
        let empty = tensor(Vec::new(), [0, 3]);
        assert!(matches!(
            kl_divergence(empty.clone(), empty),
            Err(Error::InvalidConfig(_))
        ));
    }
}
