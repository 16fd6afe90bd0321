//! Toy regression data drawn from a Gaussian-process prior.

use anyhow::anyhow;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};

/// Simulated 1D regression problem: noisy GP-function observations on a
/// training interval and a noise-free grid extending beyond it.
pub struct RegressionData {
    pub x_train: DMatrix<f32>,
    pub y_train: DMatrix<f32>,
    pub x_test: DMatrix<f32>,
    pub y_test: DMatrix<f32>,
}

#[derive(Debug, Clone)]
pub struct GpToyConfig {
    pub n_train: usize,
    pub n_test: usize,
    /// Observation noise std added to the training targets.
    pub noise_std: f64,
    /// Squared-exponential kernel length scale.
    pub lengthscale: f64,
    /// Squared-exponential kernel amplitude.
    pub amplitude: f64,
}

impl Default for GpToyConfig {
    fn default() -> Self {
        Self {
            n_train: 200,
            n_test: 100,
            noise_std: 0.1,
            lengthscale: 0.3,
            amplitude: 1.0,
        }
    }
}

fn rbf_kernel(xs: &[f64], lengthscale: f64, amplitude: f64) -> DMatrix<f64> {
    let n = xs.len();
    let amp_sq = amplitude * amplitude;
    let inv_two_ell_sq = 0.5 / (lengthscale * lengthscale);
    DMatrix::from_fn(n, n, |i, j| {
        let d = xs[i] - xs[j];
        amp_sq * (-d * d * inv_two_ell_sq).exp()
    })
}

/// Draw one function from a zero-mean GP with squared-exponential
/// kernel, evaluated at `xs`.
pub fn sample_gp_function(
    xs: &[f64],
    lengthscale: f64,
    amplitude: f64,
    rng: &mut StdRng,
) -> anyhow::Result<Vec<f64>> {
    let n = xs.len();
    let jitter = 1e-6;
    let kernel = rbf_kernel(xs, lengthscale, amplitude) + DMatrix::identity(n, n) * jitter;

    let chol = kernel
        .cholesky()
        .ok_or_else(|| anyhow!("kernel matrix is not positive definite"))?;

    let std_normal = Normal::new(0.0, 1.0).expect("standard normal");
    let z = DVector::from_fn(n, |_, _| std_normal.sample(rng));
    let f = chol.l() * z;
    Ok(f.iter().copied().collect())
}

/// Simulate the GP-regression toy problem: training inputs uniform on
/// [-1, 1], test inputs on a grid over [-1.5, 1.5] so predictions are
/// also probed outside the data range.
pub fn gp_toy_regression(config: &GpToyConfig, seed: u64) -> anyhow::Result<RegressionData> {
    let mut rng = StdRng::seed_from_u64(seed);

    let unif = Uniform::new(-1.0f64, 1.0).expect("unif [-1, 1)");
    let mut x_train: Vec<f64> = (0..config.n_train).map(|_| unif.sample(&mut rng)).collect();
    x_train.sort_by(|a, b| a.total_cmp(b));

    let lo = -1.5f64;
    let hi = 1.5f64;
    let step = (hi - lo) / (config.n_test.max(2) - 1) as f64;
    let x_test: Vec<f64> = (0..config.n_test).map(|i| lo + step * i as f64).collect();

    // one joint draw so train and test lie on the same function
    let mut xs = x_train.clone();
    xs.extend_from_slice(&x_test);
    let f = sample_gp_function(&xs, config.lengthscale, config.amplitude, &mut rng)?;

    let noise = Normal::new(0.0, config.noise_std).expect("noise distribution");
    let y_train: Vec<f64> = f[..config.n_train]
        .iter()
        .map(|fi| fi + noise.sample(&mut rng))
        .collect();
    let y_test: Vec<f64> = f[config.n_train..].to_vec();

    Ok(RegressionData {
        x_train: column_matrix(&x_train),
        y_train: column_matrix(&y_train),
        x_test: column_matrix(&x_test),
        y_test: column_matrix(&y_test),
    })
}

fn column_matrix(values: &[f64]) -> DMatrix<f32> {
    DMatrix::from_iterator(values.len(), 1, values.iter().map(|&v| v as f32))
}
