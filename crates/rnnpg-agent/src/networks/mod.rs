//! Concrete recurrent networks
//!
//! Both architectures are pure ndarray: the forward pass records what the backward
//! pass needs in a [`ForwardTrace`], and [`Network::backward`] runs exact
//! back-propagation through time from output and firing-rate gradients.

pub mod gru;
pub mod simple;

use ndarray::{
    Array, Array1, Array2, Array3, ArrayBase, ArrayD, ArrayView2, Axis, Data, Dimension, Ix1, Ix2,
    Zip,
};
use rand::Rng;
use rand_distr::StandardNormal;
use rnnpg_core::{
    Network, NetworkConfig, NetworkType, OutputActivation, Params, PgError, Result, TrainRng,
};

pub use gru::GruNetwork;
pub use simple::SimpleNetwork;

/// Initial value of every unit of the learned initial state
pub const X0_INIT: f64 = 0.1;

/// Matrix squarings used by the spectral radius estimate (power `2^8`)
const SPECTRAL_SQUARINGS: usize = 8;

/// Build a network from its configuration, optionally overriding parameters
pub fn build(config: NetworkConfig, params: Option<&Params>) -> Result<Box<dyn Network>> {
    let mut net: Box<dyn Network> = match config.network_type {
        NetworkType::Simple => Box::new(SimpleNetwork::new(config)?),
        NetworkType::Gru => Box::new(GruNetwork::new(config)?),
    };
    if let Some(params) = params {
        net.set_values(params)?;
    }
    Ok(net)
}

pub(crate) fn check_config(config: &NetworkConfig) -> Result<()> {
    if config.n_hidden == 0 || config.n_out == 0 {
        return Err(PgError::Network(
            "networks need at least one hidden unit and one output".to_string(),
        ));
    }
    if let Some(mask) = &config.win_mask {
        if mask.len() != config.n_in {
            return Err(PgError::DimensionMismatch {
                expected: config.n_in,
                actual: mask.len(),
            });
        }
    }
    Ok(())
}

pub(crate) fn relu<S, D>(x: &ArrayBase<S, D>) -> Array<f64, D>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    x.mapv(|v| v.max(0.0))
}

pub(crate) fn relu_grad<S, D>(x: &ArrayBase<S, D>) -> Array<f64, D>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    x.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })
}

pub(crate) fn sigmoid<S: Data<Elem = f64>>(x: &ArrayBase<S, ndarray::Ix2>) -> Array2<f64> {
    x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// Apply the readout `f_out(r Wout^T + bout)` to a batch of rates
pub(crate) fn readout(
    f_out: OutputActivation,
    wout: &Array2<f64>,
    bout: &Array1<f64>,
    rates: ArrayView2<f64>,
) -> Array2<f64> {
    let mut z = rates.dot(&wout.t()) + bout;
    if f_out == OutputActivation::Softmax {
        for mut row in z.rows_mut() {
            let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row /= sum;
        }
    }
    z
}

/// Gradient with respect to the readout pre-activation
pub(crate) fn readout_backward(
    f_out: OutputActivation,
    z: ArrayView2<f64>,
    dz: ArrayView2<f64>,
) -> Array2<f64> {
    match f_out {
        OutputActivation::Linear => dz.to_owned(),
        OutputActivation::Softmax => {
            let inner = (&dz * &z).sum_axis(Axis(1)).insert_axis(Axis(1));
            &z * &(&dz - &inner)
        }
    }
}

fn gaussian(rng: &mut TrainRng, shape: (usize, usize)) -> Array2<f64> {
    Array2::from_shape_simple_fn(shape, || rng.sample::<f64, _>(StandardNormal))
}

/// Sparse gaussian recurrent weights rescaled to spectral radius `rho`
pub(crate) fn init_recurrent(rng: &mut TrainRng, n: usize, p0: f64, rho: f64) -> Array2<f64> {
    let mut w = gaussian(rng, (n, n));
    let keep = Array2::from_shape_simple_fn((n, n), || rng.gen::<f64>() < p0);
    Zip::from(&mut w).and(&keep).for_each(|v, &k| {
        if !k {
            *v = 0.0;
        }
    });

    let radius = spectral_radius(&w);
    if radius > 0.0 && radius.is_finite() {
        w *= rho / radius;
    }
    w
}

/// Spectral radius estimate from Gelfand's formula `||W^k||^(1/k)`
///
/// Repeated squaring is kept normalized and the scale is tracked in log space.
pub(crate) fn spectral_radius(w: &Array2<f64>) -> f64 {
    let norm = frobenius(w);
    if norm == 0.0 {
        return 0.0;
    }

    let mut power = w / norm;
    let mut log_scale = norm.ln();
    let mut exponent = 1.0;
    for _ in 0..SPECTRAL_SQUARINGS {
        power = power.dot(&power);
        let n = frobenius(&power);
        if n == 0.0 {
            return 0.0;
        }
        power /= n;
        log_scale = 2.0 * log_scale + n.ln();
        exponent *= 2.0;
    }
    (log_scale / exponent).exp()
}

fn frobenius(w: &Array2<f64>) -> f64 {
    w.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Gaussian input weights `[n, n_in]` scaled by `scale / sqrt(n_in)` and masked per channel
#[allow(clippy::cast_precision_loss)]
pub(crate) fn init_input(
    rng: &mut TrainRng,
    n: usize,
    n_in: usize,
    scale: f64,
    mask: Option<&[f64]>,
) -> Array2<f64> {
    let mut w = gaussian(rng, (n, n_in)) * (scale / (n_in.max(1) as f64).sqrt());
    if let Some(mask) = mask {
        for (mut column, &m) in w.columns_mut().into_iter().zip(mask) {
            column *= m;
        }
    }
    w
}

/// Small gaussian readout weights
#[allow(clippy::cast_precision_loss)]
pub(crate) fn init_output(rng: &mut TrainRng, n_out: usize, n: usize) -> Array2<f64> {
    gaussian(rng, (n_out, n)) * (0.1 / (n as f64).sqrt())
}

/// L2 penalty on masked firing rates, normalized by valid steps times units
#[allow(clippy::cast_precision_loss)]
pub(crate) fn rate_penalty(
    rates: &Array3<f64>,
    mask: ArrayView2<f64>,
    l2_r: f64,
) -> (f64, Option<Array3<f64>>) {
    let steps = rates.shape()[0];
    if l2_r == 0.0 || steps == 0 {
        return (0.0, None);
    }

    let m = mask.slice(ndarray::s![1..=steps, ..]);
    let denom = m.sum() * rates.shape()[2] as f64;
    if denom == 0.0 {
        return (0.0, None);
    }

    let m3 = m.insert_axis(Axis(2));
    let value = l2_r * (rates * rates * &m3).sum() / denom;
    let grad = rates * &m3 * (2.0 * l2_r / denom);
    (value, Some(grad))
}

/// L1 and L2 penalties on `Wrec`, averaged over entries
#[allow(clippy::cast_precision_loss)]
pub(crate) fn wrec_penalty(wrec: &Array2<f64>, l1: f64, l2: f64) -> (f64, Array2<f64>) {
    let count = wrec.len().max(1) as f64;
    let value = l1 * wrec.mapv(f64::abs).sum() / count + l2 * wrec.mapv(|v| v * v).sum() / count;
    let grad = wrec.mapv(|v| {
        let sign = if v == 0.0 { 0.0 } else { v.signum() };
        (l1 * sign + 2.0 * l2 * v) / count
    });
    (value, grad)
}

/// Names of parameters not excluded by `fix`
pub(crate) fn trainable_names(names: &[&str], fix: &[String]) -> Vec<String> {
    names
        .iter()
        .filter(|name| !fix.iter().any(|f| f == *name))
        .map(|name| (*name).to_string())
        .collect()
}

pub(crate) fn unknown_params(values: &Params, names: &[&str]) -> Result<()> {
    match values.keys().find(|key| !names.contains(&key.as_str())) {
        Some(key) => Err(PgError::Network(format!("unknown parameter {key}"))),
        None => Ok(()),
    }
}

/// Overwrite a matrix parameter from `values` when present
pub(crate) fn assign2(values: &Params, name: &str, target: &mut Array2<f64>) -> Result<()> {
    if let Some(value) = values.get(name) {
        let value = value.clone().into_dimensionality::<Ix2>()?;
        if value.dim() != target.dim() {
            return Err(PgError::Network(format!(
                "parameter {name} has shape {:?}, expected {:?}",
                value.dim(),
                target.dim()
            )));
        }
        *target = value;
    }
    Ok(())
}

/// Overwrite a vector parameter from `values` when present
pub(crate) fn assign1(values: &Params, name: &str, target: &mut Array1<f64>) -> Result<()> {
    if let Some(value) = values.get(name) {
        let value = value.clone().into_dimensionality::<Ix1>()?;
        if value.len() != target.len() {
            return Err(PgError::DimensionMismatch {
                expected: target.len(),
                actual: value.len(),
            });
        }
        *target = value;
    }
    Ok(())
}

/// Keep only gradients of trainable parameters
pub(crate) fn retain_trainable(grads: Vec<(&str, ArrayD<f64>)>, trainables: &[String]) -> Params {
    grads
        .into_iter()
        .filter(|(name, _)| trainables.iter().any(|t| t == name))
        .map(|(name, grad)| (name.to_string(), grad))
        .collect()
}

/// Check the batched input shapes against the configuration
pub(crate) fn check_sequence_shapes(
    config: &NetworkConfig,
    inputs: &ndarray::ArrayView3<f64>,
    noise: &ndarray::ArrayView3<f64>,
    x0: &ArrayView2<f64>,
) -> Result<()> {
    let (steps, n, n_in) = inputs.dim();
    if n_in != config.n_in {
        return Err(PgError::DimensionMismatch {
            expected: config.n_in,
            actual: n_in,
        });
    }
    if x0.dim() != (n, config.n_hidden) {
        return Err(PgError::Network(format!(
            "initial states have shape {:?}, expected ({n}, {})",
            x0.dim(),
            config.n_hidden
        )));
    }
    if noise.dim() != (steps, n, config.n_hidden) {
        return Err(PgError::Network(format!(
            "noise has shape {:?}, expected ({steps}, {n}, {})",
            noise.dim(),
            config.n_hidden
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Finite-difference helpers shared by the network tests

    use super::*;
    use ndarray::Array3;
    use rand::SeedableRng;

    pub fn config(
        network_type: NetworkType,
        n_in: usize,
        n_hidden: usize,
        n_out: usize,
        f_out: OutputActivation,
    ) -> NetworkConfig {
        NetworkConfig {
            network_type,
            n_in,
            n_hidden,
            n_out,
            f_out,
            fix: Vec::new(),
            l2_r: 0.0,
            l1_wrec: 0.0,
            l2_wrec: 0.0,
            lambda_omega: 2.0,
            alpha: 0.2,
            p0: 0.5,
            rho: 1.5,
            win: 1.0,
            win_mask: None,
            seed: 3,
        }
    }

    pub struct Probe {
        pub inputs: Array3<f64>,
        pub noise: Array3<f64>,
        pub x0: Array2<f64>,
        pub c_out0: Array2<f64>,
        pub c_out: Array3<f64>,
        pub c_rates: Array3<f64>,
    }

    impl Probe {
        pub fn new(config: &NetworkConfig, steps: usize, n: usize, seed: u64) -> Self {
            let mut rng = TrainRng::seed_from_u64(seed);
            let mut g3 = |shape: (usize, usize, usize)| {
                Array3::from_shape_simple_fn(shape, || rng.sample::<f64, _>(StandardNormal))
            };
            let inputs = g3((steps, n, config.n_in));
            let noise = g3((steps, n, config.n_hidden)) * 0.1;
            let c_out = g3((steps, n, config.n_out));
            let c_rates = g3((steps, n, config.n_hidden)) * 0.1;
            let c_out0 = g3((1, n, config.n_out)).index_axis_move(Axis(0), 0);
            let x0 = g3((1, n, config.n_hidden)).index_axis_move(Axis(0), 0) * 0.5 + 0.2;
            Self {
                inputs,
                noise,
                x0,
                c_out0,
                c_out,
                c_rates,
            }
        }

        /// Linear functional of outputs and rates
        pub fn loss(&self, net: &dyn Network, x0: &Array2<f64>) -> f64 {
            let trace = net
                .get_outputs(self.inputs.view(), self.noise.view(), x0.view())
                .unwrap();
            (&trace.z0 * &self.c_out0).sum()
                + (&trace.outputs * &self.c_out).sum()
                + (&trace.rates * &self.c_rates).sum()
        }
    }

    /// Compare analytic gradients of every parameter with central differences
    pub fn check_gradients(net: &mut dyn Network, probe: &Probe) {
        let eps = 1e-6;
        let trace = net
            .get_outputs(probe.inputs.view(), probe.noise.view(), probe.x0.view())
            .unwrap();
        let back = net.backward(
            &trace,
            probe.c_out0.view(),
            probe.c_out.view(),
            Some(probe.c_rates.view()),
        );

        let values = net.get_values();
        for name in net.trainables() {
            if name == "x0" {
                continue;
            }
            let grad = &back.grads[&name];
            let base = values[&name].clone();
            let stride = (base.len() / 7).max(1);
            for idx in (0..base.len()).step_by(stride) {
                let mut plus = base.clone();
                plus.as_slice_mut().unwrap()[idx] += eps;
                let mut minus = base.clone();
                minus.as_slice_mut().unwrap()[idx] -= eps;

                net.set_values(&Params::from([(name.clone(), plus)])).unwrap();
                let lp = probe.loss(net, &probe.x0);
                net.set_values(&Params::from([(name.clone(), minus)])).unwrap();
                let lm = probe.loss(net, &probe.x0);
                net.set_values(&Params::from([(name.clone(), base.clone())])).unwrap();

                let numeric = (lp - lm) / (2.0 * eps);
                let analytic = grad.as_slice().unwrap()[idx];
                assert!(
                    (numeric - analytic).abs() <= 1e-5 * (1.0 + numeric.abs()),
                    "{name}[{idx}]: numeric {numeric} vs analytic {analytic}"
                );
            }
        }

        for (i, j) in [(0, 0), (1, 2)] {
            let mut plus = probe.x0.clone();
            plus[[i, j]] += eps;
            let mut minus = probe.x0.clone();
            minus[[i, j]] -= eps;
            let numeric = (probe.loss(net, &plus) - probe.loss(net, &minus)) / (2.0 * eps);
            let analytic = back.d_x0[[i, j]];
            assert!(
                (numeric - analytic).abs() <= 1e-5 * (1.0 + numeric.abs()),
                "x0[{i},{j}]: numeric {numeric} vs analytic {analytic}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_spectral_radius_of_diagonal() {
        let w = array![[0.5, 0.0], [0.0, -2.0]];
        assert_relative_eq!(spectral_radius(&w), 2.0, max_relative = 1e-6);
    }

    #[test]
    fn test_recurrent_init_hits_target_radius() {
        let mut rng = TrainRng::seed_from_u64(5);
        let w = init_recurrent(&mut rng, 40, 0.3, 1.5);
        assert_relative_eq!(spectral_radius(&w), 1.5, max_relative = 1e-9);
        assert!(w.iter().filter(|&&v| v == 0.0).count() > 40 * 40 / 2);
    }

    #[test]
    fn test_softmax_readout_rows_sum_to_one() {
        let wout = array![[1.0, -1.0], [0.5, 2.0], [0.0, 0.0]];
        let bout = array![0.1, 0.0, -0.2];
        let z = readout(OutputActivation::Softmax, &wout, &bout, array![[1.0, 2.0], [0.0, 3.0]].view());
        for row in z.rows() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_input_mask_zeroes_channels() {
        let mut rng = TrainRng::seed_from_u64(1);
        let w = init_input(&mut rng, 6, 3, 1.0, Some(&[1.0, 0.0, 1.0]));
        assert!(w.column(1).iter().all(|&v| v == 0.0));
        assert!(w.column(0).iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_rate_penalty_ignores_invalid_steps() {
        let rates = Array3::from_elem((2, 1, 2), 1.0);
        let mask = array![[1.0], [1.0], [0.0]];
        let (value, grad) = rate_penalty(&rates, mask.view(), 0.5);
        assert_relative_eq!(value, 0.5);
        let grad = grad.unwrap();
        assert!(grad.slice(ndarray::s![1, .., ..]).iter().all(|&g| g == 0.0));
    }
}
