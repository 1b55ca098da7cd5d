//! Leaky rectified recurrent network
//!
//! `x_t = (1 - a) x_{t-1} + a (Wrec r_{t-1} + Win u_t + brec + q_t)`, `r = max(x, 0)`,
//! `z = f_out(Wout r + bout)`.

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use rnnpg_core::rng::seeded;
use rnnpg_core::{Backprop, ForwardTrace, Network, NetworkConfig, Params, Regularization, Result};

use super::{
    assign1, assign2, check_config, check_sequence_shapes, init_input, init_output,
    init_recurrent, rate_penalty, readout, readout_backward, relu, relu_grad, retain_trainable,
    trainable_names, unknown_params, wrec_penalty, X0_INIT,
};

const PARAM_NAMES: [&str; 6] = ["Win", "brec", "Wrec", "Wout", "bout", "x0"];

/// Norms below this are skipped by the vanishing-gradient regularizer
const OMEGA_MIN_NORM: f64 = 1e-12;

#[derive(Debug, Clone)]
struct SimpleParams {
    win: Array2<f64>,
    brec: Array1<f64>,
    wrec: Array2<f64>,
    wout: Array2<f64>,
    bout: Array1<f64>,
    x0: Array1<f64>,
}

/// Leaky rectified recurrent network
#[derive(Debug, Clone)]
pub struct SimpleNetwork {
    config: NetworkConfig,
    params: SimpleParams,
    trainables: Vec<String>,
}

impl SimpleNetwork {
    /// Initialize from a configuration
    pub fn new(config: NetworkConfig) -> Result<Self> {
        check_config(&config)?;
        let mut rng = seeded(config.seed);
        let n = config.n_hidden;

        let win = init_input(&mut rng, n, config.n_in, config.win, config.win_mask.as_deref());
        let wrec = init_recurrent(&mut rng, n, config.p0, config.rho);
        let wout = init_output(&mut rng, config.n_out, n);

        let params = SimpleParams {
            win,
            brec: Array1::zeros(n),
            wrec,
            wout,
            bout: Array1::zeros(config.n_out),
            x0: Array1::from_elem(n, X0_INIT),
        };
        let trainables = trainable_names(&PARAM_NAMES, &config.fix);

        Ok(Self {
            config,
            params,
            trainables,
        })
    }

    fn advance(&self, u: ArrayView2<f64>, q: ArrayView2<f64>, x_prev: ArrayView2<f64>) -> Array2<f64> {
        let p = &self.params;
        let a = self.config.alpha;
        let r_prev = relu(&x_prev);
        let pre = r_prev.dot(&p.wrec.t()) + u.dot(&p.win.t()) + &p.brec + q;
        x_prev.to_owned() * (1.0 - a) + pre * a
    }

    /// Vanishing-gradient regularizer value and its gradient at `wrec`
    ///
    /// The state gradients are held fixed; only the Jacobian `dx_t / dx_{t-1}` depends
    /// on `wrec`.
    #[allow(clippy::cast_precision_loss)]
    fn omega(
        &self,
        wrec: &Array2<f64>,
        trace: &ForwardTrace,
        state_grads: ArrayView3<f64>,
        mask: ArrayView2<f64>,
    ) -> (f64, Array2<f64>) {
        let a = self.config.alpha;
        let n = self.config.n_hidden;
        let mut value = 0.0;
        let mut grad = Array2::zeros((n, n));
        let mut count = 0usize;

        for k in 0..trace.steps() {
            let fp = relu_grad(&trace.previous_state(k));
            let deltas = state_grads.index_axis(Axis(0), k);
            for trial in 0..trace.batch_size() {
                if mask[[k + 1, trial]] == 0.0 {
                    continue;
                }
                let delta = deltas.row(trial);
                let norm_d = delta.dot(&delta).sqrt();
                if norm_d < OMEGA_MIN_NORM {
                    continue;
                }
                let fp_n = fp.row(trial);
                let v = &delta * (1.0 - a) + &(wrec.t().dot(&delta) * a) * &fp_n;
                let norm_v = v.dot(&v).sqrt();
                if norm_v < OMEGA_MIN_NORM {
                    continue;
                }

                count += 1;
                let ratio = norm_v / norm_d - 1.0;
                value += ratio * ratio;
                let coeff = 2.0 * ratio / norm_d * a / norm_v;
                let right = &v * &fp_n;
                let outer = delta
                    .insert_axis(Axis(1))
                    .dot(&right.view().insert_axis(Axis(0)));
                grad.scaled_add(coeff, &outer);
            }
        }

        if count == 0 {
            return (0.0, grad);
        }
        let scale = self.config.lambda_omega / count as f64;
        (value * scale, grad * scale)
    }
}

impl Network for SimpleNetwork {
    fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn initial_state(&self) -> Array1<f64> {
        self.params.x0.clone()
    }

    fn step_t(
        &self,
        input: ArrayView1<f64>,
        noise: ArrayView1<f64>,
        state: ArrayView1<f64>,
    ) -> (Array1<f64>, Array1<f64>) {
        let x = self.advance(
            input.insert_axis(Axis(0)),
            noise.insert_axis(Axis(0)),
            state.insert_axis(Axis(0)),
        );
        let z = self.get_outputs_0(x.view());
        (z.index_axis_move(Axis(0), 0), x.index_axis_move(Axis(0), 0))
    }

    fn firing_rate(&self, state: ArrayView1<f64>) -> Array1<f64> {
        relu(&state)
    }

    fn get_outputs_0(&self, x0: ArrayView2<f64>) -> Array2<f64> {
        readout(
            self.config.f_out,
            &self.params.wout,
            &self.params.bout,
            relu(&x0).view(),
        )
    }

    fn get_outputs(
        &self,
        inputs: ArrayView3<f64>,
        noise: ArrayView3<f64>,
        x0: ArrayView2<f64>,
    ) -> Result<ForwardTrace> {
        check_sequence_shapes(&self.config, &inputs, &noise, &x0)?;
        let (steps, n, _) = inputs.dim();
        let nh = self.config.n_hidden;

        let mut states = Array3::zeros((steps, n, nh));
        let mut rates = Array3::zeros((steps, n, nh));
        let mut outputs = Array3::zeros((steps, n, self.config.n_out));

        let mut x = x0.to_owned();
        for k in 0..steps {
            x = self.advance(
                inputs.index_axis(Axis(0), k),
                noise.index_axis(Axis(0), k),
                x.view(),
            );
            let r = relu(&x);
            let z = readout(self.config.f_out, &self.params.wout, &self.params.bout, r.view());
            states.index_axis_mut(Axis(0), k).assign(&x);
            rates.index_axis_mut(Axis(0), k).assign(&r);
            outputs.index_axis_mut(Axis(0), k).assign(&z);
        }

        Ok(ForwardTrace {
            inputs: inputs.to_owned(),
            x0: x0.to_owned(),
            z0: self.get_outputs_0(x0),
            states,
            rates,
            outputs,
            aux: Vec::new(),
        })
    }

    fn get_regs(&self, trace: &ForwardTrace, mask: ArrayView2<f64>) -> Regularization {
        let (mut value, d_rates) = rate_penalty(&trace.rates, mask, self.config.l2_r);
        let mut d_params = Params::new();

        if self.config.l1_wrec != 0.0 || self.config.l2_wrec != 0.0 {
            let (penalty, grad) =
                wrec_penalty(&self.params.wrec, self.config.l1_wrec, self.config.l2_wrec);
            value += penalty;
            if self.trainables.iter().any(|name| name == "Wrec") {
                d_params.insert("Wrec".to_string(), grad.into_dyn());
            }
        }

        Regularization {
            value,
            d_rates,
            d_params,
        }
    }

    fn backward(
        &self,
        trace: &ForwardTrace,
        d_out0: ArrayView2<f64>,
        d_out: ArrayView3<f64>,
        d_rates: Option<ArrayView3<f64>>,
    ) -> Backprop {
        let p = &self.params;
        let a = self.config.alpha;
        let f_out = self.config.f_out;
        let steps = trace.steps();
        let n = trace.batch_size();

        let mut g_win = Array2::zeros(p.win.raw_dim());
        let mut g_brec = Array1::zeros(p.brec.raw_dim());
        let mut g_wrec = Array2::zeros(p.wrec.raw_dim());
        let mut g_wout = Array2::zeros(p.wout.raw_dim());
        let mut g_bout = Array1::zeros(p.bout.raw_dim());
        let mut state_grads = Array3::zeros((steps, n, self.config.n_hidden));

        let mut carry = Array2::<f64>::zeros((n, self.config.n_hidden));
        for k in (0..steps).rev() {
            let x = trace.states.index_axis(Axis(0), k);
            let r = trace.rates.index_axis(Axis(0), k);
            let dzpre = readout_backward(
                f_out,
                trace.outputs.index_axis(Axis(0), k),
                d_out.index_axis(Axis(0), k),
            );
            g_wout += &dzpre.t().dot(&r);
            g_bout += &dzpre.sum_axis(Axis(0));

            let mut dr = dzpre.dot(&p.wout);
            if let Some(d_rates) = &d_rates {
                dr += &d_rates.index_axis(Axis(0), k);
            }
            let dx = carry + dr * relu_grad(&x);
            state_grads.index_axis_mut(Axis(0), k).assign(&dx);

            let x_prev = trace.previous_state(k);
            let d_pre = &dx * a;
            g_wrec += &d_pre.t().dot(&relu(&x_prev));
            g_win += &d_pre.t().dot(&trace.inputs.index_axis(Axis(0), k));
            g_brec += &d_pre.sum_axis(Axis(0));

            carry = dx * (1.0 - a) + d_pre.dot(&p.wrec) * relu_grad(&x_prev);
        }

        let dzpre0 = readout_backward(f_out, trace.z0.view(), d_out0);
        g_wout += &dzpre0.t().dot(&relu(&trace.x0));
        g_bout += &dzpre0.sum_axis(Axis(0));
        let d_x0 = carry + dzpre0.dot(&p.wout) * relu_grad(&trace.x0);

        let grads = retain_trainable(
            vec![
                ("Win", g_win.into_dyn()),
                ("brec", g_brec.into_dyn()),
                ("Wrec", g_wrec.into_dyn()),
                ("Wout", g_wout.into_dyn()),
                ("bout", g_bout.into_dyn()),
            ],
            &self.trainables,
        );

        Backprop {
            grads,
            d_x0,
            state_grads,
        }
    }

    fn d_omega_d_wrec(
        &self,
        trace: &ForwardTrace,
        state_grads: ArrayView3<f64>,
        mask: ArrayView2<f64>,
    ) -> Option<Array2<f64>> {
        if self.config.lambda_omega == 0.0 || !self.trainables.iter().any(|name| name == "Wrec") {
            return None;
        }
        Some(self.omega(&self.params.wrec, trace, state_grads, mask).1)
    }

    fn get_values(&self) -> Params {
        let p = &self.params;
        Params::from([
            ("Win".to_string(), p.win.clone().into_dyn()),
            ("brec".to_string(), p.brec.clone().into_dyn()),
            ("Wrec".to_string(), p.wrec.clone().into_dyn()),
            ("Wout".to_string(), p.wout.clone().into_dyn()),
            ("bout".to_string(), p.bout.clone().into_dyn()),
            ("x0".to_string(), p.x0.clone().into_dyn()),
        ])
    }

    fn set_values(&mut self, values: &Params) -> Result<()> {
        unknown_params(values, &PARAM_NAMES)?;
        let mut next = self.params.clone();
        assign2(values, "Win", &mut next.win)?;
        assign1(values, "brec", &mut next.brec)?;
        assign2(values, "Wrec", &mut next.wrec)?;
        assign2(values, "Wout", &mut next.wout)?;
        assign1(values, "bout", &mut next.bout)?;
        assign1(values, "x0", &mut next.x0)?;
        self.params = next;
        Ok(())
    }

    fn trainables(&self) -> Vec<String> {
        self.trainables.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::testing::{check_gradients, config, Probe};
    use ndarray::s;
    use rnnpg_core::{NetworkType, OutputActivation};

    fn network(f_out: OutputActivation) -> SimpleNetwork {
        let mut net = SimpleNetwork::new(config(NetworkType::Simple, 3, 5, 3, f_out)).unwrap();
        // Larger readout weights so every path carries gradient
        let wout = net.params.wout.mapv(|v| v * 20.0);
        net.params.wout = wout;
        net.params.brec = Array1::linspace(-0.2, 0.3, 5);
        net
    }

    #[test]
    fn test_gradients_softmax() {
        let mut net = network(OutputActivation::Softmax);
        let probe = Probe::new(net.config(), 4, 3, 21);
        check_gradients(&mut net, &probe);
    }

    #[test]
    fn test_gradients_linear() {
        let mut net = network(OutputActivation::Linear);
        let probe = Probe::new(net.config(), 5, 2, 22);
        check_gradients(&mut net, &probe);
    }

    #[test]
    fn test_step_matches_batched_forward() {
        let net = network(OutputActivation::Softmax);
        let probe = Probe::new(net.config(), 3, 2, 4);
        let trace = net
            .get_outputs(probe.inputs.view(), probe.noise.view(), probe.x0.view())
            .unwrap();

        let mut x = probe.x0.row(1).to_owned();
        for k in 0..3 {
            let (z, next) = net.step_t(
                probe.inputs.slice(s![k, 1, ..]),
                probe.noise.slice(s![k, 1, ..]),
                x.view(),
            );
            for (a, b) in z.iter().zip(trace.outputs.slice(s![k, 1, ..])) {
                approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
            }
            x = next;
        }
    }

    #[test]
    fn test_fixed_parameters_get_no_gradient() {
        let mut cfg = config(NetworkType::Simple, 3, 5, 3, OutputActivation::Softmax);
        cfg.fix = vec!["Win".to_string(), "x0".to_string()];
        let net = SimpleNetwork::new(cfg).unwrap();
        let probe = Probe::new(net.config(), 2, 2, 9);
        let trace = net
            .get_outputs(probe.inputs.view(), probe.noise.view(), probe.x0.view())
            .unwrap();
        let back = net.backward(&trace, probe.c_out0.view(), probe.c_out.view(), None);

        assert!(!back.grads.contains_key("Win"));
        assert!(back.grads.contains_key("Wrec"));
        assert!(!net.trainables().contains(&"x0".to_string()));
    }

    #[test]
    fn test_omega_gradient_matches_finite_difference() {
        let net = network(OutputActivation::Softmax);
        let probe = Probe::new(net.config(), 4, 2, 13);
        let trace = net
            .get_outputs(probe.inputs.view(), probe.noise.view(), probe.x0.view())
            .unwrap();
        let back = net.backward(&trace, probe.c_out0.view(), probe.c_out.view(), None);
        let mask = ndarray::Array2::from_elem((5, 2), 1.0);

        let wrec = net.params.wrec.clone();
        let (_, grad) = net.omega(&wrec, &trace, back.state_grads.view(), mask.view());
        let eps = 1e-6;
        for (i, j) in [(0, 0), (1, 3), (4, 2)] {
            let mut plus = wrec.clone();
            plus[[i, j]] += eps;
            let mut minus = wrec.clone();
            minus[[i, j]] -= eps;
            let vp = net.omega(&plus, &trace, back.state_grads.view(), mask.view()).0;
            let vm = net.omega(&minus, &trace, back.state_grads.view(), mask.view()).0;
            let numeric = (vp - vm) / (2.0 * eps);
            approx::assert_abs_diff_eq!(grad[[i, j]], numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_set_values_rejects_bad_shapes() {
        let mut net = network(OutputActivation::Softmax);
        let bad = Params::from([("Wrec".to_string(), Array2::<f64>::zeros((2, 2)).into_dyn())]);
        assert!(net.set_values(&bad).is_err());

        let unknown = Params::from([("Wfoo".to_string(), Array1::<f64>::zeros(2).into_dyn())]);
        assert!(net.set_values(&unknown).is_err());
    }
}
