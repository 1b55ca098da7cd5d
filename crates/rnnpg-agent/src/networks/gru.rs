//! Leaky gated recurrent unit
//!
//! With update gate `l` and reset gate `g`:
//!
//! ```text
//! l   = sigmoid(Wrec_lambda r_{t-1} + Win_lambda u_t + b_lambda)
//! g   = sigmoid(Wrec_gamma r_{t-1} + Win_gamma u_t + b_gamma)
//! h   = Wrec (g * r_{t-1}) + Win u_t + brec + q_t
//! x_t = (1 - a l) x_{t-1} + a l h
//! ```
//!
//! Rates are rectified states and the readout is `f_out(Wout r + bout)`.

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use rnnpg_core::rng::seeded;
use rnnpg_core::{Backprop, ForwardTrace, Network, NetworkConfig, Params, Regularization, Result};

use super::{
    assign1, assign2, check_config, check_sequence_shapes, init_input, init_output,
    init_recurrent, rate_penalty, readout, readout_backward, relu, relu_grad, retain_trainable,
    sigmoid, trainable_names, unknown_params, wrec_penalty, X0_INIT,
};

const PARAM_NAMES: [&str; 12] = [
    "Wrec_lambda",
    "Wrec_gamma",
    "Win_lambda",
    "Win_gamma",
    "b_lambda",
    "b_gamma",
    "Wrec",
    "Win",
    "brec",
    "Wout",
    "bout",
    "x0",
];

// Positions of the gate tensors in `ForwardTrace::aux`
const AUX_LAMBDA: usize = 0;
const AUX_GAMMA: usize = 1;
const AUX_H: usize = 2;

#[derive(Debug, Clone)]
struct GruParams {
    wrec_lambda: Array2<f64>,
    wrec_gamma: Array2<f64>,
    win_lambda: Array2<f64>,
    win_gamma: Array2<f64>,
    b_lambda: Array1<f64>,
    b_gamma: Array1<f64>,
    wrec: Array2<f64>,
    win: Array2<f64>,
    brec: Array1<f64>,
    wout: Array2<f64>,
    bout: Array1<f64>,
    x0: Array1<f64>,
}

struct GruStep {
    lambda: Array2<f64>,
    gamma: Array2<f64>,
    h: Array2<f64>,
    x: Array2<f64>,
}

/// Leaky gated recurrent unit
#[derive(Debug, Clone)]
pub struct GruNetwork {
    config: NetworkConfig,
    params: GruParams,
    trainables: Vec<String>,
}

impl GruNetwork {
    /// Initialize from a configuration
    pub fn new(config: NetworkConfig) -> Result<Self> {
        check_config(&config)?;
        let mut rng = seeded(config.seed);
        let n = config.n_hidden;
        let mask = config.win_mask.as_deref();

        let wrec_lambda = init_recurrent(&mut rng, n, config.p0, config.rho);
        let wrec_gamma = init_recurrent(&mut rng, n, config.p0, config.rho);
        let win_lambda = init_input(&mut rng, n, config.n_in, config.win, mask);
        let win_gamma = init_input(&mut rng, n, config.n_in, config.win, mask);
        let wrec = init_recurrent(&mut rng, n, config.p0, config.rho);
        let win = init_input(&mut rng, n, config.n_in, config.win, mask);
        let wout = init_output(&mut rng, config.n_out, n);

        let params = GruParams {
            wrec_lambda,
            wrec_gamma,
            win_lambda,
            win_gamma,
            b_lambda: Array1::zeros(n),
            b_gamma: Array1::zeros(n),
            wrec,
            win,
            brec: Array1::zeros(n),
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

    fn advance(&self, u: ArrayView2<f64>, q: ArrayView2<f64>, x_prev: ArrayView2<f64>) -> GruStep {
        let p = &self.params;
        let a = self.config.alpha;
        let r_prev = relu(&x_prev);

        let lambda =
            sigmoid(&(r_prev.dot(&p.wrec_lambda.t()) + u.dot(&p.win_lambda.t()) + &p.b_lambda));
        let gamma =
            sigmoid(&(r_prev.dot(&p.wrec_gamma.t()) + u.dot(&p.win_gamma.t()) + &p.b_gamma));
        let h = (&gamma * &r_prev).dot(&p.wrec.t()) + u.dot(&p.win.t()) + &p.brec + q;

        let gate = &lambda * a;
        let x = &x_prev * &gate.mapv(|g| 1.0 - g) + &gate * &h;
        GruStep {
            lambda,
            gamma,
            h,
            x,
        }
    }

    fn has_trainable(&self, name: &str) -> bool {
        self.trainables.iter().any(|t| t == name)
    }
}

impl Network for GruNetwork {
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
        let step = self.advance(
            input.insert_axis(Axis(0)),
            noise.insert_axis(Axis(0)),
            state.insert_axis(Axis(0)),
        );
        let z = self.get_outputs_0(step.x.view());
        (
            z.index_axis_move(Axis(0), 0),
            step.x.index_axis_move(Axis(0), 0),
        )
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
        let shape = (steps, n, self.config.n_hidden);

        let mut states = Array3::zeros(shape);
        let mut rates = Array3::zeros(shape);
        let mut outputs = Array3::zeros((steps, n, self.config.n_out));
        let mut aux = vec![Array3::zeros(shape), Array3::zeros(shape), Array3::zeros(shape)];

        let mut x = x0.to_owned();
        for k in 0..steps {
            let step = self.advance(
                inputs.index_axis(Axis(0), k),
                noise.index_axis(Axis(0), k),
                x.view(),
            );
            let r = relu(&step.x);
            let z = readout(self.config.f_out, &self.params.wout, &self.params.bout, r.view());

            states.index_axis_mut(Axis(0), k).assign(&step.x);
            rates.index_axis_mut(Axis(0), k).assign(&r);
            outputs.index_axis_mut(Axis(0), k).assign(&z);
            aux[AUX_LAMBDA].index_axis_mut(Axis(0), k).assign(&step.lambda);
            aux[AUX_GAMMA].index_axis_mut(Axis(0), k).assign(&step.gamma);
            aux[AUX_H].index_axis_mut(Axis(0), k).assign(&step.h);
            x = step.x;
        }

        Ok(ForwardTrace {
            inputs: inputs.to_owned(),
            x0: x0.to_owned(),
            z0: self.get_outputs_0(x0),
            states,
            rates,
            outputs,
            aux,
        })
    }

    fn get_regs(&self, trace: &ForwardTrace, mask: ArrayView2<f64>) -> Regularization {
        let (mut value, d_rates) = rate_penalty(&trace.rates, mask, self.config.l2_r);
        let mut d_params = Params::new();

        if self.config.l1_wrec != 0.0 || self.config.l2_wrec != 0.0 {
            let (penalty, grad) =
                wrec_penalty(&self.params.wrec, self.config.l1_wrec, self.config.l2_wrec);
            value += penalty;
            if self.has_trainable("Wrec") {
                d_params.insert("Wrec".to_string(), grad.into_dyn());
            }
        }

        Regularization {
            value,
            d_rates,
            d_params,
        }
    }

    #[allow(clippy::too_many_lines)]
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
        let nh = self.config.n_hidden;

        let mut g_wrec_lambda = Array2::zeros(p.wrec_lambda.raw_dim());
        let mut g_wrec_gamma = Array2::zeros(p.wrec_gamma.raw_dim());
        let mut g_win_lambda = Array2::zeros(p.win_lambda.raw_dim());
        let mut g_win_gamma = Array2::zeros(p.win_gamma.raw_dim());
        let mut g_b_lambda = Array1::zeros(nh);
        let mut g_b_gamma = Array1::zeros(nh);
        let mut g_wrec = Array2::zeros(p.wrec.raw_dim());
        let mut g_win = Array2::zeros(p.win.raw_dim());
        let mut g_brec = Array1::zeros(nh);
        let mut g_wout = Array2::zeros(p.wout.raw_dim());
        let mut g_bout = Array1::zeros(p.bout.raw_dim());
        let mut state_grads = Array3::zeros((steps, n, nh));

        let mut carry = Array2::<f64>::zeros((n, nh));
        for k in (0..steps).rev() {
            let x = trace.states.index_axis(Axis(0), k);
            let r = trace.rates.index_axis(Axis(0), k);
            let lambda = trace.aux[AUX_LAMBDA].index_axis(Axis(0), k);
            let gamma = trace.aux[AUX_GAMMA].index_axis(Axis(0), k);
            let h = trace.aux[AUX_H].index_axis(Axis(0), k);
            let u = trace.inputs.index_axis(Axis(0), k);
            let x_prev = trace.previous_state(k);
            let r_prev = relu(&x_prev);

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

            // Leaky gated update
            let dh = &dx * &lambda * a;
            let d_lambda = &dx * &(&h - &x_prev) * a;
            let dx_prev = &dx * &lambda.mapv(|l| 1.0 - a * l);

            // Candidate state
            let gated = &gamma * &r_prev;
            g_wrec += &dh.t().dot(&gated);
            g_win += &dh.t().dot(&u);
            g_brec += &dh.sum_axis(Axis(0));
            let d_gated = dh.dot(&p.wrec);
            let d_gamma = &d_gated * &r_prev;
            let mut dr_prev = &d_gated * &gamma;

            // Gates
            let d_lambda_pre = d_lambda * &lambda.mapv(|l| l * (1.0 - l));
            let d_gamma_pre = d_gamma * &gamma.mapv(|g| g * (1.0 - g));
            g_wrec_lambda += &d_lambda_pre.t().dot(&r_prev);
            g_win_lambda += &d_lambda_pre.t().dot(&u);
            g_b_lambda += &d_lambda_pre.sum_axis(Axis(0));
            g_wrec_gamma += &d_gamma_pre.t().dot(&r_prev);
            g_win_gamma += &d_gamma_pre.t().dot(&u);
            g_b_gamma += &d_gamma_pre.sum_axis(Axis(0));
            dr_prev += &d_lambda_pre.dot(&p.wrec_lambda);
            dr_prev += &d_gamma_pre.dot(&p.wrec_gamma);

            carry = dx_prev + dr_prev * relu_grad(&x_prev);
        }

        let dzpre0 = readout_backward(f_out, trace.z0.view(), d_out0);
        g_wout += &dzpre0.t().dot(&relu(&trace.x0));
        g_bout += &dzpre0.sum_axis(Axis(0));
        let d_x0 = carry + dzpre0.dot(&p.wout) * relu_grad(&trace.x0);

        let grads = retain_trainable(
            vec![
                ("Wrec_lambda", g_wrec_lambda.into_dyn()),
                ("Wrec_gamma", g_wrec_gamma.into_dyn()),
                ("Win_lambda", g_win_lambda.into_dyn()),
                ("Win_gamma", g_win_gamma.into_dyn()),
                ("b_lambda", g_b_lambda.into_dyn()),
                ("b_gamma", g_b_gamma.into_dyn()),
                ("Wrec", g_wrec.into_dyn()),
                ("Win", g_win.into_dyn()),
                ("brec", g_brec.into_dyn()),
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

    fn get_values(&self) -> Params {
        let p = &self.params;
        Params::from([
            ("Wrec_lambda".to_string(), p.wrec_lambda.clone().into_dyn()),
            ("Wrec_gamma".to_string(), p.wrec_gamma.clone().into_dyn()),
            ("Win_lambda".to_string(), p.win_lambda.clone().into_dyn()),
            ("Win_gamma".to_string(), p.win_gamma.clone().into_dyn()),
            ("b_lambda".to_string(), p.b_lambda.clone().into_dyn()),
            ("b_gamma".to_string(), p.b_gamma.clone().into_dyn()),
            ("Wrec".to_string(), p.wrec.clone().into_dyn()),
            ("Win".to_string(), p.win.clone().into_dyn()),
            ("brec".to_string(), p.brec.clone().into_dyn()),
            ("Wout".to_string(), p.wout.clone().into_dyn()),
            ("bout".to_string(), p.bout.clone().into_dyn()),
            ("x0".to_string(), p.x0.clone().into_dyn()),
        ])
    }

    fn set_values(&mut self, values: &Params) -> Result<()> {
        unknown_params(values, &PARAM_NAMES)?;
        let mut next = self.params.clone();
        assign2(values, "Wrec_lambda", &mut next.wrec_lambda)?;
        assign2(values, "Wrec_gamma", &mut next.wrec_gamma)?;
        assign2(values, "Win_lambda", &mut next.win_lambda)?;
        assign2(values, "Win_gamma", &mut next.win_gamma)?;
        assign1(values, "b_lambda", &mut next.b_lambda)?;
        assign1(values, "b_gamma", &mut next.b_gamma)?;
        assign2(values, "Wrec", &mut next.wrec)?;
        assign2(values, "Win", &mut next.win)?;
        assign1(values, "brec", &mut next.brec)?;
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
