//! Stacked bidirectional LSTM over variable-length sentences.
//!
//! Internally every direction works on time-major flattened matrices: row
//! `t * batch + b` holds timestep `t` of sentence `b`. Positions at or beyond a
//! sentence's length produce zero output and receive no gradient.

use ndarray::{Array2, ArrayView2, Axis, s};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adam::Adam;
use crate::config::{RecurrentKind, TaggerConfig};
use crate::dropout::{Dropout, Mode};
use crate::errors::{ModelError, Result};
use crate::init;

const FORGET_BIAS: f32 = 1.0;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Batch-major `(batch * len, dim)` rows to time-major `(len * batch, dim)` rows.
pub fn to_time_major(input: &Array2<f32>, batch: usize, len: usize) -> Array2<f32> {
    Array2::from_shape_fn((len * batch, input.ncols()), |(r, d)| {
        let (t, b) = (r / batch, r % batch);
        input[[b * len + t, d]]
    })
}

/// Inverse of [`to_time_major`].
pub fn to_batch_major(input: &Array2<f32>, batch: usize, len: usize) -> Array2<f32> {
    Array2::from_shape_fn((batch * len, input.ncols()), |(r, d)| {
        let (b, t) = (r / len, r % len);
        input[[t * batch + b, d]]
    })
}

/// Reverse every sentence within its own length; padding rows become zero.
pub fn reverse_within_lengths(input: &Array2<f32>, lengths: &[usize]) -> Array2<f32> {
    let batch = lengths.len();
    Array2::from_shape_fn(input.dim(), |(r, d)| {
        let (t, b) = (r / batch, r % batch);
        if t < lengths[b] {
            input[[(lengths[b] - 1 - t) * batch + b, d]]
        } else {
            0.0
        }
    })
}

fn step_mask(lengths: &[usize], t: usize) -> Array2<f32> {
    Array2::from_shape_fn((lengths.len(), 1), |(b, _)| if t < lengths[b] { 1.0 } else { 0.0 })
}

/// Activations of one direction kept for backpropagation through time.
#[derive(Clone, Debug)]
struct LstmTrace {
    batch: usize,
    steps: usize,
    lengths: Vec<usize>,
    inputs: Array2<f32>,
    /// Post-activation gates `[input, candidate, forget, output]`, `(steps * batch, 4H)`
    gates: Array2<f32>,
    cells: Array2<f32>,
    hidden: Array2<f32>,
}

/// One direction of an LSTM layer.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LstmDirection {
    input_size: usize,
    hidden_size: usize,
    /// `(input_size + hidden_size, 4 * hidden_size)`, input rows first
    weights: Array2<f32>,
    bias: Array2<f32>,
    optimizer_weights: Adam,
    optimizer_bias: Adam,
    #[serde(skip)]
    trace: Option<LstmTrace>,
}

impl LstmDirection {
    pub fn new<R: Rng + ?Sized>(input_size: usize, hidden_size: usize, rng: &mut R) -> Self {
        let shape = (input_size + hidden_size, 4 * hidden_size);
        Self {
            input_size,
            hidden_size,
            weights: init::glorot_uniform(shape, rng),
            bias: Array2::zeros((1, 4 * hidden_size)),
            optimizer_weights: Adam::new(shape),
            optimizer_bias: Adam::new((1, 4 * hidden_size)),
            trace: None,
        }
    }

    fn input_weights(&self) -> ArrayView2<'_, f32> {
        self.weights.slice(s![..self.input_size, ..])
    }

    fn recurrent_weights(&self) -> ArrayView2<'_, f32> {
        self.weights.slice(s![self.input_size.., ..])
    }

    /// Gate non-linearities and state update for a block of rows.
    fn cell_step(&self, pre: &Array2<f32>, c_prev: &Array2<f32>) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let h = self.hidden_size;
        let mut gates = pre.clone();
        gates.slice_mut(s![.., ..h]).mapv_inplace(sigmoid);
        gates.slice_mut(s![.., h..2 * h]).mapv_inplace(f32::tanh);
        gates
            .slice_mut(s![.., 2 * h..3 * h])
            .mapv_inplace(|x| sigmoid(x + FORGET_BIAS));
        gates.slice_mut(s![.., 3 * h..]).mapv_inplace(sigmoid);

        let c = &gates.slice(s![.., 2 * h..3 * h]) * c_prev
            + &gates.slice(s![.., ..h]) * &gates.slice(s![.., h..2 * h]);
        let hidden = &gates.slice(s![.., 3 * h..]) * &c.mapv(f32::tanh);
        (gates, c, hidden)
    }

    /// Run over time-major `inputs` of shape `(steps * batch, input_size)`.
    /// Returns `(steps * batch, hidden_size)` outputs, zero past each length.
    pub fn run(&mut self, inputs: &Array2<f32>, lengths: &[usize], kind: RecurrentKind) -> Array2<f32> {
        let batch = lengths.len();
        let steps = if batch == 0 { 0 } else { inputs.nrows() / batch };
        let mut trace = LstmTrace {
            batch,
            steps,
            lengths: lengths.to_vec(),
            inputs: inputs.clone(),
            gates: Array2::zeros((steps * batch, 4 * self.hidden_size)),
            cells: Array2::zeros((steps * batch, self.hidden_size)),
            hidden: Array2::zeros((steps * batch, self.hidden_size)),
        };

        match kind {
            RecurrentKind::Simple => self.run_simple(&mut trace),
            RecurrentKind::Fused => self.run_fused(&mut trace),
        }

        let mut outputs = trace.hidden.clone();
        for t in 0..steps {
            let mask = step_mask(lengths, t);
            let mut block = outputs.slice_mut(s![t * batch..(t + 1) * batch, ..]);
            block *= &mask;
        }
        self.trace = Some(trace);
        outputs
    }

    /// Sentence by sentence, one `[x_t, h_{t-1}]` product per timestep.
    fn run_simple(&self, trace: &mut LstmTrace) {
        let (batch, h) = (trace.batch, self.hidden_size);
        for b in 0..batch {
            let mut hidden = Array2::<f32>::zeros((1, h));
            let mut cell = Array2::<f32>::zeros((1, h));
            for t in 0..trace.steps {
                let row = t * batch + b;
                if t < trace.lengths[b] {
                    let x = trace.inputs.slice(s![row..row + 1, ..]);
                    let mut xh = Array2::<f32>::zeros((1, self.input_size + h));
                    xh.slice_mut(s![.., ..self.input_size]).assign(&x);
                    xh.slice_mut(s![.., self.input_size..]).assign(&hidden);
                    let pre = xh.dot(&self.weights) + &self.bias;
                    let (gates, c, hid) = self.cell_step(&pre, &cell);
                    trace.gates.slice_mut(s![row..row + 1, ..]).assign(&gates);
                    cell = c;
                    hidden = hid;
                }
                trace.cells.slice_mut(s![row..row + 1, ..]).assign(&cell);
                trace.hidden.slice_mut(s![row..row + 1, ..]).assign(&hidden);
            }
        }
    }

    /// Whole batch per timestep; the input projection of every step is one product.
    fn run_fused(&self, trace: &mut LstmTrace) {
        let (batch, h) = (trace.batch, self.hidden_size);
        let projected = trace.inputs.dot(&self.input_weights()) + &self.bias;
        let recurrent = self.recurrent_weights();

        let mut hidden = Array2::<f32>::zeros((batch, h));
        let mut cell = Array2::<f32>::zeros((batch, h));
        for t in 0..trace.steps {
            let rows = s![t * batch..(t + 1) * batch, ..];
            let pre = &projected.slice(rows) + &hidden.dot(&recurrent);
            let (gates, c, hid) = self.cell_step(&pre, &cell);

            let mask = step_mask(&trace.lengths, t);
            let keep = mask.mapv(|m| 1.0 - m);
            cell = &c * &mask + &cell * &keep;
            hidden = &hid * &mask + &hidden * &keep;

            trace.gates.slice_mut(rows).assign(&(&gates * &mask));
            trace.cells.slice_mut(rows).assign(&cell);
            trace.hidden.slice_mut(rows).assign(&hidden);
        }
    }

    /// Backpropagation through time. Returns the input gradient (time-major) and `[weights, bias]`.
    pub fn compute_gradients(&self, output_grads: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let Some(trace) = self.trace.as_ref() else {
            return (
                Array2::zeros((0, self.input_size)),
                vec![Array2::zeros(self.weights.dim()), Array2::zeros(self.bias.dim())],
            );
        };
        let (batch, h) = (trace.batch, self.hidden_size);
        let recurrent = self.recurrent_weights();

        let mut grad_pre = Array2::<f32>::zeros((trace.steps * batch, 4 * h));
        let mut grad_recurrent = Array2::<f32>::zeros((h, 4 * h));
        let mut dh_next = Array2::<f32>::zeros((batch, h));
        let mut dc_next = Array2::<f32>::zeros((batch, h));
        let zeros = Array2::<f32>::zeros((batch, h));

        for t in (0..trace.steps).rev() {
            let rows = s![t * batch..(t + 1) * batch, ..];
            let mask = step_mask(&trace.lengths, t);
            let gates = trace.gates.slice(rows);
            let (i, g, f, o) = (
                gates.slice(s![.., ..h]),
                gates.slice(s![.., h..2 * h]),
                gates.slice(s![.., 2 * h..3 * h]),
                gates.slice(s![.., 3 * h..]),
            );
            let cell = trace.cells.slice(rows);
            let (c_prev, h_prev) = if t == 0 {
                (zeros.view(), zeros.view())
            } else {
                let prev = s![(t - 1) * batch..t * batch, ..];
                (trace.cells.slice(prev), trace.hidden.slice(prev))
            };

            let dh = (&output_grads.slice(rows) + &dh_next) * &mask;
            let tanh_c = cell.mapv(f32::tanh);
            let d_o = &dh * &tanh_c;
            let dc = (&dc_next + &(&dh * &o * &tanh_c.mapv(|x| 1.0 - x * x))) * &mask;
            let d_i = &dc * &g;
            let d_g = &dc * &i;
            let d_f = &dc * &c_prev;

            let mut block = grad_pre.slice_mut(rows);
            block
                .slice_mut(s![.., ..h])
                .assign(&(&d_i * &i.mapv(|x| x * (1.0 - x))));
            block
                .slice_mut(s![.., h..2 * h])
                .assign(&(&d_g * &g.mapv(|x| 1.0 - x * x)));
            block
                .slice_mut(s![.., 2 * h..3 * h])
                .assign(&(&d_f * &f.mapv(|x| x * (1.0 - x))));
            block
                .slice_mut(s![.., 3 * h..])
                .assign(&(&d_o * &o.mapv(|x| x * (1.0 - x))));

            let step_grad = grad_pre.slice(rows);
            grad_recurrent += &h_prev.t().dot(&step_grad);
            dh_next = step_grad.dot(&recurrent.t());
            dc_next = &dc * &f;
        }

        let grad_input_weights = trace.inputs.t().dot(&grad_pre);
        let mut grad_weights = Array2::<f32>::zeros(self.weights.dim());
        grad_weights
            .slice_mut(s![..self.input_size, ..])
            .assign(&grad_input_weights);
        grad_weights
            .slice_mut(s![self.input_size.., ..])
            .assign(&grad_recurrent);
        let grad_bias = grad_pre.sum_axis(Axis(0)).insert_axis(Axis(0));
        let grad_inputs = grad_pre.dot(&self.input_weights().t());

        (grad_inputs, vec![grad_weights, grad_bias])
    }

    pub fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        let [grad_weights, grad_bias] = param_grads else {
            return Err(ModelError::gradient_count("LstmDirection", 2, param_grads.len()));
        };
        self.optimizer_weights.step(&mut self.weights, grad_weights, lr);
        self.optimizer_bias.step(&mut self.bias, grad_bias, lr);
        Ok(())
    }

    pub fn parameters(&self) -> usize {
        self.weights.len() + self.bias.len()
    }
}

#[derive(Clone, Debug)]
struct LayerShape {
    batch: usize,
    steps: usize,
    lengths: Vec<usize>,
}

/// Forward and time-reversed LSTM over the same input, outputs concatenated.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BiLstmLayer {
    kind: RecurrentKind,
    hidden_size: usize,
    forward_cell: LstmDirection,
    backward_cell: LstmDirection,
    dropout: Dropout,
    #[serde(skip)]
    shape: Option<LayerShape>,
}

impl BiLstmLayer {
    pub fn new<R: Rng + ?Sized>(
        input_size: usize,
        hidden_size: usize,
        kind: RecurrentKind,
        keep_prob: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            kind,
            hidden_size,
            forward_cell: LstmDirection::new(input_size, hidden_size, rng),
            backward_cell: LstmDirection::new(input_size, hidden_size, rng),
            dropout: Dropout::new(keep_prob),
            shape: None,
        }
    }

    pub fn set_kind(&mut self, kind: RecurrentKind) {
        self.kind = kind;
    }

    /// `(batch * steps, input_size)` batch-major rows to `(batch * steps, 2 * hidden_size)`.
    pub fn forward<R: Rng + ?Sized>(
        &mut self,
        input: &Array2<f32>,
        lengths: &[usize],
        mode: Mode,
        rng: &mut R,
    ) -> Array2<f32> {
        let batch = lengths.len();
        let steps = if batch == 0 { 0 } else { input.nrows() / batch };
        let h = self.hidden_size;

        let time_major = to_time_major(input, batch, steps);
        let forward = self.forward_cell.run(&time_major, lengths, self.kind);
        let reversed = reverse_within_lengths(&time_major, lengths);
        let backward = reverse_within_lengths(&self.backward_cell.run(&reversed, lengths, self.kind), lengths);

        let mut outputs = Array2::<f32>::zeros((steps * batch, 2 * h));
        outputs.slice_mut(s![.., ..h]).assign(&forward);
        outputs.slice_mut(s![.., h..]).assign(&backward);

        self.shape = Some(LayerShape {
            batch,
            steps,
            lengths: lengths.to_vec(),
        });
        let outputs = to_batch_major(&outputs, batch, steps);
        self.dropout.forward(&outputs, mode, rng)
    }

    /// Input gradient (batch-major) and `[fw weights, fw bias, bw weights, bw bias]`.
    pub fn compute_gradients(&self, output_grads: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let Some(shape) = self.shape.as_ref() else {
            return (Array2::zeros((0, 0)), Vec::new());
        };
        let h = self.hidden_size;

        let grads = self.dropout.backward(output_grads);
        let time_major = to_time_major(&grads, shape.batch, shape.steps);
        let grad_forward = time_major.slice(s![.., ..h]).to_owned();
        let grad_backward = reverse_within_lengths(&time_major.slice(s![.., h..]).to_owned(), &shape.lengths);

        let (input_fw, mut params) = self.forward_cell.compute_gradients(&grad_forward);
        let (input_bw, params_bw) = self.backward_cell.compute_gradients(&grad_backward);
        params.extend(params_bw);

        let grad_input = input_fw + reverse_within_lengths(&input_bw, &shape.lengths);
        (to_batch_major(&grad_input, shape.batch, shape.steps), params)
    }

    pub fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        if param_grads.len() != 4 {
            return Err(ModelError::gradient_count("BiLstmLayer", 4, param_grads.len()));
        }
        self.forward_cell.apply_gradients(&param_grads[..2], lr)?;
        self.backward_cell.apply_gradients(&param_grads[2..], lr)
    }

    pub fn parameters(&self) -> usize {
        self.forward_cell.parameters() + self.backward_cell.parameters()
    }
}

/// Stack of bidirectional layers, each consuming the previous layer's output.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RecurrentEncoder {
    layers: Vec<BiLstmLayer>,
}

impl RecurrentEncoder {
    pub fn new<R: Rng + ?Sized>(config: &TaggerConfig, rng: &mut R) -> Self {
        let mut input_size = config.input_dim();
        let layers = (0..config.recurrent_depth)
            .map(|_| {
                let layer = BiLstmLayer::new(
                    input_size,
                    config.recurrent_size,
                    config.recurrent_kind,
                    config.keep_prob,
                    rng,
                );
                input_size = 2 * config.recurrent_size;
                layer
            })
            .collect();
        Self { layers }
    }

    pub fn layer_type(&self) -> &str {
        "BiLstmEncoder"
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Switch execution strategy of every layer; parameters are untouched.
    pub fn set_kind(&mut self, kind: RecurrentKind) {
        for layer in &mut self.layers {
            layer.set_kind(kind);
        }
    }

    pub fn forward<R: Rng + ?Sized>(
        &mut self,
        input: &Array2<f32>,
        lengths: &[usize],
        mode: Mode,
        rng: &mut R,
    ) -> Array2<f32> {
        let mut output = input.clone();
        for layer in &mut self.layers {
            output = layer.forward(&output, lengths, mode, rng);
        }
        output
    }

    /// Input gradient and four parameter gradients per layer, first layer first.
    pub fn compute_gradients(&self, output_grads: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let mut grads = output_grads.clone();
        let mut per_layer = Vec::with_capacity(self.layers.len());
        for layer in self.layers.iter().rev() {
            let (input_grads, params) = layer.compute_gradients(&grads);
            grads = input_grads;
            per_layer.push(params);
        }
        let params = per_layer.into_iter().rev().flatten().collect();
        (grads, params)
    }

    pub fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) -> Result<()> {
        let expected = 4 * self.layers.len();
        if param_grads.len() != expected {
            return Err(ModelError::gradient_count(self.layer_type(), expected, param_grads.len()));
        }
        for (layer, grads) in self.layers.iter_mut().zip(param_grads.chunks(4)) {
            layer.apply_gradients(grads, lr)?;
        }
        Ok(())
    }

    pub fn parameters(&self) -> usize {
        self.layers.iter().map(BiLstmLayer::parameters).sum()
    }
}
