//! Layers of a [`Sequential`](super::Sequential) classifier.
//!
//! Convolutions use circular padding and stride 1, so they commute with cyclic
//! translations of the input. Together with global pooling that gives models
//! which are exactly translation invariant.

use ndarray::{Array1, Array2, Array4, Axis};
use rand::Rng;
use rand::rngs::StdRng;

use super::state::ParamTensor;
use crate::autograd::{Tape, Var};
use crate::error::{Result, XaiError};
use crate::hooks::{Activation, GeometricTensor};
use crate::symmetry::{Dihedral, SymmetryGroup};

fn uniform(rng: &mut StdRng, fan_in: usize) -> impl FnMut() -> f64 + '_ {
    let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
    move || rng.gen_range(-bound..bound)
}

/// Fully connected layer, `y = x Wᵀ + b`.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

/// A [`Linear`] layer's parameters recorded as tape leaves.
pub struct LinearVars {
    pub weight: Var,
    pub bias: Var,
}

impl LinearVars {
    /// Logits of `(n, in)` features on the tape.
    pub fn forward(&self, h: &Var) -> Var {
        let (n, _) = h.shape();
        &h.matmul(&self.weight.t()) + &self.bias.broadcast_rows(n)
    }

    pub fn params(&self) -> [Var; 2] {
        [self.weight.clone(), self.bias.clone()]
    }
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        let mut draw = uniform(rng, in_features);
        let weight = Array2::from_shape_simple_fn((out_features, in_features), &mut draw);
        let bias = Array1::from_shape_simple_fn(out_features, &mut draw);
        Self { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Weight entries followed by bias entries.
    pub fn num_params(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    pub fn forward(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.in_features() {
            return Err(XaiError::shape(format!(
                "linear layer expects {} features, got {}",
                self.in_features(),
                x.ncols()
            )));
        }
        Ok(x.dot(&self.weight.t()) + &self.bias)
    }

    /// Record the parameters as leaves; the bias becomes a `(1, out)` row.
    pub fn leaves(&self, tape: &Tape) -> LinearVars {
        let bias = self.bias.clone().insert_axis(Axis(0));
        LinearVars {
            weight: tape.leaf(self.weight.clone()),
            bias: tape.leaf(bias),
        }
    }
}

/// 2-D convolution with circular padding and stride 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2d {
    /// `(out, in, k, k)`.
    pub weight: Array4<f64>,
    pub bias: Array1<f64>,
}

impl Conv2d {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize, rng: &mut StdRng) -> Self {
        let mut draw = uniform(rng, in_channels * kernel_size * kernel_size);
        let weight = Array4::from_shape_simple_fn(
            (out_channels, in_channels, kernel_size, kernel_size),
            &mut draw,
        );
        let bias = Array1::from_shape_simple_fn(out_channels, &mut draw);
        Self { weight, bias }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn forward(&self, x: &Array4<f64>) -> Result<Array4<f64>> {
        convolve(x, &self.weight, &self.bias)
    }
}

/// Circular cross-correlation. Odd kernels are centred on the output pixel.
fn convolve(x: &Array4<f64>, weight: &Array4<f64>, bias: &Array1<f64>) -> Result<Array4<f64>> {
    let (n, cin, h, w) = x.dim();
    let (cout, win, kh, kw) = weight.dim();
    if cin != win {
        return Err(XaiError::shape(format!(
            "convolution expects {win} input channels, got {cin}"
        )));
    }
    let (rh, rw) = ((kh / 2) as isize, (kw / 2) as isize);
    let (hi, wi) = (h as isize, w as isize);
    let mut out = Array4::zeros((n, cout, h, w));
    for b in 0..n {
        for o in 0..cout {
            for i in 0..h {
                for j in 0..w {
                    let mut acc = bias[o];
                    for c in 0..cin {
                        for a in 0..kh {
                            let si = (i as isize + a as isize - rh).rem_euclid(hi) as usize;
                            for k in 0..kw {
                                let sj = (j as isize + k as isize - rw).rem_euclid(wi) as usize;
                                acc += weight[[o, c, a, k]] * x[[b, c, si, sj]];
                            }
                        }
                    }
                    out[[b, o, i, j]] = acc;
                }
            }
        }
    }
    Ok(out)
}

/// Lifting convolution onto D4: every output channel is computed with all
/// eight rotated/reflected copies of its kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct DihedralLift {
    pub conv: Conv2d,
}

impl DihedralLift {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize, rng: &mut StdRng) -> Self {
        Self {
            conv: Conv2d::new(in_channels, out_channels, kernel_size, rng),
        }
    }

    pub fn forward(&self, x: &Array4<f64>) -> Result<GeometricTensor> {
        let group = Dihedral;
        let elements = group.elements(self.conv.weight.dim())?;
        let order = elements.len();
        let (n, _, h, w) = x.dim();
        let cout = self.conv.out_channels();
        let mut tensor = Array4::zeros((n, cout * order, h, w));
        for (g, element) in elements.iter().enumerate() {
            let kernel = group.apply(&self.conv.weight, element)?;
            let y = convolve(x, &kernel, &self.conv.bias)?;
            for o in 0..cout {
                tensor
                    .index_axis_mut(Axis(1), o * order + g)
                    .assign(&y.index_axis(Axis(1), o));
            }
        }
        Ok(GeometricTensor {
            tensor,
            group_order: order,
        })
    }
}

/// One stage of a [`Sequential`](super::Sequential) model.
#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Linear(Linear),
    Conv2d(Conv2d),
    DihedralLift(DihedralLift),
    Relu,
    Flatten,
    /// Mean over the spatial axes, `(n, c, h, w) -> (n, c)`.
    GlobalAvgPool,
    /// Spatial mean, then max over the group axis of a geometric tensor.
    GroupPool,
}

impl Layer {
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Linear(_) => "linear",
            Layer::Conv2d(_) => "conv2d",
            Layer::DihedralLift(_) => "dihedral_lift",
            Layer::Relu => "relu",
            Layer::Flatten => "flatten",
            Layer::GlobalAvgPool => "global_avg_pool",
            Layer::GroupPool => "group_pool",
        }
    }

    pub fn forward(&self, input: Activation) -> Result<Activation> {
        match self {
            Layer::Linear(linear) => Ok(Activation::Dense(linear.forward(&input.flatten())?)),
            Layer::Conv2d(conv) => match input {
                Activation::Spatial(x) => Ok(Activation::Spatial(conv.forward(&x)?)),
                Activation::Geometric(g) => Ok(Activation::Spatial(conv.forward(&g.tensor)?)),
                Activation::Dense(_) => Err(XaiError::shape("conv2d needs a spatial input")),
            },
            Layer::DihedralLift(lift) => match input {
                Activation::Spatial(x) => Ok(Activation::Geometric(lift.forward(&x)?)),
                _ => Err(XaiError::shape("dihedral lift needs a plain spatial input")),
            },
            Layer::Relu => Ok(match input {
                Activation::Dense(x) => Activation::Dense(x.mapv(|v| v.max(0.0))),
                Activation::Spatial(x) => Activation::Spatial(x.mapv(|v| v.max(0.0))),
                Activation::Geometric(g) => Activation::Geometric(GeometricTensor {
                    tensor: g.tensor.mapv(|v| v.max(0.0)),
                    group_order: g.group_order,
                }),
            }),
            Layer::Flatten => Ok(Activation::Dense(input.flatten())),
            Layer::GlobalAvgPool => match input {
                Activation::Spatial(x) => Ok(Activation::Dense(spatial_mean(&x))),
                Activation::Geometric(g) => Ok(Activation::Dense(spatial_mean(&g.tensor))),
                Activation::Dense(_) => Err(XaiError::shape("global pooling needs a spatial input")),
            },
            Layer::GroupPool => match input {
                Activation::Geometric(g) => Ok(Activation::Dense(group_pool(&g)?)),
                _ => Err(XaiError::shape("group pooling needs a geometric input")),
            },
        }
    }

    /// Parameters under `{prefix}.weight` / `{prefix}.bias`.
    pub fn params(&self, prefix: &str) -> Vec<(String, ParamTensor)> {
        let (weight, bias) = match self {
            Layer::Linear(l) => (ParamTensor::from_array(&l.weight), ParamTensor::from_array(&l.bias)),
            Layer::Conv2d(c) => (ParamTensor::from_array(&c.weight), ParamTensor::from_array(&c.bias)),
            Layer::DihedralLift(d) => (
                ParamTensor::from_array(&d.conv.weight),
                ParamTensor::from_array(&d.conv.bias),
            ),
            _ => return Vec::new(),
        };
        vec![
            (format!("{prefix}.weight"), weight),
            (format!("{prefix}.bias"), bias),
        ]
    }

    /// Overwrite the parameter named `field` (`weight` or `bias`).
    pub fn set_param(&mut self, field: &str, value: &ParamTensor) -> Result<()> {
        match (self, field) {
            (Layer::Linear(l), "weight") => value.assign_to(&mut l.weight),
            (Layer::Linear(l), "bias") => value.assign_to(&mut l.bias),
            (Layer::Conv2d(c), "weight") => value.assign_to(&mut c.weight),
            (Layer::Conv2d(c), "bias") => value.assign_to(&mut c.bias),
            (Layer::DihedralLift(d), "weight") => value.assign_to(&mut d.conv.weight),
            (Layer::DihedralLift(d), "bias") => value.assign_to(&mut d.conv.bias),
            (layer, field) => Err(XaiError::model(format!(
                "{} layer has no parameter {field}",
                layer.kind()
            ))),
        }
    }
}

/// Layout of the columns of a taped activation. Rows are examples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapedShape {
    Dense(usize),
    /// `(channels, h, w)` flattened row-major.
    Spatial(usize, usize, usize),
    /// Like `Spatial`, with channels indexed `field * order + element`.
    Geometric(usize, usize, usize, usize),
}

impl TapedShape {
    pub fn width(self) -> usize {
        match self {
            TapedShape::Dense(d) => d,
            TapedShape::Spatial(c, h, w) | TapedShape::Geometric(c, h, w, _) => c * h * w,
        }
    }

    fn spatial(self, what: &str) -> Result<(usize, usize, usize)> {
        match self {
            TapedShape::Spatial(c, h, w) | TapedShape::Geometric(c, h, w, _) => Ok((c, h, w)),
            TapedShape::Dense(_) => Err(XaiError::shape(format!("{what} needs a spatial input"))),
        }
    }
}

/// `x M` with `M` recorded as a constant.
fn linear_map(x: &Var, matrix: Array2<f64>) -> Var {
    x.matmul(&x.tape().constant(matrix))
}

fn add_bias_row(x: &Var, bias: Array1<f64>) -> Var {
    let (n, _) = x.shape();
    let row = x.tape().constant(bias.insert_axis(Axis(0)));
    x + &row.broadcast_rows(n)
}

/// Matrix of the circular convolution acting on flattened rows, written into
/// the output channels `channel_of(o)`.
fn fill_conv_matrix(
    matrix: &mut Array2<f64>,
    weight: &Array4<f64>,
    (h, w): (usize, usize),
    channel_of: impl Fn(usize) -> usize,
) {
    let (cout, cin, kh, kw) = weight.dim();
    let (rh, rw) = ((kh / 2) as isize, (kw / 2) as isize);
    let (hi, wi) = (h as isize, w as isize);
    for o in 0..cout {
        let col_base = channel_of(o) * h * w;
        for i in 0..h {
            for j in 0..w {
                for c in 0..cin {
                    for a in 0..kh {
                        let si = (i as isize + a as isize - rh).rem_euclid(hi) as usize;
                        for k in 0..kw {
                            let sj = (j as isize + k as isize - rw).rem_euclid(wi) as usize;
                            matrix[[c * h * w + si * w + sj, col_base + i * w + j]] += weight[[o, c, a, k]];
                        }
                    }
                }
            }
        }
    }
}

fn repeat_per_pixel(bias: impl Iterator<Item = f64>, area: usize) -> Array1<f64> {
    bias.flat_map(|b| std::iter::repeat_n(b, area)).collect()
}

fn mean_pool_matrix(c: usize, area: usize) -> Array2<f64> {
    Array2::from_shape_fn((c * area, c), |(r, k)| if r / area == k { 1.0 / area.max(1) as f64 } else { 0.0 })
}

impl Layer {
    /// Same computation as [`Layer::forward`] on rows of a tape, with the
    /// parameters recorded as constants. ReLU and group pooling pass the
    /// gradient through the active entries.
    pub fn forward_on_tape(&self, input: &Var, shape: TapedShape) -> Result<(Var, TapedShape)> {
        if input.shape().1 != shape.width() {
            return Err(XaiError::shape(format!(
                "taped activation has {} columns, layout expects {}",
                input.shape().1,
                shape.width()
            )));
        }
        match self {
            Layer::Linear(linear) => {
                if shape.width() != linear.in_features() {
                    return Err(XaiError::shape(format!(
                        "linear layer expects {} features, got {}",
                        linear.in_features(),
                        shape.width()
                    )));
                }
                let out = add_bias_row(&linear_map(input, linear.weight.t().to_owned()), linear.bias.clone());
                Ok((out, TapedShape::Dense(linear.out_features())))
            }
            Layer::Conv2d(conv) => {
                let (c, h, w) = shape.spatial("conv2d")?;
                let (cout, cin, _, _) = conv.weight.dim();
                if c != cin {
                    return Err(XaiError::shape(format!(
                        "convolution expects {cin} input channels, got {c}"
                    )));
                }
                let mut matrix = Array2::zeros((c * h * w, cout * h * w));
                fill_conv_matrix(&mut matrix, &conv.weight, (h, w), |o| o);
                let bias = repeat_per_pixel(conv.bias.iter().copied(), h * w);
                Ok((add_bias_row(&linear_map(input, matrix), bias), TapedShape::Spatial(cout, h, w)))
            }
            Layer::DihedralLift(lift) => {
                let TapedShape::Spatial(c, h, w) = shape else {
                    return Err(XaiError::shape("dihedral lift needs a plain spatial input"));
                };
                let (cout, cin, _, _) = lift.conv.weight.dim();
                if c != cin {
                    return Err(XaiError::shape(format!(
                        "convolution expects {cin} input channels, got {c}"
                    )));
                }
                let group = Dihedral;
                let elements = group.elements(lift.conv.weight.dim())?;
                let order = elements.len();
                let mut matrix = Array2::zeros((c * h * w, cout * order * h * w));
                for (g, element) in elements.iter().enumerate() {
                    let kernel = group.apply(&lift.conv.weight, element)?;
                    fill_conv_matrix(&mut matrix, &kernel, (h, w), |o| o * order + g);
                }
                let bias = repeat_per_pixel(
                    lift.conv.bias.iter().flat_map(|&b| std::iter::repeat_n(b, order)),
                    h * w,
                );
                Ok((
                    add_bias_row(&linear_map(input, matrix), bias),
                    TapedShape::Geometric(cout * order, h, w, order),
                ))
            }
            Layer::Relu => {
                let mask = input.value().mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
                Ok((input * &input.tape().constant(mask), shape))
            }
            Layer::Flatten => Ok((input.clone(), TapedShape::Dense(shape.width()))),
            Layer::GlobalAvgPool => {
                let (c, h, w) = shape.spatial("global pooling")?;
                Ok((linear_map(input, mean_pool_matrix(c, h * w)), TapedShape::Dense(c)))
            }
            Layer::GroupPool => {
                let TapedShape::Geometric(c, h, w, order) = shape else {
                    return Err(XaiError::shape("group pooling needs a geometric input"));
                };
                let order = order.max(1);
                if c % order != 0 {
                    return Err(XaiError::shape(format!(
                        "{c} channels do not split into groups of {order}"
                    )));
                }
                let pooled = linear_map(input, mean_pool_matrix(c, h * w));
                let values = pooled.value();
                let fields = c / order;
                let mut winners = Array2::<f64>::zeros(values.dim());
                for (b, row) in values.rows().into_iter().enumerate() {
                    for f in 0..fields {
                        let best = (0..order)
                            .max_by(|&p, &q| row[f * order + p].total_cmp(&row[f * order + q]))
                            .unwrap_or(0);
                        winners[[b, f * order + best]] = 1.0;
                    }
                }
                let gather = Array2::from_shape_fn((c, fields), |(k, f)| if k / order == f { 1.0 } else { 0.0 });
                let selected = &pooled * &pooled.tape().constant(winners);
                Ok((linear_map(&selected, gather), TapedShape::Dense(fields)))
            }
        }
    }
}

fn spatial_mean(x: &Array4<f64>) -> Array2<f64> {
    let (n, c, h, w) = x.dim();
    let area = (h * w).max(1) as f64;
    Array2::from_shape_fn((n, c), |(b, ch)| {
        x.index_axis(Axis(0), b).index_axis(Axis(0), ch).sum() / area
    })
}

fn group_pool(g: &GeometricTensor) -> Result<Array2<f64>> {
    let pooled = spatial_mean(&g.tensor);
    let order = g.group_order.max(1);
    if pooled.ncols() % order != 0 {
        return Err(XaiError::shape(format!(
            "{} channels do not split into groups of {order}",
            pooled.ncols()
        )));
    }
    let fields = pooled.ncols() / order;
    Ok(Array2::from_shape_fn((pooled.nrows(), fields), |(b, f)| {
        (0..order)
            .map(|k| pooled[[b, f * order + k]])
            .fold(f64::NEG_INFINITY, f64::max)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_linear_forward_matches_tape() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = Linear::new(3, 2, &mut rng);
        let x = array![[1.0, -2.0, 0.5], [0.0, 1.0, 1.0]];
        let plain = layer.forward(&x).unwrap();

        let tape = Tape::new();
        let vars = layer.leaves(&tape);
        let taped = vars.forward(&tape.constant(x)).value();
        for (a, b) in plain.iter().zip(taped.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_linear_rejects_wrong_width() {
        let layer = Linear::new(3, 2, &mut StdRng::seed_from_u64(0));
        assert!(layer.forward(&Array2::zeros((1, 4))).is_err());
    }

    #[test]
    fn test_circular_conv_commutes_with_roll() {
        let conv = Conv2d::new(1, 2, 3, &mut StdRng::seed_from_u64(9));
        let x = Array4::from_shape_fn((1, 1, 5, 5), |(_, _, i, j)| ((i * 7 + j * 3) % 5) as f64);
        let rolled = crate::tensor::roll_spatial(&x, 2, -1);
        let lhs = conv.forward(&rolled).unwrap();
        let rhs = crate::tensor::roll_spatial(&conv.forward(&x).unwrap(), 2, -1);
        for (a, b) in lhs.iter().zip(rhs.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_group_pool_is_dihedral_invariant() {
        let lift = DihedralLift::new(1, 2, 3, &mut StdRng::seed_from_u64(4));
        let x = Array4::from_shape_fn((1, 1, 4, 4), |(_, _, i, j)| (i * 4 + j) as f64 * 0.1);
        let base = group_pool(&lift.forward(&x).unwrap()).unwrap();
        for element in Dihedral.elements((1, 1, 4, 4)).unwrap() {
            let gx = Dihedral.apply(&x, &element).unwrap();
            let pooled = group_pool(&lift.forward(&gx).unwrap()).unwrap();
            for (a, b) in base.iter().zip(pooled.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_set_param_checks_shape() {
        let mut layer = Layer::Linear(Linear::new(2, 2, &mut StdRng::seed_from_u64(1)));
        let bad = ParamTensor::from_array(&Array1::<f64>::zeros(3));
        assert!(layer.set_param("bias", &bad).is_err());
        assert!(Layer::Relu.set_param("weight", &bad).is_err());
    }
}
