//! Candidate operations
//!
//! The NAS-Bench-201 operation names are kept (`conv_1x1`, `conv_3x3`,
//! `avg_pool_3x3`, ...) but act on feature vectors: a "convolution" is a
//! ReLU followed by a dense projection and pooling averages neighbouring
//! features.

use ndarray::{Array2, Axis};
use rand::Rng;

use super::{Operation, Param};
use crate::error::{NasError, Result};

fn missing_cache(op: &str) -> NasError {
    NasError::ComputationError(format!("{op}: backward called before forward"))
}

/// The `none` candidate: outputs zeros
#[derive(Debug, Clone, Default)]
pub struct Zero {
    shape: Option<(usize, usize)>,
}

impl Zero {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Operation for Zero {
    fn forward(&mut self, x: &Array2<f64>) -> Result<Array2<f64>> {
        self.shape = Some(x.dim());
        Ok(Array2::zeros(x.raw_dim()))
    }

    fn backward(&mut self, _grad: &Array2<f64>) -> Result<Array2<f64>> {
        let shape = self.shape.ok_or_else(|| missing_cache("zero"))?;
        Ok(Array2::zeros(shape))
    }

    fn flops(&self, _batch: usize) -> usize {
        0
    }
}

/// The `skip_connect` candidate
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Operation for Identity {
    fn forward(&mut self, x: &Array2<f64>) -> Result<Array2<f64>> {
        Ok(x.clone())
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<Array2<f64>> {
        Ok(grad.clone())
    }

    fn flops(&self, _batch: usize) -> usize {
        0
    }
}

/// Fully connected layer `y = x W + b`
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Param,
    bias: Param,
    input: Option<Array2<f64>>,
}

impl Linear {
    /// Xavier/Glorot uniform initialization
    pub fn new(in_dim: usize, out_dim: usize, rng: &mut impl Rng) -> Self {
        let scale = (6.0 / (in_dim + out_dim) as f64).sqrt();
        let weight = Array2::from_shape_fn((in_dim, out_dim), |_| {
            rng.gen::<f64>() * 2.0 * scale - scale
        });
        Self::from_weights(weight, Array2::zeros((1, out_dim)))
    }

    /// Build from explicit weights `[in, out]` and bias `[1, out]`
    pub fn from_weights(weight: Array2<f64>, bias: Array2<f64>) -> Self {
        Self {
            weight: Param::new(weight),
            bias: Param::new(bias),
            input: None,
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.value.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.value.ncols()
    }
}

impl Operation for Linear {
    fn forward(&mut self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.in_dim() {
            return Err(NasError::shape(
                format!("[_, {}]", self.in_dim()),
                format!("{:?}", x.dim()),
            ));
        }
        let out = x.dot(&self.weight.value) + &self.bias.value.row(0);
        self.input = Some(x.clone());
        Ok(out)
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<Array2<f64>> {
        let input = self.input.as_ref().ok_or_else(|| missing_cache("linear"))?;
        self.weight.grad += &input.t().dot(grad);
        self.bias.grad += &grad.sum_axis(Axis(0)).insert_axis(Axis(0));
        Ok(grad.dot(&self.weight.value.t()))
    }

    fn parameters(&self) -> Vec<&Param> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }

    fn flops(&self, batch: usize) -> usize {
        batch * self.in_dim() * self.out_dim()
    }
}

/// Rectified linear unit
#[derive(Debug, Clone, Default)]
pub struct Relu {
    mask: Option<Array2<f64>>,
}

impl Relu {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Operation for Relu {
    fn forward(&mut self, x: &Array2<f64>) -> Result<Array2<f64>> {
        self.mask = Some(x.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }));
        Ok(x.mapv(|v| v.max(0.0)))
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<Array2<f64>> {
        let mask = self.mask.as_ref().ok_or_else(|| missing_cache("relu"))?;
        Ok(grad * mask)
    }

    fn flops(&self, _batch: usize) -> usize {
        0
    }
}

/// Average over a sliding window of neighbouring features.
///
/// Padding positions are not counted, so edge features average over fewer
/// values. Output width equals input width; `width` is only used for cost
/// accounting.
#[derive(Debug, Clone)]
pub struct AvgPool1d {
    kernel: usize,
    width: usize,
    shape: Option<(usize, usize)>,
}

impl AvgPool1d {
    pub fn new(kernel: usize, width: usize) -> Self {
        Self {
            kernel: kernel.max(1),
            width,
            shape: None,
        }
    }

    fn window(&self, j: usize, width: usize) -> (usize, usize) {
        let half = self.kernel / 2;
        let lo = j.saturating_sub(half);
        let hi = (j + half + 1).min(width);
        (lo, hi)
    }
}

impl Operation for AvgPool1d {
    fn forward(&mut self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let (n, d) = x.dim();
        let mut out = Array2::zeros((n, d));
        for j in 0..d {
            let (lo, hi) = self.window(j, d);
            let count = (hi - lo) as f64;
            let mean = x.slice(ndarray::s![.., lo..hi]).sum_axis(Axis(1)) / count;
            out.column_mut(j).assign(&mean);
        }
        self.shape = Some((n, d));
        Ok(out)
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<Array2<f64>> {
        let (n, d) = self.shape.ok_or_else(|| missing_cache("avg_pool"))?;
        let mut dx = Array2::zeros((n, d));
        for j in 0..d {
            let (lo, hi) = self.window(j, d);
            let share = grad.column(j).to_owned() / (hi - lo) as f64;
            for k in lo..hi {
                let mut col = dx.column_mut(k);
                col += &share;
            }
        }
        Ok(dx)
    }

    fn flops(&self, batch: usize) -> usize {
        batch * self.width * self.kernel
    }
}

/// Chain of operations applied in order
#[derive(Debug, Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Operation>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, layer: impl Operation + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Operation for Sequential {
    fn forward(&mut self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let mut out = x.clone();
        for layer in self.layers.iter_mut() {
            out = layer.forward(&out)?;
        }
        Ok(out)
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<Array2<f64>> {
        let mut g = grad.clone();
        for layer in self.layers.iter_mut().rev() {
            g = layer.backward(&g)?;
        }
        Ok(g)
    }

    fn parameters(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.parameters_mut()).collect()
    }

    fn flops(&self, batch: usize) -> usize {
        self.layers.iter().map(|l| l.flops(batch)).sum()
    }
}

/// ReLU then a dense projection (`conv_1x1`)
pub fn conv_1x1(dim: usize, rng: &mut impl Rng) -> Sequential {
    Sequential::new().push(Relu::new()).push(Linear::new(dim, dim, rng))
}

/// Two stacked ReLU + dense projections (`conv_3x3`)
pub fn conv_3x3(dim: usize, rng: &mut impl Rng) -> Sequential {
    Sequential::new()
        .push(Relu::new())
        .push(Linear::new(dim, dim, rng))
        .push(Relu::new())
        .push(Linear::new(dim, dim, rng))
}

/// Width-3 feature averaging (`avg_pool_3x3`)
pub fn avg_pool_3x3(dim: usize) -> AvgPool1d {
    AvgPool1d::new(3, dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn numeric_input_grad(op: &mut dyn Operation, x: &Array2<f64>) -> Array2<f64> {
        // d(sum(op(x)))/dx by central differences
        let eps = 1e-6;
        let mut grad = Array2::zeros(x.raw_dim());
        for idx in 0..x.len() {
            let (i, j) = (idx / x.ncols(), idx % x.ncols());
            let mut plus = x.clone();
            plus[[i, j]] += eps;
            let mut minus = x.clone();
            minus[[i, j]] -= eps;
            let f_plus = op.forward(&plus).unwrap().sum();
            let f_minus = op.forward(&minus).unwrap().sum();
            grad[[i, j]] = (f_plus - f_minus) / (2.0 * eps);
        }
        grad
    }

    #[test]
    fn test_zero_and_identity() {
        let x = array![[1.0, -2.0], [3.0, 4.0]];
        let mut zero = Zero::new();
        assert_eq!(zero.forward(&x).unwrap(), Array2::<f64>::zeros((2, 2)));
        assert_eq!(zero.backward(&x).unwrap(), Array2::<f64>::zeros((2, 2)));

        let mut id = Identity;
        assert_eq!(id.forward(&x).unwrap(), x);
        assert_eq!(id.backward(&x).unwrap(), x);
    }

    #[test]
    fn test_linear_forward() {
        let mut lin = Linear::from_weights(array![[1.0, 0.0], [0.0, 2.0]], array![[0.5, -0.5]]);
        let out = lin.forward(&array![[1.0, 1.0]]).unwrap();
        assert_eq!(out, array![[1.5, 1.5]]);
        assert_eq!(lin.num_params(), 6);
        assert_eq!(lin.flops(10), 40);
    }

    #[test]
    fn test_linear_shape_mismatch() {
        let mut lin = Linear::from_weights(Array2::zeros((3, 2)), Array2::zeros((1, 2)));
        let err = lin.forward(&Array2::zeros((4, 2))).unwrap_err();
        assert!(matches!(err, NasError::ShapeError { .. }));
    }

    #[test]
    fn test_linear_backward_matches_numeric() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let mut lin = Linear::new(3, 2, &mut rng);
        let x = array![[0.3, -1.2, 0.7], [1.1, 0.4, -0.2]];
        let numeric = numeric_input_grad(&mut lin, &x);
        lin.forward(&x).unwrap();
        let analytic = lin.backward(&Array2::ones((2, 2))).unwrap();
        for (a, n) in analytic.iter().zip(numeric.iter()) {
            assert!((a - n).abs() < 1e-5);
        }
        // bias gradient is the column sum of the upstream gradient
        assert_eq!(lin.parameters()[1].grad, array![[2.0, 2.0]]);
    }

    #[test]
    fn test_backward_before_forward_fails() {
        let mut relu = Relu::new();
        assert!(relu.backward(&array![[1.0]]).is_err());
    }

    #[test]
    fn test_avg_pool_excludes_padding() {
        let mut pool = avg_pool_3x3(3);
        let out = pool.forward(&array![[3.0, 6.0, 9.0]]).unwrap();
        assert_eq!(out, array![[4.5, 6.0, 7.5]]);
    }

    #[test]
    fn test_avg_pool_backward_matches_numeric() {
        let mut pool = avg_pool_3x3(4);
        let x = array![[0.1, 0.5, -0.3, 0.9]];
        let numeric = numeric_input_grad(&mut pool, &x);
        pool.forward(&x).unwrap();
        let analytic = pool.backward(&Array2::ones((1, 4))).unwrap();
        for (a, n) in analytic.iter().zip(numeric.iter()) {
            assert!((a - n).abs() < 1e-5);
        }
    }

    #[test]
    fn test_conv_3x3_is_larger_than_conv_1x1() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let small = conv_1x1(8, &mut rng);
        let large = conv_3x3(8, &mut rng);
        assert!(large.flops(4) > small.flops(4));
        assert_eq!(large.num_params(), 2 * small.num_params());
    }
}
