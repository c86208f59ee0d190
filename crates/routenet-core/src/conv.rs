//! Convolutional trunk layers: conv, max-pool and batch-norm over `[N, C, H, W]`

use ndarray::{s, Array1, Array4, ArrayD, Axis, Ix1, Ix4};
use rand::Rng;

use crate::error::{Result, RoutingError};
use crate::layers::{Layer, LayerStack, Relu};
use crate::param::{fan_in_bound, Param};

fn as_images(x: &ArrayD<f32>, context: &str) -> Result<Array4<f32>> {
    x.view()
        .into_dimensionality::<Ix4>()
        .map(|v| v.to_owned())
        .map_err(|_| RoutingError::shape(context, "[batch, channels, height, width]", x.shape()))
}

fn not_run(name: &str) -> RoutingError {
    RoutingError::Internal(format!("{name}: backward called before forward"))
}

/// 2D convolution, stride 1, square kernel, zero padding.
pub struct Conv2d {
    weight: Param,
    bias: Param,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    padding: usize,
    cached_padded: Option<Array4<f32>>,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let bound = fan_in_bound(in_channels * kernel * kernel);
        Self {
            weight: Param::uniform(&[out_channels, in_channels, kernel, kernel], bound, rng),
            bias: Param::uniform(&[out_channels], bound, rng),
            in_channels,
            out_channels,
            kernel,
            padding,
            cached_padded: None,
        }
    }

    fn pad(&self, x: &Array4<f32>) -> Array4<f32> {
        let (n, c, h, w) = x.dim();
        let p = self.padding;
        let mut padded = Array4::zeros((n, c, h + 2 * p, w + 2 * p));
        padded.slice_mut(s![.., .., p..p + h, p..p + w]).assign(x);
        padded
    }
}

impl Layer for Conv2d {
    fn name(&self) -> &str {
        "conv2d"
    }

    fn forward(&mut self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = as_images(x, "conv2d")?;
        if x.dim().1 != self.in_channels {
            return Err(RoutingError::shape("conv2d channels", self.in_channels, x.dim().1));
        }
        let padded = self.pad(&x);
        let (n, _, hp, wp) = padded.dim();
        let k = self.kernel;
        if hp < k || wp < k {
            return Err(RoutingError::shape("conv2d spatial", (k, k), (hp, wp)));
        }
        let (ho, wo) = (hp - k + 1, wp - k + 1);
        let weight = self.weight.value.view().into_dimensionality::<Ix4>()?;
        let bias = self.bias.value.view().into_dimensionality::<Ix1>()?;

        let mut out = Array4::zeros((n, self.out_channels, ho, wo));
        for b in 0..n {
            for o in 0..self.out_channels {
                let filter = weight.slice(s![o, .., .., ..]);
                for i in 0..ho {
                    for j in 0..wo {
                        let patch = padded.slice(s![b, .., i..i + k, j..j + k]);
                        out[[b, o, i, j]] = (&patch * &filter).sum() + bias[o];
                    }
                }
            }
        }
        self.cached_padded = Some(padded);
        Ok(out.into_dyn())
    }

    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let padded = self.cached_padded.as_ref().ok_or_else(|| not_run("conv2d"))?;
        let g = as_images(grad, "conv2d grad")?;
        let (n, c, hp, wp) = padded.dim();
        let k = self.kernel;
        let (ho, wo) = (hp - k + 1, wp - k + 1);
        if g.dim() != (n, self.out_channels, ho, wo) {
            return Err(RoutingError::shape("conv2d grad", (n, self.out_channels, ho, wo), g.dim()));
        }
        let weight = self.weight.value.view().into_dimensionality::<Ix4>()?.to_owned();

        let mut dw = Array4::<f32>::zeros(weight.raw_dim());
        let mut dpadded = Array4::<f32>::zeros((n, c, hp, wp));
        for b in 0..n {
            for o in 0..self.out_channels {
                let filter = weight.slice(s![o, .., .., ..]);
                for i in 0..ho {
                    for j in 0..wo {
                        let go = g[[b, o, i, j]];
                        if go == 0.0 {
                            continue;
                        }
                        let patch = padded.slice(s![b, .., i..i + k, j..j + k]);
                        dw.slice_mut(s![o, .., .., ..]).scaled_add(go, &patch);
                        dpadded
                            .slice_mut(s![b, .., i..i + k, j..j + k])
                            .scaled_add(go, &filter);
                    }
                }
            }
        }
        self.weight.grad += &dw.into_dyn();
        self.bias.grad += &g.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0)).into_dyn();

        let p = self.padding;
        let dx = dpadded
            .slice(s![.., .., p..hp - p, p..wp - p])
            .to_owned();
        Ok(dx.into_dyn())
    }

    fn visit_params(&mut self, f: &mut dyn FnMut(&mut Param)) {
        f(&mut self.weight);
        f(&mut self.bias);
    }
}

/// Non-overlapping max pooling (kernel = stride); trailing rows/columns are dropped.
pub struct MaxPool2d {
    kernel: usize,
    input_dim: Option<(usize, usize, usize, usize)>,
    winners: Vec<(usize, usize)>,
}

impl MaxPool2d {
    pub fn new(kernel: usize) -> Self {
        Self {
            kernel: kernel.max(1),
            input_dim: None,
            winners: Vec::new(),
        }
    }
}

impl Layer for MaxPool2d {
    fn name(&self) -> &str {
        "maxpool2d"
    }

    fn forward(&mut self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = as_images(x, "maxpool2d")?;
        let (n, c, h, w) = x.dim();
        let k = self.kernel;
        let (ho, wo) = (h / k, w / k);
        let mut out = Array4::zeros((n, c, ho, wo));
        self.winners.clear();
        self.winners.reserve(n * c * ho * wo);
        for b in 0..n {
            for ch in 0..c {
                for i in 0..ho {
                    for j in 0..wo {
                        let mut best = (i * k, j * k);
                        let mut best_v = f32::NEG_INFINITY;
                        for di in 0..k {
                            for dj in 0..k {
                                let v = x[[b, ch, i * k + di, j * k + dj]];
                                if v > best_v {
                                    best_v = v;
                                    best = (i * k + di, j * k + dj);
                                }
                            }
                        }
                        out[[b, ch, i, j]] = best_v;
                        self.winners.push(best);
                    }
                }
            }
        }
        self.input_dim = Some((n, c, h, w));
        Ok(out.into_dyn())
    }

    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let (n, c, h, w) = self.input_dim.ok_or_else(|| not_run("maxpool2d"))?;
        let g = as_images(grad, "maxpool2d grad")?;
        let (ho, wo) = (h / self.kernel, w / self.kernel);
        if g.dim() != (n, c, ho, wo) {
            return Err(RoutingError::shape("maxpool2d grad", (n, c, ho, wo), g.dim()));
        }
        let mut dx = Array4::zeros((n, c, h, w));
        let mut idx = 0;
        for b in 0..n {
            for ch in 0..c {
                for i in 0..ho {
                    for j in 0..wo {
                        let (wi, wj) = self.winners[idx];
                        dx[[b, ch, wi, wj]] += g[[b, ch, i, j]];
                        idx += 1;
                    }
                }
            }
        }
        Ok(dx.into_dyn())
    }
}

/// Batch normalisation over the channel axis.
pub struct BatchNorm2d {
    gamma: Param,
    beta: Param,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
    momentum: f32,
    eps: f32,
    training: bool,
    cache: Option<NormCache>,
}

struct NormCache {
    x_hat: Array4<f32>,
    inv_std: Array1<f32>,
    batch_stats: bool,
}

impl BatchNorm2d {
    pub fn new(channels: usize) -> Self {
        Self {
            gamma: Param::filled(&[channels], 1.0),
            beta: Param::zeros(&[channels]),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            momentum: 0.1,
            eps: 1e-5,
            training: true,
            cache: None,
        }
    }

    pub fn running_mean(&self) -> &Array1<f32> {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Array1<f32> {
        &self.running_var
    }
}

impl Layer for BatchNorm2d {
    fn name(&self) -> &str {
        "batchnorm2d"
    }

    fn forward(&mut self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = as_images(x, "batchnorm2d")?;
        let (n, c, h, w) = x.dim();
        if c != self.running_mean.len() {
            return Err(RoutingError::shape("batchnorm2d channels", self.running_mean.len(), c));
        }
        let count = (n * h * w) as f32;
        let batch_stats = self.training && n * h * w > 1;

        let (mean, var) = if batch_stats {
            let mean = x.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0)) / count;
            let mut var = Array1::<f32>::zeros(c);
            for ch in 0..c {
                let m = mean[ch];
                var[ch] = x
                    .index_axis(Axis(1), ch)
                    .iter()
                    .map(|v| (v - m) * (v - m))
                    .sum::<f32>()
                    / count;
            }
            let unbiased = &var * (count / (count - 1.0));
            self.running_mean = &self.running_mean * (1.0 - self.momentum) + &mean * self.momentum;
            self.running_var = &self.running_var * (1.0 - self.momentum) + unbiased * self.momentum;
            (mean, var)
        } else {
            (self.running_mean.clone(), self.running_var.clone())
        };

        let inv_std = var.mapv(|v| 1.0 / (v + self.eps).sqrt());
        let gamma = self.gamma.value.view().into_dimensionality::<Ix1>()?;
        let beta = self.beta.value.view().into_dimensionality::<Ix1>()?;

        let mut x_hat = x;
        let mut y = Array4::zeros((n, c, h, w));
        for ch in 0..c {
            let mut xc = x_hat.index_axis_mut(Axis(1), ch);
            xc.mapv_inplace(|v| (v - mean[ch]) * inv_std[ch]);
            y.index_axis_mut(Axis(1), ch)
                .assign(&xc.mapv(|v| v * gamma[ch] + beta[ch]));
        }
        self.cache = Some(NormCache {
            x_hat,
            inv_std,
            batch_stats,
        });
        Ok(y.into_dyn())
    }

    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let cache = self.cache.as_ref().ok_or_else(|| not_run("batchnorm2d"))?;
        let g = as_images(grad, "batchnorm2d grad")?;
        if g.dim() != cache.x_hat.dim() {
            return Err(RoutingError::shape("batchnorm2d grad", cache.x_hat.dim(), g.dim()));
        }
        let (n, c, h, w) = g.dim();
        let count = (n * h * w) as f32;
        let gamma = self.gamma.value.view().into_dimensionality::<Ix1>()?.to_owned();

        let mut dx = Array4::zeros((n, c, h, w));
        let mut dgamma = Array1::<f32>::zeros(c);
        let mut dbeta = Array1::<f32>::zeros(c);
        for ch in 0..c {
            let gc = g.index_axis(Axis(1), ch);
            let xh = cache.x_hat.index_axis(Axis(1), ch);
            let sum_g = gc.sum();
            let sum_gx = (&gc * &xh).sum();
            dgamma[ch] = sum_gx;
            dbeta[ch] = sum_g;

            let scale = gamma[ch] * cache.inv_std[ch];
            let mut dxc = dx.index_axis_mut(Axis(1), ch);
            if cache.batch_stats {
                // d/dx of (x - mean) / std with batch statistics
                dxc.assign(&((&gc * count - sum_g - &xh * sum_gx) * (scale / count)));
            } else {
                dxc.assign(&(&gc * scale));
            }
        }
        self.gamma.grad += &dgamma.into_dyn();
        self.beta.grad += &dbeta.into_dyn();
        Ok(dx.into_dyn())
    }

    fn visit_params(&mut self, f: &mut dyn FnMut(&mut Param)) {
        f(&mut self.gamma);
        f(&mut self.beta);
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

/// Conv 3x3 (padding 1) + ReLU + 2x2 max-pool.
pub struct SimpleConvBlock {
    inner: LayerStack,
}

impl SimpleConvBlock {
    pub fn new<R: Rng + ?Sized>(in_channels: usize, out_channels: usize, kernel: usize, rng: &mut R) -> Self {
        Self {
            inner: LayerStack::new(
                "conv_block",
                vec![
                    Box::new(Conv2d::new(in_channels, out_channels, kernel, 1, rng)),
                    Box::new(Relu::new()),
                    Box::new(MaxPool2d::new(2)),
                ],
            ),
        }
    }
}

impl Layer for SimpleConvBlock {
    fn name(&self) -> &str {
        "conv_block"
    }

    fn forward(&mut self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.inner.forward(x)
    }

    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.inner.backward(grad)
    }

    fn visit_params(&mut self, f: &mut dyn FnMut(&mut Param)) {
        self.inner.visit_params(f);
    }

    fn set_training(&mut self, training: bool) {
        self.inner.set_training(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_conv_same_padding_keeps_spatial_size() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut conv = Conv2d::new(2, 4, 3, 1, &mut rng);
        let x = ArrayD::<f32>::ones(IxDyn(&[3, 2, 5, 5]));
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.shape(), &[3, 4, 5, 5]);
        let dx = conv.backward(&ArrayD::ones(y.raw_dim())).unwrap();
        assert_eq!(dx.shape(), &[3, 2, 5, 5]);
    }

    #[test]
    fn test_conv_weight_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut conv = Conv2d::new(1, 1, 3, 1, &mut rng);
        let x = ArrayD::from_shape_fn(IxDyn(&[1, 1, 4, 4]), |d| (d[2] * 4 + d[3]) as f32 * 0.1);

        let y = conv.forward(&x).unwrap();
        conv.backward(&ArrayD::ones(y.raw_dim())).unwrap();
        let analytic = conv.weight.grad[[0, 0, 1, 1]];

        let eps = 1e-2;
        conv.weight.value[[0, 0, 1, 1]] += eps;
        let plus = conv.forward(&x).unwrap().sum();
        conv.weight.value[[0, 0, 1, 1]] -= 2.0 * eps;
        let minus = conv.forward(&x).unwrap().sum();
        let numeric = (plus - minus) / (2.0 * eps);
        assert!((analytic - numeric).abs() < 1e-2, "{analytic} vs {numeric}");
    }

    #[test]
    fn test_conv_rejects_wrong_channels() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut conv = Conv2d::new(3, 4, 3, 1, &mut rng);
        let x = ArrayD::<f32>::ones(IxDyn(&[1, 1, 5, 5]));
        assert!(conv.forward(&x).is_err());
    }

    #[test]
    fn test_maxpool_routes_gradient_to_winner() {
        let mut pool = MaxPool2d::new(2);
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![1.0, 4.0, 2.0, 3.0]).unwrap();
        let y = pool.forward(&x).unwrap();
        assert_eq!(y[[0, 0, 0, 0]], 4.0);
        let dx = pool.backward(&ArrayD::from_elem(IxDyn(&[1, 1, 1, 1]), 2.0)).unwrap();
        assert_eq!(dx.iter().copied().collect::<Vec<_>>(), vec![0.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_batchnorm_normalises_in_training() {
        let mut bn = BatchNorm2d::new(1);
        let x = ArrayD::from_shape_vec(IxDyn(&[2, 1, 1, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = bn.forward(&x).unwrap();
        assert!(y.sum().abs() < 1e-5);
        assert!(bn.running_mean()[0] > 0.0);
    }

    #[test]
    fn test_batchnorm_gradient_sums_to_zero_in_training() {
        let mut bn = BatchNorm2d::new(1);
        let x = ArrayD::from_shape_vec(IxDyn(&[2, 1, 1, 2]), vec![1.0, 2.0, 3.0, 5.0]).unwrap();
        bn.forward(&x).unwrap();
        let g = ArrayD::from_shape_vec(IxDyn(&[2, 1, 1, 2]), vec![0.1, -0.4, 0.3, 0.9]).unwrap();
        let dx = bn.backward(&g).unwrap();
        assert!(dx.sum().abs() < 1e-5);
    }

    #[test]
    fn test_batchnorm_eval_uses_running_stats() {
        let mut bn = BatchNorm2d::new(1);
        bn.set_training(false);
        let x = ArrayD::from_elem(IxDyn(&[1, 1, 1, 1]), 2.0);
        let y = bn.forward(&x).unwrap();
        // running mean 0, running var 1
        assert!((y[[0, 0, 0, 0]] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_conv_block_halves_resolution() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut block = SimpleConvBlock::new(1, 2, 3, &mut rng);
        let x = ArrayD::<f32>::ones(IxDyn(&[2, 1, 8, 8]));
        let y = block.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 2, 4, 4]);
        let mut params = 0;
        block.visit_params(&mut |p| params += p.len());
        assert_eq!(params, 2 * 9 + 2);
    }
}
