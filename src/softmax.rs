//! READ: <https://zhuanlan.zhihu.com/p/11656282335>

use num_traits::Float;
use std::iter::zip;

/// Single-pass softmax.
pub fn online_softmax<T: Float>(data: &mut [T]) {
    segmented_softmax(&mut [data], T::one())
}

/// Softmax of `scale * x` over the concatenation of `segments`.
///
/// A row of a block-sparse matrix is scattered over the tiles of its row block;
/// each tile contributes one segment. An empty row stays empty.
pub fn segmented_softmax<T: Float>(segments: &mut [&mut [T]], scale: T) {
    // 一次遍历，同时确定最大值和指数和
    let mut s = S::empty();
    for seg in &*segments {
        for &x in seg.iter() {
            s.update(x * scale)
        }
    }

    let S {
        current_max: max,
        sum_exp: sum,
    } = s;
    if sum == T::zero() {
        return;
    }

    // 归一化
    for seg in segments {
        for x in seg.iter_mut() {
            *x = (*x * scale - max).exp() / sum
        }
    }
}

/// Backward of [`segmented_softmax`]: turns `dp` (gradient w.r.t. the probabilities `p`)
/// into the gradient w.r.t. the inputs, in place.
pub fn segmented_softmax_backward<T: Float>(p: &[&[T]], dp: &mut [&mut [T]], scale: T) {
    let mut dot = T::zero();
    for (p, dp) in zip(p, &*dp) {
        dot = zip(*p, dp.iter()).fold(dot, |acc, (&p, &dp)| acc + p * dp)
    }
    for (p, dp) in zip(p, dp) {
        for (&p, dp) in zip(*p, dp.iter_mut()) {
            *dp = scale * p * (*dp - dot)
        }
    }
}

struct S<T> {
    current_max: T,
    sum_exp: T,
}

impl<T: Float> S<T> {
    fn empty() -> Self {
        Self {
            current_max: T::neg_infinity(),
            sum_exp: T::zero(),
        }
    }

    /// 根据新元素更新 softmax 状态
    fn update(&mut self, x: T) {
        if x == T::neg_infinity() {
            return;
        }
        self.sum_exp = if x > self.current_max {
            let old_max = std::mem::replace(&mut self.current_max, x);
            self.sum_exp * (old_max - x).exp() + T::one()
        } else {
            self.sum_exp + (x - self.current_max).exp()
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::iter::zip;

    #[test]
    fn test_online_softmax() {
        let data: Vec<f64> = (0..4096)
            .map(|_| (rand::random::<f64>() - 0.5) * 20.)
            .collect();

        // 计算标准 softmax
        let mut ans = data.clone();
        safe_softmax(&mut ans);

        // 计算 online softmax
        let mut data = data;
        online_softmax(&mut data);

        for (ans, res) in zip(ans, data) {
            assert!((ans - res).abs() < f64::EPSILON)
        }
    }

    #[test]
    fn test_segments_match_whole_row() {
        let data: Vec<f32> = (0..96).map(|_| rand::random::<f32>() * 8. - 4.).collect();
        let scale = 0.3f32;

        let mut ans = data.iter().map(|&x| x * scale).collect::<Vec<_>>();
        safe_softmax(&mut ans);

        let mut res = data.clone();
        {
            let (a, rest) = res.split_at_mut(16);
            let (b, c) = rest.split_at_mut(48);
            segmented_softmax(&mut [a, b, c], scale);
        }
        for (ans, res) in zip(ans, res) {
            assert!((ans - res).abs() < 1e-6)
        }
    }

    #[test]
    fn test_empty_row() {
        let mut segments: [&mut [f32]; 0] = [];
        segmented_softmax(&mut segments, 1.)
    }

    #[test]
    fn test_backward_against_finite_difference() {
        let x: Vec<f64> = (0..12).map(|_| rand::random::<f64>() * 4. - 2.).collect();
        let w: Vec<f64> = (0..12).map(|_| rand::random::<f64>()).collect();
        let scale = 0.7;
        // loss = Σ w · softmax(scale · x)
        let loss = |x: &[f64]| {
            let mut p = x.to_vec();
            segmented_softmax(&mut [&mut p[..]], scale);
            zip(&p, &w).map(|(p, w)| p * w).sum::<f64>()
        };

        let mut p = x.clone();
        segmented_softmax(&mut [&mut p[..]], scale);
        let mut grad = w.clone();
        {
            let (g0, g1) = grad.split_at_mut(5);
            let (p0, p1) = p.split_at(5);
            segmented_softmax_backward(&[p0, p1], &mut [g0, g1], scale);
        }

        let eps = 1e-6;
        for i in 0..x.len() {
            let mut hi = x.clone();
            let mut lo = x.clone();
            hi[i] += eps;
            lo[i] -= eps;
            let numeric = (loss(&hi) - loss(&lo)) / (2. * eps);
            assert!((numeric - grad[i]).abs() < 1e-6, "{numeric} vs {}", grad[i])
        }
    }

    /// 标准 softmax 实现
    pub fn safe_softmax<T: Float>(data: &mut [T]) {
        // 找到最大值以提高数值稳定性
        let mut max = T::neg_infinity();
        for &x in &*data {
            max = max.max(x)
        }

        // 计算指数并求和
        let mut sum = T::zero();
        for x in &mut *data {
            *x = (*x - max).exp();
            sum = sum + *x
        }

        // 归一化
        for x in data {
            *x = *x / sum
        }
    }
}
