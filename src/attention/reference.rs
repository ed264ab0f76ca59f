//! Dense attention in f64, inactive blocks at -inf.

use crate::layout::Layout;
use std::iter::zip;

pub struct Problem<'a> {
    /// `[batch, heads, seq, head_dim]`
    pub shape: [usize; 4],
    pub q: &'a [f64],
    pub k: &'a [f64],
    pub v: &'a [f64],
    pub layout: &'a Layout,
    pub block: usize,
    /// Additive, `[batch, 1 | heads, seq]`.
    pub mask: Option<(&'a [f64], usize)>,
    pub causal: bool,
    pub scale: f64,
}

pub struct Forward {
    /// `[batch, heads, seq, seq]`
    pub probs: Vec<f64>,
    pub out: Vec<f64>,
}

pub struct Grads {
    pub dq: Vec<f64>,
    pub dk: Vec<f64>,
    pub dv: Vec<f64>,
}

impl Problem<'_> {
    fn visible(&self, head: usize, i: usize, j: usize) -> bool {
        let (row, col) = (i / self.block, j / self.block);
        self.layout.is_active(head, row, col) && !(self.causal && col > row)
    }

    pub fn forward(&self) -> Forward {
        let [b, h, s, d] = self.shape;
        let rsqrt = (d as f64).sqrt().recip();
        let mut probs = vec![0.; b * h * s * s];
        let mut out = vec![0.; b * h * s * d];
        for z in 0..b {
            for hi in 0..h {
                let base = (z * h + hi) * s;
                for i in 0..s {
                    let row = &mut probs[(base + i) * s..][..s];
                    let q = &self.q[(base + i) * d..][..d];
                    for (j, x) in row.iter_mut().enumerate() {
                        if !self.visible(hi, i, j) {
                            *x = f64::NEG_INFINITY;
                            continue;
                        }
                        let k = &self.k[(base + j) * d..][..d];
                        let mut score = zip(q, k).map(|(q, k)| q * rsqrt * k).sum::<f64>();
                        if let Some((mask, mh)) = self.mask {
                            score += mask[(z * mh + hi % mh) * s + j]
                        }
                        *x = score * self.scale
                    }
                    softmax(row);

                    let o = &mut out[(base + i) * d..][..d];
                    for (j, &p) in row.iter().enumerate() {
                        let v = &self.v[(base + j) * d..][..d];
                        zip(&mut *o, v).for_each(|(o, v)| *o += p * v)
                    }
                }
            }
        }
        Forward { probs, out }
    }

    pub fn backward(&self, fwd: &Forward, d_o: &[f64]) -> Grads {
        let [b, h, s, d] = self.shape;
        let rsqrt = (d as f64).sqrt().recip();
        let mut dq = vec![0.; b * h * s * d];
        let mut dk = vec![0.; b * h * s * d];
        let mut dv = vec![0.; b * h * s * d];
        for z in 0..b {
            for hi in 0..h {
                let base = (z * h + hi) * s;
                for i in 0..s {
                    let p = &fwd.probs[(base + i) * s..][..s];
                    let go = &d_o[(base + i) * d..][..d];
                    let dp = (0..s)
                        .map(|j| {
                            let v = &self.v[(base + j) * d..][..d];
                            zip(go, v).map(|(g, v)| g * v).sum::<f64>()
                        })
                        .collect::<Vec<_>>();
                    let dot = zip(p, &dp).map(|(p, dp)| p * dp).sum::<f64>();
                    for j in 0..s {
                        let ds = self.scale * p[j] * (dp[j] - dot);
                        for t in 0..d {
                            dv[(base + j) * d + t] += p[j] * go[t];
                            dq[(base + i) * d + t] += ds * self.k[(base + j) * d + t] * rsqrt;
                            dk[(base + j) * d + t] += ds * self.q[(base + i) * d + t] * rsqrt
                        }
                    }
                }
            }
        }
        Grads { dq, dk, dv }
    }
}

/// A row without any visible column is all zeros.
fn softmax(row: &mut [f64]) {
    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        row.fill(0.);
        return;
    }
    let mut sum = 0.;
    for x in &mut *row {
        *x = (*x - max).exp();
        sum += *x
    }
    row.iter_mut().for_each(|x| *x /= sum)
}

#[test]
fn test_backward_against_finite_difference() {
    use crate::{diagnostic::Recorder, layout::Occupancy};

    fn problem<'a>(qkv: &'a [Vec<f64>; 3], layout: &'a Layout, mask: &'a [f64]) -> Problem<'a> {
        Problem {
            shape: [1, 1, 4, 3],
            q: &qkv[0],
            k: &qkv[1],
            v: &qkv[2],
            layout,
            block: 2,
            mask: Some((mask, 1)),
            causal: false,
            scale: 0.8,
        }
    }

    fn random() -> Vec<f64> {
        (0..12).map(|_| rand::random::<f64>() * 2. - 1.).collect()
    }

    let layout = Occupancy::new(&[1, 2, 2], [true, false, true, true])
        .unwrap()
        .into_layout(1, &Recorder::default())
        .unwrap();
    let qkv = [random(), random(), random()];
    let w = random();
    let mask = [0., -0.5, 0., 0.3];
    // loss = Σ w · out
    let loss = |qkv: &[Vec<f64>; 3]| {
        let out = problem(qkv, &layout, &mask).forward().out;
        zip(&out, &w).map(|(o, w)| o * w).sum::<f64>()
    };

    let p = problem(&qkv, &layout, &mask);
    let Grads { dq, dk, dv } = p.backward(&p.forward(), &w);

    let eps = 1e-6;
    for (which, analytic) in [dq, dk, dv].into_iter().enumerate() {
        for i in 0..12 {
            let mut inputs = qkv.clone();
            inputs[which][i] += eps;
            let hi = loss(&inputs);
            inputs[which][i] -= 2. * eps;
            let lo = loss(&inputs);
            let numeric = (hi - lo) / (2. * eps);
            assert!(
                (numeric - analytic[i]).abs() < 1e-6,
                "input {which}[{i}]: {numeric} vs {}",
                analytic[i]
            )
        }
    }
}
