//! Block-sparse multi-head attention.
//!
//! ```text
//! VALIDATE -> SCALE -> SPARSE_QK -> MASK -> SOFTMAX -> DROPOUT -> SPARSE_AV -> RESTORE_DTYPE
//! ```
//!
//! Kernels are bound lazily to the device of the first call and rebuilt when a call
//! arrives on a different device.

use crate::{
    diagnostic::{Diagnostic, DiagnosticSink, TracingSink},
    error::{ConfigurationError, Error, Result, ShapeMismatch},
    kernel::{Device, KernelBackend, MatmulMode, Operand, SparseMatmul, SparseSoftmax, cpu::Cpu},
    layout::{BlockSize, Layout, Occupancy},
    mask::{AdditiveMask, layout_align},
    sparse::{Dense, SparseMatrix},
    tensor::{Elem, Tensor, dims, distinct, load, store},
};
use any_tensor::digit_layout::DigitLayout;
use half::f16;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone, Debug)]
pub struct BlockSparseCfg {
    /// Block occupancy, `(rows, cols)` shared by all heads or `(heads, rows, cols)`.
    pub layout: Occupancy,
    pub block_size: usize,
    /// Probability of zeroing an attention weight while training.
    pub dropout: f32,
    /// Only used to broadcast a 2-D layout.
    pub num_heads: usize,
    pub causal: bool,
    /// Seeds the dropout generator, entropy from the OS when absent.
    pub seed: Option<u64>,
}

impl BlockSparseCfg {
    pub fn new(layout: Occupancy) -> Self {
        Self {
            layout,
            block_size: 16,
            dropout: 0.,
            num_heads: 1,
            causal: false,
            seed: None,
        }
    }
}

/// What an attention variant accepts, for callers that pick between variants.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Capabilities {
    pub requires_head_dimension: bool,
    pub requires_same_k_q_dimensions: bool,
    pub supports_attention_mask: bool,
    pub supports_key_padding_mask: bool,
}

pub trait AttentionVariant {
    fn name(&self) -> &'static str;
    fn capabilities(&self) -> Capabilities;
}

/// One forward call. `q`, `k`, `v` and `o` are `(batch, heads, seq, head_dim)`,
/// `mask` is `(batch, 1 | heads, 1, seq)`, boolean or additive.
pub struct AttentionReq<'a> {
    pub q: Tensor<&'a [u8]>,
    pub k: Tensor<&'a [u8]>,
    pub v: Tensor<&'a [u8]>,
    pub o: Tensor<&'a mut [u8]>,
    pub mask: Option<Tensor<&'a [u8]>>,
    /// Softmax temperature, applied after the `1 / sqrt(head_dim)` scaling of `q`.
    pub scale: f32,
}

/// Gradients of one [`AttentionTape`], all shaped like the forward inputs.
pub struct GradReq<'a> {
    pub d_o: Tensor<&'a [u8]>,
    pub d_q: Tensor<&'a mut [u8]>,
    pub d_k: Tensor<&'a mut [u8]>,
    pub d_v: Tensor<&'a mut [u8]>,
}

/// Everything [`BlockSparseAttention::backward`] needs from a forward call.
pub struct AttentionTape {
    kernels: Arc<Kernels>,
    elem: Elem,
    shape: [usize; 4],
    q: Dense<f16>,
    k: Dense<f16>,
    v: Dense<f16>,
    probs: SparseMatrix,
    keep: Option<Vec<f32>>,
    scale: f32,
}

impl AttentionTape {
    /// Attention probabilities before dropout.
    pub fn probabilities(&self) -> &SparseMatrix {
        &self.probs
    }

    /// Per-element dropout factors, `0` or `1 / (1 - p)`, when dropout was applied.
    pub fn dropout_factors(&self) -> Option<&[f32]> {
        self.keep.as_deref()
    }

    pub fn device(&self) -> &Device {
        &self.kernels.device
    }
}

struct Kernels {
    device: Device,
    sdd: Box<dyn SparseMatmul>,
    dsd: Box<dyn SparseMatmul>,
    dsd_t: Box<dyn SparseMatmul>,
    softmax: Box<dyn SparseSoftmax>,
}

impl Kernels {
    fn new(
        backend: &dyn KernelBackend,
        layout: &Arc<Layout>,
        block: BlockSize,
        device: &Device,
    ) -> Self {
        Self {
            device: device.clone(),
            // q x kᵀ
            sdd: backend.sparse_matmul(layout, block, MatmulMode::Sdd, false, true, device),
            // p x v
            dsd: backend.sparse_matmul(layout, block, MatmulMode::Dsd, false, false, device),
            // pᵀ x do
            dsd_t: backend.sparse_matmul(layout, block, MatmulMode::Dsd, true, false, device),
            softmax: backend.sparse_softmax(layout, block, device),
        }
    }
}

enum KernelState {
    Uninitialized,
    Bound(Arc<Kernels>),
}

pub struct BlockSparseAttention {
    layout: Arc<Layout>,
    block: BlockSize,
    dropout: f32,
    causal: bool,
    training: bool,
    backend: Arc<dyn KernelBackend>,
    sink: Arc<dyn DiagnosticSink>,
    kernels: Mutex<KernelState>,
    rng: Mutex<StdRng>,
}

impl BlockSparseAttention {
    pub fn new(cfg: BlockSparseCfg) -> Result<Self> {
        Self::with_backend(cfg, Arc::new(Cpu), Arc::new(TracingSink))
    }

    pub fn with_backend(
        cfg: BlockSparseCfg,
        backend: Arc<dyn KernelBackend>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self> {
        let BlockSparseCfg {
            layout,
            block_size,
            dropout,
            num_heads,
            causal,
            seed,
        } = cfg;

        let block = BlockSize::new(block_size)?;
        if !(0. ..1.).contains(&dropout) {
            return Err(ConfigurationError::Dropout(dropout).into());
        }
        let layout = layout.into_layout(num_heads, &*sink)?;
        if causal && layout.row_blocks() != layout.col_blocks() {
            return Err(ConfigurationError::CausalNonSquare {
                rows: layout.row_blocks(),
                cols: layout.col_blocks(),
            }
            .into());
        }
        let rng = seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);

        tracing::debug!(
            shape = ?layout.shape(),
            nnz = layout.nnz(),
            block_size,
            causal,
            "block sparse attention configured"
        );
        Ok(Self {
            layout: Arc::new(layout),
            block,
            dropout,
            causal,
            training: true,
            backend,
            sink,
            kernels: Mutex::new(KernelState::Uninitialized),
            rng: Mutex::new(rng),
        })
    }

    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    pub const fn block_size(&self) -> BlockSize {
        self.block
    }

    pub const fn dropout(&self) -> f32 {
        self.dropout
    }

    pub const fn is_causal(&self) -> bool {
        self.causal
    }

    pub const fn training(&self) -> bool {
        self.training
    }

    /// Dropout only applies in training mode, which is the initial mode.
    pub fn train(&mut self, training: bool) {
        self.training = training
    }

    /// The device kernels are currently built for, if any call has bound them.
    pub fn bound_device(&self) -> Option<Device> {
        match &*self.kernels.lock().unwrap_or_else(PoisonError::into_inner) {
            KernelState::Uninitialized => None,
            KernelState::Bound(kernels) => Some(kernels.device.clone()),
        }
    }

    pub fn forward(&self, device: &Device, req: &mut AttentionReq) -> Result<()> {
        self.run(device, req).map(drop)
    }

    /// [`Self::forward`], keeping what [`Self::backward`] needs.
    pub fn forward_with_tape(
        &self,
        device: &Device,
        req: &mut AttentionReq,
    ) -> Result<AttentionTape> {
        self.run(device, req)
    }

    fn run(&self, device: &Device, req: &mut AttentionReq) -> Result<AttentionTape> {
        let _span = tracing::debug_span!("block_sparse_attention").entered();
        let AttentionReq {
            q,
            k,
            v,
            o,
            mask,
            scale,
        } = req;

        // VALIDATE
        let elem = float_elem(&[q.dt(), k.dt(), v.dt(), o.dt()])?;
        let shape = dims::<4>(q.shape(), "q")?;
        let [batch, heads, seq, head_dim] = shape;
        let seq_k = dims::<4>(k.shape(), "k")?[2];
        if seq_k != seq {
            return Err(ShapeMismatch::SeqLen { q: seq, k: seq_k }.into());
        }
        self.check_seq(heads, seq)?;
        for (name, tensor_shape) in [("k", k.shape()), ("v", v.shape()), ("o", o.shape())] {
            check_operand(name, shape, tensor_shape)?
        }
        let mask = mask
            .as_ref()
            .map(|mask| AdditiveMask::from_tensor(mask, &*self.sink))
            .transpose()?;
        if let Some(mask) = &mask {
            mask.validate(batch, heads, seq)?
        }

        let kernels = self.kernels(device);

        // SCALE
        if elem.wider_than_half() {
            self.sink
                .emit(&Diagnostic::PrecisionNarrowed { from: elem.name() })
        }
        let q = to_half(q, elem, shape, (head_dim as f32).sqrt().recip())?;
        let k = to_half(k, elem, shape, 1.)?;
        let v = to_half(v, elem, shape, 1.)?;

        // SPARSE_QK
        let mut probs = kernels
            .sdd
            .call(Operand::Dense(&q), Operand::Dense(&k))?
            .into_sparse()?;

        // MASK
        if let Some(mask) = &mask {
            probs.add_block_mask(&layout_align(mask, &self.layout, self.block, batch)?)
        }

        // SOFTMAX
        kernels.softmax.forward(&mut probs, *scale, self.causal)?;

        // DROPOUT
        let keep = self.dropout_factors(probs.data().len());
        let dropped = keep.as_deref().map(|keep| {
            let mut dropped = probs.clone();
            dropped.mul_assign(keep);
            dropped
        });

        // SPARSE_AV
        let out = kernels
            .dsd
            .call(
                Operand::Sparse(dropped.as_ref().unwrap_or(&probs)),
                Operand::Dense(&v),
            )?
            .into_dense()?;

        // RESTORE_DTYPE
        store(o, elem, shape, out.data());

        Ok(AttentionTape {
            kernels,
            elem,
            shape,
            q,
            k,
            v,
            probs,
            keep,
            scale: *scale,
        })
    }

    /// Gradients of the inputs of the forward call that produced `tape`.
    pub fn backward(&self, tape: &AttentionTape, req: &mut GradReq) -> Result<()> {
        let _span = tracing::debug_span!("block_sparse_attention_backward").entered();
        let GradReq { d_o, d_q, d_k, d_v } = req;
        let AttentionTape {
            kernels,
            elem,
            shape,
            q,
            k,
            v,
            probs,
            keep,
            scale,
        } = tape;

        if float_elem(&[d_o.dt(), d_q.dt(), d_k.dt(), d_v.dt()])? != *elem {
            return Err(Error::DTypeMismatch);
        }
        for (name, tensor_shape) in [
            ("d_o", d_o.shape()),
            ("d_q", d_q.shape()),
            ("d_k", d_k.shape()),
            ("d_v", d_v.shape()),
        ] {
            check_operand(name, *shape, tensor_shape)?
        }

        let d_o = to_half(d_o, *elem, *shape, 1.)?;
        let dropped = keep.as_deref().map(|keep| {
            let mut dropped = probs.clone();
            dropped.mul_assign(keep);
            dropped
        });

        // dv = wᵀ x do
        let dv = kernels
            .dsd_t
            .call(
                Operand::Sparse(dropped.as_ref().unwrap_or(probs)),
                Operand::Dense(&d_o),
            )?
            .into_dense()?;
        // dp = (do x vᵀ) * keep
        let mut ds = kernels
            .sdd
            .call(Operand::Dense(&d_o), Operand::Dense(v))?
            .into_sparse()?;
        if let Some(keep) = keep {
            ds.mul_assign(keep)
        }
        kernels.softmax.backward(probs, &mut ds, *scale)?;
        // dq = ds x k / sqrt(d), dk = dsᵀ x q / sqrt(d)
        let dq = kernels
            .dsd
            .call(Operand::Sparse(&ds), Operand::Dense(k))?
            .into_dense()?;
        let dk = kernels
            .dsd_t
            .call(Operand::Sparse(&ds), Operand::Dense(q))?
            .into_dense()?;

        let rsqrt = (shape[3] as f32).sqrt().recip();
        let dq = dq.data().iter().map(|x| x * rsqrt).collect::<Vec<_>>();
        store(d_q, *elem, *shape, &dq);
        store(d_k, *elem, *shape, dk.data());
        store(d_v, *elem, *shape, dv.data());
        Ok(())
    }

    fn check_seq(&self, heads: usize, seq: usize) -> Result<(), ShapeMismatch> {
        let bs = self.block.get();
        if seq % bs != 0 {
            return Err(ShapeMismatch::NotBlockMultiple { seq, block: bs });
        }
        for expected in [self.layout.row_blocks() * bs, self.layout.col_blocks() * bs] {
            if seq != expected {
                return Err(ShapeMismatch::LayoutSeq { seq, expected });
            }
        }
        if heads != self.layout.heads() {
            return Err(ShapeMismatch::Heads {
                heads,
                layout_heads: self.layout.heads(),
            });
        }
        Ok(())
    }

    fn kernels(&self, device: &Device) -> Arc<Kernels> {
        let mut state = self.kernels.lock().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            KernelState::Bound(kernels) if kernels.device == *device => return kernels.clone(),
            KernelState::Bound(kernels) => {
                tracing::debug!(from = ?kernels.device, to = ?device, "rebinding kernels")
            }
            KernelState::Uninitialized => tracing::debug!(?device, "binding kernels"),
        }
        let kernels = Arc::new(Kernels::new(&*self.backend, &self.layout, self.block, device));
        *state = KernelState::Bound(kernels.clone());
        kernels
    }

    fn dropout_factors(&self, len: usize) -> Option<Vec<f32>> {
        if !self.training || self.dropout == 0. {
            return None;
        }
        let p = self.dropout as f64;
        let kept = (1. - self.dropout).recip();
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Some(
            (0..len)
                .map(|_| if rng.random_bool(p) { 0. } else { kept })
                .collect(),
        )
    }
}

impl AttentionVariant for BlockSparseAttention {
    fn name(&self) -> &'static str {
        "blocksparse"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_head_dimension: true,
            requires_same_k_q_dimensions: true,
            supports_attention_mask: true,
            supports_key_padding_mask: false,
        }
    }
}

/// The one float encoding shared by every tensor of a call.
fn float_elem(dts: &[DigitLayout]) -> Result<Elem> {
    let dt = distinct(dts).ok_or(Error::DTypeMismatch)?;
    Elem::of(dt)
        .filter(|elem| elem.is_float())
        .ok_or(Error::UnsupportedDType { tensor: "q", dt })
}

fn check_operand(
    tensor: &'static str,
    expected: [usize; 4],
    actual: &[usize],
) -> Result<(), ShapeMismatch> {
    if actual == expected {
        Ok(())
    } else {
        Err(ShapeMismatch::Operand {
            tensor,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

fn to_half(
    tensor: &Tensor<&[u8]>,
    elem: Elem,
    shape: [usize; 4],
    scale: f32,
) -> Result<Dense<f16>, ShapeMismatch> {
    let data = load(tensor, elem, shape)
        .into_iter()
        .map(|x| f16::from_f32(x * scale))
        .collect();
    Dense::from_vec(shape, data)
}

#[cfg(test)]
mod reference;
