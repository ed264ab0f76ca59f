//! What the attention module needs from a block-sparse kernel provider.
//!
//! Providers hand out kernel objects bound to one layout, block size and device.
//! Every call is synchronous: whatever parallelism a kernel uses internally,
//! the result is complete when the call returns.

pub mod cpu;

use crate::{
    error::KernelError,
    layout::{BlockSize, Layout},
    sparse::{Dense, SparseMatrix},
};
use half::f16;
use std::{fmt, sync::Arc};

/// Where kernels execute.
#[derive(Clone, Debug, Default)]
pub enum Device {
    /// The global rayon pool.
    #[default]
    Cpu,
    /// A dedicated rayon pool, identified by the pool itself.
    ThreadPool(Arc<rayon::ThreadPool>),
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cpu, Self::Cpu) => true,
            (Self::ThreadPool(a), Self::ThreadPool(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Device {}

impl Device {
    /// Runs `op` with this device's pool as the ambient rayon pool.
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match self {
            Self::Cpu => op(),
            Self::ThreadPool(pool) => pool.install(op),
        }
    }
}

/// Which operand (or the result) of a product is block-sparse.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MatmulMode {
    /// dense x dense -> sparse, only active blocks are computed.
    Sdd,
    /// sparse x dense -> dense.
    Dsd,
    /// dense x sparse -> dense.
    Dds,
}

impl MatmulMode {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sdd => "sdd",
            Self::Dsd => "dsd",
            Self::Dds => "dds",
        }
    }
}

impl fmt::Display for MatmulMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Input of a sparse matmul. Dense operands are half precision.
#[derive(Clone, Copy, Debug)]
pub enum Operand<'a> {
    Dense(&'a Dense<f16>),
    Sparse(&'a SparseMatrix),
}

/// Output of a sparse matmul. Dense results keep the f32 accumulator.
#[derive(Clone, Debug)]
pub enum Product {
    Dense(Dense<f32>),
    Sparse(SparseMatrix),
}

impl Product {
    pub fn into_dense(self) -> Result<Dense<f32>, KernelError> {
        match self {
            Self::Dense(d) => Ok(d),
            Self::Sparse(_) => Err(KernelError::Product { expected: "dense" }),
        }
    }

    pub fn into_sparse(self) -> Result<SparseMatrix, KernelError> {
        match self {
            Self::Sparse(s) => Ok(s),
            Self::Dense(_) => Err(KernelError::Product { expected: "sparse" }),
        }
    }
}

/// Factory for kernels bound to a fixed layout, block size and device.
pub trait KernelBackend: Send + Sync {
    /// `op(a) x op(b)` where `op` transposes the last two dimensions when asked.
    ///
    /// The layout describes the sparse operand (or result) as stored, before any transpose.
    fn sparse_matmul(
        &self,
        layout: &Arc<Layout>,
        block: BlockSize,
        mode: MatmulMode,
        trans_a: bool,
        trans_b: bool,
        device: &Device,
    ) -> Box<dyn SparseMatmul>;

    fn sparse_softmax(
        &self,
        layout: &Arc<Layout>,
        block: BlockSize,
        device: &Device,
    ) -> Box<dyn SparseSoftmax>;
}

pub trait SparseMatmul: Send + Sync {
    fn call(&self, a: Operand, b: Operand) -> Result<Product, KernelError>;
}

pub trait SparseSoftmax: Send + Sync {
    /// In place `softmax(scale * x)` over the active columns of every row.
    ///
    /// With `is_causal`, blocks above the block diagonal are dropped before normalizing.
    /// A row left without any column becomes all zeros.
    fn forward(&self, x: &mut SparseMatrix, scale: f32, is_causal: bool) -> Result<(), KernelError>;

    /// Turns `grad` from the gradient w.r.t. `probs` into the gradient w.r.t. the scores.
    fn backward(
        &self,
        probs: &SparseMatrix,
        grad: &mut SparseMatrix,
        scale: f32,
    ) -> Result<(), KernelError>;
}
