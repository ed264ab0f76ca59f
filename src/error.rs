use any_tensor::digit_layout::DigitLayout;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatch),
    #[error("unsupported data type {dt:?} for {tensor}")]
    UnsupportedDType {
        tensor: &'static str,
        dt: DigitLayout,
    },
    #[error("q, k, v and output must share one data type")]
    DTypeMismatch,
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Rejected at construction, before any forward call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("block size {0} is not supported, expected one of 16, 32, 64, 128")]
    UnsupportedBlockSize(usize),
    #[error("layout must have 2 or 3 dimensions, got {0}")]
    LayoutRank(usize),
    #[error("layout of shape {shape:?} needs {expected} cells, got {actual}")]
    LayoutLen {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("layout has an empty dimension: {0:?}")]
    EmptyLayout(Vec<usize>),
    #[error("causal attention needs a square block layout, got {rows}x{cols} blocks")]
    CausalNonSquare { rows: usize, cols: usize },
    #[error("dropout probability {0} is outside [0, 1)")]
    Dropout(f32),
    #[error("head count must be positive")]
    ZeroHeads,
}

/// Input tensors disagree with each other or with the layout.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShapeMismatch {
    #[error("{tensor} must have {expected} dimensions, got {actual:?}")]
    Rank {
        tensor: &'static str,
        expected: usize,
        actual: Vec<usize>,
    },
    #[error("{tensor} has shape {actual:?}, expected {expected:?}")]
    Operand {
        tensor: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("block sparse attention needs q and k of the same length, got {q} and {k}")]
    SeqLen { q: usize, k: usize },
    #[error("sequence length {seq} must be a multiple of block size {block}")]
    NotBlockMultiple { seq: usize, block: usize },
    #[error("sequence length {seq} is inconsistent with the layout, expected {expected}")]
    LayoutSeq { seq: usize, expected: usize },
    #[error("{heads} heads given but the layout has {layout_heads}")]
    Heads { heads: usize, layout_heads: usize },
    #[error("mask of shape {mask:?} does not fit batch {batch}, heads {heads}, sequence {seq}")]
    Mask {
        mask: Vec<usize>,
        batch: usize,
        heads: usize,
        seq: usize,
    },
}

/// Raised by a kernel provider when called with operands it was not built for.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("{mode} kernel expects {expected} operands")]
    Operands {
        mode: &'static str,
        expected: &'static str,
    },
    #[error("kernel returned the wrong kind of result, expected {expected}")]
    Product { expected: &'static str },
    #[error("{mode} kernel was built for a different layout or block size")]
    Layout { mode: &'static str },
    #[error("{mode} kernel: {what} is {actual}, expected {expected}")]
    Dim {
        mode: &'static str,
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}
