mod attention;
mod diagnostic;
mod error;
mod layout;
mod mask;
mod softmax;
mod sparse;
mod tensor;

pub mod kernel;

pub use attention::{
    AttentionReq, AttentionTape, AttentionVariant, BlockSparseAttention, BlockSparseCfg,
    Capabilities, GradReq,
};
pub use diagnostic::{Diagnostic, DiagnosticSink, Recorder, TracingSink};
pub use error::{ConfigurationError, Error, KernelError, Result, ShapeMismatch};
pub use layout::{BlockCoord, BlockSize, GatherIndices, Layout, Occupancy};
pub use mask::{AdditiveMask, BlockMask, MASKED, layout_align, to_additive};
pub use softmax::{online_softmax, segmented_softmax, segmented_softmax_backward};
pub use sparse::{Dense, SparseMatrix};
pub use tensor::Tensor;
