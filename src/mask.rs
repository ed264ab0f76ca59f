//! Turns per-token attention masks into per-block additive masks.
//!
//! Masks here depend on the key position only, so one `block_size` slice of the
//! mask serves every row of the tile it is gathered for.

use crate::{
    diagnostic::{Diagnostic, DiagnosticSink},
    error::{Error, Result, ShapeMismatch},
    layout::{BlockSize, Layout},
    tensor::{Elem, Tensor, dims, load},
};

/// Added to masked-out scores. Finite, so sums with finite scores never become NaN,
/// and far enough below any score that its softmax weight underflows to zero in f32.
///
/// The mask is added to the raw scores and the softmax `scale` multiplies the sum,
/// so the effective offset is `MASKED * scale`. A very small `scale` weakens the
/// suppression accordingly.
pub const MASKED: f32 = -1e6;

/// Maps `true` (keep) to `0` and `false` to [`MASKED`].
pub fn to_additive(keep: impl IntoIterator<Item = bool>) -> Vec<f32> {
    keep.into_iter()
        .map(|keep| if keep { 0. } else { MASKED })
        .collect()
}

/// Additive mask of logical shape `(batch, heads, 1, seq)`, `heads` being 1 or the head count.
#[derive(Clone, Debug, PartialEq)]
pub struct AdditiveMask {
    shape: [usize; 3],
    data: Vec<f32>,
}

impl AdditiveMask {
    /// `shape` is `[batch, heads, seq]`.
    pub fn new(shape: [usize; 3], data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.iter().product::<usize>() {
            let [b, h, s] = shape;
            return Err(ShapeMismatch::Operand {
                tensor: "mask",
                expected: vec![b, h, 1, s],
                actual: vec![data.len()],
            }
            .into());
        }
        Ok(Self { shape, data })
    }

    pub fn from_bool(shape: [usize; 3], keep: impl IntoIterator<Item = bool>) -> Result<Self> {
        Self::new(shape, to_additive(keep))
    }

    /// Reads a `(batch, heads, 1, seq)` tensor, converting boolean masks to additive form.
    pub fn from_tensor(tensor: &Tensor<&[u8]>, sink: &dyn DiagnosticSink) -> Result<Self> {
        let dt = tensor.dt();
        let elem = Elem::of(dt)
            .filter(|e| e.is_float() || *e == Elem::Bool)
            .ok_or(Error::UnsupportedDType { tensor: "mask", dt })?;
        let shape = dims::<4>(tensor.shape(), "mask")?;
        let [b, h, one, s] = shape;
        if one != 1 {
            return Err(ShapeMismatch::Operand {
                tensor: "mask",
                expected: vec![b, h, 1, s],
                actual: shape.to_vec(),
            }
            .into());
        }

        let values = load(tensor, elem, shape);
        let data = if elem == Elem::Bool {
            sink.emit(&Diagnostic::MaskConverted { shape });
            to_additive(values.into_iter().map(|x| x != 0.))
        } else {
            values
        };
        Ok(Self {
            shape: [b, h, s],
            data,
        })
    }

    /// `[batch, heads, seq]`
    pub const fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Repeats a head-shared mask across `heads`.
    pub fn expand_heads(&self, heads: usize) -> Result<Self, ShapeMismatch> {
        let [b, h, s] = self.shape;
        if h == heads {
            return Ok(self.clone());
        }
        if h != 1 {
            return Err(ShapeMismatch::Mask {
                mask: vec![b, h, 1, s],
                batch: b,
                heads,
                seq: s,
            });
        }
        let data = self
            .data
            .chunks_exact(s)
            .flat_map(|row| row.repeat(heads))
            .collect();
        Ok(Self {
            shape: [b, heads, s],
            data,
        })
    }

    /// Checks the mask against the `(batch, heads, seq)` it is going to be applied to.
    pub fn validate(&self, batch: usize, heads: usize, seq: usize) -> Result<(), ShapeMismatch> {
        let [b, h, s] = self.shape;
        if b == batch && (h == 1 || h == heads) && s == seq {
            Ok(())
        } else {
            Err(ShapeMismatch::Mask {
                mask: vec![b, h, 1, s],
                batch,
                heads,
                seq,
            })
        }
    }
}

/// Column masks for every active block, `[batch, nnz, block_size]`.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockMask {
    shape: [usize; 3],
    data: Vec<f32>,
}

impl BlockMask {
    /// `[batch, nnz, block_size]`
    pub const fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// One `block_size` slice per `(batch, block)`, in storage order.
    pub fn rows(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.shape[2])
    }
}

/// Gathers the mask slices of every active block, in the layout's block order.
///
/// The `(heads, seq)` part of the mask is viewed as `(heads * seq / block_size, block_size)`,
/// one row per `(head, col_block)`, and rows are picked with the layout's
/// `broadcast_to_gather` for a head-shared mask or `to_gather` otherwise.
pub fn layout_align(
    mask: &AdditiveMask,
    layout: &Layout,
    block: BlockSize,
    batch: usize,
) -> Result<BlockMask, ShapeMismatch> {
    let bs = block.get();
    let seq = layout.col_blocks() * bs;
    mask.validate(batch, layout.heads(), seq)?;

    let [b, h, s] = mask.shape;
    let gather = layout.gather();
    let indices = if h == 1 {
        &gather.broadcast_to_gather
    } else {
        &gather.to_gather
    };

    let per_batch = h * s;
    let mut data = Vec::with_capacity(b * indices.len() * bs);
    for chunks in mask.data.chunks_exact(per_batch) {
        for &row in indices.iter() {
            data.extend_from_slice(&chunks[row * bs..][..bs])
        }
    }
    Ok(BlockMask {
        shape: [b, indices.len(), bs],
        data,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        diagnostic::Recorder,
        kernel::{Device, KernelBackend, cpu::Cpu},
        layout::Occupancy,
        sparse::SparseMatrix,
    };
    use any_tensor::digit_layout::types;
    use std::sync::Arc;

    fn layout(heads: usize) -> Layout {
        // 2 x 2 blocks, head h drops block (0, h % 2)
        let cells = (0..heads).flat_map(|h| [h % 2 != 0, h % 2 == 0, true, true]);
        Occupancy::new(&[heads, 2, 2], cells)
            .unwrap()
            .into_layout(heads, &Recorder::default())
            .unwrap()
    }

    #[test]
    fn test_to_additive() {
        assert_eq!(to_additive([true, false, true]), [0., MASKED, 0.]);
        assert!((MASKED + 1e4).is_finite());
        assert_eq!((MASKED - 1e4).exp(), 0.)
    }

    #[test]
    fn test_bool_tensor_is_converted_with_diagnostic() {
        let keep = [1u8, 0, 1, 1];
        let tensor = Tensor::from_dim_slice(types::Bool, [1, 1, 1, 4]).map(|_| &keep[..]);
        let sink = Recorder::default();
        let mask = AdditiveMask::from_tensor(&tensor, &sink).unwrap();
        assert_eq!(mask.shape(), [1, 1, 4]);
        assert_eq!(mask.data(), [0., MASKED, 0., 0.]);
        assert_eq!(
            sink.take(),
            [Diagnostic::MaskConverted {
                shape: [1, 1, 1, 4],
            }]
        );

        let values = [0f32, -1e4, 0., 0.];
        let bytes: Vec<u8> = values.iter().flat_map(|x| x.to_ne_bytes()).collect();
        let tensor = Tensor::from_dim_slice(types::F32, [1, 1, 1, 4]).map(|_| &*bytes);
        let mask = AdditiveMask::from_tensor(&tensor, &sink).unwrap();
        assert_eq!(mask.data(), values);
        assert!(sink.take().is_empty())
    }

    #[test]
    fn test_per_head_gather() {
        let block = BlockSize::new(16).unwrap();
        let layout = layout(2);
        // value = head * 1000 + token
        let mask = AdditiveMask::new(
            [1, 2, 32],
            (0..64).map(|i| (i / 32 * 1000 + i % 32) as f32).collect(),
        )
        .unwrap();
        let aligned = layout_align(&mask, &layout, block, 1).unwrap();
        assert_eq!(aligned.shape(), [1, 6, 16]);

        // head 0 blocks: (0,1) (1,0) (1,1); head 1 blocks: (0,0) (1,0) (1,1)
        let firsts = aligned.rows().map(|r| r[0]).collect::<Vec<_>>();
        assert_eq!(firsts, [16., 0., 16., 1000., 1000., 1016.]);
        for row in aligned.rows() {
            assert!(row.windows(2).all(|w| w[1] == w[0] + 1.))
        }
    }

    #[test]
    fn test_broadcast_equals_expanded() {
        let block = BlockSize::new(16).unwrap();
        let layout = layout(4);
        let shared = AdditiveMask::from_bool([2, 1, 32], (0..64).map(|i| i % 3 != 0)).unwrap();
        let expanded = shared.expand_heads(4).unwrap();
        assert_eq!(expanded.shape(), [2, 4, 32]);
        assert_eq!(expanded.expand_heads(4).unwrap(), expanded);

        let a = layout_align(&shared, &layout, block, 2).unwrap();
        let b = layout_align(&expanded, &layout, block, 2).unwrap();
        assert_eq!(a, b)
    }

    #[test]
    fn test_shape_errors() {
        let block = BlockSize::new(16).unwrap();
        let layout = layout(4);
        for (shape, batch) in [([2, 1, 32], 3), ([2, 3, 32], 2), ([2, 4, 48], 2)] {
            let mask = AdditiveMask::new(shape, vec![0.; shape.iter().product()]).unwrap();
            assert!(matches!(
                layout_align(&mask, &layout, block, batch),
                Err(ShapeMismatch::Mask { .. })
            ))
        }

        let keep = [1u8; 8];
        let tensor = Tensor::from_dim_slice(types::Bool, [1, 1, 2, 4]).map(|_| &keep[..]);
        assert!(matches!(
            AdditiveMask::from_tensor(&tensor, &Recorder::default()),
            Err(Error::ShapeMismatch(ShapeMismatch::Operand { tensor: "mask", .. }))
        ));
        let tensor = Tensor::from_dim_slice(types::Bool, [1, 8]).map(|_| &keep[..]);
        assert!(matches!(
            AdditiveMask::from_tensor(&tensor, &Recorder::default()),
            Err(Error::ShapeMismatch(ShapeMismatch::Rank { .. }))
        ))
    }

    #[test]
    fn test_expand_per_head_mask() {
        let mask = AdditiveMask::new([1, 2, 16], vec![0.; 32]).unwrap();
        assert_eq!(
            mask.expand_heads(3),
            Err(ShapeMismatch::Mask {
                mask: vec![1, 2, 1, 16],
                batch: 1,
                heads: 3,
                seq: 16,
            })
        )
    }

    #[test]
    fn test_offset_is_scaled_with_scores() {
        let block = BlockSize::new(16).unwrap();
        let layout = Arc::new(
            Occupancy::ones(&[1, 1, 1])
                .unwrap()
                .into_layout(1, &Recorder::default())
                .unwrap(),
        );
        let mask = AdditiveMask::from_bool([1, 1, 16], (0..16).map(|i| i != 0)).unwrap();
        let aligned = layout_align(&mask, &layout, block, 1).unwrap();
        let softmax = Cpu.sparse_softmax(&layout, block, &Device::Cpu);

        // zero scores, so only the scaled offset separates column 0 from the rest
        let weak = (-1f32).exp() / ((-1f32).exp() + 15.);
        for (scale, masked) in [(1., 0.), (1e-6, weak)] {
            let mut x = SparseMatrix::zeros(layout.clone(), block, 1);
            x.add_block_mask(&aligned);
            softmax.forward(&mut x, scale, false).unwrap();
            for row in x.tile(0, 0).chunks_exact(16) {
                assert!((row[0] - masked).abs() < 1e-5, "{scale}: {}", row[0]);
                assert!((row.iter().sum::<f32>() - 1.).abs() < 1e-5)
            }
        }
    }
}
