//! Dense operands and the block-sparse intermediate the kernels exchange.

use crate::{
    error::ShapeMismatch,
    layout::{BlockSize, Layout},
    mask::BlockMask,
};
use std::{iter::zip, sync::Arc};

/// Row-major `[batch, heads, rows, cols]` buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Dense<T> {
    shape: [usize; 4],
    data: Vec<T>,
}

impl<T: Copy> Dense<T> {
    pub fn from_vec(shape: [usize; 4], data: Vec<T>) -> Result<Self, ShapeMismatch> {
        if data.len() != shape.iter().product::<usize>() {
            return Err(ShapeMismatch::Operand {
                tensor: "dense",
                expected: shape.to_vec(),
                actual: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    pub fn from_fn(shape: [usize; 4], f: impl FnMut(usize) -> T) -> Self {
        Self {
            shape,
            data: (0..shape.iter().product()).map(f).collect(),
        }
    }

    pub fn filled(shape: [usize; 4], val: T) -> Self {
        Self {
            shape,
            data: vec![val; shape.iter().product()],
        }
    }

    pub const fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// The `rows x cols` matrix of one `(batch, head)`.
    pub fn matrix(&self, batch: usize, head: usize) -> &[T] {
        let [_, h, r, c] = self.shape;
        &self.data[(batch * h + head) * r * c..][..r * c]
    }

    pub fn get(&self, batch: usize, head: usize, row: usize, col: usize) -> T {
        let [_, _, _, c] = self.shape;
        self.matrix(batch, head)[row * c + col]
    }

    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> Dense<U> {
        Dense {
            shape: self.shape,
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }
}

/// Active tiles of a `[batch, heads, rows, cols]` matrix.
///
/// Tiles are stored `[batch][block][row][col]` in the layout's enumeration order.
#[derive(Clone, Debug)]
pub struct SparseMatrix {
    layout: Arc<Layout>,
    block: BlockSize,
    batch: usize,
    data: Vec<f32>,
}

impl SparseMatrix {
    pub fn zeros(layout: Arc<Layout>, block: BlockSize, batch: usize) -> Self {
        let len = batch * layout.nnz() * block.area();
        Self {
            layout,
            block,
            batch,
            data: vec![0.; len],
        }
    }

    /// Keeps the active tiles of `dense`, whose shape must cover the layout exactly.
    pub fn from_dense(
        layout: Arc<Layout>,
        block: BlockSize,
        dense: &Dense<f32>,
    ) -> Result<Self, ShapeMismatch> {
        let [z, h, r, c] = dense.shape();
        let bs = block.get();
        let [lh, lr, lc] = layout.shape();
        if [h, r, c] != [lh, lr * bs, lc * bs] {
            return Err(ShapeMismatch::Operand {
                tensor: "dense",
                expected: vec![z, lh, lr * bs, lc * bs],
                actual: dense.shape().to_vec(),
            });
        }
        let mut ans = Self::zeros(layout, block, z);
        for b in 0..z {
            for idx in 0..ans.layout.nnz() {
                let coord = ans.layout.blocks()[idx];
                let m = dense.matrix(b, coord.head);
                let tile = ans.tile_mut(b, idx);
                for (i, row) in tile.chunks_exact_mut(bs).enumerate() {
                    row.copy_from_slice(&m[(coord.row * bs + i) * c + coord.col * bs..][..bs])
                }
            }
        }
        Ok(ans)
    }

    /// Expands to dense, writing `fill` where the layout has no block.
    pub fn to_dense(&self, fill: f32) -> Dense<f32> {
        let [h, r, c] = self.layout.shape();
        let bs = self.block.get();
        let (r, c) = (r * bs, c * bs);
        let mut ans = Dense::filled([self.batch, h, r, c], fill);
        for b in 0..self.batch {
            for (idx, coord) in self.layout.blocks().iter().enumerate() {
                let base = (b * h + coord.head) * r * c;
                for (i, row) in self.tile(b, idx).chunks_exact(bs).enumerate() {
                    let start = base + (coord.row * bs + i) * c + coord.col * bs;
                    ans.data[start..][..bs].copy_from_slice(row)
                }
            }
        }
        ans
    }

    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    pub const fn block_size(&self) -> BlockSize {
        self.block
    }

    pub const fn batch(&self) -> usize {
        self.batch
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Elements of one batch entry.
    pub fn batch_len(&self) -> usize {
        self.layout.nnz() * self.block.area()
    }

    pub fn tile(&self, batch: usize, idx: usize) -> &[f32] {
        let area = self.block.area();
        &self.data[(batch * self.layout.nnz() + idx) * area..][..area]
    }

    pub fn tile_mut(&mut self, batch: usize, idx: usize) -> &mut [f32] {
        let area = self.block.area();
        let nnz = self.layout.nnz();
        &mut self.data[(batch * nnz + idx) * area..][..area]
    }

    /// Adds a column mask to every row of the tile it was gathered for.
    pub fn add_block_mask(&mut self, mask: &BlockMask) {
        let bs = self.block.get();
        debug_assert_eq!(mask.shape(), [self.batch, self.layout.nnz(), bs]);
        for (tile, cols) in zip(self.data.chunks_exact_mut(bs * bs), mask.rows()) {
            for row in tile.chunks_exact_mut(bs) {
                zip(row, cols).for_each(|(x, m)| *x += m)
            }
        }
    }

    /// Elementwise product with a buffer of the same size.
    pub fn mul_assign(&mut self, factors: &[f32]) {
        debug_assert_eq!(factors.len(), self.data.len());
        zip(&mut self.data, factors).for_each(|(x, f)| *x *= f)
    }

    pub fn same_structure(&self, other: &Self) -> bool {
        (Arc::ptr_eq(&self.layout, &other.layout) || self.layout == other.layout)
            && self.block == other.block
            && self.batch == other.batch
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{diagnostic::Recorder, layout::Occupancy};

    fn layout() -> Arc<Layout> {
        Arc::new(
            Occupancy::new(&[1, 2, 2], [true, false, true, true])
                .unwrap()
                .into_layout(1, &Recorder::default())
                .unwrap(),
        )
    }

    #[test]
    fn test_sparsify_keeps_active_tiles() {
        let block = BlockSize::new(16).unwrap();
        let dense = Dense::from_fn([2, 1, 32, 32], |i| i as f32);
        let sparse = SparseMatrix::from_dense(layout(), block, &dense).unwrap();
        assert_eq!(sparse.data().len(), 2 * 3 * 256);

        // third block of batch 1 is (row 1, col 1)
        let tile = sparse.tile(1, 2);
        assert_eq!(tile[0], dense.get(1, 0, 16, 16));
        assert_eq!(tile[255], dense.get(1, 0, 31, 31));

        let back = sparse.to_dense(f32::NEG_INFINITY);
        for b in 0..2 {
            for i in 0..32 {
                for j in 0..32 {
                    let expected = if i < 16 && j >= 16 {
                        f32::NEG_INFINITY
                    } else {
                        dense.get(b, 0, i, j)
                    };
                    assert_eq!(back.get(b, 0, i, j), expected)
                }
            }
        }
    }

    #[test]
    fn test_shape_errors() {
        assert_eq!(
            Dense::from_vec([1, 1, 2, 3], vec![0f32; 5]),
            Err(ShapeMismatch::Operand {
                tensor: "dense",
                expected: vec![1, 1, 2, 3],
                actual: vec![5],
            })
        );

        let block = BlockSize::new(16).unwrap();
        let narrow = Dense::filled([2, 1, 32, 16], 0f32);
        assert_eq!(
            SparseMatrix::from_dense(layout(), block, &narrow).unwrap_err(),
            ShapeMismatch::Operand {
                tensor: "dense",
                expected: vec![2, 1, 32, 32],
                actual: vec![2, 1, 32, 16],
            }
        );
        let heads = Dense::filled([1, 2, 32, 32], 0f32);
        assert!(SparseMatrix::from_dense(layout(), block, &heads).is_err())
    }
}
