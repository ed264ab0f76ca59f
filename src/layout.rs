//! Block occupancy layouts and the indices derived from them.

use crate::{
    diagnostic::{Diagnostic, DiagnosticSink},
    error::{ConfigurationError, Error, Result},
    tensor::{Elem, Tensor, load},
};
use std::ops::Range;

/// Side length of the square tiles the kernels work on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlockSize(usize);

impl BlockSize {
    pub const SUPPORTED: [usize; 4] = [16, 32, 64, 128];

    pub fn new(size: usize) -> Result<Self, ConfigurationError> {
        if Self::SUPPORTED.contains(&size) {
            Ok(Self(size))
        } else {
            Err(ConfigurationError::UnsupportedBlockSize(size))
        }
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Number of elements in one tile.
    #[inline]
    pub const fn area(self) -> usize {
        self.0 * self.0
    }
}

/// Raw occupancy pattern as the caller hands it over, with or without a head dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Occupancy {
    shape: Vec<usize>,
    cells: Vec<bool>,
}

impl Occupancy {
    pub fn new(
        shape: &[usize],
        cells: impl IntoIterator<Item = bool>,
    ) -> Result<Self, ConfigurationError> {
        if !matches!(shape.len(), 2 | 3) {
            return Err(ConfigurationError::LayoutRank(shape.len()));
        }
        if shape.contains(&0) {
            return Err(ConfigurationError::EmptyLayout(shape.to_vec()));
        }
        let cells = cells.into_iter().collect::<Vec<_>>();
        let expected = shape.iter().product();
        if cells.len() != expected {
            return Err(ConfigurationError::LayoutLen {
                shape: shape.to_vec(),
                expected,
                actual: cells.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            cells,
        })
    }

    /// Every block active.
    pub fn ones(shape: &[usize]) -> Result<Self, ConfigurationError> {
        Self::new(shape, std::iter::repeat(true).take(shape.iter().product()))
    }

    /// Blocks on or below the `diagonal`-th diagonal of every head are active.
    pub fn tril(shape: &[usize], diagonal: isize) -> Result<Self, ConfigurationError> {
        let cols = shape.last().copied().unwrap_or(0);
        let rows = shape.iter().rev().nth(1).copied().unwrap_or(0);
        let per_head = rows * cols;
        let total = shape.iter().product::<usize>();
        Self::new(
            shape,
            (0..total).map(|i| {
                let i = i % per_head.max(1);
                (i % cols) as isize <= (i / cols) as isize + diagonal
            }),
        )
    }

    /// Reads an integer or boolean tensor of rank 2 or 3, nonzero meaning active.
    pub fn from_tensor(tensor: &Tensor<&[u8]>) -> Result<Self> {
        let dt = tensor.dt();
        let elem = Elem::of(dt)
            .filter(|e| !e.is_float())
            .ok_or(Error::UnsupportedDType {
                tensor: "layout",
                dt,
            })?;
        let cells = match *tensor.shape() {
            [r, c] => load(tensor, elem, [r, c]),
            [h, r, c] => load(tensor, elem, [h, r, c]),
            ref shape => return Err(ConfigurationError::LayoutRank(shape.len()).into()),
        };
        Ok(Self::new(tensor.shape(), cells.into_iter().map(|x| x != 0.))?)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Validates the pattern into a 3-D layout, repeating a 2-D one across `num_heads`.
    pub fn into_layout(
        self,
        num_heads: usize,
        sink: &dyn DiagnosticSink,
    ) -> Result<Layout, ConfigurationError> {
        let Self { shape, cells } = self;
        match *shape {
            [rows, cols] => {
                if num_heads == 0 {
                    return Err(ConfigurationError::ZeroHeads);
                }
                sink.emit(&Diagnostic::LayoutBroadcast {
                    num_heads,
                    row_blocks: rows,
                    col_blocks: cols,
                });
                let cells = cells.repeat(num_heads);
                Ok(Layout::build([num_heads, rows, cols], cells))
            }
            [heads, rows, cols] => Ok(Layout::build([heads, rows, cols], cells)),
            _ => Err(ConfigurationError::LayoutRank(shape.len())),
        }
    }
}

/// Coordinates of one active block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlockCoord {
    pub head: usize,
    pub row: usize,
    pub col: usize,
}

/// Row selectors for block-aligning a per-token mask.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatherIndices {
    /// `head * col_blocks + col`, for masks that differ per head.
    pub to_gather: Box<[usize]>,
    /// `col`, for one mask broadcast across heads.
    pub broadcast_to_gather: Box<[usize]>,
}

/// Immutable `[head, row_block, col_block]` occupancy.
///
/// Active blocks are enumerated row-major over the nonzero cells, heads outermost.
/// That order is the storage order of every [`SparseMatrix`](crate::SparseMatrix)
/// built on this layout, so blocks of one `(head, row)` are contiguous.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    heads: usize,
    rows: usize,
    cols: usize,
    cells: Box<[bool]>,
    blocks: Box<[BlockCoord]>,
    /// `blocks[row_ptr[h * rows + r]..row_ptr[h * rows + r + 1]]` are the blocks of one row.
    row_ptr: Box<[usize]>,
    gather: GatherIndices,
}

impl Layout {
    fn build([heads, rows, cols]: [usize; 3], cells: Vec<bool>) -> Self {
        debug_assert_eq!(cells.len(), heads * rows * cols);

        let mut blocks = Vec::new();
        let mut row_ptr = Vec::with_capacity(heads * rows + 1);
        row_ptr.push(0);
        for head in 0..heads {
            for row in 0..rows {
                let line = &cells[(head * rows + row) * cols..][..cols];
                blocks.extend(
                    line.iter()
                        .enumerate()
                        .filter(|&(_, &on)| on)
                        .map(|(col, _)| BlockCoord { head, row, col }),
                );
                row_ptr.push(blocks.len())
            }
        }

        let gather = GatherIndices {
            to_gather: blocks.iter().map(|b| b.head * cols + b.col).collect(),
            broadcast_to_gather: blocks.iter().map(|b| b.col).collect(),
        };

        Self {
            heads,
            rows,
            cols,
            cells: cells.into(),
            blocks: blocks.into(),
            row_ptr: row_ptr.into(),
            gather,
        }
    }

    /// `[heads, row_blocks, col_blocks]`
    pub const fn shape(&self) -> [usize; 3] {
        [self.heads, self.rows, self.cols]
    }

    pub const fn heads(&self) -> usize {
        self.heads
    }

    pub const fn row_blocks(&self) -> usize {
        self.rows
    }

    pub const fn col_blocks(&self) -> usize {
        self.cols
    }

    /// Number of active blocks.
    pub fn nnz(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_active(&self, head: usize, row: usize, col: usize) -> bool {
        head < self.heads
            && row < self.rows
            && col < self.cols
            && self.cells[(head * self.rows + row) * self.cols + col]
    }

    /// Active blocks in enumeration order.
    pub fn blocks(&self) -> &[BlockCoord] {
        &self.blocks
    }

    /// Range of block indices in one `(head, row)`.
    pub fn row_range(&self, head: usize, row: usize) -> Range<usize> {
        let i = head * self.rows + row;
        self.row_ptr[i]..self.row_ptr[i + 1]
    }

    /// Range of block indices in one head.
    pub fn head_range(&self, head: usize) -> Range<usize> {
        self.row_ptr[head * self.rows]..self.row_ptr[(head + 1) * self.rows]
    }

    pub fn gather(&self) -> &GatherIndices {
        &self.gather
    }
}
