//! Reference provider running on rayon.

use super::{Device, KernelBackend, MatmulMode, Operand, Product, SparseMatmul, SparseSoftmax};
use crate::{
    error::KernelError,
    layout::{BlockCoord, BlockSize, Layout},
    softmax::{segmented_softmax, segmented_softmax_backward},
    sparse::{Dense, SparseMatrix},
};
use half::f16;
use rayon::prelude::*;
use std::{iter::zip, sync::Arc};

#[derive(Clone, Copy, Default, Debug)]
pub struct Cpu;

impl KernelBackend for Cpu {
    fn sparse_matmul(
        &self,
        layout: &Arc<Layout>,
        block: BlockSize,
        mode: MatmulMode,
        trans_a: bool,
        trans_b: bool,
        device: &Device,
    ) -> Box<dyn SparseMatmul> {
        Box::new(Matmul {
            layout: layout.clone(),
            block,
            mode,
            trans_a,
            trans_b,
            device: device.clone(),
        })
    }

    fn sparse_softmax(
        &self,
        layout: &Arc<Layout>,
        block: BlockSize,
        device: &Device,
    ) -> Box<dyn SparseSoftmax> {
        Box::new(Softmax {
            layout: layout.clone(),
            block,
            device: device.clone(),
        })
    }
}

/// `op(x)` of one `(batch, head)` matrix.
struct View<'a> {
    data: &'a [f16],
    cols: usize,
    trans: bool,
}

impl<'a> View<'a> {
    fn new(dense: &'a Dense<f16>, batch: usize, head: usize, trans: bool) -> Self {
        let [.., cols] = dense.shape();
        Self {
            data: dense.matrix(batch, head),
            cols,
            trans,
        }
    }

    #[inline]
    fn at(&self, i: usize, j: usize) -> f32 {
        let (r, c) = if self.trans { (j, i) } else { (i, j) };
        self.data[r * self.cols + c].to_f32()
    }
}

/// `[rows, cols]` of `op(x)`.
fn op_dims(shape: [usize; 4], trans: bool) -> [usize; 2] {
    let [.., r, c] = shape;
    if trans { [c, r] } else { [r, c] }
}

struct Matmul {
    layout: Arc<Layout>,
    block: BlockSize,
    mode: MatmulMode,
    trans_a: bool,
    trans_b: bool,
    device: Device,
}

impl SparseMatmul for Matmul {
    fn call(&self, a: Operand, b: Operand) -> Result<Product, KernelError> {
        use Operand::{Dense as D, Sparse as S};
        match (self.mode, a, b) {
            (MatmulMode::Sdd, D(a), D(b)) => self.sdd(a, b).map(Product::Sparse),
            (MatmulMode::Dsd, S(a), D(b)) => self.dsd(a, b).map(Product::Dense),
            (MatmulMode::Dds, D(a), S(b)) => self.dds(a, b).map(Product::Dense),
            (mode, ..) => Err(KernelError::Operands {
                mode: mode.name(),
                expected: match mode {
                    MatmulMode::Sdd => "dense x dense",
                    MatmulMode::Dsd => "sparse x dense",
                    MatmulMode::Dds => "dense x sparse",
                },
            }),
        }
    }
}

impl Matmul {
    fn check(&self, what: &'static str, expected: usize, actual: usize) -> Result<(), KernelError> {
        if expected == actual {
            Ok(())
        } else {
            Err(KernelError::Dim {
                mode: self.mode.name(),
                what,
                expected,
                actual,
            })
        }
    }

    fn check_sparse(&self, s: &SparseMatrix) -> Result<(), KernelError> {
        if (Arc::ptr_eq(s.layout(), &self.layout) || **s.layout() == *self.layout)
            && s.block_size() == self.block
        {
            Ok(())
        } else {
            Err(KernelError::Layout {
                mode: self.mode.name(),
            })
        }
    }

    fn check_dense(&self, d: &Dense<f16>, batch: usize) -> Result<(), KernelError> {
        let [z, h, ..] = d.shape();
        self.check("batch", batch, z)?;
        self.check("heads", self.layout.heads(), h)
    }

    fn sdd(&self, a: &Dense<f16>, b: &Dense<f16>) -> Result<SparseMatrix, KernelError> {
        let [batch, ..] = a.shape();
        self.check_dense(a, batch)?;
        self.check_dense(b, batch)?;

        let bs = self.block.get();
        let [m, k] = op_dims(a.shape(), self.trans_a);
        let [k_, n] = op_dims(b.shape(), self.trans_b);
        self.check("inner dimension", k, k_)?;
        self.check("rows", self.layout.row_blocks() * bs, m)?;
        self.check("cols", self.layout.col_blocks() * bs, n)?;

        let Self {
            layout,
            block,
            trans_a,
            trans_b,
            device,
            ..
        } = self;
        let nnz = layout.nnz();
        let blocks = layout.blocks();
        let mut c = SparseMatrix::zeros(layout.clone(), *block, batch);
        // 每个 tile 完全无关，可以以任意方式并行
        device.install(|| {
            c.data_mut()
                .par_chunks_mut(block.area())
                .enumerate()
                .for_each(|(i, tile)| {
                    let (z, idx) = (i / nnz, i % nnz);
                    let BlockCoord { head, row, col } = blocks[idx];
                    let a = View::new(a, z, head, *trans_a);
                    let b = View::new(b, z, head, *trans_b);
                    for (ii, line) in tile.chunks_exact_mut(bs).enumerate() {
                        let r = row * bs + ii;
                        for (jj, x) in line.iter_mut().enumerate() {
                            let j = col * bs + jj;
                            *x = (0..k).map(|p| a.at(r, p) * b.at(p, j)).sum()
                        }
                    }
                })
        });
        Ok(c)
    }

    fn dsd(&self, s: &SparseMatrix, b: &Dense<f16>) -> Result<Dense<f32>, KernelError> {
        self.check_sparse(s)?;
        self.check_dense(b, s.batch())?;

        let bs = self.block.get();
        let [heads, rows, cols] = self.layout.shape();
        let [m, k] = if self.trans_a {
            [cols * bs, rows * bs]
        } else {
            [rows * bs, cols * bs]
        };
        let [k_, n] = op_dims(b.shape(), self.trans_b);
        self.check("inner dimension", k, k_)?;

        let Self {
            layout,
            trans_a,
            trans_b,
            device,
            ..
        } = self;
        let blocks = layout.blocks();
        let mut out = Dense::filled([s.batch(), heads, m, n], 0f32);
        if out.data().is_empty() {
            return Ok(out);
        }
        device.install(|| {
            out.data_mut()
                .par_chunks_mut(m * n)
                .enumerate()
                .for_each(|(i, out)| {
                    let (z, head) = (i / heads, i % heads);
                    let b = View::new(b, z, head, *trans_b);
                    for idx in layout.head_range(head) {
                        let BlockCoord { row, col, .. } = blocks[idx];
                        for (ii, line) in s.tile(z, idx).chunks_exact(bs).enumerate() {
                            for (jj, &x) in line.iter().enumerate() {
                                if x == 0. {
                                    continue;
                                }
                                let (oi, bk) = if *trans_a {
                                    (col * bs + jj, row * bs + ii)
                                } else {
                                    (row * bs + ii, col * bs + jj)
                                };
                                for (p, o) in out[oi * n..][..n].iter_mut().enumerate() {
                                    *o += x * b.at(bk, p)
                                }
                            }
                        }
                    }
                })
        });
        Ok(out)
    }

    fn dds(&self, a: &Dense<f16>, s: &SparseMatrix) -> Result<Dense<f32>, KernelError> {
        self.check_sparse(s)?;
        self.check_dense(a, s.batch())?;

        let bs = self.block.get();
        let [heads, rows, cols] = self.layout.shape();
        let [k, n] = if self.trans_b {
            [cols * bs, rows * bs]
        } else {
            [rows * bs, cols * bs]
        };
        let [m, k_] = op_dims(a.shape(), self.trans_a);
        self.check("inner dimension", k, k_)?;

        let Self {
            layout,
            trans_a,
            trans_b,
            device,
            ..
        } = self;
        let blocks = layout.blocks();
        let mut out = Dense::filled([s.batch(), heads, m, n], 0f32);
        if out.data().is_empty() {
            return Ok(out);
        }
        device.install(|| {
            out.data_mut()
                .par_chunks_mut(m * n)
                .enumerate()
                .for_each(|(i, out)| {
                    let (z, head) = (i / heads, i % heads);
                    let a = View::new(a, z, head, *trans_a);
                    for idx in layout.head_range(head) {
                        let BlockCoord { row, col, .. } = blocks[idx];
                        for (ii, line) in s.tile(z, idx).chunks_exact(bs).enumerate() {
                            for (jj, &x) in line.iter().enumerate() {
                                if x == 0. {
                                    continue;
                                }
                                let (ak, oj) = if *trans_b {
                                    (col * bs + jj, row * bs + ii)
                                } else {
                                    (row * bs + ii, col * bs + jj)
                                };
                                for mm in 0..m {
                                    out[mm * n + oj] += a.at(mm, ak) * x
                                }
                            }
                        }
                    }
                })
        });
        Ok(out)
    }
}

struct Softmax {
    layout: Arc<Layout>,
    block: BlockSize,
    device: Device,
}

impl Softmax {
    fn check(&self, x: &SparseMatrix) -> Result<(), KernelError> {
        if (Arc::ptr_eq(x.layout(), &self.layout) || **x.layout() == *self.layout)
            && x.block_size() == self.block
        {
            Ok(())
        } else {
            Err(KernelError::Layout { mode: "softmax" })
        }
    }

    /// Calls `f` with the tiles of every `(head, row_block)` of one batch entry.
    fn for_each_row_block(&self, data: &mut [f32], mut f: impl FnMut(&[BlockCoord], &mut [f32])) {
        let area = self.block.area();
        let blocks = self.layout.blocks();
        for head in 0..self.layout.heads() {
            for row in 0..self.layout.row_blocks() {
                let range = self.layout.row_range(head, row);
                f(
                    &blocks[range.clone()],
                    &mut data[range.start * area..range.end * area],
                )
            }
        }
    }
}

impl SparseSoftmax for Softmax {
    fn forward(
        &self,
        x: &mut SparseMatrix,
        scale: f32,
        is_causal: bool,
    ) -> Result<(), KernelError> {
        self.check(x)?;
        let bs = self.block.get();
        let area = self.block.area();
        let len = x.batch_len();
        if len == 0 {
            return Ok(());
        }
        self.device.install(|| {
            x.data_mut().par_chunks_mut(len).for_each(|data| {
                self.for_each_row_block(data, |coords, tiles| {
                    for i in 0..bs {
                        let mut segments = Vec::with_capacity(coords.len());
                        for (coord, tile) in zip(coords, tiles.chunks_exact_mut(area)) {
                            let line = &mut tile[i * bs..][..bs];
                            if is_causal && coord.col > coord.row {
                                line.fill(0.)
                            } else {
                                segments.push(line)
                            }
                        }
                        segmented_softmax(&mut segments, scale)
                    }
                })
            })
        });
        Ok(())
    }

    fn backward(
        &self,
        probs: &SparseMatrix,
        grad: &mut SparseMatrix,
        scale: f32,
    ) -> Result<(), KernelError> {
        self.check(probs)?;
        self.check(grad)?;
        if !probs.same_structure(grad) {
            return Err(KernelError::Layout { mode: "softmax" });
        }
        let bs = self.block.get();
        let area = self.block.area();
        let len = probs.batch_len();
        if len == 0 {
            return Ok(());
        }
        let layout = &self.layout;
        self.device.install(|| {
            probs
                .data()
                .par_chunks(len)
                .zip(grad.data_mut().par_chunks_mut(len))
                .for_each(|(p, g)| {
                    for head in 0..layout.heads() {
                        for row in 0..layout.row_blocks() {
                            let range = layout.row_range(head, row);
                            let p = &p[range.start * area..range.end * area];
                            let g = &mut g[range.start * area..range.end * area];
                            for i in 0..bs {
                                let p = p
                                    .chunks_exact(area)
                                    .map(|t| &t[i * bs..][..bs])
                                    .collect::<Vec<_>>();
                                let mut g = g
                                    .chunks_exact_mut(area)
                                    .map(|t| &mut t[i * bs..][..bs])
                                    .collect::<Vec<_>>();
                                segmented_softmax_backward(&p, &mut g, scale)
                            }
                        }
                    }
                })
        });
        Ok(())
    }
}
