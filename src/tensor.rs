//! Byte-erased tensor views at the crate boundary.

use crate::error::ShapeMismatch;
use any_tensor::digit_layout::{DigitLayout, types};
use half::{bf16, f16};
use std::iter::zip;

pub type Tensor<T> = any_tensor::Tensor<T, 4>;

pub(crate) fn distinct<T: Eq + Copy>(val: &[T]) -> Option<T> {
    let [ans, tail @ ..] = val else {
        return None;
    };
    if tail.iter().all(|x| x == ans) {
        Some(*ans)
    } else {
        None
    }
}

pub(crate) fn dims<const N: usize>(
    shape: &[usize],
    tensor: &'static str,
) -> Result<[usize; N], ShapeMismatch> {
    shape.try_into().map_err(|_| ShapeMismatch::Rank {
        tensor,
        expected: N,
        actual: shape.to_vec(),
    })
}

/// Element encodings this crate knows how to read and write.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Elem {
    Bool,
    U8,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl Elem {
    pub fn of(dt: DigitLayout) -> Option<Self> {
        [
            (types::Bool, Self::Bool),
            (types::U8, Self::U8),
            (types::I32, Self::I32),
            (types::I64, Self::I64),
            (types::F16, Self::F16),
            (types::BF16, Self::BF16),
            (types::F32, Self::F32),
            (types::F64, Self::F64),
        ]
        .into_iter()
        .find(|&(t, _)| t == dt)
        .map(|(_, e)| e)
    }

    pub const fn size(self) -> usize {
        match self {
            Self::Bool | Self::U8 => 1,
            Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    /// Floating point formats the kernels lose precision on.
    pub const fn wider_than_half(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::U8 => "u8",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    fn read(self, bytes: &[u8]) -> f32 {
        match self {
            Self::Bool | Self::U8 => bytes[0] as f32,
            Self::I32 => i32::from_ne_bytes(array(bytes)) as f32,
            Self::I64 => i64::from_ne_bytes(array(bytes)) as f32,
            Self::F16 => f16::from_ne_bytes(array(bytes)).to_f32(),
            Self::BF16 => bf16::from_ne_bytes(array(bytes)).to_f32(),
            Self::F32 => f32::from_ne_bytes(array(bytes)),
            Self::F64 => f64::from_ne_bytes(array(bytes)) as f32,
        }
    }

    fn write(self, val: f32, bytes: &mut [u8]) {
        let n = self.size();
        match self {
            Self::Bool | Self::U8 => bytes[0] = (val != 0.) as u8,
            Self::I32 => bytes[..n].copy_from_slice(&(val as i32).to_ne_bytes()),
            Self::I64 => bytes[..n].copy_from_slice(&(val as i64).to_ne_bytes()),
            Self::F16 => bytes[..n].copy_from_slice(&f16::from_f32(val).to_ne_bytes()),
            Self::BF16 => bytes[..n].copy_from_slice(&bf16::from_f32(val).to_ne_bytes()),
            Self::F32 => bytes[..n].copy_from_slice(&val.to_ne_bytes()),
            Self::F64 => bytes[..n].copy_from_slice(&(val as f64).to_ne_bytes()),
        }
    }
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut ans = [0; N];
    ans.copy_from_slice(&bytes[..N]);
    ans
}

/// Visits the byte offset of every element in row-major order.
fn for_each_offset<const N: usize>(
    shape: &[usize; N],
    strides: &[isize; N],
    offset: isize,
    mut f: impl FnMut(usize),
) {
    if shape.contains(&0) {
        return;
    }
    let mut idx = [0usize; N];
    loop {
        let pos = zip(&idx, strides).fold(offset, |acc, (&i, &s)| acc + i as isize * s);
        f(pos as usize);

        let mut axis = N;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            idx[axis] += 1;
            if idx[axis] < shape[axis] {
                break;
            }
            idx[axis] = 0
        }
    }
}

/// Reads a view of known rank into row-major `f32` values.
pub(crate) fn load<const N: usize>(
    tensor: &Tensor<&[u8]>,
    elem: Elem,
    shape: [usize; N],
) -> Vec<f32> {
    let mut strides = [0isize; N];
    strides.copy_from_slice(&tensor.strides()[..N]);
    let data: &[u8] = tensor.get();

    let mut ans = Vec::with_capacity(shape.iter().product());
    for_each_offset(&shape, &strides, tensor.offset(), |pos| {
        ans.push(elem.read(&data[pos..][..elem.size()]))
    });
    ans
}

/// Writes row-major `f32` values into a view of known rank, converting to its encoding.
pub(crate) fn store<const N: usize>(
    tensor: &mut Tensor<&mut [u8]>,
    elem: Elem,
    shape: [usize; N],
    values: &[f32],
) {
    let mut strides = [0isize; N];
    strides.copy_from_slice(&tensor.strides()[..N]);
    let offset = tensor.offset();
    let data: &mut [u8] = tensor.get_mut();

    let mut values = values.iter();
    for_each_offset(&shape, &strides, offset, |pos| {
        if let Some(&val) = values.next() {
            elem.write(val, &mut data[pos..][..elem.size()])
        }
    });
}
