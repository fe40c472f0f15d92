//! Element-wise reduction primitives shared by the loopback transport and
//! the loopback device collective.

use crate::types::{DataType, ReduceOp};

/// Trait for element types that support the four reduction operations.
pub(crate) trait Reducible: Copy + 'static {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    ($($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
}

impl_reducible!(f32, f64);

/// Read/write a value from a little-endian byte slice (alignment-safe).
trait LeBytes: Sized {
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_le_bytes {
    ($($ty:ty),*) => {
        $(
            impl LeBytes for $ty {
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(
                        bytes.try_into().expect("slice length matches type size"),
                    )
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_le_bytes!(f32, f64);

/// Element-wise reduce on byte slices interpreted as `dtype` elements.
///
/// `dst` and `src` must both contain exactly `count * dtype.size_in_bytes()`
/// bytes.
pub(crate) fn reduce_slice(dst: &mut [u8], src: &[u8], count: usize, dtype: DataType, op: ReduceOp) {
    match dtype {
        DataType::F32 => reduce_slice_typed::<f32>(dst, src, count, op),
        DataType::F64 => reduce_slice_typed::<f64>(dst, src, count, op),
    }
}

fn reduce_slice_typed<T: Reducible + LeBytes>(dst: &mut [u8], src: &[u8], count: usize, op: ReduceOp) {
    let t_size = std::mem::size_of::<T>();
    for i in 0..count {
        let off = i * t_size;
        let a = T::read_le(&dst[off..off + t_size]);
        let b = T::read_le(&src[off..off + t_size]);
        let r = T::reduce(a, b, op);
        r.write_le(&mut dst[off..off + t_size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(vals: &[f32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn f32_vals(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_reduce_sum_f32() {
        let mut dst = f32_bytes(&[1.0, 2.0, 3.0, 4.0]);
        let src = f32_bytes(&[10.0, 20.0, 30.0, 40.0]);
        reduce_slice(&mut dst, &src, 4, DataType::F32, ReduceOp::Sum);
        assert_eq!(f32_vals(&dst), vec![11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn test_reduce_min_f64() {
        let mut dst: Vec<u8> = [3.0f64, -1.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let src: Vec<u8> = [2.0f64, 5.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        reduce_slice(&mut dst, &src, 2, DataType::F64, ReduceOp::Min);
        let out: Vec<f64> = dst
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(out, vec![2.0, -1.0]);
    }

    #[test]
    fn test_reduce_prod_and_max() {
        let mut dst = f32_bytes(&[2.0, 2.0]);
        let src = f32_bytes(&[3.0, 7.0]);
        reduce_slice(&mut dst, &src, 2, DataType::F32, ReduceOp::Prod);
        assert_eq!(f32_vals(&dst), vec![6.0, 14.0]);

        let mut dst = f32_bytes(&[2.0, 9.0]);
        reduce_slice(&mut dst, &src, 2, DataType::F32, ReduceOp::Max);
        assert_eq!(f32_vals(&dst), vec![3.0, 9.0]);
    }
}
