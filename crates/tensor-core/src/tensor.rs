//! Host-resident array values
//!
//! A [`Tensor`] is a dense row-major, little-endian buffer with a dtype,
//! a shape and an optional sharding descriptor. It is the leaf value type of
//! checkpoint trees; the engine never interprets elements beyond copying
//! rectangular regions.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::sharding::ShardingSpec;
use crate::types::{num_elements, Dtype, Region};

/// A native element type that can live in a [`Tensor`]
pub trait Element: Copy + Send + Sync + 'static {
    /// The dtype tag for this element type
    const DTYPE: Dtype;

    /// Append the little-endian encoding of `self` to `out`
    fn write_le(self, out: &mut Vec<u8>);

    /// Decode one element from a little-endian byte slice
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: Dtype = $dtype;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(buf)
            }
        }
    };
}

impl_element!(i8, Dtype::I8);
impl_element!(i16, Dtype::I16);
impl_element!(i32, Dtype::I32);
impl_element!(i64, Dtype::I64);
impl_element!(u8, Dtype::U8);
impl_element!(u16, Dtype::U16);
impl_element!(u32, Dtype::U32);
impl_element!(u64, Dtype::U64);
impl_element!(f32, Dtype::F32);
impl_element!(f64, Dtype::F64);

/// A dense multi-dimensional array leaf
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Bytes,
    sharding: Option<ShardingSpec>,
}

impl Tensor {
    /// Create a tensor from a raw little-endian byte buffer
    pub fn from_bytes(dtype: Dtype, shape: Vec<usize>, data: Bytes) -> Result<Self> {
        let expected = num_elements(&shape) * dtype.size_bytes();
        if data.len() != expected {
            return Err(Error::InvalidConfig {
                message: format!(
                    "buffer of {} bytes does not match shape {:?} of dtype {} ({} bytes expected)",
                    data.len(),
                    shape,
                    dtype,
                    expected
                ),
            });
        }
        Ok(Self {
            dtype,
            shape,
            data,
            sharding: None,
        })
    }

    /// Create a tensor from typed elements in row-major order
    pub fn from_vec<T: Element>(shape: Vec<usize>, values: Vec<T>) -> Result<Self> {
        if values.len() != num_elements(&shape) {
            return Err(Error::InvalidConfig {
                message: format!(
                    "{} elements do not match shape {:?}",
                    values.len(),
                    shape
                ),
            });
        }
        let mut buf = Vec::with_capacity(values.len() * T::DTYPE.size_bytes());
        for v in values {
            v.write_le(&mut buf);
        }
        Ok(Self {
            dtype: T::DTYPE,
            shape,
            data: Bytes::from(buf),
            sharding: None,
        })
    }

    /// A zero-filled tensor
    pub fn zeros(dtype: Dtype, shape: Vec<usize>) -> Self {
        let len = num_elements(&shape) * dtype.size_bytes();
        Self {
            dtype,
            shape,
            data: Bytes::from(vec![0u8; len]),
            sharding: None,
        }
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        num_elements(&self.shape)
    }

    /// Size of the full buffer in bytes
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn sharding(&self) -> Option<&ShardingSpec> {
        self.sharding.as_ref()
    }

    /// Attach a sharding descriptor, validating it against the shape
    pub fn with_sharding(mut self, sharding: ShardingSpec) -> Result<Self> {
        sharding.validate(&self.shape)?;
        self.sharding = Some(sharding);
        Ok(self)
    }

    /// Drop the sharding descriptor, keeping the data
    pub fn without_sharding(mut self) -> Self {
        self.sharding = None;
        self
    }

    /// Copy out a rectangular region of the buffer
    pub fn extract(&self, region: &Region) -> Result<Bytes> {
        if !region.fits_within(&self.shape) {
            return Err(Error::Internal {
                message: format!(
                    "region {} out of bounds for shape {:?}",
                    region, self.shape
                ),
            });
        }
        Ok(Bytes::from(extract_region(
            &self.data,
            &self.shape,
            region,
            self.dtype.size_bytes(),
        )))
    }

    /// Decode the full buffer into typed elements
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if self.dtype != T::DTYPE {
            return Err(Error::InvalidConfig {
                message: format!("tensor has dtype {}, requested {}", self.dtype, T::DTYPE),
            });
        }
        let size = self.dtype.size_bytes();
        Ok(self
            .data
            .chunks_exact(size)
            .map(|chunk| T::read_le(chunk))
            .collect())
    }
}

/// Gather a rectangular region out of a row-major buffer
///
/// `src` holds an array of `shape`; the result holds exactly the bytes of
/// `region` in row-major order.
pub fn extract_region(src: &[u8], shape: &[usize], region: &Region, elem_size: usize) -> Vec<u8> {
    if shape.is_empty() {
        return src.to_vec();
    }
    if region.is_empty() {
        return Vec::new();
    }

    let rank = shape.len();
    let row_len = region.shape[rank - 1] * elem_size;
    let outer: usize = region.shape[..rank - 1].iter().product();
    let strides = row_major_strides(shape);

    let mut out = Vec::with_capacity(outer * row_len);
    let mut coords = vec![0usize; rank - 1];
    for _ in 0..outer {
        let offset = row_offset(region, &coords, &strides);
        let start = offset * elem_size;
        out.extend_from_slice(&src[start..start + row_len]);
        advance(&mut coords, &region.shape[..rank - 1]);
    }
    out
}

/// Scatter region bytes into a row-major buffer
///
/// Inverse of [`extract_region`]: `data` holds exactly the bytes of `region`
/// and is copied into the corresponding positions of `dst`.
pub fn fill_region(dst: &mut [u8], shape: &[usize], region: &Region, data: &[u8], elem_size: usize) {
    if shape.is_empty() {
        dst.copy_from_slice(data);
        return;
    }
    if region.is_empty() {
        return;
    }

    let rank = shape.len();
    let row_len = region.shape[rank - 1] * elem_size;
    let outer: usize = region.shape[..rank - 1].iter().product();
    let strides = row_major_strides(shape);

    let mut coords = vec![0usize; rank - 1];
    for row in 0..outer {
        let offset = row_offset(region, &coords, &strides);
        let start = offset * elem_size;
        dst[start..start + row_len].copy_from_slice(&data[row * row_len..(row + 1) * row_len]);
        advance(&mut coords, &region.shape[..rank - 1]);
    }
}

/// Element strides for a row-major shape
fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let rank = shape.len();
    let mut strides = vec![1usize; rank];
    for d in (0..rank.saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Element offset of the row at `coords` within `region`
fn row_offset(region: &Region, coords: &[usize], strides: &[usize]) -> usize {
    let rank = region.rank();
    let mut offset = region.origin[rank - 1];
    for d in 0..rank - 1 {
        offset += (region.origin[d] + coords[d]) * strides[d];
    }
    offset
}

/// Odometer increment over the outer dimensions of a region
fn advance(coords: &mut [usize], extents: &[usize]) {
    for d in (0..coords.len()).rev() {
        coords[d] += 1;
        if coords[d] < extents[d] {
            return;
        }
        coords[d] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_and_back() {
        let t = Tensor::from_vec(vec![2, 3], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(t.dtype(), Dtype::F32);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_from_vec_shape_mismatch() {
        let result = Tensor::from_vec(vec![2, 3], vec![1.0f32, 2.0]);
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_to_vec_wrong_dtype() {
        let t = Tensor::from_vec(vec![2], vec![1.0f32, 2.0]).unwrap();
        assert!(t.to_vec::<i64>().is_err());
    }

    #[test]
    fn test_extract_inner_region() {
        // 3x4 array of consecutive i32
        let t = Tensor::from_vec(vec![3, 4], (0..12i32).collect()).unwrap();
        let region = Region::new(vec![1, 1], vec![2, 2]);
        let bytes = t.extract(&region).unwrap();

        let got: Vec<i32> = bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(got, vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_extract_out_of_bounds() {
        let t = Tensor::from_vec(vec![3], vec![1i64, 2, 3]).unwrap();
        let region = Region::new(vec![1], vec![3]);
        assert!(t.extract(&region).is_err());
    }

    #[test]
    fn test_fill_then_extract_roundtrip() {
        let shape = vec![4, 4];
        let mut buf = vec![0u8; 16 * 4];
        let region = Region::new(vec![1, 2], vec![2, 2]);

        let patch: Vec<u8> = [7i32, 8, 9, 10]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        fill_region(&mut buf, &shape, &region, &patch, 4);

        let back = extract_region(&buf, &shape, &region, 4);
        assert_eq!(back, patch);

        // untouched corner stays zero
        let corner = extract_region(&buf, &shape, &Region::new(vec![0, 0], vec![1, 1]), 4);
        assert_eq!(corner, vec![0u8; 4]);
    }

    #[test]
    fn test_scalar_tensor() {
        let t = Tensor::from_vec(vec![], vec![42.0f64]).unwrap();
        assert_eq!(t.rank(), 0);
        assert_eq!(t.num_elements(), 1);
        let full = t.extract(&Region::full(&[])).unwrap();
        assert_eq!(full.len(), 8);
    }

    #[test]
    fn test_zeros() {
        let t = Tensor::zeros(Dtype::F32, vec![5]);
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![0.0; 5]);
    }
}
