//! Core type definitions: element dtypes and rectangular array regions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of an array leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "int8")]
    I8,
    #[serde(rename = "int16")]
    I16,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "uint32")]
    U32,
    #[serde(rename = "uint64")]
    U64,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
}

impl Dtype {
    /// Size of one element in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            Dtype::Bool | Dtype::I8 | Dtype::U8 => 1,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::I32 | Dtype::U32 | Dtype::F32 => 4,
            Dtype::I64 | Dtype::U64 | Dtype::F64 => 8,
        }
    }

    /// Canonical name, as stored in metadata records
    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::Bool => "bool",
            Dtype::I8 => "int8",
            Dtype::I16 => "int16",
            Dtype::I32 => "int32",
            Dtype::I64 => "int64",
            Dtype::U8 => "uint8",
            Dtype::U16 => "uint16",
            Dtype::U32 => "uint32",
            Dtype::U64 => "uint64",
            Dtype::F32 => "float32",
            Dtype::F64 => "float64",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of elements in a shape (empty shape is a scalar with one element)
pub fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// A rectangular sub-region of an array, as per-dimension half-open intervals
///
/// Dimension `d` covers `origin[d] .. origin[d] + shape[d]`. A rank-0 region
/// addresses the single element of a scalar array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    /// Inclusive start index per dimension
    pub origin: Vec<usize>,
    /// Extent per dimension
    pub shape: Vec<usize>,
}

impl Region {
    /// Create a region from origin and shape
    pub fn new(origin: Vec<usize>, shape: Vec<usize>) -> Self {
        debug_assert_eq!(origin.len(), shape.len());
        Self { origin, shape }
    }

    /// The region covering an entire array of the given shape
    pub fn full(shape: &[usize]) -> Self {
        Self {
            origin: vec![0; shape.len()],
            shape: shape.to_vec(),
        }
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.origin.len()
    }

    /// Exclusive end index of a dimension
    pub fn end(&self, dim: usize) -> usize {
        self.origin[dim] + self.shape[dim]
    }

    /// Total number of elements covered
    pub fn num_elements(&self) -> usize {
        num_elements(&self.shape)
    }

    /// Returns true if any dimension has zero extent
    pub fn is_empty(&self) -> bool {
        self.shape.iter().any(|&s| s == 0)
    }

    /// Returns true if this region lies fully within an array of `shape`
    pub fn fits_within(&self, shape: &[usize]) -> bool {
        self.rank() == shape.len() && (0..self.rank()).all(|d| self.end(d) <= shape[d])
    }

    /// Intersection with another region of the same rank, if non-empty
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        if self.rank() != other.rank() {
            return None;
        }

        let mut origin = Vec::with_capacity(self.rank());
        let mut shape = Vec::with_capacity(self.rank());

        for d in 0..self.rank() {
            let start = self.origin[d].max(other.origin[d]);
            let end = self.end(d).min(other.end(d));
            if start >= end {
                return None;
            }
            origin.push(start);
            shape.push(end - start);
        }

        Some(Region { origin, shape })
    }

    /// Coordinates of this region relative to an enclosing region
    ///
    /// The caller must ensure `self` lies within `outer`.
    pub fn relative_to(&self, outer: &Region) -> Region {
        let origin = self
            .origin
            .iter()
            .zip(&outer.origin)
            .map(|(o, base)| o - base)
            .collect();
        Region {
            origin,
            shape: self.shape.clone(),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for d in 0..self.rank() {
            if d > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}..{}", self.origin[d], self.end(d))?;
        }
        write!(f, "]")
    }
}
