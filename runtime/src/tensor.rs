// tensor.rs — Host-resident tensor values
//
// Values flowing through the reference executor, constants embedded in
// attributes, and initial values of variables. Floating values are held as
// f64 and integers as i64 regardless of the nominal width.
//
// Preconditions: none.
// Postconditions: `data` length always equals the product of `shape`.
// Failure modes: constructors reject length/shape mismatches and dtypes
//                without a host representation.
// Side effects: none.

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;

/// Element storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::Float(v) => v.len(),
            TensorData::Int(v) => v.len(),
            TensorData::Bool(v) => v.len(),
            TensorData::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind_matches(&self, dtype: DType) -> bool {
        match self {
            TensorData::Float(_) => dtype.is_floating(),
            TensorData::Int(_) => dtype.is_integer() || dtype.is_unsigned(),
            TensorData::Bool(_) => dtype.is_bool(),
            TensorData::Str(_) => matches!(dtype, DType::String | DType::Resource),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    pub dtype: DType,
    pub shape: Vec<i64>,
    pub data: TensorData,
}

impl HostTensor {
    pub fn new(dtype: DType, shape: Vec<i64>, data: TensorData) -> Result<Self> {
        let expected: i64 = shape.iter().product();
        if shape.iter().any(|d| *d < 0) || expected as usize != data.len() {
            return Err(Error::invalid(format!(
                "tensor of shape {:?} cannot hold {} elements",
                shape,
                data.len()
            )));
        }
        if !data.kind_matches(dtype) {
            return Err(Error::invalid(format!(
                "element storage does not match dtype {}",
                dtype
            )));
        }
        Ok(HostTensor { dtype, shape, data })
    }

    pub fn scalar_f32(v: f32) -> Self {
        HostTensor {
            dtype: DType::Float,
            shape: Vec::new(),
            data: TensorData::Float(vec![v as f64]),
        }
    }

    pub fn scalar_f64(v: f64) -> Self {
        HostTensor {
            dtype: DType::Double,
            shape: Vec::new(),
            data: TensorData::Float(vec![v]),
        }
    }

    pub fn scalar_i32(v: i32) -> Self {
        HostTensor {
            dtype: DType::Int32,
            shape: Vec::new(),
            data: TensorData::Int(vec![v as i64]),
        }
    }

    pub fn scalar_bool(v: bool) -> Self {
        HostTensor {
            dtype: DType::Bool,
            shape: Vec::new(),
            data: TensorData::Bool(vec![v]),
        }
    }

    pub fn from_f32(shape: &[i64], values: &[f32]) -> Result<Self> {
        HostTensor::new(
            DType::Float,
            shape.to_vec(),
            TensorData::Float(values.iter().map(|v| *v as f64).collect()),
        )
    }

    pub fn from_i32(shape: &[i64], values: &[i32]) -> Result<Self> {
        HostTensor::new(
            DType::Int32,
            shape.to_vec(),
            TensorData::Int(values.iter().map(|v| *v as i64).collect()),
        )
    }

    /// A scalar resource handle naming a shared resource.
    pub fn resource(shared_name: &str) -> Self {
        HostTensor {
            dtype: DType::Resource,
            shape: Vec::new(),
            data: TensorData::Str(vec![shared_name.to_string()]),
        }
    }

    /// A tensor of `dtype` filled with `value` (interpreted per element kind;
    /// any non-zero value is `true` for booleans).
    pub fn full(dtype: DType, shape: &[i64], value: f64) -> Result<Self> {
        let n: i64 = shape.iter().product();
        let n = n.max(0) as usize;
        let data = if dtype.is_floating() {
            TensorData::Float(vec![value; n])
        } else if dtype.is_integer() || dtype.is_unsigned() {
            TensorData::Int(vec![value as i64; n])
        } else if dtype.is_bool() {
            TensorData::Bool(vec![value != 0.0; n])
        } else if dtype == DType::String {
            TensorData::Str(vec![String::new(); n])
        } else {
            return Err(Error::invalid(format!(
                "no host representation for dtype {}",
                dtype
            )));
        };
        HostTensor::new(dtype, shape.to_vec(), data)
    }

    pub fn zeros(dtype: DType, shape: &[i64]) -> Result<Self> {
        HostTensor::full(dtype, shape, 0.0)
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    pub fn static_shape(&self) -> Shape {
        Shape::from_dims(&self.shape)
    }

    /// Elements as f64 for numeric and boolean tensors.
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        match &self.data {
            TensorData::Float(v) => Some(v.clone()),
            TensorData::Int(v) => Some(v.iter().map(|x| *x as f64).collect()),
            TensorData::Bool(v) => Some(v.iter().map(|b| if *b { 1.0 } else { 0.0 }).collect()),
            TensorData::Str(_) => None,
        }
    }

    /// The single element of a scalar bool, or of a numeric scalar compared to zero.
    pub fn scalar_truth(&self) -> Option<bool> {
        if self.num_elements() != 1 {
            return None;
        }
        match &self.data {
            TensorData::Bool(v) => Some(v[0]),
            TensorData::Float(v) => Some(v[0] != 0.0),
            TensorData::Int(v) => Some(v[0] != 0),
            TensorData::Str(_) => None,
        }
    }

    pub fn resource_name(&self) -> Option<&str> {
        match (&self.dtype, &self.data) {
            (DType::Resource, TensorData::Str(v)) if v.len() == 1 => Some(&v[0]),
            _ => None,
        }
    }

    /// Rebuild a tensor of the same dtype from f64 elements.
    pub fn with_f64(&self, shape: Vec<i64>, values: Vec<f64>) -> Result<Self> {
        let data = if self.dtype.is_floating() {
            TensorData::Float(values)
        } else if self.dtype.is_integer() || self.dtype.is_unsigned() {
            TensorData::Int(values.into_iter().map(|v| v as i64).collect())
        } else if self.dtype.is_bool() {
            TensorData::Bool(values.into_iter().map(|v| v != 0.0).collect())
        } else {
            return Err(Error::invalid(format!(
                "cannot rebuild a {} tensor from numbers",
                self.dtype
            )));
        };
        HostTensor::new(self.dtype, shape, data)
    }

    /// Slice `[start, start + len)` along `dim`.
    pub fn slice(&self, dim: usize, start: i64, len: i64) -> Result<Self> {
        if dim >= self.shape.len() || start < 0 || len < 0 || start + len > self.shape[dim] {
            return Err(Error::invalid(format!(
                "slice [{}, {}) along dim {} out of range for shape {:?}",
                start,
                start + len,
                dim,
                self.shape
            )));
        }
        let outer: i64 = self.shape[..dim].iter().product();
        let inner: i64 = self.shape[dim + 1..].iter().product();
        let extent = self.shape[dim];
        let mut indices = Vec::with_capacity((outer * len * inner) as usize);
        for o in 0..outer {
            for d in start..start + len {
                let base = (o * extent + d) * inner;
                indices.extend((base..base + inner).map(|i| i as usize));
            }
        }
        let data = match &self.data {
            TensorData::Float(v) => TensorData::Float(indices.iter().map(|i| v[*i]).collect()),
            TensorData::Int(v) => TensorData::Int(indices.iter().map(|i| v[*i]).collect()),
            TensorData::Bool(v) => TensorData::Bool(indices.iter().map(|i| v[*i]).collect()),
            TensorData::Str(v) => TensorData::Str(indices.iter().map(|i| v[*i].clone()).collect()),
        };
        let mut shape = self.shape.clone();
        shape[dim] = len;
        HostTensor::new(self.dtype, shape, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_length_mismatch() {
        assert!(HostTensor::new(DType::Float, vec![2, 2], TensorData::Float(vec![1.0])).is_err());
        assert!(HostTensor::new(DType::Int32, vec![1], TensorData::Float(vec![1.0])).is_err());
    }

    #[test]
    fn zeros_per_kind() {
        let z = HostTensor::zeros(DType::Bool, &[2]).unwrap();
        assert_eq!(z.data, TensorData::Bool(vec![false, false]));
        let z = HostTensor::zeros(DType::UInt8, &[3]).unwrap();
        assert_eq!(z.data, TensorData::Int(vec![0, 0, 0]));
        assert!(HostTensor::zeros(DType::Complex64, &[1]).is_err());
    }

    #[test]
    fn slice_middle_dim() {
        // [[0,1,2],[3,4,5]] sliced on dim 1 → [[1,2],[4,5]]
        let t = HostTensor::from_i32(&[2, 3], &[0, 1, 2, 3, 4, 5]).unwrap();
        let s = t.slice(1, 1, 2).unwrap();
        assert_eq!(s.shape, vec![2, 2]);
        assert_eq!(s.data, TensorData::Int(vec![1, 2, 4, 5]));
        assert!(t.slice(1, 2, 2).is_err());
    }

    #[test]
    fn resource_handles() {
        let h = HostTensor::resource("scope/v");
        assert_eq!(h.resource_name(), Some("scope/v"));
        assert_eq!(HostTensor::scalar_f32(1.0).resource_name(), None);
    }
}
