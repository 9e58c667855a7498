// init.rs — Variable initializers
//
// An initializer produces the initial host value of a variable (or of one
// shard of a partitioned variable) from its shape and dtype.
//
// Preconditions: `shape` is fully defined.
// Postconditions: the returned tensor has exactly `shape` and `dtype`.
// Failure modes: dtypes without a host representation, or a value whose
//                shape/dtype disagrees with the request → `Error::InvalidArgument`.
// Side effects: random initializers draw from `rand`.

use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::partition::PartitionInfo;
use crate::tensor::HostTensor;

/// User-supplied initializer.
pub trait InitializerFn: Send + Sync + fmt::Debug {
    fn init(&self, shape: &[i64], dtype: DType, partition: Option<&PartitionInfo>) -> Result<HostTensor>;
}

#[derive(Debug, Clone)]
pub enum Initializer {
    Zeros,
    Ones,
    /// Every element set to the same number.
    Constant(f64),
    RandomUniform {
        minval: f64,
        maxval: f64,
        seed: Option<u64>,
    },
    /// Uniform in `[-l, l]` with `l = sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform { seed: Option<u64> },
    /// A concrete value; the variable takes its shape.
    Value(HostTensor),
    Custom(Arc<dyn InitializerFn>),
}

impl Initializer {
    /// Initializer used when neither the call nor the scope supplies one.
    pub fn default_for(dtype: DType) -> Option<Initializer> {
        if dtype.is_floating() {
            Some(Initializer::GlorotUniform { seed: None })
        } else if dtype.is_integer() || dtype.is_unsigned() || dtype.is_bool() {
            Some(Initializer::Zeros)
        } else {
            None
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Initializer::Value(_))
    }

    pub fn value(&self) -> Option<&HostTensor> {
        match self {
            Initializer::Value(t) => Some(t),
            _ => None,
        }
    }

    pub fn initialize(
        &self,
        shape: &[i64],
        dtype: DType,
        partition: Option<&PartitionInfo>,
    ) -> Result<HostTensor> {
        match self {
            Initializer::Zeros => HostTensor::full(dtype, shape, 0.0),
            Initializer::Ones => HostTensor::full(dtype, shape, 1.0),
            Initializer::Constant(v) => HostTensor::full(dtype, shape, *v),
            Initializer::RandomUniform { minval, maxval, seed } => {
                uniform(dtype, shape, *minval, *maxval, *seed)
            }
            Initializer::GlorotUniform { seed } => {
                let scale_shape = partition.map(|p| p.full_shape.as_slice()).unwrap_or(shape);
                let (fan_in, fan_out) = compute_fans(scale_shape);
                let limit = (6.0 / (fan_in + fan_out).max(1.0)).sqrt();
                uniform(dtype, shape, -limit, limit, *seed)
            }
            Initializer::Value(t) => slice_value(t, shape, partition),
            Initializer::Custom(f) => f.init(shape, dtype, partition),
        }
    }
}

impl fmt::Display for Initializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initializer::Zeros => write!(f, "zeros"),
            Initializer::Ones => write!(f, "ones"),
            Initializer::Constant(v) => write!(f, "constant({})", v),
            Initializer::RandomUniform { minval, maxval, .. } => {
                write!(f, "random_uniform({}, {})", minval, maxval)
            }
            Initializer::GlorotUniform { .. } => write!(f, "glorot_uniform"),
            Initializer::Value(t) => write!(f, "value({} {:?})", t.dtype, t.shape),
            Initializer::Custom(c) => write!(f, "{:?}", c),
        }
    }
}

/// `(fan_in, fan_out)` for a weight of `shape`: the last two dims are
/// `[in, out]`, leading dims are the receptive field.
fn compute_fans(shape: &[i64]) -> (f64, f64) {
    match shape.len() {
        0 => (1.0, 1.0),
        1 => (shape[0] as f64, shape[0] as f64),
        2 => (shape[0] as f64, shape[1] as f64),
        n => {
            let receptive: i64 = shape[..n - 2].iter().product();
            (
                (shape[n - 2] * receptive) as f64,
                (shape[n - 1] * receptive) as f64,
            )
        }
    }
}

fn uniform(dtype: DType, shape: &[i64], lo: f64, hi: f64, seed: Option<u64>) -> Result<HostTensor> {
    if !(dtype.is_floating() || dtype.is_integer() || dtype.is_unsigned()) {
        return Err(Error::invalid(format!(
            "random initialization is not defined for dtype {}",
            dtype
        )));
    }
    if hi < lo {
        return Err(Error::invalid(format!(
            "random range [{}, {}) is empty",
            lo, hi
        )));
    }
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    let n = shape.iter().product::<i64>().max(0) as usize;
    let values: Vec<f64> = (0..n)
        .map(|_| if hi > lo { rng.gen_range(lo..hi) } else { lo })
        .collect();
    HostTensor::zeros(dtype, shape)?.with_f64(shape.to_vec(), values)
}

/// The part of `value` a shard covers; the whole value when unpartitioned.
fn slice_value(value: &HostTensor, shape: &[i64], partition: Option<&PartitionInfo>) -> Result<HostTensor> {
    let Some(p) = partition else {
        if value.shape != shape {
            return Err(Error::invalid(format!(
                "initial value of shape {:?} does not match variable shape {:?}",
                value.shape, shape
            )));
        }
        return Ok(value.clone());
    };
    if value.shape != p.full_shape {
        return Err(Error::invalid(format!(
            "initial value of shape {:?} does not match partitioned shape {:?}",
            value.shape, p.full_shape
        )));
    }
    let dim = p.single_offset_dim();
    let sliced = (0..shape.len()).find(|d| shape[*d] != p.full_shape[*d]).unwrap_or(dim);
    value.slice(sliced, p.var_offset[sliced], shape[sliced])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorData;

    #[test]
    fn defaults_by_dtype() {
        assert!(matches!(
            Initializer::default_for(DType::Float),
            Some(Initializer::GlorotUniform { .. })
        ));
        assert!(matches!(Initializer::default_for(DType::Int64), Some(Initializer::Zeros)));
        assert!(matches!(Initializer::default_for(DType::Bool), Some(Initializer::Zeros)));
        assert!(Initializer::default_for(DType::String).is_none());
    }

    #[test]
    fn glorot_respects_limit() {
        let t = Initializer::GlorotUniform { seed: Some(7) }
            .initialize(&[4, 2], DType::Float, None)
            .unwrap();
        let limit = (6.0f64 / 6.0).sqrt();
        assert!(t.to_f64().unwrap().iter().all(|v| v.abs() <= limit));
    }

    #[test]
    fn seeded_uniform_is_reproducible() {
        let init = Initializer::RandomUniform {
            minval: -1.0,
            maxval: 1.0,
            seed: Some(3),
        };
        let a = init.initialize(&[5], DType::Double, None).unwrap();
        let b = init.initialize(&[5], DType::Double, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fans_follow_in_out_layout() {
        assert_eq!(compute_fans(&[]), (1.0, 1.0));
        assert_eq!(compute_fans(&[3]), (3.0, 3.0));
        assert_eq!(compute_fans(&[3, 5]), (3.0, 5.0));
        assert_eq!(compute_fans(&[2, 2, 3, 5]), (12.0, 20.0));
    }

    #[test]
    fn value_initializer_is_sliced_for_shards() {
        let value = HostTensor::from_i32(&[5], &[0, 1, 2, 3, 4]).unwrap();
        let p = PartitionInfo {
            full_shape: vec![5],
            var_offset: vec![3],
        };
        let shard = Initializer::Value(value)
            .initialize(&[2], DType::Int32, Some(&p))
            .unwrap();
        assert_eq!(shard.data, TensorData::Int(vec![3, 4]));
    }

    #[test]
    fn constant_fills() {
        let t = Initializer::Constant(2.0).initialize(&[3], DType::Int32, None).unwrap();
        assert_eq!(t.data, TensorData::Int(vec![2, 2, 2]));
    }
}
