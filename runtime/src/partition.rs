// partition.rs — Splitting a variable into shards along one dimension
//
// Preconditions: full shapes are fully defined with rank >= 1.
// Postconditions: shard extents along the sliced dimension sum to the full
//                 extent; the first `extent % count` shards are one unit larger.
// Failure modes: counts of the wrong length, counts < 1, more than one sliced
//                dimension, or more shards than units → `Error::InvalidPartition`.
// Side effects: none.

use std::fmt;
use std::sync::Arc;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::variable::Variable;

/// Where a shard sits inside its full variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionInfo {
    pub full_shape: Vec<i64>,
    pub var_offset: Vec<i64>,
}

impl PartitionInfo {
    /// The dimension the shard is offset along (0 for the first shard).
    pub fn single_offset_dim(&self) -> usize {
        self.var_offset.iter().position(|o| *o != 0).unwrap_or(0)
    }
}

/// Chooses per-dimension shard counts for a variable of a given shape and dtype.
pub trait Partitioner: Send + Sync {
    fn partition(&self, shape: &[i64], dtype: DType) -> Result<Vec<usize>>;
}

impl<F> Partitioner for F
where
    F: Fn(&[i64], DType) -> Vec<usize> + Send + Sync,
{
    fn partition(&self, shape: &[i64], dtype: DType) -> Result<Vec<usize>> {
        Ok(self(shape, dtype))
    }
}

/// `num_shards` shards along `axis`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSizePartitioner {
    pub num_shards: usize,
    pub axis: usize,
}

impl Partitioner for FixedSizePartitioner {
    fn partition(&self, shape: &[i64], _dtype: DType) -> Result<Vec<usize>> {
        if self.axis >= shape.len() {
            return Err(Error::invalid(format!(
                "partition axis {} out of range for rank {}",
                self.axis,
                shape.len()
            )));
        }
        let mut counts = vec![1; shape.len()];
        counts[self.axis] = self.num_shards;
        Ok(counts)
    }
}

/// As many shards along `axis` as keep each at least `min_slice_size` bytes,
/// capped by `max_partitions` and by the axis extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinMaxPartitioner {
    pub max_partitions: usize,
    pub axis: usize,
    pub min_slice_size: usize,
    /// Assumed size of one string element.
    pub bytes_per_string_element: usize,
}

impl Default for MinMaxPartitioner {
    fn default() -> Self {
        MinMaxPartitioner {
            max_partitions: 1,
            axis: 0,
            min_slice_size: 256 << 10,
            bytes_per_string_element: 16,
        }
    }
}

impl Partitioner for MinMaxPartitioner {
    fn partition(&self, shape: &[i64], dtype: DType) -> Result<Vec<usize>> {
        if self.max_partitions == 0 {
            return Err(Error::invalid("max_partitions must be >= 1"));
        }
        if self.axis >= shape.len() {
            return Err(Error::invalid(format!(
                "partition axis {} out of range for rank {}",
                self.axis,
                shape.len()
            )));
        }
        let elements: i64 = shape.iter().product();
        let bytes_per_element = dtype.size().unwrap_or(self.bytes_per_string_element);
        let total = elements.max(0) as usize * bytes_per_element;
        let wanted = total.div_ceil(self.min_slice_size.max(1));
        let mut counts = vec![1; shape.len()];
        counts[self.axis] = wanted
            .min(self.max_partitions)
            .min(shape[self.axis].max(0) as usize)
            .max(1);
        Ok(counts)
    }
}

/// One shard's placement: offset and extent per dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    pub offset: Vec<i64>,
    pub shape: Vec<i64>,
}

/// Validate `counts` against `full_shape` and return `(slice_dim, num_slices)`.
pub fn slice_dim_and_count(name: &str, full_shape: &[i64], counts: &[usize]) -> Result<(usize, usize)> {
    let invalid = |message: String| Error::InvalidPartition {
        name: name.to_string(),
        message,
    };
    if full_shape.is_empty() {
        return Err(invalid("a partitioned variable must have rank >= 1".into()));
    }
    if counts.len() != full_shape.len() {
        return Err(invalid(format!(
            "partitioner returned {} counts for a variable of rank {}",
            counts.len(),
            full_shape.len()
        )));
    }
    if counts.iter().any(|c| *c < 1) {
        return Err(invalid(format!("partition counts must be >= 1, got {:?}", counts)));
    }
    let mut sliced = counts.iter().enumerate().filter(|(_, c)| **c > 1);
    let (dim, count) = match (sliced.next(), sliced.next()) {
        (None, _) => (0, 1),
        (Some((d, c)), None) => (d, *c),
        (Some(_), Some(_)) => {
            return Err(invalid(format!(
                "can only slice a variable along one dimension, got counts {:?}",
                counts
            )))
        }
    };
    if count as i64 > full_shape[dim] {
        return Err(invalid(format!(
            "cannot split dimension {} of extent {} into {} shards",
            dim, full_shape[dim], count
        )));
    }
    Ok((dim, count))
}

/// Shard placements for `full_shape` split by `counts`.
pub fn compute_slices(name: &str, full_shape: &[i64], counts: &[usize]) -> Result<Vec<Slice>> {
    let (dim, count) = slice_dim_and_count(name, full_shape, counts)?;
    let extent = full_shape[dim];
    let base = extent / count as i64;
    let extra = (extent % count as i64) as usize;
    let mut offset = 0;
    let mut slices = Vec::with_capacity(count);
    for i in 0..count {
        let size = base + i64::from(i < extra);
        let mut shard_offset = vec![0; full_shape.len()];
        shard_offset[dim] = offset;
        let mut shape = full_shape.to_vec();
        shape[dim] = size;
        slices.push(Slice {
            offset: shard_offset,
            shape,
        });
        offset += size;
    }
    Ok(slices)
}

/// Name of shard `i` of `name`.
pub fn shard_name(name: &str, i: usize) -> String {
    format!("{}/part_{}", name, i)
}

/// A variable stored as shards along one dimension.
#[derive(Debug)]
pub struct PartitionedVariable {
    pub name: String,
    pub full_shape: Vec<i64>,
    pub dtype: DType,
    pub partitions: Vec<usize>,
    pub shards: Vec<Arc<Variable>>,
}

impl PartitionedVariable {
    pub fn shape(&self) -> Shape {
        Shape::from_dims(&self.full_shape)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn shards(&self) -> &[Arc<Variable>] {
        &self.shards
    }
}

impl fmt::Display for PartitionedVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (shape {}, dtype {}, partitions {:?})",
            self.name,
            self.shape(),
            self.dtype,
            self.partitions
        )
    }
}
