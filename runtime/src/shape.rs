// shape.rs — Static tensor shapes with unknown rank and unknown dimensions
//
// Preconditions: none.
// Postconditions: `merge_with` returns the most specific shape compatible with both inputs.
// Failure modes: `merge_with` returns `None` when shapes are incompatible.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A possibly partial shape. `dims == None` means the rank is unknown;
/// a `None` dimension is unknown along that axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Option<Vec<Option<i64>>>,
}

impl Shape {
    pub fn unknown() -> Self {
        Shape { dims: None }
    }

    pub fn scalar() -> Self {
        Shape {
            dims: Some(Vec::new()),
        }
    }

    /// A fully defined shape.
    pub fn from_dims(dims: &[i64]) -> Self {
        Shape {
            dims: Some(dims.iter().map(|d| Some(*d)).collect()),
        }
    }

    /// A shape of known rank where `-1` marks an unknown dimension.
    pub fn from_partial(dims: &[i64]) -> Self {
        Shape {
            dims: Some(
                dims.iter()
                    .map(|d| if *d < 0 { None } else { Some(*d) })
                    .collect(),
            ),
        }
    }

    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(|d| d.len())
    }

    pub fn is_scalar(&self) -> bool {
        self.rank() == Some(0)
    }

    pub fn is_fully_defined(&self) -> bool {
        match &self.dims {
            Some(dims) => dims.iter().all(|d| d.is_some()),
            None => false,
        }
    }

    /// Concrete dimensions when the shape is fully defined.
    pub fn to_vec(&self) -> Option<Vec<i64>> {
        let dims = self.dims.as_ref()?;
        dims.iter().copied().collect()
    }

    /// Dimensions with `-1` for unknown axes; `None` for unknown rank.
    pub fn to_partial(&self) -> Option<Vec<i64>> {
        self.dims
            .as_ref()
            .map(|dims| dims.iter().map(|d| d.unwrap_or(-1)).collect())
    }

    pub fn num_elements(&self) -> Option<i64> {
        self.to_vec().map(|d| d.iter().product())
    }

    /// Two shapes are compatible when they could describe the same tensor.
    pub fn is_compatible_with(&self, other: &Shape) -> bool {
        match (&self.dims, &other.dims) {
            (Some(a), Some(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| match (x, y) {
                        (Some(x), Some(y)) => x == y,
                        _ => true,
                    })
            }
            _ => true,
        }
    }

    pub fn merge_with(&self, other: &Shape) -> Option<Shape> {
        match (&self.dims, &other.dims) {
            (None, _) => Some(other.clone()),
            (_, None) => Some(self.clone()),
            (Some(a), Some(b)) => {
                if a.len() != b.len() {
                    return None;
                }
                let mut dims = Vec::with_capacity(a.len());
                for (x, y) in a.iter().zip(b) {
                    dims.push(match (x, y) {
                        (Some(x), Some(y)) if x != y => return None,
                        (Some(x), _) => Some(*x),
                        (None, y) => *y,
                    });
                }
                Some(Shape { dims: Some(dims) })
            }
        }
    }

    /// Broadcast two shapes elementwise, treating a scalar as broadcastable to anything.
    pub fn broadcast(&self, other: &Shape) -> Shape {
        if self.is_scalar() {
            return other.clone();
        }
        if other.is_scalar() {
            return self.clone();
        }
        self.merge_with(other).unwrap_or_else(Shape::unknown)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dims {
            None => write!(f, "<unknown>"),
            Some(dims) => {
                write!(f, "(")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match d {
                        Some(n) => write!(f, "{}", n)?,
                        None => write!(f, "?")?,
                    }
                }
                if dims.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_treats_unknown_as_wildcard() {
        let a = Shape::from_partial(&[2, -1]);
        assert!(a.is_compatible_with(&Shape::from_dims(&[2, 1])));
        assert!(a.is_compatible_with(&Shape::from_dims(&[2, 3])));
        assert!(!a.is_compatible_with(&Shape::from_dims(&[3, 3])));
        assert!(!a.is_compatible_with(&Shape::from_dims(&[2])));
        assert!(Shape::unknown().is_compatible_with(&a));
    }

    #[test]
    fn merge_prefers_known_dims() {
        let a = Shape::from_partial(&[-1, 4]);
        let b = Shape::from_partial(&[3, -1]);
        assert_eq!(a.merge_with(&b), Some(Shape::from_dims(&[3, 4])));
        assert_eq!(a.merge_with(&Shape::from_dims(&[3, 5])), None);
    }

    #[test]
    fn display_forms() {
        assert_eq!(Shape::unknown().to_string(), "<unknown>");
        assert_eq!(Shape::scalar().to_string(), "()");
        assert_eq!(Shape::from_dims(&[130]).to_string(), "(130,)");
        assert_eq!(Shape::from_partial(&[2, -1]).to_string(), "(2, ?)");
    }

    #[test]
    fn fully_defined_and_elements() {
        assert!(Shape::scalar().is_fully_defined());
        assert_eq!(Shape::scalar().num_elements(), Some(1));
        assert!(!Shape::from_partial(&[-1]).is_fully_defined());
        assert_eq!(Shape::from_dims(&[2, 3]).num_elements(), Some(6));
    }
}
