// regularizer.rs — Weight penalties recorded when variables are created
//
// A regularizer turns a variable's value into a scalar penalty tensor built
// in the current graph. Scales must be non-negative; a zero scale disables
// the penalty.

use std::fmt;

use crate::builder::GraphBuilder;
use crate::error::{Error, Result};
use crate::graph::TensorRef;

#[derive(Debug, Clone, PartialEq)]
pub enum Regularizer {
    /// `scale * sum(|w|)`
    L1(f64),
    /// `scale * sum(w²) / 2`
    L2(f64),
    L1L2 { l1: f64, l2: f64 },
    /// Sum of the penalties that are not disabled.
    Sum(Vec<Regularizer>),
}

impl Regularizer {
    fn check_scale(scale: f64) -> Result<()> {
        if scale < 0.0 || !scale.is_finite() {
            return Err(Error::invalid(format!(
                "regularizer scale must be a finite number >= 0, got {}",
                scale
            )));
        }
        Ok(())
    }

    /// Build the penalty for `weights`; `None` when disabled.
    pub fn apply(&self, b: &mut GraphBuilder<'_>, weights: &TensorRef) -> Result<Option<TensorRef>> {
        match self {
            Regularizer::L1(scale) => {
                Self::check_scale(*scale)?;
                if *scale == 0.0 {
                    return Ok(None);
                }
                let abs = b.op("Abs").input(weights).finish_one()?;
                let sum = b.op("Sum").input(&abs).finish_one()?;
                scaled(b, *scale, &sum, "l1_regularizer").map(Some)
            }
            Regularizer::L2(scale) => {
                Self::check_scale(*scale)?;
                if *scale == 0.0 {
                    return Ok(None);
                }
                let loss = b.op("L2Loss").input(weights).finish_one()?;
                scaled(b, *scale, &loss, "l2_regularizer").map(Some)
            }
            Regularizer::L1L2 { l1, l2 } => {
                Regularizer::Sum(vec![Regularizer::L1(*l1), Regularizer::L2(*l2)]).apply(b, weights)
            }
            Regularizer::Sum(parts) => {
                let mut penalties = Vec::with_capacity(parts.len());
                for part in parts {
                    if let Some(t) = part.apply(b, weights)? {
                        penalties.push(t);
                    }
                }
                match penalties.len() {
                    0 => Ok(None),
                    1 => Ok(penalties.pop()),
                    _ => b
                        .op("AddN")
                        .name("sum_regularizer")
                        .inputs(&penalties)
                        .finish_one()
                        .map(Some),
                }
            }
        }
    }
}

fn scaled(b: &mut GraphBuilder<'_>, scale: f64, t: &TensorRef, name: &str) -> Result<TensorRef> {
    let dtype = b.graph().output(t)?.dtype;
    let scale = b.scalar(scale, dtype)?;
    b.op("Mul").name(name).input(&scale).input(t).finish_one()
}

impl fmt::Display for Regularizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regularizer::L1(s) => write!(f, "l1({})", s),
            Regularizer::L2(s) => write!(f, "l2({})", s),
            Regularizer::L1L2 { l1, l2 } => write!(f, "l1_l2({}, {})", l1, l2),
            Regularizer::Sum(parts) => {
                write!(f, "sum(")?;
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ")")
            }
        }
    }
}
