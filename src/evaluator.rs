//! Expression evaluator
//!
//! Resolves symbolic scalars against run-time bindings: fusion inputs,
//! parallel-dimension extents, and tensors materialized during a run.
//! Evaluation is pure recursion over the arena; nothing is cached, so a
//! binding added between two evaluations is always observed.

use std::collections::HashMap;

use crate::args::TensorArg;
use crate::error::{LanzarError, Result};
use crate::ir::{
    BinaryOp, Fusion, FusionInput, ParallelType, ScalarExpr, ScalarId, TensorId, UnaryOp,
};

/// A resolved run-time value
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    /// Integer scalar
    Int(i64),
    /// Boolean scalar
    Bool(bool),
    /// Floating scalar
    Double(f64),
    /// Tensor descriptor
    Tensor(TensorArg),
}

impl EvalValue {
    /// Integer view of the value
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            EvalValue::Int(v) => Some(*v),
            EvalValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Boolean view of the value
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            EvalValue::Bool(b) => Some(*b),
            EvalValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Tensor view of the value
    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorArg> {
        match self {
            EvalValue::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

/// Evaluator over one fusion's scalar arena
#[derive(Debug)]
pub struct ExpressionEvaluator<'a> {
    fusion: &'a Fusion,
    scalars: HashMap<ScalarId, EvalValue>,
    tensors: HashMap<TensorId, TensorArg>,
    parallel: HashMap<ParallelType, i64>,
}

impl<'a> ExpressionEvaluator<'a> {
    /// Fresh evaluator with no bindings
    #[must_use]
    pub fn new(fusion: &'a Fusion) -> Self {
        Self {
            fusion,
            scalars: HashMap::new(),
            tensors: HashMap::new(),
            parallel: HashMap::new(),
        }
    }

    /// The fusion this evaluator resolves against
    #[must_use]
    pub fn fusion(&self) -> &'a Fusion {
        self.fusion
    }

    /// Bind a scalar. Rebinding requires the same value.
    pub fn bind_scalar(&mut self, id: ScalarId, value: EvalValue) -> Result<()> {
        if let Some(existing) = self.scalars.get(&id) {
            if *existing != value {
                return Err(LanzarError::InvalidProgram(format!(
                    "Attempted to bind {} to {value:?} but it is already bound to {existing:?}",
                    self.fusion.scalar_to_string(id),
                )));
            }
            return Ok(());
        }
        self.scalars.insert(id, value);
        Ok(())
    }

    /// Bind a tensor descriptor. Later bindings replace earlier ones;
    /// callers use [`Self::is_known_tensor`] to share duplicates.
    pub fn bind_tensor(&mut self, id: TensorId, arg: TensorArg) {
        self.tensors.insert(id, arg);
    }

    /// Whether the tensor has been materialized already
    #[must_use]
    pub fn is_known_tensor(&self, id: TensorId) -> bool {
        self.tensors.contains_key(&id)
    }

    /// Materialized descriptor for a tensor, if any
    #[must_use]
    pub fn tensor(&self, id: TensorId) -> Option<&TensorArg> {
        self.tensors.get(&id)
    }

    /// Bind the runtime extent of a parallel dimension
    pub fn bind_parallel(&mut self, parallel: ParallelType, value: i64) {
        self.parallel.insert(parallel, value);
    }

    /// Bind one fusion input to its run-time value
    ///
    /// Tensor inputs also bind the extents of their logical domains, so
    /// downstream shape expressions resolve.
    pub fn bind_input(&mut self, input: FusionInput, value: &EvalValue) -> Result<()> {
        match input {
            FusionInput::Scalar(sid) => self.bind_scalar(sid, value.clone()),
            FusionInput::Tensor(tid) => {
                let arg = value.as_tensor().ok_or_else(|| {
                    LanzarError::InvalidProgram(format!(
                        "Fusion input {} expects a tensor argument",
                        self.fusion.tensor_view(tid).name
                    ))
                })?;
                let tv = self.fusion.tensor_view(tid);
                let logical = self.fusion.no_reduction_logical(tv);
                if logical.len() != arg.sizes.len() {
                    return Err(LanzarError::RankMismatch {
                        buffer: tv.name.clone(),
                        reason: format!(
                            "input has rank {} but the logical domain has rank {}",
                            arg.sizes.len(),
                            logical.len()
                        ),
                    });
                }
                for (&did, &size) in logical.iter().zip(arg.sizes.iter()) {
                    let id = self.fusion.iter_domain(did);
                    let target = if id.is_broadcast() && id.has_expanded_extent() {
                        id.maybe_expanded_extent()
                    } else {
                        id.extent
                    };
                    self.bind_scalar(target, EvalValue::Int(size))?;
                }
                self.bind_tensor(tid, arg.clone());
                Ok(())
            }
        }
    }

    /// Evaluate a scalar; `None` when a required binding is missing
    #[must_use]
    pub fn evaluate(&self, id: ScalarId) -> Option<EvalValue> {
        match self.fusion.scalar(id) {
            ScalarExpr::Constant(v) => Some(EvalValue::Int(*v)),
            ScalarExpr::Input { .. } => self.scalars.get(&id).cloned(),
            ScalarExpr::Parallel(p) => self.parallel.get(p).copied().map(EvalValue::Int),
            ScalarExpr::Unary { op, a } => {
                let a = self.evaluate(*a)?;
                match op {
                    UnaryOp::Neg => Some(EvalValue::Int(-a.as_int()?)),
                    UnaryOp::Not => Some(EvalValue::Bool(!a.as_bool()?)),
                }
            }
            ScalarExpr::Binary { op, a, b } => {
                // A binding directly on the composite node (a pinned
                // launch constraint) wins over recomputation.
                if let Some(bound) = self.scalars.get(&id) {
                    return Some(bound.clone());
                }
                let a = self.evaluate(*a)?;
                let b = self.evaluate(*b)?;
                self.apply_binary(*op, &a, &b)
            }
        }
    }

    fn apply_binary(&self, op: BinaryOp, a: &EvalValue, b: &EvalValue) -> Option<EvalValue> {
        use BinaryOp::{
            Add, And, CeilDiv, Div, Eq, Ge, Gt, Le, Lt, Max, Min, Mod, Mul, Ne, Or, Sub,
        };
        match op {
            And => return Some(EvalValue::Bool(a.as_bool()? && b.as_bool()?)),
            Or => return Some(EvalValue::Bool(a.as_bool()? || b.as_bool()?)),
            _ => {}
        }
        let x = a.as_int()?;
        let y = b.as_int()?;
        let result = match op {
            Add => EvalValue::Int(x + y),
            Sub => EvalValue::Int(x - y),
            Mul => EvalValue::Int(x * y),
            Div => {
                if y == 0 {
                    return None;
                }
                EvalValue::Int(x / y)
            }
            CeilDiv => {
                if y == 0 {
                    return None;
                }
                EvalValue::Int((x + y - 1) / y)
            }
            Mod => {
                if y == 0 {
                    return None;
                }
                EvalValue::Int(x % y)
            }
            Min => EvalValue::Int(x.min(y)),
            Max => EvalValue::Int(x.max(y)),
            Eq => EvalValue::Bool(x == y),
            Ne => EvalValue::Bool(x != y),
            Lt => EvalValue::Bool(x < y),
            Le => EvalValue::Bool(x <= y),
            Gt => EvalValue::Bool(x > y),
            Ge => EvalValue::Bool(x >= y),
            And | Or => unreachable!("handled above"),
        };
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::DataType;

    #[test]
    fn test_evaluate_arithmetic() {
        let mut fusion = Fusion::new();
        let a = fusion.named("i0");
        let b = fusion.constant(3);
        let sum = fusion.binary(BinaryOp::Add, a, b);
        let ceil = fusion.binary(BinaryOp::CeilDiv, sum, b);

        let mut ee = ExpressionEvaluator::new(&fusion);
        assert_eq!(ee.evaluate(sum), None);
        ee.bind_scalar(a, EvalValue::Int(7)).expect("bind");
        assert_eq!(ee.evaluate(sum), Some(EvalValue::Int(10)));
        assert_eq!(ee.evaluate(ceil), Some(EvalValue::Int(4)));
    }

    #[test]
    fn test_conflicting_bind_rejected() {
        let mut fusion = Fusion::new();
        let a = fusion.named("i0");
        let mut ee = ExpressionEvaluator::new(&fusion);
        ee.bind_scalar(a, EvalValue::Int(4)).expect("bind");
        assert!(ee.bind_scalar(a, EvalValue::Int(4)).is_ok());
        assert!(ee.bind_scalar(a, EvalValue::Int(5)).is_err());
    }

    #[test]
    fn test_parallel_binding() {
        let mut fusion = Fusion::new();
        let bdx = fusion.parallel_extent(ParallelType::TIDx);
        let two = fusion.constant(2);
        let doubled = fusion.binary(BinaryOp::Mul, bdx, two);

        let mut ee = ExpressionEvaluator::new(&fusion);
        assert_eq!(ee.evaluate(doubled), None);
        ee.bind_parallel(ParallelType::TIDx, 128);
        assert_eq!(ee.evaluate(doubled), Some(EvalValue::Int(256)));
    }

    #[test]
    fn test_bind_tensor_input_binds_extents() {
        let mut fusion = Fusion::new();
        let e0 = fusion.named("i0");
        let e1 = fusion.named("i1");
        let d0 = fusion.domain(crate::ir::IterDomain::iteration(e0));
        let d1 = fusion.domain(crate::ir::IterDomain::iteration(e1));
        let tv = fusion.tensor(crate::ir::TensorView::contiguous(
            "T0",
            DataType::Float,
            vec![d0, d1],
        ));
        fusion.inputs.push(FusionInput::Tensor(tv));

        let arg = TensorArg {
            ptr: 0xdead_beef,
            sizes: vec![2, 5],
            strides: vec![5, 1],
            dtype: DataType::Float,
            on_device: true,
        };
        let mut ee = ExpressionEvaluator::new(&fusion);
        ee.bind_input(FusionInput::Tensor(tv), &EvalValue::Tensor(arg))
            .expect("bind input");
        assert_eq!(ee.evaluate(e0), Some(EvalValue::Int(2)));
        assert_eq!(ee.evaluate(e1), Some(EvalValue::Int(5)));
        assert!(ee.is_known_tensor(tv));
    }
}
