//! Real-valued reverse-mode tape
//!
//! This is the native engine underneath every pullback: it records
//! operations on real `f64` arrays and differentiates them in reverse
//! topological order. It knows nothing about complex numbers; the
//! [`trace`](crate::trace) layer builds complex values out of pairs of
//! real nodes.
//!
//! # Modes
//!
//! - [`TapeMode::Concrete`]: every node stores its value.
//! - [`TapeMode::Abstract`]: nodes only carry shapes. Every operation still
//!   checks its shape rule, so a full forward pass yields the output shape
//!   without touching any data. Reading a value is an error.
//!
//! # Freezing
//!
//! Once recording is over, [`Tape::freeze`] turns the tape into an
//! immutable [`FrozenTape`]. Backward passes accumulate into a buffer
//! owned by the call, so one frozen tape can serve any number of
//! concurrent pullbacks.
//!
//! # Example
//!
//! ```
//! use scirs2_core::ndarray_ext::{ArrayD, IxDyn};
//! use wirtinger_ad::tape::Tape;
//!
//! let tape = Tape::new();
//! let x = tape.variable(ArrayD::from_elem(IxDyn(&[2]), 3.0)).unwrap();
//! let y = tape.mul(x, x).unwrap();
//! let loss = tape.sum(y, None).unwrap();
//!
//! let frozen = tape.freeze();
//! let seed = ArrayD::from_elem(IxDyn(&[]), 1.0);
//! let grads = frozen.backward(&[(loss, seed)], &[x]).unwrap();
//! assert_eq!(grads[0][[0]], 6.0);
//! ```

use parking_lot::Mutex;
use scirs2_core::ndarray_ext::{ArrayD, Axis, Ix2, IxDyn, Zip};
use std::collections::HashMap;
use std::fmt;
use wirtinger_core::{Result, WirtingerError};

/// Unique identifier for a node on the tape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Operation that produced a node
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Differentiable input (leaf node)
    Input,
    /// Non-differentiable constant
    Constant,
    /// Addition: z = x + y
    Add { lhs: NodeId, rhs: NodeId },
    /// Subtraction: z = x - y
    Sub { lhs: NodeId, rhs: NodeId },
    /// Multiplication: z = x * y (element-wise)
    Mul { lhs: NodeId, rhs: NodeId },
    /// Division: z = x / y (element-wise)
    Div { lhs: NodeId, rhs: NodeId },
    /// Matrix multiplication: z = x @ y
    MatMul { lhs: NodeId, rhs: NodeId },
    /// Negation: z = -x
    Neg { input: NodeId },
    /// Scaling by a constant: z = c * x
    Scale { input: NodeId, factor: f64 },
    /// Exponential: z = exp(x)
    Exp { input: NodeId },
    /// Natural logarithm: z = log(x)
    Log { input: NodeId },
    /// Sine: z = sin(x)
    Sin { input: NodeId },
    /// Cosine: z = cos(x)
    Cos { input: NodeId },
    /// Tanh: z = tanh(x)
    Tanh { input: NodeId },
    /// Square root: z = sqrt(x)
    Sqrt { input: NodeId },
    /// Absolute value: z = |x|
    Abs { input: NodeId },
    /// Power: z = x^n
    Pow { input: NodeId, exponent: f64 },
    /// Sum reduction: z = sum(x, axis)
    Sum { input: NodeId, axis: Option<usize> },
    /// Reshape: z = reshape(x, new_shape)
    Reshape {
        input: NodeId,
        old_shape: Vec<usize>,
    },
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::Input => "Input",
            Operation::Constant => "Constant",
            Operation::Add { .. } => "Add",
            Operation::Sub { .. } => "Sub",
            Operation::Mul { .. } => "Mul",
            Operation::Div { .. } => "Div",
            Operation::MatMul { .. } => "MatMul",
            Operation::Neg { .. } => "Neg",
            Operation::Scale { .. } => "Scale",
            Operation::Exp { .. } => "Exp",
            Operation::Log { .. } => "Log",
            Operation::Sin { .. } => "Sin",
            Operation::Cos { .. } => "Cos",
            Operation::Tanh { .. } => "Tanh",
            Operation::Sqrt { .. } => "Sqrt",
            Operation::Abs { .. } => "Abs",
            Operation::Pow { .. } => "Pow",
            Operation::Sum { .. } => "Sum",
            Operation::Reshape { .. } => "Reshape",
        }
    }
}

/// Whether a tape computes values or only shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TapeMode {
    #[default]
    Concrete,
    Abstract,
}

#[derive(Debug, Clone)]
struct TapeNode {
    operation: Operation,
    shape: Vec<usize>,
    /// `None` on abstract tapes
    value: Option<ArrayD<f64>>,
    requires_grad: bool,
}

/// Handle to a node on a tape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var {
    id: NodeId,
}

impl Var {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

/// Statistics about a tape
#[derive(Debug, Clone)]
pub struct TapeStats {
    /// Total number of nodes
    pub num_nodes: usize,
    /// Number of nodes holding a value
    pub num_values: usize,
    /// Number of nodes on a path from an input
    pub num_requires_grad: usize,
    /// Count of each operation kind
    pub ops_count: HashMap<String, usize>,
}

fn shape_error(msg: String) -> WirtingerError {
    WirtingerError::ShapeInference(msg)
}

/// Shape of an element-wise binary result; rank-0 operands broadcast
fn broadcast_shapes(op: &str, lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>> {
    if lhs == rhs || rhs.is_empty() {
        Ok(lhs.to_vec())
    } else if lhs.is_empty() {
        Ok(rhs.to_vec())
    } else {
        Err(shape_error(format!(
            "{}: incompatible shapes {:?} and {:?}",
            op, lhs, rhs
        )))
    }
}

fn broadcast_binary<F>(lhs: &ArrayD<f64>, rhs: &ArrayD<f64>, f: F) -> ArrayD<f64>
where
    F: Fn(f64, f64) -> f64,
{
    if lhs.shape() == rhs.shape() {
        let mut out = ArrayD::zeros(lhs.raw_dim());
        Zip::from(&mut out)
            .and(lhs)
            .and(rhs)
            .for_each(|o, &a, &b| *o = f(a, b));
        out
    } else if rhs.ndim() == 0 {
        let b = rhs.iter().next().copied().unwrap_or(0.0);
        lhs.mapv(|a| f(a, b))
    } else {
        let a = lhs.iter().next().copied().unwrap_or(0.0);
        rhs.mapv(|b| f(a, b))
    }
}

/// Reduce a gradient back to the shape of a broadcast operand
fn unbroadcast(grad: ArrayD<f64>, shape: &[usize]) -> ArrayD<f64> {
    if grad.shape() == shape {
        grad
    } else {
        ArrayD::from_elem(IxDyn(shape), grad.sum())
    }
}

/// Recording tape for reverse-mode differentiation
#[derive(Debug, Default)]
pub struct Tape {
    nodes: Mutex<Vec<TapeNode>>,
    mode: TapeMode,
}

impl Tape {
    /// Create a concrete tape
    pub fn new() -> Self {
        Self::with_mode(TapeMode::Concrete)
    }

    /// Create a shape-only tape
    pub fn new_abstract() -> Self {
        Self::with_mode(TapeMode::Abstract)
    }

    pub fn with_mode(mode: TapeMode) -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
            mode,
        }
    }

    pub fn mode(&self) -> TapeMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(
        &self,
        operation: Operation,
        shape: Vec<usize>,
        value: Option<ArrayD<f64>>,
        parents: &[Var],
    ) -> Var {
        let mut nodes = self.nodes.lock();
        let requires_grad = match operation {
            Operation::Input => true,
            Operation::Constant => false,
            _ => parents.iter().any(|p| nodes[p.id.0].requires_grad),
        };
        let id = NodeId(nodes.len());
        let value = match self.mode {
            TapeMode::Concrete => value,
            TapeMode::Abstract => None,
        };
        nodes.push(TapeNode {
            operation,
            shape,
            value,
            requires_grad,
        });
        Var { id }
    }

    /// Record a differentiable input with a concrete value
    pub fn variable(&self, value: ArrayD<f64>) -> Result<Var> {
        if self.mode == TapeMode::Abstract {
            return Err(WirtingerError::InvalidOperation(
                "abstract tapes take placeholders, not values".to_string(),
            ));
        }
        let shape = value.shape().to_vec();
        Ok(self.push(Operation::Input, shape, Some(value), &[]))
    }

    /// Record a differentiable input known only by its shape
    pub fn placeholder(&self, shape: &[usize]) -> Result<Var> {
        if self.mode == TapeMode::Concrete {
            return Err(WirtingerError::InvalidOperation(
                "concrete tapes need a value for every input".to_string(),
            ));
        }
        Ok(self.push(Operation::Input, shape.to_vec(), None, &[]))
    }

    /// Record a non-differentiable constant
    pub fn constant(&self, value: ArrayD<f64>) -> Var {
        let shape = value.shape().to_vec();
        self.push(Operation::Constant, shape, Some(value), &[])
    }

    /// Record a constant filled with zeros
    pub fn zeros(&self, shape: &[usize]) -> Var {
        let value = match self.mode {
            TapeMode::Concrete => Some(ArrayD::zeros(IxDyn(shape))),
            TapeMode::Abstract => None,
        };
        self.push(Operation::Constant, shape.to_vec(), value, &[])
    }

    /// Shape of a node
    pub fn shape(&self, var: Var) -> Result<Vec<usize>> {
        let nodes = self.nodes.lock();
        nodes
            .get(var.id.0)
            .map(|n| n.shape.clone())
            .ok_or_else(|| WirtingerError::InvalidOperation(format!("{} not on tape", var.id)))
    }

    /// Value of a node; fails with `ShapeInference` on abstract tapes
    pub fn value(&self, var: Var) -> Result<ArrayD<f64>> {
        if self.mode == TapeMode::Abstract {
            return Err(shape_error(format!(
                "the value of {} is not available during abstract evaluation",
                var.id
            )));
        }
        let nodes = self.nodes.lock();
        let node = nodes
            .get(var.id.0)
            .ok_or_else(|| WirtingerError::InvalidOperation(format!("{} not on tape", var.id)))?;
        node.value
            .clone()
            .ok_or_else(|| WirtingerError::InvalidOperation(format!("{} holds no value", var.id)))
    }

    /// Value if the tape is concrete, `None` if it is abstract
    fn concrete(&self, var: Var) -> Result<Option<ArrayD<f64>>> {
        match self.mode {
            TapeMode::Abstract => Ok(None),
            TapeMode::Concrete => self.value(var).map(Some),
        }
    }

    fn unary<F>(&self, x: Var, operation: Operation, f: F) -> Result<Var>
    where
        F: Fn(f64) -> f64,
    {
        let shape = self.shape(x)?;
        let value = self.concrete(x)?.map(|v| v.mapv(f));
        Ok(self.push(operation, shape, value, &[x]))
    }

    fn binary<F>(&self, lhs: Var, rhs: Var, operation: Operation, f: F) -> Result<Var>
    where
        F: Fn(f64, f64) -> f64,
    {
        let shape = broadcast_shapes(operation.name(), &self.shape(lhs)?, &self.shape(rhs)?)?;
        let value = match (self.concrete(lhs)?, self.concrete(rhs)?) {
            (Some(a), Some(b)) => Some(broadcast_binary(&a, &b, f)),
            _ => None,
        };
        Ok(self.push(operation, shape, value, &[lhs, rhs]))
    }

    // ===== Operations =====

    /// Addition: z = x + y
    pub fn add(&self, lhs: Var, rhs: Var) -> Result<Var> {
        let op = Operation::Add { lhs: lhs.id, rhs: rhs.id };
        self.binary(lhs, rhs, op, |a, b| a + b)
    }

    /// Subtraction: z = x - y
    pub fn sub(&self, lhs: Var, rhs: Var) -> Result<Var> {
        let op = Operation::Sub { lhs: lhs.id, rhs: rhs.id };
        self.binary(lhs, rhs, op, |a, b| a - b)
    }

    /// Element-wise multiplication: z = x * y
    pub fn mul(&self, lhs: Var, rhs: Var) -> Result<Var> {
        let op = Operation::Mul { lhs: lhs.id, rhs: rhs.id };
        self.binary(lhs, rhs, op, |a, b| a * b)
    }

    /// Element-wise division: z = x / y
    pub fn div(&self, lhs: Var, rhs: Var) -> Result<Var> {
        let op = Operation::Div { lhs: lhs.id, rhs: rhs.id };
        self.binary(lhs, rhs, op, |a, b| a / b)
    }

    /// Matrix multiplication of two 2-d nodes: z = x @ y
    pub fn matmul(&self, lhs: Var, rhs: Var) -> Result<Var> {
        let lhs_shape = self.shape(lhs)?;
        let rhs_shape = self.shape(rhs)?;
        if lhs_shape.len() != 2 || rhs_shape.len() != 2 || lhs_shape[1] != rhs_shape[0] {
            return Err(shape_error(format!(
                "MatMul: cannot multiply {:?} by {:?}",
                lhs_shape, rhs_shape
            )));
        }
        let value = match (self.concrete(lhs)?, self.concrete(rhs)?) {
            (Some(a), Some(b)) => Some(matmul_2d(&a, &b)?),
            _ => None,
        };
        Ok(self.push(
            Operation::MatMul { lhs: lhs.id, rhs: rhs.id },
            vec![lhs_shape[0], rhs_shape[1]],
            value,
            &[lhs, rhs],
        ))
    }

    /// Negation: z = -x
    pub fn neg(&self, x: Var) -> Result<Var> {
        self.unary(x, Operation::Neg { input: x.id }, |a| -a)
    }

    /// Scaling by a constant: z = c * x
    pub fn scale(&self, x: Var, factor: f64) -> Result<Var> {
        self.unary(x, Operation::Scale { input: x.id, factor }, |a| factor * a)
    }

    /// Exponential: z = exp(x)
    pub fn exp(&self, x: Var) -> Result<Var> {
        self.unary(x, Operation::Exp { input: x.id }, f64::exp)
    }

    /// Natural logarithm: z = log(x)
    pub fn log(&self, x: Var) -> Result<Var> {
        self.unary(x, Operation::Log { input: x.id }, f64::ln)
    }

    pub fn sin(&self, x: Var) -> Result<Var> {
        self.unary(x, Operation::Sin { input: x.id }, f64::sin)
    }

    pub fn cos(&self, x: Var) -> Result<Var> {
        self.unary(x, Operation::Cos { input: x.id }, f64::cos)
    }

    pub fn tanh(&self, x: Var) -> Result<Var> {
        self.unary(x, Operation::Tanh { input: x.id }, f64::tanh)
    }

    pub fn sqrt(&self, x: Var) -> Result<Var> {
        self.unary(x, Operation::Sqrt { input: x.id }, f64::sqrt)
    }

    pub fn abs(&self, x: Var) -> Result<Var> {
        self.unary(x, Operation::Abs { input: x.id }, f64::abs)
    }

    /// Power: z = x^n
    pub fn pow(&self, x: Var, exponent: f64) -> Result<Var> {
        self.unary(x, Operation::Pow { input: x.id, exponent }, |a| a.powf(exponent))
    }

    /// Sum over one axis, or over everything when `axis` is `None`
    pub fn sum(&self, x: Var, axis: Option<usize>) -> Result<Var> {
        let in_shape = self.shape(x)?;
        let shape = match axis {
            None => Vec::new(),
            Some(ax) if ax < in_shape.len() => {
                let mut s = in_shape.clone();
                s.remove(ax);
                s
            }
            Some(ax) => {
                return Err(shape_error(format!(
                    "Sum: axis {} out of range for shape {:?}",
                    ax, in_shape
                )))
            }
        };
        let value = self.concrete(x)?.map(|v| match axis {
            None => ArrayD::from_elem(IxDyn(&[]), v.sum()),
            Some(ax) => v.sum_axis(Axis(ax)),
        });
        Ok(self.push(Operation::Sum { input: x.id, axis }, shape, value, &[x]))
    }

    /// Reshape to `new_shape`, keeping row-major order
    pub fn reshape(&self, x: Var, new_shape: &[usize]) -> Result<Var> {
        let old_shape = self.shape(x)?;
        if old_shape.iter().product::<usize>() != new_shape.iter().product::<usize>() {
            return Err(shape_error(format!(
                "Reshape: cannot reshape {:?} into {:?}",
                old_shape, new_shape
            )));
        }
        let value = match self.concrete(x)? {
            Some(v) => Some(reshape_array(&v, new_shape)?),
            None => None,
        };
        Ok(self.push(
            Operation::Reshape {
                input: x.id,
                old_shape,
            },
            new_shape.to_vec(),
            value,
            &[x],
        ))
    }

    /// Get statistics about the tape
    pub fn stats(&self) -> TapeStats {
        let nodes = self.nodes.lock();
        let mut ops_count: HashMap<String, usize> = HashMap::new();
        for node in nodes.iter() {
            *ops_count.entry(node.operation.name().to_string()).or_insert(0) += 1;
        }
        TapeStats {
            num_nodes: nodes.len(),
            num_values: nodes.iter().filter(|n| n.value.is_some()).count(),
            num_requires_grad: nodes.iter().filter(|n| n.requires_grad).count(),
            ops_count,
        }
    }

    /// Stop recording and make the tape immutable
    pub fn freeze(self) -> FrozenTape {
        FrozenTape {
            nodes: self.nodes.into_inner(),
            mode: self.mode,
        }
    }
}

fn reshape_array(value: &ArrayD<f64>, shape: &[usize]) -> Result<ArrayD<f64>> {
    value
        .to_shape(IxDyn(shape))
        .map(|v| v.to_owned())
        .map_err(|e| shape_error(format!("reshape to {:?} failed: {}", shape, e)))
}

fn matmul_2d(lhs: &ArrayD<f64>, rhs: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let lhs_2d = lhs
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| shape_error(format!("MatMul lhs: {}", e)))?;
    let rhs_2d = rhs
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| shape_error(format!("MatMul rhs: {}", e)))?;
    Ok(lhs_2d.dot(&rhs_2d).into_dyn())
}

/// Immutable tape, ready for any number of backward passes
#[derive(Debug)]
pub struct FrozenTape {
    nodes: Vec<TapeNode>,
    mode: TapeMode,
}

impl FrozenTape {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Value recorded for a node
    pub fn value(&self, var: Var) -> Result<&ArrayD<f64>> {
        self.nodes
            .get(var.id.0)
            .and_then(|n| n.value.as_ref())
            .ok_or_else(|| WirtingerError::InvalidOperation(format!("{} holds no value", var.id)))
    }

    /// Vector-Jacobian product of the seeded nodes with respect to `wrt`.
    ///
    /// Each seed pairs an output node with its cotangent; seeding the same
    /// node twice adds the cotangents. Nodes in `wrt` with no path from a
    /// seed receive zeros.
    pub fn backward(&self, seeds: &[(Var, ArrayD<f64>)], wrt: &[Var]) -> Result<Vec<ArrayD<f64>>> {
        if self.mode == TapeMode::Abstract {
            return Err(WirtingerError::InvalidOperation(
                "cannot differentiate an abstract tape".to_string(),
            ));
        }

        let mut grads: Vec<Option<ArrayD<f64>>> = vec![None; self.nodes.len()];
        let mut top = 0;
        for (var, seed) in seeds {
            let node = self.node(var.id)?;
            if seed.shape() != node.shape.as_slice() {
                return Err(WirtingerError::StructureMismatch(format!(
                    "cotangent of shape {:?} seeds {} of shape {:?}",
                    seed.shape(),
                    var.id,
                    node.shape
                )));
            }
            accumulate(&mut grads[var.id.0], seed.clone());
            top = top.max(var.id.0 + 1);
        }

        // ids are allocated in recording order, so descending ids are a
        // reverse topological order
        for idx in (0..top).rev() {
            let node = &self.nodes[idx];
            if !node.requires_grad {
                continue;
            }
            let grad_output = match &grads[idx] {
                Some(g) => g.clone(),
                None => continue,
            };
            for (parent, parent_grad) in self.compute_backward(node, &grad_output)? {
                if self.nodes[parent.0].requires_grad {
                    accumulate(&mut grads[parent.0], parent_grad);
                }
            }
        }

        wrt.iter()
            .map(|var| {
                let node = self.node(var.id)?;
                Ok(grads[var.id.0]
                    .clone()
                    .unwrap_or_else(|| ArrayD::zeros(IxDyn(&node.shape))))
            })
            .collect()
    }

    fn node(&self, id: NodeId) -> Result<&TapeNode> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| WirtingerError::InvalidOperation(format!("{} not on tape", id)))
    }

    fn input_value(&self, id: NodeId, op: &str) -> Result<&ArrayD<f64>> {
        self.node(id)?.value.as_ref().ok_or_else(|| {
            WirtingerError::InvalidOperation(format!("input value not available for {} backward", op))
        })
    }

    /// Gradients for the parents of `node`
    fn compute_backward(
        &self,
        node: &TapeNode,
        grad_output: &ArrayD<f64>,
    ) -> Result<Vec<(NodeId, ArrayD<f64>)>> {
        let shape_of = |id: NodeId| -> Result<&[usize]> { Ok(self.node(id)?.shape.as_slice()) };

        match &node.operation {
            Operation::Input | Operation::Constant => Ok(vec![]),

            Operation::Add { lhs, rhs } => Ok(vec![
                (*lhs, unbroadcast(grad_output.clone(), shape_of(*lhs)?)),
                (*rhs, unbroadcast(grad_output.clone(), shape_of(*rhs)?)),
            ]),

            Operation::Sub { lhs, rhs } => Ok(vec![
                (*lhs, unbroadcast(grad_output.clone(), shape_of(*lhs)?)),
                (*rhs, unbroadcast(grad_output.mapv(|g| -g), shape_of(*rhs)?)),
            ]),

            Operation::Mul { lhs, rhs } => {
                // d/dx (x * y) = y, d/dy (x * y) = x
                let lhs_val = self.input_value(*lhs, "Mul")?;
                let rhs_val = self.input_value(*rhs, "Mul")?;
                let grad_lhs = broadcast_binary(grad_output, rhs_val, |g, b| g * b);
                let grad_rhs = broadcast_binary(grad_output, lhs_val, |g, a| g * a);
                Ok(vec![
                    (*lhs, unbroadcast(grad_lhs, lhs_val.shape())),
                    (*rhs, unbroadcast(grad_rhs, rhs_val.shape())),
                ])
            }

            Operation::Div { lhs, rhs } => {
                // d/dx (x / y) = 1/y, d/dy (x / y) = -x/y^2
                let lhs_val = self.input_value(*lhs, "Div")?;
                let rhs_val = self.input_value(*rhs, "Div")?;
                let grad_lhs = broadcast_binary(grad_output, rhs_val, |g, b| g / b);
                let ratio = broadcast_binary(lhs_val, rhs_val, |a, b| a / (b * b));
                let grad_rhs = broadcast_binary(grad_output, &ratio, |g, r| -g * r);
                Ok(vec![
                    (*lhs, unbroadcast(grad_lhs, lhs_val.shape())),
                    (*rhs, unbroadcast(grad_rhs, rhs_val.shape())),
                ])
            }

            Operation::MatMul { lhs, rhs } => {
                // d/dx (x @ y) = grad_out @ y^T, d/dy (x @ y) = x^T @ grad_out
                let lhs_val = self.input_value(*lhs, "MatMul")?;
                let rhs_val = self.input_value(*rhs, "MatMul")?;
                let to_2d = |a: &ArrayD<f64>| {
                    a.view()
                        .into_dimensionality::<Ix2>()
                        .map(|v| v.to_owned())
                        .map_err(|e| shape_error(format!("MatMul backward: {}", e)))
                };
                let grad_2d = to_2d(grad_output)?;
                let lhs_2d = to_2d(lhs_val)?;
                let rhs_2d = to_2d(rhs_val)?;
                Ok(vec![
                    (*lhs, grad_2d.dot(&rhs_2d.t()).into_dyn()),
                    (*rhs, lhs_2d.t().dot(&grad_2d).into_dyn()),
                ])
            }

            Operation::Neg { input } => Ok(vec![(*input, grad_output.mapv(|g| -g))]),

            Operation::Scale { input, factor } => {
                let factor = *factor;
                Ok(vec![(*input, grad_output.mapv(|g| factor * g))])
            }

            Operation::Exp { input } => {
                // d/dx exp(x) = exp(x), which is this node's own value
                let out_val = node.value.as_ref().ok_or_else(|| {
                    WirtingerError::InvalidOperation("output value not available for Exp backward".to_string())
                })?;
                Ok(vec![(*input, grad_output * out_val)])
            }

            Operation::Log { input } => {
                let x = self.input_value(*input, "Log")?;
                Ok(vec![(*input, grad_output / x)])
            }

            Operation::Sin { input } => {
                let x = self.input_value(*input, "Sin")?;
                Ok(vec![(*input, grad_output * &x.mapv(f64::cos))])
            }

            Operation::Cos { input } => {
                let x = self.input_value(*input, "Cos")?;
                Ok(vec![(*input, grad_output * &x.mapv(|v| -v.sin()))])
            }

            Operation::Tanh { input } => {
                // d/dx tanh(x) = 1 - tanh(x)^2
                let x = self.input_value(*input, "Tanh")?;
                let factor = x.mapv(|v| {
                    let t = v.tanh();
                    1.0 - t * t
                });
                Ok(vec![(*input, grad_output * &factor)])
            }

            Operation::Sqrt { input } => {
                let x = self.input_value(*input, "Sqrt")?;
                Ok(vec![(*input, grad_output * &x.mapv(|v| 0.5 / v.sqrt()))])
            }

            Operation::Abs { input } => {
                let x = self.input_value(*input, "Abs")?;
                let sign = x.mapv(|v| {
                    if v > 0.0 {
                        1.0
                    } else if v < 0.0 {
                        -1.0
                    } else {
                        0.0
                    }
                });
                Ok(vec![(*input, grad_output * &sign)])
            }

            Operation::Pow { input, exponent } => {
                // d/dx x^n = n * x^(n-1)
                let x = self.input_value(*input, "Pow")?;
                let n = *exponent;
                Ok(vec![(*input, grad_output * &x.mapv(|v| n * v.powf(n - 1.0)))])
            }

            Operation::Sum { input, axis } => {
                // Broadcast gradient back to input shape
                let input_shape = shape_of(*input)?;
                let grad_input = match axis {
                    None => {
                        let g = grad_output.iter().next().copied().unwrap_or(0.0);
                        ArrayD::from_elem(IxDyn(input_shape), g)
                    }
                    Some(ax) => {
                        let mut new_shape = grad_output.shape().to_vec();
                        new_shape.insert(*ax, 1);
                        let reshaped = reshape_array(grad_output, &new_shape)?;
                        reshaped
                            .broadcast(IxDyn(input_shape))
                            .ok_or_else(|| shape_error("Broadcast failed in Sum backward".to_string()))?
                            .to_owned()
                    }
                };
                Ok(vec![(*input, grad_input)])
            }

            Operation::Reshape { input, old_shape } => {
                Ok(vec![(*input, reshape_array(grad_output, old_shape)?)])
            }
        }
    }
}

fn accumulate(slot: &mut Option<ArrayD<f64>>, grad: ArrayD<f64>) {
    match slot {
        Some(current) => *current = &*current + &grad,
        None => *slot = Some(grad),
    }
}
