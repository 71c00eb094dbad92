use std::{cell::RefCell, rc::Rc};

use ndarray::{ArcArray, Axis, IxDyn};

use crate::accumulate_grad::AccumulateGrad;
use crate::add::Add;
use crate::error::{GradError, GradResult};
use crate::function::Function;
use crate::mul::Mul;
use crate::node::Node;
use crate::Cell;

/// A dynamically-shaped f64 tensor with the autograd bookkeeping the backward
/// graph needs. `grad` and `grad_fn` live behind shared cells so every clone
/// of a leaf observes the same gradient slot and the same accumulation node.
#[derive(Clone)]
pub struct Tensor {
    pub data: ArcArray<f64, IxDyn>,
    pub requires_grad: bool,
    pub is_leaf: bool,
    pub(crate) grad: Cell<Option<Tensor>>,
    pub(crate) grad_fn: Cell<Option<Cell<Node>>>,
    pub(crate) detached: bool,
}

impl Tensor {
    pub fn from_data(data: ArcArray<f64, IxDyn>) -> Self {
        Tensor {
            data,
            requires_grad: false,
            is_leaf: true,
            grad: Rc::new(RefCell::new(None)),
            grad_fn: Rc::new(RefCell::new(None)),
            detached: false,
        }
    }

    pub fn filled(shape: &[usize], value: f64) -> Tensor {
        Tensor::from_data(ArcArray::from_elem(IxDyn(shape), value))
    }

    pub fn zeros(shape: &[usize]) -> Tensor {
        Tensor::filled(shape, 0.0)
    }

    pub fn ones_like(other: &Tensor) -> Tensor {
        Tensor::filled(other.shape(), 1.0)
    }

    /// Gradient tensor built from `data` during a backward pass. Detached so
    /// it does not feed back into the graph unless accumulation retraces it.
    pub(crate) fn detached(data: ArcArray<f64, IxDyn>) -> Tensor {
        let mut t = Tensor::from_data(data);
        t.detached = true;
        t
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.data.iter().copied().collect()
    }

    pub fn grad(&self) -> Option<Tensor> {
        self.grad.borrow().clone()
    }

    pub fn grad_fn(&self) -> Option<Cell<Node>> {
        self.grad_fn.borrow().clone()
    }

    pub(crate) fn set_grad_fn(&self, node: Node) {
        self.grad_fn.replace(Some(Rc::new(RefCell::new(node))));
    }

    pub fn zero_grad(&mut self) {
        self.grad_fn.replace(None);
        self.grad.replace(None);
    }

    pub fn detach(&mut self) {
        self.detached = true;
    }

    pub fn reattach(&mut self) {
        self.detached = false;
    }

    /// Traced elementwise addition with broadcasting.
    pub fn try_add(&self, rhs: &Tensor) -> GradResult<Tensor> {
        let mut op = Add {
            left: Rc::new(RefCell::new(self.clone())),
            right: Rc::new(RefCell::new(rhs.clone())),
        };
        single(op.apply()?, "Add")
    }

    /// Traced elementwise multiplication with broadcasting.
    pub fn try_mul(&self, rhs: &Tensor) -> GradResult<Tensor> {
        let mut op = Mul {
            left: Rc::new(RefCell::new(self.clone())),
            right: Rc::new(RefCell::new(rhs.clone())),
        };
        single(op.apply()?, "Mul")
    }

    /// Gradient summation. With `create_graph` the sum goes through the traced
    /// add op so a later backward pass can differentiate it; otherwise the
    /// addition is eager and the result carries no graph state.
    pub(crate) fn accumulate(&self, rhs: &Tensor, create_graph: bool) -> GradResult<Tensor> {
        if create_graph {
            return self.try_add(rhs);
        }
        Ok(Tensor::detached(broadcast_add(&self.data, &rhs.data)?))
    }

    /// Runs a backward pass from this tensor, seeding with ones.
    pub fn backward(&mut self) -> GradResult<()> {
        crate::backward::backward(self)
    }

    /// Attaches a reduce hook to this leaf's accumulation node, creating the
    /// node first if the leaf has not been used in a traced op yet.
    pub fn register_reduce_hook<F>(&self, hook: F) -> GradResult<()>
    where
        F: FnMut(&Tensor) -> GradResult<()> + 'static,
    {
        let Some(node) = grad_fn_for(self) else {
            return Err(GradError::Hook(
                "tensor does not accumulate gradients".to_string(),
            ));
        };
        let result = match &mut *node.borrow_mut() {
            Node::AccumulateGrad { inner } => {
                inner.register_reduce_hook(hook);
                Ok(())
            }
            Node::BackwardFunctionWrapper { .. } => Err(GradError::Hook(
                "reduce hooks only attach to gradient-accumulating leaves".to_string(),
            )),
        };
        result
    }
}

/// Resolves the backward-graph node gradients for `t` should flow to,
/// lazily attaching an accumulation node the first time a grad-requiring
/// leaf participates in a traced op.
pub(crate) fn grad_fn_for(t: &Tensor) -> Option<Cell<Node>> {
    if t.detached {
        return None;
    }
    let mut slot = t.grad_fn.borrow_mut();
    if slot.is_none() && t.is_leaf && t.requires_grad {
        *slot = Some(Rc::new(RefCell::new(Node::AccumulateGrad {
            inner: AccumulateGrad::bound(t),
        })));
    }
    slot.clone()
}

fn single(outputs: Vec<Tensor>, node: &'static str) -> GradResult<Tensor> {
    let got = outputs.len();
    outputs.into_iter().next().ok_or(GradError::InvalidArity {
        node,
        expected: 1,
        got,
    })
}

/// Shape two operands broadcast to under the usual right-aligned rules.
pub(crate) fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> GradResult<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut shape = Vec::with_capacity(rank);
    for i in 0..rank {
        let l = if i + lhs.len() >= rank {
            lhs[i + lhs.len() - rank]
        } else {
            1
        };
        let r = if i + rhs.len() >= rank {
            rhs[i + rhs.len() - rank]
        } else {
            1
        };
        if l == r || l == 1 || r == 1 {
            shape.push(l.max(r));
        } else {
            return Err(GradError::ShapeMismatch {
                lhs: lhs.to_vec(),
                rhs: rhs.to_vec(),
            });
        }
    }
    Ok(shape)
}

pub(crate) fn broadcast_with<F>(
    lhs: &ArcArray<f64, IxDyn>,
    rhs: &ArcArray<f64, IxDyn>,
    op: F,
) -> GradResult<ArcArray<f64, IxDyn>>
where
    F: Fn(f64, f64) -> f64,
{
    let shape = broadcast_shape(lhs.shape(), rhs.shape())?;
    let mismatch = || GradError::ShapeMismatch {
        lhs: lhs.shape().to_vec(),
        rhs: rhs.shape().to_vec(),
    };
    let l = lhs.broadcast(&shape[..]).ok_or_else(mismatch)?;
    let r = rhs.broadcast(&shape[..]).ok_or_else(mismatch)?;
    let mut out = l.to_owned();
    out.zip_mut_with(&r, |x, &y| *x = op(*x, y));
    Ok(out.into_shared())
}

pub(crate) fn broadcast_add(
    lhs: &ArcArray<f64, IxDyn>,
    rhs: &ArcArray<f64, IxDyn>,
) -> GradResult<ArcArray<f64, IxDyn>> {
    broadcast_with(lhs, rhs, |a, b| a + b)
}

pub(crate) fn broadcast_mul(
    lhs: &ArcArray<f64, IxDyn>,
    rhs: &ArcArray<f64, IxDyn>,
) -> GradResult<ArcArray<f64, IxDyn>> {
    broadcast_with(lhs, rhs, |a, b| a * b)
}

/// Reduces a gradient produced against a broadcast shape back to the shape of
/// the input it belongs to, summing over the broadcast axes.
pub(crate) fn unbroadcast(grad: &ArcArray<f64, IxDyn>, shape: &[usize]) -> ArcArray<f64, IxDyn> {
    let mut g = grad.to_owned();
    while g.ndim() > shape.len() {
        g = g.sum_axis(Axis(0));
    }
    for (axis, &dim) in shape.iter().enumerate() {
        if g.shape()[axis] != dim {
            g = g.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    g.into_shared()
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("data", &self.data)
            .field("requires_grad", &self.requires_grad)
            .field("is_leaf", &self.is_leaf)
            .field("grad", &self.grad)
            .field("detached", &self.detached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::GradError;

    #[test]
    fn test_broadcast_shape_rules() {
        assert_eq!(broadcast_shape(&[2, 2], &[2, 2]).unwrap(), vec![2, 2]);
        assert_eq!(broadcast_shape(&[2, 3], &[3]).unwrap(), vec![2, 3]);
        assert_eq!(broadcast_shape(&[4, 1], &[1, 5]).unwrap(), vec![4, 5]);
        assert_eq!(broadcast_shape(&[], &[3]).unwrap(), vec![3]);
        assert!(matches!(
            broadcast_shape(&[2, 2], &[3]),
            Err(GradError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_unbroadcast_sums_expanded_axes() {
        let g = ArcArray::from_elem(IxDyn(&[2, 3]), 1.0);
        let reduced = unbroadcast(&g, &[3]);
        assert_eq!(reduced.shape(), &[3]);
        assert_eq!(reduced.iter().copied().collect::<Vec<_>>(), vec![2.0; 3]);

        let reduced = unbroadcast(&g, &[2, 1]);
        assert_eq!(reduced.shape(), &[2, 1]);
        assert_eq!(reduced.iter().copied().collect::<Vec<_>>(), vec![3.0; 2]);
    }

    #[test]
    fn test_zero_grad_clears_slot_and_node() {
        let mut x = Tensor::filled(&[2], 1.0);
        x.requires_grad = true;
        let y = x.try_add(&x).unwrap();
        drop(y);
        assert!(x.grad_fn().is_some());
        x.zero_grad();
        assert!(x.grad_fn().is_none());
        assert!(x.grad().is_none());
    }

    #[test]
    fn test_clones_share_grad_slot_and_node() {
        let mut x = Tensor::filled(&[2], 1.0);
        x.requires_grad = true;
        let x2 = x.clone();
        let node = grad_fn_for(&x).unwrap();
        let node2 = grad_fn_for(&x2).unwrap();
        assert!(Rc::ptr_eq(&node, &node2));
    }

    #[test]
    fn test_detached_tensor_gets_no_node() {
        let mut x = Tensor::filled(&[2], 1.0);
        x.requires_grad = true;
        x.detach();
        assert!(grad_fn_for(&x).is_none());
        x.reattach();
        assert!(grad_fn_for(&x).is_some());
    }

    #[test]
    fn test_eager_accumulate_is_detached() {
        let a = Tensor::filled(&[2, 2], 1.0);
        let b = Tensor::filled(&[2, 2], 2.0);
        let sum = a.accumulate(&b, false).unwrap();
        assert!(sum.detached);
        assert!(sum.grad_fn().is_none());
        assert_eq!(sum.to_vec(), vec![3.0; 4]);
    }

    #[test]
    fn test_register_reduce_hook_creates_accumulator_lazily() {
        let mut x = Tensor::filled(&[2], 1.0);
        x.requires_grad = true;
        assert!(x.grad_fn().is_none());
        x.register_reduce_hook(|_| Ok(())).unwrap();
        assert!(x.grad_fn().is_some());
    }

    #[test]
    fn test_register_reduce_hook_rejects_non_accumulating_tensor() {
        let x = Tensor::filled(&[2], 1.0);
        let err = x.register_reduce_hook(|_| Ok(())).unwrap_err();
        assert!(matches!(err, GradError::Hook(_)));
    }

    #[test]
    fn test_register_reduce_hook_rejects_op_outputs() {
        let mut x = Tensor::filled(&[2], 1.0);
        x.requires_grad = true;
        let z = x.try_add(&x).unwrap();
        // non-leaf tensors resolve to an op-replay node, not an accumulator
        let err = z.register_reduce_hook(|_| Ok(())).unwrap_err();
        assert!(matches!(err, GradError::Hook(_)));
        // and registering on the leaf itself still succeeds
        x.register_reduce_hook(|_| Ok(())).unwrap();
    }
}
