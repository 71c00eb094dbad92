use std::{cell::RefCell, rc::Rc};

use crate::accumulate_grad::AccumulateGrad;
use crate::backward_function::BackwardFunction;
use crate::error::GradResult;
use crate::tensor::Tensor;
use crate::Cell;

/// A node of the backward graph. Gradient accumulation at leaves and op
/// backward replay are the two node kinds; the engine talks to both through
/// the same compute/name/clear/copy surface.
#[derive(Debug)]
pub enum Node {
    AccumulateGrad { inner: AccumulateGrad },
    BackwardFunctionWrapper { inner: BackwardFunction },
}

impl Node {
    pub fn name(&self) -> &'static str {
        match self {
            Node::AccumulateGrad { .. } => "AccumulateGrad",
            Node::BackwardFunctionWrapper { .. } => "BackwardFunction",
        }
    }

    /// Engine entry point, invoked once per node per backward pass with every
    /// contribution for the node's input slot gathered up front.
    pub fn compute(
        &mut self,
        grads: Vec<Vec<Tensor>>,
        create_graph: bool,
        is_new_grad: bool,
    ) -> GradResult<Vec<Option<Tensor>>> {
        match self {
            Node::AccumulateGrad { inner } => inner.compute(grads, create_graph, is_new_grad),
            Node::BackwardFunctionWrapper { inner } => inner.compute(grads, create_graph),
        }
    }

    /// Releases forward-tensor snapshots. Accumulation nodes hold none.
    pub fn clear_tensor_wrappers(&mut self) {
        match self {
            Node::AccumulateGrad { inner } => inner.clear_tensor_wrappers(),
            Node::BackwardFunctionWrapper { inner } => inner.clear_tensor_wrappers(),
        }
    }

    /// Duplicates this node for graph copies. Accumulation clones come back
    /// unbound so the copy never aliases the original leaf's gradient slot.
    pub fn copy(&self) -> Cell<Node> {
        match self {
            Node::AccumulateGrad { inner } => Rc::new(RefCell::new(Node::AccumulateGrad {
                inner: inner.copy(),
            })),
            Node::BackwardFunctionWrapper { inner } => {
                Rc::new(RefCell::new(Node::BackwardFunctionWrapper {
                    inner: inner.clone(),
                }))
            }
        }
    }

    pub(crate) fn next_functions(&self) -> &[Option<Cell<Node>>] {
        match self {
            // Accumulation is terminal: nothing consumes its output.
            Node::AccumulateGrad { .. } => &[],
            Node::BackwardFunctionWrapper { inner } => &inner.next_functions,
        }
    }
}
