use std::{cell::RefCell, rc::Rc};

use crate::error::{GradError, GradResult};
use crate::function::Function;
use crate::node::Node;
use crate::tensor::Tensor;
use crate::Cell;

/// Backward-graph wrapper around a forward op: replays the op's backward pass
/// and fans the per-input gradients out along `next_functions`.
#[derive(Clone)]
pub struct BackwardFunction {
    forward_cls: Cell<dyn Function>,
    ///One entry per forward input; None when that input's gradient is dropped.
    pub(crate) next_functions: Vec<Option<Cell<Node>>>,
}

impl BackwardFunction {
    pub(crate) fn new(forward_cls: Cell<dyn Function>) -> Self {
        BackwardFunction {
            forward_cls,
            next_functions: vec![],
        }
    }

    /// Pre-sums the single slot's contributions, then delegates to the op's
    /// backward to produce one gradient per forward input.
    pub(crate) fn compute(
        &mut self,
        mut grads: Vec<Vec<Tensor>>,
        create_graph: bool,
    ) -> GradResult<Vec<Option<Tensor>>> {
        if grads.len() != 1 {
            return Err(GradError::InvalidArity {
                node: "BackwardFunction",
                expected: 1,
                got: grads.len(),
            });
        }
        let mut contributions = grads.swap_remove(0).into_iter();
        let Some(mut total) = contributions.next() else {
            return Ok(vec![None; self.next_functions.len()]);
        };
        for grad in contributions {
            total = total.accumulate(&grad, create_graph)?;
        }
        let input_grads = self
            .forward_cls
            .borrow_mut()
            .backward(vec![Rc::new(RefCell::new(total))])?;
        Ok(input_grads.into_iter().map(Some).collect())
    }

    pub(crate) fn clear_tensor_wrappers(&mut self) {
        log::trace!("BackwardFunction keeps its op state for replay");
    }
}

impl std::fmt::Debug for BackwardFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackwardFunction")
            .field("next_functions", &self.next_functions.len())
            .finish()
    }
}
