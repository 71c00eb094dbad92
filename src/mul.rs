use std::{cell::RefCell, rc::Rc};

use crate::backward_function::BackwardFunction;
use crate::error::{GradError, GradResult};
use crate::function::Function;
use crate::node::Node;
use crate::tensor::{broadcast_mul, grad_fn_for, unbroadcast, Tensor};
use crate::Cell;

#[derive(Debug, Clone)]
pub(crate) struct Mul {
    pub(crate) left: Cell<Tensor>,
    pub(crate) right: Cell<Tensor>,
}

impl Function for Mul {
    fn forward(&mut self) -> GradResult<Tensor> {
        let a = self.left.borrow();
        let b = self.right.borrow();
        let mut c = Tensor::from_data(broadcast_mul(&a.data, &b.data)?);
        c.requires_grad = a.requires_grad || b.requires_grad;
        c.is_leaf = !c.requires_grad;
        c.detached = a.detached || b.detached;
        Ok(c)
    }

    fn backward(&mut self, grad_outputs: Vec<Cell<Tensor>>) -> GradResult<Vec<Tensor>> {
        let g = grad_outputs
            .into_iter()
            .next()
            .ok_or(GradError::InvalidArity {
                node: "Mul",
                expected: 1,
                got: 0,
            })?;
        let g = g.borrow();
        let a = self.left.borrow();
        let b = self.right.borrow();
        let grad_a = unbroadcast(&broadcast_mul(&g.data, &b.data)?, a.shape());
        let grad_b = unbroadcast(&broadcast_mul(&g.data, &a.data)?, b.shape());
        Ok(vec![Tensor::detached(grad_a), Tensor::detached(grad_b)])
    }

    fn apply(&mut self) -> GradResult<Vec<Tensor>> {
        let mut backward_function = BackwardFunction::new(Rc::new(RefCell::new(self.clone())));
        for arg in [&self.left, &self.right] {
            backward_function
                .next_functions
                .push(grad_fn_for(&arg.borrow()));
        }
        let output = self.forward()?;
        if output.requires_grad && !output.detached {
            output.set_grad_fn(Node::BackwardFunctionWrapper {
                inner: backward_function,
            });
        }
        Ok(vec![output])
    }
}
