use std::{cell::RefCell, rc::Rc};

use crate::backward_function::BackwardFunction;
use crate::error::{GradError, GradResult};
use crate::function::Function;
use crate::node::Node;
use crate::tensor::{broadcast_add, grad_fn_for, unbroadcast, Tensor};
use crate::Cell;

#[derive(Debug, Clone)]
pub(crate) struct Add {
    pub(crate) left: Cell<Tensor>,
    pub(crate) right: Cell<Tensor>,
}

impl Function for Add {
    fn forward(&mut self) -> GradResult<Tensor> {
        let a = self.left.borrow();
        let b = self.right.borrow();
        let mut c = Tensor::from_data(broadcast_add(&a.data, &b.data)?);
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
                node: "Add",
                expected: 1,
                got: 0,
            })?;
        let g = g.borrow();
        let grad_a = unbroadcast(&g.data, self.left.borrow().shape());
        let grad_b = unbroadcast(&g.data, self.right.borrow().shape());
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

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_forward_values() {
        let mut x = Tensor::filled(&[2, 2], 1.0);
        x.requires_grad = true;
        let y = Tensor::filled(&[2, 2], 2.0);
        let z = x.try_add(&y).unwrap();
        assert_eq!(z.to_vec(), vec![3.0; 4]);
        assert!(z.requires_grad);
        assert!(!z.is_leaf);
        assert!(z.grad_fn().is_some());
    }

    #[test]
    fn test_backward_distributes_ones() {
        let mut x = Tensor::filled(&[2, 2], 1.0);
        let mut y = Tensor::filled(&[2, 2], 2.0);
        x.requires_grad = true;
        y.requires_grad = true;
        let mut z = x.try_add(&y).unwrap();
        z.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec(), vec![1.0; 4]);
        assert_eq!(y.grad().unwrap().to_vec(), vec![1.0; 4]);
    }

    #[test]
    fn test_backward_reduces_broadcast_operand() {
        let mut x = Tensor::filled(&[2, 3], 1.0);
        let mut b = Tensor::filled(&[3], 0.0);
        x.requires_grad = true;
        b.requires_grad = true;
        let mut z = x.try_add(&b).unwrap();
        z.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec(), vec![1.0; 6]);
        // the broadcast axis collapses back onto b's shape
        let gb = b.grad().unwrap();
        assert_eq!(gb.shape(), &[3]);
        assert_eq!(gb.to_vec(), vec![2.0; 3]);
    }

    #[test]
    fn test_shape_mismatch_propagates() {
        let x = Tensor::filled(&[2, 2], 1.0);
        let y = Tensor::filled(&[3], 1.0);
        assert!(matches!(
            x.try_add(&y),
            Err(GradError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_untraced_when_no_operand_requires_grad() {
        let x = Tensor::filled(&[2], 1.0);
        let y = Tensor::filled(&[2], 2.0);
        let z = x.try_add(&y).unwrap();
        assert!(!z.requires_grad);
        assert!(z.is_leaf);
        assert!(z.grad_fn().is_none());
    }
}
