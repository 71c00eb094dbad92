use crate::error::GradResult;
use crate::tensor::Tensor;
use crate::Cell;

pub(crate) trait Function {
    ///Runs the op forward, producing the output tensor.
    fn forward(&mut self) -> GradResult<Tensor>;
    ///Maps the output gradient to one gradient per input, in input order.
    fn backward(&mut self, grad_outputs: Vec<Cell<Tensor>>) -> GradResult<Vec<Tensor>>;
    ///Runs forward and links the result into the backward graph.
    fn apply(&mut self) -> GradResult<Vec<Tensor>>;
}
