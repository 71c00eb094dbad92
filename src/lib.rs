mod add;
mod backward_function;
mod function;
mod mul;
pub mod accumulate_grad;
pub mod backward;
pub mod diagnostics;
pub mod error;
pub mod node;
pub mod tensor;

use std::{cell::RefCell, rc::Rc};
///TODO: get rid of this
pub type Cell<T> = Rc<RefCell<T>>;
