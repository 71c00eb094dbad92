use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::error::GradResult;
use crate::node::Node;
use crate::tensor::Tensor;
use crate::Cell;

fn key(node: &Cell<Node>) -> usize {
    Rc::as_ptr(node) as *const () as usize
}

/// Backward pass from `output` with the default flags: eager summation, and
/// accumulation continues whatever gradient the leaves already hold.
pub fn backward(output: &mut Tensor) -> GradResult<()> {
    backward_with(output, false, false)
}

/// Runs one backward pass from `output`, seeding with ones.
///
/// Every contribution bound for a node's input slot is gathered before that
/// node's compute runs, and each node is invoked exactly once per pass. The
/// traversal is synchronous; the first error aborts the pass.
pub fn backward_with(output: &mut Tensor, create_graph: bool, is_new_grad: bool) -> GradResult<()> {
    let Some(root) = output.grad_fn.borrow().clone() else {
        return Ok(());
    };
    let seed = Tensor::ones_like(output);
    log::debug!(
        "backward pass from {} (create_graph: {create_graph}, is_new_grad: {is_new_grad})",
        root.borrow().name()
    );

    // Count inbound edges so a node only fires once all gradients routed to
    // its input slot have arrived.
    let mut inbound: HashMap<usize, usize> = HashMap::new();
    let mut seen: HashSet<usize> = HashSet::new();
    let mut stack = vec![root.clone()];
    seen.insert(key(&root));
    while let Some(node) = stack.pop() {
        for next in node.borrow().next_functions().iter().flatten() {
            *inbound.entry(key(next)).or_insert(0) += 1;
            if seen.insert(key(next)) {
                stack.push(next.clone());
            }
        }
    }

    let mut pending: HashMap<usize, Vec<Tensor>> = HashMap::new();
    pending.insert(key(&root), vec![seed]);
    let mut ready = VecDeque::from([root]);
    while let Some(node) = ready.pop_front() {
        let slot = pending.remove(&key(&node)).unwrap_or_default();
        let outputs = node.borrow_mut().compute(vec![slot], create_graph, is_new_grad)?;
        let successors = node.borrow().next_functions().to_vec();
        for (next, grad) in successors.into_iter().zip(outputs) {
            let Some(next) = next else { continue };
            if let Some(grad) = grad {
                pending.entry(key(&next)).or_default().push(grad);
            }
            if let Some(count) = inbound.get_mut(&key(&next)) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(next);
                }
            }
        }
    }
    Ok(())
}
