use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::diagnostics::Diagnostics;
use crate::error::{GradError, GradResult};
use crate::tensor::Tensor;

///Side-effecting callable run after accumulation, in registration order.
pub type ReduceHook = Box<dyn FnMut(&Tensor) -> GradResult<()>>;
///Transform applied once to the accumulated gradient before it is final.
pub type RetainGradHook = Box<dyn FnMut(&Tensor) -> GradResult<Tensor>>;

/// Terminal node of the backward graph for one leaf tensor.
///
/// Every gradient contribution routed to the leaf during a pass lands in this
/// node's single input slot. The node sums them, applies the retain-grad
/// transform, runs the reduce hooks and folds the result into the leaf's
/// gradient slot when the pass continues a previous accumulation. Arity is
/// fixed at one input slot and one output slot for the node's whole lifetime.
pub struct AccumulateGrad {
    // Non-owning handle to the leaf's gradient slot. The leaf's metadata owns
    // this node, so a strong reference here would be a retain cycle. Unset for
    // unbound and cloned nodes; expiry is a normal state, not an error.
    weak_grad: Option<Weak<RefCell<Option<Tensor>>>>,
    reduce_hooks: Vec<ReduceHook>,
    retain_grad_hook: Option<RetainGradHook>,
    is_fake_empty: bool,
    forward_trace: Option<String>,
}

impl AccumulateGrad {
    /// Node bound to `leaf`'s gradient slot.
    pub fn bound(leaf: &Tensor) -> Self {
        Self::with_diagnostics(Some(leaf), &Diagnostics::default())
    }

    /// Structurally valid node with no leaf association; the construction
    /// path clones go through.
    pub fn unbound() -> Self {
        Self::with_diagnostics(None, &Diagnostics::default())
    }

    pub fn with_diagnostics(leaf: Option<&Tensor>, diagnostics: &Diagnostics) -> Self {
        log::trace!("construct AccumulateGrad (bound: {})", leaf.is_some());
        AccumulateGrad {
            weak_grad: leaf.map(|t| Rc::downgrade(&t.grad)),
            reduce_hooks: vec![],
            retain_grad_hook: None,
            is_fake_empty: false,
            forward_trace: diagnostics.forward_trace(),
        }
    }

    /// Combines every gradient in the single input slot into one value.
    ///
    /// `create_graph` routes the summation through the traced add op so the
    /// sum itself is differentiable. `is_new_grad = false` continues a prior
    /// accumulation: the stored partial gradient seeds the sum and the final
    /// value is written back to the leaf's slot; `true` neither reads nor
    /// writes stored state. A slot that fails to upgrade is skipped silently.
    pub fn compute(
        &mut self,
        mut grads: Vec<Vec<Tensor>>,
        create_graph: bool,
        is_new_grad: bool,
    ) -> GradResult<Vec<Option<Tensor>>> {
        if grads.len() != 1 {
            return Err(GradError::InvalidArity {
                node: "AccumulateGrad",
                expected: 1,
                got: grads.len(),
            });
        }
        let contributions = grads.swap_remove(0);
        if self.is_fake_empty {
            log::trace!(
                "AccumulateGrad fake-empty, ignoring {} contribution(s)",
                contributions.len()
            );
            return Ok(vec![None]);
        }

        let slot = if is_new_grad {
            None
        } else {
            self.weak_grad.as_ref().and_then(Weak::upgrade)
        };
        let mut acc: Option<Tensor> = slot.as_ref().and_then(|s| s.borrow().clone());
        for grad in contributions {
            acc = Some(match acc {
                None => grad,
                Some(total) => total.accumulate(&grad, create_graph)?,
            });
        }
        let Some(mut acc) = acc else {
            log::trace!("AccumulateGrad has no contributions, empty result");
            return Ok(vec![None]);
        };

        if let Some(hook) = self.retain_grad_hook.as_mut() {
            acc = hook(&acc)?;
        }
        self.apply_reduce_hooks(&acc)?;

        if let Some(slot) = slot {
            slot.borrow_mut().replace(acc.clone());
        }
        Ok(vec![Some(acc)])
    }

    /// Appends a hook; invocation order is registration order. Never rejects.
    pub fn register_reduce_hook<F>(&mut self, hook: F)
    where
        F: FnMut(&Tensor) -> GradResult<()> + 'static,
    {
        self.reduce_hooks.push(Box::new(hook));
    }

    pub fn reduce_hooks_registered(&self) -> bool {
        !self.reduce_hooks.is_empty()
    }

    /// Runs every reduce hook against `grad`, in registration order,
    /// fail-fast. Also callable on its own to finalize an already-accumulated
    /// gradient without re-summing.
    pub fn apply_reduce_hooks(&mut self, grad: &Tensor) -> GradResult<()> {
        for hook in &mut self.reduce_hooks {
            hook(grad)?;
        }
        Ok(())
    }

    pub fn set_retain_grad_hook<F>(&mut self, hook: F)
    where
        F: FnMut(&Tensor) -> GradResult<Tensor> + 'static,
    {
        self.retain_grad_hook = Some(Box::new(hook));
    }

    pub fn set_fake_empty(&mut self, is_fake_empty: bool) {
        self.is_fake_empty = is_fake_empty;
    }

    pub fn is_fake_empty(&self) -> bool {
        self.is_fake_empty
    }

    /// Arity is structural and never changes: one input slot, one output
    /// slot.
    pub fn num_input_slots(&self) -> usize {
        1
    }

    pub fn num_output_slots(&self) -> usize {
        1
    }

    pub fn is_bound(&self) -> bool {
        self.weak_grad.is_some()
    }

    /// Whether the weak reference still resolves to a live gradient slot.
    pub fn leaf_alive(&self) -> bool {
        self.weak_grad
            .as_ref()
            .is_some_and(|w| w.strong_count() > 0)
    }

    pub fn forward_trace(&self) -> Option<&str> {
        self.forward_trace.as_deref()
    }

    /// Duplicate for graph copies: same structure, no leaf association, hook
    /// list and fake-empty flag as the unbound constructor leaves them.
    pub fn copy(&self) -> AccumulateGrad {
        log::trace!("copy AccumulateGrad as unbound");
        AccumulateGrad::unbound()
    }

    /// The node holds no forward-tensor snapshots, so there is nothing to
    /// release.
    pub fn clear_tensor_wrappers(&mut self) {
        log::trace!("AccumulateGrad holds no tensor wrappers");
    }
}

impl Drop for AccumulateGrad {
    fn drop(&mut self) {
        log::trace!("destruct AccumulateGrad");
    }
}

impl std::fmt::Debug for AccumulateGrad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccumulateGrad")
            .field("bound", &self.is_bound())
            .field("reduce_hooks", &self.reduce_hooks.len())
            .field("retain_grad_hook", &self.retain_grad_hook.is_some())
            .field("is_fake_empty", &self.is_fake_empty)
            .finish()
    }
}
