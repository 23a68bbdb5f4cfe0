//! Core autograd types for custom backward functions.
//!
//! Defines the `GradFn` trait and `GradNode` computation graph node.
//! These live in rankattn-core so that `Tensor` can carry gradient tracking
//! and kernel crates can attach their own backward functions.

use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::tensor::Tensor;
use crate::Result;

// ============================================================================
// GradFn trait
// ============================================================================

/// Trait for gradient functions in the computation graph.
///
/// Each differentiable operation implements this trait to define
/// how gradients flow backward through it.
pub trait GradFn: Send + Sync {
    /// Compute gradients for each input given the output gradient.
    ///
    /// Returns one optional gradient per input, in the order the inputs were
    /// registered with `GradNode::with_grad_fn`. `None` means the input
    /// receives no gradient.
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>>;

    /// Name of this gradient function (for debugging).
    fn name(&self) -> &str;
}

// ============================================================================
// GradNode
// ============================================================================

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

fn next_id() -> usize {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A node in the autograd computation graph.
///
/// Each node holds:
/// - An optional gradient function for backward
/// - Weak references to input nodes (prevents cycles)
/// - Thread-safe accumulated gradient
pub struct GradNode {
    pub id: usize,
    pub grad_fn: Option<Box<dyn GradFn>>,
    pub inputs: Vec<Weak<GradNode>>,
    pub grad: RwLock<Option<Tensor>>,
}

impl GradNode {
    /// Create a new leaf node (no grad_fn, e.g., a parameter).
    pub fn leaf() -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            grad_fn: None,
            inputs: Vec::new(),
            grad: RwLock::new(None),
        })
    }

    /// Create a new interior node with a gradient function and inputs.
    pub fn with_grad_fn(grad_fn: Box<dyn GradFn>, inputs: Vec<Arc<GradNode>>) -> Arc<Self> {
        let weak_inputs = inputs.iter().map(Arc::downgrade).collect();
        Arc::new(Self {
            id: next_id(),
            grad_fn: Some(grad_fn),
            inputs: weak_inputs,
            grad: RwLock::new(None),
        })
    }

    /// Whether this is a leaf node (no grad_fn).
    pub fn is_leaf(&self) -> bool {
        self.grad_fn.is_none()
    }

    /// Accumulate gradient into this node (thread-safe).
    pub fn accumulate_grad(&self, grad: &Tensor) -> Result<()> {
        let mut lock = self.grad.write();
        let next = match lock.as_ref() {
            Some(existing) => existing.add(grad)?,
            None => grad.clone(),
        };
        *lock = Some(next);
        Ok(())
    }

    /// Get the current accumulated gradient.
    pub fn get_grad(&self) -> Option<Tensor> {
        self.grad.read().clone()
    }

    /// Clear the accumulated gradient.
    pub fn zero_grad(&self) {
        *self.grad.write() = None;
    }
}

// ============================================================================
// Backward pass
// ============================================================================

/// Execute the backward pass from a root node.
///
/// Nodes run in reverse topological order, so every node has received the
/// gradients of all its consumers before its `GradFn` is applied.
pub fn backward(root: &Arc<GradNode>, grad_output: Tensor) -> Result<()> {
    root.accumulate_grad(&grad_output)?;

    for node in &topological_sort(root) {
        let Some(ref grad_fn) = node.grad_fn else {
            continue;
        };
        let Some(node_grad) = node.get_grad() else {
            continue;
        };

        let input_grads = grad_fn.apply(&node_grad)?;

        for (weak_input, maybe_grad) in node.inputs.iter().zip(input_grads) {
            if let (Some(input_node), Some(grad)) = (weak_input.upgrade(), maybe_grad) {
                input_node.accumulate_grad(&grad)?;
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm from root to leaves: a node is emitted only after every
/// reachable node that consumes it.
fn topological_sort(root: &Arc<GradNode>) -> Vec<Arc<GradNode>> {
    // pending consumer edges per node id
    let mut pending: HashMap<usize, usize> = HashMap::new();
    let mut seen = HashSet::from([root.id]);
    let mut stack = vec![Arc::clone(root)];
    while let Some(node) = stack.pop() {
        for input in node.inputs.iter().filter_map(Weak::upgrade) {
            *pending.entry(input.id).or_insert(0) += 1;
            if seen.insert(input.id) {
                stack.push(input);
            }
        }
    }

    let mut sorted = Vec::with_capacity(seen.len());
    let mut ready = VecDeque::from([Arc::clone(root)]);
    while let Some(node) = ready.pop_front() {
        for input in node.inputs.iter().filter_map(Weak::upgrade) {
            if let Some(count) = pending.get_mut(&input.id) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(input);
                }
            }
        }
        sorted.push(node);
    }

    sorted
}

// ============================================================================
// No-grad scope
// ============================================================================

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Check if gradient computation is currently enabled.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

fn set_grad_enabled(enabled: bool) -> bool {
    GRAD_ENABLED.with(|g| {
        let prev = g.get();
        g.set(enabled);
        prev
    })
}

/// RAII guard that disables gradient recording in its scope.
///
/// # Example
/// ```
/// use rankattn_core::autograd::{is_grad_enabled, NoGradGuard};
///
/// {
///     let _guard = NoGradGuard::new();
///     assert!(!is_grad_enabled());
/// }
/// assert!(is_grad_enabled());
/// ```
pub struct NoGradGuard {
    prev: bool,
}

impl NoGradGuard {
    pub fn new() -> Self {
        let prev = set_grad_enabled(false);
        Self { prev }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev);
    }
}
