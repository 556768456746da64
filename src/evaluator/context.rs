//! Per-worker evaluation scratch state.
//!
//! One [`EvaluationContext`] carries every buffer a single evaluation needs:
//! the counter array, touched/true-predicate lists, base-condition and
//! fingerprint scratch, and the numeric densification buffers. Contexts are
//! pooled explicitly (no thread-local storage): workers draw one for the
//! duration of a call and the guard returns it reset.
//!
//! `reset()` zeroes only the counter slots that were touched, so the cost of
//! a reset is proportional to the event's work, not the model size.

use parking_lot::Mutex;

use crate::numeric::NumericScratch;

/// Scratch state for one in-flight evaluation.
#[derive(Debug)]
pub struct EvaluationContext {
    /// Per-combination hit counters, sized to the model.
    pub(crate) counters: Vec<u32>,
    /// Combinations whose counter moved off zero this evaluation.
    pub(crate) touched: Vec<u32>,
    /// Predicate ids that evaluated true.
    pub(crate) true_predicates: Vec<u32>,
    /// Applicable base-condition set ids (base evaluation scratch).
    pub(crate) applicable_sets: Vec<u32>,
    /// Sorted static predicate ids feeding the cache fingerprint.
    pub(crate) key_predicates: Vec<u32>,
    /// Pooled buffer for the medium fingerprint path.
    pub(crate) key_buffer: Vec<u8>,
    /// Densification buffers for batched numeric evaluation.
    pub(crate) numeric: NumericScratch,
    /// Predicate ids emitted true by numeric batches (sorted after fill).
    pub(crate) numeric_true: Vec<u32>,
    /// Predicates evaluated so far for this event.
    pub(crate) predicates_evaluated: u32,
}

impl EvaluationContext {
    pub fn new(num_combinations: usize) -> Self {
        EvaluationContext {
            counters: vec![0; num_combinations],
            touched: Vec::new(),
            true_predicates: Vec::new(),
            applicable_sets: Vec::new(),
            key_predicates: Vec::new(),
            key_buffer: Vec::new(),
            numeric: NumericScratch::default(),
            numeric_true: Vec::new(),
            predicates_evaluated: 0,
        }
    }

    /// Clear all observable state. Only touched counter slots are zeroed.
    pub fn reset(&mut self) {
        for &c in &self.touched {
            self.counters[c as usize] = 0;
        }
        self.touched.clear();
        self.true_predicates.clear();
        self.applicable_sets.clear();
        self.key_predicates.clear();
        self.numeric.clear();
        self.numeric_true.clear();
        self.predicates_evaluated = 0;
    }

    /// Number of combinations this context is sized for.
    pub fn capacity(&self) -> usize {
        self.counters.len()
    }

    fn observable_eq(&self, other: &Self) -> bool {
        self.counters == other.counters
            && self.touched == other.touched
            && self.true_predicates == other.true_predicates
            && self.applicable_sets == other.applicable_sets
            && self.key_predicates == other.key_predicates
            && self.numeric_true == other.numeric_true
            && self.predicates_evaluated == other.predicates_evaluated
    }
}

/// Fixed-capacity pool of evaluation contexts.
///
/// Acquire returns a pooled context or builds a fresh one when the pool is
/// drained; release happens on guard drop, after a reset. The pool never
/// grows beyond its capacity, so a burst of workers costs at most a few
/// short-lived extra contexts.
#[derive(Debug)]
pub struct ContextPool {
    contexts: Mutex<Vec<Box<EvaluationContext>>>,
    num_combinations: usize,
    capacity: usize,
}

impl ContextPool {
    pub fn new(num_combinations: usize, capacity: usize) -> Self {
        ContextPool {
            contexts: Mutex::new(Vec::with_capacity(capacity)),
            num_combinations,
            capacity: capacity.max(1),
        }
    }

    /// Draw a context; it returns to the pool when the guard drops.
    pub fn acquire(&self) -> ContextGuard<'_> {
        let ctx = self
            .contexts
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(EvaluationContext::new(self.num_combinations)));
        ContextGuard {
            pool: self,
            ctx: Some(ctx),
        }
    }

    fn release(&self, mut ctx: Box<EvaluationContext>) {
        ctx.reset();
        let mut pooled = self.contexts.lock();
        if pooled.len() < self.capacity {
            pooled.push(ctx);
        }
    }

    pub fn pooled(&self) -> usize {
        self.contexts.lock().len()
    }
}

/// RAII handle over a pooled [`EvaluationContext`].
pub struct ContextGuard<'a> {
    pool: &'a ContextPool,
    ctx: Option<Box<EvaluationContext>>,
}

impl std::ops::Deref for ContextGuard<'_> {
    type Target = EvaluationContext;

    fn deref(&self) -> &Self::Target {
        self.ctx.as_ref().expect("context present until drop")
    }
}

impl std::ops::DerefMut for ContextGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx.as_mut().expect("context present until drop")
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.release(ctx);
        }
    }
}
