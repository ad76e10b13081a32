//! Shape/dtype probing
//!
//! [`eval_shape`] runs a function on an abstract tape: every operation
//! checks its shape rule and propagates dtypes, but no values are computed
//! and no gradient is recorded. The dispatcher uses the result to decide
//! which strategy applies before committing to a concrete trace.
//!
//! A function that reads concrete values, or whose operations violate a
//! shape rule, cannot be probed and fails with
//! [`WirtingerError::ShapeInference`].

use crate::native::split_output;
use crate::partial::{HashablePartial, PartialKey};
use crate::tape::TapeMode;
use crate::trace::{TracedFn, Tracer};
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use wirtinger_core::{HasDType, Result, ShapeDtype, Tree, WirtingerError};

/// Output shapes and dtypes of `fun` at `primals`, without evaluating it.
///
/// With `has_aux`, the auxiliary payload is traced too and discarded.
pub fn eval_shape<F, L>(fun: &F, primals: &[Tree<L>], has_aux: bool) -> Result<Tree<ShapeDtype>>
where
    F: TracedFn + ?Sized,
    L: HasDType,
{
    let avals: Vec<Tree<ShapeDtype>> = primals.iter().map(Tree::shape_dtypes).collect();
    eval_shape_abstract(fun, &avals, has_aux)
}

fn eval_shape_abstract<F>(fun: &F, avals: &[Tree<ShapeDtype>], has_aux: bool) -> Result<Tree<ShapeDtype>>
where
    F: TracedFn + ?Sized,
{
    let tracer = Tracer::new(TapeMode::Abstract);
    let inputs = avals
        .iter()
        .map(|a| a.try_map(|sd| tracer.placeholder(sd)))
        .collect::<Result<Vec<_>>>()?;
    let (value, _aux) = split_output(fun.trace(&tracer, &inputs)?, has_aux).map_err(|e| {
        WirtingerError::ShapeInference(format!("cannot determine output: {}", e))
    })?;
    value.try_map(|x| tracer.aval(x))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    func_id: TypeId,
    fun: PartialKey,
    avals: Vec<Tree<ShapeDtype>>,
    has_aux: bool,
}

/// Hit/miss counters of a [`ShapeCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

/// Memoized [`eval_shape`] for [`HashablePartial`] functions
///
/// Entries are keyed on the wrapped function's type, the partial's key, the
/// input shapes and dtypes, and `has_aux`. Failed probes are not cached.
#[derive(Debug, Default)]
pub struct ShapeCache {
    entries: Mutex<HashMap<CacheKey, Tree<ShapeDtype>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl ShapeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eval_shape<F, L>(
        &self,
        fun: &HashablePartial<F>,
        primals: &[Tree<L>],
        has_aux: bool,
    ) -> Result<Tree<ShapeDtype>>
    where
        HashablePartial<F>: TracedFn,
        L: HasDType,
    {
        let key = CacheKey {
            func_id: fun.func_id(),
            fun: fun.key().clone(),
            avals: primals.iter().map(Tree::shape_dtypes).collect(),
            has_aux,
        };

        if let Some(hit) = self.entries.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::trace!("shape cache hit for {}", key.fun);
            return Ok(hit.clone());
        }

        // the lock is released while tracing, so `fun` may probe re-entrantly
        self.misses.fetch_add(1, Ordering::Relaxed);
        log::trace!("shape cache miss for {}", key.fun);
        let out = eval_shape_abstract(fun, &key.avals, has_aux)?;
        self.entries.lock().insert(key, out.clone());
        Ok(out)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
