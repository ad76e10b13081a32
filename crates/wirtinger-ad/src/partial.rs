//! Partial application with an explicit cache key
//!
//! A [`HashablePartial`] binds positional and keyword arguments to a
//! function under a stable name. Two partials are equal when they wrap the
//! same function type and their [`PartialKey`]s are equal (same name, same
//! bound values). Equal partials hash identically, so they can key caches
//! of traced results such as [`ShapeCache`](crate::shape::ShapeCache).
//!
//! Function items and closures each have their own type. Functions passed
//! as plain `fn` pointers share one type and are told apart by name only.
//!
//! Floats are bound by bit pattern: `0.0` and `-0.0` are different keys,
//! and a NaN is equal to itself.
//!
//! ```
//! use wirtinger_ad::partial::HashablePartial;
//! use wirtinger_ad::trace::arg;
//!
//! let scaled = |alpha: f64| {
//!     HashablePartial::new("scale", |t, p, key| {
//!         t.scale(arg(p, 0)?, key.arg(0)?.as_f64()?)
//!     })
//!     .with_arg(alpha)
//! };
//!
//! assert_eq!(scaled(2.0), scaled(2.0));
//! assert_eq!(scaled(2.0).cached_hash(), scaled(2.0).cached_hash());
//! assert_ne!(scaled(2.0), scaled(3.0));
//! ```

use crate::trace::{FnOutput, Traced, TracedFn, Tracer};
use std::any::TypeId;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;
use wirtinger_core::{DType, Result, Tree, WirtingerError};

/// A hashable bound argument
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BoundArg {
    Bool(bool),
    Int(i64),
    /// `f64` stored by bit pattern
    Float(u64),
    Str(String),
    DType(DType),
    Shape(Vec<usize>),
}

impl BoundArg {
    pub fn float(value: f64) -> Self {
        BoundArg::Float(value.to_bits())
    }

    fn kind(&self) -> &'static str {
        match self {
            BoundArg::Bool(_) => "bool",
            BoundArg::Int(_) => "int",
            BoundArg::Float(_) => "float",
            BoundArg::Str(_) => "str",
            BoundArg::DType(_) => "dtype",
            BoundArg::Shape(_) => "shape",
        }
    }

    fn mismatch(&self, expected: &str) -> WirtingerError {
        WirtingerError::InvalidArgument(format!(
            "bound argument {} is a {}, not a {}",
            self,
            self.kind(),
            expected
        ))
    }

    /// Numeric value; integers widen to `f64`
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            BoundArg::Float(bits) => Ok(f64::from_bits(*bits)),
            BoundArg::Int(i) => Ok(*i as f64),
            other => Err(other.mismatch("float")),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            BoundArg::Int(i) => Ok(*i),
            other => Err(other.mismatch("int")),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            BoundArg::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            BoundArg::Str(s) => Ok(s),
            other => Err(other.mismatch("str")),
        }
    }

    pub fn as_dtype(&self) -> Result<DType> {
        match self {
            BoundArg::DType(d) => Ok(*d),
            other => Err(other.mismatch("dtype")),
        }
    }

    pub fn as_shape(&self) -> Result<&[usize]> {
        match self {
            BoundArg::Shape(s) => Ok(s),
            other => Err(other.mismatch("shape")),
        }
    }
}

impl fmt::Display for BoundArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundArg::Bool(b) => write!(f, "{}", b),
            BoundArg::Int(i) => write!(f, "{}", i),
            BoundArg::Float(bits) => write!(f, "{:?}", f64::from_bits(*bits)),
            BoundArg::Str(s) => write!(f, "{:?}", s),
            BoundArg::DType(d) => write!(f, "{}", d),
            BoundArg::Shape(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<bool> for BoundArg {
    fn from(v: bool) -> Self {
        BoundArg::Bool(v)
    }
}

impl From<i64> for BoundArg {
    fn from(v: i64) -> Self {
        BoundArg::Int(v)
    }
}

impl From<i32> for BoundArg {
    fn from(v: i32) -> Self {
        BoundArg::Int(v as i64)
    }
}

impl From<f64> for BoundArg {
    fn from(v: f64) -> Self {
        BoundArg::float(v)
    }
}

impl From<&str> for BoundArg {
    fn from(v: &str) -> Self {
        BoundArg::Str(v.to_string())
    }
}

impl From<String> for BoundArg {
    fn from(v: String) -> Self {
        BoundArg::Str(v)
    }
}

impl From<DType> for BoundArg {
    fn from(v: DType) -> Self {
        BoundArg::DType(v)
    }
}

impl From<Vec<usize>> for BoundArg {
    fn from(v: Vec<usize>) -> Self {
        BoundArg::Shape(v)
    }
}

/// Function identity plus bound arguments
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartialKey {
    name: String,
    args: Vec<BoundArg>,
    kwargs: BTreeMap<String, BoundArg>,
}

impl PartialKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[BoundArg] {
        &self.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, BoundArg> {
        &self.kwargs
    }

    /// Positional argument `index`
    pub fn arg(&self, index: usize) -> Result<&BoundArg> {
        self.args.get(index).ok_or_else(|| {
            WirtingerError::InvalidArgument(format!(
                "{} has {} bound positional arguments, asked for #{}",
                self.name,
                self.args.len(),
                index
            ))
        })
    }

    /// Keyword argument `name`
    pub fn kwarg(&self, name: &str) -> Result<&BoundArg> {
        self.kwargs.get(name).ok_or_else(|| {
            WirtingerError::InvalidArgument(format!("{} has no bound argument {:?}", self.name, name))
        })
    }

    /// Deterministic hash of name and bound values
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for PartialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        let mut first = true;
        for a in &self.args {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", a)?;
            first = false;
        }
        for (k, v) in &self.kwargs {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        write!(f, ")")
    }
}

/// A function with bound arguments, usable as a cache key
///
/// The wrapped function receives the bound arguments through the
/// [`PartialKey`] on every call.
pub struct HashablePartial<F> {
    key: PartialKey,
    func: F,
    func_id: TypeId,
    hash: OnceLock<u64>,
}

impl<F> HashablePartial<F> {
    pub fn new<R>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Tracer, &[Tree<Traced>], &PartialKey) -> Result<R> + Send + Sync + 'static,
        R: Into<FnOutput>,
    {
        Self {
            key: PartialKey::new(name),
            func,
            func_id: TypeId::of::<F>(),
            hash: OnceLock::new(),
        }
    }

    /// Bind the next positional argument
    pub fn with_arg(mut self, value: impl Into<BoundArg>) -> Self {
        self.key.args.push(value.into());
        self.hash = OnceLock::new();
        self
    }

    /// Bind a keyword argument, replacing any previous binding
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<BoundArg>) -> Self {
        self.key.kwargs.insert(name.into(), value.into());
        self.hash = OnceLock::new();
        self
    }

    pub fn key(&self) -> &PartialKey {
        &self.key
    }

    pub fn func(&self) -> &F {
        &self.func
    }

    /// Type identity of the wrapped function
    pub fn func_id(&self) -> TypeId {
        self.func_id
    }

    /// [`PartialKey::stable_hash`], computed once
    pub fn cached_hash(&self) -> u64 {
        *self.hash.get_or_init(|| self.key.stable_hash())
    }
}

impl<F: Clone> Clone for HashablePartial<F> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            func: self.func.clone(),
            func_id: self.func_id,
            hash: self.hash.clone(),
        }
    }
}

impl<F> fmt::Debug for HashablePartial<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashablePartial")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<F> PartialEq for HashablePartial<F> {
    fn eq(&self, other: &Self) -> bool {
        self.func_id == other.func_id
            && self.cached_hash() == other.cached_hash()
            && self.key == other.key
    }
}

impl<F> Eq for HashablePartial<F> {}

impl<F> Hash for HashablePartial<F> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.func_id.hash(state);
        state.write_u64(self.cached_hash());
    }
}

impl<F, R> TracedFn for HashablePartial<F>
where
    F: Fn(&Tracer, &[Tree<Traced>], &PartialKey) -> Result<R> + Send + Sync,
    R: Into<FnOutput>,
{
    fn trace(&self, tracer: &Tracer, primals: &[Tree<Traced>]) -> Result<FnOutput> {
        (self.func)(tracer, primals, &self.key).map(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::evaluate;
    use crate::trace::arg;
    use std::collections::HashSet;
    use wirtinger_core::Tensor;

    type PartialFn = fn(&Tracer, &[Tree<Traced>], &PartialKey) -> Result<Traced>;

    fn power_fn(t: &Tracer, p: &[Tree<Traced>], key: &PartialKey) -> Result<Traced> {
        t.pow(arg(p, 0)?, key.kwarg("exponent")?.as_f64()?)
    }

    fn power(exponent: f64) -> HashablePartial<PartialFn> {
        HashablePartial::new("power", power_fn as PartialFn).with_kwarg("exponent", exponent)
    }

    fn identity(_t: &Tracer, p: &[Tree<Traced>], _key: &PartialKey) -> Result<Traced> {
        arg(p, 0).copied()
    }

    #[test]
    fn test_equal_keys_hash_equal() {
        let a = power(2.0);
        let b = power(2.0);
        assert_eq!(a, b);
        assert_eq!(a.cached_hash(), b.cached_hash());
        assert_eq!(a.key().stable_hash(), b.key().stable_hash());

        let mut set = HashSet::new();
        set.insert(a.key().clone());
        assert!(set.contains(b.key()));
    }

    #[test]
    fn test_different_bindings_differ() {
        assert_ne!(power(2.0), power(3.0));
        assert_ne!(power(0.0), power(-0.0));
        assert_ne!(
            PartialKey::new("f"),
            HashablePartial::new("f", identity).with_arg(1i64).key().clone()
        );
    }

    fn square(t: &Tracer, p: &[Tree<Traced>], _key: &PartialKey) -> Result<Traced> {
        let x = arg(p, 0)?;
        t.mul(x, x)
    }

    #[test]
    fn test_same_name_different_functions_differ() {
        let a = HashablePartial::new("model", identity).with_arg(1i64);
        let b = HashablePartial::new("model", square).with_arg(1i64);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.func_id(), b.func_id());

        let mut set = HashSet::new();
        set.insert((a.func_id(), a.key().clone()));
        assert!(!set.contains(&(b.func_id(), b.key().clone())));

        let c = HashablePartial::new("model", identity).with_arg(1i64);
        assert_eq!(a.func_id(), c.func_id());
        assert_eq!(a, c);
    }

    #[test]
    fn test_rebinding_resets_cached_hash() {
        let p = HashablePartial::new("f", identity).with_arg(1i64);
        let before = p.cached_hash();
        let p = p.with_kwarg("scale", 2.0);
        assert_ne!(p.cached_hash(), before);
        assert_eq!(p.cached_hash(), p.key().stable_hash());
    }

    #[test]
    fn test_bound_arguments_reach_the_function() {
        let f = power(3.0);
        let (out, _) = evaluate(&f, &[Tree::leaf(Tensor::scalar(2.0))], false).unwrap();
        assert_eq!(out, Tree::leaf(Tensor::scalar(8.0)));
    }

    #[test]
    fn test_typed_accessors() {
        let key = HashablePartial::new("f", identity)
            .with_arg(true)
            .with_arg("ket")
            .with_arg(wirtinger_core::DType::Complex64)
            .with_arg(vec![2usize, 3])
            .key()
            .clone();
        assert!(key.arg(0).unwrap().as_bool().unwrap());
        assert_eq!(key.arg(1).unwrap().as_str().unwrap(), "ket");
        assert_eq!(
            key.arg(2).unwrap().as_dtype().unwrap(),
            wirtinger_core::DType::Complex64
        );
        assert_eq!(key.arg(3).unwrap().as_shape().unwrap(), &[2, 3]);
        assert!(key.arg(0).unwrap().as_f64().is_err());
        assert!(key.arg(4).is_err());
        assert_eq!(key.to_string(), "f(true, \"ket\", complex64, [2, 3])");
    }
}
