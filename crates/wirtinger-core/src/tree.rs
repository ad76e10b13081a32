//! Pytrees: nested containers of array leaves
//!
//! A [`Tree`] is the unit of differentiation. Primals, outputs, cotangents
//! and gradients are all trees, and every transformation here keeps the
//! nesting intact and only touches leaves.
//!
//! Leaves are visited depth-first; dictionary entries are visited in key
//! order, so flattening is deterministic and [`TreeDef::unflatten`] is the
//! exact inverse of [`Tree::flatten`].
//!
//! # Examples
//!
//! ```
//! use wirtinger_core::{DType, Tensor, Tree};
//!
//! let params = Tree::dict([
//!     ("bias", Tree::leaf(Tensor::zeros(&[3], DType::Float64))),
//!     ("weights", Tree::leaf(Tensor::zeros(&[3, 2], DType::Complex128))),
//! ]);
//!
//! assert_eq!(params.num_leaves(), 2);
//! assert_eq!(params.size(), 9);
//! assert!(params.is_complex());
//! ```

use crate::dtype::DType;
use crate::error::{Result, WirtingerError};
use crate::tensor::{ShapeDtype, Tensor};
use std::collections::BTreeMap;
use std::fmt;

/// Nested container of leaves
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tree<L> {
    /// A single leaf
    Leaf(L),
    /// Ordered, variable-length sequence
    List(Vec<Tree<L>>),
    /// Ordered, fixed-length sequence
    Tuple(Vec<Tree<L>>),
    /// String-keyed mapping, visited in key order
    Dict(BTreeMap<String, Tree<L>>),
}

/// Structure of a tree with the leaves removed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TreeDef {
    Leaf,
    List(Vec<TreeDef>),
    Tuple(Vec<TreeDef>),
    Dict(BTreeMap<String, TreeDef>),
}

impl TreeDef {
    /// Number of leaves a tree of this structure holds
    pub fn num_leaves(&self) -> usize {
        match self {
            TreeDef::Leaf => 1,
            TreeDef::List(items) | TreeDef::Tuple(items) => {
                items.iter().map(TreeDef::num_leaves).sum()
            }
            TreeDef::Dict(items) => items.values().map(TreeDef::num_leaves).sum(),
        }
    }

    /// Rebuild a tree of this structure from leaves in flattening order
    pub fn unflatten<L>(&self, leaves: Vec<L>) -> Result<Tree<L>> {
        let expected = self.num_leaves();
        if leaves.len() != expected {
            return Err(WirtingerError::StructureMismatch(format!(
                "structure holds {} leaves but {} were given",
                expected,
                leaves.len()
            )));
        }
        let mut iter = leaves.into_iter();
        self.build(&mut iter).ok_or_else(|| {
            WirtingerError::StructureMismatch("ran out of leaves while unflattening".to_string())
        })
    }

    fn build<L, I: Iterator<Item = L>>(&self, iter: &mut I) -> Option<Tree<L>> {
        Some(match self {
            TreeDef::Leaf => Tree::Leaf(iter.next()?),
            TreeDef::List(items) => Tree::List(
                items
                    .iter()
                    .map(|d| d.build(iter))
                    .collect::<Option<Vec<_>>>()?,
            ),
            TreeDef::Tuple(items) => Tree::Tuple(
                items
                    .iter()
                    .map(|d| d.build(iter))
                    .collect::<Option<Vec<_>>>()?,
            ),
            TreeDef::Dict(items) => {
                let mut out = BTreeMap::new();
                for (k, d) in items {
                    out.insert(k.clone(), d.build(iter)?);
                }
                Tree::Dict(out)
            }
        })
    }
}

impl fmt::Display for TreeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn seq(f: &mut fmt::Formatter<'_>, items: &[TreeDef]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", item)?;
            }
            Ok(())
        }
        match self {
            TreeDef::Leaf => f.write_str("*"),
            TreeDef::List(items) => {
                f.write_str("[")?;
                seq(f, items)?;
                f.write_str("]")
            }
            TreeDef::Tuple(items) => {
                f.write_str("(")?;
                seq(f, items)?;
                f.write_str(")")
            }
            TreeDef::Dict(items) => {
                f.write_str("{")?;
                for (i, (k, v)) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl<L> Tree<L> {
    pub fn leaf(value: L) -> Self {
        Tree::Leaf(value)
    }

    pub fn list(items: impl IntoIterator<Item = Tree<L>>) -> Self {
        Tree::List(items.into_iter().collect())
    }

    pub fn tuple(items: impl IntoIterator<Item = Tree<L>>) -> Self {
        Tree::Tuple(items.into_iter().collect())
    }

    pub fn dict<K: Into<String>>(items: impl IntoIterator<Item = (K, Tree<L>)>) -> Self {
        Tree::Dict(items.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// The leaf value, if this tree is a bare leaf
    pub fn as_leaf(&self) -> Option<&L> {
        match self {
            Tree::Leaf(v) => Some(v),
            _ => None,
        }
    }

    /// Structure of this tree
    pub fn structure(&self) -> TreeDef {
        match self {
            Tree::Leaf(_) => TreeDef::Leaf,
            Tree::List(items) => TreeDef::List(items.iter().map(Tree::structure).collect()),
            Tree::Tuple(items) => TreeDef::Tuple(items.iter().map(Tree::structure).collect()),
            Tree::Dict(items) => TreeDef::Dict(
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.structure()))
                    .collect(),
            ),
        }
    }

    /// Leaves in flattening order
    pub fn leaves(&self) -> Vec<&L> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a L>) {
        match self {
            Tree::Leaf(v) => out.push(v),
            Tree::List(items) | Tree::Tuple(items) => {
                items.iter().for_each(|t| t.collect_leaves(out))
            }
            Tree::Dict(items) => items.values().for_each(|t| t.collect_leaves(out)),
        }
    }

    pub fn num_leaves(&self) -> usize {
        match self {
            Tree::Leaf(_) => 1,
            Tree::List(items) | Tree::Tuple(items) => items.iter().map(Tree::num_leaves).sum(),
            Tree::Dict(items) => items.values().map(Tree::num_leaves).sum(),
        }
    }

    /// Split into owned leaves and structure
    pub fn flatten(self) -> (Vec<L>, TreeDef) {
        let def = self.structure();
        let mut out = Vec::with_capacity(def.num_leaves());
        self.drain_leaves(&mut out);
        (out, def)
    }

    fn drain_leaves(self, out: &mut Vec<L>) {
        match self {
            Tree::Leaf(v) => out.push(v),
            Tree::List(items) | Tree::Tuple(items) => {
                items.into_iter().for_each(|t| t.drain_leaves(out))
            }
            Tree::Dict(items) => items.into_values().for_each(|t| t.drain_leaves(out)),
        }
    }

    /// Apply `f` to every leaf, keeping the structure
    pub fn map<M, F>(&self, mut f: F) -> Tree<M>
    where
        F: FnMut(&L) -> M,
    {
        self.map_inner(&mut f)
    }

    fn map_inner<M, F>(&self, f: &mut F) -> Tree<M>
    where
        F: FnMut(&L) -> M,
    {
        match self {
            Tree::Leaf(v) => Tree::Leaf(f(v)),
            Tree::List(items) => Tree::List(items.iter().map(|t| t.map_inner(f)).collect()),
            Tree::Tuple(items) => Tree::Tuple(items.iter().map(|t| t.map_inner(f)).collect()),
            Tree::Dict(items) => Tree::Dict(
                items
                    .iter()
                    .map(|(k, t)| (k.clone(), t.map_inner(f)))
                    .collect(),
            ),
        }
    }

    /// Fallible [`Tree::map`]; stops at the first error
    pub fn try_map<M, E, F>(&self, mut f: F) -> std::result::Result<Tree<M>, E>
    where
        F: FnMut(&L) -> std::result::Result<M, E>,
    {
        self.try_map_inner(&mut f)
    }

    fn try_map_inner<M, E, F>(&self, f: &mut F) -> std::result::Result<Tree<M>, E>
    where
        F: FnMut(&L) -> std::result::Result<M, E>,
    {
        Ok(match self {
            Tree::Leaf(v) => Tree::Leaf(f(v)?),
            Tree::List(items) => Tree::List(
                items
                    .iter()
                    .map(|t| t.try_map_inner(f))
                    .collect::<std::result::Result<_, E>>()?,
            ),
            Tree::Tuple(items) => Tree::Tuple(
                items
                    .iter()
                    .map(|t| t.try_map_inner(f))
                    .collect::<std::result::Result<_, E>>()?,
            ),
            Tree::Dict(items) => {
                let mut out = BTreeMap::new();
                for (k, t) in items {
                    out.insert(k.clone(), t.try_map_inner(f)?);
                }
                Tree::Dict(out)
            }
        })
    }

    /// Combine two trees of identical structure leaf by leaf.
    ///
    /// Fails with [`WirtingerError::StructureMismatch`] naming the first
    /// path where the structures disagree.
    pub fn zip_map<R, M, F>(&self, other: &Tree<R>, mut f: F) -> Result<Tree<M>>
    where
        F: FnMut(&L, &R) -> Result<M>,
    {
        self.zip_inner(other, &mut f, "")
    }

    fn zip_inner<R, M, F>(&self, other: &Tree<R>, f: &mut F, path: &str) -> Result<Tree<M>>
    where
        F: FnMut(&L, &R) -> Result<M>,
    {
        let mismatch = |what: &str| {
            WirtingerError::StructureMismatch(format!(
                "{} at {}",
                what,
                if path.is_empty() { "<root>" } else { path }
            ))
        };
        Ok(match (self, other) {
            (Tree::Leaf(a), Tree::Leaf(b)) => Tree::Leaf(f(a, b)?),
            (Tree::List(a), Tree::List(b)) | (Tree::Tuple(a), Tree::Tuple(b)) => {
                if a.len() != b.len() {
                    return Err(mismatch(&format!(
                        "sequence lengths differ ({} vs {})",
                        a.len(),
                        b.len()
                    )));
                }
                let items = a
                    .iter()
                    .zip(b)
                    .enumerate()
                    .map(|(i, (x, y))| x.zip_inner(y, f, &format!("{}[{}]", path, i)))
                    .collect::<Result<Vec<_>>>()?;
                if matches!(self, Tree::List(_)) {
                    Tree::List(items)
                } else {
                    Tree::Tuple(items)
                }
            }
            (Tree::Dict(a), Tree::Dict(b)) => {
                if !a.keys().eq(b.keys()) {
                    return Err(mismatch("dictionary keys differ"));
                }
                let mut out = BTreeMap::new();
                for ((k, x), y) in a.iter().zip(b.values()) {
                    out.insert(k.clone(), x.zip_inner(y, f, &format!("{}['{}']", path, k))?);
                }
                Tree::Dict(out)
            }
            _ => return Err(mismatch("container kinds differ")),
        })
    }

    /// Whether any leaf satisfies `pred`
    pub fn any<F>(&self, mut pred: F) -> bool
    where
        F: FnMut(&L) -> bool,
    {
        self.leaves().into_iter().any(|l| pred(l))
    }
}

/// Reality of a tree: complex if any leaf is complex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Reality {
    Real,
    Complex,
}

impl Reality {
    /// Classify a tree; a tree with no leaves is real
    pub fn of<L: HasDType>(tree: &Tree<L>) -> Self {
        Self::from_flag(tree.is_complex())
    }

    /// Classify the argument tuple of a function
    pub fn of_primals<L: HasDType>(primals: &[Tree<L>]) -> Self {
        Self::from_flag(primals_are_complex(primals))
    }

    fn from_flag(is_complex: bool) -> Self {
        if is_complex {
            Reality::Complex
        } else {
            Reality::Real
        }
    }
}

impl fmt::Display for Reality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reality::Real => f.write_str("real"),
            Reality::Complex => f.write_str("complex"),
        }
    }
}

/// Leaves that know their shape and element type
pub trait HasDType {
    fn dtype(&self) -> DType;
    fn shape(&self) -> &[usize];
}

impl HasDType for Tensor {
    fn dtype(&self) -> DType {
        Tensor::dtype(self)
    }

    fn shape(&self) -> &[usize] {
        Tensor::shape(self)
    }
}

impl HasDType for ShapeDtype {
    fn dtype(&self) -> DType {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }
}

/// Whether at least one leaf of any argument is complex
pub fn primals_are_complex<L: HasDType>(primals: &[Tree<L>]) -> bool {
    primals.iter().any(Tree::is_complex)
}

impl<L: HasDType> Tree<L> {
    /// Whether at least one leaf has a complex dtype
    pub fn is_complex(&self) -> bool {
        self.any(|l| l.dtype().is_complex())
    }

    /// Total number of scalars over all leaves
    pub fn size(&self) -> usize {
        self.leaves()
            .iter()
            .map(|l| l.shape().iter().product::<usize>())
            .sum()
    }

    /// Shape/dtype descriptor of every leaf
    pub fn shape_dtypes(&self) -> Tree<ShapeDtype> {
        self.map(|l| ShapeDtype::new(l.shape(), l.dtype()))
    }

    /// Check that `other` has the same structure and per-leaf shapes.
    ///
    /// Dtypes are not compared: a complex cotangent may legitimately seed
    /// a real output.
    pub fn check_matches<R: HasDType>(&self, other: &Tree<R>) -> Result<()> {
        self.zip_map(other, |a, b| {
            if a.shape() != b.shape() {
                Err(WirtingerError::StructureMismatch(format!(
                    "leaf shape {:?} does not match expected {:?}",
                    b.shape(),
                    a.shape()
                )))
            } else {
                Ok(())
            }
        })
        .map(|_| ())
    }
}

impl Tree<ShapeDtype> {
    /// Tree of ones with these shapes and dtypes
    pub fn ones(&self) -> Tree<Tensor> {
        self.map(|sd| Tensor::ones(&sd.shape, sd.dtype))
    }

    /// Tree of zeros with these shapes and dtypes
    pub fn zeros(&self) -> Tree<Tensor> {
        self.map(|sd| Tensor::zeros(&sd.shape, sd.dtype))
    }
}

impl Tree<Tensor> {
    /// Conjugate every leaf
    pub fn conj(&self) -> Self {
        self.map(Tensor::conj)
    }

    /// Real part of every leaf
    pub fn real_part(&self) -> Self {
        self.map(Tensor::real_part)
    }

    /// Imaginary part of every leaf
    pub fn imag_part(&self) -> Self {
        self.map(Tensor::imag_part)
    }

    pub fn neg(&self) -> Self {
        self.map(Tensor::neg)
    }

    pub fn scale(&self, factor: f64) -> Self {
        self.map(|t| t.scale(factor))
    }

    /// Leaf-wise sum
    pub fn add(&self, other: &Tree<Tensor>) -> Result<Self> {
        self.zip_map(other, |a, b| a.add(b))
    }

    /// Leaf-wise difference
    pub fn sub(&self, other: &Tree<Tensor>) -> Result<Self> {
        self.zip_map(other, |a, b| a.sub(b))
    }

    /// Leaf-wise `re + i·sign·im` over two real trees of identical structure
    pub fn from_parts(re: &Tree<Tensor>, im: &Tree<Tensor>, sign: f64) -> Result<Self> {
        re.zip_map(im, |r, i| Tensor::from_parts(r, i, sign))
    }

    /// Leaf-wise [`Tensor::allclose`]; false on any structural difference
    pub fn allclose(&self, other: &Tree<Tensor>, rtol: f64, atol: f64) -> bool {
        self.zip_map(other, |a, b| Ok(a.allclose(b, rtol, atol)))
            .map(|t| t.leaves().into_iter().all(|ok| *ok))
            .unwrap_or(false)
    }
}

impl From<Tensor> for Tree<Tensor> {
    fn from(t: Tensor) -> Self {
        Tree::Leaf(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scirs2_core::numeric::Complex64;

    fn sample() -> Tree<Tensor> {
        Tree::tuple([
            Tree::leaf(Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap()),
            Tree::dict([
                ("b", Tree::leaf(Tensor::scalar(3.0))),
                (
                    "a",
                    Tree::list([Tree::leaf(Tensor::zeros(&[2, 2], DType::Float32))]),
                ),
            ]),
        ])
    }

    #[test]
    fn test_flatten_unflatten_roundtrip() {
        let tree = sample();
        let (leaves, def) = tree.clone().flatten();
        assert_eq!(leaves.len(), 3);
        // dict keys come out sorted: "a" before "b"
        assert_eq!(leaves[1].shape(), &[2, 2]);
        assert_eq!(leaves[2].shape(), &[] as &[usize]);
        assert_eq!(def.unflatten(leaves).unwrap(), tree);
    }

    #[test]
    fn test_unflatten_wrong_leaf_count() {
        let def = sample().structure();
        let err = def.unflatten(vec![Tensor::scalar(1.0)]).unwrap_err();
        assert!(matches!(err, WirtingerError::StructureMismatch(_)));
    }

    #[test]
    fn test_structure_display() {
        assert_eq!(sample().structure().to_string(), "(*, {a: [*], b: *})");
    }

    #[test]
    fn test_size_counts_scalars() {
        assert_eq!(sample().size(), 2 + 4 + 1);
    }

    #[test]
    fn test_empty_tree_is_real() {
        let empty: Tree<Tensor> = Tree::tuple([]);
        assert!(!empty.is_complex());
        assert_eq!(Reality::of(&empty), Reality::Real);
        assert_eq!(Reality::of_primals::<Tensor>(&[]), Reality::Real);
    }

    #[test]
    fn test_mixed_reality_is_complex() {
        let tree = Tree::list([
            Tree::leaf(Tensor::scalar(1.0)),
            Tree::leaf(Tensor::complex_scalar(Complex64::new(0.0, 1.0))),
        ]);
        assert!(tree.is_complex());
        assert!(primals_are_complex(&[sample(), tree]));
        assert!(!primals_are_complex(&[sample()]));
    }

    #[test]
    fn test_zip_map_reports_mismatch_path() {
        let a = sample();
        let mut b = sample();
        if let Tree::Tuple(items) = &mut b {
            items[1] = Tree::dict([("b", Tree::leaf(Tensor::scalar(0.0)))]);
        }
        let err = a.add(&b).unwrap_err();
        match err {
            WirtingerError::StructureMismatch(msg) => assert!(msg.contains("[1]"), "{}", msg),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_list_and_tuple_do_not_match() {
        let a = Tree::list([Tree::leaf(Tensor::scalar(1.0))]);
        let b = Tree::tuple([Tree::leaf(Tensor::scalar(1.0))]);
        assert!(a.check_matches(&b).is_err());
        assert!(!a.allclose(&b, 0.0, 0.0));
    }

    #[test]
    fn test_check_matches_ignores_dtype_but_not_shape() {
        let real = Tree::leaf(Tensor::zeros(&[3], DType::Float64));
        let complex = Tree::leaf(Tensor::zeros(&[3], DType::Complex128));
        assert!(real.check_matches(&complex).is_ok());

        let wrong = Tree::leaf(Tensor::zeros(&[4], DType::Float64));
        assert!(matches!(
            real.check_matches(&wrong),
            Err(WirtingerError::StructureMismatch(_))
        ));
    }

    #[test]
    fn test_from_parts_and_conj() {
        let re = sample();
        let im = sample().scale(2.0);
        let z = Tree::from_parts(&re, &im, 1.0).unwrap();
        assert!(z.is_complex());
        assert!(z.real_part().allclose(&re, 0.0, 0.0));
        assert!(z.conj().imag_part().allclose(&im.neg(), 0.0, 0.0));
        assert_eq!(z.structure(), re.structure());
    }

    #[test]
    fn test_ones_from_avals() {
        let avals = sample().shape_dtypes();
        let ones = avals.ones();
        assert_eq!(ones.shape_dtypes(), avals);
        assert!(ones
            .leaves()
            .iter()
            .all(|t| t.as_real().unwrap().iter().all(|&v| v == 1.0)));
    }
}
