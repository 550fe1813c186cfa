//! Fully Qualified Names
//!
//! An [`Fqn`] is an immutable, ordered sequence of elements identifying a
//! position in the cache tree. The zero-length Fqn is the root.
//!
//! # Design
//!
//! - Elements live in a shared `Arc<[FqnElement]>`, so clones are cheap
//! - The hash is computed once at construction (Fqns are hot map keys)
//! - Ordering is lexicographic over elements: an ancestor always sorts
//!   before its descendants, unrelated Fqns sort by first differing element

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Separator used by the string form
pub const SEPARATOR: char = '/';

static ROOT: Lazy<Fqn> = Lazy::new(|| Fqn::from_vec(Vec::new()));

/// One element of an [`Fqn`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FqnElement {
    /// Boolean element
    Bool(bool),
    /// Integer element
    Int(i64),
    /// String element
    Str(String),
}

impl FqnElement {
    /// Rank used to order elements of different types
    fn type_rank(&self) -> u8 {
        match self {
            FqnElement::Bool(_) => 0,
            FqnElement::Int(_) => 1,
            FqnElement::Str(_) => 2,
        }
    }

    /// Feed a canonical byte form into the FxHash state
    fn fx_feed(&self, mut hash: u64) -> u64 {
        hash = fx_step(hash, self.type_rank() as u64);
        match self {
            FqnElement::Bool(b) => fx_step(hash, *b as u64),
            FqnElement::Int(i) => fx_step(hash, *i as u64),
            FqnElement::Str(s) => s.as_bytes().iter().fold(hash, |h, &b| fx_step(h, b as u64)),
        }
    }
}

impl Ord for FqnElement {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FqnElement::Bool(a), FqnElement::Bool(b)) => a.cmp(b),
            (FqnElement::Int(a), FqnElement::Int(b)) => a.cmp(b),
            (FqnElement::Str(a), FqnElement::Str(b)) => a.cmp(b),
            // Mixed types order by type rank so the order stays transitive
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for FqnElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FqnElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FqnElement::Bool(b) => write!(f, "{}", b),
            FqnElement::Int(i) => write!(f, "{}", i),
            FqnElement::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FqnElement {
    fn from(s: &str) -> Self {
        FqnElement::Str(s.to_string())
    }
}

impl From<String> for FqnElement {
    fn from(s: String) -> Self {
        FqnElement::Str(s)
    }
}

impl From<i64> for FqnElement {
    fn from(i: i64) -> Self {
        FqnElement::Int(i)
    }
}

impl From<i32> for FqnElement {
    fn from(i: i32) -> Self {
        FqnElement::Int(i as i64)
    }
}

impl From<u32> for FqnElement {
    fn from(i: u32) -> Self {
        FqnElement::Int(i as i64)
    }
}

impl From<bool> for FqnElement {
    fn from(b: bool) -> Self {
        FqnElement::Bool(b)
    }
}

const FX_SEED: u64 = 0x517cc1b727220a95;

#[inline]
fn fx_step(hash: u64, word: u64) -> u64 {
    (hash.rotate_left(5) ^ word).wrapping_mul(FX_SEED)
}

/// Fully qualified name of a tree position
#[derive(Clone)]
pub struct Fqn {
    elements: Arc<[FqnElement]>,
    hash: u64,
}

impl Fqn {
    fn from_vec(elements: Vec<FqnElement>) -> Self {
        let hash = elements
            .iter()
            .fold(FX_SEED, |h, e| fx_step(e.fx_feed(h), 0xff));
        Self {
            elements: elements.into(),
            hash,
        }
    }

    /// The root Fqn
    pub fn root() -> Fqn {
        ROOT.clone()
    }

    /// Parse the string form (`/a/b/c`); empty segments are ignored
    pub fn from_string(s: &str) -> Fqn {
        let elements = s
            .split(SEPARATOR)
            .filter(|segment| !segment.is_empty())
            .map(FqnElement::from)
            .collect();
        Self::from_vec(elements)
    }

    /// Build from an element list
    pub fn from_elements<I, E>(elements: I) -> Fqn
    where
        I: IntoIterator<Item = E>,
        E: Into<FqnElement>,
    {
        Self::from_vec(elements.into_iter().map(Into::into).collect())
    }

    /// Concatenate a relative Fqn onto `base`
    pub fn from_relative(base: &Fqn, relative: &Fqn) -> Fqn {
        let mut elements = Vec::with_capacity(base.size() + relative.size());
        elements.extend_from_slice(&base.elements);
        elements.extend_from_slice(&relative.elements);
        Self::from_vec(elements)
    }

    /// Append elements onto `base`
    pub fn from_relative_elements<I, E>(base: &Fqn, elements: I) -> Fqn
    where
        I: IntoIterator<Item = E>,
        E: Into<FqnElement>,
    {
        let mut all: Vec<FqnElement> = base.elements.to_vec();
        all.extend(elements.into_iter().map(Into::into));
        Self::from_vec(all)
    }

    /// Child of this Fqn with one more element
    pub fn child(&self, element: impl Into<FqnElement>) -> Fqn {
        Self::from_relative_elements(self, std::iter::once(element))
    }

    /// Number of elements
    #[inline]
    pub fn size(&self) -> usize {
        self.elements.len()
    }

    /// True for the zero-length Fqn
    #[inline]
    pub fn is_root(&self) -> bool {
        self.elements.is_empty()
    }

    /// Elements in root-to-leaf order
    pub fn elements(&self) -> &[FqnElement] {
        &self.elements
    }

    /// Element at `index`
    pub fn get(&self, index: usize) -> Option<&FqnElement> {
        self.elements.get(index)
    }

    /// Last element, `None` for the root
    pub fn last_element(&self) -> Option<&FqnElement> {
        self.elements.last()
    }

    /// Last element in string form, empty for the root
    pub fn last_element_as_string(&self) -> String {
        self.last_element().map(|e| e.to_string()).unwrap_or_default()
    }

    /// Parent Fqn; the root is its own parent
    pub fn parent(&self) -> Fqn {
        match self.size() {
            0 => self.clone(),
            1 => Fqn::root(),
            n => Self::from_vec(self.elements[..n - 1].to_vec()),
        }
    }

    /// Ancestor made of the first `generation` elements
    ///
    /// `ancestor(0)` is the root and `ancestor(size())` is this Fqn.
    pub fn ancestor(&self, generation: usize) -> Result<Fqn> {
        if generation > self.size() {
            return Err(Error::OutOfRange {
                index: generation,
                size: self.size(),
            });
        }
        if generation == self.size() {
            return Ok(self.clone());
        }
        if generation == 0 {
            return Ok(Fqn::root());
        }
        Ok(Self::from_vec(self.elements[..generation].to_vec()))
    }

    /// All ancestors from the root down to (and including) this Fqn
    pub fn lineage(&self) -> Vec<Fqn> {
        (0..=self.size())
            .map(|generation| {
                if generation == self.size() {
                    self.clone()
                } else {
                    Self::from_vec(self.elements[..generation].to_vec())
                }
            })
            .collect()
    }

    /// Sub-Fqn with elements `[from, to)`
    pub fn sub_fqn(&self, from: usize, to: usize) -> Result<Fqn> {
        if from > to {
            return Err(Error::InvalidArgument(format!(
                "sub_fqn start {} is after end {}",
                from, to
            )));
        }
        if to > self.size() {
            return Err(Error::OutOfRange {
                index: to,
                size: self.size(),
            });
        }
        Ok(Self::from_vec(self.elements[from..to].to_vec()))
    }

    /// True if this Fqn is a strict descendant of `parent`
    pub fn is_child_of(&self, parent: &Fqn) -> bool {
        self.size() > parent.size() && self.is_child_or_equals(parent)
    }

    /// True if this Fqn is a direct child of `parent`
    pub fn is_direct_child_of(&self, parent: &Fqn) -> bool {
        self.size() == parent.size() + 1 && self.is_child_or_equals(parent)
    }

    /// True if this Fqn equals `parent` or descends from it
    pub fn is_child_or_equals(&self, parent: &Fqn) -> bool {
        parent.size() <= self.size() && self.elements[..parent.size()] == parent.elements[..]
    }

    /// Rewrite the leading `old_ancestor` segment as `new_ancestor`
    ///
    /// Returns a clone when this Fqn does not descend from `old_ancestor`.
    pub fn replace_ancestor(&self, old_ancestor: &Fqn, new_ancestor: &Fqn) -> Fqn {
        if !self.is_child_or_equals(old_ancestor) {
            return self.clone();
        }
        let mut elements = new_ancestor.elements.to_vec();
        elements.extend_from_slice(&self.elements[old_ancestor.size()..]);
        Self::from_vec(elements)
    }

    /// Cached structural hash
    #[inline]
    pub fn cached_hash(&self) -> u64 {
        self.hash
    }
}

impl Default for Fqn {
    fn default() -> Self {
        Fqn::root()
    }
}

impl PartialEq for Fqn {
    fn eq(&self, other: &Self) -> bool {
        // Fast path: compare cached hashes first
        self.hash == other.hash && self.elements == other.elements
    }
}

impl Eq for Fqn {}

impl Hash for Fqn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl Ord for Fqn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.elements.iter().cmp(other.elements.iter())
    }
}

impl PartialOrd for Fqn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Fqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        for element in self.elements.iter() {
            write!(f, "{}{}", SEPARATOR, element)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fqn({})", self)
    }
}

impl From<&str> for Fqn {
    fn from(s: &str) -> Self {
        Fqn::from_string(s)
    }
}

impl Serialize for Fqn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.elements.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Fqn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let elements = Vec::<FqnElement>::deserialize(deserializer)?;
        Ok(Fqn::from_vec(elements))
    }
}

// =============================================================================
// Tests
// =============================================================================
