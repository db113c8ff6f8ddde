//! Affine index expressions and maps.
//!
//! Maps are used in two places: as the index function of `affine.load` /
//! `affine.store` (loop induction variables to buffer indices) and as the
//! layout descriptor of a buffer type (logical indices to physical indices).

use std::fmt;
use std::ops;

use crate::{Error, Result};

/// A quasi-affine expression over dimensions and symbols.
///
/// Multiplication, floor division and modulo always have a constant right-hand
/// side, which keeps every expression affine in its dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AffineExpr {
    Dim(usize),
    Symbol(usize),
    Const(i64),
    Add(Box<AffineExpr>, Box<AffineExpr>),
    Mul(Box<AffineExpr>, i64),
    FloorDiv(Box<AffineExpr>, i64),
    Mod(Box<AffineExpr>, i64),
}

impl AffineExpr {
    pub fn dim(position: usize) -> Self {
        AffineExpr::Dim(position)
    }

    pub fn symbol(position: usize) -> Self {
        AffineExpr::Symbol(position)
    }

    pub fn constant(value: i64) -> Self {
        AffineExpr::Const(value)
    }

    /// `self floordiv divisor`.
    pub fn floor_div(self, divisor: i64) -> Self {
        match (self, divisor) {
            (e, 1) => e,
            (AffineExpr::Const(a), d) if d > 0 => AffineExpr::Const(a.div_euclid(d)),
            (e, d) => AffineExpr::FloorDiv(Box::new(e), d),
        }
    }

    /// `self mod modulus`.
    pub fn modulo(self, modulus: i64) -> Self {
        match (self, modulus) {
            (_, 1) => AffineExpr::Const(0),
            (AffineExpr::Const(a), m) if m > 0 => AffineExpr::Const(a.rem_euclid(m)),
            (e, m) => AffineExpr::Mod(Box::new(e), m),
        }
    }

    /// Evaluate with concrete dimension and symbol values.
    pub fn eval(&self, dims: &[i64], symbols: &[i64]) -> Result<i64> {
        match self {
            AffineExpr::Dim(i) => dims
                .get(*i)
                .copied()
                .ok_or_else(|| Error::Evaluation(format!("Missing value for d{}", i))),
            AffineExpr::Symbol(i) => symbols
                .get(*i)
                .copied()
                .ok_or_else(|| Error::Evaluation(format!("Missing value for s{}", i))),
            AffineExpr::Const(c) => Ok(*c),
            AffineExpr::Add(a, b) => Ok(a.eval(dims, symbols)? + b.eval(dims, symbols)?),
            AffineExpr::Mul(a, f) => Ok(a.eval(dims, symbols)? * f),
            AffineExpr::FloorDiv(a, d) => {
                if *d <= 0 {
                    return Err(Error::Evaluation(format!("Non-positive divisor {}", d)));
                }
                Ok(a.eval(dims, symbols)?.div_euclid(*d))
            }
            AffineExpr::Mod(a, m) => {
                if *m <= 0 {
                    return Err(Error::Evaluation(format!("Non-positive modulus {}", m)));
                }
                Ok(a.eval(dims, symbols)?.rem_euclid(*m))
            }
        }
    }

    /// Replace dimensions and symbols by the given expressions.
    pub fn substitute(&self, dims: &[AffineExpr], symbols: &[AffineExpr]) -> Result<AffineExpr> {
        Ok(match self {
            AffineExpr::Dim(i) => dims
                .get(*i)
                .cloned()
                .ok_or_else(|| Error::InvalidGraph(format!("No replacement for d{}", i)))?,
            AffineExpr::Symbol(i) => symbols
                .get(*i)
                .cloned()
                .ok_or_else(|| Error::InvalidGraph(format!("No replacement for s{}", i)))?,
            AffineExpr::Const(c) => AffineExpr::Const(*c),
            AffineExpr::Add(a, b) => a.substitute(dims, symbols)? + b.substitute(dims, symbols)?,
            AffineExpr::Mul(a, f) => a.substitute(dims, symbols)? * *f,
            AffineExpr::FloorDiv(a, d) => a.substitute(dims, symbols)?.floor_div(*d),
            AffineExpr::Mod(a, m) => a.substitute(dims, symbols)?.modulo(*m),
        })
    }
}

impl fmt::Display for AffineExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffineExpr::Dim(i) => write!(f, "d{}", i),
            AffineExpr::Symbol(i) => write!(f, "s{}", i),
            AffineExpr::Const(c) => write!(f, "{}", c),
            AffineExpr::Add(a, b) => write!(f, "{} + {}", a, b),
            AffineExpr::Mul(a, c) => write!(f, "({}) * {}", a, c),
            AffineExpr::FloorDiv(a, c) => write!(f, "({}) floordiv {}", a, c),
            AffineExpr::Mod(a, c) => write!(f, "({}) mod {}", a, c),
        }
    }
}

/// `self + rhs`, folding constants.
impl ops::Add for AffineExpr {
    type Output = AffineExpr;

    fn add(self, rhs: AffineExpr) -> AffineExpr {
        match (self, rhs) {
            (AffineExpr::Const(a), AffineExpr::Const(b)) => AffineExpr::Const(a + b),
            (AffineExpr::Const(0), e) | (e, AffineExpr::Const(0)) => e,
            (a, b) => AffineExpr::Add(Box::new(a), Box::new(b)),
        }
    }
}

/// `self * factor`, folding constants.
impl ops::Mul<i64> for AffineExpr {
    type Output = AffineExpr;

    fn mul(self, factor: i64) -> AffineExpr {
        match (self, factor) {
            (_, 0) => AffineExpr::Const(0),
            (e, 1) => e,
            (AffineExpr::Const(a), f) => AffineExpr::Const(a * f),
            (e, f) => AffineExpr::Mul(Box::new(e), f),
        }
    }
}

/// A multi-result affine map `(d0, .., dn)[s0, .., sm] -> (e0, .., ek)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AffineMap {
    num_dims: usize,
    num_symbols: usize,
    results: Vec<AffineExpr>,
}

impl AffineMap {
    pub fn new(num_dims: usize, num_symbols: usize, results: Vec<AffineExpr>) -> Self {
        Self {
            num_dims,
            num_symbols,
            results,
        }
    }

    /// `(d0, .., dn-1) -> (d0, .., dn-1)`.
    pub fn identity(rank: usize) -> Self {
        Self::new(rank, 0, (0..rank).map(AffineExpr::Dim).collect())
    }

    /// Map whose i-th result is `d(perm[i])`.
    pub fn permutation(perm: &[usize]) -> Self {
        Self::new(
            perm.len(),
            0,
            perm.iter().map(|&p| AffineExpr::Dim(p)).collect(),
        )
    }

    pub fn num_dims(&self) -> usize {
        self.num_dims
    }

    pub fn num_symbols(&self) -> usize {
        self.num_symbols
    }

    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    pub fn results(&self) -> &[AffineExpr] {
        &self.results
    }

    /// Check if this is `(d0, .., dn-1) -> (d0, .., dn-1)` without symbols.
    pub fn is_identity(&self) -> bool {
        self.num_symbols == 0
            && self.results.len() == self.num_dims
            && self
                .results
                .iter()
                .enumerate()
                .all(|(i, e)| *e == AffineExpr::Dim(i))
    }

    /// Compose `self ∘ inner`: feed the results of `inner` into the dimensions
    /// of `self`.
    ///
    /// The composed map has the dimensions of `inner`, and the symbols of
    /// `inner` followed by the symbols of `self`.
    pub fn compose(&self, inner: &AffineMap) -> Result<AffineMap> {
        if self.num_dims != inner.num_results() {
            return Err(Error::InvalidGraph(format!(
                "Cannot compose map with {} dims over map with {} results",
                self.num_dims,
                inner.num_results()
            )));
        }
        let shifted_symbols: Vec<AffineExpr> = (0..self.num_symbols)
            .map(|i| AffineExpr::Symbol(i + inner.num_symbols))
            .collect();
        let results = self
            .results
            .iter()
            .map(|e| e.substitute(&inner.results, &shifted_symbols))
            .collect::<Result<Vec<_>>>()?;
        Ok(AffineMap::new(
            inner.num_dims,
            inner.num_symbols + self.num_symbols,
            results,
        ))
    }

    /// Evaluate every result expression.
    pub fn eval(&self, dims: &[i64], symbols: &[i64]) -> Result<Vec<i64>> {
        if dims.len() != self.num_dims || symbols.len() != self.num_symbols {
            return Err(Error::Evaluation(format!(
                "Map {} applied to {} dims and {} symbols",
                self,
                dims.len(),
                symbols.len()
            )));
        }
        self.results.iter().map(|e| e.eval(dims, symbols)).collect()
    }
}

impl fmt::Display for AffineMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = (0..self.num_dims).map(|i| format!("d{}", i)).collect();
        write!(f, "({})", dims.join(", "))?;
        if self.num_symbols > 0 {
            let syms: Vec<String> = (0..self.num_symbols).map(|i| format!("s{}", i)).collect();
            write!(f, "[{}]", syms.join(", "))?;
        }
        let results: Vec<String> = self.results.iter().map(|e| e.to_string()).collect();
        write!(f, " -> ({})", results.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_and_permutation() {
        assert!(AffineMap::identity(3).is_identity());
        assert!(AffineMap::permutation(&[0, 1, 2]).is_identity());
        assert!(!AffineMap::permutation(&[0, 2, 3, 1]).is_identity());
        assert_eq!(
            AffineMap::permutation(&[0, 2, 3, 1]).eval(&[9, 8, 7, 6], &[]).unwrap(),
            vec![9, 7, 6, 8]
        );
    }

    #[test]
    fn test_compose_permutation_over_access() {
        // (d0, d1) -> (d0, d1 + 1, 2 * d0, d1)
        let access = AffineMap::new(
            2,
            0,
            vec![
                AffineExpr::dim(0),
                AffineExpr::dim(1) + AffineExpr::constant(1),
                AffineExpr::dim(0) * 2,
                AffineExpr::dim(1),
            ],
        );
        let perm = AffineMap::permutation(&[0, 2, 3, 1]);
        let composed = perm.compose(&access).unwrap();
        assert_eq!(composed.num_dims(), 2);
        for i in 0..4 {
            for j in 0..4 {
                let inner = access.eval(&[i, j], &[]).unwrap();
                let expected = perm.eval(&inner, &[]).unwrap();
                assert_eq!(composed.eval(&[i, j], &[]).unwrap(), expected);
            }
        }
    }

    #[test]
    fn test_compose_rejects_arity_mismatch() {
        let perm = AffineMap::permutation(&[0, 2, 3, 1]);
        assert!(perm.compose(&AffineMap::identity(2)).is_err());
    }

    #[test]
    fn test_floor_div_and_mod_are_euclidean() {
        let e = AffineExpr::dim(0).floor_div(32);
        assert_eq!(e.eval(&[-1], &[]).unwrap(), -1);
        assert_eq!(e.eval(&[64], &[]).unwrap(), 2);
        let m = AffineExpr::dim(0).modulo(32);
        assert_eq!(m.eval(&[-1], &[]).unwrap(), 31);
        assert!(AffineExpr::FloorDiv(Box::new(AffineExpr::dim(0)), 0)
            .eval(&[1], &[])
            .is_err());
    }

    #[test]
    fn test_compose_shifts_symbols() {
        // outer: (d0)[s0] -> (d0 + s0), inner: (d0)[s0] -> (d0 + s0)
        let outer = AffineMap::new(1, 1, vec![AffineExpr::dim(0) + AffineExpr::symbol(0)]);
        let composed = outer.compose(&outer).unwrap();
        assert_eq!(composed.num_symbols(), 2);
        assert_eq!(composed.eval(&[1], &[10, 100]).unwrap(), vec![111]);
    }

    #[test]
    fn test_display() {
        let map = AffineMap::new(2, 0, vec![AffineExpr::dim(1).floor_div(64), AffineExpr::dim(0)]);
        assert_eq!(map.to_string(), "(d0, d1) -> ((d1) floordiv 64, d0)");
    }
}
