//! Ordered comparison of 128-bit addresses stored as four 32-bit columns.
//!
//! Storage engines without a native 128-bit column compare `a1..a4`
//! lexicographically, most significant word first:
//!
//! `a1<x OR (a1=x AND a2<y) OR (a1=x AND a2=y AND a3<z) OR (a1=x AND a2=y AND a3=z AND a4<w)`
//!
//! Only the last word carries the inclusive operator for `<=` and `>=`; every
//! earlier word compares strictly. Terms that can never hold (`a1<0`,
//! `a1>4294967295`) are dropped, so an IPv4 bound collapses to a single
//! `a1=? AND a2=? AND a3=? AND a4<?` term.

use crate::helpers::split_words;

const COLUMNS: [&str; 4] = ["a1", "a2", "a3", "a4"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cmp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    pub fn as_sql(self) -> &'static str {
        match self {
            Cmp::Lt => "<",
            Cmp::Le => "<=",
            Cmp::Gt => ">",
            Cmp::Ge => ">=",
        }
    }

    fn strict(self) -> Cmp {
        match self {
            Cmp::Lt | Cmp::Le => Cmp::Lt,
            Cmp::Gt | Cmp::Ge => Cmp::Gt,
        }
    }

    /// `lhs <op> rhs`
    #[inline]
    pub fn holds<T: Ord>(self, lhs: T, rhs: T) -> bool {
        match self {
            Cmp::Lt => lhs < rhs,
            Cmp::Le => lhs <= rhs,
            Cmp::Gt => lhs > rhs,
            Cmp::Ge => lhs >= rhs,
        }
    }

    fn satisfiable(self, value: u32) -> bool {
        match self {
            Cmp::Lt => value != 0,
            Cmp::Gt => value != u32::MAX,
            Cmp::Le | Cmp::Ge => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Term {
    /// Leading words that must match exactly.
    eq: Vec<u32>,
    cmp: Cmp,
    value: u32,
}

impl Term {
    fn word(&self) -> usize {
        self.eq.len()
    }

    fn matches(&self, words: &[u32; 4]) -> bool {
        self.eq.iter().zip(words.iter()).all(|(want, got)| want == got)
            && self.cmp.holds(words[self.word()], self.value)
    }
}

/// `address <cmp> value`, decomposed over the four word columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WordPredicate {
    cmp: Cmp,
    value: u128,
    terms: Vec<Term>,
}

impl WordPredicate {
    pub fn new(cmp: Cmp, value: u128) -> Self {
        let words = split_words(value);
        let terms = (0..4)
            .filter_map(|i| {
                let op = if i == 3 { cmp } else { cmp.strict() };
                op.satisfiable(words[i]).then(|| Term {
                    eq: words[..i].to_vec(),
                    cmp: op,
                    value: words[i],
                })
            })
            .collect();
        Self { cmp, value, terms }
    }

    pub fn lt(value: u128) -> Self {
        Self::new(Cmp::Lt, value)
    }

    pub fn le(value: u128) -> Self {
        Self::new(Cmp::Le, value)
    }

    pub fn gt(value: u128) -> Self {
        Self::new(Cmp::Gt, value)
    }

    pub fn ge(value: u128) -> Self {
        Self::new(Cmp::Ge, value)
    }

    pub fn cmp(&self) -> Cmp {
        self.cmp
    }

    pub fn value(&self) -> u128 {
        self.value
    }

    /// Evaluate against a stored row's words.
    pub fn matches(&self, words: &[u32; 4]) -> bool {
        self.terms.iter().any(|t| t.matches(words))
    }

    /// `WHERE` fragment with positional `?` placeholders and its bind values.
    pub fn to_sql(&self) -> (String, Vec<u32>) {
        if self.terms.is_empty() {
            return ("1=0".to_string(), Vec::new());
        }
        let mut params = Vec::new();
        let parts: Vec<String> = self
            .terms
            .iter()
            .map(|t| {
                let mut conds: Vec<String> = t
                    .eq
                    .iter()
                    .enumerate()
                    .map(|(i, w)| {
                        params.push(*w);
                        format!("{}=?", COLUMNS[i])
                    })
                    .collect();
                params.push(t.value);
                conds.push(format!("{}{}?", COLUMNS[t.word()], t.cmp.as_sql()));
                if conds.len() == 1 {
                    conds.remove(0)
                } else {
                    format!("({})", conds.join(" AND "))
                }
            })
            .collect();
        (parts.join(" OR "), params)
    }

    /// Inclusive address range implied by this predicate alone, or `None`
    /// when nothing can match.
    pub fn bounds(&self) -> Option<(u128, u128)> {
        match self.cmp {
            Cmp::Lt => self.value.checked_sub(1).map(|hi| (0, hi)),
            Cmp::Le => Some((0, self.value)),
            Cmp::Gt => self.value.checked_add(1).map(|lo| (lo, u128::MAX)),
            Cmp::Ge => Some((self.value, u128::MAX)),
        }
    }
}
