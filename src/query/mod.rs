//! Queries: boolean clauses over field terms and phrases.

pub mod parser;
pub mod scorer;

pub use parser::QueryParser;
pub use scorer::{ConstantScorer, Scorer, SimilarityScorer};

/// How a clause combines with the accumulated result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occur {
    /// The clause must match (intersection).
    Must,
    /// The clause may match (union, scores accumulate).
    Should,
    /// The clause must not match (removal).
    MustNot,
}

/// One clause of a query: a field, a raw value, and how its matches
/// combine. A phrase clause combines its tokens additively instead of
/// applying the boolean operator per token.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub occur: Occur,
    pub field: String,
    pub value: String,
    pub phrase: bool,
}

impl Clause {
    pub fn term<F: Into<String>, V: Into<String>>(occur: Occur, field: F, value: V) -> Self {
        Clause {
            occur,
            field: field.into(),
            value: value.into(),
            phrase: false,
        }
    }

    pub fn phrase<F: Into<String>, V: Into<String>>(occur: Occur, field: F, value: V) -> Self {
        Clause {
            occur,
            field: field.into(),
            value: value.into(),
            phrase: true,
        }
    }
}

/// A parsed query plus its result window and field selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub clauses: Vec<Clause>,
    /// Fields to return with each document; empty means all.
    pub select: Vec<String>,
    /// Documents to skip past in the sorted result.
    pub skip: usize,
    /// Documents to return; `0` means all remaining.
    pub take: usize,
}

impl Query {
    pub fn new(clauses: Vec<Clause>) -> Self {
        Query {
            clauses,
            ..Query::default()
        }
    }

    pub fn with_window(mut self, skip: usize, take: usize) -> Self {
        self.skip = skip;
        self.take = take;
        self
    }

    pub fn with_select(mut self, select: Vec<String>) -> Self {
        self.select = select;
        self
    }
}
