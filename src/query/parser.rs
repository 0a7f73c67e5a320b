//! The query-string parser.
//!
//! Grammar, one clause per whitespace-separated group:
//!
//! ```text
//! [+|-] [field:] value
//! [+|-] [field:] "quoted phrase"
//! ```
//!
//! `+` marks a must clause, `-` a must-not clause; an unprefixed clause is
//! a should clause. A clause without a field applies to the parser's
//! default field. Quoted values are phrase clauses.

use crate::error::{CanopyError, Result};
use crate::query::{Clause, Occur, Query};

pub struct QueryParser {
    default_field: String,
}

impl QueryParser {
    pub fn new<S: Into<String>>(default_field: S) -> Self {
        QueryParser {
            default_field: default_field.into(),
        }
    }

    pub fn parse(&self, input: &str) -> Result<Query> {
        let mut chars = input.chars().peekable();
        let mut clauses = Vec::new();

        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_none() {
                break;
            }

            let occur = match chars.peek() {
                Some('+') => {
                    chars.next();
                    Occur::Must
                }
                Some('-') => {
                    chars.next();
                    Occur::MustNot
                }
                _ => Occur::Should,
            };

            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == ':' || c == '"' {
                    break;
                }
                token.push(c);
                chars.next();
            }

            let field = if chars.next_if(|&c| c == ':').is_some() {
                if token.is_empty() {
                    return Err(CanopyError::query("clause is missing its field name"));
                }
                token
            } else if token.is_empty() && chars.peek() != Some(&'"') {
                return Err(CanopyError::query(format!(
                    "unexpected character {:?}",
                    chars.peek().copied().unwrap_or(' ')
                )));
            } else if !token.is_empty() {
                // A bare term against the default field.
                clauses.push(Clause::term(occur, self.default_field.clone(), token));
                continue;
            } else {
                self.default_field.clone()
            };

            if chars.next_if(|&c| c == '"').is_some() {
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => value.push(c),
                        None => {
                            return Err(CanopyError::query("unterminated quoted phrase"));
                        }
                    }
                }
                clauses.push(Clause::phrase(occur, field, value));
            } else {
                let mut value = String::new();
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    value.push(c);
                }
                if value.is_empty() {
                    return Err(CanopyError::query(format!(
                        "field `{field}` is missing its value"
                    )));
                }
                clauses.push(Clause::term(occur, field, value));
            }
        }

        if clauses.is_empty() {
            return Err(CanopyError::query("query holds no clauses"));
        }

        Ok(Query::new(clauses))
    }
}
