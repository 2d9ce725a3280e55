//! Query definitions.
//!
//! A query is a stored, reusable extraction rule: either a CSS selector
//! evaluated against the parsed HTML tree (with an optional `@attribute`
//! suffix) or a regular expression evaluated against raw text. The
//! result-kind flags decide whether a query yields a boolean, the first
//! match, or all matches.

use serde::{Deserialize, Serialize};

/// The engine a query text is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Selector,
    Regex,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Selector => "selector",
            Self::Regex => "regex",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "selector" => Some(Self::Selector),
            "regex" => Some(Self::Regex),
            _ => None,
        }
    }
}

/// A stored query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDef {
    pub id: i64,
    /// Owning website; `None` for global queries.
    pub website: Option<i64>,
    pub name: String,
    pub text: String,
    pub query_type: QueryType,
    /// Query may be evaluated as a boolean check.
    pub result_bool: bool,
    /// Query may yield a single (first) result.
    pub result_single: bool,
    /// Query may yield all matches.
    pub result_multi: bool,
    /// Return text content only, not markup.
    pub text_only: bool,
}

/// Properties for creating or updating a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryProps {
    pub name: String,
    pub text: String,
    #[serde(rename = "type")]
    pub query_type: QueryType,
    #[serde(default)]
    pub result_bool: bool,
    #[serde(default)]
    pub result_single: bool,
    #[serde(default)]
    pub result_multi: bool,
    #[serde(default)]
    pub text_only: bool,
}
