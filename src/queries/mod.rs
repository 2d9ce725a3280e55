//! Compiled query engine.
//!
//! Stored queries come in two flavors: CSS selectors evaluated against the
//! parsed HTML tree (with an optional `@attribute` suffix for attribute
//! extraction) and regular expressions evaluated against raw text. Each
//! query supports boolean, first-match, and all-matches evaluation.

use regex::{Regex, RegexBuilder};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

use crate::models::QueryDef;
use crate::utils::text::tidy_whitespace;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Invalid selector '{0}'")]
    Selector(String),
    #[error("Invalid regular expression: {0}")]
    Regex(#[from] regex::Error),
}

/// A parsed HTML document ready for selector evaluation.
pub struct HtmlDocument {
    html: Html,
}

impl HtmlDocument {
    pub fn parse(content: &str) -> Self {
        Self {
            html: Html::parse_document(content),
        }
    }
}

enum CompiledKind {
    Selector {
        selector: Selector,
        /// Attribute to extract instead of element content.
        attribute: Option<String>,
    },
    Regex {
        single_line: Regex,
        multi_line: Regex,
    },
}

/// A compiled query plus its result-kind flags.
pub struct CompiledQuery {
    pub id: i64,
    pub name: String,
    pub result_bool: bool,
    pub result_single: bool,
    pub result_multi: bool,
    text_only: bool,
    kind: CompiledKind,
}

impl CompiledQuery {
    pub fn compile(def: &QueryDef) -> Result<Self, QueryError> {
        let kind = match def.query_type {
            crate::models::QueryType::Selector => {
                let (selector_text, attribute) = match def.text.rsplit_once('@') {
                    Some((selector, attr)) if !selector.is_empty() && !attr.contains(']') => {
                        (selector.trim(), Some(attr.trim().to_string()))
                    }
                    _ => (def.text.as_str(), None),
                };
                let selector = Selector::parse(selector_text)
                    .map_err(|_| QueryError::Selector(def.text.clone()))?;
                CompiledKind::Selector {
                    selector,
                    attribute,
                }
            }
            crate::models::QueryType::Regex => CompiledKind::Regex {
                single_line: Regex::new(&def.text)?,
                multi_line: RegexBuilder::new(&def.text).multi_line(true).build()?,
            },
        };

        Ok(Self {
            id: def.id,
            name: def.name.clone(),
            result_bool: def.result_bool,
            result_single: def.result_single,
            result_multi: def.result_multi,
            text_only: def.text_only,
            kind,
        })
    }

    fn element_value(&self, element: ElementRef, attribute: &Option<String>) -> Option<String> {
        match attribute {
            Some(attr) => element.value().attr(attr).map(str::to_string),
            None if self.text_only => {
                Some(tidy_whitespace(&element.text().collect::<Vec<_>>().join(" ")))
            }
            None => Some(element.html()),
        }
    }

    /// Whether the query matches at all.
    pub fn matches(&self, document: &HtmlDocument, text: &str) -> bool {
        match &self.kind {
            CompiledKind::Selector { selector, .. } => {
                document.html.select(selector).next().is_some()
            }
            CompiledKind::Regex { multi_line, .. } => multi_line.is_match(text),
        }
    }

    /// First result, if any.
    pub fn first(&self, document: &HtmlDocument, text: &str) -> Option<String> {
        match &self.kind {
            CompiledKind::Selector {
                selector,
                attribute,
            } => document
                .html
                .select(selector)
                .find_map(|el| self.element_value(el, attribute)),
            CompiledKind::Regex { single_line, .. } => single_line.captures(text).map(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            }),
        }
    }

    /// All results (all selected elements, or all non-overlapping matches).
    pub fn all(&self, document: &HtmlDocument, text: &str) -> Vec<String> {
        match &self.kind {
            CompiledKind::Selector {
                selector,
                attribute,
            } => document
                .html
                .select(selector)
                .filter_map(|el| self.element_value(el, attribute))
                .collect(),
            CompiledKind::Regex { multi_line, .. } => multi_line
                .captures_iter(text)
                .map(|caps| {
                    caps.get(1)
                        .or_else(|| caps.get(0))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default()
                })
                .collect(),
        }
    }
}

/// Compile a set of stored queries, logging and skipping broken ones.
pub fn compile_all(defs: &[QueryDef]) -> Vec<CompiledQuery> {
    defs.iter()
        .filter_map(|def| match CompiledQuery::compile(def) {
            Ok(query) => Some(query),
            Err(e) => {
                tracing::warn!("skipping query '{}': {e}", def.name);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryType;

    fn def(text: &str, query_type: QueryType, text_only: bool) -> QueryDef {
        QueryDef {
            id: 1,
            website: None,
            name: "test".to_string(),
            text: text.to_string(),
            query_type,
            result_bool: true,
            result_single: true,
            result_multi: true,
            text_only,
        }
    }

    const PAGE: &str = r#"
        <html><body>
            <article id="42"><h1>Title  Here</h1><p>Body text</p></article>
            <a href="/a">first</a>
            <a href="/b">second</a>
        </body></html>
    "#;

    #[test]
    fn test_selector_text_only() {
        let query = CompiledQuery::compile(&def("article h1", QueryType::Selector, true)).unwrap();
        let doc = HtmlDocument::parse(PAGE);

        assert!(query.matches(&doc, PAGE));
        assert_eq!(query.first(&doc, PAGE), Some("Title Here".to_string()));
    }

    #[test]
    fn test_selector_attribute_extraction() {
        let query = CompiledQuery::compile(&def("article@id", QueryType::Selector, false)).unwrap();
        let doc = HtmlDocument::parse(PAGE);
        assert_eq!(query.first(&doc, PAGE), Some("42".to_string()));

        let query = CompiledQuery::compile(&def("a@href", QueryType::Selector, false)).unwrap();
        assert_eq!(
            query.all(&doc, PAGE),
            vec!["/a".to_string(), "/b".to_string()]
        );
    }

    #[test]
    fn test_selector_attribute_inside_brackets_not_split() {
        // `a[href@="x"]` style selectors must not be treated as an @-suffix.
        let query =
            CompiledQuery::compile(&def("a[href=\"/a\"]", QueryType::Selector, true)).unwrap();
        let doc = HtmlDocument::parse(PAGE);
        assert_eq!(query.first(&doc, PAGE), Some("first".to_string()));
    }

    #[test]
    fn test_regex_first_and_all() {
        let query =
            CompiledQuery::compile(&def(r#"href="([^"]+)""#, QueryType::Regex, false)).unwrap();
        let doc = HtmlDocument::parse(PAGE);

        assert!(query.matches(&doc, PAGE));
        assert_eq!(query.first(&doc, PAGE), Some("/a".to_string()));
        assert_eq!(query.all(&doc, PAGE), vec!["/a", "/b"]);
    }

    #[test]
    fn test_regex_without_group_returns_full_match() {
        let query = CompiledQuery::compile(&def(r"/[ab]", QueryType::Regex, false)).unwrap();
        let doc = HtmlDocument::parse(PAGE);
        assert_eq!(query.all(&doc, PAGE), vec!["/a", "/b"]);
    }

    #[test]
    fn test_invalid_selector_rejected() {
        assert!(CompiledQuery::compile(&def("](bad", QueryType::Selector, false)).is_err());
    }

    #[test]
    fn test_no_match_yields_nothing() {
        let query = CompiledQuery::compile(&def("section", QueryType::Selector, true)).unwrap();
        let doc = HtmlDocument::parse(PAGE);
        assert!(!query.matches(&doc, PAGE));
        assert_eq!(query.first(&doc, PAGE), None);
        assert!(query.all(&doc, PAGE).is_empty());
    }
}
