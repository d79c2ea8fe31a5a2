//! Match highlighting for result messages
//!
//! Spans come from the positive terms of a query: text terms, `message:`
//! values and regex terms. Terms under a NOT never highlight anything.

use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::entity::{LogEntryRef, Span};
use super::query::{Field, Node, Query};
use crate::error::{Error, Result};

/// Compiled matchers for one query
#[derive(Debug, Clone, Default)]
pub struct Highlighter {
    matchers: Vec<Regex>,
}

impl Highlighter {
    pub fn from_query(query: &Query) -> Result<Self> {
        let mut matchers = Vec::new();
        collect_matchers(query.root(), &mut matchers)?;
        Ok(Self { matchers })
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Sorted, non-overlapping byte spans of every match in `message`
    pub fn spans(&self, message: &str) -> Vec<Span> {
        let mut spans: Vec<Span> = self
            .matchers
            .iter()
            .flat_map(|matcher| matcher.find_iter(message))
            .filter(|m| !m.is_empty())
            .map(|m| Span::new(m.start(), m.end()))
            .collect();
        merge_spans(&mut spans);
        spans
    }

    /// Highlight a page of entries on the blocking pool, bounded by `timeout`
    ///
    /// Exceeding the timeout is reported as `Error::QueryTooExpensive`.
    pub async fn highlight_entries(
        self: Arc<Self>,
        entries: &[LogEntryRef],
        timeout: Duration,
    ) -> Result<HashMap<i64, Vec<Span>>> {
        if self.is_empty() || entries.is_empty() {
            return Ok(HashMap::new());
        }

        let messages: Vec<(i64, String)> = entries
            .iter()
            .map(|entry| (entry.id, entry.message.clone()))
            .collect();
        let task = tokio::task::spawn_blocking(move || {
            messages
                .into_iter()
                .filter_map(|(id, message)| {
                    let spans = self.spans(&message);
                    (!spans.is_empty()).then_some((id, spans))
                })
                .collect::<HashMap<_, _>>()
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(highlights)) => Ok(highlights),
            Ok(Err(join_error)) => {
                tracing::error!(error = %join_error, "Highlight task failed");
                Err(Error::Internal("highlighting results".to_string()))
            }
            Err(_) => Err(Error::QueryTooExpensive(timeout.as_millis() as u64)),
        }
    }
}

fn collect_matchers(node: &Node, out: &mut Vec<Regex>) -> Result<()> {
    match node {
        Node::Text(term) => out.push(literal(&term.value, term.case_sensitive)?),
        Node::Field(term) if term.field == Field::Message => {
            out.push(literal(&term.value, term.case_sensitive)?)
        }
        Node::Field(_) => {}
        Node::Regex(term) => out.push(
            RegexBuilder::new(&term.pattern)
                .case_insensitive(!term.case_sensitive)
                .build()
                .map_err(|e| Error::InvalidQuery(format!("regex /{}/: {}", term.pattern, e)))?,
        ),
        Node::Boolean(group) if group.negated => {}
        Node::Boolean(group) => {
            for child in &group.children {
                collect_matchers(child, out)?;
            }
        }
    }
    Ok(())
}

fn literal(value: &str, case_sensitive: bool) -> Result<Regex> {
    RegexBuilder::new(&regex::escape(value))
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|e| Error::Compile(format!("highlight pattern for '{}': {}", value, e)))
}

/// Sort spans and merge any that overlap or touch
fn merge_spans(spans: &mut Vec<Span>) {
    spans.sort();
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans.drain(..) {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    *spans = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::search::parser::QueryParser;
    use chrono::Utc;

    fn highlighter(query: &str) -> Highlighter {
        Highlighter::from_query(&QueryParser::default().parse(query).unwrap()).unwrap()
    }

    #[test]
    fn test_text_terms_case_insensitive() {
        let spans = highlighter("timeout").spans("Timeout: upstream timeout");
        assert_eq!(spans, vec![Span::new(0, 7), Span::new(18, 25)]);
    }

    #[test]
    fn test_case_sensitive_terms() {
        let query = QueryParser::default()
            .parse("Timeout")
            .unwrap()
            .with_case_sensitivity(true);
        let spans = Highlighter::from_query(&query)
            .unwrap()
            .spans("timeout then Timeout");
        assert_eq!(spans, vec![Span::new(13, 20)]);
    }

    #[test]
    fn test_regex_and_overlaps_merge() {
        let spans = highlighter("\"connection refused\" /refused \\w+/")
            .spans("connection refused by peer");
        assert_eq!(spans, vec![Span::new(0, 21)]);
    }

    #[test]
    fn test_negated_and_non_message_fields_ignored() {
        let h = highlighter("level:error NOT timeout");
        assert!(h.is_empty());
        assert!(h.spans("error timeout").is_empty());
    }

    #[test]
    fn test_message_field_highlights() {
        let spans = highlighter("msg:\"pool exhausted\"").spans("db pool exhausted");
        assert_eq!(spans, vec![Span::new(3, 17)]);
    }

    #[tokio::test]
    async fn test_highlight_entries() {
        let entries = vec![
            LogEntryRef {
                id: 1,
                timestamp: Utc::now(),
                level: "error".to_string(),
                service: "api".to_string(),
                message: "upstream timeout".to_string(),
                correlation_id: None,
                metadata: None,
            },
            LogEntryRef {
                id: 2,
                timestamp: Utc::now(),
                level: "info".to_string(),
                service: "api".to_string(),
                message: "all good".to_string(),
                correlation_id: None,
                metadata: None,
            },
        ];
        let highlights = Arc::new(highlighter("timeout"))
            .highlight_entries(&entries, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(highlights.len(), 1);
        assert_eq!(highlights[&1], vec![Span::new(9, 16)]);
    }
}
