//! Compilation of query trees into parameterized SQL over `log_entries`
//!
//! Every user-supplied value travels as a bound parameter. Each emitted
//! fragment has exactly one `?` per parameter it carries.

use super::query::{BoolOp, BooleanNode, Field, FieldTerm, Node, Query, RegexTerm, TextTerm};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A SQL boolean expression with its positional parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlCondition {
    pub sql: String,
    pub params: Vec<String>,
}

impl SqlCondition {
    pub fn placeholder_count(&self) -> usize {
        self.sql.matches('?').count()
    }
}

/// Compiled form of a query, ready for the repository
///
/// `clauses` are joined with `combinator`. An empty clause list matches
/// every row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledPredicate {
    pub clauses: Vec<SqlCondition>,
    pub combinator: BoolOp,
    /// Query contains at least one regex term
    pub has_regex: bool,
    /// Every match is constrained by an indexed column or the FTS index
    pub has_indexed_prefilter: bool,
}

impl CompiledPredicate {
    /// Predicate for a blank query
    pub fn match_all() -> Self {
        Self {
            clauses: Vec::new(),
            combinator: BoolOp::And,
            has_regex: false,
            has_indexed_prefilter: false,
        }
    }

    /// Regex terms would be evaluated row by row over an unbounded set
    pub fn needs_prefilter_warning(&self) -> bool {
        self.has_regex && !self.has_indexed_prefilter
    }

    /// Single SQL expression for the whole predicate, `None` when it matches everything
    pub fn to_condition(&self) -> Option<SqlCondition> {
        match self.clauses.as_slice() {
            [] => None,
            [only] => Some(only.clone()),
            clauses => {
                let joiner = format!(" {} ", self.combinator.as_str());
                Some(SqlCondition {
                    sql: format!(
                        "({})",
                        clauses
                            .iter()
                            .map(|c| c.sql.as_str())
                            .collect::<Vec<_>>()
                            .join(&joiner)
                    ),
                    params: clauses.iter().flat_map(|c| c.params.clone()).collect(),
                })
            }
        }
    }
}

/// Compile the whole query into one parameterized expression
pub fn get_sql_condition(query: &Query) -> Result<SqlCondition> {
    let mut params = Vec::new();
    let sql = compile_node(query.root(), &mut params)?;
    Ok(SqlCondition { sql, params })
}

/// Compile a query, keeping top-level clauses separate
pub fn compile(query: &Query) -> Result<CompiledPredicate> {
    let root = query.root();
    let (children, combinator): (&[Node], BoolOp) = match root {
        Node::Boolean(node) if !node.negated => (node.children.as_slice(), node.op),
        _ => (std::slice::from_ref(root), BoolOp::And),
    };

    let clauses = children
        .iter()
        .map(|child| {
            let mut params = Vec::new();
            let sql = compile_node(child, &mut params)?;
            Ok(SqlCondition { sql, params })
        })
        .collect::<Result<Vec<_>>>()?;

    let predicate = CompiledPredicate {
        clauses,
        combinator,
        has_regex: query.has_regex(),
        has_indexed_prefilter: has_prefilter(root),
    };
    tracing::debug!(
        clauses = predicate.clauses.len(),
        combinator = predicate.combinator.as_str(),
        has_regex = predicate.has_regex,
        "Compiled query"
    );
    Ok(predicate)
}

fn compile_node(node: &Node, params: &mut Vec<String>) -> Result<String> {
    match node {
        Node::Text(term) => Ok(compile_text(term, params)),
        Node::Field(term) => Ok(compile_field(term, params)),
        Node::Regex(term) => Ok(compile_regex(term, params)),
        Node::Boolean(node) => compile_boolean(node, params),
    }
}

fn compile_text(term: &TextTerm, params: &mut Vec<String>) -> String {
    params.push(fts_phrase(&term.value));
    let fts = "id IN (SELECT rowid FROM log_entries_fts WHERE log_entries_fts MATCH ?)";
    if term.case_sensitive {
        // FTS matching folds case; re-check the raw message
        params.push(term.value.clone());
        format!("({} AND instr(message, ?) > 0)", fts)
    } else {
        fts.to_string()
    }
}

fn compile_field(term: &FieldTerm, params: &mut Vec<String>) -> String {
    let column = term.field.column();
    match term.field {
        Field::Level | Field::Service => {
            params.push(term.value.clone());
            if term.case_sensitive {
                format!("{} = ? COLLATE BINARY", column)
            } else {
                format!("{} = ?", column)
            }
        }
        Field::CorrelationId => {
            params.push(term.value.clone());
            format!("{} = ?", column)
        }
        Field::Message if term.case_sensitive => {
            params.push(term.value.clone());
            format!("instr({}, ?) > 0", column)
        }
        Field::Message => {
            params.push(format!("%{}%", escape_like(&term.value)));
            format!("{} LIKE ? ESCAPE '\\'", column)
        }
        // ISO-8601 prefix: `2024-01-15`, `2024-01-15T10`
        Field::Time => {
            params.push(format!("{}%", escape_like(&term.value)));
            format!("{} LIKE ? ESCAPE '\\'", column)
        }
    }
}

fn compile_regex(term: &RegexTerm, params: &mut Vec<String>) -> String {
    if term.case_sensitive {
        params.push(term.pattern.clone());
    } else {
        params.push(format!("(?i){}", term.pattern));
    }
    "message REGEXP ?".to_string()
}

fn compile_boolean(node: &BooleanNode, params: &mut Vec<String>) -> Result<String> {
    if node.children.is_empty() {
        return Err(Error::Compile("boolean group without operands".to_string()));
    }
    let joiner = format!(" {} ", node.op.as_str());
    let parts = node
        .children
        .iter()
        .map(|child| compile_node(child, params))
        .collect::<Result<Vec<_>>>()?;
    let body = format!("({})", parts.join(&joiner));
    Ok(if node.negated {
        format!("NOT {}", body)
    } else {
        body
    })
}

/// Whether every row matched by `node` is first narrowed by an index
fn has_prefilter(node: &Node) -> bool {
    match node {
        Node::Text(_) => true,
        Node::Field(term) => term.field != Field::Message,
        Node::Regex(_) => false,
        Node::Boolean(node) if node.negated => false,
        Node::Boolean(node) => match node.op {
            BoolOp::And => node.children.iter().any(has_prefilter),
            BoolOp::Or => node.children.iter().all(has_prefilter),
        },
    }
}

/// Quote a value as a single FTS5 phrase
pub fn fts_phrase(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Escape `%`, `_` and `\` for a LIKE pattern using `ESCAPE '\'`
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::search::parser::QueryParser;

    fn parse(input: &str) -> Query {
        QueryParser::default().parse(input).unwrap()
    }

    #[test]
    fn test_text_term_uses_fts() {
        let condition = get_sql_condition(&parse("\"connection refused\"")).unwrap();
        assert!(condition.sql.contains("log_entries_fts MATCH ?"));
        assert_eq!(condition.params, vec!["\"connection refused\""]);
    }

    #[test]
    fn test_field_terms() {
        let condition = get_sql_condition(&parse("level:error")).unwrap();
        assert_eq!(condition.sql, "level = ?");
        assert_eq!(condition.params, vec!["error"]);

        let condition = get_sql_condition(&parse("message:50%_off")).unwrap();
        assert_eq!(condition.sql, "message LIKE ? ESCAPE '\\'");
        assert_eq!(condition.params, vec!["%50\\%\\_off%"]);

        let condition = get_sql_condition(&parse("time:2024-01-15")).unwrap();
        assert_eq!(condition.sql, "timestamp LIKE ? ESCAPE '\\'");
        assert_eq!(condition.params, vec!["2024-01-15%"]);
    }

    #[test]
    fn test_regex_is_case_insensitive_by_default() {
        let query = parse("/^ERROR/");
        let condition = get_sql_condition(&query).unwrap();
        assert_eq!(condition.sql, "message REGEXP ?");
        assert_eq!(condition.params, vec!["(?i)^ERROR"]);

        let condition = get_sql_condition(&query.with_case_sensitivity(true)).unwrap();
        assert_eq!(condition.params, vec!["^ERROR"]);
    }

    #[test]
    fn test_boolean_structure() {
        let condition =
            get_sql_condition(&parse("level:error AND NOT (timeout OR service:db)")).unwrap();
        assert_eq!(
            condition.sql,
            "(level = ? AND NOT (id IN (SELECT rowid FROM log_entries_fts WHERE log_entries_fts MATCH ?) OR service = ?))"
        );
        assert_eq!(condition.params, vec!["error", "\"timeout\"", "db"]);
    }

    #[test]
    fn test_values_never_reach_sql_text() {
        let hostile = [
            "\"'; DROP TABLE log_entries; --\"",
            "level:\"error' OR '1'='1\"",
            "message:\"a?b\"",
            "/'); DELETE FROM saved_searches; --/",
            "cid:\"x\\\"y\" OR time:2024 NOT svc:\"a b\"",
        ];
        for input in hostile {
            let query = parse(input).with_case_sensitivity(true);
            for q in [parse(input), query] {
                let condition = get_sql_condition(&q).unwrap();
                assert!(!condition.sql.contains("DROP"), "{}", condition.sql);
                assert!(!condition.sql.contains("DELETE"), "{}", condition.sql);
                assert!(!condition.sql.contains("1'='1"), "{}", condition.sql);
                // `?` inside values stays in params, so the counts still agree
                assert_eq!(condition.placeholder_count(), condition.params.len(), "{}", input);
            }
        }
    }

    #[test]
    fn test_compile_splits_top_level_clauses() {
        let predicate = compile(&parse("level:error timeout /fail/")).unwrap();
        assert_eq!(predicate.clauses.len(), 3);
        assert_eq!(predicate.combinator, BoolOp::And);
        assert!(predicate.has_regex);
        assert!(predicate.has_indexed_prefilter);
        assert!(!predicate.needs_prefilter_warning());

        let condition = predicate.to_condition().unwrap();
        assert_eq!(condition.placeholder_count(), condition.params.len());
        assert!(condition.sql.starts_with('('));
    }

    #[test]
    fn test_regex_only_query_lacks_prefilter() {
        assert!(compile(&parse("/timeout/")).unwrap().needs_prefilter_warning());
        assert!(compile(&parse("/timeout/ OR level:error")).unwrap().needs_prefilter_warning());
        assert!(compile(&parse("message:x /timeout/")).unwrap().needs_prefilter_warning());
        assert!(!compile(&parse("svc:api /timeout/")).unwrap().needs_prefilter_warning());
    }

    #[test]
    fn test_match_all_has_no_condition() {
        assert_eq!(CompiledPredicate::match_all().to_condition(), None);
    }

    #[test]
    fn test_empty_group_is_compile_error() {
        let query = Query::new(Node::Boolean(BooleanNode {
            op: BoolOp::Or,
            children: Vec::new(),
            negated: false,
        }));
        let err = get_sql_condition(&query).unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
        assert!(err.is_infrastructure());
    }

    #[test]
    fn test_fts_phrase_doubles_quotes() {
        assert_eq!(fts_phrase(r#"say "hi""#), r#""say ""hi""""#);
    }
}
