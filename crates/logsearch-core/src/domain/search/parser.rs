//! Query language parser
//!
//! Recursive descent over a small token stream. Precedence from loosest to
//! tightest: `OR`, `AND` (explicit or by juxtaposition), `NOT`, parentheses.
//! Operators of equal precedence associate left to right.
//!
//! ```text
//! or_expr   := and_expr ( "OR" and_expr )*
//! and_expr  := not_expr ( ["AND"] not_expr )*
//! not_expr  := "NOT"* primary
//! primary   := "(" or_expr ")" | field_term | regex_term | text_term
//! field_term:= IDENT ":" ( quoted | bare )
//! regex_term:= "/" pattern "/"
//! text_term := quoted | bare
//! ```
//!
//! A bare word is a field term only when the part before the first `:` is an
//! identifier. `http://host/x` and `retry:` (an unknown name with nothing
//! after the colon) stay text; quote any other word to search for it
//! literally, e.g. `"level:"`.
//!
//! Parentheses may nest at most [`MAX_NESTING_DEPTH`] levels.

use super::compiler::{self, SqlCondition};
use super::optimizer;
use super::query::{BoolOp, Field, Node, Query};
use super::regex_guard;
use crate::config::SearchSettings;
use crate::error::{Error, Result};

/// Deepest parenthesis nesting accepted by the parser
pub const MAX_NESTING_DEPTH: usize = 64;

/// Canonical names of the fields accepted in `field:value` terms
pub fn supported_fields() -> Vec<&'static str> {
    Field::all().iter().map(Field::as_str).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Word(String),
    Quoted(String),
    Regex(String),
    Field { name: String, value: String },
}

impl Token {
    fn starts_operand(&self) -> bool {
        !matches!(self, Token::RParen | Token::And | Token::Or)
    }
}

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            source,
        }
    }

    fn error(&self, message: impl std::fmt::Display) -> Error {
        Error::InvalidQuery(format!("{} at position {}", message, self.pos))
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += 1;
                continue;
            }
            if c.is_control() {
                return Err(self.error(format!("control character {:?}", c)));
            }
            let start = self.pos;
            let token = match c {
                '(' => {
                    self.pos += 1;
                    Token::LParen
                }
                ')' => {
                    self.pos += 1;
                    Token::RParen
                }
                '"' => Token::Quoted(self.quoted()?),
                '/' => Token::Regex(self.regex()?),
                _ => self.word_or_field()?,
            };
            tokens.push((token, start));
        }
        tracing::trace!(query = self.source, tokens = tokens.len(), "Tokenized query");
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn quoted(&mut self) -> Result<String> {
        // Opening quote
        self.pos += 1;
        let mut value = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error("unterminated quoted string"));
            };
            self.pos += 1;
            match c {
                '"' => break,
                '\\' => match self.peek() {
                    Some(escaped @ ('"' | '\\')) => {
                        value.push(escaped);
                        self.pos += 1;
                    }
                    Some(other) => {
                        return Err(self.error(format!("unsupported escape '\\{}'", other)));
                    }
                    None => return Err(self.error("unterminated quoted string")),
                },
                c if c.is_control() => {
                    return Err(self.error(format!("control character {:?} in quoted string", c)));
                }
                c => value.push(c),
            }
        }
        if value.is_empty() {
            return Err(self.error("empty quoted string"));
        }
        Ok(value)
    }

    fn regex(&mut self) -> Result<String> {
        // Opening slash
        self.pos += 1;
        let mut pattern = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error("unterminated regex"));
            };
            self.pos += 1;
            match c {
                '/' => break,
                '\\' => {
                    let Some(next) = self.peek() else {
                        return Err(self.error("unterminated regex"));
                    };
                    self.pos += 1;
                    if next != '/' {
                        pattern.push('\\');
                    }
                    pattern.push(next);
                }
                c if c.is_control() => {
                    return Err(self.error(format!("control character {:?} in regex", c)));
                }
                c => pattern.push(c),
            }
        }
        if pattern.is_empty() {
            return Err(self.error("empty regex"));
        }
        Ok(pattern)
    }

    fn bare(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() || c.is_control() || matches!(c, '(' | ')' | '"') {
                break;
            }
            word.push(c);
            self.pos += 1;
        }
        word
    }

    fn word_or_field(&mut self) -> Result<Token> {
        let word = self.bare();
        let field_name = word
            .split_once(':')
            .map(|(name, _)| name)
            .filter(|name| is_identifier(name));

        let Some(name) = field_name else {
            let keyword = match word.as_str() {
                "AND" => Some(Token::And),
                "OR" => Some(Token::Or),
                "NOT" => Some(Token::Not),
                _ => None,
            };
            return Ok(keyword.unwrap_or(Token::Word(word)));
        };

        let inline_value = &word[name.len() + 1..];
        let unknown_without_value = inline_value.is_empty()
            && self.peek() != Some('"')
            && Field::from_name(name).is_none();
        if inline_value.starts_with("//") || unknown_without_value {
            return Ok(Token::Word(word));
        }

        let name = name.to_string();
        let value = if !inline_value.is_empty() {
            inline_value.to_string()
        } else if self.peek() == Some('"') {
            self.quoted()?
        } else {
            return Err(self.error(format!("missing value for field '{}'", name)));
        };
        Ok(Token::Field { name, value })
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(_, at)| *at)
    }

    fn error(&self, message: &str) -> Error {
        Error::InvalidQuery(format!("{} at position {}", message, self.position()))
    }

    fn or_expr(&mut self) -> Result<Node> {
        let mut children = vec![self.and_expr()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            self.expect_operand("OR")?;
            children.push(self.and_expr()?);
        }
        Ok(Node::group(BoolOp::Or, children))
    }

    fn and_expr(&mut self) -> Result<Node> {
        let mut children = vec![self.not_expr()?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                    self.expect_operand("AND")?;
                }
                Some(token) if token.starts_operand() => {}
                _ => break,
            }
            children.push(self.not_expr()?);
        }
        Ok(Node::group(BoolOp::And, children))
    }

    fn not_expr(&mut self) -> Result<Node> {
        let mut negations = 0usize;
        while self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.expect_operand("NOT")?;
            negations += 1;
        }
        let node = self.primary()?;
        // NOT NOT x is x
        Ok(if negations % 2 == 1 { node.negate() } else { node })
    }

    fn primary(&mut self) -> Result<Node> {
        let Some((token, _)) = self.tokens.get(self.pos).cloned() else {
            return Err(self.error("unexpected end of query"));
        };
        match token {
            Token::LParen => {
                self.pos += 1;
                if self.peek() == Some(&Token::RParen) {
                    return Err(self.error("empty group"));
                }
                if self.depth == MAX_NESTING_DEPTH {
                    return Err(self.error(&format!(
                        "parentheses nested deeper than {} levels",
                        MAX_NESTING_DEPTH
                    )));
                }
                self.depth += 1;
                let inner = self.or_expr()?;
                self.depth -= 1;
                if self.peek() != Some(&Token::RParen) {
                    return Err(self.error("missing closing parenthesis"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Token::RParen => Err(self.error("unexpected ')'")),
            Token::And | Token::Or | Token::Not => Err(self.error("dangling operator")),
            Token::Word(value) | Token::Quoted(value) => {
                self.pos += 1;
                Ok(Node::text(value))
            }
            Token::Regex(pattern) => {
                self.pos += 1;
                Ok(Node::regex(pattern))
            }
            Token::Field { name, value } => {
                let Some(field) = Field::from_name(&name) else {
                    return Err(Error::UnknownField {
                        field: name,
                        supported: supported_fields().into_iter().map(String::from).collect(),
                    });
                };
                self.pos += 1;
                Ok(Node::field(field, value))
            }
        }
    }

    fn expect_operand(&self, operator: &str) -> Result<()> {
        match self.peek() {
            Some(token) if token.starts_operand() => Ok(()),
            _ => Err(self.error(&format!("dangling operator {}", operator))),
        }
    }
}

/// Parses, validates, optimizes and compiles queries
///
/// Holds only the configured limits, so one instance can be shared freely
/// between concurrent requests.
#[derive(Debug, Clone)]
pub struct QueryParser {
    max_query_length: usize,
    max_query_nodes: usize,
    max_regex_length: usize,
}

impl Default for QueryParser {
    fn default() -> Self {
        Self::new(&SearchSettings::default())
    }
}

impl QueryParser {
    pub fn new(settings: &SearchSettings) -> Self {
        Self {
            max_query_length: settings.max_query_length,
            max_query_nodes: settings.max_query_nodes,
            max_regex_length: settings.max_regex_length,
        }
    }

    /// Syntactic parse without regex safety checks
    pub fn parse(&self, query_string: &str) -> Result<Query> {
        let tokens = Lexer::new(query_string).tokenize()?;
        if tokens.is_empty() {
            return Err(Error::InvalidQuery("query is empty".to_string()));
        }

        let mut parser = Parser {
            tokens,
            pos: 0,
            end: query_string.chars().count(),
            depth: 0,
        };
        let root = parser.or_expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unbalanced parenthesis"));
        }
        Ok(Query::new(root))
    }

    /// Parse, then enforce length, size and regex safety limits
    pub fn parse_and_validate(&self, query_string: &str) -> Result<Query> {
        let length = query_string.chars().count();
        if length > self.max_query_length {
            return Err(Error::QueryTooLong {
                len: length,
                max: self.max_query_length,
            });
        }

        let query = self.parse(query_string)?;

        let nodes = query.node_count();
        if nodes > self.max_query_nodes {
            return Err(Error::QueryTooComplex {
                nodes,
                max: self.max_query_nodes,
            });
        }

        for pattern in query.regex_patterns() {
            self.validate_regex(pattern)?;
        }
        Ok(query)
    }

    pub fn validate_regex(&self, pattern: &str) -> Result<()> {
        regex_guard::validate_regex(pattern, self.max_regex_length)
    }

    pub fn supported_fields(&self) -> Vec<&'static str> {
        supported_fields()
    }

    /// Compile a query into one parameterized SQL boolean expression
    pub fn get_sql_condition(&self, query: &Query) -> Result<SqlCondition> {
        compiler::get_sql_condition(query)
    }

    pub fn optimize(&self, query: &Query) -> Query {
        optimizer::optimize(query)
    }
}
