//! Query AST
//!
//! A parsed query is a tree of [`Node`]s. Leaves are text, field and regex
//! terms; inner nodes are AND/OR groups that may be negated. The `Display`
//! impl renders a tree back into query syntax that parses to the same tree.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Log attributes that can be addressed with `field:value`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Level,
    Service,
    Message,
    CorrelationId,
    Time,
}

impl Field {
    /// Canonical name used in query syntax
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Level => "level",
            Self::Service => "service",
            Self::Message => "message",
            Self::CorrelationId => "correlation_id",
            Self::Time => "time",
        }
    }

    /// Column of `log_entries` this field maps to
    pub fn column(&self) -> &'static str {
        match self {
            Self::Level => "level",
            Self::Service => "service",
            Self::Message => "message",
            Self::CorrelationId => "correlation_id",
            Self::Time => "timestamp",
        }
    }

    /// Resolve a field name or one of its short aliases
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "level" | "lvl" => Some(Self::Level),
            "service" | "svc" => Some(Self::Service),
            "message" | "msg" => Some(Self::Message),
            "correlation_id" | "cid" => Some(Self::CorrelationId),
            "time" => Some(Self::Time),
            _ => None,
        }
    }

    pub fn all() -> [Self; 5] {
        [
            Self::Level,
            Self::Service,
            Self::Message,
            Self::CorrelationId,
            Self::Time,
        ]
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean operator of a group node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoolOp {
    And,
    Or,
}

impl BoolOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// Literal token or phrase matched against the message full-text index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextTerm {
    pub value: String,
    pub case_sensitive: bool,
}

/// `field:value` restriction on one column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldTerm {
    pub field: Field,
    pub value: String,
    pub case_sensitive: bool,
}

/// `/pattern/` matched against the message column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegexTerm {
    pub pattern: String,
    pub case_sensitive: bool,
}

/// AND/OR over child nodes, optionally negated as a whole
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BooleanNode {
    pub op: BoolOp,
    pub children: Vec<Node>,
    pub negated: bool,
}

/// A node of the query tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Text(TextTerm),
    Field(FieldTerm),
    Regex(RegexTerm),
    Boolean(BooleanNode),
}

impl Node {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(TextTerm {
            value: value.into(),
            case_sensitive: false,
        })
    }

    pub fn field(field: Field, value: impl Into<String>) -> Self {
        Self::Field(FieldTerm {
            field,
            value: value.into(),
            case_sensitive: false,
        })
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::Regex(RegexTerm {
            pattern: pattern.into(),
            case_sensitive: false,
        })
    }

    /// Group `children` under `op`; a single child is returned as is
    pub fn group(op: BoolOp, mut children: Vec<Node>) -> Self {
        if children.len() == 1 {
            return children.remove(0);
        }
        Self::Boolean(BooleanNode {
            op,
            children,
            negated: false,
        })
    }

    /// Logical negation. Negating twice yields the original node.
    pub fn negate(self) -> Self {
        match self {
            Self::Boolean(BooleanNode {
                op: BoolOp::And,
                mut children,
                negated: true,
            }) if children.len() == 1 => children.remove(0),
            Self::Boolean(mut node) => {
                node.negated = !node.negated;
                Self::Boolean(node)
            }
            term => Self::Boolean(BooleanNode {
                op: BoolOp::And,
                children: vec![term],
                negated: true,
            }),
        }
    }

    /// Number of nodes in this subtree, including itself
    pub fn node_count(&self) -> usize {
        match self {
            Self::Boolean(node) => 1 + node.children.iter().map(Node::node_count).sum::<usize>(),
            _ => 1,
        }
    }

    /// Append every regex pattern in this subtree to `out`
    pub fn collect_regex_patterns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Regex(term) => out.push(&term.pattern),
            Self::Boolean(node) => {
                for child in &node.children {
                    child.collect_regex_patterns(out);
                }
            }
            Self::Text(_) | Self::Field(_) => {}
        }
    }

    /// Copy of this subtree with every term's case sensitivity set
    pub fn with_case_sensitivity(&self, case_sensitive: bool) -> Self {
        match self {
            Self::Text(term) => Self::Text(TextTerm {
                case_sensitive,
                ..term.clone()
            }),
            Self::Field(term) => Self::Field(FieldTerm {
                case_sensitive,
                ..term.clone()
            }),
            Self::Regex(term) => Self::Regex(RegexTerm {
                case_sensitive,
                ..term.clone()
            }),
            Self::Boolean(node) => Self::Boolean(BooleanNode {
                op: node.op,
                children: node
                    .children
                    .iter()
                    .map(|child| child.with_case_sensitivity(case_sensitive))
                    .collect(),
                negated: node.negated,
            }),
        }
    }

    fn is_compound(&self) -> bool {
        matches!(self, Self::Boolean(node) if !node.negated && node.children.len() > 1)
    }
}

/// A parsed query; immutable once produced
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    root: Node,
}

impl Query {
    pub fn new(root: Node) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn into_root(self) -> Node {
        self.root
    }

    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    /// All regex patterns in the query, in source order
    pub fn regex_patterns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.root.collect_regex_patterns(&mut out);
        out
    }

    pub fn has_regex(&self) -> bool {
        !self.regex_patterns().is_empty()
    }

    /// Copy of the query with every term matched case-sensitively or not
    pub fn with_case_sensitivity(&self, case_sensitive: bool) -> Self {
        Self::new(self.root.with_case_sensitivity(case_sensitive))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.root, f)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(term) => write_value(f, &term.value),
            Self::Field(term) => {
                write!(f, "{}:", term.field)?;
                write_value(f, &term.value)
            }
            Self::Regex(term) => write!(f, "/{}/", term.pattern.replace('/', "\\/")),
            Self::Boolean(node) => {
                if node.negated {
                    f.write_str("NOT ")?;
                    if let [only] = node.children.as_slice() {
                        return write_operand(f, only);
                    }
                    f.write_str("(")?;
                    write_children(f, node)?;
                    return f.write_str(")");
                }
                write_children(f, node)
            }
        }
    }
}

fn write_children(f: &mut fmt::Formatter<'_>, node: &BooleanNode) -> fmt::Result {
    for (i, child) in node.children.iter().enumerate() {
        if i > 0 {
            write!(f, " {} ", node.op.as_str())?;
        }
        write_operand(f, child)?;
    }
    Ok(())
}

fn write_operand(f: &mut fmt::Formatter<'_>, child: &Node) -> fmt::Result {
    if child.is_compound() {
        write!(f, "({})", child)
    } else {
        write!(f, "{}", child)
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    if is_bare_word(value) {
        return f.write_str(value);
    }
    f.write_str("\"")?;
    for c in value.chars() {
        if c == '"' || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{}", c)?;
    }
    f.write_str("\"")
}

/// Whether `value` re-lexes as the same single bare word
fn is_bare_word(value: &str) -> bool {
    !value.is_empty()
        && !matches!(value, "AND" | "OR" | "NOT")
        && !value.starts_with('/')
        && value
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, '"' | '(' | ')' | ':' | '\\'))
}
