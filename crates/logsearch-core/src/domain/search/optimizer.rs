//! Semantics-preserving query rewrites
//!
//! - Nested groups with the same operator are flattened:
//!   `AND(AND(a, b), c)` becomes `AND(a, b, c)`.
//! - Duplicate operands of a group are dropped.
//! - Operands of an AND are ordered cheapest first, so exact column
//!   matches come before full-text lookups and regex scans.

use super::query::{BoolOp, BooleanNode, Field, Node, Query};

pub fn optimize(query: &Query) -> Query {
    Query::new(optimize_node(query.root().clone()))
}

fn optimize_node(node: Node) -> Node {
    let BooleanNode {
        op,
        children,
        negated,
    } = match node {
        Node::Boolean(group) => group,
        term => return term,
    };

    let mut operands: Vec<Node> = Vec::with_capacity(children.len());
    for child in children.into_iter().map(optimize_node) {
        let flattened = match child {
            Node::Boolean(inner) if inner.op == op && !inner.negated => inner.children,
            other => vec![other],
        };
        for operand in flattened {
            if !operands.contains(&operand) {
                operands.push(operand);
            }
        }
    }

    if op == BoolOp::And {
        // Stable, so equal-cost operands keep their written order
        operands.sort_by_key(cost);
    }

    if operands.len() == 1 {
        let only = operands.remove(0);
        return if negated { only.negate() } else { only };
    }
    Node::Boolean(BooleanNode {
        op,
        children: operands,
        negated,
    })
}

/// Relative evaluation cost; lower runs earlier in an AND chain
fn cost(node: &Node) -> u8 {
    match node {
        Node::Field(term) => match term.field {
            Field::Level | Field::Service | Field::CorrelationId => 0,
            Field::Time => 1,
            Field::Message => 3,
        },
        Node::Text(_) => 2,
        Node::Boolean(_) => 4,
        Node::Regex(_) => 5,
    }
}
