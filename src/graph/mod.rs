//! Arena-based operation-node graph.
//!
//! Expressions are built into an arena of nodes addressed by stable
//! integer indices (`NodeId`). Deduplication during code generation is by
//! index identity, not structural equality: the same node reached twice
//! collapses to a single kernel variable, while two coincidentally
//! identical-looking sub-expressions stay distinct.
//!
//! The node set is closed. Each operation kind is one tagged variant,
//! dispatched in `codegen` through a single emission pass.

pub mod expr;

use crate::matrix::Matrix;

/// Stable identity of a node within one [`Graph`](expr::Graph) arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(pub(crate) usize);

/// Element type an expression evaluates to inside the kernel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScalarKind {
    F32,
    Bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    EltEq,
    And,
    Or,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnaryOp {
    Neg,
    Not,
    Log,
    Log1p,
    Exp,
    Atan,
    Sqrt,
    Square,
    Abs,
    IsNan,
    IsFinite,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReduceOp {
    ColwiseSum,
}

/// One operation node. Children are held by `NodeId` into the same arena.
pub(crate) enum Node {
    /// Scalar literal, broadcast over the launch shape.
    Literal(f32),
    /// Reference to a device matrix.
    Input(Matrix),
    Unary {
        op: UnaryOp,
        arg: NodeId,
    },
    Binary {
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Reduction {
        op: ReduceOp,
        arg: NodeId,
    },
}

/// Append-only node storage. Immutable during code generation; the
/// emission pass keeps its own side-tables.
#[derive(Default)]
pub(crate) struct Arena {
    nodes: Vec<Node>,
}

impl Arena {
    pub(crate) fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Declared result shape. `None` for shape-free (literal-only) subtrees,
    /// which broadcast over whatever shape the assignment launches with.
    pub(crate) fn shape(&self, id: NodeId) -> Option<(usize, usize)> {
        match self.node(id) {
            Node::Literal(_) => None,
            Node::Input(m) => Some(m.shape()),
            Node::Unary { arg, .. } => self.shape(*arg),
            Node::Binary { lhs, rhs, .. } => self.shape(*lhs).or_else(|| self.shape(*rhs)),
            Node::Reduction {
                op: ReduceOp::ColwiseSum,
                arg,
            } => self.shape(*arg).map(|(_, cols)| (1, cols)),
        }
    }

    /// Element type of the node's value.
    pub(crate) fn kind(&self, id: NodeId) -> ScalarKind {
        match self.node(id) {
            Node::Literal(_) | Node::Input(_) => ScalarKind::F32,
            Node::Unary { op, .. } => match op {
                UnaryOp::Not | UnaryOp::IsNan | UnaryOp::IsFinite => ScalarKind::Bool,
                _ => ScalarKind::F32,
            },
            Node::Binary { op, .. } => match op {
                BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::EltEq
                | BinaryOp::And
                | BinaryOp::Or => ScalarKind::Bool,
                _ => ScalarKind::F32,
            },
            Node::Reduction { .. } => ScalarKind::F32,
        }
    }

    /// Collect the shapes of all matrix references reachable from `id`.
    /// Reductions recurse into their operand: the operand's shape is the
    /// index space the kernel iterates, not the reduced result shape.
    pub(crate) fn collect_input_shapes(&self, id: NodeId, out: &mut Vec<(usize, usize)>) {
        match self.node(id) {
            Node::Literal(_) => {}
            Node::Input(m) => out.push(m.shape()),
            Node::Unary { arg, .. } => self.collect_input_shapes(*arg, out),
            Node::Binary { lhs, rhs, .. } => {
                self.collect_input_shapes(*lhs, out);
                self.collect_input_shapes(*rhs, out);
            }
            Node::Reduction { arg, .. } => self.collect_input_shapes(*arg, out),
        }
    }
}
