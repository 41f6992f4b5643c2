//! User-facing expression handles: builder, operator overloads, and the
//! fixed function vocabulary.
//!
//! A `Graph` owns the arena; every `Expr` is a `(graph, node)` handle.
//! Cloning an `Expr` shares the node, which is what makes a sub-expression
//! "the same object reachable twice" for deduplication purposes.

use std::cell::RefCell;
use std::ops;
use std::rc::Rc;

use super::{Arena, BinaryOp, Node, NodeId, ReduceOp, ScalarKind, UnaryOp};
use crate::matrix::Matrix;

/// Expression builder. All expressions fused into one assignment must come
/// from the same graph.
#[derive(Clone, Default)]
pub struct Graph {
    arena: Rc<RefCell<Arena>>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    /// A scalar literal, broadcast over the launch shape.
    ///
    /// Panics on non-finite values: `NaN` and infinities have no literal
    /// spelling in the kernel language.
    pub fn lit(&self, value: f32) -> Expr {
        assert!(value.is_finite(), "kernel literals must be finite, got {}", value);
        let id = self.arena.borrow_mut().push(Node::Literal(value));
        Expr {
            arena: self.arena.clone(),
            id,
        }
    }

    /// A reference to a device matrix.
    pub fn input(&self, matrix: &Matrix) -> Expr {
        let id = self.arena.borrow_mut().push(Node::Input(matrix.clone()));
        Expr {
            arena: self.arena.clone(),
            id,
        }
    }

    pub(crate) fn arena(&self) -> Rc<RefCell<Arena>> {
        self.arena.clone()
    }
}

/// A handle to one node of a [`Graph`]. Elementwise arithmetic composes
/// through `std::ops`; transcendental functions and predicates are methods.
#[derive(Clone)]
pub struct Expr {
    pub(crate) arena: Rc<RefCell<Arena>>,
    pub(crate) id: NodeId,
}

impl Expr {
    fn kind(&self) -> ScalarKind {
        self.arena.borrow().kind(self.id)
    }

    fn unary(&self, op: UnaryOp) -> Expr {
        let id = self.arena.borrow_mut().push(Node::Unary { op, arg: self.id });
        Expr {
            arena: self.arena.clone(),
            id,
        }
    }

    fn binary(&self, op: BinaryOp, rhs: &Expr) -> Expr {
        assert!(
            Rc::ptr_eq(&self.arena, &rhs.arena),
            "expressions from different graphs cannot be combined"
        );
        let id = self.arena.borrow_mut().push(Node::Binary {
            op,
            lhs: self.id,
            rhs: rhs.id,
        });
        Expr {
            arena: self.arena.clone(),
            id,
        }
    }

    fn arith(&self, op: BinaryOp, rhs: &Expr) -> Expr {
        assert!(
            self.kind() == ScalarKind::F32 && rhs.kind() == ScalarKind::F32,
            "arithmetic requires f32 operands"
        );
        self.binary(op, rhs)
    }

    fn compare(&self, op: BinaryOp, rhs: &Expr) -> Expr {
        assert!(
            self.kind() == ScalarKind::F32 && rhs.kind() == ScalarKind::F32,
            "comparison requires f32 operands"
        );
        self.binary(op, rhs)
    }

    /// A literal in the same graph as `self`, for scalar operands.
    fn lit(&self, value: f32) -> Expr {
        assert!(value.is_finite(), "kernel literals must be finite, got {}", value);
        let id = self.arena.borrow_mut().push(Node::Literal(value));
        Expr {
            arena: self.arena.clone(),
            id,
        }
    }

    // ── Transcendental / elementwise functions ──

    pub fn log(&self) -> Expr {
        self.unary(UnaryOp::Log)
    }

    pub fn log1p(&self) -> Expr {
        self.unary(UnaryOp::Log1p)
    }

    pub fn exp(&self) -> Expr {
        self.unary(UnaryOp::Exp)
    }

    pub fn atan(&self) -> Expr {
        self.unary(UnaryOp::Atan)
    }

    pub fn sqrt(&self) -> Expr {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn square(&self) -> Expr {
        self.unary(UnaryOp::Square)
    }

    pub fn abs(&self) -> Expr {
        self.unary(UnaryOp::Abs)
    }

    // ── Predicates ──

    pub fn is_nan(&self) -> Expr {
        self.unary(UnaryOp::IsNan)
    }

    pub fn is_finite(&self) -> Expr {
        self.unary(UnaryOp::IsFinite)
    }

    // ── Comparisons ──

    pub fn lt(&self, rhs: &Expr) -> Expr {
        self.compare(BinaryOp::Lt, rhs)
    }

    pub fn le(&self, rhs: &Expr) -> Expr {
        self.compare(BinaryOp::Le, rhs)
    }

    pub fn gt(&self, rhs: &Expr) -> Expr {
        self.compare(BinaryOp::Gt, rhs)
    }

    pub fn ge(&self, rhs: &Expr) -> Expr {
        self.compare(BinaryOp::Ge, rhs)
    }

    pub fn elt_eq(&self, rhs: &Expr) -> Expr {
        self.compare(BinaryOp::EltEq, rhs)
    }

    // ── Boolean combinators ──

    pub fn and(self, rhs: &Expr) -> Expr {
        assert!(
            self.kind() == ScalarKind::Bool && rhs.kind() == ScalarKind::Bool,
            "&& requires boolean operands"
        );
        self.binary(BinaryOp::And, rhs)
    }

    pub fn or(self, rhs: &Expr) -> Expr {
        assert!(
            self.kind() == ScalarKind::Bool && rhs.kind() == ScalarKind::Bool,
            "|| requires boolean operands"
        );
        self.binary(BinaryOp::Or, rhs)
    }

    // ── Reductions ──

    /// Sum over rows, producing a `1 x cols` result. Reductions are only
    /// valid as the root of an assignment source, which is why this returns
    /// a [`Reduction`] instead of an `Expr`.
    pub fn colwise_sum(&self) -> Reduction {
        assert!(
            self.kind() == ScalarKind::F32,
            "colwise_sum requires an f32 operand"
        );
        let id = self.arena.borrow_mut().push(Node::Reduction {
            op: ReduceOp::ColwiseSum,
            arg: self.id,
        });
        Reduction {
            arena: self.arena.clone(),
            id,
        }
    }
}

/// A reduction over an expression. Not an `Expr`: it cannot appear inside
/// elementwise operators, only as an assignment source.
#[derive(Clone)]
pub struct Reduction {
    pub(crate) arena: Rc<RefCell<Arena>>,
    pub(crate) id: NodeId,
}

// ── Operator overloads ─────────────────────────────────────────────

impl ops::Neg for &Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        assert!(self.kind() == ScalarKind::F32, "negation requires an f32 operand");
        self.unary(UnaryOp::Neg)
    }
}

impl ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        -&self
    }
}

impl ops::Not for &Expr {
    type Output = Expr;
    fn not(self) -> Expr {
        assert!(self.kind() == ScalarKind::Bool, "! requires a boolean operand");
        self.unary(UnaryOp::Not)
    }
}

impl ops::Not for Expr {
    type Output = Expr;
    fn not(self) -> Expr {
        !&self
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl ops::$trait<&Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                self.arith($op, rhs)
            }
        }

        impl ops::$trait<Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                (&self).$method(&rhs)
            }
        }

        impl ops::$trait<&Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                (&self).$method(rhs)
            }
        }

        impl ops::$trait<Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                self.$method(&rhs)
            }
        }

        impl ops::$trait<f32> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: f32) -> Expr {
                let rhs = self.lit(rhs);
                self.$method(&rhs)
            }
        }

        impl ops::$trait<f32> for Expr {
            type Output = Expr;
            fn $method(self, rhs: f32) -> Expr {
                (&self).$method(rhs)
            }
        }

        impl ops::$trait<&Expr> for f32 {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                let lhs = rhs.lit(self);
                (&lhs).$method(rhs)
            }
        }

        impl ops::$trait<Expr> for f32 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                self.$method(&rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, BinaryOp::Add);
impl_binary_op!(Sub, sub, BinaryOp::Sub);
impl_binary_op!(Mul, mul, BinaryOp::Mul);
impl_binary_op!(Div, div, BinaryOp::Div);
