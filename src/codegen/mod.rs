//! Kernel code emission: one depth-first pass over the fused graphs of an
//! assignment produces the kernel source, a parallel pass produces the
//! argument bindings.
//!
//! Emission is idempotent under a shared `generated` set: the first visit
//! of a node allocates its variable name and appends its fragments, any
//! later visit (the same node reached through another handle or another
//! destination's graph) contributes nothing. Child order is fixed
//! left-to-right depth-first and never reordered, so binding numbers
//! always match declaration order between the two passes.

pub(crate) mod wgsl;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::graph::expr::Expr;
use crate::graph::{Arena, BinaryOp, Node, NodeId, ReduceOp, UnaryOp};

/// Produces unique per-kernel variable identifiers for one emission pass.
pub(crate) struct NameGenerator {
    next: u32,
}

impl NameGenerator {
    pub(crate) fn new() -> NameGenerator {
        NameGenerator { next: 0 }
    }

    pub(crate) fn generate(&mut self) -> String {
        let name = format!("var{}", self.next);
        self.next += 1;
        name
    }
}

/// The four string fragments of a kernel, merged bottom-up while walking
/// the graph and concatenated in a fixed order by [`wgsl::kernel_source`].
#[derive(Clone, Debug, Default)]
pub struct KernelParts {
    /// `@group(0) @binding(n)` declarations.
    pub args: String,
    /// Kernel-scope helper functions.
    pub setup: String,
    /// Per-work-item statements.
    pub body: String,
    /// Write-back / reduction / check epilogue statements.
    pub reduction: String,
}

impl KernelParts {
    pub fn append(&mut self, other: KernelParts) {
        self.args.push_str(&other.args);
        self.setup.push_str(&other.setup);
        self.body.push_str(&other.body);
        self.reduction.push_str(&other.reduction);
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
            && self.setup.is_empty()
            && self.body.is_empty()
            && self.reduction.is_empty()
    }
}

fn fmt_f32(value: f32) -> String {
    debug_assert!(value.is_finite(), "kernel literals must be finite");
    format!("{:?}", value)
}

/// Per-assignment code-generation state. The arena stays immutable; all
/// mutable bookkeeping (generated set, name side-table, binding cursor)
/// lives here and is discarded once the kernel is built.
pub(crate) struct Emitter<'a> {
    arena: &'a Arena,
    generated: HashSet<NodeId>,
    names: HashMap<NodeId, String>,
    name_gen: NameGenerator,
    /// Next `@binding` slot; 0 is reserved for the `Dims` uniform.
    next_binding: u32,
    helpers: HashSet<&'static str>,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(arena: &'a Arena) -> Emitter<'a> {
        Emitter {
            arena,
            generated: HashSet::new(),
            names: HashMap::new(),
            name_gen: NameGenerator::new(),
            next_binding: 1,
            helpers: HashSet::new(),
        }
    }

    /// Generated variable name of an already-emitted node.
    pub(crate) fn var(&self, id: NodeId) -> String {
        self.names[&id].clone()
    }

    /// Fresh identifier outside the node side-table (destination bindings).
    pub(crate) fn fresh(&mut self) -> String {
        self.name_gen.generate()
    }

    pub(crate) fn next_binding(&mut self) -> u32 {
        let slot = self.next_binding;
        self.next_binding += 1;
        slot
    }

    fn helper(&mut self, key: &'static str, source: &str, parts: &mut KernelParts) {
        if self.helpers.insert(key) {
            parts.setup.push_str(source);
        }
    }

    /// Emit code for `id` and everything below it. A node already in the
    /// generated set contributes nothing: structural sharing collapses to
    /// a single kernel variable.
    pub(crate) fn emit(&mut self, id: NodeId) -> KernelParts {
        if self.generated.contains(&id) {
            return KernelParts::default();
        }
        self.generated.insert(id);

        let mut parts = KernelParts::default();
        match self.arena.node(id) {
            Node::Literal(value) => {
                let name = self.name_gen.generate();
                parts
                    .body
                    .push_str(&format!("    let {} = {};\n", name, fmt_f32(*value)));
                self.names.insert(id, name);
            }
            Node::Input(_) => {
                let name = self.name_gen.generate();
                let slot = self.next_binding();
                parts.args.push_str(&format!(
                    "@group(0) @binding({}) var<storage, read> {}_data: array<f32>;\n",
                    slot, name
                ));
                parts
                    .body
                    .push_str(&format!("    let {} = {}_data[idx];\n", name, name));
                self.names.insert(id, name);
            }
            Node::Unary { op, arg } => {
                let (op, arg) = (*op, *arg);
                parts = self.emit(arg);
                let a = self.var(arg);
                let name = self.name_gen.generate();
                let line = match op {
                    UnaryOp::Neg => format!("    let {} = -({});\n", name, a),
                    UnaryOp::Not => format!("    let {} = !({});\n", name, a),
                    UnaryOp::Log => format!("    let {} = log({});\n", name, a),
                    UnaryOp::Log1p => {
                        self.helper("log1p_f32", wgsl::LOG1P_F32, &mut parts);
                        format!("    let {} = log1p_f32({});\n", name, a)
                    }
                    UnaryOp::Exp => format!("    let {} = exp({});\n", name, a),
                    UnaryOp::Atan => format!("    let {} = atan({});\n", name, a),
                    UnaryOp::Sqrt => format!("    let {} = sqrt({});\n", name, a),
                    UnaryOp::Square => format!("    let {} = ({}) * ({});\n", name, a, a),
                    UnaryOp::Abs => format!("    let {} = abs({});\n", name, a),
                    UnaryOp::IsNan => {
                        self.helper("is_nan_f32", wgsl::IS_NAN_F32, &mut parts);
                        format!("    let {} = is_nan_f32({});\n", name, a)
                    }
                    UnaryOp::IsFinite => {
                        self.helper("is_finite_f32", wgsl::IS_FINITE_F32, &mut parts);
                        format!("    let {} = is_finite_f32({});\n", name, a)
                    }
                };
                parts.body.push_str(&line);
                self.names.insert(id, name);
            }
            Node::Binary { op, lhs, rhs } => {
                let (op, lhs, rhs) = (*op, *lhs, *rhs);
                parts = self.emit(lhs);
                parts.append(self.emit(rhs));
                let a = self.var(lhs);
                let b = self.var(rhs);
                let name = self.name_gen.generate();
                let infix = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Lt => "<",
                    BinaryOp::Le => "<=",
                    BinaryOp::Gt => ">",
                    BinaryOp::Ge => ">=",
                    BinaryOp::EltEq => "==",
                    BinaryOp::And => "&&",
                    BinaryOp::Or => "||",
                };
                parts.body.push_str(&format!(
                    "    let {} = ({}) {} ({});\n",
                    name, a, infix, b
                ));
                self.names.insert(id, name);
            }
            Node::Reduction {
                op: ReduceOp::ColwiseSum,
                arg,
            } => {
                let arg = *arg;
                parts = self.emit(arg);
                // The reduction epilogue is owned by the assignment's
                // write-back; the node's value is its operand's element.
                let alias = self.var(arg);
                self.names.insert(id, alias);
            }
        }
        parts
    }
}

/// Argument-binding pass: the same depth-first walk as [`Emitter::emit`],
/// collecting buffer resources instead of code. Shares the emit pass's
/// dedup discipline through its own generated set, so the collected order
/// matches declaration order exactly.
pub(crate) struct Binder {
    bound: HashSet<NodeId>,
}

impl Binder {
    pub(crate) fn new() -> Binder {
        Binder {
            bound: HashSet::new(),
        }
    }

    pub(crate) fn bind(&mut self, arena: &Arena, id: NodeId, out: &mut Vec<Arc<wgpu::Buffer>>) {
        if !self.bound.insert(id) {
            return;
        }
        match arena.node(id) {
            Node::Literal(_) => {}
            Node::Input(matrix) => out.push(matrix.buffer()),
            Node::Unary { arg, .. } => self.bind(arena, *arg, out),
            Node::Binary { lhs, rhs, .. } => {
                self.bind(arena, *lhs, out);
                self.bind(arena, *rhs, out);
            }
            Node::Reduction { arg, .. } => self.bind(arena, *arg, out),
        }
    }
}

/// Render the fused kernel source for a set of expressions without
/// assigning them anywhere. Debug/inspection surface; write-backs are
/// omitted. An empty slice renders the bare kernel frame.
pub fn fused_preview(exprs: &[&Expr]) -> String {
    let Some(first) = exprs.first() else {
        return wgsl::kernel_source(&KernelParts::default());
    };
    for expr in exprs {
        assert!(
            std::rc::Rc::ptr_eq(&first.arena, &expr.arena),
            "expressions from different graphs cannot be fused"
        );
    }
    let arena = first.arena.borrow();
    let mut emitter = Emitter::new(&arena);
    let mut parts = KernelParts::default();
    for expr in exprs {
        parts.append(emitter.emit(expr.id));
    }
    wgsl::kernel_source(&parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::expr::Graph;

    #[test]
    fn test_name_generator_unique() {
        let mut gen = NameGenerator::new();
        assert_eq!(gen.generate(), "var0");
        assert_eq!(gen.generate(), "var1");
        assert_eq!(gen.generate(), "var2");
    }

    #[test]
    fn test_shared_subexpression_emitted_once() {
        let g = Graph::new();
        let shared = g.lit(2.0).log();
        let a = &shared + 1.0;
        let b = &shared * 3.0;
        let source = fused_preview(&[&a, &b]);
        assert_eq!(source.matches("log(").count(), 1);
    }

    #[test]
    fn test_emit_is_idempotent() {
        let g = Graph::new();
        let e = (g.lit(1.0) + g.lit(2.0)).exp();
        let arena = g.arena();
        let arena = arena.borrow();
        let mut emitter = Emitter::new(&arena);
        let first = emitter.emit(e.id);
        assert!(!first.is_empty());
        let second = emitter.emit(e.id);
        assert!(second.is_empty());
    }

    #[test]
    fn test_clone_dedupes_but_equal_literals_do_not() {
        let g = Graph::new();
        // Two distinct literal nodes with the same value stay distinct:
        // dedup is by node identity, not structural equality.
        let x = g.lit(7.0);
        let y = g.lit(7.0);
        let source = fused_preview(&[&(&x + &y)]);
        assert_eq!(source.matches("= 7.0;").count(), 2);

        let shared = g.lit(9.0);
        let source = fused_preview(&[&(&shared + &shared)]);
        assert_eq!(source.matches("= 9.0;").count(), 1);
    }

    #[test]
    fn test_helper_emitted_once() {
        let g = Graph::new();
        let a = g.lit(1.0).is_nan();
        let b = g.lit(2.0).is_nan();
        let source = fused_preview(&[&a.clone().or(&b)]);
        assert_eq!(source.matches("fn is_nan_f32").count(), 1);
        assert_eq!(source.matches("is_nan_f32(").count(), 3);
    }

    #[test]
    fn test_empty_preview_is_bare_frame() {
        let source = fused_preview(&[]);
        assert!(source.contains("@compute"));
        // Only the dims uniform is declared.
        assert_eq!(source.matches("@binding").count(), 1);
    }

    #[test]
    fn test_fragment_order_fixed() {
        let parts = KernelParts {
            args: "// ARGS\n".to_string(),
            setup: "// SETUP\n".to_string(),
            body: "// BODY\n".to_string(),
            reduction: "// REDUCTION\n".to_string(),
        };
        let source = wgsl::kernel_source(&parts);
        let args = source.find("// ARGS").unwrap();
        let setup = source.find("// SETUP").unwrap();
        let body = source.find("// BODY").unwrap();
        let reduction = source.find("// REDUCTION").unwrap();
        assert!(args < setup && setup < body && body < reduction);
        let guard = source.find("if (row >= dims.rows").unwrap();
        assert!(setup < guard && guard < body);
    }

    #[test]
    fn test_binary_child_order_left_to_right() {
        let g = Graph::new();
        let a = g.lit(1.0);
        let b = g.lit(2.0);
        let source = fused_preview(&[&(&a - &b)]);
        let first = source.find("= 1.0;").unwrap();
        let second = source.find("= 2.0;").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_literal_formatting_keeps_decimal_point() {
        assert_eq!(fmt_f32(3.0), "3.0");
        assert_eq!(fmt_f32(0.5), "0.5");
        assert_eq!(fmt_f32(-1.25), "-1.25");
    }
}
