//! Validity checks: left-hand-side-only nodes that turn a boolean
//! expression into a raised error after the kernel completes.
//!
//! A check is constructed per call, consumed exactly once as an assignment
//! destination, and resolved eagerly: unlike ordinary matrix writes, which
//! stay lazy until some later reader waits on them, a check blocks on the
//! launch immediately so the error surfaces at the call site.
//!
//! A `Check` is not an `Expr` and cannot be converted into one, so using a
//! check as a right-hand-side operand is rejected by the type system.

use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::codegen::{wgsl, Emitter, KernelParts};
use crate::context::Context;
use crate::error::Error;
use crate::graph::expr::Expr;

/// A validity check over a kernel expression.
///
/// The device-side state is a 3-word status buffer `[failed, row, col]`
/// plus a 1-element value buffer, both zero-initialized here. At most one
/// work-item wins the atomic 0 -> 1 claim on the flag, so exactly one
/// failing element's location and value are recorded even under massively
/// parallel writers.
pub struct Check {
    function: String,
    err_variable: String,
    must_be: String,
    pub(crate) arg: Expr,
    status: Arc<wgpu::Buffer>,
    value: Arc<wgpu::Buffer>,
}

/// Construct a check on a kernel expression. When the check is assigned a
/// boolean expression, the assignment raises [`Error::Validation`] if any
/// element of the result is false.
///
/// `function`, `err_variable` and `must_be` are retained only for the
/// error message; they never participate in the computation.
pub fn check(
    ctx: &Arc<Context>,
    function: &str,
    err_variable: &str,
    arg: &Expr,
    must_be: &str,
) -> Check {
    let status = Arc::new(
        ctx.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("riptide_check_status"),
                contents: bytemuck::cast_slice(&[0u32; 3]),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            }),
    );
    let value = Arc::new(
        ctx.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("riptide_check_value"),
                contents: bytemuck::cast_slice(&[0.0f32]),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            }),
    );
    Check {
        function: function.to_string(),
        err_variable: err_variable.to_string(),
        must_be: must_be.to_string(),
        arg: arg.clone(),
        status,
        value,
    }
}

impl Check {
    /// Requires the checked expression's shape to exactly equal the
    /// assignment's launch shape.
    pub(crate) fn check_assign_dimensions(&self, rows: usize, cols: usize) -> Result<(), Error> {
        let shape = self.arg.arena.borrow().shape(self.arg.id);
        let (arg_rows, arg_cols) = match shape {
            Some(shape) => shape,
            // Literal-only argument broadcasts to any launch shape.
            None => return Ok(()),
        };
        if arg_rows != rows {
            return Err(Error::SizeMismatch {
                function: self.function.clone(),
                lhs_role: "rows of argument".to_string(),
                lhs: arg_rows,
                rhs_role: "rows of expression".to_string(),
                rhs: rows,
            });
        }
        if arg_cols != cols {
            return Err(Error::SizeMismatch {
                function: self.function.clone(),
                lhs_role: "columns of argument".to_string(),
                lhs: arg_cols,
                rhs_role: "columns of expression".to_string(),
                rhs: cols,
            });
        }
        Ok(())
    }

    /// Emit this check's left-hand-side code: the checked expression (via
    /// the shared generated set, so it fuses with the boolean source), the
    /// status/value buffer arguments, and the claim-and-record epilogue.
    /// `cond` is the generated variable holding the assigned boolean.
    pub(crate) fn emit_lhs(&self, emitter: &mut Emitter<'_>, cond: &str) -> KernelParts {
        let mut parts = emitter.emit(self.arg.id);
        let arg_var = emitter.var(self.arg.id);
        let name = emitter.fresh();
        let flag_slot = emitter.next_binding();
        let value_slot = emitter.next_binding();
        parts.args.push_str(&format!(
            "@group(0) @binding({}) var<storage, read_write> {}_flag: array<atomic<u32>>;\n",
            flag_slot, name
        ));
        parts.args.push_str(&format!(
            "@group(0) @binding({}) var<storage, read_write> {}_value: array<f32>;\n",
            value_slot, name
        ));
        parts
            .reduction
            .push_str(&wgsl::check_fragment(&name, cond, &arg_var));
        parts
    }

    pub(crate) fn buffers(&self) -> (Arc<wgpu::Buffer>, Arc<wgpu::Buffer>) {
        (self.status.clone(), self.value.clone())
    }

    /// Wait on the launch and raise if the check failed. Eager by design:
    /// this runs inside the assignment that produced the check, not at
    /// some later read.
    pub(crate) fn resolve(
        &self,
        ctx: &Context,
        submission: Option<&wgpu::SubmissionIndex>,
    ) -> Result<(), Error> {
        if let Some(index) = submission {
            ctx.wait(index);
        }
        let status = ctx.read_back(&self.status, 12);
        let status: &[u32] = bytemuck::cast_slice(&status);
        if status[0] == 0 {
            return Ok(());
        }
        let value = ctx.read_back(&self.value, 4);
        let value: &[f32] = bytemuck::cast_slice(&value);
        Err(Error::Validation {
            function: self.function.clone(),
            variable: self.err_variable.clone(),
            row: status[1],
            col: status[2],
            value: value[0],
            must_be: self.must_be.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::expr::Graph;
    use crate::matrix::Matrix;

    #[test]
    fn test_check_assign_dimensions_match() {
        let ctx = match Context::try_new() {
            Some(ctx) => ctx,
            None => {
                eprintln!("No GPU available, skipping test");
                return;
            }
        };
        let m = Matrix::from_host(&ctx, 3, 2, &[0.0; 6]).unwrap();
        let g = Graph::new();
        let y = g.input(&m);
        let chk = check(&ctx, "test_fn", "y", &y, "finite");
        assert!(chk.check_assign_dimensions(3, 2).is_ok());
    }

    #[test]
    fn test_check_assign_dimensions_mismatch() {
        let ctx = match Context::try_new() {
            Some(ctx) => ctx,
            None => {
                eprintln!("No GPU available, skipping test");
                return;
            }
        };
        let m = Matrix::from_host(&ctx, 3, 2, &[0.0; 6]).unwrap();
        let g = Graph::new();
        let y = g.input(&m);
        let chk = check(&ctx, "test_fn", "y", &y, "finite");
        let err = chk.check_assign_dimensions(4, 2).unwrap_err();
        match err {
            Error::SizeMismatch {
                function,
                lhs,
                rhs,
                lhs_role,
                ..
            } => {
                assert_eq!(function, "test_fn");
                assert_eq!(lhs_role, "rows of argument");
                assert_eq!(lhs, 3);
                assert_eq!(rhs, 4);
            }
            other => panic!("expected SizeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_unlaunched_check_resolves_clean() {
        let ctx = match Context::try_new() {
            Some(ctx) => ctx,
            None => {
                eprintln!("No GPU available, skipping test");
                return;
            }
        };
        let g = Graph::new();
        let e = g.lit(1.0);
        let chk = check(&ctx, "test_fn", "x", &e, "positive");
        // Status buffer is zero-initialized at construction.
        assert!(chk.resolve(&ctx, None).is_ok());
    }
}
