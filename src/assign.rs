//! Fused assignment protocol: N destinations paired with N expression
//! graphs, one generated kernel.
//!
//! All sources are walked once with a single shared generated set, so a
//! sub-expression referenced by several destinations appears exactly once
//! in the kernel. Arguments are bound in the same depth-first order used
//! for emission. After the launch, the submission index is attached to
//! every written matrix (lazy) and every check is resolved immediately
//! (eager).

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::check::Check;
use crate::codegen::{wgsl, Binder, Emitter, KernelParts};
use crate::context::Context;
use crate::error::Error;
use crate::graph::expr::{Expr, Reduction};
use crate::graph::{Arena, NodeId, ScalarKind};
use crate::matrix::Matrix;

/// Uniform params struct matching the WGSL `Dims` layout.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuDims {
    rows: u32,
    cols: u32,
    _pad0: u32,
    _pad1: u32,
}

enum Source {
    /// Per-element expression; the write-back stores one element per
    /// work-item.
    Elementwise(NodeId),
    /// Column reduction; the write-back accumulates into a `1 x cols`
    /// destination.
    Colwise(NodeId),
    /// Conditionally absent: contributes no code and no bindings, the
    /// destination is left untouched.
    Absent,
}

enum Target {
    Matrix(Matrix),
    Check(Check),
}

struct Slot {
    target: Target,
    source: Source,
    arena: Option<Rc<RefCell<Arena>>>,
}

/// An assignment source: either an elementwise expression or a reduction.
pub trait AssignSource {
    #[doc(hidden)]
    fn as_source(&self) -> (Rc<RefCell<Arena>>, Source);
}

impl AssignSource for Expr {
    fn as_source(&self) -> (Rc<RefCell<Arena>>, Source) {
        (self.arena.clone(), Source::Elementwise(self.id))
    }
}

impl AssignSource for Reduction {
    fn as_source(&self) -> (Rc<RefCell<Arena>>, Source) {
        (self.arena.clone(), Source::Colwise(self.id))
    }
}

/// Builder for one fused assignment.
///
/// ```ignore
/// Assign::new(&ctx)
///     .check(check_y_not_nan, &y_not_nan)
///     .output(&cdf_log, &pn.log().colwise_sum())
///     .output_if(need_y_deriv, &y_deriv, &rep_deriv)
///     .run()?;
/// ```
pub struct Assign {
    ctx: Arc<Context>,
    slots: Vec<Slot>,
}

impl Assign {
    pub fn new(ctx: &Arc<Context>) -> Assign {
        Assign {
            ctx: ctx.clone(),
            slots: Vec::new(),
        }
    }

    /// Pair a matrix destination with a source expression. The matrix is
    /// resized to the source's result shape if it differs.
    pub fn output(mut self, dest: &Matrix, source: &impl AssignSource) -> Assign {
        let (arena, source) = source.as_source();
        if let Source::Elementwise(id) = source {
            assert!(
                arena.borrow().kind(id) == ScalarKind::F32,
                "a matrix destination requires an f32 expression"
            );
        }
        self.slots.push(Slot {
            target: Target::Matrix(dest.clone()),
            source,
            arena: Some(arena),
        });
        self
    }

    /// Like [`output`](Assign::output), but the source is conditionally
    /// absent: when `enabled` is false nothing is computed and the
    /// destination keeps its previous contents.
    pub fn output_if(self, enabled: bool, dest: &Matrix, source: &impl AssignSource) -> Assign {
        if enabled {
            return self.output(dest, source);
        }
        let mut this = self;
        this.slots.push(Slot {
            target: Target::Matrix(dest.clone()),
            source: Source::Absent,
            arena: None,
        });
        this
    }

    /// Pair a validity check with the boolean expression it asserts. The
    /// check is consumed: it is a single-use destination.
    pub fn check(mut self, check: Check, cond: &Expr) -> Assign {
        assert!(
            cond.arena.borrow().kind(cond.id) == ScalarKind::Bool,
            "a check destination requires a boolean expression"
        );
        assert!(
            Rc::ptr_eq(&cond.arena, &check.arg.arena),
            "expressions from different graphs cannot be fused"
        );
        self.slots.push(Slot {
            target: Target::Check(check),
            source: Source::Elementwise(cond.id),
            arena: Some(cond.arena.clone()),
        });
        self
    }

    /// Build, launch, and synchronize the fused kernel.
    pub fn run(self) -> Result<(), Error> {
        let present: Vec<usize> = (0..self.slots.len())
            .filter(|&i| !matches!(self.slots[i].source, Source::Absent))
            .collect();
        if present.is_empty() {
            return Ok(());
        }

        let arena_rc = self.slots[present[0]]
            .arena
            .clone()
            .expect("present slot has an arena");
        for &i in &present {
            let arena = self.slots[i].arena.as_ref().expect("present slot has an arena");
            assert!(
                Rc::ptr_eq(&arena_rc, arena),
                "expressions from different graphs cannot be fused"
            );
        }
        let arena = arena_rc.borrow();

        let (rows, cols) = self.launch_shape(&arena, &present)?;

        // Shape contracts first: nothing is resized and nothing launches
        // if any pair of dimensions disagrees.
        for &i in &present {
            if let Target::Check(check) = &self.slots[i].target {
                check.check_assign_dimensions(rows, cols)?;
            }
        }
        for &i in &present {
            if let (Target::Matrix(m), source) = (&self.slots[i].target, &self.slots[i].source) {
                match source {
                    Source::Elementwise(_) => m.resize(rows, cols),
                    Source::Colwise(_) => {
                        m.resize(1, cols);
                        // The kernel accumulates; start from zero.
                        m.zero_fill();
                    }
                    Source::Absent => unreachable!(),
                }
            }
        }

        // Emission pass: one generated set across all destinations.
        let mut emitter = Emitter::new(&arena);
        let mut parts = KernelParts::default();
        for &i in &present {
            let slot = &self.slots[i];
            match (&slot.target, &slot.source) {
                (Target::Matrix(_), Source::Elementwise(id)) => {
                    parts.append(emitter.emit(*id));
                    let src = emitter.var(*id);
                    let name = emitter.fresh();
                    let binding = emitter.next_binding();
                    parts.args.push_str(&format!(
                        "@group(0) @binding({}) var<storage, read_write> {}_out: array<f32>;\n",
                        binding, name
                    ));
                    parts
                        .reduction
                        .push_str(&format!("    {}_out[idx] = {};\n", name, src));
                }
                (Target::Matrix(_), Source::Colwise(id)) => {
                    parts.append(emitter.emit(*id));
                    let src = emitter.var(*id);
                    let name = emitter.fresh();
                    let binding = emitter.next_binding();
                    parts.args.push_str(&format!(
                        "@group(0) @binding({}) var<storage, read_write> {}_out: array<atomic<u32>>;\n",
                        binding, name
                    ));
                    let out = format!("{}_out", name);
                    parts
                        .reduction
                        .push_str(&wgsl::colwise_add_fragment(&out, &src));
                }
                (Target::Check(check), Source::Elementwise(id)) => {
                    parts.append(emitter.emit(*id));
                    let cond = emitter.var(*id);
                    parts.append(check.emit_lhs(&mut emitter, &cond));
                }
                _ => unreachable!(),
            }
        }

        // Binding pass: identical walk order, collecting resources.
        let mut binder = Binder::new();
        let mut resources: Vec<Arc<wgpu::Buffer>> = Vec::new();
        for &i in &present {
            let slot = &self.slots[i];
            match (&slot.target, &slot.source) {
                (Target::Matrix(m), Source::Elementwise(id))
                | (Target::Matrix(m), Source::Colwise(id)) => {
                    binder.bind(&arena, *id, &mut resources);
                    resources.push(m.buffer());
                }
                (Target::Check(check), Source::Elementwise(id)) => {
                    binder.bind(&arena, *id, &mut resources);
                    binder.bind(&arena, check.arg.id, &mut resources);
                    let (status, value) = check.buffers();
                    resources.push(status);
                    resources.push(value);
                }
                _ => unreachable!(),
            }
        }

        let source = wgsl::kernel_source(&parts);
        drop(arena);

        let submission = if rows == 0 || cols == 0 {
            // Nothing to compute; destinations already have their final
            // (resized, zeroed) state.
            None
        } else {
            Some(self.launch(&source, &resources, rows, cols))
        };

        // Lazy destinations first: sibling writes stay valid even when a
        // check in the same assignment fails.
        if let Some(index) = &submission {
            for slot in &self.slots {
                if matches!(slot.source, Source::Absent) {
                    continue;
                }
                if let Target::Matrix(m) = &slot.target {
                    m.set_write_event(index.clone());
                }
            }
        }
        // Checks resolve eagerly, in the order they were added; the first
        // failure is reported and later checks are not inspected.
        for slot in &self.slots {
            if let Target::Check(check) = &slot.target {
                check.resolve(&self.ctx, submission.as_ref())?;
            }
        }
        Ok(())
    }

    /// Determine the common launch shape from all present sources.
    fn launch_shape(&self, arena: &Arena, present: &[usize]) -> Result<(usize, usize), Error> {
        let mut shapes = Vec::new();
        for &i in present {
            match &self.slots[i].source {
                Source::Elementwise(id) | Source::Colwise(id) => {
                    arena.collect_input_shapes(*id, &mut shapes)
                }
                Source::Absent => unreachable!(),
            }
        }
        if shapes.is_empty() {
            // Literal-only sources: fall back to the checked arguments.
            for &i in present {
                if let Target::Check(check) = &self.slots[i].target {
                    arena.collect_input_shapes(check.arg.id, &mut shapes);
                }
            }
        }
        let (rows, cols) = match shapes.first() {
            Some(&shape) => shape,
            None => {
                return Err(Error::ShapeUnknown {
                    function: "assign".to_string(),
                })
            }
        };
        for &(r, c) in &shapes[1..] {
            if r != rows {
                return Err(Error::SizeMismatch {
                    function: "assign".to_string(),
                    lhs_role: "rows of operand".to_string(),
                    lhs: r,
                    rhs_role: "rows of expression".to_string(),
                    rhs: rows,
                });
            }
            if c != cols {
                return Err(Error::SizeMismatch {
                    function: "assign".to_string(),
                    lhs_role: "columns of operand".to_string(),
                    lhs: c,
                    rhs_role: "columns of expression".to_string(),
                    rhs: cols,
                });
            }
        }
        Ok((rows, cols))
    }

    fn launch(
        &self,
        source: &str,
        resources: &[Arc<wgpu::Buffer>],
        rows: usize,
        cols: usize,
    ) -> wgpu::SubmissionIndex {
        let pipeline = self.ctx.get_or_compile(source);

        let dims = GpuDims {
            rows: rows as u32,
            cols: cols as u32,
            _pad0: 0,
            _pad1: 0,
        };
        let dims_buf = self
            .ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("riptide_dims"),
                contents: bytemuck::bytes_of(&dims),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: dims_buf.as_entire_binding(),
        }];
        for (i, buffer) in resources.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: (i + 1) as u32,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group_layout = pipeline.get_bind_group_layout(0);
        let bind_group = self
            .ctx
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("riptide_bind_group"),
                layout: &bind_group_layout,
                entries: &entries,
            });

        let wg = wgsl::WORKGROUP_DIM;
        let groups_x = (rows as u32 + wg - 1) / wg;
        let groups_y = (cols as u32 + wg - 1) / wg;

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("riptide_assign_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("riptide_assign_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        let index = self.ctx.queue.submit(std::iter::once(encoder.finish()));
        self.ctx.record_launch();
        index
    }
}
