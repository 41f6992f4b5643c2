//! Device-resident matrices: column-major `f32` storage plus write-event
//! tracking.
//!
//! A `Matrix` is a cheap-clone handle to an accelerator allocation of
//! `rows x cols` elements, stored column-major (`idx = col * rows + row`).
//! Each matrix tracks the completion of the most recent kernel that wrote
//! it; any host read waits on that submission first, so writes stay lazy
//! until a reader forces synchronization.

use std::sync::{Arc, Mutex};

use wgpu::util::DeviceExt;

use crate::context::Context;
use crate::error::Error;

#[derive(Debug)]
struct MatrixState {
    buffer: Arc<wgpu::Buffer>,
    rows: usize,
    cols: usize,
    /// Most recent write submission. Overwritten on every write, so a
    /// reader always observes the latest assignment.
    write_event: Option<wgpu::SubmissionIndex>,
}

#[derive(Debug)]
struct MatrixInner {
    ctx: Arc<Context>,
    state: Mutex<MatrixState>,
}

/// A matrix stored in accelerator memory.
#[derive(Clone, Debug)]
pub struct Matrix {
    inner: Arc<MatrixInner>,
}

fn alloc(ctx: &Context, rows: usize, cols: usize) -> Arc<wgpu::Buffer> {
    // wgpu rejects zero-sized buffers; keep a one-element placeholder for
    // empty matrices so the handle always has a bindable allocation.
    let size = (rows * cols).max(1) as u64 * 4;
    Arc::new(ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("riptide_matrix"),
        size,
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    }))
}

impl Matrix {
    /// Upload a column-major slice of `rows * cols` elements.
    pub fn from_host(ctx: &Arc<Context>, rows: usize, cols: usize, data: &[f32]) -> Result<Matrix, Error> {
        if data.len() != rows * cols {
            return Err(Error::SizeMismatch {
                function: "Matrix::from_host".to_string(),
                lhs_role: "length of data".to_string(),
                lhs: data.len(),
                rhs_role: "rows * cols".to_string(),
                rhs: rows * cols,
            });
        }
        let buffer = if data.is_empty() {
            alloc(ctx, rows, cols)
        } else {
            Arc::new(
                ctx.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("riptide_matrix"),
                        contents: bytemuck::cast_slice(data),
                        usage: wgpu::BufferUsages::STORAGE
                            | wgpu::BufferUsages::COPY_DST
                            | wgpu::BufferUsages::COPY_SRC,
                    }),
            )
        };
        Ok(Matrix {
            inner: Arc::new(MatrixInner {
                ctx: ctx.clone(),
                state: Mutex::new(MatrixState {
                    buffer,
                    rows,
                    cols,
                    write_event: None,
                }),
            }),
        })
    }

    /// A 0x0 matrix. Assignments resize it to the shape of whatever
    /// expression is assigned into it.
    pub fn empty(ctx: &Arc<Context>) -> Matrix {
        Matrix {
            inner: Arc::new(MatrixInner {
                ctx: ctx.clone(),
                state: Mutex::new(MatrixState {
                    buffer: alloc(ctx, 0, 0),
                    rows: 0,
                    cols: 0,
                    write_event: None,
                }),
            }),
        }
    }

    pub fn rows(&self) -> usize {
        self.inner.state.lock().unwrap().rows
    }

    pub fn cols(&self) -> usize {
        self.inner.state.lock().unwrap().cols
    }

    pub fn shape(&self) -> (usize, usize) {
        let state = self.inner.state.lock().unwrap();
        (state.rows, state.cols)
    }

    /// Read the matrix back to the host (column-major). Blocks until the
    /// most recent write to this matrix has completed.
    pub fn to_host(&self) -> Vec<f32> {
        let (buffer, rows, cols, event) = {
            let state = self.inner.state.lock().unwrap();
            (
                state.buffer.clone(),
                state.rows,
                state.cols,
                state.write_event.clone(),
            )
        };
        if rows * cols == 0 {
            return Vec::new();
        }
        if let Some(index) = &event {
            self.inner.ctx.wait(index);
        }
        let bytes = self.inner.ctx.read_back(&buffer, (rows * cols) as u64 * 4);
        bytemuck::cast_slice(&bytes).to_vec()
    }

    pub(crate) fn buffer(&self) -> Arc<wgpu::Buffer> {
        self.inner.state.lock().unwrap().buffer.clone()
    }

    /// Reallocate storage for a new shape. Previous contents are discarded;
    /// callers only resize destinations that are about to be overwritten.
    pub(crate) fn resize(&self, rows: usize, cols: usize) {
        let mut state = self.inner.state.lock().unwrap();
        if state.rows == rows && state.cols == cols {
            return;
        }
        state.buffer = alloc(&self.inner.ctx, rows, cols);
        state.rows = rows;
        state.cols = cols;
        state.write_event = None;
    }

    /// Overwrite the contents with zero bytes. Used to reset reduction
    /// accumulators before a launch.
    pub(crate) fn zero_fill(&self) {
        let state = self.inner.state.lock().unwrap();
        let len = state.rows * state.cols;
        if len > 0 {
            let zeros = vec![0u8; len * 4];
            self.inner.ctx.queue.write_buffer(&state.buffer, 0, &zeros);
        }
    }

    pub(crate) fn set_write_event(&self, index: wgpu::SubmissionIndex) {
        self.inner.state.lock().unwrap().write_event = Some(index);
    }
}
