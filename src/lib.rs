//! riptide: lazy GPU expression fusion for matrices.
//!
//! Chained elementwise arithmetic, transcendental functions, reductions
//! and in-kernel validity checks compose into one expression graph per
//! assignment. The graph is fused into a single WGSL compute kernel,
//! compiled once per distinct source text, launched on a wgpu queue, and
//! synchronized back only when a result is actually read.
//!
//! ```ignore
//! let ctx = Context::try_new().expect("no GPU adapter");
//! let y = Matrix::from_host(&ctx, n, 1, &data)?;
//! let out = Matrix::empty(&ctx);
//!
//! let g = Graph::new();
//! let yv = g.input(&y);
//! let not_nan = check(&ctx, "my_fn", "y", &yv, "not NaN");
//!
//! Assign::new(&ctx)
//!     .check(not_nan, &!yv.is_nan())
//!     .output(&out, &yv.log().colwise_sum())
//!     .run()?;
//! ```

pub mod assign;
pub mod check;
pub mod codegen;
pub mod context;
pub mod error;
pub mod graph;
pub mod matrix;

pub use assign::{Assign, AssignSource};
pub use check::{check, Check};
pub use codegen::fused_preview;
pub use context::Context;
pub use error::Error;
pub use graph::expr::{Expr, Graph, Reduction};
pub use matrix::Matrix;
