//! WGSL kernel skeleton and device-function fragments.
//!
//! A fused kernel is one compute entry point over a 2-D (row, col) index
//! space. Matrices are column-major: `idx = col * dims.rows + row`. The
//! four [`KernelParts`](super::KernelParts) fragments slot into a fixed
//! frame, so the full source is a pure function of the emission pass.

use super::KernelParts;

/// Work-items per workgroup side; dispatches are `ceil(shape / 16)`.
pub(crate) const WORKGROUP_DIM: u32 = 16;

/// NaN test via exponent/mantissa bits. `x != x` is not reliable under
/// fast-math, the bit pattern is.
pub(crate) const IS_NAN_F32: &str = "\
fn is_nan_f32(x: f32) -> bool {
    let bits = bitcast<u32>(x);
    return (bits & 0x7f800000u) == 0x7f800000u && (bits & 0x007fffffu) != 0u;
}
";

pub(crate) const IS_FINITE_F32: &str = "\
fn is_finite_f32(x: f32) -> bool {
    return (bitcast<u32>(x) & 0x7f800000u) != 0x7f800000u;
}
";

pub(crate) const LOG1P_F32: &str = "\
fn log1p_f32(x: f32) -> f32 {
    return log(1.0 + x);
}
";

/// Float accumulation into `array<atomic<u32>>` storage via a
/// compare-exchange loop; WGSL has no native atomic float add.
pub(crate) fn colwise_add_fragment(out: &str, value: &str) -> String {
    format!(
        "    var {out}_old = atomicLoad(&{out}[col]);
    loop {{
        let {out}_new = bitcast<u32>(bitcast<f32>({out}_old) + {value});
        let {out}_swap = atomicCompareExchangeWeak(&{out}[col], {out}_old, {out}_new);
        if ({out}_swap.exchanged) {{
            break;
        }}
        {out}_old = {out}_swap.old_value;
    }}
",
        out = out,
        value = value,
    )
}

/// Claim-and-record fragment for a validity check. `atomicExchange`
/// guarantees exactly one work-item records its (row, col, value) even
/// under massively parallel failures; the winner is the first claim, not
/// a deterministic element.
pub(crate) fn check_fragment(name: &str, cond: &str, value: &str) -> String {
    format!(
        "    if (!{cond} && atomicExchange(&{name}_flag[0u], 1u) == 0u) {{
        atomicStore(&{name}_flag[1u], row);
        atomicStore(&{name}_flag[2u], col);
        {name}_value[0] = {value};
    }}
",
        name = name,
        cond = cond,
        value = value,
    )
}

/// Assemble the full kernel source. Fragment order is fixed: argument
/// declarations, kernel-scope setup, per-work-item body, then the
/// reduction/write-back epilogue.
pub(crate) fn kernel_source(parts: &KernelParts) -> String {
    format!(
        "struct Dims {{
    rows: u32,
    cols: u32,
    _pad0: u32,
    _pad1: u32,
}}

@group(0) @binding(0) var<uniform> dims: Dims;
{args}
{setup}@compute @workgroup_size({wg}, {wg})
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let row = gid.x;
    let col = gid.y;
    if (row >= dims.rows || col >= dims.cols) {{
        return;
    }}
    let idx = col * dims.rows + row;
{body}{reduction}}}
",
        args = parts.args,
        setup = parts.setup,
        wg = WORKGROUP_DIM,
        body = parts.body,
        reduction = parts.reduction,
    )
}
