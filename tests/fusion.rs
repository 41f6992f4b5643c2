//! End-to-end fused assignments over a real device: validity checks,
//! shared sub-expressions across destinations, reductions, and the
//! Cauchy-lcdf-shaped caller pattern the engine was built for.
//!
//! Every test skips gracefully when no GPU adapter is available.

use std::sync::Arc;

use riptide::{check, Assign, Context, Error, Graph, Matrix};

fn ctx_or_skip() -> Option<Arc<Context>> {
    match Context::try_new() {
        Some(ctx) => Some(ctx),
        None => {
            eprintln!("No GPU available, skipping test");
            None
        }
    }
}

fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let scale = e.abs().max(1.0);
        assert!(
            (a - e).abs() <= tol * scale,
            "element {}: {} vs {}",
            i,
            a,
            e
        );
    }
}

#[test]
fn nan_check_reports_first_offending_index() {
    let Some(ctx) = ctx_or_skip() else { return };
    let y = Matrix::from_host(&ctx, 3, 1, &[1.0, f32::NAN, 3.0]).unwrap();

    let g = Graph::new();
    let yv = g.input(&y);
    let not_nan = check(&ctx, "test_fn", "y", &yv, "not NaN");

    let err = Assign::new(&ctx)
        .check(not_nan, &!yv.is_nan())
        .run()
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("[1, 0]"), "message was: {}", message);
    assert!(message.contains("NaN"), "message was: {}", message);
    assert!(message.contains("test_fn: y"), "message was: {}", message);
}

#[test]
fn all_passing_check_raises_nothing() {
    let Some(ctx) = ctx_or_skip() else { return };
    let y = Matrix::from_host(&ctx, 3, 1, &[1.0, 2.0, 3.0]).unwrap();

    let g = Graph::new();
    let yv = g.input(&y);
    let not_nan = check(&ctx, "test_fn", "y", &yv, "not NaN");

    Assign::new(&ctx)
        .check(not_nan, &!yv.is_nan())
        .run()
        .unwrap();
}

#[test]
fn check_dimension_mismatch_raises_before_launch() {
    let Some(ctx) = ctx_or_skip() else { return };
    let y = Matrix::from_host(&ctx, 3, 1, &[1.0, 2.0, 3.0]).unwrap();
    let wrong = Matrix::from_host(&ctx, 2, 2, &[1.0, 2.0, 3.0, 4.0]).unwrap();

    let g = Graph::new();
    let yv = g.input(&y);
    // The checked argument has a different shape than the launch.
    let chk = check(&ctx, "test_fn", "wrong", &g.input(&wrong), "finite");

    let before = ctx.launch_count();
    let err = Assign::new(&ctx).check(chk, &yv.is_finite()).run().unwrap_err();

    assert!(matches!(err, Error::SizeMismatch { .. }));
    assert_eq!(ctx.launch_count(), before, "no kernel may launch");
}

#[test]
fn failing_check_keeps_sibling_writes() {
    let Some(ctx) = ctx_or_skip() else { return };
    let y = Matrix::from_host(&ctx, 3, 1, &[1.0, -1.0, 3.0]).unwrap();
    let out = Matrix::empty(&ctx);

    let g = Graph::new();
    let yv = g.input(&y);
    let positive = check(&ctx, "test_fn", "y", &yv, "positive");

    let err = Assign::new(&ctx)
        .output(&out, &(&yv * 2.0))
        .check(positive, &g.lit(0.0).lt(&yv))
        .run()
        .unwrap_err();

    assert!(matches!(err, Error::Validation { .. }));
    let message = err.to_string();
    assert!(message.contains("= -1, but it must be positive!"), "message was: {}", message);
    // The fused kernel ran; the sibling destination keeps its result.
    assert_eq!(out.to_host(), vec![2.0, -2.0, 6.0]);
}

#[test]
fn shared_subexpression_feeds_value_and_check() {
    let Some(ctx) = ctx_or_skip() else { return };
    let y = Matrix::from_host(&ctx, 4, 1, &[0.5, 1.5, 2.5, 3.5]).unwrap();
    let out = Matrix::empty(&ctx);

    let g = Graph::new();
    let yv = g.input(&y);
    let scaled = &yv * 4.0;
    let in_range = check(&ctx, "test_fn", "y", &yv, "positive");

    Assign::new(&ctx)
        .output(&out, &scaled)
        .check(in_range, &g.lit(0.0).lt(&yv))
        .run()
        .unwrap();

    assert_eq!(out.to_host(), vec![2.0, 6.0, 10.0, 14.0]);
}

#[test]
fn cauchy_lcdf_shaped_assignment() {
    let Some(ctx) = ctx_or_skip() else { return };
    let n = 5usize;
    let y_data = [-2.0f32, -0.5, 0.0, 1.0, 2.5];
    let mu_data = [0.0f32, 0.0, 0.5, 0.5, 1.0];
    let sigma_data = [1.0f32, 2.0, 1.0, 0.5, 2.0];

    let y = Matrix::from_host(&ctx, n, 1, &y_data).unwrap();
    let mu = Matrix::from_host(&ctx, n, 1, &mu_data).unwrap();
    let sigma = Matrix::from_host(&ctx, n, 1, &sigma_data).unwrap();

    let cdf_log = Matrix::empty(&ctx);
    let y_deriv = Matrix::empty(&ctx);
    let mu_deriv = Matrix::empty(&ctx);

    let g = Graph::new();
    let yv = g.input(&y);
    let muv = g.input(&mu);
    let sigmav = g.input(&sigma);

    let check_y_not_nan = check(&ctx, "cauchy_lcdf", "Random variable", &yv, "not NaN");
    let check_mu_finite = check(&ctx, "cauchy_lcdf", "Location parameter", &muv, "finite");
    let check_sigma_pos = check(
        &ctx,
        "cauchy_lcdf",
        "Scale parameter",
        &sigmav,
        "positive finite",
    );

    let pi = std::f32::consts::PI;
    let sigma_inv = 1.0 / &sigmav;
    let z = (&yv - &muv) * &sigma_inv;
    let pn = z.atan() / pi + 0.5;
    let rep_deriv = 1.0 / ((&pn * pi) * (z.square() * &sigmav + &sigmav));

    Assign::new(&ctx)
        .check(check_y_not_nan, &!yv.is_nan())
        .check(check_mu_finite, &muv.is_finite())
        .check(
            check_sigma_pos,
            &g.lit(0.0).lt(&sigmav).and(&sigmav.is_finite()),
        )
        .output(&cdf_log, &pn.log().colwise_sum())
        .output_if(true, &y_deriv, &rep_deriv)
        .output_if(false, &mu_deriv, &(-&rep_deriv))
        .run()
        .unwrap();

    // CPU reference.
    let mut expected_sum = 0.0f32;
    let mut expected_deriv = Vec::with_capacity(n);
    for i in 0..n {
        let z = (y_data[i] - mu_data[i]) / sigma_data[i];
        let pn = z.atan() / pi + 0.5;
        expected_sum += pn.ln();
        expected_deriv.push(1.0 / (pn * pi * (z * z * sigma_data[i] + sigma_data[i])));
    }

    assert_eq!(cdf_log.shape(), (1, 1));
    assert_close(&cdf_log.to_host(), &[expected_sum], 1e-4);
    assert_eq!(y_deriv.shape(), (n, 1));
    assert_close(&y_deriv.to_host(), &expected_deriv, 1e-4);
    assert_eq!(mu_deriv.shape(), (0, 0), "absent source leaves destination untouched");
}

#[test]
fn colwise_sum_of_log_resizes_and_populates() {
    let Some(ctx) = ctx_or_skip() else { return };
    // Column-major 2x3.
    let pn = Matrix::from_host(&ctx, 2, 3, &[1.0, 2.0, 4.0, 8.0, 16.0, 32.0]).unwrap();
    let sums = Matrix::empty(&ctx);

    let g = Graph::new();
    Assign::new(&ctx)
        .output(&sums, &g.input(&pn).log().colwise_sum())
        .run()
        .unwrap();

    assert_eq!(sums.shape(), (1, 3));
    let ln2 = std::f32::consts::LN_2;
    assert_close(&sums.to_host(), &[ln2, 5.0 * ln2, 9.0 * ln2], 1e-4);
}

#[test]
fn second_assignment_overwrites_tracked_event() {
    let Some(ctx) = ctx_or_skip() else { return };
    let y = Matrix::from_host(&ctx, 2, 1, &[1.0, 2.0]).unwrap();
    let out = Matrix::empty(&ctx);

    let g = Graph::new();
    let yv = g.input(&y);
    Assign::new(&ctx).output(&out, &(&yv + 1.0)).run().unwrap();
    Assign::new(&ctx).output(&out, &(&yv + 10.0)).run().unwrap();

    // A read always observes the most recent assignment.
    assert_eq!(out.to_host(), vec![11.0, 12.0]);
}
