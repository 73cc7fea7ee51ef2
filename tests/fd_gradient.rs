//! Finite-difference checks of the adjoint gradient.
//!
//! Builds a 7-node arch with two anchors and cross-bracing, then compares
//! every component of the analytic dJ/dq against a central difference
//!
//!     dJ/dq_k  ≈  [ J(q + h e_k) − J(q − h e_k) ] / 2h
//!
//! for each objective on its own and for a weighted mix.  The force-density
//! vector is deliberately asymmetric so no two members tie for max/min.

use ndarray::Array2;

use formfind::gradients::{evaluate, OptimizationContext};
use formfind::objectives::Objective;
use formfind::optimizer::context_from_request;
use formfind::protocol::{encode, OptimizationSettings};
use formfind::{Network, Segment};

const Q: [f64; 8] = [1.0, 1.3, 0.8, 1.1, 1.7, 0.9, 1.2, 1.5];

/// Arch elevation (x right, z up):
///
///              (3)
///          (2)     (4)
///      (1)             (5)
///   (0)                   (6)
///
/// chain 0→1→…→6 plus braces 1→5 and 2→4; nodes 0 and 6 anchored.
fn arch() -> Network {
    let p = |x: f64, z: f64| [x, 0.0, z];
    let pts = [p(0.0, 0.0), p(1.0, 1.0), p(2.0, 1.8), p(3.0, 2.0), p(4.0, 1.8), p(5.0, 1.0), p(6.0, 0.0)];
    let mut segments: Vec<Segment> = pts.windows(2).map(|w| Segment::new(w[0], w[1])).collect();
    segments.push(Segment::new(pts[1], pts[5]));
    segments.push(Segment::new(pts[2], pts[4]));
    Network::build(segments, vec![pts[0], pts[6]], &Q, 0.01).unwrap()
}

fn context(objectives: Vec<Objective>, lower: f64, upper: f64) -> OptimizationContext {
    let settings = OptimizationSettings {
        objectives,
        lower_bound: lower,
        upper_bound: upper,
        ..Default::default()
    };
    let loads = [
        [0.0, 0.0, -1.0],
        [0.1, 0.0, -1.0],
        [0.0, 0.2, -2.0],
        [0.0, 0.0, -1.5],
        [-0.1, 0.0, -1.0],
    ];
    let request = encode(&arch(), &settings, &loads).unwrap();
    context_from_request(&request).unwrap().0
}

fn assert_gradient_matches(ctx: &OptimizationContext, label: &str) {
    let eval = evaluate(ctx, &Q).unwrap();
    let h = 1e-6;
    for k in 0..Q.len() {
        let mut qp = Q.to_vec();
        let mut qm = Q.to_vec();
        qp[k] += h;
        qm[k] -= h;
        let fd = (evaluate(ctx, &qp).unwrap().loss - evaluate(ctx, &qm).unwrap().loss) / (2.0 * h);
        let analytic = eval.gradient[k];
        let scale = fd.abs().max(analytic.abs()).max(1.0);
        assert!(
            (fd - analytic).abs() / scale < 1e-5,
            "{label}: edge {k}: finite difference {fd:.8e} vs adjoint {analytic:.8e}",
        );
    }
}

fn unbounded(objective: Objective) -> OptimizationContext {
    context(vec![objective], f64::NEG_INFINITY, f64::INFINITY)
}

#[test]
fn target() {
    assert_gradient_matches(&unbounded(Objective::Target { weight: 1.0 }), "target");
}

#[test]
fn length_variation() {
    assert_gradient_matches(&unbounded(Objective::LengthVariation { weight: 1.0 }), "length variation");
}

#[test]
fn force_variation() {
    assert_gradient_matches(&unbounded(Objective::ForceVariation { weight: 1.0 }), "force variation");
}

#[test]
fn performance() {
    assert_gradient_matches(&unbounded(Objective::Performance { weight: 1.0 }), "performance");
}

#[test]
fn length_barriers() {
    let eval = evaluate(&unbounded(Objective::Target { weight: 1.0 }), &Q).unwrap();
    let mean = eval.lengths.iter().sum::<f64>() / eval.lengths.len() as f64;
    assert_gradient_matches(&unbounded(Objective::MinLength { weight: 1.0, value: mean }), "min length");
    assert_gradient_matches(&unbounded(Objective::MaxLength { weight: 1.0, value: mean }), "max length");
}

#[test]
fn force_barriers() {
    let eval = evaluate(&unbounded(Objective::Target { weight: 1.0 }), &Q).unwrap();
    let mean = eval.forces.iter().sum::<f64>() / eval.forces.len() as f64;
    assert_gradient_matches(&unbounded(Objective::MinForce { weight: 1.0, value: mean }), "min force");
    assert_gradient_matches(&unbounded(Objective::MaxForce { weight: 1.0, value: mean }), "max force");
}

#[test]
fn weighted_mix_with_bounds() {
    let ctx = context(
        vec![
            Objective::Target { weight: 1.0 },
            Objective::LengthVariation { weight: 0.5 },
            Objective::Performance { weight: 0.01 },
            Objective::MaxForce { weight: 2.0, value: 2.0 },
        ],
        0.9,
        1.6,
    );
    assert_gradient_matches(&ctx, "weighted mix");
}

#[test]
fn default_objective_is_target() {
    let empty = context(Vec::new(), f64::NEG_INFINITY, f64::INFINITY);
    let target = unbounded(Objective::Target { weight: 1.0 });
    let a = evaluate(&empty, &Q).unwrap();
    let b = evaluate(&target, &Q).unwrap();
    assert_eq!(a.loss, b.loss);
    assert_eq!(a.gradient, b.gradient);
}

#[test]
fn fixed_rows_of_solved_geometry_are_anchors() {
    let ctx = unbounded(Objective::Target { weight: 1.0 });
    let eval = evaluate(&ctx, &Q).unwrap();
    let expected = Array2::from_shape_vec((2, 3), vec![0.0, 0.0, 0.0, 6.0, 0.0, 0.0]).unwrap();
    assert_eq!(eval.xyz.row(0), expected.row(0));
    assert_eq!(eval.xyz.row(6), expected.row(1));
}
