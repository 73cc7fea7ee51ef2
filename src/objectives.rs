//! Optimisation objectives: a closed set of eight weighted terms.
//!
//! Each variant maps to a fixed wire id.  Losses are evaluated on a solved
//! geometry snapshot and accumulate their partial derivatives with respect to
//! member lengths, member forces, node coordinates and (explicitly) force
//! densities; `gradients` chains these through the equilibrium system.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::types::{FdmError, FdmResult};

pub const DEFAULT_BARRIER_SHARPNESS: f64 = 10.0;

// ─────────────────────────────────────────────────────────────
//  Objective variants
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Objective {
    /// Stay close to the geometry the request was sent with.
    Target { weight: f64 },
    /// Minimise max(ℓ) − min(ℓ).
    LengthVariation { weight: f64 },
    /// Minimise max(f) − min(f).
    ForceVariation { weight: f64 },
    /// Minimise Σ f·ℓ.
    Performance { weight: f64 },
    MinLength { weight: f64, value: f64 },
    MaxLength { weight: f64, value: f64 },
    MinForce { weight: f64, value: f64 },
    MaxForce { weight: f64, value: f64 },
}

/// Wire form of an objective: `{id, weight, value?}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveTerm {
    pub id: u8,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Objective {
    pub fn id(&self) -> u8 {
        match self {
            Self::Target { .. } => 0,
            Self::LengthVariation { .. } => 1,
            Self::ForceVariation { .. } => 2,
            Self::Performance { .. } => 3,
            Self::MinLength { .. } => 4,
            Self::MaxLength { .. } => 5,
            Self::MinForce { .. } => 6,
            Self::MaxForce { .. } => 7,
        }
    }

    pub fn weight(&self) -> f64 {
        match *self {
            Self::Target { weight }
            | Self::LengthVariation { weight }
            | Self::ForceVariation { weight }
            | Self::Performance { weight }
            | Self::MinLength { weight, .. }
            | Self::MaxLength { weight, .. }
            | Self::MinForce { weight, .. }
            | Self::MaxForce { weight, .. } => weight,
        }
    }

    /// Threshold of the barrier-style objectives.
    pub fn value(&self) -> Option<f64> {
        match *self {
            Self::MinLength { value, .. }
            | Self::MaxLength { value, .. }
            | Self::MinForce { value, .. }
            | Self::MaxForce { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn to_term(&self) -> ObjectiveTerm {
        ObjectiveTerm {
            id: self.id(),
            weight: self.weight(),
            value: self.value(),
        }
    }

    pub fn from_term(term: &ObjectiveTerm) -> FdmResult<Self> {
        let weight = term.weight;
        let value = || {
            term.value.ok_or_else(|| {
                FdmError::ProtocolDecode(format!("objective id {} requires a value", term.id))
            })
        };
        Ok(match term.id {
            0 => Self::Target { weight },
            1 => Self::LengthVariation { weight },
            2 => Self::ForceVariation { weight },
            3 => Self::Performance { weight },
            4 => Self::MinLength { weight, value: value()? },
            5 => Self::MaxLength { weight, value: value()? },
            6 => Self::MinForce { weight, value: value()? },
            7 => Self::MaxForce { weight, value: value()? },
            id => return Err(FdmError::ProtocolDecode(format!("unknown objective id {id}"))),
        })
    }

    /// Objectives used when a request carries none.
    pub fn default_set() -> Vec<Objective> {
        vec![Self::Target { weight: 1.0 }]
    }
}

// ─────────────────────────────────────────────────────────────
//  Softplus barrier
// ─────────────────────────────────────────────────────────────

/// Numerically stable log(1 + exp(z)).
#[inline]
fn log1pexp(z: f64) -> f64 {
    if z > 0.0 {
        z + (-z).exp().ln_1p()
    } else {
        z.exp().ln_1p()
    }
}

/// Smooth one-sided barrier.
/// `k < 0` ⟹  penalise x < b  (min barrier).
/// `k > 0` ⟹  penalise x > b  (max barrier).
#[inline]
pub fn softplus(x: f64, b: f64, k: f64) -> f64 {
    let z = -k * (b - x) - 1.0;
    log1pexp(z)
}

/// d/dx softplus = k · σ(z).
#[inline]
pub fn softplus_grad(x: f64, b: f64, k: f64) -> f64 {
    let z = -k * (b - x) - 1.0;
    let sigma = 1.0 / (1.0 + (-z).exp());
    k * sigma
}

/// Barrier keeping every force density inside `[lower, upper]`; infinite
/// bounds are ignored.  Accumulates its gradient into `grad`.
pub fn bounds_penalty(q: &[f64], lower: f64, upper: f64, sharpness: f64, weight: f64, grad: &mut [f64]) -> f64 {
    let mut loss = 0.0;
    for (i, &qi) in q.iter().enumerate() {
        if lower.is_finite() {
            loss += weight * softplus(qi, lower, -sharpness);
            grad[i] += weight * softplus_grad(qi, lower, -sharpness);
        }
        if upper.is_finite() {
            loss += weight * softplus(qi, upper, sharpness);
            grad[i] += weight * softplus_grad(qi, upper, sharpness);
        }
    }
    loss
}

// ─────────────────────────────────────────────────────────────
//  Loss evaluation
// ─────────────────────────────────────────────────────────────

/// Solved geometry the objectives are evaluated on.
pub struct Snapshot<'a> {
    /// All node coordinates (nn × 3).
    pub xyz: &'a Array2<f64>,
    /// Target coordinates (nn × 3).
    pub target: &'a Array2<f64>,
    pub lengths: &'a [f64],
    pub forces: &'a [f64],
}

/// Partial derivatives of the loss, before chaining through the solve.
#[derive(Debug, Clone)]
pub struct Partials {
    /// dJ/dℓ (ne)
    pub lengths: Vec<f64>,
    /// dJ/df (ne)
    pub forces: Vec<f64>,
    /// dJ/dxyz (nn × 3)
    pub xyz: Array2<f64>,
    /// Explicit dJ/dq (ne)
    pub q: Vec<f64>,
}

impl Partials {
    pub fn zeros(num_edges: usize, num_nodes: usize) -> Self {
        Self {
            lengths: vec![0.0; num_edges],
            forces: vec![0.0; num_edges],
            xyz: Array2::zeros((num_nodes, 3)),
            q: vec![0.0; num_edges],
        }
    }
}

fn argmin_argmax(values: &[f64]) -> Option<(usize, usize)> {
    if values.is_empty() {
        return None;
    }
    let (mut lo, mut hi) = (0, 0);
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v < values[lo] {
            lo = i;
        }
        if v > values[hi] {
            hi = i;
        }
    }
    Some((lo, hi))
}

/// max − min of `values`, accumulating ±weight at the extreme entries.
fn variation(values: &[f64], weight: f64, grad: &mut [f64]) -> f64 {
    match argmin_argmax(values) {
        Some((lo, hi)) => {
            grad[hi] += weight;
            grad[lo] -= weight;
            weight * (values[hi] - values[lo])
        }
        None => 0.0,
    }
}

fn barrier(values: &[f64], threshold: f64, k: f64, weight: f64, grad: &mut [f64]) -> f64 {
    let mut loss = 0.0;
    for (i, &v) in values.iter().enumerate() {
        loss += weight * softplus(v, threshold, k);
        grad[i] += weight * softplus_grad(v, threshold, k);
    }
    loss
}

impl Objective {
    /// Weighted loss of this objective; partial derivatives are added to
    /// `partials`.
    pub fn accumulate(&self, snap: &Snapshot, partials: &mut Partials) -> f64 {
        let k = DEFAULT_BARRIER_SHARPNESS;
        match *self {
            Self::Target { weight } => {
                let mut loss = 0.0;
                for ((idx, &x), &t) in snap.xyz.indexed_iter().zip(snap.target.iter()) {
                    let diff = x - t;
                    loss += diff * diff;
                    partials.xyz[idx] += 2.0 * weight * diff;
                }
                weight * loss
            }
            Self::LengthVariation { weight } => variation(snap.lengths, weight, &mut partials.lengths),
            Self::ForceVariation { weight } => variation(snap.forces, weight, &mut partials.forces),
            Self::Performance { weight } => {
                let mut loss = 0.0;
                for (i, (&l, &f)) in snap.lengths.iter().zip(snap.forces).enumerate() {
                    loss += f * l;
                    partials.lengths[i] += weight * f;
                    partials.forces[i] += weight * l;
                }
                weight * loss
            }
            Self::MinLength { weight, value } => barrier(snap.lengths, value, -k, weight, &mut partials.lengths),
            Self::MaxLength { weight, value } => barrier(snap.lengths, value, k, weight, &mut partials.lengths),
            Self::MinForce { weight, value } => barrier(snap.forces, value, -k, weight, &mut partials.forces),
            Self::MaxForce { weight, value } => barrier(snap.forces, value, k, weight, &mut partials.forces),
        }
    }
}

/// Total loss of all objectives.
pub fn total_loss(objectives: &[Objective], snap: &Snapshot, partials: &mut Partials) -> f64 {
    objectives.iter().map(|obj| obj.accumulate(snap, partials)).sum()
}
