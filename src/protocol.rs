//! Wire protocol for delegating force-density optimisation to a remote solver.
//!
//! Outbound: one JSON `OptimizationRequest` per problem.  Inbound: a stream of
//! `ProgressMessage`s, each a complete snapshot (force densities, coordinates,
//! loss) that supersedes the previous one.  Indices on the wire are 1-based.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::assembly::{load_matrix, LinearProblem};
use crate::objectives::{Objective, ObjectiveTerm};
use crate::topology::Network;
use crate::types::{FdmError, FdmResult, Point3};

/// Sent once the channel opens.
pub const HANDSHAKE: &str = "init";
/// Sent when the owner tears the session down.
pub const CLOSE: &str = "CLOSE";
/// Sent by the remote when it drops the connection.
pub const CONNECTION_ENDED: &str = "CONNECTION ENDED";

// ─────────────────────────────────────────────────────────────
//  Settings
// ─────────────────────────────────────────────────────────────

/// Optimiser parameters carried by every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationSettings {
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub abs_tolerance: f64,
    pub rel_tolerance: f64,
    pub max_iterations: usize,
    /// Iterations between intermediate reports.
    pub update_frequency: usize,
    pub show_iterations: bool,
    /// Empty means the default objective set.
    pub objectives: Vec<Objective>,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            lower_bound: 0.1,
            upper_bound: 100.0,
            abs_tolerance: 1e-3,
            rel_tolerance: 1e-3,
            max_iterations: 500,
            update_frequency: 10,
            show_iterations: true,
            objectives: Vec::new(),
        }
    }
}

impl OptimizationSettings {
    /// Objectives to evaluate, substituting the default set for an empty list.
    pub fn effective_objectives(&self) -> Vec<Objective> {
        if self.objectives.is_empty() {
            Objective::default_set()
        } else {
            self.objectives.clone()
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Outbound request
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OptimizationRequest {
    pub q: Vec<f64>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub px: Vec<f64>,
    pub py: Vec<f64>,
    pub pz: Vec<f64>,
    /// Incidence row (edge) of each triplet, 1-based.
    #[serde(rename = "Ijulia")]
    pub rows: Vec<usize>,
    /// Incidence column (node) of each triplet, 1-based.
    #[serde(rename = "Jjulia")]
    pub cols: Vec<usize>,
    #[serde(rename = "V")]
    pub values: Vec<i32>,
    pub ne: usize,
    pub nn: usize,
    #[serde(rename = "Njulia")]
    pub free: Vec<usize>,
    #[serde(rename = "Fjulia")]
    pub fixed: Vec<usize>,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub abs_tolerance: f64,
    pub rel_tolerance: f64,
    pub max_iterations: usize,
    pub update_frequency: usize,
    pub show_iterations: bool,
    pub objectives: Vec<ObjectiveTerm>,
}

/// Build the request for `network` under `loads` (one per free node or a
/// single broadcast vector).
pub fn encode(network: &Network, settings: &OptimizationSettings, loads: &[Point3]) -> FdmResult<OptimizationRequest> {
    network.validate()?;
    let p = load_matrix(loads, network.free_indices().len())?;

    let positions = network.positions();
    let mut rows = Vec::with_capacity(2 * network.num_edges());
    let mut cols = Vec::with_capacity(2 * network.num_edges());
    let mut values = Vec::with_capacity(2 * network.num_edges());
    for (k, (s, e)) in network.indices().into_iter().enumerate() {
        rows.extend([k + 1, k + 1]);
        cols.extend([s + 1, e + 1]);
        values.extend([-1, 1]);
    }

    Ok(OptimizationRequest {
        q: network.force_densities(),
        x: positions.iter().map(|p| p[0]).collect(),
        y: positions.iter().map(|p| p[1]).collect(),
        z: positions.iter().map(|p| p[2]).collect(),
        px: p.column(0).to_vec(),
        py: p.column(1).to_vec(),
        pz: p.column(2).to_vec(),
        rows,
        cols,
        values,
        ne: network.num_edges(),
        nn: network.num_nodes(),
        free: network.free_indices().iter().map(|i| i + 1).collect(),
        fixed: network.fixed_indices().iter().map(|i| i + 1).collect(),
        lower_bound: settings.lower_bound,
        upper_bound: settings.upper_bound,
        abs_tolerance: settings.abs_tolerance,
        rel_tolerance: settings.rel_tolerance,
        max_iterations: settings.max_iterations,
        update_frequency: settings.update_frequency,
        show_iterations: settings.show_iterations,
        objectives: settings.objectives.iter().map(Objective::to_term).collect(),
    })
}

fn zero_based(what: &str, indices: &[usize], bound: usize) -> FdmResult<Vec<usize>> {
    indices
        .iter()
        .map(|&i| {
            if i == 0 || i > bound {
                Err(FdmError::ProtocolDecode(format!("{what} index {i} outside [1, {bound}]")))
            } else {
                Ok(i - 1)
            }
        })
        .collect()
}

fn check_len(what: &'static str, found: usize, expected: usize) -> FdmResult<()> {
    if found != expected {
        return Err(FdmError::ArityMismatch { what, found, expected });
    }
    Ok(())
}

impl OptimizationRequest {
    pub fn to_json(&self) -> FdmResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> FdmResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// 0-based `(start, end)` pairs recovered from the incidence triplets.
    pub fn edge_indices(&self) -> FdmResult<Vec<(usize, usize)>> {
        check_len("incidence rows", self.rows.len(), 2 * self.ne)?;
        check_len("incidence columns", self.cols.len(), 2 * self.ne)?;
        check_len("incidence values", self.values.len(), 2 * self.ne)?;

        let cols = zero_based("node", &self.cols, self.nn)?;
        let mut edges: Vec<(Option<usize>, Option<usize>)> = vec![(None, None); self.ne];
        for ((&row, &col), &v) in self.rows.iter().zip(&cols).zip(&self.values) {
            let k = zero_based("edge", &[row], self.ne)?[0];
            let (start, end) = &mut edges[k];
            match v {
                -1 => *start = Some(col),
                1 => *end = Some(col),
                other => {
                    return Err(FdmError::ProtocolDecode(format!(
                        "incidence value {other} on edge {row}; expected ±1"
                    )))
                }
            }
        }
        edges
            .into_iter()
            .enumerate()
            .map(|(k, pair)| match pair {
                (Some(s), Some(e)) => Ok((s, e)),
                _ => Err(FdmError::ProtocolDecode(format!("edge {} lacks a start or end node", k + 1))),
            })
            .collect()
    }

    pub fn free_indices(&self) -> FdmResult<Vec<usize>> {
        zero_based("free node", &self.free, self.nn)
    }

    pub fn fixed_indices(&self) -> FdmResult<Vec<usize>> {
        zero_based("fixed node", &self.fixed, self.nn)
    }

    /// All node coordinates.
    pub fn positions(&self) -> FdmResult<Vec<Point3>> {
        check_len("X", self.x.len(), self.nn)?;
        check_len("Y", self.y.len(), self.nn)?;
        check_len("Z", self.z.len(), self.nn)?;
        Ok((0..self.nn).map(|i| [self.x[i], self.y[i], self.z[i]]).collect())
    }

    /// Load matrix P (|N| × 3).
    pub fn loads(&self) -> FdmResult<Array2<f64>> {
        let n = self.free.len();
        check_len("Px", self.px.len(), n)?;
        check_len("Py", self.py.len(), n)?;
        check_len("Pz", self.pz.len(), n)?;
        let mut p = Array2::zeros((n, 3));
        for i in 0..n {
            p[[i, 0]] = self.px[i];
            p[[i, 1]] = self.py[i];
            p[[i, 2]] = self.pz[i];
        }
        Ok(p)
    }

    pub fn settings(&self) -> FdmResult<OptimizationSettings> {
        Ok(OptimizationSettings {
            lower_bound: self.lower_bound,
            upper_bound: self.upper_bound,
            abs_tolerance: self.abs_tolerance,
            rel_tolerance: self.rel_tolerance,
            max_iterations: self.max_iterations,
            update_frequency: self.update_frequency,
            show_iterations: self.show_iterations,
            objectives: self
                .objectives
                .iter()
                .map(Objective::from_term)
                .collect::<FdmResult<_>>()?,
        })
    }

    /// Linear problem for the request's initial force densities.
    pub fn linear_problem(&self) -> FdmResult<LinearProblem> {
        check_len("Q", self.q.len(), self.ne)?;
        LinearProblem::from_parts(
            self.nn,
            &self.edge_indices()?,
            self.free_indices()?,
            self.fixed_indices()?,
            &self.positions()?,
            &self.q,
        )
    }
}

// ─────────────────────────────────────────────────────────────
//  Inbound progress
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProgressMessage {
    pub finished: bool,
    pub iter: usize,
    pub loss: f64,
    pub q: Vec<f64>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    #[serde(default)]
    pub losstrace: Vec<f64>,
}

impl ProgressMessage {
    pub fn to_json(&self) -> FdmResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decoded progress snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub finished: bool,
    pub iteration: usize,
    pub loss: f64,
    pub force_densities: Vec<f64>,
    /// All-node or free-node-only coordinates, as sent.
    pub coordinates: Vec<Point3>,
    pub loss_history: Vec<f64>,
}

/// Decode one progress payload.
pub fn decode(payload: &str) -> FdmResult<Progress> {
    let msg: ProgressMessage = serde_json::from_str(payload)?;
    if msg.x.len() != msg.y.len() || msg.x.len() != msg.z.len() {
        return Err(FdmError::ProtocolDecode(format!(
            "coordinate lists differ in length: X {}, Y {}, Z {}",
            msg.x.len(),
            msg.y.len(),
            msg.z.len()
        )));
    }
    let coordinates = msg
        .x
        .iter()
        .zip(&msg.y)
        .zip(&msg.z)
        .map(|((&x, &y), &z)| [x, y, z])
        .collect();
    Ok(Progress {
        finished: msg.finished,
        iteration: msg.iter,
        loss: msg.loss,
        force_densities: msg.q,
        coordinates,
        loss_history: msg.losstrace,
    })
}

impl Progress {
    /// Rebuild `network` with this snapshot's coordinates and force
    /// densities, keeping its index pairs and free/fixed partition.
    pub fn apply_to(&self, network: &Network) -> FdmResult<Network> {
        check_len("Q", self.force_densities.len(), network.num_edges())?;

        let points = if self.coordinates.len() == network.num_nodes() {
            self.coordinates.clone()
        } else if self.coordinates.len() == network.free_indices().len() {
            let mut points = network.positions();
            for (&node, &p) in network.free_indices().iter().zip(&self.coordinates) {
                points[node] = p;
            }
            points
        } else {
            return Err(FdmError::ArityMismatch {
                what: "progress coordinates",
                found: self.coordinates.len(),
                expected: network.num_nodes(),
            });
        };
        network.with_geometry(&points, &self.force_densities)
    }
}

/// Classification of one inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Remote closed the connection (sentinel or empty payload).
    Ended,
    /// Control text echoed back by the remote.
    Control,
    Progress(Progress),
}

pub fn classify(payload: &str) -> FdmResult<Inbound> {
    let trimmed = payload.trim();
    if trimmed.is_empty() || trimmed == CONNECTION_ENDED {
        return Ok(Inbound::Ended);
    }
    if trimmed == HANDSHAKE || trimmed == CLOSE {
        return Ok(Inbound::Control);
    }
    decode(trimmed).map(Inbound::Progress)
}
