//! System assembly: incidence matrix, free/fixed column partitions, Q, XYZf.
//!
//! Column order of `Cn` / `Cf` follows the free / fixed index lists of the
//! network (first-seen order), not raw node index order.  Every downstream
//! row ordering (loads, solved positions, reactions) inherits it.

use ndarray::Array2;
use sprs::{CsMat, TriMat};
use tracing::debug;

use crate::topology::Network;
use crate::types::{broadcast_force_densities, FdmError, FdmResult, Point3};

// ─────────────────────────────────────────────────────────────
//  Linear problem
// ─────────────────────────────────────────────────────────────

/// Read-only view of the FDM system for one solve.
#[derive(Debug, Clone)]
pub struct LinearProblem {
    /// Full incidence matrix C (ne × nn) with ±1 entries.
    pub incidence: CsMat<f64>,
    /// Edge `(start, end)` node pairs, 0-based.
    pub edges: Vec<(usize, usize)>,
    /// Cn (ne × nn_free)
    pub free_incidence: CsMat<f64>,
    /// Cf (ne × nn_fixed)
    pub fixed_incidence: CsMat<f64>,
    /// Q = diag(q) (ne × ne)
    pub force_density_matrix: CsMat<f64>,
    pub force_densities: Vec<f64>,
    /// XYZf (nn_fixed × 3), rows in fixed index-list order.
    pub fixed_positions: Array2<f64>,
    pub free_node_indices: Vec<usize>,
    pub fixed_node_indices: Vec<usize>,
    pub num_edges: usize,
    pub num_nodes: usize,
}

impl LinearProblem {
    /// Assemble from a network using its own force densities.
    pub fn from_network(network: &Network) -> FdmResult<Self> {
        assemble(network, &network.force_densities())
    }

    /// Assemble from raw topology.
    ///
    /// `positions` holds all `num_nodes` coordinates; only the fixed rows are
    /// read.  `force_densities` may be a single broadcast value.
    pub fn from_parts(
        num_nodes: usize,
        edges: &[(usize, usize)],
        free_node_indices: Vec<usize>,
        fixed_node_indices: Vec<usize>,
        positions: &[Point3],
        force_densities: &[f64],
    ) -> FdmResult<Self> {
        if let Some(&(s, e)) = edges.iter().find(|&&(s, e)| s >= num_nodes || e >= num_nodes) {
            return Err(FdmError::Topology(format!(
                "edge ({s}, {e}) references a node outside [0, {num_nodes})"
            )));
        }
        if free_node_indices.len() + fixed_node_indices.len() != num_nodes {
            return Err(FdmError::Topology(format!(
                "{} free + {} fixed indices do not cover {num_nodes} nodes",
                free_node_indices.len(),
                fixed_node_indices.len()
            )));
        }
        if let Some(&bad) = free_node_indices
            .iter()
            .chain(&fixed_node_indices)
            .find(|&&i| i >= num_nodes)
        {
            return Err(FdmError::Topology(format!("node index {bad} out of range")));
        }
        if positions.len() != num_nodes {
            return Err(FdmError::ArityMismatch {
                what: "node positions",
                found: positions.len(),
                expected: num_nodes,
            });
        }
        let q = broadcast_force_densities(force_densities, edges.len())?;

        let incidence = incidence_matrix(num_nodes, edges);
        let free_incidence = extract_columns(&incidence, &free_node_indices);
        let fixed_incidence = extract_columns(&incidence, &fixed_node_indices);
        let force_density_matrix = diagonal(&q);

        let mut fixed_positions = Array2::zeros((fixed_node_indices.len(), 3));
        for (row, &node) in fixed_node_indices.iter().enumerate() {
            for d in 0..3 {
                fixed_positions[[row, d]] = positions[node][d];
            }
        }

        debug!(
            edges = edges.len(),
            nodes = num_nodes,
            free = free_node_indices.len(),
            fixed = fixed_node_indices.len(),
            "assembled linear problem"
        );

        Ok(Self {
            incidence,
            edges: edges.to_vec(),
            free_incidence,
            fixed_incidence,
            force_density_matrix,
            force_densities: q,
            fixed_positions,
            free_node_indices,
            fixed_node_indices,
            num_edges: edges.len(),
            num_nodes,
        })
    }

    /// Same topology with `Q` replaced.
    pub fn with_force_densities(&self, force_densities: &[f64]) -> FdmResult<Self> {
        let q = broadcast_force_densities(force_densities, self.num_edges)?;
        Ok(Self {
            force_density_matrix: diagonal(&q),
            force_densities: q,
            ..self.clone()
        })
    }

    pub fn num_free(&self) -> usize {
        self.free_node_indices.len()
    }

    pub fn num_fixed(&self) -> usize {
        self.fixed_node_indices.len()
    }
}

/// Build the linear problem for `network` with the given force densities.
pub fn assemble(network: &Network, force_densities: &[f64]) -> FdmResult<LinearProblem> {
    if force_densities.len() != network.num_edges() {
        return Err(FdmError::ArityMismatch {
            what: "force densities",
            found: force_densities.len(),
            expected: network.num_edges(),
        });
    }
    LinearProblem::from_parts(
        network.num_nodes(),
        &network.indices(),
        network.free_indices().to_vec(),
        network.fixed_indices().to_vec(),
        &network.positions(),
        force_densities,
    )
}

// ─────────────────────────────────────────────────────────────
//  Sparse builders
// ─────────────────────────────────────────────────────────────

/// Oriented incidence matrix (ne × nn): −1 at each edge's start column, +1 at
/// its end column.
pub fn incidence_matrix(num_nodes: usize, edges: &[(usize, usize)]) -> CsMat<f64> {
    let mut tri = TriMat::new((edges.len(), num_nodes));
    for (e, &(s, t)) in edges.iter().enumerate() {
        tri.add_triplet(e, s, -1.0);
        tri.add_triplet(e, t, 1.0);
    }
    tri.to_csc()
}

/// Select columns of `mat` in the order given by `cols`.
pub fn extract_columns(mat: &CsMat<f64>, cols: &[usize]) -> CsMat<f64> {
    let mat_csc = mat.to_csc();
    let mut tri = TriMat::new((mat_csc.rows(), cols.len()));
    for (new_col, &old_col) in cols.iter().enumerate() {
        let start = mat_csc.indptr().raw_storage()[old_col];
        let end_ = mat_csc.indptr().raw_storage()[old_col + 1];
        for nz in start..end_ {
            tri.add_triplet(mat_csc.indices()[nz], new_col, mat_csc.data()[nz]);
        }
    }
    tri.to_csc()
}

/// Sparse diagonal matrix with `values` on the diagonal.
pub fn diagonal(values: &[f64]) -> CsMat<f64> {
    let n = values.len();
    let mut tri = TriMat::new((n, n));
    for (i, &v) in values.iter().enumerate() {
        tri.add_triplet(i, i, v);
    }
    tri.to_csc()
}

/// Load matrix P (nn_free × 3).  A single load vector is applied to every
/// free node; otherwise there must be one load per free node.
pub fn load_matrix(loads: &[Point3], num_free: usize) -> FdmResult<Array2<f64>> {
    let mut p = Array2::zeros((num_free, 3));
    match loads.len() {
        1 => {
            for i in 0..num_free {
                for d in 0..3 {
                    p[[i, d]] = loads[0][d];
                }
            }
        }
        n if n == num_free => {
            for (i, load) in loads.iter().enumerate() {
                for d in 0..3 {
                    p[[i, d]] = load[d];
                }
            }
        }
        n => {
            return Err(FdmError::ArityMismatch {
                what: "loads",
                found: n,
                expected: num_free,
            })
        }
    }
    Ok(p)
}
