//! Topology builder: raw segments + anchor points → deduplicated node graph.
//!
//! Endpoints are merged when they lie strictly closer than the network
//! tolerance.  Lookup goes through a uniform spatial hash whose cell size
//! equals the tolerance, so every candidate within range sits in the 27-cell
//! neighbourhood of the query point.
//!
//! Tie-break rule: when several existing nodes are within tolerance the
//! closest one is reused; on an exact distance tie the lowest index (the
//! first-seen node) wins.  Reuse of an existing node always takes precedence
//! over anchor classification, which only happens when a node is created.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::types::{
    broadcast_force_densities, distance, Edge, FdmError, FdmResult, Node, Point3, Segment,
    DEFAULT_FORCE_DENSITY, MIN_ANCHORS,
};

// ─────────────────────────────────────────────────────────────
//  Spatial hash
// ─────────────────────────────────────────────────────────────

type CellKey = (i64, i64, i64);

/// Uniform grid of point indices, queried for the closest point within a
/// radius.
#[derive(Debug)]
pub struct PointGrid {
    inv_cell_size: f64,
    cells: HashMap<CellKey, Vec<usize>>,
    points: Vec<Point3>,
}

impl PointGrid {
    pub fn new(cell_size: f64) -> Self {
        Self {
            inv_cell_size: 1.0 / cell_size,
            cells: HashMap::new(),
            points: Vec::new(),
        }
    }

    pub fn from_points(cell_size: f64, points: &[Point3]) -> Self {
        let mut grid = Self::new(cell_size);
        for &p in points {
            grid.insert(p);
        }
        grid
    }

    fn cell_key(&self, p: Point3) -> CellKey {
        (
            (p[0] * self.inv_cell_size).floor() as i64,
            (p[1] * self.inv_cell_size).floor() as i64,
            (p[2] * self.inv_cell_size).floor() as i64,
        )
    }

    /// Add a point; returns its index.
    pub fn insert(&mut self, p: Point3) -> usize {
        let index = self.points.len();
        let key = self.cell_key(p);
        self.cells.entry(key).or_default().push(index);
        self.points.push(p);
        index
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point3] {
        &self.points
    }

    /// Closest stored point with distance strictly below `radius`.
    pub fn closest_within(&self, p: Point3, radius: f64) -> Option<usize> {
        let (cx, cy, cz) = self.cell_key(p);
        let mut best: Option<(usize, f64)> = None;
        for dx in -1..=1_i64 {
            for dy in -1..=1_i64 {
                for dz in -1..=1_i64 {
                    let key = (cx.saturating_add(dx), cy.saturating_add(dy), cz.saturating_add(dz));
                    let Some(bucket) = self.cells.get(&key) else {
                        continue;
                    };
                    for &i in bucket {
                        let d = distance(self.points[i], p);
                        if d >= radius {
                            continue;
                        }
                        best = match best {
                            Some((j, dj)) if dj < d || (dj == d && j < i) => Some((j, dj)),
                            _ => Some((i, d)),
                        };
                    }
                }
            }
        }
        best.map(|(i, _)| i)
    }
}

// ─────────────────────────────────────────────────────────────
//  Network
// ─────────────────────────────────────────────────────────────

/// A topologised FDM network.
///
/// Owns the raw inputs (segments, anchors, force densities, tolerance) and
/// the derived node list, edge index pairs and free/fixed partitions.
#[derive(Debug, Clone)]
pub struct Network {
    segments: Vec<Segment>,
    anchors: Vec<Point3>,
    tolerance: f64,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    free: Vec<usize>,
    fixed: Vec<usize>,
    valid: bool,
}

impl Network {
    /// Topologise and validate.
    ///
    /// `force_densities` may hold one value per segment or a single value to
    /// broadcast.
    pub fn build(
        segments: Vec<Segment>,
        anchors: Vec<Point3>,
        force_densities: &[f64],
        tolerance: f64,
    ) -> FdmResult<Self> {
        let network = Self::topologize(segments, anchors, force_densities, tolerance)?;
        network.validate()?;
        Ok(network)
    }

    /// Build with the same force density on every edge.
    pub fn uniform(segments: Vec<Segment>, anchors: Vec<Point3>, q: f64, tolerance: f64) -> FdmResult<Self> {
        Self::build(segments, anchors, &[q], tolerance)
    }

    /// Build with the default force density on every edge.
    pub fn with_default_q(segments: Vec<Segment>, anchors: Vec<Point3>, tolerance: f64) -> FdmResult<Self> {
        Self::uniform(segments, anchors, DEFAULT_FORCE_DENSITY, tolerance)
    }

    /// Derive the topology without validating it.  The result carries an
    /// `is_valid` flag; `validate` reports why an invalid network failed.
    pub fn topologize(
        segments: Vec<Segment>,
        anchors: Vec<Point3>,
        force_densities: &[f64],
        tolerance: f64,
    ) -> FdmResult<Self> {
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return Err(FdmError::Topology(format!(
                "tolerance must be positive and finite, got {tolerance}"
            )));
        }
        let q = broadcast_force_densities(force_densities, segments.len())?;

        let anchor_grid = PointGrid::from_points(tolerance, &anchors);
        let mut node_grid = PointGrid::new(tolerance);
        let mut nodes: Vec<Node> = Vec::new();
        let mut free = Vec::new();
        let mut fixed = Vec::new();
        let mut edges = Vec::with_capacity(segments.len());

        let mut resolve = |p: Point3| -> usize {
            if let Some(existing) = node_grid.closest_within(p, tolerance) {
                return existing;
            }
            let index = node_grid.insert(p);
            let is_anchor = anchor_grid.closest_within(p, tolerance).is_some();
            if is_anchor {
                fixed.push(index);
            } else {
                free.push(index);
            }
            nodes.push(Node { index, position: p, free: !is_anchor });
            index
        };

        for (k, seg) in segments.iter().enumerate() {
            let start = resolve(seg.start);
            let end = resolve(seg.end);
            if start == end {
                warn!(edge = k, node = start, "edge endpoints collapse onto one node");
            }
            edges.push(Edge { start, end, force_density: q[k] });
        }

        let mut network = Self {
            segments,
            anchors,
            tolerance,
            nodes,
            edges,
            free,
            fixed,
            valid: false,
        };
        network.valid = network.validate().is_ok();

        debug!(
            nodes = network.num_nodes(),
            edges = network.num_edges(),
            free = network.free.len(),
            fixed = network.fixed.len(),
            valid = network.valid,
            "topologised network"
        );
        Ok(network)
    }

    /// Re-derive the topology from the stored raw inputs.
    pub fn rebuild(&self) -> FdmResult<Self> {
        Self::topologize(
            self.segments.clone(),
            self.anchors.clone(),
            &self.force_densities(),
            self.tolerance,
        )
    }

    /// Same topology with new node coordinates and force densities.
    ///
    /// Edge index pairs and the free/fixed partition are kept; segments are
    /// rebuilt as straight lines between the updated endpoints.
    pub fn with_geometry(&self, positions: &[Point3], force_densities: &[f64]) -> FdmResult<Self> {
        if positions.len() != self.num_nodes() {
            return Err(FdmError::ArityMismatch {
                what: "node positions",
                found: positions.len(),
                expected: self.num_nodes(),
            });
        }
        let q = broadcast_force_densities(force_densities, self.num_edges())?;

        let nodes = self
            .nodes
            .iter()
            .map(|n| Node { position: positions[n.index], ..*n })
            .collect();
        let edges: Vec<Edge> = self
            .edges
            .iter()
            .zip(&q)
            .map(|(e, &qk)| Edge { force_density: qk, ..*e })
            .collect();
        let segments = edges
            .iter()
            .map(|e| Segment::new(positions[e.start], positions[e.end]))
            .collect();

        Ok(Self {
            segments,
            anchors: self.anchors.clone(),
            tolerance: self.tolerance,
            nodes,
            edges,
            free: self.free.clone(),
            fixed: self.fixed.clone(),
            valid: self.valid,
        })
    }

    // ── Validation ──────────────────────────────────────────

    /// At least `MIN_ANCHORS` anchors.
    pub fn anchor_check(&self) -> bool {
        self.anchors.len() >= MIN_ANCHORS
    }

    /// Every anchor captured exactly one node and the partitions cover all
    /// nodes.
    pub fn partition_check(&self) -> bool {
        self.fixed.len() == self.anchors.len() && self.fixed.len() + self.free.len() == self.num_nodes()
    }

    /// Every segment resolved to a valid index pair.
    pub fn index_check(&self) -> bool {
        let nn = self.num_nodes();
        self.edges.len() == self.segments.len() && self.edges.iter().all(|e| e.start < nn && e.end < nn)
    }

    pub fn validate(&self) -> FdmResult<()> {
        if !self.anchor_check() {
            return Err(FdmError::InsufficientAnchors {
                found: self.anchors.len(),
                required: MIN_ANCHORS,
            });
        }
        if !self.partition_check() {
            return Err(FdmError::Topology(format!(
                "{} anchors matched {} fixed nodes ({} free, {} total)",
                self.anchors.len(),
                self.fixed.len(),
                self.free.len(),
                self.num_nodes()
            )));
        }
        if !self.index_check() {
            return Err(FdmError::Topology(format!(
                "{} segments resolved to {} index pairs",
                self.segments.len(),
                self.edges.len()
            )));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    // ── Accessors ───────────────────────────────────────────

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn anchors(&self) -> &[Point3] {
        &self.anchors
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Free node indices in first-seen order.
    pub fn free_indices(&self) -> &[usize] {
        &self.free
    }

    /// Fixed node indices in first-seen order.
    pub fn fixed_indices(&self) -> &[usize] {
        &self.fixed
    }

    pub fn positions(&self) -> Vec<Point3> {
        self.nodes.iter().map(|n| n.position).collect()
    }

    pub fn indices(&self) -> Vec<(usize, usize)> {
        self.edges.iter().map(Edge::indices).collect()
    }

    pub fn force_densities(&self) -> Vec<f64> {
        self.edges.iter().map(|e| e.force_density).collect()
    }
}
