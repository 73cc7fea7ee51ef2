use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Topology, assembly and solve errors propagate synchronously to the caller.
/// `ProtocolDecode` is produced by the codec but swallowed by the session,
/// which treats undecodable payloads as channel noise.
#[derive(Debug, Error)]
pub enum FdmError {
    /// Too few anchors to pin the network.
    #[error("insufficient anchors: {found} given, at least {required} required")]
    InsufficientAnchors { found: usize, required: usize },

    /// Unresolved endpoint or broken free/fixed bookkeeping.
    #[error("topology error: {0}")]
    Topology(String),

    /// A per-edge or per-node list has the wrong length.
    #[error("arity mismatch: {what} has length {found}, expected {expected}")]
    ArityMismatch {
        what: &'static str,
        found: usize,
        expected: usize,
    },

    /// The reduced system `Cnᵀ Q Cn` is not positive definite.
    #[error("singular system: {0}")]
    SingularSystem(String),

    /// Inbound payload could not be decoded.
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    /// Operation attempted on a closed session.
    #[error("channel closed")]
    ChannelClosed,

    /// Problem sent before the channel acknowledged the connection.
    #[error("session not connected (state: {0:?})")]
    NotConnected(crate::session::SessionState),

    /// Host/port pair does not form a usable connection string.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Reference optimiser failure.
    #[error("solver error: {0}")]
    Solver(String),

    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<sprs::errors::LinalgError> for FdmError {
    fn from(e: sprs::errors::LinalgError) -> Self {
        Self::SingularSystem(e.to_string())
    }
}

impl From<argmin::core::Error> for FdmError {
    fn from(e: argmin::core::Error) -> Self {
        Self::Solver(e.to_string())
    }
}

impl From<serde_json::Error> for FdmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ProtocolDecode(e.to_string())
    }
}

pub type FdmResult<T> = Result<T, FdmError>;

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

/// Minimum anchor count accepted by network validation.
pub const MIN_ANCHORS: usize = 2;

/// Force density assigned to every edge when none is given.
pub const DEFAULT_FORCE_DENSITY: f64 = 1.0;

/// Default deduplication tolerance.
pub const DEFAULT_TOLERANCE: f64 = 0.1;

/// Edges shorter than this have no defined direction.
pub const LENGTH_EPSILON: f64 = 1e-12;

// ─────────────────────────────────────────────────────────────
//  Geometry primitives
// ─────────────────────────────────────────────────────────────

pub type Point3 = [f64; 3];

#[inline]
pub fn sub(a: Point3, b: Point3) -> Point3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn norm(v: Point3) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

#[inline]
pub fn distance(a: Point3, b: Point3) -> f64 {
    norm(sub(a, b))
}

/// Straight line between two points; the raw input unit of a network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: Point3,
    pub end: Point3,
}

impl Segment {
    pub fn new(start: Point3, end: Point3) -> Self {
        Self { start, end }
    }

    /// Vector from start to end.
    pub fn vector(&self) -> Point3 {
        sub(self.end, self.start)
    }

    pub fn length(&self) -> f64 {
        norm(self.vector())
    }
}

// ─────────────────────────────────────────────────────────────
//  Network elements
// ─────────────────────────────────────────────────────────────

/// A deduplicated network node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Node {
    /// Position in `[0, Nn)`, stable for the lifetime of the network.
    pub index: usize,
    pub position: Point3,
    /// `false` for anchor (fixed) nodes.
    pub free: bool,
}

/// An edge between two node indices.  Start contributes −1 to its incidence
/// row, end contributes +1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub start: usize,
    pub end: usize,
    pub force_density: f64,
}

impl Edge {
    pub fn indices(&self) -> (usize, usize) {
        (self.start, self.end)
    }
}

/// Expand a force-density list to one value per edge.  A single value is
/// broadcast; any other length must equal `num_edges`.
pub fn broadcast_force_densities(q: &[f64], num_edges: usize) -> FdmResult<Vec<f64>> {
    match q.len() {
        1 => Ok(vec![q[0]; num_edges]),
        n if n == num_edges => Ok(q.to_vec()),
        n => Err(FdmError::ArityMismatch {
            what: "force densities",
            found: n,
            expected: num_edges,
        }),
    }
}
