//! Post-solve metrics: member lengths, axial forces, anchor reactions.
//!
//! Forces are computed from the stored edge index pairs.  Reactions take a
//! separate path: they re-derive which segments touch each anchor from the
//! live segment geometry using the network tolerance, so they stay a
//! cross-check that does not depend on the topology bookkeeping.

use crate::topology::Network;
use crate::types::{distance, norm, sub, Point3, LENGTH_EPSILON};

/// Current length of every edge, from node coordinates and index pairs.
pub fn lengths(network: &Network) -> Vec<f64> {
    let nodes = network.nodes();
    network
        .edges()
        .iter()
        .map(|e| norm(sub(nodes[e.end].position, nodes[e.start].position)))
        .collect()
}

/// Axial force `q × length` of every edge for the presently stored geometry.
pub fn forces(network: &Network) -> Vec<f64> {
    lengths(network)
        .into_iter()
        .zip(network.edges())
        .map(|(len, e)| e.force_density * len)
        .collect()
}

/// Reaction vector at each fixed node, in fixed index-list order.
///
/// A segment starting at the anchor contributes `−force · û`, one ending at
/// it contributes `+force · û`, with `û` the unit vector from segment start
/// to end and `force = q × length`.
pub fn reactions(network: &Network) -> Vec<Point3> {
    let tol = network.tolerance();
    let nodes = network.nodes();
    let segments = network.segments();
    let q = network.force_densities();

    network
        .fixed_indices()
        .iter()
        .map(|&node| {
            let anchor = nodes[node].position;
            let mut r = [0.0; 3];
            for (seg, &qk) in segments.iter().zip(&q) {
                let v = seg.vector();
                let len = norm(v);
                if len < LENGTH_EPSILON {
                    continue;
                }
                let force = qk * len;
                let at_start = distance(seg.start, anchor) < tol;
                let at_end = distance(seg.end, anchor) < tol;
                for d in 0..3 {
                    let component = force * v[d] / len;
                    if at_start {
                        r[d] -= component;
                    }
                    if at_end {
                        r[d] += component;
                    }
                }
            }
            r
        })
        .collect()
}
