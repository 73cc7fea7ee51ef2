//! **formfind** — Force Density Method form finding with a remote optimisation protocol.
//!
//! 1. **Topology** (`topology`): segments + anchors → deduplicated node graph, free/fixed split.
//! 2. **Assembly** (`assembly`): incidence matrix, `Cn`/`Cf` partitions, `Q`, `XYZf`.
//! 3. **Equilibrium** (`fdm`): A = Cnᵀ Q Cn, sparse Cholesky, free-node solve.
//! 4. **Metrics** (`analysis`): member lengths, forces, anchor reactions.
//! 5. **Objectives / gradients** (`objectives`, `gradients`): losses and adjoint dLoss/dq.
//! 6. **Protocol** (`protocol`): JSON request / progress codec.
//! 7. **Session** (`session`): connection state machine over a caller-supplied channel.
//! 8. **Optimiser** (`optimizer`): in-process L-BFGS speaking the remote side of the protocol.
//! 9. **Config** (`config`): TOML settings.

pub mod types;
pub mod topology;
pub mod assembly;
pub mod fdm;
pub mod analysis;
pub mod objectives;
pub mod gradients;
pub mod protocol;
pub mod session;
pub mod optimizer;
pub mod config;

pub use topology::Network;
pub use types::{FdmError, FdmResult, Point3, Segment};
