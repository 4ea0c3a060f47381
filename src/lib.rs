#![forbid(unsafe_code)]
//! coplace: multi-query merging and operator placement for a stream
//! processing coordinator.
//!
//! Re-exports the workspace crates:
//! - [`coplace_core`]: ids, operator arena, query plans, signatures, configuration.
//! - [`coplace_topology`]: worker topology, slot accounting, path queries.
//! - [`coplace_planner`]: shared and global query plans, merger rules, YAML DSL.
//! - [`coplace_placement`]: execution plan and placement strategies.
//! - [`coplace_exec`]: worker RPC, deployment phases and the [`Coordinator`].

pub use coplace_core;
pub use coplace_exec;
pub use coplace_placement;
pub use coplace_planner;
pub use coplace_topology;

pub use coplace_core::config::CoordinatorConfig;
pub use coplace_exec::Coordinator;
