#![forbid(unsafe_code)]
//! coplace-topology: the cluster graph that placement maps operators onto.
//!
//! Each node owns a bounded number of operator slots. The slot counter is the
//! only piece of topology state mutated by concurrent placements, so it is an
//! atomic counter updated with a compare-and-swap loop; structural changes
//! (adding nodes/links) happen through `&mut Topology` before the graph is
//! shared behind an `Arc`.

pub mod catalog;
pub mod error;
pub mod slots;
pub mod topology;

pub use catalog::SourceCatalog;
pub use error::{Result, TopologyError};
pub use slots::SlotCounter;
pub use topology::{LinkProperty, Topology, TopologyDescriptor, TopologyNode};
