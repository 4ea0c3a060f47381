//! Strongly-typed identifiers used across the coordinator.
//!
//! Downstream crates should *not* use raw integers for ids. Id `0` is reserved
//! as the invalid id for every kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! new_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const INVALID: Self = Self(0);

            pub const fn new(v: u64) -> Self {
                Self(v)
            }
            pub const fn get(self) -> u64 {
                self.0
            }
            pub const fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

/// Adds a process-wide `next()` allocator to an id type.
macro_rules! id_allocator {
    ($name:ident, $counter:ident) => {
        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            /// Allocate a fresh id, unique within this process.
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }
        }
    };
}

new_id!(OperatorId);
new_id!(QueryId);
new_id!(SharedQueryId);
new_id!(TopologyNodeId);
new_id!(SubPlanId);

id_allocator!(OperatorId, NEXT_OPERATOR_ID);
id_allocator!(SharedQueryId, NEXT_SHARED_QUERY_ID);
id_allocator!(SubPlanId, NEXT_SUB_PLAN_ID);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocated_ids_are_valid_and_distinct() {
        let a = OperatorId::next();
        let b = OperatorId::next();
        assert!(a.is_valid());
        assert_ne!(a, b);
        assert!(!SharedQueryId::INVALID.is_valid());
    }

    #[test]
    fn test_display_names_the_kind() {
        assert_eq!(QueryId::new(7).to_string(), "QueryId(7)");
    }
}
