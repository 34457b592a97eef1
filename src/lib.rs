//! Concurrent lazy skip-list set with swappable safe-memory-reclamation
//! schemes.
//!
//! The set itself is the lazy skip list of Herlihy, Lev, Luchangco and
//! Shavit. What varies is how removed nodes get their memory back:
//!
//! * **pure** - never reclaimed; the baseline every scheme is measured
//!   against.
//! * **hazard pointers** - each traversal step publishes the pointer it is
//!   about to chase; reclaimers free only what no record names.
//! * **stack-track** - traversals run as short, adaptively sized hardware
//!   transactions and fall back to hazard pointers when transactions keep
//!   aborting; reclaimers additionally scan each thread's tracked pointer
//!   windows.
//! * **forkscan** - reclamation is delegated to an external
//!   conservative-scan collector.
//!
//! See [`skiplist::SkipList`] for the operations and [`stacktrack::StThread`]
//! for the per-thread reclamation state a worker registers before touching
//! the set.

pub mod atomics;
pub mod forkscan;
pub mod htm;
pub mod skiplist;
pub mod stacktrack;

pub use skiplist::SkipList;
pub use stacktrack::StThread;

/// Reclamation scheme selector, matching the benchmark's `--alg-type` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgType {
    Pure = 0,
    HazardPointers = 1,
    StackTrack = 2,
    Forkscan = 3,
}

impl AlgType {
    pub fn from_code(code: i32) -> Option<AlgType> {
        match code {
            0 => Some(AlgType::Pure),
            1 => Some(AlgType::HazardPointers),
            2 => Some(AlgType::StackTrack),
            3 => Some(AlgType::Forkscan),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AlgType::Pure => "pure",
            AlgType::HazardPointers => "hazard pointers",
            AlgType::StackTrack => "stack-track",
            AlgType::Forkscan => "forkscan",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alg_type_codes_round_trip() {
        for code in 0..4 {
            let alg = AlgType::from_code(code).expect("valid code rejected");
            assert_eq!(alg as i32, code);
        }
        assert_eq!(AlgType::from_code(4), None);
        assert_eq!(AlgType::from_code(-1), None);
    }
}
