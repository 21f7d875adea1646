#![allow(missing_docs)]

mod checks;
mod config;
mod engine;
mod stats;

pub use checks::{verify_burst, verify_pair, verify_pingpong, CheckResult};
pub use config::ScenarioKind;
pub use engine::{RankScenario, HANDLE_TAG};
pub use stats::{ArcStatsSink, ScenarioStats, StatsSink};

/// Bytes rank `rank` writes into its partner's landing region.
pub fn expected_payload(rank: usize, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (rank.wrapping_mul(31).wrapping_add(i) & 0xff) as u8)
        .collect()
}

/// Utility to update stats counters with wrapping arithmetic.
#[inline]
fn wrapping_add(base: u32, delta: u32) -> u32 {
    base.wrapping_add(delta)
}
