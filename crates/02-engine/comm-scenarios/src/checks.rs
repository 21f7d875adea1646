use crate::config::ScenarioKind;
use crate::stats::ScenarioStats;

pub type CheckResult = Result<(), String>;

fn verify_common(label: &str, stats: &ScenarioStats) -> CheckResult {
    if !stats.finished {
        return Err(format!("{label} did not finish"));
    }
    if stats.corrupt_payloads != 0 {
        return Err(format!(
            "{label} saw {} corrupt payloads",
            stats.corrupt_payloads
        ));
    }
    if stats.local_completions != stats.puts_issued {
        return Err(format!(
            "{label} completed {} of {} puts locally",
            stats.local_completions, stats.puts_issued
        ));
    }
    Ok(())
}

pub fn verify_pingpong(
    initiator: &ScenarioStats,
    responder: &ScenarioStats,
    rounds: u32,
    bytes: usize,
) -> CheckResult {
    verify_common("initiator", initiator)?;
    verify_common("responder", responder)?;
    for (label, stats) in [("initiator", initiator), ("responder", responder)] {
        if stats.puts_issued != rounds {
            return Err(format!(
                "{label} issued {} puts (expected {rounds})",
                stats.puts_issued
            ));
        }
        if stats.remote_completions != rounds {
            return Err(format!(
                "{label} observed {} arrivals (expected {rounds})",
                stats.remote_completions
            ));
        }
        if stats.bytes_sent != rounds as u64 * bytes as u64 {
            return Err(format!(
                "{label} sent {} bytes (expected {})",
                stats.bytes_sent,
                rounds as u64 * bytes as u64
            ));
        }
    }
    Ok(())
}

pub fn verify_burst(
    sender: &ScenarioStats,
    receiver: &ScenarioStats,
    transfers: u32,
    dynamic_slots: usize,
) -> CheckResult {
    verify_common("sender", sender)?;
    verify_common("receiver", receiver)?;
    if sender.puts_issued != transfers {
        return Err(format!(
            "sender issued {} puts (expected {transfers})",
            sender.puts_issued
        ));
    }
    if receiver.remote_completions != transfers {
        return Err(format!(
            "receiver observed {} arrivals (expected {transfers})",
            receiver.remote_completions
        ));
    }
    if transfers as usize > dynamic_slots && sender.overflow_waits == 0 {
        return Err(format!(
            "{transfers} puts over {dynamic_slots} slots never overflowed"
        ));
    }
    Ok(())
}

/// Checks one `(even, odd)` rank pair against its scenario.
pub fn verify_pair(
    kind: ScenarioKind,
    even: &ScenarioStats,
    odd: &ScenarioStats,
    dynamic_slots: usize,
) -> CheckResult {
    match kind {
        ScenarioKind::PingPong { rounds, bytes } => verify_pingpong(even, odd, rounds, bytes),
        ScenarioKind::Burst { transfers, .. } => verify_burst(even, odd, transfers, dynamic_slots),
    }
}
