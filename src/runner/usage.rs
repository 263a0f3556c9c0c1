//! Best-effort extraction of cost and token usage from agent output.
//!
//! The agent CLI prints a final stream-json line of the form
//! `{"type":"result","total_cost_usd":0.12,"usage":{"input_tokens":..,"output_tokens":..}}`.
//! When that line is missing or malformed the usage falls back to zero and
//! `parsed` is false; the fork outcome is never affected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cost and token accounting reported by one agent invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    /// Cost in USD.
    pub cost_usd: f64,
    /// Input tokens, including cache reads and writes.
    pub input_tokens: u64,
    /// Output tokens.
    pub output_tokens: u64,
    /// Whether a usage marker was actually found.
    pub parsed: bool,
}

impl AgentUsage {
    /// Adds another invocation's usage to this one.
    pub fn accumulate(&mut self, other: &AgentUsage) {
        self.cost_usd += other.cost_usd;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.parsed |= other.parsed;
    }
}

fn as_u64(value: Option<&Value>) -> u64 {
    value.and_then(Value::as_u64).unwrap_or(0)
}

/// Parses one line; returns usage only if it is a result marker.
fn parse_result_line(line: &str) -> Option<AgentUsage> {
    let json: Value = serde_json::from_str(line.trim()).ok()?;
    if json.get("type").and_then(Value::as_str) != Some("result") {
        return None;
    }

    let cost_usd = json
        .get("total_cost_usd")
        .or_else(|| json.get("cost_usd"))
        .and_then(Value::as_f64)
        .filter(|cost| cost.is_finite() && *cost >= 0.0)?;

    let usage = json.get("usage");
    let field = |name: &str| as_u64(usage.and_then(|u| u.get(name)));

    Some(AgentUsage {
        cost_usd,
        input_tokens: field("input_tokens")
            + field("cache_creation_input_tokens")
            + field("cache_read_input_tokens"),
        output_tokens: field("output_tokens"),
        parsed: true,
    })
}

/// Extracts usage from the agent's stdout, scanning from the last line backwards.
pub fn parse_usage(stdout: &str) -> AgentUsage {
    match stdout.lines().rev().find_map(parse_result_line) {
        Some(usage) => usage,
        None => {
            tracing::warn!("agent output carried no usable result marker, recording zero cost");
            AgentUsage::default()
        }
    }
}
