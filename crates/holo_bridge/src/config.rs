//! Runtime knobs for the bridge core.

use anyhow::{Context, Result};

/// Tunables shared by every session of one process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Estimated buffered bytes at which `maybe_flush` issues a round trip.
    pub batch_flush_bytes: usize,
    /// Hard cap on bytes copied into the batching arena between flushes.
    pub arena_capacity_bytes: usize,
    /// Rows requested per cursor fetch.
    pub scan_batch_rows: usize,
    /// Maximum ranges handled by one multi-range read round.
    pub mrr_max_ranges_per_round: usize,
    /// Ids reserved per auto-increment / hidden-key range refill.
    pub auto_increment_prefetch: u64,
    /// When `false`, the first per-row error in a flush aborts the transaction.
    pub per_row_error_tolerance: bool,
    /// Report cursors left open at commit as `CursorLeak` instead of closing them.
    pub strict_cursor_accounting: bool,
    /// Pick transaction coordinators from partition hints.
    pub use_partition_hints: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            batch_flush_bytes: 32 * 1024,
            arena_capacity_bytes: 4 * 1024 * 1024,
            scan_batch_rows: 64,
            mrr_max_ranges_per_round: 256,
            auto_increment_prefetch: 32,
            per_row_error_tolerance: true,
            strict_cursor_accounting: cfg!(debug_assertions),
            use_partition_hints: true,
        }
    }
}

impl BridgeConfig {
    /// Loads configuration from `HOLO_BRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        // Decision: zero sizes would stall batching and paging, so clamp to 1.
        let batch_flush_bytes = parse_usize(
            std::env::var("HOLO_BRIDGE_BATCH_FLUSH_BYTES").ok(),
            defaults.batch_flush_bytes,
        )?
        .max(1);
        let arena_capacity_bytes = parse_usize(
            std::env::var("HOLO_BRIDGE_ARENA_CAPACITY_BYTES").ok(),
            defaults.arena_capacity_bytes,
        )?
        .max(1);
        let scan_batch_rows = parse_usize(
            std::env::var("HOLO_BRIDGE_SCAN_BATCH_ROWS").ok(),
            defaults.scan_batch_rows,
        )?
        .max(1);
        let mrr_max_ranges_per_round = parse_usize(
            std::env::var("HOLO_BRIDGE_MRR_MAX_RANGES_PER_ROUND").ok(),
            defaults.mrr_max_ranges_per_round,
        )?
        .max(1);
        let auto_increment_prefetch = parse_u64(
            std::env::var("HOLO_BRIDGE_AUTO_INC_PREFETCH").ok(),
            defaults.auto_increment_prefetch,
        )?
        .max(1);
        let per_row_error_tolerance = parse_bool(
            std::env::var("HOLO_BRIDGE_ROW_ERROR_TOLERANCE").ok(),
            defaults.per_row_error_tolerance,
        )?;
        let strict_cursor_accounting = parse_bool(
            std::env::var("HOLO_BRIDGE_STRICT_CURSOR_ACCOUNTING").ok(),
            defaults.strict_cursor_accounting,
        )?;
        let use_partition_hints = parse_bool(
            std::env::var("HOLO_BRIDGE_USE_PARTITION_HINTS").ok(),
            defaults.use_partition_hints,
        )?;

        Ok(Self {
            batch_flush_bytes,
            arena_capacity_bytes,
            scan_batch_rows,
            mrr_max_ranges_per_round,
            auto_increment_prefetch,
            per_row_error_tolerance,
            strict_cursor_accounting,
            use_partition_hints,
        })
    }
}

/// Parses an optional `usize` with fallback default.
fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

/// Parses an optional `u64` with fallback default.
fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}

/// Parses an optional boolean flag (`true/false`, `1/0`, `yes/no`, `on/off`).
fn parse_bool(value: Option<String>, default_value: bool) -> Result<bool> {
    let Some(raw) = value else {
        return Ok(default_value);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!("invalid boolean value: {raw}")),
    }
}
