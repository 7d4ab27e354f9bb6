use std::path::PathBuf;

use anyhow::{Context, bail, ensure};
use serde::Deserialize;

/// Default bound on the number of released (evictable) entries kept around for reuse.
const DEFAULT_MAX_ITEMS: u64 = 10_000;

/// Configuration for a [`FileCache`](crate::FileCache).
#[derive(Debug, Clone, Deserialize)]
pub struct FileCacheConfig {
    /// Total byte budget for the cache directory, as a human-readable quantity,
    /// e.g. `"100G"` or `"512MiB"`.
    pub max_size: String,

    /// Upper bound on the number of released (unpinned) entries kept around for
    /// reuse. Exceeding it evicts the least recently used released entry.
    #[serde(default = "default_max_items")]
    pub max_items: u64,

    /// Root directory for cached files. Created with mode `0700` on first use.
    pub cache_dir: PathBuf,
}

fn default_max_items() -> u64 {
    DEFAULT_MAX_ITEMS
}

impl FileCacheConfig {
    pub fn new(max_size: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_size: max_size.into(),
            max_items: DEFAULT_MAX_ITEMS,
            cache_dir: cache_dir.into(),
        }
    }

    /// The configured `max_size`, parsed into bytes.
    pub fn max_size_bytes(&self) -> anyhow::Result<u64> {
        parse_byte_size(&self.max_size)
            .with_context(|| format!("invalid max_size {:?}", self.max_size))
    }
}

/// Parses a human-readable byte quantity.
///
/// Accepts bare numbers (`"1024"`), decimal suffixes with multiplier 1000 (`"10K"`,
/// `"100G"`, `"1.5TB"`), and binary suffixes with multiplier 1024 (`"512Ki"`,
/// `"2GiB"`). Suffixes are case-insensitive and a trailing `B` is optional.
pub fn parse_byte_size(input: &str) -> anyhow::Result<u64> {
    let input = input.trim();
    let digits_end = input
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(input.len());
    let (number, suffix) = input.split_at(digits_end);
    ensure!(!number.is_empty(), "missing number");

    let value: f64 = number.parse().context("malformed number")?;

    let mut suffix = suffix.trim().to_ascii_lowercase();
    if suffix.len() > 1 && suffix.ends_with('b') {
        suffix.pop();
    }
    let multiplier: u64 = match suffix.as_str() {
        "" | "b" => 1,
        "k" => 1000,
        "m" => 1000_u64.pow(2),
        "g" => 1000_u64.pow(3),
        "t" => 1000_u64.pow(4),
        "p" => 1000_u64.pow(5),
        "ki" => 1 << 10,
        "mi" => 1 << 20,
        "gi" => 1 << 30,
        "ti" => 1 << 40,
        "pi" => 1 << 50,
        _ => bail!("unknown byte size suffix {suffix:?}"),
    };

    let bytes = value * multiplier as f64;
    ensure!(
        bytes.is_finite() && bytes >= 0.0 && bytes <= u64::MAX as f64,
        "byte size out of range"
    );
    Ok(bytes as u64)
}
