//! Cosmetic dashboard numbers.
//!
//! Presentation-only: the values are derived from a seed string (usually the
//! ISO week) so every client shows the same numbers for the same week. They
//! carry no meaning and nothing in the messaging core reads them.

use chrono::{Datelike, NaiveDate};
use sha2::{Digest, Sha256};

/// Seed for the week containing `date`, e.g. `2026-W42`.
pub fn week_seed(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

/// Deterministic sequence of `len` values in `min..=max` derived from `seed`.
pub fn weekly_sequence(seed: &str, len: usize, min: u32, max: u32) -> Vec<u32> {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    let span = u64::from(hi - lo) + 1;

    (0..len)
        .map(|i| {
            let digest = Sha256::new()
                .chain_update(seed.as_bytes())
                .chain_update((i as u64).to_be_bytes())
                .finalize();
            let mut word = [0u8; 8];
            word.copy_from_slice(&digest[..8]);
            lo + (u64::from_be_bytes(word) % span) as u32
        })
        .collect()
}
