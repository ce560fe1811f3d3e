// Copyright 2025 Tokenlens (https://github.com/sochdb/tokenlens)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! State fingerprinting.
//!
//! A cheap composite hash of everything that can change the accounting
//! result. Two consecutive triggers with the same fingerprint mean
//! nothing meaningful moved, so the scheduler skips the recompute.

use std::hash::Hasher;

/// Field separator; keeps `("ab", "c")` distinct from `("a", "bc")`.
const SEP: &[u8] = b"\x1f";

/// Composite hash of the observable accounting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint(u64);

/// Everything the fingerprint covers.
#[derive(Debug, Clone)]
pub struct FingerprintInputs<'a> {
    pub conversation_id: Option<&'a str>,
    pub prompt_text: &'a str,
    pub turn_count: usize,
    /// Must be sorted; the store hands them out sorted already.
    pub checked_items: &'a [String],
    pub limit: usize,
    pub memory_enabled: bool,
}

impl Fingerprint {
    pub fn compute(inputs: &FingerprintInputs<'_>) -> Self {
        let mut hasher = seahash::SeaHasher::new();
        hasher.write(inputs.conversation_id.unwrap_or("").as_bytes());
        hasher.write(SEP);
        hasher.write(inputs.prompt_text.as_bytes());
        hasher.write(SEP);
        hasher.write_usize(inputs.turn_count);
        for item in inputs.checked_items {
            hasher.write(item.as_bytes());
            hasher.write(SEP);
        }
        hasher.write_usize(inputs.limit);
        hasher.write_u8(inputs.memory_enabled as u8);
        Self(hasher.finish())
    }
}
