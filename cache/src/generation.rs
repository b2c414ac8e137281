//! Generation tags for the self-refreshing cache.

use std::fmt;

/// A logical cache epoch.
///
/// Generations count up by one per refresh cycle and wrap from
/// [`Generation::MAX`] back to zero, so only equality and [`next`](Self::next)
/// are meaningful; there is no "older than" across the wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Generation(pub(crate) u32);

impl Generation {
  pub const ZERO: Generation = Generation(0);
  pub const MAX: Generation = Generation(u32::MAX);

  /// The generation after this one, wrapping `MAX` to zero.
  #[inline]
  pub fn next(self) -> Generation {
    Generation(self.0.wrapping_add(1))
  }

  #[inline]
  pub fn get(self) -> u32 {
    self.0
  }
}

impl From<u32> for Generation {
  fn from(value: u32) -> Self {
    Generation(value)
  }
}

impl fmt::Display for Generation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// The composite key of the generation cache: a user key tagged with the
/// generation it was loaded for. Equality and hashing cover both fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationKey<K> {
  pub key: K,
  pub generation: Generation,
}

impl<K> GenerationKey<K> {
  pub fn new(key: K, generation: Generation) -> Self {
    Self { key, generation }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn test_next_wraps_to_zero() {
    assert_eq!(Generation::ZERO.next(), Generation(1));
    assert_eq!(Generation(41).next().get(), 42);
    assert_eq!(Generation::MAX.next(), Generation::ZERO);
  }

  #[test]
  fn test_generation_key_uses_both_fields() {
    let mut keys = HashSet::new();
    keys.insert(GenerationKey::new("a", Generation(1)));
    keys.insert(GenerationKey::new("a", Generation(2)));
    keys.insert(GenerationKey::new("b", Generation(1)));
    keys.insert(GenerationKey::new("a", Generation(1)));

    assert_eq!(keys.len(), 3);
    assert!(keys.contains(&GenerationKey::new("a", Generation(2))));
    assert!(!keys.contains(&GenerationKey::new("b", Generation(2))));
  }
}
