//! Strongly-typed identifiers for log positions.

use core::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Identifier of a single ordered partition of a log stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

/// Server-issued position of a record within a shard.
///
/// Sequence numbers are opaque strings, but they are ordered: the value is split
/// on `-` and each segment is compared numerically when it is made of digits
/// (so `"10"` > `"9"` and `"1700000000000-2"` > `"1700000000000-1"`), falling
/// back to byte order otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(String);

macro_rules! impl_string_newtype {
    ($t:ty) => {
        impl $t {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_newtype!(ShardId);
impl_string_newtype!(SequenceNumber);

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut left = self.0.split('-');
        let mut right = other.0.split('-');

        loop {
            match (left.next(), right.next()) {
                (Some(a), Some(b)) => match compare_segment(a, b) {
                    Ordering::Equal => continue,
                    unequal => return unequal,
                },
                (Some(_), None) => return Ordering::Greater,
                (None, Some(_)) => return Ordering::Less,
                // Same numeric position; keep the order total and consistent with `Eq`.
                (None, None) => return self.0.cmp(&other.0),
            }
        }
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn compare_segment(a: &str, b: &str) -> Ordering {
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit());

    if numeric(a) && numeric(b) {
        let a = a.trim_start_matches('0');
        let b = b.trim_start_matches('0');
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    } else {
        a.cmp(b)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn long_decimal_sequences_compare_numerically() {
        let older = SequenceNumber::new("49590338271490256608559692538361571095921575989136588898");
        let newer = SequenceNumber::new("49590338271490256608559692540925702759324208523137515618");
        assert!(older < newer);
        assert!(SequenceNumber::new("9") < SequenceNumber::new("10"));
        assert!(SequenceNumber::new("010") < SequenceNumber::new("11"));
    }

    #[test]
    fn stream_entry_ids_compare_by_segment() {
        assert!(SequenceNumber::new("1700000000000-1") < SequenceNumber::new("1700000000000-2"));
        assert!(SequenceNumber::new("1700000000000-9") < SequenceNumber::new("1700000000000-10"));
        assert!(SequenceNumber::new("1699999999999-99") < SequenceNumber::new("1700000000000-0"));
        assert!(SequenceNumber::new("5") < SequenceNumber::new("5-0"));
    }

    proptest! {
        #[test]
        fn ordering_matches_integer_ordering(a in any::<u128>(), b in any::<u128>()) {
            let left = SequenceNumber::new(a.to_string());
            let right = SequenceNumber::new(b.to_string());
            prop_assert_eq!(left.cmp(&right), a.cmp(&b));
        }

        #[test]
        fn ordering_matches_tuple_ordering(a in any::<(u64, u32)>(), b in any::<(u64, u32)>()) {
            let left = SequenceNumber::new(format!("{}-{}", a.0, a.1));
            let right = SequenceNumber::new(format!("{}-{}", b.0, b.1));
            prop_assert_eq!(left.cmp(&right), a.cmp(&b));
        }
    }
}
