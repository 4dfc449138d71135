//! Layering a user profile over a base profile.
//!
//! Rules: strings, paths and integers take the right-hand side unless it is
//! empty or zero; `bool` always takes the right-hand side; `Option` takes
//! `Some`, merging recursively when both sides are set; `Vec` concatenates;
//! maps merge key by key. Enums are replaced wholesale.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;

/// Merge `other` into `self`.
pub trait Merge {
    /// Layer `other` over `self`.
    fn merge(&mut self, other: Self);
}

impl Merge for String {
    fn merge(&mut self, other: Self) {
        if !other.is_empty() {
            *self = other;
        }
    }
}

impl Merge for Utf8PathBuf {
    fn merge(&mut self, other: Self) {
        if !other.as_str().is_empty() {
            *self = other;
        }
    }
}

impl Merge for u64 {
    fn merge(&mut self, other: Self) {
        if other != 0 {
            *self = other;
        }
    }
}

impl Merge for bool {
    fn merge(&mut self, other: Self) {
        *self = other;
    }
}

impl<T: Merge> Merge for Option<T> {
    fn merge(&mut self, other: Self) {
        let Some(theirs) = other else {
            return;
        };
        match self {
            Some(ours) => ours.merge(theirs),
            None => *self = Some(theirs),
        }
    }
}

impl<T> Merge for Vec<T> {
    fn merge(&mut self, other: Self) {
        self.extend(other);
    }
}

impl<V: Merge> Merge for BTreeMap<String, V> {
    fn merge(&mut self, other: Self) {
        for (k, v) in other {
            match self.get_mut(&k) {
                Some(ours) => ours.merge(v),
                None => {
                    self.insert(k, v);
                }
            }
        }
    }
}

impl Merge for serde_yaml::Value {
    fn merge(&mut self, other: Self) {
        match (self, other) {
            (serde_yaml::Value::Mapping(ours), serde_yaml::Value::Mapping(theirs)) => {
                for (k, v) in theirs {
                    match ours.get_mut(&k) {
                        Some(existing) => existing.merge(v),
                        None => {
                            ours.insert(k, v);
                        }
                    }
                }
            }
            (ours, theirs) => *ours = theirs,
        }
    }
}

/// For list fields whose entries only make sense as a whole: a non-empty
/// right-hand side replaces the left.
pub(crate) fn replace_if_set<T>(ours: &mut Vec<T>, theirs: Vec<T>) {
    if !theirs.is_empty() {
        *ours = theirs;
    }
}

/// Implement [`Merge`] as plain replacement.
macro_rules! merge_by_replace {
    ($($t:ty),* $(,)?) => {
        $(
            impl $crate::profile::merge::Merge for $t {
                fn merge(&mut self, other: Self) {
                    *self = other;
                }
            }
        )*
    };
}
pub(crate) use merge_by_replace;
