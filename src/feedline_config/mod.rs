//! Feedline Configuration Model
//!
//! A [`FeedlineConfig`] is a tree of optional sections (IF board, DAC output, channel map,
//! down-conversion, matched filter, trigger). Every leaf is either a concrete value or
//! unset, and unset means "don't care".
//!
//! The relations the scheduler relies on are generated from an explicit field list:
//! each section is declared once through `setting_section!`, and equality,
//! compatibility, merge and the identity hash all walk that declaration.
//!
//! - **Equal**: every field equal, sequences compared element-wise (`PartialEq`).
//! - **Compatible**: wherever both sides are concrete the values are equal. Symmetric and
//!   reflexive, not transitive.
//! - **Merge**: concrete wins over unset. Only defined for compatible inputs.
//! - **Hash**: SHA-256 over field names and canonical value bytes. `-0.0` hashes as
//!   `0.0`, matching float equality.
//!
//! Non-finite floats have no consistent equality, so [`FeedlineConfig::validate`]
//! rejects them before a configuration can reach the scheduler.

use crate::error::ReadoutError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Field-wise relations shared by leaves, sections and optional wrappers.
pub trait Setting: Clone + PartialEq + fmt::Debug {
    /// True when no concrete field disagrees with `other`.
    fn compatible_with(&self, other: &Self) -> bool;

    /// Field-wise merge.
    ///
    /// Callers must have checked [`Setting::compatible_with`]; on a conflicting leaf the
    /// left-hand value is kept.
    fn merged(&self, other: &Self) -> Self;

    /// Appends the dotted path of every conflicting leaf under `path`.
    fn collect_conflicts(&self, other: &Self, path: &str, out: &mut Vec<String>);

    /// Feeds a canonical encoding into `hasher`.
    fn digest(&self, hasher: &mut Sha256);

    /// Appends the dotted path of every NaN or infinite leaf under `path`.
    fn collect_non_finite(&self, _path: &str, _out: &mut Vec<String>) {}
}

impl<S: Setting> Setting for Option<S> {
    fn compatible_with(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.compatible_with(b),
            _ => true,
        }
    }

    fn merged(&self, other: &Self) -> Self {
        match (self, other) {
            (Some(a), Some(b)) => Some(a.merged(b)),
            (Some(a), None) => Some(a.clone()),
            (None, b) => b.clone(),
        }
    }

    fn collect_conflicts(&self, other: &Self, path: &str, out: &mut Vec<String>) {
        if let (Some(a), Some(b)) = (self, other) {
            a.collect_conflicts(b, path, out);
        }
    }

    fn digest(&self, hasher: &mut Sha256) {
        match self {
            None => hasher.update([0u8]),
            Some(value) => {
                hasher.update([1u8]);
                value.digest(hasher);
            }
        }
    }

    fn collect_non_finite(&self, path: &str, out: &mut Vec<String>) {
        if let Some(value) = self {
            value.collect_non_finite(path, out);
        }
    }
}

/// Bit pattern used for hashing; both zeroes map to `+0.0`.
fn canonical_bits(value: f64) -> u64 {
    if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

macro_rules! leaf_setting {
    ($ty:ty, |$value:ident, $hasher:ident| $encode:expr $(, finite |$leaf:ident| $finite:expr)?) => {
        impl Setting for $ty {
            fn compatible_with(&self, other: &Self) -> bool {
                self == other
            }

            fn merged(&self, _other: &Self) -> Self {
                self.clone()
            }

            fn collect_conflicts(&self, other: &Self, path: &str, out: &mut Vec<String>) {
                if self != other {
                    out.push(path.to_string());
                }
            }

            fn digest(&self, $hasher: &mut Sha256) {
                let $value = self;
                $encode
            }

            $(
                fn collect_non_finite(&self, path: &str, out: &mut Vec<String>) {
                    let $leaf = self;
                    if !$finite {
                        out.push(path.to_string());
                    }
                }
            )?
        }
    };
}

leaf_setting!(
    f64,
    |v, h| h.update(canonical_bits(*v).to_le_bytes()),
    finite |v| v.is_finite()
);
leaf_setting!(u32, |v, h| h.update(v.to_le_bytes()));
leaf_setting!(bool, |v, h| h.update([u8::from(*v)]));
leaf_setting!(String, |v, h| {
    h.update((v.len() as u64).to_le_bytes());
    h.update(v.as_bytes());
});
leaf_setting!(
    Vec<f64>,
    |v, h| {
        h.update((v.len() as u64).to_le_bytes());
        for x in v {
            h.update(canonical_bits(*x).to_le_bytes());
        }
    },
    finite |v| v.iter().all(|x| x.is_finite())
);
leaf_setting!(Vec<u32>, |v, h| {
    h.update((v.len() as u64).to_le_bytes());
    for x in v {
        h.update(x.to_le_bytes());
    }
});
leaf_setting!(Vec<i16>, |v, h| {
    h.update((v.len() as u64).to_le_bytes());
    for x in v {
        h.update(x.to_le_bytes());
    }
});
leaf_setting!(Vec<i32>, |v, h| {
    h.update((v.len() as u64).to_le_bytes());
    for x in v {
        h.update(x.to_le_bytes());
    }
});

/// Joins a parent path and a field name with a dot.
pub(crate) fn join_path(parent: &str, field: &str) -> String {
    if parent.is_empty() {
        field.to_string()
    } else {
        format!("{parent}.{field}")
    }
}

/// Declares a configuration section.
///
/// Every listed field becomes `pub field: Option<T>` and the [`Setting`] impl is
/// generated from the same list, so adding a field updates equality, compatibility,
/// merge and hashing in one place.
macro_rules! setting_section {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, ::serde::Serialize, ::serde::Deserialize)]
        pub struct $name {
            $(
                $(#[$fmeta])*
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<$ty>,
            )*
        }

        impl $name {
            /// Declared field names, in hashing order.
            pub const FIELDS: &'static [&'static str] = &[$(stringify!($field)),*];

            /// True when every field is unset.
            pub fn is_unset(&self) -> bool {
                true $(&& self.$field.is_none())*
            }
        }

        impl $crate::feedline_config::Setting for $name {
            fn compatible_with(&self, other: &Self) -> bool {
                true $(&& self.$field.compatible_with(&other.$field))*
            }

            fn merged(&self, other: &Self) -> Self {
                Self {
                    $( $field: self.$field.merged(&other.$field), )*
                }
            }

            fn collect_conflicts(&self, other: &Self, path: &str, out: &mut Vec<String>) {
                $(
                    self.$field.collect_conflicts(
                        &other.$field,
                        &$crate::feedline_config::join_path(path, stringify!($field)),
                        out,
                    );
                )*
            }

            fn digest(&self, hasher: &mut ::sha2::Sha256) {
                use ::sha2::Digest;
                $(
                    hasher.update((stringify!($field).len() as u64).to_le_bytes());
                    hasher.update(stringify!($field).as_bytes());
                    self.$field.digest(hasher);
                )*
            }

            fn collect_non_finite(&self, path: &str, out: &mut Vec<String>) {
                $(
                    self.$field.collect_non_finite(
                        &$crate::feedline_config::join_path(path, stringify!($field)),
                        out,
                    );
                )*
            }
        }
    };
}

mod sections;

pub use sections::{
    ChannelMap, DacSetup, DdcSetup, FeedlineConfig, FilterSetup, IfSetup, TriggerSetup,
};

/// Stable identity of a configuration value.
///
/// Serialized as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigHash([u8; 32]);

impl ConfigHash {
    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight bytes as lowercase hex, for logs.
    pub fn short(&self) -> String {
        self.0[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for ConfigHash {
    type Err = ReadoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ReadoutError::Validation(format!("'{}' is not a configuration hash", s));
        if s.len() != 64 || !s.is_ascii() {
            return Err(invalid());
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for ConfigHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConfigHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Debug for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigHash({})", self.short())
    }
}

/// Configuration as carried by a request: in full, or as a hash reference to a
/// configuration taught earlier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Complete configuration value.
    Full(FeedlineConfig),
    /// Hash of a configuration previously sent in full.
    Reference(ConfigHash),
}

impl ConfigSource {
    /// Identity hash of the referenced configuration.
    pub fn hash(&self) -> ConfigHash {
        match self {
            ConfigSource::Full(config) => config.config_hash(),
            ConfigSource::Reference(hash) => *hash,
        }
    }
}

impl From<FeedlineConfig> for ConfigSource {
    fn from(value: FeedlineConfig) -> Self {
        ConfigSource::Full(value)
    }
}

impl From<ConfigHash> for ConfigSource {
    fn from(value: ConfigHash) -> Self {
        ConfigSource::Reference(value)
    }
}

/// Hashes any setting with a domain prefix.
pub(crate) fn hash_setting<S: Setting>(domain: &str, setting: &S) -> ConfigHash {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    setting.digest(&mut hasher);
    ConfigHash(hasher.finalize().into())
}
