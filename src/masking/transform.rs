//! # Transformers
//!
//! Stateless string-to-string value transformations. `hash` is deterministic; the
//! fake-data transformers draw fresh values on every call.

use super::MaskingError;
use crate::constants::REDACTED_VALUE;
use fake::faker::address::en::{BuildingNumber, CityName, StateAbbr, StreetName, ZipCode};
use fake::faker::chrono::en::DateTime as FakeDateTime;
use fake::faker::lorem::en::Words;
use fake::faker::name::en::Name as FakeName;
use fake::Fake;
use sha2::{Digest, Sha256};

/// A value transformation selected by rule name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transformer {
    /// SHA-256, lowercase hex
    Hash,
    /// Fixed literal replacement
    Redact,
    /// Random words
    Synthesize,
    /// Random full name
    Name,
    /// Random street address
    Address,
    /// Random RFC3339 timestamp
    DateTime,
    /// Keep the last four characters, mask the rest
    CreditCard,
    /// Empty string
    Null,
}

/// Rule name to transformer lookup
const REGISTRY: &[(&str, Transformer)] = &[
    ("hash", Transformer::Hash),
    ("redact", Transformer::Redact),
    ("synthesize", Transformer::Synthesize),
    ("name", Transformer::Name),
    ("address", Transformer::Address),
    ("dateTime", Transformer::DateTime),
    ("creditCard", Transformer::CreditCard),
    ("null", Transformer::Null),
];

impl Transformer {
    /// Look up a transformer by rule name. Unknown names are an error.
    pub fn resolve(rule: &str) -> Result<Self, MaskingError> {
        REGISTRY
            .iter()
            .find(|(name, _)| *name == rule)
            .map(|(_, transformer)| *transformer)
            .ok_or_else(|| MaskingError::UnknownRule(rule.to_string()))
    }

    /// Rule name of this transformer
    pub fn name(self) -> &'static str {
        REGISTRY
            .iter()
            .find(|(_, transformer)| *transformer == self)
            .map_or("unknown", |(name, _)| name)
    }

    pub fn apply(self, value: &str) -> String {
        match self {
            Self::Hash => format!("{:x}", Sha256::digest(value.as_bytes())),
            Self::Redact => REDACTED_VALUE.to_string(),
            Self::Synthesize => Words(2..5).fake::<Vec<String>>().join(" "),
            Self::Name => FakeName().fake(),
            Self::Address => format!(
                "{} {}, {}, {} {}",
                BuildingNumber().fake::<String>(),
                StreetName().fake::<String>(),
                CityName().fake::<String>(),
                StateAbbr().fake::<String>(),
                ZipCode().fake::<String>()
            ),
            Self::DateTime => FakeDateTime()
                .fake::<chrono::DateTime<chrono::Utc>>()
                .to_rfc3339(),
            Self::CreditCard => mask_card(value),
            Self::Null => String::new(),
        }
    }
}

fn mask_card(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < 4 {
        return "****".to_string();
    }
    let last_four: String = chars[chars.len() - 4..].iter().collect();
    format!("****-****-****-{last_four}")
}
