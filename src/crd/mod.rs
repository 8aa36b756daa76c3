//! # Custom Resource Definitions
//!
//! CRD types for the Vandal controller.
//!
//! - [`DataProfile`] schedules snapshots of a source database volume and prunes them
//! - [`DataClone`] materializes a masked, short-lived database from one of those snapshots

mod clone;
mod profile;
mod status;

pub use clone::*;
pub use profile::*;
pub use status::*;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Database engine running inside the source volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    #[default]
    Postgres,
    Mysql,
}

impl DatabaseEngine {
    /// Port the engine listens on inside the clone pod
    pub fn port(self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Mysql => 3306,
        }
    }

    /// Data directory the restored volume is mounted at
    pub fn data_dir(self) -> &'static str {
        match self {
            Self::Postgres => "/var/lib/postgresql/data",
            Self::Mysql => "/var/lib/mysql",
        }
    }

    pub fn default_user(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "root",
        }
    }

    pub fn default_dbname(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }
}

impl std::fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DatabaseEngine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            other => Err(format!("unknown database engine '{other}'")),
        }
    }
}

/// One masking rule: which column of which table gets which transformation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MaskingRule {
    /// Table name, bare (`users`) or schema-qualified (`public.users`)
    pub table: String,
    pub column: String,
    /// Transformer name, e.g. `hash`, `redact`, `creditCard`
    pub transformation: String,
}

/// Ordered list of masking rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MaskingSpec {
    #[serde(default)]
    pub rules: Vec<MaskingRule>,
}
