//! # Masking Plan
//!
//! Rules resolved up front so an unknown rule fails the run before any data moves.

use super::{MaskingError, Transformer};
use crate::crd::MaskingRule;
use crate::database::TableName;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CompiledRule {
    table: String,
    column: String,
    transformer: Transformer,
}

/// Validated masking rules in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaskingPlan {
    rules: Vec<CompiledRule>,
}

impl MaskingPlan {
    /// Resolve every rule's transformer. The first unknown rule name is returned as an error.
    pub fn compile(rules: &[MaskingRule]) -> Result<Self, MaskingError> {
        let rules = rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    table: rule.table.clone(),
                    column: rule.column.clone(),
                    transformer: Transformer::resolve(&rule.transformation)?,
                })
            })
            .collect::<Result<Vec<_>, MaskingError>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Transformer for each column of `table`, aligned with `columns`.
    /// When several rules name the same column the first declared one applies.
    pub fn for_columns(&self, table: &TableName, columns: &[String]) -> Vec<Option<Transformer>> {
        columns
            .iter()
            .map(|column| {
                self.rules
                    .iter()
                    .find(|rule| table.matches(&rule.table) && rule.column == *column)
                    .map(|rule| rule.transformer)
            })
            .collect()
    }
}
