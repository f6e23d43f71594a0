//! Column mapping parser
//!
//! Builds one entity per row by copying header columns into entity attributes.
//! Blank cells become `null`. Covers flat imports where each line is exactly one
//! entity; anything richer implements [`RowParser`] directly.

use std::marker::PhantomData;

use anyhow::Context;
use serde_json::Value;

use super::{single, FileContext, HasValidationRules, Parsed, ParsedStream, Row, RowParser, ValidationRules};
use crate::entity::Entity;
use crate::models::Values;

pub struct ColumnMapParser<T> {
    columns: Vec<(String, String)>,
    rules: Option<ValidationRules>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> ColumnMapParser<T> {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            rules: None,
            _entity: PhantomData,
        }
    }

    /// Copy header `column` into attribute `attribute`
    pub fn column(mut self, column: impl Into<String>, attribute: impl Into<String>) -> Self {
        self.columns.push((column.into(), attribute.into()));
        self
    }

    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.rules = Some(rules);
        self
    }

    fn values(&self, row: &Row) -> Values {
        self.columns
            .iter()
            .map(|(column, attribute)| {
                let value = match row.get(column).map(str::trim) {
                    Some(cell) if !cell.is_empty() => Value::String(cell.to_string()),
                    _ => Value::Null,
                };
                (attribute.clone(), value)
            })
            .collect()
    }
}

impl<T: Entity> Default for ColumnMapParser<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> RowParser for ColumnMapParser<T> {
    fn parse<'a>(&'a self, row: &'a Row) -> ParsedStream<'a> {
        let entity = serde_json::from_value::<T>(Value::Object(self.values(row)))
            .with_context(|| format!("line {} does not describe a {}", row.line_number, T::TYPE));

        match entity {
            Ok(entity) => single(Parsed::entity(entity)),
            Err(err) => super::yields(vec![Err(err)]),
        }
    }

    fn validation(&self) -> Option<&dyn HasValidationRules> {
        self.rules.as_ref().map(|_| self as &dyn HasValidationRules)
    }
}

impl<T: Entity> HasValidationRules for ColumnMapParser<T> {
    fn rules(&self, _context: &FileContext) -> ValidationRules {
        self.rules.clone().unwrap_or_default()
    }
}
