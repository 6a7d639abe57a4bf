//! Boolean algebra over tag sets.
//!
//! Expressions are parsed once at configuration-load time; evaluation takes
//! a tag *set*, so ordering of tags is irrelevant.

use std::collections::HashSet;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

use shoal_core::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagExpr {
    /// Matches iff the tag set contains the tag.
    Match(String),
    /// Logical negation.
    Not(Box<TagExpr>),
    /// Conjunction; empty conjunction is vacuously true.
    AllOf(Vec<TagExpr>),
    /// Disjunction; empty disjunction is false.
    AnyOf(Vec<TagExpr>),
}

impl TagExpr {
    /// Conjunction of plain tag matches. Convenience for
    /// `include_with_all_tags`-style flat lists.
    pub fn all_of_tags(tags: &[String]) -> TagExpr {
        TagExpr::AllOf(tags.iter().cloned().map(TagExpr::Match).collect())
    }

    /// Disjunction of plain tag matches. Convenience for
    /// `include_with_any_tags`-style flat lists.
    pub fn any_of_tags(tags: &[String]) -> TagExpr {
        TagExpr::AnyOf(tags.iter().cloned().map(TagExpr::Match).collect())
    }

    pub fn matches(&self, tags: &HashSet<String>) -> bool {
        match self {
            TagExpr::Match(tag) => tags.contains(tag),
            TagExpr::Not(inner) => !inner.matches(tags),
            TagExpr::AllOf(exprs) => exprs.iter().all(|expr| expr.matches(tags)),
            TagExpr::AnyOf(exprs) => exprs.iter().any(|expr| expr.matches(tags)),
        }
    }

    /// Parse an expression from an untyped configuration value.
    ///
    /// A string is a [`TagExpr::Match`]; a one-key mapping keyed by `$allOf`,
    /// `$anyOf` or `$not` recurses. Any other shape is a syntax error.
    pub fn from_value(value: &Value) -> Result<TagExpr> {
        match value {
            Value::String(tag) => Ok(TagExpr::Match(tag.clone())),
            Value::Mapping(map) => {
                if map.len() != 1 {
                    return Err(Error::config(format!(
                        "tag expression mapping must have exactly one key, found {}",
                        map.len()
                    )));
                }
                let (key, inner) = map.iter().next().expect("len checked above");
                let Value::String(key) = key else {
                    return Err(Error::config("tag expression key must be a string"));
                };
                match key.as_str() {
                    "$allOf" => Ok(TagExpr::AllOf(Self::from_sequence(inner)?)),
                    "$anyOf" => Ok(TagExpr::AnyOf(Self::from_sequence(inner)?)),
                    "$not" => Ok(TagExpr::Not(Box::new(Self::from_value(inner)?))),
                    other => Err(Error::config(format!(
                        "unknown tag expression operator: {other:?}"
                    ))),
                }
            }
            other => Err(Error::config(format!(
                "tag expression must be a string or a one-key mapping, found {other:?}"
            ))),
        }
    }

    fn from_sequence(value: &Value) -> Result<Vec<TagExpr>> {
        let Value::Sequence(items) = value else {
            return Err(Error::config(
                "$allOf/$anyOf operand must be a sequence of tag expressions",
            ));
        };
        items.iter().map(Self::from_value).collect()
    }
}

impl<'de> Deserialize<'de> for TagExpr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        TagExpr::from_value(&value).map_err(D::Error::custom)
    }
}
