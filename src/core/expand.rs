//! Expression expansion — `[name]` placeholder substitution.
//!
//! Templates are expanded against an argument map by repeated passes: each
//! pass replaces every occurrence of `[key]` for every key, and passes repeat
//! until one makes no replacement. Substituted values may themselves contain
//! placeholders for other keys, so the loop runs to a fixed point. The pass
//! count is bounded; a template still changing at the bound is a cyclic
//! reference and fails instead of spinning.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CompileError;

/// Upper bound on substitution passes before a template is declared cyclic.
pub const MAX_PASSES: usize = 64;

/// A parameterized string literal from the manifest.
///
/// Carries the raw template text; conversion to a value goes through
/// [`expand`] or [`expand_as`] explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Expression(String);

impl Expression {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw, unexpanded template text.
    pub fn raw(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Expression {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[([A-Za-z0-9_.-]+)\]").expect("placeholder pattern"))
}

/// Expand `template` against `args` to a fixed point.
///
/// Does not check for residual placeholders; see [`expand_checked`].
pub fn expand(template: &str, args: &HashMap<String, String>) -> Result<String, CompileError> {
    let mut value = template.to_string();

    for _ in 0..MAX_PASSES {
        let mut replaced = false;
        for (key, replacement) in args {
            let needle = format!("[{}]", key);
            if value.contains(&needle) {
                value = value.replace(&needle, replacement);
                replaced = true;
            }
        }
        if !replaced {
            return Ok(value);
        }
    }

    Err(CompileError::CyclicVariable {
        template: template.to_string(),
    })
}

/// Expand and reject any residual `[name]` placeholder, naming the variable
/// and the owning element.
pub fn expand_checked(
    template: &str,
    args: &HashMap<String, String>,
    element: &str,
) -> Result<String, CompileError> {
    let value = expand(template, args)?;
    if let Some(found) = placeholder_pattern().captures(&value) {
        return Err(CompileError::UndefinedVariable {
            variable: found[1].to_string(),
            element: element.to_string(),
        });
    }
    Ok(value)
}

/// Expand, check, and convert the stabilized string to `T`.
pub fn expand_as<T>(
    template: &str,
    args: &HashMap<String, String>,
    element: &str,
) -> Result<T, CompileError>
where
    T: FromStr,
{
    let value = expand_checked(template, args, element)?;
    value.parse().map_err(|_| CompileError::Conversion {
        value,
        expected: std::any::type_name::<T>(),
        element: element.to_string(),
    })
}
