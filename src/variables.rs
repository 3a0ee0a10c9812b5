//! Call variable maps and their dial-string rendering.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One variable value with its wire rendering rules.
///
/// Booleans and numbers are rendered bare; strings are single-quoted unless
/// the caller already supplied a quoted value (e.g. a tone spec like
/// `'%(2000,4000,440.0,480.0)'`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableValue::Bool(true) => f.write_str("true"),
            VariableValue::Bool(false) => f.write_str("false"),
            VariableValue::Int(n) => write!(f, "{n}"),
            VariableValue::Float(n) => write!(f, "{n}"),
            VariableValue::Str(s) => {
                if is_pre_quoted(s) {
                    f.write_str(s)
                } else {
                    write!(f, "'{s}'")
                }
            }
        }
    }
}

fn is_pre_quoted(s: &str) -> bool {
    s.len() >= 2
        && ((s.starts_with('\'') && s.ends_with('\''))
            || (s.starts_with('"') && s.ends_with('"')))
}

impl From<bool> for VariableValue {
    fn from(v: bool) -> Self {
        VariableValue::Bool(v)
    }
}

impl From<i64> for VariableValue {
    fn from(v: i64) -> Self {
        VariableValue::Int(v)
    }
}

impl From<i32> for VariableValue {
    fn from(v: i32) -> Self {
        VariableValue::Int(v.into())
    }
}

impl From<u32> for VariableValue {
    fn from(v: u32) -> Self {
        VariableValue::Int(v.into())
    }
}

impl From<f64> for VariableValue {
    fn from(v: f64) -> Self {
        VariableValue::Float(v)
    }
}

impl From<&str> for VariableValue {
    fn from(v: &str) -> Self {
        VariableValue::Str(v.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(v: String) -> Self {
        VariableValue::Str(v)
    }
}

/// Variable map attached to bridge/originate legs.
///
/// Renders as the `{name=value,name=value}` prefix accepted in dial strings;
/// an empty map renders as nothing at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variables(BTreeMap<String, VariableValue>);

impl Variables {
    /// Create an empty variable map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a variable.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<VariableValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Insert only if the name is not already present.
    pub fn insert_if_absent(&mut self, name: &str, value: impl Into<VariableValue>) {
        if !self.0.contains_key(name) {
            self.0.insert(name.to_string(), value.into());
        }
    }

    /// Remove a variable.
    pub fn remove(&mut self, name: &str) -> Option<VariableValue> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VariableValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Drop entries whose rendered value is empty; the switch misparses
    /// `{name=}` blocks.
    pub fn drop_empty(&mut self) {
        self.0.retain(|_, value| match value {
            VariableValue::Str(s) => !s.is_empty(),
            _ => true,
        });
    }

    /// Rendered view used for error payloads and logs.
    pub fn as_string_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }
}

impl fmt::Display for Variables {
    /// The `{k=v,...}` dial-string prefix, or nothing for an empty map.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (idx, (name, value)) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("}")
    }
}

impl<K: Into<String>, V: Into<VariableValue>> FromIterator<(K, V)> for Variables {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut vars = Variables::new();
        for (k, v) in iter {
            vars.insert(k, v);
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_variables_render_nothing() {
        assert_eq!(Variables::new().to_string(), "");
    }

    #[test]
    fn boolean_variables_render_bare() {
        let mut vars = Variables::new();
        vars.insert("ignore_early_media", true);
        assert_eq!(vars.to_string(), "{ignore_early_media=true}");

        let mut vars = Variables::new();
        vars.insert("ignore_early_media", false);
        assert_eq!(vars.to_string(), "{ignore_early_media=false}");
    }

    #[test]
    fn string_variables_get_single_quotes() {
        let mut vars = Variables::new();
        vars.insert("caller_id_name", "John Doe");
        assert_eq!(vars.to_string(), "{caller_id_name='John Doe'}");
    }

    #[test]
    fn numeric_variables_render_bare() {
        let mut vars = Variables::new();
        vars.insert("timeout", 30);
        assert_eq!(vars.to_string(), "{timeout=30}");

        let mut vars = Variables::new();
        vars.insert("volume", 1.5);
        assert_eq!(vars.to_string(), "{volume=1.5}");
    }

    #[test]
    fn pre_quoted_strings_pass_through() {
        let mut vars = Variables::new();
        vars.insert("ringback", "'%(2000,4000,440.0,480.0)'");
        assert_eq!(vars.to_string(), "{ringback='%(2000,4000,440.0,480.0)'}");

        let mut vars = Variables::new();
        vars.insert("test_var", "\"already quoted\"");
        assert_eq!(vars.to_string(), "{test_var=\"already quoted\"}");
    }

    #[test]
    fn multiple_variables_are_comma_separated() {
        let mut vars = Variables::new();
        vars.insert("caller_id_name", "John Doe");
        vars.insert("timeout", 30);
        vars.insert("ignore_early_media", true);

        let rendered = vars.to_string();
        assert!(rendered.starts_with('{'));
        assert!(rendered.ends_with('}'));
        assert!(rendered.contains("caller_id_name='John Doe'"));
        assert!(rendered.contains("timeout=30"));
        assert!(rendered.contains("ignore_early_media=true"));
        assert_eq!(rendered.matches(',').count(), 2);
    }

    #[test]
    fn strings_with_separators_stay_quoted() {
        let mut vars = Variables::new();
        vars.insert("absolute_codec_string", "PCMA,PCMU");
        assert_eq!(vars.to_string(), "{absolute_codec_string='PCMA,PCMU'}");
    }

    #[test]
    fn drop_empty_removes_blank_strings_only() {
        let mut vars = Variables::new();
        vars.insert("origination_caller_id_name", "");
        vars.insert("origination_caller_id_number", "5551234");
        vars.insert("timeout", 0);
        vars.drop_empty();
        assert!(!vars.contains("origination_caller_id_name"));
        assert!(vars.contains("origination_caller_id_number"));
        assert!(vars.contains("timeout"));
    }

    #[test]
    fn insert_if_absent_does_not_clobber() {
        let mut vars = Variables::new();
        vars.insert("origination_caller_id_name", "supplied");
        vars.insert_if_absent("origination_caller_id_name", "inherited");
        vars.insert_if_absent("origination_caller_id_number", "1000");
        assert_eq!(
            vars.get("origination_caller_id_name"),
            Some(&VariableValue::Str("supplied".into()))
        );
        assert_eq!(
            vars.get("origination_caller_id_number"),
            Some(&VariableValue::Str("1000".into()))
        );
    }
}
