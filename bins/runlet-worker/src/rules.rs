/// Rule Translator - Typed Rule Configuration to Engine Rule Maps
///
/// **Core Responsibility:**
/// Convert the typed format/lint configuration carried by requests into the
/// flat key/value map the engine understands.
///
/// **Critical Properties:**
/// - Pure and stateless
/// - Format maps always carry the same fixed key set
/// - Lint maps only carry the identifier rule when it was configured

use runlet_common::types::{FormatRules, LintRules};
use serde::Serialize;
use serde_json::{Map, Value as Json};
use std::fmt;
use tracing::debug;

pub const SPACE_BEFORE_COLON: &str = "enforce-spacing-before-colon-in-declaration";
pub const SPACE_AFTER_COLON: &str = "enforce-spacing-after-colon-in-declaration";
pub const SPACE_AROUND_EQUALS: &str = "enforce-spacing-around-equals";
pub const NO_SPACE_AROUND_EQUALS: &str = "enforce-no-spacing-around-equals";
pub const INDENT_INSIDE_IF: &str = "indent-inside-if";
pub const LINE_BREAKS_AFTER_PRINTLN: &str = "line-breaks-after-println";
pub const IF_BRACE_SAME_LINE: &str = "if-brace-same-line";
pub const SINGLE_SPACE_SEPARATION: &str = "mandatory-single-space-separation";

pub const PRINTLN_ARGUMENT: &str = "mandatory-variable-or-literal-in-println";
pub const READ_INPUT_ARGUMENT: &str = "mandatory-variable-or-literal-in-readInput";
pub const IDENTIFIER_FORMAT: &str = "identifier_format";

/// Engine rule configuration: a JSON object of rule name to setting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RuleMap(Map<String, Json>);

impl RuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Json>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RuleMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}

pub fn format_rules(rules: &FormatRules) -> RuleMap {
    let mut map = RuleMap::new();
    map.insert(SPACE_BEFORE_COLON, rules.has_pre_ascription_space);
    map.insert(SPACE_AFTER_COLON, rules.has_post_ascription_space);
    map.insert(SPACE_AROUND_EQUALS, rules.is_assignation_spaced);
    map.insert(NO_SPACE_AROUND_EQUALS, !rules.is_assignation_spaced);
    map.insert(INDENT_INSIDE_IF, rules.indentation_inside_conditionals);
    map.insert(LINE_BREAKS_AFTER_PRINTLN, rules.println_separation_lines);
    map.insert(IF_BRACE_SAME_LINE, rules.if_brace_same_line);
    map.insert(SINGLE_SPACE_SEPARATION, true);

    debug!(count = map.len(), rules = %map, "Translated format rules");
    map
}

pub fn lint_rules(rules: &LintRules) -> RuleMap {
    let mut map = RuleMap::new();
    map.insert(PRINTLN_ARGUMENT, rules.mandatory_variable_or_literal_in_println);
    map.insert(READ_INPUT_ARGUMENT, rules.mandatory_variable_or_literal_in_read_input);
    if let Some(format) = rules.identifier_format {
        map.insert(IDENTIFIER_FORMAT, format.as_str());
    }

    debug!(count = map.len(), rules = %map, "Translated lint rules");
    map
}
