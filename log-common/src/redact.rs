//! # Redact
//!
//! Pattern based sanitizing of log text. A `Redactor` applies an ordered list of
//! `RedactionRule`s, one pass each.
use regex::Regex;
use thiserror::Error;

/// The literal every built-in rule substitutes for a match.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Local format phone numbers, like 555-0199.
const PHONE_PATTERN: &str = r"\b\d{3}-\d{4}\b";
const EMAIL_PATTERN: &str = r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b";
/// National ID numbers in the 123-45-6789 shape.
const SSN_PATTERN: &str = r"\b\d{3}-\d{2}-\d{4}\b";

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a known redaction rule, expected one of: phone, email, ssn")]
pub struct UnknownRuleError(pub String);

/// A single redaction pass.
///
/// A rule's replacement must never match its own pattern, otherwise redacting twice would change
/// the text again.
#[derive(Debug, Clone)]
pub struct RedactionRule {
    name: String,
    pattern: Regex,
    replacement: String,
}

impl RedactionRule {
    pub fn new(name: &str, pattern: Regex, replacement: &str) -> Self {
        Self {
            name: name.to_owned(),
            pattern,
            replacement: replacement.to_owned(),
        }
    }

    pub fn phone() -> Self {
        Self::builtin_from(
            "phone",
            Regex::new(PHONE_PATTERN).expect("phone pattern is a valid regex"),
        )
    }

    pub fn email() -> Self {
        Self::builtin_from(
            "email",
            Regex::new(EMAIL_PATTERN).expect("email pattern is a valid regex"),
        )
    }

    pub fn ssn() -> Self {
        Self::builtin_from(
            "ssn",
            Regex::new(SSN_PATTERN).expect("ssn pattern is a valid regex"),
        )
    }

    /// Look up a built-in rule by name.
    pub fn builtin(name: &str) -> Result<Self, UnknownRuleError> {
        match name {
            "phone" => Ok(Self::phone()),
            "email" => Ok(Self::email()),
            "ssn" => Ok(Self::ssn()),
            unknown => Err(UnknownRuleError(unknown.to_owned())),
        }
    }

    fn builtin_from(name: &str, pattern: Regex) -> Self {
        Self::new(name, pattern, REDACTION_MARKER)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, text: &str) -> String {
        self.pattern
            .replace_all(text, regex::NoExpand(&self.replacement))
            .into_owned()
    }
}

/// Applies its rules in the order they were declared.
#[derive(Debug, Clone)]
pub struct Redactor {
    rules: Vec<RedactionRule>,
}

impl Redactor {
    pub fn new(rules: Vec<RedactionRule>) -> Self {
        Self { rules }
    }

    /// Build a `Redactor` from built-in rule names, keeping the order given.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, UnknownRuleError> {
        let rules = names
            .iter()
            .map(|name| RedactionRule::builtin(name.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(rules))
    }

    /// Append another pass, run after every rule already present.
    pub fn with_rule(mut self, rule: RedactionRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(RedactionRule::name).collect()
    }

    /// Return a sanitized copy of `text`. Never fails; text that matches no rule comes back unchanged.
    pub fn redact(&self, text: &str) -> String {
        self.rules
            .iter()
            .fold(text.to_owned(), |sanitized, rule| rule.apply(&sanitized))
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(vec![RedactionRule::phone()])
    }
}
