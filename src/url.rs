use std::collections::BTreeMap;

use crate::{ApiClientError, Result};

/// Marker replaced, left to right, by the positional values of a template.
pub const POSITIONAL_PLACEHOLDER: &str = "??";

/// Prefix of a named placeholder: `?:name`.
pub const NAMED_PLACEHOLDER_PREFIX: &str = "?:";

/// Path part of a call.
///
/// A template is a path containing `??` markers followed by one value per
/// marker; every value is percent-encoded before substitution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UrlSpec {
    Plain(String),
    Template { template: String, values: Vec<String> },
}

impl UrlSpec {
    pub fn template<I, S>(template: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Template {
            template: template.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Substitutes positional placeholders.
    ///
    /// The number of values must match the number of markers exactly.
    pub fn resolve(&self) -> Result<String> {
        match self {
            Self::Plain(url) => Ok(url.clone()),
            Self::Template { template, values } => {
                let markers = template.matches(POSITIONAL_PLACEHOLDER).count();
                if markers != values.len() {
                    return Err(ApiClientError::Validation(format!(
                        "url template '{template}' has {markers} placeholders but {} values were given",
                        values.len()
                    )));
                }

                let mut resolved = String::with_capacity(template.len());
                let mut rest = template.as_str();
                let mut values = values.iter();
                while let Some(index) = rest.find(POSITIONAL_PLACEHOLDER) {
                    resolved.push_str(&rest[..index]);
                    if let Some(value) = values.next() {
                        resolved.push_str(&urlencoding::encode(value));
                    }
                    rest = &rest[index + POSITIONAL_PLACEHOLDER.len()..];
                }
                resolved.push_str(rest);
                Ok(resolved)
            }
        }
    }
}

impl Default for UrlSpec {
    fn default() -> Self {
        Self::Plain(String::new())
    }
}

impl From<&str> for UrlSpec {
    fn from(value: &str) -> Self {
        Self::Plain(value.to_owned())
    }
}

impl From<String> for UrlSpec {
    fn from(value: String) -> Self {
        Self::Plain(value)
    }
}

impl From<&String> for UrlSpec {
    fn from(value: &String) -> Self {
        Self::Plain(value.clone())
    }
}

/// `["/notes/??", id]`: the first element is the template, the rest its values.
impl<const N: usize> From<[&str; N]> for UrlSpec {
    fn from(parts: [&str; N]) -> Self {
        let mut parts = parts.into_iter();
        match parts.next() {
            Some(template) => Self::template(template, parts),
            None => Self::Plain(String::new()),
        }
    }
}

/// Replaces `?:name` markers with the percent-encoded value registered for
/// `name`. Unknown names are left as they are.
pub fn substitute_named(url: &str, table: &BTreeMap<String, String>) -> String {
    if table.is_empty() || !url.contains(NAMED_PLACEHOLDER_PREFIX) {
        return url.to_owned();
    }

    let mut resolved = String::with_capacity(url.len());
    let mut rest = url;
    while let Some(index) = rest.find(NAMED_PLACEHOLDER_PREFIX) {
        resolved.push_str(&rest[..index]);
        let after = &rest[index + NAMED_PLACEHOLDER_PREFIX.len()..];
        let name_len = after
            .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
            .unwrap_or(after.len());
        let name = &after[..name_len];

        match table.get(name) {
            Some(value) if !name.is_empty() => resolved.push_str(&urlencoding::encode(value)),
            _ => {
                resolved.push_str(NAMED_PLACEHOLDER_PREFIX);
                resolved.push_str(name);
            }
        }
        rest = &after[name_len..];
    }
    resolved.push_str(rest);
    resolved
}
