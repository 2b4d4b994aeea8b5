//! Shell script templates with explicit binding classes.
//!
//! A template contains `{{name}}` placeholders. Each one is bound either
//! with [`Script::value`], which substitutes the value now as a single-quoted
//! shell word (the remote shell sees the literal text), or with
//! [`Script::raw`], which inserts text verbatim so the shell that runs the
//! script evaluates it. Everything outside placeholders, including `$var`
//! and `${var}`, is passed through unchanged and evaluated by that shell.

use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Binding {
    Value(String),
    Values(Vec<String>),
    Raw(String),
}

#[derive(Debug, Clone)]
pub struct Script {
    name: &'static str,
    template: String,
    bindings: BTreeMap<&'static str, Binding>,
}

impl Script {
    pub fn new(name: &'static str, template: impl Into<String>) -> Self {
        Self {
            name,
            template: template.into(),
            bindings: BTreeMap::new(),
        }
    }

    /// Substitute `value` now, quoted as one shell word.
    pub fn value(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.bindings.insert(key, Binding::Value(value.into()));
        self
    }

    /// Substitute each of `values` now, quoted and separated by spaces.
    pub fn values<I, S>(mut self, key: &'static str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.bindings.insert(key, Binding::Values(values));
        self
    }

    /// Insert `text` verbatim, for the executing shell to evaluate.
    pub fn raw(mut self, key: &'static str, text: impl Into<String>) -> Self {
        self.bindings.insert(key, Binding::Raw(text.into()));
        self
    }

    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Render the final script text.
    ///
    /// Fails on a placeholder without binding and on a binding that no
    /// placeholder uses.
    pub fn render(&self) -> Result<String, String> {
        let mut out = String::with_capacity(self.template.len());
        let mut used = Vec::new();
        let mut rest = self.template.as_str();

        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            let key = after
                .find("}}")
                .map(|end| &after[..end])
                .filter(|key| is_identifier(key));

            let Some(key) = key else {
                // Not a placeholder, keep the braces as they are.
                out.push_str(&rest[..start + 2]);
                rest = after;
                continue;
            };

            out.push_str(&rest[..start]);
            match self.bindings.get(key) {
                Some(Binding::Value(value)) => out.push_str(&quote(value)),
                Some(Binding::Values(values)) => {
                    let words: Vec<String> = values.iter().map(|v| quote(v)).collect();
                    out.push_str(&words.join(" "));
                }
                Some(Binding::Raw(text)) => out.push_str(text),
                None => return Err(format!("placeholder '{key}' is not bound")),
            }
            used.push(key);
            rest = &after[key.len() + 2..];
        }
        out.push_str(rest);

        if let Some(unused) = self.bindings.keys().find(|k| !used.contains(*k)) {
            return Err(format!("binding '{unused}' is not used by the template"));
        }
        Ok(out)
    }
}

fn is_identifier(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote `s` as a single POSIX shell word.
pub fn quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '+' | ':' | '@' | '%' | ','))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
