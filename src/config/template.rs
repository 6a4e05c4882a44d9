//! Path templates for fd destinations
//!
//! A template is a path with `$NAME` or `${NAME}` tokens that the caller
//! resolves, e.g. `$TEMP_PATH/stdout.txt`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::ConfigError;

/// Caller-provided values for template tokens
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    vars: HashMap<String, String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every variable from the current process environment
    pub fn from_env() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

#[derive(Debug, PartialEq)]
enum Piece<'a> {
    Text(&'a str),
    Var(&'a str),
}

/// An unresolved path, possibly containing `$NAME` tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathTemplate(String);

impl PathTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check the template is well formed without resolving it
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pieces().map(|_| ())
    }

    /// Substitute every token; any unknown variable is an error
    pub fn resolve(&self, vars: &Substitutions) -> Result<PathBuf, ConfigError> {
        let mut out = String::with_capacity(self.0.len());
        for piece in self.pieces()? {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Var(name) => {
                    let value =
                        vars.get(name)
                            .ok_or_else(|| ConfigError::UnresolvedVariable {
                                name: name.to_string(),
                                template: self.0.clone(),
                            })?;
                    out.push_str(value);
                }
            }
        }
        Ok(PathBuf::from(out))
    }

    fn pieces(&self) -> Result<Vec<Piece<'_>>, ConfigError> {
        let malformed = |reason| ConfigError::MalformedTemplate {
            template: self.0.clone(),
            reason,
        };

        let src = self.0.as_str();
        let mut pieces = Vec::new();
        let mut rest = src;

        while let Some(pos) = rest.find('$') {
            if pos > 0 {
                pieces.push(Piece::Text(&rest[..pos]));
            }
            let after = &rest[pos + 1..];

            let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
                let end = braced.find('}').ok_or_else(|| malformed("unterminated ${"))?;
                (&braced[..end], end + 2)
            } else {
                let end = after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(after.len());
                (&after[..end], end)
            };

            if name.is_empty() {
                return Err(malformed("empty variable name"));
            }
            if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(malformed("invalid character in variable name"));
            }

            pieces.push(Piece::Var(name));
            rest = &after[consumed..];
        }

        if !rest.is_empty() {
            pieces.push(Piece::Text(rest));
        }
        Ok(pieces)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
