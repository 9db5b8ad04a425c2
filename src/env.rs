//! Child environment assembly: variable expansion, env files and ordered
//! assignments where the last one wins.

use crate::error::EnvFileError;
use std::path::Path;
use tracing::{debug, warn};

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Expand `$NAME` and `${NAME}` using `lookup`. Unknown names expand to the
/// empty string; a `$` that starts no name is kept as is.
pub fn expand(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                out.push_str(&lookup(&braced[..end]).unwrap_or_default());
                rest = &braced[end + 1..];
                continue;
            }
            out.push('$');
            rest = after;
            continue;
        }

        let len = after.find(|c: char| !is_name_char(c)).unwrap_or(after.len());
        if len == 0 {
            out.push('$');
        } else {
            out.push_str(&lookup(&after[..len]).unwrap_or_default());
        }
        rest = &after[len..];
    }
    out.push_str(rest);
    out
}

/// Parse `KEY=VALUE` lines. Values are returned unexpanded.
pub fn parse_env_file(content: &str) -> Result<Vec<(String, String)>, EnvFileError> {
    let mut vars = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            return Err(EnvFileError {
                line: idx + 1,
                content: raw.to_string(),
            });
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(is_name_char) {
            return Err(EnvFileError {
                line: idx + 1,
                content: raw.to_string(),
            });
        }
        vars.push((key.to_string(), unquote(value.trim()).to_string()));
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Ordered environment. Setting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn expand(&self, value: &str) -> String {
        expand(value, |name| self.get(name).map(String::from))
    }

    /// Apply a `KEY=VALUE` assignment with the value expanded against the
    /// variables set so far.
    pub fn assign(&mut self, assignment: &str) -> &mut Self {
        match assignment.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                let value = self.expand(value);
                self.set(key, value)
            }
            _ => {
                warn!(assignment, "Ignoring environment entry without KEY=");
                self
            }
        }
    }

    /// Merge an env file. A missing file is ignored; a malformed one is
    /// logged and skipped as a whole.
    pub fn load_file(&mut self, path: &Path) -> &mut Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Environment file not found");
                return self;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read environment file");
                return self;
            }
        };
        match parse_env_file(&content) {
            Ok(vars) => {
                for (key, value) in vars {
                    let value = self.expand(&value);
                    self.set(key, value);
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping environment file"),
        }
        self
    }

    pub fn into_vars(self) -> Vec<(String, String)> {
        self.vars
    }
}
