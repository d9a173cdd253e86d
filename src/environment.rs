//! Ordered `KEY=VALUE` environment used to derive per-product environments.
//!
//! Entries keep their insertion order so that the environment handed to a
//! child process is stable from run to run. Lookups return the first match;
//! `set` replaces every earlier entry for the key.

use std::io::BufRead;

use thiserror::Error;

use crate::util::split_key_value;

const TRUE_TOKENS: &[&str] = &["1", "y", "yes", "on", "true"];
const FALSE_TOKENS: &[&str] = &["0", "n", "no", "off", "false"];

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("line {line}: unsupported environment statement '{text}'")]
    Malformed { line: usize, text: String },
    #[error("line {line}: {reason} in '{text}'")]
    BadQuoting {
        line: usize,
        text: String,
        reason: &'static str,
    },
    #[error("reading environment stream: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    entries: Vec<String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the current process environment.
    pub fn from_process() -> Self {
        let entries = std::env::vars_os()
            .map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()))
            .collect();
        Self { entries }
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|entry| match split_key_value(entry) {
            Some((k, v)) if k == key => Some(v),
            _ => None,
        })
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.unset(&[key]);
        self.entries.push(format!("{key}={value}"));
    }

    /// Removes every entry whose key is in `keys`, preserving the order of
    /// the remaining entries.
    pub fn unset(&mut self, keys: &[&str]) {
        self.entries.retain(|entry| {
            let key = split_key_value(entry).map_or(entry.as_str(), |(k, _)| k);
            !keys.contains(&key)
        });
    }

    /// Keeps only the entries whose key is in `keys`.
    pub fn allow(&mut self, keys: &[&str]) {
        self.entries.retain(|entry| {
            let key = split_key_value(entry).map_or(entry.as_str(), |(k, _)| k);
            keys.contains(&key)
        });
    }

    /// Deep copy that can be mutated without affecting `self`.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    pub fn is_true(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| TRUE_TOKENS.contains(&v))
    }

    pub fn is_false(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| FALSE_TOKENS.contains(&v))
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// `(key, value)` pairs, suitable for `Command::envs`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|entry| split_key_value(entry).unwrap_or((entry.as_str(), "")))
    }

    /// Applies a stream of `export K=V` / `unset K` statements.
    ///
    /// Blank lines and `#` comments are skipped. Either every statement is
    /// applied or, on the first malformed line, none is.
    pub fn merge<R: BufRead>(&mut self, reader: R) -> Result<(), EnvironmentError> {
        let mut staged = self.clone();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let number = index + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if let Some(assignment) = trimmed.strip_prefix("export ") {
                let Some((key, value)) = split_key_value(assignment.trim_start()) else {
                    return Err(EnvironmentError::Malformed {
                        line: number,
                        text: line.clone(),
                    });
                };
                let key = single_unquote(key).map_err(|reason| EnvironmentError::BadQuoting {
                    line: number,
                    text: line.clone(),
                    reason,
                })?;
                let value =
                    single_unquote(value).map_err(|reason| EnvironmentError::BadQuoting {
                        line: number,
                        text: line.clone(),
                        reason,
                    })?;
                if key.is_empty() {
                    return Err(EnvironmentError::Malformed {
                        line: number,
                        text: line.clone(),
                    });
                }
                staged.set(&key, &value);
            } else if let Some(key) = trimmed.strip_prefix("unset ") {
                let key =
                    single_unquote(key.trim()).map_err(|reason| EnvironmentError::BadQuoting {
                        line: number,
                        text: line.clone(),
                        reason,
                    })?;
                staged.unset(&[key.as_str()]);
            } else {
                return Err(EnvironmentError::Malformed {
                    line: number,
                    text: line.clone(),
                });
            }
        }

        *self = staged;
        Ok(())
    }
}

/// Removes shell single quoting: `'abc'` becomes `abc` and `'\''` inside a
/// quoted string stands for a literal quote.
fn single_unquote(s: &str) -> Result<String, &'static str> {
    if !s.starts_with('\'') {
        if s.contains('\'') {
            return Err("stray single quote");
        }
        return Ok(s.to_string());
    }
    if s.len() < 2 || !s.ends_with('\'') {
        return Err("unterminated single quote");
    }

    let inner = &s[1..s.len() - 1];
    if inner.replace("'\\''", "").contains('\'') {
        return Err("stray single quote");
    }
    Ok(inner.replace("'\\''", "'"))
}
