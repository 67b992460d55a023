//! Placeholder substitution for compose templates.
//!
//! Recognized forms: `${NAME}`, `${NAME:-default}`, `${NAME:?error}`.
//! `$$` escapes to a literal `$`. Substitution is a single pass over
//! the template; substituted values are never re-scanned.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
  /// A `${NAME:?msg}` placeholder with no value for NAME.
  /// The message is surfaced to the caller verbatim.
  #[error("missing required variable {name}: {message}")]
  MissingRequiredVariable { name: String, message: String },

  /// `${` with no closing `}` before end of input.
  #[error("unterminated ${{ placeholder at byte {position}")]
  UnterminatedPlaceholder { position: usize },
}

/// Renders placeholders from a value map, collecting
/// `(value, name)` replacer pairs for the names in `secrets`
/// so callers can sanitize logs afterwards.
pub struct Renderer<'a> {
  values: &'a HashMap<String, String>,
  secrets: HashSet<&'a str>,
  pub secret_replacers: HashSet<(String, String)>,
}

impl<'a> Renderer<'a> {
  pub fn new(values: &'a HashMap<String, String>) -> Renderer<'a> {
    Renderer {
      values,
      secrets: HashSet::new(),
      secret_replacers: HashSet::new(),
    }
  }

  /// Mark variable names whose substituted values must be
  /// masked out of anything logged or persisted.
  pub fn with_secrets(
    mut self,
    names: impl IntoIterator<Item = &'a str>,
  ) -> Renderer<'a> {
    self.secrets.extend(names);
    self
  }

  pub fn render(
    &mut self,
    template: &str,
  ) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
      match bytes[i] {
        b'$' if bytes.get(i + 1) == Some(&b'$') => {
          out.push('$');
          i += 2;
        }
        b'$' if bytes.get(i + 1) == Some(&b'{') => {
          let close = template[i..]
            .find('}')
            .map(|offset| i + offset)
            .ok_or(RenderError::UnterminatedPlaceholder {
              position: i,
            })?;
          let inner = &template[i + 2..close];
          out.push_str(&self.resolve(inner)?);
          i = close + 1;
        }
        _ => {
          // Push the full utf8 char, not just the byte.
          let ch = template[i..].chars().next().unwrap_or('\u{FFFD}');
          out.push(ch);
          i += ch.len_utf8();
        }
      }
    }

    Ok(out)
  }

  /// Resolve the contents between `${` and `}`.
  fn resolve(&mut self, inner: &str) -> Result<String, RenderError> {
    let (name, modifier) = match inner.find(':') {
      Some(colon) => (&inner[..colon], Some(&inner[colon + 1..])),
      None => (inner, None),
    };

    let value = self.values.get(name);

    if let Some(value) = value
      && self.secrets.contains(name)
    {
      self
        .secret_replacers
        .insert((value.clone(), name.to_string()));
    }

    match (value, modifier) {
      (Some(value), _) => Ok(value.clone()),
      (None, Some(modifier)) => match modifier.as_bytes().first() {
        Some(b'-') => Ok(modifier[1..].to_string()),
        Some(b'?') => Err(RenderError::MissingRequiredVariable {
          name: name.to_string(),
          message: modifier[1..].to_string(),
        }),
        // Unknown modifier: treat like a plain missing variable.
        _ => Ok(String::new()),
      },
      (None, None) => Ok(String::new()),
    }
  }
}

/// Replace every collected secret value in `text` with `***`.
pub fn mask_secrets(
  text: &str,
  replacers: &HashSet<(String, String)>,
) -> String {
  let mut out = text.to_string();
  for (value, _) in replacers {
    if !value.is_empty() {
      out = out.replace(value, "***");
    }
  }
  out
}

/// Effective variable set for one stack deploy.
///
/// Later layers win: definition defaults, then the environment's
/// persisted variable store, then product shared values, then the
/// values supplied on the request.
pub fn layered_values(
  defaults: &HashMap<String, String>,
  environment_store: &HashMap<String, String>,
  shared: &HashMap<String, String>,
  supplied: &HashMap<String, String>,
) -> HashMap<String, String> {
  let mut out = defaults.clone();
  for layer in [environment_store, shared, supplied] {
    for (name, value) in layer {
      out.insert(name.clone(), value.clone());
    }
  }
  out
}
