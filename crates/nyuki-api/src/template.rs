//! Endpoint templates: `/message/{mid:int}` style paths.

use std::collections::HashMap;
use std::fmt;

use crate::error::ExposerError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param { name: String, numeric: bool },
}

/// A parsed endpoint path.
///
/// `{name}` captures any segment, `{name:int}` only ASCII digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTemplate {
    segments: Vec<Segment>,
}

impl EndpointTemplate {
    pub fn parse(endpoint: &str) -> Result<Self, ExposerError> {
        let invalid = |reason: &str| ExposerError::InvalidTemplate {
            endpoint: endpoint.to_owned(),
            reason: reason.to_owned(),
        };

        let Some(rest) = endpoint.strip_prefix('/') else {
            return Err(invalid("must start with `/`"));
        };
        if rest.is_empty() {
            return Ok(Self {
                segments: Vec::new(),
            });
        }

        let mut segments = Vec::new();
        for raw in rest.split('/') {
            if raw.is_empty() {
                return Err(invalid("empty path segment"));
            }
            let segment = match raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(inner) => {
                    let (name, numeric) = match inner.split_once(':') {
                        Some((name, "int")) => (name, true),
                        Some((_, kind)) => {
                            return Err(invalid(&format!("unknown parameter type `{kind}`")));
                        }
                        None => (inner, false),
                    };
                    if name.is_empty()
                        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        return Err(invalid("parameter names are alphanumeric"));
                    }
                    let taken = segments.iter().any(
                        |segment| matches!(segment, Segment::Param { name: other, .. } if other == name),
                    );
                    if taken {
                        return Err(invalid(&format!("parameter `{name}` appears twice")));
                    }
                    Segment::Param {
                        name: name.to_owned(),
                        numeric,
                    }
                }
                None => {
                    if raw.contains(['{', '}']) || raw.starts_with([':', '*']) {
                        return Err(invalid("parameters must span a whole segment"));
                    }
                    Segment::Literal(raw.to_owned())
                }
            };
            segments.push(segment);
        }
        Ok(Self { segments })
    }

    /// The same template under `/{version}`.
    pub fn versioned(&self, version: &str) -> Self {
        let mut segments = Vec::with_capacity(self.segments.len() + 1);
        segments.push(Segment::Literal(version.to_owned()));
        segments.extend(self.segments.iter().cloned());
        Self { segments }
    }

    /// Route path in the router's syntax.
    pub fn route_path(&self) -> String {
        self.render(|name| format!("{{{name}}}"))
    }

    /// Route path with parameter names erased; two templates with the same
    /// shape would capture the same requests.
    pub(crate) fn shape(&self) -> String {
        self.render(|_| "{}".to_owned())
    }

    /// Matches `path` and returns the captured parameters.
    pub fn capture(&self, path: &str) -> Option<HashMap<String, String>> {
        let rest = path.strip_prefix('/')?;
        let parts: Vec<&str> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split('/').collect()
        };
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param { numeric: true, .. }
                    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) =>
                {
                    return None;
                }
                Segment::Param { name, .. } => {
                    params.insert(name.clone(), part.to_owned());
                }
            }
        }
        Some(params)
    }

    fn render(&self, param: impl Fn(&str) -> String) -> String {
        if self.segments.is_empty() {
            return "/".to_owned();
        }
        let mut path = String::new();
        for segment in &self.segments {
            path.push('/');
            match segment {
                Segment::Literal(literal) => path.push_str(literal),
                Segment::Param { name, .. } => path.push_str(&param(name)),
            }
        }
        path
    }
}

impl fmt::Display for EndpointTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => write!(f, "/{literal}")?,
                Segment::Param {
                    name,
                    numeric: true,
                } => write!(f, "/{{{name}:int}}")?,
                Segment::Param { name, .. } => write!(f, "/{{{name}}}")?,
            }
        }
        Ok(())
    }
}
