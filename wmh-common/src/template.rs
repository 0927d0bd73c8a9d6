//! Path templates with a closed set of named placeholders
//!
//! Templates such as `sub-{subject}/ses-{session}/anat/*_acq-{acq}_*_FLAIR.nii.gz`
//! are parsed once, when configuration is loaded. Any placeholder outside
//! [`Placeholder`] is rejected at that point instead of failing mid-run.
//! Glob wildcards are carried through as literal text and only expanded by
//! the resolver.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholders a template may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    Subject,
    Session,
    Acq,
    /// `sub-<subject>ses-<session>`, the subject identifier used by LOCATE
    SubSes,
}

impl Placeholder {
    pub fn name(&self) -> &'static str {
        match self {
            Placeholder::Subject => "subject",
            Placeholder::Session => "session",
            Placeholder::Acq => "acq",
            Placeholder::SubSes => "sub_ses",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "subject" => Some(Placeholder::Subject),
            "session" => Some(Placeholder::Session),
            "acq" => Some(Placeholder::Acq),
            "sub_ses" => Some(Placeholder::SubSes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(Placeholder),
}

/// Values substituted into a template
#[derive(Debug, Clone, Default)]
pub struct Bindings<'a> {
    pub subject: Option<&'a str>,
    pub session: Option<&'a str>,
    pub acq: Option<&'a str>,
}

impl<'a> Bindings<'a> {
    pub fn new(subject: &'a str, session: &'a str) -> Self {
        Self {
            subject: Some(subject),
            session: Some(session),
            acq: None,
        }
    }

    pub fn subject_only(subject: &'a str) -> Self {
        Self {
            subject: Some(subject),
            session: None,
            acq: None,
        }
    }

    /// Subject and session become `*` so the rendered template enumerates all cases
    pub fn wildcard() -> Self {
        Self {
            subject: Some("*"),
            session: Some("*"),
            acq: None,
        }
    }

    pub fn with_acq(mut self, acq: &'a str) -> Self {
        self.acq = Some(acq);
        self
    }

    fn value(&self, placeholder: Placeholder) -> Option<String> {
        match placeholder {
            Placeholder::Subject => self.subject.map(str::to_string),
            Placeholder::Session => self.session.map(str::to_string),
            Placeholder::Acq => self.acq.map(str::to_string),
            Placeholder::SubSes => match (self.subject, self.session) {
                (Some(sub), Some(ses)) => Some(format!("sub-{sub}ses-{ses}")),
                _ => None,
            },
        }
    }
}

/// A validated path template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Parse a template, rejecting unknown or unterminated placeholders
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = raw;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                Error::Template(format!("unterminated placeholder in '{raw}'"))
            })?;
            let name = &after[..close];
            let placeholder = Placeholder::from_name(name).ok_or_else(|| {
                Error::Template(format!("unknown placeholder '{{{name}}}' in '{raw}'"))
            })?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Slot(placeholder));
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err(Error::Template(format!("stray '}}' in '{raw}'")));
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn placeholders(&self) -> impl Iterator<Item = Placeholder> + '_ {
        self.segments.iter().filter_map(|s| match s {
            Segment::Slot(p) => Some(*p),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute placeholders; glob wildcards are left untouched
    pub fn render(&self, bindings: &Bindings<'_>) -> Result<String> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(p) => {
                    let value = bindings.value(*p).ok_or_else(|| {
                        Error::Template(format!(
                            "no value bound for '{{{}}}' in '{}'",
                            p.name(),
                            self.raw
                        ))
                    })?;
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }

    /// Prefix the template with a directory (literal text, no placeholders)
    pub fn under(&self, dir: &std::path::Path) -> Result<Self> {
        let joined = dir.join(&self.raw);
        Self::parse(&joined.to_string_lossy())
    }
}

impl TryFrom<String> for PathTemplate {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PathTemplate> for String {
    fn from(value: PathTemplate) -> Self {
        value.raw
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
