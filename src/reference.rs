//! Hierarchical references.
//!
//! A [`Reference`] names a thing in the simulation: a component kernel
//! (`macro`), an instance (`micro[3][7]`), an endpoint
//! (`micro[3][7].out[2]`), or a setting (`micro.timestep`). It is an
//! ordered sequence of identifier and index parts; the leading part is
//! always an identifier. References are the only way components refer to
//! each other, so they double as map keys throughout the runtime.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// One part of a reference: a bare name or a bracketed index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferencePart {
    Identifier(String),
    Index(i64),
}

/// A hierarchical name of the form `kernel[i][j].port[slot]`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    parts: Vec<ReferencePart>,
}

/// Checks that `name` is a valid bare identifier.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!("'{}' is not a valid identifier", name)));
    }
    Ok(())
}

impl Reference {
    /// Parses a reference from its textual form.
    pub fn new(text: &str) -> Result<Self> {
        text.parse()
    }

    /// Builds a reference from parts. The first part must be an identifier.
    pub fn from_parts(parts: Vec<ReferencePart>) -> Result<Self> {
        match parts.first() {
            Some(ReferencePart::Identifier(_)) => Ok(Reference { parts }),
            _ => Err(Error::Config(
                "a reference must start with an identifier".to_string(),
            )),
        }
    }

    // For building references from parts already known to be valid.
    pub(crate) fn from_parts_unchecked(parts: Vec<ReferencePart>) -> Reference {
        Reference { parts }
    }

    pub fn parts(&self) -> &[ReferencePart] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// The longest identifier-only prefix, e.g. `micro` for `micro[3][7]`
    /// and `macro.out` for `macro.out`.
    pub fn head(&self) -> Reference {
        let parts = self
            .parts
            .iter()
            .take_while(|p| matches!(p, ReferencePart::Identifier(_)))
            .cloned()
            .collect();
        Reference { parts }
    }

    /// Everything after [`head`](Self::head): indices and sub-references.
    pub fn tail(&self) -> Vec<ReferencePart> {
        self.parts
            .iter()
            .skip_while(|p| matches!(p, ReferencePart::Identifier(_)))
            .cloned()
            .collect()
    }

    /// True if `prefix` matches the leading parts of this reference.
    pub fn starts_with(&self, prefix: &Reference) -> bool {
        self.parts.len() >= prefix.parts.len()
            && self.parts[..prefix.parts.len()] == prefix.parts[..]
    }

    /// This reference with the parts of `other` appended.
    pub fn concat(&self, other: &Reference) -> Reference {
        let mut parts = self.parts.clone();
        parts.extend(other.parts.iter().cloned());
        Reference { parts }
    }

    pub fn push_index(&mut self, index: i64) {
        self.parts.push(ReferencePart::Index(index));
    }

    pub fn push_identifier(&mut self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        self.parts.push(ReferencePart::Identifier(name.to_string()));
        Ok(())
    }

    /// This reference with one index appended, e.g. `micro` -> `micro[3]`.
    pub fn with_index(&self, index: i64) -> Reference {
        let mut r = self.clone();
        r.push_index(index);
        r
    }

    /// The last part, if it is an identifier. Endpoint references end in
    /// a port name, which this extracts.
    pub fn last_identifier(&self) -> Option<&str> {
        match self.parts.last() {
            Some(ReferencePart::Identifier(name)) => Some(name),
            _ => None,
        }
    }

    /// This reference without its final part. Used to split an endpoint
    /// `kernel.port` into the kernel that owns the port.
    pub fn parent(&self) -> Result<Reference> {
        if self.parts.len() < 2 {
            return Err(Error::Config(format!(
                "'{}' has no parent reference",
                self
            )));
        }
        Reference::from_parts(self.parts[..self.parts.len() - 1].to_vec())
    }

    /// Splits an instance name into its kernel and its index vector.
    /// `micro[3][7]` becomes (`micro`, `[3, 7]`). Fails if identifier and
    /// index parts are interleaved.
    pub fn split_instance(&self) -> Result<(Reference, Vec<i64>)> {
        let kernel = self.head();
        let mut index = Vec::new();
        for part in &self.parts[kernel.len()..] {
            match part {
                ReferencePart::Index(i) => index.push(*i),
                ReferencePart::Identifier(_) => {
                    return Err(Error::Config(format!(
                        "'{}' is not a valid instance name",
                        self
                    )))
                }
            }
        }
        Ok((kernel, index))
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("'{}' is not a valid reference", text));

        let mut parts = Vec::new();
        let mut rest = text;
        let mut expect_identifier = true;
        while !rest.is_empty() {
            if expect_identifier {
                let end = rest
                    .find(|c| c == '.' || c == '[')
                    .unwrap_or(rest.len());
                let (name, tail) = rest.split_at(end);
                validate_identifier(name).map_err(|_| invalid())?;
                parts.push(ReferencePart::Identifier(name.to_string()));
                rest = tail;
                expect_identifier = false;
            } else if let Some(tail) = rest.strip_prefix('.') {
                rest = tail;
                expect_identifier = true;
            } else if let Some(tail) = rest.strip_prefix('[') {
                let end = tail.find(']').ok_or_else(invalid)?;
                let index = tail[..end].parse::<i64>().map_err(|_| invalid())?;
                if index < 0 {
                    return Err(invalid());
                }
                parts.push(ReferencePart::Index(index));
                rest = &tail[end + 1..];
            } else {
                return Err(invalid());
            }
        }
        if expect_identifier {
            return Err(invalid());
        }
        Reference::from_parts(parts)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            match part {
                ReferencePart::Identifier(name) => {
                    if i > 0 {
                        write!(f, ".{}", name)?;
                    } else {
                        write!(f, "{}", name)?;
                    }
                }
                ReferencePart::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reference({})", self)
    }
}

// References travel on the wire and appear as map keys in settings, so
// they serialize as their textual form.
impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        for text in ["macro", "micro[3][7]", "micro[3][7].out[2]", "a.b.c"] {
            let reference = Reference::new(text).unwrap();
            assert_eq!(reference.to_string(), text);
        }
    }

    #[test]
    fn rejects_invalid_references() {
        for text in ["", "[3]", "3abc", "a..b", "a[", "a[x]", "a.", "a[-1]"] {
            assert!(Reference::new(text).is_err(), "accepted '{}'", text);
        }
    }

    #[test]
    fn head_and_tail() {
        let reference = Reference::new("micro[3][7].out").unwrap();
        assert_eq!(reference.head(), Reference::new("micro").unwrap());
        assert_eq!(
            reference.tail(),
            vec![
                ReferencePart::Index(3),
                ReferencePart::Index(7),
                ReferencePart::Identifier("out".to_string()),
            ]
        );

        let plain = Reference::new("macro.out").unwrap();
        assert_eq!(plain.head(), plain);
        assert!(plain.tail().is_empty());
    }

    #[test]
    fn split_instance() {
        let (kernel, index) =
            Reference::new("micro[3][7]").unwrap().split_instance().unwrap();
        assert_eq!(kernel, Reference::new("micro").unwrap());
        assert_eq!(index, vec![3, 7]);

        let (kernel, index) =
            Reference::new("macro").unwrap().split_instance().unwrap();
        assert_eq!(kernel.to_string(), "macro");
        assert!(index.is_empty());

        assert!(Reference::new("micro[3].sub")
            .unwrap()
            .split_instance()
            .is_err());
    }

    #[test]
    fn prefix_and_concat() {
        let base = Reference::new("micro[3]").unwrap();
        let endpoint = base.concat(&Reference::new("out").unwrap());
        assert_eq!(endpoint.to_string(), "micro[3].out");
        assert!(endpoint.starts_with(&base));
        assert!(!base.starts_with(&endpoint));
    }

    #[test]
    fn parent_splits_off_port() {
        let endpoint = Reference::new("micro.in").unwrap();
        assert_eq!(endpoint.parent().unwrap().to_string(), "micro");
        assert_eq!(endpoint.last_identifier(), Some("in"));
        assert!(Reference::new("micro").unwrap().parent().is_err());
    }

    #[test]
    fn serializes_as_text() {
        let reference = Reference::new("micro[3].out").unwrap();
        let json = serde_json::to_string(&reference).unwrap();
        assert_eq!(json, "\"micro[3].out\"");
        let back: Reference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reference);
    }
}
