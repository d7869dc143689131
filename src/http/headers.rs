//! Origin header collection
//!
//! Field names are normalized to lowercase the moment they are inserted,
//! the same convention the bridge uses for its per-stream request header
//! list. Lookups are therefore plain equality on the stored name, and a
//! collection round-tripped through HTTP/2 submission needs no further
//! case folding.
//!
//! Repeated names are legal and preserved in arrival order;
//! [`Headers::get_unique`] exists for callers that must tell "absent",
//! "present once" and "duplicated" apart.

use super::{Error, Result, MAX_HEADERS};
use std::fmt;

/// An ordered multimap of HTTP header fields with lowercase names
#[derive(Debug, Clone, Default)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty collection
    pub fn new() -> Self {
        Headers { fields: Vec::new() }
    }

    /// Add a field, keeping any fields of the same name already present
    ///
    /// The name is lowercased on the way in. Once `MAX_HEADERS` fields are
    /// stored, further insertions are dropped rather than failing the
    /// message.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.fields.len() >= MAX_HEADERS {
            return;
        }
        let mut name = name.into();
        name.make_ascii_lowercase();
        self.fields.push((name, value.into()));
    }

    /// First value stored under `name`, if any
    pub fn get(&self, name: &str) -> Option<&str> {
        let needle = name.to_ascii_lowercase();
        for (n, v) in &self.fields {
            if *n == needle {
                return Some(v);
            }
        }
        None
    }

    /// Value of a field that occurs exactly once
    ///
    /// Duplicated fields yield `None`, exactly like absent ones; callers
    /// that need the distinction pair this with [`Headers::count`].
    pub fn get_unique(&self, name: &str) -> Option<&str> {
        let needle = name.to_ascii_lowercase();
        let mut found: Option<&str> = None;
        for (n, v) in &self.fields {
            if *n == needle {
                if found.is_some() {
                    return None;
                }
                found = Some(v);
            }
        }
        found
    }

    /// Every value stored under `name`, in arrival order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let needle = name.to_ascii_lowercase();
        let mut values = Vec::new();
        for (n, v) in &self.fields {
            if *n == needle {
                values.push(v.as_str());
            }
        }
        values
    }

    /// Number of fields stored under `name`
    pub fn count(&self, name: &str) -> usize {
        self.get_all(name).len()
    }

    /// Whether at least one field named `name` is present
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Delete every field named `name`, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let needle = name.to_ascii_lowercase();
        let before = self.fields.len();
        self.fields.retain(|(n, _)| *n != needle);
        before - self.fields.len()
    }

    /// Total number of stored fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no fields are stored
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Visit all fields in arrival order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Split one wire-format header line into its name and value
    ///
    /// The name keeps its wire casing here; normalization happens at
    /// insertion. Surrounding whitespace on the value is trimmed.
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidHeader(format!("header line without colon: {line}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidHeader("header line without a name".to_string()));
        }
        Ok((name.to_string(), value.trim().to_string()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            writeln!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}
