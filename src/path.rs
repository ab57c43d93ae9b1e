//! Attribute paths.
//!
//! An `AttrPath` is the ordered list of attribute names and collection
//! indices leading from a datablock root to a nested value, for instance
//! `["layers", 0, "strokes", 1, "points"]`. Paths key bulk buffer updates
//! and unresolved reference slots, and identify the failing property in
//! error messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step in an attribute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathStep {
    Field(String),
    Index(usize),
}

impl From<&str> for PathStep {
    fn from(name: &str) -> Self {
        PathStep::Field(name.to_string())
    }
}

impl From<usize> for PathStep {
    fn from(index: usize) -> Self {
        PathStep::Index(index)
    }
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathStep::Field(name) => write!(f, "{}", name),
            PathStep::Index(index) => write!(f, "[{}]", index),
        }
    }
}

/// Path from a datablock root to a nested attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttrPath(pub Vec<PathStep>);

impl AttrPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, step: impl Into<PathStep>) {
        self.0.push(step.into());
    }

    pub fn pop(&mut self) -> Option<PathStep> {
        self.0.pop()
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.0
    }
}

impl fmt::Display for AttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            match step {
                PathStep::Field(name) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{}", name)?;
                }
                PathStep::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

impl<S: Into<PathStep>> FromIterator<S> for AttrPath {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let mut path = AttrPath::new();
        path.push("layers");
        path.push(0usize);
        path.push("strokes");
        path.push(1usize);
        path.push("points");
        assert_eq!(path.to_string(), "layers[0].strokes[1].points");
    }

    #[test]
    fn test_serde_roundtrip() {
        let path: AttrPath = AttrPath(vec![
            PathStep::Field("vertices".into()),
            PathStep::Index(3),
        ]);
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, r#"["vertices",3]"#);
        let back: AttrPath = serde_json::from_str(&json).unwrap();
        assert_eq!(path, back);
    }
}
