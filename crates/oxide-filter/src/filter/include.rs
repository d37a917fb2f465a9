//! Include trees naming the related records to attach to results.

use serde_json::Value as Json;

use crate::error::FilterError;
use crate::schema::{EntityDef, SchemaRegistry};

/// A normalized include tree: an ordered map from relationship name to the
/// includes wanted below it.
///
/// `"a"`, `["a", "b"]`, `{"a": "b"}` and nested mixes of these all
/// normalize to this shape. Repeated relationships merge, so
/// `["a", {"a": "b"}]` equals `{"a": "b"}`. A dotted string `"a.b"` is
/// shorthand for `{"a": "b"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludeTree {
    children: Vec<(String, IncludeTree)>,
}

impl IncludeTree {
    /// Parses an include value.
    pub fn parse(json: &Json) -> Result<Self, FilterError> {
        let mut tree = Self::default();
        tree.merge_json(json)?;
        Ok(tree)
    }

    /// Builds a tree from dotted paths.
    pub fn from_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> Result<Self, FilterError> {
        let mut tree = Self::default();
        for path in paths {
            tree.insert_dotted(path)?;
        }
        Ok(tree)
    }

    fn merge_json(&mut self, json: &Json) -> Result<(), FilterError> {
        match json {
            Json::String(path) => self.insert_dotted(path),
            Json::Array(items) => items.iter().try_for_each(|item| self.merge_json(item)),
            Json::Object(map) => {
                for (name, nested) in map {
                    check_name(name)?;
                    let mut subtree = Self::default();
                    subtree.merge_json(nested)?;
                    self.child_mut(name).merge(subtree);
                }
                Ok(())
            }
            other => Err(FilterError::Malformed(format!(
                "include must be a string, list or object, got {other}"
            ))),
        }
    }

    fn insert_dotted(&mut self, path: &str) -> Result<(), FilterError> {
        let mut node = self;
        for name in path.split('.') {
            check_name(name)?;
            node = node.child_mut(name);
        }
        Ok(())
    }

    fn child_mut(&mut self, name: &str) -> &mut Self {
        let index = match self.children.iter().position(|(n, _)| n == name) {
            Some(index) => index,
            None => {
                self.children.push((name.to_string(), Self::default()));
                self.children.len() - 1
            }
        };
        &mut self.children[index].1
    }

    /// Merges another tree into this one.
    pub fn merge(&mut self, other: Self) {
        for (name, subtree) in other.children {
            self.child_mut(&name).merge(subtree);
        }
    }

    /// Returns whether nothing is included.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Iterates over the top-level relationships and their subtrees.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Self)> {
        self.children.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Returns the subtree below a relationship.
    pub fn get(&self, name: &str) -> Option<&Self> {
        self.children
            .iter()
            .find_map(|(n, t)| (n == name).then_some(t))
    }

    /// Returns the number of relationship hops on the deepest branch.
    pub fn depth(&self) -> usize {
        self.children
            .iter()
            .map(|(_, t)| 1 + t.depth())
            .max()
            .unwrap_or(0)
    }

    /// Returns every node as a dotted path, parents before children.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, subtree) in &self.children {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            out.push(path.clone());
            subtree.collect_paths(&path, out);
        }
    }

    /// Checks every node against the schema and the depth limit.
    pub fn validate(
        &self,
        schema: &SchemaRegistry,
        entity: &EntityDef,
        max_depth: usize,
    ) -> Result<(), FilterError> {
        if self.depth() > max_depth {
            let deepest = self
                .paths()
                .into_iter()
                .max_by_key(|p| p.split('.').count())
                .unwrap_or_default();
            return Err(FilterError::DepthExceeded {
                path: deepest,
                max: max_depth,
            });
        }
        for (name, subtree) in &self.children {
            let rel = entity.relationship_def(name)?;
            subtree.validate(schema, schema.entity(&rel.target)?, max_depth)?;
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<(), FilterError> {
    if name.is_empty() {
        return Err(FilterError::Malformed(
            "include names must not be empty".to_string(),
        ));
    }
    Ok(())
}
