//! Flat label map to node tree.

use std::collections::{BTreeMap, HashMap};

use crate::labels::DecodeError;

/// A decoded label path: either a value or a set of named children.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(String),
    Branch(BTreeMap<String, Node>),
}

impl Node {
    fn empty() -> Self {
        Node::Branch(BTreeMap::new())
    }
}

/// Build the tree of all labels below `prefix` whose first segment is one
/// of `roots` (compared case-insensitively).
///
/// Segment case is preserved; struct fields are matched case-insensitively
/// at decode time so router and service names keep the case they were
/// declared with.
pub fn parse(
    labels: &HashMap<String, String>,
    prefix: &str,
    roots: &[&str],
) -> Result<Node, DecodeError> {
    let mut root = Node::empty();

    for (key, value) in labels {
        let Some(path) = strip_prefix(key, prefix) else {
            continue;
        };

        let segments: Vec<&str> = path.split('.').collect();
        if !roots.iter().any(|r| r.eq_ignore_ascii_case(segments[0])) {
            continue;
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(DecodeError::new(key.clone(), "empty path segment"));
        }

        insert(&mut root, &segments, value, key)?;
    }

    Ok(root)
}

fn strip_prefix<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let head = key.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    key[prefix.len()..].strip_prefix('.')
}

fn insert(node: &mut Node, segments: &[&str], value: &str, key: &str) -> Result<(), DecodeError> {
    let Node::Branch(children) = node else {
        return Err(DecodeError::new(key, "label is both a value and a parent"));
    };

    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return Ok(()),
    };

    if rest.is_empty() {
        if children.contains_key(*head) {
            return Err(DecodeError::new(key, "label is both a value and a parent"));
        }
        children.insert(head.to_string(), Node::Leaf(value.to_string()));
        return Ok(());
    }

    let child = children.entry(head.to_string()).or_insert_with(Node::empty);
    insert(child, rest, value, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_builds_nested_tree() {
        let labels = labels(&[
            ("traefik.http.routers.Api.rule", "Host(`a`)"),
            ("traefik.http.routers.Api.service", "api"),
            ("traefik.enable", "true"),
            ("com.docker.compose.project", "demo"),
        ]);

        let node = parse(&labels, "traefik", &["http"]).unwrap();
        let Node::Branch(root) = node else {
            panic!("root must be a branch");
        };
        assert_eq!(root.len(), 1);

        let Node::Branch(http) = &root["http"] else {
            panic!("http must be a branch");
        };
        let Node::Branch(routers) = &http["routers"] else {
            panic!("routers must be a branch");
        };
        // Router names keep their case
        assert!(routers.contains_key("Api"));
    }

    #[test]
    fn test_prefix_is_case_insensitive() {
        let labels = labels(&[("Traefik.HTTP.routers.a.rule", "Path(`/`)")]);
        let node = parse(&labels, "traefik", &["http"]).unwrap();
        let Node::Branch(root) = node else {
            panic!("root must be a branch");
        };
        assert!(root.contains_key("HTTP"));
    }

    #[test]
    fn test_value_and_parent_conflict() {
        let labels = labels(&[
            ("traefik.http.middlewares.m.compress", "true"),
            ("traefik.http.middlewares.m.compress.minresponsebodybytes", "10"),
        ]);
        assert!(parse(&labels, "traefik", &["http"]).is_err());
    }

    #[test]
    fn test_empty_segment_rejected() {
        let labels = labels(&[("traefik.http..rule", "x")]);
        assert!(parse(&labels, "traefik", &["http"]).is_err());
    }
}
