//! Validation and resolution of graph resource names.
//!
//! Names are normalized to absolute form exactly once, when an entity is
//! registered, and all registry maps are keyed by the absolute form.

use lazy_static::lazy_static;
use regex::Regex;
use rosnative_common::{Error, Result};

lazy_static! {
    // A single name segment: letter first, then letters / digits / underscores
    static ref SEGMENT_RE: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap();
}

/// Validates a node name: one bare segment, no slashes.
pub(crate) fn validate_node_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::ConfigInvalid("name not provided".to_owned()));
    }
    if name.contains('/') {
        return Err(Error::ConfigInvalid(
            "name cannot contain slashes (/), use the namespace to set a namespace".to_owned(),
        ));
    }
    if !SEGMENT_RE.is_match(name) {
        return Err(Error::ConfigInvalid(format!("invalid name: {name}")));
    }
    Ok(())
}

/// Validates a namespace: absolute, and no trailing slash except for the root.
pub(crate) fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() || !namespace.starts_with('/') {
        return Err(Error::ConfigInvalid(
            "namespace must begin with a slash (/)".to_owned(),
        ));
    }
    if namespace != "/" && namespace.ends_with('/') {
        return Err(Error::ConfigInvalid(
            "namespace can't end with a slash (/)".to_owned(),
        ));
    }
    if namespace != "/" {
        for segment in namespace[1..].split('/') {
            if !SEGMENT_RE.is_match(segment) {
                return Err(Error::ConfigInvalid(format!(
                    "invalid namespace: {namespace}"
                )));
            }
        }
    }
    Ok(())
}

/// Validates a topic or service name, which may be absolute or relative.
pub(crate) fn validate_graph_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::ConfigInvalid("name not provided".to_owned()));
    }
    let relative = name.strip_prefix('/').unwrap_or(name);
    if relative.is_empty() {
        return Err(Error::ConfigInvalid(format!("invalid name: {name}")));
    }
    for segment in relative.split('/') {
        if !SEGMENT_RE.is_match(segment) {
            return Err(Error::ConfigInvalid(format!("invalid name: {name}")));
        }
    }
    Ok(())
}

/// Resolves a possibly-relative name against a namespace.
pub(crate) fn resolve(namespace: &str, name: &str) -> String {
    if name.starts_with('/') {
        return name.to_owned();
    }
    if namespace == "/" {
        return format!("/{name}");
    }
    format!("{namespace}/{name}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn absolute_names_pass_through() {
        assert_eq!(resolve("/", "/abs"), "/abs");
        assert_eq!(resolve("/ns", "/abs"), "/abs");
    }

    #[test]
    fn relative_names_resolve_against_namespace() {
        assert_eq!(resolve("/", "topic"), "/topic");
        assert_eq!(resolve("/ns", "topic"), "/ns/topic");
        assert_eq!(resolve("/a/b", "topic"), "/a/b/topic");
    }

    #[test]
    fn node_name_rejects_slashes_and_empty() {
        assert!(validate_node_name("talker").is_ok());
        assert!(validate_node_name("").is_err());
        assert!(validate_node_name("a/b").is_err());
        assert!(validate_node_name("1leading_digit").is_err());
    }

    #[test]
    fn namespace_must_be_absolute_without_trailing_slash() {
        assert!(validate_namespace("/").is_ok());
        assert!(validate_namespace("/ns").is_ok());
        assert!(validate_namespace("/a/b").is_ok());
        assert!(validate_namespace("ns").is_err());
        assert!(validate_namespace("/ns/").is_err());
        assert!(validate_namespace("").is_err());
    }

    #[test]
    fn graph_names_allow_nested_segments() {
        assert!(validate_graph_name("/a/b/c").is_ok());
        assert!(validate_graph_name("chatter").is_ok());
        assert!(validate_graph_name("/").is_err());
        assert!(validate_graph_name("a//b").is_err());
    }
}
