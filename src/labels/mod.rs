//! Annotation decoding.
//!
//! # Data Flow
//! ```text
//! flat labels ("traefik.http.routers.api.rule" = "...")
//!     → parser.rs (filter by prefix/roots, build node tree)
//!     → decode.rs (serde Deserializer over the tree)
//!     → typed structure (Configuration, provider control labels, ...)
//! ```

pub mod decode;
pub mod parser;

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::dynamic::Configuration;
use self::decode::NodeDeserializer;

/// Label decoding failure, with the dotted label path that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    path: String,
    message: String,
}

impl DecodeError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn message(message: impl Into<String>) -> Self {
        Self::new(String::new(), message)
    }

    /// Prefix the error path with the parent segment.
    pub(crate) fn within(mut self, segment: &str) -> Self {
        self.path = if self.path.is_empty() {
            segment.to_string()
        } else {
            format!("{segment}.{}", self.path)
        };
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

impl std::error::Error for DecodeError {}

impl serde::de::Error for DecodeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self::message(msg.to_string())
    }
}

/// Decode the labels below `prefix` whose first segment is in `roots`.
pub fn decode<T: DeserializeOwned>(
    labels: &HashMap<String, String>,
    prefix: &str,
    roots: &[&str],
) -> Result<T, DecodeError> {
    let tree = parser::parse(labels, prefix, roots)?;
    T::deserialize(NodeDeserializer::new(tree)).map_err(|e| e.within(prefix))
}

/// Decode an entity's routing fragment (`<prefix>.http|tcp|udp|tls.*`).
///
/// Declared HTTP load balancers receive their defaults here, so two
/// entities that differ only by spelling out a default value still merge.
pub fn decode_configuration(
    labels: &HashMap<String, String>,
    prefix: &str,
) -> Result<Configuration, DecodeError> {
    let mut configuration: Configuration = decode(labels, prefix, &["http", "tcp", "udp", "tls"])?;

    for service in configuration.http.services.values_mut() {
        if let Some(lb) = service.load_balancer.as_mut() {
            lb.set_defaults();
        }
    }

    Ok(configuration)
}

/// Provider control labels (`<prefix>.enable`, `<prefix>.docker.*`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControlLabels {
    pub enable: Option<bool>,
    pub docker: DockerControlLabels,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DockerControlLabels {
    pub network: Option<String>,
    #[serde(rename = "lbswarm")]
    pub lb_swarm: Option<bool>,
}

/// Decode the provider control labels.
pub fn decode_control(
    labels: &HashMap<String, String>,
    prefix: &str,
) -> Result<ControlLabels, DecodeError> {
    decode(labels, prefix, &["enable", "docker"])
}
