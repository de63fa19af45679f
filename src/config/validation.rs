//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check endpoint schemes the engine client can speak
//! - Parse default-rule templates and constraint expressions up front
//! - Validate value ranges (refresh interval > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: DiscoveryConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;
use url::Url;

use crate::config::schema::{DiscoveryConfig, ProviderOptions};
use crate::constraints::Constraint;
use crate::provider::rule::RuleTemplate;

const SUPPORTED_SCHEMES: &[&str] = &["unix", "tcp", "http"];

/// A single semantic problem, tagged with the config section it came from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{section}: unsupported endpoint {endpoint:?}")]
    Endpoint { section: String, endpoint: String },

    #[error("{section}: invalid default rule: {message}")]
    DefaultRule { section: String, message: String },

    #[error("{section}: invalid constraints: {message}")]
    Constraints { section: String, message: String },

    #[error("{section}: label prefix must not be empty")]
    LabelPrefix { section: String },

    #[error("swarm: refresh_seconds must be greater than 0")]
    RefreshInterval,

    #[error("admin: invalid bind address {0:?}")]
    AdminAddress(String),
}

/// Validate the whole configuration, collecting every error.
pub fn validate_config(config: &DiscoveryConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Some(docker) = &config.docker {
        validate_provider("docker", &docker.options, &mut errors);
    }

    if let Some(swarm) = &config.swarm {
        validate_provider("swarm", &swarm.options, &mut errors);
        if swarm.refresh_seconds == 0 {
            errors.push(ValidationError::RefreshInterval);
        }
    }

    if config.admin.enabled
        && config.admin.bind_address.parse::<std::net::SocketAddr>().is_err()
    {
        errors.push(ValidationError::AdminAddress(config.admin.bind_address.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_provider(section: &str, options: &ProviderOptions, errors: &mut Vec<ValidationError>) {
    let scheme_ok = Url::parse(&options.endpoint)
        .map(|url| SUPPORTED_SCHEMES.contains(&url.scheme()))
        .unwrap_or(false);
    if !scheme_ok {
        errors.push(ValidationError::Endpoint {
            section: section.to_string(),
            endpoint: options.endpoint.clone(),
        });
    }

    if let Err(e) = RuleTemplate::parse(&options.default_rule) {
        errors.push(ValidationError::DefaultRule {
            section: section.to_string(),
            message: e.to_string(),
        });
    }

    if let Err(e) = Constraint::parse(&options.constraints) {
        errors.push(ValidationError::Constraints {
            section: section.to_string(),
            message: e.to_string(),
        });
    }

    if options.label_prefix.is_empty() {
        errors.push(ValidationError::LabelPrefix {
            section: section.to_string(),
        });
    }
}
