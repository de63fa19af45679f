//! Reconciliation: entities in, one canonical configuration out.
//!
//! # Data Flow
//! ```text
//! Snapshot (enumeration order)
//!     → eligibility.rs (enable flag, constraints, health)
//!     → labels::decode_configuration (per-entity fragment)
//!     → builder.rs (servers via endpoint.rs, default rule via rule.rs)
//!     → merge.rs (identical-or-drop across entities)
//!     → Configuration
//!
//! watch.rs drives passes: Connecting → Streaming → Retrying
//! ```
//!
//! # Design Decisions
//! - A pass is a pure function of the snapshot and the provider options
//! - Entity-local failures are logged and skip the entity, never the pass
//! - Enumeration order is the only tie-break and is preserved end to end

pub mod builder;
pub mod eligibility;
pub mod endpoint;
pub mod merge;
pub mod rule;
pub mod watch;

use std::sync::Arc;

use crate::config::ProviderOptions;
use crate::discovery::Snapshot;
use crate::dynamic::Configuration;
use crate::labels;
use crate::observability::metrics;

use self::builder::FragmentBuilder;
use self::eligibility::EligibilityFilter;
use self::endpoint::{HostResolver, SystemResolver};
use self::merge::Fragment;
use self::rule::{RuleTemplate, TemplateError};

pub use watch::WatchLoop;

/// Replace every run of characters that are not letters or digits with `-`,
/// trimming them at both ends. Case is preserved.
pub fn normalize(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Runs reconciliation passes for one provider.
#[derive(Debug)]
pub struct Reconciler<R = SystemResolver> {
    name: String,
    options: Arc<ProviderOptions>,
    default_rule: RuleTemplate,
    filter: EligibilityFilter,
    hosts: R,
}

impl Reconciler {
    /// Fails when the default-rule template does not parse.
    pub fn new(name: impl Into<String>, options: Arc<ProviderOptions>) -> Result<Self, TemplateError> {
        Self::with_resolver(name, options, SystemResolver)
    }
}

impl<R: HostResolver> Reconciler<R> {
    pub fn with_resolver(
        name: impl Into<String>,
        options: Arc<ProviderOptions>,
        hosts: R,
    ) -> Result<Self, TemplateError> {
        let default_rule = RuleTemplate::parse(&options.default_rule)?;
        let filter = EligibilityFilter::new(&options.constraints, options.allow_empty_services);
        Ok(Self {
            name: name.into(),
            options,
            default_rule,
            filter,
            hosts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// One full pass over `snapshot`.
    pub fn reconcile(&self, snapshot: &Snapshot) -> Configuration {
        let builder = FragmentBuilder::new(&self.options, &self.default_rule, snapshot, &self.hosts);

        let mut fragments = Vec::with_capacity(snapshot.entities.len());
        for entity in &snapshot.entities {
            if !self.filter.keep(entity) {
                continue;
            }

            let decoded = match labels::decode_configuration(&entity.labels, &self.options.label_prefix) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::error!(
                        provider = %self.name,
                        container = %entity.name,
                        error = %e,
                        "Skip container: invalid labels"
                    );
                    continue;
                }
            };

            match builder.build(entity, decoded) {
                Ok(configuration) => fragments.push(Fragment {
                    origin: entity.name.clone(),
                    configuration,
                }),
                Err(e) => {
                    tracing::error!(
                        provider = %self.name,
                        container = %entity.name,
                        error = %e,
                        "Skip container: unable to build its configuration"
                    );
                }
            }
        }

        metrics::record_entities(&self.name, fragments.len());
        merge::merge(&self.name, fragments)
    }
}
