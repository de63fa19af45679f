//! Which entities may contribute routes.

use crate::constraints::{Constraint, ConstraintError};
use crate::discovery::EntityRecord;

/// Excludes disabled, non-matching, not yet networked and (by default)
/// unhealthy entities.
#[derive(Debug)]
pub struct EligibilityFilter {
    constraint: Result<Constraint, ConstraintError>,
    allow_empty_services: bool,
}

impl EligibilityFilter {
    /// A malformed expression is kept as an error and excludes everything.
    pub fn new(constraints: &str, allow_empty_services: bool) -> Self {
        Self {
            constraint: Constraint::parse(constraints),
            allow_empty_services,
        }
    }

    pub fn keep(&self, entity: &EntityRecord) -> bool {
        if !entity.extra.enable {
            tracing::debug!(container = %entity.name, "Filtering disabled container");
            return false;
        }

        match &self.constraint {
            Ok(constraint) if constraint.matches(&entity.labels) => {}
            Ok(_) => {
                tracing::debug!(container = %entity.name, "Container pruned by constraint expression");
                return false;
            }
            Err(e) => {
                tracing::error!(container = %entity.name, error = %e, "Error matching constraint expression");
                return false;
            }
        }

        if !entity.network.is_ready() {
            tracing::debug!(container = %entity.name, "Filtering container without networks");
            return false;
        }

        if !self.allow_empty_services && !entity.health.is_serving() {
            tracing::debug!(
                container = %entity.name,
                health = ?entity.health,
                "Filtering unhealthy or starting container"
            );
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{HealthState, NetworkAttachment, NetworkMode};
    use std::collections::HashMap;

    fn entity(enable: bool, health: HealthState, labels: &[(&str, &str)]) -> EntityRecord {
        let mut record = EntityRecord {
            name: "web".into(),
            health,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        };
        record.extra.enable = enable;
        record.network.networks.insert(
            "bridge".into(),
            NetworkAttachment {
                id: "net1".into(),
                address: "172.17.0.2".into(),
            },
        );
        record
    }

    #[test]
    fn test_disabled_is_excluded() {
        let filter = EligibilityFilter::new("", false);
        assert!(filter.keep(&entity(true, HealthState::None, &[])));
        assert!(!filter.keep(&entity(false, HealthState::None, &[])));
    }

    #[test]
    fn test_constraints() {
        let filter = EligibilityFilter::new(r#"Label("tier", "front")"#, false);
        assert!(filter.keep(&entity(true, HealthState::Healthy, &[("tier", "front")])));
        assert!(!filter.keep(&entity(true, HealthState::Healthy, &[("tier", "back")])));
    }

    #[test]
    fn test_malformed_constraint_excludes_without_panicking() {
        let filter = EligibilityFilter::new(r#"Label("tier""#, false);
        assert!(!filter.keep(&entity(true, HealthState::Healthy, &[("tier", "front")])));
    }

    #[test]
    fn test_health() {
        let strict = EligibilityFilter::new("", false);
        assert!(strict.keep(&entity(true, HealthState::Healthy, &[])));
        assert!(!strict.keep(&entity(true, HealthState::Unhealthy, &[])));
        assert!(!strict.keep(&entity(true, HealthState::Starting, &[])));

        let lenient = EligibilityFilter::new("", true);
        assert!(lenient.keep(&entity(true, HealthState::Unhealthy, &[])));
        assert!(lenient.keep(&entity(true, HealthState::Starting, &[])));
    }

    #[test]
    fn test_entity_without_networks_is_excluded() {
        let filter = EligibilityFilter::new("", true);
        let mut joining = entity(true, HealthState::None, &[]);
        joining.network.networks.clear();
        assert!(!filter.keep(&joining));

        joining.network.mode = NetworkMode::Host;
        assert!(filter.keep(&joining));
    }
}
