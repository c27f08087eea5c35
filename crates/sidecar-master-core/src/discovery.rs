//! Service discovery seam.
//!
//! Runners advertise their command interface under their service name. The
//! discovery collaborator resolves those advertisements into [`ServiceEntry`]
//! values and reports them to the master as found/lost notifications. Only the
//! static, config-driven source lives here; zeroconf browsing is external.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::status::RunnerId;

/// Resolved address of a runner's command interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A discovered runner service. `endpoint` is `None` until resolution finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub id: RunnerId,
    pub endpoint: Option<Endpoint>,
}

impl ServiceEntry {
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.endpoint.is_some()
    }
}

/// Static service entry as written in the master config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticService {
    /// Service name, `configuration:host:runner`.
    pub service: String,
    pub host: String,
    pub port: u16,
}

/// Discovery source backed by a fixed list of services.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    entries: Vec<ServiceEntry>,
}

impl StaticDiscovery {
    /// Build from config entries. Entries with malformed service names are
    /// skipped with a warning.
    #[must_use]
    pub fn from_config(services: &[StaticService]) -> Self {
        let entries = services
            .iter()
            .filter_map(|svc| match svc.service.parse::<RunnerId>() {
                Ok(id) => Some(ServiceEntry {
                    id,
                    endpoint: Some(Endpoint::new(svc.host.clone(), svc.port)),
                }),
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring static discovery entry");
                    None
                }
            })
            .collect();
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[ServiceEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_discovery_skips_bad_names() {
        let discovery = StaticDiscovery::from_config(&[
            StaticService {
                service: "alpha:node1:Runner 1".to_string(),
                host: "node1".to_string(),
                port: 9000,
            },
            StaticService {
                service: "broken".to_string(),
                host: "node2".to_string(),
                port: 9001,
            },
        ]);
        assert_eq!(discovery.entries().len(), 1);
        let entry = &discovery.entries()[0];
        assert!(entry.is_resolved());
        assert_eq!(entry.id.runner, "Runner 1");
        assert_eq!(
            entry.endpoint.as_ref().map(ToString::to_string).as_deref(),
            Some("node1:9000")
        );
    }
}
