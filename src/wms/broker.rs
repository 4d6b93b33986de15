//! Requirement brokers.
//!
//! A broker augments a job's requirement list with placement constraints;
//! the dispatcher composes the site broker first, then the queue broker.
//! Placement itself stays with the external batch system.

use crate::error::{GcError, Result};
use crate::wms::Req;

pub trait Broker: Send + Sync + std::fmt::Debug {
    /// Return the requirement list extended with this broker's constraints.
    fn broker_add(&self, reqs: Vec<Req>) -> Vec<Req>;
}

/// Adds a user-configured site or queue list unless the job already
/// carries one. An empty configuration is a pass-through.
#[derive(Debug)]
pub struct UserBroker {
    constraint: Option<Req>,
}

impl UserBroker {
    pub fn sites(sites: Vec<String>) -> Self {
        UserBroker {
            constraint: (!sites.is_empty()).then_some(Req::Sites(sites)),
        }
    }

    pub fn queues(queues: Vec<String>) -> Self {
        UserBroker {
            constraint: (!queues.is_empty()).then_some(Req::Queues(queues)),
        }
    }
}

impl Broker for UserBroker {
    fn broker_add(&self, mut reqs: Vec<Req>) -> Vec<Req> {
        if let Some(constraint) = &self.constraint {
            let already = reqs.iter().any(|req| {
                matches!(
                    (req, constraint),
                    (Req::Sites(_), Req::Sites(_)) | (Req::Queues(_), Req::Queues(_))
                )
            });
            if !already {
                reqs.push(constraint.clone());
            }
        }
        reqs
    }
}

/// Instantiate a broker by its configured plugin name.
pub fn create_broker(name: &str, sites: Vec<String>, queues: Vec<String>, site_side: bool) -> Result<Box<dyn Broker>> {
    match name {
        "UserBroker" | "user" => Ok(Box::new(if site_side {
            UserBroker::sites(sites)
        } else {
            UserBroker::queues(queues)
        })),
        other => Err(GcError::Config(format!("unknown broker plugin: {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_broker_appends_configured_queues() {
        let broker = UserBroker::queues(vec!["short".to_string()]);
        let reqs = broker.broker_add(vec![Req::WallTime(60)]);
        assert!(reqs.contains(&Req::Queues(vec!["short".to_string()])));
    }

    #[test]
    fn user_broker_respects_existing_constraint() {
        let broker = UserBroker::queues(vec!["short".to_string()]);
        let existing = Req::Queues(vec!["long".to_string()]);
        let reqs = broker.broker_add(vec![existing.clone()]);
        assert_eq!(reqs, vec![existing]);
    }

    #[test]
    fn empty_configuration_is_a_passthrough() {
        let broker = UserBroker::sites(Vec::new());
        let reqs = vec![Req::Cpus(2)];
        assert_eq!(broker.broker_add(reqs.clone()), reqs);
    }

    #[test]
    fn unknown_plugin_is_a_config_error() {
        let err = create_broker("FancyBroker", vec![], vec![], true).unwrap_err();
        assert!(matches!(err, GcError::Config(_)), "got {err:?}");
    }
}
