//! Transport selection: caller preference if valid, otherwise inferred from
//! the agent's registered configuration.

use crate::errors::TransportError;
use crate::exec::agent::AgentConfig;
use serde::{Deserialize, Serialize};

/// How the invoker reaches an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Handler object inside the coordinator process.
    InProcess,
    /// Spawned command; inputs passed as a JSON argument.
    Subprocess,
    /// HTTP POST to the agent's endpoint.
    Webhook,
    /// Container run via the container CLI.
    Container,
    /// Spawned command; inputs streamed over stdin as JSON.
    StdioChannel,
}

/// Pick the transport for an invocation.
///
/// A caller-specified transport is honored when the config supports it.
/// Otherwise inference order: endpoint → Webhook, command → Subprocess,
/// image → Container, handler id → InProcess.
pub fn select_transport(
    requested: Option<TransportKind>,
    config: &AgentConfig,
) -> Result<TransportKind, TransportError> {
    let kind = match requested.or(config.transport) {
        Some(kind) => kind,
        None => infer(config)?,
    };
    validate(kind, config)?;
    Ok(kind)
}

fn infer(config: &AgentConfig) -> Result<TransportKind, TransportError> {
    if config.endpoint.is_some() {
        Ok(TransportKind::Webhook)
    } else if config.command.is_some() {
        Ok(TransportKind::Subprocess)
    } else if config.image.is_some() {
        Ok(TransportKind::Container)
    } else if config.handler_id.is_some() {
        Ok(TransportKind::InProcess)
    } else {
        Err(TransportError::NoTransport {
            agent: config.agent_id.clone(),
        })
    }
}

fn validate(kind: TransportKind, config: &AgentConfig) -> Result<(), TransportError> {
    let unavailable = || TransportError::TransportUnavailable {
        agent: config.agent_id.clone(),
        transport: kind,
    };
    match kind {
        TransportKind::Webhook => {
            let endpoint = config.endpoint.as_ref().ok_or_else(unavailable)?;
            let url = reqwest::Url::parse(endpoint).map_err(|err| {
                TransportError::InvalidEndpoint {
                    agent: config.agent_id.clone(),
                    endpoint: endpoint.clone(),
                    reason: err.to_string(),
                }
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(TransportError::InvalidEndpoint {
                    agent: config.agent_id.clone(),
                    endpoint: endpoint.clone(),
                    reason: format!("unsupported scheme '{}'", url.scheme()),
                });
            }
            Ok(())
        }
        TransportKind::Subprocess | TransportKind::StdioChannel => {
            let command = config.command.as_ref().ok_or_else(unavailable)?;
            if command.is_empty() {
                return Err(unavailable());
            }
            Ok(())
        }
        TransportKind::Container => {
            config.image.as_ref().ok_or_else(unavailable)?;
            Ok(())
        }
        TransportKind::InProcess => {
            config.handler_id.as_ref().ok_or_else(unavailable)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentConfig {
        AgentConfig::new("worker", "in", "out")
    }

    #[test]
    fn infers_webhook_from_endpoint() {
        let config = agent().with_endpoint("http://localhost:8080/run");
        assert_eq!(
            select_transport(None, &config).unwrap(),
            TransportKind::Webhook
        );
    }

    #[test]
    fn infers_subprocess_from_command() {
        let config = agent().with_command(vec!["run-agent".into()]);
        assert_eq!(
            select_transport(None, &config).unwrap(),
            TransportKind::Subprocess
        );
    }

    #[test]
    fn infers_container_from_image() {
        let config = agent().with_image("registry.local/worker:1");
        assert_eq!(
            select_transport(None, &config).unwrap(),
            TransportKind::Container
        );
    }

    #[test]
    fn infers_in_process_from_handler() {
        let config = agent().with_handler("echo");
        assert_eq!(
            select_transport(None, &config).unwrap(),
            TransportKind::InProcess
        );
    }

    #[test]
    fn endpoint_wins_over_command() {
        let config = agent()
            .with_endpoint("http://localhost:8080/run")
            .with_command(vec!["run-agent".into()]);
        assert_eq!(
            select_transport(None, &config).unwrap(),
            TransportKind::Webhook
        );
    }

    #[test]
    fn caller_choice_honored_when_valid() {
        let config = agent()
            .with_endpoint("http://localhost:8080/run")
            .with_command(vec!["run-agent".into()]);
        assert_eq!(
            select_transport(Some(TransportKind::StdioChannel), &config).unwrap(),
            TransportKind::StdioChannel
        );
    }

    #[test]
    fn caller_choice_rejected_without_config() {
        let config = agent().with_command(vec!["run-agent".into()]);
        assert!(matches!(
            select_transport(Some(TransportKind::Webhook), &config),
            Err(TransportError::TransportUnavailable { .. })
        ));
    }

    #[test]
    fn rejects_invalid_endpoint_url() {
        let config = agent().with_endpoint("not a url");
        assert!(matches!(
            select_transport(None, &config),
            Err(TransportError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn rejects_non_http_scheme() {
        let config = agent().with_endpoint("ftp://example.com/run");
        assert!(matches!(
            select_transport(None, &config),
            Err(TransportError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn no_transport_at_all() {
        assert!(matches!(
            select_transport(None, &agent()),
            Err(TransportError::NoTransport { .. })
        ));
    }
}
