//! gRPC control plane: request/response surface over tcp (optionally
//! mTLS) or a unix domain socket.

pub mod credentials;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use tokio::net::{TcpListener, UnixListener};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

use crate::agent::{ComputeBladeAgent, ControlError, StatusSnapshot};
use crate::config::{ListenConfig, ListenMode};
use crate::events::Event;
use crate::hal::PowerStatus;
use crate::proto;
use crate::proto::blade_agent_service_server::{BladeAgentService, BladeAgentServiceServer};
use credentials::CredentialManager;

/// Commit the binary was built from, stamped by CI.
const BUILD_COMMIT: &str = match option_env!("BLADED_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};

/// gRPC service implementation delegating to the agent core.
pub struct AgentRpcService {
    agent: Arc<ComputeBladeAgent>,
    token: CancellationToken,
}

impl AgentRpcService {
    pub fn new(agent: Arc<ComputeBladeAgent>, token: CancellationToken) -> Self {
        Self { agent, token }
    }
}

fn into_status(err: ControlError) -> Status {
    match err {
        ControlError::CriticalActive { .. } => Status::failed_precondition(err.to_string()),
        ControlError::QueueClosed => Status::unavailable(err.to_string()),
        ControlError::Cancelled => Status::cancelled(err.to_string()),
        ControlError::Hardware(_) => Status::internal(err.to_string()),
    }
}

fn event_from_proto(event: i32) -> Result<Event, Status> {
    match proto::Event::try_from(event) {
        Ok(proto::Event::Identify) => Ok(Event::Identify),
        Ok(proto::Event::IdentifyConfirm) => Ok(Event::IdentifyConfirm),
        Ok(proto::Event::Critical) => Ok(Event::Critical),
        Ok(proto::Event::CriticalReset) => Ok(Event::CriticalReset),
        Err(_) => Err(Status::invalid_argument("invalid event type")),
    }
}

fn status_to_proto(snapshot: StatusSnapshot) -> proto::StatusResponse {
    let power_status = match snapshot.power_status {
        PowerStatus::PoeOrWall => proto::PowerStatus::PoeOrWall,
        PowerStatus::PoePlusOr802_3bt => proto::PowerStatus::PoePlusOr8023Bt,
    };

    proto::StatusResponse {
        stealth_mode: snapshot.stealth_mode,
        identify_active: snapshot.identify_active,
        critical_active: snapshot.critical_active,
        temperature: snapshot.temperature as i64,
        fan_rpm: snapshot.fan_rpm as i64,
        fan_percent: u32::from(snapshot.fan_percent),
        fan_speed_automatic: snapshot.fan_automatic,
        power_status: power_status.into(),
        fan_curve_steps: snapshot
            .fan_curve_steps
            .iter()
            .map(|step| proto::FanCurveStep {
                temperature: step.temperature as i64,
                percent: u32::from(step.percent),
            })
            .collect(),
        critical_temperature_threshold: i64::from(snapshot.critical_temperature_threshold),
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: BUILD_COMMIT.to_string(),
    }
}

#[tonic::async_trait]
impl BladeAgentService for AgentRpcService {
    async fn emit_event(
        &self,
        request: Request<proto::EmitEventRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let event = event_from_proto(request.into_inner().event)?;
        self.agent.emit_event(event).await.map_err(into_status)?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn wait_for_identify_confirm(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::Empty>, Status> {
        self.agent
            .wait_for_identify_confirm(&self.token)
            .await
            .map_err(into_status)?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn set_fan_speed(
        &self,
        request: Request<proto::SetFanSpeedRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let percent = request.into_inner().percent;
        let percent = u8::try_from(percent)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| {
                Status::invalid_argument("fan speed percent must be between 0 and 100")
            })?;

        self.agent.set_fan_speed(percent).map_err(into_status)?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn set_fan_speed_auto(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::Empty>, Status> {
        self.agent.set_fan_speed_auto();
        Ok(Response::new(proto::Empty {}))
    }

    async fn set_stealth_mode(
        &self,
        request: Request<proto::StealthModeRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        self.agent
            .set_stealth_mode(request.into_inner().enable)
            .await
            .map_err(into_status)?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn get_status(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        let snapshot = self
            .agent
            .status()
            .await
            .map_err(|e| Status::internal(format!("{e:#}")))?;
        Ok(Response::new(status_to_proto(snapshot)))
    }
}

/// Builds the router for the service, with mTLS when requested.
fn build_router(
    agent: Arc<ComputeBladeAgent>,
    tls: Option<ServerTlsConfig>,
    token: CancellationToken,
) -> Result<Router> {
    let mut builder = Server::builder();
    if let Some(tls) = tls {
        builder = builder
            .tls_config(tls)
            .context("failed to apply server TLS configuration")?;
    }
    Ok(builder.add_service(BladeAgentServiceServer::new(AgentRpcService::new(
        agent, token,
    ))))
}

/// Serves the control plane until the token is cancelled, draining
/// in-flight requests on shutdown.
///
/// `tcp` + authenticated enforces mTLS against the bundled CA and
/// provisions the trust material on first start; unix sockets are
/// unauthenticated by construction. In both cases the operator client
/// config is materialised.
pub async fn serve(
    agent: Arc<ComputeBladeAgent>,
    listen: &ListenConfig,
    credentials: &CredentialManager,
    token: CancellationToken,
) -> Result<()> {
    if listen.grpc.is_empty() {
        anyhow::bail!("no listen address provided for the grpc server");
    }

    let shutdown_token = token.clone();
    let shutdown = async move { shutdown_token.cancelled().await };

    match listen.mode {
        ListenMode::Tcp => {
            let tls = if listen.authenticated {
                let material = credentials.ensure_server_certificate()?;
                Some(
                    ServerTlsConfig::new()
                        .identity(Identity::from_pem(
                            &material.identity.cert,
                            &material.identity.key,
                        ))
                        .client_ca_root(Certificate::from_pem(&material.ca_cert))
                        .client_auth_optional(false),
                )
            } else {
                None
            };

            credentials.ensure_bladectl_config(
                &listen.grpc,
                listen.mode,
                listen.authenticated,
            )?;

            let addr: SocketAddr = listen
                .grpc
                .parse()
                .with_context(|| format!("invalid gRPC listen address '{}'", listen.grpc))?;
            let listener = TcpListener::bind(addr).await.with_context(|| {
                format!(
                    "failed to create grpc listener on {addr}; ensure the address is not \
                     bound by another process"
                )
            })?;

            info!("Starting grpc server on {addr} (authenticated: {})", listen.authenticated);
            build_router(agent, tls, token)?
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                .await
                .context("grpc server failed")
        }
        ListenMode::Unix => {
            credentials.ensure_bladectl_config(&listen.grpc, listen.mode, false)?;

            // A stale socket file from a previous run blocks the bind.
            let _ = std::fs::remove_file(&listen.grpc);
            let listener = UnixListener::bind(&listen.grpc).with_context(|| {
                format!(
                    "failed to create grpc listener on {}; ensure the path is writable",
                    listen.grpc
                )
            })?;

            info!("Starting grpc server on unix socket {}", listen.grpc);
            build_router(agent, None, token)?
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                .await
                .context("grpc server failed")
        }
    }
}
