//! QUIC server that accepts CSI requests and dispatches them to the
//! enabled services.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// Upper bound for one serialized request.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// The services a plugin process runs.  Identity is always present; the
/// controller and node services depend on the configured mode.
#[derive(Clone)]
pub struct CsiServices {
    identity: Arc<dyn CsiIdentity>,
    controller: Option<Arc<dyn CsiController>>,
    node: Option<Arc<dyn CsiNode>>,
}

impl CsiServices {
    pub fn new(identity: Arc<dyn CsiIdentity>) -> Self {
        Self {
            identity,
            controller: None,
            node: None,
        }
    }

    pub fn with_controller(mut self, controller: Arc<dyn CsiController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_node(mut self, node: Arc<dyn CsiNode>) -> Self {
        self.node = Some(node);
        self
    }

    fn controller(&self) -> Result<&dyn CsiController, CsiError> {
        self.controller
            .as_deref()
            .ok_or_else(|| CsiError::Unimplemented("controller service is not enabled".into()))
    }

    fn node(&self) -> Result<&dyn CsiNode, CsiError> {
        self.node
            .as_deref()
            .ok_or_else(|| CsiError::Unimplemented("node service is not enabled".into()))
    }

    /// Map a request [`CsiMessage`] to the matching service call and wrap
    /// the result in a response [`CsiMessage`].
    pub async fn dispatch(&self, request: CsiMessage) -> CsiMessage {
        match self.call(request).await {
            Ok(response) => response,
            Err(e) => CsiMessage::Error(e),
        }
    }

    async fn call(&self, request: CsiMessage) -> Result<CsiMessage, CsiError> {
        use CsiMessage as M;

        let response = match request {
            // --- Identity ---------------------------------------------------
            M::Probe => M::ProbeResult(self.identity.probe().await?),
            M::GetPluginInfo => M::PluginInfoResponse(self.identity.get_plugin_info().await?),
            M::GetPluginCapabilities => {
                M::PluginCapabilitiesResponse(self.identity.get_plugin_capabilities().await?)
            }

            // --- Controller -------------------------------------------------
            M::CreateVolume(req) => M::VolumeCreated(self.controller()?.create_volume(req).await?),
            M::DeleteVolume(req) => {
                self.controller()?.delete_volume(req).await?;
                M::Ok
            }
            M::ControllerPublishVolume(req) => {
                self.controller()?.controller_publish_volume(req).await?;
                M::Ok
            }
            M::ControllerUnpublishVolume { volume_id, node_id } => {
                self.controller()?
                    .controller_unpublish_volume(&volume_id, &node_id)
                    .await?;
                M::Ok
            }
            M::ValidateVolumeCapabilities(req) => M::CapabilitiesValidated(
                self.controller()?.validate_volume_capabilities(req).await?,
            ),
            M::ListVolumes(req) => M::VolumeList(self.controller()?.list_volumes(req).await?),
            M::GetCapacity => M::Capacity(self.controller()?.get_capacity().await?),
            M::ControllerGetCapabilities => {
                M::ControllerCapabilities(self.controller()?.controller_get_capabilities().await?)
            }
            M::CreateSnapshot(req) => {
                M::SnapshotCreated(self.controller()?.create_snapshot(req).await?)
            }
            M::DeleteSnapshot(id) => {
                self.controller()?.delete_snapshot(&id).await?;
                M::Ok
            }
            M::ListSnapshots(req) => M::SnapshotList(self.controller()?.list_snapshots(req).await?),
            M::ControllerExpandVolume {
                volume_id,
                capacity_bytes,
            } => M::VolumeExpanded(
                self.controller()?
                    .controller_expand_volume(&volume_id, capacity_bytes)
                    .await?,
            ),

            // --- Node -------------------------------------------------------
            M::StageVolume(req) => {
                self.node()?.stage_volume(req).await?;
                M::Ok
            }
            M::UnstageVolume {
                volume_id,
                staging_target_path,
            } => {
                self.node()?
                    .unstage_volume(&volume_id, &staging_target_path)
                    .await?;
                M::Ok
            }
            M::PublishVolume(req) => {
                self.node()?.publish_volume(req).await?;
                M::Ok
            }
            M::UnpublishVolume {
                volume_id,
                target_path,
            } => {
                self.node()?.unpublish_volume(&volume_id, &target_path).await?;
                M::Ok
            }
            M::GetVolumeStats {
                volume_id,
                volume_path,
            } => M::VolumeStatsResponse(
                self.node()?.get_volume_stats(&volume_id, &volume_path).await?,
            ),
            M::NodeExpandVolume {
                volume_id,
                capacity_bytes,
            } => M::VolumeExpanded(
                self.node()?
                    .node_expand_volume(&volume_id, capacity_bytes)
                    .await?,
            ),
            M::GetNodeCapabilities => M::NodeCapabilities(self.node()?.get_capabilities().await?),
            M::GetNodeInfo => M::NodeInfoResponse(self.node()?.get_info().await?),

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                return Err(CsiError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )));
            }
        };
        Ok(response)
    }
}

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to [`CsiServices`].
pub struct CsiServer {
    endpoint: quinn::Endpoint,
    services: Arc<CsiServices>,
}

impl CsiServer {
    /// Create a new server bound to `addr`.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        services: CsiServices,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(%addr, "CSI QUIC server listening");
        Ok(Self {
            endpoint,
            services: Arc::new(services),
        })
    }

    /// Accept connections in a loop until the endpoint is closed.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let services = Arc::clone(&self.services);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) = Self::handle_connection(conn, services).await {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(
        conn: quinn::Connection,
        services: Arc<CsiServices>,
    ) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(()),
                Err(e) => return Err(CsiError::transport(e)),
            };

            let services = Arc::clone(&services);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &services).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request, dispatch, write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        services: &CsiServices,
    ) -> Result<(), CsiError> {
        let buf = recv
            .read_to_end(MAX_MESSAGE_BYTES)
            .await
            .map_err(CsiError::transport)?;

        let response = match serde_json::from_slice::<CsiMessage>(&buf) {
            Ok(request) => {
                debug!(%request, "CSI request received");
                services.dispatch(request).await
            }
            Err(e) => CsiMessage::Error(CsiError::InvalidArgument(format!(
                "malformed request: {e}"
            ))),
        };
        debug!(%response, "CSI response");

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        Ok(())
    }

    /// Local address of the endpoint, e.g. after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, CsiError> {
        self.endpoint.local_addr().map_err(CsiError::transport)
    }

    /// Stop accepting connections; [`serve`](Self::serve) then returns.
    pub fn shutdown(&self) {
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"server shutdown");
    }
}
