//! Plugin server lifecycle and the device plugin gRPC service.

use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use device_plugin_api::v1beta1::device_plugin_server::DevicePlugin;
use device_plugin_api::v1beta1::device_plugin_server::DevicePluginServer;
use device_plugin_api::v1beta1::registration_client::RegistrationClient;
use device_plugin_api::v1beta1::AllocateRequest;
use device_plugin_api::v1beta1::AllocateResponse;
use device_plugin_api::v1beta1::DevicePluginOptions;
use device_plugin_api::v1beta1::Empty;
use device_plugin_api::v1beta1::ListAndWatchResponse;
use device_plugin_api::v1beta1::PreStartContainerRequest;
use device_plugin_api::v1beta1::PreStartContainerResponse;
use device_plugin_api::v1beta1::RegisterRequest;
use device_plugin_api::API_VERSION;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::Resource;
use crate::plugin::devices::DeviceTable;
use crate::plugin::DialError;
use crate::plugin::HealthEvent;
use crate::plugin::HealthMonitor;
use crate::plugin::RegisterError;
use crate::plugin::ServeError;
use crate::plugin::StartError;

/// Bound on dialing a unix socket, for the startup liveness probe and for
/// reaching the kubelet. Streaming RPCs carry no deadline by contract.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Update ticks buffered per ListAndWatch subscriber. A subscriber that
/// falls further behind is served the latest snapshot instead.
const UPDATE_CHANNEL_CAPACITY: usize = 16;

const HEALTH_CHANNEL_CAPACITY: usize = 16;

/// One serving instance of the device plugin.
#[derive(Debug)]
pub struct PluginServer {
    resource_name: String,
    endpoint: String,
    socket_path: PathBuf,
    table: Arc<DeviceTable>,
    device_ids: Vec<String>,
    health_tx: mpsc::Sender<HealthEvent>,
    /// Taken by the first `start`; its absence marks the instance as used.
    health_rx: Option<mpsc::Receiver<HealthEvent>>,
    updates: broadcast::Sender<()>,
    cancellation_token: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl PluginServer {
    /// Build a server instance for `resource` with every device healthy.
    pub fn new(resource: &Resource, plugin_dir: &Path) -> Self {
        let endpoint = format!("{}.sock", resource.name.replace('/', "--"));
        let socket_path = plugin_dir.join(&endpoint);
        let (health_tx, health_rx) = mpsc::channel(HEALTH_CHANNEL_CAPACITY);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            resource_name: resource.name.clone(),
            endpoint,
            socket_path,
            table: Arc::new(DeviceTable::new(resource)),
            device_ids: resource.sets.iter().map(|set| set.id.clone()).collect(),
            health_tx,
            health_rx: Some(health_rx),
            updates,
            cancellation_token: CancellationToken::new(),
            server: None,
        }
    }

    /// Socket path this instance serves on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Socket basename announced to the kubelet during registration.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Handle for queueing health downgrades into this instance.
    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(self.device_ids.clone(), self.health_tx.clone())
    }

    /// Bind the socket, start serving, and probe the socket for liveness.
    ///
    /// A failed probe tears the half-started server down again before the
    /// error is returned, so a retry can bind cleanly.
    pub async fn start(&mut self) -> Result<(), StartError> {
        let Some(health_rx) = self.health_rx.take() else {
            return Err(StartError::AlreadyStarted);
        };

        info!(
            "starting device plugin server on {}",
            self.socket_path.display()
        );

        remove_socket_file(&self.socket_path).map_err(|source| StartError::Cleanup {
            path: self.socket_path.clone(),
            source,
        })?;

        let listener =
            UnixListener::bind(&self.socket_path).map_err(|source| StartError::Bind {
                path: self.socket_path.clone(),
                source,
            })?;

        let service = DevicePluginService {
            table: self.table.clone(),
            updates: self.updates.clone(),
            cancellation_token: self.cancellation_token.clone(),
        };

        let shutdown = self.cancellation_token.clone();
        self.server = Some(tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        shutdown.cancelled().await;
                        info!("shutting down device plugin server");
                    },
                )
                .await;
            if let Err(e) = result {
                error!("device plugin server exited: {e}");
            }
        }));

        self.spawn_health_consumer(health_rx);
        tokio::spawn(
            self.health_monitor()
                .run(self.cancellation_token.clone()),
        );

        // the kubelet dials this socket as soon as we register, so make
        // sure it answers before announcing it
        if let Err(probe) = dial(&self.socket_path, DIAL_TIMEOUT).await {
            if let Err(e) = self.stop().await {
                warn!("failed to clean up after liveness probe: {e}");
            }
            return Err(StartError::Probe(probe));
        }

        Ok(())
    }

    /// Announce this instance to the kubelet's registration service.
    pub async fn register(&self, kubelet_socket: &Path) -> Result<(), RegisterError> {
        info!(
            "registering device plugin with kubelet at {}",
            kubelet_socket.display()
        );

        let channel = dial(kubelet_socket, DIAL_TIMEOUT).await?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.endpoint.clone(),
            resource_name: self.resource_name.clone(),
            options: None,
        };

        client.register(Request::new(request)).await?;
        Ok(())
    }

    /// Start serving and register with the kubelet.
    ///
    /// A failed registration stops the freshly started server; no bound
    /// socket outlives a failed serve attempt.
    pub async fn serve(&mut self, kubelet_socket: &Path) -> Result<(), ServeError> {
        self.start().await?;
        info!("starting to serve on {}", self.socket_path.display());

        if let Err(e) = self.register(kubelet_socket).await {
            if let Err(stop_err) = self.stop().await {
                warn!("failed to stop after registration failure: {stop_err}");
            }
            return Err(e.into());
        }

        info!("registered device plugin with kubelet");
        Ok(())
    }

    /// Stop serving and remove the socket file.
    ///
    /// Safe to call on a never-started or already-stopped instance.
    pub async fn stop(&mut self) -> std::io::Result<()> {
        let Some(server) = self.server.take() else {
            return Ok(());
        };

        info!(
            "stopping device plugin server on {}",
            self.socket_path.display()
        );
        self.cancellation_token.cancel();
        if let Err(e) = server.await {
            error!("device plugin server task failed: {e}");
        }
        remove_socket_file(&self.socket_path)
    }

    /// Serialize table mutations: apply each downgrade, then fan a
    /// snapshot-update tick out to every subscribed stream. The tick goes
    /// out even for an already-unhealthy device, so subscribers converge on
    /// the latest state no matter when they subscribed.
    fn spawn_health_consumer(&self, mut health_rx: mpsc::Receiver<HealthEvent>) {
        let table = self.table.clone();
        let updates = self.updates.clone();
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    event = health_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if !table.contains(&event.device_id) {
                    warn!("health event for unknown device {}", event.device_id);
                    continue;
                }
                if table.mark_unhealthy(&event.device_id).await {
                    info!("device {} is now Unhealthy", event.device_id);
                }
                let _ = updates.send(());
            }
            debug!("health consumer stopped");
        });
    }
}

/// Delete a socket file, treating absence as success.
fn remove_socket_file(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Open a gRPC channel over a unix socket, bounded by `timeout`.
async fn dial(socket_path: &Path, timeout: Duration) -> Result<Channel, DialError> {
    let path = socket_path.to_path_buf();
    // the authority is a placeholder, the connector below ignores it
    let endpoint = Endpoint::from_static("http://localhost");
    let connect = endpoint.connect_with_connector(service_fn(
        move |_: Uri| {
            let path = path.clone();
            async move {
                match UnixStream::connect(path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        },
    ));

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(source)) => Err(DialError::Connect {
            path: socket_path.to_path_buf(),
            source,
        }),
        Err(_) => Err(DialError::Timeout {
            path: socket_path.to_path_buf(),
            timeout,
        }),
    }
}

/// gRPC surface of one plugin server instance.
#[derive(Debug)]
pub(crate) struct DevicePluginService {
    table: Arc<DeviceTable>,
    updates: broadcast::Sender<()>,
    cancellation_token: CancellationToken,
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("reporting device plugin options");
        Ok(Response::new(DevicePluginOptions::default()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Send the full device list now, and again after every health change.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("kubelet subscribed to device list updates");

        let (tx, rx) = mpsc::unbounded_channel();
        let table = self.table.clone();
        let mut updates = self.updates.subscribe();
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let devices = table.snapshot().await;
            if tx.send(Ok(ListAndWatchResponse { devices })).is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    update = updates.recv() => match update {
                        // a lagged subscriber still converges on the latest
                        // snapshot, updates are never diffs
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            let devices = table.snapshot().await;
                            if tx.send(Ok(ListAndWatchResponse { devices })).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("device list stream closed");
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    /// Hand out the pre-configured payload for exactly one device per
    /// container. Any invalid container request fails the whole call.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        let mut container_responses = Vec::with_capacity(req.container_requests.len());

        for container_req in &req.container_requests {
            let [device_id] = container_req.devices_ids.as_slice() else {
                return Err(Status::invalid_argument(format!(
                    "invalid allocation request: expected exactly one device id, got {}",
                    container_req.devices_ids.len()
                )));
            };
            let Some(payload) = self.table.payload(device_id) else {
                return Err(Status::invalid_argument(format!(
                    "invalid allocation request: unknown device: {device_id}"
                )));
            };
            info!("allocating device {device_id}");
            container_responses.push(payload);
        }

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse::default()))
    }
}
