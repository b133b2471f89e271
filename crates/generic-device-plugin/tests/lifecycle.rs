//! Full lifecycle of the daemon against a fake kubelet: registration,
//! device listing, allocation, kubelet restart detection, SIGHUP reload,
//! and clean SIGTERM shutdown.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use device_plugin_api::v1beta1::device_plugin_client::DevicePluginClient;
use device_plugin_api::v1beta1::registration_server::Registration;
use device_plugin_api::v1beta1::registration_server::RegistrationServer;
use device_plugin_api::v1beta1::AllocateRequest;
use device_plugin_api::v1beta1::ContainerAllocateRequest;
use device_plugin_api::v1beta1::Empty;
use device_plugin_api::v1beta1::RegisterRequest;
use device_plugin_api::API_VERSION;
use device_plugin_api::HEALTHY;
use device_plugin_api::KUBELET_SOCKET_NAME;
use generic_device_plugin::config::AllocateSpec;
use generic_device_plugin::config::Resource;
use generic_device_plugin::config::ResourceSet;
use generic_device_plugin::SignalWatcher;
use generic_device_plugin::SocketWatcher;
use generic_device_plugin::Supervisor;
use hyper_util::rt::TokioIo;
use test_log::test;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tower::service_fn;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct RecordingRegistration {
    tx: mpsc::UnboundedSender<RegisterRequest>,
}

#[tonic::async_trait]
impl Registration for RecordingRegistration {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        let _ = self.tx.send(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

/// Minimal stand-in for the kubelet's registration endpoint.
struct FakeKubelet {
    socket: PathBuf,
    registrations: mpsc::UnboundedReceiver<RegisterRequest>,
    token: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl FakeKubelet {
    fn start(plugin_dir: &Path) -> Self {
        let socket = plugin_dir.join(KUBELET_SOCKET_NAME);
        let (tx, registrations) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let listener = UnixListener::bind(&socket).expect("fake kubelet should bind");
        let service = RegistrationServer::new(RecordingRegistration { tx });
        let shutdown = token.clone();
        let task = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move { shutdown.cancelled().await },
                )
                .await
                .expect("fake kubelet should serve");
        });

        Self {
            socket,
            registrations,
            token,
            task,
        }
    }

    async fn next_registration(&mut self) -> RegisterRequest {
        tokio::time::timeout(WAIT, self.registrations.recv())
            .await
            .expect("registration should arrive in time")
            .expect("fake kubelet should stay alive")
    }

    /// Stop serving and remove the socket file, as the real kubelet does
    /// while it is down.
    async fn shutdown(self) {
        self.token.cancel();
        self.task.await.expect("fake kubelet task should join");
        std::fs::remove_file(&self.socket).expect("fake kubelet socket should be removable");
    }
}

async fn connect(path: &Path) -> Channel {
    let path = path.to_path_buf();
    Endpoint::from_static("http://localhost")
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                match UnixStream::connect(path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await
        .expect("plugin socket should accept connections")
}

fn catalog() -> Resource {
    Resource {
        name: "example.com/foo".to_string(),
        sets: vec![
            ResourceSet {
                id: "dev0".to_string(),
                spec: AllocateSpec {
                    envs: [("DEVICE".to_string(), "dev0".to_string())].into(),
                    ..AllocateSpec::default()
                },
            },
            ResourceSet {
                id: "dev1".to_string(),
                spec: AllocateSpec::default(),
            },
        ],
    }
}

#[test(tokio::test)]
async fn daemon_registers_serves_and_survives_kubelet_restarts() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let plugin_socket = dir.path().join("example.com--foo.sock");

    // kubelet first, so its socket exists before the watcher starts
    let mut kubelet = FakeKubelet::start(dir.path());

    let sockets = SocketWatcher::new(dir.path()).expect("socket watcher should start");
    let signals = SignalWatcher::new().expect("signal watcher should start");
    let supervisor = Supervisor::new(catalog(), dir.path().to_path_buf());
    let daemon = tokio::spawn(supervisor.run(sockets, signals));

    // initial registration
    let registration = kubelet.next_registration().await;
    assert_eq!(registration.version, API_VERSION);
    assert_eq!(registration.endpoint, "example.com--foo.sock");
    assert_eq!(registration.resource_name, "example.com/foo");
    assert!(plugin_socket.exists(), "plugin socket should be bound");

    // the advertised devices and payloads are reachable over the socket
    let mut client = DevicePluginClient::new(connect(&plugin_socket).await);
    let mut stream = client
        .list_and_watch(Request::new(Empty {}))
        .await
        .expect("list and watch should open")
        .into_inner();
    let snapshot = tokio::time::timeout(WAIT, stream.message())
        .await
        .expect("initial snapshot should arrive in time")
        .expect("stream should be open")
        .expect("initial snapshot should exist");
    assert_eq!(snapshot.devices.len(), 2);
    assert_eq!(snapshot.devices[0].id, "dev0");
    assert_eq!(snapshot.devices[1].id, "dev1");
    assert!(snapshot.devices.iter().all(|d| d.health == HEALTHY));

    let allocation = client
        .allocate(Request::new(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: vec!["dev0".to_string()],
            }],
        }))
        .await
        .expect("allocation should succeed")
        .into_inner();
    assert_eq!(
        allocation.container_responses[0].envs.get("DEVICE"),
        Some(&"dev0".to_string())
    );

    // kubelet restart: socket recreation must trigger re-registration
    kubelet.shutdown().await;
    let mut kubelet = FakeKubelet::start(dir.path());

    let registration = kubelet.next_registration().await;
    assert_eq!(registration.resource_name, "example.com/foo");

    // the old serving instance was stopped, its stream ends cleanly
    let end = tokio::time::timeout(WAIT, stream.message())
        .await
        .expect("old stream should settle in time");
    assert!(
        matches!(end, Ok(None) | Err(_)),
        "old stream should not yield more devices"
    );
    drop(stream);
    drop(client);

    // the replacement instance serves on the same path
    let mut client = DevicePluginClient::new(connect(&plugin_socket).await);
    client
        .get_device_plugin_options(Request::new(Empty {}))
        .await
        .expect("replacement server should answer");
    drop(client);

    // SIGHUP forces a re-registration without a kubelet restart
    unsafe {
        libc::raise(libc::SIGHUP);
    }
    let registration = kubelet.next_registration().await;
    assert_eq!(registration.endpoint, "example.com--foo.sock");

    // SIGTERM shuts down cleanly and unbinds the socket
    unsafe {
        libc::raise(libc::SIGTERM);
    }
    let result = tokio::time::timeout(WAIT, daemon)
        .await
        .expect("daemon should shut down in time")
        .expect("daemon task should join");
    result.expect("daemon should exit cleanly");
    assert!(
        !plugin_socket.exists(),
        "plugin socket should be removed on shutdown"
    );

    kubelet.shutdown().await;
}
