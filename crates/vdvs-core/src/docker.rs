//! Engine API client over the local Unix socket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::error::{Result, VdvsError};
use crate::runtime::{
    ContainerMount, ContainerRuntime, ContainerSummary, Orchestrator, ServiceRuntime, ServiceSpec,
    ServiceStatus, SwarmInfo, SwarmPeer, VolumeRuntime, ACTIVE_CONTAINER_STATES,
};

pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Engine 1.12 and later speak this API version.
pub const API_VERSION: &str = "v1.24";

/// Deadline of a single engine request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InfoBody {
    #[serde(default)]
    swarm: SwarmBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SwarmBody {
    #[serde(rename = "NodeID")]
    node_id: String,
    node_addr: String,
    local_node_state: String,
    control_available: bool,
    remote_managers: Option<Vec<SwarmPeer>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ManagerStatusBody {
    leader: bool,
    addr: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct NodeBody {
    manager_status: Option<ManagerStatusBody>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectBody {
    mounts: Vec<ContainerMount>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct CreatedBody {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ServiceBody {
    #[serde(rename = "ID")]
    id: String,
    spec: ServiceSpecBody,
    endpoint: EndpointBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ServiceSpecBody {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct EndpointBody {
    ports: Vec<PortBody>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct PortBody {
    published_port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct TaskBody {
    #[serde(rename = "ServiceID")]
    service_id: String,
    status: TaskStatusBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct TaskStatusBody {
    state: String,
}

/// Maps a failed engine response to an error kind.
fn status_error(status: StatusCode, body: &[u8]) -> VdvsError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    let message = if message.is_empty() {
        format!("engine returned {}", status)
    } else {
        message
    };
    match status {
        StatusCode::NOT_FOUND => VdvsError::NotFound(message),
        StatusCode::CONFLICT => {
            if message.contains("already exists") {
                VdvsError::AlreadyExists(message)
            } else {
                VdvsError::Busy(message)
            }
        }
        StatusCode::BAD_REQUEST => VdvsError::InvalidArgument(message),
        StatusCode::SERVICE_UNAVAILABLE => VdvsError::Transport(message),
        _ => VdvsError::Internal(message),
    }
}

fn service_body(spec: &ServiceSpec) -> Value {
    let mounts: Vec<Value> = spec
        .volume_mounts
        .iter()
        .map(|(source, target)| json!({"Type": "volume", "Source": source, "Target": target}))
        .collect();
    json!({
        "Name": spec.name,
        "TaskTemplate": {
            "ContainerSpec": {
                "Image": spec.image,
                "Args": spec.args,
                "Mounts": mounts,
            }
        },
        "Mode": {"Replicated": {"Replicas": spec.replicas}},
        "EndpointSpec": {
            "Mode": "vip",
            "Ports": [{"Protocol": "tcp", "TargetPort": spec.target_port}],
        },
    })
}

/// Client for the engine API. Every call opens a fresh connection.
#[derive(Debug, Clone)]
pub struct DockerClient {
    socket: PathBuf,
    timeout: Duration,
}

impl Default for DockerClient {
    fn default() -> Self {
        Self::new(DOCKER_SOCKET)
    }
}

impl DockerClient {
    pub fn new(socket: impl AsRef<Path>) -> Self {
        Self {
            socket: socket.as_ref().to_path_buf(),
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<(StatusCode, Bytes)> {
        let uri = format!("/{}{}", API_VERSION, path);
        let exchange = async {
            let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
                VdvsError::Transport(format!(
                    "Can't connect to {}: {}",
                    self.socket.display(),
                    e
                ))
            })?;
            let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| VdvsError::Transport(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "engine connection closed");
                }
            });

            let builder = Request::builder()
                .method(method.clone())
                .uri(uri.as_str())
                .header(HOST, "docker")
                .header(USER_AGENT, "vdvs-plugin");
            let req = match body {
                Some(v) => builder
                    .header(CONTENT_TYPE, "application/json")
                    .body(Full::new(Bytes::from(serde_json::to_vec(&v)?))),
                None => builder.body(Full::new(Bytes::new())),
            }
            .map_err(|e| VdvsError::Internal(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| VdvsError::Transport(e.to_string()))?;
            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| VdvsError::Transport(e.to_string()))?
                .to_bytes();
            Ok::<_, VdvsError>((status, bytes))
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(res) => res,
            Err(_) => Err(VdvsError::Timeout(format!(
                "{} {} timed out after {:?}",
                method, uri, self.timeout
            ))),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<Value>) -> Result<T> {
        let (status, bytes) = self.send(method, path, body).await?;
        if !status.is_success() {
            return Err(status_error(status, &bytes));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn call_empty(&self, method: Method, path: &str, body: Option<Value>) -> Result<()> {
        let (status, bytes) = self.send(method, path, body).await?;
        if !status.is_success() {
            return Err(status_error(status, &bytes));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn active_containers(&self) -> Result<Vec<ContainerSummary>> {
        let all: Vec<ContainerSummary> = self.call(Method::GET, "/containers/json?all=1", None).await?;
        Ok(all
            .into_iter()
            .filter(|c| ACTIVE_CONTAINER_STATES.contains(&c.state.as_str()))
            .collect())
    }

    async fn container_mounts(&self, id: &str) -> Result<Vec<ContainerMount>> {
        let body: InspectBody = self
            .call(Method::GET, &format!("/containers/{}/json", id), None)
            .await?;
        Ok(body.mounts)
    }
}

#[async_trait]
impl Orchestrator for DockerClient {
    async fn swarm_info(&self) -> Result<SwarmInfo> {
        let info: InfoBody = self.call(Method::GET, "/info", None).await?;
        let swarm = info.swarm;
        if swarm.local_node_state != "active" {
            return Err(VdvsError::Internal(format!(
                "Swarm node state is not active, local node state: {}",
                swarm.local_node_state
            )));
        }
        Ok(SwarmInfo {
            node_id: swarm.node_id,
            node_addr: swarm.node_addr,
            is_manager: swarm.control_available,
            managers: swarm.remote_managers.unwrap_or_default(),
        })
    }

    async fn is_leader(&self, node_id: &str) -> Result<bool> {
        let node: NodeBody = self.call(Method::GET, &format!("/nodes/{}", node_id), None).await?;
        Ok(node.manager_status.map(|m| m.leader).unwrap_or(false))
    }

    async fn leader_addr(&self) -> Result<String> {
        let nodes: Vec<NodeBody> = self.call(Method::GET, "/nodes", None).await?;
        nodes
            .into_iter()
            .filter_map(|n| n.manager_status)
            .find(|m| m.leader)
            .map(|m| m.addr)
            .ok_or_else(|| VdvsError::Internal("Failed to get leader for swarm manager".to_string()))
    }
}

#[async_trait]
impl VolumeRuntime for DockerClient {
    async fn volume_create(&self, driver: &str, name: &str, options: &HashMap<String, String>) -> Result<()> {
        let body = json!({"Name": name, "Driver": driver, "DriverOpts": options});
        self.call_empty(Method::POST, "/volumes/create", Some(body)).await
    }

    async fn volume_remove(&self, name: &str) -> Result<()> {
        self.call_empty(Method::DELETE, &format!("/volumes/{}", name), None).await
    }

    async fn volume_inspect(&self, name: &str) -> Result<()> {
        self.call_empty(Method::GET, &format!("/volumes/{}", name), None).await
    }
}

#[async_trait]
impl ServiceRuntime for DockerClient {
    async fn service_create(&self, spec: &ServiceSpec) -> Result<String> {
        let created: CreatedBody = self
            .call(Method::POST, "/services/create", Some(service_body(spec)))
            .await?;
        Ok(created.id)
    }

    async fn service_list(&self, name_prefix: &str) -> Result<Vec<ServiceStatus>> {
        let services: Vec<ServiceBody> = self.call(Method::GET, "/services", None).await?;
        Ok(services
            .into_iter()
            .filter(|s| s.spec.name.starts_with(name_prefix))
            .map(|s| ServiceStatus {
                published_port: s.endpoint.ports.first().map(|p| p.published_port).unwrap_or(0),
                id: s.id,
                name: s.spec.name,
            })
            .collect())
    }

    async fn task_states(&self, service_id: &str) -> Result<Vec<String>> {
        let tasks: Vec<TaskBody> = self.call(Method::GET, "/tasks", None).await?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.service_id == service_id)
            .map(|t| t.status.state)
            .collect())
    }

    async fn service_remove(&self, service_id: &str) -> Result<()> {
        match self
            .call_empty(Method::DELETE, &format!("/services/{}", service_id), None)
            .await
        {
            Err(VdvsError::NotFound(msg)) => {
                warn!(service_id, msg, "service already gone");
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper::Response;
    use std::convert::Infallible;
    use tokio::net::UnixListener;

    /// Serves canned engine responses keyed by request path.
    async fn fake_engine(dir: &Path, routes: Vec<(&'static str, u16, &'static str)>) -> PathBuf {
        let socket = dir.join("docker.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => return,
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let routes = routes.clone();
                        async move {
                            let path = req
                                .uri()
                                .path_and_query()
                                .map(|p| p.as_str().to_string())
                                .unwrap_or_default();
                            let (code, body) = routes
                                .iter()
                                .find(|(p, _, _)| *p == path)
                                .map(|(_, c, b)| (*c, *b))
                                .unwrap_or((404, r#"{"message":"page not found"}"#));
                            let resp = Response::builder()
                                .status(code)
                                .body(Full::new(Bytes::from(body)))
                                .unwrap();
                            Ok::<_, Infallible>(resp)
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });
        socket
    }

    #[tokio::test]
    async fn test_swarm_info_and_leader() {
        let dir = tempfile::tempdir().unwrap();
        let socket = fake_engine(
            dir.path(),
            vec![
                (
                    "/v1.24/info",
                    200,
                    r#"{"Swarm":{"NodeID":"n1","NodeAddr":"10.0.0.1","LocalNodeState":"active","ControlAvailable":true,"RemoteManagers":[{"NodeID":"n1","Addr":"10.0.0.1:2377"},{"NodeID":"n2","Addr":"10.0.0.2:2377"}]}}"#,
                ),
                ("/v1.24/nodes/n1", 200, r#"{"ManagerStatus":{"Leader":true,"Addr":"10.0.0.1:2377"}}"#),
                (
                    "/v1.24/nodes",
                    200,
                    r#"[{"ManagerStatus":null},{"ManagerStatus":{"Leader":true,"Addr":"10.0.0.1:2377"}}]"#,
                ),
            ],
        )
        .await;
        let client = DockerClient::new(&socket);
        let info = client.swarm_info().await.unwrap();
        assert_eq!(info.node_id, "n1");
        assert!(info.is_manager);
        assert_eq!(info.managers.len(), 2);
        assert!(client.is_leader("n1").await.unwrap());
        assert_eq!(client.leader_addr().await.unwrap(), "10.0.0.1:2377");
    }

    #[tokio::test]
    async fn test_inactive_swarm_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = fake_engine(
            dir.path(),
            vec![("/v1.24/info", 200, r#"{"Swarm":{"LocalNodeState":"inactive"}}"#)],
        )
        .await;
        let err = DockerClient::new(&socket).swarm_info().await.unwrap_err();
        assert!(err.to_string().contains("inactive"));
    }

    #[tokio::test]
    async fn test_active_containers_filters_state() {
        let dir = tempfile::tempdir().unwrap();
        let socket = fake_engine(
            dir.path(),
            vec![
                (
                    "/v1.24/containers/json?all=1",
                    200,
                    r#"[{"Id":"a","Names":["/a"],"State":"running"},{"Id":"b","State":"exited"},{"Id":"c","State":"paused"}]"#,
                ),
                (
                    "/v1.24/containers/a/json",
                    200,
                    r#"{"Mounts":[{"Name":"vol1","Source":"/mnt/vmdk/vol1@ds","Destination":"/data","Driver":"vsphere"}]}"#,
                ),
            ],
        )
        .await;
        let client = DockerClient::new(&socket);
        let ids: Vec<String> = client
            .active_containers()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
        let mounts = client.container_mounts("a").await.unwrap();
        assert_eq!(mounts[0].name, "vol1");
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let socket = fake_engine(
            dir.path(),
            vec![("/v1.24/volumes/busy", 409, r#"{"message":"volume is in use"}"#)],
        )
        .await;
        let client = DockerClient::new(&socket);
        let err = client.volume_inspect("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = client.volume_remove("busy").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(
            status_error(StatusCode::CONFLICT, br#"{"message":"volume is in use"}"#).kind(),
            ErrorKind::Busy
        );
        assert_eq!(
            status_error(StatusCode::CONFLICT, br#"{"message":"name already exists"}"#).kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            status_error(StatusCode::INTERNAL_SERVER_ERROR, b"").to_string(),
            "engine returned 500 Internal Server Error"
        );
    }

    #[tokio::test]
    async fn test_service_list_and_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let socket = fake_engine(
            dir.path(),
            vec![
                (
                    "/v1.24/services",
                    200,
                    r#"[{"ID":"s1","Spec":{"Name":"vFileServervol1"},"Endpoint":{"Ports":[{"PublishedPort":30000}]}},{"ID":"s2","Spec":{"Name":"web"}}]"#,
                ),
                (
                    "/v1.24/tasks",
                    200,
                    r#"[{"ServiceID":"s1","Status":{"State":"running"}},{"ServiceID":"s2","Status":{"State":"pending"}}]"#,
                ),
            ],
        )
        .await;
        let client = DockerClient::new(&socket);
        let services = client.service_list("vFileServer").await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].published_port, 30000);
        assert_eq!(client.task_states("s1").await.unwrap(), vec!["running"]);
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_transport() {
        let client = DockerClient::new("/nonexistent/docker.sock");
        let err = client.swarm_info().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_service_body_shape() {
        let spec = ServiceSpec {
            name: "vFileServervol1".into(),
            image: "dperson/samba".into(),
            args: vec!["-s".into(), "share1;/mount".into()],
            volume_mounts: vec![("_vF_vol1".into(), "/mount".into())],
            replicas: 1,
            target_port: 445,
        };
        let body = service_body(&spec);
        assert_eq!(body["Mode"]["Replicated"]["Replicas"], 1);
        assert_eq!(body["EndpointSpec"]["Ports"][0]["TargetPort"], 445);
        assert_eq!(
            body["TaskTemplate"]["ContainerSpec"]["Mounts"][0]["Source"],
            "_vF_vol1"
        );
    }
}
