//! Volume plugin protocol over a Unix socket.
//!
//! The container runtime posts JSON to `/Plugin.Activate` and
//! `/VolumeDriver.*`. Bodies arrive with the runtime's own content type, so
//! requests are decoded from raw bytes rather than through the `Json`
//! extractor.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use nix::unistd::Group;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, error, info, warn};

use vdvs_core::plugin::{respond, ActivateResponse, VolumeDriver, VolumeRequest, VolumeResponse};

type Driver = Arc<dyn VolumeDriver>;

pub fn router(driver: Driver) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/VolumeDriver.Create", post(create))
        .route("/VolumeDriver.Remove", post(remove))
        .route("/VolumeDriver.Mount", post(mount))
        .route("/VolumeDriver.Unmount", post(unmount))
        .route("/VolumeDriver.Get", post(get))
        .route("/VolumeDriver.List", post(list))
        .route("/VolumeDriver.Path", post(path))
        .route("/VolumeDriver.Capabilities", post(capabilities))
        .with_state(driver)
}

/// Decodes a request body; an empty body is an empty request.
fn decode(body: &Bytes) -> Result<VolumeRequest, VolumeResponse> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(VolumeRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "malformed plugin request");
        VolumeResponse::error(format!("Invalid request: {}", e))
    })
}

async fn activate() -> Json<ActivateResponse> {
    Json(ActivateResponse::default())
}

async fn create(State(driver): State<Driver>, body: Bytes) -> Json<VolumeResponse> {
    Json(match decode(&body) {
        Ok(req) => respond(driver.create(req).await, |_| VolumeResponse::ok()),
        Err(resp) => resp,
    })
}

async fn remove(State(driver): State<Driver>, body: Bytes) -> Json<VolumeResponse> {
    Json(match decode(&body) {
        Ok(req) => respond(driver.remove(req).await, |_| VolumeResponse::ok()),
        Err(resp) => resp,
    })
}

async fn mount(State(driver): State<Driver>, body: Bytes) -> Json<VolumeResponse> {
    Json(match decode(&body) {
        Ok(req) => respond(driver.mount(req).await, VolumeResponse::mountpoint),
        Err(resp) => resp,
    })
}

async fn unmount(State(driver): State<Driver>, body: Bytes) -> Json<VolumeResponse> {
    Json(match decode(&body) {
        Ok(req) => respond(driver.unmount(req).await, |_| VolumeResponse::ok()),
        Err(resp) => resp,
    })
}

async fn get(State(driver): State<Driver>, body: Bytes) -> Json<VolumeResponse> {
    Json(match decode(&body) {
        Ok(req) => respond(driver.get(req).await, |volume| VolumeResponse {
            volume: Some(volume),
            ..Default::default()
        }),
        Err(resp) => resp,
    })
}

async fn list(State(driver): State<Driver>) -> Json<VolumeResponse> {
    Json(respond(driver.list().await, |volumes| VolumeResponse {
        volumes: Some(volumes),
        ..Default::default()
    }))
}

async fn path(State(driver): State<Driver>, body: Bytes) -> Json<VolumeResponse> {
    Json(match decode(&body) {
        Ok(req) => respond(driver.path(req).await, VolumeResponse::mountpoint),
        Err(resp) => resp,
    })
}

async fn capabilities(State(driver): State<Driver>) -> Json<VolumeResponse> {
    Json(VolumeResponse {
        capabilities: Some(driver.capabilities()),
        ..Default::default()
    })
}

/// Numeric id of a group given by name or number.
pub fn group_id(group: &str) -> io::Result<u32> {
    if let Ok(gid) = group.parse() {
        return Ok(gid);
    }
    match Group::from_name(group)? {
        Some(entry) => Ok(entry.gid.as_raw()),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unknown group {}", group),
        )),
    }
}

/// Removes the socket file when dropped.
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %e, "Failed to remove plugin socket");
            }
        }
    }
}

/// Bound plugin socket. The socket file goes away with the listener.
pub struct PluginSocket {
    file: SocketFile,
    listener: UnixListener,
}

impl PluginSocket {
    /// Binds `path`, replacing a stale socket, and hands it to `group`.
    pub fn bind(path: &Path, group: &str) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(path)?;
        let file = SocketFile(path.to_path_buf());
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
        match group_id(group) {
            Ok(gid) => std::os::unix::fs::chown(path, None, Some(gid))?,
            Err(e) => warn!(group, error = %e, "Failed to set socket group, keeping the default"),
        }
        info!(path = %path.display(), group, "plugin socket listening");
        Ok(Self { file, listener })
    }

    pub fn path(&self) -> &Path {
        &self.file.0
    }

    /// Serves connections until `cancel` fires.
    pub async fn serve(self, router: Router, cancel: CancellationToken) -> io::Result<()> {
        let PluginSocket { file: _file, listener } = self;
        let mut incoming = UnixListenerStream::new(listener);
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("plugin server shutting down");
                    return Ok(());
                }
                accepted = incoming.next() => match accepted {
                    Some(Ok(stream)) => stream,
                    Some(Err(e)) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                    None => return Ok(()),
                },
            };
            let service = router.clone();
            tokio::spawn(async move {
                let hyper_service = hyper::service::service_fn(move |req: http::Request<Incoming>| {
                    service.clone().call(req)
                });
                if let Err(e) = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), hyper_service)
                    .await
                {
                    debug!(error = %e, "plugin connection closed with error");
                }
            });
        }
    }
}
