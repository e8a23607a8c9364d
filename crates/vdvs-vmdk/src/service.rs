//! Client for the hypervisor-side volume service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use vdvs_core::device::VolumeDevSpec;
use vdvs_core::error::{Result, VdvsError};

use crate::vmci::{Request, Transport};

/// Attempts per request before a transport failure is surfaced.
pub const TRANSPORT_ATTEMPTS: u32 = 5;

/// Pause between transport attempts.
pub const TRANSPORT_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Status key holding the device of an attached volume.
pub const ATTACHED_DEVICE: &str = "attachedVMDevice";

/// One entry of a `list` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSummary {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: Option<HashMap<String, String>>,
}

/// Block volume operations served by the hypervisor.
#[async_trait]
pub trait VolumeService: Send + Sync {
    async fn create(&self, name: &str, opts: &HashMap<String, String>) -> Result<()>;

    async fn remove(&self, name: &str, opts: &HashMap<String, String>) -> Result<()>;

    /// Attaches the volume to this VM and reports where it landed.
    async fn attach(&self, name: &str) -> Result<VolumeDevSpec>;

    async fn detach(&self, name: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<VolumeSummary>>;

    /// Status map of a volume (`datastore`, `fstype`, `access`...).
    async fn get(&self, name: &str) -> Result<HashMap<String, Value>>;

    /// This VM as named in the `attached to VM` status key, when the
    /// service can tell.
    fn vm_name(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    #[serde(rename = "Error", default)]
    error: Option<String>,
}

/// Splits a raw reply into a payload or the service's error.
pub fn parse_reply(reply: &[u8]) -> Result<Vec<u8>> {
    let text = String::from_utf8_lossy(reply);
    let text = text.trim();
    if text == "null" || text.is_empty() {
        return Ok(b"null".to_vec());
    }
    if let Ok(ErrorReply { error: Some(msg) }) = serde_json::from_str::<ErrorReply>(text) {
        if !msg.is_empty() {
            return Err(VdvsError::from_service_message(&msg));
        }
    }
    Ok(text.as_bytes().to_vec())
}

/// [`VolumeService`] reached over a [`Transport`].
///
/// Requests are serialized: only one is in flight per process.
pub struct EsxService<T: Transport> {
    transport: Arc<T>,
    lock: Mutex<()>,
    attempts: u32,
    retry_pause: Duration,
}

impl<T: Transport> EsxService<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            lock: Mutex::new(()),
            attempts: TRANSPORT_ATTEMPTS,
            retry_pause: TRANSPORT_RETRY_PAUSE,
        }
    }

    pub fn with_retry(mut self, attempts: u32, pause: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_pause = pause;
        self
    }

    async fn run(&self, cmd: &str, name: &str, opts: Option<&HashMap<String, String>>) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(&Request::new(cmd, name, opts))?;
        let _guard = self.lock.lock().await;
        debug!(cmd, name, "volume service request");

        let mut last_error = String::new();
        for attempt in 1..=self.attempts {
            let transport = self.transport.clone();
            let body = payload.clone();
            let reply = tokio::task::spawn_blocking(move || transport.round_trip(&body))
                .await
                .map_err(|e| VdvsError::Internal(e.to_string()))?;
            match reply {
                Ok(reply) => return parse_reply(&reply),
                Err(e) => {
                    warn!(cmd, name, attempt, error = %e, "Failed to reach volume service");
                    last_error = e.to_string();
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_pause).await;
                    }
                }
            }
        }
        Err(VdvsError::Transport(format!(
            "Failed to connect to ESX over vsocket: {}",
            last_error
        )))
    }
}

#[async_trait]
impl<T: Transport> VolumeService for EsxService<T> {
    async fn create(&self, name: &str, opts: &HashMap<String, String>) -> Result<()> {
        self.run("create", name, Some(opts)).await.map(|_| ())
    }

    async fn remove(&self, name: &str, opts: &HashMap<String, String>) -> Result<()> {
        self.run("remove", name, Some(opts)).await.map(|_| ())
    }

    async fn attach(&self, name: &str) -> Result<VolumeDevSpec> {
        let reply = self.run("attach", name, None).await?;
        match serde_json::from_slice::<VolumeDevSpec>(&reply) {
            Ok(spec) => Ok(spec),
            Err(e) => {
                warn!(name, error = %e, "Failed to decode attach reply, detaching volume");
                if let Err(de) = self.detach(name).await {
                    warn!(name, error = %de, "Detach volume failed");
                }
                Err(e.into())
            }
        }
    }

    async fn detach(&self, name: &str) -> Result<()> {
        self.run("detach", name, None).await.map(|_| ())
    }

    async fn list(&self) -> Result<Vec<VolumeSummary>> {
        let reply = self.run("list", "", Some(&HashMap::new())).await?;
        if reply == b"null" {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&reply)?)
    }

    async fn get(&self, name: &str) -> Result<HashMap<String, Value>> {
        let reply = self.run("get", name, Some(&HashMap::new())).await?;
        match serde_json::from_slice::<HashMap<String, Value>>(&reply) {
            Ok(status) => Ok(status),
            Err(e) => {
                warn!(name, error = %e, "failed decoding volume status");
                Ok(HashMap::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::io;
    use vdvs_core::error::ErrorKind;

    /// Replays canned replies; `None` simulates a connection failure.
    struct Scripted {
        replies: SyncMutex<Vec<Option<&'static str>>>,
        seen: SyncMutex<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: Vec<Option<&'static str>>) -> Self {
            Self {
                replies: SyncMutex::new(replies),
                seen: SyncMutex::new(Vec::new()),
            }
        }
    }

    impl Transport for Scripted {
        fn round_trip(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
            self.seen
                .lock()
                .push(String::from_utf8_lossy(payload).into_owned());
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no reply"));
            }
            match replies.remove(0) {
                Some(r) => Ok(r.as_bytes().to_vec()),
                None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
            }
        }
    }

    fn service(replies: Vec<Option<&'static str>>) -> EsxService<Scripted> {
        EsxService::new(Scripted::new(replies)).with_retry(5, Duration::from_millis(1))
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply(b"null").unwrap(), b"null");
        assert_eq!(parse_reply(b"[]").unwrap(), b"[]");
        let err = parse_reply(br#"{"Error":"Volume vol1 not found"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(parse_reply(br#"{"Error":""}"#).is_ok());
    }

    #[tokio::test]
    async fn test_attach_decodes_dev_spec() {
        let svc = service(vec![Some(r#"{"Unit":"1","ControllerPciSlotNumber":"160"}"#)]);
        let spec = svc.attach("vol1@ds").await.unwrap();
        assert_eq!(spec.unit, "1");
        assert_eq!(spec.controller_pci_slot, "160");
    }

    #[tokio::test]
    async fn test_bad_attach_reply_detaches() {
        let svc = service(vec![Some("garbage"), Some("null")]);
        assert!(svc.attach("vol1@ds").await.is_err());
        let seen = svc.transport.seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].contains(r#""cmd":"detach""#));
    }

    #[tokio::test]
    async fn test_transport_retries_then_succeeds() {
        let svc = service(vec![None, None, Some("null")]);
        svc.detach("vol1@ds").await.unwrap();
        assert_eq!(svc.transport.seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_transport_gives_up_after_five_attempts() {
        let svc = service(vec![]);
        let err = svc.detach("vol1@ds").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(svc.transport.seen.lock().len(), 5);
    }

    #[tokio::test]
    async fn test_service_errors_are_not_retried() {
        let svc = service(vec![Some(r#"{"Error":"Volume vol1 already exists"}"#)]);
        let err = svc.create("vol1", &HashMap::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(svc.transport.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let svc = service(vec![
            Some(r#"[{"Name":"vol1@ds1","Attributes":{}},{"Name":"vol2@ds1"}]"#),
            Some(r#"{"datastore":"ds1","fstype":"ext4","capacity":{"size":"100MB"}}"#),
        ]);
        let vols = svc.list().await.unwrap();
        assert_eq!(vols.len(), 2);
        assert_eq!(vols[1].name, "vol2@ds1");
        let status = svc.get("vol1").await.unwrap();
        assert_eq!(status["datastore"], "ds1");
    }
}
