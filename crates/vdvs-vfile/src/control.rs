//! Cluster-wide file volume state machine.
//!
//! Every manager watches `gref/`. A global refcount going from 0 to 1
//! starts the volume's file-share server, one going from 1 to 0 stops it.
//! Each manager sees each event; the state lock and compare-and-put on
//! `state/<name>` let exactly one of them act.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vdvs_core::error::{ErrorKind, Result, VdvsError};
use vdvs_kv::{Cmp, KvStore, Op, WatchEvent, WatchKind, PREFIX_GREF, PREFIX_STATE};

use crate::fileserver::FileServers;
use crate::metadata::{gref_key, info_key, parse_gref, state_key, VolState, VolumeRecord};

#[derive(Debug, Clone, Copy)]
pub struct ControlTimings {
    /// Pause between attempts of a waited-out transition.
    pub busywait_tick: Duration,
    pub busywait_timeout: Duration,
    pub gc_interval: Duration,
}

impl Default for ControlTimings {
    fn default() -> Self {
        Self {
            busywait_tick: Duration::from_secs(1),
            busywait_timeout: Duration::from_secs(10),
            gc_interval: Duration::from_secs(15),
        }
    }
}

/// What a `gref/` change asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start(String),
    Stop(String),
}

/// Maps a watch event to a server action. Key creation and deletion, and
/// changes that keep the volume in use, need none.
pub fn transition_for(event: &WatchEvent) -> Option<Transition> {
    if event.kind != WatchKind::Put {
        return None;
    }
    let name = event.key.strip_prefix(PREFIX_GREF)?;
    let prev = parse_gref(event.prev_value.as_deref()?);
    let now = parse_gref(event.value.as_deref()?);
    match (prev, now) {
        (0, n) if n > 0 => Some(Transition::Start(name.to_string())),
        (p, 0) if p > 0 => Some(Transition::Stop(name.to_string())),
        _ => None,
    }
}

pub struct Control {
    store: KvStore,
    servers: FileServers,
    timings: ControlTimings,
}

impl Control {
    pub fn new(store: KvStore, servers: FileServers) -> Self {
        Self {
            store,
            servers,
            timings: ControlTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: ControlTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn servers(&self) -> &FileServers {
        &self.servers
    }

    /// Moves `state/<name>` from `from` to `to`, waiting while the volume is
    /// in a transient state. False when the volume is in any other state or
    /// the wait runs out.
    pub async fn transition_or_busywait(&self, name: &str, from: VolState, to: VolState) -> bool {
        let key = state_key(name);
        let mut tick = tokio::time::interval(self.timings.busywait_tick);
        let deadline = tokio::time::sleep(self.timings.busywait_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    debug!(name, %to, "Attempting to change volume state");
                    match self.store.compare_and_put_or_get(&key, from.as_str(), to.as_str()).await {
                        Ok((true, _)) => return true,
                        Ok((false, current)) => {
                            let current = current.as_deref().and_then(|s| s.parse::<VolState>().ok());
                            match current {
                                Some(state) if state.is_transient() => {
                                    debug!(name, %state, "waiting out transient state");
                                }
                                other => {
                                    info!(name, current = ?other, "Volume not in proper state for the operation");
                                    return false;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(name, error = %e, "state transition failed");
                            return false;
                        }
                    }
                }
                _ = &mut deadline => {
                    warn!(name, %from, %to, "Operation to change state timed out!");
                    return false;
                }
            }
        }
    }

    /// Runs the action for one `gref/` event under the volume's state lock.
    pub async fn handle_event(&self, event: &WatchEvent) {
        let Some(transition) = transition_for(event) else {
            return;
        };
        let name = match &transition {
            Transition::Start(name) | Transition::Stop(name) => name.as_str(),
        };
        info!(?transition, "gref watcher event");

        let mut lock = self.store.create_lock(&state_key(name));
        if let Err(e) = lock.blocking_lock_with_lease().await {
            error!(name, error = %e, "Failed to blocking wait lock for state changing");
            lock.clear();
            return;
        }
        match &transition {
            Transition::Start(_) => self.start_server(name).await,
            Transition::Stop(_) => self.stop_server(name).await,
        }
        lock.release().await;
    }

    async fn start_server(&self, name: &str) {
        if !self
            .transition_or_busywait(name, VolState::Ready, VolState::Mounting)
            .await
        {
            return;
        }

        let record = match self.read_record(name).await {
            Ok(r) => r,
            Err(e) => {
                error!(name, error = %e, "Failed to read volume info before starting server");
                self.mark_error(name, VolState::Mounting).await;
                return;
            }
        };
        let (port, service) = match self.servers.start(name, &record).await {
            Ok(started) => started,
            Err(e) => {
                error!(name, error = %e, "Failed to start file server");
                self.mark_error(name, VolState::Mounting).await;
                return;
            }
        };

        // Publish where the server listens and flip the state in one step,
        // so a waiter that sees Mounted also sees the port.
        let published = match record.serving(port, &service).to_json() {
            Ok(info) => self
                .store
                .backend()
                .txn(
                    vec![Cmp::equal(state_key(name), VolState::Mounting.as_str())],
                    vec![
                        Op::put(info_key(name), info),
                        Op::put(state_key(name), VolState::Mounted.as_str()),
                    ],
                    vec![],
                )
                .await
                .map(|r| r.succeeded),
            Err(e) => Err(e),
        };
        match published {
            Ok(true) => info!(name, port, service, "volume mounted"),
            Ok(false) => {
                warn!(name, "Volume left Mounting while its server started");
                return;
            }
            Err(e) => {
                error!(name, error = %e, "Failed to update metadata after starting server");
                self.mark_error(name, VolState::Mounting).await;
                return;
            }
        }

        // The last user may have left while the server was starting; its
        // stop event found the volume still Mounting.
        match self.read_gref(name).await {
            Ok(0) => {
                info!(name, "global refcount dropped to 0 during start, stopping server");
                self.stop_server(name).await;
            }
            Ok(_) => {}
            Err(e) => warn!(name, error = %e, "Failed to re-read global refcount"),
        }
    }

    async fn stop_server(&self, name: &str) {
        // A removed volume keeps no state to transition; only its server
        // is left to go.
        match self.store.read_batch(&[state_key(name)]).await {
            Ok(entries) if entries[0].1 != VolState::Deleting.as_str() => {}
            Ok(_) => {
                info!(name, "Volume is being deleted, stopping its server");
                self.stop_orphan(name).await;
                return;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(name, "Volume is gone, stopping its server");
                self.stop_orphan(name).await;
                return;
            }
            Err(e) => {
                error!(name, error = %e, "Failed to get state of volume");
                return;
            }
        }
        match self.read_gref(name).await {
            Ok(0) => {}
            Ok(n) => {
                info!(name, gref = n, "Volume still has global users, cannot stop the server");
                return;
            }
            Err(e) => {
                error!(name, error = %e, "Failed to get global refcount of volume");
                return;
            }
        }
        if !self
            .transition_or_busywait(name, VolState::Mounted, VolState::Unmounting)
            .await
        {
            return;
        }
        if let Err(e) = self.servers.stop(name).await {
            error!(name, error = %e, "Failed to stop file server");
            self.mark_error(name, VolState::Unmounting).await;
            return;
        }

        let reset = match self.read_record(name).await.and_then(|r| r.stopped().to_json()) {
            Ok(info) => self
                .store
                .backend()
                .txn(
                    vec![Cmp::equal(state_key(name), VolState::Unmounting.as_str())],
                    vec![
                        Op::put(info_key(name), info),
                        Op::put(state_key(name), VolState::Ready.as_str()),
                    ],
                    vec![],
                )
                .await
                .map(|r| r.succeeded),
            Err(e) => Err(e),
        };
        match reset {
            Ok(true) => info!(name, "volume unmounted"),
            Ok(false) => warn!(name, "Volume left Unmounting while its server stopped"),
            Err(e) => {
                error!(name, error = %e, "Failed to update metadata after stopping server");
                self.mark_error(name, VolState::Unmounting).await;
            }
        }
    }

    async fn read_record(&self, name: &str) -> Result<VolumeRecord> {
        let entries = self.store.read_batch(&[info_key(name)]).await?;
        let (_, value) = entries
            .into_iter()
            .next()
            .ok_or_else(|| VdvsError::NotFound(format!("No info for volume {}", name)))?;
        VolumeRecord::parse(&value)
    }

    async fn read_gref(&self, name: &str) -> Result<u64> {
        let entries = self.store.read_batch(&[gref_key(name)]).await?;
        Ok(entries
            .first()
            .map(|(_, v)| parse_gref(v))
            .unwrap_or_default())
    }

    async fn mark_error(&self, name: &str, from: VolState) {
        if !self
            .store
            .compare_and_put(&state_key(name), from.as_str(), VolState::Error.as_str())
            .await
        {
            warn!(name, %from, "Failed to move volume to Error");
        }
    }

    /// Stops servers whose volume is gone or being deleted.
    pub async fn collect_garbage(&self) -> Result<()> {
        let served = self.servers.volumes().await?;
        if served.is_empty() {
            return Ok(());
        }
        let states = self.store.kv_map(PREFIX_STATE).await?;
        for name in served {
            let state = states.get(&state_key(&name)).map(String::as_str);
            if state.is_none() || state == Some(VolState::Deleting.as_str()) {
                warn!(name, ?state, "The file server of this volume needs to be shut down");
                self.stop_orphan(&name).await;
            }
        }
        Ok(())
    }

    async fn stop_orphan(&self, name: &str) {
        if let Err(e) = self.servers.stop(name).await {
            warn!(name, error = %e, "Failed to stop orphan file server");
        }
    }

    /// Follows `gref/` while the local KV member is up, restarting the watch
    /// whenever the member is replaced.
    pub async fn run_watcher(
        self: Arc<Self>,
        mut ready: watch::Receiver<Option<u64>>,
        cancel: CancellationToken,
    ) {
        loop {
            let generation = *ready.borrow_and_update();
            if let Some(generation) = generation {
                match self.store.backend().watch_prefix(PREFIX_GREF).await {
                    Ok(mut events) => {
                        info!(generation, "gref watcher started");
                        loop {
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                changed = ready.changed() => {
                                    if changed.is_err() {
                                        return;
                                    }
                                    info!(generation, "local KV member changed, restarting watcher");
                                    break;
                                }
                                event = events.recv() => match event {
                                    Some(event) => self.handle_event(&event).await,
                                    None => {
                                        warn!(generation, "gref watch ended");
                                        break;
                                    }
                                },
                            }
                        }
                        continue;
                    }
                    Err(e) => warn!(generation, error = %e, "Failed to start gref watcher"),
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = ready.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(self.timings.busywait_tick), if generation.is_some() => {}
            }
        }
    }

    /// Runs [`Control::collect_garbage`] periodically while this node hosts
    /// a KV member.
    pub async fn run_gc(self: Arc<Self>, ready: watch::Receiver<Option<u64>>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.timings.gc_interval);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    if ready.borrow().is_none() {
                        continue;
                    }
                    if let Err(e) = self.collect_garbage().await {
                        warn!(error = %e, "file server garbage collection failed");
                    }
                }
            }
        }
    }
}
