// Streamshelf - Offline Video Downloads for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Download queue manager
//!
//! # Download Queue Management
//! - FIFO queue, bounded number of concurrent transports (default: 3)
//! - Starts are staggered by 100 ms per item within one scheduling tick
//! - While work is waiting the scheduler re-checks every second
//! - Progress is debounced per download (0.5 %)
//! - No automatic retry; failures surface as a `Failed` event
//!
//! # State
//! All queue state sits behind one async mutex. Transports never touch it: they
//! report through a channel drained by a single pump task, so every mutation is
//! serialized. Slots are freed in exactly one place, `release_slot`.
//!
//! # Cancellation
//! A cancelled id is recorded before its transport is told to stop. Whatever the
//! transport reports afterwards (completion or error) is treated as late: the output
//! is deleted and any asset that slipped through is removed again.

use crate::config::DownloadConfig;
use crate::download::events::{CompletionPhase, DownloadEvent, EventBus, ProgressPayload};
use crate::download::progress::{byte_progress, segmented_progress, DownloadStatus, ProgressReporter};
use crate::download::request::{DownloadRequest, StreamType};
use crate::download::transport::{DownloadTransport, EventSink, Transport, TransportEvent, TransportJob};
use crate::error::{Result, TransportError};
use crate::file::paths::{subtitle_extension, subtitle_file_name, temp_output_path, video_extension, video_file_name};
use crate::file::FileManager;
use crate::storage::assets::AssetStore;
use crate::storage::models::{ActiveDownloadRecord, DownloadedAsset};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

/// A download with a running transport
#[derive(Debug)]
struct ActiveDownload {
    request: DownloadRequest,
    transport: Transport,
    reporter: ProgressReporter,
    output: PathBuf,
    started_at: DateTime<Utc>,
}

impl ActiveDownload {
    fn snapshot(&self) -> ActiveDownloadSnapshot {
        ActiveDownloadSnapshot {
            id: self.request.id().to_string(),
            title: self.request.title.clone(),
            episode_number: self.request.episode_number(),
            progress: self.reporter.current(),
            paused: self.transport.is_paused(),
            transport: self.transport.kind().to_string(),
            started_at: self.started_at,
        }
    }
}

/// Read-only view of an active download
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveDownloadSnapshot {
    pub id: String,
    pub title: String,
    pub episode_number: Option<u32>,
    pub progress: f64,
    pub paused: bool,
    pub transport: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct QueueState {
    queued: VecDeque<DownloadRequest>,
    /// Popped by the scheduler, waiting out their stagger delay
    starting: Vec<DownloadRequest>,
    active: Vec<ActiveDownload>,
    /// Cancelled while active, mapped to the transport output still to delete
    cancelled: HashMap<String, PathBuf>,
    max_concurrent: usize,
    scheduler_running: bool,
    /// Bookkeeping found at startup, offered for manual re-initiation
    interrupted: Vec<ActiveDownloadRecord>,
}

impl QueueState {
    fn in_flight(&self) -> usize {
        self.active.len() + self.starting.len()
    }

    fn active_index(&self, id: &str) -> Option<usize> {
        self.active.iter().position(|a| a.request.id() == id)
    }

    /// Whether any stage of the queue still tracks `id`
    fn tracks(&self, id: &str) -> bool {
        self.queued.iter().any(|r| r.id() == id)
            || self.starting.iter().any(|r| r.id() == id)
            || self.active_index(id).is_some()
            || self.cancelled.contains_key(id)
    }
}

struct Inner {
    state: Mutex<QueueState>,
    transport: Arc<dyn DownloadTransport>,
    store: Arc<AssetStore>,
    events: EventBus,
    config: DownloadConfig,
    temp_dir: PathBuf,
    tx: mpsc::UnboundedSender<(String, TransportEvent)>,
}

/// Download queue manager with concurrency control
///
/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("config", &self.inner.config)
            .field("temp_dir", &self.inner.temp_dir)
            .finish()
    }
}

impl DownloadManager {
    /// Create the manager and start its event pump
    ///
    /// Leftover transport output in `temp_dir` is discarded. Bookkeeping of downloads
    /// interrupted by a previous process is read here and offered through
    /// [`Self::recover_interrupted`].
    pub async fn new(
        config: DownloadConfig,
        temp_dir: PathBuf,
        store: Arc<AssetStore>,
        transport: Arc<dyn DownloadTransport>,
    ) -> Result<Self> {
        FileManager::safe_delete(&temp_dir).await?;
        FileManager::ensure_directory_exists(&temp_dir).await?;

        let interrupted = store.take_active_records().await?;
        if !interrupted.is_empty() {
            tracing::info!(count = interrupted.len(), "Found interrupted downloads");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState {
                queued: VecDeque::new(),
                starting: Vec::new(),
                active: Vec::new(),
                cancelled: HashMap::new(),
                max_concurrent: config.max_concurrent_downloads.max(1),
                scheduler_running: false,
                interrupted,
            }),
            transport,
            events: store.events().clone(),
            store,
            config,
            temp_dir,
            tx,
        });

        tokio::spawn(pump(Arc::downgrade(&inner), rx));
        Ok(Self { inner })
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn store(&self) -> &Arc<AssetStore> {
        &self.inner.store
    }

    /// Append to the queue and kick the scheduler
    ///
    /// Returns the id the download is tracked under. A request whose id is already
    /// queued, running, awaiting its cancel or persisted as an asset gets a fresh one.
    pub async fn enqueue(&self, mut request: DownloadRequest) -> String {
        let id;
        {
            let mut state = self.inner.state.lock().await;
            if state.tracks(request.id()) || self.inner.store.contains(request.id()).await {
                let duplicate = request.id().to_string();
                let fresh = request.renew_id();
                tracing::warn!(duplicate = %duplicate, id = %fresh, "Download id already in use, assigned a new one");
            }
            id = request.id().to_string();
            tracing::info!(id = %id, title = %request.title, "Download queued");

            let episode_number = request.episode_number();
            let is_episode = request.content.is_episode();
            state.queued.push_back(request);

            self.inner.events.emit(DownloadEvent::StatusChange);
            if is_episode {
                self.inner.events.emit(DownloadEvent::Progress(ProgressPayload {
                    id: id.clone(),
                    episode_number,
                    progress: 0.0,
                    status: DownloadStatus::Queued,
                }));
            }
        }

        self.process_queue().await;
        id
    }

    /// Start as many queued downloads as there are free slots
    ///
    /// Re-entrant calls while a tick is pending are no-ops.
    pub async fn process_queue(&self) {
        self.inner.process_queue().await;
    }

    pub async fn cancel_active_download(&self, id: &str) -> bool {
        self.inner.cancel_active_download(id).await
    }

    pub async fn cancel_queued_download(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock().await;

        let removed = if let Some(index) = state.queued.iter().position(|r| r.id() == id) {
            state.queued.remove(index).is_some()
        } else if let Some(index) = state.starting.iter().position(|r| r.id() == id) {
            state.starting.remove(index);
            true
        } else {
            false
        };

        if removed {
            tracing::info!(id, "Queued download cancelled");
            self.inner.events.emit(DownloadEvent::StatusChange);
        }
        removed
    }

    /// Cancel wherever the download currently is
    pub async fn cancel_download(&self, id: &str) -> bool {
        self.cancel_queued_download(id).await || self.cancel_active_download(id).await
    }

    /// Direct downloads only; returns false for segmented or unknown ids
    pub async fn pause_download(&self, id: &str) -> bool {
        let state = self.inner.state.lock().await;
        let paused = state
            .active
            .iter()
            .find(|a| a.request.id() == id)
            .is_some_and(|a| a.transport.pause());
        if paused {
            tracing::info!(id, "Download paused");
        }
        paused
    }

    /// Direct downloads only; returns false for segmented or unknown ids
    pub async fn resume_download(&self, id: &str) -> bool {
        let state = self.inner.state.lock().await;
        let resumed = state
            .active
            .iter()
            .find(|a| a.request.id() == id)
            .is_some_and(|a| a.transport.resume());
        if resumed {
            tracing::info!(id, "Download resumed");
        }
        resumed
    }

    /// Change the concurrency bound (minimum 1)
    ///
    /// Lowering it never interrupts running downloads; the queue drains until the
    /// active count falls below the new bound.
    pub async fn set_max_concurrent(&self, max: usize) {
        {
            let mut state = self.inner.state.lock().await;
            state.max_concurrent = max.max(1);
            tracing::info!(max = state.max_concurrent, "Concurrency limit changed");
        }
        self.process_queue().await;
    }

    pub async fn max_concurrent(&self) -> usize {
        self.inner.state.lock().await.max_concurrent
    }

    /// Waiting requests in FIFO order, including those about to start
    pub async fn queued(&self) -> Vec<DownloadRequest> {
        let state = self.inner.state.lock().await;
        state
            .starting
            .iter()
            .chain(state.queued.iter())
            .cloned()
            .collect()
    }

    pub async fn active(&self) -> Vec<ActiveDownloadSnapshot> {
        let state = self.inner.state.lock().await;
        state.active.iter().map(ActiveDownload::snapshot).collect()
    }

    pub async fn status_of(&self, id: &str) -> Option<DownloadStatus> {
        {
            let state = self.inner.state.lock().await;
            if state.queued.iter().chain(state.starting.iter()).any(|r| r.id() == id) {
                return Some(DownloadStatus::Queued);
            }
            if state.active_index(id).is_some() {
                return Some(DownloadStatus::Downloading);
            }
        }
        if self.inner.store.contains(id).await {
            return Some(DownloadStatus::Completed);
        }
        None
    }

    /// Nothing queued, starting or active
    pub async fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.queued.is_empty() && state.in_flight() == 0
    }

    /// Delete a downloaded asset and its files
    pub async fn delete_asset(&self, id: &str) -> Result<bool> {
        Ok(self.inner.store.remove(id).await?.is_some())
    }

    /// Downloads that were active when the previous process ended
    ///
    /// Returned once; they are never resumed automatically.
    pub async fn recover_interrupted(&self) -> Vec<ActiveDownloadRecord> {
        std::mem::take(&mut self.inner.state.lock().await.interrupted)
    }

    /// Stop every transport and drop the queue
    ///
    /// The `activeDownloads` bookkeeping is left in place so the next process can
    /// offer the interrupted downloads again.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.queued.clear();
        state.starting.clear();
        let active = std::mem::take(&mut state.active);
        for active in active {
            active.transport.cancel();
            state.cancelled.insert(active.request.id().to_string(), active.output);
        }
        tracing::info!("Download manager shut down");
    }
}

/// Drain transport events into the manager, one at a time
async fn pump(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<(String, TransportEvent)>) {
    while let Some((id, event)) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_transport_event(id, event).await;
    }
    tracing::debug!("Transport event pump stopped");
}

impl Inner {
    // ========================================================================
    // SCHEDULING
    // ========================================================================

    async fn process_queue(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.scheduler_running {
            tracing::debug!("Scheduler tick already pending");
            return;
        }
        state.scheduler_running = true;
        self.tick(&mut state);
    }

    /// Polling re-check; runs with the guard still held
    async fn poll_tick(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        self.tick(&mut state);
    }

    fn tick(self: &Arc<Self>, state: &mut QueueState) {
        let slots = state.max_concurrent.saturating_sub(state.in_flight());
        let to_start = slots.min(state.queued.len());

        tracing::debug!(
            queued = state.queued.len(),
            active = state.active.len(),
            starting = state.starting.len(),
            slots,
            "Scheduler tick"
        );

        for index in 0..to_start {
            let Some(request) = state.queued.pop_front() else {
                break;
            };
            let id = request.id().to_string();
            state.starting.push(request);

            let inner = Arc::clone(self);
            let delay = self.config.stagger_delay() * index as u32;
            tokio::spawn(async move {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                inner.start_download(&id).await;
            });
        }

        if state.queued.is_empty() {
            state.scheduler_running = false;
        } else {
            let inner = Arc::clone(self);
            let poll = self.config.poll_interval();
            tokio::spawn(async move {
                sleep(poll).await;
                inner.poll_tick().await;
            });
        }
    }

    /// Schedule a queue check without waiting for it
    fn kick(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.process_queue().await;
        });
    }

    async fn start_download(self: &Arc<Self>, id: &str) {
        let mut state = self.state.lock().await;
        let Some(index) = state.starting.iter().position(|r| r.id() == id) else {
            tracing::debug!(id, "Download left the queue before starting");
            return;
        };
        let request = state.starting.remove(index);

        let stream_type = request.stream_type();
        let output = temp_output_path(&self.temp_dir, id, stream_type);
        let job = TransportJob {
            id: id.to_string(),
            url: request.url.clone(),
            headers: request.transport_headers(),
            preferred_quality: request.preferred_quality.clone(),
            output: output.clone(),
        };
        let sink = EventSink::new(id, self.tx.clone());

        let started = match stream_type {
            StreamType::Hls => self.transport.start_segmented(job, sink).map(Transport::Segmented),
            StreamType::Direct => self.transport.start_direct(job, sink).map(Transport::Direct),
        };

        match started {
            Ok(transport) => {
                tracing::info!(id, title = %request.title, transport = transport.kind(), "Download started");
                state.active.push(ActiveDownload {
                    request,
                    transport,
                    reporter: ProgressReporter::new(self.config.progress_threshold),
                    output,
                    started_at: Utc::now(),
                });
                self.persist_active(&state).await;
                self.events.emit(DownloadEvent::StatusChange);
            }
            Err(e) => {
                tracing::error!(id, title = %request.title, error = %e, "Download could not start");
                self.events.emit(DownloadEvent::Failed {
                    id: id.to_string(),
                    title: request.title.clone(),
                    message: e.into_transport_error().user_message(),
                });
                self.events.emit(DownloadEvent::StatusChange);
                self.kick();
            }
        }
    }

    // ========================================================================
    // SLOT BOOKKEEPING
    // ========================================================================

    /// The only place an active download leaves `active`; idempotent
    async fn release_slot(&self, state: &mut QueueState, id: &str) -> Option<ActiveDownload> {
        let index = state.active_index(id)?;
        let removed = state.active.remove(index);
        self.persist_active(state).await;
        Some(removed)
    }

    async fn persist_active(&self, state: &QueueState) {
        let records: Vec<ActiveDownloadRecord> = state
            .active
            .iter()
            .map(|a| ActiveDownloadRecord::from(&a.request))
            .collect();
        if let Err(e) = self.store.save_active_records(&records).await {
            tracing::warn!(error = %e, "Failed to persist active download bookkeeping");
        }
    }

    // ========================================================================
    // CANCELLATION
    // ========================================================================

    async fn cancel_active_download(self: &Arc<Self>, id: &str) -> bool {
        {
            let mut state = self.state.lock().await;
            let Some(index) = state.active_index(id) else {
                return false;
            };

            let output = state.active[index].output.clone();
            state.cancelled.insert(id.to_string(), output);
            state.active[index].transport.cancel();
            self.release_slot(&mut state, id).await;

            tracing::info!(id, "Active download cancelled");
            self.events.emit(DownloadEvent::StatusChange);
        }

        self.process_queue().await;
        true
    }

    /// A transport reported after its download was cancelled, or reported a cancel itself
    ///
    /// Every output path known for `id` is deleted: the reported one, the one recorded at
    /// cancel time and the one of a download still holding its slot.
    async fn discard_cancelled(&self, state: &mut QueueState, id: &str, output: Option<PathBuf>) {
        let recorded = state.cancelled.remove(id);
        let released = self.release_slot(state, id).await.map(|active| active.output);

        let mut paths: Vec<PathBuf> = Vec::new();
        for path in output.into_iter().chain(recorded).chain(released) {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        for path in paths {
            if let Err(e) = FileManager::safe_delete(&path).await {
                tracing::warn!(id, error = %e, "Failed to delete cancelled output");
            }
        }

        if self.store.contains(id).await {
            tracing::warn!(id, "Removing asset materialized after cancellation");
            if let Err(e) = self.store.remove(id).await {
                tracing::warn!(id, error = %e, "Failed to remove cancelled asset");
            }
        }

        tracing::debug!(id, "Discarded late transport result");
        self.events.emit(DownloadEvent::StatusChange);
    }

    // ========================================================================
    // TRANSPORT EVENTS
    // ========================================================================

    async fn handle_transport_event(self: &Arc<Self>, id: String, event: TransportEvent) {
        match event {
            TransportEvent::SegmentProgress {
                loaded,
                expected_duration,
            } => {
                self.on_progress(&id, segmented_progress(&loaded, expected_duration))
                    .await
            }
            TransportEvent::BytesProgress { received, expected } => {
                self.on_progress(&id, byte_progress(received, expected)).await
            }
            TransportEvent::Finished(output) => self.on_finished(&id, output).await,
            TransportEvent::Failed(error) => self.on_failed(&id, error).await,
        }
    }

    async fn on_progress(&self, id: &str, value: f64) {
        let mut state = self.state.lock().await;
        if state.cancelled.contains_key(id) {
            return;
        }
        let Some(index) = state.active_index(id) else {
            return;
        };

        let active = &mut state.active[index];
        if let Some(progress) = active.reporter.update(value) {
            tracing::trace!(id, progress, "Download progress");
            self.events.emit(DownloadEvent::Progress(ProgressPayload {
                id: id.to_string(),
                episode_number: active.request.episode_number(),
                progress,
                status: DownloadStatus::Downloading,
            }));
        }
    }

    async fn on_failed(self: &Arc<Self>, id: &str, error: TransportError) {
        {
            let mut state = self.state.lock().await;
            if error.is_cancellation() || state.cancelled.contains_key(id) {
                self.discard_cancelled(&mut state, id, None).await;
            } else if let Some(index) = state.active_index(id) {
                let title = state.active[index].request.title.clone();
                tracing::error!(id, title = %title, error = %error, "Download failed");
                self.fail(&mut state, id, &title, error.user_message()).await;
            } else {
                tracing::debug!(id, "Failure for unknown download");
                return;
            }
        }

        self.process_queue().await;
    }

    /// Shared failure tail: free the slot, drop partial output, notify
    async fn fail(&self, state: &mut QueueState, id: &str, title: &str, message: String) {
        if let Some(active) = self.release_slot(state, id).await {
            if let Err(e) = FileManager::safe_delete(&active.output).await {
                tracing::warn!(id, error = %e, "Failed to delete partial output");
            }
        }

        self.events.emit(DownloadEvent::Failed {
            id: id.to_string(),
            title: title.to_string(),
            message,
        });
        self.events.emit(DownloadEvent::StatusChange);
    }

    async fn on_finished(self: &Arc<Self>, id: &str, output: PathBuf) {
        {
            let mut state = self.state.lock().await;
            let index = match state.active_index(id) {
                Some(index) if !state.cancelled.contains_key(id) => index,
                _ => {
                    self.discard_cancelled(&mut state, id, Some(output)).await;
                    drop(state);
                    self.process_queue().await;
                    return;
                }
            };

            let request = state.active[index].request.clone();
            match self.persist_completed(&request, &output).await {
                Ok(asset) => {
                    let episode_number = request.episode_number();
                    if let Some(progress) = state.active[index].reporter.finish() {
                        self.events.emit(DownloadEvent::Progress(ProgressPayload {
                            id: id.to_string(),
                            episode_number,
                            progress,
                            status: DownloadStatus::Downloading,
                        }));
                    }
                    self.release_slot(&mut state, id).await;

                    let phase = match request.subtitle_url {
                        Some(_) => CompletionPhase::VideoReady,
                        None => CompletionPhase::FullyReady,
                    };

                    tracing::info!(id, title = %request.title, path = %asset.local_url.display(), "Download completed");
                    self.events.emit(DownloadEvent::Completed {
                        payload: ProgressPayload {
                            id: id.to_string(),
                            episode_number,
                            progress: 1.0,
                            status: DownloadStatus::Completed,
                        },
                        phase,
                    });
                    self.events.emit(DownloadEvent::StatusChange);

                    if let Some(subtitle_url) = &request.subtitle_url {
                        self.spawn_subtitle_fetch(&request, subtitle_url);
                    }
                }
                Err(e) => {
                    tracing::error!(id, title = %request.title, error = %e, "Failed to persist download");
                    self.fail(&mut state, id, &request.title, e.user_message()).await;
                }
            }
        }

        self.process_queue().await;
    }

    /// Move the output into the downloads directory and record the asset
    async fn persist_completed(&self, request: &DownloadRequest, output: &Path) -> Result<DownloadedAsset> {
        let extension = video_extension(&request.url, request.stream_type());
        let file_name = video_file_name(&request.title, extension);
        let local_url = self
            .store
            .file_manager()
            .move_into_downloads(output, &file_name)
            .await?;

        let asset = DownloadedAsset::from_request(request, local_url);
        if let Err(e) = self.store.add(asset.clone()).await {
            if let Err(cleanup) = FileManager::safe_delete(&asset.local_url).await {
                tracing::warn!(id = %asset.id, error = %cleanup, "Failed to delete unrecorded download");
            }
            return Err(e);
        }
        Ok(asset)
    }

    /// Subtitle phase; the asset is already playable
    fn spawn_subtitle_fetch(self: &Arc<Self>, request: &DownloadRequest, subtitle_url: &str) {
        let id = request.id().to_string();
        let episode_number = request.episode_number();
        let file_name = subtitle_file_name(&id, &subtitle_extension(subtitle_url));
        let destination = self.store.downloads_dir().join(file_name);
        let fetch = self.transport.fetch_file(
            subtitle_url.to_string(),
            request.headers_for(subtitle_url),
            destination.clone(),
        );
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            let fetched = fetch.await;
            let still_present = inner.store.contains(&id).await;
            match fetched {
                Ok(()) if still_present => match inner.store.attach_subtitle(&id, destination).await {
                    Ok(()) => tracing::info!(id = %id, "Subtitle downloaded"),
                    Err(e) => tracing::warn!(id = %id, error = %e, "Failed to record subtitle"),
                },
                Ok(()) => {
                    // Asset deleted while the subtitle was downloading
                    if let Err(e) = FileManager::safe_delete(&destination).await {
                        tracing::warn!(id = %id, error = %e, "Failed to delete orphaned subtitle");
                    }
                    return;
                }
                Err(e) => tracing::warn!(id = %id, error = %e, "Subtitle download failed"),
            }

            inner.events.emit(DownloadEvent::Completed {
                payload: ProgressPayload {
                    id,
                    episode_number,
                    progress: 1.0,
                    status: DownloadStatus::Completed,
                },
                phase: CompletionPhase::FullyReady,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShelfError;
    use crate::download::transport::{DirectTask, SegmentTask};
    use crate::storage::Database;
    use crate::stream::headers::HeaderMap;
    use futures_util::future::BoxFuture;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Transport that never reports; tests drive events through the sinks
    #[derive(Default)]
    struct SilentTransport {
        started: std::sync::Mutex<Vec<String>>,
        reject: bool,
    }

    impl SilentTransport {
        fn record(&self, job: &TransportJob) -> Result<()> {
            if self.reject {
                return Err(ShelfError::InvalidDownloadUrl(job.url.clone()));
            }
            self.started.lock().unwrap().push(job.id.clone());
            Ok(())
        }
    }

    impl DownloadTransport for SilentTransport {
        fn start_segmented(&self, job: TransportJob, _sink: EventSink) -> Result<SegmentTask> {
            self.record(&job)?;
            Ok(SegmentTask::new(CancellationToken::new()))
        }

        fn start_direct(&self, job: TransportJob, _sink: EventSink) -> Result<DirectTask> {
            self.record(&job)?;
            Ok(DirectTask::new(CancellationToken::new()).0)
        }

        fn fetch_file(&self, _url: String, _headers: HeaderMap, _destination: PathBuf) -> BoxFuture<'static, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn fast_config() -> DownloadConfig {
        DownloadConfig {
            stagger_delay_ms: 5,
            poll_interval_ms: 20,
            ..Default::default()
        }
    }

    async fn manager(transport: Arc<SilentTransport>) -> (DownloadManager, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = AssetStore::open(
            Database::new_in_memory().await.unwrap(),
            temp.path().join("downloads"),
            EventBus::new(),
        )
        .await
        .unwrap();
        let manager = DownloadManager::new(
            fast_config(),
            temp.path().join("tmp"),
            Arc::new(store),
            transport,
        )
        .await
        .unwrap();
        (manager, temp)
    }

    #[tokio::test]
    async fn test_pause_only_applies_to_direct() {
        let transport = Arc::new(SilentTransport::default());
        let (manager, _temp) = manager(Arc::clone(&transport)).await;

        let hls = manager.enqueue(DownloadRequest::movie("https://cdn.example.com/a.m3u8", "A")).await;
        let direct = manager.enqueue(DownloadRequest::movie("https://cdn.example.com/b.mp4", "B")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.started.lock().unwrap().len(), 2);

        assert!(!manager.pause_download(&hls).await);
        assert!(manager.pause_download(&direct).await);
        assert!(manager.active().await.iter().any(|a| a.id == direct && a.paused));
        assert!(manager.resume_download(&direct).await);
        assert!(!manager.pause_download("unknown").await);
    }

    #[tokio::test]
    async fn test_setup_failure_never_becomes_active() {
        let transport = Arc::new(SilentTransport {
            reject: true,
            ..Default::default()
        });
        let (manager, _temp) = manager(transport).await;
        let mut events = manager.events().subscribe_channel();

        let id = manager.enqueue(DownloadRequest::movie("https://cdn.example.com/a.mp4", "A")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(manager.active().await.is_empty());
        assert_eq!(manager.status_of(&id).await, None);

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if let DownloadEvent::Failed { id: failed, .. } = event {
                assert_eq!(failed, id);
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_set_max_concurrent_has_floor() {
        let (manager, _temp) = manager(Arc::new(SilentTransport::default())).await;
        manager.set_max_concurrent(0).await;
        assert_eq!(manager.max_concurrent().await, 1);
    }

    #[tokio::test]
    async fn test_active_bookkeeping_round_trip() {
        let transport = Arc::new(SilentTransport::default());
        let (manager, temp) = manager(Arc::clone(&transport)).await;

        let id = manager.enqueue(DownloadRequest::movie("https://cdn.example.com/a.mp4", "A")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.status_of(&id).await, Some(DownloadStatus::Downloading));
        manager.shutdown().await;

        // A new manager over the same store sees the interrupted download once
        let store = Arc::clone(manager.store());
        let next = DownloadManager::new(
            fast_config(),
            temp.path().join("tmp"),
            store,
            transport,
        )
        .await
        .unwrap();
        let records = next.recover_interrupted().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert!(next.recover_interrupted().await.is_empty());
    }
}
