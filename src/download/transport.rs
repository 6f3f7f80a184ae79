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

//! Transport abstraction
//!
//! A transport moves bytes for one download on its own task and reports back
//! through an [`EventSink`]. It never touches queue state. The queue manager owns
//! exactly one [`Transport`] handle per active download.
//!
//! Segmented transports support cancel only. Direct transports also pause and resume.

use crate::error::{Result, TransportError};
use crate::download::progress::TimeRange;
use crate::stream::headers::HeaderMap;
use futures_util::future::BoxFuture;
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// What a transport reports about its download
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Segmented: media time loaded so far
    SegmentProgress {
        loaded: Vec<TimeRange>,
        expected_duration: f64,
    },
    /// Direct: bytes written so far
    BytesProgress { received: u64, expected: Option<u64> },
    /// Output is complete at this path
    Finished(PathBuf),
    Failed(TransportError),
}

impl TransportEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Finished(_) | TransportEvent::Failed(_))
    }
}

/// Sender half handed to a transport, tagged with the download id
#[derive(Debug, Clone)]
pub struct EventSink {
    id: String,
    tx: mpsc::UnboundedSender<(String, TransportEvent)>,
}

impl EventSink {
    pub fn new(id: impl Into<String>, tx: mpsc::UnboundedSender<(String, TransportEvent)>) -> Self {
        Self { id: id.into(), tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// False once the manager is gone
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send((self.id.clone(), event)).is_ok()
    }
}

/// Everything a transport needs to start one download
#[derive(Debug, Clone)]
pub struct TransportJob {
    pub id: String,
    pub url: String,
    pub headers: HeaderMap,
    /// Variant label for adaptive streams; highest when unset
    pub preferred_quality: Option<String>,
    /// Where the finished output must be
    pub output: PathBuf,
}

/// Handle to a running segmented download
#[derive(Debug)]
pub struct SegmentTask {
    cancel: CancellationToken,
}

impl SegmentTask {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Handle to a running direct download
#[derive(Debug)]
pub struct DirectTask {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
}

impl DirectTask {
    /// Returns the handle and the receiver the worker watches for pause state
    pub fn new(cancel: CancellationToken) -> (Self, watch::Receiver<bool>) {
        let (paused, rx) = watch::channel(false);
        (Self { cancel, paused }, rx)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

/// The transport backing one active download
#[derive(Debug)]
pub enum Transport {
    Segmented(SegmentTask),
    Direct(DirectTask),
}

impl Transport {
    pub fn cancel(&self) {
        match self {
            Transport::Segmented(task) => task.cancel(),
            Transport::Direct(task) => task.cancel(),
        }
    }

    /// False for segmented downloads
    pub fn pause(&self) -> bool {
        match self {
            Transport::Segmented(_) => false,
            Transport::Direct(task) => {
                task.pause();
                true
            }
        }
    }

    /// False for segmented downloads
    pub fn resume(&self) -> bool {
        match self {
            Transport::Segmented(_) => false,
            Transport::Direct(task) => {
                task.resume();
                true
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        match self {
            Transport::Segmented(_) => false,
            Transport::Direct(task) => task.is_paused(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Segmented(_) => "segmented",
            Transport::Direct(_) => "direct",
        }
    }
}

/// Starts transports
///
/// `start_*` spawn the worker and return immediately; they must be called from
/// within a tokio runtime. An `Err` means the download never started.
pub trait DownloadTransport: Send + Sync {
    fn start_segmented(&self, job: TransportJob, sink: EventSink) -> Result<SegmentTask>;

    fn start_direct(&self, job: TransportJob, sink: EventSink) -> Result<DirectTask>;

    /// Fetch a small file (subtitles) straight to `destination`
    fn fetch_file(&self, url: String, headers: HeaderMap, destination: PathBuf) -> BoxFuture<'static, Result<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segmented_cannot_pause() {
        let transport = Transport::Segmented(SegmentTask::new(CancellationToken::new()));
        assert!(!transport.pause());
        assert!(!transport.resume());
        assert!(!transport.is_paused());
    }

    #[test]
    fn test_direct_pause_resume_and_cancel() {
        let token = CancellationToken::new();
        let (task, rx) = DirectTask::new(token.clone());
        let transport = Transport::Direct(task);

        assert!(transport.pause());
        assert!(*rx.borrow());
        assert!(transport.is_paused());
        assert!(transport.resume());
        assert!(!*rx.borrow());

        transport.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_sink_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new("abc", tx);
        assert!(sink.send(TransportEvent::BytesProgress {
            received: 1,
            expected: None
        }));

        let (id, event) = rx.recv().await.unwrap();
        assert_eq!(id, "abc");
        assert!(!event.is_terminal());

        drop(rx);
        assert!(!sink.send(TransportEvent::Finished(PathBuf::from("x"))));
    }
}
