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

//! Download subsystem
//!
//! - `request` - what to download and how it is identified
//! - `manager` - FIFO queue with bounded concurrency
//! - `transport` - the seam between the queue and byte movers
//! - `http` - reqwest transports (segmented HLS and direct files)
//! - `progress` - status, progress math and debouncing
//! - `events` - notifications for the UI layer

pub mod events;
pub mod http;
pub mod manager;
pub mod progress;
pub mod request;
pub mod transport;

// Re-export commonly used types
pub use events::{CompletionPhase, DownloadEvent, EventBus, ProgressPayload, SubscriptionId};
pub use http::HttpTransport;
pub use manager::{ActiveDownloadSnapshot, DownloadManager};
pub use progress::{DownloadStatus, ProgressReporter, TimeRange};
pub use request::{ContentKind, DownloadRequest, StreamSource, StreamType};
pub use transport::{DownloadTransport, EventSink, Transport, TransportEvent, TransportJob};
