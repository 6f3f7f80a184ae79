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

//! HTTP transport
//!
//! # Segmented (HLS)
//! 1. Fetch the manifest; for a master playlist pick a variant with the quality resolver
//! 2. Parse the media playlist
//! 3. Download every segment (AES-128 segments are decrypted on the fly) into a
//!    `.movpkg` directory, reporting loaded media time after each one
//! 4. Write a local `index.m3u8` referencing the segment files
//!
//! # Direct
//! Streams the body to a single file. Pausing drops the connection; resuming sends
//! `Range: bytes={written}-` and appends. A server that answers a range request with
//! 200 restarts the file from zero.

use crate::config::DownloadConfig;
use crate::download::progress::TimeRange;
use crate::download::transport::{
    DirectTask, DownloadTransport, EventSink, SegmentTask, TransportEvent, TransportJob,
};
use crate::error::{Result, ShelfError, TransportError};
use crate::stream::headers::{to_reqwest_headers, HeaderMap};
use crate::stream::manifest::{
    fetch_quality_variants, is_master_playlist, parse_quality_variants, resolve_uri, QualityVariant,
};
use crate::stream::playlist::{parse_media_playlist, render_local_playlist, SegmentKey};
use crate::stream::quality::find_closest_quality;
use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use reqwest::{header, Client, Response, StatusCode};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Write buffer for direct downloads
const DOWNLOAD_BUFF_SZ: usize = 64 * 1024;

/// Local playlist inside a segmented package
pub const LOCAL_PLAYLIST_NAME: &str = "index.m3u8";

/// Transport over reqwest
///
/// The client carries only a connect timeout. Small documents (manifests, keys,
/// subtitles) get a whole-request deadline; media bodies are bounded by the gap
/// between chunks so a slow but live transfer never times out.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    request_timeout: Duration,
    read_idle_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .cookie_store(true)
            .build()?;
        Ok(Self {
            client,
            request_timeout: config.request_timeout(),
            read_idle_timeout: config.read_idle_timeout(),
        })
    }

    /// Quality variants behind `url`, `[]` on any failure
    pub async fn fetch_qualities(&self, url: &str, headers: &HeaderMap) -> Vec<QualityVariant> {
        fetch_quality_variants(&self.client, url, headers, self.request_timeout).await
    }

    fn validate_url(url: &str) -> Result<()> {
        let parsed = Url::parse(url).map_err(|e| ShelfError::InvalidDownloadUrl(format!("{}: {}", url, e)))?;
        match parsed.scheme() {
            "http" | "https" => Ok(()),
            other => Err(ShelfError::InvalidDownloadUrl(format!(
                "Unsupported scheme '{}' in {}",
                other, url
            ))),
        }
    }
}

/// Run `work` until it finishes or `cancel` fires, then report the outcome once
fn spawn_worker<F>(cancel: CancellationToken, sink: EventSink, work: F)
where
    F: Future<Output = Result<PathBuf>> + Send + 'static,
{
    tokio::spawn(async move {
        let event = tokio::select! {
            _ = cancel.cancelled() => TransportEvent::Failed(TransportError::Cancelled),
            result = work => match result {
                Ok(path) => TransportEvent::Finished(path),
                Err(e) if e.is_file_error() => {
                    tracing::error!(id = %sink.id(), error = %e, "Transport could not write its output");
                    TransportEvent::Failed(e.into_transport_error())
                }
                Err(e) => {
                    tracing::warn!(id = %sink.id(), error = %e, "Transport failed");
                    TransportEvent::Failed(e.into_transport_error())
                }
            },
        };
        sink.send(event);
    });
}

impl DownloadTransport for HttpTransport {
    fn start_segmented(&self, job: TransportJob, sink: EventSink) -> Result<SegmentTask> {
        Self::validate_url(&job.url)?;
        let cancel = CancellationToken::new();
        let http = self.clone();
        let worker_sink = sink.clone();

        tracing::debug!(id = %job.id, url = %job.url, "Starting segmented transport");
        spawn_worker(cancel.clone(), sink, async move {
            run_segmented(&http, &job, &worker_sink).await
        });
        Ok(SegmentTask::new(cancel))
    }

    fn start_direct(&self, job: TransportJob, sink: EventSink) -> Result<DirectTask> {
        Self::validate_url(&job.url)?;
        let cancel = CancellationToken::new();
        let (task, paused) = DirectTask::new(cancel.clone());
        let http = self.clone();
        let worker_sink = sink.clone();

        tracing::debug!(id = %job.id, url = %job.url, "Starting direct transport");
        spawn_worker(cancel, sink, async move {
            run_direct(&http, &job, &worker_sink, paused).await
        });
        Ok(task)
    }

    fn fetch_file(&self, url: String, headers: HeaderMap, destination: PathBuf) -> BoxFuture<'static, Result<()>> {
        let http = self.clone();
        Box::pin(async move {
            Self::validate_url(&url)?;
            let body = fetch_bytes(&http, &url, &headers, Deadline::Total).await?;
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&destination, &body).await?;
            Ok(())
        })
    }
}

// ============================================================================
// REQUESTS
// ============================================================================

/// How a fetch is bounded in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    /// `request_timeout` for the whole exchange
    Total,
    /// `read_idle_timeout` between body chunks, no overall limit
    Idle,
}

async fn send(
    http: &HttpTransport,
    url: &str,
    headers: &HeaderMap,
    range_from: Option<u64>,
    deadline: Deadline,
) -> Result<Response> {
    let mut request = http.client.get(url).headers(to_reqwest_headers(headers));
    if let Some(offset) = range_from {
        request = request.header(header::RANGE, format!("bytes={}-", offset));
    }
    request = match deadline {
        Deadline::Total => request.timeout(http.request_timeout),
        Deadline::Idle => request,
    };

    let response = match deadline {
        Deadline::Total => request.send().await,
        Deadline::Idle => tokio::time::timeout(http.read_idle_timeout, request.send())
            .await
            .map_err(|_| stalled(http.read_idle_timeout))?,
    }
    .map_err(|e| TransportError::from_reqwest(&e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::from_status(status.as_u16()).into());
    }
    Ok(response)
}

fn stalled(idle: Duration) -> ShelfError {
    TransportError::NetworkUnreachable(format!("No data received for {}s", idle.as_secs())).into()
}

/// Next body chunk, failing when none arrives within `idle`
async fn next_chunk<S, B>(stream: &mut S, idle: Duration) -> Result<Option<B>>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
{
    match tokio::time::timeout(idle, stream.next()).await {
        Err(_) => Err(stalled(idle)),
        Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
        Ok(Some(Err(e))) => Err(TransportError::from_reqwest(&e).into()),
        Ok(None) => Ok(None),
    }
}

async fn fetch_bytes(http: &HttpTransport, url: &str, headers: &HeaderMap, deadline: Deadline) -> Result<Vec<u8>> {
    let response = send(http, url, headers, None, deadline).await?;
    if deadline == Deadline::Total {
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        return Ok(body.to_vec());
    }

    let mut body = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = next_chunk(&mut stream, http.read_idle_timeout).await? {
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Body text plus the final (post-redirect) url
async fn fetch_text(http: &HttpTransport, url: &str, headers: &HeaderMap) -> Result<(String, String)> {
    let response = send(http, url, headers, None, Deadline::Total).await?;
    let final_url = response.url().to_string();
    let text = response
        .text()
        .await
        .map_err(|e| TransportError::from_reqwest(&e))?;
    Ok((text, final_url))
}

// ============================================================================
// SEGMENTED
// ============================================================================

/// Variant to download from a master playlist
///
/// `preferred` goes through the quality resolver; without one the highest
/// resolution wins. Falls back to the first declared stream when no variant
/// carries a resolution.
pub fn choose_variant_url(master: &str, base_url: &str, preferred: Option<&str>) -> Option<String> {
    let variants: Vec<QualityVariant> = parse_quality_variants(master, base_url)
        .into_iter()
        .filter(|v| !v.is_auto())
        .collect();

    if !variants.is_empty() {
        let preferred = preferred.unwrap_or(&variants[0].label);
        return find_closest_quality(preferred, &variants, None).map(|v| v.url.clone());
    }

    first_stream_uri(master, base_url)
}

fn first_stream_uri(master: &str, base_url: &str) -> Option<String> {
    let mut lines = master.lines().map(str::trim);
    while let Some(line) = lines.next() {
        if line.starts_with("#EXT-X-STREAM-INF") {
            let uri = lines.by_ref().find(|l| !l.is_empty() && !l.starts_with('#'))?;
            return resolve_uri(base_url, uri);
        }
    }
    None
}

/// AES-128-CBC with PKCS7 padding
pub fn decrypt_aes128(mut data: Vec<u8>, key: &[u8], iv: &[u8; 16]) -> Result<Vec<u8>> {
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| ShelfError::DecryptionFailed(format!("Failed to initialize AES decryptor: {}", e)))?;

    let len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut data)
        .map_err(|e| ShelfError::DecryptionFailed(format!("Decryption failed: {}", e)))?
        .len();
    data.truncate(len);
    Ok(data)
}

async fn run_segmented(http: &HttpTransport, job: &TransportJob, sink: &EventSink) -> Result<PathBuf> {
    let (mut text, mut media_url) = fetch_text(http, &job.url, &job.headers).await?;

    if is_master_playlist(&text) {
        let variant_url = choose_variant_url(&text, &media_url, job.preferred_quality.as_deref())
            .ok_or_else(|| ShelfError::InvalidPlaylist("Master playlist has no variants".to_string()))?;
        tracing::debug!(id = %job.id, variant = %variant_url, "Selected variant");
        (text, media_url) = fetch_text(http, &variant_url, &job.headers).await?;
    }

    let playlist = parse_media_playlist(&text, &media_url)?;
    let expected_duration = playlist.total_duration();

    let package = &job.output;
    if fs::try_exists(package).await.unwrap_or(false) {
        fs::remove_dir_all(package).await?;
    }
    fs::create_dir_all(package).await?;

    let init_file = match &playlist.init_segment {
        Some(uri) => {
            let body = fetch_bytes(http, uri, &job.headers, Deadline::Idle).await?;
            fs::write(package.join("init.mp4"), &body).await?;
            Some("init.mp4")
        }
        None => None,
    };
    let segment_ext = if init_file.is_some() { "m4s" } else { "ts" };

    let mut keys: HashMap<String, Vec<u8>> = HashMap::new();
    let mut loaded: Vec<TimeRange> = Vec::with_capacity(playlist.segments.len());
    let mut file_names = Vec::with_capacity(playlist.segments.len());
    let mut position = 0.0;

    for (index, segment) in playlist.segments.iter().enumerate() {
        let mut body = fetch_bytes(http, &segment.uri, &job.headers, Deadline::Idle).await?;

        if let SegmentKey::Aes128 { uri, .. } = &segment.key {
            if !keys.contains_key(uri) {
                let key = fetch_bytes(http, uri, &job.headers, Deadline::Total).await?;
                if key.len() != 16 {
                    return Err(ShelfError::DecryptionFailed(format!(
                        "Key at {} is {} bytes, expected 16",
                        uri,
                        key.len()
                    )));
                }
                keys.insert(uri.clone(), key);
            }
            let iv = segment
                .iv()
                .ok_or_else(|| ShelfError::internal("Encrypted segment without IV"))?;
            body = decrypt_aes128(body, &keys[uri], &iv)?;
        }

        let name = format!("segment-{}.{}", index, segment_ext);
        fs::write(package.join(&name), &body).await?;
        file_names.push(name);

        loaded.push(TimeRange::new(position, segment.duration));
        position += segment.duration;
        sink.send(TransportEvent::SegmentProgress {
            loaded: loaded.clone(),
            expected_duration,
        });
    }

    let local = render_local_playlist(&playlist, &file_names, init_file);
    fs::write(package.join(LOCAL_PLAYLIST_NAME), local).await?;

    tracing::info!(id = %job.id, segments = file_names.len(), "Segmented download finished");
    Ok(package.clone())
}

// ============================================================================
// DIRECT
// ============================================================================

/// Total size from `Content-Range: bytes 1000-1999/2000`
pub fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next().and_then(|total| total.trim().parse().ok())
}

async fn wait_while_paused(paused: &mut watch::Receiver<bool>) {
    while *paused.borrow() {
        if paused.changed().await.is_err() {
            return;
        }
    }
}

async fn run_direct(
    http: &HttpTransport,
    job: &TransportJob,
    sink: &EventSink,
    mut paused: watch::Receiver<bool>,
) -> Result<PathBuf> {
    let output = &job.output;
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut written: u64 = 0;
    let mut expected: Option<u64> = None;
    let mut pause_closed = false;

    loop {
        wait_while_paused(&mut paused).await;

        let range_from = (written > 0).then_some(written);
        let response = send(http, &job.url, &job.headers, range_from, Deadline::Idle).await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                if let Some(total) = response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(content_range_total)
                {
                    expected = Some(total);
                }
            }
            _ => {
                if written > 0 {
                    tracing::debug!(id = %job.id, "Server ignored range request, restarting");
                    written = 0;
                }
                expected = response.content_length();
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(written > 0)
            .truncate(written == 0)
            .open(output)
            .await?;
        let mut writer = BufWriter::with_capacity(DOWNLOAD_BUFF_SZ, file);
        let mut stream = response.bytes_stream();
        let mut interrupted = false;

        loop {
            tokio::select! {
                biased;
                changed = paused.changed(), if !pause_closed => {
                    match changed {
                        Ok(()) if *paused.borrow() => {
                            interrupted = true;
                            break;
                        }
                        Ok(()) => {}
                        Err(_) => pause_closed = true,
                    }
                }
                chunk = next_chunk(&mut stream, http.read_idle_timeout) => match chunk {
                    Ok(Some(bytes)) => {
                        writer.write_all(&bytes).await?;
                        written += bytes.len() as u64;
                        sink.send(TransportEvent::BytesProgress { received: written, expected });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        writer.flush().await?;
                        return Err(e);
                    }
                },
            }
        }

        writer.flush().await?;

        if interrupted {
            tracing::debug!(id = %job.id, written, "Direct download paused");
            continue;
        }

        if let Some(total) = expected {
            if written < total {
                return Err(TransportError::Other(format!(
                    "Download incomplete: {}/{} bytes",
                    written, total
                ))
                .into());
            }
        }

        tracing::info!(id = %job.id, bytes = written, "Direct download finished");
        return Ok(output.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        let padded_len = ((plaintext.len() / 16) + 1) * 16;
        let mut buffer = vec![0u8; padded_len];
        buffer[..plaintext.len()].copy_from_slice(plaintext);
        cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_decrypt_round_trip() {
        let key = [7u8; 16];
        let iv = [1u8; 16];
        let plaintext = b"transport stream payload, not block aligned";

        let decrypted = decrypt_aes128(encrypt(plaintext, &key, &iv), &key, &iv).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_rejects_bad_key() {
        assert!(matches!(
            decrypt_aes128(vec![0u8; 16], &[0u8; 8], &[0u8; 16]),
            Err(ShelfError::DecryptionFailed(_))
        ));
    }

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
360/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080
1080/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1280x720
720/index.m3u8
";

    #[test]
    fn test_choose_variant() {
        let base = "https://cdn.example.com/show/master.m3u8";
        assert_eq!(
            choose_variant_url(MASTER, base, None).as_deref(),
            Some("https://cdn.example.com/show/1080/index.m3u8")
        );
        assert_eq!(
            choose_variant_url(MASTER, base, Some("720p")).as_deref(),
            Some("https://cdn.example.com/show/720/index.m3u8")
        );
        assert_eq!(
            choose_variant_url(MASTER, base, Some("Data Saver")).as_deref(),
            Some("https://cdn.example.com/show/360/index.m3u8")
        );
    }

    #[test]
    fn test_choose_variant_without_resolutions() {
        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\n\nlow.m3u8\n";
        assert_eq!(
            choose_variant_url(master, "https://cdn.example.com/m.m3u8", None).as_deref(),
            Some("https://cdn.example.com/low.m3u8")
        );
        assert_eq!(choose_variant_url("#EXTM3U\n", "https://cdn.example.com/m.m3u8", None), None);
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total("bytes 1000-1999/2000"), Some(2000));
        assert_eq!(content_range_total("bytes 0-1/*"), None);
    }

    #[tokio::test]
    async fn test_setup_rejects_bad_urls() {
        let transport = HttpTransport::new(&DownloadConfig::default()).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let job = TransportJob {
            id: "x".into(),
            url: "ftp://example.com/a.mp4".into(),
            headers: HeaderMap::new(),
            preferred_quality: None,
            output: PathBuf::from("/tmp/x.download"),
        };

        assert!(matches!(
            transport.start_direct(job.clone(), EventSink::new("x", tx.clone())),
            Err(ShelfError::InvalidDownloadUrl(_))
        ));
        let job = TransportJob { url: "not a url".into(), ..job };
        assert!(transport.start_segmented(job, EventSink::new("x", tx)).is_err());
    }

    /// Local server answering one request: headers, then `body` one byte per `gap`
    async fn trickle_server(body: &'static [u8], gap: Duration) -> String {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            for byte in body {
                tokio::time::sleep(gap).await;
                if socket.write_all(&[*byte]).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
            }
        });
        format!("http://{}/movie.mp4", addr)
    }

    fn short_timeouts() -> DownloadConfig {
        DownloadConfig {
            request_timeout_secs: 1,
            read_idle_timeout_secs: 1,
            ..Default::default()
        }
    }

    async fn run_to_end(url: String, output: PathBuf) -> TransportEvent {
        let transport = HttpTransport::new(&short_timeouts()).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let job = TransportJob {
            id: "slow".into(),
            url,
            headers: HeaderMap::new(),
            preferred_quality: None,
            output,
        };
        let _task = transport.start_direct(job, EventSink::new("slow", tx)).unwrap();

        let wait = async {
            loop {
                let (_, event) = rx.recv().await.unwrap();
                if event.is_terminal() {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait).await.unwrap()
    }

    #[tokio::test]
    async fn test_slow_direct_body_outlives_request_timeout() {
        let temp = tempfile::TempDir::new().unwrap();
        let output = temp.path().join("movie.download");
        // 20 bytes at 100ms each takes twice the 1s request timeout
        let url = trickle_server(b"0123456789abcdefghij", Duration::from_millis(100)).await;

        let event = run_to_end(url, output.clone()).await;
        assert!(matches!(event, TransportEvent::Finished(_)), "got {:?}", event);
        assert_eq!(std::fs::read(&output).unwrap(), b"0123456789abcdefghij");
    }

    #[tokio::test]
    async fn test_stalled_direct_body_fails() {
        let temp = tempfile::TempDir::new().unwrap();
        let url = trickle_server(b"0123", Duration::from_secs(3)).await;

        let event = run_to_end(url, temp.path().join("movie.download")).await;
        assert!(
            matches!(event, TransportEvent::Failed(TransportError::NetworkUnreachable(_))),
            "got {:?}",
            event
        );
    }
}
