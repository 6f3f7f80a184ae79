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

//! C FFI bridge for iOS - Exposes the download core to the Swift app
//!
//! # Architecture
//! SwiftUI → Swift (`DownloadCoreBridge`) → C FFI → Rust
//!
//! # Design Patterns
//! 1. **JSON Communication**: All complex data is serialized to JSON for FFI crossing
//! 2. **Error Handling**: All errors are caught and returned as JSON error responses
//! 3. **Async Runtime**: One process-wide tokio runtime owns the queue and transports
//! 4. **No Panics**: All panics are caught to prevent crashes across FFI boundary
//! 5. **Memory Safety**: All returned strings must be freed by caller using `rust_free_string()`
//!
//! # Response Format
//! ```json
//! { "success": true, "data": { ... } }
//! ```
//! Or on error:
//! ```json
//! { "success": false, "error": "Error message" }
//! ```
//!
//! # Events
//! Download events are buffered inside Rust. Swift drains them with
//! `rust_poll_events()` (typically from a display-link or timer) and forwards
//! them to its observers.
//!
//! # Memory Management
//! **CRITICAL**: All string pointers returned from Rust functions MUST be freed
//! by the caller using `rust_free_string()`.
//!
//! ```swift
//! let resultPtr = rust_enqueue_download(requestJson)
//! defer { rust_free_string(resultPtr) }
//! let jsonString = String(cString: resultPtr)
//! ```

use crate::config::CoreConfig;
use crate::download::{DownloadEvent, DownloadManager, DownloadRequest, HttpTransport};
use crate::error::{Result, ShelfError};
use crate::storage::{AssetStore, Database};
use crate::stream::headers::HeaderMap;
use crate::stream::{NetworkClass, QualityPreferences, QualityVariant};
use serde::Serialize;
use std::collections::VecDeque;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::panic;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

/// Events kept for Swift before the oldest are dropped
const MAX_BUFFERED_EVENTS: usize = 1024;

struct Core {
    manager: DownloadManager,
    transport: Arc<HttpTransport>,
    events: Arc<Mutex<VecDeque<DownloadEvent>>>,
}

// Lazy static tokio runtime for async operations
lazy_static::lazy_static! {
    static ref RUNTIME: tokio::runtime::Runtime =
        tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    static ref CORE: RwLock<Option<Arc<Core>>> = RwLock::new(None);
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Safely convert C string pointer to Rust String
///
/// # Safety
/// Caller must ensure ptr is a valid null-terminated C string
fn c_str_to_string(ptr: *const c_char) -> Result<String> {
    if ptr.is_null() {
        return Err(ShelfError::InvalidInput("Null pointer received".to_string()));
    }
    unsafe {
        CStr::from_ptr(ptr)
            .to_str()
            .map(|s| s.to_string())
            .map_err(|e| ShelfError::InvalidInput(format!("Invalid UTF-8: {}", e)))
    }
}

/// Convert Rust string to C string pointer
///
/// # Safety
/// Caller MUST free the returned pointer using `rust_free_string()`
fn string_to_c_str(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(c_string) => c_string.into_raw(),
        Err(_) => {
            // error_response never contains interior nulls
            let error_json = error_response("String contains null bytes");
            CString::new(error_json).unwrap_or_default().into_raw()
        }
    }
}

/// Create success response JSON
fn success_response<T: Serialize>(data: T) -> String {
    serde_json::json!({
        "success": true,
        "data": data
    })
    .to_string()
}

/// Create error response JSON
fn error_response(error: &str) -> String {
    serde_json::json!({
        "success": false,
        "error": error
    })
    .to_string()
}

/// Wrap a function call with panic catching
fn catch_panic<F>(f: F) -> String
where
    F: FnOnce() -> Result<String> + panic::UnwindSafe,
{
    match panic::catch_unwind(f) {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => error_response(&e.user_message()),
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "Unknown panic occurred".to_string()
            };
            error_response(&format!("Rust panic: {}", panic_msg))
        }
    }
}

fn core() -> Result<Arc<Core>> {
    let guard = CORE
        .read()
        .map_err(|_| ShelfError::internal("Core lock poisoned"))?;
    guard
        .clone()
        .ok_or_else(|| ShelfError::InvalidState("Core not initialized; call rust_core_init first".to_string()))
}

fn parse_network(value: &str) -> Result<NetworkClass> {
    match value.to_ascii_lowercase().as_str() {
        "wifi" => Ok(NetworkClass::Wifi),
        "cellular" => Ok(NetworkClass::Cellular),
        other => Err(ShelfError::invalid_input(format!("Unknown network class: {}", other))),
    }
}

/// Headers arrive as a JSON object; an empty string means none
fn parse_headers(json: &str) -> Result<HeaderMap> {
    if json.trim().is_empty() {
        return Ok(HeaderMap::new());
    }
    Ok(serde_json::from_str(json)?)
}

async fn build_core(data_dir: PathBuf) -> Result<(Core, serde_json::Value)> {
    let config = CoreConfig::load_or_init(&data_dir)?;
    config.validate()?;

    crate::logging::init_logging(&config.log_filter);
    tracing::info!(data_dir = %config.data_dir.display(), "Initializing download core");

    let db = Database::new(config.database_path()).await?;
    let events = crate::download::EventBus::new();
    let buffer: Arc<Mutex<VecDeque<DownloadEvent>>> = Arc::new(Mutex::new(VecDeque::new()));
    let sink = Arc::clone(&buffer);
    events.subscribe(move |event| {
        if let Ok(mut queue) = sink.lock() {
            if queue.len() >= MAX_BUFFERED_EVENTS {
                queue.pop_front();
            }
            queue.push_back(event.clone());
        }
    });

    let store = Arc::new(AssetStore::open(db, config.downloads_dir(), events).await?);
    let transport = Arc::new(HttpTransport::new(&config.download)?);
    let manager = DownloadManager::new(
        config.download.clone(),
        config.temp_dir(),
        store,
        Arc::clone(&transport) as Arc<dyn crate::download::DownloadTransport>,
    )
    .await?;

    let interrupted = manager.recover_interrupted().await;
    let info = serde_json::json!({
        "downloadsDir": config.downloads_dir(),
        "maxConcurrent": manager.max_concurrent().await,
        "interrupted": interrupted,
    });

    Ok((
        Core {
            manager,
            transport,
            events: buffer,
        },
        info,
    ))
}

// ============================================================================
// LIFECYCLE
// ============================================================================

/// Initialize the core rooted at `data_dir`
///
/// Opens the database, validates stored asset locations and starts the queue.
/// Calling it again replaces the previous core after shutting it down.
///
/// # Returns
/// ```json
/// {
///   "success": true,
///   "data": {
///     "downloadsDir": "/var/mobile/.../downloads",
///     "maxConcurrent": 3,
///     "interrupted": [{ "id": "...", "url": "...", "type": "hls", "title": "..." }]
///   }
/// }
/// ```
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_core_init(data_dir: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let data_dir = PathBuf::from(c_str_to_string(data_dir)?);
        let previous = CORE
            .write()
            .map_err(|_| ShelfError::internal("Core lock poisoned"))?
            .take();
        if let Some(previous) = previous {
            RUNTIME.block_on(previous.manager.shutdown());
        }

        let (core, info) = RUNTIME.block_on(build_core(data_dir))?;
        *CORE
            .write()
            .map_err(|_| ShelfError::internal("Core lock poisoned"))? = Some(Arc::new(core));
        Ok(success_response(info))
    });

    string_to_c_str(response)
}

/// Stop all transports; active downloads are offered again on the next init
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_core_shutdown() -> *mut c_char {
    let response = catch_panic(|| {
        let previous = CORE
            .write()
            .map_err(|_| ShelfError::internal("Core lock poisoned"))?
            .take();
        if let Some(core) = previous {
            RUNTIME.block_on(core.manager.shutdown());
        }
        Ok(success_response(serde_json::json!({ "shutdown": true })))
    });

    string_to_c_str(response)
}

/// Drain buffered download events
///
/// # Returns
/// `data` is an array of events tagged by `"event"` (`progress`, `statusChange`,
/// `completed`, `deleted`, `libraryChange`, `cleanup`, `failed`).
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_poll_events() -> *mut c_char {
    let response = catch_panic(|| {
        let core = core()?;
        let drained: Vec<DownloadEvent> = core
            .events
            .lock()
            .map_err(|_| ShelfError::internal("Event buffer poisoned"))?
            .drain(..)
            .collect();
        Ok(success_response(drained))
    });

    string_to_c_str(response)
}

// ============================================================================
// DOWNLOAD QUEUE
// ============================================================================

/// Queue a download
///
/// # Arguments
/// * `request_json` - A `DownloadRequest` in camelCase JSON. Any `id` field is ignored;
///   the core assigns one and returns it
///
/// # Returns
/// `{ "success": true, "data": { "id": "..." } }`
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_enqueue_download(request_json: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let request: DownloadRequest = serde_json::from_str(&c_str_to_string(request_json)?)?;
        let core = core()?;
        let id = RUNTIME.block_on(core.manager.enqueue(request));
        Ok(success_response(serde_json::json!({ "id": id })))
    });

    string_to_c_str(response)
}

/// Cancel a queued or active download
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_cancel_download(id: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let id = c_str_to_string(id)?;
        let core = core()?;
        let cancelled = RUNTIME.block_on(core.manager.cancel_download(&id));
        Ok(success_response(serde_json::json!({ "cancelled": cancelled })))
    });

    string_to_c_str(response)
}

/// Pause a direct download; segmented downloads report `paused: false`
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_pause_download(id: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let id = c_str_to_string(id)?;
        let core = core()?;
        let paused = RUNTIME.block_on(core.manager.pause_download(&id));
        Ok(success_response(serde_json::json!({ "paused": paused })))
    });

    string_to_c_str(response)
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_resume_download(id: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let id = c_str_to_string(id)?;
        let core = core()?;
        let resumed = RUNTIME.block_on(core.manager.resume_download(&id));
        Ok(success_response(serde_json::json!({ "resumed": resumed })))
    });

    string_to_c_str(response)
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_set_max_concurrent(max: u32) -> *mut c_char {
    let response = catch_panic(|| {
        let core = core()?;
        let applied = RUNTIME.block_on(async {
            core.manager.set_max_concurrent(max as usize).await;
            core.manager.max_concurrent().await
        });
        Ok(success_response(serde_json::json!({ "maxConcurrent": applied })))
    });

    string_to_c_str(response)
}

/// Snapshot of the queue
///
/// # Returns
/// ```json
/// {
///   "success": true,
///   "data": {
///     "queued": [ DownloadRequest, ... ],
///     "active": [{ "id": "...", "title": "...", "progress": 0.42, "paused": false, ... }],
///     "maxConcurrent": 3
///   }
/// }
/// ```
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_get_queue_state() -> *mut c_char {
    let response = catch_panic(|| {
        let core = core()?;
        let state = RUNTIME.block_on(async {
            serde_json::json!({
                "queued": core.manager.queued().await,
                "active": core.manager.active().await,
                "maxConcurrent": core.manager.max_concurrent().await,
            })
        });
        Ok(success_response(state))
    });

    string_to_c_str(response)
}

// ============================================================================
// LIBRARY
// ============================================================================

/// All downloaded assets
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_list_assets() -> *mut c_char {
    let response = catch_panic(|| {
        let core = core()?;
        let assets = RUNTIME.block_on(core.manager.store().assets());
        Ok(success_response(assets))
    });

    string_to_c_str(response)
}

/// Delete an asset with its video and subtitle files
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_delete_asset(id: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let id = c_str_to_string(id)?;
        let core = core()?;
        let deleted = RUNTIME.block_on(core.manager.delete_asset(&id))?;
        Ok(success_response(serde_json::json!({ "deleted": deleted })))
    });

    string_to_c_str(response)
}

/// Delete every asset
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_delete_all_assets() -> *mut c_char {
    let response = catch_panic(|| {
        let core = core()?;
        let removed = RUNTIME.block_on(core.manager.store().remove_all())?;
        Ok(success_response(serde_json::json!({ "removed": removed })))
    });

    string_to_c_str(response)
}

/// Re-check stored locations (after a container move, for example)
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_validate_assets() -> *mut c_char {
    let response = catch_panic(|| {
        let core = core()?;
        let report = RUNTIME.block_on(core.manager.store().validate_and_update_asset_locations())?;
        Ok(success_response(report))
    });

    string_to_c_str(response)
}

/// Total bytes used by the downloads directory
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_storage_size() -> *mut c_char {
    let response = catch_panic(|| {
        let core = core()?;
        let bytes = RUNTIME.block_on(core.manager.store().storage_size())?;
        Ok(success_response(serde_json::json!({ "bytes": bytes })))
    });

    string_to_c_str(response)
}

// ============================================================================
// STREAMING HELPERS
// ============================================================================

/// Parse quality variants from manifest text
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_parse_qualities(manifest: *const c_char, base_url: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let manifest = c_str_to_string(manifest)?;
        let base_url = c_str_to_string(base_url)?;
        Ok(success_response(crate::stream::parse_quality_variants(&manifest, &base_url)))
    });

    string_to_c_str(response)
}

/// Fetch a manifest and parse its variants; unreachable manifests give `[]`
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_fetch_qualities(url: *const c_char, headers_json: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let url = c_str_to_string(url)?;
        let headers = parse_headers(&c_str_to_string(headers_json)?)?;
        let core = core()?;
        let variants = RUNTIME.block_on(core.transport.fetch_qualities(&url, &headers));
        Ok(success_response(variants))
    });

    string_to_c_str(response)
}

/// Add the streaming defaults for `url` to a header object
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_ensure_headers(headers_json: *const c_char, url: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let headers = parse_headers(&c_str_to_string(headers_json)?)?;
        let url = c_str_to_string(url)?;
        Ok(success_response(crate::stream::ensure_streaming_headers(&headers, &url)))
    });

    string_to_c_str(response)
}

/// Pick the variant to play on `network` from the stored preferences
///
/// # Arguments
/// * `network` - `"wifi"` or `"cellular"`
/// * `variants_json` - array of `{ label, url, height }`
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_select_quality(network: *const c_char, variants_json: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let network = parse_network(&c_str_to_string(network)?)?;
        let variants: Vec<QualityVariant> = serde_json::from_str(&c_str_to_string(variants_json)?)?;
        let core = core()?;
        let prefs = RUNTIME.block_on(QualityPreferences::load(core.manager.store().database().pool()))?;
        Ok(success_response(prefs.select(network, &variants)))
    });

    string_to_c_str(response)
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_get_quality_preferences() -> *mut c_char {
    let response = catch_panic(|| {
        let core = core()?;
        let prefs = RUNTIME.block_on(QualityPreferences::load(core.manager.store().database().pool()))?;
        Ok(success_response(prefs))
    });

    string_to_c_str(response)
}

/// Store the preferred quality label for a network class
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_set_quality_preference(network: *const c_char, label: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let network = parse_network(&c_str_to_string(network)?)?;
        let label = c_str_to_string(label)?;
        let core = core()?;
        let prefs = RUNTIME.block_on(async {
            let pool = core.manager.store().database().pool();
            let mut prefs = QualityPreferences::load(pool).await?;
            prefs.set_preferred(network, label);
            prefs.save(pool).await?;
            Ok::<_, ShelfError>(prefs)
        })?;
        Ok(success_response(prefs))
    });

    string_to_c_str(response)
}

/// Remember the quality the player ended up with
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_record_last_quality(label: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let label = c_str_to_string(label)?;
        let core = core()?;
        RUNTIME.block_on(async {
            let pool = core.manager.store().database().pool();
            let mut prefs = QualityPreferences::load(pool).await?;
            prefs.record_last_used(pool, &label).await
        })?;
        Ok(success_response(serde_json::json!({ "lastUsed": label })))
    });

    string_to_c_str(response)
}

// ============================================================================
// MEMORY MANAGEMENT
// ============================================================================

/// Free a string previously returned by Rust
///
/// # Arguments
/// * `ptr` - Pointer to C string allocated by Rust
///
/// # Safety
/// This function MUST be called exactly once for each string returned by
/// any other Rust function. Calling it multiple times on the same pointer
/// will cause a double-free error. Not calling it at all will cause a memory leak.
#[no_mangle]
pub extern "C" fn rust_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            // Take ownership and drop the CString
            let _ = CString::from_raw(ptr);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn take(ptr: *mut c_char) -> serde_json::Value {
        let text = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        rust_free_string(ptr);
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_error_response() {
        let response = error_response("Test error");
        assert!(response.contains("\"success\":false"));
        assert!(response.contains("Test error"));
    }

    #[test]
    fn test_catch_panic_with_panic() {
        let result = catch_panic(|| -> Result<String> {
            panic!("test panic");
        });
        assert!(result.contains("\"success\":false"));
        assert!(result.contains("test panic"));
    }

    #[test]
    fn test_null_pointer_handling() {
        assert!(c_str_to_string(std::ptr::null()).is_err());
        let response = take(rust_cancel_download(std::ptr::null()));
        assert_eq!(response["success"], false);
    }

    #[test]
    fn test_parse_qualities_over_ffi() {
        let manifest = CString::new(
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1,RESOLUTION=1280x720\nhd.m3u8\n",
        )
        .unwrap();
        let base = CString::new("https://cdn.example.com/master.m3u8").unwrap();

        let response = take(rust_parse_qualities(manifest.as_ptr(), base.as_ptr()));
        assert_eq!(response["success"], true);
        assert_eq!(response["data"][0]["label"], "Auto");
        assert_eq!(response["data"][1]["url"], "https://cdn.example.com/hd.m3u8");
    }

    #[test]
    fn test_ensure_headers_over_ffi() {
        let headers = CString::new(r#"{"Referer":"https://site.example.org/"}"#).unwrap();
        let url = CString::new("https://cdn.example.com/v.mp4").unwrap();

        let response = take(rust_ensure_headers(headers.as_ptr(), url.as_ptr()));
        assert_eq!(response["data"]["Referer"], "https://site.example.org/");
        assert_eq!(response["data"]["Origin"], "https://cdn.example.com");
    }

    #[test]
    fn test_network_names() {
        assert_eq!(parse_network("WiFi").unwrap(), NetworkClass::Wifi);
        assert_eq!(parse_network("cellular").unwrap(), NetworkClass::Cellular);
        assert!(parse_network("ethernet").is_err());
    }

    #[test]
    fn test_empty_headers_json() {
        assert!(parse_headers("").unwrap().is_empty());
        assert!(parse_headers("[1]").is_err());
    }
}
