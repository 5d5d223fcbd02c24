//! Flasher stub blobs
//!
//! The stub is a small, position-specific RAM program uploaded to the
//! target before flashing. It raises throughput and unlocks the stub-only
//! commands (ERASE_FLASH, CHANGE_BAUDRATE). Blobs are published as JSON
//! objects with base64-encoded `text`/`data` sections; we fetch them
//! through a caller-supplied [StubFetcher] and cache them process-wide,
//! one write per chip name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::debug;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Where the prebuilt stub JSON files live unless the caller overrides it.
pub const DEFAULT_STUB_BASE_URL: &str =
    "https://raw.githubusercontent.com/espressif/esptool/master/esptool/targets/stub_flasher";

/// The retrieval capability; the HTTP client itself stays outside the core.
pub trait StubFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Serialized form, as published.
#[derive(Debug, Deserialize)]
struct StubBlobJson {
    entry: u32,
    text: String,
    text_start: u32,
    data: String,
    data_start: u32,
}

/// Decoded RAM image of the flasher stub for one chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashStub {
    pub entry: u32,
    pub text: Vec<u8>,
    pub text_start: u32,
    pub data: Vec<u8>,
    pub data_start: u32,
}

impl FlashStub {
    /// Parse a stub blob out of its JSON encoding.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let raw: StubBlobJson = serde_json::from_slice(bytes)
            .map_err(|e| Error::EspStubFailed(format!("malformed stub blob: {e}")))?;
        let text = BASE64
            .decode(&raw.text)
            .map_err(|e| Error::EspStubFailed(format!("bad stub text encoding: {e}")))?;
        let data = BASE64
            .decode(&raw.data)
            .map_err(|e| Error::EspStubFailed(format!("bad stub data encoding: {e}")))?;
        Ok(FlashStub {
            entry: raw.entry,
            text,
            text_start: raw.text_start,
            data,
            data_start: raw.data_start,
        })
    }
}

/// Normalize a chip name to its blob key: "ESP32-S2" → "esp32s2".
pub fn stub_name(chip_name: &str) -> String {
    chip_name.to_ascii_lowercase().replace('-', "")
}

fn cache() -> &'static Mutex<HashMap<String, Arc<FlashStub>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<FlashStub>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fetch the stub for `chip_name`, consulting the process-wide cache first.
///
/// Tries `<base>/<name>.json` and falls back to
/// `<base>/stub_flasher_<name>.json`, the two layouts in the wild.
pub fn fetch_stub(
    chip_name: &str,
    base_url: &str,
    fetcher: &dyn StubFetcher,
) -> Result<Arc<FlashStub>> {
    let name = stub_name(chip_name);
    if let Some(stub) = cache().lock().unwrap().get(&name) {
        debug!("stub for {name} served from cache");
        return Ok(Arc::clone(stub));
    }

    let base = base_url.trim_end_matches('/');
    let primary = format!("{base}/{name}.json");
    let bytes = match fetcher.fetch(&primary) {
        Ok(bytes) => bytes,
        Err(primary_err) => {
            let fallback = format!("{base}/stub_flasher_{name}.json");
            debug!("stub fetch fell back to {fallback} after: {primary_err}");
            fetcher.fetch(&fallback)?
        }
    };

    let stub = Arc::new(FlashStub::from_json(&bytes)?);
    cache()
        .lock()
        .unwrap()
        .entry(name)
        .or_insert_with(|| Arc::clone(&stub));
    Ok(stub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CannedFetcher {
        payload: Vec<u8>,
        fail_primary: bool,
        calls: AtomicUsize,
    }

    impl StubFetcher for CannedFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_primary && !url.contains("stub_flasher_") {
                return Err(Error::EspStubFailed("404".into()));
            }
            Ok(self.payload.clone())
        }
    }

    fn sample_blob() -> Vec<u8> {
        // text = [0x01, 0x02, 0x03], data = [0xAA, 0xBB]
        br#"{
            "entry": 1074521560,
            "text": "AQID",
            "text_start": 1074520064,
            "data": "qrs=",
            "data_start": 1073605544
        }"#
        .to_vec()
    }

    #[test]
    fn stub_names_normalize() {
        assert_eq!(stub_name("ESP32-S2"), "esp32s2");
        assert_eq!(stub_name("ESP8266"), "esp8266");
    }

    #[test]
    fn blob_json_round_trips_base64_sections() {
        let stub = FlashStub::from_json(&sample_blob()).unwrap();
        assert_eq!(stub.entry, 1_074_521_560);
        assert_eq!(stub.text, vec![0x01, 0x02, 0x03]);
        assert_eq!(stub.data, vec![0xAA, 0xBB]);
        assert_eq!(stub.text_start, 1_074_520_064);
    }

    #[test]
    fn malformed_blob_is_a_stub_failure() {
        let err = FlashStub::from_json(b"{\"entry\": 1}").unwrap_err();
        assert!(matches!(err, Error::EspStubFailed(_)));
    }

    #[test]
    fn fetch_uses_the_cache_after_the_first_hit() {
        let fetcher = CannedFetcher {
            payload: sample_blob(),
            fail_primary: false,
            calls: AtomicUsize::new(0),
        };
        // A name no other test uses, since the cache is process-wide.
        let first = fetch_stub("TEST-CACHE-CHIP", "http://stubs.local", &fetcher).unwrap();
        let second = fetch_stub("test-cachechip", "http://stubs.local", &fetcher).unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fetch_falls_back_to_the_prefixed_layout() {
        let fetcher = CannedFetcher {
            payload: sample_blob(),
            fail_primary: true,
            calls: AtomicUsize::new(0),
        };
        fetch_stub("TEST-FALLBACK-CHIP", "http://stubs.local/", &fetcher).unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
