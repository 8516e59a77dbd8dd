//! In-memory object store and scratch directories for engine tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chunkpush_upload_models::{MultipartSession, UploadedPart};

use crate::store::{ObjectStore, StoreError};

/// How a scripted part upload misbehaves.
#[derive(Debug, Clone, Copy)]
pub enum FailureMode {
    /// Every attempt fails transiently.
    AlwaysTransient,
    /// The first `n` attempts fail transiently, later ones succeed.
    TransientTimes(u32),
    /// Every attempt fails permanently.
    Permanent,
}

#[derive(Default)]
struct OpenUpload {
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    open: HashMap<String, OpenUpload>,
    objects: HashMap<String, Vec<u8>>,
    aborted: BTreeSet<String>,
    abort_calls: usize,
    attempts: HashMap<u32, u32>,
    initiated: Vec<String>,
}

/// Scriptable [`ObjectStore`] that keeps everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    failures: HashMap<u32, FailureMode>,
    delay: Duration,
    unreachable: bool,
    fail_initiate: bool,
    fail_initiate_keys: BTreeSet<String>,
    fail_complete: bool,
    hidden_parts: BTreeSet<u32>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn transient(operation: &'static str) -> StoreError {
    StoreError::Transient {
        operation,
        source: "simulated connection reset".into(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_part(mut self, part_number: u32, mode: FailureMode) -> Self {
        self.failures.insert(part_number, mode);
        self
    }

    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub const fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub const fn failing_initiate(mut self) -> Self {
        self.fail_initiate = true;
        self
    }

    /// Refuses to open a session for `key` only.
    pub fn failing_initiate_for(mut self, key: &str) -> Self {
        self.fail_initiate_keys.insert(key.to_string());
        self
    }

    pub const fn failing_complete(mut self) -> Self {
        self.fail_complete = true;
        self
    }

    /// Omits `part_number` from `list_parts` even when it was stored.
    pub fn hide_part(mut self, part_number: u32) -> Self {
        self.hidden_parts.insert(part_number);
        self
    }

    pub fn attempts(&self, part_number: u32) -> u32 {
        let state = self.state.lock().unwrap();
        state.attempts.get(&part_number).copied().unwrap_or(0)
    }

    pub fn part_bytes(&self, session: &MultipartSession, part_number: u32) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .open
            .get(&session.upload_id)
            .and_then(|u| u.parts.get(&part_number).cloned())
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn is_aborted(&self, session: &MultipartSession) -> bool {
        self.state.lock().unwrap().aborted.contains(&session.upload_id)
    }

    pub fn aborted_count(&self) -> usize {
        self.state.lock().unwrap().aborted.len()
    }

    pub fn abort_calls(&self) -> usize {
        self.state.lock().unwrap().abort_calls
    }

    /// Keys of the sessions opened so far, in order.
    pub fn initiated_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().initiated.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().open.len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn open_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        if self.unreachable {
            return Err(StoreError::NoSuchBucket {
                bucket: bucket.to_string(),
            });
        }
        Ok(())
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<MultipartSession, StoreError> {
        if self.fail_initiate {
            return Err(transient("CreateMultipartUpload"));
        }
        if self.fail_initiate_keys.contains(key) {
            return Err(StoreError::Permanent {
                operation: "CreateMultipartUpload",
                source: "simulated access denied".into(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.initiated.push(key.to_string());
        state.next_id += 1;
        let upload_id = format!("upload-{}", state.next_id);
        state.open.insert(
            upload_id.clone(),
            OpenUpload {
                key: key.to_string(),
                ..OpenUpload::default()
            },
        );
        Ok(MultipartSession {
            upload_id,
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<UploadedPart, StoreError> {
        let attempt = {
            let mut state = self.state.lock().unwrap();
            let attempts = state.attempts.entry(part_number).or_insert(0);
            *attempts += 1;
            *attempts
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.failures.get(&part_number) {
            Some(FailureMode::AlwaysTransient) => return Err(transient("UploadPart")),
            Some(FailureMode::TransientTimes(n)) if attempt <= *n => {
                return Err(transient("UploadPart"));
            }
            Some(FailureMode::Permanent) => {
                return Err(StoreError::Permanent {
                    operation: "UploadPart",
                    source: "simulated access denied".into(),
                });
            }
            _ => {}
        }

        let mut state = self.state.lock().unwrap();
        let upload = state
            .open
            .get_mut(&session.upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload {
                upload_id: session.upload_id.clone(),
            })?;
        upload.parts.insert(part_number, body);
        Ok(UploadedPart {
            part_number,
            e_tag: Some(format!("\"etag-{part_number}\"")),
        })
    }

    async fn list_parts(&self, session: &MultipartSession) -> Result<BTreeSet<u32>, StoreError> {
        let state = self.state.lock().unwrap();
        let upload = state
            .open
            .get(&session.upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload {
                upload_id: session.upload_id.clone(),
            })?;
        Ok(upload
            .parts
            .keys()
            .copied()
            .filter(|n| !self.hidden_parts.contains(n))
            .collect())
    }

    async fn complete_multipart(
        &self,
        session: &MultipartSession,
        parts: &[UploadedPart],
    ) -> Result<(), StoreError> {
        if self.fail_complete {
            return Err(StoreError::Permanent {
                operation: "CompleteMultipartUpload",
                source: "simulated invalid part".into(),
            });
        }
        let mut state = self.state.lock().unwrap();
        let upload = state
            .open
            .remove(&session.upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload {
                upload_id: session.upload_id.clone(),
            })?;
        let mut object = Vec::new();
        for part in parts {
            let bytes = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| StoreError::Permanent {
                    operation: "CompleteMultipartUpload",
                    source: format!("part {} was never uploaded", part.part_number).into(),
                })?;
            object.extend_from_slice(bytes);
        }
        state.objects.insert(upload.key, object);
        Ok(())
    }

    async fn abort_multipart(&self, session: &MultipartSession) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.abort_calls += 1;
        state.open.remove(&session.upload_id);
        state.aborted.insert(session.upload_id.clone());
        Ok(())
    }
}

/// Scratch directory under the system temp dir, removed on drop.
pub struct TestDir {
    path: PathBuf,
}

impl TestDir {
    pub fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "chunkpush_upload_{name}_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, file_name: &str, contents: &[u8]) -> PathBuf {
        let path = self.path.join(file_name);
        std::fs::write(&path, contents).unwrap();
        path
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Deterministic test payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
}
