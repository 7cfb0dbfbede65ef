//! Task value object and the reserved parameter names shared by every
//! process on a bucket.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::settings::MAX_PRIORITY;

/// Reserved parameter names. These are wire-visible: they appear verbatim in
/// persisted rows, so they must stay stable across versions and processes.
pub const PARAM_TYPE: &[u8] = b"type";
pub const PARAM_ADD_TASK: &[u8] = b"_add_task";
pub const PARAM_DONE: &[u8] = b"done";
pub const PARAM_PRIORITY: &[u8] = b"priority";
pub const PARAM_FUTURE: &[u8] = b"future";
pub const PARAM_BLOCK_ID: &[u8] = b"blockid";
pub const PARAM_VERSION: &[u8] = b"version";
pub const PARAM_VALID_KEY: &[u8] = b"_validkey";
pub const PARAM_VALID_VALUE: &[u8] = b"_validvalue";

/// A fresh 128-bit id as 32 lowercase hex bytes, the uid form used for task
/// uids, future uids, block ids, and callback ids.
pub(crate) fn random_uid() -> Vec<u8> {
    Uuid::new_v4().simple().to_string().into_bytes()
}

/// Sorts after every hex uid; probing `last_less_or_equal` of this inside a
/// subspace finds its largest uid key.
pub(crate) const MAX_UID_SENTINEL: [u8; 33] = [0xFF; 33];

/// A durable unit of work: a uid plus an opaque byte-string parameter map.
///
/// The default task has an empty parameter map; constructors only write
/// params for non-default arguments so empty tasks stay empty.
#[derive(Debug, Clone, Default)]
pub struct Task {
    /// Unique id, generated at enqueue (or claim-side decode).
    pub uid: Vec<u8>,
    /// Lease deadline as a store version. Only meaningful after a claim.
    pub timeout_version: i64,
    /// Parameter rows. Values are opaque bytes; numeric parameters use
    /// little-endian encodings, never language-native layouts.
    pub params: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Task {
    pub fn new(task_type: &[u8], version: u32, done: &[u8], priority: i64) -> Self {
        let mut task = Task::default();
        if !task_type.is_empty() {
            task.params.insert(PARAM_TYPE.to_vec(), task_type.to_vec());
        }
        if version > 0 {
            task.params
                .insert(PARAM_VERSION.to_vec(), version.to_le_bytes().to_vec());
        }
        if !done.is_empty() {
            task.params.insert(PARAM_DONE.to_vec(), done.to_vec());
        }
        let priority = priority.min(MAX_PRIORITY);
        if priority != 0 {
            task.params
                .insert(PARAM_PRIORITY.to_vec(), priority.to_le_bytes().to_vec());
        }
        task
    }

    /// The task's type name, when present.
    pub fn task_type(&self) -> Option<&[u8]> {
        self.params.get(PARAM_TYPE).map(Vec::as_slice)
    }

    /// Priority decoded from params, clamped to `[0, MAX_PRIORITY]`.
    /// Missing or malformed reads as 0.
    pub fn priority(&self) -> i64 {
        let raw = match self.params.get(PARAM_PRIORITY) {
            Some(raw) => raw,
            None => return 0,
        };
        let mut buf = [0u8; 8];
        let n = raw.len().min(8);
        buf[..n].copy_from_slice(&raw[..n]);
        i64::from_le_bytes(buf).clamp(0, MAX_PRIORITY)
    }

    /// Schema version decoded from params; 0 when absent.
    pub fn version(&self) -> u32 {
        match self.params.get(PARAM_VERSION) {
            Some(raw) if raw.len() >= 4 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&raw[..4]);
                u32::from_le_bytes(buf)
            }
            _ => {
                tracing::warn!("task has no version parameter");
                0
            }
        }
    }

    /// Stamp a validation witness: the task is valid only while
    /// `validation_key` still holds `validation_value`.
    pub fn set_validation(&mut self, validation_key: &[u8], validation_value: &[u8]) {
        self.params
            .insert(PARAM_VALID_KEY.to_vec(), validation_key.to_vec());
        self.params
            .insert(PARAM_VALID_VALUE.to_vec(), validation_value.to_vec());
    }

    /// True if this task carries a validation witness key.
    pub fn has_validation(&self) -> bool {
        self.params.contains_key(PARAM_VALID_KEY)
    }
}
