//! The on-disk `peers.json` document: serialization, structural
//! validation, and atomic writes.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::address::AddressType;
use crate::error::{Error, Result};

/// File name of the persisted reservoir, relative to the data directory.
pub(crate) const PEERS_FILENAME: &str = "peers.json";

/// The only supported document version. Anything else is discarded.
pub(crate) const SERIALIZATION_VERSION: u32 = 2;

/// Serialized form of one reservoir record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SerializedKnownAddress {
    pub key: String,
    pub addr_type: AddressType,
    pub timestamp: u64,
    pub services: u64,
    pub src_key: String,
    pub src_addr_type: AddressType,
    pub src_services: u64,
    pub last_attempt: u64,
    pub last_success: u64,
    pub attempts: u32,
    pub tried: bool,
    pub ref_count: u32,
    pub bucket_refs: Vec<usize>,
}

/// Serialized form of the whole reservoir. The bucket arrays are the
/// authoritative layout; `ref_count` and `bucket_refs` are written for
/// inspection and cross-checked on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SerializedAddressBook {
    pub version: u32,
    #[serde(default)]
    pub key: String,
    pub addresses: Vec<SerializedKnownAddress>,
    pub new_buckets: Vec<Vec<String>>,
    pub tried_buckets: Vec<Vec<String>>,
}

impl SerializedAddressBook {
    /// Reads the document from `path`. `Ok(None)` when no file exists;
    /// parse failures come back as [`Error::PersistenceCorrupt`].
    pub(crate) fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let doc: SerializedAddressBook =
            serde_json::from_reader(reader).map_err(|e| Error::PersistenceCorrupt {
                reason: e.to_string(),
            })?;
        Ok(Some(doc))
    }

    /// Structural integrity checks against the expected bucket geometry.
    pub(crate) fn validate(&self, new_bucket_count: usize, tried_bucket_count: usize) -> Result<()> {
        if self.version != SERIALIZATION_VERSION {
            return corrupt(format!("unsupported version {}", self.version));
        }
        if self.new_buckets.len() != new_bucket_count {
            return corrupt(format!(
                "expected {new_bucket_count} new buckets, found {}",
                self.new_buckets.len()
            ));
        }
        if self.tried_buckets.len() != tried_bucket_count {
            return corrupt(format!(
                "expected {tried_bucket_count} tried buckets, found {}",
                self.tried_buckets.len()
            ));
        }

        let by_key: HashMap<&str, &SerializedKnownAddress> = self
            .addresses
            .iter()
            .map(|sa| (sa.key.as_str(), sa))
            .collect();
        if by_key.len() != self.addresses.len() {
            return corrupt("duplicate address key".to_string());
        }

        let mut new_refs: HashMap<&str, Vec<usize>> = HashMap::new();
        for (bucket, keys) in self.new_buckets.iter().enumerate() {
            for key in keys {
                let Some(sa) = by_key.get(key.as_str()) else {
                    return corrupt(format!("new bucket {bucket} references unknown {key}"));
                };
                if sa.tried {
                    return corrupt(format!("tried address {key} found in new bucket {bucket}"));
                }
                let refs = new_refs.entry(key.as_str()).or_default();
                if refs.contains(&bucket) {
                    return corrupt(format!("{key} appears twice in new bucket {bucket}"));
                }
                refs.push(bucket);
            }
        }

        let mut tried_seen: HashMap<&str, usize> = HashMap::new();
        for (bucket, keys) in self.tried_buckets.iter().enumerate() {
            for key in keys {
                let Some(sa) = by_key.get(key.as_str()) else {
                    return corrupt(format!("tried bucket {bucket} references unknown {key}"));
                };
                if !sa.tried {
                    return corrupt(format!("new address {key} found in tried bucket {bucket}"));
                }
                *tried_seen.entry(key.as_str()).or_insert(0) += 1;
            }
        }

        for sa in &self.addresses {
            if sa.tried {
                if sa.ref_count != 0 {
                    return corrupt(format!("tried address {} has ref count {}", sa.key, sa.ref_count));
                }
                if tried_seen.get(sa.key.as_str()).copied().unwrap_or(0) != 1 {
                    return corrupt(format!(
                        "tried address {} must appear in exactly one tried slot",
                        sa.key
                    ));
                }
            } else {
                let mut refs = new_refs.remove(sa.key.as_str()).unwrap_or_default();
                if refs.len() != sa.ref_count as usize || refs.is_empty() {
                    return corrupt(format!(
                        "{} has ref count {} but {} bucket references",
                        sa.key,
                        sa.ref_count,
                        refs.len()
                    ));
                }
                refs.sort_unstable();
                let mut recorded = sa.bucket_refs.clone();
                recorded.sort_unstable();
                if refs != recorded {
                    return corrupt(format!("{} bucket references disagree with layout", sa.key));
                }
            }
        }

        Ok(())
    }

    /// Writes the document to `path` via a temp file and rename so that a
    /// crash never leaves a partial file behind.
    pub(crate) fn write_atomic(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("json.tmp");
        {
            let file = File::create(&tmp_path)?;
            let writer = BufWriter::new(file);
            serde_json::to_writer_pretty(writer, self).map_err(|e| Error::PersistenceCorrupt {
                reason: e.to_string(),
            })?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

fn corrupt(reason: String) -> Result<()> {
    Err(Error::PersistenceCorrupt { reason })
}
