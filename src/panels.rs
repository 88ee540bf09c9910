use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::canonical::panel_hash;
use crate::market_calendar::ist_rfc3339;

pub const PANEL_SCHEMA_VERSION: &str = "panel-envelope-v1";
pub const PANEL_SOURCE: &str = "g6";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PanelMeta {
    pub source: String,
    pub schema: String,
    pub hash: String,
}

/// On-disk / on-wire panel envelope. `meta.hash` covers canonicalized
/// `data` only; the timestamps never feed the hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelEnvelope {
    pub panel: String,
    pub version: String,
    pub generated_at: String,
    pub updated_at: String,
    pub meta: PanelMeta,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct PanelWriteOutcome {
    pub changed: bool,
    pub hash: String,
}

struct PanelState {
    envelope: PanelEnvelope,
}

/// Writes envelope-wrapped panel JSON files atomically (temp + rename) and
/// memoizes the last hash per panel so unchanged data skips the disk.
pub struct PanelWriter {
    dir: PathBuf,
    nest_depth: usize,
    legacy_compat: bool,
    panels: Mutex<HashMap<String, PanelState>>,
}

impl PanelWriter {
    pub fn new(dir: &Path, nest_depth: usize, legacy_compat: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating panels dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            nest_depth,
            legacy_compat,
            panels: Mutex::new(HashMap::new()),
        })
    }

    /// Hash `data`, and when it differs from the last write, persist the
    /// refreshed envelope. `updated_at` moves only on change.
    pub fn write_panel(&self, name: &str, data: Value) -> Result<PanelWriteOutcome> {
        let hash = panel_hash(&data, self.nest_depth);
        let now = ist_rfc3339(Utc::now());

        let envelope = {
            let mut panels = self.panels.lock();
            match panels.entry(name.to_string()) {
                std::collections::hash_map::Entry::Occupied(mut occupied) => {
                    let state = occupied.get_mut();
                    if state.envelope.meta.hash == hash {
                        debug!("panel {} unchanged (hash {})", name, hash);
                        return Ok(PanelWriteOutcome {
                            changed: false,
                            hash,
                        });
                    }
                    state.envelope.updated_at = now;
                    state.envelope.meta.hash = hash.clone();
                    state.envelope.data = data;
                    state.envelope.clone()
                }
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    let envelope = PanelEnvelope {
                        panel: name.to_string(),
                        version: PANEL_SCHEMA_VERSION.to_string(),
                        generated_at: now.clone(),
                        updated_at: now,
                        meta: PanelMeta {
                            source: PANEL_SOURCE.to_string(),
                            schema: PANEL_SCHEMA_VERSION.to_string(),
                            hash: hash.clone(),
                        },
                        data,
                    };
                    vacant.insert(PanelState {
                        envelope: envelope.clone(),
                    });
                    envelope
                }
            }
        };

        self.persist(&envelope)?;
        Ok(PanelWriteOutcome {
            changed: true,
            hash,
        })
    }

    fn persist(&self, envelope: &PanelEnvelope) -> Result<()> {
        let final_path = self.dir.join(format!("{}_enveloped.json", envelope.panel));
        let tmp_path = self.dir.join(format!(".{}.tmp", envelope.panel));
        let bytes = serde_json::to_vec_pretty(envelope)?;
        std::fs::write(&tmp_path, &bytes)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("renaming into {}", final_path.display()))?;

        if self.legacy_compat {
            let legacy = self.dir.join(format!("{}.json", envelope.panel));
            let legacy_tmp = self.dir.join(format!(".{}.legacy.tmp", envelope.panel));
            if let Err(e) = serde_json::to_vec_pretty(&envelope.data)
                .map_err(anyhow::Error::from)
                .and_then(|b| std::fs::write(&legacy_tmp, b).map_err(Into::into))
                .and_then(|_| std::fs::rename(&legacy_tmp, &legacy).map_err(Into::into))
            {
                warn!("legacy dual-write failed for {}: {}", envelope.panel, e);
            }
        }
        Ok(())
    }

    /// All current envelopes, for resync and full snapshots.
    pub fn envelopes(&self) -> BTreeMap<String, PanelEnvelope> {
        self.panels
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.envelope.clone()))
            .collect()
    }

    /// Current per-panel hash directory.
    pub fn hashes(&self) -> BTreeMap<String, String> {
        self.panels
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.envelope.meta.hash.clone()))
            .collect()
    }

    pub fn read_panel(dir: &Path, name: &str) -> Result<PanelEnvelope> {
        let path = dir.join(format!("{name}_enveloped.json"));
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(serde_json::from_str(&raw)?)
    }
}
