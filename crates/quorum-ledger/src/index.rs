use std::collections::HashMap;
use std::path::{Path, PathBuf};

use quorum_types::{ClusterRecord, ClusterState, ClusterSummary};

use crate::error::LedgerResult;
use crate::lock::StateLock;

const INDEX_FILE: &str = "clusters.json";
const INDEX_LOCK: &str = "clusters";

/// The cluster table at `<state_dir>/clusters.json`. Every mutation is a
/// read-modify-write under the state-dir lock.
#[derive(Clone)]
pub struct ClusterIndex {
    state_dir: PathBuf,
}

impl ClusterIndex {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn index_path(&self) -> PathBuf {
        self.state_dir.join(INDEX_FILE)
    }

    fn read_all(&self) -> LedgerResult<HashMap<String, ClusterRecord>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_all(&self, records: &HashMap<String, ClusterRecord>) -> LedgerResult<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        let raw = serde_json::to_string_pretty(records)?;
        std::fs::write(self.index_path(), raw)?;
        Ok(())
    }

    pub fn get(&self, cluster_id: &str) -> LedgerResult<Option<ClusterRecord>> {
        let _lock = StateLock::acquire(&self.state_dir, INDEX_LOCK)?;
        Ok(self.read_all()?.remove(cluster_id))
    }

    pub fn upsert(&self, record: &ClusterRecord) -> LedgerResult<()> {
        let _lock = StateLock::acquire(&self.state_dir, INDEX_LOCK)?;
        let mut records = self.read_all()?;
        records.insert(record.id.clone(), record.clone());
        self.write_all(&records)
    }

    pub fn set_state(&self, cluster_id: &str, state: ClusterState) -> LedgerResult<()> {
        let _lock = StateLock::acquire(&self.state_dir, INDEX_LOCK)?;
        let mut records = self.read_all()?;
        if let Some(record) = records.get_mut(cluster_id) {
            record.state = state;
            self.write_all(&records)?;
        }
        Ok(())
    }

    pub fn remove(&self, cluster_id: &str) -> LedgerResult<Option<ClusterRecord>> {
        let _lock = StateLock::acquire(&self.state_dir, INDEX_LOCK)?;
        let mut records = self.read_all()?;
        let removed = records.remove(cluster_id);
        if removed.is_some() {
            self.write_all(&records)?;
        }
        Ok(removed)
    }

    /// Cluster summaries, newest first.
    pub fn list(&self) -> LedgerResult<Vec<ClusterSummary>> {
        let _lock = StateLock::acquire(&self.state_dir, INDEX_LOCK)?;
        let records = self.read_all()?;
        let mut out: Vec<ClusterSummary> = records.values().map(ClusterSummary::from).collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }
}
