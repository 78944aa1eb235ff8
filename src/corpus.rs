//! Durable seed pool plus the global-state document that survives restarts.
//!
//! One mutex covers both the in-memory queue/processed split and the
//! on-disk writes each operation performs, mirroring how the rest of this
//! codebase treats a stateful store: a single lock around "update memory,
//! then persist" keeps the two from ever disagreeing.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{FuzzError, Result};
use crate::oracle::OracleVerdict;
use crate::seed::{Seed, SeedState};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pool_size: u64,
    pub processed_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalState {
    pub last_allocated_id: u64,
    pub current_fuzzing_id: u64,
    pub total_coverage: u32,
    pub queue_stats: QueueStats,
}

impl GlobalState {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(GlobalState::default());
        }
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| FuzzError::GlobalStateWrite(e.to_string()))?;
        {
            use std::io::Write;
            let mut f = fs::File::create(&tmp_path).map_err(|e| FuzzError::GlobalStateWrite(e.to_string()))?;
            f.write_all(&data).map_err(|e| FuzzError::GlobalStateWrite(e.to_string()))?;
            f.sync_all().map_err(|e| FuzzError::GlobalStateWrite(e.to_string()))?;
        }
        fs::rename(&tmp_path, path).map_err(|e| FuzzError::GlobalStateWrite(e.to_string()))?;
        Ok(())
    }
}

struct Paths {
    root: PathBuf,
}

impl Paths {
    fn corpus_dir(&self) -> PathBuf {
        self.root.join("corpus")
    }
    fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }
    fn global_state_path(&self) -> PathBuf {
        self.root.join("state/global_state.json")
    }
    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }
    pub fn total_report_path(&self) -> PathBuf {
        self.root.join("state/total.json")
    }
    pub fn coverage_mapping_path(&self) -> PathBuf {
        self.root.join("state/coverage_mapping.json")
    }
}

struct Inner {
    queue: VecDeque<Seed>,
    processed: BTreeMap<u64, Seed>,
    global: GlobalState,
}

/// The seed pool plus global-state document, rooted at
/// `{output_root}/{isa}/{strategy}/`.
pub struct CorpusManager {
    paths: Paths,
    inner: Mutex<Inner>,
}

impl CorpusManager {
    pub fn new(root: PathBuf) -> Self {
        CorpusManager {
            paths: Paths { root },
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                processed: BTreeMap::new(),
                global: GlobalState::default(),
            }),
        }
    }

    pub fn build_dir(&self) -> PathBuf {
        self.paths.build_dir()
    }
    pub fn total_report_path(&self) -> PathBuf {
        self.paths.total_report_path()
    }
    pub fn coverage_mapping_path(&self) -> PathBuf {
        self.paths.coverage_mapping_path()
    }

    /// Creates the directory layout and loads (or default-initializes)
    /// global state. Call once at startup before [`Self::recover`].
    pub fn initialize(&self) -> Result<()> {
        for dir in [
            self.paths.corpus_dir(),
            self.paths.metadata_dir(),
            self.paths.root.join("state"),
            self.paths.build_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| FuzzError::CorpusWrite(e.to_string()))?;
        }
        let global = GlobalState::load(&self.paths.global_state_path())?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.global = global;
        Ok(())
    }

    /// Enumerates `corpus/`, rehydrates every seed, and splits them into the
    /// pending queue (sorted by ID ascending) and the processed map.
    pub fn recover(&self) -> Result<()> {
        let corpus_dir = self.paths.corpus_dir();
        if !corpus_dir.exists() {
            return Ok(());
        }
        let mut entries: Vec<_> = fs::read_dir(&corpus_dir)
            .map_err(|e| FuzzError::CorpusWrite(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().is_dir())
            .collect();
        entries.sort_by_key(|e| e.path());

        let mut queue = VecDeque::new();
        let mut processed = BTreeMap::new();
        for entry in entries {
            let dir = entry.path();
            let metadata_path = dir.join("metadata.json");
            if !metadata_path.exists() {
                log::warn!("skipping corpus dir with no metadata: {}", dir.display());
                continue;
            }
            let metadata = fs::read_to_string(&metadata_path)
                .map_err(|e| FuzzError::CorpusWrite(e.to_string()))?;
            let mut seed: Seed = serde_json::from_str(&metadata)?;
            let source_path = dir.join("source.c");
            seed.content = fs::read_to_string(&source_path).unwrap_or_default();
            seed.path = Some(dir.clone());
            log::debug!("recovered seed {} state={:?}", seed.id, seed.state);

            if seed.state == SeedState::Pending {
                queue.push_back(seed);
            } else {
                processed.insert(seed.id, seed);
            }
        }
        queue.make_contiguous().sort_by_key(|s| s.id);

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.global.queue_stats.pool_size = (queue.len() + processed.len()) as u64;
        inner.queue = queue;
        inner.processed = processed;
        Ok(())
    }

    /// Returns `++last_allocated_id`. Not persisted by itself — the caller
    /// is expected to use the ID immediately in an [`Self::add`] call, whose
    /// write is what makes the allocation durable.
    pub fn allocate_id(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.global.last_allocated_id += 1;
        inner.global.last_allocated_id
    }

    /// Assigns an ID if `seed.id == 0`, marks it pending, writes its
    /// directory atomically, and appends it to the queue.
    pub fn add(&self, mut seed: Seed) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if seed.id == 0 {
            inner.global.last_allocated_id += 1;
            seed.id = inner.global.last_allocated_id;
        }
        seed.state = SeedState::Pending;

        self.write_seed_dir(&seed)?;
        let id = seed.id;
        inner.queue.push_back(seed);
        inner.global.queue_stats.pool_size = (inner.queue.len() + inner.processed.len()) as u64;
        self.save_global(&inner.global)?;
        log::debug!("added seed {id} to queue");
        Ok(id)
    }

    /// Pops the front of the queue, records it as the seed currently being
    /// fuzzed, and moves it into the processed map so [`Self::report_result`]
    /// has somewhere to write back into. Returns `ok = false` when the queue
    /// is empty.
    pub fn next(&self) -> Result<(Option<Seed>, bool)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(seed) = inner.queue.pop_front() else {
            return Ok((None, false));
        };
        inner.global.current_fuzzing_id = seed.id;
        inner.processed.insert(seed.id, seed.clone());
        self.save_global(&inner.global)?;
        Ok((Some(seed), true))
    }

    /// Writes back the oracle verdict and coverage delta for a seed already
    /// in the processed map, renaming its corpus directory to reflect the
    /// new delta and bumping the accumulated total-coverage figure in
    /// global state if it grew.
    pub fn report_result(
        &self,
        id: u64,
        state: SeedState,
        old_coverage_bp: u32,
        new_coverage_bp: u32,
        verdict: Option<OracleVerdict>,
        exec_time_micros: Option<u64>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let old_delta = inner
            .processed
            .get(&id)
            .map(|s| s.coverage_delta_bp)
            .unwrap_or(0);

        {
            let seed = inner
                .processed
                .get_mut(&id)
                .ok_or_else(|| FuzzError::IllegalState(format!("no such processed seed {id}")))?;
            seed.state = state;
            seed.set_coverage(old_coverage_bp, new_coverage_bp);
            seed.exec_time_micros = exec_time_micros;
            if let Some(v) = verdict {
                seed.verdict = Some(v.verdict);
                seed.bug_kind = v.bug_kind;
                seed.description = v.description;
            }
        }

        let new_delta = inner.processed[&id].coverage_delta_bp;
        if new_delta != old_delta {
            self.rename_seed_dir(&mut inner.processed, id, old_delta)?;
        }
        let seed = inner.processed[&id].clone();
        self.write_metadata(&seed)?;

        if new_coverage_bp > inner.global.total_coverage {
            inner.global.total_coverage = new_coverage_bp;
        }
        inner.global.queue_stats.processed_count += 1;
        self.save_global(&inner.global)?;
        Ok(())
    }

    /// Zeroes `current_fuzzing_id` and `pool_size` and persists, the
    /// clean-shutdown marker every engine termination path must reach.
    pub fn finalize(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.global.current_fuzzing_id = 0;
        inner.global.queue_stats.pool_size = 0;
        self.save_global(&inner.global)
    }

    pub fn get(&self, id: u64) -> Option<Seed> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .processed
            .get(&id)
            .cloned()
            .or_else(|| inner.queue.iter().find(|s| s.id == id).cloned())
    }

    pub fn global_state(&self) -> GlobalState {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .global
            .clone()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).queue.len()
    }

    fn save_global(&self, global: &GlobalState) -> Result<()> {
        global.save(&self.paths.global_state_path())
    }

    fn write_seed_dir(&self, seed: &Seed) -> Result<()> {
        let dir = self.paths.corpus_dir().join(seed.dir_name());
        fs::create_dir_all(&dir).map_err(|e| FuzzError::CorpusWrite(e.to_string()))?;
        let tmp_source = dir.join("source.c.tmp");
        fs::write(&tmp_source, &seed.content).map_err(|e| FuzzError::CorpusWrite(e.to_string()))?;
        fs::rename(&tmp_source, dir.join("source.c"))
            .map_err(|e| FuzzError::CorpusWrite(e.to_string()))?;
        self.write_metadata(seed)
    }

    fn write_metadata(&self, seed: &Seed) -> Result<()> {
        let dir = self.paths.corpus_dir().join(seed.dir_name());
        fs::create_dir_all(&dir).map_err(|e| FuzzError::CorpusWrite(e.to_string()))?;
        let data = serde_json::to_vec_pretty(seed).map_err(|e| FuzzError::CorpusWrite(e.to_string()))?;
        let tmp = dir.join("metadata.json.tmp");
        fs::write(&tmp, &data).map_err(|e| FuzzError::CorpusWrite(e.to_string()))?;
        fs::rename(&tmp, dir.join("metadata.json"))
            .map_err(|e| FuzzError::CorpusWrite(e.to_string()))?;

        let flat = self.paths.metadata_dir().join(format!("id-{:06}.json", seed.id));
        fs::write(&flat, &data).map_err(|e| FuzzError::CorpusWrite(e.to_string()))?;
        Ok(())
    }

    fn rename_seed_dir(
        &self,
        processed: &mut BTreeMap<u64, Seed>,
        id: u64,
        old_delta: u32,
    ) -> Result<()> {
        let seed = &processed[&id];
        let old_name = format!("id-{:06}-cov-{:05}", id, old_delta);
        let old_dir = self.paths.corpus_dir().join(old_name);
        let new_dir = self.paths.corpus_dir().join(seed.dir_name());
        if old_dir.exists() && old_dir != new_dir {
            fs::rename(&old_dir, &new_dir).map_err(|e| FuzzError::CorpusWrite(e.to_string()))?;
        }
        processed.get_mut(&id).unwrap().path = Some(new_dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::{Seed, Verdict};

    fn manager(tmp: &Path) -> CorpusManager {
        let mgr = CorpusManager::new(tmp.to_path_buf());
        mgr.initialize().unwrap();
        mgr
    }

    #[test]
    fn allocate_id_is_monotone() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        assert_eq!(mgr.allocate_id(), 1);
        assert_eq!(mgr.allocate_id(), 2);
        assert_eq!(mgr.allocate_id(), 3);
    }

    #[test]
    fn add_then_next_is_fifo() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        mgr.add(Seed::new("a".to_string(), vec![], 0, 0)).unwrap();
        mgr.add(Seed::new("b".to_string(), vec![], 0, 0)).unwrap();

        let (first, ok) = mgr.next().unwrap();
        assert!(ok);
        assert_eq!(first.unwrap().content, "a");
        let (second, ok) = mgr.next().unwrap();
        assert!(ok);
        assert_eq!(second.unwrap().content, "b");

        let (none, ok) = mgr.next().unwrap();
        assert!(!ok);
        assert!(none.is_none());
    }

    #[test]
    fn report_result_updates_coverage_and_renames_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        let id = mgr.add(Seed::new("x".to_string(), vec![], 0, 0)).unwrap();
        mgr.next().unwrap();

        mgr.report_result(
            id,
            SeedState::Processed,
            0,
            2500,
            Some(OracleVerdict {
                verdict: Verdict::Pass,
                bug_kind: None,
                description: None,
            }),
            Some(1234),
        )
        .unwrap();

        let seed = mgr.get(id).unwrap();
        assert_eq!(seed.coverage_delta_bp, 2500);
        assert_eq!(seed.verdict, Some(Verdict::Pass));
        assert!(tmp
            .path()
            .join(format!("corpus/id-{:06}-cov-02500", id))
            .exists());
        assert_eq!(mgr.global_state().total_coverage, 2500);
    }

    #[test]
    fn recover_splits_pending_and_processed_and_preserves_order() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mgr = manager(tmp.path());
            let a = mgr.add(Seed::new("a".to_string(), vec![], 0, 0)).unwrap();
            mgr.add(Seed::new("b".to_string(), vec![], 0, 0)).unwrap();
            mgr.next().unwrap(); // pulls "a" into processed
            mgr.report_result(a, SeedState::Processed, 0, 100, None, Some(1))
                .unwrap();
        }

        let mgr2 = CorpusManager::new(tmp.path().to_path_buf());
        mgr2.initialize().unwrap();
        mgr2.recover().unwrap();
        assert_eq!(mgr2.queue_len(), 1);
        let (next, ok) = mgr2.next().unwrap();
        assert!(ok);
        assert_eq!(next.unwrap().content, "b");
    }

    #[test]
    fn finalize_zeroes_current_fuzzing_id() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        mgr.add(Seed::new("a".to_string(), vec![], 0, 0)).unwrap();
        mgr.next().unwrap();
        assert_ne!(mgr.global_state().current_fuzzing_id, 0);
        mgr.finalize().unwrap();
        assert_eq!(mgr.global_state().current_fuzzing_id, 0);
    }
}
