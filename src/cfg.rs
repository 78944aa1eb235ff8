//! Parses an already-structured CFG dump for the configured target
//! functions and exposes the basic-block index the target selector and
//! CFG-guided engine loop drive off of.
//!
//! Building basic blocks out of raw compiler IR is someone else's job —
//! this module only reads the JSON shape the dump producer already emits.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct RawBasicBlock {
    pub id: u32,
    pub file: String,
    pub lines: Vec<u32>,
    #[serde(default)]
    pub succ: Vec<u32>,
    #[serde(default)]
    pub pred: Vec<u32>,
}

/// `{function_name: [basic_block, ...]}`.
pub type CfgDump = BTreeMap<String, Vec<RawBasicBlock>>;

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: u32,
    pub function: String,
    pub file: String,
    pub lines: Vec<u32>,
    pub succ: Vec<u32>,
    pub pred: Vec<u32>,
}

impl BasicBlock {
    pub fn first_line(&self) -> u32 {
        self.lines.iter().copied().min().unwrap_or(0)
    }
}

/// Immutable once built: a mapping from target-function name to its basic
/// blocks, plus a flat index by block ID for successor/predecessor lookups.
pub struct CfgIndex {
    by_function: BTreeMap<String, Vec<u32>>,
    by_id: BTreeMap<u32, BasicBlock>,
    total_target_lines: u64,
}

impl CfgIndex {
    /// Parses `cfg_file_path`, keeping only the functions named in
    /// `target_functions`.
    pub fn load(cfg_file_path: &Path, target_functions: &[String]) -> Result<Self> {
        let data = fs::read_to_string(cfg_file_path)?;
        let dump: CfgDump = serde_json::from_str(&data)?;
        Self::from_dump(dump, target_functions)
    }

    pub fn from_dump(dump: CfgDump, target_functions: &[String]) -> Result<Self> {
        let wanted: BTreeSet<&str> = target_functions.iter().map(String::as_str).collect();
        let mut by_function = BTreeMap::new();
        let mut by_id = BTreeMap::new();
        let mut all_lines: BTreeSet<(String, u32)> = BTreeSet::new();

        for (function, blocks) in dump {
            if !wanted.contains(function.as_str()) {
                continue;
            }
            let mut ids = Vec::with_capacity(blocks.len());
            for raw in blocks {
                for &line in &raw.lines {
                    all_lines.insert((raw.file.clone(), line));
                }
                ids.push(raw.id);
                by_id.insert(
                    raw.id,
                    BasicBlock {
                        id: raw.id,
                        function: function.clone(),
                        file: raw.file,
                        lines: raw.lines,
                        succ: raw.succ,
                        pred: raw.pred,
                    },
                );
            }
            by_function.insert(function, ids);
        }

        Ok(CfgIndex {
            by_function,
            by_id,
            total_target_lines: all_lines.len() as u64,
        })
    }

    pub fn total_target_lines(&self) -> u64 {
        self.total_target_lines
    }

    /// Counts target lines covered according to `mapping`: a block's lines
    /// only count once its `covered` flag is set, so partially-executed
    /// blocks that the coverage tool saw hits in but the mapping hasn't
    /// caught up to yet don't inflate this figure.
    pub fn covered_target_lines(&self, mapping: &CoverageMapping) -> u64 {
        let mut covered: BTreeSet<(String, u32)> = BTreeSet::new();
        for block in self.by_id.values() {
            if mapping.is_covered(block.id) {
                for &line in &block.lines {
                    covered.insert((block.file.clone(), line));
                }
            }
        }
        covered.len() as u64
    }

    pub fn basic_blocks_for(&self, function: &str) -> Vec<&BasicBlock> {
        self.by_function
            .get(function)
            .map(|ids| ids.iter().filter_map(|id| self.by_id.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn basic_block(&self, id: u32) -> Option<&BasicBlock> {
        self.by_id.get(&id)
    }

    pub fn all_blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.by_id.values()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockCoverage {
    pub covered: bool,
    pub first_covered_by_seed_id: Option<u64>,
}

/// `{basic_block_id -> {covered, first_covered_by_seed_id}}`, persisted at
/// `state/coverage_mapping.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageMapping {
    pub blocks: BTreeMap<u32, BlockCoverage>,
}

impl CoverageMapping {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(CoverageMapping::default());
        }
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(self)?;
        {
            use std::io::Write;
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(&data)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn is_covered(&self, block_id: u32) -> bool {
        self.blocks.get(&block_id).is_some_and(|b| b.covered)
    }

    /// Marks a block covered if it wasn't already. Returns whether this call
    /// was the one that first covered it.
    pub fn mark_covered(&mut self, block_id: u32, seed_id: u64) -> bool {
        let entry = self.blocks.entry(block_id).or_default();
        if entry.covered {
            return false;
        }
        entry.covered = true;
        entry.first_covered_by_seed_id = Some(seed_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dump() -> CfgDump {
        let mut dump = CfgDump::new();
        dump.insert(
            "parse_expr".to_string(),
            vec![
                RawBasicBlock {
                    id: 1,
                    file: "parser.c".to_string(),
                    lines: vec![10, 11],
                    succ: vec![2, 3],
                    pred: vec![],
                },
                RawBasicBlock {
                    id: 2,
                    file: "parser.c".to_string(),
                    lines: vec![12],
                    succ: vec![],
                    pred: vec![1],
                },
            ],
        );
        dump.insert(
            "unused_fn".to_string(),
            vec![RawBasicBlock {
                id: 99,
                file: "other.c".to_string(),
                lines: vec![1],
                succ: vec![],
                pred: vec![],
            }],
        );
        dump
    }

    #[test]
    fn only_target_functions_are_kept() {
        let index =
            CfgIndex::from_dump(sample_dump(), &["parse_expr".to_string()]).unwrap();
        assert!(index.basic_block(99).is_none());
        assert_eq!(index.basic_blocks_for("parse_expr").len(), 2);
        assert_eq!(index.total_target_lines(), 3);
    }

    #[test]
    fn covered_target_lines_respects_mapping() {
        let index =
            CfgIndex::from_dump(sample_dump(), &["parse_expr".to_string()]).unwrap();
        let mut mapping = CoverageMapping::default();
        assert_eq!(index.covered_target_lines(&mapping), 0);
        mapping.mark_covered(1, 7);
        assert_eq!(index.covered_target_lines(&mapping), 2);
    }

    #[test]
    fn mark_covered_is_idempotent_and_keeps_first_seed() {
        let mut mapping = CoverageMapping::default();
        assert!(mapping.mark_covered(1, 7));
        assert!(!mapping.mark_covered(1, 8));
        assert_eq!(mapping.blocks[&1].first_covered_by_seed_id, Some(7));
    }

    #[test]
    fn mapping_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state/coverage_mapping.json");
        let mut mapping = CoverageMapping::default();
        mapping.mark_covered(5, 1);
        mapping.save(&path).unwrap();
        let loaded = CoverageMapping::load(&path).unwrap();
        assert!(loaded.is_covered(5));
    }
}
