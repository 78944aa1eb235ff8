//! Picks the next uncovered basic block for CFG-guided mode to attack, and
//! tracks how many times each block has been retried so an unreachable
//! target eventually gets skipped instead of starving the rest of the run.

use std::collections::BTreeMap;

use crate::cfg::{BasicBlock, CfgIndex, CoverageMapping};

pub struct TargetSelector {
    max_retries: u32,
    retry_counts: BTreeMap<u32, u32>,
    exhausted: std::collections::BTreeSet<u32>,
}

impl TargetSelector {
    pub fn new(max_retries: u32) -> Self {
        TargetSelector {
            max_retries,
            retry_counts: BTreeMap::new(),
            exhausted: std::collections::BTreeSet::new(),
        }
    }

    /// Picks the uncovered block with the most uncovered immediate
    /// successors, breaking ties by `(file, first_line, block_id)`. Blocks
    /// that have exhausted their retry budget are skipped entirely.
    ///
    /// Returns `None` when every uncovered block is exhausted or covered —
    /// the CFG-guided loop's "no targets remain" termination condition.
    pub fn next_target<'a>(
        &self,
        cfg: &'a CfgIndex,
        mapping: &CoverageMapping,
    ) -> Option<&'a BasicBlock> {
        let mut best: Option<&BasicBlock> = None;
        let mut best_uncovered_succ = 0usize;

        for block in cfg.all_blocks() {
            if mapping.is_covered(block.id) || self.exhausted.contains(&block.id) {
                continue;
            }
            let uncovered_succ = block
                .succ
                .iter()
                .filter(|id| !mapping.is_covered(**id))
                .count();

            let better = match &best {
                None => true,
                Some(current) => {
                    uncovered_succ > best_uncovered_succ
                        || (uncovered_succ == best_uncovered_succ
                            && tie_break_key(block) < tie_break_key(current))
                }
            };
            if better {
                best = Some(block);
                best_uncovered_succ = uncovered_succ;
            }
        }
        best
    }

    /// Finds the best-known seed that covered one of `block`'s predecessor
    /// lines: the "closest approach" the LLM prompt is built around.
    /// `covered_by` maps a covered basic-block ID to the seed that first
    /// covered it (taken straight from the coverage mapping).
    pub fn closest_approach(
        &self,
        cfg: &CfgIndex,
        mapping: &CoverageMapping,
        block: &BasicBlock,
    ) -> Option<u64> {
        block
            .pred
            .iter()
            .filter_map(|pred_id| cfg.basic_block(*pred_id))
            .filter_map(|pred| mapping.blocks.get(&pred.id))
            .filter(|cov| cov.covered)
            .filter_map(|cov| cov.first_covered_by_seed_id)
            .next()
    }

    /// Records a failed attempt against `block_id`; once it has failed
    /// `max_retries` times it's excluded from future [`Self::next_target`]
    /// calls.
    pub fn record_failed_attempt(&mut self, block_id: u32) {
        let count = self.retry_counts.entry(block_id).or_insert(0);
        *count += 1;
        if *count >= self.max_retries {
            self.exhausted.insert(block_id);
        }
    }

    pub fn is_exhausted(&self, block_id: u32) -> bool {
        self.exhausted.contains(&block_id)
    }
}

fn tie_break_key(block: &BasicBlock) -> (String, u32, u32) {
    (block.file.clone(), block.first_line(), block.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{CfgDump, RawBasicBlock};

    fn index_with(blocks: Vec<(u32, &str, Vec<u32>, Vec<u32>)>) -> CfgIndex {
        let mut dump = CfgDump::new();
        dump.insert(
            "f".to_string(),
            blocks
                .into_iter()
                .map(|(id, file, lines, succ)| RawBasicBlock {
                    id,
                    file: file.to_string(),
                    lines,
                    succ,
                    pred: vec![],
                })
                .collect(),
        );
        CfgIndex::from_dump(dump, &["f".to_string()]).unwrap()
    }

    #[test]
    fn picks_block_with_most_uncovered_successors() {
        let index = index_with(vec![
            (1, "a.c", vec![1], vec![2, 3]),
            (2, "a.c", vec![2], vec![]),
            (3, "a.c", vec![3], vec![]),
            (4, "a.c", vec![4], vec![2]),
        ]);
        let mapping = CoverageMapping::default();
        let selector = TargetSelector::new(3);
        let target = selector.next_target(&index, &mapping).unwrap();
        assert_eq!(target.id, 1);
    }

    #[test]
    fn ties_break_by_file_then_line_then_id() {
        let index = index_with(vec![
            (5, "b.c", vec![20], vec![]),
            (4, "a.c", vec![10], vec![]),
            (6, "a.c", vec![5], vec![]),
        ]);
        let mapping = CoverageMapping::default();
        let selector = TargetSelector::new(3);
        let target = selector.next_target(&index, &mapping).unwrap();
        assert_eq!(target.id, 6);
    }

    #[test]
    fn covered_blocks_are_skipped() {
        let index = index_with(vec![(1, "a.c", vec![1], vec![])]);
        let mut mapping = CoverageMapping::default();
        mapping.mark_covered(1, 1);
        let selector = TargetSelector::new(3);
        assert!(selector.next_target(&index, &mapping).is_none());
    }

    #[test]
    fn exhausted_blocks_stop_being_selected() {
        let index = index_with(vec![(1, "a.c", vec![1], vec![])]);
        let mapping = CoverageMapping::default();
        let mut selector = TargetSelector::new(2);
        selector.record_failed_attempt(1);
        assert!(selector.next_target(&index, &mapping).is_some());
        selector.record_failed_attempt(1);
        assert!(selector.is_exhausted(1));
        assert!(selector.next_target(&index, &mapping).is_none());
    }
}
