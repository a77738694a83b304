use std::collections::HashSet;

use crate::core::scoring::CompatibilityScorer;
use crate::error::MatchingError;
use crate::models::{Allocation, GroupSizePolicy, Participant, ProposedGroup};

/// Pairwise compatibility graph over a pool, indexed by paid order
///
/// `None` marks an excluded pair that may never share a group.
#[derive(Debug, Clone)]
pub struct CompatibilityMatrix {
    size: usize,
    scores: Vec<Option<f64>>,
}

impl CompatibilityMatrix {
    pub fn build(pool: &[Participant], scorer: &CompatibilityScorer) -> Result<Self, MatchingError> {
        for participant in pool {
            scorer.validate(participant)?;
        }

        let size = pool.len();
        let mut scores = vec![None; size * size];
        for i in 0..size {
            for j in (i + 1)..size {
                let score = if scorer.is_excluded(&pool[i], &pool[j]) {
                    None
                } else {
                    Some(scorer.unchecked_score(&pool[i], &pool[j]))
                };
                scores[i * size + j] = score;
                scores[j * size + i] = score;
            }
        }

        Ok(Self { size, scores })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn score(&self, i: usize, j: usize) -> Option<f64> {
        self.scores[i * self.size + j]
    }

    #[inline]
    pub fn compatible(&self, i: usize, j: usize) -> bool {
        i != j && self.score(i, j).is_some()
    }

    /// Mean pairwise score of a set of members
    pub fn mean_score(&self, members: &[usize]) -> f64 {
        let mut total = 0.0;
        let mut pairs = 0usize;
        for (pos, &a) in members.iter().enumerate() {
            for &b in &members[pos + 1..] {
                total += self.score(a, b).unwrap_or(0.0);
                pairs += 1;
            }
        }
        if pairs == 0 {
            0.0
        } else {
            total / pairs as f64
        }
    }
}

/// Deterministic greedy grouping of an eligible pool
///
/// # Pipeline Stages
/// 1. Full pairwise compatibility graph
/// 2. Seed each group with the best unassigned compatible pair
/// 3. Grow the seed with the candidate of highest average compatibility
/// 4. Merge leftovers where they hurt the group score least, else mark them unassignable
/// 5. Renumber groups by their earliest payer
#[derive(Debug, Clone, Copy)]
pub struct GroupAllocator {
    policy: GroupSizePolicy,
}

impl GroupAllocator {
    pub fn new(policy: GroupSizePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GroupSizePolicy {
        &self.policy
    }

    /// Partition `pool` (in paid order) into groups within the size policy
    ///
    /// Every participant ends up in exactly one group or in `unassignable`.
    /// No group is ever formed below `min_size` or above `max_size`.
    pub fn allocate(
        &self,
        pool: &[Participant],
        scorer: &CompatibilityScorer,
    ) -> Result<Allocation, MatchingError> {
        self.policy.validate()?;

        if pool.is_empty() {
            return Ok(Allocation::default());
        }

        let matrix = CompatibilityMatrix::build(pool, scorer)?;
        let mut state = AllocationState::new(pool.len());

        // Stages 2 & 3: follow the size plan first
        for size in plan_group_sizes(pool.len(), &self.policy) {
            if let Some(members) = state.form_group(&matrix, size, self.policy.min_size) {
                state.commit_group(members);
            }
        }

        // Exclusions can leave enough people for another valid group
        while state.remaining() >= self.policy.min_size {
            match state.form_group(&matrix, self.policy.target_size, self.policy.min_size) {
                Some(members) => state.commit_group(members),
                None => break,
            }
        }

        // Stage 4: remainder handling
        let mut unassignable = Vec::new();
        for idx in state.unassigned() {
            match state.best_merge_target(&matrix, idx, self.policy.max_size) {
                Some(group_idx) => state.merge_into(group_idx, idx),
                None => unassignable.push(idx),
            }
        }

        // Stage 5: stable numbering by earliest member in paid order
        let mut groups = state.groups;
        for members in &mut groups {
            members.sort_unstable();
        }
        groups.sort_by_key(|members| members[0]);

        let groups = groups
            .iter()
            .enumerate()
            .map(|(pos, members)| ProposedGroup {
                group_number: pos as u32 + 1,
                member_ids: members.iter().map(|&i| pool[i].user_id.clone()).collect(),
                aggregate_score: matrix.mean_score(members),
            })
            .collect();

        unassignable.sort_unstable();
        let unassignable = unassignable
            .into_iter()
            .map(|i| pool[i].user_id.clone())
            .collect();

        Ok(Allocation {
            groups,
            unassignable,
        })
    }
}

impl Default for GroupAllocator {
    fn default() -> Self {
        Self::new(GroupSizePolicy::default())
    }
}

/// Planned group sizes for a pool of `n`
///
/// Picks the group count closest to `n / target` for which every group can
/// stay within bounds, spreading members evenly. When no count fits, groups
/// are filled at `max_size` and the rest is left for remainder handling.
pub fn plan_group_sizes(n: usize, policy: &GroupSizePolicy) -> Vec<usize> {
    if n < policy.min_size {
        return Vec::new();
    }

    let ideal = n as f64 / policy.target_size as f64;
    let best = (1..=n / policy.min_size)
        .filter(|&k| k * policy.min_size <= n && n <= k * policy.max_size)
        .min_by(|&a, &b| {
            let da = (a as f64 - ideal).abs();
            let db = (b as f64 - ideal).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });

    match best {
        Some(k) => {
            let base = n / k;
            let extra = n % k;
            (0..k).map(|i| if i < extra { base + 1 } else { base }).collect()
        }
        None => vec![policy.max_size; n / policy.max_size],
    }
}

/// Working state of a single allocation pass
struct AllocationState {
    assigned: Vec<bool>,
    rejected_seeds: HashSet<(usize, usize)>,
    groups: Vec<Vec<usize>>,
}

impl AllocationState {
    fn new(size: usize) -> Self {
        Self {
            assigned: vec![false; size],
            rejected_seeds: HashSet::new(),
            groups: Vec::new(),
        }
    }

    fn remaining(&self) -> usize {
        self.assigned.iter().filter(|a| !**a).count()
    }

    fn unassigned(&self) -> Vec<usize> {
        (0..self.assigned.len()).filter(|&i| !self.assigned[i]).collect()
    }

    fn commit_group(&mut self, members: Vec<usize>) {
        for &m in &members {
            self.assigned[m] = true;
        }
        self.groups.push(members);
    }

    /// Seed and grow one group; seeds that cannot reach `min_size` are dissolved and skipped
    fn form_group(&mut self, matrix: &CompatibilityMatrix, size: usize, min_size: usize) -> Option<Vec<usize>> {
        loop {
            let (a, b) = self.best_seed(matrix)?;
            let mut members = vec![a, b];

            while members.len() < size {
                match self.best_candidate(matrix, &members) {
                    Some(c) => members.push(c),
                    None => break,
                }
            }

            if members.len() >= min_size {
                return Some(members);
            }

            self.rejected_seeds.insert((a, b));
        }
    }

    /// Highest-scoring compatible unassigned pair; ties go to the earliest payers
    fn best_seed(&self, matrix: &CompatibilityMatrix) -> Option<(usize, usize)> {
        let mut best: Option<((usize, usize), f64)> = None;
        for i in 0..matrix.len() {
            if self.assigned[i] {
                continue;
            }
            for j in (i + 1)..matrix.len() {
                if self.assigned[j] || self.rejected_seeds.contains(&(i, j)) {
                    continue;
                }
                let Some(score) = matrix.score(i, j) else {
                    continue;
                };
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some(((i, j), score));
                }
            }
        }
        best.map(|(pair, _)| pair)
    }

    /// Unassigned participant with the highest average compatibility to `members`
    fn best_candidate(&self, matrix: &CompatibilityMatrix, members: &[usize]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for c in 0..matrix.len() {
            if self.assigned[c] || members.contains(&c) {
                continue;
            }
            if !members.iter().all(|&m| matrix.compatible(c, m)) {
                continue;
            }
            let avg = members
                .iter()
                .map(|&m| matrix.score(c, m).unwrap_or(0.0))
                .sum::<f64>()
                / members.len() as f64;
            if best.map_or(true, |(_, s)| avg > s) {
                best = Some((c, avg));
            }
        }
        best.map(|(c, _)| c)
    }

    /// Group whose mean score drops least (or rises most) when `idx` joins
    fn best_merge_target(&self, matrix: &CompatibilityMatrix, idx: usize, max_size: usize) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (group_idx, members) in self.groups.iter().enumerate() {
            if members.len() >= max_size {
                continue;
            }
            if !members.iter().all(|&m| matrix.compatible(idx, m)) {
                continue;
            }

            let before = matrix.mean_score(members);
            let mut merged = members.clone();
            merged.push(idx);
            let impact = matrix.mean_score(&merged) - before;

            if best.map_or(true, |(_, s)| impact > s) {
                best = Some((group_idx, impact));
            }
        }
        best.map(|(group_idx, _)| group_idx)
    }

    fn merge_into(&mut self, group_idx: usize, idx: usize) {
        self.assigned[idx] = true;
        self.groups[group_idx].push(idx);
    }
}
