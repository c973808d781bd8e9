//! Candidate substrings and their extraction from the LCP table.

use std::cmp::Reverse;

use crate::charstring::Token;
use crate::suffix::SuffixIndex;

/// Parameters of the saving heuristic.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SavingParams {
    pub call_cost: i64,
    pub subr_overhead: i64,
}

impl SavingParams {
    /// Net byte reduction from emitting a body of `cost` bytes as a
    /// subroutine called `amt` times instead of copying it `amt` times.
    pub fn saving(&self, cost: i64, amt: i64) -> i64 {
        cost * amt - cost - self.call_cost * amt - self.subr_overhead
    }
}

/// A repeated substring of the corpus, tracked through the marketplace
/// and into a subroutine table (or inlined away).
///
/// Candidates live in an arena with stable indices; `encoding` entries
/// and subroutine tables refer to them by index only.
#[derive(Clone, Debug)]
pub(crate) struct Candidate {
    /// Token count of the substring.
    pub length: usize,
    /// Canonical occurrence: `(glyph index, start offset)`.
    pub location: (u32, u32),
    /// Occurrence count from extraction; overlapping occurrences are
    /// counted.
    pub freq: i64,
    /// Sum of per-token byte costs of the body.
    pub cost: i64,
    /// DP cost of the body when encoded against the current market.
    pub adjusted_cost: f64,
    /// Smoothed per-call price charged to callers.
    pub price: f64,
    /// Call sites selected in the latest round. May go negative via the
    /// prune redistribution heuristic.
    pub usages: i64,
    /// Chosen breakdown of the body: `(offset, candidate index)` pairs,
    /// ascending by offset.
    pub encoding: Vec<(usize, usize)>,
    /// Inline the body at call sites instead of emitting a subr.
    pub flatten: bool,
    /// Assigned to the global table rather than a local one.
    pub global: bool,
    /// Font dicts that transitively reach this candidate; empty means
    /// unreachable.
    pub fdidx: Vec<u16>,
    /// Final index within the assigned table.
    pub position: Option<i32>,
    /// Deepest call-chain position over the placed set, roots at 1.
    /// Zero means not yet visited.
    pub max_call_depth: u32,
    /// Emitted token form, filled in during assembly.
    pub program: Option<Vec<Token>>,
}

impl Candidate {
    pub fn new(length: usize, location: (u32, u32), freq: i64, cost: i64) -> Self {
        Candidate {
            length,
            location,
            freq,
            cost,
            adjusted_cost: 0.0,
            price: 0.0,
            usages: 0,
            encoding: Vec::new(),
            flatten: false,
            global: false,
            fdidx: Vec::new(),
            position: None,
            max_call_depth: 0,
            program: None,
        }
    }

    /// The substring's code sequence within the corpus.
    pub fn value<'a>(&self, data: &'a [Vec<u32>]) -> &'a [u32] {
        let (g, start) = self.location;
        &data[g as usize][start as usize..start as usize + self.length]
    }
}

/// Body cost with subroutine calls taken into account: each placed
/// callee trades its body for a call, while a flattened callee
/// contributes its own recursive cost.
pub(crate) fn real_cost(pool: &[Candidate], idx: usize, call_cost: i64) -> i64 {
    let candidate = &pool[idx];
    let mut cost = candidate.cost;
    for &(_, callee) in &candidate.encoding {
        if pool[callee].flatten {
            cost += real_cost(pool, callee, call_cost);
        } else {
            cost += call_cost - pool[callee].cost;
        }
    }
    cost
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ExtractParams {
    pub min_freq: i64,
    pub check_positive: bool,
    pub saving: SavingParams,
}

/// Walks the LCP table with a monotonic interval stack and emits a
/// candidate for every branching repeated substring, best savings
/// first.
///
/// Intervals still open when the sweep ends are not emitted, and
/// candidates need at least two tokens to ever be callable.
pub(crate) fn extract(
    data: &[Vec<u32>],
    cost_map: &[u32],
    index: &SuffixIndex,
    params: &ExtractParams,
) -> Vec<Candidate> {
    let mut stack: Vec<(u32, i64)> = Vec::new();
    let mut candidates = Vec::new();
    for (i, &h) in index.lcp.iter().enumerate() {
        while let Some(&(length, start)) = stack.last() {
            if length <= h {
                break;
            }
            stack.pop();
            let freq = i as i64 - start;
            if freq < params.min_freq || length < 2 {
                continue;
            }
            let location = index.suffixes[start as usize];
            let (g, s) = (location.0 as usize, location.1 as usize);
            let cost = data[g][s..s + length as usize]
                .iter()
                .map(|&code| cost_map[code as usize] as i64)
                .sum();
            if params.check_positive && params.saving.saving(cost, freq) <= 0 {
                continue;
            }
            candidates.push(Candidate::new(length as usize, location, freq, cost));
        }
        if stack.last().is_none_or(|&(length, _)| h > length) {
            stack.push((h, i as i64 - 1));
        }
    }
    candidates.sort_by_key(|c| Reverse(params.saving.saving(c.cost, c.freq)));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAVING: SavingParams = SavingParams {
        call_cost: 5,
        subr_overhead: 3,
    };

    fn extract_from(data: &[Vec<u32>], check_positive: bool) -> Vec<Candidate> {
        // unit-cost tokens
        let alphabet_size = data
            .iter()
            .flat_map(|program| program.iter())
            .max()
            .map_or(0, |&max| max as usize + 1);
        let cost_map = vec![1u32; alphabet_size];
        let index = SuffixIndex::build(data);
        extract(
            data,
            &cost_map,
            &index,
            &ExtractParams {
                min_freq: 2,
                check_positive,
                saving: SAVING,
            },
        )
    }

    #[test]
    fn saving_formula() {
        assert_eq!(SAVING.saving(3, 2), -10);
        assert_eq!(SAVING.saving(20, 2), 7);
        // break-even body: 13 bytes used twice saves nothing
        assert_eq!(SAVING.saving(13, 2), 0);
    }

    #[test]
    fn abcabc_is_a_no_op() {
        // the only repeats are [a b c] and [b c], both with negative
        // savings
        let data = vec![vec![0, 1, 2, 0, 1, 2]];
        assert!(extract_from(&data, true).is_empty());

        let unfiltered = extract_from(&data, false);
        let shapes: Vec<(usize, i64)> = unfiltered.iter().map(|c| (c.length, c.freq)).collect();
        assert_eq!(shapes, vec![(3, 2), (2, 2)]);
    }

    #[test]
    fn runs_of_one_token_are_a_no_op() {
        // the LCP never drops inside a single-token run, so no interval
        // closes; nothing is worth a subroutine here either way
        let data = vec![vec![7; 10], vec![7; 10]];
        assert!(extract_from(&data, true).is_empty());
    }

    #[test]
    fn shared_run_is_extracted() {
        let a: Vec<u32> = (0..20).collect();
        let data = vec![a.clone(), a];
        let candidates = extract_from(&data, true);
        // suffixes of the run that clear the saving threshold
        assert!(!candidates.is_empty());
        for candidate in &candidates {
            assert_eq!(candidate.freq, 2);
            assert!(SAVING.saving(candidate.cost, candidate.freq) > 0);
        }
        // best savings first: the longest suffix leads
        assert_eq!(candidates[0].length, 20);
        assert_eq!(candidates[0].cost, 20);
    }

    #[test]
    fn respects_min_freq() {
        let data = vec![vec![0, 1, 2, 0, 1, 2]];
        let cost_map = vec![1u32; 3];
        let index = SuffixIndex::build(&data);
        let candidates = extract(
            &data,
            &cost_map,
            &index,
            &ExtractParams {
                min_freq: 3,
                check_positive: false,
                saving: SAVING,
            },
        );
        assert!(candidates.is_empty());
    }

    #[test]
    fn real_cost_accounts_for_calls() {
        let mut pool = vec![
            Candidate::new(10, (0, 0), 2, 10),
            Candidate::new(4, (0, 6), 3, 4),
        ];
        pool[0].encoding = vec![(6, 1)];
        // callee placed: body tokens swapped for a call
        assert_eq!(real_cost(&pool, 0, 5), 10 - 4 + 5);
        // callee flattened: its own cost is charged on top
        pool[1].flatten = true;
        assert_eq!(real_cost(&pool, 0, 5), 10 + 4);
    }
}
