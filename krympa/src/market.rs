//! The iterative marketplace that decides which substrings become
//! subroutines.
//!
//! Each round prices every candidate, re-encodes every candidate body
//! and every glyph program against those prices with a dynamic program,
//! recounts who actually got called, and prunes candidates that no
//! longer pay for themselves.

use fnv::FnvHashMap;

use crate::candidates::{Candidate, SavingParams};
use crate::parallel;

/// Immutable per-round snapshot shared with workers: candidate value to
/// `(arena index, current price)`.
pub(crate) type SubstringTable<'a> = FnvHashMap<&'a [u32], (usize, f64)>;

#[derive(Clone, Copy, Debug)]
pub(crate) struct MarketConfig {
    pub nrounds: usize,
    pub alpha: f64,
    pub k: f64,
    pub saving: SavingParams,
    pub test_mode: bool,
    pub single_process: bool,
    pub chunk_ratio: f64,
}

/// What the market settles on: the candidate arena (stable indices),
/// the indices still active, and each glyph's chosen encoding.
pub(crate) struct MarketOutcome {
    pub pool: Vec<Candidate>,
    pub active: Vec<usize>,
    pub glyph_encodings: Vec<Vec<(usize, usize)>>,
}

pub(crate) fn run(
    data: &[Vec<u32>],
    cost_map: &[u32],
    mut pool: Vec<Candidate>,
    config: &MarketConfig,
) -> MarketOutcome {
    let mut active: Vec<usize> = (0..pool.len()).collect();
    let mut table = SubstringTable::default();
    let mut glyph_encodings: Vec<Vec<(usize, usize)>> = vec![Vec::new(); data.len()];

    for &idx in &active {
        let candidate = &mut pool[idx];
        candidate.adjusted_cost = candidate.cost as f64;
        candidate.price = candidate.adjusted_cost;
        candidate.usages = candidate.freq;
    }

    for round in 0..config.nrounds {
        // Calibrate prices toward each candidate's marginal cost.
        for &idx in &active {
            let candidate = &mut pool[idx];
            let marginal = candidate.adjusted_cost / (candidate.usages as f64 + config.k);
            candidate.price = marginal * config.alpha + candidate.price * (1.0 - config.alpha);
            table.insert(candidate.value(data), (idx, candidate.price));
        }

        // Re-encode each candidate body in terms of the others. A
        // candidate may not select itself.
        let bodies: Vec<(usize, &[u32])> =
            active.iter().map(|&idx| (idx, pool[idx].value(data))).collect();
        let chunk = parallel::chunk_len(bodies.len(), config.chunk_ratio);
        let encoded = parallel::map(&bodies, chunk, config.single_process, |&(idx, value)| {
            optimize_charstring(value, cost_map, &table, Some(idx))
        });
        for (&(idx, _), encoded) in bodies.iter().zip(encoded) {
            let candidate = &mut pool[idx];
            candidate.adjusted_cost = encoded.market_cost;
            candidate.encoding = encoded.encoding;
        }

        // Re-encode every glyph program against the current market.
        let chunk = parallel::chunk_len(data.len(), config.chunk_ratio);
        glyph_encodings = parallel::map(data, chunk, config.single_process, |program| {
            optimize_charstring(program, cost_map, &table, None)
        })
        .into_iter()
        .map(|encoded| encoded.encoding)
        .collect();

        // Recount who got called this round.
        let mut called: Vec<usize> = Vec::new();
        for &idx in &active {
            called.extend(pool[idx].encoding.iter().map(|&(_, callee)| callee));
        }
        for encoding in &glyph_encodings {
            called.extend(encoding.iter().map(|&(_, callee)| callee));
        }
        for &idx in &active {
            pool[idx].usages = 0;
        }
        for callee in called {
            pool[callee].usages += 1;
        }

        if log::log_enabled!(log::Level::Trace) && !active.is_empty() {
            let total: i64 = active.iter().map(|&idx| pool[idx].usages).sum();
            let max = active.iter().map(|&idx| pool[idx].usages).max().unwrap_or(0);
            let used = active.iter().filter(|&&idx| pool[idx].usages > 0).count();
            log::trace!(
                "round {}: {} candidates, avg usage {:.2}, max {max}, used {used}",
                round + 1,
                active.len(),
                total as f64 / active.len() as f64,
            );
        }

        // Prune candidates that no longer pay for themselves; the final
        // round keeps everything so the last encodings stay valid.
        if round + 1 < config.nrounds && !config.test_mode {
            let (keep, bad): (Vec<usize>, Vec<usize>) = active
                .iter()
                .copied()
                .partition(|&idx| config.saving.saving(pool[idx].cost, pool[idx].usages) > 0);
            for &idx in &bad {
                // Hand a pruned candidate's traffic to its callees so
                // the market keeps favoring them.
                let usages = pool[idx].usages;
                let callees: Vec<usize> =
                    pool[idx].encoding.iter().map(|&(_, callee)| callee).collect();
                for callee in callees {
                    pool[callee].usages += usages - 1;
                }
                table.remove(pool[idx].value(data));
            }
            log::trace!("round {}: pruned {} candidates", round + 1, bad.len());
            active = keep;
        }
    }

    MarketOutcome {
        pool,
        active,
        glyph_encodings,
    }
}

/// Result of re-encoding one code sequence against the market.
pub(crate) struct Encoded {
    pub encoding: Vec<(usize, usize)>,
    pub market_cost: f64,
}

/// Finds the cheapest encoding of `charstring` as a mix of literal runs
/// and calls into the substring table.
///
/// Right-to-left dynamic program: `results[i]` is the cheapest cost of
/// the tail `charstring[i..]`, choosing for every split point either
/// the literal token run or a priced call when the span is in the
/// table. Ties go to the shortest span considered first. `skip_idx`
/// forbids one table entry so a candidate cannot select itself.
pub(crate) fn optimize_charstring(
    charstring: &[u32],
    cost_map: &[u32],
    table: &SubstringTable,
    skip_idx: Option<usize>,
) -> Encoded {
    let n = charstring.len();
    let mut results = vec![0.0f64; n + 1];
    let mut next_idx = vec![0usize; n];
    let mut next_sub: Vec<Option<usize>> = vec![None; n];

    for i in (0..n).rev() {
        let mut best = f64::INFINITY;
        let mut best_j = n;
        let mut best_sub = None;
        let mut literal_cost = 0.0;
        for j in i + 1..=n {
            literal_cost += cost_map[charstring[j - 1] as usize] as f64;
            let mut option = literal_cost + results[j];
            let mut sub = None;
            if let Some(&(idx, price)) = table.get(&charstring[i..j]) {
                if skip_idx != Some(idx) {
                    option = price + results[j];
                    sub = Some(idx);
                }
            }
            if option < best {
                best = option;
                best_j = j;
                best_sub = sub;
            }
        }
        results[i] = best;
        next_idx[i] = best_j;
        next_sub[i] = best_sub;
    }

    let mut encoding = Vec::new();
    let mut pos = 0;
    while pos < n {
        if let Some(idx) = next_sub[pos] {
            encoding.push((pos, idx));
        }
        pos = next_idx[pos];
    }
    Encoded {
        encoding,
        market_cost: results[0],
    }
}
