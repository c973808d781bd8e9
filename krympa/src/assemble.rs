//! Assignment of surviving candidates into subroutine tables and final
//! program emission.

use std::iter;

use crate::candidates::{real_cost, Candidate, SavingParams};
use crate::charstring::{expand_hintmasks, Alphabet, Op, Token};
use crate::market::MarketOutcome;
use crate::SubrError;

#[derive(Clone, Copy, Debug)]
pub(crate) struct AssembleConfig {
    pub fdlen: usize,
    pub nsubrs_limit: usize,
    pub nest_limit: u32,
    pub saving: SavingParams,
}

/// Final rewritten programs, in expanded token form.
pub(crate) struct Assembled {
    pub glyph_programs: Vec<Vec<Token>>,
    pub gsubrs: Vec<Vec<Token>>,
    pub lsubrs: Vec<Vec<Vec<Token>>>,
}

/// Computes the operand bias for a subr table of `count` entries.
///
/// See <https://learn.microsoft.com/en-us/typography/opentype/spec/cff2#9-local-and-global-subr-indexes>
pub(crate) fn subr_bias(count: usize) -> i32 {
    if count < 1240 {
        107
    } else if count < 33900 {
        1131
    } else {
        32768
    }
}

/// Turns the market's survivors into global and per-fd local subroutine
/// tables and emits every rewritten program.
pub(crate) fn process_subrs(
    outcome: &mut MarketOutcome,
    glyph_fds: &[u16],
    alphabet: &Alphabet,
    data: &[Vec<u32>],
    config: &AssembleConfig,
) -> Result<Assembled, SubrError> {
    let pool = &mut outcome.pool;
    let call_cost = config.saving.call_cost;

    // Which font dicts can transitively reach each candidate.
    for (encoding, &sel) in outcome.glyph_encodings.iter().zip(glyph_fds) {
        for &(_, callee) in encoding {
            mark_reachable(pool, callee, sel);
        }
    }

    // Candidates that pay for themselves with their realized call
    // counts become subrs; the rest are inlined at their call sites.
    // All keep decisions are made before any flatten flag is set, so
    // the call-aware cost sees the same world for every candidate.
    let (mut subrs, bad): (Vec<usize>, Vec<usize>) =
        outcome.active.iter().copied().partition(|&idx| {
            let candidate = &pool[idx];
            candidate.usages > 0
                && !candidate.fdidx.is_empty()
                && config
                    .saving
                    .saving(real_cost(pool, idx, call_cost), candidate.usages)
                    > 0
        });
    for &idx in &bad {
        pool[idx].flatten = true;
    }
    log::debug!(
        "{} of {} candidates kept after the usage filter",
        subrs.len(),
        outcome.active.len(),
    );

    // Assign survivors to tables while space remains, best saving
    // first.
    subrs.sort_by_key(|&idx| {
        config
            .saving
            .saving(real_cost(pool, idx, call_cost), pool[idx].usages)
    });
    let limit = config.nsubrs_limit;
    let mut gsubrs: Vec<usize> = Vec::new();
    let mut lsubrs: Vec<Vec<usize>> = vec![Vec::new(); config.fdlen];
    while let Some(idx) = subrs.pop() {
        if gsubrs.len() >= limit && lsubrs.iter().all(|table| table.len() >= limit) {
            // every table is full; whatever remains is inlined
            subrs.push(idx);
            break;
        }
        if pool[idx].fdidx.len() == 1 {
            let fd = pool[idx].fdidx[0] as usize;
            let local_has_space = lsubrs[fd].len() < limit;
            if gsubrs.len() < limit && local_has_space {
                let gcost = test_call_cost(pool, idx, &gsubrs);
                let lcost = test_call_cost(pool, idx, &lsubrs[fd]);
                if gcost < lcost {
                    insert_by_usage(pool, &mut gsubrs, idx);
                    pool[idx].global = true;
                } else {
                    insert_by_usage(pool, &mut lsubrs[fd], idx);
                }
            } else if gsubrs.len() < limit {
                insert_by_usage(pool, &mut gsubrs, idx);
                pool[idx].global = true;
            } else if local_has_space {
                insert_by_usage(pool, &mut lsubrs[fd], idx);
            } else {
                pool[idx].flatten = true;
            }
        } else if gsubrs.len() < limit {
            insert_by_usage(pool, &mut gsubrs, idx);
            pool[idx].global = true;
        } else {
            pool[idx].flatten = true;
        }
    }
    // Anything left once every table filled gets inlined instead.
    for &idx in &subrs {
        pool[idx].flatten = true;
    }

    // Demote subrs nested past the interpreter's call depth limit;
    // demotion only ever reduces depth, so one pass suffices.
    calc_nesting(pool, &gsubrs, config.nest_limit);
    for table in &lsubrs {
        calc_nesting(pool, table, config.nest_limit);
    }
    let mut demoted = 0usize;
    for table in iter::once(&mut gsubrs).chain(lsubrs.iter_mut()) {
        table.retain(|&idx| {
            if pool[idx].max_call_depth > config.nest_limit {
                pool[idx].flatten = true;
                demoted += 1;
                false
            } else {
                true
            }
        });
    }
    if demoted > 0 {
        log::debug!("{demoted} subrs demoted for nesting depth");
    }

    let gbias = subr_bias(gsubrs.len());
    let lbias: Vec<i32> = lsubrs.iter().map(|table| subr_bias(table.len())).collect();

    reorder_for_bias(pool, &mut gsubrs, gbias);
    for (table, &bias) in lsubrs.iter_mut().zip(&lbias) {
        reorder_for_bias(pool, table, bias);
    }

    // Emit inlined bodies shortest first, so a body is ready before any
    // longer body that splices it in.
    let mut flattened: Vec<usize> = outcome
        .active
        .iter()
        .copied()
        .filter(|&idx| pool[idx].flatten && !pool[idx].fdidx.is_empty())
        .collect();
    flattened.sort_by_key(|&idx| pool[idx].length);
    log::debug!(
        "placing {} global and {} local subrs, inlining {}",
        gsubrs.len(),
        lsubrs.iter().map(Vec::len).sum::<usize>(),
        flattened.len(),
    );
    for idx in flattened {
        let encoding = pool[idx].encoding.clone();
        let mut program = alphabet.tokens(pool[idx].value(data));
        let fd = single_fd(&pool[idx]);
        update_program(&mut program, &encoding, pool, gbias, &lbias, fd)?;
        expand_hintmasks(&mut program);
        pool[idx].program = Some(program);
    }

    for &idx in gsubrs.iter().chain(lsubrs.iter().flatten()) {
        let encoding = pool[idx].encoding.clone();
        let mut program = alphabet.tokens(pool[idx].value(data));
        if !matches!(
            program.last(),
            Some(Token::Op(Op::EndChar) | Token::Op(Op::Return))
        ) {
            program.push(Token::Op(Op::Return));
        }
        let fd = single_fd(&pool[idx]);
        update_program(&mut program, &encoding, pool, gbias, &lbias, fd)?;
        expand_hintmasks(&mut program);
        pool[idx].program = Some(program);
    }

    let mut glyph_programs = Vec::with_capacity(data.len());
    for ((codes, encoding), &sel) in data.iter().zip(&outcome.glyph_encodings).zip(glyph_fds) {
        let mut program = alphabet.tokens(codes);
        update_program(&mut program, encoding, pool, gbias, &lbias, Some(sel))?;
        expand_hintmasks(&mut program);
        glyph_programs.push(program);
    }

    let collect_table = |table: &[usize], pool: &[Candidate]| -> Result<Vec<Vec<Token>>, SubrError> {
        table
            .iter()
            .map(|&idx| pool[idx].program.clone().ok_or(SubrError::MissingSubrBody))
            .collect()
    };
    let gsubr_programs = collect_table(&gsubrs, pool)?;
    let lsubr_programs = lsubrs
        .iter()
        .map(|table| collect_table(table, pool))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Assembled {
        glyph_programs,
        gsubrs: gsubr_programs,
        lsubrs: lsubr_programs,
    })
}

/// Marks `idx` and everything its encoding reaches as callable from
/// font dict `sel`. An already-marked candidate's subtree is marked
/// too, so it is not revisited.
fn mark_reachable(pool: &mut [Candidate], idx: usize, sel: u16) {
    if pool[idx].fdidx.contains(&sel) {
        return;
    }
    pool[idx].fdidx.push(sel);
    let callees: Vec<usize> = pool[idx].encoding.iter().map(|&(_, callee)| callee).collect();
    for callee in callees {
        mark_reachable(pool, callee, sel);
    }
}

fn single_fd(candidate: &Candidate) -> Option<u16> {
    match candidate.fdidx.as_slice() {
        &[only] => Some(only),
        _ => None,
    }
}

/// Approximates the call-operand width `idx` would get if inserted into
/// `table` (kept sorted descending by usages): entries past the one and
/// two byte operand windows pay more per call.
fn test_call_cost(pool: &[Candidate], idx: usize, table: &[usize]) -> u32 {
    let usages = pool[idx].usages;
    if table.len() >= 2263 && pool[table[2262]].usages >= usages {
        return 3;
    }
    if table.len() >= 215 && pool[table[214]].usages >= usages {
        return 2;
    }
    1
}

/// Keeps `table` sorted descending by usages. Equal counts stay in
/// insertion order.
fn insert_by_usage(pool: &[Candidate], table: &mut Vec<usize>, idx: usize) {
    let usages = pool[idx].usages;
    let at = table.partition_point(|&other| pool[other].usages >= usages);
    table.insert(at, idx);
}

/// Records the deepest call-chain position of every placed candidate
/// reachable from `table`, roots at depth 1. Flattened callees are
/// transparent: their own callees are visited at the caller's depth.
fn calc_nesting(pool: &mut [Candidate], table: &[usize], nest_limit: u32) {
    for &idx in table {
        if pool[idx].max_call_depth == 0 {
            increment_subr_depth(pool, idx, 1, nest_limit);
        }
    }
}

fn increment_subr_depth(pool: &mut [Candidate], idx: usize, depth: u32, nest_limit: u32) {
    if pool[idx].max_call_depth < depth {
        pool[idx].max_call_depth = depth;
    }
    let mut callees: Vec<usize> = pool[idx].encoding.iter().map(|&(_, callee)| callee).collect();
    while let Some(next) = callees.pop() {
        if pool[next].flatten {
            callees.extend(pool[next].encoding.iter().map(|&(_, callee)| callee));
        } else {
            // Depths past the limit saturate: those entries are all
            // demoted alike, and saturation bounds the traversal.
            let child_depth = (depth + 1).min(nest_limit + 1);
            if pool[next].max_call_depth < child_depth {
                increment_subr_depth(pool, next, child_depth, nest_limit);
            }
        }
    }
}

/// Sorts a table by usage and rotates the bias windows so the most-used
/// entries land on the shortest call operands.
///
/// With the bias subtracted from a position, the one byte operand range
/// covers positions `[0, 216)` under bias 1131 only after the two byte
/// window `[216, 1240)` is moved in front (and likewise for the three
/// byte windows under bias 32768).
fn reorder_for_bias(pool: &mut [Candidate], table: &mut Vec<usize>, bias: i32) {
    table.sort_by_key(|&idx| std::cmp::Reverse(pool[idx].usages));
    let len = table.len();
    let window = |from: usize, to: usize| from.min(len)..to.min(len);
    let reordered = match bias {
        1131 => Some(
            [
                &table[window(216, 1240)],
                &table[window(0, 216)],
                &table[window(1240, usize::MAX)],
            ]
            .concat(),
        ),
        32768 => Some(
            [
                &table[window(2264, 33900)],
                &table[window(216, 1240)],
                &table[window(0, 216)],
                &table[window(1240, 2264)],
                &table[window(33900, usize::MAX)],
            ]
            .concat(),
        ),
        _ => None,
    };
    if let Some(reordered) = reordered {
        *table = reordered;
    }
    for (position, &idx) in table.iter().enumerate() {
        pool[idx].position = Some(position as i32);
    }
}

/// Applies `encoding` to `program` in place: each selected span becomes
/// a `[biased operand, call]` pair, or the callee's emitted body when
/// the callee is flattened.
///
/// `fd` is the font dict the program belongs to, or `None` when the
/// program is reachable from several font dicts; under `None` every
/// placed callee must be global.
fn update_program(
    program: &mut Vec<Token>,
    encoding: &[(usize, usize)],
    pool: &[Candidate],
    gbias: i32,
    lbias: &[i32],
    fd: Option<u16>,
) -> Result<(), SubrError> {
    // Drift between offsets in the original token sequence and the
    // partially rewritten one.
    let mut offset = 0isize;
    for &(start, callee_idx) in encoding {
        let callee = &pool[callee_idx];
        let from = (start as isize - offset) as usize;
        let to = ((start + callee.length) as isize - offset) as usize;
        if callee.flatten {
            let body = callee
                .program
                .as_ref()
                .ok_or(SubrError::MissingSubrBody)?;
            program.splice(from..to, body.iter().cloned());
            offset += callee.length as isize - body.len() as isize;
        } else {
            let position = callee.position.ok_or(SubrError::MissingPosition)?;
            let (operand, op) = if callee.global {
                (position - gbias, Op::CallGsubr)
            } else {
                let subr_fd = match callee.fdidx.as_slice() {
                    &[only] => only,
                    other => return Err(SubrError::LocalSubrFdCount(other.len())),
                };
                match fd {
                    None => return Err(SubrError::LocalCallWithoutFd),
                    Some(caller_fd) if caller_fd != subr_fd => {
                        return Err(SubrError::CrossFdCall { subr_fd, caller_fd });
                    }
                    _ => {}
                }
                (position - lbias[subr_fd as usize], Op::CallSubr)
            };
            program.splice(from..to, [Token::Int(operand), Token::Op(op)]);
            offset += callee.length as isize - 2;
        }
    }
    Ok(())
}
