//! Suffix array and longest-common-prefix table over the token corpus.

/// A position in the corpus: `(glyph index, token offset)`.
pub(crate) type Pos = (u32, u32);

/// Every suffix of every glyph program, sorted lexicographically, with
/// the LCP table between adjacent suffixes.
///
/// Suffixes end at their glyph's last code; no cross-glyph sentinel is
/// assumed, so a suffix that is a prefix of another sorts first.
pub(crate) struct SuffixIndex {
    pub suffixes: Vec<Pos>,
    pub lcp: Vec<u32>,
}

impl SuffixIndex {
    pub fn build(data: &[Vec<u32>]) -> Self {
        let mut suffixes: Vec<Pos> = data
            .iter()
            .enumerate()
            .flat_map(|(g, program)| (0..program.len() as u32).map(move |i| (g as u32, i)))
            .collect();
        suffixes.sort_by(|&(ag, ai), &(bg, bi)| {
            data[ag as usize][ai as usize..].cmp(&data[bg as usize][bi as usize..])
        });

        let mut rank: Vec<Vec<u32>> = data.iter().map(|program| vec![0; program.len()]).collect();
        for (r, &(g, i)) in suffixes.iter().enumerate() {
            rank[g as usize][i as usize] = r as u32;
        }

        // Kasai: walk each glyph string front to back; the common
        // prefix with the rank predecessor shrinks by at most one token
        // per step, so `h` never restarts from zero mid-string.
        let mut lcp = vec![0u32; suffixes.len()];
        for (g, program) in data.iter().enumerate() {
            let mut h = 0usize;
            for i in 0..program.len() {
                let r = rank[g][i] as usize;
                if r == 0 {
                    continue;
                }
                let (pg, pi) = suffixes[r - 1];
                let prev = &data[pg as usize][pi as usize..];
                let cur = &program[i..];
                while h < prev.len() && h < cur.len() && prev[h] == cur[h] {
                    h += 1;
                }
                lcp[r] = h as u32;
                h = h.saturating_sub(1);
            }
        }
        SuffixIndex { suffixes, lcp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffix<'a>(data: &'a [Vec<u32>], pos: Pos) -> &'a [u32] {
        &data[pos.0 as usize][pos.1 as usize..]
    }

    fn naive_lcp(a: &[u32], b: &[u32]) -> u32 {
        a.iter().zip(b).take_while(|(x, y)| x == y).count() as u32
    }

    #[test]
    fn single_glyph() {
        let data = vec![vec![1, 5, 0, 1, 5, 9]];
        let index = SuffixIndex::build(&data);
        let order: Vec<u32> = index.suffixes.iter().map(|&(_, i)| i).collect();
        assert_eq!(order, vec![2, 0, 3, 1, 4, 5]);
        assert_eq!(index.lcp, vec![0, 0, 2, 0, 1, 0]);
    }

    #[test]
    fn across_glyphs() {
        let data = vec![vec![1, 2], vec![1, 2, 3]];
        let index = SuffixIndex::build(&data);
        assert_eq!(
            index.suffixes,
            vec![(0, 0), (1, 0), (0, 1), (1, 1), (1, 2)]
        );
        assert_eq!(index.lcp, vec![0, 2, 0, 1, 0]);
    }

    #[test]
    fn matches_naive_computation() {
        // mix of shared runs, repeats and singleton codes
        let data = vec![
            vec![4, 4, 4, 2, 7, 8, 2, 7, 8],
            vec![2, 7, 8, 4, 4, 4],
            vec![9],
            vec![],
        ];
        let index = SuffixIndex::build(&data);
        let total: usize = data.iter().map(Vec::len).sum();
        assert_eq!(index.suffixes.len(), total);
        assert_eq!(index.lcp[0], 0);
        for r in 1..index.suffixes.len() {
            let prev = suffix(&data, index.suffixes[r - 1]);
            let cur = suffix(&data, index.suffixes[r]);
            assert!(prev <= cur, "suffixes not sorted at rank {r}");
            assert_eq!(index.lcp[r], naive_lcp(prev, cur), "lcp wrong at rank {r}");
        }
    }
}
