//! Subroutinize CFF Type 2 charstrings to shrink font binaries.
//!
//! Repeated token runs across a font's glyph programs are discovered
//! with a suffix array, priced in an iterative marketplace where a
//! dynamic program re-encodes every program and candidate body each
//! round, and the winners are packed into the global and per-font-dict
//! local subroutine tables. The surrounding container layer parses and
//! re-serializes the CFF table; this crate only rewrites token
//! programs, so inputs must already be de-subroutinized.

mod assemble;
mod candidates;
mod charstring;
mod market;
mod parallel;
mod suffix;

pub use charstring::{collapse_hintmasks, expand_hintmasks, Op, Token};

use candidates::{ExtractParams, SavingParams};
use charstring::Alphabet;
use fnv::FnvHashMap;
use suffix::SuffixIndex;
use thiserror::Error;

/// Marketplace iterations.
pub const NROUNDS: usize = 4;
/// Worker count when the parallel map is enabled.
pub const PROCESSES: usize = 12;
/// Parallel chunk sizing as a fraction of a stage's items.
pub const POOL_CHUNK_RATIO: f64 = 0.1;
/// Chunk ratio used for fonts below [`CHUNK_CHARSET_CUTOFF`] glyphs.
pub const LATIN_POOL_CHUNK_RATIO: f64 = 0.05;
/// Glyph count below which the smaller chunk ratio applies.
pub const CHUNK_CHARSET_CUTOFF: usize = 1500;
/// Maximum entries per subr INDEX (64K − 3).
pub const NSUBRS_LIMIT: usize = 65533;
/// Maximum call depth the charstring interpreter guarantees.
///
/// See "Appendix B Type 2 Charstring Implementation Limits" in
/// <https://adobe-type-tools.github.io/font-tech-notes/pdfs/5177.Type2.pdf>
pub const SUBR_NEST_LIMIT: u32 = 10;
/// Price moving-average weight.
pub const ALPHA: f64 = 0.1;
/// Pricing smoother added to usage counts.
pub const K: f64 = 0.1;
/// Assumed byte cost of a subroutine call in the saving heuristic.
pub const CALL_COST: i64 = 5;
/// Fixed per-subroutine overhead in the saving heuristic.
pub const SUBR_OVERHEAD: i64 = 3;
/// Minimum occurrence count for a candidate substring.
pub const MIN_FREQ: i64 = 2;

#[derive(Debug, Error)]
pub enum SubrError {
    #[error("glyph '{glyph}': source charstrings must not contain {op:?}")]
    ForbiddenOperator { glyph: String, op: Op },

    #[error("glyph '{glyph}': endchar may only appear as the final token")]
    MisplacedEndChar { glyph: String },

    #[error("glyph '{glyph}': mask operator is missing its mask bytes")]
    MissingMaskBytes { glyph: String },

    #[error("glyph '{glyph}': mask bytes without a preceding mask operator")]
    StrayMaskBytes { glyph: String },

    #[error("subroutine placed in a table has no final position")]
    MissingPosition,

    #[error("subroutine body was not emitted before use")]
    MissingSubrBody,

    #[error("local subroutine reachable from {0} font dicts")]
    LocalSubrFdCount(usize),

    #[error("local subroutine called from a context with no font dict")]
    LocalCallWithoutFd,

    #[error("local subroutine for fd {subr_fd} called from fd {caller_fd}")]
    CrossFdCall { subr_fd: u16, caller_fd: u16 },

    #[error("failed to build the worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Tuning knobs for the subroutinizer. [`Options::default`] matches the
/// values the compressor ships with.
#[derive(Clone, Debug)]
pub struct Options {
    /// Marketplace iterations to run.
    pub nrounds: usize,
    /// Disable the parallel map entirely.
    pub single_process: bool,
    /// Worker count for the parallel map.
    pub processes: usize,
    /// Parallel chunk sizing as a fraction of a stage's items; `None`
    /// picks [`POOL_CHUNK_RATIO`], or [`LATIN_POOL_CHUNK_RATIO`] for
    /// small fonts.
    pub chunk_ratio: Option<f64>,
    /// Maximum entries per subr table.
    pub nsubrs_limit: usize,
    /// Maximum call depth of any placed subr.
    pub subr_nest_limit: u32,
    /// Price moving-average weight.
    pub alpha: f64,
    /// Pricing smoother added to usage counts.
    pub k: f64,
    /// Assumed byte cost of a subroutine call.
    pub call_cost: i64,
    /// Fixed per-subroutine overhead.
    pub subr_overhead: i64,
    /// Minimum occurrence count for a candidate substring.
    pub min_freq: i64,
    /// Keep candidates with non-positive savings and never prune; for
    /// exercising the machinery on tiny inputs.
    pub test_mode: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            nrounds: NROUNDS,
            single_process: false,
            processes: PROCESSES,
            chunk_ratio: None,
            nsubrs_limit: NSUBRS_LIMIT,
            subr_nest_limit: SUBR_NEST_LIMIT,
            alpha: ALPHA,
            k: K,
            call_cost: CALL_COST,
            subr_overhead: SUBR_OVERHEAD,
            min_freq: MIN_FREQ,
            test_mode: false,
        }
    }
}

/// An ordered collection of named glyph programs in expanded token
/// form.
#[derive(Clone, Debug, Default)]
pub struct GlyphSet {
    glyphs: Vec<(String, Vec<Token>)>,
}

impl GlyphSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a glyph; iteration order is insertion order.
    pub fn push(&mut self, name: impl Into<String>, program: Vec<Token>) {
        self.glyphs.push((name.into(), program));
    }

    /// Glyph names in deterministic (insertion) order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.glyphs.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Token])> {
        self.glyphs
            .iter()
            .map(|(name, program)| (name.as_str(), program.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.glyphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.glyphs.is_empty()
    }
}

/// Maps glyphs to their font dict in a CID-keyed font.
///
/// Glyphs without an explicit entry select fd 0. A font without an
/// FDSelect table needs no [`FdSelect`] at all: every glyph maps to a
/// single font dict and one local subr table is produced.
#[derive(Clone, Debug)]
pub struct FdSelect {
    fd_count: usize,
    selector: FnvHashMap<String, u16>,
}

impl FdSelect {
    pub fn new(fd_count: usize) -> Self {
        FdSelect {
            fd_count: fd_count.max(1),
            selector: FnvHashMap::default(),
        }
    }

    pub fn set(&mut self, glyph: impl Into<String>, fd: u16) {
        self.selector.insert(glyph.into(), fd);
    }

    /// The font dict index for `glyph`.
    pub fn select(&self, glyph: &str) -> u16 {
        self.selector.get(glyph).copied().unwrap_or(0)
    }

    pub fn fd_count(&self) -> usize {
        self.fd_count
    }
}

/// The rewritten programs and subroutine tables produced by
/// [`subroutinize`].
///
/// All programs are in expanded token form. Every call operand in a
/// glyph program or subr body refers to a valid position in its table
/// after the table's bias is added back.
#[derive(Clone, Debug)]
pub struct Subroutinized {
    /// One rewritten program per input glyph, in input order.
    pub glyph_programs: Vec<(String, Vec<Token>)>,
    /// The global subroutine table.
    pub gsubrs: Vec<Vec<Token>>,
    /// One local subroutine table per font dict.
    pub lsubrs: Vec<Vec<Vec<Token>>>,
}

/// Compresses `glyph_set` by factoring repeated token runs into
/// subroutines.
///
/// The caller guarantees that programs are de-subroutinized and that a
/// mask operator is immediately followed by its mask bytes; violations
/// are fatal. Routine conditions (candidates pruned, flattened, or
/// demoted for nesting depth) are internal state and never error.
pub fn subroutinize(
    glyph_set: &GlyphSet,
    fd_select: Option<&FdSelect>,
    options: &Options,
) -> Result<Subroutinized, SubrError> {
    let mut alphabet = Alphabet::default();
    let mut data = Vec::with_capacity(glyph_set.len());
    for (name, program) in glyph_set.iter() {
        data.push(alphabet.ingest(name, program)?);
    }

    let index = SuffixIndex::build(&data);
    let saving = SavingParams {
        call_cost: options.call_cost,
        subr_overhead: options.subr_overhead,
    };
    let pool = candidates::extract(
        &data,
        alphabet.cost_map(),
        &index,
        &ExtractParams {
            min_freq: if options.test_mode { 0 } else { options.min_freq },
            check_positive: !options.test_mode,
            saving,
        },
    );
    log::debug!(
        "{} glyphs, {} tokens, {} distinct, {} candidate substrings",
        data.len(),
        index.suffixes.len(),
        alphabet.len(),
        pool.len(),
    );

    let chunk_ratio = options.chunk_ratio.unwrap_or(
        if glyph_set.len() < CHUNK_CHARSET_CUTOFF {
            LATIN_POOL_CHUNK_RATIO
        } else {
            POOL_CHUNK_RATIO
        },
    );
    let market_config = market::MarketConfig {
        nrounds: options.nrounds,
        alpha: options.alpha,
        k: options.k,
        saving,
        test_mode: options.test_mode,
        single_process: options.single_process,
        chunk_ratio,
    };
    let mut outcome = if options.single_process {
        market::run(&data, alphabet.cost_map(), pool, &market_config)
    } else {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.processes)
            .build()?;
        thread_pool.install(|| market::run(&data, alphabet.cost_map(), pool, &market_config))
    };

    let fdlen = fd_select.map_or(1, FdSelect::fd_count);
    let glyph_fds: Vec<u16> = glyph_set
        .keys()
        .map(|name| fd_select.map_or(0, |sel| sel.select(name)))
        .collect();
    let assembled = assemble::process_subrs(
        &mut outcome,
        &glyph_fds,
        &alphabet,
        &data,
        &assemble::AssembleConfig {
            fdlen,
            nsubrs_limit: options.nsubrs_limit,
            nest_limit: options.subr_nest_limit,
            saving,
        },
    )?;

    Ok(Subroutinized {
        glyph_programs: glyph_set
            .keys()
            .map(String::from)
            .zip(assembled.glyph_programs)
            .collect(),
        gsubrs: assembled.gsubrs,
        lsubrs: assembled.lsubrs,
    })
}
