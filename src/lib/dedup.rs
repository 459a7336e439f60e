//! Duplicate marking by library, unclipped 5' position and strand.
//!
//! Two passes over the input. The first streams records to a spill file in
//! the temp directory while collecting duplicate-detection ends: fragments
//! keyed by `(library, ref_id, unclipped 5', strand)`, pairs keyed by the
//! two mate keys in canonical order, with mates joined through a
//! name-to-first-mate map (which also resolves pairs spanning references).
//! The second pass re-reads the spill and emits records in arrival order,
//! setting the duplicate flag in place or dropping flagged records when
//! removal is requested.
//!
//! Within a key group the representative is the end with the highest summed
//! base quality; earlier arrival wins ties. Fragments whose key collides
//! with any paired end are duplicates outright.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use bstr::BString;
use tempfile::TempDir;

use crate::errors::{BamlineError, Result};
use crate::header::Header;
use crate::reader::BamReader;
use crate::record::Record;
use crate::writer::{BamWriter, CompressionMode};

/// Configuration for duplicate marking.
#[derive(Clone, Debug, Default)]
pub struct DedupConfig {
    /// Drop duplicates instead of flagging them.
    pub remove_duplicates: bool,
    /// Directory for the intermediate spill file.
    pub tmp_dir: Option<PathBuf>,
}

/// Counters reported after a dedup run.
#[derive(Clone, Copy, Debug, Default)]
pub struct DedupStats {
    /// Records processed.
    pub total_records: u64,
    /// Records identified as duplicates.
    pub duplicate_records: u64,
    /// Mate pairs resolved through the name map.
    pub pairs_matched: u64,
}

impl DedupStats {
    /// Fraction of records identified as duplicates.
    #[must_use]
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_records == 0 {
            0.0
        } else {
            self.duplicate_records as f64 / self.total_records as f64
        }
    }
}

/// Duplicate-detection key for one read end.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct EndKey {
    library: u32,
    ref_id: i32,
    unclipped_pos: i32,
    reverse: bool,
}

/// One scored occurrence of a key.
struct FragmentEnd {
    score: u32,
    index: u64,
}

/// A resolved mate pair.
struct PairEnd {
    score: u32,
    indices: [u64; 2],
}

/// First-seen mate info awaiting its partner.
struct OpenMate {
    key: EndKey,
    score: u32,
    index: u64,
}

/// The duplicate-marking engine.
pub struct MarkDuplicates {
    header: Arc<Header>,
    config: DedupConfig,
    libraries: AHashMap<BString, u32>,
}

impl MarkDuplicates {
    /// Create an engine for records described by `header`.
    #[must_use]
    pub fn new(header: Arc<Header>, config: DedupConfig) -> Self {
        // Read groups resolve to per-library indices; records without a
        // resolvable read group share library 0.
        let mut lib_ids: AHashMap<BString, u32> = AHashMap::new();
        let mut libraries = AHashMap::new();
        for (rg, lb) in header.read_group_libraries() {
            let next = lib_ids.len() as u32 + 1;
            let id = *lib_ids.entry(lb).or_insert(next);
            libraries.insert(rg, id);
        }
        Self { header, config, libraries }
    }

    /// Stream `input` through duplicate marking, handing surviving records
    /// to `emit` in arrival order.
    pub fn run<I, F>(&self, input: I, mut emit: F) -> Result<DedupStats>
    where
        I: IntoIterator<Item = Result<Record>>,
        F: FnMut(Record) -> Result<()>,
    {
        let mut stats = DedupStats::default();

        let spill_dir = self.spill_dir()?;
        let spill_path = spill_dir.path().join("dedup_spill");
        let mut spill = BamWriter::builder()
            .compression_mode(CompressionMode::Uncompressed)
            .create(&spill_path, &self.header)?;

        let mut fragments: AHashMap<EndKey, Vec<FragmentEnd>> = AHashMap::new();
        let mut pairs: AHashMap<(EndKey, EndKey), Vec<PairEnd>> = AHashMap::new();
        let mut open_mates: AHashMap<BString, OpenMate> = AHashMap::new();

        let mut index: u64 = 0;
        for record in input {
            let record = record?;
            if self.is_candidate(&record) {
                let key = self.end_key(&record);
                let score = record.quality_sum();
                if record.is_paired() && !record.is_mate_unmapped() {
                    if let Some(mate) = open_mates.remove(record.name()) {
                        stats.pairs_matched += 1;
                        let (a, b) = canonical(mate.key, key);
                        pairs.entry((a, b)).or_default().push(PairEnd {
                            score: mate.score + score,
                            indices: [mate.index, index],
                        });
                    } else {
                        open_mates.insert(
                            BString::from(record.name().to_owned()),
                            OpenMate { key, score, index },
                        );
                    }
                } else {
                    fragments.entry(key).or_default().push(FragmentEnd { score, index });
                }
            }
            spill.save(&record)?;
            index += 1;
            stats.total_records += 1;
        }
        spill.finish()?;

        // Ends whose mate never arrived (lost to truncation or another
        // split lane) compete as fragments.
        for (_, mate) in open_mates.drain() {
            fragments
                .entry(mate.key)
                .or_default()
                .push(FragmentEnd { score: mate.score, index: mate.index });
        }

        let duplicates = resolve_duplicates(index as usize, &pairs, &fragments);

        // Second pass: re-read the spill and emit in arrival order.
        let mut reader = BamReader::open(&spill_path)?;
        let mut i = 0usize;
        while let Some(mut record) = reader.next_record()? {
            if i >= duplicates.len() {
                return Err(BamlineError::internal(
                    "dedup spill produced more records than were written",
                ));
            }
            if duplicates[i] {
                stats.duplicate_records += 1;
                if self.config.remove_duplicates {
                    i += 1;
                    continue;
                }
                record.set_duplicate(true);
            }
            emit(record)?;
            i += 1;
        }

        Ok(stats)
    }

    fn spill_dir(&self) -> Result<TempDir> {
        match &self.config.tmp_dir {
            Some(base) => {
                std::fs::create_dir_all(base)
                    .map_err(|e| BamlineError::io("MarkDuplicates::run", e))?;
                TempDir::new_in(base)
            }
            None => TempDir::new(),
        }
        .map_err(|e| BamlineError::io("MarkDuplicates::run", e))
    }

    /// Only primary mapped alignments compete for duplicate selection.
    fn is_candidate(&self, record: &Record) -> bool {
        !record.is_unmapped() && !record.is_secondary() && !record.is_supplementary()
    }

    fn end_key(&self, record: &Record) -> EndKey {
        let library = record
            .tag_str(*b"RG")
            .and_then(|rg| self.libraries.get(rg))
            .copied()
            .unwrap_or(0);
        EndKey {
            library,
            ref_id: record.ref_id(),
            unclipped_pos: record.unclipped_five_prime(),
            reverse: record.is_reverse(),
        }
    }
}

fn canonical(a: EndKey, b: EndKey) -> (EndKey, EndKey) {
    if a <= b { (a, b) } else { (b, a) }
}

fn resolve_duplicates(
    total: usize,
    pairs: &AHashMap<(EndKey, EndKey), Vec<PairEnd>>,
    fragments: &AHashMap<EndKey, Vec<FragmentEnd>>,
) -> Vec<bool> {
    let mut duplicates = vec![false; total];

    let mut paired_keys: AHashSet<EndKey> = AHashSet::new();
    for (a, b) in pairs.keys() {
        paired_keys.insert(*a);
        paired_keys.insert(*b);
    }

    for group in pairs.values() {
        let best = best_index(group.iter().map(|p| p.score));
        for (i, pair) in group.iter().enumerate() {
            if i != best {
                duplicates[pair.indices[0] as usize] = true;
                duplicates[pair.indices[1] as usize] = true;
            }
        }
    }

    for (key, group) in fragments {
        if paired_keys.contains(key) {
            // A full pair always outranks lone fragments at the same key.
            for fragment in group {
                duplicates[fragment.index as usize] = true;
            }
        } else {
            let best = best_index(group.iter().map(|f| f.score));
            for (i, fragment) in group.iter().enumerate() {
                if i != best {
                    duplicates[fragment.index as usize] = true;
                }
            }
        }
    }

    duplicates
}

/// Index of the highest score; the earliest occurrence wins ties.
fn best_index(scores: impl Iterator<Item = u32>) -> usize {
    let mut best = 0;
    let mut best_score = 0;
    for (i, score) in scores.enumerate() {
        if i == 0 || score > best_score {
            best = i;
            best_score = score;
        }
    }
    best
}

/// Convenience path wrapper so callers can pass `&Path` temp dirs.
impl DedupConfig {
    /// Config that flags duplicates in place.
    #[must_use]
    pub fn marking(tmp_dir: Option<&Path>) -> Self {
        Self { remove_duplicates: false, tmp_dir: tmp_dir.map(Path::to_path_buf) }
    }

    /// Config that removes duplicates from the stream.
    #[must_use]
    pub fn removing(tmp_dir: Option<&Path>) -> Self {
        Self { remove_duplicates: true, tmp_dir: tmp_dir.map(Path::to_path_buf) }
    }
}
