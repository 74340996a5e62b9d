use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::{tempdir, TempDir};

use mempack::chunker::split_text;
use mempack::{
    build, verify_pack, AnnReader, Compressor, Document, EccParams, HashingEmbedder,
    MempackError, MetaValue, PackConfig, PackReader, Retriever, SearchOptions,
};

const QUANTUM_NOTE: &str = "\
Quantum superposition lets a qubit hold a blend of basis states. \
A measurement collapses the superposition into a single outcome. \
Superposition combined with entanglement powers quantum algorithms. \
Interference between superposition amplitudes is what a quantum circuit choreographs. \
Decoherence destroys superposition when a qubit couples to its environment. \
Error correction protects fragile superposition states across many physical qubits.";

const COOKING_NOTE: &str = "\
Sourdough bread needs a lively starter and patience. \
Fold the dough gently every half hour during bulk fermentation. \
A dutch oven traps steam and gives the crust its shine. \
Score the loaf deeply so it can spring upward in the heat. \
Cooling on a wire rack keeps the crumb from turning gummy.";

const HIKING_NOTE: &str = "\
The ridge trail climbs steeply through old pine forest. \
Carry two liters of water; the spring at the saddle runs dry by July. \
From the summit the valley towns look like scattered toys. \
Descend before afternoon storms build over the peaks. \
Wildflowers carpet the meadows in early June.";

/// Small chunks and a tiny block target so the three notes spread over
/// enough blocks to exercise grouping, parity, and eviction.
fn small_config() -> PackConfig {
    PackConfig {
        chunk_size: 120,
        chunk_overlap: 24,
        block_size: 128,
        ..PackConfig::default()
    }
}

fn corpus() -> Vec<Document> {
    let mut quantum = Document::new("quantum_computing.md", QUANTUM_NOTE);
    quantum.meta.insert("topic".into(), MetaValue::Str("physics".into()));
    quantum.tags.insert("science".into());

    let mut cooking = Document::new("cooking.md", COOKING_NOTE);
    cooking.meta.insert("topic".into(), MetaValue::Str("food".into()));

    let mut hiking = Document::new("hiking.md", HIKING_NOTE);
    hiking.meta.insert("topic".into(), MetaValue::Str("outdoors".into()));

    vec![quantum, cooking, hiking]
}

fn build_pack(config: &PackConfig) -> (TempDir, PathBuf, PathBuf) {
    let dir = tempdir().unwrap();
    let pack = dir.path().join("notes.mpack");
    let ann = dir.path().join("notes.ann");
    let backend = HashingEmbedder::new(64);
    build(&corpus(), &backend, config, &pack, &ann).unwrap();
    (dir, pack, ann)
}

fn open_retriever(pack: &Path, ann: &Path) -> Retriever {
    Retriever::open(pack, ann, Arc::new(HashingEmbedder::new(64))).unwrap()
}

/// Flip one byte at `offset`, leaving everything else untouched.
fn flip_byte(path: &Path, offset: u64) {
    let mut f = std::fs::OpenOptions::new().read(true).write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    let mut b = [0u8; 1];
    f.read_exact(&mut b).unwrap();
    b[0] ^= 0xFF;
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(&b).unwrap();
}

/// Stable projection of search hits for equality checks.
fn hit_keys(hits: &[mempack::Hit]) -> Vec<(u64, u32, String)> {
    hits.iter()
        .map(|h| (h.chunk_id, h.score.to_bits(), h.text.clone()))
        .collect()
}

// ── Scenario 1: chunking on small documents ─────────────────────────────────

#[test]
fn chunking_three_docs_with_overlap() {
    let docs = vec![
        Document::new("a.md", QUANTUM_NOTE),
        Document::new("b.md", COOKING_NOTE),
        Document::new("c.md", HIKING_NOTE),
    ];
    let config = PackConfig {
        chunk_size: 80,
        chunk_overlap: 20,
        ..PackConfig::default()
    };
    let dir = tempdir().unwrap();
    let pack = dir.path().join("abc.mpack");
    let ann = dir.path().join("abc.ann");
    let backend = HashingEmbedder::new(64);
    let stats = build(&docs, &backend, &config, &pack, &ann).unwrap();
    assert!(stats.ratio() > 0.0);

    let expected: Vec<Vec<String>> = docs
        .iter()
        .map(|d| split_text(&d.text, 80, 20))
        .collect();
    let expected_count: usize = expected.iter().map(|c| c.len()).sum();
    assert_eq!(stats.chunks as usize, expected_count);
    assert!(expected.iter().all(|c| c.len() >= 2));

    // Consecutive chunks of one document share a ≥20-char whitespace-aligned
    // overlap.
    for doc_chunks in &expected {
        for pair in doc_chunks.windows(2) {
            let prev: Vec<char> = pair[0].chars().collect();
            let next: Vec<char> = pair[1].chars().collect();
            let max = prev.len().min(next.len());
            let shared = (1..=max)
                .rev()
                .find(|&j| prev[prev.len() - j..] == next[..j])
                .unwrap_or(0);
            assert!(shared >= 20, "only {shared} shared chars");
        }
    }

    // Round-trip: every stored chunk equals the chunker's output for that
    // position.
    let retriever = open_retriever(&pack, &ann);
    let flat: Vec<&String> = expected.iter().flatten().collect();
    for (chunk_id, want) in flat.iter().enumerate() {
        let chunk = retriever.get_chunk(chunk_id as u64, None).unwrap();
        assert_eq!(&chunk.text, *want);
    }
}

// ── Scenario 2: semantic search hits the right note ─────────────────────────

#[test]
fn quantum_query_finds_the_quantum_note() {
    let (_dir, pack, ann) = build_pack(&small_config());
    let retriever = open_retriever(&pack, &ann);

    let hits = retriever
        .search("quantum superposition", 1, &SearchOptions::default())
        .unwrap();
    assert_eq!(hits.len(), 1);
    let top = &hits[0];
    assert!(
        top.text.to_lowercase().contains("superposition"),
        "top hit: {}",
        top.text
    );
    match top.meta.fields.get("source") {
        Some(MetaValue::Str(s)) => assert!(s.ends_with("quantum_computing.md")),
        other => panic!("missing source meta: {other:?}"),
    }
    assert!(top.score > 0.0);
}

#[test]
fn meta_filter_restricts_results() {
    let (_dir, pack, ann) = build_pack(&small_config());
    let retriever = open_retriever(&pack, &ann);

    let mut filter = BTreeMap::new();
    filter.insert("topic".into(), MetaValue::Str("food".into()));
    let opts = SearchOptions { filter_meta: Some(filter), ..SearchOptions::default() };
    let hits = retriever.search("bread dough starter", 3, &opts).unwrap();
    assert!(!hits.is_empty());
    for hit in &hits {
        assert_eq!(
            hit.meta.fields.get("topic"),
            Some(&MetaValue::Str("food".into()))
        );
    }
}

#[test]
fn top_k_edge_cases() {
    let (_dir, pack, ann) = build_pack(&small_config());
    let retriever = open_retriever(&pack, &ann);

    assert!(retriever
        .search("anything", 0, &SearchOptions::default())
        .unwrap()
        .is_empty());

    let n = retriever.pack().chunk_count() as usize;
    let all = retriever
        .search("mountain bread qubit", n + 50, &SearchOptions::default())
        .unwrap();
    assert_eq!(all.len(), n);
    for pair in all.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(
            a.score > b.score || (a.score == b.score && a.chunk_id < b.chunk_id),
            "ordering violated"
        );
    }
}

// ── Scenario 3: single corrupt block repaired through parity ────────────────

#[test]
fn single_block_corruption_is_recovered() {
    let config = PackConfig {
        ecc: Some(EccParams { k: 4, m: 2 }),
        ..small_config()
    };
    let (_dir, pack, ann) = build_pack(&config);

    let before = {
        let retriever = open_retriever(&pack, &ann);
        hit_keys(&retriever.search("quantum superposition", 5, &SearchOptions::default()).unwrap())
    };

    // Flip one byte inside block 0's compressed payload.
    let target = {
        let reader = PackReader::open(&pack).unwrap();
        assert!(reader.block_count() >= 6, "corpus too small for the scenario");
        reader.block_entry(0).unwrap().file_offset + 1
    };
    flip_byte(&pack, target);

    let reader = PackReader::open(&pack).unwrap();
    let ann_reader = AnnReader::open(&ann).unwrap();
    let report = verify_pack(&reader, Some(&ann_reader), None).unwrap();
    assert_eq!(report.corrupted, 1);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.unrecoverable, 0);
    assert!(report.is_healthy());

    // Reads repair in memory: identical results to the clean pack.
    let retriever = open_retriever(&pack, &ann);
    let after = hit_keys(&retriever.search("quantum superposition", 5, &SearchOptions::default()).unwrap());
    assert_eq!(after, before);
}

// ── Scenario 4: beyond-parity damage degrades, never panics ─────────────────

#[test]
fn beyond_parity_corruption_degrades_gracefully() {
    let config = PackConfig {
        ecc: Some(EccParams { k: 4, m: 2 }),
        ..small_config()
    };
    let (_dir, pack, ann) = build_pack(&config);

    // Corrupt m+1 = 3 members of ECC group 0.
    let targets: Vec<u64> = {
        let reader = PackReader::open(&pack).unwrap();
        (0..3)
            .map(|b| reader.block_entry(b).unwrap().file_offset + 1)
            .collect()
    };
    for t in targets {
        flip_byte(&pack, t);
    }

    let reader = PackReader::open(&pack).unwrap();
    let report = verify_pack(&reader, None, None).unwrap();
    assert_eq!(report.corrupted, 3);
    assert!(report.unrecoverable >= 1);
    assert!(!report.is_healthy());

    // Searches skip the dead chunks and never error out globally.
    let retriever = open_retriever(&pack, &ann);
    let n = retriever.pack().chunk_count() as usize;
    let hits = retriever
        .search("superposition bread ridge", n, &SearchOptions::default())
        .unwrap();
    assert!(hits.len() < n);
    assert!(!hits.is_empty());
}

// ── Scenario 5: builds are byte-identical ───────────────────────────────────

#[test]
fn identical_builds_are_byte_identical() {
    let config = PackConfig {
        ecc: Some(EccParams { k: 4, m: 2 }),
        ..small_config()
    };
    let (_d1, pack_a, ann_a) = build_pack(&config);
    let (_d2, pack_b, ann_b) = build_pack(&config);

    assert_eq!(std::fs::read(&pack_a).unwrap(), std::fs::read(&pack_b).unwrap());
    assert_eq!(std::fs::read(&ann_a).unwrap(), std::fs::read(&ann_b).unwrap());
}

// ── Scenario 6: cache stays bounded under a wide access pattern ─────────────

#[test]
fn block_cache_respects_its_bound() {
    let config = PackConfig {
        block_cache_size: 2,
        ..small_config()
    };
    let (_dir, pack, ann) = build_pack(&config);
    let retriever = open_retriever(&pack, &ann);

    let reader = PackReader::open(&pack).unwrap();
    assert!(reader.block_count() >= 10, "need ≥10 blocks for the scenario");

    for chunk_id in 0..retriever.pack().chunk_count() {
        retriever.get_chunk(chunk_id, None).unwrap();
        assert!(retriever.cached_blocks() <= 2);
    }
}

// ── Format-level failure policy ─────────────────────────────────────────────

#[test]
fn metadata_corruption_is_fatal_at_open() {
    let (_dir, pack, _ann) = build_pack(&small_config());

    // Damage inside the chunk TOC (a metadata section): open must fail.
    let toc_offset = {
        let reader = PackReader::open(&pack).unwrap();
        reader
            .header()
            .table
            .get(*b"TOCC")
            .unwrap()
            .offset
    };
    flip_byte(&pack, toc_offset + 12);
    assert!(PackReader::open(&pack).is_err());
}

#[test]
fn corrupt_block_without_ecc_poisons_chunks() {
    let (_dir, pack, ann) = build_pack(&small_config());

    let (target, victim_chunks) = {
        let reader = PackReader::open(&pack).unwrap();
        let victims: Vec<u64> = (0..reader.chunk_count())
            .filter(|c| reader.chunk_entry(*c).unwrap().block_id == 0)
            .collect();
        (reader.block_entry(0).unwrap().file_offset + 1, victims)
    };
    flip_byte(&pack, target);

    let retriever = open_retriever(&pack, &ann);
    for chunk_id in victim_chunks {
        assert!(matches!(
            retriever.get_chunk(chunk_id, None),
            Err(MempackError::ChunkUnavailable(_))
        ));
    }
}

#[test]
fn deadline_in_the_past_times_out() {
    let (_dir, pack, ann) = build_pack(&small_config());
    let retriever = open_retriever(&pack, &ann);

    let opts = SearchOptions {
        deadline: Some(Instant::now() - Duration::from_millis(1)),
        ..SearchOptions::default()
    };
    assert!(matches!(
        retriever.search("anything", 3, &opts),
        Err(MempackError::Timeout)
    ));
    assert!(matches!(
        retriever.verify(Some(Instant::now() - Duration::from_millis(1))),
        Err(MempackError::Timeout)
    ));
}

#[test]
fn tag_filter_narrows_search_results() {
    let (_dir, pack, ann) = build_pack(&small_config());
    let retriever = open_retriever(&pack, &ann);

    // Only the quantum note carries the "science" tag.
    let opts = SearchOptions {
        filter_tags: vec!["science".into()],
        ..SearchOptions::default()
    };
    let hits = retriever
        .search("superposition bread ridge", 10, &opts)
        .unwrap();
    assert!(!hits.is_empty());
    for hit in &hits {
        assert!(hit.meta.tags.contains("science"));
        match hit.meta.fields.get("source") {
            Some(MetaValue::Str(s)) => assert!(s.ends_with("quantum_computing.md")),
            other => panic!("missing source meta: {other:?}"),
        }
    }

    let unknown = SearchOptions {
        filter_tags: vec!["no-such-tag".into()],
        ..SearchOptions::default()
    };
    assert!(retriever.search("superposition", 5, &unknown).unwrap().is_empty());
}

#[test]
fn tag_index_round_trips_through_the_pack() {
    let (_dir, pack, ann) = build_pack(&small_config());
    let retriever = open_retriever(&pack, &ann);

    let tagged = retriever.chunks_with_tag("science");
    assert!(!tagged.is_empty());
    for chunk_id in &tagged {
        let chunk = retriever.get_chunk(*chunk_id, None).unwrap();
        assert!(chunk.meta.tags.contains("science"));
    }
    assert!(retriever.chunks_with_tag("no-such-tag").is_empty());
}

#[test]
fn positioned_io_matches_mmap() {
    let config = PackConfig { mmap: false, ..small_config() };
    let (_dir, pack, ann) = build_pack(&config);

    // open() honors the stored backing choice; results must not depend on it.
    let via_config = open_retriever(&pack, &ann);
    let hits = via_config
        .search("quantum superposition", 3, &SearchOptions::default())
        .unwrap();
    assert_eq!(hits.len(), 3);

    let mapped = PackReader::open_with(&pack, true).unwrap();
    for chunk_id in 0..mapped.chunk_count() {
        assert_eq!(
            mapped.chunk_text(chunk_id).unwrap(),
            via_config.get_chunk(chunk_id, None).unwrap().text,
        );
    }
}

#[test]
fn deflate_and_none_codecs_round_trip_end_to_end() {
    for compressor in [Compressor::Deflate, Compressor::None] {
        let config = PackConfig { compressor, ..small_config() };
        let (_dir, pack, ann) = build_pack(&config);
        let retriever = open_retriever(&pack, &ann);
        let hits = retriever
            .search("quantum superposition", 2, &SearchOptions::default())
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].text.contains("superposition"));
    }
}
