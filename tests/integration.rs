//! End-to-end scenarios over real files: sort in memory and across spills,
//! region filtering, duplicate removal, prefetch under load, and the full
//! split/dedup/merge pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bamline_lib::dedup::{DedupConfig, MarkDuplicates};
use bamline_lib::header::{Header, RefSeq};
use bamline_lib::load::FixedLoadProbe;
use bamline_lib::pipeline::{
    DedupStage, Pipeline, ReaderStage, ReaderStageOptions, SortStage, SortedMerge,
    SplitByChromosome, WriterStage, record_channel,
};
use bamline_lib::reader::BamReader;
use bamline_lib::record::{Cigar, CigarOp, CigarOpKind, Record, RecordBuilder, flags};
use bamline_lib::region::Region;
use bamline_lib::sort::{
    CoordinateKey, ExternalSorter, QuerynameKey, SortOrder, SorterConfig, new_sort_pool,
};
use bamline_lib::writer::{BamWriter, CompressionMode};
use tempfile::TempDir;

fn three_ref_header() -> Header {
    Header::new(
        "@HD\tVN:1.6\n@RG\tID:rg1\tLB:libA\n",
        vec![
            RefSeq::new("chr1", 1_000_000),
            RefSeq::new("chr2", 1_000_000),
            RefSeq::new("chr3", 1_000_000),
        ],
    )
}

fn mapped(name: &str, ref_id: i32, pos: i32, qual: u8) -> Record {
    RecordBuilder::new()
        .name(name)
        .mapped(ref_id, pos)
        .mapping_quality(40)
        .cigar(Cigar::from_ops(vec![CigarOp::new(CigarOpKind::Match, 4)]))
        .sequence("ACGT", &[qual; 4])
        .build()
        .unwrap()
}

fn write_bam(path: &Path, header: &Header, records: &[Record]) {
    let mut writer = BamWriter::builder().create(path, header).unwrap();
    for record in records {
        writer.save(record).unwrap();
    }
    writer.finish().unwrap();
}

fn read_bam(path: &Path) -> Vec<Record> {
    let mut reader = BamReader::open(path).unwrap();
    reader.records().map(|r| r.unwrap()).collect()
}

fn sort_file(input: &Path, output: &Path, order: SortOrder, threads: usize, buffer: usize) {
    let (read_tx, read_rx) = record_channel();
    let (sorted_tx, sorted_rx) = record_channel();

    let options = ReaderStageOptions {
        prefetch: threads > 1,
        probe: Arc::new(FixedLoadProbe(0.0)),
        ..ReaderStageOptions::default()
    };
    let reader = ReaderStage::new(&[input.to_path_buf()], options, read_tx).unwrap();
    let header = reader.header();

    let pool = if threads > 1 { Some(new_sort_pool(threads).unwrap()) } else { None };
    let config = SorterConfig { max_buffer_count: buffer, ..SorterConfig::default() };
    let writer = WriterStage::new(sorted_rx, output.to_path_buf(), Arc::clone(&header))
        .sort_order(order);

    let pipeline = Pipeline::new().add(reader);
    let pipeline = match order {
        SortOrder::Queryname => {
            let sorter: ExternalSorter<QuerynameKey> =
                ExternalSorter::new(header, None, pool, config).unwrap();
            pipeline.add(SortStage::new(read_rx, sorted_tx, sorter))
        }
        _ => {
            let sorter: ExternalSorter<CoordinateKey> =
                ExternalSorter::new(header, None, pool, config).unwrap();
            pipeline.add(SortStage::new(read_rx, sorted_tx, sorter))
        }
    };
    pipeline.add(writer).run_chain().unwrap();
}

#[test]
fn scenario_sort_by_position_in_memory() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.bam");
    let output = dir.path().join("out.bam");
    let header = three_ref_header();
    write_bam(
        &input,
        &header,
        &[mapped("a", 0, 100, 30), mapped("b", 0, 50, 30), mapped("c", 1, 10, 30)],
    );

    sort_file(&input, &output, SortOrder::Coordinate, 1, 500_000);

    let sorted = read_bam(&output);
    let positions: Vec<(i32, i32)> = sorted.iter().map(|r| (r.ref_id(), r.position())).collect();
    assert_eq!(positions, vec![(0, 50), (0, 100), (1, 10)]);

    let out_header = BamReader::open(&output).unwrap().header().clone();
    assert_eq!(out_header.sort_order(), SortOrder::Coordinate);
}

#[test]
fn scenario_sort_by_name_with_spills() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.bam");
    let output = dir.path().join("out.bam");
    let header = three_ref_header();
    let records: Vec<Record> =
        ["b", "a", "d", "c", "a"].iter().map(|n| mapped(n, 0, 1, 30)).collect();
    write_bam(&input, &header, &records);

    // buffer=2 forces multiple spilled runs; 4 threads exercise the pool.
    sort_file(&input, &output, SortOrder::Queryname, 4, 2);

    let names: Vec<String> = read_bam(&output).iter().map(|r| r.name().to_string()).collect();
    assert_eq!(names, vec!["a", "a", "b", "c", "d"]);
}

#[test]
fn scenario_region_filter() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.bam");
    let header = three_ref_header();
    write_bam(
        &input,
        &header,
        &[
            mapped("a", 0, 50, 30),
            mapped("b", 0, 150, 30),
            mapped("c", 0, 250, 30),
            mapped("d", 1, 50, 30),
        ],
    );

    let mut reader = BamReader::open(&input).unwrap();
    reader.set_region(Region::new(0, 100, 200)).unwrap();
    let hits: Vec<Record> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].position(), 150);
}

#[test]
fn scenario_dedup_remove_keeps_best() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.bam");
    let output = dir.path().join("out.bam");
    let header = three_ref_header();
    // Summed qualities 100 vs 80 at the same (ref, pos, strand).
    write_bam(&input, &header, &[mapped("q80", 0, 100, 20), mapped("q100", 0, 100, 25)]);

    let (read_tx, read_rx) = record_channel();
    let (dedup_tx, dedup_rx) = record_channel();
    let reader =
        ReaderStage::new(&[input], ReaderStageOptions::default(), read_tx).unwrap();
    let shared = reader.header();
    let engine = MarkDuplicates::new(Arc::clone(&shared), DedupConfig::removing(None));

    Pipeline::new()
        .add(reader)
        .add(DedupStage::new(read_rx, dedup_tx, engine))
        .add(WriterStage::new(dedup_rx, output.clone(), shared))
        .run_chain()
        .unwrap();

    let out = read_bam(&output);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name(), "q100");
}

#[test]
fn scenario_prefetch_under_mocked_load() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.bam");
    let header = three_ref_header();
    let records: Vec<Record> =
        (0..10_000).map(|i| mapped(&format!("r{i}"), 0, i, 30)).collect();
    write_bam(&input, &header, &records);

    let mut reader = BamReader::builder()
        .prefetch(true)
        .load_probe(Arc::new(FixedLoadProbe(100.0)))
        .open(&input)
        .unwrap();
    let read: Vec<Record> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(read.len(), 10_000);
    assert_eq!(read, records);
}

#[test]
fn scenario_split_dedup_merge_pipeline() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.bam");
    let output = dir.path().join("out.bam");
    let header = three_ref_header();

    // Coordinate-sorted interleaving across three references, with one
    // duplicate candidate per reference.
    let mut records = Vec::new();
    for pos in (0..300).step_by(10) {
        for ref_id in 0..3 {
            records.push(mapped(&format!("r{ref_id}_{pos}"), ref_id, pos, 30));
        }
    }
    for ref_id in 0..3 {
        records.push(mapped(&format!("dup{ref_id}"), ref_id, 0, 10));
    }
    write_bam(&input, &header, &records);

    let (read_tx, read_rx) = record_channel();
    let (merged_tx, merged_rx) = record_channel();
    let reader =
        ReaderStage::new(&[input], ReaderStageOptions::default(), read_tx).unwrap();
    let shared = reader.header();

    let (split, lane_rxs) = SplitByChromosome::new(read_rx, 3);
    let mut pipeline = Pipeline::new().add(reader).add(split);
    let mut dedup_rxs = Vec::new();
    for lane_rx in lane_rxs {
        let (lane_tx, dedup_rx) = record_channel();
        let engine =
            MarkDuplicates::new(Arc::clone(&shared), DedupConfig::removing(None));
        pipeline = pipeline.add(DedupStage::new(lane_rx, lane_tx, engine));
        dedup_rxs.push(dedup_rx);
    }
    pipeline
        .add(SortedMerge::new(dedup_rxs, merged_tx, SortOrder::Coordinate))
        .add(
            WriterStage::new(merged_rx, output.clone(), shared)
                .sort_order(SortOrder::Coordinate),
        )
        .run_chain()
        .unwrap();

    let out = read_bam(&output);
    // The three low-quality duplicates at position 0 were removed.
    assert_eq!(out.len(), records.len() - 3);
    assert!(out.iter().all(|r| !r.name().to_string().starts_with("dup")));

    // Output is globally coordinate-sorted.
    let keys: Vec<(i32, i32)> = out.iter().map(|r| (r.ref_id(), r.position())).collect();
    let mut sorted_keys = keys.clone();
    sorted_keys.sort_unstable();
    assert_eq!(keys, sorted_keys);
}

#[test]
fn file_round_trip_is_bit_exact() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rt.bam");
    let header = three_ref_header();

    let records = vec![
        mapped("plain", 0, 10, 30),
        RecordBuilder::new()
            .name("fancy")
            .mapped(2, 999)
            .mapping_quality(17)
            .flags(flags::PAIRED | flags::FIRST_IN_PAIR | flags::REVERSE)
            .cigar(Cigar::from_ops(vec![
                CigarOp::new(CigarOpKind::SoftClip, 1),
                CigarOp::new(CigarOpKind::Match, 3),
                CigarOp::new(CigarOpKind::Insertion, 2),
                CigarOp::new(CigarOpKind::Match, 1),
            ]))
            .sequence("ACGTACG", &[1, 2, 3, 4, 5, 6, 7])
            .mate(1, 5000)
            .insert_size(-250)
            .string_tag(*b"RG", "rg1")
            .string_tag(*b"XS", "extra")
            .build()
            .unwrap(),
        RecordBuilder::new().name("unmapped").build().unwrap(),
    ];
    write_bam(&path, &header, &records);

    let got = read_bam(&path);
    assert_eq!(got, records);

    let reader = BamReader::open(&path).unwrap();
    assert_eq!(reader.header(), &header);
}

#[test]
fn sort_output_survives_resort() {
    // Sorting an already-sorted file changes nothing.
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.bam");
    let once = dir.path().join("once.bam");
    let twice = dir.path().join("twice.bam");
    let header = three_ref_header();
    let records: Vec<Record> = (0..200)
        .map(|i| mapped(&format!("r{i}"), (i % 3) as i32, ((i * 37) % 500) as i32, 30))
        .collect();
    write_bam(&input, &header, &records);

    sort_file(&input, &once, SortOrder::Coordinate, 2, 16);
    sort_file(&once, &twice, SortOrder::Coordinate, 2, 16);

    assert_eq!(read_bam(&once), read_bam(&twice));
}

#[test]
fn compressed_temp_files_round_trip() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.bam");
    let output = dir.path().join("out.bam");
    let header = three_ref_header();
    let records: Vec<Record> =
        (0..50).map(|i| mapped(&format!("r{i}"), 0, 500 - i, 30)).collect();
    write_bam(&input, &header, &records);

    let (read_tx, read_rx) = record_channel();
    let (sorted_tx, sorted_rx) = record_channel();
    let reader =
        ReaderStage::new(&[input], ReaderStageOptions::default(), read_tx).unwrap();
    let shared = reader.header();
    let config = SorterConfig {
        max_buffer_count: 8,
        temp_compression: CompressionMode::Level(1),
        ..SorterConfig::default()
    };
    let sorter: ExternalSorter<CoordinateKey> =
        ExternalSorter::new(Arc::clone(&shared), Some(dir.path()), None, config).unwrap();

    Pipeline::new()
        .add(reader)
        .add(SortStage::new(read_rx, sorted_tx, sorter))
        .add(WriterStage::new(sorted_rx, output.clone(), shared).sort_order(SortOrder::Coordinate))
        .run_chain()
        .unwrap();

    let positions: Vec<i32> = read_bam(&output).iter().map(Record::position).collect();
    let mut expected: Vec<i32> = (0..50).map(|i| 500 - i).collect();
    expected.sort_unstable();
    assert_eq!(positions, expected);
}

#[test]
fn multi_input_sort_concatenates_then_orders() {
    let dir = TempDir::new().unwrap();
    let in1 = dir.path().join("a.bam");
    let in2 = dir.path().join("b.bam");
    let output = dir.path().join("out.bam");
    let header = three_ref_header();
    write_bam(&in1, &header, &[mapped("a", 1, 10, 30), mapped("b", 0, 90, 30)]);
    write_bam(&in2, &header, &[mapped("c", 0, 20, 30)]);

    let (read_tx, read_rx) = record_channel();
    let (sorted_tx, sorted_rx) = record_channel();
    let reader =
        ReaderStage::new(&[in1, in2], ReaderStageOptions::default(), read_tx).unwrap();
    let shared = reader.header();
    let sorter: ExternalSorter<CoordinateKey> =
        ExternalSorter::new(Arc::clone(&shared), None, None, SorterConfig::default()).unwrap();

    Pipeline::new()
        .add(reader)
        .add(SortStage::new(read_rx, sorted_tx, sorter))
        .add(WriterStage::new(sorted_rx, output.clone(), shared).sort_order(SortOrder::Coordinate))
        .run_chain()
        .unwrap();

    let names: Vec<String> =
        read_bam(&output).iter().map(|r| r.name().to_string()).collect();
    assert_eq!(names, vec!["c", "b", "a"]);
}

#[test]
fn dedup_marks_in_place_without_remove() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.bam");
    let output = dir.path().join("out.bam");
    let header = three_ref_header();
    write_bam(&input, &header, &[mapped("keep", 0, 100, 30), mapped("dup", 0, 100, 10)]);

    let (read_tx, read_rx) = record_channel();
    let (dedup_tx, dedup_rx) = record_channel();
    let reader =
        ReaderStage::new(&[input], ReaderStageOptions::default(), read_tx).unwrap();
    let shared = reader.header();
    let engine = MarkDuplicates::new(Arc::clone(&shared), DedupConfig::marking(None));

    Pipeline::new()
        .add(reader)
        .add(DedupStage::new(read_rx, dedup_tx, engine))
        .add(WriterStage::new(dedup_rx, output.clone(), shared))
        .run_chain()
        .unwrap();

    let out = read_bam(&output);
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].name(), "keep");
    assert!(!out[0].is_duplicate());
    assert_eq!(out[1].name(), "dup");
    assert!(out[1].is_duplicate());
}

#[test]
fn writer_records_program_line() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.bam");
    let output = dir.path().join("out.bam");
    let header = three_ref_header();
    write_bam(&input, &header, &[mapped("a", 0, 1, 30)]);

    let (read_tx, read_rx) = record_channel();
    let reader =
        ReaderStage::new(&[input], ReaderStageOptions::default(), read_tx).unwrap();
    let shared = reader.header();
    Pipeline::new()
        .add(reader)
        .add(
            WriterStage::new(read_rx, output.clone(), shared)
                .program_line("0.2.0", "bamline sort --out out.bam in.bam"),
        )
        .run_chain()
        .unwrap();

    let out_header = BamReader::open(&output).unwrap().header().clone();
    assert!(out_header.text().contains("@PG\tID:bamline"));
    assert!(out_header.text().contains("CL:bamline sort --out out.bam in.bam"));
}

#[test]
fn seek_tell_round_trip_through_file() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.bam");
    let header = three_ref_header();
    let records: Vec<Record> =
        (0..300).map(|i| mapped(&format!("r{i}"), 0, i, 30)).collect();
    write_bam(&input, &header, &records);

    let mut reader = BamReader::open(&input).unwrap();
    let mut offsets: Vec<(bamline_lib::virtual_offset::VirtualOffset, String)> = Vec::new();
    loop {
        let offset = reader.tell();
        match reader.next_record().unwrap() {
            Some(record) => offsets.push((offset, record.name().to_string())),
            None => break,
        }
    }

    // Seeking to any recorded offset replays the stream from that record.
    for probe in [0usize, 100, 299] {
        let (offset, ref name) = offsets[probe];
        reader.seek(offset).unwrap();
        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(&record.name().to_string(), name);
    }
}

#[test]
fn pipeline_surfaces_writer_errors() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.bam");
    let header = three_ref_header();
    write_bam(&input, &header, &[mapped("a", 0, 1, 30)]);

    let (read_tx, read_rx) = record_channel();
    let reader =
        ReaderStage::new(&[input], ReaderStageOptions::default(), read_tx).unwrap();
    let shared = reader.header();
    let bogus: PathBuf = dir.path().join("no_such_dir").join("out.bam");
    let err = Pipeline::new()
        .add(reader)
        .add(WriterStage::new(read_rx, bogus, shared))
        .run_chain()
        .unwrap_err();
    assert!(err.to_string().contains("BamWriter::open"));
}
