#![deny(unsafe_code)]
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args
)]

//! # bamline - parallel sort/dedup engine for BAM streams
//!
//! This library implements the core of a read-processing engine for
//! block-compressed alignment files:
//!
//! - **[`reader`]** - record decoding with an adaptive background prefetch worker
//! - **[`sort`]** - external merge sort with spill-to-disk and k-way merge
//! - **[`dedup`]** - duplicate marking by library, unclipped 5' position and strand
//! - **[`pipeline`]** - producer/consumer stages over bounded channels
//! - **[`writer`]** - record encoding to single- or multi-threaded BGZF output
//!
//! The BGZF block codec itself is delegated to `noodles-bgzf`; everything
//! above the byte stream (record layout, header and reference directory,
//! virtual offsets, sorting, deduplication) lives here.
//!
//! ## Quick start
//!
//! ```no_run
//! use bamline_lib::reader::BamReader;
//! use bamline_lib::writer::BamWriter;
//!
//! # fn main() -> bamline_lib::errors::Result<()> {
//! let mut reader = BamReader::open("input.bam")?;
//! let mut writer = BamWriter::builder().create("output.bam", reader.header())?;
//! while let Some(record) = reader.next_record()? {
//!     writer.save(&record)?;
//! }
//! writer.finish()?;
//! # Ok(())
//! # }
//! ```

pub mod dedup;
pub mod errors;
pub mod header;
pub mod load;
pub mod logging;
pub mod pipeline;
pub mod reader;
pub mod record;
pub mod region;
pub mod sort;
pub mod validation;
pub mod virtual_offset;
pub mod writer;
