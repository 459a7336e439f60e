//! Header and reference directory codec.
//!
//! A header is the textual SAM header plus the ordered reference list, read
//! once at open time. The binary layout is the `BAM\x01` magic, the header
//! text, and a directory of `(name, length)` reference entries; records refer
//! to references by index into that directory.

use std::io::{self, Read, Write};

use ahash::AHashMap;
use bstr::BString;

use crate::errors::{BamlineError, Result};
use crate::sort::SortOrder;

/// Magic bytes at the start of the decompressed stream.
pub const BAM_MAGIC: &[u8; 4] = b"BAM\x01";

/// One reference sequence: name and length.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RefSeq {
    /// Reference sequence name.
    pub name: BString,
    /// Reference sequence length in bases.
    pub len: u32,
}

impl RefSeq {
    /// Create a reference entry.
    #[must_use]
    pub fn new(name: impl Into<BString>, len: u32) -> Self {
        Self { name: name.into(), len }
    }
}

/// The ordered reference directory.
pub type RefList = Vec<RefSeq>;

/// Textual SAM header plus the reference directory.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Header {
    text: String,
    refs: RefList,
}

impl Header {
    /// Create a header from text and references.
    #[must_use]
    pub fn new(text: impl Into<String>, refs: RefList) -> Self {
        Self { text: text.into(), refs }
    }

    /// The SAM header text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The reference directory.
    #[must_use]
    pub fn refs(&self) -> &[RefSeq] {
        &self.refs
    }

    /// Look up a reference id by name.
    #[must_use]
    pub fn ref_id(&self, name: &[u8]) -> Option<i32> {
        self.refs.iter().position(|r| r.name == name).map(|i| i as i32)
    }

    /// Parse the binary header from a decompressed stream.
    pub fn read_from<R: Read>(src: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_all(src, &mut magic)?;
        if &magic != BAM_MAGIC {
            return Err(BamlineError::format(format!(
                "bad magic: expected {BAM_MAGIC:?}, got {magic:?}"
            )));
        }

        let l_text = read_u32(src)? as usize;
        let mut text = vec![0u8; l_text];
        read_all(src, &mut text)?;
        // Some writers NUL-pad the text block.
        let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        let text = String::from_utf8_lossy(&text[..end]).into_owned();

        let n_ref = read_u32(src)? as usize;
        let mut refs = Vec::with_capacity(n_ref);
        for _ in 0..n_ref {
            let l_name = read_u32(src)? as usize;
            if l_name == 0 {
                return Err(BamlineError::format("reference with zero-length name"));
            }
            let mut name = vec![0u8; l_name];
            read_all(src, &mut name)?;
            name.pop(); // trailing NUL
            let len = read_u32(src)?;
            refs.push(RefSeq::new(name, len));
        }

        Ok(Self { text, refs })
    }

    /// Write the binary header to a stream.
    pub fn write_to<W: Write>(&self, dst: &mut W) -> io::Result<()> {
        dst.write_all(BAM_MAGIC)?;
        dst.write_all(&(self.text.len() as u32).to_le_bytes())?;
        dst.write_all(self.text.as_bytes())?;
        dst.write_all(&(self.refs.len() as u32).to_le_bytes())?;
        for r in &self.refs {
            dst.write_all(&(r.name.len() as u32 + 1).to_le_bytes())?;
            dst.write_all(&r.name)?;
            dst.write_all(&[0])?;
            dst.write_all(&r.len.to_le_bytes())?;
        }
        Ok(())
    }

    /// The sort order recorded on the `@HD` line.
    #[must_use]
    pub fn sort_order(&self) -> SortOrder {
        for line in self.text.lines() {
            if let Some(rest) = line.strip_prefix("@HD") {
                for field in rest.split('\t') {
                    if let Some(value) = field.strip_prefix("SO:") {
                        return match value {
                            "coordinate" => SortOrder::Coordinate,
                            "queryname" => SortOrder::Queryname,
                            _ => SortOrder::Unknown,
                        };
                    }
                }
            }
        }
        SortOrder::Unknown
    }

    /// Record a sort order on the `@HD` line, replacing any existing one.
    pub fn set_sort_order(&mut self, order: SortOrder) {
        let mut version = "1.6".to_string();
        let mut lines: Vec<String> = Vec::new();
        for line in self.text.lines() {
            if line.starts_with("@HD") {
                if let Some(vn) = line.split('\t').find_map(|f| f.strip_prefix("VN:")) {
                    version = vn.to_string();
                }
            } else {
                lines.push(line.to_string());
            }
        }
        let hd = format!("@HD\tVN:{version}\tSO:{}", order.as_sam_str());
        lines.insert(0, hd);
        self.text = lines.join("\n");
        self.text.push('\n');
    }

    /// Append an `@PG` line recording the program invocation.
    pub fn add_program_line(&mut self, version: &str, command_line: &str) {
        let mut id = String::from("bamline");
        let mut suffix = 0;
        while self.text.lines().any(|l| {
            l.starts_with("@PG") && l.split('\t').any(|f| f.strip_prefix("ID:") == Some(&id))
        }) {
            suffix += 1;
            id = format!("bamline.{suffix}");
        }
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.text
            .push_str(&format!("@PG\tID:{id}\tPN:bamline\tVN:{version}\tCL:{command_line}\n"));
    }

    /// Map of read group id to library name from the `@RG` lines.
    #[must_use]
    pub fn read_group_libraries(&self) -> AHashMap<BString, BString> {
        let mut out = AHashMap::new();
        for line in self.text.lines() {
            if !line.starts_with("@RG") {
                continue;
            }
            let mut id = None;
            let mut lb = None;
            for field in line.split('\t') {
                if let Some(v) = field.strip_prefix("ID:") {
                    id = Some(v);
                } else if let Some(v) = field.strip_prefix("LB:") {
                    lb = Some(v);
                }
            }
            if let (Some(id), Some(lb)) = (id, lb) {
                out.insert(BString::from(id), BString::from(lb));
            }
        }
        out
    }
}

fn read_all<R: Read>(src: &mut R, buf: &mut [u8]) -> Result<()> {
    src.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            BamlineError::format("truncated header")
        } else {
            BamlineError::io("Header::read", e)
        }
    })
}

fn read_u32<R: Read>(src: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_all(src, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
