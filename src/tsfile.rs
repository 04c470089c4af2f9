//! TSF: append-only binary log of fixed-size request records.
//!
//! Layout (little-endian): a fixed 4 KiB header holding magic, version,
//! four rotating superblocks `{count, write_time}` and a copy of the
//! schema, followed by a packed array of records. An append writes the
//! records first, then rewrites only the superblock region, rotating to
//! the next slot; a crash between the two leaves the previous superblock
//! pointing at a consistent prefix, so a reader that picks the latest
//! valid superblock never observes a torn tail.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::{self, TimeNs};

pub const TSF_MAGIC: [u8; 6] = *b"TSFILE";
pub const TSF_VERSION: u32 = 1;
pub const TSF_HEADER_SIZE: usize = 4096;

const SB_COUNT: usize = 4;
const SB_OFFSET: usize = 16;
const SB_SIZE: usize = 32;
const SB_WRITE_LEN: usize = 512;
const SCHEMA_OFFSET: usize = SB_OFFSET + SB_COUNT * SB_SIZE;

pub const MAX_FIELD_LEN: usize = 32;
pub const MAX_FIELD_COUNT: usize = 64;
const FIELD_ENC_SIZE: usize = MAX_FIELD_LEN + 12;

#[derive(Error, Debug)]
pub enum TsfError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("'{0}' is not a tsfile (bad magic or version)")]
    BadHeader(String),

    #[error("invalid schema: {0}")]
    BadSchema(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("no valid superblock in '{0}'")]
    NoSuperblock(String),

    #[error("range [{start}, {end}) outside the {count} stored records")]
    InvalidRange { start: u32, end: u32, count: u32 },

    #[error("data length {0} is not a multiple of the entry size")]
    BadLength(usize),

    #[error("file carries a sticky error from an earlier failed append")]
    Sticky,

    #[error("failed to write record data: {0}")]
    DataFail(std::io::Error),

    #[error("failed to update superblock: {0}")]
    SuperblockFail(std::io::Error),
}

pub type TsfResult<T> = std::result::Result<T, TsfError>;

/// Field type tags as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TsfFieldType {
    Bool,
    Int,
    Float,
    String,
}

impl TsfFieldType {
    fn to_tag(self) -> u32 {
        match self {
            TsfFieldType::Bool => 0,
            TsfFieldType::Int => 1,
            TsfFieldType::Float => 2,
            TsfFieldType::String => 3,
        }
    }

    fn from_tag(tag: u32) -> Option<TsfFieldType> {
        match tag {
            0 => Some(TsfFieldType::Bool),
            1 => Some(TsfFieldType::Int),
            2 => Some(TsfFieldType::Float),
            3 => Some(TsfFieldType::String),
            _ => None,
        }
    }
}

/// One record field: name, type, size and offset inside the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsfField {
    pub name: String,
    #[serde(rename = "type")]
    pub ftype: TsfFieldType,
    pub size: u32,
    pub offset: u32,
}

/// Record schema: entry size plus the packed field list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsfSchema {
    pub entry_size: u32,
    pub fields: Vec<TsfField>,
}

impl TsfSchema {
    /// Build a packed schema from `(name, type, size)` triples, assigning
    /// consecutive offsets.
    pub fn packed(fields: &[(&str, TsfFieldType, u32)]) -> TsfResult<TsfSchema> {
        let mut out = Vec::with_capacity(fields.len());
        let mut offset = 0u32;
        for (name, ftype, size) in fields {
            out.push(TsfField {
                name: (*name).to_string(),
                ftype: *ftype,
                size: *size,
                offset,
            });
            offset += size;
        }
        let schema = TsfSchema {
            entry_size: offset,
            fields: out,
        };
        schema.check()?;
        Ok(schema)
    }

    /// Validate field types, sizes and counts.
    pub fn check(&self) -> TsfResult<()> {
        if self.fields.is_empty() || self.fields.len() > MAX_FIELD_COUNT {
            return Err(TsfError::BadSchema(format!(
                "field count {} outside 1..={}",
                self.fields.len(),
                MAX_FIELD_COUNT
            )));
        }
        if self.entry_size == 0 {
            return Err(TsfError::BadSchema("zero entry size".into()));
        }
        for (fi, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() || field.name.len() >= MAX_FIELD_LEN {
                return Err(TsfError::BadSchema(format!(
                    "field #{fi} name length outside 1..{MAX_FIELD_LEN}"
                )));
            }
            match field.ftype {
                TsfFieldType::Bool => {
                    if field.size != 1 {
                        return Err(TsfError::BadSchema(format!(
                            "field #{fi}: boolean must have size 1"
                        )));
                    }
                }
                TsfFieldType::Int => {
                    if ![1, 2, 4, 8].contains(&field.size) {
                        return Err(TsfError::BadSchema(format!(
                            "field #{fi}: wrong size of integer"
                        )));
                    }
                }
                TsfFieldType::Float => {
                    if ![4, 8].contains(&field.size) {
                        return Err(TsfError::BadSchema(format!(
                            "field #{fi}: wrong size of float"
                        )));
                    }
                }
                TsfFieldType::String => {
                    if field.size == 0 {
                        return Err(TsfError::BadSchema(format!(
                            "field #{fi}: zero-size string"
                        )));
                    }
                }
            }
            if field.offset + field.size > self.entry_size {
                return Err(TsfError::BadSchema(format!(
                    "field #{fi} extends past the entry"
                )));
            }
        }
        Ok(())
    }

    /// Strict compatibility check on (entry size, field count, per-field
    /// name/type/size).
    fn validate_against(&self, expected: &TsfSchema) -> TsfResult<()> {
        if self.entry_size != expected.entry_size || self.fields.len() != expected.fields.len() {
            return Err(TsfError::SchemaMismatch(format!(
                "stored {} fields x {} bytes, expected {} fields x {} bytes",
                self.fields.len(),
                self.entry_size,
                expected.fields.len(),
                expected.entry_size
            )));
        }
        for (fi, (stored, want)) in self.fields.iter().zip(&expected.fields).enumerate() {
            if stored.name != want.name {
                return Err(TsfError::SchemaMismatch(format!("field #{fi}: name")));
            }
            if stored.ftype != want.ftype {
                return Err(TsfError::SchemaMismatch(format!("field #{fi}: type")));
            }
            if stored.ftype != TsfFieldType::Bool && stored.size != want.size {
                return Err(TsfError::SchemaMismatch(format!("field #{fi}: size")));
            }
        }
        Ok(())
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.entry_size.to_le_bytes());
        buf[4..8].copy_from_slice(&(self.fields.len() as u32).to_le_bytes());
        for (fi, field) in self.fields.iter().enumerate() {
            let off = 8 + fi * FIELD_ENC_SIZE;
            let name_buf = &mut buf[off..off + MAX_FIELD_LEN];
            name_buf.fill(0);
            name_buf[..field.name.len()].copy_from_slice(field.name.as_bytes());
            buf[off + 32..off + 36].copy_from_slice(&field.ftype.to_tag().to_le_bytes());
            buf[off + 36..off + 40].copy_from_slice(&field.size.to_le_bytes());
            buf[off + 40..off + 44].copy_from_slice(&field.offset.to_le_bytes());
        }
    }

    fn decode(buf: &[u8]) -> TsfResult<TsfSchema> {
        let entry_size = read_u32(buf, 0);
        let count = read_u32(buf, 4) as usize;
        if count == 0 || count > MAX_FIELD_COUNT {
            return Err(TsfError::BadSchema(format!("stored field count {count}")));
        }
        let mut fields = Vec::with_capacity(count);
        for fi in 0..count {
            let off = 8 + fi * FIELD_ENC_SIZE;
            let name_buf = &buf[off..off + MAX_FIELD_LEN];
            let name_len = name_buf.iter().position(|b| *b == 0).unwrap_or(MAX_FIELD_LEN);
            let name = String::from_utf8_lossy(&name_buf[..name_len]).into_owned();
            let tag = read_u32(buf, off + 32);
            let ftype = TsfFieldType::from_tag(tag)
                .ok_or_else(|| TsfError::BadSchema(format!("field #{fi}: unknown type {tag}")))?;
            let size = read_u32(buf, off + 36);
            let offset = read_u32(buf, off + 40);
            fields.push(TsfField {
                name,
                ftype,
                size,
                offset,
            });
        }
        let schema = TsfSchema { entry_size, fields };
        schema.check()?;
        Ok(schema)
    }
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_i64(buf: &[u8], off: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    i64::from_le_bytes(raw)
}

#[derive(Debug, Clone, Copy, Default)]
struct Superblock {
    count: u32,
    time: TimeNs,
}

struct TsfInner {
    file: File,
    header: Vec<u8>,
    schema: TsfSchema,
    sb: [Superblock; SB_COUNT],
    cur_sb: usize,
    sticky: bool,
    sync: bool,
}

impl TsfInner {
    fn patch_superblocks(&mut self) {
        for (sbi, sb) in self.sb.iter().enumerate() {
            let off = SB_OFFSET + sbi * SB_SIZE;
            self.header[off..off + 4].copy_from_slice(&sb.count.to_le_bytes());
            self.header[off + 8..off + 16].copy_from_slice(&sb.time.to_le_bytes());
        }
    }
}

/// An open time-series file. All operations are serialised on an internal
/// mutex; the file itself is not locked against other processes.
pub struct TsFile {
    inner: Mutex<TsfInner>,
}

impl TsFile {
    /// Create a fresh file with the given schema.
    pub fn create(path: &Path, schema: &TsfSchema, sync: bool) -> TsfResult<TsFile> {
        schema.check()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut header = vec![0u8; TSF_HEADER_SIZE];
        header[0..6].copy_from_slice(&TSF_MAGIC);
        header[8..12].copy_from_slice(&TSF_VERSION.to_le_bytes());
        schema.encode(&mut header[SCHEMA_OFFSET..]);

        let mut inner = TsfInner {
            file,
            header,
            schema: schema.clone(),
            sb: [Superblock::default(); SB_COUNT],
            cur_sb: 0,
            sticky: false,
            sync,
        };
        inner.sb[0] = Superblock {
            count: 0,
            time: time::now_wall(),
        };
        inner.patch_superblocks();
        inner.file.write_all(&inner.header)?;
        if sync {
            inner.file.sync_data()?;
        }

        Ok(TsFile {
            inner: Mutex::new(inner),
        })
    }

    /// Open an existing file, validating the header byte-for-byte and the
    /// stored schema against `expected`. The effective superblock is the
    /// one with the largest write time that does not lie in the future.
    pub fn open(path: &Path, expected: &TsfSchema, sync: bool) -> TsfResult<TsFile> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = vec![0u8; TSF_HEADER_SIZE];
        file.read_exact(&mut header)?;

        if header[0..6] != TSF_MAGIC
            || read_u32(&header, 8) != TSF_VERSION
        {
            return Err(TsfError::BadHeader(path.display().to_string()));
        }

        let schema = TsfSchema::decode(&header[SCHEMA_OFFSET..])?;
        schema.validate_against(expected)?;

        let mut sb = [Superblock::default(); SB_COUNT];
        for (sbi, slot) in sb.iter_mut().enumerate() {
            let off = SB_OFFSET + sbi * SB_SIZE;
            slot.count = read_u32(&header, off);
            slot.time = read_i64(&header, off + 8);
        }

        let now = time::now_wall();
        let mut cur_sb = None;
        for (sbi, slot) in sb.iter().enumerate() {
            if slot.time > 0 && slot.time <= now {
                match cur_sb {
                    None => cur_sb = Some(sbi),
                    Some(best) if slot.time > sb[best].time => cur_sb = Some(sbi),
                    _ => {}
                }
            }
        }
        let cur_sb =
            cur_sb.ok_or_else(|| TsfError::NoSuperblock(path.display().to_string()))?;

        Ok(TsFile {
            inner: Mutex::new(TsfInner {
                file,
                header,
                schema,
                sb,
                cur_sb,
                sticky: false,
                sync,
            }),
        })
    }

    /// Read only the stored schema of a file.
    pub fn read_schema(path: &Path) -> TsfResult<TsfSchema> {
        let mut file = File::open(path)?;
        let mut header = vec![0u8; TSF_HEADER_SIZE];
        file.read_exact(&mut header)?;
        if header[0..6] != TSF_MAGIC
            || read_u32(&header, 8) != TSF_VERSION
        {
            return Err(TsfError::BadHeader(path.display().to_string()));
        }
        TsfSchema::decode(&header[SCHEMA_OFFSET..])
    }

    pub fn schema(&self) -> TsfSchema {
        self.inner.lock().schema.clone()
    }

    /// Records currently visible through the effective superblock.
    pub fn count(&self) -> u32 {
        let inner = self.inner.lock();
        inner.sb[inner.cur_sb].count
    }

    /// Append packed records. Data goes in first, then the next superblock
    /// slot is written; an I/O failure leaves a sticky error and further
    /// appends fail until the file is reopened.
    pub fn append(&self, entries: &[u8]) -> TsfResult<()> {
        let mut inner = self.inner.lock();

        if inner.sticky {
            return Err(TsfError::Sticky);
        }
        let entry_size = inner.schema.entry_size as usize;
        if entries.is_empty() || entries.len() % entry_size != 0 {
            return Err(TsfError::BadLength(entries.len()));
        }
        let count = (entries.len() / entry_size) as u32;
        let cur_count = inner.sb[inner.cur_sb].count;

        let end = TSF_HEADER_SIZE as u64 + cur_count as u64 * entry_size as u64;
        let write_data = |inner: &mut TsfInner| -> std::io::Result<()> {
            inner.file.seek(SeekFrom::Start(end))?;
            inner.file.write_all(entries)?;
            if inner.sync {
                inner.file.sync_data()?;
            }
            Ok(())
        };
        if let Err(err) = write_data(&mut inner) {
            inner.sticky = true;
            return Err(TsfError::DataFail(err));
        }

        inner.cur_sb = (inner.cur_sb + 1) % SB_COUNT;
        let cur_sb = inner.cur_sb;
        inner.sb[cur_sb] = Superblock {
            count: cur_count + count,
            time: time::now_wall(),
        };
        inner.patch_superblocks();

        let write_sb = |inner: &mut TsfInner| -> std::io::Result<()> {
            inner.file.seek(SeekFrom::Start(0))?;
            let sb_region = inner.header[..SB_WRITE_LEN].to_vec();
            inner.file.write_all(&sb_region)?;
            if inner.sync {
                inner.file.sync_data()?;
            }
            Ok(())
        };
        if let Err(err) = write_sb(&mut inner) {
            inner.sticky = true;
            return Err(TsfError::SuperblockFail(err));
        }

        Ok(())
    }

    /// Read records `[start, end)` as packed bytes. Reading past the
    /// effective superblock's count fails.
    pub fn read(&self, start: u32, end: u32) -> TsfResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let cur_count = inner.sb[inner.cur_sb].count;
        if start >= end || end > cur_count {
            return Err(TsfError::InvalidRange {
                start,
                end,
                count: cur_count,
            });
        }
        let entry_size = inner.schema.entry_size as usize;
        let off = TSF_HEADER_SIZE as u64 + start as u64 * entry_size as u64;
        let mut buf = vec![0u8; (end - start) as usize * entry_size];
        inner.file.seek(SeekFrom::Start(off))?;
        inner.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    fn schema() -> TsfSchema {
        TsfSchema::packed(&[
            ("step", TsfFieldType::Int, 4),
            ("request", TsfFieldType::Int, 4),
            ("sched", TsfFieldType::Int, 8),
            ("ok", TsfFieldType::Bool, 1),
        ])
        .unwrap()
    }

    fn record(step: u32, request: u32, sched: i64, ok: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&step.to_le_bytes());
        buf.extend_from_slice(&request.to_le_bytes());
        buf.extend_from_slice(&sched.to_le_bytes());
        buf.push(ok as u8);
        buf
    }

    #[test]
    fn test_create_append_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w1.tsf");
        let file = TsFile::create(&path, &schema(), false).unwrap();

        let mut batch = Vec::new();
        for i in 0..10u32 {
            batch.extend_from_slice(&record(0, i, i as i64 * 1000, true));
        }
        file.append(&batch).unwrap();
        assert_eq!(file.count(), 10);

        let back = file.read(0, 10).unwrap();
        assert_eq!(back, batch);
        drop(file);

        let reopened = TsFile::open(&path, &schema(), false).unwrap();
        assert_eq!(reopened.count(), 10);
        assert_eq!(reopened.read(0, 10).unwrap(), batch);
    }

    #[test]
    fn test_schema_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w1.tsf");
        let s = schema();
        TsFile::create(&path, &s, false).unwrap();
        assert_eq!(TsFile::read_schema(&path).unwrap(), s);
    }

    #[test]
    fn test_read_past_count_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w1.tsf");
        let file = TsFile::create(&path, &schema(), false).unwrap();
        file.append(&record(0, 0, 0, true)).unwrap();

        assert!(matches!(
            file.read(0, 2),
            Err(TsfError::InvalidRange { .. })
        ));
        assert!(matches!(
            file.read(1, 1),
            Err(TsfError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_schema_mismatch_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w1.tsf");
        TsFile::create(&path, &schema(), false).unwrap();

        let other = TsfSchema::packed(&[("step", TsfFieldType::Int, 4)]).unwrap();
        assert!(matches!(
            TsFile::open(&path, &other, false),
            Err(TsfError::SchemaMismatch(_))
        ));

        let renamed = TsfSchema::packed(&[
            ("step", TsfFieldType::Int, 4),
            ("rq", TsfFieldType::Int, 4),
            ("sched", TsfFieldType::Int, 8),
            ("ok", TsfFieldType::Bool, 1),
        ])
        .unwrap();
        assert!(matches!(
            TsFile::open(&path, &renamed, false),
            Err(TsfError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w1.tsf");
        std::fs::write(&path, vec![0u8; TSF_HEADER_SIZE]).unwrap();
        assert!(matches!(
            TsFile::open(&path, &schema(), false),
            Err(TsfError::BadHeader(_))
        ));
    }

    #[test]
    fn test_invalid_schemas_rejected() {
        // Wrong int size.
        assert!(TsfSchema::packed(&[("a", TsfFieldType::Int, 3)]).is_err());
        // Wrong float size.
        assert!(TsfSchema::packed(&[("a", TsfFieldType::Float, 2)]).is_err());
        // Empty.
        assert!(TsfSchema::packed(&[]).is_err());
        // Name too long.
        let long = "x".repeat(MAX_FIELD_LEN);
        assert!(TsfSchema::packed(&[(long.as_str(), TsfFieldType::Int, 4)]).is_err());
    }

    #[test]
    fn test_crash_between_data_and_superblock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w1.tsf");

        let mut batches = Vec::new();
        {
            let file = TsFile::create(&path, &schema(), false).unwrap();
            for step in 0..3u32 {
                let mut batch = Vec::new();
                for i in 0..100u32 {
                    batch.extend_from_slice(&record(step, i, i as i64, true));
                }
                if step == 1 {
                    // Snapshot the superblock region after the second batch.
                    file.append(&batch).unwrap();
                    batches.push(batch);
                    continue;
                }
                file.append(&batch).unwrap();
                batches.push(batch);
            }
        }

        // Simulate a crash after batch 3's records hit the disk but before
        // its superblock did: restore the superblock region to its state
        // after batch 2.
        let snapshot = {
            let file = TsFile::open(&path, &schema(), false).unwrap();
            assert_eq!(file.count(), 300);
            // Re-build the after-batch-2 superblock region by rolling a
            // fresh file through the first two appends.
            let copy_path = dir.path().join("copy.tsf");
            let copy = TsFile::create(&copy_path, &schema(), false).unwrap();
            copy.append(&batches[0]).unwrap();
            copy.append(&batches[1]).unwrap();
            drop(copy);
            let mut buf = vec![0u8; SB_WRITE_LEN];
            let mut f = File::open(&copy_path).unwrap();
            f.read_exact(&mut buf).unwrap();
            buf
        };
        {
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(0)).unwrap();
            f.write_all(&snapshot).unwrap();
        }

        let file = TsFile::open(&path, &schema(), false).unwrap();
        assert_eq!(file.count(), 200);
        let back = file.read(0, 200).unwrap();
        let mut expect = batches[0].clone();
        expect.extend_from_slice(&batches[1]);
        assert_eq!(back, expect);
        // Record 200 is not observable.
        assert!(matches!(
            file.read(200, 201),
            Err(TsfError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_future_superblock_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w1.tsf");
        let file = TsFile::create(&path, &schema(), false).unwrap();
        file.append(&record(0, 0, 0, true)).unwrap();
        file.append(&record(0, 1, 1, true)).unwrap();
        drop(file);

        // Push the latest superblock's timestamp into the future; the
        // reader must fall back to the previous one.
        let far_future = time::now_wall() + 3600 * crate::time::T_SEC;
        {
            let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let mut header = vec![0u8; TSF_HEADER_SIZE];
            f.read_exact(&mut header).unwrap();
            // Slot 2 holds count=2 (created at slot 0, two appends rotate to 1 then 2).
            let off = SB_OFFSET + 2 * SB_SIZE;
            header[off + 8..off + 16].copy_from_slice(&far_future.to_le_bytes());
            f.seek(SeekFrom::Start(0)).unwrap();
            f.write_all(&header[..SB_WRITE_LEN]).unwrap();
        }

        let file = TsFile::open(&path, &schema(), false).unwrap();
        assert_eq!(file.count(), 1);
    }

    #[test]
    fn test_append_after_reopen_continues() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w1.tsf");
        {
            let file = TsFile::create(&path, &schema(), false).unwrap();
            file.append(&record(0, 0, 0, true)).unwrap();
        }
        {
            let file = TsFile::open(&path, &schema(), false).unwrap();
            file.append(&record(0, 1, 5, false)).unwrap();
            assert_eq!(file.count(), 2);
        }
        let file = TsFile::open(&path, &schema(), false).unwrap();
        assert_eq!(file.count(), 2);
        let back = file.read(1, 2).unwrap();
        assert_eq!(back, record(0, 1, 5, false));
    }

    #[test]
    fn test_bad_length_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w1.tsf");
        let file = TsFile::create(&path, &schema(), false).unwrap();
        assert!(matches!(
            file.append(&[0u8; 7]),
            Err(TsfError::BadLength(7))
        ));
        assert!(matches!(file.append(&[]), Err(TsfError::BadLength(0))));
    }
}
