//! Segment descriptors and the committed segment set.
//!
//! Every commit writes a new `segments_<gen>` file (generation in base 36)
//! describing the whole index:
//!
//! ```text
//! u32 format | u64 version | u32 counter | field infos | vint segment_count
//! per segment:
//!   string name | u32 doc_count | u64 del_gen
//!   vint norm_gen_count | u64 norm_gen...
//!   u8 uses_compound_file
//! u32 crc32 of everything above
//! ```
//!
//! The file is written under a `pending_` name and renamed into place, so a
//! `segments_<gen>` file is either complete or absent.

use crate::error::{LucernaError, Result};
use crate::index::field_infos::FieldInfos;
use crate::index::postings::{frq_file, prx_file};
use crate::index::stored_fields::{fdt_file, fdx_file};
use crate::index::term_dictionary::{tii_file, tis_file};
use crate::index::term_vectors::{tvd_file, tvf_file, tvx_file};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

pub const SEGMENTS_FORMAT: u32 = 1;
pub const SEGMENTS_PREFIX: &str = "segments_";
const PENDING_PREFIX: &str = "pending_";

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

pub fn from_base36(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    u64::from_str_radix(text, 36).ok()
}

/// `segments_<gen>`.
pub fn segments_file_name(generation: u64) -> String {
    format!("{SEGMENTS_PREFIX}{}", to_base36(generation))
}

/// Generation of a segments file name, if `name` is one.
pub fn generation_of(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENTS_PREFIX).and_then(from_base36)
}

/// Descriptor of one committed segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    pub name: String,
    pub doc_count: u32,
    /// 0 means no deletions file.
    pub del_gen: u64,
    /// Per field number, 0 means the norms written with the segment.
    pub norm_gens: Vec<u64>,
    pub uses_compound_file: bool,
}

impl SegmentInfo {
    pub fn new<S: Into<String>>(name: S, doc_count: u32, uses_compound_file: bool) -> Self {
        SegmentInfo {
            name: name.into(),
            doc_count,
            del_gen: 0,
            norm_gens: Vec::new(),
            uses_compound_file,
        }
    }

    pub fn has_deletions(&self) -> bool {
        self.del_gen > 0
    }

    /// Current deletions file, if any.
    pub fn del_file_name(&self) -> Option<String> {
        self.has_deletions()
            .then(|| format!("{}_{}.del", self.name, to_base36(self.del_gen)))
    }

    /// Bump the deletions generation and return the new file name.
    pub fn advance_del_gen(&mut self) -> String {
        self.del_gen += 1;
        format!("{}_{}.del", self.name, to_base36(self.del_gen))
    }

    pub fn norm_gen(&self, field_num: u32) -> u64 {
        self.norm_gens.get(field_num as usize).copied().unwrap_or(0)
    }

    pub fn has_separate_norms(&self, field_num: u32) -> bool {
        self.norm_gen(field_num) > 0
    }

    /// Norms file written with the segment for `field_num`.
    pub fn original_norm_file_name(&self, field_num: u32) -> String {
        format!("{}.f{field_num}", self.name)
    }

    /// Current norms file of `field_num`.
    pub fn norm_file_name(&self, field_num: u32) -> String {
        match self.norm_gen(field_num) {
            0 => self.original_norm_file_name(field_num),
            generation => format!("{}_{}.s{field_num}", self.name, to_base36(generation)),
        }
    }

    /// Bump the norms generation of `field_num` and return the new file name.
    pub fn advance_norm_gen(&mut self, field_num: u32) -> String {
        let index = field_num as usize;
        if self.norm_gens.len() <= index {
            self.norm_gens.resize(index + 1, 0);
        }
        self.norm_gens[index] += 1;
        self.norm_file_name(field_num)
    }

    pub fn has_any_separate_norms(&self) -> bool {
        self.norm_gens.iter().any(|generation| *generation > 0)
    }

    pub fn compound_file_name(&self) -> String {
        format!("{}.cfs", self.name)
    }

    /// Files written with the segment, before any compound packaging.
    pub fn component_files(&self, storage: &dyn Storage, field_infos: &FieldInfos) -> Vec<String> {
        let mut files = vec![
            tis_file(&self.name),
            tii_file(&self.name),
            frq_file(&self.name),
            prx_file(&self.name),
            fdx_file(&self.name),
            fdt_file(&self.name),
        ];
        for name in [tvx_file(&self.name), tvd_file(&self.name), tvf_file(&self.name)] {
            if storage.file_exists(&name) {
                files.push(name);
            }
        }
        for info in field_infos.iter().filter(|info| info.has_norms()) {
            let name = self.original_norm_file_name(info.number);
            if storage.file_exists(&name) {
                files.push(name);
            }
        }
        files
    }

    /// Every file this segment references in `storage`.
    pub fn files(&self, storage: &dyn Storage, field_infos: &FieldInfos) -> Vec<String> {
        let mut files = if self.uses_compound_file {
            vec![self.compound_file_name()]
        } else {
            self.component_files(storage, field_infos)
        };
        if let Some(del) = self.del_file_name() {
            files.push(del);
        }
        for (field_num, generation) in self.norm_gens.iter().enumerate() {
            if *generation > 0 {
                files.push(self.norm_file_name(field_num as u32));
            }
        }
        files
    }
}

/// The committed segment set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentInfos {
    /// Source of new segment names.
    pub counter: u32,
    /// Bumped on every commit.
    pub version: u64,
    /// Generation of the segments file this set was read from or written to.
    pub generation: u64,
    pub field_infos: FieldInfos,
    pub segments: Vec<SegmentInfo>,
}

impl SegmentInfos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next segment name, `_` plus the counter in base 36.
    pub fn next_segment_name(&mut self) -> String {
        let name = format!("_{}", to_base36(self.counter as u64));
        self.counter += 1;
        name
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.segments.iter()
    }

    /// Documents in all segments, deleted ones included.
    pub fn max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.doc_count as u64).sum()
    }

    pub fn segments_file_name(&self) -> String {
        segments_file_name(self.generation)
    }

    /// Highest committed generation in `storage`.
    pub fn latest_generation(storage: &dyn Storage) -> Result<Option<u64>> {
        Ok(storage
            .list_files()?
            .iter()
            .filter_map(|name| generation_of(name))
            .max())
    }

    /// Read the newest segments file.
    pub fn read_latest(storage: &dyn Storage) -> Result<SegmentInfos> {
        match Self::latest_generation(storage)? {
            Some(generation) => Self::read(storage, generation),
            None => Err(LucernaError::storage(format!(
                "no {SEGMENTS_PREFIX}* file found, index does not exist"
            ))),
        }
    }

    /// Read `segments_<generation>`, verifying its checksum.
    pub fn read(storage: &dyn Storage, generation: u64) -> Result<SegmentInfos> {
        let name = segments_file_name(generation);
        let mut reader = StructReader::open(storage, &name)?;

        let format = reader.read_u32()?;
        if format != SEGMENTS_FORMAT {
            return Err(LucernaError::unsupported(format!(
                "{name} has format {format}, expected {SEGMENTS_FORMAT}"
            )));
        }
        let version = reader.read_u64()?;
        let counter = reader.read_u32()?;
        let field_infos = FieldInfos::read_from(&mut reader)?;

        let count = reader.read_vint()?;
        let mut segments = Vec::with_capacity(reader.capacity_for(count as u64));
        for _ in 0..count {
            let segment_name = reader.read_string()?;
            let doc_count = reader.read_u32()?;
            let del_gen = reader.read_u64()?;
            let norm_count = reader.read_vint()?;
            let mut norm_gens = Vec::with_capacity(reader.capacity_for(norm_count as u64));
            for _ in 0..norm_count {
                norm_gens.push(reader.read_u64()?);
            }
            let uses_compound_file = match reader.read_u8()? {
                0 => false,
                1 => true,
                other => {
                    return Err(LucernaError::corrupt(format!(
                        "bad compound flag {other} for {segment_name} in {name}"
                    )));
                }
            };
            segments.push(SegmentInfo {
                name: segment_name,
                doc_count,
                del_gen,
                norm_gens,
                uses_compound_file,
            });
        }

        let computed = reader.checksum();
        let stored = reader.read_u32()?;
        if computed != stored {
            return Err(LucernaError::corrupt(format!(
                "checksum mismatch in {name}: stored {stored:08x}, computed {computed:08x}"
            )));
        }
        if !reader.is_eof() {
            return Err(LucernaError::corrupt(format!("trailing bytes after checksum in {name}")));
        }
        reader.close()?;

        Ok(SegmentInfos {
            counter,
            version,
            generation,
            field_infos,
            segments,
        })
    }

    /// Write the set as the next generation and bump the version.
    pub fn write(&mut self, storage: &dyn Storage) -> Result<()> {
        let generation = self.generation + 1;
        let version = self.version + 1;
        let name = segments_file_name(generation);
        let pending = format!("{PENDING_PREFIX}{name}");

        let mut writer = StructWriter::create(storage, &pending)?;
        writer.write_u32(SEGMENTS_FORMAT)?;
        writer.write_u64(version)?;
        writer.write_u32(self.counter)?;
        self.field_infos.write_to(&mut writer)?;
        writer.write_vint(self.segments.len() as u32)?;
        for segment in &self.segments {
            writer.write_string(&segment.name)?;
            writer.write_u32(segment.doc_count)?;
            writer.write_u64(segment.del_gen)?;
            writer.write_vint(segment.norm_gens.len() as u32)?;
            for generation in &segment.norm_gens {
                writer.write_u64(*generation)?;
            }
            writer.write_u8(segment.uses_compound_file as u8)?;
        }
        let checksum = writer.checksum();
        writer.write_u32(checksum)?;
        writer.close()?;

        storage.sync()?;
        storage.rename_file(&pending, &name)?;
        self.generation = generation;
        self.version = version;
        log::debug!(
            "wrote {name} (version {version}, {} segments)",
            self.segments.len()
        );
        Ok(())
    }

    /// Every file the set references, the segments file included.
    pub fn files(&self, storage: &dyn Storage) -> Vec<String> {
        let mut files = Vec::new();
        if self.generation > 0 {
            files.push(self.segments_file_name());
        }
        for segment in &self.segments {
            files.extend(segment.files(storage, &self.field_infos));
        }
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::io::{Read, Write};

    #[test]
    fn test_base36_names() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(10), "a");
        assert_eq!(to_base36(36), "10");
        assert_eq!(from_base36("zz"), Some(36 * 36 - 1));
        assert_eq!(from_base36(""), None);
        assert_eq!(segments_file_name(11), "segments_b");
        assert_eq!(generation_of("segments_b"), Some(11));
        assert_eq!(generation_of("pending_segments_b"), None);
        assert_eq!(generation_of("_0.tis"), None);

        let mut infos = SegmentInfos::new();
        let names: Vec<_> = (0..12).map(|_| infos.next_segment_name()).collect();
        assert_eq!(names[0], "_0");
        assert_eq!(names[10], "_a");
        assert_eq!(infos.counter, 12);
    }

    #[test]
    fn test_generation_file_names() {
        let mut info = SegmentInfo::new("_3", 10, false);
        assert_eq!(info.del_file_name(), None);
        assert_eq!(info.advance_del_gen(), "_3_1.del");
        assert_eq!(info.del_file_name().as_deref(), Some("_3_1.del"));

        assert_eq!(info.norm_file_name(2), "_3.f2");
        assert_eq!(info.advance_norm_gen(2), "_3_1.s2");
        assert_eq!(info.norm_gens, vec![0, 0, 1]);
        assert!(!info.has_separate_norms(0));
        assert!(info.has_separate_norms(2));
        assert!(!info.has_separate_norms(9));
    }

    #[test]
    fn test_write_read_round_trip() {
        let storage = MemoryStorage::default();
        let mut infos = SegmentInfos::new();
        infos.field_infos.add("body", true, false, false, false, false);
        infos.field_infos.add("id", true, false, false, false, true);
        let name = infos.next_segment_name();
        let mut segment = SegmentInfo::new(name, 7, true);
        segment.advance_del_gen();
        segment.advance_norm_gen(1);
        infos.segments.push(segment);
        infos.segments.push(SegmentInfo::new("_1", 3, false));

        infos.write(&storage).unwrap();
        assert_eq!(infos.generation, 1);
        assert_eq!(infos.version, 1);
        infos.write(&storage).unwrap();
        assert_eq!(infos.generation, 2);

        assert_eq!(SegmentInfos::latest_generation(&storage).unwrap(), Some(2));
        let read = SegmentInfos::read_latest(&storage).unwrap();
        assert_eq!(read, infos);
        assert_eq!(read.max_doc(), 10);
        assert!(!storage.file_exists("pending_segments_2"));
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let storage = MemoryStorage::default();
        let mut infos = SegmentInfos::new();
        infos.segments.push(SegmentInfo::new("_0", 5, false));
        infos.write(&storage).unwrap();

        let mut bytes = Vec::new();
        storage
            .open_input("segments_1")
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        // doc_count of the only segment
        let index = bytes.len() - 4 - 1 - 1 - 8 - 1;
        bytes[index] ^= 0x01;
        let mut output = storage.create_output("segments_1").unwrap();
        output.write_all(&bytes).unwrap();
        output.close().unwrap();

        assert!(matches!(
            SegmentInfos::read(&storage, 1),
            Err(LucernaError::Corrupt(_))
        ));
    }

    #[test]
    fn test_missing_index() {
        let storage = MemoryStorage::default();
        assert_eq!(SegmentInfos::latest_generation(&storage).unwrap(), None);
        assert!(SegmentInfos::read_latest(&storage).is_err());
    }

    #[test]
    fn test_segment_files() {
        let storage = MemoryStorage::default();
        for name in ["_0.f0", "_0.tvx", "_0.tvd", "_0.tvf"] {
            storage.create_output(name).unwrap().close().unwrap();
        }
        let mut field_infos = FieldInfos::new();
        field_infos.add("body", true, true, false, false, false);
        field_infos.add("late", true, false, false, false, false);

        let mut segment = SegmentInfo::new("_0", 1, false);
        segment.advance_del_gen();
        let files = segment.files(&storage, &field_infos);
        assert!(files.contains(&"_0.f0".to_string()));
        assert!(!files.contains(&"_0.f1".to_string()));
        assert!(files.contains(&"_0.tvf".to_string()));
        assert!(files.contains(&"_0_1.del".to_string()));

        segment.uses_compound_file = true;
        segment.advance_norm_gen(1);
        assert_eq!(
            segment.files(&storage, &field_infos),
            vec!["_0.cfs", "_0_1.del", "_0_1.s1"]
        );
    }
}
