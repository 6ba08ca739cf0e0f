#[cfg(test)]
mod tests {
    use lucerna::document::Document;
    use lucerna::error::LucernaError;
    use lucerna::index::segment_info::SegmentInfos;
    use lucerna::index::{IndexReader, IndexWriter, IndexWriterConfig};
    use lucerna::storage::compound::{CompoundFileWriter, CompoundStorage};
    use lucerna::storage::file::FileStorageConfig;
    use lucerna::storage::{Storage, StorageConfig, StorageFactory};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::Path;
    use std::sync::Arc;

    fn file_storage(path: &Path, use_mmap: bool) -> Arc<dyn Storage> {
        let mut config = FileStorageConfig::new(path);
        config.use_mmap = use_mmap;
        StorageFactory::create(StorageConfig::File(config)).unwrap()
    }

    fn read_all(storage: &dyn Storage, name: &str) -> Vec<u8> {
        let mut input = storage.open_input(name).unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        buffer
    }

    #[test]
    fn test_compound_round_trip_on_disk() {
        let mut rng = StdRng::seed_from_u64(5);
        for use_mmap in [false, true] {
            let temp_dir = tempfile::TempDir::new().unwrap();
            let storage = file_storage(temp_dir.path(), use_mmap);

            let mut originals = Vec::new();
            for (i, extension) in ["tis", "tii", "frq", "prx", "fdx", "fdt", "f0"]
                .iter()
                .enumerate()
            {
                let name = format!("_3.{extension}");
                // one empty entry and one spanning several copy buffers
                let length = match i {
                    2 => 0,
                    5 => 70_000,
                    _ => rng.random_range(1..2_000),
                };
                let data: Vec<u8> = (0..length).map(|_| rng.random()).collect();
                let mut output = storage.create_output(&name).unwrap();
                output.write_all(&data).unwrap();
                output.close().unwrap();
                originals.push((name, data));
            }

            let mut writer = CompoundFileWriter::new(storage.as_ref(), "_3.cfs");
            for (name, _) in &originals {
                writer.add_file(name).unwrap();
            }
            let packed = writer.close().unwrap();
            assert_eq!(packed.len(), originals.len());

            let compound = CompoundStorage::open(storage.as_ref(), "_3.cfs").unwrap();
            for (name, data) in &originals {
                assert_eq!(compound.file_size(name).unwrap(), data.len() as u64);
                assert_eq!(&read_all(&compound, name), data, "{name}");
            }

            // random access inside one entry
            let (name, data) = &originals[5];
            let mut input = compound.open_input(name).unwrap();
            input.seek(SeekFrom::Start(65_000)).unwrap();
            let mut chunk = [0u8; 16];
            input.read_exact(&mut chunk).unwrap();
            assert_eq!(&chunk[..], &data[65_000..65_016]);
            input.seek(SeekFrom::End(-4)).unwrap();
            let mut rest = Vec::new();
            input.read_to_end(&mut rest).unwrap();
            assert_eq!(&rest[..], &data[data.len() - 4..]);

            assert!(matches!(
                compound.create_output("_3.new"),
                Err(LucernaError::Unsupported(_))
            ));
            assert!(matches!(
                compound.delete_file("_3.tis"),
                Err(LucernaError::Unsupported(_))
            ));
        }
    }

    #[test]
    fn test_second_writer_on_same_directory_fails() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = IndexWriterConfig {
            write_lock_timeout_ms: 50,
            lock_poll_interval_ms: 5,
            ..IndexWriterConfig::default()
        };
        let first = IndexWriter::open(file_storage(temp_dir.path(), false), config.clone()).unwrap();

        // a separate storage instance, as another process would have
        let other = file_storage(temp_dir.path(), false);
        match IndexWriter::open(Arc::clone(&other), config.clone()) {
            Err(e) => assert!(e.is_lock_error(), "unexpected error {e}"),
            Ok(_) => panic!("two writers hold the write lock"),
        }

        first.close().unwrap();
        let second = IndexWriter::open(other, config).unwrap();
        second.close().unwrap();
    }

    #[test]
    fn test_corrupt_segments_file_is_detected() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let storage = file_storage(temp_dir.path(), false);
        let mut writer =
            IndexWriter::open(Arc::clone(&storage), IndexWriterConfig::default()).unwrap();
        writer
            .add_document(&Document::builder().add_text("body", "some text").build())
            .unwrap();
        writer.close().unwrap();

        let generation = SegmentInfos::latest_generation(storage.as_ref())
            .unwrap()
            .unwrap();
        let name = lucerna::index::segment_info::segments_file_name(generation);
        let mut bytes = read_all(storage.as_ref(), &name);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x5a;
        let mut output = storage.create_output(&name).unwrap();
        output.write_all(&bytes).unwrap();
        output.close().unwrap();

        match IndexReader::open(Arc::clone(&storage)) {
            Err(LucernaError::Corrupt(message)) => assert!(message.contains(&name)),
            other => panic!("expected corruption, got {other:?}"),
        }
        assert!(matches!(
            IndexWriter::open(storage, IndexWriterConfig::default()),
            Err(LucernaError::Corrupt(_))
        ));
    }

    #[test]
    fn test_reopening_file_index_keeps_documents() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        {
            let storage = file_storage(temp_dir.path(), false);
            let mut writer =
                IndexWriter::open(storage, IndexWriterConfig::default()).unwrap();
            for i in 0..25 {
                let doc = Document::builder()
                    .add_keyword("id", i.to_string())
                    .add_text("body", "persisted")
                    .build();
                writer.add_document(&doc).unwrap();
            }
            writer.close().unwrap();
        }

        let storage = file_storage(temp_dir.path(), true);
        let mut writer =
            IndexWriter::open(Arc::clone(&storage), IndexWriterConfig::default()).unwrap();
        assert_eq!(writer.doc_count().unwrap(), 25);
        writer
            .add_document(&Document::builder().add_keyword("id", "25").build())
            .unwrap();
        writer.close().unwrap();

        let reader = IndexReader::open(storage).unwrap();
        assert_eq!(reader.num_docs(), 26);
        assert_eq!(reader.doc_freq("body", "persisted").unwrap(), 25);
        assert_eq!(reader.document(25).unwrap().get_text("id"), Some("25"));
        assert!(!temp_dir.path().join("write.lock").exists());
    }

    #[test]
    fn test_failed_reader_commit_keeps_changes_pending() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let storage = file_storage(temp_dir.path(), false);
        let mut writer =
            IndexWriter::open(Arc::clone(&storage), IndexWriterConfig::default()).unwrap();
        for body in ["one", "two", "three"] {
            writer
                .add_document(&Document::builder().add_text("body", body).build())
                .unwrap();
        }
        writer.close().unwrap();

        let mut reader = IndexReader::open(Arc::clone(&storage)).unwrap();
        reader.delete_document(0).unwrap();

        // a directory in place of the next segments file makes the write fail
        let next = lucerna::index::segment_info::segments_file_name(reader.generation() + 1);
        let blocker = temp_dir.path().join(format!("pending_{next}"));
        std::fs::create_dir(&blocker).unwrap();
        assert!(reader.commit().is_err());
        assert!(reader.has_changes());
        assert!(reader.is_deleted(0));

        std::fs::remove_dir(&blocker).unwrap();
        reader.commit().unwrap();
        assert!(!reader.has_changes());
        drop(reader);

        let reader = IndexReader::open(storage).unwrap();
        assert_eq!(reader.num_docs(), 2);
        assert!(reader.is_deleted(0));
    }
}
