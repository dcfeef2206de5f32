//! SST build/read, lookup, and merge-iterator tests.

#[cfg(test)]
mod tests {
    use crate::ledger::sst::{MergeIterator, SstCell, SstError, SstReader, SstWriter};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn cell(key: &str, sqn: u64, value: Option<&str>) -> SstCell {
        SstCell {
            key: key.as_bytes().to_vec(),
            sqn,
            value: value.map(|v| v.as_bytes().to_vec()),
        }
    }

    fn build(path: &Path, cells: Vec<SstCell>) -> SstReader {
        let count = cells.len();
        SstWriter::new(path).build(cells.into_iter(), count).unwrap();
        SstReader::open(path).unwrap()
    }

    /// # Scenario
    /// Build-then-read round trip across multiple data blocks: 2000 cells
    /// (well past one 4 KiB block), every key retrievable, iteration in
    /// file order, properties accurate.
    #[test]
    fn round_trip_across_blocks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.sst");
        let cells: Vec<SstCell> = (0..2000u64)
            .map(|n| cell(&format!("key_{n:06}"), n + 1, Some(&format!("val_{n:06}"))))
            .collect();
        let reader = build(&path, cells.clone());

        assert_eq!(reader.properties.cell_count, 2000);
        assert_eq!(reader.properties.tombstone_count, 0);
        assert_eq!(reader.properties.min_sqn, 1);
        assert_eq!(reader.properties.max_sqn, 2000);
        assert_eq!(reader.properties.min_key, b"key_000000".to_vec());
        assert_eq!(reader.properties.max_key, b"key_001999".to_vec());

        for probe in [0u64, 1, 999, 1998, 1999] {
            let found = reader.get(format!("key_{probe:06}").as_bytes()).unwrap();
            assert_eq!(found, Some(cells[probe as usize].clone()));
        }
        assert_eq!(reader.get(b"key_zzz").unwrap(), None);

        let walked: Vec<SstCell> = reader.iter().collect();
        assert_eq!(walked, cells);
    }

    /// # Scenario
    /// Multiple versions of one key: `get` answers the newest (cells are
    /// ordered SQN-descending within a key).
    #[test]
    fn get_returns_newest_version() {
        let tmp = TempDir::new().unwrap();
        let reader = build(
            &tmp.path().join("v.sst"),
            vec![
                cell("alpha", 9, Some("new")),
                cell("alpha", 4, Some("old")),
                cell("beta", 2, None),
            ],
        );

        let newest = reader.get(b"alpha").unwrap().unwrap();
        assert_eq!(newest.sqn, 9);
        assert_eq!(newest.value.as_deref(), Some(b"new".as_slice()));

        let tomb = reader.get(b"beta").unwrap().unwrap();
        assert!(tomb.is_tombstone());
    }

    /// # Scenario
    /// Key-range overlap tests drive file selection during merges.
    #[test]
    fn overlap_bounds_are_inclusive() {
        let tmp = TempDir::new().unwrap();
        let reader = build(
            &tmp.path().join("o.sst"),
            vec![cell("f", 1, Some("x")), cell("m", 2, Some("y"))],
        );

        assert!(reader.overlaps(b"a", b"z"));
        assert!(reader.overlaps(b"m", b"z"));
        assert!(reader.overlaps(b"a", b"f"));
        assert!(!reader.overlaps(b"n", b"z"));
        assert!(!reader.overlaps(b"a", b"e"));
    }

    /// # Scenario
    /// A flipped byte in a data block is caught by the block CRC on read.
    #[test]
    fn corrupt_block_is_detected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("c.sst");
        build(&path, vec![cell("k", 1, Some("vvvvvvvv"))]);

        let mut bytes = fs::read(&path).unwrap();
        // Past the 12-byte header, inside the single data block.
        bytes[20] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let reader = SstReader::open(&path).unwrap();
        assert!(matches!(
            reader.get(b"k"),
            Err(SstError::ChecksumMismatch(_)) | Ok(None)
        ));
    }

    /// # Scenario
    /// An empty cell stream is refused — an SST with no cells has no key
    /// bounds and would poison overlap tests.
    #[test]
    fn empty_build_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let result = SstWriter::new(tmp.path().join("e.sst")).build(std::iter::empty(), 0);
        assert!(result.is_err());
    }

    /// # Scenario
    /// K-way merge of three sorted streams: output is sorted by key with
    /// SQN-descending ties, nothing dropped.
    #[test]
    fn merge_iterator_orders_across_streams() {
        let left = vec![cell("a", 5, Some("l")), cell("c", 1, Some("l"))];
        let middle = vec![cell("a", 8, Some("m")), cell("b", 2, None)];
        let right = vec![cell("b", 7, Some("r")), cell("d", 3, Some("r"))];

        let merged: Vec<SstCell> = MergeIterator::new(vec![
            Box::new(left.into_iter()),
            Box::new(middle.into_iter()),
            Box::new(right.into_iter()),
        ])
        .collect();

        let shape: Vec<(&[u8], u64)> = merged
            .iter()
            .map(|c| (c.key.as_slice(), c.sqn))
            .collect();
        assert_eq!(
            shape,
            vec![
                (b"a".as_slice(), 8),
                (b"a".as_slice(), 5),
                (b"b".as_slice(), 7),
                (b"b".as_slice(), 2),
                (b"c".as_slice(), 1),
                (b"d".as_slice(), 3),
            ]
        );
    }
}
