//! Integration tests for the volume read/write/delete paths.

use std::os::unix::fs::FileExt;
use std::thread;

use hayloft::needle::{self, MAX_DATA_SIZE};
use hayloft::{StoreError, Volume};
use tempfile::TempDir;

fn open_volume(dir: &TempDir, id: u32) -> Volume {
    Volume::open(
        id,
        dir.path().join(format!("{id}.blk")),
        dir.path().join(format!("{id}.idx")),
    )
    .unwrap()
}

/// Payload derived from a key, so readers can verify bytes without shared
/// state.
fn payload_for(key: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (key as usize + i) as u8).collect()
}

#[test]
fn test_add_then_get_roundtrip() {
    let dir = TempDir::new().unwrap();
    let volume = open_volume(&dir, 1);

    volume.add(7, 42, &[0xAA, 0xBB, 0xCC]).unwrap();

    let mut scratch = Vec::new();
    assert_eq!(
        volume.get(7, 42, &mut scratch).unwrap(),
        &[0xAA, 0xBB, 0xCC]
    );
    assert!(matches!(
        volume.get(7, 43, &mut scratch),
        Err(StoreError::Cookie)
    ));
}

#[test]
fn test_roundtrip_various_sizes() {
    let dir = TempDir::new().unwrap();
    let volume = open_volume(&dir, 1);
    let mut scratch = Vec::new();

    for (key, len) in [(1u64, 1usize), (2, 7), (3, 8), (4, 100), (5, 4096), (6, 65_537)] {
        let data = payload_for(key, len);
        volume.add(key, key ^ 0xFF, &data).unwrap();
        assert_eq!(volume.get(key, key ^ 0xFF, &mut scratch).unwrap(), &data);
    }
}

#[test]
fn test_size_boundaries() {
    let dir = TempDir::new().unwrap();
    let volume = open_volume(&dir, 1);
    let mut scratch = Vec::new();

    // smallest possible needle
    volume.add(1, 0, &[0x01]).unwrap();
    assert_eq!(volume.get(1, 0, &mut scratch).unwrap(), &[0x01]);

    // largest possible needle
    let big = payload_for(2, MAX_DATA_SIZE);
    volume.add(2, 0, &big).unwrap();
    assert_eq!(volume.get(2, 0, &mut scratch).unwrap(), &big);

    // one byte over
    let too_big = vec![0u8; MAX_DATA_SIZE + 1];
    assert!(matches!(
        volume.add(3, 0, &too_big),
        Err(StoreError::TooLarge(_))
    ));
}

#[test]
fn test_block_file_stays_aligned() {
    let dir = TempDir::new().unwrap();
    let volume = open_volume(&dir, 1);
    for (key, len) in [(1u64, 1usize), (2, 3), (3, 7), (4, 8), (5, 1000)] {
        volume.add(key, 0, &payload_for(key, len)).unwrap();
        let len = std::fs::metadata(dir.path().join("1.blk")).unwrap().len();
        assert_eq!(len % 8, 0);
    }
}

#[test]
fn test_delete_semantics() {
    let dir = TempDir::new().unwrap();
    let volume = open_volume(&dir, 1);
    let mut scratch = Vec::new();

    volume.add(1, 0, &[0x00]).unwrap();
    volume.del(1).unwrap();

    assert!(matches!(
        volume.get(1, 0, &mut scratch),
        Err(StoreError::Deleted)
    ));
    // second delete sees the tombstone
    assert!(matches!(volume.del(1), Err(StoreError::NoNeedle)));
    assert!(matches!(
        volume.get(1, 0, &mut scratch),
        Err(StoreError::Deleted)
    ));
}

#[test]
fn test_overwrite_marks_old_record_on_disk() {
    let dir = TempDir::new().unwrap();
    let block_path = dir.path().join("1.blk");
    {
        let volume = open_volume(&dir, 1);
        volume.add(5, 9, b"version-1").unwrap();
        volume.add(5, 9, b"version-2").unwrap();

        let mut scratch = Vec::new();
        assert_eq!(volume.get(5, 9, &mut scratch).unwrap(), b"version-2");
        // close drains the delete queue
    }

    // first record sits right after the file prefix; its flag byte must
    // now read Deleted
    let file = std::fs::File::open(&block_path).unwrap();
    let mut flag = [0u8; 1];
    file.read_exact_at(&mut flag, 8 + needle::FLAG_OFFSET).unwrap();
    assert_eq!(flag[0], needle::FLAG_DELETED);

    // and the volume still serves the latest version
    let volume = open_volume(&dir, 1);
    let mut scratch = Vec::new();
    assert_eq!(volume.get(5, 9, &mut scratch).unwrap(), b"version-2");
}

#[test]
fn test_batched_write_path() {
    let dir = TempDir::new().unwrap();
    let volume = open_volume(&dir, 1);
    {
        let mut writer = volume.lock();
        for key in 0..100u64 {
            writer.write(key, key, &payload_for(key, 128)).unwrap();
        }
        writer.flush().unwrap();
    }

    let mut scratch = Vec::new();
    for key in 0..100u64 {
        assert_eq!(
            volume.get(key, key, &mut scratch).unwrap(),
            &payload_for(key, 128)
        );
    }
}

#[test]
fn test_concurrent_writers_and_readers() {
    const WRITERS: u64 = 8;
    const READERS: u64 = 8;
    const KEYS_PER_WRITER: u64 = 200;

    let dir = TempDir::new().unwrap();
    let volume = open_volume(&dir, 1);

    thread::scope(|scope| {
        for w in 0..WRITERS {
            let volume = &volume;
            scope.spawn(move || {
                for i in 0..KEYS_PER_WRITER {
                    let key = w * 10_000 + i;
                    volume.add(key, key, &payload_for(key, 512)).unwrap();
                }
            });
        }
        for r in 0..READERS {
            let volume = &volume;
            scope.spawn(move || {
                let mut scratch = Vec::new();
                for i in 0..KEYS_PER_WRITER {
                    let key = (r % WRITERS) * 10_000 + i;
                    match volume.get(key, key, &mut scratch) {
                        Ok(data) => assert_eq!(data, &payload_for(key, 512)),
                        // the writer may not have reached this key yet
                        Err(StoreError::NoNeedle) => {}
                        Err(e) => panic!("unexpected read error: {e}"),
                    }
                }
            });
        }
    });

    // every write that returned Ok is readable
    let mut scratch = Vec::new();
    for w in 0..WRITERS {
        for i in 0..KEYS_PER_WRITER {
            let key = w * 10_000 + i;
            assert_eq!(volume.get(key, key, &mut scratch).unwrap(), &payload_for(key, 512));
        }
    }
}

#[test]
fn test_corrupted_payload_fails_checksum() {
    let dir = TempDir::new().unwrap();
    let block_path = dir.path().join("1.blk");
    let volume = open_volume(&dir, 1);
    volume.add(1, 0, &payload_for(1, 64)).unwrap();

    // flip one payload byte behind the volume's back
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&block_path)
        .unwrap();
    let payload_start = 8 + needle::HEADER_SIZE as u64;
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, payload_start + 10).unwrap();
    byte[0] ^= 0x40;
    file.write_all_at(&byte, payload_start + 10).unwrap();

    let mut scratch = Vec::new();
    assert!(matches!(
        volume.get(1, 0, &mut scratch),
        Err(StoreError::Checksum { .. })
    ));
}

#[test]
fn test_corrupted_footer_fails_magic() {
    let dir = TempDir::new().unwrap();
    let block_path = dir.path().join("1.blk");
    let volume = open_volume(&dir, 1);
    volume.add(1, 0, &payload_for(1, 64)).unwrap();

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&block_path)
        .unwrap();
    let footer_start = 8 + (needle::HEADER_SIZE + 64) as u64;
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, footer_start).unwrap();
    byte[0] ^= 0x01;
    file.write_all_at(&byte, footer_start).unwrap();

    let mut scratch = Vec::new();
    assert!(matches!(
        volume.get(1, 0, &mut scratch),
        Err(StoreError::FooterMagic)
    ));
}
