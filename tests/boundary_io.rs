use blockimg::{create, Config, CreateOptions, Features, Image, ImageError, MemCluster, ObjectStore};
use std::sync::Arc;

const SIZE: u64 = 8 << 20;

fn open_plain() -> (MemCluster, Image) {
    open_with(Features::empty(), Config::default())
}

fn open_with(features: Features, config: Config) -> (MemCluster, Image) {
    let cluster = MemCluster::new();
    let pool = cluster.create_pool("rbd");
    let store: Arc<dyn ObjectStore> = Arc::new(cluster.connect());
    create(
        &store,
        pool,
        "img",
        SIZE,
        &CreateOptions {
            features,
            ..Default::default()
        },
    )
    .unwrap();
    let img = Image::open_with_config(store, pool, "img", false, config).unwrap();
    (cluster, img)
}

#[test]
fn read_at_end_with_zero_length_succeeds() {
    let (_c, img) = open_plain();
    let data = img.read(SIZE, 0).unwrap();
    assert!(data.is_empty());
    img.close().unwrap();
}

#[test]
fn read_at_end_with_positive_length_is_invalid() {
    let (_c, img) = open_plain();
    let err = img.read(SIZE, 1).unwrap_err();
    assert!(matches!(err, ImageError::Invalid(_)));
    let err = img.read(SIZE + 1, 0).unwrap_err();
    assert!(matches!(err, ImageError::Invalid(_)));
    img.close().unwrap();
}

#[test]
fn read_spanning_end_is_clipped() {
    let (_c, img) = open_plain();
    img.write(SIZE - 4, &[9, 9, 9, 9]).unwrap();
    let data = img.read(SIZE - 4, 100).unwrap();
    assert_eq!(&data[..], &[9, 9, 9, 9]);
    img.close().unwrap();
}

#[test]
fn write_spanning_end_is_clipped() {
    let (_c, img) = open_plain();
    img.write(SIZE - 2, &[1, 2, 3, 4]).unwrap();
    assert_eq!(&img.read(SIZE - 2, 2).unwrap()[..], &[1, 2]);
    img.close().unwrap();
}

#[test]
fn zero_length_write_is_a_no_op() {
    let (_c, img) = open_plain();
    img.write(0, &[]).unwrap();
    img.write(SIZE, &[]).unwrap();
    img.close().unwrap();
}

#[test]
fn write_at_snapshot_selection_is_readonly() {
    let (_c, img) = open_plain();
    img.snap_create("s").unwrap();
    img.set_snap_selection(Some("s")).unwrap();
    assert!(matches!(img.write(0, b"x").unwrap_err(), ImageError::ReadOnly));
    assert!(matches!(img.discard(0, 4096).unwrap_err(), ImageError::ReadOnly));
    assert!(matches!(img.resize(1 << 20).unwrap_err(), ImageError::ReadOnly));
    img.set_snap_selection(None).unwrap();
    img.write(0, b"x").unwrap();
    img.close().unwrap();
}

#[test]
fn read_only_open_rejects_writes() {
    let cluster = MemCluster::new();
    let pool = cluster.create_pool("rbd");
    let store: Arc<dyn ObjectStore> = Arc::new(cluster.connect());
    create(&store, pool, "img", SIZE, &Default::default()).unwrap();
    let img = Image::open_read_only(store, pool, "img").unwrap();
    assert!(matches!(img.write(0, b"x").unwrap_err(), ImageError::ReadOnly));
    assert!(matches!(img.resize(1).unwrap_err(), ImageError::ReadOnly));
    img.close().unwrap();
}

#[test]
fn resize_to_current_size_is_a_no_op() {
    let (_c, img) = open_plain();
    img.write(0, &[5u8; 4096]).unwrap();
    img.resize(SIZE).unwrap();
    assert_eq!(img.stat().unwrap().size, SIZE);
    assert_eq!(&img.read(0, 4).unwrap()[..], &[5, 5, 5, 5]);
    img.close().unwrap();
}

#[test]
fn shrink_discards_tail_then_grow_reads_zero() {
    let (_c, img) = open_plain();
    let tail = SIZE - 4096;
    img.write(tail, &[0xEEu8; 4096]).unwrap();
    img.write(0, &[0x11u8; 4096]).unwrap();

    img.resize(1 << 20).unwrap();
    assert_eq!(img.stat().unwrap().size, 1 << 20);
    assert!(matches!(img.read(tail, 1).unwrap_err(), ImageError::Invalid(_)));

    img.resize(SIZE).unwrap();
    let back = img.read(tail, 4096).unwrap();
    assert!(back.iter().all(|b| *b == 0), "regrown region must read zero");
    assert_eq!(&img.read(0, 4).unwrap()[..], &[0x11; 4]);
    img.close().unwrap();
}

#[test]
fn discard_zeroes_interior_ranges() {
    let (_c, img) = open_plain();
    img.write(0, &[0xFFu8; 8192]).unwrap();
    img.discard(1024, 2048).unwrap();

    let data = img.read(0, 8192).unwrap();
    assert!(data[..1024].iter().all(|b| *b == 0xFF));
    assert!(data[1024..3072].iter().all(|b| *b == 0));
    assert!(data[3072..].iter().all(|b| *b == 0xFF));
    img.close().unwrap();
}

#[test]
fn skip_partial_discard_leaves_interior_intact() {
    let (_c, img) = open_with(
        Features::empty(),
        Config {
            skip_partial_discard: true,
            ..Default::default()
        },
    );
    img.write(0, &[0xFFu8; 8192]).unwrap();
    img.discard(1024, 2048).unwrap();
    let data = img.read(0, 8192).unwrap();
    assert!(data.iter().all(|b| *b == 0xFF));
    img.close().unwrap();
}

#[test]
fn whole_object_discard_deallocates() {
    let (_c, img) = open_with(
        Features::EXCLUSIVE_LOCK | Features::OBJECT_MAP,
        Config::default(),
    );
    let object_size = img.stat().unwrap().object_size;
    img.write(0, &vec![1u8; object_size as usize]).unwrap();
    assert_eq!(img.object_map().unwrap().get(0), blockimg::ObjectState::Exists);

    img.discard(0, object_size).unwrap();
    assert_eq!(
        img.object_map().unwrap().get(0),
        blockimg::ObjectState::Nonexistent
    );
    let back = img.read(0, 4096).unwrap();
    assert!(back.iter().all(|b| *b == 0));
    img.close().unwrap();
}

#[test]
fn flush_completes_after_writes() {
    let (_c, img) = open_plain();
    img.write(0, &[3u8; 4096]).unwrap();
    img.flush().unwrap();
    assert_eq!(&img.read(0, 4).unwrap()[..], &[3, 3, 3, 3]);
    img.close().unwrap();
}
