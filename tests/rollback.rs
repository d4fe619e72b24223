use blockimg::{create, CreateOptions, Features, Image, MemCluster, ObjectStore};
use std::sync::Arc;

fn open_image(features: Features, size: u64) -> (MemCluster, Image) {
    let cluster = MemCluster::new();
    let pool = cluster.create_pool("rbd");
    let store: Arc<dyn ObjectStore> = Arc::new(cluster.connect());
    create(
        &store,
        pool,
        "img",
        size,
        &CreateOptions {
            features,
            ..Default::default()
        },
    )
    .unwrap();
    let img = Image::open(store, pool, "img").unwrap();
    (cluster, img)
}

#[test]
fn rollback_restores_pre_snapshot_content() {
    let (_cluster, img) = open_image(Features::empty(), 64 << 20);

    img.write(0, &[b'A'; 8192]).unwrap();
    img.snap_create("t").unwrap();
    img.write(0, &[b'B'; 8192]).unwrap();
    assert_eq!(&img.read(0, 8192).unwrap()[..], &[b'B'; 8192][..]);

    img.snap_rollback("t").unwrap();
    assert_eq!(&img.read(0, 8192).unwrap()[..], &[b'A'; 8192][..]);

    // The snapshot itself is intact and still readable.
    img.set_snap_selection(Some("t")).unwrap();
    assert_eq!(&img.read(0, 8192).unwrap()[..], &[b'A'; 8192][..]);
    img.set_snap_selection(None).unwrap();
    img.close().unwrap();
}

#[test]
fn rollback_removes_objects_created_after_snapshot() {
    let (_cluster, img) = open_image(Features::empty(), 64 << 20);

    img.snap_create("empty").unwrap();
    img.write(0, &[7u8; 4096]).unwrap();
    img.snap_rollback("empty").unwrap();

    let back = img.read(0, 4096).unwrap();
    assert!(back.iter().all(|b| *b == 0));
    img.close().unwrap();
}

#[test]
fn rollback_restores_snapshot_size() {
    let (_cluster, img) = open_image(Features::empty(), 64 << 20);

    img.snap_create("t").unwrap();
    img.resize(8 << 20).unwrap();
    assert_eq!(img.stat().unwrap().size, 8 << 20);

    img.snap_rollback("t").unwrap();
    assert_eq!(img.stat().unwrap().size, 64 << 20);
    img.close().unwrap();
}

#[test]
fn rollback_with_object_map_keeps_map_consistent() {
    let features = Features::EXCLUSIVE_LOCK | Features::OBJECT_MAP;
    let (_cluster, img) = open_image(features, 64 << 20);

    img.snap_create("clean").unwrap();
    img.write(0, &[1u8; 4096]).unwrap();
    img.snap_rollback("clean").unwrap();

    let map = img.object_map().expect("object map enabled");
    assert_eq!(map.get(0), blockimg::ObjectState::Nonexistent);
    let back = img.read(0, 4096).unwrap();
    assert!(back.iter().all(|b| *b == 0));
    img.close().unwrap();
}

#[test]
fn rollback_missing_snapshot_fails() {
    let (_cluster, img) = open_image(Features::empty(), 8 << 20);
    assert!(img.snap_rollback("nope").unwrap_err().is_not_found());
    img.close().unwrap();
}

#[test]
fn snap_create_then_remove_leaves_table_unchanged() {
    let (_cluster, img) = open_image(Features::empty(), 8 << 20);
    assert!(img.snap_list().unwrap().is_empty());
    img.snap_create("n").unwrap();
    assert_eq!(img.snap_list().unwrap().len(), 1);
    img.snap_remove("n").unwrap();
    assert!(img.snap_list().unwrap().is_empty());
    img.close().unwrap();
}

#[test]
fn duplicate_snapshot_name_fails() {
    let (_cluster, img) = open_image(Features::empty(), 8 << 20);
    img.snap_create("s").unwrap();
    let err = img.snap_create("s").unwrap_err();
    assert!(matches!(err, blockimg::ImageError::AlreadyExists(_)));
    img.close().unwrap();
}
