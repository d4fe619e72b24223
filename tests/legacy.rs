use blockimg::{
    create, list, remove, rename, CreateOptions, Features, Image, ImageError, ImageFormat,
    MemCluster, NoProgress, ObjectStore, SNAP_HEAD,
};
use std::sync::Arc;

fn legacy_opts() -> CreateOptions {
    CreateOptions {
        format: ImageFormat::Legacy,
        order: 22,
        ..Default::default()
    }
}

fn setup() -> (MemCluster, u64, Arc<dyn ObjectStore>) {
    let cluster = MemCluster::new();
    let pool = cluster.create_pool("rbd");
    let store: Arc<dyn ObjectStore> = Arc::new(cluster.connect());
    (cluster, pool, store)
}

#[test]
fn legacy_create_open_read_write() {
    let (_c, pool, store) = setup();
    create(&store, pool, "old", 16 << 20, &legacy_opts()).unwrap();

    let img = Image::open(store, pool, "old").unwrap();
    assert_eq!(img.format(), ImageFormat::Legacy);
    assert!(img.features().is_empty());
    assert_eq!(img.stat().unwrap().size, 16 << 20);

    img.write(4096, b"legacy data").unwrap();
    assert_eq!(&img.read(4096, 11).unwrap()[..], b"legacy data");
    img.close().unwrap();
}

#[test]
fn legacy_resize_persists() {
    let (_c, pool, store) = setup();
    create(&store, pool, "old", 16 << 20, &legacy_opts()).unwrap();
    {
        let img = Image::open(store.clone(), pool, "old").unwrap();
        img.resize(4 << 20).unwrap();
        img.close().unwrap();
    }
    let img = Image::open(store, pool, "old").unwrap();
    assert_eq!(img.stat().unwrap().size, 4 << 20);
    img.close().unwrap();
}

#[test]
fn legacy_snapshots_and_rollback() {
    let (_c, pool, store) = setup();
    create(&store, pool, "old", 16 << 20, &legacy_opts()).unwrap();
    let img = Image::open(store, pool, "old").unwrap();

    img.write(0, &[b'A'; 4096]).unwrap();
    img.snap_create("t").unwrap();
    img.write(0, &[b'B'; 4096]).unwrap();

    img.set_snap_selection(Some("t")).unwrap();
    assert_eq!(&img.read(0, 4096).unwrap()[..], &[b'A'; 4096][..]);
    img.set_snap_selection(None).unwrap();

    img.snap_rollback("t").unwrap();
    assert_eq!(&img.read(0, 4096).unwrap()[..], &[b'A'; 4096][..]);

    img.snap_remove("t").unwrap();
    assert!(img.snap_list().unwrap().is_empty());
    img.close().unwrap();
}

#[test]
fn legacy_rename_moves_header_and_directory_entry() {
    let (_c, pool, store) = setup();
    create(&store, pool, "old", 8 << 20, &legacy_opts()).unwrap();
    {
        let img = Image::open(store.clone(), pool, "old").unwrap();
        img.write(0, b"payload").unwrap();
        img.close().unwrap();
    }

    rename(&store, pool, "old", "newer").unwrap();
    assert_eq!(list(&store, pool).unwrap(), vec!["newer".to_string()]);
    assert!(store.stat(pool, "old.img_head", SNAP_HEAD).is_err());

    let img = Image::open(store, pool, "newer").unwrap();
    assert_eq!(&img.read(0, 7).unwrap()[..], b"payload");
    img.close().unwrap();
}

#[test]
fn legacy_remove_clears_directory_first() {
    let (_c, pool, store) = setup();
    create(&store, pool, "old", 8 << 20, &legacy_opts()).unwrap();
    remove(&store, pool, "old", &NoProgress).unwrap();
    assert!(list(&store, pool).unwrap().is_empty());
    assert!(store.stat(pool, "old.img_head", SNAP_HEAD).is_err());
    assert!(Image::open(store, pool, "old").unwrap_err().is_not_found());
}

#[test]
fn corrupt_legacy_header_fails_open() {
    let (_c, pool, store) = setup();
    create(&store, pool, "old", 8 << 20, &legacy_opts()).unwrap();

    // Clobber the signature.
    let snapc = blockimg::SnapContext::default();
    store
        .write(pool, "old.img_head", 0, b"garbage!", &snapc)
        .unwrap();

    let err = Image::open(store, pool, "old").unwrap_err();
    assert!(matches!(err, ImageError::Corrupt(_)));
}

#[test]
fn legacy_images_have_no_feature_operations() {
    let (_c, pool, store) = setup();
    create(&store, pool, "old", 8 << 20, &legacy_opts()).unwrap();
    let img = Image::open(store, pool, "old").unwrap();
    let err = img.update_features(Features::EXCLUSIVE_LOCK, true).unwrap_err();
    assert!(matches!(err, ImageError::Unsupported(_)));
    // No parent machinery either.
    assert!(img.parent_info().is_none());
    let err = img.flatten().unwrap_err();
    assert!(matches!(err, ImageError::Invalid(_)));
    img.close().unwrap();
}
