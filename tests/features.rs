use blockimg::{create, CreateOptions, Features, Image, ImageError, MemCluster, ObjectStore};
use bytes::Bytes;
use std::sync::Arc;

fn setup(features: Features) -> (MemCluster, u64, Arc<dyn ObjectStore>) {
    let cluster = MemCluster::new();
    let pool = cluster.create_pool("rbd");
    let store: Arc<dyn ObjectStore> = Arc::new(cluster.connect());
    create(
        &store,
        pool,
        "img",
        8 << 20,
        &CreateOptions {
            features,
            ..Default::default()
        },
    )
    .unwrap();
    (cluster, pool, store)
}

#[test]
fn unknown_incompatible_bit_fails_open() {
    let (_cluster, pool, store) = setup(Features::LAYERING);
    let id = store.omap_get(pool, "img_id.img", "id").unwrap().unwrap();
    let id = String::from_utf8(id.to_vec()).unwrap();

    // Persist an incompatible bit this build does not know.
    let alien: u64 = 1 << 63;
    store
        .omap_set(
            pool,
            &format!("img_header.{id}"),
            &[(
                "incompat_features".to_string(),
                Bytes::copy_from_slice(&alien.to_be_bytes()),
            )],
        )
        .unwrap();

    let err = Image::open(store, pool, "img").unwrap_err();
    match err {
        ImageError::UnsupportedIncompatible { missing } => assert_eq!(missing, alien),
        other => panic!("expected UnsupportedIncompatible, got {other:?}"),
    }
}

#[test]
fn enable_object_map_requires_exclusive_lock() {
    let (_cluster, pool, store) = setup(Features::LAYERING);
    let img = Image::open(store, pool, "img").unwrap();
    let err = img.update_features(Features::OBJECT_MAP, true).unwrap_err();
    assert!(matches!(err, ImageError::Invalid(_)));
    img.close().unwrap();
}

#[test]
fn enable_fast_diff_requires_object_map() {
    let (_cluster, pool, store) = setup(Features::EXCLUSIVE_LOCK);
    let img = Image::open(store, pool, "img").unwrap();
    let err = img.update_features(Features::FAST_DIFF, true).unwrap_err();
    assert!(matches!(err, ImageError::Invalid(_)));
    img.update_features(Features::OBJECT_MAP, true).unwrap();
    img.update_features(Features::FAST_DIFF, true).unwrap();
    assert!(img
        .features()
        .contains(Features::OBJECT_MAP | Features::FAST_DIFF));
    img.close().unwrap();
}

#[test]
fn enabling_object_map_marks_it_invalid_until_rebuilt() {
    let (_cluster, pool, store) = setup(Features::EXCLUSIVE_LOCK);
    let img = Image::open(store, pool, "img").unwrap();
    img.write(0, &[1u8; 4096]).unwrap();

    img.update_features(Features::OBJECT_MAP, true).unwrap();
    assert!(img
        .flags()
        .contains(blockimg::ImageFlags::OBJECT_MAP_INVALID));
    // The freshly allocated map is empty even though the object exists.
    assert_eq!(
        img.object_map().unwrap().get(0),
        blockimg::ObjectState::Nonexistent
    );

    img.rebuild_object_map(Arc::new(blockimg::NoProgress)).unwrap();
    assert!(!img
        .flags()
        .contains(blockimg::ImageFlags::OBJECT_MAP_INVALID));
    assert_eq!(img.object_map().unwrap().get(0), blockimg::ObjectState::Exists);
    img.close().unwrap();
}

#[test]
fn disable_exclusive_lock_requires_object_map_off() {
    let (_cluster, pool, store) = setup(
        Features::EXCLUSIVE_LOCK | Features::OBJECT_MAP,
    );
    let img = Image::open(store, pool, "img").unwrap();
    let err = img.update_features(Features::EXCLUSIVE_LOCK, false).unwrap_err();
    assert!(matches!(err, ImageError::Invalid(_)));

    img.update_features(Features::OBJECT_MAP, false).unwrap();
    img.update_features(Features::EXCLUSIVE_LOCK, false).unwrap();
    assert!(img.features().is_empty());
    img.close().unwrap();
}

#[test]
fn immutable_features_cannot_be_toggled() {
    let (_cluster, pool, store) = setup(Features::LAYERING);
    let img = Image::open(store, pool, "img").unwrap();
    let err = img.update_features(Features::LAYERING, false).unwrap_err();
    assert!(matches!(err, ImageError::Invalid(_)));
    img.close().unwrap();
}

#[test]
fn disabling_lock_feature_releases_held_lock() {
    let (_cluster, pool, store) = setup(Features::EXCLUSIVE_LOCK);
    let img = Image::open(store.clone(), pool, "img").unwrap();
    img.write(0, b"seed").unwrap();
    assert!(img.is_exclusive_lock_owner());

    img.update_features(Features::EXCLUSIVE_LOCK, false).unwrap();
    assert!(!img.is_exclusive_lock_owner());
    assert!(img.list_lockers().unwrap().is_empty());

    // Writes no longer gate on ownership.
    img.write(0, b"free").unwrap();
    assert!(!img.is_exclusive_lock_owner());
    img.close().unwrap();
}

#[test]
fn user_advisory_locks_round_trip() {
    let (_cluster, pool, store) = setup(Features::empty());
    let img = Image::open(store, pool, "img").unwrap();

    img.lock_exclusive("cookie-1").unwrap();
    let lockers = img.list_lockers().unwrap();
    assert_eq!(lockers.len(), 1);
    assert_eq!(lockers[0].cookie, "cookie-1");

    let err = img.lock_exclusive("cookie-2").unwrap_err();
    assert!(matches!(err, ImageError::Busy(_)));

    img.unlock("cookie-1").unwrap();
    assert!(img.list_lockers().unwrap().is_empty());
    img.close().unwrap();
}
