use blockimg::{
    create, list, remove, rename, CreateOptions, Features, Image, ImageError, MemCluster,
    NoProgress, ObjectState, ObjectStore,
};
use std::sync::Arc;

fn cluster_with_pool() -> (MemCluster, u64, Arc<dyn ObjectStore>) {
    let cluster = MemCluster::new();
    let pool = cluster.create_pool("rbd");
    let store: Arc<dyn ObjectStore> = Arc::new(cluster.connect());
    (cluster, pool, store)
}

fn full_features() -> Features {
    Features::LAYERING | Features::EXCLUSIVE_LOCK | Features::OBJECT_MAP | Features::FAST_DIFF
}

#[test]
fn modern_create_then_open_reads_zero() {
    let (_cluster, pool, store) = cluster_with_pool();
    create(
        &store,
        pool,
        "img",
        4 << 20,
        &CreateOptions {
            order: 12,
            features: full_features(),
            ..Default::default()
        },
    )
    .unwrap();

    let img = Image::open(store, pool, "img").unwrap();
    let data = img.read(0, 4096).unwrap();
    assert_eq!(data.len(), 4096);
    assert!(data.iter().all(|b| *b == 0));

    let map = img.object_map().expect("object map enabled");
    assert_eq!(map.len(), 1024);
    for object_no in 0..map.len() {
        assert_eq!(map.get(object_no), ObjectState::Nonexistent);
    }

    let stat = img.stat().unwrap();
    assert_eq!(stat.size, 4 << 20);
    assert_eq!(stat.order, 12);
    assert_eq!(stat.num_objects, 1024);
    img.close().unwrap();
}

#[test]
fn create_rejects_bad_order_and_features() {
    let (_cluster, pool, store) = cluster_with_pool();
    let err = create(
        &store,
        pool,
        "img",
        1 << 20,
        &CreateOptions {
            order: 9,
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, ImageError::Invalid(_)));

    // OBJECT_MAP without EXCLUSIVE_LOCK violates the implication chain.
    let err = create(
        &store,
        pool,
        "img",
        1 << 20,
        &CreateOptions {
            features: Features::LAYERING | Features::OBJECT_MAP,
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, ImageError::Invalid(_)));
}

#[test]
fn duplicate_create_fails_with_exists() {
    let (_cluster, pool, store) = cluster_with_pool();
    create(&store, pool, "img", 1 << 20, &Default::default()).unwrap();
    let err = create(&store, pool, "img", 1 << 20, &Default::default()).unwrap_err();
    assert!(matches!(err, ImageError::AlreadyExists(_)));
}

#[test]
fn create_remove_leaves_no_artifacts() {
    let (_cluster, pool, store) = cluster_with_pool();
    create(
        &store,
        pool,
        "img",
        4 << 20,
        &CreateOptions {
            features: full_features(),
            ..Default::default()
        },
    )
    .unwrap();

    let img = Image::open(store.clone(), pool, "img").unwrap();
    img.write(0, &[7u8; 8192]).unwrap();
    let id = img.id();
    img.close().unwrap();

    remove(&store, pool, "img", &NoProgress).unwrap();

    assert!(list(&store, pool).unwrap().is_empty());
    let err = Image::open(store.clone(), pool, "img").unwrap_err();
    assert!(err.is_not_found());
    // Header, id object and object map are all gone.
    assert!(store.stat(pool, &format!("img_header.{id}"), u64::MAX).is_err());
    assert!(store.stat(pool, "img_id.img", u64::MAX).is_err());
    assert!(store.stat(pool, &format!("img_object_map.{id}"), u64::MAX).is_err());
}

#[test]
fn remove_with_snapshots_is_busy() {
    let (_cluster, pool, store) = cluster_with_pool();
    create(&store, pool, "img", 1 << 20, &Default::default()).unwrap();
    let img = Image::open(store.clone(), pool, "img").unwrap();
    img.snap_create("s").unwrap();
    img.close().unwrap();

    let err = remove(&store, pool, "img", &NoProgress).unwrap_err();
    assert!(matches!(err, ImageError::Busy(_)));
}

#[test]
fn rename_round_trip_restores_lookup() {
    let (_cluster, pool, store) = cluster_with_pool();
    create(&store, pool, "a", 1 << 20, &Default::default()).unwrap();

    rename(&store, pool, "a", "b").unwrap();
    assert_eq!(list(&store, pool).unwrap(), vec!["b".to_string()]);
    assert!(Image::open(store.clone(), pool, "a").is_err());

    rename(&store, pool, "b", "a").unwrap();
    assert_eq!(list(&store, pool).unwrap(), vec!["a".to_string()]);
    let img = Image::open(store, pool, "a").unwrap();
    assert_eq!(img.stat().unwrap().size, 1 << 20);
    img.close().unwrap();
}

#[test]
fn rename_to_occupied_name_fails() {
    let (_cluster, pool, store) = cluster_with_pool();
    create(&store, pool, "a", 1 << 20, &Default::default()).unwrap();
    create(&store, pool, "b", 1 << 20, &Default::default()).unwrap();
    let err = rename(&store, pool, "a", "b").unwrap_err();
    assert!(matches!(err, ImageError::AlreadyExists(_)));
}

#[test]
fn open_missing_image_is_not_found() {
    let (_cluster, pool, store) = cluster_with_pool();
    assert!(Image::open(store, pool, "nope").unwrap_err().is_not_found());
}
