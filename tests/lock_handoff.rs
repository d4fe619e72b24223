use blockimg::{create, CreateOptions, Features, Image, MemCluster, ObjectStore};
use std::sync::Arc;

fn two_clients() -> (u64, Arc<dyn ObjectStore>, Arc<dyn ObjectStore>) {
    let cluster = MemCluster::new();
    let pool = cluster.create_pool("rbd");
    let x: Arc<dyn ObjectStore> = Arc::new(cluster.connect());
    let y: Arc<dyn ObjectStore> = Arc::new(cluster.connect());
    create(
        &x,
        pool,
        "img",
        8 << 20,
        &CreateOptions {
            features: Features::EXCLUSIVE_LOCK,
            ..Default::default()
        },
    )
    .unwrap();
    (pool, x, y)
}

#[test]
fn first_writer_becomes_owner() {
    let (pool, x, _y) = two_clients();
    let img = Image::open(x, pool, "img").unwrap();
    assert!(!img.is_exclusive_lock_owner());
    img.write(0, b"data").unwrap();
    assert!(img.is_exclusive_lock_owner());
    img.close().unwrap();
}

#[test]
fn lock_hands_off_between_clients() {
    let (pool, store_x, store_y) = two_clients();
    let x = Image::open(store_x, pool, "img").unwrap();
    let y = Image::open(store_y, pool, "img").unwrap();

    // X writes and takes ownership.
    x.write(0, b"from x").unwrap();
    assert!(x.is_exclusive_lock_owner());
    assert!(!y.is_exclusive_lock_owner());

    // Y's write suspends, requests the lock, X flushes and releases,
    // Y acquires and completes.
    y.write(100, b"from y").unwrap();
    assert!(y.is_exclusive_lock_owner());
    assert!(!x.is_exclusive_lock_owner());

    // Both writes are visible.
    assert_eq!(&y.read(0, 6).unwrap()[..], b"from x");
    assert_eq!(&y.read(100, 6).unwrap()[..], b"from y");

    // And the lock can travel back.
    x.write(200, b"again").unwrap();
    assert!(x.is_exclusive_lock_owner());
    assert!(!y.is_exclusive_lock_owner());

    y.close().unwrap();
    x.close().unwrap();
}

#[test]
fn non_owner_delegates_resize_to_owner() {
    let (pool, store_x, store_y) = two_clients();
    let x = Image::open(store_x, pool, "img").unwrap();
    let y = Image::open(store_y, pool, "img").unwrap();

    x.write(0, b"seed").unwrap();
    assert!(x.is_exclusive_lock_owner());

    // Y is not the owner; the resize travels over the watch channel and
    // runs on X.
    y.resize(16 << 20).unwrap();
    assert!(x.is_exclusive_lock_owner());
    assert!(!y.is_exclusive_lock_owner());
    assert_eq!(y.stat().unwrap().size, 16 << 20);
    assert_eq!(x.stat().unwrap().size, 16 << 20);

    y.close().unwrap();
    x.close().unwrap();
}

#[test]
fn non_owner_delegates_snapshot_create() {
    let (pool, store_x, store_y) = two_clients();
    let x = Image::open(store_x, pool, "img").unwrap();
    let y = Image::open(store_y, pool, "img").unwrap();

    x.write(0, b"seed").unwrap();
    y.snap_create("from-y").unwrap();

    let snaps = x.snap_list().unwrap();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].name, "from-y");

    y.close().unwrap();
    x.close().unwrap();
}

#[test]
fn close_releases_the_lock_for_peers() {
    let (pool, store_x, store_y) = two_clients();
    let x = Image::open(store_x, pool, "img").unwrap();
    x.write(0, b"seed").unwrap();
    assert!(x.is_exclusive_lock_owner());
    x.close().unwrap();

    let y = Image::open(store_y, pool, "img").unwrap();
    y.write(0, b"next").unwrap();
    assert!(y.is_exclusive_lock_owner());
    y.close().unwrap();
}

#[test]
fn explicit_acquire_would_block_while_peer_holds() {
    let (pool, store_x, store_y) = two_clients();
    let x = Image::open(store_x, pool, "img").unwrap();
    let y = Image::open(store_y, pool, "img").unwrap();

    x.acquire_exclusive_lock().unwrap();
    assert!(x.is_exclusive_lock_owner());

    let err = y.acquire_exclusive_lock().unwrap_err();
    assert!(matches!(err, blockimg::ImageError::WouldBlock));

    x.release_exclusive_lock().unwrap();
    y.acquire_exclusive_lock().unwrap();
    assert!(y.is_exclusive_lock_owner());

    y.close().unwrap();
    x.close().unwrap();
}

#[test]
fn reads_never_require_ownership() {
    let (pool, store_x, store_y) = two_clients();
    let x = Image::open(store_x, pool, "img").unwrap();
    let y = Image::open(store_y, pool, "img").unwrap();

    x.write(0, b"owner data").unwrap();
    x.flush().unwrap();

    assert_eq!(&y.read(0, 10).unwrap()[..], b"owner data");
    assert!(!y.is_exclusive_lock_owner());

    y.close().unwrap();
    x.close().unwrap();
}
