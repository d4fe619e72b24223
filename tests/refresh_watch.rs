use blockimg::{create, CreateOptions, Features, Image, MemCluster, ObjectStore};
use std::sync::Arc;

fn two_handles(features: Features) -> (Image, Image) {
    let cluster = MemCluster::new();
    let pool = cluster.create_pool("rbd");
    let a: Arc<dyn ObjectStore> = Arc::new(cluster.connect());
    let b: Arc<dyn ObjectStore> = Arc::new(cluster.connect());
    create(
        &a,
        pool,
        "img",
        8 << 20,
        &CreateOptions {
            features,
            ..Default::default()
        },
    )
    .unwrap();
    (
        Image::open(a, pool, "img").unwrap(),
        Image::open(b, pool, "img").unwrap(),
    )
}

#[test]
fn peer_observes_resize_after_notification() {
    let (a, b) = two_handles(Features::empty());
    assert_eq!(b.stat().unwrap().size, 8 << 20);

    a.resize(32 << 20).unwrap();

    // The header-update notification bumped B's refresh counter; its
    // next metadata-dependent call refreshes.
    assert_eq!(b.stat().unwrap().size, 32 << 20);
    b.close().unwrap();
    a.close().unwrap();
}

#[test]
fn peer_observes_new_snapshot() {
    let (a, b) = two_handles(Features::empty());
    a.snap_create("s1").unwrap();

    let snaps = b.snap_list().unwrap();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].name, "s1");
    b.close().unwrap();
    a.close().unwrap();
}

#[test]
fn deleted_selected_snapshot_flags_not_fails() {
    let (a, b) = two_handles(Features::empty());
    a.snap_create("s1").unwrap();

    b.set_snap_selection(Some("s1")).unwrap();
    assert!(b.read(0, 16).is_ok());

    a.snap_remove("s1").unwrap();

    // B's selection is gone underneath it: reads report the loss but
    // the context stays usable.
    let err = b.read(0, 16).unwrap_err();
    assert!(err.is_not_found());

    b.set_snap_selection(None).unwrap();
    assert!(b.read(0, 16).is_ok());
    b.close().unwrap();
    a.close().unwrap();
}

#[test]
fn writes_after_peer_snapshot_use_new_context() {
    let (a, b) = two_handles(Features::empty());

    b.write(0, &[b'0'; 4096]).unwrap();
    a.snap_create("s").unwrap();

    // B refreshes before this write and tags it with the new snap
    // context, so the snapshot keeps the old bytes.
    b.write(0, &[b'1'; 4096]).unwrap();

    b.set_snap_selection(Some("s")).unwrap();
    assert_eq!(&b.read(0, 4096).unwrap()[..], &[b'0'; 4096][..]);
    b.set_snap_selection(None).unwrap();
    assert_eq!(&b.read(0, 4096).unwrap()[..], &[b'1'; 4096][..]);
    b.close().unwrap();
    a.close().unwrap();
}

#[test]
fn snapshots_of_snapshots_preserve_history() {
    let (a, _b) = two_handles(Features::empty());

    a.write(0, b"one").unwrap();
    a.snap_create("v1").unwrap();
    a.write(0, b"two").unwrap();
    a.snap_create("v2").unwrap();
    a.write(0, b"tri").unwrap();

    a.set_snap_selection(Some("v1")).unwrap();
    assert_eq!(&a.read(0, 3).unwrap()[..], b"one");
    a.set_snap_selection(Some("v2")).unwrap();
    assert_eq!(&a.read(0, 3).unwrap()[..], b"two");
    a.set_snap_selection(None).unwrap();
    assert_eq!(&a.read(0, 3).unwrap()[..], b"tri");
    a.close().unwrap();
}

#[test]
fn cancel_async_requests_leaves_context_usable() {
    let (a, _b) = two_handles(Features::empty());
    a.context().cancel_async_requests();
    a.context().flush_async_operations();
    a.write(0, b"still fine").unwrap();
    assert_eq!(&a.read(0, 10).unwrap()[..], b"still fine");
    a.close().unwrap();
}
