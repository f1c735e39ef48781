//! Snapshot restore properties

use proptest::prelude::*;
use tether_store::{LiveDocument, SnapshotStore};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn restore_returns_exact_bytes(original in proptest::collection::vec(any::<u8>(), 0..512),
                                   clobber in proptest::collection::vec(any::<u8>(), 0..512)) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(tmp.path().join("snapshots")).unwrap();
        let live = LiveDocument::new(tmp.path().join("host.json"));

        live.write_bytes(&original).unwrap();
        store.capture(&live).unwrap();
        live.write_bytes(&clobber).unwrap();

        store.restore_latest(&live).unwrap();
        prop_assert_eq!(live.read_bytes().unwrap(), original.clone());

        // A second restore changes nothing
        store.restore_latest(&live).unwrap();
        prop_assert_eq!(live.read_bytes().unwrap(), original);
    }
}

#[test]
fn snapshots_accumulate_in_creation_order() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SnapshotStore::open(tmp.path()).unwrap();
    let ids: Vec<_> = (0..5)
        .map(|i| store.create(format!("{{\"n\":{i}}}").as_bytes()).unwrap().id)
        .collect();
    let listed: Vec<_> = store.list().unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(listed, ids);
    assert_eq!(store.latest().unwrap().unwrap().id, ids[4]);
}
