//! End-to-end scenarios for the flash store, run against the NAND
//! simulator on a 256-block x 128-page x 512-byte device.

use driftq_store::{
    FlashGeometry, FlashStore, InitMode, SimFlash, StoreAttributes, StoreError, StoreHandle,
    MAX_STORES,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn geometry() -> FlashGeometry {
    FlashGeometry {
        num_blocks: 256,
        pages_per_block: 128,
        page_size: 512,
    }
}

fn formatted_store() -> FlashStore<SimFlash> {
    init_tracing();
    FlashStore::init(SimFlash::new(geometry()), InitMode::Format).unwrap()
}

#[test]
fn format_reclaims_every_block() {
    let store = formatted_store();
    assert_eq!(store.reclaimed_blocks(), 256);

    let stats = store.stats(true, false);
    assert_eq!(stats.free_blocks, 256);
    assert_eq!(stats.used_blocks, 0);
    assert_eq!(stats.bad_blocks, 0);
    assert_eq!(stats.error_count, 0);
}

#[test]
fn format_classifies_factory_bad_blocks() {
    init_tracing();
    let sim = SimFlash::new(geometry());
    sim.mark_bad(10);
    sim.mark_bad(11);
    sim.mark_bad(250);

    let store = FlashStore::init(sim, InitMode::Format).unwrap();
    assert_eq!(store.reclaimed_blocks(), 253);

    let stats = store.stats(true, false);
    assert_eq!(stats.free_blocks, 253);
    assert_eq!(stats.bad_blocks, 3);
    assert_eq!(stats.used_blocks, 0);
}

#[test]
fn single_object_round_trip() {
    let store = formatted_store();
    let handle = store.create(None).unwrap();
    assert_eq!(handle, StoreHandle(0));

    let payload: Vec<u8> = (0..50).map(|i| (i % 255) as u8).collect();
    let sid = store.enqueue(handle, &payload, &[], 0).unwrap();
    assert_eq!(store.object_count(handle).unwrap(), 1);

    let object = store.dequeue(handle, 0).unwrap();
    assert_eq!(object.data, payload);
    assert_eq!(object.size(), 50);
    assert_eq!(object.handle, 0);
    assert_eq!(object.sid, sid);
    assert!(object.timestamp > 0);

    store.release(handle, sid).unwrap();
    store.relinquish(handle, sid).unwrap();
    assert_eq!(store.object_count(handle).unwrap(), 0);
}

#[test]
fn page_spanning_object_round_trip() {
    let store = formatted_store();
    let handle = store
        .create(Some(StoreAttributes {
            max_data_size: 1024,
        }))
        .unwrap();

    // 1.5 pages of payload: the framed object occupies two pages
    let payload: Vec<u8> = (0..768).map(|i| (i % 253) as u8).collect();
    let first = store.enqueue(handle, &payload, &[], 0).unwrap();
    let second = store.enqueue(handle, &[0xEE; 16], &[], 0).unwrap();
    assert_eq!(second.raw() - first.raw(), 2, "spanning object advanced two pages");

    let object = store.dequeue(handle, 0).unwrap();
    assert_eq!(object.data, payload);
    store.release(handle, object.sid).unwrap();
}

#[test]
fn scatter_gather_enqueue() {
    let store = formatted_store();
    let handle = store.create(None).unwrap();

    let head = vec![1u8; 20];
    let tail = vec![2u8; 30];
    let sid = store.enqueue(handle, &head, &tail, 0).unwrap();

    let object = store.dequeue(handle, 0).unwrap();
    let mut expected = head.clone();
    expected.extend_from_slice(&tail);
    assert_eq!(object.data, expected);
    store.release(handle, sid).unwrap();
}

#[test]
fn store_table_fills_and_reuses_slots() {
    let store = formatted_store();

    let mut handles = Vec::new();
    for expected in 0..MAX_STORES as u32 {
        let handle = store.create(None).unwrap();
        assert_eq!(handle, StoreHandle(expected));
        handles.push(handle);
    }

    assert!(matches!(
        store.create(None),
        Err(StoreError::InvalidHandle)
    ));

    store.destroy(StoreHandle(3)).unwrap();
    assert_eq!(store.create(None).unwrap(), StoreHandle(3));
}

#[test]
fn relinquished_objects_are_skipped_in_order() {
    let store = formatted_store();
    let handle = store.create(None).unwrap();

    let mut sids = Vec::new();
    for i in 0..10u8 {
        let payload = vec![i; 50];
        sids.push(store.enqueue(handle, &payload, &[], 0).unwrap());
    }
    assert_eq!(store.object_count(handle).unwrap(), 10);

    // drop the 3rd and 7th before ever dequeuing them
    store.relinquish(handle, sids[2]).unwrap();
    store.relinquish(handle, sids[6]).unwrap();
    assert_eq!(store.object_count(handle).unwrap(), 8);

    let expected: Vec<u8> = vec![0, 1, 3, 4, 5, 7, 8, 9];
    for &marker in &expected {
        let object = store.dequeue(handle, 0).unwrap();
        assert_eq!(object.data, vec![marker; 50]);
        store.release(handle, object.sid).unwrap();
        store.relinquish(handle, object.sid).unwrap();
    }

    assert_eq!(store.object_count(handle).unwrap(), 0);
    assert!(matches!(
        store.dequeue(handle, 0),
        Err(StoreError::Timeout)
    ));
}

#[test]
fn retrieve_after_release_is_idempotent() {
    let store = formatted_store();
    let handle = store.create(None).unwrap();

    let payload = vec![0xA5u8; 200];
    let sid = store.enqueue(handle, &payload, &[], 0).unwrap();

    let object = store.dequeue(handle, 0).unwrap();
    assert_eq!(object.data, payload);
    store.release(handle, sid).unwrap();

    let again = store.retrieve(handle, sid, 0).unwrap();
    assert_eq!(again.data, payload);
    assert_eq!(again.sid, sid);
    store.release(handle, sid).unwrap();
}

#[test]
fn retrieve_does_not_move_read_cursor() {
    let store = formatted_store();
    let handle = store.create(None).unwrap();

    let sid_a = store.enqueue(handle, &[0xAA; 40], &[], 0).unwrap();
    store.enqueue(handle, &[0xBB; 40], &[], 0).unwrap();

    let first = store.dequeue(handle, 0).unwrap();
    assert_eq!(first.data, vec![0xAA; 40]);
    store.release(handle, sid_a).unwrap();

    let again = store.retrieve(handle, sid_a, 0).unwrap();
    assert_eq!(again.data, vec![0xAA; 40]);
    store.release(handle, sid_a).unwrap();

    // the cursor still points at the second object
    let second = store.dequeue(handle, 0).unwrap();
    assert_eq!(second.data, vec![0xBB; 40]);
    store.release(handle, second.sid).unwrap();
}

#[test]
fn empty_dequeue_times_out() {
    let store = formatted_store();
    let handle = store.create(None).unwrap();

    assert!(matches!(
        store.dequeue(handle, 0),
        Err(StoreError::Timeout)
    ));

    // still empty after an enqueue/dequeue/release cycle
    let sid = store.enqueue(handle, &[1, 2, 3], &[], 0).unwrap();
    let object = store.dequeue(handle, 0).unwrap();
    store.release(handle, sid).unwrap();
    assert_eq!(object.data, vec![1, 2, 3]);
    assert!(matches!(
        store.dequeue(handle, 0),
        Err(StoreError::Timeout)
    ));
}

#[test]
fn checkout_lease_is_exclusive() {
    let store = formatted_store();
    let handle = store.create(None).unwrap();

    let sid_a = store.enqueue(handle, &[1; 10], &[], 0).unwrap();
    store.enqueue(handle, &[2; 10], &[], 0).unwrap();

    let object = store.dequeue(handle, 0).unwrap();
    assert_eq!(object.sid, sid_a);

    // a second checkout is refused while the first is outstanding
    assert!(matches!(
        store.dequeue(handle, 0),
        Err(StoreError::FailedStore { .. })
    ));
    assert!(matches!(
        store.retrieve(handle, sid_a, 0),
        Err(StoreError::FailedStore { .. })
    ));

    store.release(handle, sid_a).unwrap();
    let second = store.dequeue(handle, 0).unwrap();
    assert_eq!(second.data, vec![2; 10]);
    store.release(handle, second.sid).unwrap();
}

#[test]
fn release_with_wrong_sid_keeps_stage_locked() {
    let store = formatted_store();
    let handle = store.create(None).unwrap();

    let sid = store.enqueue(handle, &[7; 10], &[], 0).unwrap();
    store.enqueue(handle, &[8; 10], &[], 0).unwrap();
    store.dequeue(handle, 0).unwrap();

    let bogus = store.enqueue(handle, &[9; 10], &[], 0).unwrap();
    assert!(matches!(
        store.release(handle, bogus),
        Err(StoreError::FailedStore { .. })
    ));

    // the stage is still checked out
    assert!(matches!(
        store.dequeue(handle, 0),
        Err(StoreError::FailedStore { .. })
    ));

    store.release(handle, sid).unwrap();
    assert!(store.dequeue(handle, 0).is_ok());
}

#[test]
fn store_full_surfaces_and_preserves_queue() {
    init_tracing();
    // a tiny device fills quickly
    let sim = SimFlash::new(FlashGeometry {
        num_blocks: 4,
        pages_per_block: 8,
        page_size: 512,
    });
    let store = FlashStore::init(sim, InitMode::Format).unwrap();
    let handle = store
        .create(Some(StoreAttributes {
            max_data_size: 1024,
        }))
        .unwrap();

    let payload = vec![0x5Au8; 1024];
    let mut enqueued = 0u64;
    let full = loop {
        match store.enqueue(handle, &payload, &[], 0) {
            Ok(_) => enqueued += 1,
            Err(err) => break err,
        }
    };
    assert!(matches!(full, StoreError::StoreFull { .. }));
    assert!(enqueued > 0);
    assert_eq!(store.object_count(handle).unwrap(), enqueued);

    // everything accepted before the device filled is still dequeueable
    for _ in 0..enqueued {
        let object = store.dequeue(handle, 0).unwrap();
        assert_eq!(object.data, payload);
        store.release(handle, object.sid).unwrap();
    }
    assert_eq!(store.object_count(handle).unwrap(), enqueued);
    assert!(matches!(
        store.dequeue(handle, 0),
        Err(StoreError::Timeout)
    ));
}

#[test]
fn count_law_over_interleaved_operations() {
    let store = formatted_store();
    let handle = store.create(None).unwrap();

    let mut sids = Vec::new();
    for i in 0..20u8 {
        sids.push(store.enqueue(handle, &[i; 30], &[], 0).unwrap());
    }
    assert_eq!(store.object_count(handle).unwrap(), 20);

    for sid in sids.iter().take(8) {
        store.relinquish(handle, *sid).unwrap();
    }
    assert_eq!(store.object_count(handle).unwrap(), 12);

    for i in 20..25u8 {
        store.enqueue(handle, &[i; 30], &[], 0).unwrap();
    }
    assert_eq!(store.object_count(handle).unwrap(), 17);
}

#[test]
fn stores_are_independent_queues() {
    let store = formatted_store();
    let a = store.create(None).unwrap();
    let b = store.create(None).unwrap();

    store.enqueue(a, &[0xAA; 12], &[], 0).unwrap();
    store.enqueue(b, &[0xBB; 12], &[], 0).unwrap();
    store.enqueue(a, &[0xAC; 12], &[], 0).unwrap();

    let from_b = store.dequeue(b, 0).unwrap();
    assert_eq!(from_b.data, vec![0xBB; 12]);
    store.release(b, from_b.sid).unwrap();

    let from_a = store.dequeue(a, 0).unwrap();
    assert_eq!(from_a.data, vec![0xAA; 12]);
    store.release(a, from_a.sid).unwrap();

    assert_eq!(store.object_count(a).unwrap(), 2);
    assert_eq!(store.object_count(b).unwrap(), 1);
}

#[test]
fn write_fault_recovery_preserves_committed_objects() {
    init_tracing();
    let sim = SimFlash::new(FlashGeometry {
        num_blocks: 16,
        pages_per_block: 8,
        page_size: 512,
    });
    // the first store block will fail on its fourth page
    sim.fail_page_write(0, 3);

    let store = FlashStore::init(sim, InitMode::Format).unwrap();
    let handle = store
        .create(Some(StoreAttributes {
            max_data_size: 2048,
        }))
        .unwrap();

    // object one fits before the fault; object two trips over it
    let first = vec![1u8; 800];
    let second = vec![2u8; 800];
    store.enqueue(handle, &first, &[], 0).unwrap();
    store.enqueue(handle, &second, &[], 0).unwrap();

    let stats = store.stats(true, false);
    assert_eq!(stats.error_count, 1);

    let object = store.dequeue(handle, 0).unwrap();
    assert_eq!(object.data, first);
    store.release(handle, object.sid).unwrap();

    let object = store.dequeue(handle, 0).unwrap();
    assert_eq!(object.data, second);
    store.release(handle, object.sid).unwrap();
}
