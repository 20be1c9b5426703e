//! Stream pool: round robin, current stream and the three-integer encoding

mod common;

use std::sync::Arc;

use common::{SimFixture, MIB};
use npuforge::stream::{StreamClass, StreamKind, STREAMS_PER_POOL};
use npuforge::{NpuForgeError, StreamGuard, StreamPool};
use proptest::prelude::*;

#[test]
fn test_round_robin_wraps_after_pool_size() {
    let fixture = SimFixture::new(1, MIB);
    let first = fixture.pool_stream(0, false);
    for _ in 1..STREAMS_PER_POOL {
        assert_ne!(fixture.pool_stream(0, false), first);
    }
    // The 33rd request lands on the first stream again.
    let again = fixture.pool_stream(0, false);
    assert_eq!(again, first);
    assert_eq!(again.native(), first.native());
}

#[test]
fn test_priority_groups_rotate_independently() {
    let fixture = SimFixture::new(1, MIB);
    let low = fixture.pool_stream(0, false);
    let high = fixture.pool_stream(0, true);
    assert_eq!(
        low.kind(),
        StreamKind::Pool {
            class: StreamClass::Low,
            index: 0
        }
    );
    assert_eq!(
        high.kind(),
        StreamKind::Pool {
            class: StreamClass::High,
            index: 0
        }
    );
    assert_ne!(low.native(), high.native());
}

#[test]
fn test_default_stream_is_stable() {
    let fixture = SimFixture::new(2, MIB);
    let a = fixture.default_stream(1);
    let b = fixture.default_stream(1);
    assert_eq!(a, b);
    assert_eq!(a.native(), b.native());
    assert_eq!(a.id(), 0);
    assert_ne!(a, fixture.default_stream(0));
}

#[test]
fn test_current_stream_is_per_thread() {
    let fixture = SimFixture::new(1, MIB);
    let stream = fixture.pool_stream(0, false);
    fixture.streams.set_current_stream(&stream);
    assert_eq!(fixture.streams.current_stream(Some(0)).unwrap(), stream);

    let streams: Arc<StreamPool> = fixture.streams.clone();
    let default = fixture.default_stream(0);
    let seen = std::thread::spawn(move || streams.current_stream(Some(0)).unwrap())
        .join()
        .unwrap();
    assert_eq!(seen, default);
}

#[test]
fn test_stream_guard_restores_current_stream() {
    let fixture = SimFixture::new(1, MIB);
    let default = fixture.default_stream(0);
    let pooled = fixture.pool_stream(0, true);
    {
        let _guard = StreamGuard::new(&fixture.streams, &pooled).unwrap();
        assert_eq!(fixture.streams.current_stream(Some(0)).unwrap(), pooled);
    }
    assert_eq!(fixture.streams.current_stream(Some(0)).unwrap(), default);
}

#[test]
fn test_stream_query_and_synchronize() {
    let fixture = SimFixture::new(1, MIB);
    let stream = fixture.pool_stream(0, false);
    assert!(stream.query().unwrap());

    fixture.driver.launch_work(stream.native()).unwrap();
    assert!(!stream.query().unwrap());
    stream.synchronize(None).unwrap();
    assert!(stream.query().unwrap());
}

#[test]
fn test_invalid_device_rejected() {
    let fixture = SimFixture::new(2, MIB);
    assert!(fixture.streams.stream_from_pool(false, Some(2)).is_err());
    assert!(fixture.streams.default_stream(Some(-1)).is_err());
}

#[test]
fn test_unpack3_rejects_unknown_stream_class() {
    let fixture = SimFixture::new(1, MIB);
    let mut data = fixture.pool_stream(0, false).pack3();
    assert_eq!(data.stream_id, 1);

    // Same pool index, class bits that name neither group.
    data.stream_id = 5;
    assert!(matches!(
        fixture.streams.unpack3(data),
        Err(NpuForgeError::InvalidArgument(_))
    ));
}

proptest! {
    #[test]
    fn prop_pack3_round_trip(high in any::<bool>(), skip in 0usize..100, device in 0i32..3) {
        let fixture = SimFixture::new(3, MIB);
        for _ in 0..skip {
            fixture.streams.stream_from_pool(high, Some(device)).unwrap();
        }
        let stream = fixture.streams.stream_from_pool(high, Some(device)).unwrap();
        let data = stream.pack3();
        prop_assert_eq!(data.device_index, device);

        let unpacked = fixture.streams.unpack3(data).unwrap();
        prop_assert_eq!(&unpacked, &stream);
        prop_assert_eq!(unpacked.native(), stream.native());
        prop_assert_eq!(unpacked.pack3(), data);
    }
}
