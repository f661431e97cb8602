use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use rtsp_relay::config::PushSettings;
use rtsp_relay::{Accept, EncodedFrame, PushHub};

fn hub(timeout_ms: u64, depth: usize) -> PushHub {
    PushHub::new(&PushSettings {
        quality: 75,
        delivery_timeout: Duration::from_millis(timeout_ms),
        queue_depth: depth,
    })
}

fn frame(sequence: u64) -> EncodedFrame {
    EncodedFrame {
        sequence,
        captured_at: SystemTime::now(),
        width: 2,
        height: 2,
        data: Bytes::from(vec![0xFF, 0xD8, sequence as u8, 0xFF, 0xD9]),
    }
}

fn collector() -> (
    impl FnMut(&EncodedFrame) -> Accept + Send + 'static,
    crossbeam_channel::Receiver<u64>,
) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let subscriber = move |frame: &EncodedFrame| {
        if tx.send(frame.sequence).is_ok() {
            Accept::Delivered
        } else {
            Accept::Closed
        }
    };
    (subscriber, rx)
}

fn drain(rx: &crossbeam_channel::Receiver<u64>, count: usize) -> Vec<u64> {
    (0..count)
        .map(|_| {
            rx.recv_timeout(Duration::from_secs(5))
                .expect("frame delivered")
        })
        .collect()
}

#[test]
fn hung_subscriber_is_dropped_without_stalling_others() {
    let hub = hub(100, 2);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let hung = hub
        .register(move |_: &EncodedFrame| {
            // Blocks until the test ends.
            let _ = release_rx.recv();
            Accept::Closed
        })
        .unwrap();
    let (healthy, rx) = collector();
    let healthy = hub.register(healthy).unwrap();

    let started = Instant::now();
    let mut dropped = 0;
    for seq in 1..=10 {
        let before = Instant::now();
        let report = hub.publish(frame(seq));
        assert!(
            before.elapsed() < Duration::from_millis(600),
            "publish {seq} took {:?}",
            before.elapsed()
        );
        dropped += report.dropped;
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(dropped, 1);
    assert!(!hub.is_registered(hung));
    assert!(hub.is_registered(healthy));
    assert_eq!(hub.subscriber_count(), 1);
    assert_eq!(drain(&rx, 10), (1..=10).collect::<Vec<_>>());

    drop(release_tx);
}

#[test]
fn subscriber_stuck_in_accept_is_dropped_within_timeout() {
    let settings = PushSettings::default();
    let timeout = settings.delivery_timeout;
    let hub = PushHub::new(&settings);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let (entered_tx, entered_rx) = crossbeam_channel::bounded::<()>(1);
    let hung = hub
        .register(move |_: &EncodedFrame| {
            let _ = entered_tx.try_send(());
            let _ = release_rx.recv();
            Accept::Closed
        })
        .unwrap();
    let (healthy, rx) = collector();
    let healthy = hub.register(healthy).unwrap();

    // One frame is enough; the queue is nowhere near full.
    assert_eq!(hub.publish(frame(1)).delivered, 2);
    entered_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("accept entered");
    let entered = Instant::now();

    while hub.is_registered(hung) && entered.elapsed() < timeout * 4 {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!hub.is_registered(hung));
    assert!(entered.elapsed() < timeout * 2, "took {:?}", entered.elapsed());
    assert!(hub.is_registered(healthy));

    // Slow publishing keeps reaching the healthy subscriber.
    for seq in 2..=3 {
        std::thread::sleep(Duration::from_millis(300));
        let report = hub.publish(frame(seq));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 0);
    }
    assert_eq!(drain(&rx, 3), vec![1, 2, 3]);

    drop(release_tx);
}

#[test]
fn overdue_accept_counts_as_dropped_on_next_publish() {
    let hub = hub(100, 8);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    hub.register(move |_: &EncodedFrame| {
        let _ = release_rx.recv();
        Accept::Closed
    })
    .unwrap();

    assert_eq!(hub.publish(frame(1)).delivered, 1);
    std::thread::sleep(Duration::from_millis(250));
    let report = hub.publish(frame(2));
    assert_eq!(report.delivered, 0);
    assert_eq!(report.dropped, 1);
    assert_eq!(hub.subscriber_count(), 0);

    drop(release_tx);
}

#[test]
fn concurrent_publishers_keep_one_order_for_all_subscribers() {
    let hub = Arc::new(hub(1_000, 4));
    let (a, rx_a) = collector();
    let (b, rx_b) = collector();
    hub.register(a).unwrap();
    hub.register(b).unwrap();

    let publishers: Vec<_> = (0..4u64)
        .map(|p| {
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || {
                for i in 0..25u64 {
                    hub.publish(frame(p * 100 + i));
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.join().unwrap();
    }

    let seen_a = drain(&rx_a, 100);
    let seen_b = drain(&rx_b, 100);
    assert_eq!(seen_a, seen_b);

    // Each publisher's own frames stay in its publish order.
    for p in 0..4u64 {
        let mine: Vec<u64> = seen_a.iter().copied().filter(|s| s / 100 == p).collect();
        assert_eq!(mine, (0..25).map(|i| p * 100 + i).collect::<Vec<_>>());
    }

    let mut unique = seen_a.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 100);
}

#[test]
fn churning_subscribers_see_gap_free_runs_under_concurrent_publishers() {
    const PUBLISHERS: u64 = 3;
    const PER_PUBLISHER: u64 = 200;
    let hub = Arc::new(hub(2_000, 8));
    let (stable, rx_stable) = collector();
    hub.register(stable).unwrap();

    let churn = {
        let hub = Arc::clone(&hub);
        std::thread::spawn(move || {
            let mut finished = Vec::new();
            for _ in 0..20 {
                let (sub, rx) = collector();
                let id = hub.register(sub).unwrap();
                std::thread::sleep(Duration::from_millis(3));
                assert!(hub.unregister(id));
                finished.push(rx);
            }
            finished
        })
    };
    let publishers: Vec<_> = (0..PUBLISHERS)
        .map(|p| {
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || {
                for i in 0..PER_PUBLISHER {
                    hub.publish(frame(p * 1_000 + i));
                    if i % 10 == 0 {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.join().unwrap();
    }
    let churned = churn.join().unwrap();

    // Per publisher, every run is consecutive: no gaps, duplicates or reordering.
    let check_runs = |seen: &[u64]| {
        for p in 0..PUBLISHERS {
            let mine: Vec<u64> = seen
                .iter()
                .copied()
                .filter(|s| s / 1_000 == p)
                .collect();
            assert!(
                mine.windows(2).all(|w| w[1] == w[0] + 1),
                "publisher {p} run has a gap: {mine:?}"
            );
        }
    };

    let stable_seen = drain(&rx_stable, (PUBLISHERS * PER_PUBLISHER) as usize);
    check_runs(&stable_seen);
    for p in 0..PUBLISHERS {
        let count = stable_seen.iter().filter(|s| *s / 1_000 == p).count();
        assert_eq!(count as u64, PER_PUBLISHER);
    }

    for rx in churned {
        // Unregistered: the delivery thread drains its queue, then the channel closes.
        let seen: Vec<u64> = rx.iter().collect();
        check_runs(&seen);
    }
}

#[test]
fn subscriber_added_mid_stream_sees_only_later_frames() {
    let hub = hub(200, 4);
    let (early, rx_early) = collector();
    hub.register(early).unwrap();
    hub.publish(frame(1));
    hub.publish(frame(2));

    let (late, rx_late) = collector();
    hub.register(late).unwrap();
    hub.publish(frame(3));

    assert_eq!(drain(&rx_early, 3), vec![1, 2, 3]);
    assert_eq!(drain(&rx_late, 1), vec![3]);
    assert!(rx_late.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn disconnected_consumer_is_unregistered_on_next_publish() {
    let hub = hub(200, 4);
    let (sub, rx) = collector();
    let id = hub.register(sub).unwrap();
    hub.publish(frame(1));
    assert_eq!(drain(&rx, 1), vec![1]);

    // The consumer goes away; its next delivery reports Closed.
    drop(rx);
    hub.publish(frame(2));

    let deadline = Instant::now() + Duration::from_secs(2);
    while hub.is_registered(id) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!hub.is_registered(id));
    assert_eq!(hub.publish(frame(3)).delivered, 0);
}
