use std::collections::HashMap;
use std::time::Duration;

use draw_this::bus::{DeliveryPolicy, SignalBus};
use draw_this::events::{EndReason, SessionId, SignalKind};
use draw_this::store::RootId;
use futures::StreamExt;
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_publishers_keep_their_own_order() {
    let bus = SignalBus::new(4, DeliveryPolicy::default());
    let mut all = bus.subscribe(|k| matches!(k, SignalKind::FolderToggled { .. }));

    let mut publishers = Vec::new();
    for p in 0..3 {
        let publisher = bus.publisher(&format!("worker-{p}"));
        publishers.push(tokio::spawn(async move {
            for i in 0..50 {
                publisher
                    .publish(SignalKind::FolderToggled {
                        root_id: RootId(i),
                        active: true,
                    })
                    .await;
            }
        }));
    }
    // A thread outside the runtime publishes too.
    let blocking = bus.publisher("thread");
    let thread = std::thread::spawn(move || {
        for i in 0..50 {
            blocking.blocking_publish(SignalKind::FolderToggled {
                root_id: RootId(i),
                active: false,
            });
        }
    });

    let mut last: HashMap<_, i64> = HashMap::new();
    for _ in 0..200 {
        let signal = timeout(Duration::from_secs(5), all.recv())
            .await
            .unwrap()
            .unwrap();
        let SignalKind::FolderToggled { root_id, .. } = signal.kind else {
            panic!("unexpected {signal:?}");
        };
        let prev = last.insert(signal.sender, root_id.0);
        assert!(prev.is_none_or(|p| p + 1 == root_id.0));
    }
    assert_eq!(last.len(), 4);
    assert!(last.values().all(|&v| v == 49));
    assert_eq!(all.dropped(), 0);

    for p in publishers {
        p.await.unwrap();
    }
    thread.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_end_is_the_last_signal_anyone_sees() {
    let bus = SignalBus::new(8, DeliveryPolicy::default());
    let stream = bus.subscribe_all().into_stream();
    let controller = bus.publisher("controller");

    controller
        .publish(SignalKind::Navigate { delta: 1, position: 1 })
        .await;
    controller
        .publish(SignalKind::SessionEnded {
            session_id: SessionId(4),
            reason: EndReason::Stopped,
        })
        .await;
    assert_eq!(
        controller
            .publish(SignalKind::Navigate { delta: 1, position: 2 })
            .await,
        0
    );

    let kinds: Vec<SignalKind> = timeout(Duration::from_secs(5), stream.map(|s| s.kind).collect())
        .await
        .unwrap();
    assert_eq!(kinds.len(), 2);
    assert!(matches!(kinds[1], SignalKind::SessionEnded { .. }));
    assert!(bus.has_ended());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribers_racing_the_session_end_still_terminate() {
    for round in 0..50 {
        let bus = SignalBus::new(4, DeliveryPolicy::default());
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(5));

        let mut joiners = Vec::new();
        for _ in 0..4 {
            let bus = bus.clone();
            let barrier = std::sync::Arc::clone(&barrier);
            joiners.push(std::thread::spawn(move || {
                barrier.wait();
                bus.subscribe_all()
            }));
        }
        let controller = bus.publisher("controller");
        barrier.wait();
        controller.blocking_publish(SignalKind::SessionEnded {
            session_id: SessionId(round),
            reason: EndReason::Stopped,
        });

        for joiner in joiners {
            let mut sub = joiner.join().unwrap();
            let ended = timeout(Duration::from_secs(2), async {
                while sub.recv().await.is_some() {}
            })
            .await;
            assert!(ended.is_ok(), "subscription outlived the session in round {round}");
        }
    }
}
