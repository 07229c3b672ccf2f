//! Event bus: per-kind publish-order delivery, handler isolation, and
//! drain-on-stop semantics.

use adscout::events::{
    EventBus, EventKind, ListingAnalysisCompleted, ListingEvent, ListingImagesUpdated,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;

fn images_updated(listing_id: i64) -> ListingEvent {
    ListingEvent::ImagesUpdated(ListingImagesUpdated {
        listing_id,
        external_id: format!("ext-{listing_id}"),
        image_urls: vec![],
        triggered_at: Utc::now(),
    })
}

fn analysis_completed(listing_id: i64) -> ListingEvent {
    ListingEvent::AnalysisCompleted(ListingAnalysisCompleted {
        listing_id,
        external_id: format!("ext-{listing_id}"),
        is_suspicious: false,
        reason: None,
        confidence: None,
        meta: None,
        analyzed_at: Utc::now(),
    })
}

#[tokio::test]
async fn events_of_one_kind_arrive_in_publish_order() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    bus.subscribe_fn(EventKind::ImagesUpdated, move |event| {
        let sink = Arc::clone(&sink);
        async move {
            if let ListingEvent::ImagesUpdated(payload) = event {
                sink.lock().await.push(payload.listing_id);
            }
        }
    });

    bus.start().await;
    for id in 0..100 {
        bus.publish(images_updated(id)).unwrap();
    }
    bus.stop().await;

    let seen = seen.lock().await;
    assert_eq!(seen.len(), 100);
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
}

#[tokio::test]
async fn subscribers_only_see_their_kind() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    bus.subscribe_fn(EventKind::AnalysisCompleted, move |event| {
        let sink = Arc::clone(&sink);
        async move {
            if let ListingEvent::AnalysisCompleted(payload) = event {
                sink.lock().await.push(payload.listing_id);
            }
        }
    });

    bus.start().await;
    bus.publish(images_updated(1)).unwrap();
    bus.publish(analysis_completed(2)).unwrap();
    bus.publish(images_updated(3)).unwrap();
    bus.stop().await;

    assert_eq!(*seen.lock().await, vec![2]);
}

#[tokio::test]
async fn panicking_handler_does_not_affect_others_or_later_events() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    bus.subscribe_fn(EventKind::ImagesUpdated, |_event| async {
        panic!("handler blew up");
    });
    let sink = Arc::clone(&seen);
    bus.subscribe_fn(EventKind::ImagesUpdated, move |event| {
        let sink = Arc::clone(&sink);
        async move {
            if let ListingEvent::ImagesUpdated(payload) = event {
                sink.lock().await.push(payload.listing_id);
            }
        }
    });

    bus.start().await;
    bus.publish(images_updated(1)).unwrap();
    bus.publish(images_updated(2)).unwrap();
    bus.stop().await;

    assert_eq!(*seen.lock().await, vec![1, 2]);
}

#[tokio::test]
async fn stop_drains_already_enqueued_events() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(0usize));

    let sink = Arc::clone(&seen);
    bus.subscribe_fn(EventKind::ImagesUpdated, move |_event| {
        let sink = Arc::clone(&sink);
        async move {
            *sink.lock().await += 1;
        }
    });

    // Published before the dispatcher even starts.
    for id in 0..10 {
        bus.publish(images_updated(id)).unwrap();
    }
    bus.start().await;
    bus.stop().await;

    assert_eq!(*seen.lock().await, 10);
}
