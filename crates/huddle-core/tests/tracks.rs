mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use common::{Call, FakePlatform, FakeTransport, cam, mic, wait_until};
use huddle_core::{
    DeviceRegistry, HuddleError, NotificationKind, NotificationQueue, PublishState, TrackController, TrackKind,
    TrackState,
};

struct Setup {
    transport: Arc<FakeTransport>,
    platform: Arc<FakePlatform>,
    notifications: Arc<NotificationQueue>,
    tracks: TrackController<FakePlatform>,
}

async fn setup(transport: Arc<FakeTransport>, devices: Vec<huddle_core::Device>) -> Setup {
    let platform = FakePlatform::with_devices(devices);
    let registry = DeviceRegistry::new(platform.clone());
    registry.refresh().await.unwrap();
    let notifications = Arc::new(NotificationQueue::new(3, Duration::from_secs(5), 10));
    let tracks = TrackController::new(&TrackKind::ALL, transport.clone(), registry, notifications.clone());
    Setup {
        transport,
        platform,
        notifications,
        tracks,
    }
}

fn record(tracks: &TrackController<FakePlatform>) -> Arc<Mutex<Vec<TrackState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    tracks.subscribe(Arc::new(move |state: &TrackState| sink.lock().push(state.clone())));
    seen
}

#[tokio::test(start_paused = true)]
async fn back_to_back_toggles_never_overlap() {
    let s = setup(FakeTransport::with_delay(Duration::from_millis(50)), vec![mic("a", true)]).await;

    let pending: Vec<_> = [true, false, true, true, false, true]
        .into_iter()
        .map(|enabled| s.tracks.set_enabled(TrackKind::Microphone, enabled))
        .collect();
    for request in pending {
        request.await.unwrap();
    }

    assert_eq!(s.transport.overlaps(), 0);
    let state = s.tracks.state(TrackKind::Microphone).unwrap();
    assert!(state.enabled);
    assert_eq!(state.publish_state, PublishState::Published);
    assert_eq!(s.transport.publish_count(TrackKind::Microphone), 3);
    assert_eq!(s.transport.unpublish_count(TrackKind::Microphone), 2);
}

#[tokio::test(start_paused = true)]
async fn last_request_wins_when_it_disables() {
    let s = setup(FakeTransport::with_delay(Duration::from_millis(20)), vec![mic("a", true)]).await;

    let first = s.tracks.set_enabled(TrackKind::Microphone, true);
    let second = s.tracks.set_enabled(TrackKind::Microphone, false);
    first.await.unwrap();
    second.await.unwrap();

    let state = s.tracks.state(TrackKind::Microphone).unwrap();
    assert!(!state.enabled);
    assert_eq!(state.publish_state, PublishState::Unpublished);
    assert_eq!(
        s.transport.calls(),
        vec![
            Call::Publish {
                kind: TrackKind::Microphone,
                device_id: Some("a".to_string())
            },
            Call::Unpublish(TrackKind::Microphone),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn different_kinds_run_independently() {
    let s = setup(
        FakeTransport::with_delay(Duration::from_millis(50)),
        vec![mic("a", true), cam("c", true)],
    )
    .await;

    let started = tokio::time::Instant::now();
    let mic_on = s.tracks.set_enabled(TrackKind::Microphone, true);
    let cam_on = s.tracks.set_enabled(TrackKind::Camera, true);
    let (mic_result, cam_result) = tokio::join!(mic_on, cam_on);
    mic_result.unwrap();
    cam_result.unwrap();

    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(s.transport.overlaps(), 0);
}

#[tokio::test]
async fn enabling_twice_publishes_once() {
    let s = setup(FakeTransport::new(), vec![mic("a", true)]).await;

    s.tracks.set_enabled(TrackKind::Microphone, true).await.unwrap();
    s.tracks.set_enabled(TrackKind::Microphone, true).await.unwrap();

    assert_eq!(s.transport.publish_count(TrackKind::Microphone), 1);
}

#[tokio::test]
async fn publish_failure_reverts_and_notifies() {
    let s = setup(FakeTransport::new(), vec![mic("a", true)]).await;
    s.transport.set_fail_publish(true);

    s.tracks.set_enabled(TrackKind::Microphone, true).await.unwrap();

    let state = s.tracks.state(TrackKind::Microphone).unwrap();
    assert!(!state.enabled);
    assert_eq!(state.publish_state, PublishState::Failed);
    let visible = s.notifications.visible();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].kind, NotificationKind::Error);

    s.tracks.set_enabled(TrackKind::Microphone, false).await.unwrap();
    let state = s.tracks.state(TrackKind::Microphone).unwrap();
    assert_eq!(state.publish_state, PublishState::Unpublished);
    assert_eq!(s.transport.unpublish_count(TrackKind::Microphone), 0);
}

#[tokio::test]
async fn enabling_without_devices_fails_without_publishing() {
    let s = setup(FakeTransport::new(), vec![]).await;

    s.tracks.set_enabled(TrackKind::Camera, true).await.unwrap();

    let state = s.tracks.state(TrackKind::Camera).unwrap();
    assert!(!state.enabled);
    assert_eq!(state.publish_state, PublishState::Failed);
    assert_eq!(s.transport.publish_count(TrackKind::Camera), 0);
    assert_eq!(s.notifications.visible()[0].kind, NotificationKind::Error);
}

#[tokio::test]
async fn screen_share_publishes_without_device() {
    let s = setup(FakeTransport::new(), vec![]).await;

    s.tracks.set_enabled(TrackKind::ScreenShare, true).await.unwrap();

    assert_eq!(
        s.transport.calls(),
        vec![Call::Publish {
            kind: TrackKind::ScreenShare,
            device_id: None
        }]
    );
    assert_eq!(
        s.tracks.state(TrackKind::ScreenShare).unwrap().publish_state,
        PublishState::Published
    );
}

#[tokio::test]
async fn select_device_rejects_unknown_ids() {
    let s = setup(FakeTransport::new(), vec![mic("a", true)]).await;

    let err = s.tracks.select_device(TrackKind::Microphone, "zzz").await.unwrap_err();
    assert!(matches!(err, HuddleError::InvalidDevice { kind: TrackKind::Microphone, ref device_id } if device_id == "zzz"));

    // A microphone id is not a camera.
    let err = s.tracks.select_device(TrackKind::Camera, "a").await.unwrap_err();
    assert!(matches!(err, HuddleError::InvalidDevice { .. }));

    let err = s.tracks.select_device(TrackKind::ScreenShare, "a").await.unwrap_err();
    assert!(matches!(err, HuddleError::InvalidDevice { .. }));
}

#[tokio::test]
async fn selecting_while_disabled_only_records_the_choice() {
    let s = setup(FakeTransport::new(), vec![mic("a", true), mic("b", false)]).await;

    s.tracks.select_device(TrackKind::Microphone, "b").await.unwrap();
    assert!(s.transport.calls().is_empty());
    assert_eq!(
        s.tracks.state(TrackKind::Microphone).unwrap().selected_device_id.as_deref(),
        Some("b")
    );

    s.tracks.set_enabled(TrackKind::Microphone, true).await.unwrap();
    assert_eq!(
        s.transport.calls(),
        vec![Call::Publish {
            kind: TrackKind::Microphone,
            device_id: Some("b".to_string())
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn live_swap_never_shows_disabled() {
    let s = setup(
        FakeTransport::with_delay(Duration::from_millis(30)),
        vec![mic("a", true), mic("b", false)],
    )
    .await;
    s.tracks.set_enabled(TrackKind::Microphone, true).await.unwrap();
    let seen = record(&s.tracks);

    s.tracks.select_device(TrackKind::Microphone, "b").await.unwrap();

    let seen = seen.lock().clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|state| state.enabled));
    let state = s.tracks.state(TrackKind::Microphone).unwrap();
    assert_eq!(state.selected_device_id.as_deref(), Some("b"));
    assert_eq!(state.publish_state, PublishState::Published);
    assert_eq!(s.transport.overlaps(), 0);
    assert_eq!(s.transport.unpublish_count(TrackKind::Microphone), 1);
}

#[tokio::test]
async fn failed_swap_restores_previous_device() {
    let s = setup(FakeTransport::new(), vec![mic("a", true), mic("b", false)]).await;
    s.transport.fail_device("b");
    s.tracks.set_enabled(TrackKind::Microphone, true).await.unwrap();

    s.tracks.select_device(TrackKind::Microphone, "b").await.unwrap();

    let state = s.tracks.state(TrackKind::Microphone).unwrap();
    assert!(state.enabled);
    assert_eq!(state.selected_device_id.as_deref(), Some("a"));
    assert_eq!(state.publish_state, PublishState::Published);
    assert_eq!(s.notifications.visible()[0].kind, NotificationKind::Error);
    assert_eq!(s.transport.publish_count(TrackKind::Microphone), 3);
}

#[tokio::test]
async fn removed_device_falls_back_to_default() {
    let s = setup(FakeTransport::new(), vec![mic("a", true), mic("b", false)]).await;
    s.tracks.select_device(TrackKind::Microphone, "b").await.unwrap();
    s.tracks.set_enabled(TrackKind::Microphone, true).await.unwrap();

    s.platform.set_devices(vec![mic("a", true)]);

    wait_until(|| {
        s.tracks.state(TrackKind::Microphone).is_some_and(|state| {
            state.selected_device_id.as_deref() == Some("a") && state.publish_state == PublishState::Published
        })
    })
    .await;
    assert!(s.tracks.state(TrackKind::Microphone).unwrap().enabled);
    wait_until(|| !s.notifications.visible().is_empty()).await;
    assert_eq!(s.notifications.visible()[0].kind, NotificationKind::Warning);
}

#[tokio::test]
async fn removed_device_clears_selection_when_disabled() {
    let s = setup(FakeTransport::new(), vec![mic("a", true), mic("b", false)]).await;
    s.tracks.select_device(TrackKind::Microphone, "b").await.unwrap();

    s.platform.set_devices(vec![mic("a", true)]);

    wait_until(|| {
        s.tracks
            .state(TrackKind::Microphone)
            .is_some_and(|state| state.selected_device_id.is_none())
    })
    .await;
    assert!(s.transport.calls().is_empty());
    assert!(s.notifications.visible().is_empty());
}

#[tokio::test(start_paused = true)]
async fn teardown_discards_in_flight_results() {
    let s = setup(FakeTransport::with_delay(Duration::from_millis(100)), vec![mic("a", true)]).await;

    let enable = s.tracks.set_enabled(TrackKind::Microphone, true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    s.tracks.teardown().await;
    enable.await.unwrap();

    let state = s.tracks.state(TrackKind::Microphone).unwrap();
    assert!(!state.enabled);
    assert_eq!(state.publish_state, PublishState::Unpublished);
    assert_eq!(s.transport.unpublish_count(TrackKind::Microphone), 1);
    assert_eq!(s.transport.overlaps(), 0);

    let err = s.tracks.set_enabled(TrackKind::Microphone, true).await.unwrap_err();
    assert!(matches!(err, HuddleError::SessionClosed));
}

#[tokio::test]
async fn uninstantiated_kind_is_disabled() {
    let platform = FakePlatform::with_devices(vec![cam("c", true)]);
    let registry = DeviceRegistry::new(platform);
    registry.refresh().await.unwrap();
    let notifications = Arc::new(NotificationQueue::new(3, Duration::from_secs(5), 10));
    let tracks = TrackController::new(&[TrackKind::Microphone], FakeTransport::new(), registry, notifications);

    assert_eq!(tracks.kinds(), vec![TrackKind::Microphone]);
    let err = tracks.set_enabled(TrackKind::Camera, true).await.unwrap_err();
    assert!(matches!(err, HuddleError::ControlDisabled(_)));
    let err = tracks.select_device(TrackKind::Camera, "c").await.unwrap_err();
    assert!(matches!(err, HuddleError::ControlDisabled(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_announced_state_matches_current_state() {
    for _ in 0..20 {
        let s = setup(FakeTransport::new(), vec![mic("a", true)]).await;
        let seen = record(&s.tracks);

        let enable = s.tracks.set_enabled(TrackKind::Microphone, true);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..50 {
                    s.tracks.force_unpublished();
                    std::thread::yield_now();
                }
            });
        });
        enable.await.unwrap();

        let last = seen.lock().last().cloned();
        if let Some(last) = last {
            assert_eq!(Some(last), s.tracks.state(TrackKind::Microphone));
        }
    }
}
