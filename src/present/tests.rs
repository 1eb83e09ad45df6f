// SPDX-License-Identifier: GPL-3.0-only

use super::*;
use crate::{
    backend::{FlipReason, bridge::CompositorBridge, direct::DirectBackend},
    headless::{HeadlessScanout, HeadlessWindows, LoopbackCompositor, ManualTimer, Operation},
    window::PixmapId,
};
use smithay::utils::{Rectangle, Size};

type DirectScreen = PresentScreen<HeadlessWindows, DirectBackend<HeadlessScanout>>;
type BridgeScreen = PresentScreen<HeadlessWindows, CompositorBridge<LoopbackCompositor, ManualTimer>>;

const W: WindowId = WindowId(1);
const CHILD: WindowId = WindowId(2);
const CRTC: CrtcId = CrtcId(1);

fn rect(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32, Logical> {
    Rectangle::new(Point::from((x, y)), Size::from((w, h)))
}

fn pixmap(id: u32, w: i32, h: i32) -> Pixmap {
    Pixmap::new(PixmapId(id), Size::from((w, h)), 24)
}

/// Full-screen window `W` on a 640x480 CRTC that is at msc 100
fn direct_screen_with(config: PresentConfig) -> (DirectScreen, Pixmap) {
    let root = pixmap(0x10, 640, 480);
    let mut windows = HeadlessWindows::new();
    windows.add_toplevel(W, rect(0, 0, 640, 480), root.clone());
    windows.add_child(W, CHILD, rect(10, 10, 320, 240));

    let mut backend = DirectBackend::new(HeadlessScanout::new());
    backend.add_crtc(CRTC, rect(0, 0, 640, 480), 24);

    let mut screen = PresentScreen::new(windows, backend, config);
    screen.vblank(CRTC, 1_000, 100);
    (screen, root)
}

fn direct_screen() -> (DirectScreen, Pixmap) {
    direct_screen_with(PresentConfig::default())
}

fn at(window: WindowId, pixmap: &Pixmap, serial: u32, target_msc: u64) -> PixmapRequest {
    let mut request = PixmapRequest::new(window, pixmap.clone(), serial);
    request.target_msc = target_msc;
    request
}

fn complete(window: WindowId, mode: CompleteMode, serial: u32, ust: u64, msc: u64) -> PresentEvent {
    PresentEvent::Complete {
        window,
        kind: CompleteKind::Pixmap,
        mode,
        serial,
        ust,
        msc,
    }
}

fn idle(window: WindowId, serial: u32, pixmap: &Pixmap) -> PresentEvent {
    PresentEvent::Idle {
        window,
        serial,
        pixmap: pixmap.id(),
        idle_fence: None,
    }
}

/// Flip `p` onto `W` and let it land at msc 101
fn flip_active(screen: &mut DirectScreen, p: &Pixmap) -> EventId {
    let id = screen.present_pixmap(at(W, p, 1, 101)).unwrap();
    screen.vblank(CRTC, 2_000, 101);
    assert_eq!(
        screen.take_notifications(),
        vec![complete(W, CompleteMode::Flip, 1, 2_000, 101)]
    );
    id
}

#[test]
fn flip_lands_at_target_msc() {
    let (mut screen, root) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);

    let id = screen.present_pixmap(at(W, &p1, 1, 105)).unwrap();
    assert_eq!(p1.ref_count(), 2);
    let request = screen.window_state(W).unwrap().request(id).unwrap();
    assert!(request.flip && request.sync_flip);
    assert_eq!(request.exec_msc, 104);

    // the sync flip is issued one frame early
    screen.vblank(CRTC, 2_000, 104);
    assert!(screen.take_notifications().is_empty());
    assert_eq!(screen.windows().window_pixmap(W), Some(p1.clone()));

    screen.vblank(CRTC, 3_000, 105);
    assert_eq!(
        screen.take_notifications(),
        vec![complete(W, CompleteMode::Flip, 1, 3_000, 105)]
    );
    assert_eq!(screen.backend().device().scanout(CRTC), Some(p1.id()));
    let state = screen.window_state(W).unwrap();
    assert_eq!(state.flip_active, Some(id));
    assert_eq!(state.restore_pixmap, Some(root));

    // the previous flip goes idle only once the next one is on screen
    let p2 = pixmap(0x12, 640, 480);
    screen.present_pixmap(at(W, &p2, 2, 107)).unwrap();
    screen.vblank(CRTC, 4_000, 106);
    assert!(screen.take_notifications().is_empty());
    assert_eq!(p1.ref_count(), 2);

    screen.vblank(CRTC, 5_000, 107);
    assert_eq!(
        screen.take_notifications(),
        vec![idle(W, 1, &p1), complete(W, CompleteMode::Flip, 2, 5_000, 107)]
    );
    assert_eq!(p1.ref_count(), 1);
}

#[test]
fn last_writer_wins_for_same_target() {
    let (mut screen, _) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    let p2 = pixmap(0x12, 640, 480);

    screen.present_pixmap(at(W, &p1, 1, 105)).unwrap();
    screen.present_pixmap(at(W, &p2, 2, 105)).unwrap();
    assert_eq!(p1.ref_count(), 1);

    screen.vblank(CRTC, 2_000, 104);
    screen.vblank(CRTC, 3_000, 105);
    let events = screen.take_notifications();

    let completed: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            PresentEvent::Complete { serial, .. } => Some(*serial),
            _ => None,
        })
        .collect();
    let idled: Vec<(u32, PixmapId)> = events
        .iter()
        .filter_map(|event| match event {
            PresentEvent::Idle { serial, pixmap, .. } => Some((*serial, *pixmap)),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![2]);
    assert_eq!(idled, vec![(1, p1.id())]);
}

#[test]
fn partial_update_does_not_replace_queued_request() {
    let (mut screen, _) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    let p2 = pixmap(0x12, 640, 480);

    let first = screen.present_pixmap(at(W, &p1, 1, 105)).unwrap();
    let mut partial = at(W, &p2, 2, 105);
    partial.update = Some(Region::from_rect(rect(0, 0, 16, 16)));
    screen.present_pixmap(partial).unwrap();

    assert!(screen.window_state(W).unwrap().request(first).is_some());
    assert!(screen.take_notifications().is_empty());
}

#[test]
fn repeated_event_for_finished_request_is_ignored() {
    let (mut screen, _) = direct_screen();
    let id = screen.notify_msc(W, 7, 103, 0, 0).unwrap();

    screen.vblank(CRTC, 2_000, 103);
    assert_eq!(
        screen.take_notifications(),
        vec![PresentEvent::Complete {
            window: W,
            kind: CompleteKind::NotifyMsc,
            mode: CompleteMode::Copy,
            serial: 7,
            ust: 2_000,
            msc: 103,
        }]
    );

    screen.event_notify(id, 2_000, 103);
    screen.event_notify(id, 2_000, 103);
    assert!(screen.take_notifications().is_empty());
    assert!(screen.window_state(W).unwrap().requests.is_empty());
}

#[test]
fn notify_msc_with_passed_target_completes_on_next_frame() {
    let (mut screen, _) = direct_screen();
    // divisor 4, remainder 1: next matching msc after 100 is 101
    screen.notify_msc(W, 1, 50, 4, 1).unwrap();
    assert!(screen.take_notifications().is_empty());

    screen.vblank(CRTC, 2_000, 101);
    let events = screen.take_notifications();
    assert!(matches!(
        events.as_slice(),
        [PresentEvent::Complete { kind: CompleteKind::NotifyMsc, msc: 101, .. }]
    ));
}

#[test]
fn refused_requests_leave_nothing_behind() {
    let config = PresentConfig {
        max_requests: 2,
        ..PresentConfig::default()
    };
    let (mut screen, _) = direct_screen_with(config);
    let p1 = pixmap(0x11, 640, 480);
    let p2 = pixmap(0x12, 640, 480);
    let p3 = pixmap(0x13, 640, 480);

    screen.present_pixmap(at(W, &p1, 1, 110)).unwrap();
    screen.present_pixmap(at(W, &p2, 2, 111)).unwrap();
    let err = screen.present_pixmap(at(W, &p3, 3, 112)).unwrap_err();
    assert!(matches!(err, PresentError::QueueFull { window: W, limit: 2 }));
    assert_eq!(p3.ref_count(), 1);
    assert_eq!(screen.window_state(W).unwrap().requests.len(), 2);

    let err = screen.present_pixmap(at(WindowId(99), &p3, 4, 0)).unwrap_err();
    assert!(matches!(err, PresentError::UnknownWindow(WindowId(99))));
    assert_eq!(p3.ref_count(), 1);
    assert!(screen.window_state(WindowId(99)).is_none());
}

#[test]
fn destroy_with_flip_pending_restores_original_pixmap() {
    let (mut screen, root) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);

    // target 101 executes right away at msc 100
    screen.present_pixmap(at(W, &p1, 1, 101)).unwrap();
    assert_eq!(screen.windows().window_pixmap(W), Some(p1.clone()));
    screen.windows_mut().take_journal();

    screen.destroy_window(W);
    assert_eq!(
        screen.windows().journal(),
        &[
            Operation::CopyToPixmap {
                src: p1.id(),
                dst: root.id(),
            },
            Operation::SetPixmap {
                window: W,
                pixmap: root.id(),
            },
            Operation::SetPixmap {
                window: CHILD,
                pixmap: root.id(),
            },
        ]
    );
    assert_eq!(screen.windows().window_pixmap(W), Some(root));
    assert!(screen.window_state(W).is_none());

    // the flip still lands, nobody hears about it
    screen.vblank(CRTC, 2_000, 101);
    assert!(screen.take_notifications().is_empty());
    assert_eq!(p1.ref_count(), 1);
    assert_eq!(screen.backend().device().scanout(CRTC), None);
}

#[test]
fn destroy_drops_queued_requests_silently() {
    let (mut screen, _) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    screen.present_pixmap(at(W, &p1, 1, 110)).unwrap();
    screen.notify_msc(W, 2, 120, 0, 0).unwrap();

    screen.destroy_window(W);
    screen.vblank(CRTC, 2_000, 109);
    screen.vblank(CRTC, 3_000, 120);

    assert!(screen.take_notifications().is_empty());
    assert_eq!(p1.ref_count(), 1);
}

#[test]
fn copy_reports_idle_before_completion() {
    let (mut screen, _) = direct_screen();
    let p = pixmap(0x20, 320, 240);
    let update = Region::from_rect(rect(0, 0, 32, 32));

    let mut request = PixmapRequest::new(CHILD, p.clone(), 5);
    request.update = Some(update.clone());
    let id = screen.present_pixmap(request).unwrap();
    let request = screen.window_state(CHILD).unwrap().request(id).unwrap();
    assert!(!request.flip);
    assert_eq!(request.reason, Some(FlipReason::Geometry));
    screen.windows_mut().take_journal();

    screen.vblank(CRTC, 2_000, 101);
    assert_eq!(screen.take_notifications(), vec![idle(CHILD, 5, &p)]);
    assert_eq!(
        screen.windows().journal(),
        &[Operation::CopyToWindow {
            src: p.id(),
            window: CHILD,
            update: Some(update),
            offset: Point::from((0, 0)),
        }]
    );

    screen.vblank(CRTC, 3_000, 102);
    assert_eq!(
        screen.take_notifications(),
        vec![complete(CHILD, CompleteMode::Copy, 5, 3_000, 102)]
    );
    assert_eq!(p.ref_count(), 1);
}

#[test]
fn copy_over_active_flip_unflips() {
    let (mut screen, root) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    flip_active(&mut screen, &p1);
    screen.windows_mut().take_journal();

    let p2 = pixmap(0x12, 640, 480);
    let mut request = PixmapRequest::new(W, p2.clone(), 2);
    request.options = PresentOptions::COPY;
    screen.present_pixmap(request).unwrap();

    screen.vblank(CRTC, 3_000, 102);
    assert_eq!(screen.take_notifications(), vec![idle(W, 2, &p2)]);
    let journal = screen.windows_mut().take_journal();
    assert_eq!(
        journal[0],
        Operation::CopyToPixmap {
            src: p1.id(),
            dst: root.id(),
        }
    );
    assert!(matches!(journal.last(), Some(Operation::CopyToWindow { window: W, .. })));
    assert_eq!(screen.windows().window_pixmap(W), Some(root));
    assert_eq!(screen.backend().device().scanout(CRTC), None);

    // unflip confirms on the next vblank, then the copy completes
    screen.vblank(CRTC, 4_000, 103);
    assert_eq!(
        screen.take_notifications(),
        vec![idle(W, 1, &p1), complete(W, CompleteMode::Copy, 2, 4_000, 103)]
    );
    let state = screen.window_state(W).unwrap();
    assert!(state.flip_active.is_none());
    assert!(state.restore_pixmap.is_none());
    assert!(state.is_idle());
}

#[test]
fn reconfigure_away_from_flip_geometry_unflips() {
    let (mut screen, root) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    flip_active(&mut screen, &p1);

    screen.windows_mut().configure(W, rect(0, 0, 320, 240));
    screen.window_reconfigured(W);
    assert_eq!(screen.windows().window_pixmap(W), Some(root));
    assert!(screen.window_state(W).unwrap().unflip_event_id.is_some());

    screen.vblank(CRTC, 3_000, 102);
    assert_eq!(screen.take_notifications(), vec![idle(W, 1, &p1)]);
    assert!(screen.window_state(W).unwrap().is_idle());
}

#[test]
fn queued_sync_flip_falls_back_to_real_target() {
    let (mut screen, _) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    let id = screen.present_pixmap(at(W, &p1, 1, 105)).unwrap();

    screen.windows_mut().configure(W, rect(0, 0, 320, 240));
    screen.window_reconfigured(W);
    let request = screen.window_state(W).unwrap().request(id).unwrap();
    assert!(!request.flip);
    assert!(request.requeue);

    // the early execution slot no longer applies
    screen.vblank(CRTC, 2_000, 104);
    assert!(screen.take_notifications().is_empty());

    screen.vblank(CRTC, 3_000, 105);
    assert_eq!(screen.take_notifications(), vec![idle(W, 1, &p1)]);
    screen.vblank(CRTC, 4_000, 106);
    assert_eq!(
        screen.take_notifications(),
        vec![complete(W, CompleteMode::Copy, 1, 4_000, 106)]
    );
}

#[test]
fn wait_fence_holds_execution() {
    let (mut screen, root) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    let fence = Fence::new(FenceId(9));

    let mut request = at(W, &p1, 1, 101);
    request.wait_fence = Some(fence.clone());
    let id = screen.present_pixmap(request).unwrap();
    assert_eq!(
        screen.window_state(W).unwrap().request(id).map(|request| request.stage),
        Some(Stage::Fence)
    );
    assert_eq!(screen.windows().window_pixmap(W), Some(root));

    fence.trigger();
    screen.fence_triggered(fence.id());
    assert_eq!(screen.windows().window_pixmap(W), Some(p1));

    screen.vblank(CRTC, 2_000, 101);
    assert_eq!(
        screen.take_notifications(),
        vec![complete(W, CompleteMode::Flip, 1, 2_000, 101)]
    );
}

#[test]
fn idle_fence_is_triggered_with_idle_notification() {
    let (mut screen, _) = direct_screen();
    let p = pixmap(0x20, 320, 240);
    let fence = Fence::new(FenceId(3));

    let mut request = PixmapRequest::new(CHILD, p.clone(), 1);
    request.idle_fence = Some(fence.clone());
    screen.present_pixmap(request).unwrap();
    assert!(!fence.is_triggered());

    screen.vblank(CRTC, 2_000, 101);
    assert!(fence.is_triggered());
    assert_eq!(
        screen.take_notifications(),
        vec![PresentEvent::Idle {
            window: CHILD,
            serial: 1,
            pixmap: p.id(),
            idle_fence: Some(FenceId(3)),
        }]
    );
}

#[test]
fn abort_of_waiting_request() {
    let (mut screen, _) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    let id = screen.present_pixmap(at(W, &p1, 1, 110)).unwrap();

    assert!(screen.abort(id));
    assert_eq!(screen.take_notifications(), vec![idle(W, 1, &p1)]);
    assert_eq!(p1.ref_count(), 1);

    screen.vblank(CRTC, 2_000, 110);
    assert!(screen.take_notifications().is_empty());
    assert!(!screen.abort(id));
}

#[test]
fn abort_of_flip_in_flight_undoes_it_silently() {
    let (mut screen, root) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    let id = screen.present_pixmap(at(W, &p1, 1, 101)).unwrap();

    assert!(screen.abort(id));
    assert_eq!(screen.windows().window_pixmap(W), Some(root));

    screen.vblank(CRTC, 2_000, 101);
    screen.vblank(CRTC, 3_000, 102);
    assert_eq!(screen.take_notifications(), vec![idle(W, 1, &p1)]);
    assert!(screen.window_state(W).unwrap().is_idle());
    assert_eq!(screen.backend().device().scanout(CRTC), None);
}

#[test]
fn abandoned_crtc_skips_waiting_requests() {
    let (mut screen, _) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    screen.present_pixmap(at(W, &p1, 1, 105)).unwrap();

    screen.remove_crtc(CRTC);
    let events = screen.take_notifications();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], idle(W, 1, &p1));
    assert!(matches!(
        events[1],
        PresentEvent::Complete {
            window: W,
            mode: CompleteMode::Skip,
            serial: 1,
            msc: 100,
            ..
        }
    ));
    assert_eq!(p1.ref_count(), 1);
}

#[test]
fn format_mismatch_is_reported_suboptimal() {
    let (mut screen, _) = direct_screen();
    let p = Pixmap::new(PixmapId(0x30), Size::from((640, 480)), 32);
    let mut request = PixmapRequest::new(W, p.clone(), 1);
    request.options = PresentOptions::SUBOPTIMAL;
    screen.present_pixmap(request).unwrap();

    screen.vblank(CRTC, 2_000, 101);
    screen.vblank(CRTC, 3_000, 102);
    assert_eq!(
        screen.take_notifications(),
        vec![
            idle(W, 1, &p),
            complete(W, CompleteMode::SuboptimalCopy, 1, 3_000, 102)
        ]
    );
}

#[test]
fn completion_reaches_live_notify_windows() {
    let (mut screen, _) = direct_screen();
    let other = WindowId(3);
    screen.windows_mut().add_child(W, other, rect(0, 0, 10, 10));

    let p = pixmap(0x20, 320, 240);
    let mut request = PixmapRequest::new(CHILD, p, 1);
    request.notifies = vec![
        PresentNotify { window: W, serial: 77 },
        PresentNotify { window: other, serial: 78 },
    ];
    screen.present_pixmap(request).unwrap();
    screen.destroy_window(other);

    screen.vblank(CRTC, 2_000, 101);
    screen.vblank(CRTC, 3_000, 102);
    let completed: Vec<(WindowId, u32)> = screen
        .take_notifications()
        .into_iter()
        .filter_map(|event| match event {
            PresentEvent::Complete { window, serial, .. } => Some((window, serial)),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![(CHILD, 1), (W, 77)]);
}

#[test]
fn flips_disabled_by_config() {
    let config = PresentConfig {
        allow_flips: false,
        ..PresentConfig::default()
    };
    let (mut screen, _) = direct_screen_with(config);
    let p1 = pixmap(0x11, 640, 480);
    let id = screen.present_pixmap(at(W, &p1, 1, 105)).unwrap();
    assert!(!screen.window_state(W).unwrap().request(id).unwrap().flip);
}

#[test]
fn shutdown_gives_windows_their_pixmaps_back() {
    let (mut screen, root) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    flip_active(&mut screen, &p1);

    screen.shutdown();
    assert_eq!(screen.windows().window_pixmap(W), Some(root));
    assert!(screen.window_state(W).is_none());
    assert_eq!(screen.backend().device().scanout(CRTC), None);
    assert_eq!(p1.ref_count(), 1);
}

fn bridge_screen() -> BridgeScreen {
    let mut windows = HeadlessWindows::new();
    windows.add_toplevel(W, rect(0, 0, 640, 480), pixmap(0x10, 640, 480));
    windows.add_child(W, CHILD, rect(100, 50, 320, 240));

    let mut compositor = LoopbackCompositor::new();
    compositor.map_toplevel(W);
    let config = PresentConfig::default();
    let mut bridge = CompositorBridge::new(compositor, ManualTimer::new(), &config);
    bridge.add_output(CrtcId(0), rect(0, 0, 1920, 1080));
    PresentScreen::new(windows, bridge, config)
}

#[test]
fn bridged_flip_goes_idle_on_buffer_release() {
    let mut screen = bridge_screen();
    let p1 = pixmap(0x11, 320, 240);
    let p2 = pixmap(0x12, 320, 240);

    screen.present_pixmap(PixmapRequest::new(CHILD, p1.clone(), 1)).unwrap();
    assert!(matches!(
        screen.take_notifications().as_slice(),
        [PresentEvent::Complete { window: CHILD, mode: CompleteMode::Flip, serial: 1, .. }]
    ));
    assert_eq!(screen.windows().window_pixmap(CHILD), Some(p1.clone()));

    screen.present_pixmap(PixmapRequest::new(CHILD, p2.clone(), 2)).unwrap();
    assert!(matches!(
        screen.take_notifications().as_slice(),
        [PresentEvent::Complete { mode: CompleteMode::Flip, serial: 2, .. }]
    ));
    assert_eq!(p1.ref_count(), 2);

    let releases = screen.backend_mut().compositor_mut().take_releases();
    for (owner, buffer) in releases {
        screen.buffer_released(owner, buffer);
    }
    assert_eq!(screen.take_notifications(), vec![idle(CHILD, 1, &p1)]);
    assert_eq!(p1.ref_count(), 1);

    let frames = screen.backend_mut().compositor_mut().take_frame_callbacks();
    assert_eq!(frames, vec![W]);
    screen.frame_done(W);
    assert_eq!(screen.get_ust_msc(CHILD).msc, 1);
}

#[test]
fn bridged_notify_msc_advances_with_fallback_timer() {
    let mut screen = bridge_screen();
    screen.notify_msc(CHILD, 4, 2, 0, 0).unwrap();
    assert!(screen.backend().timer().armed(W).is_some());

    screen.fallback_timer_fired(W);
    assert!(screen.take_notifications().is_empty());
    screen.fallback_timer_fired(W);
    assert!(matches!(
        screen.take_notifications().as_slice(),
        [PresentEvent::Complete { kind: CompleteKind::NotifyMsc, serial: 4, msc: 2, .. }]
    ));
    assert!(screen.backend().timer().armed(W).is_none());
}

fn copy_into_child(screen: &mut DirectScreen, p: &Pixmap, serial: u32) -> EventId {
    let mut request = PixmapRequest::new(CHILD, p.clone(), serial);
    request.options = PresentOptions::COPY;
    let id = screen.present_pixmap(request).unwrap();
    screen.vblank(CRTC, 2_000, 101);
    assert_eq!(screen.take_notifications(), vec![idle(CHILD, serial, p)]);
    id
}

#[test]
fn abandoned_crtc_after_copy_reports_idle_once() {
    let (mut screen, _) = direct_screen();
    let p = pixmap(0x20, 320, 240);
    let fence = Fence::new(FenceId(4));
    let mut request = PixmapRequest::new(CHILD, p.clone(), 5);
    request.idle_fence = Some(fence.clone());
    screen.present_pixmap(request).unwrap();
    screen.vblank(CRTC, 2_000, 101);
    assert_eq!(screen.take_notifications().len(), 1);
    assert!(fence.is_triggered());
    fence.reset();

    // the copy is waiting for its completion frame
    screen.remove_crtc(CRTC);
    let events = screen.take_notifications();
    assert!(matches!(
        events.as_slice(),
        [PresentEvent::Complete {
            window: CHILD,
            mode: CompleteMode::Copy,
            serial: 5,
            msc: 101,
            ..
        }]
    ));
    assert!(!fence.is_triggered());
    assert_eq!(p.ref_count(), 1);
}

#[test]
fn executed_copy_cannot_be_aborted() {
    let (mut screen, _) = direct_screen();
    let p = pixmap(0x20, 320, 240);
    let id = copy_into_child(&mut screen, &p, 6);

    assert!(!screen.abort(id));
    assert!(screen.take_notifications().is_empty());

    screen.vblank(CRTC, 3_000, 102);
    assert_eq!(
        screen.take_notifications(),
        vec![complete(CHILD, CompleteMode::Copy, 6, 3_000, 102)]
    );
    assert_eq!(p.ref_count(), 1);
}

#[test]
fn orphaned_flip_is_released_with_its_crtc() {
    let (mut screen, _) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    screen.present_pixmap(at(W, &p1, 1, 101)).unwrap();

    screen.destroy_window(W);
    assert_eq!(p1.ref_count(), 2);

    // the crtc goes away before the flip is confirmed
    screen.remove_crtc(CRTC);
    assert_eq!(p1.ref_count(), 1);
    assert!(screen.take_notifications().is_empty());
}

#[test]
fn allocation_failure_at_any_submission_leaves_nothing_behind() {
    for failing in 0..3 {
        let (mut screen, _) = direct_screen();
        let pixmaps: Vec<Pixmap> = (0..3).map(|n| pixmap(0x11 + n, 640, 480)).collect();

        for (step, p) in pixmaps.iter().enumerate() {
            if step == failing {
                screen.fail_reserve = 1;
            }
            let result = screen.present_pixmap(at(W, p, step as u32 + 1, 110 + step as u64));
            if step == failing {
                assert!(matches!(result, Err(PresentError::Alloc(_))));
            } else {
                assert!(result.is_ok());
            }
        }

        for (step, p) in pixmaps.iter().enumerate() {
            let expected = if step == failing { 1 } else { 2 };
            assert_eq!(p.ref_count(), expected, "pixmap {} with step {} failing", step, failing);
        }
        assert_eq!(screen.window_state(W).unwrap().requests.len(), 2);
        assert!(screen.take_notifications().is_empty());

        screen.destroy_window(W);
        assert!(pixmaps.iter().all(|p| p.ref_count() == 1));
    }
}

#[test]
fn first_request_failing_allocation_creates_no_state() {
    let (mut screen, _) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    screen.fail_reserve = 1;

    assert!(matches!(
        screen.present_pixmap(at(W, &p1, 1, 105)),
        Err(PresentError::Alloc(_))
    ));
    assert!(screen.window_state(W).is_none());
    assert_eq!(p1.ref_count(), 1);

    // the next attempt is not affected
    screen.present_pixmap(at(W, &p1, 2, 105)).unwrap();
    assert_eq!(p1.ref_count(), 2);
}

#[test]
fn shutdown_with_flip_pending_and_requests_queued_releases_all() {
    let (mut screen, root) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    let p2 = pixmap(0x12, 640, 480);
    screen.present_pixmap(at(W, &p1, 1, 101)).unwrap();
    screen.present_pixmap(at(W, &p2, 2, 110)).unwrap();
    assert_eq!(p2.ref_count(), 2);

    screen.shutdown();
    assert_eq!(p1.ref_count(), 1);
    assert_eq!(p2.ref_count(), 1);
    assert_eq!(screen.windows().window_pixmap(W), Some(root));
    assert!(screen.take_notifications().is_empty());
}

#[test]
fn restore_skips_window_given_another_pixmap() {
    let (mut screen, _) = direct_screen();
    let p1 = pixmap(0x11, 640, 480);
    flip_active(&mut screen, &p1);

    let other = pixmap(0x40, 640, 480);
    screen.windows_mut().set_window_pixmap(W, &other);
    screen.windows_mut().take_journal();

    screen.windows_mut().configure(W, rect(0, 0, 320, 240));
    screen.window_reconfigured(W);
    assert!(screen.windows().journal().is_empty());
    assert_eq!(screen.windows().window_pixmap(W), Some(other));

    screen.vblank(CRTC, 3_000, 102);
    assert_eq!(screen.take_notifications(), vec![idle(W, 1, &p1)]);
}
