// SPDX-License-Identifier: GPL-3.0-only

use calloop::{LoopHandle, LoopSignal};
use smithay::utils::{Logical, Point, Rectangle, Size};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use xpresent::{
    backend::bridge::{CalloopTimer, CompositorBridge, FallbackTimerHandler},
    config::PresentConfig,
    headless::{HeadlessWindows, LoopbackCompositor},
    present::{CompleteKind, CompleteMode, PixmapRequest, PresentEvent, PresentScreen},
    window::{CrtcId, Pixmap, PixmapId, WindowId, WindowSystem},
};

pub type Bridge = CompositorBridge<LoopbackCompositor, CalloopTimer<State>>;

const TOPLEVEL: WindowId = WindowId(0x0020_0001);
const VIDEO: WindowId = WindowId(0x0020_0002);
const POOL_SIZE: u32 = 3;
/// Frames between moves of the presented window
const MOVE_EVERY: u32 = 40;
/// Frames between NotifyMSC requests
const NOTIFY_EVERY: u32 = 25;

fn rect(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32, Logical> {
    Rectangle::new(Point::from((x, y)), Size::from((w, h)))
}

#[derive(Debug, Default)]
pub struct Stats {
    pub submitted: u32,
    pub completed: u32,
    pub flips: u32,
    pub copies: u32,
    pub skipped: u32,
    pub notifies: u32,
}

/// The simulation session: one client presenting into a child window of a
/// top-level mapped on the loopback compositor
pub struct State {
    pub screen: PresentScreen<HeadlessWindows, Bridge>,
    pub loop_signal: LoopSignal,
    pub should_stop: bool,
    pub stats: Stats,
    /// Pixmaps the client may draw into
    pool: Vec<Pixmap>,
    /// Pixmaps handed to the scheduler, waiting for their idle notification
    in_flight: HashMap<PixmapId, Pixmap>,
    serial: u32,
    demo_frames: u32,
}

impl State {
    pub fn new(loop_handle: LoopHandle<'static, State>, loop_signal: LoopSignal, config: PresentConfig) -> Self {
        let mut windows = HeadlessWindows::new();
        let root_pixmap = Pixmap::new(PixmapId(0x100), Size::from((640, 480)), 24);
        windows.add_toplevel(TOPLEVEL, rect(0, 0, 640, 480), root_pixmap);
        windows.add_child(TOPLEVEL, VIDEO, rect(64, 48, 320, 240));

        let mut compositor = LoopbackCompositor::new();
        compositor.map_toplevel(TOPLEVEL);

        let mut bridge = CompositorBridge::new(compositor, CalloopTimer::new(loop_handle), &config);
        bridge.add_output(CrtcId(0), rect(0, 0, 1920, 1080));

        let pool = (1..=POOL_SIZE)
            .map(|n| Pixmap::new(PixmapId(0x100 + n), Size::from((320, 240)), 24))
            .collect();
        let demo_frames = config.demo_frames;

        Self {
            screen: PresentScreen::new(windows, bridge, config),
            loop_signal,
            should_stop: false,
            stats: Stats::default(),
            pool,
            in_flight: HashMap::new(),
            serial: 0,
            demo_frames,
        }
    }

    /// The client renders its next frame and presents it
    pub fn client_tick(&mut self) {
        if self.should_stop {
            return;
        }
        let Some(pixmap) = self.pool.pop() else {
            debug!("Client starved, all pixmaps busy");
            return;
        };

        self.serial += 1;
        if self.serial % MOVE_EVERY == 0 {
            self.move_video();
        }
        if self.serial % NOTIFY_EVERY == 0 {
            if let Err(err) = self.screen.notify_msc(VIDEO, self.serial, 0, 1, 0) {
                warn!("NotifyMSC failed: {}", err);
            }
        }

        let id = pixmap.id();
        match self
            .screen
            .present_pixmap(PixmapRequest::new(VIDEO, pixmap.clone(), self.serial))
        {
            Ok(event_id) => {
                debug!("Presented {} as {} (serial {})", id, event_id, self.serial);
                self.in_flight.insert(id, pixmap);
                self.stats.submitted += 1;
            }
            Err(err) => {
                warn!("Present of {} failed: {}", id, err);
                self.pool.push(pixmap);
            }
        }
        self.handle_notifications();
    }

    /// The compositor repainted: deliver frame callbacks and buffer releases
    pub fn compositor_tick(&mut self) {
        let compositor = self.screen.backend_mut().compositor_mut();
        let frames = compositor.take_frame_callbacks();
        let releases = compositor.take_releases();

        for toplevel in frames {
            self.screen.frame_done(toplevel);
        }
        for (owner, buffer) in releases {
            self.screen.buffer_released(owner, buffer);
        }
        self.handle_notifications();
    }

    fn move_video(&mut self) {
        let Some(geometry) = self.screen.windows().geometry(VIDEO) else {
            return;
        };
        let x = if geometry.loc.x == 64 { 256 } else { 64 };
        info!("Moving {} to x={}", VIDEO, x);
        self.screen
            .windows_mut()
            .configure(VIDEO, Rectangle::new(Point::from((x, geometry.loc.y)), geometry.size));
        self.screen.window_reconfigured(VIDEO);
    }

    fn handle_notifications(&mut self) {
        for event in self.screen.take_notifications() {
            match event {
                PresentEvent::Complete {
                    kind: CompleteKind::NotifyMsc,
                    serial,
                    msc,
                    ..
                } => {
                    debug!("NotifyMSC {} at msc {}", serial, msc);
                    self.stats.notifies += 1;
                }
                PresentEvent::Complete {
                    mode, serial, msc, ..
                } => {
                    debug!("Serial {} complete at msc {} ({:?})", serial, msc, mode);
                    self.stats.completed += 1;
                    match mode {
                        CompleteMode::Flip => self.stats.flips += 1,
                        CompleteMode::Copy | CompleteMode::SuboptimalCopy => self.stats.copies += 1,
                        CompleteMode::Skip => self.stats.skipped += 1,
                    }
                }
                PresentEvent::Idle { pixmap, serial, .. } => {
                    debug!("{} idle after serial {}", pixmap, serial);
                    if let Some(pixmap) = self.in_flight.remove(&pixmap) {
                        self.pool.push(pixmap);
                    }
                }
            }
        }

        if self.stats.completed >= self.demo_frames && !self.should_stop {
            info!("Presented {} frames, stopping", self.stats.completed);
            self.should_stop = true;
        }
    }

    pub fn shutdown(&mut self) {
        self.screen.shutdown();
        self.handle_notifications();
        info!(
            "Submitted {}, completed {} ({} flips, {} copies, {} skipped), {} msc notifies",
            self.stats.submitted,
            self.stats.completed,
            self.stats.flips,
            self.stats.copies,
            self.stats.skipped,
            self.stats.notifies
        );
    }
}

impl FallbackTimerHandler for State {
    fn fallback_timer_fired(&mut self, toplevel: WindowId) {
        self.screen.fallback_timer_fired(toplevel);
        self.handle_notifications();
    }
}
