// SPDX-License-Identifier: GPL-3.0-only

//! Backend presenting through a compositor that has no vblank signal.
//!
//! The MSC of a top-level window advances whenever the compositor reports a
//! frame done for the surface we committed to. When that callback is late (the
//! surface may not be visible at all) a fallback timer advances the MSC
//! instead. Both producers are funneled through `advance`
//! and a callback recorded at an MSC the timer already moved past is dropped.
//!
//! Buffers handed to the compositor are tagged with their top-level window so
//! a release can be routed without searching.

mod compositor;
mod timer;

pub use self::compositor::{BufferId, Compositor, SubsurfaceId, SurfaceId};
pub use self::timer::{CalloopTimer, FallbackTimer, FallbackTimerHandler};

use super::{BackendError, BackendEvent, FlipReason, PresentBackend, PresentCapabilities};
use crate::{
    config::PresentConfig,
    present::{msc_is_equal_or_after, ust_now, EventId, UstMsc},
    utils::region::Region,
    window::{CrtcId, Pixmap, WindowId, WindowSystem},
};
use indexmap::IndexMap;
use smithay::utils::{Clock, Logical, Monotonic, Rectangle};
use std::{collections::HashMap, time::Duration};
use tracing::{debug, trace};

/// Surface the presented window's buffers are attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentSurface {
    /// The presented window covers its top-level, use the main surface
    Main(SurfaceId),
    /// Sub-surface placed over the presented window
    Sub {
        surface: SurfaceId,
        subsurface: SubsurfaceId,
    },
}

impl PresentSurface {
    pub fn surface(&self) -> SurfaceId {
        match self {
            PresentSurface::Main(surface) => *surface,
            PresentSurface::Sub { surface, .. } => *surface,
        }
    }
}

/// Bridge state of one top-level window
#[derive(Debug)]
struct BridgeWindow {
    surface: SurfaceId,
    clock: UstMsc,
    output: Option<CrtcId>,
    present_window: Option<WindowId>,
    present_surface: Option<PresentSurface>,
    need_configure: bool,
    /// MSC at which the outstanding frame callback was requested
    frame_callback: Option<u64>,
    /// Interval the fallback timer is currently armed with
    timer: Option<Duration>,
    vblank_events: Vec<(EventId, u64)>,
    release_events: HashMap<BufferId, Vec<EventId>>,
}

impl BridgeWindow {
    fn new(surface: SurfaceId, ust: u64) -> Self {
        Self {
            surface,
            clock: UstMsc::new(ust, 0),
            output: None,
            present_window: None,
            present_surface: None,
            need_configure: false,
            frame_callback: None,
            timer: None,
            vblank_events: Vec::new(),
            release_events: HashMap::new(),
        }
    }

    fn take_release_events(&mut self) -> Vec<BackendEvent> {
        let clock = self.clock;
        self.release_events
            .drain()
            .flat_map(|(_, ids)| ids)
            .map(|event_id| BackendEvent::new(event_id, clock))
            .collect()
    }
}

fn cleanup_surfaces<C: Compositor>(compositor: &mut C, window: &mut BridgeWindow) {
    if let Some(PresentSurface::Sub {
        surface,
        subsurface,
    }) = window.present_surface.take()
    {
        compositor.destroy_subsurface(subsurface);
        compositor.destroy_surface(surface);
        // a callback on the destroyed surface never fires
        window.frame_callback = None;
    }
}

fn coverage(a: Rectangle<i32, Logical>, b: Rectangle<i32, Logical>) -> i64 {
    a.intersection(b)
        .map(|rect| rect.size.w as i64 * rect.size.h as i64)
        .unwrap_or(0)
}

pub struct CompositorBridge<C: Compositor, T: FallbackTimer> {
    compositor: C,
    timer: T,
    clock: Clock<Monotonic>,
    fallback_interval: Duration,
    copy_interval: Duration,
    outputs: IndexMap<CrtcId, Rectangle<i32, Logical>>,
    windows: HashMap<WindowId, BridgeWindow>,
    events: Vec<BackendEvent>,
}

impl<C: Compositor, T: FallbackTimer> std::fmt::Debug for CompositorBridge<C, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositorBridge")
            .field("outputs", &self.outputs)
            .field("windows", &self.windows)
            .field("events", &self.events)
            .finish()
    }
}

impl<C: Compositor, T: FallbackTimer> CompositorBridge<C, T> {
    pub fn new(compositor: C, timer: T, config: &PresentConfig) -> Self {
        Self {
            compositor,
            timer,
            clock: Clock::new(),
            fallback_interval: config.fallback_interval,
            copy_interval: config.copy_interval,
            outputs: IndexMap::new(),
            windows: HashMap::new(),
            events: Vec::new(),
        }
    }

    pub fn compositor(&self) -> &C {
        &self.compositor
    }

    pub fn compositor_mut(&mut self) -> &mut C {
        &mut self.compositor
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn add_output(&mut self, crtc: CrtcId, geometry: Rectangle<i32, Logical>) {
        debug!("Bridge output {} at {:?}", crtc, geometry);
        self.outputs.insert(crtc, geometry);
    }

    pub fn remove_output(&mut self, crtc: CrtcId) {
        self.outputs.shift_remove(&crtc);
        for window in self.windows.values_mut() {
            if window.output == Some(crtc) {
                window.output = None;
            }
        }
    }

    /// Emulated clock of a top-level window
    pub fn window_clock(&self, toplevel: WindowId) -> Option<UstMsc> {
        self.windows.get(&toplevel).map(|window| window.clock)
    }

    pub fn present_surface(&self, toplevel: WindowId) -> Option<PresentSurface> {
        self.windows.get(&toplevel).and_then(|window| window.present_surface)
    }

    pub fn frame_callback_pending(&self, toplevel: WindowId) -> bool {
        self.windows
            .get(&toplevel)
            .is_some_and(|window| window.frame_callback.is_some())
    }

    fn now(&self) -> u64 {
        ust_now(&self.clock)
    }

    /// Bridge state for `toplevel`, created once the compositor knows its surface
    fn ensure_window(&mut self, toplevel: WindowId) -> Option<UstMsc> {
        if !self.windows.contains_key(&toplevel) {
            let surface = self.compositor.toplevel_surface(toplevel)?;
            trace!("Bridging {} through {:?}", toplevel, surface);
            let ust = self.now();
            self.windows.insert(toplevel, BridgeWindow::new(surface, ust));
        }
        self.windows.get(&toplevel).map(|window| window.clock)
    }

    fn pick_output(&self, geometry: Rectangle<i32, Logical>, cached: Option<CrtcId>) -> Option<CrtcId> {
        if self.outputs.len() == 1 {
            return self.outputs.keys().next().copied();
        }

        // stay on the previous output while the window fits entirely on it
        let cached = cached.filter(|crtc| {
            self.outputs
                .get(crtc)
                .is_some_and(|output| output.contains_rect(geometry))
        });
        if cached.is_some() {
            return cached;
        }

        self.outputs
            .iter()
            .map(|(crtc, output)| (*crtc, coverage(*output, geometry)))
            .filter(|(_, area)| *area > 0)
            .max_by_key(|(_, area)| *area)
            .map(|(crtc, _)| crtc)
    }

    /// One emulated frame went by for `toplevel`
    fn advance(&mut self, toplevel: WindowId) {
        let ust = self.now();
        let Some(window) = self.windows.get_mut(&toplevel) else {
            return;
        };
        window.clock = UstMsc::new(ust, window.clock.msc.wrapping_add(1));
        let clock = window.clock;
        trace!("{} advanced to msc {}", toplevel, clock.msc);

        let events = &mut self.events;
        window.vblank_events.retain(|&(event_id, target)| {
            if msc_is_equal_or_after(clock.msc, target) {
                events.push(BackendEvent::new(event_id, clock));
                false
            } else {
                true
            }
        });
    }

    /// Arm, re-arm or stop the fallback timer of `toplevel` as its state requires
    fn reset_timer(&mut self, toplevel: WindowId) {
        let Some(window) = self.windows.get_mut(&toplevel) else {
            self.timer.disarm(toplevel);
            return;
        };
        let wanted = if window.frame_callback.is_some() {
            Some(self.fallback_interval)
        } else if !window.vblank_events.is_empty() {
            Some(self.copy_interval)
        } else {
            None
        };
        if wanted == window.timer {
            return;
        }
        window.timer = wanted;
        match wanted {
            Some(after) => self.timer.arm(toplevel, after),
            None => self.timer.disarm(toplevel),
        }
    }

    /// Frame-done callback for the present surface of `toplevel`
    pub fn on_frame_done(&mut self, toplevel: WindowId) {
        let Some(window) = self.windows.get_mut(&toplevel) else {
            trace!("Frame callback for unknown {}", toplevel);
            return;
        };
        let Some(requested_at) = window.frame_callback.take() else {
            trace!("Stray frame callback for {}", toplevel);
            return;
        };
        if requested_at == window.clock.msc {
            self.advance(toplevel);
        } else {
            trace!(
                "Dropping frame callback for {} from msc {}, timer already at {}",
                toplevel,
                requested_at,
                window.clock.msc
            );
        }
        self.reset_timer(toplevel);
    }

    /// Fallback timer of `toplevel` expired
    pub fn on_fallback_timer(&mut self, toplevel: WindowId) {
        self.timer.fired(toplevel);
        let Some(window) = self.windows.get_mut(&toplevel) else {
            return;
        };
        window.timer = None;
        trace!("Fallback timer fired for {}", toplevel);
        self.advance(toplevel);
        self.reset_timer(toplevel);
    }

    /// Compositor is done reading `buffer`, which was tagged with `owner`
    pub fn on_buffer_release(&mut self, owner: WindowId, buffer: BufferId) {
        let Some(window) = self.windows.get_mut(&owner) else {
            trace!("Release of {:?} for unknown {}", buffer, owner);
            return;
        };
        let Some(ids) = window.release_events.remove(&buffer) else {
            trace!("Release of untracked {:?} for {}", buffer, owner);
            return;
        };
        let clock = window.clock;
        self.events
            .extend(ids.into_iter().map(|event_id| BackendEvent::new(event_id, clock)));
    }

    /// Point the present surface of `toplevel` at `window`, rebuilding it if needed
    fn configure_present_surface(
        &mut self,
        toplevel: WindowId,
        window: WindowId,
        toplevel_geometry: Rectangle<i32, Logical>,
        geometry: Rectangle<i32, Logical>,
    ) -> Option<SurfaceId> {
        let compositor = &mut self.compositor;
        let state = self.windows.get_mut(&toplevel)?;

        if state.present_window != Some(window) {
            state.present_window = Some(window);
            state.need_configure = true;
        }

        if state.need_configure || state.present_surface.is_none() {
            state.need_configure = false;
            cleanup_surfaces(compositor, state);

            let present = if geometry == toplevel_geometry {
                debug!("Presenting {} on the main surface of {}", window, toplevel);
                PresentSurface::Main(state.surface)
            } else {
                let surface = compositor.create_surface();
                let subsurface = compositor.create_subsurface(surface, state.surface);
                compositor.set_subsurface_position(subsurface, geometry.loc - toplevel_geometry.loc);
                debug!("Presenting {} on a sub-surface of {}", window, toplevel);
                PresentSurface::Sub {
                    surface,
                    subsurface,
                }
            };
            state.present_surface = Some(present);
        }

        state.present_surface.map(|present| present.surface())
    }
}

impl<C: Compositor, T: FallbackTimer> PresentBackend for CompositorBridge<C, T> {
    fn capabilities(&self) -> PresentCapabilities {
        PresentCapabilities::ASYNC
    }

    fn reports_release(&self) -> bool {
        true
    }

    fn get_crtc(&mut self, windows: &dyn WindowSystem, window: WindowId) -> Option<CrtcId> {
        let toplevel = windows.toplevel(window)?;
        let geometry = windows.geometry(window)?;
        let cached = self.windows.get(&toplevel).and_then(|state| state.output);
        let crtc = self.pick_output(geometry, cached);
        if self.ensure_window(toplevel).is_some() {
            if let Some(state) = self.windows.get_mut(&toplevel) {
                state.output = crtc;
            }
        }
        crtc
    }

    fn get_ust_msc(
        &mut self,
        windows: &dyn WindowSystem,
        window: WindowId,
        _crtc: Option<CrtcId>,
    ) -> Result<UstMsc, BackendError> {
        windows
            .toplevel(window)
            .and_then(|toplevel| self.ensure_window(toplevel))
            .ok_or(BackendError::NoCrtc(window))
    }

    fn queue_vblank(
        &mut self,
        windows: &dyn WindowSystem,
        window: WindowId,
        _crtc: Option<CrtcId>,
        event_id: EventId,
        msc: u64,
    ) -> Result<(), BackendError> {
        let toplevel = windows.toplevel(window).ok_or(BackendError::NoCrtc(window))?;
        let clock = self.ensure_window(toplevel).ok_or(BackendError::NoCrtc(window))?;

        if msc_is_equal_or_after(clock.msc, msc) {
            self.events.push(BackendEvent::new(event_id, clock));
            return Ok(());
        }
        if let Some(state) = self.windows.get_mut(&toplevel) {
            state.vblank_events.push((event_id, msc));
        }
        self.reset_timer(toplevel);
        Ok(())
    }

    fn abort_vblank(
        &mut self,
        windows: &dyn WindowSystem,
        window: WindowId,
        _crtc: Option<CrtcId>,
        event_id: EventId,
        _msc: u64,
    ) {
        let Some(toplevel) = windows.toplevel(window) else {
            return;
        };
        if let Some(state) = self.windows.get_mut(&toplevel) {
            state.vblank_events.retain(|(id, _)| *id != event_id);
        }
        self.reset_timer(toplevel);
    }

    fn check_flip(
        &self,
        windows: &dyn WindowSystem,
        crtc: Option<CrtcId>,
        window: WindowId,
        pixmap: &Pixmap,
        _sync_flip: bool,
    ) -> Result<(), FlipReason> {
        let toplevel = windows.toplevel(window).ok_or(FlipReason::NoCrtc)?;
        if self.compositor.toplevel_surface(toplevel).is_none() {
            return Err(FlipReason::NoCrtc);
        }
        let geometry = windows.geometry(window).ok_or(FlipReason::NoCrtc)?;
        let cached = self.windows.get(&toplevel).and_then(|state| state.output);
        let current = self.pick_output(geometry, cached).ok_or(FlipReason::NoCrtc)?;
        if crtc.is_some_and(|crtc| crtc != current) {
            return Err(FlipReason::NoCrtc);
        }
        if pixmap.size() != geometry.size {
            return Err(FlipReason::Geometry);
        }
        let busy = self
            .windows
            .get(&toplevel)
            .and_then(|state| state.present_window)
            .is_some_and(|presenting| presenting != window);
        if busy {
            return Err(FlipReason::Busy);
        }
        Ok(())
    }

    fn flip(
        &mut self,
        windows: &dyn WindowSystem,
        window: WindowId,
        _crtc: Option<CrtcId>,
        event_id: EventId,
        _target_msc: u64,
        pixmap: &Pixmap,
        _sync_flip: bool,
    ) -> Result<(), BackendError> {
        let no_crtc = || BackendError::NoCrtc(window);
        let toplevel = windows.toplevel(window).ok_or_else(no_crtc)?;
        let toplevel_geometry = windows.geometry(toplevel).ok_or_else(no_crtc)?;
        let geometry = windows.geometry(window).ok_or_else(no_crtc)?;
        self.ensure_window(toplevel).ok_or_else(no_crtc)?;

        let surface = self
            .configure_present_surface(toplevel, window, toplevel_geometry, geometry)
            .ok_or_else(no_crtc)?;
        let buffer = self.compositor.buffer_for_pixmap(pixmap, toplevel);
        let state = self.windows.get_mut(&toplevel).ok_or_else(no_crtc)?;

        state.release_events.entry(buffer).or_default().push(event_id);
        self.compositor.attach(surface, buffer);
        if state.frame_callback.is_none() {
            self.compositor.request_frame(surface, toplevel);
            state.frame_callback = Some(state.clock.msc);
        }
        trace!("Attached {:?} for {} to {:?}", buffer, event_id, surface);
        self.reset_timer(toplevel);
        Ok(())
    }

    fn flip_executed(
        &mut self,
        windows: &dyn WindowSystem,
        window: WindowId,
        _crtc: Option<CrtcId>,
        event_id: EventId,
        damage: &Region,
    ) {
        let Some(toplevel) = windows.toplevel(window) else {
            return;
        };
        let Some(state) = self.windows.get(&toplevel) else {
            return;
        };
        let Some(present) = state.present_surface else {
            return;
        };
        let clock = state.clock;

        // the present surface starts at the window origin, so window-relative
        // damage is already surface-local
        let surface = present.surface();
        for rect in damage.rects() {
            self.compositor.damage(surface, *rect);
        }
        self.compositor.commit(surface);
        self.compositor.flush();

        self.events.push(BackendEvent::new(event_id, clock));
    }

    fn unflip(&mut self, windows: &dyn WindowSystem, window: WindowId, event_id: EventId) {
        let compositor = &mut self.compositor;
        let state = windows
            .toplevel(window)
            .and_then(|toplevel| self.windows.get_mut(&toplevel));

        let clock = match state {
            Some(state) => {
                if state.present_window.is_none_or(|presenting| presenting == window) {
                    cleanup_surfaces(compositor, state);
                    state.present_window = None;
                    state.need_configure = true;
                }
                state.clock
            }
            None => UstMsc::default(),
        };
        self.events.push(BackendEvent::new(event_id, clock));
    }

    fn flush(&mut self, _window: WindowId) {
        self.compositor.flush();
    }

    fn window_reconfigured(&mut self, windows: &dyn WindowSystem, window: WindowId) {
        let Some(toplevel) = windows.toplevel(window) else {
            return;
        };
        if let Some(state) = self.windows.get_mut(&toplevel) {
            if window == toplevel || state.present_window == Some(window) {
                state.need_configure = true;
            }
        }
    }

    fn window_destroyed(&mut self, window: WindowId) {
        if let Some(mut state) = self.windows.remove(&window) {
            debug!("Unrealizing bridged {}", window);
            cleanup_surfaces(&mut self.compositor, &mut state);
            self.timer.disarm(window);
            let released = state.take_release_events();
            self.events.extend(released);
            return;
        }

        for state in self.windows.values_mut() {
            if state.present_window == Some(window) {
                cleanup_surfaces(&mut self.compositor, state);
                state.present_window = None;
                state.need_configure = true;
                let released = state.take_release_events();
                self.events.extend(released);
            }
        }
    }

    fn take_events(&mut self) -> Vec<BackendEvent> {
        std::mem::take(&mut self.events)
    }
}
