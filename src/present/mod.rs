// SPDX-License-Identifier: GPL-3.0-only

//! Presentation scheduler.
//!
//! A [`PresentScreen`] owns the per-window presentation state of one screen
//! and drives every request from submission to completion. Requests wait for
//! an MSC, a fence or a previous flip, then get flipped onto the window or
//! copied into it. All asynchronous input (backend confirmations, fence
//! triggers, window lifecycle) re-enters through the methods here, and all
//! output to clients is collected as [`PresentEvent`]s.

mod execute;
mod request;
mod sync;
#[cfg(test)]
mod tests;
mod timing;
mod window_state;

pub use self::{
    request::{
        CompleteKind, CompleteMode, EventId, PresentEvent, PresentNotify, PresentOptions, Stage,
        VblankRequest,
    },
    sync::{Fence, FenceId},
    timing::{FakeClock, UstMsc, adjust_timings, msc_is_after, msc_is_equal_or_after, ust_now},
    window_state::{CrtcAssignment, WindowPresent},
};

use crate::{
    backend::{
        BackendEvent, PresentBackend, PresentCapabilities,
        bridge::{BufferId, Compositor, CompositorBridge, FallbackTimer},
        direct::{DirectBackend, Scanout},
    },
    config::PresentConfig,
    utils::region::Region,
    window::{CrtcId, Pixmap, WindowId, WindowSystem},
};
use indexmap::IndexMap;
use smithay::utils::{Logical, Point};
use std::collections::{HashMap, TryReserveError};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum PresentError {
    #[error("out of memory queueing request")]
    Alloc(#[from] TryReserveError),
    #[error("window {window} already has {limit} requests outstanding")]
    QueueFull { window: WindowId, limit: usize },
    #[error("unknown window {0}")]
    UnknownWindow(WindowId),
}

/// A client's request to show `pixmap` on `window`
#[derive(Debug)]
pub struct PixmapRequest {
    pub window: WindowId,
    pub pixmap: Pixmap,
    pub serial: u32,
    /// Part of the pixmap holding valid contents
    pub valid: Option<Region>,
    /// Part of the pixmap that changed, `None` for all of it
    pub update: Option<Region>,
    /// Position of the pixmap relative to the window
    pub offset: Point<i32, Logical>,
    pub target_crtc: Option<CrtcId>,
    pub wait_fence: Option<Fence>,
    pub idle_fence: Option<Fence>,
    pub options: PresentOptions,
    /// Window-relative MSC
    pub target_msc: u64,
    pub divisor: u64,
    pub remainder: u64,
    pub notifies: Vec<PresentNotify>,
}

impl PixmapRequest {
    /// Present `pixmap` on `window` as soon as possible
    pub fn new(window: WindowId, pixmap: Pixmap, serial: u32) -> Self {
        Self {
            window,
            pixmap,
            serial,
            valid: None,
            update: None,
            offset: Point::from((0, 0)),
            target_crtc: None,
            wait_fence: None,
            idle_fence: None,
            options: PresentOptions::empty(),
            target_msc: 0,
            divisor: 0,
            remainder: 0,
            notifies: Vec::new(),
        }
    }
}

/// Anything entering the scheduler, with or without a pixmap
#[derive(Debug)]
struct Submission {
    kind: CompleteKind,
    window: WindowId,
    pixmap: Option<Pixmap>,
    serial: u32,
    valid: Option<Region>,
    update: Option<Region>,
    offset: Point<i32, Logical>,
    target_crtc: Option<CrtcId>,
    wait_fence: Option<Fence>,
    idle_fence: Option<Fence>,
    options: PresentOptions,
    target_msc: u64,
    divisor: u64,
    remainder: u64,
    notifies: Vec<PresentNotify>,
}

impl From<PixmapRequest> for Submission {
    fn from(request: PixmapRequest) -> Self {
        Self {
            kind: CompleteKind::Pixmap,
            window: request.window,
            pixmap: Some(request.pixmap),
            serial: request.serial,
            valid: request.valid,
            update: request.update,
            offset: request.offset,
            target_crtc: request.target_crtc,
            wait_fence: request.wait_fence,
            idle_fence: request.idle_fence,
            options: request.options,
            target_msc: request.target_msc,
            divisor: request.divisor,
            remainder: request.remainder,
            notifies: request.notifies,
        }
    }
}

/// Presentation state of one screen
pub struct PresentScreen<W: WindowSystem, B: PresentBackend> {
    windows: W,
    backend: B,
    config: PresentConfig,
    fake_clock: FakeClock,
    states: HashMap<WindowId, WindowPresent>,
    /// Window owning each live request
    event_index: HashMap<EventId, WindowId>,
    /// Window waiting for each outstanding unflip
    unflip_index: HashMap<EventId, WindowId>,
    fence_waiters: HashMap<FenceId, Vec<EventId>>,
    /// In-flight flips whose window is gone, dropped once the backend confirms
    orphans: IndexMap<EventId, VblankRequest>,
    next_event_id: u64,
    notifications: Vec<PresentEvent>,
    /// Number of upcoming reservations that fail
    #[cfg(test)]
    fail_reserve: usize,
}

impl<W: WindowSystem, B: PresentBackend> std::fmt::Debug for PresentScreen<W, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentScreen")
            .field("states", &self.states)
            .field("orphans", &self.orphans)
            .field("next_event_id", &self.next_event_id)
            .finish_non_exhaustive()
    }
}

impl<W: WindowSystem, B: PresentBackend> PresentScreen<W, B> {
    pub fn new(windows: W, backend: B, config: PresentConfig) -> Self {
        info!(
            "Present screen up: capabilities {:?}, flips {}",
            backend.capabilities(),
            if config.allow_flips { "enabled" } else { "disabled" }
        );
        Self {
            windows,
            backend,
            fake_clock: FakeClock::new(config.fake_interval),
            config,
            states: HashMap::new(),
            event_index: HashMap::new(),
            unflip_index: HashMap::new(),
            fence_waiters: HashMap::new(),
            orphans: IndexMap::new(),
            next_event_id: 0,
            notifications: Vec::new(),
            #[cfg(test)]
            fail_reserve: 0,
        }
    }

    pub fn windows(&self) -> &W {
        &self.windows
    }

    /// Direct access to the window system; call [`Self::window_reconfigured`]
    /// or [`Self::destroy_window`] for changes that affect presentation
    pub fn windows_mut(&mut self) -> &mut W {
        &mut self.windows
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &PresentConfig {
        &self.config
    }

    pub fn window_state(&self, window: WindowId) -> Option<&WindowPresent> {
        self.states.get(&window)
    }

    /// Notifications for the client layer produced since the last call
    pub fn take_notifications(&mut self) -> Vec<PresentEvent> {
        std::mem::take(&mut self.notifications)
    }

    fn next_event_id(&mut self) -> EventId {
        self.next_event_id += 1;
        EventId(self.next_event_id)
    }

    /// Clock of `window`, from the backend or emulated when it has none
    fn ust_msc(&mut self, window: WindowId, crtc: Option<CrtcId>) -> UstMsc {
        match self.backend.get_ust_msc(&self.windows, window, crtc) {
            Ok(clock) => clock,
            Err(err) => {
                trace!("{}: {}, using emulated clock", window, err);
                self.fake_clock.ust_msc()
            }
        }
    }

    /// Current window-relative clock of `window`
    pub fn get_ust_msc(&mut self, window: WindowId) -> UstMsc {
        let crtc = self.backend.get_crtc(&self.windows, window);
        let clock = self.ust_msc(window, crtc);
        let offset = self.states.get(&window).map_or(0, |state| state.msc_offset);
        UstMsc::new(clock.ust, clock.msc.wrapping_sub(offset))
    }

    /// What a client presenting to `window` may rely on
    pub fn query_capabilities(&mut self, window: WindowId) -> PresentCapabilities {
        match self.backend.get_crtc(&self.windows, window) {
            Some(_) => self.backend.capabilities(),
            None => PresentCapabilities::empty(),
        }
    }

    /// Queue `request` for presentation.
    ///
    /// On error nothing is left behind: the request and every reference it
    /// holds are dropped.
    pub fn present_pixmap(&mut self, request: PixmapRequest) -> Result<EventId, PresentError> {
        self.submit(request.into())
    }

    /// Report the clock of `window` once it reaches `target_msc`, or the next
    /// MSC satisfying `divisor` and `remainder` if that has passed.
    pub fn notify_msc(
        &mut self,
        window: WindowId,
        serial: u32,
        target_msc: u64,
        divisor: u64,
        remainder: u64,
    ) -> Result<EventId, PresentError> {
        // with no divisor "now" is good enough
        let options = if divisor == 0 {
            PresentOptions::ASYNC
        } else {
            PresentOptions::empty()
        };
        self.submit(Submission {
            kind: CompleteKind::NotifyMsc,
            window,
            pixmap: None,
            serial,
            valid: None,
            update: None,
            offset: Point::from((0, 0)),
            target_crtc: None,
            wait_fence: None,
            idle_fence: None,
            options,
            target_msc,
            divisor,
            remainder,
            notifies: Vec::new(),
        })
    }

    /// Room for one more request of `window` in the event index
    fn reserve(&mut self, window: WindowId) -> Result<(), PresentError> {
        #[cfg(test)]
        if self.fail_reserve > 0 {
            self.fail_reserve -= 1;
            if let Err(err) = Vec::<u8>::new().try_reserve(usize::MAX) {
                return Err(err.into());
            }
        }
        self.event_index.try_reserve(1)?;
        trace!("Reserved request slot for {}", window);
        Ok(())
    }

    fn submit(&mut self, submission: Submission) -> Result<EventId, PresentError> {
        let window = submission.window;
        if self.windows.geometry(window).is_none() {
            return Err(PresentError::UnknownWindow(window));
        }

        let live = self.states.get(&window).map_or(0, |state| state.requests.len());
        if live >= self.config.max_requests {
            warn!("{} has {} requests outstanding, refusing more", window, live);
            return Err(PresentError::QueueFull {
                window,
                limit: self.config.max_requests,
            });
        }
        self.reserve(window)?;

        let crtc = submission
            .target_crtc
            .or_else(|| self.backend.get_crtc(&self.windows, window));
        let clock = self.ust_msc(window, crtc);

        let state = self
            .states
            .entry(window)
            .or_insert_with(|| WindowPresent::new(window));
        let crtc_target = state.window_to_crtc_msc(crtc, submission.target_msc, clock.msc);
        state.msc = clock.msc;
        let msc_offset = state.msc_offset;
        let target_msc = adjust_timings(
            submission.options,
            clock.msc,
            crtc_target,
            submission.divisor,
            submission.remainder,
        );

        if submission.update.is_none() && submission.pixmap.is_some() {
            self.scrap_obsolete(window, target_msc);
        }

        let event_id = self.next_event_id();
        let mut request = VblankRequest {
            event_id,
            window,
            serial: submission.serial,
            kind: submission.kind,
            pixmap: submission.pixmap,
            valid: submission.valid,
            update: submission.update,
            offset: submission.offset,
            crtc,
            target_msc,
            exec_msc: target_msc,
            msc_offset,
            wait_fence: submission.wait_fence,
            idle_fence: submission.idle_fence,
            options: submission.options,
            notifies: submission.notifies,
            stage: Stage::Vblank,
            flip: false,
            sync_flip: false,
            requeue: false,
            abort_flip: false,
            aborted: false,
            released: false,
            copied: false,
            reason: None,
        };
        self.decide_flip(&mut request, clock.msc);

        debug!(
            "{} for {} serial {}: msc {} target {} exec {}{}",
            event_id,
            window,
            request.serial,
            clock.msc,
            request.target_msc,
            request.exec_msc,
            match (request.flip, request.sync_flip) {
                (true, true) => ", sync flip",
                (true, false) => ", async flip",
                _ => "",
            }
        );

        let exec_msc = request.exec_msc;
        if let Some(state) = self.states.get_mut(&window) {
            state.requests.insert(event_id, request);
        }
        self.event_index.insert(event_id, window);

        if msc_is_after(exec_msc, clock.msc) {
            match self
                .backend
                .queue_vblank(&self.windows, window, crtc, event_id, exec_msc)
            {
                Ok(()) => {
                    self.dispatch_backend_events();
                    return Ok(event_id);
                }
                Err(err) => debug!("Cannot wait for msc {} ({}), executing {} now", exec_msc, err, event_id),
            }
        }

        self.execute(window, event_id, clock.ust, clock.msc);
        self.dispatch_backend_events();
        Ok(event_id)
    }

    /// Entry point for every backend confirmation: vblank reached, flip done,
    /// buffer released or unflip done. Unknown ids are ignored.
    pub fn event_notify(&mut self, event_id: EventId, ust: u64, msc: u64) {
        self.handle_event(BackendEvent { event_id, ust, msc });
        self.dispatch_backend_events();
    }

    /// Feed events the backend queued back into the scheduler until it is quiet
    pub fn dispatch_backend_events(&mut self) {
        loop {
            let events = self.backend.take_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                self.handle_event(event);
            }
        }
    }

    /// `fence` was triggered; requests waiting on it run again
    pub fn fence_triggered(&mut self, fence: FenceId) {
        let Some(waiters) = self.fence_waiters.remove(&fence) else {
            trace!("Nobody waits for {}", fence);
            return;
        };
        for event_id in waiters {
            let Some(&window) = self.event_index.get(&event_id) else {
                continue;
            };
            let waiting = self
                .states
                .get(&window)
                .and_then(|state| state.request(event_id))
                .is_some_and(|request| request.stage == Stage::Fence);
            if waiting {
                trace!("{} triggered, running {}", fence, event_id);
                self.re_execute(window, event_id);
            }
        }
        self.dispatch_backend_events();
    }

    /// Geometry or clipping of `window` changed. Flips that no longer fit
    /// are undone; queued requests that can no longer flip will copy.
    pub fn window_reconfigured(&mut self, window: WindowId) {
        self.backend.window_reconfigured(&self.windows, window);
        self.check_flip_window(window);
        self.dispatch_backend_events();
    }

    /// `window` is about to be destroyed.
    ///
    /// Queued requests are dropped without notification, an in-flight flip is
    /// left to finish and discarded, and the window gets its original pixmap
    /// back before its storage can go away.
    pub fn destroy_window(&mut self, window: WindowId) {
        for state in self.states.values_mut() {
            for request in state.requests.values_mut() {
                request.notifies.retain(|notify| notify.window != window);
            }
        }
        for request in self.orphans.values_mut() {
            request.notifies.retain(|notify| notify.window != window);
        }

        if self.states.contains_key(&window) {
            debug!("Tearing down presentation of {}", window);
            self.teardown_window(window);
        }

        self.backend.window_destroyed(window);
        self.dispatch_backend_events();
    }

    /// `crtc` went away. Everything waiting on its vblanks runs right away:
    /// unexecuted pixmap requests complete as skipped.
    pub fn crtc_abandoned(&mut self, crtc: CrtcId) {
        let clock = self.fake_clock.ust_msc();
        let mut windows: Vec<WindowId> = self.states.keys().copied().collect();
        windows.sort();

        for window in windows {
            let Some(state) = self.states.get(&window) else {
                continue;
            };
            let msc = state.msc;
            let waiting: Vec<EventId> = state
                .requests
                .values()
                .filter(|request| request.crtc == Some(crtc))
                .filter(|request| matches!(request.stage, Stage::Vblank | Stage::Exec | Stage::FlipReady))
                .map(|request| request.event_id)
                .collect();
            let pending = state
                .flip_pending
                .filter(|id| state.request(*id).is_some_and(|request| request.crtc == Some(crtc)));

            for event_id in waiting {
                if let Some(request) = self.take_request(window, event_id) {
                    debug!("{} abandoned with {}", event_id, crtc);
                    if !request.copied {
                        self.notifications.extend(execute::idle_event(&request));
                    }
                    let mode = request.copy_mode();
                    self.notifications
                        .extend(execute::complete_events(&request, request.kind, mode, clock.ust, msc));
                }
            }

            if let Some(event_id) = pending {
                // the confirmation will never come
                self.set_abort_flip(window);
                self.flip_notify(window, event_id, clock.ust, msc, CompleteMode::Skip);
            }
        }

        // nothing will confirm flips of destroyed windows on this crtc either
        let before = self.orphans.len();
        self.orphans.retain(|_, request| request.crtc != Some(crtc));
        if self.orphans.len() != before {
            debug!("Dropped {} orphaned flips on {}", before - self.orphans.len(), crtc);
        }
        self.dispatch_backend_events();
    }

    /// Client gave up on the request `event_id`.
    ///
    /// A request that has not executed yet is dropped (its pixmap reported
    /// idle, no completion). A flip already handed to the backend is undone
    /// once confirmed. Copies that already happened cannot be aborted. Returns
    /// whether anything was aborted.
    pub fn abort(&mut self, event_id: EventId) -> bool {
        let Some(&window) = self.event_index.get(&event_id) else {
            return false;
        };
        let Some(stage) = self
            .states
            .get(&window)
            .and_then(|state| state.request(event_id))
            .map(|request| request.stage)
        else {
            return false;
        };

        let aborted = match stage {
            Stage::Vblank | Stage::Fence | Stage::FlipReady => {
                if let Some(request) = self.take_request(window, event_id) {
                    debug!("Aborted waiting {}", event_id);
                    self.notifications.extend(execute::idle_event(&request));
                }
                true
            }
            Stage::Flip => {
                debug!("Aborting in-flight flip {}", event_id);
                if let Some(request) = self
                    .states
                    .get_mut(&window)
                    .and_then(|state| state.request_mut(event_id))
                {
                    request.aborted = true;
                }
                self.set_abort_flip(window);
                true
            }
            // already executed, the completion still follows
            Stage::Exec | Stage::Active | Stage::Idle => false,
        };
        self.dispatch_backend_events();
        aborted
    }

    /// Undo every flip and give all windows their own pixmaps back
    pub fn shutdown(&mut self) {
        let mut windows: Vec<WindowId> = self.states.keys().copied().collect();
        windows.sort();
        for window in windows {
            self.teardown_window(window);
            self.backend.window_destroyed(window);
        }
        self.dispatch_backend_events();
        if !self.orphans.is_empty() {
            debug!("Dropping {} orphaned flips", self.orphans.len());
            self.orphans.clear();
        }
        self.unflip_index.clear();
        self.fence_waiters.clear();
        info!("Present screen shut down");
    }
}

impl<W: WindowSystem, C: Compositor, T: FallbackTimer> PresentScreen<W, CompositorBridge<C, T>> {
    pub fn frame_done(&mut self, toplevel: WindowId) {
        self.backend.on_frame_done(toplevel);
        self.dispatch_backend_events();
    }

    pub fn fallback_timer_fired(&mut self, toplevel: WindowId) {
        self.backend.on_fallback_timer(toplevel);
        self.dispatch_backend_events();
    }

    pub fn buffer_released(&mut self, owner: WindowId, buffer: BufferId) {
        self.backend.on_buffer_release(owner, buffer);
        self.dispatch_backend_events();
    }
}

impl<W: WindowSystem, S: Scanout> PresentScreen<W, DirectBackend<S>> {
    pub fn vblank(&mut self, crtc: CrtcId, ust: u64, msc: u64) {
        self.backend.on_vblank(crtc, ust, msc);
        self.dispatch_backend_events();
    }

    pub fn remove_crtc(&mut self, crtc: CrtcId) {
        self.backend.remove_crtc(crtc);
        self.crtc_abandoned(crtc);
    }
}
