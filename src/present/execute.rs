// SPDX-License-Identifier: GPL-3.0-only

//! Request execution and the per-window flip state machine.
//!
//! Every transition looks the request up again by id instead of holding on
//! to it, so a request that was dropped in between simply is not found.

use super::{
    CompleteKind, CompleteMode, EventId, PresentEvent, PresentOptions, PresentScreen, Stage,
    VblankRequest, msc_is_after,
};
use crate::{
    backend::{BackendEvent, FlipReason, PresentBackend, PresentCapabilities},
    window::{Pixmap, WindowId, WindowSystem, set_tree_pixmap},
};
use smithay::utils::{Point, Rectangle};
use tracing::{debug, trace, warn};

/// Idle notification for the pixmap of `request`, triggering its idle fence
pub(super) fn idle_event(request: &VblankRequest) -> Option<PresentEvent> {
    let pixmap = request.pixmap.as_ref()?;
    if let Some(fence) = &request.idle_fence {
        fence.trigger();
    }
    trace!("{} idle for {}", pixmap.id(), request.window);
    Some(PresentEvent::Idle {
        window: request.window,
        serial: request.serial,
        pixmap: pixmap.id(),
        idle_fence: request.idle_fence.as_ref().map(|fence| fence.id()),
    })
}

/// Completion for the requesting window and everybody on the notify list
pub(super) fn complete_events(
    request: &VblankRequest,
    kind: CompleteKind,
    mode: CompleteMode,
    ust: u64,
    crtc_msc: u64,
) -> Vec<PresentEvent> {
    let msc = crtc_msc.wrapping_sub(request.msc_offset);
    std::iter::once((request.window, request.serial))
        .chain(request.notifies.iter().map(|notify| (notify.window, notify.serial)))
        .map(|(window, serial)| PresentEvent::Complete {
            window,
            kind,
            mode,
            serial,
            ust,
            msc,
        })
        .collect()
}

impl<W: WindowSystem, B: PresentBackend> PresentScreen<W, B> {
    fn check_flip(&self, request: &VblankRequest, pixmap: &Pixmap, sync_flip: bool) -> Result<(), FlipReason> {
        if request.offset != Point::from((0, 0)) {
            return Err(FlipReason::Geometry);
        }
        if let Some(valid) = &request.valid {
            let full = Rectangle::new(Point::from((0, 0)), pixmap.size());
            if !valid.rects().iter().any(|rect| rect.contains_rect(full)) {
                return Err(FlipReason::Geometry);
            }
        }
        self.backend
            .check_flip(&self.windows, request.crtc, request.window, pixmap, sync_flip)
    }

    fn recheck_flip(&self, request: &VblankRequest) -> Result<(), FlipReason> {
        match &request.pixmap {
            Some(pixmap) => self.check_flip(request, pixmap, request.sync_flip),
            None => Ok(()),
        }
    }

    /// Pick flip or copy for a new request. Sync flips execute one frame
    /// early since the backend flips on the following vblank.
    pub(super) fn decide_flip(&self, request: &mut VblankRequest, crtc_msc: u64) {
        let Some(pixmap) = request.pixmap.clone() else {
            return;
        };
        if request.options.contains(PresentOptions::COPY) || !self.config.allow_flips {
            return;
        }

        if msc_is_after(request.target_msc, crtc_msc) {
            match self.check_flip(request, &pixmap, true) {
                Ok(()) => {
                    request.flip = true;
                    request.sync_flip = true;
                    request.exec_msc = request.target_msc.wrapping_sub(1);
                    return;
                }
                Err(reason) => request.reason = Some(reason),
            }
        }

        if self.backend.capabilities().contains(PresentCapabilities::ASYNC) {
            match self.check_flip(request, &pixmap, false) {
                Ok(()) => {
                    request.flip = true;
                    request.reason = None;
                }
                Err(reason) => request.reason = Some(reason),
            }
        }
    }

    /// Remove `event_id` from every queue it waits in and hand it over
    pub(super) fn take_request(&mut self, window: WindowId, event_id: EventId) -> Option<VblankRequest> {
        let state = self.states.get_mut(&window)?;
        let request = state.requests.shift_remove(&event_id)?;
        self.event_index.remove(&event_id);

        if let Some(fence) = &request.wait_fence {
            if let Some(waiters) = self.fence_waiters.get_mut(&fence.id()) {
                waiters.retain(|id| *id != event_id);
                if waiters.is_empty() {
                    self.fence_waiters.remove(&fence.id());
                }
            }
        }
        if matches!(request.stage, Stage::Vblank | Stage::Exec) {
            self.backend
                .abort_vblank(&self.windows, window, request.crtc, event_id, request.exec_msc);
        }
        Some(request)
    }

    /// Last writer wins: a new full-window pixmap replaces anything still
    /// queued for the same MSC, which is reported idle and never completes.
    pub(super) fn scrap_obsolete(&mut self, window: WindowId, target_msc: u64) {
        let Some(state) = self.states.get(&window) else {
            return;
        };
        let obsolete: Vec<EventId> = state
            .requests
            .values()
            .filter(|request| request.pixmap.is_some() && request.is_queued())
            .filter(|request| request.target_msc == target_msc)
            .map(|request| request.event_id)
            .collect();

        for event_id in obsolete {
            if let Some(request) = self.take_request(window, event_id) {
                debug!(
                    "Scrapping {} serial {} for {}: replaced at msc {}",
                    event_id, request.serial, window, target_msc
                );
                self.notifications.extend(idle_event(&request));
            }
        }
    }

    pub(super) fn handle_event(&mut self, event: BackendEvent) {
        let BackendEvent { event_id, ust, msc } = event;

        if let Some(request) = self.orphans.shift_remove(&event_id) {
            debug!("Dropping orphaned flip {} of {}", event_id, request.window);
            return;
        }
        if let Some(window) = self.unflip_index.remove(&event_id) {
            self.event_unflip(window, event_id);
            return;
        }

        let Some(&window) = self.event_index.get(&event_id) else {
            trace!("Stale event {}", event_id);
            return;
        };
        let Some(state) = self.states.get_mut(&window) else {
            return;
        };
        let is_pending = state.flip_pending == Some(event_id);
        let Some(request) = state.request_mut(event_id) else {
            return;
        };

        let stage = request.stage;
        match stage {
            Stage::Vblank => self.execute(window, event_id, ust, msc),
            Stage::Exec => self.complete(window, event_id, ust, msc),
            Stage::Flip if is_pending => {
                self.flip_notify(window, event_id, ust, msc, CompleteMode::Flip)
            }
            Stage::Active => {
                trace!("{} released while still shown", event_id);
                request.released = true;
            }
            Stage::Idle => self.free_idle_request(window, event_id),
            stage => trace!("Ignoring event for {} in {:?}", event_id, stage),
        }
    }

    pub(super) fn re_execute(&mut self, window: WindowId, event_id: EventId) {
        let Some(crtc) = self
            .states
            .get(&window)
            .and_then(|state| state.request(event_id))
            .map(|request| request.crtc)
        else {
            return;
        };
        let clock = self.ust_msc(window, crtc);
        self.execute(window, event_id, clock.ust, clock.msc);
    }

    /// The request reached its MSC; flip it, copy it, or keep it waiting
    pub(super) fn execute(&mut self, window: WindowId, event_id: EventId, ust: u64, crtc_msc: u64) {
        let Some(state) = self.states.get_mut(&window) else {
            return;
        };
        state.msc = crtc_msc;
        let flip_busy = state.flip_pending.is_some() || state.unflip_event_id.is_some();
        let Some(request) = state.requests.get_mut(&event_id) else {
            return;
        };

        if request.requeue {
            request.requeue = false;
            if msc_is_after(request.target_msc, crtc_msc) {
                request.exec_msc = request.target_msc;
                request.stage = Stage::Vblank;
                if self
                    .backend
                    .queue_vblank(&self.windows, window, request.crtc, event_id, request.target_msc)
                    .is_ok()
                {
                    trace!("{} requeued for msc {}", event_id, request.target_msc);
                    return;
                }
            }
        }

        if let Some(fence) = request.wait_fence.as_ref().filter(|fence| !fence.is_triggered()) {
            let waiters = self.fence_waiters.entry(fence.id()).or_default();
            if !waiters.contains(&event_id) {
                waiters.push(event_id);
            }
            trace!("{} waits for {}", event_id, fence.id());
            request.stage = Stage::Fence;
            return;
        }

        if request.flip && request.pixmap.is_some() && flip_busy {
            trace!("{} ready to flip, waiting for the previous flip", event_id);
            request.stage = Stage::FlipReady;
            return;
        }

        if request.pixmap.is_none() {
            self.complete(window, event_id, ust, crtc_msc);
            return;
        }

        if request.flip && self.execute_flip(window, event_id) {
            return;
        }
        self.execute_copy(window, event_id, ust, crtc_msc);
    }

    /// Hand the pixmap to the backend; false when it refused
    fn execute_flip(&mut self, window: WindowId, event_id: EventId) -> bool {
        let Self {
            windows,
            backend,
            states,
            ..
        } = self;
        let Some(state) = states.get_mut(&window) else {
            return false;
        };
        let Some(request) = state.requests.get_mut(&event_id) else {
            return false;
        };
        let Some(pixmap) = request.pixmap.clone() else {
            return false;
        };

        request.stage = Stage::Flip;
        state.flip_pending = Some(event_id);

        match backend.flip(
            &*windows,
            window,
            request.crtc,
            event_id,
            request.target_msc,
            &pixmap,
            request.sync_flip,
        ) {
            Ok(()) => {
                debug!("Flipping {} onto {} for {}", pixmap.id(), window, event_id);
                let old = windows.window_pixmap(window);
                if state.restore_pixmap.is_none() {
                    state.restore_pixmap = old.clone();
                }
                set_tree_pixmap(windows, window, old.as_ref(), &pixmap);

                let clip = windows.clip_region(window);
                let damage = match &request.update {
                    Some(update) => update.translate(request.offset).intersect(&clip),
                    None => clip,
                };
                windows.damage(window, &damage);
                backend.flip_executed(&*windows, window, request.crtc, event_id, &damage);
                true
            }
            Err(err) => {
                debug!("Flip for {} failed, copying instead: {}", event_id, err);
                state.flip_pending = None;
                request.flip = false;
                request.stage = Stage::Vblank;
                false
            }
        }
    }

    fn execute_copy(&mut self, window: WindowId, event_id: EventId, ust: u64, crtc_msc: u64) {
        // a copy replaces whatever is flipped
        if let Some(state) = self.states.get(&window) {
            if state.flip_pending.is_some() {
                self.set_abort_flip(window);
            } else if state.unflip_event_id.is_none() && state.flip_active.is_some() {
                self.unflip(window);
            }
        }

        let Self {
            windows,
            backend,
            states,
            notifications,
            ..
        } = self;
        let Some(request) = states
            .get_mut(&window)
            .and_then(|state| state.requests.get_mut(&event_id))
        else {
            return;
        };

        // a sync flip that fell through executed one frame early
        if request.exec_msc != request.target_msc && msc_is_after(request.target_msc, crtc_msc) {
            request.exec_msc = request.target_msc;
            request.stage = Stage::Vblank;
            if backend
                .queue_vblank(&*windows, window, request.crtc, event_id, request.target_msc)
                .is_ok()
            {
                trace!("{} waits for msc {} to copy", event_id, request.target_msc);
                return;
            }
        }

        let Some(pixmap) = request.pixmap.clone() else {
            return;
        };
        debug!("Copying {} into {} for {}", pixmap.id(), window, event_id);
        windows.copy_to_window(&pixmap, window, request.update.as_ref(), request.offset);
        request.update = None;
        backend.flush(window);

        // copied pixels, the client may reuse the pixmap right away
        request.copied = true;
        notifications.extend(idle_event(request));

        // completion is reported once the copy made it to the screen
        let next_msc = crtc_msc.wrapping_add(1);
        request.stage = Stage::Exec;
        request.exec_msc = next_msc;
        if backend
            .queue_vblank(&*windows, window, request.crtc, event_id, next_msc)
            .is_ok()
        {
            return;
        }
        self.complete(window, event_id, ust, crtc_msc);
    }

    pub(super) fn complete(&mut self, window: WindowId, event_id: EventId, ust: u64, crtc_msc: u64) {
        let Some(request) = self
            .states
            .get_mut(&window)
            .and_then(|state| state.requests.shift_remove(&event_id))
        else {
            return;
        };
        self.event_index.remove(&event_id);

        let mode = request.copy_mode();
        debug!(
            "{} complete for {} at msc {} ({:?})",
            event_id, window, crtc_msc, mode
        );
        self.notifications
            .extend(complete_events(&request, request.kind, mode, ust, crtc_msc));
    }

    /// The backend confirmed the pending flip `event_id`
    pub(super) fn flip_notify(
        &mut self,
        window: WindowId,
        event_id: EventId,
        ust: u64,
        crtc_msc: u64,
        mode: CompleteMode,
    ) {
        let reports_release = self.backend.reports_release();
        let Some(state) = self.states.get_mut(&window) else {
            return;
        };
        if state.flip_pending != Some(event_id) {
            return;
        }
        state.flip_pending = None;
        let previous = state.flip_active.replace(event_id);
        let Some(request) = state.request_mut(event_id) else {
            return;
        };

        request.stage = Stage::Active;
        let abort_flip = request.abort_flip;
        let completion = (!request.aborted)
            .then(|| complete_events(request, CompleteKind::Pixmap, mode, ust, crtc_msc));
        debug!("Flip {} on {} landed at msc {}", event_id, window, crtc_msc);

        if let Some(previous) = previous {
            self.retire_flip(window, previous, reports_release);
        }
        if abort_flip {
            self.unflip(window);
        }
        match completion {
            Some(events) => self.notifications.extend(events),
            None => debug!("Not reporting aborted flip {}", event_id),
        }
        self.flip_try_ready(window);
    }

    /// A superseded flip is idle once its buffer is no longer in use
    fn retire_flip(&mut self, window: WindowId, event_id: EventId, reports_release: bool) {
        let Some(request) = self
            .states
            .get_mut(&window)
            .and_then(|state| state.request_mut(event_id))
        else {
            return;
        };
        if reports_release && !request.released {
            trace!("{} waits for its buffer to be released", event_id);
            request.stage = Stage::Idle;
            return;
        }
        self.free_idle_request(window, event_id);
    }

    fn free_idle_request(&mut self, window: WindowId, event_id: EventId) {
        let Some(request) = self
            .states
            .get_mut(&window)
            .and_then(|state| state.requests.shift_remove(&event_id))
        else {
            return;
        };
        self.event_index.remove(&event_id);
        self.notifications.extend(idle_event(&request));
    }

    /// Release every retired flip of `window` that still waits for the backend
    fn free_idle(&mut self, window: WindowId) {
        let Some(state) = self.states.get(&window) else {
            return;
        };
        let idle: Vec<EventId> = state.in_stage(Stage::Idle).map(|request| request.event_id).collect();
        for event_id in idle {
            self.free_idle_request(window, event_id);
        }
    }

    /// Put the original pixmap back under `window`.
    ///
    /// Drawing may have gone into the flipped pixmap while it was shown, so
    /// its contents are copied back first.
    pub(super) fn restore_window_pixmap(&mut self, window: WindowId) {
        let Self { windows, states, .. } = self;
        let Some(state) = states.get_mut(&window) else {
            return;
        };
        let Some(restore) = state.restore_pixmap.take() else {
            return;
        };

        let flip_pixmap = state.flip_pixmap();
        match &flip_pixmap {
            Some(flip_pixmap) if windows.window_pixmap(window).as_ref() == Some(flip_pixmap) => {
                windows.copy_to_pixmap(flip_pixmap, &restore);
            }
            Some(_) => debug!("{} no longer shows its flip, leaving its pixmap alone", window),
            None => {}
        }
        // only windows still showing the flip get the original back
        set_tree_pixmap(windows, window, flip_pixmap.as_ref(), &restore);
        debug!("Restored {} on {}", restore.id(), window);
    }

    /// Undo the pending flip as soon as the backend confirms it
    pub(super) fn set_abort_flip(&mut self, window: WindowId) {
        let Some(pending) = self.states.get(&window).and_then(|state| state.flip_pending) else {
            return;
        };
        let already = self
            .states
            .get(&window)
            .and_then(|state| state.request(pending))
            .is_none_or(|request| request.abort_flip);
        if already {
            return;
        }

        self.restore_window_pixmap(window);
        if let Some(request) = self
            .states
            .get_mut(&window)
            .and_then(|state| state.request_mut(pending))
        {
            debug!("Aborting flip {} on {}", pending, window);
            request.abort_flip = true;
        }
    }

    pub(super) fn unflip(&mut self, window: WindowId) {
        let Some(state) = self.states.get(&window) else {
            return;
        };
        if state.unflip_event_id.is_some() || state.flip_pending.is_some() {
            warn!("Cannot unflip {} with a flip or unflip outstanding", window);
            return;
        }

        self.restore_window_pixmap(window);
        self.free_idle(window);

        let event_id = self.next_event_id();
        if let Some(state) = self.states.get_mut(&window) {
            state.unflip_event_id = Some(event_id);
        }
        self.unflip_index.insert(event_id, window);
        debug!("Unflipping {} ({})", window, event_id);
        self.backend.unflip(&self.windows, window, event_id);
    }

    fn event_unflip(&mut self, window: WindowId, event_id: EventId) {
        let Some(state) = self.states.get_mut(&window) else {
            trace!("Unflip {} for unknown {}", event_id, window);
            return;
        };
        if state.unflip_event_id != Some(event_id) {
            return;
        }
        state.unflip_event_id = None;
        debug!("Unflip {} of {} done", event_id, window);

        if let Some(active) = state.flip_active.take() {
            self.free_idle_request(window, active);
        }
        self.flip_try_ready(window);
    }

    /// Run the oldest request that was held back by a flip or unflip
    fn flip_try_ready(&mut self, window: WindowId) {
        let ready = self.states.get(&window).and_then(|state| {
            state
                .in_stage(Stage::FlipReady)
                .next()
                .map(|request| request.event_id)
        });
        if let Some(event_id) = ready {
            self.re_execute(window, event_id);
        }
    }

    /// Re-validate flips of `window` after it changed
    pub(super) fn check_flip_window(&mut self, window: WindowId) {
        let Some(state) = self.states.get(&window) else {
            return;
        };
        if state.unflip_event_id.is_some() {
            return;
        }

        let fits = |id: Option<EventId>| {
            id.and_then(|id| state.request(id))
                .is_none_or(|request| self.recheck_flip(request).is_ok())
        };
        if state.flip_pending.is_some() {
            if !fits(state.flip_pending) {
                self.set_abort_flip(window);
            }
        } else if state.flip_active.is_some() && !fits(state.flip_active) {
            debug!("{} no longer fits its flip", window);
            self.unflip(window);
        }

        let Some(state) = self.states.get(&window) else {
            return;
        };
        let lost: Vec<(EventId, FlipReason)> = state
            .requests
            .values()
            .filter(|request| request.is_queued() && request.flip)
            .filter_map(|request| {
                self.recheck_flip(request)
                    .err()
                    .map(|reason| (request.event_id, reason))
            })
            .collect();

        let Some(state) = self.states.get_mut(&window) else {
            return;
        };
        for (event_id, reason) in lost {
            if let Some(request) = state.request_mut(event_id) {
                debug!("{} can no longer flip: {:?}", event_id, reason);
                request.flip = false;
                request.reason = Some(reason);
                if request.sync_flip {
                    request.requeue = true;
                }
            }
        }
    }

    /// Drop all presentation state of `window`, restoring its pixmap first
    pub(super) fn teardown_window(&mut self, window: WindowId) {
        let Some(state) = self.states.get(&window) else {
            return;
        };
        let waiting: Vec<EventId> = state
            .requests
            .values()
            .filter(|request| !matches!(request.stage, Stage::Flip | Stage::Active | Stage::Idle))
            .map(|request| request.event_id)
            .collect();
        for event_id in waiting {
            if self.take_request(window, event_id).is_some() {
                trace!("Dropped {} of {}", event_id, window);
            }
        }

        // the backend cannot take back an issued flip, let it land unobserved
        if let Some(pending) = self.states.get(&window).and_then(|state| state.flip_pending) {
            self.set_abort_flip(window);
            if let Some(state) = self.states.get_mut(&window) {
                state.flip_pending = None;
                if let Some(request) = state.requests.shift_remove(&pending) {
                    self.event_index.remove(&pending);
                    self.orphans.insert(pending, request);
                }
            }
        }
        self.restore_window_pixmap(window);

        let Some(state) = self.states.remove(&window) else {
            return;
        };
        if let Some(event_id) = state.unflip_event_id {
            self.unflip_index.remove(&event_id);
        }
        for event_id in state.requests.keys() {
            self.event_index.remove(event_id);
        }
        trace!("Dropped {} retired flips of {}", state.requests.len(), window);
    }
}
