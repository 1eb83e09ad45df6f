// SPDX-License-Identifier: GPL-3.0-only

//! Backend for display devices that scan buffers out directly and deliver
//! real vblank events.

use super::{BackendError, BackendEvent, FlipReason, PresentBackend, PresentCapabilities};
use crate::{
    present::{EventId, UstMsc, msc_is_equal_or_after},
    window::{CrtcId, Pixmap, PixmapId, WindowId, WindowSystem},
};
use indexmap::IndexMap;
use smithay::utils::{Logical, Rectangle};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum ScanoutError {
    #[error("{0} is busy")]
    Busy(CrtcId),
    #[error("failed to import pixmap {0} as framebuffer")]
    Import(PixmapId),
}

/// Display device programming
pub trait Scanout {
    /// Queue `pixmap` for scanout on `crtc`; `sync` waits for vblank
    fn page_flip(&mut self, crtc: CrtcId, pixmap: &Pixmap, sync: bool) -> Result<(), ScanoutError>;

    /// Go back to scanning out the primary framebuffer
    fn restore_primary(&mut self, crtc: CrtcId);
}

#[derive(Debug)]
struct PendingFlip {
    event_id: EventId,
    window: WindowId,
    pixmap: PixmapId,
    /// Owning window went away while the flip was in flight
    orphaned: bool,
}

#[derive(Debug)]
struct DirectCrtc {
    geometry: Rectangle<i32, Logical>,
    depth: u8,
    active: bool,
    clock: UstMsc,
    vblank_events: Vec<(EventId, u64)>,
    pending_flip: Option<PendingFlip>,
    pending_unflip: Option<EventId>,
    /// Window whose pixmap is currently scanned out
    scanout: Option<(WindowId, PixmapId)>,
}

impl DirectCrtc {
    fn owned_by(&self, window: WindowId) -> bool {
        self.scanout.is_some_and(|(owner, _)| owner == window)
            || self.pending_flip.as_ref().is_some_and(|flip| flip.window == window)
    }
}

pub struct DirectBackend<S: Scanout> {
    device: S,
    crtcs: IndexMap<CrtcId, DirectCrtc>,
    events: Vec<BackendEvent>,
}

impl<S: Scanout> std::fmt::Debug for DirectBackend<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectBackend")
            .field("crtcs", &self.crtcs.keys().collect::<Vec<_>>())
            .field("events", &self.events)
            .finish()
    }
}

impl<S: Scanout> DirectBackend<S> {
    pub fn new(device: S) -> Self {
        Self {
            device,
            crtcs: IndexMap::new(),
            events: Vec::new(),
        }
    }

    pub fn device(&self) -> &S {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut S {
        &mut self.device
    }

    /// Register a display pipeline showing `geometry` with a primary plane of `depth`
    pub fn add_crtc(&mut self, crtc: CrtcId, geometry: Rectangle<i32, Logical>, depth: u8) {
        debug!("Adding {} at {:?}", crtc, geometry);
        self.crtcs.insert(
            crtc,
            DirectCrtc {
                geometry,
                depth,
                active: true,
                clock: UstMsc::default(),
                vblank_events: Vec::new(),
                pending_flip: None,
                pending_unflip: None,
                scanout: None,
            },
        );
    }

    /// Forget `crtc`; anything still waiting on it will never fire
    pub fn remove_crtc(&mut self, crtc: CrtcId) {
        if let Some(state) = self.crtcs.shift_remove(&crtc) {
            debug!(
                "Removed {} with {} queued vblank events",
                crtc,
                state.vblank_events.len()
            );
        }
    }

    pub fn set_active(&mut self, crtc: CrtcId, active: bool) {
        if let Some(state) = self.crtcs.get_mut(&crtc) {
            state.active = active;
        }
    }

    /// Handle a vblank reported by the device
    pub fn on_vblank(&mut self, crtc: CrtcId, ust: u64, msc: u64) {
        let Some(state) = self.crtcs.get_mut(&crtc) else {
            warn!("VBlank for unknown {}", crtc);
            return;
        };
        state.clock = UstMsc::new(ust, msc);
        trace!("VBlank on {}: msc {}", crtc, msc);

        if let Some(flip) = state.pending_flip.take() {
            if flip.orphaned {
                self.device.restore_primary(crtc);
            } else {
                state.scanout = Some((flip.window, flip.pixmap));
            }
            self.events.push(BackendEvent::new(flip.event_id, state.clock));
        }

        if let Some(event_id) = state.pending_unflip.take() {
            self.events.push(BackendEvent::new(event_id, state.clock));
        }

        let clock = state.clock;
        let events = &mut self.events;
        state.vblank_events.retain(|&(event_id, target)| {
            if msc_is_equal_or_after(clock.msc, target) {
                events.push(BackendEvent::new(event_id, clock));
                false
            } else {
                true
            }
        });
    }

    fn active_crtc(&self, crtc: Option<CrtcId>, window: WindowId) -> Result<(CrtcId, &DirectCrtc), BackendError> {
        let crtc = crtc.ok_or(BackendError::NoCrtc(window))?;
        match self.crtcs.get(&crtc) {
            Some(state) if state.active => Ok((crtc, state)),
            _ => Err(BackendError::CrtcInactive(crtc)),
        }
    }
}

fn coverage(a: Rectangle<i32, Logical>, b: Rectangle<i32, Logical>) -> i64 {
    a.intersection(b)
        .map(|rect| rect.size.w as i64 * rect.size.h as i64)
        .unwrap_or(0)
}

impl<S: Scanout> PresentBackend for DirectBackend<S> {
    fn capabilities(&self) -> PresentCapabilities {
        PresentCapabilities::ASYNC | PresentCapabilities::UST
    }

    fn get_crtc(&mut self, windows: &dyn WindowSystem, window: WindowId) -> Option<CrtcId> {
        let geometry = windows.geometry(window)?;
        self.crtcs
            .iter()
            .filter(|(_, state)| state.active)
            .map(|(crtc, state)| (*crtc, coverage(state.geometry, geometry)))
            .filter(|(_, area)| *area > 0)
            .max_by_key(|(_, area)| *area)
            .map(|(crtc, _)| crtc)
    }

    fn get_ust_msc(
        &mut self,
        _windows: &dyn WindowSystem,
        window: WindowId,
        crtc: Option<CrtcId>,
    ) -> Result<UstMsc, BackendError> {
        self.active_crtc(crtc, window).map(|(_, state)| state.clock)
    }

    fn queue_vblank(
        &mut self,
        _windows: &dyn WindowSystem,
        window: WindowId,
        crtc: Option<CrtcId>,
        event_id: EventId,
        msc: u64,
    ) -> Result<(), BackendError> {
        let (crtc, _) = self.active_crtc(crtc, window)?;
        if let Some(state) = self.crtcs.get_mut(&crtc) {
            state.vblank_events.push((event_id, msc));
        }
        Ok(())
    }

    fn abort_vblank(
        &mut self,
        _windows: &dyn WindowSystem,
        _window: WindowId,
        crtc: Option<CrtcId>,
        event_id: EventId,
        _msc: u64,
    ) {
        let Some(state) = crtc.and_then(|crtc| self.crtcs.get_mut(&crtc)) else {
            return;
        };
        state.vblank_events.retain(|(id, _)| *id != event_id);
    }

    fn check_flip(
        &self,
        windows: &dyn WindowSystem,
        crtc: Option<CrtcId>,
        window: WindowId,
        pixmap: &Pixmap,
        _sync_flip: bool,
    ) -> Result<(), FlipReason> {
        let (_, state) = self.active_crtc(crtc, window).map_err(|_| FlipReason::NoCrtc)?;
        let geometry = windows.geometry(window).ok_or(FlipReason::NoCrtc)?;
        if geometry != state.geometry || pixmap.size() != state.geometry.size {
            return Err(FlipReason::Geometry);
        }
        if pixmap.depth() != state.depth {
            return Err(FlipReason::BufferFormat);
        }
        Ok(())
    }

    fn flip(
        &mut self,
        _windows: &dyn WindowSystem,
        window: WindowId,
        crtc: Option<CrtcId>,
        event_id: EventId,
        _target_msc: u64,
        pixmap: &Pixmap,
        sync_flip: bool,
    ) -> Result<(), BackendError> {
        let (crtc, state) = self.active_crtc(crtc, window)?;
        if state.pending_flip.is_some() {
            return Err(BackendError::FlipPending(crtc));
        }
        self.device.page_flip(crtc, pixmap, sync_flip)?;

        let Some(state) = self.crtcs.get_mut(&crtc) else {
            return Err(BackendError::CrtcInactive(crtc));
        };
        if sync_flip {
            state.pending_flip = Some(PendingFlip {
                event_id,
                window,
                pixmap: pixmap.id(),
                orphaned: false,
            });
        } else {
            // async flips land right away
            state.scanout = Some((window, pixmap.id()));
            self.events.push(BackendEvent::new(event_id, state.clock));
        }
        Ok(())
    }

    fn unflip(&mut self, _windows: &dyn WindowSystem, window: WindowId, event_id: EventId) {
        let target = self
            .crtcs
            .iter_mut()
            .find(|(_, state)| state.owned_by(window));

        match target {
            Some((crtc, state)) => {
                debug!("Unflipping {} on {}", window, crtc);
                self.device.restore_primary(*crtc);
                state.scanout = None;
                if state.active {
                    state.pending_unflip = Some(event_id);
                } else {
                    self.events.push(BackendEvent::new(event_id, state.clock));
                }
            }
            None => self.events.push(BackendEvent::new(event_id, UstMsc::default())),
        }
    }

    fn window_destroyed(&mut self, window: WindowId) {
        for (crtc, state) in self.crtcs.iter_mut() {
            if state.scanout.is_some_and(|(owner, _)| owner == window) {
                self.device.restore_primary(*crtc);
                state.scanout = None;
            }
            if let Some(flip) = state.pending_flip.as_mut().filter(|flip| flip.window == window) {
                flip.orphaned = true;
            }
        }
    }

    fn take_events(&mut self) -> Vec<BackendEvent> {
        std::mem::take(&mut self.events)
    }
}
