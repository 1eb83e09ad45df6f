// SPDX-License-Identifier: GPL-3.0-only

//! Contract between the scheduler and whatever actually puts pixels on screen.
//!
//! Two implementations exist: [`direct::DirectBackend`] scans buffers out on a
//! display device with real vblank events, and
//! [`bridge::CompositorBridge`] hands them to a compositor that has no
//! vblank signal and emulates one.

pub mod bridge;
pub mod direct;

use crate::{
    present::{EventId, UstMsc},
    utils::region::Region,
    window::{CrtcId, Pixmap, WindowId, WindowSystem},
};
use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PresentCapabilities: u32 {
        /// Flips may be performed outside of vblank
        const ASYNC = 1 << 0;
        const FENCE = 1 << 1;
        const UST = 1 << 2;
    }
}

/// Why a pixmap cannot be flipped onto a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipReason {
    /// Window is not on any output, or not on the requested one
    NoCrtc,
    /// Window or pixmap does not match the scanout geometry
    Geometry,
    /// Pixmap format cannot be scanned out
    BufferFormat,
    /// Another window sharing the scanout target is flipping
    Busy,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("window {0} has no display target")]
    NoCrtc(WindowId),
    #[error("{0} has no active clock")]
    CrtcInactive(CrtcId),
    #[error("flip already pending on {0}")]
    FlipPending(CrtcId),
    #[error(transparent)]
    Scanout(#[from] direct::ScanoutError),
}

/// Asynchronous confirmation of a queued vblank, flip, release or unflip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendEvent {
    pub event_id: EventId,
    pub ust: u64,
    pub msc: u64,
}

impl BackendEvent {
    pub fn new(event_id: EventId, UstMsc { ust, msc }: UstMsc) -> Self {
        Self { event_id, ust, msc }
    }
}

/// Operations a presentation backend provides.
///
/// Completions are never delivered from inside these calls. A backend queues
/// a [`BackendEvent`] and the scheduler collects it through
/// [`PresentBackend::take_events`] once the current transition is finished.
pub trait PresentBackend {
    fn capabilities(&self) -> PresentCapabilities;

    /// Superseded flips stay busy until the backend reports their buffer
    /// released with an event for the flip's id
    fn reports_release(&self) -> bool {
        false
    }

    /// Display target `window` is currently shown on
    fn get_crtc(&mut self, windows: &dyn WindowSystem, window: WindowId) -> Option<CrtcId>;

    /// Current clock for `window`; fails if no clock is running for it
    fn get_ust_msc(
        &mut self,
        windows: &dyn WindowSystem,
        window: WindowId,
        crtc: Option<CrtcId>,
    ) -> Result<UstMsc, BackendError>;

    /// Report `event_id` at or after `msc`
    fn queue_vblank(
        &mut self,
        windows: &dyn WindowSystem,
        window: WindowId,
        crtc: Option<CrtcId>,
        event_id: EventId,
        msc: u64,
    ) -> Result<(), BackendError>;

    /// Forget a queued vblank; no-op if it already fired
    fn abort_vblank(
        &mut self,
        windows: &dyn WindowSystem,
        window: WindowId,
        crtc: Option<CrtcId>,
        event_id: EventId,
        msc: u64,
    );

    /// Whether `pixmap` could be flipped onto `window`. Has no side effects.
    fn check_flip(
        &self,
        windows: &dyn WindowSystem,
        crtc: Option<CrtcId>,
        window: WindowId,
        pixmap: &Pixmap,
        sync_flip: bool,
    ) -> Result<(), FlipReason>;

    /// Start a flip; confirmation arrives as an event for `event_id`
    #[allow(clippy::too_many_arguments)]
    fn flip(
        &mut self,
        windows: &dyn WindowSystem,
        window: WindowId,
        crtc: Option<CrtcId>,
        event_id: EventId,
        target_msc: u64,
        pixmap: &Pixmap,
        sync_flip: bool,
    ) -> Result<(), BackendError>;

    /// The scheduler committed to the flip `event_id`; `damage` is window-relative
    fn flip_executed(
        &mut self,
        _windows: &dyn WindowSystem,
        _window: WindowId,
        _crtc: Option<CrtcId>,
        _event_id: EventId,
        _damage: &Region,
    ) {
    }

    /// Go back to the window's own buffer; confirmation arrives as an event for `event_id`
    fn unflip(&mut self, windows: &dyn WindowSystem, window: WindowId, event_id: EventId);

    /// Push buffered drawing for `window` out
    fn flush(&mut self, _window: WindowId) {}

    fn window_reconfigured(&mut self, _windows: &dyn WindowSystem, _window: WindowId) {}

    /// `window` is about to be destroyed
    fn window_destroyed(&mut self, _window: WindowId) {}

    /// Drain queued confirmations
    fn take_events(&mut self) -> Vec<BackendEvent>;
}
