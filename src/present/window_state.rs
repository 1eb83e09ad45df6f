// SPDX-License-Identifier: GPL-3.0-only

use super::request::{EventId, Stage, VblankRequest};
use crate::window::{CrtcId, Pixmap, WindowId};
use indexmap::IndexMap;

/// Which CRTC a window was last resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrtcAssignment {
    NeverSet,
    Assigned(Option<CrtcId>),
}

/// Presentation state of one window.
///
/// Requests live in a single arena in submission order; which queue a request
/// belongs to is its [`Stage`]. The flip slots hold event ids into the arena.
#[derive(Debug)]
pub struct WindowPresent {
    pub window: WindowId,
    pub crtc: CrtcAssignment,
    /// Added to window-relative MSCs to get CRTC MSCs
    pub msc_offset: u64,
    /// Last CRTC MSC observed for this window
    pub msc: u64,
    pub requests: IndexMap<EventId, VblankRequest>,
    pub flip_pending: Option<EventId>,
    pub flip_active: Option<EventId>,
    /// Original window pixmap, set aside while a flip is shown
    pub restore_pixmap: Option<Pixmap>,
    pub unflip_event_id: Option<EventId>,
}

impl WindowPresent {
    pub fn new(window: WindowId) -> Self {
        Self {
            window,
            crtc: CrtcAssignment::NeverSet,
            msc_offset: 0,
            msc: 0,
            requests: IndexMap::new(),
            flip_pending: None,
            flip_active: None,
            restore_pixmap: None,
            unflip_event_id: None,
        }
    }

    /// Translate a window-relative MSC to the clock of `crtc`.
    ///
    /// When the window moved to another CRTC since the last call, the offset
    /// absorbs the jump between the two counters so the window-relative
    /// sequence keeps increasing.
    pub fn window_to_crtc_msc(&mut self, crtc: Option<CrtcId>, window_msc: u64, new_msc: u64) -> u64 {
        let assignment = CrtcAssignment::Assigned(crtc);
        if self.crtc != assignment {
            match self.crtc {
                CrtcAssignment::NeverSet => self.msc_offset = 0,
                CrtcAssignment::Assigned(_) => {
                    self.msc_offset = self.msc_offset.wrapping_add(new_msc.wrapping_sub(self.msc));
                }
            }
            self.crtc = assignment;
        }
        window_msc.wrapping_add(self.msc_offset)
    }

    pub fn request(&self, event_id: EventId) -> Option<&VblankRequest> {
        self.requests.get(&event_id)
    }

    pub fn request_mut(&mut self, event_id: EventId) -> Option<&mut VblankRequest> {
        self.requests.get_mut(&event_id)
    }

    /// Requests in `stage`, oldest first
    pub fn in_stage(&self, stage: Stage) -> impl Iterator<Item = &VblankRequest> + '_ {
        self.requests.values().filter(move |request| request.stage == stage)
    }

    /// Pixmap of the pending flip, or of the active one
    pub fn flip_pixmap(&self) -> Option<Pixmap> {
        self.flip_pending
            .or(self.flip_active)
            .and_then(|id| self.requests.get(&id))
            .and_then(|request| request.pixmap.clone())
    }

    pub fn is_idle(&self) -> bool {
        self.requests.is_empty() && self.restore_pixmap.is_none() && self.unflip_event_id.is_none()
    }
}
