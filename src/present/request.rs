// SPDX-License-Identifier: GPL-3.0-only

use super::sync::{Fence, FenceId};
use crate::{
    backend::FlipReason,
    utils::region::Region,
    window::{CrtcId, Pixmap, PixmapId, WindowId},
};
use bitflags::bitflags;
use smithay::utils::{Logical, Point};
use std::fmt;

/// Identifier correlating backend events with the request (or unflip) that
/// asked for them. Unique for the lifetime of a screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Client options attached to a presentation request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PresentOptions: u32 {
        /// Do not wait for the next vblank if the target has passed
        const ASYNC = 1 << 0;
        /// Never flip, always copy
        const COPY = 1 << 1;
        /// Target is expressed in UST rather than MSC
        const UST = 1 << 2;
        /// Client wants to hear about suboptimal buffer formats
        const SUBOPTIMAL = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteKind {
    Pixmap,
    NotifyMsc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteMode {
    Copy,
    Flip,
    Skip,
    SuboptimalCopy,
}

/// Additional window that wants to hear about a request's completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentNotify {
    pub window: WindowId,
    pub serial: u32,
}

/// Which queue of its window a request currently sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for the backend to reach the execution MSC
    Vblank,
    /// Waiting for the wait fence
    Fence,
    /// Copied, completion is reported on the next frame
    Exec,
    /// Wants to flip but another flip or an unflip is outstanding
    FlipReady,
    /// Flip requested, waiting for the backend to confirm it
    Flip,
    /// Currently scanned out
    Active,
    /// Superseded, waiting for the backend to release the buffer
    Idle,
}

/// One presentation or notify request.
///
/// Owning a request owns its pixmap reference, regions and fences; dropping
/// it releases all of them.
#[derive(Debug)]
pub struct VblankRequest {
    pub event_id: EventId,
    pub window: WindowId,
    pub serial: u32,
    pub kind: CompleteKind,
    pub pixmap: Option<Pixmap>,
    pub valid: Option<Region>,
    pub update: Option<Region>,
    pub offset: Point<i32, Logical>,
    pub crtc: Option<CrtcId>,
    /// MSC the client asked for, after adjustment
    pub target_msc: u64,
    /// MSC execution is scheduled at (one earlier for sync flips)
    pub exec_msc: u64,
    pub msc_offset: u64,
    pub wait_fence: Option<Fence>,
    pub idle_fence: Option<Fence>,
    pub options: PresentOptions,
    pub notifies: Vec<PresentNotify>,
    pub stage: Stage,
    pub flip: bool,
    pub sync_flip: bool,
    /// Lost flip eligibility after a reconfigure, wait for the real target again
    pub requeue: bool,
    /// Unflip as soon as the pending flip is confirmed
    pub abort_flip: bool,
    /// Client gave up on this request
    pub aborted: bool,
    /// Backend released the buffer before the flip was superseded
    pub released: bool,
    /// Pixels were copied and the idle notification went out
    pub copied: bool,
    pub reason: Option<FlipReason>,
}

impl VblankRequest {
    /// Still waiting to execute, so a newer request may replace it
    pub fn is_queued(&self) -> bool {
        matches!(self.stage, Stage::Vblank | Stage::Fence | Stage::FlipReady)
    }

    /// Mode reported when this request completes without a flip
    pub fn copy_mode(&self) -> CompleteMode {
        match self.kind {
            CompleteKind::NotifyMsc => CompleteMode::Copy,
            CompleteKind::Pixmap if !self.copied => CompleteMode::Skip,
            CompleteKind::Pixmap
                if self.options.contains(PresentOptions::SUBOPTIMAL)
                    && self.reason == Some(FlipReason::BufferFormat) =>
            {
                CompleteMode::SuboptimalCopy
            }
            CompleteKind::Pixmap => CompleteMode::Copy,
        }
    }
}

/// Notification for the client layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentEvent {
    Complete {
        window: WindowId,
        kind: CompleteKind,
        mode: CompleteMode,
        serial: u32,
        ust: u64,
        msc: u64,
    },
    Idle {
        window: WindowId,
        serial: u32,
        pixmap: PixmapId,
        idle_fence: Option<FenceId>,
    },
}
