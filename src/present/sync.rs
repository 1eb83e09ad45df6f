// SPDX-License-Identifier: GPL-3.0-only

use std::{cell::Cell, fmt, rc::Rc};

/// Identifier of a synchronization fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(pub u32);

impl fmt::Display for FenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fence-{}", self.0)
    }
}

#[derive(Debug)]
struct FenceInner {
    id: FenceId,
    triggered: Cell<bool>,
}

/// Shared handle to a fence.
///
/// The owner of the underlying sync object triggers it; when that happens
/// for a wait fence the host reports it through
/// [`PresentScreen::fence_triggered`](super::PresentScreen::fence_triggered).
#[derive(Debug, Clone)]
pub struct Fence(Rc<FenceInner>);

impl Fence {
    pub fn new(id: FenceId) -> Self {
        Self(Rc::new(FenceInner {
            id,
            triggered: Cell::new(false),
        }))
    }

    pub fn id(&self) -> FenceId {
        self.0.id
    }

    pub fn is_triggered(&self) -> bool {
        self.0.triggered.get()
    }

    pub fn trigger(&self) {
        self.0.triggered.set(true);
    }

    pub fn reset(&self) {
        self.0.triggered.set(false);
    }
}
