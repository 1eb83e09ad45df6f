// SPDX-License-Identifier: GPL-3.0-only

//! In-memory collaborators: a window tree, a scanout device and a manual
//! timer. The simulation session and the tests drive the scheduler through
//! these instead of a real X server and display device.

mod compositor;

pub use self::compositor::LoopbackCompositor;

use crate::{
    backend::{
        bridge::FallbackTimer,
        direct::{Scanout, ScanoutError},
    },
    utils::region::Region,
    window::{CrtcId, Pixmap, PixmapId, WindowId, WindowSystem},
};
use indexmap::IndexMap;
use smithay::utils::{Logical, Point, Rectangle};
use std::{collections::HashMap, time::Duration};
use tracing::trace;

/// Side effect the scheduler had on the window tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    SetPixmap {
        window: WindowId,
        pixmap: PixmapId,
    },
    CopyToWindow {
        src: PixmapId,
        window: WindowId,
        update: Option<Region>,
        offset: Point<i32, Logical>,
    },
    CopyToPixmap {
        src: PixmapId,
        dst: PixmapId,
    },
    Damage {
        window: WindowId,
        region: Region,
    },
}

#[derive(Debug)]
struct HeadlessWindow {
    parent: Option<WindowId>,
    children: Vec<WindowId>,
    geometry: Rectangle<i32, Logical>,
    pixmap: Option<Pixmap>,
    /// Visible part, the whole window when unset
    clip: Option<Region>,
}

/// Window tree kept entirely in memory, journaling what is done to it
#[derive(Debug, Default)]
pub struct HeadlessWindows {
    windows: IndexMap<WindowId, HeadlessWindow>,
    journal: Vec<Operation>,
}

impl HeadlessWindows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_toplevel(&mut self, window: WindowId, geometry: Rectangle<i32, Logical>, pixmap: Pixmap) {
        self.windows.insert(
            window,
            HeadlessWindow {
                parent: None,
                children: Vec::new(),
                geometry,
                pixmap: Some(pixmap),
                clip: None,
            },
        );
    }

    /// Add `window` below `parent`; it draws into the parent's pixmap
    pub fn add_child(&mut self, parent: WindowId, window: WindowId, geometry: Rectangle<i32, Logical>) {
        let Some(parent_state) = self.windows.get_mut(&parent) else {
            return;
        };
        parent_state.children.push(window);
        let pixmap = parent_state.pixmap.clone();
        self.windows.insert(
            window,
            HeadlessWindow {
                parent: Some(parent),
                children: Vec::new(),
                geometry,
                pixmap,
                clip: None,
            },
        );
    }

    pub fn configure(&mut self, window: WindowId, geometry: Rectangle<i32, Logical>) {
        if let Some(state) = self.windows.get_mut(&window) {
            state.geometry = geometry;
        }
    }

    pub fn set_clip(&mut self, window: WindowId, clip: Option<Region>) {
        if let Some(state) = self.windows.get_mut(&window) {
            state.clip = clip;
        }
    }

    /// Remove `window` and everything below it
    pub fn destroy(&mut self, window: WindowId) {
        let Some(state) = self.windows.shift_remove(&window) else {
            return;
        };
        if let Some(parent) = state.parent.and_then(|parent| self.windows.get_mut(&parent)) {
            parent.children.retain(|child| *child != window);
        }
        for child in state.children {
            self.destroy(child);
        }
    }

    pub fn contains(&self, window: WindowId) -> bool {
        self.windows.contains_key(&window)
    }

    pub fn journal(&self) -> &[Operation] {
        &self.journal
    }

    pub fn take_journal(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.journal)
    }
}

impl WindowSystem for HeadlessWindows {
    fn window_pixmap(&self, window: WindowId) -> Option<Pixmap> {
        self.windows.get(&window).and_then(|state| state.pixmap.clone())
    }

    fn set_window_pixmap(&mut self, window: WindowId, pixmap: &Pixmap) {
        if let Some(state) = self.windows.get_mut(&window) {
            state.pixmap = Some(pixmap.clone());
            self.journal.push(Operation::SetPixmap {
                window,
                pixmap: pixmap.id(),
            });
        }
    }

    fn children(&self, window: WindowId) -> Vec<WindowId> {
        self.windows
            .get(&window)
            .map(|state| state.children.clone())
            .unwrap_or_default()
    }

    fn toplevel(&self, window: WindowId) -> Option<WindowId> {
        let mut current = window;
        loop {
            match self.windows.get(&current)?.parent {
                Some(parent) => current = parent,
                None => return Some(current),
            }
        }
    }

    fn geometry(&self, window: WindowId) -> Option<Rectangle<i32, Logical>> {
        self.windows.get(&window).map(|state| state.geometry)
    }

    fn clip_region(&self, window: WindowId) -> Region {
        self.windows
            .get(&window)
            .map(|state| {
                state
                    .clip
                    .clone()
                    .unwrap_or_else(|| Region::from_size(state.geometry.size))
            })
            .unwrap_or_default()
    }

    fn copy_to_window(
        &mut self,
        src: &Pixmap,
        window: WindowId,
        update: Option<&Region>,
        offset: Point<i32, Logical>,
    ) {
        self.journal.push(Operation::CopyToWindow {
            src: src.id(),
            window,
            update: update.cloned(),
            offset,
        });
    }

    fn copy_to_pixmap(&mut self, src: &Pixmap, dst: &Pixmap) {
        self.journal.push(Operation::CopyToPixmap {
            src: src.id(),
            dst: dst.id(),
        });
    }

    fn damage(&mut self, window: WindowId, region: &Region) {
        self.journal.push(Operation::Damage {
            window,
            region: region.clone(),
        });
    }
}

/// Scanout device that accepts every flip unless told to refuse
#[derive(Debug, Default)]
pub struct HeadlessScanout {
    refuse: bool,
    scanout: HashMap<CrtcId, PixmapId>,
    flips: Vec<(CrtcId, PixmapId, bool)>,
}

impl HeadlessScanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_refuse(&mut self, refuse: bool) {
        self.refuse = refuse;
    }

    /// Pixmap scanned out on `crtc`, `None` for the primary framebuffer
    pub fn scanout(&self, crtc: CrtcId) -> Option<PixmapId> {
        self.scanout.get(&crtc).copied()
    }

    pub fn flips(&self) -> &[(CrtcId, PixmapId, bool)] {
        &self.flips
    }
}

impl Scanout for HeadlessScanout {
    fn page_flip(&mut self, crtc: CrtcId, pixmap: &Pixmap, sync: bool) -> Result<(), ScanoutError> {
        if self.refuse {
            return Err(ScanoutError::Busy(crtc));
        }
        self.flips.push((crtc, pixmap.id(), sync));
        self.scanout.insert(crtc, pixmap.id());
        Ok(())
    }

    fn restore_primary(&mut self, crtc: CrtcId) {
        self.scanout.remove(&crtc);
    }
}

/// Fallback timer that only records what it was asked to do
#[derive(Debug, Default)]
pub struct ManualTimer {
    armed: HashMap<WindowId, Duration>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed(&self, toplevel: WindowId) -> Option<Duration> {
        self.armed.get(&toplevel).copied()
    }
}

impl FallbackTimer for ManualTimer {
    fn arm(&mut self, toplevel: WindowId, after: Duration) {
        trace!("Manual timer for {} armed for {:?}", toplevel, after);
        self.armed.insert(toplevel, after);
    }

    fn disarm(&mut self, toplevel: WindowId) {
        self.armed.remove(&toplevel);
    }

    fn fired(&mut self, toplevel: WindowId) {
        self.armed.remove(&toplevel);
    }
}
