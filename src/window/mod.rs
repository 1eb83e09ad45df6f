// SPDX-License-Identifier: GPL-3.0-only

//! Narrow interface to the window system the scheduler presents into.
//!
//! The window tree, pixmap storage, drawing and damage tracking live outside
//! this crate; the scheduler only reaches them through [`WindowSystem`].

mod pixmap;

pub use self::pixmap::{Pixmap, PixmapId};

use crate::utils::region::Region;
use smithay::utils::{Logical, Point, Rectangle};
use std::fmt;

/// Identifier of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u32);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Identifier of a display pipeline (output) a window can be scanned out through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrtcId(pub u32);

impl fmt::Display for CrtcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "crtc-{}", self.0)
    }
}

pub trait WindowSystem {
    /// Pixmap currently backing `window`
    fn window_pixmap(&self, window: WindowId) -> Option<Pixmap>;

    /// Make `window` draw into `pixmap`
    fn set_window_pixmap(&mut self, window: WindowId, pixmap: &Pixmap);

    fn children(&self, window: WindowId) -> Vec<WindowId>;

    /// Top-level ancestor of `window` (itself for top-level windows)
    fn toplevel(&self, window: WindowId) -> Option<WindowId>;

    /// Window rectangle in root coordinates, `None` once the window is gone
    fn geometry(&self, window: WindowId) -> Option<Rectangle<i32, Logical>>;

    /// Visible part of `window`, relative to its origin
    fn clip_region(&self, window: WindowId) -> Region;

    /// Blit `src` into `window` at `offset`, clipped to `update` (in pixmap coordinates)
    fn copy_to_window(
        &mut self,
        src: &Pixmap,
        window: WindowId,
        update: Option<&Region>,
        offset: Point<i32, Logical>,
    );

    /// Blit the whole of `src` into `dst`
    fn copy_to_pixmap(&mut self, src: &Pixmap, dst: &Pixmap);

    /// Report `region` (window-relative) as damaged
    fn damage(&mut self, window: WindowId, region: &Region);
}

/// Swap the displayed pixmap of `window` and every descendant still showing
/// the same pixmap as `window` for `pixmap`.
///
/// Nothing happens when `expected` is given and `window` is not currently
/// showing it.
pub fn set_tree_pixmap(
    windows: &mut dyn WindowSystem,
    window: WindowId,
    expected: Option<&Pixmap>,
    pixmap: &Pixmap,
) {
    let Some(old) = windows.window_pixmap(window) else {
        windows.set_window_pixmap(window, pixmap);
        return;
    };
    if expected.is_some_and(|expected| *expected != old) {
        return;
    }
    if old == *pixmap {
        return;
    }

    let mut stack = vec![window];
    while let Some(current) = stack.pop() {
        if windows.window_pixmap(current).as_ref() != Some(&old) {
            continue;
        }
        windows.set_window_pixmap(current, pixmap);
        stack.extend(windows.children(current));
    }
}
