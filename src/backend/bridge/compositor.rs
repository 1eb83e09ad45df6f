// SPDX-License-Identifier: GPL-3.0-only

use crate::window::{Pixmap, WindowId};
use smithay::utils::{Logical, Point, Rectangle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubsurfaceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// The compositor connection the bridge drives.
///
/// Frame-done and buffer-release callbacks are delivered back through
/// [`CompositorBridge::on_frame_done`](super::CompositorBridge::on_frame_done)
/// and [`CompositorBridge::on_buffer_release`](super::CompositorBridge::on_buffer_release),
/// identified by the `owner` token handed in here.
pub trait Compositor {
    /// Main surface of a top-level window, if it is mapped on the compositor
    fn toplevel_surface(&self, toplevel: WindowId) -> Option<SurfaceId>;

    fn create_surface(&mut self) -> SurfaceId;

    /// Desynchronized sub-surface of `parent` that takes no input
    fn create_subsurface(&mut self, surface: SurfaceId, parent: SurfaceId) -> SubsurfaceId;

    fn set_subsurface_position(&mut self, subsurface: SubsurfaceId, position: Point<i32, Logical>);

    fn destroy_subsurface(&mut self, subsurface: SubsurfaceId);

    fn destroy_surface(&mut self, surface: SurfaceId);

    /// Compositor buffer wrapping `pixmap`; its release is reported with `owner`
    fn buffer_for_pixmap(&mut self, pixmap: &Pixmap, owner: WindowId) -> BufferId;

    fn attach(&mut self, surface: SurfaceId, buffer: BufferId);

    fn damage(&mut self, surface: SurfaceId, rect: Rectangle<i32, Logical>);

    /// Ask for a frame-done callback on the next commit of `surface`
    fn request_frame(&mut self, surface: SurfaceId, owner: WindowId);

    fn commit(&mut self, surface: SurfaceId);

    fn flush(&mut self);
}
