// SPDX-License-Identifier: GPL-3.0-only

use crate::{
    backend::bridge::{BufferId, Compositor, SubsurfaceId, SurfaceId},
    window::{Pixmap, PixmapId, WindowId},
};
use smithay::utils::{Logical, Point, Rectangle};
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Default)]
struct LoopbackSurface {
    attached: Option<BufferId>,
    committed: Option<BufferId>,
    frame: Option<WindowId>,
    damage: Vec<Rectangle<i32, Logical>>,
}

#[derive(Debug)]
struct LoopbackSubsurface {
    surface: SurfaceId,
    parent: SurfaceId,
    position: Point<i32, Logical>,
}

/// Compositor that applies every commit immediately.
///
/// A committed buffer replaces the previous one, which is then released.
/// Frame callbacks and releases are only recorded; whoever drives the session
/// decides when to report them through the bridge.
#[derive(Debug, Default)]
pub struct LoopbackCompositor {
    next_id: u32,
    toplevels: HashMap<WindowId, SurfaceId>,
    surfaces: HashMap<SurfaceId, LoopbackSurface>,
    subsurfaces: HashMap<SubsurfaceId, LoopbackSubsurface>,
    buffers: HashMap<BufferId, (PixmapId, WindowId)>,
    frame_callbacks: Vec<WindowId>,
    releases: Vec<(WindowId, BufferId)>,
    commits: usize,
    flushes: usize,
}

impl LoopbackCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Give `toplevel` a main surface
    pub fn map_toplevel(&mut self, toplevel: WindowId) -> SurfaceId {
        let surface = SurfaceId(self.next_id());
        self.surfaces.insert(surface, LoopbackSurface::default());
        self.toplevels.insert(toplevel, surface);
        surface
    }

    pub fn unmap_toplevel(&mut self, toplevel: WindowId) {
        if let Some(surface) = self.toplevels.remove(&toplevel) {
            self.destroy_surface(surface);
        }
    }

    fn release(&mut self, buffer: BufferId) {
        if let Some((_, owner)) = self.buffers.get(&buffer) {
            trace!("Releasing {:?} of {}", buffer, owner);
            self.releases.push((*owner, buffer));
        }
    }

    /// Frame callbacks that are due, by owner
    pub fn take_frame_callbacks(&mut self) -> Vec<WindowId> {
        std::mem::take(&mut self.frame_callbacks)
    }

    /// Buffers the compositor stopped using, by owner
    pub fn take_releases(&mut self) -> Vec<(WindowId, BufferId)> {
        std::mem::take(&mut self.releases)
    }

    pub fn committed_pixmap(&self, surface: SurfaceId) -> Option<PixmapId> {
        self.surfaces
            .get(&surface)
            .and_then(|state| state.committed)
            .and_then(|buffer| self.buffers.get(&buffer))
            .map(|(pixmap, _)| *pixmap)
    }

    pub fn surface_damage(&self, surface: SurfaceId) -> &[Rectangle<i32, Logical>] {
        self.surfaces
            .get(&surface)
            .map(|state| state.damage.as_slice())
            .unwrap_or_default()
    }

    pub fn subsurface_position(&self, surface: SurfaceId) -> Option<(SurfaceId, Point<i32, Logical>)> {
        self.subsurfaces
            .values()
            .find(|sub| sub.surface == surface)
            .map(|sub| (sub.parent, sub.position))
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

impl Compositor for LoopbackCompositor {
    fn toplevel_surface(&self, toplevel: WindowId) -> Option<SurfaceId> {
        self.toplevels.get(&toplevel).copied()
    }

    fn create_surface(&mut self) -> SurfaceId {
        let surface = SurfaceId(self.next_id());
        self.surfaces.insert(surface, LoopbackSurface::default());
        surface
    }

    fn create_subsurface(&mut self, surface: SurfaceId, parent: SurfaceId) -> SubsurfaceId {
        let subsurface = SubsurfaceId(self.next_id());
        self.subsurfaces.insert(
            subsurface,
            LoopbackSubsurface {
                surface,
                parent,
                position: Point::from((0, 0)),
            },
        );
        subsurface
    }

    fn set_subsurface_position(&mut self, subsurface: SubsurfaceId, position: Point<i32, Logical>) {
        if let Some(sub) = self.subsurfaces.get_mut(&subsurface) {
            sub.position = position;
        }
    }

    fn destroy_subsurface(&mut self, subsurface: SubsurfaceId) {
        self.subsurfaces.remove(&subsurface);
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        if let Some(state) = self.surfaces.remove(&surface) {
            if let Some(buffer) = state.committed {
                self.release(buffer);
            }
        }
    }

    fn buffer_for_pixmap(&mut self, pixmap: &Pixmap, owner: WindowId) -> BufferId {
        let buffer = BufferId(self.next_id());
        self.buffers.insert(buffer, (pixmap.id(), owner));
        buffer
    }

    fn attach(&mut self, surface: SurfaceId, buffer: BufferId) {
        if let Some(state) = self.surfaces.get_mut(&surface) {
            state.attached = Some(buffer);
        }
    }

    fn damage(&mut self, surface: SurfaceId, rect: Rectangle<i32, Logical>) {
        if let Some(state) = self.surfaces.get_mut(&surface) {
            state.damage.push(rect);
        }
    }

    fn request_frame(&mut self, surface: SurfaceId, owner: WindowId) {
        if let Some(state) = self.surfaces.get_mut(&surface) {
            state.frame = Some(owner);
        }
    }

    fn commit(&mut self, surface: SurfaceId) {
        let Some(state) = self.surfaces.get_mut(&surface) else {
            return;
        };
        self.commits += 1;
        let mut released = None;
        if let Some(buffer) = state.attached.take() {
            released = state.committed.replace(buffer).filter(|old| *old != buffer);
        }
        if let Some(owner) = state.frame.take() {
            self.frame_callbacks.push(owner);
        }
        if let Some(buffer) = released {
            self.release(buffer);
        }
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }
}
