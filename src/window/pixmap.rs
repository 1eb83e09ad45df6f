// SPDX-License-Identifier: GPL-3.0-only

use smithay::utils::{Logical, Size};
use std::{fmt, rc::Rc};

/// Identifier of a pixmap as known to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PixmapId(pub u32);

impl fmt::Display for PixmapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[derive(Debug)]
struct PixmapInner {
    id: PixmapId,
    size: Size<i32, Logical>,
    depth: u8,
}

/// Reference-counted handle to a pixmap.
///
/// Every clone is one reference. The pixel storage itself belongs to the
/// window system; this handle only keeps it alive.
#[derive(Debug, Clone)]
pub struct Pixmap(Rc<PixmapInner>);

impl Pixmap {
    pub fn new(id: PixmapId, size: Size<i32, Logical>, depth: u8) -> Self {
        Self(Rc::new(PixmapInner { id, size, depth }))
    }

    pub fn id(&self) -> PixmapId {
        self.0.id
    }

    pub fn size(&self) -> Size<i32, Logical> {
        self.0.size
    }

    pub fn depth(&self) -> u8 {
        self.0.depth
    }

    /// Number of live handles to this pixmap
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl PartialEq for Pixmap {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Pixmap {}
