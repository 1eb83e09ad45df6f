// SPDX-License-Identifier: GPL-3.0-only

//! Rectangle-list regions in window-relative logical coordinates.
//!
//! Only the handful of operations presentation needs (intersection,
//! translation, extents) are provided; the rectangles of a region never
//! overlap as long as the inputs did not.

use smithay::utils::{Logical, Point, Rectangle, Size};

/// A set of non-overlapping rectangles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rectangle<i32, Logical>>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    /// A region covering exactly one rectangle
    pub fn from_rect(rect: Rectangle<i32, Logical>) -> Self {
        let mut region = Self::new();
        region.push(rect);
        region
    }

    /// A region covering `size` at the origin
    pub fn from_size(size: Size<i32, Logical>) -> Self {
        Self::from_rect(Rectangle::new(Point::from((0, 0)), size))
    }

    pub fn from_rects(rects: impl IntoIterator<Item = Rectangle<i32, Logical>>) -> Self {
        let mut region = Self::new();
        for rect in rects {
            region.push(rect);
        }
        region
    }

    fn push(&mut self, rect: Rectangle<i32, Logical>) {
        // empty rectangles carry no area
        if rect.size.w > 0 && rect.size.h > 0 {
            self.rects.push(rect);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rectangle<i32, Logical>] {
        &self.rects
    }

    /// Bounding box of all rectangles
    pub fn extents(&self) -> Option<Rectangle<i32, Logical>> {
        let mut rects = self.rects.iter().copied();
        let first = rects.next()?;
        Some(rects.fold(first, |acc, rect| acc.merge(rect)))
    }

    pub fn intersect(&self, other: &Region) -> Region {
        Region::from_rects(
            self.rects
                .iter()
                .flat_map(|a| other.rects.iter().filter_map(move |b| a.intersection(*b))),
        )
    }

    /// Move every rectangle by `delta`
    pub fn translate(&self, delta: Point<i32, Logical>) -> Region {
        Region {
            rects: self
                .rects
                .iter()
                .map(|rect| Rectangle::new(rect.loc + delta, rect.size))
                .collect(),
        }
    }
}

impl From<Rectangle<i32, Logical>> for Region {
    fn from(rect: Rectangle<i32, Logical>) -> Self {
        Self::from_rect(rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32, Logical> {
        Rectangle::new(Point::from((x, y)), Size::from((w, h)))
    }

    #[test]
    fn intersect_clips_to_overlap() {
        let a = Region::from_rect(rect(0, 0, 100, 100));
        let b = Region::from_rects([rect(50, 50, 100, 100), rect(200, 200, 10, 10)]);
        let result = a.intersect(&b);
        assert_eq!(result.rects(), &[rect(50, 50, 50, 50)]);
    }

    #[test]
    fn disjoint_regions_intersect_to_empty() {
        let a = Region::from_rect(rect(0, 0, 10, 10));
        let b = Region::from_rect(rect(20, 20, 10, 10));
        assert!(a.intersect(&b).is_empty());
    }

    #[test]
    fn extents_cover_all_rects() {
        let region = Region::from_rects([rect(0, 0, 10, 10), rect(30, 40, 10, 10)]);
        assert_eq!(region.extents(), Some(rect(0, 0, 40, 50)));
        assert_eq!(Region::new().extents(), None);
    }

    #[test]
    fn translate_moves_every_rect() {
        let region = Region::from_rects([rect(0, 0, 10, 10), rect(20, 0, 5, 5)]);
        let moved = region.translate(Point::from((5, -5)));
        assert_eq!(moved.rects(), &[rect(5, -5, 10, 10), rect(25, -5, 5, 5)]);
    }

    #[test]
    fn empty_rects_are_dropped() {
        let region = Region::from_rects([rect(0, 0, 0, 10), rect(0, 0, 10, 10)]);
        assert_eq!(region.rects().len(), 1);
    }
}
