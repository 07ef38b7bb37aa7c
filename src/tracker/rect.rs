/// Axis-aligned box in pixel coordinates, stored as top-left corner plus size.
///
/// Local trackers report corners (x1, y1, x2, y2); `from_tlbr` converts.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    #[inline]
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    #[inline]
    pub fn from_tlbr(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    #[inline]
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    #[inline]
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    #[inline]
    pub fn to_tlbr(&self) -> [f32; 4] {
        [self.x, self.y, self.right(), self.bottom()]
    }

    #[inline]
    pub fn to_tlwh(&self) -> [f32; 4] {
        [self.x, self.y, self.width, self.height]
    }

    /// Bottom-midpoint, the ground-plane position of a standing object.
    #[inline]
    pub fn feet_point(&self) -> (f32, f32) {
        (self.x + self.width * 0.5, self.bottom())
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    fn shared_area(&self, other: &Rect) -> f32 {
        let w = self.right().min(other.right()) - self.x.max(other.x);
        let h = self.bottom().min(other.bottom()) - self.y.max(other.y);
        w.max(0.0) * h.max(0.0)
    }

    /// Fraction of this box covered by `other`. Asymmetric: a small box
    /// inside a large one scores 1.0, the large one much less.
    pub fn overlap_ratio(&self, other: &Rect) -> f32 {
        let own = self.area();
        if own <= 0.0 {
            return 0.0;
        }
        self.shared_area(other) / own
    }
}

/// Per box, the largest fraction of it covered by any other box of the same frame.
pub fn max_overlap_ratios(boxes: &[Rect]) -> Vec<f32> {
    (0..boxes.len())
        .map(|i| {
            boxes
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, other)| boxes[i].overlap_ratio(other))
                .fold(0.0, f32::max)
        })
        .collect()
}
