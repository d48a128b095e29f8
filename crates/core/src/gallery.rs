//! Pure gallery maths shared with the frontend: carousel navigation with a
//! sliding window, thumbnail strip sizing, and keyboard delta mapping.

use serde::{Deserialize, Serialize};

pub const DEFAULT_WINDOW_SIZE: usize = 10;
pub const DEFAULT_PRELOAD_COUNT: usize = 3;

/// Index of the selected image plus the window of thumbnails kept loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CarouselNavigator {
    len: usize,
    current: usize,
    window_start: usize,
    window_size: usize,
    preload_count: usize,
}

impl CarouselNavigator {
    pub fn new(len: usize) -> Self {
        Self::with_window(len, DEFAULT_WINDOW_SIZE, DEFAULT_PRELOAD_COUNT)
    }

    /// `preload_count` is capped below `window_size` so the window always
    /// covers the current index.
    pub fn with_window(len: usize, window_size: usize, preload_count: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            len,
            current: 0,
            window_start: 0,
            window_size,
            preload_count: preload_count.min(window_size - 1),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn window_start(&self) -> usize {
        self.window_start
    }

    /// Half-open range of indices currently in the window.
    pub fn visible_range(&self) -> std::ops::Range<usize> {
        self.window_start..(self.window_start + self.window_size).min(self.len)
    }

    /// Moves by `delta`, wrapping around both ends.
    pub fn navigate_by_delta(&mut self, delta: isize) -> usize {
        if self.len == 0 {
            return 0;
        }
        let len = self.len as isize;
        let next = (self.current as isize + delta).rem_euclid(len);
        self.set_current(next as usize);
        self.current
    }

    /// Jumps to `index`, clamped into `[0, len - 1]`.
    pub fn navigate_to_index(&mut self, index: isize) -> usize {
        if self.len == 0 {
            return 0;
        }
        let clamped = index.clamp(0, self.len as isize - 1) as usize;
        self.set_current(clamped);
        self.current
    }

    /// Selects the thumbnail at `local_index` within the visible window.
    pub fn select_visible(&mut self, local_index: usize) -> Option<usize> {
        let global = self.window_start + local_index;
        if global >= self.visible_range().end {
            return None;
        }
        self.set_current(global);
        Some(global)
    }

    fn set_current(&mut self, index: usize) {
        self.current = index;
        if index < self.window_start {
            self.window_start = index.saturating_sub(self.preload_count);
        } else if index >= self.window_start + self.window_size {
            let tail_start = self.len.saturating_sub(self.window_size);
            let lead_start = (index + self.preload_count + 1).saturating_sub(self.window_size);
            self.window_start = tail_start.min(lead_start);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThumbnailOptions {
    pub min_width: u32,
    pub max_width: u32,
    pub gap: u32,
    pub aspect_ratio: f64,
    pub max_height: u32,
}

impl Default for ThumbnailOptions {
    fn default() -> Self {
        Self {
            min_width: 64,
            max_width: 120,
            gap: 8,
            aspect_ratio: 1.0,
            max_height: 80,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailLayout {
    pub width: u32,
    pub height: u32,
    pub visible_count: u32,
    pub gap: u32,
}

/// Sizes a thumbnail strip for `total` images in a container `container_width` px wide.
pub fn thumbnail_layout(
    container_width: u32,
    total: u32,
    options: &ThumbnailOptions,
) -> ThumbnailLayout {
    let aspect = if options.aspect_ratio > 0.0 {
        options.aspect_ratio
    } else {
        1.0
    };
    let gap = options.gap;
    let height_bound_width = (f64::from(options.max_height) * aspect).floor() as u32;
    let effective_max = height_bound_width.min(options.max_width);

    let span = container_width.saturating_add(gap);
    let max_fit = span / options.min_width.saturating_add(gap).max(1);
    let min_fit = (span / effective_max.saturating_add(gap).max(1)).max(1);

    let visible_count = if total <= min_fit {
        total
    } else {
        max_fit.min(total)
    };

    let width = if visible_count == 0 {
        effective_max
    } else {
        let available = container_width.saturating_sub((visible_count - 1).saturating_mul(gap));
        (available / visible_count)
            .max(options.min_width)
            .min(effective_max)
    };

    let height = ((f64::from(width) / aspect).floor() as u32).min(options.max_height);

    ThumbnailLayout {
        width,
        height,
        visible_count,
        gap,
    }
}

/// Carousel step for a `KeyboardEvent.key` value.
pub fn key_delta(key: &str) -> Option<isize> {
    match key {
        "ArrowLeft" | "ArrowUp" => Some(-1),
        "ArrowRight" | "ArrowDown" => Some(1),
        _ => None,
    }
}
