use moxide_grid::SimpleGrid;

use crate::image::Image;
use crate::predictor::Neighborhood;
use crate::{EXTRA_PROPS_PER_CHANNEL, NUM_NONREF_PROPERTIES};

/// Per-pixel property vector, indexed by property id.
///
/// Layout: 0 channel index, 1 group id (static), 2 y, 3 x, 4 |N|, 5 |W|,
/// 6 N, 7 W, 8 W minus previous gradient, 9 W+N-NW, 10 W-NW, 11 NW-N,
/// 12 N-NE, 13 N-NN, 14 W-WW, 15 WP max-error, then four values per
/// reference channel, most recently coded channel first.
#[derive(Debug, Clone)]
pub struct Properties {
    values: Vec<i32>,
}

impl Properties {
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![0; len.max(NUM_NONREF_PROPERTIES)],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Properties past the end of the vector read as zero, so a tree that
    /// references more channels than the image has stays decodable.
    #[inline]
    pub fn get(&self, property: usize) -> i32 {
        self.values.get(property).copied().unwrap_or(0)
    }

    #[inline]
    pub fn set(&mut self, property: usize, value: i32) {
        if let Some(slot) = self.values.get_mut(property) {
            *slot = value;
        }
    }

    /// Copies reference-channel properties into the tail of the vector.
    #[inline]
    pub fn set_refs(&mut self, refs: &[i32]) {
        let tail = &mut self.values[NUM_NONREF_PROPERTIES..];
        let n = tail.len().min(refs.len());
        tail[..n].copy_from_slice(&refs[..n]);
    }
}

#[inline]
fn clamp_i32(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Sets the row-invariant property slots.
pub fn init_props_row(props: &mut Properties, static_props: [i32; 2], y: usize) {
    props.set(0, static_props[0]);
    props.set(1, static_props[1]);
    props.set(2, y as i32);
}

/// Fills the per-pixel gradient properties and returns this pixel's gradient,
/// which the caller feeds back as `prev_grad` for the next pixel of the row.
pub fn fill_pixel_props(
    props: &mut Properties,
    x: usize,
    nb: &Neighborhood,
    prev_grad: i32,
) -> i32 {
    let w = nb.w as i64;
    let n = nb.n as i64;
    let grad = clamp_i32(w + n - nb.nw as i64);

    props.set(3, x as i32);
    props.set(4, nb.n.saturating_abs());
    props.set(5, nb.w.saturating_abs());
    props.set(6, nb.n);
    props.set(7, nb.w);
    props.set(8, clamp_i32(w - prev_grad as i64));
    props.set(9, grad);
    props.set(10, clamp_i32(w - nb.nw as i64));
    props.set(11, clamp_i32(nb.nw as i64 - n));
    props.set(12, clamp_i32(n - nb.ne as i64));
    props.set(13, clamp_i32(n - nb.nn as i64));
    props.set(14, clamp_i32(w - nb.ww as i64));
    grad
}

/// Picks the reference channels for `chan`: previously coded channels with
/// identical dimensions and shifts, most recent first.
pub fn select_reference_channels(image: &Image, chan: usize, max_refs: usize) -> Vec<usize> {
    let target = &image.channels[chan];
    image.channels[..chan]
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, ch)| {
            ch.width() == target.width()
                && ch.height() == target.height()
                && ch.hshift() == target.hshift()
                && ch.vshift() == target.vshift()
        })
        .map(|(i, _)| i)
        .take(max_refs)
        .collect()
}

/// Precomputes reference-channel properties for row `y` into `out`, laid out
/// as `EXTRA_PROPS_PER_CHANNEL` values per reference channel per pixel, so the
/// pixel loop does constant-stride reads.
pub fn precompute_references(
    image: &Image,
    ref_ids: &[usize],
    y: usize,
    width: usize,
    out: &mut Vec<i32>,
) {
    let stride = ref_ids.len() * EXTRA_PROPS_PER_CHANNEL;
    out.clear();
    out.resize(width * stride, 0);

    for (k, &rc) in ref_ids.iter().enumerate() {
        let grid = image.channels[rc].grid();
        for x in 0..width {
            let c = *grid.get(x, y).unwrap();
            let g = clamped_gradient(grid, x, y);
            let slot = &mut out[x * stride + k * EXTRA_PROPS_PER_CHANNEL..];
            slot[0] = c.saturating_abs();
            slot[1] = c;
            slot[2] = clamp_i32((c as i64 - g as i64).abs());
            slot[3] = clamp_i32(c as i64 - g as i64);
        }
    }
}

fn clamped_gradient(grid: &SimpleGrid<i32>, x: usize, y: usize) -> i32 {
    let w = if x > 0 { *grid.get(x - 1, y).unwrap() } else { 0 };
    let n = if y > 0 { *grid.get(x, y - 1).unwrap() } else { w };
    let nw = if x > 0 && y > 0 {
        *grid.get(x - 1, y - 1).unwrap()
    } else {
        w
    };
    let w = w as i64;
    let n = n as i64;
    (w + n - nw as i64).clamp(w.min(n), w.max(n)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_reads_zero() {
        let props = Properties::new(16);
        assert_eq!(props.get(100), 0);
    }

    #[test]
    fn gradient_properties() {
        let nb = Neighborhood {
            w: 10,
            n: 12,
            nw: 9,
            ne: 14,
            nn: 11,
            ww: 8,
            nee: 14,
        };
        let mut props = Properties::new(16);
        let grad = fill_pixel_props(&mut props, 3, &nb, 5);
        assert_eq!(grad, 13);
        assert_eq!(props.get(3), 3);
        assert_eq!(props.get(4), 12);
        assert_eq!(props.get(5), 10);
        assert_eq!(props.get(8), 5);
        assert_eq!(props.get(9), 13);
        assert_eq!(props.get(10), 1);
        assert_eq!(props.get(11), -3);
        assert_eq!(props.get(12), -2);
        assert_eq!(props.get(13), 1);
        assert_eq!(props.get(14), 2);
    }
}
