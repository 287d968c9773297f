use moxide_grid::SimpleGrid;

use crate::options::{ModularOptions, TransformInfo};

/// A rectangular array of pixels; carries no color semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    grid: SimpleGrid<i32>,
    hshift: i32,
    vshift: i32,
}

impl Channel {
    pub fn new(width: usize, height: usize) -> Self {
        Self::with_shift(width, height, 0, 0)
    }

    pub fn with_shift(width: usize, height: usize, hshift: i32, vshift: i32) -> Self {
        Self {
            grid: SimpleGrid::new(width, height),
            hshift,
            vshift,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.grid.width()
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.grid.height()
    }

    #[inline]
    pub fn hshift(&self) -> i32 {
        self.hshift
    }

    #[inline]
    pub fn vshift(&self) -> i32 {
        self.vshift
    }

    #[inline]
    pub fn grid(&self) -> &SimpleGrid<i32> {
        &self.grid
    }

    #[inline]
    pub fn grid_mut(&mut self) -> &mut SimpleGrid<i32> {
        &mut self.grid
    }
}

/// An ordered sequence of channels plus the metadata the codec consumes.
///
/// `nb_meta_channels` channels at the front are exempt from the max-size
/// bypass rule during channel iteration. `transform` is carried through the
/// group header but never applied at this layer.
#[derive(Debug, Clone)]
pub struct Image {
    pub channels: Vec<Channel>,
    pub nb_meta_channels: usize,
    pub maxval: i32,
    pub transform: Vec<TransformInfo>,
    pub error: bool,
}

impl Image {
    pub fn new(maxval: i32) -> Self {
        Self {
            channels: Vec::new(),
            nb_meta_channels: 0,
            maxval,
            transform: Vec::new(),
            error: false,
        }
    }

    /// Number of bits needed for `maxval`.
    pub fn bit_depth(&self) -> u32 {
        let mut bit_depth = 1u32;
        let mut maxval = 1i64;
        while maxval < self.maxval as i64 {
            bit_depth += 1;
            maxval = maxval * 2 + 1;
        }
        bit_depth
    }

    /// The ordered list of channels coded in one pass.
    ///
    /// Empty channels are skipped. Once a non-meta channel exceeds
    /// `max_chan_size` in either dimension, iteration *stops*: later channels
    /// are not coded at all. Encoder and decoder must agree on this list
    /// exactly, so both call this one function.
    pub fn coded_channel_ids(&self, options: &ModularOptions) -> Vec<usize> {
        let mut ids = Vec::new();
        for (i, channel) in self.channels.iter().enumerate().skip(options.skipchannels) {
            if channel.width() == 0 || channel.height() == 0 {
                continue;
            }
            if i >= self.nb_meta_channels
                && (channel.width() > options.max_chan_size as usize
                    || channel.height() > options.max_chan_size as usize)
            {
                break;
            }
            ids.push(i);
        }
        ids
    }
}
