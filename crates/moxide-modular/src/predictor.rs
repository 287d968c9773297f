use moxide_bitstream::{BitWriter, Bitstream, Bundle};
use moxide_grid::SimpleGrid;

use crate::Result;

/// Parameters of the self-correcting (weighted) predictor.
///
/// The defaults match the all-default bitstream encoding, so a header equal
/// to `WpHeader::default()` is written as a single flag bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpHeader {
    pub wp_p1: u32,
    pub wp_p2: u32,
    pub wp_p3a: u32,
    pub wp_p3b: u32,
    pub wp_p3c: u32,
    pub wp_p3d: u32,
    pub wp_p3e: u32,
    pub wp_w0: u32,
    pub wp_w1: u32,
    pub wp_w2: u32,
    pub wp_w3: u32,
}

impl Default for WpHeader {
    fn default() -> Self {
        Self {
            wp_p1: 16,
            wp_p2: 10,
            wp_p3a: 7,
            wp_p3b: 7,
            wp_p3c: 7,
            wp_p3d: 0,
            wp_p3e: 0,
            wp_w0: 13,
            wp_w1: 12,
            wp_w2: 12,
            wp_w3: 12,
        }
    }
}

impl<Ctx> Bundle<Ctx> for WpHeader {
    type Error = crate::Error;

    fn parse(bitstream: &mut Bitstream, _: Ctx) -> Result<Self> {
        if bitstream.read_bool()? {
            return Ok(Self::default());
        }
        Ok(Self {
            wp_p1: bitstream.read_bits(5)?,
            wp_p2: bitstream.read_bits(5)?,
            wp_p3a: bitstream.read_bits(5)?,
            wp_p3b: bitstream.read_bits(5)?,
            wp_p3c: bitstream.read_bits(5)?,
            wp_p3d: bitstream.read_bits(5)?,
            wp_p3e: bitstream.read_bits(5)?,
            wp_w0: bitstream.read_bits(4)?,
            wp_w1: bitstream.read_bits(4)?,
            wp_w2: bitstream.read_bits(4)?,
            wp_w3: bitstream.read_bits(4)?,
        })
    }
}

impl WpHeader {
    pub fn write(&self, writer: &mut BitWriter) {
        let default_wp = *self == Self::default();
        writer.write_bool(default_wp);
        if default_wp {
            return;
        }
        writer.write_bits(self.wp_p1, 5);
        writer.write_bits(self.wp_p2, 5);
        writer.write_bits(self.wp_p3a, 5);
        writer.write_bits(self.wp_p3b, 5);
        writer.write_bits(self.wp_p3c, 5);
        writer.write_bits(self.wp_p3d, 5);
        writer.write_bits(self.wp_p3e, 5);
        writer.write_bits(self.wp_w0, 4);
        writer.write_bits(self.wp_w1, 4);
        writer.write_bits(self.wp_w2, 4);
        writer.write_bits(self.wp_w3, 4);
    }

    /// Preset parameter bundles selectable through `ModularOptions::wp_mode`.
    pub fn from_mode(mode: u32) -> Self {
        match mode {
            1 => Self {
                wp_p1: 20,
                wp_p2: 12,
                ..Self::default()
            },
            2 => Self {
                wp_p3a: 10,
                wp_p3b: 10,
                wp_p3c: 10,
                ..Self::default()
            },
            3 => Self {
                wp_w0: 15,
                wp_w1: 14,
                wp_w2: 14,
                wp_w3: 14,
                ..Self::default()
            },
            _ => Self::default(),
        }
    }
}

/// The closed set of pixel predictors.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
#[repr(u8)]
pub enum Predictor {
    #[default]
    Zero = 0,
    West,
    North,
    AvgWestAndNorth,
    Select,
    Gradient,
    SelfCorrecting,
    NorthEast,
    NorthWest,
    WestWest,
    AvgWestAndNorthWest,
    AvgNorthAndNorthWest,
    AvgNorthAndNorthEast,
    AvgAll,
}

/// Number of predictors in the bank.
pub const NUM_PREDICTORS: usize = 14;

impl TryFrom<u32> for Predictor {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self> {
        use Predictor::*;
        Ok(match value {
            0 => Zero,
            1 => West,
            2 => North,
            3 => AvgWestAndNorth,
            4 => Select,
            5 => Gradient,
            6 => SelfCorrecting,
            7 => NorthEast,
            8 => NorthWest,
            9 => WestWest,
            10 => AvgWestAndNorthWest,
            11 => AvgNorthAndNorthWest,
            12 => AvgNorthAndNorthEast,
            13 => AvgAll,
            _ => return Err(crate::Error::InvalidMaTree),
        })
    }
}

impl Predictor {
    /// All predictors, in bitstream order.
    pub fn all() -> [Predictor; NUM_PREDICTORS] {
        use Predictor::*;
        [
            Zero,
            West,
            North,
            AvgWestAndNorth,
            Select,
            Gradient,
            SelfCorrecting,
            NorthEast,
            NorthWest,
            WestWest,
            AvgWestAndNorthWest,
            AvgNorthAndNorthWest,
            AvgNorthAndNorthEast,
            AvgAll,
        ]
    }

    /// Computes the prediction for this predictor.
    ///
    /// `sc_prediction` is the fixed-point output of the self-correcting
    /// predictor; it must be present when `self` is
    /// [`SelfCorrecting`](Predictor::SelfCorrecting).
    pub fn predict(self, nb: &Neighborhood, sc_prediction: Option<i64>) -> i32 {
        use Predictor::*;

        fn avg(a: i32, b: i32) -> i32 {
            ((a as i64 + b as i64) / 2) as i32
        }

        match self {
            Zero => 0,
            West => nb.w,
            North => nb.n,
            AvgWestAndNorth => avg(nb.w, nb.n),
            Select => {
                let n = nb.n;
                let w = nb.w;
                let nw = nb.nw;
                if n.abs_diff(nw) < w.abs_diff(nw) {
                    w
                } else {
                    n
                }
            }
            Gradient => {
                let n = nb.n as i64;
                let w = nb.w as i64;
                let grad = w + n - nb.nw as i64;
                grad.clamp(w.min(n), w.max(n)) as i32
            }
            SelfCorrecting => {
                let prediction =
                    sc_prediction.expect("predict called without self-correcting state");
                ((prediction + 3) >> 3) as i32
            }
            NorthEast => nb.ne,
            NorthWest => nb.nw,
            WestWest => nb.ww,
            AvgWestAndNorthWest => avg(nb.w, nb.nw),
            AvgNorthAndNorthWest => avg(nb.n, nb.nw),
            AvgNorthAndNorthEast => avg(nb.n, nb.ne),
            AvgAll => {
                let n = nb.n as i64;
                let w = nb.w as i64;
                let nn = nb.nn as i64;
                let ww = nb.ww as i64;
                let nee = nb.nee as i64;
                let ne = nb.ne as i64;
                ((6 * n - 2 * nn + 7 * w + ww + nee + 3 * ne + 8) / 16) as i32
            }
        }
    }
}

/// Causal neighbors of one pixel, with the edge rules baked in.
///
/// The edge rules are part of the wire contract; changing them desynchronizes
/// encoder and decoder.
#[derive(Debug, Copy, Clone)]
pub struct Neighborhood {
    pub w: i32,
    pub n: i32,
    pub nw: i32,
    pub ne: i32,
    pub nn: i32,
    pub ww: i32,
    pub nee: i32,
}

impl Neighborhood {
    pub fn gather(grid: &SimpleGrid<i32>, x: usize, y: usize) -> Self {
        let width = grid.width();
        let at = |x: usize, y: usize| *grid.get(x, y).unwrap();

        let w = if x > 0 {
            at(x - 1, y)
        } else if y > 0 {
            at(x, y - 1)
        } else {
            0
        };
        let n = if y > 0 { at(x, y - 1) } else { w };
        let nw = if x > 0 && y > 0 { at(x - 1, y - 1) } else { w };
        let ne = if x + 1 < width && y > 0 { at(x + 1, y - 1) } else { n };
        let nn = if y > 1 { at(x, y - 2) } else { n };
        let ww = if x > 1 { at(x - 2, y) } else { w };
        let nee = if x + 2 < width && y > 0 {
            at(x + 2, y - 1)
        } else {
            ne
        };

        Self {
            w,
            n,
            nw,
            ne,
            nn,
            ww,
            nee,
        }
    }
}

/// One prediction of the self-correcting predictor.
///
/// `prediction` is in 1/8 pixel fixed point; `max_error` doubles as the WP
/// tree property.
#[derive(Debug, Clone)]
pub struct WpPrediction {
    pub prediction: i64,
    pub max_error: i32,
    subpred: [i64; 4],
}

/// Running error state of the self-correcting predictor.
///
/// `predict` and `update_errors` must be called for every pixel of the
/// channel in raster order; the state is channel-local and never shared.
#[derive(Debug)]
pub struct SelfCorrectingPredictor {
    width: usize,
    header: WpHeader,
    true_err_prev_row: Vec<i32>,
    true_err_curr_row: Vec<i32>,
    subpred_err_prev_row: Vec<[u32; 4]>,
    subpred_err_curr_row: Vec<[u32; 4]>,
    true_err_w: i32,
    true_err_nw: i32,
    true_err_n: i32,
    true_err_ne: i32,
    subpred_err_nw_ww: [u32; 4],
    subpred_err_n_w: [u32; 4],
    subpred_err_ne: [u32; 4],
}

impl SelfCorrectingPredictor {
    const DIV_LOOKUP: [u32; 65] = Self::compute_div_lookup();

    const fn compute_div_lookup() -> [u32; 65] {
        let mut out = [0u32; 65];
        let mut i = 1usize;
        while i <= 64 {
            out[i] = ((1 << 24) / i) as u32;
            i += 1;
        }
        out
    }

    pub fn new(width: usize, header: WpHeader) -> Self {
        Self {
            width,
            header,
            true_err_prev_row: Vec::with_capacity(width),
            true_err_curr_row: Vec::with_capacity(width),
            subpred_err_prev_row: Vec::with_capacity(width),
            subpred_err_curr_row: Vec::with_capacity(width),
            true_err_w: 0,
            true_err_nw: 0,
            true_err_n: 0,
            true_err_ne: 0,
            subpred_err_nw_ww: [0; 4],
            subpred_err_n_w: [0; 4],
            subpred_err_ne: [0; 4],
        }
    }

    pub fn predict(&self, nb: &Neighborhood) -> WpPrediction {
        let wp = &self.header;
        let n3 = (nb.n as i64) << 3;
        let nw3 = (nb.nw as i64) << 3;
        let ne3 = (nb.ne as i64) << 3;
        let w3 = (nb.w as i64) << 3;
        let nn3 = (nb.nn as i64) << 3;

        let te_w = self.true_err_w as i64;
        let te_n = self.true_err_n as i64;
        let te_nw = self.true_err_nw as i64;
        let te_ne = self.true_err_ne as i64;

        let subpred = [
            w3 + ne3 - n3,
            n3 - (((te_w + te_n + te_ne) * wp.wp_p1 as i64) >> 5),
            w3 - (((te_w + te_n + te_nw) * wp.wp_p2 as i64) >> 5),
            n3 - ((te_nw * wp.wp_p3a as i64
                + te_n * wp.wp_p3b as i64
                + te_ne * wp.wp_p3c as i64
                + (nn3 - n3) * wp.wp_p3d as i64
                + (nw3 - w3) * wp.wp_p3e as i64)
                >> 5),
        ];

        let mut subpred_err_sum = [0u32; 4];
        for (i, sum) in subpred_err_sum.iter_mut().enumerate() {
            *sum = self.subpred_err_nw_ww[i] + self.subpred_err_n_w[i] + self.subpred_err_ne[i];
        }

        let wp_wn = [wp.wp_w0, wp.wp_w1, wp.wp_w2, wp.wp_w3];
        let mut weight = [0u32; 4];
        for ((w, err_sum), maxweight) in weight.iter_mut().zip(subpred_err_sum).zip(wp_wn) {
            let shift = floor_log2(err_sum + 1).saturating_sub(5);
            *w = 4 + ((maxweight * Self::DIV_LOOKUP[(err_sum >> shift) as usize + 1]) >> shift);
        }

        let sum_weights: u32 = weight.iter().copied().sum();
        let log_weight = floor_log2(sum_weights) - 4;
        for w in &mut weight {
            *w >>= log_weight;
        }
        let sum_weights: u32 = weight.iter().copied().sum();
        let mut s = (sum_weights as i64 >> 1) - 1;
        for (subpred, weight) in subpred.into_iter().zip(weight) {
            s += subpred * weight as i64;
        }
        let mut prediction = (s * Self::DIV_LOOKUP[sum_weights as usize] as i64) >> 24;
        if ((self.true_err_n ^ self.true_err_w) | (self.true_err_n ^ self.true_err_nw)) <= 0 {
            let min = n3.min(w3).min(ne3);
            let max = n3.max(w3).max(ne3);
            prediction = prediction.clamp(min, max);
        }

        let true_errors = [self.true_err_n, self.true_err_nw, self.true_err_ne];
        let mut max_error = self.true_err_w;
        for err in true_errors {
            if err.abs() > max_error.abs() {
                max_error = err;
            }
        }

        WpPrediction {
            prediction,
            max_error,
            subpred,
        }
    }

    /// Records the actual pixel value, advancing the error state.
    ///
    /// `pred` must be the value returned by [`predict`](Self::predict) for
    /// this same pixel.
    pub fn update_errors(&mut self, pred: &WpPrediction, sample: i32) {
        let sample3 = (sample as i64) << 3;
        let true_err = (pred.prediction - sample3) as i32;
        let mut subpred_err = [0u32; 4];
        for (err, subpred) in subpred_err.iter_mut().zip(pred.subpred) {
            *err = ((subpred.abs_diff(sample3) + 3) >> 3) as u32;
        }

        self.true_err_curr_row.push(true_err);
        self.subpred_err_curr_row.push(subpred_err);

        let x = self.true_err_curr_row.len();
        if x >= self.width {
            std::mem::swap(&mut self.true_err_prev_row, &mut self.true_err_curr_row);
            std::mem::swap(&mut self.subpred_err_prev_row, &mut self.subpred_err_curr_row);
            self.true_err_curr_row.clear();
            self.subpred_err_curr_row.clear();

            self.true_err_w = 0;
            self.true_err_n = self.true_err_prev_row[0];
            self.true_err_nw = self.true_err_n;
            self.subpred_err_n_w = self.subpred_err_prev_row[0];
            self.subpred_err_nw_ww = self.subpred_err_n_w;
            if self.width <= 1 {
                self.true_err_ne = self.true_err_n;
                self.subpred_err_ne = self.subpred_err_n_w;
            } else {
                self.true_err_ne = self.true_err_prev_row[1];
                self.subpred_err_ne = self.subpred_err_prev_row[1];
            }
        } else {
            self.true_err_w = true_err;
            self.true_err_nw = self.true_err_n;
            self.true_err_n = self.true_err_ne;
            self.subpred_err_nw_ww = self.subpred_err_n_w;
            self.subpred_err_n_w = self.subpred_err_ne;
            for (acc, err) in self.subpred_err_n_w.iter_mut().zip(subpred_err) {
                *acc += err;
            }

            if x + 1 >= self.width {
                self.true_err_ne = self.true_err_n;
                self.subpred_err_ne = self.subpred_err_n_w;
            } else if !self.true_err_prev_row.is_empty() {
                self.true_err_ne = self.true_err_prev_row[x + 1];
                self.subpred_err_ne = self.subpred_err_prev_row[x + 1];
            }
        }
    }
}

fn floor_log2(x: u32) -> u32 {
    u32::BITS - 1 - x.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighborhood_edge_rules() {
        let mut grid = SimpleGrid::new(3, 3);
        for (i, v) in grid.buf_mut().iter_mut().enumerate() {
            *v = i as i32 + 1;
        }
        // 1 2 3
        // 4 5 6
        // 7 8 9

        let nb = Neighborhood::gather(&grid, 0, 0);
        assert_eq!((nb.w, nb.n, nb.nw, nb.ne, nb.nn), (0, 0, 0, 0, 0));

        let nb = Neighborhood::gather(&grid, 1, 0);
        assert_eq!((nb.w, nb.n, nb.nw, nb.ne, nb.nn), (1, 1, 1, 1, 1));

        let nb = Neighborhood::gather(&grid, 0, 1);
        assert_eq!((nb.w, nb.n, nb.nw, nb.ne, nb.nn), (1, 1, 1, 2, 1));

        let nb = Neighborhood::gather(&grid, 1, 1);
        assert_eq!((nb.w, nb.n, nb.nw, nb.ne, nb.nn), (4, 2, 1, 3, 2));

        let nb = Neighborhood::gather(&grid, 2, 1);
        assert_eq!((nb.w, nb.n, nb.nw, nb.ne), (5, 3, 2, 3));

        let nb = Neighborhood::gather(&grid, 1, 2);
        assert_eq!((nb.nn, nb.ww, nb.nee), (2, 7, 6));
    }

    #[test]
    fn predictors_on_flat_region() {
        let mut grid = SimpleGrid::new(4, 4);
        grid.buf_mut().fill(7);
        let nb = Neighborhood::gather(&grid, 2, 2);
        for predictor in Predictor::all() {
            if predictor == Predictor::Zero || predictor == Predictor::SelfCorrecting {
                continue;
            }
            assert_eq!(predictor.predict(&nb, None), 7, "{:?}", predictor);
        }
    }

    #[test]
    fn self_correcting_determinism() {
        let run = || {
            let mut grid = SimpleGrid::new(5, 4);
            for (i, v) in grid.buf_mut().iter_mut().enumerate() {
                *v = ((i * 2654435761) % 97) as i32 - 48;
            }
            let mut wp = SelfCorrectingPredictor::new(5, WpHeader::default());
            let mut log = Vec::new();
            for y in 0..4 {
                for x in 0..5 {
                    let nb = Neighborhood::gather(&grid, x, y);
                    let pred = wp.predict(&nb);
                    log.push((pred.prediction, pred.max_error));
                    wp.update_errors(&pred, *grid.get(x, y).unwrap());
                }
            }
            log
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn self_correcting_tracks_flat_signal() {
        let mut grid = SimpleGrid::new(8, 8);
        grid.buf_mut().fill(100);
        let mut wp = SelfCorrectingPredictor::new(8, WpHeader::default());
        let mut last = None;
        for y in 0..8 {
            for x in 0..8 {
                let nb = Neighborhood::gather(&grid, x, y);
                let pred = wp.predict(&nb);
                wp.update_errors(&pred, 100);
                last = Some(pred);
            }
        }
        let last = last.unwrap();
        assert_eq!((last.prediction + 3) >> 3, 100);
        assert_eq!(last.max_error, 0);
    }
}
