use moxide_bitstream::{BitWriter, Bitstream, Bundle, U32};

use crate::predictor::{Predictor, WpHeader};
use crate::{Error, Result};

/// Which predictors the learner may choose from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PredictorChoice {
    /// A single fixed predictor.
    Fixed(Predictor),
    /// Every predictor in the bank is a candidate.
    Variable,
    /// Gradient and the self-correcting predictor.
    Best,
}

impl Default for PredictorChoice {
    fn default() -> Self {
        Self::Fixed(Predictor::Gradient)
    }
}

impl PredictorChoice {
    pub(crate) fn candidates(self) -> Vec<Predictor> {
        match self {
            Self::Fixed(predictor) => vec![predictor],
            Self::Variable => Predictor::all().to_vec(),
            Self::Best => vec![Predictor::Gradient, Predictor::SelfCorrecting],
        }
    }
}

/// Options consumed by the encoder and, for channel iteration shaping, the
/// decoder. Both sides must use identical `skipchannels` / `max_chan_size`.
#[derive(Debug, Clone)]
pub struct ModularOptions {
    pub predictor: PredictorChoice,
    /// Selects a [`WpHeader`] preset written to the group header.
    pub wp_mode: u32,
    pub force_wp_only: bool,
    pub force_no_wp: bool,
    /// Number of reference channels whose properties the learner sees.
    pub max_properties: usize,
    pub splitting_heuristics_max_properties: usize,
    pub splitting_heuristics_node_threshold: f32,
    pub fast_decode_multiplier: f32,
    /// Sampling fraction for the tree learner; 0 disables learning.
    pub nb_repeats: f32,
    pub skipchannels: usize,
    pub max_chan_size: u32,
    /// Stop decoding after header and transform metadata.
    pub identify: bool,
}

impl Default for ModularOptions {
    fn default() -> Self {
        Self {
            predictor: PredictorChoice::default(),
            wp_mode: 0,
            force_wp_only: false,
            force_no_wp: false,
            max_properties: 0,
            splitting_heuristics_max_properties: 8,
            splitting_heuristics_node_threshold: 96.0,
            fast_decode_multiplier: 1.01,
            nb_repeats: 0.5,
            skipchannels: 0,
            max_chan_size: 0xff_ffff,
            identify: false,
        }
    }
}

const BEGIN_C: [U32; 4] = [
    U32::u(3),
    U32::BitsOffset { bits: 6, offset: 8 },
    U32::BitsOffset {
        bits: 10,
        offset: 72,
    },
    U32::BitsOffset {
        bits: 13,
        offset: 1096,
    },
];

/// Transform metadata carried through the group header.
///
/// Transforms are (un)applied by the caller before/after this codec runs;
/// here they only round-trip through the bitstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformInfo {
    Rct {
        begin_c: u32,
        rct_type: u32,
    },
    Palette {
        begin_c: u32,
        num_c: u32,
        nb_colours: u32,
        nb_deltas: u32,
        d_pred: Predictor,
    },
    Squeeze {
        horizontal: bool,
        in_place: bool,
        begin_c: u32,
        num_c: u32,
    },
}

impl<Ctx> Bundle<Ctx> for TransformInfo {
    type Error = crate::Error;

    fn parse(bitstream: &mut Bitstream, _: Ctx) -> Result<Self> {
        let tr = bitstream.read_bits(2)?;
        Ok(match tr {
            0 => Self::Rct {
                begin_c: bitstream.read_u32(BEGIN_C)?,
                rct_type: bitstream.read_u32([
                    U32::Const(6),
                    U32::u(2),
                    U32::BitsOffset { bits: 4, offset: 2 },
                    U32::BitsOffset {
                        bits: 6,
                        offset: 10,
                    },
                ])?,
            },
            1 => Self::Palette {
                begin_c: bitstream.read_u32(BEGIN_C)?,
                num_c: bitstream.read_u32([
                    U32::Const(1),
                    U32::Const(3),
                    U32::Const(4),
                    U32::BitsOffset { bits: 13, offset: 1 },
                ])?,
                nb_colours: bitstream.read_u32([
                    U32::u(8),
                    U32::BitsOffset {
                        bits: 10,
                        offset: 256,
                    },
                    U32::BitsOffset {
                        bits: 12,
                        offset: 1280,
                    },
                    U32::BitsOffset {
                        bits: 16,
                        offset: 5376,
                    },
                ])?,
                nb_deltas: bitstream.read_u32([
                    U32::Const(0),
                    U32::u(8),
                    U32::BitsOffset {
                        bits: 10,
                        offset: 256,
                    },
                    U32::BitsOffset {
                        bits: 16,
                        offset: 1280,
                    },
                ])?,
                d_pred: Predictor::try_from(bitstream.read_bits(4)?)?,
            },
            2 => Self::Squeeze {
                horizontal: bitstream.read_bool()?,
                in_place: bitstream.read_bool()?,
                begin_c: bitstream.read_u32(BEGIN_C)?,
                num_c: bitstream.read_u32([
                    U32::Const(1),
                    U32::Const(2),
                    U32::Const(3),
                    U32::BitsOffset { bits: 4, offset: 4 },
                ])?,
            },
            value => {
                return Err(Error::Bitstream(moxide_bitstream::Error::InvalidEnum {
                    name: "TransformId",
                    value,
                }))
            }
        })
    }
}

impl TransformInfo {
    pub fn write(&self, writer: &mut BitWriter) -> Result<()> {
        match *self {
            Self::Rct { begin_c, rct_type } => {
                writer.write_bits(0, 2);
                writer.write_u32(BEGIN_C, begin_c)?;
                writer.write_u32(
                    [
                        U32::Const(6),
                        U32::u(2),
                        U32::BitsOffset { bits: 4, offset: 2 },
                        U32::BitsOffset {
                            bits: 6,
                            offset: 10,
                        },
                    ],
                    rct_type,
                )?;
            }
            Self::Palette {
                begin_c,
                num_c,
                nb_colours,
                nb_deltas,
                d_pred,
            } => {
                writer.write_bits(1, 2);
                writer.write_u32(BEGIN_C, begin_c)?;
                writer.write_u32(
                    [
                        U32::Const(1),
                        U32::Const(3),
                        U32::Const(4),
                        U32::BitsOffset { bits: 13, offset: 1 },
                    ],
                    num_c,
                )?;
                writer.write_u32(
                    [
                        U32::u(8),
                        U32::BitsOffset {
                            bits: 10,
                            offset: 256,
                        },
                        U32::BitsOffset {
                            bits: 12,
                            offset: 1280,
                        },
                        U32::BitsOffset {
                            bits: 16,
                            offset: 5376,
                        },
                    ],
                    nb_colours,
                )?;
                writer.write_u32(
                    [
                        U32::Const(0),
                        U32::u(8),
                        U32::BitsOffset {
                            bits: 10,
                            offset: 256,
                        },
                        U32::BitsOffset {
                            bits: 16,
                            offset: 1280,
                        },
                    ],
                    nb_deltas,
                )?;
                writer.write_bits(d_pred as u32, 4);
            }
            Self::Squeeze {
                horizontal,
                in_place,
                begin_c,
                num_c,
            } => {
                writer.write_bits(2, 2);
                writer.write_bool(horizontal);
                writer.write_bool(in_place);
                writer.write_u32(BEGIN_C, begin_c)?;
                writer.write_u32(
                    [
                        U32::Const(1),
                        U32::Const(2),
                        U32::Const(3),
                        U32::BitsOffset { bits: 4, offset: 4 },
                    ],
                    num_c,
                )?;
            }
        }
        Ok(())
    }
}

const NB_TRANSFORMS: [U32; 4] = [
    U32::Const(0),
    U32::Const(1),
    U32::BitsOffset { bits: 4, offset: 2 },
    U32::BitsOffset {
        bits: 8,
        offset: 18,
    },
];

/// Header of one Modular group; always the first thing in the stream.
#[derive(Debug, Clone)]
pub struct GroupHeader {
    pub use_global_tree: bool,
    pub wp_header: WpHeader,
    pub transform: Vec<TransformInfo>,
}

impl<Ctx> Bundle<Ctx> for GroupHeader {
    type Error = crate::Error;

    fn parse(bitstream: &mut Bitstream, _: Ctx) -> Result<Self> {
        let use_global_tree = bitstream.read_bool()?;
        let wp_header = bitstream.read_bundle::<WpHeader>()?;
        let nb_transforms = bitstream.read_u32(NB_TRANSFORMS)?;
        if nb_transforms > 512 {
            tracing::error!(nb_transforms, "nb_transforms too large");
            return Err(Error::Bitstream(moxide_bitstream::Error::ValidationFailed(
                "nb_transforms too large",
            )));
        }
        let transform = (0..nb_transforms)
            .map(|_| bitstream.read_bundle::<TransformInfo>())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            use_global_tree,
            wp_header,
            transform,
        })
    }
}

impl GroupHeader {
    pub fn write(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_bool(self.use_global_tree);
        self.wp_header.write(writer);
        writer.write_u32(NB_TRANSFORMS, self.transform.len() as u32)?;
        for tr in &self.transform {
            tr.write(writer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_header_roundtrip() {
        let header = GroupHeader {
            use_global_tree: false,
            wp_header: WpHeader {
                wp_p1: 20,
                ..WpHeader::default()
            },
            transform: vec![
                TransformInfo::Rct {
                    begin_c: 0,
                    rct_type: 6,
                },
                TransformInfo::Squeeze {
                    horizontal: true,
                    in_place: false,
                    begin_c: 3,
                    num_c: 1,
                },
                TransformInfo::Palette {
                    begin_c: 0,
                    num_c: 3,
                    nb_colours: 300,
                    nb_deltas: 0,
                    d_pred: Predictor::Zero,
                },
            ],
        };

        let mut writer = BitWriter::new();
        header.write(&mut writer).unwrap();
        let bytes = writer.finalize();

        let mut bitstream = Bitstream::new(&bytes);
        let parsed: GroupHeader = bitstream.read_bundle().unwrap();
        assert_eq!(parsed.use_global_tree, header.use_global_tree);
        assert_eq!(parsed.wp_header, header.wp_header);
        assert_eq!(parsed.transform, header.transform);
    }

    #[test]
    fn default_wp_header_is_one_bit() {
        let mut writer = BitWriter::new();
        WpHeader::default().write(&mut writer);
        assert_eq!(writer.num_written_bits(), 1);
    }
}
