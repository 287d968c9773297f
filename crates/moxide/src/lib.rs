//! moxide is a lossless image codec built around the Modular coding model:
//! spatial prediction, a per-image meta-adaptive decision tree, and rANS
//! entropy coding of the residuals.
//!
//! Encoding and decoding are driven through [`modular_encode`] and
//! [`modular_decode`] over an [`image::Image`]:
//!
//! ```
//! use moxide::image::{Channel, Image};
//! use moxide::{modular_decode, modular_encode, BitWriter, Bitstream, ModularOptions};
//!
//! let mut image = Image::new(255);
//! let mut channel = Channel::new(4, 4);
//! channel.grid_mut().buf_mut().copy_from_slice(&[
//!     1, 2, 3, 4, 2, 3, 4, 5, 3, 4, 5, 6, 4, 5, 6, 7,
//! ]);
//! image.channels.push(channel);
//!
//! let options = ModularOptions::default();
//! let mut writer = BitWriter::new();
//! modular_encode(&image, &options, &mut writer, 0).unwrap();
//! let bytes = writer.finalize();
//!
//! let mut decoded = Image::new(255);
//! decoded.channels.push(Channel::new(4, 4));
//! let mut bitstream = Bitstream::new(&bytes);
//! modular_decode(&mut bitstream, &mut decoded, 0, &options, None).unwrap();
//! assert_eq!(decoded.channels[0].grid(), image.channels[0].grid());
//! ```

pub use moxide_bitstream::{pack_signed, unpack_signed, BitWriter, Bitstream};
pub use moxide_coding as coding;
pub use moxide_grid::SimpleGrid;
pub use moxide_modular::{
    filter_tree, gather_tree_data, learn_tree, modular_collect_tokens, modular_decode,
    modular_encode, modular_encode_with_global_tree, Error, FlatTree, GroupHeader, MaConfig,
    ModularOptions, Predictor, PredictorChoice, Properties, Result, SelfCorrectingPredictor,
    TransformInfo, Tree, TreeNode, TreeSamples, WpHeader,
};

pub use moxide_modular::image;
