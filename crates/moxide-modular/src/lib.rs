//! Modular image codec core.
//!
//! A Modular image is a set of integer channels coded with spatial
//! prediction, a per-image meta-adaptive (MA) decision tree that picks a
//! predictor and entropy context per pixel, and an ANS-backed token stream.
//! This crate holds the tree machinery, the predictor bank with the
//! self-correcting (weighted) predictor, the per-channel encode/decode
//! drivers with their specialized fast paths, and the tree learner.

mod decode;
mod encode;
mod error;
pub mod image;
mod learn;
mod ma;
mod options;
mod predictor;
mod property;

pub use decode::{modular_decode, MaConfig};
pub use encode::{modular_collect_tokens, modular_encode, modular_encode_with_global_tree};
pub use error::{Error, Result};
pub use learn::{gather_tree_data, learn_tree, TreeSamples};
pub use ma::{build_wp_lookup, filter_tree, FlatNode, FlatTree, Tree, TreeNode, WpLookup};
pub use options::{GroupHeader, ModularOptions, PredictorChoice, TransformInfo};
pub use predictor::{
    Neighborhood, Predictor, SelfCorrectingPredictor, WpHeader, WpPrediction, NUM_PREDICTORS,
};
pub use property::{
    fill_pixel_props, init_props_row, precompute_references, select_reference_channels, Properties,
};

/// Properties with a fixed value per channel: channel index and group id.
pub const NUM_STATIC_PROPERTIES: usize = 2;

/// Properties that don't depend on reference channels.
pub const NUM_NONREF_PROPERTIES: usize = 16;

/// Property-vector slots contributed by each reference channel.
pub const EXTRA_PROPS_PER_CHANNEL: usize = 4;

/// Property id of the self-correcting predictor's error property.
pub const WP_PROP: usize = NUM_NONREF_PROPERTIES - 1;

/// Half-range of the WP property after clamping, and the radius of the
/// WP-only fast-path lookup table.
pub const WP_PROP_RANGE: i32 = 512;

/// Contexts of the tree token stream: splitval, property, predictor, offset,
/// multiplier log and multiplier bits.
pub const NUM_TREE_CONTEXTS: u32 = 6;
