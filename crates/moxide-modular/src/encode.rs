use moxide_bitstream::{pack_signed, BitWriter, Bitstream};
use moxide_coding::{AnsCode, Decoder, Encoder};

use crate::image::Image;
use crate::learn::{gather_tree_data, learn_tree, TreeSamples};
use crate::ma::{build_wp_lookup, filter_tree, Tree};
use crate::options::{GroupHeader, ModularOptions, PredictorChoice};
use crate::predictor::{Neighborhood, Predictor, SelfCorrectingPredictor, WpHeader};
use crate::property::{
    fill_pixel_props, init_props_row, precompute_references, select_reference_channels, Properties,
};
use crate::{Result, EXTRA_PROPS_PER_CHANNEL, NUM_NONREF_PROPERTIES, NUM_TREE_CONTEXTS, WP_PROP,
    WP_PROP_RANGE};

/// Encodes one Modular group with a locally learned tree: group header, tree
/// stream, then the data stream.
pub fn modular_encode(
    image: &Image,
    options: &ModularOptions,
    writer: &mut BitWriter,
    group_id: u32,
) -> Result<()> {
    if image.error {
        tracing::error!("invalid image");
        return Err(crate::Error::InvalidImage);
    }
    if image.channels.is_empty() {
        return Ok(());
    }
    tracing::debug!(
        channels = image.channels.len(),
        bit_depth = image.bit_depth(),
        "encoding image"
    );

    let wp_header = match options.predictor {
        PredictorChoice::Fixed(Predictor::SelfCorrecting) => WpHeader::from_mode(options.wp_mode),
        _ => WpHeader::default(),
    };
    let header = GroupHeader {
        use_global_tree: false,
        wp_header,
        transform: image.transform.clone(),
    };
    header.write(writer)?;

    let coded = image.coded_channel_ids(options);
    if coded.is_empty() {
        return Ok(());
    }

    let predictors = options.predictor.candidates();
    if options.force_no_wp && predictors == [Predictor::SelfCorrecting] {
        return Err(crate::Error::InvalidOptions(
            "force_no_wp with only the self-correcting predictor",
        ));
    }

    let mut samples = TreeSamples::new(
        predictors,
        NUM_NONREF_PROPERTIES + EXTRA_PROPS_PER_CHANNEL * options.max_properties,
    );
    for &chan in &coded {
        gather_tree_data(image, chan, group_id, &header.wp_header, options, &mut samples);
    }
    let tree = learn_tree(samples, options)?;
    tracing::debug!(nodes = tree.len(), "learned MA tree");

    // The tree section is written twice from the same deterministic state:
    // once to scratch for the wire self-check, once into the real stream.
    let mut tree_encoder = Encoder::new(NUM_TREE_CONTEXTS);
    tree.tokenize(&mut tree_encoder);
    let mut scratch = BitWriter::new();
    tree_encoder.write_section(&mut scratch)?;
    let scratch_bytes = scratch.finalize();
    let mut check_bitstream = Bitstream::new(&scratch_bytes);
    let mut check_decoder = Decoder::parse(&mut check_bitstream, NUM_TREE_CONTEXTS)?;
    check_decoder.begin()?;
    let decoded_tree = Tree::parse(&mut check_decoder, &mut check_bitstream, 1 << 20)?;
    check_decoder.finalize()?;
    if decoded_tree != tree {
        return Err(crate::Error::TreeRoundTripFailed);
    }
    tree_encoder.write_section(writer)?;

    let mut data_encoder = Encoder::new(tree.num_contexts());
    encode_channels(image, options, group_id, &header.wp_header, &tree, &mut data_encoder)?;
    data_encoder.write_section(writer)?;
    Ok(())
}

/// Prepass for global-tree encoding: collects this group's tokens into the
/// caller's encoder without writing anything. The caller runs this over every
/// group, builds one [`AnsCode`] from the union, then encodes each group with
/// [`modular_encode_with_global_tree`]. Returns the widest coded channel.
pub fn modular_collect_tokens(
    image: &Image,
    options: &ModularOptions,
    group_id: u32,
    tree: &Tree,
    sink: &mut Encoder,
) -> Result<u32> {
    if image.error {
        tracing::error!("invalid image");
        return Err(crate::Error::InvalidImage);
    }
    encode_channels(image, options, group_id, &WpHeader::default(), tree, sink)
}

/// Encodes one Modular group against a caller-provided global tree and
/// entropy code: group header, then this group's token blob. No local tree or
/// histograms are written.
pub fn modular_encode_with_global_tree(
    image: &Image,
    options: &ModularOptions,
    writer: &mut BitWriter,
    group_id: u32,
    tree: &Tree,
    code: &AnsCode,
) -> Result<()> {
    if image.error {
        tracing::error!("invalid image");
        return Err(crate::Error::InvalidImage);
    }
    if image.channels.is_empty() {
        return Ok(());
    }

    let header = GroupHeader {
        use_global_tree: true,
        wp_header: WpHeader::default(),
        transform: image.transform.clone(),
    };
    header.write(writer)?;

    if image.coded_channel_ids(options).is_empty() {
        return Ok(());
    }

    let mut encoder = Encoder::new(tree.num_contexts());
    encode_channels(image, options, group_id, &header.wp_header, tree, &mut encoder)?;
    encoder.write_tokens(code, writer)?;
    Ok(())
}

fn encode_channels(
    image: &Image,
    options: &ModularOptions,
    group_id: u32,
    wp_header: &WpHeader,
    tree: &Tree,
    encoder: &mut Encoder,
) -> Result<u32> {
    let mut image_width = 0usize;
    for &chan in &image.coded_channel_ids(options) {
        image_width = image_width.max(image.channels[chan].width());
        encode_channel(image, chan, group_id, wp_header, tree, encoder)?;
    }
    Ok(image_width as u32)
}

fn encode_channel(
    image: &Image,
    chan: usize,
    group_id: u32,
    wp_header: &WpHeader,
    tree: &Tree,
    encoder: &mut Encoder,
) -> Result<()> {
    let channel = &image.channels[chan];
    let width = channel.width();
    let height = channel.height();
    debug_assert!(width != 0 && height != 0);
    tracing::trace!(
        width,
        height,
        chan,
        hshift = channel.hshift(),
        vshift = channel.vshift(),
        "encoding channel"
    );

    let static_props = [chan as i32, group_id as i32];
    let flat = filter_tree(tree, static_props);
    tracing::trace!(nodes = flat.len(), "encoding using a MA tree");
    let grid = channel.grid();

    // The encoder-side WP fast path additionally needs trivial leaves, so the
    // emitted residual is exactly `pixel - guess`.
    let wp_lookup = if flat.wp_only() {
        build_wp_lookup(&flat, true)
    } else {
        None
    };

    if let Some(lookup) = wp_lookup {
        tracing::debug!("wp fast path");
        let mut wp = SelfCorrectingPredictor::new(width, wp_header.clone());
        for y in 0..height {
            for x in 0..width {
                let nb = Neighborhood::gather(grid, x, y);
                let pred = wp.predict(&nb);
                let pos =
                    (WP_PROP_RANGE + pred.max_error.clamp(-WP_PROP_RANGE, WP_PROP_RANGE - 1))
                        as usize;
                let guess = ((pred.prediction + 3) >> 3) as i32;
                let pixel = *grid.get(x, y).unwrap();
                let residual = pixel as i64 - guess as i64;
                encoder.emit_token(lookup.context[pos], pack_signed(residual as i32));
                wp.update_errors(&pred, pixel);
            }
        }
        return Ok(());
    }

    if let [leaf] = flat.nodes() {
        if leaf.predictor == Predictor::Zero && leaf.multiplier == 1 && leaf.predictor_offset == 0
        {
            tracing::debug!("fast path: zero predictor");
            for y in 0..height {
                for &pixel in grid.row(y) {
                    encoder.emit_token(leaf.child_id, pack_signed(pixel));
                }
            }
            return Ok(());
        }
        if leaf.predictor != Predictor::SelfCorrecting
            && leaf.multiplier == 1
            && leaf.predictor_offset == 0
        {
            tracing::debug!("fast path: single fixed predictor");
            for y in 0..height {
                for x in 0..width {
                    let nb = Neighborhood::gather(grid, x, y);
                    let guess = leaf.predictor.predict(&nb, None);
                    let pixel = *grid.get(x, y).unwrap();
                    let residual = pixel as i64 - guess as i64;
                    encoder.emit_token(leaf.child_id, pack_signed(residual as i32));
                }
            }
            return Ok(());
        }
    }

    tracing::debug!("general path");
    let num_props = flat.num_props();
    let max_refs = num_props.saturating_sub(NUM_NONREF_PROPERTIES) / EXTRA_PROPS_PER_CHANNEL;
    let ref_ids = select_reference_channels(image, chan, max_refs);
    let ref_stride = ref_ids.len() * EXTRA_PROPS_PER_CHANNEL;
    let mut props = Properties::new(num_props);
    let mut refs = Vec::new();
    let mut wp = SelfCorrectingPredictor::new(width, wp_header.clone());

    for y in 0..height {
        init_props_row(&mut props, static_props, y);
        precompute_references(image, &ref_ids, y, width, &mut refs);
        let mut prev_grad = 0i32;
        for x in 0..width {
            let nb = Neighborhood::gather(grid, x, y);
            let pred = wp.predict(&nb);
            let grad = fill_pixel_props(&mut props, x, &nb, prev_grad);
            props.set(WP_PROP, pred.max_error);
            props.set_refs(&refs[x * ref_stride..(x + 1) * ref_stride]);

            let leaf = flat.lookup(&props);
            let guess = leaf.predictor.predict(&nb, Some(pred.prediction)) as i64
                + leaf.predictor_offset as i64;
            let pixel = *grid.get(x, y).unwrap();
            let residual = pixel as i64 - guess;
            debug_assert_eq!(
                residual % leaf.multiplier as i64,
                0,
                "residual not divisible by leaf multiplier"
            );
            encoder.emit_token(
                leaf.child_id,
                pack_signed((residual / leaf.multiplier as i64) as i32),
            );

            wp.update_errors(&pred, pixel);
            prev_grad = grad;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Channel, Image};
    use crate::ma::TreeNode;

    fn image_with_pixels(width: usize, height: usize, f: impl Fn(usize) -> i32) -> Image {
        let mut image = Image::new(255);
        let mut channel = Channel::new(width, height);
        for (i, v) in channel.grid_mut().buf_mut().iter_mut().enumerate() {
            *v = f(i);
        }
        image.channels.push(channel);
        image
    }

    fn decision(property: i32, splitval: i32, lchild: u32, rchild: u32) -> TreeNode {
        TreeNode {
            property,
            splitval,
            lchild,
            rchild,
            predictor: Predictor::Zero,
            predictor_offset: 0,
            multiplier: 1,
        }
    }

    #[test]
    fn wp_fast_path_tokens_match_general_lookup() {
        let image = image_with_pixels(8, 8, |i| ((i * 37) % 41) as i32);
        let tree = Tree::new(vec![
            decision(WP_PROP as i32, 8, 1, 2),
            TreeNode::leaf(0, Predictor::SelfCorrecting, 0, 1),
            TreeNode::leaf(1, Predictor::SelfCorrecting, 0, 1),
        ]);
        let wp_header = WpHeader::default();

        let mut encoder = Encoder::new(tree.num_contexts());
        encode_channel(&image, 0, 0, &wp_header, &tree, &mut encoder).unwrap();

        // Reference: the general algorithm over the same flat tree, with the
        // WP property clamped the way the lookup table is indexed.
        let flat = filter_tree(&tree, [0, 0]);
        assert!(flat.wp_only());
        let grid = image.channels[0].grid();
        let mut wp = SelfCorrectingPredictor::new(8, wp_header.clone());
        let mut props = Properties::new(flat.num_props());
        let mut expected = Vec::new();
        for y in 0..8 {
            init_props_row(&mut props, [0, 0], y);
            for x in 0..8 {
                let nb = Neighborhood::gather(grid, x, y);
                let pred = wp.predict(&nb);
                fill_pixel_props(&mut props, x, &nb, 0);
                props.set(
                    WP_PROP,
                    pred.max_error.clamp(-WP_PROP_RANGE, WP_PROP_RANGE - 1),
                );
                let leaf = flat.lookup(&props);
                let pixel = *grid.get(x, y).unwrap();
                let guess = ((pred.prediction + 3) >> 3) as i64;
                expected.push((leaf.child_id, pack_signed((pixel as i64 - guess) as i32)));
                wp.update_errors(&pred, pixel);
            }
        }

        let tokens: Vec<_> = encoder
            .tokens()
            .iter()
            .map(|token| (token.context, token.value))
            .collect();
        assert_eq!(tokens, expected);
    }

    #[test]
    fn single_leaf_tokens_match_general_prediction() {
        let image = image_with_pixels(6, 5, |i| (i as i32 * 7) % 23);
        let tree = Tree::new(vec![TreeNode::leaf(0, Predictor::West, 0, 1)]);
        let wp_header = WpHeader::default();

        let mut encoder = Encoder::new(tree.num_contexts());
        encode_channel(&image, 0, 0, &wp_header, &tree, &mut encoder).unwrap();

        let grid = image.channels[0].grid();
        let mut expected = Vec::new();
        for y in 0..5 {
            for x in 0..6 {
                let nb = Neighborhood::gather(grid, x, y);
                let guess = Predictor::West.predict(&nb, None);
                let pixel = *grid.get(x, y).unwrap();
                expected.push((0u32, pack_signed(pixel - guess)));
            }
        }

        let tokens: Vec<_> = encoder
            .tokens()
            .iter()
            .map(|token| (token.context, token.value))
            .collect();
        assert_eq!(tokens, expected);
    }
}
