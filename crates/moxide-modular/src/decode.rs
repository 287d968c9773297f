use moxide_bitstream::{unpack_signed, Bitstream};
use moxide_coding::{AnsCode, Decoder};

use crate::image::{Channel, Image};
use crate::ma::{build_wp_lookup, filter_tree, FlatTree, Tree};
use crate::options::{GroupHeader, ModularOptions};
use crate::predictor::{Neighborhood, Predictor, SelfCorrectingPredictor, WpHeader};
use crate::property::{
    fill_pixel_props, init_props_row, precompute_references, select_reference_channels, Properties,
};
use crate::{Result, EXTRA_PROPS_PER_CHANNEL, NUM_NONREF_PROPERTIES, NUM_TREE_CONTEXTS, WP_PROP,
    WP_PROP_RANGE};

/// A global MA tree with its entropy code and context map, supplied by the
/// caller when the group header says `use_global_tree`.
#[derive(Debug, Clone)]
pub struct MaConfig {
    pub tree: Tree,
    pub code: AnsCode,
}

/// Saturating reconstruction: `unpack(token) * multiplier + base`, where
/// `base` already folds the leaf offset into the prediction. Keeps crafted
/// streams from overflowing without rejecting valid data.
#[inline]
fn reconstruct(token: u32, multiplier: u32, base: i64) -> i32 {
    let value = unpack_signed(token) as i64 * multiplier as i64 + base;
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Decodes one Modular group into `image`, whose channels must already have
/// their final dimensions.
pub fn modular_decode(
    bitstream: &mut Bitstream,
    image: &mut Image,
    group_id: u32,
    options: &ModularOptions,
    global: Option<&MaConfig>,
) -> Result<()> {
    if image.channels.is_empty() {
        return Ok(());
    }

    let header: GroupHeader = bitstream.read_bundle()?;
    tracing::debug!(
        transforms = header.transform.len(),
        use_global_tree = header.use_global_tree,
        "decoded group header"
    );
    image.transform = header.transform.clone();
    if options.identify {
        return Ok(());
    }
    if image.error {
        tracing::error!("corrupt file");
        return Err(crate::Error::InvalidImage);
    }

    let coded = image.coded_channel_ids(options);
    if coded.is_empty() {
        return Ok(());
    }

    let (tree, mut decoder);
    if header.use_global_tree {
        let config = global.ok_or(crate::Error::GlobalMaTreeNotAvailable)?;
        if config.tree.is_empty()
            || config.code.cluster_map().len() < config.tree.num_contexts() as usize
        {
            return Err(crate::Error::GlobalMaTreeNotAvailable);
        }
        tree = config.tree.clone();
        decoder = Decoder::with_code(config.code.clone());
        decoder.read_blob(bitstream)?;
    } else {
        let mut tree_decoder = Decoder::parse(bitstream, NUM_TREE_CONTEXTS)?;
        tree_decoder.begin()?;
        let local_samples: usize = coded
            .iter()
            .map(|&i| image.channels[i].width() * image.channels[i].height())
            .sum();
        let node_limit = (1024 + local_samples).min(1 << 20);
        tree = Tree::parse(&mut tree_decoder, bitstream, node_limit)?;
        tree_decoder.finalize()?;
        if tree.depth() > 2048 {
            tracing::error!(tree_depth = tree.depth(), "decoded MA tree is too deep");
            return Err(crate::Error::InvalidMaTree);
        }
        decoder = Decoder::parse(bitstream, tree.num_contexts())?;
    }

    decoder.begin()?;
    for &chan in &coded {
        decode_channel(
            bitstream,
            &mut decoder,
            &tree,
            image,
            chan,
            group_id,
            &header.wp_header,
        )?;
    }
    decoder.finalize()?;
    Ok(())
}

fn decode_channel(
    bitstream: &mut Bitstream,
    decoder: &mut Decoder,
    tree: &Tree,
    image: &mut Image,
    chan: usize,
    group_id: u32,
    wp_header: &WpHeader,
) -> Result<()> {
    let width = image.channels[chan].width();
    let height = image.channels[chan].height();
    debug_assert!(width != 0 && height != 0);

    let static_props = [chan as i32, group_id as i32];
    let mut flat = filter_tree(tree, static_props);
    // From here on, tree lookup returns *clustered* context ids; this saves
    // a map lookup per pixel.
    flat.remap_contexts(decoder.cluster_map());
    tracing::trace!(nodes = flat.len(), width, height, chan, "decoding channel");

    let ref_ids = {
        let num_props = flat.num_props();
        let max_refs = num_props.saturating_sub(NUM_NONREF_PROPERTIES) / EXTRA_PROPS_PER_CHANNEL;
        select_reference_channels(image, chan, max_refs)
    };

    // The channel is detached while decoding so reference rows can be read
    // from the rest of the image.
    let mut channel = std::mem::replace(&mut image.channels[chan], Channel::new(0, 0));
    let result = decode_channel_inner(
        bitstream,
        decoder,
        &flat,
        image,
        &ref_ids,
        &mut channel,
        static_props,
        wp_header,
    );
    image.channels[chan] = channel;
    result
}

#[allow(clippy::too_many_arguments)]
fn decode_channel_inner(
    bitstream: &mut Bitstream,
    decoder: &mut Decoder,
    flat: &FlatTree,
    image: &Image,
    ref_ids: &[usize],
    channel: &mut Channel,
    static_props: [i32; 2],
    wp_header: &WpHeader,
) -> Result<()> {
    let width = channel.width();
    let height = channel.height();

    let wp_lookup = if flat.wp_only() {
        build_wp_lookup(flat, false)
    } else {
        None
    };

    if let Some(lookup) = wp_lookup {
        tracing::debug!("wp fast path");
        let mut wp = SelfCorrectingPredictor::new(width, wp_header.clone());
        for y in 0..height {
            for x in 0..width {
                let nb = Neighborhood::gather(channel.grid(), x, y);
                let pred = wp.predict(&nb);
                let pos =
                    (WP_PROP_RANGE + pred.max_error.clamp(-WP_PROP_RANGE, WP_PROP_RANGE - 1))
                        as usize;
                let guess = ((pred.prediction + 3) >> 3) as i64;
                let token =
                    decoder.read_varint_clustered(bitstream, lookup.context[pos] as u8)?;
                let value = reconstruct(
                    token,
                    lookup.multiplier[pos],
                    lookup.offset[pos] as i64 + guess,
                );
                *channel.grid_mut().get_mut(x, y).unwrap() = value;
                wp.update_errors(&pred, value);
            }
        }
        return Ok(());
    }

    if let [leaf] = flat.nodes() {
        let leaf = *leaf;
        let ctx = leaf.child_id as u8;
        if leaf.predictor == Predictor::Zero {
            if let Some(token) = decoder.single_token(ctx) {
                // Degenerate single-symbol histogram: the whole channel is
                // one value, no per-pixel reads needed.
                tracing::debug!("fastest path: single value");
                let value = reconstruct(token, leaf.multiplier, leaf.predictor_offset as i64);
                for y in 0..height {
                    channel.grid_mut().row_mut(y).fill(value);
                }
            } else {
                tracing::debug!("fast path: zero predictor");
                for y in 0..height {
                    for x in 0..width {
                        let token = decoder.read_varint_clustered(bitstream, ctx)?;
                        let value =
                            reconstruct(token, leaf.multiplier, leaf.predictor_offset as i64);
                        *channel.grid_mut().get_mut(x, y).unwrap() = value;
                    }
                }
            }
            return Ok(());
        }
        if leaf.predictor != Predictor::SelfCorrecting {
            tracing::debug!("fast path: single fixed predictor");
            for y in 0..height {
                for x in 0..width {
                    let nb = Neighborhood::gather(channel.grid(), x, y);
                    let guess =
                        leaf.predictor.predict(&nb, None) as i64 + leaf.predictor_offset as i64;
                    let token = decoder.read_varint_clustered(bitstream, ctx)?;
                    let value = reconstruct(token, leaf.multiplier, guess);
                    *channel.grid_mut().get_mut(x, y).unwrap() = value;
                }
            }
            return Ok(());
        }
        tracing::debug!("fast path: single self-correcting predictor");
        let mut wp = SelfCorrectingPredictor::new(width, wp_header.clone());
        for y in 0..height {
            for x in 0..width {
                let nb = Neighborhood::gather(channel.grid(), x, y);
                let pred = wp.predict(&nb);
                let guess = ((pred.prediction + 3) >> 3) as i64 + leaf.predictor_offset as i64;
                let token = decoder.read_varint_clustered(bitstream, ctx)?;
                let value = reconstruct(token, leaf.multiplier, guess);
                *channel.grid_mut().get_mut(x, y).unwrap() = value;
                wp.update_errors(&pred, value);
            }
        }
        return Ok(());
    }

    let num_props = flat.num_props();
    let ref_stride = ref_ids.len() * EXTRA_PROPS_PER_CHANNEL;
    let mut props = Properties::new(num_props);
    let mut refs = Vec::new();

    if !flat.use_wp() {
        tracing::debug!("general path");
        for y in 0..height {
            init_props_row(&mut props, static_props, y);
            precompute_references(image, ref_ids, y, width, &mut refs);
            let mut prev_grad = 0i32;
            for x in 0..width {
                let nb = Neighborhood::gather(channel.grid(), x, y);
                let grad = fill_pixel_props(&mut props, x, &nb, prev_grad);
                props.set_refs(&refs[x * ref_stride..(x + 1) * ref_stride]);

                let leaf = flat.lookup(&props);
                let guess =
                    leaf.predictor.predict(&nb, None) as i64 + leaf.predictor_offset as i64;
                let token = decoder.read_varint_clustered(bitstream, leaf.child_id as u8)?;
                let value = reconstruct(token, leaf.multiplier, guess);
                *channel.grid_mut().get_mut(x, y).unwrap() = value;
                prev_grad = grad;
            }
        }
        return Ok(());
    }

    tracing::debug!("general path with self-correcting predictor");
    let mut wp = SelfCorrectingPredictor::new(width, wp_header.clone());
    for y in 0..height {
        init_props_row(&mut props, static_props, y);
        precompute_references(image, ref_ids, y, width, &mut refs);
        let mut prev_grad = 0i32;
        for x in 0..width {
            let nb = Neighborhood::gather(channel.grid(), x, y);
            let pred = wp.predict(&nb);
            let grad = fill_pixel_props(&mut props, x, &nb, prev_grad);
            props.set(WP_PROP, pred.max_error);
            props.set_refs(&refs[x * ref_stride..(x + 1) * ref_stride]);

            let leaf = flat.lookup(&props);
            let guess = leaf.predictor.predict(&nb, Some(pred.prediction)) as i64
                + leaf.predictor_offset as i64;
            let token = decoder.read_varint_clustered(bitstream, leaf.child_id as u8)?;
            let value = reconstruct(token, leaf.multiplier, guess);
            *channel.grid_mut().get_mut(x, y).unwrap() = value;
            wp.update_errors(&pred, value);
            prev_grad = grad;
        }
    }
    Ok(())
}
