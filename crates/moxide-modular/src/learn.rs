use moxide_bitstream::pack_signed;
use moxide_coding::{IntegerConfig, MAX_ALPHABET_SIZE};

use crate::image::Image;
use crate::ma::{Tree, TreeNode};
use crate::options::ModularOptions;
use crate::predictor::{Neighborhood, Predictor, SelfCorrectingPredictor, WpHeader};
use crate::property::{
    fill_pixel_props, init_props_row, precompute_references, select_reference_channels, Properties,
};
use crate::{Result, NUM_NONREF_PROPERTIES, WP_PROP, WP_PROP_RANGE};

/// Deterministic xorshift128+ used for pixel sampling.
///
/// The seed constants are fixed so that learned trees are reproducible; they
/// are part of the reproducibility contract, do not replace them with
/// platform entropy.
struct XorShift128Plus {
    s0: u64,
    s1: u64,
}

impl XorShift128Plus {
    fn new() -> Self {
        Self {
            s0: 0x94D0_49BB_1331_11EB,
            s1: 0xBF58_476D_1CE4_E5B9,
        }
    }

    #[inline]
    fn next(&mut self) -> u64 {
        let mut s1 = self.s0;
        let s0 = self.s1;
        let bits = s1.wrapping_add(s0);
        self.s0 = s0;
        s1 ^= s1 << 23;
        s1 ^= s0 ^ (s1 >> 18) ^ (s0 >> 5);
        self.s1 = s1;
        bits
    }

    #[inline]
    fn use_sample(&mut self, threshold: u64) -> bool {
        (self.next() >> 32) <= threshold
    }
}

/// Sampled (property vector, residual per predictor) pairs, accumulated
/// across the channels of one group.
#[derive(Debug)]
pub struct TreeSamples {
    pub(crate) predictors: Vec<Predictor>,
    pub(crate) props: Vec<Vec<i32>>,
    pub(crate) residuals: Vec<Vec<i32>>,
    pub(crate) total_pixels: usize,
}

impl TreeSamples {
    pub fn new(predictors: Vec<Predictor>, num_props: usize) -> Self {
        let num_predictors = predictors.len();
        Self {
            predictors,
            props: vec![Vec::new(); num_props],
            residuals: vec![Vec::new(); num_predictors],
            total_pixels: 0,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.residuals.first().map_or(0, Vec::len)
    }
}

/// Walks one channel and samples per-pixel properties and residuals for the
/// learner, at a rate derived from `nb_repeats` with a floor of roughly 1024
/// samples per channel.
pub fn gather_tree_data(
    image: &Image,
    chan: usize,
    group_id: u32,
    wp_header: &WpHeader,
    options: &ModularOptions,
    samples: &mut TreeSamples,
) {
    let channel = &image.channels[chan];
    let width = channel.width();
    let height = channel.height();
    tracing::debug!(width, height, chan, "gathering tree data");

    samples.total_pixels += width * height;

    let mut pixel_fraction = (options.nb_repeats as f64).min(1.0);
    if pixel_fraction > 0.0 {
        pixel_fraction = pixel_fraction.max((1024.0 / (width * height) as f64).min(1.0));
    } else {
        return;
    }
    let threshold = ((u64::MAX >> 32) as f64 * pixel_fraction) as u64;
    let mut rng = XorShift128Plus::new();

    let num_props = samples.props.len();
    let static_props = [chan as i32, group_id as i32];
    let max_refs = num_props.saturating_sub(NUM_NONREF_PROPERTIES) / crate::EXTRA_PROPS_PER_CHANNEL;
    let ref_ids = select_reference_channels(image, chan, max_refs);
    let ref_stride = ref_ids.len() * crate::EXTRA_PROPS_PER_CHANNEL;

    let mut wp = SelfCorrectingPredictor::new(width, wp_header.clone());
    let mut props = Properties::new(num_props);
    let mut refs = Vec::new();
    let grid = channel.grid();

    for y in 0..height {
        init_props_row(&mut props, static_props, y);
        precompute_references(image, &ref_ids, y, width, &mut refs);
        let mut prev_grad = 0i32;
        for x in 0..width {
            let nb = Neighborhood::gather(grid, x, y);
            let wp_pred = wp.predict(&nb);
            let grad = fill_pixel_props(&mut props, x, &nb, prev_grad);
            props.set(WP_PROP, wp_pred.max_error);
            props.set_refs(&refs[x * ref_stride..(x + 1) * ref_stride]);

            let pixel = *grid.get(x, y).unwrap();
            if rng.use_sample(threshold) {
                for (residuals, &predictor) in
                    samples.residuals.iter_mut().zip(&samples.predictors)
                {
                    let guess = predictor.predict(&nb, Some(wp_pred.prediction));
                    residuals.push((pixel as i64 - guess as i64) as i32);
                }
                for (column, idx) in samples.props.iter_mut().zip(0..num_props) {
                    column.push(props.get(idx));
                }
            }

            wp.update_errors(&wp_pred, pixel);
            prev_grad = grad;
        }
    }
}

const MAX_SPLIT_VALUES: usize = 31;
const MAX_TREE_DEPTH: usize = 48;

/// Learns a decision tree from the gathered samples by greedy splitting on
/// an estimated code-length objective.
pub fn learn_tree(samples: TreeSamples, options: &ModularOptions) -> Result<Tree> {
    let TreeSamples {
        mut predictors,
        mut props,
        mut residuals,
        total_pixels,
    } = samples;

    if residuals.len() > 1 && !residuals[0].is_empty() {
        let mut base = 0usize;
        let mut base_cost = 0u64;
        for (i, res) in residuals.iter().enumerate() {
            let cost: u64 = res.iter().map(|&r| pack_signed(r) as u64).sum();
            if i == 0 || cost < base_cost {
                base = i;
                base_cost = cost;
            }
        }
        predictors.swap(0, base);
        residuals.swap(0, base);
    }

    if options.force_no_wp
        && predictors.len() == 1
        && predictors[0] == Predictor::SelfCorrecting
    {
        return Err(crate::Error::InvalidOptions(
            "force_no_wp with only the self-correcting predictor",
        ));
    }

    if residuals.is_empty() || residuals[0].is_empty() {
        let predictor = predictors.last().copied().unwrap_or_default();
        return Ok(Tree::new(vec![TreeNode::leaf(0, predictor, 0, 1)]));
    }

    if options.force_wp_only {
        for v in &mut props[WP_PROP] {
            *v = (*v).clamp(-WP_PROP_RANGE, WP_PROP_RANGE - 1);
        }
    }
    if options.force_no_wp {
        for v in &mut props[WP_PROP] {
            *v = 0;
        }
        if let Some(pos) = predictors.iter().position(|&p| p == Predictor::SelfCorrecting) {
            let last = predictors.len() - 1;
            predictors.swap(pos, last);
            residuals.swap(pos, last);
            predictors.pop();
            residuals.pop();
        }
    }

    let candidates = choose_split_candidates(&props, options);

    let num_samples = residuals[0].len();
    let pixel_fraction = num_samples as f32 / total_pixels.max(1) as f32;
    let required_cost = pixel_fraction * 0.9 + 0.1;
    let threshold = options.splitting_heuristics_node_threshold * required_cost;

    let indices: Vec<u32> = (0..num_samples as u32).collect();
    let mut builder = TreeBuilder {
        predictors: &predictors,
        props: &props,
        residuals: &residuals,
        candidates: &candidates,
        threshold,
        fast_decode_multiplier: options.fast_decode_multiplier,
        nodes: Vec::new(),
        next_ctx: 0,
    };
    builder.build(&indices, 0);
    Ok(Tree::new(builder.nodes))
}

/// Per-property split value codebook: quantiles of the distinct sampled
/// values, standing in for the full property quantizer.
fn choose_split_candidates(
    props: &[Vec<i32>],
    options: &ModularOptions,
) -> Vec<(usize, Vec<i32>)> {
    let mut per_prop: Vec<(usize, Vec<i32>)> = Vec::new();
    for (property, column) in props.iter().enumerate() {
        if options.force_wp_only && property != WP_PROP {
            continue;
        }
        let mut distinct = column.clone();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() < 2 {
            continue;
        }
        // Splitting at the maximum would leave the > side empty.
        distinct.pop();
        let splitvals = if distinct.len() <= MAX_SPLIT_VALUES {
            distinct
        } else {
            let n = distinct.len();
            let mut vals: Vec<i32> = (1..=MAX_SPLIT_VALUES)
                .map(|k| distinct[k * n / (MAX_SPLIT_VALUES + 1)])
                .collect();
            vals.dedup();
            vals
        };
        per_prop.push((property, splitvals));
    }

    // Keep the most diverse properties, then restore property order.
    per_prop.sort_by_key(|(property, splitvals)| (std::cmp::Reverse(splitvals.len()), *property));
    per_prop.truncate(options.splitting_heuristics_max_properties.max(1));
    per_prop.sort_by_key(|&(property, _)| property);
    per_prop
}

struct TreeBuilder<'a> {
    predictors: &'a [Predictor],
    props: &'a [Vec<i32>],
    residuals: &'a [Vec<i32>],
    candidates: &'a [(usize, Vec<i32>)],
    threshold: f32,
    fast_decode_multiplier: f32,
    nodes: Vec<TreeNode>,
    next_ctx: u32,
}

impl TreeBuilder<'_> {
    fn build(&mut self, indices: &[u32], depth: usize) -> usize {
        let (parent_cost, best_pred) = self.best_predictor(indices);

        // The split search scores candidates with the node's best predictor
        // only; each child re-picks its own predictor when it is built.
        let mut best_split: Option<(f32, usize, i32)> = None;
        if depth < MAX_TREE_DEPTH && indices.len() >= 2 {
            let residuals = &self.residuals[best_pred];
            for (property, splitvals) in self.candidates {
                for &splitval in splitvals {
                    let column = &self.props[*property];
                    let left = indices.iter().filter(|&&i| column[i as usize] > splitval);
                    let right = indices.iter().filter(|&&i| column[i as usize] <= splitval);
                    if left.clone().next().is_none() || right.clone().next().is_none() {
                        continue;
                    }
                    let left_cost = estimate_cost(left.map(|&i| residuals[i as usize]));
                    let right_cost = estimate_cost(right.map(|&i| residuals[i as usize]));
                    let gain = parent_cost - (left_cost + right_cost);
                    if best_split.map_or(true, |(best_gain, ..)| gain > best_gain) {
                        best_split = Some((gain, *property, splitval));
                    }
                }
            }
        }

        if let Some((gain, property, splitval)) = best_split {
            if gain > self.threshold {
                let idx = self.nodes.len();
                self.nodes.push(TreeNode {
                    property: property as i32,
                    splitval,
                    lchild: 0,
                    rchild: 0,
                    predictor: Predictor::Zero,
                    predictor_offset: 0,
                    multiplier: 1,
                });
                let (left, right) = partition(indices, &self.props[property], splitval);
                let lchild = self.build(&left, depth + 1);
                let rchild = self.build(&right, depth + 1);
                self.nodes[idx].lchild = lchild as u32;
                self.nodes[idx].rchild = rchild as u32;
                return idx;
            }
        }

        let idx = self.nodes.len();
        self.nodes
            .push(TreeNode::leaf(self.next_ctx, self.predictors[best_pred], 0, 1));
        self.next_ctx += 1;
        idx
    }

    fn best_predictor(&self, indices: &[u32]) -> (f32, usize) {
        let mut best = (f32::INFINITY, 0usize);
        for (i, residuals) in self.residuals.iter().enumerate() {
            let mut cost = estimate_cost(indices.iter().map(|&idx| residuals[idx as usize]));
            // The self-correcting predictor is the slowest to decode; its
            // estimated cost is inflated accordingly.
            if self.predictors[i] == Predictor::SelfCorrecting {
                cost *= self.fast_decode_multiplier;
            }
            if cost < best.0 {
                best = (cost, i);
            }
        }
        best
    }
}

fn partition(indices: &[u32], column: &[i32], splitval: i32) -> (Vec<u32>, Vec<u32>) {
    let mut left = Vec::new();
    let mut right = Vec::new();
    for &i in indices {
        if column[i as usize] > splitval {
            left.push(i);
        } else {
            right.push(i);
        }
    }
    (left, right)
}

/// Estimated code length of a residual set: Shannon entropy of the
/// hybrid-uint symbols plus their raw extra bits.
fn estimate_cost(residuals: impl Iterator<Item = i32>) -> f32 {
    let config = IntegerConfig::DEFAULT;
    let mut counts = [0u32; MAX_ALPHABET_SIZE];
    let mut extra_bits = 0u64;
    let mut total = 0u64;
    for residual in residuals {
        let (symbol, n, _) = config.split_value(pack_signed(residual));
        counts[symbol as usize] += 1;
        extra_bits += n as u64;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    let mut entropy = 0.0f64;
    for &count in counts.iter().filter(|&&c| c != 0) {
        entropy += count as f64 * (total as f64 / count as f64).log2();
    }
    (entropy + extra_bits as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift_is_deterministic() {
        let mut a = XorShift128Plus::new();
        let mut b = XorShift128Plus::new();
        for _ in 0..1000 {
            assert_eq!(a.next(), b.next());
        }
    }

    #[test]
    fn no_samples_yields_single_leaf() {
        let samples = TreeSamples::new(vec![Predictor::West], NUM_NONREF_PROPERTIES);
        let tree = learn_tree(samples, &ModularOptions::default()).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.nodes()[0].predictor, Predictor::West);
        assert_eq!(tree.nodes()[0].multiplier, 1);
    }

    #[test]
    fn force_no_wp_rejects_lone_self_correcting() {
        let samples =
            TreeSamples::new(vec![Predictor::SelfCorrecting], NUM_NONREF_PROPERTIES);
        let options = ModularOptions {
            force_no_wp: true,
            ..Default::default()
        };
        assert!(learn_tree(samples, &options).is_err());
    }

    #[test]
    fn splits_on_discriminating_property() {
        // Residuals of the only predictor are large where property 9 is
        // positive and zero elsewhere; the learner should split on it.
        let mut samples = TreeSamples::new(vec![Predictor::Zero], NUM_NONREF_PROPERTIES);
        let mut rng = XorShift128Plus::new();
        for i in 0..2048 {
            let flag = i % 2 == 0;
            for (property, column) in samples.props.iter_mut().enumerate() {
                column.push(if property == 9 {
                    if flag {
                        5
                    } else {
                        -5
                    }
                } else {
                    0
                });
            }
            let noise = (rng.next() % 200) as i32 - 100;
            samples.residuals[0].push(if flag { 1000 + noise } else { 0 });
        }
        samples.total_pixels = 2048;

        let options = ModularOptions {
            nb_repeats: 1.0,
            ..Default::default()
        };
        let tree = learn_tree(samples, &options).unwrap();
        assert!(tree.len() >= 3);
        assert_eq!(tree.nodes()[0].property, 9);

        // Determinism: learning twice from identical samples gives the same
        // tree.
        let mut samples = TreeSamples::new(vec![Predictor::Zero], NUM_NONREF_PROPERTIES);
        let mut rng = XorShift128Plus::new();
        for i in 0..2048 {
            let flag = i % 2 == 0;
            for (property, column) in samples.props.iter_mut().enumerate() {
                column.push(if property == 9 {
                    if flag {
                        5
                    } else {
                        -5
                    }
                } else {
                    0
                });
            }
            let noise = (rng.next() % 200) as i32 - 100;
            samples.residuals[0].push(if flag { 1000 + noise } else { 0 });
        }
        samples.total_pixels = 2048;
        let tree2 = learn_tree(samples, &options).unwrap();
        assert_eq!(tree, tree2);
    }
}
