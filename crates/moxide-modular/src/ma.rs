use std::collections::VecDeque;

use moxide_bitstream::{pack_signed, unpack_signed, Bitstream};
use moxide_coding::{Decoder, Encoder};

use crate::predictor::Predictor;
use crate::property::Properties;
use crate::{Result, NUM_STATIC_PROPERTIES, WP_PROP, WP_PROP_RANGE};

/// One node of the authoring tree.
///
/// `property == -1` marks a leaf; a leaf's `lchild` holds its raw context id,
/// assigned in pre-order by the learner and the tree parser alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeNode {
    pub property: i32,
    pub splitval: i32,
    pub lchild: u32,
    pub rchild: u32,
    pub predictor: Predictor,
    pub predictor_offset: i32,
    pub multiplier: u32,
}

impl TreeNode {
    pub fn leaf(ctx: u32, predictor: Predictor, predictor_offset: i32, multiplier: u32) -> Self {
        Self {
            property: -1,
            splitval: 0,
            lchild: ctx,
            rchild: 0,
            predictor,
            predictor_offset,
            multiplier,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.property < 0
    }
}

/// The meta-adaptive decision tree, in authoring form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    nodes: Vec<TreeNode>,
}

impl Tree {
    pub fn new(nodes: Vec<TreeNode>) -> Self {
        Self { nodes }
    }

    #[inline]
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of entropy contexts the data stream uses: one per leaf.
    #[inline]
    pub fn num_contexts(&self) -> u32 {
        (self.nodes.len() as u32 + 1) / 2
    }

    pub fn depth(&self) -> usize {
        let mut max_depth = 0;
        let mut stack = vec![(0usize, 1usize)];
        while let Some((idx, depth)) = stack.pop() {
            let node = &self.nodes[idx];
            if node.is_leaf() {
                max_depth = max_depth.max(depth);
            } else {
                stack.push((node.lchild as usize, depth + 1));
                stack.push((node.rchild as usize, depth + 1));
            }
        }
        max_depth
    }

    /// Naive descent; the flat tree is the fast path, this is the reference.
    pub fn lookup(&self, props: &Properties) -> &TreeNode {
        let mut node = &self.nodes[0];
        while !node.is_leaf() {
            node = if props.get(node.property as usize) > node.splitval {
                &self.nodes[node.lchild as usize]
            } else {
                &self.nodes[node.rchild as usize]
            };
        }
        node
    }

    /// Emits the tree as tokens, pre-order.
    pub fn tokenize(&self, encoder: &mut Encoder) {
        let mut next_ctx = 0u32;
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if node.is_leaf() {
                encoder.emit_token(1, 0);
                encoder.emit_token(2, node.predictor as u32);
                encoder.emit_token(3, pack_signed(node.predictor_offset));
                let mul_log = node.multiplier.trailing_zeros();
                encoder.emit_token(4, mul_log);
                encoder.emit_token(5, (node.multiplier >> mul_log) - 1);
                debug_assert_eq!(node.lchild, next_ctx);
                next_ctx += 1;
            } else {
                encoder.emit_token(1, node.property as u32 + 1);
                encoder.emit_token(0, pack_signed(node.splitval));
                stack.push(node.rchild as usize);
                stack.push(node.lchild as usize);
            }
        }
    }

    /// Reads a tree from its token stream.
    ///
    /// `node_limit` bounds the node count against hostile streams, on top of
    /// the hard cap of 2^26 nodes.
    pub fn parse(decoder: &mut Decoder, bitstream: &mut Bitstream, node_limit: usize) -> Result<Self> {
        let mut nodes: Vec<TreeNode> = Vec::new();
        let mut next_ctx = 0u32;
        let mut pending: Vec<Option<(usize, bool)>> = vec![None];

        while let Some(slot) = pending.pop() {
            if nodes.len() >= node_limit || nodes.len() >= (1 << 26) {
                tracing::error!(node_limit, "decoded MA tree too large");
                return Err(crate::Error::InvalidMaTree);
            }

            let idx = nodes.len();
            let property = decoder.read_varint(bitstream, 1)?;
            let node = if let Some(property) = property.checked_sub(1) {
                if property > 1 << 16 {
                    return Err(crate::Error::InvalidMaTree);
                }
                let splitval = unpack_signed(decoder.read_varint(bitstream, 0)?);
                pending.push(Some((idx, false)));
                pending.push(Some((idx, true)));
                TreeNode {
                    property: property as i32,
                    splitval,
                    lchild: 0,
                    rchild: 0,
                    predictor: Predictor::Zero,
                    predictor_offset: 0,
                    multiplier: 1,
                }
            } else {
                let predictor = Predictor::try_from(decoder.read_varint(bitstream, 2)?)?;
                let offset = unpack_signed(decoder.read_varint(bitstream, 3)?);
                let mul_log = decoder.read_varint(bitstream, 4)?;
                if mul_log > 30 {
                    return Err(crate::Error::InvalidMaTree);
                }
                let mul_bits = decoder.read_varint(bitstream, 5)?;
                if mul_bits > (1 << (31 - mul_log)) - 2 {
                    return Err(crate::Error::InvalidMaTree);
                }
                let node = TreeNode::leaf(next_ctx, predictor, offset, (mul_bits + 1) << mul_log);
                next_ctx += 1;
                node
            };
            nodes.push(node);

            if let Some((parent, is_left)) = slot {
                if is_left {
                    nodes[parent].lchild = idx as u32;
                } else {
                    nodes[parent].rchild = idx as u32;
                }
            }
        }

        Ok(Self { nodes })
    }
}

/// One node of the flat tree: two decision levels folded together, plus the
/// index of its four grand-children.
///
/// `property0 == -1` marks a leaf; its `child_id` is the context id (raw on
/// encode, remapped to a cluster id on decode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatNode {
    pub property0: i32,
    pub splitval0: i32,
    pub properties: [i32; 2],
    pub splitvals: [i32; 2],
    pub child_id: u32,
    pub predictor: Predictor,
    pub predictor_offset: i32,
    pub multiplier: u32,
}

impl FlatNode {
    fn leaf(node: &TreeNode) -> Self {
        Self {
            property0: -1,
            splitval0: 0,
            properties: [0; 2],
            splitvals: [0; 2],
            child_id: node.lchild,
            predictor: node.predictor,
            predictor_offset: node.predictor_offset,
            multiplier: node.multiplier,
        }
    }
}

/// The decode-optimized form of the MA tree, specialized for one channel's
/// static properties.
#[derive(Debug)]
pub struct FlatTree {
    nodes: Vec<FlatNode>,
    num_props: usize,
    use_wp: bool,
    wp_only: bool,
}

impl FlatTree {
    #[inline]
    pub fn nodes(&self) -> &[FlatNode] {
        &self.nodes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Size of the property vector this tree needs.
    #[inline]
    pub fn num_props(&self) -> usize {
        self.num_props
    }

    /// Whether the tree references the self-correcting predictor or its
    /// property anywhere.
    #[inline]
    pub fn use_wp(&self) -> bool {
        self.use_wp
    }

    /// Whether decisions use only the WP property and every leaf predicts
    /// with the self-correcting predictor.
    #[inline]
    pub fn wp_only(&self) -> bool {
        self.wp_only
    }

    /// Replaces raw context ids with clustered ids, once, before decoding.
    pub fn remap_contexts(&mut self, cluster_map: &[u8]) {
        for node in &mut self.nodes {
            if node.property0 < 0 {
                node.child_id = cluster_map[node.child_id as usize] as u32;
            }
        }
    }

    /// Descends the flat tree: the top decision picks the pair, the folded
    /// child decision picks within it.
    pub fn lookup(&self, props: &Properties) -> &FlatNode {
        let mut node = &self.nodes[0];
        while node.property0 >= 0 {
            let side = if props.get(node.property0 as usize) > node.splitval0 {
                0
            } else {
                1
            };
            let sub = if props.get(node.properties[side] as usize) > node.splitvals[side] {
                0
            } else {
                1
            };
            let idx = node.child_id as usize + (side << 1) + sub;
            node = &self.nodes[idx];
        }
        node
    }
}

/// Specializes the authoring tree for fixed static properties (channel index
/// and group id), folding two levels into each flat node.
///
/// Decisions on static properties are resolved here and disappear from the
/// output. When an inner node's child is already a leaf, a dummy decision is
/// recorded and the leaf occupies both grand-child slots.
pub fn filter_tree(tree: &Tree, static_props: [i32; NUM_STATIC_PROPERTIES]) -> FlatTree {
    let nodes = tree.nodes();
    let skip_static = |mut cur: usize| {
        while !nodes[cur].is_leaf() && (nodes[cur].property as usize) < NUM_STATIC_PROPERTIES {
            cur = if static_props[nodes[cur].property as usize] > nodes[cur].splitval {
                nodes[cur].lchild as usize
            } else {
                nodes[cur].rchild as usize
            };
        }
        cur
    };

    let mut use_wp = false;
    let mut wp_only = true;
    let mut num_props = 0usize;
    let mut used_wp_prop = false;
    let mut used_other_prop = false;
    let mut mark_used = |property: i32| {
        if property as usize >= NUM_STATIC_PROPERTIES {
            if property as usize == WP_PROP {
                used_wp_prop = true;
            } else {
                used_other_prop = true;
            }
        }
    };

    let mut output = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(0usize);
    while let Some(front) = queue.pop_front() {
        let cur = skip_static(front);
        let node = &nodes[cur];
        if node.is_leaf() {
            if node.predictor == Predictor::SelfCorrecting {
                use_wp = true;
            } else {
                wp_only = false;
            }
            output.push(FlatNode::leaf(node));
            continue;
        }

        let mut flat = FlatNode {
            property0: node.property,
            splitval0: node.splitval,
            properties: [0; 2],
            splitvals: [0; 2],
            child_id: (output.len() + queue.len() + 1) as u32,
            predictor: Predictor::Zero,
            predictor_offset: 0,
            multiplier: 1,
        };
        num_props = num_props.max(node.property as usize + 1);
        mark_used(node.property);

        for (i, &child) in [node.lchild, node.rchild].iter().enumerate() {
            let cur_child = skip_static(child as usize);
            let child_node = &nodes[cur_child];
            if child_node.is_leaf() {
                // Dummy decision; the leaf fills both grand-child slots.
                flat.properties[i] = 0;
                flat.splitvals[i] = 0;
                queue.push_back(cur_child);
                queue.push_back(cur_child);
            } else {
                flat.properties[i] = child_node.property;
                flat.splitvals[i] = child_node.splitval;
                queue.push_back(child_node.lchild as usize);
                queue.push_back(child_node.rchild as usize);
                num_props = num_props.max(child_node.property as usize + 1);
                mark_used(child_node.property);
            }
        }

        output.push(flat);
    }

    if num_props > crate::NUM_NONREF_PROPERTIES {
        let extra = num_props - crate::NUM_NONREF_PROPERTIES;
        num_props = extra.div_ceil(crate::EXTRA_PROPS_PER_CHANNEL)
            * crate::EXTRA_PROPS_PER_CHANNEL
            + crate::NUM_NONREF_PROPERTIES;
    } else {
        num_props = crate::NUM_NONREF_PROPERTIES;
    }
    if used_wp_prop {
        use_wp = true;
    }
    if !used_wp_prop || used_other_prop {
        wp_only = false;
    }

    FlatTree {
        nodes: output,
        num_props,
        use_wp,
        wp_only,
    }
}

/// Per-property-value lookup table for WP-only trees.
pub struct WpLookup {
    pub context: Box<[u32; 2 * WP_PROP_RANGE as usize]>,
    pub multiplier: Box<[u32; 2 * WP_PROP_RANGE as usize]>,
    pub offset: Box<[i32; 2 * WP_PROP_RANGE as usize]>,
}

/// Walks the decision regions of a WP-only flat tree as half-open intervals
/// and bakes them into a table indexed by the clamped WP property.
///
/// Returns `None` when any region escapes the representable range or a leaf
/// is unsuitable; the caller then falls back to the general path instead of
/// rejecting the stream. With `require_trivial_leaves` (encode side), leaves
/// must have multiplier 1 and offset 0.
pub fn build_wp_lookup(flat: &FlatTree, require_trivial_leaves: bool) -> Option<WpLookup> {
    const RANGE: i32 = WP_PROP_RANGE;

    // Begin *excluded*, end *included*; matches > vs <= decisions.
    struct TreeRange {
        begin: i32,
        end: i32,
        pos: usize,
    }

    let mut context = Box::new([0u32; 2 * RANGE as usize]);
    let mut multiplier = Box::new([0u32; 2 * RANGE as usize]);
    let mut offset = Box::new([0i32; 2 * RANGE as usize]);

    let mut ranges = vec![TreeRange {
        begin: -RANGE - 1,
        end: RANGE - 1,
        pos: 0,
    }];
    while let Some(cur) = ranges.pop() {
        if cur.begin < -RANGE - 1 || cur.begin >= RANGE - 1 || cur.end > RANGE - 1 {
            return None;
        }
        let node = &flat.nodes()[cur.pos];
        if node.property0 < 0 {
            if node.predictor_offset < i8::MIN as i32 || node.predictor_offset > i8::MAX as i32 {
                return None;
            }
            if require_trivial_leaves && (node.multiplier != 1 || node.predictor_offset != 0) {
                return None;
            }
            for i in cur.begin + 1..=cur.end {
                let pos = (i + RANGE) as usize;
                context[pos] = node.child_id;
                multiplier[pos] = node.multiplier;
                offset[pos] = node.predictor_offset;
            }
            continue;
        }

        let child_id = node.child_id as usize;
        // > side of the top decision.
        if node.properties[0] as usize >= NUM_STATIC_PROPERTIES {
            ranges.push(TreeRange {
                begin: node.splitvals[0],
                end: cur.end,
                pos: child_id,
            });
            ranges.push(TreeRange {
                begin: node.splitval0,
                end: node.splitvals[0],
                pos: child_id + 1,
            });
        } else {
            ranges.push(TreeRange {
                begin: node.splitval0,
                end: cur.end,
                pos: child_id,
            });
        }
        // <= side.
        if node.properties[1] as usize >= NUM_STATIC_PROPERTIES {
            ranges.push(TreeRange {
                begin: node.splitvals[1],
                end: node.splitval0,
                pos: child_id + 2,
            });
            ranges.push(TreeRange {
                begin: cur.begin,
                end: node.splitvals[1],
                pos: child_id + 3,
            });
        } else {
            ranges.push(TreeRange {
                begin: cur.begin,
                end: node.splitval0,
                pos: child_id + 2,
            });
        }
    }

    Some(WpLookup {
        context,
        multiplier,
        offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use moxide_bitstream::BitWriter;

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

    fn props_with(values: &[(usize, i32)]) -> Properties {
        let mut props = Properties::new(32);
        for &(property, value) in values {
            props.set(property, value);
        }
        props
    }

    #[test]
    fn static_decisions_are_resolved() {
        // channel > 0 ? leaf A : (group > 1 ? leaf B : leaf C)
        let tree = Tree::new(vec![
            decision(0, 0, 1, 2),
            TreeNode::leaf(0, Predictor::West, 0, 1),
            decision(1, 1, 3, 4),
            TreeNode::leaf(1, Predictor::North, 0, 1),
            TreeNode::leaf(2, Predictor::Gradient, 0, 1),
        ]);

        let flat = filter_tree(&tree, [1, 0]);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat.nodes()[0].predictor, Predictor::West);
        assert_eq!(flat.nodes()[0].child_id, 0);

        let flat = filter_tree(&tree, [0, 2]);
        assert_eq!(flat.nodes()[0].predictor, Predictor::North);

        let flat = filter_tree(&tree, [0, 0]);
        assert_eq!(flat.nodes()[0].predictor, Predictor::Gradient);
        assert!(!flat.use_wp());
        assert!(!flat.wp_only());
    }

    #[test]
    fn flat_lookup_matches_naive_descent() {
        // A three-level tree over non-static properties.
        let tree = Tree::new(vec![
            decision(9, 0, 1, 2),
            decision(7, -3, 3, 4),
            decision(6, 5, 5, 6),
            TreeNode::leaf(0, Predictor::West, 0, 1),
            TreeNode::leaf(1, Predictor::North, 1, 1),
            TreeNode::leaf(2, Predictor::Gradient, -1, 1),
            decision(10, 2, 7, 8),
            TreeNode::leaf(3, Predictor::Zero, 0, 1),
            TreeNode::leaf(4, Predictor::Select, 0, 2),
        ]);
        let static_props = [0, 0];
        let flat = filter_tree(&tree, static_props);

        for p9 in [-5, 0, 1] {
            for p7 in [-10, -3, 0] {
                for p6 in [4, 5, 9] {
                    for p10 in [0, 2, 3] {
                        let props =
                            props_with(&[(9, p9), (7, p7), (6, p6), (10, p10)]);
                        let naive = tree.lookup(&props);
                        let fast = flat.lookup(&props);
                        assert_eq!(fast.child_id, naive.lchild);
                        assert_eq!(fast.predictor, naive.predictor);
                        assert_eq!(fast.predictor_offset, naive.predictor_offset);
                        assert_eq!(fast.multiplier, naive.multiplier);
                    }
                }
            }
        }
    }

    #[test]
    fn num_props_is_rounded_for_reference_channels() {
        let tree = Tree::new(vec![
            decision(17, 0, 1, 2),
            TreeNode::leaf(0, Predictor::West, 0, 1),
            TreeNode::leaf(1, Predictor::North, 0, 1),
        ]);
        let flat = filter_tree(&tree, [0, 0]);
        // Property 17 is the second slot of the first reference channel.
        assert_eq!(flat.num_props(), 20);

        let tree = Tree::new(vec![
            decision(9, 0, 1, 2),
            TreeNode::leaf(0, Predictor::West, 0, 1),
            TreeNode::leaf(1, Predictor::North, 0, 1),
        ]);
        let flat = filter_tree(&tree, [0, 0]);
        assert_eq!(flat.num_props(), 16);
    }

    #[test]
    fn wp_only_detection() {
        let wp_tree = Tree::new(vec![
            decision(WP_PROP as i32, 0, 1, 2),
            TreeNode::leaf(0, Predictor::SelfCorrecting, 0, 1),
            TreeNode::leaf(1, Predictor::SelfCorrecting, 0, 1),
        ]);
        let flat = filter_tree(&wp_tree, [0, 0]);
        assert!(flat.wp_only());
        assert!(flat.use_wp());

        // A non-WP decision property disables the fast path.
        let mixed = Tree::new(vec![
            decision(WP_PROP as i32, 0, 1, 2),
            TreeNode::leaf(0, Predictor::SelfCorrecting, 0, 1),
            decision(9, 0, 3, 4),
            TreeNode::leaf(1, Predictor::SelfCorrecting, 0, 1),
            TreeNode::leaf(2, Predictor::SelfCorrecting, 0, 1),
        ]);
        let flat = filter_tree(&mixed, [0, 0]);
        assert!(!flat.wp_only());
        assert!(flat.use_wp());

        // A single leaf is not WP-only (there is no decision to specialize).
        let single = Tree::new(vec![TreeNode::leaf(0, Predictor::SelfCorrecting, 0, 1)]);
        let flat = filter_tree(&single, [0, 0]);
        assert!(!flat.wp_only());
        assert!(flat.use_wp());
    }

    #[test]
    fn wp_lookup_matches_tree_regions() {
        let tree = Tree::new(vec![
            decision(WP_PROP as i32, 0, 1, 2),
            decision(WP_PROP as i32, 100, 3, 4),
            decision(WP_PROP as i32, -200, 5, 6),
            TreeNode::leaf(0, Predictor::SelfCorrecting, 0, 1),
            TreeNode::leaf(1, Predictor::SelfCorrecting, 0, 1),
            TreeNode::leaf(2, Predictor::SelfCorrecting, 0, 1),
            TreeNode::leaf(3, Predictor::SelfCorrecting, 0, 1),
        ]);
        let flat = filter_tree(&tree, [0, 0]);
        assert!(flat.wp_only());
        let lookup = build_wp_lookup(&flat, true).unwrap();

        for value in -WP_PROP_RANGE..WP_PROP_RANGE {
            let props = props_with(&[(WP_PROP, value)]);
            let leaf = flat.lookup(&props);
            let pos = (value + WP_PROP_RANGE) as usize;
            assert_eq!(lookup.context[pos], leaf.child_id, "value {}", value);
            assert_eq!(lookup.multiplier[pos], leaf.multiplier);
            assert_eq!(lookup.offset[pos], leaf.predictor_offset);
        }
    }

    #[test]
    fn out_of_range_split_disables_wp_lookup() {
        let tree = Tree::new(vec![
            decision(WP_PROP as i32, 600, 1, 2),
            TreeNode::leaf(0, Predictor::SelfCorrecting, 0, 1),
            TreeNode::leaf(1, Predictor::SelfCorrecting, 0, 1),
        ]);
        let flat = filter_tree(&tree, [0, 0]);
        assert!(flat.wp_only());
        assert!(build_wp_lookup(&flat, true).is_none());
    }

    #[test]
    fn tokenize_parse_roundtrip() {
        let tree = Tree::new(vec![
            decision(9, -4, 1, 2),
            TreeNode::leaf(0, Predictor::Gradient, 3, 1),
            decision(15, 17, 3, 4),
            TreeNode::leaf(1, Predictor::SelfCorrecting, 0, 1),
            TreeNode::leaf(2, Predictor::Zero, -7, 6),
        ]);

        let mut encoder = Encoder::new(crate::NUM_TREE_CONTEXTS);
        tree.tokenize(&mut encoder);
        let mut writer = BitWriter::new();
        encoder.write_section(&mut writer).unwrap();
        let bytes = writer.finalize();

        let mut bitstream = Bitstream::new(&bytes);
        let mut decoder = Decoder::parse(&mut bitstream, crate::NUM_TREE_CONTEXTS).unwrap();
        decoder.begin().unwrap();
        let parsed = Tree::parse(&mut decoder, &mut bitstream, 1 << 20).unwrap();
        decoder.finalize().unwrap();
        assert_eq!(parsed, tree);
        assert_eq!(parsed.depth(), 3);
        assert_eq!(parsed.num_contexts(), 3);
    }
}
