use moxide::image::{Channel, Image};
use moxide::{
    coding, gather_tree_data, modular_collect_tokens, modular_decode, modular_encode,
    modular_encode_with_global_tree, pack_signed, BitWriter, Bitstream, Error, MaConfig,
    ModularOptions, Predictor, PredictorChoice, Tree, TreeNode, TreeSamples, WpHeader,
};

fn single_channel_image(width: usize, height: usize, pixels: &[i32], maxval: i32) -> Image {
    let mut image = Image::new(maxval);
    let mut channel = Channel::new(width, height);
    channel.grid_mut().buf_mut().copy_from_slice(pixels);
    image.channels.push(channel);
    image
}

fn empty_like(image: &Image) -> Image {
    let mut out = Image::new(image.maxval);
    for channel in &image.channels {
        out.channels.push(Channel::with_shift(
            channel.width(),
            channel.height(),
            channel.hshift(),
            channel.vshift(),
        ));
    }
    out.nb_meta_channels = image.nb_meta_channels;
    out
}

fn encode(image: &Image, options: &ModularOptions) -> Vec<u8> {
    let mut writer = BitWriter::new();
    modular_encode(image, options, &mut writer, 0).unwrap();
    writer.finalize()
}

fn roundtrip(image: &Image, options: &ModularOptions) -> Vec<u8> {
    let bytes = encode(image, options);
    let mut decoded = empty_like(image);
    let mut bitstream = Bitstream::new(&bytes);
    modular_decode(&mut bitstream, &mut decoded, 0, options, None).unwrap();
    for &chan in &image.coded_channel_ids(options) {
        assert_eq!(
            decoded.channels[chan].grid(),
            image.channels[chan].grid(),
            "channel {chan} mismatch"
        );
    }
    bytes
}

struct TestRng(u64);

impl TestRng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn zero_channel_collapses_to_single_value() {
    let image = single_channel_image(4, 4, &[0; 16], 255);
    let options = ModularOptions {
        predictor: PredictorChoice::Fixed(Predictor::Zero),
        nb_repeats: 0.0,
        ..Default::default()
    };
    roundtrip(&image, &options);

    // Per-pixel token check against a hand-built single-leaf Zero tree: 16
    // tokens, all context 0 symbol 0.
    let tree = Tree::new(vec![TreeNode::leaf(0, Predictor::Zero, 0, 1)]);
    let mut sink = coding::Encoder::new(tree.num_contexts());
    modular_collect_tokens(&image, &options, 0, &tree, &mut sink).unwrap();
    assert_eq!(sink.num_tokens(), 16);
    assert!(sink
        .tokens()
        .iter()
        .all(|token| token.context == 0 && token.value == 0));
}

#[test]
fn west_predictor_ramp() {
    let image = single_channel_image(8, 1, &[0, 1, 2, 3, 4, 5, 6, 7], 255);
    let options = ModularOptions {
        predictor: PredictorChoice::Fixed(Predictor::West),
        nb_repeats: 0.0,
        ..Default::default()
    };
    roundtrip(&image, &options);

    let tree = Tree::new(vec![TreeNode::leaf(0, Predictor::West, 0, 1)]);
    let mut sink = coding::Encoder::new(tree.num_contexts());
    modular_collect_tokens(&image, &options, 0, &tree, &mut sink).unwrap();
    let values: Vec<u32> = sink.tokens().iter().map(|token| token.value).collect();
    let expected: Vec<u32> = [0, 1, 1, 1, 1, 1, 1, 1]
        .into_iter()
        .map(pack_signed)
        .collect();
    assert_eq!(values, expected);
}

#[test]
fn gradient_predictor_column() {
    let image = single_channel_image(1, 4, &[10, 10, 12, 9], 255);
    let options = ModularOptions {
        predictor: PredictorChoice::Fixed(Predictor::Gradient),
        nb_repeats: 0.0,
        ..Default::default()
    };
    roundtrip(&image, &options);

    let tree = Tree::new(vec![TreeNode::leaf(0, Predictor::Gradient, 0, 1)]);
    let mut sink = coding::Encoder::new(tree.num_contexts());
    modular_collect_tokens(&image, &options, 0, &tree, &mut sink).unwrap();
    let values: Vec<u32> = sink.tokens().iter().map(|token| token.value).collect();
    let expected: Vec<u32> = [10, 0, 2, -3].into_iter().map(pack_signed).collect();
    assert_eq!(values, expected);
}

#[test]
fn wp_only_two_channel_image() {
    let mut image = Image::new(255);
    for seed in [11u64, 23] {
        let mut rng = TestRng(seed);
        let mut channel = Channel::new(4, 4);
        for v in channel.grid_mut().buf_mut() {
            *v = (rng.next() % 17) as i32 * 3;
        }
        image.channels.push(channel);
    }
    let options = ModularOptions {
        predictor: PredictorChoice::Fixed(Predictor::SelfCorrecting),
        force_wp_only: true,
        nb_repeats: 1.0,
        ..Default::default()
    };
    roundtrip(&image, &options);
}

#[test]
fn random_image_variable_predictors_is_deterministic() {
    let mut rng = TestRng(0x9e3779b97f4a7c15);
    let pixels: Vec<i32> = (0..32 * 32).map(|_| (rng.next() & 0xff) as i32).collect();
    let image = single_channel_image(32, 32, &pixels, 255);
    let options = ModularOptions {
        predictor: PredictorChoice::Variable,
        nb_repeats: 1.0,
        ..Default::default()
    };
    let first = roundtrip(&image, &options);
    let second = encode(&image, &options);
    assert_eq!(first, second);
}

#[test]
fn smooth_image_with_learning() {
    let pixels: Vec<i32> = (0..24 * 24)
        .map(|i| {
            let x = (i % 24) as i32;
            let y = (i / 24) as i32;
            x * 3 + y * 2 + ((x * y) % 5)
        })
        .collect();
    let image = single_channel_image(24, 24, &pixels, 255);
    let options = ModularOptions {
        predictor: PredictorChoice::Best,
        nb_repeats: 1.0,
        ..Default::default()
    };
    roundtrip(&image, &options);
}

#[test]
fn reference_channel_properties() {
    let mut image = Image::new(255);
    let mut rng = TestRng(0xdeadbeef);
    let base: Vec<i32> = (0..16 * 8).map(|_| (rng.next() % 200) as i32).collect();
    for delta in [0i32, 1, 2] {
        let mut channel = Channel::new(16, 8);
        for (v, &b) in channel.grid_mut().buf_mut().iter_mut().zip(&base) {
            *v = b + delta;
        }
        image.channels.push(channel);
    }
    let options = ModularOptions {
        predictor: PredictorChoice::Variable,
        max_properties: 2,
        nb_repeats: 1.0,
        ..Default::default()
    };
    roundtrip(&image, &options);
}

#[test]
fn force_no_wp_drops_self_correcting() {
    let mut rng = TestRng(77);
    let pixels: Vec<i32> = (0..16 * 16).map(|_| (rng.next() % 100) as i32).collect();
    let image = single_channel_image(16, 16, &pixels, 255);
    let options = ModularOptions {
        predictor: PredictorChoice::Variable,
        force_no_wp: true,
        nb_repeats: 1.0,
        ..Default::default()
    };
    roundtrip(&image, &options);
}

#[test]
fn force_no_wp_with_only_self_correcting_is_an_error() {
    let image = single_channel_image(4, 4, &[1; 16], 255);
    let options = ModularOptions {
        predictor: PredictorChoice::Fixed(Predictor::SelfCorrecting),
        force_no_wp: true,
        nb_repeats: 1.0,
        ..Default::default()
    };
    let mut writer = BitWriter::new();
    let result = modular_encode(&image, &options, &mut writer, 0);
    assert!(matches!(result, Err(Error::InvalidOptions(_))));
}

#[test]
fn channel_iteration_stops_and_decoder_agrees() {
    let mut rng = TestRng(4242);
    let mut image = Image::new(255);
    let mut meta = Channel::new(2, 2);
    for v in meta.grid_mut().buf_mut() {
        *v = (rng.next() % 10) as i32;
    }
    image.channels.push(meta);
    let mut small = Channel::new(4, 4);
    for v in small.grid_mut().buf_mut() {
        *v = (rng.next() % 10) as i32;
    }
    image.channels.push(small);
    let mut oversized = Channel::new(40, 4);
    for v in oversized.grid_mut().buf_mut() {
        *v = (rng.next() % 10) as i32;
    }
    image.channels.push(oversized);
    let mut trailing = Channel::new(4, 4);
    for v in trailing.grid_mut().buf_mut() {
        *v = (rng.next() % 10) as i32;
    }
    image.channels.push(trailing);
    image.nb_meta_channels = 1;

    let options = ModularOptions {
        predictor: PredictorChoice::Fixed(Predictor::Gradient),
        max_chan_size: 16,
        nb_repeats: 0.5,
        ..Default::default()
    };
    assert_eq!(image.coded_channel_ids(&options), vec![0, 1]);

    let bytes = encode(&image, &options);
    let mut decoded = empty_like(&image);
    let mut bitstream = Bitstream::new(&bytes);
    modular_decode(&mut bitstream, &mut decoded, 0, &options, None).unwrap();

    assert_eq!(decoded.channels[0].grid(), image.channels[0].grid());
    assert_eq!(decoded.channels[1].grid(), image.channels[1].grid());
    // Iteration stopped: the oversized channel and everything after it stay
    // untouched.
    assert!(decoded.channels[2].grid().buf().iter().all(|&v| v == 0));
    assert!(decoded.channels[3].grid().buf().iter().all(|&v| v == 0));
}

#[test]
fn transforms_roundtrip_and_identify_stops_early() {
    let mut image = single_channel_image(4, 4, &[5; 16], 255);
    image.transform = vec![
        moxide::TransformInfo::Rct {
            begin_c: 0,
            rct_type: 6,
        },
        moxide::TransformInfo::Squeeze {
            horizontal: true,
            in_place: false,
            begin_c: 0,
            num_c: 1,
        },
    ];
    let options = ModularOptions {
        nb_repeats: 0.0,
        ..Default::default()
    };
    let bytes = encode(&image, &options);

    let mut decoded = empty_like(&image);
    let mut bitstream = Bitstream::new(&bytes);
    modular_decode(&mut bitstream, &mut decoded, 0, &options, None).unwrap();
    assert_eq!(decoded.transform, image.transform);
    assert_eq!(decoded.channels[0].grid(), image.channels[0].grid());

    let identify = ModularOptions {
        identify: true,
        ..options
    };
    let mut decoded = empty_like(&image);
    let mut bitstream = Bitstream::new(&bytes);
    modular_decode(&mut bitstream, &mut decoded, 0, &identify, None).unwrap();
    assert_eq!(decoded.transform, image.transform);
    assert!(decoded.channels[0].grid().buf().iter().all(|&v| v == 0));
}

#[test]
fn global_tree_mode() {
    let mut rng = TestRng(31337);
    let pixels: Vec<i32> = (0..16 * 16).map(|_| (rng.next() % 64) as i32).collect();
    let image = single_channel_image(16, 16, &pixels, 255);
    let options = ModularOptions {
        nb_repeats: 1.0,
        ..Default::default()
    };

    // The caller learns a tree and builds one entropy code over all groups
    // (here: one group).
    let mut samples = TreeSamples::new(vec![Predictor::Gradient], 16);
    for &chan in &image.coded_channel_ids(&options) {
        gather_tree_data(&image, chan, 0, &WpHeader::default(), &options, &mut samples);
    }
    let tree = moxide::learn_tree(samples, &options).unwrap();

    let mut sink = coding::Encoder::new(tree.num_contexts());
    modular_collect_tokens(&image, &options, 0, &tree, &mut sink).unwrap();
    let code = sink.build_code();

    let mut writer = BitWriter::new();
    modular_encode_with_global_tree(&image, &options, &mut writer, 0, &tree, &code).unwrap();
    let bytes = writer.finalize();

    let config = MaConfig {
        tree: tree.clone(),
        code,
    };
    let mut decoded = empty_like(&image);
    let mut bitstream = Bitstream::new(&bytes);
    modular_decode(&mut bitstream, &mut decoded, 0, &options, Some(&config)).unwrap();
    assert_eq!(decoded.channels[0].grid(), image.channels[0].grid());

    // The same stream without the global config is an error.
    let mut decoded = empty_like(&image);
    let mut bitstream = Bitstream::new(&bytes);
    let result = modular_decode(&mut bitstream, &mut decoded, 0, &options, None);
    assert!(matches!(result, Err(Error::GlobalMaTreeNotAvailable)));
}

#[test]
fn truncated_stream_is_rejected() {
    let mut rng = TestRng(999);
    let pixels: Vec<i32> = (0..16 * 16).map(|_| (rng.next() % 256) as i32).collect();
    let image = single_channel_image(16, 16, &pixels, 255);
    let options = ModularOptions {
        nb_repeats: 1.0,
        ..Default::default()
    };
    let bytes = roundtrip(&image, &options);

    let truncated = &bytes[..bytes.len() / 2];
    let mut decoded = empty_like(&image);
    let mut bitstream = Bitstream::new(truncated);
    assert!(modular_decode(&mut bitstream, &mut decoded, 0, &options, None).is_err());
}

#[test]
fn corrupted_stream_is_never_silently_accepted() {
    let mut rng = TestRng(1234);
    let pixels: Vec<i32> = (0..16 * 16).map(|_| (rng.next() % 256) as i32).collect();
    let image = single_channel_image(16, 16, &pixels, 255);
    let options = ModularOptions {
        nb_repeats: 1.0,
        ..Default::default()
    };
    let bytes = roundtrip(&image, &options);

    // Flip one bit at a few positions across the stream (tree section, data
    // section, blob). Each corruption must either fail to decode or produce
    // different pixels; it must never silently decode to the original image.
    for position in [2, bytes.len() / 4, bytes.len() / 2, bytes.len() - 2] {
        let mut corrupt = bytes.clone();
        corrupt[position] ^= 0x08;
        let mut decoded = empty_like(&image);
        let mut bitstream = Bitstream::new(&corrupt);
        match modular_decode(&mut bitstream, &mut decoded, 0, &options, None) {
            Err(_) => {}
            Ok(()) => {
                assert_ne!(
                    decoded.channels[0].grid(),
                    image.channels[0].grid(),
                    "bit flip at byte {position} was silently absorbed"
                );
            }
        }
    }
}

#[test]
fn maxval_governs_bit_depth_only() {
    // High dynamic range pixels survive the round trip.
    let pixels: Vec<i32> = (0..8 * 8).map(|i| (i as i32 - 32) * 1000).collect();
    let image = single_channel_image(8, 8, &pixels, 65535);
    let options = ModularOptions {
        predictor: PredictorChoice::Variable,
        nb_repeats: 1.0,
        ..Default::default()
    };
    roundtrip(&image, &options);
}

#[test]
fn subsampled_channels_roundtrip() {
    let mut image = Image::new(255);
    let mut full = Channel::new(8, 8);
    for (i, v) in full.grid_mut().buf_mut().iter_mut().enumerate() {
        *v = (i % 251) as i32;
    }
    image.channels.push(full);
    let mut half = Channel::with_shift(4, 4, 1, 1);
    for (i, v) in half.grid_mut().buf_mut().iter_mut().enumerate() {
        *v = (i * 7 % 251) as i32;
    }
    image.channels.push(half);

    let options = ModularOptions {
        predictor: PredictorChoice::Fixed(Predictor::Gradient),
        nb_repeats: 0.5,
        ..Default::default()
    };
    roundtrip(&image, &options);
}
