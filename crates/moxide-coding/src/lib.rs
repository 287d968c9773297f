//! Clustered token entropy coder used by the moxide codec.
//!
//! Tokens are `(context, value)` pairs. Values are split with a hybrid-uint
//! scheme into an entropy-coded symbol plus raw extra bits; symbols are
//! compressed with a range ANS coder over per-cluster histograms, and contexts
//! are mapped to clusters so that identical distributions share a histogram.
//!
//! An encoded section is an [`AnsCode`] (cluster map plus histograms)
//! followed by a byte-aligned ANS blob and the extra bits of every token in
//! emission order. The two halves can also live in different places: a global
//! code shared by many token streams, each stream carrying only its blob.
//! [`Decoder::finalize`] verifies that the ANS state returned to its initial
//! value, which catches most stream corruption.

use moxide_bitstream::{BitWriter, Bitstream};

mod ans;
mod error;

pub use ans::Histogram;
pub use error::{Error, Result};

/// Largest symbol alphabet the coder accepts.
///
/// The hybrid-uint split below never produces a symbol above 127 for 32-bit
/// values, so this bounds both histogram size and lookup tables.
pub const MAX_ALPHABET_SIZE: usize = 128;

/// A single entropy-coded token.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Token {
    pub context: u32,
    pub value: u32,
}

/// Hybrid-uint configuration: values below `split` are coded as their own
/// symbol; larger values keep `msb_in_token` significant bits (plus the
/// implicit leading one) and the bit count in the symbol, with the remainder
/// as raw bits.
#[derive(Debug, Copy, Clone)]
pub struct IntegerConfig {
    pub split_exponent: u32,
    pub msb_in_token: u32,
    pub lsb_in_token: u32,
}

impl IntegerConfig {
    pub const DEFAULT: Self = Self {
        split_exponent: 4,
        msb_in_token: 2,
        lsb_in_token: 0,
    };

    #[inline]
    fn split(&self) -> u32 {
        1 << self.split_exponent
    }

    /// Splits `value` into `(symbol, extra_bit_count, extra_bits)`.
    #[inline]
    pub fn split_value(&self, value: u32) -> (u32, u32, u32) {
        let split = self.split();
        if value < split {
            return (value, 0, 0);
        }

        let in_token = self.msb_in_token + self.lsb_in_token;
        let top = 31 - value.leading_zeros();
        let n = top - in_token;
        let msbits = (value >> (n + self.lsb_in_token)) & ((1 << self.msb_in_token) - 1);
        let lowbits = value & ((1 << self.lsb_in_token) - 1);
        let extra = (value >> self.lsb_in_token) & (((1u64 << n) - 1) as u32);
        let symbol = split
            + (((n - (self.split_exponent - in_token)) << in_token)
                | (msbits << self.lsb_in_token)
                | lowbits);
        (symbol, n, extra)
    }

    /// Reassembles a value from its symbol, reading extra bits from the
    /// bitstream.
    #[inline]
    pub fn merge_value(&self, symbol: u32, bitstream: &mut Bitstream) -> Result<u32> {
        let split = self.split();
        if symbol < split {
            return Ok(symbol);
        }

        let in_token = self.msb_in_token + self.lsb_in_token;
        let n = self.split_exponent - in_token + ((symbol - split) >> in_token);
        let low_bits = symbol & ((1 << self.lsb_in_token) - 1);
        let token = symbol >> self.lsb_in_token;
        let token = token & ((1 << self.msb_in_token) - 1);
        let token = token | (1 << self.msb_in_token);
        let rest = bitstream.read_bits(n as usize)?;
        Ok((((token << n) | rest) << self.lsb_in_token) | low_bits)
    }
}

/// The shared half of an entropy-coded stream: context-to-cluster map and
/// per-cluster histograms.
#[derive(Debug, Clone)]
pub struct AnsCode {
    clusters: Vec<u8>,
    histograms: Vec<Histogram>,
    config: IntegerConfig,
}

impl AnsCode {
    /// Returns the cluster mapping of distributions.
    #[inline]
    pub fn cluster_map(&self) -> &[u8] {
        &self.clusters
    }

    /// Returns the single symbol of the cluster, if its histogram is
    /// degenerate and the symbol carries no extra bits.
    #[inline]
    pub fn single_token(&self, cluster: u8) -> Option<u32> {
        let symbol = self.histograms[cluster as usize].single_symbol()?;
        (symbol < 1 << self.config.split_exponent).then_some(symbol)
    }

    /// Reads the cluster map and histograms from the bitstream.
    pub fn parse(bitstream: &mut Bitstream, num_contexts: u32) -> Result<Self> {
        let num_contexts = num_contexts.max(1);
        let num_clusters = bitstream.read_bits(8)? as usize + 1;
        let mut clusters = Vec::with_capacity(num_contexts as usize);
        for _ in 0..num_contexts {
            let cluster = bitstream.read_bits(8)? as usize;
            if cluster >= num_clusters {
                tracing::error!(cluster, num_clusters, "cluster map out of range");
                return Err(Error::InvalidClusterMap);
            }
            clusters.push(cluster as u8);
        }

        let mut histograms = Vec::with_capacity(num_clusters);
        for _ in 0..num_clusters {
            let histogram = if bitstream.read_bool()? {
                let symbol = bitstream.read_bits(8)? as usize;
                if symbol >= MAX_ALPHABET_SIZE {
                    return Err(Error::InvalidAnsHistogram);
                }
                let mut freqs = vec![0u16; symbol + 1];
                freqs[symbol] = ans::PROB_TOTAL as u16;
                Histogram::from_freqs(freqs)?
            } else {
                let alphabet_size = bitstream.read_bits(8)? as usize;
                if alphabet_size > MAX_ALPHABET_SIZE {
                    return Err(Error::InvalidAnsHistogram);
                }
                if alphabet_size == 0 {
                    Histogram::from_counts(&[])
                } else {
                    let mut freqs = Vec::with_capacity(alphabet_size);
                    for _ in 0..alphabet_size {
                        freqs.push(bitstream.read_bits(12)? as u16);
                    }
                    Histogram::from_freqs(freqs)?
                }
            };
            histograms.push(histogram);
        }

        Ok(Self {
            clusters,
            histograms,
            config: IntegerConfig::DEFAULT,
        })
    }

    /// Writes the cluster map and histograms.
    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_bits(self.histograms.len() as u32 - 1, 8);
        for &cluster in &self.clusters {
            writer.write_bits(cluster as u32, 8);
        }
        for histogram in &self.histograms {
            if let Some(symbol) = histogram.single_symbol() {
                writer.write_bool(true);
                writer.write_bits(symbol, 8);
            } else {
                writer.write_bool(false);
                let freqs = histogram.freqs();
                writer.write_bits(freqs.len() as u32, 8);
                for &freq in freqs {
                    writer.write_bits(freq as u32, 12);
                }
            }
        }
    }
}

/// Token buffer and stream writer, the encode-side counterpart of
/// [`Decoder`].
#[derive(Debug)]
pub struct Encoder {
    num_contexts: u32,
    config: IntegerConfig,
    tokens: Vec<Token>,
}

impl Encoder {
    pub fn new(num_contexts: u32) -> Self {
        Self {
            // A stream always carries at least one (possibly empty) context.
            num_contexts: num_contexts.max(1),
            config: IntegerConfig::DEFAULT,
            tokens: Vec::new(),
        }
    }

    /// Appends one token to the ordered stream.
    #[inline]
    pub fn emit_token(&mut self, context: u32, value: u32) {
        debug_assert!(context < self.num_contexts);
        self.tokens.push(Token { context, value });
    }

    #[inline]
    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }

    #[inline]
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Builds the entropy code over the buffered tokens: histograms per
    /// context, then greedy clustering of identical count vectors. A real
    /// clusterer would merge near-identical histograms too; the wire format
    /// doesn't care.
    pub fn build_code(&self) -> AnsCode {
        let num_contexts = self.num_contexts as usize;
        let mut counts = vec![vec![0u32; MAX_ALPHABET_SIZE]; num_contexts];
        for token in &self.tokens {
            let (symbol, _, _) = self.config.split_value(token.value);
            counts[token.context as usize][symbol as usize] += 1;
        }

        let mut clusters = vec![0u8; num_contexts];
        let mut cluster_counts: Vec<Vec<u32>> = Vec::new();
        for (ctx, ctx_counts) in counts.iter().enumerate() {
            let found = cluster_counts
                .iter()
                .position(|existing| existing == ctx_counts);
            let cluster = match found {
                Some(cluster) => cluster,
                None if cluster_counts.len() < 256 => {
                    cluster_counts.push(ctx_counts.clone());
                    cluster_counts.len() - 1
                }
                // Cluster map entries are bytes; overflow merges into the
                // last cluster. Unreachable for trees below 257 distinct
                // leaf distributions.
                None => {
                    for (acc, &count) in cluster_counts[255].iter_mut().zip(ctx_counts) {
                        *acc += count;
                    }
                    255
                }
            };
            clusters[ctx] = cluster as u8;
        }
        let histograms = cluster_counts
            .iter()
            .map(|counts| Histogram::from_counts(counts))
            .collect();

        AnsCode {
            clusters,
            histograms,
            config: self.config,
        }
    }

    /// Writes the buffered tokens as an ANS blob plus trailing extra bits,
    /// entropy-coded with the given code.
    ///
    /// Every token must have nonzero frequency under `code`; the code built
    /// by [`build_code`](Self::build_code) over these (or a superset of
    /// these) tokens guarantees that.
    pub fn write_tokens(&self, code: &AnsCode, writer: &mut BitWriter) -> Result<()> {
        // rANS is LIFO: encode the symbol stream back-to-front, then flip the
        // renormalization bytes so the decoder reads them forward.
        let mut state = ans::STATE_INIT;
        let mut stack = Vec::new();
        for token in self.tokens.iter().rev() {
            let (symbol, _, _) = self.config.split_value(token.value);
            let cluster = code.clusters[token.context as usize];
            code.histograms[cluster as usize].write_symbol(&mut state, symbol, &mut stack);
        }
        stack.reverse();
        let mut blob = state.to_le_bytes().to_vec();
        blob.extend_from_slice(&stack);

        writer.write_bits(blob.len() as u32, 32);
        writer.zero_pad_to_byte();
        writer.write_aligned_bytes(&blob);

        for token in &self.tokens {
            let (_, n, extra) = self.config.split_value(token.value);
            writer.write_bits(extra, n as usize);
        }
        Ok(())
    }

    /// Writes a complete self-contained section: code, blob, extra bits.
    pub fn write_section(&self, writer: &mut BitWriter) -> Result<()> {
        let code = self.build_code();
        code.write(writer);
        self.write_tokens(&code, writer)
    }
}

/// An entropy decoder over one token stream.
#[derive(Debug, Clone)]
pub struct Decoder {
    code: AnsCode,
    blob: Vec<u8>,
    pos: usize,
    state: u32,
}

impl Decoder {
    /// Reads a self-contained section header: code followed by the blob.
    pub fn parse(bitstream: &mut Bitstream, num_contexts: u32) -> Result<Self> {
        let code = AnsCode::parse(bitstream, num_contexts)?;
        let mut decoder = Self::with_code(code);
        decoder.read_blob(bitstream)?;
        Ok(decoder)
    }

    /// Wraps an externally supplied (e.g. global) code; call
    /// [`read_blob`](Self::read_blob) before decoding.
    pub fn with_code(code: AnsCode) -> Self {
        Self {
            code,
            blob: Vec::new(),
            pos: 0,
            state: 0,
        }
    }

    /// Reads this stream's ANS blob from the bitstream.
    pub fn read_blob(&mut self, bitstream: &mut Bitstream) -> Result<()> {
        let blob_len = bitstream.read_bits(32)? as usize;
        bitstream.zero_pad_to_byte()?;
        let blob = bitstream.read_aligned_bytes(blob_len)?;
        if blob.len() < 4 {
            return Err(Error::InvalidAnsStream);
        }
        self.blob = blob;
        self.pos = 0;
        self.state = 0;
        Ok(())
    }

    /// Explicitly starts reading the ANS symbol stream.
    pub fn begin(&mut self) -> Result<()> {
        if self.blob.len() < 4 {
            return Err(Error::InvalidAnsStream);
        }
        let state = [self.blob[0], self.blob[1], self.blob[2], self.blob[3]];
        self.state = u32::from_le_bytes(state);
        self.pos = 4;
        Ok(())
    }

    /// Reads a value with the given context.
    #[inline]
    pub fn read_varint(&mut self, bitstream: &mut Bitstream, ctx: u32) -> Result<u32> {
        let cluster = self.code.clusters[ctx as usize];
        self.read_varint_clustered(bitstream, cluster)
    }

    /// Reads a value with the given *cluster*.
    ///
    /// Contexts can be converted to clusters using [the cluster
    /// map][Self::cluster_map].
    pub fn read_varint_clustered(&mut self, bitstream: &mut Bitstream, cluster: u8) -> Result<u32> {
        let histogram = &self.code.histograms[cluster as usize];
        if histogram.is_empty() {
            return Err(Error::EmptyCluster(cluster));
        }
        let blob = &self.blob;
        let pos = &mut self.pos;
        let symbol = histogram.read_symbol(&mut self.state, || {
            let b = blob.get(*pos).copied();
            *pos += 1;
            b
        })?;
        self.code.config.merge_value(symbol, bitstream)
    }

    /// Returns the single symbol of the cluster, if its histogram is
    /// degenerate and the symbol carries no extra bits.
    #[inline]
    pub fn single_token(&self, cluster: u8) -> Option<u32> {
        self.code.single_token(cluster)
    }

    /// Finalizes the stream, and check whether the stream was valid.
    ///
    /// The ANS state must have returned to its initial value with every blob
    /// byte consumed; anything else means the stream was corrupt.
    pub fn finalize(&self) -> Result<()> {
        if self.state == ans::STATE_INIT && self.pos == self.blob.len() {
            Ok(())
        } else {
            tracing::error!(
                state = self.state,
                pos = self.pos,
                blob_len = self.blob.len(),
                "ANS final state check failed"
            );
            Err(Error::InvalidAnsStream)
        }
    }

    /// Returns the cluster mapping of distributions.
    #[inline]
    pub fn cluster_map(&self) -> &[u8] {
        self.code.cluster_map()
    }
}
