use crate::{Bundle, Error, Result, U32};

/// Bitstream reader over a borrowed in-memory buffer.
///
/// Bits are consumed LSB-first. The reader keeps up to 64 bits buffered and
/// refills from the byte slice on demand.
#[derive(Clone)]
pub struct Bitstream<'buf> {
    bytes: &'buf [u8],
    buf: u64,
    num_read_bits: usize,
    remaining_buf_bits: usize,
}

impl std::fmt::Debug for Bitstream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitstream")
            .field(
                "bytes",
                &format_args!(
                    "({} byte{} left)",
                    self.bytes.len(),
                    if self.bytes.len() == 1 { "" } else { "s" },
                ),
            )
            .field("buf", &format_args!("0x{:016x}", self.buf))
            .field("num_read_bits", &self.num_read_bits)
            .field("remaining_buf_bits", &self.remaining_buf_bits)
            .finish()
    }
}

impl<'buf> Bitstream<'buf> {
    /// Create a new bitstream reader.
    #[inline]
    pub fn new(bytes: &'buf [u8]) -> Self {
        Self {
            bytes,
            buf: 0,
            num_read_bits: 0,
            remaining_buf_bits: 0,
        }
    }

    /// Returns the number of bits that are read or skipped.
    #[inline]
    pub fn num_read_bits(&self) -> usize {
        self.num_read_bits
    }

    /// Fills bit buffer from byte buffer.
    fn refill(&mut self) {
        while self.remaining_buf_bits <= 56 {
            let Some((&b, next)) = self.bytes.split_first() else {
                return;
            };

            self.buf |= (b as u64) << self.remaining_buf_bits;
            self.remaining_buf_bits += 8;
            self.bytes = next;
        }
    }

    /// Peeks bits from bitstream, without consuming them.
    #[inline]
    pub fn peek_bits(&mut self, n: usize) -> u32 {
        debug_assert!(n <= 32);
        self.refill();
        (self.buf & ((1u64 << n) - 1)) as u32
    }

    /// Consumes bits in bit buffer.
    #[inline]
    pub fn consume_bits(&mut self, n: usize) -> Result<()> {
        self.remaining_buf_bits = self
            .remaining_buf_bits
            .checked_sub(n)
            .ok_or(Error::UnexpectedEof)?;
        self.num_read_bits += n;
        self.buf >>= n;
        Ok(())
    }

    /// Read and consume bits from bitstream.
    #[inline]
    pub fn read_bits(&mut self, n: usize) -> Result<u32> {
        let ret = self.peek_bits(n);
        self.consume_bits(n)?;
        Ok(ret)
    }

    #[inline]
    pub fn read_bool(&mut self) -> Result<bool> {
        self.read_bits(1).map(|x| x != 0)
    }

    /// Reads a 2-bit selector and the bits of the selected `U32` variant.
    pub fn read_u32(&mut self, spec: [U32; 4]) -> Result<u32> {
        let selector = self.read_bits(2)? as usize;
        Ok(match spec[selector] {
            U32::Const(c) => c,
            U32::BitsOffset { bits, offset } => {
                self.read_bits(bits as usize)?.wrapping_add(offset)
            }
        })
    }

    /// Consumes bits up to the next byte boundary, requiring them to be zero.
    pub fn zero_pad_to_byte(&mut self) -> Result<()> {
        let n = (8 - self.num_read_bits % 8) % 8;
        if self.read_bits(n)? != 0 {
            Err(Error::NonZeroPadding)
        } else {
            Ok(())
        }
    }

    /// Reads `n` bytes. The stream must be byte-aligned.
    pub fn read_aligned_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        debug_assert_eq!(self.num_read_bits % 8, 0);
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_bits(8)? as u8);
        }
        Ok(out)
    }

    #[inline]
    pub fn read_bundle<B: Bundle<()>>(&mut self) -> std::result::Result<B, B::Error> {
        B::parse(self, ())
    }

    #[inline]
    pub fn read_bundle_with_ctx<B: Bundle<Ctx>, Ctx>(
        &mut self,
        ctx: Ctx,
    ) -> std::result::Result<B, B::Error> {
        B::parse(self, ctx)
    }
}
