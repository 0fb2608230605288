// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Little-endian scalar access. Values on the wire are always little-endian;
//! these helpers read and write them at byte granularity so that segment
//! buffers need no particular host alignment.

/// A fixed-size scalar that can be read from and written to a little-endian
/// buffer.
pub trait EndianScalar: Copy + Default {
    const BYTES: usize;

    fn from_le_slice(slice: &[u8]) -> Self;
    fn to_le_slice(self, slice: &mut [u8]);
}

macro_rules! endian_impl {
    ($typ:ty, $bytes:expr) => {
        impl EndianScalar for $typ {
            const BYTES: usize = $bytes;

            fn from_le_slice(slice: &[u8]) -> Self {
                let mut buf = [0u8; $bytes];
                buf.copy_from_slice(&slice[..$bytes]);
                <$typ>::from_le_bytes(buf)
            }

            fn to_le_slice(self, slice: &mut [u8]) {
                slice[..$bytes].copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

endian_impl!(u8, 1);
endian_impl!(i8, 1);
endian_impl!(u16, 2);
endian_impl!(i16, 2);
endian_impl!(u32, 4);
endian_impl!(i32, 4);
endian_impl!(u64, 8);
endian_impl!(i64, 8);
endian_impl!(f32, 4);
endian_impl!(f64, 8);

#[cfg(test)]
mod tests {
    use super::EndianScalar;

    #[test]
    fn round_trips() {
        let mut buf = [0u8; 8];
        0x0123_4567_89ab_cdefu64.to_le_slice(&mut buf);
        assert_eq!(buf, [0xef, 0xcd, 0xab, 0x89, 0x67, 0x45, 0x23, 0x01]);
        assert_eq!(u64::from_le_slice(&buf), 0x0123_4567_89ab_cdef);

        let mut buf = [0u8; 2];
        (-2i16).to_le_slice(&mut buf);
        assert_eq!(i16::from_le_slice(&buf), -2);
    }
}
