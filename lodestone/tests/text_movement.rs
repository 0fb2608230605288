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

//! Moving text between messages and across segment boundaries.

mod test_util;

use std::io::Cursor;

use lodestone::message::{self, AllocationStrategy, HeapAllocator, ReaderOptions, SegmentArray};
use lodestone::private::layout::{encode_far_pointer, encode_struct_pointer, StructSize};
use lodestone::serialize;

use test_util::{holds_text, zdate};

fn megabyte_text() -> String {
    let mut text = String::with_capacity(1 << 20);
    let mut state: u32 = 0x2545_f491;
    for _ in 0..(1 << 20) {
        // xorshift; anything non-repeating will do
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        text.push(char::from(b'A' + (state % 26) as u8));
    }
    text
}

#[test]
fn text_moves_into_a_different_segment() {
    let text = megabyte_text();

    // The source list lives in its own message.
    let mut scratch = message::Builder::new_default();
    {
        let root = scratch.init_root::<holds_text::Builder>();
        let mut list = root.init_lst(1);
        list.set(0, &text).expect("set text");
    }

    // The destination's first segment only has room for the root and the
    // struct, so the copied list must land in a later segment, reachable
    // through a far pointer.
    let mut dest = message::Builder::new(
        HeapAllocator::new()
            .first_segment_words(8)
            .allocation_strategy(AllocationStrategy::FixedSize)
            .max_segment_words(1 << 20),
    );
    {
        let scratch_reader = scratch
            .get_root_as_reader::<holds_text::Reader>()
            .expect("scratch root");
        let src_list = scratch_reader.get_lst().expect("source list");
        let mut ht = dest.init_root::<holds_text::Builder>();
        ht.set_lst(src_list).expect("move list");
    }

    assert!(
        dest.get_segments_for_output().len() >= 2,
        "text copy was expected to cross a segment boundary"
    );

    // In-memory readback.
    {
        let ht = dest
            .get_root_as_reader::<holds_text::Reader>()
            .expect("dest root");
        let copied = ht.get_lst().expect("dest list").get(0).expect("text");
        assert_eq!(copied.len(), text.len());
        assert_eq!(copied, text);
    }

    // And through the wire, which exercises far pointers on the read side.
    let mut encoded: Vec<u8> = Vec::new();
    serialize::write_message(&mut encoded, &dest).expect("encode");
    let decoded =
        serialize::read_message(Cursor::new(&encoded[..]), Default::default()).expect("decode");
    let ht = decoded.get_root::<holds_text::Reader>().expect("root");
    assert_eq!(ht.get_lst().expect("list").get(0).expect("text"), text);
}

#[test]
fn struct_copy_across_segments_stays_reachable() {
    let mut src = message::Builder::new_default();
    {
        let mut d = src.init_root::<zdate::Builder>();
        d.set_year(1977);
        d.set_month(5);
        d.set_day(25);
    }

    let mut dest = message::Builder::new(
        HeapAllocator::new()
            .first_segment_words(1)
            .allocation_strategy(AllocationStrategy::FixedSize)
            .max_segment_words(1 << 20),
    );
    {
        let reader = src.get_root_as_reader::<zdate::Reader>().expect("src root");
        dest.set_root(reader).expect("copy");
    }
    assert!(dest.get_segments_for_output().len() >= 2);

    let d = dest.get_root_as_reader::<zdate::Reader>().expect("dest root");
    assert_eq!(d.get_year(), 1977);
    assert_eq!(d.get_month(), 5);
    assert_eq!(d.get_day(), 25);
}

#[test]
fn double_far_landing_pads_decode() {
    // Hand-crafted three-segment message: the root is a double-far pointer
    // whose two-word pad redirects into a third segment.
    let root_word = encode_far_pointer(true, 1, 0).to_le_bytes();

    let mut pad_segment = Vec::new();
    pad_segment.extend_from_slice(&encode_far_pointer(false, 2, 0).to_le_bytes());
    pad_segment.extend_from_slice(
        &encode_struct_pointer(
            0,
            StructSize {
                data: 1,
                pointers: 0,
            },
        )
        .to_le_bytes(),
    );

    let mut data_segment = Vec::new();
    data_segment.extend_from_slice(&0x0000_0000_0507_07b9u64.to_le_bytes()); // year 1977, month 7, day 5

    let segments: [&[u8]; 3] = [&root_word, &pad_segment, &data_segment];
    let segment_array = SegmentArray::new(&segments);
    let reader = message::Reader::new(segment_array, ReaderOptions::new());

    let d = reader.get_root::<zdate::Reader>().expect("root");
    assert_eq!(d.get_year(), 1977);
    assert_eq!(d.get_month(), 7);
    assert_eq!(d.get_day(), 5);
}
