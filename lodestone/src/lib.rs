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

//! # Lodestone Runtime Library
//!
//! Lodestone is a capability-based message-passing serialization format:
//! strongly-typed structured messages encoded as tightly-packed little-endian
//! words with relative pointers, plus live object references that travel
//! inside messages.
//!
//! The present crate is the runtime library: the in-memory message model,
//! the wire-format codec, and the framed stream codecs. The distributed
//! object-capability layer lives in the `lodestone-rpc` crate, and
//! asynchronous stream serialization lives in `lodestone-futures`.

pub mod any_pointer;
pub mod capability;
pub mod data;
pub mod data_list;
pub mod message;
pub mod primitive_list;
pub mod private;
pub mod serialize;
pub mod serialize_packed;
pub mod struct_list;
pub mod text;
pub mod text_list;
pub mod traits;

/// Eight bytes of memory, the unit of allocation and addressing.
///
/// Messages address their contents in words; all multi-byte values inside a
/// word are little-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct Word {
    raw: [u8; 8],
}

/// Constructs a word from its bytes, in memory order. Handy for tests that
/// spell out expected wire contents byte by byte.
pub const fn word(b0: u8, b1: u8, b2: u8, b3: u8, b4: u8, b5: u8, b6: u8, b7: u8) -> Word {
    Word {
        raw: [b0, b1, b2, b3, b4, b5, b6, b7],
    }
}

impl Word {
    pub fn bytes(&self) -> &[u8; 8] {
        &self.raw
    }

    /// Flattens a word slice into its byte representation.
    pub fn words_to_bytes(words: &[Word]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(words.len() * 8);
        for w in words {
            bytes.extend_from_slice(&w.raw);
        }
        bytes
    }
}

/// Size of a message, used for allocation hints.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct MessageSize {
    pub word_count: u64,

    /// Size of the capability table.
    pub cap_count: u32,
}

impl MessageSize {
    pub fn plus_eq(&mut self, other: MessageSize) {
        self.word_count += other.word_count;
        self.cap_count += other.cap_count;
    }
}

/// An enum value or union discriminant that was not found among those defined
/// in a schema.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct NotInSchema(pub u16);

impl ::core::fmt::Display for NotInSchema {
    fn fmt(&self, fmt: &mut ::core::fmt::Formatter) -> ::core::result::Result<(), ::core::fmt::Error> {
        write!(
            fmt,
            "Enum value or union discriminant {} was not present in the schema.",
            self.0
        )
    }
}

impl ::std::error::Error for NotInSchema {}

/// Because messages are lazily validated, the return type of any method that
/// follows a pointer must be wrapped in a Result.
pub type Result<T> = ::core::result::Result<T, Error>;

/// Describes an arbitrary error that prevented an operation from completing.
#[derive(Debug, Clone)]
pub struct Error {
    /// The type of the error. The purpose of this enum is not to describe the
    /// error itself, but rather to describe how the caller might want to
    /// respond to it.
    pub kind: ErrorKind,

    /// Human-readable failure description.
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A generic problem occurred, and it is believed that if the operation
    /// were repeated without any change in the state of the world, the
    /// problem would occur again.
    Failed,

    /// The request was rejected due to a temporary lack of resources.
    Overloaded,

    /// A pointer had a malformed offset or kind, or its target lies outside
    /// the bounds of its segment.
    BadPointer,

    /// The per-message traversal budget was exhausted. Guards against
    /// maliciously overlapping or cyclic pointer graphs.
    TraversalLimitExceeded,

    /// A write would not fit the encoded element size of a list.
    ListSizeTooSmall,

    /// Allocation failed because it would exceed a configured limit.
    OutOfBounds,

    /// A call was made on a null capability.
    NullClient,

    /// A pipelined field was requested from a null answer.
    NullAnswer,

    /// The connection to a remote vat was lost or aborted.
    Disconnected,

    /// The receiver does not implement the requested method or message kind.
    /// Recoverable: the peer is expected to degrade gracefully.
    Unimplemented,

    /// An application-level failure reported by a server method. Carries the
    /// method's own textual reason.
    MethodFailed,
}

impl Error {
    pub fn failed(reason: String) -> Self {
        Self {
            kind: ErrorKind::Failed,
            reason,
        }
    }

    pub fn overloaded(reason: String) -> Self {
        Self {
            kind: ErrorKind::Overloaded,
            reason,
        }
    }

    pub fn bad_pointer(reason: String) -> Self {
        Self {
            kind: ErrorKind::BadPointer,
            reason,
        }
    }

    pub fn traversal_limit_exceeded(reason: String) -> Self {
        Self {
            kind: ErrorKind::TraversalLimitExceeded,
            reason,
        }
    }

    pub fn list_size_too_small(reason: String) -> Self {
        Self {
            kind: ErrorKind::ListSizeTooSmall,
            reason,
        }
    }

    pub fn out_of_bounds(reason: String) -> Self {
        Self {
            kind: ErrorKind::OutOfBounds,
            reason,
        }
    }

    pub fn null_client(reason: String) -> Self {
        Self {
            kind: ErrorKind::NullClient,
            reason,
        }
    }

    pub fn null_answer(reason: String) -> Self {
        Self {
            kind: ErrorKind::NullAnswer,
            reason,
        }
    }

    pub fn disconnected(reason: String) -> Self {
        Self {
            kind: ErrorKind::Disconnected,
            reason,
        }
    }

    pub fn unimplemented(reason: String) -> Self {
        Self {
            kind: ErrorKind::Unimplemented,
            reason,
        }
    }

    pub fn method_failed(reason: String) -> Self {
        Self {
            kind: ErrorKind::MethodFailed,
            reason,
        }
    }
}

impl ::core::convert::From<::std::io::Error> for Error {
    fn from(err: ::std::io::Error) -> Self {
        let kind = match err.kind() {
            ::std::io::ErrorKind::UnexpectedEof
            | ::std::io::ErrorKind::ConnectionReset
            | ::std::io::ErrorKind::ConnectionAborted
            | ::std::io::ErrorKind::BrokenPipe => ErrorKind::Disconnected,
            _ => ErrorKind::Failed,
        };
        Self {
            kind,
            reason: format!("{err}"),
        }
    }
}

impl ::core::convert::From<NotInSchema> for Error {
    fn from(e: NotInSchema) -> Self {
        Self::failed(format!(
            "Enum value or union discriminant {} was not present in the schema.",
            e.0
        ))
    }
}

impl ::core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut ::core::fmt::Formatter) -> ::core::result::Result<(), ::core::fmt::Error> {
        write!(fmt, "{:?}: {}", self.kind, self.reason)
    }
}

impl ::std::error::Error for Error {}

/// Helper struct that allows `message::Builder::get_segments_for_output()` to
/// avoid heap allocations in the single-segment case.
pub enum OutputSegments<'a> {
    #[doc(hidden)]
    SingleSegment([&'a [u8]; 1]),

    #[doc(hidden)]
    MultiSegment(Vec<&'a [u8]>),
}

impl<'a> ::core::ops::Deref for OutputSegments<'a> {
    type Target = [&'a [u8]];
    fn deref(&self) -> &[&'a [u8]] {
        match self {
            OutputSegments::SingleSegment(s) => s,
            OutputSegments::MultiSegment(v) => v,
        }
    }
}
