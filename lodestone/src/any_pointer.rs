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

//! Dynamically typed value containing any kind of pointer.

use crate::capability::ClientHook;
use crate::private::layout::{PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::Result;

#[derive(Clone, Copy)]
pub struct Reader<'a> {
    reader: PointerReader<'a>,
}

impl<'a> Reader<'a> {
    pub fn new(reader: PointerReader<'a>) -> Self {
        Self { reader }
    }

    pub fn is_null(&self) -> bool {
        self.reader.is_null()
    }

    pub fn get_as<T: FromPointerReader<'a>>(&self) -> Result<T> {
        T::get_from_pointer(&self.reader)
    }

    pub fn get_as_capability(&self) -> Result<Box<dyn ClientHook>> {
        self.reader.get_capability()
    }

    /// Follows a pipeline transform path into this value and returns the
    /// capability it lands on.
    pub fn get_pipelined_cap(
        &self,
        ops: &[crate::capability::PipelineOp],
    ) -> Result<Box<dyn ClientHook>> {
        let mut pointer = self.reader;
        for op in ops {
            match op {
                crate::capability::PipelineOp::Noop => {}
                crate::capability::PipelineOp::GetPointerField(index) => {
                    pointer = pointer.get_struct()?.get_pointer_field(*index);
                }
            }
        }
        pointer.get_capability()
    }
}

impl<'a> FromPointerReader<'a> for Reader<'a> {
    fn get_from_pointer(reader: &PointerReader<'a>) -> Result<Self> {
        Ok(Self { reader: *reader })
    }
}

impl<'a> SetPointerBuilder for Reader<'a> {
    fn set_pointer_builder(builder: PointerBuilder<'_>, from: Self) -> Result<()> {
        builder.set(&from.reader)
    }
}

pub struct Builder<'a> {
    builder: PointerBuilder<'a>,
}

impl<'a> Builder<'a> {
    pub fn new(builder: PointerBuilder<'a>) -> Self {
        Self { builder }
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            builder: self.builder.reborrow(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.builder.is_null()
    }

    pub fn init_as<T: FromPointerBuilder<'a>>(self) -> T {
        T::init_pointer(self.builder, 0)
    }

    /// Initializes the pointer as a list value of the given length.
    pub fn initn_as<T: FromPointerBuilder<'a>>(self, length: u32) -> T {
        T::init_pointer(self.builder, length)
    }

    pub fn get_as<T: FromPointerBuilder<'a>>(self) -> Result<T> {
        T::get_from_pointer(self.builder)
    }

    pub fn set_as<T: SetPointerBuilder>(self, value: T) -> Result<()> {
        T::set_pointer_builder(self.builder, value)
    }

    pub fn set_as_capability(self, cap: Box<dyn ClientHook>) -> Result<()> {
        self.builder.set_capability(cap)
    }

    pub fn get_as_capability(&self) -> Result<Box<dyn ClientHook>> {
        self.builder.get_capability()
    }

    pub fn clear(self) {
        self.builder.clear();
    }

    pub fn into_reader(self) -> Reader<'a> {
        Reader {
            reader: self.builder.as_reader(),
        }
    }
}

impl<'a> FromPointerBuilder<'a> for Builder<'a> {
    fn init_pointer(builder: PointerBuilder<'a>, _length: u32) -> Self {
        let mut builder = builder;
        builder.reborrow().clear();
        Self { builder }
    }

    fn get_from_pointer(builder: PointerBuilder<'a>) -> Result<Self> {
        Ok(Self { builder })
    }
}
