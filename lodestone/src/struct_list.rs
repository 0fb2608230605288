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

//! Lists of structs, encoded as composite lists with a descriptor tag word.

use core::marker::PhantomData;

use crate::private::layout::{
    set_list_pointer, ListBuilder, ListReader, PointerBuilder, PointerReader, StructReader,
};
use crate::traits::{
    FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader, OwnedStruct,
    SetPointerBuilder,
};
use crate::Result;

#[derive(Clone, Copy)]
pub struct Owned<T> {
    marker: PhantomData<T>,
}

impl<T: OwnedStruct> crate::traits::Owned for Owned<T> {
    type Reader<'a> = Reader<'a, T>;
    type Builder<'a> = Builder<'a, T>;
}

pub struct Reader<'a, T> {
    reader: ListReader<'a>,
    marker: PhantomData<T>,
}

impl<'a, T> Clone for Reader<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for Reader<'a, T> {}

impl<'a, T: OwnedStruct> Reader<'a, T> {
    pub fn len(&self) -> u32 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> T::Reader<'a> {
        assert!(index < self.len(), "list index out of bounds");
        FromStructReader::new(self.reader.get_struct_element(index))
    }
}

impl<'a, T: OwnedStruct> FromPointerReader<'a> for Reader<'a, T> {
    fn get_from_pointer(reader: &PointerReader<'a>) -> Result<Self> {
        Ok(Self {
            // No expected element size: reads of narrower lists degrade to
            // default-valued fields element by element.
            reader: reader.get_list(None)?,
            marker: PhantomData,
        })
    }
}

impl<'a, T: OwnedStruct> SetPointerBuilder for Reader<'a, T> {
    fn set_pointer_builder(builder: PointerBuilder<'_>, from: Self) -> Result<()> {
        set_list_pointer(builder, &from.reader)
    }
}

pub struct Builder<'a, T> {
    builder: ListBuilder<'a>,
    marker: PhantomData<T>,
}

impl<'a, T: OwnedStruct> Builder<'a, T> {
    pub fn len(&self) -> u32 {
        self.builder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&mut self, index: u32) -> T::Builder<'_> {
        assert!(index < self.len(), "list index out of bounds");
        FromStructBuilder::new(self.builder.get_struct_element(index))
    }

    /// Copies a struct value into the given slot. Fails with
    /// `ListSizeTooSmall` if the value does not fit the element size.
    pub fn set(&mut self, index: u32, value: &StructReader<'_>) -> Result<()> {
        self.builder.set_struct_element(index, value)
    }

    pub fn reborrow(&mut self) -> Builder<'_, T> {
        Builder {
            builder: self.builder.reborrow(),
            marker: PhantomData,
        }
    }

    pub fn into_reader(self) -> Reader<'a, T> {
        Reader {
            reader: self.builder.as_reader(),
            marker: PhantomData,
        }
    }
}

impl<'a, T: OwnedStruct> FromPointerBuilder<'a> for Builder<'a, T> {
    fn init_pointer(builder: PointerBuilder<'a>, length: u32) -> Self {
        Self {
            builder: builder
                .init_struct_list(length, T::STRUCT_SIZE)
                .expect("allocate list"),
            marker: PhantomData,
        }
    }

    fn get_from_pointer(builder: PointerBuilder<'a>) -> Result<Self> {
        Ok(Self {
            builder: builder.get_list(crate::private::layout::ElementSize::InlineComposite)?,
            marker: PhantomData,
        })
    }
}
