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

//! Lists of primitive values.

use core::marker::PhantomData;

use crate::private::endian::EndianScalar;
use crate::private::layout::{
    set_list_pointer, ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader,
};
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::Result;

/// A primitive value that can live directly in list elements.
pub trait PrimitiveElement: Copy {
    const ELEMENT_SIZE: ElementSize;

    fn get(list: &ListReader<'_>, index: u32) -> Self;
    fn get_from_builder(list: &ListBuilder<'_>, index: u32) -> Self;
    fn set(list: &mut ListBuilder<'_>, index: u32, value: Self);
}

macro_rules! primitive_element {
    ($typ:ty, $size:ident) => {
        impl PrimitiveElement for $typ {
            const ELEMENT_SIZE: ElementSize = ElementSize::$size;

            fn get(list: &ListReader<'_>, index: u32) -> Self {
                list.get_data_element(index)
            }

            fn get_from_builder(list: &ListBuilder<'_>, index: u32) -> Self {
                list.get_data_element(index)
            }

            fn set(list: &mut ListBuilder<'_>, index: u32, value: Self) {
                list.set_data_element(index, value)
            }
        }
    };
}

primitive_element!(u8, Byte);
primitive_element!(i8, Byte);
primitive_element!(u16, TwoBytes);
primitive_element!(i16, TwoBytes);
primitive_element!(u32, FourBytes);
primitive_element!(i32, FourBytes);
primitive_element!(u64, EightBytes);
primitive_element!(i64, EightBytes);
primitive_element!(f32, FourBytes);
primitive_element!(f64, EightBytes);

impl PrimitiveElement for bool {
    const ELEMENT_SIZE: ElementSize = ElementSize::Bit;

    fn get(list: &ListReader<'_>, index: u32) -> Self {
        list.get_bool_element(index)
    }

    fn get_from_builder(list: &ListBuilder<'_>, index: u32) -> Self {
        list.get_bool_element(index)
    }

    fn set(list: &mut ListBuilder<'_>, index: u32, value: Self) {
        list.set_bool_element(index, value)
    }
}

#[derive(Clone, Copy)]
pub struct Owned<T> {
    marker: PhantomData<T>,
}

impl<T: PrimitiveElement> crate::traits::Owned for Owned<T> {
    type Reader<'a> = Reader<'a, T>;
    type Builder<'a> = Builder<'a, T>;
}

#[derive(Clone, Copy)]
pub struct Reader<'a, T> {
    reader: ListReader<'a>,
    marker: PhantomData<T>,
}

impl<'a, T: PrimitiveElement> Reader<'a, T> {
    pub fn len(&self) -> u32 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> T {
        assert!(index < self.len(), "list index out of bounds");
        T::get(&self.reader, index)
    }
}

impl<'a, T: PrimitiveElement> FromPointerReader<'a> for Reader<'a, T> {
    fn get_from_pointer(reader: &PointerReader<'a>) -> Result<Self> {
        Ok(Self {
            reader: reader.get_list(Some(T::ELEMENT_SIZE))?,
            marker: PhantomData,
        })
    }
}

impl<'a, T: PrimitiveElement> SetPointerBuilder for Reader<'a, T> {
    fn set_pointer_builder(builder: PointerBuilder<'_>, from: Self) -> Result<()> {
        set_list_pointer(builder, &from.reader)
    }
}

pub struct Builder<'a, T> {
    builder: ListBuilder<'a>,
    marker: PhantomData<T>,
}

impl<'a, T: PrimitiveElement> Builder<'a, T> {
    pub fn len(&self) -> u32 {
        self.builder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> T {
        assert!(index < self.len(), "list index out of bounds");
        T::get_from_builder(&self.builder, index)
    }

    pub fn set(&mut self, index: u32, value: T) {
        assert!(index < self.len(), "list index out of bounds");
        T::set(&mut self.builder, index, value)
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

impl<'a, T: PrimitiveElement> FromPointerBuilder<'a> for Builder<'a, T> {
    fn init_pointer(builder: PointerBuilder<'a>, length: u32) -> Self {
        Self {
            builder: builder
                .init_list(T::ELEMENT_SIZE, length)
                .expect("allocate list"),
            marker: PhantomData,
        }
    }

    fn get_from_pointer(builder: PointerBuilder<'a>) -> Result<Self> {
        Ok(Self {
            builder: builder.get_list(T::ELEMENT_SIZE)?,
            marker: PhantomData,
        })
    }
}
