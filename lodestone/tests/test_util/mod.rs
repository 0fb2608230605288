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

//! Hand-maintained typed views for the test schema, written the way a code
//! generator would emit them.

#![allow(dead_code)]

pub mod zdate {
    use lodestone::private::layout::{
        set_struct_pointer, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use lodestone::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use lodestone::Result;

    pub const STRUCT_SIZE: StructSize = StructSize {
        data: 1,
        pointers: 0,
    };

    #[derive(Clone, Copy)]
    pub struct Owned(());

    impl lodestone::traits::Owned for Owned {
        type Reader<'a> = Reader<'a>;
        type Builder<'a> = Builder<'a>;
    }

    impl lodestone::traits::OwnedStruct for Owned {
        type Reader<'a> = Reader<'a>;
        type Builder<'a> = Builder<'a>;
        const STRUCT_SIZE: StructSize = STRUCT_SIZE;
    }

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_year(&self) -> i16 {
            self.reader.get_data_field::<i16>(0)
        }

        pub fn get_month(&self) -> u8 {
            self.reader.get_data_field::<u8>(2)
        }

        pub fn get_day(&self) -> u8 {
            self.reader.get_data_field::<u8>(3)
        }
    }

    impl<'a> FromStructReader<'a> for Reader<'a> {
        fn new(reader: StructReader<'a>) -> Self {
            Self { reader }
        }
    }

    impl<'a> FromPointerReader<'a> for Reader<'a> {
        fn get_from_pointer(reader: &PointerReader<'a>) -> Result<Self> {
            Ok(Self {
                reader: reader.get_struct()?,
            })
        }
    }

    impl<'a> SetPointerBuilder for Reader<'a> {
        fn set_pointer_builder(builder: PointerBuilder<'_>, from: Self) -> Result<()> {
            set_struct_pointer(builder, &from.reader)
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_year(&mut self, value: i16) {
            self.builder.set_data_field::<i16>(0, value);
        }

        pub fn get_year(&self) -> i16 {
            self.builder.get_data_field::<i16>(0)
        }

        pub fn set_month(&mut self, value: u8) {
            self.builder.set_data_field::<u8>(2, value);
        }

        pub fn get_month(&self) -> u8 {
            self.builder.get_data_field::<u8>(2)
        }

        pub fn set_day(&mut self, value: u8) {
            self.builder.set_data_field::<u8>(3, value);
        }

        pub fn get_day(&self) -> u8 {
            self.builder.get_data_field::<u8>(3)
        }

        pub fn reborrow(&mut self) -> Builder<'_> {
            Builder {
                builder: self.builder.reborrow(),
            }
        }

        pub fn into_reader(self) -> Reader<'a> {
            Reader {
                reader: self.builder.as_reader(),
            }
        }
    }

    impl<'a> FromStructBuilder<'a> for Builder<'a> {
        fn new(builder: StructBuilder<'a>) -> Self {
            Self { builder }
        }
    }

    impl<'a> FromPointerBuilder<'a> for Builder<'a> {
        fn init_pointer(builder: PointerBuilder<'a>, _length: u32) -> Self {
            Self {
                builder: builder.init_struct(STRUCT_SIZE).expect("allocate struct"),
            }
        }

        fn get_from_pointer(builder: PointerBuilder<'a>) -> Result<Self> {
            Ok(Self {
                builder: builder.get_struct(STRUCT_SIZE)?,
            })
        }
    }
}

pub mod zdata {
    use lodestone::private::layout::{
        set_struct_pointer, PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use lodestone::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use lodestone::Result;

    pub const STRUCT_SIZE: StructSize = StructSize {
        data: 0,
        pointers: 1,
    };

    #[derive(Clone, Copy)]
    pub struct Owned(());

    impl lodestone::traits::Owned for Owned {
        type Reader<'a> = Reader<'a>;
        type Builder<'a> = Builder<'a>;
    }

    impl lodestone::traits::OwnedStruct for Owned {
        type Reader<'a> = Reader<'a>;
        type Builder<'a> = Builder<'a>;
        const STRUCT_SIZE: StructSize = STRUCT_SIZE;
    }

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_data(&self) -> Result<lodestone::data::Reader<'a>> {
            self.reader.get_pointer_field(0).get_data()
        }

        pub fn has_data(&self) -> bool {
            !self.reader.get_pointer_field(0).is_null()
        }
    }

    impl<'a> FromStructReader<'a> for Reader<'a> {
        fn new(reader: StructReader<'a>) -> Self {
            Self { reader }
        }
    }

    impl<'a> FromPointerReader<'a> for Reader<'a> {
        fn get_from_pointer(reader: &PointerReader<'a>) -> Result<Self> {
            Ok(Self {
                reader: reader.get_struct()?,
            })
        }
    }

    impl<'a> SetPointerBuilder for Reader<'a> {
        fn set_pointer_builder(builder: PointerBuilder<'_>, from: Self) -> Result<()> {
            set_struct_pointer(builder, &from.reader)
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_data(&mut self, value: &[u8]) -> Result<()> {
            self.builder.get_pointer_field(0).set_data(value)
        }

        pub fn reborrow(&mut self) -> Builder<'_> {
            Builder {
                builder: self.builder.reborrow(),
            }
        }

        pub fn into_reader(self) -> Reader<'a> {
            Reader {
                reader: self.builder.as_reader(),
            }
        }
    }

    impl<'a> FromStructBuilder<'a> for Builder<'a> {
        fn new(builder: StructBuilder<'a>) -> Self {
            Self { builder }
        }
    }

    impl<'a> FromPointerBuilder<'a> for Builder<'a> {
        fn init_pointer(builder: PointerBuilder<'a>, _length: u32) -> Self {
            Self {
                builder: builder.init_struct(STRUCT_SIZE).expect("allocate struct"),
            }
        }

        fn get_from_pointer(builder: PointerBuilder<'a>) -> Result<Self> {
            Ok(Self {
                builder: builder.get_struct(STRUCT_SIZE)?,
            })
        }
    }
}

pub mod z {
    use lodestone::private::layout::{
        PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use lodestone::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
    };
    use lodestone::{struct_list, Result};

    use super::{zdata, zdate};

    pub const STRUCT_SIZE: StructSize = StructSize {
        data: 0,
        pointers: 2,
    };

    #[derive(Clone, Copy)]
    pub struct Owned(());

    impl lodestone::traits::Owned for Owned {
        type Reader<'a> = Reader<'a>;
        type Builder<'a> = Builder<'a>;
    }

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_zdatevec(&self) -> Result<struct_list::Reader<'a, zdate::Owned>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0))
        }

        pub fn has_zdatevec(&self) -> bool {
            !self.reader.get_pointer_field(0).is_null()
        }

        pub fn get_zdata(&self) -> Result<zdata::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(1))
        }
    }

    impl<'a> FromStructReader<'a> for Reader<'a> {
        fn new(reader: StructReader<'a>) -> Self {
            Self { reader }
        }
    }

    impl<'a> FromPointerReader<'a> for Reader<'a> {
        fn get_from_pointer(reader: &PointerReader<'a>) -> Result<Self> {
            Ok(Self {
                reader: reader.get_struct()?,
            })
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn init_zdatevec(self, size: u32) -> struct_list::Builder<'a, zdate::Owned> {
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(0), size)
        }

        pub fn init_zdata(self) -> zdata::Builder<'a> {
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(1), 0)
        }

        pub fn reborrow(&mut self) -> Builder<'_> {
            Builder {
                builder: self.builder.reborrow(),
            }
        }
    }

    impl<'a> FromStructBuilder<'a> for Builder<'a> {
        fn new(builder: StructBuilder<'a>) -> Self {
            Self { builder }
        }
    }

    impl<'a> FromPointerBuilder<'a> for Builder<'a> {
        fn init_pointer(builder: PointerBuilder<'a>, _length: u32) -> Self {
            Self {
                builder: builder.init_struct(STRUCT_SIZE).expect("allocate struct"),
            }
        }

        fn get_from_pointer(builder: PointerBuilder<'a>) -> Result<Self> {
            Ok(Self {
                builder: builder.get_struct(STRUCT_SIZE)?,
            })
        }
    }
}

pub mod holds_text {
    use lodestone::private::layout::{
        PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use lodestone::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
        SetPointerBuilder,
    };
    use lodestone::{text_list, Result};

    pub const STRUCT_SIZE: StructSize = StructSize {
        data: 0,
        pointers: 2,
    };

    #[derive(Clone, Copy)]
    pub struct Owned(());

    impl lodestone::traits::Owned for Owned {
        type Reader<'a> = Reader<'a>;
        type Builder<'a> = Builder<'a>;
    }

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_txt(&self) -> Result<lodestone::text::Reader<'a>> {
            self.reader.get_pointer_field(0).get_text()
        }

        pub fn get_lst(&self) -> Result<text_list::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(1))
        }
    }

    impl<'a> FromStructReader<'a> for Reader<'a> {
        fn new(reader: StructReader<'a>) -> Self {
            Self { reader }
        }
    }

    impl<'a> FromPointerReader<'a> for Reader<'a> {
        fn get_from_pointer(reader: &PointerReader<'a>) -> Result<Self> {
            Ok(Self {
                reader: reader.get_struct()?,
            })
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_txt(&mut self, value: &str) -> Result<()> {
            self.builder.get_pointer_field(0).set_text(value)
        }

        pub fn set_lst(&mut self, value: text_list::Reader<'_>) -> Result<()> {
            SetPointerBuilder::set_pointer_builder(self.builder.get_pointer_field(1), value)
        }

        pub fn init_lst(self, size: u32) -> text_list::Builder<'a> {
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(1), size)
        }

        pub fn get_lst(self) -> Result<text_list::Builder<'a>> {
            FromPointerBuilder::get_from_pointer(self.builder.into_pointer_field(1))
        }

        pub fn reborrow(&mut self) -> Builder<'_> {
            Builder {
                builder: self.builder.reborrow(),
            }
        }
    }

    impl<'a> FromStructBuilder<'a> for Builder<'a> {
        fn new(builder: StructBuilder<'a>) -> Self {
            Self { builder }
        }
    }

    impl<'a> FromPointerBuilder<'a> for Builder<'a> {
        fn init_pointer(builder: PointerBuilder<'a>, _length: u32) -> Self {
            Self {
                builder: builder.init_struct(STRUCT_SIZE).expect("allocate struct"),
            }
        }

        fn get_from_pointer(builder: PointerBuilder<'a>) -> Result<Self> {
            Ok(Self {
                builder: builder.get_struct(STRUCT_SIZE)?,
            })
        }
    }
}

/// A struct with nonzero field defaults, for checking the XOR default masks:
/// `tightness :UInt16 = 500; locked :Bool = true; label :Text`.
pub mod wrench {
    use lodestone::private::layout::{
        PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
    };
    use lodestone::traits::{
        FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
    };
    use lodestone::Result;

    pub const STRUCT_SIZE: StructSize = StructSize {
        data: 1,
        pointers: 1,
    };

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_tightness(&self) -> u16 {
            self.reader.get_data_field_mask::<u16>(0, 500)
        }

        pub fn get_locked(&self) -> bool {
            self.reader.get_bool_field_mask(16, true)
        }

        pub fn get_label(&self) -> Result<lodestone::text::Reader<'a>> {
            self.reader.get_pointer_field(0).get_text()
        }
    }

    impl<'a> FromStructReader<'a> for Reader<'a> {
        fn new(reader: StructReader<'a>) -> Self {
            Self { reader }
        }
    }

    impl<'a> FromPointerReader<'a> for Reader<'a> {
        fn get_from_pointer(reader: &PointerReader<'a>) -> Result<Self> {
            Ok(Self {
                reader: reader.get_struct()?,
            })
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_tightness(&mut self, value: u16) {
            self.builder.set_data_field_mask::<u16>(0, value, 500);
        }

        pub fn get_tightness(&self) -> u16 {
            self.builder.get_data_field_mask::<u16>(0, 500)
        }

        pub fn set_locked(&mut self, value: bool) {
            self.builder.set_bool_field_mask(16, value, true);
        }

        pub fn get_locked(&self) -> bool {
            self.builder.get_bool_field_mask(16, true)
        }

        pub fn into_reader(self) -> Reader<'a> {
            Reader {
                reader: self.builder.as_reader(),
            }
        }
    }

    impl<'a> FromStructBuilder<'a> for Builder<'a> {
        fn new(builder: StructBuilder<'a>) -> Self {
            Self { builder }
        }
    }

    impl<'a> FromPointerBuilder<'a> for Builder<'a> {
        fn init_pointer(builder: PointerBuilder<'a>, _length: u32) -> Self {
            Self {
                builder: builder.init_struct(STRUCT_SIZE).expect("allocate struct"),
            }
        }

        fn get_from_pointer(builder: PointerBuilder<'a>) -> Result<Self> {
            Ok(Self {
                builder: builder.get_struct(STRUCT_SIZE)?,
            })
        }
    }
}
