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

//! Typed views of the protocol envelope, maintained by hand in the shape a
//! code generator would emit. Every transport message is one serialized
//! message whose root is [`message`], a union over the protocol's message
//! kinds.

use lodestone::any_pointer;
use lodestone::private::layout::{
    PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
};
use lodestone::traits::{
    FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
};
use lodestone::Result;

macro_rules! view_boilerplate {
    ($size:expr) => {
        pub const STRUCT_SIZE: StructSize = $size;

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
    };
}

/// The envelope union. The discriminant lives in the first data word; the
/// member body shares the single pointer slot.
pub mod message {
    use super::*;

    pub const UNIMPLEMENTED: u16 = 0;
    pub const ABORT: u16 = 1;
    pub const CALL: u16 = 2;
    pub const RETURN: u16 = 3;
    pub const FINISH: u16 = 4;
    pub const RESOLVE: u16 = 5;
    pub const RELEASE: u16 = 6;
    pub const BOOTSTRAP: u16 = 8;
    pub const DISEMBARGO: u16 = 13;

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    pub enum Which<'a> {
        Unimplemented(any_pointer::Reader<'a>),
        Abort(super::exception::Reader<'a>),
        Call(super::call::Reader<'a>),
        Return(super::return_::Reader<'a>),
        Finish(super::finish::Reader<'a>),
        Resolve(super::resolve::Reader<'a>),
        Release(super::release::Reader<'a>),
        Bootstrap(super::bootstrap::Reader<'a>),
        Disembargo(super::disembargo::Reader<'a>),
        Unknown(u16),
    }

    impl<'a> Reader<'a> {
        pub fn which(&self) -> Result<Which<'a>> {
            let body = self.reader.get_pointer_field(0);
            Ok(match self.reader.get_data_field::<u16>(0) {
                UNIMPLEMENTED => Which::Unimplemented(any_pointer::Reader::new(body)),
                ABORT => Which::Abort(FromPointerReader::get_from_pointer(&body)?),
                CALL => Which::Call(FromPointerReader::get_from_pointer(&body)?),
                RETURN => Which::Return(FromPointerReader::get_from_pointer(&body)?),
                FINISH => Which::Finish(FromPointerReader::get_from_pointer(&body)?),
                RESOLVE => Which::Resolve(FromPointerReader::get_from_pointer(&body)?),
                RELEASE => Which::Release(FromPointerReader::get_from_pointer(&body)?),
                BOOTSTRAP => Which::Bootstrap(FromPointerReader::get_from_pointer(&body)?),
                DISEMBARGO => Which::Disembargo(FromPointerReader::get_from_pointer(&body)?),
                tag => Which::Unknown(tag),
            })
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        fn init_member<T: FromPointerBuilder<'a>>(mut self, tag: u16) -> T {
            self.builder.set_data_field::<u16>(0, tag);
            T::init_pointer(self.builder.into_pointer_field(0), 0)
        }

        fn get_member<T: FromPointerBuilder<'a>>(self) -> Result<T> {
            T::get_from_pointer(self.builder.into_pointer_field(0))
        }

        pub fn init_abort(self) -> super::exception::Builder<'a> {
            self.init_member(ABORT)
        }

        pub fn init_call(self) -> super::call::Builder<'a> {
            self.init_member(CALL)
        }

        pub fn get_call(self) -> Result<super::call::Builder<'a>> {
            self.get_member()
        }

        pub fn init_return(self) -> super::return_::Builder<'a> {
            self.init_member(RETURN)
        }

        pub fn get_return(self) -> Result<super::return_::Builder<'a>> {
            self.get_member()
        }

        pub fn init_finish(self) -> super::finish::Builder<'a> {
            self.init_member(FINISH)
        }

        pub fn init_resolve(self) -> super::resolve::Builder<'a> {
            self.init_member(RESOLVE)
        }

        pub fn get_resolve(self) -> Result<super::resolve::Builder<'a>> {
            self.get_member()
        }

        pub fn init_release(self) -> super::release::Builder<'a> {
            self.init_member(RELEASE)
        }

        pub fn init_bootstrap(self) -> super::bootstrap::Builder<'a> {
            self.init_member(BOOTSTRAP)
        }

        pub fn init_disembargo(self) -> super::disembargo::Builder<'a> {
            self.init_member(DISEMBARGO)
        }

        /// Wraps a copy of a received message that was not understood.
        pub fn set_unimplemented(mut self, original: any_pointer::Reader<'_>) -> Result<()> {
            self.builder.set_data_field::<u16>(0, UNIMPLEMENTED);
            any_pointer::Builder::new(self.builder.into_pointer_field(0)).set_as(original)
        }
    }

    view_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });
}

pub mod call {
    use super::*;

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_question_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_interface_id(&self) -> u64 {
            self.reader.get_data_field::<u64>(1)
        }

        pub fn get_method_id(&self) -> u16 {
            self.reader.get_data_field::<u16>(2)
        }

        pub fn get_target(&self) -> Result<super::message_target::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0))
        }

        pub fn get_params(&self) -> Result<super::payload::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(1))
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn set_interface_id(&mut self, value: u64) {
            self.builder.set_data_field::<u64>(1, value);
        }

        pub fn set_method_id(&mut self, value: u16) {
            self.builder.set_data_field::<u16>(2, value);
        }

        pub fn reborrow(&mut self) -> Builder<'_> {
            Builder {
                builder: self.builder.reborrow(),
            }
        }

        pub fn init_target(self) -> super::message_target::Builder<'a> {
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(0), 0)
        }

        pub fn init_params(self) -> super::payload::Builder<'a> {
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(1), 0)
        }

        pub fn get_params(self) -> Result<super::payload::Builder<'a>> {
            FromPointerBuilder::get_from_pointer(self.builder.into_pointer_field(1))
        }
    }

    view_boilerplate!(StructSize {
        data: 3,
        pointers: 3,
    });
}

pub mod return_ {
    use super::*;

    pub const RESULTS: u16 = 0;
    pub const EXCEPTION: u16 = 1;
    pub const CANCELED: u16 = 2;

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    pub enum Which<'a> {
        Results(super::payload::Reader<'a>),
        Exception(super::exception::Reader<'a>),
        Canceled,
        Unknown(u16),
    }

    impl<'a> Reader<'a> {
        pub fn get_answer_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_release_param_caps(&self) -> bool {
            self.reader.get_bool_field_mask(32, true)
        }

        pub fn which(&self) -> Result<Which<'a>> {
            let body = self.reader.get_pointer_field(0);
            Ok(match self.reader.get_data_field::<u16>(3) {
                RESULTS => Which::Results(FromPointerReader::get_from_pointer(&body)?),
                EXCEPTION => Which::Exception(FromPointerReader::get_from_pointer(&body)?),
                CANCELED => Which::Canceled,
                tag => Which::Unknown(tag),
            })
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_answer_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn set_release_param_caps(&mut self, value: bool) {
            self.builder.set_bool_field_mask(32, value, true);
        }

        pub fn init_results(mut self) -> super::payload::Builder<'a> {
            self.builder.set_data_field::<u16>(3, RESULTS);
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(0), 0)
        }

        pub fn get_results(self) -> Result<super::payload::Builder<'a>> {
            FromPointerBuilder::get_from_pointer(self.builder.into_pointer_field(0))
        }

        pub fn init_exception(mut self) -> super::exception::Builder<'a> {
            self.builder.set_data_field::<u16>(3, EXCEPTION);
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(0), 0)
        }

        pub fn set_canceled(&mut self) {
            self.builder.set_data_field::<u16>(3, CANCELED);
        }
    }

    view_boilerplate!(StructSize {
        data: 2,
        pointers: 1,
    });
}

pub mod finish {
    use super::*;

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_question_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_release_result_caps(&self) -> bool {
            self.reader.get_bool_field_mask(32, true)
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn set_release_result_caps(&mut self, value: bool) {
            self.builder.set_bool_field_mask(32, value, true);
        }
    }

    view_boilerplate!(StructSize {
        data: 1,
        pointers: 0,
    });
}

pub mod resolve {
    use super::*;

    pub const CAP: u16 = 0;
    pub const EXCEPTION: u16 = 1;

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    pub enum Which<'a> {
        Cap(super::cap_descriptor::Reader<'a>),
        Exception(super::exception::Reader<'a>),
        Unknown(u16),
    }

    impl<'a> Reader<'a> {
        pub fn get_promise_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn which(&self) -> Result<Which<'a>> {
            let body = self.reader.get_pointer_field(0);
            Ok(match self.reader.get_data_field::<u16>(2) {
                CAP => Which::Cap(FromPointerReader::get_from_pointer(&body)?),
                EXCEPTION => Which::Exception(FromPointerReader::get_from_pointer(&body)?),
                tag => Which::Unknown(tag),
            })
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_promise_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn init_cap(mut self) -> super::cap_descriptor::Builder<'a> {
            self.builder.set_data_field::<u16>(2, CAP);
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(0), 0)
        }

        pub fn init_exception(mut self) -> super::exception::Builder<'a> {
            self.builder.set_data_field::<u16>(2, EXCEPTION);
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(0), 0)
        }
    }

    view_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });
}

pub mod release {
    use super::*;

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_reference_count(&self) -> u32 {
            self.reader.get_data_field::<u32>(1)
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn set_reference_count(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(1, value);
        }
    }

    view_boilerplate!(StructSize {
        data: 1,
        pointers: 0,
    });
}

pub mod bootstrap {
    use super::*;

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_question_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }
    }

    view_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });
}

pub mod disembargo {
    use super::*;

    pub const SENDER_LOOPBACK: u16 = 0;
    pub const RECEIVER_LOOPBACK: u16 = 1;
    pub const ACCEPT: u16 = 2;
    pub const PROVIDE: u16 = 3;

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    pub enum Which {
        SenderLoopback(u32),
        ReceiverLoopback(u32),
        Accept,
        Provide(u32),
        Unknown(u16),
    }

    impl<'a> Reader<'a> {
        pub fn get_target(&self) -> Result<super::message_target::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0))
        }

        pub fn which(&self) -> Which {
            let value = self.reader.get_data_field::<u32>(0);
            match self.reader.get_data_field::<u16>(2) {
                SENDER_LOOPBACK => Which::SenderLoopback(value),
                RECEIVER_LOOPBACK => Which::ReceiverLoopback(value),
                ACCEPT => Which::Accept,
                PROVIDE => Which::Provide(value),
                tag => Which::Unknown(tag),
            }
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_sender_loopback(&mut self, embargo_id: u32) {
            self.builder.set_data_field::<u32>(0, embargo_id);
            self.builder.set_data_field::<u16>(2, SENDER_LOOPBACK);
        }

        pub fn set_receiver_loopback(&mut self, embargo_id: u32) {
            self.builder.set_data_field::<u32>(0, embargo_id);
            self.builder.set_data_field::<u16>(2, RECEIVER_LOOPBACK);
        }

        pub fn init_target(self) -> super::message_target::Builder<'a> {
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(0), 0)
        }
    }

    view_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });
}

pub mod message_target {
    use super::*;

    pub const IMPORTED_CAP: u16 = 0;
    pub const PROMISED_ANSWER: u16 = 1;

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    pub enum Which<'a> {
        ImportedCap(u32),
        PromisedAnswer(super::promised_answer::Reader<'a>),
        Unknown(u16),
    }

    impl<'a> Reader<'a> {
        pub fn which(&self) -> Result<Which<'a>> {
            Ok(match self.reader.get_data_field::<u16>(2) {
                IMPORTED_CAP => Which::ImportedCap(self.reader.get_data_field::<u32>(0)),
                PROMISED_ANSWER => Which::PromisedAnswer(FromPointerReader::get_from_pointer(
                    &self.reader.get_pointer_field(0),
                )?),
                tag => Which::Unknown(tag),
            })
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_imported_cap(&mut self, id: u32) {
            self.builder.set_data_field::<u32>(0, id);
            self.builder.set_data_field::<u16>(2, IMPORTED_CAP);
        }

        pub fn init_promised_answer(mut self) -> super::promised_answer::Builder<'a> {
            self.builder.set_data_field::<u16>(2, PROMISED_ANSWER);
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(0), 0)
        }
    }

    view_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });
}

pub mod promised_answer {
    use super::*;

    pub mod op {
        use super::*;

        pub const NOOP: u16 = 0;
        pub const GET_POINTER_FIELD: u16 = 1;

        #[derive(Clone, Copy)]
        pub struct Reader<'a> {
            reader: StructReader<'a>,
        }

        pub enum Which {
            Noop,
            GetPointerField(u16),
            Unknown(u16),
        }

        impl<'a> Reader<'a> {
            pub fn which(&self) -> Which {
                match self.reader.get_data_field::<u16>(0) {
                    NOOP => Which::Noop,
                    GET_POINTER_FIELD => {
                        Which::GetPointerField(self.reader.get_data_field::<u16>(1))
                    }
                    tag => Which::Unknown(tag),
                }
            }
        }

        pub struct Builder<'a> {
            builder: StructBuilder<'a>,
        }

        impl<'a> Builder<'a> {
            pub fn set_noop(&mut self) {
                self.builder.set_data_field::<u16>(0, NOOP);
            }

            pub fn set_get_pointer_field(&mut self, index: u16) {
                self.builder.set_data_field::<u16>(0, GET_POINTER_FIELD);
                self.builder.set_data_field::<u16>(1, index);
            }
        }

        view_boilerplate!(StructSize {
            data: 1,
            pointers: 0,
        });
    }

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_question_id(&self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_transform(&self) -> Result<lodestone::struct_list::Reader<'a, op::Owned>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0))
        }

        pub fn has_transform(&self) -> bool {
            !self.reader.get_pointer_field(0).is_null()
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn init_transform(
            self,
            size: u32,
        ) -> lodestone::struct_list::Builder<'a, op::Owned> {
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(0), size)
        }
    }

    view_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });
}

pub mod payload {
    use super::*;

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_content(&self) -> any_pointer::Reader<'a> {
            any_pointer::Reader::new(self.reader.get_pointer_field(0))
        }

        pub fn get_cap_table(
            &self,
        ) -> Result<lodestone::struct_list::Reader<'a, super::cap_descriptor::Owned>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(1))
        }

        pub fn has_cap_table(&self) -> bool {
            !self.reader.get_pointer_field(1).is_null()
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn get_content(self) -> any_pointer::Builder<'a> {
            any_pointer::Builder::new(self.builder.into_pointer_field(0))
        }

        pub fn init_cap_table(
            self,
            size: u32,
        ) -> lodestone::struct_list::Builder<'a, super::cap_descriptor::Owned> {
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(1), size)
        }

        pub fn reborrow(&mut self) -> Builder<'_> {
            Builder {
                builder: self.builder.reborrow(),
            }
        }
    }

    view_boilerplate!(StructSize {
        data: 0,
        pointers: 2,
    });
}

pub mod cap_descriptor {
    use super::*;

    pub const NONE: u16 = 0;
    pub const SENDER_HOSTED: u16 = 1;
    pub const SENDER_PROMISE: u16 = 2;
    pub const RECEIVER_HOSTED: u16 = 3;
    pub const RECEIVER_ANSWER: u16 = 4;
    pub const THIRD_PARTY_HOSTED: u16 = 5;

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    pub enum Which<'a> {
        None,
        SenderHosted(u32),
        SenderPromise(u32),
        ReceiverHosted(u32),
        ReceiverAnswer(super::promised_answer::Reader<'a>),
        ThirdPartyHosted,
        Unknown(u16),
    }

    impl<'a> Reader<'a> {
        pub fn which(&self) -> Result<Which<'a>> {
            let id = self.reader.get_data_field::<u32>(1);
            Ok(match self.reader.get_data_field::<u16>(0) {
                NONE => Which::None,
                SENDER_HOSTED => Which::SenderHosted(id),
                SENDER_PROMISE => Which::SenderPromise(id),
                RECEIVER_HOSTED => Which::ReceiverHosted(id),
                RECEIVER_ANSWER => Which::ReceiverAnswer(FromPointerReader::get_from_pointer(
                    &self.reader.get_pointer_field(0),
                )?),
                THIRD_PARTY_HOSTED => Which::ThirdPartyHosted,
                tag => Which::Unknown(tag),
            })
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_none(&mut self) {
            self.builder.set_data_field::<u16>(0, NONE);
        }

        pub fn set_sender_hosted(&mut self, id: u32) {
            self.builder.set_data_field::<u16>(0, SENDER_HOSTED);
            self.builder.set_data_field::<u32>(1, id);
        }

        pub fn set_sender_promise(&mut self, id: u32) {
            self.builder.set_data_field::<u16>(0, SENDER_PROMISE);
            self.builder.set_data_field::<u32>(1, id);
        }

        pub fn set_receiver_hosted(&mut self, id: u32) {
            self.builder.set_data_field::<u16>(0, RECEIVER_HOSTED);
            self.builder.set_data_field::<u32>(1, id);
        }

        pub fn init_receiver_answer(mut self) -> super::promised_answer::Builder<'a> {
            self.builder.set_data_field::<u16>(0, RECEIVER_ANSWER);
            FromPointerBuilder::init_pointer(self.builder.into_pointer_field(0), 0)
        }
    }

    view_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });
}

pub mod exception {
    use super::*;

    pub const FAILED: u16 = 0;
    pub const OVERLOADED: u16 = 1;
    pub const DISCONNECTED: u16 = 2;
    pub const UNIMPLEMENTED: u16 = 3;

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_type(&self) -> u16 {
            self.reader.get_data_field::<u16>(0)
        }

        pub fn get_reason(&self) -> Result<lodestone::text::Reader<'a>> {
            self.reader.get_pointer_field(0).get_text()
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_type(&mut self, value: u16) {
            self.builder.set_data_field::<u16>(0, value);
        }

        pub fn set_reason(self, value: &str) -> Result<()> {
            self.builder.into_pointer_field(0).set_text(value)
        }
    }

    view_boilerplate!(StructSize {
        data: 1,
        pointers: 1,
    });
}
