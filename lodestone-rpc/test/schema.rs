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

//! Hand-maintained typed views for the RPC test schema, in the shape a code
//! generator would emit: per interface a stable 64-bit id, per method a
//! 16-bit id, and typed parameter/result views.

use lodestone::private::layout::{
    PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize,
};
use lodestone::traits::{
    FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader,
};
use lodestone::Result;
use lodestone_rpc::Client;

macro_rules! struct_view {
    ($size:expr) => {
        pub const STRUCT_SIZE: StructSize = $size;

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

pub mod call_order {
    use super::*;

    pub const INTERFACE_ID: u64 = 0x92c5_ca83_14cd_d2a5;
    pub const GET_CALL_SEQUENCE: u16 = 0;

    pub mod get_call_sequence_params {
        use super::*;

        #[derive(Clone, Copy)]
        pub struct Reader<'a> {
            reader: StructReader<'a>,
        }

        impl<'a> Reader<'a> {
            pub fn get_expected(&self) -> u32 {
                self.reader.get_data_field::<u32>(0)
            }
        }

        pub struct Builder<'a> {
            builder: StructBuilder<'a>,
        }

        impl<'a> Builder<'a> {
            pub fn set_expected(&mut self, value: u32) {
                self.builder.set_data_field::<u32>(0, value);
            }
        }

        struct_view!(StructSize {
            data: 1,
            pointers: 0,
        });
    }

    pub mod get_call_sequence_results {
        use super::*;

        #[derive(Clone, Copy)]
        pub struct Reader<'a> {
            reader: StructReader<'a>,
        }

        impl<'a> Reader<'a> {
            pub fn get_n(&self) -> u32 {
                self.reader.get_data_field::<u32>(0)
            }
        }

        pub struct Builder<'a> {
            builder: StructBuilder<'a>,
        }

        impl<'a> Builder<'a> {
            pub fn set_n(&mut self, value: u32) {
                self.builder.set_data_field::<u32>(0, value);
            }
        }

        struct_view!(StructSize {
            data: 1,
            pointers: 0,
        });
    }
}

pub mod echoer {
    use super::*;

    pub const INTERFACE_ID: u64 = 0x8417_56c6_a41b_2a45;
    pub const ECHO: u16 = 0;

    pub mod echo_params {
        use super::*;

        #[derive(Clone, Copy)]
        pub struct Reader<'a> {
            reader: StructReader<'a>,
        }

        impl<'a> Reader<'a> {
            pub fn get_cap(&self) -> Result<Client> {
                Ok(Client::from_hook(
                    self.reader.get_pointer_field(0).get_capability()?,
                ))
            }
        }

        pub struct Builder<'a> {
            builder: StructBuilder<'a>,
        }

        impl<'a> Builder<'a> {
            pub fn set_cap(&mut self, client: Client) -> Result<()> {
                self.builder
                    .get_pointer_field(0)
                    .set_capability(Box::new(client))
            }
        }

        struct_view!(StructSize {
            data: 0,
            pointers: 1,
        });
    }

    pub mod echo_results {
        use super::*;

        #[derive(Clone, Copy)]
        pub struct Reader<'a> {
            reader: StructReader<'a>,
        }

        impl<'a> Reader<'a> {
            pub fn get_cap(&self) -> Result<Client> {
                Ok(Client::from_hook(
                    self.reader.get_pointer_field(0).get_capability()?,
                ))
            }
        }

        pub struct Builder<'a> {
            builder: StructBuilder<'a>,
        }

        impl<'a> Builder<'a> {
            pub fn set_cap(&mut self, client: Client) -> Result<()> {
                self.builder
                    .get_pointer_field(0)
                    .set_capability(Box::new(client))
            }
        }

        struct_view!(StructSize {
            data: 0,
            pointers: 1,
        });
    }
}

pub mod handle_factory {
    use super::*;

    pub const INTERFACE_ID: u64 = 0x8491_a7fe_75fe_0bce;
    pub const NEW_HANDLE: u16 = 0;

    pub mod new_handle_results {
        use super::*;

        #[derive(Clone, Copy)]
        pub struct Reader<'a> {
            reader: StructReader<'a>,
        }

        impl<'a> Reader<'a> {
            pub fn get_handle(&self) -> Result<Client> {
                Ok(Client::from_hook(
                    self.reader.get_pointer_field(0).get_capability()?,
                ))
            }
        }

        pub struct Builder<'a> {
            builder: StructBuilder<'a>,
        }

        impl<'a> Builder<'a> {
            pub fn set_handle(&mut self, client: Client) -> Result<()> {
                self.builder
                    .get_pointer_field(0)
                    .set_capability(Box::new(client))
            }
        }

        struct_view!(StructSize {
            data: 0,
            pointers: 1,
        });
    }
}

pub mod hanger {
    pub const INTERFACE_ID: u64 = 0x8ae0_8044_aae8_a26e;
    pub const HANG: u16 = 0;
}
