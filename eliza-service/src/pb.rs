//! Messages of the `connectrpc.eliza.v1` package and their descriptors.
//!
//! The structs are declared by hand with `prost` derives; [`file_descriptor_set`]
//! describes the same schema for descriptor driven callers.
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, MethodOptions, ServiceDescriptorProto,
    field_descriptor_proto::{Label, Type},
    method_options::IdempotencyLevel,
};
use serde::{Deserialize, Serialize};

const PACKAGE: &str = "connectrpc.eliza.v1";

macro_rules! sentence_message {
    ($name:ident, $field:ident) => {
        #[derive(Clone, PartialEq, Eq, Hash, prost::Message, Serialize, Deserialize)]
        #[serde(default, rename_all = "camelCase")]
        pub struct $name {
            #[prost(string, tag = "1")]
            pub $field: String,
        }

        impl prost::Name for $name {
            const NAME: &'static str = stringify!($name);
            const PACKAGE: &'static str = PACKAGE;
        }
    };
}

sentence_message!(SayRequest, sentence);
sentence_message!(SayResponse, sentence);
sentence_message!(ConverseRequest, sentence);
sentence_message!(ConverseResponse, sentence);
sentence_message!(IntroduceRequest, name);
sentence_message!(IntroduceResponse, sentence);
sentence_message!(ConfideRequest, sentence);
sentence_message!(Hint, text);

#[derive(Clone, PartialEq, Eq, Hash, prost::Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfideResponse {
    #[prost(string, tag = "1")]
    pub summary: String,
    #[prost(int32, tag = "2")]
    pub count: i32,
}

impl prost::Name for ConfideResponse {
    const NAME: &'static str = "ConfideResponse";
    const PACKAGE: &'static str = PACKAGE;
}

fn field(name: &str, number: i32, kind: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(kind as i32),
        json_name: Some(name.to_string()),
        ..Default::default()
    }
}

fn message(name: &str, fields: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: fields,
        ..Default::default()
    }
}

fn method(
    name: &str,
    client_streaming: bool,
    server_streaming: bool,
    options: Option<MethodOptions>,
) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_string()),
        input_type: Some(format!(".{PACKAGE}.{name}Request")),
        output_type: Some(format!(".{PACKAGE}.{name}Response")),
        client_streaming: Some(client_streaming),
        server_streaming: Some(server_streaming),
        options,
    }
}

/// The schema of `connectrpc/eliza/v1/eliza.proto`.
pub fn file_descriptor_set() -> FileDescriptorSet {
    let sentence = |name: &str| message(name, vec![field("sentence", 1, Type::String)]);
    let side_effect_free = MethodOptions {
        idempotency_level: Some(IdempotencyLevel::NoSideEffects as i32),
        ..Default::default()
    };

    let file = FileDescriptorProto {
        name: Some("connectrpc/eliza/v1/eliza.proto".to_string()),
        package: Some(PACKAGE.to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![
            sentence("SayRequest"),
            sentence("SayResponse"),
            sentence("ConverseRequest"),
            sentence("ConverseResponse"),
            message("IntroduceRequest", vec![field("name", 1, Type::String)]),
            sentence("IntroduceResponse"),
            sentence("ConfideRequest"),
            message(
                "ConfideResponse",
                vec![field("summary", 1, Type::String), field("count", 2, Type::Int32)],
            ),
            message("Hint", vec![field("text", 1, Type::String)]),
        ],
        service: vec![ServiceDescriptorProto {
            name: Some("ElizaService".to_string()),
            method: vec![
                method("Say", false, false, Some(side_effect_free)),
                method("Converse", true, true, None),
                method("Introduce", false, true, None),
                method("Confide", true, false, None),
            ],
            ..Default::default()
        }],
        ..Default::default()
    };
    FileDescriptorSet { file: vec![file] }
}

/// [`file_descriptor_set`], encoded as `protoc --descriptor_set_out` would write it.
pub fn file_descriptor_set_bytes() -> Vec<u8> {
    prost::Message::encode_to_vec(&file_descriptor_set())
}
