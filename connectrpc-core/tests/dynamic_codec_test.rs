use connectrpc_core::{
    CallOptions, Code, Codec, DynamicCodec, Idempotency, MethodSpec, ProtocolClientConfig,
    StreamType, WireFormat,
    prost_reflect::{DescriptorPool, DynamicMessage, MapKey, MessageDescriptor, MethodDescriptor, Value},
};
use eliza_service::{CONVERSE, Encoding, SAY};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet, MessageOptions,
    field_descriptor_proto::{Label, Type},
};
use std::collections::HashMap;
use support::{HOST, PROTOCOLS, client, client_with, eliza_server};

mod support;

fn method(name: &str) -> MethodDescriptor {
    eliza_service::descriptor_pool()
        .unwrap()
        .get_service_by_name("connectrpc.eliza.v1.ElizaService")
        .unwrap()
        .methods()
        .find(|method| method.name() == name)
        .unwrap()
}

fn codec(method: &MethodDescriptor, format: WireFormat) -> DynamicCodec {
    DynamicCodec::new(method.input(), method.output(), format)
}

fn sentence(method: &MethodDescriptor, text: &str) -> DynamicMessage {
    let mut message = DynamicMessage::new(method.input());
    message.set_field_by_name("sentence", Value::String(text.to_string()));
    message
}

#[test]
fn test_method_spec_from_descriptor() {
    let say = MethodSpec::from_descriptor(&method("Say"));
    assert_eq!(say.path, SAY);
    assert_eq!(say.stream_type, StreamType::Unary);
    assert_eq!(say.idempotency, Idempotency::NoSideEffects);

    let converse = MethodSpec::from_descriptor(&method("Converse"));
    assert_eq!(converse.path, CONVERSE);
    assert_eq!(converse.stream_type, StreamType::Bidi);
    assert_eq!(converse.idempotency, Idempotency::Unknown);
}

#[tokio::test]
async fn test_dynamic_unary_over_proto() {
    let say = method("Say");
    for protocol in PROTOCOLS {
        let response = client(protocol)
            .unary(
                &MethodSpec::unary(SAY),
                codec(&say, WireFormat::Proto),
                sentence(&say, "I feel curious"),
                CallOptions::new(),
            )
            .await
            .unwrap();

        let reply = response.message.get_field_by_name("sentence").unwrap();
        assert_eq!(reply.as_str(), Some("Why do you feel curious?"), "{protocol:?}");
    }
}

#[tokio::test]
async fn test_dynamic_unary_over_json() {
    let say = method("Say");
    let server = eliza_server(Encoding::Json);
    for protocol in PROTOCOLS {
        let client = client_with(
            server.clone(),
            ProtocolClientConfig::builder(HOST).protocol(protocol),
        );
        let response = client
            .unary(
                &MethodSpec::unary(SAY),
                codec(&say, WireFormat::Json),
                sentence(&say, "hi"),
                CallOptions::new(),
            )
            .await
            .unwrap();

        let reply = response.message.get_field_by_name("sentence").unwrap();
        assert_eq!(reply.as_str(), Some("Hello, how are you feeling today?"));
    }
}

#[tokio::test]
async fn test_dynamic_bidi() {
    let converse = method("Converse");
    for protocol in PROTOCOLS {
        let mut stream = client(protocol)
            .bidi_stream(
                &MethodSpec::bidi_streaming(CONVERSE),
                codec(&converse, WireFormat::Proto),
                CallOptions::new(),
            )
            .unwrap();
        stream.send(&sentence(&converse, "I am here")).await.unwrap();
        stream.close_send();

        let reply = stream.message().await.unwrap().unwrap();
        let text = reply.get_field_by_name("sentence").unwrap();
        assert_eq!(text.as_str(), Some("How long have you been here?"), "{protocol:?}");
        assert!(stream.message().await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_dynamic_codec_rejects_foreign_messages() {
    let say = method("Say");
    let introduce = method("Introduce");
    let error = client(connectrpc_core::NetworkProtocol::Connect)
        .unary(
            &MethodSpec::unary(SAY),
            codec(&say, WireFormat::Proto),
            DynamicMessage::new(introduce.input()),
            CallOptions::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code, Code::Internal);
}

fn string_field(name: &str, number: i32) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(Type::String as i32),
        json_name: Some(name.to_string()),
        ..Default::default()
    }
}

/// `message Labeled { map<string, string> labels = 1; }`
fn labeled_descriptor() -> MessageDescriptor {
    let entry = DescriptorProto {
        name: Some("LabelsEntry".to_string()),
        field: vec![string_field("key", 1), string_field("value", 2)],
        options: Some(MessageOptions {
            map_entry: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };
    let labeled = DescriptorProto {
        name: Some("Labeled".to_string()),
        field: vec![FieldDescriptorProto {
            name: Some("labels".to_string()),
            number: Some(1),
            label: Some(Label::Repeated as i32),
            r#type: Some(Type::Message as i32),
            type_name: Some(".test.labels.Labeled.LabelsEntry".to_string()),
            json_name: Some("labels".to_string()),
            ..Default::default()
        }],
        nested_type: vec![entry],
        ..Default::default()
    };
    let file = FileDescriptorProto {
        name: Some("test/labels.proto".to_string()),
        package: Some("test.labels".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![labeled],
        ..Default::default()
    };
    DescriptorPool::from_file_descriptor_set(FileDescriptorSet { file: vec![file] })
        .unwrap()
        .get_message_by_name("test.labels.Labeled")
        .unwrap()
}

fn labeled(descriptor: &MessageDescriptor, entries: &[(&str, &str)]) -> DynamicMessage {
    let mut labels = HashMap::new();
    for (key, value) in entries {
        labels.insert(
            MapKey::String(key.to_string()),
            Value::String(value.to_string()),
        );
    }
    let mut message = DynamicMessage::new(descriptor.clone());
    message.set_field_by_name("labels", Value::Map(labels));
    message
}

#[test]
fn test_deterministic_proto_encoding_sorts_map_entries() {
    let descriptor = labeled_descriptor();
    let codec = DynamicCodec::new(descriptor.clone(), descriptor.clone(), WireFormat::Proto);
    let first = labeled(&descriptor, &[("c", "3"), ("a", "1"), ("b", "2")]);
    let second = labeled(&descriptor, &[("b", "2"), ("c", "3"), ("a", "1")]);

    let encoded = codec.encode_deterministic(&first).unwrap();
    assert_eq!(encoded, codec.encode_deterministic(&second).unwrap());
    assert_eq!(
        encoded.as_ref(),
        [
            0x0a, 6, 0x0a, 1, b'a', 0x12, 1, b'1', //
            0x0a, 6, 0x0a, 1, b'b', 0x12, 1, b'2', //
            0x0a, 6, 0x0a, 1, b'c', 0x12, 1, b'3',
        ]
    );
    assert_eq!(codec.decode(encoded).unwrap(), first);
}
