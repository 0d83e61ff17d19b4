use connectrpc_core::{
    CallOptions, Code, ConnectServer, GetConfiguration, GzipCompressionPool, HandlerSpec,
    Idempotency, JsonCodec, MethodSpec, NetworkProtocol, ProtoCodec, ProtocolClientConfig,
    ServerConfig,
};
use eliza_service::{
    CONFIDE, CONVERSE, Encoding, INTRODUCE, SAY,
    pb::{
        ConfideRequest, ConfideResponse, ConverseRequest, ConverseResponse, Hint,
        IntroduceRequest, IntroduceResponse, SayRequest, SayResponse,
    },
};
use http::{HeaderName, HeaderValue, Method};
use std::{sync::Arc, time::Duration};
use support::{HOST, MethodRecorder, PROTOCOLS, client, client_with, eliza_server};
use tokio_stream::StreamExt;

mod support;

fn say_codec() -> ProtoCodec<SayRequest, SayResponse> {
    ProtoCodec::new()
}

fn say(sentence: &str) -> SayRequest {
    SayRequest {
        sentence: sentence.to_string(),
    }
}

#[tokio::test]
async fn test_unary_over_every_protocol() {
    for protocol in PROTOCOLS {
        let client = client(protocol);
        let response = client
            .unary(
                &MethodSpec::unary(SAY),
                say_codec(),
                say("I feel happy"),
                CallOptions::new(),
            )
            .await
            .unwrap_or_else(|err| panic!("{protocol:?}: {err}"));

        assert_eq!(response.message.sentence, "Why do you feel happy?");
        assert_eq!(
            response.trailers.get("x-eliza-turns").unwrap(),
            "1",
            "{protocol:?}"
        );
    }
}

#[tokio::test]
async fn test_unary_echoes_request_headers() {
    for protocol in PROTOCOLS {
        let options = CallOptions::new().with_header(
            HeaderName::from_static("x-echo"),
            HeaderValue::from_static("ping"),
        );
        let response = client(protocol)
            .unary(&MethodSpec::unary(SAY), say_codec(), say("hello"), options)
            .await
            .unwrap();
        assert_eq!(response.headers.get("x-echo").unwrap(), "ping", "{protocol:?}");
    }
}

#[tokio::test]
async fn test_unary_error_carries_details() {
    for protocol in PROTOCOLS {
        let error = client(protocol)
            .unary(
                &MethodSpec::unary(SAY),
                say_codec(),
                say(""),
                CallOptions::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(error.code, Code::InvalidArgument, "{protocol:?}");
        assert_eq!(error.message(), Some("sentence must not be empty"));
        let hints: Vec<Hint> = error.unpack_details();
        assert_eq!(hints[0].text, "try saying hello", "{protocol:?}");
    }
}

#[tokio::test]
async fn test_unknown_procedure_is_unimplemented() {
    for protocol in PROTOCOLS {
        let error = client(protocol)
            .unary(
                &MethodSpec::unary("connectrpc.eliza.v1.ElizaService/Sing"),
                say_codec(),
                say("la la la"),
                CallOptions::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(error.code, Code::Unimplemented, "{protocol:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_unary_timeout_is_deadline_exceeded() {
    for protocol in PROTOCOLS {
        let error = client(protocol)
            .unary(
                &MethodSpec::unary(SAY),
                say_codec(),
                say("sleep"),
                CallOptions::new().with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert_eq!(error.code, Code::DeadlineExceeded, "{protocol:?}");
    }
}

#[tokio::test]
async fn test_json_encoding() {
    let server = eliza_server(Encoding::Json);
    for protocol in PROTOCOLS {
        let client = client_with(
            server.clone(),
            ProtocolClientConfig::builder(HOST).protocol(protocol),
        );
        let response = client
            .unary(
                &MethodSpec::unary(SAY),
                JsonCodec::<SayRequest, SayResponse>::new(),
                say("I am lost"),
                CallOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.message.sentence, "How long have you been lost?");
    }
}

#[tokio::test]
async fn test_codec_mismatch_is_rejected() {
    let server = eliza_server(Encoding::Json);
    let client = client_with(server, ProtocolClientConfig::builder(HOST));
    let error = client
        .unary(
            &MethodSpec::unary(SAY),
            say_codec(),
            say("hello"),
            CallOptions::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code, Code::Unknown);
}

#[tokio::test]
async fn test_connect_get_for_side_effect_free_methods() {
    let recorder = MethodRecorder::new(eliza_server(Encoding::Proto));
    let client = client_with(
        recorder.clone(),
        ProtocolClientConfig::builder(HOST).get_configuration(GetConfiguration::Enabled),
    );

    let spec = MethodSpec::unary(SAY).with_idempotency(Idempotency::NoSideEffects);
    let response = client
        .unary(&spec, say_codec(), say("hello"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(response.message.sentence, "Hello, how are you feeling today?");

    client
        .unary(&MethodSpec::unary(SAY), say_codec(), say("hello"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(recorder.recorded(), vec![Method::GET, Method::POST]);
}

#[tokio::test]
async fn test_gzip_requests_and_responses() {
    for protocol in PROTOCOLS {
        let client = client_with(
            eliza_server(Encoding::Proto),
            ProtocolClientConfig::builder(HOST)
                .protocol(protocol)
                .request_compression(0, Arc::new(GzipCompressionPool)),
        );
        let sentence = "I feel ".to_string() + &"very ".repeat(400) + "calm";
        let response = client
            .unary(
                &MethodSpec::unary(SAY),
                say_codec(),
                say(&sentence),
                CallOptions::new(),
            )
            .await
            .unwrap();
        assert!(response.message.sentence.ends_with("very calm?"), "{protocol:?}");

        let mut stream = client
            .server_stream(
                &MethodSpec::server_streaming(INTRODUCE),
                ProtoCodec::<IntroduceRequest, IntroduceResponse>::new(),
                IntroduceRequest {
                    name: "x".repeat(2048),
                },
                CallOptions::new(),
            )
            .await
            .unwrap();
        let first = stream.message().await.unwrap().unwrap();
        assert!(first.sentence.starts_with("Hi xxxx"), "{protocol:?}");
    }
}

#[tokio::test]
async fn test_server_streaming() {
    for protocol in PROTOCOLS {
        let stream = client(protocol)
            .server_stream(
                &MethodSpec::server_streaming(INTRODUCE),
                ProtoCodec::<IntroduceRequest, IntroduceResponse>::new(),
                IntroduceRequest {
                    name: "Ada".to_string(),
                },
                CallOptions::new(),
            )
            .await
            .unwrap();

        let sentences: Vec<String> = stream
            .into_stream()
            .map(|message| message.unwrap().sentence)
            .collect()
            .await;
        assert_eq!(sentences.len(), 3, "{protocol:?}");
        assert_eq!(sentences[0], "Hi Ada. I'm Eliza.");
    }
}

#[tokio::test]
async fn test_server_streaming_error_after_first_message() {
    for protocol in PROTOCOLS {
        let mut stream = client(protocol)
            .server_stream(
                &MethodSpec::server_streaming(INTRODUCE),
                ProtoCodec::<IntroduceRequest, IntroduceResponse>::new(),
                IntroduceRequest {
                    name: "fail".to_string(),
                },
                CallOptions::new(),
            )
            .await
            .unwrap();

        let first = stream.message().await.unwrap().unwrap();
        assert_eq!(first.sentence, "Hi fail. I'm Eliza.");
        let error = stream.message().await.unwrap_err();
        assert_eq!(error.code, Code::ResourceExhausted, "{protocol:?}");
        assert_eq!(error.message(), Some("Eliza is too tired to continue"));
        assert!(stream.message().await.unwrap().is_none());
        assert!(stream.is_receive_closed());
    }
}

#[tokio::test]
async fn test_client_streaming() {
    for protocol in PROTOCOLS {
        let mut stream = client(protocol)
            .client_stream(
                &MethodSpec::client_streaming(CONFIDE),
                ProtoCodec::<ConfideRequest, ConfideResponse>::new(),
                CallOptions::new(),
            )
            .unwrap();
        for sentence in ["I lied", "I cheated", "I regret nothing"] {
            stream
                .send(&ConfideRequest {
                    sentence: sentence.to_string(),
                })
                .await
                .unwrap();
        }

        let response = stream.close_and_receive().await.unwrap();
        assert_eq!(response.message.count, 3, "{protocol:?}");
        assert!(response.message.summary.contains("I regret nothing"));
    }
}

#[tokio::test]
async fn test_client_streaming_without_requests() {
    for protocol in PROTOCOLS {
        let stream = client(protocol)
            .client_stream(
                &MethodSpec::client_streaming(CONFIDE),
                ProtoCodec::<ConfideRequest, ConfideResponse>::new(),
                CallOptions::new(),
            )
            .unwrap();
        let response = stream.close_and_receive().await.unwrap();
        assert_eq!(response.message.count, 0, "{protocol:?}");
    }
}

#[tokio::test]
async fn test_bidi_streaming() {
    for protocol in PROTOCOLS {
        let mut stream = client(protocol)
            .bidi_stream(
                &MethodSpec::bidi_streaming(CONVERSE),
                ProtoCodec::<ConverseRequest, ConverseResponse>::new(),
                CallOptions::new(),
            )
            .unwrap();

        stream
            .send(&ConverseRequest {
                sentence: "Hello".to_string(),
            })
            .await
            .unwrap();
        let reply = stream.message().await.unwrap().unwrap();
        assert_eq!(reply.sentence, "Hello, how are you feeling today?");
        assert!(stream.response_headers().await.contains_key("content-type"));

        stream
            .send(&ConverseRequest {
                sentence: "I feel tired".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            stream.message().await.unwrap().unwrap().sentence,
            "Why do you feel tired?"
        );

        stream.close_send();
        assert!(stream.is_send_closed());
        assert!(stream.message().await.unwrap().is_none(), "{protocol:?}");
        assert!(stream.is_receive_closed());
    }
}

#[tokio::test]
async fn test_bidi_send_after_close_fails() {
    let mut stream = client(NetworkProtocol::Connect)
        .bidi_stream(
            &MethodSpec::bidi_streaming(CONVERSE),
            ProtoCodec::<ConverseRequest, ConverseResponse>::new(),
            CallOptions::new(),
        )
        .unwrap();
    stream.close_send();
    let error = stream
        .send(&ConverseRequest {
            sentence: "too late".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(error.code, Code::FailedPrecondition);
}

#[tokio::test]
async fn test_bidi_server_ends_conversation() {
    for protocol in PROTOCOLS {
        let mut stream = client(protocol)
            .bidi_stream(
                &MethodSpec::bidi_streaming(CONVERSE),
                ProtoCodec::<ConverseRequest, ConverseResponse>::new(),
                CallOptions::new(),
            )
            .unwrap();
        stream
            .send(&ConverseRequest {
                sentence: "goodbye".to_string(),
            })
            .await
            .unwrap();

        let reply = stream.message().await.unwrap().unwrap();
        assert!(reply.sentence.starts_with("Goodbye"));
        assert!(stream.message().await.unwrap().is_none(), "{protocol:?}");
    }
}

/// Answers every client stream with `count` messages once the requests end.
fn replying_server(count: i32) -> ConnectServer {
    ConnectServer::new(ServerConfig::default()).register(HandlerSpec::bidi_streaming(
        CONFIDE,
        ProtoCodec::<ConfideResponse, ConfideRequest>::new(),
        move |_ctx, mut requests, responses| async move {
            while requests.message().await?.is_some() {}
            for index in 0..count {
                let response = ConfideResponse {
                    summary: String::new(),
                    count: index,
                };
                responses.send(&response).await?;
            }
            Ok(())
        },
    ))
}

#[tokio::test]
async fn test_client_streaming_requires_exactly_one_response() {
    for protocol in PROTOCOLS {
        for (count, code) in [(0, Code::Unknown), (2, Code::Unimplemented)] {
            let client = client_with(
                replying_server(count),
                ProtocolClientConfig::builder(HOST).protocol(protocol),
            );
            let mut stream = client
                .client_stream(
                    &MethodSpec::client_streaming(CONFIDE),
                    ProtoCodec::<ConfideRequest, ConfideResponse>::new(),
                    CallOptions::new(),
                )
                .unwrap();
            stream
                .send(&ConfideRequest {
                    sentence: "I lied".to_string(),
                })
                .await
                .unwrap();

            let error = stream.close_and_receive().await.unwrap_err();
            assert_eq!(error.code, code, "{protocol:?} with {count} responses");
            if count == 0 {
                assert_eq!(error.message(), Some("missing response message"));
            }
        }
    }
}

/// Eliza handlers that panic: `Say` on "panic", `Introduce` after its first message.
fn panicking_server() -> ConnectServer {
    ConnectServer::new(ServerConfig::default())
        .register(HandlerSpec::unary(
            SAY,
            ProtoCodec::<SayResponse, SayRequest>::new(),
            |_ctx, request: SayRequest| async move {
                if request.sentence == "panic" {
                    panic!("Say gave up");
                }
                Ok(SayResponse {
                    sentence: request.sentence,
                })
            },
        ))
        .register(HandlerSpec::server_streaming(
            INTRODUCE,
            ProtoCodec::<IntroduceResponse, IntroduceRequest>::new(),
            |_ctx, request: IntroduceRequest, responses| async move {
                let greeting = IntroduceResponse {
                    sentence: format!("Hi {}.", request.name),
                };
                responses.send(&greeting).await?;
                if request.name == "panic" {
                    panic!("Introduce gave up");
                }
                Ok(())
            },
        ))
}

#[tokio::test]
async fn test_unary_handler_panic_is_internal() {
    for protocol in PROTOCOLS {
        let client = client_with(
            panicking_server(),
            ProtocolClientConfig::builder(HOST).protocol(protocol),
        );
        let error = client
            .unary(
                &MethodSpec::unary(SAY),
                say_codec(),
                say("panic"),
                CallOptions::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(error.code, Code::Internal, "{protocol:?}");
        assert_eq!(error.message(), Some("handler panicked"), "{protocol:?}");

        let response = client
            .unary(
                &MethodSpec::unary(SAY),
                say_codec(),
                say("still here"),
                CallOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.message.sentence, "still here");
    }
}

#[tokio::test]
async fn test_streaming_handler_panic_is_internal() {
    for protocol in PROTOCOLS {
        let client = client_with(
            panicking_server(),
            ProtocolClientConfig::builder(HOST).protocol(protocol),
        );
        let mut stream = client
            .server_stream(
                &MethodSpec::server_streaming(INTRODUCE),
                ProtoCodec::<IntroduceRequest, IntroduceResponse>::new(),
                IntroduceRequest {
                    name: "panic".to_string(),
                },
                CallOptions::new(),
            )
            .await
            .unwrap();

        let first = stream.message().await.unwrap().unwrap();
        assert_eq!(first.sentence, "Hi panic.");
        let error = stream.message().await.unwrap_err();
        assert_eq!(error.code, Code::Internal, "{protocol:?}");
        assert_eq!(error.message(), Some("handler panicked"), "{protocol:?}");
    }
}
