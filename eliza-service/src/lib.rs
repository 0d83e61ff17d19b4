//! # Eliza Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide an RPC service and
//! descriptor set for integration testing `connectrpc-core` and the `connectrpc` CLI.
//! It is not intended for production use.
//!
//! The service is a very small Eliza: `Say` (unary), `Introduce` (server
//! streaming), `Confide` (client streaming) and `Converse` (bidirectional).
//! Some inputs trigger failures so that error paths can be exercised:
//!
//! * `Say` with an empty sentence fails with `invalid_argument` and a [`pb::Hint`] detail.
//! * `Say` with the sentence `"sleep"` waits five seconds before answering.
//! * `Introduce` with the name `"fail"` sends one sentence then fails with `resource_exhausted`.
use connectrpc_core::{
    Code, ConnectError, ErrorDetail, HandlerSpec, Idempotency, JsonCodec, ProtoCodec,
    RequestStream, ResponseStream, ServerContext,
    prost_reflect::{DescriptorError, DescriptorPool},
};
use http::{HeaderName, HeaderValue};
use pb::*;
use std::time::Duration;

pub mod pb;

pub const SAY: &str = "connectrpc.eliza.v1.ElizaService/Say";
pub const CONVERSE: &str = "connectrpc.eliza.v1.ElizaService/Converse";
pub const INTRODUCE: &str = "connectrpc.eliza.v1.ElizaService/Introduce";
pub const CONFIDE: &str = "connectrpc.eliza.v1.ElizaService/Confide";

/// The codec the handlers are registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Proto,
    Json,
}

/// Handlers for every Eliza method.
pub fn handlers(encoding: Encoding) -> Vec<HandlerSpec> {
    match encoding {
        Encoding::Proto => vec![
            HandlerSpec::unary(SAY, ProtoCodec::<SayResponse, SayRequest>::new(), say)
                .with_idempotency(Idempotency::NoSideEffects),
            HandlerSpec::bidi_streaming(
                CONVERSE,
                ProtoCodec::<ConverseResponse, ConverseRequest>::new(),
                converse,
            ),
            HandlerSpec::server_streaming(
                INTRODUCE,
                ProtoCodec::<IntroduceResponse, IntroduceRequest>::new(),
                introduce,
            ),
            HandlerSpec::client_streaming(
                CONFIDE,
                ProtoCodec::<ConfideResponse, ConfideRequest>::new(),
                confide,
            ),
        ],
        Encoding::Json => vec![
            HandlerSpec::unary(SAY, JsonCodec::<SayResponse, SayRequest>::new(), say)
                .with_idempotency(Idempotency::NoSideEffects),
            HandlerSpec::bidi_streaming(
                CONVERSE,
                JsonCodec::<ConverseResponse, ConverseRequest>::new(),
                converse,
            ),
            HandlerSpec::server_streaming(
                INTRODUCE,
                JsonCodec::<IntroduceResponse, IntroduceRequest>::new(),
                introduce,
            ),
            HandlerSpec::client_streaming(
                CONFIDE,
                JsonCodec::<ConfideResponse, ConfideRequest>::new(),
                confide,
            ),
        ],
    }
}

/// The descriptors of every Eliza message and of the service.
pub fn descriptor_pool() -> Result<DescriptorPool, DescriptorError> {
    DescriptorPool::from_file_descriptor_set(pb::file_descriptor_set())
}

fn reply(sentence: &str) -> String {
    let sentence = sentence.trim().trim_end_matches(['.', '!', '?']);
    let lower = sentence.to_lowercase();
    if lower.starts_with("hello") || lower.starts_with("hi") {
        "Hello, how are you feeling today?".to_string()
    } else if let Some(rest) = lower.strip_prefix("i feel ") {
        format!("Why do you feel {rest}?")
    } else if let Some(rest) = lower.strip_prefix("i am ") {
        format!("How long have you been {rest}?")
    } else if lower.contains("goodbye") {
        "Goodbye. It was nice talking to you.".to_string()
    } else {
        format!("Tell me more about \"{sentence}\".")
    }
}

async fn say(ctx: ServerContext, request: SayRequest) -> Result<SayResponse, ConnectError> {
    if request.sentence.trim().is_empty() {
        return Err(ConnectError::new(Code::InvalidArgument)
            .with_message("sentence must not be empty")
            .with_detail(ErrorDetail::pack(&Hint {
                text: "try saying hello".to_string(),
            })));
    }
    if request.sentence == "sleep" {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    if let Some(value) = ctx.request_headers().get("x-echo") {
        ctx.append_response_header(
            HeaderName::from_static("x-echo"),
            value.clone(),
        );
    }
    ctx.append_response_trailer(
        HeaderName::from_static("x-eliza-turns"),
        HeaderValue::from_static("1"),
    );
    Ok(SayResponse {
        sentence: reply(&request.sentence),
    })
}

async fn converse(
    _ctx: ServerContext,
    mut requests: RequestStream<ConverseRequest>,
    responses: ResponseStream<ConverseResponse>,
) -> Result<(), ConnectError> {
    while let Some(request) = requests.message().await? {
        let sentence = reply(&request.sentence);
        let done = sentence.starts_with("Goodbye");
        responses.send(&ConverseResponse { sentence }).await?;
        if done {
            break;
        }
    }
    Ok(())
}

async fn introduce(
    _ctx: ServerContext,
    request: IntroduceRequest,
    responses: ResponseStream<IntroduceResponse>,
) -> Result<(), ConnectError> {
    let name = match request.name.trim() {
        "" => "Anonymous User",
        name => name,
    };
    let sentences = [
        format!("Hi {name}. I'm Eliza."),
        "Before I begin, I am going to ask you some questions.".to_string(),
        "How are you feeling today?".to_string(),
    ];
    for (index, sentence) in sentences.into_iter().enumerate() {
        if name == "fail" && index == 1 {
            return Err(ConnectError::new(Code::ResourceExhausted)
                .with_message("Eliza is too tired to continue"));
        }
        responses.send(&IntroduceResponse { sentence }).await?;
    }
    Ok(())
}

async fn confide(
    _ctx: ServerContext,
    mut requests: RequestStream<ConfideRequest>,
) -> Result<ConfideResponse, ConnectError> {
    let mut count = 0;
    let mut last = String::new();
    while let Some(request) = requests.message().await? {
        count += 1;
        last = request.sentence;
    }
    let summary = match count {
        0 => "You did not confide anything.".to_string(),
        _ => format!("You confided {count} things, the last being \"{last}\"."),
    };
    Ok(ConfideResponse { summary, count })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_follow_simple_patterns() {
        assert_eq!(reply("Hello!"), "Hello, how are you feeling today?");
        assert_eq!(reply("I feel tired."), "Why do you feel tired?");
        assert_eq!(reply("I am lost"), "How long have you been lost?");
    }

    #[test]
    fn descriptors_describe_the_service() {
        let pool = descriptor_pool().unwrap();
        let service = pool
            .get_service_by_name("connectrpc.eliza.v1.ElizaService")
            .unwrap();
        let methods: Vec<String> = service.methods().map(|m| m.name().to_string()).collect();
        assert_eq!(methods, ["Say", "Converse", "Introduce", "Confide"]);
        let converse = service.methods().nth(1).unwrap();
        assert!(converse.is_client_streaming() && converse.is_server_streaming());
    }
}
