//! Message-promise behaviors: token appenders, preliminary metadata, and
//! builder validation.

use miniagents::{Error, FrozenValue, Message, MessageTokenAppender, MiniAgents};
use serde_json::json;

#[tokio::test]
async fn token_appender_streams_content_and_collects_metadata() {
    MiniAgents::new()
        .run(async {
            let appender = MessageTokenAppender::new(Some(false))?;
            appender.open()?;

            let promise = Message::promise()
                .appender(&appender)
                .field("role", "assistant")
                .build()?;

            // metadata supplied up front is readable before any token flows
            assert_eq!(
                promise.known_beforehand().get_str("role"),
                Some("assistant")
            );

            let producer = appender.clone();
            let feeder = tokio::spawn(async move {
                producer.append("to").unwrap();
                producer.append("ken").unwrap();
                producer.append("s").unwrap();
                // metadata discovered mid-stream lands in the final message
                producer.collector().insert("model", "tiny-llm");
                producer.collector().insert("finish_reason", "stop");
                producer.close();
            });

            let message = promise.resolve().await?;
            feeder.await.expect("feeder task");

            assert_eq!(message.content(), Some("tokens"));
            assert_eq!(message.record().get_str("role"), Some("assistant"));
            assert_eq!(message.record().get_str("model"), Some("tiny-llm"));
            assert_eq!(message.record().get_str("finish_reason"), Some("stop"));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn unopened_appender_cannot_back_a_promise() {
    MiniAgents::new()
        .run(async {
            let appender = MessageTokenAppender::new(None)?;
            let result = Message::promise().appender(&appender).build();
            assert!(matches!(result, Err(Error::AppenderNotOpen(_))));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn reserved_fields_cannot_arrive_through_the_collector() {
    MiniAgents::new()
        .run(async {
            let appender = MessageTokenAppender::new(Some(false))?;
            appender.open()?;
            let promise = Message::promise().appender(&appender).build()?;

            appender.append("payload")?;
            appender.collector().insert("content", "smuggled");
            appender.close();

            let err = promise.resolve().await.unwrap_err();
            assert!(matches!(err, Error::InvalidField(_)));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn content_and_streamer_are_mutually_exclusive() {
    MiniAgents::new()
        .run(async {
            let result = Message::promise()
                .content("already known")
                .streamer(|_| futures::stream::iter(vec![Ok("nope".to_string())]))
                .build();
            assert!(matches!(result, Err(Error::InvalidInput(_))));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn prefilled_promise_streams_its_rendered_text() {
    MiniAgents::new()
        .run(async {
            let promise = Message::promise()
                .content("rendered body")
                .metadata(json!({"role": "user"}))
                .build()?;

            let text = promise.tokens().collect_text().await?;
            assert_eq!(text, "rendered body");

            let message = promise.resolve().await?;
            assert_eq!(message.record().get_str("role"), Some("user"));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn reified_errors_include_tracebacks_only_when_enabled() {
    let plain = MiniAgents::builder().errors_as_messages(true).build();
    let message = plain
        .run(async {
            let promise = Message::promise()
                .streamer(|_| futures::stream::iter(vec![Err(Error::raised("opaque failure"))]))
                .build()?;
            let sequence = miniagents::MessageSequencePromise::from_input(promise)?;
            Ok(sequence.resolve().await?.remove(0))
        })
        .await
        .unwrap();
    assert!(message.is_error());
    assert!(message.get("traceback").is_none());

    let verbose = MiniAgents::builder()
        .errors_as_messages(true)
        .error_tracebacks_in_messages(true)
        .build();
    let message = verbose
        .run(async {
            let promise = Message::promise()
                .streamer(|_| futures::stream::iter(vec![Err(Error::raised("loud failure"))]))
                .build()?;
            let sequence = miniagents::MessageSequencePromise::from_input(promise)?;
            Ok(sequence.resolve().await?.remove(0))
        })
        .await
        .unwrap();
    assert!(message.is_error());
    assert!(matches!(
        message.get("traceback"),
        Some(FrozenValue::Str(_))
    ));
}

#[tokio::test]
async fn message_promises_carry_their_class() {
    MiniAgents::new()
        .run(async {
            let promise = Message::promise()
                .class_name("SummaryMessage")
                .streamer(|_| {
                    futures::stream::iter(vec![Ok("a ".to_string()), Ok("summary".to_string())])
                })
                .build()?;

            assert_eq!(promise.message_class(), "SummaryMessage");
            let message = promise.resolve().await?;
            assert_eq!(message.class_name(), "SummaryMessage");
            assert_eq!(message.content(), Some("a summary"));
            Ok(())
        })
        .await
        .unwrap();
}
