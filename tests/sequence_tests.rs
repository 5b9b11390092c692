//! Flattening, the out-of-order channel, joining, and boundary behaviors.

use std::sync::Arc;

use futures::StreamExt;
use miniagents::{
    Error, FlatSequence, FlatSequenceOptions, Flattener, JoinOptions, Message, MessageInput,
    MessageSequencePromise, MiniAgents, StreamAppender,
};

async fn contents_of(sequence: &MessageSequencePromise) -> miniagents::Result<Vec<String>> {
    Ok(sequence
        .resolve()
        .await?
        .iter()
        .map(|message| message.as_text())
        .collect())
}

#[tokio::test]
async fn nesting_depth_is_invisible_to_consumers() {
    MiniAgents::new()
        .run(async {
            let flat = MessageSequencePromise::from_input(vec![
                MessageInput::from("one"),
                MessageInput::from("two"),
                MessageInput::from("three"),
            ])?;

            let nested = MessageSequencePromise::from_input(vec![
                MessageInput::from("one"),
                MessageInput::Many(vec![
                    MessageInput::Many(vec![MessageInput::from("two")]),
                    MessageInput::from(Message::text("three")),
                ]),
                MessageInput::Many(vec![]),
            ])?;

            assert_eq!(contents_of(&flat).await?, contents_of(&nested).await?);
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn sequences_nest_inside_sequences() {
    MiniAgents::new()
        .run(async {
            let inner = MessageSequencePromise::from_input(vec!["b", "c"])?;
            let outer = MessageSequencePromise::from_input(vec![
                MessageInput::from("a"),
                MessageInput::from(inner),
                MessageInput::from("d"),
            ])?;

            assert_eq!(contents_of(&outer).await?, ["a", "b", "c", "d"]);
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn strings_records_and_messages_all_become_messages() {
    MiniAgents::new()
        .run(async {
            let sequence = MessageSequencePromise::from_input(vec![
                MessageInput::from("plain"),
                MessageInput::from_json(serde_json::json!({"role": "user", "topic": "cats"}))?,
                MessageInput::from(Message::text_with(
                    "typed",
                    serde_json::json!({"role": "assistant"}),
                )?),
            ])?;

            let messages = sequence.resolve().await?;
            assert_eq!(messages.len(), 3);
            assert_eq!(messages[0].class_name(), "TextMessage");
            assert_eq!(messages[1].class_name(), "Message");
            assert_eq!(messages[1].record().get_str("topic"), Some("cats"));
            assert_eq!(messages[2].content(), Some("typed"));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn empty_sequence_resolves_to_an_empty_tuple() {
    MiniAgents::new()
        .run(async {
            let sequence = MessageSequencePromise::from_input(Vec::<MessageInput>::new())?;

            let mut cursor = sequence.messages();
            assert!(cursor.next().await.is_none());
            assert_eq!(sequence.resolve().await?, vec![]);

            let joined = sequence.as_single_text_promise(JoinOptions::new())?;
            let message = joined.resolve().await?;
            assert_eq!(message.content(), Some(""));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn error_items_surface_as_error_pieces_in_strict_mode() {
    MiniAgents::new()
        .run(async {
            let sequence = MessageSequencePromise::from_input(vec![
                MessageInput::from("before"),
                MessageInput::from(Error::raised("poisoned item")),
                MessageInput::from("after"),
            ])?;

            let mut cursor = sequence.messages();
            assert!(cursor.next().await.unwrap().is_ok());
            assert_eq!(
                cursor.next().await.unwrap().unwrap_err(),
                Error::raised("poisoned item")
            );
            // siblings survive the error
            assert!(cursor.next().await.unwrap().is_ok());
            assert!(cursor.next().await.is_none());

            assert!(sequence.resolve().await.is_err());
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn error_items_become_messages_when_reified() {
    let runtime = MiniAgents::builder().errors_as_messages(true).build();
    runtime
        .run(async {
            let sequence = MessageSequencePromise::from_input(vec![
                MessageInput::from("before"),
                MessageInput::from(Error::raised("poisoned item")),
            ])?;

            let messages = sequence.resolve().await?;
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[0].as_text(), "before");
            assert!(messages[1].is_error());
            assert!(messages[1].as_text().contains("poisoned item"));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn failing_token_stream_reifies_with_partial_content() {
    let runtime = MiniAgents::builder().errors_as_messages(true).build();
    runtime
        .run(async {
            let streaming = Message::promise()
                .streamer(|_collector| {
                    futures::stream::iter(vec![
                        Ok("already ".to_string()),
                        Ok("streamed".to_string()),
                        Err(Error::raised("boom")),
                    ])
                })
                .start_soon(false)
                .build()?;

            let sequence = MessageSequencePromise::from_input(streaming)?;
            let messages = sequence.resolve().await?;

            assert_eq!(messages.len(), 1);
            assert!(messages[0].is_error());
            let text = messages[0].as_text();
            assert!(text.contains("already streamed"));
            assert!(text.contains("Error: boom"));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn join_concatenates_contents_with_the_delimiter() {
    MiniAgents::new()
        .run(async {
            let sequence = MessageSequencePromise::from_input(vec!["a", "b", "c"])?;
            let joined = sequence.as_single_text_promise(JoinOptions::new())?;
            let message = joined.resolve().await?;

            assert_eq!(message.content(), Some("a\n\nb\n\nc"));

            // splitting recovers the original contents in order
            let recovered: Vec<&str> = message.content().unwrap().split("\n\n").collect();
            assert_eq!(recovered, ["a", "b", "c"]);
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn join_forwards_metadata_and_references_originals() {
    MiniAgents::new()
        .run(async {
            let sequence = MessageSequencePromise::from_input(vec![
                Message::text_with("first", serde_json::json!({"role": "assistant"}))?,
                Message::text_with("second", serde_json::json!({"model": "tiny-llm"}))?,
            ])?;

            let joined = sequence.as_single_text_promise(JoinOptions::new())?;
            let message = joined.resolve().await?;

            assert_eq!(message.record().get_str("role"), Some("assistant"));
            assert_eq!(message.record().get_str("model"), Some("tiny-llm"));

            match message.get("original_messages") {
                Some(miniagents::FrozenValue::Tuple(originals)) => {
                    assert_eq!(originals.len(), 2)
                }
                other => panic!("expected a tuple of originals, got {other:?}"),
            }
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn join_can_strip_leading_newlines() {
    MiniAgents::new()
        .run(async {
            let sequence = MessageSequencePromise::from_input(vec!["\n\nindented", "tail"])?;
            let joined = sequence.as_single_text_promise(
                JoinOptions::new()
                    .delimiter(" ")
                    .strip_leading_newlines(true)
                    .reference_originals(false),
            )?;

            let message = joined.resolve().await?;
            assert_eq!(message.content(), Some("indented tail"));
            assert!(message.get("original_messages").is_none());
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn generic_flat_sequence_works_beyond_messages() {
    MiniAgents::new()
        .run(async {
            let appender: StreamAppender<String> = StreamAppender::new(Some(false))?;
            let upstream = {
                let words: Flattener<String, String> = Arc::new(|line: String| {
                    futures::stream::iter(
                        line.split_whitespace()
                            .map(|w| Ok(w.to_string()))
                            .collect::<Vec<_>>(),
                    )
                    .boxed()
                });

                let flat: FlatSequence<String, String> = FlatSequence::new(
                    appender.take_stream()?,
                    None,
                    words,
                    |mut cursor| async move {
                        let mut out = Vec::new();
                        while let Some(word) = cursor.next().await {
                            out.push(word?);
                        }
                        Ok(out.join("-"))
                    },
                    FlatSequenceOptions::default().start_soon(false),
                )?;
                flat.sequence_promise
            };

            appender.open()?;
            appender.append("the quick fox".to_string())?;
            appender.append("jumps".to_string())?;
            appender.close();

            assert_eq!(upstream.resolve().await?, "the-quick-fox-jumps");
            Ok(())
        })
        .await
        .unwrap();
}
