//! Streamed-promise semantics: replay, single production, appender lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use miniagents::{Error, MiniAgents, StreamAppender, StreamCursor, StreamedPromise};

async fn join_tokens(mut cursor: StreamCursor<String>) -> miniagents::Result<String> {
    let mut joined = String::new();
    while let Some(token) = cursor.next().await {
        joined.push_str(&token?);
    }
    Ok(joined)
}

fn counted_tokens(
    tokens: &[&str],
    pulls: &Arc<AtomicUsize>,
) -> impl futures::Stream<Item = miniagents::Result<String>> + Send + 'static {
    let pulls = pulls.clone();
    futures::stream::iter(tokens.iter().map(|t| t.to_string()).collect::<Vec<_>>()).map(
        move |token| {
            pulls.fetch_add(1, Ordering::SeqCst);
            Ok(token)
        },
    )
}

#[tokio::test]
async fn every_cursor_replays_the_stream_from_the_beginning() {
    MiniAgents::new()
        .run(async {
            let promise: StreamedPromise<String, String> = StreamedPromise::new(
                futures::stream::iter(["A", "B", "C"].map(|t| Ok(t.to_string()))),
                join_tokens,
                Some(false),
            )?;

            // drain the first cursor fully
            let mut first = promise.cursor();
            let mut seen_first = Vec::new();
            while let Some(token) = first.next().await {
                seen_first.push(token?);
            }
            assert_eq!(seen_first, ["A", "B", "C"]);

            // a cursor created afterwards still sees everything
            let mut second = promise.cursor();
            let mut seen_second = Vec::new();
            while let Some(token) = second.next().await {
                seen_second.push(token?);
            }
            assert_eq!(seen_first, seen_second);

            // end of stream is idempotent
            assert!(second.next().await.is_none());
            assert!(second.next().await.is_none());
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn producer_is_advanced_once_per_piece_across_all_cursors() {
    let pulls = Arc::new(AtomicUsize::new(0));
    let counted = pulls.clone();

    MiniAgents::new()
        .run(async move {
            let promise: StreamedPromise<String, String> = StreamedPromise::new(
                counted_tokens(&["A", "B", "C"], &counted),
                join_tokens,
                Some(false),
            )?;

            let mut leader = promise.cursor();
            let mut follower = promise.cursor();
            // interleave the two cursors
            for _ in 0..3 {
                leader.next().await;
                follower.next().await;
            }
            assert!(leader.next().await.is_none());
            assert!(follower.next().await.is_none());

            // and the whole value still resolves from the buffer
            assert_eq!(promise.resolve().await?, "ABC");
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(pulls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn eager_mode_produces_in_the_background() {
    let pulls = Arc::new(AtomicUsize::new(0));
    let counted = pulls.clone();

    MiniAgents::new()
        .run(async move {
            let promise: StreamedPromise<String, String> = StreamedPromise::new(
                counted_tokens(&["A", "B", "C"], &counted),
                join_tokens,
                Some(true),
            )?;

            // let the drainer run without any consumer involvement
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
            assert_eq!(counted.load(Ordering::SeqCst), 3);

            // consuming afterwards replays from the queue and buffer
            assert_eq!(promise.resolve().await?, "ABC");
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(pulls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn streamer_errors_are_captured_in_position_and_replayed() {
    MiniAgents::new()
        .run(async {
            let promise: StreamedPromise<String, String> = StreamedPromise::new(
                futures::stream::iter(vec![
                    Ok("A".to_string()),
                    Err(Error::raised("flaky token")),
                    Ok("B".to_string()),
                ]),
                join_tokens,
                Some(false),
            )?;

            for _ in 0..2 {
                let mut cursor = promise.cursor();
                assert_eq!(cursor.next().await.unwrap()?, "A");
                let err = cursor.next().await.unwrap().unwrap_err();
                assert_eq!(err, Error::raised("flaky token"));
                // iteration continues past the captured error
                assert_eq!(cursor.next().await.unwrap()?, "B");
                assert!(cursor.next().await.is_none());
            }

            // the default resolver stops at the first captured error
            let resolved = promise.resolve().await;
            assert_eq!(resolved.unwrap_err(), Error::raised("flaky token"));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn immediately_failing_streamer_still_terminates() {
    MiniAgents::new()
        .run(async {
            let promise: StreamedPromise<String, String> = StreamedPromise::new(
                futures::stream::iter(vec![Err(Error::raised("boom at birth"))]),
                join_tokens,
                Some(false),
            )?;

            let mut cursor = promise.cursor();
            assert!(cursor.next().await.unwrap().is_err());
            assert!(cursor.next().await.is_none());
            assert!(promise.resolve().await.is_err());
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn prefilled_stream_replays_pieces_and_whole() {
    MiniAgents::new()
        .run(async {
            let promise: StreamedPromise<String, String> = StreamedPromise::prefilled(
                vec!["he".to_string(), "llo".to_string()],
                "hello".to_string(),
            )?;
            assert!(promise.all_pieces_consumed());

            let tokens: Vec<String> = promise
                .piece_stream()
                .map(|t| t.unwrap())
                .collect()
                .await;
            assert_eq!(tokens, ["he", "llo"]);
            assert_eq!(promise.resolve().await?, "hello");
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn appender_lifecycle_is_enforced() {
    MiniAgents::new()
        .run(async {
            let appender: StreamAppender<String> = StreamAppender::new(Some(false))?;

            let before = appender.append("too early".to_string()).unwrap_err();
            assert!(matches!(before, Error::AppenderNotOpen(_)));
            assert!(!appender.was_open());

            appender.open()?;
            assert!(appender.is_open());
            appender.append("on time".to_string())?;

            appender.close();
            let after = appender.append("too late".to_string()).unwrap_err();
            assert!(matches!(after, Error::AppenderClosed(_)));
            assert!(appender.was_open());

            let reopen = appender.open().unwrap_err();
            assert!(matches!(reopen, Error::AppenderClosed(_)));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn appender_scope_captures_errors_into_the_stream() {
    MiniAgents::new()
        .run(async {
            let appender: StreamAppender<String> = StreamAppender::new(Some(true))?;
            let promise: StreamedPromise<String, String> =
                StreamedPromise::from_appender(&appender, join_tokens, Some(false))?;

            appender
                .scope(|| async {
                    appender.append("partial".to_string())?;
                    Err(Error::raised("producer crashed"))
                })
                .await?;

            let mut cursor = promise.cursor();
            assert_eq!(cursor.next().await.unwrap()?, "partial");
            assert_eq!(
                cursor.next().await.unwrap().unwrap_err(),
                Error::raised("producer crashed")
            );
            assert!(cursor.next().await.is_none());
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn strict_appender_scope_propagates_errors_but_still_closes() {
    MiniAgents::new()
        .run(async {
            let appender: StreamAppender<String> = StreamAppender::new(Some(false))?;
            let promise: StreamedPromise<String, String> =
                StreamedPromise::from_appender(&appender, join_tokens, Some(false))?;

            let err = appender
                .scope(|| async {
                    appender.append("partial".to_string())?;
                    Err(Error::raised("strict crash"))
                })
                .await
                .unwrap_err();
            assert_eq!(err, Error::raised("strict crash"));

            // consumers are not left hanging: the stream terminated
            let mut cursor = promise.cursor();
            assert_eq!(cursor.next().await.unwrap()?, "partial");
            assert!(cursor.next().await.is_none());
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn dropping_an_open_appender_terminates_the_stream() {
    MiniAgents::new()
        .run(async {
            let appender: StreamAppender<String> = StreamAppender::new(Some(false))?;
            let promise: StreamedPromise<String, String> =
                StreamedPromise::from_appender(&appender, join_tokens, Some(false))?;

            appender.open()?;
            appender.append("orphan".to_string())?;
            drop(appender);

            assert_eq!(promise.resolve().await?, "orphan");
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn appender_stream_can_only_be_taken_once() {
    MiniAgents::new()
        .run(async {
            let appender: StreamAppender<String> = StreamAppender::new(None)?;
            let _promise: StreamedPromise<String, String> =
                StreamedPromise::from_appender(&appender, join_tokens, Some(false))?;

            let again: miniagents::Result<StreamedPromise<String, String>> =
                StreamedPromise::from_appender(&appender, join_tokens, Some(false));
            assert!(matches!(again, Err(Error::InvalidInput(_))));
            Ok(())
        })
        .await
        .unwrap();
}
