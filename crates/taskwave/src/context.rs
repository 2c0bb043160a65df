//! Context runtime - the code that runs inside an execution context.
//!
//! The coordinator side (spawning, dispatch) lives in worker.rs and pool.rs.
//!
//! Lifecycle inside a context:
//! 1. Load the program, running its preparation step exactly once
//! 2. Signal `Ready` (or `Error` and stop, if preparation failed)
//! 3. Serve calls strictly one at a time, one `Result`/`Error` per call

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;

use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ContextMessage, ContextRequest};
use crate::program::{Args, Catalog, Program};

/// Set by [`crate::ProcessHost`] on every child it spawns.
pub const CONTEXT_ENV: &str = "TASKWAVE_CONTEXT";

/// True when this process was spawned as an execution context.
pub fn is_context_process() -> bool {
    std::env::var_os(CONTEXT_ENV).is_some()
}

/// Initialize tracing for a context process.
///
/// Logs go to stderr: stdout carries protocol frames. Honors `RUST_LOG`,
/// then `TASKWAVE_LOG` (a bare level), and `LOG_FORMAT=json`.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("TASKWAVE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("taskwave={level},taskwave::bridge::codec=off"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Serve a program: prepare, signal readiness, then answer calls in order.
///
/// Returns when the call stream ends, or with an error when signals can no
/// longer be delivered.
pub async fn serve<C, S>(program: &Program, calls: C, signals: S) -> io::Result<()>
where
    C: Stream<Item = Args>,
    S: Sink<ContextMessage, Error = io::Error>,
{
    futures::pin_mut!(calls);
    futures::pin_mut!(signals);

    let routine = match AssertUnwindSafe(program.load()).catch_unwind().await {
        Ok(Ok(routine)) => routine,
        Ok(Err(error)) => {
            tracing::warn!(%error, "Preparation failed");
            signals.send(ContextMessage::error(error)).await?;
            return Ok(());
        }
        Err(panic) => {
            let error = format!("preparation panicked: {}", panic_message(&*panic));
            tracing::error!(%error, "Preparation failed");
            signals.send(ContextMessage::error(error)).await?;
            return Ok(());
        }
    };

    signals.send(ContextMessage::Ready).await?;
    tracing::debug!("Context ready");

    while let Some(args) = calls.next().await {
        let outcome = AssertUnwindSafe(async { routine.call(args).await })
            .catch_unwind()
            .await;
        let msg = match outcome {
            Ok(Ok(value)) => ContextMessage::result(value),
            Ok(Err(error)) => ContextMessage::error(error),
            Err(panic) => {
                let error = format!("computation panicked: {}", panic_message(&*panic));
                tracing::warn!(%error, "Call failed");
                ContextMessage::error(error)
            }
        };
        signals.send(msg).await?;
    }

    tracing::debug!("Call stream closed, context exiting");
    Ok(())
}

/// Serve a framed request stream: the first frame must be `Load`.
pub async fn serve_stream<R, W>(catalog: &Catalog, reader: R, writer: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(reader, JsonCodec::<ContextRequest>::new());
    let mut signals = FramedWrite::new(writer, JsonCodec::<ContextMessage>::new());

    let image = match requests.next().await {
        Some(Ok(ContextRequest::Load { image })) => image,
        Some(Ok(ContextRequest::Call { .. })) => {
            signals
                .send(ContextMessage::error("call received before a program was loaded"))
                .await?;
            return Ok(());
        }
        Some(Err(e)) => return Err(e),
        None => {
            tracing::debug!("Coordinator closed before sending a program");
            return Ok(());
        }
    };

    let program = match catalog.restore(&image) {
        Ok(program) => program,
        Err(e) => {
            tracing::error!(entry = %image.entry, error = %e, "Cannot load program");
            signals.send(ContextMessage::error(e.to_string())).await?;
            return Ok(());
        }
    };
    tracing::info!(entry = %image.entry, "Program loaded");

    let calls = futures::stream::unfold(requests, |mut requests| async move {
        loop {
            match requests.next().await {
                Some(Ok(ContextRequest::Call { args })) => return Some((args, requests)),
                Some(Ok(ContextRequest::Load { .. })) => {
                    tracing::warn!("Received Load after startup, ignoring");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Request channel error");
                    return None;
                }
                None => return None,
            }
        }
    });

    serve(&program, calls, signals).await
}

/// Run the context event loop on stdin/stdout.
///
/// Entry point for executables hosted by [`crate::ProcessHost`].
pub async fn run_worker(catalog: &Catalog) -> io::Result<()> {
    serve_stream(catalog, stdin(), stdout()).await
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{CallFuture, PreparedComputation, TaskDefinition};
    use futures::future::BoxFuture;
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, duplex, split};

    fn sum(args: Args) -> CallFuture {
        async move { Ok(args.iter().filter_map(|v| v.as_i64()).sum::<i64>().into()) }.boxed()
    }

    fn explode(args: Args) -> CallFuture {
        async move {
            if args.is_empty() {
                panic!("no arguments");
            }
            Ok(json!("fine"))
        }
        .boxed()
    }

    fn refuse(_args: Args) -> BoxFuture<'static, Result<PreparedComputation, String>> {
        async { Err("missing model file".to_string()) }.boxed()
    }

    fn channel_sink(
        tx: tokio::sync::mpsc::UnboundedSender<ContextMessage>,
    ) -> impl Sink<ContextMessage, Error = io::Error> {
        futures::sink::unfold(tx, |tx, msg| async move {
            tx.send(msg)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "closed"))?;
            Ok::<_, io::Error>(tx)
        })
    }

    #[tokio::test]
    async fn serves_calls_in_order_after_ready() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let calls = futures::stream::iter(vec![vec![json!(10), json!(10)], vec![json!(1)]]);

        serve(&Program::direct(sum), calls, channel_sink(tx))
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(ContextMessage::Ready));
        assert_eq!(rx.recv().await, Some(ContextMessage::result(json!(20))));
        assert_eq!(rx.recv().await, Some(ContextMessage::result(json!(1))));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn panic_becomes_error_and_context_keeps_serving() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let calls = futures::stream::iter(vec![vec![], vec![json!(1)]]);

        serve(&Program::direct(explode), calls, channel_sink(tx))
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(ContextMessage::Ready));
        match rx.recv().await {
            Some(ContextMessage::Error { error }) => {
                assert!(error.contains("no arguments"), "got {error}");
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(rx.recv().await, Some(ContextMessage::result(json!("fine"))));
    }

    #[tokio::test]
    async fn failed_preparation_signals_error_without_ready() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let program = Program::build::<Args>(TaskDefinition::Prepared(refuse), None).unwrap();
        let calls = futures::stream::iter(vec![vec![json!(1)]]);

        serve(&program, calls, channel_sink(tx)).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ContextMessage::error("missing model file"))
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn framed_stream_loads_catalog_entry() {
        let catalog = Catalog::new().register("sum", TaskDefinition::Direct(sum));
        let image = Program::direct(sum).with_entry("sum").image().unwrap();

        let (coordinator, context) = duplex(4096);
        let (context_read, context_write) = split(context);
        let server =
            tokio::spawn(async move { serve_stream(&catalog, context_read, context_write).await });

        let (coord_read, mut coord_write) = split(coordinator);
        let mut requests = FramedWrite::new(&mut coord_write, JsonCodec::<ContextRequest>::new());
        let mut signals = FramedRead::new(coord_read, JsonCodec::<ContextMessage>::new());

        requests.send(ContextRequest::Load { image }).await.unwrap();
        requests
            .send(ContextRequest::Call {
                args: vec![json!(10), json!(10)],
            })
            .await
            .unwrap();

        assert_eq!(signals.next().await.unwrap().unwrap(), ContextMessage::Ready);
        assert_eq!(
            signals.next().await.unwrap().unwrap(),
            ContextMessage::result(json!(20))
        );

        drop(requests);
        coord_write.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn framed_stream_reports_unknown_entry() {
        let (coordinator, context) = duplex(4096);
        let (context_read, context_write) = split(context);
        let server = tokio::spawn(async move {
            serve_stream(&Catalog::new(), context_read, context_write).await
        });

        let (coord_read, coord_write) = split(coordinator);
        let mut requests = FramedWrite::new(coord_write, JsonCodec::<ContextRequest>::new());
        let mut signals = FramedRead::new(coord_read, JsonCodec::<ContextMessage>::new());

        let image = Program::direct(sum).with_entry("sum").image().unwrap();
        requests.send(ContextRequest::Load { image }).await.unwrap();

        match signals.next().await.unwrap().unwrap() {
            ContextMessage::Error { error } => assert!(error.contains("sum"), "got {error}"),
            other => panic!("expected error, got {other:?}"),
        }
        server.await.unwrap().unwrap();
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*payload), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "unknown panic payload");
    }
}
