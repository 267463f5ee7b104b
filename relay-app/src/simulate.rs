//! Offline dry run of the relay engine.
//!
//! A synthetic producer streams canned Markdown into a console sink that can
//! inject rate limits and transient failures, so pacing and breaker behaviour
//! can be watched without a model or a chat platform.

use crate::config::{RelayConfig, default_config_path};
use crate::stats::{RelayStats, StatsSnapshot};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use relay_core::{
    DeliverySink, DestinationId, DispatchRequest, EventBus, FragmentStream, ProducerError, PushAck,
    PushError, PushKind, PushUpdate, SessionReport, StreamDispatcher, StreamingConfig,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SIM_THREAD: &str = "simulate:thread";
const SIM_DESTINATION: &str = "simulate:console";
const TAIL_CHARS: usize = 48;

#[derive(Debug, Clone, clap::Args)]
pub struct SimulateArgs {
    /// Length of the synthetic reply, in chars.
    #[arg(long, default_value_t = 2_000)]
    pub chars: usize,
    /// Chars per producer fragment.
    #[arg(long, default_value_t = 24)]
    pub fragment_chars: usize,
    /// Delay between producer fragments.
    #[arg(long, default_value_t = 40)]
    pub fragment_gap_ms: u64,
    /// Round-trip time of every push.
    #[arg(long, default_value_t = 150)]
    pub push_latency_ms: u64,
    /// Fail the first N pushes with a transient error.
    #[arg(long, default_value_t = 0)]
    pub fail_first: u32,
    /// Reject every Nth push as rate limited (0 disables).
    #[arg(long, default_value_t = 0)]
    pub rate_limit_every: u32,
    /// Retry-after hint carried by injected rate limits.
    #[arg(long, default_value_t = 5)]
    pub retry_after_secs: u64,
    /// Deliver only the final text, like a channel without message edits.
    #[arg(long)]
    pub no_edits: bool,
    /// Cancel the session after this many milliseconds.
    #[arg(long)]
    pub cancel_after_ms: Option<u64>,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            chars: 2_000,
            fragment_chars: 24,
            fragment_gap_ms: 40,
            push_latency_ms: 150,
            fail_first: 0,
            rate_limit_every: 0,
            retry_after_secs: 5,
            no_edits: false,
            cancel_after_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRecord {
    pub at: Duration,
    pub kind: PushKind,
    pub text: String,
}

/// Sink that prints every push and fails on a fixed schedule.
pub struct ConsoleSink {
    started_at: Instant,
    latency: Duration,
    fail_first: u32,
    rate_limit_every: u32,
    retry_after: Duration,
    echo: bool,
    attempts: Mutex<u32>,
    delivered: Mutex<Vec<PushRecord>>,
}

impl ConsoleSink {
    pub fn new(args: &SimulateArgs, echo: bool) -> Self {
        Self {
            started_at: Instant::now(),
            latency: Duration::from_millis(args.push_latency_ms),
            fail_first: args.fail_first,
            rate_limit_every: args.rate_limit_every,
            retry_after: Duration::from_secs(args.retry_after_secs),
            echo,
            attempts: Mutex::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn delivered(&self) -> Vec<PushRecord> {
        self.delivered
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn injected_failure(&self) -> Option<PushError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            *attempts += 1;
            *attempts
        };
        if attempt <= self.fail_first {
            return Some(PushError::Transient(format!(
                "injected transient failure #{attempt}"
            )));
        }
        if self.rate_limit_every > 0 && attempt % self.rate_limit_every == 0 {
            return Some(PushError::RateLimited {
                retry_after: Some(self.retry_after),
            });
        }
        None
    }
}

#[async_trait]
impl DeliverySink for ConsoleSink {
    async fn push(
        &self,
        _destination: &DestinationId,
        update: PushUpdate<'_>,
    ) -> Result<PushAck, PushError> {
        tokio::time::sleep(self.latency).await;
        let at = self.started_at.elapsed();

        if let Some(err) = self.injected_failure() {
            if self.echo {
                println!("[{:>7.2}s] push failed: {err}", at.as_secs_f64());
            }
            return Err(err);
        }

        if self.echo {
            let kind = match update.kind {
                PushKind::Partial => "partial",
                PushKind::Final => "final",
            };
            println!(
                "[{:>7.2}s] {kind:<7} {:>6} chars | {}",
                at.as_secs_f64(),
                update.text.chars().count(),
                tail(update.text, TAIL_CHARS).replace('\n', "⏎"),
            );
        }
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PushRecord {
                at,
                kind: update.kind,
                text: update.text.to_string(),
            });
        Ok(PushAck {
            message_id: Some("console".to_string()),
        })
    }
}

fn tail(text: &str, n: usize) -> &str {
    let count = text.chars().count();
    if count <= n {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - n)
        .map_or(0, |(offset, _)| offset);
    &text[start..]
}

/// Deterministic Markdown reply of exactly `chars` chars, with a code block
/// in the middle so partial snapshots exercise fence balancing.
pub fn synthetic_reply(chars: usize) -> String {
    const PROSE: &str = "Streaming replies arrive a few words at a time, and the relay decides when the chat has waited long enough to see the next chunk. ";
    const CODE: &str = "```rust\nfn main() {\n    for i in 0..3 {\n        println!(\"tick {i}\");\n    }\n}\n```\n\n";

    let mut text = String::new();
    let mut block = 0usize;
    while text.chars().count() < chars {
        if block % 4 == 2 {
            text.push_str(CODE);
        } else {
            text.push_str(PROSE);
            text.push_str(PROSE);
            text.push_str("\n\n");
        }
        block += 1;
    }
    let end = text
        .char_indices()
        .nth(chars)
        .map_or(text.len(), |(offset, _)| offset);
    text.truncate(end);
    text
}

/// Splits `text` into `fragment_chars`-sized fragments emitted `gap` apart.
pub fn paced_fragments(text: String, fragment_chars: usize, gap: Duration) -> FragmentStream {
    let fragment_chars = fragment_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    let fragments: Vec<String> = chars
        .chunks(fragment_chars)
        .map(|chunk| chunk.iter().collect())
        .collect();
    futures_util::stream::iter(fragments)
        .then(move |fragment| async move {
            tokio::time::sleep(gap).await;
            Ok::<_, ProducerError>(fragment)
        })
        .boxed()
}

pub struct SimulationResult {
    pub report: SessionReport,
    pub stats: StatsSnapshot,
}

pub async fn simulate(
    streaming: StreamingConfig,
    args: &SimulateArgs,
    sink: Arc<ConsoleSink>,
) -> SimulationResult {
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let dispatcher = StreamDispatcher::from_config(streaming, events);

    let fragments = paced_fragments(
        synthetic_reply(args.chars),
        args.fragment_chars,
        Duration::from_millis(args.fragment_gap_ms),
    );
    let cancel = CancellationToken::new();
    if let Some(after) = args.cancel_after_ms {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(after)).await;
            cancel.cancel();
        });
    }

    let request = DispatchRequest::new(SIM_THREAD, SIM_DESTINATION, fragments, sink)
        .with_cancel(cancel)
        .incremental(!args.no_edits);
    let report = dispatcher.dispatch(request).await;

    let stats = RelayStats::new();
    loop {
        match rx.try_recv() {
            Ok(event) => stats.record(&event),
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "simulation events dropped from summary");
            }
            Err(_) => break,
        }
    }
    SimulationResult {
        report,
        stats: stats.snapshot(),
    }
}

/// Streaming knobs from the config file when there is one, defaults otherwise.
async fn load_streaming(config_path: Option<PathBuf>) -> Result<StreamingConfig> {
    let path = match config_path {
        Some(path) => path,
        None => {
            let path = default_config_path();
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(StreamingConfig::default());
            }
            path
        }
    };
    Ok(RelayConfig::load(Some(path)).await?.streaming)
}

pub async fn run(config_path: Option<PathBuf>, args: SimulateArgs) -> Result<()> {
    let streaming = load_streaming(config_path).await?;
    streaming
        .validate()
        .map_err(|e| anyhow::anyhow!("streaming: {e}"))?;
    tracing::info!(?args, ?streaming, "simulation starting");

    let sink = Arc::new(ConsoleSink::new(&args, true));
    let SimulationResult { report, stats } = simulate(streaming, &args, sink.clone()).await;
    let pushes = sink.delivered();

    println!();
    println!("outcome:   {}", report.outcome.label());
    println!(
        "delivered: {}/{} chars in {:.2}s",
        report.delivered_chars,
        report.total_chars,
        report.elapsed.as_secs_f64()
    );
    println!(
        "pushes:    {} attempted, {} succeeded{}",
        report.pushes_attempted,
        report.pushes_succeeded,
        if report.streaming_abandoned {
            ", incremental streaming abandoned"
        } else {
            ""
        }
    );
    println!(
        "breaker:   {} opened, {} closed",
        stats.circuits_opened, stats.circuits_closed
    );
    if let Some(last) = pushes.last() {
        println!(
            "last push: {:?} at {:.2}s ({} pushes shown)",
            last.kind,
            last.at.as_secs_f64(),
            pushes.len()
        );
    }
    Ok(())
}
