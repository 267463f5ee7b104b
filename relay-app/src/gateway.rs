//! Session multiplexer: all channel adapters feed into a single inbound queue.
//!
//! Commands are answered inline. Every other message becomes one relay
//! session, spawned onto a `JoinSet` so shutdown can drain them.

use crate::commands::{self, ChatCommand, StatusView};
use crate::config::RelayConfig;
use anyhow::Result;
use dashmap::DashMap;
use relay_channels::{
    ChannelAdapter, ChannelSink, InboundMessage, MessageId, OutboundMessage, split_message,
};
use relay_core::{
    DestinationId, DispatchError, DispatchRequest, FragmentStream, SessionOutcome, SessionReport,
    StreamDispatcher, ThreadId, balance,
};
use relay_llm::{ChatMessage, LlmClient};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Turns a conversation into a reply stream.
pub trait ReplyProducer: Send + Sync {
    fn stream_reply(&self, messages: Vec<ChatMessage>) -> FragmentStream;
}

impl ReplyProducer for LlmClient {
    fn stream_reply(&self, messages: Vec<ChatMessage>) -> FragmentStream {
        self.stream_text(messages)
    }
}

struct ActiveReply {
    generation: u64,
    cancel: CancellationToken,
}

pub struct Gateway {
    cfg: Arc<RelayConfig>,
    started_at: Instant,
    dispatcher: Arc<StreamDispatcher>,
    producer: Arc<dyn ReplyProducer>,
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    active: DashMap<ThreadId, ActiveReply>,
    next_generation: AtomicU64,
}

impl Gateway {
    pub fn new(
        cfg: Arc<RelayConfig>,
        dispatcher: Arc<StreamDispatcher>,
        producer: Arc<dyn ReplyProducer>,
        channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    ) -> Self {
        Self {
            cfg,
            started_at: Instant::now(),
            dispatcher,
            producer,
            channels,
            active: DashMap::new(),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn start(
        self: Arc<Self>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_loop(inbound_rx, shutdown).await })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(
        self: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) {
        let mut replies: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = inbound_rx.recv() => {
                    let Some(inbound) = msg else {
                        tracing::info!("inbound queue closed");
                        break;
                    };
                    if let Err(e) = self.handle_inbound(inbound, &mut replies, &shutdown).await {
                        tracing::warn!(%e, "handle_inbound failed");
                    }
                }
                Some(joined) = replies.join_next(), if !replies.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "reply task failed");
                    }
                }
            }
        }

        // Sessions run on children of `shutdown`, so they are already winding down.
        let pending = replies.len();
        if pending > 0 {
            tracing::info!(pending, "draining reply tasks");
            let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
                while replies.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::warn!(remaining = replies.len(), "reply tasks did not drain; aborting");
                replies.abort_all();
            }
        }
        tracing::info!("gateway stopped");
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(channel_id = %inbound.channel_id, thread_id = %inbound.thread_id)
    )]
    async fn handle_inbound(
        self: &Arc<Self>,
        inbound: InboundMessage,
        replies: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        if !self
            .cfg
            .sender_allowed(&inbound.channel_id, &inbound.sender_id)
        {
            tracing::info!(
                sender_id = %inbound.sender_id,
                "ignoring message from sender not on allowlist"
            );
            return Ok(());
        }

        let channel = self
            .channels
            .get(inbound.channel_id.as_str())
            .ok_or_else(|| anyhow::anyhow!("unknown channel: {}", inbound.channel_id))?
            .clone();
        let thread_key = thread_key(&inbound);

        if let Some(command) = commands::parse(&inbound.content) {
            let reply = self.run_command(command, &channel, &inbound, &thread_key);
            channel
                .send(
                    inbound.thread_id.as_str(),
                    OutboundMessage::text(reply).reply_to(Some(inbound.message_id.clone())),
                )
                .await?;
            return Ok(());
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = shutdown.child_token();
        // A second message while a reply is running keeps the first one's
        // token; the dispatcher rejects it as busy anyway.
        self.active
            .entry(thread_key.clone())
            .or_insert_with(|| ActiveReply {
                generation,
                cancel: cancel.clone(),
            });

        let gateway = self.clone();
        replies.spawn(async move {
            gateway
                .run_reply(inbound, channel, thread_key, generation, cancel)
                .await;
        });
        Ok(())
    }

    fn run_command(
        &self,
        command: ChatCommand,
        channel: &Arc<dyn ChannelAdapter>,
        inbound: &InboundMessage,
        thread_key: &ThreadId,
    ) -> String {
        match command {
            ChatCommand::Help => commands::help_text(),
            ChatCommand::Cancel => match self.active.get(thread_key) {
                Some(active) => {
                    active.cancel.cancel();
                    tracing::info!(thread_id = %thread_key, "reply cancelled by user");
                    "Cancelling the current reply.".to_string()
                }
                None => "Nothing to cancel.".to_string(),
            },
            ChatCommand::Status => {
                let destination = destination_for(channel.as_ref(), inbound);
                let governor = self.dispatcher.governor();
                let now = tokio::time::Instant::now();
                let channels = self.channel_names();
                commands::status_text(&StatusView {
                    model: &self.cfg.general.model,
                    channels: &channels,
                    uptime: self.started_at.elapsed(),
                    generating: self.dispatcher.locks().is_locked(thread_key),
                    circuit: governor.circuit_state(&destination, now).as_str(),
                    interval: governor.interval(&destination),
                    active_sessions: self.dispatcher.locks().len(),
                })
            }
            ChatCommand::Unknown(word) => commands::unknown_text(&word),
        }
    }

    async fn run_reply(
        self: Arc<Self>,
        inbound: InboundMessage,
        channel: Arc<dyn ChannelAdapter>,
        thread_key: ThreadId,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let recipient = inbound.thread_id.as_str().to_string();
        let destination = destination_for(channel.as_ref(), &inbound);
        let sink = Arc::new(
            ChannelSink::new(channel.clone(), recipient.clone())
                .reply_to(Some(inbound.message_id.clone())),
        );
        let messages = vec![
            ChatMessage::system(self.cfg.general.system_prompt.clone()),
            ChatMessage::user(inbound.content.clone()),
        ];
        let fragments = self.producer.stream_reply(messages);

        let typing = channel.supports_typing_events()
            && !self.dispatcher.locks().is_locked(&thread_key);
        if typing {
            set_typing(channel.as_ref(), &recipient, true).await;
        }

        let request = DispatchRequest::new(thread_key.clone(), destination, fragments, sink)
            .with_cancel(cancel)
            .incremental(channel.supports_edits());
        let report = self.dispatcher.dispatch(request).await;
        self.active
            .remove_if(&thread_key, |_, active| active.generation == generation);

        if typing {
            set_typing(channel.as_ref(), &recipient, false).await;
        }

        tracing::info!(
            thread_id = %thread_key,
            outcome = report.outcome.label(),
            total_chars = report.total_chars,
            delivered_chars = report.delivered_chars,
            "reply finished"
        );

        if report.outcome == SessionOutcome::Partial {
            deliver_whole(channel.as_ref(), &recipient, &report.text, &inbound.message_id).await;
        }

        if let Some(notice) = notice_for(&report) {
            let message = OutboundMessage::text(notice).reply_to(Some(inbound.message_id.clone()));
            if let Err(e) = channel.send(&recipient, message).await {
                tracing::warn!(%e, thread_id = %thread_key, "failed to send reply notice");
            }
        }
    }
}

/// Lock key: a thread id is only unique within its channel.
fn thread_key(inbound: &InboundMessage) -> ThreadId {
    ThreadId::new(format!("{}:{}", inbound.channel_id, inbound.thread_id))
}

/// Governor key: the chat a channel delivers to.
fn destination_for(channel: &dyn ChannelAdapter, inbound: &InboundMessage) -> DestinationId {
    DestinationId::new(format!("{}:{}", channel.channel_id(), inbound.thread_id))
}

async fn set_typing(channel: &dyn ChannelAdapter, recipient: &str, active: bool) {
    if let Err(e) = channel.send_typing(recipient, active).await {
        tracing::debug!(%e, active, "typing update failed");
    }
}

/// Sends the complete reply as fresh messages, outside the governor.
///
/// Used when the breaker kept the final push from going out; the draft, if
/// any, is left as it was.
async fn deliver_whole(
    channel: &dyn ChannelAdapter,
    recipient: &str,
    text: &str,
    reply_to: &MessageId,
) {
    let parts = split_message(&balance(text), channel.max_message_chars());
    let total = parts.len();
    for (index, part) in parts.into_iter().enumerate() {
        let message = OutboundMessage::text(part).reply_to((index == 0).then(|| reply_to.clone()));
        if let Err(e) = channel.send(recipient, message).await {
            tracing::warn!(%e, part = index + 1, total, "whole-reply delivery failed");
            return;
        }
    }
    tracing::info!(parts = total, "delivered whole reply past open circuit");
}

/// User-visible follow-up for a finished session, if one is warranted.
pub fn notice_for(report: &SessionReport) -> Option<String> {
    match &report.outcome {
        SessionOutcome::Delivered if report.total_chars == 0 => {
            Some("The model returned an empty reply.".to_string())
        }
        // Partial replies are re-sent whole by `deliver_whole`.
        SessionOutcome::Delivered | SessionOutcome::Cancelled | SessionOutcome::Partial => None,
        SessionOutcome::Busy => Some(
            "Still working on your previous message. Send /cancel to stop it.".to_string(),
        ),
        SessionOutcome::Failed(DispatchError::Producer(e)) if report.delivered_chars > 0 => {
            Some(format!("The reply was cut short: {e}"))
        }
        SessionOutcome::Failed(DispatchError::Producer(e)) => Some(format!("Error: {e}")),
        // The chat itself rejected delivery; another message would fail too.
        SessionOutcome::Failed(DispatchError::FatalDelivery(_)) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use futures_util::StreamExt;
    use relay_channels::ChannelError;
    use relay_core::{EventBus, ProducerError, SessionToken, StreamingConfig};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Sent {
        Message { content: String, reply_to: Option<String> },
        Edit { content: String },
    }

    struct RecordingAdapter {
        id: &'static str,
        sent: Mutex<Vec<Sent>>,
    }

    impl RecordingAdapter {
        fn new(id: &'static str) -> Arc<Self> {
            Arc::new(Self {
                id,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().expect("lock").clone()
        }

        fn contents(&self) -> Vec<String> {
            self.sent()
                .into_iter()
                .map(|s| match s {
                    Sent::Message { content, .. } | Sent::Edit { content } => content,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        fn channel_id(&self) -> &str {
            self.id
        }

        async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> relay_channels::Result<()> {
            Ok(())
        }

        async fn send(
            &self,
            _recipient_id: &str,
            message: OutboundMessage,
        ) -> relay_channels::Result<MessageId> {
            let mut sent = self.sent.lock().expect("lock");
            sent.push(Sent::Message {
                content: message.content,
                reply_to: message.reply_to_message_id.map(MessageId::into_inner),
            });
            Ok(MessageId::new(format!("m{}", sent.len())))
        }

        async fn edit(
            &self,
            _recipient_id: &str,
            _message_id: &MessageId,
            content: &str,
        ) -> relay_channels::Result<()> {
            self.sent.lock().expect("lock").push(Sent::Edit {
                content: content.to_string(),
            });
            Ok(())
        }

        fn supports_edits(&self) -> bool {
            true
        }
    }

    struct FailingAdapter;

    #[async_trait]
    impl ChannelAdapter for FailingAdapter {
        fn channel_id(&self) -> &str {
            "webchat"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> relay_channels::Result<()> {
            Ok(())
        }

        async fn send(
            &self,
            _recipient_id: &str,
            _message: OutboundMessage,
        ) -> relay_channels::Result<MessageId> {
            Err(ChannelError::Fatal("chat not found".to_string()))
        }
    }

    struct ScriptedProducer {
        replies: Mutex<VecDeque<FragmentStream>>,
        calls: AtomicU64,
    }

    impl ScriptedProducer {
        fn with(replies: Vec<FragmentStream>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU64::new(0),
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl ReplyProducer for ScriptedProducer {
        fn stream_reply(&self, _messages: Vec<ChatMessage>) -> FragmentStream {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.replies
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| futures_util::stream::empty().boxed())
        }
    }

    fn text_reply(parts: &[&str]) -> FragmentStream {
        let parts: Vec<Result<String, ProducerError>> =
            parts.iter().map(|p| Ok(p.to_string())).collect();
        futures_util::stream::iter(parts).boxed()
    }

    fn endless_reply(first: &str) -> FragmentStream {
        futures_util::stream::iter(vec![Ok::<_, ProducerError>(first.to_string())])
            .chain(futures_util::stream::pending())
            .boxed()
    }

    fn inbound(channel: &str, sender: &str, content: &str) -> InboundMessage {
        InboundMessage {
            message_id: MessageId::new(format!("in-{content}")),
            channel_id: channel.into(),
            sender_id: sender.into(),
            thread_id: sender.into(),
            is_group: false,
            content: content.to_string(),
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    struct Harness {
        gateway: Arc<Gateway>,
        tx: mpsc::Sender<InboundMessage>,
        shutdown: CancellationToken,
        handle: JoinHandle<()>,
    }

    fn harness(adapter: Arc<dyn ChannelAdapter>, producer: Arc<dyn ReplyProducer>) -> Harness {
        let cfg = RelayConfig::from_toml_str("[general]\nmodel = \"gpt-4o-mini\"\n")
            .expect("config");
        let dispatcher = Arc::new(StreamDispatcher::from_config(
            StreamingConfig::default(),
            EventBus::new(),
        ));
        let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
        channels.insert(adapter.channel_id().to_string(), adapter);
        let gateway = Arc::new(Gateway::new(Arc::new(cfg), dispatcher, producer, channels));
        let (tx, rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let handle = gateway.clone().start(rx, shutdown.clone());
        Harness {
            gateway,
            tx,
            shutdown,
            handle,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn message_is_streamed_as_a_threaded_reply() {
        let adapter = RecordingAdapter::new("webchat");
        let producer = ScriptedProducer::with(vec![text_reply(&["Hello", ", world"])]);
        let h = harness(adapter.clone(), producer.clone());

        h.tx.send(inbound("webchat", "alice", "hi")).await.expect("send");
        wait_until(|| !adapter.sent().is_empty()).await;

        assert_eq!(
            adapter.sent(),
            vec![Sent::Message {
                content: "Hello, world".to_string(),
                reply_to: Some("in-hi".to_string()),
            }]
        );
        assert_eq!(producer.calls(), 1);

        h.shutdown.cancel();
        h.handle.await.expect("gateway");
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_answered_without_generating() {
        let adapter = RecordingAdapter::new("webchat");
        let producer = ScriptedProducer::with(vec![]);
        let h = harness(adapter.clone(), producer.clone());

        h.tx.send(inbound("webchat", "alice", "/help")).await.expect("send");
        h.tx.send(inbound("webchat", "alice", "/status")).await.expect("send");
        h.tx.send(inbound("webchat", "alice", "/cancel")).await.expect("send");
        wait_until(|| adapter.sent().len() == 3).await;

        let contents = adapter.contents();
        assert!(contents[0].contains("/cancel"));
        assert!(contents[1].contains("model=gpt-4o-mini"));
        assert!(contents[1].contains("generating=false"));
        assert!(contents[1].contains("circuit=closed"));
        assert_eq!(contents[2], "Nothing to cancel.");
        assert_eq!(producer.calls(), 0);

        h.shutdown.cancel();
        h.handle.await.expect("gateway");
    }

    #[tokio::test(start_paused = true)]
    async fn senders_off_the_allowlist_are_ignored() {
        let adapter = RecordingAdapter::new("telegram");
        let producer = ScriptedProducer::with(vec![text_reply(&["hi"])]);
        let h = harness(adapter.clone(), producer.clone());

        h.tx.send(inbound("telegram", "999", "hello")).await.expect("send");
        h.tx.send(inbound("telegram", "999", "/help")).await.expect("send");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(adapter.sent().is_empty());
        assert_eq!(producer.calls(), 0);

        h.shutdown.cancel();
        h.handle.await.expect("gateway");
    }

    #[tokio::test(start_paused = true)]
    async fn second_message_is_busy_and_cancel_stops_the_first() {
        let adapter = RecordingAdapter::new("webchat");
        let producer = ScriptedProducer::with(vec![endless_reply("thinking"), text_reply(&["x"])]);
        let h = harness(adapter.clone(), producer.clone());
        let key = ThreadId::new("webchat:alice");

        h.tx.send(inbound("webchat", "alice", "first")).await.expect("send");
        let locks = h.gateway.dispatcher.locks().clone();
        wait_until(|| locks.is_locked(&key)).await;

        h.tx.send(inbound("webchat", "alice", "second")).await.expect("send");
        wait_until(|| adapter.contents().iter().any(|c| c.starts_with("Still working"))).await;

        h.tx.send(inbound("webchat", "alice", "/cancel")).await.expect("send");
        let gateway = h.gateway.clone();
        wait_until(|| !locks.is_locked(&key) && gateway.active.is_empty()).await;

        let contents = adapter.contents();
        assert!(contents.iter().any(|c| c == "Cancelling the current reply."));
        // The busy session never polled its producer stream.
        assert_eq!(producer.calls(), 2);

        h.shutdown.cancel();
        h.handle.await.expect("gateway");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_running_replies() {
        let adapter = RecordingAdapter::new("webchat");
        let producer = ScriptedProducer::with(vec![endless_reply("thinking")]);
        let h = harness(adapter.clone(), producer);
        let key = ThreadId::new("webchat:bob");

        h.tx.send(inbound("webchat", "bob", "hello")).await.expect("send");
        let locks = h.gateway.dispatcher.locks().clone();
        wait_until(|| locks.is_locked(&key)).await;

        h.shutdown.cancel();
        h.handle.await.expect("gateway");
        assert!(!locks.is_locked(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_does_not_stall_the_gateway() {
        let producer = ScriptedProducer::with(vec![text_reply(&["a"]), text_reply(&["b"])]);
        let h = harness(Arc::new(FailingAdapter), producer.clone());

        h.tx.send(inbound("webchat", "carol", "one")).await.expect("send");
        h.tx.send(inbound("webchat", "dave", "two")).await.expect("send");
        let gateway = h.gateway.clone();
        wait_until(|| producer.calls() == 2 && gateway.dispatcher.locks().is_empty()).await;

        h.shutdown.cancel();
        h.handle.await.expect("gateway");
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_still_delivers_the_whole_reply() {
        let adapter = RecordingAdapter::new("webchat");
        let producer = ScriptedProducer::with(vec![text_reply(&["Hello", ", world"])]);
        let h = harness(adapter.clone(), producer);
        let governor = h.gateway.dispatcher.governor().clone();
        let destination = DestinationId::new("webchat:alice");
        for _ in 0..governor.policy().breaker_threshold {
            governor.record_failure(&destination, None, tokio::time::Instant::now());
        }

        h.tx.send(inbound("webchat", "alice", "hi")).await.expect("send");
        wait_until(|| !adapter.sent().is_empty()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            adapter.sent(),
            vec![Sent::Message {
                content: "Hello, world".to_string(),
                reply_to: Some("in-hi".to_string()),
            }]
        );
        assert_eq!(
            governor.circuit_state(&destination, tokio::time::Instant::now()),
            relay_core::CircuitState::Open
        );

        h.shutdown.cancel();
        h.handle.await.expect("gateway");
    }

    fn report(outcome: SessionOutcome, total: usize, delivered: usize) -> SessionReport {
        SessionReport {
            session_id: SessionToken::new(),
            thread_id: ThreadId::new("webchat:a"),
            outcome,
            text: String::new(),
            total_chars: total,
            delivered_chars: delivered,
            pushes_attempted: 0,
            pushes_succeeded: 0,
            streaming_abandoned: false,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn notices_follow_the_outcome() {
        assert_eq!(notice_for(&report(SessionOutcome::Delivered, 10, 10)), None);
        assert_eq!(notice_for(&report(SessionOutcome::Cancelled, 10, 4)), None);
        assert!(
            notice_for(&report(SessionOutcome::Delivered, 0, 0))
                .is_some_and(|n| n.contains("empty"))
        );
        assert!(
            notice_for(&report(SessionOutcome::Busy, 0, 0)).is_some_and(|n| n.contains("/cancel"))
        );
        assert_eq!(notice_for(&report(SessionOutcome::Partial, 10, 4)), None);

        let producer_err =
            SessionOutcome::Failed(DispatchError::Producer(ProducerError::Backend("boom".into())));
        assert!(
            notice_for(&report(producer_err.clone(), 0, 0))
                .is_some_and(|n| n.starts_with("Error:"))
        );
        assert!(
            notice_for(&report(producer_err, 10, 10)).is_some_and(|n| n.contains("cut short"))
        );
        assert_eq!(
            notice_for(&report(
                SessionOutcome::Failed(DispatchError::FatalDelivery("gone".into())),
                10,
                0
            )),
            None
        );
    }
}
