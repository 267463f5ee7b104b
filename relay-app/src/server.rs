//! chatrelay server.
//!
//! Wires the relay engine to the configured channels and the LLM producer,
//! then serves the WebChat socket and the relay admin routes.

use crate::config::RelayConfig;
use crate::gateway::{Gateway, ReplyProducer};
use crate::routes;
use crate::stats::RelayStats;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use relay_channels::{ChannelAdapter, TelegramAdapter, WebChatAdapter};
use relay_core::{EventBus, LockWatchdog, RateGovernor, StreamDispatcher, ThreadLock};
use relay_llm::LlmClient;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Shared by the admin routes.
pub struct RelayState {
    pub cfg: Arc<RelayConfig>,
    pub started_at: Instant,
    pub dispatcher: Arc<StreamDispatcher>,
    pub stats: Arc<RelayStats>,
    pub channels: Vec<String>,
}

impl RelayState {
    pub fn new(
        cfg: Arc<RelayConfig>,
        dispatcher: Arc<StreamDispatcher>,
        stats: Arc<RelayStats>,
        channels: Vec<String>,
    ) -> Self {
        Self {
            cfg,
            started_at: Instant::now(),
            dispatcher,
            stats,
            channels,
        }
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayConfig::load_with_path(config_path).await?;
    let key_configured = cfg.api_key_for_model().is_some();
    tracing::info!(
        model = %cfg.general.model,
        api_key_configured = key_configured,
        bind = %cfg.server.bind,
        channels = ?cfg.enabled_channels(),
        config_path = %path.display(),
        "config ok"
    );
    println!("config:   {}", path.display());
    println!("model:    {}", cfg.general.model);
    println!("api key:  {}", if key_configured { "configured" } else { "MISSING" });
    println!("bind:     {}", cfg.server.bind);
    println!("channels: {}", cfg.enabled_channels().join(","));
    println!(
        "streaming: size={} chars, time={}ms, interval={}..{}ms (baseline {}ms), breaker={} failures / {}s cooldown, abandon after {}",
        cfg.streaming.size_threshold_chars,
        cfg.streaming.time_threshold_ms,
        cfg.streaming.min_interval_ms,
        cfg.streaming.max_interval_ms,
        cfg.streaming.baseline_interval_ms,
        cfg.streaming.breaker_threshold,
        cfg.streaming.cooldown_secs,
        cfg.streaming.abandon_streaming_threshold,
    );
    if !key_configured {
        return Err(anyhow::anyhow!(
            "no api key configured for model {}",
            cfg.general.model
        ));
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = RelayConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        model = %cfg.general.model,
        webchat_enabled = cfg.channels.webchat.enabled,
        telegram_enabled = cfg.channels.telegram.enabled,
        http_max_in_flight = cfg.server.max_in_flight,
        http_timeout_seconds = cfg.server.request_timeout_secs,
        streaming = ?cfg.streaming,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;
    let cfg = Arc::new(cfg);
    let shutdown = CancellationToken::new();

    // Engine.
    let events = EventBus::new();
    let stats = RelayStats::new();
    let stats_handle = stats.spawn(&events, shutdown.child_token());
    let (locks, leases) = ThreadLock::watched();
    let locks = Arc::new(locks);
    let governor = Arc::new(RateGovernor::new(cfg.streaming.governor_policy()));
    let watchdog_handle = LockWatchdog::new(
        locks.clone(),
        governor.clone(),
        events.clone(),
        cfg.streaming.lock_staleness(),
        cfg.streaming.governor_idle_ttl(),
    )
    .spawn(leases, shutdown.child_token());
    let dispatcher = Arc::new(StreamDispatcher::new(
        cfg.streaming.clone(),
        governor,
        locks,
        events,
    ));

    // Producer.
    let api_key = cfg.api_key_for_model().ok_or_else(|| {
        anyhow::anyhow!("no api key configured for model {}", cfg.general.model)
    })?;
    let mut llm = LlmClient::new(&api_key, &cfg.general.model);
    if let Some(base_url) = cfg.general.llm_base_url.as_deref() {
        llm = llm.with_base_url(base_url);
    }
    tracing::info!(provider = llm.provider().as_str(), model = llm.model(), "llm client ready");
    let producer: Arc<dyn ReplyProducer> = Arc::new(llm);

    // Channels.
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(cfg.server.inbound_queue);
    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    let mut app = routes::router();
    if cfg.channels.webchat.enabled {
        let webchat = Arc::new(WebChatAdapter::new());
        webchat.start(inbound_tx.clone()).await?;
        app = app.merge(webchat.clone().router());
        channels.insert(webchat.channel_id().to_string(), webchat);
    }
    if cfg.channels.telegram.enabled {
        let mut telegram = TelegramAdapter::new(&cfg.channels.telegram.bot_token)?;
        if let Some(api_base) = cfg.channels.telegram.api_base.as_deref() {
            telegram = telegram.with_api_base(api_base);
        }
        let telegram = Arc::new(telegram);
        telegram.start(inbound_tx.clone()).await?;
        channels.insert(telegram.channel_id().to_string(), telegram);
    }
    drop(inbound_tx);

    let gateway = Arc::new(Gateway::new(
        cfg.clone(),
        dispatcher.clone(),
        producer,
        channels,
    ));
    let channel_names = gateway.channel_names();
    let gateway_handle = gateway.start(inbound_rx, shutdown.child_token());
    tracing::info!(channels = ?channel_names, "gateway started");

    let state = Arc::new(RelayState::new(
        cfg.clone(),
        dispatcher,
        stats,
        channel_names,
    ));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::debug!(
                method = %request.method(),
                uri = %request.uri(),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = app
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.request_timeout_secs),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "chatrelay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    if let Err(e) = watchdog_handle.await {
        tracing::error!(error = %e, "lock watchdog join failed during shutdown");
    }
    if let Err(e) = stats_handle.await {
        tracing::error!(error = %e, "stats subscriber join failed during shutdown");
    }

    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}
