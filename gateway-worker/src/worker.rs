// Composition root.
//
// Builds the engine from configuration, starts the three queue consumers,
// the reconnect sweeper, the heartbeat, and the health endpoint, then
// supervises them: a benign transport fault is logged and survived, an
// unclassified fault alerts and exits(1) so the supervisor restarts us.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;
use uuid::Uuid;

use gateway_shared::clients::db::create_pool;
use gateway_shared::clients::redis::RedisClient;

use crate::auth_store::AuthStateStore;
use crate::config::{AppConfig, EngineSettings};
use crate::inbound::DELIVER_JOB_OPTIONS;
use crate::ops::{self, DbLogger};
use crate::outbound;
use crate::queue::{
    self, ConsumerOptions, Job, JobOutcome, JobProducer, Queue, RedisJobProducer,
    DEVICE_COMMANDS, JOB_CONNECT, JOB_DELIVER, JOB_DISCONNECT, JOB_RESET_SENDER_SESSIONS,
    OUTBOUND_MESSAGES, WEBHOOK_DISPATCH,
};
use crate::session::SessionManager;
use crate::store::{PgStore, StateStore};
use crate::sweeper;
use crate::transport::ChatTransport;
use crate::vault::Vault;
use crate::webhook;

/// PENDING deliveries older than this get re-enqueued at startup; younger
/// ones are presumed to still have their job in the broker.
const STALE_DELIVERY_CUTOFF: Duration = Duration::from_secs(600);

/// Run the worker until a fatal fault. The caller supplies the concrete
/// chat transport; every other collaborator is built from configuration.
pub async fn run(config: AppConfig, transport: Arc<dyn ChatTransport>) -> anyhow::Result<()> {
    config.log_summary();

    let vault = Vault::from_key_b64(config.wa_auth_enc_key_b64.as_deref())
        .map(Arc::new)
        .context("WA_AUTH_ENC_KEY_B64 must be a base64-encoded 32-byte key")?;

    let pool = create_pool(&config.database_url);
    let redis = RedisClient::connect(&config.redis_url).await?;

    let store: Arc<dyn StateStore> = Arc::new(PgStore::new(pool));
    let db_logger = DbLogger::new(store.clone());
    let http = webhook::build_http_client();
    let producer: Arc<dyn JobProducer> = Arc::new(RedisJobProducer::new(redis.clone()));
    let auth_store = Arc::new(AuthStateStore::new(store.clone(), vault));
    let settings = EngineSettings::from_config(&config);

    let manager = SessionManager::new(
        store.clone(),
        auth_store,
        transport,
        producer.clone(),
        settings.clone(),
    );

    recover_stale_deliveries(&store, &producer, Utc::now() - chrono::Duration::from_std(STALE_DELIVERY_CUTOFF)?).await;

    let mut critical: JoinSet<anyhow::Result<()>> = JoinSet::new();

    // Device commands: one consumer, serial per worker.
    {
        let manager = manager.clone();
        let commands = Queue::new(redis.clone(), DEVICE_COMMANDS);
        critical.spawn(async move {
            queue::run_consumer(
                commands,
                ConsumerOptions { concurrency: 1 },
                move |job| {
                    let manager = manager.clone();
                    async move { handle_device_command(&manager, &job).await }
                },
                |failed| async move {
                    tracing::error!(
                        job = %failed.job.name,
                        reason = %failed.reason,
                        will_retry = failed.next_retry_in.is_some(),
                        "device command failed"
                    );
                },
            )
            .await;
            Ok(())
        });
    }

    // Outbound messages: up to 5 in flight.
    {
        let store = store.clone();
        let manager = manager.clone();
        let settings = settings.clone();
        let hook_store = store.clone();
        let outbound_queue = Queue::new(redis.clone(), OUTBOUND_MESSAGES);
        critical.spawn(async move {
            queue::run_consumer(
                outbound_queue,
                ConsumerOptions { concurrency: 5 },
                move |job| {
                    let store = store.clone();
                    let manager = manager.clone();
                    let settings = settings.clone();
                    async move { outbound::handle_send_job(&store, &manager, &settings, &job).await }
                },
                move |failed| {
                    let store = hook_store.clone();
                    async move { outbound::on_send_failure(&store, &failed) }
                },
            )
            .await;
            Ok(())
        });
    }

    // Webhook dispatch: up to 10 in flight.
    {
        let store = store.clone();
        let http = http.clone();
        let hook_store = store.clone();
        let dispatch_queue = Queue::new(redis.clone(), WEBHOOK_DISPATCH);
        critical.spawn(async move {
            queue::run_consumer(
                dispatch_queue,
                ConsumerOptions { concurrency: 10 },
                move |job| {
                    let store = store.clone();
                    let http = http.clone();
                    async move { webhook::handle_deliver_job(&store, &http, &job).await }
                },
                move |failed| {
                    let store = hook_store.clone();
                    async move { webhook::on_deliver_failure(&store, &failed) }
                },
            )
            .await;
            Ok(())
        });
    }

    // Health endpoint.
    {
        let port = config.worker_health_port;
        critical.spawn(async move { ops::serve_health(port).await.context("health endpoint") });
    }

    // Heartbeat.
    critical.spawn(async move {
        ops::heartbeat_loop().await;
        Ok(())
    });

    // Reconnect sweep: best-effort, not supervised as critical.
    tokio::spawn(sweeper::run(
        manager.clone(),
        store.clone(),
        Duration::from_millis(config.worker_reconnect_all_delay_ms),
        Duration::from_millis(config.worker_reconnect_stagger_ms),
    ));

    tracing::info!("worker started");

    while let Some(result) = critical.join_next().await {
        let message = match result {
            Ok(Ok(())) => "critical task exited unexpectedly".to_string(),
            Ok(Err(e)) => format!("{e:#}"),
            Err(e) => format!("critical task panicked: {e}"),
        };

        if ops::handle_escaped_fault(&db_logger, &message) {
            if let Some(alert_url) = config.worker_alert_email_url.as_deref() {
                ops::send_crash_alert(&http, alert_url, &message).await;
            }
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Re-enqueue PENDING deliveries that never made it into the broker
/// (crash between the fan-out commit and the enqueue).
pub async fn recover_stale_deliveries(
    store: &Arc<dyn StateStore>,
    producer: &Arc<dyn JobProducer>,
    cutoff: chrono::DateTime<Utc>,
) {
    let ids = match store.stale_pending_delivery_ids(cutoff) {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "stale delivery recovery scan failed");
            return;
        }
    };
    if ids.is_empty() {
        return;
    }

    tracing::warn!(count = ids.len(), "re-enqueueing stale PENDING deliveries");
    for delivery_id in ids {
        if let Err(e) = producer
            .enqueue(
                WEBHOOK_DISPATCH,
                JOB_DELIVER,
                json!({"deliveryId": delivery_id}),
                DELIVER_JOB_OPTIONS,
            )
            .await
        {
            tracing::error!(delivery_id = %delivery_id, error = %e, "stale delivery re-enqueue failed");
        }
    }
}

fn parse_device_id(job: &Job) -> Option<Uuid> {
    job.payload
        .get("deviceId")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Route one `device_commands` job to the session manager.
pub async fn handle_device_command(manager: &SessionManager, job: &Job) -> JobOutcome {
    let Some(device_id) = parse_device_id(job) else {
        return JobOutcome::Terminal("device command payload missing deviceId".to_string());
    };

    match job.name.as_str() {
        JOB_CONNECT => match manager.connect(device_id).await {
            Ok(()) => JobOutcome::Ok,
            Err(e) => JobOutcome::Retry(e.to_string()),
        },
        JOB_DISCONNECT => match manager.disconnect(device_id).await {
            Ok(()) => JobOutcome::Ok,
            Err(e) => JobOutcome::Retry(e.to_string()),
        },
        JOB_RESET_SENDER_SESSIONS => {
            let jids: Vec<String> = job
                .payload
                .get("jids")
                .and_then(|v| v.as_array())
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            if jids.is_empty() {
                return JobOutcome::Terminal(
                    "reset-sender-sessions payload missing jids".to_string(),
                );
            }
            match manager.reset_sender_sessions(device_id, &jids).await {
                Ok(()) => JobOutcome::Ok,
                Err(e) => JobOutcome::Retry(e.to_string()),
            }
        }
        other => JobOutcome::Terminal(format!("unknown device command: {other}")),
    }
}
