mod config;
mod directory;
mod frame;
mod stream;
mod verbs;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use config::Config;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use vp_audit::PgAuditSink;
use vp_control::ChannelDescriptor;
use vp_core::{Dispatcher, StaticChannelDirectory, SystemClock};
use vp_metrics::{AuditMetricsImpl, BrokerMetricsImpl, LabelPolicy, MetricsConfig, MetricsServer};

use crate::directory::PgChannelDirectory;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = Config::parse();

    let ms = MetricsServer::install(MetricsConfig {
        listen: cfg.metrics_listen.clone(),
        namespace: "vp",
    })?;
    tokio::spawn(async move {
        let _ = ms.serve().await;
    });

    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&cfg.database_url)
        .await?;

    PgAuditSink::run_migrations(&pool).await?;

    let broker_metrics = Arc::new(BrokerMetricsImpl::new("vp", LabelPolicy::default()));
    let audit_metrics = Arc::new(AuditMetricsImpl::new("vp"));
    let audit = Arc::new(PgAuditSink::new(
        pool.clone(),
        cfg.audit_queue_capacity,
        audit_metrics,
    ));

    let directory: Arc<dyn vp_core::ChannelDirectory> = if cfg.dev_mode {
        let static_directory = Arc::new(StaticChannelDirectory::new());
        static_directory.seed(ChannelDescriptor {
            id: cfg
                .dev_channel_id
                .map(vp_control::ChannelId)
                .unwrap_or_else(vp_control::ChannelId::new),
            display_name: cfg.dev_channel_name.clone(),
            capacity: cfg.dev_channel_capacity,
            created_at: chrono::Utc::now(),
        });
        info!("dev mode: seeded static channel directory with one channel");
        static_directory
    } else {
        Arc::new(PgChannelDirectory::new(pool.clone()))
    };

    let dispatcher = Dispatcher::new(
        directory,
        cfg.broker_config(),
        Arc::new(SystemClock),
        audit,
        broker_metrics,
    );

    tokio::spawn(dispatcher.clone().run_dehydration_sweep());

    let verb_listener = TcpListener::bind(&cfg.verb_listen).await?;
    let stream_listener = TcpListener::bind(&cfg.stream_listen).await?;

    tokio::select! {
        r = verbs::serve(verb_listener, dispatcher.clone()) => r?,
        r = stream::serve(stream_listener, dispatcher) => r?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown");
        }
    }

    Ok(())
}
