use sender::Pipeline;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

use crate::config::{Config, ConfigError};
use crate::ingest_service::IngestService;

#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build the send pipeline: {0}")]
    Sender(#[from] sender::SenderError),

    #[error("failed to install the statsd exporter: {0}")]
    Metrics(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves once the shutdown flag flips to true or its sender is gone.
async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Re-reads the config file on every SIGHUP and hands the sender section to the
/// pipeline. A file that fails to load or validate is logged and ignored.
async fn reload_on_hangup(
    path: PathBuf,
    pipeline: Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGHUP handler, reload disabled");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
            }
        }

        tracing::info!(path = %path.display(), "reloading configuration");
        if let Err(e) = reload(&path, &pipeline) {
            tracing::error!(error = %e, "configuration reload failed, keeping the current one");
        }
    }
}

fn reload(path: &Path, pipeline: &Pipeline) -> Result<(), TransferError> {
    let config = Config::load(path)?;
    pipeline.reload(&config.sender)?;
    Ok(())
}

pub async fn run(path: PathBuf, config: Config) -> Result<(), TransferError> {
    let pipeline = Arc::new(Pipeline::new(&config.sender)?);
    let dispatchers = pipeline.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = config.listener.clone();
    let ingest_service = IngestService::new(pipeline.clone());
    let ingest_shutdown = wait_for(shutdown_rx.clone());
    let mut ingest_task = tokio::spawn(async move {
        run_http_service(&listener.host, listener.port, ingest_service, ingest_shutdown).await
    });

    let ready = pipeline.clone();
    let stats = pipeline.clone();
    let admin_service = AdminService::new(
        move || ready.is_ready(),
        move || serde_json::to_string(&stats.stats_snapshot()).unwrap_or_default(),
    );
    let admin_listener = config.admin_listener.clone();
    let admin_shutdown = wait_for(shutdown_rx.clone());
    let mut admin_task = tokio::spawn(async move {
        run_http_service(
            &admin_listener.host,
            admin_listener.port,
            admin_service,
            admin_shutdown,
        )
        .await
    });

    let reload_task = tokio::spawn(reload_on_hangup(
        path,
        pipeline.clone(),
        shutdown_rx.clone(),
    ));

    tracing::info!(
        listener = config.listener.port,
        admin_listener = config.admin_listener.port,
        "transfer started"
    );

    // A listener that fails to bind ends the process as well
    let mut listener_error = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        }
        joined = &mut ingest_task => listener_error = listener_failure(joined),
        joined = &mut admin_task => listener_error = listener_failure(joined),
    }

    tracing::info!("shutting down");
    pipeline.close();
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(config.shutdown_grace_secs);
    if !dispatchers.shutdown(grace).await {
        tracing::warn!(grace_secs = config.shutdown_grace_secs, "dispatch workers aborted");
    }
    let discarded = pipeline.discard_pending();

    for task in [ingest_task, admin_task] {
        if !task.is_finished() {
            task.abort();
        }
    }
    reload_task.abort();

    let snapshot = pipeline.stats_snapshot();
    tracing::info!(discarded, stats = ?snapshot, "transfer stopped");

    match listener_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn listener_failure(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Option<TransferError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.into()),
        Err(e) => Some(TransferError::Io(std::io::Error::other(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(sender: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(
            tmp,
            r#"
listener: {{host: 127.0.0.1, port: 6060}}
admin_listener: {{host: 127.0.0.1, port: 6061}}
sender:
{sender}
"#
        )
        .unwrap();
        tmp
    }

    const SENDER: &str = r#"
  threshold:
    cluster:
      judge-00: "127.0.0.1:6080"
      judge-01: "127.0.0.1:6081"
"#;

    #[test]
    fn test_reload_from_file() {
        let initial = write_config(SENDER);
        let config = Config::load(initial.path()).unwrap();
        let pipeline = Pipeline::new(&config.sender).unwrap();

        let shrunk = write_config(
            r#"
  threshold:
    cluster:
      judge-00: "127.0.0.1:6080"
"#,
        );
        reload(shrunk.path(), &pipeline).unwrap();
        assert_eq!(
            pipeline.ring_members(sender::Family::Threshold),
            vec!["judge-00".to_string()]
        );
    }

    #[test]
    fn test_reload_rejects_invalid_file() {
        let initial = write_config(SENDER);
        let config = Config::load(initial.path()).unwrap();
        let pipeline = Pipeline::new(&config.sender).unwrap();

        let broken = write_config("  threshold: {cluster: {}}");
        let err = reload(broken.path(), &pipeline).unwrap_err();
        assert!(matches!(err, TransferError::Config(ConfigError::Invalid(_))));
        assert_eq!(pipeline.ring_members(sender::Family::Threshold).len(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_shutdown() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(wait_for(rx));
        tx.send(true).unwrap();
        waiter.await.unwrap();
    }
}
