use std::{
    future::{Future, IntoFuture},
    io,
    time::Duration,
};

use axum::Router;
use tokio::{net::TcpListener, sync::watch};
use tracing::{info, warn};

/// Serves `app` until `shutdown` resolves, then drains open connections for at most `drain_timeout`.
pub async fn serve<F>(
    listener: TcpListener,
    app: Router,
    shutdown: F,
    drain_timeout: Duration,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (draining_tx, mut draining_rx) = watch::channel(false);

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            let _ = draining_tx.send(true);
        })
        .into_future();

    let deadline = async move {
        let draining = draining_rx.wait_for(|draining| *draining).await.is_ok();
        if !draining {
            std::future::pending::<()>().await;
        }
        info!(stage = "app", timeout_ms = drain_timeout.as_millis() as u64, "draining connections");
        tokio::time::sleep(drain_timeout).await;
    };

    tokio::select! {
        result = server => result,
        () = deadline => {
            warn!(stage = "app", "drain deadline reached; dropping open connections");
            Ok(())
        }
    }
}
