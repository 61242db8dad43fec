//! Metrics HTTP Server
//!
//! Minimal HTTP responder for Prometheus scraping and quick health checks.

use crate::metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// HTTP server for serving Prometheus metrics
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    listener: TcpListener,
}

impl MetricsServer {
    /// Bind the metrics endpoint
    pub async fn bind(bind_addr: SocketAddr, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(bind_addr = %bind_addr, "Metrics server started");
        Ok(Self { metrics, listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((mut stream, addr)) => {
                        debug!(client_addr = %addr, "Metrics request received");

                        let metrics = Arc::clone(&self.metrics);
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(&mut stream, metrics).await {
                                error!(error = %e, client_addr = %addr, "Failed to handle metrics request");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept metrics connection");
                    }
                },
                Ok(()) = shutdown.recv() => {
                    info!("Metrics server stopped");
                    break;
                }
            }
        }
    }
}

/// Handle a single HTTP request
async fn handle_request(stream: &mut TcpStream, metrics: Arc<Metrics>) -> anyhow::Result<()> {
    let mut buffer = [0; 1024];
    let bytes_read = stream.read(&mut buffer).await?;

    if bytes_read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    debug!(request = %request, "Received HTTP request");

    let response = if request.starts_with("GET /metrics") {
        let body = metrics.export_prometheus()?;
        http_response("200 OK", "text/plain; version=0.0.4; charset=utf-8", &body)
    } else if request.starts_with("GET /stats") {
        let body = serde_json::to_string_pretty(&metrics.snapshot())?;
        http_response("200 OK", "application/json", &body)
    } else if request.starts_with("GET /health") {
        http_response("200 OK", "text/plain", "OK")
    } else {
        http_response("404 Not Found", "text/plain", "Not Found")
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        content_type,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsSnapshot;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_metrics_endpoints() -> anyhow::Result<()> {
        let metrics = Arc::new(Metrics::new()?);
        metrics.session_opened();

        let server = MetricsServer::bind("127.0.0.1:0".parse()?, Arc::clone(&metrics)).await?;
        let addr = server.local_addr()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(server.run(shutdown_rx));

        let response = get(addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("stratum_relay_active_sessions 1"));

        let response = get(addr, "/stats").await;
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let snapshot: MetricsSnapshot = serde_json::from_str(body)?;
        assert_eq!(snapshot.sessions_total, 1);

        let response = get(addr, "/health").await;
        assert!(response.ends_with("OK"));

        let response = get(addr, "/nope").await;
        assert!(response.starts_with("HTTP/1.1 404"));

        shutdown_tx.send(())?;
        handle.await?;
        Ok(())
    }
}
