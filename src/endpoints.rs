//! Endpoint server for exposing metrics and health checks

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::metrics::metrics;

/// Serve `/metrics` (Prometheus text format) and `/health` until `shutdown` fires
pub async fn endpoint_server(port: u16, shutdown: CancellationToken) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Metrics endpoint listening on {}", addr);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Metrics endpoint stopped");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, _)) => {
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket).await {
                            tracing::debug!("Metrics connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(mut socket: TcpStream) -> Result<()> {
    let mut buf = [0; 1024];
    let n = socket.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let response = respond(request_path(&request));
    socket.write_all(response.as_bytes()).await?;
    Ok(())
}

fn request_path(request: &str) -> &str {
    request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
}

fn respond(path: &str) -> String {
    let (status, body) = match path {
        "/metrics" => match metrics().encode_text() {
            Ok(text) => ("200 OK", text),
            Err(e) => ("500 Internal Server Error", e.to_string()),
        },
        "/health" => ("200 OK", "ok\n".to_string()),
        _ => ("404 Not Found", "not found\n".to_string()),
    };
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        assert_eq!(request_path("GET /metrics HTTP/1.1\r\nHost: x\r\n"), "/metrics");
        assert_eq!(request_path(""), "/");
        assert!(respond("/health").starts_with("HTTP/1.1 200 OK"));
        assert!(respond("/nope").starts_with("HTTP/1.1 404"));
        metrics().passes_total.inc();
        assert!(respond("/metrics").contains("passes_total"));
    }
}
