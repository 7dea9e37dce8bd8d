//! An HTTP load driver that runs inside the orchestrator process.

use crate::cancel::CancelSignal;
use crate::error::{ExpfError, Result};
use crate::load::adapter::LoadGenerator;
use crate::load::metrics::LoadMetrics;
use crate::load::options::{RequestOverrides, ToolOptions};
use crate::load::result::ToolResult;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const NAME: &str = "in-process";

#[derive(Debug)]
pub struct InProcess {
    defaults: ToolOptions,
    client: reqwest::Client,
    stop: CancellationToken,
    cancel: CancelSignal,
}

impl InProcess {
    pub fn new(defaults: ToolOptions, cancel: CancelSignal) -> Result<Self> {
        // Generous timeout so slow responses under load are measured, not dropped.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ExpfError::InvalidOptions(format!("http client: {}", e)))?;

        Ok(Self {
            defaults,
            client,
            stop: CancellationToken::new(),
            cancel,
        })
    }

    fn stopped(&self) -> Option<ExpfError> {
        if self.cancel.is_cancelled() {
            Some(self.cancel.error())
        } else if self.stop.is_cancelled() {
            Some(ExpfError::Cancelled(format!("{} was closed", NAME)))
        } else {
            None
        }
    }

    async fn worker(
        client: reqwest::Client,
        request: Arc<PreparedRequest>,
        deadline: Instant,
        pace: Option<Duration>,
        stop: CancellationToken,
    ) -> LoadMetrics {
        let mut metrics = LoadMetrics::new();

        while Instant::now() < deadline && !stop.is_cancelled() {
            let mut builder = client.request(request.method.clone(), &request.url);
            for (key, value) in &request.headers {
                builder = builder.header(key, value);
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let request_start = Instant::now();
            let outcome = tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => break,
                outcome = async {
                    let response = builder.send().await?;
                    let status = response.status().as_u16();
                    let bytes = response.bytes().await?.len() as u64;
                    Ok::<_, reqwest::Error>((status, bytes))
                } => outcome,
            };

            match outcome {
                Ok((status, bytes)) => {
                    metrics.record_response(request_start.elapsed(), status, bytes)
                }
                Err(_) => metrics.record_connection_error(),
            }

            if let Some(pace) = pace {
                let elapsed = request_start.elapsed();
                if elapsed < pace {
                    sleep(pace - elapsed).await;
                }
            }
        }

        metrics
    }
}

#[derive(Debug)]
struct PreparedRequest {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

#[async_trait]
impl LoadGenerator for InProcess {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn start(&self, request: &RequestOverrides) -> Result<ToolResult> {
        if let Some(err) = self.stopped() {
            return Err(err);
        }
        let options = self.defaults.for_request(request)?;
        let method = Method::from_bytes(options.method.as_bytes())
            .map_err(|_| ExpfError::InvalidOptions(format!("method {}", options.method)))?;

        let prepared = Arc::new(PreparedRequest {
            method,
            url: options.url.clone(),
            headers: options
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: options.body.as_ref().map(|b| b.to_payload()),
        });
        let pace = options
            .rate
            .map(|rate| Duration::from_secs_f64(options.connections as f64 / rate as f64));

        // Stop workers on close() or on the run's cancel signal.
        let stop = self.stop.child_token();
        let cancel = self.cancel.clone();
        let stop_on_cancel = stop.clone();
        let watcher = tokio::spawn(async move {
            cancel.cancelled().await;
            stop_on_cancel.cancel();
        });

        debug!(url = %options.url, connections = options.connections, duration = options.duration, "starting in-process load");
        let started = Instant::now();
        let deadline = started + Duration::from_secs(options.duration);
        let mut workers = FuturesUnordered::new();
        for _ in 0..options.connections {
            workers.push(tokio::spawn(Self::worker(
                self.client.clone(),
                Arc::clone(&prepared),
                deadline,
                pace,
                stop.clone(),
            )));
        }

        let mut metrics = LoadMetrics::new();
        while let Some(joined) = workers.next().await {
            match joined {
                Ok(worker_metrics) => metrics.merge(&worker_metrics),
                Err(e) => warn!(error = %e, "load worker failed"),
            }
        }
        watcher.abort();

        if let Some(err) = self.stopped() {
            return Err(err);
        }

        let summary = metrics.summarize(started.elapsed());
        let mut result = ToolResult::new(NAME, &options.method, &options.url);
        result.average_latency_ms = summary.mean_ms;
        result.requests_per_second = Some(summary.requests_per_second);
        result.errors = Some(summary.errors);
        result.raw = serde_json::to_value(&summary)
            .map_err(|e| ExpfError::Task(format!("serializing load summary: {}", e)))?;
        Ok(result)
    }

    fn close(&self) -> Result<()> {
        self.stop.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_ok() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        let reply = "HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok";
                        if socket.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_drives_load_against_server() {
        let url = serve_ok().await;
        let options = ToolOptions {
            duration: 1,
            connections: 2,
            url,
            ..Default::default()
        };
        let generator = InProcess::new(options, CancelSignal::new()).unwrap();

        let result = generator.start(&RequestOverrides::default()).await.unwrap();
        assert_eq!(result.tool, NAME);
        assert!(result.requests_per_second.unwrap() > 0.0);
        assert!(result.average_latency_ms.is_some());
        assert_eq!(result.errors, Some(0));
        assert!(result.raw["statusCodes"]["200"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_start_after_close_is_cancelled() {
        let generator = InProcess::new(ToolOptions::default(), CancelSignal::new()).unwrap();
        generator.close().unwrap();
        let err = generator.start(&RequestOverrides::default()).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
