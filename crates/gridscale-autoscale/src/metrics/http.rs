//! Utilization reported by the service itself over HTTP.
//!
//! Every task must serve `GET /<endpoint>` with a JSON body such as
//! `{"utilization": 0.42}`. Tasks that fail to answer are left out of the
//! average.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use serde::Deserialize;
use tracing::debug;

use super::{ServiceMetricsInput, ServiceMetricsProvider};
use crate::error::{AutoscaleError, AutoscaleResult};

#[derive(Debug, Deserialize)]
struct UtilizationReport {
    utilization: f64,
}

/// Average of per-task utilization read from an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpMetricsProvider {
    timeout: Duration,
}

impl HttpMetricsProvider {
    /// `timeout` bounds each request, connect included.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ServiceMetricsProvider for HttpMetricsProvider {
    async fn utilization(&self, input: &ServiceMetricsInput<'_>) -> AutoscaleResult<f64> {
        let endpoint = input.config.autoscaling.endpoint.trim_start_matches('/');

        let mut readings = Vec::with_capacity(input.tasks.len());
        for task in input.tasks {
            let Some(port) = task.ports.first() else {
                debug!(task = %task.id, "task exposes no port, skipping");
                continue;
            };
            let address = format!("{}:{port}", task.host);
            match fetch_utilization(&address, endpoint, self.timeout).await {
                Ok(utilization) => readings.push(utilization),
                Err(e) => {
                    debug!(task = %task.id, %address, error = %e, "utilization request failed");
                }
            }
        }

        if readings.is_empty() {
            return Err(AutoscaleError::MetricsProviderNoData(format!(
                "Couldn't get any data from http endpoint {endpoint} for {}",
                input.config.target()
            )));
        }
        Ok(readings.iter().sum::<f64>() / readings.len() as f64)
    }
}

/// GET `http://<address>/<endpoint>` and read its `utilization` field.
async fn fetch_utilization(address: &str, endpoint: &str, timeout: Duration) -> anyhow::Result<f64> {
    let uri = format!("http://{address}/{endpoint}");

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(address).await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "gridscale-autoscale/0.1")
            .body(Empty::<Bytes>::new())?;

        let resp = sender.send_request(req).await?;
        if !resp.status().is_success() {
            anyhow::bail!("{uri} returned {}", resp.status());
        }
        let body = resp.into_body().collect().await?.to_bytes();
        let report: UtilizationReport = serde_json::from_slice(&body)?;
        Ok::<_, anyhow::Error>(report.utilization)
    })
    .await;

    match result {
        Ok(reading) => reading,
        Err(_) => anyhow::bail!("{uri} timed out after {}ms", timeout.as_millis()),
    }
}
