use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{ResultSink, TestCase};
use crate::error::SinkError;
use crate::runs::CaseRun;

/// [`ResultSink`] that talks to the platform REST API.
#[derive(Debug, Clone)]
pub struct HttpResultSink {
    client: Client,
    base_path: String,
    api_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CaseSubmission<'a> {
    id: &'a str,
    test_runs: [&'a CaseRun; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultSubmission<'a> {
    pipeline_id: &'a str,
    test_runs: &'a [CaseRun],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedResult {
    result_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestCaseList {
    test_cases: Vec<TestCase>,
}

impl HttpResultSink {
    pub fn new(base_path: impl Into<String>, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("evallink/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_path: base_path.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_path, path)
    }

    /// Pipeline slugs are user input, so they go in as one escaped segment.
    fn test_cases_url(&self, pipeline: &str) -> Result<Url, SinkError> {
        let base = self.url("/v1/pipelines");
        let invalid = |reason: String| SinkError::InvalidUrl {
            url: base.clone(),
            reason,
        };
        let mut url = Url::parse(&base).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("base path cannot have path segments".to_string()))?
            .push(pipeline)
            .push("test-cases");
        Ok(url)
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response, SinkError> {
        let url = self.url(path);
        debug!(%url, "POST");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|source| SinkError::Transport {
                url: url.clone(),
                source,
            })?;
        check_status(url, response).await
    }
}

async fn check_status(url: String, response: Response) -> Result<Response, SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SinkError::Status {
        url,
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ResultSink for HttpResultSink {
    async fn submit_case(&self, test_job_id: &str, run: CaseRun) -> Result<(), SinkError> {
        let body = CaseSubmission {
            id: test_job_id,
            test_runs: [&run],
        };
        self.post("/v1/test-result/test-runs", &body).await?;
        Ok(())
    }

    async fn finish_job(&self, test_job_id: &str) -> Result<(), SinkError> {
        self.post(
            "/v1/test-result/status",
            &json!({ "id": test_job_id, "finished": true }),
        )
        .await?;
        Ok(())
    }

    async fn create_result(&self, pipeline_id: &str, runs: Vec<CaseRun>) -> Result<String, SinkError> {
        let body = ResultSubmission {
            pipeline_id,
            test_runs: &runs,
        };
        let url = self.url("/v1/test-result");
        let response = self.post("/v1/test-result", &body).await?;
        let created: CreatedResult = response
            .json()
            .await
            .map_err(|source| SinkError::Transport { url, source })?;
        Ok(created.result_id)
    }

    async fn list_test_cases(&self, pipeline: &str) -> Result<Vec<TestCase>, SinkError> {
        let request_url = self.test_cases_url(pipeline)?;
        let url = request_url.to_string();
        debug!(%url, "GET");
        let response = self
            .client
            .get(request_url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|source| SinkError::Transport {
                url: url.clone(),
                source,
            })?;
        let response = check_status(url.clone(), response).await?;
        let list: TestCaseList = response
            .json()
            .await
            .map_err(|source| SinkError::Transport { url, source })?;
        Ok(list.test_cases)
    }
}
