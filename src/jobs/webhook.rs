use super::report::JobReport;
use anyhow::{Context, Result};
use reqwest::StatusCode;
use std::time::Duration;

/// Posts job reports as JSON with HTTP basic auth.
pub struct WebhookClient {
    url: String,
    username: String,
    password: String,
    http: reqwest::blocking::Client,
}

impl WebhookClient {
    pub fn new(
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build webhook HTTP client")?;

        Ok(Self {
            url: url.into(),
            username: username.into(),
            password: password.into(),
            http,
        })
    }

    /// Anything but `200 OK` is an error.
    pub fn send(&self, report: &JobReport) -> Result<()> {
        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .json(report)
            .send()
            .with_context(|| format!("Failed to send webhook request to {}", self.url))?;

        let status = response.status();
        if status != StatusCode::OK {
            anyhow::bail!("Webhook request failed with status code: {}", status.as_u16());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn report() -> JobReport {
        JobReport {
            src_num: "2507632912".to_string(),
            src_cid: "2507632912".to_string(),
            dest_num: "12505652556".to_string(),
            dest_cid: "12505652556".to_string(),
            total_pages: 1,
            total_dials: 8,
            total_tries: 0,
            job_id: 1177,
            status: "The call dropped prematurely".to_string(),
            why: "killed".to_string(),
            preview_pdf: None,
        }
    }

    #[test]
    fn test_send_posts_json_with_basic_auth() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/hooks/fax")
            .match_header("content-type", "application/json")
            .match_header("authorization", "Basic dXNlcjpwYXNz")
            .match_body(Matcher::Json(serde_json::to_value(report()).unwrap()))
            .with_status(200)
            .create();

        let client = WebhookClient::new(format!("{}/hooks/fax", server.url()), "user", "pass").unwrap();
        client.send(&report()).unwrap();
        mock.assert();
    }

    #[test]
    fn test_non_200_is_an_error() {
        let mut server = mockito::Server::new();
        let _mock = server.mock("POST", "/hook").with_status(202).create();

        let client = WebhookClient::new(format!("{}/hook", server.url()), "user", "pass").unwrap();
        let err = client.send(&report()).unwrap_err();
        assert!(err.to_string().contains("202"));
    }
}
