use crate::services::admin::db::{AnswerEntry, LogEntry};
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

/// Sends access logs and answers to the admin service. Delivery is best effort:
/// failures are logged and never reach the reader.
#[derive(Clone)]
pub struct LogClient {
    client: reqwest::Client,
    base_url: String,
    session_id: String,
}

impl LogClient {
    pub fn new(base_url: &str, session_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// A new reading session keeps the service but reports under a fresh id.
    pub fn set_session_id(&mut self, session_id: impl Into<String>) {
        self.session_id = session_id.into();
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> bool {
        let url = format!("{}{}", self.base_url, path);
        match self.client.post(&url).json(body).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!("Log service rejected {}: HTTP {}", path, resp.status());
                false
            }
            Err(e) => {
                warn!("Log service unreachable ({}): {}", url, e);
                false
            }
        }
    }

    pub async fn log(&self, kind: &str, story_id: Option<&str>, page_index: Option<usize>, data: Option<Value>) -> bool {
        debug!("log {} {:?} {:?}", kind, story_id, page_index);
        let entry = LogEntry {
            session_id: Some(self.session_id.clone()),
            kind: kind.to_string(),
            story_id: story_id.map(str::to_string),
            page_index: page_index.map(|i| i as i64),
            data,
        };
        self.post("/api/logs", &entry).await
    }

    pub async fn session_start(&self) -> bool {
        self.log("session_start", None, None, None).await
    }

    pub async fn page_view(&self, story_id: &str, page_index: usize) -> bool {
        self.log("page_view", Some(story_id), Some(page_index), None).await
    }

    pub async fn story_complete(&self, story_id: &str) -> bool {
        self.log("story_complete", Some(story_id), None, None).await
    }

    pub async fn answer(&self, story_id: &str, question_index: usize, answer: &str) -> bool {
        let entry = AnswerEntry {
            session_id: self.session_id.clone(),
            story_id: story_id.to_string(),
            question_index: Some(question_index as i64),
            answer: Some(answer.to_string()),
        };
        self.post("/api/answers", &entry).await
    }
}
