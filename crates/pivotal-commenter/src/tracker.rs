//! Pivotal Tracker v5 REST client.
//!
//! The commenter loop only ever talks to the [`StoryTracker`] trait;
//! [`PivotalClient`] implements it for the real service and tests provide
//! mock implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_API_BASE_URL: &str = "https://www.pivotaltracker.com/services/v5";

/// Stories requested per page when listing.
const PAGE_SIZE: usize = 100;

const TOKEN_HEADER: &str = "x-trackertoken";
const PAGINATION_TOTAL: &str = "x-tracker-pagination-total";

/// Errors from tracker API calls.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("tracker returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("failed to decode response: {0}")]
    Decode(#[source] reqwest::Error),
}

/// A story as returned by `GET /projects/{id}/stories`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Story {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub current_state: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Story {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            current_state: None,
            url: None,
            updated_at: None,
        }
    }
}

/// A comment on a story. Attachment-only comments have no text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Comment {
    pub id: u64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub person_id: Option<u64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Comment {
    pub fn new(id: u64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            person_id: None,
            created_at: None,
        }
    }
}

#[derive(Serialize)]
struct NewComment<'a> {
    text: &'a str,
}

/// The three tracker operations the commenter depends on.
#[async_trait]
pub trait StoryTracker: Send + Sync {
    /// List stories in `project_id` matching a search `filter`
    /// such as `updated:-1h`.
    async fn list_updated_stories(
        &self,
        project_id: u64,
        filter: &str,
    ) -> Result<Vec<Story>, TrackerError>;

    /// List every comment on a story, oldest first.
    async fn list_comments(
        &self,
        project_id: u64,
        story_id: u64,
    ) -> Result<Vec<Comment>, TrackerError>;

    /// Append a new comment to a story.
    async fn add_comment(
        &self,
        project_id: u64,
        story_id: u64,
        text: &str,
    ) -> Result<Comment, TrackerError>;
}

/// [`StoryTracker`] backed by the Pivotal Tracker REST API.
pub struct PivotalClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl PivotalClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(base_url, token, reqwest::Client::new())
    }

    /// Use a preconfigured HTTP client (proxy, TLS or timeout settings).
    pub fn with_client(
        base_url: impl Into<String>,
        token: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        }
    }

    fn stories_url(&self, project_id: u64) -> String {
        format!("{}/projects/{project_id}/stories", self.base_url)
    }

    fn comments_url(&self, project_id: u64, story_id: u64) -> String {
        format!(
            "{}/projects/{project_id}/stories/{story_id}/comments",
            self.base_url
        )
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, TrackerError> {
        let response = request
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(TrackerError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TrackerError::Status { status, body });
        }

        Ok(response)
    }
}

#[async_trait]
impl StoryTracker for PivotalClient {
    async fn list_updated_stories(
        &self,
        project_id: u64,
        filter: &str,
    ) -> Result<Vec<Story>, TrackerError> {
        let url = self.stories_url(project_id);
        let mut stories = Vec::new();

        loop {
            let offset = stories.len();
            let request = self.client.get(&url).query(&[
                ("filter", filter.to_string()),
                ("limit", PAGE_SIZE.to_string()),
                ("offset", offset.to_string()),
            ]);
            let response = self.send(request).await?;
            let page = Page::from_headers(response.headers());
            let batch: Vec<Story> = response.json().await.map_err(TrackerError::Decode)?;

            let returned = batch.len();
            debug!(
                project_id,
                offset,
                returned,
                total = ?page.total,
                "Fetched story page"
            );

            stories.extend(batch);

            // An empty page ends the walk even if the total says otherwise.
            if returned == 0 || !page.has_more(stories.len()) {
                break;
            }
        }

        Ok(stories)
    }

    async fn list_comments(
        &self,
        project_id: u64,
        story_id: u64,
    ) -> Result<Vec<Comment>, TrackerError> {
        let request = self.client.get(self.comments_url(project_id, story_id));
        let response = self.send(request).await?;
        response.json().await.map_err(TrackerError::Decode)
    }

    async fn add_comment(
        &self,
        project_id: u64,
        story_id: u64,
        text: &str,
    ) -> Result<Comment, TrackerError> {
        let request = self
            .client
            .post(self.comments_url(project_id, story_id))
            .json(&NewComment { text });
        let response = self.send(request).await?;
        response.json().await.map_err(TrackerError::Decode)
    }
}

/// Pagination header from a list response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Page {
    total: Option<usize>,
}

impl Page {
    fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            total: headers
                .get(PAGINATION_TOTAL)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<usize>().ok()),
        }
    }

    /// Whether another page should be requested after `fetched` stories.
    ///
    /// Without a total header the response is taken as complete.
    fn has_more(&self, fetched: usize) -> bool {
        self.total.is_some_and(|total| fetched < total)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Recording tracker for unit tests.
    ///
    /// Comment lookups for stories without a configured thread return an
    /// empty list. Failures are injected per operation.
    #[derive(Default)]
    pub struct MockTracker {
        pub stories: Vec<Story>,
        pub threads: HashMap<u64, Vec<Comment>>,
        pub fail_list_stories: bool,
        pub fail_comments_for: Vec<u64>,
        pub fail_add_for: Vec<u64>,
        pub captured_filters: Mutex<Vec<String>>,
        pub captured_comment_lookups: Mutex<Vec<u64>>,
        pub captured_posts: Mutex<Vec<(u64, u64, String)>>,
    }

    impl MockTracker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_story(mut self, story: Story, comments: &[&str]) -> Self {
            let thread = comments
                .iter()
                .enumerate()
                .map(|(i, text)| Comment::new(story.id * 100 + i as u64, *text))
                .collect();
            self.threads.insert(story.id, thread);
            self.stories.push(story);
            self
        }

        fn status_error() -> TrackerError {
            TrackerError::Status {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                body: "mock failure".into(),
            }
        }
    }

    #[async_trait]
    impl StoryTracker for MockTracker {
        async fn list_updated_stories(
            &self,
            _project_id: u64,
            filter: &str,
        ) -> Result<Vec<Story>, TrackerError> {
            self.captured_filters
                .lock()
                .unwrap()
                .push(filter.to_string());
            if self.fail_list_stories {
                return Err(Self::status_error());
            }
            Ok(self.stories.clone())
        }

        async fn list_comments(
            &self,
            _project_id: u64,
            story_id: u64,
        ) -> Result<Vec<Comment>, TrackerError> {
            self.captured_comment_lookups.lock().unwrap().push(story_id);
            if self.fail_comments_for.contains(&story_id) {
                return Err(Self::status_error());
            }
            Ok(self.threads.get(&story_id).cloned().unwrap_or_default())
        }

        async fn add_comment(
            &self,
            project_id: u64,
            story_id: u64,
            text: &str,
        ) -> Result<Comment, TrackerError> {
            if self.fail_add_for.contains(&story_id) {
                return Err(Self::status_error());
            }
            let mut posts = self.captured_posts.lock().unwrap();
            posts.push((project_id, story_id, text.to_string()));
            Ok(Comment::new(9_000 + posts.len() as u64, text))
        }
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_story_deserialize() {
        let json = r#"{
            "kind": "story",
            "id": 561,
            "project_id": 99,
            "name": "Update onboarding docs",
            "current_state": "started",
            "url": "https://www.pivotaltracker.com/story/show/561",
            "updated_at": "2024-03-01T12:30:00Z"
        }"#;
        let story: Story = serde_json::from_str(json).unwrap();
        assert_eq!(story.id, 561);
        assert_eq!(story.name, "Update onboarding docs");
        assert_eq!(story.current_state.as_deref(), Some("started"));
        assert!(story.updated_at.is_some());
    }

    #[test]
    fn test_comment_without_text_defaults_to_empty() {
        let json = r#"[
            {"kind": "comment", "id": 1, "story_id": 561, "text": "see foo.old.link"},
            {"kind": "comment", "id": 2, "story_id": 561, "file_attachment_ids": [7]}
        ]"#;
        let comments: Vec<Comment> = serde_json::from_str(json).unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].text, "see foo.old.link");
        assert_eq!(comments[1].text, "");
    }

    #[test]
    fn test_new_comment_body() {
        let body = serde_json::to_value(NewComment { text: "hello" }).unwrap();
        assert_eq!(body, serde_json::json!({ "text": "hello" }));
    }

    #[test]
    fn test_urls_strip_trailing_slash() {
        let client = PivotalClient::new("https://tracker.test/services/v5/", "tok");
        assert_eq!(
            client.stories_url(42),
            "https://tracker.test/services/v5/projects/42/stories"
        );
        assert_eq!(
            client.comments_url(42, 7),
            "https://tracker.test/services/v5/projects/42/stories/7/comments"
        );
    }

    #[test]
    fn test_page_from_headers() {
        let page = Page::from_headers(&headers(&[
            (PAGINATION_TOTAL, "250"),
            ("x-tracker-pagination-returned", "100"),
        ]));
        assert_eq!(page.total, Some(250));
        assert!(page.has_more(100));
        assert!(page.has_more(200));
        assert!(!page.has_more(250));
    }

    #[test]
    fn test_page_without_headers_is_complete() {
        let page = Page::from_headers(&HeaderMap::new());
        assert_eq!(page, Page::default());
        assert!(!page.has_more(100));
    }

    #[test]
    fn test_status_error_display() {
        let err = TrackerError::Status {
            status: reqwest::StatusCode::FORBIDDEN,
            body: "invalid token".into(),
        };
        assert_eq!(err.to_string(), "tracker returned 403 Forbidden: invalid token");
    }
}
