//! The AI reviewer.
//!
//! [`ReviewEngine`] is the seam: the processor hands it filtered per-file
//! diffs and gets back one score and one piece of review text. The OpenAI
//! implementation reviews large diffs in chunks and aggregates them.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use revhook_core::{chunk_files, DiffChunk, FileDiff, ReviewJob};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::config::OpenAiSettings;

/// Everything the engine sees for one job.
#[derive(Debug, Clone, Copy)]
pub struct ReviewRequest<'a> {
    pub job: &'a ReviewJob,
    pub files: &'a [FileDiff],
    /// `(path, content)` of changed files after the change.
    pub file_context: &'a [(String, String)],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    /// 0 to 100.
    pub score: f64,
    pub content: String,
}

#[async_trait]
pub trait ReviewEngine: Send + Sync {
    async fn review(&self, request: ReviewRequest<'_>) -> Result<ReviewOutcome>;
}

/// Structured reply requested from the model for one chunk.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChunkReview {
    pub score: f64,
    pub summary: String,
    pub comments: String,
}

/// Combine per-chunk reviews into one outcome.
///
/// The score is the mean weighted by each chunk's changed lines, rounded;
/// a chunk with no counted lines weighs 1.
pub fn aggregate(reviews: &[(DiffChunk, ChunkReview)]) -> Option<ReviewOutcome> {
    match reviews {
        [] => None,
        [(_, only)] => Some(ReviewOutcome {
            score: only.score.clamp(0.0, 100.0).round(),
            content: render(only),
        }),
        many => {
            let (weighted, weight) = many.iter().fold((0.0, 0.0), |(sum, total), (chunk, review)| {
                let w = f64::from(chunk.changed_lines.max(1));
                (sum + review.score.clamp(0.0, 100.0) * w, total + w)
            });
            let content = many
                .iter()
                .enumerate()
                .map(|(i, (_, review))| {
                    format!("## Part {} of {}\n\n{}", i + 1, many.len(), render(review))
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            Some(ReviewOutcome {
                score: (weighted / weight).round(),
                content,
            })
        }
    }
}

fn render(review: &ChunkReview) -> String {
    let comments = review.comments.trim();
    if comments.is_empty() {
        review.summary.trim().to_string()
    } else {
        format!("{}\n\n{}", review.summary.trim(), comments)
    }
}

/// Prompt body for one chunk.
pub fn create_user_prompt(
    job: &ReviewJob,
    diff: &str,
    file_context: &[(String, String)],
) -> String {
    let mut prompt = format!(
        "Branch: {}\nCommit: {}\n\nCOMMIT MESSAGES:\n{}\n\nDIFF BEGINS:\n",
        job.branch, job.commit_hash, job.commit_message
    );
    prompt.push_str(diff);
    prompt.push_str("\nDIFF ENDS\n");

    if !file_context.is_empty() {
        prompt.push_str("\nFILE CONTENTS AFTER THE CHANGE:\n");
        for (path, content) in file_context {
            prompt.push_str(&format!("\n === {} ===\n\n{}\n", path, content));
        }
    }
    prompt
}

fn system_prompt() -> &'static str {
    include_str!("../prompt.txt")
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

pub struct OpenAiEngine {
    client: Client,
    settings: OpenAiSettings,
    chunk_chars: usize,
}

impl OpenAiEngine {
    pub fn new(client: Client, settings: OpenAiSettings, chunk_chars: usize) -> Self {
        Self {
            client,
            settings,
            chunk_chars,
        }
    }

    fn response_format() -> serde_json::Value {
        json!({
            "type": "json_schema",
            "json_schema": {
                "name": "code_review",
                "strict": true,
                "schema": {
                    "type": "object",
                    "properties": {
                        "score": {"type": "integer"},
                        "summary": {"type": "string"},
                        "comments": {"type": "string"}
                    },
                    "required": ["score", "summary", "comments"],
                    "additionalProperties": false
                }
            }
        })
    }

    async fn review_chunk(&self, prompt: &str) -> Result<ChunkReview> {
        let url = format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'));
        let messages = [
            ChatMessage {
                role: "system",
                content: system_prompt(),
            },
            ChatMessage {
                role: "user",
                content: prompt,
            },
        ];
        let body = json!({
            "model": self.settings.model,
            "messages": messages,
            "response_format": Self::response_format(),
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send review request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!("OpenAI API error: {} - {}", status, error_text));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat completion")?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("OpenAI response contained no message"))?;
        serde_json::from_str(&content).context("Model reply did not match the review schema")
    }
}

#[async_trait]
impl ReviewEngine for OpenAiEngine {
    async fn review(&self, request: ReviewRequest<'_>) -> Result<ReviewOutcome> {
        let chunks = chunk_files(request.files, self.chunk_chars);
        info!(
            job_id = %request.job.id,
            files = request.files.len(),
            chunks = chunks.len(),
            "Reviewing diff"
        );

        // File context rides along with the first chunk only.
        let mut reviews = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            let context = if i == 0 { request.file_context } else { &[] };
            let prompt = create_user_prompt(request.job, &chunk.text, context);
            let review = self
                .review_chunk(&prompt)
                .await
                .with_context(|| format!("Review of chunk {} failed", i + 1))?;
            debug!(job_id = %request.job.id, chunk = i + 1, score = review.score, "Chunk reviewed");
            reviews.push((chunk, review));
        }

        aggregate(&reviews).ok_or_else(|| anyhow!("Nothing to review"))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Engine returning a fixed score, or an error when `fail` is set.
    pub struct StaticEngine {
        pub score: f64,
        pub fail: Mutex<Option<String>>,
        pub calls: Mutex<Vec<Vec<String>>>,
    }

    impl StaticEngine {
        pub fn new(score: f64) -> Self {
            Self {
                score,
                fail: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ReviewEngine for StaticEngine {
        async fn review(&self, request: ReviewRequest<'_>) -> Result<ReviewOutcome> {
            self.calls
                .lock()
                .unwrap()
                .push(request.files.iter().map(|f| f.path.clone()).collect());
            if let Some(message) = self.fail.lock().unwrap().clone() {
                return Err(anyhow!(message));
            }
            Ok(ReviewOutcome {
                score: self.score,
                content: "Looks reasonable.".to_string(),
            })
        }
    }
}
