//! Query answering.
//!
//! ```text
//! query ─► session lock ─► history ─► chain (condense, retrieve, answer)
//!                                         │
//!          ┌──────── no sources ──────────┤
//!          ▼                              ▼
//!     fallback answer           BM25 rerank ─► classify ─► sources ─► follow-ups
//!          │                                                              │
//!          └──────────────────► persist turn ◄────────────────────────────┘
//!                                   │
//!                              query log ─► response
//! ```
//!
//! The session lock is held from the history read until the turn is
//! persisted, so concurrent queries on one session are serialized.

use anyhow::{Context, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chain::ConversationChain;
use crate::config::Config;
use crate::index::VectorIndex;
use crate::llm::{ChatMessage, ChatModel, TokenUsage};
use crate::logging::QUERY_LOG_TARGET;
use crate::models::{ChatTurn, Chunk, RankedChunk};
use crate::rerank::rerank;
use crate::session::{SessionLocks, SessionStore};

pub const FALLBACK_ANSWER: &str = "I'm sorry, but I couldn't find any relevant information in my knowledge base to answer your question. Could you please rephrase your question or ask about a different topic?";

/// Queries that never get source links.
const SMALL_TALK: [&str; 5] = ["hi", "hello", "hey", "thank you", "sorry"];

const FOLLOW_UP_PROMPT: &str = "Suggest three follow-up questions the user might ask next, \
based on the question and answer below. Write each question on its own line.";

/// Characters left unescaped in static links: unreserved plus `/`.
const STATIC_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub llm_name: Option<String>,
    #[serde(default)]
    pub collection_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub cost: f64,
    pub ranked_chunks: Vec<RankedChunk>,
    pub follow_up_questions: Vec<String>,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    /// The model could not answer.
    Unknown,
    /// Small talk or a one-word query.
    OutOfContext,
    Normal,
}

pub fn classify(query: &str, answer: &str) -> AnswerKind {
    let answer_lower = answer.to_lowercase();
    if answer.trim().is_empty()
        || answer_lower.contains("i don't know")
        || answer_lower.contains("sorry")
    {
        return AnswerKind::Unknown;
    }

    let query_lower = query.trim().to_lowercase();
    if SMALL_TALK.contains(&query_lower.as_str()) || query_lower.split_whitespace().count() <= 1 {
        return AnswerKind::OutOfContext;
    }

    AnswerKind::Normal
}

/// Link paths of `chunks`' sources, deduplicated in first-seen order.
///
/// Sources under `data_dir` keep their path relative to it. Anything else,
/// such as a directory loaded through bulk ingestion, is reduced to its file
/// name so server paths never reach the client.
pub fn source_files(chunks: &[Chunk], data_dir: &str) -> Vec<String> {
    let prefix = data_dir.replace('\\', "/");
    let prefix = prefix.trim_end_matches('/');

    let mut files: Vec<String> = Vec::new();
    for chunk in chunks {
        let normalized = chunk.source.replace('\\', "/");
        let relative = match normalized.strip_prefix(prefix) {
            Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/').to_string(),
            _ => file_name(&normalized).to_string(),
        };
        if !relative.is_empty() && !files.contains(&relative) {
            files.push(relative);
        }
    }
    files
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Append a `### Sources:` section with one static link per file, labelled
/// with the file name.
pub fn format_sources(answer: &str, files: &[String], public_base_url: &str) -> String {
    if files.is_empty() {
        return answer.to_string();
    }
    let base = public_base_url.trim_end_matches('/');
    let links: Vec<String> = files
        .iter()
        .enumerate()
        .map(|(i, path)| {
            format!(
                "- <a href=\"{}/static/{}\" target=\"_blank\">Source {}: {}</a>",
                base,
                utf8_percent_encode(path, STATIC_PATH),
                i + 1,
                file_name(path)
            )
        })
        .collect();
    format!("{}\n\n### Sources:\n{}", answer, links.join("\n"))
}

/// One question per non-blank line, list markers removed.
pub fn parse_follow_ups(text: &str) -> Vec<String> {
    text.lines()
        .map(strip_list_marker)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    let line = line.trim_start_matches(['-', '*', '•']).trim_start();
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(stripped) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return stripped.trim();
        }
    }
    line
}

pub struct QueryPipeline {
    sessions: Arc<dyn SessionStore>,
    locks: SessionLocks,
    index: Arc<dyn VectorIndex>,
    llm: Arc<dyn ChatModel>,
    config: Config,
}

impl QueryPipeline {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        index: Arc<dyn VectorIndex>,
        llm: Arc<dyn ChatModel>,
        config: Config,
    ) -> Self {
        Self {
            sessions,
            locks: SessionLocks::new(),
            index,
            llm,
            config,
        }
    }

    pub async fn answer(&self, request: QueryRequest) -> Result<QueryResponse> {
        let query = request.text.trim();
        if query.is_empty() {
            anyhow::bail!("query text must not be empty");
        }

        let session_id = request
            .session_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let model = request
            .llm_name
            .as_deref()
            .unwrap_or(&self.config.llm.default_model);
        let collection = request
            .collection_name
            .as_deref()
            .unwrap_or(&self.config.retrieval.default_collection);

        let guard = self.locks.acquire(&session_id).await;

        let history = self
            .sessions
            .history(&session_id)
            .await
            .context("Failed to load session history")?;
        debug!(session_id = %session_id, turns = history.len(), "loaded session");

        let chain = ConversationChain {
            llm: self.llm.as_ref(),
            index: self.index.as_ref(),
            model,
            top_k: self.config.retrieval.top_k,
        };
        let output = chain.run(query, &history, collection).await?;
        let mut usage = output.usage;

        let (answer, ranked_chunks, follow_up_questions, sources) = if output.source_chunks.is_empty()
        {
            (FALLBACK_ANSWER.to_string(), Vec::new(), Vec::new(), Vec::new())
        } else {
            let texts: Vec<&str> = output.source_chunks.iter().map(|c| c.text.as_str()).collect();
            let ranked = rerank(query, &texts);

            let data_dir = self.config.storage.data_dir.to_string_lossy();
            let sources = source_files(&output.source_chunks, &data_dir);
            let answer = match classify(query, &output.answer) {
                AnswerKind::Normal => format_sources(
                    &output.answer,
                    &sources,
                    &self.config.storage.public_base_url,
                ),
                _ => output.answer.clone(),
            };

            let follow_ups = self
                .follow_up_questions(model, query, &output.answer, &mut usage)
                .await;
            (answer, ranked, follow_ups, sources)
        };

        self.sessions
            .append(
                &session_id,
                &ChatTurn {
                    query: query.to_string(),
                    response: answer.clone(),
                },
            )
            .await
            .context("Failed to persist chat turn")?;
        drop(guard);

        let cost = usage.cost(&self.config.llm);
        log_query(&session_id, query, &answer, &ranked_chunks, &sources);

        Ok(QueryResponse {
            answer,
            cost,
            ranked_chunks,
            follow_up_questions,
            session_id,
        })
    }

    async fn follow_up_questions(
        &self,
        model: &str,
        query: &str,
        answer: &str,
        usage: &mut TokenUsage,
    ) -> Vec<String> {
        let messages = vec![
            ChatMessage::system(FOLLOW_UP_PROMPT),
            ChatMessage::user(format!("Question: {}\nAnswer: {}", query, answer)),
        ];
        match self.llm.complete(model, &messages).await {
            Ok(completion) => {
                *usage += completion.usage;
                parse_follow_ups(&completion.text)
            }
            Err(e) => {
                warn!(error = %e, "follow-up generation failed");
                Vec::new()
            }
        }
    }
}

fn log_query(
    session_id: &str,
    query: &str,
    response: &str,
    ranked_chunks: &[RankedChunk],
    sources: &[String],
) {
    let texts: Vec<&str> = ranked_chunks.iter().map(|c| c.text.as_str()).collect();
    let scores: Vec<f64> = ranked_chunks.iter().map(|c| c.bm25_score).collect();
    tracing::info!(
        target: QUERY_LOG_TARGET,
        session_id,
        query,
        response,
        ranked_chunks = %serde_json::to_string(&texts).unwrap_or_default(),
        bm25_scores = %serde_json::to_string(&scores).unwrap_or_default(),
        sources = %serde_json::to_string(sources).unwrap_or_default(),
        "query answered"
    );
}
