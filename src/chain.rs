//! Conversational retrieval: condense, retrieve, answer.
//!
//! With prior turns the question is first rewritten into a standalone one,
//! which then drives retrieval. The answer prompt sees the retrieved context
//! plus the conversation so far.

use anyhow::{Context, Result};
use tracing::debug;

use crate::index::VectorIndex;
use crate::llm::{ChatMessage, ChatModel, TokenUsage};
use crate::models::{ChatTurn, Chunk};

const CONDENSE_PROMPT: &str = "Given the following conversation and a follow up question, \
rephrase the follow up question to be a standalone question, in its original language. \
Reply with the standalone question only.";

const ANSWER_PROMPT: &str = "Use the following pieces of context to answer the user's question. \
If you don't know the answer, just say that you don't know, don't try to make up an answer.";

pub struct ChainOutput {
    pub answer: String,
    /// Chunks the answer was grounded on, most similar first.
    pub source_chunks: Vec<Chunk>,
    /// Summed over every model call the chain made.
    pub usage: TokenUsage,
}

pub struct ConversationChain<'a> {
    pub llm: &'a dyn ChatModel,
    pub index: &'a dyn VectorIndex,
    pub model: &'a str,
    pub top_k: usize,
}

impl ConversationChain<'_> {
    pub async fn run(
        &self,
        question: &str,
        history: &[ChatTurn],
        collection: &str,
    ) -> Result<ChainOutput> {
        let mut usage = TokenUsage::default();

        let standalone = if history.is_empty() {
            question.to_string()
        } else {
            let messages = vec![
                ChatMessage::system(CONDENSE_PROMPT),
                ChatMessage::user(format!(
                    "Chat History:\n{}\nFollow Up Input: {}\nStandalone question:",
                    format_history(history),
                    question
                )),
            ];
            let completion = self
                .llm
                .complete(self.model, &messages)
                .await
                .context("Failed to condense question")?;
            usage += completion.usage;
            let condensed = completion.text.trim().to_string();
            if condensed.is_empty() {
                question.to_string()
            } else {
                condensed
            }
        };
        debug!(question, standalone = %standalone, "retrieving");

        let source_chunks = self
            .index
            .retrieve(&standalone, collection, self.top_k)
            .await
            .with_context(|| format!("Retrieval failed for collection '{}'", collection))?;

        if source_chunks.is_empty() {
            return Ok(ChainOutput {
                answer: String::new(),
                source_chunks,
                usage,
            });
        }

        let context = source_chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut messages = vec![ChatMessage::system(format!(
            "{}\n----------------\n{}",
            ANSWER_PROMPT, context
        ))];
        for turn in history {
            messages.push(ChatMessage::user(turn.query.clone()));
            messages.push(ChatMessage::assistant(turn.response.clone()));
        }
        messages.push(ChatMessage::user(standalone));

        let completion = self
            .llm
            .complete(self.model, &messages)
            .await
            .context("Failed to generate answer")?;
        usage += completion.usage;

        Ok(ChainOutput {
            answer: completion.text.trim().to_string(),
            source_chunks,
            usage,
        })
    }
}

fn format_history(history: &[ChatTurn]) -> String {
    history
        .iter()
        .map(|t| format!("Human: {}\nAssistant: {}", t.query, t.response))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbedderRegistry;
    use crate::index::SqliteVectorIndex;
    use crate::llm::Role;
    use crate::testing::{test_pool, BagOfWordsEmbedder, ScriptedChat, CALL_USAGE};
    use std::sync::Arc;

    async fn seeded_index(pool: sqlx::SqlitePool) -> SqliteVectorIndex {
        let registry = EmbedderRegistry::fixed(vec![Arc::new(BagOfWordsEmbedder::new("openai"))]);
        let index = SqliteVectorIndex::new(pool, Arc::new(registry), 64);
        let chunks = crate::chunk::chunk_text(
            "files/tides.txt",
            "High tide in the bay arrives at noon.",
            250,
            0,
        );
        index.index(&chunks, "betaCollection", "openai").await.unwrap();
        index
    }

    #[tokio::test]
    async fn test_no_history_skips_condense() {
        let (_tmp, pool) = test_pool().await;
        let index = seeded_index(pool).await;
        let llm = ScriptedChat::new(|_| Ok("At noon.".to_string()));

        let chain = ConversationChain {
            llm: &llm,
            index: &index,
            model: "gpt-3.5-turbo",
            top_k: 4,
        };
        let out = chain.run("When is high tide in the bay?", &[], "betaCollection").await.unwrap();

        assert_eq!(out.answer, "At noon.");
        assert_eq!(out.source_chunks.len(), 1);
        assert_eq!(llm.calls(), 1);
        assert_eq!(out.usage, CALL_USAGE);
    }

    #[tokio::test]
    async fn test_history_condenses_before_retrieval() {
        let (_tmp, pool) = test_pool().await;
        let index = seeded_index(pool).await;
        let llm = ScriptedChat::new(|messages| {
            if messages[0].content.starts_with("Given the following conversation") {
                Ok("When is high tide in the bay?".to_string())
            } else {
                assert_eq!(messages.last().unwrap().role, Role::User);
                Ok("At noon.".to_string())
            }
        });

        let history = vec![ChatTurn {
            query: "Tell me about the bay".to_string(),
            response: "It has tides.".to_string(),
        }];
        let chain = ConversationChain {
            llm: &llm,
            index: &index,
            model: "gpt-3.5-turbo",
            top_k: 4,
        };
        let out = chain.run("and when is it high?", &history, "betaCollection").await.unwrap();

        assert_eq!(llm.calls(), 2);
        assert_eq!(out.usage.prompt_tokens, 2 * CALL_USAGE.prompt_tokens);
        assert_eq!(out.answer, "At noon.");
    }

    #[tokio::test]
    async fn test_empty_collection_returns_no_sources() {
        let (_tmp, pool) = test_pool().await;
        let index = seeded_index(pool).await;
        let llm = ScriptedChat::new(|_| Ok("unused".to_string()));

        let chain = ConversationChain {
            llm: &llm,
            index: &index,
            model: "gpt-3.5-turbo",
            top_k: 4,
        };
        let out = chain.run("anything", &[], "emptyCollection").await.unwrap();
        assert!(out.source_chunks.is_empty());
        assert_eq!(llm.calls(), 0);
    }
}
