//! Test doubles shared by unit tests.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::Config;
use crate::embedding::Embedder;
use crate::llm::{ChatMessage, ChatModel, Completion, TokenUsage};

const BAG_DIMS: usize = 256;

/// A migrated database in a fresh temp dir. Keep the `TempDir` alive.
pub async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
    let tmp = tempfile::TempDir::new().unwrap();
    let cfg = Config::with_root(tmp.path());
    let pool = crate::db::connect(&cfg).await.unwrap();
    crate::migrate::run_migrations(&pool).await.unwrap();
    (tmp, pool)
}

/// Hashes lowercase words into a fixed-size count vector, so texts sharing
/// words are similar.
pub struct BagOfWordsEmbedder {
    name: String,
}

impl BagOfWordsEmbedder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

fn bucket(word: &str) -> usize {
    // FNV-1a
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % BAG_DIMS as u64) as usize
}

#[async_trait]
impl Embedder for BagOfWordsEmbedder {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        "bag-of-words"
    }
    fn dims(&self) -> usize {
        BAG_DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; BAG_DIMS];
                for word in text
                    .to_lowercase()
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                {
                    v[bucket(word)] += 1.0;
                }
                v
            })
            .collect())
    }
}

type Script = Box<dyn Fn(&[ChatMessage]) -> Result<String> + Send + Sync>;

/// A chat model whose replies come from a closure over the prompt.
pub struct ScriptedChat {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedChat {
    pub fn new(script: impl Fn(&[ChatMessage]) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Usage reported for every scripted call.
pub const CALL_USAGE: TokenUsage = TokenUsage {
    prompt_tokens: 100,
    completion_tokens: 20,
};

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn complete(&self, _model: &str, messages: &[ChatMessage]) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = (self.script)(messages)?;
        Ok(Completion {
            text,
            usage: CALL_USAGE,
        })
    }
}
