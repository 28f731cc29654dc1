#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use progress_tracker::config::Config;
use progress_tracker::embedding::{Embedder, HashingEmbedder};
use progress_tracker::error::LlmReply;
use progress_tracker::jobs::{JobManager, JobSnapshot};
use progress_tracker::llm::LanguageModel;
use progress_tracker::models::{ContextChunk, Document, EntityKind};
use progress_tracker::pipeline::Services;
use progress_tracker::store::memory::InMemoryStore;

pub const PROJECT: &str = "proj-1";

/// Language model double answering from a closure over the prompt.
pub struct ScriptedLlm {
    script: Box<dyn Fn(&str) -> LlmReply + Send + Sync>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(script: impl Fn(&str) -> LlmReply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, prompt: &str) -> LlmReply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(prompt)
    }
}

pub fn is_completion_prompt(prompt: &str) -> bool {
    prompt.contains("has the following task been completed")
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn doc(id: &str, secs: i64) -> Document {
    Document {
        id: id.to_string(),
        project_id: PROJECT.to_string(),
        created_at: ts(secs),
    }
}

/// Embedded chunks for `text`, tagged with `[doc_id]` so scripts can tell
/// documents apart.
pub fn chunks(doc_id: &str, text: &str) -> Vec<ContextChunk> {
    let embedder = HashingEmbedder::default();
    let tagged = format!("[{}] {}", doc_id, text);
    vec![ContextChunk {
        chunk_index: 0,
        vector: embedder.vectorize(&tagged),
        text: tagged,
    }]
}

pub fn services(store: Arc<InMemoryStore>, llm: Arc<dyn LanguageModel>) -> Services {
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
    Services {
        store: store.clone(),
        documents: store,
        llm,
        embedder,
    }
}

pub fn test_config() -> Config {
    let mut config = Config::minimal();
    config.embedding.provider = "hashing".to_string();
    config
}

/// Poll until the job for `(project, kind)` is terminal.
pub async fn wait_terminal(jobs: &JobManager, project: &str, kind: EntityKind) -> JobSnapshot {
    for _ in 0..400 {
        if let Some(snap) = jobs.poll(project, kind) {
            if snap.status.is_terminal() {
                return snap;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job for {}/{} did not finish within 4 seconds", project, kind);
}

/// The `[doc_id]` tag of the first context chunk in a prompt.
pub fn doc_tag(prompt: &str) -> Option<&str> {
    let marker = "Document context:\n[";
    let start = prompt.find(marker)? + marker.len();
    let end = prompt[start..].find(']')? + start;
    Some(&prompt[start..end])
}
