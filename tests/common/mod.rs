//! Shared helpers for pipeline integration tests

#![allow(dead_code)]

use std::sync::Arc;
use worldbook::{
    PipelineConfig, PipelineContext, Scheduler, ScriptedClient, StateStore, WorkItem,
};

/// A completion response with one entry.
pub fn entry_json(category: &str, name: &str) -> String {
    format!(
        r#"{{"{}": {{"{}": {{"keywords": ["{}"], "content": "About {}."}}}}}}"#,
        category, name, name, name
    )
}

/// Text tagged with `tag` and long enough to be split.
pub fn splittable(tag: &str) -> String {
    let mut text = format!("{} opens the chapter.\n", tag);
    for i in 0..12 {
        text.push_str(&format!("Paragraph {} continues the story at some length here.\n", i));
    }
    text
}

/// Config with millisecond backoff so retries don't slow tests down.
pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 4;
    config
}

pub fn items(specs: &[(&str, &str)]) -> Vec<WorkItem> {
    specs
        .iter()
        .map(|(title, content)| WorkItem::new(*title, *content))
        .collect()
}

pub struct Harness {
    pub client: Arc<ScriptedClient>,
    pub store: Arc<dyn StateStore>,
    pub scheduler: Scheduler,
}

pub fn harness(client: ScriptedClient, store: Arc<dyn StateStore>, config: PipelineConfig) -> Harness {
    let client = Arc::new(client);
    let scheduler = Scheduler::new(client.clone(), store.clone(), config);
    Harness {
        client,
        store,
        scheduler,
    }
}

pub fn context(items: Vec<WorkItem>, store: &Arc<dyn StateStore>, config: &PipelineConfig) -> PipelineContext {
    PipelineContext::new(items, "test-input", store.clone(), config.history.clone())
}

pub fn titles(ctx: &PipelineContext) -> Vec<String> {
    ctx.items().iter().map(|i| i.title.clone()).collect()
}
