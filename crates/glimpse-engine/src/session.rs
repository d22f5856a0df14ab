use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use glimpse_contracts::analysis::{AnalysisOutcome, LifecycleStatus, DEFAULT_PROMPT};
use glimpse_contracts::events::EventWriter;
use serde::Serialize;
use serde_json::{json, Value};

use crate::lifecycle::LifecycleController;
use crate::preview::PreviewStore;
use crate::selection::{ImageSelection, SelectionHolder};

/// Everything a front end needs to render one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub status: LifecycleStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub prompt: String,
    pub preview_url: Option<String>,
    pub media_type: Option<String>,
    pub preview_dimensions: Option<(u32, u32)>,
    pub model: String,
    pub can_submit: bool,
}

/// One user's image-analysis session: the selection holder wired to the
/// lifecycle controller, plus the prompt text.
pub struct AnalysisSession {
    id: String,
    selection: SelectionHolder,
    controller: LifecycleController,
    prompt: String,
    events: Option<EventWriter>,
}

impl AnalysisSession {
    pub fn new(controller: LifecycleController) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            selection: SelectionHolder::new(),
            controller,
            prompt: DEFAULT_PROMPT.to_string(),
            events: None,
        }
    }

    /// Writes session and lifecycle events to `events_path`.
    pub fn with_events_path(self, events_path: impl AsRef<Path>) -> Self {
        let events = EventWriter::new(events_path.as_ref(), self.id.clone());
        self.with_events(events)
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.controller = self.controller.with_events(events.clone());
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn events(&self) -> Option<&EventWriter> {
        self.events.as_ref()
    }

    pub fn select(&mut self, bytes: impl Into<Arc<[u8]>>, media_type: &str) {
        let selection = self.selection.select(bytes, media_type);
        let payload = selection_payload(selection);
        self.controller.reset();
        self.emit("selection_changed", payload);
    }

    pub fn select_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let selection = self.selection.select_path(path)?;
        let payload = selection_payload(selection);
        self.controller.reset();
        self.emit("selection_changed", payload);
        Ok(())
    }

    pub fn remove(&mut self) {
        let removed = self.selection.remove();
        self.controller.reset();
        if removed {
            self.emit("selection_removed", json!({}));
        }
    }

    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.prompt = prompt.into();
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn submit(&mut self) {
        let snapshot = self.selection.snapshot();
        self.controller.submit(&self.prompt, snapshot);
    }

    pub fn poll(&mut self) -> bool {
        self.controller.poll()
    }

    pub fn wait(&mut self, timeout: Option<Duration>) -> LifecycleStatus {
        self.controller.wait(timeout)
    }

    pub fn status(&self) -> LifecycleStatus {
        self.controller.status()
    }

    pub fn outcome(&self) -> Option<&AnalysisOutcome> {
        self.controller.outcome()
    }

    /// Mirrors the submit button: enabled with an image and nothing pending.
    pub fn can_submit(&self) -> bool {
        self.selection.current().is_some() && self.status() != LifecycleStatus::Pending
    }

    pub fn selection(&self) -> Option<&ImageSelection> {
        self.selection.current()
    }

    pub fn previews(&self) -> &PreviewStore {
        self.selection.previews()
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut LifecycleController {
        &mut self.controller
    }

    pub fn view(&self) -> SessionView {
        let selection = self.selection.current();
        let outcome = self.outcome();
        SessionView {
            status: self.status(),
            result: outcome.and_then(AnalysisOutcome::text).map(str::to_string),
            error: outcome
                .and_then(AnalysisOutcome::failure)
                .map(str::to_string),
            prompt: self.prompt.clone(),
            preview_url: selection.map(|selection| selection.preview().url().to_string()),
            media_type: selection.map(|selection| selection.media_type().to_string()),
            preview_dimensions: selection.and_then(|selection| selection.preview().dimensions()),
            model: self.controller.model().to_string(),
            can_submit: self.can_submit(),
        }
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.emit_json(event_type, payload) {
            tracing::warn!(error = %err, event_type, "event write failed");
        }
    }
}

fn selection_payload(selection: &ImageSelection) -> Value {
    json!({
        "source": selection.source().label(),
        "mime_type": selection.media_type(),
        "preview_id": selection.preview().id(),
        "dimensions": selection.preview().dimensions(),
    })
}
