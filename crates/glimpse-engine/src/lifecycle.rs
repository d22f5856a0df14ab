use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use glimpse_contracts::analysis::{
    AnalysisOutcome, AnalyzeCall, AnalyzeReply, FailureKind, LifecycleStatus,
    EMPTY_IMAGE_DATA_MESSAGE, READ_FAILURE_MESSAGE,
};
use glimpse_contracts::events::EventWriter;
use serde_json::{json, Value};

use crate::analyzers::ImageAnalyzer;
use crate::error_chain_text;
use crate::selection::ImageSnapshot;

const REMOTE_ERROR_MAX_CHARS: usize = 1200;

struct Completion {
    generation: u64,
    result: anyhow::Result<AnalyzeReply>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    generation: u64,
    started: Instant,
}

/// Single-slot analysis state machine.
///
/// All state lives on the owning thread. The remote call runs on a worker
/// thread and reports back over a channel; completions are applied by
/// [`poll`](Self::poll) or [`wait`](Self::wait), and only when they carry the
/// current generation. Every submit and every reset advances the generation,
/// so a result for a superseded request is dropped on arrival.
pub struct LifecycleController {
    analyzer: Arc<dyn ImageAnalyzer>,
    model: String,
    events: Option<EventWriter>,
    status: LifecycleStatus,
    outcome: Option<AnalysisOutcome>,
    generation: u64,
    in_flight: Option<InFlight>,
    completions_tx: mpsc::Sender<Completion>,
    completions_rx: mpsc::Receiver<Completion>,
}

impl LifecycleController {
    pub fn new(analyzer: Arc<dyn ImageAnalyzer>, model: impl Into<String>) -> Self {
        let (completions_tx, completions_rx) = mpsc::channel();
        Self {
            analyzer,
            model: model.into(),
            events: None,
            status: LifecycleStatus::Idle,
            outcome: None,
            generation: 0,
            in_flight: None,
            completions_tx,
            completions_rx,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn status(&self) -> LifecycleStatus {
        self.status
    }

    pub fn outcome(&self) -> Option<&AnalysisOutcome> {
        self.outcome.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn analyzer_name(&self) -> &str {
        self.analyzer.name()
    }

    /// Swaps the analyzer used by later submits. A request already in flight
    /// keeps the analyzer it started with.
    pub fn set_analyzer(&mut self, analyzer: Arc<dyn ImageAnalyzer>, model: impl Into<String>) {
        self.analyzer = analyzer;
        self.model = model.into();
    }

    /// Back to idle. Any in-flight request is superseded.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.in_flight = None;
        self.status = LifecycleStatus::Idle;
        self.outcome = None;
    }

    /// Starts an analysis of `selection` with `prompt`.
    ///
    /// Returns once the request is pending (or has already failed locally);
    /// the outcome arrives through [`poll`](Self::poll) / [`wait`](Self::wait).
    pub fn submit(&mut self, prompt: &str, selection: Option<ImageSnapshot>) {
        self.generation += 1;
        self.in_flight = None;
        let generation = self.generation;

        let Some(snapshot) = selection else {
            self.finish(generation, AnalysisOutcome::no_image(), None);
            return;
        };

        self.status = LifecycleStatus::Pending;
        self.outcome = None;
        self.emit(
            "analysis_started",
            json!({
                "generation": generation,
                "model": self.model,
                "analyzer": self.analyzer.name(),
                "mime_type": snapshot.media_type,
                "source": snapshot.source.label(),
                "prompt_chars": prompt.chars().count(),
            }),
        );

        let image_data = match encode_snapshot(&snapshot) {
            Ok(data) => data,
            Err(outcome) => {
                self.finish(generation, outcome, None);
                return;
            }
        };

        let call = AnalyzeCall {
            prompt: prompt.to_string(),
            image_data,
            mime_type: snapshot.media_type,
            model: self.model.clone(),
        };
        let analyzer = Arc::clone(&self.analyzer);
        let tx = self.completions_tx.clone();
        let spawned = thread::Builder::new()
            .name("glimpse-analysis".to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(&call)))
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("analysis worker panicked")));
                let _ = tx.send(Completion { generation, result });
            });
        match spawned {
            Ok(_) => {
                self.in_flight = Some(InFlight {
                    generation,
                    started: Instant::now(),
                });
            }
            Err(err) => {
                let err = anyhow::Error::new(err).context("analysis worker spawn failed");
                let detail = error_chain_text(&err, REMOTE_ERROR_MAX_CHARS);
                self.finish(generation, AnalysisOutcome::remote(&detail), None);
            }
        }
    }

    /// Applies every completion that has arrived. Returns `true` when the
    /// visible state changed.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(completion) = self.completions_rx.try_recv() {
            changed |= self.apply(completion);
        }
        changed
    }

    /// Blocks until the current request resolves or `timeout` elapses, then
    /// returns the status. Returns immediately when nothing is in flight.
    pub fn wait(&mut self, timeout: Option<Duration>) -> LifecycleStatus {
        self.poll();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        while self.in_flight.is_some() {
            let completion = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    match self.completions_rx.recv_timeout(remaining) {
                        Ok(completion) => completion,
                        Err(_) => break,
                    }
                }
                // Never disconnected: the controller keeps a sender.
                None => match self.completions_rx.recv() {
                    Ok(completion) => completion,
                    Err(_) => break,
                },
            };
            self.apply(completion);
        }
        self.status
    }

    fn apply(&mut self, completion: Completion) -> bool {
        let current = self
            .in_flight
            .filter(|in_flight| in_flight.generation == completion.generation)
            .filter(|_| self.generation == completion.generation);
        let Some(in_flight) = current else {
            tracing::debug!(
                generation = completion.generation,
                current_generation = self.generation,
                "discarding superseded analysis result"
            );
            self.emit(
                "analysis_discarded",
                json!({
                    "generation": completion.generation,
                    "current_generation": self.generation,
                    "ok": completion.result.is_ok(),
                }),
            );
            return false;
        };
        self.in_flight = None;

        let outcome = match &completion.result {
            Ok(reply) => AnalysisOutcome::from_reply_text(reply.text.as_deref()),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "image analysis failed");
                AnalysisOutcome::remote(&error_chain_text(err, REMOTE_ERROR_MAX_CHARS))
            }
        };
        let reply = completion.result.as_ref().ok();
        self.finish(
            completion.generation,
            outcome,
            Some((in_flight.started, reply)),
        );
        true
    }

    fn finish(
        &mut self,
        generation: u64,
        outcome: AnalysisOutcome,
        timing: Option<(Instant, Option<&AnalyzeReply>)>,
    ) {
        let latency_ms = timing.map(|(started, _)| duration_ms(started.elapsed()));
        let reply = timing.and_then(|(_, reply)| reply);
        match &outcome {
            AnalysisOutcome::Text { text } => self.emit(
                "analysis_succeeded",
                json!({
                    "generation": generation,
                    "model": reply.map(|reply| reply.model.clone()).unwrap_or_else(|| self.model.clone()),
                    "chars": text.chars().count(),
                    "fallback": reply.map(|reply| reply.text.as_deref().unwrap_or("").is_empty()).unwrap_or(false),
                    "input_tokens": reply.and_then(|reply| reply.input_tokens),
                    "output_tokens": reply.and_then(|reply| reply.output_tokens),
                    "latency_ms": latency_ms,
                }),
            ),
            AnalysisOutcome::Failed { kind, message } => self.emit(
                "analysis_failed",
                json!({
                    "generation": generation,
                    "kind": kind.as_str(),
                    "message": message,
                    "latency_ms": latency_ms,
                }),
            ),
        }
        self.status = outcome.status();
        self.outcome = Some(outcome);
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

/// Whole milliseconds, saturating at `u64::MAX`.
fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn encode_snapshot(snapshot: &ImageSnapshot) -> Result<String, AnalysisOutcome> {
    let data = snapshot.source.encode_base64().map_err(|err| {
        tracing::warn!(error = %format!("{err:#}"), "image read failed");
        AnalysisOutcome::failed(FailureKind::Read, READ_FAILURE_MESSAGE)
    })?;
    if data.is_empty() {
        return Err(AnalysisOutcome::failed(
            FailureKind::Read,
            EMPTY_IMAGE_DATA_MESSAGE,
        ));
    }
    Ok(data)
}
