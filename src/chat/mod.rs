//! The completion pipeline: request assembly, streaming, ordered failover,
//! extraction wiring, and turn finalization.
//!
//! One pipeline drives one chat surface. All conversational state lives on
//! this struct and its session store; progress reaches the host through
//! the event channel, never through direct UI calls.

pub mod prompts;

use crate::config::Config;
use crate::correlate::BlockCorrelator;
use crate::events::ChatEvent;
use crate::extract::BlockExtractor;
use crate::llm::{
    client::{open_stream, StreamError},
    models::{ModelEntry, Roster},
    Attachment, Message,
};
use crate::runner::ProgramRunner;
use crate::safety::ConfirmRun;
use crate::session::{ChatTurn, SessionStore};
use crate::util::format_elapsed;
use crate::workspace;
use anyhow::Result;
use base64::Engine as _;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Why one streaming attempt failed. Both variants consume an attempt and
/// flow through the same failover path.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Provider(#[from] StreamError),
    #[error("{model} returned no content")]
    EmptyResponse { model: String },
}

/// Per-question inputs supplied by the host alongside the question text.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    /// `@file` mentions already resolved to unique workspace paths
    pub mentioned_files: Vec<(String, PathBuf)>,
    /// Image attachments to send with the question
    pub attachments: Vec<Attachment>,
}

/// A configuration change requested while a turn was streaming. Queued
/// and replayed in order once the turn completes, so rosters and output
/// targets never mutate mid-request.
enum QueuedChange {
    Model(usize),
    AgentMode(bool),
    WriteToFile(bool, Option<String>),
    ContextCapacity(usize),
    Reload(Box<Config>, Option<String>),
}

enum StreamOutcome {
    Completed { text: String },
    Interrupted,
}

pub struct ChatPipeline {
    config: Config,
    workspace_root: PathBuf,
    client: reqwest::Client,
    api_key: Option<String>,
    roster: Roster,
    store: SessionStore,
    extractor: BlockExtractor,
    correlator: BlockCorrelator,
    runner: ProgramRunner,
    events: Sender<ChatEvent>,
    cancel: Arc<AtomicBool>,
    responding: bool,
    queued: Vec<QueuedChange>,
    pending_blocks: HashMap<String, String>,
    /// Blocks extracted by the in-flight turn; survives a mid-stream
    /// history clear.
    active_blocks: HashSet<String>,
}

impl ChatPipeline {
    pub fn new(
        config: Config,
        api_key: Option<String>,
        workspace_root: PathBuf,
        confirm: Arc<dyn ConfirmRun>,
        events: Sender<ChatEvent>,
    ) -> Self {
        let roster = Roster::from_config(&config);
        let runner = ProgramRunner::new(workspace_root.clone(), confirm, events.clone());
        let store = SessionStore::new(config.context_file_size);
        Self {
            roster,
            runner,
            store,
            extractor: BlockExtractor::new(prompts::SENTINEL),
            correlator: BlockCorrelator::new(),
            client: reqwest::Client::new(),
            api_key,
            workspace_root,
            events,
            cancel: Arc::new(AtomicBool::new(false)),
            responding: false,
            queued: Vec::new(),
            pending_blocks: HashMap::new(),
            active_blocks: HashSet::new(),
            config,
        }
    }

    /// Shared cancellation flag; setting it aborts the in-flight stream at
    /// the next delta.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) {
        if self.responding {
            self.cancel.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_responding(&self) -> bool {
        self.responding
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn agent_mode(&self) -> bool {
        self.store.current().agent_mode
    }

    pub fn model_index(&self) -> usize {
        self.store.current().model_index
    }

    pub fn pending_block_keys(&self) -> Vec<String> {
        self.pending_blocks.keys().cloned().collect()
    }

    pub fn running_programs(&self) -> Vec<(String, u32)> {
        self.runner.running()
    }

    pub fn context_entries(&self) -> Vec<(PathBuf, String)> {
        self.store.current().context.entries_newest_first()
    }

    pub fn session_titles(&self) -> Vec<(u64, String)> {
        self.store.titles()
    }

    pub fn current_session_id(&self) -> u64 {
        self.store.current_id()
    }

    /// Drive one question through the provider roster. Rejected with a
    /// `Busy` event while another turn is streaming.
    pub async fn submit_turn(&mut self, question: &str, opts: TurnOptions) -> Result<()> {
        if self.responding {
            let _ = self.events.send(ChatEvent::Busy);
            return Ok(());
        }

        let turn_key = Uuid::new_v4();
        if self.roster.is_empty() {
            let _ = self.events.send(ChatEvent::TurnFailed {
                turn: turn_key,
                message: format!(
                    "No available models for {}. Add models in {}.",
                    self.roster.backend().label(),
                    Config::config_location()
                ),
            });
            return Ok(());
        }

        self.responding = true;
        self.extractor.reset();
        self.active_blocks.clear();

        // Mentioned files enter (or refresh) the context cache first, so
        // this question's request already carries their content.
        {
            let session = self.store.current_mut();
            for (title, location) in &opts.mentioned_files {
                session.context.put(location.clone(), title.clone());
            }
        }
        if !opts.mentioned_files.is_empty() {
            self.notify_context();
        }

        let (agent_mode, write_to_file, output_file, snippet, start_index) = {
            let session = self.store.current_mut();
            session.set_title_from(question);
            let snippet = std::mem::take(&mut session.snippet);
            (
                session.agent_mode,
                session.write_to_file,
                session.output_file.clone(),
                snippet,
                session.model_index,
            )
        };
        let start_index = self.roster.clamp_index(start_index);
        self.store.current_mut().model_index = start_index;

        let complete_question = rewrite_mentions(question, &opts.mentioned_files);
        let snippet = if snippet.trim().is_empty() {
            None
        } else {
            Some(snippet)
        };

        if write_to_file {
            if let Err(err) = workspace::append_to_output(
                &self.workspace_root,
                &output_file,
                &format!("**{}**\n\n", question),
            ) {
                warn!("could not start output file: {}", err);
            }
        }

        // Built once; retries resend the identical request.
        let messages = self.build_messages(
            &complete_question,
            snippet.as_deref(),
            agent_mode,
            &opts.attachments,
        );

        // Ordered failover: at most one attempt per configured model,
        // wrapping from the selected index.
        let roster_len = self.roster.len();
        let mut index = start_index;
        for attempt in 0..roster_len {
            let entry = self.roster.get(index).clone();
            let started = Instant::now();
            match self
                .stream_once(turn_key, &entry, &messages, agent_mode, write_to_file, &output_file)
                .await
            {
                Ok(StreamOutcome::Completed { text }) => {
                    self.finish_success(
                        turn_key,
                        question,
                        &text,
                        snippet.clone(),
                        agent_mode,
                        &entry,
                        started,
                        write_to_file,
                        &output_file,
                    );
                    break;
                }
                Ok(StreamOutcome::Interrupted) => {
                    self.finish_interrupted(turn_key, &entry, started, write_to_file, &output_file);
                    break;
                }
                Err(err) => {
                    // A cancellation can also surface as a transport error
                    if self.cancel.load(Ordering::SeqCst) {
                        self.finish_interrupted(
                            turn_key,
                            &entry,
                            started,
                            write_to_file,
                            &output_file,
                        );
                        break;
                    }
                    if attempt + 1 == roster_len {
                        self.finish_failure(
                            turn_key,
                            question,
                            snippet.clone(),
                            agent_mode,
                            &err.to_string(),
                        );
                    } else {
                        index = (index + 1) % roster_len;
                        let next = self.roster.get(index).name.clone();
                        debug!(
                            "attempt {}/{} failed ({}), switching to {}",
                            attempt + 1,
                            roster_len,
                            err,
                            next
                        );
                        let _ = self.events.send(ChatEvent::ModelSwitched { name: next });
                    }
                }
            }
        }

        // Per-turn state never leaks into the next turn
        self.cancel.store(false, Ordering::SeqCst);
        self.responding = false;
        self.apply_queued_changes();
        Ok(())
    }

    async fn stream_once(
        &mut self,
        turn: Uuid,
        entry: &ModelEntry,
        messages: &[Message],
        agent_mode: bool,
        write_to_file: bool,
        output_file: &str,
    ) -> Result<StreamOutcome, TurnError> {
        let mut stream = open_stream(
            &self.client,
            self.roster.backend(),
            self.api_key.as_deref(),
            &entry.id,
            messages,
        )
        .await?;

        let mut accumulated = String::new();
        let mut started_notified = false;
        let mut interrupted = false;

        loop {
            match stream.next_delta().await {
                Ok(Some(delta)) => {
                    if !started_notified {
                        started_notified = true;
                        let _ = self.events.send(ChatEvent::ResponseStarted { turn });
                    }
                    // Checked once per delta; dropping the stream below
                    // aborts the underlying transport.
                    if self.cancel.load(Ordering::SeqCst) {
                        interrupted = true;
                        break;
                    }

                    let mut text = delta.text;
                    for image in &delta.images {
                        if let Some(markdown) = self.save_delta_image(image) {
                            text.push_str(&markdown);
                        }
                    }
                    if text.is_empty() {
                        continue;
                    }
                    accumulated.push_str(&text);

                    if write_to_file {
                        if let Err(err) =
                            workspace::append_to_output(&self.workspace_root, output_file, &text)
                        {
                            warn!("could not append to output file: {}", err);
                        }
                    } else {
                        let _ = self.events.send(ChatEvent::ResponseDelta { turn, text });
                        if agent_mode {
                            self.emit_new_blocks(turn, &accumulated, false);
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    if self.cancel.load(Ordering::SeqCst) {
                        interrupted = true;
                        break;
                    }
                    return Err(TurnError::Provider(err));
                }
            }
        }

        if interrupted {
            return Ok(StreamOutcome::Interrupted);
        }
        if accumulated.is_empty() {
            return Err(TurnError::EmptyResponse {
                model: entry.name.clone(),
            });
        }
        Ok(StreamOutcome::Completed { text: accumulated })
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_success(
        &mut self,
        turn: Uuid,
        question: &str,
        text: &str,
        snippet: Option<String>,
        agent_mode: bool,
        entry: &ModelEntry,
        started: Instant,
        write_to_file: bool,
        output_file: &str,
    ) {
        let runtime = format!(
            "Call to {} took {} seconds.",
            entry.name,
            format_elapsed(started.elapsed())
        );
        let response = format!("{}\n\n**{}**", text, runtime);

        if write_to_file {
            match workspace::append_to_output(
                &self.workspace_root,
                output_file,
                &format!("\n\n**{}**\n\n", runtime),
            ) {
                Ok(path) => {
                    let _ = self.events.send(ChatEvent::ResponseWrittenToFile { turn, path });
                }
                Err(err) => warn!("could not finish output file: {}", err),
            }
        } else {
            // The stream's last chunk always gets a final extraction pass
            if agent_mode {
                self.emit_new_blocks(turn, &response, true);
            }
            let _ = self.events.send(ChatEvent::ResponseComplete {
                turn,
                response: response.clone(),
            });
        }

        self.active_blocks.clear();
        self.store.current_mut().turns.push(ChatTurn {
            key: turn,
            question: question.to_string(),
            response,
            snippet,
            agent_mode,
            created_at: Utc::now(),
        });
    }

    fn finish_interrupted(
        &mut self,
        turn: Uuid,
        entry: &ModelEntry,
        started: Instant,
        write_to_file: bool,
        output_file: &str,
    ) {
        let notice = format!(
            "Call to {} took {} seconds.",
            entry.name,
            format_elapsed(started.elapsed())
        );
        debug!("turn {} interrupted after {:?}", turn, started.elapsed());
        if write_to_file {
            let _ = workspace::append_to_output(
                &self.workspace_root,
                output_file,
                &format!("**{}**\n\n", notice),
            );
        }
        let _ = self.events.send(ChatEvent::Interrupted { turn, notice });
    }

    fn finish_failure(
        &mut self,
        turn: Uuid,
        question: &str,
        snippet: Option<String>,
        agent_mode: bool,
        message: &str,
    ) {
        warn!("turn {} failed on every configured model: {}", turn, message);
        let _ = self.events.send(ChatEvent::TurnFailed {
            turn,
            message: message.to_string(),
        });
        self.store.current_mut().turns.push(ChatTurn {
            key: turn,
            question: question.to_string(),
            response: message.to_string(),
            snippet,
            agent_mode,
            created_at: Utc::now(),
        });
    }

    /// Assemble the request: system instructions, cached file content,
    /// the recent conversation window, then the new question.
    fn build_messages(
        &mut self,
        question: &str,
        snippet: Option<&str>,
        agent_mode: bool,
        attachments: &[Attachment],
    ) -> Vec<Message> {
        let mut messages = Vec::new();

        if agent_mode {
            messages.push(Message::text("system", prompts::agent_instructions()));
        }
        let custom = self.config.system_prompt.trim();
        if !custom.is_empty() {
            messages.push(Message::text("system", custom));
        }

        let base_message = format!("BASE WORKSPACE PATH: {}", self.workspace_root.display());
        let window = self.config.context_interaction_size;
        let session = self.store.current_mut();

        let files = session.context.render_as_text();
        if !files.is_empty() {
            messages.push(Message::text(
                "system",
                format!("{}\n\n{}", files, base_message),
            ));
        } else {
            messages.push(Message::text("system", base_message));
        }

        let start = session.turns.len().saturating_sub(window);
        for turn in &session.turns[start..] {
            // Chat mode doesn't replay agent turns; their responses are
            // programs, not prose.
            if !agent_mode && turn.agent_mode {
                continue;
            }
            let response_body = strip_runtime_footer(&turn.response);
            let question_text = match &turn.snippet {
                Some(snippet) if !snippet.trim().is_empty() => {
                    format!("{}\n\n{}", turn.question, snippet)
                }
                _ => turn.question.clone(),
            };
            messages.push(Message::text("user", question_text));
            messages.push(Message::text("assistant", response_body));
        }

        let complete_question = match snippet {
            Some(snippet) => format!("{}\n\n{}", question, snippet),
            None => question.to_string(),
        };
        messages.push(Message::user_with_images(complete_question, attachments));
        messages
    }

    fn emit_new_blocks(&mut self, turn: Uuid, buffer: &str, is_final: bool) {
        for code in self.extractor.scan(buffer, is_final) {
            let key = format!("{} / {}", turn, Uuid::new_v4());
            self.pending_blocks.insert(key.clone(), code.clone());
            self.active_blocks.insert(key.clone());
            let _ = self.events.send(ChatEvent::RunnableBlock { key, code });
        }
    }

    /// Save an inline delta image under `media/` and return markdown
    /// referencing it. Undecodable payloads are dropped.
    fn save_delta_image(&self, data_url: &str) -> Option<String> {
        let (meta, payload) = data_url.split_once(',')?;
        let kind = meta.strip_prefix("data:image/")?.split(';').next()?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .ok()?;

        let dir = self.workspace_root.join("media");
        std::fs::create_dir_all(&dir).ok()?;
        let stem: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
        let path = dir.join(format!("{}.{}", stem, kind));
        std::fs::write(&path, bytes).ok()?;
        Some(format!("\n\n![Image]({})\n\n", path.display()))
    }

    /// Hand an extracted block to the executor. Returns false for unknown
    /// keys. A block can only be run once.
    pub fn run_block(&mut self, key: &str) -> bool {
        match self.pending_blocks.remove(key) {
            Some(code) => {
                self.runner
                    .execute(key.to_string(), code, self.config.run_timeout_secs);
                true
            }
            None => false,
        }
    }

    /// Correlate a rendered code block with a pending runnable block.
    pub fn match_block(&mut self, rendered: &str, force: bool) -> Option<String> {
        self.correlator.find_match(rendered, &self.pending_blocks, force)
    }

    /// Force-terminate a running program; unknown keys are a no-op.
    pub fn kill_run(&self, key: &str) {
        self.runner.kill(key);
    }

    /// Attach (or extend) the editor-selection snippet sent with the next
    /// question.
    pub fn set_snippet(&mut self, text: &str, addition: bool) {
        let session = self.store.current_mut();
        if addition && !session.snippet.is_empty() {
            session.snippet = format!("{}\n\n{}", session.snippet, text);
        } else {
            session.snippet = text.to_string();
        }
    }

    pub fn clear_snippet(&mut self) {
        self.store.current_mut().snippet.clear();
    }

    pub fn select_model(&mut self, index: usize) {
        if self.responding {
            self.queued.push(QueuedChange::Model(index));
            return;
        }
        let clamped = self.roster.clamp_index(index);
        self.store.current_mut().model_index = clamped;
    }

    pub fn set_agent_mode(&mut self, enabled: bool) {
        if self.responding {
            self.queued.push(QueuedChange::AgentMode(enabled));
            return;
        }
        self.store.current_mut().agent_mode = enabled;
    }

    pub fn set_write_to_file(&mut self, enabled: bool, output_file: Option<String>) {
        if self.responding {
            self.queued
                .push(QueuedChange::WriteToFile(enabled, output_file));
            return;
        }
        let session = self.store.current_mut();
        session.write_to_file = enabled;
        if let Some(name) = output_file {
            session.output_file = workspace::sanitize_output_name(&name);
        }
    }

    pub fn change_context_capacity(&mut self, capacity: usize) {
        if self.responding {
            self.queued.push(QueuedChange::ContextCapacity(capacity));
            return;
        }
        self.config.context_file_size = capacity;
        self.store.current_mut().context.change_capacity(capacity);
        self.notify_context();
    }

    /// Drop one file from the mentioned-file cache.
    pub fn remove_context_entry(&mut self, location: &Path) {
        if self.store.current_mut().context.delete(location) {
            self.notify_context();
        }
    }

    /// Replace the configuration (and optionally the API key). Applied
    /// immediately, or after the in-flight turn completes.
    pub fn reload_config(&mut self, config: Config, api_key: Option<String>) {
        if self.responding {
            self.queued
                .push(QueuedChange::Reload(Box::new(config), api_key));
            return;
        }
        self.apply_config(config, api_key);
    }

    fn apply_config(&mut self, config: Config, api_key: Option<String>) {
        self.roster = Roster::from_config(&config);
        let session = self.store.current_mut();
        session.model_index = self.roster.clamp_index(session.model_index);
        session.context.change_capacity(config.context_file_size);
        if api_key.is_some() {
            self.api_key = api_key;
        }
        self.config = config;
        self.notify_context();
    }

    fn apply_queued_changes(&mut self) {
        for change in std::mem::take(&mut self.queued) {
            match change {
                QueuedChange::Model(index) => self.select_model(index),
                QueuedChange::AgentMode(enabled) => self.set_agent_mode(enabled),
                QueuedChange::WriteToFile(enabled, name) => self.set_write_to_file(enabled, name),
                QueuedChange::ContextCapacity(capacity) => self.change_context_capacity(capacity),
                QueuedChange::Reload(config, api_key) => self.apply_config(*config, api_key),
            }
        }
    }

    /// Clear the current session's history. While a turn is streaming,
    /// its freshly extracted blocks are kept runnable; everything older
    /// goes away.
    pub fn clear_history(&mut self) {
        self.store.current_mut().turns.clear();
        if self.responding {
            let active = &self.active_blocks;
            self.pending_blocks.retain(|key, _| active.contains(key));
        } else {
            self.pending_blocks.clear();
            self.correlator.clear();
        }
    }

    /// Delete one persisted turn and any still-pending blocks it produced.
    pub fn delete_turn(&mut self, key: Uuid) -> bool {
        let prefix = format!("{} / ", key);
        self.pending_blocks.retain(|k, _| !k.starts_with(&prefix));
        self.store.current_mut().delete_turn(key)
    }

    pub fn new_session(&mut self) -> Option<u64> {
        if self.responding {
            return None;
        }
        let id = self.store.new_session(self.config.context_file_size);
        self.notify_context();
        Some(id)
    }

    pub fn switch_session(&mut self, id: u64) -> bool {
        if self.responding || !self.store.switch(id) {
            return false;
        }
        let capacity = self.config.context_file_size;
        let session = self.store.current_mut();
        session.model_index = self.roster.clamp_index(session.model_index);
        if session.context.capacity() != capacity {
            session.context.change_capacity(capacity);
        }
        self.notify_context();
        true
    }

    pub fn delete_session(&mut self, id: u64) -> bool {
        if self.responding && id == self.store.current_id() {
            return false;
        }
        let deleted = self.store.delete(id, self.config.context_file_size);
        if deleted {
            self.notify_context();
        }
        deleted
    }

    fn notify_context(&self) {
        let entries = self.store.current().context.entries_newest_first();
        let _ = self.events.send(ChatEvent::ContextUpdated { entries });
    }
}

/// Replace each resolved `@file` mention with `name (path)` so the model
/// can tell identically named files apart.
fn rewrite_mentions(question: &str, mentioned: &[(String, PathBuf)]) -> String {
    let mut text = question.to_string();
    for (title, location) in mentioned {
        let mention = format!("@{}", title);
        let replacement = format!("{} ({})", title, location.display());
        text = text.replacen(&mention, &replacement, 1);
    }
    text
}

/// Drop the timing footer (everything from the last newline on) before a
/// response is replayed into a follow-up request.
fn strip_runtime_footer(response: &str) -> &str {
    response
        .rfind('\n')
        .map(|index| &response[..index])
        .unwrap_or("")
}
