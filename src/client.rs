//! The caller-facing client: owns server selection, the generation pipeline,
//! request coalescing, the question cache, prefetch, and validation stats.
//!
//! One `generate_question` call runs:
//!   cache lookup → prompt render → coalesced transport call (timeout,
//!   retry with exponential backoff + jitter) → tolerant normalization →
//!   structural checks → blind verification → cache write → detached
//!   prefetch for the same key.
//!
//! An "attempt" spans transport + normalize + validate, so a validation
//! failure re-issues generation through the same backoff bookkeeping
//! instead of just re-parsing the old text.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::cache::{cache_key, QuestionCache};
use crate::config::ClientConfig;
use crate::domain::{CancelToken, GenerationRequest, Question, ServerEndpoint};
use crate::error::GenerateError;
use crate::locator;
use crate::normalize;
use crate::ollama::{GenerateOptions, OllamaBackend, TextBackend};
use crate::prompt;
use crate::stats::ValidationStats;
use crate::util::trunc_for_log;
use crate::validate::{self, ValidationPolicy};

struct ServerState {
    active: Option<ServerEndpoint>,
    /// Set by `set_server`; suppresses automatic re-detection.
    pinned: bool,
}

type InflightMap = HashMap<String, broadcast::Sender<Result<Question, GenerateError>>>;

pub struct QuizClient<B: TextBackend = OllamaBackend> {
    config: ClientConfig,
    backend: Arc<B>,
    server: Arc<RwLock<ServerState>>,
    /// Identical concurrent requests (same rendered prompt) share one call.
    inflight: Arc<Mutex<InflightMap>>,
    cache: Arc<Mutex<QuestionCache>>,
    stats: Arc<Mutex<ValidationStats>>,
}

impl<B: TextBackend> Clone for QuizClient<B> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            backend: Arc::clone(&self.backend),
            server: Arc::clone(&self.server),
            inflight: Arc::clone(&self.inflight),
            cache: Arc::clone(&self.cache),
            stats: Arc::clone(&self.stats),
        }
    }
}

/// Snapshot returned by `get_stats`.
#[derive(Clone, Debug, Serialize)]
pub struct ClientStats {
    pub server: Option<ServerEndpoint>,
    pub cache_keys: usize,
    pub cached_questions: usize,
    pub validation: ValidationStats,
}

/// Diagnostic result of `test_connection`.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionReport {
    pub url: Option<String>,
    pub reachable: bool,
    pub version: Option<String>,
    pub latency_ms: Option<u64>,
    pub models: Vec<String>,
}

impl QuizClient<OllamaBackend> {
    pub fn new(config: ClientConfig) -> Result<Self, GenerateError> {
        let backend = OllamaBackend::new(config.model.clone())?;
        Ok(Self::with_backend(config, backend))
    }

    /// Build from TRIVIAGEN_* env variables / TOML config.
    pub fn from_env() -> Result<Self, GenerateError> {
        Self::new(ClientConfig::from_env())
    }
}

impl<B: TextBackend> QuizClient<B> {
    pub fn with_backend(config: ClientConfig, backend: B) -> Self {
        let active = config.server_url.as_ref().map(|url| ServerEndpoint {
            url: url.clone(),
            available: true,
            version: None,
            latency_ms: None,
        });
        let pinned = active.is_some();
        if pinned {
            info!(target: "triviagen", url = ?config.server_url, "server pinned from config");
        }
        let cache = QuestionCache::new(config.cache_max_per_key, config.cache_max_keys);
        Self {
            config,
            backend: Arc::new(backend),
            server: Arc::new(RwLock::new(ServerState { active, pinned })),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            cache: Arc::new(Mutex::new(cache)),
            stats: Arc::new(Mutex::new(ValidationStats::default())),
        }
    }

    // --- Public surface ---

    /// Produce one validated question, from cache when possible.
    #[instrument(level = "info", skip(self, req), fields(category = %req.category, difficulty = %req.difficulty))]
    pub async fn generate_question(&self, req: GenerationRequest) -> Result<Question, GenerateError> {
        self.generate_inner(req, true, true).await
    }

    /// Re-probe candidates and adopt the fastest reachable server.
    /// Clears any manual pin.
    pub async fn detect_server(&self) -> Option<ServerEndpoint> {
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let endpoints =
            locator::probe_all(&self.backend, &self.config.candidate_urls, probe_timeout).await;
        let best = locator::best(&endpoints).cloned();
        match &best {
            Some(ep) => {
                let switching = {
                    let state = self.server.read().await;
                    state.active.as_ref().map(|cur| cur.url != ep.url).unwrap_or(true)
                };
                if switching {
                    self.confirm_model(&ep.url).await;
                }
                let mut state = self.server.write().await;
                state.active = Some(ep.clone());
                state.pinned = false;
                info!(target: "triviagen", url = %ep.url, latency_ms = ?ep.latency_ms, "active server selected");
            }
            None => {
                self.server.write().await.active = None;
                warn!(target: "triviagen", "discovery found no reachable backend; client unavailable");
            }
        }
        best
    }

    /// Use this server now, but keep auto-detection: if it stops answering,
    /// the next availability check may replace it with a probed candidate.
    pub async fn set_server(&self, url: impl Into<String>) {
        let url = url.into();
        let mut state = self.server.write().await;
        state.active = Some(ServerEndpoint {
            url: url.clone(),
            available: true,
            version: None,
            latency_ms: None,
        });
        state.pinned = false;
        info!(target: "triviagen", %url, "preferred server set manually");
    }

    /// Pin a server, disabling auto-detection until the next explicit
    /// `detect_server` call. A pinned server that goes down is reported
    /// unavailable rather than replaced.
    pub async fn set_dedicated_server(&self, url: impl Into<String>) {
        let url = url.into();
        let mut state = self.server.write().await;
        state.active = Some(ServerEndpoint {
            url: url.clone(),
            available: true,
            version: None,
            latency_ms: None,
        });
        state.pinned = true;
        info!(target: "triviagen", %url, "server pinned manually; auto-detection disabled");
    }

    /// Is a backend usable right now? Probes the active server and, unless
    /// pinned, falls back to a fresh discovery pass.
    pub async fn check_availability(&self) -> bool {
        let (current, pinned) = {
            let state = self.server.read().await;
            (state.active.clone(), state.pinned)
        };
        if let Some(ep) = current {
            let t = Duration::from_millis(self.config.probe_timeout_ms);
            let ok = tokio::time::timeout(t, self.backend.version(&ep.url, t))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            if ok {
                return true;
            }
            if pinned {
                return false;
            }
            self.server.write().await.active = None;
        }
        if self.config.auto_detect {
            self.detect_server().await.is_some()
        } else {
            false
        }
    }

    pub async fn list_available_models(&self) -> Result<Vec<String>, GenerateError> {
        let url = self.ensure_server().await?;
        self.backend.tags(&url).await
    }

    pub async fn test_connection(&self) -> ConnectionReport {
        let url = match self.ensure_server().await {
            Ok(u) => u,
            Err(_) => {
                return ConnectionReport {
                    url: None,
                    reachable: false,
                    version: None,
                    latency_ms: None,
                    models: Vec::new(),
                }
            }
        };
        let t = Duration::from_millis(self.config.probe_timeout_ms);
        let started = std::time::Instant::now();
        match tokio::time::timeout(t, self.backend.version(&url, t)).await {
            Ok(Ok(version)) => ConnectionReport {
                latency_ms: Some(started.elapsed().as_millis() as u64),
                models: self.backend.tags(&url).await.unwrap_or_default(),
                url: Some(url),
                reachable: true,
                version: Some(version),
            },
            _ => ConnectionReport {
                url: Some(url),
                reachable: false,
                version: None,
                latency_ms: None,
                models: Vec::new(),
            },
        }
    }

    pub async fn get_stats(&self) -> ClientStats {
        let server = self.server.read().await.active.clone();
        let cache = self.cache.lock().await;
        ClientStats {
            server,
            cache_keys: cache.key_count(),
            cached_questions: cache.total_questions(),
            validation: self.stats.lock().await.clone(),
        }
    }

    pub async fn validation_stats_report(&self) -> String {
        self.stats.lock().await.report()
    }

    pub async fn reset_validation_stats(&self) {
        self.stats.lock().await.reset();
    }

    // --- Pipeline ---

    async fn generate_inner(
        &self,
        req: GenerationRequest,
        use_cache: bool,
        allow_prefetch: bool,
    ) -> Result<Question, GenerateError> {
        if req.cancel.as_ref().map(|t| t.is_cancelled()).unwrap_or(false) {
            return Err(GenerateError::Cancelled);
        }

        let requested_topic = req.topic.clone().unwrap_or_default();
        let key = cache_key(&req.category, &req.difficulty, &requested_topic);

        if use_cache {
            if let Some(q) = self.cache.lock().await.pop(&key) {
                debug!(target: "pipeline", %key, "cache hit");
                if allow_prefetch {
                    self.spawn_prefetch(&req, &key);
                }
                return Ok(q);
            }
        }

        let base_url = self.ensure_server().await?;
        let language = if req.language.trim().is_empty() {
            self.config.language.clone()
        } else {
            req.language.clone()
        };
        let topic = match &req.topic {
            Some(t) if !t.trim().is_empty() => t.clone(),
            _ => prompt::pick_topic(&req.category),
        };
        let prompt_text = prompt::build_generation_prompt(
            &req.category,
            &req.difficulty,
            &topic,
            &req.avoid_topics,
            &language,
        );

        // Coalescing: join an identical in-flight request instead of issuing
        // a second network call.
        let joined = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&prompt_text) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    inflight.insert(prompt_text.clone(), tx);
                    None
                }
            }
        };
        if let Some(mut rx) = joined {
            debug!(target: "pipeline", "joining identical in-flight request");
            // The waiter's own token still applies while the leader runs.
            let settled = match &req.cancel {
                Some(tok) => tokio::select! {
                    biased;
                    _ = tok.cancelled() => return Err(GenerateError::Cancelled),
                    res = rx.recv() => res,
                },
                None => rx.recv().await,
            };
            return match settled {
                Ok(result) => result,
                Err(_) => Err(GenerateError::Network("in-flight request was dropped".into())),
            };
        }

        let result = self.run_attempts(&req, &prompt_text, &topic, &language, &base_url).await;

        // Settle: remove the entry first so later identical calls issue a
        // fresh request, then fan the outcome out to every waiter.
        {
            let mut inflight = self.inflight.lock().await;
            if let Some(tx) = inflight.remove(&prompt_text) {
                let _ = tx.send(result.clone());
            }
        }

        if let Ok(q) = &result {
            self.cache.lock().await.push(&key, q.clone());
            if allow_prefetch {
                self.spawn_prefetch(&req, &key);
            }
        }
        result
    }

    async fn run_attempts(
        &self,
        req: &GenerationRequest,
        prompt_text: &str,
        topic: &str,
        language: &str,
        base_url: &str,
    ) -> Result<Question, GenerateError> {
        let creative = GenerateOptions::creative(&self.config);
        let max_attempts = self.config.max_retries.max(1);
        let mut last: Option<GenerateError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.backoff_delay(attempt);
                debug!(target: "pipeline", attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                match &req.cancel {
                    Some(tok) => tokio::select! {
                        biased;
                        _ = tok.cancelled() => return Err(GenerateError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    },
                    None => tokio::time::sleep(delay).await,
                }
            }

            match self.attempt_once(req, prompt_text, topic, language, base_url, &creative).await {
                Ok(q) => {
                    info!(target: "pipeline", attempt, "question generated and validated");
                    return Ok(q);
                }
                Err(GenerateError::Cancelled) => return Err(GenerateError::Cancelled),
                Err(e) if e.is_retryable() => {
                    warn!(target: "pipeline", attempt, error = %e, "attempt failed");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(GenerateError::Failed {
            attempts: max_attempts,
            last: last.map(|e| e.to_string()).unwrap_or_else(|| "no attempt ran".into()),
        })
    }

    /// `base * 2^(n-1)` for the n-th completed attempt, plus random jitter.
    fn backoff_delay(&self, next_attempt: u32) -> Duration {
        let exp = next_attempt.saturating_sub(2).min(16);
        let base = self.config.backoff_base_ms.saturating_mul(1u64 << exp);
        let jitter = if self.config.backoff_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.config.backoff_jitter_ms)
        };
        Duration::from_millis(base.saturating_add(jitter))
    }

    /// One full attempt: transport, normalization (with the strict-JSON
    /// reformat fallback), structural checks, verification.
    async fn attempt_once(
        &self,
        req: &GenerationRequest,
        prompt_text: &str,
        topic: &str,
        language: &str,
        base_url: &str,
        creative: &GenerateOptions,
    ) -> Result<Question, GenerateError> {
        let raw = self.call_backend(base_url, prompt_text, creative, req.cancel.as_ref()).await?;

        let recovered = match normalize::recover(&raw) {
            Ok(r) => r,
            Err(reason) => {
                debug!(
                    target: "pipeline",
                    %reason,
                    raw = %trunc_for_log(&raw, 160),
                    "normalization failed; requesting strict reformat"
                );
                let strict = GenerateOptions::strict(&self.config);
                let follow_up = prompt::build_reformat_prompt(&raw);
                let raw2 = self
                    .call_backend(base_url, &follow_up, &strict, req.cancel.as_ref())
                    .await?;
                normalize::recover_json_only(&raw2).map_err(GenerateError::Parse)?
            }
        };

        let mut question = recovered.into_question(req, topic);
        validate::check_structure(&question, self.config.min_question_len)
            .map_err(GenerateError::Structural)?;
        self.verify(&mut question, base_url, language, req.cancel.as_ref()).await?;
        Ok(question)
    }

    /// Blind verification. Full mode checks every question; otherwise the
    /// cheap pattern heuristic runs first and escalates only when the
    /// explanation does not support the chosen answer.
    async fn verify(
        &self,
        question: &mut Question,
        base_url: &str,
        language: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<(), GenerateError> {
        let run_blind = if self.config.full_verification {
            true
        } else if validate::needs_escalation(question) {
            debug!(target: "validation", "pattern heuristic inconclusive; escalating to blind verification");
            true
        } else {
            false
        };
        if !run_blind {
            return Ok(());
        }

        let vprompt = prompt::build_verification_prompt(&question.text, language);
        let strict = GenerateOptions::strict(&self.config);
        let reply_text = match self.call_backend(base_url, &vprompt, &strict, cancel).await {
            Ok(t) => t,
            Err(GenerateError::Cancelled) => return Err(GenerateError::Cancelled),
            Err(e) => {
                // Verification is best-effort: a dead verifier must not kill
                // an otherwise valid question.
                warn!(target: "validation", error = %e, "verification call failed; accepting unverified");
                self.stats.lock().await.record_error();
                return Ok(());
            }
        };

        let reply = validate::parse_verification_reply(&reply_text);
        let policy = ValidationPolicy {
            regenerate_threshold: self.config.regenerate_threshold,
            correction_threshold: self.config.correction_threshold,
        };
        let outcome = validate::decide(question, &reply, &policy);
        self.stats.lock().await.record_outcome(&outcome);
        debug!(
            target: "validation",
            action = ?outcome.action,
            score = outcome.match_score,
            "verification outcome recorded"
        );
        if outcome.regenerate_required {
            Err(GenerateError::RegenerationRequired { score: outcome.match_score })
        } else {
            Ok(())
        }
    }

    /// One transport call under the per-attempt timeout, composed with the
    /// caller's cancellation token. Timeout is retryable; cancellation is
    /// not and wins ties.
    async fn call_backend(
        &self,
        base_url: &str,
        prompt_text: &str,
        opts: &GenerateOptions,
        cancel: Option<&CancelToken>,
    ) -> Result<String, GenerateError> {
        let ms = self.config.request_timeout_ms;
        let timed = tokio::time::timeout(
            Duration::from_millis(ms),
            self.backend.generate(base_url, prompt_text, opts),
        );
        match cancel {
            Some(tok) => tokio::select! {
                biased;
                _ = tok.cancelled() => Err(GenerateError::Cancelled),
                res = timed => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(GenerateError::Timeout { ms }),
                },
            },
            None => match timed.await {
                Ok(inner) => inner,
                Err(_) => Err(GenerateError::Timeout { ms }),
            },
        }
    }

    /// Fire-and-forget top-up of the cache for this key. Never blocks or
    /// fails the caller.
    fn spawn_prefetch(&self, req: &GenerationRequest, key: &str) {
        if !self.config.prefetch_enabled {
            return;
        }
        let client = self.clone();
        let mut req = req.clone();
        req.cancel = None;
        let key = key.to_string();
        tokio::spawn(async move {
            if client.cache.lock().await.len(&key) >= client.config.prefetch_count {
                return;
            }
            match client.generate_inner(req, false, false).await {
                Ok(_) => debug!(target: "pipeline", %key, "prefetch stored a question"),
                Err(e) => debug!(target: "pipeline", %key, error = %e, "prefetch failed (ignored)"),
            }
        });
    }

    // --- Server management helpers ---

    async fn ensure_server(&self) -> Result<String, GenerateError> {
        if let Some(ep) = &self.server.read().await.active {
            return Ok(ep.url.clone());
        }
        if !self.config.auto_detect {
            return Err(GenerateError::Unavailable(
                "no server configured and auto-detect is off".into(),
            ));
        }
        match self.detect_server().await {
            Some(ep) => Ok(ep.url),
            None => Err(GenerateError::Unavailable("no reachable backend among candidates".into())),
        }
    }

    async fn confirm_model(&self, url: &str) {
        match self.backend.tags(url).await {
            Ok(models) => {
                if !models.iter().any(|m| m.starts_with(&self.config.model)) {
                    warn!(
                        target: "triviagen",
                        model = %self.config.model,
                        %url,
                        "configured model not reported by /api/tags on the selected server"
                    );
                }
            }
            Err(e) => {
                warn!(target: "triviagen", %url, error = %e, "could not list models on selected server");
            }
        }
    }
}
