//! Semantic search: query rewrite, vector similarity, then an untrusted
//! re-rank that is only applied when it is a permutation of the candidates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::json;
use uuid::Uuid;

use crate::config::OpenAiConfig;
use crate::error::{AppError, AppResult};
use crate::history::{self, HistoryService, SEARCH_LIMIT};
use crate::llm::{CompletionRequest, LanguageModel};
use crate::models::messages::{Message, ScoredMessage};

#[derive(Clone)]
pub struct SemanticSearch {
    history: HistoryService,
    backend: Option<(Arc<dyn LanguageModel>, Arc<OpenAiConfig>)>,
}

impl SemanticSearch {
    pub fn disabled(history: HistoryService) -> Self {
        Self {
            history,
            backend: None,
        }
    }

    pub fn new(
        history: HistoryService,
        model: Arc<dyn LanguageModel>,
        config: Arc<OpenAiConfig>,
    ) -> Self {
        Self {
            history,
            backend: Some((model, config)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub async fn search(&self, chat_id: Uuid, query: &str) -> AppResult<Vec<ScoredMessage>> {
        let Some((model, config)) = self.backend.as_ref() else {
            return Err(AppError::ServiceUnavailable(anyhow!(
                "semantic search is disabled"
            )));
        };
        let query = history::validate_search_query(query)?;

        let optimized = match model
            .complete(CompletionRequest {
                model: &config.optimizer_model,
                instructions: &config.optimizer_instructions,
                input: query,
                temperature: config.optimizer_temperature,
            })
            .await
        {
            Ok(optimized) if !optimized.is_empty() => optimized,
            Ok(_) => query.to_string(),
            Err(e) => {
                tracing::warn!(%chat_id, error = %e, "query optimization failed, using raw query");
                query.to_string()
            }
        };

        let embedding = match model.embed(&optimized).await {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!(%chat_id, error = %e, "query embedding failed, falling back to keyword search");
                let found = self.history.search_text(chat_id, query).await?;
                return Ok(found
                    .into_iter()
                    .map(|message| ScoredMessage {
                        message,
                        cosine_similarity: None,
                    })
                    .collect());
            }
        };

        let candidates = self
            .history
            .store()
            .nearest_messages(chat_id, &embedding, SEARCH_LIMIT)
            .await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self
            .rerank(model.as_ref(), config, chat_id, query, candidates)
            .await;

        let mut results = Vec::with_capacity(candidates.len());
        for (message, similarity) in candidates {
            results.push(ScoredMessage {
                message: self.history.present_one(message).await,
                cosine_similarity: Some(similarity),
            });
        }
        Ok(results)
    }

    async fn rerank(
        &self,
        model: &dyn LanguageModel,
        config: &OpenAiConfig,
        chat_id: Uuid,
        query: &str,
        candidates: Vec<(Message, f64)>,
    ) -> Vec<(Message, f64)> {
        let listing = json!(candidates
            .iter()
            .map(|(m, _)| json!({ "id": m.id, "text": m.text }))
            .collect::<Vec<_>>())
        .to_string();
        let prompt = config
            .re_ranking_prompt
            .replace("<original_query>", query)
            .replace("<semanticSearchResult>", &listing);

        let raw = match model
            .complete(CompletionRequest {
                model: &config.re_ranking_model,
                instructions: &config.re_ranking_instructions,
                input: &prompt,
                temperature: config.re_ranking_temperature,
            })
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(%chat_id, error = %e, "re-ranking failed, keeping similarity order");
                return candidates;
            }
        };

        let candidate_ids: Vec<String> = candidates.iter().map(|(m, _)| m.id.clone()).collect();
        match parse_ranking(&raw) {
            Some(ranked) if validate_ranking(&ranked, &candidate_ids) => apply_ranking(candidates, &ranked),
            _ => {
                tracing::warn!(%chat_id, response = %raw, "re-ranking response rejected, keeping similarity order");
                candidates
            }
        }
    }
}

/// Reads a ranking either as a JSON array or as a comma separated list.
/// `None` when a JSON array holds anything other than strings.
pub fn parse_ranking(raw: &str) -> Option<Vec<String>> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        let values: Vec<serde_json::Value> = serde_json::from_str(raw).ok()?;
        return values
            .into_iter()
            .map(|value| value.as_str().map(|s| s.trim().to_string()))
            .collect();
    }

    Some(
        raw.split(',')
            .map(|id| id.trim().trim_matches('"').to_string())
            .collect(),
    )
}

/// A ranking is usable only as an exact permutation of the candidate ids:
/// same length, no foreign ids, no duplicates.
pub fn validate_ranking(ranked: &[String], candidates: &[String]) -> bool {
    if ranked.len() != candidates.len() {
        return false;
    }
    let known: HashSet<&str> = candidates.iter().map(String::as_str).collect();
    let mut seen = HashSet::with_capacity(ranked.len());
    ranked
        .iter()
        .all(|id| known.contains(id.as_str()) && seen.insert(id.as_str()))
}

fn apply_ranking(candidates: Vec<(Message, f64)>, ranked: &[String]) -> Vec<(Message, f64)> {
    let order: HashMap<&str, usize> = ranked
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let mut candidates = candidates;
    candidates.sort_by_key(|(m, _)| order.get(m.id.as_str()).copied().unwrap_or(usize::MAX));
    candidates
}
