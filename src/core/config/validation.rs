use super::settings::{AppConfig, EmbeddingProviderKind, RagConfig, SearchProviderKind};
use crate::core::errors::RagError;
use crate::rag::retriever::RankDecay;

pub fn validate_config(config: &AppConfig) -> Result<(), RagError> {
    validate_rag_config(&config.rag)?;

    let web = &config.web_search;
    if web.enabled {
        validate_usize_field("web_search.max_results", web.max_results, 1, 10)?;
        validate_u64_field("web_search.timeout_secs", web.timeout_secs, 1, 600)?;
        match web.provider {
            SearchProviderKind::Google => {
                validate_required_string_field(
                    "web_search.google_api_key",
                    web.google_api_key.as_deref(),
                )?;
                validate_required_string_field(
                    "web_search.google_engine_id",
                    web.google_engine_id.as_deref(),
                )?;
            }
            SearchProviderKind::Brave => {
                validate_required_string_field(
                    "web_search.brave_api_key",
                    web.brave_api_key.as_deref(),
                )?;
            }
            SearchProviderKind::Duckduckgo => {}
        }
    }

    let llm = &config.llm;
    validate_required_string_field("llm.base_url", Some(&llm.base_url))?;
    validate_required_string_field("llm.model", Some(&llm.model))?;
    validate_u64_field("llm.timeout_secs", llm.timeout_secs, 1, 3_600)?;
    validate_u64_field("llm.max_retries", u64::from(llm.max_retries), 0, 5)?;
    if let Some(temperature) = llm.temperature {
        validate_f64_field("llm.temperature", temperature, 0.0, 2.0)?;
    }
    if let Some(max_tokens) = llm.max_tokens {
        if max_tokens < 1 {
            return Err(config_error("llm.max_tokens", "must be positive"));
        }
    }

    let embedding = &config.embedding;
    validate_usize_field("embedding.dimension", embedding.dimension, 1, 65_536)?;
    validate_usize_field("embedding.concurrency", embedding.concurrency, 1, 64)?;
    validate_u64_field("embedding.timeout_secs", embedding.timeout_secs, 1, 600)?;
    if embedding.provider == EmbeddingProviderKind::Openai {
        validate_required_string_field("embedding.model", Some(&embedding.model))?;
    }

    validate_required_string_field("server.host", Some(&config.server.host))?;

    Ok(())
}

/// Checks the options that can also be supplied per question.
pub fn validate_rag_config(rag: &RagConfig) -> Result<(), RagError> {
    validate_usize_field("rag.chunk_size", rag.chunk_size, 1, 1_000_000)?;
    if rag.chunk_overlap >= rag.chunk_size {
        return Err(config_error(
            "rag.chunk_overlap",
            &format!("must be smaller than chunk_size ({})", rag.chunk_size),
        ));
    }
    validate_f64_field("rag.retrieval_weight", rag.retrieval_weight, 0.0, 1.0)?;
    validate_usize_field("rag.top_n", rag.top_n, 1, 1_000)?;
    validate_usize_field("rag.local_k", rag.local_k, 1, 10_000)?;
    validate_usize_field("rag.context_budget", rag.context_budget, 1, 10_000_000)?;
    validate_f64_field("rag.dedup_threshold", rag.dedup_threshold, f64::EPSILON, 1.0)?;
    if let RankDecay::Exponential { factor } = rag.rank_decay {
        if !(factor > 0.0 && factor < 1.0) {
            return Err(config_error(
                "rag.rank_decay.factor",
                "must be strictly between 0 and 1",
            ));
        }
    }
    validate_required_string_field("rag.persona_text", Some(&rag.persona_text))?;
    Ok(())
}

fn validate_usize_field(path: &str, value: usize, min: usize, max: usize) -> Result<(), RagError> {
    if value < min || value > max {
        return Err(config_error(
            path,
            &format!("must be between {} and {}", min, max),
        ));
    }
    Ok(())
}

fn validate_u64_field(path: &str, value: u64, min: u64, max: u64) -> Result<(), RagError> {
    if value < min || value > max {
        return Err(config_error(
            path,
            &format!("must be between {} and {}", min, max),
        ));
    }
    Ok(())
}

fn validate_f64_field(path: &str, value: f64, min: f64, max: f64) -> Result<(), RagError> {
    if !value.is_finite() || value < min || value > max {
        return Err(config_error(
            path,
            &format!("must be between {} and {}", min, max),
        ));
    }
    Ok(())
}

fn validate_required_string_field(path: &str, value: Option<&str>) -> Result<(), RagError> {
    match value {
        Some(text) if !text.trim().is_empty() => Ok(()),
        Some(_) => Err(config_error(path, "value cannot be empty")),
        None => Err(config_error(path, "value is required")),
    }
}

fn config_error(path: &str, reason: &str) -> RagError {
    RagError::Configuration(format!("Invalid config at '{}': {}", path, reason))
}
