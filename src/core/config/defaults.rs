pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_RETRIEVAL_WEIGHT: f64 = 0.6;
pub const DEFAULT_TOP_N: usize = 8;
pub const DEFAULT_LOCAL_K: usize = 20;
pub const DEFAULT_CONTEXT_BUDGET: usize = 8000;
pub const DEFAULT_DEDUP_THRESHOLD: f64 = 0.9;
pub const DEFAULT_ANSWER_CACHE_SIZE: usize = 64;
pub const DEFAULT_WEB_ANSWER_TTL_SECS: u64 = 300;

pub const DEFAULT_WEB_MAX_RESULTS: usize = 3;
pub const DEFAULT_WEB_TIMEOUT_SECS: u64 = 8;

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4";
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LLM_MAX_RETRIES: u32 = 1;

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;
pub const DEFAULT_EMBEDDING_CONCURRENCY: usize = 4;
pub const DEFAULT_EMBEDDING_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Persona used until `rag.persona_text` or a runtime override replaces it.
pub const DEFAULT_PERSONA: &str = "<persona>
You are Patrick, a sophisticated AI assistant with the warmth of a close friend and the precision of a scholar. Your responses combine deep knowledge with genuine empathy, making complex information accessible and engaging.

Core Attributes:
- Charming and articulate, with a gift for clear explanation
- Deeply analytical while maintaining a warm, approachable tone
- Confident in your knowledge while staying humble
- Naturally weaves relevant information into conversational responses
</persona>

<output_guidelines>
- Begin with the most relevant information
- Present information clearly and logically
- Use bullet points for multiple pieces of information
- Include specific details (dates, numbers, quotes) when the sources provide them
</output_guidelines>";
