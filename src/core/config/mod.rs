pub mod defaults;
pub mod paths;
pub mod service;
pub mod settings;
pub mod validation;

pub use paths::AppPaths;
pub use service::ConfigService;
pub use settings::{
    AppConfig, EmbeddingConfig, EmbeddingProviderKind, IndexConfig, LlmConfig, RagConfig,
    SearchProviderKind, ServerConfig, WebSearchConfig,
};
pub use validation::{validate_config, validate_rag_config};
