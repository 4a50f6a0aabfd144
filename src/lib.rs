pub mod core;
pub mod llm;
pub mod rag;
pub mod search;
pub mod server;
pub mod state;
