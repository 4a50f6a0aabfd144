pub mod answer;
pub mod config;
pub mod documents;
pub mod health;
