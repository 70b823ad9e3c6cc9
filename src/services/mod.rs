pub mod auth;
pub mod backend;
pub mod credentials;
pub mod downloader;
pub mod gemini;
pub mod invoker;
pub mod media;
pub mod prompts;
pub mod recovery;
pub mod scheduler;
pub mod webhook;
