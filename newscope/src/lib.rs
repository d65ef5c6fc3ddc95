// Library interface for newscope modules
// This allows tests and the binary to import modules

pub mod article;
pub mod llm;
pub mod storage;
