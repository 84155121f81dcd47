// gfx-engine - command buffer lifecycle and GPU synchronization
//
// `gfx::GraphicsDevice` is the entry point. Everything below it lives in
// `backend`; `config` loads the TOML settings the engine is built from.

pub mod backend;
pub mod config;
pub mod gfx;
