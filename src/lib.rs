//! pty-relay library
//!
//! Runs an interactive shell on a freshly allocated pseudoterminal and relays
//! bytes between the invoking terminal and the PTY master.
//!
//! - `pty`: PTY allocation, child setup, window size helpers
//! - `relay`: raw-mode guard and the two-descriptor relay loop
//! - `config`: configuration file, environment and CLI layering
//! - `app`: wires the pieces together and decides the exit status

pub mod app;
pub mod config;
pub mod pty;
pub mod relay;
