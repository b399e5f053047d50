// lib.rs — the orchestrator as a library so integration tests in tests/ can
// drive whole runs against a temp directory and a RecordingRunner.
//
// main.rs is a thin CLI over `controller::Orchestrator`.

pub mod console;
pub mod continuation;
pub mod controller;
pub mod environment;
pub mod error;
pub mod exec;
pub mod installer;
pub mod logging;
pub mod os_release;
pub mod packages;
pub mod reboot;
pub mod report;
pub mod runtime;
pub mod services;
pub mod steps;
pub mod template;
