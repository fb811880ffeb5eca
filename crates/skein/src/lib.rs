//! skein - an agent orchestration runtime.
//!
//! The runtime compiles a user's tool and capability preferences into a
//! validated execution DAG, binds that DAG to a pooled worker instance, and
//! routes conversational requests to instances through load balancing,
//! health monitoring and autoscaling.
//!
//! The model provider and persistence layers are seams: wire a
//! [`worker::WorkerRuntime`] and a [`storage::ConfigStore`] and the rest of
//! the machinery is self-contained.

pub mod balance;
pub mod config;
pub mod dag;
pub mod error;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod pool;
pub mod scale;
pub mod storage;
pub mod tools;
pub mod worker;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use orchestrator::{AgentDescriptor, ExecuteRequest, ExecuteResponse, Orchestrator};
