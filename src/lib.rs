//! Cycle-accurate model of a hierarchical PIFO traffic manager.
//!
//! A [`switch::Switch`] chains three stages over handshake links: ingress computes a rank vector
//! for each packet with one of the [`scheduler`] disciplines, the [`tree::SchedulingTree`] of
//! [`pifo`] nodes orders packets, and egress releases them, feeding virtual time back to the rank
//! computation. The [`testbench`] drives a switch with rate-shaped flows and measures what comes
//! out.

pub mod clock;
pub mod config;
pub mod egress;
pub mod error;
pub mod ingress;
pub mod metrics;
pub mod packet;
pub mod pifo;
pub mod pipe;
pub mod scheduler;
pub mod sim;
pub mod switch;
pub mod testbench;
pub mod tree;
pub mod virtual_time;

// Re-export for easier testing
pub use config::{AlgorithmConfig, SchedAlg, SwitchConfig, TreeShape};
pub use error::{ConfigError, IntegrityError, SimError};
pub use switch::{Switch, SwitchIo};
pub use testbench::{Scenario, Testbench};
