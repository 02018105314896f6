#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    dead_code
)]

pub mod admin;
pub mod ai;
pub mod bot;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod metrics;
pub mod outbound;
pub mod permissions;
pub mod personality;
pub mod plugins;
pub mod ratelimit;
pub mod rpc;
pub mod sandbox;
pub mod stats;
pub mod table;
pub mod trace;
pub mod transport;
pub mod wire;
