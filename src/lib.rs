//! # bladed
//!
//! A supervision daemon for compute-blade carrier boards.
//!
//! ## Features
//!
//! - **Async Architecture**: built on Tokio, one cooperative task per
//!   subsystem sharing a root cancellation token
//! - **Event-Driven**: edge button, thermal alarms and operator intents
//!   flow through a single bounded event queue
//! - **Fan Control**: linear temperature/duty curve with an operator
//!   override
//! - **LED Patterns**: per-LED pattern engines for identify and alarm
//!   indications
//! - **Control Plane**: mutually-authenticated gRPC surface with
//!   auto-provisioned operator credentials
//! - **Metrics**: Prometheus exposition of event and state families
//!
//! ## Architecture
//!
//! The daemon wires a hardware abstraction layer ([`hal`]) into the
//! reconciliation core ([`agent`]): LED engines ([`ledengine`]) paint
//! patterns, the fan loop reconciles temperature against the curve
//! ([`fan_controller`]), and the dispatcher applies domain events
//! ([`events`]) to the blade state ([`state`]). The gRPC surface
//! ([`api`]) feeds operator intents into the same queue and bootstraps
//! client trust on first run ([`certificates`]).

pub mod agent;
pub mod api;
pub mod certificates;
pub mod cli;
pub mod config;
pub mod events;
pub mod fan_controller;
pub mod hal;
pub mod led;
pub mod ledengine;
pub mod metrics;
pub mod state;
pub mod task_manager;

/// Generated wire stubs for the control plane schema.
pub mod proto {
    #![allow(missing_docs)]
    tonic::include_proto!("bladeapi.v1alpha1");
}
