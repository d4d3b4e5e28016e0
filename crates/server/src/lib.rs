//! VentyLab mediation server.
//!
//! Couples the physical ventilator (binary frames over MQTT) and the
//! in-process patient simulator to browser clients over WebSocket, while
//! enforcing command safety ranges, single-writer device reservations, and
//! per-user simulation loops.

pub mod auth;
pub mod config;
pub mod db;
pub mod gateway;
pub mod link;
pub mod mediator;
pub mod patient;
pub mod reservation;
pub mod simulation;
pub mod state;
pub mod web;
