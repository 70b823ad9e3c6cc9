//! Media Insight Jobs
//!
//! Asynchronous analysis of uploaded or linked audio and video. Jobs are
//! persisted in SQLite, driven one at a time through the Gemini API by a
//! single scheduler, coerced into a validated structured result, and reported
//! back through polling or webhooks.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
