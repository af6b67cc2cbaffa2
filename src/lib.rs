//! Asynchronous object-detection pipeline.
//!
//! Submitted jobs move through three queued stages: fetch the input from
//! object storage with resumable transfers, run detection (per-box counts
//! for images, unique tracked objects for video), then publish the
//! annotated artifact and clean up. A job with no detections stops after
//! cleanup without publishing. Job status lives in a store that every
//! stage updates with compare-and-set.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
