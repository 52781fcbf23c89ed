#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod files;
pub mod installer;
pub mod paths;
pub mod runner;
pub mod skypilot;
pub mod task_yaml;
pub mod vault;
