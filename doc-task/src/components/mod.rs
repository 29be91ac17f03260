//! Contains the building blocks a task is assembled from.
//!
//! Epochs are the timed phases of a trial, phase behaviors give each epoch
//! its meaning, and trial generators decide what every trial looks like.
//! `DocTask` owns one of each and wires them together.

pub mod epoch;
pub mod generator;
pub mod phases;
