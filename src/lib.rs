//! Hardware performance counter event controller.
//!
//! Keeps an external sampling sensor collecting the event mix requested by
//! control commands, within the counter budget of the processor.

pub mod catalog;
pub mod config;
pub mod control;
pub mod controller;
pub mod export;
pub mod selection;
pub mod sensor;
