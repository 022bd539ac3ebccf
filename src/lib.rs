//! AudioWorker engine
//!
//! Remote peers send JSON functions (play a tone, record and detect, run a
//! VoIP loop); the controller tree executes them on audio tasks and answers
//! with correlated Acks.

pub mod audio;
pub mod config;
pub mod controller;
pub mod detector;
pub mod function;
pub mod paths;
pub mod transport;
pub mod validation;
