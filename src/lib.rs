pub mod config;
pub mod controller;
pub mod homing;
pub mod inputs;
pub mod messages;
pub mod motion;
pub mod protocol;
pub mod runtime;
pub mod teleop;
pub mod watchdog;
