//! SolarBridge - solar inverter Modbus to MQTT bridge
//!
//! Polls a VEVOR EML3500-24L inverter, decodes its registers, keeps
//! cumulative and daily energy counters and publishes everything to MQTT
//! with Home Assistant discovery. Register writes arrive as MQTT commands.

pub mod api;
pub mod command;
pub mod config;
pub mod energy;
pub mod modbus;
pub mod mqtt;
pub mod poller;
pub mod registers;
