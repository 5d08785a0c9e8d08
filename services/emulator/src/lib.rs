// Emulator service: configuration and observability for the QUIC-served emulator.
pub mod config;
pub mod observability;
