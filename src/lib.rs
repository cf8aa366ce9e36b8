pub mod config;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod tests;
